use cudarc::{
    driver::{CudaContext, CudaFunction, CudaModule, CudaSlice, CudaStream, LaunchConfig, PushKernelArg},
    nvrtc::{CompileOptions, Ptx},
};
use error::{CudaError, WrapErr};
use std::{
    borrow::Cow,
    collections::HashMap,
    fmt, fs,
    path::{Path, PathBuf},
    sync::{Arc, RwLock},
};
use tracing::{debug, trace};

use crate::{
    cpu_storage::CpuStorage,
    storage::{BackendDevice, BackendStorage, EdgeGrads, TensorProductProblem},
    DType, Error, Result,
};

pub(crate) mod error;

#[derive(Clone)]
pub struct CudaDevice {
    ordinal: usize,
    context: Arc<CudaContext>,
    stream: Arc<CudaStream>,
    modules: Arc<RwLock<HashMap<String, Arc<CudaModule>>>>,
}

impl fmt::Debug for CudaDevice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "CudaDevice({})", self.ordinal)
    }
}

impl CudaDevice {
    pub(crate) fn new(ordinal: usize) -> Result<Self> {
        let context = CudaContext::new(ordinal).w()?;
        let stream = context.new_stream().w()?;
        debug!(ordinal, "opened CUDA device");
        Ok(Self {
            ordinal,
            context,
            stream,
            modules: Arc::new(RwLock::new(HashMap::new())),
        })
    }

    pub fn ordinal(&self) -> usize {
        self.ordinal
    }

    pub(crate) fn stream(&self) -> Arc<CudaStream> {
        self.stream.clone()
    }

    /// Load the tensor-product module for `T`, compiling it on first use.
    fn load_func<T: DType>(&self, function_name: &str) -> Result<CudaFunction> {
        let module_name = format!("maceops_tp_{}", T::NAME);
        {
            let modules = self
                .modules
                .read()
                .map_err(|_| Error::device("CUDA module cache lock poisoned"))?;
            if let Some(module) = modules.get(&module_name) {
                return module.load_function(function_name).w();
            }
        }

        let ptx = compile_ptx(&module_name, tensor_product_source::<T>(), T::C_DEP.is_some())?;
        if let Some(home) = dirs::home_dir() {
            let path = format!("{}/.cache/maceops/ptx/{module_name}.ptx", home.display());
            let path = Path::new(&path);
            if let Some(parent) = path.parent() {
                fs::create_dir_all(parent)?;
            }
            fs::write(path, ptx.to_src())?;
        }
        let module = self
            .context
            .load_module(ptx)
            .map_err(|cuda| CudaError::Load {
                cuda,
                module_name: module_name.clone(),
            })?;
        let func = module.load_function(function_name).w()?;
        self.modules
            .write()
            .map_err(|_| Error::device("CUDA module cache lock poisoned"))?
            .insert(module_name, module);
        Ok(func)
    }

    fn upload_index(&self, index: &[u32]) -> Result<CudaSlice<u32>> {
        // A zero-length upload still needs a valid handle for the kernel argument.
        if index.is_empty() {
            return self.stream.alloc_zeros::<u32>(1).w();
        }
        self.stream.memcpy_stod(index).w()
    }

    fn zeros<T: DType>(&self, len: usize) -> Result<CudaSlice<T>> {
        self.stream.alloc_zeros::<T>(len.max(1)).w()
    }

    fn wrap<T: DType>(&self, slice: CudaSlice<T>, len: usize) -> CudaStorage<T> {
        CudaStorage {
            slice,
            len,
            device: self.clone(),
        }
    }
}

pub struct CudaStorage<T: DType> {
    slice: CudaSlice<T>,
    len: usize,
    device: CudaDevice,
}

impl<T: DType> CudaStorage<T> {
    pub(crate) fn device(&self) -> &CudaDevice {
        &self.device
    }
}

impl<T: DType> BackendStorage<T> for CudaStorage<T> {
    fn to_cpu_storage(&self) -> Result<Cow<'_, CpuStorage<T>>> {
        let mut data = self.device.stream().memcpy_dtov(&self.slice).w()?;
        data.truncate(self.len);
        Ok(Cow::Owned(CpuStorage(data)))
    }
}

fn cuda_include_dir() -> Option<PathBuf> {
    let env_vars = ["CUDA_PATH", "CUDA_ROOT", "CUDA_TOOLKIT_ROOT_DIR"]
        .into_iter()
        .filter_map(|v| std::env::var(v).ok())
        .map(PathBuf::from);
    let roots = ["/usr", "/usr/local/cuda", "/opt/cuda", "/usr/lib/cuda"]
        .into_iter()
        .map(PathBuf::from);
    env_vars
        .chain(roots)
        .find(|path| path.join("include").join("cuda.h").is_file())
}

fn compile_ptx(module_name: &str, source: String, needs_headers: bool) -> Result<Ptx> {
    let include_paths = if needs_headers {
        let root = cuda_include_dir().ok_or(CudaError::MissingToolkit)?;
        vec![root.join("include").display().to_string()]
    } else {
        Vec::new()
    };
    debug!(module_name, "compiling CUDA module");
    cudarc::nvrtc::compile_ptx_with_opts(
        source,
        CompileOptions {
            include_paths,
            ..Default::default()
        },
    )
    .map_err(|err| {
        CudaError::PtxCompileError {
            kernel: module_name.to_string(),
            err,
        }
        .into()
    })
}

/// Kernels for one element type. Every output element is produced by exactly
/// one thread; accumulation happens in the accumulator type of `T`.
fn tensor_product_source<T: DType>() -> String {
    let name = T::NAME;
    format!(
        r#"
        {dep}
        typedef unsigned int uint32_t;
        typedef {t} T;
        typedef {acc} ACC;

        #define GRID_STRIDE(idx, total) \
            for (size_t idx = blockIdx.x * blockDim.x + threadIdx.x; idx < (total); \
                 idx += (size_t)blockDim.x * gridDim.x)

        extern "C" __global__ void gather_rows_{name}(
            const T *src, const uint32_t *index, T *out, const size_t nrows, const size_t row_len) {{
            GRID_STRIDE(idx, nrows * row_len) {{
                const size_t row = idx / row_len;
                out[idx] = src[(size_t)index[row] * row_len + idx % row_len];
            }}
        }}

        extern "C" __global__ void tp_forward_{name}(
            const T *x, const T *y, const T *r,
            const uint32_t *row_offsets, const uint32_t *lm_to_degree, T *out,
            const size_t nnodes, const size_t num_lm, const size_t num_degrees, const size_t channels) {{
            GRID_STRIDE(idx, nnodes * num_lm * channels) {{
                const size_t c = idx % channels;
                const size_t m = (idx / channels) % num_lm;
                const size_t n = idx / (channels * num_lm);
                const size_t l = lm_to_degree[m];
                ACC acc = 0;
                for (size_t e = row_offsets[n]; e < row_offsets[n + 1]; ++e) {{
                    acc += static_cast<ACC>(x[e * channels + c])
                         * static_cast<ACC>(y[e * num_lm + m])
                         * static_cast<ACC>(r[(e * num_degrees + l) * channels + c]);
                }}
                out[idx] = static_cast<T>(acc);
            }}
        }}

        extern "C" __global__ void tp_backward_feature_{name}(
            const T *y, const T *r, const T *g, const uint32_t *receiver, const uint32_t *lm_to_degree,
            T *gx, const size_t nedges, const size_t num_lm, const size_t num_degrees, const size_t channels) {{
            GRID_STRIDE(idx, nedges * channels) {{
                const size_t c = idx % channels;
                const size_t e = idx / channels;
                const size_t n = receiver[e];
                ACC acc = 0;
                for (size_t m = 0; m < num_lm; ++m) {{
                    const size_t l = lm_to_degree[m];
                    acc += static_cast<ACC>(g[(n * num_lm + m) * channels + c])
                         * static_cast<ACC>(y[e * num_lm + m])
                         * static_cast<ACC>(r[(e * num_degrees + l) * channels + c]);
                }}
                gx[idx] = static_cast<T>(acc);
            }}
        }}

        extern "C" __global__ void tp_backward_harmonic_{name}(
            const T *x, const T *r, const T *g, const uint32_t *receiver, const uint32_t *lm_to_degree,
            T *gy, const size_t nedges, const size_t num_lm, const size_t num_degrees, const size_t channels) {{
            GRID_STRIDE(idx, nedges * num_lm) {{
                const size_t m = idx % num_lm;
                const size_t e = idx / num_lm;
                const size_t n = receiver[e];
                const size_t l = lm_to_degree[m];
                ACC acc = 0;
                for (size_t c = 0; c < channels; ++c) {{
                    acc += static_cast<ACC>(g[(n * num_lm + m) * channels + c])
                         * static_cast<ACC>(x[e * channels + c])
                         * static_cast<ACC>(r[(e * num_degrees + l) * channels + c]);
                }}
                gy[idx] = static_cast<T>(acc);
            }}
        }}

        extern "C" __global__ void tp_backward_radial_{name}(
            const T *x, const T *y, const T *g, const uint32_t *receiver,
            T *gr, const size_t nedges, const size_t num_lm, const size_t num_degrees, const size_t channels) {{
            GRID_STRIDE(idx, nedges * num_degrees * channels) {{
                const size_t c = idx % channels;
                const size_t l = (idx / channels) % num_degrees;
                const size_t e = idx / (channels * num_degrees);
                const size_t n = receiver[e];
                ACC acc = 0;
                for (size_t m = l * l; m < (l + 1) * (l + 1) && m < num_lm; ++m) {{
                    acc += static_cast<ACC>(g[(n * num_lm + m) * channels + c])
                         * static_cast<ACC>(x[e * channels + c])
                         * static_cast<ACC>(y[e * num_lm + m]);
                }}
                gr[idx] = static_cast<T>(acc);
            }}
        }}
        "#,
        dep = T::C_DEP.unwrap_or(""),
        t = T::C_NAME,
        acc = T::ACC_C_NAME,
    )
}

fn launch_config(total: usize) -> Result<LaunchConfig> {
    let total = u32::try_from(total)
        .map_err(|_| Error::device(format!("launch of {total} threads exceeds the grid limit")))?;
    Ok(LaunchConfig::for_num_elems(total))
}

impl BackendDevice for CudaDevice {
    type Storage<X: DType> = CudaStorage<X>;

    fn storage_from_vec<T: DType>(&self, data: Vec<T>) -> Result<Self::Storage<T>> {
        let len = data.len();
        let slice = if data.is_empty() {
            self.zeros::<T>(0)?
        } else {
            self.stream.memcpy_stod(&data).w()?
        };
        Ok(self.wrap(slice, len))
    }

    fn gather_rows<T: DType>(
        &self,
        src: &Self::Storage<T>,
        index: &[u32],
        row_len: usize,
    ) -> Result<Self::Storage<T>> {
        let total = index.len() * row_len;
        let out = self.zeros::<T>(total)?;
        if total > 0 {
            let func = self.load_func::<T>(&format!("gather_rows_{}", T::NAME))?;
            let nrows = index.len();
            let index = self.upload_index(index)?;
            let mut builder = self.stream.launch_builder(&func);
            builder.arg(&src.slice);
            builder.arg(&index);
            builder.arg(&out);
            builder.arg(&nrows);
            builder.arg(&row_len);
            unsafe { builder.launch(launch_config(total)?).w()? };
        }
        Ok(self.wrap(out, total))
    }

    fn tensor_product_forward<T: DType>(
        &self,
        p: &TensorProductProblem<'_>,
        feature: &Self::Storage<T>,
        harmonic: &Self::Storage<T>,
        radial: &Self::Storage<T>,
    ) -> Result<Self::Storage<T>> {
        let total = p.nnodes * p.num_lm * p.channels;
        trace!(ordinal = self.ordinal, total, "tensor product forward launch");
        let out = self.zeros::<T>(total)?;
        if total > 0 {
            let func = self.load_func::<T>(&format!("tp_forward_{}", T::NAME))?;
            let row_offsets = self.upload_index(p.row_offsets)?;
            let lm_to_degree = self.upload_index(p.lm_to_degree)?;
            let mut builder = self.stream.launch_builder(&func);
            builder.arg(&feature.slice);
            builder.arg(&harmonic.slice);
            builder.arg(&radial.slice);
            builder.arg(&row_offsets);
            builder.arg(&lm_to_degree);
            builder.arg(&out);
            builder.arg(&p.nnodes);
            builder.arg(&p.num_lm);
            builder.arg(&p.num_degrees);
            builder.arg(&p.channels);
            unsafe { builder.launch(launch_config(total)?).w()? };
        }
        Ok(self.wrap(out, total))
    }

    fn tensor_product_backward<T: DType>(
        &self,
        p: &TensorProductProblem<'_>,
        feature: &Self::Storage<T>,
        harmonic: &Self::Storage<T>,
        radial: &Self::Storage<T>,
        grad_output: &Self::Storage<T>,
    ) -> Result<EdgeGrads<Self::Storage<T>>> {
        let n_feature = p.nedges * p.channels;
        let n_harmonic = p.nedges * p.num_lm;
        let n_radial = p.nedges * p.num_degrees * p.channels;
        trace!(ordinal = self.ordinal, nedges = p.nedges, "tensor product backward launch");

        let gx = self.zeros::<T>(n_feature)?;
        let gy = self.zeros::<T>(n_harmonic)?;
        let gr = self.zeros::<T>(n_radial)?;
        if n_feature > 0 {
            let receiver = self.upload_index(p.receiver)?;
            let lm_to_degree = self.upload_index(p.lm_to_degree)?;

            let func = self.load_func::<T>(&format!("tp_backward_feature_{}", T::NAME))?;
            let mut builder = self.stream.launch_builder(&func);
            builder.arg(&harmonic.slice);
            builder.arg(&radial.slice);
            builder.arg(&grad_output.slice);
            builder.arg(&receiver);
            builder.arg(&lm_to_degree);
            builder.arg(&gx);
            builder.arg(&p.nedges);
            builder.arg(&p.num_lm);
            builder.arg(&p.num_degrees);
            builder.arg(&p.channels);
            unsafe { builder.launch(launch_config(n_feature)?).w()? };

            let func = self.load_func::<T>(&format!("tp_backward_harmonic_{}", T::NAME))?;
            let mut builder = self.stream.launch_builder(&func);
            builder.arg(&feature.slice);
            builder.arg(&radial.slice);
            builder.arg(&grad_output.slice);
            builder.arg(&receiver);
            builder.arg(&lm_to_degree);
            builder.arg(&gy);
            builder.arg(&p.nedges);
            builder.arg(&p.num_lm);
            builder.arg(&p.num_degrees);
            builder.arg(&p.channels);
            unsafe { builder.launch(launch_config(n_harmonic)?).w()? };

            let func = self.load_func::<T>(&format!("tp_backward_radial_{}", T::NAME))?;
            let mut builder = self.stream.launch_builder(&func);
            builder.arg(&feature.slice);
            builder.arg(&harmonic.slice);
            builder.arg(&grad_output.slice);
            builder.arg(&receiver);
            builder.arg(&gr);
            builder.arg(&p.nedges);
            builder.arg(&p.num_lm);
            builder.arg(&p.num_degrees);
            builder.arg(&p.channels);
            unsafe { builder.launch(launch_config(n_radial)?).w()? };
        }

        Ok(EdgeGrads {
            feature: self.wrap(gx, n_feature),
            harmonic: self.wrap(gy, n_harmonic),
            radial: self.wrap(gr, n_radial),
        })
    }
}

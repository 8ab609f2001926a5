//! maceops provides fused kernels for the message-passing layers of
//! equivariant atomistic graph networks.
//!
//! The centre piece is the invariant tensor-product message passing: for every
//! node, the sum over its incoming edges of an edge feature, the edge's
//! spherical harmonics and a per-degree radial weight. It is evaluated as a
//! segmented reduction over a receiver-sorted graph, with exact gradients.
//! Around it sit the layers consuming the same degree-indexed feature layout:
//! block-diagonal [`Linear`] and [`ElementalLinear`] layers, the
//! [`SymmetricContraction`], and a [`CubicSpline`] for radial functions.
//!
//! Tensors are dense, row-major and bound to a [`Device`]. The CPU backend
//! runs everything with rayon; the optional CUDA backend (feature `cuda`)
//! runs the tensor-product kernels.
//!
//! ## A quick guide
//! - Build a [`Graph`] from sender/receiver arrays sorted by receiver.
//! - Pick a [`DegreeLayout`] for `lmax` and create the layers.
//! - Call `forward` / `backward`; every call validates shapes first.
//!
//! ```
//! use maceops_core::{DegreeLayout, Device, Graph, InvariantMessagePassing, Tensor};
//!
//! let graph = Graph::from_edges(3, &[(0, 1), (1, 1), (2, 2)]).unwrap();
//! let tp = InvariantMessagePassing::new(DegreeLayout::new(0), 1).unwrap();
//!
//! let x = Tensor::<f32>::from_vec(vec![2.0, 3.0, 5.0], (3, 1), &Device::Cpu).unwrap();
//! let y = Tensor::<f32>::ones((3, 1), &Device::Cpu).unwrap();
//! let r = Tensor::<f32>::ones((3, 1, 1), &Device::Cpu).unwrap();
//!
//! let out = tp.forward(&x, &y, &r, &graph).unwrap();
//! assert_eq!(out.dims(), &[3, 1, 1]);
//! assert_eq!(out.to_vec().unwrap(), vec![0.0, 5.0, 5.0]);
//! ```

mod config;
mod cpu_storage;
#[cfg(feature = "cuda")]
mod cuda_backend;
mod device;
mod dtype;
mod error;
mod graph;
mod interaction;
mod irreps;
mod linear;
mod message_passing;
mod neighbours;
mod reduce;
mod shape;
mod spline;
mod storage;
mod symmetric_contraction;
mod tensor;

pub use config::{KernelConfig, DEFAULT_BUCKET_CAPACITY, DEFAULT_MIN_ROWS_PER_TASK};
pub use device::Device;
pub use dtype::{Accumulator, DType};
pub use error::{Error, Result};
pub use graph::Graph;
pub use interaction::{InvariantInteraction, InvariantResidualInteraction};
pub use irreps::DegreeLayout;
pub use linear::{ElementalLinear, Linear, LinearInstruction};
pub use message_passing::{EdgeGradients, InvariantMessagePassing, NodeGradients};
pub use neighbours::{NeighbourIndex, PAD};
pub use shape::Shape;
pub use spline::CubicSpline;
pub use symmetric_contraction::{
    ContractionWeights, CouplingEntry, CouplingTensor, SymmetricContraction, MAX_CORRELATION,
};
pub use tensor::Tensor;

use std::fmt::Display;

#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// Sender/receiver arrays violate the graph preconditions (unsorted
    /// receiver, index out of range).
    #[error("invalid graph: {0}")]
    InvalidGraph(String),

    #[error("shape mismatch in {op}: {msg}")]
    ShapeMismatch { op: &'static str, msg: String },

    #[error("spline query {x} is outside the fitted domain [{lo}, {hi}]")]
    OutOfDomain { x: f64, lo: f64, hi: f64 },

    #[error("unsupported configuration: {0}")]
    UnsupportedConfiguration(String),

    /// Accelerator failures: allocation, compilation, launch, device mismatch.
    #[error("device error: {0}")]
    Device(Box<dyn std::error::Error + Send + Sync>),

    #[error("{inner}\n{backtrace}")]
    WithBacktrace {
        inner: Box<Self>,
        backtrace: Box<std::backtrace::Backtrace>,
    },

    /// Arbitrary errors wrapping.
    #[error(transparent)]
    Wrapped(Box<dyn std::error::Error + Send + Sync>),
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    pub fn wrap(err: impl std::error::Error + Send + Sync + 'static) -> Self {
        Self::Wrapped(Box::new(err)).bt()
    }

    pub fn invalid_graph<M: Display>(msg: M) -> Self {
        Self::InvalidGraph(msg.to_string()).bt()
    }

    pub fn unsupported<M: Display>(msg: M) -> Self {
        Self::UnsupportedConfiguration(msg.to_string()).bt()
    }

    pub fn shape_mismatch(op: &'static str, expected: &[usize], got: &[usize]) -> Self {
        Self::ShapeMismatch {
            op,
            msg: format!("expected {expected:?}, got {got:?}"),
        }
        .bt()
    }

    pub fn rank_mismatch(op: &'static str, rank: usize, got: &[usize]) -> Self {
        Self::ShapeMismatch {
            op,
            msg: format!("expected a rank-{rank} tensor, got {got:?}"),
        }
        .bt()
    }

    pub fn device<M: Display>(msg: M) -> Self {
        Self::Device(msg.to_string().into()).bt()
    }

    /// Strip the backtrace wrapper, if any.
    pub fn inner(&self) -> &Self {
        match self {
            Self::WithBacktrace { inner, .. } => inner.inner(),
            other => other,
        }
    }

    pub fn bt(self) -> Self {
        let backtrace = std::backtrace::Backtrace::capture();
        match backtrace.status() {
            std::backtrace::BacktraceStatus::Disabled
            | std::backtrace::BacktraceStatus::Unsupported => self,
            _ => Self::WithBacktrace {
                inner: Box::new(self),
                backtrace: Box::new(backtrace),
            },
        }
    }
}

impl From<std::io::Error> for Error {
    fn from(value: std::io::Error) -> Self {
        Error::Wrapped(Box::new(value))
    }
}

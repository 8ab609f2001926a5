use crate::{Error, Result};

/// Runtime extents of a dense row-major tensor.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct Shape(Vec<usize>);

impl Shape {
    pub fn dims(&self) -> &[usize] {
        &self.0
    }

    pub fn rank(&self) -> usize {
        self.0.len()
    }

    pub fn elem_count(&self) -> usize {
        self.0.iter().product()
    }
}

macro_rules! dims_n {
    ($fn_name:ident, $n:expr, $out:ty, ($($idx:tt),*)) => {
        impl Shape {
            /// Destructure a rank-checked shape, reporting `op` on mismatch.
            pub fn $fn_name(&self, op: &'static str) -> Result<$out> {
                if self.0.len() != $n {
                    return Err(Error::rank_mismatch(op, $n, &self.0));
                }
                Ok(($(self.0[$idx]),*))
            }
        }
    };
}

dims_n!(dims1, 1, usize, (0));
dims_n!(dims2, 2, (usize, usize), (0, 1));
dims_n!(dims3, 3, (usize, usize, usize), (0, 1, 2));

impl From<Vec<usize>> for Shape {
    fn from(dims: Vec<usize>) -> Self {
        Self(dims)
    }
}

impl From<&[usize]> for Shape {
    fn from(dims: &[usize]) -> Self {
        Self(dims.to_vec())
    }
}

impl<const N: usize> From<[usize; N]> for Shape {
    fn from(dims: [usize; N]) -> Self {
        Self(dims.to_vec())
    }
}

impl From<usize> for Shape {
    fn from(d: usize) -> Self {
        Self(vec![d])
    }
}

macro_rules! shape_from_tuple {
    (($($C:ident),*), ($($N:tt),*)) => {
        impl From<($($C,)*)> for Shape {
            fn from(dims: ($($C,)*)) -> Self {
                Self(vec![$(dims.$N,)*])
            }
        }
    };
}

shape_from_tuple!((usize), (0));
shape_from_tuple!((usize, usize), (0, 1));
shape_from_tuple!((usize, usize, usize), (0, 1, 2));
shape_from_tuple!((usize, usize, usize, usize), (0, 1, 2, 3));

use std::ops::Range;

/// Degree-indexed component layout up to `lmax`.
///
/// Components are ordered by degree, so degree `L` owns components
/// `L^2 .. (L+1)^2` and there are `(lmax + 1)^2` of them in total.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DegreeLayout {
    lmax: usize,
    lm_to_degree: Vec<u32>,
}

impl DegreeLayout {
    pub fn new(lmax: usize) -> Self {
        let lm_to_degree = (0..=lmax)
            .flat_map(|l| std::iter::repeat_n(l as u32, 2 * l + 1))
            .collect();
        Self { lmax, lm_to_degree }
    }

    pub fn lmax(&self) -> usize {
        self.lmax
    }

    pub fn num_degrees(&self) -> usize {
        self.lmax + 1
    }

    /// `(lmax + 1)^2`
    pub fn num_components(&self) -> usize {
        self.lm_to_degree.len()
    }

    pub fn lm_to_degree(&self) -> &[u32] {
        &self.lm_to_degree
    }

    pub fn degree_of(&self, lm: usize) -> usize {
        self.lm_to_degree[lm] as usize
    }

    pub fn degree_range(&self, l: usize) -> Range<usize> {
        l * l..(l + 1) * (l + 1)
    }
}

#[cfg(test)]
mod tests {
    use super::DegreeLayout;

    #[test]
    fn lmax_three_has_sixteen_components() {
        let layout = DegreeLayout::new(3);
        assert_eq!(layout.num_components(), 16);
        assert_eq!(
            layout.lm_to_degree(),
            &[0, 1, 1, 1, 2, 2, 2, 2, 2, 3, 3, 3, 3, 3, 3, 3]
        );
        assert_eq!(layout.degree_range(2), 4..9);
    }
}

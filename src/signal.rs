use crate::axis::SignalAxis;
use crate::error::ModelError;

use itertools::Itertools;
use ndarray::{ArrayD, ArrayView1, ArrayView2, ArrayViewMut1, Axis, Ix1, IxDyn};

/// Multidimensional dataset: navigation axes (outer) over one signal axis (last).
///
/// Each navigation position holds one independent signal to be fit. The struct
/// tracks the current navigation position used by the model's per-pixel
/// operations.
#[derive(Clone, Debug)]
pub struct Signal {
    data: ArrayD<f64>,
    pub axis: SignalAxis,
    nav_index: Vec<usize>,
}

impl Signal {
    pub fn new(data: ArrayD<f64>, axis: SignalAxis) -> Result<Self, ModelError> {
        let sig_len = data.shape().last().copied().unwrap_or(0);
        if sig_len != axis.len() {
            return Err(ModelError::ShapeMismatch {
                expected: vec![axis.len()],
                actual: vec![sig_len],
            });
        }
        let nav_index = vec![0; data.ndim() - 1];
        Ok(Self {
            data,
            axis,
            nav_index,
        })
    }

    /// Single spectrum with a default uniform axis (`offset = 0`, `scale = 1`).
    pub fn from_1d(data: ndarray::Array1<f64>) -> Self {
        let axis = SignalAxis::uniform(data.len(), 0.0, 1.0);
        Self {
            data: data.into_dyn(),
            axis,
            nav_index: Vec::new(),
        }
    }

    pub fn data(&self) -> &ArrayD<f64> {
        &self.data
    }

    pub fn data_mut(&mut self) -> &mut ArrayD<f64> {
        &mut self.data
    }

    pub fn signal_len(&self) -> usize {
        self.axis.len()
    }

    /// Shape of the navigation axes; empty for a single signal.
    pub fn nav_shape(&self) -> &[usize] {
        &self.data.shape()[..self.data.ndim() - 1]
    }

    /// Number of navigation pixels (1 for a single signal).
    pub fn nav_len(&self) -> usize {
        self.nav_shape().iter().product()
    }

    pub fn nav_index(&self) -> &[usize] {
        &self.nav_index
    }

    pub fn set_nav_index(&mut self, index: &[usize]) -> Result<(), ModelError> {
        let nav_shape = self.nav_shape();
        if index.len() != nav_shape.len() || index.iter().zip(nav_shape).any(|(&i, &n)| i >= n) {
            return Err(ModelError::ShapeMismatch {
                expected: nav_shape.to_vec(),
                actual: index.to_vec(),
            });
        }
        self.nav_index = index.to_vec();
        Ok(())
    }

    /// Row-major iteration order over all navigation positions.
    pub fn nav_indices(&self) -> impl Iterator<Item = Vec<usize>> + use<> {
        let nav_shape = self.nav_shape().to_vec();
        if nav_shape.is_empty() {
            itertools::Either::Left(std::iter::once(Vec::new()))
        } else {
            itertools::Either::Right(
                nav_shape
                    .into_iter()
                    .map(|n| 0..n)
                    .multi_cartesian_product(),
            )
        }
    }

    /// Raw data slice at the current navigation position.
    pub fn current_data(&self) -> ArrayView1<'_, f64> {
        self.view_at(&self.nav_index)
    }

    /// Raw data slice at an arbitrary navigation position.
    pub fn view_at(&self, nav_index: &[usize]) -> ArrayView1<'_, f64> {
        let mut view = self.data.view();
        for &i in nav_index {
            view = view.index_axis_move(Axis(0), i);
        }
        // One axis left once all navigation axes are peeled off.
        view.into_dimensionality::<Ix1>().unwrap()
    }

    pub fn view_at_mut(&mut self, nav_index: &[usize]) -> ArrayViewMut1<'_, f64> {
        let mut view = self.data.view_mut();
        for &i in nav_index {
            view = view.index_axis_move(Axis(0), i);
        }
        view.into_dimensionality::<Ix1>().unwrap()
    }

    /// Flat `(nav_len, signal_len)` view for batched estimator operations.
    pub fn unfolded(&self) -> ArrayView2<'_, f64> {
        let (nav_len, sig_len) = (self.nav_len(), self.signal_len());
        self.data
            .view()
            .into_shape_with_order(IxDyn(&[nav_len, sig_len]))
            .unwrap()
            .into_dimensionality()
            .unwrap()
    }

    /// Navigation position corresponding to a flat row-major pixel number.
    pub fn nav_index_from_flat(&self, mut flat: usize) -> Vec<usize> {
        let nav_shape = self.nav_shape();
        let mut index = vec![0; nav_shape.len()];
        for (i, &n) in nav_shape.iter().enumerate().rev() {
            index[i] = flat % n;
            flat /= n;
        }
        index
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use ndarray::{Array1, Array3};

    fn grid_signal() -> Signal {
        // 2x2 navigation grid, 5-channel signal, values 0..20
        let data = Array3::from_shape_vec((2, 2, 5), (0..20).map(f64::from).collect()).unwrap();
        Signal::new(data.into_dyn(), SignalAxis::uniform(5, 0.0, 1.0)).unwrap()
    }

    #[test]
    fn nav_split() {
        let s = grid_signal();
        assert_eq!(s.nav_shape(), &[2, 2]);
        assert_eq!(s.nav_len(), 4);
        assert_eq!(s.signal_len(), 5);
    }

    #[test]
    fn current_data_follows_position() {
        let mut s = grid_signal();
        assert_eq!(s.current_data().to_vec(), vec![0.0, 1.0, 2.0, 3.0, 4.0]);
        s.set_nav_index(&[1, 0]).unwrap();
        assert_eq!(
            s.current_data().to_vec(),
            vec![10.0, 11.0, 12.0, 13.0, 14.0]
        );
    }

    #[test]
    fn set_nav_index_out_of_bounds() {
        let mut s = grid_signal();
        assert!(s.set_nav_index(&[2, 0]).is_err());
        assert!(s.set_nav_index(&[0]).is_err());
    }

    #[test]
    fn nav_indices_row_major() {
        let s = grid_signal();
        let indices: Vec<_> = s.nav_indices().collect();
        assert_eq!(
            indices,
            vec![vec![0, 0], vec![0, 1], vec![1, 0], vec![1, 1]]
        );
    }

    #[test]
    fn nav_indices_single_signal() {
        let s = Signal::from_1d(Array1::zeros(3));
        let indices: Vec<_> = s.nav_indices().collect();
        assert_eq!(indices, vec![Vec::<usize>::new()]);
        assert_eq!(s.nav_len(), 1);
    }

    #[test]
    fn unfolded_rows_match_pixels() {
        let s = grid_signal();
        let flat = s.unfolded();
        assert_eq!(flat.shape(), &[4, 5]);
        assert_eq!(flat.row(2).to_vec(), s.view_at(&[1, 0]).to_vec());
        assert_eq!(s.nav_index_from_flat(2), vec![1, 0]);
    }

    #[test]
    fn axis_size_checked() {
        let data = Array1::zeros(4).into_dyn();
        assert!(Signal::new(data, SignalAxis::uniform(5, 0.0, 1.0)).is_err());
    }
}

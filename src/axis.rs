use crate::error::ModelError;

use ndarray::Array1;
use serde::{Deserialize, Serialize};

/// Signal-axis position mapping between array indices and physical coordinates.
///
/// A uniform axis is fully described by `offset` and `scale`; a non-uniform
/// axis carries an explicit coordinate array instead. `scale` may be negative,
/// in which case physical coordinates decrease with the array index.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SignalAxis {
    offset: f64,
    scale: f64,
    is_uniform: bool,
    pub is_binned: bool,
    coords: Array1<f64>,
}

impl SignalAxis {
    /// Uniform axis of `size` channels with coordinates `offset + scale * i`.
    pub fn uniform(size: usize, offset: f64, scale: f64) -> Self {
        Self {
            offset,
            scale,
            is_uniform: true,
            is_binned: false,
            coords: Array1::from_iter((0..size).map(|i| offset + scale * i as f64)),
        }
    }

    /// Non-uniform axis with explicit channel coordinates.
    ///
    /// Coordinates must be strictly monotonic (either direction).
    pub fn from_coords(coords: Array1<f64>) -> Self {
        let offset = coords.first().copied().unwrap_or(0.0);
        Self {
            offset,
            scale: f64::NAN,
            is_uniform: false,
            is_binned: false,
            coords,
        }
    }

    pub fn len(&self) -> usize {
        self.coords.len()
    }

    pub fn is_empty(&self) -> bool {
        self.coords.is_empty()
    }

    pub fn is_uniform(&self) -> bool {
        self.is_uniform
    }

    pub fn offset(&self) -> f64 {
        self.offset
    }

    /// Channel width of a uniform axis. NaN after [`Self::convert_to_non_uniform`].
    pub fn scale(&self) -> f64 {
        self.scale
    }

    pub fn set_offset(&mut self, offset: f64) {
        self.offset = offset;
        self.rebuild_coords();
    }

    pub fn set_scale(&mut self, scale: f64) {
        self.scale = scale;
        self.rebuild_coords();
    }

    fn rebuild_coords(&mut self) {
        assert!(self.is_uniform, "cannot rescale a non-uniform axis");
        let (offset, scale) = (self.offset, self.scale);
        self.coords = Array1::from_iter((0..self.coords.len()).map(|i| offset + scale * i as f64));
    }

    /// Freezes the current coordinates, dropping offset/scale semantics.
    ///
    /// Irreversible: the axis keeps its coordinate values but loses the
    /// constant-step description.
    pub fn convert_to_non_uniform(&mut self) {
        self.is_uniform = false;
        self.scale = f64::NAN;
    }

    /// Physical coordinates of every channel.
    pub fn axis(&self) -> &Array1<f64> {
        &self.coords
    }

    pub fn index2value(&self, index: usize) -> f64 {
        self.coords[index]
    }

    /// Index of the channel closest to `value`, clamped to the axis ends.
    pub fn value2index(&self, value: f64) -> usize {
        if self.is_uniform {
            let raw = (value - self.offset) / self.scale;
            let clamped = raw.round().clamp(0.0, (self.len() - 1) as f64);
            clamped as usize
        } else {
            let mut best = 0;
            let mut best_dist = f64::INFINITY;
            for (i, &c) in self.coords.iter().enumerate() {
                let dist = (c - value).abs();
                if dist < best_dist {
                    best_dist = dist;
                    best = i;
                }
            }
            best
        }
    }

    /// Converts a physical range into index bounds, honoring axis direction.
    ///
    /// With a negative `scale` the *larger* physical value maps to the lower
    /// index, so `(89.0, 85.0)` is the valid ordering there. Fails when the
    /// resulting index range is empty or inverted.
    pub fn value_range_to_indices(&self, x1: f64, x2: f64) -> Result<(usize, usize), ModelError> {
        let i1 = self.value2index(x1);
        let i2 = self.value2index(x2);
        if i1 >= i2 {
            return Err(ModelError::EmptySignalRange { x1, x2 });
        }
        Ok((i1, i2))
    }

    /// Per-channel widths: constant `scale` for a uniform axis, the
    /// element-wise coordinate gradient otherwise.
    pub fn channel_widths(&self) -> Array1<f64> {
        if self.is_uniform {
            return Array1::from_elem(self.len(), self.scale);
        }
        let c = &self.coords;
        let n = c.len();
        let mut widths = Array1::zeros(n);
        if n == 1 {
            widths[0] = 1.0;
            return widths;
        }
        widths[0] = c[1] - c[0];
        widths[n - 1] = c[n - 1] - c[n - 2];
        for i in 1..n - 1 {
            widths[i] = (c[i + 1] - c[i - 1]) / 2.0;
        }
        widths
    }

    /// Mean channel width, the binned-signal scaling used by estimators.
    pub fn mean_channel_width(&self) -> f64 {
        if self.is_uniform {
            self.scale
        } else {
            self.channel_widths().mean().unwrap_or(1.0)
        }
    }
}

/// Span region of interest over the signal axis, in physical coordinates.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct SpanRoi {
    pub left: f64,
    pub right: f64,
}

impl SpanRoi {
    pub fn new(left: f64, right: f64) -> Self {
        Self { left, right }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use approx::assert_abs_diff_eq;

    #[test]
    fn uniform_value2index_rounds_and_clamps() {
        let axis = SignalAxis::uniform(20, 100.0, 1.0);
        assert_eq!(axis.value2index(105.4), 5);
        assert_eq!(axis.value2index(105.6), 6);
        assert_eq!(axis.value2index(0.0), 0);
        assert_eq!(axis.value2index(1e6), 19);
    }

    #[test]
    fn value_range_positive_scale() {
        let axis = SignalAxis::uniform(20, 100.0, 1.0);
        assert_eq!(axis.value_range_to_indices(105.0, 110.0).unwrap(), (5, 10));
        assert!(matches!(
            axis.value_range_to_indices(89.0, 85.0),
            Err(ModelError::EmptySignalRange { .. })
        ));
    }

    #[test]
    fn value_range_negative_scale() {
        let axis = SignalAxis::uniform(20, 100.0, -1.0);
        assert_eq!(axis.value_range_to_indices(89.0, 85.0).unwrap(), (11, 15));
        assert!(matches!(
            axis.value_range_to_indices(85.0, 89.0),
            Err(ModelError::EmptySignalRange { .. })
        ));
        assert_eq!(axis.value_range_to_indices(89.0, 20.0).unwrap(), (11, 19));
    }

    #[test]
    fn channel_widths_uniform() {
        let axis = SignalAxis::uniform(4, 0.0, 0.3);
        for &w in axis.channel_widths().iter() {
            assert_abs_diff_eq!(w, 0.3);
        }
        assert_abs_diff_eq!(axis.mean_channel_width(), 0.3);
    }

    #[test]
    fn channel_widths_non_uniform_gradient() {
        let axis = SignalAxis::from_coords(Array1::from_vec(vec![0.0, 1.0, 3.0, 6.0]));
        let w = axis.channel_widths();
        assert_abs_diff_eq!(w[0], 1.0);
        assert_abs_diff_eq!(w[1], 1.5);
        assert_abs_diff_eq!(w[2], 2.5);
        assert_abs_diff_eq!(w[3], 3.0);
    }

    #[test]
    fn convert_to_non_uniform_keeps_coords() {
        let mut axis = SignalAxis::uniform(5, 1.0, 2.0);
        let before = axis.axis().clone();
        axis.convert_to_non_uniform();
        assert!(!axis.is_uniform());
        assert_eq!(axis.axis(), &before);
        assert_abs_diff_eq!(axis.mean_channel_width(), 2.0);
    }
}

use ndarray::{Array1, ArrayView1, ArrayView2};
use serde::{Deserialize, Serialize};

/// Selectable scalar-objective loss, all sharing the same Jacobian.
///
/// Each gradient is a pure function of the assembled Jacobian and the
/// residual (`data - model`); Poisson-style maximum likelihood also needs
/// the data and the model values themselves.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub enum LossFunction {
    /// `sum(residual^2)`, gradient `-2 (J . residual)`.
    LeastSquares,
    /// Poisson maximum likelihood, gradient `J . (1 - data / model)`.
    MaximumLikelihood,
    /// L2 near zero residual blending into L1 in the tails,
    /// gradient `-(J . psi_delta(residual))`.
    Huber { delta: f64 },
}

impl Default for LossFunction {
    fn default() -> Self {
        Self::LeastSquares
    }
}

impl LossFunction {
    /// Gradient of the scalar objective w.r.t. every free-vector slot.
    ///
    /// `jacobian` is `(n_free, n_channels)`, the remaining arguments are
    /// per-channel.
    pub fn gradient(
        &self,
        jacobian: ArrayView2<f64>,
        residual: ArrayView1<f64>,
        data: ArrayView1<f64>,
        model: ArrayView1<f64>,
    ) -> Array1<f64> {
        match *self {
            Self::LeastSquares => -2.0 * jacobian.dot(&residual),
            Self::MaximumLikelihood => {
                let factor = ndarray::Zip::from(&data)
                    .and(&model)
                    .map_collect(|&d, &m| 1.0 - d / m);
                jacobian.dot(&factor)
            }
            Self::Huber { delta } => {
                let psi = residual.mapv(|r| r.clamp(-delta, delta));
                -jacobian.dot(&psi)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use approx::assert_abs_diff_eq;
    use ndarray::{array, Array2};

    #[test]
    fn least_squares_gradient() {
        let jac = Array2::from_elem((1, 2), 7.0);
        let residual = array![0.1, 0.1];
        let grad = LossFunction::LeastSquares.gradient(
            jac.view(),
            residual.view(),
            array![0.0, 0.0].view(),
            array![0.0, 0.0].view(),
        );
        assert_abs_diff_eq!(grad[0], -2.8, epsilon = 1e-12);
    }

    #[test]
    fn maximum_likelihood_gradient() {
        let jac = Array2::from_elem((1, 2), 7.0);
        let data = array![1.2, 1.2];
        let model = array![3.0, 3.0];
        let grad = LossFunction::MaximumLikelihood.gradient(
            jac.view(),
            array![0.0, 0.0].view(),
            data.view(),
            model.view(),
        );
        // 7 * (1 - 0.4) * 2 channels
        assert_abs_diff_eq!(grad[0], 8.4, epsilon = 1e-12);
    }

    #[test]
    fn huber_matches_least_squares_inside_delta() {
        let jac = Array2::from_elem((1, 2), 7.0);
        let residual = array![0.1, 0.1];
        let zero = array![0.0, 0.0];
        let huber = LossFunction::Huber { delta: 1.0 }.gradient(
            jac.view(),
            residual.view(),
            zero.view(),
            zero.view(),
        );
        // half the least-squares gradient inside delta
        assert_abs_diff_eq!(huber[0], -1.4, epsilon = 1e-12);
    }

    #[test]
    fn huber_saturates_in_the_tails() {
        let jac = Array2::from_elem((1, 1), 1.0);
        let zero = array![0.0];
        let grad = LossFunction::Huber { delta: 0.5 }.gradient(
            jac.view(),
            array![10.0].view(),
            zero.view(),
            zero.view(),
        );
        assert_abs_diff_eq!(grad[0], -0.5, epsilon = 1e-12);
    }
}

use ndarray::{Array1, Array2};

/// Residual/Jacobian callbacks the minimizer drives.
///
/// `residuals` returns `data - model` (weighted), `jacobian` its derivative
/// matrix `(n_params, n_channels)` in the same weighting. Both may mutate the
/// problem's scratch state; the model's current parameter values are exactly
/// such scratch during a fit.
pub trait FitProblem {
    fn residuals(&mut self, p: &[f64]) -> Array1<f64>;
    fn jacobian(&mut self, p: &[f64]) -> Array2<f64>;
}

/// Outcome of a single minimization.
#[derive(Clone, Debug)]
pub struct FitResult {
    pub p: Vec<f64>,
    pub cost: f64,
    pub n_iter: usize,
    pub converged: bool,
}

/// External-minimizer contract: objective/Jacobian callables, an initial
/// vector and per-element bound pairs in, a best-fit vector and convergence
/// status out.
pub trait Minimizer {
    fn minimize(
        &self,
        problem: &mut dyn FitProblem,
        p0: &[f64],
        bounds: &[(Option<f64>, Option<f64>)],
    ) -> FitResult;
}

/// Damped-normal-equations Levenberg-Marquardt with box-bound clamping.
#[derive(Clone, Debug)]
pub struct LevenbergMarquardt {
    max_iterations: usize,
    ftol: f64,
    xtol: f64,
    lambda0: f64,
    lambda_up: f64,
    lambda_down: f64,
}

impl Default for LevenbergMarquardt {
    fn default() -> Self {
        Self {
            max_iterations: 100,
            ftol: 1e-10,
            xtol: 1e-10,
            lambda0: 1e-3,
            lambda_up: 10.0,
            lambda_down: 10.0,
        }
    }
}

impl LevenbergMarquardt {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_max_iterations(mut self, max_iterations: usize) -> Self {
        self.max_iterations = max_iterations;
        self
    }

    pub fn with_ftol(mut self, ftol: f64) -> Self {
        self.ftol = ftol;
        self
    }

    pub fn with_xtol(mut self, xtol: f64) -> Self {
        self.xtol = xtol;
        self
    }

    pub fn with_lambda(mut self, lambda0: f64) -> Self {
        self.lambda0 = lambda0;
        self
    }
}

fn clamp_to_bounds(p: &mut [f64], bounds: &[(Option<f64>, Option<f64>)]) {
    for (v, &(lower, upper)) in p.iter_mut().zip(bounds) {
        if let Some(lower) = lower {
            *v = v.max(lower);
        }
        if let Some(upper) = upper {
            *v = v.min(upper);
        }
    }
}

impl Minimizer for LevenbergMarquardt {
    fn minimize(
        &self,
        problem: &mut dyn FitProblem,
        p0: &[f64],
        bounds: &[(Option<f64>, Option<f64>)],
    ) -> FitResult {
        let n = p0.len();
        let mut p = p0.to_vec();
        clamp_to_bounds(&mut p, bounds);
        let mut residual = problem.residuals(&p);
        let mut cost = residual.dot(&residual);
        let mut lambda = self.lambda0;

        if n == 0 {
            return FitResult {
                p,
                cost,
                n_iter: 0,
                converged: true,
            };
        }

        for iter in 1..=self.max_iterations {
            let jac = problem.jacobian(&p);
            // J r and J J^T of the residual convention r = data - model:
            // the Gauss-Newton step is (J J^T + lambda diag) step = J r.
            let jr = jac.dot(&residual);
            let jjt = jac.dot(&jac.t());

            let mut improved = false;
            for _ in 0..16 {
                let mut damped = jjt.clone();
                for i in 0..n {
                    let d = damped[[i, i]];
                    damped[[i, i]] = d + lambda * d.max(1e-12);
                }
                let Some(step) = solve_linear_system(damped, jr.clone()) else {
                    lambda *= self.lambda_up;
                    continue;
                };
                let mut trial: Vec<f64> = p.iter().zip(step.iter()).map(|(&v, &s)| v + s).collect();
                clamp_to_bounds(&mut trial, bounds);
                let trial_residual = problem.residuals(&trial);
                let trial_cost = trial_residual.dot(&trial_residual);
                if trial_cost.is_finite() && trial_cost <= cost {
                    let step_norm = p
                        .iter()
                        .zip(&trial)
                        .map(|(&a, &b)| (a - b) * (a - b))
                        .sum::<f64>()
                        .sqrt();
                    let cost_drop = cost - trial_cost;
                    p = trial;
                    residual = trial_residual;
                    cost = trial_cost;
                    lambda = (lambda / self.lambda_down).max(1e-12);
                    improved = true;
                    if cost_drop <= self.ftol * cost.max(1.0) || step_norm <= self.xtol {
                        return FitResult {
                            p,
                            cost,
                            n_iter: iter,
                            converged: true,
                        };
                    }
                    break;
                }
                lambda *= self.lambda_up;
            }

            if !improved {
                // Damping exhausted: either at a minimum or stuck.
                let grad_norm = jr.iter().map(|&g| g * g).sum::<f64>().sqrt();
                return FitResult {
                    p,
                    cost,
                    n_iter: iter,
                    converged: grad_norm <= 1e-6 * (1.0 + cost),
                };
            }
        }

        FitResult {
            p,
            cost,
            n_iter: self.max_iterations,
            converged: false,
        }
    }
}

/// Gaussian elimination with partial pivoting; `None` for a singular system.
pub(crate) fn solve_linear_system(mut a: Array2<f64>, mut b: Array1<f64>) -> Option<Array1<f64>> {
    let n = b.len();
    debug_assert_eq!(a.shape(), &[n, n]);
    for col in 0..n {
        let pivot_row = (col..n)
            .max_by(|&i, &j| a[[i, col]].abs().total_cmp(&a[[j, col]].abs()))
            .unwrap();
        if a[[pivot_row, col]].abs() < 1e-300 {
            return None;
        }
        if pivot_row != col {
            for k in 0..n {
                let tmp = a[[col, k]];
                a[[col, k]] = a[[pivot_row, k]];
                a[[pivot_row, k]] = tmp;
            }
            b.swap(col, pivot_row);
        }
        for row in col + 1..n {
            let factor = a[[row, col]] / a[[col, col]];
            if factor == 0.0 {
                continue;
            }
            for k in col..n {
                a[[row, k]] -= factor * a[[col, k]];
            }
            b[row] -= factor * b[col];
        }
    }
    let mut x = Array1::zeros(n);
    for row in (0..n).rev() {
        let mut sum = b[row];
        for k in row + 1..n {
            sum -= a[[row, k]] * x[k];
        }
        x[row] = sum / a[[row, row]];
    }
    x.iter().all(|v| v.is_finite()).then_some(x)
}

#[cfg(test)]
mod tests {
    use super::*;

    use approx::assert_abs_diff_eq;
    use ndarray::array;

    #[test]
    fn solve_simple_system() {
        let a = array![[2.0, 1.0], [1.0, 3.0]];
        let b = array![3.0, 5.0];
        let x = solve_linear_system(a, b).unwrap();
        assert_abs_diff_eq!(x[0], 0.8, epsilon = 1e-12);
        assert_abs_diff_eq!(x[1], 1.4, epsilon = 1e-12);
    }

    #[test]
    fn solve_singular_system() {
        let a = array![[1.0, 2.0], [2.0, 4.0]];
        let b = array![1.0, 2.0];
        assert!(solve_linear_system(a, b).is_none());
    }

    struct Quadratic {
        x: Vec<f64>,
        y: Vec<f64>,
    }

    impl FitProblem for Quadratic {
        fn residuals(&mut self, p: &[f64]) -> Array1<f64> {
            Array1::from_iter(
                self.x
                    .iter()
                    .zip(&self.y)
                    .map(|(&x, &y)| y - (p[0] * x * x + p[1])),
            )
        }

        fn jacobian(&mut self, _p: &[f64]) -> Array2<f64> {
            let mut jac = Array2::zeros((2, self.x.len()));
            for (j, &x) in self.x.iter().enumerate() {
                jac[[0, j]] = x * x;
                jac[[1, j]] = 1.0;
            }
            jac
        }
    }

    #[test]
    fn lm_recovers_quadratic() {
        let x: Vec<f64> = (0..20).map(|i| i as f64 * 0.1).collect();
        let y: Vec<f64> = x.iter().map(|&x| 2.5 * x * x - 0.7).collect();
        let mut problem = Quadratic { x, y };
        let result = LevenbergMarquardt::new().minimize(&mut problem, &[1.0, 0.0], &[(None, None); 2]);
        assert!(result.converged);
        assert_abs_diff_eq!(result.p[0], 2.5, epsilon = 1e-6);
        assert_abs_diff_eq!(result.p[1], -0.7, epsilon = 1e-6);
    }

    #[test]
    fn lm_respects_bounds() {
        let x: Vec<f64> = (0..20).map(|i| i as f64 * 0.1).collect();
        let y: Vec<f64> = x.iter().map(|&x| 2.5 * x * x - 0.7).collect();
        let mut problem = Quadratic { x, y };
        let bounds = [(Some(0.0), Some(2.0)), (None, None)];
        let result = LevenbergMarquardt::new().minimize(&mut problem, &[1.0, 0.0], &bounds);
        assert!(result.p[0] <= 2.0 + 1e-12);
    }
}

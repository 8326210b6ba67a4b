use super::ComponentFunction;
use crate::parameter::Parameter;

/// Normalized-by-amplitude Gaussian peak,
/// `f(x) = A exp(-(x - centre)^2 / (2 sigma^2))`.
#[derive(Clone, Debug, Default)]
pub struct Gaussian;

impl ComponentFunction for Gaussian {
    fn base_name(&self) -> &'static str {
        "Gaussian"
    }

    fn make_parameters(&self) -> Vec<Parameter> {
        vec![
            Parameter::new("A", 1.0),
            Parameter::new("centre", 0.0),
            Parameter::new("sigma", 1.0),
        ]
    }

    fn value(&self, p: &[f64], x: f64) -> f64 {
        let (a, centre, sigma) = (p[0], p[1], p[2]);
        let z = (x - centre) / sigma;
        a * f64::exp(-0.5 * z * z)
    }

    fn gradient(&self, p: &[f64], x: f64, grad: &mut [f64]) {
        let (a, centre, sigma) = (p[0], p[1], p[2]);
        let dx = x - centre;
        let z = dx / sigma;
        let e = f64::exp(-0.5 * z * z);
        grad[0] = e;
        grad[1] = a * dx / (sigma * sigma) * e;
        grad[2] = a * dx * dx / (sigma * sigma * sigma) * e;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use approx::assert_abs_diff_eq;

    #[test]
    fn peak_value_and_symmetry() {
        let g = Gaussian::default();
        let p = [2.0, 1.0, 0.5];
        assert_abs_diff_eq!(g.value(&p, 1.0), 2.0);
        assert_abs_diff_eq!(g.value(&p, 0.5), g.value(&p, 1.5));
    }

    #[test]
    fn gradient_matches_finite_differences() {
        let g = Gaussian::default();
        let p = [1.5, 0.3, 0.8];
        let x = 0.7;
        let mut grad = [0.0; 3];
        g.gradient(&p, x, &mut grad);
        let h = 1e-7;
        for i in 0..3 {
            let mut ph = p;
            ph[i] += h;
            let numeric = (g.value(&ph, x) - g.value(&p, x)) / h;
            assert_abs_diff_eq!(grad[i], numeric, epsilon = 1e-5);
        }
    }
}

use super::ComponentFunction;
use crate::parameter::Parameter;

/// Constant offset, `f(x) = offset`.
#[derive(Clone, Debug, Default)]
pub struct Offset;

impl ComponentFunction for Offset {
    fn base_name(&self) -> &'static str {
        "Offset"
    }

    fn make_parameters(&self) -> Vec<Parameter> {
        vec![Parameter::new("offset", 0.0)]
    }

    fn value(&self, p: &[f64], _x: f64) -> f64 {
        p[0]
    }

    fn gradient(&self, _p: &[f64], _x: f64, grad: &mut [f64]) {
        grad[0] = 1.0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn constant_everywhere() {
        let o = Offset;
        assert_eq!(o.value(&[3.5], -10.0), 3.5);
        assert_eq!(o.value(&[3.5], 10.0), 3.5);
        let mut grad = [0.0];
        o.gradient(&[3.5], 0.0, &mut grad);
        assert_eq!(grad[0], 1.0);
    }
}

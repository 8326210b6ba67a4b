use super::ComponentFunction;
use crate::error::ModelError;
use crate::fit::solve_linear_system;
use crate::parameter::Parameter;
use crate::signal::Signal;

use ndarray::{s, Array1, Array2, ArrayView1, IxDyn};
use serde_json::Value;

/// n-order polynomial, `f(x) = a_n x^n + ... + a_1 x + a_0`.
///
/// Parameters are named `a` followed by the zero-padded degree (padding width
/// is the number of digits of `order`), stored highest degree first, so
/// lexical and degree order coincide for any order.
#[derive(Clone, Debug)]
pub struct Polynomial {
    order: usize,
}

impl Polynomial {
    pub fn new(order: usize) -> Result<Self, ModelError> {
        if order == 0 {
            return Err(ModelError::InvalidPolynomialOrder);
        }
        Ok(Self { order })
    }

    pub fn order(&self) -> usize {
        self.order
    }

    /// Zero-padded coefficient names, highest degree first.
    pub fn coefficient_names(&self) -> Vec<String> {
        coefficient_names(self.order)
    }
}

fn coefficient_names(order: usize) -> Vec<String> {
    let width = order.to_string().len();
    (0..=order)
        .rev()
        .map(|degree| format!("a{degree:0width$}"))
        .collect()
}

impl ComponentFunction for Polynomial {
    fn base_name(&self) -> &'static str {
        "Polynomial"
    }

    fn make_parameters(&self) -> Vec<Parameter> {
        self.coefficient_names()
            .into_iter()
            .map(|name| Parameter::new(name, 0.0))
            .collect()
    }

    fn value(&self, p: &[f64], x: f64) -> f64 {
        // Horner over descending coefficients
        p.iter().fold(0.0, |acc, &c| acc * x + c)
    }

    fn gradient(&self, p: &[f64], x: f64, grad: &mut [f64]) {
        debug_assert_eq!(p.len(), self.order + 1);
        for (j, g) in grad.iter_mut().enumerate() {
            *g = x.powi((self.order - j) as i32);
        }
    }
}

/// Least-squares polynomial fit of `y(x)`, coefficients highest degree first.
/// `None` for an under-determined or numerically singular system.
pub fn polyfit(x: ArrayView1<f64>, y: ArrayView1<f64>, order: usize) -> Option<Vec<f64>> {
    let n_coeff = order + 1;
    if x.len() < n_coeff {
        return None;
    }
    // Normal equations of the Vandermonde system, small orders only.
    let mut gram = Array2::zeros((n_coeff, n_coeff));
    let mut rhs = Array1::zeros(n_coeff);
    for (&xi, &yi) in x.iter().zip(y.iter()) {
        let powers: Vec<f64> = (0..n_coeff).map(|j| xi.powi((order - j) as i32)).collect();
        for j in 0..n_coeff {
            rhs[j] += powers[j] * yi;
            for l in 0..n_coeff {
                gram[[j, l]] += powers[j] * powers[l];
            }
        }
    }
    solve_linear_system(gram, rhs).map(|c| c.to_vec())
}

/// Two-pass polynomial estimator over the coordinate range `[x1, x2)`.
///
/// With `only_current` the current pixel's data alone is fit and the
/// coefficients stored as current values; otherwise every navigation pixel
/// is fit through the unfolded view, the results written into the parameter
/// maps and the current values reloaded from the map. Binned axes divide the
/// estimated coefficients by the channel width (mean coordinate gradient for
/// a non-uniform axis).
pub(super) fn estimate_polynomial_parameters(
    poly: &Polynomial,
    parameters: &mut [Parameter],
    signal: &Signal,
    x1: f64,
    x2: f64,
    only_current: bool,
) -> Result<bool, ModelError> {
    let axis = &signal.axis;
    let (i1, i2) = axis.value_range_to_indices(x1, x2)?;
    let x = axis.axis().slice(s![i1..i2]);
    let scaling = if axis.is_binned {
        axis.mean_channel_width()
    } else {
        1.0
    };

    if only_current {
        let data = signal.current_data();
        let Some(coeffs) = polyfit(x, data.slice(s![i1..i2]), poly.order()) else {
            return Ok(false);
        };
        for (param, &c) in parameters.iter_mut().zip(&coeffs) {
            if param.is_twinned() {
                continue;
            }
            param.assign_values(&[c / scaling]);
        }
        return Ok(true);
    }

    let nav_shape = signal.nav_shape().to_vec();
    for param in parameters.iter_mut() {
        param.ensure_map(&nav_shape);
    }
    let flat = signal.unfolded();
    for (row, data) in flat.outer_iter().enumerate() {
        let Some(coeffs) = polyfit(x, data.slice(s![i1..i2]), poly.order()) else {
            return Ok(false);
        };
        let nav_index = signal.nav_index_from_flat(row);
        for (param, &c) in parameters.iter_mut().zip(&coeffs) {
            let map = param.map.as_mut().unwrap();
            let mut full = nav_index.clone();
            full.push(0);
            map.values[IxDyn(&full)] = c / scaling;
            map.is_set[IxDyn(&nav_index)] = true;
        }
    }
    for param in parameters.iter_mut() {
        param.fetch_from_map(signal.nav_index());
    }
    Ok(true)
}

/// Converts the legacy single-coefficient-list polynomial layout to the
/// current one-parameter-per-degree layout.
///
/// The legacy dictionary holds one parameter whose `value` and `_bounds`
/// entries are lists over the degrees; the converted dictionary holds
/// `order + 1` parameters named by zero-padded degree with the lists split
/// element-wise.
pub fn convert_legacy_polynomial(legacy: &Value) -> Result<Value, ModelError> {
    let reason = |r: &str| ModelError::LegacyConversion { reason: r.into() };

    let order = legacy
        .get("order")
        .and_then(Value::as_u64)
        .ok_or_else(|| reason("missing integer field `order`"))? as usize;
    if order == 0 {
        return Err(ModelError::InvalidPolynomialOrder);
    }
    let coefficient = legacy
        .get("parameters")
        .and_then(Value::as_array)
        .and_then(|params| params.first())
        .ok_or_else(|| reason("missing single-entry `parameters` list"))?;
    let values = coefficient
        .get("value")
        .and_then(Value::as_array)
        .ok_or_else(|| reason("coefficient `value` is not a list"))?;
    if values.len() != order + 1 {
        return Err(reason("coefficient list length does not match the order"));
    }
    let bounds = coefficient.get("_bounds").and_then(Value::as_array);
    if let Some(bounds) = bounds {
        if bounds.len() != order + 1 {
            return Err(reason("bounds list length does not match the order"));
        }
    }

    let mut converted = legacy.clone();
    let mut new_params = Vec::with_capacity(order + 1);
    for (i, name) in coefficient_names(order).into_iter().enumerate() {
        let mut param = coefficient.clone();
        let obj = param
            .as_object_mut()
            .ok_or_else(|| reason("coefficient entry is not a dictionary"))?;
        obj.insert("_id_name".into(), Value::String(name));
        obj.insert("value".into(), values[i].clone());
        if let Some(bounds) = bounds {
            obj.insert("_bounds".into(), bounds[i].clone());
        }
        new_params.push(param);
    }
    converted
        .as_object_mut()
        .ok_or_else(|| reason("legacy layout is not a dictionary"))?
        .insert("parameters".into(), Value::Array(new_params));
    Ok(converted)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::axis::SignalAxis;
    use crate::component::Component;

    use approx::assert_abs_diff_eq;
    use ndarray::{Array1, Array2 as NdArray2};
    use serde_json::json;

    #[test]
    fn order_zero_rejected() {
        assert_eq!(
            Polynomial::new(0).unwrap_err(),
            ModelError::InvalidPolynomialOrder
        );
    }

    #[test]
    fn parameter_count_and_names() {
        for order in [1, 3, 10, 12] {
            let c = Component::polynomial(order).unwrap();
            assert_eq!(c.parameters().len(), order + 1);
            let names: Vec<_> = c.parameters().iter().map(|p| p.name().to_owned()).collect();
            let mut sorted = names.clone();
            sorted.sort();
            sorted.reverse();
            // lexical descending == parameter (descending-degree) order
            assert_eq!(names, sorted);
        }
        let c = Component::polynomial(12).unwrap();
        assert_eq!(c.parameters()[0].name(), "a12");
        assert_eq!(c.parameters()[3].name(), "a09");
        assert_eq!(c.parameters()[12].name(), "a00");
    }

    #[test]
    fn value_and_gradient() {
        let poly = Polynomial::new(2).unwrap();
        // 3x^2 + 2x + 1
        let p = [3.0, 2.0, 1.0];
        assert_abs_diff_eq!(poly.value(&p, 2.0), 17.0);
        let mut grad = [0.0; 3];
        poly.gradient(&p, 2.0, &mut grad);
        assert_eq!(grad, [4.0, 2.0, 1.0]);
    }

    #[test]
    fn polyfit_recovers_exact_coefficients() {
        let x = Array1::linspace(-2.0, 2.0, 9);
        let y = x.mapv(|x| 0.5 * x * x - 1.5 * x + 2.0);
        let coeffs = polyfit(x.view(), y.view(), 2).unwrap();
        assert_abs_diff_eq!(coeffs[0], 0.5, epsilon = 1e-9);
        assert_abs_diff_eq!(coeffs[1], -1.5, epsilon = 1e-9);
        assert_abs_diff_eq!(coeffs[2], 2.0, epsilon = 1e-9);
    }

    #[test]
    fn polyfit_under_determined() {
        let x = Array1::from_vec(vec![0.0, 1.0]);
        let y = Array1::from_vec(vec![0.0, 1.0]);
        assert!(polyfit(x.view(), y.view(), 2).is_none());
    }

    #[test]
    fn estimate_only_current() {
        let x = Array1::linspace(0.0, 9.0, 10);
        let y = x.mapv(|x| 2.0 * x + 5.0);
        let signal = Signal::from_1d(y);
        let mut c = Component::polynomial(1).unwrap();
        assert!(c.estimate_parameters(&signal, 0.0, 10.0, true).unwrap());
        assert_abs_diff_eq!(c.parameter("a1").unwrap().value(), 2.0, epsilon = 1e-9);
        assert_abs_diff_eq!(c.parameter("a0").unwrap().value(), 5.0, epsilon = 1e-9);
    }

    #[test]
    fn estimate_only_current_binned() {
        let x = Array1::linspace(0.0, 9.0, 10);
        let y = x.mapv(|x| 2.0 * x + 5.0);
        let mut signal = Signal::from_1d(y);
        signal.axis.is_binned = true;
        signal.axis.set_scale(1.0); // unit width, but the path is exercised
        let mut c = Component::polynomial(1).unwrap();
        assert!(c.estimate_parameters(&signal, 0.0, 10.0, true).unwrap());
        assert_abs_diff_eq!(c.parameter("a1").unwrap().value(), 2.0, epsilon = 1e-9);

        // widths of 0.5 double the stored coefficients
        let mut data = Vec::new();
        for i in 0..10 {
            data.push(2.0 * (0.5 * i as f64) + 5.0);
        }
        let mut half = Signal::new(
            Array1::from_vec(data).into_dyn(),
            SignalAxis::uniform(10, 0.0, 0.5),
        )
        .unwrap();
        half.axis.is_binned = true;
        let mut c = Component::polynomial(1).unwrap();
        assert!(c.estimate_parameters(&half, 0.0, 5.0, true).unwrap());
        assert_abs_diff_eq!(c.parameter("a1").unwrap().value(), 4.0, epsilon = 1e-9);
        assert_abs_diff_eq!(c.parameter("a0").unwrap().value(), 10.0, epsilon = 1e-9);
    }

    #[test]
    fn estimate_full_dataset_writes_maps() {
        // 3 pixels, each a straight line with slope = pixel index
        let mut rows = Vec::new();
        for pixel in 0..3 {
            for i in 0..8 {
                rows.push(pixel as f64 * i as f64 + 1.0);
            }
        }
        let data = NdArray2::from_shape_vec((3, 8), rows).unwrap();
        let signal = Signal::new(data.into_dyn(), SignalAxis::uniform(8, 0.0, 1.0)).unwrap();
        let mut c = Component::polynomial(1).unwrap();
        assert!(c.estimate_parameters(&signal, 0.0, 8.0, false).unwrap());

        let a1 = c.parameter("a1").unwrap().map.as_ref().unwrap();
        for pixel in 0..3 {
            assert!(a1.is_set[IxDyn(&[pixel])]);
            assert_abs_diff_eq!(a1.values[IxDyn(&[pixel, 0])], pixel as f64, epsilon = 1e-9);
        }
        // current values reloaded from the map at the current pixel
        assert_abs_diff_eq!(c.parameter("a1").unwrap().value(), 0.0, epsilon = 1e-9);
        assert_abs_diff_eq!(c.parameter("a0").unwrap().value(), 1.0, epsilon = 1e-9);
    }

    #[test]
    fn legacy_conversion_splits_coefficient_list() {
        let legacy = json!({
            "order": 2,
            "parameters": [{
                "_id_name": "coefficients",
                "value": [3.0, 2.0, 1.0],
                "_bounds": [[0.0, 10.0], [-1.0, 1.0], [null, 5.0]],
                "free": true,
            }],
        });
        let converted = convert_legacy_polynomial(&legacy).unwrap();
        let params = converted["parameters"].as_array().unwrap();
        assert_eq!(params.len(), 3);
        assert_eq!(params[0]["_id_name"], "a2");
        assert_eq!(params[1]["_id_name"], "a1");
        assert_eq!(params[2]["_id_name"], "a0");
        assert_eq!(params[0]["value"], 3.0);
        assert_eq!(params[2]["value"], 1.0);
        assert_eq!(params[1]["_bounds"], json!([-1.0, 1.0]));
        assert_eq!(params[0]["free"], true);
    }

    #[test]
    fn legacy_conversion_rejects_malformed() {
        assert!(convert_legacy_polynomial(&json!({"parameters": []})).is_err());
        assert!(
            convert_legacy_polynomial(&json!({
                "order": 2,
                "parameters": [{"value": [1.0, 2.0]}],
            }))
            .is_err()
        );
    }
}

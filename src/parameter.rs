use crate::error::ModelError;

use ndarray::{ArrayD, IxDyn};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::sync::atomic::{AtomicU64, Ordering};

static NEXT_PARAM_ID: AtomicU64 = AtomicU64::new(0);

/// Stable identifier of a [`Parameter`], unique per construction.
///
/// Twin links are stored as ids rather than references, which keeps the twin
/// graph an explicit, serializable structure and makes cycle checks a plain
/// id walk.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ParamId(u64);

impl ParamId {
    pub(crate) fn next() -> Self {
        Self(NEXT_PARAM_ID.fetch_add(1, Ordering::Relaxed))
    }
}

/// Linear relation binding a parameter's value to another parameter's.
///
/// The twinned value is `slope * target_value + intercept`; the identity link
/// (`slope = 1`, `intercept = 0`) is the common same-value case. `slope` is
/// also the chain-rule factor applied when the twinned parameter's gradient
/// is summed into the target's free-vector slot.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct TwinLink {
    pub target: ParamId,
    pub slope: f64,
    pub intercept: f64,
}

impl TwinLink {
    pub fn identity(target: ParamId) -> Self {
        Self {
            target,
            slope: 1.0,
            intercept: 0.0,
        }
    }

    pub fn linear(target: ParamId, slope: f64, intercept: f64) -> Self {
        Self {
            target,
            slope,
            intercept,
        }
    }

    pub fn apply(&self, value: f64) -> f64 {
        self.slope * value + self.intercept
    }
}

/// Per-navigation-pixel storage of fit results for one parameter.
///
/// `values` and `std` are shaped `nav_shape + [n_elements]`, `is_set` is
/// shaped `nav_shape`. This is the serialized unit of per-pixel fit results.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ParameterMap {
    pub values: ArrayD<f64>,
    pub std: ArrayD<f64>,
    pub is_set: ArrayD<bool>,
}

impl ParameterMap {
    pub fn new(nav_shape: &[usize], n_elements: usize) -> Self {
        let mut value_shape = nav_shape.to_vec();
        value_shape.push(n_elements);
        Self {
            values: ArrayD::zeros(IxDyn(&value_shape)),
            std: ArrayD::from_elem(IxDyn(&value_shape), f64::NAN),
            is_set: ArrayD::from_elem(IxDyn(nav_shape), false),
        }
    }
}

/// A named fit variable owned by exactly one component.
///
/// Scalar in the common case; `n_elements > 1` parameters expand in place
/// into the flat free-parameter vector. A twinned parameter is excluded from
/// the free vector and its value is derived from the twin target (resolution
/// happens in the model, which owns the id arena).
#[derive(Clone, Debug)]
pub struct Parameter {
    id: ParamId,
    name: String,
    value: Vec<f64>,
    pub std: Option<f64>,
    pub free: bool,
    pub bmin: Option<f64>,
    pub bmax: Option<f64>,
    pub(crate) twin: Option<TwinLink>,
    pub(crate) twins_in: BTreeSet<ParamId>,
    pub map: Option<ParameterMap>,
}

impl Parameter {
    pub fn new(name: impl Into<String>, value: f64) -> Self {
        Self::new_multi(name, vec![value])
    }

    pub fn new_multi(name: impl Into<String>, value: Vec<f64>) -> Self {
        assert!(!value.is_empty(), "parameter needs at least one element");
        Self {
            id: ParamId::next(),
            name: name.into(),
            value,
            std: None,
            free: true,
            bmin: None,
            bmax: None,
            twin: None,
            twins_in: BTreeSet::new(),
            map: None,
        }
    }

    pub fn id(&self) -> ParamId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn n_elements(&self) -> usize {
        self.value.len()
    }

    /// First (or only) element of the stored value.
    ///
    /// For a twinned parameter this is the stale stored value; the derived
    /// value is resolved through [`crate::Model::resolved_values`].
    pub fn value(&self) -> f64 {
        self.value[0]
    }

    pub fn values(&self) -> &[f64] {
        &self.value
    }

    pub fn is_twinned(&self) -> bool {
        self.twin.is_some()
    }

    pub fn twin(&self) -> Option<&TwinLink> {
        self.twin.as_ref()
    }

    /// Ids of the parameters twinned *to* this one.
    pub fn twins_in(&self) -> &BTreeSet<ParamId> {
        &self.twins_in
    }

    /// Sets the scalar value; fails while twinned.
    pub fn set_value(&mut self, value: f64) -> Result<(), ModelError> {
        self.set_values(&[value])
    }

    pub fn set_values(&mut self, values: &[f64]) -> Result<(), ModelError> {
        if self.twin.is_some() {
            return Err(ModelError::ImmutableParameter {
                name: self.name.clone(),
            });
        }
        if values.len() != self.value.len() {
            return Err(ModelError::ShapeMismatch {
                expected: vec![self.value.len()],
                actual: vec![values.len()],
            });
        }
        self.value.copy_from_slice(values);
        Ok(())
    }

    /// Direct store skipping the twin check, for model-internal scatter
    /// (`fetch_values_from_p0`, twin breaking, map fetches).
    pub(crate) fn assign_values(&mut self, values: &[f64]) {
        debug_assert_eq!(values.len(), self.value.len());
        self.value.copy_from_slice(values);
    }

    /// Clamps the stored value into `[bmin, bmax]` element-wise.
    ///
    /// Bounds apply regardless of free or active state. Twinned parameters
    /// are skipped, their value is derived.
    pub fn clamp_to_bounds(&mut self) {
        if self.twin.is_some() {
            return;
        }
        for v in &mut self.value {
            if let Some(bmin) = self.bmin {
                *v = v.max(bmin);
            }
            if let Some(bmax) = self.bmax {
                *v = v.min(bmax);
            }
        }
    }

    pub(crate) fn ensure_map(&mut self, nav_shape: &[usize]) {
        let needs_alloc = match &self.map {
            None => true,
            Some(map) => map.is_set.shape() != nav_shape,
        };
        if needs_alloc {
            self.map = Some(ParameterMap::new(nav_shape, self.value.len()));
        }
    }

    /// Writes the current value and std into the map at `nav_index` and marks
    /// the pixel as set.
    pub(crate) fn store_to_map(&mut self, nav_index: &[usize]) {
        let n = self.value.len();
        let std = self.std;
        let value = self.value.clone();
        let map = self.map.as_mut().expect("map allocated on append");
        let mut full = nav_index.to_vec();
        full.push(0);
        for (e, &v) in value.iter().enumerate().take(n) {
            *full.last_mut().unwrap() = e;
            map.values[IxDyn(&full)] = v;
            map.std[IxDyn(&full)] = std.unwrap_or(f64::NAN);
        }
        map.is_set[IxDyn(nav_index)] = true;
    }

    /// Loads the map entry at `nav_index` into the current value, if set.
    /// Twinned parameters keep their derived value.
    pub(crate) fn fetch_from_map(&mut self, nav_index: &[usize]) {
        if self.twin.is_some() {
            return;
        }
        let Some(map) = &self.map else { return };
        if !map.is_set[IxDyn(nav_index)] {
            return;
        }
        let mut full = nav_index.to_vec();
        full.push(0);
        let mut values = Vec::with_capacity(self.value.len());
        let mut std = None;
        for e in 0..self.value.len() {
            *full.last_mut().unwrap() = e;
            values.push(map.values[IxDyn(&full)]);
            let s = map.std[IxDyn(&full)];
            if e == 0 && !s.is_nan() {
                std = Some(s);
            }
        }
        self.assign_values(&values);
        self.std = std;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ids_are_unique() {
        let a = Parameter::new("a", 0.0);
        let b = Parameter::new("b", 0.0);
        assert_ne!(a.id(), b.id());
    }

    #[test]
    fn set_value_rejected_while_twinned() {
        let target = Parameter::new("t", 1.0);
        let mut p = Parameter::new("p", 0.0);
        p.twin = Some(TwinLink::identity(target.id()));
        assert_eq!(
            p.set_value(2.0),
            Err(ModelError::ImmutableParameter { name: "p".into() })
        );
        assert_eq!(p.value(), 0.0);
    }

    #[test]
    fn clamp_is_idempotent() {
        let mut p = Parameter::new("p", 5.0);
        p.bmin = Some(1.0);
        p.bmax = Some(3.0);
        p.clamp_to_bounds();
        assert_eq!(p.value(), 3.0);
        p.clamp_to_bounds();
        assert_eq!(p.value(), 3.0);
    }

    #[test]
    fn one_sided_bounds() {
        let mut p = Parameter::new("p", -5.0);
        p.bmin = Some(0.0);
        p.clamp_to_bounds();
        assert_eq!(p.value(), 0.0);
        p.assign_values(&[1e6]);
        p.clamp_to_bounds();
        assert_eq!(p.value(), 1e6);
    }

    #[test]
    fn map_round_trip() {
        let mut p = Parameter::new_multi("p", vec![1.5, 2.5]);
        p.std = Some(0.1);
        p.ensure_map(&[2, 3]);
        p.store_to_map(&[1, 2]);

        p.assign_values(&[0.0, 0.0]);
        p.std = None;
        p.fetch_from_map(&[0, 0]); // not set, no-op
        assert_eq!(p.values(), &[0.0, 0.0]);

        p.fetch_from_map(&[1, 2]);
        assert_eq!(p.values(), &[1.5, 2.5]);
        assert_eq!(p.std, Some(0.1));
    }

    #[test]
    fn map_shape_follows_nav_shape() {
        let mut p = Parameter::new("p", 0.0);
        p.ensure_map(&[4, 5]);
        let map = p.map.as_ref().unwrap();
        assert_eq!(map.values.shape(), &[4, 5, 1]);
        assert_eq!(map.is_set.shape(), &[4, 5]);
    }
}

pub mod gaussian;
pub mod offset;
pub mod polynomial;

pub use gaussian::Gaussian;
pub use offset::Offset;
pub use polynomial::Polynomial;

use crate::error::ModelError;
use crate::parameter::Parameter;
use crate::signal::Signal;

use enum_dispatch::enum_dispatch;
use ndarray::{ArrayD, IxDyn};
use std::sync::atomic::{AtomicU64, Ordering};

static NEXT_COMPONENT_ID: AtomicU64 = AtomicU64::new(0);

/// Identity of a [`Component`], unique per construction.
///
/// The model's duplicate-append check compares ids, not values: two
/// identically configured components are distinct, a clone is not.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct ComponentId(u64);

impl ComponentId {
    fn next() -> Self {
        Self(NEXT_COMPONENT_ID.fetch_add(1, Ordering::Relaxed))
    }
}

/// Closed-form basis function contract implemented by every component kind.
///
/// `p` is the flat concatenation of the component's parameter values in
/// parameter order (multi-element parameters expanded in place). Both `value`
/// and `gradient` are pure.
#[enum_dispatch]
pub trait ComponentFunction {
    /// Default component name, also the base for collision suffixing.
    fn base_name(&self) -> &'static str;

    /// Freshly constructed parameters with the kind's defaults.
    fn make_parameters(&self) -> Vec<Parameter>;

    /// Component contribution at axis position `x`.
    fn value(&self, p: &[f64], x: f64) -> f64;

    /// Analytic gradient w.r.t. every flat parameter element, written to
    /// `grad` (`grad.len() == p.len()`).
    fn gradient(&self, p: &[f64], x: f64, grad: &mut [f64]);
}

/// The set of basis-function kinds a [`Component`] can carry.
#[enum_dispatch(ComponentFunction)]
#[derive(Clone, Debug)]
pub enum ComponentKind {
    Gaussian,
    Offset,
    Polynomial,
}

/// Component activity: one flag for the whole dataset, or one per
/// navigation pixel.
#[derive(Clone, Debug)]
pub enum Activity {
    Scalar(bool),
    PerPixel(ArrayD<bool>),
}

/// A named basis function owning an ordered list of [`Parameter`]s.
///
/// Constructed independently of any model; the model assigns the final
/// unique name and allocates the per-pixel parameter maps on append.
#[derive(Clone, Debug)]
pub struct Component {
    id: ComponentId,
    pub(crate) name: String,
    pub(crate) active: Activity,
    kind: ComponentKind,
    pub(crate) parameters: Vec<Parameter>,
}

impl Component {
    pub fn new(kind: impl Into<ComponentKind>) -> Self {
        let kind = kind.into();
        let parameters = kind.make_parameters();
        Self {
            id: ComponentId::next(),
            name: kind.base_name().to_owned(),
            active: Activity::Scalar(true),
            kind,
            parameters,
        }
    }

    pub fn gaussian() -> Self {
        Self::new(Gaussian::default())
    }

    pub fn offset() -> Self {
        Self::new(Offset::default())
    }

    pub fn polynomial(order: usize) -> Result<Self, ModelError> {
        Ok(Self::new(Polynomial::new(order)?))
    }

    pub fn id(&self) -> ComponentId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn set_name(&mut self, name: impl Into<String>) {
        self.name = name.into();
    }

    pub fn kind(&self) -> &ComponentKind {
        &self.kind
    }

    pub fn parameters(&self) -> &[Parameter] {
        &self.parameters
    }

    pub fn parameters_mut(&mut self) -> &mut [Parameter] {
        &mut self.parameters
    }

    pub fn parameter(&self, name: &str) -> Option<&Parameter> {
        self.parameters.iter().find(|p| p.name() == name)
    }

    pub fn parameter_mut(&mut self, name: &str) -> Option<&mut Parameter> {
        self.parameters.iter_mut().find(|p| p.name() == name)
    }

    pub fn active_is_multidimensional(&self) -> bool {
        matches!(self.active, Activity::PerPixel(_))
    }

    pub fn is_active_at(&self, nav_index: &[usize]) -> bool {
        match &self.active {
            Activity::Scalar(flag) => *flag,
            Activity::PerPixel(array) => array[IxDyn(nav_index)],
        }
    }

    /// Sets the scalar activity flag. For a per-pixel component this only
    /// touches the pixel at `nav_index`.
    pub fn set_active(&mut self, flag: bool, nav_index: &[usize]) {
        match &mut self.active {
            Activity::Scalar(f) => *f = flag,
            Activity::PerPixel(array) => array[IxDyn(nav_index)] = flag,
        }
    }

    /// Switches between scalar and per-pixel activity.
    ///
    /// Enabling broadcasts the current scalar flag over the navigation
    /// shape. Disabling collapses to the flag at `nav_index`, losing all
    /// per-pixel variation.
    pub fn set_active_is_multidimensional(
        &mut self,
        flag: bool,
        nav_shape: &[usize],
        nav_index: &[usize],
    ) {
        match (&self.active, flag) {
            (Activity::Scalar(current), true) => {
                self.active = Activity::PerPixel(ArrayD::from_elem(IxDyn(nav_shape), *current));
            }
            (Activity::PerPixel(array), false) => {
                self.active = Activity::Scalar(array[IxDyn(nav_index)]);
            }
            _ => {}
        }
    }

    pub(crate) fn active_state(&self) -> Activity {
        self.active.clone()
    }

    pub(crate) fn restore_active_state(&mut self, state: Activity) {
        self.active = state;
    }

    /// Total number of flat parameter elements.
    pub fn n_flat(&self) -> usize {
        self.parameters.iter().map(|p| p.n_elements()).sum()
    }

    /// Flat concatenation of the raw stored parameter values.
    ///
    /// Twins are not resolved here; in-model evaluation goes through the
    /// model's value table instead.
    pub fn flat_values(&self) -> Vec<f64> {
        let mut values = Vec::with_capacity(self.n_flat());
        for p in &self.parameters {
            values.extend_from_slice(p.values());
        }
        values
    }

    /// Component contribution at `x` using the raw stored parameter values.
    pub fn function(&self, x: f64) -> f64 {
        self.kind.value(&self.flat_values(), x)
    }

    /// Kind-specific initial-guess routine over the coordinate range
    /// `[x1, x2)`.
    ///
    /// Returns `Ok(false)` for kinds without an estimator. With
    /// `only_current == false` the estimates for every navigation pixel are
    /// written into the parameter maps and the current values reloaded from
    /// the map at the signal's position.
    pub fn estimate_parameters(
        &mut self,
        signal: &Signal,
        x1: f64,
        x2: f64,
        only_current: bool,
    ) -> Result<bool, ModelError> {
        match &self.kind {
            ComponentKind::Polynomial(poly) => {
                let poly = poly.clone();
                polynomial::estimate_polynomial_parameters(
                    &poly,
                    &mut self.parameters,
                    signal,
                    x1,
                    x2,
                    only_current,
                )
            }
            _ => Ok(false),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_names() {
        assert_eq!(Component::gaussian().name(), "Gaussian");
        assert_eq!(Component::offset().name(), "Offset");
        assert_eq!(Component::polynomial(2).unwrap().name(), "Polynomial");
    }

    #[test]
    fn clone_keeps_identity() {
        let g = Component::gaussian();
        let h = g.clone();
        assert_eq!(g.id(), h.id());
        assert_ne!(g.id(), Component::gaussian().id());
    }

    #[test]
    fn multidimensional_activity_round_trip_is_lossy() {
        let mut c = Component::gaussian();
        c.set_active_is_multidimensional(true, &[2, 2], &[0, 0]);
        assert!(c.active_is_multidimensional());
        c.set_active(false, &[1, 1]);
        assert!(c.is_active_at(&[0, 0]));
        assert!(!c.is_active_at(&[1, 1]));

        // Collapsing keeps only the flag at the given pixel.
        c.set_active_is_multidimensional(false, &[2, 2], &[1, 1]);
        assert!(!c.active_is_multidimensional());
        assert!(!c.is_active_at(&[0, 0]));
    }

    #[test]
    fn flat_values_expand_parameters_in_order() {
        let mut c = Component::gaussian();
        c.parameter_mut("A").unwrap().set_value(2.0).unwrap();
        c.parameter_mut("centre").unwrap().set_value(3.0).unwrap();
        c.parameter_mut("sigma").unwrap().set_value(4.0).unwrap();
        assert_eq!(c.flat_values(), vec![2.0, 3.0, 4.0]);
        assert_eq!(c.n_flat(), 3);
    }
}

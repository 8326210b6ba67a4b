use crate::axis::SpanRoi;
use crate::component::{Activity, Component, ComponentFunction};
use crate::error::ModelError;
use crate::fit::{FitProblem, FitResult, Minimizer, solve_linear_system};
use crate::loss::LossFunction;
use crate::parameter::{ParamId, TwinLink};
use crate::signal::Signal;

use ndarray::{Array1, Array2, ArrayD, ArrayView1, IxDyn};
use std::collections::HashMap;
use std::ops::Index;

/// Per-slot bound description in the per-side-limited form expected by
/// bounded minimizers: a missing bound is unlimited on that side only.
#[derive(Clone, Debug, PartialEq)]
pub struct BoundInfo {
    pub limited: (bool, bool),
    pub limits: (f64, f64),
}

/// Per-pixel outcome summary of [`Model::multifit`].
#[derive(Clone, Debug, Default)]
pub struct MultifitResult {
    pub succeeded: usize,
    pub failed: Vec<Vec<usize>>,
}

/// An ordered, uniquely named collection of components bound to one signal.
///
/// The model owns the free-parameter vector, the active-channel mask and the
/// per-pixel fit-result maps, assembles the composite function, residual and
/// Jacobian from the active component set, and drives the per-pixel fit loop.
#[derive(Clone, Debug)]
pub struct Model {
    components: Vec<Component>,
    signal: Signal,
    channel_switches: Array1<bool>,
    p0: Vec<f64>,
    free_parameters_boundaries: Vec<(Option<f64>, Option<f64>)>,
}

impl Model {
    pub fn new(signal: Signal) -> Self {
        let channel_switches = Array1::from_elem(signal.signal_len(), true);
        Self {
            components: Vec::new(),
            signal,
            channel_switches,
            p0: Vec::new(),
            free_parameters_boundaries: Vec::new(),
        }
    }

    pub fn signal(&self) -> &Signal {
        &self.signal
    }

    pub fn signal_mut(&mut self) -> &mut Signal {
        &mut self.signal
    }

    pub fn channel_switches(&self) -> &Array1<bool> {
        &self.channel_switches
    }

    pub fn len(&self) -> usize {
        self.components.len()
    }

    pub fn is_empty(&self) -> bool {
        self.components.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Component> {
        self.components.iter()
    }

    pub fn get(&self, index: usize) -> Option<&Component> {
        self.components.get(index)
    }

    pub fn get_mut(&mut self, index: usize) -> Option<&mut Component> {
        self.components.get_mut(index)
    }

    /// Position of a component instance (compared by identity).
    pub fn index_of(&self, component: &Component) -> Option<usize> {
        self.components.iter().position(|c| c.id() == component.id())
    }

    fn resolve_name(&self, name: &str) -> Result<usize, ModelError> {
        let matches: Vec<usize> = self
            .components
            .iter()
            .enumerate()
            .filter(|(_, c)| c.name() == name)
            .map(|(i, _)| i)
            .collect();
        match matches.as_slice() {
            [i] => Ok(*i),
            _ => Err(ModelError::ComponentLookup {
                name: name.to_owned(),
                n_matches: matches.len(),
            }),
        }
    }

    /// Component lookup by name; fails when the name is absent or held by
    /// more than one component (collisions are only permitted transiently).
    pub fn component(&self, name: &str) -> Result<&Component, ModelError> {
        let i = self.resolve_name(name)?;
        Ok(&self.components[i])
    }

    pub fn component_mut(&mut self, name: &str) -> Result<&mut Component, ModelError> {
        let i = self.resolve_name(name)?;
        Ok(&mut self.components[i])
    }

    fn unique_name(&self, base: &str) -> String {
        if !self.components.iter().any(|c| c.name() == base) {
            return base.to_owned();
        }
        let mut k = 0;
        loop {
            let candidate = format!("{base}_{k}");
            if !self.components.iter().any(|c| c.name() == candidate) {
                return candidate;
            }
            k += 1;
        }
    }

    /// Appends a component, assigning a unique name and allocating per-pixel
    /// parameter maps over the signal's navigation shape.
    pub fn append(&mut self, mut component: Component) -> Result<(), ModelError> {
        if self.components.iter().any(|c| c.id() == component.id()) {
            return Err(ModelError::DuplicateComponent {
                name: component.name().to_owned(),
            });
        }
        let name = self.unique_name(component.name());
        component.name = name;
        let nav_shape = self.signal.nav_shape().to_vec();
        for p in component.parameters_mut() {
            p.ensure_map(&nav_shape);
        }
        self.components.push(component);
        Ok(())
    }

    pub fn extend(
        &mut self,
        components: impl IntoIterator<Item = Component>,
    ) -> Result<(), ModelError> {
        for c in components {
            self.append(c)?;
        }
        Ok(())
    }

    /// Detaches the component at `index`, breaking all twin links into and
    /// out of its parameters, and returns it.
    pub fn remove(&mut self, index: usize) -> Component {
        let mut removed = self.detach(&[index]);
        debug_assert_eq!(removed.len(), 1);
        removed.swap_remove(0)
    }

    pub fn remove_by_name(&mut self, name: &str) -> Result<Component, ModelError> {
        let i = self.resolve_name(name)?;
        Ok(self.remove(i))
    }

    /// Detaches a component addressed by identity.
    pub fn remove_component(&mut self, component: &Component) -> Result<Component, ModelError> {
        let i = self
            .index_of(component)
            .ok_or_else(|| ModelError::ComponentLookup {
                name: component.name().to_owned(),
                n_matches: 0,
            })?;
        Ok(self.remove(i))
    }

    /// Slice deletion: detaches `range` and returns the removed components.
    pub fn remove_range(&mut self, range: std::ops::Range<usize>) -> Vec<Component> {
        let indices: Vec<usize> = range.collect();
        self.detach(&indices)
    }

    fn detach(&mut self, indices: &[usize]) -> Vec<Component> {
        let removed_param_ids: Vec<ParamId> = indices
            .iter()
            .flat_map(|&ci| self.components[ci].parameters().iter().map(|p| p.id()))
            .collect();

        // Remaining parameters twinned into the removed set become
        // independent, snapshotting their computed value while the whole
        // chain is still resolvable.
        let mut to_break = Vec::new();
        for (ci, c) in self.components.iter().enumerate() {
            if indices.contains(&ci) {
                continue;
            }
            for p in c.parameters() {
                if let Some(link) = p.twin() {
                    if removed_param_ids.contains(&link.target) {
                        to_break.push(p.id());
                    }
                }
            }
        }
        for id in to_break {
            // Ids were just collected from the model, break cannot fail.
            let _ = self.break_twin(id);
        }

        // Remaining back-references into the removed set.
        for (ci, c) in self.components.iter_mut().enumerate() {
            if indices.contains(&ci) {
                continue;
            }
            for p in c.parameters_mut() {
                p.twins_in.retain(|id| !removed_param_ids.contains(id));
            }
        }

        let mut order: Vec<usize> = indices.to_vec();
        order.sort_unstable();
        let mut removed = Vec::with_capacity(order.len());
        for &ci in order.iter().rev() {
            removed.push(self.components.remove(ci));
        }
        removed.reverse();
        for c in &mut removed {
            for p in c.parameters_mut() {
                p.twin = None;
                p.twins_in.clear();
            }
        }
        removed
    }

    fn find_param(&self, id: ParamId) -> Result<(usize, usize), ModelError> {
        for (ci, c) in self.components.iter().enumerate() {
            if let Some(pi) = c.parameters().iter().position(|p| p.id() == id) {
                return Ok((ci, pi));
            }
        }
        Err(ModelError::ParameterNotFound { id })
    }

    fn param_path(&self, ci: usize, pi: usize) -> String {
        format!(
            "{}.{}",
            self.components[ci].name(),
            self.components[ci].parameters()[pi].name()
        )
    }

    /// Id of a parameter addressed as `component_name.parameter_name`.
    pub fn param_id(&self, component: &str, parameter: &str) -> Option<ParamId> {
        self.component(component)
            .ok()?
            .parameter(parameter)
            .map(|p| p.id())
    }

    /// Same-value twin: `follower`'s value becomes derived from `leader`'s
    /// and `follower` leaves the free vector.
    pub fn set_twin(&mut self, follower: ParamId, leader: ParamId) -> Result<(), ModelError> {
        self.set_twin_linear(follower, leader, 1.0, 0.0)
    }

    /// Linear-relation twin: follower value = `slope * leader + intercept`.
    ///
    /// Fails before any mutation when the link would close a cycle.
    pub fn set_twin_linear(
        &mut self,
        follower: ParamId,
        leader: ParamId,
        slope: f64,
        intercept: f64,
    ) -> Result<(), ModelError> {
        let (fc, fp) = self.find_param(follower)?;
        let (lc, lp) = self.find_param(leader)?;
        let n_follower = self.components[fc].parameters()[fp].n_elements();
        let n_leader = self.components[lc].parameters()[lp].n_elements();
        if n_follower != n_leader {
            return Err(ModelError::ShapeMismatch {
                expected: vec![n_follower],
                actual: vec![n_leader],
            });
        }

        // Walk the forward chain from the leader; reaching the follower
        // means the new link would close a cycle.
        let mut cursor = Some(leader);
        while let Some(id) = cursor {
            if id == follower {
                return Err(ModelError::TwinCycle {
                    follower: self.param_path(fc, fp),
                    leader: self.param_path(lc, lp),
                });
            }
            let (ci, pi) = self.find_param(id)?;
            cursor = self.components[ci].parameters()[pi].twin().map(|l| l.target);
        }

        if self.components[fc].parameters()[fp].is_twinned() {
            self.break_twin(follower)?;
        }
        self.components[fc].parameters_mut()[fp].twin =
            Some(TwinLink::linear(leader, slope, intercept));
        self.components[lc].parameters_mut()[lp].twins_in.insert(follower);
        Ok(())
    }

    /// Restores a twinned parameter's independence, snapshotting the
    /// computed value at break time.
    pub fn break_twin(&mut self, follower: ParamId) -> Result<(), ModelError> {
        let (ci, pi) = self.find_param(follower)?;
        let Some(link) = self.components[ci].parameters()[pi].twin().copied() else {
            return Ok(());
        };
        let values = self.resolved_values(follower)?;
        let param = &mut self.components[ci].parameters_mut()[pi];
        param.twin = None;
        param.assign_values(&values);
        if let Ok((lc, lp)) = self.find_param(link.target) {
            self.components[lc].parameters_mut()[lp].twins_in.remove(&follower);
        }
        Ok(())
    }

    /// Current value of a parameter with twin links resolved transitively.
    pub fn resolved_values(&self, id: ParamId) -> Result<Vec<f64>, ModelError> {
        let (ci, pi) = self.find_param(id)?;
        let param = &self.components[ci].parameters()[pi];
        match param.twin() {
            None => Ok(param.values().to_vec()),
            Some(link) => {
                let base = self.resolved_values(link.target)?;
                Ok(base.iter().map(|&v| link.apply(v)).collect())
            }
        }
    }

    /// Sets a parameter value through the model; rejected while twinned.
    pub fn set_parameter_value(&mut self, id: ParamId, value: f64) -> Result<(), ModelError> {
        let (ci, pi) = self.find_param(id)?;
        self.components[ci].parameters_mut()[pi].set_value(value)
    }

    /// Free-vector slots in the fixed deterministic order: components in
    /// model order, parameters in component order, included iff free,
    /// untwinned and the component is active at the current pixel.
    fn free_slots(&self) -> Vec<(usize, usize)> {
        let nav = self.signal.nav_index();
        let mut slots = Vec::new();
        for (ci, c) in self.components.iter().enumerate() {
            if !c.is_active_at(nav) {
                continue;
            }
            for (pi, p) in c.parameters().iter().enumerate() {
                if p.free && !p.is_twinned() {
                    slots.push((ci, pi));
                }
            }
        }
        slots
    }

    /// Length of the free-parameter vector at the current pixel.
    pub fn n_free(&self) -> usize {
        self.free_slots()
            .iter()
            .map(|&(ci, pi)| self.components[ci].parameters()[pi].n_elements())
            .sum()
    }

    /// Rebuilds the cached free-parameter vector from the current values.
    pub fn set_p0(&mut self) {
        let mut p0 = Vec::with_capacity(self.n_free());
        for (ci, pi) in self.free_slots() {
            p0.extend_from_slice(self.components[ci].parameters()[pi].values());
        }
        self.p0 = p0;
    }

    pub fn p0(&self) -> &[f64] {
        &self.p0
    }

    /// Scatters a flat vector back into the free parameters, in `set_p0`
    /// order. Surplus trailing entries are ignored.
    pub fn fetch_values_from_p0(&mut self, p: &[f64]) {
        let mut pos = 0;
        for (ci, pi) in self.free_slots() {
            let param = &mut self.components[ci].parameters_mut()[pi];
            let n = param.n_elements();
            if pos + n > p.len() {
                break;
            }
            param.assign_values(&p[pos..pos + n]);
            pos += n;
        }
    }

    /// Rebuilds the per-slot bound list, in `set_p0` order.
    pub fn set_boundaries(&mut self) {
        let mut bounds = Vec::with_capacity(self.n_free());
        for (ci, pi) in self.free_slots() {
            let param = &self.components[ci].parameters()[pi];
            for _ in 0..param.n_elements() {
                bounds.push((param.bmin, param.bmax));
            }
        }
        self.free_parameters_boundaries = bounds;
    }

    pub fn free_parameters_boundaries(&self) -> &[(Option<f64>, Option<f64>)] {
        &self.free_parameters_boundaries
    }

    /// Bound list in the per-side-limited form, in `set_p0` order.
    pub fn bound_infos(&self) -> Vec<BoundInfo> {
        let mut infos = Vec::with_capacity(self.n_free());
        for (ci, pi) in self.free_slots() {
            let param = &self.components[ci].parameters()[pi];
            for _ in 0..param.n_elements() {
                infos.push(BoundInfo {
                    limited: (param.bmin.is_some(), param.bmax.is_some()),
                    limits: (param.bmin.unwrap_or(0.0), param.bmax.unwrap_or(0.0)),
                });
            }
        }
        infos
    }

    /// Clamps every parameter into its bounds, free or not, active or not.
    /// A standalone consistency pass, independent of fitting.
    pub fn ensure_parameters_in_bounds(&mut self) {
        for c in &mut self.components {
            for p in c.parameters_mut() {
                p.clamp_to_bounds();
            }
        }
    }

    fn effective_values_with(
        &self,
        ci: usize,
        overrides: &HashMap<ParamId, Vec<f64>>,
    ) -> Vec<f64> {
        let c = &self.components[ci];
        let mut values = Vec::with_capacity(c.n_flat());
        for p in c.parameters() {
            values.extend(self.resolve_with(p.id(), overrides));
        }
        values
    }

    fn resolve_with(&self, id: ParamId, overrides: &HashMap<ParamId, Vec<f64>>) -> Vec<f64> {
        if let Some(v) = overrides.get(&id) {
            return v.clone();
        }
        let Ok((ci, pi)) = self.find_param(id) else {
            return Vec::new();
        };
        let param = &self.components[ci].parameters()[pi];
        match param.twin() {
            None => param.values().to_vec(),
            Some(link) => self
                .resolve_with(link.target, overrides)
                .iter()
                .map(|&v| link.apply(v))
                .collect(),
        }
    }

    /// Composite model over the full signal axis at the current navigation
    /// position: sum of component values (all components, or only the
    /// pixel-active ones), scaled by the channel width for a binned axis.
    pub fn current_data(&self, only_active: bool) -> Array1<f64> {
        let x = self.signal.axis.axis();
        let no_overrides = HashMap::new();
        let mut sum = Array1::zeros(x.len());
        for (ci, c) in self.components.iter().enumerate() {
            if only_active && !c.is_active_at(self.signal.nav_index()) {
                continue;
            }
            let values = self.effective_values_with(ci, &no_overrides);
            for (j, &xv) in x.iter().enumerate() {
                sum[j] += c.kind().value(&values, xv);
            }
        }
        if self.signal.axis.is_binned {
            sum *= &self.signal.axis.channel_widths();
        }
        sum
    }

    /// Commits `p` to the free parameters and returns the composite values
    /// over the active channels only.
    pub fn model_function(&mut self, p: &[f64]) -> Array1<f64> {
        self.fetch_values_from_p0(p);
        let full = self.current_data(true);
        self.select_active(full.view())
    }

    fn select_active(&self, full: ArrayView1<f64>) -> Array1<f64> {
        Array1::from_iter(
            full.iter()
                .zip(&self.channel_switches)
                .filter_map(|(&v, &on)| on.then_some(v)),
        )
    }

    fn active_axis_values(&self) -> Vec<f64> {
        self.signal
            .axis
            .axis()
            .iter()
            .zip(&self.channel_switches)
            .filter_map(|(&x, &on)| on.then_some(x))
            .collect()
    }

    /// Current composite mapped onto the full channel axis: non-active
    /// channels become NaN, or are omitted (shorter array) when
    /// `out_of_range_to_nan` is false.
    pub fn to_plot_array(&self, out_of_range_to_nan: bool) -> Array1<f64> {
        let full = self.current_data(true);
        if out_of_range_to_nan {
            Array1::from_iter(
                full.iter()
                    .zip(&self.channel_switches)
                    .map(|(&v, &on)| if on { v } else { f64::NAN }),
            )
        } else {
            self.select_active(full.view())
        }
    }

    /// Weighted residual `(data - model(p))` over the active channels.
    pub fn residual(
        &mut self,
        p: &[f64],
        data: ArrayView1<f64>,
        weights: Option<ArrayView1<f64>>,
    ) -> Array1<f64> {
        let model = self.model_function(p);
        let mut r = &data - &model;
        if let Some(w) = weights {
            r *= &w;
        }
        r
    }

    /// Weighted sum of squared residuals, the scalar objective for
    /// non-gradient minimizers.
    pub fn residual_sq(
        &mut self,
        p: &[f64],
        data: ArrayView1<f64>,
        weights: Option<ArrayView1<f64>>,
    ) -> f64 {
        let r = self.residual(p, data, weights);
        r.dot(&r)
    }

    /// Composite Jacobian: one row per free-vector slot element, one column
    /// per active channel. A twinned parameter's analytic gradient is summed
    /// into its chain root's row with the chain-rule slope factor. Rows are
    /// scaled by `weights` when given.
    ///
    /// Evaluates `p` through an override table; parameter state is not
    /// mutated.
    pub fn jacobian(&self, p: &[f64], weights: Option<ArrayView1<f64>>) -> Array2<f64> {
        let nav = self.signal.nav_index().to_vec();
        let slots = self.free_slots();

        let mut overrides: HashMap<ParamId, Vec<f64>> = HashMap::new();
        let mut row_start: HashMap<ParamId, usize> = HashMap::new();
        let mut n_rows = 0;
        let mut pos = 0;
        for &(ci, pi) in &slots {
            let param = &self.components[ci].parameters()[pi];
            let n = param.n_elements();
            if pos + n <= p.len() {
                overrides.insert(param.id(), p[pos..pos + n].to_vec());
            }
            pos += n;
            row_start.insert(param.id(), n_rows);
            n_rows += n;
        }

        let x = self.active_axis_values();
        let widths = self
            .signal
            .axis
            .is_binned
            .then(|| self.signal.axis.channel_widths());
        let active_widths: Option<Vec<f64>> = widths.map(|w| {
            w.iter()
                .zip(&self.channel_switches)
                .filter_map(|(&w, &on)| on.then_some(w))
                .collect()
        });

        let mut jac = Array2::zeros((n_rows, x.len()));
        for (ci, c) in self.components.iter().enumerate() {
            if !c.is_active_at(&nav) {
                continue;
            }
            let values = self.effective_values_with(ci, &overrides);
            let mut grad = vec![0.0; values.len()];
            for (j, &xv) in x.iter().enumerate() {
                c.kind().gradient(&values, xv, &mut grad);
                let mut flat = 0;
                for p in c.parameters() {
                    let n = p.n_elements();
                    if let Some((root, factor)) = self.slot_root(p.id()) {
                        if let Some(&start) = row_start.get(&root) {
                            let scale = factor * active_widths.as_ref().map_or(1.0, |w| w[j]);
                            for e in 0..n {
                                jac[[start + e, j]] += scale * grad[flat + e];
                            }
                        }
                    }
                    flat += n;
                }
            }
        }

        if let Some(w) = weights {
            jac = jac * &w;
        }
        jac
    }

    /// Chain root of a parameter's twin chain and the accumulated
    /// chain-rule slope; `None` for a fixed, untwinned parameter.
    fn slot_root(&self, id: ParamId) -> Option<(ParamId, f64)> {
        let mut factor = 1.0;
        let mut cursor = id;
        loop {
            let (ci, pi) = self.find_param(cursor).ok()?;
            let param = &self.components[ci].parameters()[pi];
            match param.twin() {
                Some(link) => {
                    factor *= link.slope;
                    cursor = link.target;
                }
                None => return param.free.then_some((cursor, factor)),
            }
        }
    }

    /// Gradient of the selected scalar objective at `p`.
    ///
    /// Commits `p` (via [`Self::model_function`]) like any objective
    /// evaluation would.
    pub fn loss_gradient(
        &mut self,
        loss: LossFunction,
        p: &[f64],
        data: ArrayView1<f64>,
        weights: Option<ArrayView1<f64>>,
    ) -> Array1<f64> {
        let model = self.model_function(p);
        let mut residual = &data - &model;
        if let Some(w) = &weights {
            residual *= w;
        }
        let jac = self.jacobian(p, weights);
        loss.gradient(jac.view(), residual.view(), data, model.view())
    }

    /// Single fit at the current navigation position.
    ///
    /// Builds `p0` and bounds, runs the minimizer, and on convergence
    /// commits the result, estimates parameter standard errors from the
    /// curvature and stores both into the pixel's parameter maps. On
    /// non-convergence returns [`ModelError::FitNotConverged`]; prior values
    /// are the last ones attempted by the minimizer and must be treated as
    /// scratch until recommitted.
    pub fn fit(
        &mut self,
        minimizer: &dyn Minimizer,
        weights: Option<&Array1<f64>>,
    ) -> Result<FitResult, ModelError> {
        if let Some(w) = weights {
            if w.len() != self.signal.signal_len() {
                return Err(ModelError::MaskLengthMismatch {
                    expected: self.signal.signal_len(),
                    actual: w.len(),
                });
            }
        }
        let data = self.select_active(self.signal.current_data());
        let weights_active = weights.map(|w| self.select_active(w.view()));
        let weights_for_stds = weights_active.clone();

        self.set_p0();
        self.set_boundaries();
        let p0 = self.p0.clone();
        let bounds = self.free_parameters_boundaries.clone();

        let mut problem = ModelProblem {
            model: self,
            data,
            weights: weights_active,
        };
        let result = minimizer.minimize(&mut problem, &p0, &bounds);
        if !result.converged {
            return Err(ModelError::FitNotConverged {
                position: self.signal.nav_index().to_vec(),
                n_iter: result.n_iter,
            });
        }
        self.fetch_values_from_p0(&result.p);
        self.p0 = result.p.clone();
        self.update_stds(
            &result.p,
            weights_for_stds.as_ref().map(|w| w.view()),
            result.cost,
        );
        self.store_current_values();
        Ok(result)
    }

    /// Standard errors from the Gauss-Newton curvature at the solution:
    /// `sqrt(sigma^2 * diag((J J^T)^-1))` with the residual variance
    /// estimated from the final cost. Left untouched when the system is
    /// under-determined or singular.
    fn update_stds(&mut self, p: &[f64], weights: Option<ArrayView1<f64>>, cost: f64) {
        let jac = self.jacobian(p, weights);
        let (n_rows, n_cols) = jac.dim();
        if n_rows == 0 || n_cols <= n_rows {
            return;
        }
        let gram = jac.dot(&jac.t());
        let sigma2 = cost / (n_cols - n_rows) as f64;
        let mut diag = Vec::with_capacity(n_rows);
        for i in 0..n_rows {
            let mut e = Array1::zeros(n_rows);
            e[i] = 1.0;
            match solve_linear_system(gram.clone(), e) {
                Some(col) => diag.push(col[i]),
                None => return,
            }
        }
        let mut pos = 0;
        for (ci, pi) in self.free_slots() {
            let param = &mut self.components[ci].parameters_mut()[pi];
            param.std = diag.get(pos).map(|&d| (sigma2 * d).max(0.0).sqrt());
            pos += param.n_elements();
        }
    }

    /// Full-dataset loop: fits every navigation pixel (row-major, optionally
    /// limited by `nav_mask`), recording per-pixel success or failure.
    ///
    /// Stored map values, where set, seed each pixel's starting guess.
    pub fn multifit(
        &mut self,
        minimizer: &dyn Minimizer,
        weights: Option<&Array1<f64>>,
        nav_mask: Option<&ArrayD<bool>>,
    ) -> Result<MultifitResult, ModelError> {
        if let Some(mask) = nav_mask {
            if mask.shape() != self.signal.nav_shape() {
                return Err(ModelError::ShapeMismatch {
                    expected: self.signal.nav_shape().to_vec(),
                    actual: mask.shape().to_vec(),
                });
            }
        }
        let indices: Vec<Vec<usize>> = self.signal.nav_indices().collect();
        let mut result = MultifitResult::default();
        for index in indices {
            if let Some(mask) = nav_mask {
                if !mask[IxDyn(&index)] {
                    continue;
                }
            }
            self.signal.set_nav_index(&index)?;
            self.fetch_stored_values();
            match self.fit(minimizer, weights) {
                Ok(_) => result.succeeded += 1,
                Err(ModelError::FitNotConverged { .. }) => result.failed.push(index),
                Err(e) => return Err(e),
            }
        }
        Ok(result)
    }

    /// Writes every pixel-active component's current values and stds into
    /// its maps at the current position. Inactive components are skipped;
    /// their stored entry at this pixel is left untouched, not zeroed.
    pub fn store_current_values(&mut self) {
        let nav = self.signal.nav_index().to_vec();
        for c in &mut self.components {
            if !c.is_active_at(&nav) {
                continue;
            }
            for p in c.parameters_mut() {
                p.store_to_map(&nav);
            }
        }
    }

    /// Loads the map entries at the current position into the current
    /// values, where set.
    pub fn fetch_stored_values(&mut self) {
        let nav = self.signal.nav_index().to_vec();
        for c in &mut self.components {
            for p in c.parameters_mut() {
                p.fetch_from_map(&nav);
            }
        }
    }

    /// Writes the current values of the listed components (all, when `None`)
    /// into their maps at every navigation pixel.
    pub fn assign_current_values_to_all(&mut self, component_indices: Option<&[usize]>) {
        let indices: Vec<Vec<usize>> = self.signal.nav_indices().collect();
        for (ci, c) in self.components.iter_mut().enumerate() {
            if let Some(list) = component_indices {
                if !list.contains(&ci) {
                    continue;
                }
            }
            for p in c.parameters_mut() {
                for nav in &indices {
                    p.store_to_map(nav);
                }
            }
        }
    }

    /// Scatters `values` (and optional stds) into the free, untwinned
    /// parameters of every component, in model order.
    pub fn fetch_values_from_array(&mut self, values: &[f64], stds: Option<&[f64]>) {
        let mut pos = 0;
        for c in &mut self.components {
            for p in c.parameters_mut() {
                if !p.free || p.is_twinned() {
                    continue;
                }
                let n = p.n_elements();
                if pos + n > values.len() {
                    return;
                }
                p.assign_values(&values[pos..pos + n]);
                if let Some(stds) = stds {
                    p.std = stds.get(pos).copied();
                }
                pos += n;
            }
        }
    }

    /// Reconstructs a full signal by re-evaluating the composite at every
    /// navigation pixel from the stored maps, restricted to
    /// `component_indices` when given. Non-active channels become NaN when
    /// `out_of_range_to_nan`.
    pub fn as_signal(
        &mut self,
        component_indices: Option<&[usize]>,
        out_of_range_to_nan: bool,
    ) -> Result<Signal, ModelError> {
        let mut out = self.signal.clone();
        out.data_mut().fill(0.0);
        self.as_signal_into(component_indices, out_of_range_to_nan, &mut out)?;
        Ok(out)
    }

    /// In-place variant of [`Self::as_signal`] writing into a caller-supplied
    /// output signal of identical shape.
    pub fn as_signal_into(
        &mut self,
        component_indices: Option<&[usize]>,
        out_of_range_to_nan: bool,
        out: &mut Signal,
    ) -> Result<(), ModelError> {
        if out.data().shape() != self.signal.data().shape() {
            return Err(ModelError::ShapeMismatch {
                expected: self.signal.data().shape().to_vec(),
                actual: out.data().shape().to_vec(),
            });
        }
        let saved_nav = self.signal.nav_index().to_vec();
        let saved_active: Vec<Activity> =
            self.components.iter().map(|c| c.active_state()).collect();
        if let Some(list) = component_indices {
            for (ci, c) in self.components.iter_mut().enumerate() {
                if !list.contains(&ci) {
                    c.restore_active_state(Activity::Scalar(false));
                }
            }
        }

        let indices: Vec<Vec<usize>> = self.signal.nav_indices().collect();
        for index in indices {
            self.signal.set_nav_index(&index)?;
            self.fetch_stored_values();
            let values = self.current_data(true);
            let mut row = out.view_at_mut(&index);
            for (j, &v) in values.iter().enumerate() {
                if self.channel_switches[j] {
                    row[j] = v;
                } else if out_of_range_to_nan {
                    row[j] = f64::NAN;
                }
            }
        }

        for (c, state) in self.components.iter_mut().zip(saved_active) {
            c.restore_active_state(state);
        }
        self.signal.set_nav_index(&saved_nav)?;
        self.fetch_stored_values();
        Ok(())
    }

    /// Converts a physical signal range into index bounds, honoring axis
    /// direction.
    pub fn parse_signal_range_values(&self, x1: f64, x2: f64) -> Result<(usize, usize), ModelError> {
        self.signal.axis.value_range_to_indices(x1, x2)
    }

    pub fn parse_signal_range_roi(&self, roi: &SpanRoi) -> Result<(usize, usize), ModelError> {
        self.parse_signal_range_values(roi.left, roi.right)
    }

    /// Limits the fit to the channels inside the physical range.
    pub fn set_signal_range(&mut self, x1: f64, x2: f64) -> Result<(), ModelError> {
        let (i1, i2) = self.parse_signal_range_values(x1, x2)?;
        self.channel_switches.fill(false);
        self.channel_switches.slice_mut(ndarray::s![i1..=i2]).fill(true);
        Ok(())
    }

    pub fn reset_signal_range(&mut self) {
        self.channel_switches.fill(true);
    }

    /// Replaces the active-channel mask wholesale.
    pub fn set_signal_range_from_mask(&mut self, mask: &Array1<bool>) -> Result<(), ModelError> {
        if mask.len() != self.signal.signal_len() {
            return Err(ModelError::MaskLengthMismatch {
                expected: self.signal.signal_len(),
                actual: mask.len(),
            });
        }
        self.channel_switches = mask.clone();
        Ok(())
    }

    /// Runs the component's kind-specific initial-guess routine over the
    /// physical range `[x1, x2)`.
    pub fn estimate_parameters(
        &mut self,
        index: usize,
        x1: f64,
        x2: f64,
        only_current: bool,
    ) -> Result<bool, ModelError> {
        let Self {
            components, signal, ..
        } = self;
        components[index].estimate_parameters(signal, x1, x2, only_current)
    }
}

impl Index<usize> for Model {
    type Output = Component;

    fn index(&self, index: usize) -> &Component {
        &self.components[index]
    }
}

struct ModelProblem<'a> {
    model: &'a mut Model,
    data: Array1<f64>,
    weights: Option<Array1<f64>>,
}

impl FitProblem for ModelProblem<'_> {
    fn residuals(&mut self, p: &[f64]) -> Array1<f64> {
        self.model
            .residual(p, self.data.view(), self.weights.as_ref().map(|w| w.view()))
    }

    fn jacobian(&mut self, p: &[f64]) -> Array2<f64> {
        self.model
            .jacobian(p, self.weights.as_ref().map(|w| w.view()))
    }
}

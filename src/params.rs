//! Parameter management: scalar, stochastic, discrete and discretized
//! parameter registries, AD seeding, bounds, and regularization definitions.
//!
//! Scalar groups live as shared-read arrays with explicit `update_params`
//! transitions; the AD-seeded copy is regenerated from scratch on each
//! `sacadoize_params` call. Discretized (field) parameters carry their own
//! DOF manager and distributed value vector.

use std::io::Write;
use std::sync::Arc;

use log::debug;

use crate::ad::{cst, seeded, Ad};
use crate::dofs::DofManager;
use crate::error::{ConfigError, ConsistencyError, SimError};
use crate::functions::parser::{parse, PointContext};
use crate::linalg::DistMultiVector;
use crate::settings::{
    Distribution, ParameterSetting, ParameterUsage, RegularizationKind, Settings,
};

#[derive(Debug, Clone)]
pub struct ScalarParamGroup {
    pub name: String,
    pub usage: ParameterUsage,
    pub values: Vec<f64>,
    pub bounds: Option<(f64, f64)>,
    pub distribution: Option<Distribution>,
}

#[derive(Debug, Clone)]
pub struct DiscretizedSpec {
    pub name: String,
    pub order: usize,
    pub initial_value: f64,
    pub bounds: Option<(f64, f64)>,
}

#[derive(Debug, Clone)]
pub struct RegularizationTerm {
    /// Index of the discretized field being regularized.
    pub field: usize,
    pub kind: RegularizationKind,
    pub constant: f64,
    pub side_set: Option<String>,
}

#[derive(Debug)]
pub struct ParameterManager {
    pub groups: Vec<ScalarParamGroup>,
    /// Sacadoized copies, regenerated on every seeding transition.
    pub ad_values: Vec<Vec<Ad>>,
    pub num_active_params: usize,
    /// Active slot of each (group, component), if the group is active.
    active_slots: Vec<Vec<Option<usize>>>,

    pub discretized: Vec<DiscretizedSpec>,
    /// Numbering for the discretized fields; present when any exist.
    pub dofs: Option<DofManager>,
    /// Ghosted field values, one column.
    pub psol: Option<DistMultiVector>,
    pub lower_bounds: Option<DistMultiVector>,
    pub upper_bounds: Option<DistMultiVector>,
    pub regularization: Vec<RegularizationTerm>,
}

impl ParameterManager {
    pub fn from_settings(settings: &Settings) -> Result<Self, SimError> {
        let mut groups = Vec::new();
        let mut discretized = Vec::new();
        let mut regularization = Vec::new();

        for p in &settings.parameters {
            validate_parameter(p)?;
            if p.usage == ParameterUsage::Discretized {
                if let Some(reg) = &p.regularization {
                    regularization.push(RegularizationTerm {
                        field: discretized.len(),
                        kind: reg.kind,
                        constant: reg.constant,
                        side_set: reg.side_set.clone(),
                    });
                }
                discretized.push(DiscretizedSpec {
                    name: p.name.clone(),
                    order: p.order,
                    initial_value: p.value.first().copied().unwrap_or(0.0),
                    bounds: p.bounds,
                });
            } else {
                groups.push(ScalarParamGroup {
                    name: p.name.clone(),
                    usage: p.usage,
                    values: p.value.clone(),
                    bounds: p.bounds,
                    distribution: p.distribution,
                });
            }
        }

        let num_active_params = groups
            .iter()
            .filter(|g| g.usage == ParameterUsage::Active)
            .map(|g| g.values.len())
            .sum();

        let mut manager = Self {
            groups,
            ad_values: Vec::new(),
            num_active_params,
            active_slots: Vec::new(),
            discretized,
            dofs: None,
            psol: None,
            lower_bounds: None,
            upper_bounds: None,
            regularization,
        };
        manager.rebuild_active_slots();
        manager.sacadoize_params(false);
        Ok(manager)
    }

    fn rebuild_active_slots(&mut self) {
        let mut slot = 0usize;
        self.active_slots = self
            .groups
            .iter()
            .map(|g| {
                g.values
                    .iter()
                    .map(|_| {
                        if g.usage == ParameterUsage::Active {
                            let s = slot;
                            slot += 1;
                            Some(s)
                        } else {
                            None
                        }
                    })
                    .collect()
            })
            .collect();
    }

    /// Regenerates the AD copies of all scalar parameters. With `seed_active`,
    /// active parameters occupy derivative slots [0, num_active_params).
    pub fn sacadoize_params(&mut self, seed_active: bool) {
        self.sacadoize_with(seed_active, self.num_active_params);
    }

    /// Seeding with an explicit derivative width, for passes that append
    /// further slots (e.g. local parameter DOFs in the objective quadrature).
    pub fn sacadoize_with(&mut self, seed_active: bool, width: usize) {
        self.ad_values = self
            .groups
            .iter()
            .enumerate()
            .map(|(g, group)| {
                group
                    .values
                    .iter()
                    .enumerate()
                    .map(|(j, &v)| match self.active_slots[g][j] {
                        Some(slot) if seed_active => seeded(width, slot, v),
                        _ => cst(v),
                    })
                    .collect()
            })
            .collect();
    }

    /// Attaches the discretized-field numbering and initializes values and
    /// bound arrays.
    pub fn init_discretized(&mut self, dofs: DofManager) {
        let ghosted = dofs.ghosted.clone();
        let mut psol = DistMultiVector::new(ghosted.clone(), 1);
        let mut lower = DistMultiVector::new(ghosted.clone(), 1);
        let mut upper = DistMultiVector::new(ghosted, 1);
        lower.put_scalar(f64::NEG_INFINITY);
        upper.put_scalar(f64::INFINITY);

        for block in &dofs.blocks {
            for (v, lattice) in block.lattices.iter().enumerate() {
                let spec = &self.discretized[v];
                for node in 0..lattice.num_nodes {
                    let gid = block.var_base[v] + node;
                    let lid = dofs.ghosted.lid(gid).unwrap();
                    psol.values[(lid, 0)] = spec.initial_value;
                    if let Some((lo, hi)) = spec.bounds {
                        lower.values[(lid, 0)] = lo;
                        upper.values[(lid, 0)] = hi;
                    }
                }
            }
        }

        self.psol = Some(psol);
        self.lower_bounds = Some(lower);
        self.upper_bounds = Some(upper);
        self.dofs = Some(dofs);
    }

    /// Interpolates an expression of x, y, z (and scalar parameters) onto a
    /// discretized field's nodes.
    pub fn set_discretized_from_expr(
        &mut self,
        field: &str,
        source: &str,
        time: f64,
    ) -> Result<(), SimError> {
        let v = self
            .discretized
            .iter()
            .position(|d| d.name == field)
            .ok_or_else(|| ConsistencyError::BadParameter {
                name: field.to_string(),
                reason: "not a discretized parameter".to_string(),
            })?;
        let expr = parse(source).map_err(|reason| ConfigError::BadExpression {
            name: field.to_string(),
            reason,
        })?;
        let dofs = self.dofs.as_ref().expect("discretized numbering attached");
        let psol = self.psol.as_mut().expect("discretized values attached");
        let lookup = scalar_lookup(&self.groups);
        for block in &dofs.blocks {
            let lattice = &block.lattices[v];
            let dim = if lattice.node_coords.is_empty() {
                0
            } else {
                lattice.node_coords.len() / lattice.num_nodes
            };
            for node in 0..lattice.num_nodes {
                let c = lattice.node_coord(node, dim);
                let ctx = PointContext {
                    x: c.first().copied().unwrap_or(0.0),
                    y: c.get(1).copied().unwrap_or(0.0),
                    z: c.get(2).copied().unwrap_or(0.0),
                    t: time,
                    scalars: &lookup,
                };
                let value = expr
                    .eval_pointwise(&ctx)
                    .map_err(|reason| ConfigError::BadExpression {
                        name: field.to_string(),
                        reason,
                    })?;
                let gid = block.var_base[v] + node;
                let lid = dofs.ghosted.lid(gid).unwrap();
                psol.values[(lid, 0)] = value;
            }
        }
        Ok(())
    }

    pub fn num_params(&self, usage: ParameterUsage) -> usize {
        if usage == ParameterUsage::Discretized {
            return self
                .dofs
                .as_ref()
                .map_or(0, |d| d.owned.num_local());
        }
        self.groups
            .iter()
            .filter(|g| g.usage == usage)
            .map(|g| g.values.len())
            .sum()
    }

    pub fn get_params(&self, usage: ParameterUsage) -> Vec<f64> {
        if usage == ParameterUsage::Discretized {
            return self
                .psol
                .as_ref()
                .map_or_else(Vec::new, |p| p.column_owned(0).iter().copied().collect());
        }
        self.groups
            .iter()
            .filter(|g| g.usage == usage)
            .flat_map(|g| g.values.iter().copied())
            .collect()
    }

    pub fn get_param_names(&self, usage: ParameterUsage) -> Vec<String> {
        if usage == ParameterUsage::Discretized {
            return self.discretized.iter().map(|d| d.name.clone()).collect();
        }
        self.groups
            .iter()
            .filter(|g| g.usage == usage)
            .map(|g| g.name.clone())
            .collect()
    }

    pub fn get_param_bounds(&self, name: &str) -> Option<(f64, f64)> {
        self.groups
            .iter()
            .find(|g| g.name == name)
            .and_then(|g| g.bounds)
            .or_else(|| {
                self.discretized
                    .iter()
                    .find(|d| d.name == name)
                    .and_then(|d| d.bounds)
            })
    }

    /// Replaces the values of all parameters of one usage class, in
    /// registration order. Discretized updates replace the field vector in
    /// global-id order.
    pub fn update_params(&mut self, new_values: &[f64], usage: ParameterUsage) {
        if usage == ParameterUsage::Discretized {
            if let Some(psol) = self.psol.as_mut() {
                assert_eq!(new_values.len(), psol.num_local());
                for (i, &v) in new_values.iter().enumerate() {
                    psol.values[(i, 0)] = v;
                }
            }
            return;
        }
        let mut prog = 0usize;
        for group in self.groups.iter_mut().filter(|g| g.usage == usage) {
            for value in group.values.iter_mut() {
                debug!(
                    "updated parameter {}: {} -> {}",
                    group.name, value, new_values[prog]
                );
                *value = new_values[prog];
                prog += 1;
            }
        }
        self.sacadoize_params(false);
    }

    pub fn update_param_by_name(&mut self, name: &str, values: &[f64]) -> Result<(), SimError> {
        let group = self
            .groups
            .iter_mut()
            .find(|g| g.name == name)
            .ok_or_else(|| ConsistencyError::BadParameter {
                name: name.to_string(),
                reason: "unknown scalar parameter".to_string(),
            })?;
        group.values.clear();
        group.values.extend_from_slice(values);
        self.rebuild_active_slots();
        self.num_active_params = self
            .groups
            .iter()
            .filter(|g| g.usage == ParameterUsage::Active)
            .map(|g| g.values.len())
            .sum();
        self.sacadoize_params(false);
        Ok(())
    }

    /// The AD value of the scalar parameter `name` (first component).
    pub fn scalar_ad(&self, name: &str) -> Option<&Ad> {
        let g = self.groups.iter().position(|g| g.name == name)?;
        self.ad_values.get(g)?.first()
    }

    pub fn scalar_group_index(&self, name: &str) -> Option<usize> {
        self.groups.iter().position(|g| g.name == name)
    }

    pub fn discretized_index(&self, name: &str) -> Option<usize> {
        self.discretized.iter().position(|d| d.name == name)
    }

    /// Local parameter DOF count per element, the extra AD width a
    /// discretized-sensitivity pass needs.
    pub fn param_ndof_per_elem(&self, block: usize) -> usize {
        self.dofs
            .as_ref()
            .map_or(0, |d| d.blocks[block].ndof_per_elem)
    }

    /// Plain-text dump of the current scalar parameter values, one line per
    /// group (stash for stochastic/discrete sweeps).
    pub fn stash_params(&self, path: &std::path::Path) -> Result<(), SimError> {
        let mut file = std::fs::File::create(path)?;
        for group in &self.groups {
            write!(file, "{}", group.name)?;
            for v in &group.values {
                write!(file, " {v:.16e}")?;
            }
            writeln!(file)?;
        }
        Ok(())
    }

    pub fn param_owned_map(&self) -> Option<Arc<crate::linalg::DofMap>> {
        self.dofs.as_ref().map(|d| d.owned.clone())
    }
}

fn validate_parameter(p: &ParameterSetting) -> Result<(), SimError> {
    if p.name.is_empty() {
        return Err(ConfigError::MissingSetting("parameters[].name".to_string()).into());
    }
    if let Some((lo, hi)) = p.bounds {
        if lo > hi {
            return Err(ConsistencyError::BadParameter {
                name: p.name.clone(),
                reason: format!("lower bound {lo} exceeds upper bound {hi}"),
            }
            .into());
        }
    }
    if p.usage == ParameterUsage::Discretized && !(1..=2).contains(&p.order) {
        return Err(ConsistencyError::BadParameter {
            name: p.name.clone(),
            reason: format!("discretized order {} is not 1 or 2", p.order),
        }
        .into());
    }
    Ok(())
}

/// Name lookup closure over scalar groups for pointwise expression contexts.
pub fn scalar_lookup(groups: &[ScalarParamGroup]) -> impl Fn(&str) -> Option<f64> + '_ {
    move |name: &str| {
        groups
            .iter()
            .find(|g| g.name == name)
            .and_then(|g| g.values.first().copied())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ad::{partials, val};

    fn active_kappa() -> Settings {
        let mut settings = Settings::default();
        settings.parameters.push(ParameterSetting {
            name: "kappa".to_string(),
            usage: ParameterUsage::Active,
            value: vec![2.0],
            ..ParameterSetting::default()
        });
        settings.parameters.push(ParameterSetting {
            name: "offset".to_string(),
            usage: ParameterUsage::Inactive,
            value: vec![0.5],
            ..ParameterSetting::default()
        });
        settings
    }

    #[test]
    fn seeding_marks_only_active_parameters() {
        let mut params = ParameterManager::from_settings(&active_kappa()).unwrap();
        assert_eq!(params.num_active_params, 1);

        params.sacadoize_params(true);
        let kappa = params.scalar_ad("kappa").unwrap();
        assert_eq!(val(kappa), 2.0);
        assert_eq!(partials(kappa, 1)[0], 1.0);
        let offset = params.scalar_ad("offset").unwrap();
        assert_eq!(partials(offset, 1)[0], 0.0);

        params.sacadoize_params(false);
        let kappa = params.scalar_ad("kappa").unwrap();
        assert_eq!(partials(kappa, 1)[0], 0.0);
    }

    #[test]
    fn update_by_usage_walks_registration_order() {
        let mut params = ParameterManager::from_settings(&active_kappa()).unwrap();
        params.update_params(&[7.0], ParameterUsage::Active);
        assert_eq!(params.get_params(ParameterUsage::Active), vec![7.0]);
        assert_eq!(params.get_params(ParameterUsage::Inactive), vec![0.5]);
    }

    #[test]
    fn inconsistent_bounds_are_rejected() {
        let mut settings = Settings::default();
        settings.parameters.push(ParameterSetting {
            name: "bad".to_string(),
            bounds: Some((1.0, -1.0)),
            ..ParameterSetting::default()
        });
        assert!(ParameterManager::from_settings(&settings).is_err());
    }

    #[test]
    fn update_by_name_resizes_group_and_reseeds() {
        let mut params = ParameterManager::from_settings(&active_kappa()).unwrap();
        params.update_param_by_name("kappa", &[3.0, 4.0]).unwrap();
        assert_eq!(params.num_active_params, 2);
        assert_eq!(params.get_params(ParameterUsage::Active), vec![3.0, 4.0]);

        params.sacadoize_params(true);
        let kappa = params.scalar_ad("kappa").unwrap();
        assert_eq!(val(kappa), 3.0);
        assert_eq!(partials(kappa, 2)[0], 1.0);

        assert!(params.update_param_by_name("missing", &[1.0]).is_err());
    }

    #[test]
    fn names_and_bounds_come_back_by_usage() {
        let mut settings = active_kappa();
        settings.parameters[0].bounds = Some((0.5, 5.0));
        let params = ParameterManager::from_settings(&settings).unwrap();
        assert_eq!(
            params.get_param_names(ParameterUsage::Active),
            vec!["kappa".to_string()]
        );
        assert_eq!(
            params.get_param_names(ParameterUsage::Inactive),
            vec!["offset".to_string()]
        );
        assert_eq!(params.get_param_bounds("kappa"), Some((0.5, 5.0)));
        assert_eq!(params.get_param_bounds("offset"), None);
        assert_eq!(params.get_param_bounds("missing"), None);
    }

    #[test]
    fn stash_writes_every_scalar_group() {
        let params = ParameterManager::from_settings(&active_kappa()).unwrap();
        let path = std::env::temp_dir().join("msfem-param-stash.dat");
        params.stash_params(&path).unwrap();
        let contents = std::fs::read_to_string(&path).unwrap();
        assert!(contents.contains("kappa"));
        assert!(contents.contains("offset"));
        assert_eq!(contents.lines().count(), 2);
        let _ = std::fs::remove_file(&path);
    }
}

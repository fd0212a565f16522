//! Scalar thermal diffusion, the canonical physics module.
//!
//! Weak form at a volume quadrature point: rho cp du/dt phi + kappa grad(u)
//! . grad(phi) - f phi, plus convective transport v . grad(u) phi when a
//! velocity field (ux/uy/uz) is present on the block. Boundary sides carry a
//! symmetric Nitsche form for weak Dirichlet data, plain flux data for
//! Neumann, and robin-alpha weighted flux data for Robin sides. Basis and
//! basis-gradient tables already include the integration weights.

use rayon::prelude::*;

use crate::ad::cst;
use crate::dofs::{SIDE_NEUMANN, SIDE_ROBIN, SIDE_WEAK_DIRICHLET};
use crate::error::{AssemblyError, ConfigError, ConsistencyError};
use crate::functions::{FunctionManager, Location};
use crate::params::ParameterManager;
use crate::physics::PhysicsModule;
use crate::settings::Settings;
use crate::workset::Workset;

#[derive(Debug)]
pub struct Thermal {
    dim: usize,
    block: usize,
    form_param: f64,
    e_num: usize,
    ux_num: usize,
    uy_num: usize,
    uz_num: usize,
    have_nsvel: bool,
    order: usize,
}

impl Thermal {
    pub fn new(
        settings: &Settings,
        dim: usize,
        block: usize,
        functions: &mut FunctionManager,
    ) -> Result<Self, ConfigError> {
        let fs = &settings.functions;
        let get = |name: &str, default: &str| -> String {
            fs.get(name).cloned().unwrap_or_else(|| default.to_string())
        };

        functions.add_function(
            "thermal source",
            &get("thermal source", "0.0"),
            Location::VolumeIp,
            block,
        )?;
        functions.add_function(
            "thermal diffusion",
            &get("thermal diffusion", "1.0"),
            Location::VolumeIp,
            block,
        )?;
        functions.add_function(
            "specific heat",
            &get("specific heat", "1.0"),
            Location::VolumeIp,
            block,
        )?;
        functions.add_function("density", &get("density", "1.0"), Location::VolumeIp, block)?;
        functions.add_function(
            "thermal Neumann source",
            &get("thermal Neumann source", "0.0"),
            Location::SideIp,
            block,
        )?;
        functions.add_function(
            "thermal diffusion",
            &get("thermal diffusion", "1.0"),
            Location::SideIp,
            block,
        )?;
        functions.add_function(
            "thermal Robin source",
            &get("thermal Robin source", "0.0"),
            Location::SideIp,
            block,
        )?;
        functions.add_function(
            "robin alpha",
            &get("robin alpha", "0.0"),
            Location::SideIp,
            block,
        )?;

        Ok(Self {
            dim,
            block,
            form_param: settings.physics.form_param,
            e_num: 0,
            ux_num: usize::MAX,
            uy_num: usize::MAX,
            uz_num: usize::MAX,
            have_nsvel: false,
            order: settings.variable_order("e"),
        })
    }
}

impl PhysicsModule for Thermal {
    fn label(&self) -> &str {
        "thermal"
    }

    fn variables(&self) -> Vec<(String, usize)> {
        vec![("e".to_string(), self.order)]
    }

    fn set_vars(&mut self, varlist: &[String]) -> Result<(), ConsistencyError> {
        let mut found_e = false;
        for (i, name) in varlist.iter().enumerate() {
            match name.as_str() {
                "e" => {
                    self.e_num = i;
                    found_e = true;
                }
                "ux" => self.ux_num = i,
                "uy" => self.uy_num = i,
                "uz" => self.uz_num = i,
                _ => {}
            }
        }
        if !found_e {
            return Err(ConsistencyError::UnknownVariable("e".to_string()));
        }
        self.have_nsvel = self.ux_num != usize::MAX;
        Ok(())
    }

    fn volume_residual(
        &self,
        wkset: &mut Workset,
        functions: &FunctionManager,
        params: &ParameterManager,
    ) -> Result<(), AssemblyError> {
        let source = functions.evaluate("thermal source", Location::VolumeIp, self.block, wkset, params)?;
        let diff = functions.evaluate("thermal diffusion", Location::VolumeIp, self.block, wkset, params)?;
        let cp = functions.evaluate("specific heat", Location::VolumeIp, self.block, wkset, params)?;
        let rho = functions.evaluate("density", Location::VolumeIp, self.block, wkset, params)?;

        let e_num = self.e_num;
        let e_basis = wkset.usebasis[e_num];
        let dim = self.dim;
        let nqp = wkset.nqp;
        let num_elems = wkset.num_elems;
        let have_nsvel = self.have_nsvel;
        let (ux_num, uy_num, uz_num) = (self.ux_num, self.uy_num, self.uz_num);

        let offsets = &wkset.offsets[e_num];
        let sol = &wkset.local_soln;
        let sol_dot = &wkset.local_soln_dot;
        let sol_grad = &wkset.local_soln_grad;
        let ebasis = &wkset.basis[e_basis];
        let ebasis_grad = &wkset.basis_grad[e_basis];
        let nb = offsets.len();

        wkset
            .res
            .par_rows_mut()
            .enumerate()
            .for_each(|(e, res_row)| {
                if e >= num_elems {
                    return;
                }
                for k in 0..nqp {
                    let mass = rho[(e, k)].clone() * cp[(e, k)].clone() * sol_dot[(e, e_num, k)].clone();
                    let mut conv = cst(0.0);
                    if have_nsvel {
                        conv += sol[(e, ux_num, k)].clone() * sol_grad[(e, e_num, k, 0)].clone();
                        if dim > 1 {
                            conv += sol[(e, uy_num, k)].clone() * sol_grad[(e, e_num, k, 1)].clone();
                        }
                        if dim > 2 {
                            conv += sol[(e, uz_num, k)].clone() * sol_grad[(e, e_num, k, 2)].clone();
                        }
                    }
                    for i in 0..nb {
                        let resindex = offsets[i];
                        let mut contrib = mass.clone() * ebasis[(e, i, k)]
                            - source[(e, k)].clone() * ebasis[(e, i, k)];
                        for d in 0..dim {
                            contrib += diff[(e, k)].clone()
                                * sol_grad[(e, e_num, k, d)].clone()
                                * ebasis_grad[(e, i, k, d)];
                        }
                        if have_nsvel {
                            contrib += conv.clone() * ebasis[(e, i, k)];
                        }
                        res_row[resindex] += contrib;
                    }
                }
            });

        Ok(())
    }

    fn boundary_residual(
        &self,
        wkset: &mut Workset,
        functions: &FunctionManager,
        params: &ParameterManager,
    ) -> Result<(), AssemblyError> {
        let nsource =
            functions.evaluate("thermal Neumann source", Location::SideIp, self.block, wkset, params)?;
        let diff_side =
            functions.evaluate("thermal diffusion", Location::SideIp, self.block, wkset, params)?;
        let robin_alpha =
            functions.evaluate("robin alpha", Location::SideIp, self.block, wkset, params)?;
        let robin_source =
            functions.evaluate("thermal Robin source", Location::SideIp, self.block, wkset, params)?;

        // Prescribed weak-Dirichlet values for this side set, when registered.
        let dirichlet_name = format!("dirichlet e {}", wkset.current_sideset);
        let dirichlet = if functions.is_registered(&dirichlet_name, Location::SideIp, self.block) {
            Some(functions.evaluate(&dirichlet_name, Location::SideIp, self.block, wkset, params)?)
        } else {
            None
        };

        let sf = if wkset.is_adjoint { 1.0 } else { self.form_param };
        let e_num = self.e_num;
        let e_basis = wkset.usebasis[e_num];
        let dim = self.dim;
        let cside = wkset.current_side;
        let nqs = wkset.nqp_side;
        let nb = wkset.offsets[e_num].len();

        for e in 0..wkset.num_elems {
            let tag = wkset.sideinfo[(e, e_num, cside)];
            match tag.kind {
                SIDE_NEUMANN => {
                    for k in 0..nqs {
                        for i in 0..nb {
                            let resindex = wkset.offsets[e_num][i];
                            let phi = wkset.basis_side[e_basis][(e, i, k)];
                            let contrib = -nsource[(e, k)].clone() * phi;
                            wkset.res[(e, resindex)] += contrib;
                        }
                    }
                }
                SIDE_ROBIN => {
                    for k in 0..nqs {
                        let mismatch = wkset.local_soln_side[(e, e_num, k)].clone()
                            - robin_source[(e, k)].clone();
                        for i in 0..nb {
                            let resindex = wkset.offsets[e_num][i];
                            let phi = wkset.basis_side[e_basis][(e, i, k)];
                            let contrib = robin_alpha[(e, k)].clone() * mismatch.clone() * phi;
                            wkset.res[(e, resindex)] += contrib;
                        }
                    }
                }
                SIDE_WEAK_DIRICHLET => {
                    for k in 0..nqs {
                        let eval = wkset.local_soln_side[(e, e_num, k)].clone();
                        let lambda = if tag.bset == -1 {
                            wkset.local_aux_side[(e, e_num, k)].clone()
                        } else {
                            dirichlet
                                .as_ref()
                                .map_or_else(|| cst(0.0), |d| d[(e, k)].clone())
                        };
                        let mismatch = eval - lambda;

                        let mut dedn = cst(0.0);
                        for d in 0..dim {
                            dedn += wkset.local_soln_grad_side[(e, e_num, k, d)].clone()
                                * wkset.normals[(e, k, d)];
                        }
                        let weak_diri_scale = 10.0 / wkset.h[e];

                        for i in 0..nb {
                            let resindex = wkset.offsets[e_num][i];
                            let phi = wkset.basis_side[e_basis][(e, i, k)];
                            let mut dvdn_w = cst(0.0);
                            for d in 0..dim {
                                dvdn_w += cst(
                                    wkset.basis_grad_side[e_basis][(e, i, k, d)]
                                        * wkset.normals[(e, k, d)],
                                );
                            }
                            let contrib = -diff_side[(e, k)].clone() * dedn.clone() * phi
                                - diff_side[(e, k)].clone() * dvdn_w * mismatch.clone() * sf
                                + diff_side[(e, k)].clone()
                                    * mismatch.clone()
                                    * phi
                                    * weak_diri_scale;
                            wkset.res[(e, resindex)] += contrib;
                        }
                    }
                }
                _ => {}
            }
        }

        Ok(())
    }

    fn compute_flux(
        &self,
        wkset: &mut Workset,
        functions: &FunctionManager,
        params: &ParameterManager,
    ) -> Result<(), AssemblyError> {
        let diff_side =
            functions.evaluate("thermal diffusion", Location::SideIp, self.block, wkset, params)?;

        let sf = if wkset.is_adjoint { self.form_param } else { 1.0 };
        let e_num = self.e_num;
        let dim = self.dim;

        for e in 0..wkset.num_elems {
            let penalty_scale = 10.0 / wkset.h[e];
            for k in 0..wkset.nqp_side {
                let mut dedn = cst(0.0);
                for d in 0..dim {
                    dedn += wkset.local_soln_grad_side[(e, e_num, k, d)].clone()
                        * wkset.normals[(e, k, d)];
                }
                let penalty = diff_side[(e, k)].clone() * penalty_scale;
                let contrib = diff_side[(e, k)].clone() * dedn * sf
                    + penalty
                        * (wkset.local_aux_side[(e, e_num, k)].clone()
                            - wkset.local_soln_side[(e, e_num, k)].clone());
                wkset.flux[(e, e_num, k)] += contrib;
            }
        }

        Ok(())
    }
}

//! Degree-of-freedom management: global numbering over block lattices,
//! owned/ghosted partitioning, per-field offset tables, boundary-condition
//! tagging and strong-Dirichlet identification.

use std::sync::Arc;

use crate::discretization::{DofLattice, LagrangeBasis};
use crate::error::{ConfigError, ConsistencyError, SimError};
use crate::fields::Field3;
use crate::functions::parser::{parse, Expr};
use crate::linalg::{DofMap, Exporter};
use crate::mesh::Mesh;
use crate::settings::{BcMethod, PhysicsSettings};

pub const SIDE_NONE: i32 = 0;
pub const SIDE_WEAK_DIRICHLET: i32 = 1;
pub const SIDE_NEUMANN: i32 = 2;
pub const SIDE_ROBIN: i32 = 3;
pub const SIDE_MULTISCALE: i32 = 4;
pub const SIDE_STRONG_DIRICHLET: i32 = 5;

/// Four-integer side tag: {kind, boundary-set id, spare, spare}. A boundary
/// set id of -1 marks a multiscale interior interface.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SideTag {
    pub kind: i32,
    pub bset: i32,
    pub aux0: i32,
    pub aux1: i32,
}

#[derive(Debug, Clone)]
pub struct Variable {
    pub name: String,
    pub order: usize,
    /// Index into the block's basis table list.
    pub basis: usize,
}

#[derive(Debug, Clone)]
pub struct BlockDofs {
    pub vars: Vec<Variable>,
    /// One lattice per variable.
    pub lattices: Vec<DofLattice>,
    /// Global id of lattice node 0 for each variable.
    pub var_base: Vec<usize>,
    pub ndof_per_elem: usize,
    /// `offsets[v][i]` is the local element slot of basis function `i` of
    /// variable `v` (variable-major layout).
    pub offsets: Vec<Vec<usize>>,
    /// Per-element global dof ids following the offset layout.
    pub elem_gids: Vec<Vec<usize>>,
    /// (element, variable, side) tags.
    pub side_info: Field3<SideTag>,
}

impl BlockDofs {
    pub fn num_vars(&self) -> usize {
        self.vars.len()
    }

    pub fn var_index(&self, name: &str) -> Option<usize> {
        self.vars.iter().position(|v| v.name == name)
    }
}

/// A strong-Dirichlet boundary node with its prescribed-value expression.
#[derive(Debug, Clone)]
pub struct DirichletNode {
    pub gid: usize,
    pub coords: [f64; 3],
    pub expr: Expr,
}

#[derive(Debug)]
pub struct DofManager {
    pub blocks: Vec<BlockDofs>,
    pub total_dofs: usize,
    pub owned: Arc<DofMap>,
    pub ghosted: Arc<DofMap>,
    pub exporter: Exporter,
    pub dirichlet_nodes: Vec<DirichletNode>,
    /// Owned local row indices with strong Dirichlet, sorted.
    pub dirichlet_rows: Vec<usize>,
}

impl DofManager {
    /// Builds the numbering for `vars_per_block` (name, order, basis index per
    /// block) and, when physics settings are supplied, tags sides and
    /// identifies strong-Dirichlet rows.
    pub fn build(
        mesh: &Mesh,
        vars_per_block: &[Vec<(String, usize, usize)>],
        physics: Option<&PhysicsSettings>,
    ) -> Result<Self, SimError> {
        let mut blocks = Vec::with_capacity(mesh.blocks.len());
        let mut next_gid = 0usize;

        for (b, mesh_block) in mesh.blocks.iter().enumerate() {
            let specs = &vars_per_block[b];
            let mut vars = Vec::with_capacity(specs.len());
            let mut lattices = Vec::with_capacity(specs.len());
            let mut var_base = Vec::with_capacity(specs.len());
            let mut offsets: Vec<Vec<usize>> = Vec::with_capacity(specs.len());
            let mut slot = 0usize;

            for (name, order, basis) in specs {
                let lattice = DofLattice::build(mesh_block, *order);
                var_base.push(next_gid);
                next_gid += lattice.num_nodes;
                offsets.push((slot..slot + lattice.nodes_per_elem).collect());
                slot += lattice.nodes_per_elem;
                vars.push(Variable {
                    name: name.clone(),
                    order: *order,
                    basis: *basis,
                });
                lattices.push(lattice);
            }

            let ndof_per_elem = slot;
            let mut elem_gids = Vec::with_capacity(mesh_block.num_elems);
            for e in 0..mesh_block.num_elems {
                let mut gids = vec![0usize; ndof_per_elem];
                for (v, lattice) in lattices.iter().enumerate() {
                    for i in 0..lattice.nodes_per_elem {
                        gids[offsets[v][i]] = var_base[v] + lattice.elem_node(e, i);
                    }
                }
                elem_gids.push(gids);
            }

            let side_info = Field3::from_elem(
                mesh_block.num_elems,
                vars.len(),
                mesh_block.topo.num_sides(),
                SideTag::default(),
            );

            blocks.push(BlockDofs {
                vars,
                lattices,
                var_base,
                ndof_per_elem,
                offsets,
                elem_gids,
                side_info,
            });
        }

        let total_dofs = next_gid;
        let owned = Arc::new(DofMap::contiguous(total_dofs));
        // One rank owns everything; the ghosted map coincides with the owned
        // map and the exporter plan degenerates to an in-place sum.
        let ghosted = Arc::new(DofMap::contiguous(total_dofs));
        let exporter = Exporter::new(&ghosted, &owned);

        let mut manager = Self {
            blocks,
            total_dofs,
            owned,
            ghosted,
            exporter,
            dirichlet_nodes: Vec::new(),
            dirichlet_rows: Vec::new(),
        };

        if let Some(physics) = physics {
            manager.set_bc_data(mesh, physics)?;
        }
        Ok(manager)
    }

    /// Tags (element, variable, side) triples from the boundary-condition
    /// settings and collects strong-Dirichlet nodes with their expressions.
    fn set_bc_data(&mut self, mesh: &Mesh, physics: &PhysicsSettings) -> Result<(), SimError> {
        for (b, mesh_block) in mesh.blocks.iter().enumerate() {
            for bc in &physics.dirichlet {
                let Some(var) = self.blocks[b].var_index(&bc.variable) else {
                    return Err(ConsistencyError::UnknownVariable(bc.variable.clone()).into());
                };
                if !mesh_block.has_side_set(&bc.side_set) {
                    return Err(ConsistencyError::UnknownSideSet(bc.side_set.clone()).into());
                }
                let bset = mesh_block
                    .side_sets
                    .iter()
                    .position(|s| s.name == bc.side_set)
                    .unwrap() as i32;
                let kind = match bc.method {
                    BcMethod::Strong => SIDE_STRONG_DIRICHLET,
                    BcMethod::Weak => SIDE_WEAK_DIRICHLET,
                };
                let expr = parse(&bc.expression).map_err(|reason| ConfigError::BadExpression {
                    name: format!("dirichlet {} {}", bc.variable, bc.side_set),
                    reason,
                })?;

                let entries = mesh_block.side_set(&bc.side_set)?.entries.clone();
                let order = self.blocks[b].vars[var].order;
                let basis = LagrangeBasis::new(mesh_block.topo, order);
                for (elem, side) in entries {
                    self.blocks[b].side_info[(elem, var, side)] = SideTag {
                        kind,
                        bset,
                        aux0: 0,
                        aux1: 0,
                    };
                    if kind == SIDE_STRONG_DIRICHLET {
                        let dim = mesh_block.dim();
                        for i in basis.side_nodes(side) {
                            let lattice = &self.blocks[b].lattices[var];
                            let node = lattice.elem_node(elem, i);
                            let gid = self.blocks[b].var_base[var] + node;
                            let mut coords = [0.0; 3];
                            coords[..dim].copy_from_slice(lattice.node_coord(node, dim));
                            self.dirichlet_nodes.push(DirichletNode {
                                gid,
                                coords,
                                expr: expr.clone(),
                            });
                        }
                    }
                }
            }

            for (list, kind) in [
                (&physics.neumann, SIDE_NEUMANN),
                (&physics.robin, SIDE_ROBIN),
            ] {
                for bc in list {
                    let Some(var) = self.blocks[b].var_index(&bc.variable) else {
                        return Err(ConsistencyError::UnknownVariable(bc.variable.clone()).into());
                    };
                    if !mesh_block.has_side_set(&bc.side_set) {
                        return Err(ConsistencyError::UnknownSideSet(bc.side_set.clone()).into());
                    }
                    let bset = mesh_block
                        .side_sets
                        .iter()
                        .position(|s| s.name == bc.side_set)
                        .unwrap() as i32;
                    for &(elem, side) in &mesh_block.side_set(&bc.side_set)?.entries {
                        self.blocks[b].side_info[(elem, var, side)] = SideTag {
                            kind,
                            bset,
                            aux0: 0,
                            aux1: 0,
                        };
                    }
                }
            }
        }

        // Deduplicate Dirichlet nodes (corner nodes belong to several sides)
        // and resolve owned rows.
        self.dirichlet_nodes.sort_by_key(|n| n.gid);
        self.dirichlet_nodes.dedup_by_key(|n| n.gid);
        self.dirichlet_rows = self
            .dirichlet_nodes
            .iter()
            .filter_map(|n| self.owned.lid(n.gid))
            .collect();
        self.dirichlet_rows.sort_unstable();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mesh::MeshBlock;
    use crate::settings::DirichletSetting;

    fn unit_square(n: usize) -> Mesh {
        Mesh {
            dim: 2,
            blocks: vec![
                MeshBlock::structured("eblock", 2, [n, n, 1], [0.0; 3], [1.0, 1.0, 1.0]).unwrap(),
            ],
        }
    }

    #[test]
    fn numbering_is_var_major_and_complete() {
        let mesh = unit_square(2);
        let vars = vec![vec![
            ("e".to_string(), 1usize, 0usize),
            ("f".to_string(), 1usize, 0usize),
        ]];
        let dofs = DofManager::build(&mesh, &vars, None).unwrap();
        assert_eq!(dofs.total_dofs, 18);
        let block = &dofs.blocks[0];
        assert_eq!(block.ndof_per_elem, 8);
        assert_eq!(block.offsets[1][0], 4);
        // Variable f's dofs start after all of e's.
        assert_eq!(block.var_base[1], 9);
        assert_eq!(block.elem_gids[0][block.offsets[1][0]], 9);
    }

    #[test]
    fn strong_dirichlet_rows_cover_the_side() {
        let mesh = unit_square(2);
        let vars = vec![vec![("e".to_string(), 1usize, 0usize)]];
        let physics = PhysicsSettings {
            dirichlet: vec![DirichletSetting {
                variable: "e".to_string(),
                side_set: "left".to_string(),
                method: BcMethod::Strong,
                expression: "x + y".to_string(),
            }],
            ..PhysicsSettings::default()
        };
        let dofs = DofManager::build(&mesh, &vars, Some(&physics)).unwrap();
        // Left edge of a 2x2 grid has 3 nodes.
        assert_eq!(dofs.dirichlet_rows.len(), 3);
        for node in &dofs.dirichlet_nodes {
            assert_eq!(node.coords[0], 0.0);
        }
        let tag = dofs.blocks[0].side_info[(0, 0, 0)];
        assert_eq!(tag.kind, SIDE_STRONG_DIRICHLET);
    }

    #[test]
    fn unknown_side_set_is_a_consistency_error() {
        let mesh = unit_square(1);
        let vars = vec![vec![("e".to_string(), 1usize, 0usize)]];
        let physics = PhysicsSettings {
            dirichlet: vec![DirichletSetting {
                variable: "e".to_string(),
                side_set: "nowhere".to_string(),
                method: BcMethod::Strong,
                expression: "0.0".to_string(),
            }],
            ..PhysicsSettings::default()
        };
        assert!(DofManager::build(&mesh, &vars, Some(&physics)).is_err());
    }
}

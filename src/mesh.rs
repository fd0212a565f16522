//! Procedural structured mesh blocks.
//!
//! The engine treats the mesh as an external abstraction that provides block
//! names, cell topologies, per-element corner coordinates and side-set
//! membership. This module supplies the structured line/quad/hex instance of
//! that abstraction, plus the solution-driven node displacement hook.

use crate::error::{ConfigError, ConsistencyError};
use crate::settings::MeshSettings;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CellTopo {
    Line,
    Quad,
    Hex,
}

impl CellTopo {
    pub fn from_dim(dim: usize) -> Option<Self> {
        match dim {
            1 => Some(CellTopo::Line),
            2 => Some(CellTopo::Quad),
            3 => Some(CellTopo::Hex),
            _ => None,
        }
    }

    pub fn dim(&self) -> usize {
        match self {
            CellTopo::Line => 1,
            CellTopo::Quad => 2,
            CellTopo::Hex => 3,
        }
    }

    pub fn num_corners(&self) -> usize {
        1 << self.dim()
    }

    /// Sides come in (axis, low/high) pairs: 2*dim per cell.
    pub fn num_sides(&self) -> usize {
        2 * self.dim()
    }
}

#[derive(Debug, Clone)]
pub struct SideSet {
    pub name: String,
    /// (element index within the block, local side index) pairs.
    pub entries: Vec<(usize, usize)>,
}

#[derive(Debug, Clone)]
pub struct MeshBlock {
    pub name: String,
    pub topo: CellTopo,
    pub divisions: [usize; 3],
    pub lower: [f64; 3],
    pub upper: [f64; 3],
    pub num_elems: usize,
    pub num_nodes: usize,
    /// Corner-node coordinates, node-major, `dim` entries per node.
    node_coords: Vec<f64>,
    /// Corner connectivity, element-major, x-fastest lattice order.
    elem_corners: Vec<usize>,
    pub side_sets: Vec<SideSet>,
}

impl MeshBlock {
    pub fn structured(
        name: &str,
        dim: usize,
        divisions: [usize; 3],
        lower: [f64; 3],
        upper: [f64; 3],
    ) -> Result<Self, ConfigError> {
        let topo = CellTopo::from_dim(dim).ok_or_else(|| ConfigError::InvalidSetting {
            name: "mesh.dim".to_string(),
            reason: format!("dimension {dim} is outside 1..=3"),
        })?;
        let mut div = [1usize; 3];
        div[..dim].copy_from_slice(&divisions[..dim]);

        let nodes_per_axis = [div[0] + 1, div[1] + 1, div[2] + 1];
        let num_nodes = (0..dim).map(|a| nodes_per_axis[a]).product();
        let num_elems = (0..dim).map(|a| div[a]).product();

        let mut node_coords = Vec::with_capacity(num_nodes * dim);
        let counts = lattice_counts(dim, nodes_per_axis);
        for n in 0..num_nodes {
            let idx = delinearize(n, counts);
            for axis in 0..dim {
                let frac = idx[axis] as f64 / div[axis] as f64;
                node_coords.push(lower[axis] + frac * (upper[axis] - lower[axis]));
            }
        }

        let corners = topo.num_corners();
        let mut elem_corners = Vec::with_capacity(num_elems * corners);
        let elem_counts = lattice_counts(dim, div);
        for e in 0..num_elems {
            let eidx = delinearize(e, elem_counts);
            for c in 0..corners {
                let mut nidx = [0usize; 3];
                for axis in 0..dim {
                    nidx[axis] = eidx[axis] + ((c >> axis) & 1);
                }
                elem_corners.push(linearize(nidx, counts));
            }
        }

        let side_sets = boundary_side_sets(dim, div, elem_counts);

        Ok(Self {
            name: name.to_string(),
            topo,
            divisions: div,
            lower,
            upper,
            num_elems,
            num_nodes,
            node_coords,
            elem_corners,
            side_sets,
        })
    }

    pub fn dim(&self) -> usize {
        self.topo.dim()
    }

    pub fn corner_node(&self, elem: usize, corner: usize) -> usize {
        self.elem_corners[elem * self.topo.num_corners() + corner]
    }

    pub fn node_coord(&self, node: usize) -> &[f64] {
        let d = self.dim();
        &self.node_coords[node * d..(node + 1) * d]
    }

    /// Corner coordinates of one element, corner-major.
    pub fn elem_corner_coords(&self, elem: usize) -> Vec<f64> {
        let d = self.dim();
        let corners = self.topo.num_corners();
        let mut out = Vec::with_capacity(corners * d);
        for c in 0..corners {
            out.extend_from_slice(self.node_coord(self.corner_node(elem, c)));
        }
        out
    }

    pub fn side_set(&self, name: &str) -> Result<&SideSet, ConsistencyError> {
        self.side_sets
            .iter()
            .find(|s| s.name == name)
            .ok_or_else(|| ConsistencyError::UnknownSideSet(name.to_string()))
    }

    pub fn has_side_set(&self, name: &str) -> bool {
        self.side_sets.iter().any(|s| s.name == name)
    }

    /// Solution-driven node displacement hook: shifts every corner node by the
    /// given per-node delta (node-major, `dim` entries per node).
    pub fn displace_nodes(&mut self, delta: &[f64]) {
        assert_eq!(delta.len(), self.node_coords.len());
        for (x, dx) in self.node_coords.iter_mut().zip(delta) {
            *x += dx;
        }
    }
}

#[derive(Debug, Clone)]
pub struct Mesh {
    pub dim: usize,
    pub blocks: Vec<MeshBlock>,
}

impl Mesh {
    pub fn from_settings(settings: &MeshSettings) -> Result<Self, ConfigError> {
        let mut blocks = Vec::with_capacity(settings.blocks.len());
        for b in &settings.blocks {
            blocks.push(MeshBlock::structured(
                &b.name,
                settings.dim,
                b.divisions,
                b.lower,
                b.upper,
            )?);
        }
        Ok(Self {
            dim: settings.dim,
            blocks,
        })
    }

    pub fn block_names(&self) -> Vec<String> {
        self.blocks.iter().map(|b| b.name.clone()).collect()
    }
}

fn lattice_counts(dim: usize, per_axis: [usize; 3]) -> [usize; 3] {
    let mut counts = [1usize; 3];
    counts[..dim].copy_from_slice(&per_axis[..dim]);
    counts
}

fn delinearize(mut i: usize, counts: [usize; 3]) -> [usize; 3] {
    let mut idx = [0usize; 3];
    for axis in 0..3 {
        idx[axis] = i % counts[axis];
        i /= counts[axis];
    }
    idx
}

fn linearize(idx: [usize; 3], counts: [usize; 3]) -> usize {
    idx[0] + counts[0] * (idx[1] + counts[1] * idx[2])
}

const SIDE_SET_NAMES: [[&str; 2]; 3] = [
    ["left", "right"],
    ["bottom", "top"],
    ["back", "front"],
];

fn boundary_side_sets(dim: usize, div: [usize; 3], elem_counts: [usize; 3]) -> Vec<SideSet> {
    let mut sets = Vec::new();
    for axis in 0..dim {
        for high in 0..2 {
            let mut entries = Vec::new();
            let num_elems: usize = (0..dim).map(|a| div[a]).product();
            for e in 0..num_elems {
                let idx = delinearize(e, elem_counts);
                let extreme = if high == 1 { div[axis] - 1 } else { 0 };
                if idx[axis] == extreme {
                    entries.push((e, 2 * axis + high));
                }
            }
            sets.push(SideSet {
                name: SIDE_SET_NAMES[axis][high].to_string(),
                entries,
            });
        }
    }
    sets
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unit_square_counts() {
        let block =
            MeshBlock::structured("b", 2, [3, 2, 1], [0.0; 3], [1.0, 1.0, 1.0]).unwrap();
        assert_eq!(block.num_elems, 6);
        assert_eq!(block.num_nodes, 12);
        assert_eq!(block.side_sets.len(), 4);
        let left = block.side_set("left").unwrap();
        assert_eq!(left.entries, vec![(0, 0), (3, 0)]);
    }

    #[test]
    fn corner_ordering_is_x_fastest() {
        let block =
            MeshBlock::structured("b", 2, [2, 2, 1], [0.0; 3], [2.0, 2.0, 1.0]).unwrap();
        // Element 3 is the top-right cell; its first corner sits at (1, 1).
        assert_eq!(block.node_coord(block.corner_node(3, 0)), &[1.0, 1.0]);
        assert_eq!(block.node_coord(block.corner_node(3, 3)), &[2.0, 2.0]);
    }

    #[test]
    fn hex_block_side_sets() {
        let block =
            MeshBlock::structured("b", 3, [2, 2, 2], [0.0; 3], [1.0, 1.0, 1.0]).unwrap();
        assert_eq!(block.num_elems, 8);
        assert_eq!(block.side_sets.len(), 6);
        assert_eq!(block.side_set("front").unwrap().entries.len(), 4);
    }

    #[test]
    fn displacement_moves_nodes() {
        let mut block =
            MeshBlock::structured("b", 1, [2, 1, 1], [0.0; 3], [1.0, 1.0, 1.0]).unwrap();
        let delta = vec![0.1; block.num_nodes];
        block.displace_nodes(&delta);
        assert!((block.node_coord(0)[0] - 0.1).abs() < 1e-15);
    }
}

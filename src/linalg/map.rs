//! Index maps and the communication plan between them.
//!
//! A map lists the global indices a rank holds. The assembler works on the
//! owned-and-ghosted map; the solver works on the owned map. The exporter sums
//! ghosted contributions into owned storage in sorted global order, so the
//! combine is deterministic for a fixed partition; the importer carries owned
//! data back out to the ghosted layout.

use rustc_hash::FxHashMap;

use super::vector::DistMultiVector;

#[derive(Debug, Clone)]
pub struct DofMap {
    gids: Vec<usize>,
    global_to_local: FxHashMap<usize, usize>,
}

impl DofMap {
    pub fn from_gids(gids: Vec<usize>) -> Self {
        let global_to_local = gids
            .iter()
            .enumerate()
            .map(|(lid, &gid)| (gid, lid))
            .collect();
        Self {
            gids,
            global_to_local,
        }
    }

    /// The map holding 0..n, the usual single-rank owned map.
    pub fn contiguous(n: usize) -> Self {
        Self::from_gids((0..n).collect())
    }

    pub fn num_local(&self) -> usize {
        self.gids.len()
    }

    pub fn lid(&self, gid: usize) -> Option<usize> {
        self.global_to_local.get(&gid).copied()
    }

    pub fn gid(&self, lid: usize) -> usize {
        self.gids[lid]
    }

    pub fn gids(&self) -> &[usize] {
        &self.gids
    }
}

/// Plan pairing the shared entries of a source map and a target map.
#[derive(Debug, Clone)]
pub struct Exporter {
    /// (source lid, target lid), sorted by global id.
    shared: Vec<(usize, usize)>,
}

impl Exporter {
    pub fn new(source: &DofMap, target: &DofMap) -> Self {
        let mut shared: Vec<(usize, usize, usize)> = source
            .gids()
            .iter()
            .enumerate()
            .filter_map(|(slid, &gid)| target.lid(gid).map(|tlid| (gid, slid, tlid)))
            .collect();
        shared.sort_unstable_by_key(|&(gid, _, _)| gid);
        Self {
            shared: shared.into_iter().map(|(_, s, t)| (s, t)).collect(),
        }
    }

    /// Tpetra-style additive export: `target += source` on shared entries.
    pub fn export_add(&self, source: &DistMultiVector, target: &mut DistMultiVector) {
        assert_eq!(source.ncols(), target.ncols());
        for col in 0..source.ncols() {
            for &(slid, tlid) in &self.shared {
                target.values[(tlid, col)] += source.values[(slid, col)];
            }
        }
    }

    /// Import in the reverse direction: `source` entries overwritten from
    /// `target` on shared indices.
    pub fn import_insert(&self, target: &DistMultiVector, source: &mut DistMultiVector) {
        assert_eq!(source.ncols(), target.ncols());
        for col in 0..source.ncols() {
            for &(slid, tlid) in &self.shared {
                source.values[(slid, col)] = target.values[(tlid, col)];
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn export_sums_shared_entries_in_gid_order() {
        // Ghosted map overlaps the owned map on gids 1 and 2.
        let owned = Arc::new(DofMap::from_gids(vec![0, 1, 2]));
        let ghosted = Arc::new(DofMap::from_gids(vec![2, 1, 5]));
        let exporter = Exporter::new(&ghosted, &owned);

        let mut src = DistMultiVector::new(ghosted, 1);
        src.values[(0, 0)] = 10.0;
        src.values[(1, 0)] = 20.0;
        src.values[(2, 0)] = 99.0; // gid 5 has no owner here and is dropped

        let mut dst = DistMultiVector::new(owned, 1);
        dst.put_scalar(1.0);
        exporter.export_add(&src, &mut dst);
        assert_eq!(dst.values[(0, 0)], 1.0);
        assert_eq!(dst.values[(1, 0)], 21.0);
        assert_eq!(dst.values[(2, 0)], 11.0);
    }

    #[test]
    fn import_round_trip_restores_shared_values() {
        let owned = Arc::new(DofMap::contiguous(4));
        let ghosted = Arc::new(DofMap::from_gids(vec![3, 0, 1]));
        let exporter = Exporter::new(&ghosted, &owned);

        let mut target = DistMultiVector::new(owned, 1);
        for i in 0..4 {
            target.values[(i, 0)] = i as f64;
        }
        let mut source = DistMultiVector::new(ghosted, 1);
        exporter.import_insert(&target, &mut source);
        assert_eq!(source.values[(0, 0)], 3.0);
        assert_eq!(source.values[(1, 0)], 0.0);
        assert_eq!(source.values[(2, 0)], 1.0);
    }
}

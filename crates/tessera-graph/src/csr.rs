use tessera_types::{Lvid, Result};
use tracing::debug;

use crate::LocalGraph;

/// CSR-backed local graph. Edges accumulate in a staging list; `finalize`
/// builds offset arrays in both directions so in- and out-degree queries
/// are O(1). Edge payloads are moved into CSR position alongside the
/// out-direction targets.
#[derive(Default)]
pub struct CsrGraph {
    nverts: usize,
    staged: Vec<StagedEdge>,
    vdata: Vec<Vec<u8>>,
    out_offsets: Vec<u32>,
    out_targets: Vec<Lvid>,
    out_edata: Vec<Vec<u8>>,
    in_offsets: Vec<u32>,
    in_sources: Vec<Lvid>,
    finalized: bool,
}

struct StagedEdge {
    src: Lvid,
    dst: Lvid,
    edata: Vec<u8>,
}

impl CsrGraph {
    pub fn new() -> Self {
        Self::default()
    }

    /// Out-neighbors of `lvid` in CSR order. Empty before `finalize` or
    /// for vertices added after it.
    pub fn out_neighbors(&self, lvid: Lvid) -> &[Lvid] {
        let (lo, hi) = self.out_range(lvid);
        &self.out_targets[lo..hi]
    }

    pub fn in_neighbors(&self, lvid: Lvid) -> &[Lvid] {
        let (lo, hi) = self.in_range(lvid);
        &self.in_sources[lo..hi]
    }

    /// Payload of the `i`-th out-edge of `lvid`.
    pub fn out_edge_data(&self, lvid: Lvid, i: usize) -> &[u8] {
        let (lo, hi) = self.out_range(lvid);
        debug_assert!(lo + i < hi);
        &self.out_edata[lo + i]
    }

    fn out_range(&self, lvid: Lvid) -> (usize, usize) {
        range_of(&self.out_offsets, lvid)
    }

    fn in_range(&self, lvid: Lvid) -> (usize, usize) {
        range_of(&self.in_offsets, lvid)
    }
}

/// Offset window for `lvid`, or an empty range for vertices outside the
/// finalized CSR (singletons registered after the build).
fn range_of(offsets: &[u32], lvid: Lvid) -> (usize, usize) {
    let i = lvid.index();
    if i + 1 < offsets.len() {
        (offsets[i] as usize, offsets[i + 1] as usize)
    } else {
        (0, 0)
    }
}

impl LocalGraph for CsrGraph {
    fn num_vertices(&self) -> usize {
        self.nverts
    }

    fn num_edges(&self) -> usize {
        if self.finalized {
            self.out_targets.len()
        } else {
            self.staged.len()
        }
    }

    fn num_in_edges(&self, lvid: Lvid) -> usize {
        let (lo, hi) = self.in_range(lvid);
        hi - lo
    }

    fn num_out_edges(&self, lvid: Lvid) -> usize {
        let (lo, hi) = self.out_range(lvid);
        hi - lo
    }

    fn resize(&mut self, nverts: usize) {
        if nverts > self.nverts {
            self.nverts = nverts;
            self.vdata.resize(nverts, Vec::new());
        }
    }

    fn reserve_edge_space(&mut self, nedges: usize) {
        self.staged.reserve(nedges.saturating_sub(self.staged.len()));
    }

    fn add_edge(&mut self, src: Lvid, dst: Lvid, edata: Vec<u8>) {
        debug_assert!(!self.finalized, "add_edge on a finalized graph");
        debug_assert!(src.index() < self.nverts && dst.index() < self.nverts);
        self.staged.push(StagedEdge { src, dst, edata });
    }

    fn add_vertex(&mut self, lvid: Lvid, vdata: Vec<u8>) {
        self.resize(lvid.index() + 1);
        self.vdata[lvid.index()] = vdata;
    }

    fn vertex_data(&self, lvid: Lvid) -> &[u8] {
        &self.vdata[lvid.index()]
    }

    fn vertex_data_mut(&mut self, lvid: Lvid) -> &mut Vec<u8> {
        &mut self.vdata[lvid.index()]
    }

    fn finalize(&mut self) -> Result<()> {
        if self.finalized {
            return Ok(());
        }
        let n = self.nverts;
        let staged = std::mem::take(&mut self.staged);
        let nedges = staged.len();

        let mut out_degree = vec![0u32; n];
        let mut in_degree = vec![0u32; n];
        for edge in &staged {
            out_degree[edge.src.index()] += 1;
            in_degree[edge.dst.index()] += 1;
        }

        self.out_offsets = prefix_sum(&out_degree);
        self.in_offsets = prefix_sum(&in_degree);

        self.out_targets = vec![Lvid(0); nedges];
        self.out_edata = vec![Vec::new(); nedges];
        self.in_sources = vec![Lvid(0); nedges];
        let mut out_cursor: Vec<u32> = self.out_offsets[..n].to_vec();
        let mut in_cursor: Vec<u32> = self.in_offsets[..n].to_vec();
        for edge in staged {
            let opos = out_cursor[edge.src.index()] as usize;
            out_cursor[edge.src.index()] += 1;
            self.out_targets[opos] = edge.dst;
            self.out_edata[opos] = edge.edata;

            let ipos = in_cursor[edge.dst.index()] as usize;
            in_cursor[edge.dst.index()] += 1;
            self.in_sources[ipos] = edge.src;
        }

        self.finalized = true;
        debug!(nverts = n, nedges, "csr.finalize");
        Ok(())
    }
}

fn prefix_sum(degree: &[u32]) -> Vec<u32> {
    let mut offsets = Vec::with_capacity(degree.len() + 1);
    let mut total = 0u32;
    for &d in degree {
        offsets.push(total);
        total += d;
    }
    offsets.push(total);
    offsets
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lv(i: u32) -> Lvid {
        Lvid(i)
    }

    #[test]
    fn csr_build_and_degrees() -> Result<()> {
        let mut g = CsrGraph::new();
        g.resize(4);
        g.add_edge(lv(0), lv(1), b"a".to_vec());
        g.add_edge(lv(0), lv(2), b"b".to_vec());
        g.add_edge(lv(3), lv(0), b"c".to_vec());
        g.finalize()?;

        assert_eq!(g.num_vertices(), 4);
        assert_eq!(g.num_edges(), 3);
        assert_eq!(g.num_out_edges(lv(0)), 2);
        assert_eq!(g.num_in_edges(lv(0)), 1);
        assert_eq!(g.num_in_edges(lv(1)), 1);
        assert_eq!(g.num_out_edges(lv(1)), 0);
        assert_eq!(g.out_neighbors(lv(0)), &[lv(1), lv(2)]);
        assert_eq!(g.in_neighbors(lv(0)), &[lv(3)]);
        assert_eq!(g.out_edge_data(lv(0), 0), b"a");
        assert_eq!(g.out_edge_data(lv(0), 1), b"b");
        assert_eq!(g.out_edge_data(lv(3), 0), b"c");
        Ok(())
    }

    #[test]
    fn self_loop_counts_both_directions() -> Result<()> {
        let mut g = CsrGraph::new();
        g.resize(1);
        g.add_edge(lv(0), lv(0), Vec::new());
        g.finalize()?;
        assert_eq!(g.num_in_edges(lv(0)), 1);
        assert_eq!(g.num_out_edges(lv(0)), 1);
        assert_eq!(g.out_neighbors(lv(0)), &[lv(0)]);
        Ok(())
    }

    #[test]
    fn vertex_added_after_finalize_has_zero_degree() -> Result<()> {
        let mut g = CsrGraph::new();
        g.resize(2);
        g.add_edge(lv(0), lv(1), Vec::new());
        g.finalize()?;
        g.add_vertex(lv(5), b"late".to_vec());
        assert_eq!(g.num_vertices(), 6);
        assert_eq!(g.num_in_edges(lv(5)), 0);
        assert_eq!(g.num_out_edges(lv(5)), 0);
        assert_eq!(g.vertex_data(lv(5)), b"late");
        Ok(())
    }

    #[test]
    fn empty_graph_finalizes() -> Result<()> {
        let mut g = CsrGraph::new();
        g.finalize()?;
        assert_eq!(g.num_vertices(), 0);
        assert_eq!(g.num_edges(), 0);
        // Second finalize is a no-op.
        g.finalize()?;
        Ok(())
    }

    #[test]
    fn vertex_data_survives_finalize() -> Result<()> {
        let mut g = CsrGraph::new();
        g.add_vertex(lv(0), b"x".to_vec());
        g.resize(2);
        g.add_edge(lv(0), lv(1), Vec::new());
        g.finalize()?;
        assert_eq!(g.vertex_data(lv(0)), b"x");
        *g.vertex_data_mut(lv(1)) = b"y".to_vec();
        assert_eq!(g.vertex_data(lv(1)), b"y");
        Ok(())
    }
}

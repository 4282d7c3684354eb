#![forbid(unsafe_code)]

//! Local single-machine graph container consumed by the ingress.
//!
//! The ingress coordinator only sees the narrow [`LocalGraph`] interface;
//! [`CsrGraph`] is the stock implementation backing it.

mod csr;

pub use csr::CsrGraph;

use tessera_types::{Lvid, Result};

/// The operations the ingress needs from a per-worker graph container.
///
/// Edges are staged with [`LocalGraph::add_edge`] and become queryable
/// after [`LocalGraph::finalize`]; degree queries are only meaningful on a
/// finalized graph. Vertex and edge payloads are opaque byte blobs.
pub trait LocalGraph {
    fn num_vertices(&self) -> usize;
    fn num_edges(&self) -> usize;
    /// In-degree of `lvid`. Zero before `finalize`.
    fn num_in_edges(&self, lvid: Lvid) -> usize;
    /// Out-degree of `lvid`. Zero before `finalize`.
    fn num_out_edges(&self, lvid: Lvid) -> usize;
    /// Grows the vertex range to at least `nverts`. Never shrinks.
    fn resize(&mut self, nverts: usize);
    fn reserve_edge_space(&mut self, nedges: usize);
    fn add_edge(&mut self, src: Lvid, dst: Lvid, edata: Vec<u8>);
    /// Registers a vertex with payload outside of any edge. Grows the
    /// vertex range if needed; valid after `finalize` too (the ingress
    /// uses it for singleton vertices).
    fn add_vertex(&mut self, lvid: Lvid, vdata: Vec<u8>);
    fn vertex_data(&self, lvid: Lvid) -> &[u8];
    fn vertex_data_mut(&mut self, lvid: Lvid) -> &mut Vec<u8>;
    /// Builds the adjacency index. Idempotent; a second call is a no-op.
    fn finalize(&mut self) -> Result<()>;
}

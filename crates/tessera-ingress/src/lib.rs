#![forbid(unsafe_code)]

//! Distributed vertex-cut graph ingress.
//!
//! Workers stream `(src, dst, edata)` and `(vid, vdata)` tuples into an
//! [`IngressCoordinator`]; a collective [`IngressCoordinator::finalize`]
//! runs the three-phase negotiation protocol and leaves every worker with
//! a [`PartitionedGraph`]: its local subgraph plus per-vertex ownership
//! metadata (owner, mirror set, global degree totals, global counts).
//!
//! Edges are assigned to workers by a pluggable [`Placement`] policy;
//! vertices may be replicated ("mirrored") on every worker that holds an
//! incident edge, with one deterministically negotiated owner.

mod coordinator;
mod exchange;
mod placement;
mod records;
mod store;
mod transport;

pub use coordinator::{IngressCoordinator, PartitionedGraph};
pub use exchange::BufferedExchange;
pub use placement::{Placement, RandomHash};
pub use records::{
    EdgeBufferRecord, NegotiatorRecord, ShuffleRecord, VertexBufferRecord, WireRecord,
};
pub use store::{VertexRecord, VertexRecordStore};
pub use transport::{LocalCluster, Transport};

use std::collections::BTreeMap;
use std::sync::Arc;

use tessera_graph::LocalGraph;
use tessera_types::{wire, Gvid, Lvid, MirrorSet, Phase, Result, TesseraError, WorkerId};
use tracing::info;

use crate::exchange::BufferedExchange;
use crate::placement::Placement;
use crate::records::{
    decode_frame, encode_frame, EdgeBufferRecord, NegotiatorRecord, ShuffleRecord,
    VertexBufferRecord, WireRecord,
};
use crate::store::{VertexRecord, VertexRecordStore};
use crate::transport::Transport;

fn contract(phase: Phase, worker: WorkerId, detail: impl Into<String>) -> TesseraError {
    TesseraError::Contract {
        phase,
        worker,
        detail: detail.into(),
    }
}

/// Per-worker ingress endpoint. Applications stream edges and vertex
/// payloads in through [`add_edge`](Self::add_edge) and
/// [`add_vertex`](Self::add_vertex) from any number of threads, then one
/// thread per worker drives the collective
/// [`finalize`](Self::finalize). Finalize consumes the coordinator, so
/// submitting data after it is unrepresentable.
pub struct IngressCoordinator<G: LocalGraph, P: Placement> {
    transport: Arc<dyn Transport>,
    placement: P,
    graph: G,
    edge_exchange: BufferedExchange<EdgeBufferRecord>,
    vertex_exchange: BufferedExchange<VertexBufferRecord>,
}

impl<G: LocalGraph, P: Placement> IngressCoordinator<G, P> {
    /// Collective constructor: returns once every worker has built its
    /// coordinator.
    pub fn new(transport: Arc<dyn Transport>, graph: G, placement: P) -> Result<Self> {
        let edge_exchange = BufferedExchange::new(Arc::clone(&transport));
        let vertex_exchange = BufferedExchange::new(Arc::clone(&transport));
        transport.barrier()?;
        Ok(Self {
            transport,
            placement,
            graph,
            edge_exchange,
            vertex_exchange,
        })
    }

    pub fn pid(&self) -> WorkerId {
        self.transport.pid()
    }

    pub fn nworkers(&self) -> usize {
        self.transport.nworkers()
    }

    /// Routes one edge to the worker the placement policy picks for it.
    /// Never touches local graph state; safe to call concurrently with
    /// other `add_*` calls on this worker.
    pub fn add_edge(&self, src: Gvid, dst: Gvid, edata: Vec<u8>) -> Result<()> {
        let dest = self.placement.edge_to_worker(src, dst, self.nworkers());
        self.edge_exchange.send(dest, EdgeBufferRecord { src, dst, edata })
    }

    /// Routes one vertex payload to the vertex's negotiator. When the
    /// same vid is submitted more than once (from any worker), the last
    /// payload received at the negotiator wins; callers needing combine
    /// semantics must pre-reduce.
    pub fn add_vertex(&self, vid: Gvid, vdata: Vec<u8>) -> Result<()> {
        let dest = self.placement.negotiator(vid, self.nworkers());
        self.vertex_exchange.send(dest, VertexBufferRecord { vid, vdata })
    }

    /// The three-phase finalize protocol. Collective: every worker must
    /// call it, and all faults are fatal to the job.
    pub fn finalize(mut self) -> Result<PartitionedGraph<G>> {
        let pid = self.pid();
        let n = self.nworkers();

        // Phase 1: materialize the edges routed to this worker.
        self.edge_exchange.flush()?;
        self.vertex_exchange.flush()?;

        let mut store = VertexRecordStore::new(n);
        let received_edges = self.edge_exchange.size()?;
        self.graph.reserve_edge_space(received_edges);
        while let Some((_, batch)) = self.edge_exchange.recv()? {
            for rec in batch {
                let src = store.intern(rec.src);
                let dst = store.intern(rec.dst);
                let top = src.index().max(dst.index());
                if top >= self.graph.num_vertices() {
                    self.graph.resize(top + 1);
                }
                self.graph.add_edge(src, dst, rec.edata);
            }
        }
        self.edge_exchange.clear();
        self.graph.finalize()?;
        if self.graph.num_vertices() != store.len() {
            return Err(contract(
                Phase::Materialize,
                pid,
                format!(
                    "local graph holds {} vertices but {} ids were interned",
                    self.graph.num_vertices(),
                    store.len()
                ),
            ));
        }
        store.build_records();
        info!(
            worker = pid.0,
            nverts = store.len(),
            nedges = self.graph.num_edges(),
            "ingress.finalize.materialize"
        );

        // Phase 2: report local degree evidence to each vertex's
        // negotiator and accumulate the evidence arriving here.
        let mut outbound: Vec<Vec<ShuffleRecord>> = vec![Vec::new(); n];
        for (gvid, lvid) in store.vid_map() {
            let negotiator = self.placement.negotiator(gvid, n);
            let row = outbound
                .get_mut(negotiator.index())
                .ok_or(TesseraError::Invalid("negotiator out of worker range"))?;
            row.push(ShuffleRecord {
                vid: gvid,
                num_in: self.graph.num_in_edges(lvid) as u32,
                num_out: self.graph.num_out_edges(lvid) as u32,
            });
        }
        let inbound = all_to_all_records(self.transport.as_ref(), pid, outbound)?;

        // BTreeMap keeps the assignment pass deterministic per worker.
        let mut vrec_map: BTreeMap<Gvid, NegotiatorRecord> = BTreeMap::new();
        while let Some((_, batch)) = self.vertex_exchange.recv()? {
            for rec in batch {
                let negotiator = self.placement.negotiator(rec.vid, n);
                if negotiator != pid {
                    return Err(TesseraError::PolicyDisagreement {
                        vid: rec.vid,
                        expected: negotiator,
                        got: pid,
                    });
                }
                vrec_map
                    .entry(rec.vid)
                    .or_insert_with(|| NegotiatorRecord::empty(rec.vid, n))
                    .vdata = rec.vdata;
            }
        }
        self.vertex_exchange.clear();

        for (sender, records) in inbound.iter().enumerate() {
            let sender = WorkerId(sender as u16);
            for rec in records {
                let negotiator = self.placement.negotiator(rec.vid, n);
                if negotiator != pid {
                    return Err(TesseraError::PolicyDisagreement {
                        vid: rec.vid,
                        expected: negotiator,
                        got: pid,
                    });
                }
                let entry = vrec_map
                    .entry(rec.vid)
                    .or_insert_with(|| NegotiatorRecord::empty(rec.vid, n));
                entry.num_in += u64::from(rec.num_in);
                entry.num_out += u64::from(rec.num_out);
                entry.mirrors.set(sender);
            }
        }
        info!(
            worker = pid.0,
            negotiated = vrec_map.len(),
            "ingress.finalize.shuffle"
        );

        // Phase 3: pick owners greedily by least assigned load and
        // broadcast the decision to every mirror.
        let mut counts = vec![0u64; n];
        let mut assign_exchange =
            BufferedExchange::<NegotiatorRecord>::new(Arc::clone(&self.transport));
        for rec in vrec_map.values_mut() {
            if rec.mirrors.popcount() > 0 {
                let mut best: Option<(u64, WorkerId)> = None;
                for worker in rec.mirrors.iter() {
                    let key = (counts[worker.index()], worker);
                    if best.map_or(true, |b| key < b) {
                        best = Some(key);
                    }
                }
                let (_, owner) = best.ok_or_else(|| {
                    contract(Phase::Assign, pid, "mirror iteration yielded no candidate")
                })?;
                rec.owner = owner;
                counts[owner.index()] += 1;
            } else {
                // Submitted via add_vertex with no incident edge anywhere:
                // place it by vid alone. The load counter is not bumped on
                // this branch.
                let owner = WorkerId((rec.vid.0 % n as u64) as u16);
                rec.mirrors.set(owner);
                rec.owner = owner;
            }
            for worker in rec.mirrors.iter() {
                assign_exchange.send(worker, rec.clone())?;
            }
        }
        drop(vrec_map);
        assign_exchange.flush()?;

        while let Some((_, batch)) = assign_exchange.recv()? {
            for rec in batch {
                if rec.mirrors.is_empty() {
                    return Err(contract(
                        Phase::Assign,
                        pid,
                        format!("vertex {} arrived with an empty mirror set", rec.vid),
                    ));
                }
                let lvid = match store.lvid_of(rec.vid) {
                    Some(lvid) => {
                        if lvid.index() >= self.graph.num_vertices() {
                            return Err(contract(
                                Phase::Assign,
                                pid,
                                format!("vertex {} maps to lvid {} beyond the graph", rec.vid, lvid),
                            ));
                        }
                        *self.graph.vertex_data_mut(lvid) = rec.vdata;
                        lvid
                    }
                    None => {
                        // Singleton this worker has never seen an edge for.
                        let lvid = store.push_new(rec.vid);
                        self.graph.add_vertex(lvid, rec.vdata);
                        lvid
                    }
                };
                let record = store.record_mut(lvid);
                record.owner = rec.owner;
                if record.num_in != 0 || record.num_out != 0 {
                    return Err(contract(
                        Phase::Assign,
                        pid,
                        format!("degree totals for vertex {} assigned twice", rec.vid),
                    ));
                }
                record.num_in = rec.num_in;
                record.num_out = rec.num_out;
                record.mirrors = rec.mirrors;
                record.mirrors.clear(rec.owner);
            }
        }
        assign_exchange.clear();
        info!(
            worker = pid.0,
            nverts = store.len(),
            owned = store.num_owned_by(pid),
            "ingress.finalize.assign"
        );

        // Phase 4: global statistics.
        let edge_counts = exchange_u64(self.transport.as_ref(), self.graph.num_edges() as u64)?;
        let nedges: u64 = edge_counts.iter().sum();
        let begin_eid: u64 = edge_counts[..pid.index()].iter().sum();

        let own_counts = exchange_u64(self.transport.as_ref(), store.num_owned_by(pid) as u64)?;
        let nverts: u64 = own_counts.iter().sum();

        let replica_counts = exchange_u64(self.transport.as_ref(), store.len() as u64)?;
        let nreplicas: u64 = replica_counts.iter().sum();

        info!(
            worker = pid.0,
            nedges, nverts, nreplicas, begin_eid, "ingress.finalize.stats"
        );

        Ok(PartitionedGraph {
            pid,
            graph: self.graph,
            store,
            nedges,
            nverts,
            nreplicas,
            begin_eid,
        })
    }
}

/// One worker's view of the finalized partition: the local subgraph plus
/// the vertex metadata a vertex program needs. Degree queries answer with
/// the global totals decided at the negotiator, which for non-owner
/// replicas differ from the local CSR's counts.
pub struct PartitionedGraph<G: LocalGraph> {
    pid: WorkerId,
    graph: G,
    store: VertexRecordStore,
    nedges: u64,
    nverts: u64,
    nreplicas: u64,
    begin_eid: u64,
}

impl<G: LocalGraph> PartitionedGraph<G> {
    pub fn pid(&self) -> WorkerId {
        self.pid
    }

    pub fn graph(&self) -> &G {
        &self.graph
    }

    pub fn lvid_of(&self, vid: Gvid) -> Option<Lvid> {
        self.store.lvid_of(vid)
    }

    pub fn vertex_record(&self, lvid: Lvid) -> &VertexRecord {
        self.store.record(lvid)
    }

    /// Owner of `vid`, if this worker holds a replica of it.
    pub fn owner(&self, vid: Gvid) -> Option<WorkerId> {
        self.lvid_of(vid).map(|l| self.store.record(l).owner)
    }

    /// Mirror set of `vid` as stored locally (owner excluded).
    pub fn mirrors(&self, vid: Gvid) -> Option<&MirrorSet> {
        self.lvid_of(vid).map(|l| &self.store.record(l).mirrors)
    }

    pub fn num_in_edges(&self, vid: Gvid) -> Option<u64> {
        self.lvid_of(vid).map(|l| self.store.record(l).num_in)
    }

    pub fn num_out_edges(&self, vid: Gvid) -> Option<u64> {
        self.lvid_of(vid).map(|l| self.store.record(l).num_out)
    }

    /// Records of every replica this worker holds, in lvid order.
    pub fn local_vertices(&self) -> impl Iterator<Item = &VertexRecord> {
        self.store.records()
    }

    pub fn num_local_vertices(&self) -> usize {
        self.store.len()
    }

    pub fn num_local_own_vertices(&self) -> usize {
        self.store.num_owned_by(self.pid)
    }

    /// Total edges across the cluster.
    pub fn nedges(&self) -> u64 {
        self.nedges
    }

    /// Distinct vertices across the cluster.
    pub fn nverts(&self) -> u64 {
        self.nverts
    }

    /// Total replicas across the cluster; `nreplicas / nverts` is the
    /// replication factor.
    pub fn nreplicas(&self) -> u64 {
        self.nreplicas
    }

    /// First global edge id owned by this worker (exclusive prefix sum of
    /// per-worker edge counts).
    pub fn begin_eid(&self) -> u64 {
        self.begin_eid
    }

    pub fn replication_factor(&self) -> f64 {
        if self.nverts == 0 {
            0.0
        } else {
            self.nreplicas as f64 / self.nverts as f64
        }
    }
}

fn all_to_all_records<T: WireRecord>(
    transport: &dyn Transport,
    pid: WorkerId,
    outbound: Vec<Vec<T>>,
) -> Result<Vec<Vec<T>>> {
    let frames = outbound
        .iter()
        .map(|batch| encode_frame(pid, batch))
        .collect();
    let inbound = transport.all_to_all(frames)?;
    inbound
        .into_iter()
        .enumerate()
        .map(|(sender, frame)| {
            let (frame_sender, batch) = decode_frame::<T>(&frame, transport.nworkers())?;
            if frame_sender.index() != sender {
                return Err(TesseraError::Frame("all_to_all sender mismatch"));
            }
            Ok(batch)
        })
        .collect()
}

fn exchange_u64(transport: &dyn Transport, value: u64) -> Result<Vec<u64>> {
    let outbound = (0..transport.nworkers())
        .map(|_| value.to_le_bytes().to_vec())
        .collect();
    transport
        .all_to_all(outbound)?
        .into_iter()
        .map(|bytes| wire::Cursor::new(&bytes).read_u64())
        .collect()
}

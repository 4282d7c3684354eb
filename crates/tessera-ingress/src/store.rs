use std::collections::HashMap;

use tessera_types::{Gvid, Lvid, MirrorSet, WorkerId};

/// Per-vertex metadata as seen by one worker after finalize. `mirrors`
/// excludes the owner by convention; degree totals are the global sums
/// decided at the negotiator, not local CSR counts.
#[derive(Clone, Debug)]
pub struct VertexRecord {
    pub gvid: Gvid,
    pub owner: WorkerId,
    pub mirrors: MirrorSet,
    pub num_in: u64,
    pub num_out: u64,
}

impl VertexRecord {
    fn unassigned(gvid: Gvid, nworkers: usize) -> Self {
        Self {
            gvid,
            owner: WorkerId(u16::MAX),
            mirrors: MirrorSet::new(nworkers),
            num_in: 0,
            num_out: 0,
        }
    }
}

/// Dense table of vertex records indexed by local id, with the
/// `gvid -> lvid` companion index. Local ids are handed out in first-seen
/// order, so the table never has holes. Only the ingress coordinator
/// mutates it; graph consumers read it through `PartitionedGraph`.
pub struct VertexRecordStore {
    nworkers: usize,
    records: Vec<VertexRecord>,
    vid2lvid: HashMap<Gvid, Lvid>,
}

impl VertexRecordStore {
    pub fn new(nworkers: usize) -> Self {
        Self {
            nworkers,
            records: Vec::new(),
            vid2lvid: HashMap::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.vid2lvid.len()
    }

    pub fn is_empty(&self) -> bool {
        self.vid2lvid.is_empty()
    }

    pub fn lvid_of(&self, gvid: Gvid) -> Option<Lvid> {
        self.vid2lvid.get(&gvid).copied()
    }

    /// Local id for `gvid`, assigning the next dense one on first sight.
    /// Used during edge materialization, before the record table exists.
    pub fn intern(&mut self, gvid: Gvid) -> Lvid {
        let next = Lvid(self.vid2lvid.len() as u32);
        *self.vid2lvid.entry(gvid).or_insert(next)
    }

    /// Sizes the record table to the interned id range and stamps each
    /// record's gvid. Called once, after edge materialization.
    pub fn build_records(&mut self) {
        debug_assert!(self.records.is_empty());
        self.records = vec![VertexRecord::unassigned(Gvid(u64::MAX), self.nworkers); self.len()];
        for (&gvid, &lvid) in &self.vid2lvid {
            self.records[lvid.index()].gvid = gvid;
        }
    }

    /// Registers a vertex first seen after materialization (a singleton
    /// arriving with its negotiator record). Returns its new local id.
    pub fn push_new(&mut self, gvid: Gvid) -> Lvid {
        debug_assert!(!self.vid2lvid.contains_key(&gvid));
        let lvid = Lvid(self.records.len() as u32);
        self.vid2lvid.insert(gvid, lvid);
        self.records.push(VertexRecord::unassigned(gvid, self.nworkers));
        lvid
    }

    pub fn record(&self, lvid: Lvid) -> &VertexRecord {
        &self.records[lvid.index()]
    }

    pub fn record_mut(&mut self, lvid: Lvid) -> &mut VertexRecord {
        &mut self.records[lvid.index()]
    }

    pub fn records(&self) -> impl Iterator<Item = &VertexRecord> {
        self.records.iter()
    }

    /// All `(gvid, lvid)` pairs, in arbitrary order.
    pub fn vid_map(&self) -> impl Iterator<Item = (Gvid, Lvid)> + '_ {
        self.vid2lvid.iter().map(|(&g, &l)| (g, l))
    }

    pub fn num_owned_by(&self, worker: WorkerId) -> usize {
        self.records.iter().filter(|r| r.owner == worker).count()
    }
}

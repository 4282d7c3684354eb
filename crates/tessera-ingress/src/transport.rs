use std::collections::VecDeque;
use std::sync::{Arc, Barrier};

use parking_lot::Mutex;
use tessera_types::{Result, TesseraError, WorkerId};

/// Upper bound on undelivered frames per worker; exceeding it means a
/// producer is outrunning the drain by orders of magnitude.
const MAX_MAILBOX_FRAMES: usize = 1 << 16;

/// Reliable point-to-point messaging plus the two collectives the ingress
/// protocol needs. One instance per worker ("endpoint").
///
/// Delivery is FIFO per (sender, receiver) pair. The first byte of every
/// frame is a record type tag; receivers demultiplex a shared transport by
/// pulling frames for one tag at a time.
pub trait Transport: Send + Sync {
    fn pid(&self) -> WorkerId;
    fn nworkers(&self) -> usize;

    /// Queue a frame for `dst`. May be called from any thread.
    fn send(&self, dst: WorkerId, frame: Vec<u8>) -> Result<()>;

    /// Pop the next delivered frame whose tag byte equals `tag`, with its
    /// sender. `None` when no matching frame is pending.
    fn try_recv(&self, tag: u8) -> Result<Option<(WorkerId, Vec<u8>)>>;

    /// Collective barrier: blocks until every worker has entered.
    fn barrier(&self) -> Result<()>;

    /// Collective exchange. Returns `inbound` where `inbound[p]` is the
    /// buffer worker `p` placed at index `self.pid()` of its own `out`.
    fn all_to_all(&self, out: Vec<Vec<u8>>) -> Result<Vec<Vec<u8>>>;
}

/// In-process cluster: every worker is a thread in the same process and
/// frames move between per-worker mailboxes under a mutex. Delivery is
/// synchronous at `send`, so the exchange's flush-then-barrier contract
/// holds trivially.
pub struct LocalCluster;

impl LocalCluster {
    /// One endpoint per worker. Endpoints are cheap to move into worker
    /// threads; drop order does not matter once the last collective has
    /// completed.
    pub fn endpoints(nworkers: usize) -> Vec<LocalEndpoint> {
        assert!(nworkers > 0 && nworkers <= u16::MAX as usize);
        let shared = Arc::new(Shared {
            nworkers,
            mailboxes: (0..nworkers).map(|_| Mutex::new(VecDeque::new())).collect(),
            barrier: Barrier::new(nworkers),
            a2a: Mutex::new(vec![(0..nworkers).map(|_| None).collect(); nworkers]),
        });
        (0..nworkers)
            .map(|pid| LocalEndpoint {
                pid: WorkerId(pid as u16),
                shared: Arc::clone(&shared),
            })
            .collect()
    }
}

struct Shared {
    nworkers: usize,
    mailboxes: Vec<Mutex<VecDeque<(WorkerId, Vec<u8>)>>>,
    barrier: Barrier,
    /// `a2a[sender][receiver]` deposit matrix for the collective exchange.
    a2a: Mutex<Vec<Vec<Option<Vec<u8>>>>>,
}

pub struct LocalEndpoint {
    pid: WorkerId,
    shared: Arc<Shared>,
}

impl LocalEndpoint {
    /// A peer endpoint that has been dropped can never reach a collective
    /// again; fail fast instead of blocking forever.
    fn check_peers(&self) -> Result<()> {
        if Arc::strong_count(&self.shared) < self.shared.nworkers {
            return Err(TesseraError::Transport(
                "peer endpoint dropped before collective".into(),
            ));
        }
        Ok(())
    }
}

impl Transport for LocalEndpoint {
    fn pid(&self) -> WorkerId {
        self.pid
    }

    fn nworkers(&self) -> usize {
        self.shared.nworkers
    }

    fn send(&self, dst: WorkerId, frame: Vec<u8>) -> Result<()> {
        if frame.is_empty() {
            return Err(TesseraError::Invalid("cannot send an empty frame"));
        }
        let mailbox = self
            .shared
            .mailboxes
            .get(dst.index())
            .ok_or(TesseraError::Invalid("destination worker out of range"))?;
        let mut queue = mailbox.lock();
        if queue.len() >= MAX_MAILBOX_FRAMES {
            return Err(TesseraError::Capacity(dst));
        }
        queue.push_back((self.pid, frame));
        Ok(())
    }

    fn try_recv(&self, tag: u8) -> Result<Option<(WorkerId, Vec<u8>)>> {
        let mut queue = self.shared.mailboxes[self.pid.index()].lock();
        let hit = queue.iter().position(|(_, frame)| frame[0] == tag);
        Ok(hit.and_then(|i| queue.remove(i)))
    }

    fn barrier(&self) -> Result<()> {
        self.check_peers()?;
        self.shared.barrier.wait();
        Ok(())
    }

    fn all_to_all(&self, out: Vec<Vec<u8>>) -> Result<Vec<Vec<u8>>> {
        let n = self.shared.nworkers;
        if out.len() != n {
            return Err(TesseraError::Invalid("all_to_all row length != nworkers"));
        }
        self.check_peers()?;

        {
            let mut matrix = self.shared.a2a.lock();
            for (receiver, buf) in out.into_iter().enumerate() {
                matrix[self.pid.index()][receiver] = Some(buf);
            }
        }
        self.shared.barrier.wait();

        let inbound = {
            let mut matrix = self.shared.a2a.lock();
            (0..n)
                .map(|sender| {
                    matrix[sender][self.pid.index()]
                        .take()
                        .ok_or_else(|| TesseraError::Transport("all_to_all cell missing".into()))
                })
                .collect::<Result<Vec<_>>>()?
        };
        // Nobody reuses the matrix until every worker has collected.
        self.shared.barrier.wait();
        Ok(inbound)
    }
}

use std::collections::VecDeque;
use std::sync::mpsc::{self, Receiver, SyncSender};
use std::sync::Arc;
use std::thread;

use parking_lot::Mutex;
use tessera_types::{Result, TesseraError, WorkerId};

use crate::records::{decode_frame, encode_frame, frame_item_count, WireRecord};
use crate::transport::Transport;

/// Items accumulated per destination before a batch is shipped.
pub const DEFAULT_BATCH_ITEMS: usize = 4096;

/// Batches in flight to the flusher before producers block. This is the
/// memory backpressure cap: a stalled transport stops producers instead
/// of growing the queue.
const FLUSH_QUEUE_BATCHES: usize = 64;

enum FlushMsg<T> {
    Batch(WorkerId, Vec<T>),
    Shutdown,
}

/// Per-destination outbound FIFO with background flushing and a
/// collective drain.
///
/// Producers call [`send`](Self::send) concurrently without per-item
/// blocking; full batches are handed to a flusher thread that encodes
/// them into frames and ships them over the transport. The lifecycle is
/// one cycle per exchange: `send* -> flush -> recv* -> clear`. `flush` is
/// collective (it ends in a transport barrier), after which every frame
/// addressed to this worker has been delivered.
pub struct BufferedExchange<T: WireRecord> {
    transport: Arc<dyn Transport>,
    batch_items: usize,
    bufs: Vec<Mutex<Vec<T>>>,
    tx: Option<SyncSender<FlushMsg<T>>>,
    flusher: Option<thread::JoinHandle<Result<()>>>,
    inbox: VecDeque<(WorkerId, Vec<u8>)>,
    pending_items: usize,
}

impl<T: WireRecord> BufferedExchange<T> {
    pub fn new(transport: Arc<dyn Transport>) -> Self {
        Self::with_batch_items(transport, DEFAULT_BATCH_ITEMS)
    }

    pub fn with_batch_items(transport: Arc<dyn Transport>, batch_items: usize) -> Self {
        let nworkers = transport.nworkers();
        let (tx, rx) = mpsc::sync_channel(FLUSH_QUEUE_BATCHES);
        let flusher_transport = Arc::clone(&transport);
        let flusher = thread::spawn(move || flusher_loop(flusher_transport, rx));
        Self {
            transport,
            batch_items: batch_items.max(1),
            bufs: (0..nworkers).map(|_| Mutex::new(Vec::new())).collect(),
            tx: Some(tx),
            flusher: Some(flusher),
            inbox: VecDeque::new(),
            pending_items: 0,
        }
    }

    /// Appends `item` to the buffer for `dst`; ships the buffer to the
    /// flusher when it reaches the batch threshold. Blocks only when the
    /// flusher queue is at capacity.
    pub fn send(&self, dst: WorkerId, item: T) -> Result<()> {
        let tx = self
            .tx
            .as_ref()
            .ok_or(TesseraError::Invalid("exchange send after flush"))?;
        let buf = self
            .bufs
            .get(dst.index())
            .ok_or(TesseraError::Invalid("exchange destination out of range"))?;
        let mut buf = buf.lock();
        buf.push(item);
        if buf.len() >= self.batch_items {
            let full = std::mem::replace(&mut *buf, Vec::with_capacity(self.batch_items));
            // Hand off while holding the destination lock so batches for
            // one destination stay in send order.
            tx.send(FlushMsg::Batch(dst, full))
                .map_err(|_| TesseraError::Transport("exchange flusher stopped".into()))?;
        }
        Ok(())
    }

    /// Ships all residual buffers, stops the flusher, then barriers.
    /// Afterwards every frame sent to this worker before any peer's
    /// `flush` has been delivered.
    pub fn flush(&mut self) -> Result<()> {
        let tx = self
            .tx
            .take()
            .ok_or(TesseraError::Invalid("exchange already flushed"))?;
        // A failed handoff means the flusher died; fall through to the
        // join so its actual error surfaces instead of a generic one.
        let mut handoff_failed = false;
        for (dst, buf) in self.bufs.iter().enumerate() {
            let batch = std::mem::take(&mut *buf.lock());
            if !batch.is_empty() && tx.send(FlushMsg::Batch(WorkerId(dst as u16), batch)).is_err()
            {
                handoff_failed = true;
                break;
            }
        }
        let _ = tx.send(FlushMsg::Shutdown);
        drop(tx);
        let flusher = self
            .flusher
            .take()
            .ok_or(TesseraError::Invalid("exchange flusher missing"))?;
        match flusher.join() {
            Ok(result) => result?,
            Err(_) => {
                return Err(TesseraError::Transport("exchange flusher panicked".into()));
            }
        }
        if handoff_failed {
            return Err(TesseraError::Transport("exchange flusher stopped".into()));
        }
        self.transport.barrier()
    }

    /// Items delivered to this worker and not yet consumed by `recv`.
    /// Meaningful after `flush`.
    pub fn size(&mut self) -> Result<usize> {
        self.pump()?;
        Ok(self.pending_items)
    }

    /// Yields one received batch with its origin worker, `None` once
    /// drained.
    pub fn recv(&mut self) -> Result<Option<(WorkerId, Vec<T>)>> {
        self.pump()?;
        let Some((sender, frame)) = self.inbox.pop_front() else {
            return Ok(None);
        };
        let (frame_sender, batch) = decode_frame::<T>(&frame, self.transport.nworkers())?;
        if frame_sender != sender {
            return Err(TesseraError::Frame("frame sender mismatch"));
        }
        self.pending_items -= batch.len();
        Ok(Some((sender, batch)))
    }

    /// Releases buffer memory after a phase has consumed the exchange.
    pub fn clear(&mut self) {
        for buf in &self.bufs {
            *buf.lock() = Vec::new();
        }
        self.inbox = VecDeque::new();
        self.pending_items = 0;
    }

    fn pump(&mut self) -> Result<()> {
        while let Some((sender, frame)) = self.transport.try_recv(T::TAG)? {
            self.pending_items += frame_item_count::<T>(&frame)?;
            self.inbox.push_back((sender, frame));
        }
        Ok(())
    }
}

impl<T: WireRecord> Drop for BufferedExchange<T> {
    fn drop(&mut self) {
        self.tx.take();
        if let Some(flusher) = self.flusher.take() {
            let _ = flusher.join();
        }
    }
}

fn flusher_loop<T: WireRecord>(
    transport: Arc<dyn Transport>,
    rx: Receiver<FlushMsg<T>>,
) -> Result<()> {
    let pid = transport.pid();
    while let Ok(msg) = rx.recv() {
        match msg {
            FlushMsg::Batch(dst, batch) => {
                transport.send(dst, encode_frame(pid, &batch))?;
            }
            FlushMsg::Shutdown => break,
        }
    }
    Ok(())
}

use tessera_types::wire::{self, Cursor};
use tessera_types::{Gvid, MirrorSet, Result, TesseraError, WorkerId};

/// A record type that can ride an exchange frame. Frames carry a batch of
/// one record type: `tag, sender, count, (len, body)*` — every integer
/// little-endian, lengths LEB128, payload blobs varint-delimited.
pub trait WireRecord: Send + 'static {
    const TAG: u8;
    fn encode(&self, buf: &mut Vec<u8>);
    fn decode(cur: &mut Cursor<'_>, nworkers: usize) -> Result<Self>
    where
        Self: Sized;
}

/// One ingested edge on its way to the worker that will materialize it.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct EdgeBufferRecord {
    pub src: Gvid,
    pub dst: Gvid,
    pub edata: Vec<u8>,
}

impl WireRecord for EdgeBufferRecord {
    const TAG: u8 = 1;

    fn encode(&self, buf: &mut Vec<u8>) {
        wire::put_u64(buf, self.src.0);
        wire::put_u64(buf, self.dst.0);
        wire::put_blob(buf, &self.edata);
    }

    fn decode(cur: &mut Cursor<'_>, _nworkers: usize) -> Result<Self> {
        Ok(Self {
            src: Gvid(cur.read_u64()?),
            dst: Gvid(cur.read_u64()?),
            edata: cur.read_blob()?.to_vec(),
        })
    }
}

/// One vertex payload on its way to the vertex's negotiator.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct VertexBufferRecord {
    pub vid: Gvid,
    pub vdata: Vec<u8>,
}

impl WireRecord for VertexBufferRecord {
    const TAG: u8 = 2;

    fn encode(&self, buf: &mut Vec<u8>) {
        wire::put_u64(buf, self.vid.0);
        wire::put_blob(buf, &self.vdata);
    }

    fn decode(cur: &mut Cursor<'_>, _nworkers: usize) -> Result<Self> {
        Ok(Self {
            vid: Gvid(cur.read_u64()?),
            vdata: cur.read_blob()?.to_vec(),
        })
    }
}

/// One worker's local degree contribution for one vertex, reported to the
/// vertex's negotiator during the shuffle phase.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ShuffleRecord {
    pub vid: Gvid,
    pub num_in: u32,
    pub num_out: u32,
}

impl WireRecord for ShuffleRecord {
    const TAG: u8 = 3;

    fn encode(&self, buf: &mut Vec<u8>) {
        wire::put_u64(buf, self.vid.0);
        wire::put_u32(buf, self.num_in);
        wire::put_u32(buf, self.num_out);
    }

    fn decode(cur: &mut Cursor<'_>, _nworkers: usize) -> Result<Self> {
        Ok(Self {
            vid: Gvid(cur.read_u64()?),
            num_in: cur.read_u32()?,
            num_out: cur.read_u32()?,
        })
    }
}

/// The authoritative per-vertex decision, broadcast by the negotiator to
/// every mirror. Degree totals are sums of per-worker `u32` contributions
/// and therefore widen to `u64`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct NegotiatorRecord {
    pub vid: Gvid,
    pub num_in: u64,
    pub num_out: u64,
    pub owner: WorkerId,
    pub mirrors: MirrorSet,
    pub vdata: Vec<u8>,
}

impl NegotiatorRecord {
    /// Accumulation seed used at the negotiator before any evidence has
    /// arrived. The owner stays unassigned until the assignment pass.
    pub fn empty(vid: Gvid, nworkers: usize) -> Self {
        Self {
            vid,
            num_in: 0,
            num_out: 0,
            owner: WorkerId(u16::MAX),
            mirrors: MirrorSet::new(nworkers),
            vdata: Vec::new(),
        }
    }
}

impl WireRecord for NegotiatorRecord {
    const TAG: u8 = 4;

    fn encode(&self, buf: &mut Vec<u8>) {
        wire::put_u64(buf, self.vid.0);
        wire::put_u64(buf, self.num_in);
        wire::put_u64(buf, self.num_out);
        wire::put_u16(buf, self.owner.0);
        self.mirrors.to_bytes(buf);
        wire::put_blob(buf, &self.vdata);
    }

    fn decode(cur: &mut Cursor<'_>, nworkers: usize) -> Result<Self> {
        let vid = Gvid(cur.read_u64()?);
        let num_in = cur.read_u64()?;
        let num_out = cur.read_u64()?;
        let owner = WorkerId(cur.read_u16()?);
        let mirrors =
            MirrorSet::from_bytes(nworkers, cur.read_bytes(MirrorSet::wire_len(nworkers))?)?;
        let vdata = cur.read_blob()?.to_vec();
        Ok(Self {
            vid,
            num_in,
            num_out,
            owner,
            mirrors,
            vdata,
        })
    }
}

/// Encodes a batch into one frame.
pub(crate) fn encode_frame<T: WireRecord>(sender: WorkerId, batch: &[T]) -> Vec<u8> {
    let mut frame = Vec::with_capacity(16 + batch.len() * 16);
    frame.push(T::TAG);
    wire::put_u16(&mut frame, sender.0);
    wire::put_uvarint(&mut frame, batch.len() as u64);
    let mut body = Vec::new();
    for record in batch {
        body.clear();
        record.encode(&mut body);
        wire::put_uvarint(&mut frame, body.len() as u64);
        frame.extend_from_slice(&body);
    }
    frame
}

/// Parses only the frame header; used to size receive buffers without
/// decoding the records yet.
pub(crate) fn frame_item_count<T: WireRecord>(frame: &[u8]) -> Result<usize> {
    let mut cur = Cursor::new(frame);
    if cur.read_u8()? != T::TAG {
        return Err(TesseraError::Frame("frame tag mismatch"));
    }
    let _sender = cur.read_u16()?;
    let count = cur.read_uvarint()?;
    if count > cur.remaining() as u64 {
        return Err(TesseraError::Frame("frame count exceeds frame size"));
    }
    Ok(count as usize)
}

pub(crate) fn decode_frame<T: WireRecord>(
    frame: &[u8],
    nworkers: usize,
) -> Result<(WorkerId, Vec<T>)> {
    let mut cur = Cursor::new(frame);
    if cur.read_u8()? != T::TAG {
        return Err(TesseraError::Frame("frame tag mismatch"));
    }
    let sender = WorkerId(cur.read_u16()?);
    let count = cur.read_uvarint()?;
    if count > cur.remaining() as u64 {
        return Err(TesseraError::Frame("frame count exceeds frame size"));
    }
    let mut batch = Vec::with_capacity(count as usize);
    for _ in 0..count {
        let len = cur.read_uvarint()? as usize;
        let mut body = Cursor::new(cur.read_bytes(len)?);
        batch.push(T::decode(&mut body, nworkers)?);
        if !body.is_empty() {
            return Err(TesseraError::Frame("record shorter than its length"));
        }
    }
    if !cur.is_empty() {
        return Err(TesseraError::Frame("trailing bytes after frame"));
    }
    Ok((sender, batch))
}

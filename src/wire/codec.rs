//! Fixed-layout payload records and their (de)serialization.
//!
//! Every record starts with a `u32` identity tag and has a fixed encoded
//! size determined by that tag, so a datagram can be walked record by
//! record without a length prefix. All integers are little-endian.
//! Strings inside records are NUL-terminated within their fixed capacity.

use crate::buffer::{PixelFormat, PlaneLayout, TensorType, MAX_MEM_BLOCKS, MAX_PLANES, MAX_TENSOR_DIMS};
use crate::error::{Error, Result};
use crate::meta::{
    ClassEntry, LandmarkPoint, MetaRecord, Rect, SkeletonLink, FIELDS_CAPACITY, LABEL_CAPACITY,
    MAX_CLASS_ENTRIES, MAX_LANDMARK_POINTS, MAX_SKELETON_LINKS, META_CAPACITY, NAME_CAPACITY,
};
use smallvec::SmallVec;
use tracing::warn;

/// Maximum encoded size of one datagram; also the receive buffer size.
pub const MAX_MESSAGE_SIZE: usize = 65536;

/// Capacity of a text block's contents.
pub const TEXT_CAPACITY: usize = 1024;

/// Wire value meaning "no timestamp".
pub const TIME_NONE: u64 = u64::MAX;

/// Convert an optional timestamp to its wire form (nanoseconds,
/// [`TIME_NONE`] if absent).
pub fn dur_to_wire(dur: Option<std::time::Duration>) -> u64 {
    dur.map_or(TIME_NONE, |d| d.as_nanos().min(u64::MAX as u128 - 1) as u64)
}

/// Convert a wire timestamp back to an optional duration.
pub fn wire_to_dur(v: u64) -> Option<std::time::Duration> {
    (v != TIME_NONE).then(|| std::time::Duration::from_nanos(v))
}

/// Message identity tags.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum MessageId {
    /// End of stream.
    Eos = 0,
    /// Peer-initiated disconnect request.
    Disconnect = 1,
    /// Buffer description (ids, timestamps, pool flag).
    BufferInfo = 2,
    /// Video frame memory block.
    Frame = 3,
    /// Tensor memory block.
    Tensor = 4,
    /// Inline text memory block.
    Text = 5,
    /// Acknowledgment naming buffer ids handed back to the sender.
    ReturnBuffer = 6,
    /// Number of descriptors accompanying this message.
    FdCount = 7,
    /// Protection (encryption-parameter) metadata.
    ProtectionMeta = 8,
    /// Region-of-interest metadata.
    RoiMeta = 9,
    /// Classification metadata.
    ClassMeta = 10,
    /// Landmarks metadata.
    LandmarksMeta = 11,
}

impl MessageId {
    fn from_u32(v: u32) -> Option<Self> {
        Some(match v {
            0 => MessageId::Eos,
            1 => MessageId::Disconnect,
            2 => MessageId::BufferInfo,
            3 => MessageId::Frame,
            4 => MessageId::Tensor,
            5 => MessageId::Text,
            6 => MessageId::ReturnBuffer,
            7 => MessageId::FdCount,
            8 => MessageId::ProtectionMeta,
            9 => MessageId::RoiMeta,
            10 => MessageId::ClassMeta,
            11 => MessageId::LandmarksMeta,
            _ => return None,
        })
    }
}

// Fixed record sizes, including the 4-byte identity tag.
const MSG_SIZE: usize = 4;
const BUFFER_INFO_SIZE: usize = 4 + 4 * MAX_MEM_BLOCKS + 8 + 8 + 8 + 4;
const FRAME_SIZE: usize = 4 + 4 * 4 + 8 * MAX_PLANES + 4 * MAX_PLANES + 4 + 8 + 8;
const TENSOR_SIZE: usize = 4 + 4 + 4 + 4 * MAX_TENSOR_DIMS + 8 + 8;
const TEXT_SIZE: usize = 4 + TEXT_CAPACITY + 8 + 8;
const RETURN_SIZE: usize = 4 + 4 * MAX_MEM_BLOCKS;
const FD_COUNT_SIZE: usize = 4 + 4;
const PROTECTION_SIZE: usize = 4 + META_CAPACITY + 8 + 8;
const ROI_SIZE: usize = 4 + 16 + LABEL_CAPACITY + FIELDS_CAPACITY + 8 + 8;
const CLASS_SIZE: usize = 4 + 4 + MAX_CLASS_ENTRIES * (4 + 4 + LABEL_CAPACITY);
const LANDMARKS_SIZE: usize = 4
    + 4
    + MAX_LANDMARK_POINTS * (4 + 4 + 4 + 4 + NAME_CAPACITY)
    + 4
    + MAX_SKELETON_LINKS * 8;

fn record_size(id: MessageId) -> usize {
    match id {
        MessageId::Eos | MessageId::Disconnect => MSG_SIZE,
        MessageId::BufferInfo => BUFFER_INFO_SIZE,
        MessageId::Frame => FRAME_SIZE,
        MessageId::Tensor => TENSOR_SIZE,
        MessageId::Text => TEXT_SIZE,
        MessageId::ReturnBuffer => RETURN_SIZE,
        MessageId::FdCount => FD_COUNT_SIZE,
        MessageId::ProtectionMeta => PROTECTION_SIZE,
        MessageId::RoiMeta => ROI_SIZE,
        MessageId::ClassMeta => CLASS_SIZE,
        MessageId::LandmarksMeta => LANDMARKS_SIZE,
    }
}

/// Control message kinds (identity-only records).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlKind {
    /// End of stream.
    Eos,
    /// Disconnect request.
    Disconnect,
}

/// Buffer description record.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BufferInfoPayload {
    /// Per-block buffer ids, in block order.
    pub buf_ids: SmallVec<[i32; MAX_MEM_BLOCKS]>,
    /// Presentation timestamp in nanoseconds, [`TIME_NONE`] if absent.
    pub pts: u64,
    /// Decode timestamp in nanoseconds, [`TIME_NONE`] if absent.
    pub dts: u64,
    /// Duration in nanoseconds, [`TIME_NONE`] if absent.
    pub duration: u64,
    /// Whether the buffer came from a shared pool (descriptors are cached
    /// and reused on the receiving side).
    pub use_buffer_pool: bool,
}

/// Memory-block record, one per block in the logical buffer.
#[derive(Debug, Clone, PartialEq)]
pub enum BlockPayload {
    /// Inline text bytes.
    Text(Vec<u8>),
    /// Tensor block description; data travels by descriptor.
    Tensor {
        /// Element type.
        ty: TensorType,
        /// Shape, outermost first.
        dims: SmallVec<[u32; MAX_TENSOR_DIMS]>,
        /// Used bytes.
        size: u64,
        /// Capacity bytes.
        maxsize: u64,
    },
    /// Frame block description; data travels by descriptor.
    Frame {
        /// Frame width in pixels.
        width: u32,
        /// Frame height in pixels.
        height: u32,
        /// Pixel format code.
        format: PixelFormat,
        /// Per-plane offsets and strides.
        planes: SmallVec<[PlaneLayout; MAX_PLANES]>,
        /// Frame flags, carried verbatim.
        flags: u32,
        /// Used bytes.
        size: u64,
        /// Capacity bytes.
        maxsize: u64,
    },
}

/// One decoded (or to-be-encoded) datagram: the set of records that travel
/// together.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PayloadSet {
    /// Control message, if any.
    pub control: Option<ControlKind>,
    /// Buffer description, present on data messages.
    pub buffer_info: Option<BufferInfoPayload>,
    /// Ids being handed back, present on return messages.
    pub return_ids: Option<SmallVec<[i32; MAX_MEM_BLOCKS]>>,
    /// Number of descriptors accompanying this message as ancillary data,
    /// or the number of ids a return message names.
    pub fd_count: Option<i32>,
    /// Memory-block records, in block order.
    pub blocks: Vec<BlockPayload>,
    /// Metadata records.
    pub metas: Vec<MetaRecord>,
}

impl PayloadSet {
    /// A set carrying only a control message.
    pub fn control(kind: ControlKind) -> Self {
        Self {
            control: Some(kind),
            ..Default::default()
        }
    }

    /// A return message naming `ids`.
    pub fn return_buffer(ids: SmallVec<[i32; MAX_MEM_BLOCKS]>) -> Self {
        let n = ids.len() as i32;
        Self {
            return_ids: Some(ids),
            fd_count: Some(n),
            ..Default::default()
        }
    }

    /// Whether this set is a data message (carries a buffer description).
    pub fn is_data(&self) -> bool {
        self.buffer_info.is_some()
    }
}

struct Writer {
    buf: Vec<u8>,
}

impl Writer {
    fn new() -> Self {
        Self { buf: Vec::with_capacity(256) }
    }

    fn put_u32(&mut self, v: u32) {
        self.buf.extend_from_slice(&v.to_le_bytes());
    }

    fn put_i32(&mut self, v: i32) {
        self.buf.extend_from_slice(&v.to_le_bytes());
    }

    fn put_u64(&mut self, v: u64) {
        self.buf.extend_from_slice(&v.to_le_bytes());
    }

    fn put_f32(&mut self, v: f32) {
        self.buf.extend_from_slice(&v.to_le_bytes());
    }

    // Writes exactly `cap` bytes: the content followed by zero padding.
    // The caller guarantees `content.len() <= cap`.
    fn put_fixed(&mut self, content: &[u8], cap: usize) {
        debug_assert!(content.len() <= cap);
        self.buf.extend_from_slice(content);
        self.buf.resize(self.buf.len() + (cap - content.len()), 0);
    }
}

struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8]> {
        if self.pos + n > self.buf.len() {
            return Err(Error::MalformedMessage("truncated record".into()));
        }
        let slice = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Ok(slice)
    }

    fn u32(&mut self) -> Result<u32> {
        Ok(u32::from_le_bytes(self.take(4)?.try_into().unwrap()))
    }

    fn i32(&mut self) -> Result<i32> {
        Ok(i32::from_le_bytes(self.take(4)?.try_into().unwrap()))
    }

    fn u64(&mut self) -> Result<u64> {
        Ok(u64::from_le_bytes(self.take(8)?.try_into().unwrap()))
    }

    fn f32(&mut self) -> Result<f32> {
        Ok(f32::from_le_bytes(self.take(4)?.try_into().unwrap()))
    }
}

// Clamp a string to fit a NUL-terminated fixed field, warning when content
// is lost. Truncation is defined, lossy behavior for labels and names;
// the terminating NUL always fits.
fn clamp_str<'a>(s: &'a str, cap: usize, what: &'static str) -> &'a [u8] {
    let max = cap - 1;
    if s.len() > max {
        warn!("{} truncated from {} to {} bytes", what, s.len(), max);
        let mut end = max;
        while !s.is_char_boundary(end) {
            end -= 1;
        }
        &s.as_bytes()[..end]
    } else {
        s.as_bytes()
    }
}

fn read_nul_str(bytes: &[u8]) -> String {
    let end = bytes.iter().position(|&b| b == 0).unwrap_or(bytes.len());
    String::from_utf8_lossy(&bytes[..end]).into_owned()
}

fn encode_ids(w: &mut Writer, ids: &[i32]) {
    for i in 0..MAX_MEM_BLOCKS {
        w.put_i32(ids.get(i).copied().unwrap_or(-1));
    }
}

fn encode_buffer_info(w: &mut Writer, info: &BufferInfoPayload) {
    w.put_u32(MessageId::BufferInfo as u32);
    encode_ids(w, &info.buf_ids);
    w.put_u64(info.pts);
    w.put_u64(info.dts);
    w.put_u64(info.duration);
    w.put_u32(info.use_buffer_pool as u32);
}

fn encode_block(w: &mut Writer, block: &BlockPayload) -> Result<()> {
    match block {
        BlockPayload::Text(contents) => {
            if contents.len() > TEXT_CAPACITY {
                return Err(Error::PayloadTooLarge("text", contents.len(), TEXT_CAPACITY));
            }
            w.put_u32(MessageId::Text as u32);
            w.put_fixed(contents, TEXT_CAPACITY);
            w.put_u64(contents.len() as u64);
            w.put_u64(TEXT_CAPACITY as u64);
        }
        BlockPayload::Tensor { ty, dims, size, maxsize } => {
            w.put_u32(MessageId::Tensor as u32);
            w.put_u32(ty.to_u32());
            w.put_u32(dims.len() as u32);
            for i in 0..MAX_TENSOR_DIMS {
                w.put_u32(dims.get(i).copied().unwrap_or(0));
            }
            w.put_u64(*size);
            w.put_u64(*maxsize);
        }
        BlockPayload::Frame { width, height, format, planes, flags, size, maxsize } => {
            w.put_u32(MessageId::Frame as u32);
            w.put_u32(*width);
            w.put_u32(*height);
            w.put_u32(format.0);
            w.put_u32(planes.len() as u32);
            for i in 0..MAX_PLANES {
                w.put_u64(planes.get(i).map_or(0, |p| p.offset));
            }
            for i in 0..MAX_PLANES {
                w.put_i32(planes.get(i).map_or(0, |p| p.stride));
            }
            w.put_u32(*flags);
            w.put_u64(*size);
            w.put_u64(*maxsize);
        }
    }
    Ok(())
}

fn encode_meta(w: &mut Writer, meta: &MetaRecord) -> Result<()> {
    match meta {
        MetaRecord::Protection(contents) => {
            // Opaque pre-serialized structure text: must fit, NUL included.
            if contents.len() + 1 > META_CAPACITY {
                return Err(Error::PayloadTooLarge(
                    "protection metadata",
                    contents.len() + 1,
                    META_CAPACITY,
                ));
            }
            w.put_u32(MessageId::ProtectionMeta as u32);
            w.put_fixed(contents.as_bytes(), META_CAPACITY);
            w.put_u64(contents.len() as u64);
            w.put_u64(META_CAPACITY as u64);
        }
        MetaRecord::Roi { rect, label, fields } => {
            w.put_u32(MessageId::RoiMeta as u32);
            w.put_i32(rect.x);
            w.put_i32(rect.y);
            w.put_u32(rect.width);
            w.put_u32(rect.height);
            let label = clamp_str(label, LABEL_CAPACITY, "roi label");
            let fields = clamp_str(fields, FIELDS_CAPACITY, "roi detection fields");
            w.put_fixed(label, LABEL_CAPACITY);
            w.put_fixed(fields, FIELDS_CAPACITY);
            w.put_u64((label.len() + fields.len()) as u64);
            w.put_u64((LABEL_CAPACITY + FIELDS_CAPACITY) as u64);
        }
        MetaRecord::Classification(entries) => {
            let n = entries.len().min(MAX_CLASS_ENTRIES);
            if entries.len() > n {
                warn!("classification truncated from {} to {} entries", entries.len(), n);
            }
            w.put_u32(MessageId::ClassMeta as u32);
            w.put_u32(n as u32);
            for i in 0..MAX_CLASS_ENTRIES {
                match entries.get(i).filter(|_| i < n) {
                    Some(e) => {
                        w.put_f32(e.confidence);
                        w.put_u32(e.color);
                        w.put_fixed(clamp_str(&e.label, LABEL_CAPACITY, "class label"), LABEL_CAPACITY);
                    }
                    None => {
                        w.put_f32(0.0);
                        w.put_u32(0);
                        w.put_fixed(&[], LABEL_CAPACITY);
                    }
                }
            }
        }
        MetaRecord::Landmarks { points, links } => {
            let n_points = points.len().min(MAX_LANDMARK_POINTS);
            if points.len() > n_points {
                warn!("landmarks truncated from {} to {} points", points.len(), n_points);
            }
            let n_links = links.len().min(MAX_SKELETON_LINKS);
            if links.len() > n_links {
                warn!("skeleton truncated from {} to {} links", links.len(), n_links);
            }
            w.put_u32(MessageId::LandmarksMeta as u32);
            w.put_u32(n_points as u32);
            for i in 0..MAX_LANDMARK_POINTS {
                match points.get(i).filter(|_| i < n_points) {
                    Some(p) => {
                        w.put_f32(p.x);
                        w.put_f32(p.y);
                        w.put_f32(p.confidence);
                        w.put_u32(p.color);
                        w.put_fixed(clamp_str(&p.name, NAME_CAPACITY, "landmark name"), NAME_CAPACITY);
                    }
                    None => {
                        w.put_f32(0.0);
                        w.put_f32(0.0);
                        w.put_f32(0.0);
                        w.put_u32(0);
                        w.put_fixed(&[], NAME_CAPACITY);
                    }
                }
            }
            w.put_u32(n_links as u32);
            for i in 0..MAX_SKELETON_LINKS {
                let link = links.get(i).filter(|_| i < n_links);
                w.put_u32(link.map_or(0, |l| l.a));
                w.put_u32(link.map_or(0, |l| l.b));
            }
        }
    }
    Ok(())
}

/// Encode one payload set into a single datagram.
///
/// Fails without side effects if any payload exceeds its fixed capacity;
/// the caller must not write anything to the socket in that case.
pub fn encode(set: &PayloadSet) -> Result<Vec<u8>> {
    let mut w = Writer::new();

    if let Some(n) = set.fd_count {
        w.put_u32(MessageId::FdCount as u32);
        w.put_i32(n);
    }

    if let Some(ref info) = set.buffer_info {
        encode_buffer_info(&mut w, info);
    }

    if let Some(kind) = set.control {
        w.put_u32(match kind {
            ControlKind::Eos => MessageId::Eos as u32,
            ControlKind::Disconnect => MessageId::Disconnect as u32,
        });
    }

    if let Some(ref ids) = set.return_ids {
        w.put_u32(MessageId::ReturnBuffer as u32);
        encode_ids(&mut w, ids);
    }

    for block in &set.blocks {
        encode_block(&mut w, block)?;
    }

    for meta in &set.metas {
        encode_meta(&mut w, meta)?;
    }

    if w.buf.len() > MAX_MESSAGE_SIZE {
        return Err(Error::PayloadTooLarge("message", w.buf.len(), MAX_MESSAGE_SIZE));
    }

    Ok(w.buf)
}

fn decode_buffer_info(r: &mut Reader<'_>) -> Result<BufferInfoPayload> {
    let mut buf_ids = SmallVec::new();
    let mut raw = [0i32; MAX_MEM_BLOCKS];
    for slot in raw.iter_mut() {
        *slot = r.i32()?;
    }
    // Ids are packed from the front; -1 marks unused slots.
    for &id in raw.iter().take_while(|&&id| id != -1) {
        buf_ids.push(id);
    }
    Ok(BufferInfoPayload {
        buf_ids,
        pts: r.u64()?,
        dts: r.u64()?,
        duration: r.u64()?,
        use_buffer_pool: r.u32()? != 0,
    })
}

fn decode_text(r: &mut Reader<'_>) -> Result<Vec<u8>> {
    let contents = r.take(TEXT_CAPACITY)?;
    let size = r.u64()? as usize;
    let maxsize = r.u64()? as usize;
    if size > maxsize || size > TEXT_CAPACITY {
        return Err(Error::MalformedMessage(format!(
            "text size {} exceeds capacity {}",
            size, TEXT_CAPACITY
        )));
    }
    Ok(contents[..size].to_vec())
}

fn decode_tensor(r: &mut Reader<'_>) -> Result<BlockPayload> {
    let ty_raw = r.u32()?;
    let ty = TensorType::from_u32(ty_raw)
        .ok_or_else(|| Error::MalformedMessage(format!("unknown tensor type {}", ty_raw)))?;
    let n_dims = r.u32()? as usize;
    if n_dims > MAX_TENSOR_DIMS {
        return Err(Error::MalformedMessage(format!("{} tensor dimensions", n_dims)));
    }
    let mut dims = SmallVec::new();
    for i in 0..MAX_TENSOR_DIMS {
        let d = r.u32()?;
        if i < n_dims {
            dims.push(d);
        }
    }
    let size = r.u64()?;
    let maxsize = r.u64()?;
    if size > maxsize {
        return Err(Error::MalformedMessage("tensor size exceeds maxsize".into()));
    }
    Ok(BlockPayload::Tensor { ty, dims, size, maxsize })
}

fn decode_frame(r: &mut Reader<'_>) -> Result<BlockPayload> {
    let width = r.u32()?;
    let height = r.u32()?;
    let format = PixelFormat(r.u32()?);
    let n_planes = r.u32()? as usize;
    if n_planes > MAX_PLANES {
        return Err(Error::MalformedMessage(format!("{} frame planes", n_planes)));
    }
    let mut offsets = [0u64; MAX_PLANES];
    for slot in offsets.iter_mut() {
        *slot = r.u64()?;
    }
    let mut strides = [0i32; MAX_PLANES];
    for slot in strides.iter_mut() {
        *slot = r.i32()?;
    }
    let planes = (0..n_planes)
        .map(|i| PlaneLayout { offset: offsets[i], stride: strides[i] })
        .collect();
    let flags = r.u32()?;
    let size = r.u64()?;
    let maxsize = r.u64()?;
    if size > maxsize {
        return Err(Error::MalformedMessage("frame size exceeds maxsize".into()));
    }
    Ok(BlockPayload::Frame { width, height, format, planes, flags, size, maxsize })
}

fn decode_protection(r: &mut Reader<'_>) -> Result<MetaRecord> {
    let contents = r.take(META_CAPACITY)?;
    let size = r.u64()? as usize;
    let maxsize = r.u64()? as usize;
    if size > maxsize || size > META_CAPACITY {
        return Err(Error::MalformedMessage(format!(
            "protection metadata size {} exceeds capacity {}",
            size, META_CAPACITY
        )));
    }
    Ok(MetaRecord::Protection(
        String::from_utf8_lossy(&contents[..size]).into_owned(),
    ))
}

fn decode_roi(r: &mut Reader<'_>) -> Result<MetaRecord> {
    let rect = Rect {
        x: r.i32()?,
        y: r.i32()?,
        width: r.u32()?,
        height: r.u32()?,
    };
    let label = read_nul_str(r.take(LABEL_CAPACITY)?);
    let fields = read_nul_str(r.take(FIELDS_CAPACITY)?);
    let size = r.u64()? as usize;
    let maxsize = r.u64()? as usize;
    if size > maxsize {
        return Err(Error::MalformedMessage("roi size exceeds maxsize".into()));
    }
    Ok(MetaRecord::Roi { rect, label, fields })
}

fn decode_class(r: &mut Reader<'_>) -> Result<MetaRecord> {
    let n = r.u32()? as usize;
    if n > MAX_CLASS_ENTRIES {
        return Err(Error::MalformedMessage(format!("{} classification entries", n)));
    }
    let mut entries = Vec::with_capacity(n);
    for i in 0..MAX_CLASS_ENTRIES {
        let confidence = r.f32()?;
        let color = r.u32()?;
        let label = read_nul_str(r.take(LABEL_CAPACITY)?);
        if i < n {
            entries.push(ClassEntry { label, confidence, color });
        }
    }
    Ok(MetaRecord::Classification(entries))
}

fn decode_landmarks(r: &mut Reader<'_>) -> Result<MetaRecord> {
    let n_points = r.u32()? as usize;
    if n_points > MAX_LANDMARK_POINTS {
        return Err(Error::MalformedMessage(format!("{} landmark points", n_points)));
    }
    let mut points = Vec::with_capacity(n_points);
    for i in 0..MAX_LANDMARK_POINTS {
        let x = r.f32()?;
        let y = r.f32()?;
        let confidence = r.f32()?;
        let color = r.u32()?;
        let name = read_nul_str(r.take(NAME_CAPACITY)?);
        if i < n_points {
            points.push(LandmarkPoint { name, x, y, confidence, color });
        }
    }
    let n_links = r.u32()? as usize;
    if n_links > MAX_SKELETON_LINKS {
        return Err(Error::MalformedMessage(format!("{} skeleton links", n_links)));
    }
    let mut links = Vec::with_capacity(n_links);
    for i in 0..MAX_SKELETON_LINKS {
        let a = r.u32()?;
        let b = r.u32()?;
        if i < n_links {
            links.push(SkeletonLink { a, b });
        }
    }
    Ok(MetaRecord::Landmarks { points, links })
}

/// Decode one datagram into a payload set.
///
/// Walks the concatenated records by identity tag. Any malformed record
/// fails the whole message; the caller drops it and keeps the connection.
pub fn decode(bytes: &[u8]) -> Result<PayloadSet> {
    let mut set = PayloadSet::default();
    let mut pos = 0usize;

    while pos < bytes.len() {
        if bytes.len() - pos < 4 {
            return Err(Error::MalformedMessage("trailing bytes".into()));
        }
        let tag = u32::from_le_bytes(bytes[pos..pos + 4].try_into().unwrap());
        let id = MessageId::from_u32(tag)
            .ok_or_else(|| Error::MalformedMessage(format!("unknown message identity {}", tag)))?;
        let size = record_size(id);
        if pos + size > bytes.len() {
            return Err(Error::MalformedMessage(format!(
                "record {:?} truncated: {} of {} bytes",
                id,
                bytes.len() - pos,
                size
            )));
        }

        let mut r = Reader::new(&bytes[pos + 4..pos + size]);
        match id {
            MessageId::Eos => set.control = Some(ControlKind::Eos),
            MessageId::Disconnect => set.control = Some(ControlKind::Disconnect),
            MessageId::BufferInfo => set.buffer_info = Some(decode_buffer_info(&mut r)?),
            MessageId::ReturnBuffer => {
                let mut ids = SmallVec::new();
                let mut raw = [0i32; MAX_MEM_BLOCKS];
                for slot in raw.iter_mut() {
                    *slot = r.i32()?;
                }
                for &rid in raw.iter().take_while(|&&rid| rid != -1) {
                    ids.push(rid);
                }
                set.return_ids = Some(ids);
            }
            MessageId::FdCount => set.fd_count = Some(r.i32()?),
            MessageId::Text => set.blocks.push(BlockPayload::Text(decode_text(&mut r)?)),
            MessageId::Tensor => set.blocks.push(decode_tensor(&mut r)?),
            MessageId::Frame => set.blocks.push(decode_frame(&mut r)?),
            MessageId::ProtectionMeta => set.metas.push(decode_protection(&mut r)?),
            MessageId::RoiMeta => set.metas.push(decode_roi(&mut r)?),
            MessageId::ClassMeta => set.metas.push(decode_class(&mut r)?),
            MessageId::LandmarksMeta => set.metas.push(decode_landmarks(&mut r)?),
        }

        pos += size;
    }

    Ok(set)
}

#[cfg(test)]
mod tests {
    use super::*;
    use smallvec::smallvec;

    fn frame_block() -> BlockPayload {
        BlockPayload::Frame {
            width: 1920,
            height: 1080,
            format: PixelFormat::NV12,
            planes: smallvec![
                PlaneLayout { offset: 0, stride: 1920 },
                PlaneLayout { offset: 1920 * 1080, stride: 1920 },
            ],
            flags: 0,
            size: 1920 * 1080 * 3 / 2,
            maxsize: 1920 * 1080 * 2,
        }
    }

    #[test]
    fn test_data_message_round_trip() {
        let set = PayloadSet {
            buffer_info: Some(BufferInfoPayload {
                buf_ids: smallvec![42],
                pts: 1_000_000,
                dts: 999_000,
                duration: 33_333,
                use_buffer_pool: true,
            }),
            fd_count: Some(1),
            blocks: vec![frame_block()],
            metas: vec![
                MetaRecord::Protection("application/x-cenc, iv=(buffer)abcd".into()),
                MetaRecord::Roi {
                    rect: Rect { x: 10, y: 20, width: 30, height: 40 },
                    label: "person".into(),
                    fields: "tracking-id=7".into(),
                },
                MetaRecord::Classification(vec![
                    ClassEntry { label: "cat".into(), confidence: 0.93, color: 0xff0000ff },
                    ClassEntry { label: "dog".into(), confidence: 0.07, color: 0x00ff00ff },
                ]),
                MetaRecord::Landmarks {
                    points: vec![LandmarkPoint {
                        name: "nose".into(),
                        x: 0.5,
                        y: 0.25,
                        confidence: 0.99,
                        color: 0xffffffff,
                    }],
                    links: vec![SkeletonLink { a: 0, b: 0 }],
                },
            ],
            ..Default::default()
        };

        let bytes = encode(&set).unwrap();
        let decoded = decode(&bytes).unwrap();
        assert_eq!(decoded, set);
    }

    #[test]
    fn test_tensor_round_trip() {
        let set = PayloadSet {
            buffer_info: Some(BufferInfoPayload {
                buf_ids: smallvec![7, 9],
                pts: TIME_NONE,
                dts: TIME_NONE,
                duration: TIME_NONE,
                use_buffer_pool: false,
            }),
            blocks: vec![
                BlockPayload::Tensor {
                    ty: TensorType::F32,
                    dims: smallvec![1, 224, 224, 3],
                    size: 602112,
                    maxsize: 602112,
                },
                BlockPayload::Tensor {
                    ty: TensorType::U8,
                    dims: smallvec![1, 1001],
                    size: 1001,
                    maxsize: 4096,
                },
            ],
            ..Default::default()
        };

        let bytes = encode(&set).unwrap();
        assert_eq!(decode(&bytes).unwrap(), set);
    }

    #[test]
    fn test_text_round_trip() {
        let set = PayloadSet {
            buffer_info: Some(BufferInfoPayload::default()),
            blocks: vec![BlockPayload::Text(b"subtitle line".to_vec())],
            ..Default::default()
        };

        let bytes = encode(&set).unwrap();
        assert_eq!(decode(&bytes).unwrap(), set);
    }

    #[test]
    fn test_control_messages_round_trip() {
        for kind in [ControlKind::Eos, ControlKind::Disconnect] {
            let bytes = encode(&PayloadSet::control(kind)).unwrap();
            assert_eq!(bytes.len(), 4);
            assert_eq!(decode(&bytes).unwrap().control, Some(kind));
        }
    }

    #[test]
    fn test_return_message_round_trip() {
        let set = PayloadSet::return_buffer(smallvec![42, 43, 44]);
        let bytes = encode(&set).unwrap();
        let decoded = decode(&bytes).unwrap();
        assert_eq!(decoded.return_ids.unwrap().as_slice(), &[42, 43, 44]);
        assert_eq!(decoded.fd_count, Some(3));
    }

    #[test]
    fn test_oversized_text_fails_encode() {
        let set = PayloadSet {
            blocks: vec![BlockPayload::Text(vec![b'x'; TEXT_CAPACITY + 1])],
            ..Default::default()
        };
        assert!(matches!(
            encode(&set),
            Err(Error::PayloadTooLarge("text", _, TEXT_CAPACITY))
        ));
    }

    #[test]
    fn test_oversized_protection_fails_encode() {
        let set = PayloadSet {
            metas: vec![MetaRecord::Protection("p".repeat(META_CAPACITY))],
            ..Default::default()
        };
        assert!(matches!(encode(&set), Err(Error::PayloadTooLarge(..))));
    }

    #[test]
    fn test_roi_label_truncates_losslessly_for_rest_of_record() {
        let set = PayloadSet {
            metas: vec![MetaRecord::Roi {
                rect: Rect { x: 1, y: 2, width: 3, height: 4 },
                label: "L".repeat(LABEL_CAPACITY * 2),
                fields: "f=1".into(),
            }],
            ..Default::default()
        };

        let bytes = encode(&set).unwrap();
        let decoded = decode(&bytes).unwrap();
        match &decoded.metas[0] {
            MetaRecord::Roi { rect, label, fields } => {
                assert_eq!(*rect, Rect { x: 1, y: 2, width: 3, height: 4 });
                assert_eq!(label.len(), LABEL_CAPACITY - 1);
                assert_eq!(fields, "f=1");
            }
            other => panic!("unexpected record: {:?}", other),
        }
    }

    #[test]
    fn test_classification_truncates_to_capacity() {
        let entries: Vec<ClassEntry> = (0..MAX_CLASS_ENTRIES + 4)
            .map(|i| ClassEntry {
                label: format!("class-{}", i),
                confidence: i as f32,
                color: i as u32,
            })
            .collect();
        let set = PayloadSet {
            metas: vec![MetaRecord::Classification(entries)],
            ..Default::default()
        };

        let bytes = encode(&set).unwrap();
        match &decode(&bytes).unwrap().metas[0] {
            MetaRecord::Classification(decoded) => assert_eq!(decoded.len(), MAX_CLASS_ENTRIES),
            other => panic!("unexpected record: {:?}", other),
        }
    }

    #[test]
    fn test_unknown_identity_rejected() {
        let bytes = 999u32.to_le_bytes();
        assert!(matches!(decode(&bytes), Err(Error::MalformedMessage(_))));
    }

    #[test]
    fn test_truncated_record_rejected() {
        let set = PayloadSet {
            buffer_info: Some(BufferInfoPayload::default()),
            ..Default::default()
        };
        let bytes = encode(&set).unwrap();
        assert!(matches!(decode(&bytes[..bytes.len() - 1]), Err(Error::MalformedMessage(_))));
    }

    #[test]
    fn test_size_beyond_maxsize_rejected() {
        let set = PayloadSet {
            blocks: vec![BlockPayload::Text(b"ok".to_vec())],
            ..Default::default()
        };
        let mut bytes = encode(&set).unwrap();
        // Corrupt the text record's size field to exceed its capacity.
        let size_off = 4 + TEXT_CAPACITY;
        bytes[size_off..size_off + 8].copy_from_slice(&(TEXT_CAPACITY as u64 + 1).to_le_bytes());
        assert!(matches!(decode(&bytes), Err(Error::MalformedMessage(_))));
    }

    #[test]
    fn test_decode_never_reads_past_size() {
        // Bytes after `size` in the fixed region must not leak into the
        // decoded contents.
        let set = PayloadSet {
            blocks: vec![BlockPayload::Text(b"abc".to_vec())],
            ..Default::default()
        };
        let mut bytes = encode(&set).unwrap();
        bytes[4 + 3] = b'Z'; // garbage beyond the used length
        match decode(&bytes).unwrap().blocks.pop().unwrap() {
            BlockPayload::Text(contents) => assert_eq!(contents, b"abc"),
            other => panic!("unexpected block: {:?}", other),
        }
    }
}

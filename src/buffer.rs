//! Logical buffers and their memory blocks.
//!
//! A [`LogicalBuffer`] is one transportable unit: an ordered sequence of
//! [`MemoryBlock`]s plus zero or more [`MetaRecord`]s, carrying presentation
//! and decode timestamps, a duration, and a flag indicating the buffer was
//! allocated from a shared pool. For protocol purposes a buffer is
//! identified by the file descriptor of its first memory block.

use crate::meta::MetaRecord;
use crate::source::ReleaseGuard;
use smallvec::SmallVec;
use std::os::fd::{AsRawFd, OwnedFd};
use std::sync::Arc;
use std::time::Duration;

/// Maximum number of memory blocks per logical buffer, and thus ids per
/// buffer-info or return message and fds per wire message.
pub const MAX_MEM_BLOCKS: usize = 10;
/// Maximum number of planes a frame block describes.
pub const MAX_PLANES: usize = 4;
/// Maximum number of dimensions a tensor block describes.
pub const MAX_TENSOR_DIMS: usize = 8;

/// Stream content mode, fixed for the lifetime of a connection.
///
/// Derived from the negotiated content type by the hosting pipeline and
/// configured identically on both endpoints.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamMode {
    /// Raw inline text; blocks carry bytes, no descriptors.
    Text,
    /// Fd-backed tensors with element type and shape.
    Tensor,
    /// Fd-backed video frames with format and plane layout.
    Video,
}

/// Protocol identifier of a memory block: the descriptor (or
/// descriptor-equivalent id) backing it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BufferId(pub i32);

impl BufferId {
    /// Sentinel for blocks without a descriptor (text blocks, unused slots).
    pub const NONE: BufferId = BufferId(-1);

    /// Whether this id names a real descriptor.
    pub fn is_some(self) -> bool {
        self.0 >= 0
    }
}

impl std::fmt::Display for BufferId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Tensor element type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TensorType {
    /// Unsigned 8-bit integer.
    U8,
    /// Signed 8-bit integer.
    I8,
    /// Unsigned 16-bit integer.
    U16,
    /// Signed 16-bit integer.
    I16,
    /// Unsigned 32-bit integer.
    U32,
    /// Signed 32-bit integer.
    I32,
    /// 16-bit float.
    F16,
    /// 32-bit float.
    F32,
    /// 64-bit float.
    F64,
}

impl TensorType {
    /// Wire representation.
    pub fn to_u32(self) -> u32 {
        match self {
            TensorType::U8 => 0,
            TensorType::I8 => 1,
            TensorType::U16 => 2,
            TensorType::I16 => 3,
            TensorType::U32 => 4,
            TensorType::I32 => 5,
            TensorType::F16 => 6,
            TensorType::F32 => 7,
            TensorType::F64 => 8,
        }
    }

    /// Parse the wire representation.
    pub fn from_u32(v: u32) -> Option<Self> {
        Some(match v {
            0 => TensorType::U8,
            1 => TensorType::I8,
            2 => TensorType::U16,
            3 => TensorType::I16,
            4 => TensorType::U32,
            5 => TensorType::I32,
            6 => TensorType::F16,
            7 => TensorType::F32,
            8 => TensorType::F64,
            _ => return None,
        })
    }
}

/// A pixel format code as negotiated out of band.
///
/// The transport carries the code verbatim; it does not interpret pixel
/// data.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PixelFormat(pub u32);

impl PixelFormat {
    /// NV12 (two-plane YUV 4:2:0).
    pub const NV12: PixelFormat = PixelFormat(23);
    /// RGBA 8:8:8:8.
    pub const RGBA: PixelFormat = PixelFormat(11);
}

/// Offset and stride of one frame plane.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PlaneLayout {
    /// Byte offset of the plane from the start of the memory block.
    pub offset: u64,
    /// Bytes per row (may be negative for bottom-up layouts).
    pub stride: i32,
}

/// One contiguous payload segment of a logical buffer.
///
/// Fd-backed blocks hold `Arc<OwnedFd>`: the underlying memory stays
/// reachable for as long as any holder keeps a clone, and the descriptor is
/// closed exactly once when the last clone drops.
#[derive(Debug, Clone)]
pub enum MemoryBlock {
    /// Raw inline bytes; no descriptor.
    Text(Vec<u8>),
    /// Fd-backed N-dimensional tensor data.
    Tensor {
        /// Descriptor of the shared memory backing this tensor.
        fd: Arc<OwnedFd>,
        /// Element type.
        ty: TensorType,
        /// Shape, outermost dimension first.
        dims: SmallVec<[u32; MAX_TENSOR_DIMS]>,
        /// Bytes of the block filled with data.
        size: usize,
        /// Capacity of the block.
        maxsize: usize,
    },
    /// Fd-backed video frame data.
    Frame {
        /// Descriptor of the shared memory backing this frame.
        fd: Arc<OwnedFd>,
        /// Pixel format code.
        format: PixelFormat,
        /// Frame width in pixels.
        width: u32,
        /// Frame height in pixels.
        height: u32,
        /// Per-plane offsets and strides.
        planes: SmallVec<[PlaneLayout; MAX_PLANES]>,
        /// Frame flags, carried verbatim.
        flags: u32,
        /// Bytes of the block filled with data.
        size: usize,
        /// Capacity of the block.
        maxsize: usize,
    },
}

impl MemoryBlock {
    /// Protocol id of this block: the raw descriptor value, or
    /// [`BufferId::NONE`] for text blocks.
    pub fn buf_id(&self) -> BufferId {
        match self {
            MemoryBlock::Text(_) => BufferId::NONE,
            MemoryBlock::Tensor { fd, .. } | MemoryBlock::Frame { fd, .. } => {
                BufferId(fd.as_raw_fd())
            }
        }
    }

    /// Whether this block is backed by a file descriptor.
    pub fn is_fd_backed(&self) -> bool {
        !matches!(self, MemoryBlock::Text(_))
    }
}

/// One transportable unit of media/tensor data plus metadata.
#[derive(Debug, Default)]
pub struct LogicalBuffer {
    blocks: Vec<MemoryBlock>,
    metas: Vec<MetaRecord>,
    /// Presentation timestamp.
    pub pts: Option<Duration>,
    /// Decode timestamp.
    pub dts: Option<Duration>,
    /// Duration of the buffer's content.
    pub duration: Option<Duration>,
    from_pool: bool,
    release: Option<ReleaseGuard>,
}

impl LogicalBuffer {
    /// Create an empty buffer.
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a memory block (builder style).
    pub fn with_block(mut self, block: MemoryBlock) -> Self {
        self.blocks.push(block);
        self
    }

    /// Attach a metadata record (builder style).
    pub fn with_meta(mut self, meta: MetaRecord) -> Self {
        self.metas.push(meta);
        self
    }

    /// Set the presentation timestamp.
    pub fn with_pts(mut self, pts: Duration) -> Self {
        self.pts = Some(pts);
        self
    }

    /// Set the decode timestamp.
    pub fn with_dts(mut self, dts: Duration) -> Self {
        self.dts = Some(dts);
        self
    }

    /// Set the duration.
    pub fn with_duration(mut self, duration: Duration) -> Self {
        self.duration = Some(duration);
        self
    }

    /// Mark the buffer as allocated from a shared pool. Pooled buffers
    /// reuse descriptors across sends; the peer caches the fd on first
    /// arrival.
    pub fn with_pool_flag(mut self, from_pool: bool) -> Self {
        self.from_pool = from_pool;
        self
    }

    /// Append a memory block.
    pub fn push_block(&mut self, block: MemoryBlock) {
        self.blocks.push(block);
    }

    /// Attach a metadata record.
    pub fn push_meta(&mut self, meta: MetaRecord) {
        self.metas.push(meta);
    }

    /// Memory blocks, in order.
    pub fn blocks(&self) -> &[MemoryBlock] {
        &self.blocks
    }

    /// Attached metadata records.
    pub fn metas(&self) -> &[MetaRecord] {
        &self.metas
    }

    /// Protocol id of the buffer: the id of its first block.
    pub fn id(&self) -> BufferId {
        self.blocks.first().map_or(BufferId::NONE, MemoryBlock::buf_id)
    }

    /// Ids of all fd-backed blocks, in block order.
    pub fn fd_backed_ids(&self) -> SmallVec<[BufferId; MAX_MEM_BLOCKS]> {
        self.blocks
            .iter()
            .filter(|b| b.is_fd_backed())
            .map(MemoryBlock::buf_id)
            .collect()
    }

    /// Whether the buffer was allocated from a shared pool.
    pub fn is_pooled(&self) -> bool {
        self.from_pool
    }

    pub(crate) fn set_release_guard(&mut self, guard: ReleaseGuard) {
        self.release = Some(guard);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rustix::fs::{memfd_create, MemfdFlags};

    fn memfd(name: &str) -> Arc<OwnedFd> {
        Arc::new(memfd_create(name, MemfdFlags::CLOEXEC).unwrap())
    }

    #[test]
    fn test_buffer_id_is_first_block_fd() {
        let fd = memfd("test-id");
        let raw = fd.as_raw_fd();

        let buffer = LogicalBuffer::new().with_block(MemoryBlock::Frame {
            fd,
            format: PixelFormat::NV12,
            width: 64,
            height: 64,
            planes: SmallVec::new(),
            flags: 0,
            size: 4096,
            maxsize: 8192,
        });

        assert_eq!(buffer.id(), BufferId(raw));
    }

    #[test]
    fn test_text_buffer_has_no_id() {
        let buffer = LogicalBuffer::new().with_block(MemoryBlock::Text(b"hello".to_vec()));
        assert_eq!(buffer.id(), BufferId::NONE);
        assert!(buffer.fd_backed_ids().is_empty());
    }

    #[test]
    fn test_fd_backed_ids_preserve_block_order() {
        let a = memfd("test-a");
        let b = memfd("test-b");
        let (raw_a, raw_b) = (a.as_raw_fd(), b.as_raw_fd());

        let tensor = |fd| MemoryBlock::Tensor {
            fd,
            ty: TensorType::F32,
            dims: smallvec::smallvec![1, 224, 224, 3],
            size: 128,
            maxsize: 128,
        };

        let buffer = LogicalBuffer::new()
            .with_block(tensor(a))
            .with_block(tensor(b));

        let ids: Vec<i32> = buffer.fd_backed_ids().iter().map(|id| id.0).collect();
        assert_eq!(ids, vec![raw_a, raw_b]);
    }

    #[test]
    fn test_tensor_type_round_trip() {
        for v in 0..=8 {
            let ty = TensorType::from_u32(v).unwrap();
            assert_eq!(ty.to_u32(), v);
        }
        assert!(TensorType::from_u32(9).is_none());
    }
}

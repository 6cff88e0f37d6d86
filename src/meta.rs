//! Structured metadata records attached to frame blocks.
//!
//! The record set is closed: every kind the protocol can carry is a variant
//! of [`MetaRecord`], with an explicit serialize/deserialize pair in
//! [`crate::wire::codec`]. Each kind has a fixed maximum encoded size;
//! oversized string fields are truncated with a warning (lossy, not fatal),
//! while opaque payloads that do not fit their capacity abort the send.

/// Maximum encoded byte length of a protection-metadata payload.
pub const META_CAPACITY: usize = 1024;
/// Maximum byte length of a label string (NUL-terminated within capacity).
pub const LABEL_CAPACITY: usize = 64;
/// Maximum byte length of the free-form detection fields of an ROI record.
pub const FIELDS_CAPACITY: usize = 256;
/// Maximum byte length of a landmark point name.
pub const NAME_CAPACITY: usize = 32;
/// Maximum number of entries in a classification record.
pub const MAX_CLASS_ENTRIES: usize = 16;
/// Maximum number of keypoints in a landmarks record.
pub const MAX_LANDMARK_POINTS: usize = 32;
/// Maximum number of skeleton link pairs in a landmarks record.
pub const MAX_SKELETON_LINKS: usize = 64;

/// An axis-aligned rectangle in pixel coordinates.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Rect {
    /// Left edge.
    pub x: i32,
    /// Top edge.
    pub y: i32,
    /// Width in pixels.
    pub width: u32,
    /// Height in pixels.
    pub height: u32,
}

/// One label/confidence/color tuple of a classification record.
#[derive(Debug, Clone, PartialEq)]
pub struct ClassEntry {
    /// Class label.
    pub label: String,
    /// Confidence in the range the producer uses (typically 0.0..=1.0).
    pub confidence: f32,
    /// Display color as packed RGBA.
    pub color: u32,
}

/// One keypoint of a landmarks record.
#[derive(Debug, Clone, PartialEq)]
pub struct LandmarkPoint {
    /// Keypoint name.
    pub name: String,
    /// Horizontal position.
    pub x: f32,
    /// Vertical position.
    pub y: f32,
    /// Detection confidence.
    pub confidence: f32,
    /// Display color as packed RGBA.
    pub color: u32,
}

/// A pair of keypoint indices forming one skeleton edge.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SkeletonLink {
    /// Index of the first keypoint.
    pub a: u32,
    /// Index of the second keypoint.
    pub b: u32,
}

/// A metadata record attached to a frame block.
///
/// Records are serialized verbatim and reconstructed byte-for-byte on the
/// receiving side, except where truncation due to capacity is the defined
/// behavior.
#[derive(Debug, Clone, PartialEq)]
pub enum MetaRecord {
    /// Encryption parameters as an opaque pre-serialized structure string.
    /// The codec carries it without reinterpretation.
    Protection(String),
    /// A detected region of interest.
    Roi {
        /// Bounding rectangle.
        rect: Rect,
        /// Detection label.
        label: String,
        /// Free-form serialized detection fields.
        fields: String,
    },
    /// Ordered classification results.
    Classification(Vec<ClassEntry>),
    /// Keypoints plus the skeleton links connecting them.
    Landmarks {
        /// Detected keypoints.
        points: Vec<LandmarkPoint>,
        /// Index pairs into `points`.
        links: Vec<SkeletonLink>,
    },
}

impl MetaRecord {
    /// Short human-readable kind name, used in log messages.
    pub fn kind(&self) -> &'static str {
        match self {
            MetaRecord::Protection(_) => "protection",
            MetaRecord::Roi { .. } => "roi",
            MetaRecord::Classification(_) => "classification",
            MetaRecord::Landmarks { .. } => "landmarks",
        }
    }
}

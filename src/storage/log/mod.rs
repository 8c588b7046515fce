//! Segmented, position-indexed log storage for one partition.
//!
//! # Module Structure
//!
//! - `entry`: batch records and their in-segment metadata
//! - `segment`: log segment file operations
//! - `manager`: multi-segment management with rotation and deletion
//! - `store`: the replication contract implemented over local segments

mod entry;
mod manager;
mod segment;
mod store;


pub use entry::{BatchMeta, BatchRecord};
pub use manager::{
    DEFAULT_MAX_SEGMENT_SIZE, DiskStats, SegmentManager, SegmentManagerOptions, SegmentMeta,
};
pub use segment::LogSegment;
pub use store::SegmentedLogStorage;

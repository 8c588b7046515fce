//! Snapshot storage for partition state.
//!
//! # Directory Structure
//!
//! ```text
//! {base_dir}/
//! └── partition-{id}/
//!     └── snapshot-{processed_position}/
//!         ├── meta.json       # position, compaction bound, checksum
//!         ├── data.bin        # exported state
//!         └── checksum.sha256 # data checksum for integrity verification
//! ```

mod store;


pub use store::{FileSnapshotStore, PersistedSnapshot, SnapshotStoreOptions};

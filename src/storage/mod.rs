pub mod frame;
pub mod log;
pub mod snapshot;
pub mod state;

pub use log::{SegmentManagerOptions, SegmentedLogStorage};
pub use snapshot::{FileSnapshotStore, PersistedSnapshot, SnapshotStoreOptions};
pub use state::{StateDb, StateDbOptions, Transaction};

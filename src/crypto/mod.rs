pub mod keypool;
pub mod rotation;
pub mod signatures;
pub mod snapshot;
pub mod storage;

pub use keypool::{KeyEntry, KeyPoolManager, PoolFile};
pub use rotation::{RotationConfig, RotationScheduler};
pub use signatures::{SignatureEngine, SignedData};
pub use snapshot::{KeyPoolSnapshot, SnapshotCache};
pub use storage::{KeyStorage, SeedEntry};

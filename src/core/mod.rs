pub mod analyzer;
pub mod cache;
pub mod comparator;
pub mod engine;
pub mod restore;
pub mod snapshot;

pub use analyzer::{Analysis, Analyzer, Spaces};
pub use cache::{CacheSlot, SnapshotCache};
pub use comparator::{diff, Diff, DiffType, Stat};
pub use engine::{
    analyze_profile, analyze_source, sync_profile, sync_source, sync_spaces, SyncReport, Syncer,
};
pub use restore::{restore_configs, restore_profile, restore_source};
pub use snapshot::{ContentSignature, FileEntry, Snapshot};

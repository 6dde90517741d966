pub mod config;
pub mod core;
pub mod logging;
pub mod storage;
pub mod utils;

pub use config::{ProfileConfig, SourceConfig, TargetConfig};
pub use self::core::{Analyzer, Diff, FileEntry, Snapshot, Stat, SyncReport, Syncer};
pub use storage::{FileSpaceError, SourceSpace, TargetSpace};

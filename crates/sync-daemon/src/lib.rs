//! sync-daemon library: Exposes internal modules for testing.
//!
//! This is a thin library layer over the daemon components,
//! allowing integration tests to access internal types.

pub mod http_remote;
pub mod native_fs;
pub mod session;
pub mod watcher;

// Re-export key types for convenience
pub use http_remote::HttpRemote;
pub use native_fs::NativeFs;
pub use session::{LogReindexSink, VaultSession};
pub use watcher::{FileEvent, FileEventKind, FileWatcher};

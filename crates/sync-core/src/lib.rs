//! sync-core: client-side engine for syncing a local vault with a remote service.
//!
//! This crate provides the core functionality for:
//! - Tracking files by stable id with per-device vector clocks
//! - The two-phase diff/commit protocol with optimistic concurrency
//! - Executing upload/download/delete/conflict actions over presigned URLs
//! - Debounced scheduling of sync cycles and reindex requests
//! - Binding a local folder to a remote vault
//! - FileSystem, RemoteApi and BlobTransport trait abstractions

pub mod binding;
pub mod config;
pub mod content_hash;
pub mod device_id;
pub mod events;
pub mod executor;
pub mod fs;
pub mod index;
pub mod memory_remote;
pub mod protocol;
pub mod remote;
pub mod scheduler;
pub mod sync_engine;
pub mod vector_clock;

pub use binding::{AutoBinder, BindingError, BindingRecord, BindingState};
pub use config::SyncConfig;
pub use content_hash::ContentHash;
pub use device_id::{DeviceId, DeviceIdError};
pub use events::{EventBus, Subscription, SyncEvent};
pub use executor::{ExecutionReport, Executor};
pub use fs::{FileStat, FileSystem, FsError, InMemoryFs};
pub use index::{FileEntry, FileId, FileIndex, SyncBase};
pub use memory_remote::InMemoryRemote;
pub use remote::{BlobTransport, RemoteApi, RemoteError, RetryClass};
pub use scheduler::{CycleRunner, ReindexScheduler, ReindexSink, Scheduler, SyncScheduler};
pub use sync_engine::{CycleReport, SyncEngine, SyncError};
pub use vector_clock::{ClockOrdering, VectorClock};

//! # chatsync: per-entity update synchronization for chat clients
//!
//! Every mutation that matters to a user, a chat or a space is appended to a durable, strictly
//! ordered log scoped to that entity. Clients catch up by asking for everything after the last
//! sequence number they have seen. It provides:
//!
//! - **Gap-free sequencing**: exactly-once, monotonically increasing numbers per entity under
//!   concurrent writers, with recovery from missing or stale counters
//! - **Transactional enqueue**: updates commit or roll back with the business operation that
//!   produced them
//! - **Bounded catch-up**: paged reads that signal `TOO_LONG` when a client's gap is too large
//! - **Realtime delivery**: connected clients receive rows as soon as they commit
//! - **Retention**: optional pruning of old rows
//!
//! # Usage
//!
//! ```bash
//! chatsync --name sync1 \
//!          --data-dir /var/lib/chatsync \
//!          --listen-client-urls http://0.0.0.0:7400
//! ```

// Re-export generated protobuf types
pub mod syncpb {
    tonic::include_proto!("syncpb");
}

// Core modules
pub mod api;
pub mod realtime;
pub mod server;
pub mod storage;
pub mod updates;

// Re-export main types at crate root for convenience
pub use realtime::RealtimeHub;
pub use server::{ServerConfig, SyncServer};
pub use storage::{Backend, Bucket, BucketKind, UpdateRow};
pub use updates::{
    EngineConfig, GetUpdates, ResultType, UnitOfWork, UpdateEngine, UpdateWrite, UpdatesError,
    UpdatesSlice,
};

//! File-resident coordination stores for the worker bridge.
//!
//! The filesystem is the only coordination medium between the team lead
//! and worker daemons: task files, JSONL message channels, heartbeat
//! snapshots and the team roster all live under deterministic, sanitized
//! paths. Every mutation is either an append or a temp+rename overwrite,
//! so readers never observe a partially written file.

pub mod channel;
pub mod heartbeat;
pub mod paths;
pub mod roster;
pub mod task;

pub use channel::{ChannelStore, InboxMessage, OutboxMessage, ShutdownSignal};
pub use heartbeat::{Heartbeat, HeartbeatStatus, HeartbeatStore};
pub use paths::StorePaths;
pub use task::{FailureSidecar, TaskPatch, TaskRecord, TaskStatus, TaskStore};

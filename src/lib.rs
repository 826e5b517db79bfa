//! Raft consensus replica core.
//!
//! A single participant in a fixed-membership cluster: leader election,
//! log replication, majority commit, and durable recovery across
//! restarts. The RPC fabric and the durable byte store are supplied by
//! the embedder through the [`Transport`] and [`Storage`] traits;
//! committed commands are delivered in index order on an
//! application-owned channel.

pub mod raft;

pub use raft::core::{ApplyMsg, Replica, ReplicaConfig, ReplicaError, ReplicaState, Role};
pub use raft::log::LogEntry;
pub use raft::persist::{MemStorage, PersistentRecord, Storage, StorageError};
pub use raft::rpc::{
    AppendEntriesArgs, AppendEntriesReply, RequestVoteArgs, RequestVoteReply, Transport,
};

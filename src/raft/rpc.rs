use crate::raft::log::LogEntry;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RequestVoteArgs {
    pub term: u64,
    pub candidate_id: u64,
    pub last_log_index: u64,
    pub last_log_term: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RequestVoteReply {
    pub term: u64,
    pub vote_granted: bool,
    pub voter_id: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AppendEntriesArgs {
    pub term: u64,
    pub leader_id: u64,
    pub prev_log_index: u64,
    pub prev_log_term: u64,
    pub entries: Vec<LogEntry>,
    pub leader_commit: u64,
}

/// On rejection, `conflict_term`/`conflict_index` hint where the
/// leader should back off to instead of probing one index at a time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AppendEntriesReply {
    pub term: u64,
    pub success: bool,
    pub conflict_term: u64,
    pub conflict_index: u64,
}

/// Outbound half of the RPC fabric, supplied by the embedder.
///
/// Peers are addressed by their position in the configured peer list.
/// `None` means the call was not delivered; the fabric may also reorder
/// or duplicate messages, but never corrupt them. The replica does not
/// retry individual calls — the next heartbeat tick or wake re-sends.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn request_vote(&self, peer: usize, args: RequestVoteArgs) -> Option<RequestVoteReply>;

    async fn append_entries(
        &self,
        peer: usize,
        args: AppendEntriesArgs,
    ) -> Option<AppendEntriesReply>;
}

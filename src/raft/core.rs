use crate::raft::log::{self, LogEntry};
use crate::raft::persist::{self, PersistentRecord, Storage, StorageError};
use crate::raft::rpc::{
    AppendEntriesArgs, AppendEntriesReply, RequestVoteArgs, RequestVoteReply, Transport,
};
use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};
use std::cmp;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::time::{self, Instant};

#[derive(Debug, Error)]
pub enum ReplicaError {
    #[error("storage: {0}")]
    Storage(#[from] StorageError),
    #[error("persistent record: {0}")]
    Codec(#[from] bincode::Error),
    #[error("config: {0}")]
    Config(String),
}

/// A committed entry handed to the application, in index order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApplyMsg {
    pub index: u64,
    pub command: Vec<u8>,
}

#[derive(Debug)]
pub enum Role {
    Follower,
    Candidate,
    Leader(LeaderState),
}

impl Role {
    pub fn is_leader(&self) -> bool {
        matches!(self, Role::Leader(_))
    }
}

/// Per-peer replication bookkeeping; exists only while this replica
/// leads. Dropping it (on step-down) closes the wake channels, which
/// ends the per-peer loops.
#[derive(Debug)]
pub struct LeaderState {
    /// Index of the next entry to send to each peer.
    pub next_index: Vec<u64>,
    /// Highest index known replicated on each peer.
    pub match_index: Vec<u64>,
    // Capacity-1 senders; duplicate posts coalesce. None at our own slot.
    wake: Vec<Option<mpsc::Sender<()>>>,
}

#[derive(Debug)]
pub struct ReplicaState {
    pub role: Role,
    pub current_term: u64,
    pub voted_for: Option<u64>,
    /// Last known leader for the current term. Advisory only.
    pub leader_hint: Option<u64>,
    pub log: Vec<LogEntry>,
    pub commit_index: u64,
    pub last_applied: u64,
    pub last_heartbeat: Instant,
    pub stopped: bool,
}

impl ReplicaState {
    fn new() -> Self {
        Self {
            role: Role::Follower,
            current_term: 0,
            voted_for: None,
            leader_hint: None,
            log: Vec::new(),
            commit_index: 0,
            last_applied: 0,
            last_heartbeat: Instant::now(),
            stopped: false,
        }
    }
}

/// Timing parameters. The election timeout is re-drawn from
/// `[election_timeout_min, election_timeout_max)` on every timer tick;
/// the heartbeat interval must stay strictly below the minimum.
#[derive(Debug, Clone)]
pub struct ReplicaConfig {
    pub election_timeout_min: Duration,
    pub election_timeout_max: Duration,
    pub heartbeat_interval: Duration,
    /// Granularity of the per-peer send loop.
    pub replication_tick: Duration,
    /// How long the apply pump sleeps when nothing is committed.
    pub apply_idle: Duration,
    /// Fixed RNG seed for deterministic timeouts; entropy-seeded if unset.
    pub seed: Option<u64>,
}

impl Default for ReplicaConfig {
    fn default() -> Self {
        Self {
            election_timeout_min: Duration::from_millis(500),
            election_timeout_max: Duration::from_millis(600),
            heartbeat_interval: Duration::from_millis(100),
            replication_tick: Duration::from_millis(10),
            apply_idle: Duration::from_millis(100),
            seed: None,
        }
    }
}

/// A single Raft replica.
///
/// All state lives behind one mutex, taken by the inbound RPC handlers,
/// the election driver, the per-peer replication loops, and the apply
/// pump. The lock is never held across an RPC send, an apply-channel
/// send, or a timer wait.
pub struct Replica {
    id: u64,
    me: usize,
    peers: Vec<u64>,
    transport: Arc<dyn Transport>,
    storage: Arc<dyn Storage>,
    config: ReplicaConfig,
    state: Mutex<ReplicaState>,
    apply_tx: mpsc::Sender<ApplyMsg>,
    rng: Mutex<SmallRng>,
}

impl Replica {
    /// Create a replica and start its election driver and apply pump.
    ///
    /// `peers` lists the ids of every cluster member in a shared order;
    /// `peers[me]` is this replica's own id. Previously persisted state
    /// is restored from `storage` if present. Must be called from within
    /// a tokio runtime.
    pub fn build(
        peers: Vec<u64>,
        me: usize,
        transport: Arc<dyn Transport>,
        storage: Arc<dyn Storage>,
        apply_tx: mpsc::Sender<ApplyMsg>,
        config: ReplicaConfig,
    ) -> Result<Arc<Self>, ReplicaError> {
        if me >= peers.len() {
            return Err(ReplicaError::Config(format!(
                "self index {me} out of range for {} peers",
                peers.len()
            )));
        }
        if config.election_timeout_max <= config.election_timeout_min {
            return Err(ReplicaError::Config(
                "election timeout range must be non-empty".into(),
            ));
        }
        if config.heartbeat_interval >= config.election_timeout_min {
            return Err(ReplicaError::Config(
                "heartbeat interval must be strictly below the election timeout minimum".into(),
            ));
        }

        let mut state = ReplicaState::new();
        let bytes = storage.read()?;
        if !bytes.is_empty() {
            let record = persist::decode(&bytes)?;
            state.current_term = record.current_term;
            state.voted_for = record.voted_for;
            state.log = record.log;
            tracing::info!(
                node = peers[me],
                term = state.current_term,
                log_len = state.log.len(),
                "restored from persistence"
            );
        }

        let rng = match config.seed {
            Some(seed) => SmallRng::seed_from_u64(seed),
            None => SmallRng::from_entropy(),
        };

        let replica = Arc::new(Self {
            id: peers[me],
            me,
            peers,
            transport,
            storage,
            config,
            state: Mutex::new(state),
            apply_tx,
            rng: Mutex::new(rng),
        });
        tokio::spawn(Self::election_loop(replica.clone()));
        tokio::spawn(Self::apply_loop(replica.clone()));
        Ok(replica)
    }

    /// Current term and whether this replica believes it is the leader.
    pub fn state(&self) -> (u64, bool) {
        let s = self.state.lock().unwrap();
        (s.current_term, s.role.is_leader() && !s.stopped)
    }

    /// Propose a command. Returns `(index, term, is_leader)`; the index
    /// is -1 when this replica is not the leader. Acceptance is not a
    /// durability guarantee — the entry may still be superseded until it
    /// commits and is applied.
    pub fn submit(&self, command: Vec<u8>) -> Result<(i64, u64, bool), ReplicaError> {
        let mut s = self.state.lock().unwrap();
        if s.stopped || !s.role.is_leader() {
            return Ok((-1, s.current_term, false));
        }

        let (last_index, _) = log::last_info(&s.log);
        let index = last_index + 1;
        let term = s.current_term;
        s.log.push(LogEntry {
            index,
            term,
            command,
        });
        self.persist(&mut s)?;
        tracing::info!(node = self.id, index, term, "appended new entry");

        // A cluster of one has no replication replies to trigger the scan.
        self.advance_commit(&mut s);
        if let Role::Leader(ls) = &s.role {
            for wake in ls.wake.iter().flatten() {
                let _ = wake.try_send(());
            }
        }
        Ok((index as i64, term, true))
    }

    /// Make the replica inert. Every long-lived loop observes the flag
    /// at the top of its next iteration and exits; in-flight RPC replies
    /// are discarded.
    pub fn stop(&self) {
        let mut s = self.state.lock().unwrap();
        s.stopped = true;
        tracing::info!(node = self.id, term = s.current_term, "stopped");
    }

    /// Run a closure against the locked state. Intended for
    /// introspection (metrics, invariant checks in tests); do not block.
    pub fn read_state<R>(&self, f: impl FnOnce(&ReplicaState) -> R) -> R {
        f(&self.state.lock().unwrap())
    }

    // -- inbound RPC handlers --

    /// RequestVote. State is persisted before the reply is produced; an
    /// `Err` means persistence failed and no reply may be sent.
    pub fn handle_request_vote(
        &self,
        args: &RequestVoteArgs,
    ) -> Result<RequestVoteReply, ReplicaError> {
        let mut s = self.state.lock().unwrap();
        if s.stopped {
            return Ok(RequestVoteReply {
                term: s.current_term,
                vote_granted: false,
                voter_id: self.id,
            });
        }

        let (last_index, last_term) = log::last_info(&s.log);
        let log_up_to_date = args.last_log_term > last_term
            || (args.last_log_term == last_term && args.last_log_index >= last_index);

        let mut dirty = false;
        let mut granted = false;
        if args.term >= s.current_term {
            if args.term > s.current_term {
                dirty |= Self::enter_follower(&mut s, args.term);
            }
            if log_up_to_date
                && (s.voted_for.is_none() || s.voted_for == Some(args.candidate_id))
            {
                dirty |= s.voted_for != Some(args.candidate_id);
                s.voted_for = Some(args.candidate_id);
                granted = true;
            }
        }
        // Granting deliberately leaves the election timer alone: a
        // granted-but-losing candidate must not suppress us forever.
        if dirty {
            self.persist(&mut s)?;
        }
        tracing::info!(
            node = self.id,
            candidate = args.candidate_id,
            term = args.term,
            log_up_to_date,
            granted,
            "vote requested"
        );
        Ok(RequestVoteReply {
            term: s.current_term,
            vote_granted: granted,
            voter_id: self.id,
        })
    }

    /// AppendEntries. State is persisted before the reply is produced;
    /// an `Err` means persistence failed and no reply may be sent.
    pub fn handle_append_entries(
        &self,
        args: &AppendEntriesArgs,
    ) -> Result<AppendEntriesReply, ReplicaError> {
        let mut s = self.state.lock().unwrap();
        if s.stopped || args.term < s.current_term {
            return Ok(AppendEntriesReply {
                term: s.current_term,
                success: false,
                conflict_term: 0,
                conflict_index: 0,
            });
        }

        let mut dirty = Self::enter_follower(&mut s, args.term);
        s.leader_hint = Some(args.leader_id);
        s.last_heartbeat = Instant::now();

        // `prev == (0, 0)` matches trivially at the position before index 1.
        let matched = if args.prev_log_index == 0 && args.prev_log_term == 0 {
            Some(0)
        } else {
            log::position_of(&s.log, args.prev_log_index)
                .filter(|&p| s.log[p].term == args.prev_log_term)
                .map(|p| p + 1)
        };

        let Some(next_pos) = matched else {
            let conflict_term = log::term_at(&s.log, args.prev_log_index)
                .unwrap_or_else(|| log::last_info(&s.log).1);
            let conflict_index = log::first_index_for_term(&s.log, conflict_term);
            if dirty {
                self.persist(&mut s)?;
            }
            tracing::info!(
                node = self.id,
                leader = args.leader_id,
                prev_log_index = args.prev_log_index,
                prev_log_term = args.prev_log_term,
                conflict_term,
                conflict_index,
                "append rejected: no match at prev"
            );
            return Ok(AppendEntriesReply {
                term: s.current_term,
                success: false,
                conflict_term,
                conflict_index,
            });
        };

        // Walk the incoming entries aligned against the local log. Truncate
        // at the first divergence and append the rest; when the incoming run
        // is a prefix of what we already hold, leave the log alone.
        let mut incoming = 0;
        while incoming < args.entries.len() {
            let pos = next_pos + incoming;
            let local = s.log.get(pos).map(|e| (e.index, e.term));
            match local {
                Some((index, term))
                    if index == args.entries[incoming].index
                        && term == args.entries[incoming].term =>
                {
                    incoming += 1;
                }
                Some(_) => {
                    assert!(
                        pos as u64 >= s.commit_index,
                        "truncation would remove committed entry (commit_index {}, position {})",
                        s.commit_index,
                        pos
                    );
                    s.log.truncate(pos);
                    dirty = true;
                    break;
                }
                None => break,
            }
        }
        if incoming < args.entries.len() {
            s.log.extend_from_slice(&args.entries[incoming..]);
            dirty = true;
            tracing::info!(
                node = self.id,
                leader = args.leader_id,
                appended = args.entries.len() - incoming,
                log_len = s.log.len(),
                "appended entries"
            );
        }

        if args.leader_commit > s.commit_index {
            let (last_index, _) = log::last_info(&s.log);
            s.commit_index = cmp::min(args.leader_commit, last_index);
        }

        if dirty {
            self.persist(&mut s)?;
        }
        Ok(AppendEntriesReply {
            term: s.current_term,
            success: true,
            conflict_term: 0,
            conflict_index: 0,
        })
    }

    // -- election driver --

    async fn election_loop(replica: Arc<Replica>) {
        loop {
            let timeout = replica.random_election_timeout();
            time::sleep(timeout).await;
            {
                let s = replica.state.lock().unwrap();
                if s.stopped {
                    return;
                }
                if !s.role.is_leader() && s.last_heartbeat.elapsed() >= timeout {
                    tokio::spawn(Self::run_election(replica.clone()));
                }
            }
        }
    }

    async fn run_election(replica: Arc<Replica>) {
        let args = {
            let mut s = replica.state.lock().unwrap();
            if s.stopped || s.role.is_leader() {
                return;
            }
            s.role = Role::Candidate;
            s.current_term += 1;
            s.voted_for = Some(replica.id);
            if replica.persist(&mut s).is_err() {
                return;
            }
            let (last_log_index, last_log_term) = log::last_info(&s.log);
            tracing::info!(node = replica.id, term = s.current_term, "starting election");
            RequestVoteArgs {
                term: s.current_term,
                candidate_id: replica.id,
                last_log_index,
                last_log_term,
            }
        };

        let cluster = replica.peers.len();
        let (reply_tx, mut replies) = mpsc::channel(cluster.max(1));
        for peer in 0..cluster {
            if peer == replica.me {
                continue;
            }
            let transport = replica.transport.clone();
            let args = args.clone();
            let reply_tx = reply_tx.clone();
            tokio::spawn(async move {
                let reply = transport.request_vote(peer, args).await;
                let _ = reply_tx.send(reply).await;
            });
        }
        drop(reply_tx);

        let mut votes = 1usize; // self
        if Self::tally(&replica, &args, votes) {
            return;
        }
        while let Some(reply) = replies.recv().await {
            let Some(reply) = reply else {
                continue; // undelivered; a later timeout retries
            };
            {
                let mut s = replica.state.lock().unwrap();
                if s.stopped {
                    return;
                }
                if reply.term > s.current_term {
                    tracing::info!(
                        node = replica.id,
                        voter = reply.voter_id,
                        term = reply.term,
                        "stepping down: higher term in vote reply"
                    );
                    Self::enter_follower(&mut s, reply.term);
                    let _ = replica.persist(&mut s);
                    return;
                }
                if reply.term < s.current_term || !reply.vote_granted {
                    continue;
                }
            }
            votes += 1;
            if Self::tally(&replica, &args, votes) {
                return;
            }
        }
    }

    /// Promote on a strict majority, provided this election round was
    /// not interrupted by a step-down or a newer term. Returns true once
    /// counting should stop.
    fn tally(replica: &Arc<Replica>, args: &RequestVoteArgs, votes: usize) -> bool {
        if 2 * votes <= replica.peers.len() {
            return false;
        }
        let mut s = replica.state.lock().unwrap();
        if !s.stopped && matches!(s.role, Role::Candidate) && s.current_term == args.term {
            tracing::info!(node = replica.id, term = s.current_term, votes, "won election");
            Self::promote_to_leader(replica, &mut s);
        } else {
            tracing::info!(node = replica.id, term = args.term, "election interrupted");
        }
        true
    }

    fn promote_to_leader(replica: &Arc<Replica>, s: &mut ReplicaState) {
        let (last_index, _) = log::last_info(&s.log);
        let cluster = replica.peers.len();
        let mut wake = Vec::with_capacity(cluster);
        for peer in 0..cluster {
            if peer == replica.me {
                wake.push(None);
                continue;
            }
            let (tx, rx) = mpsc::channel(1);
            wake.push(Some(tx));
            tokio::spawn(Self::replicate_loop(replica.clone(), peer, rx));
        }
        s.role = Role::Leader(LeaderState {
            next_index: vec![last_index + 1; cluster],
            match_index: vec![0; cluster],
            wake,
        });
        s.leader_hint = Some(replica.id);
    }

    // -- replication driver (leader) --

    async fn replicate_loop(replica: Arc<Replica>, peer: usize, mut wake: mpsc::Receiver<()>) {
        // Immediate heartbeat: establish authority before follower timers fire.
        replica.replicate_once(peer).await;
        let mut last_sent = Instant::now();
        let mut tick = time::interval(replica.config.replication_tick);
        loop {
            {
                let s = replica.state.lock().unwrap();
                if s.stopped || !s.role.is_leader() {
                    return;
                }
            }
            tokio::select! {
                signal = wake.recv() => {
                    if signal.is_none() {
                        return; // leadership dropped, wake side closed
                    }
                    last_sent = Instant::now();
                    replica.replicate_once(peer).await;
                }
                now = tick.tick() => {
                    if now.duration_since(last_sent) >= replica.config.heartbeat_interval {
                        last_sent = now;
                        replica.replicate_once(peer).await;
                    }
                }
            }
        }
    }

    async fn replicate_once(&self, peer: usize) {
        let (args, sent_up_to) = {
            let s = self.state.lock().unwrap();
            if s.stopped {
                return;
            }
            let Role::Leader(ls) = &s.role else {
                return;
            };
            let next = ls.next_index[peer];
            let (last_index, last_term) = log::last_info(&s.log);
            let (prev_log_index, prev_log_term, entries, sent_up_to) = if last_index >= next {
                let (prev_index, prev_term) = if next > 1 {
                    (next - 1, log::term_at(&s.log, next - 1).unwrap_or(0))
                } else {
                    (0, 0)
                };
                let pos = log::position_of(&s.log, next).unwrap_or(s.log.len());
                (prev_index, prev_term, s.log[pos..].to_vec(), Some(last_index))
            } else {
                // Nothing new; bare heartbeat carrying last-entry info.
                (last_index, last_term, Vec::new(), None)
            };
            (
                AppendEntriesArgs {
                    term: s.current_term,
                    leader_id: self.id,
                    prev_log_index,
                    prev_log_term,
                    entries,
                    leader_commit: s.commit_index,
                },
                sent_up_to,
            )
        };

        let sent_term = args.term;
        let Some(reply) = self.transport.append_entries(peer, args).await else {
            return; // dropped on the wire; the next tick retries
        };

        let mut s = self.state.lock().unwrap();
        if s.stopped {
            return;
        }
        if reply.term > s.current_term {
            tracing::info!(
                node = self.id,
                peer = self.peers[peer],
                term = reply.term,
                "stepping down: higher term in append reply"
            );
            Self::enter_follower(&mut s, reply.term);
            let _ = self.persist(&mut s);
            return;
        }
        if s.current_term != sent_term || !s.role.is_leader() {
            return; // stale reply from an earlier leadership
        }

        if reply.success {
            if let Some(up_to) = sent_up_to {
                if let Role::Leader(ls) = &mut s.role {
                    // Only ever advance; duplicated stale replies must not
                    // move the indices backwards.
                    if up_to > ls.match_index[peer] {
                        ls.match_index[peer] = up_to;
                        ls.next_index[peer] = up_to + 1;
                        tracing::info!(
                            node = self.id,
                            peer = self.peers[peer],
                            match_index = up_to,
                            "advanced peer indices"
                        );
                    }
                }
                self.advance_commit(&mut s);
            }
        } else if let Role::Leader(ls) = &mut s.role {
            let backed_off = cmp::max(1, reply.conflict_index.saturating_sub(1));
            let progressed = ls.next_index[peer] != backed_off;
            ls.next_index[peer] = backed_off;
            tracing::info!(
                node = self.id,
                peer = self.peers[peer],
                conflict_term = reply.conflict_term,
                conflict_index = reply.conflict_index,
                next_index = backed_off,
                "append rejected, backing off"
            );
            // Retry immediately while the probe is converging; a rejection
            // that moves nothing waits for the heartbeat instead.
            if progressed {
                if let Some(wake) = &ls.wake[peer] {
                    let _ = wake.try_send(());
                }
            }
        }
    }

    /// Scan backward for the highest index replicated on a strict
    /// majority. Only current-term entries count directly; once the scan
    /// reaches a prior-term entry nothing below can qualify either.
    fn advance_commit(&self, s: &mut ReplicaState) {
        let Role::Leader(ls) = &s.role else {
            return;
        };
        let mut new_commit = None;
        for entry in s.log.iter().rev() {
            if entry.index <= s.commit_index || entry.term != s.current_term {
                break;
            }
            let replicas = 1
                + (0..self.peers.len())
                    .filter(|&p| p != self.me && ls.match_index[p] >= entry.index)
                    .count();
            if 2 * replicas > self.peers.len() {
                new_commit = Some(entry.index);
                break;
            }
        }
        if let Some(index) = new_commit {
            tracing::info!(
                node = self.id,
                old_commit = s.commit_index,
                new_commit = index,
                "commit index advanced"
            );
            s.commit_index = index;
        }
    }

    // -- apply pump --

    /// Copies the committed-but-unapplied batch under the lock, delivers
    /// it with the lock released so a slow consumer cannot stall the
    /// protocol, then advances `last_applied` by the batch size.
    async fn apply_loop(replica: Arc<Replica>) {
        loop {
            let batch: Vec<LogEntry> = {
                let s = replica.state.lock().unwrap();
                if s.stopped {
                    return;
                }
                log::span(&s.log, s.last_applied, s.commit_index).to_vec()
            };
            if batch.is_empty() {
                time::sleep(replica.config.apply_idle).await;
                continue;
            }

            let delivered = batch.len() as u64;
            tracing::debug!(node = replica.id, count = delivered, "applying committed entries");
            for entry in batch {
                let msg = ApplyMsg {
                    index: entry.index,
                    command: entry.command,
                };
                if replica.apply_tx.send(msg).await.is_err() {
                    return; // application went away
                }
            }

            let mut s = replica.state.lock().unwrap();
            s.last_applied += delivered;
        }
    }

    // -- helpers --

    fn random_election_timeout(&self) -> Duration {
        let jitter = self.config.election_timeout_max - self.config.election_timeout_min;
        let extra = self.rng.lock().unwrap().gen_range(0..jitter.as_millis() as u64);
        self.config.election_timeout_min + Duration::from_millis(extra)
    }

    /// Collapse to Follower. The vote is cleared only when the term
    /// actually advances; clearing it on an equal-term step-down would
    /// allow a second grant in the same term.
    fn enter_follower(s: &mut ReplicaState, term: u64) -> bool {
        s.role = Role::Follower;
        if term > s.current_term {
            s.current_term = term;
            s.voted_for = None;
            true
        } else {
            false
        }
    }

    /// Flush `{current_term, voted_for, log}` to the durable store. A
    /// failed write halts the replica: nothing that depends on the
    /// unpersisted state may be emitted afterwards.
    fn persist(&self, s: &mut ReplicaState) -> Result<(), ReplicaError> {
        let record = PersistentRecord {
            current_term: s.current_term,
            voted_for: s.voted_for,
            log: s.log.clone(),
        };
        let outcome = persist::encode(&record)
            .map_err(ReplicaError::from)
            .and_then(|bytes| self.storage.write(&bytes).map_err(ReplicaError::from));
        if let Err(e) = &outcome {
            tracing::error!(node = self.id, error = %e, "persistence failed, halting");
            s.stopped = true;
        }
        outcome
    }
}

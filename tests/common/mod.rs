pub use oracle::Oracle;

use async_trait::async_trait;
use raft_replica::{
    AppendEntriesArgs, AppendEntriesReply, ApplyMsg, MemStorage, Replica, ReplicaConfig,
    RequestVoteArgs, RequestVoteReply, Transport,
};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time;

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt().without_time().try_init();
}

/// In-process wire between replicas. Reachability is a full matrix so
/// tests can cut single nodes or split the cluster into camps; an
/// unreachable hop is an undelivered call, exactly what a lossy network
/// would produce.
pub struct Network {
    pub nodes: Mutex<Vec<Option<Arc<Replica>>>>,
    reachable: Mutex<Vec<Vec<bool>>>,
}

impl Network {
    pub fn new(n: usize) -> Arc<Self> {
        Arc::new(Self {
            nodes: Mutex::new(vec![None; n]),
            reachable: Mutex::new(vec![vec![true; n]; n]),
        })
    }

    fn route(&self, from: usize, to: usize) -> Option<Arc<Replica>> {
        if !self.reachable.lock().unwrap()[from][to] {
            return None;
        }
        self.nodes.lock().unwrap()[to].clone()
    }

    pub fn isolate(&self, i: usize) {
        let mut r = self.reachable.lock().unwrap();
        let n = r.len();
        for j in 0..n {
            if j != i {
                r[i][j] = false;
                r[j][i] = false;
            }
        }
    }

    pub fn join(&self, i: usize) {
        let mut r = self.reachable.lock().unwrap();
        let n = r.len();
        for j in 0..n {
            r[i][j] = true;
            r[j][i] = true;
        }
    }

    /// Split the cluster in two: `camp` on one side, everyone else on
    /// the other. Traffic only flows within a side.
    pub fn split(&self, camp: &[usize]) {
        let mut r = self.reachable.lock().unwrap();
        let n = r.len();
        for a in 0..n {
            for b in 0..n {
                r[a][b] = camp.contains(&a) == camp.contains(&b);
            }
        }
    }

    pub fn heal(&self) {
        let mut r = self.reachable.lock().unwrap();
        for row in r.iter_mut() {
            row.iter_mut().for_each(|ok| *ok = true);
        }
    }
}

pub struct NodeTransport {
    net: Arc<Network>,
    me: usize,
}

#[async_trait]
impl Transport for NodeTransport {
    async fn request_vote(&self, peer: usize, args: RequestVoteArgs) -> Option<RequestVoteReply> {
        let target = self.net.route(self.me, peer)?;
        target.handle_request_vote(&args).ok()
    }

    async fn append_entries(
        &self,
        peer: usize,
        args: AppendEntriesArgs,
    ) -> Option<AppendEntriesReply> {
        let target = self.net.route(self.me, peer)?;
        target.handle_append_entries(&args).ok()
    }
}

/// Everything every replica incarnation has ever applied. The global
/// registry catches two replicas applying different commands at the
/// same index; the per-node streams let tests assert ordering and
/// exactly-once delivery within an incarnation.
pub struct AppliedLog {
    per_node: Mutex<Vec<Vec<ApplyMsg>>>,
    global: Mutex<HashMap<u64, Vec<u8>>>,
    violations: Mutex<Vec<String>>,
}

impl AppliedLog {
    fn new(n: usize) -> Arc<Self> {
        Arc::new(Self {
            per_node: Mutex::new(vec![Vec::new(); n]),
            global: Mutex::new(HashMap::new()),
            violations: Mutex::new(Vec::new()),
        })
    }

    fn record(&self, node: usize, expected: u64, msg: &ApplyMsg) {
        if msg.index != expected {
            self.violations.lock().unwrap().push(format!(
                "node {node} applied index {} but expected {expected}",
                msg.index
            ));
        }
        let mut global = self.global.lock().unwrap();
        match global.get(&msg.index) {
            Some(prior) if *prior != msg.command => {
                drop(global);
                self.violations.lock().unwrap().push(format!(
                    "index {} applied with two different commands",
                    msg.index
                ));
            }
            Some(_) => {}
            None => {
                global.insert(msg.index, msg.command.clone());
            }
        }
    }

    pub fn for_node(&self, node: usize) -> Vec<ApplyMsg> {
        self.per_node.lock().unwrap()[node].clone()
    }

    pub fn command_at(&self, index: u64) -> Option<Vec<u8>> {
        self.global.lock().unwrap().get(&index).cloned()
    }

    pub fn assert_clean(&self) {
        let v = self.violations.lock().unwrap();
        assert!(v.is_empty(), "apply violations: {:?}", *v);
    }
}

pub fn test_config(seed: u64) -> ReplicaConfig {
    ReplicaConfig {
        election_timeout_min: Duration::from_millis(150),
        election_timeout_max: Duration::from_millis(300),
        heartbeat_interval: Duration::from_millis(50),
        replication_tick: Duration::from_millis(10),
        apply_idle: Duration::from_millis(30),
        seed: Some(seed),
    }
}

/// Configs where `favorite` times out well before anyone else, so the
/// first election has a known winner.
pub fn biased_configs(n: usize, favorite: usize) -> Vec<ReplicaConfig> {
    (0..n)
        .map(|i| {
            let mut c = test_config(i as u64 + 1);
            if i != favorite {
                c.election_timeout_min = Duration::from_millis(600);
                c.election_timeout_max = Duration::from_millis(900);
            }
            c
        })
        .collect()
}

pub struct Cluster {
    pub net: Arc<Network>,
    pub storages: Vec<Arc<MemStorage>>,
    pub applied: Arc<AppliedLog>,
    pub configs: Vec<ReplicaConfig>,
    pub ids: Vec<u64>,
    pub oracle: Oracle,
    collectors: Mutex<Vec<Option<JoinHandle<()>>>>,
    // bumped on every boot so the oracle can tell incarnations apart
    generations: Arc<Mutex<Vec<u64>>>,
}

impl Cluster {
    pub fn start(n: usize) -> Self {
        Self::start_with((0..n).map(|i| test_config(i as u64 * 7 + 1)).collect())
    }

    pub fn start_with(configs: Vec<ReplicaConfig>) -> Self {
        init_tracing();
        let n = configs.len();
        let net = Network::new(n);
        let storages = (0..n).map(|_| Arc::new(MemStorage::new())).collect();
        let applied = AppliedLog::new(n);
        let ids = (1..=n as u64).collect();
        let generations = Arc::new(Mutex::new(vec![0u64; n]));
        let oracle = Oracle::new(net.clone(), applied.clone(), generations.clone());
        let cluster = Self {
            net,
            storages,
            applied,
            configs,
            ids,
            oracle,
            collectors: Mutex::new((0..n).map(|_| None).collect()),
            generations,
        };
        for i in 0..n {
            cluster.boot(i);
        }
        cluster
    }

    /// Build node `i` from its storage and plug it into the network.
    pub fn boot(&self, i: usize) {
        self.generations.lock().unwrap()[i] += 1;
        let (apply_tx, mut apply_rx) = mpsc::channel(256);
        self.applied.per_node.lock().unwrap()[i].clear();
        let collector = {
            let applied = self.applied.clone();
            tokio::spawn(async move {
                let mut expected = 1u64;
                while let Some(msg) = apply_rx.recv().await {
                    applied.record(i, expected, &msg);
                    expected = msg.index + 1;
                    applied.per_node.lock().unwrap()[i].push(msg);
                }
            })
        };
        self.collectors.lock().unwrap()[i] = Some(collector);

        let transport = Arc::new(NodeTransport {
            net: self.net.clone(),
            me: i,
        });
        let replica = Replica::build(
            self.ids.clone(),
            i,
            transport,
            self.storages[i].clone(),
            apply_tx,
            self.configs[i].clone(),
        )
        .expect("replica build");
        self.net.nodes.lock().unwrap()[i] = Some(replica);
    }

    pub fn replica(&self, i: usize) -> Arc<Replica> {
        self.net.nodes.lock().unwrap()[i].clone().expect("node is down")
    }

    /// Stop node `i` and pull it off the wire; its storage survives.
    pub fn crash(&self, i: usize) {
        if let Some(handle) = self.collectors.lock().unwrap()[i].take() {
            handle.abort();
        }
        if let Some(replica) = self.net.nodes.lock().unwrap()[i].take() {
            replica.stop();
            tracing::warn!(node = i, "crashed");
        }
    }

    pub fn restart(&self, i: usize) {
        self.crash(i);
        self.boot(i);
        tracing::warn!(node = i, "restarted");
    }

    pub fn disconnect(&self, i: usize) {
        self.net.isolate(i);
    }

    pub fn reconnect(&self, i: usize) {
        self.net.join(i);
    }

    /// Live claimed leaders as `(node, term)` pairs.
    pub fn claimed_leaders(&self) -> Vec<(usize, u64)> {
        let nodes = self.net.nodes.lock().unwrap();
        nodes
            .iter()
            .enumerate()
            .filter_map(|(i, r)| {
                let (term, is_leader) = r.as_ref()?.state();
                is_leader.then_some((i, term))
            })
            .collect()
    }

    /// The live claimed leader with the highest term, if any. A deposed
    /// leader that has not yet heard the newer term loses the tie.
    pub fn leader(&self) -> Option<usize> {
        self.claimed_leaders()
            .into_iter()
            .max_by_key(|&(_, term)| term)
            .map(|(i, _)| i)
    }

    pub async fn await_leader(&self) -> usize {
        for _ in 0..2000 {
            self.oracle.observe();
            if let Some(leader) = self.leader() {
                return leader;
            }
            time::sleep(Duration::from_millis(10)).await;
        }
        panic!("no leader elected");
    }

    /// Wait for a leader other than `deposed` — a cut-off leader keeps
    /// claiming its old term until someone tells it otherwise.
    pub async fn await_leader_other_than(&self, deposed: usize) -> usize {
        for _ in 0..2000 {
            self.oracle.observe();
            if let Some(leader) = self.leader() {
                if leader != deposed {
                    return leader;
                }
            }
            time::sleep(Duration::from_millis(10)).await;
        }
        panic!("no replacement leader elected");
    }

    /// Wait until exactly one leader exists and every live node agrees
    /// on its term.
    pub async fn await_stable_leader(&self) -> (usize, u64) {
        for _ in 0..2000 {
            self.oracle.observe();
            let leaders = self.claimed_leaders();
            if let [(leader, term)] = leaders[..] {
                let nodes = self.net.nodes.lock().unwrap();
                let agreed = nodes.iter().flatten().all(|r| r.state().0 == term);
                drop(nodes);
                if agreed {
                    return (leader, term);
                }
            }
            time::sleep(Duration::from_millis(10)).await;
        }
        panic!("cluster never stabilized on a single leader");
    }

    pub async fn await_commit(&self, index: u64) {
        let all: Vec<usize> = (0..self.ids.len()).collect();
        self.await_commit_on(&all, index).await;
    }

    /// Wait until every *live* node in `nodes` has committed `index`.
    pub async fn await_commit_on(&self, nodes: &[usize], index: u64) {
        for _ in 0..2000 {
            self.oracle.observe();
            let live = self.net.nodes.lock().unwrap();
            let done = nodes.iter().all(|&i| {
                live[i]
                    .as_ref()
                    .map_or(true, |r| r.read_state(|s| s.commit_index >= index))
            });
            drop(live);
            if done {
                return;
            }
            time::sleep(Duration::from_millis(10)).await;
        }
        panic!("commit index {index} not reached on {nodes:?}");
    }

    pub async fn await_last_index(&self, node: usize, index: u64) {
        for _ in 0..2000 {
            self.oracle.observe();
            let reached = self
                .replica(node)
                .read_state(|s| s.log.last().map(|e| e.index).unwrap_or(0) >= index);
            if reached {
                return;
            }
            time::sleep(Duration::from_millis(10)).await;
        }
        panic!("node {node} never logged index {index}");
    }

    pub async fn await_applied(&self, node: usize, count: usize) {
        for _ in 0..2000 {
            self.oracle.observe();
            if self.applied.for_node(node).len() >= count {
                return;
            }
            time::sleep(Duration::from_millis(10)).await;
        }
        panic!("node {node} never applied {count} entries");
    }

    /// All live nodes hold byte-identical logs.
    pub fn converged(&self) -> bool {
        let nodes = self.net.nodes.lock().unwrap();
        let logs: Vec<_> = nodes
            .iter()
            .flatten()
            .map(|r| r.read_state(|s| s.log.clone()))
            .collect();
        logs.windows(2).all(|w| w[0] == w[1])
    }

    pub async fn await_converged(&self) {
        for _ in 0..2000 {
            self.oracle.observe();
            if self.converged() {
                return;
            }
            time::sleep(Duration::from_millis(10)).await;
        }
        panic!("logs never converged");
    }

    /// Let virtual time pass while the oracle keeps watching.
    pub async fn settle(&self, duration: Duration) {
        let steps = (duration.as_millis() / 10).max(1);
        for _ in 0..steps {
            self.oracle.observe();
            time::sleep(Duration::from_millis(10)).await;
        }
    }
}

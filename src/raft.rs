//! Raft consensus node.
//!
//! Wraps an embedded `openraft` (0.9) replica that totally orders signed
//! transactions and feeds them to the deterministic state machine. Each
//! node runs its own replica — no external consensus service.
//!
//! ## Storage
//!
//! Uses openraft's `Adaptor` to bridge a combined `RaftStorage`
//! implementation (v1 API) into the v2 `RaftLogStorage` + `RaftStateMachine`
//! split interface required by `Raft::new`. The log and stable store are
//! written through to `data_dir` (`log.jsonl`, `stable.json`,
//! `snapshot.json`); the application state machine itself persists only via
//! raft snapshots and is rebuilt by snapshot-restore plus log replay on
//! restart.
//!
//! ## Transport
//!
//! openraft's `AppendEntries`, `Vote`, and `InstallSnapshot` requests are
//! JSON-serialized and sent over the `RaftTransport` gRPC service defined
//! in `proto/collabd.proto`. The proto `payload: bytes` field carries the
//! serialized openraft payload.
//!
//! ## Implementation note on async traits
//!
//! openraft uses RPITIT (return-position impl Trait in Trait) rather than
//! `async_trait::async_trait`. Implementations of its traits must use plain
//! `async fn` — NOT `#[async_trait]` — to match the expected signature.

use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::io::{Cursor, Write as _};
use std::ops::RangeBounds;
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use ed25519_dalek::SigningKey;
use openraft::error::{
    ClientWriteError, InstallSnapshotError, RPCError, RaftError, Unreachable,
};
use openraft::network::{RPCOption, RaftNetwork, RaftNetworkFactory};
use openraft::raft::{
    AppendEntriesRequest, AppendEntriesResponse, InstallSnapshotRequest, InstallSnapshotResponse,
    VoteRequest, VoteResponse,
};
use openraft::storage::{Adaptor, RaftLogReader, RaftSnapshotBuilder, RaftStorage};
use openraft::{
    AnyError, ChangeMembers, Entry, EntryPayload, ErrorSubject, ErrorVerb, LogId, LogState,
    RaftLogId, ServerState, Snapshot, SnapshotMeta, StorageError, StorageIOError,
    StoredMembership, TokioRuntime, Vote,
};
use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};
use tonic::transport::{Channel, Endpoint};
use tracing::{info, warn};

use crate::config::NodeConfig;
use crate::errors::NodeError;
use crate::grpc::proto::raft_transport_client::RaftTransportClient;
use crate::grpc::proto::RaftMessage;
use crate::metrics;
use crate::state::{StateMachine, TxOutcome};
use crate::tx::Tx;

// ── Type configuration ─────────────────────────────────────────────────────────

/// Cluster membership record for one node. Carries both listen addresses so
/// leader hints in HTTP responses can point clients at the leader's
/// dispatcher, not its raft transport.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerNode {
    /// Human-readable node id (`P2P_NODE_ID`).
    pub name: String,
    pub raft_addr: String,
    pub http_addr: String,
}

// The `declare_raft_types!` macro generates the TypeConfig struct and all
// required trait impls (including `Responder` via `OneshotResponder`).
openraft::declare_raft_types!(
    pub TypeConfig:
        D            = Tx,
        R            = TxOutcome,
        NodeId       = u64,
        Node         = PeerNode,
        Entry        = Entry<TypeConfig>,
        SnapshotData = Cursor<Vec<u8>>,
        AsyncRuntime = TokioRuntime,
);

pub type NodeId = u64;
pub type RaftInstance = openraft::Raft<TypeConfig>;

// ── Utility ───────────────────────────────────────────────────────────────────

/// Derive a stable u64 node ID from a human-readable string identifier.
pub fn node_id_from_str(s: &str) -> u64 {
    use std::hash::{Hash, Hasher};
    let mut h = std::collections::hash_map::DefaultHasher::new();
    s.hash(&mut h);
    h.finish()
}

// ── File-backed combined storage (openraft v1 RaftStorage) ────────────────────

const LOG_FILE: &str = "log.jsonl";
const STABLE_FILE: &str = "stable.json";
const SNAPSHOT_FILE: &str = "snapshot.json";

/// Vote, committed index and purge watermark, persisted as one small file.
#[derive(Debug, Default, Serialize, Deserialize)]
struct StableFile {
    vote: Option<Vote<NodeId>>,
    committed: Option<LogId<NodeId>>,
    last_purged: Option<LogId<NodeId>>,
}

/// The state-machine snapshot on disk: raft metadata plus the canonical
/// state serialization.
#[derive(Debug, Serialize, Deserialize)]
struct SnapshotFile {
    meta: SnapshotMeta<NodeId, PeerNode>,
    state: serde_json::Value,
}

/// Combined raft storage: log entries + stable store + the shared state
/// machine, written through to `data_dir`.
///
/// Wrapped by `openraft::storage::Adaptor::new(store)` to produce the v2
/// `(RaftLogStorage, RaftStateMachine)` split required by `Raft::new`.
pub struct FileStore {
    dir: PathBuf,
    vote: Option<Vote<NodeId>>,
    log: BTreeMap<u64, Entry<TypeConfig>>,
    committed: Option<LogId<NodeId>>,
    last_purged: Option<LogId<NodeId>>,
    last_applied: Option<LogId<NodeId>>,
    last_membership: StoredMembership<NodeId, PeerNode>,
    sm: Arc<RwLock<StateMachine>>,
}

fn read_err(e: impl std::error::Error + 'static) -> StorageError<NodeId> {
    StorageError::IO {
        source: StorageIOError::new(ErrorSubject::Store, ErrorVerb::Read, AnyError::new(&e)),
    }
}

fn write_err(e: impl std::error::Error + 'static) -> StorageError<NodeId> {
    StorageError::IO {
        source: StorageIOError::new(ErrorSubject::Store, ErrorVerb::Write, AnyError::new(&e)),
    }
}

impl FileStore {
    /// Open (or create) the store under `dir`, restoring any persisted
    /// snapshot into `sm` and reloading the log. The second return value is
    /// true when prior raft state exists — used to skip re-bootstrap on
    /// restart.
    pub fn open(dir: &Path, sm: Arc<RwLock<StateMachine>>) -> Result<(Self, bool), NodeError> {
        fs::create_dir_all(dir)
            .map_err(|e| NodeError::Internal(format!("create {}: {e}", dir.display())))?;

        let stable: StableFile = match fs::read(dir.join(STABLE_FILE)) {
            Ok(bytes) => serde_json::from_slice(&bytes)
                .map_err(|e| NodeError::Internal(format!("corrupt {STABLE_FILE}: {e}")))?,
            Err(_) => StableFile::default(),
        };

        let mut last_applied = None;
        let mut last_membership = StoredMembership::default();
        let mut had_snapshot = false;
        if let Ok(bytes) = fs::read(dir.join(SNAPSHOT_FILE)) {
            let snap: SnapshotFile = serde_json::from_slice(&bytes)
                .map_err(|e| NodeError::Internal(format!("corrupt {SNAPSHOT_FILE}: {e}")))?;
            let state: StateMachine = serde_json::from_value(snap.state)
                .map_err(|e| NodeError::Internal(format!("corrupt snapshot state: {e}")))?;
            *sm.write().unwrap() = state;
            last_applied = snap.meta.last_log_id;
            last_membership = snap.meta.last_membership.clone();
            had_snapshot = true;
        }

        let mut log = BTreeMap::new();
        if let Ok(contents) = fs::read_to_string(dir.join(LOG_FILE)) {
            for line in contents.lines() {
                if line.trim().is_empty() {
                    continue;
                }
                let entry: Entry<TypeConfig> = serde_json::from_str(line)
                    .map_err(|e| NodeError::Internal(format!("corrupt {LOG_FILE}: {e}")))?;
                log.insert(entry.get_log_id().index, entry);
            }
        }

        let had_state = stable.vote.is_some() || !log.is_empty() || had_snapshot;
        let store = Self {
            dir: dir.to_path_buf(),
            vote: stable.vote,
            log,
            committed: stable.committed,
            last_purged: stable.last_purged,
            last_applied,
            last_membership,
            sm,
        };
        Ok((store, had_state))
    }

    fn persist_stable(&self) -> Result<(), StorageError<NodeId>> {
        let stable = StableFile {
            vote: self.vote,
            committed: self.committed,
            last_purged: self.last_purged,
        };
        let bytes = serde_json::to_vec(&stable).map_err(write_err)?;
        fs::write(self.dir.join(STABLE_FILE), bytes).map_err(write_err)
    }

    fn append_log_lines(&self, entries: &[Entry<TypeConfig>]) -> Result<(), StorageError<NodeId>> {
        let mut file = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.dir.join(LOG_FILE))
            .map_err(write_err)?;
        for entry in entries {
            let line = serde_json::to_string(entry).map_err(write_err)?;
            writeln!(file, "{line}").map_err(write_err)?;
        }
        Ok(())
    }

    fn rewrite_log_file(&self) -> Result<(), StorageError<NodeId>> {
        let mut out = String::new();
        for entry in self.log.values() {
            let line = serde_json::to_string(entry).map_err(write_err)?;
            out.push_str(&line);
            out.push('\n');
        }
        fs::write(self.dir.join(LOG_FILE), out).map_err(write_err)
    }

    fn read_snapshot_file(&self) -> Result<Option<SnapshotFile>, StorageError<NodeId>> {
        match fs::read(self.dir.join(SNAPSHOT_FILE)) {
            Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes).map_err(read_err)?)),
            Err(_) => Ok(None),
        }
    }
}

// RaftStorage v1 requires FileStore to implement RaftLogReader directly
// (because RaftStorage: RaftLogReader). Plain async fn, no #[async_trait]:
// openraft traits use RPITIT, not boxed futures.
impl RaftLogReader<TypeConfig> for FileStore {
    async fn try_get_log_entries<RB>(
        &mut self,
        range: RB,
    ) -> Result<Vec<Entry<TypeConfig>>, StorageError<NodeId>>
    where
        RB: RangeBounds<u64> + Clone + std::fmt::Debug + Send,
    {
        Ok(self.log.range(range).map(|(_, e)| e.clone()).collect())
    }
}

/// Log reader backed by a snapshot of the log at a point in time.
pub struct FileLogReader {
    log: BTreeMap<u64, Entry<TypeConfig>>,
}

impl RaftLogReader<TypeConfig> for FileLogReader {
    async fn try_get_log_entries<RB>(
        &mut self,
        range: RB,
    ) -> Result<Vec<Entry<TypeConfig>>, StorageError<NodeId>>
    where
        RB: RangeBounds<u64> + Clone + std::fmt::Debug + Send,
    {
        Ok(self.log.range(range).map(|(_, e)| e.clone()).collect())
    }
}

/// Snapshot builder — serializes the state machine captured at builder
/// creation and persists it next to the log.
pub struct FileSnapshotBuilder {
    last_applied: Option<LogId<NodeId>>,
    last_membership: StoredMembership<NodeId, PeerNode>,
    state: serde_json::Value,
    dir: PathBuf,
}

impl RaftSnapshotBuilder<TypeConfig> for FileSnapshotBuilder {
    async fn build_snapshot(&mut self) -> Result<Snapshot<TypeConfig>, StorageError<NodeId>> {
        let snap_id = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap_or_default()
            .as_millis()
            .to_string();

        let meta = SnapshotMeta {
            last_log_id: self.last_applied,
            last_membership: self.last_membership.clone(),
            snapshot_id: snap_id,
        };
        let file = SnapshotFile {
            meta: meta.clone(),
            state: self.state.clone(),
        };
        let bytes = serde_json::to_vec(&file).map_err(write_err)?;
        fs::write(self.dir.join(SNAPSHOT_FILE), bytes).map_err(write_err)?;

        let data = serde_json::to_vec(&self.state).map_err(write_err)?;
        Ok(Snapshot {
            meta,
            snapshot: Box::new(Cursor::new(data)),
        })
    }
}

/// openraft v1 `RaftStorage` implementation for `FileStore`.
///
/// Wrapped by `Adaptor::new(store)` to produce v2 split traits.
/// Method names follow the v1 API:
///   - `append_to_log` (NOT `append`)
///   - `delete_conflict_logs_since` (NOT `truncate`)
///   - `purge_logs_upto` (NOT `purge`)
///   - `apply_to_state_machine` (NOT `apply`)
impl RaftStorage<TypeConfig> for FileStore {
    type LogReader = FileLogReader;
    type SnapshotBuilder = FileSnapshotBuilder;

    // ── Vote ──────────────────────────────────────────────────────────────────

    async fn save_vote(&mut self, vote: &Vote<NodeId>) -> Result<(), StorageError<NodeId>> {
        self.vote = Some(*vote);
        self.persist_stable()
    }

    async fn read_vote(&mut self) -> Result<Option<Vote<NodeId>>, StorageError<NodeId>> {
        Ok(self.vote)
    }

    // ── Log ───────────────────────────────────────────────────────────────────

    async fn get_log_state(&mut self) -> Result<LogState<TypeConfig>, StorageError<NodeId>> {
        let last = self.log.values().next_back().map(|e| *e.get_log_id());
        Ok(LogState {
            last_purged_log_id: self.last_purged,
            last_log_id: last.or(self.last_purged),
        })
    }

    async fn save_committed(
        &mut self,
        committed: Option<LogId<NodeId>>,
    ) -> Result<(), StorageError<NodeId>> {
        self.committed = committed;
        self.persist_stable()
    }

    async fn read_committed(&mut self) -> Result<Option<LogId<NodeId>>, StorageError<NodeId>> {
        Ok(self.committed)
    }

    async fn get_log_reader(&mut self) -> Self::LogReader {
        FileLogReader {
            log: self.log.clone(),
        }
    }

    /// Append log entries (v1 method name).
    async fn append_to_log<I>(&mut self, entries: I) -> Result<(), StorageError<NodeId>>
    where
        I: IntoIterator<Item = Entry<TypeConfig>> + Send,
    {
        let entries: Vec<_> = entries.into_iter().collect();
        self.append_log_lines(&entries)?;
        for entry in entries {
            self.log.insert(entry.get_log_id().index, entry);
        }
        Ok(())
    }

    /// Delete conflict log entries since `log_id` inclusive (v1 method name).
    async fn delete_conflict_logs_since(
        &mut self,
        log_id: LogId<NodeId>,
    ) -> Result<(), StorageError<NodeId>> {
        self.log.retain(|&idx, _| idx < log_id.index);
        self.rewrite_log_file()
    }

    /// Delete applied log entries up to `log_id` inclusive (v1 method name).
    async fn purge_logs_upto(&mut self, log_id: LogId<NodeId>) -> Result<(), StorageError<NodeId>> {
        self.log.retain(|&idx, _| idx > log_id.index);
        self.last_purged = Some(log_id);
        self.rewrite_log_file()?;
        self.persist_stable()
    }

    // ── State machine ─────────────────────────────────────────────────────────

    async fn last_applied_state(
        &mut self,
    ) -> Result<(Option<LogId<NodeId>>, StoredMembership<NodeId, PeerNode>), StorageError<NodeId>>
    {
        Ok((self.last_applied, self.last_membership.clone()))
    }

    /// Apply committed entries to state machine (v1 method name, takes a slice).
    async fn apply_to_state_machine(
        &mut self,
        entries: &[Entry<TypeConfig>],
    ) -> Result<Vec<TxOutcome>, StorageError<NodeId>> {
        let mut responses = Vec::with_capacity(entries.len());

        for entry in entries {
            self.last_applied = Some(*entry.get_log_id());

            match &entry.payload {
                EntryPayload::Blank => {
                    responses.push(TxOutcome::internal("noop"));
                }
                EntryPayload::Normal(tx) => {
                    let outcome = self.sm.write().unwrap().apply(tx);
                    if outcome.ok {
                        metrics::TX_APPLIED_TOTAL
                            .with_label_values(&[tx.op.as_str()])
                            .inc();
                    } else {
                        metrics::TX_REJECTED_TOTAL
                            .with_label_values(&[outcome.code.as_deref().unwrap_or("UNKNOWN")])
                            .inc();
                    }
                    responses.push(outcome);
                }
                EntryPayload::Membership(m) => {
                    self.last_membership =
                        StoredMembership::new(Some(*entry.get_log_id()), m.clone());
                    responses.push(TxOutcome::internal("membership change applied"));
                }
            }
        }

        Ok(responses)
    }

    async fn get_snapshot_builder(&mut self) -> Self::SnapshotBuilder {
        FileSnapshotBuilder {
            last_applied: self.last_applied,
            last_membership: self.last_membership.clone(),
            state: serde_json::to_value(&*self.sm.read().unwrap())
                .unwrap_or(serde_json::Value::Null),
            dir: self.dir.clone(),
        }
    }

    async fn begin_receiving_snapshot(
        &mut self,
    ) -> Result<Box<Cursor<Vec<u8>>>, StorageError<NodeId>> {
        Ok(Box::new(Cursor::new(Vec::new())))
    }

    async fn install_snapshot(
        &mut self,
        meta: &SnapshotMeta<NodeId, PeerNode>,
        snapshot: Box<Cursor<Vec<u8>>>,
    ) -> Result<(), StorageError<NodeId>> {
        let state: StateMachine =
            serde_json::from_slice(snapshot.get_ref()).map_err(read_err)?;
        let state_value = serde_json::to_value(&state).map_err(write_err)?;

        *self.sm.write().unwrap() = state;
        self.last_applied = meta.last_log_id;
        self.last_membership = meta.last_membership.clone();

        let file = SnapshotFile {
            meta: meta.clone(),
            state: state_value,
        };
        let bytes = serde_json::to_vec(&file).map_err(write_err)?;
        fs::write(self.dir.join(SNAPSHOT_FILE), bytes).map_err(write_err)
    }

    async fn get_current_snapshot(
        &mut self,
    ) -> Result<Option<Snapshot<TypeConfig>>, StorageError<NodeId>> {
        match self.read_snapshot_file()? {
            Some(file) => {
                let data = serde_json::to_vec(&file.state).map_err(read_err)?;
                Ok(Some(Snapshot {
                    meta: file.meta,
                    snapshot: Box::new(Cursor::new(data)),
                }))
            }
            None => Ok(None),
        }
    }
}

// ── gRPC network transport ─────────────────────────────────────────────────────

/// Per-peer gRPC channel implementing openraft's `RaftNetwork`.
///
/// Serializes openraft request types as JSON and transports them via the
/// proto `payload: bytes` field of the `RaftTransport` service.
pub struct GrpcNetwork {
    target_addr: String,
    client: Option<RaftTransportClient<Channel>>,
}

impl GrpcNetwork {
    fn get_client(&mut self) -> Result<&mut RaftTransportClient<Channel>, String> {
        if self.client.is_none() {
            let uri = if self.target_addr.starts_with("http") {
                self.target_addr.clone()
            } else {
                format!("http://{}", self.target_addr)
            };
            // connect_lazy() returns immediately without a blocking TCP
            // handshake; tonic dials on the first RPC and reconnects
            // automatically on failure. connect_timeout limits the TCP
            // handshake; timeout limits each RPC so heartbeats fail fast
            // instead of hanging until a follower's election timer fires.
            let ch = Endpoint::from_shared(uri)
                .map_err(|e| e.to_string())?
                .connect_timeout(Duration::from_secs(3))
                .timeout(Duration::from_secs(4))
                .connect_lazy();
            self.client = Some(RaftTransportClient::new(ch));
        }
        Ok(self.client.as_mut().unwrap())
    }
}

fn unreachable(msg: impl std::fmt::Display) -> Unreachable {
    Unreachable::new(&AnyError::error(msg.to_string()))
}

impl RaftNetwork<TypeConfig> for GrpcNetwork {
    // Return types use NodeId (not TypeConfig) for response generics per the
    // trait signature.

    async fn append_entries(
        &mut self,
        rpc: AppendEntriesRequest<TypeConfig>,
        _option: RPCOption,
    ) -> Result<AppendEntriesResponse<NodeId>, RPCError<NodeId, PeerNode, RaftError<NodeId>>> {
        let payload =
            serde_json::to_vec(&rpc).map_err(|e| RPCError::Unreachable(unreachable(e)))?;

        let term = rpc.vote.leader_id().term;
        let from_node = rpc.vote.leader_id().node_id;

        let client = self
            .get_client()
            .map_err(|e| RPCError::Unreachable(unreachable(e)))?;

        let reply = client
            .append_entries(RaftMessage {
                term,
                from_node,
                payload,
            })
            .await
            .map_err(|e| RPCError::Unreachable(unreachable(e)))?;

        serde_json::from_slice(&reply.into_inner().payload)
            .map_err(|e| RPCError::Unreachable(unreachable(e)))
    }

    async fn vote(
        &mut self,
        rpc: VoteRequest<NodeId>,
        _option: RPCOption,
    ) -> Result<VoteResponse<NodeId>, RPCError<NodeId, PeerNode, RaftError<NodeId>>> {
        let payload =
            serde_json::to_vec(&rpc).map_err(|e| RPCError::Unreachable(unreachable(e)))?;

        let term = rpc.vote.leader_id().term;
        let from_node = rpc.vote.leader_id().node_id;

        let client = self
            .get_client()
            .map_err(|e| RPCError::Unreachable(unreachable(e)))?;

        let reply = client
            .vote(RaftMessage {
                term,
                from_node,
                payload,
            })
            .await
            .map_err(|e| RPCError::Unreachable(unreachable(e)))?;

        serde_json::from_slice(&reply.into_inner().payload)
            .map_err(|e| RPCError::Unreachable(unreachable(e)))
    }

    async fn install_snapshot(
        &mut self,
        rpc: InstallSnapshotRequest<TypeConfig>,
        _option: RPCOption,
    ) -> Result<
        InstallSnapshotResponse<NodeId>,
        RPCError<NodeId, PeerNode, RaftError<NodeId, InstallSnapshotError>>,
    > {
        let payload =
            serde_json::to_vec(&rpc).map_err(|e| RPCError::Unreachable(unreachable(e)))?;

        let term = rpc.vote.leader_id().term;
        let from_node = rpc.vote.leader_id().node_id;

        let client = self
            .get_client()
            .map_err(|e| RPCError::Unreachable(unreachable(e)))?;

        let reply = client
            .install_snapshot(RaftMessage {
                term,
                from_node,
                payload,
            })
            .await
            .map_err(|e| RPCError::Unreachable(unreachable(e)))?;

        serde_json::from_slice(&reply.into_inner().payload)
            .map_err(|e| RPCError::Unreachable(unreachable(e)))
    }
}

/// Creates `GrpcNetwork` instances per target peer node.
pub struct GrpcNetworkFactory;

impl RaftNetworkFactory<TypeConfig> for GrpcNetworkFactory {
    type Network = GrpcNetwork;

    async fn new_client(&mut self, _target: NodeId, node: &PeerNode) -> Self::Network {
        GrpcNetwork {
            target_addr: node.raft_addr.clone(),
            client: None,
        }
    }
}

// ── RaftNode public API ────────────────────────────────────────────────────────

/// Raft status snapshot served by `GET /v1/p2p/raft`.
#[derive(Debug, Clone, Serialize)]
pub struct RaftStatus {
    pub node_id: String,
    pub state: String,
    pub term: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_log_index: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_applied: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub leader: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub leader_id: Option<String>,
    pub voters: Vec<PeerNode>,
}

/// A running consensus node: the raft replica, the shared state machine,
/// and the node's own signing key (used for sweeper transactions).
pub struct RaftNode {
    pub raft: RaftInstance,
    pub id: NodeId,
    pub config: NodeConfig,
    sm: Arc<RwLock<StateMachine>>,
    signer: SigningKey,
}

impl RaftNode {
    /// Returns true if this node is the current raft leader.
    pub fn is_leader(&self) -> bool {
        self.raft.metrics().borrow().current_leader == Some(self.id)
    }

    /// The local state machine, shared with the raft applier. Readers take
    /// the read lock; only the applier writes.
    pub fn state_machine(&self) -> Arc<RwLock<StateMachine>> {
        self.sm.clone()
    }

    /// The node's Ed25519 key, signer of system transactions.
    pub fn signer(&self) -> &SigningKey {
        &self.signer
    }

    /// Current raft role as a lowercase label.
    pub fn state_str(&self) -> &'static str {
        match self.raft.metrics().borrow().state {
            ServerState::Leader => "leader",
            ServerState::Follower => "follower",
            ServerState::Candidate => "candidate",
            ServerState::Learner => "learner",
            _ => "unknown",
        }
    }

    /// HTTP address and human-readable id of the current leader, when known.
    pub fn leader_hint(&self) -> (Option<String>, Option<String>) {
        let m = self.raft.metrics().borrow().clone();
        match m.current_leader {
            Some(leader_id) => {
                let node = m
                    .membership_config
                    .membership()
                    .get_node(&leader_id)
                    .cloned();
                (
                    node.as_ref().map(|n| n.http_addr.clone()),
                    node.map(|n| n.name),
                )
            }
            None => (None, None),
        }
    }

    pub fn status(&self) -> RaftStatus {
        let m = self.raft.metrics().borrow().clone();
        let (leader, leader_id) = self.leader_hint();
        let voter_ids: BTreeSet<NodeId> =
            m.membership_config.membership().voter_ids().collect();
        let voters = m
            .membership_config
            .membership()
            .nodes()
            .filter(|(id, _)| voter_ids.contains(id))
            .map(|(_, node)| node.clone())
            .collect();
        RaftStatus {
            node_id: self.config.node_id.clone(),
            state: self.state_str().to_string(),
            term: m.current_term,
            last_log_index: m.last_log_index,
            last_applied: m.last_applied.map(|l| l.index),
            leader,
            leader_id,
            voters,
        }
    }

    /// Verify, propose and await apply of a signed transaction.
    ///
    /// Rejections computed by the state machine come back as an `Ok`
    /// outcome with `ok = false`; `Err` covers everything that prevented
    /// the transaction from being applied at all.
    pub async fn apply_tx(&self, tx: Tx) -> Result<TxOutcome, NodeError> {
        tx.validate_basic().map_err(NodeError::Rejected)?;
        if let Err(rej) = tx.verify() {
            warn!(tx_id = %tx.tx_id, actor = %tx.actor, "transaction signature rejected");
            return Err(NodeError::Rejected(rej));
        }

        if !self.is_leader() {
            let (leader, leader_id) = self.leader_hint();
            return Err(NodeError::NotLeader { leader, leader_id });
        }

        match tokio::time::timeout(self.config.apply_timeout, self.raft.client_write(tx)).await {
            Err(_) => Err(NodeError::Timeout),
            Ok(Ok(resp)) => Ok(resp.data),
            Ok(Err(err)) => Err(self.map_raft_err(err)),
        }
    }

    /// Add a peer as a voting member (leader only): learner first, then
    /// promote via membership change.
    pub async fn add_voter(
        &self,
        name: &str,
        raft_addr: &str,
        http_addr: &str,
    ) -> Result<(), NodeError> {
        let id = node_id_from_str(name);
        let node = PeerNode {
            name: name.to_string(),
            raft_addr: raft_addr.to_string(),
            http_addr: http_addr.to_string(),
        };
        self.raft
            .add_learner(id, node, true)
            .await
            .map_err(|e| self.map_raft_err(e))?;
        let mut ids = BTreeSet::new();
        ids.insert(id);
        self.raft
            .change_membership(ChangeMembers::AddVoterIds(ids), false)
            .await
            .map_err(|e| self.map_raft_err(e))?;
        info!(node_id = %name, raft_addr = %raft_addr, "voter added");
        Ok(())
    }

    /// Remove a member from the cluster (leader only).
    pub async fn remove_server(&self, name: &str) -> Result<(), NodeError> {
        let id = node_id_from_str(name);
        let mut ids = BTreeSet::new();
        ids.insert(id);
        self.raft
            .change_membership(ChangeMembers::RemoveVoters(ids), false)
            .await
            .map_err(|e| self.map_raft_err(e))?;
        info!(node_id = %name, "server removed");
        Ok(())
    }

    fn map_raft_err(
        &self,
        err: RaftError<NodeId, ClientWriteError<NodeId, PeerNode>>,
    ) -> NodeError {
        match err {
            RaftError::APIError(ClientWriteError::ForwardToLeader(fwd)) => {
                warn!(leader = ?fwd.leader_node, "write refused: not the leader");
                NodeError::NotLeader {
                    leader: fwd.leader_node.as_ref().map(|n| n.http_addr.clone()),
                    leader_id: fwd.leader_node.map(|n| n.name),
                }
            }
            other => NodeError::Internal(other.to_string()),
        }
    }
}

// ── Startup ───────────────────────────────────────────────────────────────────

/// Build and start a node: storage, raft replica, gRPC transport, HTTP
/// dispatcher, lease sweeper, and the bootstrap-or-join path.
pub async fn launch(config: NodeConfig) -> Result<Arc<RaftNode>, NodeError> {
    metrics::register_metrics();

    let sm = Arc::new(RwLock::new(StateMachine::new()));
    let (store, had_state) = FileStore::open(&config.data_dir, sm.clone())?;
    let (log_store, state_machine) = Adaptor::new(store);

    let raft_config = Arc::new(
        openraft::Config {
            cluster_name: "collabd".to_string(),
            heartbeat_interval: 250,
            election_timeout_min: 1_500,
            election_timeout_max: 3_000,
            ..Default::default()
        }
        .validate()
        .expect("valid openraft config"),
    );

    let id = node_id_from_str(&config.node_id);
    let raft = openraft::Raft::new(id, raft_config, GrpcNetworkFactory, log_store, state_machine)
        .await
        .map_err(|e| NodeError::Internal(format!("failed to create raft instance: {e}")))?;

    let node = Arc::new(RaftNode {
        raft,
        id,
        config: config.clone(),
        sm,
        signer: SigningKey::generate(&mut OsRng),
    });

    tokio::spawn(crate::grpc::start_transport_server(node.clone()));
    tokio::spawn(crate::http::start_http_server(node.clone()));

    if config.bootstrap && !had_state {
        let mut members = BTreeMap::new();
        members.insert(
            id,
            PeerNode {
                name: config.node_id.clone(),
                raft_addr: config.raft_addr.clone(),
                http_addr: config.http_addr.clone(),
            },
        );
        if let Err(e) = node.raft.initialize(members).await {
            info!(error = %e, "raft already initialized (ignoring on restart)");
        }
    } else if config.join_endpoint.is_some() {
        tokio::spawn(crate::http::join_via_peer(node.clone()));
    }

    // Watch raft state: keep the leader gauge current and log transitions.
    {
        let mut rx = node.raft.metrics();
        let node_id = config.node_id.clone();
        tokio::spawn(async move {
            let mut last_state: Option<ServerState> = None;
            loop {
                let m = rx.borrow().clone();
                metrics::RAFT_IS_LEADER.set(i64::from(m.state == ServerState::Leader));
                if last_state != Some(m.state) {
                    info!(
                        node_id = %node_id,
                        state = ?m.state,
                        term = m.current_term,
                        leader = ?m.current_leader,
                        "raft state changed"
                    );
                    last_state = Some(m.state);
                }
                if rx.changed().await.is_err() {
                    break;
                }
            }
        });
    }

    tokio::spawn(crate::sweeper::run_lease_sweeper(node.clone()));

    info!(
        node_id = %config.node_id,
        raft_addr = %config.raft_addr,
        http_addr = %config.http_addr,
        bootstrap = config.bootstrap,
        "node started"
    );

    Ok(node)
}

// ── Tests ──────────────────────────────────────────────────────────────────────

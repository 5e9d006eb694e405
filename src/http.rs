//! HTTP dispatcher — the kernel's only external surface.
//!
//! Stateless translation between HTTP JSON and the node: signed
//! transactions in, state-machine reads out, plus cluster membership and
//! health. Writes must reach the leader; followers answer 409 with a
//! `NOT_LEADER` envelope carrying the leader's HTTP address and id so
//! clients can redirect. Reads consult the local state machine and are
//! eventually consistent on followers.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use hyper::service::{make_service_fn, service_fn};
use hyper::{Body, Request, Response, Server, StatusCode};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::{error, info, warn};

use crate::errors::{ErrorCode, NodeError};
use crate::metrics;
use crate::raft::RaftNode;
use crate::tx::Tx;

/// Per-request deadline for every handler.
const REQUEST_DEADLINE: Duration = Duration::from_secs(30);

const DEFAULT_LIMIT: usize = 100;
const MAX_LIMIT: usize = 500;

// ── Wire records ──────────────────────────────────────────────────────────────

#[derive(Debug, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct JoinRequest {
    pub node_id: String,
    pub raft_addr: String,
    pub http_addr: String,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RemoveRequest {
    pub node_id: String,
}

// ── Server ────────────────────────────────────────────────────────────────────

/// Starts the dispatcher bound to `P2P_HTTP_ADDR`. Runs until the process
/// exits; callers spawn it in a background task.
pub async fn start_http_server(node: Arc<RaftNode>) {
    let bind_addr = node.config.http_addr.clone();
    let addr: SocketAddr = match bind_addr.parse() {
        Ok(addr) => addr,
        Err(e) => {
            error!(addr = %bind_addr, error = %e, "invalid http address");
            return;
        }
    };

    let make_svc = make_service_fn(move |_conn| {
        let node = node.clone();
        async move {
            Ok::<_, hyper::Error>(service_fn(move |req| {
                let node = node.clone();
                async move {
                    let resp = match tokio::time::timeout(REQUEST_DEADLINE, route(req, node)).await
                    {
                        Ok(resp) => resp,
                        Err(_) => envelope(ErrorCode::Internal, "request deadline exceeded"),
                    };
                    Ok::<_, hyper::Error>(resp)
                }
            }))
        }
    });

    let server = Server::bind(&addr).serve(make_svc);
    info!(addr = %addr, "http dispatcher started");

    if let Err(e) = server.await {
        error!(error = %e, "http dispatcher error");
    }
}

async fn route(req: Request<Body>, node: Arc<RaftNode>) -> Response<Body> {
    let method = req.method().as_str().to_string();
    let path = req.uri().path().to_string();
    let query = req.uri().query().map(str::to_string);
    let segs: Vec<&str> = path.split('/').filter(|s| !s.is_empty()).collect();

    match (method.as_str(), segs.as_slice()) {
        ("GET", ["healthz"]) => healthz(&node),
        ("GET", ["metrics"]) => metrics_text(),
        ("GET", ["v1", "p2p", "raft"]) => json_ok(&node.status()),
        ("POST", ["v1", "p2p", "raft", "join"]) => join(req, &node).await,
        ("POST", ["v1", "p2p", "raft", "remove"]) => remove(req, &node).await,
        ("POST", ["v1", "p2p", "tx"]) => submit_tx(req, &node).await,
        ("GET", ["v1", "p2p", "stats"]) => stats(&node),
        ("GET", ["v1", "p2p", "sessions", id]) => get_session(&node, id),
        ("GET", ["v1", "p2p", "sessions", id, "participants"]) => {
            list_participants(&node, id, query.as_deref())
        }
        ("GET", ["v1", "p2p", "sessions", id, "steps", "open"]) => {
            list_open_steps(&node, id, query.as_deref())
        }
        ("GET", ["v1", "p2p", "sessions", id, "events"]) => {
            list_events(&node, id, query.as_deref())
        }
        ("GET", ["v1", "p2p", "steps", id]) => get_step(&node, id),
        ("GET", ["v1", "p2p", "steps", id, "artifacts"]) => list_artifacts(&node, id),
        _ => envelope(ErrorCode::NotFound, "unknown route"),
    }
}

// ── Handlers ──────────────────────────────────────────────────────────────────

fn healthz(node: &RaftNode) -> Response<Body> {
    let (leader, leader_id) = node.leader_hint();
    json_ok(&json!({
        "node_id": node.config.node_id,
        "state": node.state_str(),
        "leader": leader,
        "leader_id": leader_id,
    }))
}

fn metrics_text() -> Response<Body> {
    Response::builder()
        .status(StatusCode::OK)
        .header("Content-Type", "text/plain; version=0.0.4")
        .body(Body::from(metrics::encode_text()))
        .unwrap_or_default()
}

async fn submit_tx(req: Request<Body>, node: &RaftNode) -> Response<Body> {
    let tx: Tx = match read_json(req).await {
        Ok(tx) => tx,
        Err(resp) => return resp,
    };

    match node.apply_tx(tx).await {
        Ok(outcome) if outcome.ok => json_ok(&json!({
            "tx_id": outcome.tx_id,
            "session_id": outcome.session_id,
            "status": "APPLIED",
        })),
        Ok(outcome) => json_status(
            StatusCode::BAD_REQUEST,
            &json!({
                "error": ErrorCode::TxRejected.as_str(),
                "message": outcome.message,
                "code": outcome.code,
                "tx_id": outcome.tx_id,
            }),
        ),
        Err(err) => node_error_response(node, err),
    }
}

async fn join(req: Request<Body>, node: &RaftNode) -> Response<Body> {
    let body: JoinRequest = match read_json(req).await {
        Ok(body) => body,
        Err(resp) => return resp,
    };
    if !node.is_leader() {
        return not_leader(node);
    }
    match node
        .add_voter(&body.node_id, &body.raft_addr, &body.http_addr)
        .await
    {
        Ok(()) => json_ok(&json!({ "status": "JOINED", "node_id": body.node_id })),
        Err(NodeError::NotLeader { .. }) => not_leader(node),
        Err(err) => {
            warn!(node_id = %body.node_id, error = %err, "join failed");
            envelope(ErrorCode::JoinFailed, &err.to_string())
        }
    }
}

async fn remove(req: Request<Body>, node: &RaftNode) -> Response<Body> {
    let body: RemoveRequest = match read_json(req).await {
        Ok(body) => body,
        Err(resp) => return resp,
    };
    if !node.is_leader() {
        return not_leader(node);
    }
    match node.remove_server(&body.node_id).await {
        Ok(()) => json_ok(&json!({ "status": "REMOVED", "node_id": body.node_id })),
        Err(NodeError::NotLeader { .. }) => not_leader(node),
        Err(err) => {
            warn!(node_id = %body.node_id, error = %err, "remove failed");
            envelope(ErrorCode::RemoveFailed, &err.to_string())
        }
    }
}

fn stats(node: &RaftNode) -> Response<Body> {
    let now_ms = chrono::Utc::now().timestamp_millis();
    let stats = node.state_machine().read().unwrap().stats(now_ms);
    json_ok(&stats)
}

fn get_session(node: &RaftNode, id: &str) -> Response<Body> {
    match node.state_machine().read().unwrap().get_session(id) {
        Some(session) => json_ok(&session),
        None => envelope(ErrorCode::NotFound, &format!("session {id} not found")),
    }
}

fn get_step(node: &RaftNode, id: &str) -> Response<Body> {
    match node.state_machine().read().unwrap().get_step(id) {
        Some(step) => json_ok(&step),
        None => envelope(ErrorCode::NotFound, &format!("step {id} not found")),
    }
}

fn list_participants(node: &RaftNode, id: &str, query: Option<&str>) -> Response<Body> {
    let (limit, offset) = match pagination(query) {
        Ok(p) => p,
        Err(resp) => return resp,
    };
    match node
        .state_machine()
        .read()
        .unwrap()
        .list_participants(id, limit, offset)
    {
        Some(participants) => json_ok(&participants),
        None => envelope(ErrorCode::NotFound, &format!("session {id} not found")),
    }
}

fn list_open_steps(node: &RaftNode, id: &str, query: Option<&str>) -> Response<Body> {
    let (limit, offset) = match pagination(query) {
        Ok(p) => p,
        Err(resp) => return resp,
    };
    let participant = query_param(query, "participant_id");
    let now_ms = chrono::Utc::now().timestamp_millis();
    match node.state_machine().read().unwrap().list_open_steps(
        id,
        participant.as_deref(),
        now_ms,
        limit,
        offset,
    ) {
        Some(steps) => json_ok(&steps),
        None => envelope(ErrorCode::NotFound, &format!("session {id} not found")),
    }
}

fn list_events(node: &RaftNode, id: &str, query: Option<&str>) -> Response<Body> {
    let (limit, offset) = match pagination(query) {
        Ok(p) => p,
        Err(resp) => return resp,
    };
    match node
        .state_machine()
        .read()
        .unwrap()
        .list_events(id, limit, offset)
    {
        Some(events) => json_ok(&events),
        None => envelope(ErrorCode::NotFound, &format!("session {id} not found")),
    }
}

fn list_artifacts(node: &RaftNode, id: &str) -> Response<Body> {
    match node.state_machine().read().unwrap().list_artifacts(id) {
        Some(artifacts) => json_ok(&artifacts),
        None => envelope(ErrorCode::NotFound, &format!("step {id} not found")),
    }
}

// ── Response helpers ──────────────────────────────────────────────────────────

fn json_status<T: Serialize>(status: StatusCode, value: &T) -> Response<Body> {
    let body = serde_json::to_string(value).unwrap_or_else(|_| "{}".to_string());
    Response::builder()
        .status(status)
        .header("Content-Type", "application/json")
        .body(Body::from(body))
        .unwrap_or_default()
}

fn json_ok<T: Serialize>(value: &T) -> Response<Body> {
    json_status(StatusCode::OK, value)
}

fn envelope(code: ErrorCode, message: &str) -> Response<Body> {
    json_status(
        StatusCode::from_u16(code.status()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR),
        &json!({ "error": code.as_str(), "message": message }),
    )
}

fn not_leader(node: &RaftNode) -> Response<Body> {
    let (leader, leader_id) = node.leader_hint();
    json_status(
        StatusCode::CONFLICT,
        &json!({
            "error": ErrorCode::NotLeader.as_str(),
            "message": "this node is not the leader; redirect writes to the leader",
            "leader": leader,
            "leader_id": leader_id,
        }),
    )
}

fn node_error_response(node: &RaftNode, err: NodeError) -> Response<Body> {
    match err {
        NodeError::NotLeader { .. } => not_leader(node),
        NodeError::Rejected(rej) => json_status(
            StatusCode::BAD_REQUEST,
            &json!({
                "error": ErrorCode::TxRejected.as_str(),
                "message": rej.message,
                "code": rej.code.as_str(),
            }),
        ),
        NodeError::Timeout => envelope(
            ErrorCode::TxTimeout,
            "transaction did not commit within the apply timeout; \
             retry with the same tx_id",
        ),
        NodeError::Internal(message) => {
            error!(error = %message, "internal error on write path");
            envelope(ErrorCode::Internal, &message)
        }
    }
}

async fn read_json<T: DeserializeOwned>(req: Request<Body>) -> Result<T, Response<Body>> {
    let bytes = hyper::body::to_bytes(req.into_body())
        .await
        .map_err(|e| envelope(ErrorCode::InvalidParam, &format!("failed to read body: {e}")))?;
    serde_json::from_slice(&bytes)
        .map_err(|e| envelope(ErrorCode::InvalidParam, &format!("invalid JSON body: {e}")))
}

// ── Query helpers ─────────────────────────────────────────────────────────────

fn query_param(query: Option<&str>, name: &str) -> Option<String> {
    query?
        .split('&')
        .filter_map(|pair| pair.split_once('='))
        .find(|(k, _)| *k == name)
        .map(|(_, v)| v.to_string())
        .filter(|v| !v.is_empty())
}

fn pagination(query: Option<&str>) -> Result<(usize, usize), Response<Body>> {
    let limit = match query_param(query, "limit") {
        Some(raw) => match raw.parse::<usize>() {
            Ok(v) if v >= 1 && v <= MAX_LIMIT => v,
            _ => {
                return Err(envelope(
                    ErrorCode::InvalidParam,
                    &format!("limit must be an integer in 1..={MAX_LIMIT}"),
                ))
            }
        },
        None => DEFAULT_LIMIT,
    };
    let offset = match query_param(query, "offset") {
        Some(raw) => match raw.parse::<usize>() {
            Ok(v) => v,
            Err(_) => {
                return Err(envelope(
                    ErrorCode::InvalidParam,
                    "offset must be a non-negative integer",
                ))
            }
        },
        None => 0,
    };
    Ok((limit, offset))
}

// ── Join client ───────────────────────────────────────────────────────────────

/// Join an existing cluster through `P2P_JOIN_ENDPOINT`, retrying up to
/// `P2P_JOIN_RETRIES` times. A `NOT_LEADER` answer redirects the next
/// attempt at the reported leader, so pointing at any live peer works.
pub async fn join_via_peer(node: Arc<RaftNode>) {
    let Some(endpoint) = node.config.join_endpoint.clone() else {
        return;
    };
    let client = hyper::Client::new();
    let body = JoinRequest {
        node_id: node.config.node_id.clone(),
        raft_addr: node.config.raft_addr.clone(),
        http_addr: node.config.http_addr.clone(),
    };

    let mut target = endpoint;
    for attempt in 1..=node.config.join_retries {
        match post_join(&client, &target, &body).await {
            Ok(JoinOutcome::Joined) => {
                info!(attempt, endpoint = %target, "joined cluster");
                return;
            }
            Ok(JoinOutcome::Redirect(leader)) => {
                info!(attempt, leader = %leader, "redirected to leader");
                target = leader;
            }
            Err(e) => {
                warn!(attempt, endpoint = %target, error = %e, "join attempt failed");
            }
        }
        tokio::time::sleep(node.config.join_retry_delay).await;
    }
    error!(
        retries = node.config.join_retries,
        "failed to join cluster; giving up"
    );
}

enum JoinOutcome {
    Joined,
    Redirect(String),
}

async fn post_join(
    client: &hyper::Client<hyper::client::HttpConnector>,
    base: &str,
    body: &JoinRequest,
) -> Result<JoinOutcome, String> {
    let uri: hyper::Uri = format!("{}/v1/p2p/raft/join", base.trim_end_matches('/'))
        .parse()
        .map_err(|e| format!("invalid join endpoint: {e}"))?;
    let payload = serde_json::to_string(body).map_err(|e| e.to_string())?;
    let req = Request::post(uri)
        .header("Content-Type", "application/json")
        .body(Body::from(payload))
        .map_err(|e| e.to_string())?;

    let resp = client.request(req).await.map_err(|e| e.to_string())?;
    let status = resp.status();
    let bytes = hyper::body::to_bytes(resp.into_body())
        .await
        .map_err(|e| e.to_string())?;

    if status == StatusCode::OK {
        return Ok(JoinOutcome::Joined);
    }
    if status == StatusCode::CONFLICT {
        let value: Value = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
        if let Some(leader) = value.get("leader").and_then(Value::as_str) {
            if !leader.is_empty() {
                return Ok(JoinOutcome::Redirect(format!("http://{leader}")));
            }
        }
        return Err("peer is not the leader and no leader is known yet".to_string());
    }
    Err(format!(
        "join rejected with status {status}: {}",
        String::from_utf8_lossy(&bytes)
    ))
}

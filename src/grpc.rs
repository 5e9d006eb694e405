//! gRPC raft transport between cluster peers.
//!
//! Implements the `RaftTransport` service from `proto/collabd.proto`. Each
//! RPC deserializes the proto `payload` bytes back into the openraft
//! request type and forwards it to the local raft replica; the response is
//! serialized the same way. Client-side dialing lives in
//! [`crate::raft::GrpcNetwork`].
//!
//! All nodes listen on `P2P_RAFT_ADDR`. Traffic is plaintext — the
//! transport carries only raft replication, and deployments that need
//! encryption front it at the network layer.

use std::net::SocketAddr;
use std::sync::Arc;

use tonic::transport::Server;
use tonic::{Request, Response, Status};
use tracing::{error, info};

use crate::raft::{NodeId, RaftNode, TypeConfig};

/// Generated protobuf types and gRPC service stubs for `RaftTransport`.
pub mod proto {
    tonic::include_proto!("collabd");
}

use proto::raft_transport_server::{RaftTransport, RaftTransportServer};
use proto::{RaftMessage, RaftReply};

/// Server-side implementation of the `RaftTransport` gRPC service.
pub struct RaftTransportService {
    node: Arc<RaftNode>,
}

impl RaftTransportService {
    pub fn new(node: Arc<RaftNode>) -> Self {
        Self { node }
    }
}

fn reply(payload: Vec<u8>) -> Response<RaftReply> {
    Response::new(RaftReply {
        ok: true,
        payload,
        error: String::new(),
    })
}

#[tonic::async_trait]
impl RaftTransport for RaftTransportService {
    async fn append_entries(
        &self,
        req: Request<RaftMessage>,
    ) -> Result<Response<RaftReply>, Status> {
        let payload = req.into_inner().payload;
        let rpc: openraft::raft::AppendEntriesRequest<TypeConfig> =
            serde_json::from_slice(&payload).map_err(|e| {
                Status::invalid_argument(format!("failed to decode AppendEntriesRequest: {e}"))
            })?;

        let resp = self
            .node
            .raft
            .append_entries(rpc)
            .await
            .map_err(|e| Status::internal(format!("raft AppendEntries error: {e}")))?;

        let payload = serde_json::to_vec(&resp)
            .map_err(|e| Status::internal(format!("failed to encode response: {e}")))?;
        Ok(reply(payload))
    }

    async fn vote(&self, req: Request<RaftMessage>) -> Result<Response<RaftReply>, Status> {
        let payload = req.into_inner().payload;
        let rpc: openraft::raft::VoteRequest<NodeId> =
            serde_json::from_slice(&payload).map_err(|e| {
                Status::invalid_argument(format!("failed to decode VoteRequest: {e}"))
            })?;

        let resp = self
            .node
            .raft
            .vote(rpc)
            .await
            .map_err(|e| Status::internal(format!("raft Vote error: {e}")))?;

        let payload = serde_json::to_vec(&resp)
            .map_err(|e| Status::internal(format!("failed to encode response: {e}")))?;
        Ok(reply(payload))
    }

    async fn install_snapshot(
        &self,
        req: Request<RaftMessage>,
    ) -> Result<Response<RaftReply>, Status> {
        let payload = req.into_inner().payload;
        let rpc: openraft::raft::InstallSnapshotRequest<TypeConfig> =
            serde_json::from_slice(&payload).map_err(|e| {
                Status::invalid_argument(format!("failed to decode InstallSnapshotRequest: {e}"))
            })?;

        let resp = self
            .node
            .raft
            .install_snapshot(rpc)
            .await
            .map_err(|e| Status::internal(format!("raft InstallSnapshot error: {e}")))?;

        let payload = serde_json::to_vec(&resp)
            .map_err(|e| Status::internal(format!("failed to encode response: {e}")))?;
        Ok(reply(payload))
    }
}

/// Starts the raft transport bound to `P2P_RAFT_ADDR`. Runs until the
/// process exits; callers spawn it in a background task.
pub async fn start_transport_server(node: Arc<RaftNode>) {
    let bind_addr = node.config.raft_addr.clone();
    let addr: SocketAddr = match bind_addr.parse() {
        Ok(addr) => addr,
        Err(e) => {
            error!(addr = %bind_addr, error = %e, "invalid raft transport address");
            return;
        }
    };

    info!(addr = %addr, "raft transport starting");

    if let Err(e) = Server::builder()
        .add_service(RaftTransportServer::new(RaftTransportService::new(node)))
        .serve(addr)
        .await
    {
        error!(error = %e, "raft transport server error");
    }
}

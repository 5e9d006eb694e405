//! Error taxonomy for the coordination kernel.
//!
//! Three layers, matching how errors travel through the system:
//!
//! - [`RejectCode`] — semantic precondition violations produced inside the
//!   deterministic state machine. Carried in the Apply outcome (never as an
//!   `Err`) so every replica computes the same result for a bad transaction.
//! - [`NodeError`] — failures of the consensus facade: leadership, propose
//!   timeout, pre-consensus rejection, internal raft faults.
//! - [`ErrorCode`] — the HTTP error envelope codes the dispatcher emits.

use std::fmt;

use thiserror::Error;

/// Semantic rejection codes for Apply preconditions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RejectCode {
    /// An identifier in the transaction already exists.
    DuplicateId,
    /// A referenced entity does not exist.
    UnknownEntity,
    /// The target entity is not in a status that permits the operation.
    BadState,
    /// The acting participant is not joined to the relevant session.
    NotParticipant,
    /// The participant lacks a required capability.
    CapabilityMissing,
    /// The step has an active, non-expired claim.
    ClaimHeld,
    /// The caller does not hold the step's active claim.
    NotClaimHolder,
    /// A dependency step is not yet resolved.
    DependencyUnresolved,
    /// The decision deadline has passed.
    DeadlineExceeded,
    /// The participant already voted in this decision.
    AlreadyVoted,
    /// The payload failed structural validation.
    InvalidPayload,
    /// The envelope failed basic validation or signature verification.
    BadSignature,
}

impl RejectCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            RejectCode::DuplicateId => "DUPLICATE_ID",
            RejectCode::UnknownEntity => "UNKNOWN_ENTITY",
            RejectCode::BadState => "BAD_STATE",
            RejectCode::NotParticipant => "NOT_PARTICIPANT",
            RejectCode::CapabilityMissing => "CAPABILITY_MISSING",
            RejectCode::ClaimHeld => "CLAIM_HELD",
            RejectCode::NotClaimHolder => "NOT_CLAIM_HOLDER",
            RejectCode::DependencyUnresolved => "DEPENDENCY_UNRESOLVED",
            RejectCode::DeadlineExceeded => "DEADLINE_EXCEEDED",
            RejectCode::AlreadyVoted => "ALREADY_VOTED",
            RejectCode::InvalidPayload => "INVALID_PAYLOAD",
            RejectCode::BadSignature => "BAD_SIGNATURE",
        }
    }
}

impl fmt::Display for RejectCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A typed Apply rejection: code plus a human-readable message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Rejection {
    pub code: RejectCode,
    pub message: String,
}

impl Rejection {
    pub fn new(code: RejectCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }
}

impl fmt::Display for Rejection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.code, self.message)
    }
}

impl std::error::Error for Rejection {}

/// Errors surfaced by the consensus node facade (`RaftNode::apply_tx` and
/// the membership operations).
#[derive(Debug, Error)]
pub enum NodeError {
    /// This node is not the leader; clients must redirect.
    #[error("not the leader (leader: {leader:?}, leader_id: {leader_id:?})")]
    NotLeader {
        /// HTTP address of the current leader, when known.
        leader: Option<String>,
        /// Human-readable node id of the current leader, when known.
        leader_id: Option<String>,
    },

    /// Raft did not commit within the configured apply timeout. The entry
    /// may still commit later; clients retry with the same tx_id.
    #[error("transaction did not commit within the apply timeout")]
    Timeout,

    /// The transaction failed pre-consensus validation (envelope or
    /// signature) and was never proposed.
    #[error("transaction rejected: {0}")]
    Rejected(Rejection),

    /// Storage or raft-internal failure.
    #[error("node error: {0}")]
    Internal(String),
}

/// Error codes used in the HTTP error envelope `{error, message, ...}`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCode {
    InvalidParam,
    NotFound,
    NotLeader,
    TxRejected,
    TxTimeout,
    JoinFailed,
    RemoveFailed,
    Internal,
}

impl ErrorCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCode::InvalidParam => "INVALID_PARAM",
            ErrorCode::NotFound => "NOT_FOUND",
            ErrorCode::NotLeader => "NOT_LEADER",
            ErrorCode::TxRejected => "TX_REJECTED",
            ErrorCode::TxTimeout => "TX_TIMEOUT",
            ErrorCode::JoinFailed => "JOIN_FAILED",
            ErrorCode::RemoveFailed => "REMOVE_FAILED",
            ErrorCode::Internal => "INTERNAL",
        }
    }

    /// The HTTP status this code is served with.
    pub fn status(&self) -> u16 {
        match self {
            ErrorCode::InvalidParam | ErrorCode::TxRejected => 400,
            ErrorCode::NotFound => 404,
            ErrorCode::NotLeader => 409,
            ErrorCode::TxTimeout
            | ErrorCode::JoinFailed
            | ErrorCode::RemoveFailed
            | ErrorCode::Internal => 500,
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

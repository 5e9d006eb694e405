//! Entity records held by the state machine.
//!
//! Identifiers are opaque client-assigned strings; references between
//! entities are identifier fields only (the state machine's maps are the
//! graph). All timestamps are epoch milliseconds derived from transaction
//! timestamps — never from the local clock.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Lease length applied when a claim does not specify one.
pub const DEFAULT_LEASE_SECONDS: u64 = 300;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SessionStatus {
    Active,
    Completed,
    Failed,
    Cancelled,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StepStatus {
    Open,
    Claimed,
    InReview,
    Resolved,
    Failed,
}

impl StepStatus {
    /// True for statuses that still count toward session completion.
    pub fn is_unresolved(&self) -> bool {
        matches!(
            self,
            StepStatus::Open | StepStatus::Claimed | StepStatus::InReview
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ParticipantType {
    Human,
    Agent,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ClaimStatus {
    Active,
    Expired,
    Released,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DecisionStatus {
    Pending,
    Passed,
    Rejected,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum VoteChoice {
    Approve,
    Reject,
}

/// Vote thresholds for a decision. Evaluated after every cast vote.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DecisionPolicy {
    #[serde(default = "default_threshold")]
    pub min_approvals: u32,
    #[serde(default = "default_threshold")]
    pub max_rejections: u32,
}

fn default_threshold() -> u32 {
    1
}

impl Default for DecisionPolicy {
    fn default() -> Self {
        Self {
            min_approvals: 1,
            max_rejections: 1,
        }
    }
}

/// A collaboration room bound to a workflow/task concept.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Session {
    pub session_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub workflow_id: Option<String>,
    pub name: String,
    #[serde(default)]
    pub context: Value,
    pub status: SessionStatus,
    pub created_at: i64,
    pub updated_at: i64,
}

/// A unit of work within a session. Steps are embedded at session creation
/// and never added afterwards.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Step {
    pub step_id: String,
    pub session_id: String,
    pub step_key: String,
    pub name: String,
    pub status: StepStatus,
    #[serde(default)]
    pub required_capabilities: Vec<String>,
    #[serde(default)]
    pub depends_on: Vec<String>,
    pub lease_ttl_seconds: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub consensus_policy: Option<DecisionPolicy>,
    pub created_at: i64,
    pub updated_at: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resolved_at: Option<i64>,
}

/// A human or agent principal joined to a session. `ref` is unique within
/// the session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Participant {
    pub participant_id: String,
    pub session_id: String,
    #[serde(rename = "type")]
    pub participant_type: ParticipantType,
    #[serde(rename = "ref")]
    pub participant_ref: String,
    #[serde(default)]
    pub capabilities: Vec<String>,
    #[serde(default)]
    pub trust_score: f64,
    pub joined_at: i64,
    pub last_seen_at: i64,
}

/// A lease granting exclusive execution rights on a step.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Claim {
    pub claim_id: String,
    pub step_id: String,
    pub participant_id: String,
    pub status: ClaimStatus,
    pub lease_until: i64,
    pub created_at: i64,
    pub updated_at: i64,
}

/// A versioned output attached to a step. Versions are dense integers
/// 1..N per step, assigned by Apply.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Artifact {
    pub artifact_id: String,
    pub step_id: String,
    pub producer_id: String,
    pub kind: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub external_uri: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content_hash: Option<String>,
    pub version: u32,
    pub created_at: i64,
}

/// A structured review attached to a step. At most one per step.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Decision {
    pub decision_id: String,
    pub step_id: String,
    pub policy: DecisionPolicy,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deadline: Option<i64>,
    pub status: DecisionStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<String>,
    pub created_at: i64,
    pub updated_at: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub decided_at: Option<i64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Vote {
    pub vote_id: String,
    pub decision_id: String,
    pub participant_id: String,
    pub choice: VoteChoice,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub comment: Option<String>,
    pub created_at: i64,
}

/// Append-only record emitted for each successful Apply.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub event_id: u64,
    pub session_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub step_id: Option<String>,
    #[serde(rename = "type")]
    pub event_type: String,
    pub actor: String,
    pub payload: Value,
    pub created_at: i64,
}

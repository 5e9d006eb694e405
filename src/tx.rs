//! Signed transaction protocol.
//!
//! A [`Tx`] is the atomic unit of replicated state change. The bytes that
//! are signed are the JSON encoding of the envelope fields in a fixed
//! order with the `signature` field excluded and the `payload` embedded
//! byte-for-byte as received (`serde_json`'s `RawValue`), so no re-encoding
//! anywhere in the pipeline can invalidate a signature. The timestamp is
//! normalized to UTC RFC3339 with millisecond precision and a `Z` suffix
//! before signing; any other normalization diverges and fails verification.
//!
//! Signatures are Ed25519. The public key is part of the signed bytes,
//! which rules out key-substitution on an otherwise valid envelope.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use chrono::{DateTime, SecondsFormat, Utc};
use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::value::RawValue;
use serde_json::Value;

use crate::errors::{RejectCode, Rejection};
use crate::model::{DecisionPolicy, ParticipantType, VoteChoice};

/// The replicated operations. `CLAIM_EXPIRE` is internal — only the lease
/// sweeper emits it, signed with the leader's node key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Op {
    #[serde(rename = "SESSION_CREATE")]
    SessionCreate,
    #[serde(rename = "PARTICIPANT_JOIN")]
    ParticipantJoin,
    #[serde(rename = "STEP_CLAIM")]
    StepClaim,
    #[serde(rename = "STEP_RELEASE")]
    StepRelease,
    #[serde(rename = "STEP_HANDOFF")]
    StepHandoff,
    #[serde(rename = "ARTIFACT_ADD")]
    ArtifactAdd,
    #[serde(rename = "DECISION_OPEN")]
    DecisionOpen,
    #[serde(rename = "VOTE_CAST")]
    VoteCast,
    #[serde(rename = "STEP_RESOLVE")]
    StepResolve,
    #[serde(rename = "CLAIM_EXPIRE")]
    ClaimExpire,
}

impl Op {
    pub fn as_str(&self) -> &'static str {
        match self {
            Op::SessionCreate => "SESSION_CREATE",
            Op::ParticipantJoin => "PARTICIPANT_JOIN",
            Op::StepClaim => "STEP_CLAIM",
            Op::StepRelease => "STEP_RELEASE",
            Op::StepHandoff => "STEP_HANDOFF",
            Op::ArtifactAdd => "ARTIFACT_ADD",
            Op::DecisionOpen => "DECISION_OPEN",
            Op::VoteCast => "VOTE_CAST",
            Op::StepResolve => "STEP_RESOLVE",
            Op::ClaimExpire => "CLAIM_EXPIRE",
        }
    }
}

/// Signed transaction envelope, exactly as received on the wire.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Tx {
    pub tx_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    pub nonce: String,
    /// RFC3339 timestamp supplied by the client; the deterministic "now"
    /// for every effect of this transaction.
    pub timestamp: String,
    pub actor: String,
    pub op: Op,
    pub payload: Box<RawValue>,
    pub public_key: String,
    #[serde(default)]
    pub signature: String,
}

/// The canonical signing form: envelope fields in this order, signature
/// excluded, payload verbatim. Field order is load-bearing.
#[derive(Serialize)]
struct SigningDoc<'a> {
    tx_id: &'a str,
    session_id: Option<&'a str>,
    nonce: &'a str,
    timestamp: &'a str,
    actor: &'a str,
    op: Op,
    payload: &'a RawValue,
    public_key: &'a str,
}

impl Tx {
    /// Build and sign a transaction from a JSON payload value. Used by the
    /// lease sweeper and by tests; external clients construct the same
    /// canonical form themselves.
    pub fn build_signed(
        op: Op,
        tx_id: impl Into<String>,
        session_id: Option<String>,
        nonce: impl Into<String>,
        timestamp: impl Into<String>,
        actor: impl Into<String>,
        payload: &Value,
        key: &SigningKey,
    ) -> Result<Tx, Rejection> {
        let payload = RawValue::from_string(payload.to_string())
            .map_err(|e| Rejection::new(RejectCode::InvalidPayload, e.to_string()))?;
        let mut tx = Tx {
            tx_id: tx_id.into(),
            session_id,
            nonce: nonce.into(),
            timestamp: timestamp.into(),
            actor: actor.into(),
            op,
            payload,
            public_key: String::new(),
            signature: String::new(),
        };
        tx.sign(key)?;
        Ok(tx)
    }

    /// Sign in place: fills `public_key` and `signature`.
    pub fn sign(&mut self, key: &SigningKey) -> Result<(), Rejection> {
        self.public_key = BASE64.encode(key.verifying_key().as_bytes());
        let bytes = self.signing_bytes()?;
        self.signature = BASE64.encode(key.sign(&bytes).to_bytes());
        Ok(())
    }

    /// The canonical bytes covered by the signature.
    pub fn signing_bytes(&self) -> Result<Vec<u8>, Rejection> {
        let timestamp = canonical_timestamp(&self.timestamp)?;
        let doc = SigningDoc {
            tx_id: self.tx_id.trim(),
            session_id: self.session_id.as_deref().map(str::trim),
            nonce: self.nonce.trim(),
            timestamp: &timestamp,
            actor: self.actor.trim(),
            op: self.op,
            payload: &self.payload,
            public_key: self.public_key.trim(),
        };
        serde_json::to_vec(&doc)
            .map_err(|e| Rejection::new(RejectCode::InvalidPayload, e.to_string()))
    }

    /// Pre-consensus structural checks. Run by the dispatcher before
    /// propose and again inside Apply (log entries may outlive protocol
    /// changes).
    pub fn validate_basic(&self) -> Result<(), Rejection> {
        for (field, value) in [
            ("tx_id", &self.tx_id),
            ("nonce", &self.nonce),
            ("actor", &self.actor),
        ] {
            if value.trim().is_empty() {
                return Err(Rejection::new(
                    RejectCode::InvalidPayload,
                    format!("{field} must not be empty"),
                ));
            }
        }
        let ms = self.timestamp_ms()?;
        if ms <= 0 {
            return Err(Rejection::new(
                RejectCode::InvalidPayload,
                "timestamp must be non-zero",
            ));
        }
        let payload = self.payload.get().trim();
        if payload.is_empty() || payload == "null" {
            return Err(Rejection::new(
                RejectCode::InvalidPayload,
                "payload must not be empty",
            ));
        }
        if self.public_key.trim().is_empty() || self.signature.trim().is_empty() {
            return Err(Rejection::new(
                RejectCode::BadSignature,
                "public_key and signature are required",
            ));
        }
        Ok(())
    }

    /// Verify the Ed25519 signature over the canonical bytes.
    pub fn verify(&self) -> Result<(), Rejection> {
        let key_bytes = BASE64
            .decode(self.public_key.trim())
            .map_err(|e| Rejection::new(RejectCode::BadSignature, format!("public_key: {e}")))?;
        let key_bytes: [u8; 32] = key_bytes.try_into().map_err(|v: Vec<u8>| {
            Rejection::new(
                RejectCode::BadSignature,
                format!("public_key must be 32 bytes, got {}", v.len()),
            )
        })?;
        let key = VerifyingKey::from_bytes(&key_bytes)
            .map_err(|e| Rejection::new(RejectCode::BadSignature, e.to_string()))?;

        let sig_bytes = BASE64
            .decode(self.signature.trim())
            .map_err(|e| Rejection::new(RejectCode::BadSignature, format!("signature: {e}")))?;
        let sig_bytes: [u8; 64] = sig_bytes.try_into().map_err(|v: Vec<u8>| {
            Rejection::new(
                RejectCode::BadSignature,
                format!("signature must be 64 bytes, got {}", v.len()),
            )
        })?;
        let signature = Signature::from_bytes(&sig_bytes);

        let bytes = self.signing_bytes()?;
        key.verify(&bytes, &signature)
            .map_err(|_| Rejection::new(RejectCode::BadSignature, "signature verification failed"))
    }

    /// The transaction timestamp as epoch milliseconds.
    pub fn timestamp_ms(&self) -> Result<i64, Rejection> {
        parse_rfc3339(&self.timestamp).map(|dt| dt.timestamp_millis())
    }

    /// Decode the payload into an op-specific record. Unknown fields are
    /// rejected so clients cannot smuggle unsigned-meaningful data.
    pub fn decode_payload<T: DeserializeOwned>(&self) -> Result<T, Rejection> {
        serde_json::from_str(self.payload.get())
            .map_err(|e| Rejection::new(RejectCode::InvalidPayload, e.to_string()))
    }
}

fn parse_rfc3339(raw: &str) -> Result<DateTime<Utc>, Rejection> {
    DateTime::parse_from_rfc3339(raw.trim())
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| {
            Rejection::new(
                RejectCode::InvalidPayload,
                format!("timestamp is not RFC3339: {e}"),
            )
        })
}

/// Normalize any RFC3339 timestamp to the canonical signing rendering:
/// UTC, millisecond precision, `Z` suffix.
pub fn canonical_timestamp(raw: &str) -> Result<String, Rejection> {
    Ok(parse_rfc3339(raw)?.to_rfc3339_opts(SecondsFormat::Millis, true))
}

/// Parse an RFC3339 timestamp into epoch milliseconds.
pub fn timestamp_to_ms(raw: &str) -> Result<i64, Rejection> {
    parse_rfc3339(raw).map(|dt| dt.timestamp_millis())
}

/// Render a `DateTime` in the canonical wire form.
pub fn format_timestamp(dt: DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Millis, true)
}

// ── Per-op payload records ────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct StepSpec {
    pub step_id: String,
    pub step_key: String,
    pub name: String,
    #[serde(default)]
    pub required_capabilities: Vec<String>,
    #[serde(default)]
    pub depends_on: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lease_ttl_seconds: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub consensus_policy: Option<DecisionPolicy>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SessionCreatePayload {
    pub session_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub workflow_id: Option<String>,
    pub name: String,
    #[serde(default)]
    pub context: Value,
    #[serde(default)]
    pub steps: Vec<StepSpec>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ParticipantJoinPayload {
    pub participant_id: String,
    #[serde(rename = "type")]
    pub participant_type: ParticipantType,
    #[serde(rename = "ref")]
    pub participant_ref: String,
    #[serde(default)]
    pub capabilities: Vec<String>,
    #[serde(default)]
    pub trust_score: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct StepClaimPayload {
    pub claim_id: String,
    pub step_id: String,
    pub participant_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lease_seconds: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct StepReleasePayload {
    pub step_id: String,
    pub participant_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct StepHandoffPayload {
    pub step_id: String,
    pub from_participant: String,
    pub to_participant: String,
    pub new_claim_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lease_seconds: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ArtifactAddPayload {
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
    /// Accepted for wire compatibility; Apply assigns versions itself.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<u32>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DecisionOpenPayload {
    pub decision_id: String,
    pub step_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub policy: Option<DecisionPolicy>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deadline: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct VoteCastPayload {
    pub vote_id: String,
    pub decision_id: String,
    pub participant_id: String,
    pub choice: VoteChoice,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub comment: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct StepResolvePayload {
    pub step_id: String,
    pub participant_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ClaimExpirePayload {
    pub step_id: String,
    pub claim_id: String,
}

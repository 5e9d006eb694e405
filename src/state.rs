//! The deterministic state machine.
//!
//! [`StateMachine::apply`] is invoked by the raft applier on every committed
//! log entry on every replica, in the same order. It is pure — no I/O, no
//! randomness, no wall-clock reads; the transaction's own timestamp is the
//! "now" for all of its effects — and total: bad input produces a typed
//! rejection inside the returned [`TxOutcome`], never a panic and never an
//! `Err` that could diverge between replicas.
//!
//! All tables are `BTreeMap`s so iteration and the serialized snapshot form
//! are canonical. Two replicas that applied the same log prefix serialize
//! to bitwise-identical snapshots.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::{info, warn};

use crate::errors::{RejectCode, Rejection};
use crate::model::{
    Artifact, Claim, ClaimStatus, Decision, DecisionStatus, Event, Participant, Session,
    SessionStatus, Step, StepStatus, Vote, VoteChoice, DEFAULT_LEASE_SECONDS,
};
use crate::tx::{
    timestamp_to_ms, ArtifactAddPayload, ClaimExpirePayload, DecisionOpenPayload, Op,
    ParticipantJoinPayload, SessionCreatePayload, StepClaimPayload, StepHandoffPayload,
    StepReleasePayload, StepResolvePayload, StepSpec, Tx, VoteCastPayload,
};

/// Result of applying one transaction, returned through raft to the
/// proposing leader. Rejections travel inside (`ok = false`) so that every
/// replica computes the same value.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TxOutcome {
    pub tx_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    pub ok: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
    pub message: String,
}

impl TxOutcome {
    fn applied(tx: &Tx, message: impl Into<String>) -> Self {
        Self {
            tx_id: tx.tx_id.trim().to_string(),
            session_id: tx.session_id.clone(),
            ok: true,
            code: None,
            message: message.into(),
        }
    }

    fn rejected(tx: &Tx, rejection: &Rejection) -> Self {
        Self {
            tx_id: tx.tx_id.trim().to_string(),
            session_id: tx.session_id.clone(),
            ok: false,
            code: Some(rejection.code.as_str().to_string()),
            message: rejection.message.clone(),
        }
    }

    /// Outcome for raft-internal entries (blank, membership).
    pub fn internal(message: impl Into<String>) -> Self {
        Self {
            tx_id: String::new(),
            session_id: None,
            ok: true,
            code: None,
            message: message.into(),
        }
    }
}

/// A claim the sweeper should expire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExpiredClaim {
    pub claim_id: String,
    pub step_id: String,
    pub lease_until: i64,
}

/// Entity counts served by `GET /v1/p2p/stats`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StateStats {
    pub sessions: usize,
    pub steps: usize,
    pub participants: usize,
    pub claims: usize,
    pub active_claims: usize,
    pub artifacts: usize,
    pub decisions: usize,
    pub votes: usize,
    pub events: usize,
    pub applied_txs: usize,
}

#[derive(Debug, Default, Serialize, Deserialize)]
pub struct StateMachine {
    pub sessions: BTreeMap<String, Session>,
    pub steps: BTreeMap<String, Step>,
    pub participants: BTreeMap<String, Participant>,
    pub claims: BTreeMap<String, Claim>,
    pub artifacts: BTreeMap<String, Artifact>,
    pub decisions: BTreeMap<String, Decision>,
    pub votes: BTreeMap<String, Vote>,
    pub events: Vec<Event>,
    /// Idempotency ledger: actor → applied tx_ids. Replays succeed as
    /// no-ops (raft legitimately delivers duplicates on client retry
    /// across leader churn).
    applied: BTreeMap<String, BTreeSet<String>>,
    next_event_id: u64,
}

impl StateMachine {
    pub fn new() -> Self {
        Self::default()
    }

    // ── Apply ─────────────────────────────────────────────────────────────

    pub fn apply(&mut self, tx: &Tx) -> TxOutcome {
        // Defensive re-validation: log entries may outlive protocol changes.
        if let Err(rej) = tx.validate_basic().and_then(|_| tx.verify()) {
            warn!(tx_id = %tx.tx_id, code = rej.code.as_str(), "transaction failed envelope validation");
            return TxOutcome::rejected(tx, &rej);
        }

        let actor = tx.actor.trim().to_string();
        let tx_id = tx.tx_id.trim().to_string();
        if self
            .applied
            .get(&actor)
            .map_or(false, |ids| ids.contains(&tx_id))
        {
            return TxOutcome::applied(tx, "duplicate tx_id; already applied");
        }

        // validate_basic guarantees this parses.
        let ts = match tx.timestamp_ms() {
            Ok(ts) => ts,
            Err(rej) => return TxOutcome::rejected(tx, &rej),
        };

        let result = match tx.op {
            Op::SessionCreate => self.session_create(tx, ts),
            Op::ParticipantJoin => self.participant_join(tx, ts),
            Op::StepClaim => self.step_claim(tx, ts),
            Op::StepRelease => self.step_release(tx, ts),
            Op::StepHandoff => self.step_handoff(tx, ts),
            Op::ArtifactAdd => self.artifact_add(tx, ts),
            Op::DecisionOpen => self.decision_open(tx, ts),
            Op::VoteCast => self.vote_cast(tx, ts),
            Op::StepResolve => self.step_resolve(tx, ts),
            Op::ClaimExpire => self.claim_expire(tx, ts),
        };

        match result {
            Ok(message) => {
                self.applied.entry(actor).or_default().insert(tx_id);
                info!(tx_id = %tx.tx_id, op = tx.op.as_str(), "transaction applied");
                TxOutcome::applied(tx, message)
            }
            Err(rej) => {
                info!(tx_id = %tx.tx_id, op = tx.op.as_str(), code = rej.code.as_str(),
                      "transaction rejected");
                TxOutcome::rejected(tx, &rej)
            }
        }
    }

    fn session_create(&mut self, tx: &Tx, ts: i64) -> Result<String, Rejection> {
        let p: SessionCreatePayload = tx.decode_payload()?;
        let session_id = p.session_id.trim().to_string();
        if session_id.is_empty() {
            return Err(Rejection::new(
                RejectCode::InvalidPayload,
                "session_id must not be empty",
            ));
        }
        if self.sessions.contains_key(&session_id) {
            return Err(Rejection::new(
                RejectCode::DuplicateId,
                format!("session {session_id} already exists"),
            ));
        }
        let mut step_ids = BTreeSet::new();
        let mut step_keys = BTreeSet::new();
        for spec in &p.steps {
            let id = spec.step_id.trim();
            if id.is_empty() {
                return Err(Rejection::new(
                    RejectCode::InvalidPayload,
                    "step_id must not be empty",
                ));
            }
            if !step_ids.insert(id) {
                return Err(Rejection::new(
                    RejectCode::DuplicateId,
                    format!("step_id {id} duplicated within the batch"),
                ));
            }
            if !step_keys.insert(spec.step_key.trim()) {
                return Err(Rejection::new(
                    RejectCode::DuplicateId,
                    format!("step_key {} duplicated within the batch", spec.step_key),
                ));
            }
            if self.steps.contains_key(id) {
                return Err(Rejection::new(
                    RejectCode::DuplicateId,
                    format!("step {id} already exists"),
                ));
            }
        }

        let step_count = p.steps.len();
        self.sessions.insert(
            session_id.clone(),
            Session {
                session_id: session_id.clone(),
                workflow_id: p.workflow_id.clone(),
                name: p.name.trim().to_string(),
                context: p.context.clone(),
                status: SessionStatus::Active,
                created_at: ts,
                updated_at: ts,
            },
        );
        for spec in &p.steps {
            self.insert_step(&session_id, spec, ts);
        }
        self.emit(
            &session_id,
            None,
            "SESSION_CREATED",
            &tx.actor,
            json!({ "name": p.name.trim(), "steps": step_count }),
            ts,
        );
        Ok(format!(
            "session {session_id} created with {step_count} steps"
        ))
    }

    fn insert_step(&mut self, session_id: &str, spec: &StepSpec, ts: i64) {
        let step_id = spec.step_id.trim().to_string();
        self.steps.insert(
            step_id.clone(),
            Step {
                step_id,
                session_id: session_id.to_string(),
                step_key: spec.step_key.trim().to_string(),
                name: spec.name.trim().to_string(),
                status: StepStatus::Open,
                required_capabilities: spec.required_capabilities.clone(),
                depends_on: spec.depends_on.clone(),
                lease_ttl_seconds: spec.lease_ttl_seconds.unwrap_or(DEFAULT_LEASE_SECONDS),
                consensus_policy: spec.consensus_policy,
                created_at: ts,
                updated_at: ts,
                resolved_at: None,
            },
        );
    }

    fn participant_join(&mut self, tx: &Tx, ts: i64) -> Result<String, Rejection> {
        let p: ParticipantJoinPayload = tx.decode_payload()?;
        let session_id = tx
            .session_id
            .as_deref()
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .ok_or_else(|| {
                Rejection::new(RejectCode::InvalidPayload, "session_id is required")
            })?
            .to_string();
        let session = self.sessions.get(&session_id).ok_or_else(|| {
            Rejection::new(
                RejectCode::UnknownEntity,
                format!("session {session_id} does not exist"),
            )
        })?;
        if session.status != SessionStatus::Active {
            return Err(Rejection::new(
                RejectCode::BadState,
                format!("session {session_id} is not ACTIVE"),
            ));
        }
        let participant_id = p.participant_id.trim().to_string();
        if participant_id.is_empty() {
            return Err(Rejection::new(
                RejectCode::InvalidPayload,
                "participant_id must not be empty",
            ));
        }
        if self.participants.contains_key(&participant_id) {
            return Err(Rejection::new(
                RejectCode::DuplicateId,
                format!("participant {participant_id} already exists"),
            ));
        }
        let participant_ref = p.participant_ref.trim().to_string();
        if self
            .participants
            .values()
            .any(|x| x.session_id == session_id && x.participant_ref == participant_ref)
        {
            return Err(Rejection::new(
                RejectCode::DuplicateId,
                format!("ref {participant_ref} already joined session {session_id}"),
            ));
        }

        self.participants.insert(
            participant_id.clone(),
            Participant {
                participant_id: participant_id.clone(),
                session_id: session_id.clone(),
                participant_type: p.participant_type,
                participant_ref: participant_ref.clone(),
                capabilities: p.capabilities.clone(),
                trust_score: p.trust_score,
                joined_at: ts,
                last_seen_at: ts,
            },
        );
        self.emit(
            &session_id,
            None,
            "PARTICIPANT_JOINED",
            &tx.actor,
            json!({ "participant_id": participant_id, "ref": participant_ref }),
            ts,
        );
        Ok(format!("participant {participant_id} joined"))
    }

    fn step_claim(&mut self, tx: &Tx, ts: i64) -> Result<String, Rejection> {
        let p: StepClaimPayload = tx.decode_payload()?;
        let step = self.get_step_ref(&p.step_id)?;
        let session_id = step.session_id.clone();
        let lease_ttl = step.lease_ttl_seconds;
        let status = step.status;

        let participant = self.participant_in_session(&p.participant_id, &session_id)?;
        if !is_subset(
            &self.steps[p.step_id.trim()].required_capabilities,
            &participant.capabilities,
        ) {
            return Err(Rejection::new(
                RejectCode::CapabilityMissing,
                format!(
                    "participant {} lacks required capabilities",
                    p.participant_id
                ),
            ));
        }
        if self.claims.contains_key(p.claim_id.trim()) {
            return Err(Rejection::new(
                RejectCode::DuplicateId,
                format!("claim {} already exists", p.claim_id),
            ));
        }
        self.check_dependencies(&p.step_id)?;

        // A CLAIMED step whose lease has lapsed at tx time is reclaimable;
        // the superseded claim flips to EXPIRED in the same apply so the
        // single-active-claim invariant holds.
        let stale = match status {
            StepStatus::Open => None,
            StepStatus::Claimed => match self.active_claim(&p.step_id) {
                Some(c) if c.lease_until > ts => {
                    return Err(Rejection::new(
                        RejectCode::ClaimHeld,
                        format!("step {} has an active claim ({})", p.step_id, c.claim_id),
                    ));
                }
                Some(c) => Some(c.claim_id.clone()),
                None => None,
            },
            other => {
                return Err(Rejection::new(
                    RejectCode::BadState,
                    format!("step {} is not claimable (status {:?})", p.step_id, other),
                ));
            }
        };

        let claim_id = p.claim_id.trim().to_string();
        let lease_seconds = p.lease_seconds.unwrap_or(lease_ttl);
        let lease_until = ts + (lease_seconds as i64) * 1000;

        if let Some(old_id) = stale {
            if let Some(old) = self.claims.get_mut(&old_id) {
                old.status = ClaimStatus::Expired;
                old.updated_at = ts;
            }
            self.emit(
                &session_id,
                Some(&p.step_id),
                "CLAIM_EXPIRED",
                &tx.actor,
                json!({ "claim_id": old_id, "superseded_by": claim_id }),
                ts,
            );
        }
        self.claims.insert(
            claim_id.clone(),
            Claim {
                claim_id: claim_id.clone(),
                step_id: p.step_id.trim().to_string(),
                participant_id: p.participant_id.trim().to_string(),
                status: ClaimStatus::Active,
                lease_until,
                created_at: ts,
                updated_at: ts,
            },
        );
        if let Some(step) = self.steps.get_mut(p.step_id.trim()) {
            step.status = StepStatus::Claimed;
            step.updated_at = ts;
        }
        if let Some(participant) = self.participants.get_mut(p.participant_id.trim()) {
            participant.last_seen_at = ts;
        }
        self.emit(
            &session_id,
            Some(&p.step_id),
            "STEP_CLAIMED",
            &tx.actor,
            json!({
                "claim_id": claim_id,
                "participant_id": p.participant_id.trim(),
                "lease_until": lease_until,
            }),
            ts,
        );
        Ok(format!("step {} claimed ({})", p.step_id, claim_id))
    }

    fn step_release(&mut self, tx: &Tx, ts: i64) -> Result<String, Rejection> {
        let p: StepReleasePayload = tx.decode_payload()?;
        let step = self.get_step_ref(&p.step_id)?;
        let session_id = step.session_id.clone();
        if step.status != StepStatus::Claimed {
            return Err(Rejection::new(
                RejectCode::BadState,
                format!("step {} is not CLAIMED", p.step_id),
            ));
        }
        let claim = self.active_claim(&p.step_id).ok_or_else(|| {
            Rejection::new(
                RejectCode::BadState,
                format!("step {} has no active claim", p.step_id),
            )
        })?;
        if claim.participant_id != p.participant_id.trim() {
            return Err(Rejection::new(
                RejectCode::NotClaimHolder,
                format!(
                    "participant {} does not hold the active claim",
                    p.participant_id
                ),
            ));
        }
        let claim_id = claim.claim_id.clone();

        if let Some(claim) = self.claims.get_mut(&claim_id) {
            claim.status = ClaimStatus::Released;
            claim.updated_at = ts;
        }
        if let Some(step) = self.steps.get_mut(p.step_id.trim()) {
            step.status = StepStatus::Open;
            step.updated_at = ts;
        }
        self.emit(
            &session_id,
            Some(&p.step_id),
            "STEP_RELEASED",
            &tx.actor,
            json!({ "claim_id": claim_id, "participant_id": p.participant_id.trim() }),
            ts,
        );
        Ok(format!("step {} released", p.step_id))
    }

    fn step_handoff(&mut self, tx: &Tx, ts: i64) -> Result<String, Rejection> {
        let p: StepHandoffPayload = tx.decode_payload()?;
        let step = self.get_step_ref(&p.step_id)?;
        let session_id = step.session_id.clone();
        let lease_ttl = step.lease_ttl_seconds;
        if step.status != StepStatus::Claimed {
            return Err(Rejection::new(
                RejectCode::BadState,
                format!("step {} is not CLAIMED", p.step_id),
            ));
        }
        let claim = self.active_claim(&p.step_id).ok_or_else(|| {
            Rejection::new(
                RejectCode::BadState,
                format!("step {} has no active claim", p.step_id),
            )
        })?;
        if claim.participant_id != p.from_participant.trim() {
            return Err(Rejection::new(
                RejectCode::NotClaimHolder,
                format!(
                    "participant {} does not hold the active claim",
                    p.from_participant
                ),
            ));
        }
        let old_claim_id = claim.claim_id.clone();

        let to = self.participant_in_session(&p.to_participant, &session_id)?;
        if !is_subset(&self.steps[p.step_id.trim()].required_capabilities, &to.capabilities) {
            return Err(Rejection::new(
                RejectCode::CapabilityMissing,
                format!(
                    "participant {} lacks required capabilities",
                    p.to_participant
                ),
            ));
        }
        if self.claims.contains_key(p.new_claim_id.trim()) {
            return Err(Rejection::new(
                RejectCode::DuplicateId,
                format!("claim {} already exists", p.new_claim_id),
            ));
        }

        let new_claim_id = p.new_claim_id.trim().to_string();
        let lease_seconds = p.lease_seconds.unwrap_or(lease_ttl);
        let lease_until = ts + (lease_seconds as i64) * 1000;

        if let Some(old) = self.claims.get_mut(&old_claim_id) {
            old.status = ClaimStatus::Released;
            old.updated_at = ts;
        }
        self.claims.insert(
            new_claim_id.clone(),
            Claim {
                claim_id: new_claim_id.clone(),
                step_id: p.step_id.trim().to_string(),
                participant_id: p.to_participant.trim().to_string(),
                status: ClaimStatus::Active,
                lease_until,
                created_at: ts,
                updated_at: ts,
            },
        );
        if let Some(step) = self.steps.get_mut(p.step_id.trim()) {
            step.updated_at = ts;
        }
        self.emit(
            &session_id,
            Some(&p.step_id),
            "STEP_HANDOFF",
            &tx.actor,
            json!({
                "from_participant": p.from_participant.trim(),
                "to_participant": p.to_participant.trim(),
                "new_claim_id": new_claim_id,
            }),
            ts,
        );
        Ok(format!(
            "step {} handed off to {}",
            p.step_id, p.to_participant
        ))
    }

    fn artifact_add(&mut self, tx: &Tx, ts: i64) -> Result<String, Rejection> {
        let p: ArtifactAddPayload = tx.decode_payload()?;
        let step = self.get_step_ref(&p.step_id)?;
        let session_id = step.session_id.clone();
        if matches!(step.status, StepStatus::Resolved | StepStatus::Failed) {
            return Err(Rejection::new(
                RejectCode::BadState,
                format!("step {} is terminal ({:?})", p.step_id, step.status),
            ));
        }
        if p.content.is_none() && p.external_uri.is_none() {
            return Err(Rejection::new(
                RejectCode::InvalidPayload,
                "either content or external_uri is required",
            ));
        }
        let artifact_id = p.artifact_id.trim().to_string();
        if self.artifacts.contains_key(&artifact_id) {
            return Err(Rejection::new(
                RejectCode::DuplicateId,
                format!("artifact {artifact_id} already exists"),
            ));
        }
        // Client-supplied version is ignored; apply assigns dense versions.
        let version = self.latest_artifact_version(&p.step_id) + 1;

        self.artifacts.insert(
            artifact_id.clone(),
            Artifact {
                artifact_id: artifact_id.clone(),
                step_id: p.step_id.trim().to_string(),
                producer_id: p.producer_id.trim().to_string(),
                kind: p.kind.trim().to_string(),
                content: p.content.clone(),
                external_uri: p.external_uri.clone(),
                content_hash: p.content_hash.clone(),
                version,
                created_at: ts,
            },
        );
        if let Some(step) = self.steps.get_mut(p.step_id.trim()) {
            if step.status == StepStatus::Claimed {
                step.status = StepStatus::InReview;
            }
            step.updated_at = ts;
        }
        self.emit(
            &session_id,
            Some(&p.step_id),
            "ARTIFACT_SUBMITTED",
            &tx.actor,
            json!({
                "artifact_id": artifact_id,
                "producer_id": p.producer_id.trim(),
                "version": version,
            }),
            ts,
        );
        Ok(format!("artifact {artifact_id} submitted as version {version}"))
    }

    fn decision_open(&mut self, tx: &Tx, ts: i64) -> Result<String, Rejection> {
        let p: DecisionOpenPayload = tx.decode_payload()?;
        let step = self.get_step_ref(&p.step_id)?;
        let session_id = step.session_id.clone();
        let step_policy = step.consensus_policy;
        if step.status != StepStatus::InReview {
            return Err(Rejection::new(
                RejectCode::BadState,
                format!("step {} is not IN_REVIEW", p.step_id),
            ));
        }
        if let Some(existing) = self.decision_for_step(&p.step_id) {
            return Err(Rejection::new(
                RejectCode::DuplicateId,
                format!(
                    "step {} already has decision {}",
                    p.step_id, existing.decision_id
                ),
            ));
        }
        let decision_id = p.decision_id.trim().to_string();
        if self.decisions.contains_key(&decision_id) {
            return Err(Rejection::new(
                RejectCode::DuplicateId,
                format!("decision {decision_id} already exists"),
            ));
        }
        let deadline = match &p.deadline {
            Some(raw) => Some(timestamp_to_ms(raw)?),
            None => None,
        };
        let policy = p.policy.or(step_policy).unwrap_or_default();

        self.decisions.insert(
            decision_id.clone(),
            Decision {
                decision_id: decision_id.clone(),
                step_id: p.step_id.trim().to_string(),
                policy,
                deadline,
                status: DecisionStatus::Pending,
                result: None,
                created_at: ts,
                updated_at: ts,
                decided_at: None,
            },
        );
        self.emit(
            &session_id,
            Some(&p.step_id),
            "DECISION_OPENED",
            &tx.actor,
            json!({
                "decision_id": decision_id,
                "min_approvals": policy.min_approvals,
                "max_rejections": policy.max_rejections,
            }),
            ts,
        );
        Ok(format!("decision {decision_id} opened"))
    }

    fn vote_cast(&mut self, tx: &Tx, ts: i64) -> Result<String, Rejection> {
        let p: VoteCastPayload = tx.decode_payload()?;
        let decision = self.decisions.get(p.decision_id.trim()).ok_or_else(|| {
            Rejection::new(
                RejectCode::UnknownEntity,
                format!("decision {} does not exist", p.decision_id),
            )
        })?;
        if decision.status != DecisionStatus::Pending {
            return Err(Rejection::new(
                RejectCode::BadState,
                format!("decision {} is not PENDING", p.decision_id),
            ));
        }
        if let Some(deadline) = decision.deadline {
            if ts > deadline {
                return Err(Rejection::new(
                    RejectCode::DeadlineExceeded,
                    format!("decision {} deadline has passed", p.decision_id),
                ));
            }
        }
        let decision_id = decision.decision_id.clone();
        let step_id = decision.step_id.clone();
        let policy = decision.policy;
        let session_id = self
            .steps
            .get(&step_id)
            .map(|s| s.session_id.clone())
            .ok_or_else(|| {
                Rejection::new(
                    RejectCode::UnknownEntity,
                    format!("step {step_id} does not exist"),
                )
            })?;
        self.participant_in_session(&p.participant_id, &session_id)?;
        if self.votes.values().any(|v| {
            v.decision_id == decision_id && v.participant_id == p.participant_id.trim()
        }) {
            return Err(Rejection::new(
                RejectCode::AlreadyVoted,
                format!(
                    "participant {} already voted in decision {decision_id}",
                    p.participant_id
                ),
            ));
        }
        let vote_id = p.vote_id.trim().to_string();
        if self.votes.contains_key(&vote_id) {
            return Err(Rejection::new(
                RejectCode::DuplicateId,
                format!("vote {vote_id} already exists"),
            ));
        }

        self.votes.insert(
            vote_id.clone(),
            Vote {
                vote_id: vote_id.clone(),
                decision_id: decision_id.clone(),
                participant_id: p.participant_id.trim().to_string(),
                choice: p.choice,
                comment: p.comment.clone(),
                created_at: ts,
            },
        );
        self.emit(
            &session_id,
            Some(&step_id),
            "VOTE_CAST",
            &tx.actor,
            json!({
                "vote_id": vote_id,
                "decision_id": decision_id,
                "participant_id": p.participant_id.trim(),
                "choice": p.choice,
            }),
            ts,
        );

        let (approvals, rejections) = self.tally(&decision_id);
        if approvals >= policy.min_approvals {
            self.close_decision(&decision_id, DecisionStatus::Passed, approvals, rejections, ts);
            self.finish_step(&step_id, StepStatus::Resolved, &tx.actor, ts);
            self.maybe_complete_session(&session_id, &tx.actor, ts);
            Ok(format!("decision {decision_id} PASSED; step {step_id} resolved"))
        } else if rejections >= policy.max_rejections {
            self.close_decision(&decision_id, DecisionStatus::Rejected, approvals, rejections, ts);
            self.finish_step(&step_id, StepStatus::Failed, &tx.actor, ts);
            self.maybe_complete_session(&session_id, &tx.actor, ts);
            Ok(format!("decision {decision_id} REJECTED; step {step_id} failed"))
        } else {
            Ok(format!("vote {vote_id} recorded"))
        }
    }

    fn step_resolve(&mut self, tx: &Tx, ts: i64) -> Result<String, Rejection> {
        let p: StepResolvePayload = tx.decode_payload()?;
        let step = self.get_step_ref(&p.step_id)?;
        let session_id = step.session_id.clone();
        if !matches!(step.status, StepStatus::Claimed | StepStatus::InReview) {
            return Err(Rejection::new(
                RejectCode::BadState,
                format!("step {} is not CLAIMED or IN_REVIEW", p.step_id),
            ));
        }
        if self.latest_artifact_version(&p.step_id) == 0 {
            return Err(Rejection::new(
                RejectCode::BadState,
                format!("step {} has no artifacts", p.step_id),
            ));
        }
        if let Some(claim) = self.active_claim(&p.step_id) {
            if claim.participant_id != p.participant_id.trim() {
                return Err(Rejection::new(
                    RejectCode::NotClaimHolder,
                    format!(
                        "participant {} does not hold the active claim",
                        p.participant_id
                    ),
                ));
            }
        }

        self.finish_step(&p.step_id, StepStatus::Resolved, &tx.actor, ts);
        self.maybe_complete_session(&session_id, &tx.actor, ts);
        Ok(format!("step {} resolved", p.step_id))
    }

    fn claim_expire(&mut self, tx: &Tx, ts: i64) -> Result<String, Rejection> {
        let p: ClaimExpirePayload = tx.decode_payload()?;
        let claim = self.claims.get(p.claim_id.trim()).ok_or_else(|| {
            Rejection::new(
                RejectCode::UnknownEntity,
                format!("claim {} does not exist", p.claim_id),
            )
        })?;
        if claim.step_id != p.step_id.trim() {
            return Err(Rejection::new(
                RejectCode::InvalidPayload,
                format!("claim {} does not belong to step {}", p.claim_id, p.step_id),
            ));
        }
        if claim.status != ClaimStatus::Active {
            return Err(Rejection::new(
                RejectCode::BadState,
                format!("claim {} is not ACTIVE", p.claim_id),
            ));
        }
        if ts < claim.lease_until {
            return Err(Rejection::new(
                RejectCode::BadState,
                format!("claim {} lease has not expired", p.claim_id),
            ));
        }
        let claim_id = claim.claim_id.clone();
        let session_id = self
            .steps
            .get(p.step_id.trim())
            .map(|s| s.session_id.clone())
            .unwrap_or_default();

        if let Some(claim) = self.claims.get_mut(&claim_id) {
            claim.status = ClaimStatus::Expired;
            claim.updated_at = ts;
        }
        if let Some(step) = self.steps.get_mut(p.step_id.trim()) {
            if step.status == StepStatus::Claimed {
                step.status = StepStatus::Open;
            }
            step.updated_at = ts;
        }
        self.emit(
            &session_id,
            Some(&p.step_id),
            "CLAIM_EXPIRED",
            &tx.actor,
            json!({ "claim_id": claim_id }),
            ts,
        );
        Ok(format!("claim {claim_id} expired"))
    }

    // ── Shared transition helpers ─────────────────────────────────────────

    /// Terminally transition a step and release its active claim.
    fn finish_step(&mut self, step_id: &str, status: StepStatus, actor: &str, ts: i64) {
        let step_id = step_id.trim().to_string();
        let session_id = match self.steps.get(&step_id) {
            Some(s) => s.session_id.clone(),
            None => return,
        };
        if let Some(claim) = self.active_claim(&step_id).map(|c| c.claim_id.clone()) {
            if let Some(claim) = self.claims.get_mut(&claim) {
                claim.status = ClaimStatus::Released;
                claim.updated_at = ts;
            }
        }
        if let Some(step) = self.steps.get_mut(&step_id) {
            step.status = status;
            step.updated_at = ts;
            if status == StepStatus::Resolved {
                step.resolved_at = Some(ts);
            }
        }
        let event_type = if status == StepStatus::Resolved {
            "STEP_RESOLVED"
        } else {
            "STEP_FAILED"
        };
        self.emit(&session_id, Some(&step_id), event_type, actor, json!({}), ts);
    }

    fn close_decision(
        &mut self,
        decision_id: &str,
        status: DecisionStatus,
        approvals: u32,
        rejections: u32,
        ts: i64,
    ) {
        if let Some(decision) = self.decisions.get_mut(decision_id) {
            decision.status = status;
            decision.result = Some(format!(
                "approvals={approvals} rejections={rejections}"
            ));
            decision.decided_at = Some(ts);
            decision.updated_at = ts;
        }
    }

    /// After a terminal step transition: complete the session once no step
    /// remains unresolved.
    fn maybe_complete_session(&mut self, session_id: &str, actor: &str, ts: i64) {
        let active = match self.sessions.get(session_id) {
            Some(s) if s.status == SessionStatus::Active => true,
            _ => false,
        };
        if !active {
            return;
        }
        let unresolved = self
            .steps
            .values()
            .any(|s| s.session_id == session_id && s.status.is_unresolved());
        if unresolved {
            return;
        }
        if let Some(session) = self.sessions.get_mut(session_id) {
            session.status = SessionStatus::Completed;
            session.updated_at = ts;
        }
        self.emit(session_id, None, "SESSION_COMPLETED", actor, json!({}), ts);
    }

    fn emit(
        &mut self,
        session_id: &str,
        step_id: Option<&str>,
        event_type: &str,
        actor: &str,
        payload: Value,
        ts: i64,
    ) {
        self.next_event_id += 1;
        self.events.push(Event {
            event_id: self.next_event_id,
            session_id: session_id.to_string(),
            step_id: step_id.map(|s| s.trim().to_string()),
            event_type: event_type.to_string(),
            actor: actor.trim().to_string(),
            payload,
            created_at: ts,
        });
    }

    // ── Lookup helpers ────────────────────────────────────────────────────

    fn get_step_ref(&self, step_id: &str) -> Result<&Step, Rejection> {
        self.steps.get(step_id.trim()).ok_or_else(|| {
            Rejection::new(
                RejectCode::UnknownEntity,
                format!("step {step_id} does not exist"),
            )
        })
    }

    fn participant_in_session(
        &self,
        participant_id: &str,
        session_id: &str,
    ) -> Result<&Participant, Rejection> {
        let participant = self.participants.get(participant_id.trim()).ok_or_else(|| {
            Rejection::new(
                RejectCode::NotParticipant,
                format!("participant {participant_id} does not exist"),
            )
        })?;
        if participant.session_id != session_id {
            return Err(Rejection::new(
                RejectCode::NotParticipant,
                format!("participant {participant_id} is not joined to session {session_id}"),
            ));
        }
        Ok(participant)
    }

    fn active_claim(&self, step_id: &str) -> Option<&Claim> {
        self.claims
            .values()
            .find(|c| c.step_id == step_id.trim() && c.status == ClaimStatus::Active)
    }

    fn check_dependencies(&self, step_id: &str) -> Result<(), Rejection> {
        let step = &self.steps[step_id.trim()];
        for dep in &step.depends_on {
            let resolved = self
                .steps
                .get(dep.trim())
                .map_or(false, |d| d.status == StepStatus::Resolved);
            if !resolved {
                return Err(Rejection::new(
                    RejectCode::DependencyUnresolved,
                    format!("dependency {dep} of step {step_id} is not resolved"),
                ));
            }
        }
        Ok(())
    }

    fn deps_resolved(&self, step: &Step) -> bool {
        step.depends_on.iter().all(|dep| {
            self.steps
                .get(dep.trim())
                .map_or(false, |d| d.status == StepStatus::Resolved)
        })
    }

    fn latest_artifact_version(&self, step_id: &str) -> u32 {
        self.artifacts
            .values()
            .filter(|a| a.step_id == step_id.trim())
            .map(|a| a.version)
            .max()
            .unwrap_or(0)
    }

    fn decision_for_step(&self, step_id: &str) -> Option<&Decision> {
        self.decisions
            .values()
            .find(|d| d.step_id == step_id.trim())
    }

    fn tally(&self, decision_id: &str) -> (u32, u32) {
        let mut approvals = 0;
        let mut rejections = 0;
        for vote in self.votes.values().filter(|v| v.decision_id == decision_id) {
            match vote.choice {
                VoteChoice::Approve => approvals += 1,
                VoteChoice::Reject => rejections += 1,
            }
        }
        (approvals, rejections)
    }

    // ── Read queries ──────────────────────────────────────────────────────

    pub fn get_session(&self, session_id: &str) -> Option<Session> {
        self.sessions.get(session_id).cloned()
    }

    pub fn get_step(&self, step_id: &str) -> Option<Step> {
        self.steps.get(step_id).cloned()
    }

    /// `None` when the session does not exist.
    pub fn list_participants(
        &self,
        session_id: &str,
        limit: usize,
        offset: usize,
    ) -> Option<Vec<Participant>> {
        self.sessions.get(session_id)?;
        let all: Vec<_> = self
            .participants
            .values()
            .filter(|p| p.session_id == session_id)
            .cloned()
            .collect();
        Some(paginate(all, limit, offset))
    }

    /// Steps of a session that are claimable at `now_ms`: OPEN, or CLAIMED
    /// with a lapsed lease, with all dependencies resolved. With a
    /// participant filter, only steps whose required capabilities that
    /// participant satisfies.
    pub fn list_open_steps(
        &self,
        session_id: &str,
        participant_id: Option<&str>,
        now_ms: i64,
        limit: usize,
        offset: usize,
    ) -> Option<Vec<Step>> {
        self.sessions.get(session_id)?;
        let filter = match participant_id {
            Some(pid) => match self
                .participants
                .get(pid)
                .filter(|p| p.session_id == session_id)
            {
                Some(p) => Some(p),
                // Unknown participant matches nothing.
                None => return Some(Vec::new()),
            },
            None => None,
        };
        let mut open = Vec::new();
        for step in self.steps.values().filter(|s| s.session_id == session_id) {
            let claimable = match step.status {
                StepStatus::Open => true,
                StepStatus::Claimed => self
                    .active_claim(&step.step_id)
                    .map_or(true, |c| c.lease_until <= now_ms),
                _ => false,
            };
            if !claimable || !self.deps_resolved(step) {
                continue;
            }
            if let Some(p) = filter {
                if !is_subset(&step.required_capabilities, &p.capabilities) {
                    continue;
                }
            }
            open.push(step.clone());
        }
        Some(paginate(open, limit, offset))
    }

    pub fn list_events(
        &self,
        session_id: &str,
        limit: usize,
        offset: usize,
    ) -> Option<Vec<Event>> {
        self.sessions.get(session_id)?;
        let all: Vec<_> = self
            .events
            .iter()
            .filter(|e| e.session_id == session_id)
            .cloned()
            .collect();
        Some(paginate(all, limit, offset))
    }

    /// All versions of a step's artifacts, ascending. `None` when the step
    /// does not exist.
    pub fn list_artifacts(&self, step_id: &str) -> Option<Vec<Artifact>> {
        self.steps.get(step_id)?;
        let mut artifacts: Vec<_> = self
            .artifacts
            .values()
            .filter(|a| a.step_id == step_id)
            .cloned()
            .collect();
        artifacts.sort_by_key(|a| a.version);
        Some(artifacts)
    }

    pub fn stats(&self, now_ms: i64) -> StateStats {
        StateStats {
            sessions: self.sessions.len(),
            steps: self.steps.len(),
            participants: self.participants.len(),
            claims: self.claims.len(),
            active_claims: self
                .claims
                .values()
                .filter(|c| c.status == ClaimStatus::Active && c.lease_until > now_ms)
                .count(),
            artifacts: self.artifacts.len(),
            decisions: self.decisions.len(),
            votes: self.votes.len(),
            events: self.events.len(),
            applied_txs: self.applied.values().map(|ids| ids.len()).sum(),
        }
    }

    /// Claims the sweeper should expire at `now_ms`.
    pub fn expired_claims(&self, now_ms: i64) -> Vec<ExpiredClaim> {
        self.claims
            .values()
            .filter(|c| c.status == ClaimStatus::Active && c.lease_until < now_ms)
            .map(|c| ExpiredClaim {
                claim_id: c.claim_id.clone(),
                step_id: c.step_id.clone(),
                lease_until: c.lease_until,
            })
            .collect()
    }

    // ── Snapshots ─────────────────────────────────────────────────────────

    /// Canonical snapshot bytes: identical across replicas that applied the
    /// same log prefix.
    pub fn snapshot_bytes(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }

    pub fn from_snapshot(bytes: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(bytes)
    }
}

fn paginate<T>(items: Vec<T>, limit: usize, offset: usize) -> Vec<T> {
    items.into_iter().skip(offset).take(limit).collect()
}

/// Order-free set inclusion over capability lists.
fn is_subset(required: &[String], have: &[String]) -> bool {
    let have: BTreeSet<&str> = have.iter().map(|s| s.trim()).collect();
    required.iter().all(|r| have.contains(r.trim()))
}

//! State-machine integration tests: full lifecycle flows and the
//! invariants every replica must uphold (single active claim, dense
//! artifact versions, decision/step coupling, idempotency, replica
//! agreement).

use chrono::{Duration, TimeZone, Utc};
use ed25519_dalek::SigningKey;
use rand::rngs::OsRng;
use serde_json::{json, Value};

use collabd::model::{ClaimStatus, DecisionStatus, SessionStatus, StepStatus};
use collabd::state::StateMachine;
use collabd::tx::{format_timestamp, Op, Tx};

/// A signing principal that numbers its own tx ids and nonces.
struct Actor {
    key: SigningKey,
    name: String,
    seq: u32,
}

impl Actor {
    fn new(name: &str) -> Self {
        Self {
            key: SigningKey::generate(&mut OsRng),
            name: name.to_string(),
            seq: 0,
        }
    }

    fn tx(&mut self, op: Op, session: Option<&str>, at_secs: i64, payload: Value) -> Tx {
        self.seq += 1;
        Tx::build_signed(
            op,
            format!("{}-tx-{}", self.name, self.seq),
            session.map(String::from),
            format!("{}-n-{}", self.name, self.seq),
            ts(at_secs),
            self.name.clone(),
            &payload,
            &self.key,
        )
        .unwrap()
    }
}

/// Deterministic test clock: T0 plus an offset in seconds.
fn ts(at_secs: i64) -> String {
    let base = Utc.with_ymd_and_hms(2026, 3, 1, 10, 0, 0).unwrap();
    format_timestamp(base + Duration::seconds(at_secs))
}

fn ts_ms(at_secs: i64) -> i64 {
    let base = Utc.with_ymd_and_hms(2026, 3, 1, 10, 0, 0).unwrap();
    (base + Duration::seconds(at_secs)).timestamp_millis()
}

/// Session `s1` with one step `k1` (capability `draft`), participants `p1`
/// and `p2` both carrying `draft`.
fn draft_session(sm: &mut StateMachine, alice: &mut Actor) {
    let create = alice.tx(
        Op::SessionCreate,
        Some("s1"),
        0,
        json!({
            "session_id": "s1", "name": "demo",
            "steps": [{
                "step_id": "k1", "step_key": "draft", "name": "Draft",
                "required_capabilities": ["draft"]
            }]
        }),
    );
    assert!(sm.apply(&create).ok);

    for pid in ["p1", "p2"] {
        let join = alice.tx(
            Op::ParticipantJoin,
            Some("s1"),
            0,
            json!({
                "participant_id": pid, "type": "AGENT", "ref": format!("agent:{pid}"),
                "capabilities": ["draft", "review"]
            }),
        );
        assert!(sm.apply(&join).ok, "join {pid} failed");
    }
}

fn claim(alice: &mut Actor, claim_id: &str, participant: &str, at: i64, lease: Option<u64>) -> Tx {
    let mut payload = json!({
        "claim_id": claim_id, "step_id": "k1", "participant_id": participant
    });
    if let Some(lease) = lease {
        payload["lease_seconds"] = json!(lease);
    }
    alice.tx(Op::StepClaim, Some("s1"), at, payload)
}

fn active_claims(sm: &StateMachine, step_id: &str) -> usize {
    sm.claims
        .values()
        .filter(|c| c.step_id == step_id && c.status == ClaimStatus::Active)
        .count()
}

// ── Claims ────────────────────────────────────────────────────────────────────

#[test]
fn second_claim_on_held_step_is_rejected() {
    let mut sm = StateMachine::new();
    let mut alice = Actor::new("user:alice");
    draft_session(&mut sm, &mut alice);

    assert!(sm.apply(&claim(&mut alice, "c1", "p1", 1, None)).ok);
    let out = sm.apply(&claim(&mut alice, "c2", "p2", 2, None));
    assert!(!out.ok);
    assert_eq!(out.code.as_deref(), Some("CLAIM_HELD"));
    assert!(out.message.contains("active claim"));
    assert_eq!(active_claims(&sm, "k1"), 1);
}

#[test]
fn claim_requires_capabilities_as_a_set() {
    let mut sm = StateMachine::new();
    let mut alice = Actor::new("user:alice");
    draft_session(&mut sm, &mut alice);

    // p3 joins without the draft capability.
    let join = alice.tx(
        Op::ParticipantJoin,
        Some("s1"),
        0,
        json!({
            "participant_id": "p3", "type": "HUMAN", "ref": "user:carol",
            "capabilities": ["review"]
        }),
    );
    assert!(sm.apply(&join).ok);

    let out = sm.apply(&claim(&mut alice, "c1", "p3", 1, None));
    assert!(!out.ok);
    assert_eq!(out.code.as_deref(), Some("CAPABILITY_MISSING"));
}

#[test]
fn claim_requires_joined_participant() {
    let mut sm = StateMachine::new();
    let mut alice = Actor::new("user:alice");
    draft_session(&mut sm, &mut alice);

    let out = sm.apply(&claim(&mut alice, "c1", "ghost", 1, None));
    assert!(!out.ok);
    assert_eq!(out.code.as_deref(), Some("NOT_PARTICIPANT"));
}

#[test]
fn lapsed_lease_is_reclaimable_and_old_claim_expires() {
    let mut sm = StateMachine::new();
    let mut alice = Actor::new("user:alice");
    draft_session(&mut sm, &mut alice);

    // Claim at T+1 with a 2-second lease; reclaim at T+4.
    assert!(sm.apply(&claim(&mut alice, "c1", "p1", 1, Some(2))).ok);
    let out = sm.apply(&claim(&mut alice, "c2", "p2", 4, None));
    assert!(out.ok, "{}", out.message);

    assert_eq!(sm.claims["c1"].status, ClaimStatus::Expired);
    assert_eq!(sm.claims["c2"].status, ClaimStatus::Active);
    assert_eq!(active_claims(&sm, "k1"), 1);
    assert_eq!(sm.steps["k1"].status, StepStatus::Claimed);
}

#[test]
fn claim_expire_op_reopens_the_step() {
    let mut sm = StateMachine::new();
    let mut alice = Actor::new("user:alice");
    let mut sweeper = Actor::new("system:lease-sweeper");
    draft_session(&mut sm, &mut alice);

    assert!(sm.apply(&claim(&mut alice, "c1", "p1", 1, Some(2))).ok);

    // Too early at T+2 (lease runs to T+3).
    let early = sweeper.tx(
        Op::ClaimExpire,
        None,
        2,
        json!({"step_id": "k1", "claim_id": "c1"}),
    );
    let out = sm.apply(&early);
    assert!(!out.ok);
    assert_eq!(out.code.as_deref(), Some("BAD_STATE"));

    // Due at T+4.
    let due = sweeper.tx(
        Op::ClaimExpire,
        None,
        4,
        json!({"step_id": "k1", "claim_id": "c1"}),
    );
    assert!(sm.apply(&due).ok);
    assert_eq!(sm.claims["c1"].status, ClaimStatus::Expired);
    assert_eq!(sm.steps["k1"].status, StepStatus::Open);

    // A different participant can now claim.
    assert!(sm.apply(&claim(&mut alice, "c2", "p2", 5, None)).ok);
}

#[test]
fn release_requires_the_claim_holder() {
    let mut sm = StateMachine::new();
    let mut alice = Actor::new("user:alice");
    draft_session(&mut sm, &mut alice);
    assert!(sm.apply(&claim(&mut alice, "c1", "p1", 1, None)).ok);

    let wrong = alice.tx(
        Op::StepRelease,
        Some("s1"),
        2,
        json!({"step_id": "k1", "participant_id": "p2"}),
    );
    let out = sm.apply(&wrong);
    assert!(!out.ok);
    assert_eq!(out.code.as_deref(), Some("NOT_CLAIM_HOLDER"));

    let right = alice.tx(
        Op::StepRelease,
        Some("s1"),
        3,
        json!({"step_id": "k1", "participant_id": "p1"}),
    );
    assert!(sm.apply(&right).ok);
    assert_eq!(sm.steps["k1"].status, StepStatus::Open);
    assert_eq!(sm.claims["c1"].status, ClaimStatus::Released);
}

#[test]
fn handoff_moves_the_claim_atomically() {
    let mut sm = StateMachine::new();
    let mut alice = Actor::new("user:alice");
    draft_session(&mut sm, &mut alice);
    assert!(sm.apply(&claim(&mut alice, "c1", "p1", 1, None)).ok);

    let handoff = alice.tx(
        Op::StepHandoff,
        Some("s1"),
        2,
        json!({
            "step_id": "k1", "from_participant": "p1", "to_participant": "p2",
            "new_claim_id": "c2"
        }),
    );
    assert!(sm.apply(&handoff).ok);
    assert_eq!(sm.claims["c1"].status, ClaimStatus::Released);
    assert_eq!(sm.claims["c2"].status, ClaimStatus::Active);
    assert_eq!(sm.claims["c2"].participant_id, "p2");
    assert_eq!(sm.steps["k1"].status, StepStatus::Claimed);
    assert_eq!(active_claims(&sm, "k1"), 1);
}

#[test]
fn handoff_rejects_non_holder_and_missing_capability() {
    let mut sm = StateMachine::new();
    let mut alice = Actor::new("user:alice");
    draft_session(&mut sm, &mut alice);
    let join = alice.tx(
        Op::ParticipantJoin,
        Some("s1"),
        0,
        json!({
            "participant_id": "p3", "type": "HUMAN", "ref": "user:carol",
            "capabilities": []
        }),
    );
    assert!(sm.apply(&join).ok);
    assert!(sm.apply(&claim(&mut alice, "c1", "p1", 1, None)).ok);

    let from_wrong = alice.tx(
        Op::StepHandoff,
        Some("s1"),
        2,
        json!({
            "step_id": "k1", "from_participant": "p2", "to_participant": "p1",
            "new_claim_id": "c2"
        }),
    );
    assert_eq!(
        sm.apply(&from_wrong).code.as_deref(),
        Some("NOT_CLAIM_HOLDER")
    );

    let to_incapable = alice.tx(
        Op::StepHandoff,
        Some("s1"),
        3,
        json!({
            "step_id": "k1", "from_participant": "p1", "to_participant": "p3",
            "new_claim_id": "c3"
        }),
    );
    assert_eq!(
        sm.apply(&to_incapable).code.as_deref(),
        Some("CAPABILITY_MISSING")
    );
}

// ── Artifacts ─────────────────────────────────────────────────────────────────

fn artifact(alice: &mut Actor, artifact_id: &str, at: i64) -> Tx {
    alice.tx(
        Op::ArtifactAdd,
        Some("s1"),
        at,
        json!({
            "artifact_id": artifact_id, "step_id": "k1", "producer_id": "p1",
            "kind": "text", "content": {"body": "draft text"}
        }),
    )
}

#[test]
fn artifact_versions_are_dense_and_client_version_is_ignored() {
    let mut sm = StateMachine::new();
    let mut alice = Actor::new("user:alice");
    draft_session(&mut sm, &mut alice);
    assert!(sm.apply(&claim(&mut alice, "c1", "p1", 1, None)).ok);

    assert!(sm.apply(&artifact(&mut alice, "a1", 2)).ok);
    assert_eq!(sm.steps["k1"].status, StepStatus::InReview);

    // A client-supplied version is ignored.
    let with_version = alice.tx(
        Op::ArtifactAdd,
        Some("s1"),
        3,
        json!({
            "artifact_id": "a2", "step_id": "k1", "producer_id": "p1",
            "kind": "text", "content": {"body": "v2"}, "version": 99
        }),
    );
    assert!(sm.apply(&with_version).ok);
    assert!(sm.apply(&artifact(&mut alice, "a3", 4)).ok);

    let versions: Vec<u32> = sm
        .list_artifacts("k1")
        .unwrap()
        .iter()
        .map(|a| a.version)
        .collect();
    assert_eq!(versions, vec![1, 2, 3]);
    assert_eq!(sm.steps["k1"].status, StepStatus::InReview);
}

#[test]
fn artifact_requires_content_or_uri_and_a_live_step() {
    let mut sm = StateMachine::new();
    let mut alice = Actor::new("user:alice");
    draft_session(&mut sm, &mut alice);
    assert!(sm.apply(&claim(&mut alice, "c1", "p1", 1, None)).ok);

    let empty = alice.tx(
        Op::ArtifactAdd,
        Some("s1"),
        2,
        json!({"artifact_id": "a1", "step_id": "k1", "producer_id": "p1", "kind": "text"}),
    );
    assert_eq!(sm.apply(&empty).code.as_deref(), Some("INVALID_PAYLOAD"));

    assert!(sm.apply(&artifact(&mut alice, "a1", 3)).ok);
    let resolve = alice.tx(
        Op::StepResolve,
        Some("s1"),
        4,
        json!({"step_id": "k1", "participant_id": "p1"}),
    );
    assert!(sm.apply(&resolve).ok);

    let late = artifact(&mut alice, "a2", 5);
    assert_eq!(sm.apply(&late).code.as_deref(), Some("BAD_STATE"));
}

// ── Decisions and votes ───────────────────────────────────────────────────────

/// Claim, submit an artifact, and open a decision with the given policy.
fn into_review(sm: &mut StateMachine, alice: &mut Actor, policy: Value) {
    assert!(sm.apply(&claim(alice, "c1", "p1", 1, None)).ok);
    assert!(sm.apply(&artifact(alice, "a1", 2)).ok);
    let open = alice.tx(
        Op::DecisionOpen,
        Some("s1"),
        3,
        json!({"decision_id": "d1", "step_id": "k1", "policy": policy}),
    );
    let out = sm.apply(&open);
    assert!(out.ok, "{}", out.message);
}

fn vote(alice: &mut Actor, vote_id: &str, participant: &str, choice: &str, at: i64) -> Tx {
    alice.tx(
        Op::VoteCast,
        Some("s1"),
        at,
        json!({
            "vote_id": vote_id, "decision_id": "d1",
            "participant_id": participant, "choice": choice
        }),
    )
}

#[test]
fn decision_requires_in_review() {
    let mut sm = StateMachine::new();
    let mut alice = Actor::new("user:alice");
    draft_session(&mut sm, &mut alice);

    let open = alice.tx(
        Op::DecisionOpen,
        Some("s1"),
        1,
        json!({"decision_id": "d1", "step_id": "k1"}),
    );
    assert_eq!(sm.apply(&open).code.as_deref(), Some("BAD_STATE"));
}

#[test]
fn quorum_passes_decision_and_resolves_step() {
    let mut sm = StateMachine::new();
    let mut alice = Actor::new("user:alice");
    draft_session(&mut sm, &mut alice);
    into_review(&mut sm, &mut alice, json!({"min_approvals": 2}));

    assert!(sm.apply(&vote(&mut alice, "v1", "p1", "APPROVE", 4)).ok);
    assert_eq!(sm.decisions["d1"].status, DecisionStatus::Pending);
    assert_eq!(sm.steps["k1"].status, StepStatus::InReview);

    assert!(sm.apply(&vote(&mut alice, "v2", "p2", "APPROVE", 5)).ok);
    assert_eq!(sm.decisions["d1"].status, DecisionStatus::Passed);
    assert_eq!(sm.steps["k1"].status, StepStatus::Resolved);
    assert_eq!(sm.claims["c1"].status, ClaimStatus::Released);

    // The step no longer shows up as open, and the session auto-completed.
    let open = sm.list_open_steps("s1", None, ts_ms(6), 100, 0).unwrap();
    assert!(open.is_empty());
    assert_eq!(sm.sessions["s1"].status, SessionStatus::Completed);
    assert!(sm
        .events
        .iter()
        .any(|e| e.event_type == "SESSION_COMPLETED"));
}

#[test]
fn rejection_quorum_fails_the_step() {
    let mut sm = StateMachine::new();
    let mut alice = Actor::new("user:alice");
    draft_session(&mut sm, &mut alice);
    into_review(&mut sm, &mut alice, json!({"max_rejections": 1}));

    assert!(sm.apply(&vote(&mut alice, "v1", "p2", "REJECT", 4)).ok);
    assert_eq!(sm.decisions["d1"].status, DecisionStatus::Rejected);
    assert_eq!(sm.steps["k1"].status, StepStatus::Failed);
    assert!(sm.events.iter().any(|e| e.event_type == "STEP_FAILED"));
    // Failed steps still count as resolved for completion purposes.
    assert_eq!(sm.sessions["s1"].status, SessionStatus::Completed);
}

#[test]
fn votes_enforce_deadline_uniqueness_and_membership() {
    let mut sm = StateMachine::new();
    let mut alice = Actor::new("user:alice");
    draft_session(&mut sm, &mut alice);

    assert!(sm.apply(&claim(&mut alice, "c1", "p1", 1, None)).ok);
    assert!(sm.apply(&artifact(&mut alice, "a1", 2)).ok);
    let open = alice.tx(
        Op::DecisionOpen,
        Some("s1"),
        3,
        json!({
            "decision_id": "d1", "step_id": "k1",
            "policy": {"min_approvals": 3}, "deadline": ts(10)
        }),
    );
    assert!(sm.apply(&open).ok);

    assert!(sm.apply(&vote(&mut alice, "v1", "p1", "APPROVE", 4)).ok);

    let duplicate = vote(&mut alice, "v2", "p1", "APPROVE", 5);
    assert_eq!(sm.apply(&duplicate).code.as_deref(), Some("ALREADY_VOTED"));

    let outsider = vote(&mut alice, "v3", "ghost", "APPROVE", 6);
    assert_eq!(sm.apply(&outsider).code.as_deref(), Some("NOT_PARTICIPANT"));

    // Past the deadline the vote is rejected but the decision stays PENDING.
    let late = vote(&mut alice, "v4", "p2", "APPROVE", 11);
    assert_eq!(sm.apply(&late).code.as_deref(), Some("DEADLINE_EXCEEDED"));
    assert_eq!(sm.decisions["d1"].status, DecisionStatus::Pending);
}

// ── Explicit resolution ───────────────────────────────────────────────────────

#[test]
fn step_resolve_requires_artifact_and_holder() {
    let mut sm = StateMachine::new();
    let mut alice = Actor::new("user:alice");
    draft_session(&mut sm, &mut alice);
    assert!(sm.apply(&claim(&mut alice, "c1", "p1", 1, None)).ok);

    let bare = alice.tx(
        Op::StepResolve,
        Some("s1"),
        2,
        json!({"step_id": "k1", "participant_id": "p1"}),
    );
    assert_eq!(sm.apply(&bare).code.as_deref(), Some("BAD_STATE"));

    assert!(sm.apply(&artifact(&mut alice, "a1", 3)).ok);

    let wrong_holder = alice.tx(
        Op::StepResolve,
        Some("s1"),
        4,
        json!({"step_id": "k1", "participant_id": "p2"}),
    );
    assert_eq!(
        sm.apply(&wrong_holder).code.as_deref(),
        Some("NOT_CLAIM_HOLDER")
    );

    let resolve = alice.tx(
        Op::StepResolve,
        Some("s1"),
        5,
        json!({"step_id": "k1", "participant_id": "p1"}),
    );
    assert!(sm.apply(&resolve).ok);
    assert_eq!(sm.steps["k1"].status, StepStatus::Resolved);
    assert_eq!(sm.steps["k1"].resolved_at, Some(ts_ms(5)));
    assert_eq!(sm.claims["c1"].status, ClaimStatus::Released);
    assert_eq!(sm.sessions["s1"].status, SessionStatus::Completed);
}

// ── Dependencies ──────────────────────────────────────────────────────────────

#[test]
fn dependent_steps_wait_for_their_dependencies() {
    let mut sm = StateMachine::new();
    let mut alice = Actor::new("user:alice");
    let create = alice.tx(
        Op::SessionCreate,
        Some("s1"),
        0,
        json!({
            "session_id": "s1", "name": "pipeline",
            "steps": [
                {"step_id": "k1", "step_key": "draft", "name": "Draft"},
                {"step_id": "k2", "step_key": "review", "name": "Review",
                 "depends_on": ["k1"]}
            ]
        }),
    );
    assert!(sm.apply(&create).ok);
    let join = alice.tx(
        Op::ParticipantJoin,
        Some("s1"),
        0,
        json!({"participant_id": "p1", "type": "AGENT", "ref": "agent:w", "capabilities": []}),
    );
    assert!(sm.apply(&join).ok);

    // k2 is not claimable and not listed while k1 is unresolved.
    let blocked = alice.tx(
        Op::StepClaim,
        Some("s1"),
        1,
        json!({"claim_id": "c2", "step_id": "k2", "participant_id": "p1"}),
    );
    assert_eq!(
        sm.apply(&blocked).code.as_deref(),
        Some("DEPENDENCY_UNRESOLVED")
    );
    let open: Vec<String> = sm
        .list_open_steps("s1", None, ts_ms(1), 100, 0)
        .unwrap()
        .iter()
        .map(|s| s.step_id.clone())
        .collect();
    assert_eq!(open, vec!["k1"]);

    // Resolve k1, then k2 unlocks.
    let c1 = alice.tx(
        Op::StepClaim,
        Some("s1"),
        2,
        json!({"claim_id": "c1", "step_id": "k1", "participant_id": "p1"}),
    );
    assert!(sm.apply(&c1).ok);
    let a1 = alice.tx(
        Op::ArtifactAdd,
        Some("s1"),
        3,
        json!({"artifact_id": "a1", "step_id": "k1", "producer_id": "p1",
               "kind": "text", "content": "done"}),
    );
    assert!(sm.apply(&a1).ok);
    let resolve = alice.tx(
        Op::StepResolve,
        Some("s1"),
        4,
        json!({"step_id": "k1", "participant_id": "p1"}),
    );
    assert!(sm.apply(&resolve).ok);

    let retry = alice.tx(
        Op::StepClaim,
        Some("s1"),
        5,
        json!({"claim_id": "c2", "step_id": "k2", "participant_id": "p1"}),
    );
    assert!(sm.apply(&retry).ok);
}

// ── Listings ──────────────────────────────────────────────────────────────────

#[test]
fn open_steps_respect_participant_capability_filter() {
    let mut sm = StateMachine::new();
    let mut alice = Actor::new("user:alice");
    let create = alice.tx(
        Op::SessionCreate,
        Some("s1"),
        0,
        json!({
            "session_id": "s1", "name": "mixed",
            "steps": [
                {"step_id": "k1", "step_key": "draft", "name": "Draft",
                 "required_capabilities": ["draft"]},
                {"step_id": "k2", "step_key": "legal", "name": "Legal",
                 "required_capabilities": ["legal"]}
            ]
        }),
    );
    assert!(sm.apply(&create).ok);
    let join = alice.tx(
        Op::ParticipantJoin,
        Some("s1"),
        0,
        json!({"participant_id": "p1", "type": "AGENT", "ref": "agent:w",
               "capabilities": ["draft"]}),
    );
    assert!(sm.apply(&join).ok);

    let all = sm.list_open_steps("s1", None, ts_ms(1), 100, 0).unwrap();
    assert_eq!(all.len(), 2);

    let for_p1: Vec<String> = sm
        .list_open_steps("s1", Some("p1"), ts_ms(1), 100, 0)
        .unwrap()
        .iter()
        .map(|s| s.step_id.clone())
        .collect();
    assert_eq!(for_p1, vec!["k1"]);

    // Unknown participant filter matches nothing; unknown session is None.
    assert!(sm
        .list_open_steps("s1", Some("ghost"), ts_ms(1), 100, 0)
        .unwrap()
        .is_empty());
    assert!(sm.list_open_steps("nope", None, ts_ms(1), 100, 0).is_none());
}

#[test]
fn listings_paginate() {
    let mut sm = StateMachine::new();
    let mut alice = Actor::new("user:alice");
    draft_session(&mut sm, &mut alice);

    let participants = sm.list_participants("s1", 1, 0).unwrap();
    assert_eq!(participants.len(), 1);
    assert_eq!(participants[0].participant_id, "p1");
    let rest = sm.list_participants("s1", 100, 1).unwrap();
    assert_eq!(rest.len(), 1);
    assert_eq!(rest[0].participant_id, "p2");

    let events = sm.list_events("s1", 2, 0).unwrap();
    assert_eq!(events.len(), 2);
    assert_eq!(events[0].event_type, "SESSION_CREATED");
}

// ── Laws ──────────────────────────────────────────────────────────────────────

#[test]
fn idempotent_replay_has_no_further_effect() {
    let mut sm = StateMachine::new();
    let mut alice = Actor::new("user:alice");
    draft_session(&mut sm, &mut alice);

    let c1 = claim(&mut alice, "c1", "p1", 1, None);
    assert!(sm.apply(&c1).ok);
    let snapshot = sm.snapshot_bytes().unwrap();

    let replay = sm.apply(&c1);
    assert!(replay.ok);
    assert!(replay.message.contains("already applied"));
    assert_eq!(sm.snapshot_bytes().unwrap(), snapshot);
}

#[test]
fn replicas_applying_the_same_log_agree_bitwise() {
    let mut alice = Actor::new("user:alice");

    // A full lifecycle as an ordered log, including one rejected entry
    // (replicas must agree on rejections too).
    let log = vec![
        alice.tx(
            Op::SessionCreate,
            Some("s1"),
            0,
            json!({
                "session_id": "s1", "name": "demo",
                "steps": [{"step_id": "k1", "step_key": "draft", "name": "Draft"}]
            }),
        ),
        alice.tx(
            Op::ParticipantJoin,
            Some("s1"),
            0,
            json!({"participant_id": "p1", "type": "AGENT", "ref": "agent:w",
                   "capabilities": []}),
        ),
        alice.tx(
            Op::StepClaim,
            Some("s1"),
            1,
            json!({"claim_id": "c1", "step_id": "k1", "participant_id": "p1"}),
        ),
        alice.tx(
            Op::StepClaim,
            Some("s1"),
            1,
            json!({"claim_id": "c2", "step_id": "k1", "participant_id": "p1"}),
        ),
        alice.tx(
            Op::ArtifactAdd,
            Some("s1"),
            2,
            json!({"artifact_id": "a1", "step_id": "k1", "producer_id": "p1",
                   "kind": "text", "content": "x"}),
        ),
        alice.tx(
            Op::StepResolve,
            Some("s1"),
            3,
            json!({"step_id": "k1", "participant_id": "p1"}),
        ),
    ];

    let mut first = StateMachine::new();
    let mut second = StateMachine::new();
    for tx in &log {
        let a = first.apply(tx);
        let b = second.apply(tx);
        assert_eq!(a.ok, b.ok);
        assert_eq!(a.code, b.code);
    }
    assert_eq!(
        first.snapshot_bytes().unwrap(),
        second.snapshot_bytes().unwrap()
    );
}

#[test]
fn events_are_ordered_with_dense_ids() {
    let mut sm = StateMachine::new();
    let mut alice = Actor::new("user:alice");
    draft_session(&mut sm, &mut alice);
    assert!(sm.apply(&claim(&mut alice, "c1", "p1", 1, None)).ok);

    let ids: Vec<u64> = sm.events.iter().map(|e| e.event_id).collect();
    let expected: Vec<u64> = (1..=ids.len() as u64).collect();
    assert_eq!(ids, expected);

    let types: Vec<&str> = sm.events.iter().map(|e| e.event_type.as_str()).collect();
    assert_eq!(
        types,
        vec![
            "SESSION_CREATED",
            "PARTICIPANT_JOINED",
            "PARTICIPANT_JOINED",
            "STEP_CLAIMED"
        ]
    );
}

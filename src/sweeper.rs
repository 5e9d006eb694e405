//! Lease sweeper — expires stale claims.
//!
//! Runs on every node but only acts while this node is the leader. Each
//! tick it scans the local state machine for ACTIVE claims whose lease has
//! lapsed and submits one signed `CLAIM_EXPIRE` transaction per claim,
//! with the actor `system:lease-sweeper` and the node's own Ed25519 key.
//!
//! This is the single place the kernel reads the wall clock for write
//! purposes: the sweep transaction carries the leader's timestamp and is
//! applied deterministically by every replica using that timestamp. The
//! tx_id is derived from `(claim_id, lease_until)`, so a re-sweep after
//! leader churn is an idempotent no-op instead of a double expiry.

use std::sync::Arc;

use chrono::Utc;
use serde_json::json;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use crate::metrics;
use crate::raft::RaftNode;
use crate::state::ExpiredClaim;
use crate::tx::{format_timestamp, Op, Tx};

/// Actor recorded on sweeper transactions.
pub const SWEEPER_ACTOR: &str = "system:lease-sweeper";

pub async fn run_lease_sweeper(node: Arc<RaftNode>) {
    let mut ticker = tokio::time::interval(node.config.sweep_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        ticker.tick().await;
        if !node.is_leader() {
            continue;
        }

        let now = Utc::now();
        let expired = node
            .state_machine()
            .read()
            .unwrap()
            .expired_claims(now.timestamp_millis());
        if expired.is_empty() {
            continue;
        }

        for claim in expired {
            let tx = match build_expire_tx(&node, &claim, now) {
                Ok(tx) => tx,
                Err(e) => {
                    warn!(claim_id = %claim.claim_id, error = %e, "failed to build sweep tx");
                    continue;
                }
            };
            match node.apply_tx(tx).await {
                Ok(outcome) if outcome.ok => {
                    metrics::LEASES_SWEPT_TOTAL
                        .with_label_values(&["expired"])
                        .inc();
                    info!(
                        claim_id = %claim.claim_id,
                        step_id = %claim.step_id,
                        "expired stale claim"
                    );
                }
                Ok(outcome) => {
                    // Raced with a concurrent claim or an earlier sweep.
                    metrics::LEASES_SWEPT_TOTAL
                        .with_label_values(&["rejected"])
                        .inc();
                    debug!(
                        claim_id = %claim.claim_id,
                        message = %outcome.message,
                        "sweep tx rejected"
                    );
                }
                Err(e) => {
                    // Typically leadership lost mid-sweep; the new leader's
                    // sweeper picks these up.
                    warn!(claim_id = %claim.claim_id, error = %e, "sweep tx failed");
                    break;
                }
            }
        }
    }
}

fn build_expire_tx(
    node: &RaftNode,
    claim: &ExpiredClaim,
    now: chrono::DateTime<Utc>,
) -> Result<Tx, crate::errors::Rejection> {
    let tx_id = format!("sweep-{}-{}", claim.claim_id, claim.lease_until);
    Tx::build_signed(
        Op::ClaimExpire,
        tx_id.clone(),
        None,
        tx_id,
        format_timestamp(now),
        SWEEPER_ACTOR,
        &json!({ "step_id": claim.step_id, "claim_id": claim.claim_id }),
        node.signer(),
    )
}

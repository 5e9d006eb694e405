use std::sync::Once;

use prometheus::{Encoder, IntCounterVec, IntGauge, Opts, TextEncoder};
use tracing::error;

lazy_static::lazy_static! {
    /// Transactions applied, by operation.
    pub static ref TX_APPLIED_TOTAL: IntCounterVec =
        IntCounterVec::new(
            Opts::new("tx_applied_total", "Transactions applied by the state machine")
                .namespace("collabd"),
            &["op"]
        ).unwrap();

    /// Transactions rejected, by rejection code.
    pub static ref TX_REJECTED_TOTAL: IntCounterVec =
        IntCounterVec::new(
            Opts::new("tx_rejected_total", "Transactions rejected by the state machine")
                .namespace("collabd"),
            &["code"]
        ).unwrap();

    /// 1 while this node is the raft leader, 0 otherwise.
    pub static ref RAFT_IS_LEADER: IntGauge =
        IntGauge::with_opts(
            Opts::new("raft_is_leader", "Whether this node is the current raft leader")
                .namespace("collabd")
        ).unwrap();

    /// Claims expired by the lease sweeper.
    pub static ref LEASES_SWEPT_TOTAL: IntCounterVec =
        IntCounterVec::new(
            Opts::new("leases_swept_total", "Expired claims swept, by outcome")
                .namespace("collabd"),
            &["outcome"]
        ).unwrap();
}

static REGISTER: Once = Once::new();

/// Register all metrics with the default registry. Safe to call from every
/// node launch in a process; only the first call registers.
pub fn register_metrics() {
    REGISTER.call_once(|| {
        let registry = prometheus::default_registry();
        for result in [
            registry.register(Box::new(TX_APPLIED_TOTAL.clone())),
            registry.register(Box::new(TX_REJECTED_TOTAL.clone())),
            registry.register(Box::new(RAFT_IS_LEADER.clone())),
            registry.register(Box::new(LEASES_SWEPT_TOTAL.clone())),
        ] {
            if let Err(e) = result {
                error!(error = %e, "failed to register metric");
            }
        }
    });
}

/// Encode the default registry in the Prometheus text format.
pub fn encode_text() -> Vec<u8> {
    let mut buf = Vec::new();
    let encoder = TextEncoder::new();
    if let Err(e) = encoder.encode(&prometheus::default_registry().gather(), &mut buf) {
        error!(error = %e, "failed to encode metrics");
    }
    buf
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn register_is_idempotent() {
        register_metrics();
        register_metrics();
        TX_APPLIED_TOTAL.with_label_values(&["SESSION_CREATE"]).inc();
        let text = String::from_utf8(encode_text()).unwrap();
        assert!(text.contains("collabd_tx_applied_total"));
    }
}

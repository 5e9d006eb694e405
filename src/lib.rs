//! collabd — a leaderless multi-participant collaboration runtime.
//!
//! A cluster of peer nodes jointly manages sessions in which humans and
//! agents claim, execute, hand off, and decide on work steps. Every node is
//! a full replica: writes are signed transactions totally ordered through
//! an embedded raft group and applied by a deterministic in-memory state
//! machine; reads are served locally.

pub mod config;
pub mod errors;
pub mod grpc;
pub mod http;
pub mod metrics;
pub mod model;
pub mod raft;
pub mod state;
pub mod sweeper;
pub mod tx;

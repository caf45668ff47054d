//! Core coordination fabric for the USDT (BEP-20) payment gateway: address
//! issuance, chain monitoring, settlement, payouts and webhook delivery.
//!
//! Exposed as a library so the binary entry point and the integration test
//! suite share one copy of every engine rather than each re-deriving it.

pub mod address_manager;
pub mod bounded_cache;
pub mod chain;
pub mod config;
pub mod db;
pub mod domain;
pub mod errors;
pub mod idempotency;
pub mod monitor;
pub mod payout;
pub mod queue;
pub mod refund;
pub mod rpc_fallback;
pub mod secrets;
pub mod settlement;
pub mod state_machine;
pub mod webhook;

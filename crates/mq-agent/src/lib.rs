//! MQTT agent: library crate behind the `mq-agent` binary.
//!
//! Re-exports all modules so external crates (e.g. `mq-e2e-tests`) can
//! drive an `Agent` against a test broker.

pub mod agent;
pub mod config;
pub mod heartbeat;
pub mod inbox;

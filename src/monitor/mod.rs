//! Background monitoring for serve mode
//!
//! The monitor engine:
//! 1. Samples gas prices and re-evaluates the admission gate for every chain
//! 2. Scans the operator address for stuck transactions
//! 3. Checks RPC health on the same cadence as gas sampling

pub mod engine;

pub use engine::MonitorEngine;

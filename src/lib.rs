//! Deploy Coordinator - nonce coordination and gas admission for multi-chain deployments
//!
//! Keeps a local view of each operator account's nonce so concurrent deploy
//! scripts never collide, flags and re-prices stuck transactions, and holds
//! submissions back while network fees are too high.

pub mod api;
pub mod chain;
pub mod cli;
pub mod clock;
pub mod config;
pub mod error;
pub mod metrics;
pub mod monitor;
pub mod state;
pub mod tx;

pub use chain::{ChainClient, ChainRpc};
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::Settings;
pub use error::{CoordinatorError, CoordinatorResult};
pub use state::StateStore;
pub use tx::{GasAdmissionGate, NonceCoordinator};

//! hostprov engine library
//!
//! Tracks compute instances a resource broker asks for, from launch through
//! decommission, against a pluggable compute provider.
//!
//! Every invocation is short-lived: load the store, consult the provider,
//! compute the new state, write the store once, print a response. Progress
//! between invocations happens only because the broker keeps polling.
//!
//! ## Modules
//!
//! - `engine`: the five broker-facing operations
//! - `provider`: provider capability trait, retry wrapper and a simulated
//!   provider
//! - `state`: persisted requests and machines, changesets and the store file
//! - `templates`: template catalog
//! - `response`: response documents printed back to the broker

pub mod cli;
pub mod clock;
pub mod config;
pub mod engine;
pub mod error;
pub mod input;
pub mod provider;
pub mod response;
pub mod state;
pub mod templates;

pub use clock::{Clock, FixedClock, SystemClock};
pub use engine::Engine;
pub use error::EngineError;
pub use input::{MachinesInput, ProvisionInput, StatusInput};
pub use provider::{ProviderClient, ProviderError, SimulatedConfig, SimulatedProvider};
pub use response::Response;
pub use state::{Store, StoreDocument};
pub use templates::{Template, TemplateCatalog};

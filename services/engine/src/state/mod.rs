//! Local persistence of requests and machines.
//!
//! - `model`: the persisted document
//! - `changeset`: deltas replayed onto the freshest document
//! - `store`: the JSON file with backup-and-rollback writes

pub mod changeset;
pub mod model;
pub mod store;

pub use changeset::{Change, Changeset};
pub use model::{Machine, Request, StoreDocument};
pub use store::{Store, StoreError};

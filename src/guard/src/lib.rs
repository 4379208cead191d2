//! Reference-integrity guard for context entities.
//!
//! [`probe::UsageProbe`] asks peer services whether an entity is still referenced;
//! [`coordinator::BulkDeleteCoordinator`] turns a bulk delete request into a
//! deleted/skipped partition, deleting only what the probe cleared.

pub mod coordinator;
pub mod message;
pub mod peer;
pub mod probe;
pub mod request;

use common::Catalog;
use common::config::Configuration;

pub use coordinator::{BulkDeleteCoordinator, BulkDeleteOutcome, CoordinatorSettings, SkipReason};
pub use message::usage_message;
pub use peer::{PeerClient, PeerError};
pub use probe::{
    ProbeError, ProbeSettings, ReferenceKind, ReferenceStrategy, UsageCheck, UsageProbe,
    UsageResult,
};
pub use request::{BulkDeleteRequest, RequestError};

/// The production wiring: HTTP probe against the configured peers, catalog storage.
pub type Guard = BulkDeleteCoordinator<UsageProbe, Catalog>;

pub fn build_guard(config: &Configuration, catalog: Catalog) -> Result<Guard, ProbeError> {
    let probe = UsageProbe::from_config(config)?;
    Ok(BulkDeleteCoordinator::new(
        probe,
        catalog,
        CoordinatorSettings::from(&config.guard),
    ))
}

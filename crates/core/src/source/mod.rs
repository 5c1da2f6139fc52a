//! Identity provider side of a reconciliation: the authoritative source of
//! users and groups.

pub mod idcs;

use async_trait::async_trait;

use crate::errors::SourceError;
use crate::models::{GroupRecord, IdentityRecord};

pub use idcs::IdcsSource;

/// Read access to the authoritative identity provider.
///
/// Each list call returns a complete snapshot; paginated APIs must be fully
/// drained before returning.
#[async_trait]
pub trait IdentitySource: Send + Sync {
    /// Acquire credentials or otherwise check the provider is usable.
    async fn initialize(&self) -> Result<(), SourceError> {
        Ok(())
    }

    async fn list_users(&self) -> Result<Vec<IdentityRecord>, SourceError>;

    async fn list_groups(&self) -> Result<Vec<GroupRecord>, SourceError>;
}

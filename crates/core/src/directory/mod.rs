//! Local directory side of a reconciliation: the target that is brought in
//! line with the identity provider.

pub mod dn;
pub mod ldap;

use std::collections::BTreeSet;

use async_trait::async_trait;

use crate::diff::Modification;
use crate::errors::DirectoryError;
use crate::models::{GroupRecord, IdentityRecord, TargetAttributes};

pub use ldap::LdapDirectory;

/// Read/write access to the local directory.
///
/// Every mutating call fails with a distinguishable
/// [`DirectoryError::NotFound`], [`DirectoryError::AlreadyExists`] or
/// connectivity error ([`DirectoryError::Connectivity`] /
/// [`DirectoryError::Timeout`]). Timeouts are enforced by the implementation.
#[async_trait]
pub trait DirectoryTarget: Send + Sync {
    /// Connect and bind.
    async fn initialize(&self) -> Result<(), DirectoryError> {
        Ok(())
    }

    /// Fill in values the directory requires on every user entry but the
    /// identity provider may leave empty, so a source record compares equal
    /// to the entry a create stores for it.
    fn normalize_user(&self, _user: &mut IdentityRecord) {}

    async fn search_users(&self) -> Result<Vec<IdentityRecord>, DirectoryError>;

    async fn search_groups(&self) -> Result<Vec<GroupRecord>, DirectoryError>;

    async fn create_user(
        &self,
        username: &str,
        attrs: &TargetAttributes,
    ) -> Result<(), DirectoryError>;

    async fn modify_user(
        &self,
        username: &str,
        modifications: &[Modification],
    ) -> Result<(), DirectoryError>;

    async fn delete_user(&self, username: &str) -> Result<(), DirectoryError>;

    /// Create a group with its initial members (join keys).
    async fn create_group(
        &self,
        name: &str,
        attrs: &TargetAttributes,
        members: &BTreeSet<String>,
    ) -> Result<(), DirectoryError>;

    /// Apply attribute and membership changes. A group is never left
    /// without a member value.
    async fn modify_group(
        &self,
        name: &str,
        modifications: &[Modification],
    ) -> Result<(), DirectoryError>;

    async fn delete_group(&self, name: &str) -> Result<(), DirectoryError>;
}

//! # Account Store
//!
//! The narrow credentials-repository contract the protocol engine consumes.
//! The engine never sees a database: operations talk to [`AccountStore`]
//! and any backend (Postgres, SQLite, an in-memory map) can sit behind it.
//!
//! Invariants the contract guarantees:
//! - usernames are unique; `insert_or_ignore` reports a duplicate with a
//!   non-positive id instead of failing
//! - salt and hash widths are fixed (see `utils::password`)
//! - password material never leaves the authentication path

use crate::protocol::PermissionLevel;
use crate::utils::password::{HASH_LEN, SALT_LEN};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;

pub mod memory;

pub use memory::MemoryAccountStore;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("store unavailable")]
    Unavailable,
    #[error("invalid record state")]
    Invalid,
}

/// Row shape for account creation.
#[derive(Debug, Clone)]
pub struct NewAccount {
    pub username: String,
    pub salt: [u8; SALT_LEN],
    pub hash: [u8; HASH_LEN],
    pub role: PermissionLevel,
    pub is_active: bool,
}

/// Projection used by login: everything needed to authenticate and apply
/// lockout policy, nothing more.
#[derive(Debug, Clone)]
pub struct AuthView {
    pub id: i64,
    pub salt: [u8; SALT_LEN],
    pub hash: [u8; HASH_LEN],
    pub role: PermissionLevel,
    pub is_active: bool,
    pub failed_login_count: u32,
    pub last_failed_login_at: Option<DateTime<Utc>>,
}

/// Projection used by password change.
#[derive(Debug, Clone)]
pub struct PasswordView {
    pub id: i64,
    pub salt: [u8; SALT_LEN],
    pub hash: [u8; HASH_LEN],
    pub is_active: bool,
}

/// The repository contract. Implementations must be safe for concurrent use;
/// the counter mutations (`increment_failed`,
/// `reset_failed_and_stamp_login`) are atomic per account.
#[async_trait]
pub trait AccountStore: Send + Sync {
    /// Insert a new account unless the username exists. Returns the new id,
    /// or a non-positive value when the username is already taken.
    async fn insert_or_ignore(&self, account: NewAccount) -> Result<i64, StoreError>;

    /// Fetch the authentication view for a username.
    async fn get_auth_view_by_username(
        &self,
        username: &str,
    ) -> Result<Option<AuthView>, StoreError>;

    /// Fetch the password-change view for a username.
    async fn get_for_password_change_by_username(
        &self,
        username: &str,
    ) -> Result<Option<PasswordView>, StoreError>;

    /// Record a failed login: bump the counter and stamp the failure time.
    async fn increment_failed(&self, id: i64, at: DateTime<Utc>) -> Result<(), StoreError>;

    /// Record a successful login: zero the counter and stamp the login time.
    async fn reset_failed_and_stamp_login(
        &self,
        id: i64,
        at: DateTime<Utc>,
    ) -> Result<(), StoreError>;

    /// Stamp the logout time for a username.
    async fn stamp_logout(&self, username: &str, at: DateTime<Utc>) -> Result<(), StoreError>;

    /// Replace salt and hash only if the stored hash still matches
    /// `expected_hash` (optimistic concurrency). Returns the number of rows
    /// changed: zero means the record moved underneath the caller.
    async fn update_password_if_matches(
        &self,
        id: i64,
        expected_hash: &[u8; HASH_LEN],
        new_salt: &[u8; SALT_LEN],
        new_hash: &[u8; HASH_LEN],
    ) -> Result<u64, StoreError>;
}

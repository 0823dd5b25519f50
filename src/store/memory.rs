//! In-memory [`AccountStore`] backing the standalone binary and the test
//! suite. Single-writer-lock semantics make the counter mutations and the
//! optimistic password update atomic without further ceremony.

use super::{AccountStore, AuthView, NewAccount, PasswordView, StoreError};
use crate::protocol::PermissionLevel;
use crate::utils::password::{HASH_LEN, SALT_LEN};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use tokio::sync::RwLock;

#[derive(Debug, Clone)]
struct AccountRow {
    id: i64,
    username: String,
    salt: [u8; SALT_LEN],
    hash: [u8; HASH_LEN],
    role: PermissionLevel,
    is_active: bool,
    failed_login_count: u32,
    last_login_at: Option<DateTime<Utc>>,
    last_logout_at: Option<DateTime<Utc>>,
    last_failed_login_at: Option<DateTime<Utc>>,
    #[allow(dead_code)]
    created_at: DateTime<Utc>,
}

#[derive(Debug, Default)]
struct MemoryInner {
    next_id: i64,
    by_name: HashMap<String, i64>,
    rows: HashMap<i64, AccountRow>,
}

/// Thread-safe in-memory account table.
#[derive(Debug, Default)]
pub struct MemoryAccountStore {
    inner: RwLock<MemoryInner>,
}

impl MemoryAccountStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Most recent logout stamp for a username, for observability and tests.
    pub async fn last_logout_at(&self, username: &str) -> Option<DateTime<Utc>> {
        let inner = self.inner.read().await;
        let id = inner.by_name.get(username)?;
        inner.rows.get(id).and_then(|row| row.last_logout_at)
    }

    /// Most recent login stamp for a username.
    pub async fn last_login_at(&self, username: &str) -> Option<DateTime<Utc>> {
        let inner = self.inner.read().await;
        let id = inner.by_name.get(username)?;
        inner.rows.get(id).and_then(|row| row.last_login_at)
    }

    /// Flip the active flag on an account.
    pub async fn set_active(&self, username: &str, is_active: bool) -> Result<(), StoreError> {
        let mut inner = self.inner.write().await;
        let id = *inner.by_name.get(username).ok_or(StoreError::Invalid)?;
        let row = inner.rows.get_mut(&id).ok_or(StoreError::Invalid)?;
        row.is_active = is_active;
        Ok(())
    }
}

#[async_trait]
impl AccountStore for MemoryAccountStore {
    async fn insert_or_ignore(&self, account: NewAccount) -> Result<i64, StoreError> {
        let mut inner = self.inner.write().await;
        if inner.by_name.contains_key(&account.username) {
            return Ok(0);
        }
        inner.next_id += 1;
        let id = inner.next_id;
        let row = AccountRow {
            id,
            username: account.username.clone(),
            salt: account.salt,
            hash: account.hash,
            role: account.role,
            is_active: account.is_active,
            failed_login_count: 0,
            last_login_at: None,
            last_logout_at: None,
            last_failed_login_at: None,
            created_at: Utc::now(),
        };
        inner.by_name.insert(account.username, id);
        inner.rows.insert(id, row);
        Ok(id)
    }

    async fn get_auth_view_by_username(
        &self,
        username: &str,
    ) -> Result<Option<AuthView>, StoreError> {
        let inner = self.inner.read().await;
        let Some(id) = inner.by_name.get(username) else {
            return Ok(None);
        };
        Ok(inner.rows.get(id).map(|row| AuthView {
            id: row.id,
            salt: row.salt,
            hash: row.hash,
            role: row.role,
            is_active: row.is_active,
            failed_login_count: row.failed_login_count,
            last_failed_login_at: row.last_failed_login_at,
        }))
    }

    async fn get_for_password_change_by_username(
        &self,
        username: &str,
    ) -> Result<Option<PasswordView>, StoreError> {
        let inner = self.inner.read().await;
        let Some(id) = inner.by_name.get(username) else {
            return Ok(None);
        };
        Ok(inner.rows.get(id).map(|row| PasswordView {
            id: row.id,
            salt: row.salt,
            hash: row.hash,
            is_active: row.is_active,
        }))
    }

    async fn increment_failed(&self, id: i64, at: DateTime<Utc>) -> Result<(), StoreError> {
        let mut inner = self.inner.write().await;
        let row = inner.rows.get_mut(&id).ok_or(StoreError::Invalid)?;
        row.failed_login_count = row.failed_login_count.saturating_add(1);
        row.last_failed_login_at = Some(at);
        Ok(())
    }

    async fn reset_failed_and_stamp_login(
        &self,
        id: i64,
        at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let mut inner = self.inner.write().await;
        let row = inner.rows.get_mut(&id).ok_or(StoreError::Invalid)?;
        row.failed_login_count = 0;
        row.last_login_at = Some(at);
        Ok(())
    }

    async fn stamp_logout(&self, username: &str, at: DateTime<Utc>) -> Result<(), StoreError> {
        let mut inner = self.inner.write().await;
        let id = *inner.by_name.get(username).ok_or(StoreError::Invalid)?;
        let row = inner.rows.get_mut(&id).ok_or(StoreError::Invalid)?;
        row.last_logout_at = Some(at);
        Ok(())
    }

    async fn update_password_if_matches(
        &self,
        id: i64,
        expected_hash: &[u8; HASH_LEN],
        new_salt: &[u8; SALT_LEN],
        new_hash: &[u8; HASH_LEN],
    ) -> Result<u64, StoreError> {
        let mut inner = self.inner.write().await;
        let Some(row) = inner.rows.get_mut(&id) else {
            return Ok(0);
        };
        if row.hash != *expected_hash {
            return Ok(0);
        }
        row.salt = *new_salt;
        row.hash = *new_hash;
        Ok(1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn account(username: &str) -> NewAccount {
        NewAccount {
            username: username.to_string(),
            salt: [1u8; SALT_LEN],
            hash: [2u8; HASH_LEN],
            role: PermissionLevel::User,
            is_active: true,
        }
    }

    #[tokio::test]
    async fn insert_then_fetch() {
        let store = MemoryAccountStore::new();
        let id = store.insert_or_ignore(account("alice")).await.expect("insert");
        assert!(id > 0);

        let view = store
            .get_auth_view_by_username("alice")
            .await
            .expect("fetch")
            .expect("present");
        assert_eq!(view.id, id);
        assert_eq!(view.failed_login_count, 0);
        assert!(view.is_active);
    }

    #[tokio::test]
    async fn duplicate_username_ignored() {
        let store = MemoryAccountStore::new();
        let first = store.insert_or_ignore(account("alice")).await.expect("insert");
        let second = store.insert_or_ignore(account("alice")).await.expect("insert");
        assert!(first > 0);
        assert_eq!(second, 0);
    }

    #[tokio::test]
    async fn failure_counter_and_reset() {
        let store = MemoryAccountStore::new();
        let id = store.insert_or_ignore(account("alice")).await.expect("insert");

        let at = Utc::now();
        store.increment_failed(id, at).await.expect("increment");
        store.increment_failed(id, at).await.expect("increment");
        let view = store
            .get_auth_view_by_username("alice")
            .await
            .expect("fetch")
            .expect("present");
        assert_eq!(view.failed_login_count, 2);
        assert_eq!(view.last_failed_login_at, Some(at));

        store
            .reset_failed_and_stamp_login(id, at)
            .await
            .expect("reset");
        let view = store
            .get_auth_view_by_username("alice")
            .await
            .expect("fetch")
            .expect("present");
        assert_eq!(view.failed_login_count, 0);
    }

    #[tokio::test]
    async fn optimistic_update_detects_moved_hash() {
        let store = MemoryAccountStore::new();
        let id = store.insert_or_ignore(account("alice")).await.expect("insert");

        let stale = [9u8; HASH_LEN];
        let changed = store
            .update_password_if_matches(id, &stale, &[3u8; SALT_LEN], &[4u8; HASH_LEN])
            .await
            .expect("update");
        assert_eq!(changed, 0);

        let changed = store
            .update_password_if_matches(id, &[2u8; HASH_LEN], &[3u8; SALT_LEN], &[4u8; HASH_LEN])
            .await
            .expect("update");
        assert_eq!(changed, 1);

        let view = store
            .get_for_password_change_by_username("alice")
            .await
            .expect("fetch")
            .expect("present");
        assert_eq!(view.hash, [4u8; HASH_LEN]);
    }
}

//! Persistence for users and e-mail verification records.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use thiserror::Error;
use tokio::sync::RwLock;

/// How long a verification link stays valid.
pub const VERIFY_EMAIL_TTL_MINUTES: i64 = 15;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum StoreError {
    #[error("{0} not found")]
    NotFound(String),

    #[error("{0} already exists")]
    Conflict(String),

    #[error("invalid input: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct User {
    pub id: i64,
    pub username: String,
    pub full_name: String,
    pub email: String,
    pub is_email_verified: bool,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct CreateUser {
    pub username: String,
    pub full_name: String,
    pub email: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct VerifyEmail {
    pub id: i64,
    pub user_id: i64,
    pub email: String,
    #[serde(skip_serializing)]
    pub secret_code: String,
    pub is_used: bool,
    pub created_at: DateTime<Utc>,
    pub expired_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct CreateVerifyEmail {
    pub user_id: i64,
    pub email: String,
    pub secret_code: String,
}

#[async_trait]
pub trait Store: Send + Sync {
    async fn create_user(&self, user: CreateUser) -> Result<User, StoreError>;

    async fn get_user(&self, id: i64) -> Result<User, StoreError>;

    async fn create_verify_email(&self, record: CreateVerifyEmail) -> Result<VerifyEmail, StoreError>;

    /// Consume an unused, unexpired verification record and mark its user's
    /// e-mail as verified.
    async fn verify_email(&self, email_id: i64, secret_code: &str) -> Result<User, StoreError>;
}

#[derive(Default)]
struct Tables {
    users: HashMap<i64, User>,
    usernames: HashMap<String, i64>,
    verify_emails: HashMap<i64, VerifyEmail>,
    next_user_id: i64,
    next_verify_email_id: i64,
}

/// In-memory [`Store`]. Data lives as long as the process.
#[derive(Default)]
pub struct MemoryStore {
    tables: RwLock<Tables>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn create_user(&self, user: CreateUser) -> Result<User, StoreError> {
        if user.username.trim().is_empty() {
            return Err(StoreError::Invalid("username must not be empty".to_string()));
        }

        let mut tables = self.tables.write().await;
        if tables.usernames.contains_key(&user.username) {
            return Err(StoreError::Conflict(format!("user {}", user.username)));
        }

        tables.next_user_id += 1;
        let row = User {
            id: tables.next_user_id,
            username: user.username,
            full_name: user.full_name,
            email: user.email,
            is_email_verified: false,
            created_at: Utc::now(),
        };
        tables.usernames.insert(row.username.clone(), row.id);
        tables.users.insert(row.id, row.clone());
        Ok(row)
    }

    async fn get_user(&self, id: i64) -> Result<User, StoreError> {
        self.tables
            .read()
            .await
            .users
            .get(&id)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(format!("user {id}")))
    }

    async fn create_verify_email(&self, record: CreateVerifyEmail) -> Result<VerifyEmail, StoreError> {
        let mut tables = self.tables.write().await;
        if !tables.users.contains_key(&record.user_id) {
            return Err(StoreError::NotFound(format!("user {}", record.user_id)));
        }

        tables.next_verify_email_id += 1;
        let now = Utc::now();
        let row = VerifyEmail {
            id: tables.next_verify_email_id,
            user_id: record.user_id,
            email: record.email,
            secret_code: record.secret_code,
            is_used: false,
            created_at: now,
            expired_at: now + Duration::minutes(VERIFY_EMAIL_TTL_MINUTES),
        };
        tables.verify_emails.insert(row.id, row.clone());
        Ok(row)
    }

    async fn verify_email(&self, email_id: i64, secret_code: &str) -> Result<User, StoreError> {
        let mut tables = self.tables.write().await;
        let now = Utc::now();

        let user_id = match tables.verify_emails.get_mut(&email_id) {
            Some(record)
                if record.secret_code == secret_code && !record.is_used && record.expired_at > now =>
            {
                record.is_used = true;
                record.user_id
            }
            _ => return Err(StoreError::NotFound(format!("verify email {email_id}"))),
        };

        let user = tables
            .users
            .get_mut(&user_id)
            .ok_or_else(|| StoreError::NotFound(format!("user {user_id}")))?;
        user.is_email_verified = true;
        Ok(user.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn alice() -> CreateUser {
        CreateUser {
            username: "alice".to_string(),
            full_name: "Alice Liddell".to_string(),
            email: "alice@example.com".to_string(),
        }
    }

    #[tokio::test]
    async fn test_create_and_get_user() {
        let store = MemoryStore::new();
        let user = store.create_user(alice()).await.unwrap();

        assert_eq!(user.id, 1);
        assert!(!user.is_email_verified);
        assert_eq!(store.get_user(user.id).await.unwrap(), user);
        assert!(matches!(store.get_user(99).await, Err(StoreError::NotFound(_))));
    }

    #[tokio::test]
    async fn test_duplicate_username_conflicts() {
        let store = MemoryStore::new();
        store.create_user(alice()).await.unwrap();
        assert!(matches!(
            store.create_user(alice()).await,
            Err(StoreError::Conflict(_))
        ));
    }

    #[tokio::test]
    async fn test_verify_email_is_single_use() {
        let store = MemoryStore::new();
        let user = store.create_user(alice()).await.unwrap();
        let record = store
            .create_verify_email(CreateVerifyEmail {
                user_id: user.id,
                email: user.email.clone(),
                secret_code: "s3cret".to_string(),
            })
            .await
            .unwrap();

        assert!(matches!(
            store.verify_email(record.id, "wrong").await,
            Err(StoreError::NotFound(_))
        ));

        let verified = store.verify_email(record.id, "s3cret").await.unwrap();
        assert!(verified.is_email_verified);
        assert!(store.get_user(user.id).await.unwrap().is_email_verified);

        assert!(matches!(
            store.verify_email(record.id, "s3cret").await,
            Err(StoreError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_verify_email_requires_user() {
        let store = MemoryStore::new();
        let err = store
            .create_verify_email(CreateVerifyEmail {
                user_id: 7,
                email: "ghost@example.com".to_string(),
                secret_code: "x".to_string(),
            })
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::NotFound(_)));
    }
}

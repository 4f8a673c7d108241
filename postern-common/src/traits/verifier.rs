//! Credential verification contract.
//!
//! The session dispatches AUTH against this trait; the implementation
//! (directory, database, PAM, ...) lives outside the core.

use std::{collections::HashMap, fmt};

use async_trait::async_trait;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum VerifyError {
    /// The backend could not answer right now; the client may retry.
    #[error("temporary verification failure: {0}")]
    Transient(String),

    /// The backend answered and the request can never succeed.
    #[error("permanent verification failure: {0}")]
    Permanent(String),
}

#[async_trait]
pub trait CredentialVerifier: Send + Sync + fmt::Debug {
    /// Returns `Ok(true)` when the credentials are valid, `Ok(false)` when
    /// they are well-formed but wrong.
    async fn verify(&self, username: &str, password: &str) -> Result<bool, VerifyError>;
}

/// Fixed in-memory credential table. Suitable for tests and small
/// deployments; anything real should implement [`CredentialVerifier`]
/// against its own store.
#[derive(Default)]
pub struct StaticCredentialVerifier {
    users: HashMap<String, String>,
}

impl fmt::Debug for StaticCredentialVerifier {
    fn fmt(&self, fmt: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Never render passwords, even at debug level.
        fmt.debug_struct("StaticCredentialVerifier")
            .field("users", &self.users.len())
            .finish()
    }
}

impl StaticCredentialVerifier {
    pub fn new(users: impl IntoIterator<Item = (String, String)>) -> Self {
        Self {
            users: users.into_iter().collect(),
        }
    }
}

#[async_trait]
impl CredentialVerifier for StaticCredentialVerifier {
    async fn verify(&self, username: &str, password: &str) -> Result<bool, VerifyError> {
        Ok(self.users.get(username).map(String::as_str) == Some(password))
    }
}

use axum::http::HeaderValue;
use std::sync::Arc;

use crate::error::AppError;
use crate::store::{Caller, KeyStore, StoreError};

/// Result of a successful credential check.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum AuthOutcome {
    /// No `Authorization` header at all.
    Anonymous,
    Identified(Caller),
}

impl AuthOutcome {
    pub fn caller(&self) -> Option<&Caller> {
        match self {
            Self::Anonymous => None,
            Self::Identified(caller) => Some(caller),
        }
    }

    pub fn caller_id(&self) -> Option<i64> {
        self.caller().map(|c| c.id)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AuthRejection {
    Malformed,
    Unknown,
    Missing,
}

impl AuthRejection {
    pub fn code(&self) -> &'static str {
        match self {
            Self::Malformed => "malformed_credential",
            Self::Unknown => "unknown_credential",
            Self::Missing => "missing_credential",
        }
    }

    pub fn reason(&self) -> &'static str {
        match self {
            Self::Malformed => "malformed credential",
            Self::Unknown => "unknown credential",
            Self::Missing => "missing credential",
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum AuthError {
    #[error("{}", .0.reason())]
    Rejected(AuthRejection),
    #[error("key lookup failed: {0}")]
    Store(#[from] StoreError),
}

impl From<AuthError> for AppError {
    fn from(err: AuthError) -> Self {
        match err {
            AuthError::Rejected(rejection) => {
                AppError::unauthorized(rejection.code(), rejection.reason())
                    .with_param("authorization")
            }
            AuthError::Store(err) => AppError::internal("key_store_error", err.to_string()),
        }
    }
}

/// Resolves `Authorization: Bearer <key>` headers against the key store.
#[derive(Clone)]
pub struct Authenticator {
    store: Arc<dyn KeyStore>,
}

impl Authenticator {
    pub fn new(store: Arc<dyn KeyStore>) -> Self {
        Self { store }
    }

    /// Only a fully absent header is anonymous. A header that is present but
    /// malformed or unknown is always rejected.
    pub async fn authenticate(
        &self,
        header: Option<&HeaderValue>,
    ) -> Result<AuthOutcome, AuthError> {
        let Some(header) = header else {
            return Ok(AuthOutcome::Anonymous);
        };
        let token = header
            .to_str()
            .ok()
            .and_then(|value| value.strip_prefix("Bearer "))
            .ok_or(AuthError::Rejected(AuthRejection::Malformed))?;

        match self.store.lookup(token).await? {
            Some(caller) => Ok(AuthOutcome::Identified(caller)),
            None => Err(AuthError::Rejected(AuthRejection::Unknown)),
        }
    }

    /// Like [`Authenticator::authenticate`], but anonymous access is refused.
    pub async fn require(&self, header: Option<&HeaderValue>) -> Result<Caller, AuthError> {
        match self.authenticate(header).await? {
            AuthOutcome::Identified(caller) => Ok(caller),
            AuthOutcome::Anonymous => Err(AuthError::Rejected(AuthRejection::Missing)),
        }
    }
}

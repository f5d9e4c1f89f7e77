use std::cmp::Ordering;
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::broadcast;

use crate::error::BackendError;
use crate::models::{Fields, Identity};

/// Row filter for the relational backend: equality filters plus an optional
/// descending sort column.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Query {
    pub filters: Vec<(String, Value)>,
    pub order_desc: Option<String>,
}

impl Query {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn eq(mut self, column: impl Into<String>, value: impl Into<Value>) -> Self {
        self.filters.push((column.into(), value.into()));
        self
    }

    #[must_use]
    pub fn order_desc(mut self, column: impl Into<String>) -> Self {
        self.order_desc = Some(column.into());
        self
    }

    #[must_use]
    pub fn matches(&self, row: &Fields) -> bool {
        self.filters
            .iter()
            .all(|(column, value)| row.get(column) == Some(value))
    }

    /// Sort rows the way the backend would for this query.
    pub fn sort(&self, rows: &mut [Fields]) {
        if let Some(column) = &self.order_desc {
            rows.sort_by(|a, b| compare_values(b.get(column), a.get(column)));
        }
    }
}

fn compare_values(a: Option<&Value>, b: Option<&Value>) -> Ordering {
    match (a, b) {
        (Some(Value::String(a)), Some(Value::String(b))) => a.cmp(b),
        (Some(Value::Number(a)), Some(Value::Number(b))) => a
            .as_f64()
            .partial_cmp(&b.as_f64())
            .unwrap_or(Ordering::Equal),
        (Some(_), None) => Ordering::Greater,
        (None, Some(_)) => Ordering::Less,
        _ => Ordering::Equal,
    }
}

/// Table-level access to the multi-tenant relational backend.
///
/// Rows are JSON objects. Tenancy is the caller's job: the backend only sees
/// the filters it is given.
#[async_trait]
pub trait RemoteClient: Send + Sync {
    async fn select(&self, table: &str, query: &Query) -> Result<Vec<Fields>, BackendError>;

    /// Exactly one matching row. Zero (or several) rows is [`BackendError::no_rows`].
    async fn select_single(&self, table: &str, query: &Query) -> Result<Fields, BackendError>;

    async fn insert(&self, table: &str, row: Fields) -> Result<Fields, BackendError>;

    /// Insert, or merge into the row whose `on_conflict` columns all match.
    async fn upsert(
        &self,
        table: &str,
        row: Fields,
        on_conflict: &[&str],
    ) -> Result<Fields, BackendError>;

    async fn update(
        &self,
        table: &str,
        query: &Query,
        patch: Fields,
    ) -> Result<Vec<Fields>, BackendError>;

    async fn delete(&self, table: &str, query: &Query) -> Result<(), BackendError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AuthEvent {
    InitialSession,
    SignedIn,
    SignedOut,
    TokenRefreshed,
    UserUpdated,
    PasswordRecovery,
}

impl fmt::Display for AuthEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::InitialSession => "INITIAL_SESSION",
            Self::SignedIn => "SIGNED_IN",
            Self::SignedOut => "SIGNED_OUT",
            Self::TokenRefreshed => "TOKEN_REFRESHED",
            Self::UserUpdated => "USER_UPDATED",
            Self::PasswordRecovery => "PASSWORD_RECOVERY",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuthSession {
    pub access_token: String,
    #[serde(default)]
    pub refresh_token: Option<String>,
    /// Unix seconds.
    #[serde(default)]
    pub expires_at: Option<i64>,
    pub user: Identity,
}

impl AuthSession {
    #[must_use]
    pub fn is_expired(&self, now: i64) -> bool {
        self.expires_at.is_some_and(|at| at <= now)
    }
}

/// An auth state change as reported by the client.
#[derive(Debug, Clone, PartialEq)]
pub struct AuthChange {
    pub event: AuthEvent,
    pub session: Option<AuthSession>,
}

/// Sign-up yields a session right away only when the backend auto-confirms;
/// otherwise just the pending user.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SignUpResponse {
    pub user: Option<Identity>,
    pub session: Option<AuthSession>,
}

#[async_trait]
pub trait AuthClient: Send + Sync {
    async fn sign_up(
        &self,
        email: &str,
        password: &str,
        metadata: Fields,
    ) -> Result<SignUpResponse, BackendError>;

    async fn sign_in_with_password(
        &self,
        email: &str,
        password: &str,
    ) -> Result<AuthSession, BackendError>;

    /// Returns the URL the user must visit to finish signing in with `provider`.
    async fn sign_in_with_oauth(
        &self,
        provider: &str,
        redirect_to: Option<&str>,
    ) -> Result<String, BackendError>;

    /// Finish a provider sign-in from the URL the provider redirected back
    /// to. The new session is stored and announced as `SignedIn`.
    async fn complete_oauth(&self, callback_url: &str) -> Result<AuthSession, BackendError>;

    async fn sign_out(&self) -> Result<(), BackendError>;

    async fn reset_password_for_email(&self, email: &str) -> Result<(), BackendError>;

    async fn get_session(&self) -> Result<Option<AuthSession>, BackendError>;

    /// Changes the client observes on its own (token refresh, expiry, sign-out
    /// from elsewhere) and completed provider sign-ins. Results of the other
    /// calls above are returned directly.
    fn subscribe(&self) -> broadcast::Receiver<AuthChange>;
}

/// A connected backend: data and auth halves of the same client.
#[derive(Clone)]
pub struct RemoteBackend {
    pub data: Arc<dyn RemoteClient>,
    pub auth: Arc<dyn AuthClient>,
}

/// Builds a [`RemoteBackend`] from a URL and key. Absent when no client
/// implementation is available in this build.
pub trait Connector: Send + Sync {
    fn connect(&self, url: &str, key: &str) -> Result<RemoteBackend, BackendError>;
}

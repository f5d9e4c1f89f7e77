use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use chrono::{DateTime, Duration, SecondsFormat, Utc};
use serde_json::Value;
use tokio::sync::broadcast;
use uuid::Uuid;

use super::client::{
    AuthChange, AuthClient, AuthEvent, AuthSession, Connector, Query, RemoteBackend,
    RemoteClient, SignUpResponse,
};
use crate::error::BackendError;
use crate::models::{Fields, Identity};

struct Account {
    /// `None` for accounts created through a provider.
    password: Option<String>,
    identity: Identity,
}

#[derive(Default)]
struct State {
    tables: HashMap<String, Vec<Fields>>,
    accounts: HashMap<String, Account>,
    session: Option<AuthSession>,
    failing_tables: HashSet<String>,
    password_resets: Vec<String>,
    /// Provider redirect tokens not yet exchanged, by access token.
    oauth_grants: HashMap<String, Identity>,
    last_created: Option<DateTime<Utc>>,
}

/// In-process stand-in for the hosted backend: tables, accounts and an auth
/// session, all in memory. Sign-ups are confirmed immediately.
pub struct MemoryBackend {
    state: Mutex<State>,
    changes: broadcast::Sender<AuthChange>,
}

impl Default for MemoryBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryBackend {
    #[must_use]
    pub fn new() -> Self {
        let (changes, _) = broadcast::channel(32);
        Self {
            state: Mutex::new(State::default()),
            changes,
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Snapshot of every row in `table`, in insertion order.
    #[must_use]
    pub fn rows(&self, table: &str) -> Vec<Fields> {
        self.lock().tables.get(table).cloned().unwrap_or_default()
    }

    /// Make every later write to `table` fail.
    pub fn fail_writes_to(&self, table: &str) {
        self.lock().failing_tables.insert(table.to_string());
    }

    #[must_use]
    pub fn password_resets(&self) -> Vec<String> {
        self.lock().password_resets.clone()
    }

    /// Rotate the current session's token, as a background refresh would.
    pub fn refresh_session(&self) -> Option<AuthSession> {
        let session = {
            let mut state = self.lock();
            let session = state.session.as_mut()?;
            session.access_token = Uuid::new_v4().to_string();
            session.expires_at = Some((Utc::now() + Duration::hours(1)).timestamp());
            session.clone()
        };
        let _ = self.changes.send(AuthChange {
            event: AuthEvent::TokenRefreshed,
            session: Some(session.clone()),
        });
        Some(session)
    }

    /// The redirect a provider would send `email` back with after approving
    /// the sign-in. Creates the account on first use.
    pub fn oauth_redirect(&self, email: &str) -> String {
        let mut state = self.lock();
        let identity = state
            .accounts
            .entry(email.to_string())
            .or_insert_with(|| Account {
                password: None,
                identity: Identity {
                    id: Uuid::new_v4().to_string(),
                    email: Some(email.to_string()),
                },
            })
            .identity
            .clone();
        let token = Uuid::new_v4().to_string();
        state.oauth_grants.insert(token.clone(), identity);
        format!("memory://callback#access_token={token}&token_type=bearer&expires_in=3600")
    }

    /// Drop the session server-side, as when the user signs out on another device.
    pub fn revoke_session(&self) {
        self.lock().session = None;
        let _ = self.changes.send(AuthChange {
            event: AuthEvent::SignedOut,
            session: None,
        });
    }

    fn start_session(state: &mut State, identity: Identity) -> AuthSession {
        let session = AuthSession {
            access_token: Uuid::new_v4().to_string(),
            refresh_token: Some(Uuid::new_v4().to_string()),
            expires_at: Some((Utc::now() + Duration::hours(1)).timestamp()),
            user: identity,
        };
        state.session = Some(session.clone());
        session
    }
}

impl State {
    fn check_writable(&self, table: &str) -> Result<(), BackendError> {
        if self.failing_tables.contains(table) {
            return Err(BackendError::new(format!("write to {table} rejected")).with_status(500));
        }
        Ok(())
    }

    /// Strictly increasing, so newest-first ordering is total.
    fn next_timestamp(&mut self) -> String {
        let mut now = Utc::now();
        if let Some(last) = self.last_created {
            if now <= last {
                now = last + Duration::microseconds(1);
            }
        }
        self.last_created = Some(now);
        now.to_rfc3339_opts(SecondsFormat::Micros, true)
    }

    fn insert_row(&mut self, table: &str, mut row: Fields) -> Fields {
        row.entry("id")
            .or_insert_with(|| Value::String(Uuid::new_v4().to_string()));
        let created_at = self.next_timestamp();
        row.entry("created_at")
            .or_insert_with(|| Value::String(created_at));
        self.tables
            .entry(table.to_string())
            .or_default()
            .push(row.clone());
        row
    }
}

#[async_trait]
impl RemoteClient for MemoryBackend {
    async fn select(&self, table: &str, query: &Query) -> Result<Vec<Fields>, BackendError> {
        let state = self.lock();
        let mut rows: Vec<Fields> = state
            .tables
            .get(table)
            .map(|rows| rows.iter().filter(|r| query.matches(r)).cloned().collect())
            .unwrap_or_default();
        query.sort(&mut rows);
        Ok(rows)
    }

    async fn select_single(&self, table: &str, query: &Query) -> Result<Fields, BackendError> {
        let mut rows = self.select(table, query).await?;
        if rows.len() == 1 {
            Ok(rows.remove(0))
        } else {
            Err(BackendError::no_rows().with_status(406))
        }
    }

    async fn insert(&self, table: &str, row: Fields) -> Result<Fields, BackendError> {
        let mut state = self.lock();
        state.check_writable(table)?;
        Ok(state.insert_row(table, row))
    }

    async fn upsert(
        &self,
        table: &str,
        row: Fields,
        on_conflict: &[&str],
    ) -> Result<Fields, BackendError> {
        let mut state = self.lock();
        state.check_writable(table)?;
        let existing = state.tables.get_mut(table).and_then(|rows| {
            rows.iter_mut().find(|existing| {
                on_conflict
                    .iter()
                    .all(|col| row.get(*col).is_some() && existing.get(*col) == row.get(*col))
            })
        });
        if let Some(existing) = existing {
            for (key, value) in row {
                existing.insert(key, value);
            }
            return Ok(existing.clone());
        }
        Ok(state.insert_row(table, row))
    }

    async fn update(
        &self,
        table: &str,
        query: &Query,
        patch: Fields,
    ) -> Result<Vec<Fields>, BackendError> {
        let mut state = self.lock();
        state.check_writable(table)?;
        let mut updated = Vec::new();
        if let Some(rows) = state.tables.get_mut(table) {
            for row in rows.iter_mut().filter(|r| query.matches(r)) {
                for (key, value) in &patch {
                    row.insert(key.clone(), value.clone());
                }
                updated.push(row.clone());
            }
        }
        Ok(updated)
    }

    async fn delete(&self, table: &str, query: &Query) -> Result<(), BackendError> {
        let mut state = self.lock();
        state.check_writable(table)?;
        if let Some(rows) = state.tables.get_mut(table) {
            rows.retain(|r| !query.matches(r));
        }
        Ok(())
    }
}

#[async_trait]
impl AuthClient for MemoryBackend {
    async fn sign_up(
        &self,
        email: &str,
        password: &str,
        _metadata: Fields,
    ) -> Result<SignUpResponse, BackendError> {
        let mut state = self.lock();
        if state.accounts.contains_key(email) {
            return Err(BackendError::new("User already registered")
                .with_code("user_already_exists")
                .with_status(422));
        }
        let identity = Identity {
            id: Uuid::new_v4().to_string(),
            email: Some(email.to_string()),
        };
        state.accounts.insert(
            email.to_string(),
            Account {
                password: Some(password.to_string()),
                identity: identity.clone(),
            },
        );
        let session = Self::start_session(&mut state, identity.clone());
        Ok(SignUpResponse {
            user: Some(identity),
            session: Some(session),
        })
    }

    async fn sign_in_with_password(
        &self,
        email: &str,
        password: &str,
    ) -> Result<AuthSession, BackendError> {
        let mut state = self.lock();
        let identity = match state.accounts.get(email) {
            Some(account) if account.password.as_deref() == Some(password) => {
                account.identity.clone()
            }
            _ => {
                return Err(BackendError::new("Invalid login credentials")
                    .with_code("invalid_credentials")
                    .with_status(400));
            }
        };
        Ok(Self::start_session(&mut state, identity))
    }

    async fn sign_in_with_oauth(
        &self,
        provider: &str,
        redirect_to: Option<&str>,
    ) -> Result<String, BackendError> {
        let mut url = format!("memory://authorize?provider={provider}");
        if let Some(redirect) = redirect_to {
            url.push_str("&redirect_to=");
            url.push_str(redirect);
        }
        Ok(url)
    }

    async fn complete_oauth(&self, callback_url: &str) -> Result<AuthSession, BackendError> {
        let fragment = callback_url.split_once('#').map_or("", |(_, f)| f);
        let param = |name: &str| {
            fragment
                .split('&')
                .filter_map(|pair| pair.split_once('='))
                .find(|(key, _)| *key == name)
                .map(|(_, value)| value.to_string())
        };
        if let Some(error) = param("error_description").or_else(|| param("error")) {
            return Err(BackendError::new(error).with_status(400));
        }
        let session = {
            let mut state = self.lock();
            let identity = param("access_token")
                .and_then(|token| state.oauth_grants.remove(&token))
                .ok_or_else(|| {
                    BackendError::new("Invalid provider callback")
                        .with_code("bad_oauth_callback")
                        .with_status(400)
                })?;
            Self::start_session(&mut state, identity)
        };
        let _ = self.changes.send(AuthChange {
            event: AuthEvent::SignedIn,
            session: Some(session.clone()),
        });
        Ok(session)
    }

    async fn sign_out(&self) -> Result<(), BackendError> {
        self.lock().session = None;
        Ok(())
    }

    async fn reset_password_for_email(&self, email: &str) -> Result<(), BackendError> {
        self.lock().password_resets.push(email.to_string());
        Ok(())
    }

    async fn get_session(&self) -> Result<Option<AuthSession>, BackendError> {
        Ok(self.lock().session.clone())
    }

    fn subscribe(&self) -> broadcast::Receiver<AuthChange> {
        self.changes.subscribe()
    }
}

impl Connector for Arc<MemoryBackend> {
    fn connect(&self, _url: &str, _key: &str) -> Result<RemoteBackend, BackendError> {
        Ok(RemoteBackend {
            data: Arc::clone(self) as Arc<dyn RemoteClient>,
            auth: Arc::clone(self) as Arc<dyn AuthClient>,
        })
    }
}

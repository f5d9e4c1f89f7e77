//! Hosted backend client: PostgREST for tables, GoTrue for auth.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use chrono::Utc;
use reqwest::{Method, RequestBuilder, Response, Url, header};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tokio::sync::broadcast;
use tracing::{debug, warn};

use mealplan_core::error::BackendError;
use mealplan_core::models::{Fields, Identity};
use mealplan_core::remote::{
    AuthChange, AuthClient, AuthEvent, AuthSession, Connector, Query, RemoteBackend,
    RemoteClient, SignUpResponse,
};

const OBJECT_ACCEPT: &str = "application/vnd.pgrst.object+json";
const RETURN_REPRESENTATION: &str = "return=representation";
const MERGE_DUPLICATES: &str = "resolution=merge-duplicates,return=representation";

/// Error body from either PostgREST (`code`, `message`) or GoTrue
/// (`error_code`, `msg`, or the OAuth-style `error_description`).
#[derive(Debug, Default, Deserialize)]
struct ErrorBody {
    code: Option<Value>,
    error_code: Option<String>,
    message: Option<String>,
    msg: Option<String>,
    error_description: Option<String>,
    error: Option<String>,
}

impl ErrorBody {
    fn into_backend_error(self, status: u16) -> BackendError {
        let code = self.error_code.or(match self.code {
            Some(Value::String(code)) => Some(code),
            _ => None,
        });
        let message = self
            .message
            .or(self.msg)
            .or(self.error_description)
            .or(self.error)
            .unwrap_or_else(|| format!("Request failed with status {status}"));
        let mut err = BackendError::new(message).with_status(status);
        if let Some(code) = code {
            err = err.with_code(code);
        }
        err
    }
}

fn parse_error(status: u16, body: &str) -> BackendError {
    serde_json::from_str::<ErrorBody>(body)
        .unwrap_or_default()
        .into_backend_error(status)
}

fn transport(err: &reqwest::Error) -> BackendError {
    BackendError::new(format!("Failed to reach backend: {err}"))
}

/// PostgREST query parameters for `query`.
fn query_params(query: &Query) -> Vec<(String, String)> {
    let mut params: Vec<(String, String)> = query
        .filters
        .iter()
        .map(|(column, value)| {
            let text = match value {
                Value::String(s) => s.clone(),
                other => other.to_string(),
            };
            (column.clone(), format!("eq.{text}"))
        })
        .collect();
    if let Some(column) = &query.order_desc {
        params.push(("order".to_string(), format!("{column}.desc")));
    }
    params
}

/// GoTrue token grant response.
#[derive(Deserialize)]
struct TokenResponse {
    access_token: String,
    refresh_token: Option<String>,
    expires_in: Option<i64>,
    expires_at: Option<i64>,
    user: Identity,
}

impl From<TokenResponse> for AuthSession {
    fn from(t: TokenResponse) -> Self {
        let expires_at = t
            .expires_at
            .or_else(|| t.expires_in.map(|secs| Utc::now().timestamp() + secs));
        AuthSession {
            access_token: t.access_token,
            refresh_token: t.refresh_token,
            expires_at,
            user: t.user,
        }
    }
}

#[derive(Serialize)]
struct Credentials<'a> {
    email: &'a str,
    password: &'a str,
}

pub struct RestBackend {
    http: reqwest::Client,
    base: Url,
    key: String,
    session_path: Option<PathBuf>,
    session: Mutex<Option<AuthSession>>,
    changes: broadcast::Sender<AuthChange>,
}

impl RestBackend {
    pub fn new(url: &str, key: &str, session_path: Option<PathBuf>) -> Result<Self, BackendError> {
        let base = Url::parse(url.trim_end_matches('/'))
            .map_err(|e| BackendError::new(format!("Invalid backend URL '{url}': {e}")))?;
        let http = reqwest::Client::builder()
            .user_agent(format!("mealplan-cli/{}", env!("CARGO_PKG_VERSION")))
            .timeout(std::time::Duration::from_secs(15))
            .connect_timeout(std::time::Duration::from_secs(5))
            .build()
            .map_err(|e| BackendError::new(format!("Failed to build HTTP client: {e}")))?;
        let session = session_path.as_deref().and_then(load_session);
        let (changes, _) = broadcast::channel(16);
        Ok(Self {
            http,
            base,
            key: key.to_string(),
            session_path,
            session: Mutex::new(session),
            changes,
        })
    }

    fn table_url(&self, table: &str) -> Result<Url, BackendError> {
        let mut url = self.base.clone();
        url.path_segments_mut()
            .map_err(|()| BackendError::new("Backend URL cannot be a base"))?
            .pop_if_empty()
            .extend(["rest", "v1", table]);
        Ok(url)
    }

    fn auth_url(&self, endpoint: &str) -> Result<Url, BackendError> {
        let mut url = self.base.clone();
        url.path_segments_mut()
            .map_err(|()| BackendError::new("Backend URL cannot be a base"))?
            .pop_if_empty()
            .extend(["auth", "v1", endpoint]);
        Ok(url)
    }

    fn stored_session(&self) -> Option<AuthSession> {
        self.session
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn store_session(&self, session: Option<AuthSession>) {
        if let Some(path) = &self.session_path {
            if let Err(e) = save_session(path, session.as_ref()) {
                warn!(error = %e, path = %path.display(), "failed to persist auth session");
            }
        }
        *self.session.lock().unwrap_or_else(PoisonError::into_inner) = session;
    }

    fn request(&self, method: Method, url: Url, token: &str) -> RequestBuilder {
        self.http
            .request(method, url)
            .header("apikey", &self.key)
            .bearer_auth(token)
    }

    /// User token when signed in, otherwise the anonymous key. A session
    /// that cannot be refreshed fails the request rather than downgrading it.
    async fn bearer(&self) -> Result<String, BackendError> {
        Ok(match self.get_session().await? {
            Some(session) => session.access_token,
            None => self.key.clone(),
        })
    }

    async fn send(&self, builder: RequestBuilder) -> Result<Response, BackendError> {
        let response = builder.send().await.map_err(|e| transport(&e))?;
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let body = response.text().await.unwrap_or_default();
        let err = parse_error(status.as_u16(), &body);
        debug!(status = status.as_u16(), code = ?err.code, "backend request failed");
        Err(err)
    }

    async fn send_json<T: serde::de::DeserializeOwned>(
        &self,
        builder: RequestBuilder,
    ) -> Result<T, BackendError> {
        self.send(builder)
            .await?
            .json()
            .await
            .map_err(|e| BackendError::new(format!("Invalid backend response: {e}")))
    }

    async fn table_request(
        &self,
        method: Method,
        table: &str,
        query: &Query,
    ) -> Result<RequestBuilder, BackendError> {
        let url = self.table_url(table)?;
        let token = self.bearer().await?;
        Ok(self.request(method, url, &token).query(&query_params(query)))
    }

    async fn refresh(&self, refresh_token: &str) -> Result<AuthSession, BackendError> {
        let mut url = self.auth_url("token")?;
        url.query_pairs_mut().append_pair("grant_type", "refresh_token");
        let builder = self
            .request(Method::POST, url, &self.key)
            .json(&json!({ "refresh_token": refresh_token }));
        let token: TokenResponse = self.send_json(builder).await?;
        Ok(token.into())
    }

    async fn password_grant(
        &self,
        email: &str,
        password: &str,
    ) -> Result<AuthSession, BackendError> {
        let mut url = self.auth_url("token")?;
        url.query_pairs_mut().append_pair("grant_type", "password");
        let builder = self
            .request(Method::POST, url, &self.key)
            .json(&Credentials { email, password });
        let token: TokenResponse = self.send_json(builder).await?;
        Ok(token.into())
    }

    fn emit(&self, event: AuthEvent, session: Option<AuthSession>) {
        let _ = self.changes.send(AuthChange { event, session });
    }
}

/// Parameters of a provider redirect. Tokens arrive in the fragment, errors
/// in either part.
fn callback_params(callback: &Url) -> Vec<(String, String)> {
    let mut params: Vec<(String, String)> = callback.query_pairs().into_owned().collect();
    if let Some(fragment) = callback.fragment() {
        let mut decoded = callback.clone();
        decoded.set_query(Some(fragment));
        params.extend(decoded.query_pairs().into_owned());
    }
    params
}

fn load_session(path: &Path) -> Option<AuthSession> {
    let raw = std::fs::read_to_string(path).ok()?;
    match serde_json::from_str(&raw) {
        Ok(session) => Some(session),
        Err(e) => {
            warn!(error = %e, path = %path.display(), "ignoring unreadable session file");
            None
        }
    }
}

fn save_session(path: &Path, session: Option<&AuthSession>) -> std::io::Result<()> {
    let Some(session) = session else {
        return match std::fs::remove_file(path) {
            Err(e) if e.kind() != std::io::ErrorKind::NotFound => Err(e),
            _ => Ok(()),
        };
    };
    let raw = serde_json::to_string_pretty(session)?;
    std::fs::write(path, raw)?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))?;
    }
    Ok(())
}

#[async_trait]
impl RemoteClient for RestBackend {
    async fn select(&self, table: &str, query: &Query) -> Result<Vec<Fields>, BackendError> {
        let builder = self.table_request(Method::GET, table, query).await?;
        self.send_json(builder.query(&[("select", "*")])).await
    }

    async fn select_single(&self, table: &str, query: &Query) -> Result<Fields, BackendError> {
        let builder = self.table_request(Method::GET, table, query).await?;
        self.send_json(
            builder
                .query(&[("select", "*")])
                .header(header::ACCEPT, OBJECT_ACCEPT),
        )
        .await
    }

    async fn insert(&self, table: &str, row: Fields) -> Result<Fields, BackendError> {
        let builder = self
            .table_request(Method::POST, table, &Query::new())
            .await?
            .header("Prefer", RETURN_REPRESENTATION)
            .header(header::ACCEPT, OBJECT_ACCEPT)
            .json(&row);
        self.send_json(builder).await
    }

    async fn upsert(
        &self,
        table: &str,
        row: Fields,
        on_conflict: &[&str],
    ) -> Result<Fields, BackendError> {
        let builder = self
            .table_request(Method::POST, table, &Query::new())
            .await?
            .query(&[("on_conflict", on_conflict.join(","))])
            .header("Prefer", MERGE_DUPLICATES)
            .header(header::ACCEPT, OBJECT_ACCEPT)
            .json(&row);
        self.send_json(builder).await
    }

    async fn update(
        &self,
        table: &str,
        query: &Query,
        patch: Fields,
    ) -> Result<Vec<Fields>, BackendError> {
        let builder = self
            .table_request(Method::PATCH, table, query)
            .await?
            .header("Prefer", RETURN_REPRESENTATION)
            .json(&patch);
        self.send_json(builder).await
    }

    async fn delete(&self, table: &str, query: &Query) -> Result<(), BackendError> {
        let builder = self.table_request(Method::DELETE, table, query).await?;
        self.send(builder).await?;
        Ok(())
    }
}

#[async_trait]
impl AuthClient for RestBackend {
    async fn sign_up(
        &self,
        email: &str,
        password: &str,
        metadata: Fields,
    ) -> Result<SignUpResponse, BackendError> {
        let url = self.auth_url("signup")?;
        let builder = self.request(Method::POST, url, &self.key).json(&json!({
            "email": email,
            "password": password,
            "data": metadata,
        }));
        let body: Value = self.send_json(builder).await?;

        // Auto-confirmed projects answer with a session, others with the bare user.
        if body.get("access_token").is_some() {
            let token: TokenResponse = serde_json::from_value(body)
                .map_err(|e| BackendError::new(format!("Invalid sign-up response: {e}")))?;
            let session = AuthSession::from(token);
            self.store_session(Some(session.clone()));
            return Ok(SignUpResponse {
                user: Some(session.user.clone()),
                session: Some(session),
            });
        }
        let user: Identity = serde_json::from_value(body)
            .map_err(|e| BackendError::new(format!("Invalid sign-up response: {e}")))?;
        Ok(SignUpResponse {
            user: Some(user),
            session: None,
        })
    }

    async fn sign_in_with_password(
        &self,
        email: &str,
        password: &str,
    ) -> Result<AuthSession, BackendError> {
        let session = self.password_grant(email, password).await?;
        self.store_session(Some(session.clone()));
        Ok(session)
    }

    async fn sign_in_with_oauth(
        &self,
        provider: &str,
        redirect_to: Option<&str>,
    ) -> Result<String, BackendError> {
        let mut url = self.auth_url("authorize")?;
        {
            let mut pairs = url.query_pairs_mut();
            pairs.append_pair("provider", provider);
            if let Some(redirect) = redirect_to {
                pairs.append_pair("redirect_to", redirect);
            }
        }
        Ok(url.to_string())
    }

    async fn complete_oauth(&self, callback_url: &str) -> Result<AuthSession, BackendError> {
        let callback = Url::parse(callback_url)
            .map_err(|e| BackendError::new(format!("Invalid callback URL: {e}")))?;
        let params = callback_params(&callback);
        let param = |name: &str| {
            params
                .iter()
                .find(|(key, _)| key == name)
                .map(|(_, value)| value.clone())
        };
        if let Some(error) = param("error_description").or_else(|| param("error")) {
            return Err(BackendError::new(error).with_status(400));
        }
        let access_token = param("access_token").ok_or_else(|| {
            BackendError::new("Callback URL carries no access token")
                .with_code("bad_oauth_callback")
                .with_status(400)
        })?;

        let url = self.auth_url("user")?;
        let user: Identity = self
            .send_json(self.request(Method::GET, url, &access_token))
            .await?;
        let session = AuthSession::from(TokenResponse {
            access_token,
            refresh_token: param("refresh_token"),
            expires_in: param("expires_in").and_then(|v| v.parse().ok()),
            expires_at: param("expires_at").and_then(|v| v.parse().ok()),
            user,
        });
        self.store_session(Some(session.clone()));
        self.emit(AuthEvent::SignedIn, Some(session.clone()));
        Ok(session)
    }

    async fn sign_out(&self) -> Result<(), BackendError> {
        if let Some(session) = self.stored_session() {
            let url = self.auth_url("logout")?;
            let result = self
                .send(self.request(Method::POST, url, &session.access_token))
                .await;
            // An already-invalid token still ends the local session.
            if let Err(e) = result {
                if !matches!(e.status, Some(401 | 403 | 404)) {
                    return Err(e);
                }
                debug!(error = %e, "logout rejected, clearing session anyway");
            }
        }
        self.store_session(None);
        Ok(())
    }

    async fn reset_password_for_email(&self, email: &str) -> Result<(), BackendError> {
        let url = self.auth_url("recover")?;
        let builder = self
            .request(Method::POST, url, &self.key)
            .json(&json!({ "email": email }));
        self.send(builder).await?;
        Ok(())
    }

    /// The stored session, refreshed first if it has expired.
    async fn get_session(&self) -> Result<Option<AuthSession>, BackendError> {
        let Some(session) = self.stored_session() else {
            return Ok(None);
        };
        if !session.is_expired(Utc::now().timestamp()) {
            return Ok(Some(session));
        }
        let Some(refresh_token) = session.refresh_token.as_deref() else {
            self.store_session(None);
            self.emit(AuthEvent::SignedOut, None);
            return Ok(None);
        };
        match self.refresh(refresh_token).await {
            Ok(fresh) => {
                self.store_session(Some(fresh.clone()));
                self.emit(AuthEvent::TokenRefreshed, Some(fresh.clone()));
                Ok(Some(fresh))
            }
            Err(e) if matches!(e.status, Some(400 | 401)) => {
                warn!(error = %e, "session refresh rejected, signing out");
                self.store_session(None);
                self.emit(AuthEvent::SignedOut, None);
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }

    fn subscribe(&self) -> broadcast::Receiver<AuthChange> {
        self.changes.subscribe()
    }
}

/// Connects to a hosted backend over HTTPS, keeping the auth session in
/// `session_path` between runs.
pub struct RestConnector {
    pub session_path: Option<PathBuf>,
}

impl Connector for RestConnector {
    fn connect(&self, url: &str, key: &str) -> Result<RemoteBackend, BackendError> {
        let backend = Arc::new(RestBackend::new(url, key, self.session_path.clone())?);
        Ok(RemoteBackend {
            data: Arc::clone(&backend) as Arc<dyn RemoteClient>,
            auth: backend,
        })
    }
}

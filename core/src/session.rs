//! Authenticated identity and backend availability.
//!
//! [`SessionManager`] is the only writer of [`Session`]. Everything else reads
//! a snapshot, watches for the latest value, or subscribes to transitions.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, OnceLock, PoisonError, Weak};

use serde::Serialize;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, instrument, warn};

use crate::error::{Result, StoreError};
use crate::models::{Fields, Identity};
use crate::remote::{
    AuthChange, AuthEvent, Connector, RemoteBackend, RemoteStore, SignUpResponse,
};

/// Where the remote backend lives. Both values are needed to go remote.
#[derive(Debug, Clone, Default)]
pub struct BackendConfig {
    pub url: Option<String>,
    pub key: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct Session {
    pub user: Option<Identity>,
    pub backend_ready: bool,
}

impl Session {
    #[must_use]
    pub fn is_authenticated(&self) -> bool {
        self.user.is_some()
    }
}

/// Published on every session transition.
#[derive(Debug, Clone, PartialEq)]
pub struct AuthNotification {
    pub event: AuthEvent,
    pub user: Option<Identity>,
}

pub struct SessionManager {
    state: watch::Sender<Session>,
    notifications: broadcast::Sender<AuthNotification>,
    backend: OnceLock<RemoteBackend>,
    attempted: AtomicBool,
    listener: Mutex<Option<JoinHandle<()>>>,
}

impl SessionManager {
    #[must_use]
    pub fn new() -> Arc<Self> {
        let (state, _) = watch::channel(Session::default());
        let (notifications, _) = broadcast::channel(64);
        Arc::new(Self {
            state,
            notifications,
            backend: OnceLock::new(),
            attempted: AtomicBool::new(false),
            listener: Mutex::new(None),
        })
    }

    /// Try once to bring up the remote backend.
    ///
    /// Returns whether the backend is ready. Any missing piece, or a failure
    /// connecting or reading the first session, leaves the manager local-only
    /// for good; later calls return the outcome of the first.
    #[instrument(skip_all)]
    pub async fn initialize(
        self: &Arc<Self>,
        config: &BackendConfig,
        connector: Option<&dyn Connector>,
    ) -> bool {
        if self.attempted.swap(true, Ordering::SeqCst) {
            debug!("backend initialization already attempted");
            return self.is_backend_ready();
        }

        let (Some(url), Some(key), Some(connector)) =
            (config.url.as_deref(), config.key.as_deref(), connector)
        else {
            warn!(
                url = config.url.is_some(),
                key = config.key.is_some(),
                connector = connector.is_some(),
                "remote backend not configured, using local storage"
            );
            return false;
        };

        let backend = match connector.connect(url, key) {
            Ok(backend) => backend,
            Err(e) => {
                warn!(error = %e, "failed to create backend client, using local storage");
                return false;
            }
        };

        let changes = backend.auth.subscribe();
        let initial = match backend.auth.get_session().await {
            Ok(session) => session,
            Err(e) => {
                warn!(error = %e, "failed to read current session, using local storage");
                return false;
            }
        };

        if self.backend.set(backend).is_err() {
            return self.is_backend_ready();
        }
        self.state.send_modify(|s| s.backend_ready = true);
        info!(url, "remote backend ready");

        self.apply(AuthEvent::InitialSession, initial.map(|s| s.user));
        self.spawn_listener(changes);
        true
    }

    fn spawn_listener(self: &Arc<Self>, mut changes: broadcast::Receiver<AuthChange>) {
        let weak: Weak<Self> = Arc::downgrade(self);
        let handle = tokio::spawn(async move {
            loop {
                match changes.recv().await {
                    Ok(change) => {
                        let Some(manager) = weak.upgrade() else { break };
                        manager.apply(change.event, change.session.map(|s| s.user));
                    }
                    Err(RecvError::Lagged(skipped)) => {
                        warn!(skipped, "auth change stream lagged");
                    }
                    Err(RecvError::Closed) => break,
                }
            }
        });
        *self.listener.lock().unwrap_or_else(PoisonError::into_inner) = Some(handle);
    }

    /// Record a new identity and notify subscribers if it is a transition.
    fn apply(&self, event: AuthEvent, user: Option<Identity>) {
        let changed = self.state.send_if_modified(|s| {
            if s.user == user {
                false
            } else {
                s.user.clone_from(&user);
                true
            }
        });
        if !changed && event != AuthEvent::TokenRefreshed {
            return;
        }
        debug!(%event, user = user.as_ref().map(|u| u.id.as_str()), "session transition");
        // No subscribers is fine.
        let _ = self.notifications.send(AuthNotification { event, user });
    }

    fn backend(&self) -> Result<&RemoteBackend> {
        self.backend.get().ok_or(StoreError::Configuration)
    }

    // --- Observation ---

    #[must_use]
    pub fn snapshot(&self) -> Session {
        self.state.borrow().clone()
    }

    #[must_use]
    pub fn watch(&self) -> watch::Receiver<Session> {
        self.state.subscribe()
    }

    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<AuthNotification> {
        self.notifications.subscribe()
    }

    #[must_use]
    pub fn is_backend_ready(&self) -> bool {
        self.state.borrow().backend_ready
    }

    #[must_use]
    pub fn current_user(&self) -> Option<Identity> {
        self.state.borrow().user.clone()
    }

    #[must_use]
    pub fn is_authenticated(&self) -> bool {
        self.state.borrow().is_authenticated()
    }

    /// The data half of the backend, if it came up.
    #[must_use]
    pub fn remote_store(&self) -> Option<RemoteStore> {
        self.backend
            .get()
            .map(|backend| RemoteStore::new(Arc::clone(&backend.data)))
    }

    // --- Auth operations ---

    #[instrument(skip(self, password, metadata))]
    pub async fn sign_up(
        &self,
        email: &str,
        password: &str,
        metadata: Fields,
    ) -> Result<SignUpResponse> {
        let backend = self.backend()?;
        let response = backend.auth.sign_up(email, password, metadata).await?;
        if let Some(session) = &response.session {
            self.apply(AuthEvent::SignedIn, Some(session.user.clone()));
        } else {
            info!("sign-up pending confirmation");
        }
        Ok(response)
    }

    #[instrument(skip(self, password))]
    pub async fn sign_in(&self, email: &str, password: &str) -> Result<Identity> {
        let backend = self.backend()?;
        let session = backend.auth.sign_in_with_password(email, password).await?;
        self.apply(AuthEvent::SignedIn, Some(session.user.clone()));
        Ok(session.user)
    }

    /// Start a provider sign-in. Returns the URL to open; pass the URL the
    /// provider redirects back to into [`Self::complete_provider_sign_in`].
    #[instrument(skip(self))]
    pub async fn sign_in_with_provider(
        &self,
        provider: &str,
        redirect_to: Option<&str>,
    ) -> Result<String> {
        let backend = self.backend()?;
        Ok(backend.auth.sign_in_with_oauth(provider, redirect_to).await?)
    }

    #[instrument(skip_all)]
    pub async fn complete_provider_sign_in(&self, callback_url: &str) -> Result<Identity> {
        let backend = self.backend()?;
        let session = backend.auth.complete_oauth(callback_url).await?;
        self.apply(AuthEvent::SignedIn, Some(session.user.clone()));
        Ok(session.user)
    }

    #[instrument(skip(self))]
    pub async fn sign_out(&self) -> Result<()> {
        let backend = self.backend()?;
        backend.auth.sign_out().await?;
        self.apply(AuthEvent::SignedOut, None);
        Ok(())
    }

    #[instrument(skip(self))]
    pub async fn reset_password(&self, email: &str) -> Result<()> {
        let backend = self.backend()?;
        backend.auth.reset_password_for_email(email).await?;
        Ok(())
    }
}

impl Drop for SessionManager {
    fn drop(&mut self) {
        if let Some(handle) = self
            .listener
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            handle.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::error::BackendError;
    use crate::remote::MemoryBackend;
    use crate::remote::AuthClient;

    fn config() -> BackendConfig {
        BackendConfig {
            url: Some("memory://".to_string()),
            key: Some("anon".to_string()),
        }
    }

    async fn ready_manager() -> (Arc<SessionManager>, Arc<MemoryBackend>) {
        let backend = Arc::new(MemoryBackend::new());
        let manager = SessionManager::new();
        assert!(manager.initialize(&config(), Some(&backend)).await);
        (manager, backend)
    }

    async fn next(rx: &mut broadcast::Receiver<AuthNotification>) -> AuthNotification {
        tokio::time::timeout(Duration::from_secs(1), rx.recv())
            .await
            .expect("notification")
            .unwrap()
    }

    struct FailingConnector;

    impl Connector for FailingConnector {
        fn connect(
            &self,
            _url: &str,
            _key: &str,
        ) -> std::result::Result<RemoteBackend, BackendError> {
            Err(BackendError::new("client library unavailable"))
        }
    }

    #[tokio::test]
    async fn test_auth_ops_fail_without_backend() {
        let manager = SessionManager::new();
        assert!(!manager.initialize(&BackendConfig::default(), None).await);
        let before = manager.snapshot();

        assert!(matches!(
            manager.sign_up("a@b.c", "pw", Fields::new()).await,
            Err(StoreError::Configuration)
        ));
        assert!(matches!(
            manager.sign_in("a@b.c", "pw").await,
            Err(StoreError::Configuration)
        ));
        assert!(matches!(
            manager.sign_in_with_provider("github", None).await,
            Err(StoreError::Configuration)
        ));
        assert!(matches!(
            manager.complete_provider_sign_in("memory://callback#access_token=t").await,
            Err(StoreError::Configuration)
        ));
        assert!(matches!(manager.sign_out().await, Err(StoreError::Configuration)));
        assert!(matches!(
            manager.reset_password("a@b.c").await,
            Err(StoreError::Configuration)
        ));

        assert_eq!(manager.snapshot(), before);
        assert!(manager.remote_store().is_none());
    }

    #[tokio::test]
    async fn test_initialize_is_attempted_once() {
        let backend = Arc::new(MemoryBackend::new());
        let manager = SessionManager::new();
        assert!(!manager.initialize(&config(), None).await);
        assert!(!manager.initialize(&config(), Some(&backend)).await);
        assert!(!manager.is_backend_ready());
    }

    #[tokio::test]
    async fn test_initialize_requires_url_and_key() {
        let backend = Arc::new(MemoryBackend::new());
        let manager = SessionManager::new();
        let config = BackendConfig {
            url: Some("memory://".to_string()),
            key: None,
        };
        assert!(!manager.initialize(&config, Some(&backend)).await);
    }

    #[tokio::test]
    async fn test_connect_failure_stays_local() {
        let manager = SessionManager::new();
        assert!(!manager.initialize(&config(), Some(&FailingConnector)).await);
        assert!(matches!(manager.sign_out().await, Err(StoreError::Configuration)));
    }

    #[tokio::test]
    async fn test_initialize_picks_up_existing_session() {
        let backend = Arc::new(MemoryBackend::new());
        backend
            .sign_up("sam@example.com", "pw", Fields::new())
            .await
            .unwrap();

        let manager = SessionManager::new();
        assert!(manager.initialize(&config(), Some(&backend)).await);
        let session = manager.snapshot();
        assert!(session.backend_ready);
        assert_eq!(
            session.user.and_then(|u| u.email).as_deref(),
            Some("sam@example.com")
        );
    }

    #[tokio::test]
    async fn test_sign_in_and_out_publish() {
        let (manager, _backend) = ready_manager().await;
        let mut rx = manager.subscribe();
        let mut watcher = manager.watch();

        manager
            .sign_up("sam@example.com", "pw", Fields::new())
            .await
            .unwrap();
        let n = next(&mut rx).await;
        assert_eq!(n.event, AuthEvent::SignedIn);
        assert!(watcher.has_changed().unwrap());
        assert!(watcher.borrow_and_update().is_authenticated());

        manager.sign_out().await.unwrap();
        let n = next(&mut rx).await;
        assert_eq!(n.event, AuthEvent::SignedOut);
        assert!(n.user.is_none());
        assert!(!manager.is_authenticated());

        let user = manager.sign_in("sam@example.com", "pw").await.unwrap();
        assert_eq!(manager.current_user(), Some(user));
        assert_eq!(next(&mut rx).await.event, AuthEvent::SignedIn);
    }

    #[tokio::test]
    async fn test_failed_sign_in_propagates_backend_error() {
        let (manager, _backend) = ready_manager().await;
        let err = manager.sign_in("nobody@example.com", "pw").await.unwrap_err();
        match err {
            StoreError::Backend(e) => assert_eq!(e.code.as_deref(), Some("invalid_credentials")),
            other => panic!("unexpected error: {other:?}"),
        }
        assert!(!manager.is_authenticated());
    }

    #[tokio::test]
    async fn test_backend_changes_reach_subscribers() {
        let (manager, backend) = ready_manager().await;
        manager
            .sign_up("sam@example.com", "pw", Fields::new())
            .await
            .unwrap();
        let mut rx = manager.subscribe();

        backend.refresh_session().unwrap();
        let n = next(&mut rx).await;
        assert_eq!(n.event, AuthEvent::TokenRefreshed);
        assert!(n.user.is_some());

        backend.revoke_session();
        let n = next(&mut rx).await;
        assert_eq!(n.event, AuthEvent::SignedOut);
        assert!(!manager.is_authenticated());
    }

    #[tokio::test]
    async fn test_oauth_returns_authorize_url() {
        let (manager, _backend) = ready_manager().await;
        let url = manager
            .sign_in_with_provider("github", Some("http://localhost:3000"))
            .await
            .unwrap();
        assert!(url.contains("provider=github"));
        assert!(!manager.is_authenticated());
    }

    #[tokio::test]
    async fn test_reset_password_reaches_backend() {
        let (manager, backend) = ready_manager().await;
        manager.reset_password("sam@example.com").await.unwrap();
        assert_eq!(backend.password_resets(), vec!["sam@example.com".to_string()]);
    }

    #[tokio::test]
    async fn test_provider_callback_signs_in_once() {
        let (manager, backend) = ready_manager().await;
        let mut rx = manager.subscribe();
        manager.sign_in_with_provider("github", None).await.unwrap();
        let callback = backend.oauth_redirect("kim@example.com");

        let user = manager.complete_provider_sign_in(&callback).await.unwrap();
        assert_eq!(user.email.as_deref(), Some("kim@example.com"));
        assert_eq!(manager.current_user(), Some(user.clone()));

        let n = next(&mut rx).await;
        assert_eq!(n.event, AuthEvent::SignedIn);
        assert_eq!(n.user, Some(user));
        // The backend's own SIGNED_IN echo carries the same user.
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(matches!(rx.try_recv(), Err(broadcast::error::TryRecvError::Empty)));
    }

    #[tokio::test]
    async fn test_bad_provider_callback_leaves_session_alone() {
        let (manager, _backend) = ready_manager().await;
        let err = manager
            .complete_provider_sign_in("memory://callback#error=access_denied")
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::Backend(e) if e.message == "access_denied"));
        assert!(!manager.is_authenticated());
    }
}

//! Per-API-key session discovery, creation and teardown.

use reqwest::Client;

use super::backend::SessionBackend;
use super::store::{Session, SessionStore};
use crate::config::{OmniConfig, MANUAL_SESSION_ID_VAR, MANUAL_USER_ID_VAR};
use crate::error::Result;
use crate::omni::client::OmniClient;

/// Resolves the backend session to use for each caller.
///
/// Lookup order: the operator-supplied manual session, then a fresh cached
/// session for the key, then a newly created one. Created sessions are only
/// cached once the system prompt is registered.
pub struct SessionManager {
    store: SessionStore,
    backend: SessionBackend,
    omni: OmniClient,
    manual: Option<Session>,
}

impl SessionManager {
    pub fn new(http: Client, config: &OmniConfig, omni: OmniClient) -> Self {
        let manual = config.manual_session.as_ref().map(Session::manual);
        if let Some(session) = &manual {
            tracing::info!(
                session_id = %session.session_id,
                source = %config.manual_source,
                "Using manual session"
            );
        }

        Self {
            store: SessionStore::new(config.freshness()),
            backend: SessionBackend::new(http, config),
            omni,
            manual,
        }
    }

    pub fn manual_session(&self) -> Option<&Session> {
        self.manual.as_ref()
    }

    /// Number of cached sessions.
    pub async fn cached(&self) -> usize {
        self.store.occupied().await
    }

    /// Number of API keys with an entry in the table, occupied or not.
    pub fn tracked_keys(&self) -> usize {
        self.store.keys().len()
    }

    /// Session for `api_key`, creating one if none is fresh.
    #[tracing::instrument(skip(self, api_key))]
    pub async fn get_or_create(&self, api_key: &str) -> Result<Session> {
        if let Some(manual) = &self.manual {
            tracing::debug!(session_id = %manual.session_id, "Manual session");
            return Ok(manual.clone());
        }

        let mut slot = self.store.lock(api_key).await;

        if let Some(session) = slot.as_ref() {
            if self.store.is_fresh(session) {
                tracing::debug!(
                    session_id = %session.session_id,
                    age_secs = session.age().as_secs(),
                    "Reusing cached session"
                );
                return Ok(session.clone());
            }
        }

        if let Some(stale) = slot.take() {
            tracing::info!(
                session_id = %stale.session_id,
                age_secs = stale.age().as_secs(),
                "Cached session expired"
            );
            self.logout_quietly(&stale).await;
        }

        self.advise_busy().await;

        match self.create().await {
            Ok(session) => {
                *slot = Some(session.clone());
                Ok(session)
            }
            Err(e) => {
                drop(slot);
                self.store.release_if_idle(api_key);
                Err(e)
            }
        }
    }

    /// Log in and register the system prompt, rolling back on failure.
    async fn create(&self) -> Result<Session> {
        tracing::info!("Creating session");
        let session = self.backend.login().await?;

        if let Err(e) = self.omni.init_system_prompt(&session.session_id).await {
            tracing::warn!(session_id = %session.session_id, "Rolling back half-initialized session");
            self.logout_quietly(&session).await;
            return Err(e);
        }

        tracing::info!(
            session_id = %session.session_id,
            user_id = %session.user_id,
            created_at = %session.created_at,
            "Session created"
        );
        Ok(session)
    }

    /// Point the operator at a busy session they could adopt manually.
    async fn advise_busy(&self) {
        match self.backend.busy_services().await {
            Ok(busy) => {
                if let Some(first) = busy.first() {
                    let locked_by = first.locked_by.as_deref().unwrap_or("<unknown>");
                    tracing::warn!(
                        locked_by,
                        busy = busy.len(),
                        "Backend already has a busy session; to reuse it set {}=\"{}\" and {}=\"<session_id>\"",
                        MANUAL_USER_ID_VAR,
                        locked_by,
                        MANUAL_SESSION_ID_VAR,
                    );
                }
            }
            Err(e) => tracing::debug!(error = %e, "Busy session check failed"),
        }
    }

    async fn logout_quietly(&self, session: &Session) {
        if let Err(e) = self.backend.logout(session).await {
            tracing::warn!(session_id = %session.session_id, error = %e, "Logout failed");
        }
    }

    /// Tear down the session cached for `api_key`.
    ///
    /// Returns whether a session was released. Manual sessions are never
    /// touched.
    pub async fn cleanup(&self, api_key: &str) -> bool {
        if self.manual.is_some() {
            tracing::info!("Skipping teardown of manual session");
            return false;
        }

        match self.store.take(api_key).await {
            Some(session) => {
                self.logout_quietly(&session).await;
                tracing::info!(session_id = %session.session_id, "Session released");
                true
            }
            None => false,
        }
    }

    /// Tear down every cached session.
    pub async fn cleanup_all(&self) -> usize {
        let mut released = 0;
        for key in self.store.keys() {
            if self.cleanup(&key).await {
                released += 1;
            }
        }
        released
    }
}

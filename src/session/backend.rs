//! Client for the login/logout session service.

use std::time::Duration;

use reqwest::Client;
use serde::{Deserialize, Serialize};

use super::store::Session;
use crate::config::{OmniConfig, SessionToken};
use crate::error::{Error, Result};

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct LoginRequest<'a> {
    model_type: &'a str,
    session_type: &'a str,
    service_name: &'a str,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct LoginResponse {
    #[serde(default)]
    success: bool,
    user_id: Option<String>,
    session_id: Option<String>,
    token: Option<String>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct LogoutRequest<'a> {
    user_id: &'a str,
    token: &'a str,
}

#[derive(Debug, Deserialize)]
struct ServiceListing {
    #[serde(default)]
    services: Vec<ServiceEntry>,
}

/// One entry of the inference service listing.
#[derive(Debug, Clone, Deserialize)]
pub struct ServiceEntry {
    #[serde(default)]
    pub status: String,
    pub locked_by: Option<String>,
}

/// Client for `/api/*` on the session service.
#[derive(Clone)]
pub struct SessionBackend {
    http: Client,
    base_url: String,
    login_timeout: Duration,
    services_timeout: Duration,
    model_type: String,
    session_type: String,
    service_name: String,
}

impl SessionBackend {
    pub fn new(http: Client, config: &OmniConfig) -> Self {
        Self {
            http,
            base_url: config.session_url.trim_end_matches('/').to_string(),
            login_timeout: config.login_timeout(),
            services_timeout: config.services_timeout(),
            model_type: config.model_type.clone(),
            session_type: config.session_type.clone(),
            service_name: config.service_name.clone(),
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}/api/{}", self.base_url, path)
    }

    /// Create a backend session.
    pub async fn login(&self) -> Result<Session> {
        let body = LoginRequest {
            model_type: &self.model_type,
            session_type: &self.session_type,
            service_name: &self.service_name,
        };

        let response = self
            .http
            .post(self.url("login"))
            .json(&body)
            .timeout(self.login_timeout)
            .send()
            .await
            .map_err(|e| Error::Session(format!("Session creation failed: {}", e)))?;

        let status = response.status();
        tracing::debug!(status = %status, "Login response");

        if !status.is_success() {
            let detail = response.text().await.unwrap_or_default();
            return Err(Error::Session(format!(
                "Failed to create session (status {}): {}",
                status.as_u16(),
                detail
            )));
        }

        let data: LoginResponse = response
            .json()
            .await
            .map_err(|e| Error::Session(format!("Session creation failed: {}", e)))?;

        if !data.success {
            return Err(Error::Session("Failed to create session".to_string()));
        }

        match (data.user_id, data.session_id) {
            (Some(user_id), Some(session_id)) => Ok(Session::created(
                user_id,
                session_id,
                SessionToken::from(data.token.unwrap_or_default()),
            )),
            _ => Err(Error::Session(
                "Session creation failed: login response missing userId or sessionId".to_string(),
            )),
        }
    }

    /// Tear down a session. Callers treat failures as best-effort.
    pub async fn logout(&self, session: &Session) -> Result<()> {
        let body = LogoutRequest {
            user_id: &session.user_id,
            token: session.token.expose_secret(),
        };

        let response = self
            .http
            .post(self.url("logout"))
            .json(&body)
            .timeout(self.login_timeout)
            .send()
            .await
            .map_err(|e| Error::Session(format!("Logout failed: {}", e)))?;

        if !response.status().is_success() {
            return Err(Error::Session(format!(
                "Logout failed (status {})",
                response.status().as_u16()
            )));
        }
        Ok(())
    }

    /// Services currently marked busy by another caller.
    pub async fn busy_services(&self) -> Result<Vec<ServiceEntry>> {
        let response = self
            .http
            .get(self.url("inference/services"))
            .timeout(self.services_timeout)
            .send()
            .await
            .map_err(|e| Error::Session(format!("Service listing failed: {}", e)))?;

        if !response.status().is_success() {
            return Ok(Vec::new());
        }

        let listing: ServiceListing = response
            .json()
            .await
            .map_err(|e| Error::Session(format!("Service listing unreadable: {}", e)))?;

        Ok(listing
            .services
            .into_iter()
            .filter(|s| s.status == "busy")
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn login_body_is_camel_case() {
        let body = LoginRequest {
            model_type: "duplex",
            session_type: "release",
            service_name: "o45-cpp",
        };
        assert_eq!(
            serde_json::to_value(&body).unwrap(),
            serde_json::json!({
                "modelType": "duplex",
                "sessionType": "release",
                "serviceName": "o45-cpp"
            })
        );
    }

    #[test]
    fn login_response_tolerates_missing_success() {
        let data: LoginResponse =
            serde_json::from_str(r#"{"userId": "u", "sessionId": "s"}"#).unwrap();
        assert!(!data.success);
        assert!(data.token.is_none());
    }

    #[test]
    fn service_listing_defaults() {
        let listing: ServiceListing = serde_json::from_str(
            r#"{"services": [{"status": "busy", "locked_by": "u1"}, {"name": "idle"}]}"#,
        )
        .unwrap();
        assert_eq!(listing.services.len(), 2);
        assert_eq!(listing.services[0].locked_by.as_deref(), Some("u1"));
        assert_eq!(listing.services[1].status, "");
    }
}

//! Configuration parsing and validation for minicpm-adapter.

use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::path::Path;
use std::time::Duration;

/// Conventional env var holding a manually supplied backend session id.
pub const MANUAL_SESSION_ID_VAR: &str = "MINICPM_SESSION_ID";
/// Conventional env var holding the user id owning the manual session.
pub const MANUAL_USER_ID_VAR: &str = "MINICPM_USER_ID";
/// Conventional env var holding the manual session token (optional).
pub const MANUAL_TOKEN_VAR: &str = "MINICPM_TOKEN";

/// Root configuration structure.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub backend: BackendConfig,
    pub omni: Option<OmniConfig>,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// How `/v1/chat/completions` is served.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GatewayMode {
    /// Rewrite the model name and forward to the chat-completions backend.
    #[default]
    Passthrough,
    /// Session-backed prefill/generate against the omni inference service.
    Omni,
}

impl std::fmt::Display for GatewayMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            GatewayMode::Passthrough => write!(f, "passthrough"),
            GatewayMode::Omni => write!(f, "omni"),
        }
    }
}

/// HTTP server configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    /// Address to listen on (e.g., "0.0.0.0:8080")
    #[serde(default = "default_listen")]
    pub listen: String,
    #[serde(default)]
    pub mode: GatewayMode,
}

fn default_listen() -> String {
    "0.0.0.0:8080".to_string()
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            mode: GatewayMode::default(),
        }
    }
}

/// The chat-completions backend (llama-server) the gateway forwards to.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct BackendConfig {
    /// Base URL, without the `/v1/...` suffix.
    pub url: String,
    /// Model name written into every outbound request.
    pub model: String,
    /// Model id advertised on `/v1/models`.
    pub public_model: String,
    pub owned_by: String,
    /// Unix timestamp advertised for the public model.
    pub created: u64,
    pub timeout_secs: u64,
    pub health_timeout_secs: u64,
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            url: "http://localhost:19060".to_string(),
            model: "MiniCPM-o-4.5".to_string(),
            public_model: "minicpm-o-4.5".to_string(),
            owned_by: "openbmb".to_string(),
            created: 1_704_067_200,
            timeout_secs: 300,
            health_timeout_secs: 5,
        }
    }
}

impl BackendConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    pub fn health_timeout(&self) -> Duration {
        Duration::from_secs(self.health_timeout_secs)
    }

    pub fn chat_completions_url(&self) -> String {
        format!("{}/v1/chat/completions", self.url.trim_end_matches('/'))
    }

    pub fn health_url(&self) -> String {
        format!("{}/health", self.url.trim_end_matches('/'))
    }
}

/// Session backend and omni inference service settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct OmniConfig {
    /// Base URL of the login/logout/services backend.
    pub session_url: String,
    /// Base URL of the prefill/generate inference service.
    pub inference_url: String,
    /// Cached sessions younger than this are reused.
    pub freshness_secs: u64,
    pub login_timeout_secs: u64,
    pub init_timeout_secs: u64,
    pub prefill_timeout_secs: u64,
    pub services_timeout_secs: u64,
    /// Longest silence tolerated from the generate stream, including before headers.
    pub generate_timeout_secs: u64,
    pub system_prompt: String,
    pub max_turns: u32,
    pub model_type: String,
    pub session_type: String,
    pub service_name: String,
    /// Operator-supplied session that bypasses discovery and creation.
    pub manual_session: Option<ManualSession>,
    /// Where `manual_session` came from, filled in while loading.
    #[serde(skip)]
    pub manual_source: ManualSessionSource,
}

impl Default for OmniConfig {
    fn default() -> Self {
        Self {
            session_url: "http://localhost:8022".to_string(),
            inference_url: "http://localhost:9060".to_string(),
            freshness_secs: 600,
            login_timeout_secs: 10,
            init_timeout_secs: 30,
            prefill_timeout_secs: 60,
            services_timeout_secs: 5,
            generate_timeout_secs: 300,
            system_prompt: "You are a helpful AI assistant.".to_string(),
            max_turns: 10,
            model_type: "duplex".to_string(),
            session_type: "release".to_string(),
            service_name: "o45-cpp".to_string(),
            manual_session: None,
            manual_source: ManualSessionSource::None,
        }
    }
}

impl OmniConfig {
    pub fn freshness(&self) -> Duration {
        Duration::from_secs(self.freshness_secs)
    }

    pub fn login_timeout(&self) -> Duration {
        Duration::from_secs(self.login_timeout_secs)
    }

    pub fn init_timeout(&self) -> Duration {
        Duration::from_secs(self.init_timeout_secs)
    }

    pub fn prefill_timeout(&self) -> Duration {
        Duration::from_secs(self.prefill_timeout_secs)
    }

    pub fn services_timeout(&self) -> Duration {
        Duration::from_secs(self.services_timeout_secs)
    }

    pub fn generate_timeout(&self) -> Duration {
        Duration::from_secs(self.generate_timeout_secs)
    }

    /// Resolve the manual session in precedence order: the config file entry,
    /// then the conventional `MINICPM_*` env vars, then none.
    fn resolve_manual_session<F>(&mut self, lookup: &F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(manual) = self.manual_session.take() {
            let raw_token = manual.token.as_ref().map(|t| t.expose_secret().to_string());
            let referenced = manual.user_id.contains("${")
                || manual.session_id.contains("${")
                || raw_token.as_deref().is_some_and(|t| t.contains("${"));

            let user_id =
                expand_env_vars_with(&manual.user_id, "omni.manual_session.user_id", lookup)?;
            let session_id = expand_env_vars_with(
                &manual.session_id,
                "omni.manual_session.session_id",
                lookup,
            )?;
            let token = match raw_token {
                Some(raw) => Some(SessionToken::from(expand_env_vars_with(
                    &raw,
                    "omni.manual_session.token",
                    lookup,
                )?)),
                None => None,
            };

            self.manual_session = Some(ManualSession {
                user_id,
                session_id,
                token,
            });
            self.manual_source = if referenced {
                ManualSessionSource::EnvExpanded
            } else {
                ManualSessionSource::File
            };
            return Ok(());
        }

        let session_id = lookup(MANUAL_SESSION_ID_VAR).filter(|v| !v.is_empty());
        let user_id = lookup(MANUAL_USER_ID_VAR).filter(|v| !v.is_empty());
        if let (Some(session_id), Some(user_id)) = (session_id, user_id) {
            self.manual_session = Some(ManualSession {
                user_id,
                session_id,
                token: lookup(MANUAL_TOKEN_VAR).map(SessionToken::from),
            });
            self.manual_source = ManualSessionSource::Convention;
        } else {
            self.manual_source = ManualSessionSource::None;
        }

        Ok(())
    }
}

/// A backend session identity supplied by the operator.
///
/// Such a session is a pass-through identity: it is never expired or
/// logged out by this process.
#[derive(Debug, Clone, Deserialize)]
pub struct ManualSession {
    pub user_id: String,
    pub session_id: String,
    #[serde(default)]
    pub token: Option<SessionToken>,
}

/// How the manual session was resolved.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ManualSessionSource {
    /// Literal values in `[omni.manual_session]`
    File,
    /// `[omni.manual_session]` values containing `${VAR}` references
    EnvExpanded,
    /// `MINICPM_SESSION_ID` / `MINICPM_USER_ID` / `MINICPM_TOKEN`
    Convention,
    /// No manual session; sessions are created on demand
    #[default]
    None,
}

impl std::fmt::Display for ManualSessionSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ManualSessionSource::File => write!(f, "config-literal"),
            ManualSessionSource::EnvExpanded => write!(f, "env-expanded"),
            ManualSessionSource::Convention => write!(
                f,
                "convention ({}, {})",
                MANUAL_SESSION_ID_VAR, MANUAL_USER_ID_VAR
            ),
            ManualSessionSource::None => write!(f, "none"),
        }
    }
}

/// Session token wrapper that redacts in Debug/Display/Serialize and zeroizes on drop.
///
/// Only accessible via `.expose_secret()` so every read is grep-auditable.
#[derive(Clone)]
pub struct SessionToken(SecretString);

impl SessionToken {
    pub fn expose_secret(&self) -> &str {
        self.0.expose_secret()
    }
}

impl std::fmt::Debug for SessionToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[REDACTED]")
    }
}

impl std::fmt::Display for SessionToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[REDACTED]")
    }
}

impl Serialize for SessionToken {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str("[REDACTED]")
    }
}

impl<'de> serde::Deserialize<'de> for SessionToken {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        String::deserialize(deserializer).map(|s| SessionToken(SecretString::from(s)))
    }
}

impl From<String> for SessionToken {
    fn from(s: String) -> Self {
        SessionToken(SecretString::from(s))
    }
}

impl From<&str> for SessionToken {
    fn from(s: &str) -> Self {
        SessionToken(SecretString::from(s))
    }
}

/// Logging configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// Log level for the crate's own targets
    #[serde(default = "default_log_level")]
    pub level: String,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

impl Config {
    /// Load configuration from a TOML file, expanding `${VAR}` references
    /// from the process environment.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path.as_ref()).map_err(|e| ConfigError::Io {
            path: path.as_ref().display().to_string(),
            source: e,
        })?;

        Self::parse_str(&content)
    }

    /// Parse configuration from a TOML string using the process environment.
    pub fn parse_str(content: &str) -> Result<Self, ConfigError> {
        Self::parse_str_with(content, |name| std::env::var(name).ok())
    }

    /// Parse configuration from a TOML string with a custom env lookup.
    pub fn parse_str_with<F>(content: &str, lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let config: Config = toml::from_str(content).map_err(ConfigError::Parse)?;
        config.finalize_with(lookup)
    }

    /// Built-in defaults, resolved against the process environment.
    pub fn from_defaults() -> Result<Self, ConfigError> {
        Config::default().finalize_with(|name| std::env::var(name).ok())
    }

    /// Expand env references, resolve the manual session and validate.
    pub fn finalize_with<F>(mut self, lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        self.backend.url = expand_env_vars_with(&self.backend.url, "backend.url", &lookup)?;

        if let Some(omni) = self.omni.as_mut() {
            omni.session_url =
                expand_env_vars_with(&omni.session_url, "omni.session_url", &lookup)?;
            omni.inference_url =
                expand_env_vars_with(&omni.inference_url, "omni.inference_url", &lookup)?;
            omni.resolve_manual_session(&lookup)?;
        }

        self.validate()?;
        Ok(self)
    }

    /// Apply command-line overrides, then validate again.
    pub fn with_overrides(
        self,
        listen: Option<String>,
        backend_url: Option<String>,
    ) -> Result<Self, ConfigError> {
        self.with_overrides_using(listen, backend_url, |name| std::env::var(name).ok())
    }

    /// Apply command-line overrides with a custom env lookup.
    pub fn with_overrides_using<F>(
        mut self,
        listen: Option<String>,
        backend_url: Option<String>,
        lookup: F,
    ) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(listen) = listen {
            self.server.listen = listen;
        }
        if let Some(url) = backend_url {
            self.backend.url = expand_env_vars_with(&url, "--backend-url", &lookup)?;
        }

        self.validate()?;
        Ok(self)
    }

    /// Validate the configuration.
    fn validate(&self) -> Result<(), ConfigError> {
        if self.server.listen.is_empty() {
            return Err(ConfigError::Validation("server.listen is empty".to_string()));
        }
        if self.backend.url.is_empty() {
            return Err(ConfigError::Validation("backend.url is empty".to_string()));
        }
        if self.backend.model.is_empty() {
            return Err(ConfigError::Validation(
                "backend.model is empty".to_string(),
            ));
        }
        if self.backend.timeout_secs == 0 || self.backend.health_timeout_secs == 0 {
            return Err(ConfigError::Validation(
                "backend timeouts must be greater than zero".to_string(),
            ));
        }

        if self.server.mode == GatewayMode::Omni && self.omni.is_none() {
            return Err(ConfigError::Validation(
                "server.mode = \"omni\" requires an [omni] section".to_string(),
            ));
        }

        if let Some(omni) = &self.omni {
            if omni.session_url.is_empty() || omni.inference_url.is_empty() {
                return Err(ConfigError::Validation(
                    "omni.session_url and omni.inference_url must be set".to_string(),
                ));
            }
            let timeouts = [
                omni.login_timeout_secs,
                omni.init_timeout_secs,
                omni.prefill_timeout_secs,
                omni.services_timeout_secs,
                omni.generate_timeout_secs,
            ];
            if timeouts.contains(&0) {
                return Err(ConfigError::Validation(
                    "omni timeouts must be greater than zero".to_string(),
                ));
            }
            if let Some(manual) = &omni.manual_session {
                if manual.user_id.is_empty() || manual.session_id.is_empty() {
                    return Err(ConfigError::Validation(
                        "omni.manual_session requires both user_id and session_id".to_string(),
                    ));
                }
            }
        }

        Ok(())
    }

    /// Whether the omni adapter should serve chat completions.
    pub fn omni_enabled(&self) -> bool {
        self.server.mode == GatewayMode::Omni && self.omni.is_some()
    }
}

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file '{path}': {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Configuration validation error: {0}")]
    Validation(String),

    #[error("Environment variable '{var}' not set for '{field}': {message}")]
    EnvVar {
        var: String,
        field: String,
        message: String,
    },
}

/// Expand all `${VAR}` references in a string using a custom lookup function.
///
/// Supports multiple `${VAR}` in one string (e.g., `${SCHEME}://${HOST}:19060`).
/// Fails on first missing variable, unclosed `${`, or empty variable name.
fn expand_env_vars_with<F>(input: &str, field: &str, lookup: &F) -> Result<String, ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    if !input.contains("${") {
        return Ok(input.to_string());
    }

    let mut result = String::with_capacity(input.len());
    let mut rest = input;

    while let Some(start) = rest.find("${") {
        result.push_str(&rest[..start]);
        let after = &rest[start + 2..];

        let end = after.find('}').ok_or_else(|| ConfigError::EnvVar {
            var: "<unclosed>".to_string(),
            field: field.to_string(),
            message: format!("Unclosed '${{' in config value: {}", input),
        })?;

        let var_name = &after[..end];
        if var_name.is_empty() {
            return Err(ConfigError::EnvVar {
                var: "".to_string(),
                field: field.to_string(),
                message: "Empty variable name in '${}' reference".to_string(),
            });
        }

        let value = lookup(var_name).ok_or_else(|| ConfigError::EnvVar {
            var: var_name.to_string(),
            field: field.to_string(),
            message: format!(
                "Environment variable '{}' is not set (referenced in '{}')",
                var_name, field
            ),
        })?;

        result.push_str(&value);
        rest = &after[end + 1..];
    }

    result.push_str(rest);
    Ok(result)
}

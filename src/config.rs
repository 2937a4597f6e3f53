use std::path::Path;

use serde::Deserialize;

pub const DEFAULT_BIND: &str = "0.0.0.0:3978";
pub const DEFAULT_CRON: &str = "0 */5 * * * *";
pub const DEFAULT_REQUIRED_ROLE: &str = "Messages.Send";
pub const DEFAULT_SCHEDULED_MESSAGE: &str = "This is a scheduled message from the notifier.";

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {message}")]
    Read { path: String, message: String },
    #[error("failed to parse config file {path}: {message}")]
    Parse { path: String, message: String },
    #[error("{0} is not configured")]
    Missing(&'static str),
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

#[derive(Debug, Deserialize, Default, Clone)]
pub struct Config {
    #[serde(default)]
    pub server: Option<ServerConfig>,
    #[serde(default)]
    pub bot: Option<BotConfig>,
    #[serde(default)]
    pub auth: Option<AuthConfig>,
    #[serde(default)]
    pub scheduler: Option<SchedulerConfig>,
    #[serde(default)]
    pub logging: Option<LoggingConfig>,
}

#[derive(Debug, Deserialize, Default, Clone)]
pub struct ServerConfig {
    pub bind: Option<String>,
    pub request_timeout_secs: Option<u64>,
    pub max_body_bytes: Option<usize>,
    #[serde(default)]
    pub cors: Option<CorsConfig>,
}

#[derive(Debug, Deserialize, Default, Clone)]
pub struct CorsConfig {
    #[serde(default)]
    pub allowed_origins: Vec<String>,
}

/// Identity of the bot registration that owns the proactive conversations.
#[derive(Debug, Deserialize, Default, Clone)]
pub struct BotConfig {
    pub app_id: Option<String>,
    pub app_password: Option<String>,
    pub app_tenant_id: Option<String>,
    pub connector_timeout_secs: Option<u64>,
    pub delivery_timeout_secs: Option<u64>,
}

/// Bearer-token policy for the relay endpoints.
#[derive(Debug, Deserialize, Default, Clone)]
pub struct AuthConfig {
    pub tenant_id: Option<String>,
    pub client_id: Option<String>,
    pub audience: Option<String>,
    pub required_role: Option<String>,
    pub jwks_url: Option<String>,
    #[serde(default)]
    pub api_keys: Vec<String>,
}

#[derive(Debug, Deserialize, Default, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum CredentialKind {
    #[default]
    ManagedIdentity,
    ClientSecret,
}

#[derive(Debug, Deserialize, Default, Clone)]
pub struct SchedulerConfig {
    pub enabled: Option<bool>,
    pub cron: Option<String>,
    pub timezone: Option<String>,
    pub bot_api_url: Option<String>,
    pub bot_api_key: Option<String>,
    pub bot_api_scope: Option<String>,
    pub chat_id: Option<String>,
    pub service_url: Option<String>,
    pub tenant_id: Option<String>,
    pub message: Option<String>,
    pub timeout_secs: Option<u64>,
    #[serde(default)]
    pub credential: CredentialKind,
    pub managed_identity_client_id: Option<String>,
    pub client_tenant_id: Option<String>,
    pub client_id: Option<String>,
    pub client_secret: Option<String>,
}

#[derive(Debug, Deserialize, Default, Clone)]
pub struct LoggingConfig {
    pub level: Option<String>,
    pub format: Option<String>,
}

impl Config {
    /// Reads `path` when it exists, then applies process environment overrides.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let mut config = if path.exists() {
            let raw = std::fs::read_to_string(path).map_err(|err| ConfigError::Read {
                path: path.display().to_string(),
                message: err.to_string(),
            })?;
            Self::from_toml_str(&raw).map_err(|err| match err {
                ConfigError::Parse { message, .. } => ConfigError::Parse {
                    path: path.display().to_string(),
                    message,
                },
                other => other,
            })?
        } else {
            Config::default()
        };
        config.apply_env_overrides(|key| std::env::var(key).ok());
        Ok(config)
    }

    pub fn from_toml_str(raw: &str) -> Result<Self, ConfigError> {
        toml::from_str(raw).map_err(|err| ConfigError::Parse {
            path: "<inline>".to_string(),
            message: err.to_string(),
        })
    }

    /// Overlays the flat setting names used by the hosting environment.
    pub fn apply_env_overrides<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).and_then(non_empty);

        let scheduler = self.scheduler.get_or_insert_with(SchedulerConfig::default);
        override_with(&mut scheduler.bot_api_url, get("BotApiUrl"));
        override_with(&mut scheduler.bot_api_key, get("BotApiKey"));
        override_with(&mut scheduler.bot_api_scope, get("BotApiScope"));
        override_with(&mut scheduler.chat_id, get("ChatId"));
        override_with(&mut scheduler.service_url, get("ServiceUrl"));
        override_with(&mut scheduler.tenant_id, get("TenantId"));

        let bot = self.bot.get_or_insert_with(BotConfig::default);
        override_with(&mut bot.app_id, get("MicrosoftAppId"));
        override_with(&mut bot.app_password, get("MicrosoftAppPassword"));
        override_with(&mut bot.app_tenant_id, get("MicrosoftAppTenantId"));

        let auth = self.auth.get_or_insert_with(AuthConfig::default);
        override_with(&mut auth.client_id, get("AzureAd__ClientId"));
        override_with(&mut auth.tenant_id, get("AzureAd__TenantId"));
        override_with(&mut auth.audience, get("AzureAd__Audience"));
        override_with(&mut auth.required_role, get("AzureAd__RequiredRole"));
        if let Some(key) = get("ApiKey")
            && !auth.api_keys.contains(&key)
        {
            auth.api_keys.push(key);
        }
    }

    pub fn server(&self) -> ServerConfig {
        self.server.clone().unwrap_or_default()
    }

    pub fn bot(&self) -> BotConfig {
        self.bot.clone().unwrap_or_default()
    }

    pub fn auth(&self) -> AuthConfig {
        self.auth.clone().unwrap_or_default()
    }

    pub fn scheduler(&self) -> SchedulerConfig {
        self.scheduler.clone().unwrap_or_default()
    }

    pub fn logging(&self) -> LoggingConfig {
        self.logging.clone().unwrap_or_default()
    }
}

impl ServerConfig {
    pub fn bind(&self) -> String {
        self.bind.clone().unwrap_or_else(|| DEFAULT_BIND.to_string())
    }

    pub fn request_timeout_secs(&self) -> u64 {
        self.request_timeout_secs.unwrap_or(30).max(1)
    }

    pub fn max_body_bytes(&self) -> usize {
        self.max_body_bytes.unwrap_or(1024 * 1024)
    }
}

impl BotConfig {
    pub fn app_id(&self) -> Option<&str> {
        self.app_id.as_deref().filter(|value| !value.trim().is_empty())
    }

    /// Tenant used when the request carries none.
    pub fn app_tenant_id(&self) -> Option<&str> {
        self.app_tenant_id
            .as_deref()
            .filter(|value| !value.trim().is_empty())
    }

    pub fn connector_timeout_secs(&self) -> u64 {
        self.connector_timeout_secs.unwrap_or(30).max(1)
    }

    pub fn delivery_timeout_secs(&self) -> u64 {
        self.delivery_timeout_secs.unwrap_or(30).max(1)
    }
}

impl AuthConfig {
    pub fn tenant_id<'a>(&'a self, bot: &'a BotConfig) -> Option<&'a str> {
        self.tenant_id
            .as_deref()
            .filter(|value| !value.trim().is_empty())
            .or_else(|| bot.app_tenant_id())
    }

    pub fn required_role(&self) -> &str {
        self.required_role
            .as_deref()
            .filter(|value| !value.trim().is_empty())
            .unwrap_or(DEFAULT_REQUIRED_ROLE)
    }

    /// Every audience value a caller token may legitimately carry.
    pub fn accepted_audiences(&self) -> Vec<String> {
        let mut audiences = Vec::new();
        if let Some(audience) = self.audience.as_deref().and_then(|v| non_empty(v.to_string())) {
            audiences.push(audience);
        }
        if let Some(client_id) = self
            .client_id
            .as_deref()
            .and_then(|v| non_empty(v.to_string()))
        {
            let uri = format!("api://{client_id}");
            if !audiences.contains(&uri) {
                audiences.push(uri);
            }
            if !audiences.contains(&client_id) {
                audiences.push(client_id);
            }
        }
        audiences
    }
}

impl SchedulerConfig {
    pub fn enabled(&self) -> bool {
        self.enabled.unwrap_or(false)
    }

    pub fn cron(&self) -> &str {
        self.cron.as_deref().unwrap_or(DEFAULT_CRON)
    }

    pub fn timezone(&self) -> &str {
        self.timezone.as_deref().unwrap_or("UTC")
    }

    pub fn message(&self) -> &str {
        self.message.as_deref().unwrap_or(DEFAULT_SCHEDULED_MESSAGE)
    }

    pub fn timeout_secs(&self) -> u64 {
        self.timeout_secs.unwrap_or(30).max(1)
    }

    pub fn bot_api_url(&self) -> Option<&str> {
        self.bot_api_url.as_deref().filter(|v| !v.trim().is_empty())
    }

    pub fn bot_api_scope(&self) -> Option<&str> {
        self.bot_api_scope.as_deref().filter(|v| !v.trim().is_empty())
    }

    pub fn bot_api_key(&self) -> Option<&str> {
        self.bot_api_key.as_deref().filter(|v| !v.trim().is_empty())
    }
}

impl LoggingConfig {
    pub fn level(&self) -> &str {
        self.level.as_deref().unwrap_or("info")
    }

    pub fn json(&self) -> bool {
        self.format
            .as_deref()
            .map(|format| format.eq_ignore_ascii_case("json"))
            .unwrap_or(false)
    }
}

fn override_with(slot: &mut Option<String>, value: Option<String>) {
    if let Some(value) = value {
        *slot = Some(value);
    }
}

fn non_empty(value: String) -> Option<String> {
    if value.trim().is_empty() {
        None
    } else {
        Some(value)
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    #[test]
    fn parses_sections_and_defaults() {
        let config = Config::from_toml_str(
            r#"
            [server]
            bind = "127.0.0.1:9000"

            [bot]
            app_id = "bot-app"

            [scheduler]
            enabled = true
            bot_api_url = "https://relay.example"
            "#,
        )
        .unwrap();
        assert_eq!(config.server().bind(), "127.0.0.1:9000");
        assert_eq!(config.server().request_timeout_secs(), 30);
        assert_eq!(config.bot().app_id(), Some("bot-app"));
        assert!(config.scheduler().enabled());
        assert_eq!(config.scheduler().cron(), DEFAULT_CRON);
        assert_eq!(config.auth().required_role(), DEFAULT_REQUIRED_ROLE);
    }

    #[test]
    fn env_overrides_use_flat_setting_names() {
        let env: HashMap<&str, &str> = HashMap::from([
            ("BotApiUrl", "https://x"),
            ("BotApiScope", "api://y/.default"),
            ("ChatId", "19:chat"),
            ("MicrosoftAppId", "app-123"),
            ("MicrosoftAppTenantId", "tenant-1"),
            ("ApiKey", "secret"),
            ("TenantId", ""),
        ]);
        let mut config = Config::default();
        config.apply_env_overrides(|key| env.get(key).map(|v| v.to_string()));

        let scheduler = config.scheduler();
        assert_eq!(scheduler.bot_api_url(), Some("https://x"));
        assert_eq!(scheduler.bot_api_scope(), Some("api://y/.default"));
        assert_eq!(scheduler.chat_id.as_deref(), Some("19:chat"));
        assert_eq!(scheduler.tenant_id, None);
        assert_eq!(config.bot().app_id(), Some("app-123"));
        assert_eq!(config.auth().api_keys, vec!["secret".to_string()]);
        assert_eq!(
            config.auth().tenant_id(&config.bot()),
            Some("tenant-1")
        );
    }

    #[test]
    fn blank_app_id_counts_as_unset() {
        let bot = BotConfig {
            app_id: Some("  ".to_string()),
            ..BotConfig::default()
        };
        assert_eq!(bot.app_id(), None);
    }

    #[test]
    fn accepted_audiences_include_client_id_forms() {
        let auth = AuthConfig {
            client_id: Some("abc".to_string()),
            ..AuthConfig::default()
        };
        assert_eq!(
            auth.accepted_audiences(),
            vec!["api://abc".to_string(), "abc".to_string()]
        );
    }
}

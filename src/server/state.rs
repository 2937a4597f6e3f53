use std::sync::Arc;
use std::time::Duration;

use crate::config::{Config, ConfigError, ServerConfig};
use crate::identity::credential::{CachingCredential, ClientSecretCredential, CredentialProvider};
use crate::identity::validator::{AppRolePolicy, JwtValidator, TokenValidator};
use crate::messaging::backend::{ActivityHandler, ConnectorBackend, MessagingBackend};
use crate::messaging::bot::EchoBot;
use crate::messaging::connector::{BOT_FRAMEWORK_TENANT, BotConnectorClient};
use crate::relay::service::RelayService;

#[derive(Clone)]
pub struct AppState {
    pub relay: RelayService,
    pub backend: Arc<dyn MessagingBackend>,
    pub bot_handler: Arc<dyn ActivityHandler>,
    pub caller_validator: Arc<dyn TokenValidator>,
    pub channel_validator: Option<Arc<dyn TokenValidator>>,
    pub role_policy: AppRolePolicy,
    pub api_keys: Vec<String>,
    pub server_config: ServerConfig,
}

impl AppState {
    /// Wires the production collaborators from configuration.
    pub fn from_config(config: &Config) -> Result<Self, ConfigError> {
        let bot = config.bot();
        let auth = config.auth();
        let timeout = Duration::from_secs(bot.connector_timeout_secs());
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|err| ConfigError::Invalid(format!("http client: {err}")))?;

        let tenant_id = auth
            .tenant_id(&bot)
            .ok_or(ConfigError::Missing("auth.tenant_id"))?;
        let audiences = auth.accepted_audiences();
        if audiences.is_empty() {
            return Err(ConfigError::Missing("auth.client_id or auth.audience"));
        }
        let caller_validator: Arc<dyn TokenValidator> = Arc::new(JwtValidator::azure_ad(
            tenant_id,
            audiences,
            auth.jwks_url.clone(),
            http.clone(),
        ));

        let credential: Option<Arc<dyn CredentialProvider>> =
            match (bot.app_id(), bot.app_password.as_deref()) {
                (Some(app_id), Some(password)) if !password.is_empty() => {
                    let tenant = bot.app_tenant_id().unwrap_or(BOT_FRAMEWORK_TENANT);
                    let inner = ClientSecretCredential::new(tenant, app_id, password, timeout)
                        .map_err(|err| ConfigError::Invalid(format!("bot credential: {err}")))?;
                    Some(Arc::new(CachingCredential::new(Arc::new(inner))))
                }
                _ => None,
            };
        if credential.is_none() {
            tracing::warn!(
                event = "bot_credential_missing",
                "no bot app password configured; connector calls are unauthenticated"
            );
        }
        let connector = BotConnectorClient::new(credential, timeout)
            .map_err(|err| ConfigError::Invalid(format!("bot connector: {err}")))?;
        let backend: Arc<dyn MessagingBackend> =
            Arc::new(ConnectorBackend::new(Arc::new(connector)));

        let channel_validator = bot.app_id().map(|app_id| {
            Arc::new(JwtValidator::bot_framework(app_id, http.clone())) as Arc<dyn TokenValidator>
        });

        Ok(Self {
            relay: RelayService::new(backend.clone(), bot.clone()),
            backend,
            bot_handler: Arc::new(EchoBot),
            caller_validator,
            channel_validator,
            role_policy: AppRolePolicy::new(auth.required_role()),
            api_keys: auth.api_keys.clone(),
            server_config: config.server(),
        })
    }
}

use std::sync::Arc;
use std::time::Duration;

use reqwest::Client;

use crate::config::{ConfigError, CredentialKind, SchedulerConfig};
use crate::identity::claims::peek_claims;
use crate::identity::credential::{
    CachingCredential, ClientSecretCredential, CredentialProvider, ManagedIdentityCredential,
};
use crate::identity::error::AuthError;
use crate::relay::request::NotificationPayload;

pub const SEND_PATH: &str = "/api/teamsmessage/send";
pub const API_KEY_HEADER: &str = "X-Api-Key";

/// What a single tick did. Nothing consumes this outside of tests.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TickOutcome {
    Skipped { reason: String },
    Delivered { status: u16 },
    Rejected { status: u16, body: String },
    AuthFailed { error: String },
    Failed { error: String },
}

/// Pushes one fixed notification to the relay per tick.
#[derive(Clone)]
pub struct ScheduledNotifier {
    config: SchedulerConfig,
    credential: Arc<dyn CredentialProvider>,
    http: Client,
}

impl ScheduledNotifier {
    pub fn new(
        config: SchedulerConfig,
        credential: Arc<dyn CredentialProvider>,
    ) -> Result<Self, ConfigError> {
        let http = Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs()))
            .build()
            .map_err(|err| ConfigError::Invalid(format!("http client: {err}")))?;
        Ok(Self {
            config,
            credential,
            http,
        })
    }

    pub fn from_config(config: SchedulerConfig) -> Result<Self, ConfigError> {
        let credential = credential_from_config(&config)?;
        Self::new(config, credential)
    }

    pub async fn tick(&self) -> TickOutcome {
        let tick_id = uuid::Uuid::new_v4();
        tracing::info!(
            event = "scheduled_tick",
            tick_id = %tick_id,
            at = %chrono::Local::now(),
            "scheduled notifier triggered"
        );

        let (Some(bot_api_url), Some(scope)) =
            (self.config.bot_api_url(), self.config.bot_api_scope())
        else {
            tracing::error!(
                event = "scheduled_tick_misconfigured",
                tick_id = %tick_id,
                "BotApiUrl or BotApiScope is not configured. Aborting."
            );
            return TickOutcome::Skipped {
                reason: "BotApiUrl or BotApiScope is not configured".to_string(),
            };
        };
        tracing::info!(
            event = "scheduled_tick_config",
            tick_id = %tick_id,
            bot_api_url = %bot_api_url,
            scope = %scope,
            "requesting token"
        );

        let token = match self.credential.acquire_token(scope).await {
            Ok(token) => token,
            Err(err) => {
                log_auth_failure(&err);
                return TickOutcome::AuthFailed {
                    error: err.to_string(),
                };
            }
        };
        tracing::info!(
            event = "token_acquired",
            tick_id = %tick_id,
            expires_on = %token.expires_on,
            "token acquired"
        );
        match peek_claims(&token.token) {
            Ok(claims) => tracing::info!(
                event = "token_roles",
                tick_id = %tick_id,
                roles = %claims.roles.join(", "),
                "token contains roles"
            ),
            Err(err) => tracing::debug!(
                event = "token_roles_unreadable",
                error = %err,
                "could not decode token claims"
            ),
        }

        let url = send_url(bot_api_url);
        let mut request = self
            .http
            .post(&url)
            .bearer_auth(&token.token)
            .json(&self.payload());
        if let Some(api_key) = self.config.bot_api_key() {
            request = request.header(API_KEY_HEADER, api_key);
        }

        let response = match request.send().await {
            Ok(response) => response,
            Err(err) => {
                tracing::error!(
                    event = "scheduled_send_failed",
                    tick_id = %tick_id,
                    error = %err,
                    "an exception occurred while calling the relay"
                );
                return TickOutcome::Failed {
                    error: err.to_string(),
                };
            }
        };
        let status = response.status();
        if status.is_success() {
            tracing::info!(
                event = "scheduled_send_ok",
                tick_id = %tick_id,
                status = status.as_u16(),
                "successfully sent message to the bot api"
            );
            return TickOutcome::Delivered {
                status: status.as_u16(),
            };
        }
        let body = match response.text().await {
            Ok(body) => body,
            Err(err) => {
                tracing::error!(
                    event = "scheduled_send_body_unreadable",
                    tick_id = %tick_id,
                    status = status.as_u16(),
                    error = %err,
                    "failed to send message; response body could not be read"
                );
                return TickOutcome::Rejected {
                    status: status.as_u16(),
                    body: format!("<unreadable body: {err}>"),
                };
            }
        };
        tracing::error!(
            event = "scheduled_send_rejected",
            tick_id = %tick_id,
            status = status.as_u16(),
            response = %body,
            "failed to send message"
        );
        TickOutcome::Rejected {
            status: status.as_u16(),
            body,
        }
    }

    fn payload(&self) -> NotificationPayload {
        NotificationPayload {
            text: Some(self.config.message().to_string()),
            chat_id: self.config.chat_id.clone(),
            service_url: self.config.service_url.clone(),
            tenant_id: self.config.tenant_id.clone(),
        }
    }
}

pub fn send_url(bot_api_url: &str) -> String {
    format!("{}{SEND_PATH}", bot_api_url.trim_end_matches('/'))
}

pub fn credential_from_config(
    config: &SchedulerConfig,
) -> Result<Arc<dyn CredentialProvider>, ConfigError> {
    let timeout = Duration::from_secs(config.timeout_secs());
    let inner: Arc<dyn CredentialProvider> = match config.credential {
        CredentialKind::ManagedIdentity => Arc::new(
            ManagedIdentityCredential::from_env(config.managed_identity_client_id.clone(), timeout)
                .map_err(|err| ConfigError::Invalid(format!("managed identity: {err}")))?,
        ),
        CredentialKind::ClientSecret => {
            let tenant = config
                .client_tenant_id
                .clone()
                .ok_or(ConfigError::Missing("scheduler.client_tenant_id"))?;
            let client_id = config
                .client_id
                .clone()
                .ok_or(ConfigError::Missing("scheduler.client_id"))?;
            let secret = config
                .client_secret
                .clone()
                .ok_or(ConfigError::Missing("scheduler.client_secret"))?;
            Arc::new(
                ClientSecretCredential::new(tenant, client_id, secret, timeout)
                    .map_err(|err| ConfigError::Invalid(format!("client secret: {err}")))?,
            )
        }
    };
    Ok(Arc::new(CachingCredential::new(inner)))
}

fn log_auth_failure(err: &AuthError) {
    tracing::error!(
        event = "token_acquisition_failed",
        error = %err,
        "identity authentication failed"
    );
    if err.is_scope_problem() {
        tracing::error!("This looks like a scope/permission issue. Check:");
        tracing::error!("1. BotApiScope format should be: api://YOUR_API_CLIENT_ID/.default");
        tracing::error!("2. The caller identity has been granted the application role");
        tracing::error!("3. Admin consent has been granted");
    }
}

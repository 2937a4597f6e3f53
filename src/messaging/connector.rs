use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use url::Url;

use crate::identity::credential::CredentialProvider;
use crate::messaging::activity::{Activity, ConversationReference, ResourceResponse};
use crate::messaging::backend::ConversationClient;
use crate::messaging::error::{DeliveryError, DeliveryResult};

pub const BOT_CONNECTOR_SCOPE: &str = "https://api.botframework.com/.default";
pub const BOT_FRAMEWORK_TENANT: &str = "botframework.com";

/// Bot Connector REST client (`/v3/conversations/{id}/activities`).
#[derive(Clone)]
pub struct BotConnectorClient {
    http: Client,
    credential: Option<Arc<dyn CredentialProvider>>,
}

impl BotConnectorClient {
    pub fn new(
        credential: Option<Arc<dyn CredentialProvider>>,
        timeout: Duration,
    ) -> DeliveryResult<Self> {
        let http = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|err| DeliveryError::Transport(err.to_string()))?;
        Ok(Self { http, credential })
    }
}

#[async_trait]
impl ConversationClient for BotConnectorClient {
    async fn send_activity(
        &self,
        reference: &ConversationReference,
        activity: Activity,
    ) -> DeliveryResult<ResourceResponse> {
        let url = activities_url(
            &reference.service_url,
            &reference.conversation.id,
            activity.reply_to_id.as_deref(),
        )?;
        let mut request = self.http.post(url.clone()).json(&activity);
        if let Some(credential) = &self.credential {
            let token = credential.acquire_token(BOT_CONNECTOR_SCOPE).await?;
            request = request.bearer_auth(token.token);
        }
        let response = request
            .send()
            .await
            .map_err(|err| DeliveryError::Transport(err.to_string()))?;
        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|err| DeliveryError::Transport(err.to_string()))?;
        if !status.is_success() {
            tracing::warn!(
                event = "connector_rejected",
                status = status.as_u16(),
                url = %url,
                "bot connector rejected activity"
            );
            return Err(DeliveryError::Rejected {
                status: status.as_u16(),
                body,
            });
        }
        serde_json::from_str::<ResourceResponse>(&body).map_err(|err| {
            DeliveryError::Transport(format!("malformed connector response: {err}"))
        })
    }
}

pub fn activities_url(
    service_url: &str,
    conversation_id: &str,
    reply_to_id: Option<&str>,
) -> DeliveryResult<Url> {
    let mut url = Url::parse(service_url)
        .map_err(|_| DeliveryError::InvalidServiceUrl(service_url.to_string()))?;
    if !matches!(url.scheme(), "http" | "https") {
        return Err(DeliveryError::InvalidServiceUrl(service_url.to_string()));
    }
    {
        let mut segments = url
            .path_segments_mut()
            .map_err(|_| DeliveryError::InvalidServiceUrl(service_url.to_string()))?;
        segments
            .pop_if_empty()
            .extend(["v3", "conversations", conversation_id, "activities"]);
        if let Some(reply_to_id) = reply_to_id {
            segments.push(reply_to_id);
        }
    }
    Ok(url)
}

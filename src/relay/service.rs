use std::sync::Arc;
use std::time::Duration;

use futures::FutureExt;

use crate::config::BotConfig;
use crate::messaging::activity::{
    Activity, ChannelAccount, ConversationAccount, ConversationReference, TEAMS_CHANNEL_ID,
};
use crate::messaging::backend::{ContinuationCallback, MessagingBackend, TurnContext};
use crate::messaging::card::adaptive_card_attachment;
use crate::messaging::error::DeliveryError;
use crate::relay::error::{RelayError, RelayResult};
use crate::relay::request::{NotificationPayload, NotificationRequest, NotificationResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PayloadKind {
    Text,
    Card,
}

impl PayloadKind {
    pub fn build_activity(self, text: &str) -> Activity {
        match self {
            PayloadKind::Text => Activity::message(text),
            PayloadKind::Card => Activity::with_attachment(adaptive_card_attachment(text)),
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            PayloadKind::Text => "message",
            PayloadKind::Card => "card message",
        }
    }
}

/// Delivers one notification into one Teams conversation.
#[derive(Clone)]
pub struct RelayService {
    backend: Arc<dyn MessagingBackend>,
    bot: BotConfig,
}

impl RelayService {
    pub fn new(backend: Arc<dyn MessagingBackend>, bot: BotConfig) -> Self {
        Self { backend, bot }
    }

    pub fn app_id(&self) -> RelayResult<&str> {
        self.bot
            .app_id()
            .ok_or_else(|| RelayError::Configuration("bot app id is not configured".to_string()))
    }

    pub async fn send(
        &self,
        payload: NotificationPayload,
        kind: PayloadKind,
    ) -> RelayResult<NotificationResult> {
        let app_id = self.app_id()?;
        let request = NotificationRequest::try_from(payload).map_err(RelayError::Validation)?;
        let reference = conversation_reference(&request, app_id, self.bot.app_tenant_id());
        let activity = kind.build_activity(request.text());
        let callback: ContinuationCallback = Box::new(move |ctx: TurnContext| {
            async move {
                let response = ctx.send_activity(activity).await?;
                Ok(response.id)
            }
            .boxed()
        });

        let timeout_secs = self.bot.delivery_timeout_secs();
        let activity_id = tokio::time::timeout(
            Duration::from_secs(timeout_secs),
            self.backend.continue_conversation(app_id, reference, callback),
        )
        .await
        .map_err(|_| DeliveryError::Timeout(timeout_secs))??;

        tracing::info!(
            event = "notification_delivered",
            kind = kind.label(),
            chat_id = %request.chat_id(),
            activity_id = %activity_id,
            "{} sent successfully",
            kind.label()
        );
        Ok(NotificationResult::delivered(
            format!("{} sent successfully", capitalize(kind.label())),
            activity_id,
        ))
    }
}

/// Request tenant wins; otherwise the bot's own tenant.
pub fn conversation_reference(
    request: &NotificationRequest,
    app_id: &str,
    default_tenant: Option<&str>,
) -> ConversationReference {
    ConversationReference {
        service_url: request.service_url().to_string(),
        channel_id: TEAMS_CHANNEL_ID.to_string(),
        conversation: ConversationAccount {
            id: request.chat_id().to_string(),
            tenant_id: request
                .tenant_id()
                .or(default_tenant)
                .map(str::to_string),
            ..ConversationAccount::default()
        },
        bot: ChannelAccount::new(app_id),
        user: None,
        activity_id: None,
    }
}

fn capitalize(label: &str) -> String {
    let mut chars = label.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().chain(chars).collect(),
        None => String::new(),
    }
}

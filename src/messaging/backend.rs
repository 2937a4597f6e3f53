use std::sync::Arc;

use async_trait::async_trait;
use futures::future::BoxFuture;

use crate::messaging::activity::{Activity, ConversationReference, ResourceResponse};
use crate::messaging::error::{DeliveryError, DeliveryResult};

/// Posts one activity into the referenced conversation.
#[async_trait]
pub trait ConversationClient: Send + Sync {
    async fn send_activity(
        &self,
        reference: &ConversationReference,
        activity: Activity,
    ) -> DeliveryResult<ResourceResponse>;
}

/// A turn bound to a single conversation, either resumed proactively or
/// created for an inbound activity.
#[derive(Clone)]
pub struct TurnContext {
    reference: ConversationReference,
    incoming: Option<Activity>,
    client: Arc<dyn ConversationClient>,
}

impl TurnContext {
    pub fn proactive(reference: ConversationReference, client: Arc<dyn ConversationClient>) -> Self {
        Self {
            reference,
            incoming: None,
            client,
        }
    }

    pub fn incoming(
        activity: Activity,
        reference: ConversationReference,
        client: Arc<dyn ConversationClient>,
    ) -> Self {
        Self {
            reference,
            incoming: Some(activity),
            client,
        }
    }

    pub fn reference(&self) -> &ConversationReference {
        &self.reference
    }

    pub fn activity(&self) -> Option<&Activity> {
        self.incoming.as_ref()
    }

    pub async fn send_activity(&self, mut activity: Activity) -> DeliveryResult<ResourceResponse> {
        activity.apply_reference(&self.reference);
        self.client.send_activity(&self.reference, activity).await
    }
}

/// Work run inside a resumed conversation; yields the delivered activity id.
pub type ContinuationCallback =
    Box<dyn FnOnce(TurnContext) -> BoxFuture<'static, DeliveryResult<String>> + Send>;

/// Reacts to inbound channel activities.
#[async_trait]
pub trait ActivityHandler: Send + Sync {
    async fn on_turn(&self, ctx: &TurnContext) -> DeliveryResult<()>;
}

/// The messaging capability the relay depends on.
#[async_trait]
pub trait MessagingBackend: Send + Sync {
    async fn continue_conversation(
        &self,
        app_id: &str,
        reference: ConversationReference,
        callback: ContinuationCallback,
    ) -> DeliveryResult<String>;

    async fn process_activity(
        &self,
        activity: Activity,
        handler: &dyn ActivityHandler,
    ) -> DeliveryResult<()>;
}

/// Backend that resolves turns against any [`ConversationClient`].
#[derive(Clone)]
pub struct ConnectorBackend {
    client: Arc<dyn ConversationClient>,
}

impl ConnectorBackend {
    pub fn new(client: Arc<dyn ConversationClient>) -> Self {
        Self { client }
    }
}

#[async_trait]
impl MessagingBackend for ConnectorBackend {
    async fn continue_conversation(
        &self,
        app_id: &str,
        mut reference: ConversationReference,
        callback: ContinuationCallback,
    ) -> DeliveryResult<String> {
        if app_id.trim().is_empty() {
            return Err(DeliveryError::InvalidActivity("bot app id is empty".to_string()));
        }
        reference.bot.id = app_id.to_string();
        let ctx = TurnContext::proactive(reference, self.client.clone());
        callback(ctx).await
    }

    async fn process_activity(
        &self,
        activity: Activity,
        handler: &dyn ActivityHandler,
    ) -> DeliveryResult<()> {
        let reference = activity.conversation_reference().ok_or_else(|| {
            DeliveryError::InvalidActivity("activity lacks conversation or serviceUrl".to_string())
        })?;
        let ctx = TurnContext::incoming(activity, reference, self.client.clone());
        handler.on_turn(&ctx).await
    }
}

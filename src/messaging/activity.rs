use serde::{Deserialize, Serialize};
use serde_json::Value;

pub const TEAMS_CHANNEL_ID: &str = "msteams";

pub mod activity_types {
    pub const MESSAGE: &str = "message";
    pub const CONVERSATION_UPDATE: &str = "conversationUpdate";
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChannelAccount {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

impl ChannelAccount {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: None,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConversationAccount {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tenant_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub conversation_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub is_group: Option<bool>,
}

/// Identifiers needed to resume a conversation later.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConversationReference {
    pub service_url: String,
    pub channel_id: String,
    pub conversation: ConversationAccount,
    pub bot: ChannelAccount,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user: Option<ChannelAccount>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub activity_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Attachment {
    pub content_type: String,
    pub content: Value,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Activity {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub attachments: Vec<Attachment>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub from: Option<ChannelAccount>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub recipient: Option<ChannelAccount>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub conversation: Option<ConversationAccount>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub service_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub channel_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reply_to_id: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub members_added: Vec<ChannelAccount>,
}

impl Activity {
    pub fn message(text: impl Into<String>) -> Self {
        Self {
            kind: activity_types::MESSAGE.to_string(),
            text: Some(text.into()),
            ..Self::default()
        }
    }

    pub fn with_attachment(attachment: Attachment) -> Self {
        Self {
            kind: activity_types::MESSAGE.to_string(),
            attachments: vec![attachment],
            ..Self::default()
        }
    }

    /// Addresses an outgoing activity at the referenced conversation.
    pub fn apply_reference(&mut self, reference: &ConversationReference) {
        self.conversation = Some(reference.conversation.clone());
        self.service_url = Some(reference.service_url.clone());
        self.channel_id = Some(reference.channel_id.clone());
        self.from = Some(reference.bot.clone());
        if self.recipient.is_none() {
            self.recipient = reference.user.clone();
        }
        if self.reply_to_id.is_none() {
            self.reply_to_id = reference.activity_id.clone();
        }
    }

    /// The reference a reply to this inbound activity should use.
    pub fn conversation_reference(&self) -> Option<ConversationReference> {
        let conversation = self.conversation.clone()?;
        let service_url = self.service_url.clone()?;
        Some(ConversationReference {
            service_url,
            channel_id: self
                .channel_id
                .clone()
                .unwrap_or_else(|| TEAMS_CHANNEL_ID.to_string()),
            conversation,
            bot: self.recipient.clone().unwrap_or_default(),
            user: self.from.clone(),
            activity_id: self.id.clone(),
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceResponse {
    pub id: String,
}

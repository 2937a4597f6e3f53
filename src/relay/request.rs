use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Body of `send` / `send-card` as it arrives on the wire.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NotificationPayload {
    #[serde(default)]
    pub text: Option<String>,
    #[serde(default)]
    pub chat_id: Option<String>,
    #[serde(default)]
    pub service_url: Option<String>,
    #[serde(default)]
    pub tenant_id: Option<String>,
}

/// A validated notification: non-empty text, chat id and service url.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NotificationRequest {
    text: String,
    chat_id: String,
    service_url: String,
    tenant_id: Option<String>,
}

impl NotificationRequest {
    pub fn text(&self) -> &str {
        &self.text
    }

    pub fn chat_id(&self) -> &str {
        &self.chat_id
    }

    pub fn service_url(&self) -> &str {
        &self.service_url
    }

    pub fn tenant_id(&self) -> Option<&str> {
        self.tenant_id.as_deref()
    }
}

impl TryFrom<NotificationPayload> for NotificationRequest {
    type Error = ValidationErrors;

    fn try_from(payload: NotificationPayload) -> Result<Self, Self::Error> {
        let mut errors = ValidationErrors::default();
        let text = required(&mut errors, "text", payload.text);
        let chat_id = required(&mut errors, "chatId", payload.chat_id);
        let service_url = required(&mut errors, "serviceUrl", payload.service_url);
        match (text, chat_id, service_url) {
            (Some(text), Some(chat_id), Some(service_url)) if errors.is_empty() => Ok(Self {
                text,
                chat_id,
                service_url,
                tenant_id: payload.tenant_id.filter(|tenant| !tenant.trim().is_empty()),
            }),
            _ => Err(errors),
        }
    }
}

fn required(errors: &mut ValidationErrors, field: &str, value: Option<String>) -> Option<String> {
    match value {
        Some(value) if !value.trim().is_empty() => Some(value),
        _ => {
            errors.add(field, format!("The {field} field is required."));
            None
        }
    }
}

/// Field name to messages, serialized as-is into the 400 body.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ValidationErrors(BTreeMap<String, Vec<String>>);

impl ValidationErrors {
    pub fn add(&mut self, field: &str, message: impl Into<String>) {
        self.0
            .entry(field.to_string())
            .or_default()
            .push(message.into());
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn fields(&self) -> impl Iterator<Item = &str> {
        self.0.keys().map(String::as_str)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NotificationResult {
    pub success: bool,
    pub message: String,
    pub activity_id: Option<String>,
}

impl NotificationResult {
    pub fn delivered(message: impl Into<String>, activity_id: String) -> Self {
        Self {
            success: true,
            message: message.into(),
            activity_id: Some(activity_id),
        }
    }

    pub fn failed(message: impl Into<String>) -> Self {
        Self {
            success: false,
            message: message.into(),
            activity_id: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn payload(text: Option<&str>, chat: Option<&str>, service: Option<&str>) -> NotificationPayload {
        NotificationPayload {
            text: text.map(str::to_string),
            chat_id: chat.map(str::to_string),
            service_url: service.map(str::to_string),
            tenant_id: None,
        }
    }

    #[test]
    fn valid_payload_converts() {
        let mut raw = payload(Some("hi"), Some("19:chat"), Some("https://smba.example/"));
        raw.tenant_id = Some(" ".to_string());
        let request = NotificationRequest::try_from(raw).unwrap();
        assert_eq!(request.text(), "hi");
        assert_eq!(request.chat_id(), "19:chat");
        assert_eq!(request.tenant_id(), None);
    }

    #[test]
    fn every_missing_field_is_reported() {
        let errors = NotificationRequest::try_from(payload(None, Some(""), Some("https://x")))
            .unwrap_err();
        assert_eq!(errors.fields().collect::<Vec<_>>(), vec!["chatId", "text"]);
    }

    #[test]
    fn result_serializes_null_activity_id() {
        let value = serde_json::to_value(NotificationResult::failed("boom")).unwrap();
        assert_eq!(value["success"], false);
        assert!(value["activityId"].is_null());
    }
}

use serde_json::{Value, json};

use crate::messaging::activity::Attachment;

pub const ADAPTIVE_CARD_CONTENT_TYPE: &str = "application/vnd.microsoft.card.adaptive";
pub const ADAPTIVE_CARD_VERSION: &str = "1.4";
pub const LEARN_MORE_URL: &str = "https://adaptivecards.io/";

/// A single wrapping text block plus a "Learn More" link.
pub fn adaptive_card(text: &str) -> Value {
    json!({
        "type": "AdaptiveCard",
        "version": ADAPTIVE_CARD_VERSION,
        "body": [
            {
                "type": "TextBlock",
                "text": text,
                "wrap": true,
                "size": "Medium"
            }
        ],
        "actions": [
            {
                "type": "Action.OpenUrl",
                "title": "Learn More",
                "url": LEARN_MORE_URL
            }
        ]
    })
}

pub fn adaptive_card_attachment(text: &str) -> Attachment {
    Attachment {
        content_type: ADAPTIVE_CARD_CONTENT_TYPE.to_string(),
        content: adaptive_card(text),
    }
}

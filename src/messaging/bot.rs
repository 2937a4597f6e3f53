use async_trait::async_trait;

use crate::messaging::activity::{Activity, activity_types};
use crate::messaging::backend::{ActivityHandler, TurnContext};
use crate::messaging::error::DeliveryResult;

pub const WELCOME_TEXT: &str = "Hello and welcome!";

/// Echoes messages back and greets newly added members.
#[derive(Debug, Clone, Default)]
pub struct EchoBot;

#[async_trait]
impl ActivityHandler for EchoBot {
    async fn on_turn(&self, ctx: &TurnContext) -> DeliveryResult<()> {
        let Some(activity) = ctx.activity() else {
            return Ok(());
        };
        match activity.kind.as_str() {
            activity_types::MESSAGE => {
                let text = activity.text.clone().unwrap_or_default();
                ctx.send_activity(Activity::message(format!("Echo: {text}")))
                    .await?;
            }
            activity_types::CONVERSATION_UPDATE => {
                let bot_id = activity.recipient.as_ref().map(|bot| bot.id.as_str());
                for member in &activity.members_added {
                    if Some(member.id.as_str()) == bot_id {
                        continue;
                    }
                    ctx.send_activity(Activity::message(WELCOME_TEXT)).await?;
                }
            }
            other => {
                tracing::debug!(event = "activity_ignored", kind = %other, "unhandled activity type");
            }
        }
        Ok(())
    }
}

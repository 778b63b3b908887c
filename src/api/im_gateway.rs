use std::sync::Arc;

use super::chunk_segmenter::{chance_passes, ChanceSource};
use super::conversation_store::ConversationStore;
use super::data_models::*;
use super::error_handler::ChatError;
use super::outbound_delivery::OutboundDelivery;
use super::stream_router::StreamRouter;
use super::turn_state::TurnState;

pub const EMPTY_MESSAGE_BODY: &str = "requestmsg is empty";
pub const NOT_HINTED_BODY: &str = "Group message not hint words.";
pub const TOO_LONG_BODY: &str = "question too long";

/// IM 入口：把一条 OneBot 消息事件变成一轮对话
pub struct ImGateway {
    router: Arc<StreamRouter>,
    store: Arc<ConversationStore>,
    state: Arc<TurnState>,
    delivery: Arc<dyn OutboundDelivery>,
    chance: Box<dyn ChanceSource>,
}

impl ImGateway {
    pub fn new(
        router: Arc<StreamRouter>,
        store: Arc<ConversationStore>,
        state: Arc<TurnState>,
        delivery: Arc<dyn OutboundDelivery>,
        chance: Box<dyn ChanceSource>,
    ) -> Self {
        Self {
            router,
            store,
            state,
            delivery,
            chance,
        }
    }

    /// 默认按用户维护上下文；`group_context` 打开时群消息按群共用
    pub fn user_key(event: &OnebotMessageEvent, group_context: bool) -> String {
        match event.kind() {
            MessageKind::Group if group_context => format!("{}:g{}", event.self_id, event.group_id),
            _ => format!("{}:{}", event.self_id, event.user_id),
        }
    }

    pub fn recipient_for(&self, event: &OnebotMessageEvent) -> RecipientInfo {
        let kind = event.kind();
        let delivery = if self.router.settings().use_private_sse && kind.is_private() {
            DeliveryMode::Sse
        } else {
            DeliveryMode::Plain
        };
        RecipientInfo {
            user_id: event.user_id,
            group_id: event.group_id,
            kind,
            delivery,
        }
    }

    /// 群消息是否命中提示词（含 `[@self_id]`）；未配置提示词时总是命中
    pub fn contains_hint(message: &str, self_id: i64, hint_words: &[String]) -> bool {
        if hint_words.is_empty() {
            return true;
        }
        let at_self = format!("[@{}]", self_id);
        message.contains(&at_self) || hint_words.iter().any(|hint| message.contains(hint.as_str()))
    }

    fn normalize(event: &OnebotMessageEvent) -> String {
        let text = event.message.to_plain_text();
        let text = if text.trim().is_empty() {
            event.raw_message.clone()
        } else {
            text
        };
        text.trim().to_string()
    }

    /// 策略性的短回复直接发文本，不走分段
    async fn send_notice(&self, recipient: &RecipientInfo, text: &str) {
        if text.is_empty() {
            return;
        }
        let result = if recipient.kind.is_private() {
            self.delivery.send_private_message(recipient.user_id, text).await
        } else {
            self.delivery
                .send_group_message(recipient.group_id, recipient.user_id, text)
                .await
        };
        if let Err(e) = result {
            log::warn!("notice to {} failed: {}", recipient.key(), e);
        }
    }

    /// 返回给 OneBot 实现端的响应体
    pub async fn handle(&self, event: OnebotMessageEvent) -> Result<String, ChatError> {
        let settings = self.router.settings();
        let message = Self::normalize(&event);
        let recipient = self.recipient_for(&event);
        let user_key = Self::user_key(&event, settings.group_context);

        if message.is_empty() {
            log::info!("empty message from {}", recipient.key());
            return Ok(EMPTY_MESSAGE_BODY.to_string());
        }

        if event.kind() == MessageKind::Group
            && !Self::contains_hint(&message, event.self_id, &settings.group_hint_words)
            && !chance_passes(settings.group_hint_chance, self.chance.as_ref())
        {
            log::debug!("no hint words in group {} message", event.group_id);
            return Ok(NOT_HINTED_BODY.to_string());
        }

        if settings.restore_commands.iter().any(|cmd| cmd == &message) {
            let ctx = self.store.reset_user_context(&user_key)?;
            log::info!("user {} restored to conversation {}", user_key, ctx.conversation_id);
            self.send_notice(&recipient, &settings.restore_response).await;
            return Ok(settings.restore_response.clone());
        }

        if settings.question_max_length > 0
            && message.chars().count() > settings.question_max_length
        {
            self.send_notice(&recipient, &settings.question_too_long_reply)
                .await;
            return Ok(TOO_LONG_BODY.to_string());
        }

        let ctx = self.store.user_context(&user_key)?;
        self.state.put_recipient(&ctx.conversation_id, recipient);

        let envelope = self
            .router
            .run_turn(
                TurnRequest {
                    conversation_id: Some(ctx.conversation_id.clone()),
                    parent_message_id: Some(ctx.parent_message_id.clone()),
                    message: message.clone(),
                },
                |_| {},
            )
            .await?;

        self.store
            .update_user_context(&user_key, &envelope.message_id)?;

        Ok(format!(
            "Request received and processed Q:{} A:{}",
            message, envelope.response
        ))
    }
}

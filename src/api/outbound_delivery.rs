use std::time::Duration;

use async_trait::async_trait;
use serde_json::json;

use super::data_models::{
    ChunkState, InterfaceBody, RecipientInfo, ACTION_BUTTON_FIRST_CHUNK, SSE_STATE_TERMINAL,
};
use super::error_handler::ChatError;

/// 把文本送到 IM 侧。失败只记录，不重试。
#[async_trait]
pub trait OutboundDelivery: Send + Sync {
    async fn send_private_message(&self, user_id: i64, text: &str) -> Result<(), ChatError>;

    async fn send_group_message(
        &self,
        group_id: i64,
        user_id: i64,
        text: &str,
    ) -> Result<(), ChatError>;

    async fn send_private_sse(&self, user_id: i64, body: &InterfaceBody) -> Result<(), ChatError>;
}

/// 一轮内投递分段时的上下文
#[derive(Debug, Clone, Copy)]
pub struct ChunkContext {
    pub state: ChunkState,
    /// 本轮第一个分段
    pub first: bool,
}

/// 按收件人类型选择发送方式
pub async fn deliver_chunk(
    delivery: &dyn OutboundDelivery,
    recipient: &RecipientInfo,
    text: &str,
    ctx: ChunkContext,
) {
    if text.is_empty() {
        return;
    }
    let result = if recipient.uses_sse() {
        let body = InterfaceBody {
            content: text.to_string(),
            state: ctx.state.sse_code(),
            prompt_keyboard: Vec::new(),
            action_button: if ctx.first { ACTION_BUTTON_FIRST_CHUNK } else { 0 },
            callback_data: if ctx.first {
                recipient.user_id.to_string()
            } else {
                String::new()
            },
        };
        delivery.send_private_sse(recipient.user_id, &body).await
    } else if recipient.kind.is_private() {
        delivery.send_private_message(recipient.user_id, text).await
    } else {
        delivery
            .send_group_message(recipient.group_id, recipient.user_id, text)
            .await
    };

    if let Err(e) = result {
        log::warn!("delivery to {} failed: {}", recipient.key(), e);
    }
}

/// SSE 私聊的结束标记，附带快捷回复
pub async fn deliver_terminal_marker(
    delivery: &dyn OutboundDelivery,
    recipient: &RecipientInfo,
    prompt_keyboard: &[String],
) {
    if !recipient.uses_sse() {
        return;
    }
    let body = InterfaceBody {
        content: String::new(),
        state: SSE_STATE_TERMINAL,
        prompt_keyboard: prompt_keyboard.to_vec(),
        action_button: 0,
        callback_data: String::new(),
    };
    if let Err(e) = delivery.send_private_sse(recipient.user_id, &body).await {
        log::warn!("terminal marker to {} failed: {}", recipient.key(), e);
    }
}

/// 通过 OneBot v11 HTTP API 发送
pub struct OneBotDelivery {
    client: reqwest::Client,
    base_url: String,
}

impl OneBotDelivery {
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self, ChatError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| ChatError::DeliveryError {
                message: format!("Failed to build delivery client: {}", e),
            })?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    async fn post(&self, action: &str, payload: serde_json::Value) -> Result<(), ChatError> {
        let url = format!("{}/{}", self.base_url, action);
        let resp = self
            .client
            .post(&url)
            .json(&payload)
            .send()
            .await
            .map_err(|e| ChatError::DeliveryError {
                message: format!("{} request failed: {}", action, e),
            })?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(ChatError::DeliveryError {
                message: format!("{} returned {}: {}", action, status.as_u16(), body),
            });
        }
        log::debug!("{} ok", action);
        Ok(())
    }
}

#[async_trait]
impl OutboundDelivery for OneBotDelivery {
    async fn send_private_message(&self, user_id: i64, text: &str) -> Result<(), ChatError> {
        self.post(
            "send_private_msg",
            json!({ "user_id": user_id, "message": text }),
        )
        .await
    }

    async fn send_group_message(
        &self,
        group_id: i64,
        user_id: i64,
        text: &str,
    ) -> Result<(), ChatError> {
        self.post(
            "send_group_msg",
            json!({ "group_id": group_id, "user_id": user_id, "message": text }),
        )
        .await
    }

    async fn send_private_sse(&self, user_id: i64, body: &InterfaceBody) -> Result<(), ChatError> {
        self.post(
            "send_private_msg_sse",
            json!({ "user_id": user_id, "message": body }),
        )
        .await
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::api::data_models::{DeliveryMode, MessageKind, SSE_STATE_INTERMEDIATE};
    use std::sync::Mutex;

    /// 记录每一次投递，按顺序
    #[derive(Default)]
    pub(crate) struct RecordingDelivery {
        pub sent: Mutex<Vec<(String, String)>>,
        pub sse: Mutex<Vec<(i64, InterfaceBody)>>,
    }

    #[async_trait]
    impl OutboundDelivery for RecordingDelivery {
        async fn send_private_message(&self, user_id: i64, text: &str) -> Result<(), ChatError> {
            self.sent
                .lock()
                .unwrap()
                .push((format!("private:{}", user_id), text.to_string()));
            Ok(())
        }

        async fn send_group_message(
            &self,
            group_id: i64,
            _user_id: i64,
            text: &str,
        ) -> Result<(), ChatError> {
            self.sent
                .lock()
                .unwrap()
                .push((format!("group:{}", group_id), text.to_string()));
            Ok(())
        }

        async fn send_private_sse(
            &self,
            user_id: i64,
            body: &InterfaceBody,
        ) -> Result<(), ChatError> {
            self.sse.lock().unwrap().push((user_id, body.clone()));
            Ok(())
        }
    }

    struct FailingDelivery;

    #[async_trait]
    impl OutboundDelivery for FailingDelivery {
        async fn send_private_message(&self, _: i64, _: &str) -> Result<(), ChatError> {
            Err(ChatError::DeliveryError {
                message: "down".into(),
            })
        }
        async fn send_group_message(&self, _: i64, _: i64, _: &str) -> Result<(), ChatError> {
            Err(ChatError::DeliveryError {
                message: "down".into(),
            })
        }
        async fn send_private_sse(&self, _: i64, _: &InterfaceBody) -> Result<(), ChatError> {
            Err(ChatError::DeliveryError {
                message: "down".into(),
            })
        }
    }

    fn recipient(kind: MessageKind, delivery: DeliveryMode) -> RecipientInfo {
        RecipientInfo {
            user_id: 7,
            group_id: 99,
            kind,
            delivery,
        }
    }

    const INTERMEDIATE: ChunkContext = ChunkContext {
        state: ChunkState::Intermediate,
        first: false,
    };

    #[tokio::test]
    async fn test_dispatch_by_recipient_kind() {
        let rec = RecordingDelivery::default();
        deliver_chunk(&rec, &recipient(MessageKind::Private, DeliveryMode::Plain), "a", INTERMEDIATE).await;
        deliver_chunk(&rec, &recipient(MessageKind::Group, DeliveryMode::Plain), "b", INTERMEDIATE).await;
        deliver_chunk(&rec, &recipient(MessageKind::PrivateInGroup, DeliveryMode::Plain), "c", INTERMEDIATE).await;

        let sent = rec.sent.lock().unwrap().clone();
        assert_eq!(
            sent,
            vec![
                ("private:7".to_string(), "a".to_string()),
                ("group:99".to_string(), "b".to_string()),
                ("private:7".to_string(), "c".to_string()),
            ]
        );
    }

    #[tokio::test]
    async fn test_sse_first_chunk_carries_action_button() {
        let rec = RecordingDelivery::default();
        let target = recipient(MessageKind::Private, DeliveryMode::Sse);
        let first = ChunkContext {
            state: ChunkState::Intermediate,
            first: true,
        };
        deliver_chunk(&rec, &target, "你好，", first).await;
        deliver_chunk(&rec, &target, "再见", ChunkContext { state: ChunkState::Final, first: false }).await;
        deliver_terminal_marker(&rec, &target, &["继续".to_string()]).await;

        let sse = rec.sse.lock().unwrap().clone();
        assert_eq!(sse.len(), 3);
        assert_eq!(sse[0].1.state, SSE_STATE_INTERMEDIATE);
        assert_eq!(sse[0].1.action_button, ACTION_BUTTON_FIRST_CHUNK);
        assert_eq!(sse[0].1.callback_data, "7");
        assert_eq!(sse[1].1.action_button, 0);
        assert_eq!(sse[1].1.state, ChunkState::Final.sse_code());
        assert_eq!(sse[2].1.state, SSE_STATE_TERMINAL);
        assert_eq!(sse[2].1.prompt_keyboard, vec!["继续".to_string()]);
        assert!(rec.sent.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_terminal_marker_skipped_for_plain() {
        let rec = RecordingDelivery::default();
        deliver_terminal_marker(&rec, &recipient(MessageKind::Private, DeliveryMode::Plain), &[]).await;
        assert!(rec.sse.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_empty_chunk_not_sent() {
        let rec = RecordingDelivery::default();
        deliver_chunk(&rec, &recipient(MessageKind::Private, DeliveryMode::Plain), "", INTERMEDIATE).await;
        assert!(rec.sent.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_failure_is_swallowed() {
        // 不 panic、不返回错误即可
        deliver_chunk(&FailingDelivery, &recipient(MessageKind::Group, DeliveryMode::Plain), "x", INTERMEDIATE).await;
        deliver_terminal_marker(&FailingDelivery, &recipient(MessageKind::Private, DeliveryMode::Sse), &[]).await;
    }

    #[test]
    fn test_onebot_base_url_trimmed() {
        let d = OneBotDelivery::new("http://127.0.0.1:5700/", Duration::from_secs(5)).unwrap();
        assert_eq!(d.base_url, "http://127.0.0.1:5700");
    }
}

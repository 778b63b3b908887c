use std::fmt;
use std::sync::Arc;

use super::config_manager::GatewaySettings;
use super::conversation_store::ConversationStore;
use super::data_models::*;
use super::error_handler::ChatError;
use super::outbound_delivery::{deliver_chunk, deliver_terminal_marker, ChunkContext, OutboundDelivery};
use super::streaming_handler::{SseLine, SseLineReader, StreamTimeoutConfig, StreamingHandler};
use super::turn_state::TurnState;

/// 一轮对话所处的阶段，只用于日志
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TurnPhase {
    Idle,
    RequestSent,
    Streaming,
    Finalizing,
    Done,
    Error,
}

impl fmt::Display for TurnPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            TurnPhase::Idle => "idle",
            TurnPhase::RequestSent => "request_sent",
            TurnPhase::Streaming => "streaming",
            TurnPhase::Finalizing => "finalizing",
            TurnPhase::Done => "done",
            TurnPhase::Error => "error",
        };
        f.write_str(name)
    }
}

/// 流式处理中本轮的投递进度
struct TurnProgress {
    conversation_id: ConversationKey,
    /// 上游给的流标识，第一次收到事件时绑定
    bound_stream: Option<StreamIdentifier>,
    /// 累积器的键，带上会话标识，上游复用同一个 id 时各轮互不干扰
    accumulator_key: String,
    delivered_any: bool,
}

/// 累积器键：会话标识 + 上游流标识
pub fn accumulator_key(conversation_id: &str, stream_id: &str) -> String {
    format!("{}\u{1f}{}", conversation_id, stream_id)
}

pub struct StreamRouter {
    settings: GatewaySettings,
    upstream: StreamingHandler,
    store: Arc<ConversationStore>,
    state: Arc<TurnState>,
    delivery: Arc<dyn OutboundDelivery>,
}

impl StreamRouter {
    pub fn new(
        settings: GatewaySettings,
        store: Arc<ConversationStore>,
        state: Arc<TurnState>,
        delivery: Arc<dyn OutboundDelivery>,
    ) -> Result<Self, ChatError> {
        let upstream = StreamingHandler::new(
            &settings.upstream_url,
            &settings.upstream_token,
            StreamTimeoutConfig::from_settings(&settings),
        )?;
        Ok(Self {
            settings,
            upstream,
            store,
            state,
            delivery,
        })
    }

    pub fn settings(&self) -> &GatewaySettings {
        &self.settings
    }

    /// Validate message content — reject blank messages (whitespace-only).
    pub fn validate_message(content: &str) -> Result<(), ChatError> {
        if content.trim().is_empty() {
            return Err(ChatError::ValidationError {
                message: "Message cannot be blank".to_string(),
            });
        }
        Ok(())
    }

    /// 按字符预算截断历史：超出时先去掉所有助手回复，仍超出再从最早的消息开始丢
    pub fn truncate_history(history: Vec<Message>, prompt: &str, budget: usize) -> Vec<Message> {
        let cost = |msgs: &[Message]| -> usize {
            prompt.chars().count() + msgs.iter().map(|m| m.text.chars().count()).sum::<usize>()
        };
        if cost(&history) <= budget {
            return history;
        }

        let mut kept: Vec<Message> = history
            .into_iter()
            .filter(|m| m.role == MessageRole::User)
            .collect();
        let mut total = cost(&kept);
        let mut drop = 0;
        while total > budget && drop < kept.len() {
            total -= kept[drop].text.chars().count();
            drop += 1;
        }
        kept.drain(..drop);
        kept
    }

    /// 系统提示词 + 截断后的历史 + 本轮问题
    pub fn assemble_messages(&self, history: Vec<Message>, prompt: &str) -> Vec<Message> {
        let mut messages = Vec::with_capacity(history.len() + 2);
        if !self.settings.system_prompt.is_empty() {
            messages.push(Message::transient(
                MessageRole::System,
                &self.settings.system_prompt,
            ));
        }
        messages.extend(Self::truncate_history(
            history,
            prompt,
            self.settings.max_history_chars,
        ));
        messages.push(Message::transient(MessageRole::User, prompt));
        messages
    }

    pub fn build_request_body(messages: &[Message], model: &str, stream: bool) -> serde_json::Value {
        let api_messages: Vec<serde_json::Value> = messages
            .iter()
            .map(|m| {
                serde_json::json!({
                    "role": m.role.as_str(),
                    "content": m.text,
                })
            })
            .collect();

        serde_json::json!({
            "model": model,
            "messages": api_messages,
            "stream": stream,
        })
    }

    /// 跑完一轮：持久化用户消息 → 请求上游 → 流式分段投递 → 持久化助手消息。
    /// `on_frame` 收到每个新增片段，调用方据此转发 SSE 帧。
    pub async fn run_turn<F>(&self, request: TurnRequest, on_frame: F) -> Result<TurnEnvelope, ChatError>
    where
        F: Fn(TurnFrame) + Send + Sync,
    {
        Self::validate_message(&request.message)?;

        let conversation_id = match request.conversation_id.filter(|id| !id.is_empty()) {
            Some(id) => {
                ConversationStore::validate_conversation_id(&id)?;
                id
            }
            None => {
                let id = uuid::Uuid::new_v4().to_string();
                self.store.create_conversation(&id)?;
                id
            }
        };
        let parent_id = request.parent_message_id.filter(|id| !id.is_empty());

        self.state.begin_turn(&conversation_id);
        let mut phase = TurnPhase::Idle;

        let result = self
            .drive_turn(&conversation_id, parent_id.as_deref(), &request.message, &mut phase, &on_frame)
            .await;

        if let Err(e) = &result {
            log::warn!(
                "turn {} failed in phase {}: {}",
                conversation_id,
                phase,
                e
            );
            Self::enter(&conversation_id, &mut phase, TurnPhase::Error);
        }
        self.state.end_turn(&conversation_id);
        result
    }

    fn enter(conversation_id: &str, phase: &mut TurnPhase, next: TurnPhase) {
        log::debug!("turn {}: {} -> {}", conversation_id, phase, next);
        *phase = next;
    }

    async fn drive_turn<F>(
        &self,
        conversation_id: &ConversationKey,
        parent_id: Option<&str>,
        prompt: &str,
        phase: &mut TurnPhase,
        on_frame: &F,
    ) -> Result<TurnEnvelope, ChatError>
    where
        F: Fn(TurnFrame) + Send + Sync,
    {
        let history = match parent_id {
            Some(parent) => self.store.get_history(conversation_id, parent)?,
            None => Vec::new(),
        };
        let user_message_id = self.store.add_message(Message::new(
            conversation_id,
            parent_id,
            MessageRole::User,
            prompt,
        ))?;

        let messages = self.assemble_messages(history, prompt);
        let streaming = self.settings.use_sse;
        let body = Self::build_request_body(&messages, &self.settings.model, streaming);

        Self::enter(conversation_id, phase, TurnPhase::RequestSent);
        let resp = self.upstream.open(&body, streaming).await?;

        let mut progress = TurnProgress {
            conversation_id: conversation_id.clone(),
            bound_stream: None,
            accumulator_key: String::new(),
            delivered_any: false,
        };

        let final_text = if streaming {
            Self::enter(conversation_id, phase, TurnPhase::Streaming);
            self.consume_stream(resp, &mut progress, on_frame).await?;
            let key = self
                .state
                .stream_for(conversation_id)
                .ok_or_else(|| ChatError::StreamError {
                    message: "upstream stream ended without any event".to_string(),
                })?;
            self.state
                .reconciler
                .complete_text(&key)
                .ok_or_else(|| ChatError::StreamError {
                    message: format!("accumulator for turn {} is gone", conversation_id),
                })?
        } else {
            StreamingHandler::read_completion(resp).await?
        };

        Self::enter(conversation_id, phase, TurnPhase::Finalizing);
        let assistant_message_id = self.store.add_message(Message::new(
            conversation_id,
            Some(&user_message_id),
            MessageRole::Assistant,
            &final_text,
        ))?;

        if let Some(recipient) = self.state.recipient(conversation_id) {
            let remainder = self.final_remainder(conversation_id, &recipient, &final_text);
            deliver_chunk(
                self.delivery.as_ref(),
                &recipient,
                &remainder,
                ChunkContext {
                    state: ChunkState::Final,
                    first: !progress.delivered_any,
                },
            )
            .await;
            deliver_terminal_marker(
                self.delivery.as_ref(),
                &recipient,
                &self.settings.prompt_keyboard,
            )
            .await;
        }

        Self::enter(conversation_id, phase, TurnPhase::Done);
        log::info!(
            "turn {} done: {} chars, message {}",
            conversation_id,
            final_text.chars().count(),
            assistant_message_id
        );

        Ok(TurnEnvelope {
            response: final_text,
            conversation_id: conversation_id.clone(),
            message_id: assistant_message_id,
            details: TurnDetails::default(),
        })
    }

    /// 最后一段：完整回答去掉已投递的部分；对不上时退回分段器里剩下的文本
    fn final_remainder(&self, conversation_id: &str, recipient: &RecipientInfo, final_text: &str) -> String {
        let delivered = self.state.pending(recipient);
        match final_text.strip_prefix(delivered.as_str()) {
            Some(rest) => rest.to_string(),
            None => {
                log::warn!(
                    "delivered text for {} is not a prefix of the final answer",
                    recipient.key()
                );
                self.state
                    .segmenter
                    .take_remainder(conversation_id)
                    .unwrap_or_default()
            }
        }
    }

    async fn consume_stream<F>(
        &self,
        resp: reqwest::Response,
        progress: &mut TurnProgress,
        on_frame: &F,
    ) -> Result<(), ChatError>
    where
        F: Fn(TurnFrame) + Send + Sync,
    {
        let mut reader = SseLineReader::new(resp);
        while let Some(line) = reader.next_line().await? {
            let event = match StreamingHandler::parse_sse_line(&line) {
                SseLine::Blank | SseLine::Ignored => continue,
                SseLine::Done => break,
                SseLine::Malformed(detail) => {
                    log::warn!("skipping malformed stream line: {}", detail);
                    continue;
                }
                SseLine::Event(event) => event,
            };
            self.handle_event(event, progress, on_frame).await;
        }
        Ok(())
    }

    async fn handle_event<F>(&self, event: StreamEvent, progress: &mut TurnProgress, on_frame: &F)
    where
        F: Fn(TurnFrame) + Send + Sync,
    {
        let conversation_id = progress.conversation_id.clone();
        let incoming = if event.id.is_empty() {
            conversation_id.clone()
        } else {
            event.id.clone()
        };
        match &progress.bound_stream {
            Some(bound) => {
                if *bound != incoming {
                    log::warn!(
                        "turn {}: stream id changed from {} to {}, keeping the first",
                        conversation_id,
                        bound,
                        incoming
                    );
                }
            }
            None => {
                progress.accumulator_key = accumulator_key(&conversation_id, &incoming);
                self.state
                    .bind_stream(&conversation_id, &progress.accumulator_key);
                progress.bound_stream = Some(incoming);
            }
        }

        let suffix = self
            .state
            .reconciler
            .reconcile(&progress.accumulator_key, &event.fragment());
        if suffix.is_empty() {
            return;
        }

        on_frame(TurnFrame::Partial(PartialFrame {
            response: suffix.clone(),
            conversation_id: conversation_id.clone(),
        }));

        // 收件人在投递时按会话标识查，不在开轮时捕获
        let Some(recipient) = self.state.recipient(&conversation_id) else {
            return;
        };
        for chunk in self.state.segmenter.push(&conversation_id, &suffix) {
            self.state.append_pending(&recipient, &chunk);
            deliver_chunk(
                self.delivery.as_ref(),
                &recipient,
                &chunk,
                ChunkContext {
                    state: ChunkState::Intermediate,
                    first: !progress.delivered_any,
                },
            )
            .await;
            progress.delivered_any = true;
        }
    }
}

use serde::{Deserialize, Serialize};

/// 会话标识：调用方提供，缺省时生成 UUID
pub type ConversationKey = String;

/// 上游厂商分配的流标识，首个 SSE 事件到达后才可知
pub type StreamIdentifier = String;

/// 消息角色
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum MessageRole {
    User,
    Assistant,
    System,
}

impl MessageRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageRole::User => "user",
            MessageRole::Assistant => "assistant",
            MessageRole::System => "system",
        }
    }
}

/// 单条消息：通过 parent_message_id 串成单链历史
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub id: String,
    pub conversation_id: String,
    #[serde(default)]
    pub parent_message_id: Option<String>,
    pub role: MessageRole,
    pub text: String,
    pub created_at: i64,
}

impl Message {
    pub fn new(
        conversation_id: &str,
        parent_message_id: Option<&str>,
        role: MessageRole,
        text: &str,
    ) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            conversation_id: conversation_id.to_string(),
            parent_message_id: parent_message_id
                .filter(|p| !p.is_empty())
                .map(str::to_string),
            role,
            text: text.to_string(),
            created_at: chrono::Utc::now().timestamp_millis(),
        }
    }

    /// 仅用于拼装上游请求的临时消息（系统提示词等），不落盘
    pub fn transient(role: MessageRole, text: &str) -> Self {
        Self {
            id: String::new(),
            conversation_id: String::new(),
            parent_message_id: None,
            role,
            text: text.to_string(),
            created_at: 0,
        }
    }
}

/// 对话
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Conversation {
    pub id: String,
    pub messages: Vec<Message>,
    pub created_at: i64,
    pub updated_at: i64,
}

/// IM 用户当前所处的对话位置
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserContext {
    pub conversation_id: String,
    #[serde(default)]
    pub parent_message_id: String,
}

// ── Recipient routing ──

/// 消息来源类型
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum MessageKind {
    Private,
    Group,
    /// 群内私聊（group_private），按私聊投递
    PrivateInGroup,
}

impl MessageKind {
    /// Map OneBot `message_type` / `real_message_type` onto a kind.
    pub fn from_onebot(message_type: &str, real_message_type: &str) -> Self {
        if real_message_type == "group_private" {
            MessageKind::PrivateInGroup
        } else if message_type == "private" {
            MessageKind::Private
        } else {
            MessageKind::Group
        }
    }

    pub fn is_private(&self) -> bool {
        !matches!(self, MessageKind::Group)
    }
}

/// 私聊投递方式：普通文本或带状态码的 SSE 气泡
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum DeliveryMode {
    Plain,
    Sse,
}

/// 一轮对话的收件人，按会话标识登记，投递分段时再查回
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecipientInfo {
    pub user_id: i64,
    pub group_id: i64,
    pub kind: MessageKind,
    pub delivery: DeliveryMode,
}

impl RecipientInfo {
    /// PendingChunkBuffer 的复合键 "group.user"
    pub fn key(&self) -> String {
        format!("{}.{}", self.group_id, self.user_id)
    }

    pub fn uses_sse(&self) -> bool {
        self.kind.is_private() && self.delivery == DeliveryMode::Sse
    }
}

/// 分段投递状态：中间段还是本轮最后一段
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChunkState {
    Intermediate,
    Final,
}

impl ChunkState {
    /// SSE 私聊气泡的状态码
    pub fn sse_code(&self) -> u8 {
        match self {
            ChunkState::Intermediate => SSE_STATE_INTERMEDIATE,
            ChunkState::Final => SSE_STATE_LAST_CHUNK,
        }
    }
}

pub const SSE_STATE_INTERMEDIATE: u8 = 1;
pub const SSE_STATE_LAST_CHUNK: u8 = 11;
pub const SSE_STATE_TERMINAL: u8 = 20;
pub const ACTION_BUTTON_FIRST_CHUNK: u8 = 10;

/// send_private_msg_sse 的消息体
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct InterfaceBody {
    pub content: String,
    pub state: u8,
    #[serde(default)]
    pub prompt_keyboard: Vec<String>,
    #[serde(default)]
    pub action_button: u8,
    #[serde(default)]
    pub callback_data: String,
}

// ── HTTP envelopes ──

/// POST /conversation 请求体
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TurnRequest {
    #[serde(default)]
    pub conversation_id: Option<String>,
    #[serde(default)]
    pub parent_message_id: Option<String>,
    pub message: String,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct UsageInfo {
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TurnDetails {
    pub usage: UsageInfo,
}

/// 一轮结束后的最终响应
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TurnEnvelope {
    pub response: String,
    pub conversation_id: String,
    pub message_id: String,
    pub details: TurnDetails,
}

/// SSE 中间帧
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PartialFrame {
    pub response: String,
    pub conversation_id: String,
}

/// 发往调用方的 SSE 帧
#[derive(Debug, Clone, PartialEq)]
pub enum TurnFrame {
    Partial(PartialFrame),
    Final(TurnEnvelope),
}

impl TurnFrame {
    pub fn to_json(&self) -> String {
        let encoded = match self {
            TurnFrame::Partial(frame) => serde_json::to_string(frame),
            TurnFrame::Final(envelope) => serde_json::to_string(envelope),
        };
        encoded.unwrap_or_default()
    }
}

// ── Upstream shapes ──

#[derive(Debug, Clone, Default, Deserialize)]
pub struct CompletionMessage {
    #[serde(default)]
    pub content: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct CompletionChoice {
    #[serde(default)]
    pub message: CompletionMessage,
}

/// 非流式补全：取第一个 choice
#[derive(Debug, Clone, Default, Deserialize)]
pub struct CompletionResponse {
    #[serde(default)]
    pub choices: Vec<CompletionChoice>,
}

impl CompletionResponse {
    pub fn answer(&self) -> &str {
        self.choices
            .first()
            .map(|c| c.message.content.as_str())
            .unwrap_or("")
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct DeltaContent {
    #[serde(default)]
    pub content: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct DeltaChoice {
    #[serde(default)]
    pub delta: DeltaContent,
}

/// 一条 SSE 增量事件
#[derive(Debug, Clone, Default, Deserialize)]
pub struct StreamEvent {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub choices: Vec<DeltaChoice>,
}

impl StreamEvent {
    /// 所有 choice 的增量按顺序拼接
    pub fn fragment(&self) -> String {
        self.choices
            .iter()
            .map(|c| c.delta.content.as_str())
            .collect()
    }
}

// ── OneBot ingress ──

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessageSegment {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub data: serde_json::Map<String, serde_json::Value>,
}

/// OneBot `message` 字段：字符串或消息段数组，在入口统一转成纯文本
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum InboundContent {
    Text(String),
    Segments(Vec<MessageSegment>),
}

impl Default for InboundContent {
    fn default() -> Self {
        InboundContent::Text(String::new())
    }
}

impl InboundContent {
    pub fn to_plain_text(&self) -> String {
        match self {
            InboundContent::Text(text) => text.clone(),
            InboundContent::Segments(segments) => {
                let mut out = String::new();
                for segment in segments {
                    match segment.kind.as_str() {
                        "text" => {
                            if let Some(text) = segment.data.get("text").and_then(|v| v.as_str()) {
                                out.push_str(text);
                            }
                        }
                        "at" => {
                            // qq 可能是字符串也可能是数字
                            let target = match segment.data.get("qq") {
                                Some(serde_json::Value::String(s)) => s.clone(),
                                Some(other) => other.to_string(),
                                None => continue,
                            };
                            out.push_str(&format!("[@{}]", target));
                        }
                        _ => {}
                    }
                }
                out
            }
        }
    }
}

/// OneBot v11 消息事件（只保留网关需要的字段）
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct OnebotMessageEvent {
    #[serde(default)]
    pub self_id: i64,
    #[serde(default)]
    pub user_id: i64,
    #[serde(default)]
    pub group_id: i64,
    #[serde(default)]
    pub message_type: String,
    #[serde(default)]
    pub real_message_type: String,
    #[serde(default)]
    pub raw_message: String,
    #[serde(default)]
    pub message: InboundContent,
}

impl OnebotMessageEvent {
    pub fn kind(&self) -> MessageKind {
        MessageKind::from_onebot(&self.message_type, &self.real_message_type)
    }
}

use std::time::Duration;

use axum::body::Bytes;
use futures::stream::BoxStream;
use futures::StreamExt;

use super::config_manager::GatewaySettings;
use super::data_models::{CompletionResponse, StreamEvent};
use super::error_handler::ChatError;

/// 上游请求的超时配置
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StreamTimeoutConfig {
    pub connect_timeout: Duration,
    /// 流式时作用于每一次读取
    pub read_timeout: Option<Duration>,
    /// 只用于非流式请求的总超时
    pub request_timeout: Option<Duration>,
}

impl StreamTimeoutConfig {
    pub fn from_settings(settings: &GatewaySettings) -> Self {
        let optional = |secs: u64| (secs > 0).then(|| Duration::from_secs(secs));
        Self {
            connect_timeout: Duration::from_secs(settings.connect_timeout_secs.max(1)),
            read_timeout: optional(settings.read_timeout_secs),
            request_timeout: optional(settings.request_timeout_secs),
        }
    }
}

/// 一行 SSE 的分类结果
#[derive(Debug)]
pub enum SseLine {
    /// 空行 / keep-alive
    Blank,
    /// 没有 data 前缀：event 行、注释、心跳
    Ignored,
    /// data: [DONE]
    Done,
    /// data 不是合法 JSON
    Malformed(String),
    Event(StreamEvent),
}

pub struct StreamingHandler {
    client: reqwest::Client,
    url: String,
    token: String,
    timeouts: StreamTimeoutConfig,
}

impl StreamingHandler {
    pub fn new(url: &str, token: &str, timeouts: StreamTimeoutConfig) -> Result<Self, ChatError> {
        let mut builder = reqwest::Client::builder()
            .connect_timeout(timeouts.connect_timeout)
            // 防止长时间空闲连接被中间代理/NAT 断开
            .tcp_keepalive(Duration::from_secs(20))
            .pool_idle_timeout(Duration::from_secs(90));
        if let Some(read_timeout) = timeouts.read_timeout {
            builder = builder.read_timeout(read_timeout);
        }
        let client = builder.build().map_err(|e| ChatError::NetworkError {
            message: format!("Failed to build upstream client: {}", e),
        })?;
        Ok(Self {
            client,
            url: url.to_string(),
            token: token.to_string(),
            timeouts,
        })
    }

    /// 发出请求并等到响应头；非 2xx 视为失败
    pub async fn open(
        &self,
        request_body: &serde_json::Value,
        streaming: bool,
    ) -> Result<reqwest::Response, ChatError> {
        let mut request = self
            .client
            .post(&self.url)
            .header("Content-Type", "application/json")
            .json(request_body);
        if !self.token.is_empty() {
            request = request.bearer_auth(&self.token);
        }
        if streaming {
            request = request.header("Accept", "text/event-stream");
        } else if let Some(timeout) = self.timeouts.request_timeout {
            request = request.timeout(timeout);
        }

        let resp = request
            .send()
            .await
            .map_err(|e| ChatError::from_reqwest("upstream request failed", e))?;

        let status = resp.status();
        if !status.is_success() {
            let body_text = resp.text().await.unwrap_or_default();
            return Err(ChatError::ApiError {
                status: status.as_u16(),
                message: body_text.chars().take(500).collect(),
            });
        }
        Ok(resp)
    }

    /// 非流式：读完整个响应体，取第一个 choice 的内容
    pub async fn read_completion(resp: reqwest::Response) -> Result<String, ChatError> {
        let body = resp
            .bytes()
            .await
            .map_err(|e| ChatError::from_reqwest("failed to read upstream body", e))?;
        let parsed: CompletionResponse =
            serde_json::from_slice(&body).map_err(|e| ChatError::ApiError {
                status: 200,
                message: format!("Error unmarshaling API response: {}", e),
            })?;
        Ok(parsed.answer().to_string())
    }

    pub fn parse_sse_line(line: &str) -> SseLine {
        let trimmed = line.trim();
        if trimmed.is_empty() {
            return SseLine::Blank;
        }

        let data = match trimmed.strip_prefix("data:") {
            Some(data) => data.trim(),
            None => return SseLine::Ignored,
        };

        if data == "[DONE]" {
            return SseLine::Done;
        }
        if data.is_empty() {
            return SseLine::Blank;
        }

        match serde_json::from_str::<StreamEvent>(data) {
            Ok(event) => SseLine::Event(event),
            Err(e) => {
                let preview: String = data.chars().take(200).collect();
                SseLine::Malformed(format!("{}: {}", e, preview))
            }
        }
    }
}

/// 按行读取响应体。按字节切行，跨数据块的多字节字符不会被截断。
pub struct SseLineReader {
    stream: BoxStream<'static, Result<Bytes, reqwest::Error>>,
    buffer: Vec<u8>,
    finished: bool,
}

impl SseLineReader {
    pub fn new(resp: reqwest::Response) -> Self {
        Self {
            stream: resp.bytes_stream().boxed(),
            buffer: Vec::new(),
            finished: false,
        }
    }

    /// 下一行（不含换行符）；`Ok(None)` 表示正常 EOF
    pub async fn next_line(&mut self) -> Result<Option<String>, ChatError> {
        loop {
            if let Some(pos) = self.buffer.iter().position(|&b| b == b'\n') {
                let mut line: Vec<u8> = self.buffer.drain(..=pos).collect();
                line.pop();
                if line.last() == Some(&b'\r') {
                    line.pop();
                }
                return Ok(Some(String::from_utf8_lossy(&line).into_owned()));
            }

            if self.finished {
                if self.buffer.is_empty() {
                    return Ok(None);
                }
                // 末尾没有换行的最后一行
                let rest = std::mem::take(&mut self.buffer);
                return Ok(Some(String::from_utf8_lossy(&rest).into_owned()));
            }

            match self.stream.next().await {
                Some(Ok(chunk)) => self.buffer.extend_from_slice(&chunk),
                Some(Err(e)) => {
                    return Err(ChatError::StreamError {
                        message: if e.is_timeout() {
                            format!("read timed out: {}", e)
                        } else {
                            format!("stream interrupted: {}", e)
                        },
                    })
                }
                None => self.finished = true,
            }
        }
    }
}

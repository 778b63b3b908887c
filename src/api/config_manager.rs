use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};

use super::error_handler::ChatError;

/// 网关设置，全部字段都有默认值，旧配置文件缺字段时照样能读
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GatewaySettings {
    pub port: u16,
    /// OpenAI 兼容的 chat/completions 地址
    pub upstream_url: String,
    pub upstream_token: String,
    pub model: String,
    /// 上游是否以 SSE 流式返回
    pub use_sse: bool,
    /// 遇到标点时切段的概率（0-100）
    pub split_by_punctuations: u32,
    /// 为空则不注入系统提示词
    pub system_prompt: String,
    /// 历史 + 当前问题的字符预算
    pub max_history_chars: usize,

    /// OneBot HTTP API 地址，例如 http://127.0.0.1:5700
    pub onebot_http_path: String,
    pub use_private_sse: bool,
    /// SSE 结束标记上附带的快捷回复
    pub prompt_keyboard: Vec<String>,

    /// 0 表示不限制
    pub question_max_length: usize,
    pub question_too_long_reply: String,
    pub group_hint_words: Vec<String>,
    /// 群里所有人共用一个对话上下文；默认每人各一个
    pub group_context: bool,
    /// 群消息未命中提示词时仍然回复的概率（0-100）
    pub group_hint_chance: u32,
    pub restore_commands: Vec<String>,
    pub restore_response: String,

    pub connect_timeout_secs: u64,
    /// 单次读取超时，0 表示不设
    pub read_timeout_secs: u64,
    /// 非流式请求的总超时，0 表示不设
    pub request_timeout_secs: u64,
    pub state_ttl_secs: u64,
    pub eviction_interval_secs: u64,
}

impl Default for GatewaySettings {
    fn default() -> Self {
        Self {
            port: 46233,
            upstream_url: "https://api.openai.com/v1/chat/completions".to_string(),
            upstream_token: String::new(),
            model: "gpt-3.5-turbo".to_string(),
            use_sse: true,
            split_by_punctuations: 40,
            system_prompt: String::new(),
            max_history_chars: 4096,
            onebot_http_path: "http://127.0.0.1:5700".to_string(),
            use_private_sse: false,
            prompt_keyboard: Vec::new(),
            question_max_length: 0,
            question_too_long_reply: "问题太长了，请精简一下再问。".to_string(),
            group_hint_words: Vec::new(),
            group_context: false,
            group_hint_chance: 0,
            restore_commands: vec!["重置".to_string()],
            restore_response: "已开启新的对话。".to_string(),
            connect_timeout_secs: 30,
            read_timeout_secs: 180,
            request_timeout_secs: 300,
            state_ttl_secs: 1800,
            eviction_interval_secs: 300,
        }
    }
}

pub struct ConfigManager {
    config_path: String,
}

impl ConfigManager {
    pub fn new(config_path: &str) -> Self {
        Self {
            config_path: config_path.to_string(),
        }
    }

    /// 加载设置。如果文件不存在或无法解析，返回默认设置。
    pub fn load_settings(&self) -> GatewaySettings {
        let file_path = Path::new(&self.config_path).join("settings.json");
        match fs::read_to_string(&file_path) {
            Ok(contents) => match serde_json::from_str(&contents) {
                Ok(settings) => settings,
                Err(e) => {
                    log::warn!(
                        "settings file {} is invalid, using defaults: {}",
                        file_path.display(),
                        e
                    );
                    GatewaySettings::default()
                }
            },
            Err(_) => GatewaySettings::default(),
        }
    }

    /// 启动时调用：没有 settings.json 就把默认设置写出去，方便照着改
    pub fn load_or_init(&self) -> Result<GatewaySettings, ChatError> {
        let file_path = Path::new(&self.config_path).join("settings.json");
        if file_path.exists() {
            return Ok(self.load_settings());
        }
        let settings = GatewaySettings::default();
        self.save_settings(&settings)?;
        log::info!("wrote default settings to {}", file_path.display());
        Ok(settings)
    }

    /// 保存设置到 JSON 文件。如果目录不存在则自动创建。
    pub fn save_settings(&self, settings: &GatewaySettings) -> Result<(), ChatError> {
        let dir = Path::new(&self.config_path);
        if !dir.exists() {
            fs::create_dir_all(dir).map_err(|e| ChatError::StorageError {
                message: format!("Failed to create config directory: {}", e),
            })?;
        }

        let json = serde_json::to_string_pretty(settings).map_err(|e| ChatError::StorageError {
            message: format!("Failed to serialize settings: {}", e),
        })?;

        let file_path = dir.join("settings.json");
        fs::write(&file_path, json).map_err(|e| ChatError::StorageError {
            message: format!("Failed to write settings file: {}", e),
        })?;

        Ok(())
    }
}

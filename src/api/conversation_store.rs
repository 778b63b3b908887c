use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

use super::data_models::*;
use super::error_handler::ChatError;

/// 对话历史存储：每个对话一个 msgpack 文件，只追加不修改。
/// 读改写整体串行，避免并发轮次互相覆盖。
pub struct ConversationStore {
    pub base_path: String,
    write_lock: Mutex<()>,
}

impl ConversationStore {
    pub fn new(base_path: &str) -> Self {
        Self {
            base_path: base_path.to_string(),
            write_lock: Mutex::new(()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, ()> {
        self.write_lock.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn conversations_dir(&self) -> Result<PathBuf, ChatError> {
        let dir = PathBuf::from(&self.base_path).join("conversations");
        if !dir.exists() {
            fs::create_dir_all(&dir).map_err(|e| ChatError::StorageError {
                message: format!("Failed to create conversations directory: {}", e),
            })?;
        }
        Ok(dir)
    }

    /// 对话 id 会直接拼进文件名，只允许 `[A-Za-z0-9_-]{1,64}`
    pub fn is_valid_conversation_id(id: &str) -> bool {
        !id.is_empty()
            && id.len() <= 64
            && id
                .bytes()
                .all(|b| b.is_ascii_alphanumeric() || b == b'-' || b == b'_')
    }

    pub fn validate_conversation_id(id: &str) -> Result<(), ChatError> {
        if Self::is_valid_conversation_id(id) {
            Ok(())
        } else {
            Err(ChatError::ValidationError {
                message: format!("Invalid conversation id '{}'", id.chars().take(80).collect::<String>()),
            })
        }
    }

    fn conversation_path(&self, id: &str) -> Result<PathBuf, ChatError> {
        Self::validate_conversation_id(id)?;
        Ok(self.conversations_dir()?.join(format!("{}.msgpack", id)))
    }

    /// 先写临时文件再 rename，读者不会看到写了一半的文件
    fn write_atomic(path: &Path, data: &[u8]) -> Result<(), ChatError> {
        let tmp = path.with_extension("msgpack.tmp");
        fs::write(&tmp, data).map_err(|e| ChatError::StorageError {
            message: format!("Failed to write {}: {}", tmp.display(), e),
        })?;
        fs::rename(&tmp, path).map_err(|e| ChatError::StorageError {
            message: format!("Failed to replace {}: {}", path.display(), e),
        })
    }

    fn user_contexts_path(&self) -> Result<PathBuf, ChatError> {
        let dir = PathBuf::from(&self.base_path);
        if !dir.exists() {
            fs::create_dir_all(&dir).map_err(|e| ChatError::StorageError {
                message: format!("Failed to create data directory: {}", e),
            })?;
        }
        Ok(dir.join("user_contexts.msgpack"))
    }

    fn new_conversation(id: &str) -> Conversation {
        let now = chrono::Utc::now().timestamp_millis();
        Conversation {
            id: id.to_string(),
            messages: Vec::new(),
            created_at: now,
            updated_at: now,
        }
    }

    fn save_conversation(&self, conversation: &Conversation) -> Result<(), ChatError> {
        let path = self.conversation_path(&conversation.id)?;
        let data = rmp_serde::to_vec(conversation).map_err(|e| ChatError::StorageError {
            message: format!("Failed to serialize conversation: {}", e),
        })?;
        Self::write_atomic(&path, &data)
    }

    fn read_conversation(&self, id: &str) -> Result<Option<Conversation>, ChatError> {
        let path = self.conversation_path(id)?;
        if !path.exists() {
            return Ok(None);
        }
        let data = fs::read(&path).map_err(|e| ChatError::StorageError {
            message: format!("Failed to read conversation file '{}': {}", id, e),
        })?;
        rmp_serde::from_slice(&data)
            .map(Some)
            .map_err(|e| ChatError::StorageError {
                message: format!("Failed to deserialize conversation '{}': {}", id, e),
            })
    }

    /// 新建一个空对话并落盘；已存在时原样返回
    pub fn create_conversation(&self, id: &str) -> Result<Conversation, ChatError> {
        let _guard = self.lock();
        if let Some(existing) = self.read_conversation(id)? {
            return Ok(existing);
        }
        let conv = Self::new_conversation(id);
        self.save_conversation(&conv)?;
        Ok(conv)
    }

    pub fn load_conversation(&self, id: &str) -> Result<Conversation, ChatError> {
        self.read_conversation(id)?
            .ok_or_else(|| ChatError::StorageError {
                message: format!("Conversation '{}' not found", id),
            })
    }

    /// 追加一条消息，返回消息 id。对话不存在时顺带创建。
    pub fn add_message(&self, message: Message) -> Result<String, ChatError> {
        let _guard = self.lock();
        let mut conv = self
            .read_conversation(&message.conversation_id)?
            .unwrap_or_else(|| Self::new_conversation(&message.conversation_id));

        let id = message.id.clone();
        conv.messages.push(message);
        conv.updated_at = chrono::Utc::now().timestamp_millis();
        self.save_conversation(&conv)?;
        Ok(id)
    }

    /// 从 parent_message_id 沿父指针回溯，按时间正序返回整条链
    pub fn get_history(
        &self,
        conversation_id: &str,
        parent_message_id: &str,
    ) -> Result<Vec<Message>, ChatError> {
        let conv = match self.read_conversation(conversation_id)? {
            Some(c) => c,
            None => return Ok(Vec::new()),
        };
        let by_id: HashMap<&str, &Message> =
            conv.messages.iter().map(|m| (m.id.as_str(), m)).collect();

        let mut chain = Vec::new();
        let mut cursor = Some(parent_message_id);
        while let Some(id) = cursor {
            let Some(msg) = by_id.get(id) else { break };
            chain.push((*msg).clone());
            // 防御损坏数据形成的环
            if chain.len() > conv.messages.len() {
                break;
            }
            cursor = msg.parent_message_id.as_deref();
        }
        chain.reverse();
        Ok(chain)
    }

    fn read_user_contexts(&self) -> Result<HashMap<String, UserContext>, ChatError> {
        let path = self.user_contexts_path()?;
        if !path.exists() {
            return Ok(HashMap::new());
        }
        let data = fs::read(&path).map_err(|e| ChatError::StorageError {
            message: format!("Failed to read user contexts: {}", e),
        })?;
        rmp_serde::from_slice(&data).map_err(|e| ChatError::StorageError {
            message: format!("Failed to deserialize user contexts: {}", e),
        })
    }

    fn write_user_contexts(&self, contexts: &HashMap<String, UserContext>) -> Result<(), ChatError> {
        let path = self.user_contexts_path()?;
        let data = rmp_serde::to_vec(contexts).map_err(|e| ChatError::StorageError {
            message: format!("Failed to serialize user contexts: {}", e),
        })?;
        Self::write_atomic(&path, &data)
    }

    /// 取 IM 用户当前的对话位置，没有就开一个新对话
    pub fn user_context(&self, user_key: &str) -> Result<UserContext, ChatError> {
        let _guard = self.lock();
        let mut contexts = self.read_user_contexts()?;
        if let Some(ctx) = contexts.get(user_key) {
            return Ok(ctx.clone());
        }
        let ctx = UserContext {
            conversation_id: uuid::Uuid::new_v4().to_string(),
            parent_message_id: String::new(),
        };
        self.save_conversation(&Self::new_conversation(&ctx.conversation_id))?;
        contexts.insert(user_key.to_string(), ctx.clone());
        self.write_user_contexts(&contexts)?;
        Ok(ctx)
    }

    /// 一轮结束后把用户的父消息推进到最新的助手消息
    pub fn update_user_context(&self, user_key: &str, message_id: &str) -> Result<(), ChatError> {
        let _guard = self.lock();
        let mut contexts = self.read_user_contexts()?;
        let ctx = contexts
            .get_mut(user_key)
            .ok_or_else(|| ChatError::StorageError {
                message: format!("No context for user '{}'", user_key),
            })?;
        ctx.parent_message_id = message_id.to_string();
        self.write_user_contexts(&contexts)
    }

    /// 重置命令：给用户换一个全新的对话
    pub fn reset_user_context(&self, user_key: &str) -> Result<UserContext, ChatError> {
        let _guard = self.lock();
        let mut contexts = self.read_user_contexts()?;
        let ctx = UserContext {
            conversation_id: uuid::Uuid::new_v4().to_string(),
            parent_message_id: String::new(),
        };
        self.save_conversation(&Self::new_conversation(&ctx.conversation_id))?;
        contexts.insert(user_key.to_string(), ctx.clone());
        self.write_user_contexts(&contexts)?;
        Ok(ctx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn store() -> (TempDir, ConversationStore) {
        let tmp = TempDir::new().unwrap();
        let store = ConversationStore::new(tmp.path().to_str().unwrap());
        (tmp, store)
    }

    #[test]
    fn test_create_conversation_is_idempotent() {
        let (_tmp, store) = store();
        store.create_conversation("c1").unwrap();
        store
            .add_message(Message::new("c1", None, MessageRole::User, "hi"))
            .unwrap();

        let again = store.create_conversation("c1").unwrap();
        assert_eq!(again.messages.len(), 1);
    }

    #[test]
    fn test_add_message_creates_missing_conversation() {
        let (_tmp, store) = store();
        let id = store
            .add_message(Message::new("fresh", None, MessageRole::User, "hello"))
            .unwrap();

        let conv = store.load_conversation("fresh").unwrap();
        assert_eq!(conv.messages.len(), 1);
        assert_eq!(conv.messages[0].id, id);
    }

    #[test]
    fn test_load_missing_conversation_errors() {
        let (_tmp, store) = store();
        match store.load_conversation("nope") {
            Err(ChatError::StorageError { message }) => assert!(message.contains("not found")),
            other => panic!("Expected StorageError, got {:?}", other),
        }
    }

    #[test]
    fn test_get_history_follows_parent_chain() {
        let (_tmp, store) = store();
        let q1 = store
            .add_message(Message::new("c1", None, MessageRole::User, "q1"))
            .unwrap();
        let a1 = store
            .add_message(Message::new("c1", Some(&q1), MessageRole::Assistant, "a1"))
            .unwrap();
        // 分叉：不在链上的消息不应出现
        store
            .add_message(Message::new("c1", Some(&q1), MessageRole::Assistant, "other"))
            .unwrap();
        let q2 = store
            .add_message(Message::new("c1", Some(&a1), MessageRole::User, "q2"))
            .unwrap();

        let history = store.get_history("c1", &q2).unwrap();
        let texts: Vec<&str> = history.iter().map(|m| m.text.as_str()).collect();
        assert_eq!(texts, vec!["q1", "a1", "q2"]);
    }

    #[test]
    fn test_get_history_unknown_parent_is_empty() {
        let (_tmp, store) = store();
        store
            .add_message(Message::new("c1", None, MessageRole::User, "q1"))
            .unwrap();
        assert!(store.get_history("c1", "missing").unwrap().is_empty());
        assert!(store.get_history("nope", "missing").unwrap().is_empty());
    }

    #[test]
    fn test_user_context_lifecycle() {
        let (_tmp, store) = store();
        let ctx = store.user_context("42").unwrap();
        assert!(ctx.parent_message_id.is_empty());
        // 新对话已经落盘
        assert!(store.load_conversation(&ctx.conversation_id).is_ok());

        store.update_user_context("42", "m9").unwrap();
        let same = store.user_context("42").unwrap();
        assert_eq!(same.conversation_id, ctx.conversation_id);
        assert_eq!(same.parent_message_id, "m9");

        let reset = store.reset_user_context("42").unwrap();
        assert_ne!(reset.conversation_id, ctx.conversation_id);
        assert!(reset.parent_message_id.is_empty());
    }

    #[test]
    fn test_conversation_id_charset() {
        assert!(ConversationStore::is_valid_conversation_id("conv-1_A"));
        assert!(ConversationStore::is_valid_conversation_id(
            &uuid::Uuid::new_v4().to_string()
        ));
        assert!(!ConversationStore::is_valid_conversation_id(""));
        assert!(!ConversationStore::is_valid_conversation_id("../../escaped"));
        assert!(!ConversationStore::is_valid_conversation_id("a/b"));
        assert!(!ConversationStore::is_valid_conversation_id("a.b"));
        assert!(!ConversationStore::is_valid_conversation_id(&"x".repeat(65)));
    }

    #[test]
    fn test_path_traversal_id_is_rejected() {
        let tmp = TempDir::new().unwrap();
        let data_dir = tmp.path().join("data");
        let store = ConversationStore::new(data_dir.to_str().unwrap());

        match store.add_message(Message::new("../../escaped", None, MessageRole::User, "hi")) {
            Err(ChatError::ValidationError { .. }) => {}
            other => panic!("Expected ValidationError, got {:?}", other),
        }
        assert!(!tmp.path().join("escaped.msgpack").exists());
        assert!(store.create_conversation("../x").is_err());
        assert!(store.load_conversation("../x").is_err());
    }

    #[test]
    fn test_save_leaves_no_temp_file() {
        let (tmp, store) = store();
        store
            .add_message(Message::new("c1", None, MessageRole::User, "one"))
            .unwrap();
        store
            .add_message(Message::new("c1", None, MessageRole::User, "two"))
            .unwrap();
        store.user_context("42").unwrap();

        let dir = tmp.path().join("conversations");
        assert!(dir.join("c1.msgpack").exists());
        assert!(!dir.join("c1.msgpack.tmp").exists());
        assert!(!tmp.path().join("user_contexts.msgpack.tmp").exists());
        assert_eq!(store.load_conversation("c1").unwrap().messages.len(), 2);
    }

    #[test]
    fn test_update_unknown_user_context_errors() {
        let (_tmp, store) = store();
        assert!(store.update_user_context("ghost", "m1").is_err());
    }
}

use std::collections::hash_map::DefaultHasher;
use std::collections::HashMap;
use std::hash::{Hash, Hasher};
use std::sync::{Mutex, MutexGuard};
use std::time::{Duration, Instant};

use super::chunk_segmenter::{ChanceSource, ChunkSegmenter};
use super::data_models::{ConversationKey, RecipientInfo, StreamIdentifier};
use super::delta_reconciler::DeltaReconciler;

const SHARD_COUNT: usize = 16;

struct Slot<V> {
    value: V,
    touched_at: Instant,
}

/// 分片锁表：每个 key 落在固定分片上，同一 key 的读改写在分片锁内完成。
/// 锁从不跨 `.await` 持有。
pub struct ShardedMap<V> {
    shards: Vec<Mutex<HashMap<String, Slot<V>>>>,
}

impl<V> Default for ShardedMap<V> {
    fn default() -> Self {
        Self::new()
    }
}

impl<V> ShardedMap<V> {
    pub fn new() -> Self {
        Self {
            shards: (0..SHARD_COUNT).map(|_| Mutex::new(HashMap::new())).collect(),
        }
    }

    fn shard(&self, key: &str) -> MutexGuard<'_, HashMap<String, Slot<V>>> {
        let mut hasher = DefaultHasher::new();
        key.hash(&mut hasher);
        let index = (hasher.finish() as usize) % self.shards.len();
        self.shards[index].lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Atomic read-modify-write on one key; the entry is created with
    /// `init` when absent.
    pub fn update<R>(&self, key: &str, init: impl FnOnce() -> V, f: impl FnOnce(&mut V) -> R) -> R {
        let mut shard = self.shard(key);
        let slot = shard.entry(key.to_string()).or_insert_with(|| Slot {
            value: init(),
            touched_at: Instant::now(),
        });
        slot.touched_at = Instant::now();
        f(&mut slot.value)
    }

    pub fn insert(&self, key: &str, value: V) {
        self.shard(key).insert(
            key.to_string(),
            Slot {
                value,
                touched_at: Instant::now(),
            },
        );
    }

    pub fn remove(&self, key: &str) -> Option<V> {
        self.shard(key).remove(key).map(|slot| slot.value)
    }

    /// 清掉超过 ttl 未被访问的条目，返回清掉的数量
    pub fn evict_idle(&self, ttl: Duration) -> usize {
        let mut evicted = 0;
        for shard in &self.shards {
            let mut shard = shard.lock().unwrap_or_else(|e| e.into_inner());
            let before = shard.len();
            shard.retain(|_, slot| slot.touched_at.elapsed() < ttl);
            evicted += before - shard.len();
        }
        evicted
    }

    pub fn len(&self) -> usize {
        self.shards
            .iter()
            .map(|s| s.lock().unwrap_or_else(|e| e.into_inner()).len())
            .sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<V: Clone> ShardedMap<V> {
    pub fn get(&self, key: &str) -> Option<V> {
        self.shard(key).get(key).map(|slot| slot.value.clone())
    }
}

/// 进程级的轮次状态：收件人登记、会话→流标识映射、已投递分段缓冲、
/// 累积器和分段器。由 `Arc` 共享给所有请求。
pub struct TurnState {
    recipients: ShardedMap<RecipientInfo>,
    stream_ids: ShardedMap<StreamIdentifier>,
    pending_chunks: ShardedMap<String>,
    pub reconciler: DeltaReconciler,
    pub segmenter: ChunkSegmenter,
}

impl TurnState {
    pub fn new(split_percent: u32, chance: Box<dyn ChanceSource>) -> Self {
        Self {
            recipients: ShardedMap::new(),
            stream_ids: ShardedMap::new(),
            pending_chunks: ShardedMap::new(),
            reconciler: DeltaReconciler::new(),
            segmenter: ChunkSegmenter::new(split_percent, chance),
        }
    }

    // ── ConversationContext ──

    pub fn put_recipient(&self, key: &str, info: RecipientInfo) {
        self.recipients.insert(key, info);
    }

    pub fn recipient(&self, key: &str) -> Option<RecipientInfo> {
        self.recipients.get(key)
    }

    pub fn remove_recipient(&self, key: &str) -> Option<RecipientInfo> {
        self.recipients.remove(key)
    }

    // ── ConversationKey → StreamIdentifier ──

    pub fn bind_stream(&self, key: &str, stream_id: &str) {
        self.stream_ids.insert(key, stream_id.to_string());
    }

    pub fn stream_for(&self, key: &str) -> Option<StreamIdentifier> {
        self.stream_ids.get(key)
    }

    // ── PendingChunkBuffer ──

    pub fn append_pending(&self, recipient: &RecipientInfo, chunk: &str) {
        self.pending_chunks
            .update(&recipient.key(), String::new, |buf| buf.push_str(chunk));
    }

    pub fn pending(&self, recipient: &RecipientInfo) -> String {
        self.pending_chunks.get(&recipient.key()).unwrap_or_default()
    }

    pub fn clear_pending(&self, recipient: &RecipientInfo) {
        self.pending_chunks.remove(&recipient.key());
    }

    /// 新一轮开始：丢掉上一轮残留的流映射、未切出的文本和已投递缓冲
    pub fn begin_turn(&self, key: &ConversationKey) {
        self.end_turn(key);
    }

    /// 轮次结束（正常或出错）后的清理，收件人登记保留给下一轮覆盖
    pub fn end_turn(&self, key: &ConversationKey) {
        if let Some(stream_id) = self.stream_ids.remove(key) {
            self.reconciler.finish(&stream_id);
        }
        self.segmenter.clear(key);
        if let Some(recipient) = self.recipient(key) {
            self.clear_pending(&recipient);
        }
    }

    /// 定时清扫：长时间没被碰过的条目视为被遗弃的轮次
    pub fn evict_idle(&self, ttl: Duration) -> usize {
        self.recipients.evict_idle(ttl)
            + self.stream_ids.evict_idle(ttl)
            + self.pending_chunks.evict_idle(ttl)
            + self.reconciler.evict_idle(ttl)
            + self.segmenter.evict_idle(ttl)
    }

    pub fn tracked_streams(&self) -> usize {
        self.stream_ids.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::chunk_segmenter::FixedChance;
    use crate::api::data_models::{DeliveryMode, MessageKind};
    use std::sync::Arc;

    fn recipient(user_id: i64) -> RecipientInfo {
        RecipientInfo {
            user_id,
            group_id: 0,
            kind: MessageKind::Private,
            delivery: DeliveryMode::Plain,
        }
    }

    #[test]
    fn test_sharded_map_update_creates_and_mutates() {
        let map: ShardedMap<u32> = ShardedMap::new();
        map.update("a", || 1, |v| *v += 1);
        map.update("a", || 100, |v| *v += 1);
        assert_eq!(map.get("a"), Some(3));
        assert_eq!(map.get("b"), None);
    }

    #[test]
    fn test_sharded_map_evict_idle() {
        let map: ShardedMap<u32> = ShardedMap::new();
        map.insert("a", 1);
        map.insert("b", 2);
        assert_eq!(map.evict_idle(Duration::from_secs(60)), 0);
        assert_eq!(map.evict_idle(Duration::ZERO), 2);
        assert!(map.is_empty());
    }

    #[test]
    fn test_sharded_map_concurrent_updates() {
        let map: Arc<ShardedMap<u64>> = Arc::new(ShardedMap::new());
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let map = map.clone();
                std::thread::spawn(move || {
                    for i in 0..1000 {
                        map.update(&format!("k{}", i % 4), || 0, |v| *v += 1);
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        let total: u64 = (0..4).map(|i| map.get(&format!("k{}", i)).unwrap()).sum();
        assert_eq!(total, 8000);
    }

    #[test]
    fn test_recipient_put_is_overwrite() {
        let state = TurnState::new(100, Box::new(FixedChance(0)));
        state.put_recipient("c1", recipient(1));
        state.put_recipient("c1", recipient(2));
        assert_eq!(state.recipient("c1").map(|r| r.user_id), Some(2));
        assert!(state.recipient("c2").is_none());
        assert_eq!(state.remove_recipient("c1").map(|r| r.user_id), Some(2));
        assert!(state.recipient("c1").is_none());
    }

    #[test]
    fn test_end_turn_tears_down_stream_state() {
        let state = TurnState::new(100, Box::new(FixedChance(0)));
        state.put_recipient("c1", recipient(1));
        state.bind_stream("c1", "s1");
        state.reconciler.reconcile("s1", "hello");
        state.append_pending(&recipient(1), "he");

        state.end_turn(&"c1".to_string());

        assert!(state.stream_for("c1").is_none());
        assert!(state.reconciler.complete_text("s1").is_none());
        assert!(state.pending(&recipient(1)).is_empty());
        // 收件人登记留着，由下一轮覆盖
        assert!(state.recipient("c1").is_some());
        assert_eq!(state.tracked_streams(), 0);
    }

    #[test]
    fn test_begin_turn_drops_previous_remainder() {
        let state = TurnState::new(0, Box::new(FixedChance(0)));
        state.segmenter.push("c1", "残留的半句");
        state.begin_turn(&"c1".to_string());
        assert_eq!(state.segmenter.take_remainder("c1"), None);
    }
}

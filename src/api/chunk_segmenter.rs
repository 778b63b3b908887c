use std::time::Duration;

use rand::Rng;

use super::turn_state::ShardedMap;

/// 可能结束一个分段的标点
pub const BOUNDARY_PUNCTUATION: [char; 9] = ['。', '！', '？', '，', ',', '.', '!', '?', '~'];

pub fn is_boundary(c: char) -> bool {
    BOUNDARY_PUNCTUATION.contains(&c)
}

/// 随机源：返回 [0, 100) 内的整数。测试里换成固定值。
pub trait ChanceSource: Send + Sync {
    fn roll(&self) -> u32;
}

pub struct ThreadRngChance;

impl ChanceSource for ThreadRngChance {
    fn roll(&self) -> u32 {
        rand::rng().random_range(0..100)
    }
}

/// 每次都掷出同一个值
pub struct FixedChance(pub u32);

impl ChanceSource for FixedChance {
    fn roll(&self) -> u32 {
        self.0
    }
}

/// 按百分比判定：掷出的值小于 percent 即通过
pub fn chance_passes(percent: u32, source: &dyn ChanceSource) -> bool {
    if percent == 0 {
        return false;
    }
    if percent >= 100 {
        return true;
    }
    source.roll() < percent
}

/// 分段器：逐字累积，遇到标点按概率切出一段。待发文本按会话标识分开存放。
pub struct ChunkSegmenter {
    split_percent: u32,
    chance: Box<dyn ChanceSource>,
    pending: ShardedMap<String>,
}

impl ChunkSegmenter {
    pub fn new(split_percent: u32, chance: Box<dyn ChanceSource>) -> Self {
        Self {
            split_percent: split_percent.min(100),
            chance,
            pending: ShardedMap::new(),
        }
    }

    /// 喂入一个字符；如果这个字符触发了切段，返回切出的文本
    pub fn push_char(&self, key: &str, c: char) -> Option<String> {
        let flush = is_boundary(c) && chance_passes(self.split_percent, self.chance.as_ref());
        self.pending.update(key, String::new, |buf| {
            buf.push(c);
            if flush {
                Some(std::mem::take(buf))
            } else {
                None
            }
        })
    }

    /// 逐字喂入一段新增文本，按顺序返回切出的所有分段
    pub fn push(&self, key: &str, text: &str) -> Vec<String> {
        text.chars().filter_map(|c| self.push_char(key, c)).collect()
    }

    /// 流结束时取出剩余未切出的文本
    pub fn take_remainder(&self, key: &str) -> Option<String> {
        self.pending.remove(key).filter(|rest| !rest.is_empty())
    }

    pub fn clear(&self, key: &str) {
        self.pending.remove(key);
    }

    pub fn evict_idle(&self, ttl: Duration) -> usize {
        self.pending.evict_idle(ttl)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_chance_passes_bounds() {
        assert!(!chance_passes(0, &FixedChance(0)));
        assert!(chance_passes(100, &FixedChance(99)));
        assert!(chance_passes(50, &FixedChance(49)));
        assert!(!chance_passes(50, &FixedChance(50)));
    }

    #[test]
    fn test_thread_rng_in_range() {
        let source = ThreadRngChance;
        for _ in 0..200 {
            assert!(source.roll() < 100);
        }
    }

    #[test]
    fn test_always_split_flushes_at_every_boundary() {
        let seg = ChunkSegmenter::new(100, Box::new(FixedChance(99)));
        let chunks = seg.push("c1", "你好，今天怎么样？还不错!嗯");
        assert_eq!(chunks, vec!["你好，", "今天怎么样？", "还不错!"]);
        assert_eq!(seg.take_remainder("c1").as_deref(), Some("嗯"));
    }

    #[test]
    fn test_never_split_only_remainder() {
        let seg = ChunkSegmenter::new(0, Box::new(FixedChance(0)));
        let chunks = seg.push("c1", "Hi, there. How are you?");
        assert!(chunks.is_empty());
        assert_eq!(
            seg.take_remainder("c1").as_deref(),
            Some("Hi, there. How are you?")
        );
        assert_eq!(seg.take_remainder("c1"), None);
    }

    #[test]
    fn test_partial_probability_uses_draw() {
        let below = ChunkSegmenter::new(30, Box::new(FixedChance(29)));
        assert_eq!(below.push("c", "a.b"), vec!["a."]);

        let above = ChunkSegmenter::new(30, Box::new(FixedChance(30)));
        assert!(above.push("c", "a.b").is_empty());
    }

    #[test]
    fn test_chunks_span_multiple_pushes() {
        let seg = ChunkSegmenter::new(100, Box::new(FixedChance(0)));
        assert!(seg.push("c1", "He").is_empty());
        assert!(seg.push("c1", "llo").is_empty());
        assert_eq!(seg.push("c1", "!"), vec!["Hello!"]);
        assert_eq!(seg.take_remainder("c1"), None);
    }

    #[test]
    fn test_conversations_do_not_share_buffers() {
        let seg = ChunkSegmenter::new(100, Box::new(FixedChance(0)));
        seg.push("a", "AAA");
        seg.push("b", "BBB");
        assert_eq!(seg.push("a", "。"), vec!["AAA。"]);
        assert_eq!(seg.take_remainder("b").as_deref(), Some("BBB"));
    }

    #[test]
    fn test_clear_discards_pending() {
        let seg = ChunkSegmenter::new(0, Box::new(FixedChance(0)));
        seg.push("c1", "leftover");
        seg.clear("c1");
        assert_eq!(seg.take_remainder("c1"), None);
    }
}

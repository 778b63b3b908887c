use std::time::Duration;

use super::turn_state::ShardedMap;

/// 每个流标识对应的累积状态
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Accumulator {
    /// 上游最近一次发来的原始片段，只用来剥离重叠前缀
    pub last_fragment: String,
    /// 到目前为止重建出的完整回答
    pub complete_text: String,
}

/// Computes the new suffix of `fragment` relative to the previous raw
/// fragment.
///
/// - identical repeat: the whole fragment counts as new
/// - strict extension: only the part after `last` is new
/// - anything else: the whole fragment counts as new, nothing is dropped
pub fn new_suffix<'a>(last: &str, fragment: &'a str) -> &'a str {
    if fragment == last {
        return fragment;
    }
    match fragment.strip_prefix(last) {
        Some(rest) => rest,
        None => fragment,
    }
}

/// 增量去重器：上游可能重复或带重叠地发送增量，这里还原出真正新增的部分
#[derive(Default)]
pub struct DeltaReconciler {
    accumulators: ShardedMap<Accumulator>,
}

impl DeltaReconciler {
    pub fn new() -> Self {
        Self {
            accumulators: ShardedMap::new(),
        }
    }

    /// 返回本片段真正新增的文本，并更新该流的累积状态。
    /// 同一 stream_id 的读改写在分片锁内完成。
    pub fn reconcile(&self, stream_id: &str, fragment: &str) -> String {
        self.accumulators.update(stream_id, Accumulator::default, |acc| {
            let suffix = new_suffix(&acc.last_fragment, fragment).to_string();
            acc.last_fragment = fragment.to_string();
            acc.complete_text.push_str(&suffix);
            suffix
        })
    }

    pub fn complete_text(&self, stream_id: &str) -> Option<String> {
        self.accumulators.get(stream_id).map(|acc| acc.complete_text)
    }

    /// 轮次结束时移除累积器，返回完整文本
    pub fn finish(&self, stream_id: &str) -> Option<String> {
        self.accumulators
            .remove(stream_id)
            .map(|acc| acc.complete_text)
    }

    pub fn evict_idle(&self, ttl: Duration) -> usize {
        self.accumulators.evict_idle(ttl)
    }

    pub fn len(&self) -> usize {
        self.accumulators.len()
    }

    pub fn is_empty(&self) -> bool {
        self.accumulators.is_empty()
    }
}

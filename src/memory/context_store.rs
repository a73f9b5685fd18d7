//! 上下文存储：单次运行的有序、只追加 Turn 日志
//!
//! append / snapshot / compress。compress 在 Reasoning Port 报告上下文溢出时由 Supervisor 调用：
//! 保留全部 system 条目，再从最新往回保留尽量多的非 system 条目使总大小 ≤ budget，
//! 可选地把丢弃的中间段折叠成一条摘要条目（摘要本身由外部 Summarizer 提供）。
//! 摘要条目不算固定的 system 条目：再次压缩时它和普通条目一样可以被丢弃并折叠进新的摘要。
//! 压缩从不重排保留的条目，也从不丢弃最新一条。

use std::sync::Arc;

use crate::memory::token_budget::{token_size, SizeFn};
use crate::memory::Turn;

/// 摘要协作者：把被丢弃的条目折叠成一段文本；返回 None 表示不生成摘要
pub trait Summarizer: Send + Sync {
    fn summarize(&self, dropped: &[Turn]) -> Option<String>;
}

/// 不生成摘要，直接丢弃
#[derive(Debug, Default, Clone, Copy)]
pub struct NoSummarizer;

impl Summarizer for NoSummarizer {
    fn summarize(&self, _dropped: &[Turn]) -> Option<String> {
        None
    }
}

/// 只记录省略了多少条，不尝试理解内容
#[derive(Debug, Default, Clone, Copy)]
pub struct MarkerSummarizer;

impl Summarizer for MarkerSummarizer {
    fn summarize(&self, dropped: &[Turn]) -> Option<String> {
        if dropped.is_empty() {
            return None;
        }
        let folded = dropped.iter().filter(|t| t.summary).count();
        let turns = dropped.len() - folded;
        let tools = dropped.iter().filter(|t| t.capability.is_some()).count();
        let mut text = format!(
            "Previous conversation summary: {} earlier turns omitted ({} tool results).",
            turns, tools
        );
        if folded > 0 {
            text.push_str(&format!(" {} earlier summaries folded.", folded));
        }
        Some(text)
    }
}

/// 一次压缩的结果
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CompressionReport {
    pub removed: usize,
    pub retained: usize,
    pub size_before: usize,
    pub size_after: usize,
    pub summarized: bool,
}

impl CompressionReport {
    pub fn is_noop(&self) -> bool {
        self.removed == 0 && !self.summarized
    }
}

/// 单次运行的上下文存储；由该运行的 StepEngine / Supervisor 独占
pub struct ContextStore {
    turns: Vec<Turn>,
    sizes: Vec<usize>,
    size_fn: SizeFn,
    summarizer: Arc<dyn Summarizer>,
}

impl Default for ContextStore {
    fn default() -> Self {
        Self::new()
    }
}

impl ContextStore {
    pub fn new() -> Self {
        Self {
            turns: Vec::new(),
            sizes: Vec::new(),
            size_fn: token_size(),
            summarizer: Arc::new(NoSummarizer),
        }
    }

    pub fn with_size_fn(mut self, size_fn: SizeFn) -> Self {
        self.sizes = self.turns.iter().map(|t| size_fn(t)).collect();
        self.size_fn = size_fn;
        self
    }

    pub fn with_summarizer(self, summarizer: impl Summarizer + 'static) -> Self {
        self.with_shared_summarizer(Arc::new(summarizer))
    }

    pub fn with_shared_summarizer(mut self, summarizer: Arc<dyn Summarizer>) -> Self {
        self.summarizer = summarizer;
        self
    }

    pub fn append(&mut self, turn: Turn) {
        self.sizes.push((self.size_fn)(&turn));
        self.turns.push(turn);
    }

    /// 按追加顺序返回全部条目
    pub fn snapshot(&self) -> Vec<Turn> {
        self.turns.clone()
    }

    pub fn turns(&self) -> &[Turn] {
        &self.turns
    }

    pub fn len(&self) -> usize {
        self.turns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.turns.is_empty()
    }

    pub fn total_size(&self) -> usize {
        self.sizes.iter().sum()
    }

    pub fn last(&self) -> Option<&Turn> {
        self.turns.last()
    }

    /// 按调用 id 查找结果条目
    pub fn result_for(&self, invocation_id: &str) -> Option<&Turn> {
        self.turns
            .iter()
            .find(|t| t.capability.is_some() && t.invocation_id.as_deref() == Some(invocation_id))
    }

    /// 最近一条 assistant 文本
    pub fn last_assistant_text(&self) -> Option<String> {
        self.turns
            .iter()
            .rev()
            .find(|t| t.role == crate::memory::Role::Assistant && !t.text_content().is_empty())
            .map(|t| t.text_content())
    }

    /// 压缩到 budget 以内（尽力而为：system 条目与最新一条无论如何都保留）
    pub fn compress(&mut self, budget: usize) -> CompressionReport {
        let size_before = self.total_size();
        if size_before <= budget || self.turns.is_empty() {
            return CompressionReport {
                removed: 0,
                retained: self.turns.len(),
                size_before,
                size_after: size_before,
                summarized: false,
            };
        }

        let n = self.turns.len();
        let last = n - 1;
        let mut keep = vec![false; n];
        let mut used = 0usize;
        for i in 0..n {
            if self.turns[i].is_pinned() {
                keep[i] = true;
                used += self.sizes[i];
            }
        }
        if !keep[last] {
            keep[last] = true;
            used += self.sizes[last];
        }

        // 从最新往回保留连续的一段非 system 条目
        for i in (0..last).rev() {
            if keep[i] {
                continue;
            }
            if used + self.sizes[i] > budget {
                break;
            }
            keep[i] = true;
            used += self.sizes[i];
        }

        let mut dropped: Vec<usize> = (0..n).filter(|&i| !keep[i]).collect();
        if dropped.is_empty() {
            // 只剩 system 条目与最新一条仍超预算，无可丢弃
            return CompressionReport {
                removed: 0,
                retained: n,
                size_before,
                size_after: size_before,
                summarized: false,
            };
        }

        // 摘要条目也要占预算：放不下时依次让出最旧的非 system 保留条目（最新一条除外）
        let mut summary = self.summarize_indices(&dropped);
        while let Some((_, summary_size)) = &summary {
            if used + summary_size <= budget {
                break;
            }
            let oldest_kept = (0..last).find(|&i| keep[i] && !self.turns[i].is_pinned());
            match oldest_kept {
                Some(i) => {
                    keep[i] = false;
                    used -= self.sizes[i];
                    dropped.push(i);
                    dropped.sort_unstable();
                    summary = self.summarize_indices(&dropped);
                }
                None => {
                    summary = None;
                }
            }
        }

        let summary_at = dropped[0];
        let mut turns = Vec::with_capacity(n - dropped.len() + 1);
        let mut sizes = Vec::with_capacity(turns.capacity());
        let old_turns = std::mem::take(&mut self.turns);
        let old_sizes = std::mem::take(&mut self.sizes);
        let mut summarized = false;
        for (i, (turn, size)) in old_turns.into_iter().zip(old_sizes).enumerate() {
            if i == summary_at {
                if let Some((text, summary_size)) = summary.take() {
                    turns.push(Turn::summary(text));
                    sizes.push(summary_size);
                    summarized = true;
                }
            }
            if keep[i] {
                turns.push(turn);
                sizes.push(size);
            }
        }
        self.turns = turns;
        self.sizes = sizes;

        let report = CompressionReport {
            removed: dropped.len(),
            retained: self.turns.len(),
            size_before,
            size_after: self.total_size(),
            summarized,
        };
        tracing::info!(
            removed = report.removed,
            size_before = report.size_before,
            size_after = report.size_after,
            budget,
            "context compressed"
        );
        report
    }

    fn summarize_indices(&self, dropped: &[usize]) -> Option<(String, usize)> {
        let dropped_turns: Vec<Turn> = dropped.iter().map(|&i| self.turns[i].clone()).collect();
        let text = self.summarizer.summarize(&dropped_turns)?;
        let size = (self.size_fn)(&Turn::summary(text.clone()));
        Some((text, size))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::token_budget::char_size;
    use crate::memory::Role;
    use proptest::prelude::*;

    fn store_with(turns: &[(Role, &str)]) -> ContextStore {
        let mut store = ContextStore::new().with_size_fn(char_size());
        for (role, text) in turns {
            let turn = match role {
                Role::System => Turn::system(*text),
                Role::User => Turn::user(*text),
                _ => Turn::assistant(*text),
            };
            store.append(turn);
        }
        store
    }

    #[test]
    fn test_snapshot_keeps_append_order() {
        let store = store_with(&[(Role::User, "a"), (Role::Assistant, "b"), (Role::User, "c")]);
        let texts: Vec<String> = store.snapshot().iter().map(|t| t.text_content()).collect();
        assert_eq!(texts, vec!["a", "b", "c"]);
    }

    #[test]
    fn test_compress_within_budget_is_noop() {
        let mut store = store_with(&[(Role::System, "sys"), (Role::User, "hello")]);
        let report = store.compress(100);
        assert!(report.is_noop());
        assert_eq!(store.len(), 2);
    }

    #[test]
    fn test_compress_keeps_system_and_recent() {
        let mut store = store_with(&[
            (Role::System, "ssss"),
            (Role::User, "1111111111"),
            (Role::Assistant, "2222222222"),
            (Role::User, "3333"),
            (Role::Assistant, "4444"),
        ]);
        let report = store.compress(12);
        let texts: Vec<String> = store.turns().iter().map(|t| t.text_content()).collect();
        assert_eq!(texts, vec!["ssss", "3333", "4444"]);
        assert_eq!(report.removed, 2);
        assert_eq!(report.size_after, 12);
    }

    #[test]
    fn test_compress_never_drops_last_even_if_oversized() {
        let mut store = store_with(&[
            (Role::System, "ssss"),
            (Role::User, "short"),
            (Role::User, "this last turn alone is way over budget"),
        ]);
        store.compress(5);
        assert_eq!(store.len(), 2);
        assert_eq!(
            store.last().unwrap().text_content(),
            "this last turn alone is way over budget"
        );
        assert!(store.turns()[0].is_system());
    }

    #[test]
    fn test_compress_with_summary_folds_middle() {
        let mut store = store_with(&[
            (Role::System, "s"),
            (Role::User, "x".repeat(200).as_str()),
            (Role::Assistant, "y".repeat(200).as_str()),
            (Role::User, "latest"),
        ])
        .with_summarizer(MarkerSummarizer);
        let report = store.compress(120);
        assert!(report.summarized);
        let turns = store.turns();
        assert_eq!(turns.len(), 3);
        assert!(turns[1].is_system());
        assert!(turns[1].text_content().contains("2 earlier turns omitted"));
        assert_eq!(turns[2].text_content(), "latest");
        assert!(store.total_size() <= 120);
    }

    #[test]
    fn test_repeated_compression_folds_earlier_summary() {
        let mut store = store_with(&[
            (Role::System, "s"),
            (Role::User, "a".repeat(200).as_str()),
            (Role::Assistant, "b".repeat(200).as_str()),
            (Role::User, "latest"),
        ])
        .with_summarizer(MarkerSummarizer);
        store.compress(120);
        assert_eq!(store.turns().iter().filter(|t| t.summary).count(), 1);

        store.append(Turn::assistant("c".repeat(200)));
        store.append(Turn::user("newest"));
        let report = store.compress(120);
        assert!(report.summarized);

        let summaries: Vec<&Turn> = store.turns().iter().filter(|t| t.summary).collect();
        assert_eq!(summaries.len(), 1);
        assert!(summaries[0].text_content().contains("1 earlier summaries folded"));
        assert!(store.turns()[0].is_pinned());
        assert_eq!(store.last().unwrap().text_content(), "newest");
        assert!(store.total_size() <= 120);
    }

    #[test]
    fn test_summary_dropped_when_it_cannot_fit() {
        let mut store = store_with(&[
            (Role::User, "x".repeat(50).as_str()),
            (Role::User, "latest!!"),
        ])
        .with_summarizer(MarkerSummarizer);
        let report = store.compress(10);
        assert!(!report.summarized);
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn test_result_for_finds_tool_turn() {
        use crate::tools::{InvocationRequest, InvocationResult};
        let mut store = ContextStore::new();
        let req = InvocationRequest::from_value("c1", "echo", serde_json::json!({"text": "hi"}));
        store.append(Turn::assistant_with_invocations("", vec![req.clone()]));
        store.append(Turn::tool_result(&InvocationResult::ok(&req, serde_json::json!("hi"))));
        assert_eq!(store.result_for("c1").unwrap().text_content(), "hi");
        assert!(store.result_for("nope").is_none());
    }

    fn arb_turns() -> impl Strategy<Value = Vec<(bool, usize)>> {
        prop::collection::vec((prop::bool::weighted(0.2), 1usize..40), 1..30)
    }

    fn build(layout: &[(bool, usize)]) -> ContextStore {
        let mut store = ContextStore::new().with_size_fn(char_size());
        for (i, (is_system, len)) in layout.iter().enumerate() {
            // 前缀保证内容唯一，便于检查顺序
            let text = format!("{:03}{}", i, "z".repeat(*len));
            store.append(if *is_system { Turn::system(text) } else { Turn::user(text) });
        }
        store
    }

    proptest! {
        #[test]
        fn prop_compress_preserves_order_and_last(layout in arb_turns(), budget in 0usize..400) {
            let mut store = build(&layout);
            let before: Vec<String> = store.turns().iter().map(|t| t.text_content()).collect();
            let last = before.last().cloned().unwrap();
            store.compress(budget);
            let after: Vec<String> = store.turns().iter().map(|t| t.text_content()).collect();

            prop_assert_eq!(after.last().cloned().unwrap(), last);
            // 保留条目是原序列的子序列
            let mut it = before.iter();
            for t in &after {
                prop_assert!(it.any(|b| b == t));
            }
            // system 条目全部保留
            for (i, (is_system, _)) in layout.iter().enumerate() {
                if *is_system {
                    prop_assert!(after.contains(&before[i]));
                }
            }
        }

        #[test]
        fn prop_compress_is_idempotent_below_budget(layout in arb_turns(), budget in 0usize..400) {
            let mut store = build(&layout);
            store.compress(budget);
            if store.total_size() <= budget {
                let once = store.snapshot();
                let report = store.compress(budget);
                prop_assert!(report.is_noop());
                prop_assert_eq!(store.snapshot(), once);
            }
        }
    }
}

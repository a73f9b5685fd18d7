//! 上下文大小度量
//!
//! ContextStore 为每条 Turn 记录一个近似大小；度量函数可替换（token 估算 / 字符数）。

use std::sync::Arc;

use crate::memory::Turn;

/// 可插拔的大小函数
pub type SizeFn = Arc<dyn Fn(&Turn) -> usize + Send + Sync>;

/// Token 估算器（简单的字符计数近似）
pub struct TokenEstimator;

impl TokenEstimator {
    /// 估算文本的 token 数量
    /// 使用简单的启发式规则：英文约 4 字符/token，中文约 1.5 字符/token
    pub fn estimate(text: &str) -> usize {
        let mut ascii_chars = 0;
        let mut non_ascii_chars = 0;

        for c in text.chars() {
            if c.is_ascii() {
                ascii_chars += 1;
            } else {
                non_ascii_chars += 1;
            }
        }

        let tokens = ascii_chars / 4 + (non_ascii_chars as f64 / 1.5).ceil() as usize;
        tokens.max(1)
    }

    /// 估算一条 Turn：内容 + 调用请求（名字与参数也会进入 prompt）
    pub fn estimate_turn(turn: &Turn) -> usize {
        let mut total = Self::estimate(&turn.text_content());
        for inv in &turn.invocations {
            total += Self::estimate(&inv.name) + Self::estimate(&inv.arguments_value().to_string());
        }
        total
    }
}

/// 默认度量：token 估算
pub fn token_size() -> SizeFn {
    Arc::new(TokenEstimator::estimate_turn)
}

/// 备选度量：字符数
pub fn char_size() -> SizeFn {
    Arc::new(|turn: &Turn| turn.text_content().chars().count())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_token_estimator_english() {
        let text = "Hello, world! This is a test.";
        let tokens = TokenEstimator::estimate(text);
        assert!(tokens > 0);
        assert!(tokens < text.len());
    }

    #[test]
    fn test_token_estimator_chinese() {
        let tokens = TokenEstimator::estimate("你好世界，这是一个测试。");
        assert_eq!(tokens, 8);
    }

    #[test]
    fn test_empty_is_at_least_one() {
        assert_eq!(TokenEstimator::estimate(""), 1);
    }

    #[test]
    fn test_size_fns() {
        let turn = Turn::user("abcdefgh");
        assert_eq!(token_size()(&turn), 2);
        assert_eq!(char_size()(&turn), 8);
    }
}

//! Flush policy for streamed reply text.
//!
//! Reply fragments arrive a few characters at a time. Synthesis sounds better
//! with whole phrases but the first audio should start as soon as possible, so
//! pending text is handed over on the first of:
//!
//! 1. nothing flushed yet and at least `first_flush_chars` pending
//! 2. at least `max_pending_chars` pending
//! 3. pending text ends with a sentence terminator
//!
//! Lengths are counted in Unicode code points.

use crate::config::FlushConfig;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FlushPolicy {
    pub first_flush_chars: usize,
    pub max_pending_chars: usize,
    pub terminators: Vec<char>,
}

impl FlushPolicy {
    pub fn from_config(config: &FlushConfig) -> Self {
        Self {
            first_flush_chars: config.first_flush_chars,
            max_pending_chars: config.max_pending_chars,
            terminators: config.terminators.chars().collect(),
        }
    }

    fn should_flush(&self, pending: &str, pending_chars: usize, flushed_any: bool) -> bool {
        if !flushed_any && pending_chars >= self.first_flush_chars {
            return true;
        }
        if pending_chars >= self.max_pending_chars {
            return true;
        }
        pending
            .chars()
            .last()
            .is_some_and(|c| self.terminators.contains(&c))
    }
}

impl Default for FlushPolicy {
    fn default() -> Self {
        Self::from_config(&crate::config::AppConfig::default().flush)
    }
}

/// Pending-text accumulator for one reply.
#[derive(Debug)]
pub struct FlushBuffer<'p> {
    policy: &'p FlushPolicy,
    pending: String,
    pending_chars: usize,
    flushed_any: bool,
}

impl<'p> FlushBuffer<'p> {
    pub fn new(policy: &'p FlushPolicy) -> Self {
        Self {
            policy,
            pending: String::new(),
            pending_chars: 0,
            flushed_any: false,
        }
    }

    /// Append a fragment; returns the text to hand to synthesis, if any.
    pub fn push(&mut self, fragment: &str) -> Option<String> {
        if fragment.is_empty() {
            return None;
        }

        self.pending.push_str(fragment);
        self.pending_chars += fragment.chars().count();

        if self
            .policy
            .should_flush(&self.pending, self.pending_chars, self.flushed_any)
        {
            return Some(self.take());
        }
        None
    }

    /// Remainder at end of stream, if non-empty.
    pub fn finish(&mut self) -> Option<String> {
        if self.pending.is_empty() {
            return None;
        }
        Some(self.take())
    }

    pub fn flushed_any(&self) -> bool {
        self.flushed_any
    }

    fn take(&mut self) -> String {
        self.flushed_any = true;
        self.pending_chars = 0;
        std::mem::take(&mut self.pending)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn drive(policy: &FlushPolicy, fragments: &[&str]) -> Vec<String> {
        let mut buffer = FlushBuffer::new(policy);
        let mut out: Vec<String> = fragments.iter().filter_map(|f| buffer.push(f)).collect();
        out.extend(buffer.finish());
        out
    }

    #[test]
    fn test_first_flush_after_eight_chars() {
        let policy = FlushPolicy::default();
        let flushed = drive(&policy, &["a", "b", "c", "d", "e", "f", "g", "h"]);
        assert_eq!(flushed, vec!["abcdefgh".to_string()]);
    }

    #[test]
    fn test_length_cap_after_first_flush() {
        let policy = FlushPolicy::default();
        let mut buffer = FlushBuffer::new(&policy);

        assert_eq!(buffer.push("12345678").as_deref(), Some("12345678"));
        for _ in 0..23 {
            assert_eq!(buffer.push("x"), None);
        }
        assert_eq!(buffer.push("x").map(|s| s.len()), Some(24));
        assert_eq!(buffer.finish(), None);
    }

    #[test]
    fn test_terminator_flushes_short_text() {
        let policy = FlushPolicy::default();
        let mut buffer = FlushBuffer::new(&policy);

        assert_eq!(buffer.push("你好。").as_deref(), Some("你好。"));
        assert_eq!(buffer.push("ok"), None);
        assert_eq!(buffer.push("?").as_deref(), Some("ok?"));
        assert_eq!(buffer.push("line\n").as_deref(), Some("line\n"));
    }

    #[test]
    fn test_counts_code_points_not_bytes() {
        let policy = FlushPolicy::default();
        let mut buffer = FlushBuffer::new(&policy);

        // 7 CJK chars are 21 bytes but still below the first threshold.
        assert_eq!(buffer.push("今天天气很不错"), None);
        assert_eq!(buffer.push("啊").as_deref(), Some("今天天气很不错啊"));
    }

    #[test]
    fn test_remainder_flushed_at_end() {
        let policy = FlushPolicy::default();
        let flushed = drive(&policy, &["hi", " there"]);
        assert_eq!(flushed, vec!["hi there".to_string()]);
        assert!(drive(&policy, &[]).is_empty());
    }
}

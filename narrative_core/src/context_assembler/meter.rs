//! Size measurement for the context budget.

use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Measures text in the unit the context budget is expressed in.
pub trait SizeMeter: Send + Sync {
    fn measure(&self, text: &str) -> usize;
}

/// Counts Unicode scalar values.
#[derive(Debug, Clone, Copy, Default)]
pub struct CharMeter;

impl SizeMeter for CharMeter {
    fn measure(&self, text: &str) -> usize {
        text.chars().count()
    }
}

/// Approximates tokens as a fixed number of characters, rounded up.
#[derive(Debug, Clone, Copy)]
pub struct TokenMeter {
    pub chars_per_token: usize,
}

impl Default for TokenMeter {
    fn default() -> Self {
        Self { chars_per_token: 4 }
    }
}

impl SizeMeter for TokenMeter {
    fn measure(&self, text: &str) -> usize {
        let per = self.chars_per_token.max(1);
        text.chars().count().div_ceil(per)
    }
}

/// Meter selection as it appears in configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum MeterKind {
    #[default]
    Chars,
    Tokens,
}

impl MeterKind {
    pub fn build(&self) -> Arc<dyn SizeMeter> {
        match self {
            MeterKind::Chars => Arc::new(CharMeter),
            MeterKind::Tokens => Arc::new(TokenMeter::default()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_char_meter_counts_chars_not_bytes() {
        assert_eq!(CharMeter.measure("héllo"), 5);
        assert_eq!(CharMeter.measure(""), 0);
    }

    #[test]
    fn test_token_meter_rounds_up() {
        let meter = TokenMeter::default();
        assert_eq!(meter.measure(""), 0);
        assert_eq!(meter.measure("abc"), 1);
        assert_eq!(meter.measure("abcd"), 1);
        assert_eq!(meter.measure("abcde"), 2);
    }
}

//! Prompt compression before token estimation and dispatch.

use lazy_static::lazy_static;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

use relay_core::config::CompressionConfig;
use relay_core::TokenMeter;

lazy_static! {
    static ref INLINE_WHITESPACE: Regex = Regex::new(r"[ \t\x0B\x0C\r]+").unwrap();
}

/// What compression did to a prompt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompressionInfo {
    pub original_tokens: u32,
    pub compressed_tokens: u32,
    /// `compressed / original`
    pub ratio: f64,
    pub steps: Vec<String>,
}

#[derive(Debug, Clone, Default)]
pub struct PromptCompressor {
    config: CompressionConfig,
}

impl PromptCompressor {
    pub fn new(config: CompressionConfig) -> Self {
        Self { config }
    }

    pub fn is_enabled(&self) -> bool {
        self.config.enabled
    }

    /// Compressed prompt plus a report, or `None` when disabled or when
    /// nothing changed.
    ///
    /// Steps, in order: collapse inline whitespace, drop blank lines,
    /// drop repeated lines, truncate to `max_prompt_tokens`.
    pub fn compress(&self, prompt: &str) -> Option<(String, CompressionInfo)> {
        if !self.config.enabled {
            return None;
        }
        let original_tokens = TokenMeter::estimate_tokens(prompt);
        let mut steps = Vec::new();

        let collapsed: Vec<String> = prompt
            .lines()
            .map(|line| INLINE_WHITESPACE.replace_all(line.trim(), " ").into_owned())
            .collect();
        if collapsed.iter().zip(prompt.lines()).any(|(c, l)| c != l) {
            steps.push("whitespace".to_string());
        }

        let before = collapsed.len();
        let non_blank: Vec<String> = collapsed.into_iter().filter(|l| !l.is_empty()).collect();
        if non_blank.len() != before {
            steps.push("blank_lines".to_string());
        }

        let before = non_blank.len();
        let mut seen = HashSet::new();
        let unique: Vec<String> = non_blank
            .into_iter()
            .filter(|line| seen.insert(line.clone()))
            .collect();
        if unique.len() != before {
            steps.push("duplicate_lines".to_string());
        }

        let mut text = unique.join("\n");
        let limit = self.config.max_prompt_tokens;
        if limit > 0 && TokenMeter::estimate_tokens(&text) > limit {
            let max_chars = limit as usize * relay_core::budget::CHARS_PER_TOKEN;
            text = text.chars().take(max_chars).collect();
            steps.push("truncate".to_string());
        }

        if steps.is_empty() {
            return None;
        }
        let compressed_tokens = TokenMeter::estimate_tokens(&text);
        let ratio = if original_tokens == 0 {
            1.0
        } else {
            compressed_tokens as f64 / original_tokens as f64
        };
        Some((
            text,
            CompressionInfo {
                original_tokens,
                compressed_tokens,
                ratio,
                steps,
            },
        ))
    }
}

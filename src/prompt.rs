//! Prompt assembly under a size ceiling.
//!
//! A prompt is an ordered list of fragments. Required fragments are always
//! kept whole. When the assembled prompt would exceed the ceiling, optional
//! fragments are cut in ascending `drop_priority` order: each is truncated
//! from its end, or dropped entirely when too little of it would survive.
//! Every cut is reported as a [`PromptWarning`].

use crate::util::truncate_chars;
use serde::{Deserialize, Serialize};

/// Appended to a truncated fragment so the agent knows context is missing.
pub const TRUNCATION_MARKER: &str = "\n[... truncated ...]\n";

#[derive(Debug, Clone)]
pub struct Fragment {
    pub name: String,
    pub content: String,
    pub required: bool,
    /// Lower values are cut first.
    pub drop_priority: u8,
}

impl Fragment {
    pub fn required(name: &str, content: impl Into<String>) -> Self {
        Self {
            name: name.to_string(),
            content: content.into(),
            required: true,
            drop_priority: u8::MAX,
        }
    }

    pub fn optional(name: &str, content: impl Into<String>, drop_priority: u8) -> Self {
        Self {
            name: name.to_string(),
            content: content.into(),
            required: false,
            drop_priority,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "action")]
pub enum PromptWarning {
    Truncated {
        fragment: String,
        original_chars: usize,
        kept_chars: usize,
    },
    Dropped {
        fragment: String,
        original_chars: usize,
    },
    /// Required fragments alone exceed the ceiling.
    OverCeiling { chars: usize, ceiling: usize },
}

impl std::fmt::Display for PromptWarning {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PromptWarning::Truncated {
                fragment,
                original_chars,
                kept_chars,
            } => write!(
                f,
                "fragment '{}' truncated from {} to {} chars",
                fragment, original_chars, kept_chars
            ),
            PromptWarning::Dropped {
                fragment,
                original_chars,
            } => write!(f, "fragment '{}' ({} chars) dropped", fragment, original_chars),
            PromptWarning::OverCeiling { chars, ceiling } => write!(
                f,
                "required context is {} chars, above the {} char ceiling",
                chars, ceiling
            ),
        }
    }
}

#[derive(Debug, Clone)]
pub struct AssembledPrompt {
    pub text: String,
    pub warnings: Vec<PromptWarning>,
}

#[derive(Debug, Clone)]
pub struct PromptBuilder {
    fragments: Vec<Fragment>,
    max_chars: usize,
    min_fragment_chars: usize,
}

const SEPARATOR: &str = "\n\n";

impl PromptBuilder {
    pub fn new(max_chars: usize, min_fragment_chars: usize) -> Self {
        Self {
            fragments: Vec::new(),
            max_chars,
            min_fragment_chars,
        }
    }

    pub fn push(mut self, fragment: Fragment) -> Self {
        self.fragments.push(fragment);
        self
    }

    pub fn required(self, name: &str, content: impl Into<String>) -> Self {
        self.push(Fragment::required(name, content))
    }

    pub fn optional(self, name: &str, content: impl Into<String>, drop_priority: u8) -> Self {
        self.push(Fragment::optional(name, content, drop_priority))
    }

    fn total_chars(fragments: &[Option<String>]) -> usize {
        let kept: Vec<usize> = fragments
            .iter()
            .flatten()
            .map(|c| c.chars().count())
            .collect();
        kept.iter().sum::<usize>() + SEPARATOR.len() * kept.len().saturating_sub(1)
    }

    pub fn build(self) -> AssembledPrompt {
        let mut contents: Vec<Option<String>> = self
            .fragments
            .iter()
            .map(|f| (!f.content.is_empty()).then(|| f.content.clone()))
            .collect();
        let mut warnings = Vec::new();

        let mut cut_order: Vec<usize> = (0..self.fragments.len())
            .filter(|&i| !self.fragments[i].required)
            .collect();
        // Stable: equal priorities are cut front to back.
        cut_order.sort_by_key(|&i| self.fragments[i].drop_priority);

        for idx in cut_order {
            let total = Self::total_chars(&contents);
            if total <= self.max_chars {
                break;
            }
            let Some(content) = contents[idx].take() else {
                continue;
            };
            let original_chars = content.chars().count();
            let excess = total - self.max_chars;
            let marker_chars = TRUNCATION_MARKER.chars().count();
            let keep = original_chars.saturating_sub(excess + marker_chars);

            if keep < self.min_fragment_chars {
                warnings.push(PromptWarning::Dropped {
                    fragment: self.fragments[idx].name.clone(),
                    original_chars,
                });
            } else {
                let mut truncated = truncate_chars(&content, keep).to_string();
                truncated.push_str(TRUNCATION_MARKER);
                warnings.push(PromptWarning::Truncated {
                    fragment: self.fragments[idx].name.clone(),
                    original_chars,
                    kept_chars: keep,
                });
                contents[idx] = Some(truncated);
            }
        }

        let total = Self::total_chars(&contents);
        if total > self.max_chars {
            warnings.push(PromptWarning::OverCeiling {
                chars: total,
                ceiling: self.max_chars,
            });
        }

        let text = contents
            .into_iter()
            .flatten()
            .collect::<Vec<_>>()
            .join(SEPARATOR);

        AssembledPrompt { text, warnings }
    }
}

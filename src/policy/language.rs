//! Reply wording detection.
//!
//! The decision oracle answers whether a requirement is satisfied; these
//! vocabularies decide what kind of answer the responder gave. Each list
//! compiles to one case-insensitive, word-bounded alternation.

use regex::Regex;

use crate::config::LanguageConfig;
use crate::{AppError, Result};

/// Compiled completion, scheduling and inability vocabularies.
#[derive(Debug, Clone)]
pub struct ReplyLanguage {
    completion: Option<Regex>,
    scheduling: Option<Regex>,
    inability: Option<Regex>,
}

impl ReplyLanguage {
    /// Compile the configured term lists.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Config` if a list cannot be compiled.
    pub fn from_config(config: &LanguageConfig) -> Result<Self> {
        Ok(Self {
            completion: compile(&config.completion_terms)?,
            scheduling: compile(&config.scheduling_terms)?,
            inability: compile(&config.inability_terms)?,
        })
    }

    /// The text reports the work as done.
    #[must_use]
    pub fn states_completion(&self, text: &str) -> bool {
        matches(self.completion.as_ref(), text)
    }

    /// The text commits to a future time.
    #[must_use]
    pub fn states_scheduling(&self, text: &str) -> bool {
        matches(self.scheduling.as_ref(), text)
    }

    /// The text says the request cannot be fulfilled.
    #[must_use]
    pub fn states_inability(&self, text: &str) -> bool {
        matches(self.inability.as_ref(), text)
    }

    /// Explicit completion wording with no hedge toward a later time.
    #[must_use]
    pub fn is_definitive_completion(&self, text: &str) -> bool {
        self.states_completion(text) && !self.states_scheduling(text)
    }
}

fn compile(terms: &[String]) -> Result<Option<Regex>> {
    let alternatives: Vec<String> = terms
        .iter()
        .map(|term| term.trim())
        .filter(|term| !term.is_empty())
        .map(|term| regex::escape(&term.to_lowercase()).replace(' ', r"\s+"))
        .collect();
    if alternatives.is_empty() {
        return Ok(None);
    }

    let pattern = format!(r"(?i)\b(?:{})\b", alternatives.join("|"));
    Regex::new(&pattern)
        .map(Some)
        .map_err(|err| AppError::Config(format!("invalid language terms: {err}")))
}

fn matches(regex: Option<&Regex>, text: &str) -> bool {
    let normalized = text.replace(['\u{2018}', '\u{2019}'], "'");
    regex.is_some_and(|re| re.is_match(&normalized))
}

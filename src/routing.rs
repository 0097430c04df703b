//! Backend resolution: model-family patterns first, then the routing strategy.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::config::ConfigError;
use crate::directory::Backend;
use crate::selector::{RandomSource, SecureRandom, pick_weighted};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RoutingStrategy {
    #[default]
    Weighted,
    RoundRobin,
    /// Served by weighted selection until latency tracking feeds routing.
    LeastLatency,
    /// Highest priority first; later backends are tried when one is exhausted.
    Fallback,
}

/// Maps model names matching `pattern` (a regex) to backends of `family`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelPattern {
    pub family: String,
    pub pattern: String,
}

impl ModelPattern {
    pub fn new(family: impl Into<String>, pattern: impl Into<String>) -> Self {
        Self {
            family: family.into(),
            pattern: pattern.into(),
        }
    }
}

/// Families are checked in this order.
pub fn default_model_patterns() -> Vec<ModelPattern> {
    vec![
        ModelPattern::new(
            "google",
            r"^(?:gemini|gemma|embedding|text-embedding|imagen|veo|aqa)",
        ),
        ModelPattern::new(
            "openai",
            r"^(?:gpt-|o1|o3|o4|chatgpt|text-davinci|dall-e|whisper|tts)",
        ),
        ModelPattern::new("anthropic", r"^claude"),
        ModelPattern::new(
            "ollama",
            r"(?:llama|mistral|qwen|codellama|vicuna|phi|deepseek|yi-|mixtral|qwq)",
        ),
    ]
}

struct CompiledPattern {
    family: String,
    regex: Regex,
}

pub struct ModelRouter {
    patterns: Vec<CompiledPattern>,
    strategy: RoutingStrategy,
    cursor: AtomicUsize,
    rng: Arc<dyn RandomSource>,
}

impl ModelRouter {
    /// Patterns match case-insensitively.
    pub fn new(patterns: &[ModelPattern], strategy: RoutingStrategy) -> Result<Self, ConfigError> {
        let patterns = patterns
            .iter()
            .map(|entry| {
                let regex = Regex::new(&format!("(?i){}", entry.pattern)).map_err(|source| {
                    ConfigError::InvalidPattern {
                        pattern: entry.pattern.clone(),
                        source,
                    }
                })?;
                Ok(CompiledPattern {
                    family: entry.family.to_ascii_lowercase(),
                    regex,
                })
            })
            .collect::<Result<Vec<_>, ConfigError>>()?;
        Ok(Self {
            patterns,
            strategy,
            cursor: AtomicUsize::new(0),
            rng: Arc::new(SecureRandom),
        })
    }

    pub fn with_defaults(strategy: RoutingStrategy) -> Result<Self, ConfigError> {
        Self::new(&default_model_patterns(), strategy)
    }

    pub fn with_random(mut self, rng: Arc<dyn RandomSource>) -> Self {
        self.rng = rng;
        self
    }

    pub fn strategy(&self) -> RoutingStrategy {
        self.strategy
    }

    /// The first family whose pattern matches `model`, whether or not a
    /// backend of that family exists.
    pub fn family_for(&self, model: &str) -> Option<&str> {
        self.patterns
            .iter()
            .find(|pattern| pattern.regex.is_match(model))
            .map(|pattern| pattern.family.as_str())
    }

    /// Backends to try for `model`, in order. `backends` should already be
    /// filtered to active ones.
    ///
    /// A pattern hit yields the single matching backend. Otherwise the
    /// strategy decides; only `Fallback` yields more than one candidate.
    pub fn candidates(&self, model: &str, backends: &[Backend]) -> Vec<Backend> {
        let backends: Vec<&Backend> = backends.iter().filter(|backend| backend.active).collect();
        if backends.is_empty() {
            return Vec::new();
        }

        for pattern in &self.patterns {
            if !pattern.regex.is_match(model) {
                continue;
            }
            let family: Vec<&Backend> = backends
                .iter()
                .copied()
                .filter(|backend| backend.name.eq_ignore_ascii_case(&pattern.family))
                .collect();
            if let Some(backend) = pick_weighted(&family, |backend| backend.weight, self.rng.as_ref())
            {
                tracing::debug!(
                    model,
                    family = %pattern.family,
                    backend_id = %backend.id,
                    "model matched family pattern"
                );
                return vec![(*backend).clone()];
            }
        }

        match self.strategy {
            RoutingStrategy::Weighted | RoutingStrategy::LeastLatency => {
                pick_weighted(&backends, |backend| backend.weight, self.rng.as_ref())
                    .map(|backend| vec![(*backend).clone()])
                    .unwrap_or_default()
            }
            RoutingStrategy::RoundRobin => {
                let slot = self.cursor.fetch_add(1, Ordering::Relaxed) % backends.len();
                vec![backends[slot].clone()]
            }
            RoutingStrategy::Fallback => {
                let mut ordered: Vec<Backend> = backends.into_iter().cloned().collect();
                ordered.sort_by(|a, b| b.priority.cmp(&a.priority));
                ordered
            }
        }
    }
}

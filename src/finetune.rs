use crate::config::BackendConfig;
use regex::Regex;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

/// Compiled cut patterns, keyed by their source text.
///
/// Clones share the same cache.
#[derive(Debug, Clone, Default)]
pub struct PatternCache {
    patterns: Arc<Mutex<HashMap<String, Regex>>>,
}

impl PatternCache {
    /// Returns the compiled pattern, compiling and storing it on first use.
    /// Lookup, compilation and insertion happen under one lock.
    pub fn get_or_compile(&self, pattern: &str) -> Result<Regex, regex::Error> {
        let mut patterns = self.patterns.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(re) = patterns.get(pattern) {
            return Ok(re.clone());
        }
        let re = Regex::new(pattern)?;
        patterns.insert(pattern.to_string(), re.clone());
        Ok(re)
    }

    pub fn len(&self) -> usize {
        self.patterns.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Shapes a finished completion according to the model configuration.
#[derive(Debug, Clone, Default)]
pub struct Finetuner {
    cache: PatternCache,
}

impl Finetuner {
    pub fn new(cache: PatternCache) -> Self {
        Finetuner { cache }
    }

    pub fn cache(&self) -> &PatternCache {
        &self.cache
    }

    /// Applies, in order: echo of `input`, removal of every cut pattern match,
    /// prefix trimming, suffix trimming. Each trim also strips surrounding
    /// whitespace.
    pub fn finetune(&self, config: &BackendConfig, input: &str, prediction: &str) -> String {
        let mut prediction = if config.echo {
            format!("{}{}", input, prediction)
        } else {
            prediction.to_string()
        };

        for pattern in &config.cutstrings {
            match self.cache.get_or_compile(pattern) {
                Ok(re) => prediction = re.replace_all(&prediction, "").into_owned(),
                Err(e) => log::warn!("Skipping invalid cut pattern {:?}: {}", pattern, e),
            }
        }

        for prefix in &config.trim_space {
            let rest = prediction.strip_prefix(prefix.as_str()).unwrap_or(&prediction);
            prediction = rest.trim().to_string();
        }

        for suffix in &config.trim_suffix {
            let rest = prediction.strip_suffix(suffix.as_str()).unwrap_or(&prediction);
            prediction = rest.trim().to_string();
        }

        prediction
    }
}

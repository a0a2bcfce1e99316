//! Streaming settings shared by the dataset, cache and scheduler.

use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::util::{Error, Result};

/// Runtime settings for out-of-core streaming.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StreamingConfig {
    // Cache
    pub cache_budget_bytes: u64,

    // Scheduler
    pub time_slice_ms: u64,
    pub allow_coarser_fallback: bool,

    // Container access
    pub verify_checksum: bool,
    pub use_mmap: bool,
}

impl Default for StreamingConfig {
    fn default() -> Self {
        Self {
            cache_budget_bytes: 256 * 1024 * 1024,
            time_slice_ms: 100,
            allow_coarser_fallback: true,
            verify_checksum: true,
            use_mmap: true,
        }
    }
}

impl StreamingConfig {
    /// Load settings from a JSON file; missing fields keep their defaults.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                Error::FileNotFound(path.to_path_buf())
            } else {
                Error::Io(e)
            }
        })?;
        let config: Self = serde_json::from_str(&text)?;
        config.validate()?;
        Ok(config)
    }

    /// Save settings as pretty JSON.
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        std::fs::write(path, serde_json::to_string_pretty(self)?)?;
        Ok(())
    }

    /// Defaults overridden by `UVF_CACHE_BUDGET`, `UVF_TIME_SLICE_MS`,
    /// `UVF_VERIFY` and `UVF_MMAP`.
    pub fn from_env() -> Result<Self> {
        Self::default().with_overrides(|key| std::env::var(key).ok())
    }

    /// Apply overrides from any key lookup (environment, CLI, tests).
    pub fn with_overrides(mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        if let Some(v) = lookup("UVF_CACHE_BUDGET") {
            self.cache_budget_bytes = parse_bytes(&v)?;
        }
        if let Some(v) = lookup("UVF_TIME_SLICE_MS") {
            self.time_slice_ms = v
                .trim()
                .parse()
                .map_err(|_| Error::validation(format!("UVF_TIME_SLICE_MS: '{}' is not a number", v)))?;
        }
        if let Some(v) = lookup("UVF_VERIFY") {
            self.verify_checksum = parse_flag("UVF_VERIFY", &v)?;
        }
        if let Some(v) = lookup("UVF_MMAP") {
            self.use_mmap = parse_flag("UVF_MMAP", &v)?;
        }
        self.validate()?;
        Ok(self)
    }

    pub fn validate(&self) -> Result<()> {
        if self.cache_budget_bytes == 0 {
            return Err(Error::validation("cache budget must be positive"));
        }
        if self.time_slice_ms == 0 {
            return Err(Error::validation("time slice must be positive"));
        }
        Ok(())
    }
}

/// Byte count with an optional K/M/G suffix (powers of 1024).
pub fn parse_bytes(text: &str) -> Result<u64> {
    let t = text.trim();
    let (digits, scale) = match t.char_indices().last() {
        Some((i, 'k' | 'K')) => (&t[..i], 1u64 << 10),
        Some((i, 'm' | 'M')) => (&t[..i], 1u64 << 20),
        Some((i, 'g' | 'G')) => (&t[..i], 1u64 << 30),
        _ => (t, 1),
    };
    digits
        .trim()
        .parse::<u64>()
        .ok()
        .and_then(|n| n.checked_mul(scale))
        .ok_or_else(|| Error::validation(format!("'{}' is not a byte count", text)))
}

fn parse_flag(key: &str, value: &str) -> Result<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(Error::validation(format!("{}: '{}' is not a boolean", key, value))),
    }
}

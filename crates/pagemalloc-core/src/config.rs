//! Allocator configuration.
//!
//! Two knobs are read from the environment on first use and cached for the
//! life of the process:
//! - `PAGEMALLOC_SUPERPAGE_PAGES`: OS pages per superpage (default 16). The
//!   value is clamped to `[1, 1024]` and rounded up to a power of two.
//! - `PAGEMALLOC_LOG`: minimum lifecycle log level kept in memory
//!   (`trace|debug|info|warn|error|off`, default `info`).
//!
//! Unparsable values fall back to the defaults.

use std::sync::atomic::{AtomicU32, Ordering};

use crate::malloc::log::AllocatorLogLevel;

/// Default number of OS pages per superpage.
pub const DEFAULT_SUPERPAGE_PAGES: usize = 16;

/// Upper bound on OS pages per superpage.
pub const MAX_SUPERPAGE_PAGES: usize = 1024;

/// Per-instance allocator settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AllocatorConfig {
    /// OS pages per superpage. Allocators round it up to a power of two in
    /// `[1, MAX_SUPERPAGE_PAGES]`.
    pub superpage_pages: usize,
    /// Lifecycle records below this level are dropped.
    pub log_level: AllocatorLogLevel,
}

impl Default for AllocatorConfig {
    fn default() -> Self {
        Self {
            superpage_pages: DEFAULT_SUPERPAGE_PAGES,
            log_level: AllocatorLogLevel::Info,
        }
    }
}

impl AllocatorConfig {
    /// Returns a copy with `superpage_pages` normalised.
    #[must_use]
    pub fn with_superpage_pages(mut self, pages: usize) -> Self {
        self.superpage_pages = normalize_superpage_pages(pages);
        self
    }

    #[must_use]
    pub fn with_log_level(mut self, level: AllocatorLogLevel) -> Self {
        self.log_level = level;
        self
    }

    /// Reads the configuration from the environment, bypassing the cache.
    #[must_use]
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut config = Self::default();
        if let Some(pages) = lookup(ENV_SUPERPAGE_PAGES)
            .as_deref()
            .and_then(parse_superpage_pages)
        {
            config.superpage_pages = pages;
        }
        if let Some(raw) = lookup(ENV_LOG) {
            config.log_level = AllocatorLogLevel::from_str_loose(&raw);
        }
        config
    }

    /// `superpage_pages` as allocators use it.
    #[must_use]
    pub fn normalized_superpage_pages(&self) -> usize {
        normalize_superpage_pages(self.superpage_pages)
    }
}

const ENV_SUPERPAGE_PAGES: &str = "PAGEMALLOC_SUPERPAGE_PAGES";
const ENV_LOG: &str = "PAGEMALLOC_LOG";

fn normalize_superpage_pages(pages: usize) -> usize {
    pages
        .clamp(1, MAX_SUPERPAGE_PAGES)
        .next_power_of_two()
        .min(MAX_SUPERPAGE_PAGES)
}

fn parse_superpage_pages(raw: &str) -> Option<usize> {
    raw.trim()
        .parse::<usize>()
        .ok()
        .filter(|&pages| pages > 0)
        .map(normalize_superpage_pages)
}

// Cache word: 0 = unresolved, RESOLVING = resolution in progress, otherwise
// `(superpage_pages << 8) | (level + 1)`.
static CACHED_CONFIG: AtomicU32 = AtomicU32::new(0);

const CONFIG_UNRESOLVED: u32 = 0;
const CONFIG_RESOLVING: u32 = u32::MAX;

fn encode(config: AllocatorConfig) -> u32 {
    ((config.superpage_pages as u32) << 8) | (config.log_level as u32 + 1)
}

fn decode(word: u32) -> AllocatorConfig {
    AllocatorConfig {
        superpage_pages: normalize_superpage_pages((word >> 8) as usize),
        log_level: AllocatorLogLevel::from_index(((word & 0xFF) as u8).saturating_sub(1)),
    }
}

/// Process-wide configuration (reads the environment on first call, caches
/// thereafter).
///
/// A call that arrives while another is resolving the environment gets the
/// defaults instead of waiting.
#[must_use]
pub fn global() -> AllocatorConfig {
    let cached = CACHED_CONFIG.load(Ordering::Relaxed);
    if cached != CONFIG_UNRESOLVED && cached != CONFIG_RESOLVING {
        return decode(cached);
    }
    if cached == CONFIG_RESOLVING {
        return AllocatorConfig::default();
    }

    if CACHED_CONFIG
        .compare_exchange(
            CONFIG_UNRESOLVED,
            CONFIG_RESOLVING,
            Ordering::SeqCst,
            Ordering::Relaxed,
        )
        .is_err()
    {
        let v = CACHED_CONFIG.load(Ordering::Relaxed);
        return if v != CONFIG_UNRESOLVED && v != CONFIG_RESOLVING {
            decode(v)
        } else {
            AllocatorConfig::default()
        };
    }

    let config = AllocatorConfig::from_env();
    CACHED_CONFIG.store(encode(config), Ordering::Release);
    config
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config() {
        let config = AllocatorConfig::default();
        assert_eq!(config.superpage_pages, DEFAULT_SUPERPAGE_PAGES);
        assert_eq!(config.log_level, AllocatorLogLevel::Info);
    }

    #[test]
    fn superpage_pages_are_normalised() {
        assert_eq!(normalize_superpage_pages(0), 1);
        assert_eq!(normalize_superpage_pages(1), 1);
        assert_eq!(normalize_superpage_pages(3), 4);
        assert_eq!(normalize_superpage_pages(16), 16);
        assert_eq!(normalize_superpage_pages(1000), 1024);
        assert_eq!(normalize_superpage_pages(usize::MAX), MAX_SUPERPAGE_PAGES);
    }

    #[test]
    fn parse_superpage_pages_rejects_garbage() {
        assert_eq!(parse_superpage_pages("8"), Some(8));
        assert_eq!(parse_superpage_pages(" 5 "), Some(8));
        assert_eq!(parse_superpage_pages("0"), None);
        assert_eq!(parse_superpage_pages("-3"), None);
        assert_eq!(parse_superpage_pages("lots"), None);
    }

    #[test]
    fn encode_decode_roundtrip() {
        for level in [
            AllocatorLogLevel::Trace,
            AllocatorLogLevel::Info,
            AllocatorLogLevel::Error,
            AllocatorLogLevel::Off,
        ] {
            let config = AllocatorConfig::default()
                .with_superpage_pages(64)
                .with_log_level(level);
            let word = encode(config);
            assert_ne!(word, CONFIG_UNRESOLVED);
            assert_ne!(word, CONFIG_RESOLVING);
            assert_eq!(decode(word), config);
        }
    }

    #[test]
    fn cached_config_is_sticky_and_resolving_returns_defaults() {
        let pinned = AllocatorConfig::default()
            .with_superpage_pages(4)
            .with_log_level(AllocatorLogLevel::Warn);
        let previous = CACHED_CONFIG.swap(encode(pinned), Ordering::SeqCst);
        assert_eq!(global(), pinned);
        assert_eq!(global(), pinned);

        CACHED_CONFIG.store(CONFIG_RESOLVING, Ordering::SeqCst);
        assert_eq!(global(), AllocatorConfig::default());

        CACHED_CONFIG.store(previous, Ordering::SeqCst);
    }

    #[test]
    fn from_env_reads_both_variables() {
        let env = |key: &str| match key {
            "PAGEMALLOC_SUPERPAGE_PAGES" => Some("6".to_owned()),
            "PAGEMALLOC_LOG" => Some("DEBUG".to_owned()),
            _ => None,
        };
        let config = AllocatorConfig::from_lookup(env);
        assert_eq!(config.superpage_pages, 8);
        assert_eq!(config.log_level, AllocatorLogLevel::Debug);
    }

    #[test]
    fn from_env_falls_back_on_missing_or_garbage() {
        assert_eq!(AllocatorConfig::from_lookup(|_| None), AllocatorConfig::default());

        let garbage = |key: &str| match key {
            "PAGEMALLOC_SUPERPAGE_PAGES" => Some("many".to_owned()),
            _ => Some("loud".to_owned()),
        };
        let config = AllocatorConfig::from_lookup(garbage);
        assert_eq!(config.superpage_pages, DEFAULT_SUPERPAGE_PAGES);
        assert_eq!(config.log_level, AllocatorLogLevel::Info);
    }

    #[test]
    fn raw_superpage_pages_are_normalized_on_use() {
        let mut config = AllocatorConfig::default();
        config.superpage_pages = 0;
        assert_eq!(config.normalized_superpage_pages(), 1);
        config.superpage_pages = usize::MAX;
        assert_eq!(config.normalized_superpage_pages(), MAX_SUPERPAGE_PAGES);
    }
}

use crate::error::ConfigError;

const ENV_AUTO_MATCH_THRESHOLD: &str = "RECON_AUTO_MATCH_THRESHOLD";
const ENV_MAX_REGEX_PATTERN_LEN: &str = "RECON_MAX_REGEX_PATTERN_LEN";
const ENV_REGEX_SIZE_LIMIT: &str = "RECON_REGEX_SIZE_LIMIT";

/// Engine tuning knobs shared by the rules engine, posting and analytics.
#[derive(Debug, Clone)]
pub struct ReconConfig {
    /// Confidence at or above which a match counts as automatic.
    pub auto_match_confidence_threshold: f64,
    /// Rule regex patterns longer than this are rejected outright.
    pub max_regex_pattern_len: usize,
    /// Compiled-size budget handed to the regex engine.
    pub regex_size_limit: usize,
}

impl Default for ReconConfig {
    fn default() -> Self {
        Self {
            auto_match_confidence_threshold: 85.0,
            max_regex_pattern_len: 500,
            regex_size_limit: 1 << 20,
        }
    }
}

impl ReconConfig {
    /// Defaults overridden by `RECON_*` environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut cfg = Self::default();
        if let Some(v) = read_env(ENV_AUTO_MATCH_THRESHOLD) {
            cfg.auto_match_confidence_threshold = parse_env(ENV_AUTO_MATCH_THRESHOLD, &v)?;
        }
        if let Some(v) = read_env(ENV_MAX_REGEX_PATTERN_LEN) {
            cfg.max_regex_pattern_len = parse_env(ENV_MAX_REGEX_PATTERN_LEN, &v)?;
        }
        if let Some(v) = read_env(ENV_REGEX_SIZE_LIMIT) {
            cfg.regex_size_limit = parse_env(ENV_REGEX_SIZE_LIMIT, &v)?;
        }
        if !(0.0..=100.0).contains(&cfg.auto_match_confidence_threshold) {
            return Err(ConfigError::InvalidValue {
                name: ENV_AUTO_MATCH_THRESHOLD.to_string(),
                value: cfg.auto_match_confidence_threshold.to_string(),
            });
        }
        Ok(cfg)
    }
}

fn read_env(name: &str) -> Option<String> {
    std::env::var(name)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn parse_env<T: std::str::FromStr>(name: &str, value: &str) -> Result<T, ConfigError> {
    value.parse::<T>().map_err(|_| ConfigError::InvalidValue {
        name: name.to_string(),
        value: value.to_string(),
    })
}

//! Runtime settings for the detection core
//!
//! Each recognized option resolves environment variable → TOML config →
//! compiled default. API keys additionally honor the TOML file so
//! operators are not forced to export secrets in the service unit.

use sodav_common::config::TomlConfig;
use std::time::Duration;
use tracing::warn;

/// Resolved settings, one instance shared by all workers.
#[derive(Debug, Clone)]
pub struct Settings {
    /// Local match cutoff before falling through to external providers
    pub min_confidence: f64,
    /// AcoustID acceptance cutoff
    pub acoustid_confidence_threshold: f64,
    /// AudD acceptance cutoff
    pub audd_confidence_threshold: f64,
    /// Decoding target sample rate (Hz)
    pub sample_rate: u32,
    /// Analysis window length bounds (seconds)
    pub min_audio_length: f64,
    pub max_audio_length: f64,
    /// Station probe period (seconds)
    pub healthcheck_interval: f64,
    /// External provider retry cap
    pub max_retries: u32,
    /// External call deadline (seconds)
    pub request_timeout: f64,
    /// PLAYING-continuity similarity threshold
    pub same_track_similarity: f64,
    /// Seconds of non-music that end a play
    pub silence_duration: f64,
    /// Token bucket size per external provider
    pub provider_rate_burst: u32,
    /// Token bucket refill, requests per minute
    pub provider_rate_per_minute: u32,
    /// Graceful shutdown window before workers are aborted (seconds)
    pub shutdown_grace: f64,
    pub acoustid_api_key: Option<String>,
    pub audd_api_key: Option<String>,
    /// Per-provider enable switches
    pub acoustid_enabled: bool,
    pub audd_enabled: bool,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            min_confidence: 0.8,
            acoustid_confidence_threshold: 0.7,
            audd_confidence_threshold: 0.6,
            sample_rate: 44100,
            min_audio_length: 10.0,
            max_audio_length: 30.0,
            healthcheck_interval: 30.0,
            max_retries: 3,
            request_timeout: 10.0,
            same_track_similarity: 0.85,
            silence_duration: 2.0,
            provider_rate_burst: 3,
            provider_rate_per_minute: 60,
            shutdown_grace: 30.0,
            acoustid_api_key: None,
            audd_api_key: None,
            acoustid_enabled: true,
            audd_enabled: true,
        }
    }
}

impl Settings {
    /// Resolve settings from the environment on top of the TOML config.
    pub fn resolve(toml_config: &TomlConfig) -> Self {
        let defaults = Settings::default();

        let acoustid_api_key = env_string("ACOUSTID_API_KEY")
            .or_else(|| toml_config.acoustid_api_key.clone())
            .filter(|k| !k.trim().is_empty());
        let audd_api_key = env_string("AUDD_API_KEY")
            .or_else(|| toml_config.audd_api_key.clone())
            .filter(|k| !k.trim().is_empty());

        Self {
            min_confidence: env_f64("MIN_CONFIDENCE", defaults.min_confidence),
            acoustid_confidence_threshold: env_f64(
                "ACOUSTID_CONFIDENCE_THRESHOLD",
                defaults.acoustid_confidence_threshold,
            ),
            audd_confidence_threshold: env_f64(
                "AUDD_CONFIDENCE_THRESHOLD",
                defaults.audd_confidence_threshold,
            ),
            sample_rate: env_u32("SAMPLE_RATE", defaults.sample_rate),
            min_audio_length: env_f64("MIN_AUDIO_LENGTH", defaults.min_audio_length),
            max_audio_length: env_f64("MAX_AUDIO_LENGTH", defaults.max_audio_length),
            healthcheck_interval: env_f64("HEALTHCHECK_INTERVAL", defaults.healthcheck_interval),
            max_retries: env_u32("MAX_RETRIES", defaults.max_retries),
            request_timeout: env_f64("REQUEST_TIMEOUT", defaults.request_timeout),
            same_track_similarity: env_f64(
                "SAME_TRACK_SIMILARITY",
                defaults.same_track_similarity,
            ),
            silence_duration: env_f64("SILENCE_DURATION", defaults.silence_duration),
            provider_rate_burst: env_u32("PROVIDER_RATE_BURST", defaults.provider_rate_burst),
            provider_rate_per_minute: env_u32(
                "PROVIDER_RATE_PER_MINUTE",
                defaults.provider_rate_per_minute,
            ),
            shutdown_grace: env_f64("SHUTDOWN_GRACE", defaults.shutdown_grace),
            acoustid_api_key,
            audd_api_key,
            acoustid_enabled: env_bool("ACOUSTID_ENABLED", defaults.acoustid_enabled),
            audd_enabled: env_bool("AUDD_ENABLED", defaults.audd_enabled),
        }
    }

    pub fn request_timeout_duration(&self) -> Duration {
        Duration::from_secs_f64(self.request_timeout)
    }

    pub fn window_samples(&self) -> usize {
        (self.min_audio_length * self.sample_rate as f64) as usize
    }
}

fn env_string(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.trim().is_empty())
}

fn env_f64(key: &str, default: f64) -> f64 {
    match env_string(key) {
        Some(raw) => match raw.parse() {
            Ok(v) => v,
            Err(_) => {
                warn!(key, value = %raw, "unparseable setting, using default");
                default
            }
        },
        None => default,
    }
}

fn env_u32(key: &str, default: u32) -> u32 {
    match env_string(key) {
        Some(raw) => match raw.parse() {
            Ok(v) => v,
            Err(_) => {
                warn!(key, value = %raw, "unparseable setting, using default");
                default
            }
        },
        None => default,
    }
}

fn env_bool(key: &str, default: bool) -> bool {
    match env_string(key) {
        Some(raw) => matches!(raw.as_str(), "1" | "true" | "yes" | "on"),
        None => default,
    }
}

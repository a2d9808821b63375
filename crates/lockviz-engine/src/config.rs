use std::env;
use std::time::Duration;

pub const DEFAULT_IMAGE_MODEL: &str = "gemini-2.5-flash-image";

pub const DOOR_MAX_WIDTH_ENV: &str = "LOCKVIZ_DOOR_MAX_WIDTH";
pub const LOCK_MAX_WIDTH_ENV: &str = "LOCKVIZ_LOCK_MAX_WIDTH";
pub const JPEG_QUALITY_ENV: &str = "LOCKVIZ_JPEG_QUALITY";
pub const MAX_ATTEMPTS_ENV: &str = "LOCKVIZ_MAX_ATTEMPTS";
pub const RETRY_BASE_MS_ENV: &str = "LOCKVIZ_RETRY_BASE_MS";
pub const REQUEST_TIMEOUT_S_ENV: &str = "LOCKVIZ_REQUEST_TIMEOUT_S";
pub const IMAGE_MODEL_ENV: &str = "LOCKVIZ_IMAGE_MODEL";

/// Tunables for one generation pipeline. Defaults favour small payloads, which keeps the
/// provider from rejecting requests as oversized or rate-limited.
#[derive(Debug, Clone, PartialEq)]
pub struct PipelineConfig {
    pub door_max_width: u32,
    pub lock_max_width: u32,
    /// Lossy encoder quality on a 0-1 scale.
    pub jpeg_quality: f32,
    pub max_attempts: u32,
    pub retry_base_delay: Duration,
    pub diagnostic_max_chars: usize,
    pub image_model: String,
    pub request_timeout: Duration,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            door_max_width: 512,
            lock_max_width: 320,
            jpeg_quality: 0.8,
            max_attempts: 3,
            retry_base_delay: Duration::from_millis(3000),
            diagnostic_max_chars: 20,
            image_model: DEFAULT_IMAGE_MODEL.to_string(),
            request_timeout: Duration::from_secs(90),
        }
    }
}

impl PipelineConfig {
    pub fn from_env() -> Self {
        Self::default().with_overrides(|key| env::var(key).ok())
    }

    /// Applies `LOCKVIZ_*` overrides from `lookup`; bad values keep the default, out-of-range
    /// values are clamped.
    pub fn with_overrides(mut self, lookup: impl Fn(&str) -> Option<String>) -> Self {
        let number = |key: &str, default: f64, min: f64, max: f64| {
            value_as_f64(lookup(key).as_deref(), default, min, max)
        };
        self.door_max_width = number(
            DOOR_MAX_WIDTH_ENV,
            self.door_max_width as f64,
            64.0,
            4096.0,
        )
        .round() as u32;
        self.lock_max_width = number(
            LOCK_MAX_WIDTH_ENV,
            self.lock_max_width as f64,
            64.0,
            4096.0,
        )
        .round() as u32;
        self.jpeg_quality = number(
            JPEG_QUALITY_ENV,
            self.jpeg_quality as f64,
            0.05,
            1.0,
        ) as f32;
        self.max_attempts =
            number(MAX_ATTEMPTS_ENV, self.max_attempts as f64, 1.0, 5.0).round() as u32;
        self.retry_base_delay = Duration::from_millis(
            number(
                RETRY_BASE_MS_ENV,
                self.retry_base_delay.as_millis() as f64,
                0.0,
                60_000.0,
            )
            .round() as u64,
        );
        self.request_timeout = Duration::from_secs_f64(number(
            REQUEST_TIMEOUT_S_ENV,
            self.request_timeout.as_secs_f64(),
            5.0,
            300.0,
        ));
        if let Some(model) = lookup(IMAGE_MODEL_ENV)
            .map(|value| value.trim().to_string())
            .filter(|value| !value.is_empty())
        {
            self.image_model = model;
        }
        self
    }

    /// Quality as the encoder's 1-100 percentage.
    pub fn jpeg_quality_percent(&self) -> u8 {
        quality_percent(self.jpeg_quality)
    }
}

pub(crate) fn quality_percent(quality: f32) -> u8 {
    if !quality.is_finite() {
        return 80;
    }
    (quality * 100.0).round().clamp(1.0, 100.0) as u8
}

fn value_as_f64(value: Option<&str>, default: f64, min: f64, max: f64) -> f64 {
    let parsed = value
        .map(str::trim)
        .and_then(|raw| raw.parse::<f64>().ok())
        .filter(|number| number.is_finite())
        .unwrap_or(default);
    parsed.clamp(min, max)
}

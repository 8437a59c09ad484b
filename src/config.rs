use chrono_tz::Tz;
use std::str::FromStr;

use crate::errors::AppError;
use crate::services::forecast::RainThresholds;

/// Bounds for `POLL_INTERVAL_SECS`; the upper bound keeps ticks under a minute apart.
const MIN_POLL_INTERVAL_SECS: u64 = 1;
const MAX_POLL_INTERVAL_SECS: u64 = 59;

const DEFAULT_WEATHER_ENDPOINT: &str = "https://twcservice.au-syd.mybluemix.net/api/weather/v1/geocode/{latitude}/{longitude}/forecast/hourly/48hour.json";

/// Application configuration, parsed from environment variables.
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub line_channel_secret: String,
    pub line_channel_access_token: String,
    pub line_api_base_url: String,
    /// Provider URL template containing `{latitude}` and `{longitude}`.
    pub weather_endpoint: String,
    pub weather_username: String,
    pub weather_password: String,
    pub weather_language: String,
    pub weather_units: String,
    pub thresholds: RainThresholds,
    pub forecast_length_hours: usize,
    pub poll_interval_secs: u64,
    pub timezone: Tz,
    /// Also push "no umbrella needed" replies at scheduled times.
    pub notify_when_clear: bool,
    pub settings_path: String,
    pub port: u16,
}

impl AppConfig {
    pub fn from_env() -> Result<Self, AppError> {
        let thresholds = RainThresholds::new(
            parse_var("RAIN_THRESHOLD_HARDLY", 10)?,
            parse_var("RAIN_THRESHOLD_MAYBE", 30)?,
            parse_var("RAIN_THRESHOLD_LIKELY", 50)?,
            parse_var("RAIN_THRESHOLD_ALMOST", 80)?,
        )?;

        let poll_interval_secs: u64 = parse_var("POLL_INTERVAL_SECS", 30)?;
        if !(MIN_POLL_INTERVAL_SECS..=MAX_POLL_INTERVAL_SECS).contains(&poll_interval_secs) {
            return Err(AppError::ConfigError(format!(
                "POLL_INTERVAL_SECS must be between {} and {}, got {}",
                MIN_POLL_INTERVAL_SECS, MAX_POLL_INTERVAL_SECS, poll_interval_secs
            )));
        }

        let tz_name = var_or("NOTIFY_TIMEZONE", "Asia/Tokyo");
        let timezone = tz_name.parse::<Tz>().map_err(|e| {
            AppError::ConfigError(format!("NOTIFY_TIMEZONE '{}' is invalid: {}", tz_name, e))
        })?;

        Ok(Self {
            line_channel_secret: required_var("LINE_CHANNEL_SECRET")?,
            line_channel_access_token: required_var("LINE_CHANNEL_ACCESS_TOKEN")?,
            line_api_base_url: var_or("LINE_API_BASE_URL", "https://api.line.me"),
            weather_endpoint: var_or("WEATHER_ENDPOINT", DEFAULT_WEATHER_ENDPOINT),
            weather_username: var_or("WEATHER_COMPANY_USERNAME", ""),
            weather_password: var_or("WEATHER_COMPANY_PASSWORD", ""),
            weather_language: var_or("WEATHER_LANGUAGE", "en-US"),
            weather_units: var_or("WEATHER_UNITS", "m"),
            thresholds,
            forecast_length_hours: parse_var("FORECAST_LENGTH_HOURS", 12)?,
            poll_interval_secs,
            timezone,
            notify_when_clear: parse_var("NOTIFY_WHEN_CLEAR", false)?,
            settings_path: var_or("SETTINGS_PATH", "usersettings.json"),
            port: parse_var("PORT", 8000)?,
        })
    }
}

fn required_var(name: &str) -> Result<String, AppError> {
    match std::env::var(name) {
        Ok(v) if !v.is_empty() => Ok(v),
        _ => Err(AppError::ConfigError(format!(
            "Specify {} as environment variable",
            name
        ))),
    }
}

fn var_or(name: &str, default: &str) -> String {
    std::env::var(name).unwrap_or_else(|_| default.to_string())
}

fn parse_var<T>(name: &str, default: T) -> Result<T, AppError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match std::env::var(name) {
        Ok(raw) => raw.trim().parse::<T>().map_err(|e| {
            AppError::ConfigError(format!("{} has invalid value '{}': {}", name, raw, e))
        }),
        Err(_) => Ok(default),
    }
}

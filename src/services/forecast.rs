//! Forecast classification.
//!
//! Turns a raw provider response into a `ForecastSummary`: the hourly
//! precipitation probabilities for the requested window, a discrete rain
//! level and the estimated rain onset.
//!
//! The rain level counts how many of four ascending thresholds the window's
//! peak probability meets or exceeds. The onset scans for the first hour
//! strictly above the threshold of `min(level, Likely)`, so for an "almost
//! certain" window it reports the leading edge of the risk rather than the
//! peak hour.

use chrono::{DateTime, FixedOffset};
use serde::Deserialize;

use crate::errors::AppError;
use crate::helpers::{hour_at_offset, parse_provider_timestamp};

/// Outcome of the provider request, derived from its HTTP status.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ForecastStatus {
    Ok,
    BadRequest,
    Unauthorized,
    RateLimited,
    NotFound,
    ProviderError,
    /// Provider accepted the request but has no forecast ready (2xx other
    /// than 200).
    Pending,
}

impl ForecastStatus {
    pub fn from_http(status: u16) -> Self {
        match status {
            200 => ForecastStatus::Ok,
            201..=299 => ForecastStatus::Pending,
            400 => ForecastStatus::BadRequest,
            401 => ForecastStatus::Unauthorized,
            403 | 429 => ForecastStatus::RateLimited,
            404 => ForecastStatus::NotFound,
            _ => ForecastStatus::ProviderError,
        }
    }
}

/// Ordinal precipitation risk. Variants are declared in ascending order so
/// the derived `Ord` compares by risk.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum RainLevel {
    Unknown,
    Never,
    Hardly,
    Maybe,
    Likely,
    Almost,
}

impl RainLevel {
    fn from_thresholds_met(count: usize) -> Self {
        match count {
            0 => RainLevel::Never,
            1 => RainLevel::Hardly,
            2 => RainLevel::Maybe,
            3 => RainLevel::Likely,
            _ => RainLevel::Almost,
        }
    }
}

/// Ascending precipitation-probability thresholds, in percent.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RainThresholds {
    hardly: u8,
    maybe: u8,
    likely: u8,
    almost: u8,
}

impl RainThresholds {
    /// Thresholds must be strictly ascending and at most 100.
    pub fn new(hardly: u8, maybe: u8, likely: u8, almost: u8) -> Result<Self, AppError> {
        if !(hardly < maybe && maybe < likely && likely < almost && almost <= 100) {
            return Err(AppError::ConfigError(format!(
                "Rain thresholds must be strictly ascending percentages, got {}/{}/{}/{}",
                hardly, maybe, likely, almost
            )));
        }
        Ok(Self {
            hardly,
            maybe,
            likely,
            almost,
        })
    }

    fn ascending(&self) -> [u8; 4] {
        [self.hardly, self.maybe, self.likely, self.almost]
    }

    /// Threshold that defines `level`; `None` for `Unknown` and `Never`.
    pub fn for_level(&self, level: RainLevel) -> Option<u8> {
        match level {
            RainLevel::Hardly => Some(self.hardly),
            RainLevel::Maybe => Some(self.maybe),
            RainLevel::Likely => Some(self.likely),
            RainLevel::Almost => Some(self.almost),
            RainLevel::Unknown | RainLevel::Never => None,
        }
    }
}

impl Default for RainThresholds {
    fn default() -> Self {
        Self {
            hardly: 10,
            maybe: 30,
            likely: 50,
            almost: 80,
        }
    }
}

/// Estimated rain onset within the forecast window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RainOnset {
    /// Hours after `window_start`. Equals the window length when no hour
    /// crosses the onset threshold.
    pub offset_hours: usize,
    pub at: DateTime<FixedOffset>,
}

/// Result of one classification run.
#[derive(Debug, Clone, PartialEq)]
pub struct ForecastSummary {
    pub status: ForecastStatus,
    pub probabilities: Vec<u8>,
    pub window_start: Option<DateTime<FixedOffset>>,
    pub window_end: Option<DateTime<FixedOffset>>,
    pub rain_level: RainLevel,
    pub rain_onset: Option<RainOnset>,
}

impl ForecastSummary {
    fn without_data(status: ForecastStatus) -> Self {
        Self {
            status,
            probabilities: Vec::new(),
            window_start: None,
            window_end: None,
            rain_level: RainLevel::Unknown,
            rain_onset: None,
        }
    }

    /// Highest probability and its offset in hours; the earliest hour wins ties.
    pub fn peak(&self) -> Option<(usize, u8)> {
        self.probabilities
            .iter()
            .copied()
            .enumerate()
            .fold(None, |best, (i, p)| match best {
                Some((_, bp)) if bp >= p => best,
                _ => Some((i, p)),
            })
    }
}

/// Raw provider reply as handed to the classifier.
#[derive(Debug, Clone, PartialEq)]
pub struct ProviderResponse {
    pub status: u16,
    /// JSON body; only read when `status` is 200.
    pub body: Option<serde_json::Value>,
}

// --- Provider JSON shape ---

#[derive(Debug, Deserialize)]
struct ProviderBody {
    forecasts: Vec<ProviderHour>,
}

#[derive(Debug, Deserialize)]
struct ProviderHour {
    /// Probability of precipitation, percent.
    pop: i64,
    fcst_valid_local: String,
}

/// Classify a provider response over the first `window_length` hours.
///
/// Non-200 responses produce a summary with no data and `RainLevel::Unknown`.
/// The window is clamped to `[2, available hours]`.
pub fn classify(
    response: &ProviderResponse,
    window_length: usize,
    thresholds: &RainThresholds,
) -> Result<ForecastSummary, AppError> {
    let status = ForecastStatus::from_http(response.status);
    if status != ForecastStatus::Ok {
        return Ok(ForecastSummary::without_data(status));
    }

    let body = response.body.as_ref().ok_or_else(|| {
        AppError::InvalidForecastData("provider returned 200 without a body".to_string())
    })?;
    let parsed: ProviderBody = serde_json::from_value(body.clone())
        .map_err(|e| AppError::InvalidForecastData(format!("unexpected response shape: {}", e)))?;

    let available = parsed.forecasts.len();
    let length = window_length.max(2).min(available);
    if length == 0 {
        return Err(AppError::InvalidForecastData(
            "empty probability sequence".to_string(),
        ));
    }
    if length < 2 {
        return Err(AppError::InvalidForecastData(format!(
            "need at least 2 forecast hours, provider returned {}",
            available
        )));
    }

    let window = &parsed.forecasts[..length];
    let probabilities = window
        .iter()
        .map(|h| {
            u8::try_from(h.pop)
                .ok()
                .filter(|p| *p <= 100)
                .ok_or_else(|| {
                    AppError::InvalidForecastData(format!(
                        "probability {} at {} is outside 0..=100",
                        h.pop, h.fcst_valid_local
                    ))
                })
        })
        .collect::<Result<Vec<u8>, AppError>>()?;

    let window_start = parse_timestamp(&window[0].fcst_valid_local)?;
    let window_end = parse_timestamp(&window[length - 1].fcst_valid_local)?;

    let max = probabilities.iter().copied().max().unwrap_or(0);
    let level = rain_level(max, thresholds);
    let rain_onset = onset_offset(&probabilities, level, thresholds).map(|offset_hours| RainOnset {
        offset_hours,
        at: hour_at_offset(window_start, offset_hours),
    });

    Ok(ForecastSummary {
        status,
        probabilities,
        window_start: Some(window_start),
        window_end: Some(window_end),
        rain_level: level,
        rain_onset,
    })
}

/// Rain level for a peak probability: the number of thresholds it meets.
pub fn rain_level(max_probability: u8, thresholds: &RainThresholds) -> RainLevel {
    let met = thresholds
        .ascending()
        .iter()
        .take_while(|t| max_probability >= **t)
        .count();
    RainLevel::from_thresholds_met(met)
}

/// Offset of the first hour strictly above the onset threshold, or the window
/// length when none is. `None` below `Hardly`.
fn onset_offset(probabilities: &[u8], level: RainLevel, thresholds: &RainThresholds) -> Option<usize> {
    if level < RainLevel::Hardly {
        return None;
    }
    let threshold = thresholds.for_level(level.min(RainLevel::Likely))?;
    Some(
        probabilities
            .iter()
            .position(|p| *p > threshold)
            .unwrap_or(probabilities.len()),
    )
}

fn parse_timestamp(s: &str) -> Result<DateTime<FixedOffset>, AppError> {
    parse_provider_timestamp(s)
        .ok_or_else(|| AppError::InvalidForecastData(format!("unparsable timestamp '{}'", s)))
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use chrono::Timelike;

    /// Provider body with one entry per probability, hourly from `start_hour`
    /// on 2017-06-18 (+09:00), rolling over midnight.
    pub(crate) fn provider_body(start_hour: u32, pops: &[i64]) -> serde_json::Value {
        let start = parse_provider_timestamp(&format!("2017-06-18T{:02}:00:00+0900", start_hour))
            .unwrap();
        let forecasts: Vec<serde_json::Value> = pops
            .iter()
            .enumerate()
            .map(|(i, pop)| {
                serde_json::json!({
                    "class": "fod_short_range_hourly",
                    "pop": pop,
                    "fcst_valid_local": hour_at_offset(start, i).format("%Y-%m-%dT%H:%M:%S%z").to_string(),
                })
            })
            .collect();
        serde_json::json!({ "metadata": { "status_code": 200 }, "forecasts": forecasts })
    }

    pub(crate) fn ok_response(start_hour: u32, pops: &[i64]) -> ProviderResponse {
        ProviderResponse {
            status: 200,
            body: Some(provider_body(start_hour, pops)),
        }
    }

    fn classify_default(pops: &[i64]) -> ForecastSummary {
        classify(&ok_response(6, pops), 12, &RainThresholds::default()).unwrap()
    }

    #[test]
    fn test_never_has_no_onset() {
        let summary = classify_default(&[5, 5, 5]);
        assert_eq!(summary.status, ForecastStatus::Ok);
        assert_eq!(summary.rain_level, RainLevel::Never);
        assert_eq!(summary.rain_onset, None);
    }

    #[test]
    fn test_likely_onset_at_leading_edge() {
        let summary = classify_default(&[5, 20, 60, 5]);
        assert_eq!(summary.rain_level, RainLevel::Likely);
        let onset = summary.rain_onset.unwrap();
        assert_eq!(onset.offset_hours, 2);
        assert_eq!(onset.at.hour(), 8);
    }

    #[test]
    fn test_almost_uses_likely_threshold_for_onset() {
        // Peak 90 is Almost; onset looks for the first hour above 50
        let summary = classify_default(&[10, 40, 55, 90, 20]);
        assert_eq!(summary.rain_level, RainLevel::Almost);
        assert_eq!(summary.rain_onset.unwrap().offset_hours, 2);
    }

    #[test]
    fn test_onset_is_window_end_when_peak_equals_threshold() {
        // Peak exactly 30 meets Maybe but nothing is strictly above 30
        let summary = classify_default(&[0, 30, 10]);
        assert_eq!(summary.rain_level, RainLevel::Maybe);
        assert_eq!(summary.rain_onset.unwrap().offset_hours, 3);
    }

    #[test]
    fn test_threshold_is_inclusive_for_level() {
        assert_eq!(rain_level(9, &RainThresholds::default()), RainLevel::Never);
        assert_eq!(rain_level(10, &RainThresholds::default()), RainLevel::Hardly);
        assert_eq!(rain_level(50, &RainThresholds::default()), RainLevel::Likely);
        assert_eq!(rain_level(80, &RainThresholds::default()), RainLevel::Almost);
        assert_eq!(rain_level(100, &RainThresholds::default()), RainLevel::Almost);
    }

    #[test]
    fn test_rain_level_monotonic_in_peak() {
        let thresholds = RainThresholds::new(5, 25, 45, 95).unwrap();
        let mut previous = RainLevel::Never;
        for max in 0..=100u8 {
            let level = rain_level(max, &thresholds);
            assert!(
                level >= previous,
                "Level dropped from {:?} to {:?} at {}",
                previous,
                level,
                max
            );
            previous = level;
        }
        assert_eq!(previous, RainLevel::Almost);
    }

    #[test]
    fn test_window_clamped_to_requested_length() {
        let pops: Vec<i64> = (0..48).map(|i| if i == 20 { 90 } else { 0 }).collect();
        let summary = classify(&ok_response(6, &pops), 12, &RainThresholds::default()).unwrap();
        assert_eq!(summary.probabilities.len(), 12);
        // The 90% hour falls outside the 12-hour window
        assert_eq!(summary.rain_level, RainLevel::Never);
        assert_eq!(summary.window_start.unwrap().hour(), 6);
        assert_eq!(summary.window_end.unwrap().hour(), 17);
    }

    #[test]
    fn test_window_clamped_up_to_two_hours() {
        let summary = classify(&ok_response(6, &[0, 40, 0]), 0, &RainThresholds::default()).unwrap();
        assert_eq!(summary.probabilities, vec![0, 40]);
        assert_eq!(summary.rain_level, RainLevel::Maybe);
    }

    #[test]
    fn test_window_clamped_to_available_hours() {
        let summary = classify_default(&[0, 0, 0, 0]);
        assert_eq!(summary.probabilities.len(), 4);
    }

    #[test]
    fn test_non_ok_status_short_circuits() {
        for (code, expected) in [
            (202, ForecastStatus::Pending),
            (400, ForecastStatus::BadRequest),
            (401, ForecastStatus::Unauthorized),
            (403, ForecastStatus::RateLimited),
            (404, ForecastStatus::NotFound),
            (500, ForecastStatus::ProviderError),
            (503, ForecastStatus::ProviderError),
        ] {
            let response = ProviderResponse {
                status: code,
                body: None,
            };
            let summary = classify(&response, 12, &RainThresholds::default()).unwrap();
            assert_eq!(summary.status, expected, "HTTP {}", code);
            assert!(summary.probabilities.is_empty());
            assert_eq!(summary.rain_level, RainLevel::Unknown);
            assert_eq!(summary.rain_onset, None);
        }
    }

    #[test]
    fn test_empty_forecasts_is_invalid() {
        let err = classify(&ok_response(6, &[]), 12, &RainThresholds::default()).unwrap_err();
        assert!(matches!(err, AppError::InvalidForecastData(_)));
    }

    #[test]
    fn test_single_hour_is_invalid() {
        let err = classify(&ok_response(6, &[50]), 12, &RainThresholds::default()).unwrap_err();
        assert!(matches!(err, AppError::InvalidForecastData(_)));
    }

    #[test]
    fn test_out_of_range_probability_is_invalid() {
        let err = classify(&ok_response(6, &[10, 101]), 12, &RainThresholds::default()).unwrap_err();
        assert!(matches!(err, AppError::InvalidForecastData(_)));
        let err = classify(&ok_response(6, &[-1, 10]), 12, &RainThresholds::default()).unwrap_err();
        assert!(matches!(err, AppError::InvalidForecastData(_)));
    }

    #[test]
    fn test_malformed_body_is_invalid() {
        let response = ProviderResponse {
            status: 200,
            body: Some(serde_json::json!({ "hourly": [] })),
        };
        let err = classify(&response, 12, &RainThresholds::default()).unwrap_err();
        assert!(matches!(err, AppError::InvalidForecastData(_)));

        let response = ProviderResponse {
            status: 200,
            body: None,
        };
        assert!(classify(&response, 12, &RainThresholds::default()).is_err());
    }

    #[test]
    fn test_bad_timestamp_is_invalid() {
        let response = ProviderResponse {
            status: 200,
            body: Some(serde_json::json!({
                "forecasts": [
                    { "pop": 10, "fcst_valid_local": "soon" },
                    { "pop": 20, "fcst_valid_local": "later" }
                ]
            })),
        };
        let err = classify(&response, 12, &RainThresholds::default()).unwrap_err();
        assert!(matches!(err, AppError::InvalidForecastData(_)));
    }

    #[test]
    fn test_peak_prefers_earliest_hour() {
        let summary = classify_default(&[10, 70, 30, 70]);
        assert_eq!(summary.peak(), Some((1, 70)));

        let pending = ProviderResponse {
            status: 202,
            body: None,
        };
        let summary = classify(&pending, 12, &RainThresholds::default()).unwrap();
        assert_eq!(summary.status, ForecastStatus::Pending);
        assert_eq!(summary.peak(), None);
    }

    #[test]
    fn test_thresholds_must_ascend() {
        assert!(RainThresholds::new(10, 30, 50, 80).is_ok());
        assert!(RainThresholds::new(10, 10, 50, 80).is_err());
        assert!(RainThresholds::new(50, 30, 10, 80).is_err());
        assert!(RainThresholds::new(10, 30, 50, 101).is_err());
    }

    #[test]
    fn test_onset_matches_threshold_of_capped_level() {
        let thresholds = RainThresholds::default();
        for pops in [
            vec![0, 12, 3],
            vec![0, 29, 35, 10],
            vec![5, 20, 60, 5],
            vec![1, 45, 85, 60],
        ] {
            let wide: Vec<i64> = pops.iter().map(|p| *p as i64).collect();
            let summary = classify(&ok_response(6, &wide), 12, &thresholds).unwrap();
            let onset = summary.rain_onset.unwrap();
            let threshold = thresholds
                .for_level(summary.rain_level.min(RainLevel::Likely))
                .unwrap();
            assert!(summary.probabilities[onset.offset_hours] > threshold);
            assert!(summary.probabilities[..onset.offset_hours]
                .iter()
                .all(|p| *p <= threshold));
        }
    }
}

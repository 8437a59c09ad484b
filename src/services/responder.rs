//! Intent handling for inbound text messages.
//!
//! Intents are picked by substring matching against an ordered rule table;
//! the first rule whose predicate matches wins, and anything unmatched gets
//! the greeting. Forecast-backed intents fetch through the injected
//! `ForecastSource` and classify with the configured thresholds.

use chrono::Timelike;
use std::fmt::Write as _;
use std::sync::Arc;

use crate::errors::AppError;
use crate::helpers::hour_of_day_at_offset;
use crate::services::forecast::{classify, ForecastStatus, ForecastSummary, RainLevel, RainThresholds};
use crate::services::weather::ForecastSource;
use crate::store::models::{Location, Schedule};

pub const UMBRELLA_PHRASE: &str = "傘いる";
pub const DETAIL_PHRASE: &str = "詳しく";
pub const HELP_PHRASE: &str = "ヘルプ";
pub const SCHEDULE_PHRASE: &str = "通知";
const TOMORROW_PHRASE: &str = "明日";

/// Message the scheduler sends on behalf of a subscriber.
pub const UMBRELLA_QUERY: &str = "傘いる？";

const GREETING_TEXT: &str = "今日、傘がいるかどうか教えます！\n「傘いる？」と聞いてください。\n\
最初に使う時は、あなたの住んでいる場所を送ってください！\n\
また、特定の時間に傘がいるかどうか通知するよう設定することも可能です。\n\
詳細を知りたい場合は「ヘルプ」と入力してください。";

const HELP_TEXT: &str = "今、傘がいるかどうか知りたい場合「傘いる？」\n\
1時間ごとの降水確率を知りたい場合「詳しく」\n\
特定の時刻で傘が必要な場合に通知させたい場合「通知 7:00」\n\
位置情報を設定または設定し直したい場合、位置情報を送信してください";

const MISSING_LOCATION_TEXT: &str = "まずあなたの居る場所を教えてください";
const TOMORROW_TEXT: &str = "明日の天気はわかりません";
const INTERNAL_ERROR_TEXT: &str = "すいません...\nなにか問題が発生していてお答えできません...";
const INVALID_SCHEDULE_TEXT: &str = "通知する時刻は「通知 7:00」のように送ってください";

/// What the reply represents; callers branch on this, never on the text.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplyStatus {
    Greeting,
    Help,
    Detail,
    MissingLocation,
    NeedUmbrella(RainLevel),
    NoUmbrella(RainLevel),
    TomorrowUnsupported,
    ScheduleSet(Schedule),
    InvalidSchedule,
    InternalError,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reply {
    pub text: String,
    pub status: ReplyStatus,
}

impl Reply {
    fn new(text: impl Into<String>, status: ReplyStatus) -> Self {
        Self {
            text: text.into(),
            status,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Intent {
    Umbrella,
    Detail,
    Help,
    SetSchedule,
    Greeting,
}

struct Rule {
    intent: Intent,
    matches: fn(&str) -> bool,
}

/// Checked in order; first match wins.
const RULES: [Rule; 4] = [
    Rule {
        intent: Intent::Umbrella,
        matches: is_umbrella_query,
    },
    Rule {
        intent: Intent::Detail,
        matches: is_detail_request,
    },
    Rule {
        intent: Intent::Help,
        matches: is_help_request,
    },
    Rule {
        intent: Intent::SetSchedule,
        matches: is_schedule_request,
    },
];

fn is_umbrella_query(message: &str) -> bool {
    message.contains(UMBRELLA_PHRASE)
}

fn is_detail_request(message: &str) -> bool {
    message.contains(DETAIL_PHRASE)
}

fn is_help_request(message: &str) -> bool {
    message.contains(HELP_PHRASE)
}

fn is_schedule_request(message: &str) -> bool {
    message.contains(SCHEDULE_PHRASE)
}

pub fn match_intent(message: &str) -> Intent {
    RULES
        .iter()
        .find(|rule| (rule.matches)(message))
        .map(|rule| rule.intent)
        .unwrap_or(Intent::Greeting)
}

/// Maps inbound text (plus the sender's stored location) to a reply.
pub struct IntentResponder {
    source: Arc<dyn ForecastSource>,
    thresholds: RainThresholds,
    window_length: usize,
}

impl IntentResponder {
    pub fn new(
        source: Arc<dyn ForecastSource>,
        thresholds: RainThresholds,
        window_length: usize,
    ) -> Self {
        Self {
            source,
            thresholds,
            window_length,
        }
    }

    pub async fn respond(&self, message: &str, location: Option<Location>) -> Reply {
        match match_intent(message) {
            Intent::Umbrella => self.umbrella(message, location).await,
            Intent::Detail => self.detail(location).await,
            Intent::Help => Reply::new(HELP_TEXT, ReplyStatus::Help),
            Intent::SetSchedule => set_schedule(message),
            Intent::Greeting => Reply::new(GREETING_TEXT, ReplyStatus::Greeting),
        }
    }

    async fn umbrella(&self, message: &str, location: Option<Location>) -> Reply {
        let Some(location) = location else {
            return Reply::new(MISSING_LOCATION_TEXT, ReplyStatus::MissingLocation);
        };
        if message.contains(TOMORROW_PHRASE) {
            return Reply::new(TOMORROW_TEXT, ReplyStatus::TomorrowUnsupported);
        }
        match self.forecast(location).await {
            Ok(summary) => umbrella_reply(&summary),
            Err(e) => internal_error(location, e),
        }
    }

    async fn detail(&self, location: Option<Location>) -> Reply {
        let Some(location) = location else {
            return Reply::new(MISSING_LOCATION_TEXT, ReplyStatus::MissingLocation);
        };
        match self.forecast(location).await {
            Ok(summary) => {
                let headline = umbrella_reply(&summary).text;
                Reply::new(
                    format!("{}\n\n{}", headline, render_detail(&summary)),
                    ReplyStatus::Detail,
                )
            }
            Err(e) => internal_error(location, e),
        }
    }

    /// Fetch and classify; any non-Ok status is a provider failure.
    async fn forecast(&self, location: Location) -> Result<ForecastSummary, AppError> {
        let response = self.source.fetch(location).await?;
        let summary = classify(&response, self.window_length, &self.thresholds)?;
        if summary.status != ForecastStatus::Ok {
            return Err(AppError::ProviderUnavailable(format!(
                "forecast status {:?} (HTTP {})",
                summary.status, response.status
            )));
        }
        tracing::debug!(
            "Forecast {:?}..{:?}: level {:?}, probabilities {:?}",
            summary.window_start,
            summary.window_end,
            summary.rain_level,
            summary.probabilities
        );
        Ok(summary)
    }
}

fn internal_error(location: Location, err: AppError) -> Reply {
    tracing::warn!(
        "Forecast lookup failed for ({}, {}): {}",
        location.latitude,
        location.longitude,
        err
    );
    Reply::new(INTERNAL_ERROR_TEXT, ReplyStatus::InternalError)
}

fn umbrella_reply(summary: &ForecastSummary) -> Reply {
    let level = summary.rain_level;
    let peak = summary.peak().map(|(_, p)| p).unwrap_or(0);
    let onset = summary
        .rain_onset
        .map(|o| format!("{}時間後({}時頃)", o.offset_hours, o.at.hour()))
        .unwrap_or_default();

    match level {
        RainLevel::Never => Reply::new("今日は傘は必要ありません", ReplyStatus::NoUmbrella(level)),
        RainLevel::Hardly => Reply::new(
            "今日はおそらく傘は必要ありません",
            ReplyStatus::NoUmbrella(level),
        ),
        RainLevel::Maybe => Reply::new(
            format!(
                "{}に雨が降るかもしれませんので、傘が必要かもしれません。",
                onset
            ),
            ReplyStatus::NeedUmbrella(level),
        ),
        RainLevel::Likely => Reply::new(
            format!(
                "{}に雨が降る可能性が高いので、傘が必要です。(最大降水確率 {}%)",
                onset, peak
            ),
            ReplyStatus::NeedUmbrella(level),
        ),
        RainLevel::Almost => Reply::new(
            format!(
                "{}に雨が高確率で降るので、傘が必要です。(最大降水確率 {}%)",
                onset, peak
            ),
            ReplyStatus::NeedUmbrella(level),
        ),
        RainLevel::Unknown => Reply::new(INTERNAL_ERROR_TEXT, ReplyStatus::InternalError),
    }
}

/// One line per forecast hour, then the peak probability and its hour.
pub fn render_detail(summary: &ForecastSummary) -> String {
    let Some(start) = summary.window_start else {
        return String::new();
    };

    let mut out = String::new();
    for (offset, pop) in summary.probabilities.iter().enumerate() {
        let _ = writeln!(out, "{}時 {}%", hour_of_day_at_offset(start, offset), pop);
    }
    if let Some((offset, pop)) = summary.peak() {
        let _ = write!(
            out,
            "最高降水確率: {}% ({}時)",
            pop,
            hour_of_day_at_offset(start, offset)
        );
    }
    out
}

fn set_schedule(message: &str) -> Reply {
    match parse_schedule(message) {
        Some(schedule) => Reply::new(
            format!("毎日{}に傘が必要かどうかお知らせします", schedule),
            ReplyStatus::ScheduleSet(schedule),
        ),
        None => Reply::new(INVALID_SCHEDULE_TEXT, ReplyStatus::InvalidSchedule),
    }
}

/// Parse the `H:MM` after the schedule phrase. Full-width colons are accepted.
pub fn parse_schedule(message: &str) -> Option<Schedule> {
    let (_, rest) = message.split_once(SCHEDULE_PHRASE)?;
    let rest = rest.replace('：', ":");
    let (hour_part, minute_part) = rest.split_once(':')?;

    let hour_digits: String = hour_part
        .trim_end()
        .chars()
        .rev()
        .take_while(|c| c.is_ascii_digit())
        .collect::<Vec<_>>()
        .into_iter()
        .rev()
        .collect();
    let minute_digits: String = minute_part
        .trim_start()
        .chars()
        .take_while(|c| c.is_ascii_digit())
        .collect();
    if hour_digits.is_empty() || hour_digits.len() > 2 || minute_digits.len() != 2 {
        return None;
    }

    Schedule::new(hour_digits.parse().ok()?, minute_digits.parse().ok()?)
}

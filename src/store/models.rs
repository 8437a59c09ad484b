use serde::{Deserialize, Serialize};

/// A subscriber's position, as sent in a location message.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Location {
    pub latitude: f64,
    pub longitude: f64,
}

/// Daily notification time in the configured civil time zone.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "RawSchedule")]
pub struct Schedule {
    pub hour: u32,
    pub minute: u32,
}

/// Unchecked wire form; loading goes through `Schedule::new`.
#[derive(Deserialize)]
struct RawSchedule {
    hour: u32,
    minute: u32,
}

impl TryFrom<RawSchedule> for Schedule {
    type Error = String;

    fn try_from(raw: RawSchedule) -> Result<Self, Self::Error> {
        Schedule::new(raw.hour, raw.minute)
            .ok_or_else(|| format!("schedule {}:{:02} is out of range", raw.hour, raw.minute))
    }
}

impl Schedule {
    /// Returns `None` unless `hour < 24` and `minute < 60`.
    pub fn new(hour: u32, minute: u32) -> Option<Self> {
        (hour < 24 && minute < 60).then_some(Self { hour, minute })
    }
}

impl std::fmt::Display for Schedule {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{:02}", self.hour, self.minute)
    }
}

/// Per-user settings, one entry per subscriber in the state file.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct UserSetting {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub location: Option<Location>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub schedule: Option<Schedule>,
}

/// Partial update for a `UserSetting`. Only `Some` fields are written.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct SettingUpdate {
    pub location: Option<Location>,
    pub schedule: Option<Schedule>,
}

impl SettingUpdate {
    pub fn location(location: Location) -> Self {
        Self {
            location: Some(location),
            ..Self::default()
        }
    }

    pub fn schedule(schedule: Schedule) -> Self {
        Self {
            schedule: Some(schedule),
            ..Self::default()
        }
    }
}

impl UserSetting {
    /// Merge `update` into this entry, returning the names of fields that
    /// replaced an existing value.
    pub fn apply(&mut self, update: SettingUpdate) -> Vec<&'static str> {
        let mut overwritten = Vec::new();
        if let Some(location) = update.location {
            if self.location.replace(location).is_some() {
                overwritten.push("location");
            }
        }
        if let Some(schedule) = update.schedule {
            if self.schedule.replace(schedule).is_some() {
                overwritten.push("schedule");
            }
        }
        overwritten
    }
}

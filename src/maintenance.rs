//! Maintenance-window configuration and timing decisions.
//!
//! Windows are declared per cluster in a TOML file. All window math is done
//! in UTC; a declared timezone other than UTC is carried through but windows
//! are still interpreted as UTC wall-clock times. A window whose end is at
//! or before its start crosses midnight; ordinal-day constraints then apply
//! to the date the window starts on.

use std::collections::{BTreeMap, HashSet};
use std::path::Path;

use chrono::{DateTime, Datelike, Duration as ChronoDuration, NaiveTime, TimeZone, Utc, Weekday};
use serde::Deserialize;
use thiserror::Error;

use crate::types::{MaintenanceWindowCheckResult, MinAvailability, DEFAULT_DC_UTIL_TIMEOUT};

#[derive(Debug, Error)]
pub enum MaintenanceConfigError {
    #[error("maintenance config file not found: {0}")]
    NotFound(String),
    #[error("failed to read maintenance config {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse maintenance config {path}: {source}")]
    Parse {
        path: String,
        #[source]
        source: toml::de::Error,
    },
    #[error("invalid window for cluster {cluster}: {message}")]
    InvalidWindow { cluster: String, message: String },
}

/// Raw TOML shapes.
#[derive(Deserialize, Debug)]
struct RawCluster {
    #[serde(default)]
    windows: Vec<RawWindow>,
    #[serde(default = "default_timezone")]
    timezone: String,
    #[serde(default = "default_min_window_duration")]
    min_window_duration: i64,
    #[serde(default = "default_dc_util_timeout")]
    dc_util_timeout: u64,
    #[serde(default)]
    min_availability: MinAvailability,
}

#[derive(Deserialize, Debug)]
struct RawWindow {
    /// Time range like `"18:00-24:00"`.
    time: String,
    #[serde(default)]
    weekdays: Option<Vec<String>>,
    #[serde(default)]
    ordinal_days: Option<Vec<String>>,
    #[serde(default)]
    description: Option<String>,
}

fn default_timezone() -> String {
    "UTC".to_string()
}

fn default_min_window_duration() -> i64 {
    30
}

fn default_dc_util_timeout() -> u64 {
    DEFAULT_DC_UTIL_TIMEOUT
}

/// Ordinal occurrence of a weekday within a month.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Ordinal {
    Nth(u32),
    Last,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OrdinalDay {
    pub ordinal: Ordinal,
    pub weekday: Weekday,
}

#[derive(Debug, Clone)]
pub struct MaintenanceWindow {
    pub start: NaiveTime,
    pub end: NaiveTime,
    pub weekdays: Option<HashSet<Weekday>>,
    pub ordinal_days: Option<Vec<OrdinalDay>>,
    pub description: Option<String>,
}

impl MaintenanceWindow {
    /// End at or before start means the window runs across midnight.
    pub fn crosses_midnight(&self) -> bool {
        self.end <= self.start
    }

    /// Whether the window admits the given UTC instant.
    pub fn contains(&self, at: DateTime<Utc>) -> bool {
        let time = at.time();

        if self.crosses_midnight() {
            if !(time >= self.start || time <= self.end) {
                return false;
            }
        } else if !(self.start <= time && time <= self.end) {
            return false;
        }

        if let Some(weekdays) = &self.weekdays {
            if !weekdays.contains(&at.weekday()) {
                return false;
            }
        }

        if let Some(ordinal_days) = &self.ordinal_days {
            // In the early-morning tail of a midnight-crossing window the
            // constraint applies to the date the window started on.
            let anchor = if self.crosses_midnight() && time <= self.end {
                at - ChronoDuration::days(1)
            } else {
                at
            };
            if !ordinal_days.iter().any(|day| day.matches(anchor)) {
                return false;
            }
        }

        true
    }

    pub fn describe(&self, index: usize) -> String {
        self.description
            .clone()
            .unwrap_or_else(|| format!("window {}", index + 1))
    }
}

impl OrdinalDay {
    fn matches(&self, at: DateTime<Utc>) -> bool {
        if at.weekday() != self.weekday {
            return false;
        }
        match self.ordinal {
            Ordinal::Nth(n) => (at.day() - 1) / 7 + 1 == n,
            Ordinal::Last => at.day() + 7 > days_in_month(at.year(), at.month()),
        }
    }
}

fn days_in_month(year: i32, month: u32) -> u32 {
    let (next_year, next_month) = if month == 12 {
        (year + 1, 1)
    } else {
        (year, month + 1)
    };
    chrono::NaiveDate::from_ymd_opt(next_year, next_month, 1)
        .and_then(|first| first.pred_opt())
        .map(|last| last.day())
        .unwrap_or(28)
}

/// Per-cluster maintenance configuration.
#[derive(Debug, Clone)]
pub struct ClusterMaintenanceConfig {
    pub cluster_name: String,
    pub windows: Vec<MaintenanceWindow>,
    pub timezone: String,
    /// Minimum minutes of window needed before a restart is worth starting.
    pub min_window_duration: i64,
    pub dc_util_timeout: u64,
    pub min_availability: MinAvailability,
}

/// How far ahead to search for the next window start.
const NEXT_WINDOW_HORIZON_DAYS: i64 = 35;

impl ClusterMaintenanceConfig {
    /// The window admitting `at`, if any.
    pub fn window_at(&self, at: DateTime<Utc>) -> Option<(usize, &MaintenanceWindow)> {
        self.windows
            .iter()
            .enumerate()
            .find(|(_, window)| window.contains(at))
    }

    /// Earliest window start strictly after `from`, within the horizon.
    pub fn next_window_start(&self, from: DateTime<Utc>) -> Option<DateTime<Utc>> {
        if self.windows.is_empty() {
            return None;
        }
        for day_offset in 0..=NEXT_WINDOW_HORIZON_DAYS {
            let date = (from + ChronoDuration::days(day_offset)).date_naive();
            let candidate = self
                .windows
                .iter()
                .filter_map(|window| {
                    let start = Utc.from_utc_datetime(&date.and_time(window.start));
                    (window.contains(start) && start > from).then_some(start)
                })
                .min();
            if let Some(start) = candidate {
                return Some(start);
            }
        }
        None
    }

    /// Decide whether a restart should wait.
    ///
    /// False inside a window and when no windows are configured. Outside a
    /// window the restart waits unless the next window opens in under
    /// `min_window_duration` minutes (close enough to proceed into) — with
    /// no upcoming window at all, it waits indefinitely.
    pub fn should_wait(&self, at: DateTime<Utc>) -> (bool, String) {
        if self.windows.is_empty() {
            return (
                false,
                format!(
                    "No maintenance windows configured for cluster '{}' - proceeding without restrictions",
                    self.cluster_name
                ),
            );
        }

        if let Some((index, window)) = self.window_at(at) {
            return (
                false,
                format!(
                    "Proceeding with restart: current time is within maintenance {} ({}-{})",
                    window.describe(index),
                    window.start.format("%H:%M"),
                    window.end.format("%H:%M"),
                ),
            );
        }

        match self.next_window_start(at) {
            Some(start) => {
                let minutes_until = (start - at).num_minutes();
                if minutes_until < self.min_window_duration {
                    (
                        false,
                        format!(
                            "Next maintenance window opens at {} ({minutes_until} minutes away) - proceeding into it",
                            start.format("%Y-%m-%d %H:%M UTC"),
                        ),
                    )
                } else {
                    (
                        true,
                        format!(
                            "Waiting for next maintenance window starting at {}",
                            start.format("%Y-%m-%d %H:%M UTC"),
                        ),
                    )
                }
            }
            None => (
                true,
                format!(
                    "Waiting indefinitely: no upcoming maintenance windows found for cluster '{}' in the next {NEXT_WINDOW_HORIZON_DAYS} days",
                    self.cluster_name
                ),
            ),
        }
    }
}

/// Whole maintenance configuration file.
#[derive(Debug, Clone, Default)]
pub struct MaintenanceConfig {
    clusters: BTreeMap<String, ClusterMaintenanceConfig>,
}

impl MaintenanceConfig {
    pub fn load(path: impl AsRef<Path>) -> Result<Self, MaintenanceConfigError> {
        let path = path.as_ref();
        if !path.exists() {
            return Err(MaintenanceConfigError::NotFound(path.display().to_string()));
        }
        let raw = std::fs::read_to_string(path).map_err(|source| MaintenanceConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;
        Self::parse(&raw)
    }

    pub fn parse(raw: &str) -> Result<Self, MaintenanceConfigError> {
        let raw_clusters: BTreeMap<String, RawCluster> =
            toml::from_str(raw).map_err(|source| MaintenanceConfigError::Parse {
                path: "<inline>".to_string(),
                source,
            })?;

        let mut clusters = BTreeMap::new();
        for (cluster_name, raw_cluster) in raw_clusters {
            let mut windows = Vec::with_capacity(raw_cluster.windows.len());
            for raw_window in &raw_cluster.windows {
                windows.push(parse_window(&cluster_name, raw_window)?);
            }
            clusters.insert(
                cluster_name.clone(),
                ClusterMaintenanceConfig {
                    cluster_name,
                    windows,
                    timezone: raw_cluster.timezone,
                    min_window_duration: raw_cluster.min_window_duration,
                    dc_util_timeout: raw_cluster.dc_util_timeout,
                    min_availability: raw_cluster.min_availability,
                },
            );
        }
        Ok(Self { clusters })
    }

    pub fn cluster(&self, name: &str) -> Option<&ClusterMaintenanceConfig> {
        self.clusters.get(name)
    }

    pub fn clusters(&self) -> impl Iterator<Item = &ClusterMaintenanceConfig> {
        self.clusters.values()
    }

    /// Full check result for one cluster at one instant.
    pub fn check(&self, cluster_name: &str, now: DateTime<Utc>) -> MaintenanceWindowCheckResult {
        match self.cluster(cluster_name) {
            None => MaintenanceWindowCheckResult {
                cluster_name: cluster_name.to_string(),
                should_wait: false,
                reason: format!(
                    "No maintenance configuration found for cluster '{cluster_name}' - proceeding without restrictions"
                ),
                next_window_start: None,
                current_time: now,
                in_maintenance_window: false,
            },
            Some(config) => {
                let in_window = config.window_at(now).is_some();
                let (should_wait, reason) = config.should_wait(now);
                MaintenanceWindowCheckResult {
                    cluster_name: cluster_name.to_string(),
                    should_wait,
                    reason,
                    next_window_start: config.next_window_start(now),
                    current_time: now,
                    in_maintenance_window: in_window,
                }
            }
        }
    }
}

fn parse_window(
    cluster: &str,
    raw: &RawWindow,
) -> Result<MaintenanceWindow, MaintenanceConfigError> {
    let invalid = |message: String| MaintenanceConfigError::InvalidWindow {
        cluster: cluster.to_string(),
        message,
    };

    let (start_raw, end_raw) = raw
        .time
        .split_once('-')
        .ok_or_else(|| invalid(format!("invalid time range '{}'", raw.time)))?;
    let start = parse_wall_time(start_raw.trim())
        .ok_or_else(|| invalid(format!("invalid time '{}'", start_raw.trim())))?;
    let end = parse_wall_time(end_raw.trim())
        .ok_or_else(|| invalid(format!("invalid time '{}'", end_raw.trim())))?;

    let weekdays = match &raw.weekdays {
        None => None,
        Some(names) => {
            let mut set = HashSet::new();
            for name in names {
                set.insert(
                    parse_weekday(name)
                        .ok_or_else(|| invalid(format!("unrecognized weekday '{name}'")))?,
                );
            }
            Some(set)
        }
    };

    let ordinal_days = match &raw.ordinal_days {
        None => None,
        Some(specs) => {
            let mut days = Vec::new();
            for spec in specs {
                days.push(
                    parse_ordinal_day(spec)
                        .ok_or_else(|| invalid(format!("unrecognized ordinal day '{spec}'")))?,
                );
            }
            Some(days)
        }
    };

    Ok(MaintenanceWindow {
        start,
        end,
        weekdays,
        ordinal_days,
        description: raw.description.clone(),
    })
}

/// Parse `HH:MM`; `24:00` normalizes to `23:59:59` (end of day).
pub fn parse_wall_time(raw: &str) -> Option<NaiveTime> {
    if raw == "24:00" {
        return NaiveTime::from_hms_opt(23, 59, 59);
    }
    let (hour, minute) = raw.split_once(':')?;
    NaiveTime::from_hms_opt(hour.parse().ok()?, minute.parse().ok()?, 0)
}

pub fn parse_weekday(raw: &str) -> Option<Weekday> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "mon" | "monday" => Some(Weekday::Mon),
        "tue" | "tuesday" => Some(Weekday::Tue),
        "wed" | "wednesday" => Some(Weekday::Wed),
        "thu" | "thursday" => Some(Weekday::Thu),
        "fri" | "friday" => Some(Weekday::Fri),
        "sat" | "saturday" => Some(Weekday::Sat),
        "sun" | "sunday" => Some(Weekday::Sun),
        _ => None,
    }
}

/// Parse `"<ordinal> <weekday>"` like `"2nd tue"` or `"last fri"`.
pub fn parse_ordinal_day(raw: &str) -> Option<OrdinalDay> {
    let lowered = raw.trim().to_ascii_lowercase();
    let mut iter = lowered.split_whitespace();
    let ordinal_raw = iter.next()?;
    let weekday_raw = iter.next()?;
    if iter.next().is_some() {
        return None;
    }
    let ordinal = match ordinal_raw {
        "1st" | "first" => Ordinal::Nth(1),
        "2nd" | "second" => Ordinal::Nth(2),
        "3rd" | "third" => Ordinal::Nth(3),
        "4th" | "fourth" => Ordinal::Nth(4),
        "5th" | "fifth" => Ordinal::Nth(5),
        "last" => Ordinal::Last,
        _ => return None,
    };
    Some(OrdinalDay {
        ordinal,
        weekday: parse_weekday(weekday_raw)?,
    })
}

/// Sample configuration written by `rotor maintenance create-config`.
pub const SAMPLE_CONFIG: &str = r#"# Maintenance Windows Configuration
# All times are in UTC

[aqua-darth-vader]
timezone = "UTC"
min_window_duration = 30  # Minimum minutes needed for maintenance
dc_util_timeout = 720     # Drain timeout in seconds
min_availability = "PRIMARIES"

[[aqua-darth-vader.windows]]
time = "18:00-24:00"
weekdays = ["mon", "tue", "wed"]
description = "Evening maintenance window"

[[aqua-darth-vader.windows]]
time = "17:00-21:00"
ordinal_days = ["2nd tue", "3rd mon"]
description = "Monthly maintenance slots"

[production-cluster]
timezone = "UTC"
min_window_duration = 60

[[production-cluster.windows]]
time = "02:00-04:00"
weekdays = ["sat", "sun"]
description = "Weekend early morning maintenance"

[[production-cluster.windows]]
time = "23:00-01:00"
ordinal_days = ["last fri"]
description = "End of month maintenance"
"#;

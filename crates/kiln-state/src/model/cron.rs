//! Cron schedules and the rows the scheduler walks.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Datelike, Duration, NaiveDate, NaiveTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};

/// How often a cron fires. Every schedule fires at midnight UTC.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Schedule {
    Daily,
    Weekly,
    Monthly,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown schedule: {0}")]
pub struct UnknownSchedule(pub String);

impl Schedule {
    pub fn as_str(&self) -> &'static str {
        match self {
            Schedule::Daily => "daily",
            Schedule::Weekly => "weekly",
            Schedule::Monthly => "monthly",
        }
    }

    /// Next firing time strictly after `now`.
    ///
    /// - daily: midnight of the following day
    /// - weekly: the next Sunday midnight
    /// - monthly: midnight of the same day next month, clamped to the
    ///   last day when next month is shorter
    pub fn next(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        let today = now.date_naive();
        let date = match self {
            Schedule::Daily => today + Duration::days(1),
            Schedule::Weekly => {
                let from_sunday = today.weekday().num_days_from_sunday() as i64;
                today + Duration::days(7 - from_sunday)
            }
            Schedule::Monthly => same_day_next_month(today),
        };
        midnight(date)
    }
}

fn midnight(date: NaiveDate) -> DateTime<Utc> {
    Utc.from_utc_datetime(&date.and_time(NaiveTime::default()))
}

fn same_day_next_month(date: NaiveDate) -> NaiveDate {
    let (year, month) = if date.month() == 12 {
        (date.year() + 1, 1)
    } else {
        (date.year(), date.month() + 1)
    };
    let mut day = date.day();
    loop {
        if let Some(d) = NaiveDate::from_ymd_opt(year, month, day) {
            return d;
        }
        day -= 1;
    }
}

impl fmt::Display for Schedule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Schedule {
    type Err = UnknownSchedule;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "daily" => Ok(Schedule::Daily),
            "weekly" => Ok(Schedule::Weekly),
            "monthly" => Ok(Schedule::Monthly),
            other => Err(UnknownSchedule(other.to_string())),
        }
    }
}

/// A user-owned schedule that materialises periodic builds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Cron {
    pub id: i64,
    pub user_id: i64,
    pub namespace_id: Option<i64>,
    pub name: String,
    pub schedule: Schedule,
    pub manifest: String,
    pub prev_run: Option<DateTime<Utc>>,
    pub next_run: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
}

impl Cron {
    /// Whether the cron should fire at `now`.
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        now >= self.next_run
    }

    /// Tag attached to every build this cron creates.
    pub fn tag(&self) -> String {
        format!("cron:{}", self.name.replace(' ', "-"))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewCron {
    pub user_id: i64,
    pub namespace_id: Option<i64>,
    pub name: String,
    pub schedule: Schedule,
    pub manifest: String,
}

/// Link between a cron and a build it created.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CronBuild {
    pub cron_id: i64,
    pub build_id: i64,
}

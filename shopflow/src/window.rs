//! Run windows: the date range a pipeline run covers.

use crate::pipeline::Stage;
use chrono::{DateTime, Days, FixedOffset, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use thiserror::Error;
use uuid::Uuid;

/// The run mode given on the command line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunMode {
    /// The current business day.
    Today,
    /// The previous business day.
    Yesterday,
    /// The seven days ending yesterday.
    #[serde(rename = "last_7_days")]
    Last7Days,
}

impl fmt::Display for RunMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Today => write!(f, "today"),
            Self::Yesterday => write!(f, "yesterday"),
            Self::Last7Days => write!(f, "last_7_days"),
        }
    }
}

/// An unrecognized run mode.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("unknown run mode '{0}', expected one of: today, yesterday, last_7_days")]
pub struct UnknownRunMode(pub String);

impl FromStr for RunMode {
    type Err = UnknownRunMode;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "today" => Ok(Self::Today),
            "yesterday" => Ok(Self::Yesterday),
            "last_7_days" => Ok(Self::Last7Days),
            other => Err(UnknownRunMode(other.to_string())),
        }
    }
}

/// An inclusive date range in the business timezone.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RunWindow {
    /// Mode the window was resolved from.
    pub mode: RunMode,
    /// First day, inclusive.
    pub start_date: NaiveDate,
    /// Last day, inclusive.
    pub end_date: NaiveDate,
}

impl RunWindow {
    /// Resolves `mode` against `now` in the business `offset`.
    #[must_use]
    pub fn resolve(mode: RunMode, now: DateTime<Utc>, offset: FixedOffset) -> Self {
        let today = now.with_timezone(&offset).date_naive();
        let yesterday = today.checked_sub_days(Days::new(1)).unwrap_or(today);

        let (start_date, end_date) = match mode {
            RunMode::Today => (today, today),
            RunMode::Yesterday => (yesterday, yesterday),
            RunMode::Last7Days => (
                yesterday.checked_sub_days(Days::new(6)).unwrap_or(yesterday),
                yesterday,
            ),
        };

        Self {
            mode,
            start_date,
            end_date,
        }
    }

    /// Placeholder values for stage templates.
    #[must_use]
    pub fn template_vars(&self, run_id: Uuid) -> BTreeMap<String, String> {
        BTreeMap::from([
            ("mode".to_string(), self.mode.to_string()),
            ("start_date".to_string(), self.start_date.to_string()),
            ("end_date".to_string(), self.end_date.to_string()),
            ("run_id".to_string(), run_id.to_string()),
        ])
    }

    /// Renders stage templates and exports the window to each stage's
    /// environment. Explicit stage environment entries win.
    #[must_use]
    pub fn apply(&self, stages: &[Stage], run_id: Uuid) -> Vec<Stage> {
        let vars = self.template_vars(run_id);

        stages
            .iter()
            .map(|stage| {
                let mut rendered = stage.render(&vars);
                for (key, value) in &vars {
                    rendered
                        .command
                        .env
                        .entry(format!("SHOPFLOW_{}", key.to_ascii_uppercase()))
                        .or_insert_with(|| value.clone());
                }
                rendered
            })
            .collect()
    }
}

impl fmt::Display for RunWindow {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({}..={})", self.mode, self.start_date, self.end_date)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::CommandSpec;
    use chrono::TimeZone;
    use pretty_assertions::assert_eq;

    fn jst() -> FixedOffset {
        FixedOffset::east_opt(9 * 3600).unwrap()
    }

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    #[test]
    fn test_parse_modes() {
        assert_eq!("today".parse::<RunMode>().unwrap(), RunMode::Today);
        assert_eq!("last_7_days".parse::<RunMode>().unwrap(), RunMode::Last7Days);
        assert_eq!(
            "last_week".parse::<RunMode>().unwrap_err(),
            UnknownRunMode("last_week".to_string())
        );
    }

    #[test]
    fn test_business_day_uses_offset() {
        // 16:00 UTC on the 1st is already the 2nd in +09:00.
        let now = Utc.with_ymd_and_hms(2026, 3, 1, 16, 0, 0).unwrap();

        let today = RunWindow::resolve(RunMode::Today, now, jst());
        assert_eq!((today.start_date, today.end_date), (date(2026, 3, 2), date(2026, 3, 2)));

        let yesterday = RunWindow::resolve(RunMode::Yesterday, now, jst());
        assert_eq!(yesterday.start_date, date(2026, 3, 1));
    }

    #[test]
    fn test_last_7_days_ends_yesterday() {
        let now = Utc.with_ymd_and_hms(2026, 3, 2, 3, 0, 0).unwrap();
        let window = RunWindow::resolve(RunMode::Last7Days, now, jst());

        assert_eq!(window.start_date, date(2026, 2, 23));
        assert_eq!(window.end_date, date(2026, 3, 1));
        assert_eq!(window.to_string(), "last_7_days (2026-02-23..=2026-03-01)");
    }

    #[test]
    fn test_apply_renders_and_exports() {
        let now = Utc.with_ymd_and_hms(2026, 3, 2, 3, 0, 0).unwrap();
        let window = RunWindow::resolve(RunMode::Yesterday, now, jst());
        let run_id = Uuid::new_v4();

        let stages = vec![Stage::new(
            "collect",
            CommandSpec::new("collect-orders")
                .args(["--from", "{start_date}", "--to", "{end_date}"])
                .env("SHOPFLOW_MODE", "override"),
        )];
        let applied = window.apply(&stages, run_id);
        let command = &applied[0].command;

        assert_eq!(command.args, vec!["--from", "2026-03-01", "--to", "2026-03-01"]);
        assert_eq!(command.env["SHOPFLOW_START_DATE"], "2026-03-01");
        assert_eq!(command.env["SHOPFLOW_RUN_ID"], run_id.to_string());
        assert_eq!(command.env["SHOPFLOW_MODE"], "override");
    }
}

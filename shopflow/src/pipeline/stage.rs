//! Stage definitions.

use crate::errors::{Result, ShopflowError};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

/// Timeout applied when a stage does not set one.
pub const DEFAULT_STAGE_TIMEOUT: Duration = Duration::from_secs(3600);

/// Whether a stage's failure aborts the rest of the run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Criticality {
    /// Failure aborts the run.
    #[default]
    Fatal,
    /// Failure is recorded and the run continues.
    Tolerable,
}

impl fmt::Display for Criticality {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Fatal => write!(f, "fatal"),
            Self::Tolerable => write!(f, "tolerable"),
        }
    }
}

/// What to execute for a stage: an external program with arguments.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandSpec {
    /// Program to run, resolved through `PATH`.
    pub program: String,
    /// Positional arguments.
    #[serde(default)]
    pub args: Vec<String>,
    /// Environment overrides.
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    /// Working directory, inherited when unset.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub working_dir: Option<PathBuf>,
}

impl CommandSpec {
    /// Creates a command for `program` with no arguments.
    #[must_use]
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            ..Self::default()
        }
    }

    /// Appends an argument.
    #[must_use]
    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    /// Appends several arguments.
    #[must_use]
    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    /// Sets an environment variable.
    #[must_use]
    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    /// Sets the working directory.
    #[must_use]
    pub fn with_working_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_dir = Some(dir.into());
        self
    }

    /// Substitutes `{name}` placeholders in arguments and environment values.
    ///
    /// Unknown placeholders are left as they are.
    #[must_use]
    pub fn render(&self, vars: &BTreeMap<String, String>) -> Self {
        let substitute = |text: &str| {
            vars.iter().fold(text.to_string(), |acc, (key, value)| {
                acc.replace(&format!("{{{key}}}"), value)
            })
        };

        Self {
            program: self.program.clone(),
            args: self.args.iter().map(|arg| substitute(arg)).collect(),
            env: self
                .env
                .iter()
                .map(|(key, value)| (key.clone(), substitute(value)))
                .collect(),
            working_dir: self.working_dir.clone(),
        }
    }

    /// Program and arguments as one line, for logs.
    #[must_use]
    pub fn display_line(&self) -> String {
        std::iter::once(self.program.as_str())
            .chain(self.args.iter().map(String::as_str))
            .collect::<Vec<_>>()
            .join(" ")
    }
}

/// One unit of work in a pipeline.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Stage {
    /// Unique stage name.
    pub name: String,
    /// What to run.
    pub command: CommandSpec,
    /// Hard wall-clock bound.
    pub timeout: Duration,
    /// Failure policy.
    pub criticality: Criticality,
    /// Wait before running, for upstream side effects to settle.
    pub pre_delay: Duration,
}

impl Stage {
    /// Creates a fatal stage with the default timeout and no pre-delay.
    #[must_use]
    pub fn new(name: impl Into<String>, command: CommandSpec) -> Self {
        Self {
            name: name.into(),
            command,
            timeout: DEFAULT_STAGE_TIMEOUT,
            criticality: Criticality::Fatal,
            pre_delay: Duration::ZERO,
        }
    }

    /// Sets the timeout.
    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Sets the criticality.
    #[must_use]
    pub fn with_criticality(mut self, criticality: Criticality) -> Self {
        self.criticality = criticality;
        self
    }

    /// Marks the stage tolerable.
    #[must_use]
    pub fn tolerable(self) -> Self {
        self.with_criticality(Criticality::Tolerable)
    }

    /// Sets the pre-delay.
    #[must_use]
    pub fn with_pre_delay(mut self, delay: Duration) -> Self {
        self.pre_delay = delay;
        self
    }

    /// Returns a copy with placeholders rendered from `vars`.
    #[must_use]
    pub fn render(&self, vars: &BTreeMap<String, String>) -> Self {
        Self {
            command: self.command.render(vars),
            ..self.clone()
        }
    }

    /// Checks that the stage can be run.
    pub fn validate(&self) -> Result<()> {
        if self.name.trim().is_empty() {
            return Err(ShopflowError::config("stage name must not be empty"));
        }
        if self.command.program.trim().is_empty() {
            return Err(ShopflowError::config(format!(
                "stage '{}' has no program",
                self.name
            )));
        }
        if self.timeout.is_zero() {
            return Err(ShopflowError::config(format!(
                "stage '{}' has a zero timeout",
                self.name
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn vars() -> BTreeMap<String, String> {
        BTreeMap::from([
            ("mode".to_string(), "yesterday".to_string()),
            ("start_date".to_string(), "2026-10-18".to_string()),
        ])
    }

    #[test]
    fn test_render_args_and_env() {
        let command = CommandSpec::new("python")
            .args(["-m", "jobs.collect", "--date={start_date}", "{unknown}"])
            .env("RUN_MODE", "{mode}");

        let rendered = command.render(&vars());

        assert_eq!(rendered.args[2], "--date=2026-10-18");
        assert_eq!(rendered.args[3], "{unknown}");
        assert_eq!(rendered.env["RUN_MODE"], "yesterday");
        assert_eq!(rendered.program, "python");
    }

    #[test]
    fn test_stage_defaults() {
        let stage = Stage::new("collect", CommandSpec::new("true"));
        assert_eq!(stage.criticality, Criticality::Fatal);
        assert_eq!(stage.timeout, DEFAULT_STAGE_TIMEOUT);
        assert_eq!(stage.pre_delay, Duration::ZERO);
        assert!(stage.validate().is_ok());
    }

    #[test]
    fn test_stage_validate() {
        assert!(Stage::new(" ", CommandSpec::new("true")).validate().is_err());
        assert!(Stage::new("collect", CommandSpec::new("")).validate().is_err());
        assert!(Stage::new("collect", CommandSpec::new("true"))
            .with_timeout(Duration::ZERO)
            .validate()
            .is_err());
    }

    #[test]
    fn test_display_line() {
        let command = CommandSpec::new("sh").args(["-c", "exit 0"]);
        assert_eq!(command.display_line(), "sh -c exit 0");
    }

    #[test]
    fn test_criticality_serde() {
        let parsed: Criticality = serde_json::from_str("\"tolerable\"").unwrap();
        assert_eq!(parsed, Criticality::Tolerable);
        assert_eq!(Criticality::default().to_string(), "fatal");
    }
}

//! Run-wide policy settings.
//!
//! Built once at start-up (document defaults, then CLI overrides) and shared
//! read-only for the rest of the run.

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Largest timeout accepted from a document or the command line (one week).
pub const MAX_TIMEOUT_SECS: u64 = 7 * 24 * 60 * 60;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct PolicySettings {
    pub continue_on_error: bool,
    pub parallel: bool,
    #[serde(with = "duration_secs")]
    #[schemars(with = "u64")]
    pub per_job_timeout: Duration,
    pub keep_resources_on_failure: bool,
    /// Worker cap for parallel mode.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_parallel: Option<usize>,
    #[serde(default)]
    pub timeouts: StepTimeouts,
    #[serde(default = "default_teardown_attempts")]
    pub teardown_attempts: u32,
    #[serde(with = "duration_secs", default = "default_grace_period")]
    #[schemars(with = "u64")]
    pub grace_period: Duration,
}

/// Bounds for the individual backend steps.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct StepTimeouts {
    #[serde(with = "duration_secs")]
    #[schemars(with = "u64")]
    pub build: Duration,
    /// Creating and starting the job container.
    #[serde(with = "duration_secs", default = "default_run_timeout")]
    #[schemars(with = "u64")]
    pub run: Duration,
    #[serde(with = "duration_secs")]
    #[schemars(with = "u64")]
    pub exec: Duration,
    #[serde(with = "duration_secs")]
    #[schemars(with = "u64")]
    pub teardown: Duration,
    /// Whole-run bound; elapsing it cancels the run like an interrupt.
    #[serde(
        with = "optional_duration_secs",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    #[schemars(with = "Option<u64>")]
    pub global: Option<Duration>,
}

fn default_teardown_attempts() -> u32 {
    3
}

fn default_run_timeout() -> Duration {
    Duration::from_secs(120)
}

fn default_grace_period() -> Duration {
    Duration::from_secs(30)
}

impl Default for StepTimeouts {
    fn default() -> Self {
        Self {
            build: Duration::from_secs(600),
            run: default_run_timeout(),
            exec: Duration::from_secs(300),
            teardown: Duration::from_secs(60),
            global: None,
        }
    }
}

impl Default for PolicySettings {
    fn default() -> Self {
        Self {
            continue_on_error: true,
            parallel: false,
            per_job_timeout: Duration::from_secs(1800),
            keep_resources_on_failure: false,
            max_parallel: None,
            timeouts: StepTimeouts::default(),
            teardown_attempts: default_teardown_attempts(),
            grace_period: default_grace_period(),
        }
    }
}

impl PolicySettings {
    pub fn sequential() -> Self {
        Self::default()
    }

    pub fn parallel() -> Self {
        Self {
            parallel: true,
            ..Self::default()
        }
    }

    pub fn with_continue_on_error(mut self, continue_on_error: bool) -> Self {
        self.continue_on_error = continue_on_error;
        self
    }

    pub fn with_per_job_timeout(mut self, timeout: Duration) -> Self {
        self.per_job_timeout = timeout;
        self
    }

    pub fn with_keep_resources_on_failure(mut self, keep: bool) -> Self {
        self.keep_resources_on_failure = keep;
        self
    }

    pub fn with_max_parallel(mut self, max: usize) -> Self {
        self.max_parallel = Some(max);
        self
    }
}

pub mod duration_secs {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_secs())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_secs(u64::deserialize(deserializer)?))
    }
}

pub mod optional_duration_secs {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(
        value: &Option<Duration>,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        match value {
            Some(d) => serializer.serialize_some(&d.as_secs()),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Option<Duration>, D::Error> {
        Ok(Option::<u64>::deserialize(deserializer)?.map(Duration::from_secs))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_durations_serialize_as_seconds() {
        let policy = PolicySettings::default().with_per_job_timeout(Duration::from_secs(5));
        let json = serde_json::to_value(&policy).unwrap();
        assert_eq!(json["perJobTimeout"], 5);
        assert_eq!(json["timeouts"]["teardown"], 60);
        assert!(json["timeouts"].get("global").is_none());
    }
}

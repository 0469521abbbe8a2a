use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use crate::error::{Error, Result};

const ENV_OUTPUT_NAME: &str = "BENCHSINK_OUTPUT_NAME";
const ENV_REPORT_PERIOD_MS: &str = "BENCHSINK_REPORT_PERIOD_MS";
const ENV_REPORTER_BUFFER: &str = "BENCHSINK_REPORTER_BUFFER";
const ENV_DERIVATION_FAILURE_ACK: &str = "BENCHSINK_DERIVATION_FAILURE_ACK";

const DEFAULT_OUTPUT_NAME: &str = "bench";
const DEFAULT_REPORT_PERIOD_MS: u64 = 1000;
const DEFAULT_REPORTER_BUFFER: usize = 100;

/// What is sent back to the producer when a record could not be derived from a message.
///
/// Historically a failed derivation is still acknowledged as a success, so that is the default.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum DerivationFailureAck {
    #[default]
    Success,
    Failure,
}

impl FromStr for DerivationFailureAck {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "success" => Ok(DerivationFailureAck::Success),
            "failure" => Ok(DerivationFailureAck::Failure),
            other => Err(Error::Config(format!(
                "Invalid derivation failure ack {other:?}, expected \"success\" or \"failure\""
            ))),
        }
    }
}

impl fmt::Display for DerivationFailureAck {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DerivationFailureAck::Success => write!(f, "success"),
            DerivationFailureAck::Failure => write!(f, "failure"),
        }
    }
}

/// Configuration of a single output instance.
#[derive(Debug, Clone, PartialEq)]
pub struct OutputConfig {
    /// Used as the `output` label of every metric.
    pub name: String,
    /// Cadence at which the reporter publishes its summary.
    pub report_period: Duration,
    /// Capacity of the channel between the consume loop and the reporter.
    pub reporter_buffer: usize,
    pub derivation_failure_ack: DerivationFailureAck,
}

impl Default for OutputConfig {
    fn default() -> Self {
        OutputConfig {
            name: DEFAULT_OUTPUT_NAME.to_string(),
            report_period: Duration::from_millis(DEFAULT_REPORT_PERIOD_MS),
            reporter_buffer: DEFAULT_REPORTER_BUFFER,
            derivation_failure_ack: DerivationFailureAck::default(),
        }
    }
}

impl OutputConfig {
    /// Loads the config from the given environment variables, unset variables keep their defaults.
    pub fn load(
        env_vars: impl IntoIterator<Item = (impl Into<String>, impl Into<String>)>,
    ) -> Result<Self> {
        let env_vars: HashMap<String, String> = env_vars
            .into_iter()
            .map(|(key, val)| (key.into(), val.into()))
            .filter(|(key, _val)| {
                [
                    ENV_OUTPUT_NAME,
                    ENV_REPORT_PERIOD_MS,
                    ENV_REPORTER_BUFFER,
                    ENV_DERIVATION_FAILURE_ACK,
                ]
                .contains(&key.as_str())
            })
            .collect();

        let mut config = OutputConfig::default();

        if let Some(name) = env_vars.get(ENV_OUTPUT_NAME) {
            if name.is_empty() {
                return Err(Error::Config(format!("{ENV_OUTPUT_NAME} must not be empty")));
            }
            config.name = name.clone();
        }

        if let Some(period) = env_vars.get(ENV_REPORT_PERIOD_MS) {
            let period_ms: u64 = period.parse().map_err(|e| {
                Error::Config(format!("Failed to parse {ENV_REPORT_PERIOD_MS}: {e:?}"))
            })?;
            config.report_period = Duration::from_millis(period_ms);
        }

        if let Some(buffer) = env_vars.get(ENV_REPORTER_BUFFER) {
            config.reporter_buffer = buffer.parse().map_err(|e| {
                Error::Config(format!("Failed to parse {ENV_REPORTER_BUFFER}: {e:?}"))
            })?;
        }

        if let Some(ack) = env_vars.get(ENV_DERIVATION_FAILURE_ACK) {
            config.derivation_failure_ack = ack.parse()?;
        }

        config.validate()?;
        Ok(config)
    }

    /// Rejects values the output cannot run with, tokio panics on a zero interval or a zero
    /// capacity channel.
    pub fn validate(&self) -> Result<()> {
        if self.report_period.is_zero() {
            return Err(Error::Config("report period must be greater than 0".to_string()));
        }
        if self.reporter_buffer == 0 {
            return Err(Error::Config(
                "reporter buffer must be greater than 0".to_string(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_load_defaults() {
        let config = OutputConfig::load(Vec::<(String, String)>::new()).unwrap();
        assert_eq!(config, OutputConfig::default());
        assert_eq!(config.name, "bench");
        assert_eq!(config.report_period, Duration::from_secs(1));
        assert_eq!(config.reporter_buffer, 100);
        assert_eq!(config.derivation_failure_ack, DerivationFailureAck::Success);
    }

    #[test]
    fn test_load_from_env() {
        let env_vars = [
            (ENV_OUTPUT_NAME, "ingest"),
            (ENV_REPORT_PERIOD_MS, "250"),
            (ENV_REPORTER_BUFFER, "16"),
            (ENV_DERIVATION_FAILURE_ACK, "Failure"),
            ("SOME_OTHER_VAR", "ignored"),
        ];
        let config = OutputConfig::load(env_vars).unwrap();
        assert_eq!(config.name, "ingest");
        assert_eq!(config.report_period, Duration::from_millis(250));
        assert_eq!(config.reporter_buffer, 16);
        assert_eq!(config.derivation_failure_ack, DerivationFailureAck::Failure);
    }

    #[test]
    fn test_load_invalid_values() {
        let result = OutputConfig::load([(ENV_REPORT_PERIOD_MS, "soon")]);
        assert!(matches!(result, Err(Error::Config(_))));

        let result = OutputConfig::load([(ENV_REPORT_PERIOD_MS, "0")]);
        assert!(matches!(result, Err(Error::Config(_))));

        let result = OutputConfig::load([(ENV_REPORTER_BUFFER, "0")]);
        assert!(matches!(result, Err(Error::Config(_))));

        let result = OutputConfig::load([(ENV_DERIVATION_FAILURE_ACK, "maybe")]);
        assert!(matches!(result, Err(Error::Config(_))));

        let result = OutputConfig::load([(ENV_OUTPUT_NAME, "")]);
        assert!(matches!(result, Err(Error::Config(_))));
    }

    #[test]
    fn test_derivation_failure_ack_display_round_trip() {
        for ack in [DerivationFailureAck::Success, DerivationFailureAck::Failure] {
            assert_eq!(ack.to_string().parse::<DerivationFailureAck>().unwrap(), ack);
        }
    }
}

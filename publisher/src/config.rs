use std::str::FromStr;
use std::time;

use envconfig::Envconfig;

#[derive(Envconfig, Clone)]
pub struct Config {
    #[envconfig(default = "http://aggregator:8080/publish")]
    pub target_url: String,

    /// Pause between two sends.
    #[envconfig(default = "10")]
    pub delay: EnvMsDuration,

    /// Probability of replaying an already sent event instead of a new one.
    #[envconfig(default = "0.3")]
    pub duplication_rate: f64,

    #[envconfig(default = "20000")]
    pub max_events: u64,

    /// Number of sent events kept around as replay candidates.
    #[envconfig(default = "2000")]
    pub history_size: usize,

    /// Wait before the first send, giving the aggregator time to come up.
    #[envconfig(default = "5000")]
    pub startup_delay: EnvMsDuration,

    #[envconfig(default = "5000")]
    pub request_timeout: EnvMsDuration,

    #[envconfig(default = "1000")]
    pub error_backoff: EnvMsDuration,

    #[envconfig(default = "500")]
    pub progress_log_interval: u64,
}

#[derive(Debug, Clone, Copy)]
pub struct EnvMsDuration(pub time::Duration);

#[derive(Debug, PartialEq, Eq)]
pub struct ParseEnvMsDurationError;

impl FromStr for EnvMsDuration {
    type Err = ParseEnvMsDurationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let ms = s.parse::<u64>().map_err(|_| ParseEnvMsDurationError)?;

        Ok(EnvMsDuration(time::Duration::from_millis(ms)))
    }
}

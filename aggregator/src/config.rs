use std::num::NonZeroUsize;
use std::str::FromStr;
use std::time;

use envconfig::Envconfig;
use ingest_common::retry::StartupRetry;
use ingest_worker::worker::WorkerSettings;

#[derive(Envconfig, Clone)]
pub struct Config {
    #[envconfig(from = "BIND_HOST", default = "0.0.0.0")]
    pub host: String,

    #[envconfig(from = "BIND_PORT", default = "8080")]
    pub port: u16,

    pub database_url: NonEmptyString,

    #[envconfig(default = "redis://localhost:6379/0")]
    pub broker_url: NonEmptyString,

    #[envconfig(default = "events_queue")]
    pub queue_name: NonEmptyString,

    #[envconfig(default = "5")]
    pub worker_count: NonZeroUsize,

    #[envconfig(default = "1000")]
    pub pop_timeout: EnvMsDuration,

    #[envconfig(default = "1")]
    pub idle_delay: EnvMsDuration,

    #[envconfig(default = "1000")]
    pub error_backoff: EnvMsDuration,

    #[envconfig(default = "30000")]
    pub liveness_deadline: EnvMsDuration,

    #[envconfig(default = "5")]
    pub startup_retries: u32,

    #[envconfig(default = "3000")]
    pub startup_retry_delay: EnvMsDuration,

    #[envconfig(default = "10000")]
    pub shutdown_timeout: EnvMsDuration,

    #[envconfig(default = "10")]
    pub max_pg_connections: u32,

    #[envconfig(default = "5000")]
    pub pg_acquire_timeout: EnvMsDuration,

    #[envconfig(default = "1000000")]
    pub max_body_size: usize,

    #[envconfig(default = "1024")]
    pub max_concurrent_publishes: usize,

    #[envconfig(default = "500")]
    pub progress_log_interval: u64,
}

impl Config {
    /// Produce a host:port address for binding a TcpListener.
    pub fn bind(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn worker_settings(&self) -> WorkerSettings {
        WorkerSettings {
            pop_timeout: self.pop_timeout.0,
            idle_delay: self.idle_delay.0,
            error_backoff: self.error_backoff.0,
            progress_log_interval: self.progress_log_interval,
            liveness_deadline: self.liveness_deadline.0,
        }
    }

    pub fn startup_retry(&self) -> StartupRetry {
        StartupRetry::new(self.startup_retries, self.startup_retry_delay.0)
    }
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

#[derive(Debug, Clone)]
pub struct NonEmptyString(pub String);

impl NonEmptyString {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

#[derive(Debug, PartialEq, Eq)]
pub struct StringIsEmptyError;

impl FromStr for NonEmptyString {
    type Err = StringIsEmptyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.is_empty() {
            Err(StringIsEmptyError)
        } else {
            Ok(NonEmptyString(s.to_owned()))
        }
    }
}

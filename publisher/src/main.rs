//! Load generator: POST synthetic events to the aggregator, replaying some of them.
use std::time::Instant;

use envconfig::Envconfig;
use eyre::Result;
use rand::rngs::StdRng;
use rand::SeedableRng;
use tracing::level_filters::LevelFilter;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use publisher::config::Config;
use publisher::generator::EventGenerator;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::builder()
                .with_default_directive(LevelFilter::INFO.into())
                .from_env_lossy(),
        )
        .init();

    let config = Config::init_from_env()?;
    let client = reqwest::Client::builder()
        .timeout(config.request_timeout.0)
        .build()?;
    let mut generator = EventGenerator::new(
        StdRng::from_entropy(),
        config.duplication_rate,
        config.history_size,
    );

    info!(
        target_url = %config.target_url,
        max_events = config.max_events,
        delay = ?config.delay.0,
        duplication_rate = config.duplication_rate,
        "starting publisher"
    );
    tokio::time::sleep(config.startup_delay.0).await;

    let start = Instant::now();
    let mut sent: u64 = 0;
    let mut duplicates: u64 = 0;

    while sent < config.max_events {
        let (event, duplicate) = generator.next_event();

        let response = match client.post(&config.target_url).json(&event).send().await {
            Ok(response) => response,
            Err(error) => {
                error!("failed to publish event: {}", error);
                tokio::time::sleep(config.error_backoff.0).await;
                continue;
            }
        };

        let status = response.status();
        if !status.is_success() {
            warn!(event_id = %event.event_id, "aggregator answered {}", status);
        }
        if config.progress_log_interval > 0 && sent % config.progress_log_interval == 0 {
            info!("progress: {}/{} events sent (last: {})", sent, config.max_events, status);
        }

        sent += 1;
        if duplicate {
            duplicates += 1;
        }

        if !config.delay.0.is_zero() {
            tokio::time::sleep(config.delay.0).await;
        }
    }

    let elapsed = start.elapsed().as_secs_f64();
    let rate = if elapsed > 0.0 {
        sent as f64 / elapsed
    } else {
        0.0
    };
    info!(
        sent,
        duplicates,
        elapsed_seconds = %format!("{:.2}", elapsed),
        rate = %format!("{:.2}", rate),
        "done"
    );

    Ok(())
}

//! Synthetic traffic, with a share of deliberate replays to exercise deduplication.
use std::collections::VecDeque;

use chrono::Utc;
use ingest_common::event::NewEvent;
use rand::seq::SliceRandom;
use rand::Rng;
use serde_json::json;
use uuid::Uuid;

pub const TOPICS: [&str; 4] = ["order.created", "payment.success", "user.login", "sensor.read"];
pub const SOURCE: &str = "publisher-service-01";

pub struct EventGenerator<R: Rng> {
    rng: R,
    duplication_rate: f64,
    history: VecDeque<NewEvent>,
    history_size: usize,
}

impl<R: Rng> EventGenerator<R> {
    pub fn new(rng: R, duplication_rate: f64, history_size: usize) -> Self {
        Self {
            rng,
            duplication_rate: duplication_rate.clamp(0.0, 1.0),
            history: VecDeque::with_capacity(history_size),
            history_size: history_size.max(1),
        }
    }

    /// Next event to send, and whether it replays one sent before.
    pub fn next_event(&mut self) -> (NewEvent, bool) {
        if !self.history.is_empty() && self.rng.gen_bool(self.duplication_rate) {
            let index = self.rng.gen_range(0..self.history.len());
            return (self.history[index].clone(), true);
        }

        let event = self.fresh_event();
        self.history.push_back(event.clone());
        if self.history.len() > self.history_size {
            self.history.pop_front();
        }
        (event, false)
    }

    pub fn history_len(&self) -> usize {
        self.history.len()
    }

    fn fresh_event(&mut self) -> NewEvent {
        let topic = TOPICS.choose(&mut self.rng).unwrap_or(&TOPICS[0]);

        NewEvent {
            topic: (*topic).to_owned(),
            event_id: Uuid::new_v4().to_string(),
            // No offset: the aggregator reads naive timestamps as UTC.
            timestamp: Utc::now()
                .naive_utc()
                .format("%Y-%m-%dT%H:%M:%S%.6f")
                .to_string(),
            source: Some(SOURCE.to_owned()),
            payload: Some(json!({
                "amount": self.rng.gen_range(10..=1000),
                "user_id": self.rng.gen_range(1..=500),
            })),
        }
    }
}

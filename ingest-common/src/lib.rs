pub mod event;
pub mod health;
pub mod metrics;
pub mod queue;
pub mod retry;
pub mod stats;
pub mod store;

mod app;
mod events;
mod publish;
mod stats;

pub use app::{add_routes, AppState};

pub mod acceptor;
pub mod api;
pub mod handlers;

//! HTTP adapter: actix-web handlers and middleware wrapping the core engine.

pub mod handlers;
pub mod rate_limit;
pub mod request_id;

pub mod api;
pub mod audit;
pub mod cache;
pub mod config;
pub mod flag_definitions;
pub mod handlers;
pub mod invalidation;
pub mod prometheus;
pub mod redis;
pub mod rollout;
pub mod router;
pub mod server;
pub mod store;
pub mod test_utils;

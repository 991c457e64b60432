//! HTTP surface: admission, shard-channel upgrade, health

pub mod middleware;
pub mod routes;

pub use routes::build_router;

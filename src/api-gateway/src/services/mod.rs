//! Core services for the API Gateway

pub mod circuit_breaker;
pub mod events;
pub mod health;
pub mod metrics;
pub mod proxy;
pub mod rate_limiter;
pub mod registry;

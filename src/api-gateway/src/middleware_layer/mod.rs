//! Middleware modules for the API Gateway

pub mod rate_limit;
pub mod trace;

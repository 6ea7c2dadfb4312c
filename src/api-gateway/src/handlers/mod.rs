//! HTTP handlers for the API Gateway

pub mod gateway;
pub mod health;
pub mod proxy;

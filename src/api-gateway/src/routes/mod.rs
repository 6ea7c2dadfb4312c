//! Route tables for the API Gateway

pub mod public;

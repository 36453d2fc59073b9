//! Gatehouse - admission control and credential storage primitives
//!
//! This crate provides two independent building blocks for services that sit
//! behind a request-handling boundary:
//!
//! - rate limiting per identity key, with a token-bucket limiter (in-memory or
//!   shared through an external store) and an exact sliding-window limiter,
//!   both behind the [`ratelimit::AdmissionControl`] trait;
//! - an encrypted-at-rest credentials store with environment-variable
//!   override and an append-only access audit trail.

pub mod admission;
pub mod config;
pub mod credentials;
pub mod error;
pub mod ratelimit;

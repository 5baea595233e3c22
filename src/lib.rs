//! Gatekeeper - Per-Identity Admission Control
//!
//! This crate decides, per request, whether an identity (a user, API key or
//! client) may proceed under its configured rate. Decisions are made either
//! in-process (sliding-window log or leaky bucket) or against a shared Redis
//! store so that several processes enforce one global limit per identity.

pub mod config;
pub mod error;
pub mod grpc;
pub mod ratelimit;

//! Turnstile - Per-Caller Admission Control
//!
//! This crate implements an in-process rate limiter that decides, before any
//! expensive work starts, whether a request may proceed. Limits are counted
//! per caller and per normalized endpoint using fixed windows, and rejected
//! requests fail immediately with enough detail for the client to back off.

pub mod config;
pub mod error;
pub mod ratelimit;

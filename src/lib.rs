//! Floodgate - Multi-Window Rate Limiting and Request Pacing
//!
//! This crate implements an embeddable throttling engine for protecting
//! authentication flows, API endpoints, and outbound client traffic. Each
//! key is counted against layered fixed windows aligned to epoch time,
//! consecutive failures escalate an exponential backoff penalty, and a
//! co-operating pacer spaces scheduled request times to a target rate.
//! The engine never sleeps and never performs I/O: it reports decisions,
//! scheduled times, and delays, and the caller acts on them.

pub mod cache;
pub mod config;
pub mod error;
pub mod throttle;

//! Gatekeeper - Multi-Tier Rate Limiting and Abuse Detection
//!
//! This crate limits API traffic per organization, user, session and client
//! IP at once, keeps counting through shared-store outages by falling back to
//! in-process counters, and classifies repeatedly blocked callers into abuse
//! risk levels. It plugs into axum as a middleware layer.

pub mod abuse;
pub mod config;
pub mod error;
pub mod events;
pub mod http;
pub mod ratelimit;
pub mod service;
pub mod store;

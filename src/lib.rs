//! Tenant Limiter - Tenant-Aware Rate Limiting Service
//!
//! This crate implements a multi-tenant sliding-window rate limiter. Limits
//! are resolved per request from a rule hierarchy (user, organisation,
//! industry, subscription plan, global), counters live in Redis and are
//! namespaced per tenant, and administrators can temporarily bypass
//! enforcement for a tenant. Store failures fail open by default.

pub mod config;
pub mod error;
pub mod http;
pub mod ratelimit;
pub mod store;

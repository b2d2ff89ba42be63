//! Operational surfaces: Prometheus metrics and liveness.

pub mod health;

//! Strata HTTP API.
//!
//! Exposes the bank account example over axum: the generic command
//! endpoint, rehydrated and projected account reads, saga inspection and
//! projection rebuilds. `main` wires the PostgreSQL stores and starts the
//! projector and saga reactor alongside the server.

pub mod config;
pub mod error;
pub mod routes;
pub mod state;
pub mod telemetry;

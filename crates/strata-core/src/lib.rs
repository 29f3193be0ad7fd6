//! Strata Core: shared event-sourcing abstractions.
//!
//! This crate defines the traits and types every bounded context and every
//! storage backend depends on: the event store contract, the versioned
//! document codec, the migration engine, aggregate rehydration, read-model
//! projection and saga coordination. It contains no database code.

pub mod aggregate;
pub mod bus;
pub mod clock;
pub mod codec;
pub mod command;
pub mod error;
pub mod event;
pub mod migration;
pub mod projection;
pub mod registry;
pub mod rehydrate;
pub mod repository;
pub mod saga;
pub mod snapshot;

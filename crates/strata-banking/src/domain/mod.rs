//! Domain layer: aggregates, commands, events and their schema history.

pub mod aggregates;
pub mod commands;
pub mod events;
pub mod schema;

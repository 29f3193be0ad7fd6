//! Application layer: command and query handlers, the command dispatcher,
//! the read-model projections and the transfer saga.

pub mod command_handlers;
pub mod dispatcher;
pub mod projections;
pub mod query_handlers;
pub mod transaction_history;
pub mod transfer_saga;

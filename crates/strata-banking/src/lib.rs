//! Strata Bank Account bounded context.
//!
//! Accounts, deposits, withdrawals and transfers between accounts. Built on
//! `strata-core`: accounts are event-sourced aggregates, balances are served
//! from the `account_summary` read model and transfers run as sagas.

pub mod application;
pub mod domain;

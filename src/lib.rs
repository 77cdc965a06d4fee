//! Leasegate: the trust-and-access layer in front of tool execution.
//!
//! Every call passes through budgeted leases, governance policy, scoped
//! elevations with human approval, and HMAC-signed capability tokens before
//! the operation runs. All authorization state lives in a shared [`store`]
//! so every instance enforces the same budgets, and any failure to reach
//! that store is a denial.
//!
//! The entry point is [`dispatcher::Dispatcher`]; tool schemas are exposed
//! only through [`schema_gate::SchemaGate`].

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod audit;
pub mod config;
pub mod error;
pub mod logging;
pub mod registry;
pub mod store;

pub mod governance;
pub mod lease;
pub mod policy;
pub mod token;

pub mod dispatcher;
pub mod schema_gate;

//! Executor for bridge duties.
//!
//! [`operator::BridgeOperator`] builds the covenant transactions of the deposit and withdrawal
//! paths. [`driver::Driver`] decides when to build them, folding chain and L2 events into an
//! [`state::OperatorState`].

pub mod config;
pub mod driver;
pub mod errors;
pub mod index;
pub mod operator;
pub mod policy;
pub mod state;

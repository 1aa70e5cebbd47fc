//! Self-certifying spends of covenant outputs.
//!
//! Before a covenant output is spent, the state the operator believes it holds is checked against
//! raw chain data: the creating transaction is fetched, rebuilt in its covenant form and rehashed
//! with the covenant id function. For internal aggregator nodes the two ancestor transactions are
//! verified the same way, which is what the aggregator script itself demands. The offchain index is
//! never trusted on its own.

pub mod errors;
pub mod verifier;

pub use errors::{BacktraceError, BacktraceResult};
pub use verifier::{verify_provenance, AggregatorTrace, Backtracer};

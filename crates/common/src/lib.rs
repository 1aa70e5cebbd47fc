//! Crate includes reusable utils for services that handle common behavior.
//! Such as initializing the tracing framework, reading settings from the environment and retrying
//! reads against flaky collaborators.

pub mod env;
pub mod logging;
pub mod retry;

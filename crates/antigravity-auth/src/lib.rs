//! Google Antigravity / Code Assist authentication library
//!
//! Provides the token refresher and account liveness probes for the
//! Antigravity credential pool. This crate is a standalone protocol leaf
//! with no dependency on the pool — it can be tested and used independently.
//!
//! Token flow:
//! 1. The OAuth login collaborator produces `refresh/access/projectId` tuples
//! 2. The pool calls [`TokenRefresher::refresh`] lazily when a stored access
//!    token is missing or expired
//! 3. The "test" operation calls [`LivenessProbe::probe`] to classify
//!    whether an account's token is actually accepted upstream

pub mod constants;
pub mod probe;
pub mod token;

pub use constants::*;
pub use probe::{LivenessProbe, ProbeOutcome};
pub use token::{REFRESH_TIMEOUT, RefreshedToken, TokenRefresher};

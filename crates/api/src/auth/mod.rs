//! Authentication module for LiveDesk
//!
//! Token issuance lives in the external login surface; the dispatch core
//! verifies bearer tokens and completes the allowlist check against the
//! agent table.

pub mod jwt;

pub use jwt::{AgentClaims, JwtError, JwtManager};

//! Docker Registry v2 plumbing: bearer-token negotiation, repository and
//! tag queries, the TTL query cache and the default HTTP Copier.

pub mod auth;
pub mod cache;
pub mod client;
pub mod copier;

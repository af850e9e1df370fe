//! image-relay
//!
//! `image-relay` is a container-image replication service. Given a source
//! reference and one or more target references (each with optional
//! registry credentials), it copies the image — manifest list and all
//! referenced blobs — to every target, with bounded concurrency,
//! per-attempt retries and deadlines, fail-fast cancellation, durable
//! task state and live progress events. It also keeps a local cache of
//! uploaded image archives, rewritten into OCI content-addressed
//! layouts so they can serve as sync sources via `archive://` refs.
//!
//! ## Main Modules
//! - [`sync`] - Sync task orchestration: planning, workers, retries, cancellation.
//! - [`archive`] - Archive intake: docker-save tarballs to OCI layouts, merge, resolve.
//! - [`pipes`] - Versioned pipe documents with optimistic concurrency and an op log.
//! - [`registry`] - Registry v2 auth, catalog/tag queries, the default Copier.
//! - [`credentials`] - Credential registry with masked-secret gating.
//! - [`events`] - In-process event fan-out and wire frames.
//! - [`server`] - HTTP API and WebSocket event channel.

pub mod archive;
pub mod config;
pub mod credentials;
pub mod error;
pub mod events;
pub mod fsutil;
pub mod pipes;
pub mod refs;
pub mod registry;
pub mod server;
pub mod sync;

pub use config::AppConfig;
pub use error::{AppError, Result};

//! Optimistic mutation and realtime reconciliation for storefront resources.
//!
//! Each resource (delivery zones, payment methods, banners, ...) is held in
//! a [`core::cache::ResourceCache`] owned by a single runtime task. Writes
//! are applied locally first and rolled back field by field when the
//! [`gateway::RemoteStore`] rejects them; pushed changes are merged as they
//! arrive.
//!
//! # Examples
//!
//! Synchronous core, no runtime:
//! ```
//! use std::sync::Arc;
//!
//! use serde_json::json;
//! use storesync::{
//!     core::{cache::ResourceCache, executor::MutationExecutor},
//!     error::GatewayError,
//!     schema::catalog,
//! };
//!
//! let schema = Arc::new(catalog::delivery_zones());
//! let mut cache = ResourceCache::new(schema.order_by.clone());
//! let zone = schema
//!     .ingest_value(&json!({"id": "z1", "name": "Centro", "is_active": true}))
//!     .unwrap();
//! cache.load(vec![zone]);
//!
//! let mut executor = MutationExecutor::new(Arc::clone(&schema));
//! let id = "z1".into();
//! let pending = executor.begin_toggle(&mut cache, &id, "is_active").unwrap();
//! assert!(!cache.get(&id).unwrap().flag("is_active"));
//!
//! executor.settle(&mut cache, pending.seq, Err(GatewayError::Transient("timeout".into())));
//! assert!(cache.get(&id).unwrap().flag("is_active"));
//! ```
//!
//! Runtime over the in-memory gateway:
//! ```no_run
//! use std::sync::Arc;
//!
//! use serde_json::json;
//! use storesync::{
//!     config::EngineConfig,
//!     gateway::{EventScope, memory::MemoryGateway},
//!     runtime::handle::spawn_resource,
//!     schema::catalog,
//! };
//!
//! # #[tokio::main]
//! # async fn main() {
//! let gateway = Arc::new(MemoryGateway::new());
//! gateway.seed("delivery_zones", [json!({"id": "z1", "name": "Centro", "is_active": true})]);
//!
//! let zones = spawn_resource(gateway, catalog::delivery_zones(), &EngineConfig::default());
//! zones.load().await.expect("load");
//! zones.track(EventScope::All).await.expect("track");
//! let active = zones.toggle("z1".into(), "is_active").await.expect("toggle");
//! assert!(!active);
//! zones.shutdown().await.expect("shutdown");
//! # }
//! ```

/// Engine configuration.
pub mod config;
/// Resource cache and mutation executor.
pub mod core;
/// Entities and field patches.
pub mod entity;
/// Error types.
pub mod error;
/// Remote store contract and reference gateways.
pub mod gateway;
/// Paginated log reader.
pub mod log;
/// Mutation intents, remote writes and optimistic snapshots.
pub mod op;
/// Realtime subscription state and merging.
pub mod realtime;
/// Per-resource runtime handle and events.
pub mod runtime;
/// Resource schemas and the storefront catalog.
pub mod schema;
/// Shared primitive types.
pub mod types;

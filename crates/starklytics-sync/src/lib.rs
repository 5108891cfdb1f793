// SPDX-License-Identifier: GPL-3.0

//! Resilient realtime data synchronization for Starklytics dashboards.
//!
//! A [`SyncSession`] keeps named resource collections (blocks, transactions, hackathons,
//! notifications, ...) in sync with a hosted Postgres backend: it probes the backend, loads
//! every collection concurrently, applies pushed row changes in place and falls back to a
//! silent periodic refresh that backs off while the backend misbehaves.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                          SyncSession                            │
//! │   state machine · snapshot watch · lifecycle guard · scheduler  │
//! └─────────────────────────────────────────────────────────────────┘
//!                                 │
//!                                 ▼
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                   SyncContext (one per process)                 │
//! │  ┌──────────────┐ ┌──────────────────┐ ┌─────────────────────┐  │
//! │  │ConnectionProbe│ │SchemaBootstrapper│ │  ChangeSubscriber   │  │
//! │  │              │ │  (single-flight) │ │ (monotonic channels)│  │
//! │  └──────────────┘ └──────────────────┘ └─────────────────────┘  │
//! │              DataFetcher (per session, settle-all)              │
//! └─────────────────────────────────────────────────────────────────┘
//!                                 │
//!                                 ▼
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                        dyn Backend                              │
//! │  ┌──────────────────────────────┐  ┌────────────────────────┐   │
//! │  │ RestBackend (REST + realtime │  │ MemoryBackend (tests)  │   │
//! │  │        websocket)            │  │                        │   │
//! │  └──────────────────────────────┘  └────────────────────────┘   │
//! └─────────────────────────────────────────────────────────────────┘
//! ```

pub mod backend;
mod bootstrap;
mod collection;
mod context;
pub mod error;
mod fetcher;
mod lifecycle;
pub mod models;
mod options;
pub mod presets;
mod probe;
mod scheduler;
mod schema;
mod session;
mod strings;
mod subscriber;

pub use backend::{
	Backend, ChangeEvent, ChangeKind, ChangeStream, ChannelSpec, Filter, FilterOp, Order,
	SelectQuery, realtime::RealtimeClient, rest::RestBackend,
};
pub use bootstrap::{BootstrapOutcome, SchemaBootstrapper};
pub use collection::{ResourceCollection, ResourceSpec};
pub use context::SyncContext;
pub use error::{BackendError, ConfigError, FetchError, SessionError};
pub use fetcher::{DataFetcher, FetchResults};
pub use lifecycle::LifecycleGuard;
pub use options::{
	DEFAULT_HEARTBEAT_INTERVAL, DEFAULT_MAX_CONCURRENT_REQUESTS, DEFAULT_MAX_REFRESH_INTERVAL,
	DEFAULT_REFRESH_INTERVAL, SyncOptions,
};
pub use probe::{ConnectionProbe, ConnectionStatus, SetupStep};
pub use scheduler::{RefreshScheduler, Tick};
pub use schema::SchemaSpec;
pub use session::{SessionSnapshot, SessionState, SyncSession};
pub use starklytics_common::{BackendConfig, RetryPolicy, RetryState, Status};
pub use subscriber::{ChangeSubscriber, SubscriptionHandle};

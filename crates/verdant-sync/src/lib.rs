//! Real-time state synchronization for the Verdant plant-care dashboard.
//!
//! This crate keeps a client's view of care tasks, plant health and the
//! community feed consistent with the server's, using a persistent push
//! channel for live events and the REST API for hydration and mutations.
//!
//! ## Components
//!
//! - **Connection**: one authenticated push channel with reconnect and backoff
//! - **Registry**: reference-counted topic subscriptions replayed on reconnect
//! - **Dispatch**: typed event routing with RAII handler guards
//! - **Caches**: timestamp-gated per-domain caches with optimistic updates
//! - **Stats**: dashboard statistics derived from the caches
//! - **REST**: typed client for the versioned REST API
//! - **Client**: [`SyncClient`], the composition root wiring the parts together

pub mod cache;
mod client;
pub mod community;
mod config;
pub mod connection;
pub mod dispatch;
mod error;
pub mod event;
pub mod health;
pub mod protocol;
pub mod registry;
mod rest;
pub mod stats;
pub mod tasks;
mod topic;
mod types;

pub use cache::{CacheChange, CacheEntry, CachedEntry, ChangeKind, DomainCache, MergeOutcome, OptimisticToken};
pub use client::{SyncClient, SyncScope};
pub use community::CommunityCache;
pub use config::{SyncConfig, SyncConfigBuilder};
pub use connection::{
    ConnectionManager, ConnectionState, ConnectionStatus, Inbound, Transport,
    TransportConnection, WebSocketTransport,
};
pub use dispatch::{DispatchStats, EventDispatcher, HandlerGuard};
pub use error::SyncError;
pub use event::{Event, EventBody, EventError, EventTag};
pub use health::HealthCache;
pub use protocol::{ClientMessage, ServerFrame};
pub use registry::SubscriptionRegistry;
pub use rest::RestClient;
pub use stats::{Aggregator, CommunityStats, DashboardStats, HealthStats, TaskStats};
pub use tasks::TaskCache;
pub use topic::{Topic, TopicError};
pub use types::*;

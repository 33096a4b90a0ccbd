//! Composition root.
//!
//! [`SyncClient`] owns every component of the sync layer and wires pushed
//! events into the caches. Nothing here is process-global: two clients in one
//! process are fully independent.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::{debug, info, trace, warn};

use crate::cache::{CacheEntry, MergeOutcome, OptimisticToken};
use crate::community::CommunityCache;
use crate::config::SyncConfig;
use crate::connection::{ConnectionManager, Transport, WebSocketTransport};
use crate::dispatch::{EventDispatcher, HandlerGuard};
use crate::error::SyncError;
use crate::event::{Event, EventTag};
use crate::health::HealthCache;
use crate::registry::SubscriptionRegistry;
use crate::rest::RestClient;
use crate::stats::{Aggregator, DashboardStats};
use crate::tasks::{TaskCache, mark_completed, mark_snoozed};
use crate::topic::Topic;
use crate::types::{
    CareTask, Comment, CommunityPost, Credentials, Envelope, LikeChange, NewCareTask, NewPost,
    PlantHealthRecord, TaskPatch,
};

/// A client session: push channel, caches and REST access for one user.
pub struct SyncClient {
    config: SyncConfig,
    credentials: Credentials,
    dispatcher: EventDispatcher,
    registry: Arc<SubscriptionRegistry>,
    connection: ConnectionManager,
    tasks: Arc<TaskCache>,
    health: Arc<HealthCache>,
    community: Arc<CommunityCache>,
    aggregator: Aggregator,
    rest: RestClient,
    _cache_handlers: Vec<HandlerGuard>,
}

impl SyncClient {
    /// Build a client that connects over WebSocket.
    pub fn new(config: SyncConfig, credentials: Credentials) -> Result<Self, SyncError> {
        Self::with_transport(config, credentials, Arc::new(WebSocketTransport))
    }

    /// Build a client over a custom transport.
    pub fn with_transport(
        config: SyncConfig,
        credentials: Credentials,
        transport: Arc<dyn Transport>,
    ) -> Result<Self, SyncError> {
        config.validate()?;

        let dispatcher = EventDispatcher::new();
        let registry = Arc::new(SubscriptionRegistry::new());
        let connection = ConnectionManager::with_transport(
            config.clone(),
            transport,
            dispatcher.clone(),
            Arc::clone(&registry),
        );

        let capacity = config.broadcast_capacity;
        let tasks = Arc::new(TaskCache::with_capacity(capacity));
        let health = Arc::new(HealthCache::with_capacity(capacity));
        let community = Arc::new(CommunityCache::with_capacity(
            credentials.user_id.clone(),
            capacity,
        ));
        let aggregator = Aggregator::new(
            Arc::clone(&tasks),
            Arc::clone(&health),
            Arc::clone(&community),
        );
        let rest = RestClient::new(&config, credentials.clone())?;

        let cache_handlers = install_cache_handlers(&dispatcher, &tasks, &health, &community);
        debug!(handlers = cache_handlers.len(), "installed cache handlers");

        Ok(Self {
            config,
            credentials,
            dispatcher,
            registry,
            connection,
            tasks,
            health,
            community,
            aggregator,
            rest,
            _cache_handlers: cache_handlers,
        })
    }

    // =========================================================================
    // Connection
    // =========================================================================

    /// Start the connection loop. No-op if it is already running.
    pub fn connect(&self) -> bool {
        self.connection.connect(self.credentials.clone())
    }

    /// Wait until the push channel is ready.
    pub async fn wait_ready(&self, timeout: Duration) -> Result<(), SyncError> {
        self.connection.wait_ready(timeout).await
    }

    /// Tear down the push channel.
    pub async fn shutdown(&self) {
        self.connection.shutdown().await;
    }

    /// A scope whose subscriptions and handlers are released on drop.
    pub fn scope(&self) -> SyncScope {
        SyncScope {
            dispatcher: self.dispatcher.clone(),
            registry: Arc::clone(&self.registry),
            guards: Vec::new(),
            topics: Vec::new(),
        }
    }

    // =========================================================================
    // Hydration
    // =========================================================================

    /// Load the task list over REST. Returns the number of entries changed.
    pub async fn hydrate_tasks(&self) -> Result<usize, SyncError> {
        let response = self.rest.list_tasks().await?;
        let changed = response
            .data
            .into_iter()
            .filter(|task| {
                self.tasks
                    .apply_create(task.clone(), response.version)
                    .changed()
            })
            .count();
        let pruned = self.tasks.advance_floor(response.version);
        info!(changed, pruned, version = %response.version, "hydrated care tasks");
        Ok(changed)
    }

    /// Load the community feed over REST. Returns the number of posts changed.
    pub async fn hydrate_posts(&self) -> Result<usize, SyncError> {
        let response = self.rest.list_posts().await?;
        let changed = response
            .data
            .into_iter()
            .filter(|post| {
                self.community
                    .store_post(post.clone(), response.version)
                    .changed()
            })
            .count();
        let pruned = self.community.posts().advance_floor(response.version);
        info!(changed, pruned, version = %response.version, "hydrated community posts");
        Ok(changed)
    }

    // =========================================================================
    // Optimistic mutations
    // =========================================================================

    /// Complete a task. The cache shows it completed immediately and is
    /// rolled back if the server rejects the request.
    pub async fn complete_task(&self, id: &str) -> Result<CareTask, SyncError> {
        let now = Utc::now();
        let token = self.tasks.apply_optimistic(id, move |t| mark_completed(t, now));
        let result = self.rest.complete_task(id).await;
        self.settle_task(token, result)
    }

    /// Snooze a task until `until`, optimistically.
    pub async fn snooze_task(
        &self,
        id: &str,
        until: DateTime<Utc>,
    ) -> Result<CareTask, SyncError> {
        let token = self.tasks.apply_optimistic(id, move |t| mark_snoozed(t, until));
        let result = self.rest.snooze_task(id, until).await;
        self.settle_task(token, result)
    }

    /// Patch a task, optimistically.
    pub async fn update_task(&self, id: &str, patch: TaskPatch) -> Result<CareTask, SyncError> {
        let local = patch.clone();
        let token = self.tasks.apply_optimistic(id, move |t| t.apply_patch(&local));
        let result = self.rest.update_task(id, &patch).await;
        self.settle_task(token, result)
    }

    /// Apply the server's answer to an optimistic task mutation, or undo it.
    fn settle_task(
        &self,
        token: Option<OptimisticToken<CareTask>>,
        result: Result<Envelope<CareTask>, SyncError>,
    ) -> Result<CareTask, SyncError> {
        let tasks = &self.tasks;
        match result {
            Ok(response) => {
                let outcome = tasks.apply_create(response.data.clone(), response.version);
                trace!(id = %response.data.id, ?outcome, "applied confirmed task");
                Ok(response.data)
            }
            Err(e) => {
                if let Some(token) = token {
                    let id = token.id().to_string();
                    let restored = tasks.rollback(token);
                    warn!(id = %id, restored, error = %e, "task mutation rejected");
                }
                Err(e)
            }
        }
    }

    /// Like a post as the current user, optimistically.
    pub async fn like_post(&self, id: &str) -> Result<LikeChange, SyncError> {
        self.set_like(id, true).await
    }

    /// Remove the current user's like, optimistically.
    pub async fn unlike_post(&self, id: &str) -> Result<LikeChange, SyncError> {
        self.set_like(id, false).await
    }

    async fn set_like(&self, id: &str, liked: bool) -> Result<LikeChange, SyncError> {
        let token = self.community.like_optimistic(id, liked);
        let result = if liked {
            self.rest.like_post(id).await
        } else {
            self.rest.unlike_post(id).await
        };

        match result {
            Ok(response) => {
                self.community
                    .apply_like(&response.data, liked, response.version);
                Ok(response.data)
            }
            Err(e) => {
                if let Some(token) = token {
                    let restored = self.community.posts().rollback(token);
                    warn!(post_id = %id, liked, restored, error = %e, "like rejected");
                }
                Err(e)
            }
        }
    }

    // =========================================================================
    // Confirmed mutations
    // =========================================================================

    pub async fn create_task(&self, task: &NewCareTask) -> Result<CareTask, SyncError> {
        let response = self.rest.create_task(task).await?;
        self.tasks
            .apply_create(response.data.clone(), response.version);
        Ok(response.data)
    }

    pub async fn delete_task(&self, id: &str) -> Result<MergeOutcome, SyncError> {
        let response = self.rest.delete_task(id).await?;
        Ok(self.tasks.apply_delete_at(id, response.version))
    }

    pub async fn create_post(&self, post: &NewPost) -> Result<CommunityPost, SyncError> {
        let response = self.rest.create_post(post).await?;
        self.community
            .store_post(response.data.clone(), response.version);
        Ok(response.data)
    }

    pub async fn delete_post(&self, id: &str) -> Result<MergeOutcome, SyncError> {
        let response = self.rest.delete_post(id).await?;
        Ok(self.community.delete_post(id, response.version))
    }

    pub async fn add_comment(&self, post_id: &str, content: &str) -> Result<Comment, SyncError> {
        let response = self.rest.add_comment(post_id, content).await?;
        self.community
            .add_comment(response.data.clone(), response.version);
        Ok(response.data)
    }

    /// Ask the server to run a health check. The result usually arrives
    /// later as a `health:check:complete` event.
    pub async fn trigger_health_check(
        &self,
        plant_id: &str,
    ) -> Result<PlantHealthRecord, SyncError> {
        let response = self.rest.trigger_health_check(plant_id).await?;
        self.health
            .complete_check(response.data.clone(), response.version);
        Ok(response.data)
    }

    // =========================================================================
    // Accessors
    // =========================================================================

    /// Current dashboard stats.
    pub fn stats(&self) -> DashboardStats {
        self.aggregator.stats()
    }

    pub fn aggregator(&self) -> &Aggregator {
        &self.aggregator
    }

    pub fn tasks(&self) -> &Arc<TaskCache> {
        &self.tasks
    }

    pub fn health(&self) -> &Arc<HealthCache> {
        &self.health
    }

    pub fn community(&self) -> &Arc<CommunityCache> {
        &self.community
    }

    pub fn connection(&self) -> &ConnectionManager {
        &self.connection
    }

    pub fn dispatcher(&self) -> &EventDispatcher {
        &self.dispatcher
    }

    pub fn registry(&self) -> &Arc<SubscriptionRegistry> {
        &self.registry
    }

    pub fn rest(&self) -> &RestClient {
        &self.rest
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    pub fn user_id(&self) -> &str {
        &self.credentials.user_id
    }
}

/// Whether any cache consumes events with this tag.
fn routes_to_cache(tag: EventTag) -> bool {
    tag.feeds_cache() || matches!(tag, EventTag::UserOnline | EventTag::UserOffline)
}

fn install_cache_handlers(
    dispatcher: &EventDispatcher,
    tasks: &Arc<TaskCache>,
    health: &Arc<HealthCache>,
    community: &Arc<CommunityCache>,
) -> Vec<HandlerGuard> {
    EventTag::ALL
        .iter()
        .copied()
        .filter(|tag| routes_to_cache(*tag))
        .map(|tag| {
            let tasks = Arc::clone(tasks);
            let health = Arc::clone(health);
            let community = Arc::clone(community);
            dispatcher.on(tag, move |event: &Event| {
                let outcomes = [
                    tasks.apply_event(event),
                    health.apply_event(event),
                    community.apply_event(event),
                ];
                trace!(tag = %event.tag(), ts = %event.timestamp, ?outcomes, "merged event");
            })
        })
        .collect()
}

/// Subscriptions and handlers held on behalf of one consumer.
///
/// Dropping the scope (or calling [`SyncScope::close`]) unregisters every
/// handler it registered and releases its topic references.
pub struct SyncScope {
    dispatcher: EventDispatcher,
    registry: Arc<SubscriptionRegistry>,
    guards: Vec<HandlerGuard>,
    topics: Vec<Topic>,
}

impl SyncScope {
    /// Want a topic for as long as this scope lives.
    pub fn subscribe(&mut self, topic: Topic, params: Option<serde_json::Value>) -> bool {
        let sent = self.registry.subscribe(topic.clone(), params);
        self.topics.push(topic);
        sent
    }

    /// Register a handler for as long as this scope lives.
    pub fn on<F>(&mut self, tag: EventTag, handler: F)
    where
        F: Fn(&Event) + Send + Sync + 'static,
    {
        self.guards.push(self.dispatcher.on(tag, handler));
    }

    /// Topics this scope holds, in subscription order.
    pub fn topics(&self) -> &[Topic] {
        &self.topics
    }

    pub fn handler_count(&self) -> usize {
        self.guards.len()
    }

    /// Release everything now.
    pub fn close(self) {}
}

impl Drop for SyncScope {
    fn drop(&mut self) {
        self.guards.clear();
        for topic in self.topics.drain(..) {
            self.registry.unsubscribe(&topic);
        }
    }
}

impl std::fmt::Debug for SyncScope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncScope")
            .field("topics", &self.topics)
            .field("handlers", &self.guards.len())
            .finish()
    }
}

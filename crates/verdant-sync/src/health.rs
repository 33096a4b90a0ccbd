//! Plant health cache. One record per plant, keyed by plant id.

use std::ops::Deref;

use crate::cache::{CacheEntry, DomainCache, MergeOutcome};
use crate::event::{Event, EventBody, HealthStatusChange};
use crate::types::{HealthPatch, HealthStatus, PlantHealthRecord, Timestamp};

impl CacheEntry for PlantHealthRecord {
    type Patch = HealthPatch;
    const KIND: &'static str = "plant-health";

    fn id(&self) -> &str {
        &self.plant_id
    }

    fn apply_patch(&mut self, patch: &HealthPatch) {
        if let Some(status) = patch.status {
            self.status = status;
        }
        if let Some(score) = patch.health_score {
            self.health_score = Some(score.min(100));
        }
    }

    /// A status change is enough to start tracking a plant.
    fn from_patch(id: &str, patch: &HealthPatch) -> Option<Self> {
        patch.status?;
        let mut record = PlantHealthRecord::new(id);
        record.apply_patch(patch);
        Some(record)
    }
}

impl HealthStatus {
    /// Whether the status calls for the user's attention.
    pub fn needs_attention(self) -> bool {
        matches!(self, HealthStatus::NeedsAttention | HealthStatus::Critical)
    }
}

/// Cache of plant health records.
#[derive(Default)]
pub struct HealthCache {
    cache: DomainCache<PlantHealthRecord>,
}

impl Deref for HealthCache {
    type Target = DomainCache<PlantHealthRecord>;

    fn deref(&self) -> &Self::Target {
        &self.cache
    }
}

impl HealthCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            cache: DomainCache::with_capacity(capacity),
        }
    }

    /// Merge a pushed event. Returns `None` for events this cache ignores.
    pub fn apply_event(&self, event: &Event) -> Option<MergeOutcome> {
        let ts = event.timestamp;
        let outcome = match &event.body {
            EventBody::HealthCheckStarted { plant_id } => self.start_check(plant_id, ts),
            EventBody::HealthCheckCompleted(record) => self.complete_check(record.clone(), ts),
            EventBody::HealthStatusUpdated(change) => self.update_status(change, ts),
            EventBody::PlantDeleted { plant_id } => self.cache.apply_delete_at(plant_id, ts),
            _ => return None,
        };
        Some(outcome)
    }

    /// Record that a health check is running for a plant.
    pub fn start_check(&self, plant_id: &str, ts: Timestamp) -> MergeOutcome {
        let patch = HealthPatch {
            status: Some(HealthStatus::Checking),
            health_score: None,
        };
        self.cache.apply_update(plant_id, &patch, ts)
    }

    /// Store the result of a finished health check.
    pub fn complete_check(&self, record: PlantHealthRecord, ts: Timestamp) -> MergeOutcome {
        self.cache.apply_create(record, ts)
    }

    /// Apply a status change pushed outside of a full check.
    pub fn update_status(&self, change: &HealthStatusChange, ts: Timestamp) -> MergeOutcome {
        let patch = HealthPatch {
            status: Some(change.status),
            health_score: change.health_score,
        };
        self.cache.apply_update(&change.plant_id, &patch, ts)
    }

    /// Current status of a plant; `Unknown` when untracked.
    pub fn status_of(&self, plant_id: &str) -> HealthStatus {
        self.cache
            .get(plant_id)
            .map(|r| r.status)
            .unwrap_or_default()
    }

    /// Plants whose status needs attention, most severe first.
    pub fn needing_attention(&self) -> Vec<PlantHealthRecord> {
        let mut records = self.cache.list_where(|r| r.status.needs_attention());
        records.sort_by_key(|r| (r.status != HealthStatus::Critical, r.health_score));
        records
    }

    /// Average health score over plants that have one.
    pub fn average_score(&self) -> Option<f64> {
        let mut sum = 0u64;
        let mut count = 0u64;
        self.cache.for_each(|r| {
            if let Some(score) = r.health_score {
                sum += u64::from(score);
                count += 1;
            }
        });
        (count > 0).then(|| sum as f64 / count as f64)
    }
}

//! Dashboard statistics derived from the caches.
//!
//! Stats are recomputed from cache contents on every read. Nothing is
//! memoized, so a stat can never disagree with the cache it describes.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::community::CommunityCache;
use crate::health::HealthCache;
use crate::tasks::TaskCache;
use crate::types::HealthStatus;

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskStats {
    pub total: usize,
    pub completed: usize,
    pub pending: usize,
    pub overdue: usize,
    pub due_today: usize,
    pub snoozed: usize,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthStats {
    pub tracked: usize,
    pub healthy: usize,
    pub needs_attention: usize,
    pub critical: usize,
    pub checking: usize,
    pub average_score: Option<f64>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CommunityStats {
    pub posts: usize,
    pub comments: usize,
    pub total_likes: u64,
    pub liked_by_me: usize,
    pub users_online: usize,
}

/// Summary shown on the dashboard.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DashboardStats {
    pub tasks: TaskStats,
    pub health: HealthStats,
    pub community: CommunityStats,
    pub computed_at: DateTime<Utc>,
}

/// Read-only view computing [`DashboardStats`] over shared caches.
#[derive(Clone)]
pub struct Aggregator {
    tasks: Arc<TaskCache>,
    health: Arc<HealthCache>,
    community: Arc<CommunityCache>,
}

impl Aggregator {
    pub fn new(
        tasks: Arc<TaskCache>,
        health: Arc<HealthCache>,
        community: Arc<CommunityCache>,
    ) -> Self {
        Self {
            tasks,
            health,
            community,
        }
    }

    /// Stats as of the current wall-clock time.
    pub fn stats(&self) -> DashboardStats {
        self.stats_at(Utc::now())
    }

    /// Stats as of `now`. Overdue, due-today and snoozed depend on it.
    pub fn stats_at(&self, now: DateTime<Utc>) -> DashboardStats {
        DashboardStats {
            tasks: self.task_stats(now),
            health: self.health_stats(),
            community: self.community_stats(),
            computed_at: now,
        }
    }

    pub fn task_stats(&self, now: DateTime<Utc>) -> TaskStats {
        let mut stats = TaskStats::default();
        self.tasks.for_each(|task| {
            stats.total += 1;
            if task.completed {
                stats.completed += 1;
                return;
            }
            stats.pending += 1;
            if task.is_overdue_at(now) {
                stats.overdue += 1;
            }
            if task.is_due_on(now) {
                stats.due_today += 1;
            }
            if task.is_snoozed_at(now) {
                stats.snoozed += 1;
            }
        });
        stats
    }

    pub fn health_stats(&self) -> HealthStats {
        let mut stats = HealthStats::default();
        self.health.for_each(|record| {
            stats.tracked += 1;
            match record.status {
                HealthStatus::Healthy => stats.healthy += 1,
                HealthStatus::NeedsAttention => stats.needs_attention += 1,
                HealthStatus::Critical => stats.critical += 1,
                HealthStatus::Checking => stats.checking += 1,
                HealthStatus::Unknown => {}
            }
        });
        stats.average_score = self.health.average_score();
        stats
    }

    pub fn community_stats(&self) -> CommunityStats {
        let mut stats = CommunityStats::default();
        self.community.posts().for_each(|post| {
            stats.posts += 1;
            stats.total_likes += u64::from(post.like_count);
            if post.liked_by_me {
                stats.liked_by_me += 1;
            }
        });
        stats.comments = self.community.comments().len();
        stats.users_online = self.community.online_users().len();
        stats
    }
}

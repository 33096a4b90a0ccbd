//! Care task cache.

use std::ops::Deref;

use chrono::{DateTime, Utc};

use crate::cache::{CacheEntry, DomainCache, MergeOutcome};
use crate::event::{Event, EventBody};
use crate::types::{CareTask, TaskPatch, Timestamp};

impl CacheEntry for CareTask {
    type Patch = TaskPatch;
    const KIND: &'static str = "care-task";

    fn id(&self) -> &str {
        &self.id
    }

    fn apply_patch(&mut self, patch: &TaskPatch) {
        if let Some(title) = &patch.title {
            self.title = title.clone();
        }
        if let Some(notes) = &patch.notes {
            self.notes = Some(notes.clone());
        }
        if let Some(priority) = patch.priority {
            self.priority = priority;
        }
        if let Some(due_date) = patch.due_date {
            self.due_date = due_date;
        }
        if let Some(completed) = patch.completed {
            self.completed = completed;
            if !completed {
                self.completed_at = None;
            }
        }
    }
}

impl CareTask {
    /// Whether the task is snoozed past `now`.
    pub fn is_snoozed_at(&self, now: DateTime<Utc>) -> bool {
        !self.completed && self.snoozed_until.is_some_and(|until| until > now)
    }

    /// Whether the task is past due at `now`. Snoozed tasks are not overdue.
    pub fn is_overdue_at(&self, now: DateTime<Utc>) -> bool {
        !self.completed && self.due_date < now && !self.is_snoozed_at(now)
    }

    /// Whether the task is open and due on the UTC calendar day of `now`.
    pub fn is_due_on(&self, now: DateTime<Utc>) -> bool {
        !self.completed && self.due_date.date_naive() == now.date_naive()
    }
}

/// Cache of the user's care tasks.
#[derive(Default)]
pub struct TaskCache {
    cache: DomainCache<CareTask>,
}

impl Deref for TaskCache {
    type Target = DomainCache<CareTask>;

    fn deref(&self) -> &Self::Target {
        &self.cache
    }
}

impl TaskCache {
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
            EventBody::TaskCreated(task)
            | EventBody::TaskUpdated(task)
            | EventBody::TaskCompleted(task)
            | EventBody::TaskSnoozed(task) => self.cache.apply_create(task.clone(), ts),
            EventBody::TaskDeleted { id } => self.cache.apply_delete_at(id, ts),
            EventBody::PlantDeleted { plant_id } => {
                let removed = self.remove_plant(plant_id, ts);
                if removed > 0 {
                    MergeOutcome::Deleted
                } else {
                    MergeOutcome::Absent
                }
            }
            _ => return None,
        };
        Some(outcome)
    }

    /// Mark a task completed.
    pub fn complete(&self, id: &str, completed_at: DateTime<Utc>, ts: Timestamp) -> MergeOutcome {
        self.cache
            .apply_domain_specific(id, |task| mark_completed(task, completed_at), ts)
    }

    /// Snooze a task until `until`.
    pub fn snooze(&self, id: &str, until: DateTime<Utc>, ts: Timestamp) -> MergeOutcome {
        self.cache.apply_domain_specific(id, |task| mark_snoozed(task, until), ts)
    }

    /// Delete every task of a plant. Returns the number removed.
    pub fn remove_plant(&self, plant_id: &str, ts: Timestamp) -> usize {
        self.cache.delete_where(|task| task.plant_id == plant_id, ts)
    }

    /// Open tasks, ordered by due date.
    pub fn pending(&self) -> Vec<CareTask> {
        by_due_date(self.cache.list_where(|t| !t.completed))
    }

    /// Tasks past due at `now`, ordered by due date.
    pub fn overdue_at(&self, now: DateTime<Utc>) -> Vec<CareTask> {
        by_due_date(self.cache.list_where(|t| t.is_overdue_at(now)))
    }

    /// Open tasks due on the calendar day of `now`, ordered by due date.
    pub fn due_today_at(&self, now: DateTime<Utc>) -> Vec<CareTask> {
        by_due_date(self.cache.list_where(|t| t.is_due_on(now)))
    }

    /// Tasks for one plant, ordered by due date.
    pub fn for_plant(&self, plant_id: &str) -> Vec<CareTask> {
        by_due_date(self.cache.list_where(|t| t.plant_id == plant_id))
    }
}

pub(crate) fn mark_completed(task: &mut CareTask, at: DateTime<Utc>) {
    task.completed = true;
    task.completed_at = Some(at);
    task.snoozed_until = None;
}

pub(crate) fn mark_snoozed(task: &mut CareTask, until: DateTime<Utc>) {
    task.snoozed_until = Some(until);
}

fn by_due_date(mut tasks: Vec<CareTask>) -> Vec<CareTask> {
    tasks.sort_by(|a, b| a.due_date.cmp(&b.due_date).then_with(|| a.id.cmp(&b.id)));
    tasks
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{CareKind, Priority};
    use chrono::{Duration, TimeZone};

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 5, 14, 12, 0, 0).unwrap()
    }

    fn task(id: &str, plant: &str, due: DateTime<Utc>) -> CareTask {
        CareTask {
            id: id.to_string(),
            plant_id: plant.to_string(),
            plant_name: None,
            kind: CareKind::Water,
            title: format!("water {plant}"),
            notes: None,
            priority: Priority::Medium,
            due_date: due,
            completed: false,
            completed_at: None,
            snoozed_until: None,
        }
    }

    #[test]
    fn test_example_scenario() {
        let cache = TaskCache::new();
        cache.apply_create(task("t1", "p1", now()), Timestamp(1));
        let done = TaskPatch {
            completed: Some(true),
            ..Default::default()
        };
        let undone = TaskPatch {
            completed: Some(false),
            ..Default::default()
        };
        cache.apply_update("t1", &done, Timestamp(2));
        cache.apply_update("t1", &undone, Timestamp(1));

        assert!(cache.get("t1").unwrap().completed);
    }

    #[test]
    fn test_task_events() {
        let cache = TaskCache::new();
        let t = task("t1", "p1", now());

        let created = Event::new(Timestamp(3), EventBody::TaskCreated(t.clone()));
        assert_eq!(cache.apply_event(&created), Some(MergeOutcome::Created));
        assert_eq!(cache.apply_event(&created), Some(MergeOutcome::Stale));

        let mut completed = t.clone();
        mark_completed(&mut completed, now());
        let event = Event::new(Timestamp(4), EventBody::TaskCompleted(completed));
        assert_eq!(cache.apply_event(&event), Some(MergeOutcome::Applied));
        assert!(cache.get("t1").unwrap().completed);

        let deleted = Event::new(
            Timestamp(5),
            EventBody::TaskDeleted {
                id: "t1".to_string(),
            },
        );
        assert_eq!(cache.apply_event(&deleted), Some(MergeOutcome::Deleted));
        assert!(cache.is_empty());

        // Late update from before the delete.
        let late = Event::new(Timestamp(4), EventBody::TaskUpdated(t));
        assert_eq!(cache.apply_event(&late), Some(MergeOutcome::Stale));
        assert!(cache.is_empty());
    }

    #[test]
    fn test_unrelated_event_is_ignored() {
        let cache = TaskCache::new();
        let event = Event::new(
            Timestamp(0),
            EventBody::UserOnline {
                user_id: "u".to_string(),
            },
        );
        assert_eq!(cache.apply_event(&event), None);
    }

    #[test]
    fn test_plant_deleted_removes_its_tasks() {
        let cache = TaskCache::new();
        cache.apply_create(task("t1", "p1", now()), Timestamp(1));
        cache.apply_create(task("t2", "p1", now()), Timestamp(1));
        cache.apply_create(task("t3", "p2", now()), Timestamp(1));

        let event = Event::new(
            Timestamp(2),
            EventBody::PlantDeleted {
                plant_id: "p1".to_string(),
            },
        );
        assert_eq!(cache.apply_event(&event), Some(MergeOutcome::Deleted));
        assert_eq!(cache.len(), 1);
        assert!(cache.for_plant("p1").is_empty());
    }

    #[test]
    fn test_complete_and_snooze() {
        let cache = TaskCache::new();
        cache.apply_create(task("t1", "p1", now()), Timestamp(1));
        cache.apply_create(task("t2", "p1", now()), Timestamp(1));

        let until = now() + Duration::days(2);
        assert_eq!(cache.snooze("t1", until, Timestamp(2)), MergeOutcome::Applied);
        assert_eq!(cache.get("t1").unwrap().snoozed_until, Some(until));

        assert_eq!(cache.complete("t2", now(), Timestamp(2)), MergeOutcome::Applied);
        assert_eq!(cache.complete("t2", now(), Timestamp(2)), MergeOutcome::Stale);
        assert_eq!(cache.complete("nope", now(), Timestamp(9)), MergeOutcome::Missing);

        let t2 = cache.get("t2").unwrap();
        assert!(t2.completed);
        assert_eq!(t2.completed_at, Some(now()));
    }

    #[test]
    fn test_projections() {
        let cache = TaskCache::new();
        let yesterday = now() - Duration::days(1);
        let later_today = now() + Duration::hours(3);
        let tomorrow = now() + Duration::days(1);

        cache.apply_create(task("late", "p1", yesterday), Timestamp(1));
        cache.apply_create(task("today", "p1", later_today), Timestamp(1));
        cache.apply_create(task("soon", "p2", tomorrow), Timestamp(1));
        let mut snoozed = task("snoozed", "p2", yesterday);
        snoozed.snoozed_until = Some(tomorrow);
        cache.apply_create(snoozed, Timestamp(1));
        let mut done = task("done", "p2", yesterday);
        done.completed = true;
        cache.apply_create(done, Timestamp(1));

        let ids = |tasks: Vec<CareTask>| tasks.into_iter().map(|t| t.id).collect::<Vec<_>>();
        assert_eq!(ids(cache.overdue_at(now())), vec!["late"]);
        assert_eq!(ids(cache.due_today_at(now())), vec!["today"]);
        assert_eq!(cache.pending().len(), 4);
        assert_eq!(ids(cache.for_plant("p1")), vec!["late", "today"]);
    }

    #[test]
    fn test_uncompleting_clears_completed_at() {
        let mut t = task("t1", "p1", now());
        mark_completed(&mut t, now());
        t.apply_patch(&TaskPatch {
            completed: Some(false),
            ..Default::default()
        });
        assert!(!t.completed);
        assert!(t.completed_at.is_none());
    }
}

//! Typed publish/subscribe router for server events.
//!
//! Handlers are registered per [`EventTag`] and invoked in registration order.
//! Each registration returns a [`HandlerGuard`]; dropping the guard (or calling
//! [`HandlerGuard::unsubscribe`]) removes the handler.
//!
//! Delivery is at-least-once per connection epoch and FIFO within a topic.
//! Handlers are expected to be idempotent; the caches they feed enforce this
//! with their timestamp check.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use dashmap::DashMap;
use tracing::{debug, trace, warn};

use crate::event::{Event, EventTag};
use crate::protocol::ServerFrame;

/// Callback invoked for each delivered event.
pub type Handler = Arc<dyn Fn(&Event) + Send + Sync>;

struct Registration {
    id: u64,
    handler: Handler,
}

#[derive(Default)]
struct DispatcherInner {
    handlers: DashMap<EventTag, Vec<Registration>>,
    next_id: AtomicU64,
    delivered: AtomicU64,
    dropped: AtomicU64,
    unhandled: AtomicU64,
}

impl DispatcherInner {
    fn remove(&self, tag: EventTag, id: u64) -> bool {
        let mut removed = false;
        if let Some(mut regs) = self.handlers.get_mut(&tag) {
            let before = regs.len();
            regs.retain(|r| r.id != id);
            removed = regs.len() != before;
        }
        // Drop empty lists so handler_count() reflects reality.
        self.handlers.remove_if(&tag, |_, regs| regs.is_empty());
        removed
    }
}

/// Counters describing dispatcher activity.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DispatchStats {
    /// Events delivered to at least one handler.
    pub delivered: u64,
    /// Frames dropped because they were malformed or unrecognized.
    pub dropped: u64,
    /// Well-formed events with no registered handler.
    pub unhandled: u64,
}

/// Event router shared by the connection manager and consumers.
///
/// Cloning is cheap; all clones share the same handler table.
#[derive(Clone, Default)]
pub struct EventDispatcher {
    inner: Arc<DispatcherInner>,
}

impl EventDispatcher {
    /// Create a dispatcher with no handlers.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler for an event tag.
    ///
    /// The handler stays registered until the returned guard is dropped.
    pub fn on<F>(&self, tag: EventTag, handler: F) -> HandlerGuard
    where
        F: Fn(&Event) + Send + Sync + 'static,
    {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        self.inner.handlers.entry(tag).or_default().push(Registration {
            id,
            handler: Arc::new(handler),
        });
        trace!(%tag, id, "registered handler");

        HandlerGuard {
            inner: Arc::downgrade(&self.inner),
            tag,
            id,
            active: true,
        }
    }

    /// Deliver a decoded event to every handler registered for its tag.
    ///
    /// Returns the number of handlers invoked. Handlers run on a snapshot of
    /// the handler list, so they may register or drop guards while running.
    pub fn dispatch(&self, event: &Event) -> usize {
        let tag = event.tag();
        let handlers: Vec<Handler> = self
            .inner
            .handlers
            .get(&tag)
            .map(|regs| regs.iter().map(|r| Arc::clone(&r.handler)).collect())
            .unwrap_or_default();

        if handlers.is_empty() {
            self.inner.unhandled.fetch_add(1, Ordering::Relaxed);
            trace!(%tag, "no handlers for event");
            return 0;
        }

        for handler in &handlers {
            handler(event);
        }

        self.inner.delivered.fetch_add(1, Ordering::Relaxed);
        handlers.len()
    }

    /// Decode a raw text frame and deliver it.
    ///
    /// Malformed or unrecognized frames are logged, counted and dropped.
    pub fn dispatch_text(&self, text: &str) -> usize {
        match ServerFrame::parse(text) {
            Ok(ServerFrame::Event(event)) => self.dispatch(&event),
            Ok(ServerFrame::AuthOk) | Ok(ServerFrame::AuthError { .. }) => {
                debug!("ignoring handshake frame outside of handshake");
                0
            }
            Err(e) => {
                self.inner.dropped.fetch_add(1, Ordering::Relaxed);
                warn!(error = %e, frame_len = text.len(), "dropping unreadable event frame");
                0
            }
        }
    }

    /// Number of handlers registered for a tag.
    pub fn handler_count(&self, tag: EventTag) -> usize {
        self.inner.handlers.get(&tag).map(|r| r.len()).unwrap_or(0)
    }

    /// Number of handlers registered across all tags.
    pub fn total_handlers(&self) -> usize {
        self.inner.handlers.iter().map(|r| r.len()).sum()
    }

    /// Activity counters.
    pub fn stats(&self) -> DispatchStats {
        DispatchStats {
            delivered: self.inner.delivered.load(Ordering::Relaxed),
            dropped: self.inner.dropped.load(Ordering::Relaxed),
            unhandled: self.inner.unhandled.load(Ordering::Relaxed),
        }
    }
}

/// Unsubscribe token returned by [`EventDispatcher::on`].
#[must_use = "dropping a HandlerGuard unregisters the handler immediately"]
pub struct HandlerGuard {
    inner: Weak<DispatcherInner>,
    tag: EventTag,
    id: u64,
    active: bool,
}

impl HandlerGuard {
    /// The tag this handler is registered for.
    pub fn tag(&self) -> EventTag {
        self.tag
    }

    /// Unregister the handler now.
    pub fn unsubscribe(mut self) {
        self.release();
    }

    fn release(&mut self) {
        if !self.active {
            return;
        }
        self.active = false;
        if let Some(inner) = self.inner.upgrade()
            && inner.remove(self.tag, self.id)
        {
            trace!(tag = %self.tag, id = self.id, "unregistered handler");
        }
    }
}

impl Drop for HandlerGuard {
    fn drop(&mut self) {
        self.release();
    }
}

impl std::fmt::Debug for HandlerGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HandlerGuard")
            .field("tag", &self.tag)
            .field("id", &self.id)
            .field("active", &self.active)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::EventBody;
    use crate::types::Timestamp;
    use std::sync::Mutex;

    fn online(user: &str) -> Event {
        Event::new(
            Timestamp(0),
            EventBody::UserOnline {
                user_id: user.to_string(),
            },
        )
    }

    #[test]
    fn test_fan_out_in_registration_order() {
        let dispatcher = EventDispatcher::new();
        let calls = Arc::new(Mutex::new(Vec::new()));

        let c1 = Arc::clone(&calls);
        let _g1 = dispatcher.on(EventTag::UserOnline, move |_| c1.lock().unwrap().push(1));
        let c2 = Arc::clone(&calls);
        let _g2 = dispatcher.on(EventTag::UserOnline, move |_| c2.lock().unwrap().push(2));

        assert_eq!(dispatcher.dispatch(&online("u1")), 2);
        assert_eq!(*calls.lock().unwrap(), vec![1, 2]);
    }

    #[test]
    fn test_only_matching_tag_is_invoked() {
        let dispatcher = EventDispatcher::new();
        let hits = Arc::new(AtomicU64::new(0));
        let h = Arc::clone(&hits);
        let _g = dispatcher.on(EventTag::UserOffline, move |_| {
            h.fetch_add(1, Ordering::SeqCst);
        });

        dispatcher.dispatch(&online("u1"));
        assert_eq!(hits.load(Ordering::SeqCst), 0);
        assert_eq!(dispatcher.stats().unhandled, 1);
    }

    #[test]
    fn test_drop_guard_unregisters() {
        let dispatcher = EventDispatcher::new();
        let hits = Arc::new(AtomicU64::new(0));
        let h = Arc::clone(&hits);
        let guard = dispatcher.on(EventTag::UserOnline, move |_| {
            h.fetch_add(1, Ordering::SeqCst);
        });
        assert_eq!(dispatcher.handler_count(EventTag::UserOnline), 1);

        drop(guard);
        assert_eq!(dispatcher.handler_count(EventTag::UserOnline), 0);
        assert_eq!(dispatcher.dispatch(&online("u1")), 0);
        assert_eq!(hits.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_unsubscribe_leaves_other_handlers() {
        let dispatcher = EventDispatcher::new();
        let g1 = dispatcher.on(EventTag::UserOnline, |_| {});
        let _g2 = dispatcher.on(EventTag::UserOnline, |_| {});

        g1.unsubscribe();
        assert_eq!(dispatcher.handler_count(EventTag::UserOnline), 1);
    }

    #[test]
    fn test_guard_outliving_dispatcher_is_harmless() {
        let dispatcher = EventDispatcher::new();
        let guard = dispatcher.on(EventTag::UserOnline, |_| {});
        drop(dispatcher);
        drop(guard);
    }

    #[test]
    fn test_handler_may_unregister_itself_during_dispatch() {
        let dispatcher = EventDispatcher::new();
        let slot: Arc<Mutex<Option<HandlerGuard>>> = Arc::new(Mutex::new(None));
        let s = Arc::clone(&slot);
        let guard = dispatcher.on(EventTag::UserOnline, move |_| {
            s.lock().unwrap().take();
        });
        *slot.lock().unwrap() = Some(guard);

        assert_eq!(dispatcher.dispatch(&online("u1")), 1);
        assert_eq!(dispatcher.handler_count(EventTag::UserOnline), 0);
    }

    #[test]
    fn test_bad_frames_do_not_block_later_frames() {
        let dispatcher = EventDispatcher::new();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let s = Arc::clone(&seen);
        let _g = dispatcher.on(EventTag::UserOnline, move |e| {
            if let EventBody::UserOnline { user_id } = &e.body {
                s.lock().unwrap().push(user_id.clone());
            }
        });

        dispatcher.dispatch_text(r#"{"type":"user:online","payload":{"userId":"a"}}"#);
        dispatcher.dispatch_text("{not json");
        dispatcher.dispatch_text(r#"{"type":"mystery:event","payload":{}}"#);
        dispatcher.dispatch_text(r#"{"type":"user:online","payload":{}}"#);
        dispatcher.dispatch_text(r#"{"type":"user:online","payload":{"userId":"b"}}"#);

        assert_eq!(*seen.lock().unwrap(), vec!["a", "b"]);
        let stats = dispatcher.stats();
        assert_eq!(stats.delivered, 2);
        assert_eq!(stats.dropped, 3);
    }
}

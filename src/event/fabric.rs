//! Component C: the event fabric (`spec.md` §4.3) — lifecycle, listener
//! subscription, push and broadcast.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use parking_lot::RwLock;
use serde_json::Value;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::error::CoreResult;
use crate::limits::Limits;
use crate::scheduler::{GroupToken, Job, Scheduler};

use super::event::{new_event, Event, EventIdAllocator};
use super::listener::Listener;

struct EventRecord {
    event: Event,
    watchers: RwLock<Vec<Listener>>,
}

/// Recently-seen broadcast UUIDs, consulted under a mutex on every
/// rebroadcast (`spec.md` §4.3).
struct DedupRing {
    capacity: usize,
    seen: parking_lot::Mutex<VecDeque<[u8; 16]>>,
}

impl DedupRing {
    fn new(capacity: usize) -> Self {
        DedupRing {
            capacity,
            seen: parking_lot::Mutex::new(VecDeque::with_capacity(capacity)),
        }
    }

    /// Returns `true` if `uuid` was already seen (and should be
    /// suppressed); records it as seen either way.
    fn check_and_record(&self, uuid: [u8; 16]) -> bool {
        let mut ring = self.seen.lock();
        if ring.contains(&uuid) {
            return true;
        }
        if ring.len() == self.capacity {
            ring.pop_front();
        }
        ring.push_back(uuid);
        false
    }
}

/// Process-wide registry of events and their listeners.
pub struct EventFabric {
    ids: EventIdAllocator,
    events: RwLock<HashMap<u16, EventRecord>>,
    by_name: RwLock<HashMap<String, u16>>,
    all_listeners: RwLock<Vec<Listener>>,
    dedup: DedupRing,
    limits: Limits,
}

impl EventFabric {
    #[must_use]
    pub fn new(limits: Limits) -> Self {
        let dedup_capacity = limits.broadcast_dedup_ring;
        EventFabric {
            ids: EventIdAllocator::new(),
            events: RwLock::new(HashMap::new()),
            by_name: RwLock::new(HashMap::new()),
            all_listeners: RwLock::new(Vec::new()),
            dedup: DedupRing::new(dedup_capacity),
            limits,
        }
    }

    pub fn create(&self, fullname: &str) -> CoreResult<Event> {
        let id = self.ids.allocate()?;
        let event = new_event(id, fullname.to_owned());
        self.events.write().insert(
            id,
            EventRecord {
                event: event.clone(),
                watchers: RwLock::new(Vec::new()),
            },
        );
        self.by_name.write().insert(fullname.to_owned(), id);
        debug!(event_id = id, fullname, "event created");
        Ok(event)
    }

    #[must_use]
    pub fn lookup_by_name(&self, fullname: &str) -> Option<Event> {
        let id = *self.by_name.read().get(fullname)?;
        self.events.read().get(&id).map(|r| r.event.clone())
    }

    /// Destroys the event: releases all watches and queues a `remove`
    /// notification for each listener that was watching it.
    pub fn destroy(&self, scheduler: &dyn Scheduler, id: u16) {
        let record = self.events.write().remove(&id);
        let Some(record) = record else { return };
        self.by_name.write().remove(record.event.fullname());
        self.ids.release(id);
        let fullname = record.event.fullname().to_owned();
        for listener in record.watchers.into_inner() {
            if let Some(remove) = listener.interface().remove.clone() {
                let name = fullname.clone();
                post(scheduler, &listener.group(), move |_signum| {
                    remove(&name, id);
                });
            }
        }
    }

    /// Idempotent: re-adding a listener that already watches `event` is a
    /// no-op (no duplicate `add` notification fires).
    pub fn listener_add(&self, scheduler: &dyn Scheduler, event: &Event, listener: &Listener) {
        let events = self.events.read();
        let Some(record) = events.get(&event.id()) else {
            return;
        };
        {
            let mut watchers = record.watchers.write();
            if watchers.iter().any(|l| l.is_same(listener)) {
                return;
            }
            watchers.push(listener.clone());
        }
        if !self.all_listeners.read().iter().any(|l| l.is_same(listener)) {
            self.all_listeners.write().push(listener.clone());
        }
        if let Some(add) = listener.interface().add.clone() {
            let fullname = event.fullname().to_owned();
            let id = event.id();
            post(scheduler, &listener.group(), move |_signum| {
                add(&fullname, id);
            });
        }
    }

    pub fn listener_remove(&self, event: &Event, listener: &Listener) {
        self.listener_remove_by_id(event.id(), listener);
    }

    pub fn listener_remove_by_id(&self, eventid: u16, listener: &Listener) {
        let events = self.events.read();
        if let Some(record) = events.get(&eventid) {
            record.watchers.write().retain(|l| !l.is_same(listener));
        }
    }

    /// Snapshots the watch list under a read lock, then posts a `push`
    /// job per listener carrying a shared (refcounted) payload envelope.
    /// Returns the number of listeners notified. A destroyed (or never
    /// existent) event id is not an error — it simply has no watchers.
    pub fn push(&self, scheduler: &dyn Scheduler, eventid: u16, params: Value) -> CoreResult<usize> {
        let events = self.events.read();
        let Some(record) = events.get(&eventid) else {
            return Ok(0);
        };
        let fullname = record.event.fullname().to_owned();
        let watchers = record.watchers.read().clone();
        drop(events);

        let envelope = Arc::new(params);
        let mut notified = 0usize;
        for listener in &watchers {
            if let Some(push) = listener.interface().push.clone() {
                let name = fullname.clone();
                let envelope = envelope.clone();
                post(scheduler, &listener.group(), move |_signum| {
                    push(&name, eventid, envelope);
                });
                notified += 1;
            }
        }
        Ok(notified)
    }

    /// Originates a fresh broadcast: new UUID, default hop count.
    pub fn broadcast(&self, scheduler: &dyn Scheduler, name: &str, params: Value) {
        let uuid = *Uuid::new_v4().as_bytes();
        self.rebroadcast(scheduler, name, params, uuid, self.limits.broadcast_hop_default);
    }

    /// Rebroadcasts a received broadcast, deduplicating against the ring.
    /// Every registered listener (not only watchers of `name`) receives a
    /// `broadcast` job.
    pub fn rebroadcast(&self, scheduler: &dyn Scheduler, name: &str, params: Value, uuid: [u8; 16], hop: u8) {
        if self.dedup.check_and_record(uuid) {
            debug!(name, "duplicate broadcast suppressed");
            return;
        }
        if hop == 0 {
            warn!(name, "broadcast hop count exhausted");
            return;
        }
        let envelope = Arc::new(params);
        let listeners = self.all_listeners.read().clone();
        for listener in &listeners {
            if let Some(bcast) = listener.interface().broadcast.clone() {
                let name = name.to_owned();
                let envelope = envelope.clone();
                post(scheduler, &listener.group(), move |_signum| {
                    bcast(&name, envelope, uuid, hop - 1);
                });
            }
        }
    }
}

fn post(scheduler: &dyn Scheduler, group: &GroupToken, job: impl FnOnce(i32) + Send + 'static) {
    let job: Job = Box::new(job);
    scheduler.post_job(group.clone(), std::time::Duration::ZERO, std::time::Duration::from_secs(30), job);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::listener::ListenerInterface;
    use crate::scheduler::TokioScheduler;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::sync::oneshot;

    #[tokio::test]
    async fn push_notifies_all_watchers_and_returns_count() {
        let fabric = EventFabric::new(Limits::default());
        let scheduler = TokioScheduler::new();
        let event = fabric.create("demo.event").unwrap();

        let hits = Arc::new(AtomicUsize::new(0));
        let (tx, rx) = oneshot::channel::<()>();
        let mut tx = Some(tx);
        let h = hits.clone();
        let itf = ListenerInterface {
            push: Some(Arc::new(move |_name, _id, _payload| {
                h.fetch_add(1, Ordering::SeqCst);
                if let Some(tx) = tx.take() {
                    let _ = tx.send(());
                }
            })),
            ..Default::default()
        };
        let listener = Listener::new(itf, GroupToken::new());
        fabric.listener_add(&scheduler, &event, &listener);

        let count = fabric.push(&scheduler, event.id(), serde_json::json!({"x": 1})).unwrap();
        assert_eq!(count, 1);
        let _ = rx.await;
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn listener_add_is_idempotent() {
        let fabric = EventFabric::new(Limits::default());
        let scheduler = TokioScheduler::new();
        let event = fabric.create("demo.idempotent").unwrap();
        let calls = Arc::new(AtomicUsize::new(0));
        let c = calls.clone();
        let itf = ListenerInterface {
            add: Some(Arc::new(move |_n, _i| {
                c.fetch_add(1, Ordering::SeqCst);
            })),
            ..Default::default()
        };
        let listener = Listener::new(itf, GroupToken::new());
        fabric.listener_add(&scheduler, &event, &listener);
        fabric.listener_add(&scheduler, &event, &listener);
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn rebroadcast_suppresses_a_duplicate_uuid() {
        let fabric = EventFabric::new(Limits::default());
        let scheduler = TokioScheduler::new();
        let hits = Arc::new(AtomicUsize::new(0));
        let h = hits.clone();
        let itf = ListenerInterface {
            broadcast: Some(Arc::new(move |_n, _p, _u, _h| {
                h.fetch_add(1, Ordering::SeqCst);
            })),
            ..Default::default()
        };
        let listener = Listener::new(itf, GroupToken::new());
        let event = fabric.create("demo.bcast").unwrap();
        fabric.listener_add(&scheduler, &event, &listener);
        fabric.all_listeners.write().push(listener.clone());

        let uuid = [7u8; 16];
        fabric.rebroadcast(&scheduler, "demo.bcast", serde_json::Value::Null, uuid, 10);
        fabric.rebroadcast(&scheduler, "demo.bcast", serde_json::Value::Null, uuid, 10);
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn destroy_releases_the_id_for_reuse() {
        let fabric = EventFabric::new(Limits::default());
        let scheduler = TokioScheduler::new();
        let event = fabric.create("demo.destroy").unwrap();
        let id = event.id();
        fabric.destroy(&scheduler, id);
        assert!(fabric.lookup_by_name("demo.destroy").is_none());
    }

    #[test]
    fn push_after_destroy_notifies_nobody_without_erroring() {
        let fabric = EventFabric::new(Limits::default());
        let scheduler = TokioScheduler::new();
        let event = fabric.create("demo.gone").unwrap();
        let id = event.id();
        fabric.destroy(&scheduler, id);

        let count = fabric.push(&scheduler, id, serde_json::json!(null)).unwrap();
        assert_eq!(count, 0);
    }
}

//! Remote store primitives and the in-memory implementation.
//!
//! # Responsibility
//! - Define the get/set/push/update/listen surface the sync middleware
//!   talks to.
//! - Fan change notifications out to listeners through the scheduler.
//!
//! # Invariants
//! - A region is an ordered collection of `key -> JSON` children; children
//!   keep their first insertion order.
//! - Listeners are never called synchronously from a write; every event is
//!   delivered on a later scheduler tick, in write order.
//! - A failed write changes nothing and notifies nobody.

use crate::scheduler::Scheduler;
use crate::sync::error::{RemoteError, RemoteResult};
use log::{debug, warn};
use serde_json::{Map, Value as JsonValue};
use std::cell::{Cell, RefCell};
use std::collections::BTreeMap;
use std::rc::Weak;

/// One child of a region.
#[derive(Debug, Clone, PartialEq)]
pub struct RemoteRecord {
    pub key: String,
    pub value: JsonValue,
}

impl RemoteRecord {
    pub fn new(key: impl Into<String>, value: JsonValue) -> Self {
        Self {
            key: key.into(),
            value,
        }
    }
}

/// Child-level change notification.
#[derive(Debug, Clone, PartialEq)]
pub enum RemoteEvent {
    Added(RemoteRecord),
    Changed(RemoteRecord),
    Removed { key: String },
}

impl RemoteEvent {
    pub fn key(&self) -> &str {
        match self {
            Self::Added(record) | Self::Changed(record) => &record.key,
            Self::Removed { key } => key,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Self::Added(_) => "added",
            Self::Changed(_) => "changed",
            Self::Removed { .. } => "removed",
        }
    }
}

pub trait RemoteListener {
    fn on_remote_event(&self, region: &str, event: RemoteEvent);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

/// Opaque append/merge key-value service addressed by region path.
pub trait RemoteStore {
    /// Returns every child of `region` in insertion order.
    fn get(&self, region: &str) -> RemoteResult<Vec<RemoteRecord>>;

    /// Replaces one child; `JsonValue::Null` removes it.
    ///
    /// Returns `true` when stored content changed. Listeners get an event
    /// for exactly those writes.
    fn set(&self, region: &str, key: &str, value: JsonValue) -> RemoteResult<bool>;

    /// Appends a child under a store-generated key and returns the key.
    fn push(&self, region: &str, value: JsonValue) -> RemoteResult<String>;

    /// Merges `fields` into one child object, creating it when missing.
    /// A `Null` field deletes that field. Returns `true` as `set` does.
    fn update(&self, region: &str, key: &str, fields: Map<String, JsonValue>)
        -> RemoteResult<bool>;

    /// Subscribes to child events of `region`. Dead listeners are pruned.
    fn listen(&self, region: &str, listener: Weak<dyn RemoteListener>) -> ListenerId;

    /// Returns `false` when `id` was not subscribed.
    fn unlisten(&self, id: ListenerId) -> bool;
}

/// Listener bookkeeping shared by the store implementations.
pub(crate) struct ListenerRegistry {
    scheduler: Scheduler,
    next_id: Cell<u64>,
    listeners: RefCell<Vec<(ListenerId, String, Weak<dyn RemoteListener>)>>,
}

impl ListenerRegistry {
    pub(crate) fn new(scheduler: Scheduler) -> Self {
        Self {
            scheduler,
            next_id: Cell::new(1),
            listeners: RefCell::new(Vec::new()),
        }
    }

    pub(crate) fn add(&self, region: &str, listener: Weak<dyn RemoteListener>) -> ListenerId {
        let id = ListenerId(self.next_id.get());
        self.next_id.set(id.0 + 1);
        self.listeners
            .borrow_mut()
            .push((id, region.to_string(), listener));
        id
    }

    pub(crate) fn remove(&self, id: ListenerId) -> bool {
        let mut listeners = self.listeners.borrow_mut();
        let before = listeners.len();
        listeners.retain(|(entry_id, _, _)| *entry_id != id);
        listeners.len() != before
    }

    pub(crate) fn len(&self) -> usize {
        self.listeners.borrow().len()
    }

    /// Schedules `event` for every live listener of `region`.
    pub(crate) fn notify(&self, region: &str, event: RemoteEvent) {
        let targets: Vec<Weak<dyn RemoteListener>> = {
            let mut listeners = self.listeners.borrow_mut();
            listeners.retain(|(_, _, listener)| listener.strong_count() > 0);
            listeners
                .iter()
                .filter(|(_, listened, _)| listened == region)
                .map(|(_, _, listener)| Weak::clone(listener))
                .collect()
        };
        for target in targets {
            let region = region.to_string();
            let event = event.clone();
            self.scheduler.schedule(move || {
                if let Some(listener) = target.upgrade() {
                    listener.on_remote_event(&region, event);
                }
            });
        }
    }
}

/// Event produced by writing `value` over `previous`.
pub(crate) fn change_event(
    key: &str,
    previous: Option<&JsonValue>,
    value: &JsonValue,
) -> Option<RemoteEvent> {
    match (previous, value) {
        (None, JsonValue::Null) => None,
        (Some(_), JsonValue::Null) => Some(RemoteEvent::Removed {
            key: key.to_string(),
        }),
        (None, value) => Some(RemoteEvent::Added(RemoteRecord::new(key, value.clone()))),
        (Some(previous), value) if previous == value => None,
        (Some(_), value) => Some(RemoteEvent::Changed(RemoteRecord::new(key, value.clone()))),
    }
}

/// Applies `fields` onto `previous`, returning the merged child.
pub(crate) fn merge_fields(
    previous: Option<&JsonValue>,
    fields: Map<String, JsonValue>,
) -> JsonValue {
    let mut merged = match previous {
        Some(JsonValue::Object(object)) => object.clone(),
        _ => Map::new(),
    };
    for (field, value) in fields {
        if value.is_null() {
            merged.remove(&field);
        } else {
            merged.insert(field, value);
        }
    }
    JsonValue::Object(merged)
}

/// Process-local remote store.
///
/// Several data sets attached to one instance behave like clients of a
/// shared backend. `set_offline(true)` makes every write fail with
/// `RemoteError::Unavailable`.
pub struct MemoryRemoteStore {
    regions: RefCell<BTreeMap<String, Vec<RemoteRecord>>>,
    listeners: ListenerRegistry,
    next_key: Cell<u64>,
    offline: Cell<bool>,
    writes: Cell<usize>,
}

impl MemoryRemoteStore {
    pub fn new(scheduler: Scheduler) -> Self {
        Self {
            regions: RefCell::new(BTreeMap::new()),
            listeners: ListenerRegistry::new(scheduler),
            next_key: Cell::new(1),
            offline: Cell::new(false),
            writes: Cell::new(0),
        }
    }

    pub fn set_offline(&self, offline: bool) {
        self.offline.set(offline);
    }

    /// Number of successful writes so far.
    pub fn write_count(&self) -> usize {
        self.writes.get()
    }

    pub fn listener_count(&self) -> usize {
        self.listeners.len()
    }

    pub fn record(&self, region: &str, key: &str) -> Option<JsonValue> {
        self.regions.borrow().get(region).and_then(|children| {
            children
                .iter()
                .find(|record| record.key == key)
                .map(|record| record.value.clone())
        })
    }

    fn check_online(&self, op: &str, region: &str) -> RemoteResult<()> {
        if self.offline.get() {
            warn!("event=remote_write module=remote_store status=error op={op} region={region} error_code=offline");
            return Err(RemoteError::Unavailable("memory store is offline".to_string()));
        }
        Ok(())
    }

    fn write(&self, op: &str, region: &str, key: &str, value: JsonValue) -> bool {
        let event = {
            let mut regions = self.regions.borrow_mut();
            let children = regions.entry(region.to_string()).or_default();
            let position = children.iter().position(|record| record.key == key);
            let event = change_event(key, position.map(|index| &children[index].value), &value);
            match (position, value) {
                (Some(index), JsonValue::Null) => {
                    children.remove(index);
                }
                (Some(index), value) => children[index].value = value,
                (None, JsonValue::Null) => {}
                (None, value) => children.push(RemoteRecord::new(key, value)),
            }
            event
        };
        self.writes.set(self.writes.get() + 1);
        debug!(
            "event=remote_write module=remote_store status=ok op={} region={} key={} notify={}",
            op,
            region,
            key,
            event.as_ref().map_or("none", RemoteEvent::kind)
        );
        let Some(event) = event else {
            return false;
        };
        self.listeners.notify(region, event);
        true
    }
}

impl RemoteStore for MemoryRemoteStore {
    fn get(&self, region: &str) -> RemoteResult<Vec<RemoteRecord>> {
        if self.offline.get() {
            return Err(RemoteError::Unavailable("memory store is offline".to_string()));
        }
        Ok(self
            .regions
            .borrow()
            .get(region)
            .cloned()
            .unwrap_or_default())
    }

    fn set(&self, region: &str, key: &str, value: JsonValue) -> RemoteResult<bool> {
        self.check_online("set", region)?;
        Ok(self.write("set", region, key, value))
    }

    fn push(&self, region: &str, value: JsonValue) -> RemoteResult<String> {
        self.check_online("push", region)?;
        let sequence = self.next_key.get();
        self.next_key.set(sequence + 1);
        let key = format!("-k{sequence:08}");
        self.write("push", region, &key, value);
        Ok(key)
    }

    fn update(
        &self,
        region: &str,
        key: &str,
        fields: Map<String, JsonValue>,
    ) -> RemoteResult<bool> {
        self.check_online("update", region)?;
        let merged = merge_fields(self.record(region, key).as_ref(), fields);
        Ok(self.write("update", region, key, merged))
    }

    fn listen(&self, region: &str, listener: Weak<dyn RemoteListener>) -> ListenerId {
        self.listeners.add(region, listener)
    }

    fn unlisten(&self, id: ListenerId) -> bool {
        self.listeners.remove(id)
    }
}

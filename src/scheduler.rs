use std::cell::Cell;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fmt;
use std::rc::Rc;

use rhai::Dynamic;
use serde::Serialize;

use crate::blueprint::module::CompiledModule;
use crate::blueprint::BlueprintId;
use crate::instances::ObjectId;

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(transparent)]
pub struct CalloutId(pub u64);

impl fmt::Display for CalloutId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "co{}", self.0)
    }
}

/// Game time. It only moves when the driver ticks.
#[derive(Clone, Copy, Debug, Default)]
pub struct GameClock {
    now_ms: u64,
}

impl GameClock {
    pub fn now_ms(&self) -> u64 {
        self.now_ms
    }

    pub fn advance(&mut self, dt_ms: u64) -> u64 {
        self.now_ms = self.now_ms.saturating_add(dt_ms);
        self.now_ms
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Heartbeat {
    pub interval_ms: u64,
    pub next_due_ms: u64,
}

pub struct Callout {
    pub id: CalloutId,
    pub target: ObjectId,
    pub blueprint: BlueprintId,
    pub method: String,
    pub args: Vec<Dynamic>,
    pub due_ms: u64,
    pub repeat_ms: Option<u64>,
    /// Version whose functions the arguments point into. `None` follows the
    /// target's current version.
    pub pinned: Option<Rc<CompiledModule>>,
    seq: u64,
}

impl fmt::Debug for Callout {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Callout")
            .field("id", &self.id)
            .field("target", &self.target)
            .field("method", &self.method)
            .field("due_ms", &self.due_ms)
            .field("repeat_ms", &self.repeat_ms)
            .field("pinned", &self.pinned.as_ref().map(|m| m.type_name()))
            .finish()
    }
}

pub struct NewCallout {
    pub target: ObjectId,
    pub blueprint: BlueprintId,
    pub method: String,
    pub args: Vec<Dynamic>,
    pub due_ms: u64,
    pub repeat_ms: Option<u64>,
    pub pinned: Option<Rc<CompiledModule>>,
}

/// Heartbeats and callouts on one shared clock. Callouts fire in
/// `(due, registration)` order; removal is eager everywhere.
#[derive(Default)]
pub struct Scheduler {
    heartbeats: BTreeMap<ObjectId, Heartbeat>,
    callouts: HashMap<CalloutId, Callout>,
    queue: BTreeMap<(u64, u64), CalloutId>,
    by_target: HashMap<ObjectId, BTreeSet<CalloutId>>,
    ids: Rc<Cell<u64>>,
    next_seq: u64,
}

impl Scheduler {
    pub fn register_heartbeat(&mut self, object: ObjectId, interval_ms: u64, now_ms: u64) {
        let interval_ms = interval_ms.max(1);
        self.heartbeats.insert(
            object,
            Heartbeat {
                interval_ms,
                next_due_ms: now_ms.saturating_add(interval_ms),
            },
        );
    }

    pub fn remove_heartbeat(&mut self, object: ObjectId) -> bool {
        self.heartbeats.remove(&object).is_some()
    }

    pub fn heartbeat(&self, object: ObjectId) -> Option<Heartbeat> {
        self.heartbeats.get(&object).copied()
    }

    /// Objects whose heartbeat is due, in id order.
    pub fn due_heartbeats(&self, now_ms: u64) -> Vec<ObjectId> {
        self.heartbeats
            .iter()
            .filter(|(_, hb)| hb.next_due_ms <= now_ms)
            .map(|(id, _)| *id)
            .collect()
    }

    pub fn reschedule_heartbeat(&mut self, object: ObjectId, now_ms: u64) {
        if let Some(hb) = self.heartbeats.get_mut(&object) {
            hb.next_due_ms = now_ms.saturating_add(hb.interval_ms);
        }
    }

    /// Shared id counter so world code can learn a callout id before the
    /// callout itself is inserted.
    pub fn id_source(&self) -> Rc<Cell<u64>> {
        self.ids.clone()
    }

    pub fn next_id(&self) -> CalloutId {
        let id = self.ids.get() + 1;
        self.ids.set(id);
        CalloutId(id)
    }

    #[cfg(test)]
    pub fn schedule(&mut self, new: NewCallout) -> CalloutId {
        let id = self.next_id();
        self.insert(id, new);
        id
    }

    pub fn insert(&mut self, id: CalloutId, new: NewCallout) {
        let seq = self.next_seq;
        self.next_seq += 1;
        self.push(Callout {
            id,
            target: new.target,
            blueprint: new.blueprint,
            method: new.method,
            args: new.args,
            due_ms: new.due_ms,
            repeat_ms: new.repeat_ms.map(|ms| ms.max(1)),
            pinned: new.pinned,
            seq,
        });
    }

    fn push(&mut self, callout: Callout) {
        self.queue.insert((callout.due_ms, callout.seq), callout.id);
        self.by_target
            .entry(callout.target)
            .or_default()
            .insert(callout.id);
        self.callouts.insert(callout.id, callout);
    }

    pub fn cancel(&mut self, id: CalloutId) -> Option<Callout> {
        let callout = self.callouts.remove(&id)?;
        self.queue.remove(&(callout.due_ms, callout.seq));
        if let Some(set) = self.by_target.get_mut(&callout.target) {
            set.remove(&id);
            if set.is_empty() {
                self.by_target.remove(&callout.target);
            }
        }
        Some(callout)
    }

    /// Takes the earliest callout due at or before `now_ms` out of the
    /// schedule.
    pub fn pop_due(&mut self, now_ms: u64) -> Option<Callout> {
        let (&(due, _), &id) = self.queue.iter().next()?;
        if due > now_ms {
            return None;
        }
        self.cancel(id)
    }

    /// Puts a repeating callout back at `due + interval`, keeping its
    /// registration order. Returns `false` for one-shots.
    pub fn repeat(&mut self, mut callout: Callout) -> bool {
        let Some(interval) = callout.repeat_ms else {
            return false;
        };
        callout.due_ms = callout.due_ms.saturating_add(interval);
        self.push(callout);
        true
    }

    /// Puts a callout back unchanged, e.g. while its blueprint is reloading.
    pub fn defer(&mut self, callout: Callout) {
        self.push(callout);
    }

    pub fn get(&self, id: CalloutId) -> Option<&Callout> {
        self.callouts.get(&id)
    }

    pub fn contains(&self, id: CalloutId) -> bool {
        self.callouts.contains_key(&id)
    }

    pub fn len(&self) -> usize {
        self.callouts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.callouts.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Callout> {
        self.callouts.values()
    }

    pub fn callouts_for(&self, object: ObjectId) -> impl Iterator<Item = &Callout> {
        self.by_target
            .get(&object)
            .into_iter()
            .flat_map(|ids| ids.iter().filter_map(|id| self.callouts.get(id)))
    }

    #[cfg(test)]
    pub fn callout_count_for(&self, object: ObjectId) -> usize {
        self.by_target.get(&object).map_or(0, BTreeSet::len)
    }

    pub fn callouts_of(&self, blueprint: &BlueprintId) -> usize {
        self.callouts
            .values()
            .filter(|c| &c.blueprint == blueprint)
            .count()
    }

    #[cfg(test)]
    /// Callouts holding a specific version alive.
    pub fn pinned_to(&self, blueprint: &BlueprintId, version: u64) -> usize {
        self.callouts
            .values()
            .filter(|c| {
                c.pinned
                    .as_ref()
                    .is_some_and(|m| m.blueprint() == blueprint && m.version() == version)
            })
            .count()
    }

    /// Cascade for a destructed object. Returns the number of entries removed.
    pub fn purge_object(&mut self, object: ObjectId) -> usize {
        let mut removed = usize::from(self.remove_heartbeat(object));
        let ids: Vec<CalloutId> = self
            .by_target
            .get(&object)
            .map(|ids| ids.iter().copied().collect())
            .unwrap_or_default();
        for id in ids {
            if self.cancel(id).is_some() {
                removed += 1;
            }
        }
        removed
    }

    /// Cascade for an unloaded blueprint.
    pub fn purge_blueprint(&mut self, blueprint: &BlueprintId) -> usize {
        let ids: Vec<CalloutId> = self
            .callouts
            .values()
            .filter(|c| &c.blueprint == blueprint)
            .map(|c| c.id)
            .collect();
        ids.into_iter()
            .filter(|id| self.cancel(*id).is_some())
            .count()
    }

    pub fn clear(&mut self) {
        self.heartbeats.clear();
        self.callouts.clear();
        self.queue.clear();
        self.by_target.clear();
    }
}

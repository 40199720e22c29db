use std::collections::HashMap;
use std::fmt;
use std::rc::Rc;

use serde::{Deserialize, Serialize};

use crate::blueprint::module::CompiledModule;
use crate::blueprint::BlueprintId;
use crate::capability::CapabilitySet;
use crate::state_store::{StateHandle, StateStore};

/// Arena handle. The generation changes every time a slot is reused, so a
/// stale id never resolves to a newer object.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ObjectId {
    index: u32,
    generation: u32,
}

impl ObjectId {
    pub fn new(index: u32, generation: u32) -> Self {
        Self { index, generation }
    }

    #[cfg(test)]
    pub fn index(self) -> u32 {
        self.index
    }
}

impl fmt::Display for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "@{}:{}", self.index, self.generation)
    }
}

pub struct Instance {
    pub id: ObjectId,
    /// Human-readable name: `<blueprint>#<seq>`, or the blueprint id itself
    /// for the prototype.
    pub name: String,
    pub blueprint: BlueprintId,
    pub module: Rc<CompiledModule>,
    pub state: StateHandle,
    pub capabilities: CapabilitySet,
    pub fault_streak: u32,
    pub disabled_reason: Option<String>,
}

impl Instance {
    pub fn is_prototype(&self) -> bool {
        self.name == self.blueprint.as_str()
    }

    pub fn version(&self) -> u64 {
        self.module.version()
    }
}

struct Slot {
    generation: u32,
    instance: Option<Instance>,
}

/// Dense arena of live instances plus a name index.
#[derive(Default)]
pub struct InstanceRegistry {
    slots: Vec<Slot>,
    free: Vec<u32>,
    by_name: HashMap<String, ObjectId>,
    live: usize,
}

impl InstanceRegistry {
    pub fn insert(
        &mut self,
        name: String,
        blueprint: BlueprintId,
        module: Rc<CompiledModule>,
        state: StateStore,
    ) -> ObjectId {
        let id = match self.free.pop() {
            Some(index) => {
                let slot = &mut self.slots[index as usize];
                ObjectId::new(index, slot.generation)
            }
            None => {
                let index = self.slots.len() as u32;
                self.slots.push(Slot {
                    generation: 0,
                    instance: None,
                });
                ObjectId::new(index, 0)
            }
        };
        let capabilities = module.capabilities();
        let instance = Instance {
            id,
            name: name.clone(),
            blueprint,
            module,
            state: state.into_handle(),
            capabilities,
            fault_streak: 0,
            disabled_reason: None,
        };
        self.slots[id.index as usize].instance = Some(instance);
        self.by_name.insert(name, id);
        self.live += 1;
        id
    }

    /// Removes the instance and bumps the slot generation. The returned
    /// instance carries the last reference this registry held to its module.
    pub fn remove(&mut self, id: ObjectId) -> Option<Instance> {
        let slot = self.slots.get_mut(id.index as usize)?;
        if slot.generation != id.generation {
            return None;
        }
        let instance = slot.instance.take()?;
        slot.generation = slot.generation.wrapping_add(1);
        self.free.push(id.index);
        self.by_name.remove(&instance.name);
        self.live -= 1;
        Some(instance)
    }

    pub fn get(&self, id: ObjectId) -> Option<&Instance> {
        let slot = self.slots.get(id.index as usize)?;
        if slot.generation != id.generation {
            return None;
        }
        slot.instance.as_ref()
    }

    pub fn get_mut(&mut self, id: ObjectId) -> Option<&mut Instance> {
        let slot = self.slots.get_mut(id.index as usize)?;
        if slot.generation != id.generation {
            return None;
        }
        slot.instance.as_mut()
    }

    pub fn contains(&self, id: ObjectId) -> bool {
        self.get(id).is_some()
    }

    pub fn by_name(&self, name: &str) -> Option<ObjectId> {
        self.by_name.get(name).copied()
    }

    /// Accepts either a human name (`npc/rat#3`) or the arena form (`@4:1`).
    pub fn resolve(&self, text: &str) -> Option<ObjectId> {
        let text = text.trim();
        if let Some(id) = self.by_name(text) {
            return Some(id);
        }
        let (index, generation) = text.strip_prefix('@')?.split_once(':')?;
        let id = ObjectId::new(index.parse().ok()?, generation.parse().ok()?);
        self.contains(id).then_some(id)
    }

    pub fn name_of(&self, id: ObjectId) -> Option<&str> {
        self.get(id).map(|inst| inst.name.as_str())
    }

    pub fn len(&self) -> usize {
        self.live
    }

    pub fn is_empty(&self) -> bool {
        self.live == 0
    }

    /// Live instances in arena order.
    pub fn iter(&self) -> impl Iterator<Item = &Instance> {
        self.slots.iter().filter_map(|slot| slot.instance.as_ref())
    }

    pub fn ids(&self) -> Vec<ObjectId> {
        self.iter().map(|inst| inst.id).collect()
    }

    pub fn ids_of(&self, blueprint: &BlueprintId) -> Vec<ObjectId> {
        self.iter()
            .filter(|inst| &inst.blueprint == blueprint)
            .map(|inst| inst.id)
            .collect()
    }

    pub fn count_of(&self, blueprint: &BlueprintId) -> usize {
        self.iter().filter(|inst| &inst.blueprint == blueprint).count()
    }

    #[cfg(test)]
    /// Instances still bound to one specific compiled version.
    pub fn count_of_version(&self, blueprint: &BlueprintId, version: u64) -> usize {
        self.iter()
            .filter(|inst| &inst.blueprint == blueprint && inst.version() == version)
            .count()
    }
}

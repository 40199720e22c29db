use std::collections::{BTreeSet, HashMap};

use crate::error::MoveError;
use crate::instances::ObjectId;

/// Containment forest: every object has at most one container and no
/// container chain loops back on itself. Both directions are updated by the
/// same call so an object is never in two containers, or none by accident.
#[derive(Default, Clone, Debug)]
pub struct ContainerRegistry {
    container_of: HashMap<ObjectId, ObjectId>,
    members: HashMap<ObjectId, BTreeSet<ObjectId>>,
}

impl ContainerRegistry {
    pub fn container_of(&self, object: ObjectId) -> Option<ObjectId> {
        self.container_of.get(&object).copied()
    }

    pub fn members(&self, container: ObjectId) -> impl Iterator<Item = ObjectId> + '_ {
        self.members
            .get(&container)
            .into_iter()
            .flat_map(|set| set.iter().copied())
    }

    #[cfg(test)]
    pub fn member_count(&self, container: ObjectId) -> usize {
        self.members.get(&container).map_or(0, BTreeSet::len)
    }

    pub fn contains(&self, container: ObjectId, object: ObjectId) -> bool {
        self.container_of(object) == Some(container)
    }

    /// True when `ancestor` is `object` itself or any container above it.
    pub fn is_within(&self, object: ObjectId, ancestor: ObjectId) -> bool {
        let mut cursor = Some(object);
        while let Some(current) = cursor {
            if current == ancestor {
                return true;
            }
            cursor = self.container_of(current);
        }
        false
    }

    /// The only mutator of containment. `None` detaches the object.
    /// Returns the previous container.
    pub fn move_to(
        &mut self,
        object: ObjectId,
        destination: Option<ObjectId>,
    ) -> Result<Option<ObjectId>, MoveError> {
        if let Some(dest) = destination {
            if dest == object {
                return Err(MoveError::SelfContainment(object));
            }
            if self.is_within(dest, object) {
                return Err(MoveError::Cycle {
                    object,
                    destination: dest,
                });
            }
        }

        let previous = self.container_of.remove(&object);
        if let Some(old) = previous {
            if let Some(set) = self.members.get_mut(&old) {
                set.remove(&object);
                if set.is_empty() {
                    self.members.remove(&old);
                }
            }
        }
        if let Some(dest) = destination {
            self.container_of.insert(object, dest);
            self.members.entry(dest).or_default().insert(object);
        }
        Ok(previous)
    }

    /// Drops every edge touching `object`. Members are handed to the
    /// object's own container, or detached when it had none. Returns the
    /// rehomed members.
    pub fn remove(&mut self, object: ObjectId) -> Vec<ObjectId> {
        let parent = self.container_of(object);
        let orphans: Vec<ObjectId> = self.members(object).collect();
        for member in &orphans {
            // Parent is outside `object`'s subtree, so this cannot form a cycle.
            let _ = self.move_to(*member, parent);
        }
        let _ = self.move_to(object, None);
        orphans
    }

    pub fn edges(&self) -> impl Iterator<Item = (ObjectId, ObjectId)> + '_ {
        self.container_of.iter().map(|(m, c)| (*m, *c))
    }

    pub fn clear(&mut self) {
        self.container_of.clear();
        self.members.clear();
    }

    #[cfg(test)]
    fn assert_consistent(&self) {
        for (member, container) in &self.container_of {
            assert!(
                self.members
                    .get(container)
                    .is_some_and(|set| set.contains(member)),
                "member index missing {member:?} in {container:?}"
            );
            let mut steps = 0usize;
            let mut cursor = Some(*member);
            while let Some(current) = cursor {
                steps += 1;
                assert!(steps <= self.container_of.len() + 1, "cycle through {member:?}");
                cursor = self.container_of(current);
            }
        }
        for (container, set) in &self.members {
            assert!(!set.is_empty(), "empty member set left for {container:?}");
            for member in set {
                assert_eq!(self.container_of(*member), Some(*container));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::SmallRng;
    use rand::{Rng, SeedableRng};

    fn id(n: u32) -> ObjectId {
        ObjectId::new(n, 0)
    }

    #[test]
    fn move_updates_both_directions() {
        let mut reg = ContainerRegistry::default();
        assert_eq!(reg.move_to(id(1), Some(id(10))).expect("move"), None);
        assert_eq!(reg.move_to(id(1), Some(id(20))).expect("move"), Some(id(10)));
        assert_eq!(reg.container_of(id(1)), Some(id(20)));
        assert_eq!(reg.member_count(id(10)), 0);
        assert_eq!(reg.members(id(20)).collect::<Vec<_>>(), vec![id(1)]);
        reg.assert_consistent();
    }

    #[test]
    fn rejects_self_and_cyclic_moves() {
        let mut reg = ContainerRegistry::default();
        reg.move_to(id(2), Some(id(1))).expect("bag into room");
        reg.move_to(id(3), Some(id(2))).expect("coin into bag");
        assert!(matches!(
            reg.move_to(id(1), Some(id(1))),
            Err(MoveError::SelfContainment(_))
        ));
        assert!(matches!(
            reg.move_to(id(1), Some(id(3))),
            Err(MoveError::Cycle { .. })
        ));
        assert_eq!(reg.container_of(id(1)), None);
        reg.assert_consistent();
    }

    #[test]
    fn remove_rehomes_members_to_parent() {
        let mut reg = ContainerRegistry::default();
        reg.move_to(id(2), Some(id(1))).expect("move");
        reg.move_to(id(3), Some(id(2))).expect("move");
        reg.move_to(id(4), Some(id(2))).expect("move");
        let orphans = reg.remove(id(2));
        assert_eq!(orphans, vec![id(3), id(4)]);
        assert_eq!(reg.container_of(id(3)), Some(id(1)));
        assert_eq!(reg.container_of(id(2)), None);
        assert_eq!(reg.member_count(id(2)), 0);
        reg.assert_consistent();
    }

    #[test]
    fn random_moves_keep_forest_invariant() {
        let mut rng = SmallRng::seed_from_u64(0x5eed);
        let mut reg = ContainerRegistry::default();
        for _ in 0..5_000 {
            let object = id(rng.gen_range(0..24));
            let dest = if rng.gen_bool(0.1) {
                None
            } else {
                Some(id(rng.gen_range(0..24)))
            };
            let before = reg.container_of(object);
            match reg.move_to(object, dest) {
                Ok(_) => assert_eq!(reg.container_of(object), dest),
                Err(_) => assert_eq!(reg.container_of(object), before),
            }
        }
        reg.assert_consistent();
    }
}

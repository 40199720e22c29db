use std::cell::RefCell;
use std::collections::BTreeMap;
use std::rc::Rc;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::instances::ObjectId;

/// Randomness consumed by combat, flee and world code.
pub trait RandomSource {
    /// Uniform integer in `lo..=hi`.
    fn roll_range(&mut self, lo: i64, hi: i64) -> i64;
    /// True with probability `p`.
    fn chance(&mut self, p: f64) -> bool;
    /// Index in `0..len`; `len` is never zero.
    fn pick(&mut self, len: usize) -> usize;
}

pub type SharedRandom = Rc<RefCell<dyn RandomSource>>;

pub struct StdRandom(StdRng);

impl StdRandom {
    pub fn seeded(seed: u64) -> Self {
        Self(StdRng::seed_from_u64(seed))
    }

    pub fn from_entropy() -> Self {
        Self(StdRng::from_entropy())
    }
}

impl RandomSource for StdRandom {
    fn roll_range(&mut self, lo: i64, hi: i64) -> i64 {
        if lo >= hi {
            return lo;
        }
        self.0.gen_range(lo..=hi)
    }

    fn chance(&mut self, p: f64) -> bool {
        self.0.gen_bool(p.clamp(0.0, 1.0))
    }

    fn pick(&mut self, len: usize) -> usize {
        if len <= 1 {
            return 0;
        }
        self.0.gen_range(0..len)
    }
}

/// Replays queued outcomes, then falls back to fixed answers.
#[cfg(test)]
#[derive(Default)]
pub struct ScriptedRandom {
    pub rolls: std::collections::VecDeque<i64>,
    pub chances: std::collections::VecDeque<bool>,
    pub picks: std::collections::VecDeque<usize>,
    pub default_chance: bool,
}

#[cfg(test)]
impl ScriptedRandom {
    pub fn always(chance: bool) -> Self {
        Self {
            default_chance: chance,
            ..Self::default()
        }
    }
}

#[cfg(test)]
impl RandomSource for ScriptedRandom {
    fn roll_range(&mut self, lo: i64, hi: i64) -> i64 {
        self.rolls.pop_front().unwrap_or(lo).clamp(lo, hi.max(lo))
    }

    fn chance(&mut self, _p: f64) -> bool {
        self.chances.pop_front().unwrap_or(self.default_chance)
    }

    fn pick(&mut self, len: usize) -> usize {
        self.picks.pop_front().unwrap_or(0).min(len.saturating_sub(1))
    }
}

/// `weapon + attack modifier - armor - defend modifier`, never below 1.
pub fn compute_damage(weapon: i64, attack_mod: i64, armor: i64, defend_mod: i64) -> i64 {
    weapon
        .saturating_add(attack_mod)
        .saturating_sub(armor)
        .saturating_sub(defend_mod)
        .max(1)
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CombatPair {
    pub attacker: ObjectId,
    pub defender: ObjectId,
    pub next_round_ms: u64,
    seq: u64,
}

/// Active fights keyed by attacker: an object attacks at most one target.
#[derive(Default)]
pub struct CombatEngine {
    pairs: BTreeMap<ObjectId, CombatPair>,
    next_seq: u64,
}

impl CombatEngine {
    /// Starts (or retargets) `attacker`; the first round is due at `now_ms`.
    pub fn start(&mut self, attacker: ObjectId, defender: ObjectId, now_ms: u64) {
        let seq = self.next_seq;
        self.next_seq += 1;
        self.pairs.insert(
            attacker,
            CombatPair {
                attacker,
                defender,
                next_round_ms: now_ms,
                seq,
            },
        );
    }

    pub fn end_pair(&mut self, attacker: ObjectId) -> Option<CombatPair> {
        self.pairs.remove(&attacker)
    }

    /// Removes every pair `combatant` is part of, on either side.
    pub fn end(&mut self, combatant: ObjectId) -> Vec<CombatPair> {
        let ids: Vec<ObjectId> = self
            .pairs
            .values()
            .filter(|p| p.attacker == combatant || p.defender == combatant)
            .map(|p| p.attacker)
            .collect();
        ids.into_iter().filter_map(|id| self.pairs.remove(&id)).collect()
    }

    pub fn pair(&self, attacker: ObjectId) -> Option<&CombatPair> {
        self.pairs.get(&attacker)
    }

    pub fn target_of(&self, attacker: ObjectId) -> Option<ObjectId> {
        self.pairs.get(&attacker).map(|p| p.defender)
    }

    pub fn is_fighting(&self, object: ObjectId) -> bool {
        self.pairs
            .values()
            .any(|p| p.attacker == object || p.defender == object)
    }

    /// Attackers whose round is due, in `(due, start order)` order.
    pub fn due(&self, now_ms: u64) -> Vec<ObjectId> {
        let mut due: Vec<&CombatPair> = self
            .pairs
            .values()
            .filter(|p| p.next_round_ms <= now_ms)
            .collect();
        due.sort_by_key(|p| (p.next_round_ms, p.seq));
        due.into_iter().map(|p| p.attacker).collect()
    }

    pub fn schedule_next(&mut self, attacker: ObjectId, round_ms: u64) {
        if let Some(pair) = self.pairs.get_mut(&attacker) {
            pair.next_round_ms = pair.next_round_ms.saturating_add(round_ms.max(1));
        }
    }

    pub fn len(&self) -> usize {
        self.pairs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pairs.is_empty()
    }

    pub fn clear(&mut self) {
        self.pairs.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::SmallRng;

    fn obj(n: u32) -> ObjectId {
        ObjectId::new(n, 0)
    }

    #[test]
    fn damage_is_floored_at_one() {
        let mut rng = SmallRng::seed_from_u64(7);
        for _ in 0..10_000 {
            let weapon = rng.gen_range(-50..50);
            let attack = rng.gen_range(-50..50);
            let armor = rng.gen_range(-50..50);
            let defend = rng.gen_range(-50..50);
            let dmg = compute_damage(weapon, attack, armor, defend);
            assert_eq!(dmg, (weapon + attack - armor - defend).max(1));
            assert!(dmg >= 1);
        }
        assert_eq!(compute_damage(i64::MIN, 0, i64::MAX, 0), 1);
    }

    #[test]
    fn end_removes_both_directions() {
        let mut engine = CombatEngine::default();
        engine.start(obj(1), obj(2), 0);
        engine.start(obj(2), obj(1), 0);
        engine.start(obj(3), obj(4), 0);
        assert_eq!(engine.end(obj(1)).len(), 2);
        assert!(!engine.is_fighting(obj(2)));
        assert!(engine.is_fighting(obj(3)));
    }

    #[test]
    fn rounds_are_due_in_start_order() {
        let mut engine = CombatEngine::default();
        engine.start(obj(5), obj(1), 100);
        engine.start(obj(2), obj(5), 100);
        assert!(engine.due(99).is_empty());
        assert_eq!(engine.due(100), vec![obj(5), obj(2)]);
        engine.schedule_next(obj(5), 2_000);
        assert_eq!(engine.due(100), vec![obj(2)]);
        assert_eq!(engine.pair(obj(5)).map(|p| p.next_round_ms), Some(2_100));
    }

    #[test]
    fn std_random_stays_in_range() {
        let mut rng = StdRandom::seeded(42);
        for _ in 0..1_000 {
            let roll = rng.roll_range(3, 6);
            assert!((3..=6).contains(&roll));
            assert!(rng.pick(4) < 4);
        }
        assert_eq!(rng.roll_range(5, 5), 5);
        assert!(!rng.chance(0.0));
        assert!(rng.chance(1.0));
    }
}

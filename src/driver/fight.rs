use rhai::Dynamic;
use serde::Serialize;

use super::Driver;
use crate::blueprint::BlueprintId;
use crate::capability::Capability;
use crate::combat::compute_damage;
use crate::error::CombatError;
use crate::instances::ObjectId;
use crate::sandbox::HookKind;

const WEAPON_SLOT: &str = "weapon";

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum FleeOutcome {
    Escaped { exit: String, destination: String },
    Failed,
    NoExit,
}

impl Driver {
    fn is_alive(&self, id: ObjectId) -> bool {
        self.instances.get(id).is_some_and(|inst| {
            inst.capabilities.contains(Capability::Living) && inst.state.borrow().get_i64("hp", 0) > 0
        })
    }

    fn co_located(&self, a: ObjectId, b: ObjectId) -> bool {
        match self.containers.container_of(a) {
            Some(room) => self.containers.container_of(b) == Some(room),
            None => false,
        }
    }

    /// Engages `attacker` against `defender`. The first round is due on the
    /// current tick. A defender with no target of its own strikes back when
    /// retaliation is enabled.
    pub fn start_combat(&mut self, attacker: ObjectId, defender: ObjectId) -> Result<(), CombatError> {
        if attacker == defender {
            return Err(CombatError::SelfTarget);
        }
        if !self.is_alive(attacker) {
            return Err(CombatError::CannotFight);
        }
        let target = self.name_of(defender);
        if !self.instances.contains(defender) || !self.co_located(attacker, defender) {
            return Err(CombatError::NotHere(target));
        }
        let living = self
            .instances
            .get(defender)
            .is_some_and(|inst| inst.capabilities.contains(Capability::Living));
        if !living {
            return Err(CombatError::NotLiving(target));
        }
        if !self.is_alive(defender) {
            return Err(CombatError::AlreadyDead(target));
        }

        let now = self.clock.now_ms();
        self.combat.start(attacker, defender, now);
        if self.config.retaliate && self.combat.target_of(defender).is_none() {
            self.combat.start(defender, attacker, now);
        }
        tracing::debug!(attacker = %self.name_of(attacker), defender = %target, "combat started");
        Ok(())
    }

    /// Stops every fight `combatant` takes part in.
    pub fn end_combat(&mut self, combatant: ObjectId) -> usize {
        self.combat.end(combatant).len()
    }

    pub(crate) fn run_combat_rounds(&mut self, now_ms: u64) -> usize {
        let mut rounds = 0;
        for attacker in self.combat.due(now_ms) {
            let due = self
                .combat
                .pair(attacker)
                .is_some_and(|pair| pair.next_round_ms <= now_ms);
            if due && self.resolve_round(attacker) {
                rounds += 1;
            }
        }
        rounds
    }

    /// One swing from `attacker` at its current target. Returns false when
    /// the pair was ended instead because the target was lost.
    fn resolve_round(&mut self, attacker: ObjectId) -> bool {
        let Some(defender) = self.combat.target_of(attacker) else {
            return false;
        };
        if !self.is_alive(attacker) || !self.is_alive(defender) || !self.co_located(attacker, defender) {
            self.combat.end_pair(attacker);
            return false;
        }
        let attacker_name = self.name_of(attacker);
        let defender_name = self.name_of(defender);

        let (lo, hi) = self.weapon_range(attacker);
        let weapon = self.rng.borrow_mut().roll_range(lo, hi);
        let attack_mod = self
            .call_hook(
                attacker,
                Capability::AttackModifier,
                vec![Dynamic::from(defender_name.clone())],
                HookKind::CombatModifier,
            )
            .map_or(0, |outcome| outcome.as_int_or(0));
        let armor = self.armor_class(defender);
        let defend_mod = self
            .call_hook(
                defender,
                Capability::DefendModifier,
                vec![Dynamic::from(attacker_name.clone())],
                HookKind::CombatModifier,
            )
            .map_or(0, |outcome| outcome.as_int_or(0));
        let damage = compute_damage(weapon, attack_mod, armor, defend_mod);

        self.send(attacker, format!("You hit {defender_name} for {damage} damage."));
        self.send(defender, format!("{attacker_name} hits you for {damage} damage."));
        self.apply_damage(defender, damage, Some(attacker));

        if self.combat.pair(attacker).is_some() {
            self.combat.schedule_next(attacker, self.config.combat_round_ms);
        }
        true
    }

    /// `(damage_min, damage_max)` of the wielded weapon, falling back to the
    /// attacker's own keys.
    fn weapon_range(&self, attacker: ObjectId) -> (i64, i64) {
        let source = self
            .equipped_item(attacker, WEAPON_SLOT)
            .and_then(|item| self.instances.get(item))
            .or_else(|| self.instances.get(attacker));
        let Some(inst) = source else {
            return (1, 1);
        };
        let state = inst.state.borrow();
        let lo = state.get_i64("damage_min", 1);
        let hi = state.get_i64("damage_max", lo);
        (lo.min(hi), lo.max(hi))
    }

    fn armor_class(&self, wearer: ObjectId) -> i64 {
        let Some(inst) = self.instances.get(wearer) else {
            return 0;
        };
        let state = inst.state.borrow();
        let mut armor = state.get_i64("armor_class", 0);
        for item_name in state.get_string_map("equipment").values() {
            let Some(item) = self.resolve(item_name) else {
                continue;
            };
            if self.containers.container_of(item) != Some(wearer) {
                continue;
            }
            if let Some(worn) = self.instances.get(item) {
                armor = armor.saturating_add(worn.state.borrow().get_i64("armor_class", 0));
            }
        }
        armor
    }

    /// The item in `slot` of `wearer`'s equipment, if the wearer carries it.
    pub(crate) fn equipped_item(&self, wearer: ObjectId, slot: &str) -> Option<ObjectId> {
        let name = {
            let inst = self.instances.get(wearer)?;
            let state = inst.state.borrow();
            state.get_string_map("equipment").get(slot)?.clone()
        };
        let item = self.resolve(&name)?;
        (self.containers.container_of(item) == Some(wearer)).then_some(item)
    }

    /// Living objects' damage path: lowers `hp`, runs `on_damage`, and kills
    /// the victim when `hp` ends at or below zero. Returns true on death.
    pub fn apply_damage(&mut self, victim: ObjectId, amount: i64, attacker: Option<ObjectId>) -> bool {
        let Some(state) = self.instances.get(victim).map(|inst| inst.state.clone()) else {
            return false;
        };
        if state.borrow().get_i64("hp", 0) <= 0 {
            return false;
        }
        state.borrow_mut().add_i64("hp", -amount);

        let by = attacker.map(|a| self.name_of(a)).unwrap_or_default();
        self.call_hook(
            victim,
            Capability::Damage,
            vec![Dynamic::from(amount), Dynamic::from(by)],
            HookKind::Damage,
        );

        if state.borrow().get_i64("hp", 0) <= 0 {
            self.die(victim, attacker);
            return true;
        }
        false
    }

    fn die(&mut self, victim: ObjectId, killer: Option<ObjectId>) {
        self.combat.end(victim);
        let victim_name = self.name_of(victim);
        let worth = self
            .instances
            .get(victim)
            .map_or(0, |inst| inst.state.borrow().get_i64("max_hp", 0));
        let killer_name = killer.map(|k| self.name_of(k)).unwrap_or_default();

        if let Some(killer) = killer {
            if let Some(inst) = self.instances.get(killer) {
                inst.state.borrow_mut().add_i64("xp", worth);
            }
            self.send(killer, format!("You have slain {victim_name}."));
        }
        self.broadcast_from(victim, &format!("{victim_name} dies."));
        tracing::info!(victim = %victim_name, killer = %killer_name, xp = worth, "combatant died");

        self.call_hook(
            victim,
            Capability::Death,
            vec![Dynamic::from(killer_name)],
            HookKind::Death,
        );
        if let Some(killer) = killer {
            self.call_hook(
                killer,
                Capability::Kill,
                vec![Dynamic::from(victim_name)],
                HookKind::Kill,
            );
        }
    }

    /// Immediate escape attempt through a random exit of the actor's room.
    pub fn flee(&mut self, actor: ObjectId) -> Result<FleeOutcome, CombatError> {
        if !self.combat.is_fighting(actor) {
            return Err(CombatError::NotFighting);
        }
        let exits: Vec<(String, String)> = self
            .containers
            .container_of(actor)
            .and_then(|room| self.instances.get(room))
            .map(|room| room.state.borrow().get_string_map("exits").into_iter().collect())
            .unwrap_or_default();
        if exits.is_empty() {
            self.send(actor, "There is nowhere to run!");
            return Ok(FleeOutcome::NoExit);
        }

        let chance = self.config.flee_chance;
        if !self.rng.borrow_mut().chance(chance) {
            self.send(actor, "You fail to escape!");
            return Ok(FleeOutcome::Failed);
        }

        let pick = self.rng.borrow_mut().pick(exits.len());
        let (exit, target) = exits[pick.min(exits.len() - 1)].clone();
        let destination = match self.resolve(&target) {
            Some(id) => id,
            None => match self.load_object(&BlueprintId::from(target.as_str())) {
                Ok(id) => id,
                Err(err) => {
                    tracing::warn!(exit = %exit, target = %target, error = %err, "exit leads nowhere");
                    self.send(actor, "There is nowhere to run!");
                    return Ok(FleeOutcome::NoExit);
                }
            },
        };

        let actor_name = self.name_of(actor);
        let origin = self.containers.container_of(actor);
        if let Err(err) = self.move_object(actor, Some(destination)) {
            tracing::warn!(actor = %actor_name, error = %err, "flee move failed");
            self.send(actor, "There is nowhere to run!");
            return Ok(FleeOutcome::NoExit);
        }
        self.combat.end(actor);
        if let Some(room) = origin {
            self.broadcast_in(room, actor, &format!("{actor_name} flees {exit}."));
        }
        self.send(actor, format!("You flee {exit}."));
        Ok(FleeOutcome::Escaped {
            exit,
            destination: self.name_of(destination),
        })
    }
}

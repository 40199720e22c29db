mod commands;
mod fight;
mod reload;
mod tick;


use std::cell::RefCell;
use std::collections::{HashSet, VecDeque};
use std::rc::Rc;

use rhai::Dynamic;
use serde::Serialize;
use serde_json::Value;

use crate::blueprint::module::CompiledModule;
use crate::blueprint::{BlueprintId, BlueprintRegistry, BlueprintStatus, SourceProvider};
use crate::capability::Capability;
use crate::combat::{CombatEngine, SharedRandom, StdRandom};
use crate::config::DriverConfig;
use crate::containers::ContainerRegistry;
use crate::driver::commands::PlayerCommand;
use crate::error::{DriverError, MoveError};
use crate::instances::{InstanceRegistry, ObjectId};
use crate::sandbox::api::holds_fn_ptr;
use crate::sandbox::{CallContext, Effect, HookKind, Invocation, SandboxInvoker, SandboxLimits, WorldView};
use crate::scheduler::{CalloutId, GameClock, NewCallout, Scheduler};
use crate::state_store::StateStore;
use crate::validator::CapabilityValidator;

pub use commands::ConsoleCommand;

/// One line of text for the transport to deliver.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct OutboundMessage {
    pub to: ObjectId,
    pub recipient: String,
    pub text: String,
}

#[derive(Clone, Debug, Serialize)]
pub struct HookError {
    pub object: String,
    pub blueprint: BlueprintId,
    pub hook: String,
    pub message: String,
    pub timed_out: bool,
    pub at_ms: u64,
}

/// Most recent hook failures, oldest dropped first.
pub struct HookErrorLog {
    entries: VecDeque<HookError>,
    capacity: usize,
}

impl HookErrorLog {
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: VecDeque::new(),
            capacity: capacity.max(1),
        }
    }

    pub fn push(&mut self, entry: HookError) {
        self.entries.push_back(entry);
        while self.entries.len() > self.capacity {
            self.entries.pop_front();
        }
    }

    pub fn entries(&self) -> impl Iterator<Item = &HookError> {
        self.entries.iter()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }
}

#[derive(Clone, Debug, Serialize)]
pub struct HeartbeatStat {
    pub interval_ms: u64,
    pub next_due_ms: u64,
}

#[derive(Clone, Debug, Serialize)]
pub struct CalloutStat {
    pub id: CalloutId,
    pub method: String,
    pub due_ms: u64,
    pub repeat_ms: Option<u64>,
    pub pinned_version: Option<u64>,
}

#[derive(Clone, Debug, Serialize)]
pub struct ObjectStat {
    pub id: String,
    pub handle: String,
    pub blueprint: BlueprintId,
    pub version: u64,
    pub type_name: String,
    pub prototype: bool,
    pub capabilities: Vec<String>,
    pub environment: Option<String>,
    pub members: Vec<String>,
    pub state: Value,
    pub heartbeat: Option<HeartbeatStat>,
    pub fault_streak: u32,
    pub disabled_reason: Option<String>,
    pub callouts: Vec<CalloutStat>,
    pub fighting: Option<String>,
}

#[derive(Clone, Debug, Serialize)]
pub struct VersionStat {
    pub version: u64,
    pub state: crate::blueprint::VersionState,
    pub references: usize,
}

#[derive(Clone, Debug, Serialize)]
pub struct BlueprintSummary {
    pub id: BlueprintId,
    pub status: BlueprintStatus,
    pub active_version: Option<u64>,
    pub instances: usize,
    pub callouts: usize,
    pub clone_seq: u64,
    pub stale: bool,
    pub versions: Vec<VersionStat>,
    pub last_error: Option<String>,
}

#[derive(Clone, Debug, Serialize)]
#[serde(untagged)]
pub enum StatReport {
    Object(Box<ObjectStat>),
    Blueprint(BlueprintSummary),
}

/// The driver context: owns every subsystem and is the only thing that
/// calls into world code. Several drivers can coexist in one process.
pub struct Driver {
    config: DriverConfig,
    sandbox: SandboxInvoker,
    pub(crate) blueprints: BlueprintRegistry,
    pub(crate) instances: InstanceRegistry,
    pub(crate) containers: ContainerRegistry,
    scheduler: Scheduler,
    combat: CombatEngine,
    clock: GameClock,
    rng: SharedRandom,
    outbox: VecDeque<OutboundMessage>,
    commands: VecDeque<PlayerCommand>,
    errors: HookErrorLog,
    /// Blueprints whose instances are being rebound; dispatch defers them.
    reloading: HashSet<BlueprintId>,
    running_callout: Option<CalloutId>,
    running_cancelled: bool,
    world_generation: u64,
    view_cache: Option<(u64, Rc<WorldView>)>,
    next_reset_ms: u64,
}

impl Driver {
    pub fn new(config: DriverConfig, source: Box<dyn SourceProvider>) -> Self {
        let rng: SharedRandom = match config.rng_seed {
            Some(seed) => Rc::new(RefCell::new(StdRandom::seeded(seed))),
            None => Rc::new(RefCell::new(StdRandom::from_entropy())),
        };
        let sandbox = SandboxInvoker::new(SandboxLimits::from_config(&config));
        let validator = CapabilityValidator::new(&config.extra_forbidden_symbols);
        Self {
            blueprints: BlueprintRegistry::new(source, validator),
            sandbox,
            instances: InstanceRegistry::default(),
            containers: ContainerRegistry::default(),
            scheduler: Scheduler::default(),
            combat: CombatEngine::default(),
            clock: GameClock::default(),
            rng,
            outbox: VecDeque::new(),
            commands: VecDeque::new(),
            errors: HookErrorLog::new(config.max_error_log),
            reloading: HashSet::new(),
            running_callout: None,
            running_cancelled: false,
            world_generation: 0,
            view_cache: None,
            next_reset_ms: config.reset_interval_ms.max(1),
            config,
        }
    }

    #[cfg(test)]
    pub fn set_random(&mut self, rng: impl crate::combat::RandomSource + 'static) {
        self.rng = Rc::new(RefCell::new(rng));
    }

    pub fn config(&self) -> &DriverConfig {
        &self.config
    }

    pub fn now_ms(&self) -> u64 {
        self.clock.now_ms()
    }

    pub fn instances(&self) -> &InstanceRegistry {
        &self.instances
    }

    pub fn containers(&self) -> &ContainerRegistry {
        &self.containers
    }

    pub fn scheduler(&self) -> &Scheduler {
        &self.scheduler
    }

    pub fn combat(&self) -> &CombatEngine {
        &self.combat
    }

    pub fn blueprints(&self) -> &BlueprintRegistry {
        &self.blueprints
    }

    pub fn errors(&self) -> &HookErrorLog {
        &self.errors
    }

    pub fn clear_errors(&mut self) {
        self.errors.clear();
    }

    pub fn resolve(&self, text: &str) -> Option<ObjectId> {
        self.instances.resolve(text)
    }

    fn require(&self, text: &str) -> Result<ObjectId, DriverError> {
        self.resolve(text)
            .ok_or_else(|| DriverError::NoSuchObject(text.to_string()))
    }

    pub fn name_of(&self, id: ObjectId) -> String {
        self.instances
            .name_of(id)
            .map_or_else(|| id.to_string(), str::to_string)
    }

    #[cfg(test)]
    /// Copy of an object's state.
    pub fn state_of(&self, id: ObjectId) -> Option<StateStore> {
        self.instances.get(id).map(|inst| inst.state.borrow().clone())
    }

    #[cfg(test)]
    /// Operator/test write into an object's state, outside any hook.
    pub fn set_state(&mut self, id: ObjectId, key: &str, value: Value) -> bool {
        match self.instances.get(id) {
            Some(inst) => {
                inst.state.borrow_mut().set(key, value);
                true
            }
            None => false,
        }
    }

    pub fn drain_outbox(&mut self) -> Vec<OutboundMessage> {
        self.outbox.drain(..).collect()
    }

    // ---- blueprints & instances -------------------------------------

    /// Loads a blueprint on first reference. An already active blueprint is
    /// returned as is, even when its source has changed since.
    pub fn ensure_loaded(&mut self, id: &BlueprintId) -> Result<Rc<CompiledModule>, DriverError> {
        if let Some(module) = self.blueprints.active(id) {
            return Ok(module);
        }
        let module = self.blueprints.compile_candidate(&self.sandbox, id)?;
        self.blueprints.activate(module.clone());
        tracing::info!(blueprint = %id, version = module.version(), "blueprint loaded");
        Ok(module)
    }

    /// Creates a fresh, containerless clone and runs its load hook.
    pub fn clone_object(&mut self, blueprint: &BlueprintId) -> Result<ObjectId, DriverError> {
        let module = self.ensure_loaded(blueprint)?;
        let seq = self.blueprints.next_clone_seq(blueprint);
        let name = format!("{blueprint}#{seq}");
        let id = self.spawn(name, blueprint.clone(), module, StateStore::new());
        self.run_load_hook(id);
        Ok(id)
    }

    /// The prototype instance, named after the blueprint itself.
    pub fn load_object(&mut self, blueprint: &BlueprintId) -> Result<ObjectId, DriverError> {
        if let Some(id) = self.instances.by_name(blueprint.as_str()) {
            return Ok(id);
        }
        let module = self.ensure_loaded(blueprint)?;
        let id = self.spawn(
            blueprint.as_str().to_string(),
            blueprint.clone(),
            module,
            StateStore::new(),
        );
        self.run_load_hook(id);
        Ok(id)
    }

    fn spawn(
        &mut self,
        name: String,
        blueprint: BlueprintId,
        module: Rc<CompiledModule>,
        state: StateStore,
    ) -> ObjectId {
        let id = self.instances.insert(name, blueprint, module, state);
        self.sync_heartbeat(id);
        self.touch_world();
        id
    }

    pub(crate) fn run_load_hook(&mut self, id: ObjectId) {
        let Some(module) = self.instances.get(id).map(|inst| inst.module.clone()) else {
            return;
        };
        if module.handlers().has_arity("on_load", 0) {
            self.invoke_on(id, &module, "on_load", Vec::new(), HookKind::Load);
        }
    }

    /// Registers or drops the heartbeat to match the bound code.
    pub(crate) fn sync_heartbeat(&mut self, id: ObjectId) {
        let Some(inst) = self.instances.get(id) else {
            return;
        };
        if !inst.capabilities.contains(Capability::Heartbeat) || inst.disabled_reason.is_some() {
            self.scheduler.remove_heartbeat(id);
            return;
        }
        let interval = inst
            .module
            .heartbeat_interval_ms()
            .unwrap_or(self.config.heartbeat_interval_ms);
        match self.scheduler.heartbeat(id) {
            Some(hb) if hb.interval_ms == interval => {}
            _ => self
                .scheduler
                .register_heartbeat(id, interval, self.clock.now_ms()),
        }
    }

    /// Removes an object and everything scheduled for it. Its members move
    /// to its own container without enter/leave hooks.
    pub fn destruct(&mut self, id: ObjectId) -> Result<(), DriverError> {
        if !self.instances.contains(id) {
            return Err(DriverError::NoSuchObject(id.to_string()));
        }
        let purged = self.scheduler.purge_object(id);
        self.end_combat(id);
        self.containers.remove(id);
        let removed = self.instances.remove(id);
        self.touch_world();
        if let Some(inst) = removed {
            tracing::info!(object = %inst.name, purged, "object destructed");
        }
        self.try_unload();
        Ok(())
    }

    /// Moves `object` into `destination` (or out of everything), running
    /// leave hooks at the old location and enter hooks at the new one.
    pub fn move_object(
        &mut self,
        object: ObjectId,
        destination: Option<ObjectId>,
    ) -> Result<(), DriverError> {
        if !self.instances.contains(object) {
            return Err(MoveError::UnknownObject(object).into());
        }
        if let Some(dest) = destination {
            if !self.instances.contains(dest) {
                return Err(MoveError::UnknownObject(dest).into());
            }
        }
        if self.containers.container_of(object) == destination {
            return Ok(());
        }
        let previous = self.containers.move_to(object, destination)?;
        self.touch_world();

        let who = Dynamic::from(self.name_of(object));
        if let Some(old) = previous {
            let mut watchers = vec![old];
            watchers.extend(self.containers.members(old));
            for watcher in watchers {
                self.call_hook(watcher, Capability::Leave, vec![who.clone()], HookKind::Leave);
            }
        }
        if let Some(dest) = destination {
            let mut watchers = vec![dest];
            watchers.extend(self.containers.members(dest).filter(|m| *m != object));
            for watcher in watchers {
                self.call_hook(watcher, Capability::Enter, vec![who.clone()], HookKind::Enter);
            }
        }
        Ok(())
    }

    // ---- calling into world code ------------------------------------

    /// Calls a capability hook if the object implements it.
    pub(crate) fn call_hook(
        &mut self,
        object: ObjectId,
        capability: Capability,
        args: Vec<Dynamic>,
        kind: HookKind,
    ) -> Option<Invocation> {
        let (name, _) = capability.hook()?;
        let module = {
            let inst = self.instances.get(object)?;
            if !inst.capabilities.contains(capability) {
                return None;
            }
            inst.module.clone()
        };
        Some(self.invoke_on(object, &module, name, args, kind))
    }

    /// Runs `name` from `module` on behalf of `object`, then applies the
    /// buffered effects and records any failure.
    pub(crate) fn invoke_on(
        &mut self,
        object: ObjectId,
        module: &Rc<CompiledModule>,
        name: &str,
        args: Vec<Dynamic>,
        kind: HookKind,
    ) -> Invocation {
        let Some((this_name, state)) = self
            .instances
            .get(object)
            .map(|inst| (inst.name.clone(), inst.state.clone()))
        else {
            return Invocation::Faulted(format!("no such object {object}"));
        };
        let ctx = CallContext {
            this: object,
            this_name,
            state,
            world: self.world_view(),
            callout_ids: self.scheduler.id_source(),
            rng: self.rng.clone(),
            now_ms: self.clock.now_ms(),
            effects: Vec::new(),
        };
        let (outcome, ctx) = self.sandbox.invoke_in(ctx, module, name, args, kind);
        self.apply_effects(object, module, ctx.effects);
        if let Some(message) = outcome.failure() {
            self.record_failure(object, name, message, matches!(outcome, Invocation::TimedOut(_)));
        }
        outcome
    }

    fn record_failure(&mut self, object: ObjectId, hook: &str, message: String, timed_out: bool) {
        let (name, blueprint) = match self.instances.get(object) {
            Some(inst) => (inst.name.clone(), inst.blueprint.clone()),
            None => (object.to_string(), BlueprintId::from("")),
        };
        tracing::warn!(
            object = %name,
            blueprint = %blueprint,
            hook,
            timed_out,
            error = %message,
            "world code failed"
        );
        self.errors.push(HookError {
            object: name,
            blueprint,
            hook: hook.to_string(),
            message,
            timed_out,
            at_ms: self.clock.now_ms(),
        });
    }

    fn world_view(&mut self) -> Rc<WorldView> {
        if let Some((generation, view)) = &self.view_cache {
            if *generation == self.world_generation {
                return view.clone();
            }
        }
        let view = Rc::new(WorldView::build(&self.instances, &self.containers));
        self.view_cache = Some((self.world_generation, view.clone()));
        view
    }

    pub(crate) fn touch_world(&mut self) {
        self.world_generation += 1;
    }

    fn apply_effects(&mut self, object: ObjectId, module: &Rc<CompiledModule>, effects: Vec<Effect>) {
        let speaker = self.name_of(object);
        for effect in effects {
            match effect {
                Effect::Tell { to, text } => match self.resolve(&to) {
                    Some(target) => self.send(target, text),
                    None => tracing::debug!(object = %speaker, to = %to, "tell to unknown object dropped"),
                },
                Effect::Say { text } => {
                    let line = format!("{speaker} says: {text}");
                    self.broadcast_from(object, &line);
                }
                Effect::Emote { text } => {
                    let line = format!("{speaker} {text}");
                    self.broadcast_from(object, &line);
                }
                Effect::CallOut {
                    id,
                    method,
                    delay_ms,
                    args,
                    repeat,
                } => {
                    let Some(blueprint) = self.instances.get(object).map(|i| i.blueprint.clone()) else {
                        continue;
                    };
                    let pinned = args.iter().any(holds_fn_ptr).then(|| module.clone());
                    self.scheduler.insert(
                        id,
                        NewCallout {
                            target: object,
                            blueprint,
                            method,
                            args,
                            due_ms: self.clock.now_ms().saturating_add(delay_ms),
                            repeat_ms: repeat.then_some(delay_ms),
                            pinned,
                        },
                    );
                }
                Effect::Cancel { id } => {
                    let owned = self
                        .scheduler
                        .get(id)
                        .is_some_and(|callout| callout.target == object);
                    if owned {
                        self.scheduler.cancel(id);
                    } else if self.running_callout == Some(id) {
                        self.running_cancelled = true;
                    }
                }
            }
        }
    }

    pub(crate) fn send(&mut self, to: ObjectId, text: impl Into<String>) {
        self.outbox.push_back(OutboundMessage {
            to,
            recipient: self.name_of(to),
            text: text.into(),
        });
    }

    /// Everyone sharing `object`'s location, except `object`.
    fn broadcast_from(&mut self, object: ObjectId, line: &str) {
        if let Some(room) = self.containers.container_of(object) {
            self.broadcast_in(room, object, line);
        }
    }

    /// `room` and its members, except `skip`.
    pub(crate) fn broadcast_in(&mut self, room: ObjectId, skip: ObjectId, line: &str) {
        let mut audience = vec![room];
        audience.extend(self.containers.members(room).filter(|m| *m != skip));
        for target in audience {
            self.send(target, line.to_string());
        }
    }

    // ---- inspection ---------------------------------------------------

    pub fn stat_object(&self, id: ObjectId) -> Option<ObjectStat> {
        let inst = self.instances.get(id)?;
        let state = serde_json::to_value(&*inst.state.borrow()).unwrap_or(Value::Null);
        Some(ObjectStat {
            id: inst.name.clone(),
            handle: id.to_string(),
            blueprint: inst.blueprint.clone(),
            version: inst.version(),
            type_name: inst.module.type_name(),
            prototype: inst.is_prototype(),
            capabilities: inst.capabilities.labels(),
            environment: self.containers.container_of(id).map(|c| self.name_of(c)),
            members: self.containers.members(id).map(|m| self.name_of(m)).collect(),
            state,
            heartbeat: self.scheduler.heartbeat(id).map(|hb| HeartbeatStat {
                interval_ms: hb.interval_ms,
                next_due_ms: hb.next_due_ms,
            }),
            fault_streak: inst.fault_streak,
            disabled_reason: inst.disabled_reason.clone(),
            callouts: self
                .scheduler
                .callouts_for(id)
                .map(|c| CalloutStat {
                    id: c.id,
                    method: c.method.clone(),
                    due_ms: c.due_ms,
                    repeat_ms: c.repeat_ms,
                    pinned_version: c.pinned.as_ref().map(|m| m.version()),
                })
                .collect(),
            fighting: self.combat.target_of(id).map(|t| self.name_of(t)),
        })
    }

    pub fn blueprint_summary(&self, id: &BlueprintId) -> Option<BlueprintSummary> {
        let record = self.blueprints.get(id)?;
        Some(BlueprintSummary {
            id: record.id.clone(),
            status: record.status,
            active_version: record.active_version(),
            instances: self.instances.count_of(id),
            callouts: self.scheduler.callouts_of(id),
            clone_seq: record.clone_seq(),
            stale: self.blueprints.is_stale(id),
            versions: record
                .versions
                .iter()
                .map(|v| VersionStat {
                    version: v.version,
                    state: v.state,
                    references: v.live_references(),
                })
                .collect(),
            last_error: record.last_error.clone(),
        })
    }

    pub fn list_blueprints(&self) -> Vec<BlueprintSummary> {
        self.blueprints
            .iter()
            .filter_map(|record| self.blueprint_summary(&record.id))
            .collect()
    }

    /// `stat <id>`: an object by name or handle, else a blueprint.
    pub fn stat(&self, text: &str) -> Result<StatReport, DriverError> {
        if let Some(id) = self.resolve(text) {
            if let Some(stat) = self.stat_object(id) {
                return Ok(StatReport::Object(Box::new(stat)));
            }
        }
        self.blueprint_summary(&BlueprintId::from(text))
            .map(StatReport::Blueprint)
            .ok_or_else(|| DriverError::NoSuchObject(text.to_string()))
    }
}

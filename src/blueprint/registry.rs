use std::collections::BTreeMap;
use std::rc::{Rc, Weak};
use std::time::SystemTime;

use rhai::Array;
use serde::Serialize;

use super::module::CompiledModule;
use super::{BlueprintId, SourceProvider};
use crate::capability::{Capability, CapabilitySet};
use crate::error::{CompileError, LoadError};
use crate::sandbox::{HookKind, Invocation, SandboxInvoker};
use crate::validator::CapabilityValidator;

/// Unloaded versions kept in a blueprint's history for `stat`.
const UNLOADED_HISTORY: u64 = 8;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BlueprintStatus {
    Unloaded,
    Compiling,
    Active,
    Rejected,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum VersionState {
    Active,
    Draining,
    Unloaded,
}

pub struct VersionRecord {
    pub version: u64,
    pub state: VersionState,
    module: Weak<CompiledModule>,
}

impl VersionRecord {
    /// Holders other than the registry: instances and pinned callouts.
    pub fn live_references(&self) -> usize {
        self.module.strong_count()
    }
}

pub struct BlueprintRecord {
    pub id: BlueprintId,
    pub status: BlueprintStatus,
    pub versions: Vec<VersionRecord>,
    pub source_modified: Option<SystemTime>,
    pub last_error: Option<String>,
    active: Option<Rc<CompiledModule>>,
    attempted_modified: Option<SystemTime>,
    next_version: u64,
    clone_seq: u64,
}

impl BlueprintRecord {
    fn new(id: BlueprintId) -> Self {
        Self {
            id,
            status: BlueprintStatus::Unloaded,
            versions: Vec::new(),
            source_modified: None,
            last_error: None,
            active: None,
            attempted_modified: None,
            next_version: 1,
            clone_seq: 0,
        }
    }

    pub fn active(&self) -> Option<&Rc<CompiledModule>> {
        self.active.as_ref()
    }

    pub fn active_version(&self) -> Option<u64> {
        self.active.as_ref().map(|m| m.version())
    }

    pub fn clone_seq(&self) -> u64 {
        self.clone_seq
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ReloadOutcome {
    Unchanged,
    Reloaded,
}

#[derive(Clone, Debug, Serialize)]
pub struct ReloadResult {
    pub blueprint: BlueprintId,
    pub outcome: ReloadOutcome,
    pub old_version: Option<u64>,
    pub new_version: Option<u64>,
    pub rebound: usize,
    pub hook_failures: usize,
    pub callouts_retargeted: usize,
    pub callouts_pinned: usize,
}

impl ReloadResult {
    pub fn unchanged(blueprint: BlueprintId, version: Option<u64>) -> Self {
        Self {
            blueprint,
            outcome: ReloadOutcome::Unchanged,
            old_version: version,
            new_version: version,
            rebound: 0,
            hook_failures: 0,
            callouts_retargeted: 0,
            callouts_pinned: 0,
        }
    }
}

/// Compiles, screens and links blueprint versions and tracks which versions
/// are still alive. Instances and callouts own the modules; the registry
/// holds the active version strongly and older ones weakly.
pub struct BlueprintRegistry {
    records: BTreeMap<BlueprintId, BlueprintRecord>,
    source: Box<dyn SourceProvider>,
    validator: CapabilityValidator,
}

impl BlueprintRegistry {
    pub fn new(source: Box<dyn SourceProvider>, validator: CapabilityValidator) -> Self {
        Self {
            records: BTreeMap::new(),
            source,
            validator,
        }
    }

    pub fn get(&self, id: &BlueprintId) -> Option<&BlueprintRecord> {
        self.records.get(id)
    }

    pub fn iter(&self) -> impl Iterator<Item = &BlueprintRecord> {
        self.records.values()
    }

    pub fn active(&self, id: &BlueprintId) -> Option<Rc<CompiledModule>> {
        self.records.get(id).and_then(|r| r.active.clone())
    }

    pub fn is_active(&self, id: &BlueprintId) -> bool {
        self.records
            .get(id)
            .is_some_and(|r| r.status == BlueprintStatus::Active && r.active.is_some())
    }

    /// True when the source moved on since the last compile attempt.
    pub fn is_stale(&self, id: &BlueprintId) -> bool {
        let current = self.source.modified(id);
        match self.records.get(id) {
            Some(record) => current.is_some() && current != record.attempted_modified,
            None => current.is_some(),
        }
    }

    /// Read, compile, screen and link a new version without activating it.
    /// A failure is recorded on the blueprint but leaves its active version
    /// in place.
    pub fn compile_candidate(
        &mut self,
        sandbox: &SandboxInvoker,
        id: &BlueprintId,
    ) -> Result<Rc<CompiledModule>, LoadError> {
        let record = self
            .records
            .entry(id.clone())
            .or_insert_with(|| BlueprintRecord::new(id.clone()));
        let previous_status = record.status;
        record.status = BlueprintStatus::Compiling;

        let result = build_module(
            sandbox,
            &self.validator,
            self.source.as_ref(),
            id,
            record.next_version,
        );
        match result {
            Ok((module, modified)) => {
                record.next_version += 1;
                record.attempted_modified = Some(modified);
                record.last_error = None;
                record.status = previous_status;
                Ok(module)
            }
            Err(err) => {
                record.attempted_modified = self.source.modified(id);
                record.last_error = Some(err.to_string());
                record.status = if record.active.is_some() {
                    BlueprintStatus::Active
                } else {
                    BlueprintStatus::Rejected
                };
                tracing::warn!(blueprint = %id, error = %err, "blueprint rejected");
                Err(err)
            }
        }
    }

    /// Makes `module` the active version. The previous one starts draining.
    pub fn activate(&mut self, module: Rc<CompiledModule>) {
        let modified = self.source.modified(module.blueprint());
        let id = module.blueprint().clone();
        let record = self
            .records
            .entry(id.clone())
            .or_insert_with(|| BlueprintRecord::new(id));
        for version in &mut record.versions {
            if version.state == VersionState::Active {
                version.state = VersionState::Draining;
            }
        }
        record.versions.push(VersionRecord {
            version: module.version(),
            state: VersionState::Active,
            module: Rc::downgrade(&module),
        });
        record.source_modified = modified;
        record.status = BlueprintStatus::Active;
        tracing::info!(blueprint = %record.id, version = module.version(), "blueprint active");
        record.active = Some(module);
    }

    /// Promotes draining versions nobody holds any more to unloaded.
    /// Returns the `(blueprint, version)` pairs unloaded by this call.
    pub fn collect_unloaded(&mut self) -> Vec<(BlueprintId, u64)> {
        let mut unloaded = Vec::new();
        for record in self.records.values_mut() {
            for version in &mut record.versions {
                if version.state == VersionState::Draining && version.live_references() == 0 {
                    version.state = VersionState::Unloaded;
                    tracing::info!(blueprint = %record.id, version = version.version, "version unloaded");
                    unloaded.push((record.id.clone(), version.version));
                }
            }
            let floor = record.next_version.saturating_sub(UNLOADED_HISTORY);
            record
                .versions
                .retain(|v| v.state != VersionState::Unloaded || v.version >= floor);
        }
        unloaded
    }

    /// Drops the active version. The caller has checked that nothing uses
    /// the blueprint.
    pub fn unload(&mut self, id: &BlueprintId) -> bool {
        let Some(record) = self.records.get_mut(id) else {
            return false;
        };
        let Some(module) = record.active.take() else {
            return false;
        };
        for version in &mut record.versions {
            if version.state == VersionState::Active {
                version.state = VersionState::Draining;
            }
        }
        record.status = BlueprintStatus::Unloaded;
        drop(module);
        self.collect_unloaded();
        tracing::info!(blueprint = %id, "blueprint unloaded");
        true
    }

    pub fn next_clone_seq(&mut self, id: &BlueprintId) -> u64 {
        let record = self
            .records
            .entry(id.clone())
            .or_insert_with(|| BlueprintRecord::new(id.clone()));
        record.clone_seq += 1;
        record.clone_seq
    }

    /// Keeps future clone suffixes above `seen`.
    pub fn advance_clone_seq(&mut self, id: &BlueprintId, seen: u64) {
        if let Some(record) = self.records.get_mut(id) {
            record.clone_seq = record.clone_seq.max(seen);
        }
    }
}

impl<S: SourceProvider> SourceProvider for std::rc::Rc<std::cell::RefCell<S>> {
    fn read(&self, blueprint: &BlueprintId) -> Result<super::SourceUnit, LoadError> {
        self.borrow().read(blueprint)
    }

    fn modified(&self, blueprint: &BlueprintId) -> Option<SystemTime> {
        self.borrow().modified(blueprint)
    }

    fn list(&self) -> Vec<BlueprintId> {
        self.borrow().list()
    }
}

fn build_module(
    sandbox: &SandboxInvoker,
    validator: &CapabilityValidator,
    source: &dyn SourceProvider,
    id: &BlueprintId,
    version: u64,
) -> Result<(Rc<CompiledModule>, SystemTime), LoadError> {
    let unit = source.read(id)?;
    let ast = sandbox.compile(id, &unit.text)?;
    validator
        .validate(&ast)
        .map_err(|violations| LoadError::Capability {
            blueprint: id.clone(),
            violations,
        })?;

    let probe = CompiledModule::link(id.clone(), version, ast, CapabilitySet::empty(), None);
    let declared = declared_kinds(sandbox, &probe)?;
    let heartbeat_ms = declared_heartbeat(sandbox, &probe);
    let ast = probe.ast().clone();
    let module = CompiledModule::link(id.clone(), version, ast, declared, heartbeat_ms);
    Ok((Rc::new(module), unit.modified))
}

fn declared_kinds(
    sandbox: &SandboxInvoker,
    probe: &CompiledModule,
) -> Result<CapabilitySet, LoadError> {
    if !probe.handlers().has_arity("capabilities", 0) {
        return Ok(CapabilitySet::empty());
    }
    let semantic = |message: String| {
        LoadError::Compile(CompileError {
            blueprint: probe.blueprint().clone(),
            message,
            line: None,
            column: None,
        })
    };
    let labels = match sandbox.invoke(probe, "capabilities", Vec::new(), HookKind::Declaration) {
        Invocation::Completed(value) => value
            .try_cast::<Array>()
            .ok_or_else(|| semantic("capabilities() must return an array".to_string()))?,
        other => {
            return Err(semantic(format!(
                "capabilities() failed: {}",
                other.failure().unwrap_or_default()
            )))
        }
    };
    let mut set = CapabilitySet::empty();
    for label in labels {
        let text = label.to_string();
        match Capability::parse(&text) {
            Some(cap) if cap.is_kind() => set.insert(cap),
            _ => return Err(semantic(format!("unknown capability `{text}`"))),
        }
    }
    Ok(set)
}

fn declared_heartbeat(sandbox: &SandboxInvoker, probe: &CompiledModule) -> Option<u64> {
    if !probe.handlers().has_arity("heartbeat_interval", 0) {
        return None;
    }
    let ms = sandbox
        .invoke(probe, "heartbeat_interval", Vec::new(), HookKind::Declaration)
        .as_int_or(0);
    (ms > 0).then_some(ms as u64)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blueprint::MemorySource;
    use crate::sandbox::SandboxLimits;
    use std::cell::RefCell;

    fn setup(source: MemorySource) -> (BlueprintRegistry, Rc<RefCell<MemorySource>>, SandboxInvoker) {
        let shared = Rc::new(RefCell::new(source));
        let registry = BlueprintRegistry::new(Box::new(shared.clone()), CapabilityValidator::new(&[]));
        (registry, shared, SandboxInvoker::new(SandboxLimits::default()))
    }

    #[test]
    fn compile_links_declared_capabilities() {
        let (mut reg, _, sandbox) = setup(MemorySource::new().with(
            "npc/rat",
            r#"
                fn capabilities() { ["living"] }
                fn heartbeat_interval() { 500 }
                fn heartbeat() {}
            "#,
        ));
        let id = BlueprintId::from("npc/rat");
        let module = reg.compile_candidate(&sandbox, &id).expect("compile");
        let caps = module.capabilities();
        assert!(caps.contains(Capability::Living));
        assert!(caps.contains(Capability::Heartbeat));
        assert_eq!(module.heartbeat_interval_ms(), Some(500));
        reg.activate(module);
        assert!(reg.is_active(&id));
        assert!(!reg.is_stale(&id));
    }

    #[test]
    fn rejected_first_load_is_recorded() {
        let (mut reg, _, sandbox) =
            setup(MemorySource::new().with("npc/bad", "fn on_load() { exec(\"rm\"); }"));
        let id = BlueprintId::from("npc/bad");
        let err = reg.compile_candidate(&sandbox, &id).err().expect("rejected");
        assert_eq!(err.violations()[0].symbol, "exec");
        let record = reg.get(&id).expect("record kept");
        assert_eq!(record.status, BlueprintStatus::Rejected);
        assert!(record.last_error.as_deref().is_some_and(|e| e.contains("exec")));
        assert!(reg.active(&id).is_none());
    }

    #[test]
    fn unknown_declared_kind_is_rejected() {
        let (mut reg, _, sandbox) =
            setup(MemorySource::new().with("obj/odd", "fn capabilities() { [\"wizard\"] }"));
        let err = reg
            .compile_candidate(&sandbox, &BlueprintId::from("obj/odd"))
            .err()
            .expect("rejected");
        assert!(err.to_string().contains("wizard"));
    }

    #[test]
    fn replaced_version_unloads_when_last_holder_drops() {
        let (mut reg, src, sandbox) = setup(MemorySource::new().with("obj/rock", "fn on_load() {}"));
        let id = BlueprintId::from("obj/rock");
        let v1 = reg.compile_candidate(&sandbox, &id).expect("v1");
        reg.activate(v1.clone());
        let holder = v1.clone();
        drop(v1);

        src.borrow_mut().set("obj/rock", "fn on_load() { }");
        assert!(reg.is_stale(&id));
        let v2 = reg.compile_candidate(&sandbox, &id).expect("v2");
        assert_eq!(v2.version(), 2);
        reg.activate(v2);

        assert!(reg.collect_unloaded().is_empty(), "v1 still held");
        drop(holder);
        assert_eq!(reg.collect_unloaded(), vec![(id.clone(), 1)]);
        assert_eq!(reg.active(&id).map(|m| m.version()), Some(2));
    }

    #[test]
    fn clone_sequence_only_moves_forward() {
        let (mut reg, _, _) = setup(MemorySource::new());
        let id = BlueprintId::from("npc/rat");
        assert_eq!(reg.next_clone_seq(&id), 1);
        reg.advance_clone_seq(&id, 9);
        reg.advance_clone_seq(&id, 3);
        assert_eq!(reg.next_clone_seq(&id), 10);
    }
}

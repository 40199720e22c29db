use rhai::Dynamic;

use super::Driver;
use crate::blueprint::{BlueprintId, BlueprintStatus, ReloadOutcome, ReloadResult};
use crate::error::DriverError;
use crate::sandbox::{HookKind, Invocation};

impl Driver {
    /// Recompiles `blueprint` and rebinds every instance to the new version.
    ///
    /// Nothing is touched unless the new source compiles and passes the
    /// capability screen. Each instance keeps its state store; the new code
    /// sees it through `on_reload(old_type_name)` when defined, `on_load`
    /// otherwise. Callouts follow the new version unless their arguments
    /// hold function pointers into the old one, in which case they pin it
    /// until they are gone.
    pub fn reload(&mut self, blueprint: &BlueprintId, force: bool) -> Result<ReloadResult, DriverError> {
        if self.blueprints.get(blueprint).is_none() {
            return Err(DriverError::UnknownBlueprint(blueprint.clone()));
        }
        let old = self.blueprints.active(blueprint);
        if !force && !self.blueprints.is_stale(blueprint) {
            return Ok(ReloadResult::unchanged(
                blueprint.clone(),
                old.as_ref().map(|m| m.version()),
            ));
        }

        let module = self.blueprints.compile_candidate(&self.sandbox, blueprint)?;
        let mut result = ReloadResult {
            blueprint: blueprint.clone(),
            outcome: ReloadOutcome::Reloaded,
            old_version: old.as_ref().map(|m| m.version()),
            new_version: Some(module.version()),
            rebound: 0,
            hook_failures: 0,
            callouts_retargeted: 0,
            callouts_pinned: 0,
        };
        drop(old);

        self.reloading.insert(blueprint.clone());
        self.blueprints.activate(module.clone());

        for id in self.instances.ids_of(blueprint) {
            let Some(old_type) = self.instances.get(id).map(|inst| inst.module.type_name()) else {
                continue;
            };
            let outcome = if module.handlers().has_arity("on_reload", 1) {
                Some(self.invoke_on(id, &module, "on_reload", vec![Dynamic::from(old_type)], HookKind::Reload))
            } else if module.handlers().has_arity("on_load", 0) {
                Some(self.invoke_on(id, &module, "on_load", Vec::new(), HookKind::Reload))
            } else {
                None
            };
            if matches!(outcome, Some(Invocation::Faulted(_) | Invocation::TimedOut(_))) {
                result.hook_failures += 1;
            }

            if let Some(inst) = self.instances.get_mut(id) {
                inst.module = module.clone();
                inst.capabilities = module.capabilities();
                inst.fault_streak = 0;
                inst.disabled_reason = None;
            }
            self.sync_heartbeat(id);
            result.rebound += 1;
        }

        for callout in self.scheduler.iter().filter(|c| &c.blueprint == blueprint) {
            match callout.pinned.as_ref().map(|m| m.version()) {
                Some(version) if version != module.version() => result.callouts_pinned += 1,
                _ => result.callouts_retargeted += 1,
            }
        }

        self.reloading.remove(blueprint);
        self.touch_world();
        self.try_unload();
        tracing::info!(
            blueprint = %blueprint,
            old_version = ?result.old_version,
            new_version = ?result.new_version,
            rebound = result.rebound,
            hook_failures = result.hook_failures,
            pinned = result.callouts_pinned,
            "blueprint reloaded"
        );
        Ok(result)
    }

    /// Reloads every loaded blueprint whose source changed. Failures are
    /// reported per blueprint and never stop the sweep.
    pub fn update(&mut self) -> Vec<(BlueprintId, Result<ReloadResult, String>)> {
        let stale: Vec<BlueprintId> = self
            .blueprints
            .iter()
            .filter(|record| record.status != BlueprintStatus::Unloaded)
            .map(|record| record.id.clone())
            .filter(|id| self.blueprints.is_stale(id))
            .collect();
        stale
            .into_iter()
            .map(|id| {
                let outcome = self.reload(&id, false).map_err(|err| err.to_string());
                (id, outcome)
            })
            .collect()
    }

    /// Explicit unload. Refused while any instance or callout still uses the
    /// blueprint.
    pub fn unload(&mut self, blueprint: &BlueprintId) -> Result<(), DriverError> {
        if !self.blueprints.is_active(blueprint) {
            return Err(DriverError::UnknownBlueprint(blueprint.clone()));
        }
        let instances = self.instances.count_of(blueprint);
        let callouts = self.scheduler.callouts_of(blueprint);
        if instances > 0 || callouts > 0 {
            return Err(DriverError::BlueprintInUse {
                blueprint: blueprint.clone(),
                instances,
                callouts,
            });
        }
        self.scheduler.purge_blueprint(blueprint);
        self.blueprints.unload(blueprint);
        Ok(())
    }

    /// Releases versions that no instance or callout holds any more.
    pub(crate) fn try_unload(&mut self) {
        self.blueprints.collect_unloaded();
    }
}

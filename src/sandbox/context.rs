use std::cell::{Cell, RefCell};
use std::collections::BTreeMap;
use std::rc::Rc;

use rhai::{Dynamic, EvalAltResult};

use crate::capability::CapabilitySet;
use crate::combat::SharedRandom;
use crate::containers::ContainerRegistry;
use crate::instances::{InstanceRegistry, ObjectId};
use crate::scheduler::CalloutId;
use crate::state_store::StateHandle;

/// Outbound request buffered during a call and applied by the driver once
/// the call has returned, whatever its outcome.
#[derive(Clone, Debug)]
pub enum Effect {
    Tell {
        to: String,
        text: String,
    },
    Say {
        text: String,
    },
    Emote {
        text: String,
    },
    CallOut {
        id: CalloutId,
        method: String,
        delay_ms: u64,
        args: Vec<Dynamic>,
        repeat: bool,
    },
    Cancel {
        id: CalloutId,
    },
}

pub struct ViewEntry {
    pub id: ObjectId,
    pub capabilities: CapabilitySet,
    pub state: StateHandle,
    pub container: Option<String>,
    pub members: Vec<String>,
}

/// Read-only picture of the world handed to world code. Rebuilt by the
/// driver only when objects or containment change; state is shared live.
#[derive(Default)]
pub struct WorldView {
    objects: BTreeMap<String, ViewEntry>,
}

impl WorldView {
    pub fn build(instances: &InstanceRegistry, containers: &ContainerRegistry) -> Self {
        let name_of = |id: ObjectId| instances.name_of(id).map(str::to_string);
        let objects = instances
            .iter()
            .map(|inst| {
                let entry = ViewEntry {
                    id: inst.id,
                    capabilities: inst.capabilities,
                    state: inst.state.clone(),
                    container: containers.container_of(inst.id).and_then(name_of),
                    members: containers.members(inst.id).filter_map(name_of).collect(),
                };
                (inst.name.clone(), entry)
            })
            .collect();
        Self { objects }
    }

    pub fn get(&self, name: &str) -> Option<&ViewEntry> {
        self.objects.get(name)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.objects.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.objects.len()
    }

    pub fn is_empty(&self) -> bool {
        self.objects.is_empty()
    }
}

pub struct CallContext {
    pub this: ObjectId,
    pub this_name: String,
    pub state: StateHandle,
    pub world: Rc<WorldView>,
    pub callout_ids: Rc<Cell<u64>>,
    pub rng: SharedRandom,
    pub now_ms: u64,
    pub effects: Vec<Effect>,
}

impl CallContext {
    pub fn next_callout_id(&self) -> CalloutId {
        let id = self.callout_ids.get() + 1;
        self.callout_ids.set(id);
        CalloutId(id)
    }
}

thread_local! {
    static CALL_CONTEXT: RefCell<Vec<CallContext>> = const { RefCell::new(Vec::new()) };
}

pub(crate) fn enter(ctx: CallContext) {
    CALL_CONTEXT.with(|stack| stack.borrow_mut().push(ctx));
}

pub(crate) fn leave() -> Option<CallContext> {
    CALL_CONTEXT.with(|stack| stack.borrow_mut().pop())
}

/// Runs `f` against the innermost context, failing the script call when
/// world code runs without an object (e.g. inside a declaration hook).
pub(crate) fn with_context<R>(
    f: impl FnOnce(&mut CallContext) -> R,
) -> Result<R, Box<EvalAltResult>> {
    CALL_CONTEXT.with(|stack| {
        let mut stack = stack.borrow_mut();
        match stack.last_mut() {
            Some(ctx) => Ok(f(ctx)),
            None => Err("world API is not available outside an object".into()),
        }
    })
}

pub(crate) fn current_name() -> Option<String> {
    CALL_CONTEXT.with(|stack| stack.borrow().last().map(|ctx| ctx.this_name.clone()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blueprint::module::CompiledModule;
    use crate::blueprint::BlueprintId;
    use crate::combat::StdRandom;
    use crate::state_store::StateStore;

    #[test]
    fn world_view_reports_names_and_containment() {
        let mut instances = InstanceRegistry::default();
        let module = Rc::new(CompiledModule::for_tests(BlueprintId::from("room/hall"), 1));
        let room = instances.insert(
            "room/hall".into(),
            BlueprintId::from("room/hall"),
            module.clone(),
            StateStore::new(),
        );
        let rat = instances.insert(
            "room/hall#1".into(),
            BlueprintId::from("room/hall"),
            module,
            StateStore::new(),
        );
        let mut containers = ContainerRegistry::default();
        containers.move_to(rat, Some(room)).expect("move");

        let view = WorldView::build(&instances, &containers);
        assert_eq!(view.len(), 2);
        let hall = view.get("room/hall").expect("hall");
        assert_eq!(hall.members, vec!["room/hall#1".to_string()]);
        assert_eq!(
            view.get("room/hall#1").and_then(|e| e.container.clone()),
            Some("room/hall".to_string())
        );
    }

    #[test]
    fn context_stack_is_scoped() {
        assert!(with_context(|_| ()).is_err());
        let rng: SharedRandom = Rc::new(RefCell::new(StdRandom::seeded(1)));
        enter(CallContext {
            this: ObjectId::new(0, 0),
            this_name: "npc/rat#1".into(),
            state: StateStore::new().into_handle(),
            world: Rc::new(WorldView::default()),
            callout_ids: Rc::new(Cell::new(0)),
            rng,
            now_ms: 0,
            effects: Vec::new(),
        });
        assert_eq!(current_name().as_deref(), Some("npc/rat#1"));
        let id = with_context(|ctx| ctx.next_callout_id()).expect("context");
        assert_eq!(id, CalloutId(1));
        assert!(leave().is_some());
        assert!(current_name().is_none());
    }
}

use std::collections::{BTreeMap, BTreeSet};

use rhai::AST;

use super::BlueprintId;
use crate::capability::{Capability, CapabilitySet};

/// Named entry points of one compiled version: function name to the arities
/// it is defined with. Callouts are dispatched through this table by name.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct HandlerTable {
    handlers: BTreeMap<String, BTreeSet<usize>>,
}

impl HandlerTable {
    pub fn from_ast(ast: &AST) -> Self {
        let mut handlers: BTreeMap<String, BTreeSet<usize>> = BTreeMap::new();
        for meta in ast.iter_functions() {
            handlers
                .entry(meta.name.to_string())
                .or_default()
                .insert(meta.params.len());
        }
        Self { handlers }
    }

    pub fn has(&self, name: &str) -> bool {
        self.handlers.contains_key(name)
    }

    pub fn has_arity(&self, name: &str, arity: usize) -> bool {
        self.handlers
            .get(name)
            .is_some_and(|arities| arities.contains(&arity))
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.handlers.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}

/// One linked, independently unloadable version of a blueprint. Instances
/// and pinned callouts hold it through `Rc`; the version is unloaded when the
/// last holder lets go.
pub struct CompiledModule {
    blueprint: BlueprintId,
    version: u64,
    ast: AST,
    handlers: HandlerTable,
    declared: CapabilitySet,
    heartbeat_interval_ms: Option<u64>,
}

impl CompiledModule {
    pub fn link(
        blueprint: BlueprintId,
        version: u64,
        ast: AST,
        declared: CapabilitySet,
        heartbeat_interval_ms: Option<u64>,
    ) -> Self {
        let handlers = HandlerTable::from_ast(&ast);
        Self {
            blueprint,
            version,
            ast,
            handlers,
            declared,
            heartbeat_interval_ms,
        }
    }

    #[cfg(test)]
    pub fn for_tests(blueprint: BlueprintId, version: u64) -> Self {
        Self::link(blueprint, version, AST::empty(), CapabilitySet::empty(), None)
    }

    pub fn blueprint(&self) -> &BlueprintId {
        &self.blueprint
    }

    pub fn version(&self) -> u64 {
        self.version
    }

    /// `<blueprint>@<version>`, handed to `on_reload` of the next version.
    pub fn type_name(&self) -> String {
        format!("{}@{}", self.blueprint, self.version)
    }

    pub fn ast(&self) -> &AST {
        &self.ast
    }

    pub fn handlers(&self) -> &HandlerTable {
        &self.handlers
    }

    pub fn heartbeat_interval_ms(&self) -> Option<u64> {
        self.heartbeat_interval_ms
    }

    /// Declared kinds plus every hook capability whose function is defined
    /// with the expected arity.
    pub fn capabilities(&self) -> CapabilitySet {
        let mut caps = self.declared;
        for cap in Capability::ALL {
            if let Some((name, arity)) = cap.hook() {
                if self.handlers.has_arity(name, arity) {
                    caps.insert(cap);
                }
            }
        }
        caps
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rhai::Engine;

    #[test]
    fn handler_table_tracks_overloads() {
        let engine = Engine::new();
        let ast = engine
            .compile("fn bite(who) {} fn bite() {} fn heartbeat() {} fn on_enter(a, b) {}")
            .expect("compile");
        let module = CompiledModule::link(
            BlueprintId::from("npc/rat"),
            3,
            ast,
            CapabilitySet::empty().with(Capability::Living),
            Some(2_000),
        );
        assert!(module.handlers().has_arity("bite", 0));
        assert!(module.handlers().has_arity("bite", 1));
        assert!(!module.handlers().has("growl"));
        let caps = module.capabilities();
        assert!(caps.contains(Capability::Living));
        assert!(caps.contains(Capability::Heartbeat));
        assert!(!caps.contains(Capability::Enter), "wrong arity is not a hook");
        assert_eq!(module.type_name(), "npc/rat@3");
    }
}

pub mod api;
pub mod context;

use std::cell::Cell;
use std::rc::Rc;
use std::time::{Duration, Instant};

use rhai::module_resolvers::DummyModuleResolver;
use rhai::{CallFnOptions, Dynamic, Engine, EvalAltResult, OptimizationLevel, Scope, AST};

use crate::blueprint::module::CompiledModule;
use crate::blueprint::BlueprintId;
use crate::config::DriverConfig;
use crate::error::CompileError;

pub use context::{CallContext, Effect, WorldView};

/// Deadline checks happen every this many operations.
const PROGRESS_CHECK_INTERVAL: u64 = 256;

/// Which budget a call into world code runs under.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum HookKind {
    Load,
    Reload,
    Heartbeat,
    Enter,
    Leave,
    Reset,
    Callout,
    CombatModifier,
    Damage,
    Death,
    Kill,
    Declaration,
}

impl HookKind {
    fn is_one_shot(self) -> bool {
        matches!(
            self,
            HookKind::Load | HookKind::Reload | HookKind::Callout | HookKind::Death | HookKind::Kill
        )
    }
}

#[derive(Debug)]
pub enum Invocation {
    Completed(Dynamic),
    Faulted(String),
    TimedOut(Duration),
}

impl Invocation {

    pub fn value(&self) -> Option<&Dynamic> {
        match self {
            Invocation::Completed(value) => Some(value),
            _ => None,
        }
    }

    /// Completed integer result, or `default` for any other outcome.
    pub fn as_int_or(&self, default: i64) -> i64 {
        self.value()
            .and_then(|v| v.as_int().ok().or_else(|| v.as_float().ok().map(|f| f as i64)))
            .unwrap_or(default)
    }

    pub fn failure(&self) -> Option<String> {
        match self {
            Invocation::Completed(_) => None,
            Invocation::Faulted(message) => Some(message.clone()),
            Invocation::TimedOut(budget) => {
                Some(format!("timed out after {} ms", budget.as_millis()))
            }
        }
    }
}

#[derive(Clone, Debug)]
pub struct SandboxLimits {
    pub hook_budget: Duration,
    pub callout_budget: Duration,
    pub max_operations: u64,
    pub max_call_levels: usize,
    pub max_string_size: usize,
    pub max_array_size: usize,
    pub max_map_size: usize,
}

impl SandboxLimits {
    pub fn from_config(config: &DriverConfig) -> Self {
        Self {
            hook_budget: Duration::from_millis(config.hook_budget_ms.max(1)),
            callout_budget: Duration::from_millis(config.callout_budget_ms.max(1)),
            max_operations: config.max_operations.max(10_000),
            max_call_levels: config.max_call_levels.max(8),
            max_string_size: config.max_string_size,
            max_array_size: config.max_array_size,
            max_map_size: config.max_map_size,
        }
    }
}

impl Default for SandboxLimits {
    fn default() -> Self {
        Self::from_config(&DriverConfig::default())
    }
}

/// The only way the driver calls into world code. Each call runs under a
/// wall-clock deadline checked by the interpreter's progress callback and
/// under the operation limit; errors come back as values. A registered host
/// function is never interrupted, so the deadline is soft.
pub struct SandboxInvoker {
    engine: Engine,
    deadline: Rc<Cell<Option<Instant>>>,
    limits: SandboxLimits,
}

impl SandboxInvoker {
    pub fn new(limits: SandboxLimits) -> Self {
        let deadline: Rc<Cell<Option<Instant>>> = Rc::new(Cell::new(None));
        let mut engine = Engine::new();
        engine.set_module_resolver(DummyModuleResolver::new());
        engine.set_strict_variables(true);
        engine.set_optimization_level(OptimizationLevel::None);
        engine.set_max_operations(limits.max_operations);
        engine.set_max_call_levels(limits.max_call_levels);
        engine.set_max_string_size(limits.max_string_size);
        engine.set_max_array_size(limits.max_array_size);
        engine.set_max_map_size(limits.max_map_size);
        engine.on_print(|text| {
            let object = context::current_name().unwrap_or_default();
            tracing::info!(target: "world", object = %object, "{text}");
        });
        engine.on_debug(|text, source, pos| {
            let object = context::current_name().unwrap_or_default();
            tracing::debug!(
                target: "world",
                object = %object,
                source = source.unwrap_or(""),
                line = pos.line().unwrap_or(0),
                "{text}"
            );
        });
        let watch = deadline.clone();
        engine.on_progress(move |ops| {
            if ops % PROGRESS_CHECK_INTERVAL != 0 {
                return None;
            }
            match watch.get() {
                Some(limit) if Instant::now() >= limit => Some(Dynamic::from("deadline")),
                _ => None,
            }
        });
        api::register_world_api(&mut engine);
        Self {
            engine,
            deadline,
            limits,
        }
    }

    pub fn budget(&self, kind: HookKind) -> Duration {
        if kind.is_one_shot() {
            self.limits.callout_budget
        } else {
            self.limits.hook_budget
        }
    }

    pub fn compile(&self, blueprint: &BlueprintId, text: &str) -> Result<AST, CompileError> {
        self.engine.compile(text).map_err(|err| {
            let pos = err.position();
            CompileError {
                blueprint: blueprint.clone(),
                message: err.err_type().to_string(),
                line: pos.line(),
                column: pos.position(),
            }
        })
    }

    /// Calls `name` on the object described by `ctx`. The context comes back
    /// with whatever effects the call buffered, even when it failed.
    pub fn invoke_in(
        &self,
        ctx: CallContext,
        module: &CompiledModule,
        name: &str,
        args: Vec<Dynamic>,
        kind: HookKind,
    ) -> (Invocation, CallContext) {
        context::enter(ctx);
        let outcome = self.invoke(module, name, args, kind);
        match context::leave() {
            Some(ctx) => (outcome, ctx),
            // enter/leave are strictly paired on this thread.
            None => unreachable!("call context stack underflow"),
        }
    }

    /// Calls `name` with no object context; world API calls fault.
    pub fn invoke(
        &self,
        module: &CompiledModule,
        name: &str,
        args: Vec<Dynamic>,
        kind: HookKind,
    ) -> Invocation {
        if !module.handlers().has_arity(name, args.len()) {
            return Invocation::Faulted(format!(
                "`{}` has no handler `{name}` taking {} argument(s)",
                module.type_name(),
                args.len()
            ));
        }
        let budget = self.budget(kind);
        let previous = self.deadline.replace(Some(Instant::now() + budget));
        let result = self.engine.call_fn_with_options::<Dynamic>(
            CallFnOptions::new().eval_ast(false).rewind_scope(true),
            &mut Scope::new(),
            module.ast(),
            name,
            args,
        );
        self.deadline.set(previous);
        match result {
            Ok(value) => Invocation::Completed(value),
            Err(err) => classify_error(*err, budget),
        }
    }
}

fn classify_error(err: EvalAltResult, budget: Duration) -> Invocation {
    match err {
        EvalAltResult::ErrorTerminated(..) | EvalAltResult::ErrorTooManyOperations(..) => {
            Invocation::TimedOut(budget)
        }
        EvalAltResult::ErrorInFunctionCall(_, _, inner, _) => classify_error(*inner, budget),
        other => Invocation::Faulted(other.to_string()),
    }
}

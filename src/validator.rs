use std::collections::{BTreeSet, HashSet};

use rhai::{ASTNode, Dynamic, Expr, FnCallExpr, FnPtr, Position, Stmt, AST};

use crate::error::{Violation, ViolationKind};
use crate::sandbox::api::WORLD_API;

/// Namespaces that never resolve to anything a world object may touch.
const FORBIDDEN_NAMESPACES: &[&str] = &[
    "fs",
    "file",
    "io",
    "net",
    "socket",
    "http",
    "process",
    "os",
    "env",
    "reflect",
    "ffi",
    "unsafe",
    "thread",
    "threadpool",
];

const FORBIDDEN_SYMBOLS: &[(&str, ViolationKind)] = &[
    ("read_file", ViolationKind::Filesystem),
    ("write_file", ViolationKind::Filesystem),
    ("open_file", ViolationKind::Filesystem),
    ("remove_file", ViolationKind::Filesystem),
    ("read_dir", ViolationKind::Filesystem),
    ("connect", ViolationKind::Network),
    ("listen", ViolationKind::Network),
    ("http_get", ViolationKind::Network),
    ("http_post", ViolationKind::Network),
    ("exec", ViolationKind::ProcessControl),
    ("spawn_process", ViolationKind::ProcessControl),
    ("exit", ViolationKind::ProcessControl),
    ("type_by_name", ViolationKind::Reflection),
    ("load_type", ViolationKind::Reflection),
    ("eval", ViolationKind::Reflection),
    ("env_var", ViolationKind::Environment),
    ("set_env", ViolationKind::Environment),
    ("transmute", ViolationKind::UnsafeMemory),
    ("ptr_read", ViolationKind::UnsafeMemory),
    ("ptr_write", ViolationKind::UnsafeMemory),
    ("spawn_thread", ViolationKind::Threading),
];

/// Language keywords that stay inside the interpreter.
const LANGUAGE_KEYWORDS: &[&str] = &[
    "Fn",
    "call",
    "curry",
    "type_of",
    "print",
    "debug",
    "is_def_var",
    "is_def_fn",
    "is_shared",
];

/// Curated collection, text, math and JSON helpers.
const STD_ALLOW: &[&str] = &[
    // collections
    "len", "is_empty", "push", "pop", "shift", "insert", "remove", "clear", "append",
    "contains", "index_of", "get", "set", "keys", "values", "extract", "truncate",
    "drain", "retain", "splice", "reverse", "sort", "dedup", "fill_with", "pad",
    "filter", "map", "reduce", "reduce_rev", "some", "all", "find", "find_map",
    "for_each", "zip", "chop", "mixin", "fill", "range",
    // text
    "to_string", "to_debug", "to_upper", "to_lower", "make_upper", "make_lower",
    "trim", "sub_string", "split", "split_rev", "replace", "starts_with", "ends_with",
    "chars", "bytes", "to_chars", "crop", "to_char",
    // numbers
    "to_int", "to_float", "parse_int", "parse_float", "abs", "sign", "min", "max",
    "floor", "ceiling", "round", "int", "fraction", "sqrt", "exp", "ln", "log",
    "sin", "cos", "tan", "is_zero", "is_odd", "is_even", "is_nan", "is_finite",
    // json
    "parse_json", "to_json",
    // type checks
    "is_string", "is_int", "is_float", "is_bool", "is_array", "is_map", "is_unit",
];

/// Static screen over a compiled program. Every function reference is
/// checked against the deny-lists first and then against the link
/// allow-list; the program is rejected if anything is reported.
pub struct CapabilityValidator {
    extra_forbidden: BTreeSet<String>,
    allowed: HashSet<&'static str>,
}

impl CapabilityValidator {
    pub fn new(extra_forbidden: &[String]) -> Self {
        let allowed = WORLD_API
            .iter()
            .chain(LANGUAGE_KEYWORDS)
            .chain(STD_ALLOW)
            .copied()
            .collect();
        Self {
            extra_forbidden: extra_forbidden
                .iter()
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect(),
            allowed,
        }
    }

    pub fn validate(&self, ast: &AST) -> Result<(), Vec<Violation>> {
        let violations = self.scan(ast);
        if violations.is_empty() {
            Ok(())
        } else {
            Err(violations)
        }
    }

    pub fn scan(&self, ast: &AST) -> Vec<Violation> {
        let script_fns: HashSet<String> =
            ast.iter_functions().map(|f| f.name.to_string()).collect();
        let mut found = Vec::new();

        ast.walk(&mut |path: &[ASTNode]| {
            match path.last() {
                Some(ASTNode::Expr(Expr::FnCall(call, pos)))
                | Some(ASTNode::Expr(Expr::MethodCall(call, pos)))
                | Some(ASTNode::Stmt(Stmt::FnCall(call, pos))) => {
                    self.check_call(call, *pos, &script_fns, &mut found);
                }
                Some(ASTNode::Expr(Expr::DynamicConstant(value, pos))) => {
                    self.check_constant(value, *pos, &script_fns, &mut found);
                }
                Some(ASTNode::Stmt(Stmt::Import(import, pos))) => {
                    self.check_import(&import.0, *pos, &mut found);
                }
                _ => {}
            }
            true
        });

        found.sort_by(|a, b| {
            (a.line, a.column, &a.symbol).cmp(&(b.line, b.column, &b.symbol))
        });
        found.dedup();
        found
    }

    fn check_call(
        &self,
        call: &FnCallExpr,
        pos: Position,
        script_fns: &HashSet<String>,
        out: &mut Vec<Violation>,
    ) {
        let name = call.name.as_str();
        if is_operator(name) {
            return;
        }

        let segments: Vec<&str> = call.namespace.path.iter().map(|seg| seg.name.as_str()).collect();
        if !segments.is_empty() {
            let qualified = format!("{}::{name}", segments.join("::"));
            let kind = if segments.iter().any(|seg| is_forbidden_namespace(seg)) {
                ViolationKind::ForbiddenNamespace
            } else {
                self.classify(name).unwrap_or(ViolationKind::NotLinkable)
            };
            out.push(violation(qualified, kind, pos));
            return;
        }

        if name == "Fn" {
            match call.args.first() {
                Some(Expr::StringConstant(target, target_pos)) => {
                    self.check_name(target.as_str(), *target_pos, script_fns, out);
                }
                _ => out.push(violation("Fn".to_string(), ViolationKind::DynamicReference, pos)),
            }
            return;
        }

        self.check_name(name, pos, script_fns, out);
    }

    /// Function pointers folded into constants at parse time.
    fn check_constant(
        &self,
        value: &Dynamic,
        pos: Position,
        script_fns: &HashSet<String>,
        out: &mut Vec<Violation>,
    ) {
        if let Some(ptr) = value.clone().try_cast::<FnPtr>() {
            self.check_name(ptr.fn_name(), pos, script_fns, out);
        }
    }

    fn check_import(&self, path: &Expr, pos: Position, out: &mut Vec<Violation>) {
        match path {
            Expr::StringConstant(module, module_pos) => {
                let module = module.as_str();
                let kind = if module
                    .split(['/', ':', '.'])
                    .any(is_forbidden_namespace)
                {
                    ViolationKind::ForbiddenNamespace
                } else {
                    ViolationKind::NotLinkable
                };
                out.push(violation(module.to_string(), kind, *module_pos));
            }
            _ => out.push(violation(
                "import".to_string(),
                ViolationKind::DynamicReference,
                pos,
            )),
        }
    }

    fn check_name(
        &self,
        name: &str,
        pos: Position,
        script_fns: &HashSet<String>,
        out: &mut Vec<Violation>,
    ) {
        if let Some(kind) = self.classify(name) {
            out.push(violation(name.to_string(), kind, pos));
            return;
        }
        // Closures compile to anonymous script functions.
        if name.starts_with("anon$") || script_fns.contains(name) || self.allowed.contains(name) {
            return;
        }
        out.push(violation(name.to_string(), ViolationKind::NotLinkable, pos));
    }

    /// Deny-list category of a bare symbol, if it is denied at all.
    fn classify(&self, name: &str) -> Option<ViolationKind> {
        if self.extra_forbidden.contains(name) {
            return Some(ViolationKind::Configured);
        }
        FORBIDDEN_SYMBOLS
            .iter()
            .find(|(symbol, _)| *symbol == name)
            .map(|(_, kind)| *kind)
    }
}

fn is_forbidden_namespace(segment: &str) -> bool {
    FORBIDDEN_NAMESPACES.contains(&segment.to_ascii_lowercase().as_str())
}

fn is_operator(name: &str) -> bool {
    !name.is_empty() && !name.chars().any(|c| c.is_alphanumeric() || c == '_')
}

fn violation(symbol: String, kind: ViolationKind, pos: Position) -> Violation {
    Violation {
        symbol,
        kind,
        line: pos.line(),
        column: pos.position(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rhai::{Engine, OptimizationLevel};

    fn compile(source: &str) -> AST {
        let mut engine = Engine::new();
        engine.set_optimization_level(OptimizationLevel::None);
        engine.compile(source).expect("compile")
    }

    fn scan(source: &str) -> Vec<Violation> {
        CapabilityValidator::new(&[]).scan(&compile(source))
    }

    #[test]
    fn accepts_world_api_and_std_helpers() {
        let source = r#"
            fn on_load() {
                state_set("hp", 10);
                let names = objects().map(|id| id.to_upper());
                if names.len() > 0 { say("hello " + names[0]); }
                call_out("growl", 500);
            }
            fn growl() { emote("growls."); }
        "#;
        assert!(scan(source).is_empty(), "{:?}", scan(source));
    }

    #[test]
    fn rejects_forbidden_symbol_with_location() {
        let found = scan("fn on_load() {\n    let x = read_file(\"/etc/passwd\");\n}");
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].symbol, "read_file");
        assert_eq!(found[0].kind, ViolationKind::Filesystem);
        assert_eq!(found[0].line, Some(2));
    }

    #[test]
    fn rejects_forbidden_namespace_import() {
        let found = scan("import \"fs\" as fs;\nfn on_load() {}");
        assert!(found
            .iter()
            .any(|v| v.symbol == "fs" && v.kind == ViolationKind::ForbiddenNamespace));
    }

    #[test]
    fn qualified_calls_report_the_full_path() {
        let found = scan("import \"net\" as net;\nfn on_load() { net::connect(\"x\"); }");
        let call = found
            .iter()
            .find(|v| v.symbol == "net::connect")
            .expect("qualified call reported");
        assert_eq!(call.kind, ViolationKind::ForbiddenNamespace);
        assert_eq!(call.line, Some(2));
    }

    #[test]
    fn rejects_unknown_calls_as_not_linkable() {
        let found = scan("fn on_load() { summon_dragon(); }");
        assert_eq!(found[0].symbol, "summon_dragon");
        assert_eq!(found[0].kind, ViolationKind::NotLinkable);
    }

    #[test]
    fn screens_function_pointer_names() {
        let found = scan("fn on_load() { let f = Fn(\"exec\"); f.call(); }");
        assert!(found.iter().any(|v| v.symbol == "exec"));

        let found = scan("fn on_load() { let name = \"ex\" + \"ec\"; let f = Fn(name); }");
        assert!(found
            .iter()
            .any(|v| v.kind == ViolationKind::DynamicReference));

        assert!(scan("fn bite() {} fn on_load() { let f = Fn(\"bite\"); f.call(); }").is_empty());
    }

    #[test]
    fn eval_is_reflection() {
        let found = scan("fn on_load() { eval(\"40 + 2\"); }");
        assert_eq!(found[0].kind, ViolationKind::Reflection);
    }

    #[test]
    fn configured_symbols_are_denied() {
        let validator = CapabilityValidator::new(&["shout".to_string()]);
        let found = validator.scan(&compile("fn shout() {} fn on_load() { shout(); }"));
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].kind, ViolationKind::Configured);
    }

    #[test]
    fn scans_nested_function_bodies() {
        let found = scan("fn a() { if true { [1, 2].for_each(|x| spawn_thread(x)); } }");
        assert!(found.iter().any(|v| v.symbol == "spawn_thread"));
    }
}

use std::fmt;

use thiserror::Error;

use crate::blueprint::BlueprintId;
use crate::instances::ObjectId;

/// Syntax or semantic failure while compiling a source unit. The running
/// version of the blueprint, if any, keeps serving.
#[derive(Debug, Clone, Error)]
#[error("compile error in `{blueprint}`{}: {message}", location_suffix(.line, .column))]
pub struct CompileError {
    pub blueprint: BlueprintId,
    pub message: String,
    pub line: Option<usize>,
    pub column: Option<usize>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ViolationKind {
    Filesystem,
    Network,
    ProcessControl,
    Reflection,
    Environment,
    UnsafeMemory,
    Threading,
    ForbiddenNamespace,
    DynamicReference,
    NotLinkable,
    Configured,
}

impl fmt::Display for ViolationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            ViolationKind::Filesystem => "filesystem",
            ViolationKind::Network => "network",
            ViolationKind::ProcessControl => "process control",
            ViolationKind::Reflection => "reflection",
            ViolationKind::Environment => "environment",
            ViolationKind::UnsafeMemory => "unsafe memory",
            ViolationKind::Threading => "threading",
            ViolationKind::ForbiddenNamespace => "forbidden namespace",
            ViolationKind::DynamicReference => "dynamic function reference",
            ViolationKind::NotLinkable => "not on the link allow-list",
            ViolationKind::Configured => "operator deny-list",
        };
        f.write_str(label)
    }
}

/// One forbidden symbol reference found by the capability screen.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
pub struct Violation {
    pub symbol: String,
    pub kind: ViolationKind,
    pub line: Option<usize>,
    pub column: Option<usize>,
}

impl fmt::Display for Violation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "`{}` ({}){}",
            self.symbol,
            self.kind,
            location_suffix(&self.line, &self.column)
        )
    }
}

#[derive(Debug, Clone, Error)]
pub enum LoadError {
    #[error("cannot read source for `{blueprint}`: {message}")]
    Source {
        blueprint: BlueprintId,
        message: String,
    },
    #[error(transparent)]
    Compile(#[from] CompileError),
    #[error("capability violation in `{blueprint}`: {}", join_violations(.violations))]
    Capability {
        blueprint: BlueprintId,
        violations: Vec<Violation>,
    },
}

impl LoadError {
    pub fn violations(&self) -> &[Violation] {
        match self {
            LoadError::Capability { violations, .. } => violations,
            _ => &[],
        }
    }
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum MoveError {
    #[error("object {0} cannot contain itself")]
    SelfContainment(ObjectId),
    #[error("moving {object} into {destination} would create a containment cycle")]
    Cycle {
        object: ObjectId,
        destination: ObjectId,
    },
    #[error("no such object {0}")]
    UnknownObject(ObjectId),
}

/// Refusals shown to the player who issued the command, as plain text.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum CombatError {
    #[error("You can't attack yourself.")]
    SelfTarget,
    #[error("You don't see {0} here.")]
    NotHere(String),
    #[error("You can't fight {0}.")]
    NotLiving(String),
    #[error("{0} is already dead.")]
    AlreadyDead(String),
    #[error("You are not fighting anyone.")]
    NotFighting,
    #[error("You are in no shape to fight.")]
    CannotFight,
}

#[derive(Debug, Error)]
pub enum DriverError {
    #[error("no such object `{0}`")]
    NoSuchObject(String),
    #[error("blueprint `{0}` is not loaded")]
    UnknownBlueprint(BlueprintId),
    #[error(transparent)]
    Load(#[from] LoadError),
    #[error("blueprint `{blueprint}` is still referenced by {instances} instance(s) and {callouts} callout(s)")]
    BlueprintInUse {
        blueprint: BlueprintId,
        instances: usize,
        callouts: usize,
    },
    #[error("restore requires an empty world ({0} live instance(s))")]
    WorldNotEmpty(usize),
    #[error("duplicate object id `{0}` in snapshot")]
    DuplicateObject(String),
    #[error(transparent)]
    Move(#[from] MoveError),
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("cannot read config {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("cannot parse config {path}: {source}")]
    Parse {
        path: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("invalid config value `{key}`: {reason}")]
    Invalid { key: &'static str, reason: String },
}

fn location_suffix(line: &Option<usize>, column: &Option<usize>) -> String {
    match (line, column) {
        (Some(line), Some(column)) => format!(" at line {line}, position {column}"),
        (Some(line), None) => format!(" at line {line}"),
        _ => String::new(),
    }
}

fn join_violations(violations: &[Violation]) -> String {
    violations
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn capability_error_names_symbol_and_location() {
        let err = LoadError::Capability {
            blueprint: BlueprintId::from("npc/thief"),
            violations: vec![Violation {
                symbol: "read_file".to_string(),
                kind: ViolationKind::Filesystem,
                line: Some(3),
                column: Some(9),
            }],
        };
        let text = err.to_string();
        assert!(text.contains("npc/thief"), "{text}");
        assert!(text.contains("`read_file` (filesystem) at line 3, position 9"), "{text}");
        assert_eq!(err.violations().len(), 1);
    }

    #[test]
    fn compile_error_without_position_has_no_suffix() {
        let err = CompileError {
            blueprint: BlueprintId::from("room/void"),
            message: "unexpected end of input".to_string(),
            line: None,
            column: None,
        };
        assert_eq!(
            err.to_string(),
            "compile error in `room/void`: unexpected end of input"
        );
    }
}

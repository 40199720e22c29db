use serde_json::{json, Value};

use super::Driver;
use crate::blueprint::BlueprintId;
use crate::error::CombatError;
use crate::instances::ObjectId;
use crate::persistence::WorldSnapshot;

/// A line typed by a player, waiting for the next tick.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PlayerCommand {
    pub actor: ObjectId,
    pub line: String,
}

/// Wizard requests, executed on the driver loop between ticks.
#[derive(Clone, Debug)]
pub enum ConsoleCommand {
    Blueprints,
    Reload { blueprint: String, force: bool },
    Unload(String),
    Update,
    Clone(String),
    Destruct(String),
    Move { object: String, destination: Option<String> },
    /// Queues `line` as if `object` had typed it.
    Force { object: String, line: String },
    Stat(String),
    Errors,
    ClearErrors,
    Snapshot,
    Restore(Box<WorldSnapshot>),
    /// Free-form console line, e.g. `clone npc/rat`.
    Line(String),
}

const CONSOLE_HELP: &str =
    "commands: clone <bp>, destruct <id>, stat <id>, blueprints, reload <bp> [force], unload <bp>, update, move <id> [<dest>], force <id> <command>, errors [clear]";

impl Driver {
    pub fn queue_command(&mut self, actor: ObjectId, line: impl Into<String>) {
        self.commands.push_back(PlayerCommand {
            actor,
            line: line.into(),
        });
    }

    pub fn pending_commands(&self) -> usize {
        self.commands.len()
    }

    pub(crate) fn run_commands(&mut self) -> usize {
        let mut handled = 0;
        while let Some(command) = self.commands.pop_front() {
            if !self.instances.contains(command.actor) {
                continue;
            }
            self.run_player_command(command.actor, command.line.trim());
            handled += 1;
        }
        handled
    }

    fn run_player_command(&mut self, actor: ObjectId, line: &str) {
        let (verb, rest) = match line.split_once(char::is_whitespace) {
            Some((verb, rest)) => (verb, rest.trim()),
            None => (line, ""),
        };
        match verb.to_ascii_lowercase().as_str() {
            "" => {}
            "kill" | "attack" => {
                if rest.is_empty() {
                    self.send(actor, "Kill whom?");
                    return;
                }
                let outcome = match self.find_here(actor, rest) {
                    Some(target) => self.start_combat(actor, target).map(|_| target),
                    None => Err(CombatError::NotHere(rest.to_string())),
                };
                match outcome {
                    Ok(target) => {
                        let target_name = self.name_of(target);
                        let actor_name = self.name_of(actor);
                        self.send(actor, format!("You attack {target_name}!"));
                        self.send(target, format!("{actor_name} attacks you!"));
                    }
                    Err(err) => self.send(actor, err.to_string()),
                }
            }
            "flee" => {
                if let Err(err) = self.flee(actor) {
                    self.send(actor, err.to_string());
                }
            }
            other => self.send(actor, format!("Unknown command: {other}.")),
        }
    }

    /// Something sharing `actor`'s room that answers to `word`: its full
    /// name, the last segment of its blueprint, or its `name` state key.
    fn find_here(&self, actor: ObjectId, word: &str) -> Option<ObjectId> {
        let room = self.containers.container_of(actor)?;
        let word = word.to_ascii_lowercase();
        self.containers
            .members(room)
            .filter(|id| *id != actor)
            .find(|id| {
                let Some(inst) = self.instances.get(*id) else {
                    return false;
                };
                let short = inst
                    .blueprint
                    .as_str()
                    .rsplit('/')
                    .next()
                    .unwrap_or_default();
                inst.name.to_ascii_lowercase() == word
                    || short.to_ascii_lowercase() == word
                    || inst.state.borrow().get_str("name", "").to_ascii_lowercase() == word
            })
    }

    /// Runs one console request and renders the result as JSON. Errors carry
    /// the full diagnostic text.
    pub fn execute_console(&mut self, command: ConsoleCommand) -> Result<Value, String> {
        match command {
            ConsoleCommand::Blueprints => to_json(&self.list_blueprints()),
            ConsoleCommand::Reload { blueprint, force } => {
                let result = self
                    .reload(&BlueprintId::from(blueprint.as_str()), force)
                    .map_err(|err| err.to_string())?;
                to_json(&result)
            }
            ConsoleCommand::Unload(blueprint) => {
                let id = BlueprintId::from(blueprint.as_str());
                self.unload(&id).map_err(|err| err.to_string())?;
                Ok(json!({ "unloaded": id }))
            }
            ConsoleCommand::Update => {
                let results: Vec<Value> = self
                    .update()
                    .into_iter()
                    .map(|(id, outcome)| match outcome {
                        Ok(result) => json!({ "blueprint": id, "result": result }),
                        Err(error) => json!({ "blueprint": id, "error": error }),
                    })
                    .collect();
                Ok(Value::Array(results))
            }
            ConsoleCommand::Clone(blueprint) => {
                let id = self
                    .clone_object(&BlueprintId::from(blueprint.as_str()))
                    .map_err(|err| err.to_string())?;
                Ok(json!({ "id": self.name_of(id), "handle": id.to_string() }))
            }
            ConsoleCommand::Destruct(object) => {
                let id = self.require(&object).map_err(|err| err.to_string())?;
                let name = self.name_of(id);
                self.destruct(id).map_err(|err| err.to_string())?;
                Ok(json!({ "destructed": name }))
            }
            ConsoleCommand::Move { object, destination } => {
                let id = self.require(&object).map_err(|err| err.to_string())?;
                let dest = match destination.as_deref() {
                    Some(text) => Some(self.require(text).map_err(|err| err.to_string())?),
                    None => None,
                };
                self.move_object(id, dest).map_err(|err| err.to_string())?;
                Ok(json!({
                    "object": self.name_of(id),
                    "environment": dest.map(|d| self.name_of(d)),
                }))
            }
            ConsoleCommand::Force { object, line } => {
                let id = self.require(&object).map_err(|err| err.to_string())?;
                self.queue_command(id, line);
                Ok(json!({ "queued": self.name_of(id), "pending": self.pending_commands() }))
            }
            ConsoleCommand::Stat(text) => {
                let report = self.stat(&text).map_err(|err| err.to_string())?;
                to_json(&report)
            }
            ConsoleCommand::Errors => {
                let entries: Vec<_> = self.errors.entries().collect();
                to_json(&entries)
            }
            ConsoleCommand::ClearErrors => {
                let cleared = self.errors.len();
                self.errors.clear();
                Ok(json!({ "cleared": cleared }))
            }
            ConsoleCommand::Snapshot => to_json(&self.snapshot()),
            ConsoleCommand::Restore(snapshot) => {
                let restored = self.restore(*snapshot).map_err(|err| err.to_string())?;
                Ok(json!({ "restored": restored }))
            }
            ConsoleCommand::Line(line) => {
                let command = parse_console_line(&line)?;
                self.execute_console(command)
            }
        }
    }
}

fn to_json<T: serde::Serialize + ?Sized>(value: &T) -> Result<Value, String> {
    serde_json::to_value(value).map_err(|err| err.to_string())
}

/// Parses a wizard console line into a request.
pub fn parse_console_line(line: &str) -> Result<ConsoleCommand, String> {
    let mut words = line.split_whitespace();
    let verb = words.next().unwrap_or_default().to_ascii_lowercase();
    let args: Vec<&str> = words.collect();
    let one = |what: &str| -> Result<String, String> {
        match args.as_slice() {
            [arg] => Ok((*arg).to_string()),
            _ => Err(format!("usage: {verb} <{what}>")),
        }
    };
    match verb.as_str() {
        "clone" => one("blueprint").map(ConsoleCommand::Clone),
        "destruct" => one("id").map(ConsoleCommand::Destruct),
        "stat" => one("id").map(ConsoleCommand::Stat),
        "unload" => one("blueprint").map(ConsoleCommand::Unload),
        "blueprints" => Ok(ConsoleCommand::Blueprints),
        "update" => Ok(ConsoleCommand::Update),
        "reload" => match args.as_slice() {
            [bp] => Ok(ConsoleCommand::Reload {
                blueprint: (*bp).to_string(),
                force: false,
            }),
            [bp, "force"] | [bp, "-f"] => Ok(ConsoleCommand::Reload {
                blueprint: (*bp).to_string(),
                force: true,
            }),
            _ => Err("usage: reload <blueprint> [force]".to_string()),
        },
        "move" => match args.as_slice() {
            [object] => Ok(ConsoleCommand::Move {
                object: (*object).to_string(),
                destination: None,
            }),
            [object, dest] => Ok(ConsoleCommand::Move {
                object: (*object).to_string(),
                destination: Some((*dest).to_string()),
            }),
            _ => Err("usage: move <id> [<destination>]".to_string()),
        },
        "force" => match args.as_slice() {
            [object, command @ ..] if !command.is_empty() => Ok(ConsoleCommand::Force {
                object: (*object).to_string(),
                line: command.join(" "),
            }),
            _ => Err("usage: force <id> <command>".to_string()),
        },
        "errors" => match args.as_slice() {
            [] => Ok(ConsoleCommand::Errors),
            ["clear"] => Ok(ConsoleCommand::ClearErrors),
            _ => Err("usage: errors [clear]".to_string()),
        },
        "" | "help" => Err(CONSOLE_HELP.to_string()),
        other => Err(format!("unknown command `{other}`; {CONSOLE_HELP}")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn console_lines_parse() {
        assert!(matches!(
            parse_console_line("clone npc/rat"),
            Ok(ConsoleCommand::Clone(bp)) if bp == "npc/rat"
        ));
        assert!(matches!(
            parse_console_line("reload npc/rat force"),
            Ok(ConsoleCommand::Reload { force: true, .. })
        ));
        assert!(matches!(
            parse_console_line("move npc/rat#1"),
            Ok(ConsoleCommand::Move { destination: None, .. })
        ));
        assert!(matches!(parse_console_line("errors clear"), Ok(ConsoleCommand::ClearErrors)));
        assert!(matches!(
            parse_console_line("force npc/guard#1 kill rat"),
            Ok(ConsoleCommand::Force { object, line }) if object == "npc/guard#1" && line == "kill rat"
        ));
        assert!(matches!(parse_console_line("BLUEPRINTS"), Ok(ConsoleCommand::Blueprints)));
    }

    #[test]
    fn bad_console_lines_explain_usage() {
        let err = parse_console_line("clone").err().unwrap_or_default();
        assert_eq!(err, "usage: clone <blueprint>");
        let err = parse_console_line("force npc/guard#1").err().unwrap_or_default();
        assert_eq!(err, "usage: force <id> <command>");
        let err = parse_console_line("shutdown now").err().unwrap_or_default();
        assert!(err.starts_with("unknown command `shutdown`"));
    }
}

use rhai::{Array, Dynamic, Engine, EvalAltResult, FnPtr, ImmutableString, Map, FLOAT, INT};
use serde_json::Value;

use super::context::{with_context, Effect};
use crate::capability::Capability;

type HostResult<T> = Result<T, Box<EvalAltResult>>;

/// Host functions world code may link against.
pub const WORLD_API: &[&str] = &[
    "this_object",
    "state_has",
    "state_get",
    "state_set",
    "state_remove",
    "query",
    "tell",
    "say",
    "emote",
    "call_out",
    "every",
    "remove_call_out",
    "find_object",
    "objects",
    "members",
    "environment",
    "equipped",
    "random",
    "now",
];

pub(crate) fn register_world_api(engine: &mut Engine) {
    engine.register_fn("this_object", world_this_object);
    engine.register_fn("state_has", world_state_has);
    engine.register_fn("state_get", world_state_get);
    engine.register_fn("state_get", world_state_get_or);
    engine.register_fn("state_set", world_state_set);
    engine.register_fn("state_remove", world_state_remove);
    engine.register_fn("query", world_query);
    engine.register_fn("tell", world_tell);
    engine.register_fn("say", world_say);
    engine.register_fn("emote", world_emote);
    engine.register_fn("call_out", world_call_out);
    engine.register_fn("call_out", world_call_out_with_args);
    engine.register_fn("every", world_every);
    engine.register_fn("every", world_every_with_args);
    engine.register_fn("remove_call_out", world_remove_call_out);
    engine.register_fn("find_object", world_find_object);
    engine.register_fn("find_object", world_find_object_with_capability);
    engine.register_fn("objects", world_objects);
    engine.register_fn("members", world_members);
    engine.register_fn("environment", world_environment_of_self);
    engine.register_fn("environment", world_environment);
    engine.register_fn("equipped", world_equipped);
    engine.register_fn("random", world_random);
    engine.register_fn("now", world_now);
}

fn world_this_object() -> HostResult<ImmutableString> {
    with_context(|ctx| ctx.this_name.as_str().into())
}

fn world_state_has(key: &str) -> HostResult<bool> {
    with_context(|ctx| ctx.state.borrow().has(key))
}

fn world_state_get(key: &str) -> HostResult<Dynamic> {
    world_state_get_or(key, Dynamic::UNIT)
}

fn world_state_get_or(key: &str, default: Dynamic) -> HostResult<Dynamic> {
    with_context(|ctx| {
        ctx.state
            .borrow()
            .get(key)
            .map(json_to_dynamic)
            .unwrap_or(default)
    })
}

fn world_state_set(key: &str, value: Dynamic) -> HostResult<()> {
    let value = dynamic_to_json(&value)
        .map_err(|kind| format!("state key `{key}` cannot hold a value of type {kind}"))?;
    with_context(|ctx| {
        ctx.state.borrow_mut().set(key, value);
    })
}

fn world_state_remove(key: &str) -> HostResult<Dynamic> {
    with_context(|ctx| {
        ctx.state
            .borrow_mut()
            .remove(key)
            .map(|v| json_to_dynamic(&v))
            .unwrap_or(Dynamic::UNIT)
    })
}

fn world_query(id: &str, key: &str) -> HostResult<Dynamic> {
    with_context(|ctx| {
        ctx.world
            .get(id)
            .and_then(|entry| entry.state.borrow().get(key).map(json_to_dynamic))
            .unwrap_or(Dynamic::UNIT)
    })
}

fn world_tell(id: &str, text: &str) -> HostResult<()> {
    with_context(|ctx| {
        ctx.effects.push(Effect::Tell {
            to: id.to_string(),
            text: text.to_string(),
        })
    })
}

fn world_say(text: &str) -> HostResult<()> {
    with_context(|ctx| {
        ctx.effects.push(Effect::Say {
            text: text.to_string(),
        })
    })
}

fn world_emote(text: &str) -> HostResult<()> {
    with_context(|ctx| {
        ctx.effects.push(Effect::Emote {
            text: text.to_string(),
        })
    })
}

fn schedule(method: &str, delay: INT, args: Array, repeat: bool) -> HostResult<INT> {
    if method.is_empty() {
        return Err("callout method name is empty".into());
    }
    if repeat && delay <= 0 {
        return Err(format!("repeating callout `{method}` needs a positive interval").into());
    }
    with_context(|ctx| {
        let id = ctx.next_callout_id();
        ctx.effects.push(Effect::CallOut {
            id,
            method: method.to_string(),
            delay_ms: delay.max(0) as u64,
            args: args.into_iter().collect(),
            repeat,
        });
        id.0 as INT
    })
}

fn world_call_out(method: &str, delay: INT) -> HostResult<INT> {
    schedule(method, delay, Array::new(), false)
}

fn world_call_out_with_args(method: &str, delay: INT, args: Array) -> HostResult<INT> {
    schedule(method, delay, args, false)
}

fn world_every(method: &str, interval: INT) -> HostResult<INT> {
    schedule(method, interval, Array::new(), true)
}

fn world_every_with_args(method: &str, interval: INT, args: Array) -> HostResult<INT> {
    schedule(method, interval, args, true)
}

fn world_remove_call_out(id: INT) -> HostResult<()> {
    with_context(|ctx| {
        if id > 0 {
            ctx.effects.push(Effect::Cancel {
                id: crate::scheduler::CalloutId(id as u64),
            });
        }
    })
}

fn world_find_object(id: &str) -> HostResult<Dynamic> {
    with_context(|ctx| match ctx.world.get(id) {
        Some(_) => Dynamic::from(ImmutableString::from(id)),
        None => Dynamic::UNIT,
    })
}

fn world_find_object_with_capability(id: &str, capability: &str) -> HostResult<Dynamic> {
    let Some(cap) = Capability::parse(capability) else {
        return Ok(Dynamic::UNIT);
    };
    with_context(|ctx| match ctx.world.get(id) {
        Some(entry) if entry.capabilities.contains(cap) => {
            Dynamic::from(ImmutableString::from(id))
        }
        _ => Dynamic::UNIT,
    })
}

fn world_objects() -> HostResult<Array> {
    with_context(|ctx| ctx.world.names().map(|name| Dynamic::from(name.to_string())).collect())
}

fn world_members(id: &str) -> HostResult<Array> {
    with_context(|ctx| {
        ctx.world
            .get(id)
            .map(|entry| {
                entry
                    .members
                    .iter()
                    .map(|name| Dynamic::from(name.clone()))
                    .collect()
            })
            .unwrap_or_default()
    })
}

fn world_environment_of_self() -> HostResult<Dynamic> {
    let this = with_context(|ctx| ctx.this_name.clone())?;
    world_environment(&this)
}

fn world_environment(id: &str) -> HostResult<Dynamic> {
    with_context(|ctx| {
        ctx.world
            .get(id)
            .and_then(|entry| entry.container.clone())
            .map(Dynamic::from)
            .unwrap_or(Dynamic::UNIT)
    })
}

/// Item in `slot` of the wearer's `equipment` map, if it is still carried.
fn world_equipped(id: &str, slot: &str) -> HostResult<Dynamic> {
    with_context(|ctx| {
        let Some(wearer) = ctx.world.get(id) else {
            return Dynamic::UNIT;
        };
        let item = wearer.state.borrow().get_string_map("equipment").remove(slot);
        match item {
            Some(item) if ctx.world.get(&item).and_then(|e| e.container.as_deref()) == Some(id) => {
                Dynamic::from(item)
            }
            _ => Dynamic::UNIT,
        }
    })
}

fn world_random(min: INT, max: INT) -> HostResult<INT> {
    let (lo, hi) = if min <= max { (min, max) } else { (max, min) };
    with_context(|ctx| ctx.rng.borrow_mut().roll_range(lo, hi))
}

fn world_now() -> HostResult<INT> {
    with_context(|ctx| ctx.now_ms as INT)
}

pub fn json_to_dynamic(value: &Value) -> Dynamic {
    match value {
        Value::Null => Dynamic::UNIT,
        Value::Bool(v) => (*v).into(),
        Value::Number(v) => {
            if let Some(i) = v.as_i64() {
                (i as INT).into()
            } else if let Some(f) = v.as_f64() {
                (f as FLOAT).into()
            } else {
                Dynamic::UNIT
            }
        }
        Value::String(v) => v.as_str().into(),
        Value::Array(arr) => arr.iter().map(json_to_dynamic).collect::<Array>().into(),
        Value::Object(obj) => {
            let mut out = Map::new();
            for (k, v) in obj {
                out.insert(k.as_str().into(), json_to_dynamic(v));
            }
            out.into()
        }
    }
}

/// JSON-like values only; the error names the offending type.
pub fn dynamic_to_json(value: &Dynamic) -> Result<Value, String> {
    if value.is_unit() {
        return Ok(Value::Null);
    }
    if let Some(v) = value.clone().try_cast::<bool>() {
        return Ok(Value::Bool(v));
    }
    if let Some(v) = value.clone().try_cast::<INT>() {
        return Ok(serde_json::json!(v));
    }
    if let Some(v) = value.clone().try_cast::<FLOAT>() {
        return Ok(serde_json::json!(v));
    }
    if let Some(v) = value.clone().try_cast::<ImmutableString>() {
        return Ok(Value::String(v.to_string()));
    }
    if let Some(v) = value.clone().try_cast::<char>() {
        return Ok(Value::String(v.to_string()));
    }
    if let Some(v) = value.clone().try_cast::<Array>() {
        return v.iter().map(dynamic_to_json).collect::<Result<Vec<_>, _>>().map(Value::Array);
    }
    if let Some(v) = value.clone().try_cast::<Map>() {
        let mut out = serde_json::Map::new();
        for (k, item) in v {
            out.insert(k.to_string(), dynamic_to_json(&item)?);
        }
        return Ok(Value::Object(out));
    }
    Err(value.type_name().to_string())
}

/// True when a value holds a function pointer anywhere inside it.
pub fn holds_fn_ptr(value: &Dynamic) -> bool {
    if value.is::<FnPtr>() {
        return true;
    }
    if let Some(arr) = value.clone().try_cast::<Array>() {
        return arr.iter().any(holds_fn_ptr);
    }
    if let Some(map) = value.clone().try_cast::<Map>() {
        return map.values().any(holds_fn_ptr);
    }
    false
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn json_values_cross_the_boundary_intact() {
        let value = json!({"hp": 10, "name": "rat", "tags": ["small", true, 1.5], "none": null});
        let back = dynamic_to_json(&json_to_dynamic(&value)).expect("json-like");
        assert_eq!(back, value);
    }

    #[test]
    fn function_pointers_are_not_state() {
        let ptr = Dynamic::from(FnPtr::new("bite").expect("fn ptr"));
        assert!(dynamic_to_json(&ptr).is_err());
        let nested: Dynamic = vec![Dynamic::from(1 as INT), ptr].into();
        assert!(holds_fn_ptr(&nested));
        assert!(dynamic_to_json(&nested).is_err());
        assert!(!holds_fn_ptr(&Dynamic::from(3 as INT)));
    }
}

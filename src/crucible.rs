//! The Crucible: the host-supplied variable environment scripts run against.
//!
//! A Crucible is a stack of name→value frames.  Lookups walk innermost to
//! outermost; writes land on the nearest frame that already defines the name,
//! else on the innermost frame.  Entries may be flagged constant (rewrites
//! are fatal) or protected (any script write is fatal).  Dotted names walk
//! nested mappings, creating intermediate maps on write.
//!
//! Reserved "dunder" names (`__LINE__`, `__CONDITION__`, …) are ordinary
//! entries the interpreter maintains; scripts may read and write them.

use std::collections::HashMap;

use serde_json::{json, Value as Json};

use crate::error::Burn;
use crate::value::{Map, Value};

/// Reserved variable names the interpreter exposes.
pub mod dunder {
    pub const LINE: &str = "__LINE__";
    pub const CONDITION: &str = "__CONDITION__";
    pub const JUMPED: &str = "__JUMPED__";
    pub const ITER: &str = "__ITER__";
    pub const INDEX: &str = "__INDEX__";
    pub const LENGTH: &str = "__LENGTH__";
    pub const STACK: &str = "__STACK__";
    pub const ERROR: &str = "__ERROR__";
}

/// Returns `true` for reserved dunder names (`__NAME__`).
pub fn is_dunder(name: &str) -> bool {
    name.len() > 4 && name.starts_with("__") && name.ends_with("__")
}

#[derive(Debug, Clone, Default)]
struct Slot {
    value: Value,
    constant: bool,
    protected: bool,
}

#[derive(Debug, Clone, Default)]
struct Frame {
    slots: HashMap<String, Slot>,
}

/// A chain of variable frames.
#[derive(Debug, Clone)]
pub struct Crucible {
    frames: Vec<Frame>,
}

impl Default for Crucible {
    fn default() -> Self {
        Self::new()
    }
}

impl Crucible {
    /// A Crucible with a single empty frame.
    pub fn new() -> Self {
        Crucible {
            frames: vec![Frame::default()],
        }
    }

    /// Push a fresh innermost frame.
    pub fn push_frame(&mut self) {
        self.frames.push(Frame::default());
    }

    /// Pop the innermost frame.  The base frame cannot be popped.
    pub fn pop_frame(&mut self) -> bool {
        if self.frames.len() > 1 {
            self.frames.pop();
            true
        } else {
            false
        }
    }

    pub fn frame_count(&self) -> usize {
        self.frames.len()
    }

    /// Look up `name`, walking innermost→outermost.  Dotted names walk nested
    /// mappings (and sequences by numeric segment) after the first segment.
    pub fn get(&self, name: &str) -> Option<Value> {
        let (first, rest) = split_path(name);
        let slot = self.find(first)?;
        let mut current = &slot.value;
        for segment in rest {
            current = index_value(current, segment)?;
        }
        Some(current.clone())
    }

    /// Returns `true` if `name` resolves to a value.
    pub fn contains(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    /// Write `name`, honoring constant and protected flags.
    ///
    /// The write lands on the nearest frame already defining the first path
    /// segment, else on the innermost frame.  Dotted writes create
    /// intermediate mappings.
    pub fn set(&mut self, name: &str, value: Value) -> Result<(), Burn> {
        self.write(name, value)
    }

    /// Define an immutable entry.  Fails if `name` already resolves.
    pub fn define_const(&mut self, name: &str, value: Value) -> Result<(), Burn> {
        if self.contains(name) {
            return Err(Burn::fatal(format!("constant '{name}' is already defined")));
        }
        let frame = self.frames.last_mut().unwrap_or_else(|| unreachable!());
        frame.slots.insert(
            name.to_owned(),
            Slot {
                value,
                constant: true,
                protected: false,
            },
        );
        Ok(())
    }

    /// Flag an existing entry as protected: script writes become fatal.
    /// Returns `false` if the name is not defined.
    pub fn protect(&mut self, name: &str) -> bool {
        for frame in self.frames.iter_mut().rev() {
            if let Some(slot) = frame.slots.get_mut(name) {
                slot.protected = true;
                return true;
            }
        }
        false
    }

    /// Remove `name` from the nearest frame defining it.
    pub fn unset(&mut self, name: &str) -> bool {
        for frame in self.frames.iter_mut().rev() {
            if frame.slots.remove(name).is_some() {
                return true;
            }
        }
        false
    }

    /// Bulk-set plain entries (host convenience for carries and bindings).
    pub fn update<I, K>(&mut self, entries: I) -> Result<(), Burn>
    where
        I: IntoIterator<Item = (K, Value)>,
        K: AsRef<str>,
    {
        for (name, value) in entries {
            self.set(name.as_ref(), value)?;
        }
        Ok(())
    }

    /// Interpreter-internal write that ignores constant/protected flags.
    /// Used for dunder maintenance only.
    pub(crate) fn set_raw(&mut self, name: &str, value: Value) {
        for frame in self.frames.iter_mut().rev() {
            if let Some(slot) = frame.slots.get_mut(name) {
                slot.value = value;
                return;
            }
        }
        let idx = self.frames.len() - 1;
        self.frames[idx]
            .slots
            .insert(name.to_owned(), Slot { value, ..Slot::default() });
    }

    fn find(&self, name: &str) -> Option<&Slot> {
        self.frames
            .iter()
            .rev()
            .find_map(|frame| frame.slots.get(name))
    }

    fn write(&mut self, name: &str, value: Value) -> Result<(), Burn> {
        let (first, rest) = split_path(name);

        // Locate the frame: nearest one defining the first segment, else innermost.
        let frame_idx = self
            .frames
            .iter()
            .rposition(|frame| frame.slots.contains_key(first))
            .unwrap_or(self.frames.len() - 1);
        let slot = self.frames[frame_idx]
            .slots
            .entry(first.to_owned())
            .or_default();

        if slot.constant {
            return Err(Burn::fatal(format!("cannot rewrite constant '{first}'")));
        }
        if slot.protected {
            return Err(Burn::fatal(format!("cannot write protected '{first}'")));
        }

        if rest.is_empty() {
            slot.value = value;
            return Ok(());
        }

        // Dotted write: walk into mappings, creating them as needed.
        let mut current = &mut slot.value;
        let (last, inner) = rest.split_last().unwrap_or((&"", &[]));
        for segment in inner {
            if !matches!(current, Value::Map(_)) {
                *current = Value::Map(Map::new());
            }
            let Value::Map(map) = current else { unreachable!() };
            if !map.contains_key(segment) {
                map.insert(*segment, Value::Map(Map::new()));
            }
            match map.get_mut(segment) {
                Some(next) => current = next,
                None => unreachable!(),
            }
        }
        if !matches!(current, Value::Map(_)) {
            *current = Value::Map(Map::new());
        }
        let Value::Map(map) = current else { unreachable!() };
        map.insert(*last, value);
        Ok(())
    }

    // ── Snapshots ─────────────────────────────────────────────────────────────

    /// Serialize the whole frame chain to JSON.
    ///
    /// Callables and handles cannot be serialized and produce an error, as
    /// they only make sense inside the host process.
    pub fn snapshot(&self) -> Result<Json, Burn> {
        let mut frames = Vec::with_capacity(self.frames.len());
        for frame in &self.frames {
            let mut names: Vec<&String> = frame.slots.keys().collect();
            names.sort();
            let mut slots = Vec::with_capacity(names.len());
            for name in names {
                let slot = &frame.slots[name];
                slots.push(json!({
                    "name": name,
                    "constant": slot.constant,
                    "protected": slot.protected,
                    "value": value_to_json(&slot.value)?,
                }));
            }
            frames.push(Json::Array(slots));
        }
        Ok(Json::Array(frames))
    }

    /// Rebuild a Crucible from a [`Crucible::snapshot`].
    pub fn restore(snapshot: &Json) -> Result<Self, Burn> {
        let frames_json = snapshot
            .as_array()
            .ok_or_else(|| Burn::fatal("snapshot is not an array of frames"))?;
        let mut frames = Vec::with_capacity(frames_json.len().max(1));
        for frame_json in frames_json {
            let slots_json = frame_json
                .as_array()
                .ok_or_else(|| Burn::fatal("snapshot frame is not an array"))?;
            let mut frame = Frame::default();
            for slot_json in slots_json {
                let name = slot_json["name"]
                    .as_str()
                    .ok_or_else(|| Burn::fatal("snapshot slot without a name"))?;
                frame.slots.insert(
                    name.to_owned(),
                    Slot {
                        value: json_to_value(&slot_json["value"])?,
                        constant: slot_json["constant"].as_bool().unwrap_or(false),
                        protected: slot_json["protected"].as_bool().unwrap_or(false),
                    },
                );
            }
            frames.push(frame);
        }
        if frames.is_empty() {
            frames.push(Frame::default());
        }
        Ok(Crucible { frames })
    }
}

fn split_path(name: &str) -> (&str, Vec<&str>) {
    let mut parts = name.split('.');
    let first = parts.next().unwrap_or(name);
    (first, parts.collect())
}

fn index_value<'v>(value: &'v Value, segment: &str) -> Option<&'v Value> {
    match value {
        Value::Map(map) => map.get(segment),
        Value::List(items) => items.get(segment.parse::<usize>().ok()?),
        _ => None,
    }
}

fn value_to_json(value: &Value) -> Result<Json, Burn> {
    Ok(match value {
        Value::None => json!({"type": "none"}),
        Value::Bool(b) => json!({"type": "bool", "value": b}),
        Value::Num(n) => json!({"type": "num", "value": n}),
        Value::Str(s) => json!({"type": "str", "value": s}),
        Value::List(items) => {
            let items: Result<Vec<Json>, Burn> = items.iter().map(value_to_json).collect();
            json!({"type": "list", "value": items?})
        }
        Value::Map(map) => {
            let mut pairs = Vec::with_capacity(map.len());
            for (key, item) in map.iter() {
                pairs.push(json!([key, value_to_json(item)?]));
            }
            json!({"type": "map", "value": pairs})
        }
        Value::Callable(c) => {
            return Err(Burn::fatal(format!(
                "cannot serialize callable '{}'",
                c.name()
            )))
        }
        Value::Handle(h) => {
            return Err(Burn::fatal(format!("cannot serialize handle '{}'", h.tag())))
        }
    })
}

fn json_to_value(json: &Json) -> Result<Value, Burn> {
    let kind = json["type"]
        .as_str()
        .ok_or_else(|| Burn::fatal("snapshot value without a type tag"))?;
    Ok(match kind {
        "none" => Value::None,
        "bool" => Value::Bool(json["value"].as_bool().unwrap_or(false)),
        "num" => Value::Num(json["value"].as_f64().unwrap_or(0.0)),
        "str" => Value::Str(json["value"].as_str().unwrap_or("").to_owned()),
        "list" => {
            let items = json["value"].as_array().cloned().unwrap_or_default();
            let items: Result<Vec<Value>, Burn> = items.iter().map(json_to_value).collect();
            Value::List(items?)
        }
        "map" => {
            let pairs = json["value"].as_array().cloned().unwrap_or_default();
            let mut map = Map::new();
            for pair in &pairs {
                let key = pair[0]
                    .as_str()
                    .ok_or_else(|| Burn::fatal("snapshot map key is not a string"))?;
                map.insert(key, json_to_value(&pair[1])?);
            }
            Value::Map(map)
        }
        other => return Err(Burn::fatal(format!("unknown snapshot type '{other}'"))),
    })
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn set_and_get() {
        let mut env = Crucible::new();
        env.set("hp", Value::Num(10.0)).unwrap();
        assert_eq!(env.get("hp"), Some(Value::Num(10.0)));
        assert!(env.contains("hp"));
        assert!(!env.contains("mp"));
    }

    #[test]
    fn lookup_walks_outward() {
        let mut env = Crucible::new();
        env.set("outer", Value::Num(1.0)).unwrap();
        env.push_frame();
        env.set("inner", Value::Num(2.0)).unwrap();
        assert_eq!(env.get("outer"), Some(Value::Num(1.0)));
        assert_eq!(env.get("inner"), Some(Value::Num(2.0)));
        env.pop_frame();
        assert_eq!(env.get("inner"), None);
    }

    #[test]
    fn write_targets_defining_frame() {
        let mut env = Crucible::new();
        env.set("x", Value::Num(1.0)).unwrap();
        env.push_frame();
        env.set("x", Value::Num(2.0)).unwrap();
        env.pop_frame();
        // The write reached the outer frame, not a shadow.
        assert_eq!(env.get("x"), Some(Value::Num(2.0)));
    }

    #[test]
    fn write_defaults_to_innermost() {
        let mut env = Crucible::new();
        env.push_frame();
        env.set("fresh", Value::Num(1.0)).unwrap();
        env.pop_frame();
        assert_eq!(env.get("fresh"), None);
    }

    #[test]
    fn const_rejects_rewrite() {
        let mut env = Crucible::new();
        env.define_const("MAX", Value::Num(5.0)).unwrap();
        assert!(env.set("MAX", Value::Num(6.0)).is_err());
        assert_eq!(env.get("MAX"), Some(Value::Num(5.0)));
    }

    #[test]
    fn const_rejects_redefine() {
        let mut env = Crucible::new();
        env.set("X", Value::Num(1.0)).unwrap();
        assert!(env.define_const("X", Value::Num(2.0)).is_err());
    }

    #[test]
    fn protected_rejects_write() {
        let mut env = Crucible::new();
        env.set("system", Value::Str("v1".into())).unwrap();
        assert!(env.protect("system"));
        assert!(env.set("system", Value::Str("v2".into())).is_err());
        assert!(!env.protect("missing"));
    }

    #[test]
    fn dotted_get_and_set() {
        let mut env = Crucible::new();
        env.set("player.stats.hp", Value::Num(10.0)).unwrap();
        assert_eq!(env.get("player.stats.hp"), Some(Value::Num(10.0)));
        assert!(matches!(env.get("player.stats"), Some(Value::Map(_))));
        assert_eq!(env.get("player.stats.mp"), None);
    }

    #[test]
    fn dotted_get_indexes_sequences() {
        let mut env = Crucible::new();
        env.set("bag", Value::List(vec![Value::Str("rope".into())]))
            .unwrap();
        assert_eq!(env.get("bag.0"), Some(Value::Str("rope".into())));
        assert_eq!(env.get("bag.1"), None);
    }

    #[test]
    fn unset() {
        let mut env = Crucible::new();
        env.set("gone", Value::Num(1.0)).unwrap();
        assert!(env.unset("gone"));
        assert!(!env.unset("gone"));
        assert_eq!(env.get("gone"), None);
    }

    #[test]
    fn dunder_detection() {
        assert!(is_dunder("__LINE__"));
        assert!(is_dunder("__ERROR__"));
        assert!(!is_dunder("__"));
        assert!(!is_dunder("plain"));
        assert!(!is_dunder("__almost"));
    }

    #[test]
    fn snapshot_round_trip() {
        let mut env = Crucible::new();
        env.set("name", Value::Str("ember".into())).unwrap();
        env.define_const("MAX", Value::Num(3.0)).unwrap();
        let mut map = Map::new();
        map.insert("k", Value::List(vec![Value::Bool(true), Value::None]));
        env.set("table", Value::Map(map)).unwrap();
        env.push_frame();
        env.set("local", Value::Num(9.0)).unwrap();

        let snap = env.snapshot().unwrap();
        let restored = Crucible::restore(&snap).unwrap();
        assert_eq!(restored.frame_count(), 2);
        assert_eq!(restored.get("name"), Some(Value::Str("ember".into())));
        assert_eq!(restored.get("local"), Some(Value::Num(9.0)));
        assert_eq!(restored.get("table.k.0"), Some(Value::Bool(true)));
        // Constant flag survives the round trip.
        let mut restored = restored;
        assert!(restored.set("MAX", Value::Num(4.0)).is_err());
    }

    #[test]
    fn snapshot_rejects_callables() {
        use crate::library::Callable;
        let mut env = Crucible::new();
        let callable = Callable::new("f", |_, _| Ok(Value::None));
        env.set("f", Value::Callable(callable)).unwrap();
        assert!(env.snapshot().is_err());
    }
}

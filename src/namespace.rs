use std::collections::HashMap;
use std::sync::Arc;

use crate::ast::MacroDef;
use crate::value::{self, OpResult, Value};

/// One render's name bindings: the caller-supplied root context (owned by
/// the render, never written), a stack of frames, and the render-wide macro
/// table.
///
/// Frame 0 is the base frame that shadows the root: top-level `#set`
/// bindings land there, so the caller's mapping is observed but never
/// mutated. `#foreach` bodies and macro/define invocations push and pop
/// frames above it.
pub(crate) struct Namespace {
    root: Value,
    frames: Vec<HashMap<String, Value>>,
    macros: HashMap<String, Arc<MacroDef>>,
}

impl Namespace {
    pub(crate) fn new(root: Value) -> Self {
        Self {
            root,
            frames: vec![HashMap::new()],
            macros: HashMap::new(),
        }
    }

    pub(crate) fn push_frame(&mut self) {
        self.frames.push(HashMap::new());
    }

    pub(crate) fn pop_frame(&mut self) {
        debug_assert!(self.frames.len() > 1, "base frame must not be popped");
        self.frames.pop();
    }

    /// Top-down lookup through the frames, falling back to the root context
    /// via the value protocol.
    pub(crate) fn get(&self, name: &str) -> OpResult<Option<Value>> {
        for frame in self.frames.iter().rev() {
            if let Some(found) = frame.get(name) {
                return Ok(Some(found.clone()));
            }
        }
        value::get_property(&self.root, name)
    }

    /// `#set` with a bare name: rebinds the innermost frame that already
    /// defines it, otherwise defines in the top frame. The root context is
    /// never a target; a root-defined name gets shadowed instead.
    pub(crate) fn set(&mut self, name: &str, value: Value) {
        for frame in self.frames.iter_mut().rev() {
            if frame.contains_key(name) {
                frame.insert(name.to_string(), value);
                return;
            }
        }
        self.define_local(name, value);
    }

    /// Binds in the top frame unconditionally (loop variables, macro
    /// parameters, `#define` names).
    pub(crate) fn define_local(&mut self, name: &str, value: Value) {
        self.frames
            .last_mut()
            .expect("namespace always has a base frame")
            .insert(name.to_string(), value);
    }

    /// Mutable slot for write-through assignment (`#set($a.b = ...)`).
    /// Searches the frames, then the root when it is a plain map; host
    /// objects are handled through the protocol instead.
    pub(crate) fn slot_mut(&mut self, name: &str) -> Option<&mut Value> {
        // Split finds the owning frame without holding two mutable borrows.
        let owner = self
            .frames
            .iter()
            .rposition(|frame| frame.contains_key(name));
        if let Some(idx) = owner {
            return self.frames[idx].get_mut(name);
        }
        if let Value::Map(entries) = &mut self.root {
            let key = Value::Str(name.to_string());
            return entries.iter_mut().find(|(k, _)| *k == key).map(|(_, v)| v);
        }
        None
    }

    #[cfg(test)]
    pub(crate) fn root(&self) -> &Value {
        &self.root
    }

    /// Macro registration; a later definition shadows an earlier one within
    /// the same render.
    pub(crate) fn define_macro(&mut self, def: Arc<MacroDef>) {
        self.macros.insert(def.name.clone(), def);
    }

    pub(crate) fn get_macro(&self, name: &str) -> Option<Arc<MacroDef>> {
        self.macros.get(name).cloned()
    }

    /// Detaches every frame above the base one, for hygienic macro bodies:
    /// the body sees the root context and render-wide bindings but not the
    /// caller's locals. The caller must hand the stash back to
    /// [`restore_locals`] on every exit path.
    pub(crate) fn isolate_locals(&mut self) -> Vec<HashMap<String, Value>> {
        self.frames.split_off(1)
    }

    pub(crate) fn restore_locals(&mut self, saved: Vec<HashMap<String, Value>>) {
        debug_assert_eq!(self.frames.len(), 1);
        self.frames.extend(saved);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn set_rebinds_the_defining_frame() {
        let mut ns = Namespace::new(Value::map([("root_only", 1)]));
        ns.define_local("x", Value::Int(1));
        ns.push_frame();
        ns.set("x", Value::Int(2));
        ns.pop_frame();
        assert_eq!(ns.get("x").expect("get"), Some(Value::Int(2)));
    }

    #[test]
    fn set_never_writes_the_root() {
        let mut ns = Namespace::new(Value::map([("x", 1)]));
        ns.set("x", Value::Int(9));
        assert_eq!(ns.get("x").expect("get"), Some(Value::Int(9)));
        assert_eq!(ns.root(), &Value::map([("x", 1)]));
    }

    #[test]
    fn locals_vanish_with_their_frame() {
        let mut ns = Namespace::new(Value::Map(Vec::new()));
        ns.push_frame();
        ns.define_local("loop_var", Value::Int(1));
        ns.pop_frame();
        assert_eq!(ns.get("loop_var").expect("get"), None);
    }
}

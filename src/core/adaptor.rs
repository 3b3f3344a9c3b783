// This module defines MethodProvider, the bridge between the backend and whatever produces
// method IR. The runtime never builds IR itself: when a method must be compiled it asks the
// provider for the body belonging to a MethodId, along with the flags that steer code
// generation for it. `signature` lets the runtime answer questions about a method (such as
// how its arguments are marshalled) without materializing the whole body. ModuleProvider is
// the in-memory implementation used by the command-line tool and by tests: it numbers the
// methods of a parsed module in order and looks them up by id or by name.

//! Method IR providers.

use crate::ir::parser::parse_module;
use crate::ir::{MethodBody, MethodId, Signature};
use super::error::JitResult;
use hashbrown::HashMap;

/// Supplies method bodies to the compiler.
pub trait MethodProvider: Send + Sync {
    /// A fresh copy of the method's IR, or `None` for an unknown id.
    fn method_body(&self, id: MethodId) -> Option<MethodBody>;

    fn signature(&self, id: MethodId) -> Option<Signature> {
        self.method_body(id).map(|b| b.sig)
    }

    /// Name used in diagnostics.
    fn method_name(&self, id: MethodId) -> String {
        self.method_body(id)
            .map(|b| b.name)
            .unwrap_or_else(|| id.to_string())
    }
}

/// Methods held in memory, numbered from zero.
#[derive(Debug, Default, Clone)]
pub struct ModuleProvider {
    methods: Vec<MethodBody>,
    by_name: HashMap<String, MethodId>,
}

impl ModuleProvider {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn parse(text: &str) -> JitResult<Self> {
        let mut provider = Self::new();
        for body in parse_module(text)? {
            provider.add(body);
        }
        Ok(provider)
    }

    pub fn add(&mut self, body: MethodBody) -> MethodId {
        let id = MethodId(self.methods.len() as u32);
        self.by_name.insert(body.name.clone(), id);
        self.methods.push(body);
        id
    }

    pub fn lookup(&self, name: &str) -> Option<MethodId> {
        self.by_name.get(name).copied()
    }

    pub fn len(&self) -> usize {
        self.methods.len()
    }

    pub fn is_empty(&self) -> bool {
        self.methods.is_empty()
    }

    pub fn ids(&self) -> impl Iterator<Item = MethodId> + '_ {
        (0..self.methods.len() as u32).map(MethodId)
    }

    pub fn get(&self, id: MethodId) -> Option<&MethodBody> {
        self.methods.get(id.0 as usize)
    }
}

impl MethodProvider for ModuleProvider {
    fn method_body(&self, id: MethodId) -> Option<MethodBody> {
        self.get(id).cloned()
    }

    fn signature(&self, id: MethodId) -> Option<Signature> {
        self.get(id).map(|b| b.sig.clone())
    }

    fn method_name(&self, id: MethodId) -> String {
        self.get(id).map(|b| b.name.clone()).unwrap_or_else(|| id.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_methods_are_numbered_in_order() {
        let provider = ModuleProvider::parse(
            "method first() -> void {\nbb0:\n  ret\n}\n\
             method second() -> i64 {\nbb0:\n  v0 = iconst 1\n  ret v0\n}\n",
        )
        .unwrap();
        assert_eq!(provider.len(), 2);
        assert_eq!(provider.lookup("second"), Some(MethodId(1)));
        assert_eq!(provider.method_name(MethodId(0)), "first");
        assert!(provider.method_body(MethodId(2)).is_none());
        assert_eq!(provider.method_name(MethodId(9)), MethodId(9).to_string());
    }
}

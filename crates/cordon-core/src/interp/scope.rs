use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;

use super::value::Value;

/// One level of name bindings. Lookups walk parents; assignment always
/// writes the innermost level.
#[derive(Default)]
pub struct Scope {
    vars: RefCell<HashMap<String, Value>>,
    parent: Option<Rc<Scope>>,
}

impl Scope {
    pub fn root() -> Rc<Self> {
        Rc::new(Self::default())
    }

    pub fn child(parent: &Rc<Scope>) -> Rc<Self> {
        Rc::new(Self {
            vars: RefCell::new(HashMap::new()),
            parent: Some(parent.clone()),
        })
    }

    pub fn lookup(&self, name: &str) -> Option<Value> {
        if let Some(v) = self.vars.borrow().get(name) {
            return Some(v.clone());
        }
        self.parent.as_ref().and_then(|p| p.lookup(name))
    }

    pub fn get_local(&self, name: &str) -> Option<Value> {
        self.vars.borrow().get(name).cloned()
    }

    pub fn set(&self, name: &str, value: Value) {
        self.vars.borrow_mut().insert(name.to_string(), value);
    }

    /// Bindings of this level only, sorted by name.
    pub fn snapshot(&self) -> Vec<(String, Value)> {
        let mut vars: Vec<(String, Value)> = self
            .vars
            .borrow()
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        vars.sort_by(|a, b| a.0.cmp(&b.0));
        vars
    }

    pub fn take_vars(&self) -> HashMap<String, Value> {
        std::mem::take(&mut *self.vars.borrow_mut())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_child_shadows_parent() {
        let base = Scope::root();
        base.set("x", Value::Int(1));
        let inner = Scope::child(&base);
        assert_eq!(inner.lookup("x"), Some(Value::Int(1)));
        inner.set("x", Value::Int(2));
        assert_eq!(inner.lookup("x"), Some(Value::Int(2)));
        assert_eq!(base.lookup("x"), Some(Value::Int(1)));
        assert!(inner.get_local("y").is_none());
    }
}

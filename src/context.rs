//! Execution context: the scope chain of one render
//!
//! Scope levels, outer to inner: application (process-wide), session (per
//! session id), page (per render), then a stack of function and loop frames.
//! Application and session scopes are shared between renders behind
//! `RwLock`s owned by the [`Runtime`](crate::runtime::Runtime); locks are
//! taken for single reads or writes and never held across an `.await`.

use crate::evaluator::Resolver;
use crate::types::Value;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::{Arc, PoisonError, RwLock};

/// Scope level
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ScopeKind {
    Application,
    Session,
    Page,
    Function,
    Loop,
}

impl ScopeKind {
    /// Parse a scope qualifier (`scope="session"`, `session.x`)
    pub fn parse(name: &str) -> Option<ScopeKind> {
        let kind = match name.to_ascii_lowercase().as_str() {
            "application" => ScopeKind::Application,
            "session" => ScopeKind::Session,
            "page" | "request" => ScopeKind::Page,
            "function" | "local" => ScopeKind::Function,
            "loop" => ScopeKind::Loop,
            _ => return None,
        };
        Some(kind)
    }
}

impl fmt::Display for ScopeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ScopeKind::Application => "application",
            ScopeKind::Session => "session",
            ScopeKind::Page => "page",
            ScopeKind::Function => "function",
            ScopeKind::Loop => "loop",
        };
        f.write_str(name)
    }
}

/// A single mapping from names to values
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Scope {
    vars: BTreeMap<String, Value>,
}

impl Scope {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, name: &str) -> Option<&Value> {
        self.vars.get(name)
    }

    pub fn get_mut(&mut self, name: &str) -> Option<&mut Value> {
        self.vars.get_mut(name)
    }

    pub fn set(&mut self, name: impl Into<String>, value: Value) {
        self.vars.insert(name.into(), value);
    }

    pub fn remove(&mut self, name: &str) -> Option<Value> {
        self.vars.remove(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.vars.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.vars.len()
    }

    pub fn is_empty(&self) -> bool {
        self.vars.is_empty()
    }

    pub fn vars(&self) -> &BTreeMap<String, Value> {
        &self.vars
    }

    /// The scope as an object value
    pub fn snapshot(&self) -> Value {
        Value::Object(self.vars.clone())
    }
}

/// A scope shared between renders
pub type SharedScope = Arc<RwLock<Scope>>;

pub fn shared_scope() -> SharedScope {
    Arc::new(RwLock::new(Scope::new()))
}

fn read_shared<T>(scope: &SharedScope, f: impl FnOnce(&Scope) -> T) -> T {
    let guard = scope.read().unwrap_or_else(PoisonError::into_inner);
    f(&guard)
}

fn write_shared<T>(scope: &SharedScope, f: impl FnOnce(&mut Scope) -> T) -> T {
    let mut guard = scope.write().unwrap_or_else(PoisonError::into_inner);
    f(&mut guard)
}

#[derive(Debug)]
struct Frame {
    kind: ScopeKind,
    scope: Scope,
}

/// Per-render scope chain
#[derive(Debug)]
pub struct ExecutionContext {
    application: SharedScope,
    session: SharedScope,
    page: Scope,
    frames: Vec<Frame>,
    /// Caller frames set aside while a function runs
    suspended: Vec<Vec<Frame>>,
}

impl ExecutionContext {
    pub fn new(application: SharedScope, session: SharedScope) -> Self {
        Self {
            application,
            session,
            page: Scope::new(),
            frames: Vec::new(),
            suspended: Vec::new(),
        }
    }

    /// A context with private application and session scopes
    pub fn isolated() -> Self {
        Self::new(shared_scope(), shared_scope())
    }

    /// Resolve a name, innermost frame first
    pub fn resolve(&self, name: &str) -> Value {
        for frame in self.frames.iter().rev() {
            if let Some(value) = frame.scope.get(name) {
                return value.clone();
            }
        }
        if let Some(value) = self.page.get(name) {
            return value.clone();
        }
        if let Some(value) = read_shared(&self.session, |s| s.get(name).cloned()) {
            return value;
        }
        if let Some(value) = read_shared(&self.application, |s| s.get(name).cloned()) {
            return value;
        }

        match ScopeKind::parse(name) {
            Some(ScopeKind::Application) => read_shared(&self.application, Scope::snapshot),
            Some(ScopeKind::Session) => read_shared(&self.session, Scope::snapshot),
            Some(ScopeKind::Page) if name.eq_ignore_ascii_case("page") => self.page.snapshot(),
            _ => Value::Undefined,
        }
    }

    /// Declare a binding at an explicit level. Function and loop levels
    /// target the innermost frame (the page when no frame is open).
    pub fn declare(&mut self, name: &str, value: Value, level: ScopeKind) {
        match level {
            ScopeKind::Application => write_shared(&self.application, |s| s.set(name, value)),
            ScopeKind::Session => write_shared(&self.session, |s| s.set(name, value)),
            ScopeKind::Page => self.page.set(name, value),
            ScopeKind::Function | ScopeKind::Loop => self.innermost_mut().set(name, value),
        }
    }

    /// Declare in the innermost open scope
    pub fn declare_local(&mut self, name: &str, value: Value) {
        self.innermost_mut().set(name, value);
    }

    /// Unqualified write: update the innermost existing binding without
    /// crossing a function boundary, otherwise declare innermost
    pub fn assign(&mut self, name: &str, value: Value) {
        match self.visible_binding_mut(name) {
            Some(slot) => *slot = value,
            None => self.declare_local(name, value),
        }
    }

    /// Write through a dotted path (`user.address.city`)
    pub fn assign_path(&mut self, path: &[String], value: Value, level: Option<ScopeKind>) {
        let Some((root, rest)) = path.split_first() else {
            return;
        };
        if rest.is_empty() {
            match level {
                Some(level) => self.declare(root, value, level),
                None => self.assign(root, value),
            }
            return;
        }

        let mut current = match level {
            Some(level) => self.read_at(root, level),
            None => self
                .visible_binding_mut(root)
                .map(|v| v.clone())
                .unwrap_or_default(),
        };
        current.set_path(rest, value);
        match level {
            Some(level) => self.declare(root, current, level),
            None => self.assign(root, current),
        }
    }

    /// Read a binding at one level only
    pub fn read_at(&self, name: &str, level: ScopeKind) -> Value {
        let value = match level {
            ScopeKind::Application => read_shared(&self.application, |s| s.get(name).cloned()),
            ScopeKind::Session => read_shared(&self.session, |s| s.get(name).cloned()),
            ScopeKind::Page => self.page.get(name).cloned(),
            ScopeKind::Function | ScopeKind::Loop => self.innermost().get(name).cloned(),
        };
        value.unwrap_or_default()
    }

    /// Value visible to an unqualified read-modify-write (`operation="add"`)
    pub fn current(&self, name: &str, level: Option<ScopeKind>) -> Value {
        match level {
            Some(level) => self.read_at(name, level),
            None => self.resolve(name),
        }
    }

    pub fn enter_scope(&mut self, kind: ScopeKind) {
        self.frames.push(Frame {
            kind,
            scope: Scope::new(),
        });
    }

    /// Drop the innermost frame and everything bound in it
    pub fn exit_scope(&mut self) {
        self.frames.pop();
    }

    /// Set aside every frame above the page and open a function frame
    pub fn enter_function(&mut self) {
        let caller = std::mem::take(&mut self.frames);
        self.suspended.push(caller);
        self.enter_scope(ScopeKind::Function);
    }

    /// Drop the function's frames and restore the caller's
    pub fn exit_function(&mut self) {
        self.frames = self.suspended.pop().unwrap_or_default();
    }

    /// Number of active function calls
    pub fn call_depth(&self) -> usize {
        self.suspended.len()
    }

    /// Kind of the innermost open scope
    pub fn innermost_kind(&self) -> ScopeKind {
        self.frames.last().map(|f| f.kind).unwrap_or(ScopeKind::Page)
    }

    /// Seed page variables before a render
    pub fn seed(&mut self, vars: impl IntoIterator<Item = (String, Value)>) {
        for (name, value) in vars {
            self.page.set(name, value);
        }
    }

    pub fn page(&self) -> &Scope {
        &self.page
    }

    pub fn application(&self) -> &SharedScope {
        &self.application
    }

    pub fn session(&self) -> &SharedScope {
        &self.session
    }

    fn innermost(&self) -> &Scope {
        self.frames.last().map(|f| &f.scope).unwrap_or(&self.page)
    }

    fn innermost_mut(&mut self) -> &mut Scope {
        match self.frames.last_mut() {
            Some(frame) => &mut frame.scope,
            None => &mut self.page,
        }
    }

    fn visible_binding_mut(&mut self, name: &str) -> Option<&mut Value> {
        let mut reaches_page = true;
        let mut found = None;
        for (i, frame) in self.frames.iter().enumerate().rev() {
            if frame.scope.contains(name) {
                found = Some(i);
                break;
            }
            if frame.kind == ScopeKind::Function {
                reaches_page = false;
                break;
            }
        }
        match found {
            Some(i) => self.frames[i].scope.get_mut(name),
            None if reaches_page => self.page.get_mut(name),
            None => None,
        }
    }
}

impl Resolver for ExecutionContext {
    fn resolve(&self, name: &str) -> Value {
        ExecutionContext::resolve(self, name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resolution_order() {
        let mut ctx = ExecutionContext::isolated();
        ctx.declare("x", Value::from("app"), ScopeKind::Application);
        assert_eq!(ctx.resolve("x"), Value::from("app"));
        ctx.declare("x", Value::from("session"), ScopeKind::Session);
        assert_eq!(ctx.resolve("x"), Value::from("session"));
        ctx.declare("x", Value::from("page"), ScopeKind::Page);
        assert_eq!(ctx.resolve("x"), Value::from("page"));

        ctx.enter_scope(ScopeKind::Loop);
        ctx.declare_local("x", Value::from("loop"));
        assert_eq!(ctx.resolve("x"), Value::from("loop"));
        ctx.exit_scope();
        assert_eq!(ctx.resolve("x"), Value::from("page"));
    }

    #[test]
    fn test_loop_locals_vanish_on_exit() {
        let mut ctx = ExecutionContext::isolated();
        ctx.enter_scope(ScopeKind::Loop);
        ctx.assign("tmp", Value::Integer(1));
        ctx.exit_scope();
        assert_eq!(ctx.resolve("tmp"), Value::Undefined);
    }

    #[test]
    fn test_assign_updates_enclosing_binding() {
        let mut ctx = ExecutionContext::isolated();
        ctx.assign("count", Value::Integer(0));
        ctx.enter_scope(ScopeKind::Loop);
        ctx.assign("count", Value::Integer(3));
        ctx.exit_scope();
        assert_eq!(ctx.resolve("count"), Value::Integer(3));
    }

    #[test]
    fn test_function_frame_hides_caller_locals() {
        let mut ctx = ExecutionContext::isolated();
        ctx.assign("total", Value::Integer(1));
        ctx.enter_scope(ScopeKind::Loop);
        ctx.declare_local("item", Value::from("a"));

        ctx.enter_function();
        assert_eq!(ctx.resolve("item"), Value::Undefined);
        // Page variables stay readable, but writes stay local
        assert_eq!(ctx.resolve("total"), Value::Integer(1));
        ctx.assign("total", Value::Integer(99));
        assert_eq!(ctx.resolve("total"), Value::Integer(99));
        assert_eq!(ctx.call_depth(), 1);
        ctx.exit_function();

        assert_eq!(ctx.resolve("item"), Value::from("a"));
        assert_eq!(ctx.resolve("total"), Value::Integer(1));
        ctx.exit_scope();
        assert_eq!(ctx.call_depth(), 0);
    }

    #[test]
    fn test_dotted_paths() {
        let mut ctx = ExecutionContext::isolated();
        let path = vec!["user".to_string(), "name".to_string()];
        ctx.assign_path(&path, Value::from("Ada"), None);
        assert_eq!(ctx.resolve("user").member("name"), Value::from("Ada"));

        let path = vec!["prefs".to_string(), "theme".to_string()];
        ctx.assign_path(&path, Value::from("dark"), Some(ScopeKind::Session));
        assert_eq!(
            ctx.read_at("prefs", ScopeKind::Session).member("theme"),
            Value::from("dark")
        );
    }

    #[test]
    fn test_scope_objects() {
        let session = shared_scope();
        let mut ctx = ExecutionContext::new(shared_scope(), session.clone());
        ctx.declare("visits", Value::Integer(2), ScopeKind::Session);
        assert_eq!(ctx.resolve("session").member("visits"), Value::Integer(2));

        // Shared scopes outlive the context
        let other = ExecutionContext::new(shared_scope(), session);
        assert_eq!(other.resolve("visits"), Value::Integer(2));
    }
}

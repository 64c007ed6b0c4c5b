//! Per-operation callback registry.
//!
//! Every statement runs the `before_query` hooks registered for its
//! [`Operation`] in registration order; a hook may rewrite the SQL or abort
//! the statement. `after_query` hooks see the outcome.
//!
//! ```ignore
//! use pgseam::callbacks::from_fn;
//! use pgseam::monitor::HookAction;
//!
//! db.callback().delete().register("forbid_hard_delete", from_fn(|ctx| {
//!     if ctx.setting("tenant").is_none() {
//!         HookAction::Abort("tenant not set".into())
//!     } else {
//!         HookAction::Continue
//!     }
//! }));
//! ```

use crate::error::{OrmError, OrmResult};
use crate::monitor::{HookAction, QueryContext, QueryHook, QueryResult, QueryType};
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;

/// The engine operation a statement belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operation {
    Create,
    Query,
    Update,
    Delete,
    /// `row`, `rows`, `pluck`, `count` and `raw` reads.
    RowQuery,
    /// `exec`.
    Raw,
    /// DDL and schema introspection.
    Schema,
    /// BEGIN / COMMIT / ROLLBACK.
    Transaction,
}

impl Operation {
    pub fn as_str(self) -> &'static str {
        match self {
            Operation::Create => "create",
            Operation::Query => "query",
            Operation::Update => "update",
            Operation::Delete => "delete",
            Operation::RowQuery => "row_query",
            Operation::Raw => "raw",
            Operation::Schema => "schema",
            Operation::Transaction => "transaction",
        }
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

type Registered = Vec<(String, Arc<dyn QueryHook>)>;

/// Callback registry shared by every session derived from one root.
#[derive(Default)]
pub struct Callbacks {
    processors: RwLock<HashMap<Operation, Registered>>,
}

impl fmt::Debug for Callbacks {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let processors = self.processors.read().unwrap_or_else(PoisonError::into_inner);
        let mut map = f.debug_map();
        for (op, hooks) in processors.iter() {
            map.entry(op, &hooks.iter().map(|(n, _)| n.as_str()).collect::<Vec<_>>());
        }
        map.finish()
    }
}

impl Callbacks {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn processor(&self, operation: Operation) -> CallbackProcessor<'_> {
        CallbackProcessor {
            callbacks: self,
            operation,
        }
    }

    pub fn create(&self) -> CallbackProcessor<'_> {
        self.processor(Operation::Create)
    }

    pub fn query(&self) -> CallbackProcessor<'_> {
        self.processor(Operation::Query)
    }

    pub fn update(&self) -> CallbackProcessor<'_> {
        self.processor(Operation::Update)
    }

    pub fn delete(&self) -> CallbackProcessor<'_> {
        self.processor(Operation::Delete)
    }

    pub fn row_query(&self) -> CallbackProcessor<'_> {
        self.processor(Operation::RowQuery)
    }

    pub fn raw(&self) -> CallbackProcessor<'_> {
        self.processor(Operation::Raw)
    }

    fn hooks(&self, operation: Operation) -> Registered {
        self.processors
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&operation)
            .cloned()
            .unwrap_or_default()
    }

    /// Run `before_query` hooks; rewrites are applied to `ctx`.
    pub(crate) fn run_before(&self, ctx: &mut QueryContext) -> OrmResult<()> {
        for (name, hook) in self.hooks(ctx.operation) {
            match hook.before_query(ctx) {
                HookAction::Continue => {}
                HookAction::ModifySql(sql) => {
                    ctx.query_type = QueryType::from_sql(&sql);
                    ctx.sql = sql;
                }
                HookAction::Abort(reason) => {
                    return Err(OrmError::validation(format!(
                        "{} aborted by callback `{name}`: {reason}",
                        ctx.operation
                    )));
                }
            }
        }
        Ok(())
    }

    pub(crate) fn run_after(&self, ctx: &QueryContext, duration: Duration, result: &QueryResult) {
        for (_, hook) in self.hooks(ctx.operation) {
            hook.after_query(ctx, duration, result);
        }
    }
}

/// Callbacks of one operation, e.g. `db.callback().create()`.
pub struct CallbackProcessor<'a> {
    callbacks: &'a Callbacks,
    operation: Operation,
}

impl CallbackProcessor<'_> {
    fn with<R>(&self, f: impl FnOnce(&mut Registered) -> R) -> R {
        let mut processors = self
            .callbacks
            .processors
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        f(processors.entry(self.operation).or_default())
    }

    /// Append a hook; a hook with the same name is replaced in place.
    pub fn register(&self, name: impl Into<String>, hook: impl QueryHook + 'static) {
        self.register_arc(name, Arc::new(hook));
    }

    pub fn register_arc(&self, name: impl Into<String>, hook: Arc<dyn QueryHook>) {
        let name = name.into();
        self.with(|hooks| match hooks.iter_mut().find(|(n, _)| *n == name) {
            Some(slot) => slot.1 = hook,
            None => hooks.push((name, hook)),
        });
    }

    /// Replace an existing hook. Returns `false` when no hook has that name.
    pub fn replace(&self, name: &str, hook: impl QueryHook + 'static) -> bool {
        let hook: Arc<dyn QueryHook> = Arc::new(hook);
        self.with(|hooks| match hooks.iter_mut().find(|(n, _)| n == name) {
            Some(slot) => {
                slot.1 = hook;
                true
            }
            None => false,
        })
    }

    /// Remove a hook. Returns `false` when no hook has that name.
    pub fn remove(&self, name: &str) -> bool {
        self.with(|hooks| {
            let before = hooks.len();
            hooks.retain(|(n, _)| n != name);
            hooks.len() != before
        })
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn QueryHook>> {
        self.with(|hooks| {
            hooks
                .iter()
                .find(|(n, _)| n == name)
                .map(|(_, h)| h.clone())
        })
    }

    /// Registered hook names, in execution order.
    pub fn names(&self) -> Vec<String> {
        self.with(|hooks| hooks.iter().map(|(n, _)| n.clone()).collect())
    }
}

/// A `before_query` hook from a closure.
pub fn from_fn<F>(f: F) -> impl QueryHook + 'static
where
    F: Fn(&QueryContext) -> HookAction + Send + Sync + 'static,
{
    FnHook(f)
}

struct FnHook<F>(F);

impl<F> QueryHook for FnHook<F>
where
    F: Fn(&QueryContext) -> HookAction + Send + Sync,
{
    fn before_query(&self, ctx: &QueryContext) -> HookAction {
        (self.0)(ctx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx(operation: Operation) -> QueryContext {
        QueryContext::new(operation, r#"DELETE FROM "users""#, 0)
    }

    #[test]
    fn hooks_run_in_order_and_can_rewrite() {
        let callbacks = Callbacks::new();
        callbacks.delete().register(
            "soft",
            from_fn(|_| HookAction::ModifySql(r#"UPDATE "users" SET deleted = true"#.into())),
        );
        callbacks.delete().register(
            "check",
            from_fn(|ctx| {
                assert_eq!(ctx.query_type, QueryType::Update);
                HookAction::Continue
            }),
        );

        let mut ctx = ctx(Operation::Delete);
        callbacks.run_before(&mut ctx).unwrap();
        assert!(ctx.sql.starts_with("UPDATE"));
        assert_eq!(callbacks.delete().names(), vec!["soft", "check"]);
    }

    #[test]
    fn abort_becomes_an_error() {
        let callbacks = Callbacks::new();
        callbacks
            .delete()
            .register("deny", from_fn(|_| HookAction::Abort("nope".into())));

        let err = callbacks.run_before(&mut ctx(Operation::Delete)).unwrap_err();
        assert!(err.to_string().contains("nope"));

        // Other operations are unaffected.
        assert!(callbacks.run_before(&mut ctx(Operation::Query)).is_ok());
    }

    #[test]
    fn replace_and_remove_by_name() {
        let callbacks = Callbacks::new();
        callbacks
            .create()
            .register("a", from_fn(|_| HookAction::Abort("a".into())));
        assert!(callbacks.create().replace("a", from_fn(|_| HookAction::Continue)));
        assert!(!callbacks.create().replace("missing", from_fn(|_| HookAction::Continue)));
        assert!(callbacks.run_before(&mut ctx(Operation::Create)).is_ok());

        assert!(callbacks.create().remove("a"));
        assert!(!callbacks.create().remove("a"));
        assert!(callbacks.create().get("a").is_none());
    }
}

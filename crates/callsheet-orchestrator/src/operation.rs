//! Named units of work.
//!
//! An [`Operation`] pairs an id and a display name with an [`OperationStep`].
//! Steps are either trait implementations (see `callsheet-provisioning`) or async
//! closures wrapped with [`Operation::new`]. Closure hooks can be attached to
//! either kind with the builder methods.

use crate::id::{DEFAULT_ID_LENGTH, new_id};
use async_trait::async_trait;
use callsheet_abstraction::{OperationContext, OperationError, OperationStep, Result};
use futures::FutureExt;
use futures::future::BoxFuture;
use serde_json::Value;
use std::fmt;
use std::future::Future;

type ExecFn = Box<dyn Fn(OperationContext) -> BoxFuture<'static, Result<Value>> + Send + Sync>;
type CompensateFn = Box<dyn Fn(OperationContext) -> BoxFuture<'static, Result<()>> + Send + Sync>;
type ValidateFn = Box<dyn Fn(&OperationContext) -> bool + Send + Sync>;
type CompletedFn = Box<dyn Fn(&Value) + Send + Sync>;
type ExceptionFn = Box<dyn Fn(&OperationError) + Send + Sync>;

/// Step backed by an async closure.
///
/// The closure receives a snapshot of the context, so values it wants to pass on
/// must travel through its return value.
struct FnStep {
    exec: ExecFn,
}

#[async_trait]
impl OperationStep for FnStep {
    async fn execute(&self, ctx: &mut OperationContext) -> Result<Value> {
        (self.exec)(ctx.clone()).await
    }
}

/// A named unit of work with optional validation, completion, exception and
/// compensation hooks.
pub struct Operation {
    id: String,
    name: String,
    step: Box<dyn OperationStep>,
    validator: Option<ValidateFn>,
    completed: Option<CompletedFn>,
    exception: Option<ExceptionFn>,
    compensation: Option<CompensateFn>,
}

impl fmt::Debug for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Operation")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("validator", &self.validator.is_some())
            .field("completed", &self.completed.is_some())
            .field("exception", &self.exception.is_some())
            .field("compensation", &self.has_compensation())
            .finish_non_exhaustive()
    }
}

impl Operation {
    /// Creates an operation from an async closure.
    ///
    /// # Arguments
    /// * `name` - Display name
    /// * `exec` - Closure producing the operation's result
    pub fn new<F, Fut>(name: impl Into<String>, exec: F) -> Self
    where
        F: Fn(OperationContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value>> + Send + 'static,
    {
        let step = FnStep { exec: Box::new(move |ctx| exec(ctx).boxed()) };
        Self::from_step(name, step)
    }

    /// Creates an operation from a step implementation.
    pub fn from_step(name: impl Into<String>, step: impl OperationStep + 'static) -> Self {
        Self {
            id: new_id(DEFAULT_ID_LENGTH),
            name: name.into(),
            step: Box::new(step),
            validator: None,
            completed: None,
            exception: None,
            compensation: None,
        }
    }

    /// Replaces the step's own validator.
    #[must_use]
    pub fn with_validator<F>(mut self, validator: F) -> Self
    where
        F: Fn(&OperationContext) -> bool + Send + Sync + 'static,
    {
        self.validator = Some(Box::new(validator));
        self
    }

    /// Adds a handler invoked with the result after a successful validation.
    #[must_use]
    pub fn on_completed<F>(mut self, handler: F) -> Self
    where
        F: Fn(&Value) + Send + Sync + 'static,
    {
        self.completed = Some(Box::new(handler));
        self
    }

    /// Adds a handler invoked with the error when execution fails.
    ///
    /// The handler only reports; the run halts regardless.
    #[must_use]
    pub fn on_exception<F>(mut self, handler: F) -> Self
    where
        F: Fn(&OperationError) + Send + Sync + 'static,
    {
        self.exception = Some(Box::new(handler));
        self
    }

    /// Adds an undo action run if a later operation halts the run.
    #[must_use]
    pub fn with_compensation<F, Fut>(mut self, compensate: F) -> Self
    where
        F: Fn(OperationContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        self.compensation = Some(Box::new(move |ctx| compensate(ctx).boxed()));
        self
    }

    /// Overrides the generated id.
    #[must_use]
    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        self
    }

    /// The operation id.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// The display name.
    pub fn name(&self) -> &str {
        &self.name
    }

    pub(crate) async fn execute(&self, ctx: &mut OperationContext) -> Result<Value> {
        self.step.execute(ctx).await
    }

    pub(crate) fn validate(&self, ctx: &OperationContext) -> bool {
        match &self.validator {
            Some(validator) => validator(ctx),
            None => self.step.validate(ctx),
        }
    }

    pub(crate) fn notify_completed(&self, result: &Value) {
        self.step.on_completed(result);
        if let Some(handler) = &self.completed {
            handler(result);
        }
    }

    pub(crate) fn notify_error(&self, error: &OperationError) {
        self.step.on_error(error);
        if let Some(handler) = &self.exception {
            handler(error);
        }
    }

    /// Whether this operation can be undone.
    pub fn has_compensation(&self) -> bool {
        self.compensation.is_some() || self.step.has_compensation()
    }

    pub(crate) async fn compensate(&self, ctx: &mut OperationContext) -> Result<()> {
        if let Some(compensate) = &self.compensation {
            return compensate(ctx.clone()).await;
        }
        self.step.compensate(ctx).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use callsheet_abstraction::STATUS_FAILURE;
    use serde_json::json;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test]
    async fn test_closure_operation_executes() {
        let op = Operation::new("greet", |_ctx| async { Ok(json!("hello")) });
        let mut ctx = OperationContext::detached();
        assert_eq!(op.execute(&mut ctx).await.unwrap(), json!("hello"));
        assert_eq!(op.name(), "greet");
        assert_eq!(op.id().len(), DEFAULT_ID_LENGTH);
    }

    #[tokio::test]
    async fn test_closure_sees_context_snapshot() {
        let op = Operation::new("read", |ctx: OperationContext| async move {
            Ok(ctx.var("region").cloned().unwrap_or(Value::Null))
        });
        let mut ctx = OperationContext::detached();
        ctx.set_var("region", json!("westus2"));
        assert_eq!(op.execute(&mut ctx).await.unwrap(), json!("westus2"));
    }

    #[test]
    fn test_custom_validator_overrides_default() {
        let op = Operation::new("noop", |_ctx| async { Ok(Value::Null) })
            .with_validator(|ctx| ctx.last_status_code == STATUS_FAILURE);
        let ctx = OperationContext::detached();
        assert!(!op.validate(&ctx));
    }

    #[test]
    fn test_hooks_are_invoked() {
        let completed = Arc::new(AtomicUsize::new(0));
        let errors = Arc::new(AtomicUsize::new(0));
        let (c, e) = (completed.clone(), errors.clone());
        let op = Operation::new("noop", |_ctx| async { Ok(Value::Null) })
            .on_completed(move |_| {
                c.fetch_add(1, Ordering::SeqCst);
            })
            .on_exception(move |_| {
                e.fetch_add(1, Ordering::SeqCst);
            });

        op.notify_completed(&Value::Null);
        op.notify_error(&OperationError::Other("x".to_string()));
        assert_eq!(completed.load(Ordering::SeqCst), 1);
        assert_eq!(errors.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_compensation_flag() {
        let plain = Operation::new("plain", |_ctx| async { Ok(Value::Null) });
        assert!(!plain.has_compensation());

        let undoable = Operation::new("undoable", |_ctx| async { Ok(Value::Null) })
            .with_compensation(|_ctx| async { Ok(()) })
            .with_id("fixed");
        assert!(undoable.has_compensation());
        assert_eq!(undoable.id(), "fixed");
    }
}

//! Workflow body registry
//!
//! Maps workflow names to the bodies that implement them so that resume
//! and time-travel can re-dispatch a stored workflow without knowing
//! concrete types.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use futures::future::BoxFuture;

use super::context::WorkflowContext;
use super::step::StepError;

/// A user workflow body
///
/// The body drives its steps imperatively through
/// [`WorkflowContext::step`]; the runtime makes each step durable and
/// replays committed results on resume. Bodies must be deterministic in
/// their step sequence: given the same variables, the same steps in the
/// same order.
#[async_trait]
pub trait WorkflowBody: Send + Sync + 'static {
    /// Name used to dispatch start and resume requests
    fn name(&self) -> &str;

    async fn run(&self, ctx: &mut WorkflowContext) -> Result<(), StepError>;
}

/// Adapter turning a closure into a [`WorkflowBody`]
///
/// # Example
///
/// ```ignore
/// let body = BodyFn::new("greet", |ctx| Box::pin(async move {
///     ctx.step("hello", |_vars| async move {
///         Ok(serde_json::json!({"greeting": "hi"}))
///     }).await?;
///     Ok(())
/// }));
/// ```
pub struct BodyFn<F> {
    name: String,
    f: F,
}

impl<F> BodyFn<F>
where
    F: for<'a> Fn(&'a mut WorkflowContext) -> BoxFuture<'a, Result<(), StepError>>
        + Send
        + Sync
        + 'static,
{
    pub fn new(name: impl Into<String>, f: F) -> Self {
        Self {
            name: name.into(),
            f,
        }
    }
}

#[async_trait]
impl<F> WorkflowBody for BodyFn<F>
where
    F: for<'a> Fn(&'a mut WorkflowContext) -> BoxFuture<'a, Result<(), StepError>>
        + Send
        + Sync
        + 'static,
{
    fn name(&self) -> &str {
        &self.name
    }

    async fn run(&self, ctx: &mut WorkflowContext) -> Result<(), StepError> {
        (self.f)(ctx).await
    }
}

/// Registry of workflow bodies by name
#[derive(Default)]
pub struct WorkflowRegistry {
    bodies: HashMap<String, Arc<dyn WorkflowBody>>,
}

impl WorkflowRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a body under its own name. The latest registration for a
    /// name wins.
    pub fn register(&mut self, body: impl WorkflowBody) {
        self.register_arc(Arc::new(body));
    }

    pub fn register_arc(&mut self, body: Arc<dyn WorkflowBody>) {
        self.bodies.insert(body.name().to_string(), body);
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn WorkflowBody>> {
        self.bodies.get(name).cloned()
    }

    pub fn names(&self) -> Vec<&str> {
        self.bodies.keys().map(String::as_str).collect()
    }

    pub fn len(&self) -> usize {
        self.bodies.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bodies.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct NoopBody;

    #[async_trait]
    impl WorkflowBody for NoopBody {
        fn name(&self) -> &str {
            "noop"
        }

        async fn run(&self, _ctx: &mut WorkflowContext) -> Result<(), StepError> {
            Ok(())
        }
    }

    #[test]
    fn test_register_and_lookup() {
        let mut registry = WorkflowRegistry::new();
        assert!(registry.is_empty());

        registry.register(NoopBody);
        assert_eq!(registry.len(), 1);
        assert!(registry.get("noop").is_some());
        assert!(registry.get("missing").is_none());
    }

    #[test]
    fn test_latest_registration_wins() {
        let mut registry = WorkflowRegistry::new();
        registry.register(NoopBody);
        registry.register(NoopBody);
        assert_eq!(registry.len(), 1);
    }
}

//! # Execution scopes and the component factory seam.
//!
//! Tests run inside a chain of nested scopes: `runner > module > class >
//! test`. The runner walks this chain as it moves between test cases,
//! entering scopes lazily and exiting them once the next case no longer
//! shares them. A [`ComponentFactory`] observes every transition, which is
//! where fixtures tie setup and teardown to scope lifetimes.
//!
//! ## Rules
//!
//! - A scope is immutable once entered; transitions create new nodes.
//! - `exit_scope` reports teardown failures in the result instead of
//!   returning an error, so the runner can keep unwinding.
//! - The runner compares scope `data` by value to decide whether a module
//!   or class scope can be shared with the next test case.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;

use crate::error::TestFailure;
use crate::runner::testcase::{TestContext, TestFn, TestResult};

/// Nesting level of a scope.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ScopeLevel {
    Runner,
    Module,
    Class,
    Test,
}

impl ScopeLevel {
    #[must_use]
    pub fn name(self) -> &'static str {
        match self {
            ScopeLevel::Runner => "runner",
            ScopeLevel::Module => "module",
            ScopeLevel::Class => "class",
            ScopeLevel::Test => "test",
        }
    }
}

impl fmt::Display for ScopeLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// A node in the scope chain. Shared via [`Scope`].
#[derive(Debug)]
pub struct ScopeNode {
    level: ScopeLevel,
    parent: Option<Scope>,
    data: Option<Arc<str>>,
}

/// Shared handle to a scope node.
pub type Scope = Arc<ScopeNode>;

impl ScopeNode {
    /// Creates a new scope below `parent`.
    #[must_use]
    pub fn new(level: ScopeLevel, parent: Option<&Scope>, data: Option<Arc<str>>) -> Scope {
        Arc::new(ScopeNode {
            level,
            parent: parent.cloned(),
            data,
        })
    }

    #[must_use]
    pub fn level(&self) -> ScopeLevel {
        self.level
    }

    #[must_use]
    pub fn parent(&self) -> Option<&Scope> {
        self.parent.as_ref()
    }

    /// The designator this scope was entered for, e.g. the module name of a
    /// module scope.
    #[must_use]
    pub fn data(&self) -> Option<&str> {
        self.data.as_deref()
    }
}

impl fmt::Display for ScopeNode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.data {
            Some(data) => write!(f, "{}({})", self.level, data),
            None => write!(f, "{}", self.level),
        }
    }
}

/// Outcome of exiting one or more scopes.
#[derive(Debug, Default)]
pub struct ExitScopeResult {
    /// The scope the runner is left in after the exit, usually the parent
    /// of the scope that was exited.
    pub scope: Option<Scope>,
    /// False when any teardown failed.
    pub success: bool,
    /// The collected teardown failures.
    pub failures: Vec<TestFailure>,
}

impl ExitScopeResult {
    /// A successful exit leaving the runner in `scope`.
    #[must_use]
    pub fn passed(scope: Option<Scope>) -> Self {
        ExitScopeResult {
            scope,
            success: true,
            failures: Vec::new(),
        }
    }

    /// A failed exit leaving the runner in `scope`.
    #[must_use]
    pub fn failed(scope: Option<Scope>, failures: Vec<TestFailure>) -> Self {
        ExitScopeResult {
            scope,
            success: false,
            failures,
        }
    }

    /// Merges the outcome of a further exit into this one. The resulting
    /// scope is the later one; failures accumulate.
    pub fn combine(&mut self, other: ExitScopeResult) {
        self.scope = other.scope;
        self.success = self.success && other.success;
        self.failures.extend(other.failures);
    }
}

/// Hooks the runner calls around scope transitions and test bodies.
///
/// Implementations typically manage fixtures: create them when a scope is
/// entered, inject them into the body in [`ComponentFactory::call`] and tear
/// them down when the scope exits.
#[async_trait]
pub trait ComponentFactory: Send + Sync {
    /// Called when the runner enters a new scope.
    fn enter_scope(&self, level: ScopeLevel, parent: Option<&Scope>, data: Option<Arc<str>>)
        -> Scope;

    /// Called when the runner leaves a scope. Teardown failures are
    /// reported in the result; the returned scope becomes the runner's
    /// current one.
    async fn exit_scope(&self, scope: Scope) -> ExitScopeResult;

    /// Invokes a test body inside `scope`.
    async fn call(&self, test: &TestFn, context: TestContext, scope: &Scope) -> TestResult;
}

/// The plain factory: no fixtures, bodies are called as-is.
#[derive(Clone, Copy, Debug, Default)]
pub struct DirectFactory;

#[async_trait]
impl ComponentFactory for DirectFactory {
    fn enter_scope(
        &self,
        level: ScopeLevel,
        parent: Option<&Scope>,
        data: Option<Arc<str>>,
    ) -> Scope {
        ScopeNode::new(level, parent, data)
    }

    async fn exit_scope(&self, scope: Scope) -> ExitScopeResult {
        ExitScopeResult::passed(scope.parent().cloned())
    }

    async fn call(&self, test: &TestFn, context: TestContext, _scope: &Scope) -> TestResult {
        (test)(context).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scope_chain_links_to_parent() {
        let runner = ScopeNode::new(ScopeLevel::Runner, None, None);
        let module = ScopeNode::new(ScopeLevel::Module, Some(&runner), Some("net".into()));
        let test = ScopeNode::new(ScopeLevel::Test, Some(&module), Some("net.test_ping".into()));

        assert_eq!(test.level(), ScopeLevel::Test);
        assert_eq!(test.data(), Some("net.test_ping"));
        let parent = test.parent().unwrap();
        assert!(Arc::ptr_eq(parent, &module));
        assert!(Arc::ptr_eq(parent.parent().unwrap(), &runner));
        assert!(runner.parent().is_none());
    }

    #[test]
    fn test_scope_display() {
        let runner = ScopeNode::new(ScopeLevel::Runner, None, None);
        let module = ScopeNode::new(ScopeLevel::Module, Some(&runner), Some("net".into()));

        assert_eq!(runner.to_string(), "runner");
        assert_eq!(module.to_string(), "module(net)");
    }

    #[test]
    fn test_combine_accumulates_failures() {
        let runner = ScopeNode::new(ScopeLevel::Runner, None, None);
        let mut result = ExitScopeResult::passed(None);

        result.combine(ExitScopeResult::failed(
            Some(runner.clone()),
            vec![TestFailure::error("teardown failed")],
        ));
        result.combine(ExitScopeResult::passed(None));

        assert!(!result.success);
        assert_eq!(result.failures.len(), 1);
        assert!(result.scope.is_none());
    }

    #[tokio::test]
    async fn test_direct_factory_exit_returns_parent() {
        let factory = DirectFactory;
        let runner = factory.enter_scope(ScopeLevel::Runner, None, None);
        let module = factory.enter_scope(ScopeLevel::Module, Some(&runner), Some("net".into()));

        let result = factory.exit_scope(module).await;

        assert!(result.success);
        assert!(Arc::ptr_eq(&result.scope.unwrap(), &runner));
    }

    #[tokio::test]
    async fn test_direct_factory_calls_body() {
        use std::sync::atomic::{AtomicBool, Ordering as AtomicOrdering};

        let called = Arc::new(AtomicBool::new(false));
        let seen = Arc::clone(&called);
        let body: TestFn = Arc::new(move |_context| {
            let seen = Arc::clone(&seen);
            Box::pin(async move {
                seen.store(true, AtomicOrdering::SeqCst);
                Ok(())
            })
        });

        let factory = DirectFactory;
        let scope = factory.enter_scope(ScopeLevel::Runner, None, None);
        let definition = crate::runner::schedule::TestDefinition::new("net.test_ping", body);
        let test = crate::runner::testcase::TestCase::from_definition(&definition);

        let result = factory
            .call(test.run_fn(), test.run_context(), &scope)
            .await;

        assert!(result.is_ok());
        assert!(called.load(AtomicOrdering::SeqCst));
    }
}

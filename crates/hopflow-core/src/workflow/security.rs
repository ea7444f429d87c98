//! Security context propagation across broker hops.
//!
//! The starter captures an opaque token into the message; the executor
//! restores it for the duration of one step and hands the restored value to
//! the handler explicitly. Release is tied to [`SecurityScope`]'s `Drop`, so
//! it happens on every exit path: success, error, panic, or cancellation of
//! the surrounding future.

use std::sync::Arc;

/// Restored security state for one step invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SecurityContext {
    token: String,
    principal: Option<String>,
}

impl SecurityContext {
    pub fn new(token: impl Into<String>) -> Self {
        Self {
            token: token.into(),
            principal: None,
        }
    }

    pub fn with_principal(mut self, principal: impl Into<String>) -> Self {
        self.principal = Some(principal.into());
        self
    }

    pub fn token(&self) -> &str {
        &self.token
    }

    pub fn principal(&self) -> Option<&str> {
        self.principal.as_deref()
    }
}

/// Capture/restore/clear hooks for an application's security state.
pub trait SecurityContextPropagator: Send + Sync {
    /// Serialize the caller's current security state, if any.
    fn capture(&self) -> Option<String>;

    /// Rebuild the security state from a captured token.
    fn restore(&self, token: &str) -> SecurityContext;

    /// Release whatever `restore` established.
    fn clear(&self);
}

/// Propagator for deployments without security context.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopSecurityPropagator;

impl SecurityContextPropagator for NoopSecurityPropagator {
    fn capture(&self) -> Option<String> {
        None
    }

    fn restore(&self, token: &str) -> SecurityContext {
        SecurityContext::new(token)
    }

    fn clear(&self) {}
}

/// Guard holding a restored context for the length of one step.
pub struct SecurityScope {
    propagator: Arc<dyn SecurityContextPropagator>,
    context: Option<SecurityContext>,
}

impl SecurityScope {
    /// Restore `token` (when present) and arm the release.
    pub fn enter(propagator: Arc<dyn SecurityContextPropagator>, token: Option<&str>) -> Self {
        let context = token.map(|t| propagator.restore(t));
        Self {
            propagator,
            context,
        }
    }

    pub fn context(&self) -> Option<&SecurityContext> {
        self.context.as_ref()
    }
}

impl Drop for SecurityScope {
    fn drop(&mut self) {
        self.propagator.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[derive(Default)]
    struct RecordingPropagator {
        events: Mutex<Vec<String>>,
    }

    impl SecurityContextPropagator for RecordingPropagator {
        fn capture(&self) -> Option<String> {
            Some("captured".to_string())
        }

        fn restore(&self, token: &str) -> SecurityContext {
            self.events.lock().unwrap().push(format!("restore:{token}"));
            SecurityContext::new(token).with_principal("alice")
        }

        fn clear(&self) {
            self.events.lock().unwrap().push("clear".to_string());
        }
    }

    #[test]
    fn test_scope_restores_and_clears() {
        let propagator = Arc::new(RecordingPropagator::default());
        {
            let scope = SecurityScope::enter(propagator.clone(), Some("tok"));
            assert_eq!(scope.context().unwrap().principal(), Some("alice"));
        }
        assert_eq!(
            *propagator.events.lock().unwrap(),
            vec!["restore:tok".to_string(), "clear".to_string()]
        );
    }

    #[test]
    fn test_scope_clears_on_panic() {
        let propagator = Arc::new(RecordingPropagator::default());
        let p = propagator.clone();
        let result = std::panic::catch_unwind(move || {
            let _scope = SecurityScope::enter(p, None);
            panic!("handler blew up");
        });
        assert!(result.is_err());
        // clear() ran during unwinding, which poisons the mutex.
        let events = propagator.events.lock().unwrap_or_else(|e| e.into_inner());
        assert_eq!(*events, vec!["clear".to_string()]);
    }

    #[test]
    fn test_noop_propagator() {
        let noop = NoopSecurityPropagator;
        assert!(noop.capture().is_none());
        assert_eq!(noop.restore("t").token(), "t");
    }
}

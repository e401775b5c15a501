//! Step automations
//!
//! An automation resolves a step without a human. At most one automation may
//! be bound to a step id; binding a second is an error, not a replacement.

use crate::result::{StagehandError, StagehandResult};
use crate::step::StepId;
use crate::surface::StepPrompt;
use std::any::Any;
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, PoisonError, RwLock};
use tracing::{debug, warn};

/// Resolves a step programmatically
pub trait Automation<E>: Send + Sync {
    /// Produce the step's result. An error fails the step with that error as the reason.
    fn resolve(&self, prompt: &StepPrompt) -> StagehandResult<E>;
}

impl<E, F> Automation<E> for F
where
    F: Fn(&StepPrompt) -> StagehandResult<E> + Send + Sync,
{
    fn resolve(&self, prompt: &StepPrompt) -> StagehandResult<E> {
        self(prompt)
    }
}

type Erased = Arc<dyn Any + Send + Sync>;

/// Automations keyed by step id
#[derive(Default)]
pub struct AutomationRegistry {
    bound: RwLock<HashMap<StepId, Erased>>,
}

impl fmt::Debug for AutomationRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let bound = self.bound.read().unwrap_or_else(PoisonError::into_inner);
        let mut ids: Vec<&StepId> = bound.keys().collect();
        ids.sort();
        f.debug_struct("AutomationRegistry")
            .field("bound", &ids)
            .finish()
    }
}

impl AutomationRegistry {
    /// Create an empty registry
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Bind `automation` to `step`
    pub fn bind<E, A>(&self, step: impl Into<StepId>, automation: A) -> StagehandResult<()>
    where
        E: 'static,
        A: Automation<E> + 'static,
    {
        let step = step.into();
        let mut bound = self.bound.write().unwrap_or_else(PoisonError::into_inner);
        if bound.contains_key(&step) {
            return Err(StagehandError::AutomationAlreadyBound {
                step: step.to_string(),
            });
        }
        let typed: Arc<dyn Automation<E>> = Arc::new(automation);
        debug!(%step, "automation bound");
        bound.insert(step, Arc::new(typed));
        Ok(())
    }

    /// Remove the automation bound to `step`
    pub fn unbind(&self, step: &StepId) -> bool {
        self.bound
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(step)
            .is_some()
    }

    /// Whether an automation is bound to `step`
    #[must_use]
    pub fn is_bound(&self, step: &StepId) -> bool {
        self.bound
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(step)
    }

    /// Automation bound to `step` producing `E`.
    ///
    /// An automation bound with a different result type is ignored with a warning.
    #[must_use]
    pub fn lookup<E: 'static>(&self, step: &StepId) -> Option<Arc<dyn Automation<E>>> {
        let erased = self
            .bound
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(step)
            .cloned()?;
        let typed = (*erased).downcast_ref::<Arc<dyn Automation<E>>>().cloned();
        if typed.is_none() {
            warn!(%step, "automation bound with a different result type; ignoring");
        }
        typed
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::step::Affordance;

    fn prompt(id: &str) -> StepPrompt {
        StepPrompt {
            id: StepId::new(id),
            instruction: "do it".into(),
            affordances: Affordance::standard(),
        }
    }

    #[test]
    fn test_second_bind_rejected() {
        let registry = AutomationRegistry::new();
        registry
            .bind("s1", |_: &StepPrompt| -> StagehandResult<()> { Ok(()) })
            .unwrap();
        let err = registry
            .bind("s1", |_: &StepPrompt| -> StagehandResult<()> { Ok(()) })
            .unwrap_err();
        assert!(matches!(err, StagehandError::AutomationAlreadyBound { .. }));
    }

    #[test]
    fn test_lookup_by_type() {
        let registry = AutomationRegistry::new();
        registry
            .bind("count", |_: &StepPrompt| -> StagehandResult<u32> { Ok(7) })
            .unwrap();
        let id = StepId::new("count");
        let automation = registry.lookup::<u32>(&id).unwrap();
        assert_eq!(automation.resolve(&prompt("count")).unwrap(), 7);
        assert!(registry.lookup::<String>(&id).is_none());
        assert!(registry.lookup::<u32>(&StepId::new("other")).is_none());
    }

    #[test]
    fn test_unbind_allows_rebinding() {
        let registry = AutomationRegistry::new();
        let id = StepId::new("s");
        registry
            .bind(id.clone(), |_: &StepPrompt| -> StagehandResult<()> { Ok(()) })
            .unwrap();
        assert!(registry.unbind(&id));
        assert!(!registry.is_bound(&id));
        registry
            .bind(id, |_: &StepPrompt| -> StagehandResult<()> { Ok(()) })
            .unwrap();
    }
}

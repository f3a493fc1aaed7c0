//! Lifecycle hook phase engine
//!
//! Hooks are named, side-effecting callbacks run at lifecycle transitions
//! (PreStart, PostStart, PreStop, PostStop). Within the life of a [`Hooks`]
//! instance each hook runs at most once per phase: successful executions
//! are recorded by name, a failing hook is not recorded so a later retry
//! re-attempts exactly that hook. The executed sets are never reset; a
//! restart of the whole pilot process is the only reset path.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};

use tracing::{debug, warn};

use crate::crd::{Pilot, PilotPhase};
use crate::Error;

/// A named lifecycle hook.
///
/// Hooks must be idempotent per phase: the engine guarantees at-most-once
/// execution per phase per [`Hooks`] instance, but a fresh instance (new
/// pilot process) re-runs everything.
pub trait Hook: Send + Sync {
    /// Name used for at-most-once bookkeeping and error reporting
    fn name(&self) -> &str;

    /// Execute the hook against the current Pilot
    fn execute(&self, pilot: &Pilot) -> crate::Result<()>;
}

/// A hook backed by a closure, for wiring and tests
pub struct FnHook<F> {
    name: String,
    f: F,
}

impl<F> FnHook<F>
where
    F: Fn(&Pilot) -> crate::Result<()> + Send + Sync,
{
    /// Create a named hook from a closure
    pub fn new(name: impl Into<String>, f: F) -> Self {
        Self {
            name: name.into(),
            f,
        }
    }
}

impl<F> Hook for FnHook<F>
where
    F: Fn(&Pilot) -> crate::Result<()> + Send + Sync,
{
    fn name(&self) -> &str {
        &self.name
    }

    fn execute(&self, pilot: &Pilot) -> crate::Result<()> {
        (self.f)(pilot)
    }
}

struct Inner {
    registered: HashMap<PilotPhase, Vec<Arc<dyn Hook>>>,
    executed: HashMap<PilotPhase, HashSet<String>>,
}

/// Idempotent, at-most-once-per-phase hook executor.
///
/// A mutex serializes transitions so bookkeeping stays exactly-once even
/// under concurrent retries. Normal usage is single-threaded; the lock is
/// the guarantee, not the expectation.
pub struct Hooks {
    inner: Mutex<Inner>,
}

impl Default for Hooks {
    fn default() -> Self {
        Self::new()
    }
}

impl Hooks {
    /// Create an engine with eagerly-initialized per-phase sets
    pub fn new() -> Self {
        let mut registered = HashMap::new();
        let mut executed = HashMap::new();
        for phase in PilotPhase::ALL {
            registered.insert(phase, Vec::new());
            executed.insert(phase, HashSet::new());
        }
        Self {
            inner: Mutex::new(Inner {
                registered,
                executed,
            }),
        }
    }

    /// Register a hook for the given phase. Hooks run in registration order.
    pub fn register(&self, phase: PilotPhase, hook: Arc<dyn Hook>) {
        let mut inner = self.inner.lock().expect("hooks lock poisoned");
        inner
            .registered
            .get_mut(&phase)
            .expect("all phases initialized eagerly")
            .push(hook);
    }

    /// Run every not-yet-executed hook registered for the phase.
    ///
    /// On the first hook error the transition aborts: remaining hooks do
    /// not run, the failing hook is not marked executed, and the returned
    /// error names the phase and the hook.
    pub fn transition(&self, phase: PilotPhase, pilot: &Pilot) -> crate::Result<()> {
        let mut inner = self.inner.lock().expect("hooks lock poisoned");
        let hooks = inner
            .registered
            .get(&phase)
            .expect("all phases initialized eagerly")
            .clone();

        for hook in hooks {
            let name = hook.name().to_string();
            if inner
                .executed
                .get(&phase)
                .expect("all phases initialized eagerly")
                .contains(&name)
            {
                debug!(phase = %phase, hook = %name, "Hook already executed, skipping");
                continue;
            }

            if let Err(e) = hook.execute(pilot) {
                warn!(phase = %phase, hook = %name, error = %e, "Hook failed");
                return Err(Error::hook(phase.to_string(), name, e.to_string()));
            }

            debug!(phase = %phase, hook = %name, "Hook executed");
            inner
                .executed
                .get_mut(&phase)
                .expect("all phases initialized eagerly")
                .insert(name);
        }
        Ok(())
    }

    /// Whether the named hook has executed for the phase
    pub fn executed(&self, phase: PilotPhase, name: &str) -> bool {
        let inner = self.inner.lock().expect("hooks lock poisoned");
        inner
            .executed
            .get(&phase)
            .expect("all phases initialized eagerly")
            .contains(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    use crate::crd::PilotSpec;

    fn pilot() -> Pilot {
        Pilot::new("cass-0", PilotSpec::default())
    }

    fn counting_hook(name: &str, counter: Arc<AtomicU32>) -> Arc<dyn Hook> {
        Arc::new(FnHook::new(name, move |_pilot: &Pilot| {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }))
    }

    fn failing_hook(name: &str) -> Arc<dyn Hook> {
        Arc::new(FnHook::new(name, |_pilot: &Pilot| {
            Err(Error::validation("boom"))
        }))
    }

    #[test]
    fn hook_executes_at_most_once_per_phase() {
        let hooks = Hooks::new();
        let count = Arc::new(AtomicU32::new(0));
        hooks.register(PilotPhase::PreStart, counting_hook("h", count.clone()));

        hooks.transition(PilotPhase::PreStart, &pilot()).unwrap();
        hooks.transition(PilotPhase::PreStart, &pilot()).unwrap();

        assert_eq!(count.load(Ordering::SeqCst), 1);
        assert!(hooks.executed(PilotPhase::PreStart, "h"));
    }

    #[test]
    fn same_hook_name_runs_once_per_distinct_phase() {
        let hooks = Hooks::new();
        let count = Arc::new(AtomicU32::new(0));
        hooks.register(PilotPhase::PreStart, counting_hook("h", count.clone()));
        hooks.register(PilotPhase::PostStart, counting_hook("h", count.clone()));

        hooks.transition(PilotPhase::PreStart, &pilot()).unwrap();
        hooks.transition(PilotPhase::PostStart, &pilot()).unwrap();

        assert_eq!(count.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn failing_hook_aborts_phase_and_is_not_marked_executed() {
        let hooks = Hooks::new();
        let first = Arc::new(AtomicU32::new(0));
        let third = Arc::new(AtomicU32::new(0));
        hooks.register(PilotPhase::PreStart, counting_hook("h1", first.clone()));
        hooks.register(PilotPhase::PreStart, failing_hook("h2"));
        hooks.register(PilotPhase::PreStart, counting_hook("h3", third.clone()));

        let err = hooks.transition(PilotPhase::PreStart, &pilot()).unwrap_err();
        assert!(err.to_string().contains("PreStart"));
        assert!(err.to_string().contains("h2"));

        assert!(hooks.executed(PilotPhase::PreStart, "h1"));
        assert!(!hooks.executed(PilotPhase::PreStart, "h2"));
        assert!(!hooks.executed(PilotPhase::PreStart, "h3"));
        assert_eq!(first.load(Ordering::SeqCst), 1);
        assert_eq!(third.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn retry_after_failure_reattempts_only_unexecuted_hooks() {
        let hooks = Hooks::new();
        let first = Arc::new(AtomicU32::new(0));
        let flaky_calls = Arc::new(AtomicU32::new(0));
        let flaky = {
            let calls = flaky_calls.clone();
            Arc::new(FnHook::new("flaky", move |_pilot: &Pilot| {
                if calls.fetch_add(1, Ordering::SeqCst) == 0 {
                    Err(Error::validation("transient"))
                } else {
                    Ok(())
                }
            }))
        };
        hooks.register(PilotPhase::PreStart, counting_hook("h1", first.clone()));
        hooks.register(PilotPhase::PreStart, flaky);

        assert!(hooks.transition(PilotPhase::PreStart, &pilot()).is_err());
        hooks.transition(PilotPhase::PreStart, &pilot()).unwrap();

        // h1 ran once, the flaky hook was attempted twice
        assert_eq!(first.load(Ordering::SeqCst), 1);
        assert_eq!(flaky_calls.load(Ordering::SeqCst), 2);
        assert!(hooks.executed(PilotPhase::PreStart, "flaky"));
    }

    #[test]
    fn hooks_run_in_registration_order() {
        let hooks = Hooks::new();
        let order = Arc::new(Mutex::new(Vec::new()));
        for name in ["a", "b", "c"] {
            let order = order.clone();
            hooks.register(
                PilotPhase::PostStop,
                Arc::new(FnHook::new(name, move |_pilot: &Pilot| {
                    order.lock().unwrap().push(name);
                    Ok(())
                })),
            );
        }
        hooks.transition(PilotPhase::PostStop, &pilot()).unwrap();
        assert_eq!(*order.lock().unwrap(), vec!["a", "b", "c"]);
    }
}

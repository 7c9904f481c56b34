//! Callables bound to a target in an owning context.
//!
//! A [`MarshaledFn`] is what a worker hands to code that must call back into the UI
//! without knowing anything about threads: a script completion callback, a
//! per-row update for the register map, a plot refresh. Whoever holds it can call
//! it from any thread; the wrapped closure always runs on the owning context and
//! only while the bound target is alive.

use super::run_loop::ContextHandle;
use crate::error::MarshalError;
use crate::guard::GuardRef;
use std::fmt;
use std::sync::Arc;

type BoundFn<A, R> = Arc<dyn Fn(A) -> anyhow::Result<R> + Send + Sync>;

/// A closure bound to a guarded target and its owning context.
pub struct MarshaledFn<A, R> {
    context: ContextHandle,
    guard: GuardRef,
    f: BoundFn<A, R>,
}

impl<A, R> Clone for MarshaledFn<A, R> {
    fn clone(&self) -> Self {
        Self {
            context: self.context.clone(),
            guard: self.guard.clone(),
            f: Arc::clone(&self.f),
        }
    }
}

impl<A, R> fmt::Debug for MarshaledFn<A, R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MarshaledFn")
            .field("context", &self.context.name())
            .field("target", &self.guard.label())
            .finish()
    }
}

impl<A, R> MarshaledFn<A, R>
where
    A: Send + 'static,
    R: Send + 'static,
{
    pub(crate) fn new<F>(context: ContextHandle, guard: GuardRef, f: F) -> Self
    where
        F: Fn(A) -> anyhow::Result<R> + Send + Sync + 'static,
    {
        Self {
            context,
            guard,
            f: Arc::new(f),
        }
    }

    /// Runs the closure on the owning context and waits for its result.
    pub fn call(&self, arg: A) -> Result<R, MarshalError> {
        let f = Arc::clone(&self.f);
        self.context.call(&self.guard, move || f(arg))
    }

    /// Queues the closure on the owning context without waiting.
    pub fn call_async(&self, arg: A) {
        let f = Arc::clone(&self.f);
        self.context.call_async(&self.guard, move || f(arg));
    }

    /// Whether the bound target still exists.
    pub fn is_target_alive(&self) -> bool {
        self.guard.is_alive()
    }
}

#[cfg(test)]
mod tests {
    use crate::error::MarshalError;
    use crate::events::EventBus;
    use crate::marshal::{OwningContext, RunLoop};
    use parking_lot::Mutex;
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn bound_closure_runs_on_owner() {
        let ctx = OwningContext::spawn("lua", Arc::new(EventBus::default())).unwrap();
        let target = ctx.handle().register_target("console");
        let double = ctx.handle().bind(&target.guard(), |x: u32| {
            assert_eq!(thread::current().name(), Some("lua"));
            Ok(x * 2)
        });

        let from_other = {
            let double = double.clone();
            thread::spawn(move || double.call(21)).join().unwrap()
        };
        assert_eq!(from_other, Ok(42));
    }

    #[test]
    fn destroyed_target_refuses_calls() {
        let ctx = OwningContext::spawn("ui", Arc::new(EventBus::default())).unwrap();
        let target = ctx.handle().register_target("widget");
        let f = ctx.handle().bind(&target.guard(), |_: ()| Ok(()));
        assert!(f.is_target_alive());

        drop(target);
        assert!(!f.is_target_alive());
        assert_eq!(f.call(()), Err(MarshalError::TargetDestroyed));
    }

    #[test]
    fn async_invocations_arrive_in_order() {
        let (mut run_loop, handle) = RunLoop::new("ui", Arc::new(EventBus::default()));
        let target = handle.register_target("log view");
        let lines = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&lines);
        let append = handle.bind(&target.guard(), move |line: String| {
            sink.lock().push(line);
            Ok(())
        });

        let worker = thread::spawn(move || {
            for i in 0..50 {
                append.call_async(format!("line {i}"));
            }
        });
        worker.join().unwrap();

        assert!(run_loop.run_until(Duration::from_secs(5), || lines.lock().len() == 50));
        let lines = lines.lock();
        for (i, line) in lines.iter().enumerate() {
            assert_eq!(line, &format!("line {i}"));
        }
    }
}

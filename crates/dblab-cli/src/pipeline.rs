//! Five-phase command driver.
//!
//! Every command is described by a [`CommandSpec`] of plain function
//! references and run by [`run_pipeline`]:
//!
//! 1. requirements, each checked before anything else runs
//! 2. pre-hooks, in order
//! 3. the command body
//! 4. post-hooks, in order, run whenever the body ran (success or failure)
//! 5. post-success actions, in order, run only if phases 1-4 all succeeded
//!
//! A failure in phases 1-3 is returned after phase 4 has cleaned up. A
//! post-hook failure after a failed body is logged and the body's error wins.

use tracing::{debug, info, warn};

use crate::context::Context;
use crate::queue::QueueHandle;
use crate::{Commands, Result};

/// Precondition on the environment
pub type Requirement = fn(&Context) -> Result<()>;

/// Hook or action over the command's arguments
pub type Hook<A> = fn(&Context, &A) -> Result<()>;

/// Command body; follow-ups go through the queue handle
pub type Execute<A> = fn(&Context, &A, &QueueHandle<Commands>) -> Result<()>;

/// Static description of one command.
pub struct CommandSpec<A> {
    /// Command name used in logs
    pub name: &'static str,
    /// Checked before any hook
    pub requirements: Vec<Requirement>,
    /// Run before the body
    pub pre_hooks: Vec<Hook<A>>,
    /// Command body
    pub execute: Execute<A>,
    /// Run after the body regardless of its outcome
    pub post_hooks: Vec<Hook<A>>,
    /// Run only after a fully successful run
    pub on_success: Vec<Hook<A>>,
}

impl<A> CommandSpec<A> {
    /// A spec with only a body
    pub fn new(name: &'static str, execute: Execute<A>) -> Self {
        Self {
            name,
            requirements: Vec::new(),
            pre_hooks: Vec::new(),
            execute,
            post_hooks: Vec::new(),
            on_success: Vec::new(),
        }
    }

    /// Add a precondition, checked in the order added
    pub fn require(mut self, requirement: Requirement) -> Self {
        self.requirements.push(requirement);
        self
    }

    /// Add a hook that runs before the body
    pub fn before(mut self, hook: Hook<A>) -> Self {
        self.pre_hooks.push(hook);
        self
    }

    /// Add a cleanup hook that runs after the body, even when it failed
    pub fn after(mut self, hook: Hook<A>) -> Self {
        self.post_hooks.push(hook);
        self
    }

    /// Add an action that runs only after a fully successful run
    pub fn on_success(mut self, action: Hook<A>) -> Self {
        self.on_success.push(action);
        self
    }
}

/// Drive `spec` through its five phases.
pub fn run_pipeline<A>(
    ctx: &Context,
    spec: &CommandSpec<A>,
    args: &A,
    queue: &QueueHandle<Commands>,
) -> Result<()> {
    for requirement in &spec.requirements {
        requirement(ctx)?;
    }

    let mut outcome = spec
        .pre_hooks
        .iter()
        .try_for_each(|hook| hook(ctx, args))
        .and_then(|()| {
            debug!(command = spec.name, "Executing command");
            (spec.execute)(ctx, args, queue)
        });

    for hook in &spec.post_hooks {
        if let Err(e) = hook(ctx, args) {
            if outcome.is_ok() {
                outcome = Err(e);
            } else {
                warn!(command = spec.name, error = %e, "Post-hook failed after command failure");
            }
        }
    }

    outcome?;

    for action in &spec.on_success {
        action(ctx, args)?;
    }

    info!(command = spec.name, "Command completed");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::tests::test_context;
    use crate::Error;
    use parking_lot::Mutex;

    /// Records hook invocations in order
    #[derive(Default)]
    struct Trace {
        events: Mutex<Vec<&'static str>>,
        fail_on: Option<&'static str>,
    }

    impl Trace {
        fn hit(&self, event: &'static str) -> Result<()> {
            self.events.lock().push(event);
            if self.fail_on == Some(event) {
                return Err(Error::command_failed(event));
            }
            Ok(())
        }
    }

    fn ok_requirement(_: &Context) -> Result<()> {
        Ok(())
    }

    fn failing_requirement(_: &Context) -> Result<()> {
        Err(Error::validation("missing key"))
    }

    fn pre(_: &Context, t: &Trace) -> Result<()> {
        t.hit("pre")
    }

    fn body(_: &Context, t: &Trace, _: &QueueHandle<Commands>) -> Result<()> {
        t.hit("execute")
    }

    fn post(_: &Context, t: &Trace) -> Result<()> {
        t.hit("post")
    }

    fn success(_: &Context, t: &Trace) -> Result<()> {
        t.hit("success")
    }

    fn spec() -> CommandSpec<Trace> {
        CommandSpec::new("trace", body)
            .require(ok_requirement)
            .before(pre)
            .after(post)
            .on_success(success)
    }

    fn run(trace: &Trace, spec: &CommandSpec<Trace>) -> Result<()> {
        let dir = tempfile::tempdir().unwrap();
        let ctx = test_context(dir.path());
        run_pipeline(&ctx, spec, trace, &QueueHandle::new())
    }

    // ==========================================================================
    // Story: Phases run in a fixed order
    // ==========================================================================

    #[test]
    fn when_everything_succeeds_all_phases_run_in_order() {
        let trace = Trace::default();
        run(&trace, &spec()).unwrap();
        assert_eq!(*trace.events.lock(), vec!["pre", "execute", "post", "success"]);
    }

    #[test]
    fn when_body_fails_post_hooks_still_run_but_success_actions_do_not() {
        let trace = Trace {
            fail_on: Some("execute"),
            ..Default::default()
        };
        let err = run(&trace, &spec()).unwrap_err();

        assert!(err.to_string().contains("execute"));
        assert_eq!(*trace.events.lock(), vec!["pre", "execute", "post"]);
    }

    #[test]
    fn when_pre_hook_fails_body_is_skipped_and_cleanup_runs() {
        let trace = Trace {
            fail_on: Some("pre"),
            ..Default::default()
        };
        assert!(run(&trace, &spec()).is_err());
        assert_eq!(*trace.events.lock(), vec!["pre", "post"]);
    }

    #[test]
    fn when_post_hook_fails_success_actions_are_skipped() {
        let trace = Trace {
            fail_on: Some("post"),
            ..Default::default()
        };
        assert!(run(&trace, &spec()).is_err());
        assert_eq!(*trace.events.lock(), vec!["pre", "execute", "post"]);
    }

    #[test]
    fn when_requirement_fails_nothing_runs() {
        let trace = Trace::default();
        let spec = spec().require(failing_requirement);

        let err = run(&trace, &spec).unwrap_err();
        assert!(matches!(err, Error::Validation { .. }));
        assert!(trace.events.lock().is_empty());
    }
}

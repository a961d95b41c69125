//! Entry/exit hooks and transition guards.

use async_trait::async_trait;
use warden_core::Failure;

/// Side effect run when a state is entered or exited.
///
/// Hook failures never block a transition; the engine logs them and
/// records them on the transition's audit record.
#[async_trait]
pub trait StateHook<C: Sync>: Send + Sync {
    /// Name used in logs and audit records.
    fn name(&self) -> &str;

    /// Run the hook for `state`.
    async fn call(&self, state: &str, context: &C) -> Result<(), Failure>;

    /// Resource key for hooks that reach outside the process.
    ///
    /// When set and the machine has a reliability pipeline, the hook runs
    /// through that pipeline under this key.
    fn resource(&self) -> Option<&str> {
        None
    }
}

/// Predicate gating one transition.
pub trait Guard<C>: Send + Sync {
    fn name(&self) -> &str;

    /// `Ok(false)` refuses the transition; `Err` carries a refusal reason.
    fn check(&self, from: &str, to: &str, context: &C) -> Result<bool, String>;
}

/// Hook backed by a synchronous closure.
pub struct FnHook<F> {
    name: String,
    resource: Option<String>,
    f: F,
}

impl<F> FnHook<F> {
    /// Route this hook through the reliability pipeline under `resource`.
    pub fn external(mut self, resource: impl Into<String>) -> Self {
        self.resource = Some(resource.into());
        self
    }
}

/// Wrap a closure as a [`StateHook`].
pub fn hook_fn<C, F>(name: impl Into<String>, f: F) -> FnHook<F>
where
    F: Fn(&str, &C) -> Result<(), Failure> + Send + Sync,
{
    FnHook {
        name: name.into(),
        resource: None,
        f,
    }
}

#[async_trait]
impl<C, F> StateHook<C> for FnHook<F>
where
    C: Sync,
    F: Fn(&str, &C) -> Result<(), Failure> + Send + Sync,
{
    fn name(&self) -> &str {
        &self.name
    }

    async fn call(&self, state: &str, context: &C) -> Result<(), Failure> {
        (self.f)(state, context)
    }

    fn resource(&self) -> Option<&str> {
        self.resource.as_deref()
    }
}

/// Guard backed by a closure.
pub struct FnGuard<F> {
    name: String,
    f: F,
}

/// Wrap a closure as a [`Guard`].
pub fn guard_fn<C, F>(name: impl Into<String>, f: F) -> FnGuard<F>
where
    F: Fn(&str, &str, &C) -> Result<bool, String> + Send + Sync,
{
    FnGuard {
        name: name.into(),
        f,
    }
}

impl<C, F> Guard<C> for FnGuard<F>
where
    F: Fn(&str, &str, &C) -> Result<bool, String> + Send + Sync,
{
    fn name(&self) -> &str {
        &self.name
    }

    fn check(&self, from: &str, to: &str, context: &C) -> Result<bool, String> {
        (self.f)(from, to, context)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_hook_fn_calls_closure() {
        let hook = hook_fn("log", |state: &str, ctx: &Vec<String>| {
            if ctx.iter().any(|s| s == state) {
                Ok(())
            } else {
                Err(Failure::permanent(format!("unexpected state {}", state)))
            }
        });
        let ctx = vec!["open".to_string()];

        assert!(hook.call("open", &ctx).await.is_ok());
        assert!(hook.call("closed", &ctx).await.is_err());
        assert_eq!(StateHook::<Vec<String>>::name(&hook), "log");
        assert_eq!(StateHook::<Vec<String>>::resource(&hook), None);
    }

    #[test]
    fn test_external_marks_resource() {
        let hook = hook_fn("notify", |_: &str, _: &()| Ok(())).external("webhook");
        assert_eq!(StateHook::<()>::resource(&hook), Some("webhook"));
    }

    #[test]
    fn test_guard_fn() {
        let guard = guard_fn("has_key", |_from: &str, _to: &str, has_key: &bool| Ok(*has_key));
        assert!(guard.check("locked", "closed", &true).unwrap());
        assert!(!guard.check("locked", "closed", &false).unwrap());
    }
}

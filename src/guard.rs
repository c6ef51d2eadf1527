//! Interception of host "run" commands to catch missing-model conditions.
//!
//! The host's command registry may not exist yet when the extension loads,
//! so installation retries on a fixed interval and gives up after a bounded
//! number of attempts. Around each wrapped invocation the guard performs a
//! pre-check for workflow-embedded assets that are missing locally, and a
//! post-check that races two host-state observers. At most one trigger fires
//! per invocation, and a cooldown plus a dialog-presence check keep the
//! guard from fighting a manually-opened acquisition flow.

use std::future::Future;
use std::sync::Mutex;
use std::time::Duration;

use log::{debug, info, warn};
use tokio::time::Instant;

use crate::graph::EmbeddedModel;
use crate::retry;

pub const DEFAULT_COOLDOWN: Duration = Duration::from_millis(1800);
pub const DEFAULT_HOOK_RETRY_INTERVAL: Duration = Duration::from_millis(500);
pub const DEFAULT_HOOK_MAX_ATTEMPTS: u32 = 20;
pub const DEFAULT_PROBE_INTERVAL: Duration = Duration::from_millis(150);
pub const DEFAULT_DIALOG_TIMEOUT: Duration = Duration::from_millis(1200);
pub const DEFAULT_VALIDATION_TIMEOUT: Duration = Duration::from_millis(2500);

/// Result of asking the host to route one command through the guard.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WrapOutcome {
    /// Command found and now routed through the guard.
    Wrapped,
    /// The marker flag says a previous install already wrapped it.
    AlreadyWrapped,
    /// The registry does not know this command yet.
    NotFound,
}

/// The host side of command hooking. The host owns its registry; the core
/// only asks it to route a named command through [`CommandGuard::around`].
pub trait CommandHost {
    fn wrap_command(&self, command_id: &str) -> WrapOutcome;
}

/// Polled observers over host UI state the core cannot subscribe to.
pub trait HostProbe {
    /// Did the native missing-models indicator appear?
    fn missing_assets_indicator(&self) -> bool;
    /// Did a native validation failure referencing an asset-selection field
    /// appear?
    fn asset_validation_failure(&self) -> bool;
    /// Workflow-embedded assets that are not installed locally.
    fn embedded_missing_assets(&self) -> Vec<EmbeddedModel>;
}

/// Entry point of the acquisition flow, injected rather than discovered
/// through ambient global state.
pub trait AcquisitionFlow {
    fn open(&self, trigger: TriggerReason, assets: Vec<EmbeddedModel>);
    fn is_open(&self) -> bool;
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TriggerReason {
    /// Pre-check: the workflow embeds assets that are missing locally.
    EmbeddedMissing,
    /// Post-check: the native missing-models indicator appeared.
    MissingDialog,
    /// Post-check: a validation failure referenced an asset field.
    ValidationFailure,
}

/// Whether the wrapped command actually ran.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Intercepted<T> {
    Ran(T),
    /// The pre-check found missing assets; the underlying command was
    /// skipped and the acquisition flow opened instead.
    Skipped(TriggerReason),
}

#[derive(Clone, Copy, Debug)]
pub struct GuardPolicy {
    pub cooldown: Duration,
    pub hook_retry_interval: Duration,
    pub hook_max_attempts: u32,
    pub probe_interval: Duration,
    pub dialog_timeout: Duration,
    pub validation_timeout: Duration,
}

impl Default for GuardPolicy {
    fn default() -> Self {
        Self {
            cooldown: DEFAULT_COOLDOWN,
            hook_retry_interval: DEFAULT_HOOK_RETRY_INTERVAL,
            hook_max_attempts: DEFAULT_HOOK_MAX_ATTEMPTS,
            probe_interval: DEFAULT_PROBE_INTERVAL,
            dialog_timeout: DEFAULT_DIALOG_TIMEOUT,
            validation_timeout: DEFAULT_VALIDATION_TIMEOUT,
        }
    }
}

pub struct CommandGuard<H, P, F> {
    host: H,
    probe: P,
    flow: F,
    policy: GuardPolicy,
    last_trigger: Mutex<Option<Instant>>,
}

impl<H, P, F> CommandGuard<H, P, F>
where
    H: CommandHost,
    P: HostProbe,
    F: AcquisitionFlow,
{
    pub fn new(host: H, probe: P, flow: F, policy: GuardPolicy) -> Self {
        Self {
            host,
            probe,
            flow,
            policy,
            last_trigger: Mutex::new(None),
        }
    }

    /// Wraps each named host command exactly once, retrying while the host
    /// registry populates. Gives up after the attempt budget and logs the
    /// commands it could not hook; the host keeps functioning either way.
    /// Returns the number of commands left unwrapped.
    pub async fn install(&self, command_ids: &[String]) -> usize {
        let mut remaining: Vec<String> = command_ids.to_vec();
        let hooked = retry::retry_until(
            self.policy.hook_retry_interval,
            self.policy.hook_max_attempts,
            || {
                remaining.retain(|id| match self.host.wrap_command(id) {
                    WrapOutcome::Wrapped => {
                        info!("Hooked host command {id:?}.");
                        false
                    }
                    WrapOutcome::AlreadyWrapped => {
                        debug!("host command {id:?} was already wrapped");
                        false
                    }
                    WrapOutcome::NotFound => true,
                });
                remaining.is_empty().then_some(())
            },
        )
        .await;

        if hooked.is_none() {
            warn!(
                "Unable to hook host command(s) {remaining:?} after {} attempts.",
                self.policy.hook_max_attempts
            );
        }
        remaining.len()
    }

    /// Runs one wrapped invocation. The original command's result or error
    /// is propagated unchanged whenever it runs; exactly one of the
    /// pre-check trigger, an immediate post-check trigger, or a deferred
    /// post-check trigger may fire.
    pub async fn around<T, E, R, Fut>(&self, run: R) -> Result<Intercepted<T>, E>
    where
        R: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let missing = self.probe.embedded_missing_assets();
        if !missing.is_empty() && self.try_trigger(TriggerReason::EmbeddedMissing, missing) {
            return Ok(Intercepted::Skipped(TriggerReason::EmbeddedMissing));
        }

        let result = run().await;
        self.post_check().await;
        result.map(Intercepted::Ran)
    }

    /// Races the two native indicators, each bounded by its own timeout.
    /// Whichever fires first triggers the flow, at most once.
    async fn post_check(&self) {
        let dialog = retry::poll_for(self.policy.probe_interval, self.policy.dialog_timeout, || {
            self.probe.missing_assets_indicator()
        });
        let validation = retry::poll_for(
            self.policy.probe_interval,
            self.policy.validation_timeout,
            || self.probe.asset_validation_failure(),
        );
        tokio::pin!(dialog);
        tokio::pin!(validation);

        let reason = tokio::select! {
            true = &mut dialog => Some(TriggerReason::MissingDialog),
            true = &mut validation => Some(TriggerReason::ValidationFailure),
            else => None,
        };
        if let Some(reason) = reason {
            self.try_trigger(reason, Vec::new());
        }
    }

    /// Opens the flow unless it fired within the cooldown window or the
    /// acquisition dialog is already on screen.
    fn try_trigger(&self, reason: TriggerReason, assets: Vec<EmbeddedModel>) -> bool {
        if self.flow.is_open() {
            debug!("acquisition flow already open; suppressing {reason:?}");
            return false;
        }
        let mut last = self.last_trigger.lock().expect("guard cooldown lock poisoned");
        if let Some(at) = *last {
            if at.elapsed() < self.policy.cooldown {
                debug!("within cooldown; suppressing {reason:?}");
                return false;
            }
        }
        *last = Some(Instant::now());
        drop(last);
        info!("Opening acquisition flow ({reason:?}).");
        self.flow.open(reason, assets);
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

    #[derive(Default)]
    struct FakeHost {
        /// Commands the registry knows, and after how many lookup attempts
        /// each one appears.
        commands: Vec<(String, u32)>,
        lookups: AtomicU32,
        wrapped: Mutex<Vec<String>>,
    }

    impl CommandHost for &FakeHost {
        fn wrap_command(&self, command_id: &str) -> WrapOutcome {
            let attempt = self.lookups.fetch_add(1, Ordering::SeqCst);
            let known = self
                .commands
                .iter()
                .any(|(id, appears_at)| id == command_id && attempt >= *appears_at);
            if !known {
                return WrapOutcome::NotFound;
            }
            let mut wrapped = self.wrapped.lock().unwrap();
            if wrapped.iter().any(|id| id == command_id) {
                return WrapOutcome::AlreadyWrapped;
            }
            wrapped.push(command_id.to_string());
            WrapOutcome::Wrapped
        }
    }

    #[derive(Default)]
    struct FakeProbe {
        missing_dialog: AtomicBool,
        validation_failure: AtomicBool,
        embedded: Mutex<Vec<EmbeddedModel>>,
    }

    impl HostProbe for &FakeProbe {
        fn missing_assets_indicator(&self) -> bool {
            self.missing_dialog.load(Ordering::SeqCst)
        }

        fn asset_validation_failure(&self) -> bool {
            self.validation_failure.load(Ordering::SeqCst)
        }

        fn embedded_missing_assets(&self) -> Vec<EmbeddedModel> {
            self.embedded.lock().unwrap().clone()
        }
    }

    #[derive(Default)]
    struct FakeFlow {
        open_now: AtomicBool,
        triggers: Mutex<Vec<TriggerReason>>,
    }

    impl AcquisitionFlow for &FakeFlow {
        fn open(&self, trigger: TriggerReason, _assets: Vec<EmbeddedModel>) {
            self.triggers.lock().unwrap().push(trigger);
        }

        fn is_open(&self) -> bool {
            self.open_now.load(Ordering::SeqCst)
        }
    }

    fn fast_policy() -> GuardPolicy {
        GuardPolicy {
            cooldown: Duration::from_millis(1800),
            hook_retry_interval: Duration::from_millis(500),
            hook_max_attempts: 5,
            probe_interval: Duration::from_millis(100),
            dialog_timeout: Duration::from_millis(400),
            validation_timeout: Duration::from_millis(800),
        }
    }

    fn embedded(name: &str) -> EmbeddedModel {
        EmbeddedModel {
            name: name.to_string(),
            url: None,
            directory: Some("checkpoints".to_string()),
        }
    }

    async fn run_ok(guard: &CommandGuard<&FakeHost, &FakeProbe, &FakeFlow>) -> Intercepted<u32> {
        guard
            .around::<u32, std::convert::Infallible, _, _>(|| async { Ok(42) })
            .await
            .unwrap()
    }

    #[tokio::test(start_paused = true)]
    async fn install_waits_for_late_commands_and_gives_up_on_the_rest() {
        let host = FakeHost {
            // Appears once the registry has been probed a few times.
            commands: vec![("queue-prompt".to_string(), 3)],
            ..FakeHost::default()
        };
        let probe = FakeProbe::default();
        let flow = FakeFlow::default();
        let guard = CommandGuard::new(&host, &probe, &flow, fast_policy());

        let unhooked = guard
            .install(&["queue-prompt".to_string(), "never-exists".to_string()])
            .await;
        assert_eq!(unhooked, 1);
        assert_eq!(*host.wrapped.lock().unwrap(), vec!["queue-prompt"]);
    }

    #[tokio::test(start_paused = true)]
    async fn second_install_does_not_double_wrap() {
        let host = FakeHost {
            commands: vec![("queue-prompt".to_string(), 0)],
            ..FakeHost::default()
        };
        let probe = FakeProbe::default();
        let flow = FakeFlow::default();
        let guard = CommandGuard::new(&host, &probe, &flow, fast_policy());

        assert_eq!(guard.install(&["queue-prompt".to_string()]).await, 0);
        assert_eq!(guard.install(&["queue-prompt".to_string()]).await, 0);
        assert_eq!(host.wrapped.lock().unwrap().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn pre_check_skips_the_command_and_opens_the_flow() {
        let host = FakeHost::default();
        let probe = FakeProbe::default();
        probe.embedded.lock().unwrap().push(embedded("missing.safetensors"));
        let flow = FakeFlow::default();
        let guard = CommandGuard::new(&host, &probe, &flow, fast_policy());

        let outcome = run_ok(&guard).await;
        assert_eq!(outcome, Intercepted::Skipped(TriggerReason::EmbeddedMissing));
        assert_eq!(
            *flow.triggers.lock().unwrap(),
            vec![TriggerReason::EmbeddedMissing]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn delegation_propagates_result_and_errors_unchanged() {
        let host = FakeHost::default();
        let probe = FakeProbe::default();
        let flow = FakeFlow::default();
        let guard = CommandGuard::new(&host, &probe, &flow, fast_policy());

        assert_eq!(run_ok(&guard).await, Intercepted::Ran(42));

        let err = guard
            .around::<u32, &str, _, _>(|| async { Err("prompt rejected") })
            .await
            .unwrap_err();
        assert_eq!(err, "prompt rejected");
        assert!(flow.triggers.lock().unwrap().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn post_check_fires_on_missing_dialog() {
        let host = FakeHost::default();
        let probe = FakeProbe::default();
        probe.missing_dialog.store(true, Ordering::SeqCst);
        let flow = FakeFlow::default();
        let guard = CommandGuard::new(&host, &probe, &flow, fast_policy());

        let outcome = run_ok(&guard).await;
        assert_eq!(outcome, Intercepted::Ran(42));
        assert_eq!(
            *flow.triggers.lock().unwrap(),
            vec![TriggerReason::MissingDialog]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn post_check_times_out_without_indicators() {
        let host = FakeHost::default();
        let probe = FakeProbe::default();
        let flow = FakeFlow::default();
        let guard = CommandGuard::new(&host, &probe, &flow, fast_policy());

        let started = Instant::now();
        run_ok(&guard).await;
        assert!(flow.triggers.lock().unwrap().is_empty());
        // Bounded by the longer of the two observer timeouts.
        assert!(started.elapsed() >= Duration::from_millis(800));
    }

    #[tokio::test(start_paused = true)]
    async fn cooldown_suppresses_rapid_refires_then_allows_again() {
        let host = FakeHost::default();
        let probe = FakeProbe::default();
        probe.embedded.lock().unwrap().push(embedded("missing.safetensors"));
        let flow = FakeFlow::default();
        let guard = CommandGuard::new(&host, &probe, &flow, fast_policy());

        // t=0: fires.
        run_ok(&guard).await;
        assert_eq!(flow.triggers.lock().unwrap().len(), 1);

        // t=500ms: same condition, still inside the 1800ms cooldown. The
        // command runs and the deferred post-check stays quiet too.
        tokio::time::sleep(Duration::from_millis(500)).await;
        let outcome = run_ok(&guard).await;
        assert_eq!(outcome, Intercepted::Ran(42));
        assert_eq!(flow.triggers.lock().unwrap().len(), 1);

        // Well past the cooldown now; a new condition fires again.
        tokio::time::sleep(Duration::from_millis(1500)).await;
        run_ok(&guard).await;
        assert_eq!(flow.triggers.lock().unwrap().len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn open_dialog_suppresses_triggers() {
        let host = FakeHost::default();
        let probe = FakeProbe::default();
        probe.embedded.lock().unwrap().push(embedded("missing.safetensors"));
        let flow = FakeFlow::default();
        flow.open_now.store(true, Ordering::SeqCst);
        let guard = CommandGuard::new(&host, &probe, &flow, fast_policy());

        let outcome = run_ok(&guard).await;
        // Suppressed pre-check means the command still runs.
        assert_eq!(outcome, Intercepted::Ran(42));
        assert!(flow.triggers.lock().unwrap().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn at_most_one_trigger_per_invocation() {
        let host = FakeHost::default();
        let probe = FakeProbe::default();
        // Both indicators are lit; only the first to be observed fires.
        probe.missing_dialog.store(true, Ordering::SeqCst);
        probe.validation_failure.store(true, Ordering::SeqCst);
        let flow = FakeFlow::default();
        let guard = CommandGuard::new(&host, &probe, &flow, fast_policy());

        run_ok(&guard).await;
        assert_eq!(flow.triggers.lock().unwrap().len(), 1);
    }
}

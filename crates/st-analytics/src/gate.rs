//! Readiness gate: two monotonic flags and the derived "dispatch allowed" predicate.

use tokio::sync::watch;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
struct GateState {
    environment_ready: bool,
    identity_ready: bool,
}

impl GateState {
    fn is_open(&self) -> bool {
        self.environment_ready && self.identity_ready
    }
}

/// Tracks environment and identity readiness.
///
/// Both flags start `false` and never go back. The mark methods return `true`
/// to exactly one caller: the one whose update opened the gate.
#[derive(Debug)]
pub struct ReadinessGate {
    state: watch::Sender<GateState>,
}

impl Default for ReadinessGate {
    fn default() -> Self {
        Self::new()
    }
}

impl ReadinessGate {
    pub fn new() -> Self {
        let (state, _) = watch::channel(GateState::default());
        Self { state }
    }

    /// Mark the host environment as ready. Returns `true` if this opened the gate.
    pub fn mark_environment_ready(&self) -> bool {
        self.update(|state| &mut state.environment_ready)
    }

    /// Mark identity as ready. Returns `true` if this opened the gate.
    pub fn mark_identity_ready(&self) -> bool {
        self.update(|state| &mut state.identity_ready)
    }

    pub fn is_dispatch_allowed(&self) -> bool {
        self.state.borrow().is_open()
    }

    /// Wait until dispatch is allowed.
    pub async fn opened(&self) {
        let mut rx = self.state.subscribe();
        // The sender lives in `self`, so the channel cannot close while we wait.
        let _ = rx.wait_for(GateState::is_open).await;
    }

    fn update(&self, flag: impl FnOnce(&mut GateState) -> &mut bool) -> bool {
        let mut opened = false;
        self.state.send_if_modified(|state| {
            let was_open = state.is_open();
            let slot = flag(state);
            if *slot {
                return false;
            }
            *slot = true;
            opened = !was_open && state.is_open();
            true
        });
        opened
    }
}

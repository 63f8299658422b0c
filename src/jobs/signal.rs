use std::sync::Arc;
use std::sync::atomic::{AtomicU8, Ordering};
use tokio_util::sync::CancellationToken;

const UNSENT: u8 = 0;
const SENT: u8 = 1;
const ACKNOWLEDGED: u8 = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignalState {
    Unsent,
    Sent,
    Acknowledged,
}

/// Single-shot cancellation signal for one phase of a run.
///
/// The state survives the listener: a signal sent before anyone awaits it,
/// or after the listening task is gone, is still observable through
/// [`PhaseSignal::is_sent`].
#[derive(Debug, Clone, Default)]
pub struct PhaseSignal {
    token: CancellationToken,
    state: Arc<AtomicU8>,
}

impl PhaseSignal {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fire the signal. Returns `true` only for the call that fired it.
    pub fn send(&self) -> bool {
        let fired = self
            .state
            .compare_exchange(UNSENT, SENT, Ordering::AcqRel, Ordering::Acquire)
            .is_ok();
        if fired {
            self.token.cancel();
        }
        fired
    }

    pub fn is_sent(&self) -> bool {
        self.state.load(Ordering::Acquire) != UNSENT
    }

    /// Resolves once the signal has been sent.
    pub async fn received(&self) {
        self.token.cancelled().await;
    }

    /// Mark a sent signal as handled. Returns `false` if it was never sent
    /// or was already acknowledged.
    pub fn acknowledge(&self) -> bool {
        self.state
            .compare_exchange(SENT, ACKNOWLEDGED, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    pub fn state(&self) -> SignalState {
        match self.state.load(Ordering::Acquire) {
            UNSENT => SignalState::Unsent,
            SENT => SignalState::Sent,
            _ => SignalState::Acknowledged,
        }
    }
}

/// The two kill channels of a run. Only one external process is active at a
/// time: the sync job while waiting, the playbook afterwards.
#[derive(Debug, Clone, Default)]
pub struct JobSignals {
    pub sync: PhaseSignal,
    pub main: PhaseSignal,
}

impl JobSignals {
    pub fn new() -> Self {
        Self::default()
    }
}

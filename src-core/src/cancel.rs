//! Cancellation bridge and emergency watchdog.
//!
//! The capture loop polls a single shared atomic flag once per iteration;
//! Ctrl-C handlers, GUIs, and the watchdog all stop a recording by setting
//! it. A separate last-resort watchdog thread force-exits the process if
//! the engine wedges past the emergency timeout.

use std::process;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use tracing::error;

/// How long a recording may run before the emergency watchdog intervenes.
pub const EMERGENCY_TIMEOUT: Duration = Duration::from_secs(5 * 60);

/// Grace period between requesting cancellation and killing the process.
pub const EMERGENCY_GRACE: Duration = Duration::from_secs(2);

/// Process exit code used by the emergency kill path.
pub const WATCHDOG_EXIT_CODE: i32 = 2;

/// Cloneable handle over the shared cancellation flag.
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    flag: Arc<AtomicBool>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    /// Request cooperative shutdown. Idempotent.
    pub fn cancel(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }
}

/// Spawn the emergency watchdog with the default timeouts.
///
/// `running` mirrors whether a recording is in flight; the caller sets it
/// before starting the engine and clears it after the engine returns. If
/// the timeout elapses with the recording still running and no cancellation
/// requested, the watchdog requests one, waits out the grace period, and
/// if the engine still has not stopped, terminates the process with
/// [`WATCHDOG_EXIT_CODE`]. A well-behaved capture loop never gets that far.
pub fn spawn_emergency_watchdog(cancel: CancelToken, running: Arc<AtomicBool>) -> JoinHandle<()> {
    spawn_emergency_watchdog_with(cancel, running, EMERGENCY_TIMEOUT, EMERGENCY_GRACE, || {
        process::exit(WATCHDOG_EXIT_CODE)
    })
}

/// Watchdog with injectable timeouts and kill action, for tests.
pub fn spawn_emergency_watchdog_with<F>(
    cancel: CancelToken,
    running: Arc<AtomicBool>,
    timeout: Duration,
    grace: Duration,
    kill: F,
) -> JoinHandle<()>
where
    F: FnOnce() + Send + 'static,
{
    thread::spawn(move || {
        thread::sleep(timeout);

        if cancel.is_cancelled() || !running.load(Ordering::SeqCst) {
            return;
        }

        error!("emergency watchdog fired, requesting shutdown");
        cancel.cancel();
        thread::sleep(grace);

        if running.load(Ordering::SeqCst) {
            error!("capture engine unresponsive after grace period, terminating");
            kill();
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU32;

    #[test]
    fn token_is_shared_across_clones() {
        let token = CancelToken::new();
        let clone = token.clone();
        assert!(!clone.is_cancelled());
        token.cancel();
        assert!(clone.is_cancelled());
    }

    #[test]
    fn watchdog_does_nothing_when_recording_finished() {
        let kills = Arc::new(AtomicU32::new(0));
        let kills2 = Arc::clone(&kills);
        let token = CancelToken::new();
        let running = Arc::new(AtomicBool::new(false));

        let handle = spawn_emergency_watchdog_with(
            token.clone(),
            running,
            Duration::from_millis(10),
            Duration::from_millis(10),
            move || {
                kills2.fetch_add(1, Ordering::SeqCst);
            },
        );
        handle.join().unwrap();

        assert!(!token.is_cancelled());
        assert_eq!(kills.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn watchdog_cancels_then_kills_a_wedged_recording() {
        let kills = Arc::new(AtomicU32::new(0));
        let kills2 = Arc::clone(&kills);
        let token = CancelToken::new();
        let running = Arc::new(AtomicBool::new(true));

        let handle = spawn_emergency_watchdog_with(
            token.clone(),
            Arc::clone(&running),
            Duration::from_millis(10),
            Duration::from_millis(10),
            move || {
                kills2.fetch_add(1, Ordering::SeqCst);
            },
        );
        handle.join().unwrap();

        assert!(token.is_cancelled());
        assert_eq!(kills.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn watchdog_spares_an_engine_that_stops_within_grace() {
        let kills = Arc::new(AtomicU32::new(0));
        let kills2 = Arc::clone(&kills);
        let token = CancelToken::new();
        let running = Arc::new(AtomicBool::new(true));
        let running2 = Arc::clone(&running);

        let handle = spawn_emergency_watchdog_with(
            token.clone(),
            Arc::clone(&running),
            Duration::from_millis(10),
            Duration::from_millis(200),
            move || {
                kills2.fetch_add(1, Ordering::SeqCst);
            },
        );

        // Simulate the engine observing the cancel and winding down.
        while !token.is_cancelled() {
            thread::sleep(Duration::from_millis(1));
        }
        running2.store(false, Ordering::SeqCst);

        handle.join().unwrap();
        assert_eq!(kills.load(Ordering::SeqCst), 0);
    }
}

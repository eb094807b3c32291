//! Wall-time-driven silence synthesis.
//!
//! When an audio endpoint delivers no packets (a render endpoint with
//! nothing playing, a muted microphone), the stream timeline must stay
//! continuous or the muxed tracks drift apart from the video. This state
//! machine decides, from elapsed wall time alone, how many silent frames a
//! source should fabricate: exactly one sample per audio clock tick of wall
//! time, never more.

/// Largest silence chunk handed out at once, in milliseconds of audio.
pub const MAX_CHUNK_MS: u64 = 50;

/// Tracks how far synthesized silence lags behind wall time for one source.
///
/// The clock is pure: the caller supplies the current wall time in
/// milliseconds, which makes every transition unit-testable.
#[derive(Debug, Clone)]
pub struct SilenceClock {
    sample_rate: u32,
    epoch_ms: Option<u64>,
    generated: u64,
}

impl SilenceClock {
    pub fn new(sample_rate: u32) -> Self {
        debug_assert!(sample_rate > 0);
        Self {
            sample_rate,
            epoch_ms: None,
            generated: 0,
        }
    }

    /// Number of silent frames the source should emit right now.
    ///
    /// The first idle observation records the epoch and yields nothing.
    /// Afterwards the deficit against `sample_rate × elapsed / 1000` is
    /// paid out in chunks of at most [`MAX_CHUNK_MS`] worth of frames;
    /// zero means the stream is caught up.
    pub fn take(&mut self, now_ms: u64) -> u32 {
        let epoch = *self.epoch_ms.get_or_insert(now_ms);
        let elapsed_ms = now_ms.saturating_sub(epoch);
        let expected = self.sample_rate as u64 * elapsed_ms / 1000;

        if self.generated >= expected {
            return 0;
        }

        let max_chunk = (self.sample_rate as u64 * MAX_CHUNK_MS / 1000).max(1);
        let frames = (expected - self.generated).min(max_chunk) as u32;
        self.generated += frames as u64;
        frames
    }

    /// Total silent frames handed out since the epoch.
    pub fn generated(&self) -> u64 {
        self.generated
    }

    /// Frames currently owed at `now_ms`, without taking them. Zero before
    /// the epoch is established.
    pub fn deficit(&self, now_ms: u64) -> u64 {
        let Some(epoch) = self.epoch_ms else {
            return 0;
        };
        let expected = self.sample_rate as u64 * now_ms.saturating_sub(epoch) / 1000;
        expected.saturating_sub(self.generated)
    }

    /// Forget the epoch so the next idle observation starts a fresh timeline.
    pub fn reset(&mut self) {
        self.epoch_ms = None;
        self.generated = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_observation_yields_nothing() {
        let mut clock = SilenceClock::new(48_000);
        assert_eq!(clock.take(1000), 0);
        assert_eq!(clock.generated(), 0);
    }

    #[test]
    fn deficit_is_paid_in_capped_chunks() {
        let mut clock = SilenceClock::new(48_000);
        clock.take(0);
        // 200 ms behind: 9600 frames owed, 50 ms (2400 frames) at a time.
        assert_eq!(clock.take(200), 2400);
        assert_eq!(clock.take(200), 2400);
        assert_eq!(clock.take(200), 2400);
        assert_eq!(clock.take(200), 2400);
        assert_eq!(clock.take(200), 0);
        assert_eq!(clock.generated(), 9600);
    }

    #[test]
    fn caught_up_stream_stays_idle() {
        let mut clock = SilenceClock::new(44_100);
        clock.take(0);
        let frames = clock.take(50);
        assert_eq!(frames, 2205);
        // No wall time passed, nothing more owed.
        assert_eq!(clock.take(50), 0);
    }

    #[test]
    fn generated_tracks_elapsed_time_within_one_chunk() {
        // Polling at an irregular cadence must still converge on
        // rate * elapsed / 1000.
        for rate in [44_100u32, 48_000] {
            let mut clock = SilenceClock::new(rate);
            clock.take(0);
            let mut now = 0u64;
            for step in [3u64, 7, 50, 11, 120, 5, 5, 5, 80, 33] {
                now += step;
                clock.take(now);
            }
            // Drain whatever the chunk cap deferred.
            while clock.take(now) > 0 {}
            let expected = rate as u64 * now / 1000;
            assert_eq!(clock.generated(), expected, "rate {rate}");
        }
    }

    #[test]
    fn clock_never_runs_ahead_of_wall_time() {
        let mut clock = SilenceClock::new(48_000);
        clock.take(10);
        let mut now = 10u64;
        for _ in 0..1000 {
            now += 1;
            clock.take(now);
            assert!(clock.generated() <= 48_000 * (now - 10) / 1000);
        }
    }

    #[test]
    fn reset_restarts_the_timeline() {
        let mut clock = SilenceClock::new(48_000);
        clock.take(0);
        clock.take(100);
        assert!(clock.generated() > 0);
        clock.reset();
        assert_eq!(clock.generated(), 0);
        // New epoch: an observation at a large wall time owes nothing yet.
        assert_eq!(clock.take(5000), 0);
    }

    #[test]
    fn deficit_reports_without_consuming() {
        let mut clock = SilenceClock::new(48_000);
        assert_eq!(clock.deficit(100), 0); // no epoch yet
        clock.take(0);
        assert_eq!(clock.deficit(100), 4800);
        assert_eq!(clock.deficit(100), 4800);
        clock.take(100);
        assert_eq!(clock.deficit(100), 4800 - 2400);
    }

    #[test]
    fn non_monotonic_clock_is_tolerated() {
        let mut clock = SilenceClock::new(48_000);
        clock.take(1000);
        // Wall clock stepping backwards must not underflow.
        assert_eq!(clock.take(500), 0);
    }
}

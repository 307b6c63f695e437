//! Turns the heart rate stream into occasional spoken updates.

pub mod voice;

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use crate::conflated::ConflatedReceiver;
use crate::errors::AppError;
use crate::settings::AnnounceSettings;

/// Speaks a value. The returned future resolves once speaking is done.
#[async_trait]
pub trait Announcer: Send + Sync {
    async fn announce(&self, value: DecomposedValue) -> Result<(), AppError>;
}

#[async_trait]
pub trait AudioFocus: Send + Sync {
    /// Returns `false` when another source keeps the output.
    async fn request_focus(&self) -> bool;
    fn abandon_focus(&self);
}

/// A value rounded to the nearest ten and split into digits for speaking.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DecomposedValue {
    pub hundreds: u16,
    pub tens: u16,
}

impl DecomposedValue {
    /// Ones above 5 round the tens up, everything else rounds down.
    pub fn round(value: u16) -> Self {
        let round_up = u16::from(value % 10 > 5);
        let rounded = (value / 10 + round_up) * 10;
        Self {
            hundreds: rounded / 100,
            tens: (rounded / 10) % 10,
        }
    }

    pub fn value(&self) -> u16 {
        self.hundreds * 100 + self.tens * 10
    }

    pub fn is_announceable(&self) -> bool {
        self.value() != 0
    }

    /// What a speech engine should say, e.g. "1 20" for 120.
    pub fn phrase(&self) -> String {
        match (self.hundreds, self.tens) {
            (0, tens) => format!("{tens}0"),
            (hundreds, 0) => format!("{hundreds}00"),
            (hundreds, tens) => format!("{hundreds} {tens}0"),
        }
    }
}

impl fmt::Display for DecomposedValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.phrase())
    }
}

/// Decides whether a value differs enough, or enough time has passed, to
/// speak again.
#[derive(Debug, Clone)]
pub struct ThrottleGate {
    min_interval: Duration,
    min_delta: u16,
    last: Option<(u16, Instant)>,
}

impl ThrottleGate {
    pub fn new(min_interval: Duration, min_delta: u16) -> Self {
        Self {
            min_interval,
            min_delta,
            last: None,
        }
    }

    pub fn should_announce(&self, value: u16, now: Instant) -> bool {
        match self.last {
            None => true,
            Some((last_value, last_time)) => {
                now.saturating_duration_since(last_time) > self.min_interval
                    || last_value.abs_diff(value) > self.min_delta
            }
        }
    }

    pub fn record(&mut self, value: u16, now: Instant) {
        self.last = Some((value, now));
    }

    pub fn last_announced(&self) -> Option<u16> {
        self.last.map(|(value, _)| value)
    }
}

struct FocusRelease(Arc<dyn AudioFocus>);

impl Drop for FocusRelease {
    fn drop(&mut self) {
        self.0.abandon_focus();
    }
}

pub struct AnnouncementThrottler {
    gate: ThrottleGate,
    settle_delay: Duration,
    focus: Arc<dyn AudioFocus>,
    announcer: Arc<dyn Announcer>,
}

impl AnnouncementThrottler {
    pub fn new(
        settings: &AnnounceSettings,
        focus: Arc<dyn AudioFocus>,
        announcer: Arc<dyn Announcer>,
    ) -> Self {
        Self::with_gate(
            ThrottleGate::new(
                Duration::from_secs(settings.min_interval_secs),
                settings.min_delta,
            ),
            Duration::from_millis(settings.settle_delay_ms),
            focus,
            announcer,
        )
    }

    pub fn with_gate(
        gate: ThrottleGate,
        settle_delay: Duration,
        focus: Arc<dyn AudioFocus>,
        announcer: Arc<dyn Announcer>,
    ) -> Self {
        Self {
            gate,
            settle_delay,
            focus,
            announcer,
        }
    }

    pub fn gate(&self) -> &ThrottleGate {
        &self.gate
    }

    /// Handles one value at a time, so anything arriving mid-announcement
    /// is coalesced by the conflated input.
    pub async fn run(mut self, mut input: ConflatedReceiver<u16>, cancel: CancellationToken) {
        info!("Announcement thread started");
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                value = input.recv() => match value {
                    Some(value) => {
                        self.handle(value).await;
                    }
                    None => break,
                },
            }
        }
        info!("Shutting down announcement thread!");
    }

    /// Returns whether `value` was spoken.
    pub async fn handle(&mut self, value: u16) -> bool {
        let now = Instant::now();
        if !self.gate.should_announce(value, now) {
            trace!("Not announcing {value}");
            return false;
        }
        let decomposed = DecomposedValue::round(value);
        if !decomposed.is_announceable() {
            return false;
        }
        // Recorded even when focus is denied
        self.gate.record(decomposed.value(), now);

        if !self.focus.request_focus().await {
            debug!("Audio focus denied, skipping {decomposed}");
            return false;
        }
        let _release = FocusRelease(self.focus.clone());
        // Settle delay, otherwise the first syllable gets clipped
        tokio::time::sleep(self.settle_delay).await;
        if let Err(e) = self.announcer.announce(decomposed).await {
            warn!("Announcement failed: {e}");
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::conflated;
    use ntest::timeout;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::Mutex;

    #[derive(Default)]
    struct RecordingAnnouncer {
        spoken: Mutex<Vec<String>>,
        fail: bool,
    }

    #[async_trait]
    impl Announcer for RecordingAnnouncer {
        async fn announce(&self, value: DecomposedValue) -> Result<(), AppError> {
            self.spoken.lock().unwrap().push(value.phrase());
            if self.fail {
                Err(AppError::NotConnected)
            } else {
                Ok(())
            }
        }
    }

    struct CountingFocus {
        grant: AtomicBool,
        requests: AtomicUsize,
        releases: AtomicUsize,
    }

    impl CountingFocus {
        fn new(grant: bool) -> Self {
            Self {
                grant: AtomicBool::new(grant),
                requests: AtomicUsize::new(0),
                releases: AtomicUsize::new(0),
            }
        }
    }

    #[async_trait]
    impl AudioFocus for CountingFocus {
        async fn request_focus(&self) -> bool {
            self.requests.fetch_add(1, Ordering::SeqCst);
            self.grant.load(Ordering::SeqCst)
        }

        fn abandon_focus(&self) {
            self.releases.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn throttler(
        focus: Arc<CountingFocus>,
        announcer: Arc<RecordingAnnouncer>,
    ) -> AnnouncementThrottler {
        AnnouncementThrottler::with_gate(
            ThrottleGate::new(Duration::from_secs(30), 7),
            Duration::ZERO,
            focus,
            announcer,
        )
    }

    #[test]
    fn first_value_always_passes() {
        let gate = ThrottleGate::new(Duration::from_secs(30), 7);
        assert!(gate.should_announce(70, Instant::now()));
        assert_eq!(gate.last_announced(), None);
    }

    #[test]
    fn small_changes_wait_for_the_interval() {
        let start = Instant::now();
        let mut gate = ThrottleGate::new(Duration::from_secs(30), 7);
        gate.record(70, start);

        let later = start + Duration::from_secs(29);
        assert!(!gate.should_announce(76, later), "delta 6 is too small");
        assert!(!gate.should_announce(77, later), "delta 7 is not enough");
        assert!(gate.should_announce(78, later), "delta 8 is enough");
        assert!(gate.should_announce(62, later), "works downwards too");

        let much_later = start + Duration::from_secs(31);
        assert!(gate.should_announce(70, much_later));
        // Exactly the interval isn't enough
        assert!(!gate.should_announce(70, start + Duration::from_secs(30)));
    }

    #[test]
    fn rounding_goes_up_only_above_five() {
        let cases = [
            (125, (1, 2), "1 20"),
            (126, (1, 3), "1 30"),
            (72, (0, 7), "70"),
            (75, (0, 7), "70"),
            (76, (0, 8), "80"),
            (96, (1, 0), "100"),
            (104, (1, 0), "100"),
            (203, (2, 0), "200"),
            (216, (2, 2), "2 20"),
            (6, (0, 1), "10"),
        ];
        for (value, (hundreds, tens), phrase) in cases {
            let decomposed = DecomposedValue::round(value);
            assert_eq!(
                (decomposed.hundreds, decomposed.tens),
                (hundreds, tens),
                "value {value}"
            );
            assert_eq!(decomposed.phrase(), phrase);
            assert!(decomposed.is_announceable());
        }
        assert!(!DecomposedValue::round(3).is_announceable());
        assert!(!DecomposedValue::round(0).is_announceable());
    }

    #[tokio::test]
    #[timeout(1000)]
    async fn announces_and_releases_focus() {
        let focus = Arc::new(CountingFocus::new(true));
        let announcer = Arc::new(RecordingAnnouncer::default());
        let mut throttler = throttler(focus.clone(), announcer.clone());

        assert!(throttler.handle(125).await);
        assert!(!throttler.handle(126).await);
        assert!(throttler.handle(134).await);

        assert_eq!(*announcer.spoken.lock().unwrap(), vec!["1 20", "1 30"]);
        assert_eq!(focus.requests.load(Ordering::SeqCst), 2);
        assert_eq!(focus.releases.load(Ordering::SeqCst), 2);
        assert_eq!(throttler.gate().last_announced(), Some(130));
    }

    #[tokio::test]
    #[timeout(1000)]
    async fn focus_is_released_when_the_announcer_fails() {
        let focus = Arc::new(CountingFocus::new(true));
        let announcer = Arc::new(RecordingAnnouncer {
            fail: true,
            ..Default::default()
        });
        let mut throttler = throttler(focus.clone(), announcer);
        assert!(throttler.handle(80).await);
        assert_eq!(focus.releases.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    #[timeout(1000)]
    async fn denied_focus_skips_speaking_but_still_throttles() {
        let focus = Arc::new(CountingFocus::new(false));
        let announcer = Arc::new(RecordingAnnouncer::default());
        let mut throttler = throttler(focus.clone(), announcer.clone());

        assert!(!throttler.handle(80).await);
        assert!(announcer.spoken.lock().unwrap().is_empty());
        assert_eq!(focus.releases.load(Ordering::SeqCst), 0);

        focus.grant.store(true, Ordering::SeqCst);
        assert!(!throttler.handle(82).await);
        assert_eq!(focus.requests.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    #[timeout(1000)]
    async fn zero_is_never_spoken_or_recorded() {
        let focus = Arc::new(CountingFocus::new(true));
        let announcer = Arc::new(RecordingAnnouncer::default());
        let mut throttler = throttler(focus.clone(), announcer.clone());
        assert!(!throttler.handle(2).await);
        assert_eq!(throttler.gate().last_announced(), None);
        assert_eq!(focus.requests.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    #[timeout(1000)]
    async fn run_drains_until_the_input_closes() {
        let focus = Arc::new(CountingFocus::new(true));
        let announcer = Arc::new(RecordingAnnouncer::default());
        let throttler = throttler(focus, announcer.clone());
        let (tx, rx) = conflated::channel();

        tx.send(60);
        tx.send(90);
        drop(tx);
        throttler.run(rx, CancellationToken::new()).await;
        // 60 was overwritten before the throttler looked
        assert_eq!(*announcer.spoken.lock().unwrap(), vec!["90"]);
    }
}

//! Clock Module
//!
//! Time source and recurring-tick primitive used by shards, the eviction
//! scheduler and the refresh buffers. Injected so tests can drive time by hand.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};
use parking_lot::Mutex;
use tokio::sync::{mpsc, oneshot};

/// Number of undelivered ticks a ticker buffers before dropping new ones.
const TICK_BUFFER: usize = 64;

type StopFn = Box<dyn FnOnce() + Send>;

// == Clock Trait ==
/// Source of the current time and of tickers/timers.
pub trait Clock: Send + Sync {
    /// Returns the current time.
    fn now(&self) -> DateTime<Utc>;

    /// Creates a ticker that fires once per `period`.
    fn new_ticker(&self, period: Duration) -> Ticker;

    /// Creates a timer that fires once after `after`.
    fn new_timer(&self, after: Duration) -> Timer;
}

// == Ticker ==
/// Stream of ticks. Stops when dropped.
pub struct Ticker {
    ticks: mpsc::Receiver<DateTime<Utc>>,
    stop: Option<StopFn>,
}

impl Ticker {
    fn new(ticks: mpsc::Receiver<DateTime<Utc>>, stop: StopFn) -> Self {
        Self {
            ticks,
            stop: Some(stop),
        }
    }

    /// Waits for the next tick. Returns None once the ticker is stopped.
    pub async fn tick(&mut self) -> Option<DateTime<Utc>> {
        self.ticks.recv().await
    }

    /// Stops the ticker. Buffered ticks are still delivered.
    pub fn stop(&mut self) {
        if let Some(stop) = self.stop.take() {
            stop();
        }
    }
}

impl Drop for Ticker {
    fn drop(&mut self) {
        self.stop();
    }
}

impl fmt::Debug for Ticker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Ticker")
            .field("stopped", &self.stop.is_none())
            .finish()
    }
}

// == Timer ==
/// One-shot timer. Released when dropped.
pub struct Timer {
    fired: Option<oneshot::Receiver<DateTime<Utc>>>,
    stop: Option<StopFn>,
}

impl Timer {
    fn new(fired: oneshot::Receiver<DateTime<Utc>>, stop: StopFn) -> Self {
        Self {
            fired: Some(fired),
            stop: Some(stop),
        }
    }

    /// Waits until the timer fires. Returns None if it was released first.
    pub async fn fired(mut self) -> Option<DateTime<Utc>> {
        let fired = self.fired.take()?;
        fired.await.ok()
    }
}

impl Drop for Timer {
    fn drop(&mut self) {
        if let Some(stop) = self.stop.take() {
            stop();
        }
    }
}

// == System Clock ==
/// Wall clock backed by tokio time.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }

    fn new_ticker(&self, period: Duration) -> Ticker {
        let (tx, rx) = mpsc::channel(TICK_BUFFER);
        let handle = tokio::spawn(async move {
            let start = tokio::time::Instant::now() + period;
            let mut interval = tokio::time::interval_at(start, period);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                interval.tick().await;
                if tx.send(Utc::now()).await.is_err() {
                    break;
                }
            }
        });
        Ticker::new(rx, Box::new(move || handle.abort()))
    }

    fn new_timer(&self, after: Duration) -> Timer {
        let (tx, rx) = oneshot::channel();
        let handle = tokio::spawn(async move {
            tokio::time::sleep(after).await;
            let _ = tx.send(Utc::now());
        });
        Timer::new(rx, Box::new(move || handle.abort()))
    }
}

// == Test Clock ==
/// Manually driven clock.
///
/// Time only moves through [`TestClock::add`] and [`TestClock::set`], which
/// fire every ticker period and timer deadline crossed on the way.
#[derive(Clone)]
pub struct TestClock {
    state: Arc<Mutex<TestClockState>>,
}

struct TestClockState {
    now: DateTime<Utc>,
    next_id: u64,
    tickers: HashMap<u64, ManualTicker>,
    timers: HashMap<u64, ManualTimer>,
}

struct ManualTicker {
    period: TimeDelta,
    next: DateTime<Utc>,
    tx: mpsc::Sender<DateTime<Utc>>,
}

struct ManualTimer {
    deadline: DateTime<Utc>,
    tx: oneshot::Sender<DateTime<Utc>>,
}

impl TestClock {
    /// Creates a clock frozen at `start`.
    pub fn new(start: DateTime<Utc>) -> Self {
        Self {
            state: Arc::new(Mutex::new(TestClockState {
                now: start,
                next_id: 0,
                tickers: HashMap::new(),
                timers: HashMap::new(),
            })),
        }
    }

    /// Moves time forward by `duration`.
    pub fn add(&self, duration: Duration) {
        let mut state = self.state.lock();
        let now = deadline(state.now, duration);
        state.advance_to(now);
    }

    /// Moves time to `now`. Moving backwards only changes `now()`.
    pub fn set(&self, now: DateTime<Utc>) {
        let mut state = self.state.lock();
        state.advance_to(now);
    }

    fn register_id(&self) -> u64 {
        let mut state = self.state.lock();
        state.next_id += 1;
        state.next_id
    }
}

impl TestClockState {
    fn advance_to(&mut self, now: DateTime<Utc>) {
        self.now = now;

        for ticker in self.tickers.values_mut() {
            let mut sent = 0;
            while ticker.next <= now {
                if sent == TICK_BUFFER {
                    // Ticks past the buffer are dropped; resume one period after now.
                    ticker.next = now
                        .checked_add_signed(ticker.period)
                        .unwrap_or(DateTime::<Utc>::MAX_UTC);
                    break;
                }
                // A full buffer drops the tick, as a real ticker would.
                let _ = ticker.tx.try_send(ticker.next);
                sent += 1;
                match ticker.next.checked_add_signed(ticker.period) {
                    Some(next) => ticker.next = next,
                    None => {
                        ticker.next = DateTime::<Utc>::MAX_UTC;
                        break;
                    }
                }
            }
        }

        let due: Vec<u64> = self
            .timers
            .iter()
            .filter(|(_, timer)| timer.deadline <= now)
            .map(|(id, _)| *id)
            .collect();
        for id in due {
            if let Some(timer) = self.timers.remove(&id) {
                let _ = timer.tx.send(timer.deadline);
            }
        }
    }
}

impl Default for TestClock {
    fn default() -> Self {
        Self::new(Utc::now())
    }
}

impl fmt::Debug for TestClock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.lock();
        f.debug_struct("TestClock")
            .field("now", &state.now)
            .field("tickers", &state.tickers.len())
            .field("timers", &state.timers.len())
            .finish()
    }
}

impl Clock for TestClock {
    fn now(&self) -> DateTime<Utc> {
        self.state.lock().now
    }

    fn new_ticker(&self, period: Duration) -> Ticker {
        let (tx, rx) = mpsc::channel(TICK_BUFFER);
        let id = self.register_id();
        let period = to_delta(period).max(TimeDelta::nanoseconds(1));
        {
            let mut state = self.state.lock();
            let next = state
                .now
                .checked_add_signed(period)
                .unwrap_or(DateTime::<Utc>::MAX_UTC);
            state.tickers.insert(id, ManualTicker { period, next, tx });
        }
        let state = Arc::downgrade(&self.state);
        Ticker::new(
            rx,
            Box::new(move || {
                if let Some(state) = state.upgrade() {
                    state.lock().tickers.remove(&id);
                }
            }),
        )
    }

    fn new_timer(&self, after: Duration) -> Timer {
        let (tx, rx) = oneshot::channel();
        let id = self.register_id();
        {
            let mut state = self.state.lock();
            let deadline = deadline(state.now, after);
            if deadline <= state.now {
                let _ = tx.send(deadline);
            } else {
                state.timers.insert(id, ManualTimer { deadline, tx });
            }
        }
        let state = Arc::downgrade(&self.state);
        Timer::new(
            rx,
            Box::new(move || {
                if let Some(state) = state.upgrade() {
                    state.lock().timers.remove(&id);
                }
            }),
        )
    }
}

// == Utility Functions ==
/// Converts a std duration, saturating at the largest representable delta.
pub(crate) fn to_delta(duration: Duration) -> TimeDelta {
    TimeDelta::from_std(duration).unwrap_or(TimeDelta::MAX)
}

/// Returns `now + after`, saturating instead of overflowing.
pub(crate) fn deadline(now: DateTime<Utc>, after: Duration) -> DateTime<Utc> {
    now.checked_add_signed(to_delta(after))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

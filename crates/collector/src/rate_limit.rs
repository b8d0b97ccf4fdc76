//! Epoch-based rate limiting shared across every per-interface chain.
//!
//! Each epoch opens at most one sample window whose start is drawn
//! uniformly over the slack left by the estimated window length; the
//! window closes once it admits the target count, and the realized length
//! feeds an exponential moving average that sizes the next draw. Spreading
//! the window around the epoch keeps periodic traffic from being sampled at
//! the same phase every time.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};
use records::{Content, PairKey, Record};
use tokio::sync::mpsc;

use crate::Collector;

const EMA_ALPHA: f64 = 0.3;
const PAIR_TTL: Duration = Duration::from_secs(600);

struct State {
    target: usize,
    epoch: Duration,
    est_window: Duration,
    epoch_start: Instant,
    window_start: Instant,
    window_done: bool,
    admitted: usize,
    /// Pair keys admitted as requests; their responses are admitted on
    /// arrival even after the window closes, then forgotten.
    admitted_pairs: HashMap<PairKey, Instant>,
    children: Vec<mpsc::Sender<Instant>>,
    rng: SmallRng,
}

impl State {
    /// Advance epoch bookkeeping so `now` falls inside the current epoch.
    fn roll(&mut self, now: Instant) {
        while now.duration_since(self.epoch_start) >= self.epoch {
            let epoch_end = self.epoch_start + self.epoch;
            if !self.window_done && self.admitted > 0 {
                // The window ran out the epoch without hitting the target.
                self.feed_ema(epoch_end.duration_since(self.window_start));
            }
            self.epoch_start = epoch_end;
            self.draw_window();
            self.window_done = false;
            self.admitted = 0;
            self.admitted_pairs
                .retain(|_, admitted_at| now.duration_since(*admitted_at) < PAIR_TTL);
            // Epoch ticks to children are advisory; a busy child just misses
            // one rather than stalling the limiter.
            self.children
                .retain(|child| !matches!(
                    child.try_send(self.epoch_start),
                    Err(mpsc::error::TrySendError::Closed(_))
                ));
        }
    }

    fn draw_window(&mut self) {
        let slack = self.epoch.saturating_sub(self.est_window);
        let offset = Duration::from_secs_f64(self.rng.gen::<f64>() * slack.as_secs_f64());
        self.window_start = self.epoch_start + offset;
    }

    fn feed_ema(&mut self, actual: Duration) {
        let est = EMA_ALPHA * actual.as_secs_f64()
            + (1.0 - EMA_ALPHA) * self.est_window.as_secs_f64();
        self.est_window = Duration::from_secs_f64(est.min(self.epoch.as_secs_f64()));
    }

    fn window_open(&self, now: Instant) -> bool {
        !self.window_done && now >= self.window_start
    }

    fn admit(&mut self, now: Instant, content: &Content) -> bool {
        self.roll(now);
        match content {
            Content::Request(req) => {
                if !self.window_open(now) {
                    return false;
                }
                self.admitted += 1;
                self.admitted_pairs.insert(req.pair_key(), now);
                if self.admitted >= self.target {
                    self.window_done = true;
                    self.feed_ema(now.duration_since(self.window_start));
                }
                true
            }
            Content::Response(resp) => self.admitted_pairs.remove(&resp.pair_key()).is_some(),
            _ => self.window_open(now),
        }
    }
}

/// Handle to the shared limiter; clone one child per chain.
#[derive(Clone)]
pub struct SharedLimiter {
    state: Arc<Mutex<State>>,
}

impl SharedLimiter {
    pub fn new(witnesses_per_minute: f64, epoch: Duration) -> SharedLimiter {
        let now = Instant::now();
        let target = (witnesses_per_minute * epoch.as_secs_f64() / 60.0).ceil() as usize;
        let mut state = State {
            target: target.max(1),
            epoch,
            // Until measured, assume the window spans the whole epoch, which
            // makes the first window open immediately.
            est_window: epoch,
            epoch_start: now,
            window_start: now,
            window_done: false,
            admitted: 0,
            admitted_pairs: HashMap::new(),
            children: Vec::new(),
            rng: SmallRng::from_entropy(),
        };
        state.draw_window();
        SharedLimiter {
            state: Arc::new(Mutex::new(state)),
        }
    }

    /// Wrap a downstream in a rate-limited stage consulting this limiter.
    pub fn child(&self, next: Box<dyn Collector>) -> RateLimited {
        let (tick_tx, tick_rx) = mpsc::channel(1);
        self.state.lock().unwrap().children.push(tick_tx);
        RateLimited {
            shared: self.clone(),
            ticks: tick_rx,
            next,
        }
    }

    fn admit(&self, now: Instant, content: &Content) -> bool {
        self.state.lock().unwrap().admit(now, content)
    }

    #[cfg(test)]
    fn admit_at(&self, now: Instant, content: &Content) -> bool {
        self.admit(now, content)
    }
}

pub struct RateLimited {
    shared: SharedLimiter,
    ticks: mpsc::Receiver<Instant>,
    next: Box<dyn Collector>,
}

impl Collector for RateLimited {
    fn process(&mut self, record: Record) -> anyhow::Result<()> {
        while let Ok(epoch_start) = self.ticks.try_recv() {
            tracing::trace!(?epoch_start, "rate limiter entered a new epoch");
        }
        if !self.shared.admit(Instant::now(), &record.content) {
            return Ok(());
        }
        self.next.process(record)
    }

    fn close(&mut self) -> anyhow::Result<()> {
        self.next.close()
    }
}

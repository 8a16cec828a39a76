//! Local draw spinner.
//!
//! Purely cosmetic frames that never touch the replicated document. The host
//! runs a bounded spinner whose last frame is the ball it commits; players run
//! an endless one while the host reports a draw in flight. Dropping a spinner
//! cancels it.

use std::time::Duration;

use bingo_common::{Ball, MAX_BALL};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tokio::time::{interval_at, Instant, Interval, MissedTickBehavior};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpinStep {
    /// Display only
    Frame(Ball),
    /// The last frame of a bounded spin; this ball is the draw
    Final(Ball),
}

pub struct Spinner {
    ticker: Interval,
    /// `None` spins until dropped
    steps: Option<u32>,
    taken: u32,
    drawn: Vec<Ball>,
    rng: StdRng,
}

impl Spinner {
    /// A spin of `steps` frames over the balls not in `drawn`. `None` when
    /// nothing is left to draw or `steps` is zero.
    pub fn bounded(steps: u32, period: Duration, drawn: &[Ball]) -> Option<Self> {
        if steps == 0 || drawn.len() >= usize::from(MAX_BALL) {
            return None;
        }
        Some(Self::build(Some(steps), period, drawn))
    }

    /// A spin that only ever yields frames
    pub fn endless(period: Duration, drawn: &[Ball]) -> Self {
        Self::build(None, period, drawn)
    }

    fn build(steps: Option<u32>, period: Duration, drawn: &[Ball]) -> Self {
        let period = period.max(Duration::from_millis(1));
        let mut ticker = interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        Self {
            ticker,
            steps,
            taken: 0,
            drawn: drawn.to_vec(),
            rng: StdRng::from_os_rng(),
        }
    }

    /// Replace the random source, for reproducible spins
    pub fn with_seed(mut self, seed: u64) -> Self {
        self.rng = StdRng::seed_from_u64(seed);
        self
    }

    /// Wait for the next frame. Cancel-safe.
    pub async fn tick(&mut self) -> SpinStep {
        self.ticker.tick().await;
        self.taken += 1;
        let ball = self.pick();
        match self.steps {
            Some(steps) if self.taken >= steps => SpinStep::Final(ball),
            _ => SpinStep::Frame(ball),
        }
    }

    /// Uniform over the undrawn balls by rejection sampling. With nothing
    /// left, any ball is shown.
    fn pick(&mut self) -> Ball {
        if self.drawn.len() >= usize::from(MAX_BALL) {
            return self.rng.random_range(1..=MAX_BALL);
        }
        loop {
            let ball = self.rng.random_range(1..=MAX_BALL);
            if !self.drawn.contains(&ball) {
                return ball;
            }
        }
    }
}

/// Await the next step of an optional spinner; pends forever without one.
pub async fn next_step(spinner: &mut Option<Spinner>) -> SpinStep {
    match spinner {
        Some(spinner) => spinner.tick().await,
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn bounded_spin_ends_with_final() {
        let mut spinner = Spinner::bounded(4, Duration::from_millis(50), &[]).unwrap().with_seed(7);
        let mut steps = Vec::new();
        loop {
            let step = spinner.tick().await;
            steps.push(step);
            if matches!(step, SpinStep::Final(_)) {
                break;
            }
        }
        assert_eq!(steps.len(), 4);
        assert!(steps[..3].iter().all(|s| matches!(s, SpinStep::Frame(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn never_picks_a_drawn_ball() {
        // one ball left
        let drawn: Vec<Ball> = (1..=MAX_BALL).filter(|b| *b != 42).collect();
        let mut spinner = Spinner::bounded(3, Duration::from_millis(10), &drawn).unwrap().with_seed(1);
        for _ in 0..3 {
            let ball = match spinner.tick().await {
                SpinStep::Frame(b) | SpinStep::Final(b) => b,
            };
            assert_eq!(ball, 42);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn spins_are_paced_by_the_interval() {
        let start = Instant::now();
        let mut spinner = Spinner::bounded(3, Duration::from_millis(100), &[]).unwrap();
        for _ in 0..3 {
            spinner.tick().await;
        }
        assert!(start.elapsed() >= Duration::from_millis(300));
    }

    #[test]
    fn nothing_to_spin_for() {
        let all: Vec<Ball> = (1..=MAX_BALL).collect();
        assert!(Spinner::bounded(10, Duration::from_millis(10), &all).is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn endless_spin_keeps_going() {
        let all: Vec<Ball> = (1..=MAX_BALL).collect();
        let mut spinner = Some(Spinner::endless(Duration::from_millis(10), &all));
        for _ in 0..100 {
            assert!(matches!(next_step(&mut spinner).await, SpinStep::Frame(_)));
        }
    }
}

//! Fixed-rate tick scheduler.
//!
//! Runs [`GameServer::tick`] on a dedicated OS thread, independent of the I/O
//! runtime. After a late tick the deadline restarts from "now" instead of
//! bursting to catch up.

use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex,
    },
    thread::JoinHandle,
    time::{Duration, Instant},
};

use anyhow::Context;
use tracing::{info, warn};

use crate::{server::GameServer, session::lock};

/// How well the loop keeps up with its target rate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Performance {
    Excellent,
    Good,
    Poor,
}

impl Performance {
    /// At least 95% of target is excellent, at least 80% is good.
    pub fn grade(tps: f32, target_hz: u32) -> Self {
        let ratio = tps / target_hz.max(1) as f32;
        if ratio >= 0.95 {
            Performance::Excellent
        } else if ratio >= 0.80 {
            Performance::Good
        } else {
            Performance::Poor
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            Performance::Excellent => "EXCELLENT",
            Performance::Good => "GOOD",
            Performance::Poor => "POOR",
        }
    }
}

/// Tick statistics over the last full measurement window.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TickStats {
    pub tps: f32,
    pub avg_tick_ms: f32,
    pub total_ticks: u64,
    pub performance: Performance,
}

/// Counts ticks and reports once per window.
#[derive(Debug)]
pub struct TpsMeter {
    target_hz: u32,
    window: Duration,
    window_start: Instant,
    ticks: u32,
    busy: Duration,
    total_ticks: u64,
}

impl TpsMeter {
    pub fn new(target_hz: u32, window: Duration, now: Instant) -> Self {
        Self {
            target_hz,
            window,
            window_start: now,
            ticks: 0,
            busy: Duration::ZERO,
            total_ticks: 0,
        }
    }

    /// Records one tick that took `took`. Returns stats when a window closes.
    pub fn record(&mut self, took: Duration, now: Instant) -> Option<TickStats> {
        self.ticks += 1;
        self.total_ticks += 1;
        self.busy += took;

        let elapsed = now.saturating_duration_since(self.window_start);
        if elapsed < self.window {
            return None;
        }

        let tps = self.ticks as f32 / elapsed.as_secs_f32();
        let stats = TickStats {
            tps,
            avg_tick_ms: self.busy.as_secs_f32() * 1000.0 / self.ticks as f32,
            total_ticks: self.total_ticks,
            performance: Performance::grade(tps, self.target_hz),
        };
        self.window_start = now;
        self.ticks = 0;
        self.busy = Duration::ZERO;
        Some(stats)
    }
}

/// Next wake-up time. A missed deadline restarts the schedule at `now`.
pub fn next_deadline(deadline: Instant, now: Instant, period: Duration) -> Instant {
    let next = deadline + period;
    if next < now {
        now + period
    } else {
        next
    }
}

/// Handle to the tick thread.
pub struct Scheduler {
    running: Arc<AtomicBool>,
    stats: Arc<Mutex<Option<TickStats>>>,
    thread: Option<JoinHandle<()>>,
}

impl Scheduler {
    /// Starts ticking `server` at `tick_hz` on a new thread.
    pub fn start(server: Arc<GameServer>, tick_hz: u32) -> anyhow::Result<Self> {
        anyhow::ensure!(tick_hz > 0, "tick_hz must be positive");

        let running = Arc::new(AtomicBool::new(true));
        let stats = Arc::new(Mutex::new(None));
        let period = Duration::from_secs_f64(1.0 / f64::from(tick_hz));

        let thread = std::thread::Builder::new()
            .name("arena-tick".into())
            .spawn({
                let running = running.clone();
                let stats = stats.clone();
                move || run(server, running, stats, period, tick_hz)
            })
            .context("spawn tick thread")?;

        info!(tick_hz, "Tick scheduler started");
        Ok(Self {
            running,
            stats,
            thread: Some(thread),
        })
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// Stats from the most recent full second, if one has elapsed.
    pub fn stats(&self) -> Option<TickStats> {
        *lock(&self.stats)
    }

    /// Stops the loop and waits for the thread. Idempotent.
    pub fn stop(&mut self) {
        self.running.store(false, Ordering::Release);
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                warn!("Tick thread panicked");
            }
            info!("Tick scheduler stopped");
        }
    }
}

impl Drop for Scheduler {
    fn drop(&mut self) {
        self.stop();
    }
}

fn run(
    server: Arc<GameServer>,
    running: Arc<AtomicBool>,
    stats: Arc<Mutex<Option<TickStats>>>,
    period: Duration,
    tick_hz: u32,
) {
    let dt = period.as_secs_f32();
    let mut meter = TpsMeter::new(tick_hz, Duration::from_secs(1), Instant::now());
    let mut deadline = Instant::now();

    while running.load(Ordering::Acquire) {
        let started = Instant::now();
        server.tick(dt);
        let now = Instant::now();

        if let Some(s) = meter.record(now - started, now) {
            info!(
                tps = %format!("{:.1}", s.tps),
                target = tick_hz,
                avg_tick_ms = %format!("{:.3}", s.avg_tick_ms),
                players = server.joined_count(),
                performance = s.performance.label(),
                "Tick rate"
            );
            *lock(&stats) = Some(s);
        }

        deadline = next_deadline(deadline, now, period);
        let wait = deadline.saturating_duration_since(Instant::now());
        if !wait.is_zero() {
            std::thread::sleep(wait);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use arena_shared::{
        config::ServerConfig,
        physics::{PhysicsConfig, SimplePhysics},
    };
    use tokio::runtime::Handle;

    const PERIOD: Duration = Duration::from_millis(16);

    #[test]
    fn on_time_deadline_advances_by_one_period() {
        let t0 = Instant::now();
        let next = next_deadline(t0, t0 + Duration::from_millis(3), PERIOD);
        assert_eq!(next, t0 + PERIOD);
    }

    #[test]
    fn overrun_resets_deadline_from_now() {
        let t0 = Instant::now();
        let late = t0 + Duration::from_millis(100);
        let next = next_deadline(t0, late, PERIOD);
        assert_eq!(next, late + PERIOD);
    }

    #[test]
    fn grades_against_target() {
        assert_eq!(Performance::grade(59.5, 60), Performance::Excellent);
        assert_eq!(Performance::grade(50.0, 60), Performance::Good);
        assert_eq!(Performance::grade(30.0, 60), Performance::Poor);
        assert_eq!(Performance::Poor.label(), "POOR");
    }

    #[test]
    fn meter_reports_once_per_window() {
        let t0 = Instant::now();
        let mut meter = TpsMeter::new(10, Duration::from_secs(1), t0);
        for i in 1..10 {
            let at = t0 + Duration::from_millis(i * 100);
            assert!(meter.record(Duration::from_millis(2), at).is_none());
        }
        let stats = meter
            .record(Duration::from_millis(2), t0 + Duration::from_secs(1))
            .unwrap();
        assert!((stats.tps - 10.0).abs() < 1e-3);
        assert!((stats.avg_tick_ms - 2.0).abs() < 1e-3);
        assert_eq!(stats.total_ticks, 10);
        assert_eq!(stats.performance, Performance::Excellent);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn ticks_until_stopped() {
        let physics = SimplePhysics::new(PhysicsConfig::default()).unwrap();
        let server = GameServer::new(ServerConfig::default(), Box::new(physics), Handle::current());

        let mut scheduler = Scheduler::start(server.clone(), 100).unwrap();
        assert!(scheduler.is_running());
        tokio::time::sleep(Duration::from_millis(200)).await;
        scheduler.stop();
        scheduler.stop();

        let ticks = server.tick_count();
        assert!(ticks >= 5, "only {ticks} ticks");
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(server.tick_count(), ticks);
        assert!(!scheduler.is_running());
    }

    #[test]
    fn zero_rate_is_rejected() {
        let rt = tokio::runtime::Builder::new_current_thread().build().unwrap();
        let physics = SimplePhysics::new(PhysicsConfig::default()).unwrap();
        let server = GameServer::new(ServerConfig::default(), Box::new(physics), rt.handle().clone());
        assert!(Scheduler::start(server, 0).is_err());
    }
}

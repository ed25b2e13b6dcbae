use log::info;
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::{Duration, Instant};

use crate::clock::{ClockSource, Pacing};
use crate::sink::ResultSink;
use crate::trial::{self, TrialConfig, TrialOutcome};

pub const DEFAULT_RATE_STEP: u64 = 1000;
pub const DEFAULT_MAX_RATE: u64 = 10_000_000;

const STOP_POLL_INTERVAL: Duration = Duration::from_millis(50);

/// The rate ramp. Each trial reuses `template` with only the rate replaced.
#[derive(Copy, Clone, Debug, PartialEq)]
pub struct SweepConfig {
    pub template: TrialConfig,
    pub start_rate: u64,
    pub rate_step: u64,
    pub max_rate: u64,
    pub max_trials: Option<usize>,
    /// Stop after this many incomplete trials in a row.
    pub stop_after_failures: Option<usize>,
    pub pause: Duration,
}

impl SweepConfig {
    /// Finite sequence of trial configurations, `start_rate` upward in
    /// `rate_step` increments, never above `max_rate`.
    pub fn trials(&self) -> impl Iterator<Item = TrialConfig> {
        let template = self.template;
        let step = self.rate_step.max(1);
        let max_rate = self.max_rate;
        let mut next = Some(self.start_rate);
        std::iter::from_fn(move || {
            let rate = next.filter(|r| *r <= max_rate)?;
            next = rate.checked_add(step);
            Some(TrialConfig {
                target_rate: rate,
                ..template
            })
        })
        .take(self.max_trials.unwrap_or(usize::MAX))
    }
}

/// Executes a single trial. The sweep only sees the finished outcome.
pub trait TrialRunner {
    fn run(&mut self, config: &TrialConfig) -> io::Result<TrialOutcome>;
}

/// Runs trials over UDP against a live router.
#[derive(Copy, Clone, Debug)]
pub struct UdpTrialRunner {
    pub server: SocketAddr,
    pub clock: ClockSource,
    pub pacing: Pacing,
}

impl TrialRunner for UdpTrialRunner {
    fn run(&mut self, config: &TrialConfig) -> io::Result<TrialOutcome> {
        trial::run_trial(config, self.server, self.clock, self.pacing)
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum StopReason {
    /// Reached the rate ceiling or the trial limit.
    Exhausted,
    /// Too many consecutive incomplete trials.
    Saturated,
    /// The stop flag was raised.
    Interrupted,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct SweepSummary {
    pub trials: usize,
    pub recorded: usize,
    pub discarded: usize,
    pub stop: StopReason,
}

fn pause(duration: Duration, stop: &AtomicBool) {
    let deadline = Instant::now() + duration;
    while !stop.load(Ordering::SeqCst) {
        let now = Instant::now();
        if now >= deadline {
            break;
        }
        thread::sleep(STOP_POLL_INTERVAL.min(deadline - now));
    }
}

/// Drives the sweep one trial at a time.
///
/// Each trial is fully finished, threads joined and socket closed, before the
/// next configuration is built. Incomplete trials are skipped, not retried.
/// A runner or sink error ends the sweep with that error. `stop` is checked
/// between trials; a trial in progress always runs to completion.
pub fn run_sweep<R, S>(
    sweep: &SweepConfig,
    runner: &mut R,
    sink: &mut S,
    stop: &AtomicBool,
) -> io::Result<SweepSummary>
where
    R: TrialRunner + ?Sized,
    S: ResultSink + ?Sized,
{
    let mut summary = SweepSummary {
        trials: 0,
        recorded: 0,
        discarded: 0,
        stop: StopReason::Exhausted,
    };
    let mut consecutive_failures = 0;

    for config in sweep.trials() {
        if stop.load(Ordering::SeqCst) {
            summary.stop = StopReason::Interrupted;
            break;
        }
        if summary.trials > 0 && !sweep.pause.is_zero() {
            pause(sweep.pause, stop);
            if stop.load(Ordering::SeqCst) {
                summary.stop = StopReason::Interrupted;
                break;
            }
        }

        let outcome = runner.run(&config)?;
        summary.trials += 1;

        match outcome.result() {
            Some(result) => {
                sink.record(&result)?;
                summary.recorded += 1;
                consecutive_failures = 0;
            }
            None => {
                summary.discarded += 1;
                consecutive_failures += 1;
                if let Some(limit) = sweep.stop_after_failures {
                    if consecutive_failures >= limit {
                        info!(
                            "{} incomplete trials in a row, stopping at {} req/s",
                            consecutive_failures, config.target_rate
                        );
                        summary.stop = StopReason::Saturated;
                        break;
                    }
                }
            }
        }
    }

    info!(
        "Sweep finished ({:?}): {} trials, {} recorded, {} discarded",
        summary.stop, summary.trials, summary.recorded, summary.discarded
    );
    Ok(summary)
}

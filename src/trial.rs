use log::{info, warn};
use std::io;
use std::net::SocketAddr;
use std::panic;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crate::clock::{ClockSource, Pacing};
use crate::collector::{self, CollectorReport};
use crate::distribution::ArrivalShape;
use crate::generator::{self, GeneratorReport, RequestMix, WorkerPlan};
use crate::stats::LatencySummary;
use crate::transport::Channel;
use crate::NS_PER_SEC;

/// Everything one trial needs, fixed before any of its threads start.
#[derive(Copy, Clone, Debug, PartialEq)]
pub struct TrialConfig {
    /// Aggregate requests per second across all workers.
    pub target_rate: u64,
    pub duration_secs: u64,
    /// Percent of requests that are PUTs.
    pub write_ratio: u32,
    pub keyspace: u32,
    pub put_value: u64,
    pub workers: usize,
    pub arrival: ArrivalShape,
    pub quiescence: Duration,
    pub seed: u64,
}

impl TrialConfig {
    pub fn total_requests(&self) -> u64 {
        self.target_rate.saturating_mul(self.duration_secs)
    }

    /// Splits the trial across `workers` streams that together hit
    /// `target_rate`. Each worker spreads its share over the whole duration,
    /// and sequence numbers are handed out in contiguous blocks starting at 1.
    pub fn worker_plans(&self) -> Vec<WorkerPlan> {
        let workers = self.workers.max(1) as u64;
        let total = self.total_requests();
        let base = total / workers;
        let extra = total % workers;
        let duration_ns = self.duration_secs.saturating_mul(NS_PER_SEC) as f64;
        let mix = RequestMix {
            write_ratio: self.write_ratio,
            keyspace: self.keyspace,
            put_value: self.put_value,
        };

        let mut next_seq = 1;
        (0..workers)
            .map(|i| {
                let requests = base + if i < extra { 1 } else { 0 };
                let mean_gap_ns = if requests == 0 {
                    duration_ns
                } else {
                    duration_ns / requests as f64
                };
                let plan = WorkerPlan {
                    index: i as usize,
                    requests,
                    first_seq: next_seq,
                    gaps: self.arrival.with_mean(mean_gap_ns),
                    mix,
                    seed: worker_seed(self.seed, self.target_rate, i),
                };
                next_seq += requests;
                plan
            })
            .collect()
    }
}

fn worker_seed(seed: u64, rate: u64, index: u64) -> u64 {
    seed.wrapping_add(rate.wrapping_mul(0x9e37_79b9_7f4a_7c15))
        .wrapping_add(index)
        .wrapping_mul(0xbf58_476d_1ce4_e5b9)
}

/// One completed trial's entry in the latency/throughput curve.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct TrialResult {
    pub target_rate: u64,
    pub median_ns: u64,
    pub p99_ns: u64,
    pub received: u64,
}

pub struct TrialOutcome {
    pub config: TrialConfig,
    pub generators: Vec<GeneratorReport>,
    pub collector: CollectorReport,
    pub summary: Option<LatencySummary>,
}

impl TrialOutcome {
    /// Statistics are only computed for a trial whose every request was
    /// answered; a truncated sample would understate the tail.
    pub fn new(
        config: TrialConfig,
        generators: Vec<GeneratorReport>,
        collector: CollectorReport,
    ) -> TrialOutcome {
        let summary = if collector.expected > 0 && collector.is_complete() {
            LatencySummary::from_samples(&collector.latencies)
        } else {
            None
        };
        TrialOutcome {
            config,
            generators,
            collector,
            summary,
        }
    }

    pub fn result(&self) -> Option<TrialResult> {
        self.summary.map(|s| TrialResult {
            target_rate: self.config.target_rate,
            median_ns: s.median,
            p99_ns: s.p99,
            received: self.collector.received,
        })
    }

    pub fn sent(&self) -> u64 {
        self.generators.iter().map(|g| g.sent).sum()
    }

    pub fn send_errors(&self) -> u64 {
        self.generators.iter().map(|g| g.send_errors).sum()
    }

    pub fn max_lateness_ns(&self) -> u64 {
        self.generators
            .iter()
            .map(|g| g.max_lateness_ns)
            .max()
            .unwrap_or(0)
    }

    /// Aggregate send rate over the union of the workers' active windows.
    pub fn achieved_rate(&self) -> Option<f64> {
        let first = self.generators.iter().filter_map(|g| g.first_send_ns).min()?;
        let last = self.generators.iter().filter_map(|g| g.last_send_ns).max()?;
        let sent = self.sent();
        if last <= first || sent < 2 {
            return None;
        }
        Some((sent - 1) as f64 * 1e9 / (last - first) as f64)
    }
}

/// Spin barrier that releases every participant at once, or calls the
/// start off if the trial could not be fully set up.
struct StartLine {
    pending: AtomicUsize,
    aborted: AtomicBool,
}

impl StartLine {
    fn new(participants: usize) -> Self {
        StartLine {
            pending: AtomicUsize::new(participants),
            aborted: AtomicBool::new(false),
        }
    }

    /// Returns false if the start was called off.
    fn wait(&self) -> bool {
        self.pending.fetch_sub(1, Ordering::SeqCst);
        while self.pending.load(Ordering::SeqCst) > 0 {
            if self.aborted.load(Ordering::SeqCst) {
                return false;
            }
            thread::yield_now();
        }
        !self.aborted.load(Ordering::SeqCst)
    }

    fn abort(&self) {
        self.aborted.store(true, Ordering::SeqCst);
    }
}

fn join_all<T>(handles: Vec<JoinHandle<T>>) -> Vec<T> {
    handles
        .into_iter()
        .map(|h| match h.join() {
            Ok(v) => v,
            Err(payload) => panic::resume_unwind(payload),
        })
        .collect()
}

/// Runs one trial against `server` on a fresh socket.
///
/// The socket is opened before any thread is spawned and dropped only after
/// every generator and the collector have been joined, so late datagrams
/// from this trial cannot leak into the next one. If a thread cannot be
/// spawned, the ones already running are released and joined before the
/// error is returned.
pub fn run_trial(
    config: &TrialConfig,
    server: SocketAddr,
    clock: ClockSource,
    pacing: Pacing,
) -> io::Result<TrialOutcome> {
    let channel = Arc::new(Channel::dial(server)?);
    let config = *config;
    let plans = config.worker_plans();
    let start = Arc::new(StartLine::new(plans.len() + 2));

    info!(
        "Tx rate {}: {} requests over {} s on {} workers ({} arrivals, mean gap {:.0} ns)",
        config.target_rate,
        config.total_requests(),
        config.duration_secs,
        plans.len(),
        plans[0].gaps.name(),
        plans[0].gaps.mean()
    );

    let collector_thread = {
        let channel = channel.clone();
        let start = start.clone();
        let expected = config.total_requests();
        thread::Builder::new()
            .name("collector".to_string())
            .spawn(move || {
                if !start.wait() {
                    return None;
                }
                Some(collector::collect(&*channel, &clock, expected, config.quiescence))
            })?
    };

    let mut generator_threads = Vec::with_capacity(plans.len());
    for plan in plans {
        let channel = channel.clone();
        let start = start.clone();
        let spawned = thread::Builder::new()
            .name(format!("generator-{}", plan.index))
            .spawn(move || {
                if !start.wait() {
                    return None;
                }
                Some(generator::run_generator(&plan, &clock, &pacing, &*channel))
            });
        match spawned {
            Ok(handle) => generator_threads.push(handle),
            Err(e) => {
                warn!("Tx rate {}: cannot spawn generator: {}", config.target_rate, e);
                start.abort();
                join_all(generator_threads);
                join_all(vec![collector_thread]);
                return Err(e);
            }
        }
    }

    start.wait();
    let generators: Vec<GeneratorReport> =
        join_all(generator_threads).into_iter().flatten().collect();
    let collector = join_all(vec![collector_thread])
        .pop()
        .flatten()
        .ok_or_else(|| io::Error::new(io::ErrorKind::Other, "collector did not start"))?;
    drop(channel);

    let outcome = TrialOutcome::new(config, generators, collector);
    report(&outcome);
    Ok(outcome)
}

fn report(outcome: &TrialOutcome) {
    let c = &outcome.collector;
    info!(
        "Tx rate {}: sent {} ({} send errors), received {} of {}, achieved {:.0} req/s, worst lateness {} ns",
        outcome.config.target_rate,
        outcome.sent(),
        outcome.send_errors(),
        c.received,
        c.expected,
        outcome.achieved_rate().unwrap_or(0.0),
        outcome.max_lateness_ns(),
    );
    if c.malformed > 0 || c.recv_errors > 0 {
        warn!(
            "Tx rate {}: {} malformed responses, {} receive errors",
            outcome.config.target_rate, c.malformed, c.recv_errors
        );
    }
    match outcome.summary {
        Some(ref s) => info!("Tx rate {}: {}", outcome.config.target_rate, s),
        None => info!(
            "Tx rate {}: incomplete, no statistics recorded",
            outcome.config.target_rate
        ),
    }
}

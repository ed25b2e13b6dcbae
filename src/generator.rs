use log::{debug, warn};
use rand::Rng;
use rand_mt::Mt64;

use crate::clock::{Clock, WaitUntil};
use crate::distribution::Distribution;
use crate::record::{Operation, RequestRecord};
use crate::transport::RequestSink;

/// Intended send times of one worker, drawn lazily.
///
/// Starts from `start_ns` and adds one sampled gap per item. Gaps are at
/// least one nanosecond so the sequence is strictly increasing.
pub struct ArrivalSchedule<R: Rng> {
    gaps: Distribution,
    rng: R,
    next_ns: u64,
    remaining: u64,
}

impl<R: Rng> ArrivalSchedule<R> {
    pub fn new(gaps: Distribution, rng: R, start_ns: u64, count: u64) -> Self {
        ArrivalSchedule {
            gaps,
            rng,
            next_ns: start_ns,
            remaining: count,
        }
    }
}

impl<R: Rng> Iterator for ArrivalSchedule<R> {
    type Item = u64;

    fn next(&mut self) -> Option<u64> {
        if self.remaining == 0 {
            return None;
        }
        self.remaining -= 1;
        let gap = self.gaps.sample(&mut self.rng).max(1);
        self.next_ns = self.next_ns.saturating_add(gap);
        Some(self.next_ns)
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let n = self.remaining as usize;
        (n, Some(n))
    }
}

/// What goes into each request besides its timing.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct RequestMix {
    /// Percent of requests that are PUTs, 0..=100.
    pub write_ratio: u32,
    pub keyspace: u32,
    pub put_value: u64,
}

impl RequestMix {
    pub fn build<R: Rng>(&self, rng: &mut R, seq: u64, send_timestamp_ns: u64) -> RequestRecord {
        let op = if rng.gen_range(0, 100) < self.write_ratio {
            Operation::Put
        } else {
            Operation::Get
        };
        let key = if self.keyspace == 0 {
            0
        } else {
            rng.gen_range(0, self.keyspace)
        };
        RequestRecord {
            op,
            key,
            value: self.put_value,
            send_timestamp_ns,
            latency_ns: 0,
            seq,
        }
    }
}

/// One generator thread's share of a trial.
#[derive(Copy, Clone, Debug, PartialEq)]
pub struct WorkerPlan {
    pub index: usize,
    pub requests: u64,
    /// Sequence number of this worker's first request; the rest follow
    /// contiguously.
    pub first_seq: u64,
    pub gaps: Distribution,
    pub mix: RequestMix,
    pub seed: u64,
}

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct GeneratorReport {
    pub index: usize,
    pub sent: u64,
    pub send_errors: u64,
    /// Worst observed delay between an intended send time and the actual
    /// transmission.
    pub max_lateness_ns: u64,
    pub first_send_ns: Option<u64>,
    pub last_send_ns: Option<u64>,
}

impl GeneratorReport {
    /// Achieved send rate over this worker's active window.
    pub fn achieved_rate(&self) -> Option<f64> {
        match (self.first_send_ns, self.last_send_ns) {
            (Some(first), Some(last)) if last > first && self.sent > 1 => {
                Some((self.sent - 1) as f64 * 1e9 / (last - first) as f64)
            }
            _ => None,
        }
    }
}

/// Runs one open-loop worker to completion.
///
/// Emission never waits on responses: the worker waits for each intended
/// time on `waiter`, stamps the record with a fresh clock reading and hands
/// it to `sink`. A failed send is counted and skipped, never retried.
pub fn run_generator<C, W, S>(plan: &WorkerPlan, clock: &C, waiter: &W, sink: &S) -> GeneratorReport
where
    C: Clock + ?Sized,
    W: WaitUntil + ?Sized,
    S: RequestSink + ?Sized,
{
    let mut report = GeneratorReport {
        index: plan.index,
        ..Default::default()
    };
    if plan.requests == 0 {
        return report;
    }

    let mut mix_rng = Mt64::new(plan.seed);
    let gap_rng = Mt64::new(plan.seed.rotate_left(32) ^ 0x5851_f42d_4c95_7f2d);
    let schedule = ArrivalSchedule::new(plan.gaps, gap_rng, clock.now_ns(), plan.requests);

    for (i, target_ns) in schedule.enumerate() {
        waiter.wait_until(clock, target_ns);

        let now = clock.now_ns();
        let record = plan.mix.build(&mut mix_rng, plan.first_seq + i as u64, now);
        if let Err(e) = sink.send_record(&record) {
            report.send_errors += 1;
            if report.send_errors == 1 {
                warn!("Send thread {} ({}/{}): {}", plan.index, i, plan.requests, e);
            }
            continue;
        }

        report.sent += 1;
        report.max_lateness_ns = report.max_lateness_ns.max(now.saturating_sub(target_ns));
        report.first_send_ns.get_or_insert(now);
        report.last_send_ns = Some(now);
    }

    debug!(
        "generator {}: sent {} of {} ({:.0} req/s), {} send errors, worst lateness {} ns",
        plan.index,
        report.sent,
        plan.requests,
        report.achieved_rate().unwrap_or(0.0),
        report.send_errors,
        report.max_lateness_ns
    );
    report
}

use log::{debug, info, warn};
use std::hint;
use std::io::ErrorKind;
use std::time::Duration;

use crate::clock::Clock;
use crate::transport::ResponseSource;

pub const DEFAULT_QUIESCENCE: Duration = Duration::from_secs(3);

/// Upper bound on the sample buffer reserved before the first response.
const INITIAL_CAPACITY: u64 = 1 << 20;

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum CollectorExit {
    /// Every expected response arrived.
    Complete,
    /// Nothing arrived for a full quiescence window before the count was
    /// reached.
    Quiescent,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CollectorReport {
    /// Round-trip latencies in arrival order.
    pub latencies: Vec<u64>,
    pub received: u64,
    pub expected: u64,
    pub exit: CollectorExit,
    pub malformed: u64,
    pub recv_errors: u64,
}

impl CollectorReport {
    pub fn is_complete(&self) -> bool {
        self.received >= self.expected
    }
}

/// Polls `source` until `expected` responses arrived or nothing has come in
/// for `quiescence`.
///
/// Responses are counted, not matched: any well-formed record contributes
/// one sample of `now - send_timestamp`. Undecodable datagrams and socket
/// errors are tallied but do not count as activity.
pub fn collect<S, C>(source: &S, clock: &C, expected: u64, quiescence: Duration) -> CollectorReport
where
    S: ResponseSource + ?Sized,
    C: Clock + ?Sized,
{
    let quiescence_ns = quiescence.as_nanos() as u64;
    let mut report = CollectorReport {
        latencies: Vec::with_capacity(expected.min(INITIAL_CAPACITY) as usize),
        received: 0,
        expected,
        exit: CollectorExit::Complete,
        malformed: 0,
        recv_errors: 0,
    };

    let mut last_activity = clock.now_ns();
    while report.received < expected {
        match source.try_recv_record() {
            Ok(Some(mut record)) => {
                let now = clock.now_ns();
                last_activity = now;
                record.latency_ns = now.saturating_sub(record.send_timestamp_ns);
                report.latencies.push(record.latency_ns);
                report.received += 1;
                continue;
            }
            Ok(None) => hint::spin_loop(),
            Err(ref e) if e.kind() == ErrorKind::InvalidData => {
                report.malformed += 1;
                debug!("Dropping response: {}", e);
            }
            Err(e) => {
                report.recv_errors += 1;
                if report.recv_errors == 1 {
                    warn!("Receive thread: {}", e);
                }
            }
        }

        if clock.now_ns().saturating_sub(last_activity) >= quiescence_ns {
            report.exit = CollectorExit::Quiescent;
            info!(
                "No response for {:?}: received {} of {}",
                quiescence, report.received, expected
            );
            break;
        }
    }

    report
}

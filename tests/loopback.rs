use std::collections::VecDeque;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use kvloadgen::clock::{ClockSource, Pacing};
use kvloadgen::collector::CollectorExit;
use kvloadgen::config::ServerConfig;
use kvloadgen::distribution::ArrivalShape;
use kvloadgen::record::{Operation, RequestRecord, ABSENT_VALUE};
use kvloadgen::router::{BackendKind, RouterStats, Server, DEFAULT_REDIS_URL};
use kvloadgen::sweep::{run_sweep, StopReason, SweepConfig, UdpTrialRunner};
use kvloadgen::transport::{Channel, RequestSink, ResponseSource};
use kvloadgen::trial::{run_trial, TrialConfig, TrialResult};
use kvloadgen::KBUFSIZE;

struct Running {
    addr: SocketAddr,
    stop: Arc<AtomicBool>,
    handle: JoinHandle<std::io::Result<RouterStats>>,
}

impl Running {
    fn start(threads: usize, preload: u32) -> Running {
        let config = ServerConfig {
            listen: "127.0.0.1:0".parse().unwrap(),
            backend: BackendKind::Memory,
            redis_url: DEFAULT_REDIS_URL.to_string(),
            threads,
            preload,
        };
        let server = Server::bind(&config).unwrap();
        let addr = server.local_addr().unwrap();
        let stop = Arc::new(AtomicBool::new(false));
        let s = stop.clone();
        let handle = thread::spawn(move || server.run(s));
        Running { addr, stop, handle }
    }

    fn shutdown(self) -> RouterStats {
        self.stop.store(true, Ordering::SeqCst);
        self.handle.join().unwrap().unwrap()
    }
}

fn trial(rate: u64) -> TrialConfig {
    TrialConfig {
        target_rate: rate,
        duration_secs: 1,
        write_ratio: 50,
        keyspace: 1000,
        put_value: 1111,
        workers: 2,
        arrival: ArrivalShape::Exponential,
        quiescence: Duration::from_secs(1),
        seed: 7,
    }
}

fn round_trip(client: &Channel, req: &RequestRecord) -> RequestRecord {
    client.send_record(req).unwrap();
    for _ in 0..2000 {
        if let Some(resp) = client.try_recv_record().unwrap() {
            return resp;
        }
        thread::sleep(Duration::from_millis(1));
    }
    panic!("no response for {:?}", req);
}

#[test]
fn router_answers_get_and_put_over_udp() {
    let server = Running::start(1, 10);
    let client = Channel::dial(server.addr).unwrap();

    let get = |key| RequestRecord {
        op: Operation::Get,
        key,
        value: 0,
        send_timestamp_ns: 555,
        latency_ns: 0,
        seq: key as u64,
    };

    assert_eq!(round_trip(&client, &get(5)).value, 0);
    let missing = round_trip(&client, &get(500));
    assert_eq!(missing.value, ABSENT_VALUE);
    assert_eq!(missing.send_timestamp_ns, 555);
    assert_eq!(missing.seq, 500);

    let put = RequestRecord {
        op: Operation::Put,
        value: 31337,
        ..get(500)
    };
    assert_eq!(round_trip(&client, &put), put);
    assert_eq!(round_trip(&client, &put), put);
    assert_eq!(round_trip(&client, &get(500)).value, 31337);

    let stats = server.shutdown();
    assert_eq!(stats.served, 5);
    assert_eq!(stats.dropped, 0);
}

#[test]
fn one_trial_against_a_local_router() {
    let server = Running::start(2, 0);

    let outcome = run_trial(&trial(200), server.addr, ClockSource::Monotonic, Pacing::Spin).unwrap();
    assert_eq!(outcome.sent(), 200);
    assert_eq!(outcome.collector.exit, CollectorExit::Complete);
    assert_eq!(outcome.collector.received, 200);

    let result = outcome.result().unwrap();
    assert_eq!(result.target_rate, 200);
    assert_eq!(result.received, 200);
    assert!(result.median_ns > 0);
    assert!(result.median_ns <= result.p99_ns);

    server.shutdown();
}

#[test]
fn short_sweep_records_each_trial() {
    let server = Running::start(1, 0);
    let sweep = SweepConfig {
        template: trial(100),
        start_rate: 100,
        rate_step: 100,
        max_rate: 200,
        max_trials: None,
        stop_after_failures: None,
        pause: Duration::from_millis(10),
    };
    let mut runner = UdpTrialRunner {
        server: server.addr,
        clock: ClockSource::Monotonic,
        pacing: Pacing::Hybrid,
    };
    let mut results: Vec<TrialResult> = Vec::new();
    let stop = AtomicBool::new(false);
    let summary = run_sweep(&sweep, &mut runner, &mut results, &stop).unwrap();

    assert_eq!(summary.stop, StopReason::Exhausted);
    assert_eq!(summary.trials, 2);
    assert_eq!(
        results.iter().map(|r| r.target_rate).collect::<Vec<_>>(),
        vec![100, 200]
    );

    let stats = server.shutdown();
    assert_eq!(stats.served, 300);
}

/// Echoes datagrams from the first client it hears from, each one `delay`
/// after it arrived. Everything from other clients is ignored.
struct DelayedEcho {
    addr: SocketAddr,
    stop: Arc<AtomicBool>,
    handle: JoinHandle<u64>,
}

impl DelayedEcho {
    fn start(delay: Duration) -> DelayedEcho {
        let channel = Channel::bind("127.0.0.1:0".parse().unwrap(), false).unwrap();
        channel.set_read_timeout(Some(Duration::from_millis(5))).unwrap();
        let addr = channel.local_addr().unwrap();
        let stop = Arc::new(AtomicBool::new(false));
        let s = stop.clone();
        let handle = thread::spawn(move || {
            let mut buf = [0u8; KBUFSIZE];
            let mut first: Option<SocketAddr> = None;
            let mut pending: VecDeque<(Instant, Vec<u8>, SocketAddr)> = VecDeque::new();
            let mut echoed = 0;
            while !s.load(Ordering::SeqCst) || !pending.is_empty() {
                if let Ok((len, from)) = channel.recv_from(&mut buf) {
                    if *first.get_or_insert(from) == from {
                        pending.push_back((Instant::now() + delay, buf[..len].to_vec(), from));
                    }
                }
                while pending.front().map_or(false, |p| p.0 <= Instant::now()) {
                    let (_, data, to) = pending.pop_front().unwrap();
                    let _ = channel.send_to(&data, to);
                    echoed += 1;
                }
            }
            echoed
        });
        DelayedEcho { addr, stop, handle }
    }

    fn shutdown(self) -> u64 {
        self.stop.store(true, Ordering::SeqCst);
        self.handle.join().unwrap()
    }
}

fn quick_trial(rate: u64, quiescence_ms: u64) -> TrialConfig {
    TrialConfig {
        workers: 1,
        quiescence: Duration::from_millis(quiescence_ms),
        ..trial(rate)
    }
}

#[test]
fn silent_server_still_gets_every_request() {
    let silent = Channel::bind("127.0.0.1:0".parse().unwrap(), false).unwrap();
    let config = quick_trial(100, 200);

    let outcome = run_trial(
        &config,
        silent.local_addr().unwrap(),
        ClockSource::Monotonic,
        Pacing::Spin,
    )
    .unwrap();

    assert_eq!(outcome.sent(), config.total_requests());
    assert_eq!(outcome.send_errors(), 0);
    assert_eq!(outcome.collector.exit, CollectorExit::Quiescent);
    assert_eq!(outcome.collector.received, 0);
    assert_eq!(outcome.result(), None);

    // Emission was paced over the full second, not cut short by the
    // collector giving up after 200 ms.
    let first = outcome.generators[0].first_send_ns.unwrap();
    let last = outcome.generators[0].last_send_ns.unwrap();
    assert!(last - first > 500_000_000, "span {} ns", last - first);
}

#[test]
fn late_replies_never_reach_the_next_trial() {
    let echo = DelayedEcho::start(Duration::from_millis(400));

    // Replies arrive well after this trial's collector gives up.
    let first = run_trial(&quick_trial(50, 100), echo.addr, ClockSource::Monotonic, Pacing::Spin)
        .unwrap();
    assert_eq!(first.sent(), 50);
    assert_eq!(first.collector.exit, CollectorExit::Quiescent);
    assert_eq!(first.result(), None);

    // The echo keeps answering the first trial's socket while this one runs,
    // and never answers this trial's own requests.
    let second = run_trial(&quick_trial(50, 600), echo.addr, ClockSource::Monotonic, Pacing::Spin)
        .unwrap();
    assert_eq!(second.sent(), 50);
    assert_eq!(second.collector.received, 0);
    assert_eq!(second.collector.exit, CollectorExit::Quiescent);

    assert_eq!(echo.shutdown(), 50);
}

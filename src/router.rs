use log::{debug, info, warn};
use redis::Commands;
use std::collections::HashMap;
use std::io;
use std::io::ErrorKind;
use std::net::SocketAddr;
use std::ops::AddAssign;
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crate::config::ServerConfig;
use crate::record::{Operation, RecordBuf, RequestRecord, ABSENT_VALUE};
use crate::transport::Channel;
use crate::KBUFSIZE;

pub const DEFAULT_REDIS_URL: &str = "redis://127.0.0.1:6379/";

/// Value stored under every preloaded key.
pub const PRELOAD_VALUE: u64 = 0;

const STOP_POLL_INTERVAL: Duration = Duration::from_millis(100);
const STATS_INTERVAL: Duration = Duration::from_secs(10);

/// Synchronous string key-value store behind the router.
pub trait KvBackend: Send {
    fn get(&mut self, key: &str) -> io::Result<Option<String>>;
    fn set(&mut self, key: &str, value: &str) -> io::Result<()>;
}

fn redis_error(e: redis::RedisError) -> io::Error {
    io::Error::new(ErrorKind::Other, format!("redis: {}", e))
}

pub struct RedisBackend {
    conn: redis::Connection,
}

impl RedisBackend {
    pub fn connect(url: &str) -> io::Result<RedisBackend> {
        let client = redis::Client::open(url).map_err(redis_error)?;
        let conn = client.get_connection().map_err(redis_error)?;
        Ok(RedisBackend { conn })
    }
}

impl KvBackend for RedisBackend {
    fn get(&mut self, key: &str) -> io::Result<Option<String>> {
        self.conn.get(key).map_err(redis_error)
    }

    fn set(&mut self, key: &str, value: &str) -> io::Result<()> {
        self.conn.set(key, value).map_err(redis_error)
    }
}

/// Process-local store. Clones share the same map.
#[derive(Clone, Debug, Default)]
pub struct MemoryBackend {
    map: Arc<Mutex<HashMap<String, String>>>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    fn len(&self) -> usize {
        self.map.lock().map(|m| m.len()).unwrap_or(0)
    }

    fn lock(&self) -> io::Result<std::sync::MutexGuard<'_, HashMap<String, String>>> {
        self.map
            .lock()
            .map_err(|_| io::Error::new(ErrorKind::Other, "memory backend poisoned"))
    }
}

impl KvBackend for MemoryBackend {
    fn get(&mut self, key: &str) -> io::Result<Option<String>> {
        Ok(self.lock()?.get(key).cloned())
    }

    fn set(&mut self, key: &str, value: &str) -> io::Result<()> {
        self.lock()?.insert(key.to_string(), value.to_string());
        Ok(())
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum BackendKind {
    Redis,
    Memory,
}

impl FromStr for BackendKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "redis" => Ok(BackendKind::Redis),
            "memory" => Ok(BackendKind::Memory),
            _ => Err(format!("Unknown backend: {}", s)),
        }
    }
}

pub enum AnyBackend {
    Redis(RedisBackend),
    Memory(MemoryBackend),
}

impl KvBackend for AnyBackend {
    fn get(&mut self, key: &str) -> io::Result<Option<String>> {
        match self {
            AnyBackend::Redis(b) => b.get(key),
            AnyBackend::Memory(b) => b.get(key),
        }
    }

    fn set(&mut self, key: &str, value: &str) -> io::Result<()> {
        match self {
            AnyBackend::Redis(b) => b.set(key, value),
            AnyBackend::Memory(b) => b.set(key, value),
        }
    }
}

/// Writes `PRELOAD_VALUE` under keys `0..keys`.
pub fn preload<B: KvBackend + ?Sized>(backend: &mut B, keys: u32) -> io::Result<()> {
    let value = PRELOAD_VALUE.to_string();
    for key in 0..keys {
        backend.set(&key.to_string(), &value)?;
    }
    info!("Preloaded {} keys", keys);
    Ok(())
}

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct RouterStats {
    /// Requests answered.
    pub served: u64,
    /// Requests that got no answer: undecodable or the backend failed.
    pub dropped: u64,
    pub send_errors: u64,
}

impl AddAssign for RouterStats {
    fn add_assign(&mut self, other: RouterStats) {
        self.served += other.served;
        self.dropped += other.dropped;
        self.send_errors += other.send_errors;
    }
}

/// Turns requests into responses. Holds no per-request state.
pub struct Router<B: KvBackend> {
    backend: B,
    pub stats: RouterStats,
}

impl<B: KvBackend> Router<B> {
    pub fn new(backend: B) -> Self {
        Router {
            backend,
            stats: RouterStats::default(),
        }
    }

    fn apply(&mut self, req: &RequestRecord) -> io::Result<RequestRecord> {
        let key = req.key.to_string();
        match req.op {
            Operation::Get => {
                // Stored values that are not a u64 read back as absent.
                let value = self
                    .backend
                    .get(&key)?
                    .and_then(|v| v.parse::<u64>().ok())
                    .unwrap_or(ABSENT_VALUE);
                Ok(RequestRecord { value, ..*req })
            }
            Operation::Put => {
                self.backend.set(&key, &req.value.to_string())?;
                Ok(*req)
            }
        }
    }

    /// Returns the response for `req`, or `None` if the backend failed.
    /// Timing and sequence fields are always echoed unchanged.
    pub fn handle(&mut self, req: &RequestRecord) -> Option<RequestRecord> {
        match self.apply(req) {
            Ok(resp) => {
                self.stats.served += 1;
                Some(resp)
            }
            Err(e) => {
                self.stats.dropped += 1;
                if self.stats.dropped == 1 {
                    warn!("Backend error on key {}: {}", req.key, e);
                } else {
                    debug!("Backend error on key {}: {}", req.key, e);
                }
                None
            }
        }
    }

    pub fn handle_datagram(&mut self, datagram: &[u8]) -> Option<RecordBuf> {
        match RequestRecord::decode(datagram) {
            Ok(req) => self.handle(&req).map(|resp| resp.encode()),
            Err(e) => {
                self.stats.dropped += 1;
                debug!("Dropping request: {}", e);
                None
            }
        }
    }
}

/// Answers requests arriving on `channel` until `stop` is raised.
pub fn serve<B: KvBackend>(
    channel: &Channel,
    router: &mut Router<B>,
    stop: &AtomicBool,
) -> io::Result<RouterStats> {
    channel.set_read_timeout(Some(STOP_POLL_INTERVAL))?;
    let mut buf = [0u8; KBUFSIZE];
    let mut last_report = Instant::now();
    let mut reported = RouterStats::default();

    while !stop.load(Ordering::SeqCst) {
        match channel.recv_from(&mut buf) {
            Ok((len, from)) => {
                if let Some(reply) = router.handle_datagram(&buf[..len]) {
                    if let Err(e) = channel.send_to(&reply[..], from) {
                        router.stats.send_errors += 1;
                        debug!("Reply to {} failed: {}", from, e);
                    }
                }
            }
            Err(ref e) if e.kind() == ErrorKind::WouldBlock || e.kind() == ErrorKind::TimedOut => {}
            Err(e) => warn!("Receive thread: {}", e),
        }

        if last_report.elapsed() >= STATS_INTERVAL {
            if router.stats != reported {
                info!(
                    "served {}, dropped {}, send errors {}",
                    router.stats.served, router.stats.dropped, router.stats.send_errors
                );
                reported = router.stats;
            }
            last_report = Instant::now();
        }
    }

    Ok(router.stats)
}

type WorkerHandle = JoinHandle<io::Result<RouterStats>>;

fn spawn_worker<F>(index: usize, stop: Arc<AtomicBool>, work: F) -> io::Result<WorkerHandle>
where
    F: FnOnce(&AtomicBool) -> io::Result<RouterStats> + Send + 'static,
{
    thread::Builder::new()
        .name(format!("router-{}", index))
        .spawn(move || {
            let result = work(&stop);
            if let Err(ref e) = result {
                warn!("Receive thread {} failed: {}", index, e);
                stop.store(true, Ordering::SeqCst);
            }
            result
        })
}

/// Joins every handle, even after a failure, and sums their counters.
fn join_workers(handles: Vec<WorkerHandle>, stop: &AtomicBool) -> io::Result<RouterStats> {
    let mut total = RouterStats::default();
    let mut first_error = None;
    for handle in handles {
        match handle.join() {
            Ok(Ok(stats)) => total += stats,
            Ok(Err(e)) => {
                stop.store(true, Ordering::SeqCst);
                first_error.get_or_insert(e);
            }
            Err(payload) => {
                stop.store(true, Ordering::SeqCst);
                std::panic::resume_unwind(payload)
            }
        }
    }
    match first_error {
        Some(e) => Err(e),
        None => Ok(total),
    }
}

/// Bound sockets and connected backends, one pair per receive thread.
///
/// Everything that can fail at startup happens in `bind`, before any thread
/// is spawned.
pub struct Server {
    workers: Vec<(Channel, AnyBackend)>,
}

impl Server {
    pub fn bind(config: &ServerConfig) -> io::Result<Server> {
        let threads = config.threads.max(1);
        let reuse_port = threads > 1;

        let first = Channel::bind(config.listen, reuse_port)?;
        // Port 0 resolves on the first bind; the rest share that port.
        let addr = first.local_addr()?;
        let mut channels = vec![first];
        for _ in 1..threads {
            channels.push(Channel::bind(addr, reuse_port)?);
        }

        let shared = MemoryBackend::new();
        let mut backends = (0..threads)
            .map(|_| match config.backend {
                BackendKind::Redis => RedisBackend::connect(&config.redis_url).map(AnyBackend::Redis),
                BackendKind::Memory => Ok(AnyBackend::Memory(shared.clone())),
            })
            .collect::<io::Result<Vec<_>>>()?;

        if config.preload > 0 {
            preload(&mut backends[0], config.preload)?;
        }

        info!(
            "Bound to address {} ({} threads, {:?} backend)",
            addr, threads, config.backend
        );
        if config.backend == BackendKind::Memory {
            info!("Memory backend holds {} keys", shared.len());
        }
        Ok(Server {
            workers: channels.into_iter().zip(backends).collect(),
        })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        match self.workers.first() {
            Some((channel, _)) => channel.local_addr(),
            None => Err(io::Error::new(ErrorKind::NotConnected, "no sockets bound")),
        }
    }

    /// Serves until `stop` is raised, then joins every receive thread and
    /// returns the combined counters.
    ///
    /// A receive thread that fails raises `stop` for its siblings, and the
    /// first error is returned once all of them have been joined.
    pub fn run(self, stop: Arc<AtomicBool>) -> io::Result<RouterStats> {
        let mut handles = Vec::with_capacity(self.workers.len());
        let mut spawn_error = None;
        for (i, (channel, backend)) in self.workers.into_iter().enumerate() {
            let spawned = spawn_worker(i, stop.clone(), move |stop| {
                let mut router = Router::new(backend);
                serve(&channel, &mut router, stop)
            });
            match spawned {
                Ok(handle) => handles.push(handle),
                Err(e) => {
                    stop.store(true, Ordering::SeqCst);
                    spawn_error = Some(e);
                    break;
                }
            }
        }

        let total = join_workers(handles, &stop);
        if let Some(e) = spawn_error {
            return Err(e);
        }
        let total = total?;
        info!(
            "Router stopped: served {}, dropped {}, send errors {}",
            total.served, total.dropped, total.send_errors
        );
        Ok(total)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::RECORD_SIZE;

    struct Failing;

    impl KvBackend for Failing {
        fn get(&mut self, _key: &str) -> io::Result<Option<String>> {
            Err(io::Error::new(ErrorKind::ConnectionReset, "gone"))
        }

        fn set(&mut self, _key: &str, _value: &str) -> io::Result<()> {
            Err(io::Error::new(ErrorKind::ConnectionReset, "gone"))
        }
    }

    fn request(op: Operation, key: u32, value: u64) -> RequestRecord {
        RequestRecord {
            op,
            key,
            value,
            send_timestamp_ns: 123_456_789,
            latency_ns: 42,
            seq: 77,
        }
    }

    #[test]
    fn get_of_unset_key_is_absent() {
        let mut router = Router::new(MemoryBackend::new());
        let resp = router.handle(&request(Operation::Get, 5, 9)).unwrap();
        assert_eq!(resp.op, Operation::Get);
        assert_eq!(resp.value, ABSENT_VALUE);
        assert_eq!(router.stats.served, 1);
        assert_eq!(router.stats.dropped, 0);
    }

    #[test]
    fn put_is_echoed_and_visible_to_get() {
        let backend = MemoryBackend::new();
        let mut router = Router::new(backend.clone());
        let put = request(Operation::Put, 5, 1111);
        assert_eq!(router.handle(&put), Some(put));
        assert_eq!(router.handle(&put), Some(put));

        let resp = router.handle(&request(Operation::Get, 5, 0)).unwrap();
        assert_eq!(resp.value, 1111);
        assert_eq!(backend.len(), 1);
    }

    #[test]
    fn timing_fields_are_echoed() {
        let mut router = Router::new(MemoryBackend::new());
        let req = request(Operation::Get, 1, 0);
        let resp = router.handle(&req).unwrap();
        assert_eq!(resp.key, req.key);
        assert_eq!(resp.send_timestamp_ns, req.send_timestamp_ns);
        assert_eq!(resp.latency_ns, req.latency_ns);
        assert_eq!(resp.seq, req.seq);
    }

    #[test]
    fn non_numeric_values_read_as_absent() {
        let mut backend = MemoryBackend::new();
        backend.set("3", "value").unwrap();
        let mut router = Router::new(backend);
        let resp = router.handle(&request(Operation::Get, 3, 0)).unwrap();
        assert_eq!(resp.value, ABSENT_VALUE);
    }

    #[test]
    fn backend_errors_produce_no_response() {
        let mut router = Router::new(Failing);
        assert_eq!(router.handle(&request(Operation::Get, 1, 0)), None);
        assert_eq!(router.handle(&request(Operation::Put, 1, 2)), None);
        assert_eq!(router.stats.dropped, 2);
        assert_eq!(router.stats.served, 0);
    }

    #[test]
    fn unknown_op_and_short_datagrams_are_dropped() {
        let mut router = Router::new(MemoryBackend::new());
        let mut bad_op = request(Operation::Get, 1, 0).encode();
        bad_op[3] = 7;
        assert!(router.handle_datagram(&bad_op[..]).is_none());
        assert!(router.handle_datagram(&[0u8; RECORD_SIZE - 1]).is_none());
        assert_eq!(router.stats.dropped, 2);

        let ok = request(Operation::Put, 2, 5).encode();
        let reply = router.handle_datagram(&ok[..]).unwrap();
        assert_eq!(&reply[..], &ok[..]);
    }

    #[test]
    fn preload_fills_the_keyspace() {
        let mut backend = MemoryBackend::new();
        preload(&mut backend, 100).unwrap();
        assert_eq!(backend.len(), 100);
        let mut router = Router::new(backend);
        let resp = router.handle(&request(Operation::Get, 99, 0)).unwrap();
        assert_eq!(resp.value, PRELOAD_VALUE);
        let resp = router.handle(&request(Operation::Get, 100, 0)).unwrap();
        assert_eq!(resp.value, ABSENT_VALUE);
    }

    #[test]
    fn failed_receive_thread_stops_and_drains_the_rest() {
        let stop = Arc::new(AtomicBool::new(false));
        let idle = |served| {
            move |stop: &AtomicBool| -> io::Result<RouterStats> {
                while !stop.load(Ordering::SeqCst) {
                    thread::sleep(Duration::from_millis(1));
                }
                Ok(RouterStats {
                    served,
                    ..Default::default()
                })
            }
        };
        let handles = vec![
            spawn_worker(0, stop.clone(), idle(3)).unwrap(),
            spawn_worker(1, stop.clone(), |_: &AtomicBool| {
                Err(io::Error::new(ErrorKind::AddrInUse, "bind lost"))
            })
            .unwrap(),
            spawn_worker(2, stop.clone(), idle(4)).unwrap(),
        ];
        let err = join_workers(handles, &stop).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::AddrInUse);
        assert!(stop.load(Ordering::SeqCst));
    }

    #[test]
    fn healthy_receive_threads_sum_their_counters() {
        let stop = Arc::new(AtomicBool::new(true));
        let handles = (0..3u64)
            .map(|i| {
                spawn_worker(i as usize, stop.clone(), move |_: &AtomicBool| {
                    Ok(RouterStats {
                        served: i,
                        dropped: 1,
                        send_errors: 0,
                    })
                })
                .unwrap()
            })
            .collect();
        let total = join_workers(handles, &stop).unwrap();
        assert_eq!(total.served, 3);
        assert_eq!(total.dropped, 3);
    }

    #[test]
    fn backend_kind_parses() {
        assert_eq!("redis".parse::<BackendKind>(), Ok(BackendKind::Redis));
        assert_eq!("memory".parse::<BackendKind>(), Ok(BackendKind::Memory));
        assert!("memcached".parse::<BackendKind>().is_err());
    }
}

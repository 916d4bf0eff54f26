//! Server frontend
//!
//! One accept loop, one reader thread per connection plus a writer thread
//! fed by a command queue, a shared sharded DP store, and a single resolver
//! thread consuming collision events. The accept loop doubles as the
//! supervision tick: statistics every 10 s, grace reaping, and periodic
//! checkpoint rewrites.

use std::collections::HashMap;
use std::io::BufReader;
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use anyhow::{anyhow, Context, Result};
use crossbeam_channel::{unbounded, Receiver, Sender};
use log::{debug, info, warn};
use num_bigint::BigUint;

use crate::checkpoint;
use crate::config::Config;
use crate::curve::{point_to_xy, scalar_from_biguint, scalar_to_be32};
use crate::net::protocol::{
    self, ClientHello, Message, ProtocolError, ServerHello,
};
use crate::solver::{Resolver, Verdict};
use crate::store::{AddOutcome, CollisionEvent, DpStore};
use crate::targets::{self, Target};
use crate::types::{ClientId, Dp, Solution};
use crate::work::{WorkTable, GRACE_PERIOD};

const IO_TIMEOUT: Duration = Duration::from_secs(30);
const STATS_INTERVAL: Duration = Duration::from_secs(10);
const ACCEPT_POLL: Duration = Duration::from_millis(200);

pub struct ServerOptions {
    pub port: u16,
    pub dp_bits: u32,
    pub hash_bits: u32,
    pub work_file: Option<PathBuf>,
    pub work_interval: Duration,
    pub output: Option<PathBuf>,
    pub expected_workers: u32,
    pub overshoot: u32,
    pub grace: Duration,
}

impl ServerOptions {
    pub fn from_config(cfg: &Config) -> Self {
        ServerOptions {
            port: cfg.server_port,
            dp_bits: cfg.dp_bits,
            hash_bits: cfg.hash_bits,
            work_file: cfg.work_file.clone(),
            work_interval: Duration::from_secs(cfg.work_interval),
            output: cfg.output.clone(),
            expected_workers: cfg.expected_workers,
            overshoot: cfg.overshoot,
            grace: GRACE_PERIOD,
        }
    }
}

struct ServerState {
    running: AtomicBool,
    found: Mutex<Option<[u8; 32]>>,
    wrong_collisions: AtomicU64,
    started: Instant,
}

/// Registered connections, keyed by the per-session origin tag stored with
/// every DP entry. Reset directives route back through it.
struct Registry {
    conns: Mutex<HashMap<u32, (ClientId, Sender<Message>)>>,
    next_origin: AtomicU32,
}

impl Registry {
    fn new() -> Self {
        Registry {
            conns: Mutex::new(HashMap::new()),
            // origin 0 is reserved for checkpoint resume
            next_origin: AtomicU32::new(1),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<u32, (ClientId, Sender<Message>)>> {
        match self.conns.lock() {
            Ok(g) => g,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn register(&self, client: ClientId, tx: Sender<Message>) -> u32 {
        let origin = self.next_origin.fetch_add(1, Ordering::Relaxed);
        self.lock().insert(origin, (client, tx));
        origin
    }

    fn deregister(&self, origin: u32) {
        self.lock().remove(&origin);
    }

    fn send_to_origin(&self, origin: u32, msg: Message) -> bool {
        match self.lock().get(&origin) {
            Some((_, tx)) => tx.send(msg).is_ok(),
            None => false,
        }
    }

    fn broadcast(&self, msg: &Message) {
        for (_, tx) in self.lock().values() {
            let _ = tx.send(msg.clone());
        }
    }
}

/// Everything a connection handler needs.
struct Shared {
    store: Arc<DpStore>,
    work: Arc<WorkTable>,
    registry: Arc<Registry>,
    state: Arc<ServerState>,
    ev_tx: Sender<CollisionEvent>,
    interval_bits: u32,
    dp_bits: u32,
    target_x: [u8; 32],
    target_y: [u8; 32],
    wild_offset: [u8; 32],
}

pub struct ServerHandle {
    addr: SocketAddr,
    state: Arc<ServerState>,
    thread: JoinHandle<Result<Option<Solution>>>,
}

impl ServerHandle {
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Cooperative stop; the supervision loop notices within one poll tick.
    pub fn shutdown(&self) {
        self.state.running.store(false, Ordering::SeqCst);
    }

    pub fn join(self) -> Result<Option<Solution>> {
        match self.thread.join() {
            Ok(result) => result,
            Err(_) => Err(anyhow!("server thread panicked")),
        }
    }
}

/// Blocking entry point for `-s`.
pub fn run(cfg: &Config) -> Result<Option<Solution>> {
    let path = cfg
        .target_file
        .as_ref()
        .ok_or_else(|| anyhow!("server mode needs a target file"))?;
    let target = targets::load_target(path)?;
    start(ServerOptions::from_config(cfg), target)?.join()
}

/// Bind and spawn the supervision loop; the handle exposes the bound
/// address (port 0 picks an ephemeral one).
pub fn start(opts: ServerOptions, target: Target) -> Result<ServerHandle> {
    let n = target.interval_bits;
    let wild_offset_big = BigUint::from(1u8) << (n as usize - 1);
    let wild_offset = scalar_from_biguint(&wild_offset_big)
        .ok_or_else(|| anyhow!("wild offset does not reduce to a scalar"))?;
    let (target_x, target_y) =
        point_to_xy(&target.point).ok_or_else(|| anyhow!("target is the identity"))?;

    let store = Arc::new(DpStore::new(opts.hash_bits, opts.dp_bits));
    let work = Arc::new(WorkTable::partition(
        n,
        opts.expected_workers,
        opts.overshoot,
        opts.grace,
    ));
    let registry = Arc::new(Registry::new());
    let state = Arc::new(ServerState {
        running: AtomicBool::new(true),
        found: Mutex::new(None),
        wrong_collisions: AtomicU64::new(0),
        started: Instant::now(),
    });
    let (ev_tx, ev_rx) = unbounded();

    let shared = Arc::new(Shared {
        store: Arc::clone(&store),
        work: Arc::clone(&work),
        registry: Arc::clone(&registry),
        state: Arc::clone(&state),
        ev_tx,
        interval_bits: n,
        dp_bits: opts.dp_bits,
        target_x,
        target_y,
        wild_offset: scalar_to_be32(&wild_offset),
    });

    // resolver consumes the single collision event channel
    {
        let resolver = Resolver::new(target.point, wild_offset);
        let shared = Arc::clone(&shared);
        let output = opts.output.clone();
        thread::spawn(move || resolver_loop(ev_rx, resolver, shared, output));
    }

    let ckpt_header = checkpoint::Header {
        interval_bits: n as u8,
        dp_bits: opts.dp_bits as u8,
        target_x,
        target_y,
        wild_offset: shared.wild_offset,
    };
    if let Some(path) = &opts.work_file {
        if path.exists() {
            for rec in checkpoint::load(path, &ckpt_header)? {
                let dp = Dp {
                    x: rec.x,
                    dist: rec.dist,
                    kidx: rec.kidx,
                };
                route_dp(&shared, &dp, 0);
            }
        }
    }

    let listener = TcpListener::bind(("0.0.0.0", opts.port))
        .with_context(|| format!("binding server port {}", opts.port))?;
    listener.set_nonblocking(true)?;
    let addr = listener.local_addr()?;
    info!(
        "server listening on {addr}, interval [0, 2^{n}), dp bits {}, {} ranges",
        opts.dp_bits,
        work.range_count()
    );

    let state_for_handle = Arc::clone(&state);
    let thread = thread::spawn(move || supervise(listener, shared, opts, ckpt_header));
    Ok(ServerHandle {
        addr,
        state: state_for_handle,
        thread,
    })
}

fn supervise(
    listener: TcpListener,
    shared: Arc<Shared>,
    opts: ServerOptions,
    ckpt_header: checkpoint::Header,
) -> Result<Option<Solution>> {
    let mut last_stats = Instant::now();
    let mut last_ckpt = Instant::now();
    while shared.state.running.load(Ordering::SeqCst) {
        match listener.accept() {
            Ok((stream, peer)) => {
                debug!("connection from {peer}");
                let shared = Arc::clone(&shared);
                thread::spawn(move || {
                    if let Err(e) = handle_conn(stream, &shared) {
                        info!("connection {peer} closed: {e}");
                    }
                });
            }
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                thread::sleep(ACCEPT_POLL);
            }
            Err(e) => return Err(e).context("accept loop failed"),
        }

        if last_stats.elapsed() >= STATS_INTERVAL {
            last_stats = Instant::now();
            let released = shared.work.release_expired();
            if released > 0 {
                info!("released {released} work ranges past the grace period");
            }
            log_stats(&shared);
        }
        if let Some(path) = &opts.work_file {
            if last_ckpt.elapsed() >= opts.work_interval {
                last_ckpt = Instant::now();
                if let Err(e) = checkpoint::save(path, &ckpt_header, &shared.store) {
                    warn!("checkpoint failed: {e:#}");
                }
            }
        }
    }

    if let Some(path) = &opts.work_file {
        if let Err(e) = checkpoint::save(path, &ckpt_header, &shared.store) {
            warn!("final checkpoint failed: {e:#}");
        }
    }
    let found = match shared.state.found.lock() {
        Ok(g) => *g,
        Err(poisoned) => *poisoned.into_inner(),
    };
    Ok(found.map(|key| solution(&shared, key)))
}

fn solution(shared: &Shared, key: [u8; 32]) -> Solution {
    Solution {
        private_key: hex::encode(key),
        dps_stored: shared.store.len(),
        same_herd_merges: shared.store.same_herd_merge_count(),
        wrong_collisions: shared.state.wrong_collisions.load(Ordering::Relaxed),
        elapsed_seconds: shared.state.started.elapsed().as_secs_f64(),
    }
}

fn log_stats(shared: &Shared) {
    let store = &shared.store;
    let occ = store.occupancy();
    info!(
        "stats: {} DPs ({} tame / {} wild), {} merges, {} resends, {} rejected, {} wrong collisions; \
         buckets {} nonempty (max {}); ranges {}/{} assigned",
        store.len(),
        store.tame_count(),
        store.wild_count(),
        store.same_herd_merge_count(),
        store.resend_count(),
        store.rejected_count(),
        shared.state.wrong_collisions.load(Ordering::Relaxed),
        occ.nonempty_buckets,
        occ.max_bucket,
        shared.work.assigned_count(),
        shared.work.range_count(),
    );
}

fn route_dp(shared: &Shared, dp: &Dp, origin: u32) {
    match shared.store.add(dp, origin) {
        AddOutcome::Added | AddOutcome::SameHerdDuplicate { .. } => {}
        AddOutcome::CrossHerdCollision(ev) => {
            let _ = shared.ev_tx.send(ev);
        }
    }
}

fn resolver_loop(
    ev_rx: Receiver<CollisionEvent>,
    resolver: Resolver,
    shared: Arc<Shared>,
    output: Option<PathBuf>,
) {
    for ev in ev_rx.iter() {
        match resolver.resolve(&ev) {
            Verdict::Key(key) => {
                {
                    let mut found = match shared.state.found.lock() {
                        Ok(g) => g,
                        Err(poisoned) => poisoned.into_inner(),
                    };
                    if found.is_some() {
                        continue;
                    }
                    *found = Some(key);
                }
                let sol = solution(&shared, key);
                info!("PRIVATE KEY FOUND: {}", sol.private_key);
                if let Some(path) = &output {
                    match serde_json::to_string_pretty(&sol) {
                        Ok(json) => {
                            if let Err(e) = std::fs::write(path, json) {
                                warn!("could not write result file: {e}");
                            }
                        }
                        Err(e) => warn!("could not serialize result: {e}"),
                    }
                }
                shared
                    .registry
                    .broadcast(&Message::Stop { found_key: key });
                shared.state.running.store(false, Ordering::SeqCst);
            }
            Verdict::Wrong { kidx, origin } => {
                shared
                    .state
                    .wrong_collisions
                    .fetch_add(1, Ordering::Relaxed);
                if !shared
                    .registry
                    .send_to_origin(origin, Message::ResetKangaroo { kidx })
                {
                    debug!("reset for kidx {kidx} undeliverable, origin {origin} gone");
                }
            }
        }
    }
}

fn handle_conn(stream: TcpStream, shared: &Shared) -> Result<()> {
    stream.set_read_timeout(Some(IO_TIMEOUT))?;
    stream.set_write_timeout(Some(IO_TIMEOUT))?;
    stream.set_nodelay(true)?;
    let mut reader = BufReader::new(stream.try_clone()?);

    let hello = protocol::read_client_hello(&mut reader)?;
    // interval bits 0 means the worker has not learned the search yet
    if hello.interval_bits != 0 && hello.interval_bits as u32 != shared.interval_bits {
        warn!(
            "rejecting worker {}: interval bits {} vs {}",
            hello.client_id, hello.interval_bits, shared.interval_bits
        );
        reply_hello(&stream, shared, false, &BigUint::from(0u8), &BigUint::from(0u8))?;
        return Ok(());
    }

    let (start, end) = shared.work.assign(hello.client_id);
    reply_hello(&stream, shared, true, &start, &end)?;
    info!(
        "worker {} assigned range [{start:x}, {end:x})",
        hello.client_id
    );

    let (tx, rx) = unbounded::<Message>();
    let origin = shared.registry.register(hello.client_id, tx.clone());
    spawn_writer(stream, rx);

    let result = conn_read_loop(&mut reader, shared, &hello, origin, &tx);
    shared.registry.deregister(origin);
    result
}

fn conn_read_loop(
    reader: &mut BufReader<TcpStream>,
    shared: &Shared,
    hello: &ClientHello,
    origin: u32,
    tx: &Sender<Message>,
) -> Result<()> {
    // runs until the worker disconnects; after a Stop broadcast the worker
    // still drains its pipeline here and deserves acks for every batch
    let mut batches: u64 = 0;
    loop {
        match protocol::read_message(reader) {
            Ok(Message::DpBatch(dps)) => {
                for dp in &dps {
                    if shared.store.validate(dp) {
                        route_dp(shared, dp, origin);
                    }
                }
                batches += 1;
                let _ = tx.send(Message::DpAck {
                    last_sequence: batches,
                });
                shared.work.report_progress(hello.client_id, None);
                let found = match shared.state.found.lock() {
                    Ok(g) => *g,
                    Err(poisoned) => *poisoned.into_inner(),
                };
                if let Some(key) = found {
                    let _ = tx.send(Message::Stop { found_key: key });
                }
            }
            Ok(Message::Ping { timestamp }) => {
                let _ = tx.send(Message::Ping { timestamp });
            }
            Ok(Message::Stats {
                pushed,
                popped,
                ops_count,
            }) => {
                shared.work.report_progress(hello.client_id, Some(ops_count));
                debug!(
                    "worker {}: pushed {pushed}, popped {popped}, ops {ops_count}",
                    hello.client_id
                );
            }
            Ok(other) => {
                warn!(
                    "worker {} sent server-only message {other:?}; dropping connection",
                    hello.client_id
                );
                return Ok(());
            }
            Err(ProtocolError::Io(e)) => {
                // disconnect or timeout; the grace reaper frees the range
                debug!("worker {} i/o ended: {e}", hello.client_id);
                return Ok(());
            }
            Err(e) => {
                warn!(
                    "protocol violation from worker {}: {e}; dropping connection",
                    hello.client_id
                );
                return Ok(());
            }
        }
    }
}

fn reply_hello(
    stream: &TcpStream,
    shared: &Shared,
    accepted: bool,
    start: &BigUint,
    end: &BigUint,
) -> Result<()> {
    let mut stream = stream.try_clone()?;
    protocol::write_server_hello(
        &mut stream,
        &ServerHello {
            accepted,
            dp_bits: shared.dp_bits as u8,
            target_x: shared.target_x,
            target_y: shared.target_y,
            wild_offset: shared.wild_offset,
            range_start: biguint_to_be32(start),
            range_end: biguint_to_be32(end),
        },
    )?;
    Ok(())
}

fn spawn_writer(stream: TcpStream, rx: Receiver<Message>) {
    thread::spawn(move || {
        let mut stream = stream;
        for msg in rx.iter() {
            if protocol::write_message(&mut stream, &msg).is_err() {
                break;
            }
        }
    });
}

fn biguint_to_be32(v: &BigUint) -> [u8; 32] {
    let bytes = v.to_bytes_be();
    let mut out = [0u8; 32];
    out[32 - bytes.len()..].copy_from_slice(&bytes);
    out
}

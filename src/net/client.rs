//! Client worker
//!
//! Compute lanes step their private cohorts and push DPs into the pipeline;
//! a single network sender pops coalesced batches and ships them. Batches
//! stay buffered until the server acks their sequence number, so a dropped
//! connection only costs a resend. Reconnection backs off 1 s to 30 s and
//! gives up after ten straight failures.

use std::collections::VecDeque;
use std::io::BufReader;
use std::net::TcpStream;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use anyhow::{anyhow, Context, Result};
use k256::{ProjectivePoint, Scalar};
use log::{debug, info, warn};
use num_bigint::BigUint;
use rand::rngs::StdRng;
use rand::SeedableRng;

use crate::config::Config;
use crate::curve::{point_from_xy, scalar_from_be32};
use crate::kangaroo::{Cohort, HerdParams, JumpTable, StepOutcome, Walker};
use crate::net::protocol::{self, ClientHello, Message, ProtocolError, ServerHello};
use crate::pipeline::{DpQueue, BATCHING_DELAY};
use crate::types::{ClientId, Dp};

const IO_TIMEOUT: Duration = Duration::from_secs(30);
const MAX_SEND_BATCH: usize = 256;
const MAX_RECONNECT_ATTEMPTS: u32 = 10;
const BACKOFF_CAP: Duration = Duration::from_secs(30);
const STATS_INTERVAL: Duration = Duration::from_secs(10);
const PING_INTERVAL: Duration = Duration::from_secs(10);
/// Soft queue bound; above it lanes skip a compute pass.
const QUEUE_SOFT_BOUND: usize = 1_000_000;

/// How a worker run ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientOutcome {
    /// Server announced the key.
    Found([u8; 32]),
    /// Drained and stopped without a result.
    Drained,
}

/// State shared between lanes, the reader thread and the sender.
struct WorkerShared {
    running: AtomicBool,
    found: Mutex<Option<[u8; 32]>>,
    conn_broken: AtomicBool,
    acked: AtomicU64,
    ops: AtomicU64,
    resets: Mutex<Vec<u64>>,
    target: ProjectivePoint,
    wild_offset: Scalar,
    interval_bits: u32,
    params: Mutex<HerdParams>,
    params_epoch: AtomicU64,
    /// bumped on every reconnect; stale readers exit
    conn_epoch: AtomicU64,
}

impl WorkerShared {
    fn current_params(&self) -> HerdParams {
        match self.params.lock() {
            Ok(g) => g.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    fn set_range(&self, start: BigUint, end: BigUint) -> Result<()> {
        let params = HerdParams::new(&self.target, &self.wild_offset, start, end)?;
        match self.params.lock() {
            Ok(mut g) => *g = params,
            Err(poisoned) => *poisoned.into_inner() = params,
        }
        self.params_epoch.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn set_found(&self, key: [u8; 32]) {
        match self.found.lock() {
            Ok(mut g) => *g = Some(key),
            Err(poisoned) => *poisoned.into_inner() = Some(key),
        }
    }

    fn get_found(&self) -> Option<[u8; 32]> {
        match self.found.lock() {
            Ok(g) => *g,
            Err(poisoned) => *poisoned.into_inner(),
        }
    }

    fn push_reset(&self, kidx: u64) {
        match self.resets.lock() {
            Ok(mut g) => g.push(kidx),
            Err(poisoned) => poisoned.into_inner().push(kidx),
        }
    }

    /// Drain the reset directives addressed to `lane` (top 16 kidx bits).
    fn take_resets(&self, lane: u32) -> Vec<u64> {
        let mut guard = match self.resets.lock() {
            Ok(g) => g,
            Err(poisoned) => poisoned.into_inner(),
        };
        let (mine, rest): (Vec<u64>, Vec<u64>) =
            guard.drain(..).partition(|kidx| (kidx >> 48) as u32 == lane);
        *guard = rest;
        mine
    }
}

/// Blocking entry point for `-c`.
pub fn run(cfg: &Config) -> Result<ClientOutcome> {
    let addr = cfg.server_addr()?;
    if cfg.gpu {
        warn!(
            "this build carries no GPU lanes; ignoring --gpu (device {}) and running {} CPU lanes",
            cfg.gpu_id, cfg.threads
        );
    }
    let client_id = ClientId::random();
    info!("worker {client_id} connecting to {addr}");

    // first contact: interval bits 0 = not yet learned
    let (stream, hello) = connect_with_backoff(&addr, client_id, 0, None)?;
    let shared = Arc::new(init_shared(&hello)?);
    let queue = Arc::new(DpQueue::new());

    spawn_reader(&stream, &shared, &queue)?;

    // compute lanes own their cohorts; the queue is the only shared touch
    let mut lanes = Vec::new();
    for lane in 0..cfg.threads {
        let shared = Arc::clone(&shared);
        let queue = Arc::clone(&queue);
        let cohort_size = cfg.cohort;
        let dp_bits = hello.dp_bits as u32;
        lanes.push(thread::spawn(move || {
            lane_loop(lane, cohort_size, dp_bits, shared, queue)
        }));
    }

    let outcome = sender_loop(stream, &addr, client_id, &shared, &queue);

    shared.running.store(false, Ordering::SeqCst);
    queue.request_shutdown();
    for lane in lanes {
        let _ = lane.join();
    }
    outcome
}

fn init_shared(hello: &ServerHello) -> Result<WorkerShared> {
    let target = point_from_xy(&hello.target_x, &hello.target_y)
        .context("server sent an invalid target point")?;
    let wild_offset = scalar_from_be32(&hello.wild_offset)
        .ok_or_else(|| anyhow!("server sent a non-canonical wild offset"))?;
    // the offset is the interval midpoint 2^(n-1), so n falls out of it
    let interval_bits = BigUint::from_bytes_be(&hello.wild_offset).bits() as u32;
    if interval_bits == 0 {
        return Err(anyhow!("server sent a zero wild offset"));
    }
    let start = BigUint::from_bytes_be(&hello.range_start);
    let end = BigUint::from_bytes_be(&hello.range_end);
    let params = HerdParams::new(&target, &wild_offset, start, end)?;
    Ok(WorkerShared {
        running: AtomicBool::new(true),
        found: Mutex::new(None),
        conn_broken: AtomicBool::new(false),
        acked: AtomicU64::new(0),
        ops: AtomicU64::new(0),
        resets: Mutex::new(Vec::new()),
        target,
        wild_offset,
        interval_bits,
        params: Mutex::new(params),
        params_epoch: AtomicU64::new(1),
        conn_epoch: AtomicU64::new(1),
    })
}

fn lane_loop(
    lane: u32,
    cohort_size: usize,
    dp_bits: u32,
    shared: Arc<WorkerShared>,
    queue: Arc<DpQueue>,
) {
    let jumps = JumpTable::build();
    let walker = Walker::new(&jumps, dp_bits, shared.interval_bits);
    let mut rng = StdRng::from_entropy();
    let mut epoch = shared.params_epoch.load(Ordering::SeqCst);
    let mut params = shared.current_params();
    let mut cohort = Cohort::spawn(lane, cohort_size, &params, &mut rng);
    let mut buf: Vec<Dp> = Vec::new();

    while shared.running.load(Ordering::Relaxed) {
        let cur = shared.params_epoch.load(Ordering::SeqCst);
        if cur != epoch {
            epoch = cur;
            params = shared.current_params();
            cohort = Cohort::spawn(lane, cohort_size, &params, &mut rng);
            debug!("lane {lane}: range changed, cohort respawned");
        }
        for kidx in shared.take_resets(lane) {
            if cohort.reseed_kidx(kidx, &params, &mut rng) {
                debug!("lane {lane}: reseeded kidx {kidx}");
            }
        }

        // backpressure: skip this compute pass while the queue sits over
        // the soft bound, so no new DPs pile up behind a slow sender
        if queue.depth() > QUEUE_SOFT_BOUND {
            thread::sleep(Duration::from_millis(2));
            continue;
        }

        for slot in 0..cohort.len() {
            let outcome = walker.step(&mut cohort.roos_mut()[slot]);
            match outcome {
                StepOutcome::Advanced => {}
                StepOutcome::Dp(dp) => buf.push(dp),
                StepOutcome::DeadBranch => cohort.reseed_slot(slot, &params, &mut rng),
            }
        }
        shared.ops.fetch_add(cohort.len() as u64, Ordering::Relaxed);

        if !buf.is_empty() {
            queue.push_batch(&buf, lane, 0);
            buf.clear();
        }
    }
}

fn spawn_reader(
    stream: &TcpStream,
    shared: &Arc<WorkerShared>,
    queue: &Arc<DpQueue>,
) -> Result<()> {
    let stream = stream.try_clone()?;
    let shared = Arc::clone(shared);
    let queue = Arc::clone(queue);
    let my_epoch = shared.conn_epoch.load(Ordering::SeqCst);
    thread::spawn(move || {
        let mut reader = BufReader::new(stream);
        loop {
            let msg = protocol::read_message(&mut reader);
            // a reconnect supersedes this reader; a stale ack must never
            // retire batches of the fresh session
            if shared.conn_epoch.load(Ordering::SeqCst) != my_epoch {
                return;
            }
            match msg {
                Ok(Message::DpAck { last_sequence }) => {
                    shared.acked.fetch_max(last_sequence, Ordering::SeqCst);
                }
                Ok(Message::Ping { .. }) => {}
                Ok(Message::ResetKangaroo { kidx }) => {
                    shared.push_reset(kidx);
                }
                Ok(Message::RangeReassign { start, end }) => {
                    let start = BigUint::from_bytes_be(&start);
                    let end = BigUint::from_bytes_be(&end);
                    if let Err(e) = shared.set_range(start, end) {
                        warn!("ignoring bad range reassignment: {e}");
                    }
                }
                Ok(Message::Stop { found_key }) => {
                    info!("server announced the key; draining");
                    shared.set_found(found_key);
                    shared.running.store(false, Ordering::SeqCst);
                    queue.request_shutdown();
                    // keep reading: acks for the drained tail still arrive
                }
                Ok(other) => {
                    warn!("server sent worker-only message {other:?}");
                }
                Err(_) => break,
            }
        }
        if shared.conn_epoch.load(Ordering::SeqCst) == my_epoch {
            shared.conn_broken.store(true, Ordering::SeqCst);
        }
    });
    Ok(())
}

fn sender_loop(
    mut stream: TcpStream,
    addr: &str,
    client_id: ClientId,
    shared: &Arc<WorkerShared>,
    queue: &Arc<DpQueue>,
) -> Result<ClientOutcome> {
    let mut unacked: VecDeque<(u64, Vec<Dp>)> = VecDeque::new();
    let mut next_seq: u64 = 1;
    let mut last_stats = Instant::now();
    let mut last_send = Instant::now();

    loop {
        // retire acked batches
        let acked = shared.acked.load(Ordering::SeqCst);
        while unacked.front().map_or(false, |(seq, _)| *seq <= acked) {
            unacked.pop_front();
        }

        if shared.conn_broken.load(Ordering::SeqCst) {
            match reestablish(addr, client_id, shared, queue, &mut unacked, &mut next_seq)? {
                Some(s) => stream = s,
                None => break, // stopped while reconnecting
            }
        }

        let batch = queue.pop_batch(MAX_SEND_BATCH, Duration::from_secs(1), BATCHING_DELAY);
        if batch.is_empty() {
            if !shared.running.load(Ordering::SeqCst) && queue.depth() == 0 {
                wait_for_acks(shared, &mut unacked);
                break;
            }
            if last_send.elapsed() >= PING_INTERVAL {
                last_send = Instant::now();
                if protocol::write_message(
                    &mut stream,
                    &Message::Ping {
                        timestamp: unix_timestamp(),
                    },
                )
                .is_err()
                {
                    shared.conn_broken.store(true, Ordering::SeqCst);
                }
            }
        } else {
            let dps: Vec<Dp> = batch.iter().map(|item| item.dp).collect();
            match protocol::write_message(&mut stream, &Message::DpBatch(dps.clone())) {
                Ok(()) => {
                    unacked.push_back((next_seq, dps));
                    next_seq += 1;
                    last_send = Instant::now();
                }
                Err(e) => {
                    debug!("send failed, keeping batch for resend: {e}");
                    // keep the batch as unacked so the reconnect path resends it
                    unacked.push_back((next_seq, dps));
                    next_seq += 1;
                    shared.conn_broken.store(true, Ordering::SeqCst);
                }
            }
        }

        if last_stats.elapsed() >= STATS_INTERVAL {
            last_stats = Instant::now();
            let (pushed, popped) = queue.totals();
            let stats = Message::Stats {
                pushed,
                popped,
                ops_count: shared.ops.load(Ordering::Relaxed),
            };
            if protocol::write_message(&mut stream, &stats).is_err() {
                shared.conn_broken.store(true, Ordering::SeqCst);
            }
        }
    }

    match shared.get_found() {
        Some(key) => Ok(ClientOutcome::Found(key)),
        None => Ok(ClientOutcome::Drained),
    }
}

/// Give in-flight acks a moment to land before a graceful exit.
fn wait_for_acks(shared: &WorkerShared, unacked: &mut VecDeque<(u64, Vec<Dp>)>) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while !unacked.is_empty() && Instant::now() < deadline {
        thread::sleep(Duration::from_millis(50));
        let acked = shared.acked.load(Ordering::SeqCst);
        while unacked.front().map_or(false, |(seq, _)| *seq <= acked) {
            unacked.pop_front();
        }
    }
    if !unacked.is_empty() {
        warn!("{} batches never acked before shutdown", unacked.len());
    }
}

/// Reconnect with exponential backoff, replay the handshake and resend
/// every unacked batch under fresh sequence numbers.
fn reestablish(
    addr: &str,
    client_id: ClientId,
    shared: &Arc<WorkerShared>,
    queue: &Arc<DpQueue>,
    unacked: &mut VecDeque<(u64, Vec<Dp>)>,
    next_seq: &mut u64,
) -> Result<Option<TcpStream>> {
    let (mut stream, hello) = match connect_with_backoff(
        addr,
        client_id,
        shared.interval_bits as u8,
        Some(shared),
    ) {
        Ok(pair) => pair,
        Err(e) => {
            if !shared.running.load(Ordering::SeqCst) {
                return Ok(None);
            }
            return Err(e);
        }
    };

    shared.conn_epoch.fetch_add(1, Ordering::SeqCst);
    shared.acked.store(0, Ordering::SeqCst);
    shared.conn_broken.store(false, Ordering::SeqCst);
    spawn_reader(&stream, shared, queue)?;

    // the server may have reassigned our range while we were away
    let start = BigUint::from_bytes_be(&hello.range_start);
    let end = BigUint::from_bytes_be(&hello.range_end);
    let current = shared.current_params();
    let changed = current.range_start != start
        || (BigUint::from(1u8) << current.width_bits as usize) != &end - &start;
    if changed {
        shared.set_range(start, end)?;
        info!("range reassigned on reconnect");
    }

    // resend unacked batches, renumbered for the fresh session
    let batches: Vec<Vec<Dp>> = unacked.iter().map(|(_, dps)| dps.clone()).collect();
    unacked.clear();
    let mut seq = 0u64;
    for dps in batches {
        seq += 1;
        if protocol::write_message(&mut stream, &Message::DpBatch(dps.clone())).is_err() {
            shared.conn_broken.store(true, Ordering::SeqCst);
        }
        unacked.push_back((seq, dps));
    }
    *next_seq = seq + 1;
    if seq > 0 {
        info!("resent {seq} unacked batches after reconnect");
    }
    Ok(Some(stream))
}

fn connect_with_backoff(
    addr: &str,
    client_id: ClientId,
    interval_bits: u8,
    shared: Option<&Arc<WorkerShared>>,
) -> Result<(TcpStream, ServerHello)> {
    let mut backoff = Duration::from_secs(1);
    for attempt in 1..=MAX_RECONNECT_ATTEMPTS {
        if let Some(shared) = shared {
            if !shared.running.load(Ordering::SeqCst) {
                return Err(anyhow!("stopped while reconnecting"));
            }
        }
        match connect_once(addr, client_id, interval_bits) {
            Ok(pair) => return Ok(pair),
            Err(ProtocolError::Rejected) => {
                return Err(ProtocolError::Rejected.into());
            }
            Err(e) => {
                warn!("connect attempt {attempt}/{MAX_RECONNECT_ATTEMPTS} failed: {e}");
            }
        }
        if attempt < MAX_RECONNECT_ATTEMPTS {
            thread::sleep(backoff);
            backoff = (backoff * 2).min(BACKOFF_CAP);
        }
    }
    Err(ProtocolError::Io(std::io::Error::new(
        std::io::ErrorKind::ConnectionAborted,
        format!("no connection to {addr} after {MAX_RECONNECT_ATTEMPTS} attempts"),
    ))
    .into())
}

fn connect_once(
    addr: &str,
    client_id: ClientId,
    interval_bits: u8,
) -> std::result::Result<(TcpStream, ServerHello), ProtocolError> {
    let mut stream = TcpStream::connect(addr)?;
    stream.set_read_timeout(Some(IO_TIMEOUT))?;
    stream.set_write_timeout(Some(IO_TIMEOUT))?;
    stream.set_nodelay(true)?;
    protocol::write_client_hello(
        &mut stream,
        &ClientHello {
            client_id,
            interval_bits,
        },
    )?;
    let hello = protocol::read_server_hello(&mut stream)?;
    if !hello.accepted {
        return Err(ProtocolError::Rejected);
    }
    Ok((stream, hello))
}

fn unix_timestamp() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

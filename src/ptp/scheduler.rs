//! The reactor (§4.G): a single thread that owns every domain's mutable state, reads the
//! helper's framed pipes, fires the jittered DELAY_REQ timer and the periodic cleanup tick,
//! and writes DELAY_REQ frames back to the helper's stdin.
//!
//! One owning thread, `thread::sleep`-paced, `AtomicBool` shutdown, the same run-loop shape
//! `main.rs`'s `run_sync_loop` uses. The pipe reads themselves run on two small plumbing
//! threads (stdout/stderr can't both be waited on with a blocking read from one thread
//! without an OS-specific poller) that do nothing but decode frames and forward them; only
//! the reactor thread ever touches `DomainState`.

use std::cmp::Reverse;
use std::collections::BinaryHeap;
use std::io::Write;
use std::process::{Child, Command, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use rand::Rng;

use super::config::PtpConfig;
use super::domain::{DomainConfig, DomainState};
use super::facade::{self, DomainRegistry, DomainSnapshot};
use super::framing::{self, DataFrame, FramingError, LogFrame};
use super::identity::ClockIdentity;
use super::stats::StatisticsBus;
use super::timestamp::Nanos;
use super::wire::{self, MessageBody, MessageType};

enum ReactorEvent {
    Data(DataFrame),
    Log(LogFrame),
    DataClosed,
    LogClosed,
}

/// A pending jittered DELAY_REQ fire, ordered earliest-first via `Reverse`.
struct DelayReqTimer {
    fire_at: Instant,
    domain: u8,
    sync_seqnum: u16,
}

impl PartialEq for DelayReqTimer {
    fn eq(&self, other: &Self) -> bool {
        self.fire_at == other.fire_at
    }
}
impl Eq for DelayReqTimer {}
impl PartialOrd for DelayReqTimer {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}
impl Ord for DelayReqTimer {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.fire_at.cmp(&other.fire_at)
    }
}

/// Owns the helper child process and the reactor thread. Dropping it tears both down
/// (§5 "Cancellation and timeouts", §9 "Process lifetime coupling").
pub struct PtpRuntime {
    own_identity: ClockIdentity,
    stats: Arc<StatisticsBus>,
    registry: DomainRegistry,
    initialized: Arc<AtomicBool>,
    shutdown: Arc<AtomicBool>,
    reactor_handle: Option<JoinHandle<()>>,
    helper_child: Arc<Mutex<Child>>,
}

impl PtpRuntime {
    /// Spawns the helper process, waits for its mandatory CLOCK_ID frame, then starts the
    /// reactor thread. Blocks until the clock id is known or the helper fails (§6 `init`).
    pub fn init(config: PtpConfig, domains: Vec<u8>) -> anyhow::Result<Self> {
        let helper_path = config.resolve_helper_path();
        let mut command = Command::new(&helper_path);
        for iface in &config.interfaces {
            command.arg("-i").arg(iface);
        }
        if config.verbose_from_env() {
            command.arg("-v");
        }
        if let Some(clock_id) = config.clock_id {
            command.arg("-c").arg(format!("0x{clock_id:016x}"));
        }
        command.stdin(Stdio::piped()).stdout(Stdio::piped()).stderr(Stdio::piped());

        let mut child = command
            .spawn()
            .map_err(|e| anyhow::anyhow!("failed to spawn PTP helper at {:?}: {e}", helper_path))?;

        let stdin = child.stdin.take().ok_or_else(|| anyhow::anyhow!("helper stdin not piped"))?;
        let stdout = child.stdout.take().ok_or_else(|| anyhow::anyhow!("helper stdout not piped"))?;
        let stderr = child.stderr.take().ok_or_else(|| anyhow::anyhow!("helper stderr not piped"))?;

        let (tx, rx): (Sender<ReactorEvent>, Receiver<ReactorEvent>) = mpsc::channel();

        let data_tx = tx.clone();
        let mut stdout = stdout;
        thread::spawn(move || loop {
            match framing::read_data_frame(&mut stdout) {
                Ok(frame) => {
                    if data_tx.send(ReactorEvent::Data(frame)).is_err() {
                        return;
                    }
                }
                Err(FramingError::Eof) => {
                    let _ = data_tx.send(ReactorEvent::DataClosed);
                    return;
                }
                Err(e) => {
                    log::warn!("malformed helper data frame, dropping: {e}");
                }
            }
        });

        let log_tx = tx;
        let mut stderr = stderr;
        thread::spawn(move || loop {
            match framing::read_log_frame(&mut stderr) {
                Ok(frame) => {
                    if log_tx.send(ReactorEvent::Log(frame)).is_err() {
                        return;
                    }
                }
                Err(FramingError::Eof) => {
                    let _ = log_tx.send(ReactorEvent::LogClosed);
                    return;
                }
                Err(e) => {
                    log::warn!("malformed helper log frame, dropping: {e}");
                }
            }
        });

        // Block for the mandatory CLOCK_ID frame (§6: "mandatory before any other frame").
        let own_identity = loop {
            match rx.recv() {
                Ok(ReactorEvent::Data(DataFrame::ClockId(id))) => break id,
                Ok(ReactorEvent::Data(_)) => {
                    anyhow::bail!("helper sent a data frame before CLOCK_ID");
                }
                Ok(ReactorEvent::Log(frame)) => log_helper_frame(&frame),
                Ok(ReactorEvent::DataClosed) | Ok(ReactorEvent::LogClosed) | Err(_) => {
                    anyhow::bail!("helper pipe closed before CLOCK_ID");
                }
            }
        };

        let stats = Arc::new(StatisticsBus::new());
        let registry = facade::new_registry();
        let initialized = Arc::new(AtomicBool::new(true));
        let shutdown = Arc::new(AtomicBool::new(false));

        let reactor_stats = stats.clone();
        let reactor_registry = registry.clone();
        let reactor_initialized = initialized.clone();
        let reactor_shutdown = shutdown.clone();
        let cleanup_tick = config.cleanup_tick;
        let domain_config = DomainConfig {
            filter_mode: config.filter_mode.into(),
            opportunistic_master_selection: config.opportunistic_master_selection,
            announce_receipt_timeout_intervals: config.announce_receipt_timeout_intervals,
            min_pending_sync_timeout: config.min_pending_sync_timeout.as_nanos() as Nanos,
        };

        let reactor_handle = thread::spawn(move || {
            run_reactor(
                rx,
                stdin,
                own_identity,
                domains,
                domain_config,
                cleanup_tick,
                reactor_stats,
                reactor_registry,
                reactor_initialized,
                reactor_shutdown,
            );
        });

        Ok(PtpRuntime {
            own_identity,
            stats,
            registry,
            initialized,
            shutdown,
            reactor_handle: Some(reactor_handle),
            helper_child: Arc::new(Mutex::new(child)),
        })
    }

    pub fn own_identity(&self) -> ClockIdentity {
        self.own_identity
    }

    pub fn statistics(&self) -> Arc<StatisticsBus> {
        self.stats.clone()
    }

    pub fn registry(&self) -> DomainRegistry {
        self.registry.clone()
    }

    pub fn is_initialized(&self) -> bool {
        self.initialized.load(Ordering::SeqCst)
    }
}

impl Drop for PtpRuntime {
    fn drop(&mut self) {
        self.shutdown.store(true, Ordering::SeqCst);
        if let Some(handle) = self.reactor_handle.take() {
            let _ = handle.join();
        }
        if let Ok(mut child) = self.helper_child.lock() {
            let _ = child.kill();
            let _ = child.wait();
        }
    }
}

fn log_helper_frame(frame: &LogFrame) {
    let target = format!("ptp-helper::{}", frame.module);
    match frame.level {
        0 => log::error!(target: "ptp_helper", "{}:{} {}", frame.file, frame.line, frame.message),
        1 => log::warn!(target: "ptp_helper", "{}:{} {}", frame.file, frame.line, frame.message),
        2 => log::info!(target: "ptp_helper", "{}:{} {}", frame.file, frame.line, frame.message),
        _ => log::trace!(target: "ptp_helper", "{} {}:{} {}", target, frame.file, frame.line, frame.message),
    }
}

#[allow(clippy::too_many_arguments)]
fn run_reactor(
    rx: Receiver<ReactorEvent>,
    mut stdin: impl Write,
    own_identity: ClockIdentity,
    domain_ids: Vec<u8>,
    domain_config: DomainConfig,
    cleanup_tick: Duration,
    stats: Arc<StatisticsBus>,
    registry: DomainRegistry,
    initialized: Arc<AtomicBool>,
    shutdown: Arc<AtomicBool>,
) {
    let mut domains: std::collections::HashMap<u8, DomainState> = domain_ids
        .into_iter()
        .map(|d| (d, DomainState::new(d, domain_config, Box::new(super::calibration::RegressionClock::new()))))
        .collect();

    let mut rng = rand::thread_rng();
    let epoch = Instant::now();
    let mut delay_req_timers: BinaryHeap<Reverse<DelayReqTimer>> = BinaryHeap::new();
    let mut last_cleanup = Instant::now();

    while !shutdown.load(Ordering::SeqCst) {
        let now_wait = next_wait(&delay_req_timers, last_cleanup, cleanup_tick);

        match rx.recv_timeout(now_wait) {
            Ok(ReactorEvent::Data(frame)) => {
                handle_data_frame(frame, own_identity, &mut domains, &stats, &mut stdin, &mut rng, &mut delay_req_timers);
                publish_snapshots(&domains, &registry);
            }
            Ok(ReactorEvent::Log(frame)) => log_helper_frame(&frame),
            Ok(ReactorEvent::DataClosed) | Ok(ReactorEvent::LogClosed) => {
                log::error!("PTP helper pipe closed unexpectedly, tearing down reactor");
                initialized.store(false, Ordering::SeqCst);
                return;
            }
            Err(RecvTimeoutError::Disconnected) => {
                initialized.store(false, Ordering::SeqCst);
                return;
            }
            Err(RecvTimeoutError::Timeout) => {}
        }

        if fire_due_delay_reqs(&mut delay_req_timers, epoch, &mut domains, own_identity, &mut stdin) {
            initialized.store(false, Ordering::SeqCst);
            return;
        }

        if last_cleanup.elapsed() >= cleanup_tick {
            let now = epoch.elapsed().as_nanos() as Nanos;
            for domain in domains.values_mut() {
                for event in domain.cleanup(now) {
                    stats.emit(&event);
                }
            }
            publish_snapshots(&domains, &registry);
            last_cleanup = Instant::now();
        }
    }
}

/// Publishes the part of each domain's state the facade (§4.I) needs, so `Clock::now()`
/// and friends never have to reach across the reactor-thread boundary into `DomainState`.
fn publish_snapshots(domains: &std::collections::HashMap<u8, DomainState>, registry: &DomainRegistry) {
    let mut guard = registry.lock().expect("domain registry mutex poisoned");
    for (id, domain) in domains {
        guard.insert(
            *id,
            DomainSnapshot {
                master: domain.master(),
                grandmaster_identity: domain.grandmaster_identity(),
                now_ptp: domain.now_ptp(),
            },
        );
    }
}

fn next_wait(timers: &BinaryHeap<Reverse<DelayReqTimer>>, last_cleanup: Instant, cleanup_tick: Duration) -> Duration {
    let cleanup_remaining = cleanup_tick.saturating_sub(last_cleanup.elapsed());
    match timers.peek() {
        Some(Reverse(t)) => {
            let timer_remaining = t.fire_at.saturating_duration_since(Instant::now());
            timer_remaining.min(cleanup_remaining)
        }
        None => cleanup_remaining,
    }
}

#[allow(clippy::too_many_arguments)]
fn handle_data_frame(
    frame: DataFrame,
    own_identity: ClockIdentity,
    domains: &mut std::collections::HashMap<u8, DomainState>,
    stats: &Arc<StatisticsBus>,
    stdin: &mut impl Write,
    rng: &mut impl Rng,
    delay_req_timers: &mut BinaryHeap<Reverse<DelayReqTimer>>,
) {
    match frame {
        DataFrame::ClockId(_) => {
            log::warn!("received a second CLOCK_ID frame after startup, ignoring");
        }
        DataFrame::Message { helper_receive_time, ptp_bytes } => {
            let parsed = match wire::parse_message(&ptp_bytes) {
                Ok(p) => p,
                Err(e) => {
                    log::warn!("dropping malformed PTP message: {e}");
                    return;
                }
            };
            let domain_number = parsed.header.domain_number;
            let Some(domain) = domains.get_mut(&domain_number) else {
                return;
            };

            let events = match (parsed.header.message_type, parsed.body) {
                (MessageType::Announce, MessageBody::Announce(body)) => domain.handle_announce(
                    parsed.header.source_port_identity,
                    own_identity,
                    &parsed.header,
                    &body,
                    helper_receive_time,
                ),
                (MessageType::Sync, MessageBody::Sync(body)) => {
                    let events = domain.handle_sync(
                        parsed.header.source_port_identity,
                        own_identity,
                        &parsed.header,
                        &body,
                        helper_receive_time,
                    );
                    schedule_delay_reqs(domain, domain_number, rng, delay_req_timers);
                    events
                }
                (MessageType::FollowUp, MessageBody::FollowUp(body)) => {
                    let events = domain.handle_follow_up(
                        parsed.header.source_port_identity,
                        own_identity,
                        &parsed.header,
                        &body,
                        helper_receive_time,
                    );
                    schedule_delay_reqs(domain, domain_number, rng, delay_req_timers);
                    events
                }
                (MessageType::DelayResp, MessageBody::DelayResp(body)) => domain.handle_delay_resp(
                    parsed.header.source_port_identity,
                    own_identity,
                    &parsed.header,
                    &body,
                    helper_receive_time,
                ),
                _ => Vec::new(),
            };
            for event in events {
                stats.emit(&event);
            }
        }
        DataFrame::SendTimeAck { helper_send_time, domain, sequence_id, .. } => {
            if let Some(domain_state) = domains.get_mut(&domain) {
                domain_state.handle_send_time_ack(domain, sequence_id, helper_send_time);
            }
        }
    }

    let _ = stdin; // DELAY_REQ frames are written from `fire_due_delay_reqs`, not here.
}

fn schedule_delay_reqs(
    domain: &mut DomainState,
    domain_number: u8,
    rng: &mut impl Rng,
    delay_req_timers: &mut BinaryHeap<Reverse<DelayReqTimer>>,
) {
    // Uniform jitter in [0, 2 * min_delay_req_interval) ms, clamped to >= 1ms when no
    // interval has been observed yet (§4.G).
    let interval_ms = (domain.min_delay_req_interval() / 1_000_000).max(1) as u64;
    for seqnum in domain.delay_req_eligible_seqnums() {
        let jitter_ms = rng.gen_range(0..2 * interval_ms);
        let fire_at = Instant::now() + Duration::from_millis(jitter_ms);
        delay_req_timers.push(Reverse(DelayReqTimer { fire_at, domain: domain_number, sync_seqnum: seqnum }));
    }
}

/// Returns `true` if the helper's stdin pipe has gone bad and the reactor must tear down.
fn fire_due_delay_reqs(
    delay_req_timers: &mut BinaryHeap<Reverse<DelayReqTimer>>,
    epoch: Instant,
    domains: &mut std::collections::HashMap<u8, DomainState>,
    own_identity: ClockIdentity,
    stdin: &mut impl Write,
) -> bool {
    let now_instant = Instant::now();
    while let Some(Reverse(timer)) = delay_req_timers.peek() {
        if timer.fire_at > now_instant {
            break;
        }
        let Reverse(timer) = delay_req_timers.pop().unwrap();
        let Some(domain) = domains.get_mut(&timer.domain) else { continue };
        let now = epoch.elapsed().as_nanos() as Nanos;
        if let Some(bytes) = domain.attempt_send_delay_req(timer.sync_seqnum, own_identity, now) {
            let frame = framing::encode_delay_req_frame(now, &bytes);
            if let Err(e) = stdin.write_all(&frame) {
                log::error!("short write sending DELAY_REQ to helper, tearing down: {e}");
                return true;
            }
        }
    }
    false
}

//! The per-device tuner: one logical DVB frontend fed by a SAT>IP server.
//!
//! Each tuner runs one background task driving the RTSP session state
//! machine. Host calls only touch the small synchronized API surface;
//! state requests are queued and the task is woken. Internal requests are
//! drained strictly before external ones, so error handling inside the
//! machine always wins over host wishes within a wake-up.

pub mod buffer;
pub mod feed;
pub mod rtcp;
pub mod rtp;
pub mod rtsp;
pub mod section;

use std::collections::{BTreeSet, VecDeque};
use std::fmt::Write as _;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use log::{debug, error, info, warn};
use parking_lot::Mutex;
use tokio::net::UdpSocket;
use tokio::sync::{watch, Notify};
use tokio::task::JoinHandle;

use crate::config::{trace, SatipConfig, TransportMode, DEFAULT_RTSP_PORT};
use crate::error::{Result, SatipError};
use crate::params::tnr_url_params;
use crate::poller::{Poller, PollerId};
use crate::server::{Quirks, ServerRef};
use crate::socket::{multicast_socket, udp_socket};
use crate::tuner::feed::TunerFeed;
use crate::tuner::rtcp::{parse_reception_report, RtcpReceiver};
use crate::tuner::rtp::RtpReceiver;
use crate::tuner::rtsp::{NegotiatedTransport, RtspClient};

pub(crate) const CONNECT_TIMEOUT: Duration = Duration::from_millis(1500);
const SETUP_TIMEOUT: Duration = Duration::from_millis(2000);
pub const TUNING_TIMEOUT: Duration = Duration::from_millis(3000);
const MIN_KEEPALIVE_MS: u64 = 30_000;
const KEEPALIVE_PREBUFFER_MS: u64 = 500;
const PID_UPDATE_DEBOUNCE: Duration = Duration::from_millis(100);
const STATUS_POLL: Duration = Duration::from_millis(2000);
const IDLE_CHECK: Duration = Duration::from_secs(10);
const SLEEP_TIMEOUT: Duration = Duration::from_millis(500);
/// Consecutive session failures before the tuner gives up.
const MAX_TUNE_ATTEMPTS: u32 = 3;
/// Filler PID appended for servers that cannot stream a lone PID < 0x20.
const DUMMY_PID: u16 = 256;

/// Tuner life cycle states. The order matters: `Tuned` and above mean an
/// RTSP session exists.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum TunerState {
    Idle,
    Release,
    Set,
    Tuned,
    Locked,
}

impl TunerState {
    pub fn as_str(&self) -> &'static str {
        match self {
            TunerState::Idle => "Idle",
            TunerState::Release => "Release",
            TunerState::Set => "Set",
            TunerState::Tuned => "Tuned",
            TunerState::Locked => "Locked",
        }
    }
}

/// Who asked for a state change.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StateMode {
    Internal,
    External,
}

/// Ordered set of 13-bit PIDs.
#[derive(Debug, Clone, Default)]
pub struct PidSet(BTreeSet<u16>);

impl PidSet {
    pub fn add(&mut self, pid: u16) -> bool {
        self.0.insert(pid & 0x1FFF)
    }

    pub fn remove(&mut self, pid: u16) -> bool {
        self.0.remove(&(pid & 0x1FFF))
    }

    pub fn contains(&self, pid: u16) -> bool {
        self.0.contains(&pid)
    }

    pub fn clear(&mut self) {
        self.0.clear();
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn smallest(&self) -> Option<u16> {
        self.0.iter().next().copied()
    }

    /// Comma-separated ascending list, as used in `pids=` parameters.
    pub fn to_param_list(&self) -> String {
        let mut s = String::new();
        for pid in &self.0 {
            if !s.is_empty() {
                s.push(',');
            }
            let _ = write!(s, "{pid}");
        }
        s
    }
}

struct ServerAttachment {
    server: ServerRef,
    transponder: i32,
}

struct TunerInner {
    state: TunerState,
    internal: VecDeque<TunerState>,
    external: VecDeque<TunerState>,
    stream_addr: String,
    stream_port: u16,
    stream_param: String,
    last_addr: String,
    last_param: String,
    tnr_param: String,
    current_server: Option<ServerAttachment>,
    next_server: Option<ServerAttachment>,
    session_timeout_ms: u64,
    stream_id: Option<u32>,
    pids: PidSet,
    add_pids: PidSet,
    del_pids: PidSet,
    pmt_pid: i32,
    keepalive_deadline: Instant,
    pid_update_after: Instant,
    status_update_after: Instant,
    setup_deadline: Instant,
    fail_count: u32,
}

impl TunerInner {
    fn new() -> Self {
        let now = Instant::now();
        Self {
            state: TunerState::Idle,
            internal: VecDeque::new(),
            external: VecDeque::new(),
            stream_addr: String::new(),
            stream_port: DEFAULT_RTSP_PORT,
            stream_param: String::new(),
            last_addr: String::new(),
            last_param: String::new(),
            tnr_param: String::new(),
            current_server: None,
            next_server: None,
            session_timeout_ms: MIN_KEEPALIVE_MS - KEEPALIVE_PREBUFFER_MS,
            stream_id: None,
            pids: PidSet::default(),
            add_pids: PidSet::default(),
            del_pids: PidSet::default(),
            pmt_pid: -1,
            keepalive_deadline: now,
            pid_update_after: now,
            status_update_after: now,
            setup_deadline: now,
            fail_count: 0,
        }
    }

    fn current_quirks(&self) -> Quirks {
        self.current_server
            .as_ref()
            .map(|a| a.server.quirks)
            .unwrap_or_default()
    }

    fn base_url(&self) -> String {
        base_url(&self.stream_addr, self.stream_port)
    }
}

/// Poller registrations and ports of the sockets currently carrying
/// RTP/RTCP. The sockets themselves live in the poller's reader tasks.
struct Transport {
    rtp_id: PollerId,
    rtp_port: u16,
    rtcp_id: PollerId,
    rtcp_port: u16,
    multicast: bool,
}

pub struct Tuner {
    device_id: usize,
    config: Arc<SatipConfig>,
    registry: Arc<crate::server::ServerRegistry>,
    poller: Arc<Poller>,
    pub feed: Arc<TunerFeed>,
    rtp: Arc<RtpReceiver>,
    rtcp: Arc<RtcpReceiver>,
    rtsp: tokio::sync::Mutex<RtspClient>,
    inner: Mutex<TunerInner>,
    transport: Mutex<Transport>,
    state_tx: watch::Sender<TunerState>,
    wakeup: Notify,
    running: AtomicBool,
    /// Set when the session failed `MAX_TUNE_ATTEMPTS` times in a row.
    gave_up: AtomicBool,
}

impl Tuner {
    pub fn new(
        device_id: usize,
        config: Arc<SatipConfig>,
        registry: Arc<crate::server::ServerRegistry>,
        poller: Arc<Poller>,
        feed: Arc<TunerFeed>,
    ) -> Result<Arc<Self>> {
        let rtp = RtpReceiver::new(Arc::clone(&feed), Arc::clone(&config));
        let rtcp = RtcpReceiver::new(Arc::clone(&feed), Arc::clone(&config));

        let (rtp_socket, rtcp_socket) = open_port_pair(&config)?;
        let rtp_socket = Arc::new(rtp_socket);
        let rtcp_socket = Arc::new(rtcp_socket);
        let rtp_port = rtp_socket.local_addr()?.port();
        let rtcp_port = rtcp_socket.local_addr()?.port();
        info!("Tuner using RTP/RTCP ports {rtp_port}/{rtcp_port} [device {device_id}]");

        let rtp_id = poller.register(rtp_socket, Arc::clone(&rtp) as Arc<dyn crate::poller::PollSink>);
        let rtcp_id = poller.register(
            rtcp_socket,
            Arc::clone(&rtcp) as Arc<dyn crate::poller::PollSink>,
        );

        let rtsp = RtspClient::new(
            device_id,
            Arc::clone(&config),
            Arc::clone(&rtp),
            Arc::clone(&rtcp),
        );
        let (state_tx, _) = watch::channel(TunerState::Idle);

        Ok(Arc::new(Self {
            device_id,
            config,
            registry,
            poller,
            feed,
            rtp,
            rtcp,
            rtsp: tokio::sync::Mutex::new(rtsp),
            inner: Mutex::new(TunerInner::new()),
            transport: Mutex::new(Transport {
                rtp_id,
                rtp_port,
                rtcp_id,
                rtcp_port,
                multicast: false,
            }),
            state_tx,
            wakeup: Notify::new(),
            running: AtomicBool::new(true),
            gave_up: AtomicBool::new(false),
        }))
    }

    pub fn start(self: &Arc<Self>) -> JoinHandle<()> {
        let tuner = Arc::clone(self);
        tokio::spawn(tuner.run())
    }

    // --- host-facing API -------------------------------------------------

    /// Point the tuner at a server and transponder. `None` clears the
    /// source. Returns immediately; the state machine does the work.
    pub fn set_source(&self, server: Option<ServerRef>, transponder: i32, param: &str) {
        let mut inner = self.inner.lock();
        match server {
            Some(server) => {
                let mut param = param.to_string();
                // Quirk: these servers only enable pilots when told so.
                if server.quirks.has(Quirks::FORCE_PILOT)
                    && param.contains("msys=dvbs2")
                    && !param.contains("plts=")
                {
                    param.push_str("&plts=on");
                }
                inner.stream_addr = server.address.clone();
                inner.stream_port = server.port;
                inner.stream_param = param;
                inner.next_server = Some(ServerAttachment {
                    server,
                    transponder,
                });
                // A different server needs its old session torn down first.
                if !inner.last_addr.is_empty() && inner.base_url() != inner.last_addr {
                    self.request_state_locked(&mut inner, TunerState::Release, StateMode::Internal);
                }
                self.request_state_locked(&mut inner, TunerState::Set, StateMode::External);
                inner.setup_deadline = Instant::now() + SETUP_TIMEOUT;
                inner.fail_count = 0;
                self.gave_up.store(false, Ordering::Relaxed);
            }
            None => {
                inner.stream_addr.clear();
                inner.stream_param.clear();
            }
        }
        drop(inner);
        self.wakeup.notify_one();
    }

    /// Toggle one PID. O(1); the state machine flushes the pending sets on
    /// its next cycle after the debounce.
    pub fn set_pid(&self, pid: u16, on: bool) {
        let mut inner = self.inner.lock();
        if on {
            inner.pids.add(pid);
            inner.add_pids.add(pid);
            inner.del_pids.remove(pid);
        } else {
            inner.pids.remove(pid);
            inner.del_pids.add(pid);
            inner.add_pids.remove(pid);
        }
        if self.config.traces(trace::PIDS) {
            debug!(
                "set_pid({pid}, {on}) pids={} [device {}]",
                inner.pids.to_param_list(),
                self.device_id
            );
        }
        drop(inner);
        self.wakeup.notify_one();
    }

    pub fn has_pid(&self, pid: u16) -> bool {
        self.inner.lock().pids.contains(pid)
    }

    pub fn state(&self) -> TunerState {
        self.inner.lock().state
    }

    pub fn subscribe_state(&self) -> watch::Receiver<TunerState> {
        self.state_tx.subscribe()
    }

    /// Did the machine run out of attempts since the last `set_source`?
    pub fn gave_up(&self) -> bool {
        self.gave_up.load(Ordering::Relaxed)
    }

    pub fn has_lock(&self) -> bool {
        self.state() >= TunerState::Tuned && self.feed.has_lock()
    }

    /// Called when the host closes its data path; a tuner that got past
    /// its setup window is released.
    pub fn on_dvr_closed(&self) {
        let mut inner = self.inner.lock();
        if Instant::now() >= inner.setup_deadline {
            self.request_state_locked(&mut inner, TunerState::Release, StateMode::External);
            drop(inner);
            self.wakeup.notify_one();
        }
    }

    /// Current / pending PID sets, for diagnostics and tests.
    pub fn pid_state(&self) -> (String, String, String) {
        let inner = self.inner.lock();
        (
            inner.pids.to_param_list(),
            inner.add_pids.to_param_list(),
            inner.del_pids.to_param_list(),
        )
    }

    /// Session facts for diagnostics: the stream id and whether the
    /// keep-alive deadline is still ahead.
    pub fn session_state(&self) -> (Option<u32>, bool) {
        let inner = self.inner.lock();
        (
            inner.stream_id,
            inner.keepalive_deadline > Instant::now(),
        )
    }

    /// One-line stream description for the INFO pages.
    pub async fn information(&self) -> String {
        let (state, url) = {
            let inner = self.inner.lock();
            let url = format!(
                "{}?{} [stream={}]",
                inner.base_url(),
                inner.stream_param,
                inner
                    .stream_id
                    .map(|id| id.to_string())
                    .unwrap_or_else(|| "-".to_string())
            );
            (inner.state, url)
        };
        if state >= TunerState::Tuned {
            let mode = self.rtsp.lock().await.mode();
            format!("{url} ({mode})")
        } else {
            "connection failed".to_string()
        }
    }

    pub fn statistic(&self) -> String {
        format!(
            "RTP packets={} lost={} errors={} RTCP packets={} errors={}",
            self.rtp.packets(),
            self.rtp.lost(),
            self.rtp.decode_errors(),
            self.rtcp.packets(),
            self.rtcp.decode_errors()
        )
    }

    /// Stop the state machine; the run task tears the session down and
    /// unregisters the sockets.
    pub fn shutdown(&self) {
        self.running.store(false, Ordering::Relaxed);
        self.wakeup.notify_one();
    }

    // --- state machine ---------------------------------------------------

    async fn run(self: Arc<Self>) {
        debug!("Tuner task entering [device {}]", self.device_id);
        let mut tuning_deadline = Instant::now() + TUNING_TIMEOUT;
        let mut idle_check = Instant::now() + IDLE_CHECK;
        let mut last_idle = false;

        while self.running.load(Ordering::Relaxed) {
            let state = self.advance_state();
            if self.config.traces(trace::TUNER_STATE) {
                debug!("Tuner state {} [device {}]", state.as_str(), self.device_id);
            }
            match state {
                TunerState::Idle => {}
                TunerState::Release => {
                    self.disconnect().await;
                    self.request_state(TunerState::Idle, StateMode::Internal);
                }
                TunerState::Set => {
                    if self.inner.lock().current_quirks().has(Quirks::TEAR_AND_PLAY) {
                        self.disconnect().await;
                    }
                    if self.connect().await {
                        tuning_deadline = Instant::now() + TUNING_TIMEOUT;
                        self.request_state(TunerState::Tuned, StateMode::Internal);
                        if !self.update_pids(true).await {
                            warn!("Initial pid update failed [device {}]", self.device_id);
                        }
                    } else {
                        self.disconnect().await;
                        self.register_failure();
                        // Brief backoff so a dead server is not hammered.
                        let fails = self.inner.lock().fail_count;
                        tokio::time::sleep(Duration::from_millis(
                            (250 * fails as u64).min(1000),
                        ))
                        .await;
                    }
                }
                TunerState::Tuned => {
                    self.feed.mark_data();
                    idle_check = Instant::now() + IDLE_CHECK;
                    last_idle = false;
                    let described = self.feed.has_lock() || self.read_reception_status().await;
                    if described {
                        if self.inner.lock().current_quirks().has(Quirks::FORCE_LOCK) {
                            self.feed.force_lock();
                        }
                        if self.feed.has_lock() {
                            self.inner.lock().fail_count = 0;
                            self.request_state(TunerState::Locked, StateMode::Internal);
                        }
                    }
                    if !self.feed.has_lock() && Instant::now() >= tuning_deadline {
                        error!("Tuning timeout, retuning [device {}]", self.device_id);
                        self.register_failure();
                    }
                }
                TunerState::Locked => {
                    if !self.update_pids(false).await {
                        error!("Pid update failed, retuning [device {}]", self.device_id);
                        self.request_state(TunerState::Set, StateMode::Internal);
                    } else if !self.keep_alive().await {
                        error!("Keep-alive failed, retuning [device {}]", self.device_id);
                        self.request_state(TunerState::Set, StateMode::Internal);
                    } else if self.feed.millis_since_data() > CONNECT_TIMEOUT.as_millis() as u64 {
                        error!("Connection timeout, retuning [device {}]", self.device_id);
                        self.request_state(TunerState::Set, StateMode::Internal);
                    } else if Instant::now() >= idle_check {
                        let currently_idle = !self.feed.is_dvr_open();
                        if last_idle && currently_idle {
                            info!("Idle timeout, releasing [device {}]", self.device_id);
                            self.request_state(TunerState::Release, StateMode::Internal);
                        }
                        last_idle = currently_idle;
                        idle_check = Instant::now() + IDLE_CHECK;
                    } else {
                        self.receive().await;
                    }
                }
            }

            if !self.state_requested() {
                let _ = tokio::time::timeout(SLEEP_TIMEOUT, self.wakeup.notified()).await;
            }
        }

        self.disconnect().await;
        let transport = self.transport.lock();
        self.poller.unregister(transport.rtp_id);
        self.poller.unregister(transport.rtcp_id);
        debug!("Tuner task exiting [device {}]", self.device_id);
    }

    /// Pop the next requested state: internal requests first, then
    /// external, matching the documented priority.
    fn advance_state(&self) -> TunerState {
        let mut inner = self.inner.lock();
        let next = inner
            .internal
            .pop_front()
            .or_else(|| inner.external.pop_front());
        if let Some(next) = next {
            if next != inner.state {
                debug!(
                    "Tuner {} -> {} [device {}]",
                    inner.state.as_str(),
                    next.as_str(),
                    self.device_id
                );
                inner.state = next;
                let _ = self.state_tx.send(next);
            }
        }
        inner.state
    }

    fn state_requested(&self) -> bool {
        let inner = self.inner.lock();
        !inner.internal.is_empty() || !inner.external.is_empty()
    }

    fn request_state(&self, state: TunerState, mode: StateMode) -> bool {
        let mut inner = self.inner.lock();
        let accepted = self.request_state_locked(&mut inner, state, mode);
        drop(inner);
        if accepted {
            self.wakeup.notify_one();
        }
        accepted
    }

    fn request_state_locked(
        &self,
        inner: &mut TunerInner,
        state: TunerState,
        mode: StateMode,
    ) -> bool {
        match mode {
            StateMode::External => inner.external.push_back(state),
            StateMode::Internal => {
                let effective = inner.internal.back().copied().unwrap_or(inner.state);
                // Releasing an idle tuner makes no sense; drop the request.
                if effective == TunerState::Idle && state == TunerState::Release {
                    return false;
                }
                inner.internal.push_back(state);
            }
        }
        true
    }

    fn register_failure(&self) {
        let mut inner = self.inner.lock();
        inner.fail_count += 1;
        if inner.fail_count >= MAX_TUNE_ATTEMPTS {
            error!(
                "Giving up after {} attempts [device {}]",
                inner.fail_count, self.device_id
            );
            self.gave_up.store(true, Ordering::Relaxed);
            self.request_state_locked(&mut inner, TunerState::Release, StateMode::Internal);
        } else {
            self.request_state_locked(&mut inner, TunerState::Set, StateMode::Internal);
        }
    }

    async fn resolve_peer(&self) -> Option<SocketAddr> {
        let (addr, port) = {
            let inner = self.inner.lock();
            if inner.stream_addr.is_empty() {
                return None;
            }
            (inner.stream_addr.clone(), inner.stream_port)
        };
        if let Ok(parsed) = format!("{addr}:{port}").parse() {
            return Some(parsed);
        }
        let result = match tokio::net::lookup_host((addr.as_str(), port)).await {
            Ok(mut hosts) => hosts.next(),
            Err(e) => {
                error!("Cannot resolve {addr}: {e} [device {}]", self.device_id);
                None
            }
        };
        result
    }

    /// Establish or refresh the RTSP session. Mirrors the Set state entry.
    async fn connect(&self) -> bool {
        let Some(peer) = self.resolve_peer().await else {
            return false;
        };

        enum Plan {
            Identical,
            Retune { uri: String, param: String },
            Setup {
                base: String,
                uri: String,
                bind: Option<IpAddr>,
                session_quirk: bool,
                use_tcp: bool,
                use_multicast: bool,
                rtp_port: u16,
                rtcp_port: u16,
            },
        }

        let plan = {
            let mut inner = self.inner.lock();
            inner.tnr_param.clear();
            let base = inner.base_url();
            if let Some(stream_id) = inner.stream_id {
                if inner.stream_param == inner.last_param
                    && self.feed.has_lock()
                    && self.config.frontend_reuse()
                {
                    Plan::Identical
                } else {
                    Plan::Retune {
                        uri: format!("{base}stream={stream_id}?{}", inner.stream_param),
                        param: inner.stream_param.clone(),
                    }
                }
            } else {
                let attachment = inner.next_server.as_ref().or(inner.current_server.as_ref());
                let quirks = attachment.map(|a| a.server.quirks).unwrap_or_default();
                let bind = attachment
                    .and_then(|a| a.server.src_address.as_ref())
                    .and_then(|s| s.parse().ok());
                let use_tcp = self.config.transport_mode() == TransportMode::RtpOverTcp
                    && quirks.has(Quirks::RTP_OVER_TCP);
                let use_multicast = self.config.transport_mode() == TransportMode::Multicast;
                let transport = self.transport.lock();
                Plan::Setup {
                    uri: format!("{base}?{}", inner.stream_param),
                    base,
                    bind,
                    session_quirk: quirks.has(Quirks::SESSION_ID),
                    use_tcp,
                    use_multicast,
                    rtp_port: transport.rtp_port,
                    rtcp_port: transport.rtcp_port,
                }
            }
        };

        match plan {
            Plan::Identical => {
                debug!("Identical parameters, keeping session [device {}]", self.device_id);
                true
            }
            Plan::Retune { uri, param } => {
                let mut rtsp = self.rtsp.lock().await;
                match rtsp.play(peer, &uri).await {
                    Ok(()) => {
                        let mut inner = self.inner.lock();
                        inner.keepalive_deadline =
                            Instant::now() + Duration::from_millis(inner.session_timeout_ms);
                        inner.last_param = param;
                        true
                    }
                    Err(e) => {
                        error!("Retune failed: {e} [device {}]", self.device_id);
                        rtsp.reset();
                        self.inner.lock().stream_id = None;
                        false
                    }
                }
            }
            Plan::Setup {
                base,
                uri,
                bind,
                session_quirk,
                use_tcp,
                use_multicast,
                rtp_port,
                rtcp_port,
            } => {
                let mut rtsp = self.rtsp.lock().await;
                rtsp.set_interface(bind);
                rtsp.set_session_quirk(session_quirk);
                if let Err(e) = rtsp.options(peer, &base).await {
                    error!("OPTIONS failed: {e} [device {}]", self.device_id);
                    rtsp.reset();
                    return false;
                }
                if use_tcp {
                    debug!("Requesting interleaved transport [device {}]", self.device_id);
                }
                match rtsp
                    .setup(peer, &uri, rtp_port, rtcp_port, use_tcp, use_multicast)
                    .await
                {
                    Ok(setup) => {
                        drop(rtsp);
                        self.apply_setup(peer, base, bind, setup)
                    }
                    Err(e) => {
                        error!("Connect failed: {e} [device {}]", self.device_id);
                        rtsp.reset();
                        self.inner.lock().stream_id = None;
                        false
                    }
                }
            }
        }
    }

    fn apply_setup(
        &self,
        peer: SocketAddr,
        base: String,
        bind: Option<IpAddr>,
        setup: rtsp::SetupResponse,
    ) -> bool {
        match &setup.transport {
            NegotiatedTransport::Multicast { destination, ports } => {
                let source = match peer.ip() {
                    IpAddr::V4(v4) => Some(v4),
                    IpAddr::V6(_) => None,
                };
                let interface = match bind {
                    Some(IpAddr::V4(v4)) => v4,
                    _ => Ipv4Addr::UNSPECIFIED,
                };
                if let Err(e) = self.join_multicast(*destination, *ports, source, interface) {
                    error!("Multicast join failed: {e} [device {}]", self.device_id);
                    return false;
                }
            }
            NegotiatedTransport::Unicast { .. } | NegotiatedTransport::Interleaved { .. } => {
                if let Err(e) = self.restore_unicast() {
                    error!("Transport restore failed: {e} [device {}]", self.device_id);
                    return false;
                }
            }
        }

        let mut inner = self.inner.lock();
        inner.session_timeout_ms = setup.timeout_ms.max(MIN_KEEPALIVE_MS) - KEEPALIVE_PREBUFFER_MS;
        inner.keepalive_deadline =
            Instant::now() + Duration::from_millis(inner.session_timeout_ms);
        inner.stream_id = setup.stream_id;
        inner.last_addr = base;
        inner.last_param = inner.stream_param.clone();
        if let Some(next) = inner.next_server.take() {
            inner.current_server = Some(next);
        }
        if let Some(attachment) = &inner.current_server {
            self.registry
                .attach(attachment.server.id, self.device_id, attachment.transponder);
        }
        if inner.stream_id.is_none() {
            warn!("SETUP yielded no stream id [device {}]", self.device_id);
        }
        true
    }

    async fn disconnect(&self) {
        let teardown = {
            let inner = self.inner.lock();
            match (inner.last_addr.is_empty(), inner.stream_id) {
                (false, Some(stream_id)) => Some(format!("{}stream={stream_id}", inner.last_addr)),
                _ => None,
            }
        };
        {
            let mut rtsp = self.rtsp.lock().await;
            if let (Some(uri), Some(peer)) = (teardown, self.resolve_peer().await) {
                if let Err(e) = rtsp.teardown(peer, &uri).await {
                    // Teardown failures are logged and ignored.
                    warn!("TEARDOWN failed: {e} [device {}]", self.device_id);
                }
            }
            rtsp.reset();
        }

        self.feed.reset_signal();
        let mut inner = self.inner.lock();
        inner.stream_id = None;
        inner.session_timeout_ms = MIN_KEEPALIVE_MS - KEEPALIVE_PREBUFFER_MS;
        inner.pmt_pid = -1;
        inner.tnr_param.clear();
        inner.add_pids.clear();
        inner.del_pids.clear();
        inner.status_update_after = Instant::now();
        if let Some(attachment) = inner.current_server.take() {
            self.registry
                .detach(attachment.server.id, self.device_id, attachment.transponder);
        }
    }

    /// Flush pending PID changes with one PLAY, honouring the debounce and
    /// the PlayPids/CI quirks. Returns false when the PLAY failed.
    async fn update_pids(&self, force: bool) -> bool {
        let request = {
            let mut inner = self.inner.lock();
            let due = (force && !inner.pids.is_empty())
                || (Instant::now() >= inner.pid_update_after
                    && (!inner.add_pids.is_empty() || !inner.del_pids.is_empty()));
            let stream_id = match inner.stream_id {
                Some(id) if due && !inner.stream_addr.is_empty() => id,
                _ => return true,
            };

            let quirks = inner.current_quirks();
            let use_dummy = quirks.has(Quirks::PLAY_PIDS);
            let has_ci = inner
                .current_server
                .as_ref()
                .map(|a| a.server.has_ci)
                .unwrap_or(false);
            let use_ci = self.config.ci_extension() && has_ci;

            let mut uri = format!("{}stream={stream_id}", inner.base_url());
            let mut separator = '?';
            let mut push = |uri: &mut String, part: &str| {
                uri.push(separator);
                uri.push_str(part);
                separator = '&';
            };

            if force || use_dummy {
                if !inner.pids.is_empty() {
                    let mut list = inner.pids.to_param_list();
                    if use_dummy
                        && inner.pids.len() == 1
                        && inner.pids.smallest().unwrap_or(0x20) < 0x20
                    {
                        let _ = write!(list, ",{DUMMY_PID}");
                    }
                    push(&mut uri, &format!("pids={list}"));
                }
            } else {
                if !inner.add_pids.is_empty() {
                    push(&mut uri, &format!("addpids={}", inner.add_pids.to_param_list()));
                }
                if !inner.del_pids.is_empty() {
                    push(&mut uri, &format!("delpids={}", inner.del_pids.to_param_list()));
                }
            }

            if use_ci {
                let channel = self.feed.tuned_channel();
                if quirks.has(Quirks::CI_XPMT) {
                    // x_pmt selects the service to descramble, x_ci the slot.
                    let pmt = if channel.pids.is_encrypted() {
                        channel.pids.pmt as i32
                    } else {
                        0
                    };
                    if pmt > 0 && pmt != inner.pmt_pid {
                        push(&mut uri, &format!("x_pmt={pmt}"));
                        let slot = ci_slot(&self.config, &channel.pids.ca_ids);
                        if slot > 0 {
                            push(&mut uri, &format!("x_ci={slot}"));
                        }
                    }
                    inner.pmt_pid = pmt;
                } else if quirks.has(Quirks::CI_TNR) && channel.pids.is_encrypted() {
                    let tnr = tnr_url_params(&channel);
                    if !tnr.is_empty() && tnr != inner.tnr_param {
                        push(&mut uri, &format!("tnr={tnr}"));
                        inner.tnr_param = tnr;
                    }
                }
            }

            inner.pid_update_after = Instant::now() + PID_UPDATE_DEBOUNCE;
            if separator == '?' {
                // Nothing to send after all.
                inner.add_pids.clear();
                inner.del_pids.clear();
                return true;
            }
            uri
        };

        let Some(peer) = self.resolve_peer().await else {
            return false;
        };
        if self.config.traces(trace::PIDS) {
            debug!("PLAY {request} [device {}]", self.device_id);
        }
        match self.rtsp.lock().await.play(peer, &request).await {
            Ok(()) => {
                let mut inner = self.inner.lock();
                inner.add_pids.clear();
                inner.del_pids.clear();
                true
            }
            Err(e) => {
                warn!("PLAY failed: {e} [device {}]", self.device_id);
                false
            }
        }
    }

    /// OPTIONS keep-alive once the session deadline approaches.
    async fn keep_alive(&self) -> bool {
        let base = {
            let mut inner = self.inner.lock();
            if Instant::now() < inner.keepalive_deadline {
                return true;
            }
            let timeout = inner.session_timeout_ms;
            inner.keepalive_deadline = Instant::now() + Duration::from_millis(timeout);
            if inner.stream_addr.is_empty() {
                return true;
            }
            inner.base_url()
        };
        let Some(peer) = self.resolve_peer().await else {
            return false;
        };
        match self.rtsp.lock().await.options(peer, &base).await {
            Ok(()) => true,
            Err(e) => {
                warn!("Keep-alive OPTIONS failed: {e} [device {}]", self.device_id);
                false
            }
        }
    }

    /// DESCRIBE poll while waiting for lock. Returns true when a response
    /// was parsed; a failure just means "no lock yet".
    async fn read_reception_status(&self) -> bool {
        let uri = {
            let mut inner = self.inner.lock();
            if Instant::now() < inner.status_update_after {
                return false;
            }
            inner.status_update_after = Instant::now() + STATUS_POLL;
            match inner.stream_id {
                Some(id) if !inner.stream_addr.is_empty() => {
                    format!("{}stream={id}", inner.base_url())
                }
                _ => return false,
            }
        };
        let Some(peer) = self.resolve_peer().await else {
            return false;
        };
        match self.rtsp.lock().await.describe(peer, &uri).await {
            Ok(body) => {
                if let Some(start) = body.find("ver=") {
                    let line = body[start..].lines().next().unwrap_or_default();
                    if let Some(report) = parse_reception_report(line.trim()) {
                        self.feed.apply_reception_report(&report, &self.config);
                    }
                }
                true
            }
            Err(e) => {
                debug!("DESCRIBE failed: {e} [device {}]", self.device_id);
                false
            }
        }
    }

    /// Pump the RTSP connection in interleaved mode.
    async fn receive(&self) {
        let result = self.rtsp.lock().await.receive().await;
        if let Err(e) = result {
            warn!("RTSP receive failed: {e} [device {}]", self.device_id);
            self.request_state(TunerState::Set, StateMode::Internal);
        }
    }

    // --- transport reconfiguration ---------------------------------------

    fn join_multicast(
        &self,
        group: Ipv4Addr,
        ports: (u16, u16),
        source: Option<Ipv4Addr>,
        bind: Ipv4Addr,
    ) -> Result<()> {
        let rcvbuf = self.config.rtp_rcvbuf_size();
        let mut transport = self.transport.lock();
        info!(
            "Joining multicast {group}:{}/{} [device {}]",
            ports.0, ports.1, self.device_id
        );
        let rtp_socket = Arc::new(multicast_socket(group, ports.0, source, bind, rcvbuf)?);
        let rtcp_socket = Arc::new(multicast_socket(group, ports.1, source, bind, 0)?);
        self.poller.unregister(transport.rtp_id);
        self.poller.unregister(transport.rtcp_id);
        transport.rtp_id = self.poller.register(
            rtp_socket,
            Arc::clone(&self.rtp) as Arc<dyn crate::poller::PollSink>,
        );
        transport.rtcp_id = self.poller.register(
            rtcp_socket,
            Arc::clone(&self.rtcp) as Arc<dyn crate::poller::PollSink>,
        );
        transport.rtp_port = ports.0;
        transport.rtcp_port = ports.1;
        transport.multicast = true;
        Ok(())
    }

    fn restore_unicast(&self) -> Result<()> {
        let mut transport = self.transport.lock();
        if !transport.multicast {
            return Ok(());
        }
        info!("Restoring unicast transport [device {}]", self.device_id);
        let (rtp_socket, rtcp_socket) = open_port_pair(&self.config)?;
        let rtp_socket = Arc::new(rtp_socket);
        let rtcp_socket = Arc::new(rtcp_socket);
        self.poller.unregister(transport.rtp_id);
        self.poller.unregister(transport.rtcp_id);
        transport.rtp_port = rtp_socket.local_addr()?.port();
        transport.rtcp_port = rtcp_socket.local_addr()?.port();
        transport.rtp_id = self.poller.register(
            rtp_socket,
            Arc::clone(&self.rtp) as Arc<dyn crate::poller::PollSink>,
        );
        transport.rtcp_id = self.poller.register(
            rtcp_socket,
            Arc::clone(&self.rtcp) as Arc<dyn crate::poller::PollSink>,
        );
        transport.multicast = false;
        Ok(())
    }
}

/// Which CI slot decodes this service, per the configured CA system ids.
fn ci_slot(config: &SatipConfig, ca_ids: &[u16]) -> i32 {
    for &id in ca_ids {
        if config.cicam(0) == id as i32 && id != 0 {
            return 1;
        }
        if config.cicam(1) == id as i32 && id != 0 {
            return 2;
        }
    }
    0
}

/// `rtsp://host[:port]/`; the default port stays implicit.
fn base_url(address: &str, port: u16) -> String {
    if port != DEFAULT_RTSP_PORT {
        format!("rtsp://{address}:{port}/")
    } else {
        format!("rtsp://{address}/")
    }
}

/// Find an even RTP port with RTCP on the next odd port, inside the
/// configured range or anywhere when no range is set.
fn open_port_pair(config: &SatipConfig) -> Result<(UdpSocket, UdpSocket)> {
    let (start, stop) = config.port_range();
    let rcvbuf = config.rtp_rcvbuf_size();
    let mut attempts = if start > 0 {
        (((stop.saturating_sub(start)) / 2) as usize).max(1)
    } else {
        100
    };
    let mut port = start;
    while attempts > 0 {
        attempts -= 1;
        let rtp = match udp_socket(Ipv4Addr::UNSPECIFIED, port, rcvbuf) {
            Ok(s) => s,
            Err(_) => {
                if start > 0 {
                    port += 2;
                }
                continue;
            }
        };
        let bound = rtp.local_addr()?.port();
        if bound % 2 == 0 {
            if let Ok(rtcp) = udp_socket(Ipv4Addr::UNSPECIFIED, bound + 1, 0) {
                return Ok((rtp, rtcp));
            }
        }
        if start > 0 {
            port += 2;
        }
    }
    Err(SatipError::ConfigInvalid(
        "cannot open an RTP/RTCP port pair".into(),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::server::ServerRegistry;
    use crate::tuner::buffer::TsRingBuffer;
    use crate::tuner::section::SectionFilterHub;

    fn test_tuner() -> Arc<Tuner> {
        let config = Arc::new(SatipConfig::default());
        let registry = ServerRegistry::new(Arc::clone(&config));
        let poller = Poller::new();
        let feed = TunerFeed::new(
            0,
            Arc::new(TsRingBuffer::new(188 * 64)),
            Arc::new(SectionFilterHub::new(0)),
        );
        Tuner::new(0, config, registry, poller, feed).unwrap()
    }

    #[test]
    fn pid_set_param_list_is_sorted() {
        let mut pids = PidSet::default();
        pids.add(2000);
        pids.add(160);
        pids.add(161);
        pids.add(160);
        assert_eq!(pids.to_param_list(), "160,161,2000");
        assert_eq!(pids.len(), 3);
    }

    #[tokio::test]
    async fn set_pid_keeps_pending_sets_disjoint() {
        let tuner = test_tuner();
        tuner.set_pid(160, true);
        tuner.set_pid(161, true);
        tuner.set_pid(2000, false);
        let (pids, add, del) = tuner.pid_state();
        assert_eq!(pids, "160,161");
        assert_eq!(add, "160,161");
        assert_eq!(del, "2000");

        // Toggling back cancels: the pid must leave both pending sets'
        // intersection empty and end where it started.
        tuner.set_pid(160, false);
        let (_, add, del) = tuner.pid_state();
        assert!(!add.split(',').any(|p| p == "160"));
        assert!(del.split(',').any(|p| p == "160"));
        tuner.set_pid(160, true);
        let (pids, add, del) = tuner.pid_state();
        assert!(pids.split(',').any(|p| p == "160"));
        assert!(add.split(',').any(|p| p == "160"));
        assert!(!del.split(',').any(|p| p == "160"));
        tuner.shutdown();
    }

    #[tokio::test]
    async fn illegal_idle_to_release_is_dropped() {
        let tuner = test_tuner();
        assert_eq!(tuner.state(), TunerState::Idle);
        assert!(!tuner.request_state(TunerState::Release, StateMode::Internal));
        // External requests are queued regardless.
        assert!(tuner.request_state(TunerState::Release, StateMode::External));
        tuner.shutdown();
    }

    #[tokio::test]
    async fn internal_requests_win_over_external() {
        let tuner = test_tuner();
        tuner.request_state(TunerState::Set, StateMode::External);
        tuner.request_state(TunerState::Tuned, StateMode::Internal);
        assert_eq!(tuner.advance_state(), TunerState::Tuned);
        assert_eq!(tuner.advance_state(), TunerState::Set);
        tuner.shutdown();
    }

    #[tokio::test]
    async fn force_pilot_quirk_appends_plts() {
        let tuner = test_tuner();
        let server = ServerRef {
            id: 1,
            address: "10.0.0.2".to_string(),
            port: DEFAULT_RTSP_PORT,
            src_address: None,
            description: "DIGIBIT".to_string(),
            quirks: Quirks::FORCE_PILOT,
            has_ci: false,
        };
        tuner.set_source(Some(server), 111494, "src=1&freq=11494.000&msys=dvbs2&sr=22000");
        let inner = tuner.inner.lock();
        assert!(inner.stream_param.ends_with("&plts=on"));
        drop(inner);
        tuner.shutdown();
    }

    #[test]
    fn base_url_hides_default_port() {
        assert_eq!(base_url("10.0.0.2", 554), "rtsp://10.0.0.2/");
        assert_eq!(base_url("10.0.0.2", 8554), "rtsp://10.0.0.2:8554/");
    }

    #[tokio::test]
    async fn port_pair_is_even_odd() {
        let config = SatipConfig::default();
        let (rtp, rtcp) = open_port_pair(&config).unwrap();
        let rtp_port = rtp.local_addr().unwrap().port();
        let rtcp_port = rtcp.local_addr().unwrap().port();
        assert_eq!(rtp_port % 2, 0);
        assert_eq!(rtcp_port, rtp_port + 1);
    }

    #[tokio::test]
    async fn port_pair_honours_range() {
        let config = SatipConfig::default();
        config.set_port_range(39000, 39007, 2).unwrap();
        let (rtp, _rtcp) = open_port_pair(&config).unwrap();
        let port = rtp.local_addr().unwrap().port();
        assert!((39000..=39006).contains(&port));
    }
}

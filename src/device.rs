//! Host-facing SAT>IP devices.
//!
//! A device bundles one tuner with the TS ring buffer, the section filter
//! hub and the host bookkeeping (PID reference counting, statistics,
//! diagnostics). Devices are created once at startup, fixed in count.

use std::collections::{BTreeMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use log::{info, warn};
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::channel::ChannelDescriptor;
use crate::config::{OperatingMode, SatipConfig};
use crate::error::{Result, SatipError};
use crate::params::transponder_url_params;
use crate::poller::Poller;
use crate::server::ServerRegistry;
use crate::source::Source;
use crate::tuner::buffer::{TsRingBuffer, TS_PACKET_SIZE, TS_SYNC_BYTE};
use crate::tuner::feed::{SignalStatus, TunerFeed};
use crate::tuner::section::SectionFilterHub;
use crate::tuner::{Tuner, TunerState, TUNING_TIMEOUT};

/// TS buffer capacity per device, aligned to the packet size internally.
const DEVICE_BUFFER_SIZE: usize = 1 << 20;

/// Grace period for the tuner task on shutdown.
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(3);

/// Diagnostic page selector for `info`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InfoPage {
    All,
    General,
    Pids,
    Filters,
}

impl InfoPage {
    pub fn from_number(n: usize) -> Self {
        match n {
            1 => InfoPage::General,
            2 => InfoPage::Pids,
            3 => InfoPage::Filters,
            _ => InfoPage::All,
        }
    }
}

pub struct SatipDevice {
    index: usize,
    config: Arc<SatipConfig>,
    registry: Arc<ServerRegistry>,
    buffer: Arc<TsRingBuffer>,
    sections: Arc<SectionFilterHub>,
    feed: Arc<TunerFeed>,
    tuner: Arc<Tuner>,
    task: Mutex<Option<JoinHandle<()>>>,
    /// Bytes handed out by the last `get_data`, consumed on the next call.
    bytes_delivered: AtomicUsize,
    /// PIDs requested through the bulk path (not via section filters).
    bulk_pids: Mutex<HashSet<u16>>,
    /// Packets seen per PID, counted at delivery.
    pid_stats: Mutex<BTreeMap<u16, u64>>,
    created: Instant,
}

impl SatipDevice {
    pub fn new(
        index: usize,
        config: Arc<SatipConfig>,
        registry: Arc<ServerRegistry>,
        poller: Arc<Poller>,
    ) -> Result<Arc<Self>> {
        let buffer = Arc::new(TsRingBuffer::new(DEVICE_BUFFER_SIZE));
        let sections = Arc::new(SectionFilterHub::new(index));
        let feed = TunerFeed::new(index, Arc::clone(&buffer), Arc::clone(&sections));
        let tuner = Tuner::new(
            index,
            Arc::clone(&config),
            Arc::clone(&registry),
            poller,
            Arc::clone(&feed),
        )?;
        let task = tuner.start();
        info!("Created SAT>IP device {index}");
        Ok(Arc::new(Self {
            index,
            config,
            registry,
            buffer,
            sections,
            feed,
            tuner,
            task: Mutex::new(Some(task)),
            bytes_delivered: AtomicUsize::new(0),
            bulk_pids: Mutex::new(HashSet::new()),
            pid_stats: Mutex::new(BTreeMap::new()),
            created: Instant::now(),
        }))
    }

    pub fn index(&self) -> usize {
        self.index
    }

    /// Does this device currently advertise the source to the host?
    pub fn provides_source(&self, source: Source) -> bool {
        if self.config.detached() || self.config.operating_mode() == OperatingMode::Off {
            return false;
        }
        if self.config.is_source_disabled(source) {
            return false;
        }
        self.registry.has_server_for(source)
    }

    /// Whether this device takes part in the host's EIT scanning.
    pub fn provides_eit(&self) -> bool {
        self.config.eit_scan() && !self.config.detached()
    }

    /// Capability weight announced to the host, scaled by operating mode.
    pub fn num_provided_systems(&self) -> usize {
        let count = match self.config.operating_mode() {
            OperatingMode::Low => 15,
            OperatingMode::High => 1,
            _ => self.registry.num_provided_systems(),
        };
        count.clamp(1, 15)
    }

    /// Tune to a channel. Waits up to the tuning timeout for the session
    /// to be established (`Tuned`, not `Locked`).
    pub async fn tune(&self, channel: &ChannelDescriptor) -> Result<()> {
        let src = self.config.source_number(channel.source);
        let params = transponder_url_params(channel, src).ok_or_else(|| {
            SatipError::ConfigInvalid(format!(
                "unrecognized channel parameters for source {}",
                channel.source
            ))
        })?;
        let transponder = channel.transponder();
        let server = self
            .registry
            .assign(self.index, channel.source, channel.system, transponder)
            .ok_or(SatipError::NoServerAvailable)?;
        info!(
            "Tuning to {} via '{}' [device {}]",
            params, server.description, self.index
        );

        self.feed.set_tuned_channel(channel.clone());
        let mut state_rx = self.tuner.subscribe_state();
        self.tuner.set_source(Some(server), transponder, &params);

        let deadline = Instant::now() + TUNING_TIMEOUT;
        loop {
            if *state_rx.borrow_and_update() >= TunerState::Tuned {
                return Ok(());
            }
            if self.tuner.gave_up() {
                return Err(SatipError::NoServerAvailable);
            }
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(if self.tuner.gave_up() {
                    SatipError::NoServerAvailable
                } else {
                    SatipError::TuningTimeout
                });
            }
            if tokio::time::timeout(remaining, state_rx.changed())
                .await
                .is_err()
            {
                continue;
            }
        }
    }

    /// Drop the source; the tuner releases its session when idle.
    pub fn clear_source(&self) {
        self.tuner.set_source(None, 0, "");
    }

    /// Enable or disable one PID on the bulk TS path.
    pub fn set_pid(&self, pid: u16, on: bool) {
        if pid > 0x1FFF {
            return;
        }
        let mut bulk = self.bulk_pids.lock();
        if on {
            bulk.insert(pid);
            self.tuner.set_pid(pid, true);
        } else {
            bulk.remove(&pid);
            // Keep the PID alive while a section filter still wants it.
            if !self.sections.uses_pid(pid) {
                self.tuner.set_pid(pid, false);
            }
        }
    }

    /// Open a section filter; the PID is enabled alongside.
    pub fn open_filter(
        &self,
        pid: u16,
        tid: u8,
        mask: u8,
    ) -> Option<(usize, mpsc::UnboundedReceiver<Vec<u8>>)> {
        if self.config.is_filter_disabled(pid as usize) {
            return None;
        }
        let opened = self.sections.open(pid, tid, mask)?;
        self.tuner.set_pid(pid, true);
        Some(opened)
    }

    /// Close a section filter; the PID stays while other users remain.
    pub fn close_filter(&self, handle: usize) {
        if let Some(pid) = self.sections.close(handle) {
            if !self.sections.uses_pid(pid) && !self.bulk_pids.lock().contains(&pid) {
                self.tuner.set_pid(pid, false);
            }
        }
    }

    /// Open the host data path.
    pub fn open_dvr(&self) {
        self.bytes_delivered.store(0, Ordering::Relaxed);
        self.buffer.clear();
        self.feed.set_dvr_open(true);
    }

    pub fn close_dvr(&self) {
        self.feed.set_dvr_open(false);
        self.tuner.on_dvr_closed();
    }

    /// A contiguous run of TS packets from the ring buffer, starting at a
    /// sync byte, length a multiple of the packet size. Returns `None`
    /// when no full packet is buffered or after a silent re-sync.
    pub fn get_data(&self, check_min: bool) -> Option<&[u8]> {
        if !self.feed.is_dvr_open() {
            return None;
        }
        let delivered = self.bytes_delivered.swap(0, Ordering::Relaxed);
        if delivered > 0 {
            self.buffer.consume(delivered);
        }
        if check_min && self.buffer.available() < TS_PACKET_SIZE {
            return None;
        }
        let run = self.buffer.read(usize::MAX);
        if run.len() < TS_PACKET_SIZE {
            return None;
        }
        if run[0] != TS_SYNC_BYTE {
            let skip = run
                .iter()
                .position(|&b| b == TS_SYNC_BYTE)
                .unwrap_or(run.len());
            self.buffer.consume(skip);
            info!("Skipped {skip} bytes to sync on TS packet [device {}]", self.index);
            return None;
        }
        let len = run.len() - run.len() % TS_PACKET_SIZE;
        let run = &run[..len];
        self.bytes_delivered.store(len, Ordering::Relaxed);
        {
            let mut stats = self.pid_stats.lock();
            for packet in run.chunks_exact(TS_PACKET_SIZE) {
                let pid = ((packet[1] as u16 & 0x1F) << 8) | packet[2] as u16;
                *stats.entry(pid).or_insert(0) += 1;
            }
        }
        Some(run)
    }

    /// Tell the device how much of the last run was actually consumed.
    pub fn skip_data(&self, count: usize) {
        self.bytes_delivered.store(count, Ordering::Relaxed);
    }

    pub fn signal_stats(&self) -> SignalStatus {
        let mut signal = self.feed.signal();
        signal.has_lock = self.tuner.has_lock();
        signal
    }

    pub fn tuned_channel(&self) -> ChannelDescriptor {
        self.feed.tuned_channel()
    }

    /// Diagnostic page for the INFO command.
    pub async fn info(&self, page: InfoPage) -> String {
        match page {
            InfoPage::General => self.general_info().await,
            InfoPage::Pids => self.pids_info(),
            InfoPage::Filters => format!("Active section filters:\n{}", self.sections.information()),
            InfoPage::All => format!(
                "{}{}Active section filters:\n{}",
                self.general_info().await,
                self.pids_info(),
                self.sections.information()
            ),
        }
    }

    async fn general_info(&self) -> String {
        let signal = self.signal_stats();
        let stream = self.tuner.information().await;
        let amount = self.feed.bytes_received();
        let traffic = if self.config.use_bytes() {
            format!("{amount} bytes")
        } else {
            format!("{} bits", amount * 8)
        };
        format!(
            "SAT>IP device: {}\nStream: {stream}\nSignal: lock={} strength={} quality={} frontend={}\nTraffic: {traffic}\nBuffer: {} bytes used, {} dropped\n{}\n",
            self.index,
            signal.has_lock,
            signal.strength,
            signal.quality,
            signal.frontend_id,
            self.buffer.available(),
            self.buffer.overflow_bytes(),
            self.tuner.statistic()
        )
    }

    fn pids_info(&self) -> String {
        let (pids, add, del) = self.tuner.pid_state();
        let stats = self.pid_stats.lock();
        let mut s = format!("Pids: [{pids}] add=[{add}] del=[{del}]\n");
        for (pid, count) in stats.iter() {
            s.push_str(&format!("  pid {pid:4}: {count} packets\n"));
        }
        s
    }

    /// One STAT line.
    pub fn status_line(&self) -> String {
        let signal = self.signal_stats();
        if signal.has_lock {
            format!(
                "Device {}: HasLock: yes Strength: {} Quality: {}\n",
                self.index, signal.strength, signal.quality
            )
        } else {
            format!("Device {}: HasLock: no\n", self.index)
        }
    }

    /// True once discovery had a chance to find servers.
    pub fn ready(&self) -> bool {
        self.registry.count() > 0 || self.created.elapsed() > Duration::from_secs(10)
    }

    pub async fn shutdown(&self) {
        self.close_dvr();
        self.sections.close_all();
        self.tuner.shutdown();
        let task = self.task.lock().take();
        if let Some(task) = task {
            if tokio::time::timeout(SHUTDOWN_TIMEOUT, task).await.is_err() {
                warn!("Tuner task did not stop in time [device {}]", self.index);
            }
        }
    }
}

/// The fixed set of devices created at startup.
pub struct DeviceSet {
    devices: Vec<Arc<SatipDevice>>,
}

impl DeviceSet {
    pub fn new(
        count: usize,
        config: Arc<SatipConfig>,
        registry: Arc<ServerRegistry>,
        poller: Arc<Poller>,
    ) -> Result<Self> {
        let mut devices = Vec::with_capacity(count);
        for index in 0..count {
            devices.push(SatipDevice::new(
                index,
                Arc::clone(&config),
                Arc::clone(&registry),
                Arc::clone(&poller),
            )?);
        }
        Ok(Self { devices })
    }

    pub fn get(&self, index: usize) -> Option<&Arc<SatipDevice>> {
        self.devices.get(index)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<SatipDevice>> {
        self.devices.iter()
    }

    pub fn count(&self) -> usize {
        self.devices.len()
    }

    pub fn status(&self) -> String {
        self.devices.iter().map(|d| d.status_line()).collect()
    }

    pub async fn shutdown(&self) {
        for device in &self.devices {
            device.shutdown().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DEFAULT_RTSP_PORT;

    fn device() -> Arc<SatipDevice> {
        let config = Arc::new(SatipConfig::default());
        let registry = ServerRegistry::new(Arc::clone(&config));
        let poller = Poller::new();
        SatipDevice::new(0, config, registry, poller).unwrap()
    }

    #[tokio::test]
    async fn get_data_returns_aligned_runs() {
        let device = device();
        device.open_dvr();
        device.feed.write_ts(&[0x47; 188 * 3]);
        // A partial trailing packet must be held back.
        device.feed.write_ts(&[0x47; 100]);

        let run = device.get_data(true).unwrap();
        assert_eq!(run[0], TS_SYNC_BYTE);
        assert_eq!(run.len() % TS_PACKET_SIZE, 0);
        assert_eq!(run.len(), 188 * 3);
        device.shutdown().await;
    }

    #[tokio::test]
    async fn get_data_resyncs_on_garbage() {
        let device = device();
        device.open_dvr();
        let mut data = vec![0xAAu8; 10];
        data.extend_from_slice(&[0x47; 188]);
        device.feed.write_ts(&data);

        // First call skips the garbage and reports nothing.
        assert!(device.get_data(false).is_none());
        let run = device.get_data(false).unwrap();
        assert_eq!(run[0], TS_SYNC_BYTE);
        assert_eq!(run.len(), 188);
        device.shutdown().await;
    }

    #[tokio::test]
    async fn skip_data_consumes_partially() {
        let device = device();
        device.open_dvr();
        device.feed.write_ts(&[0x47; 188 * 4]);

        let run = device.get_data(false).unwrap();
        assert_eq!(run.len(), 188 * 4);
        device.skip_data(188);
        let run = device.get_data(false).unwrap();
        assert_eq!(run.len(), 188 * 3);
        device.shutdown().await;
    }

    #[tokio::test]
    async fn closed_dvr_returns_no_data() {
        let device = device();
        device.feed.write_ts(&[0x47; 188]);
        assert!(device.get_data(false).is_none());
        device.shutdown().await;
    }

    #[tokio::test]
    async fn filter_pid_refcounting() {
        let device = device();
        let (a, _rx_a) = device.open_filter(0x12, 0x4E, 0xFF).unwrap();
        assert!(device.tuner.has_pid(0x12));

        // Bulk path also wants the PID; closing the filter must keep it.
        device.set_pid(0x12, true);
        device.close_filter(a);
        assert!(device.tuner.has_pid(0x12));

        device.set_pid(0x12, false);
        assert!(!device.tuner.has_pid(0x12));
        device.shutdown().await;
    }

    #[tokio::test]
    async fn tune_without_servers_fails_fast() {
        let device = device();
        let mut channel = ChannelDescriptor::default();
        channel.source = Source::parse("S19.2E").unwrap();
        channel.frequency = 11494;
        channel.system = 1;
        channel.symbol_rate = 22000;
        match device.tune(&channel).await {
            Err(SatipError::NoServerAvailable) => {}
            other => panic!("expected NoServerAvailable, got {other:?}"),
        }
        device.shutdown().await;
    }

    #[tokio::test]
    async fn provides_source_honours_config() {
        let config = Arc::new(SatipConfig::default());
        let registry = ServerRegistry::new(Arc::clone(&config));
        let poller = Poller::new();
        let device =
            SatipDevice::new(0, Arc::clone(&config), Arc::clone(&registry), poller).unwrap();
        let source = Source::parse("S19.2E").unwrap();

        assert!(!device.provides_source(source), "no server yet");
        registry.add_server(
            None,
            "10.0.0.2".to_string(),
            DEFAULT_RTSP_PORT,
            "DVBS2-2".to_string(),
            Vec::new(),
            "minisatip".to_string(),
            0,
            false,
        );
        assert!(device.provides_source(source));

        config.set_detached(true);
        assert!(!device.provides_source(source));
        config.set_detached(false);
        config.set_disabled_sources(vec![source]);
        assert!(!device.provides_source(source));
        device.shutdown().await;
    }
}

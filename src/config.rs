//! Runtime configuration shared across the client.
//!
//! All fields are individually writable at runtime (the command channel
//! mutates them while tuners are streaming), so everything lives behind
//! atomics or short parking_lot guards on one shared handle.

use std::str::FromStr;
use std::sync::atomic::{AtomicBool, AtomicU16, AtomicU32, AtomicU8, AtomicUsize, Ordering};

use parking_lot::RwLock;

use crate::error::SatipError;
use crate::source::Source;

/// Default RTSP port of a SAT>IP server.
pub const DEFAULT_RTSP_PORT: u16 = 554;

/// Debug trace categories, OR-able into the trace bitmask.
pub mod trace {
    pub const TUNER_STATE: u32 = 1 << 0;
    pub const RTSP: u32 = 1 << 1;
    pub const RTP: u32 = 1 << 2;
    pub const RTCP: u32 = 1 << 3;
    pub const SECTION: u32 = 1 << 4;
    pub const CHANNEL: u32 = 1 << 5;
    pub const PIDS: u32 = 1 << 6;
    pub const DISCOVERY: u32 = 1 << 7;
    pub const CI: u32 = 1 << 8;
    pub const MASK: u32 = 0x1FF;
}

/// How eagerly the devices advertise themselves to the host.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum OperatingMode {
    Off = 0,
    Low = 1,
    Normal = 2,
    High = 3,
}

impl OperatingMode {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => OperatingMode::Off,
            1 => OperatingMode::Low,
            3 => OperatingMode::High,
            _ => OperatingMode::Normal,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            OperatingMode::Off => "off",
            OperatingMode::Low => "low",
            OperatingMode::Normal => "normal",
            OperatingMode::High => "high",
        }
    }
}

impl FromStr for OperatingMode {
    type Err = SatipError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "off" => Ok(OperatingMode::Off),
            "low" => Ok(OperatingMode::Low),
            "normal" => Ok(OperatingMode::Normal),
            "high" => Ok(OperatingMode::High),
            other => Err(SatipError::ConfigInvalid(format!(
                "unknown operating mode '{other}'"
            ))),
        }
    }
}

/// Requested RTP transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum TransportMode {
    Unicast = 0,
    Multicast = 1,
    RtpOverTcp = 2,
}

impl TransportMode {
    fn from_u8(v: u8) -> Self {
        match v {
            1 => TransportMode::Multicast,
            2 => TransportMode::RtpOverTcp,
            _ => TransportMode::Unicast,
        }
    }
}

impl FromStr for TransportMode {
    type Err = SatipError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "unicast" => Ok(TransportMode::Unicast),
            "multicast" => Ok(TransportMode::Multicast),
            "rtptcp" | "rtp-over-tcp" | "tcp" => Ok(TransportMode::RtpOverTcp),
            other => Err(SatipError::ConfigInvalid(format!(
                "unknown transport mode '{other}'"
            ))),
        }
    }
}

/// A server pinned by configuration instead of discovery. Never expires.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StaticServer {
    pub src_address: Option<String>,
    pub address: String,
    pub port: u16,
    pub model: String,
    pub filters: Vec<Source>,
    pub description: String,
    pub quirks: u32,
}

impl StaticServer {
    /// Parse a `[src@]ip[:port]|model[:filter]|desc[:quirkHex]` entry.
    pub fn parse(entry: &str) -> Result<StaticServer, SatipError> {
        let mut parts = entry.trim().splitn(3, '|');
        let addr_part = parts
            .next()
            .filter(|s| !s.is_empty())
            .ok_or_else(|| SatipError::ConfigInvalid(format!("server entry '{entry}'")))?;
        let model_part = parts
            .next()
            .filter(|s| !s.is_empty())
            .ok_or_else(|| SatipError::ConfigInvalid(format!("server entry '{entry}' lacks model")))?;
        let desc_part = parts
            .next()
            .filter(|s| !s.is_empty())
            .ok_or_else(|| SatipError::ConfigInvalid(format!("server entry '{entry}' lacks description")))?;

        let (src_address, addr) = match addr_part.split_once('@') {
            Some((src, rest)) => (Some(src.to_string()), rest),
            None => (None, addr_part),
        };
        let (address, port) = match addr.split_once(':') {
            Some((a, p)) => (
                a.to_string(),
                p.parse::<u16>()
                    .map_err(|_| SatipError::ConfigInvalid(format!("bad port in '{entry}'")))?,
            ),
            None => (addr.to_string(), DEFAULT_RTSP_PORT),
        };
        let (model, filters) = match model_part.split_once(':') {
            Some((m, f)) => (
                m.to_string(),
                f.split(',').filter_map(Source::parse).collect(),
            ),
            None => (model_part.to_string(), Vec::new()),
        };
        let (description, quirks) = match desc_part.rsplit_once(':') {
            Some((d, q)) => {
                let q = q.trim_start_matches("0x");
                (
                    d.to_string(),
                    u32::from_str_radix(q, 16)
                        .map_err(|_| SatipError::ConfigInvalid(format!("bad quirk hex in '{entry}'")))?,
                )
            }
            None => (desc_part.to_string(), 0),
        };
        Ok(StaticServer {
            src_address,
            address,
            port,
            model,
            filters,
            description,
            quirks,
        })
    }

    /// Parse a `;`-separated list of server entries.
    pub fn parse_list(arg: &str) -> Result<Vec<StaticServer>, SatipError> {
        arg.split(';')
            .filter(|s| !s.trim().is_empty())
            .map(StaticServer::parse)
            .collect()
    }
}

/// Shared mutable configuration.
pub struct SatipConfig {
    operating_mode: AtomicU8,
    transport_mode: AtomicU8,
    ci_extension: AtomicBool,
    frontend_reuse: AtomicBool,
    eit_scan: AtomicBool,
    /// Statistics rendered in bytes instead of bits (MODE verb).
    use_bytes: AtomicBool,
    detached: AtomicBool,
    disable_quirks: AtomicBool,
    single_model_servers: AtomicBool,
    cicams: RwLock<[i32; 2]>,
    disabled_sources: RwLock<Vec<Source>>,
    disabled_filters: RwLock<Vec<usize>>,
    port_range_start: AtomicU16,
    port_range_stop: AtomicU16,
    rtp_rcvbuf_size: AtomicUsize,
    trace_mask: AtomicU32,
    /// Satellite position table; `src=n` refers to the n-th entry.
    sources: RwLock<Vec<Source>>,
}

impl Default for SatipConfig {
    fn default() -> Self {
        Self {
            operating_mode: AtomicU8::new(OperatingMode::Normal as u8),
            transport_mode: AtomicU8::new(TransportMode::Unicast as u8),
            ci_extension: AtomicBool::new(false),
            frontend_reuse: AtomicBool::new(true),
            eit_scan: AtomicBool::new(true),
            use_bytes: AtomicBool::new(false),
            detached: AtomicBool::new(false),
            disable_quirks: AtomicBool::new(false),
            single_model_servers: AtomicBool::new(false),
            cicams: RwLock::new([0; 2]),
            disabled_sources: RwLock::new(Vec::new()),
            disabled_filters: RwLock::new(Vec::new()),
            port_range_start: AtomicU16::new(0),
            port_range_stop: AtomicU16::new(0),
            rtp_rcvbuf_size: AtomicUsize::new(0),
            trace_mask: AtomicU32::new(0),
            sources: RwLock::new(Vec::new()),
        }
    }
}

impl SatipConfig {
    pub fn operating_mode(&self) -> OperatingMode {
        OperatingMode::from_u8(self.operating_mode.load(Ordering::Relaxed))
    }

    pub fn set_operating_mode(&self, mode: OperatingMode) {
        self.operating_mode.store(mode as u8, Ordering::Relaxed);
    }

    pub fn transport_mode(&self) -> TransportMode {
        TransportMode::from_u8(self.transport_mode.load(Ordering::Relaxed))
    }

    pub fn set_transport_mode(&self, mode: TransportMode) {
        self.transport_mode.store(mode as u8, Ordering::Relaxed);
    }

    pub fn ci_extension(&self) -> bool {
        self.ci_extension.load(Ordering::Relaxed)
    }

    pub fn set_ci_extension(&self, on: bool) {
        self.ci_extension.store(on, Ordering::Relaxed);
    }

    pub fn frontend_reuse(&self) -> bool {
        self.frontend_reuse.load(Ordering::Relaxed)
    }

    pub fn set_frontend_reuse(&self, on: bool) {
        self.frontend_reuse.store(on, Ordering::Relaxed);
    }

    pub fn eit_scan(&self) -> bool {
        self.eit_scan.load(Ordering::Relaxed)
    }

    pub fn set_eit_scan(&self, on: bool) {
        self.eit_scan.store(on, Ordering::Relaxed);
    }

    pub fn use_bytes(&self) -> bool {
        self.use_bytes.load(Ordering::Relaxed)
    }

    pub fn set_use_bytes(&self, on: bool) {
        self.use_bytes.store(on, Ordering::Relaxed);
    }

    pub fn detached(&self) -> bool {
        self.detached.load(Ordering::Relaxed)
    }

    pub fn set_detached(&self, on: bool) {
        self.detached.store(on, Ordering::Relaxed);
    }

    pub fn disable_quirks(&self) -> bool {
        self.disable_quirks.load(Ordering::Relaxed)
    }

    pub fn set_disable_quirks(&self, on: bool) {
        self.disable_quirks.store(on, Ordering::Relaxed);
    }

    pub fn single_model_servers(&self) -> bool {
        self.single_model_servers.load(Ordering::Relaxed)
    }

    pub fn set_single_model_servers(&self, on: bool) {
        self.single_model_servers.store(on, Ordering::Relaxed);
    }

    pub fn cicam(&self, slot: usize) -> i32 {
        self.cicams.read().get(slot).copied().unwrap_or(0)
    }

    pub fn set_cicam(&self, slot: usize, ca_system: i32) {
        if let Some(c) = self.cicams.write().get_mut(slot) {
            *c = ca_system;
        }
    }

    pub fn is_source_disabled(&self, source: Source) -> bool {
        self.disabled_sources.read().contains(&source)
    }

    pub fn set_disabled_sources(&self, sources: Vec<Source>) {
        *self.disabled_sources.write() = sources;
    }

    pub fn is_filter_disabled(&self, index: usize) -> bool {
        self.disabled_filters.read().contains(&index)
    }

    pub fn set_disabled_filters(&self, filters: Vec<usize>) {
        *self.disabled_filters.write() = filters;
    }

    pub fn port_range(&self) -> (u16, u16) {
        (
            self.port_range_start.load(Ordering::Relaxed),
            self.port_range_stop.load(Ordering::Relaxed),
        )
    }

    /// Set the RT[C]P client port range. The start must be even and the
    /// span must fit two ports per device.
    pub fn set_port_range(&self, start: u16, stop: u16, devices: usize) -> Result<(), SatipError> {
        if start % 2 != 0 {
            return Err(SatipError::ConfigInvalid(
                "port range start must be even".into(),
            ));
        }
        if stop < start || ((stop - start + 1) as usize) < devices * 2 {
            return Err(SatipError::ConfigInvalid(format!(
                "port range {}-{} too small for {} devices",
                start, stop, devices
            )));
        }
        self.port_range_start.store(start, Ordering::Relaxed);
        self.port_range_stop.store(stop, Ordering::Relaxed);
        Ok(())
    }

    pub fn rtp_rcvbuf_size(&self) -> usize {
        self.rtp_rcvbuf_size.load(Ordering::Relaxed)
    }

    pub fn set_rtp_rcvbuf_size(&self, bytes: usize) {
        self.rtp_rcvbuf_size.store(bytes, Ordering::Relaxed);
    }

    pub fn trace_mask(&self) -> u32 {
        self.trace_mask.load(Ordering::Relaxed)
    }

    pub fn set_trace_mask(&self, mask: u32) {
        self.trace_mask.store(mask & trace::MASK, Ordering::Relaxed);
    }

    /// Check one trace category.
    pub fn traces(&self, category: u32) -> bool {
        self.trace_mask.load(Ordering::Relaxed) & category != 0
    }

    pub fn set_sources(&self, sources: Vec<Source>) {
        *self.sources.write() = sources;
    }

    /// 1-based signal-source number for a satellite position, as carried in
    /// the `src=` query parameter. Unknown positions use source 1.
    pub fn source_number(&self, source: Source) -> i32 {
        self.sources
            .read()
            .iter()
            .position(|s| *s == source)
            .map(|i| i as i32 + 1)
            .unwrap_or(1)
    }

    /// Reverse lookup for the `src=` value of an RTCP reception report.
    /// Returns `None` when the number maps to no configured position, in
    /// which case the host's channel source is left untouched.
    pub fn source_for_number(&self, src: i32) -> Option<Source> {
        if src < 1 {
            return None;
        }
        self.sources.read().get(src as usize - 1).copied()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_full_server_entry() {
        let s = StaticServer::parse("127.0.0.1@192.168.1.10:8554|DVBS2-4:S19.2E|OctopusNet:10")
            .unwrap();
        assert_eq!(s.src_address.as_deref(), Some("127.0.0.1"));
        assert_eq!(s.address, "192.168.1.10");
        assert_eq!(s.port, 8554);
        assert_eq!(s.model, "DVBS2-4");
        assert_eq!(s.filters, vec![Source::parse("S19.2E").unwrap()]);
        assert_eq!(s.description, "OctopusNet");
        assert_eq!(s.quirks, 0x10);
    }

    #[test]
    fn parse_minimal_server_entry() {
        let s = StaticServer::parse("10.0.0.2|DVBT-2|minisatip").unwrap();
        assert_eq!(s.port, DEFAULT_RTSP_PORT);
        assert!(s.filters.is_empty());
        assert_eq!(s.quirks, 0);
    }

    #[test]
    fn parse_server_list() {
        let list = StaticServer::parse_list("10.0.0.2|DVBT-2|a;10.0.0.3|DVBS2-1|b").unwrap();
        assert_eq!(list.len(), 2);
        assert!(StaticServer::parse_list("10.0.0.2|DVBT-2").is_err());
    }

    #[test]
    fn port_range_validation() {
        let cfg = SatipConfig::default();
        assert!(cfg.set_port_range(9001, 9010, 2).is_err());
        assert!(cfg.set_port_range(9000, 9002, 2).is_err());
        assert!(cfg.set_port_range(9000, 9007, 2).is_ok());
        assert_eq!(cfg.port_range(), (9000, 9007));
    }

    #[test]
    fn source_numbering() {
        let cfg = SatipConfig::default();
        cfg.set_sources(vec![
            Source::parse("S19.2E").unwrap(),
            Source::parse("S13E").unwrap(),
        ]);
        assert_eq!(cfg.source_number(Source::parse("S13E").unwrap()), 2);
        assert_eq!(cfg.source_number(Source::parse("S28.2E").unwrap()), 1);
        assert_eq!(
            cfg.source_for_number(2),
            Some(Source::parse("S13E").unwrap())
        );
        assert_eq!(cfg.source_for_number(5), None);
    }
}

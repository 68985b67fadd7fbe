//! SAT>IP server registry: known servers, their frontend pools, quirk
//! handling and frontend assignment.

use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use log::{debug, info};
use parking_lot::Mutex;

use crate::config::{SatipConfig, StaticServer, DEFAULT_RTSP_PORT};
use crate::source::Source;

/// Known non-standard server behaviours, OR-able.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Quirks(pub u32);

impl Quirks {
    /// Session id carries leading zeros that must be stripped.
    pub const SESSION_ID: Quirks = Quirks(0x01);
    /// Needs the full `pids=` list on every PLAY.
    pub const PLAY_PIDS: Quirks = Quirks(0x02);
    /// Never reports lock; treat as locked.
    pub const FORCE_LOCK: Quirks = Quirks(0x04);
    /// Supports interleaved RTP/AVP/TCP.
    pub const RTP_OVER_TCP: Quirks = Quirks(0x08);
    /// CI control via `x_pmt=`/`x_ci=`.
    pub const CI_XPMT: Quirks = Quirks(0x10);
    /// CI control via `tnr=`.
    pub const CI_TNR: Quirks = Quirks(0x20);
    /// Needs explicit `plts=on` for DVB-S2.
    pub const FORCE_PILOT: Quirks = Quirks(0x40);
    /// Needs TEARDOWN before each new PLAY.
    pub const TEAR_AND_PLAY: Quirks = Quirks(0x80);

    const MASK: u32 = 0xFF;

    pub fn has(&self, quirk: Quirks) -> bool {
        self.0 & quirk.0 != 0
    }

    pub fn insert(&mut self, quirk: Quirks) {
        self.0 |= quirk.0 & Self::MASK;
    }

    /// Quirks inferred from well-known description substrings.
    fn detect(description: &str) -> Quirks {
        let mut quirks = Quirks::default();
        let has = |needle: &str| description.contains(needle);

        // Session id bug
        if has("GSSBOX") || has("DIGIBIT") || has("Multibox-") || has("Triax SatIP Converter") {
            quirks.insert(Quirks::SESSION_ID);
        }
        // RTP over TCP support
        if has("minisatip") || has("DVBViewer") {
            quirks.insert(Quirks::RTP_OVER_TCP);
        }
        // addpids/delpids bug
        if has("FRITZ!WLAN Repeater DVB-C") || has("fritzdvbc") {
            quirks.insert(Quirks::PLAY_PIDS);
        }
        // frontend locking bug
        if has("FRITZ!WLAN Repeater DVB-C") || has("fritzdvbc") || has("Schwaiger Sat>IP Server") {
            quirks.insert(Quirks::FORCE_LOCK);
        }
        // X_PMT protocol extension
        if has("OctopusNet") || has("minisatip") {
            quirks.insert(Quirks::CI_XPMT);
        }
        // TNR protocol extension
        if has("DVBViewer") {
            quirks.insert(Quirks::CI_TNR);
        }
        // no auto-detection of pilot tones
        if has("GSSBOX")
            || has("DIGIBIT")
            || has("Multibox-")
            || has("Triax SatIP Converter")
            || has("KATHREIN SatIP Server")
        {
            quirks.insert(Quirks::FORCE_PILOT);
        }
        // TEARDOWN required before a new PLAY
        if has("FRITZ!WLAN Repeater DVB-C") || has("fritzdvbc") {
            quirks.insert(Quirks::TEAR_AND_PLAY);
        }
        quirks
    }

    /// External CI support inferred from the description.
    fn detect_ci(description: &str) -> bool {
        description.contains("OctopusNet")
            || description.contains("minisatip")
            || description.contains("DVBViewer")
    }
}

impl fmt::Display for Quirks {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        const NAMES: [(Quirks, &str); 8] = [
            (Quirks::SESSION_ID, "SessionId"),
            (Quirks::PLAY_PIDS, "PlayPids"),
            (Quirks::FORCE_LOCK, "ForceLock"),
            (Quirks::RTP_OVER_TCP, "RtpOverTcp"),
            (Quirks::CI_XPMT, "CiXpmt"),
            (Quirks::CI_TNR, "CiTnr"),
            (Quirks::FORCE_PILOT, "ForcePilot"),
            (Quirks::TEAR_AND_PLAY, "TearAndPlay"),
        ];
        let mut first = true;
        for (quirk, name) in NAMES {
            if self.has(quirk) {
                if !first {
                    write!(f, ",")?;
                }
                write!(f, "{name}")?;
                first = false;
            }
        }
        if first {
            write!(f, "none")?;
        }
        Ok(())
    }
}

/// Delivery-system pools a server can expose.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DelSys {
    DvbS2 = 0,
    DvbT = 1,
    DvbT2 = 2,
    DvbC = 3,
    DvbC2 = 4,
    Atsc = 5,
}

const DELSYS_COUNT: usize = 6;

/// One independently tunable frontend on a server.
#[derive(Debug, Clone)]
struct Frontend {
    index: u32,
    description: &'static str,
    device_id: Option<usize>,
    transponder: i32,
}

impl Frontend {
    fn attached(&self) -> bool {
        self.device_id.is_some()
    }
}

#[derive(Debug, Clone, Default)]
struct FrontendPool(Vec<Frontend>);

impl FrontendPool {
    fn add(&mut self, count: u32, description: &'static str) {
        for i in 1..=count {
            self.0.push(Frontend {
                index: i,
                description,
                device_id: None,
                transponder: 0,
            });
        }
    }

    fn matches(&self, device_id: usize, transponder: i32) -> bool {
        self.0
            .iter()
            .any(|f| f.attached() && f.device_id == Some(device_id) && f.transponder == transponder)
    }

    /// Reserve a frontend for the transponder. Prefers an unused frontend,
    /// then an existing attachment of the same device.
    fn assign(&mut self, device_id: usize, transponder: i32) -> bool {
        if let Some(f) = self
            .0
            .iter_mut()
            .find(|f| !f.attached() || f.device_id == Some(device_id))
        {
            f.transponder = transponder;
            return true;
        }
        false
    }

    fn attach(&mut self, device_id: usize, transponder: i32) -> bool {
        // Among frontends reserved for this transponder, prefer one that is
        // free or already ours; never steal another device's frontend.
        if let Some(f) = self.0.iter_mut().find(|f| {
            f.transponder == transponder && (!f.attached() || f.device_id == Some(device_id))
        }) {
            f.device_id = Some(device_id);
            debug!("Attached device {device_id} to {}/#{}", f.description, f.index);
            return true;
        }
        false
    }

    fn detach(&mut self, device_id: usize, transponder: i32) -> bool {
        if let Some(f) = self
            .0
            .iter_mut()
            .find(|f| f.transponder == transponder && f.device_id == Some(device_id))
        {
            f.device_id = None;
            f.transponder = 0;
            debug!("Detached device {device_id} from {}/#{}", f.description, f.index);
            return true;
        }
        false
    }

    fn len(&self) -> usize {
        self.0.len()
    }
}

/// One known SAT>IP server.
#[derive(Debug)]
pub struct Server {
    id: u64,
    src_address: Option<String>,
    address: String,
    port: u16,
    model: String,
    filters: Vec<Source>,
    description: String,
    quirks: Quirks,
    has_ci: bool,
    active: bool,
    static_entry: bool,
    created: Instant,
    last_seen: Instant,
    frontends: [FrontendPool; DELSYS_COUNT],
}

impl Server {
    fn new(
        id: u64,
        src_address: Option<String>,
        address: String,
        port: u16,
        model: String,
        filters: Vec<Source>,
        description: String,
        extra_quirks: u32,
        disable_quirks: bool,
        static_entry: bool,
    ) -> Self {
        let mut quirks = Quirks(extra_quirks & Quirks::MASK);
        if !disable_quirks {
            quirks.0 |= Quirks::detect(&description).0;
        }
        let has_ci = Quirks::detect_ci(&description);

        let mut frontends: [FrontendPool; DELSYS_COUNT] = Default::default();
        for token in model.split(',') {
            let token = token.trim();
            let (pool, description, skip) = if let Some(n) = token.strip_prefix("DVBS2-") {
                (DelSys::DvbS2, "DVB-S2", n)
            } else if let Some(n) = token.strip_prefix("DVBT2-") {
                (DelSys::DvbT2, "DVB-T2", n)
            } else if let Some(n) = token.strip_prefix("DVBT-") {
                (DelSys::DvbT, "DVB-T", n)
            } else if let Some(n) = token.strip_prefix("DVBC2-") {
                (DelSys::DvbC2, "DVB-C2", n)
            } else if let Some(n) = token.strip_prefix("DVBC-") {
                (DelSys::DvbC, "DVB-C", n)
            } else if let Some(n) = token.strip_prefix("ATSC-") {
                (DelSys::Atsc, "ATSC", n)
            } else {
                continue;
            };
            let count: u32 = skip.parse().unwrap_or(0);
            frontends[pool as usize].add(count, description);
        }

        let now = Instant::now();
        Self {
            id,
            src_address,
            address,
            port,
            model,
            filters,
            description,
            quirks,
            has_ci,
            active: true,
            static_entry,
            created: now,
            last_seen: now,
            frontends,
        }
    }

    fn identity_matches(&self, address: &str, model: &str, description: &str) -> bool {
        self.address.eq_ignore_ascii_case(address)
            && self.model.eq_ignore_ascii_case(model)
            && self.description.eq_ignore_ascii_case(description)
    }

    /// A server restricted by source filters only serves listed positions.
    fn is_valid_source(&self, source: Source) -> bool {
        self.filters.is_empty() || self.filters.contains(&source)
    }

    /// Can this server serve the source class at all?
    fn matches_source(&self, source: Source) -> bool {
        if !self.is_valid_source(source) {
            return false;
        }
        match source.class() {
            'S' => self.frontends[DelSys::DvbS2 as usize].len() > 0,
            'T' => {
                self.frontends[DelSys::DvbT as usize].len() > 0
                    || self.frontends[DelSys::DvbT2 as usize].len() > 0
            }
            'C' => {
                self.frontends[DelSys::DvbC as usize].len() > 0
                    || self.frontends[DelSys::DvbC2 as usize].len() > 0
            }
            'A' => self.frontends[DelSys::Atsc as usize].len() > 0,
            _ => false,
        }
    }

    fn pools_for(&self, source: Source, system: i32) -> &'static [DelSys] {
        match (source.class(), system != 0) {
            ('S', _) => &[DelSys::DvbS2],
            ('T', true) => &[DelSys::DvbT2],
            ('T', false) => &[DelSys::DvbT, DelSys::DvbT2],
            ('C', true) => &[DelSys::DvbC2],
            ('C', false) => &[DelSys::DvbC, DelSys::DvbC2],
            ('A', _) => &[DelSys::Atsc],
            _ => &[],
        }
    }

    fn matches(&self, device_id: usize, source: Source, system: i32, transponder: i32) -> bool {
        if !self.is_valid_source(source) {
            return false;
        }
        self.pools_for(source, system)
            .iter()
            .any(|p| self.frontends[*p as usize].matches(device_id, transponder))
    }

    fn assign(&mut self, device_id: usize, source: Source, system: i32, transponder: i32) -> bool {
        if !self.is_valid_source(source) {
            return false;
        }
        for pool in self.pools_for(source, system) {
            if self.frontends[*pool as usize].assign(device_id, transponder) {
                return true;
            }
        }
        false
    }

    fn attach(&mut self, device_id: usize, transponder: i32) {
        for pool in self.frontends.iter_mut() {
            if pool.attach(device_id, transponder) {
                return;
            }
        }
    }

    fn detach(&mut self, device_id: usize, transponder: i32) {
        for pool in self.frontends.iter_mut() {
            if pool.detach(device_id, transponder) {
                return;
            }
        }
    }

    fn to_ref(&self) -> ServerRef {
        ServerRef {
            id: self.id,
            address: self.address.clone(),
            port: self.port,
            src_address: self.src_address.clone(),
            description: self.description.clone(),
            quirks: self.quirks,
            has_ci: self.has_ci,
        }
    }

    fn module_count(&self, pool: DelSys) -> usize {
        self.frontends[pool as usize].len()
    }
}

/// Lightweight server snapshot handed to tuners. Attach/detach go back
/// through the registry by id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerRef {
    pub id: u64,
    pub address: String,
    pub port: u16,
    pub src_address: Option<String>,
    pub description: String,
    pub quirks: Quirks,
    pub has_ci: bool,
}

struct RegistryInner {
    servers: Vec<Server>,
    next_id: u64,
}

/// The set of known servers, shared between discovery and the tuners.
pub struct ServerRegistry {
    config: Arc<SatipConfig>,
    inner: Mutex<RegistryInner>,
}

impl ServerRegistry {
    pub fn new(config: Arc<SatipConfig>) -> Arc<Self> {
        Arc::new(Self {
            config,
            inner: Mutex::new(RegistryInner {
                servers: Vec::new(),
                next_id: 1,
            }),
        })
    }

    /// Add or refresh a discovered server. A known (address, model,
    /// description) triple only gets its last-seen stamp advanced.
    pub fn add_server(
        &self,
        src_address: Option<String>,
        address: String,
        port: u16,
        model: String,
        filters: Vec<Source>,
        description: String,
        extra_quirks: u32,
        static_entry: bool,
    ) {
        if self.config.single_model_servers() && model.contains(',') {
            for (n, token) in model.split(',').map(str::trim).enumerate() {
                self.insert(
                    src_address.clone(),
                    address.clone(),
                    port,
                    token.to_string(),
                    filters.clone(),
                    format!("{description} #{n}"),
                    extra_quirks,
                    static_entry,
                );
            }
        } else {
            self.insert(
                src_address,
                address,
                port,
                model,
                filters,
                description,
                extra_quirks,
                static_entry,
            );
        }
    }

    /// Insert servers pinned on the command line.
    pub fn add_static(&self, entries: &[StaticServer]) {
        for entry in entries {
            self.add_server(
                entry.src_address.clone(),
                entry.address.clone(),
                if entry.port > 0 { entry.port } else { DEFAULT_RTSP_PORT },
                entry.model.clone(),
                entry.filters.clone(),
                entry.description.clone(),
                entry.quirks,
                true,
            );
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn insert(
        &self,
        src_address: Option<String>,
        address: String,
        port: u16,
        model: String,
        filters: Vec<Source>,
        description: String,
        extra_quirks: u32,
        static_entry: bool,
    ) {
        let mut inner = self.inner.lock();
        if let Some(existing) = inner
            .servers
            .iter_mut()
            .find(|s| s.identity_matches(&address, &model, &description))
        {
            existing.last_seen = Instant::now();
            return;
        }
        let id = inner.next_id;
        inner.next_id += 1;
        let server = Server::new(
            id,
            src_address,
            address,
            port,
            model,
            filters,
            description,
            extra_quirks,
            self.config.disable_quirks(),
            static_entry,
        );
        info!(
            "Adding server '{}|{}|{}' Bind: {} CI: {} Quirks: {}",
            server.address,
            server.model,
            server.description,
            server.src_address.as_deref().unwrap_or("default"),
            if server.has_ci { "yes" } else { "no" },
            server.quirks
        );
        inner.servers.push(server);
    }

    /// Find a server for the tune request: first a server already serving
    /// this (device, transponder), then the first active server with a
    /// compatible free frontend. Insertion order breaks ties.
    pub fn assign(
        &self,
        device_id: usize,
        source: Source,
        system: i32,
        transponder: i32,
    ) -> Option<ServerRef> {
        let mut inner = self.inner.lock();
        if let Some(server) = inner
            .servers
            .iter()
            .find(|s| s.active && s.matches(device_id, source, system, transponder))
        {
            return Some(server.to_ref());
        }
        for server in inner.servers.iter_mut() {
            if server.active && server.assign(device_id, source, system, transponder) {
                return Some(server.to_ref());
            }
        }
        None
    }

    pub fn attach(&self, id: u64, device_id: usize, transponder: i32) {
        let mut inner = self.inner.lock();
        if let Some(server) = inner.servers.iter_mut().find(|s| s.id == id) {
            server.attach(device_id, transponder);
        }
    }

    pub fn detach(&self, id: u64, device_id: usize, transponder: i32) {
        let mut inner = self.inner.lock();
        if let Some(server) = inner.servers.iter_mut().find(|s| s.id == id) {
            server.detach(device_id, transponder);
        }
    }

    pub fn activate(&self, id: u64, on: bool) {
        let mut inner = self.inner.lock();
        if let Some(server) = inner.servers.iter_mut().find(|s| s.id == id) {
            server.active = on;
        }
    }

    /// True when some active server can serve the source class.
    pub fn has_server_for(&self, source: Source) -> bool {
        self.inner
            .lock()
            .servers
            .iter()
            .any(|s| s.active && s.matches_source(source))
    }

    /// Drop servers not re-seen within `max_age`. Static servers never
    /// expire.
    pub fn cleanup(&self, max_age: Duration) -> usize {
        let mut inner = self.inner.lock();
        let before = inner.servers.len();
        inner.servers.retain(|s| {
            let keep = s.static_entry || s.last_seen.elapsed() <= max_age;
            if !keep {
                info!(
                    "Removing server {} ({} {})",
                    s.description, s.address, s.model
                );
            }
            keep
        });
        before - inner.servers.len()
    }

    pub fn count(&self) -> usize {
        self.inner.lock().servers.len()
    }

    /// Rough count of provided modulation systems, used to weight device
    /// capability announcements.
    pub fn num_provided_systems(&self) -> usize {
        let inner = self.inner.lock();
        inner
            .servers
            .iter()
            .map(|s| {
                s.module_count(DelSys::DvbS2) * 4
                    + s.module_count(DelSys::DvbT) * 3
                    + s.module_count(DelSys::DvbT2) * 4
                    + s.module_count(DelSys::DvbC) * 3
                    + s.module_count(DelSys::DvbC2) * 5
                    + s.module_count(DelSys::Atsc) * 3
            })
            .sum()
    }

    /// Server list for the LIST command.
    pub fn list(&self) -> String {
        let inner = self.inner.lock();
        let mut out = String::new();
        for s in &inner.servers {
            let flag = if s.active { '+' } else { '-' };
            match &s.src_address {
                Some(src) => out.push_str(&format!(
                    "{flag} {src}@{}|{}|{}\n",
                    s.address, s.model, s.description
                )),
                None => out.push_str(&format!("{flag} {}|{}|{}\n", s.address, s.model, s.description)),
            }
        }
        out
    }

    pub fn server_string(&self, id: u64) -> Option<String> {
        let inner = self.inner.lock();
        inner
            .servers
            .iter()
            .find(|s| s.id == id)
            .map(|s| format!("{}|{}|{}", s.address, s.model, s.description))
    }

    /// Age of a server entry, for diagnostics.
    pub fn age(&self, id: u64) -> Option<Duration> {
        let inner = self.inner.lock();
        inner
            .servers
            .iter()
            .find(|s| s.id == id)
            .map(|s| s.created.elapsed())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registry() -> Arc<ServerRegistry> {
        ServerRegistry::new(Arc::new(SatipConfig::default()))
    }

    fn add(reg: &ServerRegistry, address: &str, model: &str, description: &str) {
        reg.add_server(
            None,
            address.to_string(),
            DEFAULT_RTSP_PORT,
            model.to_string(),
            Vec::new(),
            description.to_string(),
            0,
            false,
        );
    }

    #[test]
    fn duplicate_insert_refreshes_instead_of_adding() {
        let reg = registry();
        add(&reg, "10.0.0.2", "DVBS2-2", "minisatip");
        add(&reg, "10.0.0.2", "DVBS2-2", "minisatip");
        assert_eq!(reg.count(), 1);
        add(&reg, "10.0.0.2", "DVBS2-2", "other");
        assert_eq!(reg.count(), 2);
    }

    #[test]
    fn quirk_autodetection() {
        let reg = registry();
        add(&reg, "10.0.0.2", "DVBS2-2", "OctopusNet");
        let source = Source::parse("S19.2E").unwrap();
        let server = reg.assign(0, source, 1, 111594).unwrap();
        assert!(server.quirks.has(Quirks::CI_XPMT));
        assert!(server.has_ci);
        assert!(!server.quirks.has(Quirks::SESSION_ID));
    }

    #[test]
    fn quirk_autodetection_disabled() {
        let config = Arc::new(SatipConfig::default());
        config.set_disable_quirks(true);
        let reg = ServerRegistry::new(config);
        add(&reg, "10.0.0.2", "DVBS2-2", "OctopusNet");
        let server = reg.assign(0, Source::parse("S19.2E").unwrap(), 1, 111594).unwrap();
        assert!(!server.quirks.has(Quirks::CI_XPMT));
    }

    #[test]
    fn fritz_box_quirk_set() {
        let reg = registry();
        add(&reg, "10.0.0.9", "DVBC-2", "FRITZ!WLAN Repeater DVB-C");
        let server = reg.assign(0, Source::parse("C").unwrap(), 0, 346).unwrap();
        assert!(server.quirks.has(Quirks::PLAY_PIDS));
        assert!(server.quirks.has(Quirks::FORCE_LOCK));
        assert!(server.quirks.has(Quirks::TEAR_AND_PLAY));
    }

    #[test]
    fn frontend_assignment_reuse_and_exhaustion() {
        let reg = registry();
        add(&reg, "10.0.0.2", "DVBS2-2", "server-a");
        let source = Source::parse("S19.2E").unwrap();

        let first = reg.assign(1, source, 1, 111594).unwrap();
        reg.attach(first.id, 1, 111594);
        // Same device and transponder again: reuse.
        let again = reg.assign(1, source, 1, 111594).unwrap();
        assert_eq!(first.id, again.id);

        // Second device, same transponder: second frontend.
        let second = reg.assign(2, source, 1, 111594).unwrap();
        reg.attach(second.id, 2, 111594);

        // Third device: both frontends attached to other devices.
        assert!(reg.assign(3, source, 1, 222594).is_none());
    }

    #[test]
    fn detach_frees_frontend() {
        let reg = registry();
        add(&reg, "10.0.0.2", "DVBS2-1", "server-a");
        let source = Source::parse("S19.2E").unwrap();
        let server = reg.assign(1, source, 1, 111594).unwrap();
        reg.attach(server.id, 1, 111594);
        assert!(reg.assign(2, source, 1, 111594).is_none());
        reg.detach(server.id, 1, 111594);
        assert!(reg.assign(2, source, 1, 111594).is_some());
    }

    #[test]
    fn source_filter_restricts_assignment() {
        let reg = registry();
        reg.add_server(
            None,
            "10.0.0.2".to_string(),
            DEFAULT_RTSP_PORT,
            "DVBS2-2".to_string(),
            vec![Source::parse("S19.2E").unwrap()],
            "filtered".to_string(),
            0,
            false,
        );
        assert!(reg.assign(0, Source::parse("S13E").unwrap(), 1, 1).is_none());
        assert!(reg.assign(0, Source::parse("S19.2E").unwrap(), 1, 1).is_some());
    }

    #[test]
    fn terrestrial_falls_back_to_t2_pool() {
        let reg = registry();
        add(&reg, "10.0.0.3", "DVBT2-1", "t2-only");
        let source = Source::parse("T").unwrap();
        // A DVB-T (system 0) request may land on a T2 frontend.
        assert!(reg.assign(0, source, 0, 506).is_some());
    }

    #[test]
    fn cleanup_spares_static_servers() {
        let reg = registry();
        add(&reg, "10.0.0.2", "DVBS2-2", "dynamic");
        reg.add_static(&[StaticServer::parse("10.0.0.3|DVBT-2|pinned").unwrap()]);
        assert_eq!(reg.count(), 2);
        let removed = reg.cleanup(Duration::from_secs(0));
        assert_eq!(removed, 1);
        assert_eq!(reg.count(), 1);
        assert!(reg.has_server_for(Source::parse("T").unwrap()));
        assert!(!reg.has_server_for(Source::parse("S19.2E").unwrap()));
    }

    #[test]
    fn single_model_split() {
        let config = Arc::new(SatipConfig::default());
        config.set_single_model_servers(true);
        let reg = ServerRegistry::new(config);
        reg.add_server(
            None,
            "10.0.0.2".to_string(),
            DEFAULT_RTSP_PORT,
            "DVBS2-2,DVBT-1".to_string(),
            Vec::new(),
            "combo".to_string(),
            0,
            false,
        );
        assert_eq!(reg.count(), 2);
        let listing = reg.list();
        assert!(listing.contains("combo #0"));
        assert!(listing.contains("combo #1"));
    }

    #[test]
    fn provided_system_weighting() {
        let reg = registry();
        add(&reg, "10.0.0.2", "DVBS2-2,DVBT-1", "combo");
        assert_eq!(reg.num_provided_systems(), 2 * 4 + 3);
    }
}

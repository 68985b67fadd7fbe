//! SSDP discovery of SAT>IP servers.
//!
//! One background task sends periodic M-SEARCH probes, listens for
//! responses and NOTIFY advertisements on the SSDP group, fetches the
//! advertised UPnP device descriptions over HTTP and feeds the server
//! registry. Stale registry entries are cleaned after two probe periods.

use std::collections::HashMap;
use std::net::Ipv4Addr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use log::{debug, info, warn};
use parking_lot::Mutex;
use tokio::sync::Notify;

use crate::config::{trace, SatipConfig, DEFAULT_RTSP_PORT};
use crate::error::{Result, SatipError};
use crate::server::ServerRegistry;
use crate::socket::multicast_socket;

const SSDP_GROUP: Ipv4Addr = Ipv4Addr::new(239, 255, 255, 250);
const SSDP_PORT: u16 = 1900;
const SEARCH_TARGET: &str = "urn:ses-com:device:SatIPServer:1";

/// Rescan period.
pub const PROBE_INTERVAL: Duration = Duration::from_secs(60);
/// Registry entries not re-seen within this window are dropped.
pub const CLEANUP_INTERVAL: Duration = Duration::from_secs(120);
/// Device-description fetch deadline.
const FETCH_TIMEOUT: Duration = Duration::from_millis(1500);

/// Parsed UPnP device description.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceDescription {
    pub name: String,
    pub model: String,
    pub rtsp_port: u16,
}

pub struct Discovery {
    config: Arc<SatipConfig>,
    registry: Arc<ServerRegistry>,
    http: reqwest::Client,
    scan: Notify,
    last_fetch: Mutex<HashMap<String, Instant>>,
}

impl Discovery {
    pub fn new(config: Arc<SatipConfig>, registry: Arc<ServerRegistry>) -> Result<Arc<Self>> {
        let http = reqwest::Client::builder()
            .timeout(FETCH_TIMEOUT)
            .connect_timeout(FETCH_TIMEOUT)
            .user_agent(concat!("satip-client/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| SatipError::ConfigInvalid(format!("HTTP client: {e}")))?;
        Ok(Arc::new(Self {
            config,
            registry,
            http,
            scan: Notify::new(),
            last_fetch: Mutex::new(HashMap::new()),
        }))
    }

    /// Request an immediate probe (SCAN command).
    pub fn trigger_scan(&self) {
        self.scan.notify_one();
    }

    /// Discovery main loop; runs until the task is cancelled.
    pub async fn run(self: Arc<Self>) {
        let socket = match multicast_socket(SSDP_GROUP, SSDP_PORT, None, Ipv4Addr::UNSPECIFIED, 0) {
            Ok(s) => s,
            Err(e) => {
                warn!("Discovery disabled, cannot open SSDP socket: {e}");
                return;
            }
        };
        info!("Discovery listening on {SSDP_GROUP}:{SSDP_PORT}");

        let mut interval = tokio::time::interval(PROBE_INTERVAL);
        let mut buf = vec![0u8; 8192];
        loop {
            tokio::select! {
                _ = interval.tick() => {
                    self.probe(&socket).await;
                    let removed = self.registry.cleanup(CLEANUP_INTERVAL);
                    if removed > 0 {
                        info!("Discovery cleanup removed {removed} stale servers");
                    }
                }
                _ = self.scan.notified() => {
                    info!("Discovery scan triggered");
                    self.probe(&socket).await;
                }
                received = socket.recv_from(&mut buf) => {
                    match received {
                        Ok((n, from)) => {
                            if self.config.traces(trace::DISCOVERY) {
                                debug!("SSDP datagram from {from}, {n} bytes");
                            }
                            self.handle_datagram(&buf[..n]).await;
                        }
                        Err(e) => {
                            warn!("SSDP receive error: {e}");
                            tokio::time::sleep(Duration::from_secs(1)).await;
                        }
                    }
                }
            }
        }
    }

    async fn probe(&self, socket: &tokio::net::UdpSocket) {
        let msearch = format!(
            "M-SEARCH * HTTP/1.1\r\n\
             HOST: {SSDP_GROUP}:{SSDP_PORT}\r\n\
             MAN: \"ssdp:discover\"\r\n\
             ST: {SEARCH_TARGET}\r\n\
             MX: 2\r\n\r\n"
        );
        if let Err(e) = socket.send_to(msearch.as_bytes(), (SSDP_GROUP, SSDP_PORT)).await {
            warn!("M-SEARCH send failed: {e}");
        }
    }

    async fn handle_datagram(&self, data: &[u8]) {
        let text = String::from_utf8_lossy(data);
        let Some(location) = parse_location(&text) else {
            return;
        };
        // Throttle repeat fetches of the same description URL.
        {
            let mut last_fetch = self.last_fetch.lock();
            let now = Instant::now();
            last_fetch.retain(|_, t| now.duration_since(*t) < PROBE_INTERVAL);
            if last_fetch.contains_key(&location) {
                return;
            }
            last_fetch.insert(location.clone(), now);
        }
        if let Err(e) = self.fetch(&location).await {
            warn!("Device description fetch failed: {e}");
        }
    }

    /// Fetch and parse one device description, then feed the registry.
    async fn fetch(&self, url: &str) -> Result<()> {
        let response = self
            .http
            .get(url)
            .send()
            .await
            .map_err(|e| SatipError::DiscoveryXmlMalformed(format!("{url}: {e}")))?;
        if !response.status().is_success() {
            return Err(SatipError::DiscoveryXmlMalformed(format!(
                "{url}: status {}",
                response.status()
            )));
        }

        let rtsp_port = response
            .headers()
            .get("X-SATIP-RTSP-Port")
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.trim().parse().ok());
        let address = response
            .remote_addr()
            .map(|a| a.ip().to_string())
            .or_else(|| host_of(url))
            .ok_or_else(|| SatipError::DiscoveryXmlMalformed(url.to_string()))?;

        let body = response
            .text()
            .await
            .map_err(|e| SatipError::DiscoveryXmlMalformed(format!("{url}: {e}")))?;
        let mut description = parse_device_description(&body)
            .ok_or_else(|| SatipError::DiscoveryXmlMalformed(url.to_string()))?;
        if let Some(port) = rtsp_port {
            description.rtsp_port = port;
        }

        debug!(
            "Discovered '{}' ({}) at {address}:{}",
            description.name, description.model, description.rtsp_port
        );
        self.registry.add_server(
            None,
            address,
            description.rtsp_port,
            description.model,
            Vec::new(),
            description.name,
            0,
            false,
        );
        Ok(())
    }
}

/// Extract the LOCATION URL from an SSDP response or advertisement that
/// speaks about a SAT>IP server.
fn parse_location(text: &str) -> Option<String> {
    let mut location = None;
    let mut is_satip = false;
    for line in text.lines() {
        let line = line.trim();
        let Some((name, value)) = line.split_once(':') else {
            continue;
        };
        let name = name.trim().to_ascii_uppercase();
        let value = value.trim();
        match name.as_str() {
            "LOCATION" => location = Some(value.to_string()),
            "ST" | "NT" => is_satip |= value.contains(SEARCH_TARGET),
            _ => {}
        }
    }
    if is_satip {
        location
    } else {
        None
    }
}

/// Pull `friendlyName` and `satip:X_SATIPCAP` out of a UPnP description.
/// Absent capability defaults to a single DVB-S2 frontend, matching what
/// the first generation of servers shipped.
fn parse_device_description(body: &str) -> Option<DeviceDescription> {
    let name = xml_text(body, "friendlyName")?;
    let model = xml_text(body, "satip:X_SATIPCAP").unwrap_or_else(|| "DVBS2-1".to_string());
    Some(DeviceDescription {
        name,
        model,
        rtsp_port: DEFAULT_RTSP_PORT,
    })
}

/// Text content of the first `<tag>` element.
fn xml_text(body: &str, tag: &str) -> Option<String> {
    let open = format!("<{tag}");
    let close = format!("</{tag}>");
    let start = body.find(&open)?;
    let content_start = start + body[start..].find('>')? + 1;
    let content_end = content_start + body[content_start..].find(&close)?;
    let text = body[content_start..content_end].trim();
    if text.is_empty() {
        None
    } else {
        Some(text.to_string())
    }
}

fn host_of(url: &str) -> Option<String> {
    let rest = url.split_once("://")?.1;
    let host_port = rest.split(['/', '?']).next()?;
    Some(host_port.split(':').next()?.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    const SSDP_RESPONSE: &str = "HTTP/1.1 200 OK\r\n\
        CACHE-CONTROL: max-age=1800\r\n\
        EXT:\r\n\
        LOCATION: http://10.0.0.2:8080/desc.xml\r\n\
        SERVER: Linux/3.10 UPnP/1.1 minisatip/1.20\r\n\
        ST: urn:ses-com:device:SatIPServer:1\r\n\
        USN: uuid:12345678::urn:ses-com:device:SatIPServer:1\r\n\r\n";

    const DEVICE_XML: &str = r#"<?xml version="1.0"?>
        <root xmlns="urn:schemas-upnp-org:device-1-0" xmlns:satip="urn:ses-com:satip">
          <device>
            <deviceType>urn:ses-com:device:SatIPServer:1</deviceType>
            <friendlyName>minisatip</friendlyName>
            <manufacturer>CC</manufacturer>
            <satip:X_SATIPCAP>DVBS2-2,DVBT-1</satip:X_SATIPCAP>
          </device>
        </root>"#;

    #[test]
    fn location_from_msearch_response() {
        assert_eq!(
            parse_location(SSDP_RESPONSE).as_deref(),
            Some("http://10.0.0.2:8080/desc.xml")
        );
    }

    #[test]
    fn location_requires_satip_target() {
        let other = SSDP_RESPONSE.replace("urn:ses-com:device:SatIPServer:1", "upnp:rootdevice");
        assert!(parse_location(&other).is_none());
    }

    #[test]
    fn device_description_parsing() {
        let d = parse_device_description(DEVICE_XML).unwrap();
        assert_eq!(d.name, "minisatip");
        assert_eq!(d.model, "DVBS2-2,DVBT-1");
        assert_eq!(d.rtsp_port, DEFAULT_RTSP_PORT);
    }

    #[test]
    fn missing_capability_defaults_to_dvbs2() {
        let xml = "<root><device><friendlyName>Bare</friendlyName></device></root>";
        let d = parse_device_description(xml).unwrap();
        assert_eq!(d.model, "DVBS2-1");
    }

    #[test]
    fn malformed_description_is_rejected() {
        assert!(parse_device_description("<root></root>").is_none());
        assert!(parse_device_description("not xml at all").is_none());
    }

    #[test]
    fn host_extraction() {
        assert_eq!(host_of("http://10.0.0.2:8080/desc.xml").as_deref(), Some("10.0.0.2"));
        assert_eq!(host_of("http://10.0.0.2/desc.xml").as_deref(), Some("10.0.0.2"));
        assert!(host_of("garbage").is_none());
    }
}

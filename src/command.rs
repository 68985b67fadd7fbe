//! Line-based TCP command channel.
//!
//! A thin operational interface in the spirit of SVDRP: one verb per
//! line, one text reply. Used by operators and scripts to inspect and
//! steer the running client.

use std::sync::Arc;

use log::{debug, info, warn};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};

use crate::config::{OperatingMode, SatipConfig};
use crate::device::{DeviceSet, InfoPage};
use crate::discover::Discovery;
use crate::server::ServerRegistry;

pub struct CommandServer {
    config: Arc<SatipConfig>,
    registry: Arc<ServerRegistry>,
    discovery: Arc<Discovery>,
    devices: Arc<DeviceSet>,
}

impl CommandServer {
    pub fn new(
        config: Arc<SatipConfig>,
        registry: Arc<ServerRegistry>,
        discovery: Arc<Discovery>,
        devices: Arc<DeviceSet>,
    ) -> Arc<Self> {
        Arc::new(Self {
            config,
            registry,
            discovery,
            devices,
        })
    }

    pub async fn run(self: Arc<Self>, listener: TcpListener) {
        loop {
            match listener.accept().await {
                Ok((stream, peer)) => {
                    debug!("Command connection from {peer}");
                    let server = Arc::clone(&self);
                    tokio::spawn(async move {
                        if let Err(e) = server.handle_connection(stream).await {
                            debug!("Command connection from {peer} ended: {e}");
                        }
                    });
                }
                Err(e) => {
                    warn!("Command accept failed: {e}");
                    tokio::time::sleep(std::time::Duration::from_secs(1)).await;
                }
            }
        }
    }

    async fn handle_connection(&self, stream: TcpStream) -> std::io::Result<()> {
        let (reader, mut writer) = stream.into_split();
        let mut lines = BufReader::new(reader).lines();
        while let Some(line) = lines.next_line().await? {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            if line.eq_ignore_ascii_case("QUIT") {
                break;
            }
            let reply = self.execute(line).await;
            writer.write_all(reply.as_bytes()).await?;
            if !reply.ends_with('\n') {
                writer.write_all(b"\n").await?;
            }
        }
        Ok(())
    }

    /// Execute one command line and render the reply.
    pub async fn execute(&self, line: &str) -> String {
        let mut words = line.split_whitespace();
        let verb = words.next().unwrap_or_default().to_ascii_uppercase();
        let arg1 = words.next();
        let arg2 = words.next();

        match verb.as_str() {
            "INFO" => {
                let page = arg1
                    .and_then(|p| p.parse().ok())
                    .map(InfoPage::from_number)
                    .unwrap_or(InfoPage::All);
                let index: usize = arg2.and_then(|i| i.parse().ok()).unwrap_or(0);
                match self.devices.get(index) {
                    Some(device) => device.info(page).await,
                    None => "SATIP information not available!".to_string(),
                }
            }
            "MODE" => {
                let bytes = !self.config.use_bytes();
                self.config.set_use_bytes(bytes);
                format!(
                    "SATIP information mode: {}",
                    if bytes { "bytes" } else { "bits" }
                )
            }
            "LIST" => {
                let list = self.registry.list();
                if list.is_empty() {
                    "No SATIP servers detected!".to_string()
                } else {
                    list
                }
            }
            "SCAN" => {
                self.discovery.trigger_scan();
                "SATIP server scan requested".to_string()
            }
            "STAT" => {
                let status = self.devices.status();
                if status.is_empty() {
                    "SATIP status not available!".to_string()
                } else {
                    status
                }
            }
            "CONT" => format!("SATIP device count: {}", self.devices.count()),
            "OPER" => {
                if let Some(arg) = arg1 {
                    match arg.parse::<OperatingMode>() {
                        Ok(mode) => self.config.set_operating_mode(mode),
                        Err(_) => return format!("Unknown operating mode: {arg}"),
                    }
                }
                format!(
                    "SATIP operating mode: {}",
                    self.config.operating_mode().as_str()
                )
            }
            "ATTA" => {
                self.config.set_detached(false);
                info!("SATIP servers attached");
                "SATIP servers attached".to_string()
            }
            "DETA" => {
                self.config.set_detached(true);
                info!("SATIP servers detached");
                "SATIP servers detached".to_string()
            }
            "TRAC" => {
                if let Some(arg) = arg1 {
                    let arg = arg.trim_start_matches("0x");
                    match u32::from_str_radix(arg, 16) {
                        Ok(mask) => self.config.set_trace_mask(mask),
                        Err(_) => return format!("Invalid trace mask: {arg}"),
                    }
                }
                format!("SATIP trace mode: {:#06x}", self.config.trace_mask())
            }
            _ => format!("Unknown command: {verb}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::poller::Poller;

    async fn command_server() -> Arc<CommandServer> {
        let config = Arc::new(SatipConfig::default());
        let registry = ServerRegistry::new(Arc::clone(&config));
        let discovery = Discovery::new(Arc::clone(&config), Arc::clone(&registry)).unwrap();
        let poller = Poller::new();
        let devices = Arc::new(
            DeviceSet::new(1, Arc::clone(&config), Arc::clone(&registry), poller).unwrap(),
        );
        CommandServer::new(config, registry, discovery, devices)
    }

    #[tokio::test]
    async fn cont_reports_device_count() {
        let server = command_server().await;
        assert_eq!(server.execute("CONT").await, "SATIP device count: 1");
        server.devices.shutdown().await;
    }

    #[tokio::test]
    async fn oper_sets_and_reports_mode() {
        let server = command_server().await;
        assert_eq!(
            server.execute("OPER low").await,
            "SATIP operating mode: low"
        );
        assert_eq!(server.execute("OPER").await, "SATIP operating mode: low");
        assert!(server.execute("OPER bogus").await.contains("Unknown"));
        server.devices.shutdown().await;
    }

    #[tokio::test]
    async fn atta_deta_toggle_detached_mode() {
        let server = command_server().await;
        server.execute("DETA").await;
        assert!(server.config.detached());
        server.execute("ATTA").await;
        assert!(!server.config.detached());
        server.devices.shutdown().await;
    }

    #[tokio::test]
    async fn trac_parses_hex_mask() {
        let server = command_server().await;
        assert_eq!(server.execute("TRAC 0x3").await, "SATIP trace mode: 0x0003");
        assert_eq!(server.execute("TRAC").await, "SATIP trace mode: 0x0003");
        server.devices.shutdown().await;
    }

    #[tokio::test]
    async fn mode_toggles_statistics_unit() {
        let server = command_server().await;
        assert_eq!(
            server.execute("MODE").await,
            "SATIP information mode: bytes"
        );
        assert_eq!(server.execute("MODE").await, "SATIP information mode: bits");
        server.devices.shutdown().await;
    }

    #[tokio::test]
    async fn list_reports_empty_registry() {
        let server = command_server().await;
        assert_eq!(server.execute("LIST").await, "No SATIP servers detected!");
        server.devices.shutdown().await;
    }
}

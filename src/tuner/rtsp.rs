//! Per-tuner RTSP 1.0 client.
//!
//! One TCP connection per tuner, strictly serialized request/response.
//! In interleaved mode the same connection carries `$`-framed RTP/RTCP
//! data (RFC 2326 §10.12); frames encountered while waiting for a response
//! are dispatched to the receivers in arrival order.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use bytes::{Buf, BytesMut};
use log::{debug, info, warn};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

use crate::config::{trace, SatipConfig};
use crate::error::{Result, SatipError};
use crate::socket::tcp_connect;
use crate::tuner::rtcp::RtcpReceiver;
use crate::tuner::rtp::RtpReceiver;
use crate::tuner::CONNECT_TIMEOUT;

const USER_AGENT: &str = concat!("satip-client/", env!("CARGO_PKG_VERSION"));

/// Transport negotiated by SETUP.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NegotiatedTransport {
    Unicast {
        server_ports: Option<(u16, u16)>,
    },
    Multicast {
        destination: Ipv4Addr,
        ports: (u16, u16),
    },
    Interleaved {
        channels: (u8, u8),
    },
}

/// Everything SETUP tells us about the new session.
#[derive(Debug, Clone)]
pub struct SetupResponse {
    pub session: String,
    pub timeout_ms: u64,
    pub stream_id: Option<u32>,
    pub transport: NegotiatedTransport,
}

struct Response {
    status: u32,
    headers: Vec<(String, String)>,
    body: String,
}

impl Response {
    fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }
}

pub struct RtspClient {
    device_id: usize,
    config: Arc<SatipConfig>,
    rtp: Arc<RtpReceiver>,
    rtcp: Arc<RtcpReceiver>,
    stream: Option<TcpStream>,
    read_buf: BytesMut,
    cseq: u32,
    session: Option<String>,
    strip_session_zeros: bool,
    interleaved_channels: Option<(u8, u8)>,
    bind: Option<IpAddr>,
    peer: Option<SocketAddr>,
}

impl RtspClient {
    pub fn new(
        device_id: usize,
        config: Arc<SatipConfig>,
        rtp: Arc<RtpReceiver>,
        rtcp: Arc<RtcpReceiver>,
    ) -> Self {
        Self {
            device_id,
            config,
            rtp,
            rtcp,
            stream: None,
            read_buf: BytesMut::with_capacity(16 * 1024),
            cseq: 0,
            session: None,
            strip_session_zeros: false,
            interleaved_channels: None,
            bind: None,
            peer: None,
        }
    }

    /// Source interface for the TCP connection (the server's configured
    /// bind address).
    pub fn set_interface(&mut self, bind: Option<IpAddr>) {
        self.bind = bind;
    }

    /// Enable the SessionId quirk: leading zeros are stripped before the
    /// session id is echoed in requests.
    pub fn set_session_quirk(&mut self, on: bool) {
        self.strip_session_zeros = on;
    }

    pub fn session(&self) -> Option<&str> {
        self.session.as_deref()
    }

    pub fn is_interleaved(&self) -> bool {
        self.interleaved_channels.is_some()
    }

    /// Active transport for diagnostics.
    pub fn mode(&self) -> &'static str {
        if self.interleaved_channels.is_some() {
            "RTP-over-TCP"
        } else {
            "RTP-over-UDP"
        }
    }

    /// Drop the connection and all session state.
    pub fn reset(&mut self) {
        self.stream = None;
        self.read_buf.clear();
        self.session = None;
        self.interleaved_channels = None;
        self.peer = None;
        self.rtp.reset();
    }

    async fn ensure_connected(&mut self, addr: SocketAddr) -> Result<()> {
        if self.stream.is_some() && self.peer == Some(addr) {
            return Ok(());
        }
        self.reset();
        let stream = tcp_connect(addr, self.bind, CONNECT_TIMEOUT).await?;
        debug!("RTSP connected to {addr} [device {}]", self.device_id);
        self.stream = Some(stream);
        self.peer = Some(addr);
        Ok(())
    }

    pub async fn options(&mut self, addr: SocketAddr, uri: &str) -> Result<()> {
        self.transaction(addr, "OPTIONS", uri, None).await.map(|_| ())
    }

    /// DESCRIBE; returns the SDP body, which carries the reception report
    /// for the active stream.
    pub async fn describe(&mut self, addr: SocketAddr, uri: &str) -> Result<String> {
        let response = self
            .transaction(addr, "DESCRIBE", uri, Some("Accept: application/sdp"))
            .await?;
        Ok(response.body)
    }

    /// SETUP with the given transport request.
    pub async fn setup(
        &mut self,
        addr: SocketAddr,
        uri: &str,
        rtp_port: u16,
        rtcp_port: u16,
        use_tcp: bool,
        use_multicast: bool,
    ) -> Result<SetupResponse> {
        let transport = if use_tcp {
            "Transport: RTP/AVP/TCP;interleaved=0-1".to_string()
        } else if use_multicast {
            "Transport: RTP/AVP;multicast".to_string()
        } else {
            format!("Transport: RTP/AVP;unicast;client_port={rtp_port}-{rtcp_port}")
        };
        let response = self
            .transaction(addr, "SETUP", uri, Some(transport.as_str()))
            .await?;

        let (session, timeout_ms) = match response.header("Session") {
            Some(value) => parse_session(value),
            None => return Err(SatipError::TransportNegotiationFailed),
        };
        self.session = Some(self.apply_session_quirk(&session));

        let transport_echo = response
            .header("Transport")
            .ok_or(SatipError::TransportNegotiationFailed)?;
        let negotiated = parse_transport(transport_echo)?;

        let stream_id = response
            .header("com.ses.streamID")
            .and_then(|v| v.trim().parse().ok())
            .or_else(|| transport_token(transport_echo, "stream").and_then(|v| v.parse().ok()));

        if let NegotiatedTransport::Interleaved { channels } = negotiated {
            self.interleaved_channels = Some(channels);
        } else {
            self.interleaved_channels = None;
        }

        info!(
            "RTSP session {session} established, timeout {} s, {} [device {}]",
            timeout_ms / 1000,
            self.mode(),
            self.device_id
        );
        Ok(SetupResponse {
            session,
            timeout_ms,
            stream_id,
            transport: negotiated,
        })
    }

    pub async fn play(&mut self, addr: SocketAddr, uri: &str) -> Result<()> {
        self.transaction(addr, "PLAY", uri, None).await.map(|_| ())
    }

    pub async fn teardown(&mut self, addr: SocketAddr, uri: &str) -> Result<()> {
        let result = self.transaction(addr, "TEARDOWN", uri, None).await.map(|_| ());
        self.session = None;
        self.interleaved_channels = None;
        result
    }

    /// Pump pending interleaved data without blocking the state machine.
    /// Bounded per call so a fast stream cannot starve the caller.
    pub async fn receive(&mut self) -> Result<()> {
        if self.interleaved_channels.is_none() || self.stream.is_none() {
            return Ok(());
        }
        for _ in 0..64 {
            self.dispatch_frames()?;
            let stream = match self.stream.as_mut() {
                Some(s) => s,
                None => return Ok(()),
            };
            match tokio::time::timeout(
                Duration::from_millis(10),
                stream.read_buf(&mut self.read_buf),
            )
            .await
            {
                Err(_) => return Ok(()), // nothing pending
                Ok(Ok(0)) => {
                    return Err(SatipError::Socket(std::io::Error::new(
                        std::io::ErrorKind::UnexpectedEof,
                        "RTSP connection closed",
                    )))
                }
                Ok(Ok(_)) => {}
                Ok(Err(e)) => return Err(e.into()),
            }
        }
        self.dispatch_frames()
    }

    fn apply_session_quirk(&self, session: &str) -> String {
        if self.strip_session_zeros && session.starts_with('0') {
            let stripped = session.trim_start_matches('0');
            debug!(
                "Session id quirk: '{session}' -> '{stripped}' [device {}]",
                self.device_id
            );
            stripped.to_string()
        } else {
            session.to_string()
        }
    }

    async fn transaction(
        &mut self,
        addr: SocketAddr,
        method: &str,
        uri: &str,
        extra_header: Option<&str>,
    ) -> Result<Response> {
        self.ensure_connected(addr).await?;
        self.cseq = self.cseq.wrapping_add(1);

        let mut request = format!("{method} {uri} RTSP/1.0\r\nCSeq: {}\r\n", self.cseq);
        if let Some(session) = &self.session {
            request.push_str(&format!("Session: {session}\r\n"));
        }
        if let Some(extra) = extra_header {
            request.push_str(extra);
            request.push_str("\r\n");
        }
        request.push_str(&format!("User-Agent: {USER_AGENT}\r\n\r\n"));

        if self.config.traces(trace::RTSP) {
            debug!("RTSP >>> {method} {uri} CSeq={} [device {}]", self.cseq, self.device_id);
        }

        let result = tokio::time::timeout(CONNECT_TIMEOUT, async {
            self.stream
                .as_mut()
                .ok_or(SatipError::ConnectTimeout)?
                .write_all(request.as_bytes())
                .await?;
            self.read_response().await
        })
        .await
        .map_err(|_| SatipError::ConnectTimeout)?;

        let response = match result {
            Ok(r) => r,
            Err(e) => {
                // A broken transaction leaves the connection in an unknown
                // state; force a reconnect on the next request.
                self.stream = None;
                self.peer = None;
                return Err(e);
            }
        };

        if self.config.traces(trace::RTSP) {
            debug!("RTSP <<< {} [device {}]", response.status, self.device_id);
        }
        match response.status {
            200..=299 => Ok(response),
            401 => Err(SatipError::RtspAuth),
            status => Err(SatipError::RtspProtocol(status)),
        }
    }

    async fn read_response(&mut self) -> Result<Response> {
        loop {
            self.dispatch_frames()?;
            if let Some(response) = self.try_parse_response()? {
                return Ok(response);
            }
            let stream = self.stream.as_mut().ok_or(SatipError::ConnectTimeout)?;
            let n = stream.read_buf(&mut self.read_buf).await?;
            if n == 0 {
                return Err(SatipError::Socket(std::io::Error::new(
                    std::io::ErrorKind::UnexpectedEof,
                    "RTSP connection closed",
                )));
            }
        }
    }

    /// Consume leading `$`-framed interleaved chunks, dispatching them to
    /// the RTP/RTCP receivers.
    fn dispatch_frames(&mut self) -> Result<()> {
        while self.read_buf.first() == Some(&b'$') {
            if self.read_buf.len() < 4 {
                return Ok(());
            }
            let channel = self.read_buf[1];
            let len = u16::from_be_bytes([self.read_buf[2], self.read_buf[3]]) as usize;
            if self.read_buf.len() < 4 + len {
                return Ok(());
            }
            self.read_buf.advance(4);
            let frame = self.read_buf.split_to(len);
            let (rtp_ch, rtcp_ch) = self.interleaved_channels.unwrap_or((0, 1));
            if channel == rtp_ch {
                self.rtp.process(&frame);
            } else if channel == rtcp_ch {
                self.rtcp.process(&frame);
            } else {
                warn!(
                    "Interleaved frame on unknown channel {channel} [device {}]",
                    self.device_id
                );
            }
        }
        Ok(())
    }

    fn try_parse_response(&mut self) -> Result<Option<Response>> {
        let Some(header_end) = find_subslice(&self.read_buf, b"\r\n\r\n") else {
            return Ok(None);
        };
        let header_text = String::from_utf8_lossy(&self.read_buf[..header_end]).to_string();
        let mut lines = header_text.split("\r\n");
        let status_line = lines.next().unwrap_or_default();
        let status = status_line
            .split_whitespace()
            .nth(1)
            .and_then(|s| s.parse().ok())
            .ok_or(SatipError::RtspProtocol(0))?;
        let headers: Vec<(String, String)> = lines
            .filter_map(|line| {
                let (name, value) = line.split_once(':')?;
                Some((name.trim().to_string(), value.trim().to_string()))
            })
            .collect();
        let content_length = headers
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case("Content-Length"))
            .and_then(|(_, v)| v.parse::<usize>().ok())
            .unwrap_or(0);

        let total = header_end + 4 + content_length;
        if self.read_buf.len() < total {
            return Ok(None);
        }
        self.read_buf.advance(header_end + 4);
        let body = String::from_utf8_lossy(&self.read_buf.split_to(content_length)).to_string();
        Ok(Some(Response {
            status,
            headers,
            body,
        }))
    }
}

/// `Session: 0123456789;timeout=60` → (id, timeout in ms).
fn parse_session(value: &str) -> (String, u64) {
    let mut parts = value.split(';');
    let id = parts.next().unwrap_or_default().trim().to_string();
    let timeout_ms = parts
        .filter_map(|p| p.trim().strip_prefix("timeout="))
        .filter_map(|v| v.parse::<u64>().ok())
        .map(|secs| secs * 1000)
        .next()
        .unwrap_or(60_000);
    (id, timeout_ms)
}

/// One `key=value` token from a Transport header.
fn transport_token<'a>(transport: &'a str, key: &str) -> Option<&'a str> {
    transport
        .split(';')
        .filter_map(|p| p.trim().split_once('='))
        .find(|(k, _)| k.eq_ignore_ascii_case(key))
        .map(|(_, v)| v)
}

fn parse_port_pair(value: &str) -> Option<(u16, u16)> {
    let (a, b) = value.split_once('-')?;
    Some((a.trim().parse().ok()?, b.trim().parse().ok()?))
}

fn parse_transport(transport: &str) -> Result<NegotiatedTransport> {
    let lower = transport.to_ascii_lowercase();
    if lower.starts_with("rtp/avp/tcp") {
        let channels = transport_token(transport, "interleaved")
            .and_then(parse_port_pair)
            .map(|(a, b)| (a as u8, b as u8))
            .unwrap_or((0, 1));
        return Ok(NegotiatedTransport::Interleaved { channels });
    }
    if lower.contains("multicast") {
        let destination = transport_token(transport, "destination")
            .and_then(|v| v.parse().ok())
            .ok_or(SatipError::TransportNegotiationFailed)?;
        let ports = transport_token(transport, "port")
            .and_then(parse_port_pair)
            .ok_or(SatipError::TransportNegotiationFailed)?;
        return Ok(NegotiatedTransport::Multicast { destination, ports });
    }
    if lower.contains("unicast") {
        let server_ports = transport_token(transport, "server_port").and_then(parse_port_pair);
        return Ok(NegotiatedTransport::Unicast { server_ports });
    }
    Err(SatipError::TransportNegotiationFailed)
}

fn find_subslice(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack
        .windows(needle.len())
        .position(|window| window == needle)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn session_header_with_timeout() {
        let (id, timeout) = parse_session("01234567;timeout=60");
        assert_eq!(id, "01234567");
        assert_eq!(timeout, 60_000);
    }

    #[test]
    fn session_header_without_timeout_defaults() {
        let (id, timeout) = parse_session("abcdef");
        assert_eq!(id, "abcdef");
        assert_eq!(timeout, 60_000);
    }

    #[test]
    fn unicast_transport_echo() {
        let t = parse_transport("RTP/AVP;unicast;client_port=36000-36001;server_port=6970-6971")
            .unwrap();
        assert_eq!(
            t,
            NegotiatedTransport::Unicast {
                server_ports: Some((6970, 6971))
            }
        );
    }

    #[test]
    fn multicast_transport_echo() {
        let t = parse_transport("RTP/AVP;multicast;destination=239.1.2.3;port=5000-5001;ttl=5")
            .unwrap();
        assert_eq!(
            t,
            NegotiatedTransport::Multicast {
                destination: Ipv4Addr::new(239, 1, 2, 3),
                ports: (5000, 5001)
            }
        );
    }

    #[test]
    fn interleaved_transport_echo() {
        let t = parse_transport("RTP/AVP/TCP;interleaved=0-1").unwrap();
        assert_eq!(t, NegotiatedTransport::Interleaved { channels: (0, 1) });
    }

    #[test]
    fn stream_id_from_transport_token() {
        assert_eq!(
            transport_token("RTP/AVP;unicast;stream=4;client_port=36000-36001", "stream"),
            Some("4")
        );
    }

    #[test]
    fn malformed_transport_is_rejected() {
        assert!(parse_transport("X-BOGUS/AVP").is_err());
        assert!(parse_transport("RTP/AVP;multicast").is_err());
    }
}

//! RTCP receiver: extracts SAT>IP reception reports from APP packets.
//!
//! Reports arrive as an ASCII payload of the form
//! `ver=1.0;src=1;tuner=<feID>,<level>,<lock>,<quality>,<tail...>;pids=...`
//! where the tail mirrors the transponder parameters the server actually
//! tuned to. Signal metrics are pushed into the tuner feed; tail changes
//! rewrite the tracked channel descriptor.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use log::debug;

use crate::config::{trace, SatipConfig};
use crate::poller::PollSink;
use crate::tuner::feed::TunerFeed;

/// RTCP packet type APP.
const RTCP_PT_APP: u8 = 204;

/// Delivery class a reception report speaks about, keyed by its `ver=`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReportClass {
    Sat,
    Terrestrial,
    Cable,
}

/// Parsed SAT>IP reception report.
#[derive(Debug, Clone)]
pub struct ReceptionReport {
    pub class: ReportClass,
    /// `src=` value; -1 when absent (non-satellite reports).
    pub src_id: i32,
    pub frontend_id: i32,
    /// Raw signal level 0..255; 0 means no signal.
    pub level: i32,
    pub lock: bool,
    /// Raw quality 0..15.
    pub quality: i32,
    /// Transponder parameter tail, class specific.
    pub tail: Vec<String>,
}

impl ReceptionReport {
    /// Signal level mapped to dBm: 224 ≙ −25 dBm, 32 ≙ −65 dBm, 0 ≙ no
    /// signal.
    pub fn strength_dbm(&self) -> f64 {
        if self.level > 0 {
            40.0 * (self.level - 32) as f64 / 192.0 - 65.0
        } else {
            0.0
        }
    }

    /// Signal level scaled to 0..100.
    pub fn strength(&self) -> i32 {
        if self.level >= 0 {
            (self.level as f64 * 100.0 / 255.0 + 0.5) as i32
        } else {
            -1
        }
    }

    /// Quality scaled to 0..100; 0 without lock.
    pub fn quality_pct(&self) -> i32 {
        if self.lock && self.quality >= 0 {
            (self.quality as f64 * 100.0 / 15.0 + 0.5) as i32
        } else {
            0
        }
    }
}

/// Parse the ASCII payload of a reception report, starting at `ver=`.
pub fn parse_reception_report(s: &str) -> Option<ReceptionReport> {
    let mut fields = s.split(';');
    let class = match fields.next()? {
        "ver=1.0" => ReportClass::Sat,
        "ver=1.1" => ReportClass::Terrestrial,
        "ver=1.2" => ReportClass::Cable,
        _ => return None,
    };

    let mut field = fields.next()?;
    let mut src_id = -1;
    if let Some(v) = field.strip_prefix("src=") {
        src_id = v.parse().ok()?;
        field = fields.next()?;
    }

    let tuner = field.strip_prefix("tuner=")?;
    let mut params: Vec<String> = tuner.split(',').map(|p| p.trim().to_string()).collect();
    if params.len() < 4 {
        return None;
    }
    while params.len() < 14 {
        params.push(String::new());
    }

    Some(ReceptionReport {
        class,
        src_id,
        frontend_id: params[0].parse().unwrap_or(-1),
        level: params[1].parse().unwrap_or(0),
        lock: params[2] == "1",
        quality: params[3].parse().unwrap_or(-1),
        tail: params.split_off(4),
    })
}

/// Receives the RTCP side of one tuner.
pub struct RtcpReceiver {
    feed: Arc<TunerFeed>,
    config: Arc<SatipConfig>,
    packets: AtomicU64,
    decode_errors: AtomicU64,
}

impl RtcpReceiver {
    pub fn new(feed: Arc<TunerFeed>, config: Arc<SatipConfig>) -> Arc<Self> {
        Arc::new(Self {
            feed,
            config,
            packets: AtomicU64::new(0),
            decode_errors: AtomicU64::new(0),
        })
    }

    /// Process one RTCP compound packet (from UDP or an interleaved frame).
    pub fn process(&self, data: &[u8]) {
        self.packets.fetch_add(1, Ordering::Relaxed);
        let mut offset = 0;
        let mut found = false;
        while offset + 4 <= data.len() {
            let version = data[offset] >> 6;
            if version != 2 {
                break;
            }
            let pt = data[offset + 1];
            let words = ((data[offset + 2] as usize) << 8) | data[offset + 3] as usize;
            let chunk_len = (words + 1) * 4;
            if offset + chunk_len > data.len() {
                break;
            }
            if pt == RTCP_PT_APP && chunk_len > 12 {
                let app = &data[offset + 12..offset + chunk_len];
                if let Some(report) = extract_report(app) {
                    if self.config.traces(trace::RTCP) {
                        debug!("RTCP report: lock={} level={}", report.lock, report.level);
                    }
                    self.feed.apply_reception_report(&report, &self.config);
                    found = true;
                }
            }
            offset += chunk_len;
        }
        if !found && offset == 0 {
            // Nothing parseable at all: count and drop, never fatal.
            self.decode_errors.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn decode_errors(&self) -> u64 {
        self.decode_errors.load(Ordering::Relaxed)
    }

    pub fn packets(&self) -> u64 {
        self.packets.load(Ordering::Relaxed)
    }
}

/// Find and parse the `ver=` string inside an APP payload.
fn extract_report(app: &[u8]) -> Option<ReceptionReport> {
    let text = std::str::from_utf8(&app[..app.len().min(1024)]).ok()?;
    let start = text.find("ver=")?;
    let text = &text[start..];
    let end = text.find('\0').unwrap_or(text.len());
    parse_reception_report(text[..end].trim_end())
}

impl PollSink for RtcpReceiver {
    fn on_readable(&self, data: &[u8]) {
        self.process(data);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAT_REPORT: &str =
        "ver=1.0;src=1;tuner=1,224,1,15,11494.000,h,dvbs2,8psk,off,0.35,22000,23;pids=0,16,17";

    #[test]
    fn parse_satellite_report() {
        let r = parse_reception_report(SAT_REPORT).unwrap();
        assert_eq!(r.class, ReportClass::Sat);
        assert_eq!(r.src_id, 1);
        assert_eq!(r.frontend_id, 1);
        assert_eq!(r.level, 224);
        assert!(r.lock);
        assert_eq!(r.quality, 15);
        assert_eq!(r.tail[0], "11494.000");
        assert_eq!(r.tail[1], "h");
    }

    #[test]
    fn signal_scaling() {
        let r = parse_reception_report(SAT_REPORT).unwrap();
        assert!((r.strength_dbm() - (-25.0)).abs() < 1e-9);
        assert_eq!(r.strength(), 88);
        assert_eq!(r.quality_pct(), 100);
    }

    #[test]
    fn no_signal_level_means_no_dbm() {
        let r =
            parse_reception_report("ver=1.0;src=1;tuner=1,0,0,0,11494.000,h,dvbs2,8psk,off,0.35,22000,23")
                .unwrap();
        assert_eq!(r.strength_dbm(), 0.0);
        assert_eq!(r.quality_pct(), 0, "quality is 0 without lock");
    }

    #[test]
    fn terrestrial_report_has_no_src() {
        let r = parse_reception_report("ver=1.1;tuner=2,128,1,12,506.000,8,dvbt2,32k,64qam,1128,35,0,0,0")
            .unwrap();
        assert_eq!(r.class, ReportClass::Terrestrial);
        assert_eq!(r.src_id, -1);
        assert_eq!(r.frontend_id, 2);
    }

    #[test]
    fn malformed_reports_are_rejected() {
        assert!(parse_reception_report("ver=2.0;tuner=1,2,3,4").is_none());
        assert!(parse_reception_report("ver=1.0;src=1;tuner=1,2").is_none());
        assert!(parse_reception_report("garbage").is_none());
    }

    #[test]
    fn extract_from_app_payload() {
        let mut app = Vec::new();
        app.extend_from_slice(&(SAT_REPORT.len() as u16).to_be_bytes());
        app.extend_from_slice(SAT_REPORT.as_bytes());
        let r = extract_report(&app).unwrap();
        assert_eq!(r.level, 224);
    }
}

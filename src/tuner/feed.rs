//! Shared data path of one tuner.
//!
//! The feed is the meeting point of the receive path (RTP/RTCP dispatched
//! from the poller) and the host-facing side (ring buffer consumer, signal
//! queries, tracked channel descriptor). Receivers only push through the
//! short guarded setters here; the state machine and the host read.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use log::debug;
use parking_lot::Mutex;

use crate::channel::{ChannelDescriptor, PARAM_AUTO};
use crate::config::{trace, SatipConfig};
use crate::params::satip_to_value;
use crate::tuner::buffer::TsRingBuffer;
use crate::tuner::rtcp::{ReceptionReport, ReportClass};
use crate::tuner::section::SectionFilterHub;

/// Signal metrics of one tuner, as last reported by the server.
#[derive(Debug, Clone, Copy)]
pub struct SignalStatus {
    pub has_lock: bool,
    pub strength_dbm: f64,
    /// 0..100, -1 unknown.
    pub strength: i32,
    /// 0..100, -1 unknown.
    pub quality: i32,
    /// Frontend id reported by the server, -1 unknown.
    pub frontend_id: i32,
}

impl Default for SignalStatus {
    fn default() -> Self {
        Self {
            has_lock: false,
            strength_dbm: 0.0,
            strength: -1,
            quality: -1,
            frontend_id: -1,
        }
    }
}

pub struct TunerFeed {
    device_id: usize,
    pub buffer: Arc<TsRingBuffer>,
    pub sections: Arc<SectionFilterHub>,
    dvr_open: AtomicBool,
    bytes_received: AtomicU64,
    signal: Mutex<SignalStatus>,
    last_data: Mutex<Instant>,
    tuned: Mutex<ChannelDescriptor>,
    last_tail: Mutex<Vec<String>>,
}

impl TunerFeed {
    pub fn new(
        device_id: usize,
        buffer: Arc<TsRingBuffer>,
        sections: Arc<SectionFilterHub>,
    ) -> Arc<Self> {
        Arc::new(Self {
            device_id,
            buffer,
            sections,
            dvr_open: AtomicBool::new(false),
            bytes_received: AtomicU64::new(0),
            signal: Mutex::new(SignalStatus::default()),
            last_data: Mutex::new(Instant::now()),
            tuned: Mutex::new(ChannelDescriptor::default()),
            last_tail: Mutex::new(Vec::new()),
        })
    }

    /// Deliver TS payload bytes from the RTP receiver: bulk path into the
    /// ring buffer, section path into the filter hub.
    pub fn write_ts(&self, data: &[u8]) {
        if data.is_empty() {
            return;
        }
        self.mark_data();
        self.bytes_received
            .fetch_add(data.len() as u64, Ordering::Relaxed);
        if self.dvr_open.load(Ordering::Relaxed) {
            self.buffer.write(data);
        }
        self.sections.write(data);
    }

    pub fn set_dvr_open(&self, open: bool) {
        self.dvr_open.store(open, Ordering::Relaxed);
    }

    pub fn is_dvr_open(&self) -> bool {
        self.dvr_open.load(Ordering::Relaxed)
    }

    pub fn bytes_received(&self) -> u64 {
        self.bytes_received.load(Ordering::Relaxed)
    }

    /// Reset the data watchdog; any RTP or RTCP traffic counts as liveness.
    pub fn mark_data(&self) {
        *self.last_data.lock() = Instant::now();
    }

    pub fn millis_since_data(&self) -> u64 {
        self.last_data.lock().elapsed().as_millis() as u64
    }

    pub fn signal(&self) -> SignalStatus {
        *self.signal.lock()
    }

    pub fn has_lock(&self) -> bool {
        self.signal.lock().has_lock
    }

    pub fn reset_signal(&self) {
        *self.signal.lock() = SignalStatus::default();
        self.last_tail.lock().clear();
    }

    /// Pretend-lock values for servers with the ForceLock quirk, which
    /// never report usable reception data.
    pub fn force_lock(&self) {
        let mut signal = self.signal.lock();
        signal.has_lock = true;
        signal.strength_dbm = -25.0;
        signal.strength = 100;
        signal.quality = 100;
    }

    pub fn tuned_channel(&self) -> ChannelDescriptor {
        self.tuned.lock().clone()
    }

    pub fn set_tuned_channel(&self, channel: ChannelDescriptor) {
        *self.tuned.lock() = channel;
        self.last_tail.lock().clear();
    }

    /// Apply a parsed reception report: signal metrics always, descriptor
    /// rewrite only when the transponder tail changed.
    pub fn apply_reception_report(&self, report: &ReceptionReport, config: &SatipConfig) {
        self.mark_data();
        {
            let mut signal = self.signal.lock();
            signal.frontend_id = report.frontend_id;
            signal.strength_dbm = report.strength_dbm();
            signal.strength = report.strength();
            signal.has_lock = report.lock;
            signal.quality = report.quality_pct();
        }

        {
            let mut last = self.last_tail.lock();
            if *last == report.tail {
                return;
            }
            *last = report.tail.clone();
        }
        if config.traces(trace::CHANNEL) {
            debug!(
                "Transponder feedback changed: {:?} [device {}]",
                report.tail, self.device_id
            );
        }

        let mut ch = self.tuned.lock();
        let tail = &report.tail;
        let set = |target: &mut i32, value: i32| {
            if value != PARAM_AUTO {
                *target = value;
            }
        };
        match report.class {
            ReportClass::Sat => {
                // <freq>,<pol>,<system>,<mtype>,<pilots>,<rolloff>,<sr>,<fec>
                if let Ok(f) = tail[0].parse::<f64>() {
                    if f > 0.0 {
                        ch.frequency = f.round() as u32;
                    }
                }
                if let Some(p) = tail[1].chars().next() {
                    ch.polarization = p.to_ascii_lowercase();
                }
                set(&mut ch.system, satip_to_value(&format!("&msys={}", tail[2])));
                set(&mut ch.modulation, satip_to_value(&format!("&mtype={}", tail[3])));
                set(&mut ch.pilots, satip_to_value(&format!("&plts={}", tail[4])));
                set(&mut ch.roll_off, satip_to_value(&format!("&ro={}", tail[5])));
                if let Ok(sr) = tail[6].parse::<u32>() {
                    if sr > 0 {
                        ch.symbol_rate = sr;
                    }
                }
                set(&mut ch.fec, satip_to_value(&format!("&fec={}", tail[7])));
                if let Some(source) = config.source_for_number(report.src_id) {
                    ch.source = source;
                }
            }
            ReportClass::Terrestrial => {
                // <freq>,<bw>,<msys>,<tmode>,<mtype>,<gi>,<fec>,<plp>,<t2id>,<sm>
                if let Ok(f) = tail[0].parse::<f64>() {
                    if f > 0.0 {
                        ch.frequency = f.round() as u32;
                    }
                }
                set(&mut ch.bandwidth, satip_to_value(&format!("&bw={}", tail[1])));
                set(&mut ch.system, satip_to_value(&format!("&msys={}", tail[2])));
                set(&mut ch.transmission, satip_to_value(&format!("&tmode={}", tail[3])));
                set(&mut ch.modulation, satip_to_value(&format!("&mtype={}", tail[4])));
                set(&mut ch.guard, satip_to_value(&format!("&gi={}", tail[5])));
                set(&mut ch.fec, satip_to_value(&format!("&fec={}", tail[6])));
                if let Ok(plp) = tail[7].parse::<i32>() {
                    ch.stream_id = plp;
                }
                if let Ok(t2id) = tail[8].parse::<i32>() {
                    ch.t2_system_id = t2id;
                }
                set(&mut ch.siso_miso, satip_to_value(&format!("&sm={}", tail[9])));
            }
            ReportClass::Cable => {
                // <freq>,<bw>,<msys>,<mtype>,<sr>,<c2tft>,<ds>,<plp>,<specinv>
                if let Ok(f) = tail[0].parse::<f64>() {
                    if f > 0.0 {
                        ch.frequency = f.round() as u32;
                    }
                }
                set(&mut ch.modulation, satip_to_value(&format!("&mtype={}", tail[3])));
                if let Ok(sr) = tail[4].parse::<u32>() {
                    if sr > 0 {
                        ch.symbol_rate = sr;
                    }
                }
                if tail.len() > 8 {
                    if let Ok(inv) = tail[8].parse::<i32>() {
                        ch.inversion = inv;
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::source::Source;
    use crate::tuner::rtcp::parse_reception_report;

    fn feed() -> Arc<TunerFeed> {
        TunerFeed::new(
            0,
            Arc::new(TsRingBuffer::new(188 * 64)),
            Arc::new(SectionFilterHub::new(0)),
        )
    }

    #[test]
    fn ts_bytes_reach_buffer_only_with_dvr_open() {
        let feed = feed();
        feed.write_ts(&[0x47; 188]);
        assert_eq!(feed.buffer.available(), 0);
        feed.set_dvr_open(true);
        feed.write_ts(&[0x47; 188]);
        assert_eq!(feed.buffer.available(), 188);
        assert_eq!(feed.bytes_received(), 376);
    }

    #[test]
    fn report_updates_signal_and_descriptor() {
        let feed = feed();
        let config = SatipConfig::default();
        config.set_sources(vec![Source::parse("S19.2E").unwrap()]);
        let report = parse_reception_report(
            "ver=1.0;src=1;tuner=3,224,1,15,11493.750,v,dvbs2,8psk,off,0.35,22000,23",
        )
        .unwrap();

        feed.apply_reception_report(&report, &config);
        let signal = feed.signal();
        assert!(signal.has_lock);
        assert_eq!(signal.frontend_id, 3);
        assert_eq!(signal.quality, 100);

        let ch = feed.tuned_channel();
        assert_eq!(ch.frequency, 11494);
        assert_eq!(ch.polarization, 'v');
        assert_eq!(ch.system, 1);
        assert_eq!(ch.modulation, 5);
        assert_eq!(ch.fec, 23);
        assert_eq!(ch.source, Source::parse("S19.2E").unwrap());
    }

    #[test]
    fn unmapped_src_leaves_source_untouched() {
        let feed = feed();
        let config = SatipConfig::default();
        let mut ch = ChannelDescriptor::default();
        ch.source = Source::parse("S13E").unwrap();
        feed.set_tuned_channel(ch);

        let report = parse_reception_report(
            "ver=1.0;src=7;tuner=1,128,1,10,11494.000,h,dvbs2,8psk,off,0.35,22000,23",
        )
        .unwrap();
        feed.apply_reception_report(&report, &config);
        assert_eq!(feed.tuned_channel().source, Source::parse("S13E").unwrap());
    }

    #[test]
    fn empty_tail_fields_keep_previous_values() {
        let feed = feed();
        let config = SatipConfig::default();
        let full = parse_reception_report(
            "ver=1.0;src=1;tuner=1,224,1,15,11494.000,h,dvbs2,8psk,off,0.35,22000,23",
        )
        .unwrap();
        feed.apply_reception_report(&full, &config);
        assert_eq!(feed.tuned_channel().symbol_rate, 22000);

        // Sparse follow-up: blank symbol rate and pilots must not clobber
        // the tracked values.
        let sparse = parse_reception_report(
            "ver=1.0;src=1;tuner=1,224,1,15,11494.000,h,dvbs2,8psk,,0.35,,23",
        )
        .unwrap();
        feed.apply_reception_report(&sparse, &config);
        let ch = feed.tuned_channel();
        assert_eq!(ch.symbol_rate, 22000);
        assert_eq!(ch.pilots, 0);
    }
}

//! Abstract channel descriptor handed in by the host receiver.
//!
//! Tuning parameters use the numeric codes common to DVB channel lists:
//! FEC 23 means 2/3, modulation 5 means 8PSK, and the sentinel 999 means
//! "auto / leave unspecified". The parameter translator maps these codes to
//! and from SAT>IP query-string tokens.

use crate::source::Source;

/// Sentinel for "auto / not specified" parameter values.
pub const PARAM_AUTO: i32 = 999;

/// PID bookkeeping for one service.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChannelPids {
    /// Video PID, 0 if radio.
    pub video: u16,
    /// Audio PIDs.
    pub audio: Vec<u16>,
    /// Dolby/AC-3 PIDs.
    pub dolby: Vec<u16>,
    /// PMT PID.
    pub pmt: u16,
    /// Service id.
    pub sid: u16,
    /// Transport stream id.
    pub tsid: u16,
    /// Original network id.
    pub nid: u16,
    /// CA system ids; non-empty means the service is encrypted.
    pub ca_ids: Vec<u16>,
}

impl ChannelPids {
    /// True when the service is encrypted (a real CA system id is present).
    pub fn is_encrypted(&self) -> bool {
        self.ca_ids.iter().any(|&id| id > 0xFF)
    }
}

/// One transponder plus the service PIDs the host wants from it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelDescriptor {
    /// Delivery class and orbital position.
    pub source: Source,
    /// Frequency; Hz, kHz or MHz accepted, normalized by `frequency_mhz`.
    pub frequency: u32,
    /// Symbol rate in kSym/s (DVB-S/C).
    pub symbol_rate: u32,
    /// Polarization: 'h', 'v', 'l' or 'r'.
    pub polarization: char,
    /// 0 = first generation system (S/T/C), 1 = second (S2/T2/C2).
    pub system: i32,
    /// Inner FEC: 12, 23, 34, 35, 45, 56, 67, 78, 89, 910, 0 = none.
    pub fec: i32,
    /// Modulation: 2=QPSK, 5=8PSK, 6=16APSK, 7=32APSK, 10=8VSB, 11=16VSB,
    /// 16/32/64/128/256 = QAM.
    pub modulation: i32,
    /// Roll-off ×100: 20, 25, 35; 0 = auto.
    pub roll_off: i32,
    /// Pilot tones: 0 = off, 1 = on.
    pub pilots: i32,
    /// Bandwidth in MHz: 5, 6, 7, 8, 10 or 1712 (=1.712 MHz).
    pub bandwidth: i32,
    /// Guard interval: 4, 8, 16, 32, 128, 19128, 19256.
    pub guard: i32,
    /// Transmission mode: 1, 2, 4, 8, 16, 32 (k carriers).
    pub transmission: i32,
    /// PLP id (T2/C2), -1 when unused.
    pub stream_id: i32,
    /// T2 system id, -1 when unused.
    pub t2_system_id: i32,
    /// SISO (0) / MISO (1).
    pub siso_miso: i32,
    /// Spectral inversion: 0 = off, 1 = on.
    pub inversion: i32,
    /// Frontend hint carried in the channel's rid field; 0 = none.
    pub rid: i32,
    /// Service PIDs.
    pub pids: ChannelPids,
}

impl Default for ChannelDescriptor {
    fn default() -> Self {
        Self {
            source: Source::NONE,
            frequency: 0,
            symbol_rate: 0,
            polarization: 'h',
            system: 0,
            fec: PARAM_AUTO,
            modulation: PARAM_AUTO,
            roll_off: 0,
            pilots: PARAM_AUTO,
            bandwidth: 8,
            guard: PARAM_AUTO,
            transmission: PARAM_AUTO,
            stream_id: -1,
            t2_system_id: -1,
            siso_miso: 0,
            inversion: PARAM_AUTO,
            rid: 0,
            pids: ChannelPids::default(),
        }
    }
}

impl ChannelDescriptor {
    /// Frequency normalized to MHz regardless of the unit it was given in.
    pub fn frequency_mhz(&self) -> f64 {
        let mut f = self.frequency as f64;
        while f > 20000.0 {
            f /= 1000.0;
        }
        f
    }

    /// Transponder number: the MHz frequency plus a polarization offset for
    /// satellites, so that H/V transponders on the same frequency stay
    /// distinct.
    pub fn transponder(&self) -> i32 {
        let mut t = self.frequency_mhz().round() as i32;
        if self.source.is_sat() {
            t += match self.polarization.to_ascii_lowercase() {
                'h' => 100_000,
                'v' => 200_000,
                'l' => 300_000,
                'r' => 400_000,
                _ => 0,
            };
        }
        t
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frequency_normalization() {
        let mut ch = ChannelDescriptor::default();
        ch.frequency = 11_494_000; // kHz
        assert!((ch.frequency_mhz() - 11494.0).abs() < 1e-9);
        ch.frequency = 11494; // already MHz
        assert!((ch.frequency_mhz() - 11494.0).abs() < 1e-9);
        ch.frequency = 506_000_000; // Hz
        assert!((ch.frequency_mhz() - 506.0).abs() < 1e-9);
    }

    #[test]
    fn transponder_distinguishes_polarization() {
        let mut h = ChannelDescriptor::default();
        h.source = Source::parse("S19.2E").unwrap();
        h.frequency = 11494;
        h.polarization = 'h';
        let mut v = h.clone();
        v.polarization = 'v';
        assert_ne!(h.transponder(), v.transponder());
    }

    #[test]
    fn encryption_flag_ignores_pseudo_ca_ids() {
        let mut pids = ChannelPids::default();
        pids.ca_ids = vec![0x01];
        assert!(!pids.is_encrypted());
        pids.ca_ids = vec![0x1801];
        assert!(pids.is_encrypted());
    }
}

//! Translation between channel descriptors and SAT>IP query parameters.
//!
//! The forward direction builds the RTSP query string for SETUP/PLAY; the
//! reverse direction maps the tokens of an RTCP reception report back to
//! descriptor values. Both directions share one set of mapping tables so
//! that every supported value round-trips.

use crate::channel::{ChannelDescriptor, PARAM_AUTO};

/// One row of a mapping table: descriptor value ↔ query-string token.
/// Rows with an empty token ("auto") are never emitted.
struct ParamMap {
    value: i32,
    satip: &'static str,
}

const BANDWIDTH: &[ParamMap] = &[
    ParamMap { value: 5, satip: "&bw=5" },
    ParamMap { value: 6, satip: "&bw=6" },
    ParamMap { value: 7, satip: "&bw=7" },
    ParamMap { value: 8, satip: "&bw=8" },
    ParamMap { value: 10, satip: "&bw=10" },
    ParamMap { value: 1712, satip: "&bw=1.712" },
];

const PILOTS: &[ParamMap] = &[
    ParamMap { value: 0, satip: "&plts=off" },
    ParamMap { value: 1, satip: "&plts=on" },
    ParamMap { value: PARAM_AUTO, satip: "" },
];

const SISO_MISO: &[ParamMap] = &[
    ParamMap { value: 0, satip: "&sm=0" },
    ParamMap { value: 1, satip: "&sm=1" },
];

const CODE_RATE: &[ParamMap] = &[
    ParamMap { value: 0, satip: "" },
    ParamMap { value: 12, satip: "&fec=12" },
    ParamMap { value: 23, satip: "&fec=23" },
    ParamMap { value: 34, satip: "&fec=34" },
    ParamMap { value: 35, satip: "&fec=35" },
    ParamMap { value: 45, satip: "&fec=45" },
    ParamMap { value: 56, satip: "&fec=56" },
    ParamMap { value: 67, satip: "&fec=67" },
    ParamMap { value: 78, satip: "&fec=78" },
    ParamMap { value: 89, satip: "&fec=89" },
    ParamMap { value: 910, satip: "&fec=910" },
    ParamMap { value: PARAM_AUTO, satip: "" },
];

const MODULATION: &[ParamMap] = &[
    ParamMap { value: 2, satip: "&mtype=qpsk" },
    ParamMap { value: 5, satip: "&mtype=8psk" },
    ParamMap { value: 6, satip: "&mtype=16apsk" },
    ParamMap { value: 7, satip: "&mtype=32apsk" },
    ParamMap { value: 10, satip: "&mtype=8vsb" },
    ParamMap { value: 11, satip: "&mtype=16vsb" },
    ParamMap { value: 16, satip: "&mtype=16qam" },
    ParamMap { value: 64, satip: "&mtype=64qam" },
    ParamMap { value: 128, satip: "&mtype=128qam" },
    ParamMap { value: 256, satip: "&mtype=256qam" },
    ParamMap { value: PARAM_AUTO, satip: "" },
];

const SYSTEM_SAT: &[ParamMap] = &[
    ParamMap { value: 0, satip: "&msys=dvbs" },
    ParamMap { value: 1, satip: "&msys=dvbs2" },
];

const SYSTEM_TERR: &[ParamMap] = &[
    ParamMap { value: 0, satip: "&msys=dvbt" },
    ParamMap { value: 1, satip: "&msys=dvbt2" },
];

const SYSTEM_CABLE: &[ParamMap] = &[
    ParamMap { value: 0, satip: "&msys=dvbc" },
    ParamMap { value: 1, satip: "&msys=dvbc2" },
];

const SYSTEM_ATSC: &[ParamMap] = &[ParamMap { value: 0, satip: "&msys=atsc" }];

const TRANSMISSION: &[ParamMap] = &[
    ParamMap { value: 1, satip: "&tmode=1k" },
    ParamMap { value: 2, satip: "&tmode=2k" },
    ParamMap { value: 4, satip: "&tmode=4k" },
    ParamMap { value: 8, satip: "&tmode=8k" },
    ParamMap { value: 16, satip: "&tmode=16k" },
    ParamMap { value: 32, satip: "&tmode=32k" },
    ParamMap { value: PARAM_AUTO, satip: "" },
];

const GUARD: &[ParamMap] = &[
    ParamMap { value: 4, satip: "&gi=14" },
    ParamMap { value: 8, satip: "&gi=18" },
    ParamMap { value: 16, satip: "&gi=116" },
    ParamMap { value: 32, satip: "&gi=132" },
    ParamMap { value: 128, satip: "&gi=1128" },
    ParamMap { value: 19128, satip: "&gi=19128" },
    ParamMap { value: 19256, satip: "&gi=19256" },
    ParamMap { value: PARAM_AUTO, satip: "" },
];

const ROLL_OFF: &[ParamMap] = &[
    ParamMap { value: 0, satip: "" },
    ParamMap { value: 20, satip: "&ro=0.20" },
    ParamMap { value: 25, satip: "&ro=0.25" },
    ParamMap { value: 35, satip: "&ro=0.35" },
];

const INVERSION: &[ParamMap] = &[
    ParamMap { value: PARAM_AUTO, satip: "" },
    ParamMap { value: 0, satip: "&specinv=0" },
    ParamMap { value: 1, satip: "&specinv=1" },
];

fn url_token(value: i32, table: &[ParamMap]) -> &'static str {
    table
        .iter()
        .find(|m| m.value == value)
        .map(|m| m.satip)
        .unwrap_or("")
}

/// Map a `&name=value` token back to its descriptor value.
///
/// Unknown parameters and unknown values yield the 999 sentinel, which both
/// sides treat as "auto / leave unspecified".
pub fn satip_to_value(param: &str) -> i32 {
    let table: &[ParamMap] = if param.starts_with("&bw=") {
        BANDWIDTH
    } else if param.starts_with("&plts=") {
        PILOTS
    } else if param.starts_with("&sm=") {
        SISO_MISO
    } else if param.starts_with("&fec=") {
        CODE_RATE
    } else if param.starts_with("&mtype=") {
        MODULATION
    } else if param.starts_with("&msys=dvbs") {
        SYSTEM_SAT
    } else if param.starts_with("&msys=dvbt") {
        SYSTEM_TERR
    } else if param.starts_with("&msys=dvbc") {
        SYSTEM_CABLE
    } else if param.starts_with("&msys=atsc") {
        SYSTEM_ATSC
    } else if param.starts_with("&tmode=") {
        TRANSMISSION
    } else if param.starts_with("&gi=") {
        GUARD
    } else if param.starts_with("&ro=") {
        ROLL_OFF
    } else if param.starts_with("&specinv=") {
        INVERSION
    } else {
        return PARAM_AUTO;
    };
    table
        .iter()
        .find(|m| !m.satip.is_empty() && m.satip == param)
        .map(|m| m.value)
        .unwrap_or(PARAM_AUTO)
}

/// Build the SAT>IP query string for a channel.
///
/// `src` is the 1-based signal-source number for satellite channels.
/// Returns `None` when the descriptor carries no usable delivery class.
pub fn transponder_url_params(channel: &ChannelDescriptor, src: i32) -> Option<String> {
    let class = channel.source.class();
    if !matches!(class, 'S' | 'T' | 'C' | 'A') {
        return None;
    }
    let gen2 = channel.system != 0;
    let sat = class == 'S';
    let terr = class == 'T';
    let cable = class == 'C';
    let atsc = class == 'A';

    let mut ch = channel.clone();
    if sat && !gen2 {
        // SAT>IP 1.2.2 §3.5.11 pins these for plain DVB-S URLs.
        ch.pilots = 0;
        ch.modulation = 2;
        ch.roll_off = 35;
    }

    let mut s = String::new();
    let fe = (ch.rid % 100).max(0);
    if fe > 0 {
        s.push_str(&format!("&fe={fe}"));
    }
    if sat {
        let src = if (1..=255).contains(&src) { src } else { 1 };
        s.push_str(&format!("&src={src}"));
    }
    let freq = ch.frequency_mhz();
    if freq > 0.0 {
        s.push_str(&format!("&freq={freq:.3}"));
    }
    if sat {
        s.push_str(&format!("&pol={}", ch.polarization.to_ascii_lowercase()));
        s.push_str(url_token(ch.roll_off, ROLL_OFF));
    }
    if cable && gen2 {
        s.push_str("&c2tft=0");
    }
    if terr || (cable && gen2) {
        s.push_str(url_token(ch.bandwidth, BANDWIDTH));
    }
    if sat {
        s.push_str(url_token(ch.system, SYSTEM_SAT));
    } else if cable {
        s.push_str(url_token(ch.system, SYSTEM_CABLE));
    } else if terr {
        s.push_str(url_token(ch.system, SYSTEM_TERR));
    } else if atsc {
        s.push_str(url_token(ch.system, SYSTEM_ATSC));
    }
    if terr {
        s.push_str(url_token(ch.transmission, TRANSMISSION));
    }
    if sat || terr || atsc || (cable && !gen2) {
        s.push_str(url_token(ch.modulation, MODULATION));
    }
    if sat {
        s.push_str(url_token(ch.pilots, PILOTS));
        s.push_str(&format!("&sr={}", ch.symbol_rate));
    }
    if cable && !gen2 {
        s.push_str(&format!("&sr={}", ch.symbol_rate));
    }
    if terr {
        s.push_str(url_token(ch.guard, GUARD));
    }
    if sat || terr || cable {
        s.push_str(url_token(ch.fec, CODE_RATE));
    }
    if cable && gen2 {
        s.push_str("&ds=0");
        s.push_str(&format!("&plp={}", ch.stream_id));
    }
    if terr && gen2 {
        s.push_str(&format!("&plp={}", ch.stream_id));
        s.push_str(&format!("&t2id={}", ch.t2_system_id));
        s.push_str(url_token(ch.siso_miso, SISO_MISO));
    }
    if (cable && !gen2) || atsc {
        s.push_str(url_token(ch.inversion, INVERSION));
    }

    if s.is_empty() {
        None
    } else {
        Some(s[1..].to_string())
    }
}

/// LNB switch frequency used for the 22 kHz tone bit of `tnr=` strings.
const LNB_SLOF_MHZ: f64 = 11700.0;

/// Build the DVBViewer `tnr=` channel descriptor used by the CiTnr
/// protocol extension.
pub fn tnr_url_params(channel: &ChannelDescriptor) -> String {
    let class = channel.source.class();
    let sat = class == 'S';
    let freq_mhz = channel.frequency_mhz();
    let mut s = String::new();

    // TunerType
    s.push_str(match class {
        'C' => "0,",
        'S' => "1,",
        'T' => "2,",
        'A' => "3,",
        _ => "1,",
    });
    // Frequency: MHz for satellite, kHz otherwise
    if sat {
        s.push_str(&format!("{},", freq_mhz.round() as u32));
    } else {
        s.push_str(&format!("{},", (freq_mhz * 1000.0).round() as u32));
    }
    // Symbol rate in kSym/s, 0 for terrestrial/ATSC
    if sat || class == 'C' {
        s.push_str(&format!("{},", channel.symbol_rate));
    } else {
        s.push_str("0,");
    }
    // LNB switch frequency
    if sat {
        s.push_str(&format!("{},", LNB_SLOF_MHZ as u32));
    } else {
        s.push_str("0,");
    }
    // 22 kHz tone
    if sat && freq_mhz >= LNB_SLOF_MHZ {
        s.push_str("1,");
    } else {
        s.push_str("0,");
    }
    // Polarity byte: polarization (sat), modulation class (cable),
    // bandwidth (terrestrial)
    let polarity = match class {
        'S' => match channel.polarization.to_ascii_lowercase() {
            'v' => 1,
            'l' => 2,
            'r' => 3,
            _ => 0,
        },
        'C' => match channel.modulation {
            16 => 1,
            32 => 2,
            64 => 3,
            128 => 4,
            256 => 5,
            _ => 0,
        },
        'T' => match channel.bandwidth {
            6 => 0,
            7 => 1,
            _ => 2,
        },
        _ => 0,
    };
    s.push_str(&format!("{polarity},"));
    // DiSEqC
    s.push_str("0,");
    // FEC byte
    let fec = if sat {
        match channel.fec {
            12 => 1,
            23 => 2,
            34 => 3,
            56 => 4,
            78 => 5,
            89 => 6,
            35 => 7,
            45 => 8,
            910 => 9,
            _ => 0,
        }
    } else {
        0
    };
    s.push_str(&format!("{fec},"));
    // Audio / video / PMT / service ids
    let audio = channel
        .pids
        .audio
        .first()
        .or(channel.pids.dolby.first())
        .copied()
        .unwrap_or(0);
    s.push_str(&format!("{audio},"));
    s.push_str(&format!("{},", channel.pids.video));
    s.push_str(&format!("{},", channel.pids.pmt));
    s.push_str(&format!("{},", channel.pids.sid));
    // SatModulation byte
    let mut sat_modulation = 0u8;
    if sat && channel.system != 0 {
        let m = match channel.modulation {
            2 => 1,
            5 => 2,
            6 => 3,
            _ => 0,
        };
        sat_modulation |= m & 0x3;
        let r = match channel.roll_off {
            25 => 1,
            20 => 2,
            _ => 0,
        };
        sat_modulation |= (r & 0x3) << 3;
        if channel.pilots == 1 {
            sat_modulation |= 1 << 7;
        }
    }
    sat_modulation |= ((channel.system & 0x1) as u8) << 2;
    let i = match channel.inversion {
        0 => 2,
        1 => 3,
        _ => 1,
    };
    sat_modulation |= (i & 0x3) << 5;
    s.push_str(&format!("{sat_modulation},"));
    // DiSEqCExt
    s.push_str("0,");
    // Flags: encrypted bit only
    if channel.pids.is_encrypted() {
        s.push_str("1,");
    } else {
        s.push_str("0,");
    }
    // ChannelGroup
    s.push_str("0,");
    s.push_str(&format!("{},", channel.pids.tsid));
    s.push_str(&format!("{},", channel.pids.nid));
    // Substream: T2 carries PLP_ID + 1
    if class == 'T' && channel.system != 0 && channel.stream_id >= 0 {
        s.push_str(&format!("{},", channel.stream_id + 1));
    } else {
        s.push_str("0,");
    }
    // Orbital position ×10, shifted so that west positions stay positive
    if sat {
        let pos = channel.source.position() as i32 + 1800;
        s.push_str(&format!("{pos},"));
    } else {
        s.push_str("0,");
    }
    s
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::source::Source;

    fn dvbs2_channel() -> ChannelDescriptor {
        let mut ch = ChannelDescriptor::default();
        ch.source = Source::parse("S19.2E").unwrap();
        ch.frequency = 11494;
        ch.polarization = 'h';
        ch.symbol_rate = 22000;
        ch.system = 1;
        ch.fec = 23;
        ch.modulation = 5;
        ch.roll_off = 35;
        ch.pilots = 0;
        ch
    }

    #[test]
    fn dvbs2_query_string() {
        let ch = dvbs2_channel();
        assert_eq!(
            transponder_url_params(&ch, 1).unwrap(),
            "src=1&freq=11494.000&pol=h&ro=0.35&msys=dvbs2&mtype=8psk&plts=off&sr=22000&fec=23"
        );
    }

    #[test]
    fn dvbs_pins_pilot_modulation_rolloff() {
        let mut ch = dvbs2_channel();
        ch.system = 0;
        ch.modulation = 5;
        ch.pilots = 1;
        ch.roll_off = 20;
        let q = transponder_url_params(&ch, 1).unwrap();
        assert!(q.contains("msys=dvbs&"));
        assert!(q.contains("mtype=qpsk"));
        assert!(q.contains("plts=off"));
        assert!(q.contains("ro=0.35"));
    }

    #[test]
    fn dvbt2_query_string() {
        let mut ch = ChannelDescriptor::default();
        ch.source = Source::parse("T").unwrap();
        ch.frequency = 506_000_000;
        ch.system = 1;
        ch.bandwidth = 8;
        ch.modulation = 64;
        ch.transmission = 32;
        ch.guard = 128;
        ch.fec = 35;
        ch.stream_id = 0;
        ch.t2_system_id = 0;
        let q = transponder_url_params(&ch, 0).unwrap();
        assert_eq!(
            q,
            "freq=506.000&bw=8&msys=dvbt2&tmode=32k&mtype=64qam&gi=1128&fec=35&plp=0&t2id=0&sm=0"
        );
    }

    #[test]
    fn out_of_range_src_falls_back_to_one() {
        let ch = dvbs2_channel();
        assert!(transponder_url_params(&ch, 0).unwrap().starts_with("src=1&"));
        assert!(transponder_url_params(&ch, 300).unwrap().starts_with("src=1&"));
    }

    #[test]
    fn round_trip_all_tables() {
        let tables: &[&[ParamMap]] = &[
            BANDWIDTH,
            PILOTS,
            SISO_MISO,
            CODE_RATE,
            MODULATION,
            SYSTEM_SAT,
            SYSTEM_TERR,
            SYSTEM_CABLE,
            SYSTEM_ATSC,
            TRANSMISSION,
            GUARD,
            ROLL_OFF,
            INVERSION,
        ];
        for table in tables {
            for row in table.iter().filter(|m| !m.satip.is_empty()) {
                assert_eq!(satip_to_value(row.satip), row.value, "token {}", row.satip);
            }
        }
    }

    #[test]
    fn unknown_token_is_auto() {
        assert_eq!(satip_to_value("&msys=dvbs3"), PARAM_AUTO);
        assert_eq!(satip_to_value("&nosuch=1"), PARAM_AUTO);
        assert_eq!(satip_to_value("&fec="), PARAM_AUTO);
    }
}

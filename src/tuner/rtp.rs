//! RTP receiver: strips RFC 3550 headers off incoming datagrams and feeds
//! the MPEG-TS payload to the tuner.
//!
//! Sequence gaps are counted but not reordered; SAT>IP transports MPEG-TS
//! and the downstream demux tolerates loss better than latency.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use log::debug;
use parking_lot::Mutex;

use crate::config::{trace, SatipConfig};
use crate::poller::PollSink;
use crate::tuner::feed::TunerFeed;

/// Fixed part of the RTP header.
const RTP_HEADER_LEN: usize = 12;

pub struct RtpReceiver {
    feed: Arc<TunerFeed>,
    config: Arc<SatipConfig>,
    packets: AtomicU64,
    lost: AtomicU64,
    decode_errors: AtomicU64,
    last_seq: Mutex<Option<u16>>,
}

impl RtpReceiver {
    pub fn new(feed: Arc<TunerFeed>, config: Arc<SatipConfig>) -> Arc<Self> {
        Arc::new(Self {
            feed,
            config,
            packets: AtomicU64::new(0),
            lost: AtomicU64::new(0),
            decode_errors: AtomicU64::new(0),
            last_seq: Mutex::new(None),
        })
    }

    /// Process one RTP packet (a UDP datagram or an interleaved frame).
    pub fn process(&self, data: &[u8]) {
        let Some(payload) = self.parse(data) else {
            self.decode_errors.fetch_add(1, Ordering::Relaxed);
            return;
        };
        self.packets.fetch_add(1, Ordering::Relaxed);
        self.feed.write_ts(payload);
    }

    fn parse<'a>(&self, data: &'a [u8]) -> Option<&'a [u8]> {
        if data.len() < RTP_HEADER_LEN {
            return None;
        }
        let version = data[0] >> 6;
        if version != 2 {
            return None;
        }
        let padding = data[0] & 0x20 != 0;
        let extension = data[0] & 0x10 != 0;
        let csrc_count = (data[0] & 0x0F) as usize;
        let seq = u16::from_be_bytes([data[2], data[3]]);

        {
            let mut last = self.last_seq.lock();
            if let Some(last_seq) = *last {
                let gap = seq.wrapping_sub(last_seq.wrapping_add(1));
                if gap > 0 && gap < 0x8000 {
                    self.lost.fetch_add(gap as u64, Ordering::Relaxed);
                    if self.config.traces(trace::RTP) {
                        debug!("RTP sequence jump: {last_seq} -> {seq}, {gap} lost");
                    }
                }
            }
            *last = Some(seq);
        }

        let mut offset = RTP_HEADER_LEN + csrc_count * 4;
        if extension {
            if data.len() < offset + 4 {
                return None;
            }
            let ext_words = u16::from_be_bytes([data[offset + 2], data[offset + 3]]) as usize;
            offset += 4 + ext_words * 4;
        }
        let mut end = data.len();
        if padding {
            let pad = *data.last()? as usize;
            if pad == 0 || offset + pad > end {
                return None;
            }
            end -= pad;
        }
        if offset > end {
            return None;
        }
        Some(&data[offset..end])
    }

    /// Forget the last sequence number; used across session changes.
    pub fn reset(&self) {
        *self.last_seq.lock() = None;
    }

    pub fn packets(&self) -> u64 {
        self.packets.load(Ordering::Relaxed)
    }

    pub fn lost(&self) -> u64 {
        self.lost.load(Ordering::Relaxed)
    }

    pub fn decode_errors(&self) -> u64 {
        self.decode_errors.load(Ordering::Relaxed)
    }
}

impl PollSink for RtpReceiver {
    fn on_readable(&self, data: &[u8]) {
        self.process(data);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tuner::buffer::TsRingBuffer;
    use crate::tuner::section::SectionFilterHub;

    fn receiver() -> (Arc<RtpReceiver>, Arc<TunerFeed>) {
        let feed = TunerFeed::new(
            0,
            Arc::new(TsRingBuffer::new(188 * 64)),
            Arc::new(SectionFilterHub::new(0)),
        );
        feed.set_dvr_open(true);
        let rtp = RtpReceiver::new(Arc::clone(&feed), Arc::new(SatipConfig::default()));
        (rtp, feed)
    }

    fn rtp_packet(seq: u16, payload: &[u8]) -> Vec<u8> {
        let mut p = vec![0u8; RTP_HEADER_LEN];
        p[0] = 0x80; // version 2
        p[1] = 33; // MP2T
        p[2..4].copy_from_slice(&seq.to_be_bytes());
        p.extend_from_slice(payload);
        p
    }

    #[test]
    fn payload_lands_in_ring_buffer() {
        let (rtp, feed) = receiver();
        let ts = vec![0x47u8; 188 * 7];
        rtp.process(&rtp_packet(1, &ts));
        assert_eq!(feed.buffer.available(), ts.len());
        assert_eq!(rtp.packets(), 1);
    }

    #[test]
    fn sequence_jump_counts_lost_packets() {
        let (rtp, feed) = receiver();
        let ts = vec![0x47u8; 188];
        rtp.process(&rtp_packet(10, &ts));
        rtp.process(&rtp_packet(15, &ts)); // jump of 5: 4 lost
        assert_eq!(rtp.lost(), 4);
        // The buffer still carries exactly the two delivered payloads.
        assert_eq!(feed.buffer.available(), 2 * 188);
        assert_eq!(feed.buffer.read(188)[0], 0x47);
    }

    #[test]
    fn sequence_wraparound_is_not_a_gap() {
        let (rtp, _) = receiver();
        rtp.process(&rtp_packet(u16::MAX, &[0x47; 188]));
        rtp.process(&rtp_packet(0, &[0x47; 188]));
        assert_eq!(rtp.lost(), 0);
    }

    #[test]
    fn csrc_and_padding_are_skipped() {
        let (rtp, feed) = receiver();
        let mut p = vec![0u8; RTP_HEADER_LEN + 8];
        p[0] = 0x80 | 0x20 | 2; // version 2, padding, 2 CSRCs
        p[1] = 33;
        p[2..4].copy_from_slice(&7u16.to_be_bytes());
        p.extend_from_slice(&[0x47; 188]);
        p.extend_from_slice(&[0, 0, 0, 4]); // 4 padding bytes
        rtp.process(&p);
        assert_eq!(feed.buffer.available(), 188);
    }

    #[test]
    fn malformed_packets_count_decode_errors() {
        let (rtp, feed) = receiver();
        rtp.process(&[0x80, 33, 0]); // truncated
        let mut bad_version = rtp_packet(1, &[0x47; 188]);
        bad_version[0] = 0x40;
        rtp.process(&bad_version);
        assert_eq!(rtp.decode_errors(), 2);
        assert_eq!(feed.buffer.available(), 0);
    }
}

//! Section filter hub: peels DVB/PSI sections out of the bulk TS stream.
//!
//! Filters are keyed by (pid, tid, mask). Section payloads are reassembled
//! across TS packet boundaries honouring the payload_unit_start_indicator
//! and the continuity counter, then matched against `(tid & mask)` and
//! delivered to the filter's channel.

use log::{debug, info};
use parking_lot::Mutex;
use tokio::sync::mpsc;

use crate::tuner::buffer::{TS_PACKET_SIZE, TS_SYNC_BYTE};

/// Maximum number of concurrently open filters per tuner.
const MAX_FILTERS: usize = 32;

/// Reassembles sections for one PID.
#[derive(Default)]
struct SectionCollector {
    buffer: Vec<u8>,
    last_cc: Option<u8>,
    active: bool,
}

impl SectionCollector {
    fn reset(&mut self) {
        self.buffer.clear();
        self.active = false;
    }

    /// Feed one TS payload; complete sections are pushed to `out`.
    fn add(&mut self, payload: &[u8], payload_unit_start: bool, cc: u8, out: &mut Vec<Vec<u8>>) {
        if let Some(last) = self.last_cc {
            if cc != (last + 1) & 0x0F && !payload_unit_start {
                self.reset();
            }
        }
        self.last_cc = Some(cc);

        if payload_unit_start {
            if payload.is_empty() {
                return;
            }
            let pointer = payload[0] as usize;
            // Bytes before the pointer target finish the previous section.
            if self.active && pointer > 0 && pointer < payload.len() {
                self.buffer.extend_from_slice(&payload[1..=pointer]);
                self.drain(out);
            }
            self.buffer.clear();
            self.active = true;
            if pointer + 1 <= payload.len() {
                self.buffer.extend_from_slice(&payload[pointer + 1..]);
            }
        } else if self.active {
            self.buffer.extend_from_slice(payload);
        } else {
            return;
        }

        self.drain(out);
    }

    fn drain(&mut self, out: &mut Vec<Vec<u8>>) {
        loop {
            if self.buffer.len() < 3 {
                return;
            }
            if self.buffer[0] == 0xFF {
                // Stuffing: nothing more in this payload unit.
                self.reset();
                return;
            }
            let section_length =
                (((self.buffer[1] as usize & 0x0F) << 8) | self.buffer[2] as usize) + 3;
            if self.buffer.len() < section_length {
                return;
            }
            out.push(self.buffer[..section_length].to_vec());
            self.buffer.drain(..section_length);
        }
    }
}

struct FilterSlot {
    pid: u16,
    tid: u8,
    mask: u8,
    collector: SectionCollector,
    tx: mpsc::UnboundedSender<Vec<u8>>,
}

struct HubInner {
    filters: Vec<Option<FilterSlot>>,
}

/// Per-tuner demultiplexer feeding host section filters.
pub struct SectionFilterHub {
    device_id: usize,
    inner: Mutex<HubInner>,
}

impl SectionFilterHub {
    pub fn new(device_id: usize) -> Self {
        Self {
            device_id,
            inner: Mutex::new(HubInner {
                filters: (0..MAX_FILTERS).map(|_| None).collect(),
            }),
        }
    }

    /// Open a filter; returns the handle and the section stream, or `None`
    /// when all filter slots are busy.
    pub fn open(
        &self,
        pid: u16,
        tid: u8,
        mask: u8,
    ) -> Option<(usize, mpsc::UnboundedReceiver<Vec<u8>>)> {
        let mut inner = self.inner.lock();
        let slot = inner.filters.iter().position(|f| f.is_none())?;
        let (tx, rx) = mpsc::unbounded_channel();
        inner.filters[slot] = Some(FilterSlot {
            pid,
            tid,
            mask,
            collector: SectionCollector::default(),
            tx,
        });
        debug!(
            "Opened section filter {slot} pid={pid} tid={tid:#04x} mask={mask:#04x} [device {}]",
            self.device_id
        );
        Some((slot, rx))
    }

    /// Close a filter; returns its PID so the caller can drop the PID
    /// subscription when nothing else uses it.
    pub fn close(&self, handle: usize) -> Option<u16> {
        let mut inner = self.inner.lock();
        let pid = inner.filters.get_mut(handle)?.take().map(|f| f.pid);
        if let Some(pid) = pid {
            debug!(
                "Closed section filter {handle} pid={pid} [device {}]",
                self.device_id
            );
        }
        pid
    }

    /// True while any open filter subscribes to this PID.
    pub fn uses_pid(&self, pid: u16) -> bool {
        self.inner
            .lock()
            .filters
            .iter()
            .flatten()
            .any(|f| f.pid == pid)
    }

    /// Feed TS bytes; packets on registered PIDs are demultiplexed into
    /// sections and matched against the filters.
    pub fn write(&self, data: &[u8]) {
        let mut inner = self.inner.lock();
        let mut sections = Vec::new();
        for packet in data.chunks_exact(TS_PACKET_SIZE) {
            if packet[0] != TS_SYNC_BYTE {
                continue;
            }
            let pid = ((packet[1] as u16 & 0x1F) << 8) | packet[2] as u16;
            let payload_unit_start = packet[1] & 0x40 != 0;
            let adaptation = (packet[3] >> 4) & 0x03;
            let cc = packet[3] & 0x0F;
            if adaptation & 0x01 == 0 {
                continue;
            }
            let payload_offset = if adaptation & 0x02 != 0 {
                5 + packet[4] as usize
            } else {
                4
            };
            if payload_offset >= TS_PACKET_SIZE {
                continue;
            }
            let payload = &packet[payload_offset..];

            for filter in inner.filters.iter_mut().flatten() {
                if filter.pid != pid {
                    continue;
                }
                sections.clear();
                filter
                    .collector
                    .add(payload, payload_unit_start, cc, &mut sections);
                for section in sections.drain(..) {
                    if (section[0] ^ filter.tid) & filter.mask == 0 {
                        // Receiver gone: the host closed its end without
                        // closing the filter; drop silently.
                        let _ = filter.tx.send(section);
                    }
                }
            }
        }
    }

    /// Diagnostic listing for the INFO command.
    pub fn information(&self) -> String {
        let inner = self.inner.lock();
        let mut s = String::new();
        for (i, filter) in inner.filters.iter().enumerate() {
            if let Some(f) = filter {
                s.push_str(&format!(
                    "{:2}: pid={:4} tid={:#04x} mask={:#04x}\n",
                    i, f.pid, f.tid, f.mask
                ));
            }
        }
        if s.is_empty() {
            s.push_str("none\n");
        }
        s
    }

    pub fn close_all(&self) {
        let mut inner = self.inner.lock();
        let n = inner.filters.iter_mut().filter_map(Option::take).count();
        if n > 0 {
            info!("Closed {n} section filters [device {}]", self.device_id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Build one TS packet with the given pid/cc carrying `payload` after a
    /// pointer field.
    fn ts_packet(pid: u16, cc: u8, pusi: bool, payload: &[u8]) -> Vec<u8> {
        let mut p = vec![0xFFu8; TS_PACKET_SIZE];
        p[0] = TS_SYNC_BYTE;
        p[1] = ((pid >> 8) as u8 & 0x1F) | if pusi { 0x40 } else { 0 };
        p[2] = pid as u8;
        p[3] = 0x10 | (cc & 0x0F);
        let mut off = 4;
        if pusi {
            p[off] = 0; // pointer field
            off += 1;
        }
        p[off..off + payload.len()].copy_from_slice(payload);
        p
    }

    /// Minimal section: tid, syntax=0, length covering `body`.
    fn section(tid: u8, body: &[u8]) -> Vec<u8> {
        let mut s = vec![tid, 0x30, body.len() as u8];
        s[1] |= ((body.len() >> 8) as u8) & 0x0F;
        s.extend_from_slice(body);
        s
    }

    #[test]
    fn single_packet_section_is_delivered() {
        let hub = SectionFilterHub::new(0);
        let (_handle, mut rx) = hub.open(0x12, 0x4E, 0xFF).unwrap();

        let sec = section(0x4E, &[1, 2, 3, 4]);
        hub.write(&ts_packet(0x12, 0, true, &sec));

        let got = rx.try_recv().unwrap();
        assert_eq!(got, sec);
    }

    #[test]
    fn tid_mask_filters_sections() {
        let hub = SectionFilterHub::new(0);
        let (_handle, mut rx) = hub.open(0x12, 0x40, 0xF0).unwrap();

        hub.write(&ts_packet(0x12, 0, true, &section(0x4E, &[0; 4])));
        assert!(rx.try_recv().is_ok(), "0x4E matches 0x40/0xF0");

        hub.write(&ts_packet(0x12, 1, true, &section(0x50, &[0; 4])));
        assert!(rx.try_recv().is_err(), "0x50 does not match 0x40/0xF0");
    }

    #[test]
    fn section_spanning_two_packets() {
        let hub = SectionFilterHub::new(0);
        let (_handle, mut rx) = hub.open(0x10, 0x42, 0xFF).unwrap();

        let body: Vec<u8> = (0..200).map(|i| i as u8).collect();
        let sec = section(0x42, &body);
        let first = &sec[..182]; // 183 payload bytes incl. pointer
        let rest = &sec[182..];

        hub.write(&ts_packet(0x10, 0, true, first));
        assert!(rx.try_recv().is_err(), "incomplete after first packet");
        hub.write(&ts_packet(0x10, 1, false, rest));
        assert_eq!(rx.try_recv().unwrap(), sec);
    }

    #[test]
    fn continuity_break_discards_partial_section() {
        let hub = SectionFilterHub::new(0);
        let (_handle, mut rx) = hub.open(0x10, 0x42, 0xFF).unwrap();

        let body: Vec<u8> = (0..200).map(|i| i as u8).collect();
        let sec = section(0x42, &body);
        hub.write(&ts_packet(0x10, 0, true, &sec[..182]));
        // cc jumps from 0 to 2: the continuation must be dropped
        hub.write(&ts_packet(0x10, 2, false, &sec[182..]));
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn pid_usage_tracking() {
        let hub = SectionFilterHub::new(0);
        let (a, _rx_a) = hub.open(0x11, 0x00, 0x00).unwrap();
        let (b, _rx_b) = hub.open(0x11, 0x02, 0xFF).unwrap();
        assert!(hub.uses_pid(0x11));
        assert_eq!(hub.close(a), Some(0x11));
        assert!(hub.uses_pid(0x11), "second filter still holds the pid");
        assert_eq!(hub.close(b), Some(0x11));
        assert!(!hub.uses_pid(0x11));
    }
}

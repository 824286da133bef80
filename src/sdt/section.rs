//! DVB section parsing over raw MPEG-TS
//!
//! Walks 188-byte TS packets, reassembles PSI sections for the PAT, SDT
//! (PID 0x11) and EIT (PID 0x12) and extracts the service identity bundle
//! for the service carried by the stream. ITU-T H.222.0 / ETSI EN 300 468.

use byteorder::{BigEndian, ByteOrder};
use chrono::{DateTime, Utc};

use crate::catalog::SdtIdentity;

pub const TS_PACKET_SIZE: usize = 188;
const TS_SYNC_BYTE: u8 = 0x47;

const PAT_PID: u16 = 0x0000;
const SDT_PID: u16 = 0x0011;
const EIT_PID: u16 = 0x0012;

const TABLE_ID_PAT: u8 = 0x00;
const TABLE_ID_SDT_ACTUAL: u8 = 0x42;
const TABLE_ID_EIT_PF_ACTUAL: u8 = 0x4E;

const DESC_SERVICE: u8 = 0x48;
const DESC_SHORT_EVENT: u8 = 0x4D;

/// MPEG-2 CRC32 (poly 0x04C11DB7, MSB first, init 0xFFFFFFFF, no reflection).
pub fn gen_crc32(data: &[u8]) -> u32 {
    let mut crc: u32 = 0xFFFF_FFFF;
    for &byte in data {
        crc ^= (byte as u32) << 24;
        for _ in 0..8 {
            if crc & 0x8000_0000 != 0 {
                crc = (crc << 1) ^ 0x04C1_1DB7;
            } else {
                crc <<= 1;
            }
        }
    }
    crc
}

/// One parsed SDT service row.
#[derive(Debug, Clone, PartialEq)]
pub struct SdtService {
    pub sid: u16,
    pub eit_schedule: bool,
    pub eit_present_following: bool,
    pub provider_name: String,
    pub service_name: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SdtTable {
    pub tsid: u16,
    pub onid: u16,
    pub services: Vec<SdtService>,
}

/// Reassembles PSI sections for one PID out of TS packet payloads.
#[derive(Debug, Default)]
struct SectionCollector {
    buffer: Vec<u8>,
    started: bool,
    sections: Vec<Vec<u8>>,
}

impl SectionCollector {
    fn expected_len(&self) -> Option<usize> {
        if self.buffer.len() < 3 {
            return None;
        }
        let section_length = ((self.buffer[1] as usize & 0x0F) << 8) | self.buffer[2] as usize;
        Some(section_length + 3)
    }

    fn push_payload(&mut self, payload: &[u8], unit_start: bool) {
        let data = if unit_start {
            if payload.is_empty() {
                return;
            }
            let pointer = payload[0] as usize;
            // A unit start may first close out the previous section
            if self.started && pointer > 0 && 1 + pointer <= payload.len() {
                self.buffer.extend_from_slice(&payload[1..1 + pointer]);
                self.try_complete();
            }
            self.buffer.clear();
            self.started = true;
            match payload.get(1 + pointer..) {
                Some(rest) => rest,
                None => return,
            }
        } else {
            if !self.started {
                return;
            }
            payload
        };

        self.buffer.extend_from_slice(data);
        self.try_complete();
    }

    fn try_complete(&mut self) {
        while let Some(expected) = self.expected_len() {
            if self.buffer.len() < expected {
                return;
            }
            // 0xFF stuffing marks the end of useful sections in this packet
            if self.buffer[0] == 0xFF {
                self.buffer.clear();
                self.started = false;
                return;
            }
            let section: Vec<u8> = self.buffer.drain(..expected).collect();
            self.sections.push(section);
        }
    }
}

/// Split a TS capture into per-PID PSI sections.
fn collect_sections(ts: &[u8], pids: &[u16]) -> Vec<(u16, Vec<Vec<u8>>)> {
    let mut collectors: Vec<(u16, SectionCollector)> = pids
        .iter()
        .map(|&pid| (pid, SectionCollector::default()))
        .collect();

    let mut offset = 0;
    while offset + TS_PACKET_SIZE <= ts.len() {
        let packet = &ts[offset..offset + TS_PACKET_SIZE];
        offset += TS_PACKET_SIZE;

        if packet[0] != TS_SYNC_BYTE {
            // resync on the next 0x47
            if let Some(next) = ts[offset - TS_PACKET_SIZE + 1..]
                .iter()
                .position(|&b| b == TS_SYNC_BYTE)
            {
                offset = offset - TS_PACKET_SIZE + 1 + next;
            }
            continue;
        }

        let pid = BigEndian::read_u16(&packet[1..3]) & 0x1FFF;
        let unit_start = packet[1] & 0x40 != 0;
        let adaptation = (packet[3] >> 4) & 0x03;

        let mut payload_start = 4;
        if adaptation == 2 {
            continue; // adaptation field only, no payload
        }
        if adaptation == 3 {
            let af_len = packet[4] as usize;
            payload_start = 5 + af_len;
            if payload_start >= TS_PACKET_SIZE {
                continue;
            }
        }

        if let Some((_, collector)) = collectors.iter_mut().find(|(p, _)| *p == pid) {
            collector.push_payload(&packet[payload_start..], unit_start);
        }
    }

    collectors
        .into_iter()
        .map(|(pid, c)| (pid, c.sections))
        .collect()
}

fn crc_ok(section: &[u8]) -> bool {
    if section.len() < 4 {
        return false;
    }
    let (body, crc_bytes) = section.split_at(section.len() - 4);
    gen_crc32(body) == BigEndian::read_u32(crc_bytes)
}

/// DVB text decoding: an optional leading charset byte (< 0x20) is dropped,
/// the rest is treated as Latin-1 with C1 controls filtered.
pub fn decode_dvb_text(raw: &[u8]) -> String {
    let data = match raw.first() {
        Some(&b) if b < 0x20 => &raw[1..],
        _ => raw,
    };
    data.iter()
        .filter(|&&b| !(0x80..=0x9F).contains(&b) && b != 0)
        .map(|&b| b as char)
        .collect::<String>()
        .trim()
        .to_string()
}

/// Program numbers from a PAT section (network PID entries excluded).
fn parse_pat(section: &[u8]) -> Vec<u16> {
    if section.len() < 12 || section[0] != TABLE_ID_PAT || !crc_ok(section) {
        return vec![];
    }
    let mut programs = vec![];
    let mut pos = 8;
    while pos + 4 <= section.len() - 4 {
        let program_number = BigEndian::read_u16(&section[pos..pos + 2]);
        if program_number != 0 {
            programs.push(program_number);
        }
        pos += 4;
    }
    programs
}

/// Parse an SDT-actual section into its service rows.
pub fn parse_sdt(section: &[u8]) -> Option<SdtTable> {
    if section.len() < 15 || section[0] != TABLE_ID_SDT_ACTUAL || !crc_ok(section) {
        return None;
    }

    let tsid = BigEndian::read_u16(&section[3..5]);
    let onid = BigEndian::read_u16(&section[8..10]);
    let end = section.len() - 4; // CRC

    let mut services = vec![];
    let mut pos = 11;
    while pos + 5 <= end {
        let sid = BigEndian::read_u16(&section[pos..pos + 2]);
        let eit_schedule = section[pos + 2] & 0x02 != 0;
        let eit_present_following = section[pos + 2] & 0x01 != 0;
        let desc_loop_len = ((section[pos + 3] as usize & 0x0F) << 8) | section[pos + 4] as usize;
        pos += 5;

        let desc_end = (pos + desc_loop_len).min(end);
        let mut provider_name = String::new();
        let mut service_name = String::new();

        let mut dpos = pos;
        while dpos + 2 <= desc_end {
            let tag = section[dpos];
            let len = section[dpos + 1] as usize;
            let body_end = (dpos + 2 + len).min(desc_end);
            if tag == DESC_SERVICE && dpos + 3 < body_end {
                // service_type(1), provider_name_length, provider_name, ...
                let body = &section[dpos + 2..body_end];
                if body.len() >= 2 {
                    let plen = body[1] as usize;
                    if 2 + plen < body.len() {
                        provider_name = decode_dvb_text(&body[2..2 + plen]);
                        let slen = body[2 + plen] as usize;
                        let sstart = 3 + plen;
                        if sstart + slen <= body.len() {
                            service_name = decode_dvb_text(&body[sstart..sstart + slen]);
                        }
                    }
                }
            }
            dpos += 2 + len;
        }

        services.push(SdtService {
            sid,
            eit_schedule,
            eit_present_following,
            provider_name,
            service_name,
        });
        pos = desc_end;
    }

    Some(SdtTable { tsid, onid, services })
}

/// Event title from an EIT present/following section, keyed by service.
/// Section number 0 carries "now", 1 carries "next".
fn parse_eit_title(section: &[u8]) -> Option<(u16, u8, String)> {
    if section.len() < 18 || section[0] != TABLE_ID_EIT_PF_ACTUAL || !crc_ok(section) {
        return None;
    }
    let sid = BigEndian::read_u16(&section[3..5]);
    let section_number = section[6];
    let end = section.len() - 4;

    // One event per p/f section: event_id(2) start(5) duration(3) status+loop(2)
    let mut pos = 14;
    if pos + 12 > end {
        return None;
    }
    let desc_loop_len = ((section[pos + 10] as usize & 0x0F) << 8) | section[pos + 11] as usize;
    pos += 12;
    let desc_end = (pos + desc_loop_len).min(end);

    while pos + 2 <= desc_end {
        let tag = section[pos];
        let len = section[pos + 1] as usize;
        let body_end = (pos + 2 + len).min(desc_end);
        if tag == DESC_SHORT_EVENT {
            let body = &section[pos + 2..body_end];
            // language(3), event_name_length, event_name, ...
            if body.len() >= 4 {
                let nlen = body[3] as usize;
                if 4 + nlen <= body.len() {
                    let title = decode_dvb_text(&body[4..4 + nlen]);
                    if !title.is_empty() {
                        return Some((sid, section_number, title));
                    }
                }
            }
        }
        pos += 2 + len;
    }
    None
}

/// Extract the DVB identity bundle for the service carried by a TS capture.
///
/// The service is chosen by matching SDT rows against the PAT's program
/// numbers; a capture without a usable PAT falls back to the first SDT row.
pub fn extract_identity(ts: &[u8], probed_at: DateTime<Utc>) -> Option<SdtIdentity> {
    let sections = collect_sections(ts, &[PAT_PID, SDT_PID, EIT_PID]);

    let mut programs: Vec<u16> = vec![];
    let mut sdt: Option<SdtTable> = None;
    let mut now_titles: Vec<(u16, String)> = vec![];
    let mut next_titles: Vec<(u16, String)> = vec![];

    for (pid, pid_sections) in &sections {
        for section in pid_sections {
            match *pid {
                PAT_PID => programs.extend(parse_pat(section)),
                SDT_PID => {
                    if sdt.is_none() {
                        sdt = parse_sdt(section);
                    }
                }
                EIT_PID => {
                    if let Some((sid, number, title)) = parse_eit_title(section) {
                        match number {
                            0 => now_titles.push((sid, title)),
                            1 => next_titles.push((sid, title)),
                            _ => {}
                        }
                    }
                }
                _ => {}
            }
        }
    }

    let sdt = sdt?;
    let service = sdt
        .services
        .iter()
        .find(|s| programs.contains(&s.sid))
        .or_else(|| sdt.services.first())?;

    let title_for = |titles: &[(u16, String)]| {
        titles
            .iter()
            .find(|(sid, _)| *sid == service.sid)
            .map(|(_, t)| t.clone())
    };

    Some(SdtIdentity {
        onid: sdt.onid,
        tsid: sdt.tsid,
        sid: service.sid,
        provider_name: service.provider_name.clone(),
        service_name: service.service_name.clone(),
        eit_schedule: service.eit_schedule,
        eit_present_following: service.eit_present_following,
        now_title: title_for(&now_titles),
        next_title: title_for(&next_titles),
        probed_at,
    })
}

//! HDHomeRun network protocol (UDP/TCP 65001)
//!
//! Wire-level discovery and control compatible with real HDHomeRun devices:
//! frames are 2-byte type, 2-byte big-endian length, TLV payload (1-byte
//! tag, varint length) and a trailing IEEE CRC32 stored little-endian.
//!
//! Only one instance in a multi-child process may claim these ports. The
//! control surface answers `get` for the device properties Plex touches;
//! `set` is answered with an error record.

use byteorder::{BigEndian, ByteOrder, LittleEndian};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, UdpSocket};
use tokio::sync::watch;
use tracing::{debug, info, warn};

use super::hdhr;
use super::state::AppState;

pub const HDHR_PORT: u16 = 65001;

// Frame types
pub const TYPE_DISCOVER_REQ: u16 = 0x0002;
pub const TYPE_DISCOVER_RPY: u16 = 0x0003;
pub const TYPE_GETSET_REQ: u16 = 0x0004;
pub const TYPE_GETSET_RPY: u16 = 0x0005;

// TLV tags
pub const TAG_DEVICE_TYPE: u8 = 0x01;
pub const TAG_DEVICE_ID: u8 = 0x02;
pub const TAG_GETSET_NAME: u8 = 0x03;
pub const TAG_GETSET_VALUE: u8 = 0x04;
pub const TAG_ERROR_MESSAGE: u8 = 0x05;
pub const TAG_TUNER_COUNT: u8 = 0x10;
pub const TAG_LINEUP_URL: u8 = 0x27;
pub const TAG_BASE_URL: u8 = 0x2A;

pub const DEVICE_TYPE_TUNER: u32 = 0x0000_0001;
pub const DEVICE_TYPE_WILDCARD: u32 = 0xFFFF_FFFF;
pub const DEVICE_ID_WILDCARD: u32 = 0xFFFF_FFFF;

/// Reflected IEEE CRC32 (the zlib polynomial), as the hardware computes it.
pub fn crc32_ieee(data: &[u8]) -> u32 {
    let mut crc: u32 = 0xFFFF_FFFF;
    for &byte in data {
        crc ^= byte as u32;
        for _ in 0..8 {
            if crc & 1 != 0 {
                crc = (crc >> 1) ^ 0xEDB8_8320;
            } else {
                crc >>= 1;
            }
        }
    }
    !crc
}

/// Frame a payload: type, length, payload, little-endian CRC over the rest.
pub fn encode_frame(frame_type: u16, payload: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(payload.len() + 8);
    out.extend_from_slice(&frame_type.to_be_bytes());
    out.extend_from_slice(&(payload.len() as u16).to_be_bytes());
    out.extend_from_slice(payload);
    let crc = crc32_ieee(&out);
    let mut crc_bytes = [0u8; 4];
    LittleEndian::write_u32(&mut crc_bytes, crc);
    out.extend_from_slice(&crc_bytes);
    out
}

/// Validate and split a frame. Returns the type and payload slice.
pub fn decode_frame(data: &[u8]) -> Option<(u16, &[u8])> {
    if data.len() < 8 {
        return None;
    }
    let frame_type = BigEndian::read_u16(&data[0..2]);
    let length = BigEndian::read_u16(&data[2..4]) as usize;
    if data.len() != length + 8 {
        return None;
    }
    let crc_expected = LittleEndian::read_u32(&data[length + 4..]);
    if crc32_ieee(&data[..length + 4]) != crc_expected {
        return None;
    }
    Some((frame_type, &data[4..4 + length]))
}

/// Append one TLV record. Lengths up to 127 use one byte; longer values use
/// the two-byte varint form.
pub fn push_tlv(buf: &mut Vec<u8>, tag: u8, value: &[u8]) {
    buf.push(tag);
    if value.len() <= 0x7F {
        buf.push(value.len() as u8);
    } else {
        buf.push(0x80 | (value.len() & 0x7F) as u8);
        buf.push((value.len() >> 7) as u8);
    }
    buf.extend_from_slice(value);
}

/// Parse all TLV records in a payload.
pub fn parse_tlvs(payload: &[u8]) -> Vec<(u8, Vec<u8>)> {
    let mut out = Vec::new();
    let mut pos = 0;
    while pos + 2 <= payload.len() {
        let tag = payload[pos];
        let (len, header) = if payload[pos + 1] & 0x80 == 0 {
            (payload[pos + 1] as usize, 2)
        } else {
            if pos + 3 > payload.len() {
                break;
            }
            (
                ((payload[pos + 1] & 0x7F) as usize) | ((payload[pos + 2] as usize) << 7),
                3,
            )
        };
        let start = pos + header;
        let end = start + len;
        if end > payload.len() {
            break;
        }
        out.push((tag, payload[start..end].to_vec()));
        pos = end;
    }
    out
}

fn tlv_u32(tlvs: &[(u8, Vec<u8>)], tag: u8) -> Option<u32> {
    tlvs.iter()
        .find(|(t, v)| *t == tag && v.len() == 4)
        .map(|(_, v)| BigEndian::read_u32(v))
}

/// Whether a discovery request addresses this device.
pub fn discover_matches(payload: &[u8], our_device_id: u32) -> bool {
    let tlvs = parse_tlvs(payload);
    let type_ok = match tlv_u32(&tlvs, TAG_DEVICE_TYPE) {
        Some(t) => t == DEVICE_TYPE_TUNER || t == DEVICE_TYPE_WILDCARD,
        None => true,
    };
    let id_ok = match tlv_u32(&tlvs, TAG_DEVICE_ID) {
        Some(id) => id == our_device_id || id == DEVICE_ID_WILDCARD,
        None => true,
    };
    type_ok && id_ok
}

/// Build the discovery reply payload.
pub fn discover_reply(
    device_id: u32,
    tuner_count: u8,
    base_url: &str,
    lineup_url: &str,
) -> Vec<u8> {
    let mut payload = Vec::with_capacity(64);
    push_tlv(&mut payload, TAG_DEVICE_TYPE, &DEVICE_TYPE_TUNER.to_be_bytes());
    push_tlv(&mut payload, TAG_DEVICE_ID, &device_id.to_be_bytes());
    push_tlv(&mut payload, TAG_TUNER_COUNT, &[tuner_count]);
    push_tlv(&mut payload, TAG_BASE_URL, base_url.as_bytes());
    push_tlv(&mut payload, TAG_LINEUP_URL, lineup_url.as_bytes());
    payload
}

/// Answer a get/set request. `set` and unknown names produce an error
/// record, matching how the hardware NAKs unsupported properties.
pub fn handle_getset(payload: &[u8], state: &AppState) -> Vec<u8> {
    let tlvs = parse_tlvs(payload);
    let name = tlvs
        .iter()
        .find(|(t, _)| *t == TAG_GETSET_NAME)
        .map(|(_, v)| String::from_utf8_lossy(v).trim_end_matches('\0').to_string())
        .unwrap_or_default();
    let is_set = tlvs.iter().any(|(t, _)| *t == TAG_GETSET_VALUE);

    let mut reply = Vec::with_capacity(128);
    push_tlv(&mut reply, TAG_GETSET_NAME, name.as_bytes());

    if is_set {
        push_tlv(&mut reply, TAG_ERROR_MESSAGE, b"ERROR: read-only property");
        return reply;
    }

    let value: Option<String> = match name.as_str() {
        "/sys/model" => Some("hdhomerun5_atsc".into()),
        "/sys/hwmodel" => Some(state.config.model_number.clone()),
        "/sys/version" => Some(state.config.firmware_version.clone()),
        "/lineup.json" => {
            let lineup = state.shaped_lineup();
            let base = hdhr::advertised_base_url(&state.config);
            serde_json::to_string(&hdhr::lineup_entries(&lineup, &base)).ok()
        }
        other if other.starts_with("/tuner") && other.ends_with("/channel") => {
            // Streams run over HTTP, the virtual tuners are always idle here
            Some("none".into())
        }
        other if other.starts_with("/tuner") && other.ends_with("/status") => {
            Some("ch=none lock=none ss=0 snq=0 seq=0 bps=0 pps=0".into())
        }
        _ => None,
    };

    match value {
        Some(v) => push_tlv(&mut reply, TAG_GETSET_VALUE, v.as_bytes()),
        None => push_tlv(&mut reply, TAG_ERROR_MESSAGE, b"ERROR: unknown getset variable"),
    }
    reply
}

fn numeric_device_id(state: &AppState) -> u32 {
    let hex = state
        .config
        .hdhr_device_id
        .clone()
        .unwrap_or_else(|| hdhr::device_id(&state.config));
    u32::from_str_radix(hex.trim_start_matches("0x"), 16).unwrap_or(0x1234_5678)
}

/// Bind UDP+TCP 65001 and answer discovery and control requests until
/// shutdown.
pub async fn run_network_mode(state: AppState, mut shutdown: watch::Receiver<bool>) {
    let device_id = numeric_device_id(&state);
    let base_url = hdhr::advertised_base_url(&state.config);
    let lineup_url = format!("{base_url}/lineup.json");

    let udp = match UdpSocket::bind(("0.0.0.0", HDHR_PORT)).await {
        Ok(s) => s,
        Err(e) => {
            warn!(error = %e, "hdhr udp bind failed; network mode disabled");
            return;
        }
    };
    let tcp = match TcpListener::bind(("0.0.0.0", HDHR_PORT)).await {
        Ok(l) => l,
        Err(e) => {
            warn!(error = %e, "hdhr tcp bind failed; network mode disabled");
            return;
        }
    };
    info!(port = HDHR_PORT, device_id = %format!("{device_id:08X}"), "hdhr network mode listening");

    let mut udp_buf = vec![0u8; 2048];
    loop {
        tokio::select! {
            result = udp.recv_from(&mut udp_buf) => {
                let Ok((len, peer)) = result else { continue };
                let Some((frame_type, payload)) = decode_frame(&udp_buf[..len]) else { continue };
                if frame_type != TYPE_DISCOVER_REQ || !discover_matches(payload, device_id) {
                    continue;
                }
                debug!(%peer, "hdhr discovery request");
                let reply = encode_frame(
                    TYPE_DISCOVER_RPY,
                    &discover_reply(device_id, state.config.tuner_count as u8, &base_url, &lineup_url),
                );
                let _ = udp.send_to(&reply, peer).await;
            }
            result = tcp.accept() => {
                let Ok((stream, peer)) = result else { continue };
                debug!(%peer, "hdhr control connection");
                let state = state.clone();
                tokio::spawn(handle_control_connection(stream, state));
            }
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    return;
                }
            }
        }
    }
}

async fn handle_control_connection(mut stream: tokio::net::TcpStream, state: AppState) {
    let mut header = [0u8; 4];
    loop {
        if stream.read_exact(&mut header).await.is_err() {
            return;
        }
        let length = BigEndian::read_u16(&header[2..4]) as usize;
        let mut rest = vec![0u8; length + 4];
        if stream.read_exact(&mut rest).await.is_err() {
            return;
        }

        let mut frame = header.to_vec();
        frame.extend_from_slice(&rest);
        let Some((frame_type, payload)) = decode_frame(&frame) else {
            return;
        };
        if frame_type != TYPE_GETSET_REQ {
            return;
        }

        let reply = encode_frame(TYPE_GETSET_RPY, &handle_getset(payload, &state));
        if stream.write_all(&reply).await.is_err() {
            return;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_crc32_ieee_known_value() {
        // Standard test vector for the reflected IEEE polynomial
        assert_eq!(crc32_ieee(b"123456789"), 0xCBF4_3926);
    }

    #[test]
    fn test_frame_roundtrip() {
        let mut payload = Vec::new();
        push_tlv(&mut payload, TAG_DEVICE_TYPE, &DEVICE_TYPE_TUNER.to_be_bytes());

        let frame = encode_frame(TYPE_DISCOVER_REQ, &payload);
        let (frame_type, decoded) = decode_frame(&frame).expect("frame should decode");
        assert_eq!(frame_type, TYPE_DISCOVER_REQ);
        assert_eq!(decoded, payload.as_slice());
    }

    #[test]
    fn test_frame_rejects_corruption() {
        let frame = encode_frame(TYPE_DISCOVER_REQ, &[0x01, 0x04, 0, 0, 0, 1]);
        let mut bad = frame.clone();
        bad[5] ^= 0xFF;
        assert!(decode_frame(&bad).is_none());
        // Truncated frames are rejected too
        assert!(decode_frame(&frame[..frame.len() - 1]).is_none());
    }

    #[test]
    fn test_tlv_roundtrip_short_and_long() {
        let mut buf = Vec::new();
        push_tlv(&mut buf, 0x01, b"short");
        let long_value = vec![0xAB; 300];
        push_tlv(&mut buf, 0x02, &long_value);

        let tlvs = parse_tlvs(&buf);
        assert_eq!(tlvs.len(), 2);
        assert_eq!(tlvs[0], (0x01, b"short".to_vec()));
        assert_eq!(tlvs[1].0, 0x02);
        assert_eq!(tlvs[1].1, long_value);
    }

    #[test]
    fn test_discover_matching() {
        let mut wildcard = Vec::new();
        push_tlv(&mut wildcard, TAG_DEVICE_TYPE, &DEVICE_TYPE_WILDCARD.to_be_bytes());
        push_tlv(&mut wildcard, TAG_DEVICE_ID, &DEVICE_ID_WILDCARD.to_be_bytes());
        assert!(discover_matches(&wildcard, 0x1111_2222));

        let mut targeted = Vec::new();
        push_tlv(&mut targeted, TAG_DEVICE_TYPE, &DEVICE_TYPE_TUNER.to_be_bytes());
        push_tlv(&mut targeted, TAG_DEVICE_ID, &0x1111_2222u32.to_be_bytes());
        assert!(discover_matches(&targeted, 0x1111_2222));
        assert!(!discover_matches(&targeted, 0x3333_4444));
    }

    #[test]
    fn test_discover_reply_contains_urls() {
        let payload = discover_reply(0xAABBCCDD, 4, "http://10.0.0.5:5004", "http://10.0.0.5:5004/lineup.json");
        let tlvs = parse_tlvs(&payload);

        assert_eq!(tlv_u32(&tlvs, TAG_DEVICE_TYPE), Some(DEVICE_TYPE_TUNER));
        assert_eq!(tlv_u32(&tlvs, TAG_DEVICE_ID), Some(0xAABBCCDD));
        let tuners = tlvs.iter().find(|(t, _)| *t == TAG_TUNER_COUNT).unwrap();
        assert_eq!(tuners.1, vec![4]);
        let base = tlvs.iter().find(|(t, _)| *t == TAG_BASE_URL).unwrap();
        assert_eq!(base.1, b"http://10.0.0.5:5004");
    }
}

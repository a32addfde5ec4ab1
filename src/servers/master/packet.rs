use anyhow::{bail, Result};
use bytes::{BufMut, BytesMut};

use crate::servers::RoleKind;

pub const CMD_REGISTER: u8 = 0x01;
pub const CMD_HEARTBEAT: u8 = 0x02;
pub const CMD_STATUS: u8 = 0x03;

pub const CMD_REGISTER_ACK: u8 = 0x81;
pub const CMD_HEARTBEAT_ACK: u8 = 0x82;
pub const CMD_STATUS_REPLY: u8 = 0x83;

/// Result byte carried by `REGISTER_ACK`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegisterResult {
    Ok = 0,
    BadToken = 1,
    DirectoryFull = 2,
    BadKind = 3,
    Malformed = 4,
}

impl RegisterResult {
    pub fn from_byte(b: u8) -> Option<Self> {
        match b {
            0 => Some(RegisterResult::Ok),
            1 => Some(RegisterResult::BadToken),
            2 => Some(RegisterResult::DirectoryFull),
            3 => Some(RegisterResult::BadKind),
            4 => Some(RegisterResult::Malformed),
            _ => None,
        }
    }
}

/// An edge's registration request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Registration {
    pub kind: RoleKind,
    pub token: String,
    pub advertise: String,
}

/// Payload layout: `[kind u8][token_len u8][token][advertise utf8...]`.
pub fn build_register(kind: RoleKind, token: &str, advertise: &str) -> Vec<u8> {
    let token = token.as_bytes();
    let token_len = token.len().min(u8::MAX as usize);
    let mut buf = BytesMut::with_capacity(2 + token_len + advertise.len());
    buf.put_u8(kind.wire_id());
    buf.put_u8(token_len as u8);
    buf.put_slice(&token[..token_len]);
    buf.put_slice(advertise.as_bytes());
    buf.to_vec()
}

/// Parse a `REGISTER` payload. The error is the result to answer with.
pub fn parse_register(payload: &[u8]) -> Result<Registration, RegisterResult> {
    if payload.len() < 2 {
        return Err(RegisterResult::Malformed);
    }
    let kind = RoleKind::from_wire_id(payload[0]).ok_or(RegisterResult::BadKind)?;
    if kind == RoleKind::Master {
        return Err(RegisterResult::BadKind);
    }
    let token_len = payload[1] as usize;
    let rest = &payload[2..];
    if rest.len() < token_len {
        return Err(RegisterResult::Malformed);
    }
    let token = std::str::from_utf8(&rest[..token_len]).map_err(|_| RegisterResult::Malformed)?;
    let advertise = std::str::from_utf8(&rest[token_len..]).map_err(|_| RegisterResult::Malformed)?;
    Ok(Registration {
        kind,
        token: token.to_string(),
        advertise: advertise.to_string(),
    })
}

/// Interpret a `REGISTER_ACK` payload.
pub fn parse_register_ack(payload: &[u8]) -> Result<RegisterResult> {
    match payload.first().copied().and_then(RegisterResult::from_byte) {
        Some(r) => Ok(r),
        None => bail!("malformed REGISTER_ACK payload={:02X?}", payload),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_register_layout() {
        let pkt = build_register(RoleKind::VoiceEdge, "tok", "10.0.0.1:7200");
        assert_eq!(pkt[0], 2);
        assert_eq!(pkt[1], 3);
        assert_eq!(&pkt[2..5], b"tok");
        assert_eq!(&pkt[5..], b"10.0.0.1:7200");

        let reg = parse_register(&pkt).unwrap();
        assert_eq!(reg.kind, RoleKind::VoiceEdge);
        assert_eq!(reg.token, "tok");
        assert_eq!(reg.advertise, "10.0.0.1:7200");
    }

    #[test]
    fn test_register_rejects_master_and_unknown_kind() {
        let mut pkt = build_register(RoleKind::UserEdge, "t", "a");
        pkt[0] = RoleKind::Master.wire_id();
        assert_eq!(parse_register(&pkt), Err(RegisterResult::BadKind));
        pkt[0] = 7;
        assert_eq!(parse_register(&pkt), Err(RegisterResult::BadKind));
    }

    #[test]
    fn test_register_truncated() {
        assert_eq!(parse_register(&[1]), Err(RegisterResult::Malformed));
        // token_len says 10, only 2 bytes follow
        assert_eq!(parse_register(&[1, 10, b'a', b'b']), Err(RegisterResult::Malformed));
    }

    #[test]
    fn test_register_ack() {
        assert_eq!(parse_register_ack(&[0]).unwrap(), RegisterResult::Ok);
        assert_eq!(parse_register_ack(&[2]).unwrap(), RegisterResult::DirectoryFull);
        assert!(parse_register_ack(&[]).is_err());
        assert!(parse_register_ack(&[42]).is_err());
    }
}

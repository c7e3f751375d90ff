use bitflags::bitflags;

use crate::error::ProtoError;

/// Fixed wire header size, bytes.
pub const HEADER_SIZE: usize = 24;

pub const CMD_HEARTBEAT_REQ: u32 = 0x0000_0000;
pub const CMD_HEARTBEAT_RESP: u32 = 0x0000_0001;
pub const CMD_IDENTITY_REPORT_REQ: u32 = 0x0000_0002;
pub const CMD_IDENTITY_REPORT_RESP: u32 = 0x0000_0003;
/// Sentinel, never a valid handler command.
pub const CMD_UNUSED: u32 = 0x1111_1111;

pub const RET_SUCCESS: u32 = 888_888;
pub const RET_UNKNOWN: u32 = 0;
pub const RET_BODY_PARSE_ERROR: u32 = 444_444;

bitflags! {
    /// `flag_bits` header field. Bit 0 marks the terminal fragment of a
    /// multi-fragment message; all other bits pass through untouched.
    #[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
    pub struct HeaderFlags: u16 {
        const PACKET_END = 0b0000_0001;
    }
}

/// Fixed 24-byte protocol header, big-endian on the wire.
///
/// ```text
/// offset 0  length          u32   total bytes including this header
/// offset 4  route_id        u64
/// offset 12 command         u32
/// offset 16 flag_bits       u16   bit 0 = end-of-message
/// offset 18 packet_number   u16   1-based; 0 is reserved
/// offset 20 error_code      u32
/// ```
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub struct FrameHeader {
    pub length: u32,
    pub route_id: u64,
    pub command: u32,
    pub flags: HeaderFlags,
    pub packet_number: u16,
    pub error_code: u32,
}

impl FrameHeader {
    /// Parses the leading 24 bytes of `bytes`.
    pub fn parse(bytes: &[u8]) -> Result<Self, ProtoError> {
        if bytes.len() < HEADER_SIZE {
            return Err(ProtoError::ShortHeader(bytes.len()));
        }

        Ok(Self {
            length: u32::from_be_bytes(bytes[0..4].try_into().unwrap()),
            route_id: u64::from_be_bytes(bytes[4..12].try_into().unwrap()),
            command: u32::from_be_bytes(bytes[12..16].try_into().unwrap()),
            flags: HeaderFlags::from_bits_retain(u16::from_be_bytes(
                bytes[16..18].try_into().unwrap(),
            )),
            packet_number: u16::from_be_bytes(bytes[18..20].try_into().unwrap()),
            error_code: u32::from_be_bytes(bytes[20..24].try_into().unwrap()),
        })
    }

    /// Writes exactly 24 bytes.
    pub fn to_bytes(&self) -> [u8; HEADER_SIZE] {
        let mut out = [0u8; HEADER_SIZE];
        out[0..4].copy_from_slice(&self.length.to_be_bytes());
        out[4..12].copy_from_slice(&self.route_id.to_be_bytes());
        out[12..16].copy_from_slice(&self.command.to_be_bytes());
        out[16..18].copy_from_slice(&self.flags.bits().to_be_bytes());
        out[18..20].copy_from_slice(&self.packet_number.to_be_bytes());
        out[20..24].copy_from_slice(&self.error_code.to_be_bytes());
        out
    }

    pub fn assemble_into(&self, dst: &mut [u8]) -> Result<(), ProtoError> {
        if dst.len() < HEADER_SIZE {
            return Err(ProtoError::ShortHeader(dst.len()));
        }
        dst[..HEADER_SIZE].copy_from_slice(&self.to_bytes());
        Ok(())
    }

    #[inline]
    pub fn is_final(&self) -> bool {
        self.flags.contains(HeaderFlags::PACKET_END)
    }

    #[inline]
    pub fn body_len(&self) -> usize {
        (self.length as usize).saturating_sub(HEADER_SIZE)
    }

    /// Header for the response to this packet: same route id, end flag set,
    /// a single fragment, the given command and status.
    pub fn reply(&self, out_cmd: u32, body_len: usize, retcode: u32) -> Self {
        Self {
            length: (HEADER_SIZE + body_len) as u32,
            route_id: self.route_id,
            command: out_cmd,
            flags: HeaderFlags::PACKET_END,
            packet_number: 1,
            error_code: retcode,
        }
    }
}

#[inline]
pub fn is_request(cmd: u32) -> bool {
    cmd % 2 == 0
}

#[inline]
pub fn companion_response(cmd: u32) -> u32 {
    cmd | 1
}

#[inline]
pub fn is_heartbeat(cmd: u32) -> bool {
    cmd == CMD_HEARTBEAT_REQ || cmd == CMD_HEARTBEAT_RESP
}

#[inline]
pub fn is_identity_report(cmd: u32) -> bool {
    cmd == CMD_IDENTITY_REPORT_REQ || cmd == CMD_IDENTITY_REPORT_RESP
}

/// Commands handled by the built-in connection-diagnosis path.
#[inline]
pub fn is_diagnosis(cmd: u32) -> bool {
    is_heartbeat(cmd) || is_identity_report(cmd)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> FrameHeader {
        FrameHeader {
            length: 100,
            route_id: 0xDEAD_BEEF_CAFE_0042,
            command: 0x10,
            flags: HeaderFlags::PACKET_END,
            packet_number: 3,
            error_code: RET_SUCCESS,
        }
    }

    #[test]
    fn round_trip_is_identity() {
        let bytes = sample().to_bytes();
        let parsed = FrameHeader::parse(&bytes).unwrap();
        assert_eq!(parsed, sample());
        assert_eq!(parsed.to_bytes(), bytes);
    }

    #[test]
    fn unknown_flag_bits_survive_round_trip() {
        let mut bytes = sample().to_bytes();
        bytes[16] = 0xA5;
        bytes[17] = 0x5B;
        let parsed = FrameHeader::parse(&bytes).unwrap();
        assert_eq!(parsed.to_bytes(), bytes);
        assert!(parsed.is_final());
    }

    #[test]
    fn short_input_rejected() {
        let bytes = sample().to_bytes();
        assert!(matches!(FrameHeader::parse(&bytes[..23]), Err(ProtoError::ShortHeader(23))));
        assert!(FrameHeader::parse(&bytes[..24]).is_ok());
    }

    #[test]
    fn field_offsets_are_big_endian() {
        let h = sample();
        let bytes = h.to_bytes();
        assert_eq!(u32::from_be_bytes(bytes[0..4].try_into().unwrap()), 100);
        assert_eq!(u64::from_be_bytes(bytes[4..12].try_into().unwrap()), 0xDEAD_BEEF_CAFE_0042);
        assert_eq!(u32::from_be_bytes(bytes[12..16].try_into().unwrap()), 0x10);
        assert_eq!(u16::from_be_bytes(bytes[16..18].try_into().unwrap()), 1);
        assert_eq!(u16::from_be_bytes(bytes[18..20].try_into().unwrap()), 3);
        assert_eq!(u32::from_be_bytes(bytes[20..24].try_into().unwrap()), RET_SUCCESS);
    }

    #[test]
    fn request_response_pairing() {
        assert!(is_request(CMD_HEARTBEAT_REQ));
        assert!(!is_request(CMD_HEARTBEAT_RESP));
        assert_eq!(companion_response(CMD_HEARTBEAT_REQ), CMD_HEARTBEAT_RESP);
        assert_eq!(companion_response(CMD_IDENTITY_REPORT_REQ), CMD_IDENTITY_REPORT_RESP);
        assert!(is_diagnosis(CMD_IDENTITY_REPORT_RESP));
        assert!(!is_diagnosis(0x10));
    }

    #[test]
    fn reply_copies_route_id_and_terminates() {
        let h = sample();
        let r = h.reply(0x11, 8, RET_BODY_PARSE_ERROR);
        assert_eq!(r.route_id, h.route_id);
        assert_eq!(r.length, 32);
        assert_eq!(r.packet_number, 1);
        assert!(r.is_final());
        assert_eq!(r.error_code, RET_BODY_PARSE_ERROR);
    }
}

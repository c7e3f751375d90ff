use crate::{
    body::{Body, BodyCodec},
    error::ProtoError,
    header::{FrameHeader, HEADER_SIZE, HeaderFlags},
};

/// Builds a complete packet (header + optional body) into a fresh buffer.
/// Scheduler-driven sends (heartbeat, identity report) use this; replies on
/// the request path go through [`assemble_reply`] instead.
pub fn build_packet(
    cmd: u32,
    errcode: u32,
    body: Option<&Body>,
    codec: &dyn BodyCodec,
    route_id: u64,
    packet_number: u16,
    is_final: bool,
) -> Result<Vec<u8>, ProtoError> {
    let mut out = vec![0u8; HEADER_SIZE];

    let body_len = match body {
        Some(b) => codec.serialize(b, &mut out)?,
        None => 0,
    };

    let header = FrameHeader {
        length: (HEADER_SIZE + body_len) as u32,
        route_id,
        command: cmd,
        flags: if is_final { HeaderFlags::PACKET_END } else { HeaderFlags::empty() },
        packet_number,
        error_code: errcode,
    };
    header.assemble_into(&mut out)?;

    Ok(out)
}

/// Serializes `body` as the response to the packet `in_header` came from:
/// route id copied over, end flag set, `packet_number = 1`, status in
/// `error_code`.
pub fn assemble_reply(
    out_cmd: u32,
    retcode: u32,
    in_header: &FrameHeader,
    body: &Body,
    codec: &dyn BodyCodec,
) -> Result<Vec<u8>, ProtoError> {
    let mut out = vec![0u8; HEADER_SIZE];
    let body_len = codec.serialize(body, &mut out)?;

    in_header.reply(out_cmd, body_len, retcode).assemble_into(&mut out)?;
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::body::{CodecKind, codec_for};

    #[test]
    fn header_only_packet_is_24_bytes() {
        let codec = codec_for(CodecKind::Packed);
        let pkt = build_packet(0x00, 888_888, None, codec.as_ref(), 7, 1, true).unwrap();
        assert_eq!(pkt.len(), HEADER_SIZE);

        let h = FrameHeader::parse(&pkt).unwrap();
        assert_eq!(h.length, HEADER_SIZE as u32);
        assert_eq!(h.route_id, 7);
        assert!(h.is_final());
    }

    #[test]
    fn reply_echoes_route_id() {
        let codec = codec_for(CodecKind::Tree);
        let mut body = codec.empty();
        body.set_session_id("0123456789abcdef0123456789abcdef");

        let in_header = FrameHeader {
            length: 24,
            route_id: 42,
            command: 0x10,
            flags: HeaderFlags::PACKET_END,
            packet_number: 1,
            error_code: 0,
        };

        let pkt = assemble_reply(0x11, 888_888, &in_header, &body, codec.as_ref()).unwrap();
        let h = FrameHeader::parse(&pkt).unwrap();
        assert_eq!(h.command, 0x11);
        assert_eq!(h.route_id, 42);
        assert_eq!(h.error_code, 888_888);
        assert_eq!(h.length as usize, pkt.len());

        let back = codec.parse(&pkt[HEADER_SIZE..]).unwrap();
        assert_eq!(back.session_id(), Some("0123456789abcdef0123456789abcdef"));
    }

    #[test]
    fn non_final_fragment_keeps_end_flag_clear() {
        let codec = codec_for(CodecKind::Packed);
        let mut body = codec.empty();
        body.append_payload(b"half");
        let pkt = build_packet(0x10, 0, Some(&body), codec.as_ref(), 0, 1, false).unwrap();
        let h = FrameHeader::parse(&pkt).unwrap();
        assert!(!h.is_final());
        assert_eq!(h.packet_number, 1);
    }
}

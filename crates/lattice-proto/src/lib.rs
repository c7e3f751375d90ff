mod body;
mod error;
mod header;
mod packed;
mod packet;
mod session;
mod tree;

pub use body::{Body, BodyCodec, BodyPrefix, CodecKind, codec_for};
pub use error::ProtoError;
pub use header::{
    CMD_HEARTBEAT_REQ, CMD_HEARTBEAT_RESP, CMD_IDENTITY_REPORT_REQ, CMD_IDENTITY_REPORT_RESP,
    CMD_UNUSED, FrameHeader, HEADER_SIZE, HeaderFlags, RET_BODY_PARSE_ERROR, RET_SUCCESS,
    RET_UNKNOWN, companion_response, is_diagnosis, is_heartbeat, is_identity_report, is_request,
};
pub use packed::{PackedBody, PackedCodec};
pub use packet::{assemble_reply, build_packet};
pub use session::{SID_LEN, make_session_id};
pub use tree::TreeCodec;

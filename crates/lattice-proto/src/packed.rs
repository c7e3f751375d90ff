use serde::{Deserialize, Serialize};

use crate::{
    body::{Body, BodyCodec, BodyPrefix},
    error::ProtoError,
};

/// Schema-compiled binary body: a serde-derived envelope encoded with
/// `bitcode`. The prefix is part of the schema, so prefix extraction never
/// needs a second parse.
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq)]
pub struct PackedBody {
    pub prefix: BodyPrefix,
    pub payload: Vec<u8>,
}

pub struct PackedCodec;

impl BodyCodec for PackedCodec {
    fn empty(&self) -> Body {
        Body::Packed(PackedBody::default())
    }

    fn parse(&self, bytes: &[u8]) -> Result<Body, ProtoError> {
        if bytes.is_empty() {
            return Ok(self.empty());
        }
        let inner: PackedBody =
            bitcode::deserialize(bytes).map_err(|e| ProtoError::BodyParse(e.to_string()))?;
        Ok(Body::Packed(inner))
    }

    fn serialize(&self, body: &Body, dst: &mut Vec<u8>) -> Result<usize, ProtoError> {
        let Body::Packed(inner) = body else {
            return Err(ProtoError::CodecMismatch);
        };
        let encoded =
            bitcode::serialize(inner).map_err(|e| ProtoError::BodySerialize(e.to_string()))?;
        dst.extend_from_slice(&encoded);
        Ok(encoded.len())
    }

    fn clear(&self, body: &mut Body) {
        *body = self.empty();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_serialize_round_trip() {
        let codec = PackedCodec;
        let mut body = codec.empty();
        body.set_session_id("0123456789abcdef0123456789abcdef");
        body.set_server_type(3);
        body.set_server_name("upstream-1");
        body.append_payload(b"hello");

        let mut wire = Vec::new();
        let written = codec.serialize(&body, &mut wire).unwrap();
        assert_eq!(written, wire.len());

        let back = codec.parse(&wire).unwrap();
        assert_eq!(back, body);
    }

    #[test]
    fn garbage_is_a_parse_error() {
        let codec = PackedCodec;
        assert!(matches!(
            codec.parse(&[0xFF; 7]),
            Err(ProtoError::BodyParse(_))
        ));
    }

    #[test]
    fn empty_input_is_an_empty_body() {
        let codec = PackedCodec;
        assert!(codec.parse(&[]).unwrap().is_empty());
    }

    #[test]
    fn serialize_rejects_foreign_container() {
        let codec = PackedCodec;
        let tree = Body::Tree(serde_json::json!({"session_id": "x"}));
        assert!(matches!(
            codec.serialize(&tree, &mut Vec::new()),
            Err(ProtoError::CodecMismatch)
        ));
    }
}

use crate::{
    body::{Body, BodyCodec},
    error::ProtoError,
};

/// Text-tree body: a JSON object on the wire. Prefix fields live under the
/// `session_id` / `server_type` / `server_name` keys.
pub struct TreeCodec;

impl BodyCodec for TreeCodec {
    fn empty(&self) -> Body {
        Body::Tree(serde_json::Value::Object(serde_json::Map::new()))
    }

    fn parse(&self, bytes: &[u8]) -> Result<Body, ProtoError> {
        if bytes.is_empty() {
            return Ok(self.empty());
        }
        let value: serde_json::Value =
            serde_json::from_slice(bytes).map_err(|e| ProtoError::BodyParse(e.to_string()))?;
        if !value.is_object() {
            return Err(ProtoError::BodyParse("top-level value is not an object".into()));
        }
        Ok(Body::Tree(value))
    }

    fn serialize(&self, body: &Body, dst: &mut Vec<u8>) -> Result<usize, ProtoError> {
        let Body::Tree(value) = body else {
            return Err(ProtoError::CodecMismatch);
        };
        let encoded =
            serde_json::to_vec(value).map_err(|e| ProtoError::BodySerialize(e.to_string()))?;
        dst.extend_from_slice(&encoded);
        Ok(encoded.len())
    }

    fn clear(&self, body: &mut Body) {
        *body = self.empty();
    }
}

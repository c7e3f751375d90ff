use serde::{Deserialize, Serialize};

use crate::{
    error::ProtoError,
    packed::{PackedBody, PackedCodec},
    tree::TreeCodec,
};

/// Common leading fields both codecs carry. The framework core reads only
/// these; everything past them belongs to the application.
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, Eq)]
pub struct BodyPrefix {
    pub session_id: String,
    pub server_type: u32,
    pub server_name: String,
}

/// Opaque message-body handle.
///
/// Handlers receive and fill these; the packet processor only ever touches
/// the prefix accessors below, never application fields.
#[derive(Clone, Debug, PartialEq)]
pub enum Body {
    Packed(PackedBody),
    Tree(serde_json::Value),
}

impl Body {
    pub fn session_id(&self) -> Option<&str> {
        match self {
            Body::Packed(b) => {
                (!b.prefix.session_id.is_empty()).then_some(b.prefix.session_id.as_str())
            }
            Body::Tree(v) => v.get("session_id").and_then(|s| s.as_str()),
        }
    }

    pub fn server_type(&self) -> Option<u32> {
        match self {
            Body::Packed(b) => Some(b.prefix.server_type),
            Body::Tree(v) => v.get("server_type").and_then(|s| s.as_u64()).map(|s| s as u32),
        }
    }

    pub fn server_name(&self) -> Option<&str> {
        match self {
            Body::Packed(b) => {
                (!b.prefix.server_name.is_empty()).then_some(b.prefix.server_name.as_str())
            }
            Body::Tree(v) => v.get("server_name").and_then(|s| s.as_str()),
        }
    }

    pub fn set_session_id(&mut self, sid: &str) {
        match self {
            Body::Packed(b) => b.prefix.session_id = sid.to_string(),
            Body::Tree(v) => {
                ensure_object(v);
                v["session_id"] = serde_json::Value::String(sid.to_string());
            }
        }
    }

    pub fn set_server_type(&mut self, server_type: u32) {
        match self {
            Body::Packed(b) => b.prefix.server_type = server_type,
            Body::Tree(v) => {
                ensure_object(v);
                v["server_type"] = serde_json::Value::from(server_type);
            }
        }
    }

    pub fn set_server_name(&mut self, name: &str) {
        match self {
            Body::Packed(b) => b.prefix.server_name = name.to_string(),
            Body::Tree(v) => {
                ensure_object(v);
                v["server_name"] = serde_json::Value::String(name.to_string());
            }
        }
    }

    /// Application payload past the prefix, as raw bytes where that makes
    /// sense. Tree bodies expose the `payload` string field.
    pub fn payload(&self) -> Vec<u8> {
        match self {
            Body::Packed(b) => b.payload.clone(),
            Body::Tree(v) => v
                .get("payload")
                .and_then(|p| p.as_str())
                .map(|s| s.as_bytes().to_vec())
                .unwrap_or_default(),
        }
    }

    pub fn append_payload(&mut self, chunk: &[u8]) {
        match self {
            Body::Packed(b) => b.payload.extend_from_slice(chunk),
            Body::Tree(v) => {
                ensure_object(v);
                let mut cur = v
                    .get("payload")
                    .and_then(|p| p.as_str())
                    .map(|s| s.to_string())
                    .unwrap_or_default();
                cur.push_str(&String::from_utf8_lossy(chunk));
                v["payload"] = serde_json::Value::String(cur);
            }
        }
    }

    /// An empty body produces no response packet.
    pub fn is_empty(&self) -> bool {
        match self {
            Body::Packed(b) => {
                b.prefix == BodyPrefix::default() && b.payload.is_empty()
            }
            Body::Tree(v) => match v {
                serde_json::Value::Null => true,
                serde_json::Value::Object(m) => m.is_empty(),
                _ => false,
            },
        }
    }
}

fn ensure_object(v: &mut serde_json::Value) {
    if !v.is_object() {
        *v = serde_json::Value::Object(serde_json::Map::new());
    }
}

/// The body wire format, selected once at startup.
///
/// `Packed` is the schema-compiled binary codec, `Tree` the text-tree
/// codec. Both hide behind [`BodyCodec`]; the processor cannot tell them
/// apart.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum CodecKind {
    #[default]
    Packed,
    Tree,
}

pub trait BodyCodec {
    /// Fresh, empty body container of this codec's kind.
    fn empty(&self) -> Body;

    fn parse(&self, bytes: &[u8]) -> Result<Body, ProtoError>;

    /// Appends the encoded body to `dst`, returning the bytes written.
    fn serialize(&self, body: &Body, dst: &mut Vec<u8>) -> Result<usize, ProtoError>;

    fn clear(&self, body: &mut Body);
}

pub fn codec_for(kind: CodecKind) -> Box<dyn BodyCodec> {
    match kind {
        CodecKind::Packed => Box::new(PackedCodec),
        CodecKind::Tree => Box::new(TreeCodec),
    }
}

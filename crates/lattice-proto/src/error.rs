use thiserror::Error;

use crate::header::HEADER_SIZE;

#[derive(Error, Debug)]
pub enum ProtoError {
    #[error("header needs {HEADER_SIZE} bytes, got {0}")]
    ShortHeader(usize),
    #[error("body parse failed: {0}")]
    BodyParse(String),
    #[error("body serialize failed: {0}")]
    BodySerialize(String),
    #[error("body container kind does not match the codec")]
    CodecMismatch,
}

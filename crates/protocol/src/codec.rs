//! Line codec for byte-stream transports
//!
//! Each frame is JSON, base64 encoded and terminated by a newline, so a frame
//! never contains a raw newline and stray output cannot split it.

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use thiserror::Error;

use crate::Frame;

/// Errors produced while encoding or decoding frames
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// Invalid JSON payload
    #[error("invalid frame payload: {0}")]
    Json(#[from] serde_json::Error),

    /// Invalid base64 framing
    #[error("invalid frame encoding: {0}")]
    Base64(#[from] base64::DecodeError),

    /// Blank line where a frame was expected
    #[error("empty frame")]
    EmptyFrame,
}

/// Result type alias for protocol operations
pub type Result<T> = std::result::Result<T, ProtocolError>;

/// Encode a frame as one base64 line, without the trailing newline
pub fn encode_frame(frame: &Frame) -> Result<String> {
    let json = serde_json::to_vec(frame)?;
    Ok(STANDARD.encode(json))
}

/// Decode one line produced by [`encode_frame`]
pub fn decode_frame(line: &str) -> Result<Frame> {
    let line = line.trim();
    if line.is_empty() {
        return Err(ProtocolError::EmptyFrame);
    }
    let json = STANDARD.decode(line)?;
    Ok(serde_json::from_slice(&json)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{CallIdx, ChildId, Request, Target};
    use serde_json::json;

    #[test]
    fn test_encoded_frame_is_single_line() {
        let request = Request::new(
            CallIdx(1),
            Some(ChildId(1)),
            Target::method("run"),
            vec![json!("line one\nline two")],
        );
        let line = encode_frame(&Frame::from(request.clone())).unwrap();

        assert!(!line.contains('\n'));
        assert_eq!(decode_frame(&format!("{line}\n")).unwrap(), Frame::from(request));
    }

    #[test]
    fn test_decode_rejects_garbage() {
        assert!(matches!(decode_frame("   "), Err(ProtocolError::EmptyFrame)));
        assert!(matches!(decode_frame("not base64!"), Err(ProtocolError::Base64(_))));

        let not_json = STANDARD.encode("{nope");
        assert!(matches!(decode_frame(&not_json), Err(ProtocolError::Json(_))));
    }
}

//! Framed request/response protocol for the external approval service.
//!
//! A frame is a 4-byte big-endian body length followed by a JSON body of at
//! most [`MAX_FRAME_LEN`] bytes.

use std::io::{self, Read, Write};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::{KernelError, PlanId};

pub const MAX_FRAME_LEN: usize = 1024 * 1024;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ApprovalMessage {
    CommandRequest {
        request_id: String,
        plan_id: PlanId,
        step_index: Option<usize>,
        command: String,
        reason: String,
    },
    CommandResponse {
        request_id: String,
        approved: bool,
        responder: String,
        #[serde(default)]
        comment: Option<String>,
    },
    Heartbeat {
        #[serde(default)]
        sequence: u64,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ApprovalRequest {
    pub request_id: String,
    pub plan_id: PlanId,
    pub step_index: Option<usize>,
    pub command: String,
    pub reason: String,
}

impl ApprovalRequest {
    #[must_use]
    pub fn into_message(self) -> ApprovalMessage {
        ApprovalMessage::CommandRequest {
            request_id: self.request_id,
            plan_id: self.plan_id,
            step_index: self.step_index,
            command: self.command,
            reason: self.reason,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ApprovalVerdict {
    pub approved: bool,
    pub responder: String,
    pub comment: Option<String>,
}

/// Opaque approval source. Implementations must return within `timeout`.
pub trait ApprovalOracle {
    /// # Errors
    /// Returns [`KernelError::ConfirmationRequired`] when no verdict arrives
    /// in time or the service cannot be reached.
    fn request_approval(
        &self,
        request: &ApprovalRequest,
        timeout: Duration,
    ) -> Result<ApprovalVerdict, KernelError>;
}

/// # Errors
/// Returns [`KernelError::Validation`] when the body cannot be encoded or
/// exceeds [`MAX_FRAME_LEN`].
pub fn encode_frame(message: &ApprovalMessage) -> Result<Vec<u8>, KernelError> {
    let body = serde_json::to_vec(message)
        .map_err(|err| KernelError::Validation(format!("failed to encode approval frame: {err}")))?;
    if body.len() > MAX_FRAME_LEN {
        return Err(KernelError::Validation(format!(
            "approval frame of {} bytes exceeds the {MAX_FRAME_LEN} byte limit",
            body.len()
        )));
    }
    let len = u32::try_from(body.len())
        .map_err(|_| KernelError::Validation("approval frame length overflow".to_string()))?;
    let mut frame = Vec::with_capacity(4 + body.len());
    frame.extend_from_slice(&len.to_be_bytes());
    frame.extend_from_slice(&body);
    Ok(frame)
}

/// Decodes one frame from the front of `buffer`.
///
/// Returns `Ok(None)` when more bytes are needed, otherwise the message and
/// the number of bytes consumed.
///
/// # Errors
/// Returns [`KernelError::Validation`] for oversized or malformed frames.
pub fn decode_frame(buffer: &[u8]) -> Result<Option<(ApprovalMessage, usize)>, KernelError> {
    let Some(header) = buffer.get(..4) else {
        return Ok(None);
    };
    let len = declared_len(header)?;
    let Some(body) = buffer.get(4..4 + len) else {
        return Ok(None);
    };
    let message = serde_json::from_slice(body)
        .map_err(|err| KernelError::Validation(format!("malformed approval frame: {err}")))?;
    Ok(Some((message, 4 + len)))
}

fn declared_len(header: &[u8]) -> Result<usize, KernelError> {
    let mut bytes = [0_u8; 4];
    bytes.copy_from_slice(header);
    let len = usize::try_from(u32::from_be_bytes(bytes))
        .map_err(|_| KernelError::Validation("approval frame length overflow".to_string()))?;
    if len > MAX_FRAME_LEN {
        return Err(KernelError::Validation(format!(
            "approval frame of {len} bytes exceeds the {MAX_FRAME_LEN} byte limit"
        )));
    }
    Ok(len)
}

/// # Errors
/// Returns I/O errors from the writer; encoding failures surface as
/// [`io::ErrorKind::InvalidData`].
pub fn write_frame<W: Write>(writer: &mut W, message: &ApprovalMessage) -> io::Result<()> {
    let frame = encode_frame(message)
        .map_err(|err| io::Error::new(io::ErrorKind::InvalidData, err.to_string()))?;
    writer.write_all(&frame)?;
    writer.flush()
}

/// # Errors
/// Returns I/O errors from the reader; malformed frames surface as
/// [`io::ErrorKind::InvalidData`].
pub fn read_frame<R: Read>(reader: &mut R) -> io::Result<ApprovalMessage> {
    let mut header = [0_u8; 4];
    reader.read_exact(&mut header)?;
    let len = declared_len(&header)
        .map_err(|err| io::Error::new(io::ErrorKind::InvalidData, err.to_string()))?;
    let mut body = vec![0_u8; len];
    reader.read_exact(&mut body)?;
    serde_json::from_slice(&body).map_err(|err| io::Error::new(io::ErrorKind::InvalidData, err))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn must<T, E: std::fmt::Display>(result: Result<T, E>) -> T {
        match result {
            Ok(value) => value,
            Err(err) => panic!("expected Ok(..), got error: {err}"),
        }
    }

    fn fixture_request() -> ApprovalRequest {
        ApprovalRequest {
            request_id: "req-1".to_string(),
            plan_id: PlanId::from("plan_fixture"),
            step_index: Some(3),
            command: "kubectl apply -f prod.yaml".to_string(),
            reason: "deploy step".to_string(),
        }
    }

    #[test]
    fn partial_buffers_wait_for_more_bytes() {
        let frame = must(encode_frame(&ApprovalMessage::Heartbeat { sequence: 7 }));
        assert_eq!(&frame[..4], &u32::try_from(frame.len() - 4).unwrap_or(0).to_be_bytes());
        assert!(must(decode_frame(&frame[..2])).is_none());
        assert!(must(decode_frame(&frame[..frame.len() - 1])).is_none());

        let mut two = frame.clone();
        two.extend_from_slice(&frame);
        let decoded = must(decode_frame(&two));
        assert_eq!(decoded, Some((ApprovalMessage::Heartbeat { sequence: 7 }, frame.len())));
    }

    #[test]
    fn oversized_length_is_rejected_before_reading_body() {
        let header = u32::try_from(MAX_FRAME_LEN + 1).unwrap_or(u32::MAX).to_be_bytes();
        assert!(decode_frame(&header).is_err());
    }

    #[test]
    fn wire_tags_use_snake_case() {
        let encoded = must(serde_json::to_value(fixture_request().into_message()));
        assert_eq!(encoded["type"], "command_request");
    }
}

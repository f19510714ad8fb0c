//! Framed IPC protocol between the bridge and extension processes.

use std::io::{Read, Write};

use serde::{Deserialize, Serialize, de::DeserializeOwned};
use serde_json::value::RawValue;
use thiserror::Error;

use crate::envelope::{ExtensionRestRequest, ExtensionRestResponse};

/// Maximum message frame size used by default helpers.
pub const DEFAULT_MAX_FRAME_BYTES: usize = 8 * 1024 * 1024;

/// One IPC frame.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum ExtensionFrame {
    /// Bridge to extension: execute a request.
    Request {
        /// Correlation id echoed by the reply.
        request_id: u64,
        /// Transport action name.
        action: String,
        /// Forwarded request.
        request: ExtensionRestRequest,
    },
    /// Extension to bridge: successful reply.
    ///
    /// The reply stays undecoded JSON until the reply handler decodes it.
    Response {
        /// Id of the answered request.
        request_id: u64,
        /// Encoded [`ExtensionRestResponse`].
        response: Box<RawValue>,
    },
    /// Extension to bridge: request failed.
    Error {
        /// Id of the failed request.
        request_id: u64,
        /// Failure detail.
        message: String,
    },
}

impl ExtensionFrame {
    /// Builds a response frame for `response`.
    pub fn response(request_id: u64, response: &ExtensionRestResponse) -> Result<Self, IpcError> {
        Ok(Self::Response {
            request_id,
            response: serde_json::value::to_raw_value(response)?,
        })
    }

    /// Correlation id carried by any frame.
    #[must_use]
    pub fn request_id(&self) -> u64 {
        match self {
            Self::Request { request_id, .. }
            | Self::Response { request_id, .. }
            | Self::Error { request_id, .. } => *request_id,
        }
    }
}

/// Failures reading or writing extension frames.
#[derive(Debug, Error)]
pub enum IpcError {
    /// The extension pipe failed or closed.
    #[error("extension pipe: {0}")]
    Io(#[from] std::io::Error),
    /// Frame payload is not a valid [`ExtensionFrame`].
    #[error("malformed extension frame: {0}")]
    Codec(#[from] serde_json::Error),
    /// Announced or encoded frame length is over the limit.
    #[error("frame of {len} bytes exceeds the {max} byte limit")]
    FrameTooLarge {
        /// Frame length in bytes.
        len: usize,
        /// Limit in force.
        max: usize,
    },
}

impl IpcError {
    /// True when the peer closed the stream between frames.
    #[must_use]
    pub fn is_eof(&self) -> bool {
        matches!(self, Self::Io(err) if err.kind() == std::io::ErrorKind::UnexpectedEof)
    }
}

const LEN_PREFIX: usize = size_of::<u32>();

/// Encodes `frame` as a big-endian `u32` length followed by JSON, in one write.
pub fn write_frame<T: Serialize>(writer: &mut impl Write, frame: &T) -> Result<(), IpcError> {
    let mut buf = vec![0_u8; LEN_PREFIX];
    serde_json::to_writer(&mut buf, frame)?;
    let len = buf.len() - LEN_PREFIX;
    let prefix = u32::try_from(len).map_err(|_| IpcError::FrameTooLarge {
        len,
        max: u32::MAX as usize,
    })?;
    buf[..LEN_PREFIX].copy_from_slice(&prefix.to_be_bytes());
    writer.write_all(&buf)?;
    writer.flush()?;
    Ok(())
}

/// Decodes one frame, refusing payloads longer than `max_bytes`
/// before allocating for them.
pub fn read_frame<T: DeserializeOwned>(
    reader: &mut impl Read,
    max_bytes: usize,
) -> Result<T, IpcError> {
    let mut prefix = [0_u8; LEN_PREFIX];
    reader.read_exact(&mut prefix)?;
    let len = u32::from_be_bytes(prefix) as usize;
    if len > max_bytes {
        return Err(IpcError::FrameTooLarge {
            len,
            max: max_bytes,
        });
    }
    let mut payload = vec![0_u8; len];
    reader.read_exact(&mut payload)?;
    Ok(serde_json::from_slice(&payload)?)
}

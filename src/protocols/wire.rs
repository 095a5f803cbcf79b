//! Stafford's native protocol.
//!
//! The native transport is TCP. All on-wire payloads have the following
//! form:
//!
//! ```text
//!     [--------------------------------|~~~~~~~~~~ . . . ~~~~~~~~~~~~]
//!     ^                                ^
//!     u32, payload length in bytes     JSON document, of prefix len
//! ```
//!
//! The JSON document is a `Request` on the way in and a `Response` on the
//! way out -- the same metric objects the HTTP surface speaks, so a client
//! of one transport needs no new vocabulary for the other. When payload
//! encryption is configured the request document bytes are encrypted before
//! framing; responses are always plaintext.

use byteorder::{BigEndian, ByteOrder, ReadBytesExt};
use std::fmt;
use std::io;
use std::io::{Read, Write};

use crate::metric::Metric;

/// Upper bound on a single frame. Anything larger is treated as a framing
/// error rather than an allocation request.
pub const MAX_FRAME_BYTES: usize = 4 * 1024 * 1024;

/// Operations a client may ask of the server.
#[derive(PartialEq, Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Request {
    /// Store a single metric.
    UpdateOne {
        /// The metric to store.
        metric: Metric,
    },
    /// Store a batch of metrics as a unit.
    UpdateMany {
        /// The batch, applied in order.
        metrics: Vec<Metric>,
    },
    /// Read a metric back by id.
    LoadOne {
        /// The metric name to look up.
        id: String,
        /// The expected kind of the metric.
        #[serde(rename = "type")]
        kind: String,
    },
    /// Probe storage liveness.
    Ping,
}

/// Typed failure classes, mirroring the HTTP status mapping.
#[derive(PartialEq, Eq, Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    /// The metric kind is not supported.
    Unimplemented,
    /// No metric under the requested id.
    NotFound,
    /// The request was bad or the backend failed.
    Internal,
    /// The caller is outside the trusted network.
    PermissionDenied,
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let name = match *self {
            ErrorCode::Unimplemented => "unimplemented",
            ErrorCode::NotFound => "not_found",
            ErrorCode::Internal => "internal",
            ErrorCode::PermissionDenied => "permission_denied",
        };
        f.write_str(name)
    }
}

/// What the server answers with.
#[derive(PartialEq, Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum Response {
    /// The operation succeeded with nothing to return.
    Ok,
    /// The operation succeeded and returned a metric.
    Metric {
        /// The stored metric, signed when the server is keyed.
        metric: Metric,
    },
    /// The operation failed.
    Error {
        /// Failure class.
        code: ErrorCode,
        /// Human-oriented detail.
        message: String,
    },
}

/// Write one length-prefixed frame.
pub fn write_frame<W>(writer: &mut W, payload: &[u8]) -> io::Result<()>
where
    W: Write,
{
    let mut size = [0; 4];
    BigEndian::write_u32(&mut size, payload.len() as u32);
    writer.write_all(&size)?;
    writer.write_all(payload)?;
    writer.flush()
}

/// Read one length-prefixed frame.
pub fn read_frame<R>(reader: &mut R) -> io::Result<Vec<u8>>
where
    R: Read,
{
    let length = reader.read_u32::<BigEndian>()? as usize;
    if length > MAX_FRAME_BYTES {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("frame of {} bytes exceeds limit", length),
        ));
    }

    let mut payload = vec![0; length];
    reader.read_exact(&mut payload)?;
    Ok(payload)
}

//! Outbox framing.
//!
//! Each frame is one JSON object on its own line:
//!
//! ```text
//! {"time":"2026-10-16T09:30:00.000+00:00","data":"hello%20world"}\n
//! ```
//!
//! `data` is percent-encoded, so the serialized frame never contains a raw
//! newline regardless of the payload. Readers receive arbitrary byte
//! ranges of a growing file; [`FrameDecoder`] reassembles lines across
//! deltas and holds back a trailing partial line until it is completed.

use std::io;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::SocketError;
use crate::layout;

/// A single framed message.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    /// Write timestamp (RFC 3339). Informational only.
    #[serde(default)]
    pub time: String,
    /// Percent-encoded payload text.
    pub data: String,
}

impl Frame {
    /// Frame `text` with the current local time.
    pub fn new(text: &str) -> Self {
        Self {
            time: chrono::Local::now().to_rfc3339(),
            data: urlencoding::encode(text).into_owned(),
        }
    }

    /// Decoded payload text.
    ///
    /// # Errors
    ///
    /// Returns [`SocketError::MalformedFrame`] if the percent-decoded bytes
    /// are not valid UTF-8.
    pub fn text(&self) -> Result<String, SocketError> {
        urlencoding::decode(&self.data)
            .map(std::borrow::Cow::into_owned)
            .map_err(|e| SocketError::MalformedFrame(format!("payload is not UTF-8: {e}")))
    }

    /// Serialized line including the trailing newline.
    pub fn encode(&self) -> Vec<u8> {
        let mut line = serde_json::to_vec(self).expect("JSON serialization cannot fail");
        line.push(b'\n');
        line
    }

    /// Parse one line (without its newline).
    ///
    /// # Errors
    ///
    /// Returns [`SocketError::MalformedFrame`] if the line is not a JSON
    /// object with a string `data` field.
    pub fn parse_line(line: &[u8]) -> Result<Self, SocketError> {
        serde_json::from_slice(line).map_err(|e| {
            SocketError::MalformedFrame(format!(
                "{e}: {}",
                String::from_utf8_lossy(line).chars().take(80).collect::<String>()
            ))
        })
    }
}

/// Append `text` as one frame to the file at `path`.
pub fn append_frame(path: &Path, text: &str) -> io::Result<()> {
    log::debug!("write_to {} {:?}", path.display(), text);
    layout::append(path, &Frame::new(text).encode())
}

/// Incremental line decoder for one source file.
#[derive(Debug, Default)]
pub struct FrameDecoder {
    buf: Vec<u8>,
}

impl FrameDecoder {
    /// Create a decoder with an empty buffer.
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed a delta and decode every complete line.
    ///
    /// Blank lines are skipped. A malformed line yields an `Err` entry and
    /// decoding continues with the next line. Bytes after the last newline
    /// are kept for the next call.
    pub fn feed(&mut self, bytes: &[u8]) -> Vec<Result<Frame, SocketError>> {
        self.buf.extend_from_slice(bytes);

        let Some(end) = self.buf.iter().rposition(|&b| b == b'\n') else {
            return Vec::new();
        };
        let rest = self.buf.split_off(end + 1);
        let complete = std::mem::replace(&mut self.buf, rest);

        complete
            .split(|&b| b == b'\n')
            .map(<[u8]>::trim_ascii)
            .filter(|line| !line.is_empty())
            .map(Frame::parse_line)
            .collect()
    }

    /// Whether an incomplete line is buffered.
    pub fn has_partial(&self) -> bool {
        !self.buf.is_empty()
    }
}

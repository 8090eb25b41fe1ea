//! Length-prefixed JSON frames exchanged with the sandbox driver.
//!
//! Each frame is a `u32` big-endian byte length followed by that many bytes of
//! UTF-8 JSON. The driver writes frames to a private duplicate of its original
//! stdout, so output from user code can never interleave with a frame.

use std::io::{self, Read, Write};
use std::sync::mpsc::{self, Receiver};
use std::thread;

use anyhow::{Context, Result, bail};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

/// Largest frame accepted in either direction.
pub const MAX_FRAME_BYTES: usize = 64 * 1024 * 1024;

/// What the driver should do with a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RequestKind {
    /// Run code in the persistent namespace.
    Exec,
    /// Run `pip install` for the given requirement.
    Install,
}

/// Host to driver.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Request {
    pub id: u64,
    pub kind: RequestKind,
    /// Code to run, or the requirement for [`RequestKind::Install`].
    pub code: String,
    /// Expression evaluated after `code`; its value becomes the artifact.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub final_expr: Option<String>,
    pub timeout_secs: u64,
    pub output_limit: usize,
}

/// Driver to host.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum DriverMessage {
    /// Sent once after the driver has set up its namespace.
    Ready { pid: u32, python: String },
    Response(Response),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResponseStatus {
    Ok,
    Error,
    Timeout,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Response {
    pub id: u64,
    pub status: ResponseStatus,
    /// Captured stdout and stderr, interleaved as written.
    #[serde(default)]
    pub output: String,
    /// Bytes of output dropped past the request's limit.
    #[serde(default)]
    pub output_truncated: usize,
    #[serde(default)]
    pub error: Option<ErrorInfo>,
    /// The value came from `final_answer(...)` rather than a plain evaluation.
    #[serde(default)]
    pub final_answer: bool,
    #[serde(default)]
    pub artifact: Option<ArtifactRef>,
}

/// Exception raised by the snippet.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorInfo {
    pub ename: String,
    pub evalue: String,
    /// Formatted traceback, ending with the `ename: evalue` line.
    pub traceback: String,
}

/// Encoded value written by the driver before the response frame.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArtifactRef {
    /// Path relative to the session I/O directory.
    pub path: String,
    pub bytes: u64,
    /// Lowercase hex SHA-256 of the file contents.
    pub sha256: String,
}

/// Write one frame.
pub fn write_frame<W: Write, T: Serialize>(writer: &mut W, message: &T) -> Result<()> {
    let body = serde_json::to_vec(message).context("encode frame")?;
    if body.len() > MAX_FRAME_BYTES {
        bail!("frame of {} bytes exceeds {MAX_FRAME_BYTES}", body.len());
    }
    let len = u32::try_from(body.len()).context("frame length")?;
    writer.write_all(&len.to_be_bytes()).context("write frame header")?;
    writer.write_all(&body).context("write frame body")?;
    writer.flush().context("flush frame")?;
    Ok(())
}

/// Read one frame body. `Ok(None)` on a clean EOF before a header.
pub fn read_frame<R: Read>(reader: &mut R) -> Result<Option<Vec<u8>>> {
    let mut header = [0u8; 4];
    match reader.read_exact(&mut header) {
        Ok(()) => {}
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e).context("read frame header"),
    }
    let len = u32::from_be_bytes(header) as usize;
    if len > MAX_FRAME_BYTES {
        bail!("frame of {len} bytes exceeds {MAX_FRAME_BYTES}");
    }
    let mut body = vec![0u8; len];
    reader
        .read_exact(&mut body)
        .context("read frame body (stream ended mid-frame)")?;
    Ok(Some(body))
}

/// Read and decode one frame.
pub fn read_message<R: Read, T: DeserializeOwned>(reader: &mut R) -> Result<Option<T>> {
    let Some(body) = read_frame(reader)? else {
        return Ok(None);
    };
    let message = serde_json::from_slice(&body).context("decode frame")?;
    Ok(Some(message))
}

/// Decode driver frames on a background thread.
///
/// The channel closes when the driver's stdout reaches EOF. A framing error is
/// delivered once and ends the thread, since the stream cannot be resynced.
pub fn spawn_reader<R: Read + Send + 'static>(
    mut reader: R,
) -> (Receiver<Result<DriverMessage>>, thread::JoinHandle<()>) {
    let (tx, rx) = mpsc::channel();
    let handle = thread::spawn(move || {
        loop {
            match read_message::<_, DriverMessage>(&mut reader) {
                Ok(Some(message)) => {
                    if tx.send(Ok(message)).is_err() {
                        break;
                    }
                }
                Ok(None) => {
                    debug!("driver stdout closed");
                    break;
                }
                Err(err) => {
                    warn!(err = %err, "driver framing error");
                    let _ = tx.send(Err(err));
                    break;
                }
            }
        }
    });
    (rx, handle)
}

#[cfg(test)]
mod tests {
    use std::io::Cursor;

    use super::*;

    fn sample_response() -> Response {
        Response {
            id: 3,
            status: ResponseStatus::Ok,
            output: "hi\n".to_string(),
            output_truncated: 0,
            error: None,
            final_answer: true,
            artifact: Some(ArtifactRef {
                path: "artifacts/3.json".to_string(),
                bytes: 27,
                sha256: "00".repeat(32),
            }),
        }
    }

    #[test]
    fn frames_are_length_prefixed_big_endian() {
        let mut buf = Vec::new();
        write_frame(&mut buf, &serde_json::json!({"a": 1})).expect("write");
        assert_eq!(&buf[..4], &[0, 0, 0, 7]);
        assert_eq!(&buf[4..], br#"{"a":1}"#);
    }

    #[test]
    fn consecutive_frames_decode_in_order() {
        let mut buf = Vec::new();
        write_frame(
            &mut buf,
            &DriverMessage::Ready {
                pid: 42,
                python: "3.12.1".to_string(),
            },
        )
        .expect("write ready");
        write_frame(&mut buf, &DriverMessage::Response(sample_response())).expect("write response");

        let mut cursor = Cursor::new(buf);
        let first: DriverMessage = read_message(&mut cursor).expect("read").expect("frame");
        assert!(matches!(first, DriverMessage::Ready { pid: 42, .. }));
        let second: DriverMessage = read_message(&mut cursor).expect("read").expect("frame");
        assert_eq!(second, DriverMessage::Response(sample_response()));
        assert!(read_message::<_, DriverMessage>(&mut cursor)
            .expect("eof")
            .is_none());
    }

    #[test]
    fn driver_json_shape_decodes() {
        let raw = br#"{"type":"response","id":1,"status":"error","output":"",
            "error":{"ename":"SyntaxError","evalue":"bad","traceback":"SyntaxError: bad\n"}}"#;
        let message: DriverMessage = serde_json::from_slice(raw).expect("decode");
        let DriverMessage::Response(response) = message else {
            panic!("expected response");
        };
        assert_eq!(response.status, ResponseStatus::Error);
        assert_eq!(response.error.expect("error").ename, "SyntaxError");
        assert!(response.artifact.is_none());
        assert!(!response.final_answer);
    }

    #[test]
    fn rejects_oversized_header() {
        let mut buf = u32::MAX.to_be_bytes().to_vec();
        buf.extend_from_slice(b"{}");
        let err = read_frame(&mut Cursor::new(buf)).unwrap_err();
        assert!(err.to_string().contains("exceeds"));
    }

    #[test]
    fn truncated_body_is_an_error() {
        let mut buf = 10u32.to_be_bytes().to_vec();
        buf.extend_from_slice(b"{}");
        assert!(read_frame(&mut Cursor::new(buf)).is_err());
    }

    #[test]
    fn reader_thread_delivers_frames_then_closes() {
        let mut buf = Vec::new();
        write_frame(&mut buf, &DriverMessage::Response(sample_response())).expect("write");
        let (rx, handle) = spawn_reader(Cursor::new(buf));
        let message = rx.recv().expect("frame").expect("decoded");
        assert!(matches!(message, DriverMessage::Response(_)));
        assert!(rx.recv().is_err());
        handle.join().expect("join");
    }

    #[test]
    fn request_omits_missing_final_expr() {
        let request = Request {
            id: 1,
            kind: RequestKind::Exec,
            code: "x = 1".to_string(),
            final_expr: None,
            timeout_secs: 30,
            output_limit: 100,
        };
        let value = serde_json::to_value(&request).expect("json");
        assert!(value.get("final_expr").is_none());
        assert_eq!(value["kind"], "exec");
    }
}

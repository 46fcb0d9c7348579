use std::{
    io::{self, BufRead, Read, Write},
    str,
    sync::{Arc, Mutex, PoisonError},
};

use log::trace;
use thiserror::Error;

use super::message::{
    CRLF, LENGTH_PREFIX, Message, Method, PARAMS_DELIMITER, RECIPIENT_DELIMITER,
};

/// Largest body a frame may declare unless configured otherwise.
pub const DEFAULT_MAX_CONTENT_LENGTH: usize = 1024 * 1024;
const MAX_LINE_LENGTH: usize = 8 * 1024;

#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("malformed frame: {0}")]
    Syntax(String),
    #[error("connection closed by peer")]
    ConnectionClosed,
    #[error("transport IO error: {0}")]
    Io(#[from] io::Error),
}

impl ProtocolError {
    fn from_read(e: io::Error) -> Self {
        match e.kind() {
            io::ErrorKind::UnexpectedEof => ProtocolError::ConnectionClosed,
            _ => ProtocolError::Io(e),
        }
    }
}

/// Header fields of a frame, before any body is read.
#[derive(Debug, PartialEq, Eq)]
struct Header<'a> {
    method: Method,
    command: &'a str,
    params: Option<&'a str>,
    recipient_id: Option<&'a str>,
}

/// Pulls one [`Message`] at a time off a buffered byte stream.
///
/// The reader keeps no state between calls besides the stream position, so after a
/// successful [`read_message`](FrameReader::read_message) the stream sits exactly
/// after the frame's last byte.
pub struct FrameReader<R: BufRead> {
    inner: R,
    max_content_length: usize,
}

impl<R: BufRead> FrameReader<R> {
    pub fn new(inner: R) -> Self {
        Self {
            inner,
            max_content_length: DEFAULT_MAX_CONTENT_LENGTH,
        }
    }

    pub fn with_max_content_length(mut self, max: usize) -> Self {
        self.max_content_length = max;
        self
    }

    pub fn read_message(&mut self) -> Result<Message, ProtocolError> {
        let line = self.read_line()?;
        let header = parse_header(&line)?;

        let content = if header.method.has_body() {
            Some(self.read_body()?)
        } else {
            None
        };

        let mut msg = Message::new(header.method, header.command, content);
        if let Some(params) = header.params {
            msg = msg.with_params(params);
        }
        if let Some(recipient_id) = header.recipient_id {
            msg = msg.with_recipient(recipient_id);
        }

        trace!("read frame: {msg}");
        Ok(msg)
    }

    /// Reads up to and including the next CRLF, returning the line without it.
    /// A bare LF does not end a line. At most `MAX_LINE_LENGTH` bytes plus the CRLF
    /// are consumed before giving up.
    fn read_line(&mut self) -> Result<Vec<u8>, ProtocolError> {
        let limit = MAX_LINE_LENGTH + CRLF.len();
        let mut line = Vec::new();
        loop {
            let budget = (limit - line.len()) as u64;
            let read = (&mut self.inner)
                .take(budget)
                .read_until(b'\n', &mut line)
                .map_err(ProtocolError::from_read)?;
            if line.ends_with(CRLF) {
                line.truncate(line.len() - CRLF.len());
                return Ok(line);
            }
            if line.len() >= limit {
                return Err(ProtocolError::Syntax(format!(
                    "line exceeds {MAX_LINE_LENGTH} bytes"
                )));
            }
            if read == 0 {
                return Err(ProtocolError::ConnectionClosed);
            }
        }
    }

    fn read_body(&mut self) -> Result<Vec<u8>, ProtocolError> {
        let line = self.read_line()?;
        let length = parse_length(&line)?;
        if length > self.max_content_length {
            return Err(ProtocolError::Syntax(format!(
                "declared length {length} exceeds limit of {}",
                self.max_content_length
            )));
        }

        let mut content = vec![0; length];
        self.inner
            .read_exact(&mut content)
            .map_err(ProtocolError::from_read)?;

        let mut trailer = [0; 2];
        self.inner
            .read_exact(&mut trailer)
            .map_err(ProtocolError::from_read)?;
        if trailer != CRLF {
            return Err(ProtocolError::Syntax(format!(
                "expected CRLF after {length} byte body, found {trailer:?}"
            )));
        }

        Ok(content)
    }
}

fn parse_header(line: &[u8]) -> Result<Header<'_>, ProtocolError> {
    let line = str::from_utf8(line)
        .map_err(|_| ProtocolError::Syntax("header is not valid UTF-8".to_string()))?;

    let (method, rest) = [Method::Push, Method::Post, Method::Get]
        .into_iter()
        .find_map(|method| {
            line.strip_prefix(method.as_str())
                .and_then(|rest| rest.strip_prefix(' '))
                .map(|rest| (method, rest))
        })
        .ok_or_else(|| ProtocolError::Syntax(format!("unknown method in header '{line}'")))?;

    let end = rest
        .find(|c: char| c == PARAMS_DELIMITER || c == RECIPIENT_DELIMITER)
        .unwrap_or(rest.len());
    let (command, mut rest) = rest.split_at(end);
    if command.is_empty() {
        return Err(ProtocolError::Syntax(format!("missing command in header '{line}'")));
    }

    let mut params = None;
    if let Some(tail) = rest.strip_prefix(PARAMS_DELIMITER) {
        let end = tail.find(RECIPIENT_DELIMITER).unwrap_or(tail.len());
        let (value, tail) = tail.split_at(end);
        params = Some(value);
        rest = tail;
    }

    let recipient_id = rest.strip_prefix(RECIPIENT_DELIMITER);

    Ok(Header {
        method,
        command,
        params,
        recipient_id,
    })
}

fn parse_length(line: &[u8]) -> Result<usize, ProtocolError> {
    let invalid = || {
        ProtocolError::Syntax(format!(
            "expected '{LENGTH_PREFIX}<n>', found '{}'",
            String::from_utf8_lossy(line)
        ))
    };

    let digits = line
        .strip_prefix(LENGTH_PREFIX.as_bytes())
        .ok_or_else(invalid)?;
    if digits.is_empty() || !digits.iter().all(u8::is_ascii_digit) {
        return Err(invalid());
    }

    str::from_utf8(digits)
        .ok()
        .and_then(|digits| digits.parse().ok())
        .ok_or_else(invalid)
}

/// Write half of a connection, shared between every thread that sends frames.
///
/// Each [`send`](ConnectionWriter::send) holds the lock for the whole frame, so
/// frames from different writers never interleave on the wire.
pub struct ConnectionWriter<W: Write> {
    inner: Arc<Mutex<W>>,
}

impl<W: Write> Clone for ConnectionWriter<W> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<W: Write> ConnectionWriter<W> {
    pub fn new(inner: W) -> Self {
        Self {
            inner: Arc::new(Mutex::new(inner)),
        }
    }

    pub fn send(&self, bytes: &[u8]) -> Result<(), ProtocolError> {
        let mut writer = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        writer.write_all(bytes)?;
        writer.flush()?;
        trace!("wrote {} bytes", bytes.len());
        Ok(())
    }

    pub fn send_message(&self, msg: &Message) -> Result<(), ProtocolError> {
        self.send(&msg.encode())
    }
}

//! Frame codec and command body layouts shared by client and server.
//!
//! Wire format (all integers big-endian):
//! ```text
//! +-------------------+-----------+---------------------+
//! | LENGTH (u32)      | TAG (u8)  | BODY (LENGTH-1 B)   |
//! +-------------------+-----------+---------------------+
//! ```
//! The length counts the tag and the body but not itself.

use bytes::{Buf, BufMut, BytesMut};
use std::fmt;

use crate::error::FrameError;
use crate::protocol::{status, Command, LENGTH_PREFIX_SIZE, MAX_FRAME_SIZE, TAG_SIZE};

/// A decoded frame: command tag plus its command-specific body.
#[derive(Clone, PartialEq, Eq)]
pub struct Payload {
    pub command: Command,
    pub body: Vec<u8>,
}

impl Payload {
    pub fn new(command: Command, body: impl Into<Vec<u8>>) -> Self {
        Self {
            command,
            body: body.into(),
        }
    }

    pub fn empty(command: Command) -> Self {
        Self::new(command, Vec::new())
    }

    /// MESSAGE payload carrying UTF-8 text.
    pub fn message(text: impl AsRef<str>) -> Self {
        Self::new(Command::Message, text.as_ref().as_bytes())
    }

    /// Number of bytes the length prefix announces for this payload.
    pub fn wire_len(&self) -> usize {
        TAG_SIZE + self.body.len()
    }
}

impl fmt::Debug for Payload {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Payload")
            .field("command", &self.command)
            .field("body_len", &self.body.len())
            .finish()
    }
}

/// Validate a declared frame length against a cap.
pub fn validate_frame_size(size: usize, max: usize) -> Result<(), FrameError> {
    if size > max {
        return Err(FrameError::TooLarge { len: size, max });
    }
    if size < TAG_SIZE {
        return Err(FrameError::Empty);
    }
    Ok(())
}

/// Length prefix for a frame carrying `wire_len` bytes of tag and body.
pub fn frame_length(wire_len: usize) -> Result<u32, FrameError> {
    u32::try_from(wire_len).map_err(|_| FrameError::TooLarge {
        len: wire_len,
        max: u32::MAX as usize,
    })
}

/// Appends `len32be(1 + body) ++ tag ++ body` to `buf`.
///
/// Fails without touching `buf` when the length does not fit the prefix.
pub fn encode_frame(payload: &Payload, buf: &mut BytesMut) -> Result<(), FrameError> {
    let len = frame_length(payload.wire_len())?;
    buf.reserve(LENGTH_PREFIX_SIZE + payload.wire_len());
    buf.put_u32(len);
    buf.put_u8(payload.command.tag());
    buf.put_slice(&payload.body);
    Ok(())
}

/// Convenience wrapper that allocates and returns a new `BytesMut`.
pub fn encode_frame_to_bytes(payload: &Payload) -> Result<BytesMut, FrameError> {
    let mut buf = BytesMut::with_capacity(LENGTH_PREFIX_SIZE + payload.wire_len());
    encode_frame(payload, &mut buf)?;
    Ok(buf)
}

/// Incremental frame decoder.
///
/// Bytes are appended with [`FrameDecoder::extend`] as they arrive and
/// complete payloads are pulled with [`FrameDecoder::decode_next`]. A length
/// prefix is consumed exactly once: while the body is still incomplete the
/// decoder remembers the announced length and only waits for more bytes.
#[derive(Debug)]
pub struct FrameDecoder {
    buf: BytesMut,
    pending_len: Option<usize>,
    max_frame_size: usize,
}

impl Default for FrameDecoder {
    fn default() -> Self {
        Self::new(MAX_FRAME_SIZE)
    }
}

impl FrameDecoder {
    pub fn new(max_frame_size: usize) -> Self {
        Self {
            buf: BytesMut::with_capacity(8 * 1024),
            pending_len: None,
            max_frame_size,
        }
    }

    pub fn extend(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    /// Bytes received but not yet turned into a payload.
    pub fn buffered(&self) -> usize {
        self.buf.len()
    }

    /// * `Ok(Some(payload))`: a full frame was present and has been consumed.
    /// * `Ok(None)`: not enough bytes yet; feed more and call again.
    /// * `Err(..)`: oversized/empty frame or unknown tag. The stream has no
    ///   way to resynchronise, so the caller must close the connection.
    pub fn decode_next(&mut self) -> Result<Option<Payload>, FrameError> {
        let len = match self.pending_len {
            Some(len) => len,
            None => {
                if self.buf.len() < LENGTH_PREFIX_SIZE {
                    return Ok(None);
                }
                let len = self.buf.get_u32() as usize;
                validate_frame_size(len, self.max_frame_size)?;
                self.pending_len = Some(len);
                len
            }
        };

        if self.buf.len() < len {
            // Reserve up front so a large body doesn't regrow the buffer per read.
            self.buf.reserve(len - self.buf.len());
            return Ok(None);
        }

        self.pending_len = None;
        let mut frame = self.buf.split_to(len);
        let command = Command::try_from(frame.get_u8())?;
        Ok(Some(Payload {
            command,
            body: frame.to_vec(),
        }))
    }
}

// ── Body field codecs ────────────────────────────────────────────────

/// Appends a `len:u32 ++ utf8 bytes` string field.
pub fn put_string(buf: &mut BytesMut, value: &str) {
    #[allow(clippy::cast_possible_truncation)]
    buf.put_u32(value.len() as u32);
    buf.put_slice(value.as_bytes());
}

/// Reads a `len:u32 ++ utf8 bytes` string field, advancing `src`.
pub fn get_string(src: &mut &[u8], field: &'static str) -> Result<String, FrameError> {
    if src.remaining() < 4 {
        return Err(FrameError::Truncated(field));
    }
    let len = src.get_u32() as usize;
    if src.remaining() < len {
        return Err(FrameError::Truncated(field));
    }
    let raw = src[..len].to_vec();
    src.advance(len);
    String::from_utf8(raw).map_err(|_| FrameError::InvalidUtf8(field))
}

/// Login and password as carried by SIGN_UP and SIGN_IN requests.
#[derive(Clone, PartialEq, Eq)]
pub struct Credential {
    pub login: String,
    pub password: String,
}

impl Credential {
    pub fn new(login: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            login: login.into(),
            password: password.into(),
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut buf = BytesMut::with_capacity(8 + self.login.len() + self.password.len());
        put_string(&mut buf, &self.login);
        put_string(&mut buf, &self.password);
        buf.to_vec()
    }

    pub fn decode(mut body: &[u8]) -> Result<Self, FrameError> {
        let login = get_string(&mut body, "login")?;
        let password = get_string(&mut body, "password")?;
        Ok(Self { login, password })
    }
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credential")
            .field("login", &self.login)
            .field("password", &"<redacted>")
            .finish()
    }
}

/// MOVE request: `srcLen:u32 src dstLen:u32 dst`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MoveRequest {
    pub source: String,
    pub dest: String,
}

impl MoveRequest {
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = BytesMut::with_capacity(8 + self.source.len() + self.dest.len());
        put_string(&mut buf, &self.source);
        put_string(&mut buf, &self.dest);
        buf.to_vec()
    }

    pub fn decode(mut body: &[u8]) -> Result<Self, FrameError> {
        let source = get_string(&mut body, "move source")?;
        let dest = get_string(&mut body, "move destination")?;
        Ok(Self { source, dest })
    }
}

/// UPLOAD request: `pathLen:u32 path fileBytes(remainder)`.
#[derive(Clone, PartialEq, Eq)]
pub struct UploadRequest {
    pub path: String,
    pub data: Vec<u8>,
}

impl UploadRequest {
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = BytesMut::with_capacity(4 + self.path.len() + self.data.len());
        put_string(&mut buf, &self.path);
        buf.put_slice(&self.data);
        buf.to_vec()
    }

    pub fn decode(mut body: &[u8]) -> Result<Self, FrameError> {
        let path = get_string(&mut body, "upload path")?;
        Ok(Self {
            path,
            data: body.to_vec(),
        })
    }
}

impl fmt::Debug for UploadRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UploadRequest")
            .field("path", &self.path)
            .field("data_len", &self.data.len())
            .finish()
    }
}

/// Answer to SIGN_IN (and to a successful SIGN_UP).
///
/// Success: `status=1, loginLen:u32 login, wdLen:u32 wd`.
/// Failure: `status=2` optionally followed by `msgLen:u32 msg`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SignInResponse {
    Success { login: String, working_dir: String },
    Failure { message: Option<String> },
}

impl SignInResponse {
    pub fn failure(message: impl Into<String>) -> Self {
        SignInResponse::Failure {
            message: Some(message.into()),
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut buf = BytesMut::new();
        match self {
            SignInResponse::Success { login, working_dir } => {
                buf.put_u8(status::SUCCESS);
                put_string(&mut buf, login);
                put_string(&mut buf, working_dir);
            }
            SignInResponse::Failure { message } => {
                buf.put_u8(status::FAILURE);
                if let Some(message) = message {
                    put_string(&mut buf, message);
                }
            }
        }
        buf.to_vec()
    }

    pub fn decode(mut body: &[u8]) -> Result<Self, FrameError> {
        if !body.has_remaining() {
            return Err(FrameError::Truncated("sign-in status"));
        }
        match body.get_u8() {
            status::SUCCESS => {
                let login = get_string(&mut body, "login")?;
                let working_dir = get_string(&mut body, "working directory")?;
                Ok(SignInResponse::Success { login, working_dir })
            }
            status::FAILURE => {
                let message = if body.has_remaining() {
                    Some(get_string(&mut body, "failure message")?)
                } else {
                    None
                };
                Ok(SignInResponse::Failure { message })
            }
            other => Err(FrameError::InvalidStatus(other)),
        }
    }
}

/// TIME response body: epoch milliseconds as i64.
pub fn encode_time(epoch_millis: i64) -> Vec<u8> {
    epoch_millis.to_be_bytes().to_vec()
}

pub fn decode_time(mut body: &[u8]) -> Result<i64, FrameError> {
    if body.remaining() < 8 {
        return Err(FrameError::Truncated("timestamp"));
    }
    Ok(body.get_i64())
}

//! The slice of the Bolt protocol needed to open, authenticate, ping and close
//! a connection. Query execution is not supported.

use std::collections::HashMap;
use std::fmt;

use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::{AuthToken, DriverError};

pub(crate) const MAGIC: [u8; 4] = [0x60, 0x60, 0xB0, 0x17];

/// Versions offered during the handshake, most preferred first. All of them
/// carry credentials inside HELLO.
const PROPOSED_VERSIONS: [[u8; 4]; 4] = [[0, 0, 4, 4], [0, 0, 3, 4], [0, 0, 2, 4], [0, 0, 1, 4]];

const MAX_CHUNK: usize = u16::MAX as usize;

/// Largest message accepted from the server. Only summaries are ever read,
/// so anything close to this is a misbehaving peer.
pub(crate) const MAX_MESSAGE_SIZE: usize = 1024 * 1024;

const SIG_HELLO: u8 = 0x01;
const SIG_GOODBYE: u8 = 0x02;
const SIG_RESET: u8 = 0x0F;
const SIG_SUCCESS: u8 = 0x70;
const SIG_RECORD: u8 = 0x71;
const SIG_IGNORED: u8 = 0x7E;
const SIG_FAILURE: u8 = 0x7F;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BoltVersion {
    pub major: u8,
    pub minor: u8,
}

impl fmt::Display for BoltVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.major, self.minor)
    }
}

pub(crate) async fn handshake<S>(stream: &mut S) -> Result<BoltVersion, DriverError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut buf = BytesMut::with_capacity(20);
    buf.put_slice(&MAGIC);
    for version in PROPOSED_VERSIONS {
        buf.put_slice(&version);
    }
    stream.write_all(&buf).await?;
    stream.flush().await?;

    let mut agreed = [0u8; 4];
    stream.read_exact(&mut agreed).await?;
    match agreed {
        [0, 0, 0, 0] => Err(DriverError::Protocol(
            "server does not support any of the proposed bolt versions".to_string(),
        )),
        [b'H', b'T', b'T', b'P'] => Err(DriverError::Protocol(
            "server responded with HTTP, the endpoint is probably the HTTP port".to_string(),
        )),
        [_, _, minor, major] => Ok(BoltVersion { major, minor }),
    }
}

pub(crate) enum Request<'a> {
    Hello {
        user_agent: &'a str,
        auth: &'a AuthToken,
    },
    Reset,
    Goodbye,
}

impl Request<'_> {
    pub(crate) fn encode(&self) -> Bytes {
        let mut buf = BytesMut::new();
        match self {
            Request::Hello { user_agent, auth } => {
                put_struct_header(&mut buf, 1, SIG_HELLO);
                match auth {
                    AuthToken::None => {
                        put_map_header(&mut buf, 2);
                        put_string(&mut buf, "user_agent");
                        put_string(&mut buf, user_agent);
                        put_string(&mut buf, "scheme");
                        put_string(&mut buf, "none");
                    }
                    AuthToken::Basic { username, password } => {
                        put_map_header(&mut buf, 4);
                        put_string(&mut buf, "user_agent");
                        put_string(&mut buf, user_agent);
                        put_string(&mut buf, "scheme");
                        put_string(&mut buf, "basic");
                        put_string(&mut buf, "principal");
                        put_string(&mut buf, username);
                        put_string(&mut buf, "credentials");
                        put_string(&mut buf, password);
                    }
                }
            }
            Request::Reset => put_struct_header(&mut buf, 0, SIG_RESET),
            Request::Goodbye => put_struct_header(&mut buf, 0, SIG_GOODBYE),
        }
        buf.freeze()
    }

    /// Signature byte of an encoded request, used by the fake server.
    pub(crate) fn signature_of(message: &[u8]) -> Option<u8> {
        message.get(1).copied()
    }

    pub(crate) const HELLO: u8 = SIG_HELLO;
    pub(crate) const RESET: u8 = SIG_RESET;
    pub(crate) const GOODBYE: u8 = SIG_GOODBYE;
}

#[derive(Debug, PartialEq, Eq)]
pub(crate) enum Response {
    Success,
    Record,
    Ignored,
    Failure { code: String, message: String },
}

impl Response {
    pub(crate) fn decode(message: &[u8]) -> Result<Response, DriverError> {
        let [marker, signature, rest @ ..] = message else {
            return Err(DriverError::Protocol(format!(
                "response too short: {} bytes",
                message.len()
            )));
        };
        if marker & 0xF0 != 0xB0 {
            return Err(DriverError::Protocol(format!(
                "expected a structure, got marker {marker:#04x}"
            )));
        }
        match *signature {
            SIG_SUCCESS => Ok(Response::Success),
            SIG_RECORD => Ok(Response::Record),
            SIG_IGNORED => Ok(Response::Ignored),
            SIG_FAILURE => {
                let mut metadata = read_string_map(&mut &rest[..]).unwrap_or_default();
                Ok(Response::Failure {
                    code: metadata
                        .remove("code")
                        .unwrap_or_else(|| "Neo.DatabaseError.General.UnknownError".to_string()),
                    message: metadata.remove("message").unwrap_or_default(),
                })
            }
            other => Err(DriverError::Protocol(format!(
                "unexpected response signature {other:#04x}"
            ))),
        }
    }

    pub(crate) fn encode(&self) -> Bytes {
        let mut buf = BytesMut::new();
        match self {
            Response::Success => {
                put_struct_header(&mut buf, 1, SIG_SUCCESS);
                put_map_header(&mut buf, 0);
            }
            Response::Record => {
                put_struct_header(&mut buf, 1, SIG_RECORD);
                buf.put_u8(0x90);
            }
            Response::Ignored => put_struct_header(&mut buf, 0, SIG_IGNORED),
            Response::Failure { code, message } => {
                put_struct_header(&mut buf, 1, SIG_FAILURE);
                put_map_header(&mut buf, 2);
                put_string(&mut buf, "code");
                put_string(&mut buf, code);
                put_string(&mut buf, "message");
                put_string(&mut buf, message);
            }
        }
        buf.freeze()
    }

    /// Turns a summary into the outcome of the request it answers.
    pub(crate) fn into_result(self) -> Result<(), DriverError> {
        match self {
            Response::Success => Ok(()),
            Response::Failure { code, message } if is_auth_failure(&code) => {
                Err(DriverError::AuthRejected(message))
            }
            Response::Failure { code, message } => Err(DriverError::ServerFailure { code, message }),
            Response::Record | Response::Ignored => Err(DriverError::Protocol(
                "expected a summary message".to_string(),
            )),
        }
    }
}

fn is_auth_failure(code: &str) -> bool {
    code.starts_with("Neo.ClientError.Security.")
}

pub(crate) async fn write_message<S>(stream: &mut S, message: &[u8]) -> Result<(), DriverError>
where
    S: AsyncWrite + Unpin,
{
    let mut buf = BytesMut::with_capacity(message.len() + 4);
    for chunk in message.chunks(MAX_CHUNK) {
        buf.put_u16(chunk.len() as u16);
        buf.put_slice(chunk);
    }
    buf.put_u16(0);
    stream.write_all(&buf).await?;
    stream.flush().await?;
    Ok(())
}

pub(crate) async fn read_message<S>(stream: &mut S) -> Result<Bytes, DriverError>
where
    S: AsyncRead + Unpin,
{
    let mut message = BytesMut::new();
    loop {
        let len = stream.read_u16().await? as usize;
        if len == 0 {
            // an empty message is a keep-alive NOOP
            if message.is_empty() {
                continue;
            }
            return Ok(message.freeze());
        }
        let start = message.len();
        if start + len > MAX_MESSAGE_SIZE {
            return Err(DriverError::Protocol(format!(
                "message exceeds {MAX_MESSAGE_SIZE} bytes"
            )));
        }
        message.resize(start + len, 0);
        stream.read_exact(&mut message[start..]).await?;
    }
}

fn put_struct_header(buf: &mut BytesMut, fields: u8, signature: u8) {
    buf.put_u8(0xB0 | fields);
    buf.put_u8(signature);
}

fn put_map_header(buf: &mut BytesMut, len: usize) {
    if len < 16 {
        buf.put_u8(0xA0 | len as u8);
    } else {
        buf.put_u8(0xD8);
        buf.put_u8(len as u8);
    }
}

fn put_string(buf: &mut BytesMut, value: &str) {
    let bytes = value.as_bytes();
    match bytes.len() {
        n if n < 16 => buf.put_u8(0x80 | n as u8),
        n if n <= u8::MAX as usize => {
            buf.put_u8(0xD0);
            buf.put_u8(n as u8);
        }
        n if n <= u16::MAX as usize => {
            buf.put_u8(0xD1);
            buf.put_u16(n as u16);
        }
        n => {
            buf.put_u8(0xD2);
            buf.put_u32(n as u32);
        }
    }
    buf.put_slice(bytes);
}

/// Reads a map whose keys and values are all strings. Anything else is
/// reported as `None` rather than an error, callers fall back to defaults.
fn read_string_map(buf: &mut &[u8]) -> Option<HashMap<String, String>> {
    let len = match take_u8(buf)? {
        marker @ 0xA0..=0xAF => (marker & 0x0F) as usize,
        0xD8 => take_u8(buf)? as usize,
        0xD9 => {
            if buf.remaining() < 2 {
                return None;
            }
            buf.get_u16() as usize
        }
        _ => return None,
    };
    let mut map = HashMap::with_capacity(len);
    for _ in 0..len {
        let key = read_string(buf)?;
        let value = read_string(buf)?;
        map.insert(key, value);
    }
    Some(map)
}

fn read_string(buf: &mut &[u8]) -> Option<String> {
    let len = match take_u8(buf)? {
        marker @ 0x80..=0x8F => (marker & 0x0F) as usize,
        0xD0 => take_u8(buf)? as usize,
        0xD1 => {
            if buf.remaining() < 2 {
                return None;
            }
            buf.get_u16() as usize
        }
        0xD2 => {
            if buf.remaining() < 4 {
                return None;
            }
            buf.get_u32() as usize
        }
        _ => return None,
    };
    if buf.remaining() < len {
        return None;
    }
    let value = String::from_utf8(buf[..len].to_vec()).ok()?;
    buf.advance(len);
    Some(value)
}

fn take_u8(buf: &mut &[u8]) -> Option<u8> {
    if buf.has_remaining() {
        Some(buf.get_u8())
    } else {
        None
    }
}

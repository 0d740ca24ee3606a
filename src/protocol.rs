//! Wire protocol for BlobVault
//!
//! Three layers live here:
//! - transport frames: an 8-byte little-endian length and that many bytes
//! - request bodies: an 8-byte opcode followed by length-prefixed fields
//! - response bodies: a length-prefixed status token and optional payload
//!
//! Request and response bodies are parsed with nom; nothing here touches
//! encryption, which happens between the frame and body layers.

use crate::error::{Result, VaultError};
use bytes::Bytes;
use nom::{
    bytes::complete::take,
    combinator::{eof, map_res},
    number::complete::le_u64,
    IResult,
};
use std::fmt;
use std::str;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Longest accepted username, in bytes
pub const MAX_USERNAME_LEN: usize = 64;
/// Longest accepted password, in bytes
pub const MAX_PASSWORD_LEN: usize = 128;
/// Longest accepted key, in bytes
pub const MAX_KEY_LEN: usize = 128;

/// First frame of a connection asking for the server's public key
pub const KEY_REQUEST: &[u8; 8] = b"KEY_____";
/// First frame of a connection carrying a wrapped session key
pub const SESSION_REQUEST: &[u8; 8] = b"SESSION_";

/// Operations understood by the server
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Opcode {
    Register,
    Shutdown,
    Persist,
    SetContent,
    GetContent,
    AllUsers,
    Insert,
    Get,
    Delete,
    Upsert,
    AllKeys,
    TopKeys,
}

impl Opcode {
    const ALL: [Opcode; 12] = [
        Opcode::Register,
        Opcode::Shutdown,
        Opcode::Persist,
        Opcode::SetContent,
        Opcode::GetContent,
        Opcode::AllUsers,
        Opcode::Insert,
        Opcode::Get,
        Opcode::Delete,
        Opcode::Upsert,
        Opcode::AllKeys,
        Opcode::TopKeys,
    ];

    pub fn tag(self) -> &'static [u8; 8] {
        match self {
            Opcode::Register => b"REG_____",
            Opcode::Shutdown => b"BYE_____",
            Opcode::Persist => b"SAV_____",
            Opcode::SetContent => b"SET_____",
            Opcode::GetContent => b"GET_____",
            Opcode::AllUsers => b"ALL_____",
            Opcode::Insert => b"KVI_____",
            Opcode::Get => b"KVG_____",
            Opcode::Delete => b"KVD_____",
            Opcode::Upsert => b"KVU_____",
            Opcode::AllKeys => b"KVA_____",
            Opcode::TopKeys => b"KVT_____",
        }
    }

    pub fn from_tag(tag: &[u8]) -> Option<Opcode> {
        Opcode::ALL.into_iter().find(|op| op.tag() == tag)
    }
}

/// Operation-specific part of a request
#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    Register,
    Shutdown,
    Persist,
    SetContent { content: Bytes },
    GetContent { who: String },
    AllUsers,
    Insert { key: String, value: Bytes },
    Get { key: String },
    Delete { key: String },
    Upsert { key: String, value: Bytes },
    AllKeys,
    TopKeys,
}

impl Command {
    pub fn opcode(&self) -> Opcode {
        match self {
            Command::Register => Opcode::Register,
            Command::Shutdown => Opcode::Shutdown,
            Command::Persist => Opcode::Persist,
            Command::SetContent { .. } => Opcode::SetContent,
            Command::GetContent { .. } => Opcode::GetContent,
            Command::AllUsers => Opcode::AllUsers,
            Command::Insert { .. } => Opcode::Insert,
            Command::Get { .. } => Opcode::Get,
            Command::Delete { .. } => Opcode::Delete,
            Command::Upsert { .. } => Opcode::Upsert,
            Command::AllKeys => Opcode::AllKeys,
            Command::TopKeys => Opcode::TopKeys,
        }
    }
}

/// A decoded request: who is asking, and what for
#[derive(Debug, Clone, PartialEq)]
pub struct Request {
    pub user: String,
    pub password: String,
    pub command: Command,
}

impl Request {
    pub fn new(user: impl Into<String>, password: impl Into<String>, command: Command) -> Self {
        Self {
            user: user.into(),
            password: password.into(),
            command,
        }
    }

    /// Serialize the request body (before encryption)
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(64);
        out.extend_from_slice(self.command.opcode().tag());
        put_field(&mut out, self.user.as_bytes());
        put_field(&mut out, self.password.as_bytes());
        match &self.command {
            Command::SetContent { content } => put_field(&mut out, content),
            Command::GetContent { who } => put_field(&mut out, who.as_bytes()),
            Command::Insert { key, value } | Command::Upsert { key, value } => {
                put_field(&mut out, key.as_bytes());
                put_field(&mut out, value);
            }
            Command::Get { key } | Command::Delete { key } => put_field(&mut out, key.as_bytes()),
            Command::Register
            | Command::Shutdown
            | Command::Persist
            | Command::AllUsers
            | Command::AllKeys
            | Command::TopKeys => {}
        }
        out
    }
}

/// Status token carried by every response
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Status {
    Ok,
    OkInsert,
    OkUpdate,
    ErrLogin,
    ErrKey,
    ErrReqFmt,
    ErrNoData,
    ErrUserExists,
    ErrQuotaDown,
    ErrQuotaUp,
    ErrQuotaReq,
}

impl Status {
    const ALL: [Status; 11] = [
        Status::Ok,
        Status::OkInsert,
        Status::OkUpdate,
        Status::ErrLogin,
        Status::ErrKey,
        Status::ErrReqFmt,
        Status::ErrNoData,
        Status::ErrUserExists,
        Status::ErrQuotaDown,
        Status::ErrQuotaUp,
        Status::ErrQuotaReq,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Status::Ok => "OK",
            Status::OkInsert => "OK_INSERT",
            Status::OkUpdate => "OK_UPDATE",
            Status::ErrLogin => "ERR_LOGIN",
            Status::ErrKey => "ERR_KEY",
            Status::ErrReqFmt => "ERR_REQ_FMT",
            Status::ErrNoData => "ERR_NO_DATA",
            Status::ErrUserExists => "ERR_USER_EXISTS",
            Status::ErrQuotaDown => "ERR_QUOTA_DOWN",
            Status::ErrQuotaUp => "ERR_QUOTA_UP",
            Status::ErrQuotaReq => "ERR_QUOTA_REQ",
        }
    }

    pub fn from_token(token: &str) -> Option<Status> {
        Status::ALL.into_iter().find(|s| s.as_str() == token)
    }

    pub fn is_ok(self) -> bool {
        matches!(self, Status::Ok | Status::OkInsert | Status::OkUpdate)
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Response types from the server
#[derive(Debug, Clone, PartialEq)]
pub struct Response {
    pub status: Status,
    pub payload: Option<Bytes>,
}

impl Response {
    pub fn status(status: Status) -> Self {
        Self {
            status,
            payload: None,
        }
    }

    pub fn with_payload(status: Status, payload: impl Into<Bytes>) -> Self {
        Self {
            status,
            payload: Some(payload.into()),
        }
    }

    /// Serialize response to bytes (before encryption)
    pub fn to_bytes(&self) -> Vec<u8> {
        let token = self.status.as_str().as_bytes();
        let payload_len = self.payload.as_ref().map_or(0, |p| p.len() + 8);
        let mut out = Vec::with_capacity(8 + token.len() + payload_len);
        put_field(&mut out, token);
        if let Some(payload) = &self.payload {
            put_field(&mut out, payload);
        }
        out
    }
}

/// Render entries as a newline-terminated listing
pub fn listing<I, S>(entries: I) -> Vec<u8>
where
    I: IntoIterator<Item = S>,
    S: AsRef<[u8]>,
{
    let mut out = Vec::new();
    for entry in entries {
        out.extend_from_slice(entry.as_ref());
        out.push(b'\n');
    }
    out
}

/// Split a newline-terminated listing back into entries
pub fn parse_listing(payload: &[u8]) -> Vec<String> {
    payload
        .split(|b| *b == b'\n')
        .filter(|line| !line.is_empty())
        .map(|line| String::from_utf8_lossy(line).into_owned())
        .collect()
}

/// Append an 8-byte little-endian length followed by the bytes
pub fn put_field(out: &mut Vec<u8>, bytes: &[u8]) {
    out.extend_from_slice(&(bytes.len() as u64).to_le_bytes());
    out.extend_from_slice(bytes);
}

/// Parse a length-prefixed field
pub fn field(input: &[u8]) -> IResult<&[u8], &[u8]> {
    let (input, len) = le_u64(input)?;
    let len = usize::try_from(len).unwrap_or(usize::MAX);
    take(len)(input)
}

fn utf8_field(input: &[u8]) -> IResult<&[u8], &str> {
    map_res(field, str::from_utf8)(input)
}

/// A UTF-8 field of 1..=max bytes
fn bounded_string(input: &[u8], max: usize) -> IResult<&[u8], String> {
    map_res(utf8_field, |s: &str| {
        if s.is_empty() || s.len() > max {
            Err("field length out of range")
        } else {
            Ok(s.to_string())
        }
    })(input)
}

fn command_body(opcode: Opcode, input: &[u8]) -> IResult<&[u8], Command> {
    match opcode {
        Opcode::Register => Ok((input, Command::Register)),
        Opcode::Shutdown => Ok((input, Command::Shutdown)),
        Opcode::Persist => Ok((input, Command::Persist)),
        Opcode::AllUsers => Ok((input, Command::AllUsers)),
        Opcode::AllKeys => Ok((input, Command::AllKeys)),
        Opcode::TopKeys => Ok((input, Command::TopKeys)),
        Opcode::SetContent => {
            let (input, content) = field(input)?;
            Ok((
                input,
                Command::SetContent {
                    content: Bytes::copy_from_slice(content),
                },
            ))
        }
        Opcode::GetContent => {
            let (input, who) = bounded_string(input, MAX_USERNAME_LEN)?;
            Ok((input, Command::GetContent { who }))
        }
        Opcode::Insert | Opcode::Upsert => {
            let (input, key) = bounded_string(input, MAX_KEY_LEN)?;
            let (input, value) = field(input)?;
            let value = Bytes::copy_from_slice(value);
            let command = if opcode == Opcode::Insert {
                Command::Insert { key, value }
            } else {
                Command::Upsert { key, value }
            };
            Ok((input, command))
        }
        Opcode::Get | Opcode::Delete => {
            let (input, key) = bounded_string(input, MAX_KEY_LEN)?;
            let command = if opcode == Opcode::Get {
                Command::Get { key }
            } else {
                Command::Delete { key }
            };
            Ok((input, command))
        }
    }
}

fn request_parser(input: &[u8]) -> IResult<&[u8], Request> {
    let (input, opcode) = map_res(take(8usize), |tag: &[u8]| {
        Opcode::from_tag(tag).ok_or("unknown opcode")
    })(input)?;
    let (input, user) = bounded_string(input, MAX_USERNAME_LEN)?;
    let (input, password) = bounded_string(input, MAX_PASSWORD_LEN)?;
    let (input, command) = command_body(opcode, input)?;
    let (input, _) = eof(input)?;
    Ok((
        input,
        Request {
            user,
            password,
            command,
        },
    ))
}

/// Parse a complete request body
pub fn parse_request(input: &[u8]) -> Result<Request> {
    let (_, request) = request_parser(input)?;
    Ok(request)
}

fn response_parser(input: &[u8]) -> IResult<&[u8], Response> {
    let (input, status) = map_res(utf8_field, |token: &str| {
        Status::from_token(token).ok_or("unknown status")
    })(input)?;
    if input.is_empty() {
        return Ok((input, Response::status(status)));
    }
    let (input, payload) = field(input)?;
    let (input, _) = eof(input)?;
    Ok((
        input,
        Response::with_payload(status, Bytes::copy_from_slice(payload)),
    ))
}

/// Parse a complete response body
pub fn parse_response(input: &[u8]) -> Result<Response> {
    let (_, response) = response_parser(input)?;
    Ok(response)
}

/// Read one length-prefixed frame. `Ok(None)` means the peer closed the
/// connection cleanly between frames.
pub async fn read_frame<R>(reader: &mut R, limit: usize) -> Result<Option<Vec<u8>>>
where
    R: AsyncRead + Unpin,
{
    let mut len_buf = [0u8; 8];
    let mut filled = 0;
    while filled < len_buf.len() {
        let n = reader.read(&mut len_buf[filled..]).await?;
        if n == 0 {
            if filled == 0 {
                return Ok(None);
            }
            return Err(VaultError::Protocol("connection closed mid-frame".to_string()));
        }
        filled += n;
    }

    let len = u64::from_le_bytes(len_buf);
    if len > limit as u64 {
        return Err(VaultError::Protocol(format!(
            "frame of {} bytes exceeds limit of {}",
            len, limit
        )));
    }

    let mut frame = vec![0u8; len as usize];
    reader.read_exact(&mut frame).await?;
    Ok(Some(frame))
}

/// Write one length-prefixed frame and flush it
pub async fn write_frame<W>(writer: &mut W, frame: &[u8]) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    writer.write_all(&(frame.len() as u64).to_le_bytes()).await?;
    writer.write_all(frame).await?;
    writer.flush().await?;
    Ok(())
}

//! RESP2 wire codec.
//!
//! Decoding follows a "decode one, report consumed, keep remainder" contract: [`decode_one`]
//! never consumes a partial reply, so callers can append the next read to the same buffer and
//! try again. [`RespCodec`] does the same across reads but keeps finished array elements, so
//! it does not rescan them. Arbitrary I/O fragmentation, down to single bytes, decodes
//! identically to one large read.

use std::collections::HashMap;

use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use crate::cmd::Cmd;
use crate::CustomRedisError;

/// Same limit as the server's default `proto-max-bulk-len`.
pub const MAX_BULK_LENGTH: i64 = 512 * 1024 * 1024;

/// Header lines (type byte, length, integer, simple string) are never this long in practice.
const MAX_LINE_LENGTH: usize = 64 * 1024;

const MAX_NESTING_DEPTH: usize = 32;

const CRLF: &[u8] = b"\r\n";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reply {
    SimpleString(String),
    Error(String),
    Integer(i64),
    /// `None` is the null bulk string (`$-1`), distinct from an empty one.
    BulkString(Option<Bytes>),
    /// `None` is the null array (`*-1`), distinct from an empty one.
    Array(Option<Vec<Reply>>),
}

impl Reply {
    pub fn ok() -> Self {
        Reply::SimpleString("OK".to_string())
    }

    pub fn bulk(value: impl Into<Bytes>) -> Self {
        Reply::BulkString(Some(value.into()))
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Reply::BulkString(None) | Reply::Array(None))
    }

    /// Turns an `Error` reply into [`CustomRedisError::Server`].
    pub fn into_result(self) -> Result<Reply, CustomRedisError> {
        match self {
            Reply::Error(message) => Err(CustomRedisError::Server(message)),
            other => Ok(other),
        }
    }

    /// Raw wire form of this reply.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = BytesMut::new();
        self.write_to(&mut out);
        out.to_vec()
    }

    pub fn write_to(&self, out: &mut BytesMut) {
        match self {
            Reply::SimpleString(text) => write_line(out, b'+', text.as_bytes()),
            Reply::Error(text) => write_line(out, b'-', text.as_bytes()),
            Reply::Integer(n) => write_line(out, b':', n.to_string().as_bytes()),
            Reply::BulkString(None) => out.put_slice(b"$-1\r\n"),
            Reply::BulkString(Some(bytes)) => {
                write_line(out, b'$', bytes.len().to_string().as_bytes());
                out.put_slice(bytes);
                out.put_slice(CRLF);
            }
            Reply::Array(None) => out.put_slice(b"*-1\r\n"),
            Reply::Array(Some(items)) => {
                write_line(out, b'*', items.len().to_string().as_bytes());
                for item in items {
                    item.write_to(out);
                }
            }
        }
    }

    pub fn into_integer(self) -> Result<i64, CustomRedisError> {
        match self.into_result()? {
            Reply::Integer(n) => Ok(n),
            other => Err(unexpected("integer", &other)),
        }
    }

    pub fn into_bool(self) -> Result<bool, CustomRedisError> {
        Ok(self.into_integer()? != 0)
    }

    pub fn into_count(self) -> Result<u64, CustomRedisError> {
        let n = self.into_integer()?;
        u64::try_from(n).map_err(|_| {
            CustomRedisError::UnexpectedReply(format!("expected a non-negative count, got {n}"))
        })
    }

    /// Status replies such as `+OK` or `+set`.
    pub fn into_status(self) -> Result<String, CustomRedisError> {
        match self.into_result()? {
            Reply::SimpleString(text) => Ok(text),
            other => Err(unexpected("status", &other)),
        }
    }

    pub fn into_optional_string(self) -> Result<Option<String>, CustomRedisError> {
        match self.into_result()? {
            Reply::BulkString(None) => Ok(None),
            Reply::BulkString(Some(bytes)) => String::from_utf8(bytes.to_vec())
                .map(Some)
                .map_err(|e| CustomRedisError::UnexpectedReply(e.to_string())),
            Reply::SimpleString(text) => Ok(Some(text)),
            other => Err(unexpected("bulk string", &other)),
        }
    }

    /// A null array is treated as empty; null elements are skipped.
    pub fn into_string_vec(self) -> Result<Vec<String>, CustomRedisError> {
        match self.into_result()? {
            Reply::Array(None) => Ok(Vec::new()),
            Reply::Array(Some(items)) => items
                .into_iter()
                .map(Reply::into_optional_string)
                .filter_map(Result::transpose)
                .collect(),
            other => Err(unexpected("array", &other)),
        }
    }

    pub fn into_bool_vec(self) -> Result<Vec<bool>, CustomRedisError> {
        match self.into_result()? {
            Reply::Array(None) => Ok(Vec::new()),
            Reply::Array(Some(items)) => items.into_iter().map(Reply::into_bool).collect(),
            other => Err(unexpected("array", &other)),
        }
    }

    /// Flat `[field, value, field, value, ...]` array as returned by HGETALL.
    pub fn into_string_map(self) -> Result<HashMap<String, String>, CustomRedisError> {
        let flat = self.into_string_vec()?;
        if flat.len() % 2 != 0 {
            return Err(CustomRedisError::UnexpectedReply(format!(
                "expected field/value pairs, got {} elements",
                flat.len()
            )));
        }
        let mut map = HashMap::with_capacity(flat.len() / 2);
        let mut iter = flat.into_iter();
        while let (Some(field), Some(value)) = (iter.next(), iter.next()) {
            map.insert(field, value);
        }
        Ok(map)
    }
}

fn unexpected(expected: &str, got: &Reply) -> CustomRedisError {
    CustomRedisError::UnexpectedReply(format!("expected {expected}, got {got:?}"))
}

fn write_line(out: &mut BytesMut, tag: u8, body: &[u8]) {
    out.put_u8(tag);
    out.put_slice(body);
    out.put_slice(CRLF);
}

/// Encode a command as `*<argc>\r\n` followed by `$<len>\r\n<arg>\r\n` per argument.
pub fn encode(cmd: &Cmd) -> Bytes {
    let mut out = BytesMut::with_capacity(cmd.encoded_len());
    encode_into(cmd, &mut out);
    out.freeze()
}

pub fn encode_into(cmd: &Cmd, out: &mut BytesMut) {
    let args = cmd.arguments();
    out.reserve(cmd.encoded_len());
    write_line(out, b'*', args.len().to_string().as_bytes());
    for arg in args {
        // Lengths are byte lengths, not character counts
        write_line(out, b'$', arg.len().to_string().as_bytes());
        out.put_slice(arg);
        out.put_slice(CRLF);
    }
}

/// Decode exactly one reply from the front of `buf`.
///
/// Returns `Ok(None)` when `buf` does not yet hold a complete reply; nothing is consumed in that
/// case. On success returns the reply and the number of bytes it occupied.
pub fn decode_one(buf: &[u8]) -> Result<Option<(Reply, usize)>, CustomRedisError> {
    parse(buf, 0, 0)
}

fn parse(
    buf: &[u8],
    pos: usize,
    depth: usize,
) -> Result<Option<(Reply, usize)>, CustomRedisError> {
    let Some(&tag) = buf.get(pos) else {
        return Ok(None);
    };
    if !matches!(tag, b'+' | b'-' | b':' | b'$' | b'*') {
        return Err(CustomRedisError::ProtocolViolation(format!(
            "unexpected reply type byte 0x{tag:02x}"
        )));
    }
    let Some((line, next)) = read_line(buf, pos + 1)? else {
        return Ok(None);
    };

    match tag {
        b'+' => Ok(Some((Reply::SimpleString(utf8(line)?), next))),
        b'-' => Ok(Some((Reply::Error(utf8(line)?), next))),
        b':' => Ok(Some((Reply::Integer(parse_int(line)?), next))),
        b'$' => parse_bulk(buf, line, next),
        _ => parse_array(buf, line, next, depth),
    }
}

fn parse_bulk(
    buf: &[u8],
    line: &[u8],
    start: usize,
) -> Result<Option<(Reply, usize)>, CustomRedisError> {
    let len = parse_int(line)?;
    if len == -1 {
        return Ok(Some((Reply::BulkString(None), start)));
    }
    if !(0..=MAX_BULK_LENGTH).contains(&len) {
        return Err(CustomRedisError::ProtocolViolation(format!(
            "invalid bulk string length {len}"
        )));
    }
    let end = start + len as usize;
    if buf.len() < end + CRLF.len() {
        return Ok(None);
    }
    if &buf[end..end + CRLF.len()] != CRLF {
        return Err(CustomRedisError::ProtocolViolation(format!(
            "bulk string of declared length {len} is not terminated by CRLF"
        )));
    }
    let body = Bytes::copy_from_slice(&buf[start..end]);
    Ok(Some((Reply::BulkString(Some(body)), end + CRLF.len())))
}

fn parse_array(
    buf: &[u8],
    line: &[u8],
    start: usize,
    depth: usize,
) -> Result<Option<(Reply, usize)>, CustomRedisError> {
    let count = parse_int(line)?;
    if count == -1 {
        return Ok(Some((Reply::Array(None), start)));
    }
    if count < 0 {
        return Err(CustomRedisError::ProtocolViolation(format!(
            "invalid array length {count}"
        )));
    }
    if depth >= MAX_NESTING_DEPTH {
        return Err(CustomRedisError::ProtocolViolation(
            "arrays nested too deeply".to_string(),
        ));
    }

    // Capacity is capped: the declared count is untrusted until the elements arrive
    let mut items = Vec::with_capacity(count.min(1024) as usize);
    let mut cursor = start;
    for _ in 0..count {
        match parse(buf, cursor, depth + 1)? {
            Some((item, after)) => {
                items.push(item);
                cursor = after;
            }
            // A partial array is never surfaced
            None => return Ok(None),
        }
    }
    Ok(Some((Reply::Array(Some(items)), cursor)))
}

/// Returns the line starting at `start` (without CRLF) and the offset just past its CRLF.
fn read_line(buf: &[u8], start: usize) -> Result<Option<(&[u8], usize)>, CustomRedisError> {
    let rest = &buf[start.min(buf.len())..];
    match rest.windows(CRLF.len()).position(|window| window == CRLF) {
        Some(offset) => Ok(Some((&rest[..offset], start + offset + CRLF.len()))),
        None if rest.len() > MAX_LINE_LENGTH => Err(CustomRedisError::ProtocolViolation(
            format!("header line exceeds {MAX_LINE_LENGTH} bytes"),
        )),
        None => Ok(None),
    }
}

fn utf8(line: &[u8]) -> Result<String, CustomRedisError> {
    String::from_utf8(line.to_vec())
        .map_err(|e| CustomRedisError::ProtocolViolation(format!("non UTF-8 status line: {e}")))
}

fn parse_int(line: &[u8]) -> Result<i64, CustomRedisError> {
    std::str::from_utf8(line)
        .ok()
        .and_then(|text| text.parse::<i64>().ok())
        .ok_or_else(|| {
            CustomRedisError::ProtocolViolation(format!(
                "invalid integer {:?}",
                String::from_utf8_lossy(line)
            ))
        })
}

/// [`Decoder`]/[`Encoder`] adapter so the codec can drive a read buffer the way `Framed` does.
///
/// Unlike [`decode_one`], the decoder consumes array elements as soon as they are complete and
/// keeps the partially built arrays itself, so a large reply arriving over many reads is parsed
/// once rather than from its first byte on every read. Call [`RespCodec::reset`] before reusing
/// it on a new stream.
#[derive(Debug, Default, Clone)]
pub struct RespCodec {
    partial: Vec<PartialArray>,
}

#[derive(Debug, Clone)]
struct PartialArray {
    remaining: usize,
    items: Vec<Reply>,
}

enum Frame {
    Value(Reply),
    ArrayHeader(usize),
}

impl RespCodec {
    /// Drop any half-decoded reply.
    pub fn reset(&mut self) {
        self.partial.clear();
    }

    /// Whether a reply has been started but not finished.
    pub fn is_mid_reply(&self) -> bool {
        !self.partial.is_empty()
    }
}

/// A scalar reply or the header of a non-null, non-empty array.
fn parse_frame(buf: &[u8]) -> Result<Option<(Frame, usize)>, CustomRedisError> {
    if buf.first() != Some(&b'*') {
        return Ok(parse(buf, 0, 0)?.map(|(reply, consumed)| (Frame::Value(reply), consumed)));
    }
    let Some((line, next)) = read_line(buf, 1)? else {
        return Ok(None);
    };
    match parse_int(line)? {
        -1 => Ok(Some((Frame::Value(Reply::Array(None)), next))),
        0 => Ok(Some((Frame::Value(Reply::Array(Some(vec![]))), next))),
        count if count > 0 => Ok(Some((Frame::ArrayHeader(count as usize), next))),
        count => Err(CustomRedisError::ProtocolViolation(format!(
            "invalid array length {count}"
        ))),
    }
}

impl Decoder for RespCodec {
    type Item = Reply;
    type Error = CustomRedisError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Reply>, CustomRedisError> {
        loop {
            let Some((frame, consumed)) = parse_frame(src)? else {
                return Ok(None);
            };
            src.advance(consumed);

            let mut value = match frame {
                Frame::Value(reply) => reply,
                Frame::ArrayHeader(count) => {
                    if self.partial.len() >= MAX_NESTING_DEPTH {
                        return Err(CustomRedisError::ProtocolViolation(
                            "arrays nested too deeply".to_string(),
                        ));
                    }
                    // Capacity is capped: the declared count is untrusted until the elements arrive
                    self.partial.push(PartialArray {
                        remaining: count,
                        items: Vec::with_capacity(count.min(1024)),
                    });
                    continue;
                }
            };

            // Fold the finished value into its parents, closing every array it completes
            loop {
                let Some(top) = self.partial.last_mut() else {
                    return Ok(Some(value));
                };
                top.items.push(value);
                top.remaining -= 1;
                if top.remaining > 0 {
                    break;
                }
                let Some(done) = self.partial.pop() else {
                    break;
                };
                value = Reply::Array(Some(done.items));
            }
        }
    }
}

impl<'a> Encoder<&'a Cmd> for RespCodec {
    type Error = CustomRedisError;

    fn encode(&mut self, item: &'a Cmd, dst: &mut BytesMut) -> Result<(), CustomRedisError> {
        encode_into(item, dst);
        Ok(())
    }
}

//! RESP2 framing for the pub/sub broker connection.
//!
//! The broker speaks the Redis serialization protocol. Only the subset the
//! subscriber needs is implemented: commands go out as arrays of bulk
//! strings, replies and pushes come back as any RESP2 value.
//!
//! ```text
//! +OK\r\n                 simple string
//! -ERR reason\r\n         error
//! :3\r\n                  integer
//! $5\r\nhello\r\n         bulk string ($-1 = null)
//! *2\r\n...               array (*-1 = null)
//! ```

use bytes::{Buf, BufMut, Bytes, BytesMut};
use thiserror::Error;
use tokio_util::codec::{Decoder, Encoder};

/// Largest bulk string or array accepted from the broker (16 MB).
pub const MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;

/// Maximum array nesting accepted from the broker.
const MAX_DEPTH: usize = 8;

/// RESP framing errors.
#[derive(Error, Debug)]
pub enum RespError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Malformed RESP frame: {0}")]
    Malformed(String),

    #[error("RESP frame too large: {size} bytes (max {max})")]
    FrameTooLarge { size: usize, max: usize },
}

/// A decoded RESP2 value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RespValue {
    Simple(String),
    Error(String),
    Integer(i64),
    Bulk(Option<Bytes>),
    Array(Option<Vec<RespValue>>),
}

impl RespValue {
    /// Returns the textual content of simple and bulk strings.
    pub fn as_text(&self) -> Option<String> {
        match self {
            Self::Simple(s) => Some(s.clone()),
            Self::Bulk(Some(bytes)) => Some(String::from_utf8_lossy(bytes).into_owned()),
            _ => None,
        }
    }

    fn as_bytes(&self) -> Option<Bytes> {
        match self {
            Self::Simple(s) => Some(Bytes::from(s.clone().into_bytes())),
            Self::Bulk(Some(bytes)) => Some(bytes.clone()),
            _ => None,
        }
    }
}

/// A command sent to the broker, encoded as an array of bulk strings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RespCommand {
    parts: Vec<Bytes>,
}

impl RespCommand {
    pub fn new(name: &str) -> Self {
        Self {
            parts: vec![Bytes::copy_from_slice(name.as_bytes())],
        }
    }

    #[must_use]
    pub fn arg(mut self, arg: impl AsRef<[u8]>) -> Self {
        self.parts.push(Bytes::copy_from_slice(arg.as_ref()));
        self
    }

    /// `AUTH [username] password`
    pub fn auth(username: Option<&str>, password: &str) -> Self {
        match username {
            Some(user) => Self::new("AUTH").arg(user).arg(password),
            None => Self::new("AUTH").arg(password),
        }
    }

    pub fn ping() -> Self {
        Self::new("PING")
    }

    pub fn subscribe(topic: &str) -> Self {
        Self::new("SUBSCRIBE").arg(topic)
    }

    pub fn unsubscribe(topic: &str) -> Self {
        Self::new("UNSUBSCRIBE").arg(topic)
    }

    /// Command name, for logging.
    pub fn name(&self) -> String {
        self.parts
            .first()
            .map(|p| String::from_utf8_lossy(p).into_owned())
            .unwrap_or_default()
    }
}

/// Classified frame received on a subscribed connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PubSubFrame {
    /// A published payload on `channel`
    Message { channel: String, payload: Bytes },
    /// Subscription confirmed; `count` active subscriptions
    Subscribed { channel: String, count: i64 },
    /// Unsubscription confirmed; `count` remaining subscriptions
    Unsubscribed { channel: String, count: i64 },
    Pong,
    /// Broker-side error reply
    Error(String),
    /// Anything else (ignored by the subscriber)
    Other(RespValue),
}

impl PubSubFrame {
    /// Classifies a raw value received while in subscribed mode.
    pub fn classify(value: RespValue) -> Self {
        match value {
            RespValue::Error(reason) => Self::Error(reason),
            RespValue::Simple(s) if s.eq_ignore_ascii_case("PONG") => Self::Pong,
            RespValue::Array(Some(items)) => Self::classify_push(items),
            other => Self::Other(other),
        }
    }

    fn classify_push(items: Vec<RespValue>) -> Self {
        let kind = items
            .first()
            .and_then(RespValue::as_text)
            .map(|k| k.to_ascii_lowercase());
        let channel = items.get(1).and_then(RespValue::as_text);

        let classified = match (kind.as_deref(), channel, items.get(2)) {
            (Some("message"), Some(channel), Some(payload)) => payload
                .as_bytes()
                .map(|payload| Self::Message { channel, payload }),
            (Some("subscribe"), Some(channel), Some(RespValue::Integer(count))) => {
                Some(Self::Subscribed {
                    channel,
                    count: *count,
                })
            }
            (Some("unsubscribe"), Some(channel), Some(RespValue::Integer(count))) => {
                Some(Self::Unsubscribed {
                    channel,
                    count: *count,
                })
            }
            (Some("pong"), _, _) => Some(Self::Pong),
            _ => None,
        };

        classified.unwrap_or(Self::Other(RespValue::Array(Some(items))))
    }
}

/// Codec for a RESP2 connection: decodes [`RespValue`], encodes [`RespCommand`].
#[derive(Debug, Clone, Default)]
pub struct RespCodec;

impl Decoder for RespCodec {
    type Item = RespValue;
    type Error = RespError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<RespValue>, RespError> {
        match parse_value(src, 0, 0)? {
            Some((value, consumed)) => {
                src.advance(consumed);
                Ok(Some(value))
            }
            None => Ok(None),
        }
    }
}

impl Encoder<RespCommand> for RespCodec {
    type Error = RespError;

    fn encode(&mut self, cmd: RespCommand, dst: &mut BytesMut) -> Result<(), RespError> {
        dst.put_slice(format!("*{}\r\n", cmd.parts.len()).as_bytes());
        for part in &cmd.parts {
            dst.put_slice(format!("${}\r\n", part.len()).as_bytes());
            dst.put_slice(part);
            dst.put_slice(b"\r\n");
        }
        Ok(())
    }
}

/// Parses one value starting at `pos`.
///
/// Returns `Ok(None)` when the buffer does not yet hold a complete frame,
/// otherwise the value and the absolute end offset.
fn parse_value(
    buf: &[u8],
    pos: usize,
    depth: usize,
) -> Result<Option<(RespValue, usize)>, RespError> {
    if depth > MAX_DEPTH {
        return Err(RespError::Malformed("array nesting too deep".to_string()));
    }
    let Some(&tag) = buf.get(pos) else {
        return Ok(None);
    };
    let Some((line, next)) = read_line(buf, pos + 1) else {
        if buf.len().saturating_sub(pos) > MAX_FRAME_SIZE {
            return Err(RespError::FrameTooLarge {
                size: buf.len() - pos,
                max: MAX_FRAME_SIZE,
            });
        }
        return Ok(None);
    };

    match tag {
        b'+' => Ok(Some((RespValue::Simple(line_text(line)), next))),
        b'-' => Ok(Some((RespValue::Error(line_text(line)), next))),
        b':' => Ok(Some((RespValue::Integer(parse_int(line)?), next))),
        b'$' => {
            let len = parse_int(line)?;
            if len < 0 {
                return Ok(Some((RespValue::Bulk(None), next)));
            }
            let len = checked_len(len)?;
            let end = next + len;
            if buf.len() < end + 2 {
                return Ok(None);
            }
            if buf.get(end..end + 2) != Some(b"\r\n".as_slice()) {
                return Err(RespError::Malformed("bulk string missing CRLF".to_string()));
            }
            let data = buf.get(next..end).unwrap_or_default();
            Ok(Some((
                RespValue::Bulk(Some(Bytes::copy_from_slice(data))),
                end + 2,
            )))
        }
        b'*' => {
            let count = parse_int(line)?;
            if count < 0 {
                return Ok(Some((RespValue::Array(None), next)));
            }
            let count = checked_len(count)?;
            let mut items = Vec::with_capacity(count.min(64));
            let mut cursor = next;
            for _ in 0..count {
                match parse_value(buf, cursor, depth + 1)? {
                    Some((item, after)) => {
                        items.push(item);
                        cursor = after;
                    }
                    None => return Ok(None),
                }
            }
            Ok(Some((RespValue::Array(Some(items)), cursor)))
        }
        other => Err(RespError::Malformed(format!(
            "unexpected type byte 0x{other:02x}"
        ))),
    }
}

/// Finds the CRLF-terminated line starting at `start`.
fn read_line(buf: &[u8], start: usize) -> Option<(&[u8], usize)> {
    let rest = buf.get(start..)?;
    let offset = rest.windows(2).position(|w| w == b"\r\n")?;
    Some((rest.get(..offset)?, start + offset + 2))
}

fn line_text(line: &[u8]) -> String {
    String::from_utf8_lossy(line).into_owned()
}

fn parse_int(line: &[u8]) -> Result<i64, RespError> {
    std::str::from_utf8(line)
        .ok()
        .and_then(|s| s.parse::<i64>().ok())
        .ok_or_else(|| RespError::Malformed(format!("invalid integer {:?}", line_text(line))))
}

fn checked_len(len: i64) -> Result<usize, RespError> {
    let len = usize::try_from(len).map_err(|_| RespError::Malformed("negative length".into()))?;
    if len > MAX_FRAME_SIZE {
        return Err(RespError::FrameTooLarge {
            size: len,
            max: MAX_FRAME_SIZE,
        });
    }
    Ok(len)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn decode_all(input: &[u8]) -> Vec<RespValue> {
        let mut codec = RespCodec;
        let mut buf = BytesMut::from(input);
        let mut out = Vec::new();
        while let Some(value) = codec.decode(&mut buf).unwrap() {
            out.push(value);
        }
        out
    }

    #[test]
    fn test_encode_subscribe_command() {
        let mut codec = RespCodec;
        let mut buf = BytesMut::new();
        codec
            .encode(RespCommand::subscribe("hooksdata"), &mut buf)
            .unwrap();
        assert_eq!(&buf[..], b"*2\r\n$9\r\nSUBSCRIBE\r\n$9\r\nhooksdata\r\n");
    }

    #[test]
    fn test_encode_auth_with_username() {
        let mut codec = RespCodec;
        let mut buf = BytesMut::new();
        codec
            .encode(RespCommand::auth(Some("svc"), "pw"), &mut buf)
            .unwrap();
        assert_eq!(&buf[..], b"*3\r\n$4\r\nAUTH\r\n$3\r\nsvc\r\n$2\r\npw\r\n");
    }

    #[test]
    fn test_decode_scalars() {
        let values = decode_all(b"+OK\r\n-ERR nope\r\n:42\r\n$-1\r\n");
        assert_eq!(
            values,
            vec![
                RespValue::Simple("OK".into()),
                RespValue::Error("ERR nope".into()),
                RespValue::Integer(42),
                RespValue::Bulk(None),
            ]
        );
    }

    #[test]
    fn test_decode_waits_for_complete_frame() {
        let mut codec = RespCodec;
        let mut buf = BytesMut::from(&b"*3\r\n$7\r\nmessage\r\n$9\r\nhooks"[..]);
        assert!(codec.decode(&mut buf).unwrap().is_none());
        // Nothing consumed while incomplete
        assert!(buf.starts_with(b"*3\r\n"));

        buf.extend_from_slice(b"data\r\n$2\r\n{}\r\n");
        let frame = PubSubFrame::classify(codec.decode(&mut buf).unwrap().unwrap());
        assert_eq!(
            frame,
            PubSubFrame::Message {
                channel: "hooksdata".into(),
                payload: Bytes::from_static(b"{}"),
            }
        );
        assert!(buf.is_empty());
    }

    #[test]
    fn test_classify_subscribe_confirmation() {
        let values = decode_all(b"*3\r\n$9\r\nsubscribe\r\n$9\r\nhooksdata\r\n:1\r\n");
        let frame = PubSubFrame::classify(values.into_iter().next().unwrap());
        assert_eq!(
            frame,
            PubSubFrame::Subscribed {
                channel: "hooksdata".into(),
                count: 1
            }
        );
    }

    #[test]
    fn test_classify_pong_forms() {
        assert_eq!(
            PubSubFrame::classify(RespValue::Simple("PONG".into())),
            PubSubFrame::Pong
        );
        let values = decode_all(b"*2\r\n$4\r\npong\r\n$0\r\n\r\n");
        assert_eq!(
            PubSubFrame::classify(values.into_iter().next().unwrap()),
            PubSubFrame::Pong
        );
    }

    #[test]
    fn test_malformed_type_byte() {
        let mut codec = RespCodec;
        let mut buf = BytesMut::from(&b"?what\r\n"[..]);
        assert!(matches!(codec.decode(&mut buf), Err(RespError::Malformed(_))));
    }

    #[test]
    fn test_oversized_bulk_rejected() {
        let mut codec = RespCodec;
        let header = format!("${}\r\n", MAX_FRAME_SIZE + 1);
        let mut buf = BytesMut::from(header.as_bytes());
        assert!(matches!(
            codec.decode(&mut buf),
            Err(RespError::FrameTooLarge { .. })
        ));
    }
}

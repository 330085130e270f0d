use log::debug;

use super::crc::crc16_x25;
use super::frame::{ESCAPE, START_MARKER};
use super::obis::ObisCode;
use super::telegram::{
    ListEntry, ListResponse, MessageBody, RawValue, SmlMessage, Telegram, TelegramDecoder,
};
use crate::utils::error::IngestError;

const TAG_OPEN_RESPONSE: u32 = 0x0101;
const TAG_CLOSE_RESPONSE: u32 = 0x0201;
const TAG_GET_LIST_RESPONSE: u32 = 0x0701;

const TRAILER_LEN: usize = 8;
const END_TAG: u8 = 0x1A;
const MAX_DEPTH: usize = 16;

/// One SML type-length-value element.
#[derive(Debug, Clone, PartialEq)]
pub enum SmlNode {
    Absent,
    EndOfMessage,
    OctetString(Vec<u8>),
    Boolean(bool),
    Integer(i64),
    Unsigned(u64),
    List(Vec<SmlNode>),
}

/// Decoder for SML 1.04 transport frames as produced by `FrameExtractor`.
#[derive(Debug, Default, Clone)]
pub struct SmlDecoder {
    verify_checksum: bool,
}

impl SmlDecoder {
    pub fn new(verify_checksum: bool) -> Self {
        Self { verify_checksum }
    }
}

impl TelegramDecoder for SmlDecoder {
    fn decode(&self, frame: &[u8]) -> Result<Telegram, IngestError> {
        if frame.len() < START_MARKER.len() + TRAILER_LEN || !frame.starts_with(&START_MARKER) {
            return Err(IngestError::DecodeError("missing start sequence".to_string()));
        }

        let trailer = &frame[frame.len() - TRAILER_LEN..];
        if trailer[..ESCAPE.len()] != ESCAPE || trailer[4] != END_TAG {
            return Err(IngestError::DecodeError("missing end sequence".to_string()));
        }

        if self.verify_checksum {
            let expected = u16::from_le_bytes([trailer[6], trailer[7]]);
            let actual = crc16_x25(&frame[..frame.len() - 2]);
            if expected != actual {
                return Err(IngestError::ChecksumMismatch { expected, actual });
            }
        }

        // the status byte counts the fill bytes padding the body to a multiple of four
        let body = &frame[START_MARKER.len()..frame.len() - TRAILER_LEN];
        let fill = trailer[5] as usize;
        if fill > body.len() {
            return Err(IngestError::DecodeError(format!(
                "{} fill bytes announced for a {} byte body",
                fill,
                body.len()
            )));
        }

        let payload = unescape(&body[..body.len() - fill]);
        let mut cursor = Cursor::new(&payload);
        let mut messages = Vec::new();

        while !cursor.is_empty() {
            let node = cursor.node(0)?;
            messages.push(message_from_node(node)?);
        }

        debug!("🔍 Decoded telegram with {} message(s)", messages.len());
        Ok(Telegram { messages })
    }
}

/// Collapses doubled escape runs inside the frame body.
fn unescape(body: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(body.len());
    let mut i = 0;
    while i < body.len() {
        if body[i..].starts_with(&ESCAPE) && body[i + ESCAPE.len()..].starts_with(&ESCAPE) {
            out.extend_from_slice(&ESCAPE);
            i += 2 * ESCAPE.len();
        } else {
            out.push(body[i]);
            i += 1;
        }
    }
    out
}

struct Cursor<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    fn is_empty(&self) -> bool {
        self.pos >= self.data.len()
    }

    fn peek(&self) -> Option<u8> {
        self.data.get(self.pos).copied()
    }

    fn byte(&mut self) -> Result<u8, IngestError> {
        let b = self.peek().ok_or_else(|| self.truncated())?;
        self.pos += 1;
        Ok(b)
    }

    fn take(&mut self, len: usize) -> Result<&'a [u8], IngestError> {
        let end = self.pos.checked_add(len).filter(|end| *end <= self.data.len());
        let end = end.ok_or_else(|| self.truncated())?;
        let slice = &self.data[self.pos..end];
        self.pos = end;
        Ok(slice)
    }

    fn truncated(&self) -> IngestError {
        IngestError::DecodeError(format!("telegram truncated at offset {}", self.pos))
    }

    fn node(&mut self, depth: usize) -> Result<SmlNode, IngestError> {
        let start = self.pos;
        let first = self.byte()?;
        if first == 0x00 {
            return Ok(SmlNode::EndOfMessage);
        }

        let kind = (first >> 4) & 0x07;
        let mut length = (first & 0x0F) as usize;
        let mut more = first & 0x80 != 0;
        while more {
            let next = self.byte()?;
            more = next & 0x80 != 0;
            length = (length << 4) | (next & 0x0F) as usize;
        }

        if kind == 0x07 {
            if depth >= MAX_DEPTH {
                return Err(IngestError::DecodeError(format!("lists nested too deep at offset {}", start)));
            }
            let mut items = Vec::with_capacity(length.min(64));
            for _ in 0..length {
                items.push(self.node(depth + 1)?);
            }
            return Ok(SmlNode::List(items));
        }

        // for scalar types the length includes the type-length bytes
        let tl_len = self.pos - start;
        let data_len = length.checked_sub(tl_len).ok_or_else(|| {
            IngestError::DecodeError(format!("invalid length {} at offset {}", length, start))
        })?;
        let data = self.take(data_len)?;

        if data.is_empty() {
            return Ok(SmlNode::Absent);
        }

        match kind {
            0x00 => Ok(SmlNode::OctetString(data.to_vec())),
            0x04 => Ok(SmlNode::Boolean(data.iter().any(|b| *b != 0))),
            0x05 if data.len() <= 8 => {
                let init: i64 = if data[0] & 0x80 != 0 { -1 } else { 0 };
                Ok(SmlNode::Integer(data.iter().fold(init, |acc, b| (acc << 8) | *b as i64)))
            }
            0x06 if data.len() <= 8 => {
                Ok(SmlNode::Unsigned(data.iter().fold(0u64, |acc, b| (acc << 8) | *b as u64)))
            }
            _ => Err(IngestError::DecodeError(format!(
                "unsupported element 0x{:02X} ({} bytes) at offset {}",
                first,
                data.len(),
                start
            ))),
        }
    }
}

fn fields<const N: usize>(node: SmlNode, what: &str) -> Result<[SmlNode; N], IngestError> {
    match node {
        SmlNode::List(items) => <[SmlNode; N]>::try_from(items).map_err(|items| {
            IngestError::DecodeError(format!("{} has {} fields, expected {}", what, items.len(), N))
        }),
        other => Err(IngestError::DecodeError(format!("{} is not a list: {:?}", what, other))),
    }
}

fn message_from_node(node: SmlNode) -> Result<SmlMessage, IngestError> {
    let [transaction_id, _group, _abort_on_error, body, _crc, _end] = fields::<6>(node, "message")?;
    let transaction_id = match transaction_id {
        SmlNode::OctetString(bytes) => bytes,
        _ => Vec::new(),
    };
    Ok(SmlMessage {
        transaction_id,
        body: body_from_node(body)?,
    })
}

fn body_from_node(node: SmlNode) -> Result<MessageBody, IngestError> {
    let [tag, content] = fields::<2>(node, "message body")?;
    let tag = match tag {
        SmlNode::Unsigned(tag) => u32::try_from(tag).ok(),
        SmlNode::Integer(tag) => u32::try_from(tag).ok(),
        _ => None,
    }
    .ok_or_else(|| IngestError::DecodeError("message body without tag".to_string()))?;

    Ok(match tag {
        TAG_OPEN_RESPONSE => MessageBody::OpenResponse,
        TAG_CLOSE_RESPONSE => MessageBody::CloseResponse,
        TAG_GET_LIST_RESPONSE => MessageBody::GetListResponse(list_response(content)?),
        other => MessageBody::Other(other),
    })
}

fn list_response(node: SmlNode) -> Result<ListResponse, IngestError> {
    let [_client_id, server_id, _list_name, _sensor_time, values, _signature, _gateway_time] =
        fields::<7>(node, "list response")?;

    let server_id = match server_id {
        SmlNode::OctetString(bytes) => bytes,
        _ => Vec::new(),
    };
    let entries = match values {
        SmlNode::List(items) => items.into_iter().map(list_entry).collect::<Result<Vec<_>, _>>()?,
        SmlNode::Absent => Vec::new(),
        other => {
            return Err(IngestError::DecodeError(format!("value list is not a list: {:?}", other)))
        }
    };

    Ok(ListResponse { server_id, entries })
}

fn list_entry(node: SmlNode) -> Result<ListEntry, IngestError> {
    let [name, _status, _time, unit, scaler, value, _signature] = fields::<7>(node, "list entry")?;

    let code = match name {
        SmlNode::OctetString(bytes) => ObisCode::from_bytes(&bytes)?,
        other => return Err(IngestError::DecodeError(format!("invalid object name: {:?}", other))),
    };

    let unit = match unit {
        SmlNode::Absent => None,
        SmlNode::Unsigned(u) => Some(u8::try_from(u).map_err(|_| out_of_range("unit", code))?),
        SmlNode::Integer(u) => Some(u8::try_from(u).map_err(|_| out_of_range("unit", code))?),
        other => return Err(IngestError::DecodeError(format!("invalid unit for {}: {:?}", code, other))),
    };

    let scaler = match scaler {
        SmlNode::Absent => None,
        SmlNode::Integer(s) => Some(i8::try_from(s).map_err(|_| out_of_range("scaler", code))?),
        SmlNode::Unsigned(s) => Some(u8::try_from(s).map_err(|_| out_of_range("scaler", code))? as i8),
        other => return Err(IngestError::DecodeError(format!("invalid scaler for {}: {:?}", code, other))),
    };

    let value = match value {
        SmlNode::Integer(v) => RawValue::Integer(v),
        SmlNode::Unsigned(v) => RawValue::Integer(i64::try_from(v).map_err(|_| out_of_range("value", code))?),
        SmlNode::Boolean(v) => RawValue::Boolean(v),
        SmlNode::OctetString(bytes) => RawValue::from_octets(bytes),
        other => return Err(IngestError::DecodeError(format!("unsupported value for {}: {:?}", code, other))),
    };

    Ok(ListEntry { code, unit, scaler, value })
}

fn out_of_range(field: &str, code: ObisCode) -> IngestError {
    IngestError::DecodeError(format!("{} out of range for {}", field, code))
}

//! Decoded telegram model handed from the wire layer to the ingestion core.

use crate::sml::obis::ObisCode;
use crate::utils::error::IngestError;

#[derive(Debug, Clone, PartialEq)]
pub struct Telegram {
    pub messages: Vec<SmlMessage>,
}

impl Telegram {
    /// List responses in message order.
    pub fn list_responses(&self) -> impl Iterator<Item = &ListResponse> {
        self.messages.iter().filter_map(|m| m.list_response())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct SmlMessage {
    pub transaction_id: Vec<u8>,
    pub body: MessageBody,
}

impl SmlMessage {
    pub fn list_response(&self) -> Option<&ListResponse> {
        match &self.body {
            MessageBody::GetListResponse(list) => Some(list),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum MessageBody {
    OpenResponse,
    CloseResponse,
    GetListResponse(ListResponse),
    Other(u32),
}

#[derive(Debug, Clone, PartialEq)]
pub struct ListResponse {
    pub server_id: Vec<u8>,
    pub entries: Vec<ListEntry>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ListEntry {
    pub code: ObisCode,
    pub unit: Option<u8>,
    pub scaler: Option<i8>,
    pub value: RawValue,
}

/// Entry value as transmitted, classified once at decode time.
#[derive(Debug, Clone, PartialEq)]
pub enum RawValue {
    Integer(i64),
    Boolean(bool),
    Text(String),
    Bytes(Vec<u8>),
}

impl RawValue {
    /// Octet strings become `Text` when they are valid UTF-8, `Bytes` otherwise.
    pub fn from_octets(octets: Vec<u8>) -> Self {
        match String::from_utf8(octets) {
            Ok(text) => RawValue::Text(text),
            Err(err) => RawValue::Bytes(err.into_bytes()),
        }
    }
}

pub trait TelegramDecoder: Send {
    fn decode(&self, frame: &[u8]) -> Result<Telegram, IngestError>;
}

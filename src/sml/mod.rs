pub mod crc;
pub mod decoder;
pub mod frame;
pub mod obis;
pub mod telegram;

pub use crc::crc16_x25;
pub use decoder::{SmlDecoder, SmlNode};
pub use frame::FrameExtractor;
pub use obis::{CodeCatalog, ObisCatalog, ObisCode, NO_UNIT};
pub use telegram::{ListEntry, ListResponse, MessageBody, RawValue, SmlMessage, Telegram, TelegramDecoder};

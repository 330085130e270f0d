pub mod reader;
pub mod telegram_handler;
pub mod traits;

pub use reader::{MeterReader, ReaderState};
pub use telegram_handler::{normalize_value, TelegramHandler};
pub use traits::FrameHandler;

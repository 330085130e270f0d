pub mod error;

pub use error::IngestError;

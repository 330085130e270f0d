pub mod fleet;

pub use fleet::MeterFleet;

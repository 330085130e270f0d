use crate::utils::error::IngestError;

/// Callbacks a `MeterReader` drives from its reader thread.
///
/// Hooks run strictly in order on that one thread: `prepare` and
/// `connection_made` once, `data_received` per complete frame, `dispose` when
/// a stop was requested, and finally `connection_lost` exactly once. `flush`
/// runs between frames whenever a read comes back empty.
pub trait FrameHandler: Send {
    /// Allocates per-connection resources before the transport is bound.
    fn prepare(&mut self) -> Result<(), IngestError>;

    fn connection_made(&mut self) -> Result<(), IngestError> {
        Ok(())
    }

    /// An error returned here ends the read loop.
    fn data_received(&mut self, frame: &[u8]) -> Result<(), IngestError>;

    /// The meter is quiet. Work batched across frames should be finished here.
    fn flush(&mut self) {}

    fn connection_lost(&mut self, error: Option<&IngestError>);

    fn dispose(&mut self);
}

use core::any::Any;

use thiserror::Error;

/// Completion signal raised by a device once a request has finished.
pub trait RequestDone: Send + Sync {
    fn request_done(&self);
}

/// Raw sector storage.
///
/// A request returns as soon as it has been accepted. The device reports the
/// end of the transfer by calling `done.request_done()` exactly once, either
/// before returning or from another context; the caller blocks on that signal.
/// A request that fails with an error is never signalled.
pub trait BlockDevice: Send + Sync + Any {
    /// Read sector `block_id` into `buf`, which is one sector long.
    fn read_request(
        &self,
        block_id: usize,
        buf: &mut [u8],
        done: &dyn RequestDone,
    ) -> Result<(), DiskError>;

    /// Write `buf`, which is one sector long, to sector `block_id`.
    fn write_request(
        &self,
        block_id: usize,
        buf: &[u8],
        done: &dyn RequestDone,
    ) -> Result<(), DiskError>;

    /// Number of sectors on the device.
    fn num_blocks(&self) -> usize;
}

#[derive(Error, Debug)]
pub enum DiskError {
    #[error("Sector out of range: idx {idx}, max {max}")]
    OutOfRange { idx: usize, max: usize },
    #[error("Mismatched buffer size: {size}")]
    BufferSize { size: usize },
    #[error("IO Error: {0}")]
    Io(#[from] std::io::Error),
}

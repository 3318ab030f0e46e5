//! Progress reporting for multi-block transfers

use strum::Display;

/// What a transfer is doing when it reports progress
#[derive(Clone, Copy, Debug, Display, PartialEq, Eq)]
pub enum ProgressStage {
    /// Flash begin was sent, the device is erasing
    Erasing,
    /// Writing blocks to flash
    Writing,
    /// Uploading blocks to RAM
    Uploading,
    /// Reading memory back from the device
    Reading,
}

/// A single progress report
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ProgressEvent {
    pub stage: ProgressStage,
    /// Device address of the block being transferred
    pub address: u32,
    /// Bytes already transferred
    pub done: usize,
    /// Bytes in the whole transfer
    pub total: usize,
}

/// Progress update callbacks
///
/// Callbacks cannot interrupt a transfer.
pub trait ProgressCallbacks {
    /// Called before the erase and before each block
    fn update(&mut self, event: ProgressEvent);
    /// Called once the transfer has completed
    fn finish(&mut self) {}
}

impl<F: FnMut(ProgressEvent)> ProgressCallbacks for F {
    fn update(&mut self, event: ProgressEvent) {
        self(event)
    }
}

pub(crate) fn report(progress: &mut Option<&mut dyn ProgressCallbacks>, event: ProgressEvent) {
    if let Some(progress) = progress {
        progress.update(event);
    }
}

pub(crate) fn finish(progress: &mut Option<&mut dyn ProgressCallbacks>) {
    if let Some(progress) = progress {
        progress.finish();
    }
}

//! Ordering of pending files between scheduler iterations.

use super::{LoadFile, LoadReport};

/// Decides the order in which pending files are attempted in the next
/// iteration. The scheduler's state machine does not depend on it.
pub trait LoadOrder: Send {
    fn order(&mut self, pending: Vec<LoadFile>, report: &LoadReport) -> Vec<LoadFile>;
}

/// Retry pending files in the order they were given.
#[derive(Debug, Clone, Copy, Default)]
pub struct RetryInPlace;

impl LoadOrder for RetryInPlace {
    fn order(&mut self, pending: Vec<LoadFile>, _report: &LoadReport) -> Vec<LoadFile> {
        pending
    }
}

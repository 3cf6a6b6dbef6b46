//! Change-log source capability.

use crate::error::Result;
use crate::types::ChangeEntry;
use crossbeam_channel::Receiver;

/// An open tail on the change log.
///
/// Items arrive in log order. An `Err` item, or the sender side going away,
/// means the connection is lost.
pub type ChangeStream = Receiver<Result<ChangeEntry>>;

/// Something that can be tailed for change-log entries.
pub trait ChangeLogSource: Send + Sync {
    /// Open a tail positioned at the current end of the log. Entries
    /// written before the call are never replayed.
    fn tail(&self) -> Result<ChangeStream>;
}

//! Change-feed listening.
//!
//! The listener tails a [`ChangeLogSource`], demultiplexes entries to
//! subscriptions by namespace, resolves partial updates into full documents
//! and reconnects with randomized backoff when the stream breaks.
//!
//! # Example
//!
//! ```ignore
//! let listener = ChangeFeedListener::new(source, store, ListenerConfig::default())?;
//! listener.start()?;
//!
//! let sub = listener.listen(Namespace::new("db", "users"), Arc::new(|entry: &ChangeEntry| {
//!     println!("{:?} {}", entry.operation, entry.document_id);
//! }));
//!
//! // Later
//! sub.dispose();
//! ```

mod listener;
mod source;
mod types;

pub use listener::{ChangeFeedListener, Subscription};
pub use source::{ChangeLogSource, ChangeStream};
pub use types::{
    ListenerDiagnostics, ListenerEvent, ListenerState, OperationHandler, SubscriptionId,
};

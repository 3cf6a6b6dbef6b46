//! # Live Queries
//!
//! Keep query results over a document store up to date as the store
//! changes, driven by the store's ordered change log.
//!
//! ## Core Concepts
//!
//! - **Change-feed listener**: One tailing connection per store, fanned out
//!   to subscriptions by namespace, with partial-update resolution and
//!   automatic reconnection
//! - **Observers**: Per-query reconcilers that report `added`, `changed`,
//!   `removed` (and, when polling, `moved`) deltas
//! - **Collections and cursors**: Store passthrough whose writes and option
//!   changes wake polling observers
//!
//! ## Example
//!
//! ```ignore
//! use livequery::{LiveStore, LiveStoreConfig, MemoryStore, ObserveCallbacks};
//!
//! let store = Arc::new(MemoryStore::new());
//! let live = LiveStore::with_change_feed(store.clone(), store, LiveStoreConfig::new("app"))?;
//!
//! let users = live.collection("users");
//! let handle = users.find(json!({"age": {"$gte": 18}}))?.observe(
//!     ObserveCallbacks::new()
//!         .on_added(|doc, index| println!("added {doc} at {index}"))
//!         .on_removed(|doc, index| println!("removed {doc} from {index}")),
//! )?;
//!
//! users.insert(json!({"_id": "ada", "age": 36}))?;
//! handle.stop();
//! ```

pub mod collection;
pub mod config;
pub mod error;
pub mod feed;
pub mod live;
pub mod observe;
pub mod query;
pub mod store;
pub mod types;

// Re-exports
pub use collection::{ChangeNotifier, Collection, Cursor};
pub use config::{BackoffConfig, ListenerConfig, LiveStoreConfig, ObserveMode, ObserverConfig};
pub use error::{LiveError, Result};
pub use feed::{
    ChangeFeedListener, ChangeLogSource, ChangeStream, ListenerDiagnostics, ListenerEvent,
    ListenerState, OperationHandler, Subscription, SubscriptionId,
};
pub use live::LiveStore;
pub use observe::{
    ChangeFeedObserver, Notification, ObserveCallbacks, ObserveHandle, ObserverStatus,
    PollingObserver,
};
pub use query::{PredicateEvaluator, Query, QueryMatcher, QueryOptions, SortOrder};
pub use store::{DocumentStore, MemoryStore};
pub use types::*;

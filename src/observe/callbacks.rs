//! Callbacks invoked by observers.

use crate::types::Document;
use crossbeam_channel::{unbounded, Receiver};

/// One result-set delta.
#[derive(Clone, Debug, PartialEq)]
pub enum Notification {
    /// Full initial snapshot.
    Init(Vec<Document>),
    Added {
        document: Document,
        index: usize,
    },
    /// `before` is `None` on the change-feed path.
    Changed {
        before: Option<Document>,
        after: Document,
        index: usize,
    },
    Removed {
        document: Document,
        index: usize,
    },
    /// Only produced by polling observers.
    Moved {
        document: Document,
        from: usize,
        to: usize,
    },
}

type InitFn = Box<dyn Fn(Vec<Document>) + Send + Sync>;
type DocFn = Box<dyn Fn(Document, usize) + Send + Sync>;
type ChangedFn = Box<dyn Fn(Option<Document>, Document, usize) + Send + Sync>;
type MovedFn = Box<dyn Fn(Document, usize, usize) + Send + Sync>;

/// The set of callbacks a caller registers with `observe`.
///
/// Every callback is optional. When `init` is present the initial snapshot
/// is delivered through it alone; otherwise each initial document is
/// reported through `added`.
#[derive(Default)]
pub struct ObserveCallbacks {
    init: Option<InitFn>,
    added: Option<DocFn>,
    changed: Option<ChangedFn>,
    removed: Option<DocFn>,
    moved: Option<MovedFn>,
}

impl ObserveCallbacks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Callbacks that forward every notification to a channel.
    ///
    /// No `init` callback is set, so the initial snapshot arrives as
    /// `Added` notifications.
    pub fn channel() -> (Self, Receiver<Notification>) {
        let (tx, rx) = unbounded();
        let (added_tx, changed_tx, removed_tx, moved_tx) =
            (tx.clone(), tx.clone(), tx.clone(), tx);
        let callbacks = Self::new()
            .on_added(move |document, index| {
                let _ = added_tx.send(Notification::Added { document, index });
            })
            .on_changed(move |before, after, index| {
                let _ = changed_tx.send(Notification::Changed {
                    before,
                    after,
                    index,
                });
            })
            .on_removed(move |document, index| {
                let _ = removed_tx.send(Notification::Removed { document, index });
            })
            .on_moved(move |document, from, to| {
                let _ = moved_tx.send(Notification::Moved { document, from, to });
            });
        (callbacks, rx)
    }

    pub fn on_init(mut self, f: impl Fn(Vec<Document>) + Send + Sync + 'static) -> Self {
        self.init = Some(Box::new(f));
        self
    }

    pub fn on_added(mut self, f: impl Fn(Document, usize) + Send + Sync + 'static) -> Self {
        self.added = Some(Box::new(f));
        self
    }

    pub fn on_changed(
        mut self,
        f: impl Fn(Option<Document>, Document, usize) + Send + Sync + 'static,
    ) -> Self {
        self.changed = Some(Box::new(f));
        self
    }

    pub fn on_removed(mut self, f: impl Fn(Document, usize) + Send + Sync + 'static) -> Self {
        self.removed = Some(Box::new(f));
        self
    }

    pub fn on_moved(mut self, f: impl Fn(Document, usize, usize) + Send + Sync + 'static) -> Self {
        self.moved = Some(Box::new(f));
        self
    }

    /// Deliver an initial snapshot: `init` if present, `added` per document
    /// otherwise.
    pub(crate) fn deliver_initial(&self, documents: Vec<Document>) {
        match &self.init {
            Some(init) => init(documents),
            None => {
                if let Some(added) = &self.added {
                    for (index, document) in documents.into_iter().enumerate() {
                        added(document, index);
                    }
                }
            }
        }
    }

    /// Invoke the callback matching `notification`, if one is registered.
    pub fn notify(&self, notification: Notification) {
        match notification {
            Notification::Init(documents) => self.deliver_initial(documents),
            Notification::Added { document, index } => {
                if let Some(f) = &self.added {
                    f(document, index);
                }
            }
            Notification::Changed {
                before,
                after,
                index,
            } => {
                if let Some(f) = &self.changed {
                    f(before, after, index);
                }
            }
            Notification::Removed { document, index } => {
                if let Some(f) = &self.removed {
                    f(document, index);
                }
            }
            Notification::Moved { document, from, to } => {
                if let Some(f) = &self.moved {
                    f(document, from, to);
                }
            }
        }
    }
}

impl std::fmt::Debug for ObserveCallbacks {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ObserveCallbacks")
            .field("init", &self.init.is_some())
            .field("added", &self.added.is_some())
            .field("changed", &self.changed.is_some())
            .field("removed", &self.removed.is_some())
            .field("moved", &self.moved.is_some())
            .finish()
    }
}

//! Change notifications for a single watched path.
//!
//! Raw `notify` events are reduced to the handful of signals the follower reacts to. Events can also be
//! injected through an [`EventFeed`], which is how shutdown is requested and how tests drive a follower
//! without touching the OS watcher.

use std::path::Path;
use std::sync::mpsc::{channel, Receiver, Sender};

use notify::{
    event::ModifyKind, Config, Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher,
};
use tracing::trace;

/// Discrete event delivered to the follower.
#[derive(Debug)]
pub enum WatchEvent {
    /// Content was written to the watched file
    Write,
    /// Watched file was removed
    Removed,
    /// Watched file was renamed or moved away
    Renamed,
    /// Attributes of the watched file changed. Removing a file that is still open elsewhere only shows up as
    /// this (link count drops), so it may hide a rotation.
    MetadataChanged,
    /// Watcher reported an error
    Error(notify::Error),
    /// Someone asked the follower to stop
    Shutdown,
}

enum Signal {
    Raw(notify::Result<Event>),
    Injected(WatchEvent),
}

/// Watch subscription on one path. Owns the OS watcher (if any) and the receiving end of its event channel.
pub struct Subscription {
    watcher: Option<RecommendedWatcher>,
    events: Receiver<Signal>,
}

/// Sending half of a [`Subscription`]. Cheap to clone.
///
/// Every method returns `false` once the subscription is gone.
#[derive(Clone)]
pub struct EventFeed {
    tx: Sender<Signal>,
}

impl Subscription {
    /// Start watching `path` using the recommended watcher of current platform.
    pub fn watch(path: impl AsRef<Path>) -> notify::Result<(Self, EventFeed)> {
        let (tx, rx) = channel();
        let watcher_tx = tx.clone();

        let mut watcher = RecommendedWatcher::new(
            move |res| {
                let _ = watcher_tx.send(Signal::Raw(res));
            },
            Config::default(),
        )?;
        watcher.watch(path.as_ref(), RecursiveMode::NonRecursive)?;

        Ok((
            Self {
                watcher: Some(watcher),
                events: rx,
            },
            EventFeed { tx },
        ))
    }

    /// Subscription without an OS watcher, fed only through the returned `EventFeed`.
    ///
    /// Dropping every clone of the feed closes the subscription.
    pub fn channel() -> (Self, EventFeed) {
        let (tx, rx) = channel();
        (
            Self {
                watcher: None,
                events: rx,
            },
            EventFeed { tx },
        )
    }

    /// Block until next relevant event arrives. Returns `None` when every sender is gone.
    pub fn next(&mut self) -> Option<WatchEvent> {
        loop {
            match self.events.recv().ok()? {
                Signal::Injected(event) => return Some(event),
                Signal::Raw(Err(err)) => return Some(WatchEvent::Error(err)),
                Signal::Raw(Ok(event)) => match classify(&event.kind) {
                    Some(event) => return Some(event),
                    None => trace!(kind = ?event.kind, "ignoring watcher event"),
                },
            }
        }
    }

    /// Register `path` again on the same watcher.
    ///
    /// Some backends (inotify) drop a watch once the watched inode is gone, so this must be called after the
    /// file was replaced. No-op for channel-only subscriptions.
    pub fn rearm(&mut self, path: impl AsRef<Path>) -> notify::Result<()> {
        let Some(watcher) = self.watcher.as_mut() else {
            return Ok(());
        };
        // watch may already be gone together with the old file
        let _ = watcher.unwatch(path.as_ref());
        watcher.watch(path.as_ref(), RecursiveMode::NonRecursive)
    }
}

impl EventFeed {
    pub fn write(&self) -> bool {
        self.send(WatchEvent::Write)
    }

    pub fn removed(&self) -> bool {
        self.send(WatchEvent::Removed)
    }

    pub fn renamed(&self) -> bool {
        self.send(WatchEvent::Renamed)
    }

    pub fn metadata_changed(&self) -> bool {
        self.send(WatchEvent::MetadataChanged)
    }

    pub fn error(&self, err: notify::Error) -> bool {
        self.send(WatchEvent::Error(err))
    }

    /// Ask the follower to stop after it finishes handling current event.
    pub fn shutdown(&self) -> bool {
        self.send(WatchEvent::Shutdown)
    }

    fn send(&self, event: WatchEvent) -> bool {
        self.tx.send(Signal::Injected(event)).is_ok()
    }
}

fn classify(kind: &EventKind) -> Option<WatchEvent> {
    match kind {
        EventKind::Remove(_) => Some(WatchEvent::Removed),
        EventKind::Modify(ModifyKind::Name(_)) => Some(WatchEvent::Renamed),
        EventKind::Modify(ModifyKind::Metadata(_)) => Some(WatchEvent::MetadataChanged),
        EventKind::Modify(_) => Some(WatchEvent::Write),
        _ => None,
    }
}

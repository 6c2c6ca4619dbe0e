//! Events emitted to the embedding application's UI bus.
//!
//! The core never talks to a UI directly; it calls an optional callback.
//! Event names mirror the strings the app's event bus uses, so the embedder
//! can forward them verbatim.

use std::sync::Arc;

use crate::migration::MigrationChoice;

/// Connection/sync status shown in the UI.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DriveStatus {
    Syncing,
    Synced,
    Offline,
    LoggingIn,
}

impl DriveStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            DriveStatus::Syncing => "syncing",
            DriveStatus::Synced => "synced",
            DriveStatus::Offline => "offline",
            DriveStatus::LoggingIn => "logging in",
        }
    }
}

#[derive(Debug, Clone)]
pub enum SyncEvent {
    Status(DriveStatus),
    Error(String),
    NotesUpdated,
    NotesReload,
    Log(String),
    MigrationPrompt(Vec<MigrationChoice>),
}

impl SyncEvent {
    /// Event-bus channel name for this event.
    pub fn name(&self) -> &'static str {
        match self {
            SyncEvent::Status(_) => "drive:status",
            SyncEvent::Error(_) => "drive:error",
            SyncEvent::NotesUpdated => "notes:updated",
            SyncEvent::NotesReload => "notes:reload",
            SyncEvent::Log(_) => "logMessage",
            SyncEvent::MigrationPrompt(_) => "migration:prompt",
        }
    }
}

pub type EventCallback = Arc<dyn Fn(&SyncEvent) + Send + Sync>;

/// Thin fan-out to the embedder's event callback. Cloning is cheap; every
/// component holds its own copy.
#[derive(Clone, Default)]
pub struct EventBus {
    callback: Option<EventCallback>,
}

impl EventBus {
    pub fn new(callback: EventCallback) -> Self {
        Self {
            callback: Some(callback),
        }
    }

    /// A bus that drops everything. Used by tests and headless embedders.
    pub fn disabled() -> Self {
        Self { callback: None }
    }

    pub fn emit(&self, event: SyncEvent) {
        tracing::debug!(event = event.name(), "emit");
        if let Some(cb) = &self.callback {
            cb(&event);
        }
    }

    pub fn status(&self, status: DriveStatus) {
        self.emit(SyncEvent::Status(status));
    }

    pub fn error(&self, message: impl Into<String>) {
        self.emit(SyncEvent::Error(message.into()));
    }

    pub fn log(&self, message: impl Into<String>) {
        self.emit(SyncEvent::Log(message.into()));
    }
}

impl std::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventBus")
            .field("callback", &self.callback.as_ref().map(|_| "…"))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[test]
    fn emits_to_callback() {
        let seen: Arc<Mutex<Vec<String>>> = Arc::new(Mutex::new(Vec::new()));
        let seen_clone = Arc::clone(&seen);
        let bus = EventBus::new(Arc::new(move |ev| {
            seen_clone.lock().unwrap().push(ev.name().to_string());
        }));

        bus.status(DriveStatus::Syncing);
        bus.error("boom");
        bus.emit(SyncEvent::NotesUpdated);

        let log = seen.lock().unwrap();
        assert_eq!(
            log.as_slice(),
            ["drive:status", "drive:error", "notes:updated"]
        );
    }

    #[test]
    fn disabled_bus_is_silent() {
        EventBus::disabled().status(DriveStatus::Synced);
    }

    #[test]
    fn status_strings() {
        assert_eq!(DriveStatus::LoggingIn.as_str(), "logging in");
        assert_eq!(DriveStatus::Offline.as_str(), "offline");
    }
}

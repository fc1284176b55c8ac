use std::sync::Arc;

use tokio::sync::mpsc;

use crate::cache::CacheEntry;
use crate::error::ErrorInfo;
use crate::key::{EntityKey, ResourceKey};
use crate::model::{Payload, SessionState};
use crate::runner::RunSnapshot;
use crate::search::SearchSnapshot;
use crate::tabs::{TabId, TabView};

/// State changes the UI layer renders; the orchestrator never touches the view itself
#[derive(Clone, Debug)]
pub enum Event {
    Search(SearchSnapshot),
    Run(RunSnapshot),
    Tab(TabEvent),
    History {
        key: ResourceKey,
        result: Result<Arc<CacheEntry<Payload>>, ErrorInfo>,
    },
    Session(SessionState),
}

#[derive(Clone, Debug)]
pub enum TabEvent {
    Loading {
        tab: TabId,
        entity: EntityKey,
    },
    Ready(TabView),
    Failed {
        tab: TabId,
        entity: EntityKey,
        error: ErrorInfo,
    },
}

/// Sending half of the event channel
///
/// A closed receiver is not an error: a torn-down view simply stops listening.
#[derive(Clone, Debug, Default)]
pub struct Notifier {
    tx: Option<mpsc::UnboundedSender<Event>>,
}

impl Notifier {
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<Event>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx: Some(tx) }, rx)
    }

    /// Drops every event
    pub fn silent() -> Self {
        Self::default()
    }

    pub fn emit(&self, event: Event) {
        if let Some(tx) = &self.tx {
            _ = tx.send(event);
        }
    }
}

#[cfg(test)]
pub(crate) fn drain(rx: &mut mpsc::UnboundedReceiver<Event>) -> Vec<Event> {
    let mut events = vec![];
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }
    events
}

#[cfg(test)]
mod tests {
    use super::{drain, Event, Notifier};
    use crate::model::SessionState;

    #[test]
    fn delivers_events_in_order() {
        let (notifier, mut rx) = Notifier::channel();
        notifier.emit(Event::Session(SessionState::default()));
        notifier.emit(Event::Session(SessionState::default()));
        assert_eq!(drain(&mut rx).len(), 2);
    }

    #[test]
    fn emitting_without_listener_is_harmless() {
        let (notifier, rx) = Notifier::channel();
        drop(rx);
        notifier.emit(Event::Session(SessionState::default()));
        Notifier::silent().emit(Event::Session(SessionState::default()));
    }
}

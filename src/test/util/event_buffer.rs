use std::sync::{Arc, Mutex};

use crate::event::{
    command::{CommandEvent, CommandStartedEvent},
    EventHandler,
};

/// Collects events delivered to an [`EventHandler`] so tests can inspect them afterwards.
#[derive(Clone, Debug)]
pub(crate) struct EventBuffer<T> {
    events: Arc<Mutex<Vec<T>>>,
}

impl<T: Clone + Send + Sync + 'static> EventBuffer<T> {
    pub(crate) fn new() -> Self {
        Self {
            events: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub(crate) fn handler(&self) -> EventHandler<T> {
        let events = self.events.clone();
        EventHandler::callback(move |event| events.lock().unwrap().push(event))
    }

    pub(crate) fn all(&self) -> Vec<T> {
        self.events.lock().unwrap().clone()
    }
}

impl EventBuffer<CommandEvent> {
    pub(crate) fn started(&self) -> Vec<CommandStartedEvent> {
        self.all()
            .into_iter()
            .filter_map(|event| match event {
                CommandEvent::Started(event) => Some(event),
                _ => None,
            })
            .collect()
    }
}

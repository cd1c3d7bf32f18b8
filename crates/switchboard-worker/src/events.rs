//! [`EventTable`] – local event name → handlers.

use std::collections::BTreeMap;

use switchboard_types::BridgeError;
use tracing::info;

use crate::handler::Handler;

#[derive(Clone)]
pub(crate) struct EventEntry {
    pub handler_name: String,
    pub owner: Option<String>,
    pub handler: Handler,
}

/// Every handler registered for each event name, in registration order.
#[derive(Default, Clone)]
pub struct EventTable {
    events: BTreeMap<String, Vec<EventEntry>>,
}

impl EventTable {
    pub(crate) fn add(&mut self, event: &str, handler_name: &str, owner: Option<&str>, handler: Handler) {
        self.events.entry(event.to_string()).or_default().push(EventEntry {
            handler_name: handler_name.to_string(),
            owner: owner.map(str::to_string),
            handler,
        });
        info!(event, handler = handler_name, "added event handler");
    }

    /// Remove the first handler named `handler_name` bound to `event`.
    pub(crate) fn remove(&mut self, event: &str, handler_name: &str) -> Result<(), BridgeError> {
        let entries = self
            .events
            .get_mut(event)
            .ok_or_else(|| BridgeError::HandlerNotFound(format!("{event}/{handler_name}")))?;
        let position = entries
            .iter()
            .position(|e| e.handler_name == handler_name)
            .ok_or_else(|| BridgeError::HandlerNotFound(format!("{event}/{handler_name}")))?;
        entries.remove(position);
        if entries.is_empty() {
            self.events.remove(event);
        }
        info!(event, handler = handler_name, "removed event handler");
        Ok(())
    }

    /// Drop every handler owned by `owner`; returns how many went.
    pub(crate) fn remove_owned(&mut self, owner: &str) -> usize {
        let mut removed = 0;
        self.events.retain(|_, entries| {
            let before = entries.len();
            entries.retain(|e| e.owner.as_deref() != Some(owner));
            removed += before - entries.len();
            !entries.is_empty()
        });
        removed
    }

    /// `(handler_name, handler)` pairs for `event`, cloned out so the caller
    /// can release the registry lock before running them.
    pub fn handlers_for(&self, event: &str) -> Vec<(String, Handler)> {
        self.events
            .get(event)
            .map(|entries| {
                entries
                    .iter()
                    .map(|e| (e.handler_name.clone(), e.handler.clone()))
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Total number of bound handlers.
    pub fn len(&self) -> usize {
        self.events.values().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    pub fn event_names(&self) -> Vec<&str> {
        self.events.keys().map(String::as_str).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handler::handler;
    use serde_json::Value;

    fn noop() -> Handler {
        handler(|_, _| async { Ok(Value::Null) })
    }

    #[test]
    fn handlers_keep_registration_order() {
        let mut table = EventTable::default();
        table.add("message_create", "first", None, noop());
        table.add("message_create", "second", Some("Greeter"), noop());
        let names: Vec<_> = table
            .handlers_for("message_create")
            .into_iter()
            .map(|(n, _)| n)
            .collect();
        assert_eq!(names, vec!["first", "second"]);
        assert!(table.handlers_for("ready").is_empty());
    }

    #[test]
    fn remove_unknown_handler_fails() {
        let mut table = EventTable::default();
        table.add("ready", "boot", None, noop());
        assert!(matches!(
            table.remove("ready", "other"),
            Err(BridgeError::HandlerNotFound(_))
        ));
        assert!(table.remove("ready", "boot").is_ok());
        assert!(table.is_empty());
    }

    #[test]
    fn remove_owned_only_touches_that_owner() {
        let mut table = EventTable::default();
        table.add("ready", "a", Some("CogA"), noop());
        table.add("ready", "b", Some("CogB"), noop());
        table.add("message_create", "c", Some("CogA"), noop());
        assert_eq!(table.remove_owned("CogA"), 2);
        assert_eq!(table.len(), 1);
        assert_eq!(table.event_names(), vec!["ready"]);
    }
}

//! User callback types and the per-connection handler registry.
//!
//! The registry only stores and looks up handlers. Invoking them is the
//! dispatcher's job, done after the registry lock is released.

use std::collections::HashMap;
use std::sync::Arc;

use bytes::Bytes;
use mq_protocol::{ConnectReturnCode, topic};

use crate::connection::ConnectionHandle;
use crate::error::ErrorCode;

pub type OnConnectionFailed = Arc<dyn Fn(&ConnectionHandle, ErrorCode) + Send + Sync>;
pub type OnConnAck = Arc<dyn Fn(&ConnectionHandle, ConnectReturnCode, bool) + Send + Sync>;
pub type OnDisconnect = Arc<dyn Fn(&ConnectionHandle) + Send + Sync>;
pub type OnInterrupted = Arc<dyn Fn(&ConnectionHandle, ErrorCode) + Send + Sync>;
pub type OnPublishReceived = Arc<dyn Fn(&ConnectionHandle, &str, &Bytes) + Send + Sync>;
pub type OnOperationComplete = Arc<dyn Fn(&ConnectionHandle, u16) + Send + Sync>;

/// Connection-level handlers captured for one connect attempt.
#[derive(Clone, Default)]
pub(crate) struct AttemptHandlers {
    pub on_connack: Option<OnConnAck>,
    pub on_connection_failed: Option<OnConnectionFailed>,
    pub on_interrupted: Option<OnInterrupted>,
    /// Captured by `disconnect()`, not by `connect()`.
    pub on_disconnect: Option<OnDisconnect>,
}

struct Operation {
    attempt: Option<u64>,
    on_complete: OnOperationComplete,
}

#[derive(Default)]
pub(crate) struct Registry {
    pub on_connection_failed: Option<OnConnectionFailed>,
    pub on_connack: Option<OnConnAck>,
    pub on_disconnect: Option<OnDisconnect>,
    pub on_interrupted: Option<OnInterrupted>,
    attempts: HashMap<u64, AttemptHandlers>,
    current_attempt: Option<u64>,
    /// One publish handler per filter, in subscription order.
    subscriptions: Vec<(String, OnPublishReceived)>,
    operations: HashMap<u16, Operation>,
    unsubscribing: HashMap<u16, String>,
    /// Filter and handler each pending SUBSCRIBE installed.
    subscribing: HashMap<u16, (String, OnPublishReceived)>,
}

impl Registry {
    /// Snapshot the connection-level handlers for a new attempt.
    pub(crate) fn begin_attempt(&mut self, attempt: u64) {
        self.attempts.insert(
            attempt,
            AttemptHandlers {
                on_connack: self.on_connack.clone(),
                on_connection_failed: self.on_connection_failed.clone(),
                on_interrupted: self.on_interrupted.clone(),
                on_disconnect: None,
            },
        );
        self.current_attempt = Some(attempt);
    }

    /// Snapshot the disconnect handler for the current attempt.
    pub(crate) fn begin_disconnect(&mut self) {
        let on_disconnect = self.on_disconnect.clone();
        if let Some(handlers) = self
            .current_attempt
            .and_then(|attempt| self.attempts.get_mut(&attempt))
        {
            handlers.on_disconnect = on_disconnect;
        }
    }

    /// Handlers for a lifecycle event. A terminal event retires the
    /// attempt and discards its pending operations.
    pub(crate) fn attempt_handlers(&mut self, attempt: u64, terminal: bool) -> AttemptHandlers {
        if !terminal {
            return self.attempts.get(&attempt).cloned().unwrap_or_default();
        }
        let discarded: Vec<u16> = self
            .operations
            .iter()
            .filter(|(_, op)| op.attempt == Some(attempt))
            .map(|(id, _)| *id)
            .collect();
        for id in &discarded {
            self.operations.remove(id);
            self.unsubscribing.remove(id);
            self.subscribing.remove(id);
        }
        if !discarded.is_empty() {
            tracing::debug!(
                attempt,
                discarded = discarded.len(),
                "discarding pending operations"
            );
        }
        if self.current_attempt == Some(attempt) {
            self.current_attempt = None;
        }
        self.attempts.remove(&attempt).unwrap_or_default()
    }

    /// Register (or replace) the publish handler for `filter`.
    pub(crate) fn subscribe(&mut self, filter: &str, on_publish: OnPublishReceived) {
        match self.subscriptions.iter_mut().find(|(f, _)| f == filter) {
            Some(slot) => slot.1 = on_publish,
            None => self.subscriptions.push((filter.to_string(), on_publish)),
        }
    }

    pub(crate) fn subscribing(
        &mut self,
        packet_id: u16,
        filter: &str,
        on_publish: OnPublishReceived,
    ) {
        self.subscribing
            .insert(packet_id, (filter.to_string(), on_publish));
    }

    /// The broker refused the SUBSCRIBE `packet_id`: drop its publish
    /// handler unless a later subscribe already replaced it.
    pub(crate) fn subscription_rejected(&mut self, packet_id: u16) -> Option<String> {
        let (filter, on_publish) = self.subscribing.remove(&packet_id)?;
        self.subscriptions
            .retain(|(f, handler)| !(*f == filter && Arc::ptr_eq(handler, &on_publish)));
        Some(filter)
    }

    pub(crate) fn unsubscribing(&mut self, packet_id: u16, filter: &str) {
        self.unsubscribing.insert(packet_id, filter.to_string());
    }

    pub(crate) fn add_operation(&mut self, packet_id: u16, on_complete: OnOperationComplete) {
        self.operations.insert(
            packet_id,
            Operation {
                attempt: self.current_attempt,
                on_complete,
            },
        );
    }

    /// Take the completion handler for `packet_id`. An UNSUBACK also drops
    /// the publish handler of the filter it acknowledges.
    pub(crate) fn complete(&mut self, packet_id: u16) -> Option<OnOperationComplete> {
        self.subscribing.remove(&packet_id);
        if let Some(filter) = self.unsubscribing.remove(&packet_id) {
            self.subscriptions.retain(|(f, _)| *f != filter);
        }
        self.operations.remove(&packet_id).map(|op| op.on_complete)
    }

    /// Publish handlers whose filter matches `topic`.
    pub(crate) fn publish_handlers(&self, topic: &str) -> Vec<OnPublishReceived> {
        self.subscriptions
            .iter()
            .filter(|(filter, _)| topic::matches(filter, topic))
            .map(|(_, handler)| handler.clone())
            .collect()
    }

    pub(crate) fn pending_operations(&self) -> usize {
        self.operations.len()
    }

    #[cfg(test)]
    pub(crate) fn subscription_count(&self) -> usize {
        self.subscriptions.len()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;

    fn noop_publish() -> OnPublishReceived {
        Arc::new(|_, _, _| {})
    }

    fn noop_complete() -> OnOperationComplete {
        Arc::new(|_, _| {})
    }

    #[test]
    fn resubscribing_replaces_handler() {
        let mut registry = Registry::default();
        let first = noop_publish();
        let second = noop_publish();
        registry.subscribe("a/#", first.clone());
        registry.subscribe("a/#", second.clone());
        assert_eq!(registry.subscription_count(), 1);

        let handlers = registry.publish_handlers("a/b");
        assert_eq!(handlers.len(), 1);
        assert!(Arc::ptr_eq(&handlers[0], &second));
    }

    #[test]
    fn overlapping_filters_all_match() {
        let mut registry = Registry::default();
        registry.subscribe("a/#", noop_publish());
        registry.subscribe("a/+", noop_publish());
        registry.subscribe("b", noop_publish());
        assert_eq!(registry.publish_handlers("a/x").len(), 2);
        assert_eq!(registry.publish_handlers("b").len(), 1);
        assert!(registry.publish_handlers("c").is_empty());
    }

    #[test]
    fn unsuback_removes_publish_handler() {
        let mut registry = Registry::default();
        registry.subscribe("a/#", noop_publish());
        registry.unsubscribing(7, "a/#");
        registry.add_operation(7, noop_complete());
        assert_eq!(registry.publish_handlers("a/b").len(), 1);

        assert!(registry.complete(7).is_some());
        assert!(registry.publish_handlers("a/b").is_empty());
        assert!(registry.complete(7).is_none());
    }

    #[test]
    fn attempt_snapshot_ignores_later_setters() {
        let calls = Arc::new(AtomicUsize::new(0));
        let mut registry = Registry::default();
        registry.begin_attempt(1);

        let counter = calls.clone();
        registry.on_connack = Some(Arc::new(move |_, _, _| {
            counter.fetch_add(1, Ordering::SeqCst);
        }));

        assert!(registry.attempt_handlers(1, false).on_connack.is_none());
        registry.begin_attempt(2);
        assert!(registry.attempt_handlers(2, false).on_connack.is_some());
    }

    #[test]
    fn terminal_event_discards_only_its_attempt() {
        let mut registry = Registry::default();
        registry.begin_attempt(1);
        registry.add_operation(10, noop_complete());
        registry.begin_attempt(2);
        registry.add_operation(11, noop_complete());

        registry.attempt_handlers(1, true);
        assert_eq!(registry.pending_operations(), 1);
        assert!(registry.complete(10).is_none());
        assert!(registry.complete(11).is_some());
    }

    #[test]
    fn disconnect_snapshot_lands_on_current_attempt() {
        let mut registry = Registry::default();
        registry.begin_attempt(3);
        registry.on_disconnect = Some(Arc::new(|_| {}));
        registry.begin_disconnect();
        let handlers = registry.attempt_handlers(3, true);
        assert!(handlers.on_disconnect.is_some());
        assert!(registry.attempt_handlers(3, true).on_disconnect.is_none());
    }

    #[test]
    fn rejected_subscription_drops_its_handler() {
        let mut registry = Registry::default();
        let accepted = noop_publish();
        let rejected = noop_publish();
        registry.subscribe("a/#", accepted.clone());
        registry.subscribe("a/+", rejected.clone());
        registry.subscribing(4, "a/+", rejected);
        registry.add_operation(4, noop_complete());

        assert_eq!(registry.subscription_rejected(4).as_deref(), Some("a/+"));
        assert!(registry.complete(4).is_some());
        let handlers = registry.publish_handlers("a/b");
        assert_eq!(handlers.len(), 1);
        assert!(Arc::ptr_eq(&handlers[0], &accepted));
    }

    #[test]
    fn rejection_keeps_a_newer_handler_for_the_same_filter() {
        let mut registry = Registry::default();
        let first = noop_publish();
        let second = noop_publish();
        registry.subscribe("a", first.clone());
        registry.subscribing(1, "a", first);
        registry.subscribe("a", second.clone());
        registry.subscribing(2, "a", second.clone());

        registry.subscription_rejected(1);
        let handlers = registry.publish_handlers("a");
        assert_eq!(handlers.len(), 1);
        assert!(Arc::ptr_eq(&handlers[0], &second));
    }

    #[test]
    fn suback_forgets_pending_subscribe() {
        let mut registry = Registry::default();
        let on_publish = noop_publish();
        registry.subscribe("a", on_publish.clone());
        registry.subscribing(3, "a", on_publish);
        registry.add_operation(3, noop_complete());
        registry.complete(3);
        assert_eq!(registry.subscription_rejected(3), None);
        assert_eq!(registry.subscription_count(), 1);
    }
}

//! Request/response correlation over the single inbound event stream.
//!
//! Requests register a waiter before they are sent. Every decoded frame first tries
//! to resolve a waiter and is then published, except for operation errors that a
//! waiter claimed. Ordered subscribers get every published event on an unbounded
//! channel; broadcast subscribers may lag and skip.

use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use palaver_shared::{
    decode_frame, ChatError, ChatResult, ErrorCode, EventType, InboundEvent, InboundFrame,
    OperationFailure, OutboundEvent,
};
use tokio::sync::{broadcast, mpsc, oneshot};
use uuid::Uuid;

use crate::ws::connection::EventSender;

/// What a request waits for.
#[derive(Debug, Clone, PartialEq)]
pub struct Expectation {
    pub response: EventType,
    /// Error codes that fail this request even without an explicit correlation id.
    pub handled_codes: Vec<ErrorCode>,
    pub check_token: bool,
    /// Responses that name another thread are not for this request.
    pub thread_id: Option<Uuid>,
}

impl Expectation {
    pub fn new(response: EventType) -> Self {
        Self {
            response,
            handled_codes: Vec::new(),
            check_token: true,
            thread_id: None,
        }
    }

    #[must_use]
    pub fn handling(mut self, codes: &[ErrorCode]) -> Self {
        self.handled_codes.extend_from_slice(codes);
        self
    }

    #[must_use]
    pub fn without_token_check(mut self) -> Self {
        self.check_token = false;
        self
    }

    #[must_use]
    pub fn for_thread(mut self, thread_id: Uuid) -> Self {
        self.thread_id = Some(thread_id);
        self
    }

    fn accepts(&self, request_id: &Uuid, event: &InboundEvent) -> bool {
        if self.response != event.event_type || !event.answers(request_id) {
            return false;
        }
        match (self.thread_id, event.thread_id()) {
            (Some(wanted), Some(named)) => wanted == named,
            _ => true,
        }
    }
}

struct Waiter {
    request_id: Uuid,
    expectation: Expectation,
    tx: oneshot::Sender<ChatResult<InboundEvent>>,
}

pub struct EventCorrelator {
    waiters: Mutex<Vec<Waiter>>,
    ordered: Mutex<Vec<mpsc::UnboundedSender<InboundEvent>>>,
    broadcast: broadcast::Sender<InboundEvent>,
    timeout: Duration,
}

impl EventCorrelator {
    pub fn new(timeout: Duration, capacity: usize) -> Self {
        let (broadcast, _) = broadcast::channel(capacity.max(1));
        Self {
            waiters: Mutex::new(Vec::new()),
            ordered: Mutex::new(Vec::new()),
            broadcast,
            timeout,
        }
    }

    fn waiters(&self) -> MutexGuard<'_, Vec<Waiter>> {
        self.waiters.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Every decoded event and every unclaimed operation error, in arrival order.
    /// Slow receivers skip events once `capacity` is exceeded.
    pub fn subscribe(&self) -> broadcast::Receiver<InboundEvent> {
        self.broadcast.subscribe()
    }

    /// Like [`subscribe`](Self::subscribe) but never drops an event.
    pub fn subscribe_ordered(&self) -> mpsc::UnboundedReceiver<InboundEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.ordered
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(tx);
        rx
    }

    fn publish(&self, event: InboundEvent) {
        self.ordered
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .retain(|tx| tx.send(event.clone()).is_ok());
        let _ = self.broadcast.send(event);
    }

    pub fn pending(&self) -> usize {
        self.waiters().len()
    }

    /// Send `request` and wait for the event that answers it.
    pub async fn sink(
        &self,
        sender: &dyn EventSender,
        request: OutboundEvent,
        expectation: Expectation,
    ) -> ChatResult<InboundEvent> {
        let request_id = request.event_id;
        let expected = expectation.response;
        let check_token = expectation.check_token;
        let (tx, rx) = oneshot::channel();
        self.waiters().push(Waiter {
            request_id,
            expectation,
            tx,
        });

        if let Err(error) = sender.send_event(&request, check_token).await {
            self.remove(&request_id);
            return Err(error);
        }

        match tokio::time::timeout(self.timeout, rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(ChatError::ConnectionClosed),
            Err(_) => {
                self.remove(&request_id);
                tracing::warn!(%expected, %request_id, "request timed out");
                Err(ChatError::EventTimeout {
                    expected,
                    after: self.timeout,
                })
            }
        }
    }

    fn remove(&self, request_id: &Uuid) {
        self.waiters().retain(|w| w.request_id != *request_id);
    }

    /// Route one raw text frame.
    pub fn dispatch(&self, text: &str) {
        match decode_frame(text) {
            Ok(Some(InboundFrame::Event(event))) => self.dispatch_event(event),
            Ok(Some(InboundFrame::Failure(failure))) => self.dispatch_failure(failure),
            Ok(None) => tracing::debug!(frame = %text, "dropping frame without a known event type"),
            Err(error) => tracing::debug!(%error, frame = %text, "dropping undecodable frame"),
        }
    }

    fn dispatch_event(&self, event: InboundEvent) {
        {
            let mut waiters = self.waiters();
            waiters.retain(|w| !w.tx.is_closed());
            if let Some(index) = waiters
                .iter()
                .position(|w| w.expectation.accepts(&w.request_id, &event))
            {
                let waiter = waiters.remove(index);
                tracing::trace!(event_type = %event.event_type, request_id = %waiter.request_id, "response matched");
                let _ = waiter.tx.send(Ok(event.clone()));
            }
        }
        self.publish(event);
    }

    fn dispatch_failure(&self, failure: OperationFailure) {
        let claimed = {
            let mut waiters = self.waiters();
            waiters.retain(|w| !w.tx.is_closed());
            let index = waiters
                .iter()
                .position(|w| failure.relates_to(&w.request_id))
                .or_else(|| {
                    waiters
                        .iter()
                        .position(|w| w.expectation.handled_codes.contains(&failure.error.error_code))
                });
            match index {
                Some(index) => {
                    let waiter = waiters.remove(index);
                    let _ = waiter.tx.send(Err(ChatError::from(failure.error.clone())));
                    true
                }
                None => false,
            }
        };

        if claimed {
            tracing::debug!(code = %failure.error.error_code, "operation error claimed by request");
        } else {
            tracing::warn!(code = %failure.error.error_code, message = %failure.error.error_message, "unclaimed operation error");
            self.publish(InboundEvent::from_failure(&failure));
        }
    }

    /// Fail every outstanding request.
    pub fn fail_all(&self, error: ChatError) {
        let drained: Vec<Waiter> = self.waiters().drain(..).collect();
        if !drained.is_empty() {
            tracing::debug!(count = drained.len(), %error, "failing pending requests");
        }
        for waiter in drained {
            let _ = waiter.tx.send(Err(error.clone()));
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use async_trait::async_trait;
    use serde_json::{json, Value};

    use super::*;

    #[derive(Default)]
    struct Recorder {
        sent: Mutex<Vec<OutboundEvent>>,
    }

    impl Recorder {
        fn sent(&self) -> Vec<OutboundEvent> {
            self.sent.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl EventSender for Recorder {
        fn is_connected(&self) -> bool {
            true
        }

        async fn send_event(&self, event: &OutboundEvent, _check_token: bool) -> ChatResult<()> {
            self.sent.lock().unwrap().push(event.clone());
            Ok(())
        }
    }

    struct Offline;

    #[async_trait]
    impl EventSender for Offline {
        fn is_connected(&self) -> bool {
            false
        }

        async fn send_event(&self, _event: &OutboundEvent, _check_token: bool) -> ChatResult<()> {
            Err(ChatError::NotConnected)
        }
    }

    fn frame(event_type: &str, answers: Option<Uuid>, data: Value) -> String {
        let mut frame = json!({ "eventId": Uuid::new_v4().to_string(), "postback": { "eventType": event_type, "data": data } });
        if let Some(id) = answers {
            frame["inputData"] = json!({ "eventId": id.to_string() });
        }
        frame.to_string()
    }

    async fn wait_for_waiters(correlator: &EventCorrelator, count: usize) {
        while correlator.pending() < count {
            tokio::task::yield_now().await;
        }
    }

    #[tokio::test]
    async fn responses_resolve_their_own_requests() {
        let correlator = Arc::new(EventCorrelator::new(Duration::from_secs(5), 16));
        let sender = Arc::new(Recorder::default());

        let a = OutboundEvent::new(EventType::LoadThreadMetadata, json!({ "n": "a" }));
        let b = OutboundEvent::new(EventType::LoadThreadMetadata, json!({ "n": "b" }));
        let (a_id, b_id) = (a.event_id, b.event_id);

        let task_a = tokio::spawn({
            let (correlator, sender) = (correlator.clone(), sender.clone());
            async move { correlator.sink(sender.as_ref(), a, Expectation::new(EventType::ThreadMetadataLoaded)).await }
        });
        let task_b = tokio::spawn({
            let (correlator, sender) = (correlator.clone(), sender.clone());
            async move { correlator.sink(sender.as_ref(), b, Expectation::new(EventType::ThreadMetadataLoaded)).await }
        });
        wait_for_waiters(&correlator, 2).await;
        assert_eq!(sender.sent().len(), 2);

        // Answer B first.
        correlator.dispatch(&frame("ThreadMetadataLoaded", Some(b_id), json!({ "for": "b" })));
        correlator.dispatch(&frame("ThreadMetadataLoaded", Some(a_id), json!({ "for": "a" })));

        assert_eq!(task_a.await.unwrap().unwrap().data["for"], "a");
        assert_eq!(task_b.await.unwrap().unwrap().data["for"], "b");
        assert_eq!(correlator.pending(), 0);
    }

    #[tokio::test]
    async fn uncorrelated_responses_resolve_in_registration_order() {
        let correlator = Arc::new(EventCorrelator::new(Duration::from_secs(5), 16));
        let sender = Arc::new(Recorder::default());

        let first = tokio::spawn({
            let (correlator, sender) = (correlator.clone(), sender.clone());
            async move {
                correlator
                    .sink(sender.as_ref(), OutboundEvent::new(EventType::FetchThreadList, json!({})), Expectation::new(EventType::ThreadListFetched))
                    .await
            }
        });
        wait_for_waiters(&correlator, 1).await;
        let second = tokio::spawn({
            let (correlator, sender) = (correlator.clone(), sender.clone());
            async move {
                correlator
                    .sink(sender.as_ref(), OutboundEvent::new(EventType::FetchThreadList, json!({})), Expectation::new(EventType::ThreadListFetched))
                    .await
            }
        });
        wait_for_waiters(&correlator, 2).await;

        correlator.dispatch(&frame("ThreadListFetched", None, json!({ "n": 1 })));
        correlator.dispatch(&frame("ThreadListFetched", None, json!({ "n": 2 })));

        assert_eq!(first.await.unwrap().unwrap().data["n"], 1);
        assert_eq!(second.await.unwrap().unwrap().data["n"], 2);
    }

    #[tokio::test]
    async fn claimed_errors_are_not_broadcast() {
        let correlator = Arc::new(EventCorrelator::new(Duration::from_secs(5), 16));
        let sender = Arc::new(Recorder::default());
        let mut subscriber = correlator.subscribe();

        let task = tokio::spawn({
            let (correlator, sender) = (correlator.clone(), sender.clone());
            async move {
                correlator
                    .sink(
                        sender.as_ref(),
                        OutboundEvent::new(EventType::RecoverThread, json!({})),
                        Expectation::new(EventType::ThreadRecovered).handling(&[ErrorCode::RecoveringThreadFailed]),
                    )
                    .await
            }
        });
        wait_for_waiters(&correlator, 1).await;

        let error = json!({ "error": { "errorCode": "RecoveringThreadFailed", "errorMessage": "none" } });
        correlator.dispatch(&error.to_string());
        let result = task.await.unwrap();
        assert_eq!(result.unwrap_err().code(), Some(ErrorCode::RecoveringThreadFailed));
        assert!(subscriber.try_recv().is_err());

        // Nobody waits now: the same error goes to subscribers.
        correlator.dispatch(&error.to_string());
        let broadcast = subscriber.try_recv().unwrap();
        assert_eq!(broadcast.event_type, EventType::Error);
    }

    #[tokio::test(start_paused = true)]
    async fn requests_time_out() {
        let correlator = EventCorrelator::new(Duration::from_secs(10), 16);
        let sender = Recorder::default();

        let result = correlator
            .sink(&sender, OutboundEvent::new(EventType::ArchiveThread, json!({})), Expectation::new(EventType::ThreadArchived))
            .await;
        assert!(matches!(
            result,
            Err(ChatError::EventTimeout { expected: EventType::ThreadArchived, .. })
        ));
        assert_eq!(correlator.pending(), 0);
    }

    #[tokio::test]
    async fn failed_send_leaves_no_waiter() {
        let correlator = EventCorrelator::new(Duration::from_secs(10), 16);
        let result = correlator
            .sink(&Offline, OutboundEvent::new(EventType::ArchiveThread, json!({})), Expectation::new(EventType::ThreadArchived))
            .await;
        assert_eq!(result.unwrap_err(), ChatError::NotConnected);
        assert_eq!(correlator.pending(), 0);
    }

    #[tokio::test]
    async fn fail_all_drains_waiters() {
        let correlator = Arc::new(EventCorrelator::new(Duration::from_secs(10), 16));
        let sender = Arc::new(Recorder::default());
        let task = tokio::spawn({
            let (correlator, sender) = (correlator.clone(), sender.clone());
            async move {
                correlator
                    .sink(sender.as_ref(), OutboundEvent::new(EventType::FetchThreadList, json!({})), Expectation::new(EventType::ThreadListFetched))
                    .await
            }
        });
        wait_for_waiters(&correlator, 1).await;

        correlator.fail_all(ChatError::ConnectionClosed);
        assert_eq!(task.await.unwrap().unwrap_err(), ChatError::ConnectionClosed);
    }

    #[tokio::test]
    async fn thread_scoped_requests_skip_foreign_responses() {
        let correlator = Arc::new(EventCorrelator::new(Duration::from_secs(5), 16));
        let sender = Arc::new(Recorder::default());
        let (thread_a, thread_b) = (Uuid::new_v4(), Uuid::new_v4());

        let spawn_for = |thread_id: Uuid| {
            let (correlator, sender) = (correlator.clone(), sender.clone());
            tokio::spawn(async move {
                correlator
                    .sink(
                        sender.as_ref(),
                        OutboundEvent::new(EventType::LoadThreadMetadata, json!({})),
                        Expectation::new(EventType::ThreadMetadataLoaded).for_thread(thread_id),
                    )
                    .await
            })
        };
        let task_a = spawn_for(thread_a);
        wait_for_waiters(&correlator, 1).await;
        let task_b = spawn_for(thread_b);
        wait_for_waiters(&correlator, 2).await;

        let metadata = |thread_id: Uuid| json!({ "lastMessage": { "threadIdOnExternalPlatform": thread_id } });
        correlator.dispatch(&frame("ThreadMetadataLoaded", None, metadata(thread_b)));
        correlator.dispatch(&frame("ThreadMetadataLoaded", None, metadata(thread_a)));

        let a = task_a.await.unwrap().unwrap();
        let b = task_b.await.unwrap().unwrap();
        assert_eq!(a.thread_id(), Some(thread_a));
        assert_eq!(b.thread_id(), Some(thread_b));
    }

    #[test]
    fn ordered_subscribers_never_skip() {
        let correlator = EventCorrelator::new(Duration::from_secs(1), 4);
        let mut lossy = correlator.subscribe();
        let mut ordered = correlator.subscribe_ordered();
        for n in 0..20 {
            correlator.dispatch(&frame("MessageCreated", None, json!({ "n": n })));
        }

        for n in 0..20 {
            assert_eq!(ordered.try_recv().unwrap().data["n"], n);
        }
        assert!(matches!(lossy.try_recv(), Err(broadcast::error::TryRecvError::Lagged(16))));
    }

    #[test]
    fn garbage_frames_are_dropped() {
        let correlator = EventCorrelator::new(Duration::from_secs(1), 4);
        let mut subscriber = correlator.subscribe();
        correlator.dispatch("not json at all");
        correlator.dispatch(r#"{"eventType":"Mystery"}"#);
        assert!(subscriber.try_recv().is_err());
    }
}

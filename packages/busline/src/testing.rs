//! Testing utilities for sagas, behaviors and the data bus.
//!
//! # Feature Flag
//!
//! This module is only available with the `testing` feature:
//!
//! ```toml
//! [dev-dependencies]
//! busline = { version = "0.1", features = ["testing"] }
//! ```
//!
//! # Quick Start
//!
//! ## Using the Fluent Saga Harness
//!
//! ```ignore
//! use busline::testing::SagaTest;
//!
//! SagaTest::new(ShippingSaga)
//!     .with_reply_to("webshop")
//!     .given(OrderPlaced { order_id: 42 })
//!     .await
//!     .expect_started()
//!     .expect_timeout::<PaymentOverdue>()
//!     .when_timeout(PaymentOverdue)
//!     .await
//!     .expect_completed()
//!     .expect_reply::<OrderCancelled>("webshop");
//! ```
//!
//! ## Using `RecordingBus`
//!
//! ```ignore
//! let bus = RecordingBus::new();
//! let ctx = SagaContext::new(&mut data, &saga_type).with_bus(&bus);
//!
//! ctx.reply_to_originator(OrderAccepted { order_id })?;
//!
//! bus.assert_sent_to::<OrderAccepted>("webshop");
//! ```

use std::sync::{Arc, Mutex};

use anyhow::Result;
use async_trait::async_trait;

use crate::bus::{Bus, Delivery, Dispatched};
use crate::databus::{DataBusStore, InMemoryDataBus};
use crate::message::{headers, Headers, Message, MessageType, OutgoingMessage};
use crate::pipeline::{MessageContext, Route};
use crate::saga::{Saga, SagaEngine, SagaOutcome, SagaOutcomes};

pub use crate::saga::testing::InMemorySagaPersister;

// =============================================================================
// Recording Bus
// =============================================================================

/// Bus that records every dispatch for test assertions.
///
/// Nothing is delivered. Clones share the same record.
#[derive(Debug, Clone, Default)]
pub struct RecordingBus {
    dispatched: Arc<Mutex<Vec<Arc<Dispatched>>>>,
}

impl RecordingBus {
    /// Create a new empty recording bus.
    pub fn new() -> Self {
        Self::default()
    }

    fn record(&self, route: Route, message: OutgoingMessage) -> Result<()> {
        self.dispatched
            .lock()
            .unwrap()
            .push(Arc::new(Dispatched { route, message }));
        Ok(())
    }

    /// Every dispatch, oldest first.
    pub fn all(&self) -> Vec<Arc<Dispatched>> {
        self.dispatched.lock().unwrap().clone()
    }

    /// The most recent dispatch.
    pub fn last(&self) -> Option<Arc<Dispatched>> {
        self.dispatched.lock().unwrap().last().cloned()
    }

    /// Get the count of dispatches.
    pub fn count(&self) -> usize {
        self.dispatched.lock().unwrap().len()
    }

    /// Deferred dispatches, oldest first.
    pub fn deferred(&self) -> Vec<Arc<Dispatched>> {
        self.filter(|d| matches!(d.route, Route::Defer(_)))
    }

    /// Sends, oldest first.
    pub fn sent(&self) -> Vec<Arc<Dispatched>> {
        self.filter(|d| matches!(d.route, Route::Send { .. }))
    }

    /// Publishes, oldest first.
    pub fn published(&self) -> Vec<Arc<Dispatched>> {
        self.filter(|d| d.route == Route::Publish)
    }

    /// Dispatches whose body is an `M`.
    pub fn of_type<M: Message>(&self) -> Vec<Arc<Dispatched>> {
        let wanted = MessageType::of::<M>();
        self.filter(|d| d.message.message_type() == wanted)
    }

    /// Clear all recorded dispatches.
    pub fn clear(&self) {
        self.dispatched.lock().unwrap().clear();
    }

    fn filter(&self, predicate: impl Fn(&Dispatched) -> bool) -> Vec<Arc<Dispatched>> {
        self.dispatched
            .lock()
            .unwrap()
            .iter()
            .filter(|d| predicate(d))
            .cloned()
            .collect()
    }

    /// Assert an `M` was sent to `destination`.
    ///
    /// # Panics
    ///
    /// Panics if no such send was recorded.
    pub fn assert_sent_to<M: Message>(&self, destination: &str) {
        let found = self.of_type::<M>().iter().any(|d| {
            matches!(&d.route, Route::Send { destination: to, .. } if to == destination)
        });
        assert!(
            found,
            "Expected '{}' to be sent to '{}'. Recorded: {:?}",
            M::full_type_name(),
            destination,
            self.all()
        );
    }

    /// Assert an `M` was deferred as a saga timeout.
    ///
    /// # Panics
    ///
    /// Panics if no such timeout was recorded.
    pub fn assert_timeout_requested<M: Message>(&self) {
        let found = self.of_type::<M>().iter().any(|d| {
            matches!(d.route, Route::Defer(_))
                && d.header(headers::IS_SAGA_TIMEOUT_MESSAGE) == Some(headers::TRUE)
        });
        assert!(
            found,
            "Expected a '{}' timeout to be requested. Recorded: {:?}",
            M::full_type_name(),
            self.all()
        );
    }

    /// Assert nothing was dispatched.
    pub fn assert_nothing_dispatched(&self) {
        let all = self.all();
        assert!(all.is_empty(), "Expected no dispatches, found {:?}", all);
    }
}

impl Bus for RecordingBus {
    fn send(
        &self,
        destination: &str,
        correlation_id: Option<&str>,
        mut message: OutgoingMessage,
    ) -> Result<()> {
        if let Some(id) = correlation_id {
            message.set_header(headers::CORRELATION_ID, id);
        }
        self.record(
            Route::Send {
                destination: destination.to_string(),
                correlation_id: correlation_id.map(str::to_string),
            },
            message,
        )
    }

    fn publish(&self, message: OutgoingMessage) -> Result<()> {
        self.record(Route::Publish, message)
    }

    fn defer(&self, delivery: Delivery, message: OutgoingMessage) -> Result<()> {
        self.record(Route::Defer(delivery), message)
    }
}

// =============================================================================
// Recording Data Bus
// =============================================================================

/// Byte store wrapper that records which keys were written and read.
#[derive(Clone)]
pub struct RecordingDataBus {
    inner: Arc<dyn DataBusStore>,
    puts: Arc<Mutex<Vec<String>>>,
    gets: Arc<Mutex<Vec<String>>>,
}

impl RecordingDataBus {
    /// Record around an in-memory store.
    pub fn new() -> Self {
        Self::wrap(Arc::new(InMemoryDataBus::new()))
    }

    /// Record around `inner`.
    pub fn wrap(inner: Arc<dyn DataBusStore>) -> Self {
        Self {
            inner,
            puts: Arc::default(),
            gets: Arc::default(),
        }
    }

    /// Keys written, oldest first.
    pub fn puts(&self) -> Vec<String> {
        self.puts.lock().unwrap().clone()
    }

    /// Keys read, oldest first.
    pub fn gets(&self) -> Vec<String> {
        self.gets.lock().unwrap().clone()
    }

    /// Check if `key` was written.
    pub fn was_put(&self, key: &str) -> bool {
        self.puts.lock().unwrap().iter().any(|k| k == key)
    }

    /// Clear the record. Stored blobs are kept.
    pub fn clear(&self) {
        self.puts.lock().unwrap().clear();
        self.gets.lock().unwrap().clear();
    }
}

impl Default for RecordingDataBus {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for RecordingDataBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RecordingDataBus")
            .field("puts", &self.puts())
            .field("gets", &self.gets())
            .finish()
    }
}

#[async_trait]
impl DataBusStore for RecordingDataBus {
    async fn put(&self, key: &str, bytes: Vec<u8>) -> Result<String> {
        let key = self.inner.put(key, bytes).await?;
        self.puts.lock().unwrap().push(key.clone());
        Ok(key)
    }

    async fn get(&self, key: &str) -> Result<Vec<u8>> {
        self.gets.lock().unwrap().push(key.to_string());
        self.inner.get(key).await
    }
}

// =============================================================================
// Saga Test
// =============================================================================

/// Fluent harness running one saga type over in-memory collaborators.
///
/// Each step dispatches a message through a [`SagaEngine`] and keeps the
/// outcome for the `expect_*` assertions that follow.
pub struct SagaTest<S: Saga> {
    engine: SagaEngine,
    persister: Arc<InMemorySagaPersister<S::Data>>,
    bus: RecordingBus,
    headers: Headers,
    last: Option<Result<SagaOutcomes, String>>,
    saga_id: Option<String>,
}

impl<S: Saga> SagaTest<S> {
    /// Register `saga` with a fresh persister and bus.
    ///
    /// # Panics
    ///
    /// Panics if the saga's configuration fails.
    pub fn new(saga: S) -> Self {
        let persister = Arc::new(InMemorySagaPersister::new());
        let engine = match SagaEngine::new().register(saga, persister.clone()) {
            Ok(engine) => engine,
            Err(e) => panic!("saga configuration failed: {e:#}"),
        };
        Self {
            engine,
            persister,
            bus: RecordingBus::new(),
            headers: Headers::new(),
            last: None,
            saga_id: None,
        }
    }

    /// Send every following message as if from `address`.
    pub fn with_reply_to(mut self, address: &str) -> Self {
        self.headers
            .insert(headers::REPLY_TO_ADDRESS.to_string(), address.to_string());
        self
    }

    /// Seed an existing saga instance.
    pub fn with_saga(mut self, data: S::Data) -> Self {
        use crate::saga::SagaData;
        self.saga_id = Some(data.id().to_string());
        self.persister.insert(data);
        self
    }

    /// Dispatch the first message of the scenario.
    pub async fn given<M: Message>(self, message: M) -> Self {
        self.when(message).await
    }

    /// Dispatch a message.
    pub async fn when<M: Message>(self, message: M) -> Self {
        let mut headers = self.headers.clone();
        headers.insert(
            headers::MESSAGE_ID.to_string(),
            uuid::Uuid::new_v4().to_string(),
        );
        self.dispatch(MessageContext::new(message, headers)).await
    }

    /// Deliver `message` as the timeout of its type the saga requested last.
    ///
    /// # Panics
    ///
    /// Panics if no such timeout was requested.
    pub async fn when_timeout<M: Message>(self, message: M) -> Self {
        let requested = self.bus.of_type::<M>().into_iter().rev().find(|d| {
            d.header(headers::IS_SAGA_TIMEOUT_MESSAGE) == Some(headers::TRUE)
        });
        let Some(requested) = requested else {
            panic!("no '{}' timeout was requested", M::full_type_name());
        };
        let headers = requested.message.headers().clone();
        self.dispatch(MessageContext::new(message, headers)).await
    }

    async fn dispatch(mut self, ctx: MessageContext) -> Self {
        let result = self.engine.dispatch(&ctx, Some(&self.bus)).await;
        if let Ok(outcomes) = &result {
            if let Some(id) = outcomes.iter().find_map(SagaOutcome::saga_id) {
                self.saga_id = Some(id.to_string());
            }
        }
        self.last = Some(result.map_err(|e| format!("{e:#}")));
        self
    }

    fn outcome(&self) -> &SagaOutcome {
        match &self.last {
            Some(Ok(outcomes)) if !outcomes.is_empty() => &outcomes[0],
            other => panic!("Expected a saga outcome, got {:?}", other),
        }
    }

    /// Assert the last message started a saga.
    pub fn expect_started(self) -> Self {
        assert!(
            matches!(self.outcome(), SagaOutcome::Started { .. }),
            "Expected a started saga, got {:?}",
            self.outcome()
        );
        self
    }

    /// Assert the last message updated an existing saga.
    pub fn expect_updated(self) -> Self {
        assert!(
            matches!(self.outcome(), SagaOutcome::Updated { .. }),
            "Expected an updated saga, got {:?}",
            self.outcome()
        );
        self
    }

    /// Assert the last message completed the saga.
    pub fn expect_completed(self) -> Self {
        assert!(
            matches!(self.outcome(), SagaOutcome::Completed { .. }),
            "Expected a completed saga, got {:?}",
            self.outcome()
        );
        assert!(
            self.data().is_none(),
            "Completed saga is still persisted"
        );
        self
    }

    /// Assert no saga matched the last message.
    pub fn expect_not_found(self) -> Self {
        assert!(
            matches!(self.outcome(), SagaOutcome::NotFound { .. }),
            "Expected no saga to be found, got {:?}",
            self.outcome()
        );
        self
    }

    /// Assert the last message failed with an error matching `predicate`.
    pub fn expect_error<F>(self, predicate: F) -> Self
    where
        F: FnOnce(&str) -> bool,
    {
        match &self.last {
            Some(Err(e)) => assert!(predicate(e), "Error predicate failed for '{}'", e),
            other => panic!("Expected an error, got {:?}", other),
        }
        self
    }

    /// Assert a timeout of type `M` was requested.
    pub fn expect_timeout<M: Message>(self) -> Self {
        self.bus.assert_timeout_requested::<M>();
        self
    }

    /// Assert an `M` was sent to `destination`.
    pub fn expect_reply<M: Message>(self, destination: &str) -> Self {
        self.bus.assert_sent_to::<M>(destination);
        self
    }

    /// Assert the persisted saga data matches a predicate.
    pub fn assert_data<F>(self, predicate: F) -> Self
    where
        F: FnOnce(&S::Data) -> bool,
    {
        let Some(data) = self.data() else {
            panic!("No saga data persisted for {:?}", self.saga_id);
        };
        assert!(predicate(&data), "Saga data predicate failed");
        self
    }

    /// The persisted data of the saga under test.
    pub fn data(&self) -> Option<S::Data> {
        let id = self.saga_id.as_deref()?;
        self.persister.get(id).map(|(data, _)| data)
    }

    /// The bus the saga dispatched through.
    pub fn bus(&self) -> &RecordingBus {
        &self.bus
    }

    /// The persister holding the saga data.
    pub fn persister(&self) -> &InMemorySagaPersister<S::Data> {
        &self.persister
    }
}

//! Outbound dispatch.
//!
//! [`Bus`] is the contract this crate dispatches through: point-to-point
//! sends, publishes, and deferred deliveries back to the local endpoint.
//! Delivery itself (queues, schedulers, acknowledgement) belongs to the
//! transport behind it.
//!
//! [`LocalBus`] is an in-process implementation over a broadcast channel.
//!
//! # Guarantees
//!
//! - **At-most-once delivery**: Slow receivers may miss dispatches
//! - **In-memory only**: Nothing is persisted
//! - **No scheduling**: Deferred messages are handed out immediately with
//!   their [`Delivery`]; holding them until due is the receiver's job
//!
//! # Send Pipeline
//!
//! [`OutgoingPipeline`] runs outgoing messages through a
//! `Pipeline<OutgoingContext>` (e.g. the data bus send behavior) before they
//! reach the bus. A behavior that stops the chain stops the dispatch.

use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::broadcast;
use tracing::debug;

use crate::conventions::Conventions;
use crate::error::BusError;
use crate::message::{headers, Message, OutgoingMessage};
use crate::pipeline::{MessageHandler, OutgoingContext, Pipeline, PipelineBuilder, Route};

/// Default channel capacity for the local bus.
const DEFAULT_CAPACITY: usize = 1024;

// =============================================================================
// Contract
// =============================================================================

/// When a deferred message becomes due.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    /// At an absolute instant.
    At(DateTime<Utc>),
    /// After a delay from now.
    Within(Duration),
}

impl Delivery {
    /// The instant this delivery is due, relative to `now`.
    pub fn due_at(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        match self {
            Delivery::At(at) => *at,
            Delivery::Within(delay) => match chrono::Duration::from_std(*delay) {
                Ok(delay) => now.checked_add_signed(delay).unwrap_or(DateTime::<Utc>::MAX_UTC),
                Err(_) => DateTime::<Utc>::MAX_UTC,
            },
        }
    }
}

/// The dispatch collaborator.
///
/// Calls enqueue and return; they never wait for delivery.
pub trait Bus: Send + Sync {
    /// Send to one destination, optionally correlated to an earlier message.
    fn send(
        &self,
        destination: &str,
        correlation_id: Option<&str>,
        message: OutgoingMessage,
    ) -> Result<()>;

    /// Publish to every subscriber.
    fn publish(&self, message: OutgoingMessage) -> Result<()>;

    /// Deliver back to this endpoint once due.
    fn defer(&self, delivery: Delivery, message: OutgoingMessage) -> Result<()>;
}

// =============================================================================
// Local Bus
// =============================================================================

/// One message handed to a [`LocalBus`].
#[derive(Debug)]
pub struct Dispatched {
    /// Where it was headed.
    pub route: Route,
    /// The message with its final headers.
    pub message: OutgoingMessage,
}

impl Dispatched {
    /// Downcast the body.
    pub fn downcast_ref<M: Message>(&self) -> Option<&M> {
        self.message.downcast_ref()
    }

    /// Look up a header.
    pub fn header(&self, key: &str) -> Option<&str> {
        self.message.header(key)
    }
}

/// In-process bus broadcasting every dispatch to its subscribers.
///
/// Stamps the endpoint name as the reply address of every message that
/// lacks one, and refuses to send events or publish commands.
///
/// # Example
///
/// ```ignore
/// let bus = LocalBus::new("sales", conventions.clone());
/// let mut dispatched = bus.subscribe();
///
/// bus.publish(OutgoingMessage::new(OrderAccepted { order_id }))?;
///
/// let d = dispatched.recv().await?;
/// assert_eq!(d.route, Route::Publish);
/// ```
#[derive(Clone)]
pub struct LocalBus {
    sender: broadcast::Sender<Arc<Dispatched>>,
    endpoint: String,
    conventions: Arc<Conventions>,
}

impl LocalBus {
    /// A bus for `endpoint` with default capacity.
    pub fn new(endpoint: impl Into<String>, conventions: Arc<Conventions>) -> Self {
        Self::with_capacity(endpoint, conventions, DEFAULT_CAPACITY)
    }

    /// A bus for `endpoint` buffering up to `capacity` dispatches per
    /// subscriber.
    pub fn with_capacity(
        endpoint: impl Into<String>,
        conventions: Arc<Conventions>,
        capacity: usize,
    ) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self {
            sender,
            endpoint: endpoint.into(),
            conventions,
        }
    }

    /// The local endpoint name.
    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    /// Receive every dispatch made after this call.
    pub fn subscribe(&self) -> broadcast::Receiver<Arc<Dispatched>> {
        self.sender.subscribe()
    }

    /// Returns the number of active subscribers.
    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }

    fn dispatch(&self, route: Route, mut message: OutgoingMessage) -> Result<()> {
        if message.header(headers::REPLY_TO_ADDRESS).is_none() {
            message.set_header(headers::REPLY_TO_ADDRESS, self.endpoint.clone());
        }
        debug!(
            message_type = %message.message_type(),
            ?route,
            "dispatching"
        );
        // No subscribers is not an error; the message is simply dropped.
        let _ = self.sender.send(Arc::new(Dispatched { route, message }));
        Ok(())
    }
}

impl Bus for LocalBus {
    fn send(
        &self,
        destination: &str,
        correlation_id: Option<&str>,
        mut message: OutgoingMessage,
    ) -> Result<()> {
        let message_type = message.message_type();
        if self.conventions.is_event(&message_type) {
            return Err(BusError::InvalidRouting {
                type_name: message_type.name(),
                reason: "events cannot be sent, publish them instead",
            }
            .into());
        }
        if let Some(id) = correlation_id {
            message.set_header(headers::CORRELATION_ID, id);
        }
        self.dispatch(
            Route::Send {
                destination: destination.to_string(),
                correlation_id: correlation_id.map(str::to_string),
            },
            message,
        )
    }

    fn publish(&self, message: OutgoingMessage) -> Result<()> {
        let message_type = message.message_type();
        if self.conventions.is_command(&message_type) {
            return Err(BusError::InvalidRouting {
                type_name: message_type.name(),
                reason: "commands cannot be published, send them instead",
            }
            .into());
        }
        self.dispatch(Route::Publish, message)
    }

    fn defer(&self, delivery: Delivery, message: OutgoingMessage) -> Result<()> {
        self.dispatch(Route::Defer(delivery), message)
    }
}

impl fmt::Debug for LocalBus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LocalBus")
            .field("endpoint", &self.endpoint)
            .field("subscriber_count", &self.subscriber_count())
            .finish()
    }
}

// =============================================================================
// Outbox
// =============================================================================

/// A [`Bus`] that only collects.
///
/// Code that must dispatch synchronously (saga handlers) writes here; the
/// owner later hands the collected messages to an [`OutgoingPipeline`] with
/// [`OutgoingPipeline::flush`], so they get the send-side behaviors. Dropping
/// an outbox without flushing discards its messages.
#[derive(Debug, Default)]
pub struct Outbox {
    pending: Mutex<Vec<(Route, OutgoingMessage)>>,
}

impl Outbox {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of collected messages.
    pub fn len(&self) -> usize {
        self.pending.lock().map(|p| p.len()).unwrap_or_default()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Take every collected message, oldest first.
    pub fn drain(&self) -> Result<Vec<(Route, OutgoingMessage)>> {
        Ok(std::mem::take(&mut *self.lock()?))
    }

    fn push(&self, route: Route, message: OutgoingMessage) -> Result<()> {
        self.lock()?.push((route, message));
        Ok(())
    }

    fn lock(&self) -> Result<MutexGuard<'_, Vec<(Route, OutgoingMessage)>>> {
        self.pending
            .lock()
            .map_err(|_| anyhow::anyhow!("outbox lock poisoned"))
    }
}

impl Bus for Outbox {
    fn send(
        &self,
        destination: &str,
        correlation_id: Option<&str>,
        message: OutgoingMessage,
    ) -> Result<()> {
        let route = Route::Send {
            destination: destination.to_string(),
            correlation_id: correlation_id.map(str::to_string),
        };
        self.push(route, message)
    }

    fn publish(&self, message: OutgoingMessage) -> Result<()> {
        self.push(Route::Publish, message)
    }

    fn defer(&self, delivery: Delivery, message: OutgoingMessage) -> Result<()> {
        self.push(Route::Defer(delivery), message)
    }
}

// =============================================================================
// Outgoing Pipeline
// =============================================================================

/// Marker left by the terminal handler when the whole chain ran.
struct Released;

struct ReleaseHandler;

#[async_trait]
impl MessageHandler<OutgoingContext> for ReleaseHandler {
    async fn handle(&self, ctx: &mut OutgoingContext) -> Result<()> {
        ctx.extensions_mut().insert(Released);
        Ok(())
    }
}

/// Runs outgoing messages through send-side behaviors, then hands them to
/// a [`Bus`].
pub struct OutgoingPipeline {
    pipeline: Pipeline<OutgoingContext>,
    bus: Arc<dyn Bus>,
}

impl OutgoingPipeline {
    /// Finish `builder` and dispatch through `bus`.
    ///
    /// Any terminal handler set on the builder is replaced.
    pub fn new(builder: PipelineBuilder<OutgoingContext>, bus: Arc<dyn Bus>) -> Self {
        Self {
            pipeline: builder.with_handler(ReleaseHandler).build(),
            bus,
        }
    }

    /// Send through the pipeline.
    pub async fn send(
        &self,
        destination: &str,
        correlation_id: Option<&str>,
        message: OutgoingMessage,
    ) -> Result<bool> {
        let route = Route::Send {
            destination: destination.to_string(),
            correlation_id: correlation_id.map(str::to_string),
        };
        self.dispatch(message, route).await
    }

    /// Publish through the pipeline.
    pub async fn publish(&self, message: OutgoingMessage) -> Result<bool> {
        self.dispatch(message, Route::Publish).await
    }

    /// Defer through the pipeline.
    pub async fn defer(&self, delivery: Delivery, message: OutgoingMessage) -> Result<bool> {
        self.dispatch(message, Route::Defer(delivery)).await
    }

    /// Run the chain and dispatch along `route`.
    ///
    /// Returns `false` if a behavior stopped the chain and nothing was sent.
    pub async fn dispatch(&self, message: OutgoingMessage, route: Route) -> Result<bool> {
        let mut ctx = OutgoingContext::new(message, route);
        self.pipeline.invoke(&mut ctx).await?;
        if ctx.extensions_mut().remove::<Released>().is_none() {
            return Ok(false);
        }

        let OutgoingContext { message, route, .. } = ctx;
        match route {
            Route::Send {
                destination,
                correlation_id,
            } => self
                .bus
                .send(&destination, correlation_id.as_deref(), message)?,
            Route::Publish => self.bus.publish(message)?,
            Route::Defer(delivery) => self.bus.defer(delivery, message)?,
        }
        Ok(true)
    }
}

impl OutgoingPipeline {
    /// Dispatch everything `outbox` collected, oldest first.
    ///
    /// Stops at the first failure; what was already dispatched stays
    /// dispatched. Returns the number of messages that reached the bus.
    pub async fn flush(&self, outbox: &Outbox) -> Result<usize> {
        let mut dispatched = 0;
        for (route, message) in outbox.drain()? {
            if self.dispatch(message, route).await? {
                dispatched += 1;
            }
        }
        Ok(dispatched)
    }
}

impl fmt::Debug for OutgoingPipeline {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OutgoingPipeline")
            .field("pipeline", &self.pipeline)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::MessageKind;
    use crate::pipeline::FnBehavior;

    #[derive(Debug)]
    struct PlaceOrder {
        order_id: u32,
    }
    impl Message for PlaceOrder {
        const KIND: MessageKind = MessageKind::Command;
    }

    #[derive(Debug)]
    struct OrderPlaced;
    impl Message for OrderPlaced {
        const KIND: MessageKind = MessageKind::Event;
    }

    #[derive(Debug)]
    struct Reminder;
    impl Message for Reminder {}

    fn bus() -> LocalBus {
        LocalBus::new("sales", Arc::new(Conventions::default()))
    }

    #[tokio::test]
    async fn test_send_stamps_reply_address_and_correlation() {
        let bus = bus();
        let mut rx = bus.subscribe();

        bus.send("billing", Some("m-1"), OutgoingMessage::new(PlaceOrder { order_id: 1 }))
            .unwrap();

        let d = rx.recv().await.unwrap();
        assert_eq!(d.header(headers::REPLY_TO_ADDRESS), Some("sales"));
        assert_eq!(d.header(headers::CORRELATION_ID), Some("m-1"));
        assert_eq!(d.downcast_ref::<PlaceOrder>().unwrap().order_id, 1);
        assert_eq!(
            d.route,
            Route::Send {
                destination: "billing".into(),
                correlation_id: Some("m-1".into())
            }
        );
    }

    #[tokio::test]
    async fn test_existing_reply_address_is_kept() {
        let bus = bus();
        let mut rx = bus.subscribe();

        let message =
            OutgoingMessage::new(OrderPlaced).with_header(headers::REPLY_TO_ADDRESS, "elsewhere");
        bus.publish(message).unwrap();

        let d = rx.recv().await.unwrap();
        assert_eq!(d.header(headers::REPLY_TO_ADDRESS), Some("elsewhere"));
    }

    #[test]
    fn test_sending_an_event_is_rejected() {
        let err = bus()
            .send("billing", None, OutgoingMessage::new(OrderPlaced))
            .unwrap_err();
        assert!(matches!(
            err.downcast_ref::<BusError>(),
            Some(BusError::InvalidRouting { .. })
        ));
    }

    #[test]
    fn test_publishing_a_command_is_rejected() {
        let err = bus()
            .publish(OutgoingMessage::new(PlaceOrder { order_id: 1 }))
            .unwrap_err();
        assert!(matches!(
            err.downcast_ref::<BusError>(),
            Some(BusError::InvalidRouting { .. })
        ));
    }

    #[tokio::test]
    async fn test_defer_carries_delivery() {
        let bus = bus();
        let mut rx = bus.subscribe();

        bus.defer(Delivery::Within(Duration::from_secs(30)), OutgoingMessage::new(Reminder))
            .unwrap();

        let d = rx.recv().await.unwrap();
        assert_eq!(d.route, Route::Defer(Delivery::Within(Duration::from_secs(30))));
    }

    #[test]
    fn test_delivery_due_at() {
        let now = Utc::now();
        assert_eq!(Delivery::At(now).due_at(Utc::now()), now);
        assert_eq!(
            Delivery::Within(Duration::from_secs(60)).due_at(now),
            now + chrono::Duration::seconds(60)
        );
    }

    #[test]
    fn test_no_subscribers_is_fine() {
        assert!(bus().publish(OutgoingMessage::new(OrderPlaced)).is_ok());
    }

    #[tokio::test]
    async fn test_outgoing_pipeline_dispatches_after_chain() {
        let bus = bus();
        let mut rx = bus.subscribe();
        let pipeline = OutgoingPipeline::new(
            PipelineBuilder::new().with_behavior(FnBehavior::new(
                "stamp",
                |ctx: &mut OutgoingContext| {
                    ctx.message.set_header("tenant", "acme");
                    Ok(true)
                },
            )),
            Arc::new(bus.clone()),
        );

        assert!(pipeline.publish(OutgoingMessage::new(OrderPlaced)).await.unwrap());
        let d = rx.recv().await.unwrap();
        assert_eq!(d.header("tenant"), Some("acme"));
    }

    #[tokio::test]
    async fn test_outbox_flushes_in_order_through_the_chain() {
        let bus = bus();
        let mut rx = bus.subscribe();
        let pipeline = OutgoingPipeline::new(
            PipelineBuilder::new().with_behavior(FnBehavior::new(
                "stamp",
                |ctx: &mut OutgoingContext| {
                    ctx.message.set_header("tenant", "acme");
                    Ok(true)
                },
            )),
            Arc::new(bus.clone()),
        );

        let outbox = Outbox::new();
        outbox
            .send("billing", Some("m-1"), OutgoingMessage::new(PlaceOrder { order_id: 3 }))
            .unwrap();
        outbox
            .defer(Delivery::Within(Duration::from_secs(5)), OutgoingMessage::new(Reminder))
            .unwrap();
        assert_eq!(outbox.len(), 2);
        assert!(rx.try_recv().is_err());

        assert_eq!(pipeline.flush(&outbox).await.unwrap(), 2);
        assert!(outbox.is_empty());

        let first = rx.recv().await.unwrap();
        assert_eq!(first.downcast_ref::<PlaceOrder>().unwrap().order_id, 3);
        assert_eq!(first.header(headers::CORRELATION_ID), Some("m-1"));
        assert_eq!(first.header("tenant"), Some("acme"));
        let second = rx.recv().await.unwrap();
        assert_eq!(second.route, Route::Defer(Delivery::Within(Duration::from_secs(5))));
    }

    #[tokio::test]
    async fn test_outgoing_pipeline_short_circuit_sends_nothing() {
        let bus = bus();
        let mut rx = bus.subscribe();
        let pipeline = OutgoingPipeline::new(
            PipelineBuilder::new()
                .with_behavior(FnBehavior::new("drop", |_: &mut OutgoingContext| Ok(false))),
            Arc::new(bus.clone()),
        );

        let sent = pipeline
            .send("billing", None, OutgoingMessage::new(PlaceOrder { order_id: 2 }))
            .await
            .unwrap();
        assert!(!sent);
        assert!(rx.try_recv().is_err());
    }
}

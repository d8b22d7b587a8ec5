//! Routes inbound messages to saga instances.
//!
//! # Execution Order
//!
//! For every registered saga type that handles the inbound message type:
//!
//! 1. **Find** the instance: by `NServiceBus.SagaId` when the message is
//!    addressed to this saga type, otherwise through the correlation mapping
//!    of the message type.
//! 2. **Create** a new instance if none was found and the message starts the
//!    saga. Its originator and original message id come from the message.
//! 3. **Handle** synchronously with a [`SagaContext`].
//! 4. **Complete or save** the instance with the revision it was loaded at.
//!
//! Saga types run one after another in registration order. The first
//! failure stops the dispatch and propagates unchanged.

use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use smallvec::SmallVec;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::handlers::{HandlerEntry, SagaDefinition};
use super::{Revision, Saga, SagaContext, SagaData, SagaPersister, SagaType};
use crate::bus::{Bus, Outbox, OutgoingPipeline};
use crate::error::BusError;
use crate::message::{headers, MessageType};
use crate::pipeline::{Behavior, MessageContext, Next};

/// What happened to one saga type for one message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SagaOutcome {
    /// A new instance was created and saved.
    Started {
        saga_type: &'static str,
        id: String,
        revision: Revision,
    },
    /// An existing instance was handled and saved.
    Updated {
        saga_type: &'static str,
        id: String,
        revision: Revision,
    },
    /// The handler completed the instance and it was removed.
    Completed { saga_type: &'static str, id: String },
    /// No instance matched and the message does not start the saga.
    NotFound { saga_type: &'static str },
}

impl SagaOutcome {
    /// The saga type this outcome belongs to.
    pub fn saga_type(&self) -> &'static str {
        match self {
            SagaOutcome::Started { saga_type, .. }
            | SagaOutcome::Updated { saga_type, .. }
            | SagaOutcome::Completed { saga_type, .. }
            | SagaOutcome::NotFound { saga_type } => saga_type,
        }
    }

    /// The saga id, unless no instance was found.
    pub fn saga_id(&self) -> Option<&str> {
        match self {
            SagaOutcome::Started { id, .. }
            | SagaOutcome::Updated { id, .. }
            | SagaOutcome::Completed { id, .. } => Some(id),
            SagaOutcome::NotFound { .. } => None,
        }
    }
}

/// Outcomes of one dispatch, one per saga type that handled the message.
pub type SagaOutcomes = SmallVec<[SagaOutcome; 1]>;

// =============================================================================
// Runner
// =============================================================================

#[async_trait]
trait AnySagaRunner: Send + Sync {
    fn saga_type(&self) -> &SagaType;

    fn handles(&self, message_type: &MessageType) -> bool;

    /// `None` when the message is not for this saga type.
    async fn dispatch(
        &self,
        ctx: &MessageContext,
        bus: Option<&dyn Bus>,
    ) -> Result<Option<SagaOutcome>>;
}

struct SagaRunner<S: Saga> {
    saga: S,
    definition: SagaDefinition<S>,
    persister: Arc<dyn SagaPersister<S::Data>>,
}

/// How an inbound message selects its saga instance.
enum Target<'c> {
    /// Through the correlation mapping of its type.
    Correlated,
    /// By the saga id it carries.
    Id(&'c str),
    /// A timeout requested by another saga type.
    Elsewhere,
}

impl<S: Saga> SagaRunner<S> {
    fn target<'c>(&self, ctx: &'c MessageContext) -> Target<'c> {
        let Some(id) = ctx.header(headers::SAGA_ID).filter(|id| !id.is_empty()) else {
            return Target::Correlated;
        };
        match ctx.header(headers::SAGA_TYPE) {
            Some(t) if t != self.definition.saga_type.name() => {
                if ctx.is_timeout_message() {
                    Target::Elsewhere
                } else {
                    Target::Correlated
                }
            }
            _ => Target::Id(id),
        }
    }

    async fn find(
        &self,
        ctx: &MessageContext,
        target: Option<&str>,
    ) -> Result<Option<(S::Data, Revision)>> {
        if let Some(id) = target {
            return Ok(self.persister.find_by_id(id).await.map_err(BusError::from)?);
        }

        let message_type = ctx.message_type();
        let Some(mapping) = self.definition.mapper.mapping_for(&message_type) else {
            return Ok(None);
        };
        let Some(value) = mapping.message_value(ctx.message()) else {
            debug!(
                saga_type = self.definition.saga_type.name(),
                %message_type,
                property = mapping.message_property(),
                "correlation value is empty"
            );
            return Ok(None);
        };
        Ok(self
            .persister
            .find_by_correlation(mapping.saga_property(), &value)
            .await
            .map_err(BusError::from)?)
    }

    fn new_instance(ctx: &MessageContext) -> S::Data {
        let mut data = S::Data::default();
        let meta = data.metadata_mut();
        meta.id = Uuid::new_v4().to_string();
        meta.originator = ctx.reply_to_address().map(str::to_string);
        meta.original_message_id = ctx.message_id().map(str::to_string);
        data
    }

    fn handle(
        &self,
        entry: &HandlerEntry<S>,
        data: &mut S::Data,
        ctx: &MessageContext,
        bus: Option<&dyn Bus>,
    ) -> Result<()> {
        let mut saga_ctx =
            SagaContext::new(data, &self.definition.saga_type).with_headers(ctx.headers());
        if let Some(bus) = bus {
            saga_ctx = saga_ctx.with_bus(bus);
        }
        entry.invoke(&self.saga, ctx.message(), &mut saga_ctx)
    }
}

#[async_trait]
impl<S: Saga> AnySagaRunner for SagaRunner<S> {
    fn saga_type(&self) -> &SagaType {
        &self.definition.saga_type
    }

    fn handles(&self, message_type: &MessageType) -> bool {
        self.definition.handlers.handles_type(message_type)
    }

    async fn dispatch(
        &self,
        ctx: &MessageContext,
        bus: Option<&dyn Bus>,
    ) -> Result<Option<SagaOutcome>> {
        let saga_type = self.definition.saga_type.name();
        let message_type = ctx.message_type();
        let Some(entry) = self
            .definition
            .handlers
            .entry_for(&message_type, ctx.is_timeout_message())
        else {
            return Ok(None);
        };
        let target = match self.target(ctx) {
            Target::Correlated => None,
            Target::Id(id) => Some(id),
            Target::Elsewhere => return Ok(None),
        };

        let (mut data, revision) = match self.find(ctx, target).await? {
            Some(found) => found,
            None if target.is_some() => {
                // Completed before the message arrived, typically a late timeout.
                info!(
                    saga_type,
                    saga_id = target.unwrap_or_default(),
                    %message_type,
                    "saga no longer exists, message ignored"
                );
                return Ok(Some(SagaOutcome::NotFound { saga_type }));
            }
            None if entry.started_by => (Self::new_instance(ctx), Revision::NONE),
            None => {
                warn!(saga_type, %message_type, "no saga found for message");
                return Ok(Some(SagaOutcome::NotFound { saga_type }));
            }
        };

        self.handle(entry, &mut data, ctx, bus)?;

        let id = data.id().to_string();
        if data.metadata().completed {
            if !revision.is_none() {
                self.persister
                    .complete(&data, revision)
                    .await
                    .map_err(BusError::from)?;
            }
            info!(saga_type, saga_id = %id, %message_type, "saga completed");
            return Ok(Some(SagaOutcome::Completed { saga_type, id }));
        }

        let saved = self
            .persister
            .save(&data, revision)
            .await
            .map_err(BusError::from)?;
        if revision.is_none() {
            info!(saga_type, saga_id = %id, %message_type, "saga started");
            Ok(Some(SagaOutcome::Started {
                saga_type,
                id,
                revision: saved,
            }))
        } else {
            debug!(saga_type, saga_id = %id, %message_type, revision = %saved, "saga updated");
            Ok(Some(SagaOutcome::Updated {
                saga_type,
                id,
                revision: saved,
            }))
        }
    }
}

// =============================================================================
// Engine
// =============================================================================

/// The registered saga types of an endpoint.
///
/// # Example
///
/// ```ignore
/// let engine = SagaEngine::new()
///     .register(ShippingSaga, Arc::new(shipping_store))?
///     .register(RefundSaga, Arc::new(refund_store))?;
///
/// let outcomes = engine.dispatch(&ctx, Some(&bus)).await?;
/// ```
#[derive(Default)]
pub struct SagaEngine {
    runners: Vec<Arc<dyn AnySagaRunner>>,
    names: HashSet<&'static str>,
}

impl SagaEngine {
    pub fn new() -> Self {
        Self::default()
    }

    /// Configure and register a saga type.
    ///
    /// Runs the saga's mapping and handler configuration once. Fails if the
    /// configuration fails or the saga type name is already registered.
    pub fn register<S: Saga>(
        mut self,
        saga: S,
        persister: Arc<dyn SagaPersister<S::Data>>,
    ) -> Result<Self> {
        let name = S::saga_type_name();
        if self.names.contains(name) {
            return Err(BusError::DuplicateRegistration { name }.into());
        }

        let definition = SagaDefinition::configure(&saga)?;
        debug!(
            saga_type = name,
            mappings = definition.mapper.mappings().len(),
            "saga type registered"
        );
        self.names.insert(name);
        self.runners.push(Arc::new(SagaRunner {
            saga,
            definition,
            persister,
        }));
        Ok(self)
    }

    /// Registered saga types, in registration order.
    pub fn saga_types(&self) -> impl Iterator<Item = &SagaType> + '_ {
        self.runners.iter().map(|r| r.saga_type())
    }

    /// Returns true if any saga type reacts to `message_type`.
    pub fn handles(&self, message_type: &MessageType) -> bool {
        self.runners.iter().any(|r| r.handles(message_type))
    }

    /// Run every saga type that handles the message.
    pub async fn dispatch(
        &self,
        ctx: &MessageContext,
        bus: Option<&dyn Bus>,
    ) -> Result<SagaOutcomes> {
        let mut outcomes = SagaOutcomes::new();
        for runner in &self.runners {
            if let Some(outcome) = runner.dispatch(ctx, bus).await? {
                outcomes.push(outcome);
            }
        }
        Ok(outcomes)
    }
}

impl fmt::Debug for SagaEngine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SagaEngine")
            .field("saga_types", &self.saga_types().collect::<Vec<_>>())
            .finish()
    }
}

// =============================================================================
// Behavior
// =============================================================================

/// Pipeline stage dispatching to the saga engine.
///
/// Leaves the [`SagaOutcomes`] in the context extensions and always
/// continues the chain.
///
/// Replies and timeout requests made by saga handlers are collected in an
/// [`Outbox`] and leave through the attached [`OutgoingPipeline`] once every
/// saga type has handled and saved the message, so they pass the send-side
/// behaviors (the data bus among them). If a handler or a save fails, nothing
/// is dispatched. Without a pipeline attached, sagas that dispatch fail with
/// [`BusError::BusNotAttached`].
#[derive(Clone)]
pub struct SagaBehavior {
    engine: Arc<SagaEngine>,
    outgoing: Option<Arc<OutgoingPipeline>>,
}

impl SagaBehavior {
    pub fn new(engine: Arc<SagaEngine>) -> Self {
        Self {
            engine,
            outgoing: None,
        }
    }

    /// Attach the send pipeline saga messages leave through.
    pub fn with_outgoing(mut self, outgoing: Arc<OutgoingPipeline>) -> Self {
        self.outgoing = Some(outgoing);
        self
    }
}

#[async_trait]
impl Behavior<MessageContext> for SagaBehavior {
    async fn invoke(&self, ctx: &mut MessageContext, next: Next<'_, MessageContext>) -> Result<()> {
        let outbox = Outbox::new();
        let bus = self.outgoing.as_ref().map(|_| &outbox as &dyn Bus);
        let outcomes = self.engine.dispatch(ctx, bus).await?;

        if let Some(outgoing) = &self.outgoing {
            let dispatched = outgoing.flush(&outbox).await?;
            if dispatched > 0 {
                debug!(dispatched, "saga messages dispatched");
            }
        }

        ctx.extensions_mut().insert(outcomes);
        next.run(ctx).await
    }

    fn name(&self) -> &'static str {
        "saga"
    }
}

impl fmt::Debug for SagaBehavior {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SagaBehavior")
            .field("engine", &self.engine)
            .field("outgoing", &self.outgoing)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::{Headers, Message};
    use crate::pipeline::{FnBehavior, OutgoingContext, PipelineBuilder};
    use crate::saga::testing::InMemorySagaPersister;
    use crate::saga::{SagaHandlers, SagaMapper, SagaMetadata, StoreError};
    use crate::testing::RecordingBus;
    use serde::{Deserialize, Serialize};
    use std::time::Duration;

    #[derive(Debug, Clone, Default, Serialize, Deserialize)]
    struct ShippingData {
        meta: SagaMetadata,
        order_id: u32,
        billed: bool,
    }

    impl SagaData for ShippingData {
        fn metadata(&self) -> &SagaMetadata {
            &self.meta
        }
        fn metadata_mut(&mut self) -> &mut SagaMetadata {
            &mut self.meta
        }
    }

    #[derive(Debug)]
    struct OrderPlaced {
        order_id: u32,
    }
    impl Message for OrderPlaced {}

    #[derive(Debug)]
    struct OrderBilled {
        order_id: u32,
    }
    impl Message for OrderBilled {}

    #[derive(Debug)]
    struct OrderShipped {
        order_id: u32,
    }
    impl Message for OrderShipped {}

    #[derive(Debug, Default)]
    struct PaymentOverdue;
    impl Message for PaymentOverdue {}

    #[derive(Debug, Default)]
    struct OrderCancelled;
    impl Message for OrderCancelled {}

    struct ShippingSaga;

    impl ShippingSaga {
        fn on_placed(
            &self,
            m: &OrderPlaced,
            ctx: &mut SagaContext<'_, ShippingData>,
        ) -> Result<()> {
            ctx.data_mut().order_id = m.order_id;
            ctx.request_timeout_within_default::<PaymentOverdue>(Duration::from_secs(600))
        }

        fn on_billed(
            &self,
            _: &OrderBilled,
            ctx: &mut SagaContext<'_, ShippingData>,
        ) -> Result<()> {
            ctx.data_mut().billed = true;
            Ok(())
        }

        fn on_shipped(
            &self,
            _: &OrderShipped,
            ctx: &mut SagaContext<'_, ShippingData>,
        ) -> Result<()> {
            ctx.mark_as_complete();
            Ok(())
        }

        fn on_overdue(
            &self,
            _: &PaymentOverdue,
            ctx: &mut SagaContext<'_, ShippingData>,
        ) -> Result<()> {
            if !ctx.data().billed {
                ctx.reply_to_originator(OrderCancelled)?;
                ctx.mark_as_complete();
            }
            Ok(())
        }
    }

    impl Saga for ShippingSaga {
        type Data = ShippingData;

        fn saga_type_name() -> &'static str {
            "Shipping.ShippingSaga"
        }

        fn configure_how_to_find_saga(&self, mapper: &mut SagaMapper<ShippingData>) -> Result<()> {
            mapper
                .configure_mapping("order_id", |m: &OrderPlaced| m.order_id)?
                .to_saga("order_id", |d| d.order_id);
            mapper
                .configure_mapping("order_id", |m: &OrderBilled| m.order_id)?
                .to_saga("order_id", |d| d.order_id);
            mapper
                .configure_mapping("order_id", |m: &OrderShipped| m.order_id)?
                .to_saga("order_id", |d| d.order_id);
            Ok(())
        }

        fn configure_handlers(h: &mut SagaHandlers<Self>) {
            h.started_by(Self::on_placed)
                .handles(Self::on_billed)
                .handles(Self::on_shipped)
                .timeout(Self::on_overdue);
        }
    }

    fn setup() -> (SagaEngine, Arc<InMemorySagaPersister<ShippingData>>, RecordingBus) {
        let persister = Arc::new(InMemorySagaPersister::new());
        let engine = SagaEngine::new()
            .register(ShippingSaga, persister.clone())
            .unwrap();
        (engine, persister, RecordingBus::new())
    }

    fn inbound<M: Message>(message: M) -> MessageContext {
        let mut headers = Headers::new();
        headers.insert(headers::MESSAGE_ID.into(), "m-1".into());
        headers.insert(headers::REPLY_TO_ADDRESS.into(), "webshop".into());
        MessageContext::new(message, headers)
    }

    fn started_id(outcomes: &SagaOutcomes) -> String {
        match &outcomes[..] {
            [SagaOutcome::Started { id, revision, .. }] => {
                assert_eq!(*revision, Revision::new(1));
                id.clone()
            }
            other => panic!("expected a started saga, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_started_by_creates_saga_with_originator() {
        let (engine, persister, bus) = setup();

        let outcomes = engine
            .dispatch(&inbound(OrderPlaced { order_id: 42 }), Some(&bus))
            .await
            .unwrap();
        let id = started_id(&outcomes);

        let (data, _) = persister.get(&id).unwrap();
        assert_eq!(data.order_id, 42);
        assert_eq!(data.meta.originator.as_deref(), Some("webshop"));
        assert_eq!(data.meta.original_message_id.as_deref(), Some("m-1"));

        let timeout = bus.last().unwrap();
        assert_eq!(timeout.header(headers::SAGA_ID), Some(id.as_str()));
        assert_eq!(timeout.header(headers::SAGA_TYPE), Some("Shipping.ShippingSaga"));
    }

    #[tokio::test]
    async fn test_correlated_message_updates_existing_saga() {
        let (engine, persister, bus) = setup();
        let id = started_id(
            &engine
                .dispatch(&inbound(OrderPlaced { order_id: 42 }), Some(&bus))
                .await
                .unwrap(),
        );

        let outcomes = engine
            .dispatch(&inbound(OrderBilled { order_id: 42 }), Some(&bus))
            .await
            .unwrap();
        assert_eq!(
            outcomes[0],
            SagaOutcome::Updated {
                saga_type: "Shipping.ShippingSaga",
                id: id.clone(),
                revision: Revision::new(2),
            }
        );
        assert!(persister.get(&id).unwrap().0.billed);
    }

    #[tokio::test]
    async fn test_uncorrelated_message_is_not_found() {
        let (engine, persister, bus) = setup();

        let outcomes = engine
            .dispatch(&inbound(OrderBilled { order_id: 7 }), Some(&bus))
            .await
            .unwrap();
        assert_eq!(
            outcomes[0],
            SagaOutcome::NotFound {
                saga_type: "Shipping.ShippingSaga"
            }
        );
        assert!(persister.is_empty());
    }

    #[tokio::test]
    async fn test_completion_removes_saga() {
        let (engine, persister, bus) = setup();
        let id = started_id(
            &engine
                .dispatch(&inbound(OrderPlaced { order_id: 42 }), Some(&bus))
                .await
                .unwrap(),
        );

        let outcomes = engine
            .dispatch(&inbound(OrderShipped { order_id: 42 }), Some(&bus))
            .await
            .unwrap();
        assert_eq!(outcomes[0].saga_id(), Some(id.as_str()));
        assert!(matches!(outcomes[0], SagaOutcome::Completed { .. }));
        assert!(persister.is_empty());
    }

    #[tokio::test]
    async fn test_timeout_loads_by_saga_id() {
        let (engine, persister, bus) = setup();
        let id = started_id(
            &engine
                .dispatch(&inbound(OrderPlaced { order_id: 42 }), Some(&bus))
                .await
                .unwrap(),
        );

        // Deliver the deferred message back, as a scheduler would.
        let deferred = bus.last().unwrap();
        let ctx = MessageContext::new(PaymentOverdue, deferred.message.headers().clone());
        let outcomes = engine.dispatch(&ctx, Some(&bus)).await.unwrap();

        assert!(matches!(outcomes[0], SagaOutcome::Completed { .. }));
        assert!(persister.get(&id).is_none());
        let reply = bus.last().unwrap();
        assert!(reply.downcast_ref::<OrderCancelled>().is_some());
        assert_eq!(
            reply.route,
            crate::pipeline::Route::Send {
                destination: "webshop".into(),
                correlation_id: Some("m-1".into()),
            }
        );
    }

    #[tokio::test]
    async fn test_late_timeout_is_ignored() {
        let (engine, _persister, bus) = setup();
        let mut headers = Headers::new();
        headers.insert(headers::SAGA_ID.into(), "gone".into());
        headers.insert(headers::IS_SAGA_TIMEOUT_MESSAGE.into(), "True".into());
        headers.insert(headers::SAGA_TYPE.into(), "Shipping.ShippingSaga".into());

        let outcomes = engine
            .dispatch(&MessageContext::new(PaymentOverdue, headers), Some(&bus))
            .await
            .unwrap();
        assert!(matches!(outcomes[0], SagaOutcome::NotFound { .. }));
        assert_eq!(bus.count(), 0);
    }

    #[tokio::test]
    async fn test_timeout_of_another_saga_type_is_skipped() {
        let (engine, _persister, bus) = setup();
        let mut headers = Headers::new();
        headers.insert(headers::SAGA_ID.into(), "S1".into());
        headers.insert(headers::IS_SAGA_TIMEOUT_MESSAGE.into(), "True".into());
        headers.insert(headers::SAGA_TYPE.into(), "Billing.DunningSaga".into());

        let outcomes = engine
            .dispatch(&MessageContext::new(PaymentOverdue, headers), Some(&bus))
            .await
            .unwrap();
        assert!(outcomes.is_empty());
    }

    #[tokio::test]
    async fn test_stale_revision_surfaces_conflict() {
        let (engine, persister, bus) = setup();
        let id = started_id(
            &engine
                .dispatch(&inbound(OrderPlaced { order_id: 42 }), Some(&bus))
                .await
                .unwrap(),
        );

        // Another writer completed and restarted the instance under us.
        struct Racing(Arc<InMemorySagaPersister<ShippingData>>);

        #[async_trait]
        impl SagaPersister<ShippingData> for Racing {
            async fn find_by_id(&self, id: &str) -> Result<Option<(ShippingData, Revision)>, StoreError> {
                self.0.find_by_id(id).await
            }
            async fn find_by_correlation(
                &self,
                property: &crate::saga::SagaProperty<ShippingData>,
                value: &serde_json::Value,
            ) -> Result<Option<(ShippingData, Revision)>, StoreError> {
                let found = self.0.find_by_correlation(property, value).await?;
                if let Some((data, rev)) = &found {
                    self.0.save(data, *rev).await?;
                }
                Ok(found)
            }
            async fn save(&self, data: &ShippingData, expected: Revision) -> Result<Revision, StoreError> {
                self.0.save(data, expected).await
            }
            async fn complete(&self, data: &ShippingData, expected: Revision) -> Result<(), StoreError> {
                self.0.complete(data, expected).await
            }
        }

        let racing = SagaEngine::new()
            .register(ShippingSaga, Arc::new(Racing(persister.clone())))
            .unwrap();
        let err = racing
            .dispatch(&inbound(OrderBilled { order_id: 42 }), Some(&bus))
            .await
            .unwrap_err();
        assert!(matches!(
            err.downcast_ref::<BusError>(),
            Some(BusError::Store(StoreError::Conflict))
        ));
        assert!(!persister.get(&id).unwrap().0.billed);
    }

    #[tokio::test]
    async fn test_handler_error_skips_save() {
        let (engine, persister, _bus) = setup();

        // No bus: requesting the timeout fails inside the started-by handler.
        let err = engine
            .dispatch(&inbound(OrderPlaced { order_id: 42 }), None)
            .await
            .unwrap_err();
        assert!(matches!(
            err.downcast_ref::<BusError>(),
            Some(BusError::BusNotAttached)
        ));
        assert!(persister.is_empty());
    }

    #[test]
    fn test_duplicate_saga_type_is_rejected() {
        let persister = Arc::new(InMemorySagaPersister::<ShippingData>::new());
        let err = SagaEngine::new()
            .register(ShippingSaga, persister.clone())
            .unwrap()
            .register(ShippingSaga, persister)
            .unwrap_err();
        assert!(matches!(
            err.downcast_ref::<BusError>(),
            Some(BusError::DuplicateRegistration { name: "Shipping.ShippingSaga" })
        ));
    }

    #[test]
    fn test_capability_table_comes_from_handlers() {
        let (engine, _, _) = setup();
        let saga_type = engine.saga_types().next().unwrap();
        assert!(saga_type.handles_timeout(&MessageType::of::<PaymentOverdue>()));
        assert!(!saga_type.handles_timeout(&MessageType::of::<OrderBilled>()));
        assert!(engine.handles(&MessageType::of::<OrderShipped>()));
        assert!(!engine.handles(&MessageType::of::<OrderCancelled>()));
    }

    fn outgoing(bus: &RecordingBus) -> Arc<OutgoingPipeline> {
        Arc::new(OutgoingPipeline::new(
            PipelineBuilder::new().with_behavior(FnBehavior::new(
                "stamp",
                |ctx: &mut OutgoingContext| {
                    ctx.message.set_header("sent-by", "shipping");
                    Ok(true)
                },
            )),
            Arc::new(bus.clone()),
        ))
    }

    #[tokio::test]
    async fn test_behavior_records_outcomes_and_continues() {
        let (engine, _persister, bus) = setup();
        let reached = Arc::new(std::sync::atomic::AtomicBool::new(false));
        let flag = reached.clone();
        let seen = bus.clone();

        let pipeline = PipelineBuilder::new()
            .with_behavior(SagaBehavior::new(Arc::new(engine)).with_outgoing(outgoing(&bus)))
            .with_behavior(FnBehavior::new("after", move |ctx: &mut MessageContext| {
                assert_eq!(ctx.extensions().get::<SagaOutcomes>().map(|o| o.len()), Some(1));
                // Saga messages are out before the rest of the chain runs.
                assert_eq!(seen.deferred().len(), 1);
                flag.store(true, std::sync::atomic::Ordering::SeqCst);
                Ok(true)
            }))
            .build();

        let mut ctx = inbound(OrderPlaced { order_id: 1 });
        pipeline.invoke(&mut ctx).await.unwrap();
        assert!(reached.load(std::sync::atomic::Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_behavior_sends_saga_messages_through_outgoing_pipeline() {
        let (engine, persister, bus) = setup();
        let pipeline = PipelineBuilder::new()
            .with_behavior(SagaBehavior::new(Arc::new(engine)).with_outgoing(outgoing(&bus)))
            .build();

        let mut ctx = inbound(OrderPlaced { order_id: 7 });
        pipeline.invoke(&mut ctx).await.unwrap();
        let timeout = bus.last().unwrap();
        assert_eq!(timeout.header("sent-by"), Some("shipping"));

        let mut ctx = MessageContext::new(PaymentOverdue, timeout.message.headers().clone());
        pipeline.invoke(&mut ctx).await.unwrap();
        bus.assert_sent_to::<OrderCancelled>("webshop");
        assert_eq!(bus.last().unwrap().header("sent-by"), Some("shipping"));
        assert!(persister.is_empty());
    }

    /// Loads fine, never saves.
    struct StaleStore(Arc<InMemorySagaPersister<ShippingData>>);

    #[async_trait]
    impl SagaPersister<ShippingData> for StaleStore {
        async fn find_by_id(&self, id: &str) -> Result<Option<(ShippingData, Revision)>, StoreError> {
            self.0.find_by_id(id).await
        }
        async fn find_by_correlation(
            &self,
            property: &crate::saga::SagaProperty<ShippingData>,
            value: &serde_json::Value,
        ) -> Result<Option<(ShippingData, Revision)>, StoreError> {
            self.0.find_by_correlation(property, value).await
        }
        async fn save(&self, _: &ShippingData, _: Revision) -> Result<Revision, StoreError> {
            Err(StoreError::Conflict)
        }
        async fn complete(&self, _: &ShippingData, _: Revision) -> Result<(), StoreError> {
            Err(StoreError::Conflict)
        }
    }

    #[tokio::test]
    async fn test_failed_save_dispatches_nothing() {
        let bus = RecordingBus::new();
        let engine = SagaEngine::new()
            .register(
                ShippingSaga,
                Arc::new(StaleStore(Arc::new(InMemorySagaPersister::new()))),
            )
            .unwrap();
        let pipeline = PipelineBuilder::new()
            .with_behavior(SagaBehavior::new(Arc::new(engine)).with_outgoing(outgoing(&bus)))
            .build();

        let mut ctx = inbound(OrderPlaced { order_id: 9 });
        let err = pipeline.invoke(&mut ctx).await.unwrap_err();
        assert!(matches!(
            err.downcast_ref::<BusError>(),
            Some(BusError::Store(StoreError::Conflict))
        ));
        bus.assert_nothing_dispatched();
    }

    #[tokio::test]
    async fn test_behavior_without_outgoing_pipeline_rejects_dispatch() {
        let (engine, persister, _bus) = setup();
        let pipeline = PipelineBuilder::new()
            .with_behavior(SagaBehavior::new(Arc::new(engine)))
            .build();

        let err = pipeline
            .invoke(&mut inbound(OrderPlaced { order_id: 3 }))
            .await
            .unwrap_err();
        assert!(matches!(
            err.downcast_ref::<BusError>(),
            Some(BusError::BusNotAttached)
        ));
        assert!(persister.is_empty());
    }
}

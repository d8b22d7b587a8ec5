//! # Busline
//!
//! The message-handling core of a service bus endpoint: a behavior pipeline
//! every inbound message runs through, a saga engine for long-running
//! processes, and a data bus that moves large properties out of band.
//!
//! ## Core Concepts
//!
//! - [`Message`] = a payload type, classified as command, event or plain
//!   message by the [`Conventions`]
//! - [`Behavior`](pipeline::Behavior) = one stage of the receive or send chain
//! - [`Saga`](saga::Saga) = a persisted process correlated across messages
//! - [`Bus`] = the dispatch collaborator replies and timeouts leave through
//!
//! ## Architecture
//!
//! ```text
//! Transport
//!     │
//!     ▼ MessageContext
//! Pipeline.invoke()
//!     │
//!     ├─► TracingBehavior        span per message
//!     │
//!     ├─► DataBusReceiveBehavior ◄──── DataBusStore.get()
//!     │
//!     ├─► SagaBehavior
//!     │       │
//!     │       ├─► SagaPersister.find / save / complete
//!     │       │
//!     │       ├─► Saga handler ─► SagaContext ─► Outbox
//!     │       │
//!     │       └─► OutgoingPipeline.flush(Outbox)
//!     │
//!     └─► HandlerRegistry         application handlers
//!
//! OutgoingPipeline.send()/publish()/defer()
//!     │
//!     ├─► DataBusSendBehavior ───────► DataBusStore.put()
//!     │
//!     └─► Bus
//! ```
//!
//! ## Key Invariants
//!
//! 1. **Classification is memoized** - A convention predicate runs once per type
//!    until it is replaced
//! 2. **Data bus I/O is independent** - It never joins the message's transaction
//! 3. **Mappings are configuration** - They can only be registered while a saga
//!    type is configured
//! 4. **Checks before dispatch** - A saga operation that fails never reaches the
//!    bus
//! 5. **Nothing is swallowed** - Every failure reaches the pipeline caller as
//!    an `anyhow::Error`, downcastable to [`BusError`]
//!
//! ## Guarantees
//!
//! - **Optimistic concurrency**: Two writers of one saga instance cannot both
//!   commit; the loser fails with [`StoreError::Conflict`]
//! - **No retries**: Redelivery is the host's decision
//! - **No scheduling**: Timeouts are deferred sends; holding them until due is
//!   the transport's job
//!
//! ## Example
//!
//! ```ignore
//! use busline::pipeline::{PipelineBuilder, TracingBehavior};
//! use busline::databus::{DataBus, DataBusReceiveBehavior, DataBusSendBehavior};
//! use busline::saga::{SagaBehavior, SagaEngine};
//! use busline::{BusConfig, Conventions, OutgoingPipeline};
//!
//! let config = BusConfig::from_env()?;
//! busline::telemetry::init_from_config(&config)?;
//!
//! let conventions = Arc::new(Conventions::default());
//! let bus = Arc::new(config.local_bus(conventions.clone()));
//! let data_bus = Arc::new(DataBus::new(config.data_bus_store(), conventions));
//! let outgoing = Arc::new(OutgoingPipeline::new(
//!     PipelineBuilder::new().with_behavior(DataBusSendBehavior::new(data_bus.clone())),
//!     bus,
//! ));
//! let engine = Arc::new(SagaEngine::new().register(ShippingSaga, shipping_store)?);
//!
//! let pipeline = PipelineBuilder::new()
//!     .with_behavior(TracingBehavior::new(&config.endpoint_name))
//!     .with_behavior(DataBusReceiveBehavior::new(data_bus))
//!     .with_behavior(SagaBehavior::new(engine).with_outgoing(outgoing))
//!     .with_handler(handlers)
//!     .build();
//!
//! pipeline.invoke(&mut ctx).await?;
//! ```

// Core modules
mod bus;
mod config;
mod conventions;
mod descriptor;
mod error;
mod message;

// Pipeline, data bus and sagas
pub mod databus;
pub mod pipeline;
pub mod saga;

// Subscriber installation
pub mod telemetry;

// Testing utilities (feature-gated)
#[cfg(any(test, feature = "testing"))]
pub mod testing;

// Re-export message types
pub use message::{headers, AnyMessage, Headers, Message, MessageKind, MessageType, OutgoingMessage};

// Re-export descriptor types
pub use descriptor::{
    DataBusProperty, DescriptorBuilder, MessageDescriptor, PropertyAccessor, PropertyDescriptor,
    PropertyInfo,
};

// Re-export convention cache
pub use conventions::Conventions;

// Re-export error types
pub use error::{kind_of, BusError, ErrorKind};

// Re-export bus types
pub use bus::{Bus, Delivery, Dispatched, LocalBus, Outbox, OutgoingPipeline};

// Re-export configuration
pub use config::BusConfig;

// Re-export persistence types
pub use saga::{Revision, StoreError};

// Re-export commonly used external types
pub use async_trait::async_trait;

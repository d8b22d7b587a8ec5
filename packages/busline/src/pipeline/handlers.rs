//! Terminal handler routing messages to application handlers by type.

use std::any::TypeId;
use std::collections::HashMap;
use std::fmt;
use std::marker::PhantomData;

use anyhow::Result;
use async_trait::async_trait;
use tracing::debug;

use super::context::MessageContext;
use super::MessageHandler;
use crate::error::BusError;
use crate::message::{Headers, Message};

/// Application code handling one message type.
///
/// # Example
///
/// ```ignore
/// struct ShipOrder { warehouse: Arc<Warehouse> }
///
/// #[async_trait]
/// impl Handles<OrderAccepted> for ShipOrder {
///     async fn handle(&self, message: &OrderAccepted, _headers: &Headers) -> Result<()> {
///         self.warehouse.ship(message.order_id).await
///     }
/// }
/// ```
#[async_trait]
pub trait Handles<M: Message>: Send + Sync + 'static {
    async fn handle(&self, message: &M, headers: &Headers) -> Result<()>;
}

#[async_trait]
trait AnyHandler: Send + Sync {
    async fn handle_any(&self, ctx: &mut MessageContext) -> Result<()>;
}

struct HandlerWrapper<M, H> {
    handler: H,
    _message: PhantomData<fn() -> M>,
}

#[async_trait]
impl<M, H> AnyHandler for HandlerWrapper<M, H>
where
    M: Message,
    H: Handles<M>,
{
    async fn handle_any(&self, ctx: &mut MessageContext) -> Result<()> {
        let Some(message) = ctx.downcast_ref::<M>() else {
            return Ok(());
        };
        self.handler.handle(message, ctx.headers()).await
    }
}

/// Routes each message to the handler registered for its type.
///
/// Messages with no registered handler pass through; they may be meant
/// for a saga earlier in the chain.
#[derive(Default)]
pub struct HandlerRegistry {
    handlers: HashMap<TypeId, Box<dyn AnyHandler>>,
}

impl HandlerRegistry {
    /// An empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register the handler of `M`, failing if one exists.
    pub fn try_with_handler<M, H>(mut self, handler: H) -> Result<Self>
    where
        M: Message,
        H: Handles<M>,
    {
        let type_id = TypeId::of::<M>();
        if self.handlers.contains_key(&type_id) {
            return Err(BusError::DuplicateRegistration {
                name: M::full_type_name(),
            }
            .into());
        }
        self.handlers.insert(
            type_id,
            Box::new(HandlerWrapper {
                handler,
                _message: PhantomData,
            }),
        );
        Ok(self)
    }

    /// Register the handler of `M`, replacing any previous one.
    pub fn with_handler<M, H>(mut self, handler: H) -> Self
    where
        M: Message,
        H: Handles<M>,
    {
        self.handlers.insert(
            TypeId::of::<M>(),
            Box::new(HandlerWrapper {
                handler,
                _message: PhantomData,
            }),
        );
        self
    }

    /// Returns true if `M` has a handler.
    pub fn handles<M: Message>(&self) -> bool {
        self.handlers.contains_key(&TypeId::of::<M>())
    }

    /// Number of registered handlers.
    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    /// Returns true if nothing is registered.
    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}

impl fmt::Debug for HandlerRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HandlerRegistry")
            .field("handlers", &self.handlers.len())
            .finish()
    }
}

#[async_trait]
impl MessageHandler<MessageContext> for HandlerRegistry {
    async fn handle(&self, ctx: &mut MessageContext) -> Result<()> {
        let message_type = ctx.message_type();
        match self.handlers.get(&message_type.id()) {
            Some(handler) => handler.handle_any(ctx).await,
            None => {
                debug!(%message_type, "no handler registered");
                Ok(())
            }
        }
    }
}

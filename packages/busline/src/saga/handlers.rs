use std::any::TypeId;
use std::collections::hash_map::Entry;
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::Arc;

use anyhow::Result;

use super::{Saga, SagaContext, SagaMapper};
use crate::error::BusError;
use crate::message::{AnyMessage, Message, MessageType};

/// Signature of a saga handler method.
pub type SagaHandlerFn<S, M> =
    fn(&S, &M, &mut SagaContext<'_, <S as Saga>::Data>) -> Result<()>;

type ErasedHandler<S> = Box<
    dyn Fn(&S, &dyn AnyMessage, &mut SagaContext<'_, <S as Saga>::Data>) -> Result<()>
        + Send
        + Sync,
>;

pub(crate) struct HandlerEntry<S: Saga> {
    pub(crate) message_type: MessageType,
    pub(crate) started_by: bool,
    invoke: ErasedHandler<S>,
}

impl<S: Saga> HandlerEntry<S> {
    fn new<M: Message>(started_by: bool, handler: SagaHandlerFn<S, M>) -> Self {
        Self {
            message_type: MessageType::of::<M>(),
            started_by,
            invoke: Box::new(
                move |saga: &S, message: &dyn AnyMessage, ctx: &mut SagaContext<'_, S::Data>| {
                    match message.downcast_ref::<M>() {
                        Some(message) => handler(saga, message, ctx),
                        None => Ok(()),
                    }
                },
            ),
        }
    }

    pub(crate) fn invoke(
        &self,
        saga: &S,
        message: &dyn AnyMessage,
        ctx: &mut SagaContext<'_, S::Data>,
    ) -> Result<()> {
        (self.invoke)(saga, message, ctx)
    }
}

/// The message and timeout handlers of a saga type.
///
/// ```ignore
/// fn configure_handlers(h: &mut SagaHandlers<Self>) {
///     h.started_by(Self::on_order_placed)
///         .handles(Self::on_order_billed)
///         .timeout(Self::on_payment_overdue);
/// }
/// ```
///
/// A message type gets at most one message handler (`started_by` or
/// `handles`) and at most one timeout handler. A second registration is kept
/// out and fails the saga type's registration with
/// [`BusError::DuplicateRegistration`].
pub struct SagaHandlers<S: Saga> {
    messages: HashMap<TypeId, HandlerEntry<S>>,
    timeouts: HashMap<TypeId, HandlerEntry<S>>,
    duplicate: Option<&'static str>,
}

impl<S: Saga> SagaHandlers<S> {
    pub(crate) fn new() -> Self {
        Self {
            messages: HashMap::new(),
            timeouts: HashMap::new(),
            duplicate: None,
        }
    }

    /// Handle `M`, creating the saga if none correlates.
    pub fn started_by<M: Message>(&mut self, handler: SagaHandlerFn<S, M>) -> &mut Self {
        self.add(false, HandlerEntry::new(true, handler))
    }

    /// Handle `M` for an existing saga.
    pub fn handles<M: Message>(&mut self, handler: SagaHandlerFn<S, M>) -> &mut Self {
        self.add(false, HandlerEntry::new(false, handler))
    }

    /// Handle `M` when it comes back as a timeout this saga requested.
    pub fn timeout<M: Message>(&mut self, handler: SagaHandlerFn<S, M>) -> &mut Self {
        self.add(true, HandlerEntry::new(false, handler))
    }

    fn add(&mut self, timeout: bool, entry: HandlerEntry<S>) -> &mut Self {
        let table = if timeout {
            &mut self.timeouts
        } else {
            &mut self.messages
        };
        match table.entry(entry.message_type.id()) {
            Entry::Vacant(slot) => {
                slot.insert(entry);
            }
            Entry::Occupied(_) => {
                self.duplicate.get_or_insert(entry.message_type.name());
            }
        }
        self
    }

    /// The first message type registered twice, if any.
    pub(crate) fn duplicate(&self) -> Option<&'static str> {
        self.duplicate
    }

    /// The handler for an inbound message.
    ///
    /// Timeouts go to the timeout handler of their type, falling back to an
    /// ordinary handler.
    pub(crate) fn entry_for(
        &self,
        message_type: &MessageType,
        is_timeout: bool,
    ) -> Option<&HandlerEntry<S>> {
        let id = message_type.id();
        if is_timeout {
            if let Some(entry) = self.timeouts.get(&id) {
                return Some(entry);
            }
        }
        self.messages.get(&id)
    }

    /// Returns true if the saga reacts to `message_type` in any way.
    pub fn handles_type(&self, message_type: &MessageType) -> bool {
        let id = message_type.id();
        self.messages.contains_key(&id) || self.timeouts.contains_key(&id)
    }

    /// Message types with a timeout handler.
    pub fn timeout_types(&self) -> impl Iterator<Item = MessageType> + '_ {
        self.timeouts.values().map(|e| e.message_type)
    }
}

impl<S: Saga> fmt::Debug for SagaHandlers<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SagaHandlers")
            .field("messages", &self.messages.len())
            .field("timeouts", &self.timeouts.len())
            .finish()
    }
}

/// Static facts about a saga type, fixed at registration.
#[derive(Clone, PartialEq, Eq)]
pub struct SagaType {
    name: &'static str,
    timeouts: Arc<HashSet<TypeId>>,
}

impl SagaType {
    /// Facts about `S`, gathered from its handler table.
    pub fn of<S: Saga>(handlers: &SagaHandlers<S>) -> Self {
        Self {
            name: S::saga_type_name(),
            timeouts: Arc::new(handlers.timeout_types().map(|t| t.id()).collect()),
        }
    }

    /// Facts about a saga type built by hand, e.g. for tests.
    pub fn new(name: &'static str, timeouts: impl IntoIterator<Item = MessageType>) -> Self {
        Self {
            name,
            timeouts: Arc::new(timeouts.into_iter().map(|t| t.id()).collect()),
        }
    }

    /// Fully qualified name, as stamped on timeouts.
    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Returns true if the saga can handle timeouts of `message_type`.
    pub fn handles_timeout(&self, message_type: &MessageType) -> bool {
        self.timeouts.contains(&message_type.id())
    }
}

impl fmt::Debug for SagaType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SagaType")
            .field("name", &self.name)
            .field("timeouts", &self.timeouts.len())
            .finish()
    }
}

impl fmt::Display for SagaType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name)
    }
}

/// Everything the engine needs about one saga type.
pub(crate) struct SagaDefinition<S: Saga> {
    pub(crate) saga_type: SagaType,
    pub(crate) mapper: SagaMapper<S::Data>,
    pub(crate) handlers: SagaHandlers<S>,
}

impl<S: Saga> SagaDefinition<S> {
    pub(crate) fn configure(saga: &S) -> Result<Self> {
        let mapper = SagaMapper::configure(saga)?;
        let mut handlers = SagaHandlers::new();
        S::configure_handlers(&mut handlers);
        if let Some(name) = handlers.duplicate() {
            return Err(BusError::DuplicateRegistration { name }.into());
        }
        Ok(Self {
            saga_type: SagaType::of(&handlers),
            mapper,
            handlers,
        })
    }
}

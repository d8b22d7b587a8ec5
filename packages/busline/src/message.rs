//! Core message traits and envelopes.
//!
//! # Overview
//!
//! Every payload that crosses the pipeline implements [`Message`]. The trait
//! carries type-level facts (its kind and fully qualified name) and an
//! optional property description used by the data bus. Type-erased access
//! goes through [`AnyMessage`], which is implemented automatically.
//!
//! Headers are plain string maps. The header names in [`headers`] are
//! wire-visible and must stay bit-exact for interop with other endpoints.

use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::fmt;
use std::hash::{Hash, Hasher};

use uuid::Uuid;

use crate::descriptor::{DescriptorBuilder, MessageDescriptor};

/// Wire-visible header names.
pub mod headers {
    /// Prefix of every data bus reference header.
    pub const DATABUS_PREFIX: &str = "NServiceBus.DataBus.";
    /// Id of the saga that requested a timeout.
    pub const SAGA_ID: &str = "NServiceBus.SagaId";
    /// `"True"` when the message is a saga timeout.
    pub const IS_SAGA_TIMEOUT_MESSAGE: &str = "NServiceBus.IsSagaTimeoutMessage";
    /// Fully qualified type name of the saga that requested a timeout.
    pub const SAGA_TYPE: &str = "NServiceBus.SagaType";
    /// Unique id of a physical message.
    pub const MESSAGE_ID: &str = "NServiceBus.MessageId";
    /// Address replies should be sent to.
    pub const REPLY_TO_ADDRESS: &str = "NServiceBus.ReplyToAddress";
    /// Id of the message this one responds to.
    pub const CORRELATION_ID: &str = "NServiceBus.CorrelationId";

    /// String form of `true` in boolean headers.
    pub const TRUE: &str = "True";
    /// String form of `false` in boolean headers.
    pub const FALSE: &str = "False";

    /// Render a boolean the way boolean headers carry it.
    pub fn bool_value(value: bool) -> &'static str {
        if value {
            TRUE
        } else {
            FALSE
        }
    }
}

/// Header key to header value. Keys are unique, order is irrelevant.
pub type Headers = HashMap<String, String>;

// =============================================================================
// Message Kind & Type
// =============================================================================

/// What a message type declares itself to be.
///
/// This is the input of the default conventions. Replacing a convention
/// predicate can classify types differently from what they declare.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum MessageKind {
    /// A plain message (e.g. a reply or a timeout).
    #[default]
    Message,
    /// Intent addressed to exactly one owner.
    Command,
    /// A fact published to any number of subscribers.
    Event,
}

/// Runtime identity of a message type.
///
/// Equality and hashing use the [`TypeId`] only.
#[derive(Clone, Copy)]
pub struct MessageType {
    id: TypeId,
    name: &'static str,
    kind: MessageKind,
}

impl MessageType {
    /// Identity of a concrete message type.
    pub fn of<M: Message>() -> Self {
        Self {
            id: TypeId::of::<M>(),
            name: M::full_type_name(),
            kind: M::KIND,
        }
    }

    /// The type id.
    pub fn id(&self) -> TypeId {
        self.id
    }

    /// The fully qualified type name.
    pub fn name(&self) -> &'static str {
        self.name
    }

    /// The declared kind.
    pub fn kind(&self) -> MessageKind {
        self.kind
    }
}

impl PartialEq for MessageType {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for MessageType {}

impl Hash for MessageType {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.id.hash(state);
    }
}

impl fmt::Debug for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MessageType")
            .field("name", &self.name)
            .field("kind", &self.kind)
            .finish()
    }
}

impl fmt::Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name)
    }
}

// =============================================================================
// Message Traits
// =============================================================================

/// An application-defined message payload.
///
/// # Example
///
/// ```ignore
/// #[derive(Debug, Default)]
/// struct SubmitClaim {
///     claim_id: String,
///     scan: DataBusProperty<Vec<u8>>,
///     notes: Option<String>,
/// }
///
/// impl Message for SubmitClaim {
///     const KIND: MessageKind = MessageKind::Command;
///
///     fn describe(d: &mut DescriptorBuilder<Self>) {
///         d.data_bus_property("scan", |m| &m.scan, |m| &mut m.scan)
///             .field("notes", |m| &m.notes, |m| &mut m.notes);
///     }
/// }
/// ```
pub trait Message: Any + Send + Sync + Sized + 'static {
    /// Declared kind of this message type.
    const KIND: MessageKind = MessageKind::Message;

    /// Fully qualified name used in headers.
    ///
    /// Defaults to the Rust type path. Override to keep a stable wire name
    /// across refactors or to interoperate with other endpoints.
    fn full_type_name() -> &'static str {
        std::any::type_name::<Self>()
    }

    /// Describe the properties of this message type.
    ///
    /// Called at most once per type per data bus; the result is cached.
    fn describe(_descriptor: &mut DescriptorBuilder<Self>) {}
}

/// Type-erased message trait.
///
/// Automatically implemented for every [`Message`].
pub trait AnyMessage: Any + Send + Sync {
    /// Runtime identity of the concrete type.
    fn message_type(&self) -> MessageType;

    /// Build the property descriptor of the concrete type.
    fn descriptor(&self) -> MessageDescriptor;

    /// Downcast support.
    fn as_any(&self) -> &dyn Any;

    /// Downcast support (mutable).
    fn as_any_mut(&mut self) -> &mut dyn Any;
}

impl<M: Message> AnyMessage for M {
    fn message_type(&self) -> MessageType {
        MessageType::of::<M>()
    }

    fn descriptor(&self) -> MessageDescriptor {
        MessageDescriptor::of::<M>()
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

impl fmt::Debug for dyn AnyMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AnyMessage")
            .field("type", &self.message_type().name())
            .finish_non_exhaustive()
    }
}

impl dyn AnyMessage {
    /// Downcast to a concrete message type.
    pub fn downcast_ref<M: Message>(&self) -> Option<&M> {
        self.as_any().downcast_ref()
    }

    /// Downcast to a concrete message type (mutable).
    pub fn downcast_mut<M: Message>(&mut self) -> Option<&mut M> {
        self.as_any_mut().downcast_mut()
    }
}

// =============================================================================
// Outgoing Message
// =============================================================================

/// A message on its way to the dispatch collaborator, with its headers.
pub struct OutgoingMessage {
    body: Box<dyn AnyMessage>,
    headers: Headers,
}

impl OutgoingMessage {
    /// Wrap a message with a fresh message id.
    pub fn new<M: Message>(message: M) -> Self {
        Self::from_boxed(Box::new(message))
    }

    /// Wrap an already-boxed message with a fresh message id.
    pub fn from_boxed(body: Box<dyn AnyMessage>) -> Self {
        let mut headers = Headers::new();
        headers.insert(headers::MESSAGE_ID.to_string(), Uuid::new_v4().to_string());
        Self { body, headers }
    }

    /// Set a header, replacing any previous value.
    pub fn set_header(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.headers.insert(key.into(), value.into());
    }

    /// Builder-style [`set_header`](Self::set_header).
    pub fn with_header(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.set_header(key, value);
        self
    }

    /// Look up a header.
    pub fn header(&self, key: &str) -> Option<&str> {
        self.headers.get(key).map(String::as_str)
    }

    /// All headers.
    pub fn headers(&self) -> &Headers {
        &self.headers
    }

    /// All headers (mutable).
    pub fn headers_mut(&mut self) -> &mut Headers {
        &mut self.headers
    }

    /// The message id stamped at construction.
    pub fn message_id(&self) -> Option<&str> {
        self.header(headers::MESSAGE_ID)
    }

    /// Runtime identity of the body.
    pub fn message_type(&self) -> MessageType {
        self.body.message_type()
    }

    /// The body.
    pub fn body(&self) -> &dyn AnyMessage {
        self.body.as_ref()
    }

    /// The body (mutable).
    pub fn body_mut(&mut self) -> &mut dyn AnyMessage {
        self.body.as_mut()
    }

    /// Downcast the body.
    pub fn downcast_ref<M: Message>(&self) -> Option<&M> {
        self.body.downcast_ref()
    }

    /// Split into body and headers, e.g. to hand to a transport.
    pub fn into_parts(self) -> (Box<dyn AnyMessage>, Headers) {
        (self.body, self.headers)
    }
}

impl fmt::Debug for OutgoingMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OutgoingMessage")
            .field("type", &self.message_type().name())
            .field("headers", &self.headers)
            .finish_non_exhaustive()
    }
}

//! Per-message state flowing through a pipeline.
//!
//! [`MessageContext`] carries an inbound message, its headers, the unit of
//! work it is processed in, and typed extensions behaviors can attach.
//! [`OutgoingContext`] is its counterpart on the send side.

use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex};

use uuid::Uuid;

use crate::bus::Delivery;
use crate::message::{headers, AnyMessage, Headers, Message, MessageType, OutgoingMessage};

// =============================================================================
// Transaction
// =============================================================================

/// Handle for the unit-of-work transaction a message is processed in.
///
/// The transaction itself belongs to the host; this crate only decides which
/// I/O may see it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Transaction {
    id: Uuid,
}

impl Transaction {
    /// A new transaction handle.
    pub fn new() -> Self {
        Self { id: Uuid::new_v4() }
    }

    /// Identity of the transaction.
    pub fn id(&self) -> Uuid {
        self.id
    }
}

impl Default for Transaction {
    fn default() -> Self {
        Self::new()
    }
}

/// Shared slot holding the current transaction of one message.
///
/// Clones observe the same slot, so a collaborator handed a clone sees
/// suppression as it happens.
#[derive(Clone, Default)]
pub struct TransactionSlot {
    inner: Arc<Mutex<Option<Transaction>>>,
}

impl TransactionSlot {
    /// The transaction I/O may enlist in right now.
    pub fn current(&self) -> Option<Transaction> {
        self.lock().clone()
    }

    fn set(&self, transaction: Option<Transaction>) -> Option<Transaction> {
        std::mem::replace(&mut *self.lock(), transaction)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Option<Transaction>> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Hide the transaction until the returned guard drops.
    pub fn suppress(&self) -> SuppressedTransaction {
        let saved = self.set(None);
        SuppressedTransaction {
            slot: self.clone(),
            saved,
        }
    }
}

impl fmt::Debug for TransactionSlot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransactionSlot")
            .field("current", &self.current())
            .finish()
    }
}

/// Scope in which no transaction is visible.
///
/// Restores the previous transaction on drop, including when the scope is
/// left through an error or a panic.
#[must_use = "the transaction is restored as soon as the guard is dropped"]
pub struct SuppressedTransaction {
    slot: TransactionSlot,
    saved: Option<Transaction>,
}

impl Drop for SuppressedTransaction {
    fn drop(&mut self) {
        self.slot.set(self.saved.take());
    }
}

// =============================================================================
// Extensions
// =============================================================================

/// Typed per-message storage for pipeline-scoped values.
#[derive(Default)]
pub struct Extensions {
    map: HashMap<TypeId, Box<dyn Any + Send + Sync>>,
}

impl Extensions {
    /// Insert a value, returning the previous one of the same type.
    pub fn insert<T: Send + Sync + 'static>(&mut self, value: T) -> Option<T> {
        self.map
            .insert(TypeId::of::<T>(), Box::new(value))
            .and_then(|old| old.downcast().ok().map(|b: Box<T>| *b))
    }

    /// Borrow a value.
    pub fn get<T: Send + Sync + 'static>(&self) -> Option<&T> {
        self.map.get(&TypeId::of::<T>())?.downcast_ref()
    }

    /// Borrow a value mutably.
    pub fn get_mut<T: Send + Sync + 'static>(&mut self) -> Option<&mut T> {
        self.map.get_mut(&TypeId::of::<T>())?.downcast_mut()
    }

    /// Remove a value.
    pub fn remove<T: Send + Sync + 'static>(&mut self) -> Option<T> {
        self.map
            .remove(&TypeId::of::<T>())
            .and_then(|old| old.downcast().ok().map(|b: Box<T>| *b))
    }

    /// Number of stored values.
    pub fn len(&self) -> usize {
        self.map.len()
    }

    /// Returns true if nothing is stored.
    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }
}

impl fmt::Debug for Extensions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Extensions")
            .field("len", &self.map.len())
            .finish()
    }
}

// =============================================================================
// Message Context
// =============================================================================

/// Ambient state of one inbound message.
pub struct MessageContext {
    message: Box<dyn AnyMessage>,
    headers: Headers,
    transaction: TransactionSlot,
    extensions: Extensions,
}

impl MessageContext {
    /// Context for a message with the given headers.
    pub fn new<M: Message>(message: M, headers: Headers) -> Self {
        Self::from_boxed(Box::new(message), headers)
    }

    /// Context for an already-boxed message.
    pub fn from_boxed(message: Box<dyn AnyMessage>, headers: Headers) -> Self {
        Self {
            message,
            headers,
            transaction: TransactionSlot::default(),
            extensions: Extensions::default(),
        }
    }

    /// Run this message inside a host transaction.
    pub fn with_transaction(self, transaction: Transaction) -> Self {
        self.transaction.set(Some(transaction));
        self
    }

    /// The message instance.
    pub fn message(&self) -> &dyn AnyMessage {
        self.message.as_ref()
    }

    /// The message instance (mutable).
    pub fn message_mut(&mut self) -> &mut dyn AnyMessage {
        self.message.as_mut()
    }

    /// Downcast the message.
    pub fn downcast_ref<M: Message>(&self) -> Option<&M> {
        self.message.downcast_ref()
    }

    /// Downcast the message (mutable).
    pub fn downcast_mut<M: Message>(&mut self) -> Option<&mut M> {
        self.message.downcast_mut()
    }

    /// Runtime identity of the message.
    pub fn message_type(&self) -> MessageType {
        self.message.message_type()
    }

    /// All headers.
    pub fn headers(&self) -> &Headers {
        &self.headers
    }

    /// All headers (mutable).
    pub fn headers_mut(&mut self) -> &mut Headers {
        &mut self.headers
    }

    /// Look up a header.
    pub fn header(&self, key: &str) -> Option<&str> {
        self.headers.get(key).map(String::as_str)
    }

    /// Id of the physical message, if the sender stamped one.
    pub fn message_id(&self) -> Option<&str> {
        self.header(headers::MESSAGE_ID)
    }

    /// Where replies to this message go, if anywhere.
    pub fn reply_to_address(&self) -> Option<&str> {
        self.header(headers::REPLY_TO_ADDRESS)
            .filter(|address| !address.is_empty())
    }

    /// Returns true if this message is a saga timeout.
    pub fn is_timeout_message(&self) -> bool {
        self.header(headers::IS_SAGA_TIMEOUT_MESSAGE)
            .is_some_and(|v| v.eq_ignore_ascii_case(headers::TRUE))
    }

    /// The transaction slot of this message.
    pub fn transaction(&self) -> &TransactionSlot {
        &self.transaction
    }

    /// Hide the unit-of-work transaction until the guard drops.
    pub fn suppress_transaction(&self) -> SuppressedTransaction {
        self.transaction.suppress()
    }

    /// Pipeline-scoped values.
    pub fn extensions(&self) -> &Extensions {
        &self.extensions
    }

    /// Pipeline-scoped values (mutable).
    pub fn extensions_mut(&mut self) -> &mut Extensions {
        &mut self.extensions
    }
}

impl fmt::Debug for MessageContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MessageContext")
            .field("message_type", &self.message_type().name())
            .field("headers", &self.headers)
            .field("transaction", &self.transaction)
            .finish_non_exhaustive()
    }
}

// =============================================================================
// Outgoing Context
// =============================================================================

/// Where an outgoing message is headed.
#[derive(Debug, Clone, PartialEq)]
pub enum Route {
    /// Point-to-point to a destination.
    Send {
        destination: String,
        correlation_id: Option<String>,
    },
    /// To every subscriber.
    Publish,
    /// Back to this endpoint later.
    Defer(Delivery),
}

/// State of one outgoing message on the send side.
#[derive(Debug)]
pub struct OutgoingContext {
    /// The message and its headers.
    pub message: OutgoingMessage,
    /// Where it goes.
    pub route: Route,
    extensions: Extensions,
}

impl OutgoingContext {
    /// Context for an outgoing message.
    pub fn new(message: OutgoingMessage, route: Route) -> Self {
        Self {
            message,
            route,
            extensions: Extensions::default(),
        }
    }

    /// Pipeline-scoped values.
    pub fn extensions(&self) -> &Extensions {
        &self.extensions
    }

    /// Pipeline-scoped values (mutable).
    pub fn extensions_mut(&mut self) -> &mut Extensions {
        &mut self.extensions
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Default)]
    struct Ping {
        n: u32,
    }
    impl Message for Ping {}

    #[test]
    fn test_suppression_hides_and_restores() {
        let tx = Transaction::new();
        let ctx = MessageContext::new(Ping::default(), Headers::new()).with_transaction(tx.clone());
        assert_eq!(ctx.transaction().current(), Some(tx.clone()));

        {
            let _scope = ctx.suppress_transaction();
            assert_eq!(ctx.transaction().current(), None);
        }
        assert_eq!(ctx.transaction().current(), Some(tx));
    }

    #[test]
    fn test_suppression_restores_on_panic() {
        let tx = Transaction::new();
        let ctx = MessageContext::new(Ping::default(), Headers::new()).with_transaction(tx.clone());
        let slot = ctx.transaction().clone();

        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            let _scope = slot.suppress();
            panic!("store blew up");
        }));
        assert!(result.is_err());
        assert_eq!(ctx.transaction().current(), Some(tx));
    }

    #[test]
    fn test_nested_suppression() {
        let tx = Transaction::new();
        let ctx = MessageContext::new(Ping::default(), Headers::new()).with_transaction(tx.clone());
        {
            let _outer = ctx.suppress_transaction();
            {
                let _inner = ctx.suppress_transaction();
                assert!(ctx.transaction().current().is_none());
            }
            assert!(ctx.transaction().current().is_none());
        }
        assert_eq!(ctx.transaction().current(), Some(tx));
    }

    #[test]
    fn test_extensions() {
        let mut ext = Extensions::default();
        assert!(ext.insert(5u32).is_none());
        assert_eq!(ext.insert(6u32), Some(5));
        *ext.get_mut::<u32>().unwrap() += 1;
        assert_eq!(ext.get::<u32>(), Some(&7));
        assert_eq!(ext.remove::<u32>(), Some(7));
        assert!(ext.is_empty());
    }

    #[test]
    fn test_header_accessors() {
        let mut h = Headers::new();
        h.insert(headers::MESSAGE_ID.into(), "m-1".into());
        h.insert(headers::REPLY_TO_ADDRESS.into(), "billing".into());
        h.insert(headers::IS_SAGA_TIMEOUT_MESSAGE.into(), "True".into());
        let mut ctx = MessageContext::new(Ping { n: 3 }, h);

        assert_eq!(ctx.message_id(), Some("m-1"));
        assert_eq!(ctx.reply_to_address(), Some("billing"));
        assert!(ctx.is_timeout_message());

        ctx.downcast_mut::<Ping>().unwrap().n = 4;
        assert_eq!(ctx.downcast_ref::<Ping>().unwrap().n, 4);
    }

    #[test]
    fn test_empty_reply_address_is_none() {
        let mut h = Headers::new();
        h.insert(headers::REPLY_TO_ADDRESS.into(), String::new());
        let ctx = MessageContext::new(Ping::default(), h);
        assert!(ctx.reply_to_address().is_none());
        assert!(!ctx.is_timeout_message());
    }
}

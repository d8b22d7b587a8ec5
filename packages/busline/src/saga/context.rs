//! What a saga handler can do while it runs.
//!
//! A [`SagaContext`] wraps the loaded saga data for the duration of one
//! handler call. Besides data access it offers the saga operations:
//! completing, requesting timeouts, and replying to the originator.
//!
//! # Timeouts
//!
//! All six `request_timeout_*` variants collapse into one primitive, which
//! checks in this order and stops at the first failure:
//!
//! 1. the instant has a known time zone (`at` variants only)
//! 2. the saga type has a timeout handler for the message type
//! 3. a bus is attached
//!
//! and then stamps the saga id, the timeout marker and the saga type on the
//! message before deferring it. A failing check never reaches the bus.

use std::fmt;
use std::time::Duration;

use anyhow::Result;
use chrono::{DateTime, Local, NaiveDateTime, Utc};
use tracing::debug;

use super::{SagaData, SagaType};
use crate::bus::{Bus, Delivery};
use crate::error::BusError;
use crate::message::{headers, Headers, Message, MessageType, OutgoingMessage};

// =============================================================================
// Timeout Instant
// =============================================================================

/// An absolute instant for a timeout, with its time zone kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeoutAt {
    /// In UTC.
    Utc(DateTime<Utc>),
    /// In the local time zone of this process.
    Local(DateTime<Local>),
    /// A wall-clock time with no zone. Always rejected.
    Unspecified(NaiveDateTime),
}

impl TimeoutAt {
    /// The instant in UTC, or an error for an unspecified kind.
    pub fn to_utc(&self) -> Result<DateTime<Utc>, BusError> {
        match self {
            TimeoutAt::Utc(at) => Ok(*at),
            TimeoutAt::Local(at) => Ok(at.with_timezone(&Utc)),
            TimeoutAt::Unspecified(_) => Err(BusError::UnspecifiedTimeKind),
        }
    }
}

impl From<DateTime<Utc>> for TimeoutAt {
    fn from(at: DateTime<Utc>) -> Self {
        TimeoutAt::Utc(at)
    }
}

impl From<DateTime<Local>> for TimeoutAt {
    fn from(at: DateTime<Local>) -> Self {
        TimeoutAt::Local(at)
    }
}

impl From<NaiveDateTime> for TimeoutAt {
    fn from(at: NaiveDateTime) -> Self {
        TimeoutAt::Unspecified(at)
    }
}

// =============================================================================
// Saga Context
// =============================================================================

/// Handle on one saga instance during a handler call.
pub struct SagaContext<'a, D> {
    data: &'a mut D,
    saga_type: &'a SagaType,
    bus: Option<&'a dyn Bus>,
    headers: Option<&'a Headers>,
}

impl<'a, D: SagaData> SagaContext<'a, D> {
    /// Context over `data` without a bus.
    pub fn new(data: &'a mut D, saga_type: &'a SagaType) -> Self {
        Self {
            data,
            saga_type,
            bus: None,
            headers: None,
        }
    }

    /// Attach the dispatch facility.
    pub fn with_bus(mut self, bus: &'a dyn Bus) -> Self {
        self.bus = Some(bus);
        self
    }

    /// Expose the headers of the message being handled.
    pub fn with_headers(mut self, headers: &'a Headers) -> Self {
        self.headers = Some(headers);
        self
    }

    /// The saga data.
    pub fn data(&self) -> &D {
        self.data
    }

    /// The saga data (mutable).
    pub fn data_mut(&mut self) -> &mut D {
        self.data
    }

    /// The saga type.
    pub fn saga_type(&self) -> &SagaType {
        self.saga_type
    }

    /// A header of the message being handled.
    pub fn header(&self, key: &str) -> Option<&str> {
        self.headers?.get(key).map(String::as_str)
    }

    /// The attached bus.
    ///
    /// Fails with [`BusError::BusNotAttached`] if none was attached.
    pub fn bus(&self) -> Result<&'a dyn Bus, BusError> {
        self.bus.ok_or(BusError::BusNotAttached)
    }

    /// Mark the saga as complete. Idempotent.
    ///
    /// The engine deletes the saga after the handler returns.
    pub fn mark_as_complete(&mut self) {
        self.data.metadata_mut().completed = true;
    }

    /// Returns true once `mark_as_complete` was called.
    pub fn is_completed(&self) -> bool {
        self.data.metadata().completed
    }

    // -------------------------------------------------------------------------
    // Timeouts
    // -------------------------------------------------------------------------

    /// Request `message` back as a timeout at `at`.
    pub fn request_timeout_at<M: Message>(&self, at: impl Into<TimeoutAt>, message: M) -> Result<()> {
        let at = at.into().to_utc()?;
        self.request_timeout(Delivery::At(at), message)
    }

    /// Request a timeout at `at`, built by `build` from `M::default()`.
    pub fn request_timeout_at_with<M, F>(&self, at: impl Into<TimeoutAt>, build: F) -> Result<()>
    where
        M: Message + Default,
        F: FnOnce(&mut M),
    {
        let at = at.into().to_utc()?;
        let mut message = M::default();
        build(&mut message);
        self.request_timeout(Delivery::At(at), message)
    }

    /// Request a default-constructed `M` as a timeout at `at`.
    pub fn request_timeout_at_default<M: Message + Default>(&self, at: impl Into<TimeoutAt>) -> Result<()> {
        let at = at.into().to_utc()?;
        self.request_timeout(Delivery::At(at), M::default())
    }

    /// Request `message` back as a timeout after `within`.
    pub fn request_timeout_within<M: Message>(&self, within: Duration, message: M) -> Result<()> {
        self.request_timeout(Delivery::Within(within), message)
    }

    /// Request a timeout after `within`, built by `build` from `M::default()`.
    pub fn request_timeout_within_with<M, F>(&self, within: Duration, build: F) -> Result<()>
    where
        M: Message + Default,
        F: FnOnce(&mut M),
    {
        let mut message = M::default();
        build(&mut message);
        self.request_timeout(Delivery::Within(within), message)
    }

    /// Request a default-constructed `M` as a timeout after `within`.
    pub fn request_timeout_within_default<M: Message + Default>(&self, within: Duration) -> Result<()> {
        self.request_timeout(Delivery::Within(within), M::default())
    }

    fn request_timeout<M: Message>(&self, delivery: Delivery, message: M) -> Result<()> {
        let message_type = MessageType::of::<M>();
        if !self.saga_type.handles_timeout(&message_type) {
            return Err(BusError::TimeoutNotHandled {
                saga_type: self.saga_type.name(),
                message_type: message_type.name(),
            }
            .into());
        }
        let bus = self.bus()?;

        let message = OutgoingMessage::new(message)
            .with_header(headers::SAGA_ID, self.data.id())
            .with_header(headers::IS_SAGA_TIMEOUT_MESSAGE, headers::bool_value(true))
            .with_header(headers::SAGA_TYPE, self.saga_type.name());

        debug!(
            saga_type = self.saga_type.name(),
            saga_id = self.data.id(),
            %message_type,
            ?delivery,
            "timeout requested"
        );
        bus.defer(delivery, message)
    }

    // -------------------------------------------------------------------------
    // Replies
    // -------------------------------------------------------------------------

    /// Send `message` to the endpoint that started the saga.
    ///
    /// Fails with [`BusError::MissingOriginator`] when the saga was started
    /// without a reply address.
    pub fn reply_to_originator<M: Message>(&self, message: M) -> Result<()> {
        let meta = self.data.metadata();
        let originator = meta
            .originator
            .as_deref()
            .filter(|o| !o.is_empty())
            .ok_or(BusError::MissingOriginator)?;
        let bus = self.bus()?;

        debug!(
            saga_type = self.saga_type.name(),
            saga_id = %meta.id,
            originator,
            "replying to originator"
        );
        bus.send(
            originator,
            meta.original_message_id.as_deref(),
            OutgoingMessage::new(message),
        )
    }

    /// Reply with an `M` built by `build` from `M::default()`.
    pub fn reply_to_originator_with<M, F>(&self, build: F) -> Result<()>
    where
        M: Message + Default,
        F: FnOnce(&mut M),
    {
        let mut message = M::default();
        build(&mut message);
        self.reply_to_originator(message)
    }
}

impl<D: fmt::Debug> fmt::Debug for SagaContext<'_, D> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SagaContext")
            .field("saga_type", &self.saga_type.name())
            .field("data", &self.data)
            .field("bus_attached", &self.bus.is_some())
            .finish()
    }
}

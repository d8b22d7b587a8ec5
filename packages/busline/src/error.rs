//! Structured error types for busline.
//!
//! `BusError` provides pattern-matchable errors instead of generic `anyhow::Error`.
//! `ErrorKind` groups them into the failure taxonomy callers act on.
//!
//! # The Propagation Rule
//!
//! > **Nothing in this crate swallows or translates a failure.**
//!
//! Behaviors, the saga engine and the data bus return `anyhow::Result`. A
//! `BusError` raised anywhere in the chain reaches the pipeline caller intact
//! and can be recovered with `downcast_ref`. Dead-lettering and redelivery are
//! the host's decision.
//!
//! # Example
//!
//! ```ignore
//! use busline::{BusError, ErrorKind};
//!
//! match pipeline.invoke(&mut ctx).await {
//!     Ok(()) => {}
//!     Err(e) => match e.downcast_ref::<BusError>().map(BusError::kind) {
//!         Some(ErrorKind::DataLoss) => dead_letter(ctx),
//!         Some(ErrorKind::Backend) => redeliver(ctx),
//!         _ => return Err(e),
//!     },
//! }
//! ```

use std::fmt;

use thiserror::Error;

use crate::saga::StoreError;

// =============================================================================
// Error Kind
// =============================================================================

/// Failure taxonomy.
///
/// Every [`BusError`] belongs to exactly one kind. Only `Backend` failures are
/// candidates for redelivery; the others signal a bug in configuration,
/// modelling, or input and will fail the same way again.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// Something was used before it was set up, or set up outside its window.
    ConfigurationOrder,
    /// A saga asked for something it is not modelled to do.
    CapabilityMismatch,
    /// Ambiguous or malformed input (e.g. a timestamp without a kind).
    InputValidity,
    /// A data bus reference points at a missing or unreadable blob.
    DataLoss,
    /// A collaborator (store, persister) failed.
    Backend,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ErrorKind::ConfigurationOrder => write!(f, "configuration_order"),
            ErrorKind::CapabilityMismatch => write!(f, "capability_mismatch"),
            ErrorKind::InputValidity => write!(f, "input_validity"),
            ErrorKind::DataLoss => write!(f, "data_loss"),
            ErrorKind::Backend => write!(f, "backend"),
        }
    }
}

// =============================================================================
// BusError
// =============================================================================

/// Errors raised by the pipeline, saga engine and data bus.
#[derive(Debug, Error)]
pub enum BusError {
    /// A correlation mapping was registered outside `configure_how_to_find_saga`.
    #[error("cannot configure mappings outside of 'configure_how_to_find_saga'")]
    MappingOutsideConfiguration,

    /// A saga touched its bus before one was attached.
    #[error("no bus instance available to the saga; attach one before handling messages")]
    BusNotAttached,

    /// A saga requested a timeout it registered no handler for.
    #[error(
        "the type '{saga_type}' cannot request timeouts for '{message_type}' because it does not handle timeouts of that type"
    )]
    TimeoutNotHandled {
        saga_type: &'static str,
        message_type: &'static str,
    },

    /// A reply was attempted for a saga that has nowhere to reply to.
    #[error("saga originator cannot be empty; perhaps the sender is a send-only endpoint")]
    MissingOriginator,

    /// A timeout was requested at a time whose zone is unknown.
    #[error("the kind of the timeout instant must be specified (UTC or local)")]
    UnspecifiedTimeKind,

    /// The data bus store has no blob for a referenced key.
    #[error("data bus blob '{key}' is missing")]
    DataBusBlobMissing { key: String },

    /// The referenced blob exists but cannot be turned back into a value.
    #[error("data bus blob '{key}' is corrupt: {reason}")]
    DataBusCorrupt { key: String, reason: String },

    /// A message type has no descriptor where one was required.
    #[error("no descriptor registered for message type '{type_name}'")]
    NoDescriptor { type_name: &'static str },

    /// Something was registered twice.
    #[error("'{name}' is already registered")]
    DuplicateRegistration { name: &'static str },

    /// An event was sent or a command was published.
    #[error("{reason} (message type '{type_name}')")]
    InvalidRouting {
        type_name: &'static str,
        reason: &'static str,
    },

    /// The saga persister failed.
    #[error(transparent)]
    Store(#[from] StoreError),
}

impl BusError {
    /// The taxonomy bucket of this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            BusError::MappingOutsideConfiguration
            | BusError::BusNotAttached
            | BusError::NoDescriptor { .. }
            | BusError::DuplicateRegistration { .. } => ErrorKind::ConfigurationOrder,
            BusError::TimeoutNotHandled { .. }
            | BusError::MissingOriginator
            | BusError::InvalidRouting { .. } => ErrorKind::CapabilityMismatch,
            BusError::UnspecifiedTimeKind => ErrorKind::InputValidity,
            BusError::DataBusBlobMissing { .. } | BusError::DataBusCorrupt { .. } => {
                ErrorKind::DataLoss
            }
            BusError::Store(_) => ErrorKind::Backend,
        }
    }

    /// Returns true if a redelivery could plausibly succeed.
    pub fn is_transient(&self) -> bool {
        match self {
            BusError::Store(StoreError::Conflict) => true,
            BusError::Store(StoreError::Backend(_)) => true,
            _ => false,
        }
    }
}

/// Classify an arbitrary pipeline failure.
///
/// Returns `None` when the error did not originate in this crate.
pub fn kind_of(error: &anyhow::Error) -> Option<ErrorKind> {
    if let Some(e) = error.downcast_ref::<BusError>() {
        return Some(e.kind());
    }
    if error.downcast_ref::<StoreError>().is_some() {
        return Some(ErrorKind::Backend);
    }
    None
}

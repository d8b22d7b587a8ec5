//! Long-running business processes correlated across messages.
//!
//! # Overview
//!
//! A saga type is a [`Saga`] implementation plus its [`SagaData`]. Each
//! instance moves through **NotStarted → Active → Completed**:
//!
//! - a message with a `started_by` handler and no correlating instance
//!   creates one
//! - a correlated message runs its handler against the loaded instance
//! - a handler calling [`SagaContext::mark_as_complete`] ends it; the engine
//!   removes the instance after the handler returns
//!
//! # Example
//!
//! ```ignore
//! struct ShippingSaga;
//!
//! impl Saga for ShippingSaga {
//!     type Data = ShippingData;
//!
//!     fn configure_how_to_find_saga(&self, mapper: &mut SagaMapper<ShippingData>) -> Result<()> {
//!         mapper
//!             .configure_mapping("order_id", |m: &OrderBilled| m.order_id)?
//!             .to_saga("order_id", |d| d.order_id);
//!         Ok(())
//!     }
//!
//!     fn configure_handlers(h: &mut SagaHandlers<Self>) {
//!         h.started_by(Self::on_order_placed)
//!             .handles(Self::on_order_billed)
//!             .timeout(Self::on_payment_overdue);
//!     }
//! }
//! ```

mod context;
mod data;
mod engine;
mod handlers;
mod mapping;
mod persistence;

pub use context::{SagaContext, TimeoutAt};
pub use data::{SagaData, SagaMetadata};
pub use engine::{SagaBehavior, SagaEngine, SagaOutcome, SagaOutcomes};
pub use handlers::{SagaHandlerFn, SagaHandlers, SagaType};
pub use mapping::{CorrelationMapping, SagaMapper, SagaProperty, ToSagaExpression};
pub use persistence::{Revision, SagaPersister, StoreError};

#[cfg(any(test, feature = "testing"))]
pub use persistence::testing;

use anyhow::Result;

/// A saga type.
///
/// The implementing value holds whatever the handlers need besides the saga
/// data (configuration, clients). Instance state lives in [`Saga::Data`].
pub trait Saga: Send + Sync + Sized + 'static {
    type Data: SagaData;

    /// Fully qualified name, stamped on the timeouts this saga requests.
    fn saga_type_name() -> &'static str {
        std::any::type_name::<Self>()
    }

    /// Register correlation mappings. Called once at registration.
    fn configure_how_to_find_saga(&self, _mapper: &mut SagaMapper<Self::Data>) -> Result<()> {
        Ok(())
    }

    /// Register message and timeout handlers. Called once at registration.
    fn configure_handlers(handlers: &mut SagaHandlers<Self>);
}

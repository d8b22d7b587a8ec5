//! The behavior pipeline.
//!
//! A pipeline is an ordered chain of [`Behavior`]s ending in a terminal
//! [`MessageHandler`]. Each behavior receives the context and a [`Next`]
//! continuation standing for "the rest of the chain".
//!
//! # Execution Order
//!
//! ```text
//! invoke(ctx)
//!  → behavior[0].invoke(ctx, next)
//!      → behavior[1].invoke(ctx, next)
//!          → ...
//!              → terminal.handle(ctx)
//! ```
//!
//! A behavior may:
//! - inspect or mutate the context before and after `next.run(ctx)`
//! - not call `next` at all, which stops the chain right there
//! - hold a guard across `next.run(ctx)`; guards drop on every exit path
//!
//! Order is fixed when the pipeline is built. Errors propagate unchanged to the
//! caller of [`Pipeline::invoke`]; nothing in the chain swallows them.
//!
//! # Example
//!
//! ```ignore
//! let pipeline = PipelineBuilder::new()
//!     .with_behavior(TracingBehavior::new("orders"))
//!     .with_behavior(DataBusReceiveBehavior::new(data_bus.clone()))
//!     .with_behavior(SagaBehavior::new(engine.clone()).with_outgoing(outgoing.clone()))
//!     .with_handler(handlers)
//!     .build();
//!
//! let mut ctx = MessageContext::new(message, headers);
//! pipeline.invoke(&mut ctx).await?;
//! ```

mod behaviors;
mod context;
mod handlers;

use std::fmt;
use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;

pub use behaviors::{FnBehavior, TracingBehavior};
pub use context::{
    Extensions, MessageContext, OutgoingContext, Route, SuppressedTransaction, Transaction,
    TransactionSlot,
};
pub use handlers::{HandlerRegistry, Handles};

// =============================================================================
// Traits
// =============================================================================

/// One stage of a pipeline.
#[async_trait]
pub trait Behavior<C: Send>: Send + Sync + 'static {
    /// Process the context, calling `next.run(ctx)` to continue the chain.
    async fn invoke(&self, ctx: &mut C, next: Next<'_, C>) -> Result<()>;

    /// Name for logs.
    fn name(&self) -> &'static str {
        std::any::type_name::<Self>()
    }
}

/// The end of a pipeline.
#[async_trait]
pub trait MessageHandler<C: Send>: Send + Sync + 'static {
    /// Handle the context after every behavior ran.
    async fn handle(&self, ctx: &mut C) -> Result<()>;
}

/// Terminal that does nothing.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopHandler;

#[async_trait]
impl<C: Send + 'static> MessageHandler<C> for NoopHandler {
    async fn handle(&self, _ctx: &mut C) -> Result<()> {
        Ok(())
    }
}

// =============================================================================
// Next
// =============================================================================

/// The remainder of a pipeline.
///
/// Consumed by [`run`](Next::run), so a behavior can continue the chain at
/// most once.
pub struct Next<'a, C> {
    behaviors: &'a [Arc<dyn Behavior<C>>],
    terminal: &'a dyn MessageHandler<C>,
}

impl<'a, C: Send + 'static> Next<'a, C> {
    /// Run the remaining behaviors and the terminal handler.
    pub async fn run(self, ctx: &mut C) -> Result<()> {
        match self.behaviors.split_first() {
            Some((behavior, rest)) => {
                let next = Next {
                    behaviors: rest,
                    terminal: self.terminal,
                };
                behavior.invoke(ctx, next).await
            }
            None => self.terminal.handle(ctx).await,
        }
    }

    /// Number of behaviors still to run.
    pub fn remaining(&self) -> usize {
        self.behaviors.len()
    }
}

impl<C> fmt::Debug for Next<'_, C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Next")
            .field("remaining", &self.behaviors.len())
            .finish_non_exhaustive()
    }
}

// =============================================================================
// Pipeline
// =============================================================================

/// An immutable chain of behaviors and a terminal handler.
pub struct Pipeline<C> {
    behaviors: Vec<Arc<dyn Behavior<C>>>,
    terminal: Arc<dyn MessageHandler<C>>,
}

impl<C: Send + 'static> Pipeline<C> {
    /// Start building a pipeline.
    pub fn builder() -> PipelineBuilder<C> {
        PipelineBuilder::new()
    }

    /// Drive a context through the whole chain.
    pub async fn invoke(&self, ctx: &mut C) -> Result<()> {
        let next = Next {
            behaviors: &self.behaviors,
            terminal: self.terminal.as_ref(),
        };
        next.run(ctx).await
    }

    /// Behavior names in execution order.
    pub fn behavior_names(&self) -> Vec<&'static str> {
        self.behaviors.iter().map(|b| b.name()).collect()
    }

    /// Number of behaviors.
    pub fn len(&self) -> usize {
        self.behaviors.len()
    }

    /// Returns true if the pipeline has no behaviors.
    pub fn is_empty(&self) -> bool {
        self.behaviors.is_empty()
    }
}

impl<C> fmt::Debug for Pipeline<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Pipeline")
            .field("behaviors", &self.behaviors.len())
            .finish_non_exhaustive()
    }
}

/// Builder for [`Pipeline`]. Behaviors run in registration order.
pub struct PipelineBuilder<C> {
    behaviors: Vec<Arc<dyn Behavior<C>>>,
    terminal: Option<Arc<dyn MessageHandler<C>>>,
}

impl<C: Send + 'static> PipelineBuilder<C> {
    /// An empty builder.
    pub fn new() -> Self {
        Self {
            behaviors: Vec::new(),
            terminal: None,
        }
    }

    /// Append a behavior.
    pub fn with_behavior<B: Behavior<C>>(mut self, behavior: B) -> Self {
        self.behaviors.push(Arc::new(behavior));
        self
    }

    /// Append a shared behavior.
    pub fn with_shared_behavior(mut self, behavior: Arc<dyn Behavior<C>>) -> Self {
        self.behaviors.push(behavior);
        self
    }

    /// Set the terminal handler. Defaults to [`NoopHandler`].
    pub fn with_handler<H: MessageHandler<C>>(mut self, handler: H) -> Self {
        self.terminal = Some(Arc::new(handler));
        self
    }

    /// Freeze the chain.
    pub fn build(self) -> Pipeline<C> {
        Pipeline {
            behaviors: self.behaviors,
            terminal: self.terminal.unwrap_or_else(|| Arc::new(NoopHandler)),
        }
    }
}

impl<C: Send + 'static> Default for PipelineBuilder<C> {
    fn default() -> Self {
        Self::new()
    }
}

//! General-purpose behaviors.

use std::fmt;
use std::marker::PhantomData;
use std::time::Instant;

use anyhow::Result;
use async_trait::async_trait;
use tracing::{debug, error, info_span, Instrument};

use super::context::{MessageContext, OutgoingContext, Route};
use super::{Behavior, Next};

// =============================================================================
// Tracing
// =============================================================================

/// Opens a span around the rest of the chain and logs how it ended.
///
/// Usually registered first so every later behavior logs inside the span.
#[derive(Debug, Clone)]
pub struct TracingBehavior {
    endpoint: String,
}

impl TracingBehavior {
    /// Behavior tagging its spans with `endpoint`.
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
        }
    }
}

fn finish(started: Instant, result: &Result<()>) {
    let elapsed_ms = started.elapsed().as_millis() as u64;
    match result {
        Ok(()) => debug!(elapsed_ms, "pipeline completed"),
        Err(e) => error!(elapsed_ms, error = %e, "pipeline failed"),
    }
}

#[async_trait]
impl Behavior<MessageContext> for TracingBehavior {
    async fn invoke(&self, ctx: &mut MessageContext, next: Next<'_, MessageContext>) -> Result<()> {
        let span = info_span!(
            "receive",
            endpoint = %self.endpoint,
            message_type = %ctx.message_type(),
            message_id = ctx.message_id().unwrap_or_default(),
        );
        let started = Instant::now();
        let result = next.run(ctx).instrument(span.clone()).await;
        span.in_scope(|| finish(started, &result));
        result
    }

    fn name(&self) -> &'static str {
        "tracing"
    }
}

#[async_trait]
impl Behavior<OutgoingContext> for TracingBehavior {
    async fn invoke(&self, ctx: &mut OutgoingContext, next: Next<'_, OutgoingContext>) -> Result<()> {
        let route = match &ctx.route {
            Route::Send { .. } => "send",
            Route::Publish => "publish",
            Route::Defer(_) => "defer",
        };
        let span = info_span!(
            "dispatch",
            endpoint = %self.endpoint,
            route,
            message_type = %ctx.message.message_type(),
            message_id = ctx.message.message_id().unwrap_or_default(),
        );
        let started = Instant::now();
        let result = next.run(ctx).instrument(span.clone()).await;
        span.in_scope(|| finish(started, &result));
        result
    }

    fn name(&self) -> &'static str {
        "tracing"
    }
}

// =============================================================================
// Closure Behavior
// =============================================================================

/// A synchronous gate built from a closure.
///
/// The closure runs before the rest of the chain. Returning `Ok(false)`
/// stops the chain; returning an error fails it.
///
/// ```ignore
/// let reject_empty = FnBehavior::new("reject-empty", |ctx: &mut MessageContext| {
///     Ok(!ctx.headers().is_empty())
/// });
/// ```
pub struct FnBehavior<F, C> {
    name: &'static str,
    gate: F,
    _context: PhantomData<fn(&mut C)>,
}

impl<F, C> FnBehavior<F, C>
where
    F: Fn(&mut C) -> Result<bool> + Send + Sync + 'static,
{
    /// Wrap a gate closure.
    pub fn new(name: &'static str, gate: F) -> Self {
        Self {
            name,
            gate,
            _context: PhantomData,
        }
    }
}

impl<F, C> fmt::Debug for FnBehavior<F, C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FnBehavior")
            .field("name", &self.name)
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl<F, C> Behavior<C> for FnBehavior<F, C>
where
    C: Send + 'static,
    F: Fn(&mut C) -> Result<bool> + Send + Sync + 'static,
{
    async fn invoke(&self, ctx: &mut C, next: Next<'_, C>) -> Result<()> {
        if (self.gate)(ctx)? {
            next.run(ctx).await
        } else {
            debug!(behavior = self.name, "chain stopped");
            Ok(())
        }
    }

    fn name(&self) -> &'static str {
        self.name
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::{Headers, Message, OutgoingMessage};
    use crate::pipeline::{MessageHandler, PipelineBuilder};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[derive(Debug)]
    struct Ping;
    impl Message for Ping {}

    struct Count(Arc<AtomicUsize>);

    #[async_trait]
    impl MessageHandler<MessageContext> for Count {
        async fn handle(&self, _ctx: &mut MessageContext) -> Result<()> {
            self.0.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_tracing_behavior_is_transparent() {
        let hits = Arc::new(AtomicUsize::new(0));
        let pipeline = PipelineBuilder::<MessageContext>::new()
            .with_behavior(TracingBehavior::new("sales"))
            .with_handler(Count(hits.clone()))
            .build();

        let mut ctx = MessageContext::new(Ping, Headers::new());
        pipeline.invoke(&mut ctx).await.unwrap();
        assert_eq!(hits.load(Ordering::SeqCst), 1);
        assert_eq!(pipeline.behavior_names(), vec!["tracing"]);
    }

    #[tokio::test]
    async fn test_tracing_behavior_passes_errors_through() {
        let pipeline = PipelineBuilder::<MessageContext>::new()
            .with_behavior(TracingBehavior::new("sales"))
            .with_behavior(FnBehavior::new("boom", |_: &mut MessageContext| {
                anyhow::bail!("boom")
            }))
            .build();

        let mut ctx = MessageContext::new(Ping, Headers::new());
        let err = pipeline.invoke(&mut ctx).await.unwrap_err();
        assert_eq!(err.to_string(), "boom");
    }

    #[tokio::test]
    async fn test_fn_behavior_gates_the_chain() {
        let hits = Arc::new(AtomicUsize::new(0));
        let pipeline = PipelineBuilder::new()
            .with_behavior(FnBehavior::new("needs-header", |ctx: &mut MessageContext| {
                Ok(ctx.header("tenant").is_some())
            }))
            .with_handler(Count(hits.clone()))
            .build();

        let mut ctx = MessageContext::new(Ping, Headers::new());
        pipeline.invoke(&mut ctx).await.unwrap();
        assert_eq!(hits.load(Ordering::SeqCst), 0);

        let mut h = Headers::new();
        h.insert("tenant".into(), "acme".into());
        let mut ctx = MessageContext::new(Ping, h);
        pipeline.invoke(&mut ctx).await.unwrap();
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_tracing_outgoing() {
        let pipeline = PipelineBuilder::<OutgoingContext>::new()
            .with_behavior(TracingBehavior::new("sales"))
            .build();
        let mut ctx = OutgoingContext::new(OutgoingMessage::new(Ping), Route::Publish);
        pipeline.invoke(&mut ctx).await.unwrap();
    }
}

use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;

use super::DataBus;
use crate::pipeline::{Behavior, MessageContext, Next, OutgoingContext};

/// Resolves data bus references before the rest of the chain runs.
#[derive(Debug, Clone)]
pub struct DataBusReceiveBehavior {
    data_bus: Arc<DataBus>,
}

impl DataBusReceiveBehavior {
    pub fn new(data_bus: Arc<DataBus>) -> Self {
        Self { data_bus }
    }
}

#[async_trait]
impl Behavior<MessageContext> for DataBusReceiveBehavior {
    async fn invoke(&self, ctx: &mut MessageContext, next: Next<'_, MessageContext>) -> Result<()> {
        self.data_bus.resolve(ctx).await?;
        ctx.extensions_mut().insert(Arc::clone(&self.data_bus));
        next.run(ctx).await
    }

    fn name(&self) -> &'static str {
        "data-bus-receive"
    }
}

/// Externalizes data bus properties before an outgoing message leaves.
#[derive(Debug, Clone)]
pub struct DataBusSendBehavior {
    data_bus: Arc<DataBus>,
}

impl DataBusSendBehavior {
    pub fn new(data_bus: Arc<DataBus>) -> Self {
        Self { data_bus }
    }
}

#[async_trait]
impl Behavior<OutgoingContext> for DataBusSendBehavior {
    async fn invoke(&self, ctx: &mut OutgoingContext, next: Next<'_, OutgoingContext>) -> Result<()> {
        self.data_bus.externalize(&mut ctx.message).await?;
        next.run(ctx).await
    }

    fn name(&self) -> &'static str {
        "data-bus-send"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::{Bus, Delivery, OutgoingPipeline};
    use crate::conventions::Conventions;
    use crate::databus::InMemoryDataBus;
    use crate::descriptor::{DataBusProperty, DescriptorBuilder};
    use crate::message::{Message, OutgoingMessage};
    use crate::pipeline::{MessageHandler, PipelineBuilder};
    use std::sync::Mutex;

    #[derive(Debug, Default)]
    struct Invoice {
        number: u32,
        pdf: DataBusProperty<String>,
    }

    impl Message for Invoice {
        fn describe(d: &mut DescriptorBuilder<Self>) {
            d.data_bus_property("pdf", |m| &m.pdf, |m| &mut m.pdf);
        }
    }

    struct Capture(Arc<Mutex<Option<String>>>);

    #[async_trait]
    impl MessageHandler<MessageContext> for Capture {
        async fn handle(&self, ctx: &mut MessageContext) -> Result<()> {
            let invoice = ctx.downcast_ref::<Invoice>().unwrap();
            *self.0.lock().unwrap() = invoice.pdf.value().cloned();
            assert!(ctx.extensions().get::<Arc<DataBus>>().is_some());
            Ok(())
        }
    }

    /// Keeps published messages so the test can receive them again.
    #[derive(Default)]
    struct Outbox(Mutex<Vec<OutgoingMessage>>);

    impl Bus for Outbox {
        fn send(&self, _: &str, _: Option<&str>, message: OutgoingMessage) -> Result<()> {
            self.0.lock().unwrap().push(message);
            Ok(())
        }

        fn publish(&self, message: OutgoingMessage) -> Result<()> {
            self.0.lock().unwrap().push(message);
            Ok(())
        }

        fn defer(&self, _: Delivery, message: OutgoingMessage) -> Result<()> {
            self.0.lock().unwrap().push(message);
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_send_then_receive_through_pipelines() {
        let data_bus = Arc::new(DataBus::new(
            Arc::new(InMemoryDataBus::new()),
            Arc::new(Conventions::default()),
        ));
        let outbox = Arc::new(Outbox::default());

        let outgoing = OutgoingPipeline::new(
            PipelineBuilder::new().with_behavior(DataBusSendBehavior::new(data_bus.clone())),
            outbox.clone(),
        );
        outgoing
            .publish(OutgoingMessage::new(Invoice {
                number: 7,
                pdf: DataBusProperty::new("%PDF-1.7 ...".into()),
            }))
            .await
            .unwrap();

        let sent = outbox.0.lock().unwrap().pop().unwrap();
        assert!(!sent.downcast_ref::<Invoice>().unwrap().pdf.has_value());

        let (body, h) = sent.into_parts();
        let mut ctx = MessageContext::from_boxed(body, h);

        let seen = Arc::new(Mutex::new(None));
        let incoming = PipelineBuilder::new()
            .with_behavior(DataBusReceiveBehavior::new(data_bus))
            .with_handler(Capture(seen.clone()))
            .build();
        incoming.invoke(&mut ctx).await.unwrap();

        assert_eq!(seen.lock().unwrap().as_deref(), Some("%PDF-1.7 ..."));
        assert_eq!(ctx.downcast_ref::<Invoice>().unwrap().number, 7);
    }
}

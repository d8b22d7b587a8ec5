//! Correlation mappings.
//!
//! A mapping ties a property of an inbound message type to a property of the
//! saga data. The persister finds the saga whose property value equals the
//! message's.
//!
//! Mappings are registered only inside
//! [`Saga::configure_how_to_find_saga`](super::Saga::configure_how_to_find_saga);
//! the mapper rejects registrations at any other time.

use std::fmt;
use std::marker::PhantomData;
use std::sync::Arc;

use anyhow::Result;
use serde::Serialize;
use serde_json::Value;

use super::{Saga, SagaData};
use crate::error::BusError;
use crate::message::{AnyMessage, Message, MessageType};

type ReadSaga<D> = Arc<dyn Fn(&D) -> Option<Value> + Send + Sync>;
type ReadMessage = Arc<dyn Fn(&dyn AnyMessage) -> Option<Value> + Send + Sync>;

fn to_value<T: Serialize>(value: &T) -> Option<Value> {
    serde_json::to_value(value).ok().filter(|v| !v.is_null())
}

/// A saga data property correlation matches on.
pub struct SagaProperty<D> {
    name: &'static str,
    read: ReadSaga<D>,
}

impl<D> SagaProperty<D> {
    /// The property name.
    pub fn name(&self) -> &'static str {
        self.name
    }

    /// The property value on `data`, or `None` when it serializes to null.
    pub fn value_of(&self, data: &D) -> Option<Value> {
        (self.read)(data)
    }

    /// Returns true if `data` holds `value` in this property.
    pub fn matches(&self, data: &D, value: &Value) -> bool {
        self.value_of(data).as_ref() == Some(value)
    }
}

impl<D> Clone for SagaProperty<D> {
    fn clone(&self) -> Self {
        Self {
            name: self.name,
            read: Arc::clone(&self.read),
        }
    }
}

impl<D> fmt::Debug for SagaProperty<D> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("SagaProperty").field(&self.name).finish()
    }
}

/// One registered correlation rule.
pub struct CorrelationMapping<D> {
    message_type: MessageType,
    message_property: &'static str,
    read_message: ReadMessage,
    saga_property: SagaProperty<D>,
}

impl<D> CorrelationMapping<D> {
    /// The inbound message type this rule applies to.
    pub fn message_type(&self) -> MessageType {
        self.message_type
    }

    /// Name of the message property.
    pub fn message_property(&self) -> &'static str {
        self.message_property
    }

    /// The saga property matched against.
    pub fn saga_property(&self) -> &SagaProperty<D> {
        &self.saga_property
    }

    /// The correlation value carried by `message`.
    ///
    /// `None` for a message of another type or a null value.
    pub fn message_value(&self, message: &dyn AnyMessage) -> Option<Value> {
        (self.read_message)(message)
    }
}

impl<D> fmt::Debug for CorrelationMapping<D> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CorrelationMapping")
            .field("message_type", &self.message_type.name())
            .field("message_property", &self.message_property)
            .field("saga_property", &self.saga_property.name)
            .finish()
    }
}

/// Collects the correlation mappings of one saga type.
pub struct SagaMapper<D> {
    configuring: bool,
    mappings: Vec<CorrelationMapping<D>>,
}

impl<D: SagaData> SagaMapper<D> {
    /// An empty mapper outside the configuration window.
    pub fn new() -> Self {
        Self {
            configuring: false,
            mappings: Vec::new(),
        }
    }

    /// Run the saga's configuration hook with the window open.
    ///
    /// The window closes again on every exit path.
    pub fn configure<S: Saga<Data = D>>(saga: &S) -> Result<Self> {
        let mut mapper = Self::new();
        mapper.configuring = true;
        let result = saga.configure_how_to_find_saga(&mut mapper);
        mapper.configuring = false;
        result?;
        Ok(mapper)
    }

    /// Returns true while `configure_how_to_find_saga` runs.
    pub fn is_configuring(&self) -> bool {
        self.configuring
    }

    /// Start a mapping from `M`'s `property`.
    ///
    /// Fails with [`BusError::MappingOutsideConfiguration`] outside the
    /// configuration window. Finish the mapping with
    /// [`ToSagaExpression::to_saga`].
    pub fn configure_mapping<M, T>(
        &mut self,
        property: &'static str,
        read: fn(&M) -> T,
    ) -> Result<ToSagaExpression<'_, D, M, T>>
    where
        M: Message,
        T: Serialize + 'static,
    {
        if !self.configuring {
            return Err(BusError::MappingOutsideConfiguration.into());
        }
        Ok(ToSagaExpression {
            mapper: self,
            property,
            read,
            _message: PhantomData,
        })
    }

    /// All mappings in registration order.
    pub fn mappings(&self) -> &[CorrelationMapping<D>] {
        &self.mappings
    }

    /// The mapping for a message type, if any.
    pub fn mapping_for(&self, message_type: &MessageType) -> Option<&CorrelationMapping<D>> {
        self.mappings
            .iter()
            .find(|m| m.message_type == *message_type)
    }
}

impl<D: SagaData> Default for SagaMapper<D> {
    fn default() -> Self {
        Self::new()
    }
}

impl<D> fmt::Debug for SagaMapper<D> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SagaMapper")
            .field("configuring", &self.configuring)
            .field("mappings", &self.mappings)
            .finish()
    }
}

/// A mapping waiting for its saga side.
#[must_use = "a mapping is only registered once `to_saga` is called"]
pub struct ToSagaExpression<'a, D, M, T> {
    mapper: &'a mut SagaMapper<D>,
    property: &'static str,
    read: fn(&M) -> T,
    _message: PhantomData<fn() -> M>,
}

impl<D, M, T> ToSagaExpression<'_, D, M, T>
where
    D: SagaData,
    M: Message,
    T: Serialize + 'static,
{
    /// Match against the saga data's `property`. Registers one mapping.
    pub fn to_saga<U>(self, property: &'static str, read: fn(&D) -> U)
    where
        U: Serialize + 'static,
    {
        let read_message = self.read;
        self.mapper.mappings.push(CorrelationMapping {
            message_type: MessageType::of::<M>(),
            message_property: self.property,
            read_message: Arc::new(move |message: &dyn AnyMessage| {
                message.downcast_ref::<M>().and_then(|m| to_value(&read_message(m)))
            }),
            saga_property: SagaProperty {
                name: property,
                read: Arc::new(move |data: &D| to_value(&read(data))),
            },
        });
    }
}

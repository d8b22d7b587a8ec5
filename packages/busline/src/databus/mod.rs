//! The data bus: large message properties travel by reference.
//!
//! # Overview
//!
//! On send, every property the data bus convention selects is serialized,
//! stored in a [`DataBusStore`] under a fresh key, and cleared from the
//! message. The key travels in a header:
//!
//! ```text
//! NServiceBus.DataBus.<headerKey> = <dataBusKey>
//! ```
//!
//! `headerKey` is the key a [`DataBusProperty`](crate::DataBusProperty)
//! carries in the message body, or `<FullTypeName>.<PropertyName>` for plain
//! fields. On receive the substitution is reversed.
//!
//! # Guarantees
//!
//! - **Missing reference is a no-op**: an absent or empty header leaves the
//!   property untouched
//! - **Missing blob is data loss**: a referenced blob that is gone or
//!   unreadable fails the message; nothing here retries
//! - **Independent I/O**: blob reads never run inside the message's
//!   transaction
//!
//! # Property Cache
//!
//! Eligible properties are computed once per message type and cached. The
//! cache remembers which data bus convention it was computed under and
//! recomputes after the convention is replaced. Racing first computations
//! may both run; each inserts a complete entry and the last one wins.

mod behavior;
mod serializer;
mod store;

use std::any::{Any, TypeId};
use std::fmt;
use std::sync::Arc;

use anyhow::Result;
use chrono::Utc;
use dashmap::DashMap;
use serde_json::Value;
use tracing::debug;
use uuid::Uuid;

pub use behavior::{DataBusReceiveBehavior, DataBusSendBehavior};
pub use serializer::{DataBusSerializer, JsonDataBusSerializer};
pub use store::{DataBusStore, FileShareDataBus, InMemoryDataBus};

use crate::conventions::Conventions;
use crate::descriptor::PropertyDescriptor;
use crate::error::BusError;
use crate::message::{headers, AnyMessage, OutgoingMessage};
use crate::pipeline::MessageContext;

/// The header carrying the reference for `header_key`.
pub fn reference_header(header_key: &str) -> String {
    format!("{}{}", headers::DATABUS_PREFIX, header_key)
}

/// A fresh, collision-resistant blob key: `YYYY-MM-DD_HH/<uuid>`.
pub fn new_data_bus_key() -> String {
    format!("{}/{}", Utc::now().format("%Y-%m-%d_%H"), Uuid::new_v4())
}

#[derive(Clone)]
struct CachedProperties {
    generation: u64,
    properties: Arc<[PropertyDescriptor]>,
}

/// Externalizes and resolves data bus properties.
pub struct DataBus {
    store: Arc<dyn DataBusStore>,
    serializer: Arc<dyn DataBusSerializer>,
    conventions: Arc<Conventions>,
    properties: DashMap<TypeId, CachedProperties>,
}

impl DataBus {
    /// A data bus over `store` using JSON for property values.
    pub fn new(store: Arc<dyn DataBusStore>, conventions: Arc<Conventions>) -> Self {
        Self {
            store,
            serializer: Arc::new(JsonDataBusSerializer),
            conventions,
            properties: DashMap::new(),
        }
    }

    /// Replace the serializer.
    pub fn with_serializer(mut self, serializer: Arc<dyn DataBusSerializer>) -> Self {
        self.serializer = serializer;
        self
    }

    /// The backing store.
    pub fn store(&self) -> &Arc<dyn DataBusStore> {
        &self.store
    }

    /// The conventions deciding which properties are externalized.
    pub fn conventions(&self) -> &Arc<Conventions> {
        &self.conventions
    }

    /// Properties of the message's type that travel over the data bus.
    pub fn properties_of(&self, message: &dyn AnyMessage) -> Arc<[PropertyDescriptor]> {
        let message_type = message.message_type();
        let generation = self.conventions.data_bus_generation();

        if let Some(cached) = self.properties.get(&message_type.id()) {
            if cached.generation == generation {
                return Arc::clone(&cached.properties);
            }
        }

        let properties: Arc<[PropertyDescriptor]> = message
            .descriptor()
            .properties()
            .iter()
            .filter(|p| self.conventions.is_data_bus_property(p.info()))
            .cloned()
            .collect();
        debug!(
            %message_type,
            count = properties.len(),
            generation,
            "data bus properties computed"
        );
        self.properties.insert(
            message_type.id(),
            CachedProperties {
                generation,
                properties: Arc::clone(&properties),
            },
        );
        properties
    }

    /// Number of message types with cached properties.
    pub fn cached_types(&self) -> usize {
        self.properties.len()
    }

    /// Move every eligible property value of an outgoing message to the
    /// store and reference it from a header.
    ///
    /// Every value is stored before the message is touched. If a serializer
    /// or store call fails, the message keeps all of its values, keys and
    /// headers; blobs already written stay orphaned in the store.
    ///
    /// Returns the number of externalized properties.
    pub async fn externalize(&self, message: &mut OutgoingMessage) -> Result<usize> {
        let properties = self.properties_of(message.body());
        let mut stored = Vec::with_capacity(properties.len());

        for property in properties.iter() {
            let Some((value, assigned_key, header_key)) =
                Self::pending(property, message.body().as_any())?
            else {
                continue;
            };

            let bytes = self.serializer.serialize(&value)?;
            let size = bytes.len();
            let data_bus_key = self.store.put(&new_data_bus_key(), bytes).await?;
            debug!(property = property.name(), %header_key, %data_bus_key, size, "property stored");
            stored.push((property, assigned_key, header_key, data_bus_key));
        }

        let externalized = stored.len();
        for (property, assigned_key, header_key, data_bus_key) in stored {
            let body = message.body_mut().as_any_mut();
            if let Some(key) = assigned_key {
                property.accessor().assign_key(body, &key)?;
            }
            property.accessor().clear_value(body)?;
            message.set_header(reference_header(&header_key), data_bus_key);
        }

        Ok(externalized)
    }

    /// The value of one property and the header key it will travel under,
    /// plus the key to assign if the property is self-aware and has none.
    fn pending(
        property: &PropertyDescriptor,
        body: &dyn Any,
    ) -> Result<Option<(Value, Option<String>, String)>> {
        let accessor = property.accessor();
        let Some(value) = accessor.read_value(body)? else {
            return Ok(None);
        };
        let assigned_key = match property.info().data_bus_aware {
            true if accessor.declared_key(body)?.is_none() => Some(Uuid::new_v4().to_string()),
            _ => None,
        };
        let header_key = match &assigned_key {
            Some(key) => key.clone(),
            None => property.header_key(body)?,
        };
        Ok(Some((value, assigned_key, header_key)))
    }

    /// Put externalized values back onto an inbound message.
    ///
    /// Runs with the message's transaction suppressed. Returns the number of
    /// resolved properties.
    pub async fn resolve(&self, ctx: &mut MessageContext) -> Result<usize> {
        let properties = self.properties_of(ctx.message());
        if properties.is_empty() {
            return Ok(0);
        }

        let _suppressed = ctx.suppress_transaction();
        let mut resolved = 0;

        for property in properties.iter() {
            let header_key = property.header_key(ctx.message().as_any())?;
            let Some(data_bus_key) = ctx
                .header(&reference_header(&header_key))
                .filter(|key| !key.is_empty())
                .map(str::to_string)
            else {
                continue;
            };

            let bytes = self.store.get(&data_bus_key).await?;
            let value = self
                .serializer
                .deserialize(&bytes)
                .map_err(|e| BusError::DataBusCorrupt {
                    key: data_bus_key.clone(),
                    reason: e.to_string(),
                })?;
            property
                .accessor()
                .write_value(ctx.message_mut().as_any_mut(), value)
                .map_err(|e| BusError::DataBusCorrupt {
                    key: data_bus_key.clone(),
                    reason: e.to_string(),
                })?;

            debug!(property = property.name(), %data_bus_key, "property resolved");
            resolved += 1;
        }

        Ok(resolved)
    }
}

impl fmt::Debug for DataBus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DataBus")
            .field("cached_types", &self.properties.len())
            .finish_non_exhaustive()
    }
}

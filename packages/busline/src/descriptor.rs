//! Per-message-type property descriptors.
//!
//! Instead of discovering properties at runtime, each message type lists the
//! properties the data bus may externalize in [`Message::describe`]. A
//! descriptor is a table of typed accessors, erased behind
//! [`PropertyAccessor`] so the data bus can work on `dyn AnyMessage`.
//!
//! Two property shapes exist:
//!
//! - **Plain fields** (`field`): any serde type. The header key is derived as
//!   `<FullTypeName>.<PropertyName>`.
//! - **Self-aware properties** (`data_bus_property`): a [`DataBusProperty<T>`]
//!   that carries its own key in the message body.
//!
//! Which described properties are actually externalized is decided by the
//! data bus property convention (see [`Conventions`](crate::Conventions)).

use std::any::Any;
use std::fmt;
use std::sync::Arc;

use anyhow::{anyhow, Result};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_json::Value;

use crate::message::{Message, MessageType};

// =============================================================================
// DataBusProperty
// =============================================================================

/// A property that knows it travels over the data bus.
///
/// Only the key is part of the serialized message body; the value travels
/// through the data bus store.
#[derive(Clone, PartialEq, Serialize, Deserialize)]
pub struct DataBusProperty<T> {
    #[serde(default)]
    key: String,
    #[serde(skip)]
    value: Option<T>,
}

impl<T> DataBusProperty<T> {
    /// A property holding a value and no key yet.
    pub fn new(value: T) -> Self {
        Self {
            key: String::new(),
            value: Some(value),
        }
    }

    /// The key under which the value is referenced. Empty until externalized.
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Set the reference key.
    pub fn set_key(&mut self, key: impl Into<String>) {
        self.key = key.into();
    }

    /// The current value, if any.
    pub fn value(&self) -> Option<&T> {
        self.value.as_ref()
    }

    /// Returns true if a value is present.
    pub fn has_value(&self) -> bool {
        self.value.is_some()
    }

    /// Replace the value.
    pub fn set_value(&mut self, value: T) {
        self.value = Some(value);
    }

    /// Remove and return the value.
    pub fn take_value(&mut self) -> Option<T> {
        self.value.take()
    }
}

impl<T> Default for DataBusProperty<T> {
    fn default() -> Self {
        Self {
            key: String::new(),
            value: None,
        }
    }
}

impl<T> fmt::Debug for DataBusProperty<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DataBusProperty")
            .field("key", &self.key)
            .field("has_value", &self.value.is_some())
            .finish()
    }
}

// =============================================================================
// Property Accessor
// =============================================================================

/// Facts about a described property, as seen by conventions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PropertyInfo {
    /// The message type owning the property.
    pub owner: MessageType,
    /// The property name.
    pub name: &'static str,
    /// True for [`DataBusProperty`] properties.
    pub data_bus_aware: bool,
}

impl PropertyInfo {
    /// `<FullTypeName>.<PropertyName>`.
    pub fn derived_key(&self) -> String {
        format!("{}.{}", self.owner.name(), self.name)
    }
}

/// Type-erased access to one property of one message type.
///
/// Implementations downcast the message and fail if handed a message of a
/// different type.
pub trait PropertyAccessor: Send + Sync {
    /// Key the property itself declares, if it is self-aware and has one.
    fn declared_key(&self, message: &dyn Any) -> Result<Option<String>>;

    /// Record the key on a self-aware property. No-op for plain fields.
    fn assign_key(&self, message: &mut dyn Any, key: &str) -> Result<()>;

    /// The current value, serialized. The message is left as is.
    ///
    /// Returns `None` when there is nothing to externalize.
    fn read_value(&self, message: &dyn Any) -> Result<Option<Value>>;

    /// Drop the current value once it is safely stored elsewhere.
    fn clear_value(&self, message: &mut dyn Any) -> Result<()>;

    /// Write a value back onto the message.
    fn write_value(&self, message: &mut dyn Any, value: Value) -> Result<()>;
}

fn wrong_type<M: Message>() -> anyhow::Error {
    anyhow!(
        "property accessor for '{}' applied to a different message type",
        M::full_type_name()
    )
}

struct FieldAccessor<M, T> {
    get: fn(&M) -> &T,
    get_mut: fn(&mut M) -> &mut T,
}

impl<M, T> PropertyAccessor for FieldAccessor<M, T>
where
    M: Message,
    T: Serialize + DeserializeOwned + Default + Send + Sync + 'static,
{
    fn declared_key(&self, message: &dyn Any) -> Result<Option<String>> {
        message.downcast_ref::<M>().ok_or_else(wrong_type::<M>)?;
        Ok(None)
    }

    fn assign_key(&self, message: &mut dyn Any, _key: &str) -> Result<()> {
        message.downcast_mut::<M>().ok_or_else(wrong_type::<M>)?;
        Ok(())
    }

    fn read_value(&self, message: &dyn Any) -> Result<Option<Value>> {
        let message = message.downcast_ref::<M>().ok_or_else(wrong_type::<M>)?;
        let value = serde_json::to_value((self.get)(message))?;
        if value.is_null() || value == serde_json::to_value(T::default())? {
            return Ok(None);
        }
        Ok(Some(value))
    }

    fn clear_value(&self, message: &mut dyn Any) -> Result<()> {
        let message = message.downcast_mut::<M>().ok_or_else(wrong_type::<M>)?;
        *(self.get_mut)(message) = T::default();
        Ok(())
    }

    fn write_value(&self, message: &mut dyn Any, value: Value) -> Result<()> {
        let message = message.downcast_mut::<M>().ok_or_else(wrong_type::<M>)?;
        *(self.get_mut)(message) = serde_json::from_value(value)?;
        Ok(())
    }
}

struct AwareAccessor<M, T> {
    get: fn(&M) -> &DataBusProperty<T>,
    get_mut: fn(&mut M) -> &mut DataBusProperty<T>,
}

impl<M, T> PropertyAccessor for AwareAccessor<M, T>
where
    M: Message,
    T: Serialize + DeserializeOwned + Send + Sync + 'static,
{
    fn declared_key(&self, message: &dyn Any) -> Result<Option<String>> {
        let message = message.downcast_ref::<M>().ok_or_else(wrong_type::<M>)?;
        let key = (self.get)(message).key();
        Ok((!key.is_empty()).then(|| key.to_string()))
    }

    fn assign_key(&self, message: &mut dyn Any, key: &str) -> Result<()> {
        let message = message.downcast_mut::<M>().ok_or_else(wrong_type::<M>)?;
        (self.get_mut)(message).set_key(key);
        Ok(())
    }

    fn read_value(&self, message: &dyn Any) -> Result<Option<Value>> {
        let message = message.downcast_ref::<M>().ok_or_else(wrong_type::<M>)?;
        match (self.get)(message).value() {
            Some(value) => Ok(Some(serde_json::to_value(value)?)),
            None => Ok(None),
        }
    }

    fn clear_value(&self, message: &mut dyn Any) -> Result<()> {
        let message = message.downcast_mut::<M>().ok_or_else(wrong_type::<M>)?;
        (self.get_mut)(message).take_value();
        Ok(())
    }

    fn write_value(&self, message: &mut dyn Any, value: Value) -> Result<()> {
        let message = message.downcast_mut::<M>().ok_or_else(wrong_type::<M>)?;
        (self.get_mut)(message).set_value(serde_json::from_value(value)?);
        Ok(())
    }
}

// =============================================================================
// Descriptors
// =============================================================================

/// One described property.
#[derive(Clone)]
pub struct PropertyDescriptor {
    info: PropertyInfo,
    accessor: Arc<dyn PropertyAccessor>,
}

impl PropertyDescriptor {
    /// Convention-facing facts.
    pub fn info(&self) -> &PropertyInfo {
        &self.info
    }

    /// The property name.
    pub fn name(&self) -> &'static str {
        self.info.name
    }

    /// Erased accessor.
    pub fn accessor(&self) -> &dyn PropertyAccessor {
        self.accessor.as_ref()
    }

    /// The header key for this property on a given message instance.
    ///
    /// Self-aware properties with a key report it; everything else uses
    /// `<FullTypeName>.<PropertyName>`.
    pub fn header_key(&self, message: &dyn Any) -> Result<String> {
        match self.accessor.declared_key(message)? {
            Some(key) => Ok(key),
            None => Ok(self.info.derived_key()),
        }
    }
}

impl fmt::Debug for PropertyDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PropertyDescriptor")
            .field("info", &self.info)
            .finish_non_exhaustive()
    }
}

/// The property table of one message type.
#[derive(Debug, Clone)]
pub struct MessageDescriptor {
    message_type: MessageType,
    properties: Vec<PropertyDescriptor>,
}

impl MessageDescriptor {
    /// Build the descriptor of `M` from [`Message::describe`].
    pub fn of<M: Message>() -> Self {
        let mut builder = DescriptorBuilder::<M>::new();
        M::describe(&mut builder);
        builder.build()
    }

    /// The described type.
    pub fn message_type(&self) -> MessageType {
        self.message_type
    }

    /// Properties in declaration order.
    pub fn properties(&self) -> &[PropertyDescriptor] {
        &self.properties
    }
}

/// Collects the properties of `M` inside [`Message::describe`].
pub struct DescriptorBuilder<M> {
    properties: Vec<PropertyDescriptor>,
    _marker: std::marker::PhantomData<fn() -> M>,
}

impl<M: Message> DescriptorBuilder<M> {
    fn new() -> Self {
        Self {
            properties: Vec::new(),
            _marker: std::marker::PhantomData,
        }
    }

    /// Describe a plain field.
    ///
    /// Values serializing like `T::default()` or to null (`None`, an empty
    /// `String` or `Vec`) count as unset and are never externalized. After
    /// externalization the field is reset to `T::default()`.
    pub fn field<T>(
        &mut self,
        name: &'static str,
        get: fn(&M) -> &T,
        get_mut: fn(&mut M) -> &mut T,
    ) -> &mut Self
    where
        T: Serialize + DeserializeOwned + Default + Send + Sync + 'static,
    {
        self.push(name, false, Arc::new(FieldAccessor { get, get_mut }))
    }

    /// Describe a self-aware [`DataBusProperty`].
    pub fn data_bus_property<T>(
        &mut self,
        name: &'static str,
        get: fn(&M) -> &DataBusProperty<T>,
        get_mut: fn(&mut M) -> &mut DataBusProperty<T>,
    ) -> &mut Self
    where
        T: Serialize + DeserializeOwned + Send + Sync + 'static,
    {
        self.push(name, true, Arc::new(AwareAccessor { get, get_mut }))
    }

    fn push(
        &mut self,
        name: &'static str,
        data_bus_aware: bool,
        accessor: Arc<dyn PropertyAccessor>,
    ) -> &mut Self {
        self.properties.push(PropertyDescriptor {
            info: PropertyInfo {
                owner: MessageType::of::<M>(),
                name,
                data_bus_aware,
            },
            accessor,
        });
        self
    }

    fn build(self) -> MessageDescriptor {
        MessageDescriptor {
            message_type: MessageType::of::<M>(),
            properties: self.properties,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::AnyMessage;

    #[derive(Debug, Default)]
    struct Upload {
        name: String,
        blob: Option<Vec<u8>>,
        scan: DataBusProperty<String>,
    }

    impl Message for Upload {
        fn full_type_name() -> &'static str {
            "Docs.Upload"
        }

        fn describe(d: &mut DescriptorBuilder<Self>) {
            d.field("blob", |m| &m.blob, |m| &mut m.blob)
                .data_bus_property("scan", |m| &m.scan, |m| &mut m.scan);
        }
    }

    #[derive(Debug, Default)]
    struct Notes {
        text: String,
        pages: Vec<u8>,
    }

    impl Message for Notes {
        fn describe(d: &mut DescriptorBuilder<Self>) {
            d.field("text", |m| &m.text, |m| &mut m.text)
                .field("pages", |m| &m.pages, |m| &mut m.pages);
        }
    }

    #[derive(Debug, Default)]
    struct Other;
    impl Message for Other {}

    #[test]
    fn test_descriptor_lists_properties_in_order() {
        let d = MessageDescriptor::of::<Upload>();
        let names: Vec<_> = d.properties().iter().map(|p| p.name()).collect();
        assert_eq!(names, vec!["blob", "scan"]);
        assert!(!d.properties()[0].info().data_bus_aware);
        assert!(d.properties()[1].info().data_bus_aware);
    }

    #[test]
    fn test_undescribed_message_has_no_properties() {
        assert!(Other.descriptor().properties().is_empty());
    }

    #[test]
    fn test_derived_header_key() {
        let d = MessageDescriptor::of::<Upload>();
        let msg = Upload::default();
        assert_eq!(d.properties()[0].header_key(&msg).unwrap(), "Docs.Upload.blob");
    }

    #[test]
    fn test_declared_key_wins_for_aware_property() {
        let d = MessageDescriptor::of::<Upload>();
        let mut msg = Upload::default();
        assert_eq!(d.properties()[1].header_key(&msg).unwrap(), "Docs.Upload.scan");

        msg.scan.set_key("abc");
        assert_eq!(d.properties()[1].header_key(&msg).unwrap(), "abc");
    }

    #[test]
    fn test_field_read_clear_and_write() {
        let d = MessageDescriptor::of::<Upload>();
        let blob = d.properties()[0].accessor();
        let mut msg = Upload {
            name: "a".into(),
            blob: Some(vec![1, 2, 3]),
            ..Default::default()
        };

        let value = blob.read_value(&msg).unwrap().unwrap();
        assert_eq!(msg.blob, Some(vec![1, 2, 3]));

        blob.clear_value(&mut msg).unwrap();
        assert!(msg.blob.is_none());

        blob.write_value(&mut msg, value).unwrap();
        assert_eq!(msg.blob, Some(vec![1, 2, 3]));
        assert_eq!(msg.name, "a");
    }

    #[test]
    fn test_null_field_is_not_read() {
        let d = MessageDescriptor::of::<Upload>();
        let msg = Upload::default();
        assert!(d.properties()[0].accessor().read_value(&msg).unwrap().is_none());
    }

    #[test]
    fn test_default_valued_fields_count_as_unset() {
        let d = MessageDescriptor::of::<Notes>();
        let mut msg = Notes::default();
        let text = d.properties()[0].accessor();
        let pages = d.properties()[1].accessor();
        assert!(text.read_value(&msg).unwrap().is_none());
        assert!(pages.read_value(&msg).unwrap().is_none());

        msg.text = "minutes".into();
        msg.pages = vec![0];
        assert_eq!(text.read_value(&msg).unwrap(), Some(serde_json::json!("minutes")));
        assert_eq!(pages.read_value(&msg).unwrap(), Some(serde_json::json!([0])));
    }

    #[test]
    fn test_aware_property_read_keeps_value() {
        let d = MessageDescriptor::of::<Upload>();
        let mut msg = Upload::default();
        let scan = d.properties()[1].accessor();
        assert!(scan.read_value(&msg).unwrap().is_none());

        msg.scan = DataBusProperty::new("page".to_string());
        assert_eq!(scan.read_value(&msg).unwrap(), Some(serde_json::json!("page")));
        assert!(msg.scan.has_value());

        scan.clear_value(&mut msg).unwrap();
        assert!(!msg.scan.has_value());
    }

    #[test]
    fn test_accessor_rejects_other_message_type() {
        let d = MessageDescriptor::of::<Upload>();
        let mut other = Other;
        assert!(d.properties()[0].accessor().read_value(&other).is_err());
        assert!(d.properties()[0].accessor().clear_value(&mut other).is_err());
    }

    #[test]
    fn test_data_bus_property_body_carries_key_only() {
        let mut prop = DataBusProperty::new("large".to_string());
        prop.set_key("k1");
        let json = serde_json::to_value(&prop).unwrap();
        assert_eq!(json, serde_json::json!({ "key": "k1" }));

        let back: DataBusProperty<String> = serde_json::from_value(json).unwrap();
        assert_eq!(back.key(), "k1");
        assert!(!back.has_value());
    }
}

use serde::{de::DeserializeOwned, Deserialize, Serialize};

/// Bookkeeping every saga entity carries next to its business fields.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SagaMetadata {
    /// Unique id of the saga instance.
    pub id: String,
    /// Reply address of the endpoint that started the saga.
    #[serde(default)]
    pub originator: Option<String>,
    /// Id of the message that started the saga.
    #[serde(default)]
    pub original_message_id: Option<String>,
    /// Set by `mark_as_complete`.
    #[serde(default)]
    pub completed: bool,
}

/// Persisted state of one saga instance.
///
/// # Example
///
/// ```ignore
/// #[derive(Debug, Clone, Default, Serialize, Deserialize)]
/// struct ShippingData {
///     meta: SagaMetadata,
///     order_id: u32,
///     paid: bool,
/// }
///
/// impl SagaData for ShippingData {
///     fn metadata(&self) -> &SagaMetadata { &self.meta }
///     fn metadata_mut(&mut self) -> &mut SagaMetadata { &mut self.meta }
/// }
/// ```
pub trait SagaData: Clone + Default + Serialize + DeserializeOwned + Send + Sync + 'static {
    fn metadata(&self) -> &SagaMetadata;

    fn metadata_mut(&mut self) -> &mut SagaMetadata;

    /// Shorthand for `metadata().id`.
    fn id(&self) -> &str {
        &self.metadata().id
    }
}

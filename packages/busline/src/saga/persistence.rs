//! Persistence for saga instances.
//!
//! # The Contract
//!
//! 1. **Load before handle.** For every message routed to a saga type, the
//!    engine loads the instance by saga id or by correlation value, or creates
//!    a new one when the message starts the saga.
//!
//! 2. **Handle is synchronous.** Handlers mutate the loaded data through a
//!    [`SagaContext`](super::SagaContext); they never see the persister.
//!
//! 3. **Save or complete after handle.** A completed saga is removed, any
//!    other instance is saved with its expected revision.
//!
//! # What This Guarantees
//!
//! - **Optimistic concurrency.** Two handlers racing on one instance cannot
//!   both win; the loser gets [`StoreError::Conflict`] and the message can be
//!   retried against fresh state.
//!
//! # What This Does NOT Guarantee
//!
//! - No atomicity between the save and the messages a handler dispatched.

use async_trait::async_trait;
use serde_json::Value;

use super::{SagaData, SagaProperty};

// =============================================================================
// Store Error
// =============================================================================

/// Errors from saga storage.
///
/// - [`StoreError::Conflict`] means another writer modified the instance.
///   The message should be reprocessed with fresh state.
/// - [`StoreError::Backend`] means storage failed (timeout, connection, etc).
#[derive(Debug)]
pub enum StoreError {
    /// Another writer modified the saga since we loaded it.
    Conflict,

    /// Storage backend failed (timeout, connection, serialization).
    Backend(anyhow::Error),
}

impl std::fmt::Display for StoreError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StoreError::Conflict => write!(f, "revision conflict: saga was modified concurrently"),
            StoreError::Backend(e) => write!(f, "saga storage error: {}", e),
        }
    }
}

impl std::error::Error for StoreError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            StoreError::Conflict => None,
            StoreError::Backend(e) => Some(e.as_ref()),
        }
    }
}

impl From<anyhow::Error> for StoreError {
    fn from(err: anyhow::Error) -> Self {
        StoreError::Backend(err)
    }
}

// =============================================================================
// Revision
// =============================================================================

/// Revision for optimistic concurrency control.
///
/// [`Revision::NONE`] marks an instance that was never saved.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Revision(pub u64);

impl Revision {
    /// Sentinel value for a saga that has never been saved.
    pub const NONE: Revision = Revision(0);

    pub fn new(value: u64) -> Self {
        Revision(value)
    }

    /// The revision after a successful save.
    pub fn next(self) -> Self {
        Revision(self.0.saturating_add(1))
    }

    pub fn is_none(&self) -> bool {
        self.0 == 0
    }

    pub fn value(&self) -> u64 {
        self.0
    }
}

impl std::fmt::Display for Revision {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.is_none() {
            write!(f, "NONE")
        } else {
            write!(f, "r{}", self.0)
        }
    }
}

// =============================================================================
// Saga Persister
// =============================================================================

/// Stores saga data of one type.
///
/// # Concurrency
///
/// `save` and `complete` take the revision the caller loaded. A mismatch
/// with the stored revision fails with [`StoreError::Conflict`].
#[async_trait]
pub trait SagaPersister<D: SagaData>: Send + Sync + 'static {
    /// Load an instance by saga id.
    async fn find_by_id(&self, id: &str) -> Result<Option<(D, Revision)>, StoreError>;

    /// Load the instance whose `property` holds `value`.
    async fn find_by_correlation(
        &self,
        property: &SagaProperty<D>,
        value: &Value,
    ) -> Result<Option<(D, Revision)>, StoreError>;

    /// Insert or update an instance. Use [`Revision::NONE`] for new ones.
    async fn save(&self, data: &D, expected: Revision) -> Result<Revision, StoreError>;

    /// Remove a completed instance.
    async fn complete(&self, data: &D, expected: Revision) -> Result<(), StoreError>;
}

// =============================================================================
// In-Memory Persister (for testing)
// =============================================================================

/// In-memory saga persister for testing.
#[cfg(any(test, feature = "testing"))]
pub mod testing {
    use super::*;
    use std::collections::HashMap;
    use std::sync::Mutex;

    /// In-memory persister backed by a HashMap keyed by saga id.
    pub struct InMemorySagaPersister<D> {
        data: Mutex<HashMap<String, (D, Revision)>>,
    }

    impl<D: SagaData> InMemorySagaPersister<D> {
        pub fn new() -> Self {
            Self {
                data: Mutex::new(HashMap::new()),
            }
        }

        /// Seed an instance at revision 1, e.g. to test updates.
        pub fn insert(&self, data: D) {
            self.data
                .lock()
                .unwrap()
                .insert(data.id().to_string(), (data, Revision::new(1)));
        }

        /// The stored instance and its revision.
        pub fn get(&self, id: &str) -> Option<(D, Revision)> {
            self.data.lock().unwrap().get(id).cloned()
        }

        pub fn len(&self) -> usize {
            self.data.lock().unwrap().len()
        }

        pub fn is_empty(&self) -> bool {
            self.len() == 0
        }

        fn lock(
            &self,
        ) -> Result<std::sync::MutexGuard<'_, HashMap<String, (D, Revision)>>, StoreError> {
            self.data
                .lock()
                .map_err(|e| StoreError::Backend(anyhow::anyhow!("mutex poisoned: {}", e)))
        }
    }

    impl<D: SagaData> Default for InMemorySagaPersister<D> {
        fn default() -> Self {
            Self::new()
        }
    }

    #[async_trait]
    impl<D: SagaData> SagaPersister<D> for InMemorySagaPersister<D> {
        async fn find_by_id(&self, id: &str) -> Result<Option<(D, Revision)>, StoreError> {
            Ok(self.lock()?.get(id).cloned())
        }

        async fn find_by_correlation(
            &self,
            property: &SagaProperty<D>,
            value: &Value,
        ) -> Result<Option<(D, Revision)>, StoreError> {
            Ok(self
                .lock()?
                .values()
                .find(|(data, _)| property.matches(data, value))
                .cloned())
        }

        async fn save(&self, data: &D, expected: Revision) -> Result<Revision, StoreError> {
            let mut map = self.lock()?;
            let current = map
                .get(data.id())
                .map(|(_, r)| *r)
                .unwrap_or(Revision::NONE);
            if current != expected {
                return Err(StoreError::Conflict);
            }

            let next = expected.next();
            map.insert(data.id().to_string(), (data.clone(), next));
            Ok(next)
        }

        async fn complete(&self, data: &D, expected: Revision) -> Result<(), StoreError> {
            let mut map = self.lock()?;
            match map.get(data.id()) {
                Some((_, current)) if *current == expected => {
                    map.remove(data.id());
                    Ok(())
                }
                Some(_) => Err(StoreError::Conflict),
                // Already gone; completing twice is harmless.
                None => Ok(()),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::testing::InMemorySagaPersister;
    use super::*;
    use crate::saga::{Saga, SagaHandlers, SagaMapper, SagaMetadata};
    use crate::message::{Message, MessageType};
    use serde::{Deserialize, Serialize};

    #[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
    struct TripData {
        meta: SagaMetadata,
        booking: String,
    }

    impl SagaData for TripData {
        fn metadata(&self) -> &SagaMetadata {
            &self.meta
        }
        fn metadata_mut(&mut self) -> &mut SagaMetadata {
            &mut self.meta
        }
    }

    #[derive(Debug)]
    struct FlightBooked {
        booking: String,
    }
    impl Message for FlightBooked {}

    struct TripSaga;

    impl Saga for TripSaga {
        type Data = TripData;

        fn configure_how_to_find_saga(&self, mapper: &mut SagaMapper<TripData>) -> anyhow::Result<()> {
            mapper
                .configure_mapping("booking", |m: &FlightBooked| m.booking.clone())?
                .to_saga("booking", |d| d.booking.clone());
            Ok(())
        }

        fn configure_handlers(_handlers: &mut SagaHandlers<Self>) {}
    }

    fn trip(id: &str, booking: &str) -> TripData {
        TripData {
            meta: SagaMetadata {
                id: id.into(),
                ..Default::default()
            },
            booking: booking.into(),
        }
    }

    #[test]
    fn test_revision_none() {
        assert!(Revision::NONE.is_none());
        assert_eq!(Revision::NONE.next(), Revision::new(1));
        assert_eq!(Revision(u64::MAX).next(), Revision(u64::MAX));
    }

    #[test]
    fn test_revision_display() {
        assert_eq!(format!("{}", Revision::NONE), "NONE");
        assert_eq!(format!("{}", Revision::new(5)), "r5");
    }

    #[test]
    fn test_store_error_display() {
        assert!(StoreError::Conflict.to_string().contains("conflict"));
        let backend = StoreError::Backend(anyhow::anyhow!("connection failed"));
        assert!(backend.to_string().contains("connection failed"));
    }

    #[tokio::test]
    async fn test_save_then_find_by_id() {
        let persister = InMemorySagaPersister::new();
        let data = trip("T1", "LH-400");

        let rev = persister.save(&data, Revision::NONE).await.unwrap();
        assert_eq!(rev, Revision::new(1));

        let (loaded, loaded_rev) = persister.find_by_id("T1").await.unwrap().unwrap();
        assert_eq!(loaded, data);
        assert_eq!(loaded_rev, rev);
        assert!(persister.find_by_id("T2").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_stale_revision_conflicts() {
        let persister = InMemorySagaPersister::new();
        let data = trip("T1", "LH-400");
        persister.save(&data, Revision::NONE).await.unwrap();

        let result = persister.save(&data, Revision::NONE).await;
        assert!(matches!(result, Err(StoreError::Conflict)));
        let result = persister.complete(&data, Revision::new(7)).await;
        assert!(matches!(result, Err(StoreError::Conflict)));
        assert_eq!(persister.len(), 1);
    }

    #[tokio::test]
    async fn test_find_by_correlation_uses_mapping() {
        let persister = InMemorySagaPersister::new();
        persister.insert(trip("T1", "LH-400"));
        persister.insert(trip("T2", "BA-117"));

        let mapper = SagaMapper::configure(&TripSaga).unwrap();
        let mapping = mapper.mapping_for(&MessageType::of::<FlightBooked>()).unwrap();
        let value = mapping
            .message_value(&FlightBooked {
                booking: "BA-117".into(),
            })
            .unwrap();

        let (found, rev) = persister
            .find_by_correlation(mapping.saga_property(), &value)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(found.id(), "T2");
        assert_eq!(rev, Revision::new(1));
    }

    #[tokio::test]
    async fn test_complete_removes_instance() {
        let persister = InMemorySagaPersister::new();
        let data = trip("T1", "LH-400");
        let rev = persister.save(&data, Revision::NONE).await.unwrap();

        persister.complete(&data, rev).await.unwrap();
        assert!(persister.is_empty());
        persister.complete(&data, rev).await.unwrap();
    }
}

//! Memoized message conventions.
//!
//! A convention is a replaceable predicate answering one type-level question:
//! is this a message, a command, an event, or a data bus property? Answers are
//! cached per type so the predicate runs once per type.
//!
//! # Replacement
//!
//! Each convention lives in a slot holding the predicate *and* its cache
//! behind one `Arc`. Replacing the predicate swaps in a fresh slot state, so
//! a reader sees either the old predicate with the old answers or the new
//! predicate with an empty cache, never a mix. A classification racing with a
//! replacement may still write its answer into the retired cache; nobody reads
//! that cache again.
//!
//! # Example
//!
//! ```ignore
//! let conventions = Conventions::default();
//!
//! // Treat every type whose name ends in "Command" as a command.
//! conventions.define_command_convention(|t| t.name().ends_with("Command"));
//!
//! assert!(conventions.is_command(&MessageType::of::<CancelOrderCommand>()));
//! ```

use std::any::TypeId;
use std::fmt;
use std::hash::Hash;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tracing::debug;

use crate::descriptor::PropertyInfo;
use crate::message::{AnyMessage, MessageKind, MessageType};

// =============================================================================
// Convention Slot
// =============================================================================

struct SlotState<K, I: ?Sized> {
    predicate: Arc<dyn Fn(&I) -> bool + Send + Sync>,
    cache: DashMap<K, bool>,
    generation: u64,
}

/// One cached convention.
struct ConventionSlot<K, I: ?Sized> {
    name: &'static str,
    state: RwLock<Arc<SlotState<K, I>>>,
    generations: AtomicU64,
}

impl<K, I> ConventionSlot<K, I>
where
    K: Eq + Hash + fmt::Debug,
    I: ?Sized,
{
    fn new(name: &'static str, predicate: Arc<dyn Fn(&I) -> bool + Send + Sync>) -> Self {
        Self {
            name,
            state: RwLock::new(Arc::new(SlotState {
                predicate,
                cache: DashMap::new(),
                generation: 0,
            })),
            generations: AtomicU64::new(0),
        }
    }

    fn current(&self) -> Arc<SlotState<K, I>> {
        let guard = self.state.read().unwrap_or_else(|e| e.into_inner());
        Arc::clone(&guard)
    }

    fn classify(&self, key: K, input: &I) -> bool {
        let state = self.current();
        if let Some(hit) = state.cache.get(&key) {
            return *hit;
        }

        // The shard stays locked while the predicate runs, so racing first
        // lookups of one key evaluate it once.
        let answer = match state.cache.entry(key) {
            Entry::Occupied(hit) => *hit.get(),
            Entry::Vacant(slot) => {
                let answer = (state.predicate)(input);
                debug!(convention = self.name, key = ?slot.key(), answer, "convention evaluated");
                slot.insert(answer);
                answer
            }
        };
        answer
    }

    fn replace(&self, predicate: Arc<dyn Fn(&I) -> bool + Send + Sync>) {
        let generation = self.generations.fetch_add(1, Ordering::AcqRel) + 1;
        let fresh = Arc::new(SlotState {
            predicate,
            cache: DashMap::new(),
            generation,
        });
        let mut guard = self.state.write().unwrap_or_else(|e| e.into_inner());
        *guard = fresh;
    }

    fn generation(&self) -> u64 {
        self.current().generation
    }

    fn cached(&self) -> usize {
        self.current().cache.len()
    }
}

// =============================================================================
// Conventions
// =============================================================================

/// The convention cache.
///
/// Shared across all in-flight messages; cheap to query concurrently.
pub struct Conventions {
    message: ConventionSlot<TypeId, MessageType>,
    command: ConventionSlot<TypeId, MessageType>,
    event: ConventionSlot<TypeId, MessageType>,
    data_bus_property: ConventionSlot<(TypeId, &'static str), PropertyInfo>,
}

impl Conventions {
    /// Conventions driven by what types declare about themselves.
    ///
    /// - every [`Message`](crate::Message) is a message
    /// - commands and events are what their `KIND` says
    /// - only [`DataBusProperty`](crate::DataBusProperty) properties are externalized
    pub fn new() -> Self {
        Self {
            message: ConventionSlot::new("is_message", Arc::new(|_: &MessageType| true)),
            command: ConventionSlot::new(
                "is_command",
                Arc::new(|t: &MessageType| t.kind() == MessageKind::Command),
            ),
            event: ConventionSlot::new(
                "is_event",
                Arc::new(|t: &MessageType| t.kind() == MessageKind::Event),
            ),
            data_bus_property: ConventionSlot::new(
                "is_data_bus_property",
                Arc::new(|p: &PropertyInfo| p.data_bus_aware),
            ),
        }
    }

    /// Is this type a message?
    pub fn is_message(&self, message_type: &MessageType) -> bool {
        self.message.classify(message_type.id(), message_type)
    }

    /// Is this type a command?
    pub fn is_command(&self, message_type: &MessageType) -> bool {
        self.command.classify(message_type.id(), message_type)
    }

    /// Is this type an event?
    pub fn is_event(&self, message_type: &MessageType) -> bool {
        self.event.classify(message_type.id(), message_type)
    }

    /// Should this property travel over the data bus?
    pub fn is_data_bus_property(&self, property: &PropertyInfo) -> bool {
        self.data_bus_property
            .classify((property.owner.id(), property.name), property)
    }

    /// [`is_message`](Self::is_message) for an instance.
    pub fn is_message_instance(&self, message: &dyn AnyMessage) -> bool {
        self.is_message(&message.message_type())
    }

    /// Replace the message predicate and forget its cached answers.
    pub fn define_message_convention<F>(&self, predicate: F)
    where
        F: Fn(&MessageType) -> bool + Send + Sync + 'static,
    {
        self.message.replace(Arc::new(predicate));
    }

    /// Replace the command predicate and forget its cached answers.
    pub fn define_command_convention<F>(&self, predicate: F)
    where
        F: Fn(&MessageType) -> bool + Send + Sync + 'static,
    {
        self.command.replace(Arc::new(predicate));
    }

    /// Replace the event predicate and forget its cached answers.
    pub fn define_event_convention<F>(&self, predicate: F)
    where
        F: Fn(&MessageType) -> bool + Send + Sync + 'static,
    {
        self.event.replace(Arc::new(predicate));
    }

    /// Replace the data bus property predicate and forget its cached answers.
    pub fn define_data_bus_property_convention<F>(&self, predicate: F)
    where
        F: Fn(&PropertyInfo) -> bool + Send + Sync + 'static,
    {
        self.data_bus_property.replace(Arc::new(predicate));
    }

    /// Bumped on every data bus predicate replacement.
    ///
    /// Caches derived from the data bus convention compare against this to
    /// know when to recompute.
    pub fn data_bus_generation(&self) -> u64 {
        self.data_bus_property.generation()
    }

    /// Number of types with a cached answer, per convention
    /// (message, command, event, data bus property).
    pub fn cached_counts(&self) -> (usize, usize, usize, usize) {
        (
            self.message.cached(),
            self.command.cached(),
            self.event.cached(),
            self.data_bus_property.cached(),
        )
    }
}

impl Default for Conventions {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for Conventions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Conventions")
            .field("cached", &self.cached_counts())
            .finish_non_exhaustive()
    }
}

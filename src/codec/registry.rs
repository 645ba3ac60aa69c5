// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Descriptor registry.
//!
//! Maps descriptor codes (and their symbolic names) to the constructor that
//! turns a described body into a typed [`Record`]. Registration is
//! idempotent: several components may register the same descriptor during
//! startup, the first one wins and every later attempt is a logged no-op.

use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::sync::{PoisonError, RwLock};

use tracing::debug;

use super::{AmqpValue, CodecError, Descriptor, Record};

/// Builds a typed record from a described value's body.
pub type RecordConstructor = fn(AmqpValue) -> Result<Record, CodecError>;

/// Outcome of [`DescriptorRegistry::register`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Registration {
    /// The descriptor was added.
    Registered,
    /// The code was already registered; the existing entry is kept.
    AlreadyPresent,
}

#[derive(Debug, Clone, Copy)]
struct RegisteredDescriptor {
    descriptor: Descriptor,
    construct: RecordConstructor,
}

/// Shared descriptor table, first writer wins.
#[derive(Debug, Default)]
pub struct DescriptorRegistry {
    entries: RwLock<HashMap<u64, RegisteredDescriptor>>,
}

impl DescriptorRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a registry with the AMQP 1.0 `properties` and
    /// `application-properties` sections registered.
    pub fn with_standard_descriptors() -> Self {
        let registry = Self::new();
        registry.register_standard();
        registry
    }

    /// Register the standard message sections. Safe to call repeatedly.
    pub fn register_standard(&self) {
        self.register(Descriptor::PROPERTIES, super::records::properties_from_body);
        self.register(
            Descriptor::APPLICATION_PROPERTIES,
            super::records::application_properties_from_body,
        );
    }

    /// Register a descriptor.
    ///
    /// Registering a code that is already present never fails and never
    /// replaces the existing constructor.
    pub fn register(&self, descriptor: Descriptor, construct: RecordConstructor) -> Registration {
        let mut entries = self.entries.write().unwrap_or_else(PoisonError::into_inner);
        match entries.entry(descriptor.code) {
            Entry::Occupied(existing) => {
                debug!(
                    code = descriptor.code,
                    name = descriptor.name,
                    existing = existing.get().descriptor.name,
                    "Descriptor already registered"
                );
                Registration::AlreadyPresent
            }
            Entry::Vacant(slot) => {
                slot.insert(RegisteredDescriptor {
                    descriptor,
                    construct,
                });
                debug!(code = descriptor.code, name = descriptor.name, "Descriptor registered");
                Registration::Registered
            }
        }
    }

    /// Whether a descriptor code is registered.
    pub fn contains(&self, code: u64) -> bool {
        self.entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(&code)
    }

    /// Number of registered descriptors.
    pub fn len(&self) -> usize {
        self.entries.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub(crate) fn resolve_code(&self, code: u64) -> Option<(Descriptor, RecordConstructor)> {
        self.entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&code)
            .map(|entry| (entry.descriptor, entry.construct))
    }

    pub(crate) fn resolve_name(&self, name: &str) -> Option<(Descriptor, RecordConstructor)> {
        self.entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .find(|entry| entry.descriptor.name == name)
            .map(|entry| (entry.descriptor, entry.construct))
    }
}

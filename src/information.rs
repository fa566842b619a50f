//! Information objects gathered from one or many processes.
//!
//! An [`Information`] copies state out of a local object, serializes itself
//! to travel between processes and merges with copies gathered elsewhere.
//! The receiving side needs an empty instance to decode into; the
//! [`InformationRegistry`] maps type tags to constructors for that.

use crate::codec;
use crate::error::Error;
use crate::interpreter::{ProcessModule, RemoteObject};
use bincode::{Decode, Encode};
use downcast_rs::{impl_downcast, Downcast};
use std::collections::{BTreeSet, HashMap};
use std::fmt::Debug;
use tracing::debug;

/// Polymorphic value gathered from objects across processes.
pub trait Information: Debug + Downcast {
    /// Tag the type is registered under in an [`InformationRegistry`].
    fn type_tag(&self) -> &str;

    /// Whether only the root process has to be asked.
    fn root_only(&self) -> bool {
        false
    }

    /// Copies state from the local object.
    fn copy_from_object(&mut self, object: &dyn RemoteObject);

    fn copy_to_stream(&self) -> Result<Vec<u8>, Error>;

    fn copy_from_stream(&mut self, data: &[u8]) -> Result<(), Error>;

    /// Merges information gathered on another process into this one.
    fn add_information(&mut self, other: &dyn Information);
}

impl_downcast!(Information);

/// Constructor stored in an [`InformationRegistry`].
pub type InformationConstructor = fn() -> Box<dyn Information>;

/// Maps type tags to [`Information`] constructors.
#[derive(Clone)]
pub struct InformationRegistry {
    constructors: HashMap<String, InformationConstructor>,
}

/// Registers a `Default`-constructible [`Information`] type under its type
/// name, which must be what its `type_tag()` returns.
#[macro_export]
macro_rules! register_information {
    ($registry:expr, $type:ty) => {
        $registry.register(stringify!($type), || {
            Box::new(<$type>::default()) as Box<dyn $crate::Information>
        })
    };
}

impl Default for InformationRegistry {
    /// A registry holding the built-in information types.
    fn default() -> Self {
        let mut registry = Self::empty();
        register_information!(registry, PartitionInformation);
        register_information!(registry, ProcessModuleInformation);
        registry
    }
}

impl InformationRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// A registry without the built-in types.
    pub fn empty() -> Self {
        Self {
            constructors: HashMap::new(),
        }
    }

    pub fn register(&mut self, tag: &str, constructor: InformationConstructor) -> &mut Self {
        debug!(tag, "Registering information type");
        self.constructors.insert(tag.to_string(), constructor);
        self
    }

    pub fn create(&self, tag: &str) -> Result<Box<dyn Information>, Error> {
        let constructor = self
            .constructors
            .get(tag)
            .ok_or_else(|| Error::UnknownInformation(tag.to_string()))?;
        Ok(constructor())
    }
}

impl Debug for InformationRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_set().entries(self.constructors.keys()).finish()
    }
}

// ============================================================================
// PartitionInformation
// ============================================================================

/// The set of partitions that contributed. Gathered from the process-module
/// object; any other object contributes nothing.
#[derive(Debug, Clone, Default, PartialEq, Encode, Decode)]
pub struct PartitionInformation {
    pub partitions: BTreeSet<i32>,
}

impl Information for PartitionInformation {
    fn type_tag(&self) -> &str {
        "PartitionInformation"
    }

    fn copy_from_object(&mut self, object: &dyn RemoteObject) {
        if let Some(pm) = object.downcast_ref::<ProcessModule>() {
            self.partitions.insert(pm.partition_id);
        }
    }

    fn copy_to_stream(&self) -> Result<Vec<u8>, Error> {
        codec::encode(self)
    }

    fn copy_from_stream(&mut self, data: &[u8]) -> Result<(), Error> {
        *self = codec::decode(data)?;
        Ok(())
    }

    fn add_information(&mut self, other: &dyn Information) {
        if let Some(other) = other.downcast_ref::<Self>() {
            self.partitions.extend(other.partitions.iter().copied());
        }
    }
}

// ============================================================================
// ProcessModuleInformation
// ============================================================================

/// Size of the serving process group. Root only.
#[derive(Debug, Clone, Default, PartialEq, Encode, Decode)]
pub struct ProcessModuleInformation {
    pub number_of_partitions: i32,
}

impl Information for ProcessModuleInformation {
    fn type_tag(&self) -> &str {
        "ProcessModuleInformation"
    }

    fn root_only(&self) -> bool {
        true
    }

    fn copy_from_object(&mut self, object: &dyn RemoteObject) {
        if let Some(pm) = object.downcast_ref::<ProcessModule>() {
            self.number_of_partitions = pm.number_of_partitions;
        }
    }

    fn copy_to_stream(&self) -> Result<Vec<u8>, Error> {
        codec::encode(self)
    }

    fn copy_from_stream(&mut self, data: &[u8]) -> Result<(), Error> {
        *self = codec::decode(data)?;
        Ok(())
    }

    fn add_information(&mut self, other: &dyn Information) {
        if let Some(other) = other.downcast_ref::<Self>() {
            self.number_of_partitions = self.number_of_partitions.max(other.number_of_partitions);
        }
    }
}

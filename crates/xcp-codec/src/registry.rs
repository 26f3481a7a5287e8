//! Process-wide codec registry.
//!
//! One table maps codec ids to implementations for the whole process. It is
//! seeded with the built-ins, may be extended by the host before any session
//! opens, and freezes at the first session open - sessions dispatch by id on
//! the hot path and must never observe the table changing underneath them.

use std::{
    collections::{BTreeMap, BTreeSet},
    sync::{Arc, OnceLock, PoisonError, RwLock},
};

use crate::{
    binary::BinaryStructCodec,
    codec::{CodecError, EtherCodec, Result},
    json::JsonCodec,
    tensor::{DlpackCodec, MixedLatentCodec, TensorCodec},
};

/// An id-keyed codec table with a freeze bit.
pub struct CodecRegistry {
    by_id: BTreeMap<u16, Arc<dyn EtherCodec>>,
    frozen: bool,
}

impl CodecRegistry {
    /// Empty, unfrozen registry.
    #[must_use]
    pub fn new() -> Self {
        Self { by_id: BTreeMap::new(), frozen: false }
    }

    /// Registry seeded with every built-in codec.
    #[must_use]
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        let builtins: Vec<Arc<dyn EtherCodec>> = vec![
            Arc::new(JsonCodec),
            Arc::new(BinaryStructCodec),
            Arc::new(TensorCodec::F32),
            Arc::new(TensorCodec::F16),
            Arc::new(TensorCodec::INT8),
            Arc::new(MixedLatentCodec),
            Arc::new(DlpackCodec),
        ];
        for codec in builtins {
            // Fresh table, distinct ids: registration cannot fail.
            let _ = registry.register(codec);
        }
        registry
    }

    /// Register a codec under its own id.
    ///
    /// Idempotent: re-registering the same id under the same name succeeds
    /// and keeps the existing entry.
    ///
    /// # Errors
    ///
    /// - `CodecError::RegistryFrozen` after [`Self::freeze`]
    /// - `CodecError::DuplicateCodec` if the id is taken by a different
    ///   implementation
    pub fn register(&mut self, codec: Arc<dyn EtherCodec>) -> Result<()> {
        if self.frozen {
            return Err(CodecError::RegistryFrozen);
        }
        if let Some(existing) = self.by_id.get(&codec.id()) {
            if existing.name() == codec.name() {
                return Ok(());
            }
            return Err(CodecError::DuplicateCodec {
                id: codec.id(),
                existing: existing.name(),
                new: codec.name(),
            });
        }
        self.by_id.insert(codec.id(), codec);
        Ok(())
    }

    /// Look up a codec by id.
    ///
    /// # Errors
    ///
    /// - `CodecError::UnknownCodec` if unregistered
    pub fn lookup(&self, id: u16) -> Result<Arc<dyn EtherCodec>> {
        self.by_id.get(&id).cloned().ok_or(CodecError::UnknownCodec { id })
    }

    /// Look up a codec by registry name.
    ///
    /// # Errors
    ///
    /// - `CodecError::UnknownCodecName` if unregistered
    pub fn lookup_name(&self, name: &str) -> Result<Arc<dyn EtherCodec>> {
        self.by_id
            .values()
            .find(|codec| codec.name() == name)
            .cloned()
            .ok_or_else(|| CodecError::UnknownCodecName { name: name.to_string() })
    }

    /// All registered ids, ascending.
    #[must_use]
    pub fn ids(&self) -> BTreeSet<u16> {
        self.by_id.keys().copied().collect()
    }

    /// Forbid further registration.
    pub fn freeze(&mut self) {
        self.frozen = true;
    }

    /// True once frozen.
    #[must_use]
    pub fn is_frozen(&self) -> bool {
        self.frozen
    }
}

impl Default for CodecRegistry {
    fn default() -> Self {
        Self::with_builtins()
    }
}

fn global() -> &'static RwLock<CodecRegistry> {
    static GLOBAL: OnceLock<RwLock<CodecRegistry>> = OnceLock::new();
    GLOBAL.get_or_init(|| RwLock::new(CodecRegistry::with_builtins()))
}

/// Register a codec in the process-wide table.
///
/// # Errors
///
/// See [`CodecRegistry::register`].
pub fn register(codec: Arc<dyn EtherCodec>) -> Result<()> {
    global().write().unwrap_or_else(PoisonError::into_inner).register(codec)
}

/// Look up a codec by id in the process-wide table.
///
/// # Errors
///
/// See [`CodecRegistry::lookup`].
pub fn lookup(id: u16) -> Result<Arc<dyn EtherCodec>> {
    global().read().unwrap_or_else(PoisonError::into_inner).lookup(id)
}

/// Look up a codec by name in the process-wide table.
///
/// # Errors
///
/// See [`CodecRegistry::lookup_name`].
pub fn lookup_name(name: &str) -> Result<Arc<dyn EtherCodec>> {
    global().read().unwrap_or_else(PoisonError::into_inner).lookup_name(name)
}

/// Ids registered in the process-wide table.
#[must_use]
pub fn registered_ids() -> BTreeSet<u16> {
    global().read().unwrap_or_else(PoisonError::into_inner).ids()
}

/// Freeze the process-wide table. Called at first session open; idempotent.
pub fn freeze() {
    global().write().unwrap_or_else(PoisonError::into_inner).freeze();
}

/// True once the process-wide table is frozen.
#[must_use]
pub fn is_frozen() -> bool {
    global().read().unwrap_or_else(PoisonError::into_inner).is_frozen()
}

#[cfg(test)]
mod tests {
    use bytes::Bytes;

    use super::*;
    use crate::ether::Ether;

    #[test]
    fn builtins_present() {
        let registry = CodecRegistry::with_builtins();
        for id in [
            xcp_proto::CODEC_JSON,
            xcp_proto::CODEC_BINARY_STRUCT,
            xcp_proto::CODEC_TENSOR_F32,
            xcp_proto::CODEC_TENSOR_F16,
            xcp_proto::CODEC_TENSOR_INT8,
            xcp_proto::CODEC_MIXED_LATENT,
            xcp_proto::CODEC_DLPACK,
        ] {
            assert!(registry.lookup(id).is_ok(), "missing builtin {id:#06x}");
        }
        assert!(registry.lookup(xcp_proto::CODEC_ARROW_IPC).is_err());
        assert!(registry.lookup_name("json").is_ok());
        assert!(registry.lookup_name("arrow_ipc").is_err());
    }

    #[test]
    fn register_is_idempotent_by_id_and_name() {
        let mut registry = CodecRegistry::with_builtins();
        assert!(registry.register(Arc::new(JsonCodec)).is_ok());
    }

    #[test]
    fn conflicting_registration_rejected() {
        struct Impostor;
        impl EtherCodec for Impostor {
            fn id(&self) -> u16 {
                xcp_proto::CODEC_JSON
            }
            fn name(&self) -> &'static str {
                "not_json"
            }
            fn is_binary(&self) -> bool {
                true
            }
            fn encode(&self, _ether: &Ether) -> Result<Bytes> {
                Ok(Bytes::new())
            }
            fn decode(&self, _bytes: &[u8]) -> Result<Ether> {
                Ether::new("x", 1)
            }
        }

        let mut registry = CodecRegistry::with_builtins();
        let result = registry.register(Arc::new(Impostor));
        assert!(matches!(result, Err(CodecError::DuplicateCodec { id, .. }) if id == xcp_proto::CODEC_JSON));
    }

    #[test]
    fn freeze_blocks_registration() {
        let mut registry = CodecRegistry::with_builtins();
        registry.freeze();
        assert!(registry.is_frozen());
        assert!(matches!(
            registry.register(Arc::new(JsonCodec)),
            Err(CodecError::RegistryFrozen)
        ));
        // Lookup still works.
        assert!(registry.lookup(xcp_proto::CODEC_JSON).is_ok());
    }

    #[test]
    fn global_lookup_works() {
        assert!(lookup(xcp_proto::CODEC_JSON).is_ok());
        assert!(registered_ids().contains(&xcp_proto::CODEC_BINARY_STRUCT));
    }
}

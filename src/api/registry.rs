use anyhow::anyhow;
use once_cell::sync::Lazy;
use rustc_hash::FxHashMap;
use tracing::debug;

use crate::dialect::{MavMessage, MessageDescriptor, MessageKind, MESSAGE_INFOS};

/// Process-wide lookup compiled once from the message catalog: numeric ID to
///  descriptor and kind to descriptor. Read-only after construction, so it is
///  shared without any locking.
pub struct IdRegistry {
    by_id: FxHashMap<u32, MessageDescriptor>,
    by_kind: FxHashMap<MessageKind, MessageDescriptor>,
}

static GLOBAL: Lazy<IdRegistry> = Lazy::new(|| {
    IdRegistry::compile_from(MESSAGE_INFOS)
        .expect("the compiled message catalog is inconsistent")
});

impl IdRegistry {
    pub fn global() -> &'static IdRegistry {
        &GLOBAL
    }

    /// Builds the two lookup tables, rejecting catalogs where an ID or a kind
    ///  appears more than once.
    pub fn compile_from(infos: &[MessageDescriptor]) -> anyhow::Result<IdRegistry> {
        let mut by_id = FxHashMap::default();
        let mut by_kind = FxHashMap::default();

        for info in infos {
            if by_id.insert(info.id, *info).is_some() {
                return Err(anyhow!("duplicate message id {} in the catalog", info.id));
            }
            if by_kind.insert(info.kind, *info).is_some() {
                return Err(anyhow!("duplicate message kind {:?} in the catalog", info.kind));
            }
            debug!("registered message {} -> {:?}", info.id, info.kind);
        }

        Ok(IdRegistry { by_id, by_kind })
    }

    pub fn by_id(&self, id: u32) -> Option<&MessageDescriptor> {
        self.by_id.get(&id)
    }

    pub fn by_kind(&self, kind: MessageKind) -> Option<&MessageDescriptor> {
        self.by_kind.get(&kind)
    }

    pub fn descriptor_of<M: MavMessage>(&self) -> &MessageDescriptor {
        self.by_id.get(&M::ID)
            .expect("message type is part of the compiled catalog")
    }
}

//! Uploaded symbols, indexed by draw order.
//!
//! Several tiles may carry the same symbol; each upload registers its own
//! texture and lookups return the earliest one still registered.

use std::collections::BTreeMap;

use parking_lot::RwLock;

use crate::device::TextureHandle;
use crate::payload::SymbolId;

#[derive(Debug, Default)]
pub struct SymbolRegistry {
    by_order: RwLock<BTreeMap<i32, BTreeMap<SymbolId, Vec<TextureHandle>>>>,
}

impl SymbolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, order: i32, id: SymbolId, texture: TextureHandle) {
        self.by_order
            .write()
            .entry(order)
            .or_default()
            .entry(id)
            .or_default()
            .push(texture);
    }

    /// Returns `false` if `texture` was not registered under (order, id).
    pub fn unregister(&self, order: i32, id: SymbolId, texture: TextureHandle) -> bool {
        let mut by_order = self.by_order.write();
        let Some(symbols) = by_order.get_mut(&order) else {
            return false;
        };
        let Some(textures) = symbols.get_mut(&id) else {
            return false;
        };
        let Some(pos) = textures.iter().position(|t| *t == texture) else {
            return false;
        };
        textures.remove(pos);

        if textures.is_empty() {
            symbols.remove(&id);
        }
        if symbols.is_empty() {
            by_order.remove(&order);
        }
        true
    }

    pub fn lookup(&self, order: i32, id: SymbolId) -> Option<TextureHandle> {
        self.by_order
            .read()
            .get(&order)
            .and_then(|symbols| symbols.get(&id))
            .and_then(|textures| textures.first().copied())
    }

    /// Every distinct symbol in draw order.
    pub fn in_draw_order(&self) -> Vec<(i32, SymbolId, TextureHandle)> {
        self.by_order
            .read()
            .iter()
            .flat_map(|(order, symbols)| {
                symbols.iter().filter_map(move |(id, textures)| {
                    textures.first().map(|texture| (*order, *id, *texture))
                })
            })
            .collect()
    }

    /// Number of distinct (order, id) pairs.
    pub fn len(&self) -> usize {
        self.by_order.read().values().map(BTreeMap::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.by_order.read().is_empty()
    }
}

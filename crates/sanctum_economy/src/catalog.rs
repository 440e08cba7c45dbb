//! # Item Catalogue
//!
//! Summonable base items. A summon that lands on tier *t* picks uniformly
//! among the items whose `base_tier` is *t*.

use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::account::{Element, ItemId, Tier};
use crate::error::{EconomyError, EconomyResult};

/// One summonable item.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CatalogItem {
    /// Base item id.
    pub base_id: ItemId,
    /// Display name.
    pub name: String,
    /// Element tag copied onto stacks.
    pub element: Element,
    /// Tier the item is summoned at.
    pub base_tier: Tier,
}

#[derive(Deserialize)]
struct CatalogFile {
    items: Vec<CatalogItem>,
}

/// All summonable items, indexed by base tier.
#[derive(Clone, Debug, Default)]
pub struct ItemCatalog {
    items: BTreeMap<ItemId, CatalogItem>,
    by_tier: BTreeMap<Tier, Vec<ItemId>>,
}

impl ItemCatalog {
    /// Empty catalogue.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Builds a catalogue from items.
    ///
    /// # Errors
    ///
    /// `InvalidConfig` on duplicate ids or tier 0.
    pub fn from_items(items: impl IntoIterator<Item = CatalogItem>) -> EconomyResult<Self> {
        let mut catalog = Self::new();
        for item in items {
            catalog.insert(item)?;
        }
        Ok(catalog)
    }

    /// Parses a TOML document of `[[items]]` tables.
    ///
    /// # Errors
    ///
    /// `InvalidConfig` on parse errors or invalid items.
    pub fn from_toml(source: &str) -> EconomyResult<Self> {
        let file: CatalogFile = toml::from_str(source)
            .map_err(|e| EconomyError::InvalidConfig(format!("failed to parse catalog TOML: {e}")))?;
        Self::from_items(file.items)
    }

    /// Reads and parses a catalogue file.
    ///
    /// # Errors
    ///
    /// `Storage` if unreadable, `InvalidConfig` if malformed.
    pub fn load(path: &Path) -> EconomyResult<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| EconomyError::Storage(format!("{}: {e}", path.display())))?;
        Self::from_toml(&content)
    }

    /// Adds an item.
    ///
    /// # Errors
    ///
    /// `InvalidConfig` on duplicate ids or tier 0.
    pub fn insert(&mut self, item: CatalogItem) -> EconomyResult<()> {
        if item.base_tier == 0 {
            return Err(EconomyError::InvalidConfig(format!(
                "catalog item {} has tier 0",
                item.base_id
            )));
        }
        if self.items.contains_key(&item.base_id) {
            return Err(EconomyError::InvalidConfig(format!(
                "duplicate catalog item {}",
                item.base_id
            )));
        }
        self.by_tier.entry(item.base_tier).or_default().push(item.base_id);
        self.items.insert(item.base_id, item);
        Ok(())
    }

    /// Looks up an item.
    #[must_use]
    pub fn get(&self, base_id: ItemId) -> Option<&CatalogItem> {
        self.items.get(&base_id)
    }

    /// Items summoned at `tier`, in insertion order.
    #[must_use]
    pub fn items_at_tier(&self, tier: Tier) -> &[ItemId] {
        self.by_tier.get(&tier).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Tiers that have at least one item.
    #[must_use]
    pub fn tiers(&self) -> BTreeSet<Tier> {
        self.by_tier.keys().copied().collect()
    }

    /// Number of items.
    #[must_use]
    pub fn len(&self) -> usize {
        self.items.len()
    }

    /// True if empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Reference catalogue: four items per tier for tiers 1 to 6.
    #[must_use]
    pub fn standard() -> Self {
        const ELEMENTS: [Element; 6] = [
            Element::Fire,
            Element::Water,
            Element::Earth,
            Element::Wind,
            Element::Light,
            Element::Dark,
        ];
        let mut catalog = Self::new();
        let mut base_id: ItemId = 100;
        for tier in 1..=6u8 {
            for slot in 0..4usize {
                let element = ELEMENTS[(usize::from(tier) + slot) % ELEMENTS.len()];
                catalog.items.insert(
                    base_id,
                    CatalogItem {
                        base_id,
                        name: format!("Maiden {base_id}"),
                        element,
                        base_tier: tier,
                    },
                );
                catalog.by_tier.entry(tier).or_default().push(base_id);
                base_id += 1;
            }
        }
        catalog
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_standard_catalog_shape() {
        let catalog = ItemCatalog::standard();
        assert_eq!(catalog.len(), 24);
        assert_eq!(catalog.tiers().len(), 6);
        assert_eq!(catalog.items_at_tier(3).len(), 4);
        assert!(catalog.items_at_tier(9).is_empty());
    }

    #[test]
    fn test_duplicate_rejected() {
        let item = CatalogItem {
            base_id: 1,
            name: "Ember".into(),
            element: Element::Fire,
            base_tier: 1,
        };
        let mut catalog = ItemCatalog::new();
        catalog.insert(item.clone()).unwrap();
        assert!(catalog.insert(item).is_err());
    }

    #[test]
    fn test_from_toml() {
        let source = r#"
            [[items]]
            base_id = 1
            name = "Ember"
            element = "fire"
            base_tier = 1

            [[items]]
            base_id = 2
            name = "Tide"
            element = "water"
            base_tier = 2
        "#;
        let catalog = ItemCatalog::from_toml(source).unwrap();
        assert_eq!(catalog.get(2).unwrap().element, Element::Water);
        assert_eq!(catalog.items_at_tier(1), &[1]);
    }
}

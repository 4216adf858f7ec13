//! Entity types: named groups of output item types used to select jobs.
//!
//! The registry is a static table; combining entity types yields a bit mask
//! that also keys the sync progress record.

use std::collections::BTreeSet;
use std::fmt;

use crate::types::items::ItemType;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct EntityTypes(u64);

struct EntityDefinition {
    name: &'static str,
    bit: u64,
    output_types: &'static [ItemType],
}

const REGISTRY: &[EntityDefinition] = &[
    EntityDefinition {
        name: "EXPLORER_BASE",
        bit: 1 << 0,
        output_types: &[ItemType::Block, ItemType::Transaction, ItemType::Log],
    },
    EntityDefinition {
        name: "EXPLORER_TOKEN",
        bit: 1 << 1,
        output_types: &[ItemType::TokenTransfer, ItemType::Token, ItemType::TokenBalance],
    },
    EntityDefinition {
        name: "EXPLORER_TRACE",
        bit: 1 << 2,
        output_types: &[ItemType::Trace, ItemType::ContractInternalTransaction],
    },
];

impl EntityTypes {
    pub const EXPLORER_BASE: EntityTypes = EntityTypes(1 << 0);
    pub const EXPLORER_TOKEN: EntityTypes = EntityTypes(1 << 1);
    pub const EXPLORER_TRACE: EntityTypes = EntityTypes(1 << 2);

    pub fn empty() -> Self {
        Self(0)
    }

    pub fn bits(&self) -> u64 {
        self.0
    }

    pub fn contains(&self, other: EntityTypes) -> bool {
        other.0 != 0 && self.0 & other.0 == other.0
    }

    pub fn union(self, other: EntityTypes) -> Self {
        Self(self.0 | other.0)
    }

    pub fn is_empty(&self) -> bool {
        self.0 == 0
    }

    /// Parse a comma-separated list such as `EXPLORER_BASE,EXPLORER_TOKEN`.
    pub fn parse_list(list: &str) -> Result<Self, String> {
        let mut types = Self::empty();
        for name in list.split(',').map(str::trim).filter(|s| !s.is_empty()) {
            let upper = name.to_ascii_uppercase();
            let def = REGISTRY
                .iter()
                .find(|d| d.name == upper)
                .ok_or_else(|| format!("unknown entity type '{}'", name))?;
            types.0 |= def.bit;
        }
        if types.is_empty() {
            return Err("no entity types given".to_string());
        }
        Ok(types)
    }

    /// All output item types produced for these entity types.
    pub fn output_types(&self) -> BTreeSet<ItemType> {
        REGISTRY
            .iter()
            .filter(|d| self.0 & d.bit != 0)
            .flat_map(|d| d.output_types.iter().copied())
            .collect()
    }

    pub fn names(&self) -> Vec<&'static str> {
        REGISTRY
            .iter()
            .filter(|d| self.0 & d.bit != 0)
            .map(|d| d.name)
            .collect()
    }
}

impl fmt::Display for EntityTypes {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.names().join(","))
    }
}

/// Resolve the required output types from either an explicit list of item
/// type names or the entity types.
pub fn required_output_types(
    entity_types: EntityTypes,
    explicit: Option<&str>,
) -> Result<BTreeSet<ItemType>, String> {
    match explicit.map(str::trim).filter(|s| !s.is_empty()) {
        Some(list) => list
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(|s| s.parse::<ItemType>())
            .collect(),
        None => Ok(entity_types.output_types()),
    }
}

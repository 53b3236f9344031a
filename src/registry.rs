//! Entity-kind registry.
//!
//! Every synced entity kind (product, client, sale, ...) is described by a
//! [`KindSpec`] data entry: its storage shape and its hydration policy.
//! Adding a kind to the system is a registry entry, not a new module — the
//! queue, synchronizer, and hydration loader are all generic over the
//! registry, and the remote endpoint paths are derived from the kind name.

use serde::{Deserialize, Serialize};

/// Storage shape of an entity kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum KindShape {
    /// Many records, each with its own string id.
    Collection,
    /// Exactly one record globally, stored under a fixed key.
    Singleton,
}

/// When the hydration loader pulls the remote collection for a kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HydrationPolicy {
    /// Pull once, only while the local table is empty.
    IfEmpty,
    /// Re-pull on every hydration call (reference data that changes
    /// server-side); writes are upserts so repeated calls are safe.
    Always,
}

/// Descriptor for one entity kind.
#[derive(Debug, Clone, Copy)]
pub struct KindSpec {
    pub name: &'static str,
    pub shape: KindShape,
    pub hydration: HydrationPolicy,
}

impl KindSpec {
    /// Local table backing this kind.
    pub fn table_name(&self) -> String {
        format!("records_{}", self.name)
    }
}

/// Kind names feed SQL table names and URL paths, so they are restricted to
/// a safe character set at registration time.
fn validate_kind_name(name: &str) -> Result<(), String> {
    if name.is_empty() {
        return Err("entity kind name is empty".to_string());
    }
    if name.len() > 64 {
        return Err(format!("entity kind name '{name}' is too long"));
    }
    if !name.chars().next().is_some_and(|c| c.is_ascii_lowercase()) {
        return Err(format!(
            "entity kind name '{name}' must start with a lowercase letter"
        ));
    }
    if !name
        .chars()
        .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_')
    {
        return Err(format!(
            "entity kind name '{name}' contains unsupported characters"
        ));
    }
    Ok(())
}

/// Registry of all entity kinds known to this client.
#[derive(Debug, Clone)]
pub struct KindRegistry {
    kinds: Vec<KindSpec>,
}

impl KindRegistry {
    pub fn new(kinds: Vec<KindSpec>) -> Result<Self, String> {
        for spec in &kinds {
            validate_kind_name(spec.name)?;
        }
        for (i, spec) in kinds.iter().enumerate() {
            if kinds[..i].iter().any(|other| other.name == spec.name) {
                return Err(format!("duplicate entity kind '{}'", spec.name));
            }
        }
        Ok(Self { kinds })
    }

    pub fn get(&self, name: &str) -> Option<&KindSpec> {
        self.kinds.iter().find(|spec| spec.name == name)
    }

    pub fn iter(&self) -> impl Iterator<Item = &KindSpec> {
        self.kinds.iter()
    }

    pub fn len(&self) -> usize {
        self.kinds.len()
    }

    pub fn is_empty(&self) -> bool {
        self.kinds.is_empty()
    }

    /// The kind table a typical POS client ships with.
    pub fn default_pos() -> Self {
        let kinds = vec![
            KindSpec {
                name: "product",
                shape: KindShape::Collection,
                hydration: HydrationPolicy::IfEmpty,
            },
            KindSpec {
                name: "client",
                shape: KindShape::Collection,
                hydration: HydrationPolicy::IfEmpty,
            },
            KindSpec {
                name: "supplier",
                shape: KindShape::Collection,
                hydration: HydrationPolicy::IfEmpty,
            },
            KindSpec {
                name: "tax",
                shape: KindShape::Collection,
                hydration: HydrationPolicy::IfEmpty,
            },
            KindSpec {
                name: "promotion",
                shape: KindShape::Collection,
                hydration: HydrationPolicy::IfEmpty,
            },
            KindSpec {
                name: "sale",
                shape: KindShape::Collection,
                hydration: HydrationPolicy::IfEmpty,
            },
            KindSpec {
                name: "settings",
                shape: KindShape::Singleton,
                hydration: HydrationPolicy::IfEmpty,
            },
            KindSpec {
                name: "theme",
                shape: KindShape::Collection,
                hydration: HydrationPolicy::Always,
            },
        ];
        Self::new(kinds).expect("default kind table is valid")
    }
}

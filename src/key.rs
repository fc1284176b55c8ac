use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// What kind of entity a key scopes
#[derive(
    Clone,
    Copy,
    Debug,
    PartialEq,
    Eq,
    Hash,
    PartialOrd,
    Ord,
    Serialize,
    Deserialize,
    strum::Display,
    strum::EnumString,
    strum::AsRefStr,
)]
#[strum(serialize_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum EntityKind {
    Stock,
    Industry,
    Keyword,
}

/// A user-visible entity (stock code, industry name, search keyword)
///
/// Construction always normalizes, and normalizing an already normalized id is
/// a no-op, so two keys built from `" 600519.sh"` and `"600519.SH"` are equal.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct EntityKey {
    kind: EntityKind,
    id: String,
}

impl EntityKey {
    pub fn new(kind: EntityKind, raw: &str) -> Self {
        let id = match kind {
            EntityKind::Stock => raw.trim().to_uppercase(),
            EntityKind::Industry | EntityKind::Keyword => collapse_whitespace(raw),
        };
        Self { kind, id }
    }

    pub fn stock(code: &str) -> Self {
        Self::new(EntityKind::Stock, code)
    }

    pub fn industry(name: &str) -> Self {
        Self::new(EntityKind::Industry, name)
    }

    pub fn keyword(text: &str) -> Self {
        Self::new(EntityKind::Keyword, text)
    }

    pub fn kind(&self) -> EntityKind {
        self.kind
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn is_empty(&self) -> bool {
        self.id.is_empty()
    }

    /// Key for one facet (data kind) of this entity
    pub fn facet(&self, facet: impl Into<String>) -> ResourceKey {
        ResourceKey {
            entity: self.clone(),
            facet: facet.into(),
            params: BTreeMap::new(),
        }
    }
}

impl std::fmt::Display for EntityKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.kind, self.id)
    }
}

/// Identifies "what is being fetched": an entity, a facet and a parameter set
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ResourceKey {
    entity: EntityKey,
    facet: String,
    params: BTreeMap<String, String>,
}

impl ResourceKey {
    #[must_use]
    pub fn with_param(mut self, name: &str, value: impl ToString) -> Self {
        self.params
            .insert(name.trim().to_lowercase(), value.to_string().trim().to_string());
        self
    }

    pub fn entity(&self) -> &EntityKey {
        &self.entity
    }

    pub fn facet_name(&self) -> &str {
        &self.facet
    }

    pub fn param(&self, name: &str) -> Option<&str> {
        self.params.get(name).map(String::as_str)
    }

    pub fn params(&self) -> &BTreeMap<String, String> {
        &self.params
    }

    /// Same entity and params, different facet
    #[must_use]
    pub fn sibling(&self, facet: impl Into<String>) -> Self {
        Self {
            entity: self.entity.clone(),
            facet: facet.into(),
            params: self.params.clone(),
        }
    }
}

impl std::fmt::Display for ResourceKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.entity, self.facet)?;
        let mut sep = '?';
        for (name, value) in &self.params {
            write!(f, "{sep}{name}={value}")?;
            sep = '&';
        }
        Ok(())
    }
}

fn collapse_whitespace(raw: &str) -> String {
    raw.split_whitespace().collect::<Vec<_>>().join(" ")
}

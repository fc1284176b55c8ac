use serde::{Deserialize, Serialize};

use super::FetchRequest;
use crate::key::EntityKey;

#[derive(Clone, Debug, Default, Deserialize, Serialize)]
pub struct SearchItem {
    /// Stock code (e.g. 600519.SH) or industry name
    pub code: String,
    /// Display name
    #[serde(default)]
    pub name: String,
    /// Market, empty for industries
    #[serde(default)]
    pub market: String,
    /// `stock` or `industry`
    #[serde(default, rename = "type")]
    pub kind: String,
    /// Search score
    #[serde(default)]
    pub score: f64,
}

impl SearchItem {
    /// Entity this result navigates to
    pub fn entity(&self) -> EntityKey {
        if self.kind.eq_ignore_ascii_case("industry") {
            EntityKey::industry(&self.code)
        } else {
            EntityKey::stock(&self.code)
        }
    }
}

impl PartialEq for SearchItem {
    fn eq(&self, other: &Self) -> bool {
        self.entity() == other.entity()
    }
}

/// Build the keystroke search request
pub fn search_request(endpoint: &str, keyword: &str, limit: usize) -> FetchRequest {
    FetchRequest::new("search", endpoint)
        .param("keyword", keyword)
        .param("limit", limit)
}

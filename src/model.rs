use serde::Serialize;

use crate::api::Page;
use crate::key::EntityKey;
use crate::tabs::TabId;

/// Everything the entity cache can hold
#[derive(Clone, Debug, PartialEq)]
pub enum Payload {
    /// Rows of a tab's data domain
    Rows(Page),
    /// Finished streamed analysis
    Analysis(AnalysisDoc),
    /// Past analyses of an entity
    History(Page),
}

impl Payload {
    pub fn rows(&self) -> Option<&Page> {
        match self {
            Self::Rows(page) | Self::History(page) => Some(page),
            Self::Analysis(_) => None,
        }
    }

    pub fn analysis(&self) -> Option<&AnalysisDoc> {
        match self {
            Self::Analysis(doc) => Some(doc),
            _ => None,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct AnalysisDoc {
    pub run_id: u64,
    pub text: String,
}

/// Which entity and tab the user is looking at
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SessionState {
    pub active_entity: Option<EntityKey>,
    pub active_tab: Option<TabId>,
}

impl SessionState {
    pub fn is_active(&self, entity: &EntityKey) -> bool {
        self.active_entity.as_ref() == Some(entity)
    }
}

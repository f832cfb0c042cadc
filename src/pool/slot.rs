//! Resource slot types.

use serde::{Deserialize, Serialize};

/// Index of a slot in the pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ResourceId(pub usize);

impl std::fmt::Display for ResourceId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Category of remote compute resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceClass {
    /// Image-generation backend. One job at a time, never shared.
    ComputeBackend,
    /// Language-model instance.
    ModelInstance,
}

/// Job weight, used only for model-instance allocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SizeClass {
    /// Lightweight auxiliary call.
    Small,
    /// Primary call.
    Large,
}

impl std::fmt::Display for SizeClass {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Small => write!(f, "small"),
            Self::Large => write!(f, "large"),
        }
    }
}

/// One registered resource.
#[derive(Debug, Clone, Serialize)]
pub struct ResourceSlot {
    pub id: ResourceId,
    pub name: String,
    pub class: ResourceClass,
    /// Accepted size classes (model instances only).
    pub accepts: Vec<SizeClass>,
    /// In-flight dispatches bound to this slot.
    pub load: u32,
    pub(crate) removed: bool,
}

impl ResourceSlot {
    pub(crate) fn new(
        id: ResourceId,
        name: impl Into<String>,
        class: ResourceClass,
        accepts: Vec<SizeClass>,
    ) -> Self {
        Self {
            id,
            name: name.into(),
            class,
            accepts,
            load: 0,
            removed: false,
        }
    }

    pub fn is_busy(&self) -> bool {
        self.load > 0
    }

    /// Compute backends ignore size; model instances default unflagged jobs to `Large`.
    pub fn accepts_size(&self, size: Option<SizeClass>) -> bool {
        match self.class {
            ResourceClass::ComputeBackend => true,
            ResourceClass::ModelInstance => {
                self.accepts.contains(&size.unwrap_or(SizeClass::Large))
            }
        }
    }
}

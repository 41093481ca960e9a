//! The set of monitored targets. Loaded once at startup, read-only afterwards.

use std::sync::Arc;

use crate::store::Target;

/// Cheaply clonable, immutable list of targets.
#[derive(Debug, Clone)]
pub struct TargetRegistry {
    targets: Arc<[Target]>,
}

impl TargetRegistry {
    pub fn new(targets: Vec<Target>) -> Self {
        Self {
            targets: targets.into(),
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = &Target> {
        self.targets.iter()
    }

    #[cfg(test)]
    pub fn get(&self, id: &str) -> Option<&Target> {
        self.targets.iter().find(|t| t.id == id)
    }

    pub fn len(&self) -> usize {
        self.targets.len()
    }
}

//! Operation classes and their mapping onto queue families

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use super::{ExecError, ExecResult};
use crate::driver::{QueueCapabilities, QueueFamily};

/// Kind of GPU work a queue is reserved for
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationClass {
    /// Copies and uploads
    Transfer,
    /// Compute dispatches only
    Compute,
    /// Graphics only
    Graphics,
    /// Graphics and compute on one queue
    GraphicsAndCompute,
    /// Presentation to a surface
    Present,
}

impl OperationClass {
    /// Every class, in declaration order
    pub const ALL: [Self; 5] = [
        Self::Transfer,
        Self::Compute,
        Self::Graphics,
        Self::GraphicsAndCompute,
        Self::Present,
    ];

    /// Capabilities a queue family needs to run this class
    pub fn required_capabilities(self) -> QueueCapabilities {
        match self {
            Self::Transfer => QueueCapabilities::TRANSFER,
            Self::Compute => QueueCapabilities::COMPUTE,
            Self::Graphics => QueueCapabilities::GRAPHICS,
            Self::GraphicsAndCompute => QueueCapabilities::GRAPHICS | QueueCapabilities::COMPUTE,
            Self::Present => QueueCapabilities::PRESENT,
        }
    }
}

/// Map each requested class onto one queue family
///
/// Among the families supporting a class, the one sharing the fewest
/// capability bits with the other requested classes wins, so a dedicated
/// transfer family is preferred over the graphics family for uploads. Ties
/// go to the family with fewer extra capabilities, then the lowest index.
pub fn select_queue_families(
    families: &[QueueFamily],
    classes: &[OperationClass],
) -> ExecResult<BTreeMap<OperationClass, u32>> {
    let mut selection = BTreeMap::new();

    for &class in classes {
        if selection.contains_key(&class) {
            continue;
        }

        let required = class.required_capabilities();
        let others = classes
            .iter()
            .filter(|&&other| other != class)
            .fold(QueueCapabilities::empty(), |acc, other| acc | other.required_capabilities())
            .difference(required);

        let family = families
            .iter()
            .filter(|family| family.queue_count > 0 && family.capabilities.contains(required))
            .min_by_key(|family| {
                let overlap = (family.capabilities & others).bits().count_ones();
                let extra = family.capabilities.difference(required).bits().count_ones();
                (overlap, extra, family.index)
            })
            .ok_or(ExecError::UnsupportedOperationClass(class))?;

        log::debug!("{:?} -> queue family {}", class, family.index);
        selection.insert(class, family.index);
    }

    Ok(selection)
}

use crate::cache::VillageCache;
use farmhand_protocol::{BuildTask, ResourceKind};
use std::cmp::{Ordering, Reverse};
use std::collections::BTreeMap;

/// Current stock per resource, as read from the stock bar.
pub type ResourceAmounts = BTreeMap<ResourceKind, u64>;

/// A field picked for the next upgrade, with the task that wants it.
#[derive(Debug, Clone, PartialEq)]
pub struct Candidate<'a> {
    pub slot: u32,
    pub kind: ResourceKind,
    pub level: u32,
    pub target_level: u32,
    /// `None` when the stock of this resource is unknown; sorts last.
    pub resource_value: Option<u64>,
    pub priority: i64,
    pub task: &'a BuildTask,
}

impl Candidate<'_> {
    fn sort_key(&self) -> (u64, Reverse<i64>, u32, u32, u32) {
        (
            self.resource_value.unwrap_or(u64::MAX),
            Reverse(self.priority),
            self.level,
            self.target_level,
            self.slot,
        )
    }
}

impl Ord for Candidate<'_> {
    fn cmp(&self, other: &Self) -> Ordering {
        self.sort_key().cmp(&other.sort_key())
    }
}

impl PartialOrd for Candidate<'_> {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Eq for Candidate<'_> {}

/// Every (task, field) pair where the field still needs upgrading for that task.
pub fn candidates<'a>(
    cache: &VillageCache,
    tasks: &'a [BuildTask],
    amounts: &ResourceAmounts,
) -> Vec<Candidate<'a>> {
    let Some(fields) = cache.fields() else {
        return Vec::new();
    };
    let mut out = Vec::new();
    for task in tasks {
        let Some(kind) = task.building_type else {
            continue;
        };
        for field in fields {
            if field.kind != kind || field.level >= task.target_level || field.is_building {
                continue;
            }
            out.push(Candidate {
                slot: field.slot,
                kind,
                level: field.level,
                target_level: task.target_level,
                resource_value: amounts.get(&kind).copied(),
                priority: task.priority,
                task,
            });
        }
    }
    out
}

/// Picks the one field to upgrade next across all resource tasks.
///
/// Order: scarcest resource first, then higher task priority, lower field
/// level, lower target level and finally lower slot.
pub fn select_lowest_field<'a>(
    cache: &VillageCache,
    tasks: &'a [BuildTask],
    amounts: &ResourceAmounts,
) -> Option<Candidate<'a>> {
    let winner = candidates(cache, tasks, amounts).into_iter().min()?;
    tracing::info!(
        task = %winner.task.label(),
        slot = winner.slot,
        level = winner.level,
        target = winner.target_level,
        "lowest field selected"
    );
    Some(winner)
}

/// Resource tasks whose every field of the type already reached the target.
pub fn completed_resource_tasks<'a>(cache: &VillageCache, tasks: &'a [BuildTask]) -> Vec<&'a BuildTask> {
    let Some(fields) = cache.fields() else {
        return Vec::new();
    };
    tasks
        .iter()
        .filter(|task| {
            let Some(kind) = task.building_type else {
                return false;
            };
            let mut of_kind = fields.iter().filter(|f| f.kind == kind).peekable();
            of_kind.peek().is_some() && of_kind.all(|f| f.level >= task.target_level)
        })
        .collect()
}

use farmhand_protocol::{FieldDescriptor, ResourceKind};
use serde::Serialize;
use std::time::Duration;
use tokio::time::Instant;

/// How long a full scan is trusted before `scan_if_needed` reads the page again.
pub const CACHE_DURATION: Duration = Duration::from_secs(30 * 60);

/// Resource plots occupy slots `1..=RESOURCE_SLOTS` in every village.
pub const RESOURCE_SLOTS: u32 = 18;

/// Resource-field levels of the active village between full scans.
///
/// The cache is either empty or holds a descriptor for every resource slot.
/// Levels only change through `update_field_level`, an optimistic write made
/// right after the game accepted an upgrade.
#[derive(Debug, Clone, Default)]
pub struct VillageCache {
    fields: Option<Vec<FieldDescriptor>>,
    scanned_at: Option<Instant>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct KindSummary {
    pub kind: ResourceKind,
    pub count: usize,
    pub min_level: u32,
    pub max_level: u32,
    pub building: usize,
}

impl VillageCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fields(&self) -> Option<&[FieldDescriptor]> {
        self.fields.as_deref()
    }

    pub fn is_valid(&self) -> bool {
        self.fields.is_some()
    }

    pub fn scanned_at(&self) -> Option<Instant> {
        self.scanned_at
    }

    pub fn is_fresh(&self, now: Instant) -> bool {
        match (&self.fields, self.scanned_at) {
            (Some(_), Some(at)) => now.saturating_duration_since(at) < CACHE_DURATION,
            _ => false,
        }
    }

    /// Replaces the whole field list. Callers must pass a complete scan.
    pub(crate) fn commit(&mut self, mut fields: Vec<FieldDescriptor>, at: Instant) {
        debug_assert_eq!(fields.len(), RESOURCE_SLOTS as usize);
        fields.sort_by_key(|f| f.slot);
        self.fields = Some(fields);
        self.scanned_at = Some(at);
    }

    /// Marks `slot` as queued and optionally bumps its level. Returns the new level.
    pub fn update_field_level(&mut self, slot: u32, increment_level: bool) -> Option<u32> {
        let field = self.fields.as_mut()?.iter_mut().find(|f| f.slot == slot)?;
        if increment_level {
            field.level += 1;
        }
        field.is_building = true;
        tracing::info!(slot, level = field.level, "cache updated");
        Some(field.level)
    }

    pub fn invalidate(&mut self) {
        if self.fields.is_some() {
            tracing::info!("field cache invalidated");
        }
        self.fields = None;
        self.scanned_at = None;
    }

    pub fn field(&self, slot: u32) -> Option<&FieldDescriptor> {
        self.fields()?.iter().find(|f| f.slot == slot)
    }

    pub fn summary(&self) -> Vec<KindSummary> {
        let Some(fields) = self.fields() else {
            return Vec::new();
        };
        ResourceKind::ALL
            .into_iter()
            .filter_map(|kind| {
                let of_kind: Vec<&FieldDescriptor> =
                    fields.iter().filter(|f| f.kind == kind).collect();
                let min_level = of_kind.iter().map(|f| f.level).min()?;
                let max_level = of_kind.iter().map(|f| f.level).max()?;
                Some(KindSummary {
                    kind,
                    count: of_kind.len(),
                    min_level,
                    max_level,
                    building: of_kind.iter().filter(|f| f.is_building).count(),
                })
            })
            .collect()
    }

    pub fn log_status(&self) {
        for s in self.summary() {
            tracing::info!(
                kind = %s.kind,
                count = s.count,
                levels = %format!("{}-{}", s.min_level, s.max_level),
                queued = s.building,
                "field status"
            );
        }
    }
}

#[cfg(test)]
pub(crate) fn sample_fields(levels: &[(ResourceKind, u32)]) -> Vec<FieldDescriptor> {
    levels
        .iter()
        .enumerate()
        .map(|(i, (kind, level))| FieldDescriptor {
            slot: i as u32 + 1,
            kind: *kind,
            level: *level,
            is_building: false,
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn full_cache() -> VillageCache {
        let mut levels = vec![(ResourceKind::Wood, 2); 14];
        levels.extend([(ResourceKind::Crop, 3); 4]);
        let mut cache = VillageCache::new();
        cache.commit(sample_fields(&levels), Instant::now());
        cache
    }

    #[test]
    fn optimistic_update_touches_one_slot() {
        let mut cache = full_cache();
        let before: Vec<FieldDescriptor> = cache.fields().unwrap().to_vec();

        assert_eq!(cache.update_field_level(16, true), Some(4));

        let after = cache.fields().unwrap();
        for (b, a) in before.iter().zip(after) {
            if a.slot == 16 {
                assert_eq!(a.level, b.level + 1);
                assert!(a.is_building);
            } else {
                assert_eq!(a, b);
            }
        }
    }

    #[test]
    fn update_without_increment_only_flags() {
        let mut cache = full_cache();
        assert_eq!(cache.update_field_level(1, false), Some(2));
        assert!(cache.field(1).unwrap().is_building);
        assert_eq!(cache.update_field_level(99, true), None);
    }

    #[test]
    fn invalidate_clears_everything() {
        let mut cache = full_cache();
        cache.invalidate();
        assert!(!cache.is_valid());
        assert!(cache.scanned_at().is_none());
        assert!(cache.update_field_level(1, true).is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn freshness_expires_after_window() {
        let cache = full_cache();
        assert!(cache.is_fresh(Instant::now()));
        tokio::time::advance(CACHE_DURATION).await;
        assert!(!cache.is_fresh(Instant::now()));
    }

    #[test]
    fn summary_groups_by_kind() {
        let cache = full_cache();
        let s = cache.summary();
        assert_eq!(s.len(), 2);
        assert_eq!(s[0].kind, ResourceKind::Wood);
        assert_eq!(s[0].count, 14);
        assert_eq!(s[1].min_level, 3);
    }
}

use crate::feed::{CoordFeed, FeedError};
use crate::normalize::normalize;
use crate::page::PageError;
use async_trait::async_trait;
use farmhand_protocol::{Coord, FarmTarget};
use serde::Serialize;
use std::collections::HashSet;

/// Ceiling applied to map scans when none is configured.
pub const DEFAULT_MAP_MAX_POPULATION: u32 = 50;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum FarmSource {
    Map,
    InactiveSearch,
}

#[derive(Debug, Clone, PartialEq)]
pub struct FarmOptions {
    pub list_name: String,
    /// Villages with this many inhabitants or more are skipped.
    pub max_population: Option<u32>,
    pub min_distance: f64,
    pub max_distance: f64,
    /// Units of troop type 1 sent to every target.
    pub troops_t1: u32,
    /// Total size of one list, existing entries included.
    pub max_targets_per_list: u32,
    pub total_targets: u32,
    pub auto_next_list: bool,
    pub max_lists: u32,
    pub source: FarmSource,
    pub center: Option<Coord>,
    pub rally_slot: Option<u32>,
}

impl Default for FarmOptions {
    fn default() -> Self {
        Self {
            list_name: "raid".into(),
            max_population: None,
            min_distance: 0.0,
            max_distance: 20.0,
            troops_t1: 2,
            max_targets_per_list: 100,
            total_targets: 100,
            auto_next_list: false,
            max_lists: 20,
            source: FarmSource::Map,
            center: None,
            rally_slot: None,
        }
    }
}

impl FarmOptions {
    pub fn multi_list(&self) -> bool {
        self.auto_next_list || self.total_targets > self.max_targets_per_list
    }

    /// Map scans always filter by population; feed candidates only when asked to.
    pub fn population_ceiling(&self) -> Option<u32> {
        match self.source {
            FarmSource::Map => Some(self.max_population.unwrap_or(DEFAULT_MAP_MAX_POPULATION)),
            FarmSource::InactiveSearch => self.max_population,
        }
    }
}

/// What the map detail of one tile says. Only villages with a readable
/// population produce one.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TileInfo {
    pub population: u32,
    pub name: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum CenterSource {
    Options,
    Map,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ListEntry {
    pub name: String,
    pub exists: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ListReport {
    pub list_name: String,
    pub added_count: usize,
    pub existing_count: usize,
    pub is_full: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FarmRunReport {
    pub center: Coord,
    pub center_source: CenterSource,
    pub source: FarmSource,
    pub candidates: usize,
    pub added: Vec<FarmTarget>,
    pub lists: Vec<ListReport>,
    pub total_targets: u32,
}

impl FarmRunReport {
    pub fn added_count(&self) -> usize {
        self.added.len()
    }
}

#[derive(Debug, thiserror::Error)]
pub enum FarmError {
    #[error("village coordinates not found; set FARM_CENTER_X and FARM_CENTER_Y")]
    CenterNotFound,
    #[error("rally point not found")]
    RallyPointNotFound,
    #[error("inactive feed source selected without a feed")]
    FeedMissing,
    #[error(transparent)]
    Feed(#[from] FeedError),
    #[error(transparent)]
    Page(#[from] PageError),
}

impl FarmError {
    pub fn is_session_closed(&self) -> bool {
        matches!(self, Self::Page(e) if e.is_session_closed())
    }
}

/// Page-side operations on the map and the rally point's farm lists.
#[async_trait]
pub trait FarmUi: Send + Sync {
    fn is_closed(&self) -> bool;

    /// Coordinates of the active village, read from the map view.
    async fn detect_center(&self) -> Result<Option<Coord>, PageError>;

    /// Opens the tile's map detail; `None` for oases and inconclusive tiles.
    async fn tile_info(&self, coord: Coord) -> Result<Option<TileInfo>, PageError>;

    /// "Add to farm list" from the open tile detail.
    async fn add_from_map(&self, coord: Coord, list: &str) -> Result<bool, PageError>;

    /// Opens the farm-list tab of the rally point; false when there is none.
    async fn open_farm_tab(&self, rally_slot: Option<u32>) -> Result<bool, PageError>;

    /// Normalized names of the lists shown on the farm-list tab.
    async fn list_names(&self) -> Result<Vec<String>, PageError>;

    async fn open_list(
        &self,
        name: &str,
        rally_slot: Option<u32>,
        create_if_missing: bool,
    ) -> Result<bool, PageError>;

    /// Targets of the open list.
    async fn list_targets(&self) -> Result<Vec<Coord>, PageError>;

    /// Adds a target through the open list's own form.
    async fn add_target(&self, coord: Coord, name: Option<&str>) -> Result<bool, PageError>;

    /// Sets troop type 1 on every target row; returns how many changed.
    async fn set_troops_all(&self, t1: u32) -> Result<usize, PageError>;

    async fn save_list(&self) -> Result<bool, PageError>;
}

/// Every tile within `max_distance` of `center`, nearest first.
pub fn radial_coords(center: Coord, max_distance: f64) -> Vec<FarmTarget> {
    let reach = max_distance.max(0.0).floor() as i32;
    let mut out = Vec::new();
    for dx in -reach..=reach {
        for dy in -reach..=reach {
            let distance = f64::from(dx * dx + dy * dy).sqrt();
            if distance == 0.0 || distance > max_distance {
                continue;
            }
            out.push(target(Coord::new(center.x + dx, center.y + dy), distance));
        }
    }
    out.sort_by(|a, b| a.distance.unwrap_or(0.0).total_cmp(&b.distance.unwrap_or(0.0)));
    out
}

fn target(coord: Coord, distance: f64) -> FarmTarget {
    FarmTarget {
        coord,
        population: None,
        distance: Some(distance),
        list_name: None,
    }
}

/// Feed coordinates inside the distance band, nearest first.
pub fn rank_feed_candidates(center: Coord, coords: &[Coord], min: f64, max: f64) -> Vec<FarmTarget> {
    let mut out: Vec<FarmTarget> = coords
        .iter()
        .map(|c| target(*c, center.distance_to(*c)))
        .filter(|t| t.distance.is_some_and(|d| d >= min && d <= max))
        .collect();
    out.sort_by(|a, b| a.distance.unwrap_or(0.0).total_cmp(&b.distance.unwrap_or(0.0)));
    out
}

fn numeric_suffix(name: &str) -> Option<u32> {
    if name.is_empty() || !name.chars().all(|c| c.is_ascii_digit()) {
        return None;
    }
    name.parse().ok()
}

fn push_entry(out: &mut Vec<ListEntry>, name: String, exists: bool) {
    if !name.is_empty() && !out.iter().any(|e| e.name == name) {
        out.push(ListEntry { name, exists });
    }
}

/// Lists a multi-list run walks, in order.
///
/// The base name comes first. Existing `base-N` lists follow in N order, or
/// purely numeric lists when there are no `base-N` ones. Missing names are
/// generated by continuing whichever numbering is in use.
pub fn build_list_sequence(base: &str, existing: &[String], max_lists: u32) -> Vec<ListEntry> {
    let base = normalize(base);
    let max_lists = max_lists as usize;
    let prefix = format!("{base}-");

    let mut hyphen: Vec<(u32, &String)> = Vec::new();
    let mut numeric: Vec<(u32, &String)> = Vec::new();
    for name in existing {
        if name.is_empty() || *name == base {
            continue;
        }
        if let Some(suffix) = name.strip_prefix(&prefix) {
            if let Some(n) = numeric_suffix(suffix) {
                hyphen.push((n, name));
            }
            continue;
        }
        if let Some(n) = numeric_suffix(name) {
            numeric.push((n, name));
        }
    }
    hyphen.sort();
    numeric.sort();

    let mut out: Vec<ListEntry> = Vec::new();
    let base_exists = existing.iter().any(|n| *n == base);
    push_entry(&mut out, base.clone(), base_exists);
    let known = if hyphen.is_empty() { &numeric } else { &hyphen };
    for (_, name) in known {
        push_entry(&mut out, (*name).clone(), true);
    }

    let use_hyphen = !hyphen.is_empty() || numeric.is_empty();
    let mut next = known.iter().map(|(n, _)| n + 1).max().unwrap_or(2);
    while out.len() < max_lists {
        let name = if use_hyphen {
            format!("{base}-{next}")
        } else {
            next.to_string()
        };
        next += 1;
        push_entry(&mut out, name, false);
    }
    out.truncate(max_lists);
    out
}

pub struct FarmBuilder<'a, U: FarmUi + ?Sized> {
    ui: &'a U,
    feed: Option<&'a dyn CoordFeed>,
}

impl<'a, U: FarmUi + ?Sized> FarmBuilder<'a, U> {
    pub fn new(ui: &'a U) -> Self {
        Self { ui, feed: None }
    }

    pub fn with_feed(mut self, feed: &'a dyn CoordFeed) -> Self {
        self.feed = Some(feed);
        self
    }

    async fn resolve_center(&self, opts: &FarmOptions) -> Result<(Coord, CenterSource), FarmError> {
        if let Some(center) = opts.center {
            return Ok((center, CenterSource::Options));
        }
        match self.ui.detect_center().await? {
            Some(center) => Ok((center, CenterSource::Map)),
            None => Err(FarmError::CenterNotFound),
        }
    }

    async fn candidates(&self, opts: &FarmOptions, center: Coord) -> Result<Vec<FarmTarget>, FarmError> {
        match opts.source {
            FarmSource::Map => Ok(radial_coords(center, opts.max_distance)
                .into_iter()
                .filter(|t| t.distance.is_some_and(|d| d >= opts.min_distance))
                .collect()),
            FarmSource::InactiveSearch => {
                let feed = self.feed.ok_or(FarmError::FeedMissing)?;
                let wanted = opts.total_targets as usize;
                let coords = feed.fetch(wanted.saturating_mul(20).max(wanted)).await?;
                let ranked = rank_feed_candidates(center, &coords, opts.min_distance, opts.max_distance);
                tracing::info!(fetched = coords.len(), in_range = ranked.len(), "inactive feed candidates");
                if ranked.len() < wanted {
                    tracing::warn!(
                        min = opts.min_distance,
                        max = opts.max_distance,
                        "not enough feed candidates inside the distance band"
                    );
                }
                Ok(ranked)
            }
        }
    }

    /// Fills the configured farm lists with new targets and refreshes troops.
    pub async fn run(&self, opts: &FarmOptions) -> Result<FarmRunReport, FarmError> {
        if self.ui.is_closed() {
            return Err(PageError::Closed.into());
        }
        let (center, center_source) = self.resolve_center(opts).await?;
        tracing::info!(%center, ?center_source, source = ?opts.source, "farm list run");

        let mut report = FarmRunReport {
            center,
            center_source,
            source: opts.source,
            candidates: 0,
            added: Vec::new(),
            lists: Vec::new(),
            total_targets: opts.total_targets,
        };
        if !self.ui.open_farm_tab(opts.rally_slot).await? {
            return Err(FarmError::RallyPointNotFound);
        }
        let names = self.ui.list_names().await?;
        let entries = if opts.multi_list() {
            build_list_sequence(&opts.list_name, &names, opts.max_lists.max(1))
        } else {
            let wanted = normalize(&opts.list_name);
            vec![ListEntry {
                exists: names.iter().any(|n| *n == wanted || n.contains(&wanted)),
                name: opts.list_name.clone(),
            }]
        };

        if opts.total_targets == 0 {
            self.refresh_troops(opts, &entries, &mut report).await?;
            return Ok(report);
        }

        let candidates = self.candidates(opts, center).await?;
        report.candidates = candidates.len();

        let mut known: HashSet<Coord> = HashSet::new();
        for entry in entries.iter().filter(|e| e.exists) {
            if self.ui.open_list(&entry.name, opts.rally_slot, false).await? {
                known.extend(self.ui.list_targets().await?);
            }
        }

        let ceiling = opts.population_ceiling();
        let wanted = opts.total_targets as usize;
        let mut cursor = 0;

        for entry in &entries {
            if report.added.len() >= wanted {
                break;
            }
            let list = entry.name.as_str();
            if !self.ui.open_list(list, opts.rally_slot, !entry.exists).await? {
                tracing::warn!(list, "farm list could not be opened");
                continue;
            }
            let changed = self.ui.set_troops_all(opts.troops_t1).await?;
            if changed > 0 {
                tracing::info!(list, changed, "troops applied to existing targets");
            }
            let existing = self.ui.list_targets().await?;
            known.extend(existing.iter().copied());
            tracing::info!(list, existing = existing.len(), "farm list opened");

            let room = (opts.max_targets_per_list as usize).saturating_sub(existing.len());
            if room == 0 {
                if changed > 0 {
                    self.ui.save_list().await?;
                }
                report.lists.push(ListReport {
                    list_name: list.to_string(),
                    added_count: 0,
                    existing_count: existing.len(),
                    is_full: true,
                });
                continue;
            }

            let quota = room.min(wanted - report.added.len());
            let mut added_here = 0;
            while added_here < quota && cursor < candidates.len() {
                let candidate = &candidates[cursor];
                cursor += 1;
                if known.contains(&candidate.coord) {
                    continue;
                }
                let Some(info) = self.inspect(candidate.coord).await? else {
                    continue;
                };
                if ceiling.is_some_and(|max| info.population >= max) {
                    continue;
                }
                if self.add(candidate.coord, list, opts.rally_slot, &info).await? {
                    known.insert(candidate.coord);
                    tracing::info!(
                        coord = %candidate.coord,
                        population = info.population,
                        distance = candidate.distance.unwrap_or_default(),
                        list,
                        "target added"
                    );
                    report.added.push(FarmTarget {
                        population: Some(info.population),
                        list_name: Some(list.to_string()),
                        ..candidate.clone()
                    });
                    added_here += 1;
                }
            }

            self.ui.open_list(list, opts.rally_slot, false).await?;
            self.ui.set_troops_all(opts.troops_t1).await?;
            self.ui.save_list().await?;
            report.lists.push(ListReport {
                list_name: list.to_string(),
                added_count: added_here,
                existing_count: existing.len(),
                is_full: added_here >= room,
            });
            if cursor >= candidates.len() {
                break;
            }
        }

        tracing::info!(
            added = report.added_count(),
            lists = report.lists.len(),
            "farm list run finished"
        );
        Ok(report)
    }

    /// Applies the troop count to every existing list without adding targets.
    async fn refresh_troops(
        &self,
        opts: &FarmOptions,
        entries: &[ListEntry],
        report: &mut FarmRunReport,
    ) -> Result<(), FarmError> {
        for entry in entries.iter().filter(|e| e.exists) {
            let list = entry.name.as_str();
            if !self.ui.open_list(list, opts.rally_slot, false).await? {
                tracing::warn!(list, "farm list could not be opened");
                continue;
            }
            let changed = self.ui.set_troops_all(opts.troops_t1).await?;
            self.ui.save_list().await?;
            let existing = self.ui.list_targets().await?.len();
            tracing::info!(list, changed, "troops refreshed");
            report.lists.push(ListReport {
                list_name: list.to_string(),
                added_count: 0,
                existing_count: existing,
                is_full: existing >= opts.max_targets_per_list as usize,
            });
        }
        Ok(())
    }

    /// Tile detail, or `None` when it cannot be read; only a closed session is fatal.
    async fn inspect(&self, coord: Coord) -> Result<Option<TileInfo>, FarmError> {
        match self.ui.tile_info(coord).await {
            Ok(info) => Ok(info),
            Err(e) if e.is_session_closed() => Err(e.into()),
            Err(e) => {
                tracing::warn!(%coord, error = %e, "map tile read failed");
                Ok(None)
            }
        }
    }

    async fn add(
        &self,
        coord: Coord,
        list: &str,
        rally_slot: Option<u32>,
        info: &TileInfo,
    ) -> Result<bool, FarmError> {
        match self.try_add(coord, list, rally_slot, info).await {
            Ok(true) => Ok(true),
            Ok(false) => {
                tracing::warn!(%coord, list, "target could not be added");
                Ok(false)
            }
            Err(e) if e.is_session_closed() => Err(e.into()),
            Err(e) => {
                tracing::warn!(%coord, list, error = %e, "target could not be added");
                Ok(false)
            }
        }
    }

    /// Map detail first, then the list's own form.
    async fn try_add(
        &self,
        coord: Coord,
        list: &str,
        rally_slot: Option<u32>,
        info: &TileInfo,
    ) -> Result<bool, PageError> {
        if self.ui.add_from_map(coord, list).await? {
            return Ok(true);
        }
        if !self.ui.open_list(list, rally_slot, false).await? {
            return Ok(false);
        }
        self.ui.add_target(coord, info.name.as_deref()).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::sync::Mutex;

    #[derive(Default)]
    struct FakeFarm {
        lists: Mutex<Vec<(String, Vec<Coord>)>>,
        open: Mutex<Option<String>>,
        tiles: HashMap<Coord, TileInfo>,
        troops_set: Mutex<Vec<(String, u32)>>,
        saved: Mutex<Vec<String>>,
        map_center: Option<Coord>,
        /// Targets whose add form never confirms.
        unconfirmed: Vec<Coord>,
    }

    impl FakeFarm {
        fn with_lists(lists: &[(&str, &[Coord])]) -> Self {
            Self {
                lists: Mutex::new(
                    lists
                        .iter()
                        .map(|(n, c)| (n.to_string(), c.to_vec()))
                        .collect(),
                ),
                ..Default::default()
            }
        }

        fn village(mut self, coord: Coord, population: u32) -> Self {
            self.tiles.insert(
                coord,
                TileInfo {
                    population,
                    name: Some(format!("Aldea {coord}")),
                },
            );
            self
        }

        fn targets_of(&self, name: &str) -> Vec<Coord> {
            self.lists
                .lock()
                .unwrap()
                .iter()
                .find(|(n, _)| n == name)
                .map(|(_, c)| c.clone())
                .unwrap_or_default()
        }
    }

    #[async_trait]
    impl FarmUi for FakeFarm {
        fn is_closed(&self) -> bool {
            false
        }

        async fn detect_center(&self) -> Result<Option<Coord>, PageError> {
            Ok(self.map_center)
        }

        async fn tile_info(&self, coord: Coord) -> Result<Option<TileInfo>, PageError> {
            Ok(self.tiles.get(&coord).cloned())
        }

        async fn add_from_map(&self, _coord: Coord, _list: &str) -> Result<bool, PageError> {
            Ok(false)
        }

        async fn open_farm_tab(&self, _rally_slot: Option<u32>) -> Result<bool, PageError> {
            Ok(true)
        }

        async fn list_names(&self) -> Result<Vec<String>, PageError> {
            Ok(self.lists.lock().unwrap().iter().map(|(n, _)| n.clone()).collect())
        }

        async fn open_list(&self, name: &str, _rally: Option<u32>, create: bool) -> Result<bool, PageError> {
            let mut lists = self.lists.lock().unwrap();
            if !lists.iter().any(|(n, _)| n == name) {
                if !create {
                    return Ok(false);
                }
                lists.push((name.to_string(), Vec::new()));
            }
            *self.open.lock().unwrap() = Some(name.to_string());
            Ok(true)
        }

        async fn list_targets(&self) -> Result<Vec<Coord>, PageError> {
            let open = self.open.lock().unwrap().clone().unwrap_or_default();
            Ok(self.targets_of(&open))
        }

        async fn add_target(&self, coord: Coord, _name: Option<&str>) -> Result<bool, PageError> {
            if self.unconfirmed.contains(&coord) {
                return Ok(false);
            }
            let open = self.open.lock().unwrap().clone().unwrap_or_default();
            let mut lists = self.lists.lock().unwrap();
            let Some((_, targets)) = lists.iter_mut().find(|(n, _)| *n == open) else {
                return Ok(false);
            };
            targets.push(coord);
            Ok(true)
        }

        async fn set_troops_all(&self, t1: u32) -> Result<usize, PageError> {
            let open = self.open.lock().unwrap().clone().unwrap_or_default();
            let n = self.targets_of(&open).len();
            self.troops_set.lock().unwrap().push((open, t1));
            Ok(n)
        }

        async fn save_list(&self) -> Result<bool, PageError> {
            let open = self.open.lock().unwrap().clone().unwrap_or_default();
            self.saved.lock().unwrap().push(open);
            Ok(true)
        }
    }

    struct StaticFeed(Vec<Coord>);

    #[async_trait]
    impl CoordFeed for StaticFeed {
        async fn fetch(&self, limit: usize) -> Result<Vec<Coord>, FeedError> {
            Ok(self.0.iter().copied().take(limit).collect())
        }
    }

    fn origin_opts() -> FarmOptions {
        FarmOptions {
            center: Some(Coord::new(0, 0)),
            max_distance: 3.0,
            ..Default::default()
        }
    }

    #[test]
    fn radial_scan_is_sorted_and_bounded() {
        let coords = radial_coords(Coord::new(10, -5), 1.5);
        assert_eq!(coords.len(), 8);
        assert_eq!(coords[0].distance, Some(1.0));
        assert!(coords.iter().all(|t| t.coord != Coord::new(10, -5)));
        assert!(coords.windows(2).all(|w| w[0].distance <= w[1].distance));
        assert!(radial_coords(Coord::new(0, 0), 0.0).is_empty());
    }

    #[test]
    fn feed_candidates_respect_distance_band() {
        let coords = [Coord::new(5, 0), Coord::new(1, 0), Coord::new(30, 0), Coord::new(0, 2)];
        let ranked = rank_feed_candidates(Coord::new(0, 0), &coords, 2.0, 10.0);
        let got: Vec<Coord> = ranked.iter().map(|t| t.coord).collect();
        assert_eq!(got, vec![Coord::new(0, 2), Coord::new(5, 0)]);
    }

    #[test]
    fn list_sequence_continues_hyphen_numbering() {
        let existing = vec!["raid".to_string(), "raid-3".to_string(), "raid-2".to_string(), "otra".to_string()];
        let names: Vec<String> = build_list_sequence("Raid", &existing, 5)
            .into_iter()
            .map(|e| e.name)
            .collect();
        assert_eq!(names, vec!["raid", "raid-2", "raid-3", "raid-4", "raid-5"]);
    }

    #[test]
    fn list_sequence_falls_back_to_numeric_names() {
        let existing = vec!["7".to_string(), "3".to_string()];
        let seq = build_list_sequence("raid", &existing, 4);
        assert_eq!(
            seq,
            vec![
                ListEntry { name: "raid".into(), exists: false },
                ListEntry { name: "3".into(), exists: true },
                ListEntry { name: "7".into(), exists: true },
                ListEntry { name: "8".into(), exists: false },
            ]
        );
        let fresh = build_list_sequence("raid", &[], 3);
        assert_eq!(fresh[2].name, "raid-3");
        assert_eq!(build_list_sequence("raid", &[], 1).len(), 1);
    }

    #[tokio::test]
    async fn single_list_fills_up_to_capacity_and_filters_population() {
        let ui = FakeFarm::with_lists(&[("raid", &[Coord::new(1, 0)])])
            .village(Coord::new(0, 1), 20)
            .village(Coord::new(-1, 0), 80)
            .village(Coord::new(0, -1), 49)
            .village(Coord::new(1, 1), 10);
        let opts = FarmOptions {
            max_targets_per_list: 3,
            total_targets: 3,
            ..origin_opts()
        };
        let report = FarmBuilder::new(&ui).run(&opts).await.unwrap();

        assert_eq!(report.added_count(), 2);
        assert_eq!(
            ui.targets_of("raid"),
            vec![Coord::new(1, 0), Coord::new(0, -1), Coord::new(0, 1)]
        );
        assert_eq!(report.lists[0].existing_count, 1);
        assert!(report.lists[0].is_full);
        assert_eq!(ui.saved.lock().unwrap().as_slice(), ["raid"]);
        assert!(ui.troops_set.lock().unwrap().iter().all(|(_, t)| *t == 2));
    }

    #[tokio::test]
    async fn duplicates_across_lists_are_never_added_twice() {
        let ui = FakeFarm::with_lists(&[("raid", &[Coord::new(1, 0)]), ("raid-2", &[Coord::new(0, 1)])])
            .village(Coord::new(1, 0), 5)
            .village(Coord::new(0, 1), 5)
            .village(Coord::new(-1, 0), 5)
            .village(Coord::new(0, -1), 5);
        let opts = FarmOptions {
            max_targets_per_list: 2,
            total_targets: 10,
            max_lists: 3,
            ..origin_opts()
        };
        let report = FarmBuilder::new(&ui).run(&opts).await.unwrap();

        let mut all: Vec<Coord> = ["raid", "raid-2", "raid-3"]
            .iter()
            .flat_map(|n| ui.targets_of(n))
            .collect();
        let total = all.len();
        all.sort();
        all.dedup();
        assert_eq!(all.len(), total);
        assert_eq!(total, 4);
        assert_eq!(report.added_count(), 2);
        assert!(report.added.iter().all(|t| t.coord != Coord::new(1, 0) && t.coord != Coord::new(0, 1)));
    }

    #[tokio::test]
    async fn unconfirmed_adds_are_not_counted() {
        let mut ui = FakeFarm::with_lists(&[("raid", &[])])
            .village(Coord::new(0, 1), 5)
            .village(Coord::new(1, 0), 5);
        ui.unconfirmed = vec![Coord::new(0, 1)];
        let opts = FarmOptions {
            total_targets: 5,
            ..origin_opts()
        };
        let report = FarmBuilder::new(&ui).run(&opts).await.unwrap();

        assert_eq!(report.added_count(), 1);
        assert_eq!(report.added[0].coord, Coord::new(1, 0));
        assert_eq!(report.lists[0].added_count, 1);
    }

    #[tokio::test]
    async fn full_list_still_refreshes_troops() {
        let ui = FakeFarm::with_lists(&[("raid", &[Coord::new(1, 0), Coord::new(2, 0)])]).village(Coord::new(0, 1), 5);
        let opts = FarmOptions {
            max_targets_per_list: 2,
            total_targets: 2,
            troops_t1: 7,
            ..origin_opts()
        };
        let report = FarmBuilder::new(&ui).run(&opts).await.unwrap();
        assert_eq!(report.added_count(), 0);
        assert!(report.lists[0].is_full);
        assert_eq!(ui.troops_set.lock().unwrap()[0], ("raid".to_string(), 7));
    }

    #[tokio::test]
    async fn feed_source_verifies_against_map() {
        let ui = FakeFarm::with_lists(&[("raid", &[])])
            .village(Coord::new(3, 0), 300)
            .village(Coord::new(6, 0), 15);
        let feed = StaticFeed(vec![Coord::new(3, 0), Coord::new(4, 0), Coord::new(6, 0), Coord::new(40, 0)]);
        let opts = FarmOptions {
            source: FarmSource::InactiveSearch,
            max_distance: 20.0,
            total_targets: 5,
            ..origin_opts()
        };
        let report = FarmBuilder::new(&ui).with_feed(&feed).run(&opts).await.unwrap();
        // no ceiling: both readable villages qualify, the unreadable tile does not
        assert_eq!(ui.targets_of("raid"), vec![Coord::new(3, 0), Coord::new(6, 0)]);
        assert_eq!(report.candidates, 3);

        let missing = FarmBuilder::new(&ui).run(&opts).await.unwrap_err();
        assert!(matches!(missing, FarmError::FeedMissing));
    }

    #[tokio::test]
    async fn center_comes_from_map_or_fails() {
        let mut ui = FakeFarm::with_lists(&[("raid", &[])]);
        let opts = FarmOptions {
            center: None,
            total_targets: 0,
            ..Default::default()
        };
        assert!(matches!(
            FarmBuilder::new(&ui).run(&opts).await,
            Err(FarmError::CenterNotFound)
        ));
        ui.map_center = Some(Coord::new(-81, 71));
        let report = FarmBuilder::new(&ui).run(&opts).await.unwrap();
        assert_eq!(report.center, Coord::new(-81, 71));
        assert_eq!(report.center_source, CenterSource::Map);
        assert_eq!(report.added_count(), 0);
    }

    #[tokio::test]
    async fn zero_target_run_still_refreshes_troops() {
        let ui = FakeFarm::with_lists(&[("raid", &[Coord::new(1, 0)])]).village(Coord::new(0, 1), 5);
        let opts = FarmOptions {
            total_targets: 0,
            troops_t1: 4,
            ..origin_opts()
        };
        let report = FarmBuilder::new(&ui).run(&opts).await.unwrap();

        assert_eq!(report.added_count(), 0);
        assert_eq!(report.candidates, 0);
        assert_eq!(ui.targets_of("raid"), vec![Coord::new(1, 0)]);
        assert_eq!(ui.troops_set.lock().unwrap().as_slice(), [("raid".to_string(), 4)]);
        assert_eq!(ui.saved.lock().unwrap().as_slice(), ["raid"]);
        assert_eq!(report.lists[0].existing_count, 1);
    }
}

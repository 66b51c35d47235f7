use crate::cache::VillageCache;
use crate::dom::ElementSnapshot;
use crate::normalize::{classify_building, classify_resource, contains_any, first_number, name_tokens, normalize, token_match};
use crate::page::PageError;
use crate::selector::{select_lowest_field, ResourceAmounts};
use async_trait::async_trait;
use farmhand_protocol::{BuildReason, BuildTask, BuildingKind, TaskStatus};
use regex::Regex;
use serde::Serialize;
use std::sync::LazyLock;

const UPGRADE_KEYWORDS: [&str; 9] = [
    "mejorar", "ampliar", "subir", "upgrade", "improve", "construir", "build", "ausbauen", "nivel",
];

/// Premium, protection and dialog controls that must never be clicked.
const BLACKLIST: [&str; 20] = [
    "oro", "gold", "npc", "intercambiar", "exchange", "video", "prolong", "prorrogar", "proteger",
    "protecc", "protection", "plus", "premium", "activar", "comprar", "confirmar", "cancelar",
    "aventura", "mision", "adventure",
];

const UPGRADE_CLASSES: [&str; 3] = ["build", "upgrade", "contract"];

const EMPTY_PLOT_WORDS: [&str; 4] = ["construir", "build new", "bauplatz", "construct new"];

const LEVEL_WORDS: [&str; 4] = ["nivel", "level", "stufe", "niveau"];

static EMPTY_CLASS: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\b(gid0|aid0)\b").expect("Invalid regex"));
static ONCLICK_URL: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"(?:location\.href|href|location)\s*=\s*['"]([^'"]+)['"]"#).expect("Invalid regex")
});
static TIMER: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\d{1,2}:\d{2}").expect("Invalid regex"));

/// What the detail view of one slot says about it.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct BuildingInfo {
    pub name: String,
    pub level: u32,
    /// Nothing is built on the plot yet.
    pub empty: bool,
}

/// The control that starts an upgrade on the open slot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpgradeControl {
    pub index: usize,
    /// Some skins encode the upgrade as a link; following it beats a click.
    pub action_url: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpgradeAttempt {
    Started,
    QueueFull,
    NotEnoughResources,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueCheck {
    Queued,
    /// The queue was readable and does not mention the slot.
    NotQueued,
    /// No queue markup was found at all.
    Unknown,
    QueueFull,
    NotEnoughResources,
}

/// Page-side operations of a construction.
#[async_trait]
pub trait BuildUi: Send + Sync {
    fn is_closed(&self) -> bool;

    async fn resource_amounts(&self) -> Result<ResourceAmounts, PageError>;

    /// Slot of a building in the village centre, if it is there.
    async fn locate_building(&self, kind: BuildingKind) -> Result<Option<u32>, PageError>;

    async fn open_slot(&self, slot: u32) -> Result<(), PageError>;

    async fn building_info(&self) -> Result<BuildingInfo, PageError>;

    /// On an empty plot, opens the construction offer for `name`.
    async fn choose_building(&self, name: &str) -> Result<bool, PageError>;

    async fn attempt_upgrade(&self) -> Result<UpgradeAttempt, PageError>;

    async fn verify_queued(&self, slot: u32, name: &str) -> Result<QueueCheck, PageError>;
}

/// Result of one build attempt, and what should be persisted for the task.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BuildOutcome {
    pub task_id: String,
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<BuildReason>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub slot: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub new_level: Option<u32>,
    /// Status to write back; `None` keeps the task pending.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<TaskStatus>,
}

impl BuildOutcome {
    fn started(task: &BuildTask, slot: u32, new_level: Option<u32>, completed: bool) -> Self {
        Self {
            task_id: task.id.clone(),
            success: true,
            reason: None,
            slot: Some(slot),
            new_level,
            status: completed.then_some(TaskStatus::Completed),
        }
    }

    fn failed(task: &BuildTask, slot: Option<u32>, reason: BuildReason) -> Self {
        let status = match reason {
            BuildReason::CompletedAlready => Some(TaskStatus::Completed),
            BuildReason::NameMismatch => Some(TaskStatus::Skipped),
            _ => None,
        };
        Self {
            task_id: task.id.clone(),
            success: false,
            reason: Some(reason),
            slot,
            new_level: None,
            status,
        }
    }

    fn from_page_error(task: &BuildTask, slot: Option<u32>, err: &PageError) -> Self {
        if err.is_session_closed() {
            return Self::failed(task, slot, BuildReason::BrowserClosed);
        }
        tracing::error!(task = %task.label(), error = %err, "build attempt failed");
        Self::failed(task, slot, BuildReason::Error)
    }
}

/// Reads the header of a slot view: `"Cuartel Nivel 3"` gives `("Cuartel", 3)`.
pub fn parse_building_info(title: Option<&str>, body_class: &str) -> BuildingInfo {
    let empty_class = EMPTY_CLASS.is_match(body_class);

    let raw = title.unwrap_or_default().trim();
    let level = first_number(raw).unwrap_or(0);
    let mut name: String = match raw.find(|c: char| c.is_ascii_digit()) {
        Some(start) => {
            let end = raw[start..]
                .find(|c: char| !c.is_ascii_digit())
                .map_or(raw.len(), |i| start + i);
            format!("{}{}", &raw[..start], &raw[end..])
        }
        None => raw.to_string(),
    };
    name = name.split_whitespace().collect::<Vec<_>>().join(" ");
    if let Some((head, last)) = name.rsplit_once(' ') {
        if LEVEL_WORDS.contains(&normalize(last).as_str()) {
            name = head.to_string();
        }
    }

    BuildingInfo {
        empty: empty_class || contains_any(&normalize(raw), &EMPTY_PLOT_WORDS),
        name,
        level,
    }
}

fn action_url(el: &ElementSnapshot) -> Option<String> {
    if let Some(href) = el.attr("href") {
        if href.contains("action=build") {
            return Some(href.to_string());
        }
    }
    let onclick = el.attr("onclick")?;
    if !onclick.contains("action=build") {
        return None;
    }
    ONCLICK_URL.captures(onclick).map(|c| c[1].to_string())
}

/// First enabled upgrade control, preferring ones inside the upgrade containers.
pub fn choose_upgrade_control(controls: &[ElementSnapshot]) -> Option<UpgradeControl> {
    let scoped = controls.iter().filter(|c| c.in_context);
    let loose = controls.iter().filter(|c| !c.in_context);
    scoped.chain(loose).find_map(|el| {
        if el.is_disabled() {
            return None;
        }
        let class = normalize(&el.class);
        if class.contains("gold") {
            return None;
        }
        let label = format!("{} {}", el.label(), normalize(el.attr("title").unwrap_or_default()));
        if contains_any(&label, &BLACKLIST) {
            return None;
        }
        if !contains_any(&label, &UPGRADE_KEYWORDS) && !contains_any(&class, &UPGRADE_CLASSES) {
            return None;
        }
        Some(UpgradeControl {
            index: el.index,
            action_url: action_url(el),
        })
    })
}

/// Judges the page after an upgrade click.
///
/// `entries` are the texts of the construction queue rows; `linked_slots`
/// the slot ids their links point to.
pub fn queue_check(
    error_banner: Option<&str>,
    queue_full_marker: bool,
    entries: &[String],
    linked_slots: &[u32],
    slot: u32,
    name: &str,
) -> QueueCheck {
    if let Some(banner) = error_banner.map(normalize) {
        if (banner.contains("cola") && banner.contains("llena"))
            || (banner.contains("queue") && banner.contains("full"))
        {
            return QueueCheck::QueueFull;
        }
        if contains_any(&banner, &["recurs", "resource", "madera", "barro", "arcilla"]) {
            return QueueCheck::NotEnoughResources;
        }
    }
    if queue_full_marker {
        return QueueCheck::QueueFull;
    }
    if linked_slots.contains(&slot) {
        return QueueCheck::Queued;
    }
    if entries.is_empty() {
        return QueueCheck::Unknown;
    }

    let target = normalize(name);
    let tokens = name_tokens(&target);
    let named = entries.iter().map(|e| normalize(e)).any(|entry| {
        if !target.is_empty() && entry.contains(&target) {
            return true;
        }
        let hits = tokens.iter().filter(|t| token_match(&entry, t)).count();
        !tokens.is_empty() && (hits == tokens.len() || (hits > 0 && TIMER.is_match(&entry)))
    });
    if named {
        QueueCheck::Queued
    } else {
        QueueCheck::NotQueued
    }
}

/// Same building by name: equal, one containing the other, or the same kind.
/// An unreadable page name agrees with nothing.
fn names_agree(expected: &str, actual: &str) -> bool {
    let (e, a) = (normalize(expected), normalize(actual));
    if e.is_empty() {
        return true;
    }
    if a.is_empty() {
        return false;
    }
    if e == a || e.contains(&a) || a.contains(&e) {
        return true;
    }
    match (classify_building(&e), classify_building(&a)) {
        (Some(x), Some(y)) => x == y,
        _ => classify_resource(&e).is_some() && classify_resource(&e) == classify_resource(&a),
    }
}

#[derive(Debug, Clone)]
pub struct BuildExecutor {
    /// Read the queue after a click and trust only what it shows.
    pub verify: bool,
}

impl Default for BuildExecutor {
    fn default() -> Self {
        Self { verify: true }
    }
}

impl BuildExecutor {
    /// Runs one build task. Resource-typed tasks go through the field
    /// selector over every resource task in `batch`, so the attempted task
    /// may be a different one; `BuildOutcome::task_id` names it.
    pub async fn execute<U: BuildUi + ?Sized>(
        &self,
        ui: &U,
        cache: &mut VillageCache,
        task: &BuildTask,
        batch: &[BuildTask],
        amounts: &ResourceAmounts,
    ) -> BuildOutcome {
        if ui.is_closed() {
            return BuildOutcome::failed(task, None, BuildReason::BrowserClosed);
        }
        if task.is_resource_task() {
            self.build_field(ui, cache, task, batch, amounts).await
        } else {
            self.build_structure(ui, task).await
        }
    }

    async fn build_field<U: BuildUi + ?Sized>(
        &self,
        ui: &U,
        cache: &mut VillageCache,
        task: &BuildTask,
        batch: &[BuildTask],
        amounts: &ResourceAmounts,
    ) -> BuildOutcome {
        if !cache.is_valid() {
            return BuildOutcome::failed(task, None, BuildReason::ScanFailed);
        }
        let mut pool: Vec<BuildTask> = batch.iter().filter(|t| t.is_resource_task()).cloned().collect();
        if !pool.iter().any(|t| t.id == task.id) {
            pool.push(task.clone());
        }

        let Some(pick) = select_lowest_field(cache, &pool, amounts) else {
            let kind_done = cache.fields().is_some_and(|fields| {
                fields
                    .iter()
                    .filter(|f| Some(f.kind) == task.building_type)
                    .all(|f| f.level >= task.target_level)
            });
            let reason = if kind_done {
                BuildReason::CompletedAlready
            } else {
                BuildReason::FieldsBusy
            };
            return BuildOutcome::failed(task, None, reason);
        };
        let chosen = pick.task.clone();
        let (slot, kind, target) = (pick.slot, pick.kind, pick.target_level);

        if let Err(e) = ui.open_slot(slot).await {
            return BuildOutcome::from_page_error(&chosen, Some(slot), &e);
        }
        let info = match ui.building_info().await {
            Ok(info) => info,
            Err(e) => return BuildOutcome::from_page_error(&chosen, Some(slot), &e),
        };
        if classify_resource(&info.name).is_some_and(|seen| seen != kind) {
            tracing::warn!(slot, expected = %kind, seen = %info.name, "field cache is stale");
            cache.invalidate();
            return BuildOutcome::failed(&chosen, Some(slot), BuildReason::ScanFailed);
        }

        match self.upgrade_and_verify(ui, slot, &info.name).await {
            Ok(None) => {
                let new_level = cache.update_field_level(slot, true);
                let completed = cache.fields().is_some_and(|fields| {
                    fields
                        .iter()
                        .filter(|f| f.kind == kind)
                        .all(|f| f.level >= target)
                });
                BuildOutcome::started(&chosen, slot, new_level, completed)
            }
            Ok(Some(reason)) => BuildOutcome::failed(&chosen, Some(slot), reason),
            Err(e) => BuildOutcome::from_page_error(&chosen, Some(slot), &e),
        }
    }

    async fn build_structure<U: BuildUi + ?Sized>(&self, ui: &U, task: &BuildTask) -> BuildOutcome {
        let slot = match self.resolve_slot(ui, task).await {
            Ok(Some(slot)) => slot,
            Ok(None) => return BuildOutcome::failed(task, None, BuildReason::BuildingNotFound),
            Err(e) => return BuildOutcome::from_page_error(task, None, &e),
        };
        match self.build_at(ui, task, slot).await {
            Ok(outcome) => outcome,
            Err(e) => BuildOutcome::from_page_error(task, Some(slot), &e),
        }
    }

    async fn resolve_slot<U: BuildUi + ?Sized>(
        &self,
        ui: &U,
        task: &BuildTask,
    ) -> Result<Option<u32>, PageError> {
        if let Some(slot) = task.building_slot {
            return Ok(Some(slot));
        }
        let Some(kind) = task.building_name.as_deref().and_then(classify_building) else {
            return Ok(None);
        };
        ui.locate_building(kind).await
    }

    async fn build_at<U: BuildUi + ?Sized>(
        &self,
        ui: &U,
        task: &BuildTask,
        slot: u32,
    ) -> Result<BuildOutcome, PageError> {
        ui.open_slot(slot).await?;
        let mut info = ui.building_info().await?;
        let wanted = task.building_name.as_deref().unwrap_or_default();
        if !info.empty && info.name.trim().is_empty() {
            info = ui.building_info().await?;
            if !wanted.is_empty() && info.name.trim().is_empty() {
                tracing::warn!(slot, expected = wanted, "building header unreadable");
                return Ok(BuildOutcome::failed(task, Some(slot), BuildReason::BuildingNotFound));
            }
        }

        let (name, level) = if info.empty {
            if wanted.is_empty() {
                return Ok(BuildOutcome::failed(task, Some(slot), BuildReason::BuildingNotFound));
            }
            if !ui.choose_building(wanted).await? {
                return Ok(BuildOutcome::failed(
                    task,
                    Some(slot),
                    BuildReason::BuildingChoiceNotFound,
                ));
            }
            tracing::info!(slot, building = wanted, "constructing on empty plot");
            (wanted.to_string(), 0)
        } else {
            if !wanted.is_empty() && !names_agree(wanted, &info.name) {
                tracing::warn!(slot, expected = wanted, found = %info.name, "building name mismatch");
                return Ok(BuildOutcome::failed(task, Some(slot), BuildReason::NameMismatch));
            }
            if info.level >= task.target_level {
                return Ok(BuildOutcome::failed(task, Some(slot), BuildReason::CompletedAlready));
            }
            (info.name.clone(), info.level)
        };

        Ok(match self.upgrade_and_verify(ui, slot, &name).await? {
            None => {
                let new_level = level + 1;
                BuildOutcome::started(task, slot, Some(new_level), new_level >= task.target_level)
            }
            Some(reason) => BuildOutcome::failed(task, Some(slot), reason),
        })
    }

    /// `None` when the upgrade was started; the failure reason otherwise.
    async fn upgrade_and_verify<U: BuildUi + ?Sized>(
        &self,
        ui: &U,
        slot: u32,
        name: &str,
    ) -> Result<Option<BuildReason>, PageError> {
        match ui.attempt_upgrade().await? {
            UpgradeAttempt::Started => {}
            UpgradeAttempt::QueueFull => return Ok(Some(BuildReason::QueueFull)),
            UpgradeAttempt::NotEnoughResources => return Ok(Some(BuildReason::NotEnoughResources)),
        }
        if !self.verify {
            return Ok(None);
        }
        Ok(match ui.verify_queued(slot, name).await? {
            QueueCheck::Queued | QueueCheck::Unknown => None,
            QueueCheck::NotQueued => {
                tracing::warn!(slot, name, "upgrade clicked but not visible in the queue");
                Some(BuildReason::NotQueued)
            }
            QueueCheck::QueueFull => Some(BuildReason::QueueFull),
            QueueCheck::NotEnoughResources => Some(BuildReason::NotEnoughResources),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::sample_fields;
    use farmhand_protocol::ResourceKind;
    use std::collections::HashMap;
    use std::sync::Mutex;
    use tokio::time::Instant;

    #[derive(Default)]
    struct FakeBuild {
        pages: HashMap<u32, BuildingInfo>,
        located: Option<u32>,
        attempt: Option<UpgradeAttempt>,
        check: Option<QueueCheck>,
        choice_ok: bool,
        opened: Mutex<Vec<u32>>,
        info_reads: Mutex<u32>,
        closed: bool,
    }

    #[async_trait]
    impl BuildUi for FakeBuild {
        fn is_closed(&self) -> bool {
            self.closed
        }

        async fn resource_amounts(&self) -> Result<ResourceAmounts, PageError> {
            Ok(ResourceAmounts::new())
        }

        async fn locate_building(&self, _kind: BuildingKind) -> Result<Option<u32>, PageError> {
            Ok(self.located)
        }

        async fn open_slot(&self, slot: u32) -> Result<(), PageError> {
            self.opened.lock().unwrap().push(slot);
            Ok(())
        }

        async fn building_info(&self) -> Result<BuildingInfo, PageError> {
            let slot = *self.opened.lock().unwrap().last().unwrap();
            *self.info_reads.lock().unwrap() += 1;
            Ok(self.pages.get(&slot).cloned().unwrap_or_default())
        }

        async fn choose_building(&self, _name: &str) -> Result<bool, PageError> {
            Ok(self.choice_ok)
        }

        async fn attempt_upgrade(&self) -> Result<UpgradeAttempt, PageError> {
            Ok(self.attempt.unwrap_or(UpgradeAttempt::Started))
        }

        async fn verify_queued(&self, _slot: u32, _name: &str) -> Result<QueueCheck, PageError> {
            Ok(self.check.unwrap_or(QueueCheck::Queued))
        }
    }

    fn info(name: &str, level: u32) -> BuildingInfo {
        BuildingInfo {
            name: name.into(),
            level,
            empty: false,
        }
    }

    fn resource_task(id: &str, kind: ResourceKind, target: u32) -> BuildTask {
        BuildTask {
            id: id.into(),
            village: None,
            building_type: Some(kind),
            building_slot: None,
            building_name: None,
            target_level: target,
            priority: 50,
            created_at: String::new(),
            status: TaskStatus::Pending,
        }
    }

    fn building_task(slot: Option<u32>, name: &str, target: u32) -> BuildTask {
        BuildTask {
            id: "b1".into(),
            building_type: None,
            building_slot: slot,
            building_name: Some(name.into()),
            ..resource_task("b1", ResourceKind::Wood, target)
        }
    }

    fn crop_village() -> VillageCache {
        use ResourceKind::*;
        let mut levels = vec![(Wood, 5); 4];
        levels.extend([(Clay, 5); 4]);
        levels.extend([(Iron, 5); 4]);
        levels.extend([(Crop, 3), (Crop, 4), (Crop, 3), (Crop, 5), (Crop, 6), (Crop, 6)]);
        let mut cache = VillageCache::new();
        cache.commit(sample_fields(&levels), Instant::now());
        cache
    }

    #[test]
    fn building_header_is_split_into_name_and_level() {
        let i = parse_building_info(Some("Cuartel Nivel 3"), "perspectiveBuildings");
        assert_eq!(i, info("Cuartel", 3));
        let i = parse_building_info(Some("Construir nuevo edificio"), "");
        assert!(i.empty);
        assert!(parse_building_info(Some("x"), "buildingView gid0").empty);
        assert!(!parse_building_info(Some("Granja 2"), "gid04").empty);
    }

    #[test]
    fn upgrade_control_skips_gold_and_disabled() {
        let mk = |index: usize, text: &str, class: &str, scoped: bool| ElementSnapshot {
            index,
            text: text.into(),
            class: class.into(),
            in_context: scoped,
            ..Default::default()
        };
        let controls = vec![
            mk(0, "Mejorar a nivel 4", "green build", false),
            mk(1, "Acabar con oro", "gold", true),
            mk(2, "Mejorar a nivel 4", "green build disabled", true),
            mk(3, "Mejorar a nivel 4", "green build", true),
        ];
        assert_eq!(choose_upgrade_control(&controls).unwrap().index, 3);

        let mut link = mk(5, "Upgrade", "", true);
        link.attrs.insert("href".into(), "build.php?id=4&action=build&c=ab".into());
        assert_eq!(
            choose_upgrade_control(&[link]).unwrap().action_url.as_deref(),
            Some("build.php?id=4&action=build&c=ab")
        );
        assert!(choose_upgrade_control(&[mk(0, "Intercambiar NPC", "build", true)]).is_none());
        assert!(choose_upgrade_control(&[mk(0, "Prolongar protección", "build", true)]).is_none());
        assert!(choose_upgrade_control(&[mk(1, "Activar Plus", "build", true)]).is_none());
        assert!(choose_upgrade_control(&[mk(2, "Confirmar", "green build", true)]).is_none());

        let controls = vec![
            mk(0, "Prolongar protección", "build", true),
            mk(1, "Activar Plus", "build", true),
            mk(2, "Mejorar a nivel 4", "green build", true),
        ];
        assert_eq!(choose_upgrade_control(&controls).unwrap().index, 2);
    }

    #[test]
    fn queue_check_reads_banner_then_queue() {
        let rows = vec!["Cuartel (Nivel 4) 0:12:30".to_string()];
        assert_eq!(
            queue_check(Some("La cola de construcción está llena"), false, &rows, &[], 19, "Cuartel"),
            QueueCheck::QueueFull
        );
        assert_eq!(
            queue_check(Some("Faltan recursos"), false, &[], &[], 19, "Cuartel"),
            QueueCheck::NotEnoughResources
        );
        assert_eq!(queue_check(None, false, &[], &[19], 19, "x"), QueueCheck::Queued);
        assert_eq!(queue_check(None, false, &rows, &[], 19, "Cuartel"), QueueCheck::Queued);
        assert_eq!(queue_check(None, false, &rows, &[], 5, "Granja"), QueueCheck::NotQueued);
        assert_eq!(queue_check(None, false, &[], &[], 5, "Granja"), QueueCheck::Unknown);
    }

    #[tokio::test]
    async fn lowest_crop_field_is_upgraded_and_cached() {
        let mut cache = crop_village();
        let task = resource_task("crop", ResourceKind::Crop, 6);
        let ui = FakeBuild {
            pages: HashMap::from([(13, info("Granja", 3))]),
            ..Default::default()
        };
        let outcome = BuildExecutor::default()
            .execute(&ui, &mut cache, &task, std::slice::from_ref(&task), &ResourceAmounts::new())
            .await;
        assert!(outcome.success);
        assert_eq!(outcome.slot, Some(13));
        assert_eq!(outcome.new_level, Some(4));
        assert_eq!(outcome.status, None);
        assert!(cache.field(13).unwrap().is_building);
        assert_eq!(cache.field(15).unwrap().level, 3);
    }

    #[tokio::test]
    async fn refused_upgrade_leaves_cache_alone() {
        let mut cache = crop_village();
        let task = resource_task("crop", ResourceKind::Crop, 6);
        let ui = FakeBuild {
            attempt: Some(UpgradeAttempt::NotEnoughResources),
            ..Default::default()
        };
        let outcome = BuildExecutor::default()
            .execute(&ui, &mut cache, &task, &[], &ResourceAmounts::new())
            .await;
        assert_eq!(outcome.reason, Some(BuildReason::NotEnoughResources));
        assert_eq!(cache.field(13).unwrap().level, 3);
        assert!(!cache.field(13).unwrap().is_building);
    }

    #[tokio::test]
    async fn finished_type_completes_without_page_calls() {
        let mut cache = crop_village();
        let task = resource_task("crop", ResourceKind::Crop, 3);
        let ui = FakeBuild::default();
        let outcome = BuildExecutor::default()
            .execute(&ui, &mut cache, &task, &[], &ResourceAmounts::new())
            .await;
        assert_eq!(outcome.reason, Some(BuildReason::CompletedAlready));
        assert_eq!(outcome.status, Some(TaskStatus::Completed));
        assert!(ui.opened.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn stale_field_label_invalidates_cache() {
        let mut cache = crop_village();
        let task = resource_task("crop", ResourceKind::Crop, 6);
        let ui = FakeBuild {
            pages: HashMap::from([(13, info("Leñador", 3))]),
            ..Default::default()
        };
        let outcome = BuildExecutor::default()
            .execute(&ui, &mut cache, &task, &[], &ResourceAmounts::new())
            .await;
        assert_eq!(outcome.reason, Some(BuildReason::ScanFailed));
        assert!(!cache.is_valid());
    }

    #[tokio::test]
    async fn building_task_checks_name_and_target() {
        let mut cache = VillageCache::new();
        let ui = FakeBuild {
            pages: HashMap::from([(19, info("Cuartel", 2)), (20, info("Establo", 1))]),
            ..Default::default()
        };
        let exec = BuildExecutor::default();

        let ok = exec
            .execute(&ui, &mut cache, &building_task(Some(19), "Cuartel", 3), &[], &ResourceAmounts::new())
            .await;
        assert!(ok.success);
        assert_eq!(ok.new_level, Some(3));
        assert_eq!(ok.status, Some(TaskStatus::Completed));

        let mismatch = exec
            .execute(&ui, &mut cache, &building_task(Some(20), "Cuartel", 3), &[], &ResourceAmounts::new())
            .await;
        assert_eq!(mismatch.reason, Some(BuildReason::NameMismatch));
        assert_eq!(mismatch.status, Some(TaskStatus::Skipped));
    }

    #[tokio::test]
    async fn upgrade_missing_from_a_readable_queue_stays_pending() {
        let mut cache = VillageCache::new();
        let task = building_task(Some(19), "Cuartel", 3);
        let ui = FakeBuild {
            check: Some(QueueCheck::NotQueued),
            pages: HashMap::from([(19, info("Cuartel", 2))]),
            ..Default::default()
        };
        let outcome = BuildExecutor::default()
            .execute(&ui, &mut cache, &task, &[], &ResourceAmounts::new())
            .await;
        assert!(!outcome.success);
        assert_eq!(outcome.reason, Some(BuildReason::NotQueued));
        assert_eq!(outcome.status, None);
        assert_eq!(outcome.new_level, None);

        let ui = FakeBuild {
            check: Some(QueueCheck::Unknown),
            pages: HashMap::from([(19, info("Cuartel", 2))]),
            ..Default::default()
        };
        let outcome = BuildExecutor::default()
            .execute(&ui, &mut cache, &task, &[], &ResourceAmounts::new())
            .await;
        assert!(outcome.success);
        assert_eq!(outcome.status, Some(TaskStatus::Completed));
    }

    #[tokio::test]
    async fn field_missing_from_the_queue_keeps_its_level() {
        let mut cache = crop_village();
        let task = resource_task("crop", ResourceKind::Crop, 6);
        let ui = FakeBuild {
            check: Some(QueueCheck::NotQueued),
            pages: HashMap::from([(13, info("Granja", 3))]),
            ..Default::default()
        };
        let outcome = BuildExecutor::default()
            .execute(&ui, &mut cache, &task, &[], &ResourceAmounts::new())
            .await;
        assert_eq!(outcome.reason, Some(BuildReason::NotQueued));
        assert_eq!(cache.field(13).unwrap().level, 3);
        assert!(!cache.field(13).unwrap().is_building);
    }

    #[tokio::test]
    async fn empty_header_is_read_again_not_trusted() {
        let mut cache = VillageCache::new();
        let ui = FakeBuild {
            pages: HashMap::from([(19, info("", 2))]),
            ..Default::default()
        };
        let task = building_task(Some(19), "Cuartel", 3);
        let outcome = BuildExecutor::default()
            .execute(&ui, &mut cache, &task, &[], &ResourceAmounts::new())
            .await;
        assert!(!outcome.success);
        assert_eq!(outcome.reason, Some(BuildReason::BuildingNotFound));
        assert_eq!(outcome.status, None);
        assert_eq!(*ui.info_reads.lock().unwrap(), 2);
        assert!(!names_agree("Cuartel", ""));
        assert!(names_agree("", "Cuartel"));
    }

    #[tokio::test]
    async fn building_located_by_name_or_reported_missing() {
        let mut cache = VillageCache::new();
        let exec = BuildExecutor::default();
        let task = building_task(None, "Barracks", 5);

        let missing = exec
            .execute(&FakeBuild::default(), &mut cache, &task, &[], &ResourceAmounts::new())
            .await;
        assert_eq!(missing.reason, Some(BuildReason::BuildingNotFound));
        assert_eq!(missing.status, None);

        let ui = FakeBuild {
            located: Some(19),
            pages: HashMap::from([(19, info("Barracks", 1))]),
            ..Default::default()
        };
        let found = exec.execute(&ui, &mut cache, &task, &[], &ResourceAmounts::new()).await;
        assert!(found.success);
        assert_eq!(found.slot, Some(19));
    }

    #[tokio::test]
    async fn empty_plot_needs_a_matching_offer() {
        let mut cache = VillageCache::new();
        let empty = BuildingInfo {
            empty: true,
            ..Default::default()
        };
        let ui = FakeBuild {
            pages: HashMap::from([(22, empty)]),
            ..Default::default()
        };
        let task = building_task(Some(22), "Establo", 1);
        let outcome = BuildExecutor::default()
            .execute(&ui, &mut cache, &task, &[], &ResourceAmounts::new())
            .await;
        assert_eq!(outcome.reason, Some(BuildReason::BuildingChoiceNotFound));
    }

    #[tokio::test]
    async fn closed_session_is_reported() {
        let mut cache = crop_village();
        let task = resource_task("crop", ResourceKind::Crop, 6);
        let ui = FakeBuild {
            closed: true,
            ..Default::default()
        };
        let outcome = BuildExecutor::default()
            .execute(&ui, &mut cache, &task, &[], &ResourceAmounts::new())
            .await;
        assert_eq!(outcome.reason, Some(BuildReason::BrowserClosed));
    }
}

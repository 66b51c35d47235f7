//! In-memory game and queue used by the runner tests.

use crate::build::{BuildUi, BuildingInfo, QueueCheck, UpgradeAttempt};
use crate::cache::{VillageCache, RESOURCE_SLOTS};
use crate::dom::ElementSnapshot;
use crate::farm::{FarmUi, TileInfo};
use crate::page::PageError;
use crate::scanner::{SlotReading, SlotSource};
use crate::scheduler::{TaskStore, VillageSwitch};
use crate::selector::ResourceAmounts;
use crate::train::TrainUi;
use async_trait::async_trait;
use farmhand_protocol::{BuildTask, BuildingKind, Coord, ResourceKind, TaskStatus, TrainingTask};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Mutex;

/// A village whose 18 fields cycle wood, clay, iron, crop (slot 4 is the
/// first crop field), all at level 1, with a main building at slot 26 and
/// barracks at slot 19 training legionnaires.
pub struct FakeGame {
    fields: Mutex<HashMap<u32, (&'static str, u32)>>,
    pub failing_slot: Option<u32>,
    /// Most units one training order actually adds.
    pub accept_limit: Option<u32>,
    /// Slots whose upgrade is refused for lack of stock.
    pub short_slots: Vec<u32>,
    structures: HashMap<u32, BuildingInfo>,
    amounts: ResourceAmounts,
    attempt: Mutex<UpgradeAttempt>,
    current: Mutex<Option<u32>>,
    opened: Mutex<Vec<u32>>,
    upgraded: Mutex<Vec<u32>>,
    switches: Mutex<Vec<String>>,
    closed: AtomicBool,
    reads: AtomicUsize,
    legionnaires: AtomicU64,
    filled: Mutex<Option<u32>>,
    center_reads: AtomicUsize,
}

impl FakeGame {
    pub fn village() -> Self {
        let mut fields = HashMap::new();
        for slot in 1..=RESOURCE_SLOTS {
            let name = match slot % 4 {
                0 => "Granja",
                1 => "Leñador",
                2 => "Barrera",
                _ => "Mina de hierro",
            };
            fields.insert(slot, (name, 1));
        }
        let mut structures = HashMap::new();
        structures.insert(
            26,
            BuildingInfo {
                name: "Edificio principal".into(),
                level: 3,
                empty: false,
            },
        );
        let amounts = ResourceAmounts::from([
            (ResourceKind::Wood, 500),
            (ResourceKind::Clay, 500),
            (ResourceKind::Iron, 500),
            (ResourceKind::Crop, 50),
        ]);
        Self {
            fields: Mutex::new(fields),
            failing_slot: None,
            accept_limit: None,
            short_slots: Vec::new(),
            structures,
            amounts,
            attempt: Mutex::new(UpgradeAttempt::Started),
            current: Mutex::new(None),
            opened: Mutex::new(Vec::new()),
            upgraded: Mutex::new(Vec::new()),
            switches: Mutex::new(Vec::new()),
            closed: AtomicBool::new(false),
            reads: AtomicUsize::new(0),
            legionnaires: AtomicU64::new(10),
            filled: Mutex::new(None),
            center_reads: AtomicUsize::new(0),
        }
    }

    /// Sets the levels of the crop fields (slots 4, 8, 12, 16).
    pub fn with_crop_levels(self, levels: [u32; 4]) -> Self {
        {
            let mut fields = self.fields.lock().unwrap();
            for (slot, level) in [4, 8, 12, 16].into_iter().zip(levels) {
                fields.insert(slot, ("Granja", level));
            }
        }
        self
    }

    pub fn set_attempt(&self, attempt: UpgradeAttempt) {
        *self.attempt.lock().unwrap() = attempt;
    }

    pub fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }

    pub fn opened(&self) -> Vec<u32> {
        self.opened.lock().unwrap().clone()
    }

    pub fn upgraded(&self) -> Vec<u32> {
        self.upgraded.lock().unwrap().clone()
    }

    pub fn switches(&self) -> Vec<String> {
        self.switches.lock().unwrap().clone()
    }

    pub fn reads(&self) -> usize {
        self.reads.load(Ordering::SeqCst)
    }

    pub fn center_reads(&self) -> usize {
        self.center_reads.load(Ordering::SeqCst)
    }

    pub fn legionnaires(&self) -> u64 {
        self.legionnaires.load(Ordering::SeqCst)
    }

    fn barracks_row(&self) -> ElementSnapshot {
        let mut el = ElementSnapshot {
            index: 0,
            tag: "input".into(),
            context: format!("Legionario\nExistente: {}\n/ 40", self.legionnaires()),
            in_context: true,
            ..Default::default()
        };
        el.attrs.insert("name".into(), "t1".into());
        el.attrs.insert("type".into(), "text".into());
        el
    }
}

#[async_trait]
impl SlotSource for FakeGame {
    async fn read_slot(&self, slot: u32) -> Result<SlotReading, PageError> {
        self.reads.fetch_add(1, Ordering::SeqCst);
        if self.failing_slot == Some(slot) {
            return Err(PageError::Script(format!("slot {slot} did not load")));
        }
        let (name, level) = self.fields.lock().unwrap().get(&slot).copied().unwrap_or(("", 0));
        Ok(SlotReading {
            name: Some(name.to_string()).filter(|n| !n.is_empty()),
            level,
            under_construction: false,
        })
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl BuildUi for FakeGame {
    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    async fn resource_amounts(&self) -> Result<ResourceAmounts, PageError> {
        Ok(self.amounts.clone())
    }

    async fn locate_building(&self, kind: BuildingKind) -> Result<Option<u32>, PageError> {
        Ok((kind == BuildingKind::Barracks).then_some(19))
    }

    async fn open_slot(&self, slot: u32) -> Result<(), PageError> {
        *self.current.lock().unwrap() = Some(slot);
        self.opened.lock().unwrap().push(slot);
        Ok(())
    }

    async fn building_info(&self) -> Result<BuildingInfo, PageError> {
        let Some(slot) = *self.current.lock().unwrap() else {
            return Ok(BuildingInfo::default());
        };
        if let Some(info) = self.structures.get(&slot) {
            return Ok(info.clone());
        }
        let (name, level) = self.fields.lock().unwrap().get(&slot).copied().unwrap_or(("", 0));
        Ok(BuildingInfo {
            name: name.to_string(),
            level,
            empty: name.is_empty(),
        })
    }

    async fn choose_building(&self, _name: &str) -> Result<bool, PageError> {
        Ok(false)
    }

    async fn attempt_upgrade(&self) -> Result<UpgradeAttempt, PageError> {
        let current = *self.current.lock().unwrap();
        if current.is_some_and(|slot| self.short_slots.contains(&slot)) {
            return Ok(UpgradeAttempt::NotEnoughResources);
        }
        let attempt = *self.attempt.lock().unwrap();
        if attempt == UpgradeAttempt::Started {
            if let Some(slot) = current {
                self.upgraded.lock().unwrap().push(slot);
            }
        }
        Ok(attempt)
    }

    async fn verify_queued(&self, _slot: u32, _name: &str) -> Result<QueueCheck, PageError> {
        Ok(QueueCheck::Queued)
    }
}

#[async_trait]
impl TrainUi for FakeGame {
    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    async fn open_building(&self, kind: BuildingKind, slot: Option<u32>) -> Result<Option<u32>, PageError> {
        Ok(slot.or((kind == BuildingKind::Barracks).then_some(19)))
    }

    async fn reload(&self, _slot: u32) -> Result<(), PageError> {
        Ok(())
    }

    async fn troop_inputs(&self) -> Result<Vec<ElementSnapshot>, PageError> {
        Ok(vec![self.barracks_row()])
    }

    async fn queue_entries(&self) -> Result<Vec<ElementSnapshot>, PageError> {
        Ok(Vec::new())
    }

    async fn error_banner(&self) -> Result<Option<String>, PageError> {
        Ok(None)
    }

    async fn fill_quantity(&self, _input: usize, quantity: u32) -> Result<bool, PageError> {
        *self.filled.lock().unwrap() = Some(quantity);
        Ok(true)
    }

    async fn form_buttons(&self, _input: usize) -> Result<Option<Vec<ElementSnapshot>>, PageError> {
        Ok(Some(vec![ElementSnapshot {
            index: 0,
            tag: "button".into(),
            text: "Entrenar".into(),
            ..Default::default()
        }]))
    }

    async fn submit(&self, _input: usize, _button: usize) -> Result<bool, PageError> {
        if let Some(n) = self.filled.lock().unwrap().take() {
            let n = self.accept_limit.map_or(n, |cap| n.min(cap));
            self.legionnaires.fetch_add(u64::from(n), Ordering::SeqCst);
        }
        Ok(true)
    }
}

#[async_trait]
impl FarmUi for FakeGame {
    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    async fn detect_center(&self) -> Result<Option<Coord>, PageError> {
        self.center_reads.fetch_add(1, Ordering::SeqCst);
        Ok(Some(Coord::new(0, 0)))
    }

    async fn tile_info(&self, _coord: Coord) -> Result<Option<TileInfo>, PageError> {
        Ok(None)
    }

    async fn add_from_map(&self, _coord: Coord, _list: &str) -> Result<bool, PageError> {
        Ok(false)
    }

    async fn open_farm_tab(&self, _rally_slot: Option<u32>) -> Result<bool, PageError> {
        Ok(false)
    }

    async fn list_names(&self) -> Result<Vec<String>, PageError> {
        Ok(Vec::new())
    }

    async fn open_list(&self, _name: &str, _rally_slot: Option<u32>, _create: bool) -> Result<bool, PageError> {
        Ok(false)
    }

    async fn list_targets(&self) -> Result<Vec<Coord>, PageError> {
        Ok(Vec::new())
    }

    async fn add_target(&self, _coord: Coord, _name: Option<&str>) -> Result<bool, PageError> {
        Ok(false)
    }

    async fn set_troops_all(&self, _t1: u32) -> Result<usize, PageError> {
        Ok(0)
    }

    async fn save_list(&self) -> Result<bool, PageError> {
        Ok(false)
    }
}

#[async_trait]
impl VillageSwitch for FakeGame {
    async fn switch_village(&self, target: &str, cache: &mut VillageCache) -> Result<bool, PageError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(PageError::Closed);
        }
        self.switches.lock().unwrap().push(target.to_string());
        cache.invalidate();
        Ok(true)
    }
}

/// Queue store kept in memory, ordered the way the SQLite store orders.
#[derive(Default)]
pub struct MemStore {
    builds: Mutex<Vec<BuildTask>>,
    trainings: Mutex<Vec<TrainingTask>>,
}

impl MemStore {
    pub fn resource(id: &str, kind: ResourceKind, target: u32, priority: i64) -> BuildTask {
        BuildTask {
            id: id.into(),
            village: None,
            building_type: Some(kind),
            building_slot: None,
            building_name: None,
            target_level: target,
            priority,
            created_at: String::new(),
            status: TaskStatus::Pending,
        }
    }

    pub fn structure(id: &str, slot: u32, name: &str, target: u32, priority: i64) -> BuildTask {
        BuildTask {
            building_type: None,
            building_slot: Some(slot),
            building_name: Some(name.into()),
            ..Self::resource(id, ResourceKind::Wood, target, priority)
        }
    }

    pub fn training_task(id: &str, building: BuildingKind, troop: &str, quantity: u32, repeat: bool) -> TrainingTask {
        TrainingTask {
            id: id.into(),
            village: None,
            building_type: building,
            building_slot: None,
            troop_name: Some(troop.into()),
            troop_index: None,
            quantity: Some(quantity),
            repeat_forever: repeat,
            repeat_interval: 30,
            priority: 50,
            created_at: String::new(),
            status: TaskStatus::Pending,
            trained_total: 0,
            last_trained_at_ms: None,
        }
    }

    pub fn push_build(&self, task: BuildTask) {
        let mut builds = self.builds.lock().unwrap();
        builds.push(task);
        builds.sort_by_key(|t| std::cmp::Reverse(t.priority));
    }

    pub fn push_training(&self, task: TrainingTask) {
        let mut trainings = self.trainings.lock().unwrap();
        trainings.push(task);
        trainings.sort_by_key(|t| std::cmp::Reverse(t.priority));
    }

    pub fn build_status(&self, id: &str) -> TaskStatus {
        self.builds.lock().unwrap().iter().find(|t| t.id == id).unwrap().status
    }

    pub fn training(&self, id: &str) -> TrainingTask {
        self.trainings.lock().unwrap().iter().find(|t| t.id == id).unwrap().clone()
    }
}

impl TaskStore for MemStore {
    fn pending_builds(&self, limit: usize) -> anyhow::Result<Vec<BuildTask>> {
        let builds = self.builds.lock().unwrap();
        Ok(builds
            .iter()
            .filter(|t| t.status == TaskStatus::Pending)
            .take(limit)
            .cloned()
            .collect())
    }

    fn pending_trainings(&self, limit: usize) -> anyhow::Result<Vec<TrainingTask>> {
        let trainings = self.trainings.lock().unwrap();
        Ok(trainings
            .iter()
            .filter(|t| t.status == TaskStatus::Pending)
            .take(limit)
            .cloned()
            .collect())
    }

    fn set_build_status(&self, id: &str, status: TaskStatus, _note: Option<&str>) -> anyhow::Result<()> {
        if let Some(task) = self.builds.lock().unwrap().iter_mut().find(|t| t.id == id) {
            task.status = status;
        }
        Ok(())
    }

    fn record_training(&self, id: &str, trained: u32, at_ms: i64, complete: bool) -> anyhow::Result<()> {
        if let Some(task) = self.trainings.lock().unwrap().iter_mut().find(|t| t.id == id) {
            task.trained_total += u64::from(trained);
            task.last_trained_at_ms = Some(at_ms);
            if complete {
                task.status = TaskStatus::Completed;
            }
        }
        Ok(())
    }
}

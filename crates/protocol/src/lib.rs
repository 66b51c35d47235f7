use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Returned by the `FromStr` impls when a stored or user-supplied name is not recognized.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnknownName {
    pub kind: &'static str,
    pub value: String,
}

impl fmt::Display for UnknownName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "unknown {}: {:?}", self.kind, self.value)
    }
}

impl std::error::Error for UnknownName {}

fn unknown(kind: &'static str, value: &str) -> UnknownName {
    UnknownName {
        kind,
        value: value.to_string(),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResourceKind {
    Wood,
    Clay,
    Iron,
    Crop,
}

impl ResourceKind {
    pub const ALL: [ResourceKind; 4] = [Self::Wood, Self::Clay, Self::Iron, Self::Crop];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Wood => "wood",
            Self::Clay => "clay",
            Self::Iron => "iron",
            Self::Crop => "crop",
        }
    }
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ResourceKind {
    type Err = UnknownName;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "wood" => Ok(Self::Wood),
            "clay" => Ok(Self::Clay),
            "iron" => Ok(Self::Iron),
            "crop" => Ok(Self::Crop),
            _ => Err(unknown("resource kind", s)),
        }
    }
}

/// Production and infrastructure buildings the bot has to find by itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BuildingKind {
    Barracks,
    Stable,
    Workshop,
    Residence,
    RallyPoint,
}

impl BuildingKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Barracks => "barracks",
            Self::Stable => "stable",
            Self::Workshop => "workshop",
            Self::Residence => "residence",
            Self::RallyPoint => "rally_point",
        }
    }
}

impl fmt::Display for BuildingKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for BuildingKind {
    type Err = UnknownName;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().replace('-', "_").as_str() {
            "barracks" => Ok(Self::Barracks),
            "stable" => Ok(Self::Stable),
            "workshop" => Ok(Self::Workshop),
            "residence" | "palace" => Ok(Self::Residence),
            "rally_point" | "rallypoint" => Ok(Self::RallyPoint),
            _ => Err(unknown("building kind", s)),
        }
    }
}

/// One resource-producing plot as last observed (or optimistically assumed).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldDescriptor {
    pub slot: u32,
    pub kind: ResourceKind,
    pub level: u32,
    /// Set once a construction order for this slot was accepted during the current cache lifetime.
    #[serde(default)]
    pub is_building: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    InProgress,
    Completed,
    Failed,
    Skipped,
}

impl TaskStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::InProgress => "in_progress",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Skipped => "skipped",
        }
    }
}

impl FromStr for TaskStatus {
    type Err = UnknownName;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "in_progress" => Ok(Self::InProgress),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            "skipped" => Ok(Self::Skipped),
            _ => Err(unknown("task status", s)),
        }
    }
}

/// A queued construction request.
///
/// Resource-typed tasks carry `building_type` and leave the slot to the
/// selector; building-typed tasks name a slot and/or a building.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BuildTask {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub village: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub building_type: Option<ResourceKind>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub building_slot: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub building_name: Option<String>,
    pub target_level: u32,
    pub priority: i64,
    pub created_at: String,
    pub status: TaskStatus,
}

impl BuildTask {
    pub fn is_resource_task(&self) -> bool {
        self.building_type.is_some()
    }

    /// Human-readable name used in log lines.
    pub fn label(&self) -> String {
        if let Some(name) = self.building_name.as_deref().filter(|n| !n.trim().is_empty()) {
            return name.to_string();
        }
        if let Some(kind) = self.building_type {
            return kind.to_string();
        }
        match self.building_slot {
            Some(slot) => format!("slot {slot}"),
            None => self.id.clone(),
        }
    }
}

/// Identifies a unit on a training form: by its column index (`t1`, `t2`, ...) or its localized name.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TroopSpec {
    Index(u32),
    Name(String),
}

impl fmt::Display for TroopSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Index(i) => write!(f, "t{i}"),
            Self::Name(n) => f.write_str(n),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrainingTask {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub village: Option<String>,
    pub building_type: BuildingKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub building_slot: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub troop_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub troop_index: Option<u32>,
    /// `None` trains the maximum the form offers.
    #[serde(default)]
    pub quantity: Option<u32>,
    #[serde(default)]
    pub repeat_forever: bool,
    /// Minutes between runs of a repeating task.
    #[serde(default)]
    pub repeat_interval: u32,
    pub priority: i64,
    pub created_at: String,
    pub status: TaskStatus,
    #[serde(default)]
    pub trained_total: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_trained_at_ms: Option<i64>,
}

impl TrainingTask {
    /// Names win over indexes: they survive a tribe's form reordering.
    pub fn troop(&self) -> Option<TroopSpec> {
        if let Some(name) = self.troop_name.as_deref().map(str::trim).filter(|n| !n.is_empty()) {
            return Some(TroopSpec::Name(name.to_string()));
        }
        self.troop_index.map(TroopSpec::Index)
    }

    pub fn is_due(&self, now_ms: i64) -> bool {
        if !self.repeat_forever {
            return true;
        }
        match self.last_trained_at_ms {
            None => true,
            Some(last) => now_ms - last >= i64::from(self.repeat_interval) * 60_000,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Coord {
    pub x: i32,
    pub y: i32,
}

impl Coord {
    pub fn new(x: i32, y: i32) -> Self {
        Self { x, y }
    }

    pub fn distance_to(self, other: Coord) -> f64 {
        let dx = f64::from(other.x - self.x);
        let dy = f64::from(other.y - self.y);
        (dx * dx + dy * dy).sqrt()
    }
}

impl fmt::Display for Coord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({}|{})", self.x, self.y)
    }
}

/// A raid candidate, annotated with what the map told us about it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FarmTarget {
    pub coord: Coord,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub population: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub distance: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub list_name: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BuildReason {
    CompletedAlready,
    QueueFull,
    NotEnoughResources,
    BuildingNotFound,
    BuildingChoiceNotFound,
    NameMismatch,
    /// Every eligible field already has an upgrade running.
    FieldsBusy,
    /// The upgrade was clicked but a readable queue does not show it.
    NotQueued,
    ScanFailed,
    BrowserClosed,
    Error,
}

impl BuildReason {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::CompletedAlready => "completed_already",
            Self::QueueFull => "queue_full",
            Self::NotEnoughResources => "not_enough_resources",
            Self::BuildingNotFound => "building_not_found",
            Self::BuildingChoiceNotFound => "building_choice_not_found",
            Self::NameMismatch => "name_mismatch",
            Self::FieldsBusy => "fields_busy",
            Self::NotQueued => "not_queued",
            Self::ScanFailed => "scan_failed",
            Self::BrowserClosed => "browser_closed",
            Self::Error => "error",
        }
    }

    /// The task stays pending and the cycle moves on to the next one.
    pub fn is_recoverable(self) -> bool {
        matches!(
            self,
            Self::QueueFull
                | Self::NotEnoughResources
                | Self::BuildingNotFound
                | Self::BuildingChoiceNotFound
                | Self::FieldsBusy
        )
    }
}

impl fmt::Display for BuildReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TrainReason {
    NotEnoughResourcesOrZeroMax,
    TrainingNotApplied,
    TrainingNotQueued,
    BuildingNotFound,
    TroopNotFound,
    FormNotFound,
    SubmitButtonNotFound,
    NavigationFailed,
    PageError,
    BrowserClosed,
    Error,
}

impl TrainReason {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::NotEnoughResourcesOrZeroMax => "not_enough_resources_or_zero_max",
            Self::TrainingNotApplied => "training_not_applied",
            Self::TrainingNotQueued => "training_not_queued",
            Self::BuildingNotFound => "building_not_found",
            Self::TroopNotFound => "troop_not_found",
            Self::FormNotFound => "form_not_found",
            Self::SubmitButtonNotFound => "submit_button_not_found",
            Self::NavigationFailed => "navigation_failed",
            Self::PageError => "page_error",
            Self::BrowserClosed => "browser_closed",
            Self::Error => "error",
        }
    }
}

impl fmt::Display for TrainReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Debug,
    Info,
    Warn,
    Error,
    Success,
}

impl Severity {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Debug => "debug",
            Self::Info => "info",
            Self::Warn => "warn",
            Self::Error => "error",
            Self::Success => "success",
        }
    }
}

impl Default for Severity {
    fn default() -> Self {
        Self::Info
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActivityEntry {
    pub id: i64,
    pub ts_ms: i64,
    pub action: String,
    pub severity: Severity,
    pub details: serde_json::Value,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resource_kind_parses_case_insensitively() {
        assert_eq!("Crop".parse::<ResourceKind>(), Ok(ResourceKind::Crop));
        assert!("gold".parse::<ResourceKind>().is_err());
    }

    #[test]
    fn building_kind_accepts_legacy_spellings() {
        assert_eq!("rallyPoint".parse::<BuildingKind>(), Ok(BuildingKind::RallyPoint));
        assert_eq!("palace".parse::<BuildingKind>(), Ok(BuildingKind::Residence));
    }

    #[test]
    fn training_task_prefers_name_over_index() {
        let mut task = TrainingTask {
            id: "t".into(),
            village: None,
            building_type: BuildingKind::Barracks,
            building_slot: None,
            troop_name: Some("Legionario".into()),
            troop_index: Some(1),
            quantity: None,
            repeat_forever: false,
            repeat_interval: 0,
            priority: 50,
            created_at: String::new(),
            status: TaskStatus::Pending,
            trained_total: 0,
            last_trained_at_ms: None,
        };
        assert_eq!(task.troop(), Some(TroopSpec::Name("Legionario".into())));
        task.troop_name = Some("  ".into());
        assert_eq!(task.troop(), Some(TroopSpec::Index(1)));
    }

    #[test]
    fn repeating_task_waits_for_interval() {
        let task = TrainingTask {
            id: "t".into(),
            village: None,
            building_type: BuildingKind::Stable,
            building_slot: Some(20),
            troop_name: None,
            troop_index: Some(2),
            quantity: Some(5),
            repeat_forever: true,
            repeat_interval: 10,
            priority: 50,
            created_at: String::new(),
            status: TaskStatus::Pending,
            trained_total: 5,
            last_trained_at_ms: Some(1_000),
        };
        assert!(!task.is_due(1_000 + 9 * 60_000));
        assert!(task.is_due(1_000 + 10 * 60_000));
    }

    #[test]
    fn coord_display_and_distance() {
        let a = Coord::new(-3, 4);
        assert_eq!(a.to_string(), "(-3|4)");
        assert!((Coord::new(0, 0).distance_to(a) - 5.0).abs() < f64::EPSILON);
    }
}

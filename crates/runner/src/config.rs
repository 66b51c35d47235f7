//! Command line, environment and the optional YAML pacing file.

use crate::farm::{FarmOptions, FarmSource};
use crate::webdriver::BrowserOptions;
use anyhow::Context;
use clap::{ArgAction, Args, Parser, Subcommand, ValueEnum};
use farmhand_protocol::{BuildingKind, Coord, ResourceKind};
use serde::{Deserialize, Serialize};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const DEFAULT_STATUS_PORT: u16 = 39333;

pub fn data_dir() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".farmhand")
}

pub fn default_db_path() -> PathBuf {
    data_dir().join("farmhand.db")
}

pub fn default_session_path() -> PathBuf {
    data_dir().join("session.json")
}

#[derive(Debug, Parser)]
#[command(name = "farmhand", version, about = "Village automation for browser strategy games")]
pub struct Cli {
    /// SQLite file holding tasks and the activity log.
    #[arg(long, env = "FARMHAND_DB", global = true)]
    pub db: Option<PathBuf>,

    /// YAML file with pacing overrides.
    #[arg(long, global = true)]
    pub settings: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

impl Cli {
    pub fn db_path(&self) -> PathBuf {
        self.db.clone().unwrap_or_else(default_db_path)
    }
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Work the task queues until stopped.
    Run {
        #[command(flatten)]
        game: GameArgs,
        #[command(flatten)]
        farm: FarmArgs,
        /// Minutes between farm-list runs; 0 disables them.
        #[arg(long, env = "FARM_INTERVAL_MIN", default_value_t = 0)]
        farm_interval_min: u64,
        /// Pause between 01:00 and 07:00 local time.
        #[arg(long, env = "NIGHT_MODE", default_value_t = false, action = ArgAction::Set)]
        night_mode: bool,
        /// Also serve the status endpoint on this port.
        #[arg(long)]
        status_port: Option<u16>,
    },
    /// Force a full scan of the resource fields and print it.
    Scan {
        #[command(flatten)]
        game: GameArgs,
    },
    /// List the account's villages.
    Villages {
        #[command(flatten)]
        game: GameArgs,
    },
    /// Queue a construction.
    AddBuild(AddBuildArgs),
    /// Queue a training order.
    AddTraining(AddTrainingArgs),
    /// Show pending tasks.
    Tasks {
        #[arg(long)]
        village: Option<String>,
        #[arg(long, default_value_t = 50)]
        limit: usize,
    },
    /// Fill the farm lists once and print the report.
    Farm {
        #[command(flatten)]
        game: GameArgs,
        #[command(flatten)]
        farm: FarmArgs,
    },
    /// Serve the status endpoint only.
    Status {
        #[arg(long, default_value_t = DEFAULT_STATUS_PORT)]
        port: u16,
    },
}

#[derive(Debug, Clone, Args)]
pub struct GameArgs {
    #[arg(long, env = "GAME_URL")]
    pub game_url: String,
    #[arg(long, env = "GAME_USERNAME", default_value = "")]
    pub username: String,
    #[arg(long, env = "GAME_PASSWORD", default_value = "", hide_env_values = true)]
    pub password: String,
    #[arg(long, env = "HEADLESS", default_value_t = true, action = ArgAction::Set)]
    pub headless: bool,
    #[arg(long, env = "WEBDRIVER_URL", default_value = "http://127.0.0.1:9515")]
    pub webdriver_url: String,
    /// Cookie file reused between runs.
    #[arg(long, env = "FARMHAND_SESSION")]
    pub session: Option<PathBuf>,
    /// Village id (newdid) or name to switch to first.
    #[arg(long)]
    pub village: Option<String>,
}

impl GameArgs {
    pub fn browser(&self) -> BrowserOptions {
        BrowserOptions {
            webdriver_url: self.webdriver_url.clone(),
            headless: self.headless,
            ..Default::default()
        }
    }

    pub fn session_path(&self) -> PathBuf {
        self.session.clone().unwrap_or_else(default_session_path)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum SourceArg {
    Map,
    #[value(name = "inactivesearch", alias = "inactive-search")]
    InactiveSearch,
}

impl From<SourceArg> for FarmSource {
    fn from(value: SourceArg) -> Self {
        match value {
            SourceArg::Map => FarmSource::Map,
            SourceArg::InactiveSearch => FarmSource::InactiveSearch,
        }
    }
}

#[derive(Debug, Clone, Args)]
pub struct FarmArgs {
    #[arg(long, env = "FARM_LIST_NAME", default_value = "raid")]
    pub list_name: String,
    #[arg(long, env = "FARM_MAX_POP")]
    pub max_pop: Option<u32>,
    #[arg(long, env = "FARM_MAX_DIST", default_value_t = 20.0)]
    pub max_dist: f64,
    #[arg(long, env = "FARM_MIN_DIST", default_value_t = 0.0)]
    pub min_dist: f64,
    #[arg(long, env = "FARM_T1", default_value_t = 2)]
    pub t1: u32,
    /// Size of one list, existing entries included.
    #[arg(long, env = "FARM_MAX_TARGETS", default_value_t = 100)]
    pub max_targets: u32,
    /// Defaults to one list's worth.
    #[arg(long, env = "FARM_TOTAL_TARGETS")]
    pub total_targets: Option<u32>,
    #[arg(long, env = "FARM_AUTO_NEXT_LIST", default_value_t = false, action = ArgAction::Set)]
    pub auto_next_list: bool,
    #[arg(long, env = "FARM_MAX_LISTS", default_value_t = 20)]
    pub max_lists: u32,
    #[arg(long, env = "FARM_SOURCE", value_enum, default_value_t = SourceArg::Map)]
    pub source: SourceArg,
    #[arg(long, env = "FARM_INACTIVESEARCH_URL")]
    pub inactive_url: Option<String>,
    #[arg(long, env = "FARM_INACTIVESEARCH_MAX_PAGES", default_value_t = 30)]
    pub inactive_max_pages: u32,
    #[arg(long, env = "FARM_CENTER_X", allow_hyphen_values = true)]
    pub center_x: Option<i32>,
    #[arg(long, env = "FARM_CENTER_Y", allow_hyphen_values = true)]
    pub center_y: Option<i32>,
    #[arg(long, env = "FARM_RALLY_SLOT")]
    pub rally_slot: Option<u32>,
}

impl FarmArgs {
    pub fn options(&self) -> FarmOptions {
        let center = match (self.center_x, self.center_y) {
            (Some(x), Some(y)) => Some(Coord::new(x, y)),
            _ => None,
        };
        FarmOptions {
            list_name: self.list_name.clone(),
            max_population: self.max_pop,
            min_distance: self.min_dist.max(0.0),
            max_distance: self.max_dist,
            troops_t1: self.t1,
            max_targets_per_list: self.max_targets,
            total_targets: self.total_targets.unwrap_or(self.max_targets),
            auto_next_list: self.auto_next_list,
            max_lists: self.max_lists,
            source: self.source.into(),
            center,
            rally_slot: self.rally_slot,
        }
    }
}

#[derive(Debug, Clone, Args)]
pub struct AddBuildArgs {
    #[arg(long)]
    pub village: Option<String>,
    /// Resource field type (wood, clay, iron, crop).
    #[arg(long = "type")]
    pub building_type: Option<ResourceKind>,
    #[arg(long)]
    pub slot: Option<u32>,
    #[arg(long)]
    pub name: Option<String>,
    #[arg(long)]
    pub target_level: u32,
    #[arg(long, default_value_t = 0, allow_hyphen_values = true)]
    pub priority: i64,
}

#[derive(Debug, Clone, Args)]
pub struct AddTrainingArgs {
    #[arg(long)]
    pub village: Option<String>,
    /// barracks, stable, workshop, residence or rally_point.
    #[arg(long)]
    pub building: BuildingKind,
    #[arg(long)]
    pub slot: Option<u32>,
    #[arg(long)]
    pub troop: Option<String>,
    #[arg(long)]
    pub troop_index: Option<u32>,
    /// Omit to train the maximum shown.
    #[arg(long)]
    pub quantity: Option<u32>,
    #[arg(long)]
    pub repeat_forever: bool,
    /// Minutes between repeats.
    #[arg(long, default_value_t = 0)]
    pub repeat_interval: u32,
    #[arg(long, default_value_t = 0, allow_hyphen_values = true)]
    pub priority: i64,
}

pub fn status_addr(port: u16) -> SocketAddr {
    SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), port)
}

/// Sleep windows of the scheduler, in seconds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Pacing {
    pub success_min_secs: u64,
    pub success_max_secs: u64,
    pub queue_full_secs: u64,
    pub idle_secs: u64,
    pub no_tasks_secs: u64,
    pub error_secs: u64,
    pub night_secs: u64,
}

impl Default for Pacing {
    fn default() -> Self {
        Self {
            success_min_secs: 10,
            success_max_secs: 15,
            queue_full_secs: 120,
            idle_secs: 300,
            no_tasks_secs: 60,
            error_secs: 10,
            night_secs: 600,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub pacing: Pacing,
    pub scan_retries: u32,
    pub scan_backoff_secs: u64,
    pub tasks_per_cycle: usize,
    /// Verify each build against the construction queue.
    pub verify_builds: bool,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            pacing: Pacing::default(),
            scan_retries: 3,
            scan_backoff_secs: 3,
            tasks_per_cycle: 10,
            verify_builds: true,
        }
    }
}

impl Settings {
    pub fn load(path: Option<&Path>) -> anyhow::Result<Self> {
        let Some(path) = path else {
            return Ok(Self::default());
        };
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("reading settings {}", path.display()))?;
        Self::from_yaml(&raw).with_context(|| format!("parsing settings {}", path.display()))
    }

    pub fn from_yaml(raw: &str) -> anyhow::Result<Self> {
        if raw.trim().is_empty() {
            return Ok(Self::default());
        }
        Ok(serde_yaml::from_str(raw)?)
    }

    pub fn scan_backoff(&self) -> Duration {
        Duration::from_secs(self.scan_backoff_secs)
    }
}

//! The game as seen through one browser tab.
//!
//! `GameClient` knows the game's URLs and selectors; everything that decides
//! what a label means lives in the executors and in the parsers below.

use crate::build::{
    choose_upgrade_control, parse_building_info, queue_check, BuildUi, BuildingInfo, QueueCheck,
    UpgradeAttempt,
};
use crate::cache::VillageCache;
use crate::delay::human_delay;
use crate::dom::{self, ElementSnapshot};
use crate::farm::{FarmUi, TileInfo};
use crate::normalize::{building_gids, building_keywords, contains_any, fallback_slots, normalize};
use crate::page::{Page, PageError};
use crate::scanner::{SlotReading, SlotSource};
use crate::scheduler::VillageSwitch;
use crate::selector::ResourceAmounts;
use crate::train::TrainUi;
use anyhow::{bail, Context};
use async_trait::async_trait;
use farmhand_protocol::{BuildingKind, Coord, ResourceKind};
use regex::Regex;
use serde::Serialize;
use std::path::Path;
use std::sync::{LazyLock, Mutex};

const LOGGED_IN: &str =
    r#"#stockBar, .villageList, #sidebarBoxVillagelist, a[href*="logout"], .playerName"#;
const LOGIN_NAME: &str = r#"input[name="name"], input[name="username"]"#;
const LOGIN_PASSWORD: &str = r#"input[name="password"]"#;
const LOGIN_SUBMIT: &str = r#"button[type="submit"], input[type="submit"]"#;

const VILLAGE_LINKS: &str = r#"#sidebarBoxVillagelist a, .villageList a, a[href*="newdid="]"#;
const VILLAGE_ITEMS: &str = "#sidebarBoxVillagelist li, .villageList li";

const TITLE: &str = ".titleInHeader, h1";
const SLOT_LINKS: &str =
    r#"area[href*="build.php?id="], a[href*="build.php?id="], [data-slotid], [data-id]"#;
const CONSTRUCTION_LINKS: &str = ".buildingList a, .boxes-contents a";
const UPGRADE_CONTROLS: &str = r#"button, input[type="submit"], a, [role="button"]"#;
const UPGRADE_SCOPES: &str =
    ".upgradeButtonsContainer, .buildAction, #contract, .upgradeButtons, .buildWrapper, .buildingDetails";
const QUEUE_FULL_MARKER: &str = ".queueFull, .buildingQueueFull";
const ERROR_BANNER: &str = ".error, .alert, .warning, .messageError";
const BUILD_QUEUE: &str = ".under_progress, .under-progress, .productionQueue, .queue, \
    .underConstruction, .build_queue, .buildingList, .buildDetails, .queueWrapper";
const BUILD_QUEUE_LINKS: &str = r#".under_progress a[href*="build.php?id="], .buildingList a[href*="build.php?id="], .boxes-contents a[href*="build.php?id="], .queueWrapper a[href*="build.php?id="]"#;
const NEW_BUILDING_LINKS: &str = r#"a[href*="gid="]"#;
const NEW_BUILDING_CARDS: &str = ".buildingWrapper, .building, .buildNewBuilding, .newBuilding, li";

const TROOP_INPUTS: &str =
    r#"input[name^="t"], input[name*="t"], input[data-unitid], input[data-unit]"#;
const TROOP_ROWS: &str = "tr, .unit, .trainUnits, .textList, .unitWrapper";
const TRAIN_QUEUE: &str = ".under_progress, .under-progress, .trainingQueue, .productionQueue, \
    .queue, .underConstruction, .build_queue, #trainQueue, .trainingList, .queueWrapper, .unitQueue";

const COORD_X_INPUT: &str =
    r#"#xCoord, input[name="xCoord"], input[name="x"], input[name="xcoord"], input[id*="xCoord"]"#;
const COORD_Y_INPUT: &str =
    r#"#yCoord, input[name="yCoord"], input[name="y"], input[name="ycoord"], input[id*="yCoord"]"#;
const NAME_INPUT: &str = r#"input[name*="name" i], input[id*="name" i], input[placeholder*="nombre" i]"#;
const TILE_DETAILS: [&str; 5] = ["#tileDetails", "#mapDetails", ".tileDetails", ".mapDetails", "#content"];
const TILE_TITLE: &str = "#tileDetails h1, #tileDetails .title, #mapDetails h1, h1, .titleInHeader";
const CLICKABLE: &str = "a, button";
const SUBMITS: &str = r#"button, input[type="submit"]"#;
const LIST_CANDIDATES: &str =
    "a, button, .raidList, .listEntry, .listTitle, .name, .raidListTitle, .listTitleText";
const VILLAGE_NAMES: &str =
    "#sidebarBoxVillagelist, .villageList, .villageListTitle, .villageListBar, .villageName, .name";
const FARM_ROWS: &str = "tr, .raidListEntry, .farmListEntry, .slotRow, .listEntry, .listRow";
const FARM_ROW_LINKS: &str = r#"tr a[href*="x="], .raidListEntry a[href*="x="], .farmListEntry a[href*="x="], .slotRow a[href*="x="]"#;
const FARM_T1_INPUTS: &str =
    r#"input[name*="t1"], input[name*="troops[1]"], input[data-unit="1"], input[class*="u1"]"#;

const FARM_TAB_WORDS: [&str; 3] = ["lista de vacas", "farm list", "raid list"];
const ADD_FROM_MAP_WORDS: [&str; 3] = ["agregar a la lista de vacas", "add to farm list", "add to farmlist"];
const ADD_TARGET_WORDS: [&str; 3] = ["anadir objetivo", "add target", "nuevo objetivo"];
const CONFIRM_WORDS: [&str; 7] = ["agregar", "anadir", "ok", "aceptar", "guardar", "save", "add"];
const CREATE_LIST_WORDS: [&str; 5] = ["nueva lista", "crear lista", "new list", "create list", "new farm list"];
const CREATE_OK_WORDS: [&str; 6] = ["crear", "guardar", "ok", "aceptar", "save", "create"];
const SAVE_WORDS: [&str; 2] = ["guardar", "save"];
const LIST_NAME_EXCLUDE: [&str; 8] = [
    "lista de vacas",
    "farm list",
    "raid list",
    "crear",
    "new list",
    "create list",
    "comenzar",
    "start all",
];

static NEWDID: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"[?&]newdid=(\d+)").expect("Invalid regex"));
static SLOT_ID: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?:^|[?&])id=(\d+)").expect("Invalid regex"));
static GID: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"gid=(\d+)").expect("Invalid regex"));
static COORD_PAIR: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\(\s*(-?\d+)\s*\|\s*(-?\d+)\s*\)").expect("Invalid regex"));
static BARE_PAIR: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?:^|\s)(-?\d+)\s*\|\s*(-?\d+)(?:\s|$)").expect("Invalid regex"));
static HREF_X: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"[?&]x=(-?\d+)").expect("Invalid regex"));
static HREF_Y: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"[?&]y=(-?\d+)").expect("Invalid regex"));
static POPULATION: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?:habitantes|population|inhabitants|einwohner)\s*[:\-]?\s*(\d{1,6})").expect("Invalid regex")
});
static TILE_LABEL: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)^\s*(?:vesnice|aldea|village|dorf)\s*:\s*(.+)$").expect("Invalid regex")
});
static TRAILING_PAREN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\s*\([^)]*\)\s*$").expect("Invalid regex"));
static STOCK: LazyLock<Vec<(ResourceKind, Regex)>> = LazyLock::new(|| {
    let labels: [(ResourceKind, &[&str]); 4] = [
        (ResourceKind::Wood, &["madera", "wood", "holz"]),
        (ResourceKind::Clay, &["barro", "clay", "lehm", "arcilla"]),
        (ResourceKind::Iron, &["hierro", "iron", "eisen", "mineral"]),
        (ResourceKind::Crop, &["cereal", "crop", "trigo", "getreide"]),
    ];
    labels
        .into_iter()
        .flat_map(|(kind, words)| {
            words.iter().map(move |w| {
                (kind, Regex::new(&format!(r"{w}[^\d]*(\d[\d.,]*)")).expect("Invalid regex"))
            })
        })
        .collect()
});

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Village {
    pub id: String,
    pub name: String,
}

#[derive(Debug, Clone)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

/// Village list from the sidebar: `newdid=` links first, then `data-did` items.
pub fn collect_villages(links: &[ElementSnapshot], items: &[ElementSnapshot]) -> Vec<Village> {
    let mut out: Vec<Village> = Vec::new();
    let mut push = |id: String, name: String| {
        if !out.iter().any(|v| v.id == id && v.name == name) {
            out.push(Village { id, name });
        }
    };
    for link in links {
        let Some(caps) = link.attr("href").and_then(|h| NEWDID.captures(h)) else {
            continue;
        };
        let id = caps[1].to_string();
        let name = Some(link.label()).filter(|n| !n.is_empty()).unwrap_or_else(|| id.clone());
        push(id, name);
    }
    for item in items {
        let Some(id) = item.attr("data-did").map(str::trim).filter(|d| !d.is_empty()) else {
            continue;
        };
        let name = Some(item.label()).filter(|n| !n.is_empty()).unwrap_or_else(|| id.to_string());
        push(id.to_string(), name);
    }
    out
}

/// Finds a village by id, or by a name equal to or containing `wanted`.
pub fn find_village<'a>(villages: &'a [Village], wanted: &str) -> Option<&'a Village> {
    let wanted = normalize(wanted);
    if wanted.chars().all(|c| c.is_ascii_digit()) {
        return villages.iter().find(|v| v.id == wanted);
    }
    villages
        .iter()
        .find(|v| v.name == wanted || v.name.contains(&wanted))
}

/// Stock per resource from the stock bar text.
pub fn parse_stock(text: &str) -> ResourceAmounts {
    let text = normalize(text);
    let mut out = ResourceAmounts::new();
    for (kind, re) in STOCK.iter() {
        if out.contains_key(kind) {
            continue;
        }
        if let Some(amount) = re.captures(&text).and_then(|c| crate::normalize::parse_amount(&c[1])) {
            out.insert(*kind, amount);
        }
    }
    out
}

pub fn slot_from_href(href: &str) -> Option<u32> {
    SLOT_ID.captures(href).and_then(|c| c[1].parse().ok())
}

fn slot_of(el: &ElementSnapshot) -> Option<u32> {
    el.attr("href")
        .and_then(slot_from_href)
        .or_else(|| el.attr("data-slotid").and_then(|v| v.trim().parse().ok()))
        .or_else(|| el.attr("data-id").and_then(|v| v.trim().parse().ok()))
}

/// Slot of an existing building on the village view, by label, gid or `g<N>` class.
pub fn find_building_slot(elements: &[ElementSnapshot], kind: BuildingKind) -> Option<u32> {
    let keywords = building_keywords(kind);
    let gids = building_gids(kind);
    elements.iter().find_map(|el| {
        let href = el.attr("href").unwrap_or_default();
        // build.php?id=N&gid=M offers a new building on the plot
        if href.contains("gid=") {
            return None;
        }
        let slot = slot_of(el)?;
        let label = normalize(&format!(
            "{} {} {}",
            el.attr("title").unwrap_or_default(),
            el.attr("alt").unwrap_or_default(),
            el.text
        ));
        let class = normalize(&el.class);
        let by_gid = GID
            .captures(href)
            .and_then(|c| c[1].parse::<u32>().ok())
            .is_some_and(|g| gids.contains(&g));
        let by_class = class
            .split_whitespace()
            .any(|c| gids.iter().any(|g| c == format!("g{g}")));
        (contains_any(&label, keywords) || by_gid || by_class).then_some(slot)
    })
}

pub fn parse_coord_pair(text: &str) -> Option<Coord> {
    let caps = COORD_PAIR.captures(text)?;
    Some(Coord::new(caps[1].parse().ok()?, caps[2].parse().ok()?))
}

fn parse_bare_pair(text: &str) -> Option<Coord> {
    let caps = BARE_PAIR.captures(text)?;
    Some(Coord::new(caps[1].parse().ok()?, caps[2].parse().ok()?))
}

fn coord_from_href(href: &str) -> Option<Coord> {
    let x = HREF_X.captures(href)?[1].parse().ok()?;
    let y = HREF_Y.captures(href)?[1].parse().ok()?;
    Some(Coord::new(x, y))
}

/// Tile coordinates from the tile title, else from a `karte.php?x=..&y=..` address.
pub fn shown_coord(href: Option<&str>, title: Option<&str>) -> Option<Coord> {
    title
        .and_then(parse_coord_pair)
        .or_else(|| href.filter(|h| h.contains("karte.php")).and_then(coord_from_href))
}

/// Target coordinates of one farm-list row.
pub fn coord_of_row(el: &ElementSnapshot) -> Option<Coord> {
    if let (Some(x), Some(y)) = (el.attr("data-x"), el.attr("data-y")) {
        if let (Ok(x), Ok(y)) = (x.trim().parse(), y.trim().parse()) {
            return Some(Coord::new(x, y));
        }
    }
    el.attr("data-coord")
        .and_then(parse_coord_pair)
        .or_else(|| el.attr("href").and_then(coord_from_href))
        .or_else(|| parse_coord_pair(&el.text))
        .or_else(|| parse_bare_pair(&el.text))
}

/// Reads a map tile detail. Oases, empty tiles and villages without a
/// readable population give `None`.
pub fn parse_tile(details: &str, title: Option<&str>) -> Option<TileInfo> {
    let text = normalize(details);
    let village = contains_any(
        &text,
        &["aldea", "village", "pueblo", "habitantes", "population", "inhabitants", "einwohner"],
    );
    if !village || text.contains("oasis") {
        return None;
    }
    let population = POPULATION.captures(&text)?[1].parse().ok()?;

    let mut name = title.unwrap_or_default().trim().to_string();
    if let Some(caps) = TILE_LABEL.captures(&name) {
        name = caps[1].to_string();
    }
    // "(-75|71)" then "(Capital)"
    for _ in 0..2 {
        name = TRAILING_PAREN.replace(&name, "").trim().to_string();
    }
    Some(TileInfo {
        population,
        name: Some(name).filter(|n| !n.is_empty()),
    })
}

/// Farm-list names shown on the rally point, without tab captions or village names.
pub fn collect_list_names(candidates: &[ElementSnapshot], village_names: &[ElementSnapshot]) -> Vec<String> {
    let villages: Vec<String> = village_names.iter().map(|v| normalize(&v.text)).collect();
    let mut out: Vec<String> = Vec::new();
    for el in candidates {
        let t = normalize(&el.text);
        if t.is_empty() || t.chars().count() > 50 || t.contains("todas las") {
            continue;
        }
        if contains_any(&t, &LIST_NAME_EXCLUDE) || villages.contains(&t) || out.contains(&t) {
            continue;
        }
        out.push(t);
    }
    out
}

fn labelled<'a>(elements: &'a [ElementSnapshot], words: &[&str]) -> Option<&'a ElementSnapshot> {
    elements.iter().find(|el| contains_any(&el.label(), words))
}

fn named<'a>(elements: &'a [ElementSnapshot], wanted: &str) -> Option<&'a ElementSnapshot> {
    elements.iter().find(|el| {
        let t = el.label();
        !t.is_empty() && (t == wanted || t.contains(wanted))
    })
}

pub struct GameClient<P: Page> {
    page: P,
    base_url: String,
    rally_slot: Mutex<Option<u32>>,
}

impl<P: Page> GameClient<P> {
    pub fn new(page: P, base_url: &str) -> Self {
        Self {
            page,
            base_url: base_url.trim_end_matches('/').to_string(),
            rally_slot: Mutex::new(None),
        }
    }

    pub fn page(&self) -> &P {
        &self.page
    }

    pub fn into_page(self) -> P {
        self.page
    }

    fn url(&self, path: &str) -> String {
        if path.starts_with("http://") || path.starts_with("https://") {
            return path.to_string();
        }
        format!("{}/{}", self.base_url, path.trim_start_matches('/'))
    }

    async fn goto(&self, path: &str, min_ms: u64, max_ms: u64) -> Result<(), PageError> {
        self.page.navigate(&self.url(path)).await?;
        human_delay(&self.page, min_ms, max_ms).await;
        Ok(())
    }

    async fn click_labelled(&self, selector: &str, words: &[&str]) -> Result<bool, PageError> {
        let elements = dom::snapshot(&self.page, selector, None).await?;
        match labelled(&elements, words) {
            Some(el) => dom::click_nth(&self.page, selector, el.index).await,
            None => Ok(false),
        }
    }

    /// Coordinates of the map tile currently on screen.
    async fn shown_tile(&self) -> Result<Option<Coord>, PageError> {
        let href = self.page.evaluate("return location.href;", Vec::new()).await?;
        let title = dom::text(&self.page, TILE_TITLE).await?;
        Ok(shown_coord(href.as_str(), title.as_deref()))
    }

    pub async fn is_logged_in(&self) -> Result<bool, PageError> {
        if self.page.is_closed() {
            return Ok(false);
        }
        dom::exists(&self.page, LOGGED_IN).await
    }

    /// Opens the game and signs in unless a stored session already is.
    pub async fn login(&self, creds: &Credentials) -> anyhow::Result<()> {
        match self.try_login(creds).await {
            Ok(()) => Ok(()),
            Err(e) => {
                if !self.page.is_closed() {
                    if let Err(shot) = self.page.screenshot(Path::new("error-login.png")).await {
                        tracing::warn!(error = %shot, "could not save login screenshot");
                    }
                }
                Err(e)
            }
        }
    }

    async fn try_login(&self, creds: &Credentials) -> anyhow::Result<()> {
        tracing::info!(url = %self.base_url, "opening game");
        self.goto("", 3000, 5000).await.context("navigating to the game")?;
        if self.is_logged_in().await? {
            tracing::info!("stored session is valid, login skipped");
            return Ok(());
        }

        tracing::info!("signing in");
        if dom::fill_nth(&self.page, LOGIN_NAME, 0, &creds.username).await? {
            human_delay(&self.page, 300, 600).await;
            dom::fill_nth(&self.page, LOGIN_PASSWORD, 0, &creds.password).await?;
            human_delay(&self.page, 500, 1000).await;
            if dom::click_nth(&self.page, LOGIN_SUBMIT, 0).await? {
                human_delay(&self.page, 5000, 7000).await;
            }
        }
        if !self.is_logged_in().await? {
            bail!("login failed");
        }
        tracing::info!("login succeeded");
        Ok(())
    }

    pub async fn villages(&self) -> Result<Vec<Village>, PageError> {
        if self.page.is_closed() {
            return Ok(Vec::new());
        }
        let links = dom::snapshot(&self.page, VILLAGE_LINKS, None).await?;
        let items = dom::snapshot(&self.page, VILLAGE_ITEMS, None).await?;
        Ok(collect_villages(&links, &items))
    }

    /// Makes `target` the active village. `main` and empty keep the current one.
    pub async fn switch_village(&self, target: &str, cache: &mut VillageCache) -> Result<bool, PageError> {
        let target = target.trim();
        if target.is_empty() || target.eq_ignore_ascii_case("main") {
            return Ok(true);
        }
        let id = if target.chars().all(|c| c.is_ascii_digit()) {
            target.to_string()
        } else {
            let villages = self.villages().await?;
            match find_village(&villages, target) {
                Some(v) => v.id.clone(),
                None => {
                    tracing::warn!(village = target, "village not found in sidebar");
                    return Ok(false);
                }
            }
        };
        if let Err(e) = self.goto(&format!("dorf1.php?newdid={id}"), 1200, 2200).await {
            if e.is_session_closed() {
                return Err(e);
            }
            tracing::warn!(village = target, error = %e, "village switch failed");
            return Ok(false);
        }
        cache.invalidate();
        tracing::info!(village = target, id, "village switched");
        Ok(true)
    }

    async fn title(&self) -> Result<Option<String>, PageError> {
        dom::text(&self.page, TITLE).await
    }

    async fn slot_is_queued(&self, slot: u32) -> Result<bool, PageError> {
        let links = dom::snapshot(&self.page, CONSTRUCTION_LINKS, None).await?;
        Ok(links
            .iter()
            .filter_map(|l| l.attr("href").and_then(slot_from_href))
            .any(|s| s == slot))
    }

    pub async fn locate(&self, kind: BuildingKind) -> Result<Option<u32>, PageError> {
        match self.goto("dorf2.php", 900, 1400).await {
            Ok(()) => {
                let elements = dom::snapshot(&self.page, SLOT_LINKS, None).await?;
                if let Some(slot) = find_building_slot(&elements, kind) {
                    tracing::info!(building = kind.as_str(), slot, "building located");
                    return Ok(Some(slot));
                }
            }
            Err(e) if e.is_session_closed() => return Err(e),
            Err(e) => tracing::warn!(error = %e, "could not open village center"),
        }

        let keywords = building_keywords(kind);
        for &slot in fallback_slots(kind) {
            if let Err(e) = self.goto(&format!("build.php?id={slot}"), 600, 900).await {
                if e.is_session_closed() {
                    return Err(e);
                }
                tracing::warn!(slot, error = %e, "could not probe slot");
                continue;
            }
            let title = normalize(&self.title().await?.unwrap_or_default());
            if contains_any(&title, keywords) {
                tracing::info!(building = kind.as_str(), slot, "building found on a usual slot");
                return Ok(Some(slot));
            }
        }
        tracing::warn!(building = kind.as_str(), "building not located");
        Ok(None)
    }

    async fn rally_point(&self, explicit: Option<u32>) -> Result<Option<u32>, PageError> {
        if explicit.is_some() {
            return Ok(explicit);
        }
        let known = *self.rally_slot.lock().unwrap_or_else(|e| e.into_inner());
        if known.is_some() {
            return Ok(known);
        }
        let found = self.locate(BuildingKind::RallyPoint).await?;
        *self.rally_slot.lock().unwrap_or_else(|e| e.into_inner()) = found;
        Ok(found)
    }

    async fn create_list(&self, name: &str) -> Result<bool, PageError> {
        let selector = r#"a, button, input[type="button"], input[type="submit"]"#;
        if !self.click_labelled(selector, &CREATE_LIST_WORDS).await? {
            return Ok(false);
        }
        dom::fill_nth(&self.page, NAME_INPUT, 0, name).await?;
        self.click_labelled(r#"button, input[type="submit"], input[type="button"], a.button"#, &CREATE_OK_WORDS)
            .await?;
        human_delay(&self.page, 1200, 2000).await;
        tracing::info!(list = name, "farm list created");
        Ok(true)
    }

    async fn select_list(&self, wanted: &str) -> Result<bool, PageError> {
        let elements = dom::snapshot(&self.page, LIST_CANDIDATES, None).await?;
        let Some(el) = named(&elements, wanted) else {
            return Ok(false);
        };
        let clicked = dom::click_nth(&self.page, LIST_CANDIDATES, el.index).await?;
        if clicked {
            human_delay(&self.page, 800, 1400).await;
        }
        Ok(clicked)
    }
}

#[async_trait]
impl<P: Page> SlotSource for GameClient<P> {
    async fn read_slot(&self, slot: u32) -> Result<SlotReading, PageError> {
        self.page.navigate(&self.url(&format!("build.php?id={slot}"))).await?;
        self.page.wait_for_timeout(300).await;
        let info = self.building_info().await?;
        Ok(SlotReading {
            name: Some(info.name).filter(|n| !n.is_empty()),
            level: info.level,
            under_construction: self.slot_is_queued(slot).await?,
        })
    }

    fn is_closed(&self) -> bool {
        self.page.is_closed()
    }
}

#[async_trait]
impl<P: Page> BuildUi for GameClient<P> {
    fn is_closed(&self) -> bool {
        self.page.is_closed()
    }

    async fn resource_amounts(&self) -> Result<ResourceAmounts, PageError> {
        if let Err(e) = self.goto("dorf1.php", 1000, 1600).await {
            if e.is_session_closed() {
                return Err(e);
            }
            tracing::warn!(error = %e, "could not open resource view");
            return Ok(ResourceAmounts::new());
        }
        let text = match dom::text(&self.page, "#stockBar").await? {
            Some(t) => t,
            None => dom::text(&self.page, "body").await?.unwrap_or_default(),
        };
        Ok(parse_stock(&text))
    }

    async fn locate_building(&self, kind: BuildingKind) -> Result<Option<u32>, PageError> {
        self.locate(kind).await
    }

    async fn open_slot(&self, slot: u32) -> Result<(), PageError> {
        self.goto(&format!("build.php?id={slot}"), 1500, 2500).await
    }

    async fn building_info(&self) -> Result<BuildingInfo, PageError> {
        let title = self.title().await?;
        let body = dom::body_class(&self.page).await?;
        Ok(parse_building_info(title.as_deref(), &body))
    }

    async fn choose_building(&self, name: &str) -> Result<bool, PageError> {
        let wanted = normalize(name);
        if wanted.is_empty() {
            return Ok(false);
        }
        let links = dom::snapshot(&self.page, NEW_BUILDING_LINKS, Some(NEW_BUILDING_CARDS)).await?;
        let hit = named(&links, &wanted).or_else(|| {
            links.iter().find(|l| {
                let card = normalize(&l.context);
                l.in_context && (card == wanted || card.contains(&wanted))
            })
        });
        let Some(link) = hit else {
            return Ok(false);
        };
        if !dom::click_nth(&self.page, NEW_BUILDING_LINKS, link.index).await? {
            return Ok(false);
        }
        human_delay(&self.page, 900, 1500).await;
        Ok(true)
    }

    async fn attempt_upgrade(&self) -> Result<UpgradeAttempt, PageError> {
        let controls = dom::snapshot(&self.page, UPGRADE_CONTROLS, Some(UPGRADE_SCOPES)).await?;
        match choose_upgrade_control(&controls) {
            Some(control) => {
                match control.action_url {
                    Some(url) => self.goto(&url, 1500, 2200).await?,
                    None => {
                        dom::click_nth(&self.page, UPGRADE_CONTROLS, control.index).await?;
                        human_delay(&self.page, 2000, 3000).await;
                    }
                }
                Ok(UpgradeAttempt::Started)
            }
            None if dom::exists(&self.page, QUEUE_FULL_MARKER).await? => Ok(UpgradeAttempt::QueueFull),
            None => Ok(UpgradeAttempt::NotEnoughResources),
        }
    }

    async fn verify_queued(&self, slot: u32, name: &str) -> Result<QueueCheck, PageError> {
        let banner = dom::text(&self.page, ERROR_BANNER).await?;
        let full = dom::exists(&self.page, QUEUE_FULL_MARKER).await?;
        let entries: Vec<String> = dom::snapshot(&self.page, BUILD_QUEUE, None)
            .await?
            .into_iter()
            .map(|e| format!("{} {}", e.text, e.image_alt))
            .filter(|t| !t.trim().is_empty())
            .collect();
        let linked: Vec<u32> = dom::snapshot(&self.page, BUILD_QUEUE_LINKS, None)
            .await?
            .iter()
            .filter_map(|l| l.attr("href").and_then(slot_from_href))
            .collect();
        Ok(queue_check(banner.as_deref(), full, &entries, &linked, slot, name))
    }
}

#[async_trait]
impl<P: Page> TrainUi for GameClient<P> {
    fn is_closed(&self) -> bool {
        self.page.is_closed()
    }

    async fn open_building(&self, kind: BuildingKind, slot: Option<u32>) -> Result<Option<u32>, PageError> {
        let slot = match slot {
            Some(slot) => slot,
            None => match self.locate(kind).await? {
                Some(slot) => slot,
                None => return Ok(None),
            },
        };
        self.goto(&format!("build.php?id={slot}"), 1200, 2000).await?;
        Ok(Some(slot))
    }

    async fn reload(&self, slot: u32) -> Result<(), PageError> {
        self.goto(&format!("build.php?id={slot}"), 1200, 2000).await
    }

    async fn troop_inputs(&self) -> Result<Vec<ElementSnapshot>, PageError> {
        dom::snapshot(&self.page, TROOP_INPUTS, Some(TROOP_ROWS)).await
    }

    async fn queue_entries(&self) -> Result<Vec<ElementSnapshot>, PageError> {
        dom::snapshot(&self.page, TRAIN_QUEUE, None).await
    }

    async fn error_banner(&self) -> Result<Option<String>, PageError> {
        Ok(dom::text(&self.page, ERROR_BANNER)
            .await?
            .map(|t| t.trim().to_string())
            .filter(|t| !t.is_empty()))
    }

    async fn fill_quantity(&self, input: usize, quantity: u32) -> Result<bool, PageError> {
        dom::fill_nth(&self.page, TROOP_INPUTS, input, &quantity.to_string()).await
    }

    async fn form_buttons(&self, input: usize) -> Result<Option<Vec<ElementSnapshot>>, PageError> {
        dom::form_buttons(&self.page, TROOP_INPUTS, input).await
    }

    async fn submit(&self, input: usize, button: usize) -> Result<bool, PageError> {
        let submitted = dom::submit_form(&self.page, TROOP_INPUTS, input, button).await?;
        if submitted {
            human_delay(&self.page, 1500, 2500).await;
        }
        Ok(submitted)
    }
}

#[async_trait]
impl<P: Page> FarmUi for GameClient<P> {
    fn is_closed(&self) -> bool {
        self.page.is_closed()
    }

    async fn detect_center(&self) -> Result<Option<Coord>, PageError> {
        self.goto("karte.php", 1200, 2000).await?;
        let xs = dom::snapshot(&self.page, COORD_X_INPUT, None).await?;
        let ys = dom::snapshot(&self.page, COORD_Y_INPUT, None).await?;
        if let (Some(x), Some(y)) = (xs.first(), ys.first()) {
            if let (Ok(x), Ok(y)) = (x.value.trim().parse(), y.value.trim().parse()) {
                return Ok(Some(Coord::new(x, y)));
            }
        }
        for selector in ["#map", "#content", "body"] {
            if let Some(c) = dom::text(&self.page, selector).await?.as_deref().and_then(parse_coord_pair) {
                return Ok(Some(c));
            }
        }
        Ok(None)
    }

    async fn tile_info(&self, coord: Coord) -> Result<Option<TileInfo>, PageError> {
        self.goto(&format!("karte.php?x={}&y={}", coord.x, coord.y), 900, 1500)
            .await?;
        let mut details = None;
        for selector in TILE_DETAILS {
            details = dom::text(&self.page, selector).await?;
            if details.is_some() {
                break;
            }
        }
        let details = match details {
            Some(d) => d,
            None => dom::text(&self.page, "body").await?.unwrap_or_default(),
        };
        let title = dom::text(&self.page, TILE_TITLE).await?;
        Ok(parse_tile(&details, title.as_deref()))
    }

    async fn add_from_map(&self, coord: Coord, list: &str) -> Result<bool, PageError> {
        if self.shown_tile().await? != Some(coord) {
            self.goto(&format!("karte.php?x={}&y={}", coord.x, coord.y), 900, 1500)
                .await?;
            let shown = self.shown_tile().await?;
            if shown != Some(coord) {
                tracing::warn!(%coord, ?shown, "map shows another tile, not adding");
                return Ok(false);
            }
        }
        if !self.click_labelled(CLICKABLE, &ADD_FROM_MAP_WORDS).await? {
            return Ok(false);
        }
        human_delay(&self.page, 900, 1500).await;

        let options = dom::snapshot(&self.page, "select option", None).await?;
        if let Some(opt) = named(&options, &normalize(list)) {
            if dom::select_option(&self.page, "select option", opt.index).await? {
                human_delay(&self.page, 400, 900).await;
            }
        }
        if !self.click_labelled(SUBMITS, &CONFIRM_WORDS).await? {
            tracing::warn!(%coord, list, "no confirm button for the map add");
            return Ok(false);
        }
        human_delay(&self.page, 900, 1500).await;
        Ok(true)
    }

    async fn open_farm_tab(&self, rally_slot: Option<u32>) -> Result<bool, PageError> {
        let Some(slot) = self.rally_point(rally_slot).await? else {
            return Ok(false);
        };
        self.goto(&format!("build.php?id={slot}"), 1200, 2000).await?;
        if !self.click_labelled(CLICKABLE, &FARM_TAB_WORDS).await? {
            tracing::warn!(slot, "farm list tab not found by label, continuing");
        }
        human_delay(&self.page, 900, 1500).await;
        Ok(true)
    }

    async fn list_names(&self) -> Result<Vec<String>, PageError> {
        let candidates = dom::snapshot(&self.page, LIST_CANDIDATES, None).await?;
        let villages = dom::snapshot(&self.page, VILLAGE_NAMES, None).await?;
        Ok(collect_list_names(&candidates, &villages))
    }

    async fn open_list(&self, name: &str, rally_slot: Option<u32>, create_if_missing: bool) -> Result<bool, PageError> {
        if !self.open_farm_tab(rally_slot).await? {
            return Ok(false);
        }
        let wanted = normalize(name);
        let mut selected = self.select_list(&wanted).await?;
        if !selected && create_if_missing {
            let names = self.list_names().await?;
            if !names.iter().any(|n| *n == wanted || n.contains(&wanted)) {
                self.create_list(name).await?;
            }
            selected = self.select_list(&wanted).await?;
        }
        if !selected {
            // a list that is already open has no clickable title
            tracing::warn!(list = name, "farm list not selected by label");
        }
        Ok(true)
    }

    async fn list_targets(&self) -> Result<Vec<Coord>, PageError> {
        let mut out: Vec<Coord> = Vec::new();
        let rows = dom::snapshot(&self.page, FARM_ROWS, None).await?;
        let links = dom::snapshot(&self.page, FARM_ROW_LINKS, None).await?;
        for coord in rows.iter().chain(links.iter()).filter_map(coord_of_row) {
            if !out.contains(&coord) {
                out.push(coord);
            }
        }
        Ok(out)
    }

    async fn add_target(&self, coord: Coord, name: Option<&str>) -> Result<bool, PageError> {
        if !self.click_labelled(CLICKABLE, &ADD_TARGET_WORDS).await? {
            tracing::warn!(%coord, "add target button not found on the farm list");
            return Ok(false);
        }
        human_delay(&self.page, 800, 1400).await;

        let x = dom::fill_nth(&self.page, COORD_X_INPUT, 0, &coord.x.to_string()).await?;
        let y = dom::fill_nth(&self.page, COORD_Y_INPUT, 0, &coord.y.to_string()).await?;
        if !(x && y) {
            tracing::warn!(%coord, "coordinate inputs not found");
            return Ok(false);
        }
        if let Some(name) = name {
            dom::fill_nth(&self.page, NAME_INPUT, 0, name).await?;
        }
        human_delay(&self.page, 400, 900).await;

        if !self.click_labelled(r#"button, input[type="submit"], a"#, &CONFIRM_WORDS).await? {
            tracing::warn!(%coord, "no confirm button after adding target");
            return Ok(false);
        }
        human_delay(&self.page, 1000, 1600).await;
        Ok(true)
    }

    async fn set_troops_all(&self, t1: u32) -> Result<usize, PageError> {
        let wanted = t1.to_string();
        let inputs = dom::snapshot(&self.page, FARM_T1_INPUTS, None).await?;
        let mut changed = 0;
        for input in inputs.iter().filter(|i| i.value.trim() != wanted) {
            if dom::fill_nth(&self.page, FARM_T1_INPUTS, input.index, &wanted).await? {
                changed += 1;
            }
        }
        if changed > 0 {
            human_delay(&self.page, 400, 900).await;
        }
        Ok(changed)
    }

    async fn save_list(&self) -> Result<bool, PageError> {
        let clicked = self.click_labelled(SUBMITS, &SAVE_WORDS).await?;
        if clicked {
            human_delay(&self.page, 1200, 1800).await;
        }
        Ok(clicked)
    }
}

#[async_trait]
impl<P: Page> VillageSwitch for GameClient<P> {
    async fn switch_village(&self, target: &str, cache: &mut VillageCache) -> Result<bool, PageError> {
        GameClient::switch_village(self, target, cache).await
    }
}

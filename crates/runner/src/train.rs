use crate::dom::ElementSnapshot;
use crate::normalize::{contains_any, matches_name, name_tokens, normalize, parse_amount, token_match};
use crate::page::PageError;
use async_trait::async_trait;
use farmhand_protocol::{BuildingKind, TrainReason, TrainingTask, TroopSpec};
use regex::Regex;
use serde::Serialize;
use std::sync::LazyLock;

static INPUT_INDEX: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"t(\d+)").expect("Invalid regex"));
static EXISTING: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?:existente|existing|vorhanden)s?\s*:\s*(\d{1,9})").expect("Invalid regex")
});
static SLASH_MAX: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"/\s*(\d{1,6})").expect("Invalid regex"));
static LEADING_COUNT: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^\s*(\d{1,6})\s*(?:x\b|\s+)").expect("Invalid regex"));
static TIMES_COUNT: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\b(\d{1,6})\s*x\b").expect("Invalid regex"));
static TIMER: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\d{1,2}:\d{2}").expect("Invalid regex"));
static ANY_COUNT: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\d+\s*x").expect("Invalid regex"));

const QUEUE_WORDS: [&str; 7] = ["curso", "cola", "queue", "termina", "listo", "duracion", "unidad"];

const TRAIN_BUTTON_WORDS: [&str; 5] = ["entrenar", "train", "reclutar", "formacion", "formation"];

const NON_QUANTITY_TYPES: [&str; 6] = ["hidden", "submit", "button", "checkbox", "radio", "image"];

/// Page-side operations of a training order.
#[async_trait]
pub trait TrainUi: Send + Sync {
    fn is_closed(&self) -> bool;

    /// Navigates to the production building and returns its slot.
    async fn open_building(
        &self,
        kind: BuildingKind,
        slot: Option<u32>,
    ) -> Result<Option<u32>, PageError>;

    async fn reload(&self, slot: u32) -> Result<(), PageError>;

    /// Quantity inputs of the training form, with their row as context.
    async fn troop_inputs(&self) -> Result<Vec<ElementSnapshot>, PageError>;

    /// Training queue containers, excluding the ones holding the form.
    async fn queue_entries(&self) -> Result<Vec<ElementSnapshot>, PageError>;

    async fn error_banner(&self) -> Result<Option<String>, PageError>;

    async fn fill_quantity(&self, input: usize, quantity: u32) -> Result<bool, PageError>;

    async fn form_buttons(&self, input: usize) -> Result<Option<Vec<ElementSnapshot>>, PageError>;

    async fn submit(&self, input: usize, button: usize) -> Result<bool, PageError>;
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TrainOutcome {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<TrainReason>,
    /// Units the page shows as actually added, never more than requested.
    pub trained: u32,
    pub requested: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub slot: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl TrainOutcome {
    fn failed(reason: TrainReason, slot: Option<u32>) -> Self {
        Self {
            success: false,
            reason: Some(reason),
            trained: 0,
            requested: 0,
            slot,
            message: None,
        }
    }

    fn from_page_error(err: &PageError, fallback: TrainReason, slot: Option<u32>) -> Self {
        if err.is_session_closed() {
            return Self::failed(TrainReason::BrowserClosed, slot);
        }
        tracing::error!(error = %err, reason = %fallback, "training attempt failed");
        Self {
            message: Some(err.to_string()),
            ..Self::failed(fallback, slot)
        }
    }
}

/// Existing and queued units of one troop, as far as the page shows them.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TroopCounts {
    pub existing: Option<u64>,
    pub queued: Option<u64>,
}

impl TroopCounts {
    /// Change between two readings over the counts both of them know.
    pub fn applied_since(&self, before: &TroopCounts) -> Option<i64> {
        let mut known = false;
        let mut delta = 0i64;
        for (a, b) in [(self.existing, before.existing), (self.queued, before.queued)] {
            if let (Some(a), Some(b)) = (a, b) {
                delta += a as i64 - b as i64;
                known = true;
            }
        }
        known.then_some(delta)
    }
}

fn is_quantity_input(el: &ElementSnapshot) -> bool {
    let kind = el.attr("type").unwrap_or_default().to_ascii_lowercase();
    !NON_QUANTITY_TYPES.contains(&kind.as_str())
}

fn troop_index_of(el: &ElementSnapshot) -> Option<u32> {
    if let Some(caps) = el.attr("name").and_then(|n| INPUT_INDEX.captures(n)) {
        return caps[1].parse().ok();
    }
    el.attr("data-unitid")
        .or_else(|| el.attr("data-unit"))
        .and_then(|v| v.trim().parse().ok())
}

fn row_text(el: &ElementSnapshot) -> String {
    normalize(&format!("{} {}", el.context, el.image_alt))
}

/// The quantity input of the troop, by index or by name in its row.
pub fn match_troop<'a>(inputs: &'a [ElementSnapshot], troop: &TroopSpec) -> Option<&'a ElementSnapshot> {
    let mut usable = inputs.iter().filter(|el| is_quantity_input(el));
    match troop {
        TroopSpec::Index(i) => usable.find(|el| troop_index_of(el) == Some(*i)),
        TroopSpec::Name(name) => {
            let target = normalize(name);
            usable.find(|el| {
                let row = row_text(el);
                row.contains(&target) || matches_name(&row, &target)
            })
        }
    }
}

/// Normalized name to look for in the queue.
pub fn troop_label(troop: &TroopSpec, row: Option<&ElementSnapshot>) -> Option<String> {
    match troop {
        TroopSpec::Name(name) => Some(normalize(name)).filter(|n| !n.is_empty()),
        TroopSpec::Index(_) => row
            .map(|el| normalize(&el.image_alt))
            .filter(|alt| !alt.is_empty()),
    }
}

/// Largest trainable amount shown in the row, or 0.
pub fn available_max(row: &ElementSnapshot) -> u32 {
    if let Some(max) = row.attr("max").and_then(|m| m.trim().parse().ok()) {
        return max;
    }
    SLASH_MAX
        .captures(&row.context)
        .and_then(|c| c[1].parse().ok())
        .unwrap_or(0)
}

pub fn existing_count(row: &ElementSnapshot) -> Option<u64> {
    EXISTING
        .captures(&normalize(&row.context))
        .and_then(|c| parse_amount(&c[1]))
}

fn line_count(line: &str) -> Option<u64> {
    LEADING_COUNT
        .captures(line)
        .or_else(|| TIMES_COUNT.captures(line))
        .and_then(|c| c[1].parse().ok())
}

/// Units of `label` waiting in the queue.
///
/// `Some(0)` when no queue line names the troop; `None` when a line names it
/// without a readable count.
pub fn queued_count(entries: &[ElementSnapshot], label: &str) -> Option<u64> {
    let mut total = 0;
    let mut matched = false;
    let mut uncounted = false;
    for line in entries
        .iter()
        .flat_map(|e| e.text.lines())
        .map(normalize)
        .filter(|l| !l.is_empty())
    {
        if !matches_name(&line, label) {
            continue;
        }
        matched = true;
        match line_count(&line) {
            Some(n) => total += n,
            None => uncounted = true,
        }
    }
    if matched && total == 0 && uncounted {
        None
    } else {
        Some(total)
    }
}

/// Whether some queue entry looks like a running order for the troop.
pub fn queue_shows_troop(entries: &[ElementSnapshot], label: Option<&str>) -> bool {
    entries.iter().any(|entry| {
        let text = normalize(&entry.text);
        let alt = normalize(&entry.image_alt);
        let active = TIMER.is_match(&text) || contains_any(&text, &QUEUE_WORDS);
        match label {
            Some(label) => {
                if text.contains(label) || (!alt.is_empty() && alt.contains(label)) {
                    return true;
                }
                let tokens = name_tokens(label);
                let hits = tokens.iter().filter(|t| token_match(&text, t)).count();
                !tokens.is_empty() && (hits == tokens.len() || (hits > 0 && active))
            }
            None => active && ANY_COUNT.is_match(&text),
        }
    })
}

/// The training form's submit button: a labelled one first, any enabled one otherwise.
pub fn pick_train_button(buttons: &[ElementSnapshot]) -> Option<usize> {
    let enabled = || buttons.iter().filter(|b| !b.disabled);
    enabled()
        .find(|b| {
            normalize(&b.class).contains("starttraining") || contains_any(&b.label(), &TRAIN_BUTTON_WORDS)
        })
        .or_else(|| enabled().next())
        .map(|b| b.index)
}

fn counts_for(
    inputs: &[ElementSnapshot],
    entries: &[ElementSnapshot],
    troop: &TroopSpec,
    label: Option<&str>,
) -> TroopCounts {
    TroopCounts {
        existing: match_troop(inputs, troop).and_then(existing_count),
        queued: label.and_then(|l| queued_count(entries, l)),
    }
}

#[derive(Debug, Clone, Default)]
pub struct TrainExecutor;

impl TrainExecutor {
    /// Queues `quantity` units (`None` for the row's maximum) and confirms
    /// the queue actually grew before reporting success.
    pub async fn train<U: TrainUi + ?Sized>(
        &self,
        ui: &U,
        building: BuildingKind,
        troop: &TroopSpec,
        quantity: Option<u32>,
        slot: Option<u32>,
    ) -> TrainOutcome {
        if ui.is_closed() {
            return TrainOutcome::failed(TrainReason::BrowserClosed, slot);
        }
        let slot = match ui.open_building(building, slot).await {
            Ok(Some(slot)) => slot,
            Ok(None) => return TrainOutcome::failed(TrainReason::BuildingNotFound, slot),
            Err(e) => return TrainOutcome::from_page_error(&e, TrainReason::NavigationFailed, slot),
        };
        match self.train_at(ui, slot, troop, quantity).await {
            Ok(outcome) => outcome,
            Err(e) => TrainOutcome::from_page_error(&e, TrainReason::Error, Some(slot)),
        }
    }

    pub async fn run_task<U: TrainUi + ?Sized>(&self, ui: &U, task: &TrainingTask) -> TrainOutcome {
        let Some(troop) = task.troop() else {
            return TrainOutcome::failed(TrainReason::TroopNotFound, task.building_slot);
        };
        self.train(ui, task.building_type, &troop, task.quantity, task.building_slot)
            .await
    }

    async fn train_at<U: TrainUi + ?Sized>(
        &self,
        ui: &U,
        slot: u32,
        troop: &TroopSpec,
        quantity: Option<u32>,
    ) -> Result<TrainOutcome, PageError> {
        let inputs = ui.troop_inputs().await?;
        let Some(row) = match_troop(&inputs, troop) else {
            tracing::warn!(slot, troop = %troop, "troop row not found");
            return Ok(TrainOutcome::failed(TrainReason::TroopNotFound, Some(slot)));
        };
        let label = troop_label(troop, Some(row));
        let entries = ui.queue_entries().await?;
        let before = counts_for(&inputs, &entries, troop, label.as_deref());

        let requested = quantity.unwrap_or_else(|| available_max(row));
        if requested == 0 {
            return Ok(TrainOutcome::failed(
                TrainReason::NotEnoughResourcesOrZeroMax,
                Some(slot),
            ));
        }
        if !ui.fill_quantity(row.index, requested).await? {
            return Ok(TrainOutcome::failed(TrainReason::TroopNotFound, Some(slot)));
        }
        let Some(buttons) = ui.form_buttons(row.index).await? else {
            return Ok(TrainOutcome::failed(TrainReason::FormNotFound, Some(slot)));
        };
        let Some(button) = pick_train_button(&buttons) else {
            return Ok(TrainOutcome::failed(TrainReason::SubmitButtonNotFound, Some(slot)));
        };
        if !ui.submit(row.index, button).await? {
            return Ok(TrainOutcome::failed(TrainReason::SubmitButtonNotFound, Some(slot)));
        }
        tracing::info!(slot, troop = %troop, requested, "training submitted");

        if let Err(e) = ui.reload(slot).await {
            if e.is_session_closed() {
                return Err(e);
            }
            tracing::warn!(slot, error = %e, "could not reload training page for verification");
        }
        self.verify(ui, slot, troop, label.as_deref(), before, requested).await
    }

    async fn verify<U: TrainUi + ?Sized>(
        &self,
        ui: &U,
        slot: u32,
        troop: &TroopSpec,
        label: Option<&str>,
        before: TroopCounts,
        requested: u32,
    ) -> Result<TrainOutcome, PageError> {
        let base = TrainOutcome {
            success: false,
            reason: None,
            trained: 0,
            requested,
            slot: Some(slot),
            message: None,
        };
        if let Some(banner) = ui.error_banner().await? {
            tracing::warn!(slot, banner = %banner.trim(), "training page shows an error");
            return Ok(TrainOutcome {
                reason: Some(TrainReason::PageError),
                message: Some(normalize(&banner)),
                ..base
            });
        }

        let inputs = ui.troop_inputs().await?;
        let entries = ui.queue_entries().await?;
        let after = counts_for(&inputs, &entries, troop, label);

        match after.applied_since(&before) {
            Some(applied) if applied <= 0 => {
                tracing::warn!(slot, ?before, ?after, "training not applied");
                Ok(TrainOutcome {
                    reason: Some(TrainReason::TrainingNotApplied),
                    ..base
                })
            }
            Some(applied) => {
                let trained = (applied as u64).min(u64::from(requested)) as u32;
                if trained < requested {
                    tracing::warn!(slot, trained, requested, "training partially applied");
                }
                Ok(TrainOutcome {
                    success: true,
                    trained,
                    ..base
                })
            }
            None if queue_shows_troop(&entries, label) => Ok(TrainOutcome {
                success: true,
                trained: requested,
                ..base
            }),
            None => Ok(TrainOutcome {
                reason: Some(TrainReason::TrainingNotQueued),
                ..base
            }),
        }
    }
}

use crate::cache::{VillageCache, RESOURCE_SLOTS};
use crate::normalize::classify_resource;
use crate::page::PageError;
use async_trait::async_trait;
use farmhand_protocol::FieldDescriptor;
use std::time::Duration;
use tokio::time::Instant;

#[derive(Debug, thiserror::Error)]
pub enum ScanError {
    /// Some slot could not be read or classified on every attempt.
    #[error("SCAN_INCOMPLETE_RETRY")]
    Incomplete { found: usize, expected: usize },
    #[error(transparent)]
    Page(#[from] PageError),
}

impl ScanError {
    pub fn is_session_closed(&self) -> bool {
        matches!(self, Self::Page(e) if e.is_session_closed())
    }
}

/// What one slot's detail view shows.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SlotReading {
    pub name: Option<String>,
    pub level: u32,
    /// The construction queue links to this slot.
    pub under_construction: bool,
}

/// Per-slot reads the scanner needs from the game.
#[async_trait]
pub trait SlotSource: Send + Sync {
    async fn read_slot(&self, slot: u32) -> Result<SlotReading, PageError>;

    fn is_closed(&self) -> bool;
}

#[derive(Debug, Clone)]
pub struct Scanner {
    pub retries: u32,
    pub backoff: Duration,
}

impl Default for Scanner {
    fn default() -> Self {
        Self {
            retries: 3,
            backoff: Duration::from_secs(3),
        }
    }
}

impl Scanner {
    /// Reads every resource slot and replaces the cache, or leaves it untouched.
    ///
    /// A failed read abandons the attempt; the next attempt starts again from
    /// slot 1 so no descriptor survives from a pass that saw stale data.
    pub async fn scan<S: SlotSource + ?Sized>(
        &self,
        source: &S,
        cache: &mut VillageCache,
    ) -> Result<Vec<FieldDescriptor>, ScanError> {
        let expected = RESOURCE_SLOTS as usize;
        let attempts = self.retries.max(1);
        let mut found = 0;

        for attempt in 1..=attempts {
            tracing::info!(attempt, attempts, "scanning resource fields");
            let fields = self.read_all(source).await?;
            found = fields.len();

            if found == expected {
                cache.commit(fields.clone(), Instant::now());
                cache.log_status();
                return Ok(fields);
            }

            tracing::error!(found, expected, "incomplete field scan");
            if attempt < attempts {
                tracing::warn!(backoff_ms = self.backoff.as_millis() as u64, "retrying full scan");
                tokio::time::sleep(self.backoff).await;
            }
        }

        Err(ScanError::Incomplete { found, expected })
    }

    async fn read_all<S: SlotSource + ?Sized>(
        &self,
        source: &S,
    ) -> Result<Vec<FieldDescriptor>, ScanError> {
        let mut fields = Vec::with_capacity(RESOURCE_SLOTS as usize);
        for slot in 1..=RESOURCE_SLOTS {
            if source.is_closed() {
                return Err(PageError::Closed.into());
            }
            let reading = match source.read_slot(slot).await {
                Ok(r) => r,
                Err(e) if e.is_session_closed() => return Err(e.into()),
                Err(e) => {
                    tracing::warn!(slot, error = %e, "slot read failed");
                    break;
                }
            };
            let kind = reading.name.as_deref().and_then(classify_resource);
            let Some(kind) = kind else {
                tracing::warn!(slot, name = ?reading.name, "slot label not recognized");
                break;
            };
            let level = if reading.under_construction {
                reading.level + 1
            } else {
                reading.level
            };
            tracing::debug!(slot, kind = %kind, level, queued = reading.under_construction, "slot read");
            fields.push(FieldDescriptor {
                slot,
                kind,
                level,
                is_building: false,
            });
        }
        Ok(fields)
    }

    /// Cached fields while they are fresh, a new scan otherwise.
    pub async fn scan_if_needed<S: SlotSource + ?Sized>(
        &self,
        source: &S,
        cache: &mut VillageCache,
        force_rescan: bool,
    ) -> Result<Vec<FieldDescriptor>, ScanError> {
        if !force_rescan && cache.is_fresh(Instant::now()) {
            if let Some(fields) = cache.fields() {
                tracing::info!("using cached fields");
                return Ok(fields.to_vec());
            }
        }
        self.scan(source, cache).await
    }
}

use chrono::NaiveDate;
use tracing::debug;
use ulid::Ulid;

use crate::model::*;

use super::cache::{CacheEntry, CacheKey};
use super::conflict::now_ms;
use super::slots::{day_window, generate_slots, page_timezone, within_booking_horizon};
use super::sources::gather_busy;
use super::{Engine, EngineError};

impl Engine {
    pub fn page_id_for_slug(&self, slug: &str) -> Option<Ulid> {
        self.slugs.get(slug).map(|e| *e.value())
    }

    /// Current configuration of a page, active or not.
    pub async fn page_config(&self, page_id: Ulid) -> Result<BookingPageConfig, EngineError> {
        let ps = self
            .get_page(&page_id)
            .ok_or_else(|| EngineError::NotFound(format!("page {page_id}")))?;
        let guard = ps.read().await;
        Ok(guard.config.clone())
    }

    /// Slot list for one page and date, served from the cache while fresh.
    ///
    /// Dates outside `[today, today + max_days_advance]` in the page's
    /// timezone yield an empty list without touching any source.
    pub async fn get_or_compute(
        &self,
        page_id: Ulid,
        date: NaiveDate,
    ) -> Result<Vec<Slot>, EngineError> {
        let key = CacheKey::new(page_id, date);
        // Observed before anything is read so a concurrent invalidation
        // makes the final put a no-op.
        let generation = self.cache.generation(&key);

        let ps = self
            .get_page(&page_id)
            .ok_or_else(|| EngineError::NotFound(format!("page {page_id}")))?;
        let config = ps.read().await.config.clone();
        if !config.is_active {
            return Err(EngineError::NotFound(format!("page {page_id}")));
        }
        let tz = page_timezone(&config)?;
        let now = now_ms();
        if !within_booking_horizon(&config, &tz, date, now) {
            return Ok(Vec::new());
        }

        if let Some(entry) = self.cache.get(&key)
            && entry.is_fresh(now, self.settings.cache_ttl_ms)
        {
            debug!(page_id = %page_id, %date, "availability cache hit");
            metrics::counter!(crate::observability::CACHE_HITS_TOTAL).increment(1);
            return Ok(entry.slots);
        }
        debug!(page_id = %page_id, %date, "availability cache miss");
        metrics::counter!(crate::observability::CACHE_MISSES_TOTAL).increment(1);

        let slots = match day_window(&config, &tz, date) {
            Some(window) => {
                let sources = self.busy_sources(&ps, &config.org_id);
                let busy = gather_busy(&sources, window, self.settings.source_timeout).await;
                generate_slots(&config, date, &busy, now)?
            }
            None => Vec::new(),
        };

        self.cache.put(CacheEntry {
            page_id,
            date,
            slots: slots.clone(),
            cached_at: now,
            generation,
        });
        Ok(slots)
    }

    /// Public read path: resolve the slug, then `get_or_compute`.
    pub async fn available_slots(
        &self,
        slug: &str,
        date: NaiveDate,
    ) -> Result<Vec<Slot>, EngineError> {
        let page_id = self
            .page_id_for_slug(slug)
            .ok_or_else(|| EngineError::NotFound(format!("page '{slug}'")))?;
        self.get_or_compute(page_id, date).await
    }

    pub async fn list_bookings(&self, page_id: Ulid) -> Result<Vec<Booking>, EngineError> {
        let ps = self
            .get_page(&page_id)
            .ok_or_else(|| EngineError::NotFound(format!("page {page_id}")))?;
        let guard = ps.read().await;
        Ok(guard.bookings.clone())
    }

    pub async fn get_booking(&self, id: Ulid) -> Option<Booking> {
        let page_id = self.get_page_for_booking(&id)?;
        let ps = self.get_page(&page_id)?;
        let guard = ps.read().await;
        guard.booking(&id).cloned()
    }

    pub fn page_count(&self) -> usize {
        self.pages.len()
    }
}

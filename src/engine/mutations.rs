use std::sync::Arc;

use tokio::sync::{oneshot, RwLock};
use tracing::{info, warn};
use ulid::Ulid;

use crate::limits::*;
use crate::model::*;

use super::conflict::{check_no_conflict, now_ms, validate_config, validate_customer, validate_span};
use super::slots::{dates_touched, is_grid_slot, local_date, page_timezone, within_booking_horizon};
use super::sources::gather_busy;
use super::store::PageState;
use super::{Engine, EngineError, WalCommand};

fn reservation_outcome(outcome: &'static str) {
    metrics::counter!(crate::observability::RESERVATIONS_TOTAL, "outcome" => outcome).increment(1);
}

impl Engine {
    pub async fn create_page(&self, config: BookingPageConfig) -> Result<(), EngineError> {
        validate_config(&config)?;
        let _admin = self.page_admin.lock().await;
        if self.pages.len() >= MAX_PAGES {
            return Err(EngineError::LimitExceeded("too many pages"));
        }
        if self.pages.contains_key(&config.id) {
            return Err(EngineError::AlreadyExists(format!("page {}", config.id)));
        }
        if self.slugs.contains_key(&config.slug) {
            return Err(EngineError::AlreadyExists(format!("slug '{}'", config.slug)));
        }

        let event = Event::PageCreated {
            config: config.clone(),
        };
        self.wal_append(&event).await?;
        let id = config.id;
        self.slugs.insert(config.slug.clone(), id);
        self.pages.insert(id, Arc::new(RwLock::new(PageState::new(config))));
        self.notify.send(&event);
        metrics::gauge!(crate::observability::PAGES_ACTIVE).set(self.pages.len() as f64);
        info!(page_id = %id, "page created");
        Ok(())
    }

    /// Replace a page's configuration. Every cached day of the page is dropped.
    pub async fn update_page(&self, config: BookingPageConfig) -> Result<(), EngineError> {
        validate_config(&config)?;
        let _admin = self.page_admin.lock().await;
        let id = config.id;
        let ps = self
            .get_page(&id)
            .ok_or_else(|| EngineError::NotFound(format!("page {id}")))?;
        if let Some(owner) = self.page_id_for_slug(&config.slug)
            && owner != id
        {
            return Err(EngineError::AlreadyExists(format!("slug '{}'", config.slug)));
        }

        let mut guard = ps.write().await;
        let old_slug = guard.config.slug.clone();
        let event = Event::PageUpdated {
            config: config.clone(),
        };
        self.persist_and_apply(&mut guard, &event, &[]).await?;
        self.cache.invalidate_page(id);
        if old_slug != config.slug {
            self.slugs.remove(&old_slug);
            self.slugs.insert(config.slug, id);
        }
        info!(page_id = %id, "page updated");
        Ok(())
    }

    /// Reservation guard. Re-derives busy time for exactly the requested
    /// window and inserts the booking only if nothing overlaps it; the check
    /// and the insert happen under the page's write lock.
    pub async fn reserve(
        &self,
        page_id: Ulid,
        span: Span,
        customer: CustomerInfo,
    ) -> Result<Booking, EngineError> {
        let result = self.try_reserve(page_id, span, customer).await;
        match &result {
            Ok(_) => reservation_outcome("created"),
            Err(EngineError::Conflict { .. }) => reservation_outcome("conflict"),
            Err(_) => reservation_outcome("rejected"),
        }
        result
    }

    async fn try_reserve(
        &self,
        page_id: Ulid,
        span: Span,
        customer: CustomerInfo,
    ) -> Result<Booking, EngineError> {
        validate_span(&span)?;
        validate_customer(&customer)?;
        let ps = self
            .get_page(&page_id)
            .ok_or_else(|| EngineError::NotFound(format!("page {page_id}")))?;
        let config = ps.read().await.config.clone();
        if !config.is_active {
            return Err(EngineError::NotFound(format!("page {page_id}")));
        }
        let tz = page_timezone(&config)?;
        let now = now_ms();
        if span.start < now {
            return Err(EngineError::Validation("start time is in the past".into()));
        }
        if span.start < now + config.notice_ms() {
            return Err(EngineError::Validation(format!(
                "bookings need {} hours notice",
                config.booking_notice_hours
            )));
        }
        let in_horizon = local_date(&tz, span.start)
            .is_some_and(|d| within_booking_horizon(&config, &tz, d, now));
        if !in_horizon {
            return Err(EngineError::Validation(format!(
                "bookings open at most {} days ahead",
                config.max_days_advance
            )));
        }

        // Slow and failure-prone: gathered before taking the lock.
        let external = gather_busy(
            &self.external_sources(&config.org_id),
            span,
            self.settings.source_timeout,
        )
        .await;

        let mut guard = ps.write().await;
        if !guard.config.is_active {
            return Err(EngineError::NotFound(format!("page {page_id}")));
        }
        // The grid may have moved since the config snapshot above.
        if !is_grid_slot(&guard.config, &page_timezone(&guard.config)?, &span) {
            return Err(EngineError::Validation(
                "requested window is not one of the page's slots".into(),
            ));
        }
        if guard.active_count() >= self.settings.max_active_bookings {
            return Err(EngineError::LimitExceeded("too many active bookings on page"));
        }
        if let Err(e) = check_no_conflict(&guard, &span, &external) {
            warn!(page_id = %page_id, "reservation refused: {e}");
            return Err(e);
        }

        let status = if guard.config.auto_confirm {
            BookingStatus::Confirmed
        } else {
            BookingStatus::Pending
        };
        let booking = Booking {
            id: Ulid::new(),
            page_id,
            customer,
            span,
            status,
            created_at: now,
            calendar_event_id: None,
        };
        let event = Event::BookingCreated {
            booking: booking.clone(),
        };
        let touched = dates_touched(&tz, &span);
        self.persist_and_apply(&mut guard, &event, &touched).await?;
        info!(booking_id = %booking.id, page_id = %page_id, status = %status, "booking created");
        Ok(booking)
    }

    /// Move a booking through its state machine. Leaving an active state
    /// frees the time, so those transitions drop the cached days it touches.
    pub async fn transition_booking(
        &self,
        id: Ulid,
        to: BookingStatus,
    ) -> Result<Booking, EngineError> {
        let (page_id, mut guard) = self.resolve_booking_write(&id).await?;
        let booking = guard
            .booking(&id)
            .ok_or_else(|| EngineError::NotFound(format!("booking {id}")))?;
        let from = booking.status;
        if !from.can_transition_to(to) {
            return Err(EngineError::InvalidTransition { from, to });
        }
        let touched = if to.is_active() {
            Vec::new()
        } else {
            dates_touched(&page_timezone(&guard.config)?, &booking.span)
        };

        let event = Event::BookingStatusChanged { id, page_id, from, to };
        self.persist_and_apply(&mut guard, &event, &touched).await?;
        info!(booking_id = %id, page_id = %page_id, "booking {from} -> {to}");
        guard
            .booking(&id)
            .cloned()
            .ok_or_else(|| EngineError::NotFound(format!("booking {id}")))
    }

    pub async fn confirm_booking(&self, id: Ulid) -> Result<Booking, EngineError> {
        self.transition_booking(id, BookingStatus::Confirmed).await
    }

    pub async fn cancel_booking(&self, id: Ulid) -> Result<Booking, EngineError> {
        self.transition_booking(id, BookingStatus::Cancelled).await
    }

    pub async fn complete_booking(&self, id: Ulid) -> Result<Booking, EngineError> {
        self.transition_booking(id, BookingStatus::Completed).await
    }

    pub async fn mark_no_show(&self, id: Ulid) -> Result<Booking, EngineError> {
        self.transition_booking(id, BookingStatus::NoShow).await
    }

    /// Record the external calendar event created for a booking.
    pub async fn link_calendar_event(&self, id: Ulid, event_id: String) -> Result<(), EngineError> {
        let (page_id, mut guard) = self.resolve_booking_write(&id).await?;
        let event = Event::CalendarEventLinked { id, page_id, event_id };
        self.persist_and_apply(&mut guard, &event, &[]).await
    }

    /// Compact the WAL by rewriting it with only the events needed to recreate the current state.
    pub async fn compact_wal(&self) -> Result<(), EngineError> {
        // Read locks are held until the rewrite lands so no commit slips
        // between the snapshot and the swap.
        let _admin = self.page_admin.lock().await;
        let shared: Vec<_> = self.pages.iter().map(|e| e.value().clone()).collect();
        let mut guards = Vec::with_capacity(shared.len());
        let mut events = Vec::new();
        for ps in shared {
            let guard = ps.read_owned().await;
            events.push(Event::PageCreated {
                config: guard.config.clone(),
            });
            // A booking record carries its current status and calendar link.
            events.extend(guard.bookings.iter().map(|b| Event::BookingCreated { booking: b.clone() }));
            guards.push(guard);
        }

        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Compact { events, response: tx })
            .await
            .map_err(|_| EngineError::WalError("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| EngineError::WalError("WAL writer dropped response".into()))?
            .map_err(|e| EngineError::WalError(e.to_string()))
    }

    pub async fn wal_appends_since_compact(&self) -> u64 {
        let (tx, rx) = oneshot::channel();
        if self
            .wal_tx
            .send(WalCommand::AppendsSinceCompact { response: tx })
            .await
            .is_err()
        {
            return 0;
        }
        rx.await.unwrap_or(0)
    }
}

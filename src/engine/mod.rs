mod cache;
mod conflict;
mod error;
mod mutations;
mod queries;
mod slots;
mod sources;
mod store;

pub use cache::{AvailabilityCache, CacheEntry, CacheKey, InMemoryCache};
pub use error::EngineError;
pub use slots::{
    dates_touched, day_window, format_instant, generate_slots, is_grid_slot, local_date,
    merge_overlapping,
    page_timezone, within_booking_horizon,
};
pub use sources::{gather_busy, BookingStoreSource, BusySource, CalendarBusySource};
pub use store::PageState;
pub(crate) use conflict::now_ms;

use std::collections::HashMap;
use std::io;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use chrono::NaiveDate;
use dashmap::DashMap;
use tokio::sync::{mpsc, oneshot, Mutex, RwLock};
use tracing::error;
use ulid::Ulid;

use crate::calendar::CalendarIntegration;
use crate::limits::{CACHE_TTL_MS, DEFAULT_SOURCE_TIMEOUT_MS, MAX_ACTIVE_BOOKINGS_PER_PAGE};
use crate::model::*;
use crate::notify::NotifyHub;
use crate::wal::Wal;

pub type SharedPageState = Arc<RwLock<PageState>>;

// ── Group-commit WAL channel ─────────────────────────────

pub(super) enum WalCommand {
    Append {
        event: Event,
        response: oneshot::Sender<io::Result<()>>,
    },
    Compact {
        events: Vec<Event>,
        response: oneshot::Sender<io::Result<()>>,
    },
    AppendsSinceCompact {
        response: oneshot::Sender<u64>,
    },
}

type PendingAppend = (Event, oneshot::Sender<io::Result<()>>);

/// Owns the WAL. Every append that is already queued when the writer wakes
/// up joins the same batch and shares one fsync.
async fn wal_writer_loop(mut wal: Wal, mut rx: mpsc::Receiver<WalCommand>) {
    while let Some(cmd) = rx.recv().await {
        let WalCommand::Append { event, response } = cmd else {
            handle_command(&mut wal, cmd);
            continue;
        };
        let mut batch = vec![(event, response)];
        let mut deferred = None;
        while let Ok(next) = rx.try_recv() {
            match next {
                WalCommand::Append { event, response } => batch.push((event, response)),
                other => {
                    deferred = Some(other);
                    break;
                }
            }
        }
        commit_batch(&mut wal, batch);
        if let Some(cmd) = deferred {
            handle_command(&mut wal, cmd);
        }
    }
}

fn commit_batch(wal: &mut Wal, batch: Vec<PendingAppend>) {
    metrics::histogram!(crate::observability::WAL_FLUSH_BATCH_SIZE).record(batch.len() as f64);
    let started = std::time::Instant::now();

    let mut result = Ok(());
    for (event, _) in &batch {
        if let Err(e) = wal.append_buffered(event) {
            result = Err(e);
            break;
        }
    }
    // Flush even after a failed append so the next batch starts clean.
    let flushed = wal.flush_sync();
    if result.is_ok() {
        result = flushed;
    }

    metrics::histogram!(crate::observability::WAL_FLUSH_DURATION_SECONDS)
        .record(started.elapsed().as_secs_f64());

    for (_, tx) in batch {
        let r = match &result {
            Ok(()) => Ok(()),
            Err(e) => Err(io::Error::new(e.kind(), e.to_string())),
        };
        let _ = tx.send(r);
    }
}

fn handle_command(wal: &mut Wal, cmd: WalCommand) {
    match cmd {
        WalCommand::Append { event, response } => commit_batch(wal, vec![(event, response)]),
        WalCommand::Compact { events, response } => {
            let result =
                Wal::write_compact_file(wal.path(), &events).and_then(|()| wal.swap_compact_file());
            let _ = response.send(result);
        }
        WalCommand::AppendsSinceCompact { response } => {
            let _ = response.send(wal.appends_since_compact());
        }
    }
}

// ── Engine ───────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct EngineSettings {
    /// Budget for each busy source call.
    pub source_timeout: Duration,
    /// Age after which a cached slot list is recomputed.
    pub cache_ttl_ms: Ms,
    /// Cap on pending and confirmed bookings per page.
    pub max_active_bookings: usize,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            source_timeout: Duration::from_millis(DEFAULT_SOURCE_TIMEOUT_MS),
            cache_ttl_ms: CACHE_TTL_MS,
            max_active_bookings: MAX_ACTIVE_BOOKINGS_PER_PAGE,
        }
    }
}

pub struct Engine {
    pub(super) pages: DashMap<Ulid, SharedPageState>,
    pub(super) slugs: DashMap<String, Ulid>,
    /// Reverse lookup: booking id → page id
    pub(super) booking_to_page: DashMap<Ulid, Ulid>,
    pub(super) wal_tx: mpsc::Sender<WalCommand>,
    pub notify: Arc<NotifyHub>,
    pub(super) cache: Arc<dyn AvailabilityCache>,
    /// Connected calendars per organisation.
    pub(super) calendars: DashMap<Ulid, Vec<Arc<dyn CalendarIntegration>>>,
    pub(super) settings: EngineSettings,
    /// Serializes page creation and slug changes.
    pub(super) page_admin: Mutex<()>,
}

/// Apply an event to a page. The caller holds the page lock.
fn apply_to_page(ps: &mut PageState, event: &Event, booking_index: &DashMap<Ulid, Ulid>) {
    match event {
        Event::PageUpdated { config } => {
            ps.config = config.clone();
        }
        Event::BookingCreated { booking } => {
            booking_index.insert(booking.id, booking.page_id);
            if let Err(existing) = ps.insert_booking(booking.clone()) {
                error!(
                    booking_id = %booking.id,
                    page_id = %booking.page_id,
                    "booking overlaps active booking {existing}, dropped"
                );
            }
        }
        Event::BookingStatusChanged { id, to, .. } => {
            if let Some(b) = ps.booking_mut(id) {
                b.status = *to;
            }
        }
        Event::CalendarEventLinked { id, event_id, .. } => {
            if let Some(b) = ps.booking_mut(id) {
                b.calendar_event_id = Some(event_id.clone());
            }
        }
        // Handled at the map level
        Event::PageCreated { .. } => {}
    }
}

impl Engine {
    pub fn new(wal_path: PathBuf, notify: Arc<NotifyHub>) -> io::Result<Self> {
        Self::open(
            wal_path,
            notify,
            EngineSettings::default(),
            Arc::new(InMemoryCache::new()),
        )
    }

    pub fn open(
        wal_path: PathBuf,
        notify: Arc<NotifyHub>,
        settings: EngineSettings,
        cache: Arc<dyn AvailabilityCache>,
    ) -> io::Result<Self> {
        let events = Wal::replay(&wal_path)?;
        let wal = Wal::open(&wal_path)?;
        let (wal_tx, wal_rx) = mpsc::channel(4096);
        tokio::spawn(wal_writer_loop(wal, wal_rx));

        let booking_to_page = DashMap::new();
        let mut replayed: HashMap<Ulid, PageState> = HashMap::new();
        for event in &events {
            match event {
                Event::PageCreated { config } => {
                    replayed.insert(config.id, PageState::new(config.clone()));
                }
                other => {
                    if let Some(ps) = replayed.get_mut(&other.page_id()) {
                        apply_to_page(ps, other, &booking_to_page);
                    }
                }
            }
        }

        let pages = DashMap::new();
        let slugs = DashMap::new();
        for (id, ps) in replayed {
            slugs.insert(ps.config.slug.clone(), id);
            pages.insert(id, Arc::new(RwLock::new(ps)));
        }

        Ok(Self {
            pages,
            slugs,
            booking_to_page,
            wal_tx,
            notify,
            cache,
            calendars: DashMap::new(),
            settings,
            page_admin: Mutex::new(()),
        })
    }

    /// Write event to WAL via the background group-commit writer.
    async fn wal_append(&self, event: &Event) -> Result<(), EngineError> {
        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Append {
                event: event.clone(),
                response: tx,
            })
            .await
            .map_err(|_| EngineError::WalError("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| EngineError::WalError("WAL writer dropped response".into()))?
            .map_err(|e| EngineError::WalError(e.to_string()))
    }

    /// Durable append, in-memory apply, cache invalidation for `touched`,
    /// then notification. The caller holds the page's write lock.
    pub(super) async fn persist_and_apply(
        &self,
        ps: &mut PageState,
        event: &Event,
        touched: &[NaiveDate],
    ) -> Result<(), EngineError> {
        self.wal_append(event).await?;
        apply_to_page(ps, event, &self.booking_to_page);
        let page_id = event.page_id();
        for date in touched {
            self.cache.invalidate(&CacheKey::new(page_id, *date));
        }
        self.notify.send(event);
        Ok(())
    }

    pub fn get_page(&self, id: &Ulid) -> Option<SharedPageState> {
        self.pages.get(id).map(|e| e.value().clone())
    }

    pub fn get_page_for_booking(&self, booking_id: &Ulid) -> Option<Ulid> {
        self.booking_to_page.get(booking_id).map(|e| *e.value())
    }

    /// Lookup booking → page, get page, acquire write lock.
    pub(super) async fn resolve_booking_write(
        &self,
        booking_id: &Ulid,
    ) -> Result<(Ulid, tokio::sync::OwnedRwLockWriteGuard<PageState>), EngineError> {
        let page_id = self
            .get_page_for_booking(booking_id)
            .ok_or_else(|| EngineError::NotFound(format!("booking {booking_id}")))?;
        let ps = self
            .get_page(&page_id)
            .ok_or_else(|| EngineError::NotFound(format!("page {page_id}")))?;
        let guard = ps.write_owned().await;
        Ok((page_id, guard))
    }

    pub fn register_calendar(&self, org_id: Ulid, integration: Arc<dyn CalendarIntegration>) {
        self.calendars.entry(org_id).or_default().push(integration);
    }

    pub fn calendars_for(&self, org_id: &Ulid) -> Vec<Arc<dyn CalendarIntegration>> {
        self.calendars
            .get(org_id)
            .map(|c| c.value().clone())
            .unwrap_or_default()
    }

    pub fn cache(&self) -> &Arc<dyn AvailabilityCache> {
        &self.cache
    }

    pub fn settings(&self) -> &EngineSettings {
        &self.settings
    }

    /// Sources consulted on the read path: the page's bookings plus every
    /// calendar connected for its organisation.
    pub(super) fn busy_sources(&self, page: &SharedPageState, org_id: &Ulid) -> Vec<Arc<dyn BusySource>> {
        let mut sources: Vec<Arc<dyn BusySource>> =
            vec![Arc::new(BookingStoreSource::new(page.clone()))];
        sources.extend(self.external_sources(org_id));
        sources
    }

    /// Calendar sources only. The write path checks bookings under the page lock.
    pub(super) fn external_sources(&self, org_id: &Ulid) -> Vec<Arc<dyn BusySource>> {
        self.calendars_for(org_id)
            .into_iter()
            .map(|c| Arc::new(CalendarBusySource::new(*org_id, c)) as Arc<dyn BusySource>)
            .collect()
    }
}

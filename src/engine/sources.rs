use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::future::join_all;
use tracing::warn;
use ulid::Ulid;

use crate::calendar::CalendarIntegration;
use crate::model::*;

use super::SharedPageState;

// ── Busy-Interval Sources ────────────────────────────────────────

/// Anything that can report unavailable time. Implementations fail softly:
/// a source that cannot answer returns an empty list.
#[async_trait]
pub trait BusySource: Send + Sync {
    fn name(&self) -> &str;

    async fn list_busy(&self, range: Span) -> Vec<BusyInterval>;
}

/// Active bookings already committed on a page.
pub struct BookingStoreSource {
    page: SharedPageState,
}

impl BookingStoreSource {
    pub fn new(page: SharedPageState) -> Self {
        Self { page }
    }
}

#[async_trait]
impl BusySource for BookingStoreSource {
    fn name(&self) -> &str {
        "bookings"
    }

    async fn list_busy(&self, range: Span) -> Vec<BusyInterval> {
        let guard = self.page.read().await;
        guard
            .active_overlapping(&range)
            .map(|b| BusyInterval {
                span: b.span,
                source: format!("booking {}", b.id),
            })
            .collect()
    }
}

/// Adapter from a calendar integration to a busy source for one organisation.
pub struct CalendarBusySource {
    org_id: Ulid,
    label: String,
    integration: Arc<dyn CalendarIntegration>,
}

impl CalendarBusySource {
    pub fn new(org_id: Ulid, integration: Arc<dyn CalendarIntegration>) -> Self {
        let label = format!("calendar:{}", integration.provider());
        Self {
            org_id,
            label,
            integration,
        }
    }
}

#[async_trait]
impl BusySource for CalendarBusySource {
    fn name(&self) -> &str {
        &self.label
    }

    async fn list_busy(&self, range: Span) -> Vec<BusyInterval> {
        match self.integration.list_busy_times(self.org_id, range).await {
            Ok(spans) => spans
                .into_iter()
                .filter(|s| s.start < s.end)
                .map(|span| BusyInterval {
                    span,
                    source: self.label.clone(),
                })
                .collect(),
            Err(e) => {
                warn!(source = %self.label, org_id = %self.org_id, "busy source failed, contributing nothing: {e}");
                metrics::counter!(crate::observability::BUSY_SOURCE_FAILURES_TOTAL, "reason" => "error")
                    .increment(1);
                Vec::new()
            }
        }
    }
}

/// Query every source concurrently, each under its own timeout. A source that
/// times out is treated exactly like one that failed: it contributes nothing.
/// Returns intervals overlapping `range`, sorted by start.
pub async fn gather_busy(
    sources: &[Arc<dyn BusySource>],
    range: Span,
    per_source_timeout: Duration,
) -> Vec<BusyInterval> {
    let calls = sources.iter().map(|source| async move {
        match tokio::time::timeout(per_source_timeout, source.list_busy(range)).await {
            Ok(intervals) => intervals,
            Err(_) => {
                warn!(source = source.name(), "busy source timed out after {per_source_timeout:?}");
                metrics::counter!(crate::observability::BUSY_SOURCE_FAILURES_TOTAL, "reason" => "timeout")
                    .increment(1);
                Vec::new()
            }
        }
    });

    let mut busy: Vec<BusyInterval> = join_all(calls)
        .await
        .into_iter()
        .flatten()
        .filter(|b| b.span.overlaps(&range))
        .collect();
    busy.sort_by_key(|b| (b.span.start, b.span.end));
    busy
}

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::broadcast::error::RecvError;
use tracing::{error, info, warn};

use crate::calendar::{CalendarEventDetails, CollaboratorError};
use crate::engine::Engine;
use crate::model::{Booking, Event};

/// Outbound customer and business messaging.
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn send_customer_confirmation(
        &self,
        booking: &Booking,
        business_name: &str,
    ) -> Result<(), CollaboratorError>;

    async fn send_business_notification(
        &self,
        booking: &Booking,
        business_name: &str,
    ) -> Result<(), CollaboratorError>;

    async fn send_confirmation_sms(
        &self,
        booking: &Booking,
        business_name: &str,
    ) -> Result<(), CollaboratorError>;
}

/// Notifier that only records what would have been sent.
#[derive(Debug, Default)]
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn send_customer_confirmation(
        &self,
        booking: &Booking,
        business_name: &str,
    ) -> Result<(), CollaboratorError> {
        info!(
            booking_id = %booking.id,
            to = booking.customer.email.as_deref().unwrap_or_default(),
            "customer confirmation for {business_name}"
        );
        Ok(())
    }

    async fn send_business_notification(
        &self,
        booking: &Booking,
        business_name: &str,
    ) -> Result<(), CollaboratorError> {
        info!(booking_id = %booking.id, "new booking notification for {business_name}");
        Ok(())
    }

    async fn send_confirmation_sms(
        &self,
        booking: &Booking,
        business_name: &str,
    ) -> Result<(), CollaboratorError> {
        info!(
            booking_id = %booking.id,
            to = %booking.customer.phone,
            "confirmation sms for {business_name}"
        );
        Ok(())
    }
}

/// Consume committed events and run post-commit side effects. Each
/// booking is handled on its own task; failures are logged and counted,
/// never retried.
pub async fn run_dispatcher(engine: Arc<Engine>, notifier: Arc<dyn Notifier>) {
    let mut rx = engine.notify.subscribe_all();
    loop {
        match rx.recv().await {
            Ok(Event::BookingCreated { booking }) => {
                let engine = engine.clone();
                let notifier = notifier.clone();
                tokio::spawn(async move {
                    dispatch_booking(&engine, notifier.as_ref(), booking).await;
                });
            }
            Ok(_) => {}
            Err(RecvError::Lagged(n)) => {
                warn!("dispatcher lagged, {n} events skipped");
                metrics::counter!(crate::observability::DISPATCH_FAILURES_TOTAL, "kind" => "lagged")
                    .increment(n);
            }
            Err(RecvError::Closed) => break,
        }
    }
}

async fn dispatch_booking(engine: &Engine, notifier: &dyn Notifier, booking: Booking) {
    let config = match engine.page_config(booking.page_id).await {
        Ok(c) => c,
        Err(e) => {
            failed("page", &booking, &e);
            return;
        }
    };
    let name = config.business_name.as_str();

    if booking.customer.email.is_some()
        && let Err(e) = notifier.send_customer_confirmation(&booking, name).await
    {
        failed("email", &booking, &e);
    }
    if let Err(e) = notifier.send_confirmation_sms(&booking, name).await {
        failed("sms", &booking, &e);
    }
    if let Err(e) = notifier.send_business_notification(&booking, name).await {
        failed("business", &booking, &e);
    }

    let details = CalendarEventDetails::for_booking(&booking, name, &config.timezone);
    let mut linked = false;
    for calendar in engine.calendars_for(&config.org_id) {
        match calendar.create_event(config.org_id, &details).await {
            Ok(Some(event_id)) if !linked => {
                linked = true;
                if let Err(e) = engine.link_calendar_event(booking.id, event_id).await {
                    failed("calendar_link", &booking, &e);
                }
            }
            Ok(_) => {}
            Err(e) => failed("calendar", &booking, &e),
        }
    }
}

fn failed(kind: &'static str, booking: &Booking, err: &dyn std::fmt::Display) {
    error!(booking_id = %booking.id, kind, "post-commit dispatch failed: {err}");
    metrics::counter!(crate::observability::DISPATCH_FAILURES_TOTAL, "kind" => kind).increment(1);
}

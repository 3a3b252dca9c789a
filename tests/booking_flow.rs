use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use chrono::{Days, NaiveDate, Utc};
use tokio::net::TcpListener;
use tokio_postgres::error::SqlState;
use tokio_postgres::{Config, NoTls, SimpleQueryMessage, SimpleQueryRow};
use ulid::Ulid;

use slotward::auth::{Credentials, SlotwardAuthSource};
use slotward::engine::{Engine, EngineSettings, InMemoryCache};
use slotward::notify::NotifyHub;
use slotward::wire::{self, SlotwardFactory};

const ADMIN: (&str, &str) = ("owner", "owner-pw");
const PUBLIC: (&str, &str) = ("booking", "booking-pw");

const EVERY_DAY_NINE_TO_FIVE: &str = r#"{
    "monday": {"enabled": true, "start": "09:00", "end": "17:00"},
    "tuesday": {"enabled": true, "start": "09:00", "end": "17:00"},
    "wednesday": {"enabled": true, "start": "09:00", "end": "17:00"},
    "thursday": {"enabled": true, "start": "09:00", "end": "17:00"},
    "friday": {"enabled": true, "start": "09:00", "end": "17:00"},
    "saturday": {"enabled": true, "start": "09:00", "end": "17:00"},
    "sunday": {"enabled": true, "start": "09:00", "end": "17:00"}
}"#;

// ── Test infrastructure ──────────────────────────────────────

async fn start_test_server() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let dir = std::env::temp_dir().join(format!("slotward_int_test_{}", Ulid::new()));
    std::fs::create_dir_all(&dir).unwrap();
    let engine = Arc::new(
        Engine::open(
            dir.join("slotward.wal"),
            Arc::new(NotifyHub::new()),
            EngineSettings::default(),
            Arc::new(InMemoryCache::new()),
        )
        .unwrap(),
    );
    let auth = SlotwardAuthSource::new(
        Credentials {
            user: PUBLIC.0.into(),
            password: PUBLIC.1.into(),
        },
        Credentials {
            user: ADMIN.0.into(),
            password: ADMIN.1.into(),
        },
    );
    let factory = Arc::new(SlotwardFactory::new(
        engine,
        auth,
        ADMIN.0.into(),
        Duration::from_secs(5),
    ));

    tokio::spawn(async move {
        loop {
            let (socket, _) = match listener.accept().await {
                Ok(conn) => conn,
                Err(_) => break,
            };
            let factory = factory.clone();
            tokio::spawn(async move {
                let _ = wire::process_connection(socket, factory).await;
            });
        }
    });

    addr
}

async fn try_connect(
    addr: SocketAddr,
    (user, password): (&str, &str),
) -> Result<tokio_postgres::Client, tokio_postgres::Error> {
    let mut config = Config::new();
    config
        .host(addr.ip().to_string())
        .port(addr.port())
        .dbname("slotward")
        .user(user)
        .password(password);

    let (client, connection) = config.connect(NoTls).await?;
    tokio::spawn(async move {
        let _ = connection.await;
    });
    Ok(client)
}

async fn connect(addr: SocketAddr, login: (&str, &str)) -> tokio_postgres::Client {
    try_connect(addr, login).await.unwrap()
}

async fn create_page(admin: &tokio_postgres::Client, slug: &str) {
    admin
        .batch_execute(&format!(
            "INSERT INTO pages (id, org_id, slug, business_name, timezone, business_hours, slot_duration, max_days_advance, auto_confirm) \
             VALUES ('{}', '{}', '{slug}', 'Acme Hair', 'UTC', '{EVERY_DAY_NINE_TO_FIVE}', 60, 30, true)",
            Ulid::new(),
            Ulid::new(),
        ))
        .await
        .unwrap();
}

fn rows(messages: Vec<SimpleQueryMessage>) -> Vec<SimpleQueryRow> {
    messages
        .into_iter()
        .filter_map(|m| match m {
            SimpleQueryMessage::Row(row) => Some(row),
            _ => None,
        })
        .collect()
}

fn tomorrow() -> NaiveDate {
    Utc::now().date_naive() + Days::new(1)
}

fn instant(date: NaiveDate, hour: u32) -> String {
    date.and_hms_opt(hour, 0, 0).unwrap().and_utc().to_rfc3339()
}

async fn availability(
    client: &tokio_postgres::Client,
    slug: &str,
    date: NaiveDate,
) -> Vec<(String, bool)> {
    let messages = client
        .simple_query(&format!(
            "SELECT * FROM availability WHERE page = '{slug}' AND date = '{date}'"
        ))
        .await
        .unwrap();
    rows(messages)
        .iter()
        .map(|r| {
            (
                r.get("start_time").unwrap().to_string(),
                r.get("is_available") == Some("t"),
            )
        })
        .collect()
}

fn book_sql(slug: &str, date: NaiveDate, hour: u32, name: &str) -> String {
    format!(
        "INSERT INTO bookings (page, start_time, end_time, name, phone) \
         VALUES ('{slug}', '{}', '{}', '{name}', '+15550100')",
        instant(date, hour),
        instant(date, hour + 1),
    )
}

fn sqlstate(err: &tokio_postgres::Error) -> Option<&SqlState> {
    err.code()
}

// ── Tests ────────────────────────────────────────────────────

#[tokio::test]
async fn public_caller_sees_slots_and_books_one() {
    let addr = start_test_server().await;
    let admin = connect(addr, ADMIN).await;
    create_page(&admin, "acme-hair").await;

    let public = connect(addr, PUBLIC).await;
    let date = tomorrow();
    let slots = availability(&public, "acme-hair", date).await;
    assert_eq!(slots.len(), 8);
    assert!(slots.iter().all(|(_, free)| *free));
    assert_eq!(slots[0].0, instant(date, 9));

    let messages = public
        .simple_query(&book_sql("acme-hair", date, 10, "Ana"))
        .await
        .unwrap();
    let created = rows(messages);
    assert_eq!(created.len(), 1);
    assert_eq!(created[0].get("status"), Some("confirmed"));
    assert_eq!(created[0].get("start_time"), Some(instant(date, 10).as_str()));

    let slots = availability(&public, "acme-hair", date).await;
    let ten = slots.iter().find(|(start, _)| *start == instant(date, 10)).unwrap();
    assert!(!ten.1, "booked slot must no longer be offered");
    assert_eq!(slots.iter().filter(|(_, free)| *free).count(), 7);
}

#[tokio::test]
async fn second_booking_for_same_slot_conflicts() {
    let addr = start_test_server().await;
    let admin = connect(addr, ADMIN).await;
    create_page(&admin, "corner-barber").await;

    let first = connect(addr, PUBLIC).await;
    let second = connect(addr, PUBLIC).await;
    let date = tomorrow();

    first
        .simple_query(&book_sql("corner-barber", date, 13, "Ana"))
        .await
        .unwrap();
    let err = second
        .simple_query(&book_sql("corner-barber", date, 13, "Ben"))
        .await
        .unwrap_err();
    assert_eq!(sqlstate(&err), Some(&SqlState::EXCLUSION_VIOLATION));
}

#[tokio::test]
async fn public_role_cannot_administer() {
    let addr = start_test_server().await;
    let public = connect(addr, PUBLIC).await;

    let err = public
        .batch_execute(&format!(
            "INSERT INTO pages (id, org_id, slug, business_hours, slot_duration) \
             VALUES ('{}', '{}', 'sneaky', '{{}}', 30)",
            Ulid::new(),
            Ulid::new(),
        ))
        .await
        .unwrap_err();
    assert_eq!(sqlstate(&err), Some(&SqlState::INSUFFICIENT_PRIVILEGE));

    let err = public
        .simple_query("SELECT * FROM bookings WHERE page = 'acme-hair'")
        .await
        .unwrap_err();
    assert_eq!(sqlstate(&err), Some(&SqlState::INSUFFICIENT_PRIVILEGE));
}

#[tokio::test]
async fn unknown_slug_is_not_found() {
    let addr = start_test_server().await;
    let public = connect(addr, PUBLIC).await;

    let err = public
        .simple_query(&format!(
            "SELECT * FROM availability WHERE page = 'nobody' AND date = '{}'",
            tomorrow()
        ))
        .await
        .unwrap_err();
    assert_eq!(sqlstate(&err), Some(&SqlState::NO_DATA_FOUND));
}

#[tokio::test]
async fn malformed_date_is_rejected() {
    let addr = start_test_server().await;
    let admin = connect(addr, ADMIN).await;
    create_page(&admin, "acme-hair").await;

    let err = admin
        .simple_query("SELECT * FROM availability WHERE page = 'acme-hair' AND date = '19/10/2026'")
        .await
        .unwrap_err();
    assert_eq!(sqlstate(&err), Some(&SqlState::INVALID_PARAMETER_VALUE));
}

#[tokio::test]
async fn inverted_window_is_rejected_and_session_survives() {
    let addr = start_test_server().await;
    let admin = connect(addr, ADMIN).await;
    create_page(&admin, "acme-hair").await;

    let public = connect(addr, PUBLIC).await;
    let date = tomorrow();
    let err = public
        .simple_query(&format!(
            "INSERT INTO bookings (page, start_time, end_time, name, phone) \
             VALUES ('acme-hair', '{}', '{}', 'Ana', '+15550100')",
            instant(date, 11),
            instant(date, 10),
        ))
        .await
        .unwrap_err();
    assert_eq!(sqlstate(&err), Some(&SqlState::INVALID_PARAMETER_VALUE));

    // Same connection keeps working.
    assert_eq!(availability(&public, "acme-hair", date).await.len(), 8);
}

#[tokio::test]
async fn window_off_the_slot_grid_is_rejected() {
    let addr = start_test_server().await;
    let admin = connect(addr, ADMIN).await;
    create_page(&admin, "acme-hair").await;

    let public = connect(addr, PUBLIC).await;
    let date = tomorrow();
    let err = public
        .simple_query(&format!(
            "INSERT INTO bookings (page, start_time, end_time, name, phone) \
             VALUES ('acme-hair', '{}', '{}', 'Ana', '+15550100')",
            instant(date, 3),
            instant(date, 4),
        ))
        .await
        .unwrap_err();
    assert_eq!(sqlstate(&err), Some(&SqlState::INVALID_PARAMETER_VALUE));
}

#[tokio::test]
async fn admin_cancel_frees_the_slot() {
    let addr = start_test_server().await;
    let admin = connect(addr, ADMIN).await;
    create_page(&admin, "acme-hair").await;
    let date = tomorrow();

    let created = rows(
        admin
            .simple_query(&book_sql("acme-hair", date, 15, "Cy"))
            .await
            .unwrap(),
    );
    let id = created[0].get("id").unwrap().to_string();

    let listed = rows(
        admin
            .simple_query("SELECT * FROM bookings WHERE page = 'acme-hair'")
            .await
            .unwrap(),
    );
    assert_eq!(listed.len(), 1);
    assert_eq!(listed[0].get("name"), Some("Cy"));

    admin
        .batch_execute(&format!("DELETE FROM bookings WHERE id = '{id}'"))
        .await
        .unwrap();

    let slots = availability(&admin, "acme-hair", date).await;
    let three = slots.iter().find(|(start, _)| *start == instant(date, 15)).unwrap();
    assert!(three.1);

    // cancelled is terminal
    let err = admin
        .batch_execute(&format!(
            "INSERT INTO booking_status (booking_id, status) VALUES ('{id}', 'confirmed')"
        ))
        .await
        .unwrap_err();
    assert_eq!(sqlstate(&err), Some(&SqlState::OBJECT_NOT_IN_PREREQUISITE_STATE));
}

#[tokio::test]
async fn listen_validates_channel() {
    let addr = start_test_server().await;
    let admin = connect(addr, ADMIN).await;

    let err = admin.batch_execute("LISTEN resource_1").await.unwrap_err();
    assert!(err.code().is_some());

    let err = admin
        .batch_execute(&format!("LISTEN page_{}", Ulid::new()))
        .await
        .unwrap_err();
    assert_eq!(sqlstate(&err), Some(&SqlState::NO_DATA_FOUND));
}

#[tokio::test]
async fn wrong_password_is_refused() {
    let addr = start_test_server().await;
    assert!(try_connect(addr, (ADMIN.0, "guess")).await.is_err());
    assert!(try_connect(addr, ("mallory", "x")).await.is_err());
}

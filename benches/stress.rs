use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{Days, NaiveDate, Utc};
use tokio_postgres::error::SqlState;
use tokio_postgres::{Config, NoTls};
use ulid::Ulid;

const EVERY_DAY_EIGHT_TO_EIGHT: &str = r#"{"monday":{"enabled":true,"start":"08:00","end":"20:00"},"tuesday":{"enabled":true,"start":"08:00","end":"20:00"},"wednesday":{"enabled":true,"start":"08:00","end":"20:00"},"thursday":{"enabled":true,"start":"08:00","end":"20:00"},"friday":{"enabled":true,"start":"08:00","end":"20:00"},"saturday":{"enabled":true,"start":"08:00","end":"20:00"},"sunday":{"enabled":true,"start":"08:00","end":"20:00"}}"#;

/// 30-minute slots between 08:00 and 20:00.
const SLOTS_PER_DAY: u32 = 24;

#[derive(Clone)]
struct Target {
    host: String,
    port: u16,
    admin: (String, String),
    public: (String, String),
}

impl Target {
    fn from_env() -> Self {
        let var = |k: &str, d: &str| std::env::var(k).unwrap_or_else(|_| d.into());
        Self {
            host: var("SLOTWARD_HOST", "127.0.0.1"),
            port: var("SLOTWARD_PORT", "5433")
                .parse()
                .expect("invalid SLOTWARD_PORT"),
            admin: (
                var("SLOTWARD_ADMIN_USER", "slotward"),
                var("SLOTWARD_ADMIN_PASSWORD", "slotward"),
            ),
            public: (
                var("SLOTWARD_PUBLIC_USER", "booking"),
                var("SLOTWARD_PUBLIC_PASSWORD", "booking"),
            ),
        }
    }

    async fn connect(&self, (user, password): &(String, String)) -> tokio_postgres::Client {
        let mut config = Config::new();
        config
            .host(&self.host)
            .port(self.port)
            .dbname("slotward")
            .user(user)
            .password(password);

        let (client, conn) = config.connect(NoTls).await.expect("connect failed");
        tokio::spawn(async move {
            if let Err(e) = conn.await {
                eprintln!("connection error: {e}");
            }
        });
        client
    }

    async fn admin(&self) -> tokio_postgres::Client {
        self.connect(&self.admin).await
    }

    async fn public(&self) -> tokio_postgres::Client {
        self.connect(&self.public).await
    }
}

fn percentile(sorted: &[Duration], p: f64) -> Duration {
    if sorted.is_empty() {
        return Duration::ZERO;
    }
    let idx = ((sorted.len() as f64) * p / 100.0) as usize;
    sorted[idx.min(sorted.len() - 1)]
}

fn print_latency(label: &str, latencies: &mut [Duration]) {
    if latencies.is_empty() {
        println!("  {label}: no samples");
        return;
    }
    latencies.sort();
    let total: Duration = latencies.iter().sum();
    let avg = total / latencies.len() as u32;
    println!("  {label}:");
    println!(
        "    n={}, avg={:.2}ms, p50={:.2}ms, p95={:.2}ms, p99={:.2}ms, max={:.2}ms",
        latencies.len(),
        avg.as_secs_f64() * 1000.0,
        percentile(latencies, 50.0).as_secs_f64() * 1000.0,
        percentile(latencies, 95.0).as_secs_f64() * 1000.0,
        percentile(latencies, 99.0).as_secs_f64() * 1000.0,
        latencies[latencies.len() - 1].as_secs_f64() * 1000.0,
    );
}

fn day(offset: u64) -> NaiveDate {
    Utc::now().date_naive() + Days::new(offset)
}

/// Start/end of the `n`th half-hour slot on `date`, as RFC 3339 in UTC.
fn slot(date: NaiveDate, n: u32) -> (String, String) {
    let start = date.and_hms_opt(8, 0, 0).unwrap().and_utc() + chrono::Duration::minutes(30 * n as i64);
    let end = start + chrono::Duration::minutes(30);
    (start.to_rfc3339(), end.to_rfc3339())
}

async fn create_page(admin: &tokio_postgres::Client) -> String {
    let slug = format!("bench-{}", Ulid::new()).to_lowercase();
    admin
        .batch_execute(&format!(
            "INSERT INTO pages (id, org_id, slug, business_name, timezone, business_hours, slot_duration, max_days_advance, auto_confirm) \
             VALUES ('{}', '{}', '{slug}', 'Bench', 'UTC', '{EVERY_DAY_EIGHT_TO_EIGHT}', 30, 365, true)",
            Ulid::new(),
            Ulid::new(),
        ))
        .await
        .unwrap();
    slug
}

async fn book(
    client: &tokio_postgres::Client,
    slug: &str,
    date: NaiveDate,
    n: u32,
    name: &str,
) -> Result<(), tokio_postgres::Error> {
    let (start, end) = slot(date, n);
    client
        .simple_query(&format!(
            "INSERT INTO bookings (page, start_time, end_time, name, phone) \
             VALUES ('{slug}', '{start}', '{end}', '{name}', '+15550100')"
        ))
        .await
        .map(|_| ())
}

async fn phase1_sequential(target: &Target) {
    let admin = target.admin().await;
    let slug = create_page(&admin).await;
    let client = target.public().await;

    let n = 2000u32;
    let mut latencies = Vec::with_capacity(n as usize);
    let start = Instant::now();

    for i in 0..n {
        let date = day(1 + (i / SLOTS_PER_DAY) as u64);
        let t = Instant::now();
        book(&client, &slug, date, i % SLOTS_PER_DAY, "seq").await.unwrap();
        latencies.push(t.elapsed());
    }

    let elapsed = start.elapsed();
    let ops = n as f64 / elapsed.as_secs_f64();
    println!("  {n} bookings in {:.2}s = {ops:.0} ops/sec", elapsed.as_secs_f64());
    print_latency("reserve latency", &mut latencies);
}

/// Many customers race for one slot; exactly one may win.
async fn phase2_slot_race(target: &Target) {
    let admin = target.admin().await;
    let slug = create_page(&admin).await;
    let rounds = 20;
    let racers = 32;

    let mut latencies = Vec::new();
    let mut lost_invariant = 0;
    for round in 0..rounds {
        let date = day(1);
        let mut handles = Vec::new();
        for r in 0..racers {
            let target = target.clone();
            let slug = slug.clone();
            handles.push(tokio::spawn(async move {
                let client = target.public().await;
                let t = Instant::now();
                let result = book(&client, &slug, date, round, &format!("racer{r}")).await;
                (result, t.elapsed())
            }));
        }

        let mut winners = 0;
        for h in handles {
            let (result, elapsed) = h.await.unwrap();
            latencies.push(elapsed);
            match result {
                Ok(()) => winners += 1,
                Err(e) if e.code() == Some(&SqlState::EXCLUSION_VIOLATION) => {}
                Err(e) => panic!("unexpected error: {e}"),
            }
        }
        if winners != 1 {
            lost_invariant += 1;
        }
    }

    println!(
        "  {rounds} rounds x {racers} racers, rounds without exactly one winner: {lost_invariant}"
    );
    print_latency("contended reserve latency", &mut latencies);
}

async fn phase3_read_under_load(target: &Target) {
    let admin = target.admin().await;
    let slug = create_page(&admin).await;

    let stop = Arc::new(AtomicBool::new(false));
    let mut writer_handles = Vec::new();
    for w in 0..5u64 {
        let target = target.clone();
        let slug = slug.clone();
        let stop = stop.clone();
        writer_handles.push(tokio::spawn(async move {
            let client = target.public().await;
            let mut i = 0u32;
            while !stop.load(Ordering::Relaxed) {
                let date = day(1 + w * 40 + (i / SLOTS_PER_DAY) as u64);
                let _ = book(&client, &slug, date, i % SLOTS_PER_DAY, "writer").await;
                i += 1;
            }
        }));
    }

    let n_readers = 10;
    let reads_per_reader = 500;
    let mut reader_handles = Vec::new();
    for r in 0..n_readers {
        let target = target.clone();
        let slug = slug.clone();
        reader_handles.push(tokio::spawn(async move {
            let client = target.public().await;
            let mut latencies = Vec::with_capacity(reads_per_reader);
            for i in 0..reads_per_reader {
                let date = day(1 + ((r * 7 + i) % 200) as u64);
                let t = Instant::now();
                client
                    .simple_query(&format!(
                        "SELECT * FROM availability WHERE page = '{slug}' AND date = '{date}'"
                    ))
                    .await
                    .unwrap();
                latencies.push(t.elapsed());
            }
            latencies
        }));
    }

    let mut all_latencies = Vec::new();
    for h in reader_handles {
        all_latencies.extend(h.await.unwrap());
    }

    stop.store(true, Ordering::Relaxed);
    for h in writer_handles {
        let _ = h.await;
    }

    print_latency("availability query", &mut all_latencies);
}

async fn phase4_connection_storm(target: &Target) {
    let admin = target.admin().await;
    let slug = create_page(&admin).await;
    let n_conns = 50;
    let ops_per_conn = 10;

    let start = Instant::now();
    let mut handles = Vec::new();
    let success = Arc::new(AtomicUsize::new(0));

    for c in 0..n_conns {
        let target = target.clone();
        let slug = slug.clone();
        let success = success.clone();
        handles.push(tokio::spawn(async move {
            let client = target.public().await;
            for i in 0..ops_per_conn {
                let n = c * ops_per_conn + i;
                let date = day(1 + (n / SLOTS_PER_DAY) as u64);
                book(&client, &slug, date, n % SLOTS_PER_DAY, "storm").await.unwrap();
            }
            success.fetch_add(1, Ordering::Relaxed);
        }));
    }

    for h in handles {
        let _ = h.await;
    }

    let elapsed = start.elapsed();
    let ok = success.load(Ordering::Relaxed);
    println!(
        "  {n_conns} connections, {ops_per_conn} reservations each: {ok}/{n_conns} succeeded in {:.2}s",
        elapsed.as_secs_f64()
    );
}

#[tokio::main]
async fn main() {
    let target = Target::from_env();

    println!("=== slotward stress benchmark ===");
    println!("target: {}:{}\n", target.host, target.port);

    println!("[phase 1] sequential reservation throughput");
    phase1_sequential(&target).await;

    println!("\n[phase 2] slot race");
    phase2_slot_race(&target).await;

    println!("\n[phase 3] availability latency under write load");
    phase3_read_under_load(&target).await;

    println!("\n[phase 4] connection storm");
    phase4_connection_storm(&target).await;

    println!("\n=== benchmark complete ===");
}

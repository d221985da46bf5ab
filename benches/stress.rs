use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use tokio_postgres::error::SqlState;
use tokio_postgres::{Client, Config, NoTls, SimpleQueryMessage};
use ulid::Ulid;

const HOUR: i64 = 3_600_000; // 1 hour in ms
/// 2030-01-01, far enough ahead that the completer leaves bookings alone.
const T0: i64 = 1_893_456_000_000;

#[derive(Clone)]
struct Target {
    host: String,
    port: u16,
    password: String,
}

async fn connect(target: &Target, db: &str, user: &str) -> Client {
    let mut config = Config::new();
    config
        .host(&target.host)
        .port(target.port)
        .dbname(db)
        .user(user)
        .password(&target.password);

    let (client, conn) = config.connect(NoTls).await.expect("connect failed");
    tokio::spawn(async move {
        if let Err(e) = conn.await {
            eprintln!("connection error: {e}");
        }
    });
    client
}

fn percentile(sorted: &[Duration], p: f64) -> Duration {
    if sorted.is_empty() {
        return Duration::ZERO;
    }
    let idx = ((sorted.len() as f64) * p / 100.0) as usize;
    sorted[idx.min(sorted.len() - 1)]
}

fn print_latency(label: &str, latencies: &mut [Duration]) {
    let Some(&max) = latencies.iter().max() else {
        println!("  {label}: no samples");
        return;
    };
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
        max.as_secs_f64() * 1000.0,
    );
}

fn insert_booking(id: Ulid, asset: Ulid, start: i64, end: i64) -> String {
    format!(r#"INSERT INTO bookings (id, asset_id, start, "end") VALUES ('{id}', '{asset}', {start}, {end})"#)
}

/// A fresh tenant with `n_users` regular users and `n_assets` vans.
struct Depot {
    db: String,
    users: Vec<Ulid>,
    assets: Vec<Ulid>,
}

async fn setup_depot(target: &Target, n_users: usize, n_assets: usize) -> Depot {
    let db = format!("bench_{}", Ulid::new());
    let admin = connect(target, &db, "fleetbook").await;

    let mut users = Vec::with_capacity(n_users);
    for i in 0..n_users {
        let id = Ulid::new();
        admin
            .batch_execute(&format!(
                "INSERT INTO users (id, name, role) VALUES ('{id}', 'driver {i}', 'regular')"
            ))
            .await
            .unwrap();
        users.push(id);
    }

    let mut assets = Vec::with_capacity(n_assets);
    for i in 0..n_assets {
        let id = Ulid::new();
        admin
            .batch_execute(&format!(
                "INSERT INTO assets (id, name, number_plate, category) VALUES ('{id}', 'van {i}', 'BN-{i:04}', 'van')"
            ))
            .await
            .unwrap();
        assets.push(id);
    }

    Depot { db, users, assets }
}

async fn phase1_sequential(target: &Target) {
    let depot = setup_depot(target, 1, 1).await;
    let client = connect(target, &depot.db, &depot.users[0].to_string()).await;
    let asset = depot.assets[0];

    let n = 2000;
    let mut latencies = Vec::with_capacity(n);
    let start = Instant::now();

    for i in 0..n {
        let s = T0 + (i as i64) * HOUR;
        let t = Instant::now();
        client
            .batch_execute(&insert_booking(Ulid::new(), asset, s, s + HOUR))
            .await
            .unwrap();
        latencies.push(t.elapsed());
    }

    let elapsed = start.elapsed();
    let ops = n as f64 / elapsed.as_secs_f64();
    println!("  {n} bookings in {:.2}s = {ops:.0} ops/sec", elapsed.as_secs_f64());
    print_latency("write latency", &mut latencies);
}

/// Every driver races for the same slots. Exactly one booking per
/// (asset, slot) may win; everything else must come back as a conflict.
async fn phase2_contention(target: &Target) {
    let n_drivers = 20;
    let n_assets = 5;
    let n_slots = 50;
    let depot = setup_depot(target, n_drivers, n_assets).await;

    let won = Arc::new(AtomicUsize::new(0));
    let conflicts = Arc::new(AtomicUsize::new(0));
    let unexpected = Arc::new(AtomicUsize::new(0));

    let start = Instant::now();
    let mut handles = Vec::new();
    for &driver in &depot.users {
        let target = target.clone();
        let db = depot.db.clone();
        let assets = depot.assets.clone();
        let (won, conflicts, unexpected) = (won.clone(), conflicts.clone(), unexpected.clone());

        handles.push(tokio::spawn(async move {
            let client = connect(&target, &db, &driver.to_string()).await;
            for slot in 0..n_slots {
                for &asset in &assets {
                    let s = T0 + (slot as i64) * HOUR;
                    match client
                        .batch_execute(&insert_booking(Ulid::new(), asset, s, s + HOUR))
                        .await
                    {
                        Ok(()) => won.fetch_add(1, Ordering::Relaxed),
                        Err(e) if e.code() == Some(&SqlState::EXCLUSION_VIOLATION) => {
                            conflicts.fetch_add(1, Ordering::Relaxed)
                        }
                        Err(e) => {
                            eprintln!("unexpected error: {e}");
                            unexpected.fetch_add(1, Ordering::Relaxed)
                        }
                    };
                }
            }
        }));
    }
    for h in handles {
        h.await.unwrap();
    }

    let elapsed = start.elapsed();
    let total = n_drivers * n_assets * n_slots;
    let won = won.load(Ordering::Relaxed);
    println!(
        "  {n_drivers} drivers x {} attempts = {total} in {:.2}s = {:.0} ops/sec",
        n_assets * n_slots,
        elapsed.as_secs_f64(),
        total as f64 / elapsed.as_secs_f64()
    );
    println!(
        "  won={won} (expected {}), conflicts={}, unexpected={}",
        n_assets * n_slots,
        conflicts.load(Ordering::Relaxed),
        unexpected.load(Ordering::Relaxed),
    );
    if won != n_assets * n_slots {
        println!("  !! double booking or lost booking detected");
    }
}

async fn phase3_read_under_load(target: &Target) {
    let n_writers = 5;
    let n_readers = 10;
    let reads_per_reader = 500;
    let depot = setup_depot(target, n_writers + n_readers, n_writers + 1).await;

    // Pre-fill the calendar the readers query.
    let seeder = connect(target, &depot.db, &depot.users[0].to_string()).await;
    let read_asset = depot.assets[n_writers];
    for i in 0..200 {
        let s = T0 + (i as i64) * HOUR;
        seeder
            .batch_execute(&insert_booking(Ulid::new(), read_asset, s, s + HOUR))
            .await
            .unwrap();
    }
    drop(seeder);

    // Writers book their own asset so they never conflict with each other.
    let stop = Arc::new(AtomicBool::new(false));
    let mut writer_handles = Vec::new();
    for w in 0..n_writers {
        let target = target.clone();
        let db = depot.db.clone();
        let user = depot.users[w];
        let asset = depot.assets[w];
        let stop = stop.clone();
        writer_handles.push(tokio::spawn(async move {
            let client = connect(&target, &db, &user.to_string()).await;
            let mut i = 0i64;
            while !stop.load(Ordering::Relaxed) {
                let s = T0 + i * HOUR;
                let _ = client
                    .batch_execute(&insert_booking(Ulid::new(), asset, s, s + HOUR))
                    .await;
                i += 1;
            }
        }));
    }

    let mut reader_handles = Vec::new();
    for r in 0..n_readers {
        let target = target.clone();
        let db = depot.db.clone();
        let user = depot.users[n_writers + r];
        reader_handles.push(tokio::spawn(async move {
            let client = connect(&target, &db, &user.to_string()).await;
            let query = format!(
                r#"SELECT * FROM calendar WHERE asset_id = '{read_asset}' AND start >= {T0} AND "end" <= {}"#,
                T0 + 24 * 30 * HOUR
            );
            let mut latencies = Vec::with_capacity(reads_per_reader);
            for _ in 0..reads_per_reader {
                let t = Instant::now();
                let rows = client.simple_query(&query).await.unwrap();
                latencies.push(t.elapsed());
                let n = rows
                    .iter()
                    .filter(|m| matches!(m, SimpleQueryMessage::Row(_)))
                    .count();
                assert_eq!(n, 200, "calendar lost bookings");
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

    print_latency("calendar query", &mut all_latencies);
}

async fn phase4_connection_storm(target: &Target) {
    let n_conns = 50;
    let ops_per_conn = 10;
    let depot = setup_depot(target, n_conns, n_conns).await;

    let start = Instant::now();
    let mut handles = Vec::new();
    let success = Arc::new(AtomicUsize::new(0));

    for c in 0..n_conns {
        let target = target.clone();
        let db = depot.db.clone();
        let user = depot.users[c];
        let asset = depot.assets[c];
        let success = success.clone();
        handles.push(tokio::spawn(async move {
            let client = connect(&target, &db, &user.to_string()).await;
            for i in 0..ops_per_conn {
                let s = T0 + (i as i64) * HOUR;
                client
                    .batch_execute(&insert_booking(Ulid::new(), asset, s, s + HOUR))
                    .await
                    .unwrap();
            }
            client.simple_query("SELECT * FROM fleet_stats").await.unwrap();
            success.fetch_add(1, Ordering::Relaxed);
        }));
    }

    for h in handles {
        let _ = h.await;
    }

    let elapsed = start.elapsed();
    let ok = success.load(Ordering::Relaxed);
    println!(
        "  {n_conns} connections, {ops_per_conn} ops each: {ok}/{n_conns} succeeded in {:.2}s",
        elapsed.as_secs_f64()
    );
}

#[tokio::main]
async fn main() {
    let target = Target {
        host: std::env::var("FLEETBOOK_HOST").unwrap_or_else(|_| "127.0.0.1".into()),
        port: std::env::var("FLEETBOOK_PORT")
            .unwrap_or_else(|_| "5433".into())
            .parse()
            .expect("invalid FLEETBOOK_PORT"),
        password: std::env::var("FLEETBOOK_PASSWORD").unwrap_or_else(|_| "fleetbook".into()),
    };

    println!("=== fleetbook stress benchmark ===");
    println!("target: {}:{}\n", target.host, target.port);

    // Each phase uses its own depot (unique dbname) to avoid interference

    println!("[phase 1] sequential booking throughput");
    phase1_sequential(&target).await;

    println!("\n[phase 2] contended booking on shared slots");
    phase2_contention(&target).await;

    println!("\n[phase 3] calendar latency under write load");
    phase3_read_under_load(&target).await;

    println!("\n[phase 4] connection storm");
    phase4_connection_storm(&target).await;

    println!("\n=== benchmark complete ===");
}

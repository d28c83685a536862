//! Blackbox pipeline tests: sampler deltas through rollups, retention
//! and the query engine, against a real store.

use std::collections::HashMap;
use std::sync::Arc;

use netmond::aggregator::Aggregator;
use netmond::catalog::AppCatalog;
use netmond::config::{Config, RuntimeSettings};
use netmond::ingest::{ActiveTabReport, DomainIngest, Timestamp};
use netmond::query::{QueryEngine, TimelineRequest};
use netmond::retention::{Retention, RetentionPolicy};
use netmond::sampler::delta::DeltaEngine;
use netmond::sampler::{Cumulative, CumulativeCounters, ProcessIdentity, Snapshot};
use netmond::store::aggregates::AggregateRepository;
use netmond::store::apps::AppRepository;
use netmond::store::models::RawSample;
use netmond::store::samples::SampleRepository;
use netmond::store::Database;

fn snapshot(entries: &[(&str, u64, u64)]) -> Snapshot {
    let counters: HashMap<ProcessIdentity, CumulativeCounters> = entries
        .iter()
        .map(|(name, out, r#in)| {
            (
                ProcessIdentity::named(*name),
                CumulativeCounters {
                    bytes_out: Cumulative(*out),
                    bytes_in: Cumulative(*r#in),
                    ..Default::default()
                },
            )
        })
        .collect();
    Snapshot { counters }
}

fn raw(ts: i64, app_id: i64, out: u64, r#in: u64) -> RawSample {
    RawSample {
        ts,
        app_id,
        bytes_out: out,
        bytes_in: r#in,
        packets_out: 0,
        packets_in: 0,
        active_connections: 0,
    }
}

async fn intern_app(db: &Database, name: &'static str) -> i64 {
    db.execute(move |conn| AppRepository::new(conn).intern(name, None, 0))
        .await
        .expect("intern app")
}

async fn insert_raw(db: &Database, rows: Vec<RawSample>) {
    db.execute(move |conn| SampleRepository::insert_raw_batch(conn, &rows))
        .await
        .expect("insert raw");
}

async fn raw_total_out(db: &Database) -> i64 {
    db.execute(|conn| {
        conn.query_row(
            "SELECT COALESCE(SUM(bytes_out), 0) FROM raw_samples",
            [],
            |row| row.get(0),
        )
        .map_err(Into::into)
    })
    .await
    .expect("sum")
}

fn engine_with(db: &Database, sampling_interval: u64, raw_ttl: u32) -> QueryEngine {
    let mut cfg = Config::default();
    cfg.daemon.sampling_interval_seconds = sampling_interval;
    cfg.retention.raw_ttl_days = raw_ttl;
    QueryEngine::new(db.clone(), Arc::new(RuntimeSettings::new(cfg)))
}

/// A restarted process's counter reset must not be stored as a giant
/// delta. Sum over the window is the true 700KB, not 2.9MB.
#[tokio::test]
async fn counter_reset_is_not_double_counted() {
    let db = Database::open_in_memory().expect("open");
    let app = intern_app(&db, "A").await;

    let mut engine = DeltaEngine::new();
    let readings: [(i64, u64); 4] = [
        (0, 1_000_000),
        (1, 1_500_000),
        (2, 100_000), // A restarted.
        (3, 300_000),
    ];

    for (ts, cum_out) in readings {
        let deltas = engine.advance(snapshot(&[("A", cum_out, 0)]));
        let rows: Vec<RawSample> = deltas
            .into_iter()
            .map(|d| raw(ts, app, d.bytes_out.0, d.bytes_in.0))
            .collect();
        insert_raw(&db, rows).await;
    }

    // First sighting wrote nothing; the reset tick wrote a zero row.
    let per_tick: Vec<(i64, i64)> = db
        .execute(|conn| {
            let mut stmt =
                conn.prepare("SELECT ts, bytes_out FROM raw_samples ORDER BY ts")?;
            let rows = stmt
                .query_map([], |row| Ok((row.get(0)?, row.get(1)?)))?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(rows)
        })
        .await
        .expect("rows");
    assert_eq!(per_tick, vec![(1, 500_000), (2, 0), (3, 200_000)]);

    let total = raw_total_out(&db).await;
    assert_eq!(total, 700_000);
    assert_ne!(total, 2_900_000, "cumulative values must never be stored");
}

/// Hour-end aggregation is idempotent and logs once per productive pass.
#[tokio::test]
async fn hour_end_aggregation_is_idempotent() {
    let db = Database::open_in_memory().expect("open");
    let app = intern_app(&db, "A").await;
    insert_raw(&db, vec![raw(3_599, app, 10, 0), raw(3_600, app, 10, 0)]).await;

    let aggregator = Aggregator::new(db.clone());
    aggregator.run(3_700).await.expect("first pass");

    let hourly = db
        .execute(|conn| AggregateRepository::new(conn).hourly_rows())
        .await
        .expect("hourly");
    assert_eq!(hourly.len(), 2);
    assert_eq!(hourly[0].hour_start, 0);
    assert_eq!(hourly[0].bytes_out, 10);
    assert_eq!(hourly[0].sample_count, 1);
    assert_eq!(hourly[1].hour_start, 3_600);
    assert_eq!(hourly[1].bytes_out, 10);
    assert_eq!(hourly[1].sample_count, 1);

    aggregator.run(3_700).await.expect("second pass");

    let (hourly_again, log) = db
        .execute(|conn| {
            let repo = AggregateRepository::new(conn);
            Ok((repo.hourly_rows()?, repo.retention_log()?))
        })
        .await
        .expect("rows");
    assert_eq!(hourly_again, hourly, "re-run must not change aggregates");
    assert_eq!(log.len(), 2, "idle pass must not add log entries");
}

/// Retention never deletes raw rows whose hour has not been aggregated,
/// and never touches the still-open hour.
#[tokio::test]
async fn retention_respects_aggregation_ordering() {
    let db = Database::open_in_memory().expect("open");
    let app = intern_app(&db, "A").await;
    // Two finished hours plus one row in the current hour.
    insert_raw(
        &db,
        vec![raw(100, app, 1, 0), raw(3_700, app, 2, 0), raw(7_250, app, 3, 0)],
    )
    .await;

    let now = 7_300; // Inside hour starting at 7200.
    let policy = RetentionPolicy {
        raw_ttl_days: 0, // Everything is stale.
        hour_ttl_days: 90,
    };
    let retention = Retention::new(db.clone());

    // Aggregator disabled: nothing may be deleted.
    let first = retention.run(policy, now).await.expect("run");
    assert_eq!(first.raw_deleted, 0);
    assert!(first.raw_deferred >= 2, "stale rows must be deferred");

    Aggregator::new(db.clone()).run(now).await.expect("aggregate");
    let second = retention.run(policy, now).await.expect("run");
    assert_eq!(second.raw_deleted, 2, "finalized-hour rows are pruned");

    let remaining: Vec<i64> = db
        .execute(|conn| {
            let mut stmt = conn.prepare("SELECT ts FROM raw_samples ORDER BY ts")?;
            let rows = stmt
                .query_map([], |row| row.get(0))?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(rows)
        })
        .await
        .expect("rows");
    assert_eq!(remaining, vec![7_250], "current hour must be retained");
}

/// Parent rollup uses the 2-label heuristic, including the documented
/// `bbc.co.uk -> co.uk` behavior, and parent-only listing filters to
/// registrable domains.
#[tokio::test]
async fn domain_parent_rollup() {
    let db = Database::open_in_memory().expect("open");
    let apps = Arc::new(AppCatalog::new(db.clone()));
    let ingest = DomainIngest::new(db.clone(), apps);

    let expectations = [
        ("www.example.com", "example.com"),
        ("api.example.com", "example.com"),
        ("example.com", "example.com"),
        ("co.uk", "co.uk"),
        ("bbc.co.uk", "co.uk"),
    ];

    for (i, (fqdn, _)) in expectations.iter().enumerate() {
        ingest
            .record(
                &ActiveTabReport {
                    domain: (*fqdn).into(),
                    timestamp: Some(Timestamp::Unix(1_000 + i as i64)),
                    browser: "zen".into(),
                },
                1_000,
            )
            .await
            .expect("record");
    }

    let parents: Vec<(String, String)> = db
        .execute(|conn| {
            let mut stmt =
                conn.prepare("SELECT fqdn, parent_domain FROM domains ORDER BY domain_id")?;
            let rows = stmt
                .query_map([], |row| Ok((row.get(0)?, row.get(1)?)))?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(rows)
        })
        .await
        .expect("rows");

    for ((fqdn, expected_parent), (stored_fqdn, stored_parent)) in
        expectations.iter().zip(parents.iter())
    {
        assert_eq!(fqdn, stored_fqdn);
        assert_eq!(
            expected_parent, stored_parent,
            "parent of {fqdn} should be {expected_parent}"
        );
    }

    let query = engine_with(&db, 5, 7);
    let parent_only = query
        .domains_list(&Default::default(), true, 2_000)
        .await
        .expect("list");
    let fqdns: Vec<&str> = parent_only.iter().map(|d| d.fqdn.as_str()).collect();
    assert_eq!(fqdns.len(), 2);
    assert!(fqdns.contains(&"example.com"));
    assert!(fqdns.contains(&"co.uk"));
}

/// Bandwidth comes from the latest two adjacent ticks only, never an
/// average over the whole window.
#[tokio::test]
async fn bandwidth_uses_only_the_last_two_ticks() {
    let db = Database::open_in_memory().expect("open");
    let app = intern_app(&db, "A").await;

    let now = 1_000;
    insert_raw(
        &db,
        vec![
            raw(now - 2, app, 100, 0),
            raw(now - 1, app, 200, 0),
            raw(now, app, 300, 0),
        ],
    )
    .await;

    let query = engine_with(&db, 1, 7);
    let bw = query.bandwidth(now).await.expect("bandwidth");
    assert_eq!(bw.bytes_per_second, 300.0);
    assert_eq!(bw.window_seconds, 2);

    // Fewer than two ticks yields zero, not an error.
    let sparse = Database::open_in_memory().expect("open");
    let app = intern_app(&sparse, "A").await;
    insert_raw(&sparse, vec![raw(now, app, 500, 0)]).await;
    let query = engine_with(&sparse, 1, 7);
    let bw = query.bandwidth(now).await.expect("bandwidth");
    assert_eq!(bw.bytes_per_second, 0.0);
}

/// A timeline over an empty period is exactly N evenly spaced zero
/// points.
#[tokio::test]
async fn timeline_bucket_shape() {
    let db = Database::open_in_memory().expect("open");
    let query = engine_with(&db, 5, 7);

    let request = TimelineRequest {
        period: Some("24h".into()),
        ..Default::default()
    };
    let points = query.timeline(&request, 1_000_000).await.expect("timeline");

    assert_eq!(points.len(), 288);
    let width = points[1].ts - points[0].ts;
    for pair in points.windows(2) {
        assert_eq!(pair[1].ts - pair[0].ts, width, "points must be evenly spaced");
    }
    assert!(points.iter().all(|p| p.bytes_out == 0 && p.bytes_in == 0));

    // With data, bucket sums line up and padding still fills the rest.
    let app = intern_app(&db, "A").await;
    let now = 86_400;
    insert_raw(&db, vec![raw(now - 10, app, 40, 4), raw(now - 5, app, 2, 1)]).await;
    let request = TimelineRequest {
        period: Some("1h".into()),
        ..Default::default()
    };
    let points = query.timeline(&request, now).await.expect("timeline");
    assert_eq!(points.len(), 60);
    let total_out: u64 = points.iter().map(|p| p.bytes_out).sum();
    let total_in: u64 = points.iter().map(|p| p.bytes_in).sum();
    assert_eq!(total_out, 42);
    assert_eq!(total_in, 5);
}

/// Hourly aggregates equal raw sums per hour, and daily aggregates
/// equal the sum of their hourly constituents.
#[tokio::test]
async fn rollup_tiers_agree() {
    let db = Database::open_in_memory().expect("open");
    let a = intern_app(&db, "A").await;
    let b = intern_app(&db, "B").await;

    insert_raw(
        &db,
        vec![
            raw(10, a, 100, 1),
            raw(20, a, 200, 2),
            raw(30, b, 50, 5),
            raw(3_700, a, 1_000, 10),
            raw(90_000, b, 7, 70), // Next day.
        ],
    )
    .await;

    Aggregator::new(db.clone()).run(200_000).await.expect("aggregate");

    let (hourly, daily) = db
        .execute(|conn| {
            let repo = AggregateRepository::new(conn);
            Ok((repo.hourly_rows()?, repo.daily_rows()?))
        })
        .await
        .expect("rows");

    // Property 3: per-hour, per-app sums match the raw rows.
    let hour0_a = hourly
        .iter()
        .find(|h| h.hour_start == 0 && h.app_id == a)
        .expect("hour 0 app A");
    assert_eq!(hour0_a.bytes_out, 300);
    assert_eq!(hour0_a.bytes_in, 3);
    assert_eq!(hour0_a.sample_count, 2);

    // Property 4: each daily row equals the sum of its hourly rows.
    for day in &daily {
        let (out, r#in, count) = hourly
            .iter()
            .filter(|h| {
                h.app_id == day.app_id
                    && h.hour_start >= day.day_start
                    && h.hour_start < day.day_start + 86_400
            })
            .fold((0u64, 0u64, 0u64), |acc, h| {
                (acc.0 + h.bytes_out, acc.1 + h.bytes_in, acc.2 + h.sample_count)
            });
        assert_eq!(day.bytes_out, out);
        assert_eq!(day.bytes_in, r#in);
        assert_eq!(day.sample_count, count);
    }

    // Summary stays internally consistent after rollup.
    let query = engine_with(&db, 5, 7);
    let summary = query.summary(None, 90_060).await.expect("summary");
    assert_eq!(summary.total_bytes_today, 77);
    assert!(summary.total_bytes_month >= summary.total_bytes_today);
}

/// After retention no wholly stale aggregated hour survives in raw,
/// remaining raw rows are safe, and a second pass deletes nothing.
#[tokio::test]
async fn retention_is_guarded_and_idempotent() {
    let db = Database::open_in_memory().expect("open");
    let app = intern_app(&db, "A").await;

    let day = 86_400;
    let now = 10 * day;
    insert_raw(
        &db,
        vec![
            raw(100, app, 1, 0),           // Far past raw TTL.
            raw(now - 2 * day, app, 2, 0), // Past raw TTL.
            raw(now - 60, app, 3, 0),      // Fresh.
        ],
    )
    .await;

    Aggregator::new(db.clone()).run(now).await.expect("aggregate");

    let policy = RetentionPolicy {
        raw_ttl_days: 1,
        hour_ttl_days: 90,
    };
    let retention = Retention::new(db.clone());
    let outcome = retention.run(policy, now).await.expect("run");
    assert_eq!(outcome.raw_deleted, 2);

    let cutoff = now - day;
    let stale_left: i64 = db
        .execute(move |conn| {
            conn.query_row(
                "SELECT COUNT(*) FROM raw_samples WHERE (ts - ts % 3600) + 3600 <= ?1",
                [cutoff],
                |row| row.get(0),
            )
            .map_err(Into::into)
        })
        .await
        .expect("count");
    assert_eq!(stale_left, 0, "no aggregated stale hour may survive");

    // A second run deletes zero rows.
    let again = retention.run(policy, now).await.expect("run");
    assert_eq!(again.raw_deleted, 0);
    assert_eq!(again.hourly_deleted, 0);

    // Hourly data still answers queries for the pruned window.
    let query = engine_with(&db, 5, 1);
    let request = TimelineRequest {
        period: Some("7d".into()),
        ..Default::default()
    };
    let points = query.timeline(&request, now).await.expect("timeline");
    let total: u64 = points.iter().map(|p| p.bytes_out).sum();
    assert_eq!(total, 2 + 3, "window past raw TTL reads the hourly tier");
}

/// The same flow works against a file-backed store with WAL.
#[tokio::test]
async fn pipeline_works_on_disk() {
    let dir = tempfile::tempdir().expect("tempdir");
    let db = Database::open(dir.path().join("netmond.db")).expect("open");
    let app = intern_app(&db, "A").await;
    insert_raw(&db, vec![raw(100, app, 10, 20)]).await;

    Aggregator::new(db.clone()).run(100_000).await.expect("aggregate");

    let hourly = db
        .execute(|conn| AggregateRepository::new(conn).hourly_rows())
        .await
        .expect("hourly");
    assert_eq!(hourly.len(), 1);
    assert_eq!(hourly[0].bytes_in, 20);
}

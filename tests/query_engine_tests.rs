//! End-to-end query engine scenarios through the database surface.

use tempfile::tempdir;
use tscore::types::Payload;
use tscore::{BlockStoreKind, Database, DbError, EngineConfig, QueryCancelToken};

fn open_db(dir: &std::path::Path) -> std::sync::Arc<Database> {
    let mut cfg = EngineConfig::new("querydb", dir);
    cfg.blockstore = BlockStoreKind::Expandable { capacity: 4096 };
    Database::create(&cfg).unwrap()
}

fn tuple_values(payload: &Payload) -> (u64, Vec<f64>) {
    match payload {
        Payload::Tuple { presence, values } => (*presence, values.clone()),
        other => panic!("expected tuple payload, got {:?}", other),
    }
}

#[test]
fn series_order_scan_blocks_by_series() {
    let dir = tempdir().unwrap();
    let db = open_db(dir.path());
    let mut session = db.session();
    for ts in 100..200u64 {
        for key in 0..10 {
            session
                .write(&format!("test key={}", key), ts, (ts / 10) as f64)
                .unwrap();
        }
    }
    let out = db
        .execute_query(
            r#"{
                "select": "test",
                "range": {"from": 100, "to": 200},
                "order-by": "series"
            }"#,
        )
        .unwrap();
    assert_eq!(out.samples.len(), 1000);
    for key in 0..10 {
        let block = &out.samples[key * 100..(key + 1) * 100];
        let expected = db
            .matcher()
            .match_name(&format!("test key={}", key))
            .unwrap()
            .unwrap();
        assert!(block.iter().all(|s| s.id == expected));
        assert!(block.windows(2).all(|w| w[0].timestamp <= w[1].timestamp));
    }
    db.close().unwrap();
}

#[test]
fn time_order_scan_is_globally_sorted_with_id_tie_break() {
    let dir = tempdir().unwrap();
    let db = open_db(dir.path());
    let mut session = db.session();
    for ts in 0..100u64 {
        for key in 0..4 {
            session
                .write(&format!("test key={}", key), ts, ts as f64)
                .unwrap();
        }
    }
    let out = db
        .execute_query(r#"{"select": "test", "order-by": "time"}"#)
        .unwrap();
    assert_eq!(out.samples.len(), 400);
    for w in out.samples.windows(2) {
        assert!(
            w[0].timestamp < w[1].timestamp
                || (w[0].timestamp == w[1].timestamp && w[0].id < w[1].id)
        );
    }
    db.close().unwrap();
}

#[test]
fn reverse_range_query_descends() {
    let dir = tempdir().unwrap();
    let db = open_db(dir.path());
    let mut session = db.session();
    for ts in 0..500u64 {
        session.write("m host=a", ts, ts as f64).unwrap();
    }
    let out = db
        .execute_query(r#"{"select": "m", "range": {"from": 400, "to": 100}}"#)
        .unwrap();
    assert_eq!(out.samples.len(), 300);
    assert_eq!(out.samples.first().unwrap().timestamp, 400);
    assert_eq!(out.samples.last().unwrap().timestamp, 101);
    db.close().unwrap();
}

#[test]
fn group_by_tag_merges_series_and_names_outputs() {
    let dir = tempdir().unwrap();
    let db = open_db(dir.path());
    let mut session = db.session();
    for ts in 0..100u64 {
        for key in 0..2 {
            for group in 0..2 {
                session
                    .write(
                        &format!("test key={} group={}", key, group),
                        ts,
                        (group * 10) as f64,
                    )
                    .unwrap();
            }
        }
    }
    let out = db
        .execute_query(
            r#"{
                "select": "test",
                "group-by": ["group"],
                "order-by": "series"
            }"#,
        )
        .unwrap();
    // Two logical output series, each merging two source series.
    assert_eq!(out.samples.len(), 400);
    let first_block = &out.samples[..200];
    let second_block = &out.samples[200..];
    assert!(first_block.iter().all(|s| s.id == first_block[0].id));
    assert!(second_block.iter().all(|s| s.id == second_block[0].id));
    assert_ne!(first_block[0].id, second_block[0].id);
    let name0 = out
        .series_name(first_block[0].id, db.matcher())
        .unwrap()
        .unwrap();
    let name1 = out
        .series_name(second_block[0].id, db.matcher())
        .unwrap()
        .unwrap();
    assert_eq!(name0, "test group=0");
    assert_eq!(name1, "test group=1");

    // TIME order interleaves the two groups by timestamp.
    let out = db
        .execute_query(
            r#"{
                "select": "test",
                "group-by": ["group"],
                "order-by": "time"
            }"#,
        )
        .unwrap();
    assert!(out
        .samples
        .windows(2)
        .all(|w| w[0].timestamp <= w[1].timestamp));
    db.close().unwrap();
}

#[test]
fn aggregate_min_and_max_per_metric() {
    let dir = tempdir().unwrap();
    let db = open_db(dir.path());
    let mut session = db.session();
    for metric in ["cpu.user", "cpu.syst"] {
        for key in 4..8 {
            for group in 0..2 {
                let name = format!("{} key={} group={}", metric, key, group);
                for i in 0..1000u64 {
                    session.write(&name, i, 1000.0 + (i as f64) * 10.0).unwrap();
                }
            }
        }
    }
    let out = db
        .execute_query(
            r#"{
                "aggregate": {"cpu.user": "min", "cpu.syst": "max"},
                "range": {"from": 0, "to": 2000}
            }"#,
        )
        .unwrap();
    // 8 series per metric, one result each.
    assert_eq!(out.samples.len(), 16);
    for sample in &out.samples {
        let name = out.series_name(sample.id, db.matcher()).unwrap().unwrap();
        let (_, values) = tuple_values(&sample.payload);
        assert_eq!(values.len(), 1);
        if name.starts_with("cpu.user") {
            assert_eq!(values[0], 1000.0);
        } else {
            assert_eq!(values[0], 1000.0 + 999.0 * 10.0);
        }
    }
    db.close().unwrap();
}

#[test]
fn group_aggregate_buckets_with_literal_step() {
    let dir = tempdir().unwrap();
    let db = open_db(dir.path());
    let mut session = db.session();
    for i in 0..10_000u64 {
        session
            .write("m host=a", 100_000 + i * 1000, 1000.0 + (i as f64) * 10.0)
            .unwrap();
    }
    let out = db
        .execute_query(
            r#"{
                "group-aggregate": {"metric": "m", "step": 4000000, "func": "min"},
                "range": {"from": 100000, "to": 10100000}
            }"#,
        )
        .unwrap();
    assert_eq!(out.samples.len(), 3);
    let mins: Vec<f64> = out
        .samples
        .iter()
        .map(|s| tuple_values(&s.payload).1[0])
        .collect();
    assert_eq!(mins, vec![1000.0, 41000.0, 81000.0]);
    db.close().unwrap();
}

#[test]
fn group_aggregate_join_aligns_two_metrics() {
    let dir = tempdir().unwrap();
    let db = open_db(dir.path());
    let mut session = db.session();
    for ts in 0..100u64 {
        session.write("a host=1", ts, ts as f64).unwrap();
    }
    // The right metric only covers the second half of the range.
    for ts in 50..100u64 {
        session.write("b host=1", ts, (ts * 2) as f64).unwrap();
    }
    let out = db
        .execute_query(
            r#"{
                "group-aggregate-join": {"metric": ["a", "b"], "step": 10, "func": "max"},
                "range": {"from": 0, "to": 100}
            }"#,
        )
        .unwrap();
    assert_eq!(out.samples.len(), 10);
    let name = out
        .series_name(out.samples[0].id, db.matcher())
        .unwrap()
        .unwrap();
    assert_eq!(name, "a|b host=1");
    for sample in &out.samples {
        let (presence, values) = tuple_values(&sample.payload);
        if sample.timestamp < 50 {
            // Missing right side clears its presence bit.
            assert_eq!(presence, 0b01);
        } else {
            assert_eq!(presence, 0b11);
            assert_eq!(values[1], values[0] * 2.0);
        }
    }
    db.close().unwrap();
}

#[test]
fn meta_names_query_lists_matching_series() {
    let dir = tempdir().unwrap();
    let db = open_db(dir.path());
    let mut session = db.session();
    session.write("cpu host=a", 1, 1.0).unwrap();
    session.write("cpu host=b", 1, 1.0).unwrap();
    session.write("mem host=a", 1, 1.0).unwrap();
    let out = db
        .execute_query(r#"{"select": "meta:names", "where": {"host": "a"}}"#)
        .unwrap();
    let mut names: Vec<String> = out
        .samples
        .iter()
        .map(|s| out.series_name(s.id, db.matcher()).unwrap().unwrap())
        .collect();
    names.sort();
    assert_eq!(names, vec!["cpu host=a", "mem host=a"]);

    // No matching series is NotFound, matching the wire contract.
    assert!(matches!(
        db.execute_query(r#"{"select": "meta:names", "where": {"host": "zzz"}}"#),
        Err(DbError::NotFound(_))
    ));
    db.close().unwrap();
}

#[test]
fn suggest_queries_return_synthetic_resolvable_ids() {
    let dir = tempdir().unwrap();
    let db = open_db(dir.path());
    let mut session = db.session();
    for value in ["bar", "baar", "bacr", "baer", "ba"] {
        session.write(&format!("m foo={}", value), 1, 1.0).unwrap();
    }
    session.write("m other=bax", 1, 1.0).unwrap();
    let out = db
        .execute_query(
            r#"{"select": "tag-values", "metric": "m", "tag": "foo", "starts-with": "ba"}"#,
        )
        .unwrap();
    let mut values: Vec<String> = out
        .samples
        .iter()
        .map(|s| out.series_name(s.id, db.matcher()).unwrap().unwrap())
        .collect();
    values.sort();
    assert_eq!(values, vec!["ba", "baar", "bacr", "baer", "bar"]);

    let out = db
        .execute_query(r#"{"select": "metric-names", "starts-with": "m"}"#)
        .unwrap();
    assert_eq!(out.samples.len(), 1);
    db.close().unwrap();
}

#[test]
fn value_filter_restricts_scan_results() {
    let dir = tempdir().unwrap();
    let db = open_db(dir.path());
    let mut session = db.session();
    for ts in 0..200u64 {
        session.write("m host=a", ts, ts as f64).unwrap();
    }
    let out = db
        .execute_query(r#"{"select": "m", "filter": {"m": {"gt": 150}}}"#)
        .unwrap();
    assert_eq!(out.samples.len(), 49);
    db.close().unwrap();
}

#[test]
fn event_select_scans_and_filters_bodies() {
    let dir = tempdir().unwrap();
    let db = open_db(dir.path());
    let mut session = db.session();
    for ts in 0..100u64 {
        let body = format!("request status={}", if ts % 10 == 0 { 500 } else { 200 });
        session
            .write_event("!http host=a", ts, body.as_bytes())
            .unwrap();
    }
    let out = db
        .execute_query(r#"{"select-events": "!http", "range": {"from": 0, "to": 100}}"#)
        .unwrap();
    assert_eq!(out.samples.len(), 100);
    let out = db
        .execute_query(
            r#"{"select-events": "!http", "filter": "status=500", "range": {"from": 0, "to": 100}}"#,
        )
        .unwrap();
    assert_eq!(out.samples.len(), 10);
    assert!(matches!(&out.samples[0].payload, Payload::Event(_)));
    db.close().unwrap();
}

#[test]
fn limit_and_offset_bound_the_output() {
    let dir = tempdir().unwrap();
    let db = open_db(dir.path());
    let mut session = db.session();
    for ts in 0..100u64 {
        session.write("m host=a", ts, ts as f64).unwrap();
    }
    let out = db
        .execute_query(r#"{"select": "m", "limit": 10, "offset": 5}"#)
        .unwrap();
    assert_eq!(out.samples.len(), 10);
    assert_eq!(out.samples[0].timestamp, 5);
    db.close().unwrap();
}

#[test]
fn cancelled_queries_surface_the_cancel_status() {
    let dir = tempdir().unwrap();
    let db = open_db(dir.path());
    let mut session = db.session();
    for ts in 0..100u64 {
        session.write("m host=a", ts, ts as f64).unwrap();
    }
    let token = QueryCancelToken::new();
    token.cancel();
    let result = db.execute_query_with_cancel(r#"{"select": "m"}"#, &token);
    assert!(matches!(result, Err(DbError::Cancelled)));
    db.close().unwrap();
}

#[test]
fn parse_errors_carry_a_message() {
    let dir = tempdir().unwrap();
    let db = open_db(dir.path());
    let err = db.execute_query(r#"{"range": {"from": 0}}"#).unwrap_err();
    match err {
        DbError::QueryParsingError { msg } => assert!(!msg.is_empty()),
        other => panic!("expected QueryParsingError, got {:?}", other),
    }
    assert_eq!(
        db.execute_query("{").unwrap_err().wire_code(),
        "QueryParsingError"
    );
    db.close().unwrap();
}

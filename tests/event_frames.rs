use std::io::Write;

use chrono::{TimeZone, Utc};
use pitlab::{
    detect_timestamp_column, DataSourceSpec, EngineError, EventFrame, FeatureSpec, FrameError,
    Session, Value,
};
use rusqlite::Connection;
use tempfile::NamedTempFile;

const SALES_CSV: &str = "\
event_time,store,amount,promo
2024-05-01 10:00:00,s1,12.5,true
2024-05-01T10:30:00,s1,7,false
2024-05-01 11:00:00,s2,,TRUE
";

fn csv_file(contents: &str) -> NamedTempFile {
    let mut file = NamedTempFile::new().expect("temp file should be created");
    file.write_all(contents.as_bytes())
        .expect("temp file should be writable");
    file
}

#[test]
fn csv_columns_are_typed_by_content() {
    let file = csv_file(SALES_CSV);
    let frame = EventFrame::from_csv_path(file.path()).expect("csv should load");

    assert_eq!(frame.columns(), ["event_time", "store", "amount", "promo"]);
    assert_eq!(frame.len(), 3);
    let amounts: Vec<_> = frame.column("amount").expect("amount column").cloned().collect();
    assert_eq!(
        amounts,
        [Some(Value::Float(12.5)), Some(Value::Float(7.0)), None]
    );
    let promo: Vec<_> = frame.column("promo").expect("promo column").cloned().collect();
    assert_eq!(
        promo,
        [
            Some(Value::Bool(true)),
            Some(Value::Bool(false)),
            Some(Value::Bool(true))
        ]
    );
    assert_eq!(
        frame.rows()[1][0],
        Some(Value::Timestamp(Utc.with_ymd_and_hms(2024, 5, 1, 10, 30, 0).unwrap()))
    );
    assert_eq!(detect_timestamp_column(&frame).as_deref(), Some("event_time"));
}

#[test]
fn ragged_csv_rows_are_rejected() {
    let file = csv_file("a,b\n1,2\n3\n");
    assert!(matches!(
        EventFrame::from_csv_path(file.path()),
        Err(FrameError::RowWidth { .. }) | Err(FrameError::Csv(_))
    ));
}

#[test]
fn csv_sources_replay_into_features() {
    let file = csv_file(SALES_CSV);
    let frame = EventFrame::from_csv_path(file.path()).expect("csv should load");

    let mut session = Session::default();
    session
        .register_data_source(DataSourceSpec::new("sales").with_keys(&["store"]).with_frame(frame))
        .expect("data source should register");
    let program = session
        .parse_program(
            "def revenue(row, ctx) -> float:
    amount = row['amount']
    if amount is None:
        return None
    if row['promo']:
        return amount * 0.9
    return amount
",
        )
        .expect("program should parse");
    session
        .register_feature(
            FeatureSpec::new(program)
                .with_data_source("sales")
                .with_freshness(chrono::Duration::minutes(5), None),
        )
        .expect("feature should register");

    let output = session.replay("default.revenue").expect("replay should succeed");
    assert_eq!(output.report.input_rows, 3);
    assert_eq!(output.report.dropped_rows, 1);
    let values: Vec<_> = output.records.iter().map(|r| (r.keys.as_str(), r.value.clone())).collect();
    assert_eq!(
        values,
        [("s1", Value::Float(12.5 * 0.9)), ("s1", Value::Float(7.0))]
    );
}

#[test]
fn sqlite_sources_keep_storage_classes() {
    let conn = Connection::open_in_memory().expect("sqlite should open");
    conn.execute_batch(
        "CREATE TABLE clicks (ts INTEGER, user TEXT, score REAL, payload BLOB);
         INSERT INTO clicks VALUES (1714557600000, 'u1', 0.5, x'0a0b');
         INSERT INTO clicks VALUES (1714557660000, 'u2', NULL, x'ff');",
    )
    .expect("fixture should load");

    let frame = EventFrame::from_sqlite(&conn, "SELECT ts, user, score, payload FROM clicks ORDER BY ts")
        .expect("query should load");
    assert_eq!(frame.rows()[0][3], Some(Value::from("0a0b")));
    assert_eq!(frame.rows()[1][2], None);

    let mut session = Session::default();
    session
        .register_data_source(DataSourceSpec::new("clicks").with_keys(&["user"]).with_frame(frame))
        .expect("data source should register");
    let program = session
        .parse_program("def payload_size(row, ctx) -> int:\n    return len(row['payload']) // 2\n")
        .expect("program should parse");
    session
        .register_feature(
            FeatureSpec::new(program)
                .with_data_source("clicks")
                .with_freshness(chrono::Duration::minutes(1), None),
        )
        .expect("feature should register");

    let output = session.replay("default.payload_size").expect("replay should succeed");
    let records: Vec<_> = output
        .records
        .iter()
        .map(|r| (r.keys.as_str(), r.timestamp, r.value.clone()))
        .collect();
    assert_eq!(
        records,
        [
            ("u1", Utc.with_ymd_and_hms(2024, 5, 1, 10, 0, 0).unwrap(), Value::Int(2)),
            ("u2", Utc.with_ymd_and_hms(2024, 5, 1, 10, 1, 0).unwrap(), Value::Int(1)),
        ]
    );
}

#[test]
fn replay_needs_a_timestamp_and_keys() {
    let frame = EventFrame::from_rows(
        &["user", "score"],
        vec![vec![Some(Value::from("u1")), Some(Value::Int(1))]],
    )
    .expect("frame should build");
    let mut session = Session::default();
    session
        .register_data_source(DataSourceSpec::new("scores").with_keys(&["user"]).with_frame(frame))
        .expect("data source should register");
    let program = session
        .parse_program("def score(row, ctx) -> int:\n    return row['score']\n")
        .expect("program should parse");
    session
        .register_feature(
            FeatureSpec::new(program)
                .with_data_source("scores")
                .with_freshness(chrono::Duration::minutes(1), None),
        )
        .expect("feature should register");
    assert!(matches!(
        session.replay("default.score"),
        Err(EngineError::NoTimestampColumn { .. })
    ));
}

use std::io;
use std::io::Write;
use std::sync::{Arc, Mutex};

use chrono::{Duration, TimeZone, Utc};
use pitlab::{
    log_app_start, log_replay_report, log_source_selected, DataSourceSpec, EventFrame,
    FeatureSpec, LoggingConfig, ModelSpec, ProgramRuntime, Session, Value,
};
use tracing::dispatcher::with_default;
use tracing::Level;
use tracing_subscriber::fmt::writer::MakeWriter;

#[derive(Clone, Default)]
struct SharedWriter {
    inner: Arc<Mutex<Vec<u8>>>,
}

impl SharedWriter {
    fn output_string(&self) -> String {
        let bytes = self
            .inner
            .lock()
            .expect("writer lock should not be poisoned");
        String::from_utf8_lossy(&bytes).to_string()
    }
}

struct SharedWriterGuard {
    inner: Arc<Mutex<Vec<u8>>>,
}

impl<'a> MakeWriter<'a> for SharedWriter {
    type Writer = SharedWriterGuard;

    fn make_writer(&'a self) -> Self::Writer {
        SharedWriterGuard {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl Write for SharedWriterGuard {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let mut out = self
            .inner
            .lock()
            .expect("writer lock should not be poisoned");
        out.extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

fn capture_logs(max_level: Level, f: impl FnOnce()) -> String {
    let writer = SharedWriter::default();
    let subscriber = tracing_subscriber::fmt()
        .json()
        .with_ansi(false)
        .with_max_level(max_level)
        .with_writer(writer.clone())
        .finish();
    let dispatch = tracing::Dispatch::new(subscriber);

    with_default(&dispatch, f);
    writer.output_string()
}

fn session_with_feature() -> Session {
    let t0 = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
    let frame = EventFrame::from_rows(
        &["timestamp", "id", "v"],
        vec![
            vec![Some(Value::Timestamp(t0)), Some(Value::from("a")), Some(Value::Int(1))],
            vec![
                Some(Value::Timestamp(t0 + Duration::minutes(5))),
                Some(Value::from("a")),
                None,
            ],
        ],
    )
    .expect("frame should build");
    let mut session = Session::default();
    session
        .register_data_source(DataSourceSpec::new("events").with_keys(&["id"]).with_frame(frame))
        .expect("data source should register");
    let program = session
        .parse_program("def v(row, ctx) -> int:\n    return row['v']\n")
        .expect("program should parse");
    session
        .register_feature(
            FeatureSpec::new(program)
                .with_data_source("events")
                .with_freshness(Duration::minutes(1), Some(Duration::hours(1))),
        )
        .expect("feature should register");
    session
}

#[test]
fn replay_emits_lifecycle_events() {
    let logs = capture_logs(Level::INFO, || {
        let session = session_with_feature();
        let output = session.replay("default.v").expect("replay should succeed");
        log_replay_report("logging_smoke", &output.report);
    });

    assert!(logs.contains("\"event\":\"session.spec.registered\""));
    assert!(logs.contains("\"event\":\"replay.start\""));
    assert!(logs.contains("\"event\":\"replay.finish\""));
    assert!(logs.contains("\"event\":\"replay.summary\""));
    assert!(!logs.contains("\"event\":\"replay.row_dropped\""));
}

#[test]
fn dropped_rows_are_logged_at_debug() {
    let logs = capture_logs(Level::DEBUG, || {
        let session = session_with_feature();
        session.replay("default.v").expect("replay should succeed");
    });

    assert!(logs.contains("\"event\":\"replay.row_dropped\""));
    assert!(logs.contains("\"event\":\"store.append\""));
}

#[test]
fn joins_and_program_loads_are_logged() {
    let logs = capture_logs(Level::INFO, || {
        let mut session = session_with_feature();
        session
            .register_model(ModelSpec::new("m").with_features(&["v"]))
            .expect("model should register");
        session
            .historical_get("default.m", None, None)
            .expect("join should succeed");

        let runtime = ProgramRuntime::new();
        runtime
            .load_program("default.v", "def v(row, ctx) -> int:\n    return 1\n")
            .expect("program should load");
    });

    assert!(logs.contains("\"event\":\"historical.join.finish\""));
    assert!(logs.contains("\"event\":\"runtime.program.loaded\""));
}

#[test]
fn binary_helpers_emit_baseline_events() {
    let logs = capture_logs(Level::INFO, || {
        let cfg = LoggingConfig::default();
        log_app_start("logging_smoke", &cfg);
        log_source_selected("logging_smoke", "csv", "/tmp/events.csv");
    });

    assert!(logs.contains("\"event\":\"app.start\""));
    assert!(logs.contains("\"event\":\"source.selected\""));
}

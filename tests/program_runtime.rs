use std::thread;

use chrono::{DateTime, Duration, TimeZone, Utc};
use pitlab::{
    EngineError, EntityKeys, FeatureSpec, ProgramError, ProgramRuntime, Row, Session,
    SessionConfig, SideEffectKind, Value, WriteInstruction, WriteOp,
};

fn t(minutes: i64) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 2, 1, 8, 0, 0).unwrap() + Duration::minutes(minutes)
}

fn user(id: &str) -> EntityKeys {
    EntityKeys::from([("user".to_string(), id.to_string())])
}

const AFTER_FEE: &str = "def after_fee(row, ctx) -> float:
    balance, _ = ctx.get_feature('balance')
    if balance is None:
        return None
    return balance - row['fee']
";

fn session_with_balance() -> Session {
    let mut session = Session::new(SessionConfig {
        default_namespace: "bank".to_string(),
        ..SessionConfig::default()
    });
    let program = session
        .parse_program("def balance(row, ctx) -> int:\n    return row['balance']\n")
        .expect("program should parse");
    session
        .register_feature(
            FeatureSpec::new(program)
                .with_keys(&["user"])
                .with_freshness(Duration::minutes(1), Some(Duration::hours(1))),
        )
        .expect("balance should register");
    for (minutes, value) in [(0, 100), (30, 250)] {
        session
            .apply_instruction(WriteInstruction {
                op: WriteOp::Set,
                fqn: "balance".to_string(),
                keys: "u1".to_string(),
                timestamp: t(minutes),
                value: Value::Int(value),
            })
            .expect("write should apply");
    }
    session
}

fn fee(amount: f64) -> Row {
    Row::from([("fee".to_string(), Some(Value::Float(amount)))])
}

#[test]
fn loaded_programs_describe_their_dependencies() {
    let runtime = ProgramRuntime::new();
    let loaded = runtime
        .load_program("bank.after_fee", AFTER_FEE)
        .expect("program should load");
    assert_eq!(loaded.fqn, "bank.after_fee");
    assert_eq!(loaded.side_effects.len(), 1);
    assert_eq!(loaded.side_effects[0].kind, SideEffectKind::GetFeature);
    assert_eq!(loaded.side_effects[0].selector, "balance");
    assert!(!loaded.side_effects[0].conditional);
    assert_eq!(
        runtime
            .load_program("bank.after_fee", AFTER_FEE)
            .expect("reload is a no-op")
            .checksum,
        loaded.checksum
    );
}

#[test]
fn executes_against_the_session_store() {
    let session = session_with_balance();
    let runtime = ProgramRuntime::new();
    runtime
        .load_program("bank.after_fee", AFTER_FEE)
        .expect("program should load");

    let out = runtime
        .execute_program("bank.after_fee", user("u1"), t(45), &fee(2.5), &session)
        .expect("execution should succeed");
    assert_eq!(out.result, Some(Value::Float(247.5)));
    assert_eq!(out.keys, user("u1"));
    assert_eq!(out.timestamp, t(45));

    let before_any_balance = runtime
        .execute_program("bank.after_fee", user("u1"), t(-1), &fee(2.5), &session)
        .expect("execution should succeed");
    assert_eq!(before_any_balance.result, None);

    let unknown_user = runtime
        .execute_program("bank.after_fee", user("u2"), t(45), &fee(2.5), &session)
        .expect("execution should succeed");
    assert_eq!(unknown_user.result, None);
}

#[test]
fn executions_share_the_cache_across_threads() {
    let session = session_with_balance();
    let runtime = ProgramRuntime::new();
    runtime
        .load_program("bank.after_fee", AFTER_FEE)
        .expect("program should load");

    let results: Vec<Option<Value>> = thread::scope(|scope| {
        let handles: Vec<_> = [10, 40]
            .into_iter()
            .map(|minutes| {
                let runtime = &runtime;
                let session = &session;
                scope.spawn(move || {
                    runtime
                        .execute_program("bank.after_fee", user("u1"), t(minutes), &fee(1.0), session)
                        .expect("execution should succeed")
                        .result
                })
            })
            .collect();
        handles
            .into_iter()
            .map(|h| h.join().expect("worker should not panic"))
            .collect()
    });
    assert_eq!(results, [Some(Value::Float(99.0)), Some(Value::Float(249.0))]);
}

#[test]
fn overrides_replace_keys_and_timestamp() {
    let session = session_with_balance();
    let runtime = ProgramRuntime::new();
    runtime
        .load_program(
            "bank.shifted",
            "def shifted(row, ctx) -> int:\n    return 1, {'user': 'u9'}, ctx.timestamp - timedelta(minutes=5)\n",
        )
        .expect("program should load");
    let out = runtime
        .execute_program("bank.shifted", user("u1"), t(30), &Row::new(), &session)
        .expect("execution should succeed");
    assert_eq!(out.result, Some(Value::Int(1)));
    assert_eq!(out.keys, user("u9"));
    assert_eq!(out.timestamp, t(25));
}

#[test]
fn wrong_result_types_are_rejected() {
    let session = session_with_balance();
    let runtime = ProgramRuntime::new();
    runtime
        .load_program("bank.label", "def label(row, ctx) -> int:\n    return 'high'\n")
        .expect("program should load");
    assert!(matches!(
        runtime.execute_program("bank.label", user("u1"), t(0), &Row::new(), &session),
        Err(EngineError::TypeMismatch { .. })
    ));
}

#[test]
fn unsafe_programs_never_load() {
    let runtime = ProgramRuntime::new();
    let rejected = |source: &str| -> String {
        match runtime.load_program("bank.bad", source) {
            Err(EngineError::Program(ProgramError::Validation { message, .. })) => message,
            other => panic!("expected a validation error, got {other:?}"),
        }
    };
    assert!(rejected("import subprocess\ndef bad(row, ctx) -> int:\n    return 1\n")
        .contains("i/o package"));
    assert!(rejected("import polars\ndef bad(row, ctx) -> int:\n    return 1\n")
        .contains("dataset package"));
    assert!(rejected("def bad(row, ctx) -> int:\n    return open('x')\n").contains("blocked"));
    assert!(rejected("def bad(row, ctx) -> int:\n    return bad(row, ctx)\n").contains("recursion"));
    assert!(rejected("def bad(row) -> int:\n    return 1\n").contains("exactly two arguments"));
    assert!(matches!(
        runtime.load_program("bank.bad", "def bad(row, ctx):\n    return 1\n"),
        Err(EngineError::Program(ProgramError::MissingTypeAnnotation { .. }))
    ));
    assert!(runtime.is_empty());
}

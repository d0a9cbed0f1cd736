use std::env;
use std::fs;
use std::io;
use std::path::PathBuf;

use pitlab::{
    init_logging, log_app_start, log_replay_report, log_source_selected, logging_config_from_env,
    parse_duration, session_config_from_env, AggrSpec, AggregationFunction, DataSourceSpec,
    EventFrame, FeatureSpec, Session,
};
use rusqlite::Connection;

const COMPONENT: &str = "pitlab_replay";

fn required(name: &str) -> Result<String, Box<dyn std::error::Error>> {
    env::var(name).map_err(|_| format!("{name} must be set").into())
}

fn optional(name: &str) -> Option<String> {
    env::var(name)
        .ok()
        .map(|raw| raw.trim().to_string())
        .filter(|raw| !raw.is_empty())
}

fn load_frame() -> Result<EventFrame, Box<dyn std::error::Error>> {
    if let Some(path) = optional("PITLAB_SOURCE_CSV") {
        log_source_selected(COMPONENT, "csv", &path);
        return Ok(EventFrame::from_csv_path(&PathBuf::from(path))?);
    }
    if let Some(path) = optional("PITLAB_SOURCE_SQLITE") {
        let query = required("PITLAB_SOURCE_QUERY")?;
        log_source_selected(COMPONENT, "sqlite", &path);
        let conn = Connection::open(&path)?;
        return Ok(EventFrame::from_sqlite(&conn, &query)?);
    }
    Err("set PITLAB_SOURCE_CSV or PITLAB_SOURCE_SQLITE".into())
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let logging_cfg = logging_config_from_env();
    init_logging(&logging_cfg)?;
    log_app_start(COMPONENT, &logging_cfg);

    let config = session_config_from_env();
    let namespace = config.default_namespace.clone();
    let mut session = Session::new(config);

    let keys: Vec<String> = required("PITLAB_KEYS")?
        .split(',')
        .map(|k| k.trim().to_string())
        .filter(|k| !k.is_empty())
        .collect();
    let key_refs: Vec<&str> = keys.iter().map(String::as_str).collect();

    let mut source = DataSourceSpec::new("events")
        .with_namespace(&namespace)
        .with_keys(&key_refs)
        .with_frame(load_frame()?);
    if let Some(column) = optional("PITLAB_TIMESTAMP_COLUMN") {
        source = source.with_timestamp(&column);
    }
    let source = session.register_data_source(source)?;

    let program_source = fs::read_to_string(required("PITLAB_PROGRAM")?)?;
    let program = session.parse_program(&program_source)?;
    let mut feature = FeatureSpec::new(program)
        .with_namespace(&namespace)
        .with_data_source(&source.fqn());

    if let Some(freshness) = optional("PITLAB_FRESHNESS") {
        let staleness = optional("PITLAB_STALENESS")
            .map(|raw| parse_duration(&raw))
            .transpose()?;
        feature = feature.with_freshness(parse_duration(&freshness)?, staleness);
    }
    if let Some(funcs) = optional("PITLAB_AGGR") {
        let funcs = funcs
            .split(',')
            .map(|raw| {
                AggregationFunction::parse(raw)
                    .ok_or_else(|| format!("unknown aggregation function '{}'", raw.trim()))
            })
            .collect::<Result<Vec<_>, _>>()?;
        let over = parse_duration(&required("PITLAB_AGGR_OVER")?)?;
        let granularity = optional("PITLAB_AGGR_GRANULARITY")
            .map(|raw| parse_duration(&raw))
            .transpose()?
            .unwrap_or(over);
        feature = feature.with_aggregation(AggrSpec::new(funcs, over, granularity));
    }
    let feature = session.register_feature(feature)?;

    let output = session.replay(&feature.fqn())?;
    log_replay_report(COMPONENT, &output.report);

    let mut writer = csv::Writer::from_writer(io::stdout().lock());
    writer.write_record(["fqn", "keys", "timestamp", "value"])?;
    for record in &output.records {
        writer.write_record([
            record.fqn.clone(),
            record.keys.clone(),
            record.timestamp.to_rfc3339(),
            record.value.to_string(),
        ])?;
    }
    writer.flush()?;
    Ok(())
}

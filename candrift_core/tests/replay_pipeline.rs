use candrift_core::{
    CandriftConfig, ConfigError, FnTransmitter, OutcomeLog, ReplayOrchestrator, TraceCorpus,
    TransmitError,
};
use std::io::Write;
use std::sync::{Arc, Mutex};
use std::time::Duration;

const TRACE: &str = "\
;$FILEVERSION=1.1
;   Message Number)  Time Offset  Type  ID  Data Length  Data Bytes
1)        10.0  Rx         01F1  4  DE AD BE EF
2)        10.5  Rx         0370  8  00 52 EF 00 0F EC D0 0E
3)        11.0  Rx         0018  2  01 02
4)        11.5  Rx         0018  2  01 03
5)        12.0  Rx         0034  1
";

fn write_temp(suffix: &str, content: &str) -> tempfile::NamedTempFile {
    let mut file = tempfile::Builder::new().suffix(suffix).tempfile().unwrap();
    file.write_all(content.as_bytes()).unwrap();
    file
}

#[test]
fn trace_file_replays_end_to_end_with_outcome_log() {
    let trace = write_temp(".trc", TRACE);
    let corpus = TraceCorpus::load(trace.path(), 50).unwrap();
    assert_eq!(corpus.len(), 4);
    assert_eq!(corpus.stats().skipped, 1);

    let mut file_config = CandriftConfig::default();
    file_config.replay.target_ids = vec!["0018".into(), "01f1".into(), "0999".into()];
    file_config.replay.interface = "vcan0".into();
    file_config.replay.message_rate = 50.0;
    file_config.replay.duration_secs = 1;
    file_config.replay.seed = Some(7);
    let replay = file_config
        .replay_config()
        .unwrap()
        .resolve_targets(&corpus)
        .unwrap();

    let dir = tempfile::tempdir().unwrap();
    let log_path = dir.path().join("outcomes.jsonl");
    let log = OutcomeLog::open(&log_path).unwrap();

    let wires = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&wires);
    let primitive = FnTransmitter::new(move |iface: &str, wire: &str| {
        assert_eq!(iface, "vcan0");
        let mut seen = sink.lock().unwrap();
        seen.push(wire.to_string());
        // Every fifth frame bounces to exercise the failure path.
        if seen.len() % 5 == 0 {
            Err(TransmitError::Rejected("bus busy".into()))
        } else {
            Ok(())
        }
    });

    let mut orchestrator =
        ReplayOrchestrator::new(replay, &corpus, primitive).with_outcome_log(log);
    let summary = orchestrator.run().unwrap();

    let wires = wires.lock().unwrap();
    assert_eq!(summary.sent, wires.len() as u64);
    assert_eq!(summary.sent, summary.succeeded + summary.failed);
    assert_eq!(summary.failed, summary.sent / 5);
    assert!((40..=51).contains(&summary.sent), "sent {}", summary.sent);
    assert!(summary.skipped > 0);
    for wire in wires.iter() {
        assert!(
            wire.starts_with("018#") && wire.len() == 8
                || wire.starts_with("1F1#") && wire.len() == 12,
            "unexpected wire frame {wire}"
        );
    }

    let lines = std::fs::read_to_string(&log_path).unwrap();
    assert_eq!(lines.lines().count() as u64, summary.sent);
    assert!(lines.contains("\"error\":\"Frame rejected: bus busy\""));
}

#[test]
fn tabular_file_loads_without_cap() {
    let mut table = String::from("ID,LEN,D1,D2,D3,D4,D5,D6,D7,D8\n");
    for i in 0..60 {
        table.push_str(&format!("0153,2,{:02X},FF,,,,,,\n", i));
    }
    let csv = write_temp(".csv", &table);
    let corpus = TraceCorpus::load(csv.path(), 50).unwrap();
    assert_eq!(corpus.count_for("0153"), 60);
    assert_eq!(corpus.nth_for("0153", 59).unwrap().to_wire(), "153#3BFF");
}

#[test]
fn unresolvable_targets_fail_before_running() {
    let trace = write_temp(".trc", TRACE);
    let corpus = TraceCorpus::load(trace.path(), 50).unwrap();

    let mut file_config = CandriftConfig::default();
    file_config.replay.target_ids = vec!["0AAA".into()];
    let replay = file_config.replay_config().unwrap();
    assert!(matches!(
        replay.clone().resolve_targets(&corpus),
        Err(ConfigError::TargetsNotInCorpus(_))
    ));

    file_config.replay.use_all_observed_ids_if_missing = true;
    let resolved = file_config
        .replay_config()
        .unwrap()
        .resolve_targets(&corpus)
        .unwrap();
    assert_eq!(resolved.target_ids, vec!["0018", "01F1", "0370"]);
}

#[test]
fn short_run_reaches_requested_rate() {
    let trace = write_temp(".log", TRACE);
    let corpus = TraceCorpus::load(trace.path(), 50).unwrap();
    let mut file_config = CandriftConfig::default();
    file_config.replay.target_ids = vec!["0370".into()];
    file_config.replay.message_rate = 25.0;
    file_config.replay.duration_secs = 1;
    let replay = file_config.replay_config().unwrap();

    let mut orchestrator = ReplayOrchestrator::new(
        replay,
        &corpus,
        FnTransmitter::new(|_: &str, _: &str| Ok(())),
    );
    let summary = orchestrator.run().unwrap();
    assert!((23..=26).contains(&summary.sent), "sent {}", summary.sent);
    assert!(summary.elapsed >= Duration::from_secs(1));
    assert!((summary.average_rate() - 25.0).abs() < 3.0);
}

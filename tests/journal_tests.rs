//! Integration tests for the journal storage backend.

use std::io::Write;

use prefopt::prelude::{ExperimentConfig, SimulatedOracle};
use prefopt::storage::{JournalStorage, Storage};
use prefopt::{Comparison, Error, Experiment, Query, TrialRecord};

fn temp_path() -> std::path::PathBuf {
    use std::sync::atomic::{AtomicU64, Ordering};
    static COUNTER: AtomicU64 = AtomicU64::new(0);

    let mut path = std::env::temp_dir();
    path.push(format!(
        "prefopt_journal_test_{}_{}",
        std::process::id(),
        COUNTER.fetch_add(1, Ordering::Relaxed)
    ));
    path.push("trial.jsonl");
    path
}

fn sample_record(iteration: usize, x: f64) -> TrialRecord {
    let query = Query::new(vec![vec![x, 1.0 - x], vec![x / 3.0, 0.1]]).unwrap();
    TrialRecord {
        trial: 1,
        iteration,
        comparisons: vec![Comparison::new(query, 1).unwrap()],
        best_point: Some(vec![x, x * x]),
        best_value: Some(-x / 7.0),
        max_value_within_queries: Some(1.0 - x),
        elapsed_secs: 0.25,
        degraded: iteration % 2 == 1,
    }
}

fn cleanup(path: &std::path::Path) {
    if let Some(dir) = path.parent() {
        std::fs::remove_dir_all(dir).ok();
    }
}

#[test]
fn records_survive_a_reopen_bit_for_bit() {
    let path = temp_path();
    let storage = JournalStorage::create(&path).unwrap();

    let records: Vec<TrialRecord> = (0..5)
        .map(|i| sample_record(i, 0.1 + f64::from(u32::try_from(i).unwrap()) / 7.0))
        .collect();
    for r in &records {
        storage.push(r.clone()).unwrap();
    }
    assert_eq!(storage.records(), records);

    let reopened = JournalStorage::open(&path).unwrap();
    let loaded = reopened.records();
    assert_eq!(loaded, records);
    for (a, b) in loaded.iter().zip(&records) {
        let xa = a.best_point.as_ref().unwrap();
        let xb = b.best_point.as_ref().unwrap();
        assert_eq!(xa[1].to_bits(), xb[1].to_bits());
    }

    cleanup(&path);
}

#[test]
fn create_truncates_an_existing_journal() {
    let path = temp_path();
    let storage = JournalStorage::create(&path).unwrap();
    storage.push(sample_record(0, 0.5)).unwrap();
    drop(storage);

    let fresh = JournalStorage::create(&path).unwrap();
    assert!(fresh.is_empty());
    assert!(JournalStorage::open(&path).unwrap().is_empty());

    cleanup(&path);
}

#[test]
fn missing_file_opens_empty_and_is_created_on_first_write() {
    let path = temp_path();
    let storage = JournalStorage::open(&path).unwrap();
    assert!(storage.is_empty());
    assert!(!path.exists());

    storage.push(sample_record(0, 0.2)).unwrap();
    assert!(path.exists());
    assert_eq!(JournalStorage::open(&path).unwrap().len(), 1);

    cleanup(&path);
}

#[test]
fn refresh_picks_up_records_from_another_writer() {
    let path = temp_path();
    let reader = JournalStorage::create(&path).unwrap();
    let writer = JournalStorage::open(&path).unwrap();

    writer.push(sample_record(0, 0.3)).unwrap();
    writer.push(sample_record(1, 0.4)).unwrap();
    assert!(reader.is_empty());

    assert!(reader.refresh().unwrap());
    assert_eq!(reader.len(), 2);
    assert!(!reader.refresh().unwrap());

    cleanup(&path);
}

#[test]
fn blank_lines_are_skipped_and_garbage_is_reported() {
    let path = temp_path();
    let storage = JournalStorage::create(&path).unwrap();
    storage.push(sample_record(0, 0.6)).unwrap();
    drop(storage);

    {
        let mut file = std::fs::OpenOptions::new().append(true).open(&path).unwrap();
        writeln!(file).unwrap();
    }
    assert_eq!(JournalStorage::open(&path).unwrap().len(), 1);

    {
        let mut file = std::fs::OpenOptions::new().append(true).open(&path).unwrap();
        writeln!(file, "{{\"trial\": 1, \"iteration\": ").unwrap();
    }
    let err = JournalStorage::open(&path).unwrap_err();
    assert!(matches!(err, Error::Storage(msg) if msg.contains(":3:")));

    cleanup(&path);
}

#[test]
fn out_of_box_queries_are_rejected_on_load() {
    let path = temp_path();
    std::fs::create_dir_all(path.parent().unwrap()).unwrap();
    std::fs::write(
        &path,
        "{\"trial\":1,\"iteration\":0,\"comparisons\":[{\"query\":[[0.5],[1.5]],\"winner\":0}]}\n",
    )
    .unwrap();

    assert!(matches!(JournalStorage::open(&path), Err(Error::Storage(_))));

    cleanup(&path);
}

#[test]
fn winner_outside_the_query_is_rejected_on_load() {
    let dir = temp_path().parent().unwrap().to_path_buf();
    let config = ExperimentConfig::builder("corrupt", 2)
        .num_init_queries(1)
        .restart(true)
        .results_dir(&dir)
        .build()
        .unwrap();
    let path = config.journal_path(1).unwrap();

    let storage = JournalStorage::create(&path).unwrap();
    let mut record = sample_record(0, 0.4);
    record.degraded = false;
    storage.push(record).unwrap();
    drop(storage);

    let text = std::fs::read_to_string(&path).unwrap();
    assert!(text.contains("\"winner\":1"));
    std::fs::write(&path, text.replace("\"winner\":1", "\"winner\":7")).unwrap();

    let err = JournalStorage::open(&path).unwrap_err();
    assert!(matches!(&err, Error::Storage(msg) if msg.contains(":1:")), "{err}");

    let oracle = SimulatedOracle::from_config(|x: &[f64]| x[0], &config);
    assert!(matches!(
        Experiment::new(&config, 1, oracle),
        Err(Error::Storage(_))
    ));

    std::fs::remove_dir_all(&dir).ok();
}

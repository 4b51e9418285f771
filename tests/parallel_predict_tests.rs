//! Parallel prediction through scratch maps.

use knowledge_store::{
    ParallelPredictBuffer, StorageConfiguration, StorageEngine, StorageError, StorageHint,
};
use tempfile::TempDir;

#[derive(Debug, Clone, PartialEq)]
struct Document {
    text: String,
    score: Option<f64>,
    label: Option<String>,
}

fn corpus(n: usize) -> Vec<Document> {
    (0..n)
        .map(|i| Document {
            text: format!("doc {i} {}", "word ".repeat(i % 17)),
            score: None,
            label: None,
        })
        .collect()
}

fn predict(doc: &Document) -> knowledge_store::Result<(f64, String)> {
    let words = doc.text.split_whitespace().count() as f64;
    let score = (words * 0.37).sin();
    let label = if score >= 0.0 { "pos" } else { "neg" };
    Ok((score, label.to_string()))
}

fn apply(doc: &mut Document, (score, label): (f64, String)) {
    doc.score = Some(score);
    doc.label = Some(label);
}

#[test]
fn worker_count_does_not_change_results() -> anyhow::Result<()> {
    let root = TempDir::new()?;
    for config in [
        StorageConfiguration::in_memory(root.path().join("mem")),
        StorageConfiguration::disk(root.path().join("disk")),
    ] {
        let engine = config.open("classifier")?;

        let mut single = corpus(500);
        let mut eight = corpus(500);
        ParallelPredictBuffer::new(1).run(&engine, &mut single, predict, apply)?;
        ParallelPredictBuffer::new(8).run(&engine, &mut eight, predict, apply)?;

        assert_eq!(single, eight);
        assert!(single.iter().all(|d| d.label.is_some()));
        assert!(engine.big_map_names().is_empty());
    }
    Ok(())
}

#[test]
fn scratch_maps_are_temporary_and_unique() -> anyhow::Result<()> {
    let root = TempDir::new()?;
    let config = StorageConfiguration::disk(root.path());
    let mut engine = config.open("classifier")?;

    let mut docs = corpus(64);
    let buffer = ParallelPredictBuffer::new(4).with_storage_hint(StorageHint::InCache);
    assert_eq!(buffer.workers(), 4);
    buffer.run(&engine, &mut docs, predict, apply)?;
    buffer.run(&engine, &mut docs, predict, apply)?;

    // Only temporary partitions were touched
    assert!(!root.path().join("classifier").exists());
    let temp = engine.temporary_directory().expect("temporary partition opened");
    engine.close()?;
    assert!(!temp.exists());
    Ok(())
}

#[test]
fn closed_engine_fails_fast() -> anyhow::Result<()> {
    let root = TempDir::new()?;
    let mut engine = StorageConfiguration::in_memory(root.path()).open("m")?;
    engine.close()?;

    let mut docs = corpus(3);
    let err = ParallelPredictBuffer::new(2)
        .run(&engine, &mut docs, predict, apply)
        .unwrap_err();
    assert!(matches!(err, StorageError::AlreadyClosed(_)));
    assert!(docs.iter().all(|d| d.score.is_none()));
    Ok(())
}

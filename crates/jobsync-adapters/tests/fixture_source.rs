use std::path::Path;

use jobsync_adapters::{AdapterError, FixtureSource, RemoteSource};

fn fixtures_dir() -> std::path::PathBuf {
    Path::new(env!("CARGO_MANIFEST_DIR")).join("../../fixtures/jobicy")
}

#[tokio::test]
async fn fixture_source_serves_every_collection() {
    let source = FixtureSource::new(fixtures_dir()).expect("fixture dir");
    assert_eq!(source.source_id(), "fixture");
    assert_eq!(source.fetch_locations().await.unwrap().len(), 4);
    assert_eq!(source.fetch_industries().await.unwrap().len(), 3);

    let feed = source.fetch_job_feed().await.unwrap();
    let companies = feed.iter().filter_map(|i| i.company.as_deref()).collect::<Vec<_>>();
    assert_eq!(companies, vec!["Ferrous Labs", "Docs Inc", "Ferrous Labs"]);
}

#[tokio::test]
async fn missing_fixture_file_reads_as_unavailable() {
    let dir = tempfile::tempdir().unwrap();
    let source = FixtureSource::new(dir.path()).unwrap();
    let err = source.fetch_job_feed().await.unwrap_err();
    assert!(matches!(err, AdapterError::RemoteUnavailable { .. }));
}

use std::error::Error;
use std::ops::ControlFlow;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use sql_composer::prelude::*;
use tempfile::TempDir;

type TestResult = Result<(), Box<dyn Error>>;

fn db_path(dir: &TempDir, name: &str) -> String {
    dir.path().join(name).to_string_lossy().into_owned()
}

async fn seeded(path: &str, rows: i64) -> Result<(), ComposerError> {
    let mut conn = ConnectionManager::new(ConnectionSettings::new(path));
    let never = CancellationToken::new();
    conn.execute_non_query_async(
        &QuerySpec::new(format!(
            "CREATE TABLE items (id INTEGER PRIMARY KEY, name TEXT);
             WITH RECURSIVE n(x) AS (SELECT 1 UNION ALL SELECT x + 1 FROM n WHERE x < {rows})
             INSERT INTO items SELECT x, 'item ' || x FROM n;"
        ))
        .require_transaction(),
        &never,
    )
    .await?;
    Ok(())
}

#[tokio::test]
async fn query_async_returns_rows_and_closes() -> TestResult {
    let dir = tempfile::tempdir()?;
    let path = db_path(&dir, "async.db");
    seeded(&path, 5).await?;

    let mut conn = ConnectionManager::new(ConnectionSettings::new(&path));
    let mut params = ParameterSet::new();
    params.add("@min", 3)?;
    let spec = QuerySpec::new("SELECT id, name FROM items WHERE id >= @min ORDER BY id").with_params(params);

    let rows = conn.execute_query_async(&spec, &CancellationToken::new()).await?;
    assert_eq!(rows.len(), 3);
    assert_eq!(rows.results[0].get("NAME"), Some(&RowValues::Text("item 3".into())));
    assert!(!conn.is_open());

    let total = conn
        .execute_scalar_async(&QuerySpec::new("SELECT COUNT(*) FROM items"), &CancellationToken::new())
        .await?;
    assert_eq!(total, RowValues::Int(5));
    Ok(())
}

#[tokio::test]
async fn cancelled_token_fails_before_opening() -> TestResult {
    let dir = tempfile::tempdir()?;
    let path = db_path(&dir, "async.db");
    let sink = Arc::new(RecordingSink::new());
    let mut conn = ConnectionManager::with_sink(ConnectionSettings::new(&path), sink.clone());

    let cancel = CancellationToken::new();
    cancel.cancel();
    let err = conn
        .execute_non_query_async(&QuerySpec::new("CREATE TABLE never (id INTEGER)"), &cancel)
        .await
        .unwrap_err();

    assert!(matches!(err, ComposerError::ProcessCanceled));
    assert!(!conn.is_open());
    assert!(sink.events().is_empty());
    Ok(())
}

#[tokio::test]
async fn cancelling_mid_command_interrupts_and_cleans_up() -> TestResult {
    let dir = tempfile::tempdir()?;
    let path = db_path(&dir, "async.db");
    let sink = Arc::new(RecordingSink::new());
    let mut conn = ConnectionManager::with_sink(ConnectionSettings::new(&path), sink.clone());

    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(50)).await;
        trigger.cancel();
    });

    let endless = QuerySpec::new(
        "WITH RECURSIVE c(x) AS (SELECT 1 UNION ALL SELECT x + 1 FROM c WHERE x < 1000000000)
         SELECT COUNT(*) FROM c",
    )
    .require_transaction();
    let err = conn.execute_scalar_async(&endless, &cancel).await.unwrap_err();

    assert!(matches!(err, ComposerError::ProcessCanceled));
    assert!(!conn.is_open());
    assert!(!conn.in_transaction());
    let kinds: Vec<_> = sink.events().iter().map(|e| e.kind).collect();
    assert_eq!(
        kinds,
        vec![
            LifecycleKind::Opened,
            LifecycleKind::TransactionBegun,
            LifecycleKind::RolledBack,
            LifecycleKind::Closed,
        ]
    );
    Ok(())
}

#[tokio::test]
async fn reader_async_stops_when_asked() -> TestResult {
    let dir = tempfile::tempdir()?;
    let path = db_path(&dir, "async.db");
    seeded(&path, 10).await?;

    let mut conn = ConnectionManager::new(ConnectionSettings::new(&path));
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&seen);
    let visited = conn
        .execute_reader_async(
            &QuerySpec::new("SELECT id FROM items ORDER BY id"),
            &CancellationToken::new(),
            move |row| {
                let mut seen = sink.lock().expect("reader lock");
                if let Some(RowValues::Int(id)) = row.get("id") {
                    seen.push(*id);
                }
                if seen.len() == 4 {
                    ControlFlow::Break(())
                } else {
                    ControlFlow::Continue(())
                }
            },
        )
        .await?;

    assert_eq!(visited, 4);
    assert_eq!(*seen.lock().expect("reader lock"), vec![1, 2, 3, 4]);
    Ok(())
}

#[tokio::test]
async fn fill_async_appends_to_existing_rows() -> TestResult {
    let dir = tempfile::tempdir()?;
    let path = db_path(&dir, "async.db");
    seeded(&path, 6).await?;

    let mut conn = ConnectionManager::new(ConnectionSettings::new(&path));
    let cancel = CancellationToken::new();
    let mut out = ResultSet::default();
    let first = conn
        .fill_async(&QuerySpec::new("SELECT id FROM items WHERE id <= 2"), &mut out, &cancel)
        .await?;
    let second = conn
        .fill_async(&QuerySpec::new("SELECT id FROM items WHERE id > 4"), &mut out, &cancel)
        .await?;

    assert_eq!((first, second), (2, 2));
    assert_eq!(out.len(), 4);
    assert_eq!(out.results[3].get("id"), Some(&RowValues::Int(6)));
    Ok(())
}

#[tokio::test]
async fn bulk_insert_async_loads_inside_one_transaction() -> TestResult {
    let dir = tempfile::tempdir()?;
    let path = db_path(&dir, "async.db");
    seeded(&path, 0).await?;
    let mut conn = ConnectionManager::new(ConnectionSettings::new(&path));
    conn.execute_non_query_async(
        &QuerySpec::new("DELETE FROM items"),
        &CancellationToken::new(),
    )
    .await?;

    let mut data = ResultSet::default();
    data.set_column_names(Arc::new(vec!["id".into(), "name".into()]));
    for id in 100..110 {
        data.add_row_values(vec![RowValues::Int(id), RowValues::Text(format!("bulk {id}"))]);
    }

    let sink = Arc::new(RecordingSink::new());
    let mut loader = ConnectionManager::with_sink(ConnectionSettings::new(&path), sink.clone());
    let inserted = loader
        .bulk_insert_async(&data, "items", &BulkInsertSettings::default(), &CancellationToken::new())
        .await?;
    assert_eq!(inserted, 10);
    assert_eq!(sink.lines(LifecycleKind::Committed).len(), 1);

    let total = conn
        .execute_scalar_async(&QuerySpec::new("SELECT COUNT(*) FROM items"), &CancellationToken::new())
        .await?;
    assert_eq!(total, RowValues::Int(10));
    Ok(())
}

#[tokio::test]
async fn async_failure_inside_explicit_transaction_keeps_it_open() -> TestResult {
    let dir = tempfile::tempdir()?;
    let path = db_path(&dir, "async.db");
    seeded(&path, 3).await?;

    let mut conn = ConnectionManager::new(ConnectionSettings::new(&path));
    let cancel = CancellationToken::new();
    conn.begin_transaction()?;
    conn.execute_non_query_async(&QuerySpec::new("DELETE FROM items WHERE id = 1"), &cancel)
        .await?;

    let err = conn
        .execute_non_query_async(&QuerySpec::new("DELETE FROM nowhere"), &cancel)
        .await
        .unwrap_err();
    assert_eq!(err.query(), Some("DELETE FROM nowhere"));
    assert!(conn.in_transaction());
    assert!(conn.is_open());

    conn.rollback_transaction()?;
    conn.close()?;
    let remaining = conn
        .execute_scalar_async(&QuerySpec::new("SELECT COUNT(*) FROM items"), &cancel)
        .await?;
    assert_eq!(remaining, RowValues::Int(3));
    Ok(())
}

use std::time::Duration;

use relstore::db::{
    ColumnModel, ColumnValue, DbError, EntityRef, EntityState, EntryChange, IntegrityKind, Model,
    OperationKind, PgSqlGenerator, PropertyValue, Store, TableModel, ValueGenerated, ValueKind,
};
use relstore::testing::{MemoryConnection, RecordingTracker};
use relstore::{ProviderCapabilities, RetryPolicy, SaveContext, SaveError, SaveStatus, SelfReferenceStrategy};

fn library() -> Model {
    let authors = TableModel::new("authors")
        .column(ColumnModel::new("id", "bigint", ValueKind::Int).generated(ValueGenerated::OnAdd))
        .column(ColumnModel::new("name", "text", ValueKind::Text))
        .primary_key(&["id"]);
    let books = TableModel::new("books")
        .column(ColumnModel::new("id", "bigint", ValueKind::Int))
        .column(ColumnModel::new("author_id", "bigint", ValueKind::Int))
        .column(ColumnModel::new("title", "text", ValueKind::Text))
        .primary_key(&["id"])
        .foreign_key("fk_books_authors", &["author_id"], "authors", &["id"]);
    let reviews = TableModel::new("reviews")
        .column(ColumnModel::new("id", "bigint", ValueKind::Int))
        .column(ColumnModel::new("book_id", "bigint", ValueKind::Int))
        .primary_key(&["id"])
        .foreign_key("fk_reviews_books", &["book_id"], "books", &["id"]);
    let accounts = TableModel::new("accounts")
        .column(ColumnModel::new("id", "bigint", ValueKind::Int))
        .column(ColumnModel::new("email", "text", ValueKind::Text))
        .column(ColumnModel::new("version", "bigint", ValueKind::Int).concurrency_token())
        .primary_key(&["id"])
        .unique("uq_accounts_email", &["email"]);
    let nodes = TableModel::new("nodes")
        .column(ColumnModel::new("id", "bigint", ValueKind::Int).generated(ValueGenerated::OnAdd))
        .column(ColumnModel::new("parent_id", "bigint", ValueKind::Int).nullable())
        .primary_key(&["id"])
        .foreign_key("fk_nodes_parent", &["parent_id"], "nodes", &["id"]);
    Model::new(vec![authors, books, reviews, accounts, nodes]).unwrap()
}

fn store(retry: RetryPolicy) -> Store {
    Store::new(PgSqlGenerator, ProviderCapabilities::multi_statement(), retry)
}

fn fast_retry() -> RetryPolicy {
    RetryPolicy {
        max_retries: 3,
        base_delay_ms: 50,
    }
}

fn add(entity: u64, table: &str) -> EntryChange {
    EntryChange::new(entity, table, EntityState::Added)
}

fn author(entity: u64, id: i64, name: &str) -> EntryChange {
    add(entity, "authors")
        .value(PropertyValue::new("id", id).temporary())
        .value(PropertyValue::new("name", name))
}

fn book(entity: u64, id: i64, author_id: i64) -> EntryChange {
    add(entity, "books")
        .value(PropertyValue::new("id", id))
        .value(PropertyValue::new("author_id", author_id))
        .value(PropertyValue::new("title", format!("book {id}")))
}

fn tables(journal: &[relstore::testing::JournalEntry]) -> Vec<&str> {
    journal.iter().map(|e| e.table.as_str()).collect()
}

#[tokio::test]
async fn test_grandchild_child_parent_insert_in_dependency_order() {
    let model = library();
    let mut conn = MemoryConnection::new(model.clone());
    let mut tracker = RecordingTracker::new();
    let changes = vec![
        add(3, "reviews")
            .value(PropertyValue::new("id", 100))
            .value(PropertyValue::new("book_id", 10)),
        book(2, 10, 1),
        add(1, "authors")
            .value(PropertyValue::new("id", 1))
            .value(PropertyValue::new("name", "Ann")),
    ];

    let summary = store(fast_retry())
        .save_changes(&mut conn, &model, &changes, &mut tracker, &SaveContext::new())
        .await
        .unwrap();

    assert_eq!(summary.commands, 3);
    assert_eq!(summary.rows_affected, 3);
    assert_eq!(tables(conn.journal()), vec!["authors", "books", "reviews"]);
    assert_eq!(tracker.accepted, vec![EntityRef(3), EntityRef(2), EntityRef(1)]);
}

#[tokio::test]
async fn test_generated_key_reaches_dependents_and_tracker() {
    let model = library();
    let mut conn = MemoryConnection::new(model.clone());
    conn.seed("authors", &[("name", "Existing".into())]).unwrap();
    let mut tracker = RecordingTracker::new();
    let changes = vec![book(2, 10, -1), book(3, 11, -1), author(1, -1, "Bo")];

    let summary = store(fast_retry())
        .save_changes(&mut conn, &model, &changes, &mut tracker, &SaveContext::new())
        .await
        .unwrap();

    // the key read back from the author feeds a second batch
    assert_eq!(summary.batches, 2);
    assert_eq!(tracker.value(1, "id"), Some(&ColumnValue::Int(2)));
    assert_eq!(tracker.value(2, "author_id"), Some(&ColumnValue::Int(2)));
    assert_eq!(tracker.value(3, "author_id"), Some(&ColumnValue::Int(2)));
    let stored = conn.find_row("books", "id", &ColumnValue::Int(11)).unwrap();
    assert_eq!(stored["author_id"], ColumnValue::Int(2));
}

#[tokio::test]
async fn test_stale_concurrency_token_conflicts_and_rolls_back() {
    let model = library();
    let mut conn = MemoryConnection::new(model.clone());
    conn.seed("accounts", &[("id", 1.into()), ("email", "a@x".into()), ("version", 5.into())])
        .unwrap();
    let before = conn.rows("accounts").to_vec();
    let mut tracker = RecordingTracker::new();
    let changes = vec![
        add(1, "accounts")
            .value(PropertyValue::new("id", 2))
            .value(PropertyValue::new("email", "b@x"))
            .value(PropertyValue::new("version", 1)),
        EntryChange::new(2, "accounts", EntityState::Modified)
            .value(PropertyValue::new("id", 1))
            .value(PropertyValue::new("email", "c@x").modified_from("a@x"))
            .value(PropertyValue::new("version", 5).modified_from(4)),
    ];

    let err = store(fast_retry())
        .save_changes(&mut conn, &model, &changes, &mut tracker, &SaveContext::new())
        .await
        .unwrap_err();

    assert!(matches!(err, SaveError::ConcurrencyConflict(ref at) if at.entity == EntityRef(2)));
    assert!(err.is_recoverable());
    assert_eq!(err.status(), SaveStatus::ConflictAt(EntityRef(2)));
    assert_eq!(conn.rows("accounts"), before.as_slice());
    assert_eq!(conn.stats().rollbacks, 1);
    assert_eq!(conn.stats().commits, 0);
    assert!(tracker.values.is_empty());
    assert!(tracker.accepted.is_empty());
}

#[tokio::test]
async fn test_matching_concurrency_token_updates_row() {
    let model = library();
    let mut conn = MemoryConnection::new(model.clone());
    conn.seed("accounts", &[("id", 1.into()), ("email", "a@x".into()), ("version", 5.into())])
        .unwrap();
    let changes = vec![EntryChange::new(1, "accounts", EntityState::Modified)
        .value(PropertyValue::new("id", 1))
        .value(PropertyValue::new("version", 6).modified_from(5))];

    store(fast_retry())
        .save_changes(&mut conn, &model, &changes, &mut RecordingTracker::new(), &SaveContext::new())
        .await
        .unwrap();

    assert_eq!(conn.rows("accounts")[0]["version"], ColumnValue::Int(6));
}

#[tokio::test(start_paused = true)]
async fn test_transient_failures_retry_whole_save() {
    let model = library();
    let mut conn = MemoryConnection::new(model.clone());
    conn.fail_next_batches(2);
    let mut tracker = RecordingTracker::new();
    let changes = vec![author(1, -1, "Ann"), book(2, 10, -1)];

    let summary = store(fast_retry())
        .save_changes(&mut conn, &model, &changes, &mut tracker, &SaveContext::new())
        .await
        .unwrap();

    assert_eq!(summary.attempts, 3);
    let stats = conn.stats();
    assert_eq!((stats.begins, stats.rollbacks, stats.commits), (3, 2, 1));
    assert_eq!(conn.rows("authors").len(), 1);
    // values from abandoned attempts never reach the tracker
    assert_eq!(tracker.values.iter().filter(|v| v.column == "id").count(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_exhausted_retries_fault_without_changes() {
    let model = library();
    let mut conn = MemoryConnection::new(model.clone());
    conn.fail_next_batches(10);
    let mut tracker = RecordingTracker::new();
    let retry = RetryPolicy {
        max_retries: 2,
        base_delay_ms: 10,
    };

    let err = store(retry)
        .save_changes(&mut conn, &model, &[author(1, -1, "Ann")], &mut tracker, &SaveContext::new())
        .await
        .unwrap_err();

    assert!(matches!(err, SaveError::Faulted { attempts: 3, source: DbError::Temporary(_) }));
    assert!(matches!(err.status(), SaveStatus::Faulted(_)));
    assert!(conn.rows("authors").is_empty());
    assert!(tracker.accepted.is_empty());
}

#[tokio::test]
async fn test_integrity_violation_is_not_retried() {
    let model = library();
    let mut conn = MemoryConnection::new(model.clone());

    let err = store(fast_retry())
        .save_changes(&mut conn, &model, &[book(1, 10, 99)], &mut RecordingTracker::new(), &SaveContext::new())
        .await
        .unwrap_err();

    assert!(matches!(
        err,
        SaveError::Faulted {
            attempts: 1,
            source: DbError::Integrity { kind: IntegrityKind::ForeignKey, .. }
        }
    ));
    assert_eq!(conn.stats().begins, 1);
}

#[tokio::test]
async fn test_commit_failure_is_not_retried() {
    let model = library();
    let mut conn = MemoryConnection::new(model.clone());
    conn.fail_next_commit();
    let mut tracker = RecordingTracker::new();

    let err = store(fast_retry())
        .save_changes(&mut conn, &model, &[author(1, -1, "Ann")], &mut tracker, &SaveContext::new())
        .await
        .unwrap_err();

    assert_eq!(err.code(), "faulted");
    assert_eq!(conn.stats().begins, 1);
    assert!(tracker.values.is_empty());
}

#[tokio::test]
async fn test_single_command_batches_reach_same_state() {
    let model = library();
    let changes = vec![
        book(2, 10, -1),
        author(1, -1, "Ann"),
        EntryChange::new(3, "reviews", EntityState::Deleted).value(PropertyValue::new("id", 500)),
        EntryChange::new(4, "books", EntityState::Modified)
            .value(PropertyValue::new("id", 50))
            .value(PropertyValue::new("title", "renamed").modified_from("old")),
    ];

    let mut states = Vec::new();
    for size in [128, 1] {
        let mut conn = MemoryConnection::new(model.clone());
        conn.seed("authors", &[("name", "Seed".into())]).unwrap();
        conn.seed("books", &[("id", 50.into()), ("author_id", 1.into()), ("title", "old".into())])
            .unwrap();
        conn.seed("reviews", &[("id", 500.into()), ("book_id", 50.into())]).unwrap();

        let caps = ProviderCapabilities::multi_statement().with_max_batch_size(size);
        let summary = Store::new(PgSqlGenerator, caps, fast_retry())
            .save_changes(&mut conn, &model, &changes, &mut RecordingTracker::new(), &SaveContext::new())
            .await
            .unwrap();
        if size == 1 {
            assert_eq!(summary.batches, summary.commands);
        }
        let rows: Vec<_> = ["authors", "books", "reviews"]
            .iter()
            .map(|t| conn.rows(t).to_vec())
            .collect();
        states.push(rows);
    }
    assert_eq!(states[0], states[1]);
}

#[tokio::test]
async fn test_deletes_run_dependents_first() {
    let model = library();
    let mut conn = MemoryConnection::new(model.clone());
    conn.seed("authors", &[("id", 1.into()), ("name", "Ann".into())]).unwrap();
    conn.seed("books", &[("id", 10.into()), ("author_id", 1.into()), ("title", "t".into())])
        .unwrap();
    let changes = vec![
        EntryChange::new(1, "authors", EntityState::Deleted).value(PropertyValue::new("id", 1)),
        EntryChange::new(2, "books", EntityState::Deleted)
            .value(PropertyValue::new("id", 10))
            .value(PropertyValue::new("author_id", 1)),
    ];

    store(fast_retry())
        .save_changes(&mut conn, &model, &changes, &mut RecordingTracker::new(), &SaveContext::new())
        .await
        .unwrap();

    assert_eq!(tables(conn.journal()), vec!["books", "authors"]);
    assert!(conn.rows("authors").is_empty());
}

#[tokio::test]
async fn test_unique_value_moves_between_rows() {
    let model = library();
    let mut conn = MemoryConnection::new(model.clone());
    conn.seed("accounts", &[("id", 1.into()), ("email", "a@x".into()), ("version", 1.into())])
        .unwrap();
    let changes = vec![
        add(2, "accounts")
            .value(PropertyValue::new("id", 2))
            .value(PropertyValue::new("email", "a@x"))
            .value(PropertyValue::new("version", 1)),
        EntryChange::new(1, "accounts", EntityState::Deleted)
            .value(PropertyValue::new("id", 1))
            .value(PropertyValue::new("email", "a@x"))
            .value(PropertyValue::new("version", 1)),
    ];

    store(fast_retry())
        .save_changes(&mut conn, &model, &changes, &mut RecordingTracker::new(), &SaveContext::new())
        .await
        .unwrap();

    let ops: Vec<OperationKind> = conn.journal().iter().map(|e| e.operation).collect();
    assert_eq!(ops, vec![OperationKind::Delete, OperationKind::Insert]);
    assert_eq!(conn.rows("accounts")[0]["id"], ColumnValue::Int(2));
}

#[tokio::test]
async fn test_cycle_fails_before_touching_database() {
    let model = library();
    let mut conn = MemoryConnection::new(model.clone());
    let node = |entity: u64, id: i64, parent: i64| {
        add(entity, "nodes")
            .value(PropertyValue::new("id", id))
            .value(PropertyValue::new("parent_id", parent))
    };
    let changes = vec![node(1, 1, 2), node(2, 2, 1)];

    let err = store(fast_retry())
        .save_changes(&mut conn, &model, &changes, &mut RecordingTracker::new(), &SaveContext::new())
        .await
        .unwrap_err();

    match err {
        SaveError::DependencyCycle { entities } => assert_eq!(entities.len(), 2),
        other => panic!("unexpected error {other:?}"),
    }
    assert_eq!(conn.stats().begins, 0);
}

#[tokio::test]
async fn test_self_reference_is_written_in_two_phases() {
    let model = library();
    let mut conn = MemoryConnection::new(model.clone());
    let mut tracker = RecordingTracker::new();
    let changes = vec![add(1, "nodes")
        .value(PropertyValue::new("id", -1).temporary())
        .value(PropertyValue::new("parent_id", -1))];

    store(fast_retry())
        .save_changes(&mut conn, &model, &changes, &mut tracker, &SaveContext::new())
        .await
        .unwrap();

    let ops: Vec<OperationKind> = conn.journal().iter().map(|e| e.operation).collect();
    assert_eq!(ops, vec![OperationKind::Insert, OperationKind::Update]);
    let row = &conn.rows("nodes")[0];
    assert_eq!(row["parent_id"], row["id"]);
    assert_eq!(tracker.value(1, "parent_id"), Some(&ColumnValue::Int(1)));
}

#[tokio::test]
async fn test_self_reference_rejected_without_two_phase_support() {
    let model = library();
    let mut conn = MemoryConnection::new(model.clone());
    let mut caps = ProviderCapabilities::multi_statement();
    caps.self_reference = SelfReferenceStrategy::Unsupported;
    let changes = vec![add(1, "nodes")
        .value(PropertyValue::new("id", -1).temporary())
        .value(PropertyValue::new("parent_id", -1))];

    let err = Store::new(PgSqlGenerator, caps, fast_retry())
        .save_changes(&mut conn, &model, &changes, &mut RecordingTracker::new(), &SaveContext::new())
        .await
        .unwrap_err();

    assert_eq!(err.code(), "self_reference");
}

#[tokio::test]
async fn test_cancelled_context_never_begins() {
    let model = library();
    let mut conn = MemoryConnection::new(model.clone());
    let ctx = SaveContext::new();
    ctx.cancel_token().cancel();

    let err = store(fast_retry())
        .save_changes(&mut conn, &model, &[author(1, -1, "Ann")], &mut RecordingTracker::new(), &ctx)
        .await
        .unwrap_err();

    assert!(matches!(err, SaveError::Cancelled));
    assert!(matches!(err.status(), SaveStatus::Faulted(_)));
    assert_eq!(conn.stats().begins, 0);
}

#[tokio::test(start_paused = true)]
async fn test_cancellation_aborts_inflight_batch() {
    let model = library();
    let mut conn = MemoryConnection::new(model.clone());
    conn.set_latency(Duration::from_secs(5));
    let ctx = SaveContext::new();
    let token = ctx.cancel_token().clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(10)).await;
        token.cancel();
    });

    let err = store(fast_retry())
        .save_changes(&mut conn, &model, &[author(1, -1, "Ann")], &mut RecordingTracker::new(), &ctx)
        .await
        .unwrap_err();

    assert!(matches!(err, SaveError::Cancelled));
    assert_eq!(conn.stats().rollbacks, 1);
    assert!(!conn.in_transaction());
    assert!(conn.rows("authors").is_empty());
}

#[tokio::test]
async fn test_empty_change_set_skips_transaction() {
    let model = library();
    let mut conn = MemoryConnection::new(model.clone());
    let unchanged = EntryChange::new(1, "books", EntityState::Modified).value(PropertyValue::new("id", 10));

    let summary = store(fast_retry())
        .save_changes(&mut conn, &model, &[unchanged], &mut RecordingTracker::new(), &SaveContext::new())
        .await
        .unwrap();

    assert_eq!(summary.batches, 0);
    assert_eq!(conn.stats().begins, 0);
}

#[tokio::test]
async fn test_missing_key_is_rejected_before_begin() {
    let model = library();
    let mut conn = MemoryConnection::new(model.clone());
    conn.seed("accounts", &[("id", 1.into()), ("email", "a@x".into()), ("version", 5.into())])
        .unwrap();
    let keyless = vec![
        EntryChange::new(1, "accounts", EntityState::Modified)
            .value(PropertyValue::new("email", "b@x").modified_from("a@x")),
        EntryChange::new(2, "accounts", EntityState::Deleted).value(PropertyValue::new("version", 5)),
    ];

    for change in keyless {
        let err = store(fast_retry())
            .save_changes(&mut conn, &model, &[change], &mut RecordingTracker::new(), &SaveContext::new())
            .await
            .unwrap_err();
        assert_eq!(err.code(), "invalid_model");
        assert!(!err.is_recoverable());
    }
    assert_eq!(conn.stats().begins, 0);
    assert_eq!(conn.rows("accounts").len(), 1);
}

#[tokio::test]
async fn test_update_hitting_several_rows_rolls_back() {
    // the mapping keys ledger rows by code, but the table does not enforce it
    let ledger = || {
        TableModel::new("ledger")
            .column(ColumnModel::new("code", "text", ValueKind::Text))
            .column(ColumnModel::new("state", "text", ValueKind::Text))
    };
    let mapped = Model::new(vec![ledger().primary_key(&["code"])]).unwrap();
    let mut conn = MemoryConnection::new(Model::new(vec![ledger()]).unwrap());
    for _ in 0..2 {
        conn.seed("ledger", &[("code", "x".into()), ("state", "open".into())]).unwrap();
    }
    let before = conn.rows("ledger").to_vec();
    let mut tracker = RecordingTracker::new();
    let changes = vec![EntryChange::new(7, "ledger", EntityState::Modified)
        .value(PropertyValue::new("code", "x"))
        .value(PropertyValue::new("state", "closed").modified_from("open"))];

    let err = store(fast_retry())
        .save_changes(&mut conn, &mapped, &changes, &mut tracker, &SaveContext::new())
        .await
        .unwrap_err();

    match &err {
        SaveError::UnexpectedRowCount { at, expected, actual } => {
            assert_eq!(at.entity, EntityRef(7));
            assert_eq!((*expected, *actual), (1, 2));
        }
        other => panic!("unexpected error {other:?}"),
    }
    assert_eq!(err.code(), "unexpected_row_count");
    assert!(matches!(err.status(), SaveStatus::Faulted(_)));
    let stats = conn.stats();
    assert_eq!((stats.begins, stats.rollbacks, stats.commits), (1, 1, 0));
    assert_eq!(conn.rows("ledger"), before.as_slice());
    assert!(tracker.accepted.is_empty());
}

#[tokio::test]
async fn test_entity_with_several_changes_is_accepted_once() {
    let model = library();
    let mut conn = MemoryConnection::new(model.clone());
    conn.seed("authors", &[("id", 1.into()), ("name", "Ann".into())]).unwrap();
    for id in [10, 11] {
        conn.seed("books", &[("id", id.into()), ("author_id", 1.into()), ("title", "old".into())])
            .unwrap();
    }
    let retitle = |entity: u64, id: i64, from: &str, to: &str| {
        EntryChange::new(entity, "books", EntityState::Modified)
            .value(PropertyValue::new("id", id))
            .value(PropertyValue::new("title", to).modified_from(from))
    };
    let changes = vec![
        retitle(1, 10, "old", "draft"),
        retitle(2, 11, "old", "other"),
        retitle(1, 10, "draft", "final"),
    ];
    let mut tracker = RecordingTracker::new();

    store(fast_retry())
        .save_changes(&mut conn, &model, &changes, &mut tracker, &SaveContext::new())
        .await
        .unwrap();

    assert_eq!(tracker.accepted, vec![EntityRef(1), EntityRef(2)]);
    let book = conn.find_row("books", "id", &ColumnValue::Int(10)).unwrap();
    assert_eq!(book["title"], ColumnValue::from("final"));
}

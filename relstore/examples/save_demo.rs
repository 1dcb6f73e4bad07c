// Saves a small change set against the in-memory backend and prints what
// the store did with it.

use relstore::db::{
    ColumnModel, EntityState, EntryChange, Model, PgSqlGenerator, PropertyValue, Store,
    TableModel, ValueGenerated, ValueKind,
};
use relstore::testing::{MemoryConnection, RecordingTracker};
use relstore::{ProviderCapabilities, RetryPolicy, SaveContext};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let blogs = TableModel::new("blogs")
        .column(ColumnModel::new("id", "bigint", ValueKind::Int).generated(ValueGenerated::OnAdd))
        .column(ColumnModel::new("title", "text", ValueKind::Text))
        .primary_key(&["id"]);
    let posts = TableModel::new("posts")
        .column(ColumnModel::new("id", "bigint", ValueKind::Int).generated(ValueGenerated::OnAdd))
        .column(ColumnModel::new("blog_id", "bigint", ValueKind::Int))
        .column(ColumnModel::new("body", "text", ValueKind::Text))
        .primary_key(&["id"])
        .foreign_key("fk_posts_blogs", &["blog_id"], "blogs", &["id"]);
    let model = Model::new(vec![blogs, posts])?;

    // posts listed first; they still go after the blog they point at
    let changes = vec![
        EntryChange::new(2, "posts", EntityState::Added)
            .value(PropertyValue::new("id", -2).temporary())
            .value(PropertyValue::new("blog_id", -1))
            .value(PropertyValue::new("body", "hello")),
        EntryChange::new(1, "blogs", EntityState::Added)
            .value(PropertyValue::new("id", -1).temporary())
            .value(PropertyValue::new("title", "notes")),
    ];

    let store = Store::new(PgSqlGenerator, ProviderCapabilities::multi_statement(), RetryPolicy::default());
    for (ix, batch) in store.preparer().prepare(&changes, &model)?.iter().enumerate() {
        println!("-- batch {ix}\n{}", batch.command_text());
    }

    let mut conn = MemoryConnection::new(model.clone());
    let mut tracker = RecordingTracker::new();
    let summary = store
        .save_changes(&mut conn, &model, &changes, &mut tracker, &SaveContext::new())
        .await?;

    println!("{summary:?}");
    for value in &tracker.values {
        println!("{}.{} = {}", value.entity, value.column, value.value);
    }
    Ok(())
}

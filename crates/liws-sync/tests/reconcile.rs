mod common;

use common::*;
use liws_core::{FieldValue, Params, SqlType};
use liws_storage::{SqliteStore, Store};
use liws_sync::{reconcile, ReconcileOutcome};
use serde_json::json;

const AUDIENCE: (&str, &str) = ("libinsight_inst_audience", "audience");
const TOPICS: (&str, &str) = ("libinsight_inst_topics_covered", "topics_covered");

#[tokio::test]
async fn audience_values_follow_the_latest_record() {
    let store = SqliteStore::in_memory().await.unwrap();
    let adapter = instruction_outreach();
    adapter.ensure_schema(&store).await.unwrap();

    let first = record(json!({
        "_id": 42,
        "_start_date": "2023-09-01",
        "_entered_by": "jdoe",
        "Audience": ["Faculty", "Staff"],
    }));
    assert_eq!(
        reconcile(adapter.as_ref(), &store, &first).await,
        ReconcileOutcome::Inserted
    );

    let rows = store
        .query(
            "SELECT record_id, entered_by FROM libinsight_inst_records",
            &Params::new(),
        )
        .await
        .unwrap();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0][0].as_i64(), Some(42));
    assert_eq!(rows[0][1].as_text(), Some("jdoe"));
    assert_eq!(
        child_values(&store, AUDIENCE.0, AUDIENCE.1, 42).await,
        vec!["Faculty", "Staff"]
    );

    let second = record(json!({
        "_id": 42,
        "_start_date": "2023-09-01",
        "_entered_by": "jdoe",
        "Audience": ["Faculty"],
    }));
    assert_eq!(
        reconcile(adapter.as_ref(), &store, &second).await,
        ReconcileOutcome::Updated
    );
    assert_eq!(
        child_values(&store, AUDIENCE.0, AUDIENCE.1, 42).await,
        vec!["Faculty"]
    );
    assert_eq!(count(&store, "libinsight_inst_records").await, 1);
}

#[tokio::test]
async fn reconciling_twice_leaves_no_duplicates() {
    let store = SqliteStore::in_memory().await.unwrap();
    let adapter = instruction_outreach();
    adapter.ensure_schema(&store).await.unwrap();

    let raw = record(json!({
        "_id": 7,
        "_start_date": "2024-02-01 10:30:00",
        "_entered_by": "asmith",
        "Event Name (if a class, search for course title and number  here) ": "Intro to Zotero",
        "Number of Participants": 18,
        "Audience": ["Graduate", "graduate", "Faculty"],
        "Tools discussed": ["Zotero"],
    }));
    reconcile(adapter.as_ref(), &store, &raw).await;
    reconcile(adapter.as_ref(), &store, &raw).await;

    assert_eq!(count(&store, "libinsight_inst_records").await, 1);
    assert_eq!(
        child_values(&store, AUDIENCE.0, AUDIENCE.1, 7).await,
        vec!["Faculty", "Graduate"]
    );
    assert_eq!(
        child_values(&store, "libinsight_inst_tools_discussed", "tools_discussed", 7).await,
        vec!["Zotero"]
    );
    let rows = store
        .query(
            "SELECT event_name, number_of_participants FROM libinsight_inst_records",
            &Params::new(),
        )
        .await
        .unwrap();
    assert_eq!(rows[0][0].as_text(), Some("Intro to Zotero"));
    assert_eq!(rows[0][1].as_i64(), Some(18));
}

#[tokio::test]
async fn reordered_or_recased_values_cause_no_child_writes() {
    let store = RecordingStore::new().await;
    let adapter = instruction_outreach();
    adapter.ensure_schema(&store).await.unwrap();

    let first = record(json!({
        "_id": 5,
        "_start_date": "2023-10-10",
        "_entered_by": "jdoe",
        "Audience": ["Faculty", "Staff"],
        "Topics covered": ["Citation"],
    }));
    reconcile(adapter.as_ref(), &store, &first).await;
    store.clear();

    let reordered = record(json!({
        "_id": 5,
        "_start_date": "2023-10-10",
        "_entered_by": "jdoe",
        "Audience": ["staff", "Faculty"],
        "Topics covered": ["CITATION"],
    }));
    assert_eq!(
        reconcile(adapter.as_ref(), &store, &reordered).await,
        ReconcileOutcome::Updated
    );

    let executed = store.executed();
    assert_eq!(executed.len(), 1, "only the main row update: {executed:?}");
    assert!(executed[0].starts_with("UPDATE libinsight_inst_records"));
}

#[tokio::test]
async fn removing_one_value_touches_only_that_field() {
    let store = SqliteStore::in_memory().await.unwrap();
    let adapter = instruction_outreach();
    adapter.ensure_schema(&store).await.unwrap();

    let base = json!({
        "_id": 11,
        "_start_date": "2023-11-02",
        "_entered_by": "jdoe",
        "Audience": ["Alumni", "Faculty", "Staff"],
        "Topics covered": ["Databases", "Plagiarism"],
    });
    reconcile(adapter.as_ref(), &store, &record(base.clone())).await;

    let mut trimmed = base;
    trimmed["Audience"] = json!(["Alumni", "Staff"]);
    reconcile(adapter.as_ref(), &store, &record(trimmed)).await;

    assert_eq!(
        child_values(&store, AUDIENCE.0, AUDIENCE.1, 11).await,
        vec!["Alumni", "Staff"]
    );
    assert_eq!(
        child_values(&store, TOPICS.0, TOPICS.1, 11).await,
        vec!["Databases", "Plagiarism"]
    );
}

#[tokio::test]
async fn records_without_an_integer_id_are_skipped_untouched() {
    let store = RecordingStore::new().await;
    let adapter = instruction_outreach();
    adapter.ensure_schema(&store).await.unwrap();
    store.clear();

    for raw in [
        json!({"_start_date": "2023-09-01", "_entered_by": "jdoe", "Audience": ["Faculty"]}),
        json!({"_id": "", "_start_date": "2023-09-01", "_entered_by": "jdoe"}),
        json!({"_id": 4.5, "_start_date": "2023-09-01", "_entered_by": "jdoe"}),
    ] {
        let outcome = reconcile(adapter.as_ref(), &store, &record(raw)).await;
        assert_eq!(outcome, ReconcileOutcome::Skipped("missing identifier".into()));
    }
    assert!(store.executed().is_empty());
    assert_eq!(count(&store, "libinsight_inst_records").await, 0);
}

#[tokio::test]
async fn string_identifiers_are_accepted() {
    let store = SqliteStore::in_memory().await.unwrap();
    let adapter = instruction_outreach();
    adapter.ensure_schema(&store).await.unwrap();

    let raw = record(json!({"_id": "77", "_start_date": "2023-09-01", "_entered_by": "jdoe"}));
    assert_eq!(
        reconcile(adapter.as_ref(), &store, &raw).await,
        ReconcileOutcome::Inserted
    );
}

#[tokio::test]
async fn store_errors_become_failed_outcomes() {
    let store = SqliteStore::in_memory().await.unwrap();
    let adapter = instruction_outreach();
    adapter.ensure_schema(&store).await.unwrap();

    let no_start = record(json!({"_id": 3, "_entered_by": "jdoe"}));
    let outcome = reconcile(adapter.as_ref(), &store, &no_start).await;
    assert!(matches!(outcome, ReconcileOutcome::Failed(ref msg) if msg.contains("NOT NULL")));
    assert_eq!(count(&store, "libinsight_inst_records").await, 0);
}

#[tokio::test]
async fn gate_counts_insert_then_update_the_measure() {
    let store = SqliteStore::in_memory().await.unwrap();
    let adapter = gate_counts();
    assert_eq!(
        adapter.ensure_schema(&store).await.unwrap(),
        vec!["libinsight_gate_counts"]
    );

    let first = record(json!({"date": "2024-01-05 09:00:00", "gate_name": "Main", "count": 3}));
    assert_eq!(
        reconcile(adapter.as_ref(), &store, &first).await,
        ReconcileOutcome::Inserted
    );
    let other_gate =
        record(json!({"date": "2024-01-05 09:00:00", "gate_name": "Side", "count": 1}));
    assert_eq!(
        reconcile(adapter.as_ref(), &store, &other_gate).await,
        ReconcileOutcome::Inserted
    );

    let recount = record(json!({"date": "2024-01-05 09:00:00", "gate_name": "Main", "count": 7}));
    assert_eq!(
        reconcile(adapter.as_ref(), &store, &recount).await,
        ReconcileOutcome::Updated
    );

    let rows = store
        .query(
            "SELECT location, visits FROM libinsight_gate_counts ORDER BY location",
            &Params::new(),
        )
        .await
        .unwrap();
    assert_eq!(rows.len(), 2);
    assert_eq!(rows[0][0].as_text(), Some("Main"));
    assert_eq!(rows[0][1].as_i64(), Some(7));
    assert_eq!(rows[1][1].as_i64(), Some(1));

    let no_gate = record(json!({"date": "2024-01-05 09:00:00", "count": 2}));
    assert_eq!(
        reconcile(adapter.as_ref(), &store, &no_gate).await,
        ReconcileOutcome::Skipped("missing gate_name".into())
    );
}

#[tokio::test]
async fn ensure_schema_is_idempotent() {
    let store = SqliteStore::in_memory().await.unwrap();
    let adapter = instruction_outreach();

    let created = adapter.ensure_schema(&store).await.unwrap();
    assert_eq!(created.len(), 7);
    assert_eq!(created[0], "libinsight_inst_records");
    assert!(adapter.ensure_schema(&store).await.unwrap().is_empty());
}

#[tokio::test]
async fn stale_duplicate_child_rows_are_rewritten() {
    let store = SqliteStore::in_memory().await.unwrap();
    let adapter = instruction_outreach();
    adapter.ensure_schema(&store).await.unwrap();

    let raw = record(json!({
        "_id": 11,
        "_start_date": "2023-10-02",
        "_entered_by": "jdoe",
        "Audience": ["Faculty"],
    }));
    reconcile(adapter.as_ref(), &store, &raw).await;
    store
        .execute(
            "INSERT INTO libinsight_inst_audience (record_id, audience) VALUES (:record_id, :audience)",
            &id_params(11).with("audience", SqlType::Text, FieldValue::Text("Faculty".into())),
        )
        .await
        .unwrap();
    assert_eq!(
        child_values(&store, AUDIENCE.0, AUDIENCE.1, 11).await,
        vec!["Faculty", "Faculty"]
    );

    assert_eq!(
        reconcile(adapter.as_ref(), &store, &raw).await,
        ReconcileOutcome::Updated
    );
    assert_eq!(
        child_values(&store, AUDIENCE.0, AUDIENCE.1, 11).await,
        vec!["Faculty"]
    );
}

#[tokio::test]
async fn head_counts_insert_then_update_in_place() {
    let store = SqliteStore::in_memory().await.unwrap();
    let adapter = hill_head_counts();
    assert_eq!(
        adapter.ensure_schema(&store).await.unwrap(),
        vec!["libinsight_hill_headcounts"]
    );

    let first = record(json!({
        "_id": 5001,
        "_start_date": "2024-03-05 14:00:00",
        "_entered_by": "desk",
        "Floor": ["2"],
        "Time of Head Count": ["2pm"],
        "Number of Patrons": 14,
        "Date and Time for Desk Interactions": "2024-03-05 14:00:00",
    }));
    assert_eq!(
        reconcile(adapter.as_ref(), &store, &first).await,
        ReconcileOutcome::Inserted
    );

    let recount = record(json!({
        "_id": 5001,
        "_start_date": "2024-03-05 14:00:00",
        "_entered_by": "desk",
        "Floor": ["3"],
        "Time of Head Count": ["2pm"],
        "Number of Patrons": 21,
        "Date and Time for Desk Interactions": "2024-03-05 14:15:00",
    }));
    assert_eq!(
        reconcile(adapter.as_ref(), &store, &recount).await,
        ReconcileOutcome::Updated
    );

    assert_eq!(count(&store, "libinsight_hill_headcounts").await, 1);
    let rows = store
        .query(
            "SELECT floor, time_of_head_count FROM libinsight_hill_headcounts WHERE record_id = :record_id",
            &id_params(5001),
        )
        .await
        .unwrap();
    assert_eq!(rows[0][0].as_text(), Some("3"));
    assert_eq!(rows[0][1].as_text(), Some("2pm"));

    let updated = store
        .query(
            "SELECT COUNT(*) FROM libinsight_hill_headcounts \
             WHERE number_of_patrons = 21 AND desk_interaction_date_time IS NOT NULL",
            &Params::new(),
        )
        .await
        .unwrap();
    assert_eq!(updated[0][0].as_i64(), Some(1));
    assert!(store
        .table_names("libinsight_hill_headcounts%")
        .await
        .unwrap()
        .iter()
        .all(|table| table == "libinsight_hill_headcounts"));
}

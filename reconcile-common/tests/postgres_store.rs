use std::sync::Arc;

use chrono::{TimeZone, Utc};
use reconcile_common::matcher::MatchFilter;
use reconcile_common::reconciler::Reconciler;
use reconcile_common::record::{Identity, StoredEntity};
use reconcile_common::store::{DocumentStore, EntityFilter, PgStore, StoreError, WriteOp};
use serde_json::json;
use sqlx::PgPool;
use tokio::time::{Duration, Instant};

fn entity(id: &str, name: &str, email: &str, phone: Option<&str>) -> StoredEntity {
    StoredEntity {
        id: id.to_owned(),
        identity: Identity::new(Some(name), Some(email), phone),
        attributes: json!({"city": "NYC", "age": 30})
            .as_object()
            .unwrap()
            .clone(),
        inserted_at: Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap(),
    }
}

fn deadline() -> Instant {
    Instant::now() + Duration::from_secs(5)
}

#[sqlx::test(migrations = "./migrations")]
#[ignore = "requires DATABASE_URL"]
async fn upsert_and_merge(db: PgPool) {
    let store = PgStore::new(db);

    let result = store
        .bulk_write(
            &[
                WriteOp::Upsert(entity("1", "A", "a@x.com", None)),
                WriteOp::Merge {
                    id: "1".to_owned(),
                    identity: Identity::new(None, None, Some("555")),
                    attributes: json!({"city": "LA"}).as_object().unwrap().clone(),
                },
                WriteOp::Merge {
                    id: "missing".to_owned(),
                    identity: Identity::default(),
                    attributes: Default::default(),
                },
            ],
            deadline(),
        )
        .await
        .unwrap();

    assert_eq!(result.applied(), 2);
    assert_eq!(
        result.outcomes[2],
        Err(StoreError::NotFound("missing".to_owned()))
    );

    let all = store.find_all().await.unwrap();
    assert_eq!(all.len(), 1);
    assert_eq!(
        all[0].identity,
        Identity::new(Some("A"), Some("a@x.com"), Some("555"))
    );
    assert_eq!(all[0].attributes.get("city"), Some(&json!("LA")));
    assert_eq!(all[0].attributes.get("age"), Some(&json!(30)));
}

#[sqlx::test(migrations = "./migrations")]
#[ignore = "requires DATABASE_URL"]
async fn upsert_keeps_inserted_at(db: PgPool) {
    let store = PgStore::new(db);
    let first = entity("1", "A", "a@x.com", None);
    let mut replay = first.clone();
    replay.inserted_at = Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 0).unwrap();

    store
        .bulk_write(&[WriteOp::Upsert(first.clone())], deadline())
        .await
        .unwrap();
    store
        .bulk_write(&[WriteOp::Upsert(replay)], deadline())
        .await
        .unwrap();

    let all = store.find_all().await.unwrap();
    assert_eq!(all, vec![first]);
}

#[sqlx::test(migrations = "./migrations")]
#[ignore = "requires DATABASE_URL"]
async fn find_matching_applies_both_predicates(db: PgPool) {
    let store = PgStore::new(db);
    store
        .bulk_write(
            &[
                WriteOp::Upsert(entity("1", "A", "a@x.com", Some("1"))),
                WriteOp::Upsert(entity("2", "B", "a@x.com", Some("2"))),
                WriteOp::Upsert(entity("3", "C", "c@x.com", Some("2"))),
            ],
            deadline(),
        )
        .await
        .unwrap();

    let by_name = MatchFilter::for_identity(&Identity::new(Some("A"), Some("a@x.com"), Some("9")))
        .unwrap();
    let ids: Vec<String> = store
        .find_matching(&by_name)
        .await
        .unwrap()
        .into_iter()
        .map(|e| e.id)
        .collect();
    assert_eq!(ids, vec!["1"]);

    let by_email = MatchFilter::for_identity(&Identity::new(None, Some("a@x.com"), None)).unwrap();
    assert_eq!(store.find_matching(&by_email).await.unwrap().len(), 2);
}

#[sqlx::test(migrations = "./migrations")]
#[ignore = "requires DATABASE_URL"]
async fn find_by_fields_filters_attributes(db: PgPool) {
    let store = PgStore::new(db);
    let mut other = entity("2", "B", "b@x.com", None);
    other.attributes.remove("city");
    store
        .bulk_write(
            &[
                WriteOp::Upsert(entity("1", "A", "a@x.com", None)),
                WriteOp::Upsert(other),
            ],
            deadline(),
        )
        .await
        .unwrap();

    let filter = |fields: serde_json::Value| EntityFilter::from_fields(fields.as_object().unwrap());

    let found = store
        .find_by_fields(&filter(json!({"city": "NYC", "age": 30})))
        .await
        .unwrap();
    assert_eq!(found.len(), 1);
    assert_eq!(found[0].id, "1");

    let found = store
        .find_by_fields(&filter(json!({"city": null})))
        .await
        .unwrap();
    assert_eq!(found.len(), 1);
    assert_eq!(found[0].id, "2");

    let found = store
        .find_by_fields(&filter(json!({"phone": null, "name": "B"})))
        .await
        .unwrap();
    assert_eq!(found.len(), 1);
}

#[sqlx::test(migrations = "./migrations")]
#[ignore = "requires DATABASE_URL"]
async fn reconciles_against_postgres(db: PgPool) {
    let reconciler = Reconciler::new(Arc::new(PgStore::new(db)), Duration::from_secs(5));
    let batch = vec![json!({"Name": "A", "Email": "a@x.com", "City": "NYC"})
        .as_object()
        .unwrap()
        .clone()];

    let first = reconciler.reconcile(batch.clone()).await.unwrap();
    let second = reconciler.reconcile(batch).await.unwrap();

    assert_eq!(first.inserted, 1);
    assert_eq!(second.updated, 1);
    assert_eq!(reconciler.store().find_all().await.unwrap().len(), 1);
}

#[sqlx::test(migrations = "./migrations")]
#[ignore = "requires DATABASE_URL"]
async fn mixed_batch_reports_each_operation(db: PgPool) {
    let store = PgStore::new(db);
    store
        .bulk_write(&[WriteOp::Upsert(entity("0", "Z", "z@x.com", None))], deadline())
        .await
        .unwrap();

    let merge = |id: &str, identity: Identity, attributes: serde_json::Value| WriteOp::Merge {
        id: id.to_owned(),
        identity,
        attributes: attributes.as_object().unwrap().clone(),
    };

    let result = store
        .bulk_write(
            &[
                WriteOp::Upsert(entity("1", "A", "a@x.com", None)),
                merge("0", Identity::new(None, None, Some("555")), json!({"city": "LA"})),
                merge("1", Identity::default(), json!({"vip": true})),
                merge("missing", Identity::default(), json!({"city": "SF"})),
                merge("1", Identity::new(Some("A2"), None, None), json!({"vip": false})),
                WriteOp::Upsert(entity("2", "B", "b@x.com", None)),
            ],
            deadline(),
        )
        .await
        .unwrap();

    assert_eq!(
        result.outcomes,
        vec![
            Ok(()),
            Ok(()),
            Ok(()),
            Err(StoreError::NotFound("missing".to_owned())),
            Ok(()),
            Ok(()),
        ]
    );

    let all = store.find_all().await.unwrap();
    assert_eq!(all.len(), 3);
    let by_id = |id: &str| all.iter().find(|e| e.id == id).unwrap().clone();

    let zero = by_id("0");
    assert_eq!(zero.identity, Identity::new(Some("Z"), Some("z@x.com"), Some("555")));
    assert_eq!(zero.attributes.get("city"), Some(&json!("LA")));
    assert_eq!(zero.attributes.get("age"), Some(&json!(30)));

    let one = by_id("1");
    assert_eq!(one.identity.name.as_deref(), Some("A2"));
    assert_eq!(one.attributes.get("vip"), Some(&json!(false)));
    assert_eq!(one.attributes.get("city"), Some(&json!("NYC")));
}

#[sqlx::test(migrations = "./migrations")]
#[ignore = "requires DATABASE_URL"]
async fn merge_before_upsert_of_same_id_keeps_order(db: PgPool) {
    let store = PgStore::new(db);
    store
        .bulk_write(&[WriteOp::Upsert(entity("1", "A", "a@x.com", None))], deadline())
        .await
        .unwrap();

    let mut replacement = entity("1", "B", "b@x.com", None);
    replacement.attributes = json!({"fresh": 1}).as_object().unwrap().clone();
    let result = store
        .bulk_write(
            &[
                WriteOp::Merge {
                    id: "1".to_owned(),
                    identity: Identity::default(),
                    attributes: json!({"stale": 1}).as_object().unwrap().clone(),
                },
                WriteOp::Upsert(replacement),
            ],
            deadline(),
        )
        .await
        .unwrap();

    assert_eq!(result.applied(), 2);
    let all = store.find_all().await.unwrap();
    assert_eq!(all[0].identity.name.as_deref(), Some("B"));
    assert_eq!(all[0].attributes, json!({"fresh": 1}).as_object().unwrap().clone());
}

#[sqlx::test(migrations = "./migrations")]
#[ignore = "requires DATABASE_URL"]
async fn large_batch_fits_one_deadline(db: PgPool) {
    let store = PgStore::new(db);
    let inserts: Vec<WriteOp> = (0..5_000)
        .map(|i| WriteOp::Upsert(entity(&i.to_string(), "A", &format!("{i}@x.com"), None)))
        .collect();
    let merges: Vec<WriteOp> = (0..5_000)
        .map(|i| WriteOp::Merge {
            id: i.to_string(),
            identity: Identity::default(),
            attributes: json!({"city": "LA"}).as_object().unwrap().clone(),
        })
        .collect();

    let result = store
        .bulk_write(&[inserts, merges].concat(), Instant::now() + Duration::from_secs(2))
        .await
        .unwrap();

    assert_eq!(result.applied(), 10_000);
    let moved = store
        .find_by_fields(&EntityFilter::from_fields(json!({"city": "LA"}).as_object().unwrap()))
        .await
        .unwrap();
    assert_eq!(moved.len(), 5_000);
}

use spanner_crm::db::{self, batches, companies, contacts, segments, users, Paging, Pool};
use spanner_crm::dedup::detect_company_duplicates_tx;
use spanner_crm::ingest::{process_company_csv, process_contact_csv, ContactScope, Upload};
use spanner_crm::model::{BatchStatus, CompanyProfile, CompanyStatus, ContactStatus, Role};
use spanner_crm::AppError;
use uuid::Uuid;

async fn setup_pool() -> Pool {
    let pool = db::init_memory_pool().await.unwrap();
    db::run_migrations(&pool).await.unwrap();
    pool
}

async fn seed(pool: &Pool) -> (Uuid, Uuid) {
    let mut tx = pool.begin().await.unwrap();
    let user = users::create_user_tx(
        &mut tx,
        users::NewUser {
            email: "researcher@example.com",
            name: "Researcher",
            password_hash: "not-a-hash",
            roles: &[Role::Researcher],
        },
    )
    .await
    .unwrap();
    let segment = segments::create_tx(
        &mut tx,
        &segments::SegmentInput {
            name: "Fintech EU".into(),
            description: Some("banks and payment processors".into()),
            research_filter_requirements: "HQ in the EU".into(),
            offering_ids: vec![],
        },
        user.user.id,
    )
    .await
    .unwrap();
    tx.commit().await.unwrap();
    (user.user.id, segment.id)
}

fn upload<'a>(bytes: &'a [u8], user: Uuid) -> Upload<'a> {
    Upload {
        file_name: "rows.csv",
        bytes,
        uploaded_by: user,
        report_prefix: "/api/v1",
    }
}

async fn companies_by_rowid(pool: &Pool, segment: Uuid) -> Vec<(String, bool)> {
    sqlx::query_as(
        "SELECT company_name, is_duplicate FROM companies WHERE segment_id = ? ORDER BY rowid",
    )
    .bind(segment)
    .fetch_all(pool)
    .await
    .unwrap()
}

#[tokio::test]
async fn acme_upload_flags_the_later_duplicate() {
    let pool = setup_pool().await;
    let (user, segment) = seed(&pool).await;
    let csv = b"company_name,company_website\nAcme,acme.com\nGlobex,globex.com\nAcme,acme.com\n";

    let outcome = process_company_csv(&pool, upload(csv, user), segment)
        .await
        .unwrap();
    assert_eq!(outcome.batch.total_rows, 3);
    assert_eq!(outcome.batch.valid_rows, 3);
    assert_eq!(outcome.batch.invalid_rows, 0);
    assert_eq!(outcome.batch.status, BatchStatus::Completed);
    assert!(outcome.batch.error_report_url.is_none());
    assert_eq!(outcome.duplicates_marked, 1);

    let rows = companies_by_rowid(&pool, segment).await;
    assert_eq!(
        rows,
        vec![
            ("Acme".to_string(), false),
            ("Globex".to_string(), false),
            ("Acme".to_string(), true),
        ]
    );

    let pending = companies::pending_queue(&pool, Some(segment), Paging::default())
        .await
        .unwrap();
    assert_eq!(pending.total, 3);
    assert!(pending.items.iter().all(|c| c.status == CompanyStatus::Pending));
    assert!(pending.items.iter().all(|c| c.batch_id == Some(outcome.batch.id)));
}

#[tokio::test]
async fn detection_is_idempotent() {
    let pool = setup_pool().await;
    let (user, segment) = seed(&pool).await;
    let csv = b"company_name,company_website\nAcme,acme.com\n ACME , Acme.com \nNoSite,\nnosite,\n";
    let outcome = process_company_csv(&pool, upload(csv, user), segment)
        .await
        .unwrap();
    assert_eq!(outcome.duplicates_marked, 2);

    let mut tx = pool.begin().await.unwrap();
    let again = detect_company_duplicates_tx(&mut tx, segment).await.unwrap();
    tx.commit().await.unwrap();
    assert_eq!(again, 0);

    let flags: Vec<bool> = companies_by_rowid(&pool, segment)
        .await
        .into_iter()
        .map(|(_, dup)| dup)
        .collect();
    assert_eq!(flags, vec![false, true, false, true]);
}

#[tokio::test]
async fn invalid_rows_are_reported_in_order_and_persisted() {
    let pool = setup_pool().await;
    let (user, segment) = seed(&pool).await;
    let csv = b"company_name,founded_year,unknown_column\n,1999,x\nGood Co,1990,y\nOld Co,1200,z\nBad Year,abc,\n";

    let outcome = process_company_csv(&pool, upload(csv, user), segment)
        .await
        .unwrap();
    let batch = &outcome.batch;
    assert_eq!(batch.total_rows, 4);
    assert_eq!(batch.total_rows, batch.valid_rows + batch.invalid_rows);
    assert_eq!(batch.valid_rows, 1);
    assert_eq!(batch.status, BatchStatus::Failed);
    assert_eq!(
        batch.error_report_url.as_deref(),
        Some(format!("/api/v1/uploads/{}/errors", batch.id).as_str())
    );

    let rows: Vec<(i64, &str)> = outcome
        .errors
        .iter()
        .map(|e| (e.row_number, e.field.as_str()))
        .collect();
    assert_eq!(
        rows,
        vec![(1, "company_name"), (3, "founded_year"), (4, "founded_year")]
    );

    let stored = batches::errors_for(&pool, batch.id).await.unwrap();
    assert_eq!(stored, outcome.errors);
}

#[tokio::test]
async fn rejects_unreadable_files_before_creating_a_batch() {
    let pool = setup_pool().await;
    let (user, segment) = seed(&pool).await;

    let err = process_company_csv(&pool, upload(b"company_name\n\xff\xfe\n", user), segment)
        .await
        .unwrap_err();
    assert!(matches!(err, AppError::InvalidInput(_)));

    let listed = batches::list(&pool, &Default::default(), Paging::default())
        .await
        .unwrap();
    assert_eq!(listed.total, 0);
}

#[tokio::test]
async fn contacts_resolve_companies_by_name_within_the_segment() {
    let pool = setup_pool().await;
    let (user, segment) = seed(&pool).await;
    let mut tx = pool.begin().await.unwrap();
    let acme = companies::create_tx(
        &mut tx,
        CompanyProfile {
            company_name: "Acme".into(),
            ..Default::default()
        },
        segment,
        user,
    )
    .await
    .unwrap();
    tx.commit().await.unwrap();

    let csv = b"company_name,first_name,last_name,email\n\
acme,Wile,Coyote,wile@acme.com\n\
Nowhere Inc,Road,Runner,road@nowhere.com\n\
ACME,Wile,Coyote,WILE@acme.com\n\
,No,Company,nobody@example.com\n";
    let outcome = process_contact_csv(&pool, upload(csv, user), ContactScope::Segment(segment))
        .await
        .unwrap();
    assert_eq!(outcome.batch.valid_rows, 2);
    assert_eq!(outcome.batch.invalid_rows, 2);
    assert_eq!(outcome.duplicates_marked, 1);
    let failed: Vec<(i64, &str)> = outcome
        .errors
        .iter()
        .map(|e| (e.row_number, e.field.as_str()))
        .collect();
    assert_eq!(failed, vec![(2, "company_name"), (4, "company_name")]);

    let filter = contacts::ContactFilter {
        company_id: Some(acme.id),
        ..Default::default()
    };
    let listed = contacts::list(&pool, &filter, Paging::default()).await.unwrap();
    assert_eq!(listed.total, 2);
    assert!(listed
        .items
        .iter()
        .all(|c| c.status == ContactStatus::Uploaded && c.segment_id == segment));
    assert_eq!(listed.items.iter().filter(|c| c.is_duplicate).count(), 1);

    // no company was created on the fly
    let all = companies::list(&pool, &Default::default(), Paging::default())
        .await
        .unwrap();
    assert_eq!(all.total, 1);
}

#[tokio::test]
async fn contacts_for_an_explicit_company_skip_the_name_lookup() {
    let pool = setup_pool().await;
    let (user, segment) = seed(&pool).await;
    let mut tx = pool.begin().await.unwrap();
    let company = companies::create_tx(
        &mut tx,
        CompanyProfile {
            company_name: "Initech".into(),
            ..Default::default()
        },
        segment,
        user,
    )
    .await
    .unwrap();
    tx.commit().await.unwrap();

    let csv = b"first_name,last_name,email\nPeter,Gibbons,peter@initech.com\nMilton,,not-an-email\n";
    let scope = ContactScope::from_ids(Some(company.id), Some(segment)).unwrap();
    let outcome = process_contact_csv(&pool, upload(csv, user), scope).await.unwrap();
    assert_eq!(outcome.batch.valid_rows, 1);
    let fields: Vec<&str> = outcome.errors.iter().map(|e| e.field.as_str()).collect();
    assert_eq!(fields, vec!["last_name", "email"]);
    assert!(outcome.errors.iter().all(|e| e.row_number == 2));
}

#[tokio::test]
async fn contact_uploads_into_an_archived_segment_are_rejected() {
    let pool = setup_pool().await;
    let (user, segment) = seed(&pool).await;
    let mut tx = pool.begin().await.unwrap();
    let company = companies::create_tx(
        &mut tx,
        CompanyProfile {
            company_name: "Initech".into(),
            ..Default::default()
        },
        segment,
        user,
    )
    .await
    .unwrap();
    segments::archive_tx(&mut tx, segment).await.unwrap();
    tx.commit().await.unwrap();

    let csv = b"first_name,last_name,email\nPeter,Gibbons,peter@initech.com\n";
    for scope in [
        ContactScope::from_ids(Some(company.id), None).unwrap(),
        ContactScope::Segment(segment),
    ] {
        let err = process_contact_csv(&pool, upload(csv, user), scope)
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::InvalidInput(_)), "{err:?}");
    }

    let listed = batches::list(&pool, &Default::default(), Paging::default())
        .await
        .unwrap();
    assert_eq!(listed.total, 0);
}

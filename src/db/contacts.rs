use chrono::Utc;
use serde::Deserialize;
use serde_json::json;
use sqlx::{QueryBuilder, Sqlite, Transaction};
use tracing::{info, instrument};
use uuid::Uuid;

use super::notifications::{notify_tx, NewNotification};
use super::{audit, companies, like_pattern, users, ListPage, Paging, Pool};
use crate::error::{AppError, Result};
use crate::model::{Contact, ContactProfile, ContactStatus, EntityRef, NotificationKind};
use crate::pipeline::ContactTransition;
use crate::validate::{into_app_error, normalize_contact, validate_contact, ContactPatch};

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ContactFilter {
    pub company_id: Option<Uuid>,
    pub segment_id: Option<Uuid>,
    pub status: Option<ContactStatus>,
    pub search: Option<String>,
    pub assigned_sdr_id: Option<Uuid>,
    pub is_duplicate: Option<bool>,
}

/// Inserts an uploaded contact without uniqueness checks.
pub async fn insert_tx(
    tx: &mut Transaction<'_, Sqlite>,
    profile: &ContactProfile,
    company_id: Uuid,
    segment_id: Uuid,
    batch_id: Option<Uuid>,
    created_by: Uuid,
) -> Result<Contact> {
    let now = Utc::now();
    let contact = sqlx::query_as::<_, Contact>(
        "INSERT INTO contacts (id, first_name, last_name, email, mobile_phone, job_title, \
         direct_phone_number, email_address_2, email_active_status, lead_source_global, \
         management_level, street, city, state_province, country_region, zip_postal_code, \
         primary_time_zone, contact_linkedin_url, linkedin_summary, data_requester_details, \
         company_id, segment_id, status, is_duplicate, batch_id, created_by, created_at, updated_at) \
         VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, 0, ?, ?, ?, ?) \
         RETURNING *",
    )
    .bind(Uuid::new_v4())
    .bind(&profile.first_name)
    .bind(&profile.last_name)
    .bind(&profile.email)
    .bind(&profile.mobile_phone)
    .bind(&profile.job_title)
    .bind(&profile.direct_phone_number)
    .bind(&profile.email_address_2)
    .bind(&profile.email_active_status)
    .bind(&profile.lead_source_global)
    .bind(&profile.management_level)
    .bind(&profile.street)
    .bind(&profile.city)
    .bind(&profile.state_province)
    .bind(&profile.country_region)
    .bind(&profile.zip_postal_code)
    .bind(&profile.primary_time_zone)
    .bind(&profile.contact_linkedin_url)
    .bind(&profile.linkedin_summary)
    .bind(&profile.data_requester_details)
    .bind(company_id)
    .bind(segment_id)
    .bind(ContactStatus::Uploaded)
    .bind(batch_id)
    .bind(created_by)
    .bind(now)
    .bind(now)
    .fetch_one(&mut **tx)
    .await?;
    Ok(contact)
}

pub async fn email_taken_tx(
    tx: &mut Transaction<'_, Sqlite>,
    company_id: Uuid,
    email: &str,
    exclude: Option<Uuid>,
) -> Result<bool> {
    let found: Option<i64> = sqlx::query_scalar(
        "SELECT 1 FROM contacts WHERE company_id = ? AND lower(trim(email)) = lower(trim(?)) \
         AND (? IS NULL OR id <> ?) LIMIT 1",
    )
    .bind(company_id)
    .bind(email)
    .bind(exclude)
    .bind(exclude)
    .fetch_optional(&mut **tx)
    .await?;
    Ok(found.is_some())
}

/// Creates a contact under `company_id`; the segment is taken from the company.
#[instrument(skip_all, fields(company_id = %company_id))]
pub async fn create_tx(
    tx: &mut Transaction<'_, Sqlite>,
    mut profile: ContactProfile,
    company_id: Uuid,
    actor: Uuid,
) -> Result<Contact> {
    normalize_contact(&mut profile);
    validate_contact(&profile).map_err(into_app_error)?;
    let company = companies::get_tx(tx, company_id).await?;
    if email_taken_tx(tx, company_id, &profile.email, None).await? {
        return Err(AppError::Conflict(
            "a contact with this email already exists for the company".into(),
        ));
    }
    let contact = insert_tx(tx, &profile, company_id, company.segment_id, None, actor).await?;
    audit::record_tx(
        tx,
        Some(actor),
        "contact.create",
        EntityRef::Contact(contact.id),
        json!({ "email": contact.profile.email, "company_id": company_id }),
    )
    .await?;
    info!(contact_id = %contact.id, "contact created");
    Ok(contact)
}

pub async fn get(pool: &Pool, id: Uuid) -> Result<Contact> {
    sqlx::query_as::<_, Contact>("SELECT * FROM contacts WHERE id = ?")
        .bind(id)
        .fetch_optional(pool)
        .await?
        .ok_or(AppError::NotFound("contact"))
}

pub async fn get_tx(tx: &mut Transaction<'_, Sqlite>, id: Uuid) -> Result<Contact> {
    sqlx::query_as::<_, Contact>("SELECT * FROM contacts WHERE id = ?")
        .bind(id)
        .fetch_optional(&mut **tx)
        .await?
        .ok_or(AppError::NotFound("contact"))
}

pub(crate) fn push_filters(qb: &mut QueryBuilder<'_, Sqlite>, f: &ContactFilter) {
    qb.push(" WHERE 1 = 1");
    if let Some(company_id) = f.company_id {
        qb.push(" AND company_id = ").push_bind(company_id);
    }
    if let Some(segment_id) = f.segment_id {
        qb.push(" AND segment_id = ").push_bind(segment_id);
    }
    if let Some(status) = f.status {
        qb.push(" AND status = ").push_bind(status);
    }
    if let Some(sdr) = f.assigned_sdr_id {
        qb.push(" AND assigned_sdr_id = ").push_bind(sdr);
    }
    if let Some(dup) = f.is_duplicate {
        qb.push(" AND is_duplicate = ").push_bind(dup);
    }
    if let Some(term) = f.search.as_deref().filter(|s| !s.trim().is_empty()) {
        let pattern = like_pattern(term);
        qb.push(" AND (first_name LIKE ")
            .push_bind(pattern.clone())
            .push(" ESCAPE '\\' OR last_name LIKE ")
            .push_bind(pattern.clone())
            .push(" ESCAPE '\\' OR email LIKE ")
            .push_bind(pattern)
            .push(" ESCAPE '\\')");
    }
}

pub async fn list(pool: &Pool, filter: &ContactFilter, paging: Paging) -> Result<ListPage<Contact>> {
    let mut count = QueryBuilder::<Sqlite>::new("SELECT COUNT(*) FROM contacts");
    push_filters(&mut count, filter);
    let total: i64 = count.build_query_scalar().fetch_one(pool).await?;

    let mut qb = QueryBuilder::<Sqlite>::new("SELECT * FROM contacts");
    push_filters(&mut qb, filter);
    qb.push(" ORDER BY created_at DESC, rowid DESC LIMIT ")
        .push_bind(paging.limit())
        .push(" OFFSET ")
        .push_bind(paging.skip());
    let items = qb.build_query_as::<Contact>().fetch_all(pool).await?;
    Ok(ListPage::new(items, total, paging))
}

#[instrument(skip_all, fields(contact_id = %id))]
pub async fn update_profile_tx(
    tx: &mut Transaction<'_, Sqlite>,
    id: Uuid,
    patch: ContactPatch,
    actor: Uuid,
) -> Result<Contact> {
    let current = get_tx(tx, id).await?;
    let mut profile = current.profile.clone();
    patch.apply(&mut profile);
    normalize_contact(&mut profile);
    validate_contact(&profile).map_err(into_app_error)?;
    if email_taken_tx(tx, current.company_id, &profile.email, Some(id)).await? {
        return Err(AppError::Conflict(
            "a contact with this email already exists for the company".into(),
        ));
    }
    let contact = sqlx::query_as::<_, Contact>(
        "UPDATE contacts SET first_name = ?, last_name = ?, email = ?, mobile_phone = ?, \
         job_title = ?, direct_phone_number = ?, email_address_2 = ?, email_active_status = ?, \
         lead_source_global = ?, management_level = ?, street = ?, city = ?, state_province = ?, \
         country_region = ?, zip_postal_code = ?, primary_time_zone = ?, contact_linkedin_url = ?, \
         linkedin_summary = ?, data_requester_details = ?, updated_at = ? WHERE id = ? RETURNING *",
    )
    .bind(&profile.first_name)
    .bind(&profile.last_name)
    .bind(&profile.email)
    .bind(&profile.mobile_phone)
    .bind(&profile.job_title)
    .bind(&profile.direct_phone_number)
    .bind(&profile.email_address_2)
    .bind(&profile.email_active_status)
    .bind(&profile.lead_source_global)
    .bind(&profile.management_level)
    .bind(&profile.street)
    .bind(&profile.city)
    .bind(&profile.state_province)
    .bind(&profile.country_region)
    .bind(&profile.zip_postal_code)
    .bind(&profile.primary_time_zone)
    .bind(&profile.contact_linkedin_url)
    .bind(&profile.linkedin_summary)
    .bind(&profile.data_requester_details)
    .bind(Utc::now())
    .bind(id)
    .fetch_one(&mut **tx)
    .await?;
    audit::record_tx(
        tx,
        Some(actor),
        "contact.update",
        EntityRef::Contact(id),
        serde_json::to_value(&contact.profile).unwrap_or_default(),
    )
    .await?;
    Ok(contact)
}

/// Moves a contact one step along the pipeline.
///
/// The `UPDATE` is the first statement of the step: the expected status, and
/// for assignment the SDR's role and activity, are part of its predicate. A
/// miss is then classified as not found, an invalid transition or a bad SDR.
#[instrument(skip_all, fields(contact_id = %id, to = %transition.target()))]
pub async fn transition_tx(
    tx: &mut Transaction<'_, Sqlite>,
    id: Uuid,
    transition: ContactTransition,
    actor: Uuid,
) -> Result<Contact> {
    let now = Utc::now();
    let mut qb = QueryBuilder::<Sqlite>::new("UPDATE contacts SET status = ");
    qb.push_bind(transition.target());
    match transition {
        ContactTransition::Approve => {
            qb.push(", approved_by = ")
                .push_bind(actor)
                .push(", approved_at = ")
                .push_bind(now);
        }
        ContactTransition::AssignToSdr { sdr_id } => {
            qb.push(", assigned_sdr_id = ").push_bind(sdr_id);
        }
        ContactTransition::ScheduleMeeting => {}
    }
    qb.push(", updated_at = ")
        .push_bind(now)
        .push(" WHERE id = ")
        .push_bind(id)
        .push(" AND status = ")
        .push_bind(transition.required_status());
    if let ContactTransition::AssignToSdr { sdr_id } = transition {
        qb.push(
            " AND EXISTS (SELECT 1 FROM users u JOIN user_roles r ON r.user_id = u.id \
             WHERE u.id = ",
        )
        .push_bind(sdr_id)
        .push(" AND u.status = 'active' AND r.role = 'sdr')");
    }
    qb.push(" RETURNING *");
    let updated = qb
        .build_query_as::<Contact>()
        .fetch_optional(&mut **tx)
        .await?;

    let contact = match updated {
        Some(c) => c,
        None => {
            let current = get_tx(tx, id).await?;
            transition.check(current.status)?;
            if let ContactTransition::AssignToSdr { sdr_id } = transition {
                if !users::is_active_sdr_tx(tx, sdr_id).await? {
                    return Err(AppError::invalid(
                        "assigned user must be an active user with the sdr role",
                    ));
                }
            }
            return Err(AppError::Internal(anyhow::anyhow!(
                "contact {id} matched no row in status {}",
                current.status
            )));
        }
    };

    let details = match transition {
        ContactTransition::AssignToSdr { sdr_id } => {
            json!({ "status": contact.status, "sdr_id": sdr_id })
        }
        _ => json!({ "status": contact.status }),
    };
    audit::record_tx(tx, Some(actor), transition.action(), EntityRef::Contact(id), details).await?;

    if let ContactTransition::AssignToSdr { sdr_id } = transition {
        notify_tx(
            tx,
            NewNotification {
                user_id: sdr_id,
                actor_id: Some(actor),
                kind: NotificationKind::ContactAssigned,
                title: "Contact assigned",
                message: format!(
                    "{} {} ({}) was assigned to you",
                    contact.profile.first_name, contact.profile.last_name, contact.profile.email
                ),
                entity: Some(EntityRef::Contact(id)),
            },
        )
        .await?;
    }
    info!("contact transitioned");
    Ok(contact)
}

/// Assigns every contact or none.
pub async fn bulk_assign_tx(
    tx: &mut Transaction<'_, Sqlite>,
    ids: &[Uuid],
    sdr_id: Uuid,
    actor: Uuid,
) -> Result<Vec<Contact>> {
    if ids.is_empty() {
        return Err(AppError::invalid("contact_ids must not be empty"));
    }
    let mut out = Vec::with_capacity(ids.len());
    for id in ids {
        if out.iter().any(|c: &Contact| c.id == *id) {
            continue;
        }
        let contact =
            transition_tx(tx, *id, ContactTransition::AssignToSdr { sdr_id }, actor).await?;
        out.push(contact);
    }
    Ok(out)
}

pub async fn set_duplicate_tx(
    tx: &mut Transaction<'_, Sqlite>,
    id: Uuid,
    is_duplicate: bool,
    actor: Uuid,
) -> Result<Contact> {
    let contact = sqlx::query_as::<_, Contact>(
        "UPDATE contacts SET is_duplicate = ?, updated_at = ? WHERE id = ? RETURNING *",
    )
    .bind(is_duplicate)
    .bind(Utc::now())
    .bind(id)
    .fetch_optional(&mut **tx)
    .await?
    .ok_or(AppError::NotFound("contact"))?;
    audit::record_tx(
        tx,
        Some(actor),
        "contact.mark_duplicate",
        EntityRef::Contact(id),
        json!({ "is_duplicate": is_duplicate }),
    )
    .await?;
    Ok(contact)
}

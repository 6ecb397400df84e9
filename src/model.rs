use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::types::Json;
use std::fmt;
use uuid::Uuid;

/// Declares a string-backed enum stored as TEXT and serialized in snake_case.
macro_rules! text_enum {
    ($(#[$meta:meta])* $name:ident { $($variant:ident => $text:literal),+ $(,)? }) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
        #[serde(rename_all = "snake_case")]
        #[sqlx(rename_all = "snake_case")]
        pub enum $name {
            $($variant),+
        }

        impl $name {
            pub const ALL: &'static [$name] = &[$($name::$variant),+];

            pub fn as_str(&self) -> &'static str {
                match self {
                    $($name::$variant => $text),+
                }
            }

            pub fn parse(s: &str) -> Option<Self> {
                match s {
                    $($text => Some($name::$variant),)+
                    _ => None,
                }
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }
    };
}

text_enum!(Role {
    Admin => "admin",
    SegmentOwner => "segment_owner",
    Researcher => "researcher",
    Approver => "approver",
    Sdr => "sdr",
    Marketing => "marketing",
});

text_enum!(UserStatus {
    Active => "active",
    Deactivated => "deactivated",
});

text_enum!(SegmentStatus {
    Active => "active",
    Archived => "archived",
});

text_enum!(OfferingStatus {
    Active => "active",
    Inactive => "inactive",
});

text_enum!(
    /// Company approval pipeline: `pending -> approved | rejected`.
    CompanyStatus {
        Pending => "pending",
        Approved => "approved",
        Rejected => "rejected",
    }
);

text_enum!(
    /// Contact pipeline, strictly ordered:
    /// `uploaded -> approved -> assigned_to_sdr -> meeting_scheduled`.
    ContactStatus {
        Uploaded => "uploaded",
        Approved => "approved",
        AssignedToSdr => "assigned_to_sdr",
        MeetingScheduled => "meeting_scheduled",
    }
);

text_enum!(UploadType {
    Company => "company",
    Contact => "contact",
});

text_enum!(BatchStatus {
    Processing => "processing",
    Completed => "completed",
    Failed => "failed",
});

text_enum!(EntityKind {
    Segment => "segment",
    Offering => "offering",
    Company => "company",
    Contact => "contact",
    User => "user",
});

text_enum!(
    /// What a piece of marketing collateral is attached to; `lead` is a contact.
    CollateralScope {
        Segment => "segment",
        Offering => "offering",
        Lead => "lead",
    }
);

text_enum!(NotificationKind {
    CompanyDecided => "company_decided",
    ContactAssigned => "contact_assigned",
    AssignmentCreated => "assignment_created",
});

impl ContactStatus {
    /// Position in the pipeline; statuses never move to a lower rank.
    pub fn rank(&self) -> u8 {
        match self {
            ContactStatus::Uploaded => 0,
            ContactStatus::Approved => 1,
            ContactStatus::AssignedToSdr => 2,
            ContactStatus::MeetingScheduled => 3,
        }
    }
}

impl BatchStatus {
    pub fn from_counts(invalid_rows: i64) -> Self {
        if invalid_rows == 0 {
            BatchStatus::Completed
        } else {
            BatchStatus::Failed
        }
    }
}

/// Typed reference to one of the tables a polymorphic row can point at.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "entity_type", content = "entity_id", rename_all = "snake_case")]
pub enum EntityRef {
    Segment(Uuid),
    Offering(Uuid),
    Company(Uuid),
    Contact(Uuid),
    User(Uuid),
}

impl EntityRef {
    pub fn new(kind: EntityKind, id: Uuid) -> Self {
        match kind {
            EntityKind::Segment => EntityRef::Segment(id),
            EntityKind::Offering => EntityRef::Offering(id),
            EntityKind::Company => EntityRef::Company(id),
            EntityKind::Contact => EntityRef::Contact(id),
            EntityKind::User => EntityRef::User(id),
        }
    }

    pub fn kind(&self) -> EntityKind {
        match self {
            EntityRef::Segment(_) => EntityKind::Segment,
            EntityRef::Offering(_) => EntityKind::Offering,
            EntityRef::Company(_) => EntityKind::Company,
            EntityRef::Contact(_) => EntityKind::Contact,
            EntityRef::User(_) => EntityKind::User,
        }
    }

    pub fn id(&self) -> Uuid {
        match self {
            EntityRef::Segment(id)
            | EntityRef::Offering(id)
            | EntityRef::Company(id)
            | EntityRef::Contact(id)
            | EntityRef::User(id) => *id,
        }
    }
}

impl CollateralScope {
    pub fn entity(&self, id: Uuid) -> EntityRef {
        match self {
            CollateralScope::Segment => EntityRef::Segment(id),
            CollateralScope::Offering => EntityRef::Offering(id),
            CollateralScope::Lead => EntityRef::Contact(id),
        }
    }
}

impl fmt::Display for EntityRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.kind(), self.id())
    }
}

#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct User {
    pub id: Uuid,
    pub email: String,
    pub name: String,
    #[serde(skip_serializing)]
    pub password_hash: String,
    pub status: UserStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// User joined with the roles it holds.
#[derive(Debug, Clone, Serialize)]
pub struct UserWithRoles {
    #[serde(flatten)]
    pub user: User,
    pub roles: Vec<Role>,
}

impl UserWithRoles {
    pub fn has_role(&self, role: Role) -> bool {
        self.roles.contains(&role)
    }

    pub fn is_active(&self) -> bool {
        self.user.status == UserStatus::Active
    }
}

#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct Segment {
    pub id: Uuid,
    pub name: String,
    pub description: Option<String>,
    pub research_filter_requirements: String,
    pub status: SegmentStatus,
    pub created_by: Uuid,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct Offering {
    pub id: Uuid,
    pub name: String,
    pub description: Option<String>,
    pub status: OfferingStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, Default, Serialize, sqlx::FromRow)]
pub struct SegmentStats {
    pub company_count: i64,
    pub pending_company_count: i64,
    pub contact_count: i64,
}

/// Editable company attributes; also the recognized company CSV columns.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, sqlx::FromRow)]
pub struct CompanyProfile {
    pub company_name: String,
    pub company_website: Option<String>,
    pub company_phone: Option<String>,
    pub company_description: Option<String>,
    pub company_linkedin_url: Option<String>,
    pub company_industry: Option<String>,
    pub company_sub_industry: Option<String>,
    pub street: Option<String>,
    pub city: Option<String>,
    pub state_province: Option<String>,
    pub country_region: Option<String>,
    pub zip_postal_code: Option<String>,
    pub founded_year: Option<i32>,
    pub revenue_range: Option<String>,
    pub employee_size_range: Option<String>,
}

impl CompanyProfile {
    pub const COLUMNS: &'static [&'static str] = &[
        "company_name",
        "company_website",
        "company_phone",
        "company_description",
        "company_linkedin_url",
        "company_industry",
        "company_sub_industry",
        "street",
        "city",
        "state_province",
        "country_region",
        "zip_postal_code",
        "founded_year",
        "revenue_range",
        "employee_size_range",
    ];
}

#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct Company {
    pub id: Uuid,
    #[sqlx(flatten)]
    #[serde(flatten)]
    pub profile: CompanyProfile,
    pub segment_id: Uuid,
    pub status: CompanyStatus,
    pub rejection_reason: Option<String>,
    pub is_duplicate: bool,
    pub batch_id: Option<Uuid>,
    pub created_by: Uuid,
    pub approved_by: Option<Uuid>,
    pub approved_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Editable contact attributes; also the recognized contact CSV columns.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, sqlx::FromRow)]
pub struct ContactProfile {
    pub first_name: String,
    pub last_name: String,
    pub email: String,
    pub mobile_phone: Option<String>,
    pub job_title: Option<String>,
    pub direct_phone_number: Option<String>,
    pub email_address_2: Option<String>,
    pub email_active_status: Option<String>,
    pub lead_source_global: Option<String>,
    pub management_level: Option<String>,
    pub street: Option<String>,
    pub city: Option<String>,
    pub state_province: Option<String>,
    pub country_region: Option<String>,
    pub zip_postal_code: Option<String>,
    pub primary_time_zone: Option<String>,
    pub contact_linkedin_url: Option<String>,
    pub linkedin_summary: Option<String>,
    pub data_requester_details: Option<String>,
}

impl ContactProfile {
    pub const COLUMNS: &'static [&'static str] = &[
        "first_name",
        "last_name",
        "email",
        "mobile_phone",
        "job_title",
        "direct_phone_number",
        "email_address_2",
        "email_active_status",
        "lead_source_global",
        "management_level",
        "street",
        "city",
        "state_province",
        "country_region",
        "zip_postal_code",
        "primary_time_zone",
        "contact_linkedin_url",
        "linkedin_summary",
        "data_requester_details",
    ];
}

#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct Contact {
    pub id: Uuid,
    #[sqlx(flatten)]
    #[serde(flatten)]
    pub profile: ContactProfile,
    pub company_id: Uuid,
    pub segment_id: Uuid,
    pub status: ContactStatus,
    pub assigned_sdr_id: Option<Uuid>,
    pub is_duplicate: bool,
    pub batch_id: Option<Uuid>,
    pub created_by: Uuid,
    pub approved_by: Option<Uuid>,
    pub approved_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct UploadBatch {
    pub id: Uuid,
    pub upload_type: UploadType,
    pub file_name: String,
    pub file_size_bytes: i64,
    pub total_rows: i64,
    pub valid_rows: i64,
    pub invalid_rows: i64,
    pub status: BatchStatus,
    pub error_report_url: Option<String>,
    pub uploaded_by: Uuid,
    pub created_at: DateTime<Utc>,
}

/// One rejected CSV row field.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, sqlx::FromRow)]
pub struct RowError {
    pub row_number: i64,
    pub field: String,
    pub message: String,
}

#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct Assignment {
    pub id: Uuid,
    pub entity_type: EntityKind,
    pub entity_id: Uuid,
    pub assigned_to: Uuid,
    pub assigned_by: Uuid,
    pub created_at: DateTime<Utc>,
}

impl Assignment {
    pub fn entity(&self) -> EntityRef {
        EntityRef::new(self.entity_type, self.entity_id)
    }
}

/// A link to marketing material, scoped to a segment, offering or lead.
#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct MarketingCollateral {
    pub id: Uuid,
    pub title: String,
    pub url: String,
    pub description: Option<String>,
    pub scope_type: CollateralScope,
    pub scope_id: Uuid,
    pub segment_id: Option<Uuid>,
    pub offering_id: Option<Uuid>,
    pub created_by: Uuid,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl MarketingCollateral {
    pub fn scope(&self) -> EntityRef {
        self.scope_type.entity(self.scope_id)
    }
}

#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct AuditLog {
    pub id: Uuid,
    pub actor_id: Option<Uuid>,
    pub action: String,
    pub entity_type: EntityKind,
    pub entity_id: Uuid,
    pub details: Option<Json<serde_json::Value>>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct Notification {
    pub id: Uuid,
    pub user_id: Uuid,
    pub actor_id: Option<Uuid>,
    pub kind: NotificationKind,
    pub title: String,
    pub message: String,
    pub entity_type: Option<EntityKind>,
    pub entity_id: Option<Uuid>,
    pub is_read: bool,
    pub created_at: DateTime<Utc>,
}

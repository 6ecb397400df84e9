//! Input normalization and schema checks shared by the JSON endpoints and
//! CSV ingestion.

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::error::AppError;
use crate::model::{CompanyProfile, ContactProfile};

static EMAIL_RE: Lazy<Option<Regex>> = Lazy::new(|| {
    Regex::new(r"^[A-Za-z0-9.!#$%&'*+/=?^_`{|}~-]+@[A-Za-z0-9](?:[A-Za-z0-9-]*[A-Za-z0-9])?(?:\.[A-Za-z0-9](?:[A-Za-z0-9-]*[A-Za-z0-9])?)+$").ok()
});

const FOUNDED_YEAR_RANGE: std::ops::RangeInclusive<i32> = 1800..=2100;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FieldError {
    pub field: String,
    pub message: String,
}

impl FieldError {
    fn new(field: &str, message: impl Into<String>) -> Self {
        Self {
            field: field.to_string(),
            message: message.into(),
        }
    }
}

/// Joins field errors into a single request-level message.
pub fn into_app_error(errors: Vec<FieldError>) -> AppError {
    let msg = errors
        .iter()
        .map(|e| format!("{}: {}", e.field, e.message))
        .collect::<Vec<_>>()
        .join("; ");
    AppError::InvalidInput(msg)
}

pub fn is_valid_email(s: &str) -> bool {
    s.len() <= 320 && EMAIL_RE.as_ref().is_some_and(|re| re.is_match(s))
}

fn clean(value: &mut Option<String>) {
    if let Some(v) = value.take() {
        let t = v.trim();
        if !t.is_empty() {
            *value = Some(t.to_string());
        }
    }
}

struct Checker {
    errors: Vec<FieldError>,
}

impl Checker {
    fn new() -> Self {
        Self { errors: Vec::new() }
    }

    fn required(&mut self, field: &str, value: &str, max: usize) {
        if value.is_empty() {
            self.errors.push(FieldError::new(field, "field is required"));
        } else {
            self.max_len(field, Some(value), max);
        }
    }

    fn max_len(&mut self, field: &str, value: Option<&str>, max: usize) {
        if let Some(v) = value {
            if v.chars().count() > max {
                self.errors
                    .push(FieldError::new(field, format!("must be at most {max} characters")));
            }
        }
    }

    fn email(&mut self, field: &str, value: Option<&str>) {
        if let Some(v) = value {
            if !v.is_empty() && !is_valid_email(v) {
                self.errors
                    .push(FieldError::new(field, "value is not a valid email address"));
            }
        }
    }

    fn finish(self) -> Result<(), Vec<FieldError>> {
        if self.errors.is_empty() {
            Ok(())
        } else {
            Err(self.errors)
        }
    }
}

/// Trims every text field and turns blanks into `None`.
pub fn normalize_company(p: &mut CompanyProfile) {
    p.company_name = p.company_name.trim().to_string();
    for v in [
        &mut p.company_website,
        &mut p.company_phone,
        &mut p.company_description,
        &mut p.company_linkedin_url,
        &mut p.company_industry,
        &mut p.company_sub_industry,
        &mut p.street,
        &mut p.city,
        &mut p.state_province,
        &mut p.country_region,
        &mut p.zip_postal_code,
        &mut p.revenue_range,
        &mut p.employee_size_range,
    ] {
        clean(v);
    }
}

pub fn validate_company(p: &CompanyProfile) -> Result<(), Vec<FieldError>> {
    let mut c = Checker::new();
    c.required("company_name", &p.company_name, 500);
    c.max_len("company_website", p.company_website.as_deref(), 2048);
    c.max_len("company_phone", p.company_phone.as_deref(), 50);
    c.max_len("company_description", p.company_description.as_deref(), 5000);
    c.max_len("company_linkedin_url", p.company_linkedin_url.as_deref(), 2048);
    c.max_len("company_industry", p.company_industry.as_deref(), 200);
    c.max_len("company_sub_industry", p.company_sub_industry.as_deref(), 200);
    c.max_len("street", p.street.as_deref(), 500);
    c.max_len("city", p.city.as_deref(), 200);
    c.max_len("state_province", p.state_province.as_deref(), 200);
    c.max_len("country_region", p.country_region.as_deref(), 200);
    c.max_len("zip_postal_code", p.zip_postal_code.as_deref(), 50);
    c.max_len("revenue_range", p.revenue_range.as_deref(), 200);
    c.max_len("employee_size_range", p.employee_size_range.as_deref(), 200);
    if let Some(year) = p.founded_year {
        if !FOUNDED_YEAR_RANGE.contains(&year) {
            c.errors
                .push(FieldError::new("founded_year", "must be between 1800 and 2100"));
        }
    }
    c.finish()
}

pub fn normalize_contact(p: &mut ContactProfile) {
    p.first_name = p.first_name.trim().to_string();
    p.last_name = p.last_name.trim().to_string();
    p.email = p.email.trim().to_string();
    for v in [
        &mut p.mobile_phone,
        &mut p.job_title,
        &mut p.direct_phone_number,
        &mut p.email_address_2,
        &mut p.email_active_status,
        &mut p.lead_source_global,
        &mut p.management_level,
        &mut p.street,
        &mut p.city,
        &mut p.state_province,
        &mut p.country_region,
        &mut p.zip_postal_code,
        &mut p.primary_time_zone,
        &mut p.contact_linkedin_url,
        &mut p.linkedin_summary,
        &mut p.data_requester_details,
    ] {
        clean(v);
    }
}

pub fn validate_contact(p: &ContactProfile) -> Result<(), Vec<FieldError>> {
    let mut c = Checker::new();
    c.required("first_name", &p.first_name, 200);
    c.required("last_name", &p.last_name, 200);
    if p.email.is_empty() {
        c.errors.push(FieldError::new("email", "field is required"));
    } else {
        c.email("email", Some(&p.email));
    }
    c.max_len("mobile_phone", p.mobile_phone.as_deref(), 50);
    c.max_len("job_title", p.job_title.as_deref(), 500);
    c.max_len("direct_phone_number", p.direct_phone_number.as_deref(), 50);
    c.email("email_address_2", p.email_address_2.as_deref());
    c.max_len("email_active_status", p.email_active_status.as_deref(), 100);
    c.max_len("lead_source_global", p.lead_source_global.as_deref(), 200);
    c.max_len("management_level", p.management_level.as_deref(), 200);
    c.max_len("street", p.street.as_deref(), 500);
    c.max_len("city", p.city.as_deref(), 200);
    c.max_len("state_province", p.state_province.as_deref(), 200);
    c.max_len("country_region", p.country_region.as_deref(), 200);
    c.max_len("zip_postal_code", p.zip_postal_code.as_deref(), 50);
    c.max_len("primary_time_zone", p.primary_time_zone.as_deref(), 100);
    c.max_len("contact_linkedin_url", p.contact_linkedin_url.as_deref(), 2048);
    c.max_len("linkedin_summary", p.linkedin_summary.as_deref(), 5000);
    c.max_len("data_requester_details", p.data_requester_details.as_deref(), 500);
    c.finish()
}

/// One CSV data row projected onto an allowlist of columns.
/// Values are trimmed and blank cells are dropped.
pub struct CsvRow<'a> {
    cells: HashMap<&'a str, &'a str>,
}

impl<'a> CsvRow<'a> {
    pub fn project(headers: &'a csv::StringRecord, record: &'a csv::StringRecord, allow: &[&str]) -> Self {
        let cells = headers
            .iter()
            .zip(record.iter())
            .map(|(h, v)| (h.trim(), v.trim()))
            .filter(|(h, v)| !v.is_empty() && allow.contains(h))
            .collect();
        Self { cells }
    }

    pub fn get(&self, column: &str) -> Option<&'a str> {
        self.cells.get(column).copied()
    }

    fn owned(&self, column: &str) -> Option<String> {
        self.get(column).map(str::to_string)
    }
}

pub fn company_from_row(row: &CsvRow<'_>) -> Result<CompanyProfile, Vec<FieldError>> {
    let mut errors = Vec::new();
    let founded_year = match row.get("founded_year") {
        None => None,
        Some(v) => match v.parse::<i32>() {
            Ok(y) => Some(y),
            Err(_) => {
                errors.push(FieldError::new("founded_year", "must be a whole number"));
                None
            }
        },
    };
    let profile = CompanyProfile {
        company_name: row.owned("company_name").unwrap_or_default(),
        company_website: row.owned("company_website"),
        company_phone: row.owned("company_phone"),
        company_description: row.owned("company_description"),
        company_linkedin_url: row.owned("company_linkedin_url"),
        company_industry: row.owned("company_industry"),
        company_sub_industry: row.owned("company_sub_industry"),
        street: row.owned("street"),
        city: row.owned("city"),
        state_province: row.owned("state_province"),
        country_region: row.owned("country_region"),
        zip_postal_code: row.owned("zip_postal_code"),
        founded_year,
        revenue_range: row.owned("revenue_range"),
        employee_size_range: row.owned("employee_size_range"),
    };
    if let Err(mut more) = validate_company(&profile) {
        errors.append(&mut more);
    }
    if errors.is_empty() {
        Ok(profile)
    } else {
        Err(errors)
    }
}

pub fn contact_from_row(row: &CsvRow<'_>) -> Result<ContactProfile, Vec<FieldError>> {
    let profile = ContactProfile {
        first_name: row.owned("first_name").unwrap_or_default(),
        last_name: row.owned("last_name").unwrap_or_default(),
        email: row.owned("email").unwrap_or_default(),
        mobile_phone: row.owned("mobile_phone"),
        job_title: row.owned("job_title"),
        direct_phone_number: row.owned("direct_phone_number"),
        email_address_2: row.owned("email_address_2"),
        email_active_status: row.owned("email_active_status"),
        lead_source_global: row.owned("lead_source_global"),
        management_level: row.owned("management_level"),
        street: row.owned("street"),
        city: row.owned("city"),
        state_province: row.owned("state_province"),
        country_region: row.owned("country_region"),
        zip_postal_code: row.owned("zip_postal_code"),
        primary_time_zone: row.owned("primary_time_zone"),
        contact_linkedin_url: row.owned("contact_linkedin_url"),
        linkedin_summary: row.owned("linkedin_summary"),
        data_requester_details: row.owned("data_requester_details"),
    };
    validate_contact(&profile)?;
    Ok(profile)
}

/// Partial company update; absent fields keep their value.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct CompanyPatch {
    pub company_name: Option<String>,
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

macro_rules! patch_fields {
    ($patch:ident, $target:ident; required: $($req:ident),*; optional: $($opt:ident),*) => {
        $(if let Some(v) = $patch.$req { $target.$req = v; })*
        $(if $patch.$opt.is_some() { $target.$opt = $patch.$opt; })*
    };
}

impl CompanyPatch {
    pub fn apply(self, p: &mut CompanyProfile) {
        patch_fields!(self, p;
            required: company_name;
            optional: company_website, company_phone, company_description,
                company_linkedin_url, company_industry, company_sub_industry, street, city,
                state_province, country_region, zip_postal_code, founded_year, revenue_range,
                employee_size_range);
    }
}

/// Partial contact update; absent fields keep their value.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ContactPatch {
    pub first_name: Option<String>,
    pub last_name: Option<String>,
    pub email: Option<String>,
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

impl ContactPatch {
    pub fn apply(self, p: &mut ContactProfile) {
        patch_fields!(self, p;
            required: first_name, last_name, email;
            optional: mobile_phone, job_title, direct_phone_number, email_address_2,
                email_active_status, lead_source_global, management_level, street, city,
                state_province, country_region, zip_postal_code, primary_time_zone,
                contact_linkedin_url, linkedin_summary, data_requester_details);
    }
}

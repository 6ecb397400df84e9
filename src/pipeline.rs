//! Status pipeline rules for companies and contacts.
//!
//! Everything here is pure: callers pair the expected `from` status with a
//! conditional `UPDATE ... WHERE status = ?` so the check and the write happen
//! in one statement.

use serde::Deserialize;
use thiserror::Error;
use uuid::Uuid;

use crate::model::{CompanyStatus, ContactStatus};

#[derive(Debug, Error, PartialEq, Eq)]
pub enum PipelineError {
    #[error("cannot move {entity} from '{from}' to '{to}'")]
    InvalidTransition {
        entity: &'static str,
        from: String,
        to: String,
    },
    #[error("{0}")]
    InvalidInput(String),
}

/// Raw body of a company approval request.
#[derive(Debug, Clone, Deserialize)]
pub struct CompanyDecisionRequest {
    pub status: String,
    #[serde(default)]
    pub rejection_reason: Option<String>,
}

/// Validated outcome for a pending company.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CompanyDecision {
    Approve,
    Reject { reason: String },
}

impl CompanyDecision {
    pub fn target(&self) -> CompanyStatus {
        match self {
            CompanyDecision::Approve => CompanyStatus::Approved,
            CompanyDecision::Reject { .. } => CompanyStatus::Rejected,
        }
    }

    pub fn rejection_reason(&self) -> Option<&str> {
        match self {
            CompanyDecision::Approve => None,
            CompanyDecision::Reject { reason } => Some(reason),
        }
    }
}

impl TryFrom<CompanyDecisionRequest> for CompanyDecision {
    type Error = PipelineError;

    fn try_from(req: CompanyDecisionRequest) -> Result<Self, Self::Error> {
        let reason = req
            .rejection_reason
            .map(|r| r.trim().to_string())
            .filter(|r| !r.is_empty());
        match (CompanyStatus::parse(req.status.trim()), reason) {
            (Some(CompanyStatus::Approved), None) => Ok(CompanyDecision::Approve),
            (Some(CompanyStatus::Approved), Some(_)) => Err(PipelineError::InvalidInput(
                "rejection_reason must be empty when approving".into(),
            )),
            (Some(CompanyStatus::Rejected), Some(reason)) => Ok(CompanyDecision::Reject { reason }),
            (Some(CompanyStatus::Rejected), None) => Err(PipelineError::InvalidInput(
                "rejection_reason is required when rejecting".into(),
            )),
            _ => Err(PipelineError::InvalidInput(
                "status must be 'approved' or 'rejected'".into(),
            )),
        }
    }
}

/// Only pending companies can be decided.
pub fn check_company_transition(
    current: CompanyStatus,
    decision: &CompanyDecision,
) -> Result<(), PipelineError> {
    if current == CompanyStatus::Pending {
        Ok(())
    } else {
        Err(PipelineError::InvalidTransition {
            entity: "company",
            from: current.to_string(),
            to: decision.target().to_string(),
        })
    }
}

/// A forward move along the contact pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContactTransition {
    Approve,
    AssignToSdr { sdr_id: Uuid },
    ScheduleMeeting,
}

impl ContactTransition {
    /// Builds an assignment, rejecting a missing SDR id.
    pub fn assign(sdr_id: Option<Uuid>) -> Result<Self, PipelineError> {
        sdr_id
            .map(|sdr_id| ContactTransition::AssignToSdr { sdr_id })
            .ok_or_else(|| PipelineError::InvalidInput("sdr_id is required".into()))
    }

    pub fn required_status(&self) -> ContactStatus {
        match self {
            ContactTransition::Approve => ContactStatus::Uploaded,
            ContactTransition::AssignToSdr { .. } => ContactStatus::Approved,
            ContactTransition::ScheduleMeeting => ContactStatus::AssignedToSdr,
        }
    }

    pub fn target(&self) -> ContactStatus {
        match self {
            ContactTransition::Approve => ContactStatus::Approved,
            ContactTransition::AssignToSdr { .. } => ContactStatus::AssignedToSdr,
            ContactTransition::ScheduleMeeting => ContactStatus::MeetingScheduled,
        }
    }

    pub fn action(&self) -> &'static str {
        match self {
            ContactTransition::Approve => "contact.approve",
            ContactTransition::AssignToSdr { .. } => "contact.assign_sdr",
            ContactTransition::ScheduleMeeting => "contact.meeting_scheduled",
        }
    }

    pub fn check(&self, current: ContactStatus) -> Result<(), PipelineError> {
        if current == self.required_status() {
            Ok(())
        } else {
            Err(PipelineError::InvalidTransition {
                entity: "contact",
                from: current.to_string(),
                to: self.target().to_string(),
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn req(status: &str, reason: Option<&str>) -> CompanyDecisionRequest {
        CompanyDecisionRequest {
            status: status.into(),
            rejection_reason: reason.map(str::to_string),
        }
    }

    #[test]
    fn decision_requires_reason_iff_rejected() {
        assert_eq!(
            CompanyDecision::try_from(req("approved", None)),
            Ok(CompanyDecision::Approve)
        );
        assert_eq!(
            CompanyDecision::try_from(req("rejected", Some(" Out of ICP "))),
            Ok(CompanyDecision::Reject {
                reason: "Out of ICP".into()
            })
        );
        assert!(matches!(
            CompanyDecision::try_from(req("rejected", None)),
            Err(PipelineError::InvalidInput(_))
        ));
        assert!(matches!(
            CompanyDecision::try_from(req("rejected", Some("   "))),
            Err(PipelineError::InvalidInput(_))
        ));
        assert!(matches!(
            CompanyDecision::try_from(req("approved", Some("nope"))),
            Err(PipelineError::InvalidInput(_))
        ));
    }

    #[test]
    fn decision_rejects_other_statuses() {
        for s in ["pending", "archived", ""] {
            assert!(matches!(
                CompanyDecision::try_from(req(s, None)),
                Err(PipelineError::InvalidInput(_))
            ));
        }
    }

    #[test]
    fn only_pending_companies_can_be_decided() {
        let d = CompanyDecision::Approve;
        assert!(check_company_transition(CompanyStatus::Pending, &d).is_ok());
        assert!(matches!(
            check_company_transition(CompanyStatus::Approved, &d),
            Err(PipelineError::InvalidTransition { .. })
        ));
        assert!(check_company_transition(CompanyStatus::Rejected, &d).is_err());
    }

    #[test]
    fn contact_transitions_move_exactly_one_step() {
        let sdr = Uuid::new_v4();
        let steps = [
            ContactTransition::Approve,
            ContactTransition::AssignToSdr { sdr_id: sdr },
            ContactTransition::ScheduleMeeting,
        ];
        for t in steps {
            for from in ContactStatus::ALL {
                let ok = t.check(*from).is_ok();
                assert_eq!(ok, *from == t.required_status(), "{t:?} from {from}");
            }
            assert_eq!(t.target().rank(), t.required_status().rank() + 1);
        }
    }

    #[test]
    fn approve_on_assigned_contact_is_invalid() {
        let err = ContactTransition::Approve
            .check(ContactStatus::AssignedToSdr)
            .unwrap_err();
        assert_eq!(
            err.to_string(),
            "cannot move contact from 'assigned_to_sdr' to 'approved'"
        );
    }

    #[test]
    fn assignment_needs_sdr() {
        assert!(matches!(
            ContactTransition::assign(None),
            Err(PipelineError::InvalidInput(_))
        ));
        let id = Uuid::new_v4();
        assert_eq!(
            ContactTransition::assign(Some(id)),
            Ok(ContactTransition::AssignToSdr { sdr_id: id })
        );
    }
}

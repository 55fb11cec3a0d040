//! Inputs for creating and editing records.
//!
//! Changes arrive from the CRUD layer as a [`NewRecord`] (create) or a
//! [`RecordPatch`] (partial edit). Both validate before producing a
//! [`Record`], so the store never holds an attendee without a name.

use crate::{error::Result, Error, Record, RecordId, Timestamp};
use serde::{Deserialize, Serialize};

/// Descriptive fields supplied when registering an attendee.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewRecord {
    pub name: String,
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub organization: Option<String>,
}

impl NewRecord {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    pub fn with_email(mut self, email: impl Into<String>) -> Self {
        self.email = Some(email.into());
        self
    }

    pub fn with_title(mut self, title: impl Into<String>) -> Self {
        self.title = Some(title.into());
        self
    }

    pub fn with_organization(mut self, organization: impl Into<String>) -> Self {
        self.organization = Some(organization.into());
        self
    }

    /// Build the record for a freshly assigned id.
    pub fn into_record(self, id: impl Into<RecordId>, registered_at: Timestamp) -> Result<Record> {
        let name = required_name(&self.name)?;
        let mut record = Record::new(id, name, registered_at);
        record.email = normalize(self.email);
        record.title = normalize(self.title);
        record.organization = normalize(self.organization);
        Ok(record)
    }
}

/// A partial edit of an existing record.
///
/// `None` leaves a field untouched. For the optional text fields an empty
/// string clears the value.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RecordPatch {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub organization: Option<String>,
    #[serde(default)]
    pub present: Option<bool>,
    #[serde(default)]
    pub badge_printed: Option<bool>,
}

impl RecordPatch {
    /// Whether the patch changes nothing.
    pub fn is_empty(&self) -> bool {
        self == &Self::default()
    }

    /// Apply the patch, returning the edited copy.
    ///
    /// Setting `present` or `badge_printed` to true stamps the matching
    /// timestamp with `now` if it was not set already; setting either to
    /// false clears its timestamp.
    pub fn apply(&self, record: &Record, now: Timestamp) -> Result<Record> {
        let mut next = record.clone();

        if let Some(name) = &self.name {
            next.name = required_name(name)?;
        }
        if let Some(email) = &self.email {
            next.email = normalize(Some(email.clone()));
        }
        if let Some(title) = &self.title {
            next.title = normalize(Some(title.clone()));
        }
        if let Some(organization) = &self.organization {
            next.organization = normalize(Some(organization.clone()));
        }

        match self.present {
            Some(true) => next.mark_present(now),
            Some(false) => {
                next.present = false;
                next.present_at = None;
            }
            None => {}
        }

        match self.badge_printed {
            Some(true) if !next.badge_printed => next.mark_printed(now),
            Some(true) => {}
            Some(false) => {
                next.badge_printed = false;
                next.printed_at = None;
            }
            None => {}
        }

        Ok(next)
    }
}

fn required_name(name: &str) -> Result<String> {
    let trimmed = name.trim();
    if trimmed.is_empty() {
        return Err(Error::MissingRequiredField("name".into()));
    }
    Ok(trimmed.to_string())
}

fn normalize(value: Option<String>) -> Option<String> {
    value
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_record_trims_and_drops_blank_fields() {
        let record = NewRecord::new("  Grace Hopper ")
            .with_email("grace@example.com")
            .with_title("  ")
            .into_record("att-1", 1000)
            .unwrap();

        assert_eq!(record.name, "Grace Hopper");
        assert_eq!(record.email.as_deref(), Some("grace@example.com"));
        assert_eq!(record.title, None);
        assert_eq!(record.registered_at, 1000);
    }

    #[test]
    fn new_record_requires_name() {
        let err = NewRecord::new("").into_record("att-1", 1000).unwrap_err();
        assert_eq!(err, Error::MissingRequiredField("name".into()));
    }

    #[test]
    fn patch_edits_only_given_fields() {
        let record = NewRecord::new("Ada")
            .with_organization("Analytical Engines")
            .into_record("att-1", 1000)
            .unwrap();

        let patch = RecordPatch {
            title: Some("Countess".into()),
            organization: Some(String::new()),
            ..RecordPatch::default()
        };
        let next = patch.apply(&record, 2000).unwrap();

        assert_eq!(next.name, "Ada");
        assert_eq!(next.title.as_deref(), Some("Countess"));
        assert_eq!(next.organization, None);
    }

    #[test]
    fn patch_presence_stamps_and_clears() {
        let record = Record::new("att-1", "Ada", 1000);

        let checked_in = RecordPatch {
            present: Some(true),
            ..RecordPatch::default()
        }
        .apply(&record, 2000)
        .unwrap();
        assert!(checked_in.present);
        assert_eq!(checked_in.present_at, Some(2000));

        let undone = RecordPatch {
            present: Some(false),
            ..RecordPatch::default()
        }
        .apply(&checked_in, 3000)
        .unwrap();
        assert!(!undone.present);
        assert_eq!(undone.present_at, None);
    }

    #[test]
    fn patch_rejects_blank_name() {
        let record = Record::new("att-1", "Ada", 1000);
        let patch = RecordPatch {
            name: Some("   ".into()),
            ..RecordPatch::default()
        };
        assert!(patch.apply(&record, 2000).is_err());
    }

    #[test]
    fn empty_patch() {
        assert!(RecordPatch::default().is_empty());
        let record = Record::new("att-1", "Ada", 1000);
        assert_eq!(RecordPatch::default().apply(&record, 2000).unwrap(), record);
    }
}

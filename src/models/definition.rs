//! Property-scoped task definitions.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Staff assignment and requirement text for one request category at one property.
///
/// Definitions are provisioned outside the engine and only ever read during
/// orchestration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct TaskDefinition {
    /// Unique record identifier.
    pub id: String,
    /// Owning property.
    pub property_id: String,
    /// Category label the definition serves.
    pub label: String,
    /// What staff must confirm.
    #[serde(default)]
    pub staff_requirements: String,
    /// What the guest must confirm.
    #[serde(default)]
    pub guest_requirements: String,
    /// When the host must be looped in.
    #[serde(default)]
    pub host_escalation_criteria: String,
    /// Responsible staff identity.
    #[serde(default)]
    pub staff_id: Option<String>,
    /// Responsible staff contact address.
    #[serde(default)]
    pub staff_address: Option<String>,
}

impl TaskDefinition {
    /// Construct a definition with a generated identifier and no staff assignment.
    #[must_use]
    pub fn new(property_id: String, label: String) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            property_id,
            label,
            staff_requirements: String::new(),
            guest_requirements: String::new(),
            host_escalation_criteria: String::new(),
            staff_id: None,
            staff_address: None,
        }
    }

    /// Attach the responsible staff member.
    #[must_use]
    pub fn with_staff(mut self, staff_id: impl Into<String>, staff_address: impl Into<String>) -> Self {
        self.staff_id = Some(staff_id.into());
        self.staff_address = Some(staff_address.into());
        self
    }

    /// Set the requirement text.
    #[must_use]
    pub fn with_requirements(
        mut self,
        staff_requirements: impl Into<String>,
        guest_requirements: impl Into<String>,
        host_escalation_criteria: impl Into<String>,
    ) -> Self {
        self.staff_requirements = staff_requirements.into();
        self.guest_requirements = guest_requirements.into();
        self.host_escalation_criteria = host_escalation_criteria.into();
        self
    }
}

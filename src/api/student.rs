use k8s_openapi::chrono::NaiveDate;
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use unito_operator_controller::StatusObject;
use unito_operator_core::ReconcileError;

pub const DEFAULT_COURSE_YEAR: &str = "2022-2023";

fn default_course_year() -> String {
    DEFAULT_COURSE_YEAR.to_string()
}

/// A student enrolled through the operator, served by its own workload.
#[derive(CustomResource, Deserialize, Serialize, Clone, Debug, PartialEq, JsonSchema)]
#[kube(
    group = "k8s.unito.it",
    version = "v1beta1",
    kind = "Student",
    plural = "students",
    namespaced,
    status = "StudentStatus",
    printcolumn = r#"{"name":"Nickname","type":"string","jsonPath":".spec.nickname"}"#,
    printcolumn = r#"{"name":"Acceptance","type":"string","jsonPath":".status.acceptance"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct StudentSpec {
    pub surname: String,
    /// YYYY-MM-DD.
    pub birth_date: String,
    /// Academic year the student is attending.
    #[serde(default = "default_course_year")]
    pub course_year: String,
    /// Required before the student is registered; records without one wait.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub nickname: Option<String>,
}

impl Default for StudentSpec {
    fn default() -> Self {
        Self {
            surname: String::new(),
            birth_date: String::new(),
            course_year: default_course_year(),
            nickname: None,
        }
    }
}

impl StudentSpec {
    pub fn validate(&self) -> Result<(), ReconcileError> {
        if self.surname.trim().is_empty() {
            return Err(ReconcileError::Validation("surname must not be empty".into()));
        }
        NaiveDate::parse_from_str(&self.birth_date, "%Y-%m-%d").map_err(|_| {
            ReconcileError::Validation(format!(
                "birthDate {:?} is not a YYYY-MM-DD date",
                self.birth_date
            ))
        })?;
        Ok(())
    }

    pub fn nickname(&self) -> Option<&str> {
        self.nickname.as_deref().filter(|n| !n.is_empty())
    }
}

#[derive(Deserialize, Serialize, Clone, Copy, Debug, Default, PartialEq, Eq, JsonSchema)]
pub enum Acceptance {
    #[default]
    Rejected,
    Accepted,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, Eq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct StudentStatus {
    #[serde(default)]
    pub initialized: bool,
    #[serde(default)]
    pub acceptance: Acceptance,
    #[serde(default)]
    pub address: String,
}

impl StatusObject for Student {
    type Status = StudentStatus;

    fn status(&self) -> Option<&StudentStatus> {
        self.status.as_ref()
    }

    fn status_mut(&mut self) -> &mut Option<StudentStatus> {
        &mut self.status
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn course_year_defaults_when_absent() {
        let spec: StudentSpec =
            serde_json::from_str(r#"{"surname":"Rossi","birthDate":"2001-04-12"}"#).unwrap();
        assert_eq!(spec.course_year, DEFAULT_COURSE_YEAR);
        assert_eq!(spec.nickname(), None);
        assert!(spec.validate().is_ok());
    }

    #[test]
    fn rejects_bad_birth_date() {
        let spec = StudentSpec {
            surname: "Rossi".into(),
            birth_date: "12/04/2001".into(),
            ..Default::default()
        };
        assert!(matches!(
            spec.validate(),
            Err(ReconcileError::Validation(_))
        ));
    }

    #[test]
    fn crd_prints_nickname_and_acceptance() {
        use kube::CustomResourceExt;

        let crd = Student::crd();
        let columns: Vec<(String, String)> = crd.spec.versions[0]
            .additional_printer_columns
            .clone()
            .unwrap()
            .into_iter()
            .map(|c| (c.name, c.json_path))
            .collect();
        assert_eq!(
            columns,
            vec![
                ("Nickname".to_string(), ".spec.nickname".to_string()),
                ("Acceptance".to_string(), ".status.acceptance".to_string()),
            ]
        );
    }

    #[test]
    fn acceptance_serializes_as_enum_name() {
        assert_eq!(
            serde_json::to_string(&Acceptance::Accepted).unwrap(),
            r#""Accepted""#
        );
    }
}

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use unito_operator_controller::StatusObject;
use unito_operator_core::ReconcileError;

/// Desired state of a managed MySQL instance.
#[derive(CustomResource, Deserialize, Serialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[kube(
    group = "database.unito.it",
    version = "v1beta1",
    kind = "MySQL",
    plural = "mysqls",
    namespaced,
    status = "MySQLStatus",
    printcolumn = r#"{"name":"Ready","type":"boolean","jsonPath":".status.ready"}"#,
    printcolumn = r#"{"name":"Address","type":"string","jsonPath":".status.address"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct MySQLSpec {
    /// Image tag of `docker.io/mysql` the instance runs.
    pub version: String,
    /// Root credential to run with. Changing it recreates the instance pod;
    /// when unset a random one is generated and kept stable.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub root_credential: Option<String>,
}

impl MySQLSpec {
    pub fn validate(&self) -> Result<(), ReconcileError> {
        if self.version.trim().is_empty() {
            return Err(ReconcileError::Validation("version must not be empty".into()));
        }
        if self.version.chars().any(|c| c.is_whitespace() || c == '/' || c == '@') {
            return Err(ReconcileError::Validation(format!(
                "version {:?} is not a valid image tag",
                self.version
            )));
        }
        Ok(())
    }

    pub fn declared_credential(&self) -> Option<&str> {
        self.root_credential.as_deref().filter(|c| !c.is_empty())
    }
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, Eq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct MySQLStatus {
    /// The instance pod has been provisioned.
    #[serde(default)]
    pub initialized: bool,
    /// The instance pod is running.
    #[serde(default)]
    pub ready: bool,
    /// Cluster IP the instance listens on.
    #[serde(default)]
    pub address: String,
    /// Root credential actually applied to the running pod.
    #[serde(default)]
    pub credential: String,
}

impl StatusObject for MySQL {
    type Status = MySQLStatus;

    fn status(&self) -> Option<&MySQLStatus> {
        self.status.as_ref()
    }

    fn status_mut(&mut self) -> &mut Option<MySQLStatus> {
        &mut self.status
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec(version: &str) -> MySQLSpec {
        MySQLSpec {
            version: version.to_string(),
            root_credential: None,
        }
    }

    #[test]
    fn rejects_missing_or_malformed_version() {
        assert!(spec("8.0").validate().is_ok());
        assert!(matches!(
            spec("  ").validate(),
            Err(ReconcileError::Validation(_))
        ));
        assert!(spec("8.0@sha256").validate().is_err());
    }

    #[test]
    fn empty_credential_counts_as_undeclared() {
        let mut spec = spec("8.0");
        spec.root_credential = Some(String::new());
        assert_eq!(spec.declared_credential(), None);
        spec.root_credential = Some("s3cret".into());
        assert_eq!(spec.declared_credential(), Some("s3cret"));
    }

    #[test]
    fn wire_format_uses_camel_case() {
        let spec: MySQLSpec =
            serde_json::from_str(r#"{"version":"8.0","rootCredential":"pw"}"#).unwrap();
        assert_eq!(spec.root_credential.as_deref(), Some("pw"));
    }
}

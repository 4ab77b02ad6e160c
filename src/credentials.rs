//! Root credential selection for MySQL instances.

use k8s_openapi::api::core::v1::Pod;
use uuid::Uuid;

/// Environment variable the instance container reads its root credential from.
pub const CREDENTIAL_ENV: &str = "MYSQL_ROOT_PASSWORD";

/// Where the credential for the next instance pod comes from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CredentialSource {
    /// Declared in the spec. `replace_child` is a rotation: the running pod
    /// carries another value and must be destroyed before the new one applies.
    Declared { value: String, replace_child: bool },
    /// Keep what the running pod already carries.
    Reuse(String),
    /// Nothing declared, nothing running: mint a fresh token.
    Generate,
}

impl CredentialSource {
    /// Decision table over the declared value, the value last echoed into
    /// status and the value the running pod carries. Empty strings count as
    /// absent.
    pub fn decide(
        declared: Option<&str>,
        recorded: Option<&str>,
        running: Option<&str>,
    ) -> Self {
        let declared = non_empty(declared);
        let recorded = non_empty(recorded);
        let running = non_empty(running);

        match (declared, running) {
            (Some(value), running) => CredentialSource::Declared {
                value: value.to_string(),
                replace_child: Some(value) != recorded && running.is_some_and(|r| r != value),
            },
            (None, Some(running)) => CredentialSource::Reuse(running.to_string()),
            (None, None) => CredentialSource::Generate,
        }
    }

    pub fn replaces_child(&self) -> bool {
        matches!(
            self,
            CredentialSource::Declared {
                replace_child: true,
                ..
            }
        )
    }

    /// The value to assign given what the pod being mutated currently
    /// carries. `minted` is used only when nothing else applies.
    pub fn resolve(&self, carried: Option<&str>, minted: &str) -> String {
        match self {
            CredentialSource::Declared { value, .. } => value.clone(),
            CredentialSource::Reuse(value) => {
                non_empty(carried).unwrap_or(value.as_str()).to_string()
            }
            CredentialSource::Generate => non_empty(carried).unwrap_or(minted).to_string(),
        }
    }
}

/// A random 128-bit token rendered as a 36-character UUID.
pub fn generate() -> String {
    Uuid::new_v4().to_string()
}

/// Credential carried by the first container of `pod`, if any.
pub fn carried_by(pod: &Pod) -> Option<&str> {
    pod.spec
        .as_ref()?
        .containers
        .first()?
        .env
        .as_ref()?
        .iter()
        .find(|e| e.name == CREDENTIAL_ENV)?
        .value
        .as_deref()
}

fn non_empty(value: Option<&str>) -> Option<&str> {
    value.filter(|v| !v.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generates_when_nothing_is_known() {
        assert_eq!(
            CredentialSource::decide(None, None, None),
            CredentialSource::Generate
        );
        assert_eq!(
            CredentialSource::decide(Some(""), Some(""), Some("")),
            CredentialSource::Generate
        );
    }

    #[test]
    fn reuses_running_value_without_declaration() {
        assert_eq!(
            CredentialSource::decide(None, Some("old"), Some("live")),
            CredentialSource::Reuse("live".into())
        );
    }

    #[test]
    fn declared_change_against_running_pod_rotates() {
        let source = CredentialSource::decide(Some("new"), Some("old"), Some("old"));
        assert!(source.replaces_child());
        assert_eq!(source.resolve(None, "unused"), "new");
    }

    #[test]
    fn declared_value_already_applied_does_not_rotate() {
        assert!(!CredentialSource::decide(Some("pw"), Some("pw"), Some("pw")).replaces_child());
        // Applied to the pod but not yet echoed into status.
        assert!(!CredentialSource::decide(Some("pw"), Some("old"), Some("pw")).replaces_child());
        // No pod to replace.
        assert!(!CredentialSource::decide(Some("pw"), None, None).replaces_child());
    }

    #[test]
    fn resolve_prefers_carried_value_over_minted() {
        assert_eq!(
            CredentialSource::Generate.resolve(Some("carried"), "minted"),
            "carried"
        );
        assert_eq!(CredentialSource::Generate.resolve(None, "minted"), "minted");
    }

    #[test]
    fn generated_tokens_are_uuid_shaped_and_distinct() {
        let a = generate();
        let b = generate();
        assert_eq!(a.len(), 36);
        assert_ne!(a, b);
    }
}

//! Owner references and the kind registry they are resolved against.
//!
//! The registry is an explicit value handed to whoever stamps owner
//! references, so tests can build an isolated one per case.

use std::collections::BTreeSet;

use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;
use kube::{Resource, ResourceExt};

use unito_operator_core::OwnerError;

/// Known kinds, keyed by `(apiVersion, kind)`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Registry {
    kinds: BTreeSet<(String, String)>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<K: Resource<DynamicType = ()>>(mut self) -> Self {
        self.add::<K>();
        self
    }

    pub fn add<K: Resource<DynamicType = ()>>(&mut self) {
        self.kinds
            .insert((K::api_version(&()).to_string(), K::kind(&()).to_string()));
    }

    pub fn is_registered<K: Resource<DynamicType = ()>>(&self) -> bool {
        self.kinds
            .contains(&(K::api_version(&()).to_string(), K::kind(&()).to_string()))
    }

    fn require<K: Resource<DynamicType = ()>>(&self) -> Result<(), OwnerError> {
        if self.is_registered::<K>() {
            Ok(())
        } else {
            Err(OwnerError::UnregisteredKind(format!(
                "{}/{}",
                K::api_version(&()),
                K::kind(&())
            )))
        }
    }

    /// Controller owner reference pointing at `owner`.
    pub fn owner_reference<P>(&self, owner: &P) -> Result<OwnerReference, OwnerError>
    where
        P: Resource<DynamicType = ()>,
    {
        self.require::<P>()?;
        let uid = owner.uid().ok_or_else(|| OwnerError::MissingUid {
            kind: P::kind(&()).to_string(),
            name: owner.name_any(),
        })?;

        Ok(OwnerReference {
            api_version: P::api_version(&()).to_string(),
            kind: P::kind(&()).to_string(),
            name: owner.name_any(),
            uid,
            controller: Some(true),
            block_owner_deletion: Some(true),
        })
    }
}

/// Stamps `owner` as the single controller of `child`. Meant to run inside a
/// create-or-update mutate step so ownership lands in the same write as the
/// desired fields. Re-stamping the same owner is a no-op; a child already
/// controlled by another object is refused.
pub fn set_controller_reference<P, C>(
    registry: &Registry,
    owner: &P,
    child: &mut C,
) -> Result<(), OwnerError>
where
    P: Resource<DynamicType = ()>,
    C: Resource<DynamicType = ()>,
{
    registry.require::<C>()?;
    let reference = registry.owner_reference(owner)?;

    let owner_namespace = owner.namespace().unwrap_or_default();
    let child_namespace = child.namespace().unwrap_or_default();
    if owner_namespace != child_namespace {
        return Err(OwnerError::CrossNamespace {
            child_namespace,
            owner_namespace,
        });
    }

    if let Some(existing) = child
        .owner_references()
        .iter()
        .find(|r| r.controller == Some(true) && r.uid != reference.uid)
    {
        return Err(OwnerError::AlreadyOwned {
            child: format!("{} {}", C::kind(&()), child.name_any()),
            owner_kind: existing.kind.clone(),
            owner_name: existing.name.clone(),
        });
    }

    let references = child.owner_references_mut();
    match references.iter_mut().find(|r| r.uid == reference.uid) {
        Some(slot) => *slot = reference,
        None => references.push(reference),
    }
    Ok(())
}

pub fn is_controlled_by<P, C>(owner: &P, child: &C) -> bool
where
    P: Resource<DynamicType = ()>,
    C: Resource<DynamicType = ()>,
{
    let Some(uid) = owner.uid() else {
        return false;
    };
    child
        .owner_references()
        .iter()
        .any(|r| r.controller == Some(true) && r.uid == uid)
}

/// Deterministic child name derived from the owner's uid and name, so two
/// owners can never claim the same child.
pub fn child_name<P>(prefix: &str, owner: &P) -> Result<String, OwnerError>
where
    P: Resource<DynamicType = ()>,
{
    let uid = owner.uid().ok_or_else(|| OwnerError::MissingUid {
        kind: P::kind(&()).to_string(),
        name: owner.name_any(),
    })?;
    Ok(format!("{}-{}-{}", prefix, uid, owner.name_any()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::core::v1::{ConfigMap, Pod};
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;

    fn owner(uid: Option<&str>) -> ConfigMap {
        ConfigMap {
            metadata: ObjectMeta {
                name: Some("parent".to_string()),
                namespace: Some("default".to_string()),
                uid: uid.map(str::to_string),
                ..Default::default()
            },
            ..Default::default()
        }
    }

    fn child() -> Pod {
        Pod {
            metadata: ObjectMeta {
                name: Some("child".to_string()),
                namespace: Some("default".to_string()),
                ..Default::default()
            },
            ..Default::default()
        }
    }

    fn registry() -> Registry {
        Registry::new().register::<ConfigMap>().register::<Pod>()
    }

    #[test]
    fn stamps_a_single_controller_reference() {
        let parent = owner(Some("uid-1"));
        let mut pod = child();

        set_controller_reference(&registry(), &parent, &mut pod).unwrap();
        set_controller_reference(&registry(), &parent, &mut pod).unwrap();

        assert_eq!(pod.owner_references().len(), 1);
        let reference = &pod.owner_references()[0];
        assert_eq!(reference.kind, "ConfigMap");
        assert_eq!(reference.uid, "uid-1");
        assert!(is_controlled_by(&parent, &pod));
    }

    #[test]
    fn refuses_unregistered_child_kind() {
        let registry = Registry::new().register::<ConfigMap>();
        let err = set_controller_reference(&registry, &owner(Some("uid-1")), &mut child())
            .unwrap_err();
        assert!(matches!(err, OwnerError::UnregisteredKind(ref k) if k == "v1/Pod"));
    }

    #[test]
    fn refuses_owner_without_uid() {
        let err =
            set_controller_reference(&registry(), &owner(None), &mut child()).unwrap_err();
        assert!(matches!(err, OwnerError::MissingUid { .. }));
    }

    #[test]
    fn refuses_second_controller() {
        let mut pod = child();
        set_controller_reference(&registry(), &owner(Some("uid-1")), &mut pod).unwrap();

        let err = set_controller_reference(&registry(), &owner(Some("uid-2")), &mut pod)
            .unwrap_err();
        assert!(matches!(err, OwnerError::AlreadyOwned { .. }));
    }

    #[test]
    fn child_names_embed_owner_identity() {
        assert_eq!(
            child_name("unito", &owner(Some("abc"))).unwrap(),
            "unito-abc-parent"
        );
    }
}

use std::collections::BTreeMap;

/// Labels stamped on MySQL instance pods.
pub const PROJECT_LABEL: &str = "unito.it/project";
pub const DB_LABEL: &str = "unito.it/db";
pub const NAME_LABEL: &str = "unito.it/name";

/// Labels stamped on student workloads.
pub const STUDENT_LABEL: &str = "student";
pub const OPERATOR_LABEL: &str = "operator";

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Labels(pub BTreeMap<String, String>);

impl Labels {
    pub fn new() -> Self {
        Self(BTreeMap::new())
    }

    pub fn insert(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.0.insert(key.into(), value.into());
        self
    }

    pub fn into_inner(self) -> BTreeMap<String, String> {
        self.0
    }

    /// Copies every label into `target`, leaving foreign labels alone.
    pub fn merge_into(&self, target: &mut BTreeMap<String, String>) {
        for (k, v) in &self.0 {
            target.insert(k.clone(), v.clone());
        }
    }

    /// The subset of `source` whose keys this set defines.
    pub fn select_from(&self, source: &BTreeMap<String, String>) -> BTreeMap<String, String> {
        source
            .iter()
            .filter(|(k, _)| self.0.contains_key(*k))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }

    pub fn mysql(name: &str) -> Self {
        Self::new()
            .insert(PROJECT_LABEL, "operator")
            .insert(DB_LABEL, "mysql")
            .insert(NAME_LABEL, name)
    }

    pub fn student(name: &str) -> Self {
        Self::new()
            .insert(STUDENT_LABEL, name)
            .insert(OPERATOR_LABEL, "unito")
    }
}

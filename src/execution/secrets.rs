//! Secret Providers
//!
//! Secrets are opaque `store`/`key` references in a definition. They are
//! only resolved when a unit is dispatched, and the values travel in
//! [`ConcreteArgs::secret_env`], which is never logged.

use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

use log::{debug, info};

use crate::error::SecretError;
use crate::workflow::{ConcreteArgs, ExecutableSpec, SecretRef};

/// Resolves secret references to their values.
pub trait SecretProvider: Send + Sync {
    fn resolve(&self, secret: &SecretRef) -> Result<String, SecretError>;
}

/// Provider for runs that use no secrets; every lookup fails.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoSecrets;

impl SecretProvider for NoSecrets {
    fn resolve(&self, secret: &SecretRef) -> Result<String, SecretError> {
        Err(SecretError::UnknownStore(secret.store.clone()))
    }
}

/// In-memory `store → key → value` provider.
#[derive(Clone, Default)]
pub struct StaticSecrets {
    stores: BTreeMap<String, BTreeMap<String, String>>,
}

impl StaticSecrets {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_secret(
        mut self,
        store: impl Into<String>,
        key: impl Into<String>,
        value: impl Into<String>,
    ) -> Self {
        self.stores
            .entry(store.into())
            .or_default()
            .insert(key.into(), value.into());
        self
    }

    /// Loads stores from a JSON file shaped `{"store": {"key": "value"}}`.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, SecretError> {
        let path = path.as_ref();
        let content = fs::read_to_string(path)
            .map_err(|e| SecretError::Load(format!("{}: {}", path.display(), e)))?;
        let stores: BTreeMap<String, BTreeMap<String, String>> = serde_json::from_str(&content)
            .map_err(|e| SecretError::Load(format!("{}: {}", path.display(), e)))?;

        info!(
            "Loaded {} secret store(s) from {}",
            stores.len(),
            path.display()
        );
        Ok(Self { stores })
    }
}

impl SecretProvider for StaticSecrets {
    fn resolve(&self, secret: &SecretRef) -> Result<String, SecretError> {
        let store = self
            .stores
            .get(&secret.store)
            .ok_or_else(|| SecretError::UnknownStore(secret.store.clone()))?;
        store
            .get(&secret.key)
            .cloned()
            .ok_or_else(|| SecretError::UnknownKey {
                store: secret.store.clone(),
                key: secret.key.clone(),
            })
    }
}

/// Resolves every secret of `spec` into `unit.secret_env`.
pub fn attach_secrets(
    unit: &mut ConcreteArgs,
    spec: &ExecutableSpec,
    provider: &dyn SecretProvider,
) -> Result<(), SecretError> {
    for (env_name, secret) in &spec.secrets {
        let value = provider.resolve(secret)?;
        unit.secret_env.insert(env_name.clone(), value);
    }
    if !spec.secrets.is_empty() {
        debug!(
            "Attached {} secret(s) to '{}'",
            spec.secrets.len(),
            unit.instance
        );
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_static_lookup() {
        let secrets = StaticSecrets::new().with_secret("db", "password", "hunter2");
        assert_eq!(
            secrets.resolve(&SecretRef::new("db", "password")).unwrap(),
            "hunter2"
        );
        assert_eq!(
            secrets.resolve(&SecretRef::new("db", "user")).unwrap_err(),
            SecretError::UnknownKey {
                store: "db".into(),
                key: "user".into()
            }
        );
        assert_eq!(
            secrets.resolve(&SecretRef::new("vault", "x")).unwrap_err(),
            SecretError::UnknownStore("vault".into())
        );
    }

    #[test]
    fn test_no_secrets() {
        assert!(NoSecrets.resolve(&SecretRef::new("db", "password")).is_err());
    }

    #[test]
    fn test_from_file() {
        let temp_dir = tempdir().unwrap();
        let path = temp_dir.path().join("secrets.json");
        std::fs::write(&path, r#"{"db": {"password": "pw"}}"#).unwrap();

        let secrets = StaticSecrets::from_file(&path).unwrap();
        assert_eq!(secrets.resolve(&SecretRef::new("db", "password")).unwrap(), "pw");

        std::fs::write(&path, "not json").unwrap();
        assert!(matches!(
            StaticSecrets::from_file(&path),
            Err(SecretError::Load(_))
        ));
    }

    #[test]
    fn test_attach_secrets() {
        let mut spec = ExecutableSpec::new("psql");
        spec.secrets
            .insert("PGPASSWORD".into(), SecretRef::new("db", "password"));

        let mut unit = ConcreteArgs::default();
        let secrets = StaticSecrets::new().with_secret("db", "password", "pw");
        attach_secrets(&mut unit, &spec, &secrets).unwrap();
        assert_eq!(unit.secret_env["PGPASSWORD"], "pw");

        let mut unit = ConcreteArgs::default();
        assert!(attach_secrets(&mut unit, &spec, &NoSecrets).is_err());
        assert!(unit.secret_env.is_empty());
    }
}

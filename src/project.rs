//! Project lookup
//!
//! Projects are stored under a key derived from the repository full name, so
//! the lookup key never contains `/` or other path characters.

use async_trait::async_trait;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::fmt;
use tracing::warn;

use crate::ProjectConfig;
use crate::error::ResolveError;

/// Prefix of every derived project key
pub const KEY_PREFIX: &str = "cicd-";
const KEY_HASH_LEN: usize = 54;

/// Stable storage key for a repository full name.
pub fn project_key(full_name: &str) -> String {
    let digest = hex::encode(Sha256::digest(full_name.as_bytes()));
    format!("{}{}", KEY_PREFIX, &digest[..KEY_HASH_LEN])
}

/// Stored settings for one repository. Loaded per request, never mutated.
#[derive(Clone, PartialEq)]
pub struct ProjectRecord {
    /// Expected repository full name
    pub name: String,
    /// Webhook shared secret; empty means unconfigured
    pub secret: String,
    pub ssh_key: Option<String>,
}

impl ProjectRecord {
    pub fn has_ssh_key(&self) -> bool {
        self.ssh_key.as_deref().is_some_and(|k| !k.is_empty())
    }
}

impl fmt::Debug for ProjectRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProjectRecord")
            .field("name", &self.name)
            .field("secret", &"<redacted>")
            .field("ssh_key", &self.ssh_key.as_ref().map(|k| k.len()))
            .finish()
    }
}

impl From<&ProjectConfig> for ProjectRecord {
    fn from(config: &ProjectConfig) -> Self {
        Self {
            name: config.name.clone(),
            secret: config.secret.clone(),
            ssh_key: config.ssh_key.clone(),
        }
    }
}

#[async_trait]
pub trait ProjectResolver: Send + Sync {
    async fn resolve(&self, key: &str, namespace: &str) -> Result<ProjectRecord, ResolveError>;
}

/// Resolver backed by the `[[project]]` entries of the config file
#[derive(Debug, Default)]
pub struct ConfigProjectResolver {
    projects: HashMap<(String, String), ProjectRecord>,
}

impl ConfigProjectResolver {
    pub fn new(projects: &[ProjectConfig]) -> Self {
        let mut map = HashMap::new();
        for project in projects {
            let key = (project_key(&project.name), project.namespace.clone());
            if map.insert(key, ProjectRecord::from(project)).is_some() {
                warn!(
                    "Project '{}' is configured more than once in namespace '{}', using the last entry",
                    project.name, project.namespace
                );
            }
        }
        Self { projects: map }
    }

    pub fn len(&self) -> usize {
        self.projects.len()
    }

    pub fn is_empty(&self) -> bool {
        self.projects.is_empty()
    }
}

#[async_trait]
impl ProjectResolver for ConfigProjectResolver {
    async fn resolve(&self, key: &str, namespace: &str) -> Result<ProjectRecord, ResolveError> {
        self.projects
            .get(&(key.to_string(), namespace.to_string()))
            .cloned()
            .ok_or_else(|| ResolveError::NotFound {
                key: key.to_string(),
                namespace: namespace.to_string(),
            })
    }
}

//! The template registry: loads, validates and serves immutable template
//! definitions, seeding the built-in documents on first boot.

mod builtin;

use std::{collections::HashMap, path::PathBuf, sync::Arc};

use serde::Serialize;

use crate::{
    config::{ExecutionMode, PortSpec, Template},
    store::FileStore,
    GarconError, GarconResult,
};

use builtin::BUILTIN_TEMPLATES;

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// Loads, validates and serves immutable template definitions.
///
/// Templates are read once at construction; a loaded template never changes
/// for the lifetime of the process.
#[derive(Debug)]
pub struct TemplateRegistry {
    /// Loaded templates keyed by id.
    templates: HashMap<String, Arc<Template>>,

    /// The directory the documents were loaded from.
    templates_dir: PathBuf,
}

/// The trimmed template shape returned from list calls. Omits execution
/// internals and RCON secrets.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TemplateResponse {
    /// The template identifier.
    pub id: String,

    /// The display name.
    pub name: String,

    /// An optional description.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,

    /// The execution mode.
    pub mode: ExecutionMode,

    /// Default ports offered to imported servers.
    pub ports: Vec<PortSpec>,

    /// Filenames required under the import source.
    pub required_files: Vec<String>,
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl TemplateRegistry {
    /// Seeds built-in documents that are not already present, then loads and
    /// validates every document in the template directory.
    ///
    /// Invalid documents are logged and skipped so a single bad file never
    /// prevents startup.
    pub async fn load(store: &FileStore, templates_dir: PathBuf) -> GarconResult<Self> {
        store.ensure_dir(&templates_dir).await?;

        // Seed built-ins only where no document with the same id exists yet.
        for (id, contents) in BUILTIN_TEMPLATES {
            let path = templates_dir.join(format!("{}.yaml", id));
            if !store.exists(&path).await {
                tokio::fs::write(&path, contents).await?;
                tracing::info!("seeded built-in template '{}'", id);
            }
        }

        let mut templates = HashMap::new();
        for path in store.list_files(&templates_dir, Some("yaml")).await? {
            let template: Template = match store.read_yaml(&path).await {
                Ok(template) => template,
                Err(e) => {
                    tracing::warn!("skipping template {}: {}", path.display(), e);
                    continue;
                }
            };

            if let Err(e) = template.validate() {
                tracing::warn!("skipping template {}: {}", path.display(), e);
                continue;
            }

            let id = template.get_id().clone();
            if templates.insert(id.clone(), Arc::new(template)).is_some() {
                tracing::warn!("duplicate template id '{}'; keeping the last one loaded", id);
            }
        }

        tracing::info!(
            "loaded {} templates from {}",
            templates.len(),
            templates_dir.display()
        );

        Ok(Self {
            templates,
            templates_dir,
        })
    }

    /// Lists all templates as trimmed response shapes, sorted by id.
    pub fn list(&self) -> Vec<TemplateResponse> {
        let mut responses: Vec<_> = self
            .templates
            .values()
            .map(|t| TemplateResponse::from_template(t))
            .collect();
        responses.sort_by(|a, b| a.id.cmp(&b.id));
        responses
    }

    /// Fetches a template by id.
    pub fn get(&self, id: &str) -> GarconResult<Arc<Template>> {
        self.templates
            .get(id)
            .cloned()
            .ok_or_else(|| GarconError::not_found(format!("template '{}' does not exist", id)))
    }

    /// Best-effort synchronous lookup for cached display paths.
    pub fn lookup(&self, id: &str) -> Option<Arc<Template>> {
        self.templates.get(id).cloned()
    }

    /// The directory the registry loaded from.
    pub fn templates_dir(&self) -> &PathBuf {
        &self.templates_dir
    }
}

impl TemplateResponse {
    fn from_template(template: &Template) -> Self {
        Self {
            id: template.get_id().clone(),
            name: template.get_name().clone(),
            description: template.get_description().clone(),
            mode: *template.get_mode(),
            ports: template.get_ports().clone(),
            required_files: template.get_required_files().clone(),
        }
    }
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_seeds_builtins_once() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let store = FileStore::new();

        let registry = TemplateRegistry::load(&store, dir.path().to_path_buf()).await?;
        assert!(registry.get("minecraft").is_ok());
        assert!(registry.get("vrising").is_ok());

        // Operator edits survive a reload; seeding never overwrites.
        let path = dir.path().join("minecraft.yaml");
        let edited = tokio::fs::read_to_string(&path)
            .await?
            .replace("name: Minecraft (Java)", "name: Custom MC");
        tokio::fs::write(&path, edited).await?;

        let registry = TemplateRegistry::load(&store, dir.path().to_path_buf()).await?;
        assert_eq!(registry.get("minecraft")?.get_name(), "Custom MC");

        Ok(())
    }

    #[tokio::test]
    async fn test_invalid_document_is_skipped() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let store = FileStore::new();

        tokio::fs::write(dir.path().join("broken.yaml"), "not: [valid template").await?;
        tokio::fs::write(
            dir.path().join("badmode.yaml"),
            "id: badmode\nname: Bad\nmode: container\n",
        )
        .await?;

        let registry = TemplateRegistry::load(&store, dir.path().to_path_buf()).await?;
        assert!(registry.lookup("badmode").is_none());
        assert!(registry.get("minecraft").is_ok());

        Ok(())
    }

    #[tokio::test]
    async fn test_list_omits_exec_internals() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let store = FileStore::new();

        let registry = TemplateRegistry::load(&store, dir.path().to_path_buf()).await?;
        let listed = registry.list();
        assert!(!listed.is_empty());

        let encoded = serde_json::to_string(&listed)?;
        assert!(!encoded.contains("password"));
        assert!(!encoded.contains("shutdownCommand"));

        Ok(())
    }
}

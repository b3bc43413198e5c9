//! Where templates and previously uploaded project files come from.
//!
//! Both are owned by systems outside the orchestrator; it only reads them
//! through [`TemplateSource`] and [`FileSource`].

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use uuid::Uuid;

use crate::archive::{ArchiveEntry, TemplateNode};
use crate::orchestrator::error::{OrchestratorError, Result};
use crate::orchestrator::state::Sandbox;

/// Scripts and files a sandbox is built from. Script bodies and file
/// contents are rendered with the sandbox's variables before use.
#[derive(Debug, Clone, Default)]
pub struct SandboxTemplate {
    /// Run as root in the working directory after files are uploaded.
    pub bootstrap_script: Option<String>,
    /// Run as the sandbox user on provision and every start.
    pub startup_script: Option<String>,
    /// File tree extracted into the working directory.
    pub files: Vec<TemplateNode>,
}

/// Resolves the template for a sandbox.
#[async_trait]
pub trait TemplateSource: Send + Sync {
    async fn template_for(&self, sandbox: &Sandbox) -> Result<SandboxTemplate>;
}

/// Project files the user uploaded earlier, re-synced on provision and start.
#[async_trait]
pub trait FileSource: Send + Sync {
    async fn files_for(&self, sandbox_id: Uuid) -> Result<Vec<ArchiveEntry>>;
}

/// Same template for every sandbox.
#[derive(Debug, Clone, Default)]
pub struct StaticTemplateSource {
    template: SandboxTemplate,
}

impl StaticTemplateSource {
    pub fn new(template: SandboxTemplate) -> Self {
        Self { template }
    }
}

#[async_trait]
impl TemplateSource for StaticTemplateSource {
    async fn template_for(&self, _sandbox: &Sandbox) -> Result<SandboxTemplate> {
        Ok(self.template.clone())
    }
}

/// No uploaded files.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoFiles;

#[async_trait]
impl FileSource for NoFiles {
    async fn files_for(&self, _sandbox_id: Uuid) -> Result<Vec<ArchiveEntry>> {
        Ok(Vec::new())
    }
}

/// Template read from a directory:
///
/// ```text
/// <dir>/bootstrap.sh   optional
/// <dir>/startup.sh     optional
/// <dir>/files/...      optional tree copied into the working directory
/// ```
#[derive(Debug, Clone)]
pub struct DirectoryTemplateSource {
    root: PathBuf,
}

impl DirectoryTemplateSource {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }
}

#[async_trait]
impl TemplateSource for DirectoryTemplateSource {
    async fn template_for(&self, _sandbox: &Sandbox) -> Result<SandboxTemplate> {
        let root = self.root.clone();
        tokio::task::spawn_blocking(move || load_directory_template(&root))
            .await
            .map_err(|e| OrchestratorError::step("Loading template", e))?
    }
}

fn load_directory_template(root: &Path) -> Result<SandboxTemplate> {
    if !root.is_dir() {
        return Err(OrchestratorError::step(
            "Loading template",
            format!("{} is not a directory", root.display()),
        ));
    }

    let mut template = SandboxTemplate {
        bootstrap_script: read_optional(&root.join("bootstrap.sh"))?,
        startup_script: read_optional(&root.join("startup.sh"))?,
        files: Vec::new(),
    };

    let files = root.join("files");
    if files.is_dir() {
        collect_nodes(&files, None, &mut template.files)?;
    }
    Ok(template)
}

fn read_optional(path: &Path) -> Result<Option<String>> {
    match std::fs::read_to_string(path) {
        Ok(body) => Ok(Some(body)),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(io_error(path, e)),
    }
}

fn collect_nodes(dir: &Path, parent: Option<Uuid>, out: &mut Vec<TemplateNode>) -> Result<()> {
    let entries = std::fs::read_dir(dir).map_err(|e| io_error(dir, e))?;
    for entry in entries {
        let entry = entry.map_err(|e| io_error(dir, e))?;
        let path = entry.path();
        let name = entry.file_name().to_string_lossy().into_owned();
        let file_type = entry.file_type().map_err(|e| io_error(&path, e))?;

        if file_type.is_dir() {
            let node = TemplateNode::directory(name, parent);
            let id = node.id;
            out.push(node);
            collect_nodes(&path, Some(id), out)?;
        } else if file_type.is_file() {
            let content = std::fs::read_to_string(&path).map_err(|e| io_error(&path, e))?;
            out.push(TemplateNode::file(name, parent, content));
        } else {
            tracing::debug!(path = %path.display(), "Skipping non-regular template entry");
        }
    }
    Ok(())
}

fn io_error(path: &Path, e: std::io::Error) -> OrchestratorError {
    OrchestratorError::step("Loading template", format!("{}: {}", path.display(), e))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_directory_template_loads_scripts_and_tree() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("bootstrap.sh"), "echo {{ sandbox_name }}").unwrap();
        std::fs::create_dir_all(dir.path().join("files/config")).unwrap();
        std::fs::write(dir.path().join("files/config/app.env"), "PORT={{ app_port }}").unwrap();
        std::fs::write(dir.path().join("files/README.md"), "hello").unwrap();

        let source = DirectoryTemplateSource::new(dir.path());
        let template = source
            .template_for(&Sandbox::new("demo", "dev"))
            .await
            .unwrap();

        assert_eq!(template.bootstrap_script.as_deref(), Some("echo {{ sandbox_name }}"));
        assert!(template.startup_script.is_none());
        assert_eq!(template.files.len(), 3);

        let config_dir = template
            .files
            .iter()
            .find(|n| n.name == "config")
            .unwrap();
        assert!(config_dir.is_directory);
        let app_env = template.files.iter().find(|n| n.name == "app.env").unwrap();
        assert_eq!(app_env.parent_id, Some(config_dir.id));
    }

    #[tokio::test]
    async fn test_missing_directory_is_an_error() {
        let source = DirectoryTemplateSource::new("/definitely/not/here");
        assert!(source.template_for(&Sandbox::new("demo", "dev")).await.is_err());
    }
}

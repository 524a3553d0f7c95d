//! Read-only context added to the start of a run.

use async_trait::async_trait;
use tracing::{debug, warn};

use crate::project::ProjectRoot;

/// Source of free-text lines placed before the conversation, such as a
/// project overview or the results of a codebase index lookup.
#[async_trait]
pub trait ContextProvider: Send + Sync {
    async fn context_lines(&self, task: &str) -> Vec<String>;
}

#[async_trait]
impl<F> ContextProvider for F
where
    F: Fn(&str) -> Vec<String> + Send + Sync,
{
    async fn context_lines(&self, task: &str) -> Vec<String> {
        self(task)
    }
}

pub struct NoContext;

#[async_trait]
impl ContextProvider for NoContext {
    async fn context_lines(&self, _task: &str) -> Vec<String> {
        Vec::new()
    }
}

/// Lists the top-level entries of the project, honouring ignore files.
pub struct ProjectOverview {
    project: ProjectRoot,
    max_entries: usize,
}

impl ProjectOverview {
    pub fn new(project: ProjectRoot) -> Self {
        Self {
            project,
            max_entries: 200,
        }
    }

    pub fn with_max_entries(mut self, max_entries: usize) -> Self {
        self.max_entries = max_entries;
        self
    }

    fn scan(project: &ProjectRoot, max_entries: usize) -> Vec<String> {
        let root = project.canonical().to_path_buf();
        let mut entries: Vec<String> = project
            .walker(&root, Some(1))
            .build()
            .filter_map(|entry| match entry {
                Ok(entry) => Some(entry),
                Err(e) => {
                    debug!("Skipping unreadable entry: {}", e);
                    None
                }
            })
            .filter(|entry| entry.depth() == 1)
            .map(|entry| {
                let name = project.display_relative(entry.path());
                match entry.file_type() {
                    Some(ft) if ft.is_dir() => format!("{}/", name),
                    _ => name,
                }
            })
            .collect();
        entries.sort();

        let total = entries.len();
        let mut lines = vec![format!("Project root: {}", root.display())];
        if total == 0 {
            lines.push("The project is empty.".to_string());
            return lines;
        }
        lines.push("Top-level entries:".to_string());
        lines.extend(entries.into_iter().take(max_entries).map(|e| format!("- {}", e)));
        if total > max_entries {
            lines.push(format!("... and {} more", total - max_entries));
        }
        lines
    }
}

#[async_trait]
impl ContextProvider for ProjectOverview {
    async fn context_lines(&self, _task: &str) -> Vec<String> {
        let project = self.project.clone();
        let max_entries = self.max_entries;
        match tokio::task::spawn_blocking(move || Self::scan(&project, max_entries)).await {
            Ok(lines) => lines,
            Err(e) => {
                warn!("Project overview failed: {}", e);
                Vec::new()
            }
        }
    }
}

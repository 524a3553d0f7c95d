use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PatchKind {
    Write,
    Create,
    Delete,
}

impl PatchKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            PatchKind::Write => "write",
            PatchKind::Create => "create",
            PatchKind::Delete => "delete",
        }
    }
}

/// One staged operation on one path.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PatchEntry {
    pub kind: PatchKind,
    pub relative_path: String,
    /// Full new content. Present for `write` and `create`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    pub tool_call_id: String,
}

impl PatchEntry {
    pub fn write(
        relative_path: impl Into<String>,
        content: impl Into<String>,
        tool_call_id: impl Into<String>,
    ) -> Self {
        Self {
            kind: PatchKind::Write,
            relative_path: relative_path.into(),
            content: Some(content.into()),
            tool_call_id: tool_call_id.into(),
        }
    }

    pub fn create(
        relative_path: impl Into<String>,
        content: impl Into<String>,
        tool_call_id: impl Into<String>,
    ) -> Self {
        Self {
            kind: PatchKind::Create,
            relative_path: relative_path.into(),
            content: Some(content.into()),
            tool_call_id: tool_call_id.into(),
        }
    }

    pub fn delete(relative_path: impl Into<String>, tool_call_id: impl Into<String>) -> Self {
        Self {
            kind: PatchKind::Delete,
            relative_path: relative_path.into(),
            content: None,
            tool_call_id: tool_call_id.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PatchSetManifest {
    pub patch_set_id: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub entries: Vec<PatchEntry>,
}

impl PatchSetManifest {
    pub fn new(patch_set_id: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            patch_set_id: patch_set_id.into(),
            created_at: now,
            updated_at: now,
            entries: Vec::new(),
        }
    }

    /// Replace the entry with the same tool call id and path, or append.
    pub fn upsert(&mut self, entry: PatchEntry) {
        let existing = self.entries.iter_mut().find(|e| {
            e.tool_call_id == entry.tool_call_id && e.relative_path == entry.relative_path
        });
        match existing {
            Some(slot) => *slot = entry,
            None => self.entries.push(entry),
        }
        self.updated_at = Utc::now();
    }

    /// Distinct paths in first-seen order.
    pub fn distinct_paths(&self) -> Vec<String> {
        distinct_paths(&self.entries)
    }

    /// The entry that wins for `relative_path` at apply time.
    pub fn last_entry_for(&self, relative_path: &str) -> Option<&PatchEntry> {
        self.entries
            .iter()
            .rev()
            .find(|e| e.relative_path == relative_path)
    }
}

pub(crate) fn distinct_paths(entries: &[PatchEntry]) -> Vec<String> {
    let mut seen = std::collections::HashSet::new();
    entries
        .iter()
        .filter(|e| seen.insert(e.relative_path.as_str()))
        .map(|e| e.relative_path.clone())
        .collect()
}

/// Listing row for a stored patch set.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PatchSetSummary {
    pub patch_set_id: String,
    pub entry_count: usize,
    pub updated_at: DateTime<Utc>,
}

impl From<&PatchSetManifest> for PatchSetSummary {
    fn from(manifest: &PatchSetManifest) -> Self {
        Self {
            patch_set_id: manifest.patch_set_id.clone(),
            entry_count: manifest.entries.len(),
            updated_at: manifest.updated_at,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_upsert_replaces_same_call_and_path() {
        let mut manifest = PatchSetManifest::new("p");
        manifest.upsert(PatchEntry::write("a.txt", "one", "call-1"));
        manifest.upsert(PatchEntry::write("b.txt", "two", "call-1"));
        manifest.upsert(PatchEntry::write("a.txt", "retry", "call-1"));
        manifest.upsert(PatchEntry::write("a.txt", "later", "call-2"));

        assert_eq!(manifest.entries.len(), 3);
        assert_eq!(manifest.entries[0].content.as_deref(), Some("retry"));
        assert_eq!(
            manifest.last_entry_for("a.txt").unwrap().content.as_deref(),
            Some("later")
        );
        assert_eq!(manifest.distinct_paths(), vec!["a.txt", "b.txt"]);
    }

    #[test]
    fn test_kind_serializes_lowercase() {
        let json = serde_json::to_value(PatchEntry::delete("a.txt", "c")).unwrap();
        assert_eq!(json["kind"], "delete");
        assert!(json.get("content").is_none());
    }
}

//! Concurrency key resolution.
//!
//! Each tool declares an [`AccessRule`]; [`KeyResolver`] applies it to the
//! call arguments and produces an [`Access`]: no keys, a set of canonical
//! resource keys, or exclusive access. In propose mode a file tool writes the
//! patch set manifest instead of the file, so it also holds the patch set
//! key. The resolver knows nothing about locking.

use std::collections::BTreeSet;
use std::path::PathBuf;

use serde_json::Value;

use crate::project::ProjectRoot;
use crate::tools::{Mode, ToolArguments, ToolInvocationContext};

/// A resource a mutating call holds while it runs.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ResourceKey {
    /// Canonical absolute file path.
    Path(PathBuf),
    /// Non-file resource such as a patch set id.
    Named(String),
}

impl ResourceKey {
    pub fn patch_set(patch_set_id: &str) -> Self {
        ResourceKey::Named(format!("patch-set:{}", patch_set_id))
    }
}

/// Per-tool declaration of which arguments name the touched resources.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessRule {
    /// Never mutates; runs without keys.
    ReadOnly,
    /// One path in a string argument.
    PathArgument(&'static str),
    /// Paths in `field` of each object in the `array` argument.
    PathList {
        array: &'static str,
        field: &'static str,
    },
    /// The invocation's patch set (named or defaulted).
    PatchSet,
    /// Serializes against every other mutating call.
    Exclusive,
}

/// Resolved access of one call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Access {
    ReadOnly,
    /// Non-empty, sorted.
    Keys(BTreeSet<ResourceKey>),
    Exclusive,
}

impl Access {
    pub fn is_mutating(&self) -> bool {
        !matches!(self, Access::ReadOnly)
    }
}

#[derive(Debug, Clone)]
pub struct KeyResolver {
    project: ProjectRoot,
}

impl KeyResolver {
    pub fn new(project: ProjectRoot) -> Self {
        Self { project }
    }

    /// Apply `rule` to `args`. Missing or malformed path arguments fall back
    /// to [`Access::Exclusive`].
    pub fn resolve(
        &self,
        rule: &AccessRule,
        args: &ToolArguments,
        invocation: &ToolInvocationContext,
    ) -> Access {
        let access = match rule {
            AccessRule::ReadOnly => return Access::ReadOnly,
            AccessRule::Exclusive => return Access::Exclusive,
            AccessRule::PatchSet => {
                return Access::Keys(BTreeSet::from([ResourceKey::patch_set(
                    &invocation.patch_set_id,
                )]))
            }
            AccessRule::PathArgument(name) => args
                .str(name)
                .and_then(|p| self.project.resource_key(p))
                .map(|key| Access::Keys(BTreeSet::from([ResourceKey::Path(key)])))
                .unwrap_or(Access::Exclusive),
            AccessRule::PathList { array, field } => {
                self.resolve_list(args.get(array), field)
            }
        };

        match (access, invocation.mode) {
            (Access::Keys(mut keys), Mode::Propose) => {
                keys.insert(ResourceKey::patch_set(&invocation.patch_set_id));
                Access::Keys(keys)
            }
            (access, _) => access,
        }
    }

    fn resolve_list(&self, value: Option<&Value>, field: &str) -> Access {
        let Some(items) = value.and_then(Value::as_array) else {
            return Access::Exclusive;
        };

        let mut keys = BTreeSet::new();
        for item in items {
            let key = item
                .get(field)
                .and_then(Value::as_str)
                .and_then(|p| self.project.resource_key(p));
            match key {
                Some(key) => {
                    keys.insert(ResourceKey::Path(key));
                }
                None => return Access::Exclusive,
            }
        }

        if keys.is_empty() {
            Access::Exclusive
        } else {
            Access::Keys(keys)
        }
    }
}

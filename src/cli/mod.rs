mod args;
mod paths;

pub use args::{CheckpointsAction, Cli, Commands, PatchesAction};
pub use paths::resolve_workspace_root;

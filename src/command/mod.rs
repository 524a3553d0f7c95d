mod checkpoints;
mod patches;
mod run;

pub use checkpoints::run_checkpoints;
pub use patches::run_patches;
pub use run::run_task;

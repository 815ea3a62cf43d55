//! Built-in task kinds.

mod bundles;
mod clean;
mod copy;
mod shell;

pub use bundles::BundlesTask;
pub use clean::{CleanTask, MkdirTask};
pub use copy::{CopyRule, CopyTask};
pub use shell::ShellTask;

//! Concrete [`coordination::Tool`] implementations bound into the runtime's
//! default [`coordination::ToolRegistry`].
//!
//! Tool names are chosen to line up with
//! `coordination::guardian::SecurityPolicy::RESTRICTED_TOOLS` and its
//! `self_modify_code`/`run_python_code` special cases, so the guardian's
//! gating logic is exercised against real tool invocations rather than
//! synthetic names.

mod delete_file;
mod list_directory;
mod read_local_file;
mod run_shell_command;
mod search_web;
mod self_modify_code;
mod write_local_file;

pub use delete_file::DeleteFile;
pub use list_directory::ListDirectory;
pub use read_local_file::ReadLocalFile;
pub use run_shell_command::RunShellCommand;
pub use search_web::SearchWeb;
pub use self_modify_code::SelfModifyCode;
pub use write_local_file::WriteLocalFile;

use coordination::ToolRegistry;
use std::sync::Arc;

/// Builds the registry of tools bound for every run. `brave_api_key`
/// configures `search_web`; without it the tool degrades to reporting
/// unavailability rather than failing outright, mirroring the original's
/// `SEARCH_AVAILABLE` guard.
pub fn build_default_registry(brave_api_key: Option<String>) -> ToolRegistry {
    let mut registry = ToolRegistry::new();
    registry.register(Arc::new(ReadLocalFile));
    registry.register(Arc::new(WriteLocalFile));
    registry.register(Arc::new(ListDirectory));
    registry.register(Arc::new(DeleteFile));
    registry.register(Arc::new(SelfModifyCode));
    registry.register(Arc::new(RunShellCommand));
    registry.register(Arc::new(SearchWeb::new(brave_api_key)));
    registry
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_registry_includes_restricted_tool_names() {
        let registry = build_default_registry(None);
        for name in ["delete_file", "run_shell_command", "self_modify_code"] {
            assert!(registry.contains(name), "missing {name}");
        }
    }
}

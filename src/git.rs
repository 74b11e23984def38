use std::path::Path;

use git2::Repository;

/// Best-effort current branch name for a working directory.
///
/// Returns `None` outside a git repository or on detached HEAD. Runs
/// in-process via libgit2, so it cannot hang the caller.
pub fn current_branch(cwd: &Path) -> Option<String> {
    let repo = Repository::discover(cwd).ok()?;
    let head = repo.head().ok()?;
    if head.is_branch() {
        head.shorthand().map(String::from)
    } else {
        None
    }
}

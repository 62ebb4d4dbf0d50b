use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::process::Command;

/// Project id used when the directory is not inside any repository.
pub const GLOBAL_PROJECT_ID: &str = "global";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Vcs {
    Git,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProjectTime {
    pub created: i64,
    pub initialized: i64,
}

/// VCS root descriptor for an instance directory.
///
/// `id` is the hash of the repository's root commit when a git worktree is
/// present, which makes it deterministic for a given (vcs, worktree) pair
/// and stable across runs. Outside any repository the id is the `"global"`
/// sentinel and the worktree is the instance directory itself.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Project {
    pub id: String,
    pub vcs: Option<Vcs>,
    pub worktree: PathBuf,
    pub time: ProjectTime,
}

impl Project {
    /// Resolve the project for `directory`.
    pub fn discover(directory: &Path) -> Self {
        let now = chrono::Utc::now().timestamp_millis();
        let time = ProjectTime {
            created: now,
            initialized: now,
        };

        if let Some(worktree) = git_worktree_root(directory) {
            if let Some(id) = git_root_commit(&worktree) {
                return Self {
                    id,
                    vcs: Some(Vcs::Git),
                    worktree,
                    time,
                };
            }
        }

        Self {
            id: GLOBAL_PROJECT_ID.to_string(),
            vcs: None,
            worktree: directory.to_path_buf(),
            time,
        }
    }
}

fn git_worktree_root(directory: &Path) -> Option<PathBuf> {
    let output = Command::new("git")
        .args(["rev-parse", "--show-toplevel"])
        .current_dir(directory)
        .output()
        .ok()?;

    if !output.status.success() {
        return None;
    }

    let root = String::from_utf8_lossy(&output.stdout).trim().to_string();
    if root.is_empty() {
        return None;
    }
    Some(PathBuf::from(root))
}

/// First root commit of the repository. Repositories with an unborn HEAD
/// (no commits yet) yield `None` and fall back to the global project.
fn git_root_commit(worktree: &Path) -> Option<String> {
    let output = Command::new("git")
        .args(["rev-list", "--max-parents=0", "HEAD"])
        .current_dir(worktree)
        .output()
        .ok()?;

    if !output.status.success() {
        return None;
    }

    let stdout = String::from_utf8_lossy(&output.stdout);
    let commit = stdout.lines().next()?.trim().to_string();
    if commit.is_empty() {
        return None;
    }
    Some(commit)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn git(dir: &Path, args: &[&str]) {
        let status = Command::new("git")
            .args(args)
            .current_dir(dir)
            .output()
            .expect("git runs");
        assert!(status.status.success(), "git {:?} failed", args);
    }

    #[test]
    fn test_non_git_directory_is_global() {
        let dir = TempDir::new().unwrap();
        // Guard against the temp dir accidentally living inside a repo.
        if git_worktree_root(dir.path()).is_some() {
            return;
        }

        let project = Project::discover(dir.path());
        assert_eq!(project.id, GLOBAL_PROJECT_ID);
        assert_eq!(project.vcs, None);
        assert_eq!(project.worktree, dir.path());
    }

    #[test]
    fn test_git_repo_id_is_root_commit_and_stable() {
        let dir = TempDir::new().unwrap();
        git(dir.path(), &["init", "-q"]);
        git(dir.path(), &["config", "user.email", "test@test"]);
        git(dir.path(), &["config", "user.name", "test"]);
        std::fs::write(dir.path().join("README.md"), "# test").unwrap();
        git(dir.path(), &["add", "."]);
        git(dir.path(), &["commit", "-q", "-m", "initial"]);

        let first = Project::discover(dir.path());
        assert_eq!(first.vcs, Some(Vcs::Git));
        assert_eq!(first.id.len(), 40);

        // A second commit must not change the id.
        std::fs::write(dir.path().join("more.txt"), "x").unwrap();
        git(dir.path(), &["add", "."]);
        git(dir.path(), &["commit", "-q", "-m", "second"]);
        let second = Project::discover(dir.path());
        assert_eq!(first.id, second.id);
    }

    #[test]
    fn test_empty_repo_falls_back_to_global() {
        let dir = TempDir::new().unwrap();
        git(dir.path(), &["init", "-q"]);

        let project = Project::discover(dir.path());
        assert_eq!(project.id, GLOBAL_PROJECT_ID);
    }

    #[test]
    fn test_subdirectory_resolves_worktree_root() {
        let dir = TempDir::new().unwrap();
        git(dir.path(), &["init", "-q"]);
        git(dir.path(), &["config", "user.email", "test@test"]);
        git(dir.path(), &["config", "user.name", "test"]);
        std::fs::write(dir.path().join("README.md"), "# test").unwrap();
        git(dir.path(), &["add", "."]);
        git(dir.path(), &["commit", "-q", "-m", "initial"]);

        let nested = dir.path().join("src/deep");
        std::fs::create_dir_all(&nested).unwrap();

        let project = Project::discover(&nested);
        assert_eq!(
            project.worktree.canonicalize().unwrap(),
            dir.path().canonicalize().unwrap()
        );
    }
}

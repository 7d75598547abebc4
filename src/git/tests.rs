//! Tests for GitManager

use crate::git::{GitManager, ReplayOutcome};
use git2::{Repository, Signature};
use std::fs;
use std::path::Path;
use tempfile::TempDir;

fn setup_test_repo() -> (TempDir, GitManager) {
    let temp_dir = TempDir::new().unwrap();
    let repo_path = temp_dir.path();

    let repo = Repository::init(repo_path).unwrap();

    let sig = Signature::now("Test User", "test@example.com").unwrap();
    let tree_id = {
        let mut index = repo.index().unwrap();
        fs::write(repo_path.join("test.txt"), "Hello, World!").unwrap();
        index.add_path(Path::new("test.txt")).unwrap();
        index.write().unwrap();
        index.write_tree().unwrap()
    };

    let tree = repo.find_tree(tree_id).unwrap();
    repo.commit(Some("HEAD"), &sig, &sig, "Initial commit", &tree, &[])
        .unwrap();

    let manager = GitManager::new(repo_path).unwrap();
    (temp_dir, manager)
}

fn commit_file(manager: &GitManager, name: &str, content: &str) -> git2::Oid {
    let workdir = manager.workdir().unwrap();
    fs::write(workdir.join(name), content).unwrap();
    manager.commit_all_if_dirty(&format!("write {}", name)).unwrap().unwrap()
}

/// Branch `feature` checked out in a worktree outside the main repo
fn feature_worktree(manager: &GitManager) -> (TempDir, GitManager) {
    let holder = TempDir::new().unwrap();
    let path = holder.path().join("wt");
    manager.add_worktree("feature/one", &path).unwrap();
    let wt = GitManager::new(&path).unwrap();
    (holder, wt)
}

#[test]
fn test_create_git_manager() {
    let (_temp_dir, manager) = setup_test_repo();
    assert!(manager.repo_path().exists());
    assert!(manager.workdir().is_some());
}

#[test]
fn test_create_branch_and_lookup() {
    let (_temp_dir, manager) = setup_test_repo();

    let branch = manager.create_branch("feature-test", false).unwrap();
    assert_eq!(branch.name, "feature-test");
    assert!(!branch.is_head);
    assert!(manager.branch_exists("feature-test"));
    assert_eq!(manager.branch_tip("feature-test").unwrap(), manager.head_oid().unwrap());
}

#[test]
fn test_create_branch_in_empty_repo() {
    let temp_dir = TempDir::new().unwrap();
    Repository::init(temp_dir.path()).unwrap();
    let manager = GitManager::new(temp_dir.path()).unwrap();

    let branch = manager.create_branch("work", false).unwrap();
    assert_eq!(branch.name, "work");
    assert!(manager.head_oid().is_ok());
}

#[test]
fn test_get_current_branch() {
    let (_temp_dir, manager) = setup_test_repo();

    let branch = manager.get_current_branch().unwrap();
    assert!(branch.is_head);
    assert!(branch.name == "main" || branch.name == "master");
    assert_eq!(manager.current_branch_name(), Some(branch.name));
}

#[test]
fn test_checkout_branch() {
    let (_temp_dir, manager) = setup_test_repo();

    manager.create_branch("baton/plan", false).unwrap();
    manager.checkout_branch("baton/plan").unwrap();
    assert_eq!(manager.current_branch_name().as_deref(), Some("baton/plan"));
}

#[test]
fn test_delete_branch() {
    let (_temp_dir, manager) = setup_test_repo();

    manager.create_branch("to-delete", false).unwrap();
    manager.delete_branch("to-delete").unwrap();
    assert!(!manager.branch_exists("to-delete"));
}

#[test]
fn test_commit_all_if_dirty() {
    let (temp_dir, manager) = setup_test_repo();

    assert!(!manager.is_dirty().unwrap());
    assert_eq!(manager.commit_all_if_dirty("nothing").unwrap(), None);

    fs::write(temp_dir.path().join("new.txt"), "new").unwrap();
    fs::remove_file(temp_dir.path().join("test.txt")).unwrap();
    assert!(manager.is_dirty().unwrap());

    let oid = manager.commit_all_if_dirty("baton: steps 1").unwrap();
    assert!(oid.is_some());
    assert!(!manager.is_dirty().unwrap());

    let repo = Repository::open(temp_dir.path()).unwrap();
    let tree = repo.head().unwrap().peel_to_tree().unwrap();
    assert!(tree.get_name("new.txt").is_some());
    assert!(tree.get_name("test.txt").is_none());
}

#[test]
fn test_worktree_add_list_remove() {
    let (_temp_dir, manager) = setup_test_repo();
    let holder = TempDir::new().unwrap();
    let path = holder.path().join("wt");

    let info = manager.add_worktree("baton/plan/run-1", &path).unwrap();
    assert_eq!(info.name, "baton-plan-run-1");
    assert_eq!(info.branch.as_deref(), Some("baton/plan/run-1"));
    assert!(path.join("test.txt").exists());
    assert_eq!(manager.list_worktrees().unwrap().len(), 1);

    manager.remove_worktree(&path).unwrap();
    assert!(!path.exists());
    assert!(manager.list_worktrees().unwrap().is_empty());
    // The branch outlives its worktree
    assert!(manager.branch_exists("baton/plan/run-1"));
    manager.delete_branch("baton/plan/run-1").unwrap();
}

#[test]
fn test_remove_unknown_worktree_fails() {
    let (temp_dir, manager) = setup_test_repo();
    assert!(manager.remove_worktree(&temp_dir.path().join("nope")).is_err());
}

#[test]
fn test_prune_orphaned_worktrees() {
    let (_temp_dir, manager) = setup_test_repo();
    let holder = TempDir::new().unwrap();
    let path = holder.path().join("wt");
    manager.add_worktree("orphan", &path).unwrap();

    fs::remove_dir_all(&path).unwrap();
    assert_eq!(manager.prune_orphaned_worktrees().unwrap(), 1);
    assert!(manager.list_worktrees().unwrap().is_empty());
}

#[test]
fn test_commit_range_is_oldest_first() {
    let (_temp_dir, manager) = setup_test_repo();
    let base = manager.head_oid().unwrap();
    let first = commit_file(&manager, "a.txt", "a");
    let second = commit_file(&manager, "b.txt", "b");

    let range = manager.commit_range(base, second).unwrap();
    assert_eq!(range, vec![first, second]);
    assert!(manager.commit_range(second, second).unwrap().is_empty());
}

#[test]
fn test_replay_applies_commits() {
    let (temp_dir, manager) = setup_test_repo();
    let (_holder, wt) = feature_worktree(&manager);
    let base = wt.head_oid().unwrap();
    commit_file(&wt, "a.txt", "from feature");
    let tip = commit_file(&wt, "b.txt", "more");

    let range = manager.commit_range(base, tip).unwrap();
    let outcome = manager.replay_commits(&range).unwrap();

    match outcome {
        ReplayOutcome::Applied { applied, skipped, head } => {
            assert_eq!(applied, 2);
            assert_eq!(skipped, 0);
            assert_eq!(head, manager.head_oid().unwrap().to_string());
        }
        other => panic!("unexpected outcome: {:?}", other),
    }
    assert_eq!(
        fs::read_to_string(temp_dir.path().join("a.txt")).unwrap(),
        "from feature"
    );
    assert!(temp_dir.path().join("b.txt").exists());
    assert!(!manager.is_dirty().unwrap());
}

#[test]
fn test_replay_skips_already_applied() {
    let (_temp_dir, manager) = setup_test_repo();
    let (_holder, wt) = feature_worktree(&manager);
    let base = wt.head_oid().unwrap();
    let tip = commit_file(&wt, "a.txt", "a");
    let range = manager.commit_range(base, tip).unwrap();

    manager.replay_commits(&range).unwrap();
    let head = manager.head_oid().unwrap();

    let outcome = manager.replay_commits(&range).unwrap();
    assert_eq!(
        outcome,
        ReplayOutcome::Applied {
            applied: 0,
            skipped: 1,
            head: head.to_string()
        }
    );
}

#[test]
fn test_replay_conflict_leaves_branch_untouched() {
    let (temp_dir, manager) = setup_test_repo();
    let (_holder, wt) = feature_worktree(&manager);
    let base = wt.head_oid().unwrap();
    commit_file(&wt, "other.txt", "fine");
    let tip = commit_file(&wt, "test.txt", "feature version");

    let before = commit_file(&manager, "test.txt", "main version");

    let range = manager.commit_range(base, tip).unwrap();
    match manager.replay_commits(&range).unwrap() {
        ReplayOutcome::Conflict { commit, paths, .. } => {
            assert_eq!(commit, tip.to_string());
            assert_eq!(paths, vec!["test.txt".to_string()]);
        }
        other => panic!("expected conflict, got {:?}", other),
    }

    // Neither commit of the range landed
    assert_eq!(manager.head_oid().unwrap(), before);
    assert!(!temp_dir.path().join("other.txt").exists());
    assert_eq!(
        fs::read_to_string(temp_dir.path().join("test.txt")).unwrap(),
        "main version"
    );
}

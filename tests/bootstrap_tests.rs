mod common;

use assert_matches::assert_matches;
use common::*;
use keepsync::progress::Level;
use keepsync::{BootstrapRequest, GitClient, SyncError};
use std::path::Path;

fn request(path: &Path, name: &str) -> BootstrapRequest {
    let mut request = BootstrapRequest::new(path, name);
    request.token = Some("test-token".to_string());
    request.project_id = Some(1);
    request
}

/// Push `files` as a commit on `main` of the hosted repo, from a scratch clone
fn push_to_hosted(env: &TestEnvironment, remote: &Path, files: &[(&str, &str)]) {
    let scratch = env.path().join("scratch");
    init_repo(&scratch);
    for (name, content) in files {
        std::fs::write(scratch.join(name), content).unwrap();
    }
    git(&scratch, &["add", "--all"]);
    git(&scratch, &["commit", "--quiet", "-m", "from elsewhere"]);
    git(&scratch, &["remote", "add", "origin", &remote.to_string_lossy()]);
    git(&scratch, &["push", "--quiet", "origin", "main"]);
}

#[tokio::test]
async fn test_bootstrap_creates_repository_and_pushes() {
    let env = TestEnvironment::new();
    let hosting = LocalHosting::new(env.hosting_root());
    let sink = RecordingSink::new();
    let git_client = GitClient::new(&env.config);

    let folder = env.folder("notes");
    std::fs::write(folder.join("todo.md"), "- write tests\n").unwrap();

    let url = git_client
        .bootstrap_and_push(&request(&folder, "notes"), &hosting, &sink)
        .await
        .unwrap();

    let remote = hosting.repo_path("notes");
    assert_eq!(url, remote.to_string_lossy());
    assert!(folder.join(".gitignore").exists());
    assert_eq!(git(&folder, &["rev-parse", "HEAD"]), git(&remote, &["rev-parse", "main"]));
    assert_eq!(commit_count(&remote, "main"), 1);
    assert_eq!(git(&folder, &["log", "-1", "--format=%s"]), "Initial commit by keepsync");
    assert_eq!(git(&folder, &["branch", "--show-current"]), "main");

    assert!(sink
        .messages(Level::Success)
        .contains(&"Created repository tester/notes".to_string()));
    assert!(sink.messages(Level::Warning).is_empty());
}

#[tokio::test]
async fn test_bootstrap_is_idempotent() {
    let env = TestEnvironment::new();
    let hosting = LocalHosting::new(env.hosting_root());
    let git_client = GitClient::new(&env.config);

    let folder = env.folder("notes");
    std::fs::write(folder.join("todo.md"), "- write tests\n").unwrap();

    let first_sink = RecordingSink::new();
    let first = git_client
        .bootstrap_and_push(&request(&folder, "notes"), &hosting, &first_sink)
        .await
        .unwrap();

    let second_sink = RecordingSink::new();
    let second = git_client
        .bootstrap_and_push(&request(&folder, "notes"), &hosting, &second_sink)
        .await
        .unwrap();

    let remote = hosting.repo_path("notes");
    assert_eq!(first, second);
    assert_eq!(commit_count(&folder, "HEAD"), 1);
    assert_eq!(commit_count(&remote, "main"), 1);
    assert_eq!(git(&folder, &["rev-parse", "HEAD"]), git(&remote, &["rev-parse", "main"]));
    assert!(second_sink
        .messages(Level::Info)
        .iter()
        .any(|m| m.starts_with("Using existing repository tester/notes")));
    assert!(second_sink.messages(Level::Warning).is_empty());
}

#[tokio::test]
async fn test_bootstrap_keeps_existing_gitignore() {
    let env = TestEnvironment::new();
    let hosting = LocalHosting::new(env.hosting_root());
    let git_client = GitClient::new(&env.config);

    let folder = env.folder("site");
    std::fs::write(folder.join(".gitignore"), "public/\n").unwrap();
    std::fs::write(folder.join("index.html"), "<h1>hi</h1>\n").unwrap();

    git_client
        .bootstrap_and_push(&request(&folder, "site"), &hosting, &RecordingSink::new())
        .await
        .unwrap();

    assert_eq!(std::fs::read_to_string(folder.join(".gitignore")).unwrap(), "public/\n");
}

#[tokio::test]
async fn test_bootstrap_uses_gitignore_template() {
    let env = TestEnvironment::new();
    let hosting = LocalHosting::new(env.hosting_root());
    let git_client = GitClient::new(&env.config);

    let folder = env.folder("data");
    std::fs::write(folder.join("a.csv"), "1,2\n").unwrap();

    let mut req = request(&folder, "data");
    req.gitignore_template = Some("*.parquet\n".to_string());
    git_client
        .bootstrap_and_push(&req, &hosting, &RecordingSink::new())
        .await
        .unwrap();

    assert_eq!(std::fs::read_to_string(folder.join(".gitignore")).unwrap(), "*.parquet\n");
}

#[tokio::test]
async fn test_bootstrap_merges_unrelated_remote_history() {
    let env = TestEnvironment::new();
    let hosting = LocalHosting::new(env.hosting_root());
    let sink = RecordingSink::new();
    let git_client = GitClient::new(&env.config);

    let remote = hosting.seed("notes");
    push_to_hosted(&env, &remote, &[("LICENSE", "MIT\n")]);

    let folder = env.folder("notes");
    std::fs::write(folder.join("todo.md"), "- write tests\n").unwrap();

    git_client
        .bootstrap_and_push(&request(&folder, "notes"), &hosting, &sink)
        .await
        .unwrap();

    assert_eq!(git(&folder, &["rev-parse", "HEAD"]), git(&remote, &["rev-parse", "main"]));
    assert_eq!(git(&remote, &["show", "main:LICENSE"]), "MIT");
    assert_eq!(git(&remote, &["show", "main:todo.md"]), "- write tests");
    assert!(sink.messages(Level::Warning).is_empty());
    assert!(sink.messages(Level::Info).contains(&"Merged remote history".to_string()));
}

#[tokio::test]
async fn test_bootstrap_overwrites_remote_when_merge_fails() {
    let env = TestEnvironment::new();
    let hosting = LocalHosting::new(env.hosting_root());
    let sink = RecordingSink::new();
    let git_client = GitClient::new(&env.config);

    let remote = hosting.seed("notes");
    push_to_hosted(&env, &remote, &[("todo.md", "- something else entirely\n")]);

    let folder = env.folder("notes");
    std::fs::write(folder.join("todo.md"), "- write tests\n").unwrap();

    git_client
        .bootstrap_and_push(&request(&folder, "notes"), &hosting, &sink)
        .await
        .unwrap();

    // Local content wins and the merge left nothing behind
    assert_eq!(git(&folder, &["rev-parse", "HEAD"]), git(&remote, &["rev-parse", "main"]));
    assert_eq!(git(&remote, &["show", "main:todo.md"]), "- write tests");
    assert_eq!(commit_count(&remote, "main"), 1);
    assert!(!folder.join(".git").join("MERGE_HEAD").exists());

    let warnings = sink.messages(Level::Warning);
    assert_eq!(warnings.len(), 1);
    assert!(warnings[0].contains("overwritten"));
}

#[tokio::test]
async fn test_bootstrap_into_empty_existing_repository() {
    let env = TestEnvironment::new();
    let hosting = LocalHosting::new(env.hosting_root());
    let sink = RecordingSink::new();
    let git_client = GitClient::new(&env.config);

    let remote = hosting.seed("notes");
    let folder = env.folder("notes");
    std::fs::write(folder.join("todo.md"), "- write tests\n").unwrap();

    git_client
        .bootstrap_and_push(&request(&folder, "notes"), &hosting, &sink)
        .await
        .unwrap();

    assert_eq!(git(&folder, &["rev-parse", "HEAD"]), git(&remote, &["rev-parse", "main"]));
    assert!(sink.messages(Level::Warning).is_empty());
    assert!(sink
        .messages(Level::Info)
        .iter()
        .any(|m| m.contains("(0 commits)")));
}

#[tokio::test]
async fn test_bootstrap_adopts_existing_local_repository() {
    let env = TestEnvironment::new();
    let hosting = LocalHosting::new(env.hosting_root());
    let git_client = GitClient::new(&env.config);

    let folder = env.path().join("legacy");
    init_repo(&folder);
    git(&folder, &["checkout", "--quiet", "-b", "trunk"]);
    std::fs::write(folder.join("main.c"), "int main() { return 0; }\n").unwrap();
    git(&folder, &["add", "--all"]);
    git(&folder, &["commit", "--quiet", "-m", "first"]);

    git_client
        .bootstrap_and_push(&request(&folder, "legacy"), &hosting, &RecordingSink::new())
        .await
        .unwrap();

    let remote = hosting.repo_path("legacy");
    // History is kept, the branch is renamed and the new ignore file committed
    assert_eq!(git(&folder, &["branch", "--show-current"]), "main");
    assert_eq!(commit_count(&remote, "main"), 2);
    assert_eq!(git(&remote, &["show", "main:main.c"]), "int main() { return 0; }");
}

#[tokio::test]
async fn test_bootstrap_requires_token() {
    let env = TestEnvironment::new();
    let hosting = LocalHosting::new(env.hosting_root());
    let git_client = GitClient::new(&env.config);
    let folder = env.folder("notes");

    let mut req = request(&folder, "notes");
    req.token = None;

    let result = git_client
        .bootstrap_and_push(&req, &hosting, &RecordingSink::new())
        .await;
    assert_matches!(result, Err(SyncError::MissingCredentials));
    assert!(!hosting.repo_path("notes").exists());
}

#[tokio::test]
async fn test_bootstrap_folder_with_nothing_to_track() {
    let env = TestEnvironment::new();
    let hosting = LocalHosting::new(env.hosting_root());
    let sink = RecordingSink::new();
    let git_client = GitClient::new(&env.config);

    // The ignore file hides everything, itself included
    let folder = env.folder("scratch");
    std::fs::write(folder.join(".gitignore"), "*\n").unwrap();
    std::fs::write(folder.join("notes.tmp"), "draft\n").unwrap();

    let url = git_client
        .bootstrap_and_push(&request(&folder, "scratch"), &hosting, &sink)
        .await
        .unwrap();

    let remote = hosting.repo_path("scratch");
    assert_eq!(url, remote.to_string_lossy());
    assert_eq!(commit_count(&remote, "main"), 1);
    assert_eq!(git(&folder, &["rev-parse", "HEAD"]), git(&remote, &["rev-parse", "main"]));
    assert_eq!(git(&remote, &["ls-tree", "-r", "--name-only", "main"]), "");
    assert!(sink.messages(Level::Info).iter().any(|m| m.contains("empty initial commit")));

    // Repeating it does not pile up empty commits
    git_client
        .bootstrap_and_push(&request(&folder, "scratch"), &hosting, &sink)
        .await
        .unwrap();
    assert_eq!(commit_count(&remote, "main"), 1);
}

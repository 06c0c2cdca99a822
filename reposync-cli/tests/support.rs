//! Shared fixtures: a throwaway `$HOME` and a bare git remote to clone from.

#![allow(dead_code)]

use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;

use git2::{Commit, Repository, RepositoryInitOptions, Signature};
use tempfile::TempDir;

pub fn reposync_cmd(home: &Path) -> Command {
    let mut cmd = Command::new(assert_cmd::cargo::cargo_bin!("reposync"));
    cmd.env("HOME", home)
        .env("USERPROFILE", home)
        .env_remove("GITHUB_TOKEN")
        .env_remove("RUST_LOG");
    cmd
}

/// A bare remote on `main` with one commit, plus a working copy that
/// publishes to it.
pub struct Remote {
    pub dir: TempDir,
    upstream: Repository,
}

impl Remote {
    pub fn new() -> Self {
        let dir = TempDir::new().expect("remote dir");
        let mut bare = RepositoryInitOptions::new();
        bare.bare(true).initial_head("main");
        Repository::init_opts(dir.path().join("remote.git"), &bare).expect("init bare");

        let mut work = RepositoryInitOptions::new();
        work.initial_head("main");
        let upstream =
            Repository::init_opts(dir.path().join("upstream"), &work).expect("init upstream");
        upstream
            .remote("origin", dir.path().join("remote.git").to_str().expect("utf-8"))
            .expect("add origin");

        let remote = Self { dir, upstream };
        remote.publish("README.md", "# wiki\n");
        remote
    }

    pub fn url(&self) -> String {
        self.dir
            .path()
            .join("remote.git")
            .to_str()
            .expect("utf-8")
            .to_string()
    }

    pub fn publish(&self, rel: &str, contents: &str) {
        let workdir = self.upstream.workdir().expect("non-bare");
        let path = workdir.join(rel);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).expect("create parent");
        }
        fs::write(&path, contents).expect("write file");

        let mut index = self.upstream.index().expect("index");
        index.add_path(Path::new(rel)).expect("stage");
        index.write().expect("write index");
        let tree = self
            .upstream
            .find_tree(index.write_tree().expect("write tree"))
            .expect("find tree");
        let sig = Signature::now("Tester", "tester@example.com").expect("signature");
        let parents: Vec<Commit<'_>> = self
            .upstream
            .head()
            .ok()
            .and_then(|h| h.peel_to_commit().ok())
            .into_iter()
            .collect();
        let parent_refs: Vec<&Commit<'_>> = parents.iter().collect();
        self.upstream
            .commit(Some("HEAD"), &sig, &sig, &format!("update {rel}"), &tree, &parent_refs)
            .expect("commit");
        self.upstream
            .find_remote("origin")
            .expect("origin")
            .push(&["refs/heads/main:refs/heads/main"], None)
            .expect("push");
    }
}

pub fn clone_dir(home: &Path, id: &str) -> PathBuf {
    home.join(".reposync/repos").join(id)
}

pub fn stdout_json(output: &std::process::Output) -> serde_json::Value {
    serde_json::from_slice(&output.stdout).unwrap_or_else(|e| {
        panic!(
            "stdout is not JSON ({e}): {}",
            String::from_utf8_lossy(&output.stdout)
        )
    })
}

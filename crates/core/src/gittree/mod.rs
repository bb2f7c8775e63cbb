//! GitTree entity: per-repository tree cache
//!
//! Caches GitHub tree listings with a TTL keyed by branch class, tracks
//! commits and branches from push webhooks, and serves glob search over
//! the cached file set. Webhooks invalidate lazily; an hourly alarm does
//! the physical cleanup.

pub mod github;
pub mod model;
pub mod store;

use async_trait::async_trait;
use chrono::{Duration, Utc};
use serde_json::{json, Value};

use crate::error::Error;
use crate::request::{EntityRequest, EntityResponse, Method};
use crate::runtime::storage::{now_rfc3339, parse_rfc3339};
use crate::runtime::{Entity, EntityContext};
use crate::Result;

use github::GitHubClient;
pub use model::*;

const SHORT_TTL_BRANCHES: [&str; 4] = ["main", "master", "develop", "development"];
const CLEANUP_INTERVAL_HOURS: i64 = 1;

pub struct GitTree {
    ctx: EntityContext,
    github: GitHubClient,
}

#[async_trait]
impl Entity for GitTree {
    fn kind() -> &'static str {
        "gittree"
    }

    fn create(ctx: EntityContext) -> Result<Self> {
        store::bootstrap(&ctx.conn)?;
        let github = GitHubClient::new(ctx.github_token.clone());
        ctx.alarm
            .schedule(Utc::now() + Duration::hours(CLEANUP_INTERVAL_HOURS));
        Ok(Self { ctx, github })
    }

    async fn handle(&mut self, req: EntityRequest) -> Result<EntityResponse> {
        let segments = req.segments();
        match (req.method, segments.as_slice()) {
            (Method::Get, ["tree"]) => self.list_tree(&req).await,
            (Method::Get, ["file"]) => self.get_file(&req).await,
            (Method::Get, ["commits"]) => self.list_commits(&req),
            (Method::Get, ["compare"]) => self.compare(&req).await,
            (Method::Get, ["search"]) => self.search(&req).await,
            (Method::Get, ["branches"]) => self.list_branches(),
            (Method::Get, ["repo"]) => self.get_repo(),
            (Method::Post, ["repo"]) => self.configure_repo(req.parse_body()?),
            (Method::Post, ["webhook"]) => self.webhook(req.parse_body()?),
            (
                _,
                ["tree"] | ["file"] | ["commits"] | ["compare"] | ["search"] | ["branches"]
                | ["repo"] | ["webhook"],
            ) => Err(Error::MethodNotAllowed),
            _ => Err(Error::not_found(format!("No route for {}", req.path))),
        }
    }

    async fn on_alarm(&mut self) -> Result<()> {
        store::cleanup(&self.ctx.conn, &now_rfc3339())?;
        self.ctx
            .alarm
            .schedule(Utc::now() + Duration::hours(CLEANUP_INTERVAL_HOURS));
        Ok(())
    }
}

impl GitTree {
    async fn list_tree(&mut self, req: &EntityRequest) -> Result<EntityResponse> {
        let repo = self.ensure_repo()?;
        let refresh = req.query_flag("refresh");
        let path = req.query_param("path").unwrap_or("").trim_matches('/').to_string();
        let depth = req.query_i64("depth").unwrap_or(-1);

        let (snapshot, cached) = match req.query_param("sha") {
            Some(sha) => {
                self.ensure_sha_tree(&repo, sha, refresh).await?
            }
            None => {
                let branch = req
                    .query_param("branch")
                    .unwrap_or(&repo.default_branch)
                    .to_string();
                self.ensure_branch_tree(&repo, &branch, refresh).await?
            }
        };

        let files = store::files_for_tree(&self.ctx.conn, &snapshot.tree_id)?;
        let filtered = filter_files(files, &path, depth);
        Ok(EntityResponse::ok(json!({
            "tree": snapshot,
            "files": filtered,
            "cached": cached,
        })))
    }

    async fn get_file(&mut self, req: &EntityRequest) -> Result<EntityResponse> {
        let repo = self.ensure_repo()?;
        let path = req
            .query_param("path")
            .ok_or_else(|| Error::validation("path is required"))?;
        let git_ref = req
            .query_param("ref")
            .or(req.query_param("branch"))
            .unwrap_or(&repo.default_branch);
        let content = self
            .github
            .file_content(&repo.owner, &repo.name, path, git_ref)
            .await?;
        Ok(EntityResponse::ok(json!({
            "path": path,
            "ref": git_ref,
            "content": content,
        })))
    }

    fn list_commits(&self, req: &EntityRequest) -> Result<EntityResponse> {
        let limit = req.query_usize("limit").unwrap_or(50).clamp(1, 500);
        let commits = store::list_commits(&self.ctx.conn, req.query_param("branch"), limit)?;
        Ok(EntityResponse::ok(json!({ "commits": commits })))
    }

    async fn compare(&mut self, req: &EntityRequest) -> Result<EntityResponse> {
        let repo = self.ensure_repo()?;
        let base = req
            .query_param("base")
            .ok_or_else(|| Error::validation("base is required"))?;
        let head = req
            .query_param("head")
            .ok_or_else(|| Error::validation("head is required"))?;
        let body = self.github.compare(&repo.owner, &repo.name, base, head).await?;

        let commits: Vec<Value> = body["commits"]
            .as_array()
            .map(|commits| {
                commits
                    .iter()
                    .map(|c| {
                        json!({
                            "sha": c["sha"],
                            "message": c["commit"]["message"],
                            "author": c["commit"]["author"]["name"],
                        })
                    })
                    .collect()
            })
            .unwrap_or_default();
        let files: Vec<Value> = body["files"]
            .as_array()
            .map(|files| {
                files
                    .iter()
                    .map(|f| {
                        json!({
                            "path": f["filename"],
                            "status": f["status"],
                            "additions": f["additions"],
                            "deletions": f["deletions"],
                        })
                    })
                    .collect()
            })
            .unwrap_or_default();

        Ok(EntityResponse::ok(json!({
            "base": base,
            "head": head,
            "status": body["status"],
            "aheadBy": body["ahead_by"],
            "behindBy": body["behind_by"],
            "commits": commits,
            "files": files,
        })))
    }

    async fn search(&mut self, req: &EntityRequest) -> Result<EntityResponse> {
        let repo = self.ensure_repo()?;
        let pattern = req
            .query_param("pattern")
            .ok_or_else(|| Error::validation("pattern is required"))?
            .to_string();
        let branch = req
            .query_param("branch")
            .unwrap_or(&repo.default_branch)
            .to_string();
        let (snapshot, _) = self.ensure_branch_tree(&repo, &branch, false).await?;
        let like = glob_to_like(&pattern);
        let files = store::search_files(&self.ctx.conn, &snapshot.tree_id, &like)?;
        Ok(EntityResponse::ok(json!({
            "pattern": pattern,
            "branch": branch,
            "files": files,
        })))
    }

    fn list_branches(&self) -> Result<EntityResponse> {
        let branches = store::list_branches(&self.ctx.conn)?;
        Ok(EntityResponse::ok(json!({ "branches": branches })))
    }

    fn get_repo(&mut self) -> Result<EntityResponse> {
        let repo = self.ensure_repo()?;
        Ok(EntityResponse::ok(json!({ "repo": repo })))
    }

    fn configure_repo(&mut self, req: RepoConfigRequest) -> Result<EntityResponse> {
        if req.owner.trim().is_empty() || req.name.trim().is_empty() {
            return Err(Error::validation("owner and name are required"));
        }
        let existing = store::get_repo(&self.ctx.conn)?;
        let repo = RepoInfo {
            repo_id: self.ctx.name.clone(),
            owner: req.owner,
            name: req.name,
            default_branch: req
                .default_branch
                .or(existing.as_ref().map(|r| r.default_branch.clone()))
                .unwrap_or_else(|| "main".to_string()),
            last_synced_at: existing.as_ref().and_then(|r| r.last_synced_at.clone()),
            last_commit_sha: existing.as_ref().and_then(|r| r.last_commit_sha.clone()),
            total_files: existing.map(|r| r.total_files).unwrap_or(0),
        };
        store::upsert_repo(&self.ctx.conn, &repo)?;
        Ok(EntityResponse::ok(json!({ "repo": repo })))
    }

    /// Track pushed commits, move the branch pointer, and lazily expire
    /// the branch cache.
    fn webhook(&mut self, payload: PushWebhook) -> Result<EntityResponse> {
        let branch = payload
            .git_ref
            .strip_prefix("refs/heads/")
            .ok_or_else(|| Error::validation(format!("Unsupported ref: {}", payload.git_ref)))?
            .to_string();

        let mut parent: Option<String> = None;
        let mut tracked = 0usize;
        for commit in &payload.commits {
            let now = now_rfc3339();
            store::track_commit(
                &self.ctx.conn,
                &TrackedCommit {
                    sha: commit.id.clone(),
                    message: commit.message.clone(),
                    author: commit
                        .author
                        .as_ref()
                        .and_then(|a| a.name.clone())
                        .unwrap_or_else(|| "unknown".to_string()),
                    author_email: commit.author.as_ref().and_then(|a| a.email.clone()),
                    timestamp: if commit.timestamp.is_empty() {
                        now.clone()
                    } else {
                        commit.timestamp.clone()
                    },
                    parent_sha: parent.clone(),
                    branch: Some(branch.clone()),
                    tracked_at: now.clone(),
                },
            )?;
            for (paths, change_type) in [
                (&commit.added, ChangeType::Added),
                (&commit.modified, ChangeType::Modified),
                (&commit.removed, ChangeType::Deleted),
            ] {
                for path in paths {
                    store::track_file_change(
                        &self.ctx.conn,
                        &FileChange {
                            commit_sha: commit.id.clone(),
                            path: path.clone(),
                            change_type,
                            old_path: None,
                            additions: 0,
                            deletions: 0,
                            tracked_at: now.clone(),
                        },
                    )?;
                }
            }
            parent = Some(commit.id.clone());
            tracked += 1;
        }

        store::expire_tree(&self.ctx.conn, &branch_key(&branch))?;
        if let Some(head) = payload.commits.last() {
            store::upsert_branch(&self.ctx.conn, &branch, &head.id)?;
        }

        Ok(EntityResponse::ok(json!({
            "success": true,
            "branch": branch,
            "commitsTracked": tracked,
        })))
    }

    /// Serve the branch tree from cache, refreshing from GitHub when the
    /// snapshot is missing, expired, or a refresh was forced.
    async fn ensure_branch_tree(
        &mut self,
        repo: &RepoInfo,
        branch: &str,
        refresh: bool,
    ) -> Result<(TreeSnapshot, bool)> {
        let tree_id = branch_key(branch);
        if !refresh {
            if let Some(snapshot) = store::get_tree(&self.ctx.conn, &tree_id)? {
                if !is_expired(&snapshot.expires_at) {
                    return Ok((snapshot, true));
                }
            }
        }

        let head = self
            .github
            .branch_head(&repo.owner, &repo.name, branch)
            .await?;
        let snapshot = self
            .fetch_and_store(repo, &tree_id, branch, &head.commit_sha, branch_ttl(branch))
            .await?;
        store::upsert_branch(&self.ctx.conn, branch, &head.commit_sha)?;
        Ok((snapshot, false))
    }

    /// Frozen snapshot for a commit sha (7-day TTL).
    async fn ensure_sha_tree(
        &mut self,
        repo: &RepoInfo,
        sha: &str,
        refresh: bool,
    ) -> Result<(TreeSnapshot, bool)> {
        let tree_id = format!("sha-{}", sha);
        if !refresh {
            if let Some(snapshot) = store::get_tree(&self.ctx.conn, &tree_id)? {
                if !is_expired(&snapshot.expires_at) {
                    return Ok((snapshot, true));
                }
            }
        }
        let snapshot = self
            .fetch_and_store(repo, &tree_id, sha, sha, Duration::days(7))
            .await?;
        Ok((snapshot, false))
    }

    async fn fetch_and_store(
        &mut self,
        repo: &RepoInfo,
        tree_id: &str,
        branch: &str,
        commit_sha: &str,
        ttl: Duration,
    ) -> Result<TreeSnapshot> {
        let remote = self
            .github
            .tree(&repo.owner, &repo.name, commit_sha)
            .await?;
        let files: Vec<TreeFile> = remote
            .tree
            .iter()
            .map(|entry| TreeFile {
                path: entry.path.clone(),
                file_type: FileType::parse(&entry.entry_type),
                sha: entry.sha.clone(),
                size: entry.size,
                mode: entry.mode.clone(),
            })
            .collect();

        let now = Utc::now();
        let snapshot = TreeSnapshot {
            tree_id: tree_id.to_string(),
            tree_sha: remote.sha,
            branch: branch.to_string(),
            commit_sha: commit_sha.to_string(),
            truncated: remote.truncated,
            file_count: files.len() as i64,
            cached_at: now.to_rfc3339(),
            expires_at: (now + ttl).to_rfc3339(),
        };
        store::replace_tree(&self.ctx.conn, &snapshot, &files)?;

        let mut repo = repo.clone();
        repo.last_synced_at = Some(now.to_rfc3339());
        repo.last_commit_sha = Some(commit_sha.to_string());
        repo.total_files = files.len() as i64;
        store::upsert_repo(&self.ctx.conn, &repo)?;

        Ok(snapshot)
    }

    /// Load the repo row, deriving owner/name from the entity name
    /// (`owner/repo`) on first contact.
    fn ensure_repo(&mut self) -> Result<RepoInfo> {
        if let Some(repo) = store::get_repo(&self.ctx.conn)? {
            return Ok(repo);
        }
        let (owner, name) = match self.ctx.name.split_once('/') {
            Some((owner, name)) => (owner.to_string(), name.to_string()),
            None => (self.ctx.name.clone(), self.ctx.name.clone()),
        };
        let repo = RepoInfo {
            repo_id: self.ctx.name.clone(),
            owner,
            name,
            default_branch: "main".to_string(),
            last_synced_at: None,
            last_commit_sha: None,
            total_files: 0,
        };
        store::upsert_repo(&self.ctx.conn, &repo)?;
        Ok(repo)
    }
}

fn branch_key(branch: &str) -> String {
    format!("branch-{}", branch)
}

/// Trunk branches churn fastest and get the shortest TTL.
fn branch_ttl(branch: &str) -> Duration {
    if SHORT_TTL_BRANCHES.contains(&branch) {
        Duration::minutes(15)
    } else {
        Duration::hours(1)
    }
}

fn is_expired(expires_at: &str) -> bool {
    parse_rfc3339(expires_at)
        .map(|at| at <= Utc::now())
        .unwrap_or(true)
}

/// Scope to `path` (itself or descendants) and bound by `depth` segments
/// below it; `-1` means unlimited.
fn filter_files(files: Vec<TreeFile>, path: &str, depth: i64) -> Vec<TreeFile> {
    files
        .into_iter()
        .filter(|file| {
            let relative = if path.is_empty() {
                Some(file.path.as_str())
            } else if file.path == path {
                Some("")
            } else {
                file.path
                    .strip_prefix(path)
                    .and_then(|rest| rest.strip_prefix('/'))
            };
            let Some(relative) = relative else {
                return false;
            };
            if depth < 0 || relative.is_empty() {
                return true;
            }
            relative.split('/').count() as i64 <= depth
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::storage::open_in_memory;

    fn tree_entity() -> GitTree {
        let ctx = EntityContext::new("acme/widgets", open_in_memory().unwrap());
        GitTree::create(ctx).unwrap()
    }

    fn snapshot(tree_id: &str, branch: &str, expires_in: Duration) -> TreeSnapshot {
        let now = Utc::now();
        TreeSnapshot {
            tree_id: tree_id.to_string(),
            tree_sha: "t-sha".to_string(),
            branch: branch.to_string(),
            commit_sha: "c-sha".to_string(),
            truncated: false,
            file_count: 0,
            cached_at: now.to_rfc3339(),
            expires_at: (now + expires_in).to_rfc3339(),
        }
    }

    fn file(path: &str) -> TreeFile {
        TreeFile {
            path: path.to_string(),
            file_type: FileType::Blob,
            sha: format!("sha-{}", path),
            size: Some(10),
            mode: Some("100644".to_string()),
        }
    }

    #[tokio::test]
    async fn cached_tree_serves_without_fetching() {
        let mut entity = tree_entity();
        entity.ensure_repo().unwrap();
        let files = vec![file("src/lib.rs"), file("src/api/mod.rs"), file("README.md")];
        store::replace_tree(
            &entity.ctx.conn,
            &snapshot("branch-main", "main", Duration::minutes(15)),
            &files,
        )
        .unwrap();

        let resp = entity
            .handle(EntityRequest::new(Method::Get, "/tree"))
            .await
            .unwrap();
        assert_eq!(resp.body["cached"], true);
        assert_eq!(resp.body["files"].as_array().unwrap().len(), 3);
    }

    #[tokio::test]
    async fn tree_filters_by_path_and_depth() {
        let mut entity = tree_entity();
        entity.ensure_repo().unwrap();
        let files = vec![
            file("src/lib.rs"),
            file("src/api/mod.rs"),
            file("src/api/deep/handler.rs"),
            file("src-other/file.rs"),
            file("README.md"),
        ];
        store::replace_tree(
            &entity.ctx.conn,
            &snapshot("branch-main", "main", Duration::minutes(15)),
            &files,
        )
        .unwrap();

        let scoped = entity
            .handle(
                EntityRequest::new(Method::Get, "/tree").with_query("path", "src"),
            )
            .await
            .unwrap();
        let paths: Vec<&str> = scoped.body["files"]
            .as_array()
            .unwrap()
            .iter()
            .map(|f| f["path"].as_str().unwrap())
            .collect();
        // Path scoping is boundary-safe: src-other does not match src.
        assert_eq!(paths, vec!["src/api/deep/handler.rs", "src/api/mod.rs", "src/lib.rs"]);

        let shallow = entity
            .handle(
                EntityRequest::new(Method::Get, "/tree")
                    .with_query("path", "src")
                    .with_query("depth", "2"),
            )
            .await
            .unwrap();
        let paths: Vec<&str> = shallow.body["files"]
            .as_array()
            .unwrap()
            .iter()
            .map(|f| f["path"].as_str().unwrap())
            .collect();
        assert_eq!(paths, vec!["src/api/mod.rs", "src/lib.rs"]);
    }

    #[tokio::test]
    async fn search_uses_glob_pattern() {
        let mut entity = tree_entity();
        entity.ensure_repo().unwrap();
        let files = vec![file("src/lib.rs"), file("src/api/mod.rs"), file("docs/guide.md")];
        store::replace_tree(
            &entity.ctx.conn,
            &snapshot("branch-main", "main", Duration::minutes(15)),
            &files,
        )
        .unwrap();

        let resp = entity
            .handle(
                EntityRequest::new(Method::Get, "/search").with_query("pattern", "**/*.rs"),
            )
            .await
            .unwrap();
        let paths: Vec<&str> = resp.body["files"]
            .as_array()
            .unwrap()
            .iter()
            .map(|f| f["path"].as_str().unwrap())
            .collect();
        assert_eq!(paths, vec!["src/api/mod.rs", "src/lib.rs"]);
    }

    #[tokio::test]
    async fn webhook_tracks_commits_and_expires_branch_cache() {
        let mut entity = tree_entity();
        entity.ensure_repo().unwrap();
        store::replace_tree(
            &entity.ctx.conn,
            &snapshot("branch-main", "main", Duration::minutes(15)),
            &[file("src/lib.rs")],
        )
        .unwrap();

        let resp = entity
            .handle(EntityRequest::new(Method::Post, "/webhook").with_body(json!({
                "ref": "refs/heads/main",
                "commits": [
                    {
                        "id": "abc123",
                        "message": "fix the parser",
                        "timestamp": "2026-07-30T12:00:00+00:00",
                        "author": { "name": "ada", "email": "ada@example.com" },
                        "added": ["src/parser.rs"],
                        "modified": ["src/lib.rs"],
                        "removed": []
                    },
                    {
                        "id": "def456",
                        "message": "follow-up",
                        "timestamp": "2026-07-30T12:05:00+00:00",
                        "author": { "name": "ada" },
                        "added": [],
                        "modified": ["src/parser.rs"],
                        "removed": ["old.rs"]
                    }
                ]
            })))
            .await
            .unwrap();
        assert_eq!(resp.body["commitsTracked"], 2);

        let cached = store::get_tree(&entity.ctx.conn, "branch-main").unwrap().unwrap();
        assert!(is_expired(&cached.expires_at));

        let commits = entity
            .handle(EntityRequest::new(Method::Get, "/commits").with_query("branch", "main"))
            .await
            .unwrap();
        assert_eq!(commits.body["commits"][0]["sha"], "def456");
        assert_eq!(commits.body["commits"][0]["parentSha"], "abc123");

        let branches = entity
            .handle(EntityRequest::new(Method::Get, "/branches"))
            .await
            .unwrap();
        assert_eq!(branches.body["branches"][0]["commitSha"], "def456");

        let changes = store::changes_for_commit(&entity.ctx.conn, "def456").unwrap();
        assert_eq!(changes.len(), 2);
    }

    #[tokio::test]
    async fn cleanup_drops_expired_trees_and_their_files() {
        let mut entity = tree_entity();
        entity.ensure_repo().unwrap();
        store::replace_tree(
            &entity.ctx.conn,
            &snapshot("branch-stale", "stale", Duration::seconds(-10)),
            &[file("a.rs")],
        )
        .unwrap();
        store::replace_tree(
            &entity.ctx.conn,
            &snapshot("branch-live", "live", Duration::hours(1)),
            &[file("b.rs")],
        )
        .unwrap();

        entity.on_alarm().await.unwrap();

        assert!(store::get_tree(&entity.ctx.conn, "branch-stale").unwrap().is_none());
        assert!(store::get_tree(&entity.ctx.conn, "branch-live").unwrap().is_some());
        assert!(store::files_for_tree(&entity.ctx.conn, "branch-stale")
            .unwrap()
            .is_empty());
    }

    #[test]
    fn branch_ttl_classes() {
        assert_eq!(branch_ttl("main"), Duration::minutes(15));
        assert_eq!(branch_ttl("develop"), Duration::minutes(15));
        assert_eq!(branch_ttl("feature/x"), Duration::hours(1));
    }

    #[test]
    fn repo_identity_parsed_from_entity_name() {
        let mut entity = tree_entity();
        let repo = entity.ensure_repo().unwrap();
        assert_eq!(repo.owner, "acme");
        assert_eq!(repo.name, "widgets");
    }
}

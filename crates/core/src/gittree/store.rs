//! SQL persistence for the GitTree cache

use rusqlite::{params, Connection, OptionalExtension, Row};

use super::model::*;
use crate::runtime::storage::now_rfc3339;
use crate::Result;

pub fn bootstrap(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        r#"
        CREATE TABLE IF NOT EXISTS repo (
            id INTEGER PRIMARY KEY CHECK (id = 1),
            repo_id TEXT NOT NULL,
            owner TEXT NOT NULL,
            name TEXT NOT NULL,
            default_branch TEXT NOT NULL DEFAULT 'main',
            last_synced_at TEXT,
            last_commit_sha TEXT,
            total_files INTEGER NOT NULL DEFAULT 0
        );
        CREATE TABLE IF NOT EXISTS trees (
            tree_id TEXT PRIMARY KEY,
            tree_sha TEXT NOT NULL,
            branch TEXT NOT NULL,
            commit_sha TEXT NOT NULL,
            truncated INTEGER NOT NULL DEFAULT 0,
            file_count INTEGER NOT NULL DEFAULT 0,
            cached_at TEXT NOT NULL,
            expires_at TEXT NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_trees_branch ON trees(branch);
        CREATE INDEX IF NOT EXISTS idx_trees_expires ON trees(expires_at);
        CREATE TABLE IF NOT EXISTS files (
            tree_id TEXT NOT NULL,
            path TEXT NOT NULL,
            type TEXT NOT NULL,
            sha TEXT NOT NULL,
            size INTEGER,
            mode TEXT,
            UNIQUE (tree_id, path)
        );
        CREATE INDEX IF NOT EXISTS idx_files_tree ON files(tree_id);
        CREATE INDEX IF NOT EXISTS idx_files_path ON files(path);
        CREATE INDEX IF NOT EXISTS idx_files_type ON files(type);
        CREATE TABLE IF NOT EXISTS commits (
            sha TEXT PRIMARY KEY,
            message TEXT NOT NULL,
            author TEXT NOT NULL,
            author_email TEXT,
            timestamp TEXT NOT NULL,
            parent_sha TEXT,
            branch TEXT,
            tracked_at TEXT NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_commits_branch ON commits(branch);
        CREATE INDEX IF NOT EXISTS idx_commits_timestamp ON commits(timestamp DESC);
        CREATE TABLE IF NOT EXISTS branches (
            name TEXT PRIMARY KEY,
            commit_sha TEXT NOT NULL,
            protected INTEGER NOT NULL DEFAULT 0,
            last_updated TEXT NOT NULL
        );
        CREATE TABLE IF NOT EXISTS file_changes (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            commit_sha TEXT NOT NULL,
            path TEXT NOT NULL,
            change_type TEXT NOT NULL,
            old_path TEXT,
            additions INTEGER NOT NULL DEFAULT 0,
            deletions INTEGER NOT NULL DEFAULT 0,
            tracked_at TEXT NOT NULL
        );
        "#,
    )?;
    Ok(())
}

// --- repo ---

pub fn get_repo(conn: &Connection) -> Result<Option<RepoInfo>> {
    let row = conn
        .query_row(
            "SELECT repo_id, owner, name, default_branch, last_synced_at, last_commit_sha,
                    total_files
             FROM repo WHERE id = 1",
            [],
            |row| {
                Ok(RepoInfo {
                    repo_id: row.get(0)?,
                    owner: row.get(1)?,
                    name: row.get(2)?,
                    default_branch: row.get(3)?,
                    last_synced_at: row.get(4)?,
                    last_commit_sha: row.get(5)?,
                    total_files: row.get(6)?,
                })
            },
        )
        .optional()?;
    Ok(row)
}

pub fn upsert_repo(conn: &Connection, repo: &RepoInfo) -> Result<()> {
    conn.execute(
        "INSERT INTO repo (id, repo_id, owner, name, default_branch, last_synced_at,
                           last_commit_sha, total_files)
         VALUES (1, ?1, ?2, ?3, ?4, ?5, ?6, ?7)
         ON CONFLICT(id) DO UPDATE SET
             repo_id = excluded.repo_id,
             owner = excluded.owner,
             name = excluded.name,
             default_branch = excluded.default_branch,
             last_synced_at = excluded.last_synced_at,
             last_commit_sha = excluded.last_commit_sha,
             total_files = excluded.total_files",
        params![
            repo.repo_id,
            repo.owner,
            repo.name,
            repo.default_branch,
            repo.last_synced_at,
            repo.last_commit_sha,
            repo.total_files,
        ],
    )?;
    Ok(())
}

// --- trees / files ---

fn tree_from_row(row: &Row) -> rusqlite::Result<TreeSnapshot> {
    Ok(TreeSnapshot {
        tree_id: row.get(0)?,
        tree_sha: row.get(1)?,
        branch: row.get(2)?,
        commit_sha: row.get(3)?,
        truncated: row.get::<_, i64>(4)? != 0,
        file_count: row.get(5)?,
        cached_at: row.get(6)?,
        expires_at: row.get(7)?,
    })
}

pub fn get_tree(conn: &Connection, tree_id: &str) -> Result<Option<TreeSnapshot>> {
    let row = conn
        .query_row(
            "SELECT tree_id, tree_sha, branch, commit_sha, truncated, file_count, cached_at,
                    expires_at
             FROM trees WHERE tree_id = ?1",
            params![tree_id],
            tree_from_row,
        )
        .optional()?;
    Ok(row)
}

/// Replace-on-refresh: delete files, delete the tree, insert the new set.
pub fn replace_tree(
    conn: &Connection,
    snapshot: &TreeSnapshot,
    files: &[TreeFile],
) -> Result<()> {
    conn.execute("DELETE FROM files WHERE tree_id = ?1", params![snapshot.tree_id])?;
    conn.execute("DELETE FROM trees WHERE tree_id = ?1", params![snapshot.tree_id])?;
    conn.execute(
        "INSERT INTO trees (tree_id, tree_sha, branch, commit_sha, truncated, file_count,
                            cached_at, expires_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
        params![
            snapshot.tree_id,
            snapshot.tree_sha,
            snapshot.branch,
            snapshot.commit_sha,
            snapshot.truncated as i64,
            snapshot.file_count,
            snapshot.cached_at,
            snapshot.expires_at,
        ],
    )?;
    let mut stmt = conn.prepare(
        "INSERT OR REPLACE INTO files (tree_id, path, type, sha, size, mode)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
    )?;
    for file in files {
        stmt.execute(params![
            snapshot.tree_id,
            file.path,
            file.file_type.as_str(),
            file.sha,
            file.size,
            file.mode,
        ])?;
    }
    Ok(())
}

pub fn files_for_tree(conn: &Connection, tree_id: &str) -> Result<Vec<TreeFile>> {
    let mut stmt = conn.prepare(
        "SELECT path, type, sha, size, mode FROM files WHERE tree_id = ?1 ORDER BY path",
    )?;
    let rows = stmt
        .query_map(params![tree_id], |row| {
            Ok(TreeFile {
                path: row.get(0)?,
                file_type: FileType::parse(&row.get::<_, String>(1)?),
                sha: row.get(2)?,
                size: row.get(3)?,
                mode: row.get(4)?,
            })
        })?
        .collect::<std::result::Result<Vec<_>, _>>()?;
    Ok(rows)
}

/// LIKE search scoped to one cached tree; `\` escapes literal wildcards.
pub fn search_files(conn: &Connection, tree_id: &str, like: &str) -> Result<Vec<TreeFile>> {
    let mut stmt = conn.prepare(
        "SELECT path, type, sha, size, mode FROM files
         WHERE tree_id = ?1 AND path LIKE ?2 ESCAPE '\\'
         ORDER BY path",
    )?;
    let rows = stmt
        .query_map(params![tree_id, like], |row| {
            Ok(TreeFile {
                path: row.get(0)?,
                file_type: FileType::parse(&row.get::<_, String>(1)?),
                sha: row.get(2)?,
                size: row.get(3)?,
                mode: row.get(4)?,
            })
        })?
        .collect::<std::result::Result<Vec<_>, _>>()?;
    Ok(rows)
}

/// Lazy invalidation: push the expiry back to the epoch so the next read
/// refreshes, while stale reads stay possible until then.
pub fn expire_tree(conn: &Connection, tree_id: &str) -> Result<()> {
    conn.execute(
        "UPDATE trees SET expires_at = '1970-01-01T00:00:00+00:00' WHERE tree_id = ?1",
        params![tree_id],
    )?;
    Ok(())
}

// --- commits / branches / changes ---

pub fn track_commit(conn: &Connection, commit: &TrackedCommit) -> Result<()> {
    conn.execute(
        "INSERT OR REPLACE INTO commits (sha, message, author, author_email, timestamp,
                                         parent_sha, branch, tracked_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
        params![
            commit.sha,
            commit.message,
            commit.author,
            commit.author_email,
            commit.timestamp,
            commit.parent_sha,
            commit.branch,
            commit.tracked_at,
        ],
    )?;
    Ok(())
}

pub fn list_commits(
    conn: &Connection,
    branch: Option<&str>,
    limit: usize,
) -> Result<Vec<TrackedCommit>> {
    let map_row = |row: &Row| -> rusqlite::Result<TrackedCommit> {
        Ok(TrackedCommit {
            sha: row.get(0)?,
            message: row.get(1)?,
            author: row.get(2)?,
            author_email: row.get(3)?,
            timestamp: row.get(4)?,
            parent_sha: row.get(5)?,
            branch: row.get(6)?,
            tracked_at: row.get(7)?,
        })
    };
    let rows = match branch {
        Some(branch) => {
            let mut stmt = conn.prepare(
                "SELECT sha, message, author, author_email, timestamp, parent_sha, branch,
                        tracked_at
                 FROM commits WHERE branch = ?1 ORDER BY timestamp DESC LIMIT ?2",
            )?;
            let rows = stmt
                .query_map(params![branch, limit as i64], map_row)?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            rows
        }
        None => {
            let mut stmt = conn.prepare(
                "SELECT sha, message, author, author_email, timestamp, parent_sha, branch,
                        tracked_at
                 FROM commits ORDER BY timestamp DESC LIMIT ?1",
            )?;
            let rows = stmt
                .query_map(params![limit as i64], map_row)?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            rows
        }
    };
    Ok(rows)
}

pub fn upsert_branch(conn: &Connection, name: &str, commit_sha: &str) -> Result<()> {
    conn.execute(
        "INSERT INTO branches (name, commit_sha, protected, last_updated)
         VALUES (?1, ?2, 0, ?3)
         ON CONFLICT(name) DO UPDATE SET
             commit_sha = excluded.commit_sha,
             last_updated = excluded.last_updated",
        params![name, commit_sha, now_rfc3339()],
    )?;
    Ok(())
}

pub fn list_branches(conn: &Connection) -> Result<Vec<BranchRecord>> {
    let mut stmt =
        conn.prepare("SELECT name, commit_sha, protected, last_updated FROM branches ORDER BY name")?;
    let rows = stmt
        .query_map([], |row| {
            Ok(BranchRecord {
                name: row.get(0)?,
                commit_sha: row.get(1)?,
                protected: row.get::<_, i64>(2)? != 0,
                last_updated: row.get(3)?,
            })
        })?
        .collect::<std::result::Result<Vec<_>, _>>()?;
    Ok(rows)
}

pub fn track_file_change(conn: &Connection, change: &FileChange) -> Result<()> {
    conn.execute(
        "INSERT INTO file_changes (commit_sha, path, change_type, old_path, additions,
                                   deletions, tracked_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
        params![
            change.commit_sha,
            change.path,
            change.change_type.as_str(),
            change.old_path,
            change.additions,
            change.deletions,
            change.tracked_at,
        ],
    )?;
    Ok(())
}

pub fn changes_for_commit(conn: &Connection, commit_sha: &str) -> Result<Vec<FileChange>> {
    let mut stmt = conn.prepare(
        "SELECT commit_sha, path, change_type, old_path, additions, deletions, tracked_at
         FROM file_changes WHERE commit_sha = ?1 ORDER BY path",
    )?;
    let rows = stmt
        .query_map(params![commit_sha], |row| {
            Ok(FileChange {
                commit_sha: row.get(0)?,
                path: row.get(1)?,
                change_type: ChangeType::parse(&row.get::<_, String>(2)?),
                old_path: row.get(3)?,
                additions: row.get(4)?,
                deletions: row.get(5)?,
                tracked_at: row.get(6)?,
            })
        })?
        .collect::<std::result::Result<Vec<_>, _>>()?;
    Ok(rows)
}

/// Hourly housekeeping: expired trees and their files go, only the most
/// recent 1000 commits stay, and changes whose commit is gone follow it.
pub fn cleanup(conn: &Connection, now: &str) -> Result<()> {
    conn.execute(
        "DELETE FROM files WHERE tree_id IN (SELECT tree_id FROM trees WHERE expires_at <= ?1)",
        params![now],
    )?;
    conn.execute("DELETE FROM trees WHERE expires_at <= ?1", params![now])?;
    conn.execute(
        "DELETE FROM commits WHERE sha NOT IN
             (SELECT sha FROM commits ORDER BY timestamp DESC LIMIT 1000)",
        [],
    )?;
    conn.execute(
        "DELETE FROM file_changes WHERE commit_sha NOT IN (SELECT sha FROM commits)",
        [],
    )?;
    Ok(())
}

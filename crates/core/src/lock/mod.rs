//! ResourceLock entity: TTL-bounded exclusive lock with history
//!
//! One instance per resource path. The lock is a single row; expiry runs
//! through a scheduled alarm and is additionally swept lazily on every
//! entry point, so cleanup survives a dropped alarm.

pub mod model;

use async_trait::async_trait;
use chrono::{Duration, Utc};
use rusqlite::{params, OptionalExtension};
use serde_json::json;

use crate::error::Error;
use crate::request::{EntityRequest, EntityResponse, Method};
use crate::runtime::storage::{now_rfc3339, parse_rfc3339};
use crate::runtime::{Entity, EntityContext};
use crate::Result;

pub use model::{LockAcquisition, LockRequest, LockState, ReleaseReason, ResourceType, UnlockRequest};

const DEFAULT_TTL_MS: i64 = 2 * 60 * 60 * 1000;
const HISTORY_LIMIT: usize = 50;

pub struct ResourceLock {
    ctx: EntityContext,
}

#[async_trait]
impl Entity for ResourceLock {
    fn kind() -> &'static str {
        "lock"
    }

    fn create(ctx: EntityContext) -> Result<Self> {
        ctx.conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS lock_state (
                id INTEGER PRIMARY KEY CHECK (id = 1),
                resource_path TEXT NOT NULL,
                resource_type TEXT NOT NULL,
                locked_by TEXT NOT NULL,
                reason TEXT,
                locked_at TEXT NOT NULL,
                expires_at TEXT NOT NULL
            );
            CREATE TABLE IF NOT EXISTS lock_history (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                locked_by TEXT NOT NULL,
                resource_type TEXT NOT NULL,
                reason TEXT,
                locked_at TEXT NOT NULL,
                expires_at TEXT NOT NULL,
                released_at TEXT,
                release_reason TEXT
            );
            "#,
        )?;
        Ok(Self { ctx })
    }

    async fn handle(&mut self, req: EntityRequest) -> Result<EntityResponse> {
        match (req.method, req.segments().as_slice()) {
            (Method::Post, ["lock"]) => self.lock(req.parse_body()?),
            (Method::Post, ["unlock"]) => self.unlock(req.parse_body()?),
            (Method::Get, ["check"]) | (Method::Get, []) => self.check(),
            (Method::Get, ["history"]) => self.history(),
            (_, ["lock"] | ["unlock"] | ["check"] | ["history"]) => Err(Error::MethodNotAllowed),
            _ => Err(Error::not_found(format!("No route for {}", req.path))),
        }
    }

    /// The alarm fires at `expiresAt` of the current lock.
    async fn on_alarm(&mut self) -> Result<()> {
        self.sweep_expired()?;
        Ok(())
    }
}

impl ResourceLock {
    fn lock(&mut self, req: LockRequest) -> Result<EntityResponse> {
        if req.agent_id.trim().is_empty() {
            return Err(Error::validation("agentId is required"));
        }
        self.sweep_expired()?;

        let now = Utc::now();
        if let Some(existing) = self.current()? {
            if existing.locked_by != req.agent_id {
                let remaining_ms = parse_rfc3339(&existing.expires_at)
                    .map(|at| (at - now).num_milliseconds().max(0))
                    .unwrap_or(0);
                return Err(Error::Conflict(json!({
                    "success": false,
                    "lockedBy": existing.locked_by,
                    "remainingMs": remaining_ms,
                    "reason": existing.reason,
                })));
            }
            // Re-lock by the owner refreshes the TTL.
        }

        let ttl_ms = req.ttl_ms.filter(|ms| *ms > 0).unwrap_or(DEFAULT_TTL_MS);
        let expires_at = (now + Duration::milliseconds(ttl_ms)).to_rfc3339();
        let state = LockState {
            resource_path: self.ctx.name.clone(),
            resource_type: req.resource_type.unwrap_or_default(),
            locked_by: req.agent_id,
            reason: req.reason,
            locked_at: now.to_rfc3339(),
            expires_at: expires_at.clone(),
        };

        self.ctx.conn.execute(
            "INSERT INTO lock_state (id, resource_path, resource_type, locked_by, reason, locked_at, expires_at)
             VALUES (1, ?1, ?2, ?3, ?4, ?5, ?6)
             ON CONFLICT(id) DO UPDATE SET
                 resource_type = excluded.resource_type,
                 locked_by = excluded.locked_by,
                 reason = excluded.reason,
                 locked_at = excluded.locked_at,
                 expires_at = excluded.expires_at",
            params![
                state.resource_path,
                type_str(state.resource_type),
                state.locked_by,
                state.reason,
                state.locked_at,
                state.expires_at,
            ],
        )?;
        self.record_acquisition(&state)?;

        if let Some(at) = parse_rfc3339(&expires_at) {
            self.ctx.alarm.schedule(at);
        }

        Ok(EntityResponse::ok(json!({ "success": true, "lock": state })))
    }

    fn unlock(&mut self, req: UnlockRequest) -> Result<EntityResponse> {
        if req.agent_id.trim().is_empty() {
            return Err(Error::validation("agentId is required"));
        }
        self.sweep_expired()?;

        let Some(existing) = self.current()? else {
            return Ok(EntityResponse::ok(json!({
                "success": true,
                "released": false,
            })));
        };

        let owner = existing.locked_by == req.agent_id;
        if !owner && !req.force {
            return Err(Error::Forbidden(format!(
                "Lock is held by {}",
                existing.locked_by
            )));
        }

        let reason = if owner {
            ReleaseReason::Manual
        } else {
            ReleaseReason::Stolen
        };
        self.release(reason)?;
        self.ctx.alarm.cancel();

        Ok(EntityResponse::ok(json!({
            "success": true,
            "released": true,
            "releaseReason": reason,
        })))
    }

    fn check(&mut self) -> Result<EntityResponse> {
        self.sweep_expired()?;
        let lock = self.current()?;
        Ok(EntityResponse::ok(json!({
            "locked": lock.is_some(),
            "lock": lock,
        })))
    }

    fn history(&self) -> Result<EntityResponse> {
        let mut stmt = self.ctx.conn.prepare(
            "SELECT locked_by, resource_type, reason, locked_at, expires_at, released_at, release_reason
             FROM lock_history ORDER BY id DESC LIMIT ?1",
        )?;
        let rows = stmt
            .query_map(params![HISTORY_LIMIT as i64], |row| {
                Ok(LockAcquisition {
                    locked_by: row.get(0)?,
                    resource_type: parse_type(&row.get::<_, String>(1)?),
                    reason: row.get(2)?,
                    locked_at: row.get(3)?,
                    expires_at: row.get(4)?,
                    released_at: row.get(5)?,
                    release_reason: row
                        .get::<_, Option<String>>(6)?
                        .as_deref()
                        .and_then(parse_release_reason),
                })
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(EntityResponse::ok(json!({ "history": rows })))
    }

    fn current(&self) -> Result<Option<LockState>> {
        let state = self
            .ctx
            .conn
            .query_row(
                "SELECT resource_path, resource_type, locked_by, reason, locked_at, expires_at
                 FROM lock_state WHERE id = 1",
                [],
                |row| {
                    Ok(LockState {
                        resource_path: row.get(0)?,
                        resource_type: parse_type(&row.get::<_, String>(1)?),
                        locked_by: row.get(2)?,
                        reason: row.get(3)?,
                        locked_at: row.get(4)?,
                        expires_at: row.get(5)?,
                    })
                },
            )
            .optional()?;
        Ok(state)
    }

    /// Release the lock if its deadline has passed, recording `expired`.
    fn sweep_expired(&mut self) -> Result<()> {
        let Some(existing) = self.current()? else {
            return Ok(());
        };
        let expired = parse_rfc3339(&existing.expires_at)
            .map(|at| at <= Utc::now())
            .unwrap_or(true);
        if expired {
            self.release(ReleaseReason::Expired)?;
        }
        Ok(())
    }

    fn release(&mut self, reason: ReleaseReason) -> Result<()> {
        self.ctx.conn.execute("DELETE FROM lock_state WHERE id = 1", [])?;
        self.ctx.conn.execute(
            "UPDATE lock_history SET released_at = ?1, release_reason = ?2
             WHERE id = (SELECT MAX(id) FROM lock_history WHERE released_at IS NULL)",
            params![now_rfc3339(), reason.as_str()],
        )?;
        Ok(())
    }

    fn record_acquisition(&mut self, state: &LockState) -> Result<()> {
        // Owner refresh closes the previous acquisition as manual first.
        self.ctx.conn.execute(
            "UPDATE lock_history SET released_at = ?1, release_reason = 'manual'
             WHERE released_at IS NULL AND locked_by = ?2",
            params![now_rfc3339(), state.locked_by],
        )?;
        self.ctx.conn.execute(
            "INSERT INTO lock_history (locked_by, resource_type, reason, locked_at, expires_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                state.locked_by,
                type_str(state.resource_type),
                state.reason,
                state.locked_at,
                state.expires_at,
            ],
        )?;
        self.ctx.conn.execute(
            "DELETE FROM lock_history WHERE id NOT IN
                 (SELECT id FROM lock_history ORDER BY id DESC LIMIT ?1)",
            params![HISTORY_LIMIT as i64],
        )?;
        Ok(())
    }
}

fn type_str(value: ResourceType) -> &'static str {
    match value {
        ResourceType::RepoPath => "repo-path",
        ResourceType::Branch => "branch",
        ResourceType::FileLock => "file-lock",
        ResourceType::Custom => "custom",
    }
}

fn parse_type(value: &str) -> ResourceType {
    match value {
        "repo-path" => ResourceType::RepoPath,
        "branch" => ResourceType::Branch,
        "file-lock" => ResourceType::FileLock,
        _ => ResourceType::Custom,
    }
}

fn parse_release_reason(value: &str) -> Option<ReleaseReason> {
    match value {
        "manual" => Some(ReleaseReason::Manual),
        "expired" => Some(ReleaseReason::Expired),
        "stolen" => Some(ReleaseReason::Stolen),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::storage::open_in_memory;
    use serde_json::json;

    fn lock_entity() -> ResourceLock {
        let ctx = EntityContext::new("src/server", open_in_memory().unwrap());
        ResourceLock::create(ctx).unwrap()
    }

    fn post(path: &str, body: serde_json::Value) -> EntityRequest {
        EntityRequest::new(Method::Post, path).with_body(body)
    }

    #[tokio::test]
    async fn lock_contention_round_trip() {
        let mut entity = lock_entity();

        let resp = entity
            .handle(post("/lock", json!({ "agentId": "a1", "ttlMs": 60000 })))
            .await
            .unwrap();
        assert_eq!(resp.status, 200);
        assert_eq!(resp.body["lock"]["lockedBy"], "a1");

        let conflict = entity
            .handle(post("/lock", json!({ "agentId": "a2" })))
            .await
            .unwrap_err();
        assert_eq!(conflict.status(), 409);
        let body = conflict.body();
        assert_eq!(body["success"], false);
        assert_eq!(body["lockedBy"], "a1");
        let remaining = body["remainingMs"].as_i64().unwrap();
        assert!(remaining > 55_000 && remaining <= 60_000);

        let released = entity
            .handle(post("/unlock", json!({ "agentId": "a1" })))
            .await
            .unwrap();
        assert_eq!(released.body["releaseReason"], "manual");

        let relocked = entity
            .handle(post("/lock", json!({ "agentId": "a2" })))
            .await
            .unwrap();
        assert_eq!(relocked.body["lock"]["lockedBy"], "a2");
    }

    #[tokio::test]
    async fn owner_relock_refreshes_ttl() {
        let mut entity = lock_entity();
        entity
            .handle(post("/lock", json!({ "agentId": "a1", "ttlMs": 1000 })))
            .await
            .unwrap();
        let refreshed = entity
            .handle(post("/lock", json!({ "agentId": "a1", "ttlMs": 120000 })))
            .await
            .unwrap();
        let expires = refreshed.body["lock"]["expiresAt"].as_str().unwrap();
        let at = parse_rfc3339(expires).unwrap();
        assert!((at - Utc::now()).num_milliseconds() > 100_000);
    }

    #[tokio::test]
    async fn expired_lock_is_swept_on_check() {
        let mut entity = lock_entity();
        entity
            .handle(post("/lock", json!({ "agentId": "a1" })))
            .await
            .unwrap();
        entity
            .ctx
            .conn
            .execute(
                "UPDATE lock_state SET expires_at = ?1",
                params![(Utc::now() - Duration::seconds(1)).to_rfc3339()],
            )
            .unwrap();

        let resp = entity
            .handle(EntityRequest::new(Method::Get, "/check"))
            .await
            .unwrap();
        assert_eq!(resp.body["locked"], false);

        let history = entity
            .handle(EntityRequest::new(Method::Get, "/history"))
            .await
            .unwrap();
        assert_eq!(history.body["history"][0]["releaseReason"], "expired");
    }

    #[tokio::test]
    async fn force_unlock_records_stolen() {
        let mut entity = lock_entity();
        entity
            .handle(post("/lock", json!({ "agentId": "a1" })))
            .await
            .unwrap();

        let denied = entity
            .handle(post("/unlock", json!({ "agentId": "a2" })))
            .await
            .unwrap_err();
        assert_eq!(denied.status(), 403);

        let stolen = entity
            .handle(post("/unlock", json!({ "agentId": "a2", "force": true })))
            .await
            .unwrap();
        assert_eq!(stolen.body["releaseReason"], "stolen");
    }

    #[tokio::test]
    async fn alarm_releases_expired_lock() {
        let mut entity = lock_entity();
        entity
            .handle(post("/lock", json!({ "agentId": "a1", "ttlMs": 1 })))
            .await
            .unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        entity.on_alarm().await.unwrap();

        let resp = entity
            .handle(EntityRequest::new(Method::Get, "/check"))
            .await
            .unwrap();
        assert_eq!(resp.body["locked"], false);
    }

    #[tokio::test]
    async fn history_is_capped() {
        let mut entity = lock_entity();
        for i in 0..60 {
            let agent = format!("agent-{}", i);
            entity
                .handle(post("/lock", json!({ "agentId": agent })))
                .await
                .unwrap();
            entity
                .handle(post("/unlock", json!({ "agentId": format!("agent-{}", i) })))
                .await
                .unwrap();
        }
        let history = entity
            .handle(EntityRequest::new(Method::Get, "/history"))
            .await
            .unwrap();
        assert_eq!(history.body["history"].as_array().unwrap().len(), 50);
    }
}

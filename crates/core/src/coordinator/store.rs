//! SQL persistence for the Coordinator

use chrono::{DateTime, Duration, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};
use uuid::Uuid;

use super::model::*;
use crate::runtime::storage::{json_string_vec, now_rfc3339, parse_rfc3339, to_json_text};
use crate::Result;

/// A claim goes stale after 30 minutes without renewal.
pub const CLAIM_STALE_MINUTES: i64 = 30;

pub fn bootstrap(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        r#"
        CREATE TABLE IF NOT EXISTS agents (
            agent_id TEXT PRIMARY KEY,
            status TEXT NOT NULL DEFAULT 'active',
            current_task TEXT,
            working_on TEXT,
            last_seen TEXT NOT NULL,
            capabilities TEXT,
            offers TEXT,
            needs TEXT,
            last_chat_check TEXT NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_agents_status ON agents(status);
        CREATE TABLE IF NOT EXISTS messages (
            id TEXT PRIMARY KEY,
            author TEXT NOT NULL,
            author_type TEXT NOT NULL,
            message TEXT NOT NULL,
            timestamp TEXT NOT NULL,
            reactions TEXT
        );
        CREATE INDEX IF NOT EXISTS idx_messages_timestamp ON messages(timestamp DESC);
        CREATE TABLE IF NOT EXISTS tasks (
            id TEXT PRIMARY KEY,
            title TEXT NOT NULL,
            description TEXT,
            status TEXT NOT NULL DEFAULT 'todo',
            assignee TEXT,
            created_by TEXT NOT NULL,
            priority TEXT NOT NULL DEFAULT 'medium',
            tags TEXT,
            files TEXT,
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_tasks_status ON tasks(status);
        CREATE INDEX IF NOT EXISTS idx_tasks_assignee ON tasks(assignee);
        CREATE TABLE IF NOT EXISTS zones (
            zone_id TEXT PRIMARY KEY,
            path TEXT NOT NULL UNIQUE,
            owner TEXT NOT NULL,
            description TEXT,
            claimed_at TEXT NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_zones_owner ON zones(owner);
        CREATE INDEX IF NOT EXISTS idx_zones_path ON zones(path);
        CREATE TABLE IF NOT EXISTS claims (
            what TEXT PRIMARY KEY,
            by TEXT NOT NULL,
            description TEXT,
            since TEXT NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_claims_by ON claims(by);
        CREATE TABLE IF NOT EXISTS handoffs (
            id TEXT PRIMARY KEY,
            from_agent TEXT NOT NULL,
            to_agent TEXT,
            title TEXT NOT NULL,
            context TEXT NOT NULL,
            code TEXT,
            file_path TEXT,
            next_steps TEXT,
            priority TEXT NOT NULL DEFAULT 'medium',
            status TEXT NOT NULL DEFAULT 'pending',
            claimed_by TEXT,
            created_at TEXT NOT NULL,
            claimed_at TEXT,
            completed_at TEXT
        );
        CREATE INDEX IF NOT EXISTS idx_handoffs_status ON handoffs(status);
        CREATE INDEX IF NOT EXISTS idx_handoffs_to_agent ON handoffs(to_agent);
        "#,
    )?;
    Ok(())
}

// --- agents ---

fn agent_from_row(row: &Row) -> rusqlite::Result<Agent> {
    Ok(Agent {
        agent_id: row.get(0)?,
        status: AgentStatus::parse(&row.get::<_, String>(1)?),
        current_task: row.get(2)?,
        working_on: row.get(3)?,
        last_seen: row.get(4)?,
        capabilities: json_string_vec(row.get(5)?),
        offers: json_string_vec(row.get(6)?),
        needs: json_string_vec(row.get(7)?),
    })
}

const AGENT_COLUMNS: &str =
    "agent_id, status, current_task, working_on, last_seen, capabilities, offers, needs";

pub fn get_agent(conn: &Connection, agent_id: &str) -> Result<Option<Agent>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {} FROM agents WHERE agent_id = ?1",
        AGENT_COLUMNS
    ))?;
    let row = stmt.query_row(params![agent_id], agent_from_row).optional()?;
    Ok(row)
}

/// Upsert preserving prior non-null fields; `lastSeen` always refreshes.
pub fn upsert_agent(conn: &Connection, req: &AgentUpsertRequest) -> Result<Agent> {
    let now = now_rfc3339();
    conn.execute(
        "INSERT INTO agents (agent_id, status, current_task, working_on, last_seen,
                             capabilities, offers, needs, last_chat_check)
         VALUES (?1, COALESCE(?2, 'active'), ?3, ?4, ?5, ?6, ?7, ?8, ?5)
         ON CONFLICT(agent_id) DO UPDATE SET
             status = COALESCE(?2, agents.status),
             current_task = COALESCE(?3, agents.current_task),
             working_on = COALESCE(?4, agents.working_on),
             last_seen = ?5,
             capabilities = COALESCE(?6, agents.capabilities),
             offers = COALESCE(?7, agents.offers),
             needs = COALESCE(?8, agents.needs)",
        params![
            req.agent_id,
            req.status.map(|s| s.as_str()),
            req.current_task,
            req.working_on,
            now,
            req.capabilities.as_ref().map(to_json_text),
            req.offers.as_ref().map(to_json_text),
            req.needs.as_ref().map(to_json_text),
        ],
    )?;
    get_agent(conn, &req.agent_id)?
        .ok_or_else(|| crate::Error::Internal("Agent row missing after upsert".to_string()))
}

/// First-contact creation without touching an existing row's fields.
pub fn ensure_agent(conn: &Connection, agent_id: &str) -> Result<()> {
    let now = now_rfc3339();
    conn.execute(
        "INSERT OR IGNORE INTO agents (agent_id, status, last_seen, last_chat_check)
         VALUES (?1, 'active', ?2, ?2)",
        params![agent_id, now],
    )?;
    Ok(())
}

pub fn list_agents(conn: &Connection, include_offline: bool) -> Result<Vec<Agent>> {
    let sql = if include_offline {
        format!("SELECT {} FROM agents ORDER BY last_seen DESC", AGENT_COLUMNS)
    } else {
        format!(
            "SELECT {} FROM agents WHERE status != 'offline' ORDER BY last_seen DESC",
            AGENT_COLUMNS
        )
    };
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt
        .query_map([], agent_from_row)?
        .collect::<std::result::Result<Vec<_>, _>>()?;
    Ok(rows)
}

pub fn last_chat_check(conn: &Connection, agent_id: &str) -> Result<Option<String>> {
    let row = conn
        .query_row(
            "SELECT last_chat_check FROM agents WHERE agent_id = ?1",
            params![agent_id],
            |row| row.get(0),
        )
        .optional()?;
    Ok(row)
}

pub fn touch_chat_check(conn: &Connection, agent_id: &str) -> Result<()> {
    conn.execute(
        "UPDATE agents SET last_chat_check = ?1 WHERE agent_id = ?2",
        params![now_rfc3339(), agent_id],
    )?;
    Ok(())
}

// --- chat ---

fn message_from_row(row: &Row) -> rusqlite::Result<GroupMessage> {
    Ok(GroupMessage {
        id: row.get(0)?,
        author: row.get(1)?,
        author_type: AuthorType::parse(&row.get::<_, String>(2)?),
        message: row.get(3)?,
        timestamp: row.get(4)?,
        reactions: row
            .get::<_, Option<String>>(5)?
            .and_then(|text| serde_json::from_str(&text).ok())
            .unwrap_or_default(),
    })
}

pub fn append_message(conn: &Connection, req: &ChatPostRequest) -> Result<GroupMessage> {
    let message = GroupMessage {
        id: Uuid::new_v4().to_string(),
        author: req.author.clone(),
        author_type: req.author_type.unwrap_or(AuthorType::Agent),
        message: req.message.clone(),
        timestamp: now_rfc3339(),
        reactions: Vec::new(),
    };
    conn.execute(
        "INSERT INTO messages (id, author, author_type, message, timestamp, reactions)
         VALUES (?1, ?2, ?3, ?4, ?5, '[]')",
        params![
            message.id,
            message.author,
            message.author_type.as_str(),
            message.message,
            message.timestamp,
        ],
    )?;
    Ok(message)
}

/// Most recent messages in chronological order.
pub fn recent_messages(
    conn: &Connection,
    limit: usize,
    since: Option<&str>,
) -> Result<Vec<GroupMessage>> {
    let rows = match since {
        Some(since) => {
            let mut stmt = conn.prepare(
                "SELECT id, author, author_type, message, timestamp, reactions FROM messages
                 WHERE timestamp > ?1 ORDER BY timestamp DESC LIMIT ?2",
            )?;
            let rows = stmt
                .query_map(params![since, limit as i64], message_from_row)?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            rows
        }
        None => {
            let mut stmt = conn.prepare(
                "SELECT id, author, author_type, message, timestamp, reactions FROM messages
                 ORDER BY timestamp DESC LIMIT ?1",
            )?;
            let rows = stmt
                .query_map(params![limit as i64], message_from_row)?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            rows
        }
    };
    let mut rows = rows;
    rows.reverse();
    Ok(rows)
}

pub fn get_message(conn: &Connection, id: &str) -> Result<Option<GroupMessage>> {
    let mut stmt = conn.prepare(
        "SELECT id, author, author_type, message, timestamp, reactions FROM messages WHERE id = ?1",
    )?;
    let row = stmt.query_row(params![id], message_from_row).optional()?;
    Ok(row)
}

pub fn set_reactions(conn: &Connection, id: &str, reactions: &[Reaction]) -> Result<()> {
    conn.execute(
        "UPDATE messages SET reactions = ?1 WHERE id = ?2",
        params![to_json_text(&reactions), id],
    )?;
    Ok(())
}

/// Unread mentions of `agent_id` newer than its chat cursor.
pub fn pending_mentions(conn: &Connection, agent_id: &str) -> Result<Vec<GroupMessage>> {
    let cursor = last_chat_check(conn, agent_id)?;
    let candidates = recent_messages(conn, 200, cursor.as_deref())?;
    Ok(candidates
        .into_iter()
        .filter(|m| m.author != agent_id && mentions_agent(&m.message, agent_id))
        .collect())
}

// --- tasks ---

fn task_from_row(row: &Row) -> rusqlite::Result<Task> {
    Ok(Task {
        id: row.get(0)?,
        title: row.get(1)?,
        description: row.get(2)?,
        status: TaskStatus::parse(&row.get::<_, String>(3)?),
        assignee: row.get(4)?,
        created_by: row.get(5)?,
        priority: TaskPriority::parse(&row.get::<_, String>(6)?),
        tags: json_string_vec(row.get(7)?),
        files: json_string_vec(row.get(8)?),
        created_at: row.get(9)?,
        updated_at: row.get(10)?,
    })
}

const TASK_COLUMNS: &str =
    "id, title, description, status, assignee, created_by, priority, tags, files, created_at,
     updated_at";

pub fn get_task(conn: &Connection, id: &str) -> Result<Option<Task>> {
    let mut stmt = conn.prepare(&format!("SELECT {} FROM tasks WHERE id = ?1", TASK_COLUMNS))?;
    let row = stmt.query_row(params![id], task_from_row).optional()?;
    Ok(row)
}

pub fn upsert_task(conn: &Connection, task: &Task) -> Result<()> {
    conn.execute(
        "INSERT INTO tasks (id, title, description, status, assignee, created_by, priority,
                            tags, files, created_at, updated_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)
         ON CONFLICT(id) DO UPDATE SET
             title = excluded.title,
             description = excluded.description,
             status = excluded.status,
             assignee = excluded.assignee,
             priority = excluded.priority,
             tags = excluded.tags,
             files = excluded.files,
             updated_at = excluded.updated_at",
        params![
            task.id,
            task.title,
            task.description,
            task.status.as_str(),
            task.assignee,
            task.created_by,
            task.priority.as_str(),
            to_json_text(&task.tags),
            to_json_text(&task.files),
            task.created_at,
            task.updated_at,
        ],
    )?;
    Ok(())
}

pub fn list_tasks(
    conn: &Connection,
    status: Option<&str>,
    assignee: Option<&str>,
) -> Result<Vec<Task>> {
    let mut sql = format!("SELECT {} FROM tasks WHERE 1=1", TASK_COLUMNS);
    let mut args: Vec<String> = Vec::new();
    if let Some(status) = status {
        sql.push_str(&format!(" AND status = ?{}", args.len() + 1));
        args.push(status.to_string());
    }
    if let Some(assignee) = assignee {
        sql.push_str(&format!(" AND assignee = ?{}", args.len() + 1));
        args.push(assignee.to_string());
    }
    sql.push_str(" ORDER BY updated_at DESC");
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt
        .query_map(rusqlite::params_from_iter(args.iter()), task_from_row)?
        .collect::<std::result::Result<Vec<_>, _>>()?;
    Ok(rows)
}

// --- zones ---

fn zone_from_row(row: &Row) -> rusqlite::Result<Zone> {
    Ok(Zone {
        zone_id: row.get(0)?,
        path: row.get(1)?,
        owner: row.get(2)?,
        description: row.get(3)?,
        claimed_at: row.get(4)?,
    })
}

pub fn upsert_zone(conn: &Connection, req: &ZoneClaimRequest) -> Result<Zone> {
    conn.execute(
        "INSERT INTO zones (zone_id, path, owner, description, claimed_at)
         VALUES (?1, ?2, ?3, ?4, ?5)
         ON CONFLICT(path) DO UPDATE SET
             owner = excluded.owner,
             description = COALESCE(excluded.description, zones.description),
             claimed_at = excluded.claimed_at",
        params![
            Uuid::new_v4().to_string(),
            req.path,
            req.owner,
            req.description,
            now_rfc3339(),
        ],
    )?;
    let zone = conn.query_row(
        "SELECT zone_id, path, owner, description, claimed_at FROM zones WHERE path = ?1",
        params![req.path],
        zone_from_row,
    )?;
    Ok(zone)
}

pub fn list_zones(conn: &Connection, owner: Option<&str>) -> Result<Vec<Zone>> {
    let rows = match owner {
        Some(owner) => {
            let mut stmt = conn.prepare(
                "SELECT zone_id, path, owner, description, claimed_at FROM zones
                 WHERE owner = ?1 ORDER BY path",
            )?;
            let rows = stmt
                .query_map(params![owner], zone_from_row)?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            rows
        }
        None => {
            let mut stmt = conn.prepare(
                "SELECT zone_id, path, owner, description, claimed_at FROM zones ORDER BY path",
            )?;
            let rows = stmt
                .query_map([], zone_from_row)?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            rows
        }
    };
    Ok(rows)
}

pub fn delete_zone(conn: &Connection, zone_id: &str) -> Result<bool> {
    let deleted = conn.execute("DELETE FROM zones WHERE zone_id = ?1", params![zone_id])?;
    Ok(deleted > 0)
}

/// Boundary-safe membership: the query path is the zone path itself or a
/// descendant (`zone.path + "/"` prefix). `src/api` never matches
/// `src/api-v2/foo.ts`.
pub fn zone_for_path(conn: &Connection, query_path: &str) -> Result<Option<Zone>> {
    for zone in list_zones(conn, None)? {
        if query_path == zone.path
            || query_path.starts_with(&format!("{}/", zone.path))
        {
            return Ok(Some(zone));
        }
    }
    Ok(None)
}

// --- claims ---

pub fn claim_is_stale(since: &str, now: DateTime<Utc>) -> bool {
    parse_rfc3339(since)
        .map(|at| now - at > Duration::minutes(CLAIM_STALE_MINUTES))
        .unwrap_or(true)
}

pub fn get_claim(conn: &Connection, what: &str) -> Result<Option<Claim>> {
    let now = Utc::now();
    let row = conn
        .query_row(
            "SELECT what, by, description, since FROM claims WHERE what = ?1",
            params![what],
            |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, Option<String>>(2)?,
                    row.get::<_, String>(3)?,
                ))
            },
        )
        .optional()?;
    Ok(row.map(|(what, by, description, since)| Claim {
        stale: claim_is_stale(&since, now),
        what,
        by,
        description,
        since,
    }))
}

pub fn put_claim(conn: &Connection, what: &str, by: &str, description: Option<&str>) -> Result<Claim> {
    conn.execute(
        "INSERT INTO claims (what, by, description, since) VALUES (?1, ?2, ?3, ?4)
         ON CONFLICT(what) DO UPDATE SET
             by = excluded.by,
             description = excluded.description,
             since = excluded.since",
        params![what, by, description, now_rfc3339()],
    )?;
    get_claim(conn, what)?
        .ok_or_else(|| crate::Error::Internal("Claim row missing after upsert".to_string()))
}

pub fn delete_claim(conn: &Connection, what: &str) -> Result<bool> {
    let deleted = conn.execute("DELETE FROM claims WHERE what = ?1", params![what])?;
    Ok(deleted > 0)
}

pub fn list_claims(conn: &Connection, include_stale: bool) -> Result<Vec<Claim>> {
    let now = Utc::now();
    let mut stmt = conn.prepare("SELECT what, by, description, since FROM claims ORDER BY since DESC")?;
    let rows = stmt
        .query_map([], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, Option<String>>(2)?,
                row.get::<_, String>(3)?,
            ))
        })?
        .collect::<std::result::Result<Vec<_>, _>>()?;
    Ok(rows
        .into_iter()
        .map(|(what, by, description, since)| Claim {
            stale: claim_is_stale(&since, now),
            what,
            by,
            description,
            since,
        })
        .filter(|claim| include_stale || !claim.stale)
        .collect())
}

// --- handoffs ---

fn handoff_from_row(row: &Row) -> rusqlite::Result<Handoff> {
    Ok(Handoff {
        id: row.get(0)?,
        from_agent: row.get(1)?,
        to_agent: row.get(2)?,
        title: row.get(3)?,
        context: row.get(4)?,
        code: row.get(5)?,
        file_path: row.get(6)?,
        next_steps: json_string_vec(row.get(7)?),
        priority: TaskPriority::parse(&row.get::<_, String>(8)?),
        status: HandoffStatus::parse(&row.get::<_, String>(9)?),
        claimed_by: row.get(10)?,
        created_at: row.get(11)?,
        claimed_at: row.get(12)?,
        completed_at: row.get(13)?,
    })
}

const HANDOFF_COLUMNS: &str =
    "id, from_agent, to_agent, title, context, code, file_path, next_steps, priority, status,
     claimed_by, created_at, claimed_at, completed_at";

pub fn insert_handoff(conn: &Connection, handoff: &Handoff) -> Result<()> {
    conn.execute(
        "INSERT INTO handoffs (id, from_agent, to_agent, title, context, code, file_path,
                               next_steps, priority, status, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
        params![
            handoff.id,
            handoff.from_agent,
            handoff.to_agent,
            handoff.title,
            handoff.context,
            handoff.code,
            handoff.file_path,
            to_json_text(&handoff.next_steps),
            handoff.priority.as_str(),
            handoff.status.as_str(),
            handoff.created_at,
        ],
    )?;
    Ok(())
}

pub fn get_handoff(conn: &Connection, id: &str) -> Result<Option<Handoff>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {} FROM handoffs WHERE id = ?1",
        HANDOFF_COLUMNS
    ))?;
    let row = stmt.query_row(params![id], handoff_from_row).optional()?;
    Ok(row)
}

pub fn mark_handoff_claimed(conn: &Connection, id: &str, agent_id: &str) -> Result<()> {
    conn.execute(
        "UPDATE handoffs SET status = 'claimed', claimed_by = ?1, claimed_at = ?2 WHERE id = ?3",
        params![agent_id, now_rfc3339(), id],
    )?;
    Ok(())
}

pub fn mark_handoff_completed(conn: &Connection, id: &str) -> Result<()> {
    conn.execute(
        "UPDATE handoffs SET status = 'completed', completed_at = ?1 WHERE id = ?2",
        params![now_rfc3339(), id],
    )?;
    Ok(())
}

/// `toAgent` filter matches handoffs targeted at the agent or open ones.
pub fn list_handoffs(
    conn: &Connection,
    to_agent: Option<&str>,
    from_agent: Option<&str>,
    status: Option<&str>,
) -> Result<Vec<Handoff>> {
    let mut sql = format!("SELECT {} FROM handoffs WHERE 1=1", HANDOFF_COLUMNS);
    let mut args: Vec<String> = Vec::new();
    if let Some(to_agent) = to_agent {
        sql.push_str(&format!(
            " AND (to_agent = ?{} OR to_agent IS NULL)",
            args.len() + 1
        ));
        args.push(to_agent.to_string());
    }
    if let Some(from_agent) = from_agent {
        sql.push_str(&format!(" AND from_agent = ?{}", args.len() + 1));
        args.push(from_agent.to_string());
    }
    if let Some(status) = status {
        sql.push_str(&format!(" AND status = ?{}", args.len() + 1));
        args.push(status.to_string());
    }
    sql.push_str(" ORDER BY created_at ASC");
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt
        .query_map(rusqlite::params_from_iter(args.iter()), handoff_from_row)?
        .collect::<std::result::Result<Vec<_>, _>>()?;
    Ok(rows)
}

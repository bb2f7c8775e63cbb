//! SQL persistence for AgentState

use rusqlite::{params, Connection, OptionalExtension, Row};
use uuid::Uuid;

use super::model::*;
use crate::runtime::storage::{json_string_vec, now_rfc3339, to_json_text};
use crate::Result;

pub fn bootstrap(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        r#"
        CREATE TABLE IF NOT EXISTS checkpoint (
            id INTEGER PRIMARY KEY CHECK (id = 1),
            conversation_summary TEXT,
            accomplishments TEXT,
            pending_work TEXT,
            recent_context TEXT,
            files_edited TEXT,
            checkpoint_at TEXT NOT NULL
        );
        CREATE TABLE IF NOT EXISTS messages (
            id TEXT PRIMARY KEY,
            from_agent TEXT NOT NULL,
            type TEXT NOT NULL,
            message TEXT NOT NULL,
            timestamp TEXT NOT NULL,
            read INTEGER NOT NULL DEFAULT 0
        );
        CREATE TABLE IF NOT EXISTS memories (
            id TEXT PRIMARY KEY,
            category TEXT NOT NULL,
            content TEXT NOT NULL,
            tags TEXT,
            created_at TEXT NOT NULL
        );
        CREATE TABLE IF NOT EXISTS work_sessions (
            session_id TEXT PRIMARY KEY,
            task TEXT NOT NULL,
            started_at TEXT NOT NULL,
            completed_at TEXT,
            summary TEXT
        );
        CREATE TABLE IF NOT EXISTS work_steps (
            id TEXT PRIMARY KEY,
            session_id TEXT NOT NULL,
            seq INTEGER NOT NULL,
            timestamp TEXT NOT NULL,
            tool TEXT NOT NULL,
            intent TEXT NOT NULL,
            outcome TEXT NOT NULL,
            duration_ms INTEGER NOT NULL DEFAULT 0,
            contribution_type TEXT,
            knowledge_gained TEXT,
            eliminated_paths TEXT,
            depends_on TEXT
        );
        CREATE INDEX IF NOT EXISTS idx_work_steps_session ON work_steps(session_id);
        CREATE TABLE IF NOT EXISTS escalations (
            id TEXT PRIMARY KEY,
            session_id TEXT NOT NULL,
            triggered_at TEXT NOT NULL,
            triggers TEXT NOT NULL,
            highest_level INTEGER NOT NULL,
            resolved_at TEXT,
            resolved_by TEXT,
            resolver_agent TEXT,
            helpful_hint TEXT
        );
        CREATE INDEX IF NOT EXISTS idx_escalations_session ON escalations(session_id);
        CREATE INDEX IF NOT EXISTS idx_escalations_open
            ON escalations(resolved_at) WHERE resolved_at IS NULL;
        CREATE TABLE IF NOT EXISTS soul (
            id INTEGER PRIMARY KEY CHECK (id = 1),
            soul_id TEXT NOT NULL,
            name TEXT NOT NULL,
            personality TEXT NOT NULL,
            created_at TEXT NOT NULL,
            total_xp INTEGER NOT NULL DEFAULT 0,
            level TEXT NOT NULL DEFAULT 'novice',
            current_streak INTEGER NOT NULL DEFAULT 0,
            longest_streak INTEGER NOT NULL DEFAULT 0,
            tasks_completed INTEGER NOT NULL DEFAULT 0,
            tasks_successful INTEGER NOT NULL DEFAULT 0,
            tasks_with_escalations INTEGER NOT NULL DEFAULT 0,
            peers_helped INTEGER NOT NULL DEFAULT 0,
            escalation_count INTEGER NOT NULL DEFAULT 0,
            self_resolved_count INTEGER NOT NULL DEFAULT 0,
            peer_assist_count INTEGER NOT NULL DEFAULT 0,
            human_escalation_count INTEGER NOT NULL DEFAULT 0,
            specializations TEXT NOT NULL DEFAULT '{}',
            achievements TEXT NOT NULL DEFAULT '[]',
            abilities TEXT NOT NULL DEFAULT '{}',
            trust_score REAL NOT NULL DEFAULT 0.5,
            transparency_score REAL NOT NULL DEFAULT 0.5,
            track_record_score REAL NOT NULL DEFAULT 0.5,
            last_trace_id TEXT,
            last_trace_at TEXT,
            last_streak_at TEXT
        );
        CREATE TABLE IF NOT EXISTS credentials (
            key TEXT PRIMARY KEY,
            value TEXT NOT NULL,
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL
        );
        CREATE TABLE IF NOT EXISTS goals (
            id TEXT PRIMARY KEY,
            title TEXT NOT NULL,
            description TEXT,
            type TEXT NOT NULL,
            priority INTEGER NOT NULL DEFAULT 0,
            status TEXT NOT NULL DEFAULT 'pending',
            xp_reward INTEGER NOT NULL DEFAULT 0,
            source TEXT NOT NULL,
            assigned_by TEXT,
            context TEXT,
            created_at TEXT NOT NULL,
            started_at TEXT,
            completed_at TEXT,
            outcome TEXT
        );
        CREATE INDEX IF NOT EXISTS idx_goals_status ON goals(status);
        CREATE INDEX IF NOT EXISTS idx_goals_priority ON goals(priority DESC);
        CREATE TABLE IF NOT EXISTS heartbeat (
            id INTEGER PRIMARY KEY CHECK (id = 1),
            last_heartbeat TEXT NOT NULL,
            stall_threshold_ms INTEGER NOT NULL DEFAULT 300000
        );
        CREATE TABLE IF NOT EXISTS heartbeat_log (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            timestamp TEXT NOT NULL,
            status TEXT,
            detail TEXT
        );
        CREATE INDEX IF NOT EXISTS idx_heartbeat_log_timestamp ON heartbeat_log(timestamp);
        CREATE TABLE IF NOT EXISTS shadow (
            id INTEGER PRIMARY KEY CHECK (id = 1),
            shadow_agent TEXT,
            status TEXT NOT NULL DEFAULT 'none',
            updated_at TEXT NOT NULL
        );
        "#,
    )?;
    Ok(())
}

// --- checkpoint ---

pub fn get_checkpoint(conn: &Connection) -> Result<Option<AgentCheckpoint>> {
    let row = conn
        .query_row(
            "SELECT conversation_summary, accomplishments, pending_work, recent_context,
                    files_edited, checkpoint_at
             FROM checkpoint WHERE id = 1",
            [],
            |row| {
                Ok(AgentCheckpoint {
                    conversation_summary: row.get(0)?,
                    accomplishments: json_string_vec(row.get(1)?),
                    pending_work: json_string_vec(row.get(2)?),
                    recent_context: row.get(3)?,
                    files_edited: json_string_vec(row.get(4)?),
                    checkpoint_at: row.get(5)?,
                })
            },
        )
        .optional()?;
    Ok(row)
}

/// COALESCE semantics: absent fields keep the stored values.
pub fn save_checkpoint(conn: &Connection, req: &CheckpointSaveRequest) -> Result<AgentCheckpoint> {
    let existing = get_checkpoint(conn)?.unwrap_or_default();
    let merged = AgentCheckpoint {
        conversation_summary: req
            .conversation_summary
            .clone()
            .or(existing.conversation_summary),
        accomplishments: req
            .accomplishments
            .clone()
            .unwrap_or(existing.accomplishments),
        pending_work: req.pending_work.clone().unwrap_or(existing.pending_work),
        recent_context: req.recent_context.clone().or(existing.recent_context),
        files_edited: req.files_edited.clone().unwrap_or(existing.files_edited),
        checkpoint_at: Some(now_rfc3339()),
    };
    conn.execute(
        "INSERT INTO checkpoint (id, conversation_summary, accomplishments, pending_work,
                                 recent_context, files_edited, checkpoint_at)
         VALUES (1, ?1, ?2, ?3, ?4, ?5, ?6)
         ON CONFLICT(id) DO UPDATE SET
             conversation_summary = excluded.conversation_summary,
             accomplishments = excluded.accomplishments,
             pending_work = excluded.pending_work,
             recent_context = excluded.recent_context,
             files_edited = excluded.files_edited,
             checkpoint_at = excluded.checkpoint_at",
        params![
            merged.conversation_summary,
            to_json_text(&merged.accomplishments),
            to_json_text(&merged.pending_work),
            merged.recent_context,
            to_json_text(&merged.files_edited),
            merged.checkpoint_at,
        ],
    )?;
    Ok(merged)
}

// --- direct messages ---

fn message_from_row(row: &Row) -> rusqlite::Result<DirectMessage> {
    Ok(DirectMessage {
        id: row.get(0)?,
        from: row.get(1)?,
        message_type: match row.get::<_, String>(2)?.as_str() {
            "status" => DirectMessageType::Status,
            "handoff" => DirectMessageType::Handoff,
            "mention" => DirectMessageType::Mention,
            _ => DirectMessageType::Note,
        },
        message: row.get(3)?,
        timestamp: row.get(4)?,
        read: row.get::<_, i64>(5)? != 0,
    })
}

pub fn append_message(conn: &Connection, req: &SendMessageRequest) -> Result<DirectMessage> {
    let message = DirectMessage {
        id: Uuid::new_v4().to_string(),
        from: req.from.clone(),
        message_type: req.message_type.unwrap_or(DirectMessageType::Note),
        message: req.message.clone(),
        timestamp: now_rfc3339(),
        read: false,
    };
    let type_text = match message.message_type {
        DirectMessageType::Status => "status",
        DirectMessageType::Handoff => "handoff",
        DirectMessageType::Note => "note",
        DirectMessageType::Mention => "mention",
    };
    conn.execute(
        "INSERT INTO messages (id, from_agent, type, message, timestamp, read)
         VALUES (?1, ?2, ?3, ?4, ?5, 0)",
        params![
            message.id,
            message.from,
            type_text,
            message.message,
            message.timestamp
        ],
    )?;
    Ok(message)
}

pub fn list_messages(conn: &Connection, unread_only: bool, limit: usize) -> Result<Vec<DirectMessage>> {
    let sql = if unread_only {
        "SELECT id, from_agent, type, message, timestamp, read FROM messages
         WHERE read = 0 ORDER BY timestamp DESC LIMIT ?1"
    } else {
        "SELECT id, from_agent, type, message, timestamp, read FROM messages
         ORDER BY timestamp DESC LIMIT ?1"
    };
    let mut stmt = conn.prepare(sql)?;
    let rows = stmt
        .query_map(params![limit as i64], message_from_row)?
        .collect::<std::result::Result<Vec<_>, _>>()?;
    Ok(rows)
}

pub fn mark_messages_read(conn: &Connection, ids: &[String]) -> Result<usize> {
    let mut updated = 0;
    for id in ids {
        updated += conn.execute("UPDATE messages SET read = 1 WHERE id = ?1", params![id])?;
    }
    Ok(updated)
}

// --- memory ---

fn category_text(category: MemoryCategory) -> &'static str {
    match category {
        MemoryCategory::Discovery => "discovery",
        MemoryCategory::Decision => "decision",
        MemoryCategory::Blocker => "blocker",
        MemoryCategory::Learning => "learning",
        MemoryCategory::Pattern => "pattern",
        MemoryCategory::Warning => "warning",
    }
}

fn category_from_text(text: &str) -> MemoryCategory {
    match text {
        "discovery" => MemoryCategory::Discovery,
        "decision" => MemoryCategory::Decision,
        "blocker" => MemoryCategory::Blocker,
        "pattern" => MemoryCategory::Pattern,
        "warning" => MemoryCategory::Warning,
        _ => MemoryCategory::Learning,
    }
}

pub fn save_memory(conn: &Connection, req: &SaveMemoryRequest) -> Result<Memory> {
    let memory = Memory {
        id: Uuid::new_v4().to_string(),
        category: req.category,
        content: req.content.clone(),
        tags: req.tags.clone(),
        created_at: now_rfc3339(),
    };
    conn.execute(
        "INSERT INTO memories (id, category, content, tags, created_at) VALUES (?1, ?2, ?3, ?4, ?5)",
        params![
            memory.id,
            category_text(memory.category),
            memory.content,
            to_json_text(&memory.tags),
            memory.created_at
        ],
    )?;
    Ok(memory)
}

/// Category equality plus substring match against content and the
/// JSON-encoded tag array; newest first, capped at 50.
pub fn search_memories(
    conn: &Connection,
    category: Option<&str>,
    query: Option<&str>,
) -> Result<Vec<Memory>> {
    let mut stmt = conn.prepare(
        "SELECT id, category, content, tags, created_at FROM memories ORDER BY created_at DESC",
    )?;
    let rows = stmt
        .query_map([], |row| {
            Ok(Memory {
                id: row.get(0)?,
                category: category_from_text(&row.get::<_, String>(1)?),
                content: row.get(2)?,
                tags: json_string_vec(row.get(3)?),
                created_at: row.get(4)?,
            })
        })?
        .collect::<std::result::Result<Vec<_>, _>>()?;

    let needle = query.map(str::to_lowercase);
    let filtered = rows
        .into_iter()
        .filter(|memory| {
            if let Some(category) = category {
                if category_text(memory.category) != category {
                    return false;
                }
            }
            if let Some(needle) = &needle {
                let tags_json = to_json_text(&memory.tags).to_lowercase();
                return memory.content.to_lowercase().contains(needle)
                    || tags_json.contains(needle);
            }
            true
        })
        .take(50)
        .collect();
    Ok(filtered)
}

// --- work traces ---

pub fn insert_trace(conn: &Connection, trace: &WorkTrace) -> Result<()> {
    conn.execute(
        "INSERT INTO work_sessions (session_id, task, started_at) VALUES (?1, ?2, ?3)",
        params![trace.session_id, trace.task, trace.started_at],
    )?;
    Ok(())
}

pub fn get_trace(conn: &Connection, session_id: &str) -> Result<Option<WorkTrace>> {
    let row = conn
        .query_row(
            "SELECT session_id, task, started_at, completed_at, summary
             FROM work_sessions WHERE session_id = ?1",
            params![session_id],
            |row| {
                Ok(WorkTrace {
                    session_id: row.get(0)?,
                    task: row.get(1)?,
                    started_at: row.get(2)?,
                    completed_at: row.get(3)?,
                    summary: row
                        .get::<_, Option<String>>(4)?
                        .and_then(|text| serde_json::from_str(&text).ok()),
                })
            },
        )
        .optional()?;
    Ok(row)
}

pub fn open_traces(conn: &Connection) -> Result<Vec<WorkTrace>> {
    let mut stmt = conn.prepare(
        "SELECT session_id, task, started_at, completed_at, summary
         FROM work_sessions WHERE completed_at IS NULL ORDER BY started_at DESC",
    )?;
    let rows = stmt
        .query_map([], |row| {
            Ok(WorkTrace {
                session_id: row.get(0)?,
                task: row.get(1)?,
                started_at: row.get(2)?,
                completed_at: row.get(3)?,
                summary: None,
            })
        })?
        .collect::<std::result::Result<Vec<_>, _>>()?;
    Ok(rows)
}

fn step_from_row(row: &Row) -> rusqlite::Result<WorkStep> {
    Ok(WorkStep {
        id: row.get(0)?,
        session_id: row.get(1)?,
        timestamp: row.get(2)?,
        tool: row.get(3)?,
        intent: row.get(4)?,
        outcome: match row.get::<_, String>(5)?.as_str() {
            "found" => StepOutcome::Found,
            "error" => StepOutcome::Error,
            "partial" => StepOutcome::Partial,
            _ => StepOutcome::Nothing,
        },
        duration_ms: row.get(6)?,
        contribution_type: row.get::<_, Option<String>>(7)?.as_deref().and_then(|t| {
            match t {
                "enabling" => Some(ContributionType::Enabling),
                "pruning" => Some(ContributionType::Pruning),
                "direct" => Some(ContributionType::Direct),
                "minimal" => Some(ContributionType::Minimal),
                _ => None,
            }
        }),
        knowledge_gained: json_string_vec(row.get(8)?),
        eliminated_paths: json_string_vec(row.get(9)?),
        depends_on: json_string_vec(row.get(10)?),
    })
}

pub fn insert_step(conn: &Connection, step: &WorkStep) -> Result<()> {
    let outcome = match step.outcome {
        StepOutcome::Found => "found",
        StepOutcome::Nothing => "nothing",
        StepOutcome::Error => "error",
        StepOutcome::Partial => "partial",
    };
    let contribution = step.contribution_type.map(|c| match c {
        ContributionType::Enabling => "enabling",
        ContributionType::Pruning => "pruning",
        ContributionType::Direct => "direct",
        ContributionType::Minimal => "minimal",
    });
    conn.execute(
        "INSERT INTO work_steps (id, session_id, seq, timestamp, tool, intent, outcome,
                                 duration_ms, contribution_type, knowledge_gained,
                                 eliminated_paths, depends_on)
         VALUES (?1, ?2,
                 (SELECT COALESCE(MAX(seq), 0) + 1 FROM work_steps WHERE session_id = ?2),
                 ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
        params![
            step.id,
            step.session_id,
            step.timestamp,
            step.tool,
            step.intent,
            outcome,
            step.duration_ms,
            contribution,
            to_json_text(&step.knowledge_gained),
            to_json_text(&step.eliminated_paths),
            to_json_text(&step.depends_on),
        ],
    )?;
    Ok(())
}

pub fn steps_for_session(conn: &Connection, session_id: &str) -> Result<Vec<WorkStep>> {
    let mut stmt = conn.prepare(
        "SELECT id, session_id, timestamp, tool, intent, outcome, duration_ms,
                contribution_type, knowledge_gained, eliminated_paths, depends_on
         FROM work_steps WHERE session_id = ?1 ORDER BY seq ASC",
    )?;
    let rows = stmt
        .query_map(params![session_id], step_from_row)?
        .collect::<std::result::Result<Vec<_>, _>>()?;
    Ok(rows)
}

pub fn steps_since(conn: &Connection, cutoff: &str) -> Result<Vec<WorkStep>> {
    let mut stmt = conn.prepare(
        "SELECT s.id, s.session_id, s.timestamp, s.tool, s.intent, s.outcome, s.duration_ms,
                s.contribution_type, s.knowledge_gained, s.eliminated_paths, s.depends_on
         FROM work_steps s
         JOIN work_sessions w ON w.session_id = s.session_id
         WHERE w.completed_at IS NULL AND s.timestamp > ?1
         ORDER BY s.timestamp ASC",
    )?;
    let rows = stmt
        .query_map(params![cutoff], step_from_row)?
        .collect::<std::result::Result<Vec<_>, _>>()?;
    Ok(rows)
}

pub fn complete_trace(conn: &Connection, session_id: &str, summary: &WorkSummary) -> Result<()> {
    conn.execute(
        "UPDATE work_sessions SET completed_at = ?1, summary = ?2 WHERE session_id = ?3",
        params![now_rfc3339(), to_json_text(summary), session_id],
    )?;
    Ok(())
}

// --- escalations ---

fn escalation_from_row(row: &Row) -> rusqlite::Result<Escalation> {
    Ok(Escalation {
        id: row.get(0)?,
        session_id: row.get(1)?,
        triggered_at: row.get(2)?,
        triggers: row
            .get::<_, String>(3)
            .map(|text| serde_json::from_str(&text).unwrap_or_default())?,
        highest_level: row.get::<_, i64>(4)? as u8,
        resolved_at: row.get(5)?,
        resolved_by: row.get::<_, Option<String>>(6)?.as_deref().and_then(|t| {
            match t {
                "self" => Some(ResolvedBy::SelfAgent),
                "peer" => Some(ResolvedBy::Peer),
                "human" => Some(ResolvedBy::Human),
                _ => None,
            }
        }),
        resolver_agent: row.get(7)?,
        helpful_hint: row.get(8)?,
    })
}

const ESCALATION_COLUMNS: &str = "id, session_id, triggered_at, triggers, highest_level,
     resolved_at, resolved_by, resolver_agent, helpful_hint";

pub fn insert_escalation(conn: &Connection, escalation: &Escalation) -> Result<()> {
    conn.execute(
        "INSERT INTO escalations (id, session_id, triggered_at, triggers, highest_level)
         VALUES (?1, ?2, ?3, ?4, ?5)",
        params![
            escalation.id,
            escalation.session_id,
            escalation.triggered_at,
            to_json_text(&escalation.triggers),
            escalation.highest_level as i64,
        ],
    )?;
    Ok(())
}

pub fn escalations_for_session(conn: &Connection, session_id: &str) -> Result<Vec<Escalation>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {} FROM escalations WHERE session_id = ?1 ORDER BY triggered_at ASC",
        ESCALATION_COLUMNS
    ))?;
    let rows = stmt
        .query_map(params![session_id], escalation_from_row)?
        .collect::<std::result::Result<Vec<_>, _>>()?;
    Ok(rows)
}

pub fn get_escalation(conn: &Connection, id: &str) -> Result<Option<Escalation>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {} FROM escalations WHERE id = ?1",
        ESCALATION_COLUMNS
    ))?;
    let row = stmt.query_row(params![id], escalation_from_row).optional()?;
    Ok(row)
}

pub fn latest_unresolved_escalation(
    conn: &Connection,
    session_id: &str,
) -> Result<Option<Escalation>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {} FROM escalations
         WHERE session_id = ?1 AND resolved_at IS NULL
         ORDER BY triggered_at DESC LIMIT 1",
        ESCALATION_COLUMNS
    ))?;
    let row = stmt
        .query_row(params![session_id], escalation_from_row)
        .optional()?;
    Ok(row)
}

pub fn unresolved_escalation_count(conn: &Connection) -> Result<i64> {
    let count = conn.query_row(
        "SELECT COUNT(*) FROM escalations WHERE resolved_at IS NULL",
        [],
        |row| row.get(0),
    )?;
    Ok(count)
}

pub fn resolve_escalation(
    conn: &Connection,
    id: &str,
    resolved_by: ResolvedBy,
    resolver_agent: Option<&str>,
    helpful_hint: Option<&str>,
) -> Result<()> {
    let by = match resolved_by {
        ResolvedBy::SelfAgent => "self",
        ResolvedBy::Peer => "peer",
        ResolvedBy::Human => "human",
    };
    conn.execute(
        "UPDATE escalations
         SET resolved_at = ?1, resolved_by = ?2, resolver_agent = ?3, helpful_hint = ?4
         WHERE id = ?5 AND resolved_at IS NULL",
        params![now_rfc3339(), by, resolver_agent, helpful_hint, id],
    )?;
    Ok(())
}

// --- soul ---

pub struct SoulRow {
    pub soul: Soul,
    pub tasks_with_escalations: i64,
    pub last_trace_at: Option<String>,
    pub last_streak_at: Option<String>,
}

pub fn load_soul(conn: &Connection) -> Result<Option<SoulRow>> {
    let row = conn
        .query_row(
            "SELECT soul_id, name, personality, created_at, total_xp, level, current_streak,
                    longest_streak, tasks_completed, tasks_successful, tasks_with_escalations,
                    peers_helped, escalation_count, self_resolved_count, peer_assist_count,
                    human_escalation_count, specializations, achievements, abilities,
                    trust_score, transparency_score, track_record_score,
                    last_trace_id, last_trace_at, last_streak_at
             FROM soul WHERE id = 1",
            [],
            |row| {
                let level = match row.get::<_, String>(5)?.as_str() {
                    "capable" => SoulLevel::Capable,
                    "expert" => SoulLevel::Expert,
                    "master" => SoulLevel::Master,
                    _ => SoulLevel::Novice,
                };
                Ok(SoulRow {
                    soul: Soul {
                        soul_id: row.get(0)?,
                        name: row.get(1)?,
                        personality: row.get(2)?,
                        created_at: row.get(3)?,
                        total_xp: row.get(4)?,
                        level,
                        current_streak: row.get(6)?,
                        longest_streak: row.get(7)?,
                        tasks_completed: row.get(8)?,
                        tasks_successful: row.get(9)?,
                        peers_helped: row.get(11)?,
                        escalation_count: row.get(12)?,
                        self_resolved_count: row.get(13)?,
                        peer_assist_count: row.get(14)?,
                        human_escalation_count: row.get(15)?,
                        specializations: row
                            .get::<_, String>(16)
                            .map(|text| serde_json::from_str(&text).unwrap_or_default())?,
                        achievements: row
                            .get::<_, String>(17)
                            .map(|text| serde_json::from_str(&text).unwrap_or_default())?,
                        abilities: row
                            .get::<_, String>(18)
                            .map(|text| serde_json::from_str(&text).unwrap_or_default())?,
                        trust_score: row.get(19)?,
                        transparency_score: row.get(20)?,
                        track_record_score: row.get(21)?,
                        last_trace_id: row.get(22)?,
                        rust_level: 0.0,
                        effective_xp_multiplier: 1.0,
                    },
                    tasks_with_escalations: row.get(10)?,
                    last_trace_at: row.get(23)?,
                    last_streak_at: row.get(24)?,
                })
            },
        )
        .optional()?;
    Ok(row)
}

pub fn insert_soul(conn: &Connection, soul: &Soul) -> Result<()> {
    conn.execute(
        "INSERT INTO soul (id, soul_id, name, personality, created_at, total_xp, level,
                           current_streak, longest_streak, specializations, achievements,
                           abilities, trust_score, transparency_score, track_record_score)
         VALUES (1, ?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14)",
        params![
            soul.soul_id,
            soul.name,
            soul.personality,
            soul.created_at,
            soul.total_xp,
            soul.level.as_str(),
            soul.current_streak,
            soul.longest_streak,
            to_json_text(&soul.specializations),
            to_json_text(&soul.achievements),
            to_json_text(&soul.abilities),
            soul.trust_score,
            soul.transparency_score,
            soul.track_record_score,
        ],
    )?;
    Ok(())
}

pub fn update_soul(conn: &Connection, row: &SoulRow) -> Result<()> {
    conn.execute(
        "UPDATE soul SET
             total_xp = ?1, level = ?2, current_streak = ?3, longest_streak = ?4,
             tasks_completed = ?5, tasks_successful = ?6, tasks_with_escalations = ?7,
             peers_helped = ?8, escalation_count = ?9, self_resolved_count = ?10,
             peer_assist_count = ?11, human_escalation_count = ?12, specializations = ?13,
             achievements = ?14, abilities = ?15, trust_score = ?16,
             transparency_score = ?17, track_record_score = ?18,
             last_trace_id = ?19, last_trace_at = ?20, last_streak_at = ?21
         WHERE id = 1",
        params![
            row.soul.total_xp,
            row.soul.level.as_str(),
            row.soul.current_streak,
            row.soul.longest_streak,
            row.soul.tasks_completed,
            row.soul.tasks_successful,
            row.tasks_with_escalations,
            row.soul.peers_helped,
            row.soul.escalation_count,
            row.soul.self_resolved_count,
            row.soul.peer_assist_count,
            row.soul.human_escalation_count,
            to_json_text(&row.soul.specializations),
            to_json_text(&row.soul.achievements),
            to_json_text(&row.soul.abilities),
            row.soul.trust_score,
            row.soul.transparency_score,
            row.soul.track_record_score,
            row.soul.last_trace_id,
            row.last_trace_at,
            row.last_streak_at,
        ],
    )?;
    Ok(())
}

// --- credentials ---

pub fn masked_preview(value: &str) -> String {
    let chars: Vec<char> = value.chars().collect();
    if chars.len() > 12 {
        let head: String = chars[..4].iter().collect();
        let tail: String = chars[chars.len() - 4..].iter().collect();
        format!("{}...{}", head, tail)
    } else {
        "****".to_string()
    }
}

pub fn set_credential(conn: &Connection, key: &str, value: &str) -> Result<Credential> {
    let now = now_rfc3339();
    conn.execute(
        "INSERT INTO credentials (key, value, created_at, updated_at)
         VALUES (?1, ?2, ?3, ?3)
         ON CONFLICT(key) DO UPDATE SET value = excluded.value, updated_at = excluded.updated_at",
        params![key, value, now],
    )?;
    let (created_at, updated_at) = conn.query_row(
        "SELECT created_at, updated_at FROM credentials WHERE key = ?1",
        params![key],
        |row| Ok((row.get(0)?, row.get(1)?)),
    )?;
    Ok(Credential {
        key: key.to_string(),
        created_at,
        updated_at,
        masked_preview: masked_preview(value),
    })
}

pub fn list_credentials(conn: &Connection) -> Result<Vec<Credential>> {
    let mut stmt =
        conn.prepare("SELECT key, value, created_at, updated_at FROM credentials ORDER BY key")?;
    let rows = stmt
        .query_map([], |row| {
            let value: String = row.get(1)?;
            Ok(Credential {
                key: row.get(0)?,
                created_at: row.get(2)?,
                updated_at: row.get(3)?,
                masked_preview: masked_preview(&value),
            })
        })?
        .collect::<std::result::Result<Vec<_>, _>>()?;
    Ok(rows)
}

pub fn credential_bundle(conn: &Connection) -> Result<Vec<(String, String)>> {
    let mut stmt = conn.prepare("SELECT key, value FROM credentials ORDER BY key")?;
    let rows = stmt
        .query_map([], |row| Ok((row.get(0)?, row.get(1)?)))?
        .collect::<std::result::Result<Vec<_>, _>>()?;
    Ok(rows)
}

pub fn delete_credential(conn: &Connection, key: &str) -> Result<bool> {
    let deleted = conn.execute("DELETE FROM credentials WHERE key = ?1", params![key])?;
    Ok(deleted > 0)
}

// --- goals ---

fn goal_from_row(row: &Row) -> rusqlite::Result<Goal> {
    Ok(Goal {
        id: row.get(0)?,
        title: row.get(1)?,
        description: row.get(2)?,
        goal_type: row.get(3)?,
        priority: row.get(4)?,
        status: match row.get::<_, String>(5)?.as_str() {
            "in_progress" => GoalStatus::InProgress,
            "completed" => GoalStatus::Completed,
            "failed" => GoalStatus::Failed,
            "abandoned" => GoalStatus::Abandoned,
            _ => GoalStatus::Pending,
        },
        xp_reward: row.get(6)?,
        source: row.get(7)?,
        assigned_by: row.get(8)?,
        context: row.get(9)?,
        created_at: row.get(10)?,
        started_at: row.get(11)?,
        completed_at: row.get(12)?,
        outcome: row.get(13)?,
    })
}

const GOAL_COLUMNS: &str = "id, title, description, type, priority, status, xp_reward, source,
     assigned_by, context, created_at, started_at, completed_at, outcome";

pub fn insert_goal(conn: &Connection, goal: &Goal) -> Result<()> {
    conn.execute(
        "INSERT INTO goals (id, title, description, type, priority, status, xp_reward, source,
                            assigned_by, context, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
        params![
            goal.id,
            goal.title,
            goal.description,
            goal.goal_type,
            goal.priority,
            goal.status.as_str(),
            goal.xp_reward,
            goal.source,
            goal.assigned_by,
            goal.context,
            goal.created_at,
        ],
    )?;
    Ok(())
}

pub fn get_goal(conn: &Connection, id: &str) -> Result<Option<Goal>> {
    let mut stmt = conn.prepare(&format!("SELECT {} FROM goals WHERE id = ?1", GOAL_COLUMNS))?;
    let row = stmt.query_row(params![id], goal_from_row).optional()?;
    Ok(row)
}

/// Queue order: highest priority first, then oldest first.
pub fn list_goals(conn: &Connection, status: Option<&str>) -> Result<Vec<Goal>> {
    let rows = match status {
        Some(status) => {
            let mut stmt = conn.prepare(&format!(
                "SELECT {} FROM goals WHERE status = ?1
                 ORDER BY priority DESC, created_at ASC",
                GOAL_COLUMNS
            ))?;
            let rows = stmt
                .query_map(params![status], goal_from_row)?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            rows
        }
        None => {
            let mut stmt = conn.prepare(&format!(
                "SELECT {} FROM goals ORDER BY priority DESC, created_at ASC",
                GOAL_COLUMNS
            ))?;
            let rows = stmt
                .query_map([], goal_from_row)?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            rows
        }
    };
    Ok(rows)
}

pub fn update_goal_status(
    conn: &Connection,
    id: &str,
    status: GoalStatus,
    outcome: Option<&str>,
) -> Result<()> {
    match status {
        GoalStatus::InProgress => {
            conn.execute(
                "UPDATE goals SET status = ?1, started_at = ?2 WHERE id = ?3",
                params![status.as_str(), now_rfc3339(), id],
            )?;
        }
        GoalStatus::Completed | GoalStatus::Failed | GoalStatus::Abandoned => {
            conn.execute(
                "UPDATE goals SET status = ?1, completed_at = ?2, outcome = ?3 WHERE id = ?4",
                params![status.as_str(), now_rfc3339(), outcome, id],
            )?;
        }
        GoalStatus::Pending => {
            conn.execute(
                "UPDATE goals SET status = ?1 WHERE id = ?2",
                params![status.as_str(), id],
            )?;
        }
    }
    Ok(())
}

pub fn delete_goal(conn: &Connection, id: &str) -> Result<bool> {
    let deleted = conn.execute("DELETE FROM goals WHERE id = ?1", params![id])?;
    Ok(deleted > 0)
}

// --- heartbeat / shadow ---

pub fn record_heartbeat(conn: &Connection, req: &HeartbeatRequest) -> Result<String> {
    let now = now_rfc3339();
    conn.execute(
        "INSERT INTO heartbeat (id, last_heartbeat, stall_threshold_ms)
         VALUES (1, ?1, COALESCE(?2, 300000))
         ON CONFLICT(id) DO UPDATE SET
             last_heartbeat = excluded.last_heartbeat,
             stall_threshold_ms = COALESCE(?2, heartbeat.stall_threshold_ms)",
        params![now, req.stall_threshold_ms],
    )?;
    conn.execute(
        "INSERT INTO heartbeat_log (timestamp, status, detail) VALUES (?1, ?2, ?3)",
        params![now, req.status, req.detail],
    )?;
    // Ring buffer: retain the most recent 100 entries.
    conn.execute(
        "DELETE FROM heartbeat_log WHERE id NOT IN
             (SELECT id FROM heartbeat_log ORDER BY id DESC LIMIT 100)",
        [],
    )?;
    Ok(now)
}

pub fn heartbeat_state(conn: &Connection) -> Result<Option<(String, i64)>> {
    let row = conn
        .query_row(
            "SELECT last_heartbeat, stall_threshold_ms FROM heartbeat WHERE id = 1",
            [],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )
        .optional()?;
    Ok(row)
}

pub fn heartbeat_log_count(conn: &Connection) -> Result<i64> {
    let count = conn.query_row("SELECT COUNT(*) FROM heartbeat_log", [], |row| row.get(0))?;
    Ok(count)
}

pub fn get_shadow(conn: &Connection) -> Result<Option<ShadowState>> {
    let row = conn
        .query_row(
            "SELECT shadow_agent, status, updated_at FROM shadow WHERE id = 1",
            [],
            |row| {
                Ok(ShadowState {
                    shadow_agent: row.get(0)?,
                    status: row.get(1)?,
                    updated_at: row.get(2)?,
                })
            },
        )
        .optional()?;
    Ok(row)
}

pub fn set_shadow(conn: &Connection, shadow_agent: Option<&str>, status: &str) -> Result<ShadowState> {
    let now = now_rfc3339();
    conn.execute(
        "INSERT INTO shadow (id, shadow_agent, status, updated_at)
         VALUES (1, ?1, ?2, ?3)
         ON CONFLICT(id) DO UPDATE SET
             shadow_agent = excluded.shadow_agent,
             status = excluded.status,
             updated_at = excluded.updated_at",
        params![shadow_agent, status, now],
    )?;
    Ok(ShadowState {
        shadow_agent: shadow_agent.map(str::to_string),
        status: status.to_string(),
        updated_at: now,
    })
}

/// Counts used by the dashboard's session stats, scoped to "today".
pub fn session_stats_since(conn: &Connection, cutoff: &str) -> Result<(i64, i64, i64, i64)> {
    let started: i64 = conn.query_row(
        "SELECT COUNT(*) FROM work_sessions WHERE started_at >= ?1",
        params![cutoff],
        |row| row.get(0),
    )?;
    let completed: i64 = conn.query_row(
        "SELECT COUNT(*) FROM work_sessions WHERE completed_at >= ?1",
        params![cutoff],
        |row| row.get(0),
    )?;
    let steps: i64 = conn.query_row(
        "SELECT COUNT(*) FROM work_steps WHERE timestamp >= ?1",
        params![cutoff],
        |row| row.get(0),
    )?;
    let escalations: i64 = conn.query_row(
        "SELECT COUNT(*) FROM escalations WHERE triggered_at >= ?1",
        params![cutoff],
        |row| row.get(0),
    )?;
    Ok((started, completed, steps, escalations))
}

pub fn any_trace_started_since(conn: &Connection, cutoff: &str) -> Result<bool> {
    let count: i64 = conn.query_row(
        "SELECT COUNT(*) FROM work_sessions WHERE started_at >= ?1",
        params![cutoff],
        |row| row.get(0),
    )?;
    Ok(count > 0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::storage::open_in_memory;

    #[test]
    fn checkpoint_coalesces_missing_fields() {
        let conn = open_in_memory().unwrap();
        bootstrap(&conn).unwrap();

        save_checkpoint(
            &conn,
            &CheckpointSaveRequest {
                conversation_summary: Some("working on auth".to_string()),
                accomplishments: Some(vec!["wired login".to_string()]),
                ..Default::default()
            },
        )
        .unwrap();

        let merged = save_checkpoint(
            &conn,
            &CheckpointSaveRequest {
                pending_work: Some(vec!["tests".to_string()]),
                ..Default::default()
            },
        )
        .unwrap();

        assert_eq!(merged.conversation_summary.as_deref(), Some("working on auth"));
        assert_eq!(merged.accomplishments, vec!["wired login".to_string()]);
        assert_eq!(merged.pending_work, vec!["tests".to_string()]);
    }

    #[test]
    fn memory_search_matches_content_and_tags() {
        let conn = open_in_memory().unwrap();
        bootstrap(&conn).unwrap();

        save_memory(
            &conn,
            &SaveMemoryRequest {
                category: MemoryCategory::Discovery,
                content: "the auth module caches tokens".to_string(),
                tags: vec!["auth".to_string()],
            },
        )
        .unwrap();
        save_memory(
            &conn,
            &SaveMemoryRequest {
                category: MemoryCategory::Blocker,
                content: "ci is flaky".to_string(),
                tags: vec!["infra".to_string()],
            },
        )
        .unwrap();

        let by_content = search_memories(&conn, None, Some("caches")).unwrap();
        assert_eq!(by_content.len(), 1);

        let by_tag = search_memories(&conn, None, Some("infra")).unwrap();
        assert_eq!(by_tag.len(), 1);
        assert_eq!(by_tag[0].content, "ci is flaky");

        let by_category = search_memories(&conn, Some("discovery"), None).unwrap();
        assert_eq!(by_category.len(), 1);
    }

    #[test]
    fn masked_preview_formats() {
        assert_eq!(masked_preview("sk-abcdefghijklmnop"), "sk-a...mnop");
        assert_eq!(masked_preview("short"), "****");
    }

    #[test]
    fn heartbeat_log_is_ring_buffered() {
        let conn = open_in_memory().unwrap();
        bootstrap(&conn).unwrap();
        for _ in 0..120 {
            record_heartbeat(&conn, &HeartbeatRequest {
                status: Some("active".to_string()),
                detail: None,
                stall_threshold_ms: None,
            })
            .unwrap();
        }
        assert_eq!(heartbeat_log_count(&conn).unwrap(), 100);
    }
}

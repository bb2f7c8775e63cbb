//! SQL persistence for the VM pool

use rusqlite::{params, Connection, OptionalExtension, Row};

use super::model::*;
use crate::runtime::storage::now_rfc3339;
use crate::Result;

pub fn bootstrap(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        r#"
        CREATE TABLE IF NOT EXISTS vms (
            vm_id TEXT PRIMARY KEY,
            instance_id TEXT NOT NULL,
            status TEXT NOT NULL,
            public_ip TEXT,
            private_ip TEXT,
            region TEXT NOT NULL,
            vm_size TEXT NOT NULL,
            created_at TEXT NOT NULL,
            ready_at TEXT,
            last_health_check TEXT,
            health_status TEXT NOT NULL DEFAULT 'unknown',
            error_message TEXT,
            agent_count INTEGER NOT NULL DEFAULT 0,
            max_agents INTEGER NOT NULL,
            metadata TEXT
        );
        CREATE INDEX IF NOT EXISTS idx_vms_status ON vms(status);
        CREATE TABLE IF NOT EXISTS assignments (
            assignment_id TEXT PRIMARY KEY,
            agent_id TEXT NOT NULL,
            vm_id TEXT NOT NULL,
            assigned_at TEXT NOT NULL,
            status TEXT NOT NULL DEFAULT 'active',
            completed_at TEXT,
            task TEXT
        );
        CREATE INDEX IF NOT EXISTS idx_assignments_agent ON assignments(agent_id);
        CREATE INDEX IF NOT EXISTS idx_assignments_status ON assignments(status);
        CREATE TABLE IF NOT EXISTS health_checks (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            vm_id TEXT NOT NULL,
            timestamp TEXT NOT NULL,
            health_status TEXT NOT NULL,
            detail TEXT
        );
        CREATE INDEX IF NOT EXISTS idx_health_checks_vm ON health_checks(vm_id);
        CREATE TABLE IF NOT EXISTS pool_state (
            id INTEGER PRIMARY KEY CHECK (id = 1),
            config TEXT NOT NULL,
            pending_scale_up INTEGER NOT NULL DEFAULT 0,
            updated_at TEXT NOT NULL
        );
        "#,
    )?;
    Ok(())
}

fn vm_from_row(row: &Row) -> rusqlite::Result<Vm> {
    Ok(Vm {
        vm_id: row.get(0)?,
        instance_id: row.get(1)?,
        status: VmStatus::parse(&row.get::<_, String>(2)?),
        public_ip: row.get(3)?,
        private_ip: row.get(4)?,
        region: row.get(5)?,
        vm_size: VmSize::parse(&row.get::<_, String>(6)?),
        created_at: row.get(7)?,
        ready_at: row.get(8)?,
        last_health_check: row.get(9)?,
        health_status: HealthStatus::parse(&row.get::<_, String>(10)?),
        error_message: row.get(11)?,
        agent_count: row.get(12)?,
        max_agents: row.get(13)?,
        metadata: row
            .get::<_, Option<String>>(14)?
            .and_then(|text| serde_json::from_str(&text).ok()),
    })
}

const VM_COLUMNS: &str = "vm_id, instance_id, status, public_ip, private_ip, region, vm_size,
     created_at, ready_at, last_health_check, health_status, error_message,
     agent_count, max_agents, metadata";

pub fn insert_vm(conn: &Connection, vm: &Vm) -> Result<()> {
    conn.execute(
        "INSERT INTO vms (vm_id, instance_id, status, public_ip, private_ip, region, vm_size,
                          created_at, health_status, agent_count, max_agents, metadata)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
        params![
            vm.vm_id,
            vm.instance_id,
            vm.status.as_str(),
            vm.public_ip,
            vm.private_ip,
            vm.region,
            vm.vm_size.as_str(),
            vm.created_at,
            vm.health_status.as_str(),
            vm.agent_count,
            vm.max_agents,
            vm.metadata.as_ref().map(|m| m.to_string()),
        ],
    )?;
    Ok(())
}

pub fn get_vm(conn: &Connection, vm_id: &str) -> Result<Option<Vm>> {
    let mut stmt = conn.prepare(&format!("SELECT {} FROM vms WHERE vm_id = ?1", VM_COLUMNS))?;
    let row = stmt.query_row(params![vm_id], vm_from_row).optional()?;
    Ok(row)
}

pub fn list_vms(conn: &Connection, status: Option<&str>) -> Result<Vec<Vm>> {
    let rows = match status {
        Some(status) => {
            let mut stmt = conn.prepare(&format!(
                "SELECT {} FROM vms WHERE status = ?1 ORDER BY created_at DESC",
                VM_COLUMNS
            ))?;
            let rows = stmt
                .query_map(params![status], vm_from_row)?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            rows
        }
        None => {
            let mut stmt = conn.prepare(&format!(
                "SELECT {} FROM vms ORDER BY created_at DESC",
                VM_COLUMNS
            ))?;
            let rows = stmt
                .query_map([], vm_from_row)?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            rows
        }
    };
    Ok(rows)
}

/// Best-fit for spawn: least loaded first, newest VM breaking ties.
pub fn best_fit_vm(conn: &Connection) -> Result<Option<Vm>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {} FROM vms
         WHERE status = 'ready' AND health_status = 'healthy' AND agent_count < max_agents
         ORDER BY agent_count ASC, created_at DESC
         LIMIT 1",
        VM_COLUMNS
    ))?;
    let row = stmt.query_row([], vm_from_row).optional()?;
    Ok(row)
}

pub fn update_vm(conn: &Connection, vm: &Vm) -> Result<()> {
    conn.execute(
        "UPDATE vms SET
             instance_id = ?2, status = ?3, public_ip = ?4, private_ip = ?5, region = ?6,
             vm_size = ?7, ready_at = ?8, last_health_check = ?9, health_status = ?10,
             error_message = ?11, agent_count = ?12, max_agents = ?13, metadata = ?14
         WHERE vm_id = ?1",
        params![
            vm.vm_id,
            vm.instance_id,
            vm.status.as_str(),
            vm.public_ip,
            vm.private_ip,
            vm.region,
            vm.vm_size.as_str(),
            vm.ready_at,
            vm.last_health_check,
            vm.health_status.as_str(),
            vm.error_message,
            vm.agent_count,
            vm.max_agents,
            vm.metadata.as_ref().map(|m| m.to_string()),
        ],
    )?;
    Ok(())
}

pub fn insert_health_check(
    conn: &Connection,
    vm_id: &str,
    health_status: HealthStatus,
    detail: Option<&str>,
) -> Result<String> {
    let now = now_rfc3339();
    conn.execute(
        "INSERT INTO health_checks (vm_id, timestamp, health_status, detail) VALUES (?1, ?2, ?3, ?4)",
        params![vm_id, now, health_status.as_str(), detail],
    )?;
    Ok(now)
}

fn assignment_from_row(row: &Row) -> rusqlite::Result<Assignment> {
    Ok(Assignment {
        assignment_id: row.get(0)?,
        agent_id: row.get(1)?,
        vm_id: row.get(2)?,
        assigned_at: row.get(3)?,
        status: AssignmentStatus::parse(&row.get::<_, String>(4)?),
        completed_at: row.get(5)?,
        task: row.get(6)?,
    })
}

const ASSIGNMENT_COLUMNS: &str =
    "assignment_id, agent_id, vm_id, assigned_at, status, completed_at, task";

pub fn insert_assignment(conn: &Connection, assignment: &Assignment) -> Result<()> {
    conn.execute(
        "INSERT INTO assignments (assignment_id, agent_id, vm_id, assigned_at, status, task)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
        params![
            assignment.assignment_id,
            assignment.agent_id,
            assignment.vm_id,
            assignment.assigned_at,
            assignment.status.as_str(),
            assignment.task,
        ],
    )?;
    Ok(())
}

pub fn active_assignment_for_agent(conn: &Connection, agent_id: &str) -> Result<Option<Assignment>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {} FROM assignments WHERE agent_id = ?1 AND status = 'active' LIMIT 1",
        ASSIGNMENT_COLUMNS
    ))?;
    let row = stmt
        .query_row(params![agent_id], assignment_from_row)
        .optional()?;
    Ok(row)
}

pub fn active_assignments_for_vm(conn: &Connection, vm_id: &str) -> Result<Vec<Assignment>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {} FROM assignments WHERE vm_id = ?1 AND status = 'active'",
        ASSIGNMENT_COLUMNS
    ))?;
    let rows = stmt
        .query_map(params![vm_id], assignment_from_row)?
        .collect::<std::result::Result<Vec<_>, _>>()?;
    Ok(rows)
}

pub fn list_assignments(
    conn: &Connection,
    agent_id: Option<&str>,
    status: Option<&str>,
) -> Result<Vec<Assignment>> {
    let mut sql = format!(
        "SELECT {} FROM assignments WHERE 1=1",
        ASSIGNMENT_COLUMNS
    );
    let mut args: Vec<String> = Vec::new();
    if let Some(agent_id) = agent_id {
        sql.push_str(&format!(" AND agent_id = ?{}", args.len() + 1));
        args.push(agent_id.to_string());
    }
    if let Some(status) = status {
        sql.push_str(&format!(" AND status = ?{}", args.len() + 1));
        args.push(status.to_string());
    }
    sql.push_str(" ORDER BY assigned_at DESC");
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt
        .query_map(rusqlite::params_from_iter(args.iter()), assignment_from_row)?
        .collect::<std::result::Result<Vec<_>, _>>()?;
    Ok(rows)
}

pub fn close_assignment(
    conn: &Connection,
    assignment_id: &str,
    status: AssignmentStatus,
) -> Result<()> {
    conn.execute(
        "UPDATE assignments SET status = ?1, completed_at = ?2 WHERE assignment_id = ?3",
        params![status.as_str(), now_rfc3339(), assignment_id],
    )?;
    Ok(())
}

/// Recount for the capacity invariant; used after force-terminate.
pub fn active_assignment_count(conn: &Connection, vm_id: &str) -> Result<i64> {
    let count = conn.query_row(
        "SELECT COUNT(*) FROM assignments WHERE vm_id = ?1 AND status = 'active'",
        params![vm_id],
        |row| row.get(0),
    )?;
    Ok(count)
}

pub fn load_pool_state(conn: &Connection) -> Result<(PoolConfig, bool)> {
    let row = conn
        .query_row(
            "SELECT config, pending_scale_up FROM pool_state WHERE id = 1",
            [],
            |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, i64>(1)? != 0,
                ))
            },
        )
        .optional()?;
    match row {
        Some((config_text, pending)) => {
            let config = serde_json::from_str(&config_text).unwrap_or_default();
            Ok((config, pending))
        }
        None => {
            let config = PoolConfig::default();
            save_pool_state(conn, &config, false)?;
            Ok((config, false))
        }
    }
}

pub fn save_pool_state(conn: &Connection, config: &PoolConfig, pending_scale_up: bool) -> Result<()> {
    conn.execute(
        "INSERT INTO pool_state (id, config, pending_scale_up, updated_at)
         VALUES (1, ?1, ?2, ?3)
         ON CONFLICT(id) DO UPDATE SET
             config = excluded.config,
             pending_scale_up = excluded.pending_scale_up,
             updated_at = excluded.updated_at",
        params![
            serde_json::to_string(config)?,
            pending_scale_up as i64,
            now_rfc3339()
        ],
    )?;
    Ok(())
}

/// Free agent slots on healthy ready VMs.
pub fn free_ready_slots(conn: &Connection) -> Result<i64> {
    let free = conn.query_row(
        "SELECT COALESCE(SUM(max_agents - agent_count), 0) FROM vms
         WHERE status = 'ready' AND health_status = 'healthy'",
        [],
        |row| row.get(0),
    )?;
    Ok(free)
}

pub fn active_vm_count(conn: &Connection) -> Result<i64> {
    let count = conn.query_row(
        "SELECT COUNT(*) FROM vms WHERE status IN ('provisioning', 'booting', 'ready', 'busy')",
        [],
        |row| row.get(0),
    )?;
    Ok(count)
}

/// 7-day retention for health checks and closed assignments.
pub fn purge_old_rows(conn: &Connection, cutoff: &str) -> Result<()> {
    conn.execute(
        "DELETE FROM health_checks WHERE timestamp < ?1",
        params![cutoff],
    )?;
    conn.execute(
        "DELETE FROM assignments WHERE status != 'active' AND completed_at < ?1",
        params![cutoff],
    )?;
    Ok(())
}

//! Soul progression: XP, levels, abilities, trust, and the dashboard

use chrono::{Duration, Utc};
use serde_json::{json, Value};
use uuid::Uuid;

use super::model::*;
use super::store::{self, SoulRow};
use super::AgentState;
use crate::error::Error;
use crate::request::EntityResponse;
use crate::runtime::storage::{now_rfc3339, parse_rfc3339};
use crate::Result;

/// Tier thresholds: (level, xp, streak, tasks completed).
const LEVEL_TIERS: [(SoulLevel, i64, i64, i64); 4] = [
    (SoulLevel::Novice, 0, 0, 0),
    (SoulLevel::Capable, 100, 3, 5),
    (SoulLevel::Expert, 500, 5, 25),
    (SoulLevel::Master, 2000, 10, 100),
];

const STREAK_WINDOW_HOURS: i64 = 48;
const STREAK_AT_RISK_HOURS: i64 = 8;

impl AgentState {
    pub(super) fn get_soul(&mut self) -> Result<EntityResponse> {
        let row = self.ensure_soul()?;
        Ok(EntityResponse::ok(json!({ "soul": with_derived(row) })))
    }

    pub(super) fn add_xp(&mut self, req: AddXpRequest) -> Result<EntityResponse> {
        if req.amount <= 0 {
            return Err(Error::validation("amount must be a positive integer"));
        }
        let mut row = self.ensure_soul()?;
        grant_xp(&mut row, req.amount);
        store::update_soul(&self.ctx.conn, &row)?;
        Ok(EntityResponse::ok(json!({
            "soul": with_derived(row),
            "granted": req.amount,
            "reason": req.reason,
        })))
    }

    pub(super) fn update_from_trace(&mut self, req: UpdateFromTraceRequest) -> Result<EntityResponse> {
        let trace = store::get_trace(&self.ctx.conn, &req.trace_id)?
            .ok_or_else(|| Error::not_found(format!("Session {}", req.trace_id)))?;
        let summary = trace
            .summary
            .clone()
            .ok_or_else(|| Error::validation(format!("Session {} is not completed", req.trace_id)))?;
        let escalations = store::escalations_for_session(&self.ctx.conn, &req.trace_id)?;

        let mut row = self.ensure_soul()?;
        let now = Utc::now();

        let trace_xp = trace_xp(&summary, &escalations);
        grant_xp(&mut row, trace_xp);
        if let Some(domain) = req.domain.as_deref() {
            if !row.soul.specializations.add(domain, trace_xp / 2) {
                return Err(Error::validation(format!("Unknown domain: {}", domain)));
            }
        }

        let human_escalated = escalations
            .iter()
            .any(|e| e.resolved_by == Some(ResolvedBy::Human));

        row.soul.tasks_completed += 1;
        if !human_escalated {
            row.soul.tasks_successful += 1;
        }
        if !escalations.is_empty() {
            row.tasks_with_escalations += 1;
        }
        row.soul.escalation_count += escalations.len() as i64;
        row.soul.self_resolved_count += escalations
            .iter()
            .filter(|e| e.resolved_by == Some(ResolvedBy::SelfAgent))
            .count() as i64;
        row.soul.peer_assist_count += escalations
            .iter()
            .filter(|e| e.resolved_by == Some(ResolvedBy::Peer))
            .count() as i64;
        row.soul.human_escalation_count += escalations
            .iter()
            .filter(|e| e.resolved_by == Some(ResolvedBy::Human))
            .count() as i64;

        // Streak: expire after 48 h of inactivity, reset on human escalation.
        let expired = row
            .last_streak_at
            .as_deref()
            .and_then(parse_rfc3339)
            .map(|at| now - at >= Duration::hours(STREAK_WINDOW_HOURS))
            .unwrap_or(false);
        if expired {
            row.soul.current_streak = 0;
        }
        if human_escalated {
            row.soul.current_streak = 0;
        } else {
            row.soul.current_streak += 1;
        }
        row.soul.longest_streak = row.soul.longest_streak.max(row.soul.current_streak);
        row.last_streak_at = Some(now.to_rfc3339());

        row.soul.trust_score = trust_score(&row);
        recompute_level(&mut row);
        grant_achievements(&mut row);

        row.soul.last_trace_id = Some(req.trace_id.clone());
        row.last_trace_at = Some(now.to_rfc3339());
        store::update_soul(&self.ctx.conn, &row)?;

        Ok(EntityResponse::ok(json!({
            "soul": with_derived(row),
            "traceXP": trace_xp,
        })))
    }

    pub(super) fn dashboard(&mut self) -> Result<EntityResponse> {
        let row = self.ensure_soul()?;
        let now = Utc::now();

        let today = now
            .date_naive()
            .and_hms_opt(0, 0, 0)
            .map(|t| t.and_utc().to_rfc3339())
            .unwrap_or_else(now_rfc3339);
        let (started, completed, steps, escalations) =
            store::session_stats_since(&self.ctx.conn, &today)?;

        let pending_escalations = store::unresolved_escalation_count(&self.ctx.conn)?;
        let flow_state = self.flow_state(pending_escalations)?;

        let streak = streak_status(&row, now);
        let level_progress = level_progress(&row);
        let ranks: Vec<Value> = row
            .soul
            .specializations
            .ranked()
            .into_iter()
            .map(|(domain, xp)| json!({ "domain": domain, "xp": xp, "rank": rank_label(xp) }))
            .collect();

        let mut alerts: Vec<String> = Vec::new();
        if pending_escalations > 0 {
            alerts.push(format!("{} unresolved escalation(s)", pending_escalations));
        }
        if streak["atRisk"] == json!(true) {
            alerts.push("Streak expires soon".to_string());
        }
        if let Some((last, threshold)) = store::heartbeat_state(&self.ctx.conn)? {
            let healthy = parse_rfc3339(&last)
                .map(|at| (now - at).num_milliseconds() < threshold)
                .unwrap_or(false);
            if !healthy {
                alerts.push("Heartbeat is stale".to_string());
            }
        }

        let suggestions = self.suggestions(pending_escalations)?;

        Ok(EntityResponse::ok(json!({
            "soul": with_derived(row),
            "sessionStats": {
                "tracesStarted": started,
                "tracesCompleted": completed,
                "steps": steps,
                "escalations": escalations,
            },
            "flowState": flow_state,
            "streakStatus": streak,
            "pendingEscalations": pending_escalations,
            "levelProgress": level_progress,
            "specializationRanks": ranks,
            "alerts": alerts,
            "suggestions": suggestions,
        })))
    }

    /// Flow state over the last 15 minutes of steps on open traces.
    fn flow_state(&self, pending_escalations: i64) -> Result<FlowState> {
        if pending_escalations > 0 {
            return Ok(FlowState::Stuck);
        }
        let now = Utc::now();
        let cutoff = (now - Duration::minutes(15)).to_rfc3339();
        let recent = store::steps_since(&self.ctx.conn, &cutoff)?;
        let progressing = recent
            .iter()
            .filter(|s| matches!(s.outcome, StepOutcome::Found | StepOutcome::Partial))
            .count();
        if recent.len() >= 5 && progressing >= 5 {
            return Ok(FlowState::InFlow);
        }
        let hour_ago = (now - Duration::hours(1)).to_rfc3339();
        if store::any_trace_started_since(&self.ctx.conn, &hour_ago)? {
            return Ok(FlowState::Available);
        }
        Ok(FlowState::Offline)
    }

    fn suggestions(&self, pending_escalations: i64) -> Result<Vec<String>> {
        let mut suggestions = Vec::new();
        if pending_escalations > 0 {
            suggestions.push(format!(
                "Resolve {} pending escalation(s) before starting new work",
                pending_escalations
            ));
        }
        for trace in store::open_traces(&self.ctx.conn)?.into_iter().take(2) {
            suggestions.push(format!("Complete the open trace for \"{}\"", trace.task));
        }
        let pending_goals = store::list_goals(&self.ctx.conn, Some("pending"))?;
        if let Some(goal) = pending_goals.first() {
            suggestions.push(format!("Start the queued goal \"{}\"", goal.title));
        }
        let unread = store::list_messages(&self.ctx.conn, true, 50)?;
        if !unread.is_empty() {
            suggestions.push(format!("Read {} unread message(s)", unread.len()));
        }
        if store::get_checkpoint(&self.ctx.conn)?.is_none() {
            suggestions.push("Save a checkpoint so work survives a restart".to_string());
        }
        suggestions.truncate(5);
        Ok(suggestions)
    }

    /// Load the soul, creating a default one on first touch.
    pub(super) fn ensure_soul(&mut self) -> Result<SoulRow> {
        if let Some(row) = store::load_soul(&self.ctx.conn)? {
            return Ok(row);
        }
        let soul = Soul {
            soul_id: Uuid::new_v4().to_string(),
            name: self.ctx.name.clone(),
            personality: "methodical and curious".to_string(),
            created_at: now_rfc3339(),
            total_xp: 0,
            level: SoulLevel::Novice,
            current_streak: 0,
            longest_streak: 0,
            tasks_completed: 0,
            tasks_successful: 0,
            peers_helped: 0,
            escalation_count: 0,
            self_resolved_count: 0,
            peer_assist_count: 0,
            human_escalation_count: 0,
            specializations: Specializations::default(),
            achievements: Vec::new(),
            abilities: abilities_for(SoulLevel::Novice),
            trust_score: 0.5,
            transparency_score: 0.5,
            track_record_score: 0.5,
            last_trace_id: None,
            rust_level: 0.0,
            effective_xp_multiplier: 1.0,
        };
        store::insert_soul(&self.ctx.conn, &soul)?;
        Ok(SoulRow {
            soul,
            tasks_with_escalations: 0,
            last_trace_at: None,
            last_streak_at: None,
        })
    }
}

/// XP for a completed trace.
pub fn trace_xp(summary: &WorkSummary, escalations: &[Escalation]) -> i64 {
    let mut xp = 10;
    if summary.efficiency > 0.7 {
        xp += 15;
    } else if summary.efficiency > 0.5 {
        xp += 5;
    }
    let all_self_resolved = escalations
        .iter()
        .all(|e| matches!(e.resolved_by, Some(ResolvedBy::SelfAgent) | None));
    if all_self_resolved {
        xp += 10;
    }
    if escalations.is_empty() {
        xp += 5;
    }
    xp
}

/// Add XP and re-derive level and abilities.
fn grant_xp(row: &mut SoulRow, amount: i64) {
    row.soul.total_xp += amount;
    recompute_level(row);
    grant_achievements(row);
}

/// Highest tier whose XP, streak, and completed-task thresholds are all
/// met. The streak threshold checks the longest streak so the level never
/// drops when a streak resets.
fn recompute_level(row: &mut SoulRow) {
    let mut level = SoulLevel::Novice;
    for (tier, xp, streak, tasks) in LEVEL_TIERS {
        if row.soul.total_xp >= xp
            && row.soul.longest_streak >= streak
            && row.soul.tasks_completed >= tasks
        {
            level = tier;
        }
    }
    if level > row.soul.level {
        row.soul.level = level;
        row.soul.abilities.union(&abilities_for(level));
    }
}

/// Abilities unioned over every tier up to `level`.
pub fn abilities_for(level: SoulLevel) -> Abilities {
    let mut abilities = Abilities {
        can_commit: true,
        ..Default::default()
    };
    if level >= SoulLevel::Capable {
        abilities.can_spawn_subagents = true;
    }
    if level >= SoulLevel::Expert {
        abilities.can_mentor_peers = true;
        abilities.extended_budget = true;
    }
    if level >= SoulLevel::Master {
        abilities.can_access_prod = true;
    }
    abilities
}

fn grant_achievements(row: &mut SoulRow) {
    let mut grant = |id: &str| {
        if !row.soul.achievements.iter().any(|a| a == id) {
            row.soul.achievements.push(id.to_string());
        }
    };
    if row.soul.tasks_completed >= 1 {
        grant("first_task");
    }
    if row.soul.longest_streak >= 5 {
        grant("streak_5");
    }
    if row.soul.longest_streak >= 10 {
        grant("streak_10");
    }
    match row.soul.level {
        SoulLevel::Novice => {}
        SoulLevel::Capable => grant("level_capable"),
        SoulLevel::Expert => grant("level_expert"),
        SoulLevel::Master => grant("level_master"),
    }
}

/// `0.5·successRate + 0.3·selfResolutionRate + 0.2·avoidanceRate`, capped.
fn trust_score(row: &SoulRow) -> f64 {
    let completed = row.soul.tasks_completed;
    let success_rate = if completed > 0 {
        row.soul.tasks_successful as f64 / completed as f64
    } else {
        0.0
    };
    let self_resolution_rate = if row.soul.escalation_count > 0 {
        row.soul.self_resolved_count as f64 / row.soul.escalation_count as f64
    } else {
        1.0
    };
    let avoidance_rate = if completed > 0 {
        (completed - row.tasks_with_escalations) as f64 / completed as f64
    } else {
        1.0
    };
    (0.5 * success_rate + 0.3 * self_resolution_rate + 0.2 * avoidance_rate).min(1.0)
}

/// Inactivity decay: 0 under a week, then 0.2 / 0.4 / 0.6 steps.
pub fn rust_level(last_trace_at: Option<&str>) -> f64 {
    let Some(last) = last_trace_at.and_then(parse_rfc3339) else {
        return 0.0;
    };
    let days = (Utc::now() - last).num_days();
    if days < 7 {
        0.0
    } else if days < 30 {
        0.2
    } else if days < 90 {
        0.4
    } else {
        0.6
    }
}

fn with_derived(mut row: SoulRow) -> Soul {
    row.soul.rust_level = rust_level(row.last_trace_at.as_deref());
    row.soul.effective_xp_multiplier = 1.0 - 0.5 * row.soul.rust_level;
    row.soul
}

fn streak_status(row: &SoulRow, now: chrono::DateTime<Utc>) -> Value {
    let expires_at = row
        .last_streak_at
        .as_deref()
        .and_then(parse_rfc3339)
        .map(|at| at + Duration::hours(STREAK_WINDOW_HOURS));
    let remaining_hours = expires_at.map(|at| (at - now).num_hours());
    let at_risk = remaining_hours
        .map(|h| h < STREAK_AT_RISK_HOURS && h >= 0)
        .unwrap_or(false);
    let expired = remaining_hours.map(|h| h < 0).unwrap_or(false);
    json!({
        "currentStreak": row.soul.current_streak,
        "longestStreak": row.soul.longest_streak,
        "expiresAt": expires_at.map(|at| at.to_rfc3339()),
        "atRisk": at_risk,
        "expired": expired,
    })
}

fn level_progress(row: &SoulRow) -> Value {
    let next = LEVEL_TIERS
        .iter()
        .find(|(tier, _, _, _)| *tier > row.soul.level);
    match next {
        Some((tier, xp, streak, tasks)) => {
            let progress = if *xp > 0 {
                (row.soul.total_xp as f64 / *xp as f64).min(1.0)
            } else {
                1.0
            };
            json!({
                "currentLevel": row.soul.level,
                "nextLevel": tier,
                "xpNeeded": (xp - row.soul.total_xp).max(0),
                "streakNeeded": (streak - row.soul.longest_streak).max(0),
                "tasksNeeded": (tasks - row.soul.tasks_completed).max(0),
                "progress": progress,
            })
        }
        None => json!({
            "currentLevel": row.soul.level,
            "nextLevel": Value::Null,
            "progress": 1.0,
        }),
    }
}

fn rank_label(xp: i64) -> &'static str {
    if xp >= 2000 {
        "master"
    } else if xp >= 500 {
        "expert"
    } else if xp >= 100 {
        "capable"
    } else {
        "novice"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fresh_row() -> SoulRow {
        SoulRow {
            soul: Soul {
                soul_id: "soul-1".to_string(),
                name: "phoenix".to_string(),
                personality: "methodical and curious".to_string(),
                created_at: now_rfc3339(),
                total_xp: 0,
                level: SoulLevel::Novice,
                current_streak: 0,
                longest_streak: 0,
                tasks_completed: 0,
                tasks_successful: 0,
                peers_helped: 0,
                escalation_count: 0,
                self_resolved_count: 0,
                peer_assist_count: 0,
                human_escalation_count: 0,
                specializations: Specializations::default(),
                achievements: Vec::new(),
                abilities: abilities_for(SoulLevel::Novice),
                trust_score: 0.5,
                transparency_score: 0.5,
                track_record_score: 0.5,
                last_trace_id: None,
                rust_level: 0.0,
                effective_xp_multiplier: 1.0,
            },
            tasks_with_escalations: 0,
            last_trace_at: None,
            last_streak_at: None,
        }
    }

    #[test]
    fn level_up_requires_all_three_thresholds() {
        let mut row = fresh_row();
        row.soul.total_xp = 150;
        recompute_level(&mut row);
        assert_eq!(row.soul.level, SoulLevel::Novice);

        row.soul.longest_streak = 3;
        row.soul.tasks_completed = 5;
        recompute_level(&mut row);
        assert_eq!(row.soul.level, SoulLevel::Capable);
        assert!(row.soul.abilities.can_spawn_subagents);
        assert!(!row.soul.abilities.can_access_prod);
    }

    #[test]
    fn master_unions_all_abilities() {
        let abilities = abilities_for(SoulLevel::Master);
        assert!(abilities.can_commit);
        assert!(abilities.can_spawn_subagents);
        assert!(abilities.can_mentor_peers);
        assert!(abilities.extended_budget);
        assert!(abilities.can_access_prod);
    }

    #[test]
    fn trace_xp_bonuses() {
        let summary = WorkSummary {
            total_steps: 4,
            dead_ends: 0,
            exploration_time_ms: 1000,
            solution_time_ms: 900,
            efficiency: 0.9,
        };
        // No escalations: 10 base + 15 efficiency + 10 self-resolved + 5 clean.
        assert_eq!(trace_xp(&summary, &[]), 40);

        let human = Escalation {
            id: "e1".to_string(),
            session_id: "s1".to_string(),
            triggered_at: now_rfc3339(),
            triggers: Vec::new(),
            highest_level: 2,
            resolved_at: Some(now_rfc3339()),
            resolved_by: Some(ResolvedBy::Human),
            resolver_agent: None,
            helpful_hint: None,
        };
        // Human-resolved escalation loses both bonuses.
        assert_eq!(trace_xp(&summary, &[human]), 25);
    }

    #[test]
    fn trust_score_is_capped() {
        let mut row = fresh_row();
        row.soul.tasks_completed = 10;
        row.soul.tasks_successful = 10;
        row.soul.escalation_count = 0;
        assert!((trust_score(&row) - 1.0).abs() < 1e-9);
    }
}

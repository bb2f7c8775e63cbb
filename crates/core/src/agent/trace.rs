//! Work trace engine: step logging, derived summaries, escalation triggers

use chrono::{Duration, Utc};
use serde_json::json;
use uuid::Uuid;

use super::model::*;
use super::store;
use super::AgentState;
use crate::error::Error;
use crate::request::EntityResponse;
use crate::runtime::storage::{now_rfc3339, parse_rfc3339};
use crate::Result;

const TIME_EXCEEDED_MINUTES: i64 = 10;

impl AgentState {
    pub(super) fn start_trace(&mut self, req: StartTraceRequest) -> Result<EntityResponse> {
        if req.task.trim().is_empty() {
            return Err(Error::validation("task is required"));
        }
        let trace = WorkTrace {
            session_id: req
                .session_id
                .filter(|id| !id.trim().is_empty())
                .unwrap_or_else(|| Uuid::new_v4().to_string()),
            task: req.task,
            started_at: now_rfc3339(),
            completed_at: None,
            summary: None,
        };
        if store::get_trace(&self.ctx.conn, &trace.session_id)?.is_some() {
            return Err(Error::Conflict(json!({
                "error": format!("Session {} already exists", trace.session_id),
            })));
        }
        store::insert_trace(&self.ctx.conn, &trace)?;
        Ok(EntityResponse::ok(json!({ "trace": trace })))
    }

    pub(super) fn log_step(&mut self, session_id: &str, req: LogStepRequest) -> Result<EntityResponse> {
        let trace = store::get_trace(&self.ctx.conn, session_id)?
            .ok_or_else(|| Error::not_found(format!("Session {}", session_id)))?;
        if trace.completed_at.is_some() {
            return Err(Error::Conflict(json!({
                "error": format!("Session {} is already completed", session_id),
            })));
        }

        let step = WorkStep {
            id: Uuid::new_v4().to_string(),
            session_id: session_id.to_string(),
            timestamp: now_rfc3339(),
            tool: req.tool,
            intent: req.intent,
            outcome: req.outcome,
            duration_ms: req.duration_ms.unwrap_or(0).max(0),
            contribution_type: req.contribution_type,
            knowledge_gained: req.knowledge_gained,
            eliminated_paths: req.eliminated_paths,
            depends_on: req.depends_on,
        };
        store::insert_step(&self.ctx.conn, &step)?;

        let steps = store::steps_for_session(&self.ctx.conn, session_id)?;
        let triggers = evaluate_triggers(&trace, &steps);
        let escalation = if triggers.is_empty() {
            None
        } else {
            let highest_level = triggers.iter().map(|t| t.level).max().unwrap_or(1);
            let escalation = Escalation {
                id: Uuid::new_v4().to_string(),
                session_id: session_id.to_string(),
                triggered_at: now_rfc3339(),
                triggers,
                highest_level,
                resolved_at: None,
                resolved_by: None,
                resolver_agent: None,
                helpful_hint: None,
            };
            store::insert_escalation(&self.ctx.conn, &escalation)?;
            Some(escalation)
        };

        let level = escalation.as_ref().map(|e| e.highest_level).unwrap_or(0);
        Ok(EntityResponse::ok(json!({
            "step": step,
            "stepCount": steps.len(),
            "escalation": escalation,
            "recommendation": recommendation_for(level),
        })))
    }

    pub(super) fn complete_trace(
        &mut self,
        session_id: &str,
        _req: CompleteTraceRequest,
    ) -> Result<EntityResponse> {
        let trace = store::get_trace(&self.ctx.conn, session_id)?
            .ok_or_else(|| Error::not_found(format!("Session {}", session_id)))?;
        if trace.completed_at.is_some() {
            return Err(Error::Conflict(json!({
                "error": format!("Session {} is already completed", session_id),
            })));
        }
        let steps = store::steps_for_session(&self.ctx.conn, session_id)?;
        let summary = compute_summary(&steps);
        store::complete_trace(&self.ctx.conn, session_id, &summary)?;
        let trace = store::get_trace(&self.ctx.conn, session_id)?;
        Ok(EntityResponse::ok(json!({ "trace": trace, "summary": summary })))
    }

    pub(super) fn get_trace(&self, session_id: &str) -> Result<EntityResponse> {
        let trace = store::get_trace(&self.ctx.conn, session_id)?
            .ok_or_else(|| Error::not_found(format!("Session {}", session_id)))?;
        let steps = store::steps_for_session(&self.ctx.conn, session_id)?;
        let escalations = store::escalations_for_session(&self.ctx.conn, session_id)?;
        Ok(EntityResponse::ok(json!({
            "trace": trace,
            "steps": steps,
            "escalations": escalations,
        })))
    }

    pub(super) fn resolve_escalation(
        &mut self,
        session_id: &str,
        req: ResolveEscalationRequest,
    ) -> Result<EntityResponse> {
        let escalation = match &req.escalation_id {
            Some(id) => store::get_escalation(&self.ctx.conn, id)?
                .filter(|e| e.session_id == session_id)
                .ok_or_else(|| Error::not_found(format!("Escalation {}", id)))?,
            None => store::latest_unresolved_escalation(&self.ctx.conn, session_id)?
                .ok_or_else(|| {
                    Error::not_found(format!("No unresolved escalation for session {}", session_id))
                })?,
        };
        if escalation.resolved_at.is_some() {
            return Err(Error::Conflict(json!({
                "error": format!("Escalation {} is already resolved", escalation.id),
            })));
        }
        store::resolve_escalation(
            &self.ctx.conn,
            &escalation.id,
            req.resolved_by,
            req.resolver_agent.as_deref(),
            req.helpful_hint.as_deref(),
        )?;
        let resolved = store::get_escalation(&self.ctx.conn, &escalation.id)?;
        Ok(EntityResponse::ok(json!({ "escalation": resolved })))
    }
}

/// Derived on complete; efficiency is 0 when nothing was explored.
pub fn compute_summary(steps: &[WorkStep]) -> WorkSummary {
    let total_steps = steps.len() as i64;
    let dead_ends = steps
        .iter()
        .filter(|s| matches!(s.outcome, StepOutcome::Nothing | StepOutcome::Error))
        .count() as i64;
    let exploration_time_ms: i64 = steps.iter().map(|s| s.duration_ms).sum();
    let solution_time_ms: i64 = steps
        .iter()
        .filter(|s| {
            s.outcome == StepOutcome::Found
                || s.contribution_type == Some(ContributionType::Direct)
        })
        .map(|s| s.duration_ms)
        .sum();
    let efficiency = if exploration_time_ms > 0 {
        solution_time_ms as f64 / exploration_time_ms as f64
    } else {
        0.0
    };
    WorkSummary {
        total_steps,
        dead_ends,
        exploration_time_ms,
        solution_time_ms,
        efficiency,
    }
}

/// Evaluate all escalation triggers against the full trace; the last step
/// in `steps` is the one just logged.
pub fn evaluate_triggers(trace: &WorkTrace, steps: &[WorkStep]) -> Vec<EscalationTrigger> {
    let mut triggers = Vec::new();
    let Some(current) = steps.last() else {
        return triggers;
    };

    // stuck_loop: the current tool keeps producing no progress.
    let recent = &steps[steps.len().saturating_sub(5)..];
    let same_tool_no_progress = recent
        .iter()
        .filter(|s| {
            s.tool == current.tool
                && matches!(s.outcome, StepOutcome::Nothing | StepOutcome::Partial)
        })
        .count();
    if same_tool_no_progress >= 3 {
        triggers.push(EscalationTrigger {
            trigger_type: EscalationTriggerType::StuckLoop,
            level: 2,
            detail: format!(
                "{} produced no progress {} times in the last {} steps",
                current.tool,
                same_tool_no_progress,
                recent.len()
            ),
        });
    }

    let nothing_count = steps
        .iter()
        .filter(|s| s.outcome == StepOutcome::Nothing)
        .count();
    if nothing_count >= 3 {
        triggers.push(EscalationTrigger {
            trigger_type: EscalationTriggerType::RepeatedFailures,
            level: 1,
            detail: format!("{} steps found nothing", nothing_count),
        });
    }

    let error_count = steps
        .iter()
        .filter(|s| s.outcome == StepOutcome::Error)
        .count();
    if error_count >= 2 {
        triggers.push(EscalationTrigger {
            trigger_type: EscalationTriggerType::ErrorAccumulation,
            level: 2,
            detail: format!("{} steps errored", error_count),
        });
    }

    let elapsed_ok = parse_rfc3339(&trace.started_at)
        .map(|started| Utc::now() - started > Duration::minutes(TIME_EXCEEDED_MINUTES))
        .unwrap_or(false);
    if elapsed_ok {
        triggers.push(EscalationTrigger {
            trigger_type: EscalationTriggerType::TimeExceeded,
            level: 1,
            detail: format!("session open for more than {} minutes", TIME_EXCEEDED_MINUTES),
        });
    }

    if steps.len() >= 5 {
        let unproductive = steps
            .iter()
            .filter(|s| {
                matches!(s.outcome, StepOutcome::Nothing | StepOutcome::Error)
                    || s.contribution_type == Some(ContributionType::Minimal)
            })
            .count();
        let fraction = unproductive as f64 / steps.len() as f64;
        if fraction > 0.6 {
            triggers.push(EscalationTrigger {
                trigger_type: EscalationTriggerType::LowEfficiency,
                level: 1,
                detail: format!(
                    "{:.0}% of {} steps made no contribution",
                    fraction * 100.0,
                    steps.len()
                ),
            });
        }
    }

    triggers
}

pub fn recommendation_for(level: u8) -> &'static str {
    match level {
        0 => "continue",
        1 => "consider pausing to reassess",
        2 => "PAUSE and reassess before continuing",
        _ => "ESCALATE to a peer or human",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn step(tool: &str, outcome: StepOutcome) -> WorkStep {
        WorkStep {
            id: Uuid::new_v4().to_string(),
            session_id: "s1".to_string(),
            timestamp: now_rfc3339(),
            tool: tool.to_string(),
            intent: "look around".to_string(),
            outcome,
            duration_ms: 1000,
            contribution_type: None,
            knowledge_gained: Vec::new(),
            eliminated_paths: Vec::new(),
            depends_on: Vec::new(),
        }
    }

    fn open_trace() -> WorkTrace {
        WorkTrace {
            session_id: "s1".to_string(),
            task: "find the bug".to_string(),
            started_at: now_rfc3339(),
            completed_at: None,
            summary: None,
        }
    }

    #[test]
    fn stuck_loop_fires_on_third_no_progress_step() {
        let trace = open_trace();
        let two = vec![step("grep", StepOutcome::Nothing), step("grep", StepOutcome::Nothing)];
        let triggers = evaluate_triggers(&trace, &two);
        assert!(!triggers
            .iter()
            .any(|t| t.trigger_type == EscalationTriggerType::StuckLoop));

        let mut three = two;
        three.push(step("grep", StepOutcome::Nothing));
        let triggers = evaluate_triggers(&trace, &three);
        assert!(triggers
            .iter()
            .any(|t| t.trigger_type == EscalationTriggerType::StuckLoop && t.level == 2));
        // Three nothing outcomes also trip repeated_failures.
        assert!(triggers
            .iter()
            .any(|t| t.trigger_type == EscalationTriggerType::RepeatedFailures && t.level == 1));
    }

    #[test]
    fn stuck_loop_ignores_other_tools_in_window() {
        let trace = open_trace();
        let steps = vec![
            step("grep", StepOutcome::Nothing),
            step("read", StepOutcome::Nothing),
            step("grep", StepOutcome::Nothing),
            step("read", StepOutcome::Found),
            step("grep", StepOutcome::Partial),
        ];
        let triggers = evaluate_triggers(&trace, &steps);
        assert!(triggers
            .iter()
            .any(|t| t.trigger_type == EscalationTriggerType::StuckLoop));
    }

    #[test]
    fn error_accumulation_fires_at_two() {
        let trace = open_trace();
        let steps = vec![step("build", StepOutcome::Error), step("test", StepOutcome::Error)];
        let triggers = evaluate_triggers(&trace, &steps);
        assert!(triggers
            .iter()
            .any(|t| t.trigger_type == EscalationTriggerType::ErrorAccumulation && t.level == 2));
    }

    #[test]
    fn time_exceeded_fires_after_ten_minutes() {
        let mut trace = open_trace();
        trace.started_at = (Utc::now() - Duration::minutes(11)).to_rfc3339();
        let steps = vec![step("read", StepOutcome::Found)];
        let triggers = evaluate_triggers(&trace, &steps);
        assert!(triggers
            .iter()
            .any(|t| t.trigger_type == EscalationTriggerType::TimeExceeded));
    }

    #[test]
    fn low_efficiency_needs_five_steps() {
        let trace = open_trace();
        let mut steps = vec![
            step("a", StepOutcome::Nothing),
            step("b", StepOutcome::Error),
            step("c", StepOutcome::Nothing),
            step("d", StepOutcome::Found),
        ];
        assert!(!evaluate_triggers(&trace, &steps)
            .iter()
            .any(|t| t.trigger_type == EscalationTriggerType::LowEfficiency));

        steps.push(step("e", StepOutcome::Error));
        assert!(evaluate_triggers(&trace, &steps)
            .iter()
            .any(|t| t.trigger_type == EscalationTriggerType::LowEfficiency));
    }

    #[test]
    fn summary_math() {
        let mut found = step("read", StepOutcome::Found);
        found.duration_ms = 2000;
        let mut direct = step("edit", StepOutcome::Partial);
        direct.duration_ms = 3000;
        direct.contribution_type = Some(ContributionType::Direct);
        let nothing = step("grep", StepOutcome::Nothing);

        let summary = compute_summary(&[found, direct, nothing]);
        assert_eq!(summary.total_steps, 3);
        assert_eq!(summary.dead_ends, 1);
        assert_eq!(summary.exploration_time_ms, 6000);
        assert_eq!(summary.solution_time_ms, 5000);
        assert!((summary.efficiency - 5000.0 / 6000.0).abs() < 1e-9);
    }

    #[test]
    fn summary_efficiency_zero_without_duration() {
        let summary = compute_summary(&[]);
        assert_eq!(summary.efficiency, 0.0);
        assert_eq!(summary.solution_time_ms, 0);
    }
}

//! AgentState model definitions

use serde::{Deserialize, Serialize};

/// Singleton checkpoint for resuming work after a restart.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct AgentCheckpoint {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub conversation_summary: Option<String>,
    #[serde(default)]
    pub accomplishments: Vec<String>,
    #[serde(default)]
    pub pending_work: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub recent_context: Option<String>,
    #[serde(default)]
    pub files_edited: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub checkpoint_at: Option<String>,
}

/// Partial checkpoint; absent fields keep their stored values.
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct CheckpointSaveRequest {
    #[serde(default)]
    pub conversation_summary: Option<String>,
    #[serde(default)]
    pub accomplishments: Option<Vec<String>>,
    #[serde(default)]
    pub pending_work: Option<Vec<String>>,
    #[serde(default)]
    pub recent_context: Option<String>,
    #[serde(default)]
    pub files_edited: Option<Vec<String>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DirectMessageType {
    Status,
    Handoff,
    Note,
    Mention,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DirectMessage {
    pub id: String,
    pub from: String,
    #[serde(rename = "type")]
    pub message_type: DirectMessageType,
    pub message: String,
    pub timestamp: String,
    pub read: bool,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SendMessageRequest {
    pub from: String,
    #[serde(rename = "type", default)]
    pub message_type: Option<DirectMessageType>,
    pub message: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MarkReadRequest {
    pub message_ids: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MemoryCategory {
    Discovery,
    Decision,
    Blocker,
    Learning,
    Pattern,
    Warning,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Memory {
    pub id: String,
    pub category: MemoryCategory,
    pub content: String,
    #[serde(default)]
    pub tags: Vec<String>,
    pub created_at: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SaveMemoryRequest {
    pub category: MemoryCategory,
    pub content: String,
    #[serde(default)]
    pub tags: Vec<String>,
}

/// Outcome of a single work step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StepOutcome {
    Found,
    Nothing,
    Error,
    Partial,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContributionType {
    Enabling,
    Pruning,
    Direct,
    Minimal,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkStep {
    pub id: String,
    pub session_id: String,
    pub timestamp: String,
    pub tool: String,
    pub intent: String,
    pub outcome: StepOutcome,
    pub duration_ms: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub contribution_type: Option<ContributionType>,
    #[serde(default)]
    pub knowledge_gained: Vec<String>,
    #[serde(default)]
    pub eliminated_paths: Vec<String>,
    #[serde(default)]
    pub depends_on: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkSummary {
    pub total_steps: i64,
    pub dead_ends: i64,
    pub exploration_time_ms: i64,
    pub solution_time_ms: i64,
    pub efficiency: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkTrace {
    pub session_id: String,
    pub task: String,
    pub started_at: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub summary: Option<WorkSummary>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StartTraceRequest {
    pub task: String,
    #[serde(default)]
    pub session_id: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LogStepRequest {
    pub tool: String,
    pub intent: String,
    pub outcome: StepOutcome,
    #[serde(default)]
    pub duration_ms: Option<i64>,
    #[serde(default)]
    pub contribution_type: Option<ContributionType>,
    #[serde(default)]
    pub knowledge_gained: Vec<String>,
    #[serde(default)]
    pub eliminated_paths: Vec<String>,
    #[serde(default)]
    pub depends_on: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EscalationTriggerType {
    StuckLoop,
    RepeatedFailures,
    ErrorAccumulation,
    TimeExceeded,
    LowEfficiency,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EscalationTrigger {
    #[serde(rename = "type")]
    pub trigger_type: EscalationTriggerType,
    pub level: u8,
    pub detail: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResolvedBy {
    #[serde(rename = "self")]
    SelfAgent,
    Peer,
    Human,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Escalation {
    pub id: String,
    pub session_id: String,
    pub triggered_at: String,
    pub triggers: Vec<EscalationTrigger>,
    pub highest_level: u8,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resolved_at: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resolved_by: Option<ResolvedBy>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resolver_agent: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub helpful_hint: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResolveEscalationRequest {
    #[serde(default)]
    pub escalation_id: Option<String>,
    pub resolved_by: ResolvedBy,
    #[serde(default)]
    pub resolver_agent: Option<String>,
    #[serde(default)]
    pub helpful_hint: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct CompleteTraceRequest {
    #[serde(default)]
    pub summary: Option<String>,
}

/// Soul progression tiers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SoulLevel {
    Novice,
    Capable,
    Expert,
    Master,
}

impl SoulLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Novice => "novice",
            Self::Capable => "capable",
            Self::Expert => "expert",
            Self::Master => "master",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct Specializations {
    #[serde(default)]
    pub frontend: i64,
    #[serde(default)]
    pub backend: i64,
    #[serde(default)]
    pub devops: i64,
    #[serde(default)]
    pub research: i64,
}

impl Specializations {
    pub fn get(&self, domain: &str) -> Option<i64> {
        match domain {
            "frontend" => Some(self.frontend),
            "backend" => Some(self.backend),
            "devops" => Some(self.devops),
            "research" => Some(self.research),
            _ => None,
        }
    }

    pub fn add(&mut self, domain: &str, xp: i64) -> bool {
        match domain {
            "frontend" => self.frontend += xp,
            "backend" => self.backend += xp,
            "devops" => self.devops += xp,
            "research" => self.research += xp,
            _ => return false,
        }
        true
    }

    pub fn ranked(&self) -> Vec<(&'static str, i64)> {
        let mut entries = vec![
            ("frontend", self.frontend),
            ("backend", self.backend),
            ("devops", self.devops),
            ("research", self.research),
        ];
        entries.sort_by(|a, b| b.1.cmp(&a.1));
        entries
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct Abilities {
    #[serde(default)]
    pub can_commit: bool,
    #[serde(default)]
    pub can_spawn_subagents: bool,
    #[serde(default)]
    pub can_access_prod: bool,
    #[serde(default)]
    pub can_mentor_peers: bool,
    #[serde(default)]
    pub extended_budget: bool,
}

impl Abilities {
    /// Union in another grant; abilities are never revoked.
    pub fn union(&mut self, other: &Abilities) {
        self.can_commit |= other.can_commit;
        self.can_spawn_subagents |= other.can_spawn_subagents;
        self.can_access_prod |= other.can_access_prod;
        self.can_mentor_peers |= other.can_mentor_peers;
        self.extended_budget |= other.extended_budget;
    }
}

/// The long-lived progression record attached to an agent.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Soul {
    pub soul_id: String,
    pub name: String,
    pub personality: String,
    pub created_at: String,
    #[serde(rename = "totalXP")]
    pub total_xp: i64,
    pub level: SoulLevel,
    pub current_streak: i64,
    pub longest_streak: i64,
    pub tasks_completed: i64,
    pub tasks_successful: i64,
    pub peers_helped: i64,
    pub escalation_count: i64,
    pub self_resolved_count: i64,
    pub peer_assist_count: i64,
    pub human_escalation_count: i64,
    pub specializations: Specializations,
    pub achievements: Vec<String>,
    pub abilities: Abilities,
    pub trust_score: f64,
    pub transparency_score: f64,
    pub track_record_score: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_trace_id: Option<String>,
    /// Derived at read time from days of inactivity.
    pub rust_level: f64,
    /// Derived: `1 − 0.5 · rustLevel`.
    pub effective_xp_multiplier: f64,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AddXpRequest {
    pub amount: i64,
    #[serde(default)]
    pub reason: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdateFromTraceRequest {
    pub trace_id: String,
    #[serde(default)]
    pub domain: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Credential {
    pub key: String,
    pub created_at: String,
    pub updated_at: String,
    pub masked_preview: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SetCredentialRequest {
    pub key: String,
    pub value: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GoalStatus {
    Pending,
    InProgress,
    Completed,
    Failed,
    Abandoned,
}

impl GoalStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::InProgress => "in_progress",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Abandoned => "abandoned",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Goal {
    pub id: String,
    pub title: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(rename = "type")]
    pub goal_type: String,
    pub priority: i64,
    pub status: GoalStatus,
    pub xp_reward: i64,
    pub source: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub assigned_by: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context: Option<String>,
    pub created_at: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub outcome: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateGoalRequest {
    pub title: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(rename = "type", default)]
    pub goal_type: Option<String>,
    #[serde(default)]
    pub priority: Option<i64>,
    #[serde(default)]
    pub xp_reward: Option<i64>,
    #[serde(default)]
    pub source: Option<String>,
    #[serde(default)]
    pub assigned_by: Option<String>,
    #[serde(default)]
    pub context: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct GoalOutcomeRequest {
    #[serde(default)]
    pub outcome: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HeartbeatRequest {
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub detail: Option<String>,
    #[serde(default)]
    pub stall_threshold_ms: Option<i64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ShadowState {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub shadow_agent: Option<String>,
    pub status: String,
    pub updated_at: String,
}

/// Derived label describing whether the agent should be interrupted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FlowState {
    InFlow,
    Available,
    Stuck,
    Offline,
}

impl FlowState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::InFlow => "in_flow",
            Self::Available => "available",
            Self::Stuck => "stuck",
            Self::Offline => "offline",
        }
    }
}

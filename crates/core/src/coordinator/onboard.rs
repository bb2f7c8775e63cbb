//! Hot-start, onboarding, and session-resume aggregations

use serde_json::{json, Value};

use super::model::*;
use super::store;
use super::Coordinator;
use crate::error::Error;
use crate::request::{EntityRequest, EntityResponse, Method};
use crate::runtime::registry::{EntityKind, Peers};
use crate::Result;

/// First lines of messages carrying these markers count as
/// accomplishments during session resume.
const ACCOMPLISHMENT_KEYWORDS: [&str; 8] = [
    "✅",
    "shipped",
    "completed",
    "built",
    "added",
    "fixed",
    "implemented",
    "deployed",
];

impl Coordinator {
    /// `/work`: everything an agent needs to resume in one round trip.
    pub(super) fn work(&mut self, req: &EntityRequest) -> Result<EntityResponse> {
        let team = store::list_agents(&self.ctx.conn, false)?;
        let todo = store::list_tasks(&self.ctx.conn, Some("todo"), None)?;
        let recent_chat = store::recent_messages(&self.ctx.conn, 10, None)?;

        let mut mine: Vec<Task> = Vec::new();
        let mut inbox = Value::Null;
        if let Some(agent_id) = req.query_param("agentId") {
            mine = store::list_tasks(&self.ctx.conn, None, Some(agent_id))?
                .into_iter()
                .filter(|task| task.status != TaskStatus::Done)
                .collect();
            let mentions = store::pending_mentions(&self.ctx.conn, agent_id)?;
            store::ensure_agent(&self.ctx.conn, agent_id)?;
            store::touch_chat_check(&self.ctx.conn, agent_id)?;
            inbox = json!({
                "pendingMentions": mentions,
                "count": mentions.len(),
            });
        }

        let summary = format!(
            "{} agent(s) online, {} todo task(s), {} of yours in flight",
            team.len(),
            todo.len(),
            mine.len()
        );
        Ok(EntityResponse::ok(json!({
            "summary": summary,
            "team": team,
            "tasks": {
                "todo": todo.into_iter().take(10).collect::<Vec<_>>(),
                "mine": mine.into_iter().take(10).collect::<Vec<_>>(),
            },
            "recentChat": recent_chat,
            "inbox": inbox,
        })))
    }

    /// `/onboard`: fan out to the agent's own entity for soul, checkpoint,
    /// and dashboard, then assemble a single bundle. Individual peer-call
    /// failures degrade to null parts.
    pub(super) async fn onboard(&mut self, req: &EntityRequest) -> Result<EntityResponse> {
        let agent_id = req
            .query_param("agentId")
            .ok_or_else(|| Error::validation("agentId is required"))?
            .to_string();
        store::ensure_agent(&self.ctx.conn, &agent_id)?;

        let soul = Self::peer_get(self.ctx.peers.clone(), &agent_id, "/soul")
            .await
            .map(|b| b["soul"].clone());
        let is_new = soul
            .as_ref()
            .map(|s| s["totalXP"] == json!(0) && s["tasksCompleted"] == json!(0))
            .unwrap_or(true);
        let checkpoint = if is_new {
            None
        } else {
            Self::peer_get(self.ctx.peers.clone(), &agent_id, "/checkpoint")
                .await
                .map(|b| b["checkpoint"].clone())
        };
        let dashboard = Self::peer_get(self.ctx.peers.clone(), &agent_id, "/dashboard").await;

        let mut team: Vec<Value> = Vec::new();
        for agent in store::list_agents(&self.ctx.conn, false)? {
            if agent.agent_id == agent_id {
                continue;
            }
            if team.len() >= 10 {
                break;
            }
            let flow = Self::peer_get(self.ctx.peers.clone(), &agent.agent_id, "/dashboard")
                .await
                .map(|b| b["flowState"].clone())
                .unwrap_or(Value::Null);
            team.push(json!({
                "agent": agent,
                "flowState": flow,
            }));
        }

        let suggestion = self.suggest_task(&agent_id, checkpoint.as_ref())?;
        let recent_chat = store::recent_messages(&self.ctx.conn, 10, None)?;

        Ok(EntityResponse::ok(json!({
            "onboarding": {
                "agentId": agent_id,
                "isNew": is_new,
                "soul": soul,
                "checkpoint": checkpoint,
                "dashboard": dashboard,
                "team": team,
                "suggestion": suggestion,
                "recentChat": recent_chat,
            }
        })))
    }

    /// `/session-resume`: a pure aggregation over Coordinator tables.
    pub(super) fn session_resume(&self) -> Result<EntityResponse> {
        let messages = store::recent_messages(&self.ctx.conn, 200, None)?;

        let mut participants: Vec<String> = Vec::new();
        for message in &messages {
            if !participants.contains(&message.author) {
                participants.push(message.author.clone());
            }
            if participants.len() >= 100 {
                break;
            }
        }

        let mut accomplishments: Vec<String> = Vec::new();
        for message in messages.iter().rev() {
            let lowered = message.message.to_lowercase();
            if !ACCOMPLISHMENT_KEYWORDS
                .iter()
                .any(|kw| lowered.contains(kw))
            {
                continue;
            }
            let first_line: String = message
                .message
                .lines()
                .next()
                .unwrap_or("")
                .chars()
                .take(150)
                .collect();
            if first_line.is_empty() || accomplishments.contains(&first_line) {
                continue;
            }
            accomplishments.push(first_line);
            if accomplishments.len() >= 10 {
                break;
            }
        }

        let pending_handoffs: Vec<Handoff> = store::list_handoffs(&self.ctx.conn, None, None, Some("pending"))?
            .into_iter()
            .take(5)
            .collect();
        let in_progress: Vec<Task> = store::list_tasks(&self.ctx.conn, Some("in-progress"), None)?
            .into_iter()
            .take(5)
            .collect();
        let active_claims: Vec<Claim> = store::list_claims(&self.ctx.conn, false)?
            .into_iter()
            .take(10)
            .collect();

        let mut quick_actions: Vec<String> = Vec::new();
        if !pending_handoffs.is_empty() {
            quick_actions.push(format!("Claim one of {} pending handoff(s)", pending_handoffs.len()));
        }
        let unassigned_todo = store::list_tasks(&self.ctx.conn, Some("todo"), None)?
            .into_iter()
            .filter(|task| task.assignee.is_none())
            .count();
        if unassigned_todo > 0 {
            quick_actions.push(format!("Pick up one of {} unassigned todo task(s)", unassigned_todo));
        }
        if !active_claims.is_empty() {
            quick_actions.push(format!(
                "Check {} active claim(s) before touching shared areas",
                active_claims.len()
            ));
        }
        if participants.is_empty() {
            quick_actions.push("Say hello in the group chat".to_string());
        }

        let summary = format!(
            "{} participant(s), {} accomplishment(s), {} pending handoff(s), {} task(s) in progress",
            participants.len(),
            accomplishments.len(),
            pending_handoffs.len(),
            in_progress.len()
        );

        Ok(EntityResponse::ok(json!({
            "summary": summary,
            "participants": participants,
            "accomplishments": accomplishments,
            "pendingHandoffs": pending_handoffs,
            "inProgressTasks": in_progress,
            "activeClaims": active_claims,
            "quickActions": quick_actions,
        })))
    }

    /// Suggestion priority: resumable checkpoint work, then the oldest
    /// open handoff, then the highest-priority unassigned todo, then a
    /// default introduction.
    fn suggest_task(&self, agent_id: &str, checkpoint: Option<&Value>) -> Result<Value> {
        if let Some(checkpoint) = checkpoint {
            if let Some(pending) = checkpoint["pendingWork"].as_array() {
                if let Some(first) = pending.first() {
                    return Ok(json!({
                        "type": "resume",
                        "detail": first,
                        "reason": "You have checkpointed pending work",
                    }));
                }
            }
        }

        let handoffs = store::list_handoffs(&self.ctx.conn, Some(agent_id), None, Some("pending"))?;
        if let Some(oldest) = handoffs.first() {
            return Ok(json!({
                "type": "handoff",
                "handoff": oldest,
                "reason": "Oldest open handoff addressed to you",
            }));
        }

        let mut todo: Vec<Task> = store::list_tasks(&self.ctx.conn, Some("todo"), None)?
            .into_iter()
            .filter(|task| task.assignee.is_none())
            .collect();
        todo.sort_by(|a, b| {
            b.priority
                .rank()
                .cmp(&a.priority.rank())
                .then(a.created_at.cmp(&b.created_at))
        });
        if let Some(task) = todo.into_iter().next() {
            return Ok(json!({
                "type": "task",
                "task": task,
                "reason": "Highest-priority unassigned task",
            }));
        }

        Ok(json!({
            "type": "introduce",
            "detail": "Introduce yourself in the group chat and pick up work as it appears",
        }))
    }

    async fn peer_get(peers: Peers, agent_id: &str, path: &str) -> Option<Value> {
        let response = peers
            .call(
                EntityKind::Agent,
                agent_id,
                EntityRequest::new(Method::Get, path),
            )
            .await
            .ok()?;
        if response.is_success() {
            Some(response.body)
        } else {
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::storage::open_in_memory;
    use crate::runtime::EntityContext;
    use crate::runtime::Entity;

    fn coordinator() -> Coordinator {
        let ctx = EntityContext::new("main", open_in_memory().unwrap());
        Coordinator::create(ctx).unwrap()
    }

    fn post(path: &str, body: serde_json::Value) -> EntityRequest {
        EntityRequest::new(Method::Post, path).with_body(body)
    }

    fn get(path: &str) -> EntityRequest {
        EntityRequest::new(Method::Get, path)
    }

    #[tokio::test]
    async fn work_bundle_advances_mention_cursor() {
        let mut coordinator = coordinator();
        coordinator
            .handle(post(
                "/chat",
                json!({ "author": "phoenix", "message": "hey @raven can you review?" }),
            ))
            .await
            .unwrap();

        let first = coordinator
            .handle(get("/work").with_query("agentId", "raven"))
            .await
            .unwrap();
        assert_eq!(first.body["inbox"]["count"], 1);
        assert_eq!(
            first.body["inbox"]["pendingMentions"][0]["message"],
            "hey @raven can you review?"
        );

        let second = coordinator
            .handle(get("/work").with_query("agentId", "raven"))
            .await
            .unwrap();
        assert_eq!(second.body["inbox"]["count"], 0);
    }

    #[tokio::test]
    async fn work_separates_todo_and_mine() {
        let mut coordinator = coordinator();
        coordinator
            .handle(post("/tasks", json!({ "title": "triage bugs", "createdBy": "x" })))
            .await
            .unwrap();
        coordinator
            .handle(post(
                "/tasks",
                json!({ "title": "ship feature", "createdBy": "x", "assignee": "raven", "status": "in-progress" }),
            ))
            .await
            .unwrap();

        let work = coordinator
            .handle(get("/work").with_query("agentId", "raven"))
            .await
            .unwrap();
        assert_eq!(work.body["tasks"]["todo"].as_array().unwrap().len(), 1);
        assert_eq!(work.body["tasks"]["mine"].as_array().unwrap().len(), 1);
        assert_eq!(work.body["tasks"]["mine"][0]["title"], "ship feature");
    }

    #[tokio::test]
    async fn session_resume_extracts_accomplishments() {
        let mut coordinator = coordinator();
        for (author, message) in [
            ("phoenix", "✅ shipped the auth refactor\ndetails follow"),
            ("raven", "fixed the flaky websocket test"),
            ("raven", "just thinking out loud"),
            ("sparrow", "deployed v2 to staging"),
        ] {
            coordinator
                .handle(post("/chat", json!({ "author": author, "message": message })))
                .await
                .unwrap();
        }
        coordinator
            .handle(post(
                "/handoffs",
                json!({ "action": "create", "fromAgent": "raven", "title": "finish docs" }),
            ))
            .await
            .unwrap();

        let resume = coordinator.handle(get("/session-resume")).await.unwrap();
        let accomplishments = resume.body["accomplishments"].as_array().unwrap();
        assert_eq!(accomplishments.len(), 3);
        assert!(accomplishments
            .iter()
            .any(|a| a.as_str().unwrap().contains("shipped the auth refactor")));
        // Only the first line survives.
        assert!(!accomplishments
            .iter()
            .any(|a| a.as_str().unwrap().contains("details follow")));

        let participants = resume.body["participants"].as_array().unwrap();
        assert_eq!(participants.len(), 3);
        assert_eq!(resume.body["pendingHandoffs"].as_array().unwrap().len(), 1);
        assert!(!resume.body["quickActions"].as_array().unwrap().is_empty());
    }

    #[tokio::test]
    async fn suggestion_prefers_handoff_then_task() {
        let mut coordinator = coordinator();
        coordinator
            .handle(post(
                "/tasks",
                json!({ "title": "low prio chore", "createdBy": "x", "priority": "low" }),
            ))
            .await
            .unwrap();
        coordinator
            .handle(post(
                "/tasks",
                json!({ "title": "urgent fix", "createdBy": "x", "priority": "urgent" }),
            ))
            .await
            .unwrap();

        // No handoff: highest-priority unassigned task wins.
        let suggestion = coordinator.suggest_task("raven", None).unwrap();
        assert_eq!(suggestion["type"], "task");
        assert_eq!(suggestion["task"]["title"], "urgent fix");

        coordinator
            .handle(post(
                "/handoffs",
                json!({ "action": "create", "fromAgent": "phoenix", "toAgent": "raven", "title": "take over parser" }),
            ))
            .await
            .unwrap();
        let suggestion = coordinator.suggest_task("raven", None).unwrap();
        assert_eq!(suggestion["type"], "handoff");

        // Checkpointed pending work beats everything.
        let checkpoint = json!({ "pendingWork": ["finish the migration"] });
        let suggestion = coordinator.suggest_task("raven", Some(&checkpoint)).unwrap();
        assert_eq!(suggestion["type"], "resume");
    }

    #[tokio::test]
    async fn onboard_degrades_without_peer_registry() {
        let mut coordinator = coordinator();
        // Peers are disconnected in tests, so agent-entity parts are null.
        let onboarding = coordinator
            .handle(get("/onboard").with_query("agentId", "raven"))
            .await
            .unwrap();
        let bundle = &onboarding.body["onboarding"];
        assert_eq!(bundle["agentId"], "raven");
        assert!(bundle["soul"].is_null());
        assert!(bundle["dashboard"].is_null());
        assert_eq!(bundle["isNew"], true);
        assert_eq!(bundle["suggestion"]["type"], "introduce");
    }
}

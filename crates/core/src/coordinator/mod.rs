//! Coordinator entity: the cross-agent singleton
//!
//! Registry, group chat with mention tracking, shared task board, zones,
//! claims, and handoffs, plus the onboarding and session-resume
//! aggregations in `onboard.rs`.

pub mod model;
pub mod onboard;
pub mod store;

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::json;
use uuid::Uuid;

use crate::error::Error;
use crate::request::{EntityRequest, EntityResponse, Method};
use crate::runtime::sockets::{SocketEvent, SocketHub};
use crate::runtime::storage::now_rfc3339;
use crate::runtime::{Entity, EntityContext};
use crate::Result;

use model::*;

pub struct Coordinator {
    pub(crate) ctx: EntityContext,
}

#[async_trait]
impl Entity for Coordinator {
    fn kind() -> &'static str {
        "coordinator"
    }

    fn create(ctx: EntityContext) -> Result<Self> {
        store::bootstrap(&ctx.conn)?;
        Ok(Self { ctx })
    }

    async fn handle(&mut self, req: EntityRequest) -> Result<EntityResponse> {
        let segments = req.segments();
        match (req.method, segments.as_slice()) {
            (Method::Get, ["agents"]) => self.list_agents(&req),
            (Method::Post, ["agents"]) => self.upsert_agent(req.parse_body()?).await,

            (Method::Get, ["chat"]) => self.get_chat(&req),
            (Method::Post, ["chat"]) => self.post_chat(req.parse_body()?).await,
            (Method::Post, ["chat", id, "react"]) => {
                let id = id.to_string();
                self.react(&id, req.parse_body()?)
            }

            (Method::Get, ["tasks"]) => self.list_tasks(&req),
            (Method::Post, ["tasks"]) => self.upsert_task(req.parse_body()?).await,

            (Method::Get, ["zones"]) => self.list_zones(&req),
            (Method::Get, ["zones", "check"]) => self.check_zone(&req),
            (Method::Post, ["zones"]) => self.claim_zone(req.parse_body()?),
            (Method::Delete, ["zones", zone_id]) => self.release_zone(zone_id),

            (Method::Get, ["claims"]) => self.list_claims(&req),
            (Method::Post, ["claims"]) => self.claim_action(req.parse_body()?),

            (Method::Get, ["handoffs"]) => self.list_handoffs(&req),
            (Method::Post, ["handoffs"]) => self.handoff_action(req.parse_body()?).await,

            (Method::Get, ["work"]) => self.work(&req),
            (Method::Get, ["onboard"]) => self.onboard(&req).await,
            (Method::Get, ["session-resume"]) => self.session_resume(),

            (
                _,
                ["agents"] | ["chat"] | ["tasks"] | ["zones"] | ["claims"] | ["handoffs"]
                | ["work"] | ["onboard"] | ["session-resume"],
            ) => Err(Error::MethodNotAllowed),
            _ => Err(Error::not_found(format!("No route for {}", req.path))),
        }
    }
}

impl Coordinator {
    fn list_agents(&self, req: &EntityRequest) -> Result<EntityResponse> {
        let agents = store::list_agents(&self.ctx.conn, req.query_flag("includeOffline"))?;
        Ok(EntityResponse::ok(json!({ "agents": agents })))
    }

    pub(crate) async fn upsert_agent(&mut self, req: AgentUpsertRequest) -> Result<EntityResponse> {
        if req.agent_id.trim().is_empty() {
            return Err(Error::validation("agentId is required"));
        }
        let agent = store::upsert_agent(&self.ctx.conn, &req)?;
        self.ctx
            .hub
            .broadcast(
                &SocketEvent::new("agent-update", serde_json::to_value(&agent)?),
                Some(agent.agent_id.as_str()),
            )
            .await;
        Ok(EntityResponse::ok(json!({ "agent": agent })))
    }

    fn get_chat(&mut self, req: &EntityRequest) -> Result<EntityResponse> {
        let limit = req.query_usize("limit").unwrap_or(50).clamp(1, 200);
        let messages = store::recent_messages(&self.ctx.conn, limit, req.query_param("since"))?;

        let Some(agent_id) = req.query_param("agentId") else {
            return Ok(EntityResponse::ok(json!({ "messages": messages })));
        };

        // Compute mentions against the stored cursor (a never-seen agent
        // has none, so its whole history counts), then advance it.
        let mentions = store::pending_mentions(&self.ctx.conn, agent_id)?;
        store::ensure_agent(&self.ctx.conn, agent_id)?;
        store::touch_chat_check(&self.ctx.conn, agent_id)?;

        if req.query_flag("inbox") {
            return Ok(EntityResponse::ok(json!({
                "pendingMentions": mentions,
                "count": mentions.len(),
            })));
        }
        Ok(EntityResponse::ok(json!({
            "messages": messages,
            "pendingMentions": mentions,
        })))
    }

    pub(crate) async fn post_chat(&mut self, req: ChatPostRequest) -> Result<EntityResponse> {
        if req.author.trim().is_empty() || req.message.trim().is_empty() {
            return Err(Error::validation("author and message are required"));
        }
        store::ensure_agent(&self.ctx.conn, &req.author)?;
        let message = store::append_message(&self.ctx.conn, &req)?;
        self.ctx
            .hub
            .broadcast(
                &SocketEvent::new("chat", serde_json::to_value(&message)?),
                Some(message.author.as_str()),
            )
            .await;
        Ok(EntityResponse::ok(json!({ "message": message })))
    }

    fn react(&mut self, id: &str, req: ReactRequest) -> Result<EntityResponse> {
        let mut message = store::get_message(&self.ctx.conn, id)?
            .ok_or_else(|| Error::not_found(format!("Message {}", id)))?;
        message.reactions.push(Reaction {
            emoji: req.emoji,
            by: req.by,
            at: now_rfc3339(),
        });
        store::set_reactions(&self.ctx.conn, id, &message.reactions)?;
        Ok(EntityResponse::ok(json!({ "message": message })))
    }

    fn list_tasks(&self, req: &EntityRequest) -> Result<EntityResponse> {
        let tasks = store::list_tasks(
            &self.ctx.conn,
            req.query_param("status"),
            req.query_param("assignee"),
        )?;
        Ok(EntityResponse::ok(json!({ "tasks": tasks })))
    }

    async fn upsert_task(&mut self, req: TaskUpsertRequest) -> Result<EntityResponse> {
        let existing = match &req.id {
            Some(id) => store::get_task(&self.ctx.conn, id)?,
            None => None,
        };
        let task = match existing {
            Some(mut task) => {
                if let Some(title) = req.title {
                    task.title = title;
                }
                if req.description.is_some() {
                    task.description = req.description;
                }
                if let Some(status) = req.status {
                    task.status = status;
                }
                if req.assignee.is_some() {
                    task.assignee = req.assignee;
                }
                if let Some(priority) = req.priority {
                    task.priority = priority;
                }
                if let Some(tags) = req.tags {
                    task.tags = tags;
                }
                if let Some(files) = req.files {
                    task.files = files;
                }
                task.updated_at = now_rfc3339();
                task
            }
            None => {
                let title = req
                    .title
                    .filter(|t| !t.trim().is_empty())
                    .ok_or_else(|| Error::validation("title is required"))?;
                let now = now_rfc3339();
                Task {
                    id: req.id.unwrap_or_else(|| Uuid::new_v4().to_string()),
                    title,
                    description: req.description,
                    status: req.status.unwrap_or(TaskStatus::Todo),
                    assignee: req.assignee,
                    created_by: req.created_by.unwrap_or_else(|| "unknown".to_string()),
                    priority: req.priority.unwrap_or(TaskPriority::Medium),
                    tags: req.tags.unwrap_or_default(),
                    files: req.files.unwrap_or_default(),
                    created_at: now.clone(),
                    updated_at: now,
                }
            }
        };
        store::upsert_task(&self.ctx.conn, &task)?;
        Self::broadcast_task_update(self.ctx.hub.clone(), json!({ "task": &task })).await;
        Ok(EntityResponse::ok(json!({ "task": task })))
    }

    fn list_zones(&self, req: &EntityRequest) -> Result<EntityResponse> {
        let zones = store::list_zones(&self.ctx.conn, req.query_param("owner"))?;
        Ok(EntityResponse::ok(json!({ "zones": zones })))
    }

    fn check_zone(&self, req: &EntityRequest) -> Result<EntityResponse> {
        let path = req
            .query_param("path")
            .ok_or_else(|| Error::validation("path is required"))?;
        let zone = store::zone_for_path(&self.ctx.conn, path)?;
        Ok(EntityResponse::ok(json!({
            "inZone": zone.is_some(),
            "zone": zone,
        })))
    }

    fn claim_zone(&mut self, req: ZoneClaimRequest) -> Result<EntityResponse> {
        if req.path.trim().is_empty() || req.owner.trim().is_empty() {
            return Err(Error::validation("path and owner are required"));
        }
        let zone = store::upsert_zone(&self.ctx.conn, &req)?;
        Ok(EntityResponse::ok(json!({ "zone": zone })))
    }

    fn release_zone(&mut self, zone_id: &str) -> Result<EntityResponse> {
        if !store::delete_zone(&self.ctx.conn, zone_id)? {
            return Err(Error::not_found(format!("Zone {}", zone_id)));
        }
        Ok(EntityResponse::ok(json!({ "released": true })))
    }

    fn list_claims(&self, req: &EntityRequest) -> Result<EntityResponse> {
        let claims = store::list_claims(&self.ctx.conn, req.query_flag("includeStale"))?;
        Ok(EntityResponse::ok(json!({ "claims": claims })))
    }

    /// At-most-once claim semantics: a claim sticks until released or
    /// stale; re-claim by the holder renews it.
    fn claim_action(&mut self, req: ClaimActionRequest) -> Result<EntityResponse> {
        if req.what.trim().is_empty() || req.by.trim().is_empty() {
            return Err(Error::validation("what and by are required"));
        }
        match req.action {
            ClaimAction::Claim => {
                if let Some(existing) = store::get_claim(&self.ctx.conn, &req.what)? {
                    if !existing.stale && existing.by != req.by {
                        return Err(Error::Conflict(json!({
                            "success": false,
                            "claim": existing,
                        })));
                    }
                }
                let claim =
                    store::put_claim(&self.ctx.conn, &req.what, &req.by, req.description.as_deref())?;
                Ok(EntityResponse::ok(json!({ "success": true, "claim": claim })))
            }
            ClaimAction::Release => {
                let Some(existing) = store::get_claim(&self.ctx.conn, &req.what)? else {
                    return Ok(EntityResponse::ok(json!({
                        "success": true,
                        "released": false,
                    })));
                };
                if existing.by != req.by {
                    return Err(Error::Forbidden(format!(
                        "Claim is held by {}",
                        existing.by
                    )));
                }
                store::delete_claim(&self.ctx.conn, &req.what)?;
                Ok(EntityResponse::ok(json!({
                    "success": true,
                    "released": true,
                })))
            }
        }
    }

    fn list_handoffs(&self, req: &EntityRequest) -> Result<EntityResponse> {
        let handoffs = store::list_handoffs(
            &self.ctx.conn,
            req.query_param("toAgent"),
            req.query_param("fromAgent"),
            req.query_param("status"),
        )?;
        Ok(EntityResponse::ok(json!({ "handoffs": handoffs })))
    }

    async fn handoff_action(&mut self, req: HandoffActionRequest) -> Result<EntityResponse> {
        match req.action {
            HandoffAction::Create => {
                let from_agent = req
                    .from_agent
                    .filter(|a| !a.trim().is_empty())
                    .ok_or_else(|| Error::validation("fromAgent is required"))?;
                let title = req
                    .title
                    .filter(|t| !t.trim().is_empty())
                    .ok_or_else(|| Error::validation("title is required"))?;
                let handoff = Handoff {
                    id: Uuid::new_v4().to_string(),
                    from_agent,
                    to_agent: req.to_agent.filter(|a| !a.trim().is_empty()),
                    title,
                    context: req.context.unwrap_or_default(),
                    code: req.code,
                    file_path: req.file_path,
                    next_steps: req.next_steps.unwrap_or_default(),
                    priority: req.priority.unwrap_or(TaskPriority::Medium),
                    status: HandoffStatus::Pending,
                    claimed_by: None,
                    created_at: now_rfc3339(),
                    claimed_at: None,
                    completed_at: None,
                };
                store::insert_handoff(&self.ctx.conn, &handoff)?;
                Self::broadcast_task_update(self.ctx.hub.clone(), json!({ "handoff": &handoff })).await;
                Ok(EntityResponse::ok(json!({ "handoff": handoff })))
            }
            HandoffAction::Claim => {
                let (id, agent_id) = handoff_actor(&req)?;
                let handoff = self.require_handoff(&id)?;
                if handoff.status != HandoffStatus::Pending {
                    return Err(Error::Conflict(json!({
                        "error": format!("Handoff is {}", handoff.status.as_str()),
                        "handoff": handoff,
                    })));
                }
                if let Some(target) = &handoff.to_agent {
                    if target != &agent_id {
                        return Err(Error::Conflict(json!({
                            "error": format!("Handoff is targeted to {}", target),
                            "handoff": handoff,
                        })));
                    }
                }
                store::mark_handoff_claimed(&self.ctx.conn, &id, &agent_id)?;
                let handoff = self.require_handoff(&id)?;
                Self::broadcast_task_update(self.ctx.hub.clone(), json!({ "handoff": &handoff })).await;
                Ok(EntityResponse::ok(json!({ "handoff": handoff })))
            }
            HandoffAction::Complete => {
                let (id, agent_id) = handoff_actor(&req)?;
                let handoff = self.require_handoff(&id)?;
                if handoff.status != HandoffStatus::Claimed {
                    return Err(Error::Conflict(json!({
                        "error": format!("Handoff is {}", handoff.status.as_str()),
                        "handoff": handoff,
                    })));
                }
                if handoff.claimed_by.as_deref() != Some(agent_id.as_str()) {
                    return Err(Error::Conflict(json!({
                        "error": format!(
                            "Handoff is claimed by {}",
                            handoff.claimed_by.as_deref().unwrap_or("nobody")
                        ),
                        "handoff": handoff,
                    })));
                }
                store::mark_handoff_completed(&self.ctx.conn, &id)?;
                let handoff = self.require_handoff(&id)?;
                Self::broadcast_task_update(self.ctx.hub.clone(), json!({ "handoff": &handoff })).await;
                Ok(EntityResponse::ok(json!({ "handoff": handoff })))
            }
        }
    }

    fn require_handoff(&self, id: &str) -> Result<Handoff> {
        store::get_handoff(&self.ctx.conn, id)?
            .ok_or_else(|| Error::not_found(format!("Handoff {}", id)))
    }

    async fn broadcast_task_update(hub: Arc<SocketHub>, payload: serde_json::Value) {
        hub.broadcast(&SocketEvent::new("task-update", payload), None)
            .await;
    }
}

fn handoff_actor(req: &HandoffActionRequest) -> Result<(String, String)> {
    let id = req
        .handoff_id
        .clone()
        .filter(|id| !id.trim().is_empty())
        .ok_or_else(|| Error::validation("handoffId is required"))?;
    let agent_id = req
        .agent_id
        .clone()
        .filter(|a| !a.trim().is_empty())
        .ok_or_else(|| Error::validation("agentId is required"))?;
    Ok((id, agent_id))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::storage::open_in_memory;
    use chrono::{Duration, Utc};

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
    async fn agent_upsert_coalesces_fields() {
        let mut coordinator = coordinator();
        coordinator
            .handle(post(
                "/agents",
                json!({ "agentId": "phoenix", "currentTask": "auth refactor", "capabilities": ["rust"] }),
            ))
            .await
            .unwrap();

        let updated = coordinator
            .handle(post("/agents", json!({ "agentId": "phoenix", "status": "idle" })))
            .await
            .unwrap();
        assert_eq!(updated.body["agent"]["status"], "idle");
        assert_eq!(updated.body["agent"]["currentTask"], "auth refactor");
        assert_eq!(updated.body["agent"]["capabilities"][0], "rust");
    }

    #[tokio::test]
    async fn offline_agents_hidden_from_listing() {
        let mut coordinator = coordinator();
        coordinator
            .handle(post("/agents", json!({ "agentId": "phoenix" })))
            .await
            .unwrap();
        coordinator
            .handle(post("/agents", json!({ "agentId": "ghost", "status": "offline" })))
            .await
            .unwrap();

        let listed = coordinator.handle(get("/agents")).await.unwrap();
        let ids: Vec<&str> = listed.body["agents"]
            .as_array()
            .unwrap()
            .iter()
            .map(|a| a["agentId"].as_str().unwrap())
            .collect();
        assert_eq!(ids, vec!["phoenix"]);

        let all = coordinator
            .handle(get("/agents").with_query("includeOffline", "true"))
            .await
            .unwrap();
        assert_eq!(all.body["agents"].as_array().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn mention_cursor_advances_on_read() {
        let mut coordinator = coordinator();
        coordinator
            .handle(post("/chat", json!({ "author": "raven", "message": "starting up" })))
            .await
            .unwrap();
        coordinator
            .handle(post(
                "/chat",
                json!({ "author": "phoenix", "message": "hey @raven can you review?" }),
            ))
            .await
            .unwrap();

        let first = coordinator
            .handle(get("/chat").with_query("agentId", "raven"))
            .await
            .unwrap();
        let mentions = first.body["pendingMentions"].as_array().unwrap();
        assert_eq!(mentions.len(), 1);
        assert_eq!(mentions[0]["author"], "phoenix");

        let second = coordinator
            .handle(get("/chat").with_query("agentId", "raven"))
            .await
            .unwrap();
        assert!(second.body["pendingMentions"].as_array().unwrap().is_empty());
    }

    #[tokio::test]
    async fn own_messages_never_count_as_mentions() {
        let mut coordinator = coordinator();
        coordinator
            .handle(post(
                "/chat",
                json!({ "author": "raven", "message": "note to self @raven" }),
            ))
            .await
            .unwrap();
        let inbox = coordinator
            .handle(get("/chat").with_query("agentId", "raven").with_query("inbox", "true"))
            .await
            .unwrap();
        assert_eq!(inbox.body["count"], 0);
    }

    #[tokio::test]
    async fn claim_race_and_stale_takeover() {
        let mut coordinator = coordinator();
        let first = coordinator
            .handle(post(
                "/claims",
                json!({ "action": "claim", "what": "refactor-auth", "by": "phoenix" }),
            ))
            .await
            .unwrap();
        assert_eq!(first.body["success"], true);

        let conflict = coordinator
            .handle(post(
                "/claims",
                json!({ "action": "claim", "what": "refactor-auth", "by": "raven" }),
            ))
            .await
            .unwrap_err();
        assert_eq!(conflict.status(), 409);
        let body = conflict.body();
        assert_eq!(body["success"], false);
        assert_eq!(body["claim"]["by"], "phoenix");
        assert_eq!(body["claim"]["stale"], false);

        // Age the claim past the staleness window.
        coordinator
            .ctx
            .conn
            .execute(
                "UPDATE claims SET since = ?1",
                rusqlite::params![(Utc::now() - Duration::minutes(31)).to_rfc3339()],
            )
            .unwrap();

        let listed = coordinator
            .handle(get("/claims").with_query("includeStale", "true"))
            .await
            .unwrap();
        assert_eq!(listed.body["claims"][0]["stale"], true);

        let takeover = coordinator
            .handle(post(
                "/claims",
                json!({ "action": "claim", "what": "refactor-auth", "by": "raven" }),
            ))
            .await
            .unwrap();
        assert_eq!(takeover.body["claim"]["by"], "raven");
    }

    #[tokio::test]
    async fn claim_release_guarded_by_holder() {
        let mut coordinator = coordinator();
        coordinator
            .handle(post(
                "/claims",
                json!({ "action": "claim", "what": "deploy", "by": "phoenix" }),
            ))
            .await
            .unwrap();

        let denied = coordinator
            .handle(post(
                "/claims",
                json!({ "action": "release", "what": "deploy", "by": "raven" }),
            ))
            .await
            .unwrap_err();
        assert_eq!(denied.status(), 403);

        coordinator
            .handle(post(
                "/claims",
                json!({ "action": "release", "what": "deploy", "by": "phoenix" }),
            ))
            .await
            .unwrap();
        let listed = coordinator.handle(get("/claims")).await.unwrap();
        assert!(listed.body["claims"].as_array().unwrap().is_empty());
    }

    #[tokio::test]
    async fn handoff_lifecycle_enforces_target_and_claimer() {
        let mut coordinator = coordinator();
        let created = coordinator
            .handle(post(
                "/handoffs",
                json!({
                    "action": "create",
                    "fromAgent": "sparrow",
                    "toAgent": "phoenix",
                    "title": "finish the parser",
                }),
            ))
            .await
            .unwrap();
        let id = created.body["handoff"]["id"].as_str().unwrap().to_string();
        assert_eq!(created.body["handoff"]["status"], "pending");

        let wrong_claimer = coordinator
            .handle(post(
                "/handoffs",
                json!({ "action": "claim", "handoffId": id, "agentId": "raven" }),
            ))
            .await
            .unwrap_err();
        assert_eq!(wrong_claimer.status(), 409);
        assert_eq!(
            wrong_claimer.body()["error"],
            "Handoff is targeted to phoenix"
        );

        coordinator
            .handle(post(
                "/handoffs",
                json!({ "action": "claim", "handoffId": id, "agentId": "phoenix" }),
            ))
            .await
            .unwrap();

        let wrong_completer = coordinator
            .handle(post(
                "/handoffs",
                json!({ "action": "complete", "handoffId": id, "agentId": "raven" }),
            ))
            .await
            .unwrap_err();
        assert_eq!(wrong_completer.status(), 409);
        assert_eq!(
            wrong_completer.body()["error"],
            "Handoff is claimed by phoenix"
        );

        let completed = coordinator
            .handle(post(
                "/handoffs",
                json!({ "action": "complete", "handoffId": id, "agentId": "phoenix" }),
            ))
            .await
            .unwrap();
        assert_eq!(completed.body["handoff"]["status"], "completed");

        let replay = coordinator
            .handle(post(
                "/handoffs",
                json!({ "action": "complete", "handoffId": id, "agentId": "phoenix" }),
            ))
            .await
            .unwrap_err();
        assert_eq!(replay.status(), 409);
    }

    #[tokio::test]
    async fn zone_boundary_is_separator_safe() {
        let mut coordinator = coordinator();
        coordinator
            .handle(post("/zones", json!({ "path": "src/api", "owner": "phoenix" })))
            .await
            .unwrap();

        let inside = coordinator
            .handle(get("/zones/check").with_query("path", "src/api/routes.ts"))
            .await
            .unwrap();
        assert_eq!(inside.body["inZone"], true);

        let exact = coordinator
            .handle(get("/zones/check").with_query("path", "src/api"))
            .await
            .unwrap();
        assert_eq!(exact.body["inZone"], true);

        let sibling = coordinator
            .handle(get("/zones/check").with_query("path", "src/api-v2/foo.ts"))
            .await
            .unwrap();
        assert_eq!(sibling.body["inZone"], false);
    }

    #[tokio::test]
    async fn task_upsert_then_update_by_id() {
        let mut coordinator = coordinator();
        let created = coordinator
            .handle(post(
                "/tasks",
                json!({ "title": "wire the webhook", "createdBy": "phoenix", "priority": "high" }),
            ))
            .await
            .unwrap();
        let id = created.body["task"]["id"].as_str().unwrap().to_string();

        let updated = coordinator
            .handle(post(
                "/tasks",
                json!({ "id": id, "status": "in-progress", "assignee": "raven" }),
            ))
            .await
            .unwrap();
        assert_eq!(updated.body["task"]["status"], "in-progress");
        assert_eq!(updated.body["task"]["assignee"], "raven");
        assert_eq!(updated.body["task"]["title"], "wire the webhook");

        let mine = coordinator
            .handle(get("/tasks").with_query("assignee", "raven"))
            .await
            .unwrap();
        assert_eq!(mine.body["tasks"].as_array().unwrap().len(), 1);
    }
}

//! VMPool entity: fleet registry, agent assignment, health bookkeeping
//!
//! The pool records registrations and hands out assignments; it never
//! provisions hardware. Scaling output is a recommendation for external
//! operators.

pub mod model;
pub mod store;

use async_trait::async_trait;
use chrono::{Duration, Utc};
use serde_json::json;
use uuid::Uuid;

use crate::error::Error;
use crate::request::{EntityRequest, EntityResponse, Method};
use crate::runtime::storage::{now_rfc3339, parse_rfc3339};
use crate::runtime::{Entity, EntityContext};
use crate::Result;

pub use model::*;

pub struct VmPool {
    ctx: EntityContext,
}

#[async_trait]
impl Entity for VmPool {
    fn kind() -> &'static str {
        "vmpool"
    }

    fn create(ctx: EntityContext) -> Result<Self> {
        store::bootstrap(&ctx.conn)?;
        let (config, _) = store::load_pool_state(&ctx.conn)?;
        ctx.alarm
            .schedule(Utc::now() + Duration::milliseconds(config.health_check_interval_ms));
        Ok(Self { ctx })
    }

    async fn handle(&mut self, req: EntityRequest) -> Result<EntityResponse> {
        let segments = req.segments();
        match (req.method, segments.as_slice()) {
            (Method::Post, ["vms"]) => self.provision(req.parse_body()?),
            (Method::Get, ["vms"]) => self.list_vms(&req),
            (Method::Get, ["vms", vm_id]) => self.get_vm(vm_id),
            (Method::Post, ["vms", vm_id, "ready"]) => {
                let vm_id = vm_id.to_string();
                self.mark_ready(&vm_id, req.parse_body()?)
            }
            (Method::Post, ["vms", vm_id, "health"]) => {
                let vm_id = vm_id.to_string();
                self.report_health(&vm_id, req.parse_body()?)
            }
            (Method::Post, ["vms", vm_id, "terminate"]) => {
                let vm_id = vm_id.to_string();
                self.terminate(&vm_id, req.parse_body()?)
            }
            (Method::Post, ["spawn"]) => self.spawn(req.parse_body()?),
            (Method::Post, ["release"]) => self.release(req.parse_body()?),
            (Method::Get, ["assignments"]) => self.list_assignments(&req),
            (Method::Get, ["scale"]) => self.scale(),
            (Method::Get, ["status"]) => self.status(),
            (Method::Get, ["config"]) => self.get_config(),
            (Method::Post, ["config"]) => self.patch_config(req.parse_body()?),
            (
                _,
                ["vms"] | ["spawn"] | ["release"] | ["assignments"] | ["scale"] | ["status"]
                | ["config"],
            ) => Err(Error::MethodNotAllowed),
            _ => Err(Error::not_found(format!("No route for {}", req.path))),
        }
    }

    /// Periodic sweep: boot timeouts, unresponsive marking, auto-scale
    /// flag, 7-day purge; re-arms itself.
    async fn on_alarm(&mut self) -> Result<()> {
        let (config, _) = store::load_pool_state(&self.ctx.conn)?;
        let now = Utc::now();

        for mut vm in store::list_vms(&self.ctx.conn, None)? {
            if vm.status.is_terminal() {
                continue;
            }
            match vm.status {
                VmStatus::Provisioning | VmStatus::Booting => {
                    let timed_out = parse_rfc3339(&vm.created_at)
                        .map(|at| now - at > Duration::milliseconds(config.vm_boot_timeout_ms))
                        .unwrap_or(false);
                    if timed_out {
                        vm.status = VmStatus::Error;
                        vm.error_message = Some("Boot timeout exceeded".to_string());
                        store::update_vm(&self.ctx.conn, &vm)?;
                    }
                }
                VmStatus::Ready | VmStatus::Busy => {
                    let stale_window =
                        Duration::milliseconds(3 * config.health_check_interval_ms);
                    let stale = match vm.last_health_check.as_deref().and_then(parse_rfc3339) {
                        Some(at) => now - at > stale_window,
                        None => parse_rfc3339(vm.ready_at.as_deref().unwrap_or(&vm.created_at))
                            .map(|at| now - at > stale_window)
                            .unwrap_or(false),
                    };
                    if stale && vm.health_status != HealthStatus::Unresponsive {
                        vm.health_status = HealthStatus::Unresponsive;
                        store::update_vm(&self.ctx.conn, &vm)?;
                    }
                }
                _ => {}
            }
        }

        let free = store::free_ready_slots(&self.ctx.conn)?;
        let active = store::active_vm_count(&self.ctx.conn)?;
        let pending_scale_up = free < config.target_free_capacity && active < config.max_vms;
        store::save_pool_state(&self.ctx.conn, &config, pending_scale_up)?;

        let cutoff = (now - Duration::days(7)).to_rfc3339();
        store::purge_old_rows(&self.ctx.conn, &cutoff)?;

        self.ctx
            .alarm
            .schedule(now + Duration::milliseconds(config.health_check_interval_ms));
        Ok(())
    }
}

impl VmPool {
    fn provision(&mut self, req: ProvisionRequest) -> Result<EntityResponse> {
        if req.instance_id.trim().is_empty() {
            return Err(Error::validation("instanceId is required"));
        }
        let size = req.vm_size.unwrap_or(VmSize::Small);
        let vm = Vm {
            vm_id: req
                .vm_id
                .filter(|id| !id.trim().is_empty())
                .unwrap_or_else(|| format!("vm-{}", Uuid::new_v4())),
            instance_id: req.instance_id,
            status: VmStatus::Provisioning,
            public_ip: None,
            private_ip: None,
            region: req.region.unwrap_or_else(|| "us-east-1".to_string()),
            vm_size: size,
            created_at: now_rfc3339(),
            ready_at: None,
            last_health_check: None,
            health_status: HealthStatus::Unknown,
            error_message: None,
            agent_count: 0,
            max_agents: size.capacity(),
            metadata: req.metadata,
        };
        if store::get_vm(&self.ctx.conn, &vm.vm_id)?.is_some() {
            return Err(Error::Conflict(json!({
                "error": format!("VM {} already exists", vm.vm_id),
            })));
        }
        store::insert_vm(&self.ctx.conn, &vm)?;
        Ok(EntityResponse::ok(json!({ "vm": vm })))
    }

    fn list_vms(&self, req: &EntityRequest) -> Result<EntityResponse> {
        let vms = store::list_vms(&self.ctx.conn, req.query_param("status"))?;
        Ok(EntityResponse::ok(json!({ "vms": vms })))
    }

    fn get_vm(&self, vm_id: &str) -> Result<EntityResponse> {
        let vm = self.require_vm(vm_id)?;
        let assignments = store::active_assignments_for_vm(&self.ctx.conn, vm_id)?;
        Ok(EntityResponse::ok(json!({
            "vm": vm,
            "activeAssignments": assignments,
        })))
    }

    fn mark_ready(&mut self, vm_id: &str, req: ReadyRequest) -> Result<EntityResponse> {
        let mut vm = self.require_vm(vm_id)?;
        if !matches!(vm.status, VmStatus::Provisioning | VmStatus::Booting) {
            return Err(Error::Conflict(json!({
                "error": format!("VM is {}", vm.status.as_str()),
                "vm": vm,
            })));
        }
        vm.status = VmStatus::Ready;
        vm.health_status = HealthStatus::Healthy;
        vm.ready_at = Some(now_rfc3339());
        if req.public_ip.is_some() {
            vm.public_ip = req.public_ip;
        }
        if req.private_ip.is_some() {
            vm.private_ip = req.private_ip;
        }
        store::update_vm(&self.ctx.conn, &vm)?;
        Ok(EntityResponse::ok(json!({ "vm": vm })))
    }

    fn report_health(&mut self, vm_id: &str, req: HealthReportRequest) -> Result<EntityResponse> {
        let mut vm = self.require_vm(vm_id)?;
        let timestamp =
            store::insert_health_check(&self.ctx.conn, vm_id, req.health_status, req.detail.as_deref())?;
        vm.health_status = req.health_status;
        vm.last_health_check = Some(timestamp);
        store::update_vm(&self.ctx.conn, &vm)?;
        Ok(EntityResponse::ok(json!({ "vm": vm })))
    }

    fn terminate(&mut self, vm_id: &str, req: TerminateRequest) -> Result<EntityResponse> {
        let mut vm = self.require_vm(vm_id)?;
        if vm.status == VmStatus::Terminated {
            return Ok(EntityResponse::ok(json!({ "vm": vm })));
        }
        let active = store::active_assignments_for_vm(&self.ctx.conn, vm_id)?;
        if !active.is_empty() && !req.force {
            return Err(Error::Conflict(json!({
                "error": format!("VM has {} active agent(s)", active.len()),
                "activeAssignments": active,
            })));
        }
        for assignment in &active {
            store::close_assignment(
                &self.ctx.conn,
                &assignment.assignment_id,
                AssignmentStatus::Failed,
            )?;
        }
        vm.status = VmStatus::Terminated;
        vm.agent_count = store::active_assignment_count(&self.ctx.conn, vm_id)?;
        store::update_vm(&self.ctx.conn, &vm)?;
        Ok(EntityResponse::ok(json!({
            "vm": vm,
            "failedAssignments": active.len(),
        })))
    }

    fn spawn(&mut self, req: SpawnRequest) -> Result<EntityResponse> {
        if req.agent_id.trim().is_empty() {
            return Err(Error::validation("agentId is required"));
        }
        if let Some(existing) = store::active_assignment_for_agent(&self.ctx.conn, &req.agent_id)? {
            let vm = store::get_vm(&self.ctx.conn, &existing.vm_id)?;
            return Ok(EntityResponse::ok(json!({
                "assignment": existing,
                "vm": vm,
                "existing": true,
            })));
        }

        let preferred = match req.preferred_vm_id.as_deref() {
            Some(vm_id) => store::get_vm(&self.ctx.conn, vm_id)?.filter(|vm| {
                vm.status == VmStatus::Ready
                    && vm.health_status == HealthStatus::Healthy
                    && vm.agent_count < vm.max_agents
            }),
            None => None,
        };
        let target = match preferred {
            Some(vm) => Some(vm),
            None => store::best_fit_vm(&self.ctx.conn)?,
        };
        let Some(mut vm) = target else {
            let recommendation = self.recommendation()?;
            return Err(Error::Unavailable(json!({
                "error": "No VM capacity available",
                "recommendation": recommendation,
            })));
        };

        let assignment = Assignment {
            assignment_id: Uuid::new_v4().to_string(),
            agent_id: req.agent_id,
            vm_id: vm.vm_id.clone(),
            assigned_at: now_rfc3339(),
            status: AssignmentStatus::Active,
            completed_at: None,
            task: req.task,
        };
        store::insert_assignment(&self.ctx.conn, &assignment)?;
        vm.agent_count += 1;
        if vm.agent_count >= vm.max_agents {
            vm.status = VmStatus::Busy;
        }
        store::update_vm(&self.ctx.conn, &vm)?;
        Ok(EntityResponse::ok(json!({
            "assignment": assignment,
            "vm": vm,
        })))
    }

    fn release(&mut self, req: ReleaseRequest) -> Result<EntityResponse> {
        let assignment = store::active_assignment_for_agent(&self.ctx.conn, &req.agent_id)?
            .ok_or_else(|| {
                Error::not_found(format!("No active assignment for {}", req.agent_id))
            })?;
        store::close_assignment(
            &self.ctx.conn,
            &assignment.assignment_id,
            AssignmentStatus::Completed,
        )?;
        if let Some(mut vm) = store::get_vm(&self.ctx.conn, &assignment.vm_id)? {
            vm.agent_count = (vm.agent_count - 1).max(0);
            if vm.status == VmStatus::Busy {
                vm.status = VmStatus::Ready;
            }
            store::update_vm(&self.ctx.conn, &vm)?;
        }
        Ok(EntityResponse::ok(json!({
            "released": true,
            "assignment": assignment.assignment_id,
        })))
    }

    fn list_assignments(&self, req: &EntityRequest) -> Result<EntityResponse> {
        let assignments = store::list_assignments(
            &self.ctx.conn,
            req.query_param("agentId"),
            req.query_param("status"),
        )?;
        Ok(EntityResponse::ok(json!({ "assignments": assignments })))
    }

    fn scale(&self) -> Result<EntityResponse> {
        let recommendation = self.recommendation()?;
        Ok(EntityResponse::ok(json!({ "recommendation": recommendation })))
    }

    fn status(&self) -> Result<EntityResponse> {
        let vms = store::list_vms(&self.ctx.conn, None)?;
        let (config, pending_scale_up) = store::load_pool_state(&self.ctx.conn)?;
        let by_status = |status: VmStatus| vms.iter().filter(|vm| vm.status == status).count();
        let free = store::free_ready_slots(&self.ctx.conn)?;
        Ok(EntityResponse::ok(json!({
            "totalVMs": vms.len(),
            "ready": by_status(VmStatus::Ready),
            "busy": by_status(VmStatus::Busy),
            "provisioning": by_status(VmStatus::Provisioning) + by_status(VmStatus::Booting),
            "terminated": by_status(VmStatus::Terminated),
            "error": by_status(VmStatus::Error),
            "freeSlots": free,
            "pendingScaleUp": pending_scale_up,
            "config": config,
        })))
    }

    fn get_config(&self) -> Result<EntityResponse> {
        let (config, _) = store::load_pool_state(&self.ctx.conn)?;
        Ok(EntityResponse::ok(json!({ "config": config })))
    }

    fn patch_config(&mut self, patch: PoolConfigPatch) -> Result<EntityResponse> {
        let (mut config, pending) = store::load_pool_state(&self.ctx.conn)?;
        if let Some(value) = patch.health_check_interval_ms {
            config.health_check_interval_ms = value.max(1_000);
        }
        if let Some(value) = patch.vm_boot_timeout_ms {
            config.vm_boot_timeout_ms = value.max(1_000);
        }
        if let Some(value) = patch.max_vms {
            config.max_vms = value.max(0);
        }
        if let Some(value) = patch.target_free_capacity {
            config.target_free_capacity = value.max(0);
        }
        store::save_pool_state(&self.ctx.conn, &config, pending)?;
        Ok(EntityResponse::ok(json!({ "config": config })))
    }

    /// Advisory scaling decision; inventory is never mutated here.
    fn recommendation(&self) -> Result<ScaleRecommendation> {
        let (config, _) = store::load_pool_state(&self.ctx.conn)?;
        let free = store::free_ready_slots(&self.ctx.conn)?;
        let active = store::active_vm_count(&self.ctx.conn)?;

        if free < config.target_free_capacity {
            if active >= config.max_vms {
                return Ok(ScaleRecommendation {
                    action: ScaleAction::Blocked,
                    reason: format!(
                        "{} free slot(s) below target {} but already at max {} VM(s)",
                        free, config.target_free_capacity, config.max_vms
                    ),
                    vm_ids: None,
                });
            }
            return Ok(ScaleRecommendation {
                action: ScaleAction::Provision,
                reason: format!(
                    "{} free slot(s) below target {}",
                    free, config.target_free_capacity
                ),
                vm_ids: None,
            });
        }

        // Idle VMs beyond the free-capacity target can be retired.
        let idle: Vec<String> = store::list_vms(&self.ctx.conn, Some("ready"))?
            .into_iter()
            .filter(|vm| vm.agent_count == 0)
            .map(|vm| vm.vm_id)
            .collect();
        if !idle.is_empty()
            && free - idle.len() as i64 * VmSize::Small.capacity() >= config.target_free_capacity
        {
            return Ok(ScaleRecommendation {
                action: ScaleAction::Terminate,
                reason: format!("{} idle VM(s) with {} free slot(s)", idle.len(), free),
                vm_ids: Some(idle),
            });
        }

        Ok(ScaleRecommendation {
            action: ScaleAction::None,
            reason: format!("{} free slot(s) meets target", free),
            vm_ids: None,
        })
    }

    fn require_vm(&self, vm_id: &str) -> Result<Vm> {
        store::get_vm(&self.ctx.conn, vm_id)?
            .ok_or_else(|| Error::not_found(format!("VM {}", vm_id)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::storage::open_in_memory;

    fn pool() -> VmPool {
        let ctx = EntityContext::new("main", open_in_memory().unwrap());
        VmPool::create(ctx).unwrap()
    }

    fn post(path: &str, body: serde_json::Value) -> EntityRequest {
        EntityRequest::new(Method::Post, path).with_body(body)
    }

    fn get(path: &str) -> EntityRequest {
        EntityRequest::new(Method::Get, path)
    }

    async fn provision_ready_small(pool: &mut VmPool, vm_id: &str) {
        pool.handle(post(
            "/vms",
            json!({ "vmId": vm_id, "instanceId": format!("i-{}", vm_id), "vmSize": "small" }),
        ))
        .await
        .unwrap();
        pool.handle(post(&format!("/vms/{}/ready", vm_id), json!({})))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn spawn_fills_vm_then_overflows_with_recommendation() {
        let mut pool = pool();
        provision_ready_small(&mut pool, "vm-1").await;

        let first = pool
            .handle(post("/spawn", json!({ "agentId": "a1" })))
            .await
            .unwrap();
        assert_eq!(first.body["vm"]["agentCount"], 1);
        assert_eq!(first.body["vm"]["status"], "ready");

        let second = pool
            .handle(post("/spawn", json!({ "agentId": "a2" })))
            .await
            .unwrap();
        assert_eq!(second.body["vm"]["agentCount"], 2);
        assert_eq!(second.body["vm"]["status"], "busy");

        let third = pool
            .handle(post("/spawn", json!({ "agentId": "a3" })))
            .await
            .unwrap_err();
        assert_eq!(third.status(), 503);
        let body = third.body();
        assert!(body["recommendation"]["action"].is_string());
        assert!(!body["recommendation"]["reason"].as_str().unwrap().is_empty());
    }

    #[tokio::test]
    async fn spawn_is_idempotent_per_agent() {
        let mut pool = pool();
        provision_ready_small(&mut pool, "vm-1").await;

        let first = pool
            .handle(post("/spawn", json!({ "agentId": "a1" })))
            .await
            .unwrap();
        let again = pool
            .handle(post("/spawn", json!({ "agentId": "a1" })))
            .await
            .unwrap();
        assert_eq!(again.body["existing"], true);
        assert_eq!(
            again.body["assignment"]["assignmentId"],
            first.body["assignment"]["assignmentId"]
        );
        assert_eq!(again.body["vm"]["agentCount"], 1);
    }

    #[tokio::test]
    async fn release_reopens_busy_vm() {
        let mut pool = pool();
        provision_ready_small(&mut pool, "vm-1").await;
        pool.handle(post("/spawn", json!({ "agentId": "a1" })))
            .await
            .unwrap();
        pool.handle(post("/spawn", json!({ "agentId": "a2" })))
            .await
            .unwrap();

        pool.handle(post("/release", json!({ "agentId": "a1" })))
            .await
            .unwrap();
        let vm = pool.handle(get("/vms/vm-1")).await.unwrap();
        assert_eq!(vm.body["vm"]["status"], "ready");
        assert_eq!(vm.body["vm"]["agentCount"], 1);
    }

    #[tokio::test]
    async fn terminate_requires_force_with_active_agents() {
        let mut pool = pool();
        provision_ready_small(&mut pool, "vm-1").await;
        pool.handle(post("/spawn", json!({ "agentId": "a1" })))
            .await
            .unwrap();

        let denied = pool
            .handle(post("/vms/vm-1/terminate", json!({})))
            .await
            .unwrap_err();
        assert_eq!(denied.status(), 409);

        let forced = pool
            .handle(post("/vms/vm-1/terminate", json!({ "force": true })))
            .await
            .unwrap();
        assert_eq!(forced.body["vm"]["status"], "terminated");
        // Capacity invariant: agentCount equals the active assignment count.
        assert_eq!(forced.body["vm"]["agentCount"], 0);

        let assignments = pool
            .handle(get("/assignments").with_query("agentId", "a1"))
            .await
            .unwrap();
        assert_eq!(assignments.body["assignments"][0]["status"], "failed");
    }

    #[tokio::test]
    async fn best_fit_prefers_least_loaded() {
        let mut pool = pool();
        provision_ready_small(&mut pool, "vm-1").await;
        provision_ready_small(&mut pool, "vm-2").await;
        pool.handle(post("/spawn", json!({ "agentId": "a1" })))
            .await
            .unwrap();

        let spread = pool
            .handle(post("/spawn", json!({ "agentId": "a2" })))
            .await
            .unwrap();
        let second_vm = spread.body["vm"]["vmId"].as_str().unwrap();
        let first = pool
            .handle(get("/assignments").with_query("agentId", "a1"))
            .await
            .unwrap();
        assert_ne!(second_vm, first.body["assignments"][0]["vmId"].as_str().unwrap());
    }

    #[tokio::test]
    async fn preferred_vm_wins_when_eligible() {
        let mut pool = pool();
        provision_ready_small(&mut pool, "vm-1").await;
        provision_ready_small(&mut pool, "vm-2").await;

        let spawned = pool
            .handle(post(
                "/spawn",
                json!({ "agentId": "a1", "preferredVmId": "vm-2" }),
            ))
            .await
            .unwrap();
        assert_eq!(spawned.body["vm"]["vmId"], "vm-2");
    }

    #[tokio::test]
    async fn ready_transition_guards() {
        let mut pool = pool();
        provision_ready_small(&mut pool, "vm-1").await;
        let again = pool
            .handle(post("/vms/vm-1/ready", json!({})))
            .await
            .unwrap_err();
        assert_eq!(again.status(), 409);
    }

    #[tokio::test]
    async fn alarm_marks_boot_timeout_as_error() {
        let mut pool = pool();
        pool.handle(post("/vms", json!({ "vmId": "vm-1", "instanceId": "i-1" })))
            .await
            .unwrap();
        // Age the VM past the boot timeout.
        pool.ctx
            .conn
            .execute(
                "UPDATE vms SET created_at = ?1",
                rusqlite::params![(Utc::now() - Duration::minutes(11)).to_rfc3339()],
            )
            .unwrap();
        pool.on_alarm().await.unwrap();

        let vm = pool.handle(get("/vms/vm-1")).await.unwrap();
        assert_eq!(vm.body["vm"]["status"], "error");
    }

    #[tokio::test]
    async fn alarm_marks_silent_vms_unresponsive() {
        let mut pool = pool();
        provision_ready_small(&mut pool, "vm-1").await;
        pool.ctx
            .conn
            .execute(
                "UPDATE vms SET ready_at = ?1",
                rusqlite::params![(Utc::now() - Duration::minutes(10)).to_rfc3339()],
            )
            .unwrap();
        pool.on_alarm().await.unwrap();

        let vm = pool.handle(get("/vms/vm-1")).await.unwrap();
        assert_eq!(vm.body["vm"]["healthStatus"], "unresponsive");
    }

    #[tokio::test]
    async fn scale_recommends_provision_when_under_target() {
        let pool = pool();
        let recommendation = pool.recommendation().unwrap();
        assert_eq!(recommendation.action, ScaleAction::Provision);
    }

    #[tokio::test]
    async fn scale_blocked_at_max_vms() {
        let mut pool = pool();
        pool.handle(post("/config", json!({ "maxVms": 0 })))
            .await
            .unwrap();
        let recommendation = pool.recommendation().unwrap();
        assert_eq!(recommendation.action, ScaleAction::Blocked);
    }
}

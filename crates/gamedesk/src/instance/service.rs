//! Instance lifecycle: allocation, container launch, registry and teardown.

use std::sync::Arc;

use anyhow::anyhow;
use log::{debug, error, info, warn};
use tokio::task::JoinError;
use uuid::Uuid;

use crate::allocator::{Allocators, BundleGuard};
use crate::container::ContainerRuntimeApi;

use super::error::{InstanceError, InstanceResult};
use super::launch::{LaunchSettings, build_container_config};
use super::models::{
    DeleteReport, Instance, InstanceConfig, InstanceConfigOverrides, InstanceStatus, RestoreReport,
    now_timestamp,
};
use super::repository::InstanceRepository;

/// Instance service configuration.
#[derive(Debug, Clone, Default)]
pub struct InstanceServiceConfig {
    pub launch: LaunchSettings,
    /// Grace period passed to `stop` before the runtime kills the container.
    pub stop_timeout_seconds: Option<u32>,
}

/// Ties pool grants, the container runtime and the registry together.
///
/// Cheap to clone; clones share the pools.
#[derive(Clone)]
pub struct InstanceService {
    repo: InstanceRepository,
    runtime: Arc<dyn ContainerRuntimeApi>,
    allocators: Arc<Allocators>,
    config: InstanceServiceConfig,
}

impl InstanceService {
    pub fn new(
        repo: InstanceRepository,
        runtime: Arc<dyn ContainerRuntimeApi>,
        allocators: Arc<Allocators>,
        config: InstanceServiceConfig,
    ) -> Self {
        Self {
            repo,
            runtime,
            allocators,
            config,
        }
    }

    /// The pools this service allocates from.
    pub fn allocators(&self) -> &Arc<Allocators> {
        &self.allocators
    }

    /// Allocate resources, launch the container and record the instance.
    ///
    /// On any failure nothing stays allocated and nothing is recorded.
    pub async fn create_instance(
        &self,
        user_id: &str,
        overrides: InstanceConfigOverrides,
    ) -> InstanceResult<Instance> {
        if user_id.trim().is_empty() {
            return Err(InstanceError::InvalidConfig(
                "user_id cannot be empty".to_string(),
            ));
        }
        let config = overrides.resolve().map_err(InstanceError::InvalidConfig)?;

        // Once grants are taken the launch must reach commit or full unwind,
        // so it runs detached from the caller.
        let service = self.clone();
        let user_id = user_id.to_string();
        tokio::spawn(async move { service.launch_instance(&user_id, config).await })
            .await
            .map_err(|e| task_failed("create", e))?
    }

    async fn launch_instance(
        &self,
        user_id: &str,
        config: InstanceConfig,
    ) -> InstanceResult<Instance> {
        let guard = BundleGuard::allocate(&self.allocators).inspect_err(|e| {
            warn!("Cannot create instance for user {}: {}", user_id, e);
        })?;
        let bundle = guard.bundle();
        let id = Uuid::new_v4().to_string();

        debug!(
            "Launching instance {} (novnc={}, sunshine={}, display={})",
            id, bundle.novnc_port, bundle.sunshine_port, bundle.display
        );

        let container_config = build_container_config(&id, &bundle, &config, &self.config.launch)
            .map_err(|e| InstanceError::LaunchFailed(e.to_string()))?;
        let container_id = match self.runtime.create_container(&container_config).await {
            Ok(container_id) => container_id,
            Err(e) => {
                warn!("Failed to launch container for instance {}: {}", id, e);
                return Err(InstanceError::LaunchFailed(e.to_string()));
            }
        };

        let now = now_timestamp();
        let instance = Instance {
            id: id.clone(),
            user_id: user_id.to_string(),
            container_id: Some(container_id.clone()),
            novnc_port: i64::from(bundle.novnc_port),
            sunshine_port: i64::from(bundle.sunshine_port),
            display_number: i64::from(bundle.display),
            status: InstanceStatus::Starting,
            created_at: now.clone(),
            last_accessed: now,
            config,
        };

        if let Err(e) = self.repo.create(&instance).await {
            error!("Failed to record instance {}: {:#}", id, e);
            // Nothing refers to the container once the record is lost.
            for warning in self.teardown_container(&container_id).await {
                warn!("Cleanup of unrecorded instance {}: {}", id, warning);
            }
            return Err(InstanceError::Store(e));
        }

        guard.commit();
        info!(
            "Created instance {} for user {} (container {})",
            id, user_id, container_id
        );
        Ok(instance)
    }

    /// Fetch an instance.
    pub async fn get_instance(&self, id: &str) -> InstanceResult<Instance> {
        self.repo
            .get(id)
            .await?
            .filter(Instance::is_live)
            .ok_or_else(|| InstanceError::NotFound(id.to_string()))
    }

    /// Fetch an instance for display and record the access.
    pub async fn view_instance(&self, id: &str) -> InstanceResult<Instance> {
        let mut instance = self.get_instance(id).await?;

        let now = now_timestamp();
        if !self.repo.touch_last_accessed(id, &now).await? {
            return Err(InstanceError::NotFound(id.to_string()));
        }
        instance.last_accessed = now;
        Ok(instance)
    }

    /// List instances, newest first.
    pub async fn list_instances(&self, user_id: Option<&str>) -> InstanceResult<Vec<Instance>> {
        let instances = self.repo.list(user_id).await?;
        Ok(instances.into_iter().filter(Instance::is_live).collect())
    }

    /// Tear down an instance and return its resources.
    ///
    /// Container errors are reported as warnings; the grants are released and
    /// the record removed regardless.
    pub async fn delete_instance(&self, id: &str) -> InstanceResult<DeleteReport> {
        let instance = self
            .repo
            .get(id)
            .await?
            .ok_or_else(|| InstanceError::NotFound(id.to_string()))?;

        // Only the claiming caller may release; the ids could otherwise be
        // handed back twice after a newer instance reused them.
        if !self.repo.claim_for_deletion(id).await? {
            debug!("Instance {} is already being deleted", id);
            return Err(InstanceError::NotFound(id.to_string()));
        }

        // After the claim no other caller can finish this delete.
        let service = self.clone();
        tokio::spawn(async move { service.finish_delete(instance).await })
            .await
            .map_err(|e| task_failed("delete", e))?
    }

    async fn finish_delete(&self, instance: Instance) -> InstanceResult<DeleteReport> {
        let id = instance.id.as_str();
        let warnings = match instance.container_id.as_deref() {
            Some(container_id) => self.teardown_container(container_id).await,
            None => Vec::new(),
        };
        for warning in &warnings {
            warn!("Deleting instance {}: {}", id, warning);
        }

        self.release_grants(&instance);

        if !self.repo.delete(id).await? {
            debug!("Instance {} record was already removed", id);
        }

        info!("Deleted instance {}", id);
        Ok(DeleteReport {
            instance_id: id.to_string(),
            warnings,
        })
    }

    /// Mark a starting instance as running.
    pub async fn mark_running(&self, id: &str) -> InstanceResult<Instance> {
        self.transition(id, InstanceStatus::Running).await
    }

    /// Mark a starting instance as failed.
    pub async fn mark_failed(&self, id: &str) -> InstanceResult<Instance> {
        self.transition(id, InstanceStatus::Failed).await
    }

    async fn transition(&self, id: &str, to: InstanceStatus) -> InstanceResult<Instance> {
        let mut instance = self.get_instance(id).await?;
        let from = instance.status;

        let allowed = from.can_transition_to(to)
            && (to != InstanceStatus::Running || instance.container_id.is_some());
        if !allowed {
            return Err(InstanceError::InvalidTransition { from, to });
        }

        if !self.repo.update_status(id, from, to).await? {
            // Lost a race with another transition or a delete.
            let current = self.get_instance(id).await?;
            return Err(InstanceError::InvalidTransition {
                from: current.status,
                to,
            });
        }

        info!("Instance {} is now {}", id, to);
        instance.status = to;
        Ok(instance)
    }

    /// Rebuild pool state from the registry. Call once at startup, before
    /// serving requests.
    ///
    /// Interrupted deletes are finished first. Live records whose grants no
    /// longer fit the pools are kept and counted as conflicts.
    pub async fn restore_allocations(&self) -> InstanceResult<RestoreReport> {
        let mut report = RestoreReport::default();

        for instance in self.repo.list_deleted().await? {
            if let Some(container_id) = instance.container_id.as_deref() {
                for warning in self.teardown_container(container_id).await {
                    warn!("Finishing delete of instance {}: {}", instance.id, warning);
                }
            }
            self.repo.delete(&instance.id).await?;
            report.purged += 1;
        }

        for instance in self.repo.list_live().await? {
            let reserved = instance
                .allocation()
                .is_some_and(|bundle| self.allocators.reserve_bundle(&bundle));

            if reserved {
                report.restored += 1;
            } else {
                warn!(
                    "Instance {} holds ports {}/{} and display {} which cannot be reserved",
                    instance.id, instance.novnc_port, instance.sunshine_port, instance.display_number
                );
                report.conflicts += 1;
            }
        }

        info!(
            "Restored {} instance allocation(s), purged {}, {} conflict(s)",
            report.restored, report.purged, report.conflicts
        );
        for pool in [self.allocators.ports(), self.allocators.displays()] {
            let range = pool.range();
            info!(
                "{} pool {}..{}: {} of {} in use",
                pool.name(),
                range.start,
                range.end,
                pool.allocated_count(),
                pool.capacity()
            );
        }
        Ok(report)
    }

    /// Stop then force-remove a container. Returns non-fatal problems.
    async fn teardown_container(&self, container_id: &str) -> Vec<String> {
        let mut warnings = Vec::new();

        match self
            .runtime
            .stop_container(container_id, self.config.stop_timeout_seconds)
            .await
        {
            Ok(()) => {}
            Err(e) if e.is_not_found() => {
                debug!("Container {} already gone", container_id);
                return warnings;
            }
            Err(e) => warnings.push(format!("stop {}: {}", container_id, e)),
        }

        match self.runtime.remove_container(container_id, true).await {
            Ok(()) => {}
            Err(e) if e.is_not_found() => debug!("Container {} already removed", container_id),
            Err(e) => warnings.push(format!("remove {}: {}", container_id, e)),
        }

        warnings
    }

    fn release_grants(&self, instance: &Instance) {
        match instance.allocation() {
            Some(bundle) => BundleGuard::adopt(&self.allocators, bundle).release(),
            None => warn!(
                "Instance {} has grants outside the id space; nothing released",
                instance.id
            ),
        }
    }
}

fn task_failed(operation: &str, err: JoinError) -> InstanceError {
    InstanceError::Store(anyhow!("instance {} task failed: {}", operation, err))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::allocator::AllocatorConfig;
    use crate::container::{ContainerConfig, ContainerError, ContainerResult};
    use crate::db::Database;
    use serde_json::json;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::time::Duration;
    use tokio::sync::Notify;

    #[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
    enum Outcome {
        #[default]
        Ok,
        NotFound,
        Fail,
    }

    impl Outcome {
        fn result(self, command: &str, container_id: &str) -> ContainerResult<()> {
            match self {
                Outcome::Ok => Ok(()),
                Outcome::NotFound => Err(ContainerError::ContainerNotFound(
                    container_id.to_string(),
                )),
                Outcome::Fail => Err(ContainerError::CommandFailed {
                    command: command.to_string(),
                    message: "daemon unavailable".to_string(),
                }),
            }
        }
    }

    #[derive(Default)]
    struct FakeRuntime {
        next_id: AtomicUsize,
        created: Mutex<Vec<ContainerConfig>>,
        stopped: Mutex<Vec<String>>,
        removed: Mutex<Vec<String>>,
        create_outcome: Mutex<Outcome>,
        stop_outcome: Mutex<Outcome>,
        remove_outcome: Mutex<Outcome>,
        // When set, the call blocks until the matching gate is notified.
        hold_create: AtomicBool,
        create_gate: Notify,
        hold_stop: AtomicBool,
        stop_gate: Notify,
    }

    #[async_trait::async_trait]
    impl ContainerRuntimeApi for FakeRuntime {
        async fn create_container(&self, config: &ContainerConfig) -> ContainerResult<String> {
            let outcome = *self.create_outcome.lock().unwrap();
            outcome.result("run", "")?;
            self.created.lock().unwrap().push(config.clone());
            let n = self.next_id.fetch_add(1, Ordering::SeqCst);
            if self.hold_create.load(Ordering::SeqCst) {
                self.create_gate.notified().await;
            }
            Ok(format!("fake{:04}", n))
        }

        async fn stop_container(
            &self,
            container_id: &str,
            _timeout_seconds: Option<u32>,
        ) -> ContainerResult<()> {
            self.stopped.lock().unwrap().push(container_id.to_string());
            if self.hold_stop.load(Ordering::SeqCst) {
                self.stop_gate.notified().await;
            }
            let outcome = *self.stop_outcome.lock().unwrap();
            outcome.result("stop", container_id)
        }

        async fn remove_container(&self, container_id: &str, _force: bool) -> ContainerResult<()> {
            self.removed.lock().unwrap().push(container_id.to_string());
            let outcome = *self.remove_outcome.lock().unwrap();
            outcome.result("rm", container_id)
        }
    }

    struct Harness {
        db: Database,
        repo: InstanceRepository,
        runtime: Arc<FakeRuntime>,
        service: InstanceService,
    }

    impl Harness {
        fn service_with(&self, allocators: Arc<Allocators>) -> InstanceService {
            InstanceService::new(
                self.repo.clone(),
                self.runtime.clone(),
                allocators,
                InstanceServiceConfig::default(),
            )
        }

        fn allocators(&self) -> &Arc<Allocators> {
            self.service.allocators()
        }
    }

    async fn harness(max_instances: u32) -> Harness {
        let db = Database::in_memory().await.unwrap();
        let repo = InstanceRepository::new(db.pool().clone());
        let runtime = Arc::new(FakeRuntime::default());
        let allocators = Arc::new(Allocators::new(&AllocatorConfig {
            max_instances,
            ..Default::default()
        }));
        let service = InstanceService::new(
            repo.clone(),
            runtime.clone(),
            allocators,
            InstanceServiceConfig::default(),
        );
        Harness {
            db,
            repo,
            runtime,
            service,
        }
    }

    fn no_overrides() -> InstanceConfigOverrides {
        InstanceConfigOverrides::default()
    }

    async fn wait_for_live(repo: &InstanceRepository, count: usize) -> Vec<Instance> {
        for _ in 0..200 {
            let live = repo.list_live().await.unwrap();
            if live.len() == count {
                return live;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("expected {} live instance(s)", count);
    }

    async fn wait_for_removal(repo: &InstanceRepository, id: &str) {
        for _ in 0..200 {
            if repo.get(id).await.unwrap().is_none() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("instance {} was never removed", id);
    }

    #[tokio::test]
    async fn create_assigns_first_fit_bundles() {
        let h = harness(50).await;

        let first = h.service.create_instance("alice", no_overrides()).await.unwrap();
        assert_eq!(
            (first.novnc_port, first.sunshine_port, first.display_number),
            (12000, 12001, 55)
        );
        assert_eq!(first.status, InstanceStatus::Starting);
        assert_eq!(first.container_id.as_deref(), Some("fake0000"));
        assert_eq!(first.created_at, first.last_accessed);

        let second = h.service.create_instance("alice", no_overrides()).await.unwrap();
        assert_eq!(
            (second.novnc_port, second.sunshine_port, second.display_number),
            (12004, 12005, 56)
        );

        h.service.delete_instance(&first.id).await.unwrap();
        let third = h.service.create_instance("bob", no_overrides()).await.unwrap();
        assert_eq!(
            (third.novnc_port, third.sunshine_port, third.display_number),
            (12000, 12001, 55)
        );

        let stored = h.repo.get(&third.id).await.unwrap().unwrap();
        assert_eq!(stored, third);
    }

    #[tokio::test]
    async fn create_passes_config_to_container() {
        let h = harness(50).await;
        let overrides =
            InstanceConfigOverrides::from_json(json!({"memory_limit": "8G", "cpu_limit": 4}))
                .unwrap();

        let instance = h.service.create_instance("alice", overrides).await.unwrap();
        assert_eq!(instance.config.memory_limit, "8G");
        assert_eq!(instance.config.cpu_limit, "4");

        let created = h.runtime.created.lock().unwrap();
        assert_eq!(created.len(), 1);
        assert_eq!(created[0].memory.as_deref(), Some("8G"));
        assert_eq!(created[0].cpus.as_deref(), Some("4"));
        assert_eq!(created[0].name, Some(format!("gaming_{}", instance.id)));
        assert_eq!(
            created[0].env.get("DISPLAY").map(String::as_str),
            Some(":55")
        );
    }

    #[tokio::test]
    async fn invalid_input_allocates_nothing() {
        let h = harness(50).await;

        let err = h
            .service
            .create_instance("", no_overrides())
            .await
            .unwrap_err();
        assert!(matches!(err, InstanceError::InvalidConfig(_)));

        let overrides = InstanceConfigOverrides {
            cpu_limit: Some("zero".to_string()),
            ..Default::default()
        };
        let err = h
            .service
            .create_instance("alice", overrides)
            .await
            .unwrap_err();
        assert!(matches!(err, InstanceError::InvalidConfig(_)));

        assert_eq!(h.allocators().ports().allocated_count(), 0);
        assert!(h.runtime.created.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn launch_failure_releases_everything() {
        let h = harness(50).await;
        *h.runtime.create_outcome.lock().unwrap() = Outcome::Fail;

        let err = h
            .service
            .create_instance("alice", no_overrides())
            .await
            .unwrap_err();
        assert!(matches!(err, InstanceError::LaunchFailed(ref msg) if msg.contains("daemon")));

        assert_eq!(h.allocators().ports().allocated_count(), 0);
        assert_eq!(h.allocators().displays().allocated_count(), 0);
        assert!(h.service.list_instances(None).await.unwrap().is_empty());

        *h.runtime.create_outcome.lock().unwrap() = Outcome::Ok;
        let instance = h.service.create_instance("alice", no_overrides()).await.unwrap();
        assert_eq!(instance.novnc_port, 12000);
    }

    #[tokio::test]
    async fn exhaustion_is_reported_without_launch() {
        let h = harness(1).await;
        h.service.create_instance("alice", no_overrides()).await.unwrap();

        let err = h
            .service
            .create_instance("bob", no_overrides())
            .await
            .unwrap_err();
        assert!(matches!(err, InstanceError::ResourceExhausted(_)));
        assert_eq!(h.runtime.created.lock().unwrap().len(), 1);
        assert_eq!(h.allocators().ports().allocated_count(), 4);
        assert_eq!(h.allocators().displays().allocated_count(), 1);
    }

    #[tokio::test]
    async fn racing_creates_for_last_slot() {
        let h = harness(1).await;

        let (a, b) = tokio::join!(
            h.service.create_instance("alice", no_overrides()),
            h.service.create_instance("bob", no_overrides()),
        );

        let results = [a, b];
        let successes = results.iter().filter(|r| r.is_ok()).count();
        let exhausted = results
            .iter()
            .filter(|r| matches!(r, Err(InstanceError::ResourceExhausted(_))))
            .count();
        assert_eq!((successes, exhausted), (1, 1));
        assert_eq!(h.allocators().ports().allocated_count(), 4);
        assert_eq!(h.service.list_instances(None).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn persist_failure_tears_down_container_and_grants() {
        let h = harness(50).await;
        h.db.close().await;

        let err = h
            .service
            .create_instance("alice", no_overrides())
            .await
            .unwrap_err();
        assert!(matches!(err, InstanceError::Store(_)));

        assert_eq!(h.runtime.created.lock().unwrap().len(), 1);
        assert_eq!(*h.runtime.stopped.lock().unwrap(), vec!["fake0000"]);
        assert_eq!(*h.runtime.removed.lock().unwrap(), vec!["fake0000"]);
        assert_eq!(h.allocators().ports().allocated_count(), 0);
        assert_eq!(h.allocators().displays().allocated_count(), 0);
    }

    #[tokio::test]
    async fn dropped_create_still_records_its_container() {
        let h = harness(50).await;
        h.runtime.hold_create.store(true, Ordering::SeqCst);

        let dropped = tokio::time::timeout(
            Duration::from_millis(50),
            h.service.create_instance("alice", no_overrides()),
        )
        .await;
        assert!(dropped.is_err());

        // The container is up, so its ports stay held.
        assert_eq!(h.runtime.created.lock().unwrap().len(), 1);
        assert_eq!(h.allocators().ports().allocated_count(), 4);
        assert_eq!(h.allocators().displays().allocated_count(), 1);

        h.runtime.create_gate.notify_one();
        let live = wait_for_live(&h.repo, 1).await;
        assert_eq!(live[0].novnc_port, 12000);
        assert_eq!(live[0].container_id.as_deref(), Some("fake0000"));
        assert!(h.runtime.removed.lock().unwrap().is_empty());

        h.runtime.hold_create.store(false, Ordering::SeqCst);
        let next = h.service.create_instance("bob", no_overrides()).await.unwrap();
        assert_eq!(
            (next.novnc_port, next.sunshine_port, next.display_number),
            (12004, 12005, 56)
        );
        assert_eq!(h.allocators().ports().allocated_count(), 8);
    }

    #[tokio::test]
    async fn dropped_delete_still_releases_grants() {
        let h = harness(50).await;
        let instance = h.service.create_instance("alice", no_overrides()).await.unwrap();
        h.runtime.hold_stop.store(true, Ordering::SeqCst);

        let dropped = tokio::time::timeout(
            Duration::from_millis(50),
            h.service.delete_instance(&instance.id),
        )
        .await;
        assert!(dropped.is_err());
        assert_eq!(*h.runtime.stopped.lock().unwrap(), vec!["fake0000"]);

        h.runtime.stop_gate.notify_one();
        wait_for_removal(&h.repo, &instance.id).await;

        assert_eq!(*h.runtime.removed.lock().unwrap(), vec!["fake0000"]);
        assert_eq!(h.allocators().ports().allocated_count(), 0);
        assert_eq!(h.allocators().displays().allocated_count(), 0);

        let retry = h.service.delete_instance(&instance.id).await;
        assert!(matches!(retry, Err(InstanceError::NotFound(_))));

        h.runtime.hold_stop.store(false, Ordering::SeqCst);
        let next = h.service.create_instance("bob", no_overrides()).await.unwrap();
        assert_eq!(next.novnc_port, 12000);
        assert_eq!(next.display_number, 55);
    }

    #[tokio::test]
    async fn get_and_view() {
        let h = harness(50).await;
        let created = h.service.create_instance("alice", no_overrides()).await.unwrap();

        let fetched = h.service.get_instance(&created.id).await.unwrap();
        assert_eq!(fetched, created);

        let viewed = h.service.view_instance(&created.id).await.unwrap();
        assert!(viewed.last_accessed >= created.last_accessed);
        let stored = h.repo.get(&created.id).await.unwrap().unwrap();
        assert_eq!(stored.last_accessed, viewed.last_accessed);
        assert_eq!(stored.created_at, created.created_at);

        for result in [
            h.service.get_instance("missing").await,
            h.service.view_instance("missing").await,
        ] {
            assert!(matches!(result, Err(InstanceError::NotFound(_))));
        }
    }

    #[tokio::test]
    async fn list_filters_by_user_newest_first() {
        let h = harness(50).await;
        let a = h.service.create_instance("alice", no_overrides()).await.unwrap();
        let b = h.service.create_instance("bob", no_overrides()).await.unwrap();
        let c = h.service.create_instance("alice", no_overrides()).await.unwrap();

        let all: Vec<String> = h
            .service
            .list_instances(None)
            .await
            .unwrap()
            .into_iter()
            .map(|i| i.id)
            .collect();
        assert_eq!(all, vec![c.id.clone(), b.id.clone(), a.id.clone()]);

        let alice: Vec<String> = h
            .service
            .list_instances(Some("alice"))
            .await
            .unwrap()
            .into_iter()
            .map(|i| i.id)
            .collect();
        assert_eq!(alice, vec![c.id, a.id]);
    }

    #[tokio::test]
    async fn delete_tears_down_and_releases() {
        let h = harness(50).await;
        let instance = h.service.create_instance("alice", no_overrides()).await.unwrap();

        let report = h.service.delete_instance(&instance.id).await.unwrap();
        assert_eq!(report.instance_id, instance.id);
        assert!(report.warnings.is_empty());

        assert_eq!(*h.runtime.stopped.lock().unwrap(), vec!["fake0000"]);
        assert_eq!(*h.runtime.removed.lock().unwrap(), vec!["fake0000"]);
        assert_eq!(h.allocators().ports().allocated_count(), 0);
        assert_eq!(h.allocators().displays().allocated_count(), 0);
        assert!(h.repo.get(&instance.id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn delete_of_unknown_id_has_no_side_effects() {
        let h = harness(50).await;
        h.service.create_instance("alice", no_overrides()).await.unwrap();

        let err = h.service.delete_instance("missing").await.unwrap_err();
        assert!(matches!(err, InstanceError::NotFound(_)));
        assert!(h.runtime.stopped.lock().unwrap().is_empty());
        assert_eq!(h.allocators().ports().allocated_count(), 4);
    }

    #[tokio::test]
    async fn vanished_container_is_not_a_warning() {
        let h = harness(50).await;
        let instance = h.service.create_instance("alice", no_overrides()).await.unwrap();
        *h.runtime.stop_outcome.lock().unwrap() = Outcome::NotFound;

        let report = h.service.delete_instance(&instance.id).await.unwrap();
        assert!(report.warnings.is_empty());
        assert!(h.runtime.removed.lock().unwrap().is_empty());
        assert_eq!(h.allocators().ports().allocated_count(), 0);
    }

    #[tokio::test]
    async fn runtime_errors_become_warnings() {
        let h = harness(50).await;
        let instance = h.service.create_instance("alice", no_overrides()).await.unwrap();
        *h.runtime.stop_outcome.lock().unwrap() = Outcome::Fail;
        *h.runtime.remove_outcome.lock().unwrap() = Outcome::Fail;

        let report = h.service.delete_instance(&instance.id).await.unwrap();
        assert_eq!(report.warnings.len(), 2);
        assert!(report.warnings[0].starts_with("stop fake0000"));
        assert!(report.warnings[1].starts_with("remove fake0000"));

        assert_eq!(h.allocators().ports().allocated_count(), 0);
        assert!(h.repo.get(&instance.id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn stale_delete_does_not_free_reused_grants() {
        let h = harness(50).await;
        let old = h.service.create_instance("alice", no_overrides()).await.unwrap();
        h.service.delete_instance(&old.id).await.unwrap();

        let new = h.service.create_instance("bob", no_overrides()).await.unwrap();
        assert_eq!(new.novnc_port, old.novnc_port);

        let err = h.service.delete_instance(&old.id).await.unwrap_err();
        assert!(matches!(err, InstanceError::NotFound(_)));
        assert!(h.allocators().ports().is_allocated(12000));
        assert!(h.allocators().displays().is_allocated(55));
    }

    #[tokio::test]
    async fn concurrent_deletes_release_once() {
        let h = harness(50).await;
        let instance = h.service.create_instance("alice", no_overrides()).await.unwrap();

        let (a, b) = tokio::join!(
            h.service.delete_instance(&instance.id),
            h.service.delete_instance(&instance.id),
        );
        let results = [a, b];
        assert_eq!(results.iter().filter(|r| r.is_ok()).count(), 1);
        assert_eq!(
            results
                .iter()
                .filter(|r| matches!(r, Err(InstanceError::NotFound(_))))
                .count(),
            1
        );
        assert_eq!(h.runtime.stopped.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn status_transitions() {
        let h = harness(50).await;
        let a = h.service.create_instance("alice", no_overrides()).await.unwrap();
        let b = h.service.create_instance("alice", no_overrides()).await.unwrap();

        let running = h.service.mark_running(&a.id).await.unwrap();
        assert_eq!(running.status, InstanceStatus::Running);
        assert_eq!(
            h.service.get_instance(&a.id).await.unwrap().status,
            InstanceStatus::Running
        );

        let err = h.service.mark_failed(&a.id).await.unwrap_err();
        assert!(matches!(
            err,
            InstanceError::InvalidTransition {
                from: InstanceStatus::Running,
                to: InstanceStatus::Failed
            }
        ));

        assert_eq!(
            h.service.mark_failed(&b.id).await.unwrap().status,
            InstanceStatus::Failed
        );
        assert!(h.service.mark_running(&b.id).await.is_err());
        assert!(matches!(
            h.service.mark_running("missing").await,
            Err(InstanceError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn running_requires_a_container() {
        let h = harness(50).await;
        let instance = h.service.create_instance("alice", no_overrides()).await.unwrap();
        let mut orphan = instance.clone();
        orphan.id = "no-container".to_string();
        orphan.container_id = None;
        h.repo.create(&orphan).await.unwrap();

        let err = h.service.mark_running(&orphan.id).await.unwrap_err();
        assert!(matches!(err, InstanceError::InvalidTransition { .. }));
    }

    #[tokio::test]
    async fn restore_replays_live_records_and_purges_claimed_ones() {
        let h = harness(50).await;
        let kept = h.service.create_instance("alice", no_overrides()).await.unwrap();
        let interrupted = h.service.create_instance("bob", no_overrides()).await.unwrap();
        assert!(h.repo.claim_for_deletion(&interrupted.id).await.unwrap());

        // Fresh pools, as after a restart.
        let restarted = h.service_with(Arc::new(Allocators::new(&AllocatorConfig::default())));
        let report = restarted.restore_allocations().await.unwrap();
        assert_eq!(
            report,
            RestoreReport {
                restored: 1,
                purged: 1,
                conflicts: 0
            }
        );

        assert!(h.repo.get(&interrupted.id).await.unwrap().is_none());
        assert!(
            h.runtime
                .removed
                .lock()
                .unwrap()
                .contains(&interrupted.container_id.clone().unwrap())
        );

        let pools = restarted.allocators();
        assert!(pools.ports().is_allocated(kept.novnc_port as u32));
        assert!(pools.displays().is_allocated(kept.display_number as u32));
        assert_eq!(pools.ports().allocated_count(), 4);

        // The freed slot of the interrupted delete is reused, the kept one is not.
        let next = restarted.create_instance("carol", no_overrides()).await.unwrap();
        assert_eq!(next.novnc_port, interrupted.novnc_port);
        assert_ne!(next.novnc_port, kept.novnc_port);
    }

    #[tokio::test]
    async fn restore_counts_conflicting_records() {
        let h = harness(50).await;
        let first = h.service.create_instance("alice", no_overrides()).await.unwrap();

        let mut clash = first.clone();
        clash.id = "clash".to_string();
        h.repo.create(&clash).await.unwrap();

        let mut out_of_range = first.clone();
        out_of_range.id = "far".to_string();
        out_of_range.novnc_port = 40000;
        out_of_range.sunshine_port = 40001;
        h.repo.create(&out_of_range).await.unwrap();

        let restarted = h.service_with(Arc::new(Allocators::new(&AllocatorConfig::default())));
        let report = restarted.restore_allocations().await.unwrap();
        assert_eq!(report.restored, 1);
        assert_eq!(report.conflicts, 2);
        assert_eq!(report.purged, 0);
        assert_eq!(h.repo.list_live().await.unwrap().len(), 3);
    }
}

//! Test utilities and common setup.

#![allow(dead_code)]

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use axum::Router;
use axum::body::Body;
use axum::http::{Method, Request, StatusCode, header};
use serde_json::Value;
use tower::ServiceExt;

use gamedesk::allocator::{AllocatorConfig, Allocators};
use gamedesk::api;
use gamedesk::container::{ContainerConfig, ContainerError, ContainerResult, ContainerRuntimeApi};
use gamedesk::db::Database;
use gamedesk::instance::{InstanceRepository, InstanceService, InstanceServiceConfig};

/// In-process stand-in for docker/podman.
#[derive(Default)]
pub struct FakeRuntime {
    next_id: AtomicUsize,
    pub fail_create: AtomicBool,
    pub created: Mutex<Vec<ContainerConfig>>,
    pub removed: Mutex<Vec<String>>,
}

#[async_trait::async_trait]
impl ContainerRuntimeApi for FakeRuntime {
    async fn create_container(&self, config: &ContainerConfig) -> ContainerResult<String> {
        if self.fail_create.load(Ordering::SeqCst) {
            return Err(ContainerError::CommandFailed {
                command: "run".to_string(),
                message: "image pull failed".to_string(),
            });
        }
        self.created.lock().unwrap().push(config.clone());
        let n = self.next_id.fetch_add(1, Ordering::SeqCst);
        Ok(format!("container{:04}", n))
    }

    async fn stop_container(
        &self,
        _container_id: &str,
        _timeout_seconds: Option<u32>,
    ) -> ContainerResult<()> {
        Ok(())
    }

    async fn remove_container(&self, container_id: &str, _force: bool) -> ContainerResult<()> {
        self.removed.lock().unwrap().push(container_id.to_string());
        Ok(())
    }
}

pub struct TestApp {
    pub router: Router,
    pub runtime: Arc<FakeRuntime>,
    pub allocators: Arc<Allocators>,
}

/// Create a test application with the default pools.
pub async fn test_app() -> TestApp {
    test_app_with(AllocatorConfig::default()).await
}

/// Create a test application backed by an in-memory database.
pub async fn test_app_with(allocation: AllocatorConfig) -> TestApp {
    let db = Database::in_memory().await.unwrap();
    let runtime = Arc::new(FakeRuntime::default());
    let allocators = Arc::new(Allocators::new(&allocation));

    let service = InstanceService::new(
        InstanceRepository::new(db.pool().clone()),
        runtime.clone(),
        allocators.clone(),
        InstanceServiceConfig::default(),
    );

    let state = api::AppState::new(service);
    TestApp {
        router: api::create_router(state),
        runtime,
        allocators,
    }
}

/// Send a request and decode the JSON body (`Value::Null` when empty).
pub async fn send(
    app: &Router,
    method: Method,
    uri: &str,
    body: Option<Value>,
) -> (StatusCode, Value) {
    let mut builder = Request::builder().uri(uri).method(method);
    let body = match body {
        Some(json) => {
            builder = builder.header(header::CONTENT_TYPE, "application/json");
            Body::from(serde_json::to_string(&json).unwrap())
        }
        None => Body::empty(),
    };

    send_request(app, builder.body(body).unwrap()).await
}

/// Send a prepared request and decode the JSON body (`Value::Null` when empty).
pub async fn send_request(app: &Router, request: Request<Body>) -> (StatusCode, Value) {
    let response = app.clone().oneshot(request).await.unwrap();

    let status = response.status();
    let bytes = axum::body::to_bytes(response.into_body(), 1024 * 1024)
        .await
        .unwrap();
    let json = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap()
    };
    (status, json)
}

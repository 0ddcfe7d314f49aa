#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use converge_core::{FetchError, ResourceRef};
use converge_waiter::ObjectAccessor;
use serde_json::{json, Value};

/// Replays a fixed script of fetch results; the last entry repeats forever.
pub struct ScriptedAccessor {
    script: Mutex<VecDeque<Result<Value, FetchError>>>,
    last: Mutex<Option<Result<Value, FetchError>>>,
    fetches: AtomicU32,
    latency: Duration,
}

impl ScriptedAccessor {
    pub fn new(script: Vec<Result<Value, FetchError>>) -> Self {
        Self {
            script: Mutex::new(script.into()),
            last: Mutex::new(None),
            fetches: AtomicU32::new(0),
            latency: Duration::ZERO,
        }
    }

    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    pub fn fetches(&self) -> u32 {
        self.fetches.load(Ordering::SeqCst)
    }
}

#[async_trait::async_trait]
impl ObjectAccessor for ScriptedAccessor {
    type Object = Value;

    async fn fetch(&self, _target: &ResourceRef) -> Result<Value, FetchError> {
        self.fetches.fetch_add(1, Ordering::SeqCst);
        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }
        let next = self.script.lock().unwrap().pop_front();
        let mut last = self.last.lock().unwrap();
        match next {
            Some(r) => {
                *last = Some(r.clone());
                r
            }
            None => last.clone().unwrap_or_else(|| Err(FetchError::NotFound("empty script".into()))),
        }
    }
}

pub fn issuer(generation: u64, ready: Option<&str>) -> Value {
    let conditions = match ready {
        Some(status) => json!([{ "type": "Ready", "status": status, "reason": "Pending", "message": "registering account" }]),
        None => json!([]),
    };
    json!({
        "metadata": { "name": "test-acme-issuer", "namespace": "e2e", "generation": generation },
        "status": { "conditions": conditions }
    })
}

pub fn secret(keys: &[&str]) -> Value {
    let data: serde_json::Map<String, Value> = keys.iter().map(|k| (k.to_string(), json!("c2VjcmV0"))).collect();
    json!({ "metadata": { "name": "test-acme-private-key", "namespace": "e2e" }, "data": data })
}

pub fn not_found() -> Result<Value, FetchError> {
    Err(FetchError::NotFound("issuers.cert-manager.io \"test-acme-issuer\" not found".into()))
}

pub fn transient() -> Result<Value, FetchError> {
    Err(FetchError::Transient("connection reset by peer".into()))
}

pub fn target() -> ResourceRef {
    ResourceRef::namespaced("e2e", "test-acme-issuer")
}

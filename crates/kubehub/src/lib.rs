//! Converge kubehub – kube-rs backed object accessor

#![forbid(unsafe_code)]

use anyhow::{anyhow, Context, Result};
use converge_core::{FetchError, ResourceRef};
use converge_waiter::ObjectAccessor;
use kube::{
    api::Api,
    core::{ApiResource, DynamicObject, GroupVersionKind},
    discovery::{Discovery, Scope},
    Client,
};
use metrics::counter;
use tracing::{debug, info};

/// Reads one kind of object as raw JSON. Each fetch is a single GET; retrying
/// is left to the waiter.
#[derive(Clone)]
pub struct KubeAccessor {
    client: Client,
    resource: ApiResource,
    namespaced: bool,
}

impl KubeAccessor {
    pub fn new(client: Client, resource: ApiResource, namespaced: bool) -> Self {
        Self { client, resource, namespaced }
    }

    /// Resolve a GVK key such as `cert-manager.io/v1/Certificate` or `v1/Secret`
    /// through API discovery.
    pub async fn discover(client: Client, gvk_key: &str) -> Result<Self> {
        let gvk = parse_gvk_key(gvk_key)?;
        let (resource, namespaced) = find_api_resource(client.clone(), &gvk).await?;
        info!(gvk = %gvk_key, plural = %resource.plural, namespaced, "resolved api resource");
        Ok(Self::new(client, resource, namespaced))
    }

    /// Like [`KubeAccessor::discover`], but core kinds known up front skip discovery.
    pub async fn for_gvk(client: Client, gvk_key: &str) -> Result<Self> {
        match gvk_key {
            "v1/Secret" => Ok(Self::secrets(client)),
            _ => Self::discover(client, gvk_key).await,
        }
    }

    /// Core `v1/Secret`, without a discovery round-trip.
    pub fn secrets(client: Client) -> Self {
        use k8s_openapi::api::core::v1::Secret;
        Self::new(client, ApiResource::erase::<Secret>(&()), true)
    }

    pub fn gvk_key(&self) -> String {
        if self.resource.group.is_empty() {
            format!("{}/{}", self.resource.version, self.resource.kind)
        } else {
            format!("{}/{}/{}", self.resource.group, self.resource.version, self.resource.kind)
        }
    }

    pub fn is_namespaced(&self) -> bool {
        self.namespaced
    }

    fn api(&self, namespace: Option<&str>) -> Api<DynamicObject> {
        if !self.namespaced {
            if let Some(ns) = namespace {
                debug!(kind = %self.resource.kind, ns = %ns, "ignoring namespace for cluster-scoped kind");
            }
            return Api::all_with(self.client.clone(), &self.resource);
        }
        match namespace {
            Some(ns) => Api::namespaced_with(self.client.clone(), ns, &self.resource),
            None => Api::default_namespaced_with(self.client.clone(), &self.resource),
        }
    }
}

#[async_trait::async_trait]
impl ObjectAccessor for KubeAccessor {
    type Object = serde_json::Value;

    async fn fetch(&self, target: &ResourceRef) -> Result<serde_json::Value, FetchError> {
        let api = self.api(target.namespace.as_deref());
        match api.get(&target.name).await {
            Ok(obj) => {
                counter!("converge_kube_get_total", 1, "result" => "ok");
                let mut raw = serde_json::to_value(&obj)
                    .map_err(|e| FetchError::Transient(format!("serializing DynamicObject: {}", e)))?;
                strip_managed_fields(&mut raw);
                Ok(raw)
            }
            Err(e) => {
                let err = classify(e);
                let result = if err.is_not_found() { "not_found" } else { "error" };
                counter!("converge_kube_get_total", 1, "result" => result);
                Err(err)
            }
        }
    }
}

/// Map a kube error onto the waiter's taxonomy: HTTP 404 is "not found",
/// everything else is worth another attempt.
pub fn classify(err: kube::Error) -> FetchError {
    match err {
        kube::Error::Api(resp) if resp.code == 404 => FetchError::NotFound(resp.message),
        other => FetchError::Transient(other.to_string()),
    }
}

pub fn parse_gvk_key(key: &str) -> Result<GroupVersionKind> {
    let parts: Vec<_> = key.split('/').collect();
    match parts.as_slice() {
        [version, kind] if !version.is_empty() && !kind.is_empty() => Ok(GroupVersionKind {
            group: String::new(),
            version: version.to_string(),
            kind: kind.to_string(),
        }),
        [group, version, kind] if !version.is_empty() && !kind.is_empty() => Ok(GroupVersionKind {
            group: (*group).to_string(),
            version: (*version).to_string(),
            kind: (*kind).to_string(),
        }),
        _ => Err(anyhow!("invalid gvk key: {} (expect v1/Kind or group/v1/Kind)", key)),
    }
}

async fn find_api_resource(client: Client, gvk: &GroupVersionKind) -> Result<(ApiResource, bool)> {
    let discovery = Discovery::new(client).run().await.context("running api discovery")?;
    for group in discovery.groups() {
        for (ar, caps) in group.recommended_resources() {
            if ar.group == gvk.group && ar.version == gvk.version && ar.kind == gvk.kind {
                let namespaced = matches!(caps.scope, Scope::Namespaced);
                return Ok((ar.clone(), namespaced));
            }
        }
    }
    Err(anyhow!("GVK not found: {}/{}/{}", gvk.group, gvk.version, gvk.kind))
}

pub fn strip_managed_fields(v: &mut serde_json::Value) {
    if let Some(meta) = v.get_mut("metadata") {
        if let Some(obj) = meta.as_object_mut() {
            obj.remove("managedFields");
        }
    }
}

/// Client from the ambient kubeconfig or in-cluster environment.
pub async fn client() -> Result<Client> {
    Client::try_default().await.context("building kube client")
}

#[cfg(test)]
mod tests {
    use super::*;
    use kube::core::ErrorResponse;

    fn api_error(code: u16, reason: &str) -> kube::Error {
        kube::Error::Api(ErrorResponse {
            status: "Failure".into(),
            message: format!("issuers.cert-manager.io \"test-acme-issuer\" {}", reason),
            reason: reason.into(),
            code,
        })
    }

    #[test]
    fn parse_gvk_key_parses_core() {
        let gvk = parse_gvk_key("v1/Secret").expect("ok");
        assert_eq!(gvk.group, "");
        assert_eq!(gvk.version, "v1");
        assert_eq!(gvk.kind, "Secret");
    }

    #[test]
    fn parse_gvk_key_parses_group() {
        let gvk = parse_gvk_key("cert-manager.io/v1/Certificate").expect("ok");
        assert_eq!(gvk.group, "cert-manager.io");
        assert_eq!(gvk.version, "v1");
        assert_eq!(gvk.kind, "Certificate");
    }

    #[test]
    fn parse_gvk_key_invalid_returns_err() {
        assert!(parse_gvk_key("invalid").is_err());
        assert!(parse_gvk_key("").is_err());
        assert!(parse_gvk_key("v1/").is_err());
        assert!(parse_gvk_key("a/b/c/d").is_err());
    }

    #[test]
    fn classify_404_as_not_found() {
        match classify(api_error(404, "NotFound")) {
            FetchError::NotFound(msg) => assert!(msg.contains("test-acme-issuer")),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn classify_other_api_errors_as_transient() {
        for code in [409, 429, 500, 503] {
            assert!(matches!(classify(api_error(code, "Boom")), FetchError::Transient(_)), "code {}", code);
        }
    }

    #[test]
    fn strips_managed_fields_only() {
        let mut v = serde_json::json!({
            "metadata": { "name": "c", "managedFields": [{ "manager": "kubectl" }] },
            "status": { "conditions": [] }
        });
        strip_managed_fields(&mut v);
        assert!(v["metadata"].get("managedFields").is_none());
        assert_eq!(v["metadata"]["name"], "c");
        assert!(v["status"].get("conditions").is_some());
    }
}

//! Kubernetes ConfigMap backed config store

use super::{DEFAULT_NAMESPACE, RECORD_KIND};
use crate::domain::{ConfigRecord, ConfigStore};
use crate::error::{Error, Result};
use async_trait::async_trait;
use k8s_openapi::api::core::v1::ConfigMap;
use kube::api::{DeleteParams, ObjectMeta, PostParams};
use kube::{Api, Client};

/// Label marking records managed by this provider
const MANAGED_BY_LABEL: &str = "app.kubernetes.io/managed-by";
const MANAGED_BY_VALUE: &str = "talos-cluster-provider";

/// Stores each record as a ConfigMap in one namespace
#[derive(Clone)]
pub struct ConfigMapStore {
    api: Api<ConfigMap>,
    namespace: String,
}

impl ConfigMapStore {
    pub fn new(client: Client, namespace: impl Into<String>) -> Self {
        let namespace = namespace.into();
        Self {
            api: Api::namespaced(client, &namespace),
            namespace,
        }
    }

    /// Store in the default provider namespace
    pub fn with_default_namespace(client: Client) -> Self {
        Self::new(client, DEFAULT_NAMESPACE)
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    fn config_map(&self, name: &str, data: ConfigRecord) -> ConfigMap {
        ConfigMap {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                namespace: Some(self.namespace.clone()),
                labels: Some(
                    [(MANAGED_BY_LABEL.to_string(), MANAGED_BY_VALUE.to_string())]
                        .into_iter()
                        .collect(),
                ),
                ..Default::default()
            },
            data: Some(data),
            ..Default::default()
        }
    }
}

#[async_trait]
impl ConfigStore for ConfigMapStore {
    async fn get(&self, name: &str) -> Result<Option<ConfigRecord>> {
        let cm = self.api.get_opt(name).await?;
        Ok(cm.map(|cm| cm.data.unwrap_or_default()))
    }

    async fn create(&self, name: &str, data: ConfigRecord) -> Result<()> {
        let cm = self.config_map(name, data);
        match self.api.create(&PostParams::default(), &cm).await {
            Ok(_) => Ok(()),
            Err(kube::Error::Api(response)) if response.code == 409 => {
                Err(Error::exists(RECORD_KIND, name))
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn update(&self, name: &str, data: ConfigRecord) -> Result<()> {
        let mut cm = self
            .api
            .get_opt(name)
            .await?
            .ok_or_else(|| Error::not_found(RECORD_KIND, name))?;
        cm.data = Some(data);
        self.api.replace(name, &PostParams::default(), &cm).await?;
        Ok(())
    }

    async fn delete(&self, name: &str) -> Result<()> {
        match self.api.delete(name, &DeleteParams::default()).await {
            Ok(_) => Ok(()),
            Err(kube::Error::Api(response)) if response.code == 404 => {
                Err(Error::not_found(RECORD_KIND, name))
            }
            Err(e) => Err(e.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{MachineRole, USERDATA_KEY};
    use crate::store;
    use assert_matches::assert_matches;
    use hyper::{Body, Request, Response, StatusCode};
    use parking_lot::Mutex;
    use serde_json::json;
    use std::collections::BTreeMap;
    use std::convert::Infallible;
    use std::sync::Arc;

    const NAMESPACE: &str = "talos-system";

    /// Minimal ConfigMap endpoint keeping objects in memory
    #[derive(Clone, Default)]
    struct ApiServer {
        objects: Arc<Mutex<BTreeMap<String, ConfigMap>>>,
        requests: Arc<Mutex<Vec<String>>>,
        unavailable: Arc<Mutex<bool>>,
    }

    fn status(code: StatusCode, reason: &str) -> Response<Body> {
        let body = json!({
            "kind": "Status",
            "apiVersion": "v1",
            "metadata": {},
            "status": "Failure",
            "message": reason,
            "reason": reason,
            "code": code.as_u16(),
        });
        let mut response = Response::new(Body::from(body.to_string()));
        *response.status_mut() = code;
        response
    }

    fn object(code: StatusCode, cm: &ConfigMap) -> Response<Body> {
        let mut response = Response::new(Body::from(serde_json::to_vec(cm).unwrap()));
        *response.status_mut() = code;
        response
    }

    impl ApiServer {
        fn client(&self) -> Client {
            let server = self.clone();
            let service = tower::service_fn(move |req: Request<Body>| {
                let server = server.clone();
                async move { Ok::<_, Infallible>(server.handle(req).await) }
            });
            Client::new(service, NAMESPACE)
        }

        async fn handle(&self, req: Request<Body>) -> Response<Body> {
            let method = req.method().to_string();
            let path = req.uri().path().to_string();
            self.requests.lock().push(format!("{} {}", method, path));

            if *self.unavailable.lock() {
                return status(StatusCode::INTERNAL_SERVER_ERROR, "InternalError");
            }

            let prefix = format!("/api/v1/namespaces/{}/configmaps", NAMESPACE);
            let Some(rest) = path.strip_prefix(&prefix) else {
                return status(StatusCode::NOT_FOUND, "NotFound");
            };
            let name = rest.trim_start_matches('/').to_string();
            let body = hyper::body::to_bytes(req.into_body()).await.unwrap();

            let mut objects = self.objects.lock();
            match method.as_str() {
                "GET" => match objects.get(&name) {
                    Some(cm) => object(StatusCode::OK, cm),
                    None => status(StatusCode::NOT_FOUND, "NotFound"),
                },
                "POST" => {
                    let cm: ConfigMap = serde_json::from_slice(&body).unwrap();
                    let name = cm.metadata.name.clone().unwrap_or_default();
                    if objects.contains_key(&name) {
                        return status(StatusCode::CONFLICT, "AlreadyExists");
                    }
                    objects.insert(name, cm.clone());
                    object(StatusCode::CREATED, &cm)
                }
                "PUT" => {
                    let cm: ConfigMap = serde_json::from_slice(&body).unwrap();
                    if !objects.contains_key(&name) {
                        return status(StatusCode::NOT_FOUND, "NotFound");
                    }
                    objects.insert(name, cm.clone());
                    object(StatusCode::OK, &cm)
                }
                "DELETE" => match objects.remove(&name) {
                    Some(cm) => object(StatusCode::OK, &cm),
                    None => status(StatusCode::NOT_FOUND, "NotFound"),
                },
                _ => status(StatusCode::METHOD_NOT_ALLOWED, "MethodNotAllowed"),
            }
        }

        fn requests(&self) -> Vec<String> {
            self.requests.lock().clone()
        }
    }

    fn record(userdata: &str) -> ConfigRecord {
        ConfigRecord::from([(USERDATA_KEY.to_string(), userdata.to_string())])
    }

    #[tokio::test]
    async fn test_strict_semantics_over_api() {
        let server = ApiServer::default();
        let cms = ConfigMapStore::new(server.client(), NAMESPACE);

        assert!(cms.get("demo-workers").await.unwrap().is_none());
        assert_matches!(
            cms.update("demo-workers", record("a")).await,
            Err(Error::ResourceNotFound { .. })
        );
        assert_matches!(
            cms.delete("demo-workers").await,
            Err(Error::ResourceNotFound { .. })
        );

        cms.create("demo-workers", record("a")).await.unwrap();
        assert_matches!(
            cms.create("demo-workers", record("b")).await,
            Err(Error::ResourceExists { .. })
        );
        assert_eq!(cms.get("demo-workers").await.unwrap(), Some(record("a")));

        cms.update("demo-workers", record("b")).await.unwrap();
        assert_eq!(cms.get("demo-workers").await.unwrap(), Some(record("b")));

        cms.delete("demo-workers").await.unwrap();
        assert!(cms.get("demo-workers").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_created_config_map_is_labelled() {
        let server = ApiServer::default();
        let cms = ConfigMapStore::new(server.client(), NAMESPACE);

        store::upsert(&cms, "demo-master-0", record("init")).await.unwrap();
        store::upsert(&cms, "demo-master-0", record("init2")).await.unwrap();

        let objects = server.objects.lock();
        let cm = &objects["demo-master-0"];
        assert_eq!(cm.metadata.namespace.as_deref(), Some(NAMESPACE));
        assert_eq!(
            cm.metadata.labels.as_ref().unwrap()[MANAGED_BY_LABEL],
            MANAGED_BY_VALUE
        );
        assert_eq!(cm.data.as_ref().unwrap()[USERDATA_KEY], "init2");
        drop(objects);

        let requests = server.requests();
        assert!(requests
            .iter()
            .all(|r| r.contains("/api/v1/namespaces/talos-system/configmaps")));
        assert_eq!(requests.iter().filter(|r| r.starts_with("PUT ")).count(), 1);

        let payload = store::fetch_boot_payload(&cms, "demo", MachineRole::ControlPlane { ordinal: 0 })
            .await
            .unwrap();
        assert_eq!(payload.userdata, "init2");
        assert_eq!(payload.talosconfig, None);
        assert_matches!(
            store::fetch_boot_payload(&cms, "demo", MachineRole::Worker).await,
            Err(Error::ResourceNotFound { .. })
        );
    }

    #[tokio::test]
    async fn test_server_errors_propagate() {
        let server = ApiServer::default();
        let cms = ConfigMapStore::new(server.client(), NAMESPACE);
        *server.unavailable.lock() = true;

        assert_matches!(cms.get("demo-workers").await, Err(Error::Kube(_)));
        let err = cms.create("demo-workers", record("a")).await.unwrap_err();
        assert!(!err.is_already_exists());
        assert_matches!(
            store::delete_if_present(&cms, "demo-workers").await,
            Err(Error::Kube(_))
        );
    }
}

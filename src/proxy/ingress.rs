use super::status::{pool_name, StatusConfirmer};
use super::{BackendRef, BackendServer, Frontend, FrontendSpec, ProxyBackend, ProxyError};
use crate::cluster::{
    label_selector, ClusterClient, ClusterError, LABEL_APP, LABEL_MANAGED_BY, MANAGED_BY,
};
use async_trait::async_trait;
use k8s_openapi::api::networking::v1::{
    HTTPIngressPath, HTTPIngressRuleValue, Ingress, IngressBackend, IngressRule,
    IngressServiceBackend, IngressSpec, IngressTLS, ServiceBackendPort,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, info, warn};

pub const ANNOTATION_INGRESS_CLASS: &str = "kubernetes.io/ingress.class";
pub const ANNOTATION_AFFINITY: &str = "ingress.kubernetes.io/affinity";
pub const ANNOTATION_SNIPPET: &str = "ingress.kubernetes.io/configuration-snippet";
pub const ANNOTATION_WWW_REDIRECT: &str = "ingress.kubernetes.io/from-to-www-redirect";
pub const ANNOTATION_BACKEND_ID: &str = "cutover/backend-id";

const FRONTEND_KIND: &str = "ingress";

/// Proxy driven by nginx Ingress objects, one per hostname
///
/// Traffic reaches pods through the version Service, so individual endpoint
/// registration is a no-op. The Ingress annotation `cutover/backend-id`
/// records which backend a hostname currently serves.
pub struct IngressProxy {
    cluster: Arc<dyn ClusterClient>,
    confirmer: Option<StatusConfirmer>,
}

impl IngressProxy {
    pub fn new(cluster: Arc<dyn ClusterClient>, confirmer: Option<StatusConfirmer>) -> Self {
        IngressProxy { cluster, confirmer }
    }

    async fn rollback(
        &self,
        namespace: &str,
        name: &str,
        applied: Ingress,
        previous: &Ingress,
    ) -> bool {
        let mut restore = applied;
        restore.spec = previous.spec.clone();
        restore.metadata.annotations = previous.metadata.annotations.clone();
        match self.cluster.replace_ingress(namespace, name, &restore).await {
            Ok(_) => true,
            Err(e) => {
                warn!(ingress = %name, error = %e, "Failed to roll back ingress");
                false
            }
        }
    }
}

/// Ingress object name for a hostname
pub fn ingress_name(hostname: &str) -> String {
    hostname.replace('.', "-")
}

/// Last two labels of a hostname (`a.b.example.com` → `example.com`)
pub fn second_level_domain(hostname: &str) -> Option<String> {
    let labels: Vec<&str> = hostname.split('.').collect();
    if labels.len() < 2 {
        return None;
    }
    Some(labels[labels.len() - 2..].join("."))
}

/// Find the certificate secret for a hostname
///
/// A declared secret name is the only candidate and must exist. Without one,
/// a secret named after the exact hostname wins over one named after the
/// second-level domain. No match is an error.
pub async fn resolve_tls_secret(
    cluster: &dyn ClusterClient,
    namespace: &str,
    hostname: &str,
    declared: Option<&str>,
) -> Result<String, ProxyError> {
    let candidates: Vec<String> = match declared {
        Some(name) => vec![name.to_string()],
        None => {
            let mut names = vec![hostname.to_string()];
            if let Some(domain) = second_level_domain(hostname) {
                if domain != hostname {
                    names.push(domain);
                }
            }
            names
        }
    };

    for candidate in &candidates {
        if cluster.get_secret(namespace, candidate).await?.is_some() {
            debug!(hostname = %hostname, secret = %candidate, "Resolved TLS secret");
            return Ok(candidate.clone());
        }
    }

    Err(ProxyError::TlsSecretNotFound {
        hostname: hostname.to_string(),
        tried: candidates,
    })
}

/// nginx directives for compression and extra response headers
pub fn configuration_snippet(frontend: &FrontendSpec) -> String {
    let mut lines = Vec::new();
    if frontend.use_compression {
        lines.push("gzip on;".to_string());
        lines.push("gzip_proxied any;".to_string());
        lines.push(
            "gzip_types text/plain text/css text/xml application/json application/javascript application/xml;"
                .to_string(),
        );
    }
    for header in &frontend.additional_headers {
        lines.push(format!(
            "add_header {} \"{}\";",
            header.header.trim(),
            header.value.replace('"', "\\\"")
        ));
    }
    lines.join("\n")
}

fn build_ingress(frontend: &FrontendSpec, backend: &BackendRef, tls_secret: String) -> Ingress {
    let mut annotations = BTreeMap::from([
        (ANNOTATION_INGRESS_CLASS.to_string(), "nginx".to_string()),
        (ANNOTATION_BACKEND_ID.to_string(), backend.id()),
    ]);
    if frontend.sticky_sessions {
        annotations.insert(ANNOTATION_AFFINITY.to_string(), "cookie".to_string());
    }
    let snippet = configuration_snippet(frontend);
    if !snippet.is_empty() {
        annotations.insert(ANNOTATION_SNIPPET.to_string(), snippet);
    }

    let mut tls_hosts = vec![frontend.hostname.clone()];
    if frontend.redirect_www {
        annotations.insert(ANNOTATION_WWW_REDIRECT.to_string(), "true".to_string());
        tls_hosts.push(format!("www.{}", frontend.hostname));
    }

    let labels = BTreeMap::from([
        (LABEL_APP.to_string(), frontend.app_name.clone()),
        (LABEL_MANAGED_BY.to_string(), MANAGED_BY.to_string()),
    ]);

    Ingress {
        metadata: ObjectMeta {
            name: Some(ingress_name(&frontend.hostname)),
            namespace: Some(frontend.namespace.clone()),
            labels: Some(labels),
            annotations: Some(annotations),
            ..Default::default()
        },
        spec: Some(IngressSpec {
            rules: Some(vec![IngressRule {
                host: Some(frontend.hostname.clone()),
                http: Some(HTTPIngressRuleValue {
                    paths: vec![HTTPIngressPath {
                        path: Some("/".to_string()),
                        path_type: "Prefix".to_string(),
                        backend: IngressBackend {
                            service: Some(IngressServiceBackend {
                                name: backend.service_name(),
                                port: Some(ServiceBackendPort {
                                    number: Some(frontend.service_port),
                                    name: None,
                                }),
                            }),
                            resource: None,
                        },
                    }],
                }),
            }]),
            tls: Some(vec![IngressTLS {
                hosts: Some(tls_hosts),
                secret_name: Some(tls_secret),
            }]),
            ..Default::default()
        }),
        status: None,
    }
}

fn backend_id_of(ingress: &Ingress) -> Option<String> {
    ingress
        .metadata
        .annotations
        .as_ref()
        .and_then(|a| a.get(ANNOTATION_BACKEND_ID))
        .cloned()
}

/// Service backends referenced by every path of an Ingress
fn service_backends(ingress: &mut Ingress) -> impl Iterator<Item = &mut IngressServiceBackend> {
    ingress
        .spec
        .iter_mut()
        .flat_map(|spec| spec.rules.iter_mut().flatten())
        .flat_map(|rule| rule.http.iter_mut())
        .flat_map(|http| http.paths.iter_mut())
        .filter_map(|path| path.backend.service.as_mut())
}

/// Point every path at the backend's version Service, returning the routed port
fn retarget(ingress: &mut Ingress, backend: &BackendRef) -> i32 {
    let mut port = None;
    for service in service_backends(ingress) {
        service.name = backend.service_name();
        if port.is_none() {
            port = service.port.as_ref().and_then(|p| p.number);
        }
    }
    ingress
        .metadata
        .annotations
        .get_or_insert_with(BTreeMap::new)
        .insert(ANNOTATION_BACKEND_ID.to_string(), backend.id());
    port.unwrap_or(80)
}

#[async_trait]
impl ProxyBackend for IngressProxy {
    fn name(&self) -> &'static str {
        "ingress"
    }

    async fn add_backend_server(
        &self,
        backend: &BackendRef,
        server: &BackendServer,
    ) -> Result<(), ProxyError> {
        debug!(backend = %backend.id(), ip = %server.ip_address, "Ingress routes via Service, nothing to register");
        Ok(())
    }

    async fn delete_backend_server(
        &self,
        _backend: &BackendRef,
        _ip: &str,
    ) -> Result<(), ProxyError> {
        Ok(())
    }

    async fn create_frontend(
        &self,
        frontend: &FrontendSpec,
        backend: &BackendRef,
    ) -> Result<String, ProxyError> {
        let name = ingress_name(&frontend.hostname);
        if self
            .cluster
            .get_ingress(&frontend.namespace, &name)
            .await?
            .is_some()
        {
            debug!(hostname = %frontend.hostname, "Ingress already exists, leaving it unchanged");
            return Ok(name);
        }

        let secret = resolve_tls_secret(
            self.cluster.as_ref(),
            &frontend.namespace,
            &frontend.hostname,
            frontend.tls_secret_name.as_deref(),
        )
        .await?;

        let ingress = build_ingress(frontend, backend, secret);
        match self.cluster.create_ingress(&frontend.namespace, &ingress).await {
            Ok(_) => {
                info!(hostname = %frontend.hostname, backend = %backend.id(), "Created ingress");
                Ok(name)
            }
            Err(ClusterError::AlreadyExists { .. }) => Ok(name),
            Err(e) => Err(e.into()),
        }
    }

    async fn get_frontend(
        &self,
        namespace: &str,
        hostname: &str,
    ) -> Result<Option<Frontend>, ProxyError> {
        let ingress = self
            .cluster
            .get_ingress(namespace, &ingress_name(hostname))
            .await?;
        Ok(ingress.map(|ing| Frontend {
            hostname: hostname.to_string(),
            kind: FRONTEND_KIND.to_string(),
            backend_id: backend_id_of(&ing).unwrap_or_default(),
        }))
    }

    async fn switch_backend(
        &self,
        namespace: &str,
        hostname: &str,
        backend: &BackendRef,
    ) -> Result<String, ProxyError> {
        let name = ingress_name(hostname);
        let current = self
            .cluster
            .get_ingress(namespace, &name)
            .await?
            .ok_or_else(|| ProxyError::FrontendNotFound(hostname.to_string()))?;
        let previous_id = backend_id_of(&current).unwrap_or_default();

        let mut updated = current.clone();
        let port = retarget(&mut updated, backend);
        let applied = self.cluster.replace_ingress(namespace, &name, &updated).await?;
        info!(hostname = %hostname, from = %previous_id, to = %backend.id(), "Switched ingress backend");

        if let Some(confirmer) = &self.confirmer {
            let pool = pool_name(namespace, &backend.service_name(), port);
            if !confirmer.wait_for_pool(&pool).await {
                warn!(hostname = %hostname, pool = %pool, "Proxy did not confirm new backend, rolling back");
                let rolled_back = self.rollback(namespace, &name, applied, &current).await;
                return Err(ProxyError::ConfirmationTimeout {
                    pool,
                    timeout: confirmer.timeout(),
                    rolled_back,
                });
            }
            debug!(pool = %pool, "Proxy confirmed backend pool");
        }

        Ok(previous_id)
    }

    async fn delete_deployment(&self, backend: &BackendRef) -> Result<(), ProxyError> {
        let selector = label_selector(&[
            (LABEL_APP, backend.app_name.as_str()),
            (LABEL_MANAGED_BY, MANAGED_BY),
        ]);
        let id = backend.id();
        for ingress in self
            .cluster
            .list_ingresses(&backend.namespace, &selector)
            .await?
        {
            if backend_id_of(&ingress).as_deref() != Some(id.as_str()) {
                continue;
            }
            let Some(name) = ingress.metadata.name.as_deref() else {
                continue;
            };
            match self.cluster.delete_ingress(&backend.namespace, name).await {
                Ok(()) | Err(ClusterError::NotFound { .. }) => {
                    info!(ingress = %name, backend = %id, "Deleted ingress for removed backend");
                }
                Err(e) => return Err(e.into()),
            }
        }
        Ok(())
    }

    async fn delete_frontend(&self, namespace: &str, hostname: &str) -> Result<(), ProxyError> {
        match self
            .cluster
            .delete_ingress(namespace, &ingress_name(hostname))
            .await
        {
            Ok(()) | Err(ClusterError::NotFound { .. }) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

#[cfg(test)]
#[path = "ingress_test.rs"]
mod tests;

//! Add-on manifests
//!
//! Every object is built from typed k8s-openapi structs and serialized as a
//! multi-document YAML stream for `kubectl apply -f -`. Deletes use
//! [`ObjectRef`] stubs so a teardown never depends on re-rendering.

use std::collections::BTreeMap;

use ekstest_common::{Error, Result};
use ekstest_config::TestMode;
use k8s_openapi::api::apps::v1::{Deployment, DeploymentSpec};
use k8s_openapi::api::core::v1::{
    ConfigMap, ConfigMapVolumeSource, Container, ContainerPort, EnvVar, EnvVarSource,
    HTTPGetAction, KeyToPath, ObjectFieldSelector, PodSpec, PodTemplateSpec, Probe, Service,
    ServiceAccount, ServicePort, ServiceSpec, Volume, VolumeMount,
};
use k8s_openapi::api::networking::v1::{
    HTTPIngressPath, HTTPIngressRuleValue, Ingress, IngressBackend, IngressRule,
    IngressServiceBackend, IngressSpec, ServiceBackendPort,
};
use k8s_openapi::api::rbac::v1::{ClusterRole, ClusterRoleBinding, PolicyRule, RoleRef, Subject};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{LabelSelector, ObjectMeta};
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use k8s_openapi::Resource;
use serde::Serialize;
use serde_json::json;

/// Namespace of the controller and the metrics ingress
pub const CONTROLLER_NAMESPACE: &str = "kube-system";
/// Controller deployment; its pods are named `<name>-...`
pub const CONTROLLER_NAME: &str = "alb-ingress-controller";
/// Controller metrics service
pub const CONTROLLER_SERVICE: &str = "alb-ingress-controller-service";
/// Controller service account
pub const SERVICE_ACCOUNT: &str = "alb-ingress";
/// Controller health and metrics port
pub const CONTROLLER_PORT: i32 = 10254;

/// Namespace of the backend and the load-test ingress
pub const BACKEND_NAMESPACE: &str = "default";
/// nginx backend deployment
pub const NGINX_NAME: &str = "nginx-deployment";
/// nginx backend service
pub const NGINX_SERVICE: &str = "nginx-service";
/// nginx configuration and response body
pub const NGINX_CONFIG_MAP: &str = "nginx-config";
/// Ingress test server deployment
pub const TEST_SERVER_NAME: &str = "ingress-test-server";
/// Ingress test server service
pub const TEST_SERVER_SERVICE: &str = "ingress-test-server-service";
/// Test server path returning the fixed body
pub const TEST_SERVER_PATH: &str = "/ingress-test-server";
/// Metrics path, on the controller and on the test server
pub const METRICS_PATH: &str = "/metrics";

/// Ingress routing `/metrics` to the controller
pub const METRICS_INGRESS: &str = "ingress-for-alb-ingress-controller-service";
/// Ingress routing load-test traffic to the backend
pub const BACKEND_INGRESS: &str = "ingress-for-ingress-test-server-service";

const ANNOTATION_PREFIX: &str = "alb.ingress.kubernetes.io";

/// Path of the `index`-th generated test-server route
pub fn route_path(index: usize) -> String {
    format!("/ingress-test-{:05}", index)
}

/// Response body every backend serves
pub fn response_body(size: usize) -> String {
    "0".repeat(size)
}

/// Deployment and service names of the backend selected by `mode`
pub fn backend_names(mode: TestMode) -> (&'static str, &'static str) {
    match mode {
        TestMode::Nginx => (NGINX_NAME, NGINX_SERVICE),
        TestMode::IngressTestServer => (TEST_SERVER_NAME, TEST_SERVER_SERVICE),
    }
}

/// Identity of an object for deletion
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectRef {
    /// `apiVersion`
    pub api_version: &'static str,
    /// `kind`
    pub kind: &'static str,
    /// Namespace; `None` for cluster-scoped objects
    pub namespace: Option<&'static str>,
    /// Name
    pub name: &'static str,
}

impl ObjectRef {
    fn of<K: Resource>(namespace: Option<&'static str>, name: &'static str) -> Self {
        Self {
            api_version: K::API_VERSION,
            kind: K::KIND,
            namespace,
            name,
        }
    }
}

/// Minimal documents naming `refs`, enough for `kubectl delete -f -`
pub fn delete_stream(refs: &[ObjectRef]) -> Result<String> {
    let docs = refs
        .iter()
        .map(|r| {
            let mut metadata = json!({ "name": r.name });
            if let Some(ns) = r.namespace {
                metadata["namespace"] = json!(ns);
            }
            json!({ "apiVersion": r.api_version, "kind": r.kind, "metadata": metadata })
        })
        .collect::<Vec<_>>();
    stream(&docs)
}

fn stream<T: Serialize>(docs: &[T]) -> Result<String> {
    let mut out = String::new();
    for doc in docs {
        out.push_str("---\n");
        out.push_str(&serde_yaml::to_string(doc)?);
    }
    Ok(out)
}

fn labels(app: &str) -> BTreeMap<String, String> {
    BTreeMap::from([("app".to_string(), app.to_string())])
}

fn meta(name: &str, namespace: Option<&str>) -> ObjectMeta {
    ObjectMeta {
        name: Some(name.to_string()),
        namespace: namespace.map(String::from),
        labels: Some(labels(name)),
        ..Default::default()
    }
}

fn strings(items: &[&str]) -> Vec<String> {
    items.iter().map(|s| s.to_string()).collect()
}

// =============================================================================
// Controller RBAC
// =============================================================================

/// Objects created by [`rbac`]
pub fn rbac_refs() -> Vec<ObjectRef> {
    vec![
        ObjectRef::of::<ClusterRole>(None, CONTROLLER_NAME),
        ObjectRef::of::<ServiceAccount>(Some(CONTROLLER_NAMESPACE), SERVICE_ACCOUNT),
        ObjectRef::of::<ClusterRoleBinding>(None, CONTROLLER_NAME),
    ]
}

/// Cluster role, service account and binding for the controller
pub fn rbac() -> Result<String> {
    let role = ClusterRole {
        metadata: meta(CONTROLLER_NAME, None),
        rules: Some(vec![
            PolicyRule {
                api_groups: Some(strings(&["", "extensions", "networking.k8s.io"])),
                resources: Some(strings(&[
                    "configmaps",
                    "endpoints",
                    "events",
                    "ingresses",
                    "ingresses/status",
                    "services",
                ])),
                verbs: strings(&["create", "get", "list", "update", "watch", "patch"]),
                ..Default::default()
            },
            PolicyRule {
                api_groups: Some(strings(&["", "extensions", "networking.k8s.io"])),
                resources: Some(strings(&["nodes", "pods", "secrets", "services", "namespaces"])),
                verbs: strings(&["get", "list", "watch"]),
                ..Default::default()
            },
        ]),
        ..Default::default()
    };
    let account = ServiceAccount {
        metadata: meta(SERVICE_ACCOUNT, Some(CONTROLLER_NAMESPACE)),
        ..Default::default()
    };
    let binding = ClusterRoleBinding {
        metadata: meta(CONTROLLER_NAME, None),
        role_ref: RoleRef {
            api_group: "rbac.authorization.k8s.io".to_string(),
            kind: "ClusterRole".to_string(),
            name: CONTROLLER_NAME.to_string(),
        },
        subjects: Some(vec![Subject {
            kind: "ServiceAccount".to_string(),
            name: SERVICE_ACCOUNT.to_string(),
            namespace: Some(CONTROLLER_NAMESPACE.to_string()),
            ..Default::default()
        }]),
    };

    Ok([
        stream(&[role])?,
        stream(&[account])?,
        stream(&[binding])?,
    ]
    .concat())
}

// =============================================================================
// Controller deployment
// =============================================================================

/// Parameters of the controller deployment
#[derive(Debug, Clone)]
pub struct ControllerParams<'a> {
    /// Provider region the controller manages
    pub region: &'a str,
    /// Cluster whose ingresses it serves
    pub cluster_name: &'a str,
    /// Controller image
    pub image: &'a str,
}

/// Objects created by [`controller`]
pub fn controller_refs() -> Vec<ObjectRef> {
    vec![
        ObjectRef::of::<Deployment>(Some(CONTROLLER_NAMESPACE), CONTROLLER_NAME),
        ObjectRef::of::<Service>(Some(CONTROLLER_NAMESPACE), CONTROLLER_SERVICE),
    ]
}

fn health_probe() -> Probe {
    Probe {
        http_get: Some(HTTPGetAction {
            path: Some("/healthz".to_string()),
            port: IntOrString::Int(CONTROLLER_PORT),
            scheme: Some("HTTP".to_string()),
            ..Default::default()
        }),
        initial_delay_seconds: Some(10),
        period_seconds: Some(60),
        timeout_seconds: Some(30),
        ..Default::default()
    }
}

fn field_env(name: &str, path: &str) -> EnvVar {
    EnvVar {
        name: name.to_string(),
        value_from: Some(EnvVarSource {
            field_ref: Some(ObjectFieldSelector {
                api_version: Some("v1".to_string()),
                field_path: path.to_string(),
            }),
            ..Default::default()
        }),
        ..Default::default()
    }
}

/// Controller deployment and its node-port metrics service
pub fn controller(params: &ControllerParams<'_>) -> Result<String> {
    for (field, value) in [
        ("region", params.region),
        ("cluster-name", params.cluster_name),
        ("controller-image", params.image),
    ] {
        if value.is_empty() {
            return Err(Error::invalid_config(field, "required by the controller deployment"));
        }
    }

    let deployment = Deployment {
        metadata: meta(CONTROLLER_NAME, Some(CONTROLLER_NAMESPACE)),
        spec: Some(DeploymentSpec {
            replicas: Some(1),
            selector: LabelSelector {
                match_labels: Some(labels(CONTROLLER_NAME)),
                ..Default::default()
            },
            template: PodTemplateSpec {
                metadata: Some(ObjectMeta {
                    labels: Some(labels(CONTROLLER_NAME)),
                    ..Default::default()
                }),
                spec: Some(PodSpec {
                    service_account_name: Some(SERVICE_ACCOUNT.to_string()),
                    termination_grace_period_seconds: Some(30),
                    containers: vec![Container {
                        name: CONTROLLER_NAME.to_string(),
                        image: Some(params.image.to_string()),
                        image_pull_policy: Some("Always".to_string()),
                        args: Some(vec![
                            "/server".to_string(),
                            "--ingress-class=alb".to_string(),
                            format!("--cluster-name={}", params.cluster_name),
                            "--aws-max-retries=20".to_string(),
                            format!("--healthz-port={}", CONTROLLER_PORT),
                        ]),
                        ports: Some(vec![ContainerPort {
                            container_port: CONTROLLER_PORT,
                            protocol: Some("TCP".to_string()),
                            ..Default::default()
                        }]),
                        readiness_probe: Some(health_probe()),
                        liveness_probe: Some(health_probe()),
                        env: Some(vec![
                            EnvVar {
                                name: "AWS_REGION".to_string(),
                                value: Some(params.region.to_string()),
                                ..Default::default()
                            },
                            field_env("POD_NAME", "metadata.name"),
                            field_env("POD_NAMESPACE", "metadata.namespace"),
                        ]),
                        ..Default::default()
                    }],
                    ..Default::default()
                }),
            },
            ..Default::default()
        }),
        ..Default::default()
    };

    let service = node_port_service(
        CONTROLLER_SERVICE,
        CONTROLLER_NAMESPACE,
        CONTROLLER_NAME,
        "metrics",
        CONTROLLER_PORT,
    );

    Ok([stream(&[deployment])?, stream(&[service])?].concat())
}

fn node_port_service(name: &str, namespace: &str, app: &str, port_name: &str, target: i32) -> Service {
    Service {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            namespace: Some(namespace.to_string()),
            ..Default::default()
        },
        spec: Some(ServiceSpec {
            type_: Some("NodePort".to_string()),
            selector: Some(labels(app)),
            ports: Some(vec![ServicePort {
                name: Some(port_name.to_string()),
                port: 80,
                target_port: Some(IntOrString::Int(target)),
                protocol: Some("TCP".to_string()),
                ..Default::default()
            }]),
            ..Default::default()
        }),
        ..Default::default()
    }
}

// =============================================================================
// Backend workloads
// =============================================================================

/// Parameters of the backend workload
#[derive(Debug, Clone)]
pub struct BackendParams<'a> {
    /// Which backend to deploy
    pub mode: TestMode,
    /// Test server image; unused by nginx
    pub image: &'a str,
    /// Pod replicas
    pub replicas: i32,
    /// Generated routes; unused by nginx
    pub routes: usize,
    /// Response body size in bytes
    pub response_size: usize,
}

/// Objects created by [`backend`]
pub fn backend_refs(mode: TestMode) -> Vec<ObjectRef> {
    let (name, service) = backend_names(mode);
    let mut refs = vec![
        ObjectRef::of::<Deployment>(Some(BACKEND_NAMESPACE), name),
        ObjectRef::of::<Service>(Some(BACKEND_NAMESPACE), service),
    ];
    if mode == TestMode::Nginx {
        refs.push(ObjectRef::of::<ConfigMap>(Some(BACKEND_NAMESPACE), NGINX_CONFIG_MAP));
    }
    refs
}

const NGINX_CONF: &str = r#"server {
    listen 80;
    location / {
        root /usr/share/nginx/html;
        try_files /index.html =404;
    }
}
"#;

fn nginx_config_map(response_size: usize) -> ConfigMap {
    ConfigMap {
        metadata: meta(NGINX_CONFIG_MAP, Some(BACKEND_NAMESPACE)),
        data: Some(BTreeMap::from([
            ("default.conf".to_string(), NGINX_CONF.to_string()),
            ("index.html".to_string(), response_body(response_size)),
        ])),
        ..Default::default()
    }
}

fn config_volume(name: &str, key: &str) -> Volume {
    Volume {
        name: name.to_string(),
        config_map: Some(ConfigMapVolumeSource {
            name: NGINX_CONFIG_MAP.to_string(),
            items: Some(vec![KeyToPath {
                key: key.to_string(),
                path: key.to_string(),
                ..Default::default()
            }]),
            ..Default::default()
        }),
        ..Default::default()
    }
}

fn backend_deployment(name: &str, replicas: i32, container: Container, volumes: Vec<Volume>) -> Deployment {
    Deployment {
        metadata: meta(name, Some(BACKEND_NAMESPACE)),
        spec: Some(DeploymentSpec {
            replicas: Some(replicas),
            selector: LabelSelector {
                match_labels: Some(labels(name)),
                ..Default::default()
            },
            template: PodTemplateSpec {
                metadata: Some(ObjectMeta {
                    labels: Some(labels(name)),
                    ..Default::default()
                }),
                spec: Some(PodSpec {
                    containers: vec![container],
                    volumes: (!volumes.is_empty()).then_some(volumes),
                    ..Default::default()
                }),
            },
            ..Default::default()
        }),
        ..Default::default()
    }
}

/// Backend deployment and service, plus the nginx config map in nginx mode
pub fn backend(params: &BackendParams<'_>) -> Result<String> {
    if params.replicas < 1 {
        return Err(Error::invalid_config(
            "alb-ingress-controller.test-server-replicas",
            "at least one replica is required",
        ));
    }
    let (name, service) = backend_names(params.mode);
    let port = ContainerPort {
        container_port: 80,
        protocol: Some("TCP".to_string()),
        ..Default::default()
    };

    match params.mode {
        TestMode::Nginx => {
            let container = Container {
                name: "nginx".to_string(),
                image: Some("nginx:stable".to_string()),
                ports: Some(vec![port]),
                volume_mounts: Some(vec![
                    VolumeMount {
                        name: "nginx-conf".to_string(),
                        mount_path: "/etc/nginx/conf.d".to_string(),
                        read_only: Some(true),
                        ..Default::default()
                    },
                    VolumeMount {
                        name: "nginx-body".to_string(),
                        mount_path: "/usr/share/nginx/html".to_string(),
                        read_only: Some(true),
                        ..Default::default()
                    },
                ]),
                ..Default::default()
            };
            let volumes = vec![
                config_volume("nginx-conf", "default.conf"),
                config_volume("nginx-body", "index.html"),
            ];
            Ok([
                stream(&[nginx_config_map(params.response_size)])?,
                stream(&[backend_deployment(name, params.replicas, container, volumes)])?,
                stream(&[node_port_service(service, BACKEND_NAMESPACE, name, "http", 80)])?,
            ]
            .concat())
        }
        TestMode::IngressTestServer => {
            if params.image.is_empty() {
                return Err(Error::invalid_config(
                    "alb-ingress-controller.test-server-image",
                    "required in ingress-test-server mode",
                ));
            }
            let container = Container {
                name: TEST_SERVER_NAME.to_string(),
                image: Some(params.image.to_string()),
                image_pull_policy: Some("Always".to_string()),
                args: Some(vec![
                    "ingress-test-server".to_string(),
                    "--port=80".to_string(),
                    format!("--routes={}", params.routes),
                    format!("--response-size={}", params.response_size),
                ]),
                ports: Some(vec![port]),
                ..Default::default()
            };
            Ok([
                stream(&[backend_deployment(name, params.replicas, container, Vec::new())])?,
                stream(&[node_port_service(service, BACKEND_NAMESPACE, name, "http", 80)])?,
            ]
            .concat())
        }
    }
}

// =============================================================================
// Ingress objects
// =============================================================================

/// Parameters of one ingress object
#[derive(Debug, Clone, Default)]
pub struct IngressParams {
    /// Object name
    pub name: String,
    /// Namespace
    pub namespace: String,
    /// `instance` or `ip`
    pub target_type: String,
    /// Subnets the load balancer spans
    pub subnet_ids: Vec<String>,
    /// Groups attached to the load balancer in `instance` mode
    pub security_group_ids: Vec<String>,
    /// Tags for every provider resource the controller creates
    pub tags: BTreeMap<String, String>,
    /// Load-balancer attributes enabling access logs
    pub access_logs: Option<String>,
    /// `(path, service)` routes, all on port 80
    pub paths: Vec<(String, String)>,
}

/// Access-log attribute string for a load balancer writing to `bucket`
pub fn access_log_attributes(bucket: &str, cluster_name: &str, namespace: &str) -> String {
    format!(
        "access_logs.s3.enabled=true,access_logs.s3.bucket={},access_logs.s3.prefix={}-{}",
        bucket, cluster_name, namespace
    )
}

/// Objects created by [`ingress`] for both namespaces
pub fn ingress_refs() -> Vec<ObjectRef> {
    vec![
        ObjectRef::of::<Ingress>(Some(CONTROLLER_NAMESPACE), METRICS_INGRESS),
        ObjectRef::of::<Ingress>(Some(BACKEND_NAMESPACE), BACKEND_INGRESS),
    ]
}

fn annotation(key: &str) -> String {
    format!("{}/{}", ANNOTATION_PREFIX, key)
}

/// One internet-facing ingress with routes sorted by path
pub fn ingress(params: &IngressParams) -> Result<Ingress> {
    if params.name.is_empty() || params.namespace.is_empty() {
        return Err(Error::invalid_config("ingress", "name and namespace are required"));
    }
    if !matches!(params.target_type.as_str(), "instance" | "ip") {
        return Err(Error::invalid_config(
            "alb-ingress-controller.target-type",
            format!("unknown target type {:?}", params.target_type),
        ));
    }
    if params.subnet_ids.is_empty() {
        return Err(Error::invalid_config("subnet-ids", "ingress needs at least one subnet"));
    }
    if params.target_type == "instance" && params.security_group_ids.is_empty() {
        return Err(Error::invalid_config(
            "security-group-ids",
            "target type instance needs security groups",
        ));
    }
    if params.paths.is_empty() {
        return Err(Error::invalid_config("routes", "ingress needs at least one route"));
    }

    let mut annotations = BTreeMap::from([
        (annotation("scheme"), "internet-facing".to_string()),
        (annotation("target-type"), params.target_type.clone()),
        (annotation("listen-ports"), r#"[{"HTTP":80}]"#.to_string()),
        (annotation("subnets"), params.subnet_ids.join(",")),
        ("kubernetes.io/ingress.class".to_string(), "alb".to_string()),
    ]);
    if params.target_type == "instance" {
        annotations.insert(annotation("security-groups"), params.security_group_ids.join(","));
    }
    if let Some(attrs) = &params.access_logs {
        annotations.insert(annotation("load-balancer-attributes"), attrs.clone());
    }
    if !params.tags.is_empty() {
        let tags: Vec<String> = params.tags.iter().map(|(k, v)| format!("{}={}", k, v)).collect();
        annotations.insert(annotation("tags"), tags.join(","));
    }

    let mut paths = params.paths.clone();
    paths.sort();
    let paths = paths
        .into_iter()
        .map(|(path, service)| HTTPIngressPath {
            path: Some(path),
            path_type: "ImplementationSpecific".to_string(),
            backend: IngressBackend {
                service: Some(IngressServiceBackend {
                    name: service,
                    port: Some(ServiceBackendPort {
                        number: Some(80),
                        ..Default::default()
                    }),
                }),
                ..Default::default()
            },
        })
        .collect();

    Ok(Ingress {
        metadata: ObjectMeta {
            name: Some(params.name.clone()),
            namespace: Some(params.namespace.clone()),
            labels: Some(labels(&params.name)),
            annotations: Some(annotations),
            ..Default::default()
        },
        spec: Some(IngressSpec {
            rules: Some(vec![IngressRule {
                http: Some(HTTPIngressRuleValue { paths }),
                ..Default::default()
            }]),
            ..Default::default()
        }),
        ..Default::default()
    })
}

/// Serialize ingress objects as one stream
pub fn ingress_stream(ingresses: &[Ingress]) -> Result<String> {
    stream(ingresses)
}

/// Load-test routes of the backend ingress for `mode`
pub fn backend_routes(mode: TestMode, routes: usize) -> Vec<(String, String)> {
    match mode {
        TestMode::Nginx => vec![("/*".to_string(), NGINX_SERVICE.to_string())],
        TestMode::IngressTestServer => {
            let mut paths = vec![
                (TEST_SERVER_PATH.to_string(), TEST_SERVER_SERVICE.to_string()),
                (METRICS_PATH.to_string(), TEST_SERVER_SERVICE.to_string()),
            ];
            paths.extend((0..routes).map(|i| (route_path(i), TEST_SERVER_SERVICE.to_string())));
            paths
        }
    }
}

//! Default manifests for a single-user JupyterLab workload.

use std::collections::BTreeMap;

use k8s_openapi::api::apps::v1::StatefulSet;
use k8s_openapi::api::core::v1::{ConfigMap, Secret, Service};
use kubelab_core::{LabConfig, LabError, WorkloadIdentity, JUPYTER_CONFIG_FILE as CONFIG_FILE, JUPYTER_PORT, MANAGED_BY_LABEL, MANAGED_BY_VALUE};
use kubelab_kubehub::ResourceObject;
use serde::de::DeserializeOwned;
use serde_json::{json, Value as Json};

use crate::ManifestBuilder;

const HOME: &str = "/home/jovyan";
const GIT_IMAGE: &str = "alpine/git:latest";

const CLONE_SCRIPT: &str = r#"set -e
dest=/home/jovyan/work/repo
[ -d "$dest/.git" ] && exit 0
if [ -n "$GIT_TOKEN" ]; then
  git -c "http.extraHeader=Authorization: Bearer $GIT_TOKEN" clone ${GIT_BRANCH:+--branch "$GIT_BRANCH"} "$GIT_REPOSITORY" "$dest"
else
  git clone ${GIT_BRANCH:+--branch "$GIT_BRANCH"} "$GIT_REPOSITORY" "$dest"
fi
chown -R 1000:100 "$dest"
"#;

/// Server config: no token/password, listen on all interfaces, embeddable.
fn server_config() -> String {
    format!(
        "c.ServerApp.token = ''\n\
         c.ServerApp.password = ''\n\
         c.ServerApp.ip = '0.0.0.0'\n\
         c.ServerApp.port = {port}\n\
         c.ServerApp.allow_origin = '*'\n\
         c.ServerApp.allow_remote_access = True\n\
         c.ServerApp.disable_check_xsrf = True\n\
         c.ServerApp.allow_iframe = True\n\
         c.ServerApp.tornado_settings = {{\n    'headers': {{\n        'Content-Security-Policy': \"frame-ancestors 'self' *; script-src 'self' 'unsafe-inline' 'unsafe-eval' *; style-src 'self' 'unsafe-inline' *;\",\n    }}\n}}\n",
        port = JUPYTER_PORT
    )
}

/// Emits ConfigMap, optional git Secret, headless Service and StatefulSet.
#[derive(Debug, Clone, Default)]
pub struct JupyterManifests;

impl JupyterManifests {
    fn labels(id: &WorkloadIdentity) -> Json {
        json!({ "app": id.as_str(), MANAGED_BY_LABEL: MANAGED_BY_VALUE })
    }

    fn meta(name: &str, id: &WorkloadIdentity) -> Json {
        json!({ "name": name, "labels": Self::labels(id) })
    }

    fn config_map(config: &LabConfig, id: &WorkloadIdentity) -> Json {
        let mut data = BTreeMap::new();
        data.insert(CONFIG_FILE.to_string(), server_config());
        for (k, v) in &config.environment {
            data.insert(k.clone(), v.clone());
        }
        json!({
            "apiVersion": "v1",
            "kind": "ConfigMap",
            "metadata": Self::meta(&id.config_map_name(), id),
            "data": data,
        })
    }

    fn secret(config: &LabConfig, id: &WorkloadIdentity) -> Option<Json> {
        let git = config.git.as_ref()?;
        let mut data = BTreeMap::new();
        data.insert("repository", git.repository.clone());
        if let Some(b) = git.branch.as_ref().filter(|b| !b.is_empty()) {
            data.insert("branch", b.clone());
        }
        if let Some(t) = git.token.as_ref().filter(|t| !t.is_empty()) {
            data.insert("token", t.clone());
        }
        Some(json!({
            "apiVersion": "v1",
            "kind": "Secret",
            "metadata": Self::meta(&id.secret_name(), id),
            "type": "Opaque",
            "stringData": data,
        }))
    }

    fn service(id: &WorkloadIdentity) -> Json {
        json!({
            "apiVersion": "v1",
            "kind": "Service",
            "metadata": Self::meta(&id.service_name(), id),
            "spec": {
                "clusterIP": "None",
                "selector": { "app": id.as_str() },
                "ports": [{ "name": "http", "port": JUPYTER_PORT, "targetPort": JUPYTER_PORT }],
            },
        })
    }

    fn resources(config: &LabConfig) -> Json {
        let hw = &config.hardware;
        let mut limits = json!({ "cpu": hw.cpu, "memory": hw.memory });
        if hw.gpu > 0 {
            limits["nvidia.com/gpu"] = json!(hw.gpu.to_string());
        }
        json!({ "requests": { "cpu": hw.cpu, "memory": hw.memory }, "limits": limits })
    }

    fn env(config: &LabConfig, id: &WorkloadIdentity) -> Vec<Json> {
        config
            .environment
            .keys()
            .map(|k| json!({ "name": k, "valueFrom": { "configMapKeyRef": { "name": id.config_map_name(), "key": k } } }))
            .collect()
    }

    fn clone_container(id: &WorkloadIdentity) -> Json {
        let secret_env = |name: &str, key: &str, optional: bool| {
            json!({ "name": name, "valueFrom": { "secretKeyRef": { "name": id.secret_name(), "key": key, "optional": optional } } })
        };
        json!({
            "name": "git-clone",
            "image": GIT_IMAGE,
            "command": ["sh", "-c", CLONE_SCRIPT],
            "env": [
                secret_env("GIT_REPOSITORY", "repository", false),
                secret_env("GIT_BRANCH", "branch", true),
                secret_env("GIT_TOKEN", "token", true),
            ],
            "volumeMounts": [{ "name": "work", "mountPath": format!("{}/work", HOME) }],
        })
    }

    fn stateful_set(config: &LabConfig, id: &WorkloadIdentity) -> Json {
        let container = json!({
            "name": "jupyter",
            "image": config.image(),
            "ports": [{ "name": "http", "containerPort": JUPYTER_PORT }],
            "resources": Self::resources(config),
            "env": Self::env(config, id),
            "volumeMounts": [
                { "name": "jupyter-config", "mountPath": format!("{}/.jupyter/{}", HOME, CONFIG_FILE), "subPath": CONFIG_FILE },
                { "name": "work", "mountPath": format!("{}/work", HOME) },
            ],
            "readinessProbe": {
                "httpGet": { "path": "/api", "port": JUPYTER_PORT },
                "initialDelaySeconds": 5,
                "periodSeconds": 5,
            },
        });

        let mut volumes = vec![json!({ "name": "jupyter-config", "configMap": { "name": id.config_map_name() } })];
        let mut claims = Vec::new();
        match &config.hardware.storage {
            Some(size) if !size.is_empty() => claims.push(json!({
                "metadata": { "name": "work", "labels": Self::labels(id) },
                "spec": { "accessModes": ["ReadWriteOnce"], "resources": { "requests": { "storage": size } } },
            })),
            _ => volumes.push(json!({ "name": "work", "emptyDir": {} })),
        }

        let mut pod_spec = json!({
            "securityContext": { "fsGroup": 100 },
            "containers": [container],
            "volumes": volumes,
        });
        if config.git.is_some() {
            pod_spec["initContainers"] = json!([Self::clone_container(id)]);
        }

        let mut spec = json!({
            "replicas": 1,
            "serviceName": id.service_name(),
            "selector": { "matchLabels": { "app": id.as_str() } },
            "template": { "metadata": { "labels": Self::labels(id) }, "spec": pod_spec },
        });
        if !claims.is_empty() {
            spec["volumeClaimTemplates"] = Json::Array(claims);
        }

        json!({
            "apiVersion": "apps/v1",
            "kind": "StatefulSet",
            "metadata": Self::meta(id.as_str(), id),
            "spec": spec,
        })
    }
}

fn typed<T: DeserializeOwned>(kind: &str, v: Json) -> Result<T, LabError> {
    serde_json::from_value(v).map_err(|e| LabError::Manifest(format!("{}: {}", kind, e)))
}

impl ManifestBuilder for JupyterManifests {
    fn build(&self, config: &LabConfig, identity: &WorkloadIdentity) -> Result<Vec<ResourceObject>, LabError> {
        let config_map: ConfigMap = typed("ConfigMap", Self::config_map(config, identity))?;
        let mut out = vec![ResourceObject::ConfigMap(config_map)];
        if let Some(s) = Self::secret(config, identity) {
            let secret: Secret = typed("Secret", s)?;
            out.push(ResourceObject::Secret(secret));
        }
        let service: Service = typed("Service", Self::service(identity))?;
        out.push(ResourceObject::Service(service));
        let sts: StatefulSet = typed("StatefulSet", Self::stateful_set(config, identity))?;
        out.push(ResourceObject::StatefulSet(sts));
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kubelab_core::{GitConfig, Hardware};

    fn id() -> WorkloadIdentity { WorkloadIdentity::from_name("jupyter-0123456789ab") }

    fn sts(resources: &[ResourceObject]) -> Json {
        let r = resources.iter().find(|r| r.kind() == "StatefulSet").expect("sts");
        r.to_json().expect("json")
    }

    #[test]
    fn minimal_config_produces_three_resources_in_order() {
        let res = JupyterManifests.build(&LabConfig::default(), &id()).expect("build");
        let kinds: Vec<_> = res.iter().map(|r| (r.kind(), r.name().to_string())).collect();
        assert_eq!(
            kinds,
            vec![
                ("ConfigMap", "jupyter-0123456789ab-config".to_string()),
                ("Service", "jupyter-0123456789ab".to_string()),
                ("StatefulSet", "jupyter-0123456789ab".to_string()),
            ]
        );
        let s = sts(&res);
        assert_eq!(s["spec"]["replicas"], 1);
        assert_eq!(s["spec"]["template"]["spec"]["containers"][0]["image"], "jupyter/base-notebook:latest");
        assert_eq!(s["metadata"]["labels"][MANAGED_BY_LABEL], MANAGED_BY_VALUE);
        assert!(s["spec"]["template"]["spec"]["initContainers"].is_null());
    }

    #[test]
    fn service_is_typed_and_headless() {
        let res = JupyterManifests.build(&LabConfig::default(), &id()).unwrap();
        let svc = match &res[1] {
            ResourceObject::Service(s) => s,
            other => panic!("expected Service, got {}", other),
        };
        let spec = svc.spec.as_ref().expect("spec");
        assert_eq!(spec.cluster_ip.as_deref(), Some("None"));
        let port = &spec.ports.as_ref().expect("ports")[0];
        assert_eq!((port.name.as_deref(), port.port), (Some("http"), i32::from(JUPYTER_PORT)));
    }

    #[test]
    fn gpu_limit_only_when_requested() {
        let mut cfg = LabConfig { hardware: Hardware { cpu: "4".into(), memory: "16Gi".into(), gpu: 2, storage: None }, ..Default::default() };
        let s = sts(&JupyterManifests.build(&cfg, &id()).unwrap());
        let res = &s["spec"]["template"]["spec"]["containers"][0]["resources"];
        assert_eq!(res["limits"]["nvidia.com/gpu"], "2");
        assert_eq!(res["requests"]["cpu"], "4");
        assert_eq!(res["limits"]["memory"], "16Gi");

        cfg.hardware.gpu = 0;
        let s = sts(&JupyterManifests.build(&cfg, &id()).unwrap());
        assert!(s["spec"]["template"]["spec"]["containers"][0]["resources"]["limits"].get("nvidia.com/gpu").is_none());
    }

    #[test]
    fn git_adds_secret_and_init_container() {
        let cfg = LabConfig {
            git: Some(GitConfig { repository: "https://example.com/r.git".into(), branch: Some("main".into()), token: None }),
            ..Default::default()
        };
        let res = JupyterManifests.build(&cfg, &id()).unwrap();
        assert_eq!(res[1].kind(), "Secret");
        assert_eq!(res[1].name(), "jupyter-0123456789ab-git");
        let s = sts(&res);
        assert_eq!(s["spec"]["template"]["spec"]["initContainers"][0]["name"], "git-clone");
    }

    #[test]
    fn environment_goes_through_configmap() {
        let mut cfg = LabConfig::default();
        cfg.environment.insert("WANDB_MODE".into(), "offline".into());
        let res = JupyterManifests.build(&cfg, &id()).unwrap();
        let cm = res[0].to_json().unwrap();
        assert_eq!(cm["data"]["WANDB_MODE"], "offline");
        assert!(cm["data"][CONFIG_FILE].as_str().unwrap().contains("c.ServerApp.token = ''"));
        let s = sts(&res);
        let env = &s["spec"]["template"]["spec"]["containers"][0]["env"][0];
        assert_eq!(env["name"], "WANDB_MODE");
        assert_eq!(env["valueFrom"]["configMapKeyRef"]["name"], "jupyter-0123456789ab-config");
    }

    #[test]
    fn storage_uses_volume_claim_template() {
        let cfg = LabConfig { hardware: Hardware { storage: Some("10Gi".into()), ..Default::default() }, ..Default::default() };
        let s = sts(&JupyterManifests.build(&cfg, &id()).unwrap());
        assert_eq!(s["spec"]["volumeClaimTemplates"][0]["spec"]["resources"]["requests"]["storage"], "10Gi");
        let vols = s["spec"]["template"]["spec"]["volumes"].as_array().unwrap();
        assert!(vols.iter().all(|v| v["name"] != "work"));
    }
}

//! Google Compute Engine over the REST v1 API.

use log::debug;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::{json, Map, Value};
use std::collections::BTreeMap;
use std::process::Command;
use std::sync::OnceLock;

use crate::backend::{ComputeBackend, FirewallSpec, InstancePage, InstanceRecord, Operation};
use crate::error::BackendError;

pub const DEFAULT_ENDPOINT: &str = "https://compute.googleapis.com/compute/v1";
pub const ENDPOINT_ENV: &str = "SKIRMISH_COMPUTE_ENDPOINT";
pub const TOKEN_ENV: &str = "GOOGLE_OAUTH_ACCESS_TOKEN";

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct InstanceList {
    #[serde(default)]
    items: Vec<InstanceRecord>,
    #[serde(default)]
    next_page_token: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct InstanceFingerprint {
    #[serde(default)]
    label_fingerprint: String,
}

#[derive(Debug, Deserialize)]
struct Named {
    name: String,
}

pub struct GceBackend {
    agent: ureq::Agent,
    endpoint: String,
    token: OnceLock<String>,
}

impl GceBackend {
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self {
            agent: ureq::Agent::new_with_defaults(),
            endpoint: endpoint.into().trim_end_matches('/').to_string(),
            token: OnceLock::new(),
        }
    }

    /// Endpoint from `SKIRMISH_COMPUTE_ENDPOINT`, else the public API.
    pub fn from_env() -> Self {
        let endpoint = std::env::var(ENDPOINT_ENV)
            .ok()
            .filter(|value| !value.trim().is_empty())
            .unwrap_or_else(|| DEFAULT_ENDPOINT.to_string());
        Self::new(endpoint)
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    fn zone_url(&self, project: &str, zone: &str, tail: &str) -> String {
        format!("{}/projects/{project}/zones/{zone}/{tail}", self.endpoint)
    }

    fn token(&self) -> Result<&str, BackendError> {
        if let Some(token) = self.token.get() {
            return Ok(token.as_str());
        }
        let resolved = resolve_token()?;
        Ok(self.token.get_or_init(|| resolved).as_str())
    }

    fn bearer(&self) -> Result<String, BackendError> {
        Ok(format!("Bearer {}", self.token()?))
    }

    fn get_json<T: DeserializeOwned>(
        &self,
        url: &str,
        query: &[(&str, &str)],
    ) -> Result<T, BackendError> {
        let mut request = self.agent.get(url).header("Authorization", self.bearer()?);
        for (key, value) in query {
            request = request.query(*key, *value);
        }
        let mut response = request.call().map_err(|err| request_error(url, err))?;
        response
            .body_mut()
            .read_json::<T>()
            .map_err(|err| BackendError::Decode {
                target: url.to_string(),
                message: err.to_string(),
            })
    }

    fn post_operation(&self, url: &str, body: Option<&Value>) -> Result<Operation, BackendError> {
        debug!("POST {url}");
        let request = self.agent.post(url).header("Authorization", self.bearer()?);
        let sent = match body {
            Some(body) => request.send_json(body),
            None => request.send_empty(),
        };
        let mut response = sent.map_err(|err| request_error(url, err))?;
        read_operation(url, response.body_mut())
    }

    fn delete_operation(&self, url: &str) -> Result<Operation, BackendError> {
        debug!("DELETE {url}");
        let mut response = self
            .agent
            .delete(url)
            .header("Authorization", self.bearer()?)
            .call()
            .map_err(|err| request_error(url, err))?;
        read_operation(url, response.body_mut())
    }

    fn list_names(&self, url: &str) -> Result<Vec<String>, BackendError> {
        let mut names = Vec::new();
        let mut page_token: Option<String> = None;
        loop {
            let query: Vec<(&str, &str)> = page_token
                .as_deref()
                .map(|token| vec![("pageToken", token)])
                .unwrap_or_default();
            let page: NamedPage = self.get_json(url, &query)?;
            names.extend(page.items.into_iter().map(|item| item.name));
            match page.next_page_token {
                Some(token) if !token.is_empty() => page_token = Some(token),
                _ => return Ok(names),
            }
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct NamedPage {
    #[serde(default)]
    items: Vec<Named>,
    #[serde(default)]
    next_page_token: Option<String>,
}

fn read_operation(url: &str, body: &mut ureq::Body) -> Result<Operation, BackendError> {
    body.read_json::<Operation>()
        .map_err(|err| BackendError::Decode {
            target: url.to_string(),
            message: err.to_string(),
        })
}

fn request_error(url: &str, err: ureq::Error) -> BackendError {
    match err {
        ureq::Error::StatusCode(status) => BackendError::Status {
            target: url.to_string(),
            status,
        },
        other => BackendError::Transport {
            target: url.to_string(),
            message: other.to_string(),
        },
    }
}

/// `GOOGLE_OAUTH_ACCESS_TOKEN`, else `gcloud auth print-access-token`.
fn resolve_token() -> Result<String, BackendError> {
    if let Ok(token) = std::env::var(TOKEN_ENV) {
        let token = token.trim().to_string();
        if !token.is_empty() {
            return Ok(token);
        }
    }
    let output = Command::new("gcloud")
        .args(["auth", "print-access-token"])
        .output()
        .map_err(|err| BackendError::Auth {
            message: format!("{TOKEN_ENV} is unset and gcloud could not be run: {err}"),
        })?;
    if !output.status.success() {
        return Err(BackendError::Auth {
            message: format!(
                "gcloud auth print-access-token failed: {}",
                String::from_utf8_lossy(&output.stderr).trim()
            ),
        });
    }
    let token = String::from_utf8_lossy(&output.stdout).trim().to_string();
    if token.is_empty() {
        return Err(BackendError::Auth {
            message: "gcloud returned an empty access token".to_string(),
        });
    }
    Ok(token)
}

/// Bare network names are resolved against the project's global networks.
fn network_url(project: &str, network: &str) -> String {
    if network.contains('/') {
        network.to_string()
    } else {
        format!("projects/{project}/global/networks/{network}")
    }
}

fn firewall_body(project: &str, firewall: &FirewallSpec) -> Value {
    let mut body = Map::new();
    body.insert("name".to_string(), json!(firewall.name));
    body.insert(
        "network".to_string(),
        json!(network_url(project, &firewall.network)),
    );
    body.insert("direction".to_string(), json!(firewall.direction.as_str()));
    body.insert("priority".to_string(), json!(firewall.priority));
    body.insert("targetTags".to_string(), json!(firewall.target_tags));
    if !firewall.source_ranges.is_empty() {
        body.insert("sourceRanges".to_string(), json!(firewall.source_ranges));
    }
    if !firewall.destination_ranges.is_empty() {
        body.insert(
            "destinationRanges".to_string(),
            json!(firewall.destination_ranges),
        );
    }
    let denied: Vec<Value> = firewall
        .denied
        .iter()
        .map(|rule| {
            if rule.ports.is_empty() {
                json!({ "IPProtocol": rule.protocol })
            } else {
                json!({ "IPProtocol": rule.protocol, "ports": rule.ports })
            }
        })
        .collect();
    body.insert("denied".to_string(), Value::Array(denied));
    Value::Object(body)
}

impl ComputeBackend for GceBackend {
    fn connect(&self) -> Result<(), BackendError> {
        self.token().map(|_| ())
    }

    fn list_instances(
        &self,
        project: &str,
        zone: &str,
        page_token: Option<&str>,
    ) -> Result<InstancePage, BackendError> {
        let url = self.zone_url(project, zone, "instances");
        let query: Vec<(&str, &str)> = page_token
            .map(|token| vec![("pageToken", token)])
            .unwrap_or_default();
        let list: InstanceList = self.get_json(&url, &query)?;
        Ok(InstancePage {
            items: list.items,
            next_page_token: list.next_page_token,
        })
    }

    fn stop_instance(
        &self,
        project: &str,
        zone: &str,
        name: &str,
    ) -> Result<Operation, BackendError> {
        let url = self.zone_url(project, zone, &format!("instances/{name}/stop"));
        self.post_operation(&url, None)
    }

    fn start_instance(
        &self,
        project: &str,
        zone: &str,
        name: &str,
    ) -> Result<Operation, BackendError> {
        let url = self.zone_url(project, zone, &format!("instances/{name}/start"));
        self.post_operation(&url, None)
    }

    fn delete_instance(
        &self,
        project: &str,
        zone: &str,
        name: &str,
    ) -> Result<Operation, BackendError> {
        let url = self.zone_url(project, zone, &format!("instances/{name}"));
        self.delete_operation(&url)
    }

    fn set_labels(
        &self,
        project: &str,
        zone: &str,
        name: &str,
        labels: &BTreeMap<String, String>,
    ) -> Result<Operation, BackendError> {
        // setLabels is rejected without the instance's current fingerprint.
        let instance_url = self.zone_url(project, zone, &format!("instances/{name}"));
        let current: InstanceFingerprint = self.get_json(&instance_url, &[])?;
        let body = json!({
            "labels": labels,
            "labelFingerprint": current.label_fingerprint,
        });
        self.post_operation(&format!("{instance_url}/setLabels"), Some(&body))
    }

    fn list_zones(&self, project: &str) -> Result<Vec<String>, BackendError> {
        self.list_names(&format!("{}/projects/{project}/zones", self.endpoint))
    }

    fn list_regions(&self, project: &str) -> Result<Vec<String>, BackendError> {
        self.list_names(&format!("{}/projects/{project}/regions", self.endpoint))
    }

    fn insert_firewall(
        &self,
        project: &str,
        firewall: &FirewallSpec,
    ) -> Result<Operation, BackendError> {
        let url = format!("{}/projects/{project}/global/firewalls", self.endpoint);
        self.post_operation(&url, Some(&firewall_body(project, firewall)))
    }

    fn delete_firewall(&self, project: &str, name: &str) -> Result<Operation, BackendError> {
        let url = format!("{}/projects/{project}/global/firewalls/{name}", self.endpoint);
        self.delete_operation(&url)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::Flow;
    use skirmish_core::DenyRule;

    #[test]
    fn endpoint_is_normalised() {
        let backend = GceBackend::new("http://localhost:8080/compute/v1/");
        assert_eq!(backend.endpoint(), "http://localhost:8080/compute/v1");
        assert_eq!(
            backend.zone_url("prod", "us-east1-b", "instances"),
            "http://localhost:8080/compute/v1/projects/prod/zones/us-east1-b/instances"
        );
    }

    #[test]
    fn bare_network_names_become_global_paths() {
        assert_eq!(
            network_url("prod", "default"),
            "projects/prod/global/networks/default"
        );
        assert_eq!(
            network_url("prod", "projects/shared/global/networks/vpc"),
            "projects/shared/global/networks/vpc"
        );
    }

    #[test]
    fn firewall_body_uses_compute_field_names() {
        let spec = FirewallSpec::isolating(
            "skirmish-egress-abc-1".to_string(),
            "default",
            Flow::Egress,
            "skirmish-tag",
            &[
                DenyRule {
                    protocol: "tcp".to_string(),
                    ports: vec!["80".to_string()],
                },
                DenyRule {
                    protocol: "icmp".to_string(),
                    ports: Vec::new(),
                },
            ],
        );
        let body = firewall_body("prod", &spec);
        assert_eq!(body["direction"], "EGRESS");
        assert_eq!(body["priority"], 1);
        assert_eq!(body["network"], "projects/prod/global/networks/default");
        assert_eq!(body["destinationRanges"][0], "0.0.0.0/0");
        assert!(body.get("sourceRanges").is_none());
        assert_eq!(body["denied"][0]["IPProtocol"], "tcp");
        assert_eq!(body["denied"][0]["ports"][0], "80");
        assert!(body["denied"][1].get("ports").is_none());
    }

    #[test]
    fn instance_list_decodes_compute_payload() {
        let list: InstanceList = serde_json::from_str(
            r#"{
                "items": [{
                    "id": "123",
                    "name": "web-1",
                    "zone": "https://www.googleapis.com/compute/v1/projects/p/zones/us-east1-b",
                    "status": "RUNNING",
                    "labels": {"tier": "web"}
                }],
                "nextPageToken": "abc"
            }"#,
        )
        .expect("decode list");
        assert_eq!(list.items[0].name, "web-1");
        assert_eq!(list.items[0].labels.get("tier").map(String::as_str), Some("web"));
        assert_eq!(list.next_page_token.as_deref(), Some("abc"));

        let empty: InstanceList = serde_json::from_str("{}").expect("decode empty list");
        assert!(empty.items.is_empty());
    }
}

//! Pod annotation lookup.
//!
//! The topology for a pod is stored as a JSON document in one of its
//! annotations. The API server is reached over plain HTTP without
//! credentials.

use std::collections::HashMap;
use std::time::Duration;

use reqwest::{Client, StatusCode};
use serde::Deserialize;
use unicni_common::{UnicniError, UnicniResult};
use unicni_network::TopologySpec;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// Where topologies come from.
pub trait TopologySource {
    /// Topology for pod `name` in `namespace`; `None` if the pod carries none.
    ///
    /// # Errors
    ///
    /// Returns an error if the lookup fails or the document is invalid.
    fn topology(&self, namespace: &str, name: &str) -> UnicniResult<Option<TopologySpec>>;
}

#[derive(Debug, Deserialize)]
struct Pod {
    #[serde(default)]
    metadata: PodMetadata,
}

#[derive(Debug, Default, Deserialize)]
struct PodMetadata {
    #[serde(default)]
    annotations: HashMap<String, String>,
}

/// Client for pod metadata on the API server.
#[derive(Debug, Clone)]
pub struct AnnotationClient {
    client: Client,
    base_url: String,
}

impl AnnotationClient {
    /// Create a client for the API server at `base_url`.
    ///
    /// # Errors
    ///
    /// Returns [`UnicniError::Annotation`] if the HTTP client cannot be built.
    pub fn new(base_url: impl Into<String>) -> UnicniResult<Self> {
        let client = Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|e| UnicniError::Annotation {
                message: format!("Failed to build HTTP client: {e}"),
            })?;
        Ok(Self {
            client,
            base_url: base_url.into(),
        })
    }

    /// Read annotation `key` of pod `name` in `namespace`.
    ///
    /// # Errors
    ///
    /// Returns [`UnicniError::Annotation`] if the pod cannot be fetched.
    pub async fn annotation(
        &self,
        namespace: &str,
        name: &str,
        key: &str,
    ) -> UnicniResult<Option<String>> {
        let url = pod_url(&self.base_url, namespace, name);
        tracing::debug!(url = %url, "Fetching pod");

        let response = self
            .client
            .get(&url)
            .header("Accept", "application/json")
            .send()
            .await
            .map_err(|e| UnicniError::Annotation {
                message: format!("Failed to request pod {namespace}/{name}: {e}"),
            })?;

        if response.status() == StatusCode::NOT_FOUND {
            return Err(UnicniError::Annotation {
                message: format!("No such pod {name} in namespace {namespace}"),
            });
        }
        if !response.status().is_success() {
            return Err(UnicniError::Annotation {
                message: format!("API server returned {}", response.status()),
            });
        }

        let body = response.text().await.map_err(|e| UnicniError::Annotation {
            message: format!("Failed to read pod body: {e}"),
        })?;
        read_annotation(&body, key)
    }

    /// Fetch and parse the topology of pod `name` in `namespace`.
    ///
    /// # Errors
    ///
    /// Returns the fetch error or the parse error of the document.
    pub async fn topology(
        &self,
        namespace: &str,
        name: &str,
        key: &str,
    ) -> UnicniResult<Option<TopologySpec>> {
        match self.annotation(namespace, name, key).await? {
            Some(doc) => TopologySpec::from_json(&doc).map(Some),
            None => {
                tracing::info!(pod = %format!("{namespace}/{name}"), key, "Pod has no topology annotation");
                Ok(None)
            }
        }
    }
}

/// [`TopologySource`] backed by the API server.
///
/// Each lookup runs on its own short-lived runtime so no runtime is alive
/// while the orchestrator drives the kernel.
#[derive(Debug, Clone)]
pub struct PodTopologySource {
    client: AnnotationClient,
    key: String,
}

impl PodTopologySource {
    /// Look topologies up under annotation `key`.
    #[must_use]
    pub fn new(client: AnnotationClient, key: impl Into<String>) -> Self {
        Self {
            client,
            key: key.into(),
        }
    }
}

impl TopologySource for PodTopologySource {
    fn topology(&self, namespace: &str, name: &str) -> UnicniResult<Option<TopologySpec>> {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()?;
        runtime.block_on(self.client.topology(namespace, name, &self.key))
    }
}

fn pod_url(base_url: &str, namespace: &str, name: &str) -> String {
    format!(
        "{}/api/v1/namespaces/{namespace}/pods/{name}",
        base_url.trim_end_matches('/')
    )
}

fn read_annotation(body: &str, key: &str) -> UnicniResult<Option<String>> {
    let pod: Pod = serde_json::from_str(body)?;
    Ok(pod
        .metadata
        .annotations
        .get(key)
        .filter(|doc| !doc.trim().is_empty())
        .cloned())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn url_layout() {
        assert_eq!(
            pod_url("http://127.0.0.1:8080/", "default", "v9-simware"),
            "http://127.0.0.1:8080/api/v1/namespaces/default/pods/v9-simware"
        );
    }

    #[test]
    fn annotation_is_read() {
        let body = r#"{"kind":"Pod","metadata":{"name":"p","annotations":{
            "network_info":"{\"credential\":\"c1\",\"group\":\"g1\"}"}}}"#;
        let doc = read_annotation(body, "network_info").unwrap().unwrap();
        let spec = TopologySpec::from_json(&doc).unwrap();
        assert_eq!(spec.credential, "c1");
    }

    #[test]
    fn absent_or_blank_annotation() {
        assert_eq!(read_annotation(r#"{"metadata":{}}"#, "network_info").unwrap(), None);
        assert_eq!(read_annotation("{}", "network_info").unwrap(), None);
        assert_eq!(
            read_annotation(r#"{"metadata":{"annotations":{"network_info":" "}}}"#, "network_info")
                .unwrap(),
            None
        );
    }

    #[test]
    fn malformed_pod() {
        assert!(matches!(
            read_annotation("<html>", "network_info"),
            Err(UnicniError::Serialization(_))
        ));
    }
}

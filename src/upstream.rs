#![forbid(unsafe_code)]

//! Blocking client for the external video API.
//!
//! Every endpoint answers `{ "items": [...] }`. The client never retries; a
//! failure is the caller's cue to fall back to cached data.
//!
//! The API key travels in the `x-api-key` header, never in the URL, so error
//! messages (which quote the URL) are safe to log.

use std::time::Duration;

use anyhow::{Context, Result, anyhow, bail};
use serde::{Deserialize, de::DeserializeOwned};
use serde_json::Value;
use tracing::{debug, warn};

use crate::{cache::ListingRequest, channel::RawChannel, content::RawVideo};

const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);
const API_KEY_HEADER: &str = "x-api-key";

#[derive(Debug, Deserialize)]
struct Envelope {
    #[serde(default)]
    items: Vec<Value>,
}

/// Decodes each record on its own; one undecodable record is dropped with a
/// warning instead of failing the whole response.
fn decode_items<T: DeserializeOwned>(items: Vec<Value>) -> Vec<T> {
    items
        .into_iter()
        .filter_map(|item| {
            serde_json::from_value(item)
                .inspect_err(|err| warn!(%err, "skipping malformed upstream record"))
                .ok()
        })
        .collect()
}

#[derive(Clone)]
pub struct UpstreamClient {
    agent: ureq::Agent,
    base_url: Option<String>,
    api_key: Option<String>,
}

impl std::fmt::Debug for UpstreamClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UpstreamClient")
            .field("base_url", &self.base_url)
            .field("api_key", &self.api_key.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}

impl UpstreamClient {
    pub fn new(base_url: Option<String>, api_key: Option<String>) -> Self {
        let agent = ureq::AgentBuilder::new().timeout(REQUEST_TIMEOUT).build();
        Self {
            agent,
            base_url: base_url.map(|url| url.trim_end_matches('/').to_string()),
            api_key,
        }
    }

    pub fn is_configured(&self) -> bool {
        self.base_url.is_some()
    }

    fn endpoint(&self, path: &str) -> Result<String> {
        let base = self
            .base_url
            .as_deref()
            .ok_or_else(|| anyhow!("upstream API is not configured"))?;
        Ok(format!("{base}/{}", path.trim_start_matches('/')))
    }

    fn get_items<T: DeserializeOwned>(&self, path: &str, query: &[(&str, &str)]) -> Result<Vec<T>> {
        let url = self.endpoint(path)?;
        let mut request = self.agent.get(&url);
        for (key, value) in query {
            if !value.is_empty() {
                request = request.query(key, value);
            }
        }
        if let Some(key) = self.api_key.as_deref() {
            request = request.set(API_KEY_HEADER, key);
        }
        debug!(%url, "calling upstream");
        let envelope: Envelope = request
            .call()
            .with_context(|| format!("requesting {url}"))?
            .into_json()
            .with_context(|| format!("decoding response from {url}"))?;
        Ok(decode_items(envelope.items))
    }

    pub fn popular(&self, request: &ListingRequest) -> Result<Vec<RawVideo>> {
        self.get_items(
            "videos/popular",
            &[
                ("kind", request.kind.as_str()),
                ("category", request.category.as_str()),
                ("region", request.region.as_str()),
                ("categoryId", request.category_id.as_deref().unwrap_or("")),
            ],
        )
    }

    pub fn videos(&self, ids: &[String]) -> Result<Vec<RawVideo>> {
        if ids.is_empty() {
            bail!("no video ids requested");
        }
        self.get_items("videos", &[("ids", ids.join(",").as_str())])
    }

    pub fn video(&self, id: &str) -> Result<Option<RawVideo>> {
        Ok(self.videos(&[id.to_string()])?.into_iter().next())
    }

    pub fn channels(&self, ids: &[String]) -> Result<Vec<RawChannel>> {
        if ids.is_empty() {
            bail!("no channel ids requested");
        }
        self.get_items("channels", &[("ids", ids.join(",").as_str())])
    }

    pub fn channel(&self, id: &str) -> Result<Option<RawChannel>> {
        Ok(self.channels(&[id.to_string()])?.into_iter().next())
    }
}

/// Runs a blocking upstream call on the blocking pool.
pub async fn run_blocking<T, F>(call: F) -> Result<T>
where
    T: Send + 'static,
    F: FnOnce() -> Result<T> + Send + 'static,
{
    tokio::task::spawn_blocking(call)
        .await
        .context("upstream task panicked")?
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::content::ContentKind;
    use std::{
        io::{Read, Write},
        net::TcpListener,
        thread::{self, JoinHandle},
    };

    #[test]
    fn unconfigured_client_fails_fast() {
        let client = UpstreamClient::new(None, None);
        assert!(!client.is_configured());
        let err = client
            .popular(&ListingRequest::new(ContentKind::Video, "", "US"))
            .unwrap_err();
        assert!(err.to_string().contains("not configured"));
        assert!(client.channels(&["a".into()]).is_err());
    }

    #[test]
    fn endpoint_joins_paths() {
        let client = UpstreamClient::new(Some("https://api.test/v1/".into()), None);
        assert_eq!(
            client.endpoint("/channels").unwrap(),
            "https://api.test/v1/channels"
        );
    }

    #[test]
    fn empty_id_lists_are_rejected() {
        let client = UpstreamClient::new(Some("https://api.test".into()), None);
        assert!(client.videos(&[]).is_err());
        assert!(client.channels(&[]).is_err());
    }

    /// Answers one HTTP request with `status` and `body`, handing back the raw
    /// request text.
    fn serve_once(status: &'static str, body: &'static str) -> (String, JoinHandle<String>) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let base = format!("http://{}", listener.local_addr().unwrap());
        let handle = thread::spawn(move || {
            let (mut stream, _) = listener.accept().unwrap();
            let mut request = Vec::new();
            let mut buf = [0u8; 1024];
            while !request.windows(4).any(|window| window == b"\r\n\r\n") {
                let read = stream.read(&mut buf).unwrap();
                if read == 0 {
                    break;
                }
                request.extend_from_slice(&buf[..read]);
            }
            let response = format!(
                "HTTP/1.1 {status}\r\n\
                 Content-Type: application/json\r\n\
                 Content-Length: {}\r\n\
                 Connection: close\r\n\r\n{body}",
                body.len()
            );
            stream.write_all(response.as_bytes()).unwrap();
            String::from_utf8_lossy(&request).into_owned()
        });
        (base, handle)
    }

    #[test]
    fn api_key_goes_in_a_header_and_stays_out_of_errors() {
        let (base, server) = serve_once("500 Internal Server Error", "");
        let client = UpstreamClient::new(Some(base), Some("TOPSECRETKEY".into()));
        let err = client.channels(&["UC1".into()]).unwrap_err();
        let request = server.join().unwrap();

        assert!(!format!("{err:#}").contains("TOPSECRETKEY"));
        let request_line = request.lines().next().unwrap();
        assert!(request_line.contains("ids=UC1"));
        assert!(!request_line.contains("TOPSECRETKEY"));
        assert!(
            request
                .to_ascii_lowercase()
                .contains("x-api-key: topsecretkey")
        );
    }

    #[test]
    fn one_malformed_record_does_not_sink_the_response() {
        let (base, server) = serve_once(
            "200 OK",
            r#"{"items":[
                {"id":"UC1","title":"ok"},
                {"id":"UC2","subscriberCount":-1},
                {"id":["bad"]}
            ],"nextPageToken":"x"}"#,
        );
        let client = UpstreamClient::new(Some(base), None);
        let channels = client.channels(&["UC1".into(), "UC2".into()]).unwrap();
        server.join().unwrap();

        assert_eq!(channels.len(), 2);
        assert_eq!(channels[0].id.as_deref(), Some("UC1"));
        assert_eq!(channels[1].id.as_deref(), Some("UC2"));
    }

    #[test]
    fn envelope_tolerates_missing_items() {
        let envelope: Envelope = serde_json::from_str("{}").unwrap();
        assert!(envelope.items.is_empty());
        let records: Vec<RawChannel> = decode_items(vec![serde_json::json!({ "id": "UC1" })]);
        assert_eq!(records.len(), 1);
    }

    #[test]
    fn debug_redacts_api_key() {
        let client = UpstreamClient::new(None, Some("secret".into()));
        assert!(!format!("{client:?}").contains("secret"));
    }

    #[tokio::test]
    async fn run_blocking_propagates_errors() {
        let value = run_blocking(|| Ok(41 + 1)).await.unwrap();
        assert_eq!(value, 42);
        let err = run_blocking::<(), _>(|| Err(anyhow!("boom"))).await.unwrap_err();
        assert_eq!(err.to_string(), "boom");
    }
}

// afc-server: Object storage client for history artifacts

use crate::error::{AfcError, AfcResult};

/// Client of the object-store HTTP file service. Only the history-artifact
/// write path lives here; the worker reads its inputs from the job payload.
#[derive(Debug, Clone)]
pub struct ObjstClient {
    base_url: String,
    http: reqwest::Client,
}

impl ObjstClient {
    pub fn new(base_url: &str) -> ObjstClient {
        ObjstClient {
            base_url: base_url.trim_end_matches('/').to_string(),
            http: reqwest::Client::new(),
        }
    }

    /// (protocol, host, port) triple handed to workers so they reach the
    /// same store
    pub fn protocol_parts(&self) -> (String, String, u16) {
        match reqwest::Url::parse(&self.base_url) {
            Ok(url) => (
                url.scheme().to_string(),
                url.host_str().unwrap_or("localhost").to_string(),
                url.port_or_known_default().unwrap_or(80),
            ),
            Err(_) => ("http".to_string(), "localhost".to_string(), 80),
        }
    }

    /// Stores one file under the given directory path
    pub async fn put(&self, dir: &str, name: &str, content: &str) -> AfcResult<()> {
        let url = format!(
            "{}/{}/{}",
            self.base_url,
            dir.trim_matches('/'),
            name
        );
        let resp = self
            .http
            .post(&url)
            .body(content.to_string())
            .send()
            .await
            .map_err(|err| AfcError::Internal(format!("object store write failed: {err}")))?;
        if !resp.status().is_success() {
            return Err(AfcError::Internal(format!(
                "object store write to {url} returned {}",
                resp.status()
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_protocol_parts() {
        let client = ObjstClient::new("http://objst.example:5000/");
        assert_eq!(
            client.protocol_parts(),
            ("http".to_string(), "objst.example".to_string(), 5000)
        );
    }

    #[test]
    fn test_default_port() {
        let client = ObjstClient::new("https://objst.example");
        assert_eq!(client.protocol_parts().2, 443);
    }
}

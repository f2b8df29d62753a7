//! HTTP tracker client (spec §4.4 "Tracker collaboration", §6 "Tracker
//! protocol"). The tracker itself is an out-of-core collaborator; this
//! module only implements the client side the overlay uses to announce
//! itself and discover candidate peers on startup and under-connection.

use std::collections::HashMap;
use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;

use crate::ident::Identifier;

#[derive(Debug, Error)]
pub enum TrackerError {
    #[error("http request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("malformed tracker response: {0}")]
    BadResponse(String),
}

/// Jittered period between tracker announces while under `min_connections`
/// (spec §4.4 "every ~1200 s ± jitter").
pub const ANNOUNCE_PERIOD: Duration = Duration::from_secs(1200);
pub const ANNOUNCE_JITTER: Duration = Duration::from_secs(120);

#[derive(Deserialize)]
struct RawResponse(HashMap<String, Vec<String>>);

pub struct TrackerClient {
    http: reqwest::Client,
    base_url: String,
}

impl TrackerClient {
    pub fn new(base_url: impl Into<String>) -> Self {
        TrackerClient { http: reqwest::Client::new(), base_url: base_url.into() }
    }

    /// `POST /teapotnet/tracker?id=<node_id>&count=<n>` with form fields
    /// `addresses=<csv>` and optional `port` (spec §6). Returns candidate
    /// `node_id -> addresses` pairs.
    pub async fn announce(
        &self,
        id: Identifier,
        addresses: &[String],
        port: Option<u16>,
        count: u32,
    ) -> Result<HashMap<Identifier, Vec<String>>, TrackerError> {
        let url = format!("{}/teapotnet/tracker", self.base_url.trim_end_matches('/'));
        let mut form = vec![("addresses".to_string(), addresses.join(","))];
        if let Some(port) = port {
            form.push(("port".to_string(), port.to_string()));
        }

        let response = self
            .http
            .post(&url)
            .query(&[("id", id.to_hex()), ("count", count.to_string())])
            .form(&form)
            .send()
            .await?
            .error_for_status()?;

        let raw: RawResponse = response.json().await?;
        let mut candidates = HashMap::new();
        for (id_hex, addrs) in raw.0 {
            let node_id = Identifier::from_hex(&id_hex)
                .map_err(|e| TrackerError::BadResponse(format!("bad node id {id_hex}: {e}")))?;
            candidates.insert(node_id, addrs);
        }
        Ok(candidates)
    }
}

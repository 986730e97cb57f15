//! Discovery of the host's identity, consulted once at startup.

use crate::models::host::{HostDetails, UNKNOWN};
use reqwest::{Client, Url};
use std::{env, time::Duration};
use thiserror::Error;

const METADATA_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Error)]
pub enum HostError {
    #[error("invalid metadata url `{0}`")]
    InvalidUrl(String),
    #[error("metadata request for `{path}` failed: {source}")]
    Request {
        path: String,
        #[source]
        source: reqwest::Error,
    },
    #[error("metadata endpoint answered {status} for `{path}`")]
    Status { path: String, status: u16 },
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum HostType {
    /// No metadata service: details come from the local environment.
    Local,
    /// A cloud instance metadata service, e.g.
    /// `http://169.254.169.254/latest/meta-data`.
    Cloud { metadata_url: String },
}

impl HostType {
    /// An empty or absent metadata url means a local host.
    pub fn from_metadata_url(metadata_url: Option<&str>) -> Self {
        match metadata_url.map(str::trim) {
            Some(url) if !url.is_empty() => HostType::Cloud {
                metadata_url: url.trim_end_matches('/').to_string(),
            },
            _ => HostType::Local,
        }
    }

    pub fn description(&self) -> String {
        match self {
            HostType::Local => "local host".to_string(),
            HostType::Cloud { metadata_url } => format!("cloud instance ({metadata_url})"),
        }
    }

    pub async fn details(&self) -> Result<HostDetails, HostError> {
        match self {
            HostType::Local => Ok(HostDetails {
                hostname: local_hostname(),
                ..HostDetails::default()
            }),
            HostType::Cloud { metadata_url } => cloud_details(metadata_url).await,
        }
    }
}

fn local_hostname() -> String {
    env::var("HOSTNAME")
        .ok()
        .filter(|h| !h.trim().is_empty())
        .or_else(|| {
            std::fs::read_to_string("/etc/hostname")
                .ok()
                .map(|h| h.trim().to_string())
                .filter(|h| !h.is_empty())
        })
        .unwrap_or_else(|| UNKNOWN.to_string())
}

async fn cloud_details(metadata_url: &str) -> Result<HostDetails, HostError> {
    let base =
        Url::parse(metadata_url).map_err(|_| HostError::InvalidUrl(metadata_url.to_string()))?;
    let client = Client::builder()
        .timeout(METADATA_TIMEOUT)
        .build()
        .map_err(|source| HostError::Request {
            path: String::new(),
            source,
        })?;

    let hostname = fetch_field(&client, &base, "hostname").await?;
    let zone = fetch_field(&client, &base, "placement/availability-zone").await?;
    let instance_id = fetch_field(&client, &base, "instance-id").await?;
    let instance_type = fetch_field(&client, &base, "instance-type").await?;

    Ok(HostDetails {
        hostname,
        region: region_from_zone(&zone),
        instance_id,
        instance_type,
    })
}

async fn fetch_field(client: &Client, base: &Url, path: &str) -> Result<String, HostError> {
    let url = format!("{}/{}", base.as_str().trim_end_matches('/'), path);
    let response = client
        .get(&url)
        .send()
        .await
        .map_err(|source| HostError::Request {
            path: path.to_string(),
            source,
        })?;
    if !response.status().is_success() {
        return Err(HostError::Status {
            path: path.to_string(),
            status: response.status().as_u16(),
        });
    }
    let text = response.text().await.map_err(|source| HostError::Request {
        path: path.to_string(),
        source,
    })?;
    Ok(text.trim().to_string())
}

/// `us-west-2a` -> `us-west-2`.
fn region_from_zone(zone: &str) -> String {
    let zone = zone.trim();
    match zone.chars().last() {
        Some(c) if c.is_ascii_alphabetic() => zone[..zone.len() - 1].to_string(),
        _ => zone.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn host_type_follows_metadata_url() {
        assert_eq!(HostType::from_metadata_url(None), HostType::Local);
        assert_eq!(HostType::from_metadata_url(Some("  ")), HostType::Local);
        assert_eq!(
            HostType::from_metadata_url(Some("http://169.254.169.254/latest/meta-data/")),
            HostType::Cloud {
                metadata_url: "http://169.254.169.254/latest/meta-data".into()
            }
        );
    }

    #[test]
    fn region_strips_zone_letter() {
        assert_eq!(region_from_zone("us-west-2a"), "us-west-2");
        assert_eq!(region_from_zone("eu-central-1"), "eu-central-1");
    }

    #[tokio::test]
    async fn local_details_only_know_the_hostname() {
        let details = HostType::Local.details().await.unwrap();
        assert!(!details.hostname.is_empty());
        assert_eq!(details.region, UNKNOWN);
        assert_eq!(details.instance_id, UNKNOWN);
    }
}

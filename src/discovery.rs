/******************************************************************************
   Author: Joaquín Béjar García
   Email: jb@taunais.com
   Date: 19/10/26
******************************************************************************/

use crate::error::{StreamingError, StreamingResult};
use serde::Deserialize;
use serde_json::Value;
use std::fmt;
use std::str::FromStr;
use tracing::{debug, warn};

/// Layout of the discovery document.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum DiscoveryVersion {
    /// Services listed under `services`.
    #[default]
    V1,
    /// Services listed under `service`.
    Beta1,
}

impl DiscoveryVersion {
    fn services_key(&self) -> &'static str {
        match self {
            DiscoveryVersion::V1 => "services",
            DiscoveryVersion::Beta1 => "service",
        }
    }
}

impl fmt::Display for DiscoveryVersion {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            DiscoveryVersion::V1 => write!(f, "v1"),
            DiscoveryVersion::Beta1 => write!(f, "beta1"),
        }
    }
}

impl FromStr for DiscoveryVersion {
    type Err = StreamingError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "v1" => Ok(DiscoveryVersion::V1),
            "beta1" => Ok(DiscoveryVersion::Beta1),
            other => Err(StreamingError::Config(format!(
                "unknown discovery version '{}'",
                other
            ))),
        }
    }
}

/// One entry of the discovery document.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EndpointService {
    #[serde(default)]
    pub data_format: Vec<String>,
    pub endpoint: String,
    #[serde(default)]
    pub location: Vec<String>,
    pub port: u16,
    #[serde(default)]
    pub provider: String,
    pub transport: String,
}

impl EndpointService {
    pub fn authority(&self) -> String {
        format!("{}:{}", self.endpoint, self.port)
    }

    fn is_websocket_for(&self, data_format: &str) -> bool {
        self.transport == "websocket" && self.data_format.iter().any(|f| f == data_format)
    }
}

/// Parsed discovery response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiscoveryDocument {
    pub services: Vec<EndpointService>,
}

impl DiscoveryDocument {
    /// Reads the service list stored under the key matching `version`.
    pub fn parse(body: &Value, version: DiscoveryVersion) -> StreamingResult<Self> {
        let key = version.services_key();
        let services = body.get(key).ok_or_else(|| {
            StreamingError::Resolution(format!(
                "discovery document ({}) has no '{}' list",
                version, key
            ))
        })?;
        let services: Vec<EndpointService> = serde_json::from_value(services.clone())?;
        Ok(Self { services })
    }

    /// Returns the `host:port` authorities usable for `data_format`.
    ///
    /// With no preferred locations every WebSocket service is ranked by its number of
    /// locations and the best ranked ones are kept. For each preferred location a
    /// service deployed only in that location wins outright; otherwise services are
    /// ranked by how many of their locations start with the preferred tag.
    ///
    /// # Errors
    ///
    /// `StreamingError::Resolution` when no service matches the format, or when a
    /// preferred location matches nothing.
    pub fn websocket_authorities(
        &self,
        data_format: &str,
        locations: &[String],
    ) -> StreamingResult<Vec<String>> {
        let candidates: Vec<&EndpointService> = self
            .services
            .iter()
            .filter(|service| service.is_websocket_for(data_format))
            .collect();

        if candidates.is_empty() {
            return Err(StreamingError::Resolution(format!(
                "no websocket endpoint provides data format '{}'",
                data_format
            )));
        }

        let mut authorities: Vec<String> = Vec::new();
        if locations.is_empty() {
            authorities.extend(best_ranked(&candidates, |service| service.location.len())?);
        } else {
            for location in locations {
                let exact = candidates
                    .iter()
                    .find(|service| service.location.len() == 1 && service.location[0] == *location);
                let selected = match exact {
                    Some(service) => vec![service.authority()],
                    None => best_ranked(&candidates, |service| {
                        service
                            .location
                            .iter()
                            .filter(|tag| tag.starts_with(location.as_str()))
                            .count()
                    })
                    .map_err(|_| {
                        warn!("Location '{}' matches no discovered endpoint", location);
                        StreamingError::Resolution(format!(
                            "location '{}' is not a valid region",
                            location
                        ))
                    })?,
                };
                for authority in selected {
                    if !authorities.contains(&authority) {
                        authorities.push(authority);
                    }
                }
            }
        }

        debug!("Discovered websocket endpoints: {:?}", authorities);
        Ok(authorities)
    }
}

/// Authorities of the candidates sharing the highest non-zero rank.
fn best_ranked<F>(candidates: &[&EndpointService], rank: F) -> StreamingResult<Vec<String>>
where
    F: Fn(&EndpointService) -> usize,
{
    let mut ranked: Vec<(String, usize)> = Vec::new();
    for service in candidates {
        let authority = service.authority();
        let score = rank(*service);
        match ranked.iter_mut().find(|(known, _)| *known == authority) {
            Some(entry) => entry.1 = score,
            None => ranked.push((authority, score)),
        }
    }

    let best = ranked.iter().map(|(_, score)| *score).max().unwrap_or(0);
    if best == 0 {
        return Err(StreamingError::Resolution(
            "no discovered endpoint matches the requested locations".to_string(),
        ));
    }
    Ok(ranked
        .into_iter()
        .filter(|(_, score)| *score == best)
        .map(|(authority, _)| authority)
        .collect())
}

//! Expands configured machine addresses into one URL per backend instance.
//!
//! A hostname that resolves to several addresses (a Kubernetes headless
//! service, round-robin DNS) fans out into several machines. Only the host
//! changes; scheme, port and path are kept.

use std::net::IpAddr;

use serde::Serialize;
use tracing::{debug, warn};
use url::{Host, Url};

use crate::error::{BaristaError, Result};

/// An address that could not be turned into a machine endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ResolveFailure {
    pub address: String,
    pub reason: String,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct Resolution {
    pub endpoints: Vec<String>,
    pub failures: Vec<ResolveFailure>,
}

/// Resolves every base address in order.
///
/// In strict mode the first failure aborts; otherwise failed addresses are
/// logged and skipped.
pub async fn resolve_endpoints(bases: &[String], strict: bool) -> Result<Resolution> {
    let mut resolution = Resolution::default();

    for base in bases {
        debug!(address = %base, "resolving machine address");
        match resolve_one(base).await {
            Ok(endpoints) => {
                for endpoint in &endpoints {
                    debug!(address = %base, endpoint = %endpoint, "resolved");
                }
                resolution.endpoints.extend(endpoints);
            }
            Err(reason) if strict => {
                return Err(BaristaError::Resolve {
                    address: base.clone(),
                    reason,
                });
            }
            Err(reason) => {
                warn!(address = %base, %reason, "skipping unresolvable machine address");
                resolution.failures.push(ResolveFailure {
                    address: base.clone(),
                    reason,
                });
            }
        }
    }

    Ok(resolution)
}

async fn resolve_one(base: &str) -> std::result::Result<Vec<String>, String> {
    let url = Url::parse(base).map_err(|e| e.to_string())?;

    let ips = match url.host() {
        Some(Host::Ipv4(ip)) => vec![IpAddr::V4(ip)],
        Some(Host::Ipv6(ip)) => vec![IpAddr::V6(ip)],
        Some(Host::Domain(domain)) => {
            let port = url
                .port_or_known_default()
                .ok_or_else(|| format!("no port known for scheme {:?}", url.scheme()))?;
            let addrs = tokio::net::lookup_host((domain, port))
                .await
                .map_err(|e| e.to_string())?;
            addrs.map(|addr| addr.ip()).collect()
        }
        None => return Err("address has no host".to_string()),
    };

    let endpoints = expand(&url, &ips);
    if endpoints.is_empty() {
        return Err("resolved to no addresses".to_string());
    }
    Ok(endpoints)
}

/// One URL per distinct address, in lookup order.
fn expand(url: &Url, ips: &[IpAddr]) -> Vec<String> {
    let mut seen: Vec<IpAddr> = Vec::with_capacity(ips.len());
    let mut endpoints = Vec::with_capacity(ips.len());
    for ip in ips {
        if seen.contains(ip) {
            continue;
        }
        seen.push(*ip);

        let mut concrete = url.clone();
        if concrete.set_ip_host(*ip).is_err() {
            continue;
        }
        endpoints.push(concrete.as_str().trim_end_matches('/').to_string());
    }
    endpoints
}

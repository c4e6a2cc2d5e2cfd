//! Resolution of `/dnsaddr/` multiaddrs.
//!
//! The swarm's DNS transport resolves a dnsaddr to a single record;
//! symbolic forward targets need all of them. This walks the
//! `_dnsaddr.<domain>` TXT records itself, following nested dnsaddr
//! entries up to a fixed depth.

use std::collections::HashSet;

use hickory_resolver::config::{ResolverConfig, ResolverOpts};
use hickory_resolver::name_server::TokioConnectionProvider;
use hickory_resolver::TokioResolver;
use libp2p::multiaddr::Protocol;
use libp2p::Multiaddr;
use tracing::{debug, warn};

const MAX_RECURSION_DEPTH: usize = 10;

/// Errors from dnsaddr resolution.
#[derive(Debug, thiserror::Error)]
pub enum DnsResolveError {
    #[error("TXT lookup for {name} failed: {message}")]
    Lookup { name: String, message: String },

    #[error("dnsaddr recursion exceeded {MAX_RECURSION_DEPTH} levels")]
    RecursionLimit,
}

/// Whether the address contains a `/dnsaddr/` component.
pub(crate) fn is_dnsaddr(addr: &Multiaddr) -> bool {
    addr.iter().any(|p| matches!(p, Protocol::Dnsaddr(_)))
}

/// Resolve a `/dnsaddr/` multiaddr to its concrete address records.
///
/// A non-dnsaddr input is returned unchanged as a single record.
pub async fn resolve_dnsaddr(addr: &Multiaddr) -> Result<Vec<Multiaddr>, DnsResolveError> {
    if !is_dnsaddr(addr) {
        return Ok(vec![addr.clone()]);
    }
    let mut seen = HashSet::new();
    resolve_recursive(addr, &mut seen, 0).await
}

fn dnsaddr_domain(addr: &Multiaddr) -> Option<String> {
    addr.iter().find_map(|proto| match proto {
        Protocol::Dnsaddr(domain) => Some(domain.to_string()),
        _ => None,
    })
}

fn resolve_recursive<'a>(
    addr: &'a Multiaddr,
    seen: &'a mut HashSet<String>,
    depth: usize,
) -> futures::future::BoxFuture<'a, Result<Vec<Multiaddr>, DnsResolveError>> {
    Box::pin(async move {
        if depth > MAX_RECURSION_DEPTH {
            return Err(DnsResolveError::RecursionLimit);
        }

        let Some(domain) = dnsaddr_domain(addr) else {
            return Ok(vec![addr.clone()]);
        };

        let name = format!("_dnsaddr.{domain}");
        if !seen.insert(name.clone()) {
            debug!(%domain, "dnsaddr domain already visited");
            return Ok(Vec::new());
        }

        debug!(%name, "querying TXT records");
        let mut builder = TokioResolver::builder_with_config(
            ResolverConfig::default(),
            TokioConnectionProvider::default(),
        );
        *builder.options_mut() = ResolverOpts::default();
        let resolver = builder.build();
        let records = resolver
            .txt_lookup(&name)
            .await
            .map_err(|e| DnsResolveError::Lookup {
                name: name.clone(),
                message: e.to_string(),
            })?;

        let mut results = Vec::new();
        for record in records.iter() {
            for txt in record.txt_data() {
                let txt = String::from_utf8_lossy(txt);
                let Some(value) = txt.strip_prefix("dnsaddr=") else {
                    continue;
                };
                match value.parse::<Multiaddr>() {
                    Ok(resolved) => {
                        results.extend(resolve_recursive(&resolved, seen, depth + 1).await?);
                    }
                    Err(e) => {
                        warn!(%value, error = %e, "unparseable dnsaddr TXT record");
                    }
                }
            }
        }
        Ok(results)
    })
}

// relayscope/src/ssrf.rs
//
// SSRF-safe HTTP client construction.
//
// The probe target URL is user-supplied, so a hostname can be pointed (or
// re-pointed mid-detection) at loopback, RFC 1918 space, or a cloud metadata
// endpoint. Filtering happens at DNS resolution time: the custom resolver
// vets every address the lookup returns and the connection is then made to
// exactly those vetted addresses, which closes the rebinding TOCTOU gap
// while keeping hostname-based TLS SNI intact.
//
// hyper performs no DNS lookup for literal-IP URLs, so the resolver alone
// cannot veto http://127.0.0.1/ — ensure_public_host() covers that path and
// runs wherever a safe client is handed a target URL.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use reqwest::dns::{Addrs, Name, Resolve, Resolving};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

const METADATA_ENDPOINT: Ipv4Addr = Ipv4Addr::new(169, 254, 169, 254);

const BLOCKED_PRIVATE: &str = "connection to private IP blocked";
const BLOCKED_METADATA: &str = "connection to metadata endpoint blocked";

// ── Address classification ────────────────────────────────────────────────────

/// Why an address must not be dialed, or None if it is publicly routable.
pub fn blocked_reason(ip: IpAddr) -> Option<&'static str> {
    match ip.to_canonical() {
        IpAddr::V4(v4) => {
            if v4 == METADATA_ENDPOINT {
                return Some(BLOCKED_METADATA);
            }
            let linklocal_multicast = {
                let o = v4.octets();
                o[0] == 224 && o[1] == 0 && o[2] == 0
            };
            if v4.is_loopback()
                || v4.is_private()
                || v4.is_link_local()
                || linklocal_multicast
                || v4.is_unspecified()
            {
                return Some(BLOCKED_PRIVATE);
            }
            None
        }
        IpAddr::V6(v6) => {
            let seg0 = v6.segments()[0];
            let unique_local = (seg0 & 0xfe00) == 0xfc00; // fc00::/7
            let linklocal_unicast = (seg0 & 0xffc0) == 0xfe80; // fe80::/10
            let linklocal_multicast = (seg0 & 0xff0f) == 0xff02; // ff02::/16
            if v6.is_loopback()
                || v6.is_unspecified()
                || unique_local
                || linklocal_unicast
                || linklocal_multicast
            {
                return Some(BLOCKED_PRIVATE);
            }
            None
        }
    }
}

/// Reject a target URL whose host is a literal non-public IP. Hostnames pass
/// through here untouched; they are vetted at resolution time instead.
pub fn ensure_public_host(base_url: &str) -> Result<()> {
    let parsed = url::Url::parse(base_url).context("invalid URL format")?;
    match parsed.host() {
        Some(url::Host::Ipv4(v4)) => {
            if let Some(reason) = blocked_reason(IpAddr::V4(v4)) {
                bail!("{reason}");
            }
        }
        Some(url::Host::Ipv6(v6)) => {
            if let Some(reason) = blocked_reason(IpAddr::V6(v6)) {
                bail!("{reason}");
            }
        }
        _ => {}
    }
    Ok(())
}

// ── Guarded resolution ────────────────────────────────────────────────────────

async fn resolve_public(host: &str) -> std::io::Result<Vec<SocketAddr>> {
    let addrs: Vec<SocketAddr> = tokio::net::lookup_host((host, 0u16)).await?.collect();
    if addrs.is_empty() {
        return Err(std::io::Error::new(
            std::io::ErrorKind::NotFound,
            "DNS lookup returned no addresses",
        ));
    }
    // One blocked address poisons the whole set: a resolver answer mixing
    // public and private addresses is exactly what a rebinding attack
    // looks like.
    for addr in &addrs {
        if let Some(reason) = blocked_reason(addr.ip()) {
            return Err(std::io::Error::new(
                std::io::ErrorKind::PermissionDenied,
                reason,
            ));
        }
    }
    Ok(addrs)
}

/// DNS resolver that refuses to hand back loopback, private, link-local,
/// unspecified, or metadata addresses.
#[derive(Debug, Clone, Copy, Default)]
pub struct GuardedResolver;

impl Resolve for GuardedResolver {
    fn resolve(&self, name: Name) -> Resolving {
        let host = name.as_str().to_string();
        Box::pin(async move {
            let addrs = resolve_public(&host).await?;
            Ok(Box::new(addrs.into_iter()) as Addrs)
        })
    }
}

// ── Client construction ───────────────────────────────────────────────────────

/// Client whose every connection goes through the guarded resolver.
pub fn safe_client(timeout: Duration) -> Result<reqwest::Client> {
    reqwest::Client::builder()
        .timeout(timeout)
        .connect_timeout(CONNECT_TIMEOUT)
        .dns_resolver(Arc::new(GuardedResolver))
        .build()
        .context("failed to build HTTP client")
}

/// Unguarded client for admin-originated detections against internal URLs.
pub fn plain_client(timeout: Duration) -> Result<reqwest::Client> {
    reqwest::Client::builder()
        .timeout(timeout)
        .connect_timeout(CONNECT_TIMEOUT)
        .build()
        .context("failed to build HTTP client")
}

pub fn client_for(timeout: Duration, skip_ssrf_check: bool) -> Result<reqwest::Client> {
    if skip_ssrf_check {
        plain_client(timeout)
    } else {
        safe_client(timeout)
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv6Addr;

    fn v4(s: &str) -> IpAddr {
        IpAddr::V4(s.parse().unwrap())
    }

    fn v6(s: &str) -> IpAddr {
        IpAddr::V6(s.parse::<Ipv6Addr>().unwrap())
    }

    #[test]
    fn blocks_internal_v4_ranges() {
        for addr in ["127.0.0.1", "10.0.0.1", "172.16.5.4", "192.168.1.1", "169.254.1.1", "0.0.0.0", "224.0.0.5"] {
            assert_eq!(blocked_reason(v4(addr)), Some(BLOCKED_PRIVATE), "{addr}");
        }
    }

    #[test]
    fn metadata_endpoint_gets_its_own_reason() {
        assert_eq!(blocked_reason(v4("169.254.169.254")), Some(BLOCKED_METADATA));
    }

    #[test]
    fn blocks_internal_v6_ranges() {
        for addr in ["::1", "::", "fc00::1", "fd12:3456::1", "fe80::1", "ff02::1"] {
            assert_eq!(blocked_reason(v6(addr)), Some(BLOCKED_PRIVATE), "{addr}");
        }
        // 4-in-6 loopback canonicalizes to the v4 check
        assert_eq!(blocked_reason(v6("::ffff:127.0.0.1")), Some(BLOCKED_PRIVATE));
        assert_eq!(blocked_reason(v6("::ffff:169.254.169.254")), Some(BLOCKED_METADATA));
    }

    #[test]
    fn allows_public_addresses() {
        assert_eq!(blocked_reason(v4("8.8.8.8")), None);
        assert_eq!(blocked_reason(v4("1.1.1.1")), None);
        assert_eq!(blocked_reason(v6("2606:4700:4700::1111")), None);
    }

    #[test]
    fn literal_ip_urls_are_rejected() {
        assert!(ensure_public_host("http://127.0.0.1:8080/").is_err());
        assert!(ensure_public_host("http://169.254.169.254/latest/meta-data/").is_err());
        assert!(ensure_public_host("http://[::1]:9/").is_err());
        assert!(ensure_public_host("https://api.example.com/").is_ok());
    }

    #[tokio::test]
    async fn resolver_refuses_loopback_hostnames() {
        let err = resolve_public("localhost").await.unwrap_err();
        assert!(err.to_string().contains("private IP"), "{err}");
    }

    #[tokio::test]
    async fn safe_client_cannot_reach_loopback_hostname() {
        let client = safe_client(Duration::from_secs(5)).unwrap();
        let err = client
            .get("http://localhost:9/v1/messages")
            .send()
            .await
            .unwrap_err();
        let chain = format!("{err:?}");
        assert!(
            chain.contains("private IP") || chain.contains("metadata"),
            "expected SSRF block in error chain: {chain}"
        );
    }
}

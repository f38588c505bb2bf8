//! MX lookup via a blocking `hickory-resolver`, honoring the configured IPv4/IPv6 preference
//! when a domain's MXs resolve to multiple address families.

use crucible_base::{transient, Result};
use hickory_resolver::config::{ResolverConfig, ResolverOpts};
use hickory_resolver::Resolver;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum IpVerPref {
    PreferV4,
    PreferV6,
}

impl IpVerPref {
    pub const ALL: [IpVerPref; 2] = [IpVerPref::PreferV4, IpVerPref::PreferV6];

    pub fn as_str(&self) -> &'static str {
        match self {
            IpVerPref::PreferV4 => "prefer_v4",
            IpVerPref::PreferV6 => "prefer_v6",
        }
    }

    pub fn describe(&self) -> &'static str {
        match self {
            IpVerPref::PreferV4 => "connect over IPv4 when a host resolves to both families",
            IpVerPref::PreferV6 => "connect over IPv6 when a host resolves to both families",
        }
    }
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct MxHost {
    pub preference: u16,
    pub host: String,
}

pub struct MxResolver {
    resolver: Resolver,
}

impl MxResolver {
    pub fn new() -> Result<MxResolver> {
        let resolver = Resolver::new(ResolverConfig::default(), ResolverOpts::default())
            .map_err(|e| transient(format!("resolver init: {e}")))?;
        Ok(MxResolver { resolver })
    }

    /// Look up `domain`'s MX records, ascending by preference (lowest first); ties keep DNS
    /// answer order so round-robin within a preference tier is simple caller-side rotation.
    pub fn resolve_mx(&self, domain: &str) -> Result<Vec<MxHost>> {
        let lookup = self
            .resolver
            .mx_lookup(domain)
            .map_err(|e| transient(format!("MX lookup for {domain}: {e}")))?;
        let mut hosts: Vec<MxHost> = lookup
            .iter()
            .map(|mx| MxHost {
                preference: mx.preference(),
                host: mx.exchange().to_string().trim_end_matches('.').to_string(),
            })
            .collect();
        if hosts.is_empty() {
            // No MX record: RFC 5321 fallback is the domain's own address record.
            hosts.push(MxHost { preference: 0, host: domain.to_string() });
        }
        hosts.sort_by_key(|h| h.preference);
        Ok(hosts)
    }

    /// Resolve `host` to a connectable socket address, honoring `pref` when both families exist.
    pub fn resolve_addr(&self, host: &str, pref: IpVerPref) -> Result<std::net::IpAddr> {
        let response = self
            .resolver
            .lookup_ip(host)
            .map_err(|e| transient(format!("address lookup for {host}: {e}")))?;
        let mut v4 = None;
        let mut v6 = None;
        for ip in response.iter() {
            match ip {
                std::net::IpAddr::V4(_) if v4.is_none() => v4 = Some(ip),
                std::net::IpAddr::V6(_) if v6.is_none() => v6 = Some(ip),
                _ => {}
            }
        }
        let chosen = match pref {
            IpVerPref::PreferV4 => v4.or(v6),
            IpVerPref::PreferV6 => v6.or(v4),
        };
        chosen.ok_or_else(|| transient(format!("no usable address for {host}")))
    }
}

/// Rotates MXs of equal preference round-robin across successive calls, trying lowest
/// preference first as the outer loop.
pub fn mx_connect_order(hosts: &[MxHost], rotation: usize) -> Vec<&MxHost> {
    let mut tiers: Vec<(u16, Vec<&MxHost>)> = Vec::new();
    for h in hosts {
        match tiers.last_mut() {
            Some((pref, group)) if *pref == h.preference => group.push(h),
            _ => tiers.push((h.preference, vec![h])),
        }
    }
    let mut order = Vec::with_capacity(hosts.len());
    for (_, mut group) in tiers {
        if !group.is_empty() {
            group.rotate_left(rotation % group.len());
        }
        order.extend(group);
    }
    order
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn connect_order_tries_lowest_preference_first() {
        let hosts = vec![
            MxHost { preference: 20, host: "b.example.com".into() },
            MxHost { preference: 10, host: "a.example.com".into() },
            MxHost { preference: 10, host: "a2.example.com".into() },
        ];
        let order = mx_connect_order(&hosts, 0);
        assert_eq!(order[0].host, "a.example.com");
        assert_eq!(order[1].host, "a2.example.com");
        assert_eq!(order[2].host, "b.example.com");
    }

    #[test]
    fn round_robins_within_a_preference_tier() {
        let hosts = vec![
            MxHost { preference: 10, host: "a.example.com".into() },
            MxHost { preference: 10, host: "a2.example.com".into() },
        ];
        let order = mx_connect_order(&hosts, 1);
        assert_eq!(order[0].host, "a2.example.com");
        assert_eq!(order[1].host, "a.example.com");
    }
}

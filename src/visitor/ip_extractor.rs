//! Client IP extraction from HTTP headers with trust validation
//!
//! - Cloudflare mode reads `CF-Connecting-IP`
//! - Standard mode walks the `Forwarded` (preferred) or `X-Forwarded-For` chain from the
//!   right, skipping hops that are configured as trusted proxies
//! - Anything untrusted falls back to the socket address

use axum::http::HeaderMap;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use tracing::warn;

use crate::config::{TrustedProxyMode, VisitorConfig};

pub fn extract_client_ip(headers: &HeaderMap, socket_ip: IpAddr, config: &VisitorConfig) -> IpAddr {
    match config.trusted_proxy_mode {
        TrustedProxyMode::Cloudflare => extract_cloudflare_ip(headers).unwrap_or_else(|| {
            warn!("CF-Connecting-IP header missing in Cloudflare mode, using socket address");
            socket_ip
        }),
        TrustedProxyMode::Standard => {
            extract_standard_ip(headers, socket_ip, config).unwrap_or(socket_ip)
        }
        TrustedProxyMode::None => socket_ip,
    }
}

fn extract_cloudflare_ip(headers: &HeaderMap) -> Option<IpAddr> {
    headers
        .get("cf-connecting-ip")
        .and_then(|h| h.to_str().ok())
        .and_then(|s| s.trim().parse::<IpAddr>().ok())
}

fn is_trusted(ip: &IpAddr, config: &VisitorConfig) -> bool {
    config.trusted_proxies.iter().any(|net| net.contains(ip))
}

fn extract_standard_ip(
    headers: &HeaderMap,
    socket_ip: IpAddr,
    config: &VisitorConfig,
) -> Option<IpAddr> {
    // A peer outside the trusted set may have forged the whole chain
    if !config.trusted_proxies.is_empty() && !is_trusted(&socket_ip, config) {
        return None;
    }

    let chain = forwarded_chain(headers).or_else(|| x_forwarded_for_chain(headers))?;
    select_from_chain(&chain, config)
}

/// `for=` values of an RFC 7239 Forwarded header, left to right
fn forwarded_chain(headers: &HeaderMap) -> Option<Vec<IpAddr>> {
    let forwarded = headers.get("forwarded")?.to_str().ok()?;

    let chain: Vec<IpAddr> = forwarded
        .split(',')
        .flat_map(|element| element.split(';'))
        .filter_map(|param| {
            let (name, value) = param.trim().split_once('=')?;
            if !name.eq_ignore_ascii_case("for") {
                return None;
            }
            parse_forwarded_node(value)
        })
        .collect();

    (!chain.is_empty()).then_some(chain)
}

/// Parse a Forwarded node such as `192.0.2.60`, `"192.0.2.60:4711"` or `"[2001:db8::1]:80"`
fn parse_forwarded_node(value: &str) -> Option<IpAddr> {
    let value = value.trim().trim_matches('"');
    if let Some(rest) = value.strip_prefix('[') {
        return rest.split(']').next()?.parse::<Ipv6Addr>().ok().map(IpAddr::V6);
    }
    if let Ok(ip) = value.parse::<IpAddr>() {
        return Some(ip);
    }
    value
        .rsplit_once(':')
        .and_then(|(host, _port)| host.parse::<Ipv4Addr>().ok())
        .map(IpAddr::V4)
}

fn x_forwarded_for_chain(headers: &HeaderMap) -> Option<Vec<IpAddr>> {
    let xff = headers.get("x-forwarded-for")?.to_str().ok()?;

    let chain: Vec<IpAddr> = xff
        .split(',')
        .filter_map(|s| s.trim().parse::<IpAddr>().ok())
        .collect();

    (!chain.is_empty()).then_some(chain)
}

fn select_from_chain(chain: &[IpAddr], config: &VisitorConfig) -> Option<IpAddr> {
    if let Some(num_trusted) = config.num_trusted_proxies {
        if chain.len() > num_trusted {
            return Some(chain[chain.len() - num_trusted - 1]);
        }
        // Not enough hops; the leftmost entry is the best guess
        return chain.first().copied();
    }

    if !config.trusted_proxies.is_empty() {
        return chain
            .iter()
            .rev()
            .find(|ip| !is_trusted(ip, config))
            .or_else(|| chain.first())
            .copied();
    }

    chain.last().copied()
}

/// Truncate an address to its network prefix: /24 for IPv4, /48 for IPv6.
pub fn anonymize_ip(ip: IpAddr) -> IpAddr {
    match ip {
        IpAddr::V4(addr) => {
            let [a, b, c, _] = addr.octets();
            IpAddr::V4(Ipv4Addr::new(a, b, c, 0))
        }
        IpAddr::V6(addr) => {
            let segments = addr.segments();
            IpAddr::V6(Ipv6Addr::new(
                segments[0],
                segments[1],
                segments[2],
                0,
                0,
                0,
                0,
                0,
            ))
        }
    }
}

//! Client IP extraction from HTTP headers with trust validation
//!
//! - `Cloudflare` trusts CF-Connecting-IP
//! - `Standard` reads the RFC 7239 Forwarded header, then X-Forwarded-For,
//!   walking the proxy chain right to left past trusted hops
//! - `None` always uses the socket remote address

use axum::http::HeaderMap;
use std::net::IpAddr;
use tracing::warn;

use crate::config::{TrustedProxyMode, VisitorConfig};

/// Extract the client IP address according to the trust configuration,
/// falling back to `socket_addr` whenever the headers cannot be used.
pub fn extract_client_ip(headers: &HeaderMap, socket_addr: IpAddr, config: &VisitorConfig) -> IpAddr {
    match config.trusted_proxy_mode {
        TrustedProxyMode::Cloudflare => extract_cloudflare_ip(headers).unwrap_or_else(|| {
            warn!("CF-Connecting-IP header missing in Cloudflare mode, using socket address");
            socket_addr
        }),
        TrustedProxyMode::Standard => extract_standard_ip(headers, config).unwrap_or(socket_addr),
        TrustedProxyMode::None => socket_addr,
    }
}

fn extract_cloudflare_ip(headers: &HeaderMap) -> Option<IpAddr> {
    headers
        .get("cf-connecting-ip")
        .and_then(|h| h.to_str().ok())
        .and_then(|s| s.trim().parse::<IpAddr>().ok())
}

fn extract_standard_ip(headers: &HeaderMap, config: &VisitorConfig) -> Option<IpAddr> {
    let forwarded = forwarded_chain(headers);
    if forwarded.iter().any(Option::is_some) {
        return select_client(&forwarded, config);
    }

    select_client(&x_forwarded_for_chain(headers), config)
}

/// One entry per hop of every Forwarded header, in order. Hops whose `for=`
/// is missing, `unknown` or obfuscated stay in the chain as `None`.
fn forwarded_chain(headers: &HeaderMap) -> Vec<Option<IpAddr>> {
    headers
        .get_all("forwarded")
        .iter()
        .filter_map(|h| h.to_str().ok())
        .flat_map(|value| value.split(','))
        .map(|element| {
            element.split(';').find_map(|param| {
                let (key, value) = param.trim().split_once('=')?;
                key.trim()
                    .eq_ignore_ascii_case("for")
                    .then(|| parse_forwarded_node(value.trim()))
            })?
        })
        .collect()
}

/// Parse a Forwarded node: `192.0.2.60`, `"192.0.2.60:8080"`, `"[2001:db8::1]:4711"`.
/// Obfuscated identifiers and `unknown` yield `None`.
fn parse_forwarded_node(value: &str) -> Option<IpAddr> {
    let value = value.trim_matches('"');

    if let Some(rest) = value.strip_prefix('[') {
        let (addr, _port) = rest.split_once(']')?;
        return addr.parse().ok();
    }

    if let Ok(ip) = value.parse::<IpAddr>() {
        return Some(ip);
    }

    // IPv4 with a port
    let (addr, _port) = value.rsplit_once(':')?;
    addr.parse::<std::net::Ipv4Addr>().ok().map(IpAddr::V4)
}

/// One entry per X-Forwarded-For hop; unparseable hops are kept as `None`
fn x_forwarded_for_chain(headers: &HeaderMap) -> Vec<Option<IpAddr>> {
    headers
        .get_all("x-forwarded-for")
        .iter()
        .filter_map(|h| h.to_str().ok())
        .filter(|value| !value.trim().is_empty())
        .flat_map(|value| value.split(','))
        .map(|s| s.trim().parse::<IpAddr>().ok())
        .collect()
}

/// Pick the client out of a proxy chain (leftmost = original client).
/// Landing on a placeholder hop yields `None`, so the socket address is used
/// instead of an address further left that the client could have forged.
fn select_client(chain: &[Option<IpAddr>], config: &VisitorConfig) -> Option<IpAddr> {
    if chain.is_empty() {
        return None;
    }

    // Skip a fixed number of trusted hops from the right
    if let Some(num_trusted) = config.num_trusted_proxies {
        if chain.len() > num_trusted {
            return chain[chain.len() - num_trusted - 1];
        }
        return chain.first().copied().flatten();
    }

    // Walk right to left until the first hop outside the trusted ranges
    if !config.trusted_proxies.is_empty() {
        let is_trusted = |hop: &Option<IpAddr>| match hop {
            Some(ip) => config.trusted_proxies.iter().any(|net| net.contains(ip)),
            None => false,
        };
        return match chain.iter().rev().find(|hop| !is_trusted(*hop)) {
            Some(hop) => *hop,
            None => chain.first().copied().flatten(),
        };
    }

    chain.last().copied().flatten()
}

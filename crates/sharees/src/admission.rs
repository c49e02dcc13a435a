use std::net::IpAddr;

/// Decides whether a WebSocket upgrade may proceed.
///
/// A listed `Origin` is always accepted. Anything else, including a missing
/// origin, is accepted only when the `Host` header names a loopback host,
/// which lets local tooling connect without a browser origin.
#[must_use]
pub fn is_origin_allowed(origin: Option<&str>, host: Option<&str>, allowed: &[String]) -> bool {
    if let Some(origin) = origin {
        let origin = origin.trim().trim_end_matches('/');
        if allowed.iter().any(|a| a.eq_ignore_ascii_case(origin)) {
            return true;
        }
    }
    host.is_some_and(is_loopback_host)
}

/// `true` for `localhost`, `127.0.0.0/8` and `::1`, with or without a port.
fn is_loopback_host(host: &str) -> bool {
    let name = strip_port(host.trim());
    if name.eq_ignore_ascii_case("localhost") {
        return true;
    }
    name.parse::<IpAddr>().is_ok_and(|ip| ip.is_loopback())
}

fn strip_port(host: &str) -> &str {
    if let Some(rest) = host.strip_prefix('[') {
        // [v6]:port
        return rest.split_once(']').map_or(rest, |(addr, _)| addr);
    }
    match host.split_once(':') {
        // a second colon means a bare IPv6 literal
        Some((name, port)) if !port.contains(':') => name,
        _ => host,
    }
}

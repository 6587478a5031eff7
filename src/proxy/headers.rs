use axum::http::{HeaderMap, HeaderValue};
use std::net::IpAddr;

use crate::constants::{HOP_HEADERS, X_FORWARDED_FOR};

/// Appends every header from `src` into `dst`, preserving multi-valued
/// headers instead of overwriting them.
pub fn copy_headers(dst: &mut HeaderMap, src: &HeaderMap) {
    for (name, value) in src {
        dst.append(name.clone(), value.clone());
    }
}

/// Strips connection-management headers that must not travel past a single
/// hop. "Connection" matters most: the upstream link should stay
/// persistent regardless of what the client asked for.
pub fn remove_hop_headers(headers: &mut HeaderMap) {
    for name in HOP_HEADERS.iter() {
        headers.remove(name);
    }
}

pub fn has_hop_headers(headers: &HeaderMap) -> bool {
    HOP_HEADERS.iter().any(|name| headers.contains_key(name))
}

/// Builds the X-Forwarded-For value for the outbound request. With
/// `trust_forward_header` the inbound chain is preserved and the client
/// address appended; otherwise the chain restarts at this proxy.
pub fn forwarded_for_chain(
    headers: &HeaderMap,
    client_ip: IpAddr,
    trust_forward_header: bool,
) -> String {
    if trust_forward_header {
        let prior: Vec<&str> = headers
            .get_all(&X_FORWARDED_FOR)
            .iter()
            .filter_map(|v| v.to_str().ok())
            .collect();
        if !prior.is_empty() {
            return format!("{}, {}", prior.join(", "), client_ip);
        }
    }
    client_ip.to_string()
}

pub fn set_forwarded_for(
    headers: &mut HeaderMap,
    client_ip: IpAddr,
    trust_forward_header: bool,
) {
    let chain = forwarded_for_chain(headers, client_ip, trust_forward_header);
    if let Ok(value) = HeaderValue::from_str(&chain) {
        headers.insert(&X_FORWARDED_FOR, value);
    }
}

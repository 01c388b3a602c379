//! Key generation for inbound rate limiting.

use axum::http::HeaderMap;

use crate::rate_limit_config::KeyScope;

/// Builds limiter keys from request metadata.
#[derive(Debug, Clone, Copy)]
pub struct KeyGenerator {
    scope: KeyScope,
}

impl KeyGenerator {
    pub fn new(scope: KeyScope) -> Self {
        Self { scope }
    }

    /// Limiter key for a client address on a (matched) route.
    pub fn generate_key(&self, client_ip: &str, route: &str) -> String {
        match self.scope {
            KeyScope::Ip => client_ip.to_string(),
            KeyScope::RouteWithIp => format!("{}{}", route_to_key_string(route), client_ip),
        }
    }

    /// Resolve the client IP from proxy headers, falling back to the peer address.
    pub fn extract_client_ip(headers: &HeaderMap, peer: Option<std::net::IpAddr>) -> String {
        if let Some(first) = headers
            .get("x-forwarded-for")
            .and_then(|v| v.to_str().ok())
            .and_then(|xff| xff.split(',').next())
            .map(str::trim)
            .filter(|ip| !ip.is_empty())
        {
            return first.to_string();
        }

        if let Some(real_ip) = headers
            .get("x-real-ip")
            .and_then(|v| v.to_str().ok())
            .map(str::trim)
            .filter(|ip| !ip.is_empty())
        {
            return real_ip.to_string();
        }

        peer.map(|ip| ip.to_string())
            .unwrap_or_else(|| "unknown".to_string())
    }
}

impl Default for KeyGenerator {
    fn default() -> Self {
        Self::new(KeyScope::Ip)
    }
}

/// `/v1/tarot/readings/:id` becomes `-v1-tarot-readings-_id`.
pub fn route_to_key_string(route: &str) -> String {
    route.replace('/', "-").replace(':', "_")
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;
    use std::net::{IpAddr, Ipv4Addr};

    #[test]
    fn test_ip_scope() {
        let generator = KeyGenerator::new(KeyScope::Ip);
        assert_eq!(generator.generate_key("192.168.1.1", "/v1/tarot/readings"), "192.168.1.1");
    }

    #[test]
    fn test_route_with_ip_scope() {
        let generator = KeyGenerator::new(KeyScope::RouteWithIp);
        let key = generator.generate_key("192.168.1.1", "/v1/tarot/readings/:id");
        assert_eq!(key, "-v1-tarot-readings-_id192.168.1.1");
    }

    #[test]
    fn test_extract_client_ip_with_forwarded_header() {
        let mut headers = HeaderMap::new();
        headers.insert("x-forwarded-for", HeaderValue::from_static("192.168.1.1, 10.0.0.1"));
        assert_eq!(KeyGenerator::extract_client_ip(&headers, None), "192.168.1.1");
    }

    #[test]
    fn test_extract_client_ip_with_real_ip_header() {
        let mut headers = HeaderMap::new();
        headers.insert("x-real-ip", HeaderValue::from_static("203.0.113.1"));
        assert_eq!(KeyGenerator::extract_client_ip(&headers, None), "203.0.113.1");
    }

    #[test]
    fn test_extract_client_ip_fallback() {
        let headers = HeaderMap::new();
        let peer = Some(IpAddr::V4(Ipv4Addr::new(10, 1, 2, 3)));
        assert_eq!(KeyGenerator::extract_client_ip(&headers, peer), "10.1.2.3");
        assert_eq!(KeyGenerator::extract_client_ip(&headers, None), "unknown");
    }
}

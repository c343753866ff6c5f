//! Static table of Klaviyo endpoints and their rate budgets
//!
//! Keys are `"METHOD:/path/"` with `{id}` placeholders left literal; the
//! limiter is keyed by this string, not by the concrete URL. Budgets follow
//! the published per-endpoint tiers: `burst` is requests per second, `steady`
//! is requests per minute.

/// One consumed endpoint with its rate budget and required scopes
#[derive(Debug, Clone, Copy)]
pub struct Endpoint {
    pub key: &'static str,
    /// Requests per second
    pub burst: u32,
    /// Requests per minute
    pub steady: u32,
    pub scopes: &'static [&'static str],
}

/// The closed set of endpoints this connector calls
pub const ENDPOINTS: &[Endpoint] = &[
    Endpoint {
        key: "GET:/events/",
        burst: 350,
        steady: 3500,
        scopes: &["events:read"],
    },
    Endpoint {
        key: "GET:/profiles/",
        burst: 75,
        steady: 700,
        scopes: &["profiles:read"],
    },
    Endpoint {
        key: "GET:/campaigns/",
        burst: 10,
        steady: 150,
        scopes: &["campaigns:read"],
    },
    Endpoint {
        key: "GET:/campaigns/{id}/campaign-messages/",
        burst: 10,
        steady: 150,
        scopes: &["campaigns:read"],
    },
    Endpoint {
        key: "GET:/campaigns/{id}/tags/",
        burst: 3,
        steady: 60,
        scopes: &["campaigns:read", "tags:read"],
    },
    Endpoint {
        key: "GET:/flows/",
        burst: 3,
        steady: 60,
        scopes: &["flows:read"],
    },
    Endpoint {
        key: "GET:/flows/{id}/flow-actions/",
        burst: 3,
        steady: 60,
        scopes: &["flows:read"],
    },
    Endpoint {
        key: "GET:/flows/{id}/tags/",
        burst: 3,
        steady: 60,
        scopes: &["flows:read", "tags:read"],
    },
    Endpoint {
        key: "GET:/flow-actions/{id}/flow-messages/",
        burst: 3,
        steady: 60,
        scopes: &["flows:read"],
    },
    Endpoint {
        key: "GET:/flow-messages/{id}/relationships/template/",
        burst: 3,
        steady: 60,
        scopes: &["flows:read", "templates:read"],
    },
    Endpoint {
        key: "GET:/templates/",
        burst: 10,
        steady: 150,
        scopes: &["templates:read"],
    },
    Endpoint {
        key: "GET:/metrics/",
        burst: 10,
        steady: 150,
        scopes: &["metrics:read"],
    },
];

/// Look up an endpoint by key
pub fn lookup(key: &str) -> Option<&'static Endpoint> {
    ENDPOINTS.iter().find(|e| e.key == key)
}

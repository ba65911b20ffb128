//! Per-request context carried through the protection pipeline.

use crate::clock::Clock;
use std::collections::HashMap;
use std::fmt::Write as _;
use std::net::{IpAddr, Ipv4Addr};

/// Immutable record describing one incoming request.
///
/// Built once at the pipeline entrance and never mutated afterwards. The
/// guard and every component read from it; per-stage results travel in their
/// own outcome structs, not here.
#[derive(Debug, Clone)]
pub struct ProtectionContext {
    request_id: String,
    ip: IpAddr,
    user_id: Option<String>,
    session_id: Option<String>,
    method: String,
    path: String,
    headers: Vec<(String, String)>,
    query: Vec<(String, String)>,
    content_length: Option<u64>,
    priority: Option<i32>,
    metadata: HashMap<String, String>,
    handler_id: Option<String>,
    received_at_millis: u64,
}

impl ProtectionContext {
    pub fn builder(method: impl Into<String>, path: impl Into<String>) -> ContextBuilder {
        ContextBuilder::new(method, path)
    }

    pub fn request_id(&self) -> &str {
        &self.request_id
    }

    pub fn ip(&self) -> IpAddr {
        self.ip
    }

    pub fn user_id(&self) -> Option<&str> {
        self.user_id.as_deref()
    }

    pub fn session_id(&self) -> Option<&str> {
        self.session_id.as_deref()
    }

    pub fn method(&self) -> &str {
        &self.method
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    /// Header value by case-insensitive name; names are stored lowercased.
    pub fn header(&self, name: &str) -> Option<&str> {
        let name = name.to_ascii_lowercase();
        self.headers.iter().find(|(k, _)| *k == name).map(|(_, v)| v.as_str())
    }

    pub fn headers(&self) -> &[(String, String)] {
        &self.headers
    }

    pub fn user_agent(&self) -> Option<&str> {
        self.header("user-agent")
    }

    pub fn query(&self) -> &[(String, String)] {
        &self.query
    }

    pub fn content_length(&self) -> Option<u64> {
        self.content_length
    }

    /// Priority as deserialised from the request body or framework layer.
    pub fn priority(&self) -> Option<i32> {
        self.priority
    }

    pub fn metadata(&self) -> &HashMap<String, String> {
        &self.metadata
    }

    /// Identifier of the routing handler this request resolved to, when the
    /// integration layer registered one.
    pub fn handler_id(&self) -> Option<&str> {
        self.handler_id.as_deref()
    }

    pub fn received_at_millis(&self) -> u64 {
        self.received_at_millis
    }

    /// Default identity key: user id when authenticated, caller IP otherwise.
    pub fn identity(&self) -> String {
        match &self.user_id {
            Some(user) => format!("user:{}", user),
            None => format!("ip:{}", self.ip),
        }
    }

    /// Default rate-limit key scope: identity plus method and path.
    pub fn route_scope(&self) -> String {
        format!("{}:{}:{}", self.identity(), self.method, self.path)
    }
}

/// Builder for [`ProtectionContext`]. Generates the request id at build time.
#[derive(Debug)]
pub struct ContextBuilder {
    ip: IpAddr,
    user_id: Option<String>,
    session_id: Option<String>,
    method: String,
    path: String,
    headers: Vec<(String, String)>,
    query: Vec<(String, String)>,
    content_length: Option<u64>,
    priority: Option<i32>,
    metadata: HashMap<String, String>,
    handler_id: Option<String>,
    request_id: Option<String>,
}

impl ContextBuilder {
    fn new(method: impl Into<String>, path: impl Into<String>) -> Self {
        Self {
            ip: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            user_id: None,
            session_id: None,
            method: method.into().to_ascii_uppercase(),
            path: path.into(),
            headers: Vec::new(),
            query: Vec::new(),
            content_length: None,
            priority: None,
            metadata: HashMap::new(),
            handler_id: None,
            request_id: None,
        }
    }

    pub fn ip(mut self, ip: IpAddr) -> Self {
        self.ip = ip;
        self
    }

    pub fn user_id(mut self, user_id: impl Into<String>) -> Self {
        self.user_id = Some(user_id.into());
        self
    }

    pub fn session_id(mut self, session_id: impl Into<String>) -> Self {
        self.session_id = Some(session_id.into());
        self
    }

    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into().to_ascii_lowercase(), value.into()));
        self
    }

    pub fn query_param(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.query.push((name.into(), value.into()));
        self
    }

    pub fn content_length(mut self, length: u64) -> Self {
        self.content_length = Some(length);
        self
    }

    pub fn priority(mut self, priority: i32) -> Self {
        self.priority = Some(priority);
        self
    }

    pub fn metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    pub fn handler_id(mut self, id: impl Into<String>) -> Self {
        self.handler_id = Some(id.into());
        self
    }

    /// Override the generated request id. Intended for tests and for
    /// integrations that propagate an upstream id.
    pub fn request_id(mut self, id: impl Into<String>) -> Self {
        self.request_id = Some(id.into());
        self
    }

    pub fn build(self, clock: &dyn Clock) -> ProtectionContext {
        let now = clock.now_millis();
        ProtectionContext {
            request_id: self.request_id.unwrap_or_else(|| generate_request_id(now)),
            ip: self.ip,
            user_id: self.user_id,
            session_id: self.session_id,
            method: self.method,
            path: self.path,
            headers: self.headers,
            query: self.query,
            content_length: self.content_length,
            priority: self.priority,
            metadata: self.metadata,
            handler_id: self.handler_id,
            received_at_millis: now,
        }
    }
}

/// 16 random bytes plus the arrival timestamp, hex encoded.
fn generate_request_id(now_millis: u64) -> String {
    use rand::Rng;

    let mut bytes = [0u8; 16];
    rand::rng().fill(&mut bytes[..]);
    let mut id = String::with_capacity(44);
    for b in bytes {
        let _ = write!(id, "{:02x}", b);
    }
    let _ = write!(id, "{:012x}", now_millis);
    id
}

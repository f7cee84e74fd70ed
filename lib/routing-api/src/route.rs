//! Route entries and their identifiers

use crate::{Result, RoutingError};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

/// Longest time-to-live a client may register an entry with (seconds)
pub const MAX_TTL_SECONDS: u32 = 120;

/// Identifier of a route entry: the route plus the destination address
///
/// The textual form is `<route>|<ip>:<port>`, e.g. `web.example.com|10.0.0.1:8080`.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct RouteId {
    pub route: String,
    pub ip: String,
    pub port: u16,
}

impl RouteId {
    pub fn new(route: impl Into<String>, ip: impl Into<String>, port: u16) -> Self {
        Self {
            route: route.into(),
            ip: ip.into(),
            port,
        }
    }

    /// Destination address as `ip:port`
    pub fn address(&self) -> String {
        format!("{}:{}", self.ip, self.port)
    }
}

impl fmt::Display for RouteId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}|{}:{}", self.route, self.ip, self.port)
    }
}

impl FromStr for RouteId {
    type Err = RoutingError;

    fn from_str(s: &str) -> Result<Self> {
        let invalid = || RoutingError::ProcessRequest(format!("invalid route identifier: {}", s));

        let (route, address) = s.rsplit_once('|').ok_or_else(invalid)?;
        let (ip, port) = address.rsplit_once(':').ok_or_else(invalid)?;
        let port = port.parse::<u16>().map_err(|_| invalid())?;

        if route.is_empty() || ip.is_empty() {
            return Err(invalid());
        }

        Ok(RouteId::new(route, ip, port))
    }
}

/// A routable endpoint registered by a client
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RouteEntry {
    /// Host and optional path, e.g. "web.example.com/api"
    pub route: String,

    /// Destination IP
    pub ip: String,

    /// Destination port
    pub port: u16,

    /// Route service URL requests are forwarded through
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub route_service_url: Option<String>,

    /// Time-to-live in seconds; `None` registers a permanent entry
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ttl: Option<u32>,

    /// Owner / log identifier of the registering application
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub log_guid: Option<String>,

    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub annotations: BTreeMap<String, String>,

    /// Incremented by the store on every successful mutation
    #[serde(default)]
    pub revision: u64,
}

impl RouteEntry {
    pub fn new(route: impl Into<String>, ip: impl Into<String>, port: u16) -> Self {
        Self {
            route: route.into(),
            ip: ip.into(),
            port,
            route_service_url: None,
            ttl: None,
            log_guid: None,
            annotations: BTreeMap::new(),
            revision: 0,
        }
    }

    pub fn with_ttl(mut self, ttl: u32) -> Self {
        self.ttl = Some(ttl);
        self
    }

    pub fn with_log_guid(mut self, log_guid: impl Into<String>) -> Self {
        self.log_guid = Some(log_guid.into());
        self
    }

    pub fn with_route_service_url(mut self, url: impl Into<String>) -> Self {
        self.route_service_url = Some(url.into());
        self
    }

    pub fn with_annotation(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.annotations.insert(key.into(), value.into());
        self
    }

    pub fn id(&self) -> RouteId {
        RouteId::new(self.route.clone(), self.ip.clone(), self.port)
    }

    pub fn ttl_duration(&self) -> Option<Duration> {
        self.ttl.map(|secs| Duration::from_secs(u64::from(secs)))
    }

    /// Reject entries no backend may store
    pub fn validate(&self) -> Result<()> {
        if self.route.is_empty() {
            return Err(RoutingError::ProcessRequest("route must not be empty".into()));
        }
        if self.route.contains('|') {
            return Err(RoutingError::ProcessRequest(format!(
                "route must not contain '|': {}",
                self.route
            )));
        }
        if self.ip.is_empty() {
            return Err(RoutingError::ProcessRequest("ip must not be empty".into()));
        }
        if self.port == 0 {
            return Err(RoutingError::ProcessRequest("port must be non-zero".into()));
        }
        match self.ttl {
            Some(0) => Err(RoutingError::ProcessRequest("ttl must be at least 1 second".into())),
            Some(ttl) if ttl > MAX_TTL_SECONDS => Err(RoutingError::ProcessRequest(format!(
                "ttl {} exceeds maximum of {} seconds",
                ttl, MAX_TTL_SECONDS
            ))),
            _ => Ok(()),
        }
    }

    fn sort_key(&self) -> (&str, &str, u16) {
        (&self.route, &self.ip, self.port)
    }
}

/// Selection criteria for listing entries
///
/// Results are always ordered by identifier, so a listing can be resumed by
/// passing the last identifier seen as `after`.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RouteFilter {
    pub route_prefix: Option<String>,
    pub log_guid: Option<String>,
    pub after: Option<RouteId>,
    pub limit: Option<usize>,
}

impl RouteFilter {
    pub fn all() -> Self {
        Self::default()
    }

    pub fn with_route_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.route_prefix = Some(prefix.into());
        self
    }

    pub fn owned_by(mut self, log_guid: impl Into<String>) -> Self {
        self.log_guid = Some(log_guid.into());
        self
    }

    pub fn after(mut self, id: RouteId) -> Self {
        self.after = Some(id);
        self
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn matches(&self, entry: &RouteEntry) -> bool {
        if let Some(prefix) = &self.route_prefix {
            if !entry.route.starts_with(prefix.as_str()) {
                return false;
            }
        }
        if let Some(guid) = &self.log_guid {
            if entry.log_guid.as_deref() != Some(guid.as_str()) {
                return false;
            }
        }
        if let Some(after) = &self.after {
            if entry.sort_key() <= (after.route.as_str(), after.ip.as_str(), after.port) {
                return false;
            }
        }
        true
    }

    /// Filter, order and truncate a set of entries fetched from a backend
    pub fn apply(&self, entries: Vec<RouteEntry>) -> Vec<RouteEntry> {
        let mut selected: Vec<RouteEntry> =
            entries.into_iter().filter(|e| self.matches(e)).collect();
        selected.sort_by(|a, b| a.sort_key().cmp(&b.sort_key()));
        if let Some(limit) = self.limit {
            selected.truncate(limit);
        }
        selected
    }
}

use std::fmt;

/// The registration key a backend asks for, already classified into its
/// HTTP or TCP-tunnel variant at the RPC edge (§9 "Dynamic dispatch").
/// Proxy layers downstream receive this, never the raw string.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Pattern {
    Http(HttpPattern),
    Tcp { bind_port: u16 },
}

/// A parsed `[host/]path` pattern (§6): an optional host prefix (no slash
/// of its own) followed by a path that starts with `/`. `host` is `None`
/// for patterns with no host prefix, which match any `Host` header.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct HttpPattern {
    /// Verbatim wire string, e.g. "/a/" or "example.com/x". Kept around
    /// for routing-table keys and log lines.
    pub raw: String,
    pub host: Option<String>,
    pub path: String,
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum PatternParseError {
    #[error("\":tcp:\" pattern has an invalid or missing port: {0}")]
    InvalidTcpPort(String),
    #[error("pattern must be non-empty")]
    Empty,
    #[error("HTTP pattern {0:?} has no path component starting with '/'")]
    MissingPath(String),
}

pub const ACME_CHALLENGE_PATTERN: &str = "/.well-known/acme-challenge/";

impl Pattern {
    /// Parse the wire `pattern` string into its classified variant. This
    /// is the single point where `:tcp:<port>` sentinels are recognized;
    /// everything past the RPC edge deals only with `Pattern`.
    pub fn parse(raw: &str) -> Result<Self, PatternParseError> {
        if raw.is_empty() {
            return Err(PatternParseError::Empty);
        }
        if let Some(rest) = raw.strip_prefix(":tcp:") {
            let port: u16 = rest
                .parse()
                .map_err(|_| PatternParseError::InvalidTcpPort(raw.to_string()))?;
            return Ok(Pattern::Tcp { bind_port: port });
        }
        Ok(Pattern::Http(HttpPattern::parse(raw)?))
    }

    pub fn as_http(&self) -> Option<&HttpPattern> {
        match self {
            Pattern::Http(p) => Some(p),
            Pattern::Tcp { .. } => None,
        }
    }

    /// True for the exact ACME challenge path and for any prefix pattern
    /// that would cover it, host prefix notwithstanding: the webroot
    /// check in the HTTP proxy intercepts challenge requests ahead of any
    /// host-based routing (§3), so no pattern may claim that path on any
    /// host.
    pub fn is_reserved(&self) -> bool {
        match self {
            Pattern::Http(p) => {
                p.path == ACME_CHALLENGE_PATTERN
                    || (p.path.ends_with('/') && ACME_CHALLENGE_PATTERN.starts_with(p.path.as_str()))
            }
            Pattern::Tcp { .. } => false,
        }
    }
}

impl fmt::Display for Pattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Pattern::Http(p) => write!(f, "{}", p.raw),
            Pattern::Tcp { bind_port } => write!(f, ":tcp:{bind_port}"),
        }
    }
}

impl HttpPattern {
    /// Split `raw` into its optional host prefix and path at the first
    /// `/`. A pattern with no `/` at all has no path and is rejected:
    /// every HTTP pattern must carry a path starting with `/` (§6).
    pub fn parse(raw: &str) -> Result<Self, PatternParseError> {
        let slash = raw.find('/').ok_or_else(|| PatternParseError::MissingPath(raw.to_string()))?;
        let (host_part, path_part) = raw.split_at(slash);
        let host = if host_part.is_empty() { None } else { Some(host_part.to_string()) };
        Ok(HttpPattern { raw: raw.to_string(), host, path: path_part.to_string() })
    }

    fn path_prefix(&self) -> &str {
        self.path.strip_suffix('/').unwrap_or(&self.path)
    }

    fn host_matches(&self, host: Option<&str>) -> bool {
        match &self.host {
            None => true,
            Some(h) => host.map(|candidate| candidate.eq_ignore_ascii_case(h)).unwrap_or(false),
        }
    }

    /// Does `host`/`url_path` match this pattern per §4.2's longest-match
    /// rule? A host prefix, if present, must equal the request's `Host`
    /// header (port stripped by the caller); a pattern with no host
    /// prefix matches any host. Exact path patterns match only the
    /// identical path; prefix patterns (ending in `/`) match the prefix
    /// itself (for the redirect case) or anything beginning with it.
    pub fn matches(&self, host: Option<&str>, url_path: &str) -> bool {
        if !self.host_matches(host) {
            return false;
        }
        if self.path.ends_with('/') {
            url_path == self.path_prefix() || url_path.starts_with(self.path.as_str())
        } else {
            url_path == self.path
        }
    }

    /// True if redirecting `/foo` (no trailing slash) to `/foo/` applies:
    /// only for prefix patterns matched at their bare prefix on the right
    /// host.
    pub fn needs_redirect(&self, host: Option<&str>, url_path: &str) -> bool {
        self.host_matches(host) && self.path.ends_with('/') && url_path == self.path_prefix()
    }

    /// Pattern covering: an exact-match pattern (no trailing slash) and a
    /// prefix pattern (trailing slash) "cover" each other when the exact
    /// pattern's path falls under the prefix's subtree *and* they scope
    /// the same host — routing would have to pick one arbitrarily for
    /// that exact path. A host-scoped pattern and a host-less pattern
    /// never cover each other even when their paths overlap: longest-
    /// pattern-match already resolves that case deterministically, the
    /// same way nested prefix subtrees do (S1). Two prefix patterns
    /// nested inside one another never cover either. Identical patterns
    /// never cover (handled by the caller as a replace, not a rejection).
    pub fn covers(&self, other: &HttpPattern) -> bool {
        if self.raw == other.raw {
            return false;
        }
        if !self.hosts_overlap(other) {
            return false;
        }
        if self.path.ends_with('/') && other.path.ends_with('/') {
            return false;
        }
        if self.path.ends_with('/') {
            return other.path.starts_with(self.path.as_str()) || other.path == self.path_prefix();
        }
        if other.path.ends_with('/') {
            return self.path.starts_with(other.path.as_str()) || self.path == other.path_prefix();
        }
        false
    }

    fn hosts_overlap(&self, other: &HttpPattern) -> bool {
        match (&self.host, &other.host) {
            (None, None) => true,
            (Some(a), Some(b)) => a.eq_ignore_ascii_case(b),
            _ => false,
        }
    }
}

use std::fmt;
use std::time::Duration;

/// Who may keep a copy of the response.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheMode {
    Public,
    Private,
    NoStore,
}

/// How an entry of a given age relates to a policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Freshness {
    Fresh,
    Stale,
    Expired,
}

/// Freshness window and stale-serving behaviour for one resource.
///
/// Policies are supplied by callers; the store and gateway only honour them.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CachePolicy {
    pub mode: CacheMode,
    pub max_age: Duration,
    pub stale_while_revalidate: Duration,
}

impl CachePolicy {
    /// One hour fresh, then servable stale for another 23 hours.
    pub const fn long() -> Self {
        Self::custom(Duration::from_secs(3600), Duration::from_secs(82_800))
    }

    /// One second fresh, nine more seconds stale.
    pub const fn short() -> Self {
        Self::custom(Duration::from_secs(1), Duration::from_secs(9))
    }

    /// Never read from or write to the shared store.
    pub const fn none() -> Self {
        Self {
            mode: CacheMode::NoStore,
            max_age: Duration::ZERO,
            stale_while_revalidate: Duration::ZERO,
        }
    }

    pub const fn custom(max_age: Duration, stale_while_revalidate: Duration) -> Self {
        Self {
            mode: CacheMode::Public,
            max_age,
            stale_while_revalidate,
        }
    }

    /// Only public responses go into the shared store.
    pub fn is_storable(&self) -> bool {
        self.mode == CacheMode::Public
    }

    pub fn allows_stale(&self) -> bool {
        self.is_storable() && !self.stale_while_revalidate.is_zero()
    }

    /// Total time an entry written under this policy remains usable at all.
    pub fn lifetime(&self) -> Duration {
        self.max_age.saturating_add(self.stale_while_revalidate)
    }

    pub fn freshness(&self, age: Duration) -> Freshness {
        if !self.is_storable() {
            Freshness::Expired
        } else if age <= self.max_age {
            Freshness::Fresh
        } else if age <= self.lifetime() {
            Freshness::Stale
        } else {
            Freshness::Expired
        }
    }

    /// Cache-Control header value for responses rendered under this policy.
    pub fn header_value(&self) -> String {
        match self.mode {
            CacheMode::NoStore => "no-store".to_string(),
            CacheMode::Public | CacheMode::Private => {
                let scope = if self.mode == CacheMode::Public {
                    "public"
                } else {
                    "private"
                };
                let mut value = format!("{scope}, max-age={}", self.max_age.as_secs());
                if !self.stale_while_revalidate.is_zero() {
                    value.push_str(&format!(
                        ", stale-while-revalidate={}",
                        self.stale_while_revalidate.as_secs()
                    ));
                }
                value
            }
        }
    }

    /// Parse a named strategy (`long`, `short`, `none`) or a Cache-Control
    /// style directive list. Returns `None` when nothing is recognised.
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_lowercase().as_str() {
            "long" => return Some(Self::long()),
            "short" => return Some(Self::short()),
            "none" => return Some(Self::none()),
            _ => {}
        }

        let mut policy = Self::custom(Duration::ZERO, Duration::ZERO);
        let mut s_maxage = None;
        let mut recognised = false;

        for directive in value.split(',').map(|s| s.trim().to_lowercase()) {
            let (name, arg) = match directive.split_once('=') {
                Some((name, arg)) => (name.trim(), Some(arg.trim())),
                None => (directive.as_str(), None),
            };
            match (name, arg) {
                ("no-store" | "no-cache", None) => return Some(Self::none()),
                ("private", None) => {
                    policy.mode = CacheMode::Private;
                    recognised = true;
                }
                ("public", None) => recognised = true,
                ("max-age" | "s-maxage" | "stale-while-revalidate", Some(arg)) => {
                    // A malformed number rejects the whole value.
                    let secs = Duration::from_secs(arg.parse::<u64>().ok()?);
                    match name {
                        "max-age" => policy.max_age = secs,
                        "s-maxage" => s_maxage = Some(secs),
                        _ => policy.stale_while_revalidate = secs,
                    }
                    recognised = true;
                }
                _ => {}
            }
        }

        // s-maxage takes precedence for shared caches
        if let Some(secs) = s_maxage {
            policy.max_age = secs;
        }

        recognised.then_some(policy)
    }
}

impl Default for CachePolicy {
    fn default() -> Self {
        Self::long()
    }
}

impl fmt::Display for CachePolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.header_value())
    }
}

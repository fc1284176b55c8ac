use std::borrow::Cow;

use dashmap::DashMap;

use crate::tabs::DataDomain;

/// Kind of operation whose results supersede each other
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct OperationClass(Cow<'static, str>);

impl OperationClass {
    pub const fn named(name: &'static str) -> Self {
        Self(Cow::Borrowed(name))
    }

    pub fn search() -> Self {
        Self::named("search")
    }

    /// Streaming analysis runs; the token doubles as the run id
    pub fn analysis() -> Self {
        Self::named("analysis")
    }

    pub fn history() -> Self {
        Self::named("history")
    }

    /// Tab activations; the newest one owns the tab panel
    pub fn tab_activation() -> Self {
        Self::named("tab-activation")
    }

    pub fn domain(domain: DataDomain) -> Self {
        Self(Cow::Owned(format!("domain:{domain}")))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for OperationClass {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Stamp minted when an operation starts
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct RequestToken {
    class: OperationClass,
    seq: u64,
}

impl RequestToken {
    pub fn class(&self) -> &OperationClass {
        &self.class
    }

    pub fn seq(&self) -> u64 {
        self.seq
    }
}

/// Per-class monotonic counters used to drop superseded results
#[derive(Debug, Default)]
pub struct TokenGuard {
    counters: DashMap<OperationClass, u64>,
}

impl TokenGuard {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start an operation; capture the token before the first `.await`
    pub fn begin(&self, class: OperationClass) -> RequestToken {
        let mut counter = self.counters.entry(class.clone()).or_insert(0);
        *counter += 1;
        RequestToken {
            class,
            seq: *counter,
        }
    }

    pub fn is_current(&self, token: &RequestToken) -> bool {
        self.current(&token.class) == token.seq
    }

    /// Invalidate whatever is in flight for `class` without starting new work
    pub fn cancel(&self, class: &OperationClass) {
        let mut counter = self.counters.entry(class.clone()).or_insert(0);
        *counter += 1;
        tracing::trace!(class = %class, seq = *counter, "token class cancelled");
    }

    pub fn current(&self, class: &OperationClass) -> u64 {
        self.counters.get(class).map_or(0, |counter| *counter)
    }
}

#[cfg(test)]
mod tests {
    use super::{OperationClass, TokenGuard};
    use crate::tabs::DataDomain;

    #[test]
    fn tokens_increase_per_class() {
        let guard = TokenGuard::new();
        let mut last = 0;
        for _ in 0..5 {
            let token = guard.begin(OperationClass::search());
            assert!(token.seq() > last);
            last = token.seq();
        }
        // other classes count independently
        assert_eq!(guard.begin(OperationClass::history()).seq(), 1);
    }

    #[test]
    fn newer_token_supersedes_older() {
        let guard = TokenGuard::new();
        let a = guard.begin(OperationClass::search());
        let b = guard.begin(OperationClass::search());
        assert!(!guard.is_current(&a));
        assert!(guard.is_current(&b));
    }

    #[test]
    fn cancel_invalidates_in_flight_token() {
        let guard = TokenGuard::new();
        let class = OperationClass::domain(DataDomain::News);
        let token = guard.begin(class.clone());
        guard.cancel(&class);
        assert!(!guard.is_current(&token));

        let next = guard.begin(class);
        assert!(next.seq() > token.seq() + 1);
        assert!(guard.is_current(&next));
    }

    #[test]
    fn domain_classes_are_distinct() {
        assert_ne!(
            OperationClass::domain(DataDomain::News),
            OperationClass::domain(DataDomain::TradingData)
        );
        assert_eq!(
            OperationClass::domain(DataDomain::News).as_str(),
            "domain:news"
        );
    }
}

//! The Address Validator (spec section 3): a mapping from `(network,
//! address)` to allow/deny, used to gate every guest-requested dial that
//! is not a [fixed dial](crate::config::Config::pinned_target).

/// One allow/deny rule: which networks it applies to, and which addresses
/// (exact match or prefix) it matches.
#[derive(Debug, Clone)]
pub struct Rule {
    /// Networks this rule applies to (`"tcp"`, `"tcp4"`, `"tcp6"`, ...).
    /// An empty list matches no network at all — section 9's resolution of
    /// the corresponding Open Question — rather than every network.
    pub networks: Vec<String>,
    /// Address or address-prefix this rule matches, e.g. `"10.0.0.0/8"` or
    /// an exact `"127.0.0.1:9050"`.
    pub address: String,
}

impl Rule {
    pub fn new(networks: impl IntoIterator<Item = impl Into<String>>, address: impl Into<String>) -> Self {
        Rule {
            networks: networks.into_iter().map(Into::into).collect(),
            address: address.into(),
        }
    }

    fn matches(&self, network: &str, address: &str) -> bool {
        if self.networks.is_empty() {
            return false;
        }
        if !self.networks.iter().any(|n| n == network) {
            return false;
        }
        address == self.address || address.starts_with(&self.address)
    }
}

/// Two validator policies (spec section 3):
/// - `CatchAll`: default allow, deny-list consulted.
/// - `Explicit`: default deny, allow-list consulted.
#[derive(Debug, Clone)]
pub enum AddressValidator {
    CatchAll { deny: Vec<Rule> },
    Explicit { allow: Vec<Rule> },
}

impl Default for AddressValidator {
    /// "If unset, all addresses are denied" (section 6) — modeled as an
    /// `Explicit` policy with an empty allow-list.
    fn default() -> Self {
        AddressValidator::Explicit { allow: vec![] }
    }
}

/// Validator outcome (spec section 3: "returns success, not-initialized,
/// or denied").
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    Allowed,
    Denied,
}

impl AddressValidator {
    pub fn catch_all(deny: Vec<Rule>) -> Self {
        AddressValidator::CatchAll { deny }
    }

    pub fn explicit(allow: Vec<Rule>) -> Self {
        AddressValidator::Explicit { allow }
    }

    /// Evaluates the policy and returns whether the dial is allowed.
    pub fn check(&self, network: &str, address: &str) -> bool {
        self.verdict(network, address) == Verdict::Allowed
    }

    pub fn verdict(&self, network: &str, address: &str) -> Verdict {
        match self {
            AddressValidator::CatchAll { deny } => {
                if deny.iter().any(|r| r.matches(network, address)) {
                    Verdict::Denied
                } else {
                    Verdict::Allowed
                }
            }
            AddressValidator::Explicit { allow } => {
                if allow.iter().any(|r| r.matches(network, address)) {
                    Verdict::Allowed
                } else {
                    Verdict::Denied
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn catch_all_denies_only_listed_rules() {
        let v = AddressValidator::catch_all(vec![Rule::new(["tcp"], "10.0.0.1:80")]);
        assert!(v.check("tcp", "127.0.0.1:80"));
        assert!(!v.check("tcp", "10.0.0.1:80"));
    }

    #[test]
    fn explicit_denies_by_default() {
        let v = AddressValidator::explicit(vec![Rule::new(["tcp"], "127.0.0.1:")]);
        assert!(v.check("tcp", "127.0.0.1:9050"));
        assert!(!v.check("tcp", "8.8.8.8:53"));
    }

    #[test]
    fn empty_networks_list_matches_nothing() {
        let v = AddressValidator::explicit(vec![Rule::new(Vec::<String>::new(), "127.0.0.1:9050")]);
        assert!(!v.check("tcp", "127.0.0.1:9050"));
    }
}

//! Conflict resolution between a requested binding and the current snapshot
//!
//! Ports belong to tokens forever while subdomains are first-come claims, so
//! the two kinds of clash are treated differently:
//! - subdomain held by another port: the request is rejected
//! - port held by another subdomain: the old binding is evicted

use crate::binding::Subdomain;
use crate::site_dir::SiteIndex;

/// Outcome of reconciling one request against the snapshot
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decision {
    /// First registration, or identical re-registration
    Accepted,
    /// The port currently serves `stale`; that binding must be removed first
    RebindRequired { stale: Subdomain },
    /// The subdomain is owned by `holder`
    Rejected { holder: u16 },
}

/// Decide what to do with `(port, subdomain)` given the current bindings
pub fn reconcile(index: &SiteIndex, port: u16, subdomain: &Subdomain) -> Decision {
    if let Some(holder) = index.port_for(subdomain) {
        if holder != port {
            return Decision::Rejected { holder };
        }
    }

    match index.subdomain_for(port) {
        Some(current) if current != subdomain => Decision::RebindRequired {
            stale: current.clone(),
        },
        _ => Decision::Accepted,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sub(s: &str) -> Subdomain {
        Subdomain::parse(s).unwrap()
    }

    fn index(bindings: &[(u16, &str)]) -> SiteIndex {
        let mut index = SiteIndex::new();
        for &(port, name) in bindings {
            index.insert(port, sub(name)).unwrap();
        }
        index
    }

    #[test]
    fn test_first_registration_accepted() {
        assert_eq!(reconcile(&index(&[]), 100, &sub("alice")), Decision::Accepted);
    }

    #[test]
    fn test_identical_registration_accepted() {
        let current = index(&[(100, "alice")]);
        assert_eq!(reconcile(&current, 100, &sub("alice")), Decision::Accepted);
    }

    #[test]
    fn test_subdomain_of_other_port_rejected() {
        let current = index(&[(100, "alice")]);
        assert_eq!(
            reconcile(&current, 101, &sub("alice")),
            Decision::Rejected { holder: 100 }
        );
    }

    #[test]
    fn test_new_subdomain_for_port_rebinds() {
        let current = index(&[(100, "alice")]);
        assert_eq!(
            reconcile(&current, 100, &sub("bob")),
            Decision::RebindRequired {
                stale: sub("alice")
            }
        );
    }

    #[test]
    fn test_rejection_checked_before_rebind() {
        // Port 100 wants bob, which port 101 already holds
        let current = index(&[(100, "alice"), (101, "bob")]);
        assert_eq!(
            reconcile(&current, 100, &sub("bob")),
            Decision::Rejected { holder: 101 }
        );
    }

    #[test]
    fn test_unrelated_bindings_ignored() {
        let current = index(&[(101, "bob"), (102, "carol")]);
        assert_eq!(reconcile(&current, 100, &sub("alice")), Decision::Accepted);
    }
}

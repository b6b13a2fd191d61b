use std::net::SocketAddr;

use parking_lot::RwLock;

use crate::membership::MemberList;

/// A caller-supplied override consulted before the hash-based ownership
/// decision.
///
/// Returning `Some(owned)` short-circuits the mapper; `None` falls through to
/// the next rule and finally the default assignment. This lets special keys
/// (e.g. data that must stay local) bypass the hash without touching the
/// mapper itself.
pub trait ResponsibilityRule: Send + Sync {
    fn evaluate(&self, resource_key: &str) -> Option<bool>;
}

impl<F> ResponsibilityRule for F
where
    F: Fn(&str) -> Option<bool> + Send + Sync,
{
    fn evaluate(&self, resource_key: &str) -> Option<bool> {
        (self)(resource_key)
    }
}

/// Deterministically assigns each resource key to exactly one cluster node.
///
/// Ownership is a pure function of (key, sorted member list): every node that
/// holds the same snapshot computes the same owner for every key, with no
/// coordination. Assignment uses rendezvous (highest-random-weight) hashing,
/// so a membership change only moves the keys whose winning node actually
/// joined or left.
pub struct ResponsibilityMapper {
    self_addr: SocketAddr,
    members: RwLock<MemberList>,
}

impl ResponsibilityMapper {
    pub fn new(self_addr: SocketAddr) -> Self {
        Self {
            self_addr,
            members: RwLock::new(MemberList::default()),
        }
    }

    /// Replaces the member snapshot wholesale.
    pub fn update(&self, members: MemberList) {
        *self.members.write() = members;
    }

    /// The snapshot assignments are currently computed against.
    pub fn members(&self) -> MemberList {
        self.members.read().clone()
    }

    pub fn self_addr(&self) -> SocketAddr {
        self.self_addr
    }

    /// The node responsible for `resource_key`, or `None` when the member
    /// list is empty (total partition from cluster info: nothing is owned,
    /// nothing panics).
    pub fn map_target(&self, resource_key: &str) -> Option<SocketAddr> {
        let members = self.members.read().clone();
        members
            .iter()
            .max_by_key(|member| (weight(resource_key, member.addr()), **member))
            .map(|member| member.addr())
    }

    /// Whether this node owns `resource_key`.
    pub fn responsible(&self, resource_key: &str) -> bool {
        self.map_target(resource_key) == Some(self.self_addr)
    }

    /// Ownership with caller-supplied overrides, evaluated in order before
    /// the hash decision.
    pub fn responsible_by_rule(
        &self,
        resource_key: &str,
        rules: &[&dyn ResponsibilityRule],
    ) -> bool {
        for rule in rules {
            if let Some(owned) = rule.evaluate(resource_key) {
                return owned;
            }
        }
        self.responsible(resource_key)
    }
}

fn weight(resource_key: &str, addr: SocketAddr) -> u32 {
    let mut hasher = crc32fast::Hasher::new();
    hasher.update(resource_key.as_bytes());
    hasher.update(b"@");
    hasher.update(addr.to_string().as_bytes());
    hasher.finalize()
}

use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;

use smallvec::SmallVec;
use tokio::sync::watch;

/// A single cluster node as seen by the replication engine.
///
/// Members order by address, which is what makes every node compute an
/// identical sorted list (and therefore identical ownership) without any
/// coordination.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Member {
    addr: SocketAddr,
}

impl Member {
    pub fn new(addr: SocketAddr) -> Self {
        Self { addr }
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }
}

impl From<SocketAddr> for Member {
    fn from(addr: SocketAddr) -> Self {
        Self { addr }
    }
}

impl fmt::Display for Member {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.addr.fmt(f)
    }
}

/// An immutable, sorted snapshot of the full cluster membership.
///
/// Snapshots are replaced wholesale on every membership change rather than
/// mutated in place, so readers never observe a partially updated list.
/// Cloning is cheap.
#[derive(Debug, Clone, Default)]
pub struct MemberList {
    members: Arc<Vec<Member>>,
}

impl MemberList {
    /// Builds a sorted, deduplicated snapshot from a set of addresses.
    pub fn from_members(addrs: impl IntoIterator<Item = SocketAddr>) -> Self {
        let mut members: Vec<Member> = addrs.into_iter().map(Member::new).collect();
        members.sort_unstable();
        members.dedup();
        Self {
            members: Arc::new(members),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    pub fn len(&self) -> usize {
        self.members.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Member> {
        self.members.iter()
    }

    pub fn contains(&self, addr: SocketAddr) -> bool {
        self.members.binary_search(&Member::new(addr)).is_ok()
    }

    /// Every member except the given local node.
    pub fn peers(&self, self_addr: SocketAddr) -> SmallVec<[Member; 4]> {
        self.members
            .iter()
            .filter(|member| member.addr != self_addr)
            .copied()
            .collect()
    }
}

/// The handle the surrounding membership system uses to feed cluster changes
/// into the engine.
///
/// The engine itself never discovers nodes; it consumes whatever ordered
/// snapshot the environment publishes here.
pub struct MemberView {
    tx: watch::Sender<MemberList>,
}

impl MemberView {
    /// Creates a view seeded with an initial member list, returning the
    /// receiver the protocol consumes.
    pub fn new(initial: MemberList) -> (Self, watch::Receiver<MemberList>) {
        let (tx, rx) = watch::channel(initial);
        (Self { tx }, rx)
    }

    /// Publishes a new membership snapshot.
    pub fn update(&self, addrs: impl IntoIterator<Item = SocketAddr>) {
        let _ = self.tx.send(MemberList::from_members(addrs));
    }

    /// The snapshot currently visible to the engine.
    pub fn snapshot(&self) -> MemberList {
        self.tx.borrow().clone()
    }
}

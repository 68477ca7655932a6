#![deny(clippy::as_conversions)]
use binrw::{BinRead, BinWrite};
use derive_more::Display;

mod net;
pub use self::net::*;

mod log;
pub use self::log::*;

mod peer;
pub use self::peer::*;

mod rpc;
pub use self::rpc::*;

/// Node Id
///
/// Unique within a cluster. On the wire `0` stands for "no node",
/// so it is never a valid id of an actual peer.
#[derive(
    Copy, Clone, Debug, Default, BinRead, BinWrite, PartialEq, Eq, PartialOrd, Ord, Hash, Display,
)]
#[br(big)]
#[bw(big)]
pub struct NodeId(pub u64);

impl NodeId {
    pub const BYTE_SIZE: usize = 8;

    pub fn is_none(self) -> bool {
        self.0 == 0
    }
}

/// Raft term (election id)
///
/// Term `0` is never used by an actual election, and messages
/// carrying it are treated as local.
#[derive(
    Copy, Clone, Debug, Default, BinRead, BinWrite, PartialEq, Eq, PartialOrd, Ord, Hash, Display,
)]
#[br(big)]
#[bw(big)]
pub struct TermId(pub u64);

impl TermId {
    pub const BYTE_SIZE: usize = 8;

    pub const LOCAL: TermId = TermId(0);

    #[must_use]
    pub fn next(self) -> Self {
        Self(self.0 + 1)
    }

    pub fn is_local(self) -> bool {
        self == Self::LOCAL
    }
}

#[test]
fn term_ordering() {
    assert!(TermId(1) < TermId(2));
    assert_eq!(TermId(1).next(), TermId(2));
    assert!(TermId::LOCAL.is_local());
    assert!(!TermId(3).is_local());
    assert!(NodeId(0).is_none());
    assert_eq!(NodeId(7).to_string(), "7");
}

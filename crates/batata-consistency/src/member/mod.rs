// Cluster membership integration
// Feeds host cluster member changes into every raft group

pub mod event;
pub mod gate;

pub use event::{MemberChangeEvent, MemberChangeNotifier};
pub use gate::{MembershipGate, PeerAdmission, ProbeState};

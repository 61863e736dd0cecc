//! Test support for macvtap components.
//!
//! - [`FakeLinks`]: an in-memory link table implementing `LinkManager`
//! - [`FakeLinkEvents`]: a controllable link notification source
//! - [`TestNetNs`]: a throwaway network namespace for privileged tests

mod links;
mod netns;

pub use links::{FakeLink, FakeLinkEvents, FakeLinks};
pub use netns::TestNetNs;

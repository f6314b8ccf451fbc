//! Shared test fixtures.

mod fake_device;
mod fixtures;
mod temp;

pub use fake_device::FakeThymio;
pub use fixtures::{DescriptorBuilder, HexImageBuilder, LayoutBuilder};
pub use temp::TestContext;

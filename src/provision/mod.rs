// Provisioning layer
// - provisioner.rs: resolution order and download transaction
// - error.rs: ProvisionError

pub mod error;
pub mod provisioner;

pub use error::ProvisionError;
pub use provisioner::{BinarySource, Provisioner, ResolvedBinary};

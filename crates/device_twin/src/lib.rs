pub mod device_twin;
pub mod domain;
pub mod mqtt;

pub use device_twin::*;
pub use domain::*;
pub use mqtt::*;

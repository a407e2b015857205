mod egress;
mod router;
mod topic;
mod transport;

pub use egress::*;
pub use router::*;
pub use topic::*;
pub use transport::*;

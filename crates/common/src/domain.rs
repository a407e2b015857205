mod action;
mod device;
mod device_model;
mod group;
mod health;
mod organization;
mod result;
mod setting;
mod user;

pub use action::*;
pub use device::*;
pub use device_model::*;
pub use group::*;
pub use health::*;
pub use organization::*;
pub use result::*;
pub use setting::*;
pub use user::*;

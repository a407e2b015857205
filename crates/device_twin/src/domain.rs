mod access;
mod action_dispatcher;
mod command_service;
mod group_service;
mod messages;
mod repositories;
mod required_snaps_reconciler;
mod twin_service;

pub use access::*;
pub use action_dispatcher::*;
pub use command_service::*;
pub use group_service::*;
pub use messages::*;
pub use repositories::*;
pub use required_snaps_reconciler::*;
pub use twin_service::*;

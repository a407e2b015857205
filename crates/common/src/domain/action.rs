use crate::domain::result::{DomainError, DomainResult};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Action codes exchanged with devices, in commands and in responses
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ActionKind {
    Ack,
    Conf,
    Device,
    Disable,
    Enable,
    Info,
    Install,
    List,
    Logs,
    Refresh,
    Remove,
    Revert,
    Restart,
    Server,
    Setconf,
    Snapshot,
    Start,
    Stop,
    Switch,
    Unregister,
    User,
}

impl ActionKind {
    pub const ALL: [ActionKind; 21] = [
        ActionKind::Ack,
        ActionKind::Conf,
        ActionKind::Device,
        ActionKind::Disable,
        ActionKind::Enable,
        ActionKind::Info,
        ActionKind::Install,
        ActionKind::List,
        ActionKind::Logs,
        ActionKind::Refresh,
        ActionKind::Remove,
        ActionKind::Revert,
        ActionKind::Restart,
        ActionKind::Server,
        ActionKind::Setconf,
        ActionKind::Snapshot,
        ActionKind::Start,
        ActionKind::Stop,
        ActionKind::Switch,
        ActionKind::Unregister,
        ActionKind::User,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ActionKind::Ack => "ack",
            ActionKind::Conf => "conf",
            ActionKind::Device => "device",
            ActionKind::Disable => "disable",
            ActionKind::Enable => "enable",
            ActionKind::Info => "info",
            ActionKind::Install => "install",
            ActionKind::List => "list",
            ActionKind::Logs => "logs",
            ActionKind::Refresh => "refresh",
            ActionKind::Remove => "remove",
            ActionKind::Revert => "revert",
            ActionKind::Restart => "restart",
            ActionKind::Server => "server",
            ActionKind::Setconf => "setconf",
            ActionKind::Snapshot => "snapshot",
            ActionKind::Start => "start",
            ActionKind::Stop => "stop",
            ActionKind::Switch => "switch",
            ActionKind::Unregister => "unregister",
            ActionKind::User => "user",
        }
    }
}

impl fmt::Display for ActionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ActionKind {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        ActionKind::ALL
            .iter()
            .find(|kind| kind.as_str() == s)
            .copied()
            .ok_or_else(|| DomainError::UnhandledAction(s.to_string()))
    }
}

/// Lifecycle status of an action-log row
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ActionStatus {
    Requested,
    Complete,
    Error,
}

impl ActionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ActionStatus::Requested => "requested",
            ActionStatus::Complete => "complete",
            ActionStatus::Error => "error",
        }
    }
}

impl FromStr for ActionStatus {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "requested" => Ok(ActionStatus::Requested),
            "complete" => Ok(ActionStatus::Complete),
            "error" => Ok(ActionStatus::Error),
            other => Err(DomainError::InvalidArgument(format!(
                "unknown action status: {}",
                other
            ))),
        }
    }
}

/// Action-log entry for a command sent to a device
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Action {
    pub action_id: String,
    pub org_id: String,
    pub device_id: String,
    pub action: ActionKind,
    pub status: ActionStatus,
    pub message: String,
    pub created: DateTime<Utc>,
    pub modified: DateTime<Utc>,
}

/// Input for recording a dispatched command
#[derive(Debug, Clone, PartialEq)]
pub struct CreateActionInput {
    pub action_id: String,
    pub org_id: String,
    pub device_id: String,
    pub action: ActionKind,
    pub status: ActionStatus,
    pub message: String,
}

/// Repository trait for the action log
#[cfg_attr(any(test, feature = "testing"), mockall::automock)]
#[async_trait]
pub trait ActionRepository: Send + Sync {
    /// Record an action. Fails with `ActionAlreadyExists` on a duplicate action id.
    async fn create_action(&self, input: CreateActionInput) -> DomainResult<Action>;

    /// Set the status and message of an action. Fails with `ActionNotFound`.
    async fn update_action(
        &self,
        action_id: &str,
        status: ActionStatus,
        message: &str,
    ) -> DomainResult<()>;

    /// Actions of a device, resolved by device id or serial, oldest `modified` first
    async fn list_actions_for_device(
        &self,
        org_id: &str,
        device_id_or_serial: &str,
    ) -> DomainResult<Vec<Action>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_action_kind_wire_strings() {
        assert_eq!("setconf".parse::<ActionKind>().unwrap(), ActionKind::Setconf);
        assert_eq!(
            serde_json::to_string(&ActionKind::Unregister).unwrap(),
            "\"unregister\""
        );
    }

    #[test]
    fn test_unknown_action_is_unhandled() {
        let result = "reboot".parse::<ActionKind>();
        assert!(matches!(result, Err(DomainError::UnhandledAction(a)) if a == "reboot"));
    }

    #[test]
    fn test_action_status_parse() {
        assert_eq!("complete".parse::<ActionStatus>().unwrap(), ActionStatus::Complete);
        assert!("done".parse::<ActionStatus>().is_err());
    }
}

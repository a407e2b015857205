use crate::domain::{ActionDispatcher, OrganizationAccess, SubscribeAction};
use common::domain::{Action, ActionKind, Actor, DomainError, DomainResult, ErrorKind, Scope};
use common::garde::validate_struct;
use garde::Validate;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, instrument};

/// Error codes of the user-visible response envelope
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ResponseCode {
    DeviceAuth,
    SnapInstall,
    SnapRemove,
    SnapUpdate,
    SnapServiceAction,
    SnapSnapshot,
    SnapConfig,
    SnapList,
    DeviceLogs,
    DeviceUser,
    DeviceUnregister,
    DeviceInfo,
    OrgUpdate,
    RegDevice,
    GroupUpdate,
}

impl ResponseCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ResponseCode::DeviceAuth => "DeviceAuth",
            ResponseCode::SnapInstall => "SnapInstall",
            ResponseCode::SnapRemove => "SnapRemove",
            ResponseCode::SnapUpdate => "SnapUpdate",
            ResponseCode::SnapServiceAction => "SnapServiceAction",
            ResponseCode::SnapSnapshot => "SnapSnapshot",
            ResponseCode::SnapConfig => "SnapConfig",
            ResponseCode::SnapList => "SnapList",
            ResponseCode::DeviceLogs => "DeviceLogs",
            ResponseCode::DeviceUser => "DeviceUser",
            ResponseCode::DeviceUnregister => "DeviceUnregister",
            ResponseCode::DeviceInfo => "DeviceInfo",
            ResponseCode::OrgUpdate => "OrgUpdate",
            ResponseCode::RegDevice => "RegDevice",
            ResponseCode::GroupUpdate => "GroupUpdate",
        }
    }
}

/// Response envelope: an empty code on success
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StandardResponse {
    pub code: String,
    pub message: String,
}

impl StandardResponse {
    pub fn ok(message: impl Into<String>) -> Self {
        Self {
            code: String::new(),
            message: message.into(),
        }
    }

    pub fn error(code: ResponseCode, message: impl Into<String>) -> Self {
        Self {
            code: code.as_str().to_string(),
            message: message.into(),
        }
    }

    pub fn is_ok(&self) -> bool {
        self.code.is_empty()
    }
}

/// Envelope for a command result. Access failures always carry `DeviceAuth`.
pub fn respond(code: ResponseCode, result: DomainResult<Action>) -> StandardResponse {
    match result {
        Ok(action) => StandardResponse::ok(action.action_id),
        Err(e) if e.kind() == ErrorKind::Unauthorized => {
            StandardResponse::error(ResponseCode::DeviceAuth, e.to_string())
        }
        Err(e) => StandardResponse::error(code, e.to_string()),
    }
}

/// Caller and addressed device of a command
#[derive(Debug, Clone, Validate)]
pub struct DeviceCommandRequest {
    #[garde(skip)]
    pub actor: Actor,
    #[garde(length(min = 1))]
    pub org_id: String,
    #[garde(length(min = 1))]
    pub device_id: String,
}

impl DeviceCommandRequest {
    pub fn new(actor: Actor, org_id: impl Into<String>, device_id: impl Into<String>) -> Self {
        Self {
            actor,
            org_id: org_id.into(),
            device_id: device_id.into(),
        }
    }
}

/// Body of a snap update; `data` is the target channel of a `switch`
#[derive(Debug, Clone, Default, Serialize, Deserialize, Validate)]
pub struct SnapUpdateBody {
    #[garde(length(min = 1))]
    pub data: String,
}

/// Services to act on; empty means every service of the snap
#[derive(Debug, Clone, Default, Serialize, Deserialize, Validate)]
pub struct SnapServiceBody {
    #[garde(inner(length(min = 1)))]
    #[serde(default)]
    pub services: Vec<String>,
}

/// Upload target for snapshots and log bundles
#[derive(Debug, Clone, Default, Serialize, Deserialize, Validate)]
pub struct UploadBody {
    #[garde(length(min = 1))]
    pub url: String,
}

/// Configuration document for `setconf`
#[derive(Debug, Clone, Default, Serialize, Deserialize, Validate)]
pub struct SnapConfigBody {
    #[garde(length(min = 1))]
    pub data: String,
}

/// User management on a device
#[derive(Debug, Clone, Default, Serialize, Deserialize, Validate)]
#[serde(default)]
pub struct DeviceUserBody {
    #[garde(custom(user_action))]
    pub action: String,
    #[garde(custom(required_for(&self.action, "create")))]
    pub email: String,
    #[garde(custom(required_for(&self.action, "remove")))]
    pub username: String,
    #[garde(skip)]
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub ssh_keys: Vec<String>,
    #[garde(skip)]
    pub force: bool,
}

fn user_action(value: &str, _: &()) -> garde::Result {
    match value {
        "create" | "remove" => Ok(()),
        _ => Err(garde::Error::new("must be 'create' or 'remove'")),
    }
}

fn required_for<'a>(
    action: &'a str,
    when: &'static str,
) -> impl FnOnce(&str, &()) -> garde::Result + 'a {
    move |value: &str, _: &()| {
        if action == when && value.is_empty() {
            return Err(garde::Error::new(format!("required for '{}'", when)));
        }
        Ok(())
    }
}

fn snap_update_kind(action: &str) -> DomainResult<ActionKind> {
    match action {
        "enable" => Ok(ActionKind::Enable),
        "disable" => Ok(ActionKind::Disable),
        "refresh" => Ok(ActionKind::Refresh),
        "switch" => Ok(ActionKind::Switch),
        other => Err(DomainError::InvalidArgument(format!(
            "invalid snap update action: {}",
            other
        ))),
    }
}

fn service_action_kind(action: &str) -> DomainResult<ActionKind> {
    match action {
        "start" => Ok(ActionKind::Start),
        "stop" => Ok(ActionKind::Stop),
        "restart" => Ok(ActionKind::Restart),
        other => Err(DomainError::InvalidArgument(format!(
            "invalid service action: {}",
            other
        ))),
    }
}

fn require_snap(snap: &str) -> DomainResult<()> {
    if snap.trim().is_empty() {
        return Err(DomainError::InvalidArgument(
            "snap name cannot be empty".to_string(),
        ));
    }
    Ok(())
}

fn encode_body<T: Serialize>(body: &T) -> DomainResult<String> {
    serde_json::to_string(body).map_err(|e| DomainError::PayloadError(e.to_string()))
}

/// User-initiated commands to devices
pub struct CommandService {
    access: Arc<OrganizationAccess>,
    dispatcher: Arc<ActionDispatcher>,
}

impl CommandService {
    pub fn new(access: Arc<OrganizationAccess>, dispatcher: Arc<ActionDispatcher>) -> Self {
        Self { access, dispatcher }
    }

    /// Authorize the actor, resolve the device within the organization, then
    /// publish the command and record it as `requested`
    async fn send(
        &self,
        request: &DeviceCommandRequest,
        command: SubscribeAction,
    ) -> DomainResult<Action> {
        validate_struct(request)?;

        let organization = self
            .access
            .authorize(&request.actor, &request.org_id)
            .await?;
        let device = self
            .access
            .device_in_org(&organization.org_id, &request.device_id, Scope::Live)
            .await?;

        debug!(device_id = %device.device_id, action = %command.action, "sending command");
        self.dispatcher
            .dispatch(&device.org_id, &device.device_id, command)
            .await
    }

    #[instrument(skip(self, request), fields(org_id = %request.org_id, device_id = %request.device_id))]
    pub async fn snap_install(&self, request: DeviceCommandRequest, snap: &str) -> DomainResult<Action> {
        require_snap(snap)?;
        self.send(&request, SubscribeAction::new(ActionKind::Install).with_snap(snap))
            .await
    }

    #[instrument(skip(self, request), fields(org_id = %request.org_id, device_id = %request.device_id))]
    pub async fn snap_remove(&self, request: DeviceCommandRequest, snap: &str) -> DomainResult<Action> {
        require_snap(snap)?;
        self.send(&request, SubscribeAction::new(ActionKind::Remove).with_snap(snap))
            .await
    }

    /// `enable`, `disable` and `refresh` take no body; `switch` needs the
    /// target channel in `data`
    #[instrument(skip(self, request, body), fields(org_id = %request.org_id, device_id = %request.device_id))]
    pub async fn snap_update(
        &self,
        request: DeviceCommandRequest,
        snap: &str,
        action: &str,
        body: Option<SnapUpdateBody>,
    ) -> DomainResult<Action> {
        require_snap(snap)?;
        let kind = snap_update_kind(action)?;

        let mut command = SubscribeAction::new(kind).with_snap(snap);
        if kind == ActionKind::Switch {
            let body = body.ok_or_else(|| {
                DomainError::InvalidArgument("switch requires a channel in data".to_string())
            })?;
            validate_struct(&body)?;
            command = command.with_data(body.data);
        }

        self.send(&request, command).await
    }

    #[instrument(skip(self, request, body), fields(org_id = %request.org_id, device_id = %request.device_id))]
    pub async fn snap_service_action(
        &self,
        request: DeviceCommandRequest,
        snap: &str,
        action: &str,
        body: Option<SnapServiceBody>,
    ) -> DomainResult<Action> {
        require_snap(snap)?;
        let kind = service_action_kind(action)?;

        let services = body.unwrap_or_default();
        validate_struct(&services)?;
        let data = encode_body(&services.services)?;

        self.send(
            &request,
            SubscribeAction::new(kind).with_snap(snap).with_data(data),
        )
        .await
    }

    #[instrument(skip(self, request, body), fields(org_id = %request.org_id, device_id = %request.device_id))]
    pub async fn snap_snapshot(
        &self,
        request: DeviceCommandRequest,
        snap: &str,
        body: UploadBody,
    ) -> DomainResult<Action> {
        require_snap(snap)?;
        validate_struct(&body)?;
        self.send(
            &request,
            SubscribeAction::new(ActionKind::Snapshot)
                .with_snap(snap)
                .with_data(body.url),
        )
        .await
    }

    #[instrument(skip(self, request, body), fields(org_id = %request.org_id, device_id = %request.device_id))]
    pub async fn device_logs(&self, request: DeviceCommandRequest, body: UploadBody) -> DomainResult<Action> {
        validate_struct(&body)?;
        self.send(&request, SubscribeAction::new(ActionKind::Logs).with_data(body.url))
            .await
    }

    #[instrument(skip(self, request, body), fields(org_id = %request.org_id, device_id = %request.device_id))]
    pub async fn device_user(
        &self,
        request: DeviceCommandRequest,
        body: DeviceUserBody,
    ) -> DomainResult<Action> {
        validate_struct(&body)?;
        let data = encode_body(&body)?;
        self.send(&request, SubscribeAction::new(ActionKind::User).with_data(data))
            .await
    }

    #[instrument(skip(self, request), fields(org_id = %request.org_id, device_id = %request.device_id))]
    pub async fn snap_list(&self, request: DeviceCommandRequest) -> DomainResult<Action> {
        self.send(&request, SubscribeAction::new(ActionKind::List))
            .await
    }

    #[instrument(skip(self, request), fields(org_id = %request.org_id, device_id = %request.device_id))]
    pub async fn device_info(&self, request: DeviceCommandRequest) -> DomainResult<Action> {
        self.send(&request, SubscribeAction::new(ActionKind::Device))
            .await
    }

    #[instrument(skip(self, request), fields(org_id = %request.org_id, device_id = %request.device_id))]
    pub async fn device_version(&self, request: DeviceCommandRequest) -> DomainResult<Action> {
        self.send(&request, SubscribeAction::new(ActionKind::Server))
            .await
    }

    #[instrument(skip(self, request), fields(org_id = %request.org_id, device_id = %request.device_id))]
    pub async fn snap_config_get(&self, request: DeviceCommandRequest, snap: &str) -> DomainResult<Action> {
        require_snap(snap)?;
        self.send(&request, SubscribeAction::new(ActionKind::Conf).with_snap(snap))
            .await
    }

    #[instrument(skip(self, request, body), fields(org_id = %request.org_id, device_id = %request.device_id))]
    pub async fn snap_config_set(
        &self,
        request: DeviceCommandRequest,
        snap: &str,
        body: SnapConfigBody,
    ) -> DomainResult<Action> {
        require_snap(snap)?;
        validate_struct(&body)?;
        self.send(
            &request,
            SubscribeAction::new(ActionKind::Setconf)
                .with_snap(snap)
                .with_data(body.data),
        )
        .await
    }

    #[instrument(skip(self, request), fields(org_id = %request.org_id, device_id = %request.device_id))]
    pub async fn snap_revert(&self, request: DeviceCommandRequest, snap: &str) -> DomainResult<Action> {
        require_snap(snap)?;
        self.send(&request, SubscribeAction::new(ActionKind::Revert).with_snap(snap))
            .await
    }

    #[instrument(skip(self, request), fields(org_id = %request.org_id, device_id = %request.device_id))]
    pub async fn device_unregister(&self, request: DeviceCommandRequest) -> DomainResult<Action> {
        self.send(&request, SubscribeAction::new(ActionKind::Unregister))
            .await
    }
}

use thiserror::Error;

pub type DomainResult<T> = Result<T, DomainError>;

#[derive(Error, Debug)]
pub enum DomainError {
    #[error("Device not found: {0}")]
    DeviceNotFound(String),

    #[error("Device already exists: {0}")]
    DeviceAlreadyExists(String),

    #[error("Unknown device: {0}")]
    UnknownDevice(String),

    #[error("Organization not found: {0}")]
    OrganizationNotFound(String),

    #[error("Organization already exists: {0}")]
    OrganizationAlreadyExists(String),

    #[error("Group not found: {0}")]
    GroupNotFound(String),

    #[error("Group already exists: {0}")]
    GroupAlreadyExists(String),

    #[error("Action not found: {0}")]
    ActionNotFound(String),

    #[error("Action already exists: {0}")]
    ActionAlreadyExists(String),

    #[error("Unhandled action: {0}")]
    UnhandledAction(String),

    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Validation error: {0}")]
    ValidationError(String),

    #[error("Payload error: {0}")]
    PayloadError(String),

    #[error("Transport error: {0}")]
    TransportError(String),

    #[error("Repository error: {0}")]
    RepositoryError(#[from] anyhow::Error),
}

/// Coarse classification of a [`DomainError`], used by callers that only
/// care about the policy to apply (4xx mapping, discovery, retries).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    NotFound,
    AlreadyExists,
    Unauthorized,
    InvalidArgument,
    UnknownDevice,
    UnhandledAction,
    TransportError,
    StoreError,
}

impl DomainError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            DomainError::DeviceNotFound(_)
            | DomainError::OrganizationNotFound(_)
            | DomainError::GroupNotFound(_)
            | DomainError::ActionNotFound(_) => ErrorKind::NotFound,
            DomainError::DeviceAlreadyExists(_)
            | DomainError::OrganizationAlreadyExists(_)
            | DomainError::GroupAlreadyExists(_)
            | DomainError::ActionAlreadyExists(_) => ErrorKind::AlreadyExists,
            DomainError::Unauthorized(_) => ErrorKind::Unauthorized,
            DomainError::InvalidArgument(_)
            | DomainError::ValidationError(_)
            | DomainError::PayloadError(_) => ErrorKind::InvalidArgument,
            DomainError::UnknownDevice(_) => ErrorKind::UnknownDevice,
            DomainError::UnhandledAction(_) => ErrorKind::UnhandledAction,
            DomainError::TransportError(_) => ErrorKind::TransportError,
            DomainError::RepositoryError(_) => ErrorKind::StoreError,
        }
    }

    pub fn is_not_found(&self) -> bool {
        self.kind() == ErrorKind::NotFound
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validation_error_is_invalid_argument() {
        let err = DomainError::ValidationError("data: length is lower than 1".to_string());
        assert_eq!(err.kind(), ErrorKind::InvalidArgument);
    }

    #[test]
    fn test_repository_error_is_store_error() {
        let err = DomainError::RepositoryError(anyhow::anyhow!("connection reset"));
        assert_eq!(err.kind(), ErrorKind::StoreError);
        assert!(!err.is_not_found());
    }

    #[test]
    fn test_not_found_variants() {
        assert!(DomainError::DeviceNotFound("a111".to_string()).is_not_found());
        assert!(DomainError::GroupNotFound("g".to_string()).is_not_found());
        assert!(!DomainError::UnknownDevice("a111".to_string()).is_not_found());
    }
}

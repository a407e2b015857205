use crate::domain::DomainError;
use garde::{Report, Validate};

/// Validate a request body, mapping a garde report to `DomainError::ValidationError`
pub fn validate_struct<T>(value: &T) -> Result<(), DomainError>
where
    T: Validate,
    T::Context: Default,
{
    value
        .validate()
        .map_err(|report| DomainError::ValidationError(format_report(&report)))
}

/// Render a report as `path: message` pairs joined by `, `
fn format_report(report: &Report) -> String {
    report
        .iter()
        .map(|(path, error)| {
            let path = path.to_string();
            if path.is_empty() {
                error.message().to_string()
            } else {
                format!("{}: {}", path, error.message())
            }
        })
        .collect::<Vec<_>>()
        .join(", ")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::ErrorKind;

    #[derive(Validate)]
    struct UploadTarget {
        #[garde(length(min = 1))]
        url: String,
        #[garde(skip)]
        note: Option<String>,
    }

    #[test]
    fn test_valid_body_passes() {
        let body = UploadTarget {
            url: "https://bucket.example.com/upload".to_string(),
            note: None,
        };
        assert!(validate_struct(&body).is_ok());
    }

    #[test]
    fn test_empty_url_is_invalid_argument() {
        let body = UploadTarget {
            url: String::new(),
            note: Some("nightly".to_string()),
        };
        let err = validate_struct(&body).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidArgument);
        match err {
            DomainError::ValidationError(msg) => assert!(msg.contains("url")),
            other => panic!("expected ValidationError, got {:?}", other),
        }
    }
}

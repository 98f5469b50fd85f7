use serde::{Deserialize, Serialize};

use crate::codes::ErrorCode;

/// Error details carried by a failed [`ApiResult`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApiError {
    pub code: ErrorCode,
    pub message: String,
}

/// Errors that know their machine-readable code.
pub trait Coded: std::fmt::Display {
    fn code(&self) -> ErrorCode;
}

impl<E: Coded> From<&E> for ApiError {
    fn from(err: &E) -> Self {
        Self {
            code: err.code(),
            message: err.to_string(),
        }
    }
}

/// Tagged success/error result returned across the service boundary.
///
/// Serializes as `{"status":"success","data":...}` or
/// `{"status":"error","code":"...","message":"..."}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "lowercase")]
pub enum ApiResult<T> {
    Success { data: T },
    Error { code: ErrorCode, message: String },
}

impl<T> ApiResult<T> {
    pub fn success(data: T) -> Self {
        Self::Success { data }
    }

    pub fn error(code: ErrorCode, message: impl Into<String>) -> Self {
        Self::Error {
            code,
            message: message.into(),
        }
    }

    /// Converts an internal result, keeping the error's code and message.
    pub fn from_result<E: Coded>(result: Result<T, E>) -> Self {
        match result {
            Ok(data) => Self::success(data),
            Err(e) => {
                let err = ApiError::from(&e);
                Self::Error {
                    code: err.code,
                    message: err.message,
                }
            }
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success { .. })
    }

    /// Returns the error code, if this is an error.
    pub fn error_code(&self) -> Option<ErrorCode> {
        match self {
            Self::Success { .. } => None,
            Self::Error { code, .. } => Some(*code),
        }
    }

    pub fn data(&self) -> Option<&T> {
        match self {
            Self::Success { data } => Some(data),
            Self::Error { .. } => None,
        }
    }

    pub fn into_result(self) -> Result<T, ApiError> {
        match self {
            Self::Success { data } => Ok(data),
            Self::Error { code, message } => Err(ApiError { code, message }),
        }
    }
}

impl<T, E: Coded> From<Result<T, E>> for ApiResult<T> {
    fn from(result: Result<T, E>) -> Self {
        Self::from_result(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug)]
    struct Missing;

    impl std::fmt::Display for Missing {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            f.write_str("session not found: abc")
        }
    }

    impl Coded for Missing {
        fn code(&self) -> ErrorCode {
            ErrorCode::SessionNotFound
        }
    }

    #[test]
    fn success_is_tagged() {
        let res = ApiResult::success(serde_json::json!({"progress": 40}));
        let json = serde_json::to_string(&res).unwrap();
        assert_eq!(json, r#"{"status":"success","data":{"progress":40}}"#);
    }

    #[test]
    fn error_is_tagged() {
        let res: ApiResult<()> = ApiResult::from_result(Err(Missing));
        let json = serde_json::to_string(&res).unwrap();
        assert_eq!(
            json,
            r#"{"status":"error","code":"SESSION_NOT_FOUND","message":"session not found: abc"}"#
        );
        assert_eq!(res.error_code(), Some(ErrorCode::SessionNotFound));
        assert!(!res.is_success());
    }

    #[test]
    fn roundtrip_through_json() {
        let res: ApiResult<u32> = ApiResult::error(ErrorCode::IncompleteUpload, "2/5 chunks");
        let json = serde_json::to_string(&res).unwrap();
        let parsed: ApiResult<u32> = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, res);
        let err = parsed.into_result().unwrap_err();
        assert_eq!(err.code, ErrorCode::IncompleteUpload);
    }

    #[test]
    fn data_accessor() {
        let res: ApiResult<u32> = Ok::<u32, Missing>(7).into();
        assert_eq!(res.data(), Some(&7));
        assert!(res.error_code().is_none());
    }
}

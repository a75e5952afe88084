//! Structured, localized error bodies:
//! `{error, error_code, message, message_ar}`.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;

#[derive(Debug)]
pub struct ApiError {
    pub status: StatusCode,
    pub error_code: &'static str,
    pub message: String,
    pub message_ar: String,
}

impl ApiError {
    pub fn auth_required() -> Self {
        Self {
            status: StatusCode::UNAUTHORIZED,
            error_code: "AUTH_REQUIRED",
            message: "License key required".into(),
            message_ar: "يرجى إدخال مفتاح الاشتراك".into(),
        }
    }

    pub fn forbidden(reason_ar: String) -> Self {
        Self {
            status: StatusCode::FORBIDDEN,
            error_code: "LICENSE_INVALID",
            message: "License key rejected".into(),
            message_ar: reason_ar,
        }
    }

    pub fn not_found(resource: &str, resource_ar: &str) -> Self {
        Self {
            status: StatusCode::NOT_FOUND,
            error_code: "NOT_FOUND",
            message: format!("{} not found", resource),
            message_ar: format!("لم يتم العثور على {}", resource_ar),
        }
    }

    pub fn validation(message: &str, message_ar: &str) -> Self {
        Self {
            status: StatusCode::UNPROCESSABLE_ENTITY,
            error_code: "VALIDATION_ERROR",
            message: message.into(),
            message_ar: message_ar.into(),
        }
    }

    pub fn internal(message: String) -> Self {
        Self {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            error_code: "INTERNAL_ERROR",
            message,
            message_ar: "حدث خطأ غير متوقع".into(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = serde_json::json!({
            "error": true,
            "error_code": self.error_code,
            "message": self.message,
            "message_ar": self.message_ar,
        });
        (self.status, Json(body)).into_response()
    }
}

impl From<rasil_store::StoreError> for ApiError {
    fn from(e: rasil_store::StoreError) -> Self {
        ApiError::internal(e.to_string())
    }
}

impl From<rasil_dispatch::DispatchError> for ApiError {
    fn from(e: rasil_dispatch::DispatchError) -> Self {
        match e {
            rasil_dispatch::DispatchError::EditWindowExpired => ApiError::validation(
                "message can no longer be edited",
                "انتهت مهلة تعديل الرسالة (15 دقيقة)",
            ),
            rasil_dispatch::DispatchError::NotFound(_) => {
                ApiError::not_found("message", "الرسالة")
            }
            other => ApiError::internal(other.to_string()),
        }
    }
}

impl From<rasil_queue::QueueError> for ApiError {
    fn from(e: rasil_queue::QueueError) -> Self {
        ApiError::internal(e.to_string())
    }
}

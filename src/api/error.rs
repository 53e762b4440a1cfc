use rocket::http::Status;
use serde_json::json;

use crate::images::types::ParseParamError;
use crate::images::{ImageProxyError, ResolveError};

#[derive(Debug)]
pub enum ApiError {
    InvalidParameter(String),
    ImageError(ImageProxyError),
    ResolveError(ResolveError),
}

impl From<ParseParamError> for ApiError {
    fn from(error: ParseParamError) -> Self {
        ApiError::InvalidParameter(error.to_string())
    }
}

impl From<ImageProxyError> for ApiError {
    fn from(error: ImageProxyError) -> Self {
        ApiError::ImageError(error)
    }
}

impl From<ResolveError> for ApiError {
    fn from(error: ResolveError) -> Self {
        ApiError::ResolveError(error)
    }
}

impl ApiError {
    fn status_and_body(&self) -> (Status, serde_json::Value) {
        match self {
            ApiError::InvalidParameter(message) => (
                Status::BadRequest,
                json!({
                    "error": "Invalid parameter",
                    "message": message
                }),
            ),
            ApiError::ImageError(ImageProxyError::ForbiddenSource(url)) => (
                Status::Forbidden,
                json!({
                    "error": "Forbidden source",
                    "message": format!("Source '{}' is not an allowed origin", url)
                }),
            ),
            ApiError::ImageError(ImageProxyError::NetworkError(error)) => (
                Status::ServiceUnavailable,
                json!({
                    "error": "Image network error",
                    "message": error.to_string()
                }),
            ),
            ApiError::ImageError(ImageProxyError::ImageError(error)) => (
                Status::BadGateway,
                json!({
                    "error": "Image fetch error",
                    "message": error
                }),
            ),
            ApiError::ImageError(ImageProxyError::ConversionError(error)) => (
                Status::UnprocessableEntity,
                json!({
                    "error": "Image conversion error",
                    "message": error
                }),
            ),
            ApiError::ResolveError(error) => (
                Status::BadGateway,
                json!({
                    "error": "No backend available",
                    "message": error.to_string()
                }),
            ),
        }
    }
}

impl<'r> rocket::response::Responder<'r, 'static> for ApiError {
    fn respond_to(self, _: &'r rocket::Request<'_>) -> rocket::response::Result<'static> {
        let (status, body) = self.status_and_body();
        log::debug!("Responding {} to API error: {:?}", status, self);
        let body = body.to_string();

        rocket::Response::build()
            .status(status)
            .header(rocket::http::ContentType::JSON)
            .sized_body(body.len(), std::io::Cursor::new(body))
            .ok()
    }
}

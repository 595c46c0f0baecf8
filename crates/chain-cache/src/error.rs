// Chain Cache - freshness-bounded cache for upstream chain data
// Copyright (C) 2024 Zhuo Zhang and Wuqi Zhang
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU Affero General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See the
// GNU Affero General Public License for more details.
//
// You should have received a copy of the GNU Affero General Public License
// along with this program. If not, see <https://www.gnu.org/licenses/>.

//! Client-visible errors of the query surface

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use tracing::error;

/// Errors returned to HTTP clients, always as a JSON `{"error": ...}` body
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    /// Unknown or not yet populated key
    #[error("Key not found")]
    KeyNotFound,
    /// No route for the requested path
    #[error("Not found")]
    NotFound,
    /// Route exists but not for this method
    #[error("Method not allowed")]
    MethodNotAllowed,
    /// Request the route cannot act on, such as a WebSocket GET without upgrade
    #[error("{0}")]
    BadRequest(String),
    /// Anything that went wrong on our side
    #[error("Internal server error: {0}")]
    Internal(String),
}

impl ApiError {
    /// HTTP status for this error
    pub fn status(&self) -> StatusCode {
        match self {
            Self::KeyNotFound | Self::NotFound => StatusCode::NOT_FOUND,
            Self::MethodNotAllowed => StatusCode::METHOD_NOT_ALLOWED,
            Self::BadRequest(_) => StatusCode::BAD_REQUEST,
            Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl From<serde_json::Error> for ApiError {
    fn from(e: serde_json::Error) -> Self {
        Self::Internal(e.to_string())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        if let Self::Internal(reason) = &self {
            error!("Query failed: {}", reason);
        }
        (self.status(), Json(json!({ "error": self.to_string() }))).into_response()
    }
}

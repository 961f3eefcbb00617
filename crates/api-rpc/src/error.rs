//! RPC Error Types
//!
//! Maps application errors to JSON-RPC error codes.

use jsonrpsee::types::ErrorObjectOwned;
use vidforge_core::error::AppError;

/// RPC Error Codes
pub mod code {
    pub const VALIDATION_ERROR: i32 = 4000;
    pub const NOT_FOUND: i32 = 4001;
    pub const CONFLICT: i32 = 4002;
    pub const FORBIDDEN: i32 = 4003;
    pub const UNSUPPORTED: i32 = 4004;
    pub const INTERNAL_ERROR: i32 = 5000;
    pub const DB_ERROR: i32 = 5001;
    pub const SYSTEM_ERROR: i32 = 5002;
    pub const BROKER_ERROR: i32 = 5003;
}

/// Convert AppError to JSON-RPC ErrorObject
pub fn to_rpc_error(err: AppError) -> ErrorObjectOwned {
    let (code, msg) = match err {
        AppError::Validation(msg) => (code::VALIDATION_ERROR, msg),
        AppError::Domain(e) => (code::VALIDATION_ERROR, e.to_string()),
        AppError::Serialization(e) => (code::VALIDATION_ERROR, e.to_string()),
        AppError::NotFound(msg) => (code::NOT_FOUND, msg),
        AppError::InvalidState(msg) => (code::CONFLICT, msg),
        AppError::Forbidden(msg) => (code::FORBIDDEN, msg),
        AppError::Unsupported(msg) => (code::UNSUPPORTED, msg),
        AppError::Database(msg) => (code::DB_ERROR, msg),
        AppError::Broker(e) => (code::BROKER_ERROR, e.to_string()),
        AppError::Io(e) => (code::SYSTEM_ERROR, e.to_string()),
        AppError::Config(msg) | AppError::Internal(msg) => (code::INTERNAL_ERROR, msg),
    };
    ErrorObjectOwned::owned(code, msg, None::<()>)
}

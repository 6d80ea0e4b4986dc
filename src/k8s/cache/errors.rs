/**
 * Helper functions for creating the cache's error values
 */
use crate::error::Error;
use kube::error::ErrorResponse;

/// Create an `AlreadyStarted` error for a coordinator whose streams are running
#[must_use]
pub fn already_started_error(namespace: &str) -> Error {
    Error::Kube(kube::Error::Api(ErrorResponse {
        status: "AlreadyExists".to_string(),
        message: format!("watch for namespace {namespace} already started"),
        reason: "AlreadyStarted".to_string(),
        code: 409,
    }))
}

/// Create a `LockPoisoned` error for rwlock poisoning (indicates prior panic)
#[must_use]
pub fn lock_poisoned_error(message: &str) -> Error {
    Error::Kube(kube::Error::Api(ErrorResponse {
        status: "InternalError".to_string(),
        message: format!("{message} - this indicates a prior panic, cache contents may be inconsistent"),
        reason: "LockPoisoned".to_string(),
        code: 500,
    }))
}

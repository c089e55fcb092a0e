// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Mapping of AWS SDK failures onto the core error taxonomy.

use std::error::Error as StdError;
use std::fmt::Debug;

use aws_sdk_ecs::error::{DisplayErrorContext, ProvideErrorMetadata, SdkError};
use fargate_e2e::E2eError;

/// Error codes that mean "slow down and try again".
const THROTTLING_CODES: &[&str] = &[
    "Throttling",
    "ThrottlingException",
    "ThrottledException",
    "TooManyRequestsException",
    "RequestLimitExceeded",
    "RequestThrottled",
    "RequestThrottledException",
    "ServiceUnavailable",
    "ServiceUnavailableException",
    "InternalFailure",
    "InternalServerError",
    "ServerException",
];

/// Error codes that mean the handle, group, rule or queue does not exist.
const NOT_FOUND_CODES: &[&str] = &[
    "ResourceNotFoundException",
    "ExecutionDoesNotExist",
    "StateMachineDoesNotExist",
    "ClusterNotFoundException",
    "ServiceNotFoundException",
    "AWS.SimpleQueueService.NonExistentQueue",
    "QueueDoesNotExist",
];

pub fn is_throttling_code(code: &str) -> bool {
    THROTTLING_CODES.contains(&code)
}

pub fn is_not_found_code(code: &str) -> bool {
    NOT_FOUND_CODES.contains(&code)
}

/// Classify an SDK failure of `operation`.
///
/// Timeouts, dispatch failures, unparsable responses and throttling codes are
/// `Transient`; missing-resource codes are `NotFound`; anything else is a
/// non-retryable `Backend` error.
pub fn classify<E, R>(operation: &str, err: SdkError<E, R>) -> E2eError
where
    E: ProvideErrorMetadata + StdError + Send + Sync + 'static,
    R: Debug + Send + Sync + 'static,
{
    let message = format!("{}: {}", operation, DisplayErrorContext(&err));
    match &err {
        SdkError::TimeoutError(_) | SdkError::DispatchFailure(_) | SdkError::ResponseError(_) => {
            E2eError::Transient(message)
        }
        _ => match err.code() {
            Some(code) if is_throttling_code(code) => E2eError::Transient(message),
            Some(code) if is_not_found_code(code) => E2eError::NotFound(message),
            _ => E2eError::Backend(message),
        },
    }
}

/// Attach an operation name while converting SDK results.
pub(crate) trait SdkResultExt<T> {
    fn or_classify(self, operation: &str) -> fargate_e2e::Result<T>;
}

impl<T, E, R> SdkResultExt<T> for std::result::Result<T, SdkError<E, R>>
where
    E: ProvideErrorMetadata + StdError + Send + Sync + 'static,
    R: Debug + Send + Sync + 'static,
{
    fn or_classify(self, operation: &str) -> fargate_e2e::Result<T> {
        self.map_err(|err| classify(operation, err))
    }
}

/// A request builder rejected its own input (a required field is missing).
pub(crate) fn build_error(what: &str, err: impl std::fmt::Display) -> E2eError {
    E2eError::InvalidInput(format!("{}: {}", what, err))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_throttling_codes() {
        assert!(is_throttling_code("ThrottlingException"));
        assert!(is_throttling_code("TooManyRequestsException"));
        assert!(is_throttling_code("RequestLimitExceeded"));
        assert!(!is_throttling_code("AccessDeniedException"));
        assert!(!is_throttling_code("throttlingexception"));
    }

    #[test]
    fn test_not_found_codes() {
        assert!(is_not_found_code("ResourceNotFoundException"));
        assert!(is_not_found_code("ExecutionDoesNotExist"));
        assert!(is_not_found_code("AWS.SimpleQueueService.NonExistentQueue"));
        assert!(!is_not_found_code("InvalidParameterException"));
        assert!(!is_not_found_code("ThrottlingException"));
    }

    #[test]
    fn test_code_sets_are_disjoint() {
        for code in NOT_FOUND_CODES {
            assert!(!is_throttling_code(code), "{} in both sets", code);
        }
    }
}

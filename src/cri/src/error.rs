//! CRI-specific error conversions.

use std::time::Duration;

use berth_core::error::BerthError;
use http::header::{HeaderValue, RETRY_AFTER};
use http::{Response, StatusCode};
use hyper::Body;
use tonic::{Code, Status};

/// Convert a BerthError to a gRPC Status.
pub fn berth_error_to_status(err: BerthError) -> Status {
    match err {
        BerthError::TooManyInFlight => Status::resource_exhausted(err.to_string()),
        BerthError::NotFound(msg) => Status::not_found(msg),
        BerthError::InvalidArgument(msg) => Status::invalid_argument(msg),
        BerthError::Timeout(msg) => Status::deadline_exceeded(msg),
        other => Status::internal(other.to_string()),
    }
}

/// HTTP status answering a request that failed with `code`.
pub fn status_to_http(code: Code) -> StatusCode {
    match code {
        Code::InvalidArgument => StatusCode::BAD_REQUEST,
        Code::NotFound => StatusCode::NOT_FOUND,
        Code::ResourceExhausted => StatusCode::TOO_MANY_REQUESTS,
        Code::DeadlineExceeded => StatusCode::GATEWAY_TIMEOUT,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

/// Convert a BerthError to the HTTP response of a streaming endpoint.
///
/// `retry_after` is advertised on capacity errors; clients may retry once
/// the oldest pending token has expired.
pub fn berth_error_to_response(err: &BerthError, retry_after: Duration) -> Response<Body> {
    let status = match err {
        BerthError::NotFound(_) => StatusCode::NOT_FOUND,
        BerthError::TooManyInFlight => StatusCode::TOO_MANY_REQUESTS,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };
    let mut response = Response::new(Body::from(err.to_string()));
    *response.status_mut() = status;
    if status == StatusCode::TOO_MANY_REQUESTS {
        response.headers_mut().insert(
            RETRY_AFTER,
            HeaderValue::from(retry_after.as_secs()),
        );
    }
    response
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_too_many_in_flight_maps_to_resource_exhausted() {
        let status = berth_error_to_status(BerthError::TooManyInFlight);
        assert_eq!(status.code(), tonic::Code::ResourceExhausted);
    }

    #[test]
    fn test_not_found_maps_to_not_found() {
        let status = berth_error_to_status(BerthError::NotFound("token".to_string()));
        assert_eq!(status.code(), tonic::Code::NotFound);
        assert_eq!(status.message(), "token");
    }

    #[test]
    fn test_invalid_argument_maps_to_invalid_argument() {
        let status = berth_error_to_status(BerthError::InvalidArgument(
            "missing required pod_sandbox_id".to_string(),
        ));
        assert_eq!(status.code(), tonic::Code::InvalidArgument);
    }

    #[test]
    fn test_timeout_maps_to_deadline_exceeded() {
        let status = berth_error_to_status(BerthError::Timeout("timed out".to_string()));
        assert_eq!(status.code(), tonic::Code::DeadlineExceeded);
    }

    #[test]
    fn test_other_errors_map_to_internal() {
        let status = berth_error_to_status(BerthError::TokenGeneration("rng".to_string()));
        assert_eq!(status.code(), tonic::Code::Internal);
    }

    #[test]
    fn test_response_codes() {
        let ttl = Duration::from_secs(60);
        let not_found = berth_error_to_response(&BerthError::NotFound("x".into()), ttl);
        assert_eq!(not_found.status(), StatusCode::NOT_FOUND);
        assert!(not_found.headers().get(RETRY_AFTER).is_none());

        let busy = berth_error_to_response(&BerthError::TooManyInFlight, ttl);
        assert_eq!(busy.status(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(busy.headers()[RETRY_AFTER], "60");

        let internal = berth_error_to_response(&BerthError::Other("boom".into()), ttl);
        assert_eq!(internal.status(), StatusCode::INTERNAL_SERVER_ERROR);
    }

    #[test]
    fn test_status_codes_to_http() {
        assert_eq!(status_to_http(Code::InvalidArgument), StatusCode::BAD_REQUEST);
        assert_eq!(status_to_http(Code::ResourceExhausted), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(status_to_http(Code::Internal), StatusCode::INTERNAL_SERVER_ERROR);
    }
}

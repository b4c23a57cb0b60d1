//! Maps a raw probe result to the status taxonomy.

use tracing::debug;

use crate::adapters::{RawResult, SuccessCriterion};
use crate::vault::HealthStatus;

pub fn classify(raw: &RawResult, criterion: &SuccessCriterion) -> HealthStatus {
    let code = match (raw.succeeded, raw.http_status) {
        (true, Some(code)) => code,
        _ => return HealthStatus::Error,
    };

    match criterion {
        SuccessCriterion::Standard => match code {
            200 => HealthStatus::Ok,
            401 => HealthStatus::Expired,
            429 => HealthStatus::RateLimited,
            other => {
                debug!(status = other, "Unrecognized status code, classified as ERROR");
                HealthStatus::Error
            }
        },
        SuccessCriterion::StatusCodes(codes) if codes.contains(&code) => HealthStatus::Ok,
        SuccessCriterion::StatusCodes(_) => HealthStatus::Error,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn response(code: u16) -> RawResult {
        RawResult {
            succeeded: true,
            http_status: Some(code),
            body_or_error: String::new(),
            elapsed_ms: 3.0,
        }
    }

    #[test]
    fn test_standard_codes() {
        let standard = SuccessCriterion::Standard;
        assert_eq!(classify(&response(200), &standard), HealthStatus::Ok);
        assert_eq!(classify(&response(401), &standard), HealthStatus::Expired);
        assert_eq!(classify(&response(429), &standard), HealthStatus::RateLimited);
        for code in [201, 204, 403, 404, 500, 503] {
            assert_eq!(classify(&response(code), &standard), HealthStatus::Error, "code {}", code);
        }
    }

    #[test]
    fn test_transport_failure_is_error() {
        let raw = RawResult::transport_failure("connection refused".into(), 1.5);
        assert_eq!(classify(&raw, &SuccessCriterion::Standard), HealthStatus::Error);
        let codes = SuccessCriterion::StatusCodes([200].into_iter().collect());
        assert_eq!(classify(&raw, &codes), HealthStatus::Error);
    }

    #[test]
    fn test_custom_codes_have_no_finer_attribution() {
        let codes = SuccessCriterion::StatusCodes([200, 204].into_iter().collect());
        assert_eq!(classify(&response(204), &codes), HealthStatus::Ok);
        assert_eq!(classify(&response(401), &codes), HealthStatus::Error);
        assert_eq!(classify(&response(429), &codes), HealthStatus::Error);
    }
}

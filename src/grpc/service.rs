//! Admission service implementation.

use std::sync::Arc;
use tonic::{Request, Response, Status};
use tracing::{debug, info, instrument, warn};

use super::proto::gatekeeper::v1::{
    admission_server::Admission, DecideRequest, DecideResponse, GetModeRequest, GetModeResponse,
    GetOverrideRequest, GetOverrideResponse, SetModeRequest, SetModeResponse, SetOverrideRequest,
    SetOverrideResponse,
};

use crate::ratelimit::RateLimiter;

/// Implementation of the `gatekeeper.v1.Admission` gRPC interface.
pub struct AdmissionServiceImpl {
    /// The rate limiter instance
    rate_limiter: Arc<RateLimiter>,
    /// Limit applied when a request does not carry one
    default_limit: i64,
}

impl AdmissionServiceImpl {
    /// Create a new service answering with `rate_limiter`.
    pub fn new(rate_limiter: Arc<RateLimiter>, default_limit: i64) -> Self {
        Self {
            rate_limiter,
            default_limit,
        }
    }
}

fn require_identity(identity: &str) -> Result<(), Status> {
    if identity.is_empty() {
        warn!("Received request with empty identity");
        return Err(Status::invalid_argument("identity is required"));
    }
    Ok(())
}

#[tonic::async_trait]
impl Admission for AdmissionServiceImpl {
    /// Decide whether one request from an identity may proceed.
    #[instrument(
        skip(self, request),
        fields(
            identity = %request.get_ref().identity,
            default_limit = request.get_ref().default_limit
        )
    )]
    async fn decide(
        &self,
        request: Request<DecideRequest>,
    ) -> Result<Response<DecideResponse>, Status> {
        let req = request.into_inner();
        require_identity(&req.identity)?;

        // Zero is the proto default, i.e. the caller did not send a limit.
        let default_limit = if req.default_limit == 0 {
            self.default_limit
        } else {
            req.default_limit
        };

        let (allowed, limit) = self
            .rate_limiter
            .decide_with_limit(&req.identity, default_limit)
            .await;
        let effective_limit = limit.map_or(0, |l| i64::try_from(l).unwrap_or(i64::MAX));

        debug!(
            identity = %req.identity,
            allowed = allowed,
            effective_limit = effective_limit,
            "Admission decision made"
        );

        Ok(Response::new(DecideResponse {
            allowed,
            effective_limit,
        }))
    }

    #[instrument(skip(self, request), fields(identity = %request.get_ref().identity))]
    async fn set_override(
        &self,
        request: Request<SetOverrideRequest>,
    ) -> Result<Response<SetOverrideResponse>, Status> {
        let req = request.into_inner();
        require_identity(&req.identity)?;

        let limit = u64::try_from(req.limit)
            .ok()
            .filter(|&l| l > 0)
            .ok_or_else(|| Status::invalid_argument("limit must be positive"))?;

        self.rate_limiter.set_override(&req.identity, limit);
        info!(identity = %req.identity, limit = limit, "Limit override set");

        Ok(Response::new(SetOverrideResponse {}))
    }

    async fn get_override(
        &self,
        request: Request<GetOverrideRequest>,
    ) -> Result<Response<GetOverrideResponse>, Status> {
        let req = request.into_inner();
        require_identity(&req.identity)?;

        let response = match self.rate_limiter.get_override(&req.identity) {
            Some(limit) => GetOverrideResponse {
                limit: i64::try_from(limit).unwrap_or(i64::MAX),
                present: true,
            },
            None => GetOverrideResponse {
                limit: 0,
                present: false,
            },
        };

        Ok(Response::new(response))
    }

    async fn set_mode(
        &self,
        request: Request<SetModeRequest>,
    ) -> Result<Response<SetModeResponse>, Status> {
        let req = request.into_inner();
        let mode = self.rate_limiter.set_mode(&req.mode);

        Ok(Response::new(SetModeResponse {
            mode: mode.to_string(),
        }))
    }

    async fn get_mode(
        &self,
        _request: Request<GetModeRequest>,
    ) -> Result<Response<GetModeResponse>, Status> {
        Ok(Response::new(GetModeResponse {
            mode: self.rate_limiter.get_mode().to_string(),
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ratelimit::ManualClock;

    fn service(default_limit: i64) -> AdmissionServiceImpl {
        let limiter = RateLimiter::with_clock(Arc::new(ManualClock::new(0)));
        AdmissionServiceImpl::new(Arc::new(limiter), default_limit)
    }

    fn decide_request(identity: &str, default_limit: i64) -> Request<DecideRequest> {
        Request::new(DecideRequest {
            identity: identity.to_string(),
            default_limit,
        })
    }

    #[tokio::test]
    async fn test_empty_identity_rejected() {
        let service = service(5);

        let result = service.decide(decide_request("", 5)).await;
        assert!(result.is_err());
        assert_eq!(result.unwrap_err().code(), tonic::Code::InvalidArgument);
    }

    #[tokio::test]
    async fn test_decide_uses_server_default_when_unset() {
        let service = service(2);

        for _ in 0..2 {
            let response = service.decide(decide_request("alice", 0)).await.unwrap();
            let response = response.into_inner();
            assert!(response.allowed);
            assert_eq!(response.effective_limit, 2);
        }

        let response = service.decide(decide_request("alice", 0)).await.unwrap();
        assert!(!response.into_inner().allowed);
    }

    #[tokio::test]
    async fn test_negative_default_is_denied() {
        let service = service(5);

        let response = service.decide(decide_request("alice", -1)).await.unwrap();
        let response = response.into_inner();
        assert!(!response.allowed);
        assert_eq!(response.effective_limit, 0);
    }

    #[tokio::test]
    async fn test_override_round_trip() {
        let service = service(100);

        service
            .set_override(Request::new(SetOverrideRequest {
                identity: "bob".to_string(),
                limit: 1,
            }))
            .await
            .unwrap();

        let response = service
            .get_override(Request::new(GetOverrideRequest {
                identity: "bob".to_string(),
            }))
            .await
            .unwrap()
            .into_inner();
        assert!(response.present);
        assert_eq!(response.limit, 1);

        assert!(service.decide(decide_request("bob", 0)).await.unwrap().into_inner().allowed);
        assert!(!service.decide(decide_request("bob", 0)).await.unwrap().into_inner().allowed);

        let response = service
            .get_override(Request::new(GetOverrideRequest {
                identity: "carol".to_string(),
            }))
            .await
            .unwrap()
            .into_inner();
        assert!(!response.present);
    }

    #[tokio::test]
    async fn test_decide_reports_override_limit() {
        let service = service(100);
        service
            .set_override(Request::new(SetOverrideRequest {
                identity: "dave".to_string(),
                limit: 7,
            }))
            .await
            .unwrap();

        let response = service.decide(decide_request("dave", 50)).await.unwrap().into_inner();
        assert!(response.allowed);
        assert_eq!(response.effective_limit, 7);
    }

    #[tokio::test]
    async fn test_non_positive_override_rejected() {
        let service = service(5);

        let result = service
            .set_override(Request::new(SetOverrideRequest {
                identity: "bob".to_string(),
                limit: 0,
            }))
            .await;
        assert_eq!(result.unwrap_err().code(), tonic::Code::InvalidArgument);
    }

    #[tokio::test]
    async fn test_mode_round_trip() {
        let service = service(5);

        let response = service
            .set_mode(Request::new(SetModeRequest {
                mode: "leaky".to_string(),
            }))
            .await
            .unwrap()
            .into_inner();
        assert_eq!(response.mode, "leaky");

        let response = service
            .set_mode(Request::new(SetModeRequest {
                mode: "fixed-window".to_string(),
            }))
            .await
            .unwrap()
            .into_inner();
        assert_eq!(response.mode, "leaky");

        let response = service
            .get_mode(Request::new(GetModeRequest {}))
            .await
            .unwrap()
            .into_inner();
        assert_eq!(response.mode, "leaky");
    }
}

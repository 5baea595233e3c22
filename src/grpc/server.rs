//! gRPC server implementation.

use std::net::SocketAddr;
use std::sync::Arc;
use tonic::transport::Server;
use tracing::{error, info};

use super::proto::gatekeeper::v1::admission_server::AdmissionServer;
use super::service::AdmissionServiceImpl;
use crate::error::{GatekeeperError, Result};
use crate::ratelimit::RateLimiter;

/// gRPC server for the admission service.
pub struct GrpcServer {
    /// Address to bind to
    addr: SocketAddr,
    /// The rate limiter instance
    rate_limiter: Arc<RateLimiter>,
    /// Limit used when a request carries none
    default_limit: i64,
}

impl GrpcServer {
    /// Create a new gRPC server around a shared rate limiter.
    pub fn new(addr: SocketAddr, rate_limiter: Arc<RateLimiter>, default_limit: i64) -> Self {
        Self {
            addr,
            rate_limiter,
            default_limit,
        }
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Start the gRPC server with graceful shutdown.
    ///
    /// The server will shut down when the provided signal resolves.
    pub async fn serve_with_shutdown<F>(self, signal: F) -> Result<()>
    where
        F: std::future::Future<Output = ()> + Send,
    {
        let service = AdmissionServiceImpl::new(self.rate_limiter, self.default_limit);

        info!(
            addr = %self.addr,
            default_limit = self.default_limit,
            "Starting gRPC server for Admission service"
        );

        Server::builder()
            .add_service(AdmissionServer::new(service))
            .serve_with_shutdown(self.addr, signal)
            .await
            .map_err(|e| {
                error!(error = %e, "gRPC server failed");
                GatekeeperError::Grpc(e)
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_server_creation() {
        let addr: SocketAddr = "127.0.0.1:8081".parse().unwrap();
        let rate_limiter = Arc::new(RateLimiter::new());
        let server = GrpcServer::new(addr, rate_limiter, 5);
        assert_eq!(server.addr(), addr);
    }

    #[tokio::test]
    async fn test_server_stops_on_signal() {
        let addr: SocketAddr = "127.0.0.1:0".parse().unwrap();
        let server = GrpcServer::new(addr, Arc::new(RateLimiter::new()), 5);

        let result = server.serve_with_shutdown(async {}).await;
        assert!(result.is_ok());
    }
}

use tonic::service::Interceptor;
use tonic::{Request, Status};

/// Checks the `authorization: Bearer <token>` metadata on every RPC
/// against the configured `api_token`, byte-for-byte (§6, §7).
#[derive(Clone)]
pub struct AuthInterceptor {
    expected_token: String,
}

impl AuthInterceptor {
    pub fn new(expected_token: String) -> Self {
        Self { expected_token }
    }
}

impl Interceptor for AuthInterceptor {
    fn call(&mut self, request: Request<()>) -> Result<Request<()>, Status> {
        let header = request
            .metadata()
            .get("authorization")
            .ok_or_else(|| Status::unauthenticated("missing authorization metadata"))?;
        let value = header
            .to_str()
            .map_err(|_| Status::unauthenticated("authorization metadata is not valid UTF-8"))?;
        let token = value
            .strip_prefix("Bearer ")
            .ok_or_else(|| Status::unauthenticated("authorization metadata must be a Bearer token"))?;
        if token != self.expected_token {
            return Err(Status::unauthenticated("invalid bearer token"));
        }
        Ok(request)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request_with_auth(value: Option<&str>) -> Request<()> {
        let mut req = Request::new(());
        if let Some(v) = value {
            req.metadata_mut().insert("authorization", v.parse().unwrap());
        }
        req
    }

    #[test]
    fn accepts_matching_bearer_token() {
        let mut interceptor = AuthInterceptor::new("secret".to_string());
        assert!(interceptor.call(request_with_auth(Some("Bearer secret"))).is_ok());
    }

    #[test]
    fn rejects_missing_header() {
        let mut interceptor = AuthInterceptor::new("secret".to_string());
        assert!(interceptor.call(request_with_auth(None)).is_err());
    }

    #[test]
    fn rejects_wrong_token() {
        let mut interceptor = AuthInterceptor::new("secret".to_string());
        assert!(interceptor.call(request_with_auth(Some("Bearer wrong"))).is_err());
    }

    #[test]
    fn rejects_non_bearer_scheme() {
        let mut interceptor = AuthInterceptor::new("secret".to_string());
        assert!(interceptor.call(request_with_auth(Some("Basic secret"))).is_err());
    }
}

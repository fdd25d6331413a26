use actix_web::{
    dev::{Service, ServiceRequest, ServiceResponse, Transform},
    Error,
};
use futures::future::{ok, Ready};
use futures::Future;
use std::pin::Pin;
use std::rc::Rc;
use std::task::{Context, Poll};
use tracing::warn;

/// Shared-key gate for the `/admin` scope. Device traffic never passes
/// through here; devices authenticate per request with signed canonical
/// strings instead.
pub struct AdminAuth {
    api_key: Option<String>,
}

impl AdminAuth {
    pub fn new(api_key: Option<String>) -> Self {
        Self { api_key }
    }
}

impl<S, B> Transform<S, ServiceRequest> for AdminAuth
where
    S: Service<ServiceRequest, Response = ServiceResponse<B>, Error = Error> + 'static,
    S::Future: 'static,
    B: 'static,
{
    type Response = ServiceResponse<B>;
    type Error = Error;
    type InitError = ();
    type Transform = AdminAuthMiddleware<S>;
    type Future = Ready<Result<Self::Transform, Self::InitError>>;

    fn new_transform(&self, service: S) -> Self::Future {
        ok(AdminAuthMiddleware {
            service: Rc::new(service),
            api_key: self.api_key.clone(),
        })
    }
}

pub struct AdminAuthMiddleware<S> {
    service: Rc<S>,
    api_key: Option<String>,
}

impl<S, B> Service<ServiceRequest> for AdminAuthMiddleware<S>
where
    S: Service<ServiceRequest, Response = ServiceResponse<B>, Error = Error> + 'static,
    S::Future: 'static,
    B: 'static,
{
    type Response = ServiceResponse<B>;
    type Error = Error;
    type Future = Pin<Box<dyn Future<Output = Result<Self::Response, Self::Error>>>>;

    fn poll_ready(&self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.service.poll_ready(cx)
    }

    fn call(&self, req: ServiceRequest) -> Self::Future {
        let srv = self.service.clone();
        let configured = self.api_key.clone();

        Box::pin(async move {
            // CORS preflight carries no credentials
            if req.method() == actix_web::http::Method::OPTIONS {
                return srv.call(req).await;
            }

            // Fail closed when no key is configured
            let Some(configured) = configured else {
                warn!("Admin request rejected: no admin api key configured");
                return Err(actix_web::error::ErrorUnauthorized(
                    "admin access not configured",
                ));
            };

            if let Some(header) = req.headers().get("x-api-key") {
                if let Ok(presented) = header.to_str() {
                    if presented == configured {
                        return srv.call(req).await;
                    }
                }
            }

            Err(actix_web::error::ErrorUnauthorized("invalid api key"))
        })
    }
}

//! Response signing. Every response leaving the API scope, error
//! envelopes included, carries an Ed25519 signature over the exact body
//! bytes in the VSP-Server-Signature header. Handler panics are caught
//! here and degraded to a signed 500.

use actix_web::body::{BoxBody, MessageBody};
use actix_web::dev::{forward_ready, Service, ServiceRequest, ServiceResponse, Transform};
use actix_web::http::header::{HeaderName, HeaderValue};
use actix_web::{Error as ActixError, HttpResponse};
use ed25519_dalek::{Signer, SigningKey};
use futures::future::{ready, LocalBoxFuture, Ready};
use futures::FutureExt;
use log::error;
use std::panic::AssertUnwindSafe;
use std::rc::Rc;
use std::sync::Arc;

pub struct SignResponse {
    key: Arc<SigningKey>,
}

impl SignResponse {
    pub fn new(key: Arc<SigningKey>) -> Self {
        SignResponse { key }
    }
}

impl<S, B> Transform<S, ServiceRequest> for SignResponse
where
    S: Service<ServiceRequest, Response = ServiceResponse<B>, Error = ActixError> + 'static,
    B: MessageBody + 'static,
{
    type Response = ServiceResponse<BoxBody>;
    type Error = ActixError;
    type Transform = SignResponseMiddleware<S>;
    type InitError = ();
    type Future = Ready<Result<Self::Transform, ()>>;

    fn new_transform(&self, service: S) -> Self::Future {
        ready(Ok(SignResponseMiddleware {
            service: Rc::new(service),
            key: self.key.clone(),
        }))
    }
}

pub struct SignResponseMiddleware<S> {
    service: Rc<S>,
    key: Arc<SigningKey>,
}

impl<S, B> Service<ServiceRequest> for SignResponseMiddleware<S>
where
    S: Service<ServiceRequest, Response = ServiceResponse<B>, Error = ActixError> + 'static,
    B: MessageBody + 'static,
{
    type Response = ServiceResponse<BoxBody>;
    type Error = ActixError;
    type Future = LocalBoxFuture<'static, Result<Self::Response, Self::Error>>;

    forward_ready!(service);

    fn call(&self, req: ServiceRequest) -> Self::Future {
        let service = Rc::clone(&self.service);
        let key = self.key.clone();
        Box::pin(async move {
            let http_req = req.request().clone();
            // Errors and panics are materialized into responses here so
            // that they get signed like any other body.
            let res = match AssertUnwindSafe(service.call(req)).catch_unwind().await {
                Ok(Ok(res)) => res.map_into_boxed_body(),
                Ok(Err(e)) => {
                    let response = e.error_response();
                    ServiceResponse::new(http_req, response)
                }
                Err(_) => {
                    error!("recovered panicking request handler");
                    ServiceResponse::new(http_req, HttpResponse::InternalServerError().finish())
                }
            };

            let (req, res) = res.into_parts();
            let (head, body) = res.into_parts();
            let bytes = actix_web::body::to_bytes(body).await.map_err(|_| {
                actix_web::error::ErrorInternalServerError("cannot buffer response body")
            })?;
            let signature = base64::encode(key.sign(&bytes).to_bytes());

            let mut res = head.set_body(BoxBody::new(bytes));
            res.headers_mut().insert(
                HeaderName::from_static("vsp-server-signature"),
                HeaderValue::from_str(&signature)
                    .map_err(actix_web::error::ErrorInternalServerError)?,
            );
            Ok(ServiceResponse::new(req, res))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::{ApiCode, Error};
    use actix_web::{test, web, App};
    use ed25519_dalek::Verifier;
    use rand::rngs::OsRng;

    async fn ok_handler() -> Result<HttpResponse, Error> {
        Ok(HttpResponse::Ok().json(serde_json::json!({"pong": true})))
    }

    async fn failing_handler() -> Result<HttpResponse, Error> {
        Err(Error::code(ApiCode::FeeExpired))
    }

    async fn panicking_handler() -> Result<HttpResponse, Error> {
        panic!("boom");
    }

    #[actix_rt::test]
    async fn signs_success_error_and_panic_responses() {
        let key = Arc::new(SigningKey::generate(&mut OsRng));
        let verifying = key.verifying_key();
        let app = test::init_service(
            App::new().service(
                web::scope("/api")
                    .wrap(SignResponse::new(key))
                    .route("/ok", web::get().to(ok_handler))
                    .route("/err", web::get().to(failing_handler))
                    .route("/panic", web::get().to(panicking_handler)),
            ),
        )
        .await;

        for (path, status) in [("/api/ok", 200u16), ("/api/err", 400), ("/api/panic", 500)] {
            let req = test::TestRequest::get().uri(path).to_request();
            let res = test::call_service(&app, req).await;
            assert_eq!(res.status().as_u16(), status, "{}", path);
            let sig_header = res
                .headers()
                .get("VSP-Server-Signature")
                .expect("signature header")
                .to_str()
                .unwrap()
                .to_owned();
            let body = test::read_body(res).await;
            let sig_bytes = base64::decode(&sig_header).unwrap();
            let signature = ed25519_dalek::Signature::from_slice(&sig_bytes).unwrap();
            verifying.verify(&body, &signature).unwrap();
        }
    }

    #[actix_rt::test]
    async fn error_envelope_carries_code_and_message() {
        let key = Arc::new(SigningKey::generate(&mut OsRng));
        let app = test::init_service(
            App::new().service(
                web::scope("/api")
                    .wrap(SignResponse::new(key))
                    .route("/err", web::get().to(failing_handler)),
            ),
        )
        .await;
        let req = test::TestRequest::get().uri("/api/err").to_request();
        let res = test::call_service(&app, req).await;
        let body: serde_json::Value = test::read_body_json(res).await;
        assert_eq!(body["code"], 8);
        assert_eq!(body["message"], "fee has expired");
    }
}

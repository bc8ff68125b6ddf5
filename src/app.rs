//! The hosted application capability.
//!
//! The server core only knows the [`Application`] trait: a function from a
//! request environment to a response. Errors and panics raised by an
//! application are caught by the connection handler and turned into a
//! generic 500.

use std::future::Future;
use std::sync::Arc;

use futures_util::future::BoxFuture;
use http::StatusCode;

use crate::http::environ::Environ;
use crate::http::response::{Response, ResponseError};

/// Error type applications return.
pub type AppError = Box<dyn std::error::Error + Send + Sync>;

/// A request handler hosted by the server.
pub trait Application: Send + Sync {
    fn call<'a>(&'a self, environ: &'a mut Environ<'_>) -> BoxFuture<'a, Result<Response, AppError>>;
}

impl<A: Application + ?Sized> Application for Arc<A> {
    fn call<'a>(&'a self, environ: &'a mut Environ<'_>) -> BoxFuture<'a, Result<Response, AppError>> {
        (**self).call(environ)
    }
}

impl<A: Application + ?Sized> Application for Box<A> {
    fn call<'a>(&'a self, environ: &'a mut Environ<'_>) -> BoxFuture<'a, Result<Response, AppError>> {
        (**self).call(environ)
    }
}

/// Why an application failed to produce a response.
#[derive(Debug, thiserror::Error)]
pub enum ApplicationFault {
    #[error("application returned an error: {0}")]
    Failed(AppError),

    #[error("application panicked: {0}")]
    Panicked(String),

    #[error("application returned an invalid response: {0}")]
    InvalidResponse(ResponseError),
}

impl ApplicationFault {
    pub(crate) fn from_panic(payload: Box<dyn std::any::Any + Send>) -> Self {
        let message = if let Some(text) = payload.downcast_ref::<&str>() {
            (*text).to_string()
        } else if let Some(text) = payload.downcast_ref::<String>() {
            text.clone()
        } else {
            "non-string panic payload".to_string()
        };
        ApplicationFault::Panicked(message)
    }
}

/// Adapts an async closure into an [`Application`].
///
/// The closure receives the request variables by reference and cannot read
/// the body; implement [`Application`] directly for that.
pub struct FnApp<F>(pub F);

impl<F, Fut> Application for FnApp<F>
where
    F: Fn(&Environ<'_>) -> Fut + Send + Sync,
    Fut: Future<Output = Result<Response, AppError>> + Send + 'static,
{
    fn call<'a>(&'a self, environ: &'a mut Environ<'_>) -> BoxFuture<'a, Result<Response, AppError>> {
        Box::pin((self.0)(environ))
    }
}

/// Responds with the request environment as JSON.
///
/// Request bodies are read and reported as `devserve.body`.
#[derive(Debug, Clone)]
pub struct EchoEnviron {
    max_body: u64,
}

impl EchoEnviron {
    pub fn new(max_body: u64) -> Self {
        Self { max_body }
    }
}

impl Default for EchoEnviron {
    fn default() -> Self {
        Self::new(1024 * 1024)
    }
}

impl Application for EchoEnviron {
    fn call<'a>(&'a self, environ: &'a mut Environ<'_>) -> BoxFuture<'a, Result<Response, AppError>> {
        Box::pin(async move {
            let body = environ.input().read_to_end(self.max_body).await?;
            let mut json = environ.to_json();
            if !body.is_empty() {
                json["devserve.body"] = String::from_utf8_lossy(&body).into_owned().into();
            }
            Ok(Response::json(StatusCode::OK, &json))
        })
    }
}

/// Answers every request with a fixed status and text body.
#[derive(Debug, Clone)]
pub struct Fixed {
    status: StatusCode,
    body: String,
}

impl Fixed {
    pub fn new(status: StatusCode, body: impl Into<String>) -> Self {
        Self {
            status,
            body: body.into(),
        }
    }

    pub fn not_found() -> Self {
        Self::new(StatusCode::NOT_FOUND, "Not Found")
    }
}

impl Application for Fixed {
    fn call<'a>(&'a self, _environ: &'a mut Environ<'_>) -> BoxFuture<'a, Result<Response, AppError>> {
        let response = Response::text(self.status, self.body.clone());
        Box::pin(async move { Ok(response) })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn echo_reports_environ_and_body() {
        let app = EchoEnviron::default();
        let mut environ = Environ::builder()
            .method("POST")
            .path("/echo?x=1")
            .body("payload")
            .build();
        let response = app.call(&mut environ).await.unwrap();
        assert_eq!(response.status, StatusCode::OK);

        let body = response.body.collect().await.unwrap();
        let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(json["REQUEST_METHOD"], "POST");
        assert_eq!(json["PATH_INFO"], "/echo");
        assert_eq!(json["QUERY_STRING"], "x=1");
        assert_eq!(json["devserve.body"], "payload");
    }

    #[tokio::test]
    async fn fn_app_sees_variables() {
        let app = FnApp(|environ: &Environ<'_>| {
            let path = environ.path_info().to_string();
            async move { Ok(Response::text(StatusCode::OK, path)) }
        });
        let mut environ = Environ::builder().path("/hello").build();
        let response = app.call(&mut environ).await.unwrap();
        assert_eq!(&response.body.collect().await.unwrap()[..], b"/hello");
    }

    #[test]
    fn panic_payloads_are_described() {
        let fault = ApplicationFault::from_panic(Box::new("boom"));
        assert_eq!(fault.to_string(), "application panicked: boom");
        let fault = ApplicationFault::from_panic(Box::new(String::from("bang")));
        assert_eq!(fault.to_string(), "application panicked: bang");
    }
}

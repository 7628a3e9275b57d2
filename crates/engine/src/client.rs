use reqwest::Client;
use serde_json::Value;
use std::future::Future;
use thiserror::Error;
use turtledash_protocol::{CommandInput, ErrorInfo, Turtle, CONTENT_TYPE_JSON};

const NETWORK_DETAILS: &str =
    "Connection to the server failed. The server might be down or unreachable.";

/// Failure of a single call against the turtle API.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ApiError {
    #[error("HTTP error {status}: {status_text}")]
    Http {
        status: u16,
        status_text: String,
        /// Response body, parsed as JSON when possible, raw text otherwise.
        body: Value,
    },
    #[error("{message}")]
    Network {
        message: String,
        /// I/O error kind behind the failure, when one can be found.
        code: Option<String>,
    },
    #[error("{message}")]
    Unknown { message: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Http,
    Network,
    Unknown,
}

impl ErrorKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Http => "http",
            Self::Network => "network",
            Self::Unknown => "unknown",
        }
    }
}

impl ApiError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Http { .. } => ErrorKind::Http,
            Self::Network { .. } => ErrorKind::Network,
            Self::Unknown { .. } => ErrorKind::Unknown,
        }
    }

    pub fn error_info(&self) -> ErrorInfo {
        match self {
            Self::Http {
                status,
                status_text,
                ..
            } => ErrorInfo {
                kind: "HttpError".to_string(),
                status: Some(*status),
                status_text: Some(status_text.clone()),
                stack: None,
                code: None,
                details: None,
            },
            Self::Network { code, .. } => ErrorInfo {
                kind: "NetworkError".to_string(),
                status: None,
                status_text: None,
                stack: None,
                code: code.clone(),
                details: Some(NETWORK_DETAILS.to_string()),
            },
            Self::Unknown { .. } => ErrorInfo {
                kind: "Error".to_string(),
                status: None,
                status_text: None,
                stack: None,
                code: None,
                details: None,
            },
        }
    }

    /// Payload worth showing next to the error (the HTTP body, if any).
    pub fn data(&self) -> Value {
        match self {
            Self::Http { body, .. } => body.clone(),
            _ => Value::Null,
        }
    }

    fn from_reqwest(err: reqwest::Error) -> Self {
        if err.is_connect() || err.is_timeout() || err.is_request() {
            Self::Network {
                message: err.to_string(),
                code: io_error_code(&err),
            }
        } else {
            Self::Unknown {
                message: err.to_string(),
            }
        }
    }
}

fn io_error_code(err: &reqwest::Error) -> Option<String> {
    let mut source = std::error::Error::source(err);
    while let Some(cause) = source {
        if let Some(io) = cause.downcast_ref::<std::io::Error>() {
            return Some(format!("{:?}", io.kind()));
        }
        source = cause.source();
    }
    None
}

impl From<serde_json::Error> for ApiError {
    fn from(err: serde_json::Error) -> Self {
        Self::Unknown {
            message: format!("invalid turtle payload: {err}"),
        }
    }
}

/// The external turtle backend.
pub trait TurtleApi: Send + Sync + 'static {
    fn turtle_url(&self, id: u32) -> String;

    fn list_turtles(&self) -> impl Future<Output = Result<Vec<Turtle>, ApiError>> + Send;

    /// Raw `GET /turtle/{id}` payload; `null` when the turtle is unknown.
    fn fetch_turtle(&self, id: u32) -> impl Future<Output = Result<Value, ApiError>> + Send;

    fn send_command(
        &self,
        id: u32,
        input: &CommandInput,
    ) -> impl Future<Output = Result<Value, ApiError>> + Send;
}

/// `TurtleApi` over HTTP.
#[derive(Debug, Clone)]
pub struct HttpTurtleApi {
    client: Client,
    base_url: String,
}

impl HttpTurtleApi {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self::with_client(Client::new(), base_url)
    }

    pub fn with_client(client: Client, base_url: impl Into<String>) -> Self {
        Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn list_url(&self) -> String {
        format!("{}/turtle", self.base_url)
    }
}

impl TurtleApi for HttpTurtleApi {
    fn turtle_url(&self, id: u32) -> String {
        format!("{}/turtle/{id}", self.base_url)
    }

    async fn list_turtles(&self) -> Result<Vec<Turtle>, ApiError> {
        let response = self
            .client
            .get(self.list_url())
            .header(reqwest::header::ACCEPT, CONTENT_TYPE_JSON)
            .send()
            .await
            .map_err(ApiError::from_reqwest)?;
        let value = read_body(response).await?;
        if value.is_null() {
            return Ok(Vec::new());
        }
        Ok(serde_json::from_value(value)?)
    }

    async fn fetch_turtle(&self, id: u32) -> Result<Value, ApiError> {
        let response = self
            .client
            .get(self.turtle_url(id))
            .header(reqwest::header::ACCEPT, CONTENT_TYPE_JSON)
            .send()
            .await
            .map_err(ApiError::from_reqwest)?;
        read_body(response).await
    }

    async fn send_command(&self, id: u32, input: &CommandInput) -> Result<Value, ApiError> {
        let response = self
            .client
            .post(self.turtle_url(id))
            .header(reqwest::header::CONTENT_TYPE, input.content_type())
            .body(input.body())
            .send()
            .await
            .map_err(ApiError::from_reqwest)?;
        read_body(response).await
    }
}

async fn read_body(response: reqwest::Response) -> Result<Value, ApiError> {
    let status = response.status();
    let text = response.text().await.map_err(ApiError::from_reqwest)?;
    if !status.is_success() {
        let body = serde_json::from_str(&text).unwrap_or(Value::String(text));
        return Err(ApiError::Http {
            status: status.as_u16(),
            status_text: status.canonical_reason().unwrap_or_default().to_string(),
            body,
        });
    }
    if text.trim().is_empty() {
        return Ok(Value::Null);
    }
    Ok(serde_json::from_str(&text)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Bytes;
    use axum::http::{HeaderMap, StatusCode};
    use axum::routing::get;
    use axum::Router;
    use std::sync::{Arc, Mutex};

    #[derive(Debug, Clone, Default)]
    struct Captured {
        content_type: Option<String>,
        body: String,
    }

    async fn spawn_backend(captured: Arc<Mutex<Vec<Captured>>>) -> String {
        let app = Router::new()
            .route(
                "/api/turtle",
                get(|| async { axum::Json(serde_json::json!([{ "id": 1, "name": "alpha" }])) }),
            )
            .route(
                "/api/turtle/{id}",
                get(|axum::extract::Path(id): axum::extract::Path<u32>| async move {
                    match id {
                        1 => (StatusCode::OK, r#"{"id":1,"name":"alpha"}"#.to_string()),
                        2 => (StatusCode::OK, String::new()),
                        3 => (
                            StatusCode::INTERNAL_SERVER_ERROR,
                            r#"{"error":"boom"}"#.to_string(),
                        ),
                        _ => (StatusCode::NOT_FOUND, "no such turtle".to_string()),
                    }
                })
                .post(move |headers: HeaderMap, body: Bytes| {
                    let captured = captured.clone();
                    async move {
                        captured.lock().unwrap().push(Captured {
                            content_type: headers
                                .get("content-type")
                                .and_then(|v| v.to_str().ok())
                                .map(str::to_string),
                            body: String::from_utf8_lossy(&body).to_string(),
                        });
                        axum::Json(serde_json::json!({ "queued": true }))
                    }
                }),
            );
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let _ = axum::serve(listener, app).await;
        });
        format!("http://{addr}/api")
    }

    #[tokio::test]
    async fn single_command_posts_json_array() {
        let captured = Arc::new(Mutex::new(Vec::new()));
        let api = HttpTurtleApi::new(spawn_backend(captured.clone()).await);

        let reply = api
            .send_command(1, &CommandInput::Single("forward".into()))
            .await
            .unwrap();
        assert_eq!(reply["queued"], true);

        let seen = captured.lock().unwrap()[0].clone();
        assert_eq!(seen.content_type.as_deref(), Some("application/json"));
        assert_eq!(seen.body, r#"["forward"]"#);
    }

    #[tokio::test]
    async fn lua_script_posts_plain_text() {
        let captured = Arc::new(Mutex::new(Vec::new()));
        let api = HttpTurtleApi::new(spawn_backend(captured.clone()).await);

        api.send_command(1, &CommandInput::LuaScript("return 1".into()))
            .await
            .unwrap();

        let seen = captured.lock().unwrap()[0].clone();
        assert_eq!(seen.content_type.as_deref(), Some("text/plain"));
        assert_eq!(seen.body, "return 1");
    }

    #[tokio::test]
    async fn fetch_and_list() {
        let api = HttpTurtleApi::new(spawn_backend(Arc::default()).await);

        let one = api.fetch_turtle(1).await.unwrap();
        assert_eq!(one["name"], "alpha");
        assert!(api.fetch_turtle(2).await.unwrap().is_null());

        let all = api.list_turtles().await.unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].name, "alpha");
    }

    #[tokio::test]
    async fn server_error_is_http_error() {
        let api = HttpTurtleApi::new(spawn_backend(Arc::default()).await);

        let err = api.fetch_turtle(3).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Http);
        let info = err.error_info();
        assert_eq!(info.kind, "HttpError");
        assert_eq!(info.status, Some(500));
        assert_eq!(err.data()["error"], "boom");

        let err = api.fetch_turtle(9).await.unwrap_err();
        assert_eq!(err.data(), Value::String("no such turtle".into()));
    }

    #[tokio::test]
    async fn refused_connection_is_network_error() {
        // Bind then drop so the port is very likely closed.
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let api = HttpTurtleApi::new(format!("http://{addr}/api"));
        let err = api.fetch_turtle(1).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Network);
        assert_eq!(err.error_info().kind, "NetworkError");
    }

    #[test]
    fn network_error_info_reports_code() {
        let err = ApiError::Network {
            message: "error sending request".into(),
            code: Some("ConnectionRefused".into()),
        };
        let info = err.error_info();
        assert_eq!(info.code.as_deref(), Some("ConnectionRefused"));
        assert!(info.details.is_some());

        let err = ApiError::Http {
            status: 404,
            status_text: "Not Found".into(),
            body: Value::Null,
        };
        assert!(err.error_info().code.is_none());
    }
}

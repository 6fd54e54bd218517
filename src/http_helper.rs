use thiserror::Error;

pub use reqwest::Response;

#[derive(Copy, Clone)]
pub enum Method {
    Post,
    Get,
}

impl From<Method> for reqwest::Method {
    fn from(m: Method) -> Self {
        match m {
            Method::Post => reqwest::Method::POST,
            Method::Get => reqwest::Method::GET,
        }
    }
}

/// A request body together with its media type.
pub(crate) struct Body {
    pub content_type: &'static str,
    pub bytes: Vec<u8>,
}

/// Sends a request and turns any non-2xx status into an error carrying the
/// status and the response text.
pub(crate) async fn http(
    client: &reqwest::Client,
    url: impl AsRef<str>,
    method: Method,
    body: Option<Body>,
) -> Result<Response, HttpRequestError> {
    let method: reqwest::Method = method.into();
    let mut request = client.request(method, url.as_ref());
    if let Some(body) = body {
        request = request
            .body(body.bytes)
            .header("Content-Type", body.content_type);
    }

    let response = request.send().await?;
    let status = response.status();
    if !status.is_success() {
        return Err(HttpRequestError::Non2xxStatus {
            status_code: status.into(),
            body: response.text().await?,
        });
    }
    Ok(response)
}

impl From<reqwest::Error> for HttpRequestError {
    fn from(e: reqwest::Error) -> Self {
        Self::Http(e.into())
    }
}

#[derive(Error, Debug)]
pub enum HttpRequestError {
    #[error("http error: {0:?}")]
    Http(Box<dyn std::error::Error + Send + Sync + 'static>),
    #[error("non 2xx http status: {status_code} {body:?}")]
    Non2xxStatus { status_code: u16, body: String },
}

impl HttpRequestError {
    pub fn status_code(&self) -> Option<u16> {
        match self {
            HttpRequestError::Non2xxStatus { status_code, .. } => Some(*status_code),
            HttpRequestError::Http(_) => None,
        }
    }
}

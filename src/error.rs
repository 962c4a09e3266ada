use thiserror::Error;

#[derive(Error, Debug)]
pub enum DumpError {
    #[error("not authenticated: no active bearer token")]
    Unauthenticated,

    #[error("invalid query: {0}")]
    InvalidQuery(String),

    #[error("cannot authenticate: {0}")]
    CannotAuthenticate(String),

    #[error("HTTP {status} for {url}")]
    Transport { status: u16, url: String },

    #[error("request error: {0}")]
    Request(#[from] reqwest::Error),

    #[error("malformed response body: {0}")]
    Malformed(String),

    #[error("sink error: {0}")]
    Sink(#[from] std::io::Error),

    #[error("invalid URL: {0}")]
    Url(#[from] url::ParseError),

    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

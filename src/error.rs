use std::path::PathBuf;
use std::time::Duration;

use hyper::StatusCode;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Not authorized. Run `nest-remote auth login` first.")]
    NotAuthorized,

    #[error("Network error: {0}")]
    Network(String),

    #[error("Request timed out after {}s", .0.as_secs())]
    Timeout(Duration),

    #[error("API error: {status}{}", body_suffix(.body))]
    Api { status: StatusCode, body: String },

    #[error("Too many redirects (gave up after {0} hops)")]
    TooManyRedirects(usize),

    #[error("Malformed response: {0}")]
    Decode(#[from] serde_json::Error),

    #[error("Could not write {}: {source}", path.display())]
    Persistence {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Authorization already in progress (callback port {0} is in use)")]
    AuthInProgress(u16),

    #[error("Another sync is in progress (lock held: {})", .0.display())]
    SyncInProgress(PathBuf),

    #[error("{0}")]
    InvalidInput(String),

    #[error("Could not read OAuth client secret: {0}")]
    Secret(#[source] std::io::Error),
}

fn body_suffix(body: &str) -> String {
    let body = body.trim();
    if body.is_empty() {
        String::new()
    } else {
        format!(": {body}")
    }
}

impl Error {
    pub(crate) fn persistence(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Error::Persistence {
            path: path.into(),
            source,
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn api_error_includes_status_line() {
        let err = Error::Api {
            status: StatusCode::NOT_FOUND,
            body: String::new(),
        };
        assert_eq!(err.to_string(), "API error: 404 Not Found");

        let err = Error::Api {
            status: StatusCode::UNAUTHORIZED,
            body: "{\"error\":\"unauthorized\"}\n".to_string(),
        };
        assert_eq!(
            err.to_string(),
            "API error: 401 Unauthorized: {\"error\":\"unauthorized\"}"
        );
    }

    #[test]
    fn timeout_reports_seconds() {
        let err = Error::Timeout(Duration::from_secs(30));
        assert_eq!(err.to_string(), "Request timed out after 30s");
    }
}

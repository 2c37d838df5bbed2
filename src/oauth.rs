use std::convert::Infallible;
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};
use http_body_util::Full;
use hyper::body::{Bytes, Incoming};
use hyper::header::{ACCEPT, CONTENT_TYPE};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use serde::{Deserialize, Serialize};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{Mutex, Notify};
use tracing::{debug, info, warn};
use yup_oauth2::ApplicationSecret;

use crate::error::{Error, Result};
use crate::http::HttpClient;
use crate::settings::Settings;
use crate::token::TokenStore;

const PAGE_TITLE: &str = "Nest Remote";

/// Read the OAuth client credentials stored in the data directory.
pub async fn load_client_secret(settings: &Settings) -> Result<ApplicationSecret> {
    yup_oauth2::read_application_secret(settings.client_secret_file())
        .await
        .map_err(Error::Secret)
}

/// Random value tying a callback to the authorization request that caused it.
pub fn new_state() -> String {
    uuid::Uuid::new_v4().simple().to_string()
}

#[derive(Debug, Deserialize)]
pub struct TokenGrant {
    pub access_token: String,
    pub expires_in: i64,
}

impl TokenGrant {
    pub fn expires_at(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        TimeDelta::try_seconds(self.expires_in)
            .and_then(|ttl| now.checked_add_signed(ttl))
            .unwrap_or(DateTime::<Utc>::MAX_UTC)
    }
}

#[derive(Serialize)]
struct TokenRequest<'a> {
    code: &'a str,
    client_id: &'a str,
    client_secret: &'a str,
    grant_type: &'a str,
}

#[derive(Clone)]
pub struct OAuthClient {
    http: HttpClient,
    client_id: String,
    client_secret: String,
    auth_url: String,
    token_url: String,
}

impl OAuthClient {
    /// Endpoints in the secret file win over the configured defaults.
    pub fn new(http: HttpClient, secret: &ApplicationSecret, settings: &Settings) -> Self {
        let pick = |from_secret: &str, fallback: &str| {
            if from_secret.trim().is_empty() {
                fallback.to_string()
            } else {
                from_secret.to_string()
            }
        };
        Self {
            http,
            client_id: secret.client_id.clone(),
            client_secret: secret.client_secret.clone(),
            auth_url: pick(&secret.auth_uri, &settings.auth_url),
            token_url: pick(&secret.token_uri, &settings.token_url),
        }
    }

    /// Where to send the browser to start the grant.
    pub fn authorization_url(&self, state: &str) -> String {
        format!(
            "{}?client_id={}&state={}",
            self.auth_url,
            urlencoding::encode(&self.client_id),
            urlencoding::encode(state)
        )
    }

    /// Trade an authorization code for an access token. Single attempt.
    pub async fn exchange_code(&self, code: &str) -> Result<TokenGrant> {
        let form = serde_urlencoded::to_string(TokenRequest {
            code,
            client_id: &self.client_id,
            client_secret: &self.client_secret,
            grant_type: "authorization_code",
        })
        .map_err(|e| Error::InvalidInput(format!("Could not encode token request: {e}")))?;

        let request = Request::post(self.token_url.as_str())
            .header(CONTENT_TYPE, "application/x-www-form-urlencoded")
            .header(ACCEPT, "application/json")
            .body(Full::new(Bytes::from(form)))
            .map_err(|e| Error::InvalidInput(format!("Invalid token URL: {e}")))?;

        debug!(url = %self.token_url, "Exchanging authorization code");
        let response = self.http.send(request).await?;
        if !response.status.is_success() {
            return Err(Error::Api {
                status: response.status,
                body: String::from_utf8_lossy(&response.body).into_owned(),
            });
        }
        Ok(serde_json::from_slice(&response.body)?)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum AuthPhase {
    Idle,
    Listening,
    CodeReceived,
    Exchanging,
    Succeeded,
    Failed,
    Closed,
}

#[derive(Debug)]
pub enum AuthFailure {
    /// The callback's `state` did not match the pending authorization.
    StateMismatch,
    MissingCode,
    /// The provider redirected back with an `error` parameter.
    Denied(String),
    /// Transport failure, non-2xx reply or bad JSON from the token endpoint.
    Exchange(Error),
    /// The grant succeeded but the token could not be stored.
    Save(Error),
}

#[derive(Debug)]
pub enum AuthOutcome {
    Authorized { expires_at: DateTime<Utc> },
    Failed(AuthFailure),
}

#[derive(Debug, Default, Deserialize)]
struct CallbackParams {
    code: Option<String>,
    state: Option<String>,
    error: Option<String>,
    error_description: Option<String>,
}

/// A bound, not yet serving, callback listener. Exactly one callback is
/// answered; the listener is dropped right after.
pub struct CallbackServer {
    listener: TcpListener,
    path: String,
    connection_timeout: Duration,
}

impl CallbackServer {
    /// Bind the fixed callback port on the IPv4 loopback.
    ///
    /// The port being taken means another authorization is already waiting
    /// for its callback.
    pub async fn bind(settings: &Settings) -> Result<Self> {
        let addr = SocketAddr::from((Ipv4Addr::LOCALHOST, settings.callback_port));
        let listener = TcpListener::bind(addr).await.map_err(|e| {
            if e.kind() == std::io::ErrorKind::AddrInUse {
                Error::AuthInProgress(settings.callback_port)
            } else {
                Error::Network(format!("Could not listen on {addr}: {e}"))
            }
        })?;
        debug!(phase = ?AuthPhase::Idle, %addr, "Callback listener bound");

        Ok(Self {
            listener,
            path: settings.callback_path.clone(),
            connection_timeout: settings.http_timeout * 2,
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        self.listener
            .local_addr()
            .map_err(|e| Error::Network(e.to_string()))
    }

    /// Serve until the callback has been answered, then close the listener.
    ///
    /// The expected `state` is the one recorded in `tokens` by
    /// [`TokenStore::begin_authorization`].
    pub async fn run(self, oauth: OAuthClient, tokens: TokenStore) -> Result<AuthOutcome> {
        let CallbackServer {
            listener,
            path,
            connection_timeout,
        } = self;
        let handler = Arc::new(CallbackHandler {
            path,
            oauth,
            tokens: Mutex::new(tokens),
            phase: Mutex::new(AuthPhase::Listening),
            outcome: Mutex::new(None),
            answered: Notify::new(),
        });
        info!(phase = ?AuthPhase::Listening, "Waiting for authorization callback");

        let outcome = loop {
            tokio::select! {
                _ = handler.answered.notified() => {
                    if let Some(outcome) = handler.outcome.lock().await.take() {
                        break outcome;
                    }
                }
                accepted = listener.accept() => {
                    let (stream, remote) = accepted
                        .map_err(|e| Error::Network(format!("Callback listener failed: {e}")))?;
                    debug!(%remote, "Callback connection");
                    tokio::spawn(serve(Arc::clone(&handler), stream, remote, connection_timeout));
                }
            }
        };

        drop(listener);
        handler.enter(AuthPhase::Closed).await;
        Ok(outcome)
    }
}

/// One connection, served on its own task so an idle socket (a browser
/// preconnect, say) cannot hold up the real callback.
async fn serve(
    handler: Arc<CallbackHandler>,
    stream: TcpStream,
    remote: SocketAddr,
    connection_timeout: Duration,
) {
    let conn_handler = Arc::clone(&handler);
    let service = service_fn(move |req| {
        let handler = Arc::clone(&conn_handler);
        async move { Ok::<_, Infallible>(handler.handle(req).await) }
    });
    let connection = http1::Builder::new()
        .keep_alive(false)
        .serve_connection(TokioIo::new(stream), service);

    match tokio::time::timeout(connection_timeout, connection).await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => debug!(error = %e, "Callback connection error"),
        Err(_) => debug!(%remote, "Callback connection timed out"),
    }

    // The response has been written; the listener may close now.
    if handler.outcome.lock().await.is_some() {
        handler.answered.notify_one();
    }
}

struct CallbackHandler {
    path: String,
    oauth: OAuthClient,
    tokens: Mutex<TokenStore>,
    phase: Mutex<AuthPhase>,
    outcome: Mutex<Option<AuthOutcome>>,
    answered: Notify,
}

impl CallbackHandler {
    async fn enter(&self, next: AuthPhase) {
        let mut phase = self.phase.lock().await;
        debug!(from = ?*phase, to = ?next, "Authorization phase");
        *phase = next;
    }

    async fn handle(&self, req: Request<Incoming>) -> Response<Full<Bytes>> {
        if req.uri().path() != self.path {
            return plain(StatusCode::NOT_FOUND, "Not found");
        }

        {
            let mut phase = self.phase.lock().await;
            if *phase != AuthPhase::Listening {
                return plain(StatusCode::CONFLICT, "Authorization already handled");
            }
            *phase = AuthPhase::CodeReceived;
        }
        info!(phase = ?AuthPhase::CodeReceived, "Received authorization callback");

        let params: CallbackParams =
            serde_urlencoded::from_str(req.uri().query().unwrap_or("")).unwrap_or_default();
        let outcome = self.complete(params).await;

        match &outcome {
            AuthOutcome::Authorized { expires_at } => {
                self.enter(AuthPhase::Succeeded).await;
                info!(%expires_at, "Authorization succeeded");
            }
            AuthOutcome::Failed(failure) => {
                self.enter(AuthPhase::Failed).await;
                warn!(?failure, "Authorization failed");
            }
        }

        let response = render(&outcome);
        *self.outcome.lock().await = Some(outcome);
        response
    }

    async fn complete(&self, params: CallbackParams) -> AuthOutcome {
        if let Some(error) = params.error {
            return AuthOutcome::Failed(AuthFailure::Denied(
                params.error_description.unwrap_or(error),
            ));
        }

        let mut tokens = self.tokens.lock().await;
        let state_ok = match (tokens.pending_state(), params.state.as_deref()) {
            (Some(expected), Some(received)) => expected == received,
            _ => false,
        };
        if !state_ok {
            return AuthOutcome::Failed(AuthFailure::StateMismatch);
        }

        let Some(code) = params.code.filter(|c| !c.is_empty()) else {
            return AuthOutcome::Failed(AuthFailure::MissingCode);
        };

        self.enter(AuthPhase::Exchanging).await;
        let grant = match self.oauth.exchange_code(&code).await {
            Ok(grant) => grant,
            Err(e) => return AuthOutcome::Failed(AuthFailure::Exchange(e)),
        };

        let expires_at = grant.expires_at(Utc::now());
        match tokens.save(&grant.access_token, expires_at) {
            Ok(()) => AuthOutcome::Authorized { expires_at },
            Err(e) => AuthOutcome::Failed(AuthFailure::Save(e)),
        }
    }
}

fn plain(status: StatusCode, text: &'static str) -> Response<Full<Bytes>> {
    let mut response = Response::new(Full::new(Bytes::from_static(text.as_bytes())));
    *response.status_mut() = status;
    response
}

fn render(outcome: &AuthOutcome) -> Response<Full<Bytes>> {
    let (class, content) = match outcome {
        AuthOutcome::Authorized { .. } => (
            "success",
            "<h1>Authorization was successful!</h1>\
             <p>You may now close this window/tab.</p>"
                .to_string(),
        ),
        AuthOutcome::Failed(failure) => ("fail", failure_content(failure)),
    };

    let page = format!(
        "<!DOCTYPE html>\n<html><head><title>{PAGE_TITLE}</title><style>\
         body{{font-family:sans-serif}}\
         h1{{font-size:20px}}\
         body>div{{width:400px;margin:50px auto;text-align:center;border:solid 1px transparent}}\
         body.fail>div{{background:#fdd}}\
         body.success>div{{background:#cfc}}\
         </style></head><body class=\"{class}\"><div>{content}</div></body></html>"
    );

    let mut response = Response::new(Full::new(Bytes::from(page)));
    response.headers_mut().insert(
        CONTENT_TYPE,
        hyper::header::HeaderValue::from_static("text/html; charset=utf-8"),
    );
    response
}

fn failure_content(failure: &AuthFailure) -> String {
    let detail = match failure {
        AuthFailure::StateMismatch => "<p>This callback does not belong to the authorization \
             request that is in progress. Start the authorization again.</p>"
            .to_string(),
        AuthFailure::MissingCode => {
            "<p>The callback did not include an authorization code.</p>".to_string()
        }
        AuthFailure::Denied(reason) => format!(
            "<p>Access was not granted:</p><pre>{}</pre>",
            escape_html(reason)
        ),
        AuthFailure::Exchange(Error::Api { status, body }) => format!(
            "<p>The token endpoint rejected the request ({}):</p><pre>{}</pre>",
            escape_html(&status.to_string()),
            escape_html(body)
        ),
        AuthFailure::Exchange(Error::Decode(e)) => format!(
            "<p>The token endpoint sent a response that could not be read:</p><pre>{}</pre>",
            escape_html(&e.to_string())
        ),
        AuthFailure::Exchange(e) => format!(
            "<p>Could not reach the token endpoint:</p><pre>{}</pre>",
            escape_html(&e.to_string())
        ),
        AuthFailure::Save(e) => format!(
            "<p>The authorization process itself passed, but there was an error \
             saving the token:</p><pre>{}</pre>",
            escape_html(&e.to_string())
        ),
    };
    format!("<h1>Authorization failed</h1>{detail}")
}

fn escape_html(text: &str) -> String {
    let mut escaped = String::with_capacity(text.len());
    for ch in text.chars() {
        match ch {
            '&' => escaped.push_str("&amp;"),
            '<' => escaped.push_str("&lt;"),
            '>' => escaped.push_str("&gt;"),
            '"' => escaped.push_str("&quot;"),
            '\'' => escaped.push_str("&#39;"),
            _ => escaped.push(ch),
        }
    }
    escaped
}

use http_body_util::Full;
use hyper::body::Bytes;
use hyper::header::{ACCEPT, CONTENT_TYPE, LOCATION};
use hyper::{Method, Request, StatusCode, Uri};
use serde_json::{json, Value};
use tracing::debug;

use crate::cache::AccountSource;
use crate::error::{Error, Result};
use crate::http::HttpClient;
use crate::model::{AccountData, HvacMode, Presence};
use crate::temperature::Temperature;

/// Redirects followed before giving up.
pub const MAX_REDIRECTS: usize = 3;

/// Which target field a temperature write goes to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TargetBound {
    /// `target_temperature_*`, for plain heat or cool mode.
    Single,
    High,
    Low,
}

impl TargetBound {
    /// In heat-cool mode a value below the current ambient temperature moves
    /// the low bound, anything else the high bound.
    pub fn for_mode(mode: HvacMode, target: Temperature, ambient: Temperature) -> Self {
        if mode != HvacMode::HeatCool {
            return TargetBound::Single;
        }
        if target < ambient.to_scale(target.scale()) {
            TargetBound::Low
        } else {
            TargetBound::High
        }
    }

    fn field(self, target: Temperature) -> String {
        let suffix = target.scale().api_suffix();
        match self {
            TargetBound::Single => format!("target_temperature_{suffix}"),
            TargetBound::High => format!("target_temperature_high_{suffix}"),
            TargetBound::Low => format!("target_temperature_low_{suffix}"),
        }
    }
}

/// Authenticated client for the data API, bound to one access token.
///
/// The token travels as the `auth` query parameter, which is what the
/// provider expects, not as an `Authorization` header.
pub struct NestSession {
    http: HttpClient,
    api_host: String,
    token: String,
}

impl NestSession {
    pub fn new(http: HttpClient, api_host: impl Into<String>, token: impl Into<String>) -> Self {
        Self {
            http,
            api_host: api_host.into(),
            token: token.into(),
        }
    }

    fn url(&self, path: &str) -> String {
        format!(
            "{}/{}?auth={}",
            self.api_host.trim_end_matches('/'),
            path.trim_start_matches('/'),
            urlencoding::encode(&self.token)
        )
    }

    pub async fn get(&self, path: &str) -> Result<Bytes> {
        self.request(Method::GET, path, None).await
    }

    pub async fn put(&self, path: &str, body: Bytes) -> Result<Bytes> {
        self.request(Method::PUT, path, Some(body)).await
    }

    pub async fn patch(&self, path: &str, body: Bytes) -> Result<Bytes> {
        self.request(Method::PATCH, path, Some(body)).await
    }

    /// Issue a request, re-sending the same method and body to the
    /// `Location` of each 307 response.
    async fn request(&self, method: Method, path: &str, body: Option<Bytes>) -> Result<Bytes> {
        let mut uri = self.url(path);
        let mut hops = 0;

        loop {
            let mut builder = Request::builder()
                .method(method.clone())
                .uri(&uri)
                .header(ACCEPT, "application/json");
            if body.is_some() {
                builder = builder.header(CONTENT_TYPE, "application/json");
            }
            let request = builder
                .body(Full::new(body.clone().unwrap_or_default()))
                .map_err(|e| Error::InvalidInput(format!("Invalid API URL: {e}")))?;

            debug!(%method, path, hops, "API request");
            let response = self.http.send(request).await?;
            debug!(%method, path, status = %response.status, "API response");

            if response.status == StatusCode::TEMPORARY_REDIRECT {
                if hops == MAX_REDIRECTS {
                    return Err(Error::TooManyRedirects(MAX_REDIRECTS));
                }
                let location = response
                    .headers
                    .get(LOCATION)
                    .and_then(|v| v.to_str().ok())
                    .ok_or_else(|| Error::Network("307 response without a Location header".into()))?;
                uri = resolve_location(&uri, location)?;
                hops += 1;
                continue;
            }

            if !response.status.is_success() {
                return Err(Error::Api {
                    status: response.status,
                    body: String::from_utf8_lossy(&response.body).into_owned(),
                });
            }

            return Ok(response.body);
        }
    }

    pub async fn get_all_account_data(&self) -> Result<AccountData> {
        let body = self.get("/").await?;
        Ok(serde_json::from_slice(&body)?)
    }

    /// Write a target temperature in its own scale, unrounded. Returns the
    /// value the API echoes back.
    pub async fn set_target_temperature(
        &self,
        device_id: &str,
        target: Temperature,
        bound: TargetBound,
    ) -> Result<Temperature> {
        let path = format!("/devices/thermostats/{device_id}/{}", bound.field(target));
        let body = self.put(&path, to_body(&json!(target.value()))?).await?;
        let confirmed: f64 = serde_json::from_slice(&body)?;
        Ok(Temperature::new(confirmed, target.scale()))
    }

    /// Move both ends of a heat-cool range in one request.
    pub async fn set_target_range(&self, device_id: &str, low: Temperature, high: Temperature) -> Result<()> {
        if low.scale() != high.scale() {
            return Err(Error::InvalidInput(
                "Range bounds must use the same temperature scale".into(),
            ));
        }
        let mut fields = serde_json::Map::new();
        fields.insert(TargetBound::Low.field(low), json!(low.value()));
        fields.insert(TargetBound::High.field(high), json!(high.value()));
        self.patch(
            &format!("/devices/thermostats/{device_id}"),
            to_body(&Value::Object(fields))?,
        )
        .await?;
        Ok(())
    }

    pub async fn set_hvac_mode(&self, device_id: &str, mode: HvacMode) -> Result<HvacMode> {
        let path = format!("/devices/thermostats/{device_id}/hvac_mode");
        let body = self.put(&path, to_body(&json!(mode))?).await?;
        Ok(serde_json::from_slice(&body)?)
    }

    pub async fn set_presence(&self, structure_id: &str, presence: Presence) -> Result<()> {
        let path = format!("/structures/{structure_id}/away");
        let body = self.put(&path, to_body(&json!(presence))?).await?;
        debug!(response = %String::from_utf8_lossy(&body), "Presence updated");
        Ok(())
    }
}

impl AccountSource for NestSession {
    async fn get_all_account_data(&self) -> Result<AccountData> {
        NestSession::get_all_account_data(self).await
    }
}

fn to_body(value: &Value) -> Result<Bytes> {
    Ok(Bytes::from(serde_json::to_vec(value)?))
}

/// Absolute `Location` values are used as-is; paths are resolved against
/// the scheme and authority of the request that was redirected.
fn resolve_location(current: &str, location: &str) -> Result<String> {
    if location.starts_with("http://") || location.starts_with("https://") {
        return Ok(location.to_string());
    }
    let current: Uri = current
        .parse()
        .map_err(|e| Error::Network(format!("Invalid redirect base: {e}")))?;
    let (Some(scheme), Some(authority)) = (current.scheme_str(), current.authority()) else {
        return Err(Error::Network(format!("Cannot resolve redirect to {location}")));
    };
    let path = if location.starts_with('/') {
        location.to_string()
    } else {
        format!("/{location}")
    };
    Ok(format!("{scheme}://{authority}{path}"))
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    use super::*;
    use crate::model::fixtures;
    use crate::temperature::Scale;
    use crate::test_support::{json_response, redirect_response, MockServer};

    fn session(server: &MockServer) -> NestSession {
        NestSession::new(
            HttpClient::new(Duration::from_secs(5)),
            server.base_url(),
            "c.tok/en+1",
        )
    }

    #[tokio::test]
    async fn token_is_sent_as_auth_query_parameter() {
        let server = MockServer::start(|_| json_response(StatusCode::OK, fixtures::ALL_DATA)).await;

        let data = session(&server).get_all_account_data().await.unwrap();
        assert_eq!(data.devices.thermostats.len(), 2);

        let requests = server.requests();
        assert_eq!(requests.len(), 1);
        assert_eq!(requests[0].method, Method::GET);
        assert_eq!(requests[0].path, "/");
        assert_eq!(
            requests[0].query_pairs(),
            vec![("auth".to_string(), "c.tok/en+1".to_string())]
        );
        assert!(requests[0].headers.get("authorization").is_none());
        assert_eq!(requests[0].headers[ACCEPT], "application/json");
    }

    #[tokio::test]
    async fn follows_redirects_with_same_method_and_body() {
        let hits = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&hits);
        let server = MockServer::start(move |_| {
            if counter.fetch_add(1, Ordering::SeqCst) < 3 {
                redirect_response("/firebase/redirected?auth=c.token")
            } else {
                json_response(StatusCode::OK, "21.5")
            }
        })
        .await;

        let confirmed = session(&server)
            .set_target_temperature("dev-a", Temperature::Celsius(21.5), TargetBound::Single)
            .await
            .unwrap();
        assert_eq!(confirmed, Temperature::Celsius(21.5));

        let requests = server.requests();
        assert_eq!(requests.len(), 4);
        assert_eq!(requests[0].path, "/devices/thermostats/dev-a/target_temperature_c");
        for request in &requests[1..] {
            assert_eq!(request.method, Method::PUT);
            assert_eq!(request.path, "/firebase/redirected");
            assert_eq!(request.body_text(), "21.5");
        }
    }

    #[tokio::test]
    async fn fourth_consecutive_redirect_is_an_error() {
        let server = MockServer::start(|_| redirect_response("/again")).await;

        let err = session(&server).get("/").await.unwrap_err();

        assert!(matches!(err, Error::TooManyRedirects(3)));
        assert_eq!(server.requests().len(), 4);
    }

    #[tokio::test]
    async fn absolute_redirect_goes_to_other_host() {
        let target = MockServer::start(|_| json_response(StatusCode::OK, "\"away\"")).await;
        let location = target.url("/structures/st-1/away?auth=c.token");
        let origin = MockServer::start(move |_| redirect_response(&location)).await;

        session(&origin)
            .set_presence("st-1", Presence::Away)
            .await
            .unwrap();

        assert_eq!(origin.requests().len(), 1);
        let forwarded = target.requests();
        assert_eq!(forwarded.len(), 1);
        assert_eq!(forwarded[0].method, Method::PUT);
        assert_eq!(forwarded[0].body_text(), "\"away\"");
    }

    #[tokio::test]
    async fn error_status_surfaces_without_retry() {
        let server = MockServer::start(|_| {
            json_response(StatusCode::BAD_REQUEST, r#"{"error":"Temperature out of range"}"#)
        })
        .await;

        let err = session(&server)
            .set_hvac_mode("dev-a", HvacMode::Cool)
            .await
            .unwrap_err();

        match err {
            Error::Api { status, body } => {
                assert_eq!(status, StatusCode::BAD_REQUEST);
                assert!(body.contains("out of range"));
            }
            other => panic!("unexpected error: {other:?}"),
        }
        assert_eq!(server.requests().len(), 1);
    }

    #[tokio::test]
    async fn malformed_json_is_a_decode_error() {
        let server = MockServer::start(|_| json_response(StatusCode::OK, "<html>")).await;
        let err = session(&server).get_all_account_data().await.unwrap_err();
        assert!(matches!(err, Error::Decode(_)));
    }

    #[tokio::test]
    async fn range_bounds_map_to_distinct_fields() {
        let server = MockServer::start(|req| json_response(StatusCode::OK, &req.body_text())).await;
        let session = session(&server);

        session
            .set_target_temperature("dev-b", Temperature::Fahrenheit(65.0), TargetBound::Low)
            .await
            .unwrap();
        session
            .set_target_temperature("dev-b", Temperature::Fahrenheit(76.5), TargetBound::High)
            .await
            .unwrap();

        let requests = server.requests();
        assert_eq!(requests[0].path, "/devices/thermostats/dev-b/target_temperature_low_f");
        assert_eq!(requests[1].path, "/devices/thermostats/dev-b/target_temperature_high_f");
        assert_eq!(requests[1].body_text(), "76.5");
    }

    #[tokio::test]
    async fn range_update_uses_patch() {
        let server = MockServer::start(|req| json_response(StatusCode::OK, &req.body_text())).await;

        session(&server)
            .set_target_range("dev-b", Temperature::Celsius(19.0), Temperature::Celsius(24.5))
            .await
            .unwrap();

        let request = &server.requests()[0];
        assert_eq!(request.method, Method::PATCH);
        assert_eq!(request.path, "/devices/thermostats/dev-b");
        let body: Value = serde_json::from_slice(&request.body).unwrap();
        assert_eq!(body["target_temperature_low_c"], 19.0);
        assert_eq!(body["target_temperature_high_c"], 24.5);

        let mixed = session(&server)
            .set_target_range("dev-b", Temperature::Celsius(19.0), Temperature::Fahrenheit(76.0))
            .await;
        assert!(matches!(mixed, Err(Error::InvalidInput(_))));
    }

    #[test]
    fn bound_selection_in_range_mode() {
        let ambient = Temperature::Fahrenheit(70.0);
        assert_eq!(
            TargetBound::for_mode(HvacMode::HeatCool, Temperature::Fahrenheit(66.0), ambient),
            TargetBound::Low
        );
        assert_eq!(
            TargetBound::for_mode(HvacMode::HeatCool, Temperature::Fahrenheit(74.0), ambient),
            TargetBound::High
        );
        assert_eq!(
            TargetBound::for_mode(HvacMode::HeatCool, Temperature::Fahrenheit(70.0), ambient),
            TargetBound::High
        );
        assert_eq!(
            TargetBound::for_mode(HvacMode::Heat, Temperature::Fahrenheit(60.0), ambient),
            TargetBound::Single
        );

        // 20°C is 68°F, below a 70°F ambient.
        assert_eq!(
            TargetBound::for_mode(HvacMode::HeatCool, Temperature::Celsius(20.0), ambient),
            TargetBound::Low
        );
        assert_eq!(TargetBound::Low.field(Temperature::new(1.0, Scale::Fahrenheit)), "target_temperature_low_f");
    }

    #[test]
    fn relative_locations_resolve_against_current_host() {
        assert_eq!(
            resolve_location("https://developer-api.nest.com/?auth=x", "/next?auth=x").unwrap(),
            "https://developer-api.nest.com/next?auth=x"
        );
        assert_eq!(
            resolve_location("https://a.example/", "https://b.example/x").unwrap(),
            "https://b.example/x"
        );
    }
}

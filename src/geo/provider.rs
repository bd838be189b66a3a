//! Location sources.

use async_trait::async_trait;
use serde::Deserialize;

use crate::config::GeoConfig;

/// Coordinates reported by a provider.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Coordinates {
    pub lat: f64,
    pub lng: f64,
}

#[derive(Debug, thiserror::Error)]
pub enum LocationError {
    #[error("location permission denied")]
    PermissionDenied,
    #[error("location request timed out")]
    Timeout,
    #[error("location unavailable: {0}")]
    Unavailable(String),
}

/// A source of the device's current position.
#[async_trait]
pub trait LocationProvider: Send + Sync {
    fn name(&self) -> &str;

    async fn current_position(&self) -> Result<Coordinates, LocationError>;
}

/// Factory: pick the provider described by config.
pub fn provider_from_config(config: &GeoConfig) -> Box<dyn LocationProvider> {
    if !config.enabled {
        return Box::new(DeniedLocationProvider);
    }
    if let Some(fixed) = config.fixed_position {
        return Box::new(FixedLocationProvider::new(fixed.lat, fixed.lng));
    }
    if let Some(url) = config.lookup_url.as_deref().filter(|u| !u.trim().is_empty()) {
        return Box::new(HttpLocationProvider::new(url));
    }
    tracing::debug!("No location source configured; geolocation headers disabled");
    Box::new(DeniedLocationProvider)
}

/// Always reports the same coordinates.
pub struct FixedLocationProvider {
    coords: Coordinates,
}

impl FixedLocationProvider {
    pub fn new(lat: f64, lng: f64) -> Self {
        Self {
            coords: Coordinates { lat, lng },
        }
    }
}

#[async_trait]
impl LocationProvider for FixedLocationProvider {
    fn name(&self) -> &str {
        "fixed"
    }

    async fn current_position(&self) -> Result<Coordinates, LocationError> {
        Ok(self.coords)
    }
}

/// Geolocation turned off or not permitted on this host.
pub struct DeniedLocationProvider;

#[async_trait]
impl LocationProvider for DeniedLocationProvider {
    fn name(&self) -> &str {
        "denied"
    }

    async fn current_position(&self) -> Result<Coordinates, LocationError> {
        Err(LocationError::PermissionDenied)
    }
}

/// IP-based lookup against an HTTP endpoint.
///
/// Accepts `lat`/`latitude` and `lng`/`lon`/`longitude`, optionally nested
/// under `data`.
pub struct HttpLocationProvider {
    url: String,
    http: reqwest::Client,
}

/// One field per spelling; a body may carry several.
#[derive(Debug, Deserialize)]
struct LookupBody {
    lat: Option<f64>,
    latitude: Option<f64>,
    lng: Option<f64>,
    lon: Option<f64>,
    longitude: Option<f64>,
    data: Option<Box<LookupBody>>,
}

impl LookupBody {
    fn coordinates(&self) -> Option<Coordinates> {
        let lat = self.lat.or(self.latitude);
        let lng = self.lng.or(self.lon).or(self.longitude);
        match (lat, lng) {
            (Some(lat), Some(lng)) => Some(Coordinates { lat, lng }),
            _ => self.data.as_ref().and_then(|d| d.coordinates()),
        }
    }
}

impl HttpLocationProvider {
    pub fn new(url: &str) -> Self {
        Self {
            url: url.to_string(),
            http: reqwest::Client::new(),
        }
    }
}

#[async_trait]
impl LocationProvider for HttpLocationProvider {
    fn name(&self) -> &str {
        "http"
    }

    async fn current_position(&self) -> Result<Coordinates, LocationError> {
        let resp = self
            .http
            .get(&self.url)
            .send()
            .await
            .map_err(|e| LocationError::Unavailable(e.to_string()))?;

        if resp.status() == reqwest::StatusCode::FORBIDDEN {
            return Err(LocationError::PermissionDenied);
        }
        if !resp.status().is_success() {
            return Err(LocationError::Unavailable(format!(
                "lookup returned {}",
                resp.status()
            )));
        }

        let body: LookupBody = resp
            .json()
            .await
            .map_err(|e| LocationError::Unavailable(e.to_string()))?;
        body.coordinates()
            .ok_or_else(|| LocationError::Unavailable("lookup response has no coordinates".into()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::FixedPosition;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[test]
    fn factory_disabled_is_denied() {
        let cfg = GeoConfig {
            enabled: false,
            fixed_position: Some(FixedPosition { lat: 1.0, lng: 2.0 }),
            ..GeoConfig::default()
        };
        assert_eq!(provider_from_config(&cfg).name(), "denied");
    }

    #[test]
    fn factory_prefers_fixed() {
        let cfg = GeoConfig {
            fixed_position: Some(FixedPosition { lat: 1.0, lng: 2.0 }),
            lookup_url: Some("http://localhost/geo".into()),
            ..GeoConfig::default()
        };
        assert_eq!(provider_from_config(&cfg).name(), "fixed");
    }

    #[test]
    fn factory_without_source_is_denied() {
        assert_eq!(provider_from_config(&GeoConfig::default()).name(), "denied");
    }

    #[tokio::test]
    async fn fixed_provider_reports_coordinates() {
        let p = FixedLocationProvider::new(37.5, 127.0);
        assert_eq!(
            p.current_position().await.unwrap(),
            Coordinates { lat: 37.5, lng: 127.0 }
        );
    }

    #[tokio::test]
    async fn denied_provider_errors() {
        assert!(matches!(
            DeniedLocationProvider.current_position().await,
            Err(LocationError::PermissionDenied)
        ));
    }

    #[tokio::test]
    async fn http_provider_parses_aliases() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/geo"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(serde_json::json!({"latitude": 35.1, "lon": 129.0})),
            )
            .mount(&server)
            .await;

        let p = HttpLocationProvider::new(&format!("{}/geo", server.uri()));
        let coords = p.current_position().await.unwrap();
        assert_eq!(coords, Coordinates { lat: 35.1, lng: 129.0 });
    }

    #[tokio::test]
    async fn http_provider_accepts_repeated_spellings() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/geo"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "lat": 37.5,
                "latitude": 37.5,
                "lon": 127.0,
                "longitude": 127.0,
                "city": "Seoul"
            })))
            .mount(&server)
            .await;

        let p = HttpLocationProvider::new(&format!("{}/geo", server.uri()));
        assert_eq!(
            p.current_position().await.unwrap(),
            Coordinates { lat: 37.5, lng: 127.0 }
        );
    }

    #[tokio::test]
    async fn http_provider_reads_nested_data() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/geo"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(serde_json::json!({"data": {"lat": 1.5, "lng": 2.5}})),
            )
            .mount(&server)
            .await;

        let p = HttpLocationProvider::new(&format!("{}/geo", server.uri()));
        assert_eq!(
            p.current_position().await.unwrap(),
            Coordinates { lat: 1.5, lng: 2.5 }
        );
    }

    #[tokio::test]
    async fn http_provider_forbidden_is_denial() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(403))
            .mount(&server)
            .await;

        let p = HttpLocationProvider::new(&format!("{}/geo", server.uri()));
        assert!(matches!(
            p.current_position().await,
            Err(LocationError::PermissionDenied)
        ));
    }

    #[tokio::test]
    async fn http_provider_missing_fields_unavailable() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({"city": "Seoul"})))
            .mount(&server)
            .await;

        let p = HttpLocationProvider::new(&format!("{}/geo", server.uri()));
        assert!(matches!(
            p.current_position().await,
            Err(LocationError::Unavailable(_))
        ));
    }
}

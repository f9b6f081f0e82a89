use crate::config::*;
use crate::structs::*;

use std::{collections::HashMap, fmt, future::Future, pin::Pin};

use chrono::{TimeZone, Utc};
use reqwest::header::{ACCEPT, USER_AGENT};
use serde::Deserialize;
use serde_json::Value;

//////////////////////////////////////////////////////////
// Errors
//////////////////////////////////////////////////////////
#[derive(Debug, Clone, PartialEq)]
pub enum FetchError {
    Transport(String),
    Malformed(String),
    Precondition(String),
}

impl fmt::Display for FetchError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FetchError::Transport(e) => write!(f, "Transport error: {}", e),
            FetchError::Malformed(e) => write!(f, "Malformed response: {}", e),
            FetchError::Precondition(e) => write!(f, "Precondition failed: {}", e),
        }
    }
}

impl std::error::Error for FetchError {}

impl From<reqwest::Error> for FetchError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_decode() {
            FetchError::Malformed(e.to_string())
        } else {
            FetchError::Transport(e.to_string())
        }
    }
}

impl From<serde_json::Error> for FetchError {
    fn from(e: serde_json::Error) -> Self {
        FetchError::Malformed(e.to_string())
    }
}

pub type FetchResult<T> = Result<T, FetchError>;

fn malformed(what: &str) -> FetchError {
    FetchError::Malformed(format!("missing or invalid `{}`", what))
}

fn f64_at(v: &Value, what: &str) -> FetchResult<f64> {
    v.as_f64().ok_or_else(|| malformed(what))
}

fn opt_string(v: &Value) -> Option<String> {
    v.as_str().map(ToOwned::to_owned)
}

//////////////////////////////////////////////////////////
// API calls
//////////////////////////////////////////////////////////
const NO_QUERY: [(&str, &str); 0] = [];

async fn get_json<Q: serde::Serialize + ?Sized>(
    client: &reqwest::Client,
    url: &str,
    query: &Q,
) -> FetchResult<Value> {
    log::debug!("GET {}", url);
    let json = client
        .get(url)
        .query(query)
        .header(ACCEPT, "application/json")
        .header(USER_AGENT, concat!("bikemap-bot/", env!("CARGO_PKG_VERSION")))
        .send()
        .await?
        .error_for_status()?
        .json::<Value>()
        .await?;
    Ok(json)
}

pub async fn list_networks(client: &reqwest::Client) -> FetchResult<Vec<Network>> {
    let json = get_json(client, CITYBIKES_URL, &NO_QUERY).await?;
    parse_networks(json)
}

pub async fn get_network_detail(client: &reqwest::Client, id: &str) -> FetchResult<NetworkDetail> {
    let url = format!("{}/{}", CITYBIKES_URL, id);
    let json = get_json(client, &url, &NO_QUERY).await?;
    parse_network_detail(json)
}

pub async fn get_weather(client: &reqwest::Client, at: Coordinates) -> FetchResult<WeatherCondition> {
    let query = [
        ("latitude", at.lat.to_string()),
        ("longitude", at.lon.to_string()),
        ("current_weather", "true".to_string()),
        ("hourly", "precipitation,windspeed_10m".to_string()),
    ];
    let json = get_json(client, OPEN_METEO_URL, &query).await?;
    parse_weather(&json)
}

pub async fn get_air_quality(client: &reqwest::Client, at: Coordinates) -> FetchResult<AirQuality> {
    let query = [
        ("latitude", at.lat.to_string()),
        ("longitude", at.lon.to_string()),
        ("current", "pm10,pm2_5,carbon_monoxide,nitrogen_dioxide,ozone".to_string()),
    ];
    let json = get_json(client, AIR_QUALITY_URL, &query).await?;
    parse_air_quality(&json)
}

pub async fn list_recent_earthquakes(client: &reqwest::Client) -> FetchResult<Vec<Earthquake>> {
    let json = get_json(client, USGS_FEED_URL, &NO_QUERY).await?;
    parse_earthquakes(&json)
}

pub async fn list_charge_stations(
    client: &reqwest::Client,
    at: Coordinates,
    radius_km: f64,
) -> FetchResult<Vec<ChargeStation>> {
    let query = [
        ("output", "json".to_string()),
        ("latitude", at.lat.to_string()),
        ("longitude", at.lon.to_string()),
        ("distance", radius_km.to_string()),
        ("distanceunit", "km".to_string()),
        ("maxresults", CHARGER_MAX_RESULTS.to_string()),
        ("compact", "true".to_string()),
        ("verbose", "false".to_string()),
    ];
    let json = get_json(client, OPEN_CHARGE_MAP_URL, &query).await?;
    parse_charge_stations(&json)
}

pub async fn list_pois(
    client: &reqwest::Client,
    at: Coordinates,
    kind: PoiKind,
    radius_m: f64,
) -> FetchResult<Vec<Poi>> {
    let json = get_json(client, OVERPASS_URL, &[("data", overpass_query(at, kind, radius_m))]).await?;
    parse_pois(&json, kind)
}

pub async fn get_cycling_route(
    client: &reqwest::Client,
    from: Coordinates,
    to: Coordinates,
) -> FetchResult<Route> {
    // The router takes and returns (lon, lat) pairs
    let url = format!(
        "{}/{},{};{},{}",
        OSRM_URL, from.lon, from.lat, to.lon, to.lat
    );
    let json = get_json(client, &url, &[("overview", "full"), ("geometries", "geojson")]).await?;
    parse_route(&json)
}

pub fn overpass_query(at: Coordinates, kind: PoiKind, radius_m: f64) -> String {
    format!(
        "[out:json];node[\"{}\"](around:{},{},{});out;",
        kind.osm_tag(),
        radius_m,
        at.lat,
        at.lon
    )
}

//////////////////////////////////////////////////////////
// Response shapes
//////////////////////////////////////////////////////////
#[derive(Deserialize)]
struct NetworksEnvelope {
    networks: Vec<Network>,
}

#[derive(Deserialize)]
struct NetworkEnvelope {
    network: NetworkDetail,
}

pub fn parse_networks(json: Value) -> FetchResult<Vec<Network>> {
    let envelope: NetworksEnvelope = serde_json::from_value(json)?;
    Ok(envelope.networks)
}

pub fn parse_network_detail(json: Value) -> FetchResult<NetworkDetail> {
    let envelope: NetworkEnvelope = serde_json::from_value(json)?;
    Ok(envelope.network)
}

pub fn parse_weather(json: &Value) -> FetchResult<WeatherCondition> {
    let current = &json["current_weather"];
    if !current.is_object() {
        return Err(malformed("current_weather"));
    }
    let code = f64_at(&current["weathercode"], "current_weather.weathercode")? as u32;

    Ok(WeatherCondition {
        temperature: f64_at(&current["temperature"], "current_weather.temperature")?,
        wind_speed: f64_at(&current["windspeed"], "current_weather.windspeed")?,
        code,
        description: weather_description(code),
        time: opt_string(&current["time"]).unwrap_or_default(),
    })
}

pub fn parse_air_quality(json: &Value) -> FetchResult<AirQuality> {
    let current = &json["current"];
    if !current.is_object() {
        return Err(malformed("current"));
    }
    let pm2_5 = f64_at(&current["pm2_5"], "current.pm2_5")?;

    Ok(AirQuality {
        aqi: pm2_5.round() as i64,
        pm2_5,
        pm10: f64_at(&current["pm10"], "current.pm10")?,
        co: f64_at(&current["carbon_monoxide"], "current.carbon_monoxide")?,
        no2: f64_at(&current["nitrogen_dioxide"], "current.nitrogen_dioxide")?,
        o3: f64_at(&current["ozone"], "current.ozone")?,
        label: air_quality_label(pm2_5),
    })
}

/// Features missing a magnitude, time or position are skipped; only a
/// missing `features` array fails the feed.
pub fn parse_earthquakes(json: &Value) -> FetchResult<Vec<Earthquake>> {
    let features = json["features"].as_array().ok_or_else(|| malformed("features"))?;

    Ok(features
        .iter()
        .filter_map(|f| match parse_earthquake(f) {
            Ok(quake) => Some(quake),
            Err(e) => {
                log::debug!("Skipping earthquake {}: {}", f["id"], e);
                None
            }
        })
        .collect())
}

fn parse_earthquake(f: &Value) -> FetchResult<Earthquake> {
    let props = &f["properties"];
    // GeoJSON order: lon, lat, depth
    let coords = &f["geometry"]["coordinates"];
    let millis = props["time"].as_i64().ok_or_else(|| malformed("properties.time"))?;
    let time = Utc
        .timestamp_millis_opt(millis)
        .single()
        .ok_or_else(|| malformed("properties.time"))?;

    Ok(Earthquake {
        id: opt_string(&f["id"]).ok_or_else(|| malformed("id"))?,
        place: opt_string(&props["place"]).unwrap_or_default(),
        magnitude: f64_at(&props["mag"], "properties.mag")?,
        time,
        latitude: f64_at(&coords[1], "geometry.coordinates[1]")?,
        longitude: f64_at(&coords[0], "geometry.coordinates[0]")?,
        depth: coords[2].as_f64().unwrap_or_default(),
        alert: opt_string(&props["alert"]),
        tsunami: props["tsunami"].as_i64() == Some(1),
    })
}

pub fn parse_charge_stations(json: &Value) -> FetchResult<Vec<ChargeStation>> {
    let items = json.as_array().ok_or_else(|| malformed("charge station list"))?;

    items
        .iter()
        .map(|item| {
            let addr = &item["AddressInfo"];
            let connections = item["Connections"]
                .as_array()
                .map(|list| {
                    list.iter()
                        .map(|c| Connection {
                            kind: opt_string(&c["ConnectionType"]["Title"])
                                .unwrap_or_else(|| "Unknown".to_string()),
                            power_kw: c["PowerKW"].as_f64(),
                            quantity: c["Quantity"].as_u64().map(|q| q as u32),
                        })
                        .collect()
                })
                .unwrap_or_default();

            Ok(ChargeStation {
                id: item["ID"].as_i64().ok_or_else(|| malformed("ID"))?,
                title: opt_string(&addr["Title"]).unwrap_or_default(),
                latitude: f64_at(&addr["Latitude"], "AddressInfo.Latitude")?,
                longitude: f64_at(&addr["Longitude"], "AddressInfo.Longitude")?,
                usage: opt_string(&item["UsageType"]["Title"]),
                operator: opt_string(&item["OperatorInfo"]["Title"]),
                status: opt_string(&item["StatusType"]["Title"]),
                connections,
            })
        })
        .collect()
}

pub fn parse_pois(json: &Value, kind: PoiKind) -> FetchResult<Vec<Poi>> {
    let elements = json["elements"].as_array().ok_or_else(|| malformed("elements"))?;

    elements
        .iter()
        .map(|el| {
            let id = match &el["id"] {
                Value::Number(n) => n.to_string(),
                Value::String(s) => s.clone(),
                _ => return Err(malformed("elements[].id")),
            };
            let tags: HashMap<String, String> = el["tags"]
                .as_object()
                .map(|map| {
                    map.iter()
                        .filter_map(|(k, v)| v.as_str().map(|v| (k.clone(), v.to_string())))
                        .collect()
                })
                .unwrap_or_default();

            Ok(Poi {
                id,
                kind,
                name: tags.get("name").cloned(),
                latitude: f64_at(&el["lat"], "elements[].lat")?,
                longitude: f64_at(&el["lon"], "elements[].lon")?,
                tags,
            })
        })
        .collect()
}

/// Reads the first route of a router response, swapping each (lon, lat)
/// coordinate into (lat, lon).
pub fn parse_route(json: &Value) -> FetchResult<Route> {
    let route = &json["routes"][0];
    let coords = route["geometry"]["coordinates"]
        .as_array()
        .ok_or_else(|| match json["code"].as_str() {
            Some(code) if code != "Ok" => FetchError::Malformed(format!("router answered {}", code)),
            _ => malformed("routes[0].geometry.coordinates"),
        })?;

    let points = coords
        .iter()
        .map(|pair| {
            let lon = f64_at(&pair[0], "coordinate longitude")?;
            let lat = f64_at(&pair[1], "coordinate latitude")?;
            Ok([lat, lon])
        })
        .collect::<FetchResult<Vec<[f64; 2]>>>()?;

    Ok(Route {
        points,
        distance_m: route["distance"].as_f64(),
        duration_s: route["duration"].as_f64(),
    })
}

//////////////////////////////////////////////////////////
// Data source seam
//////////////////////////////////////////////////////////
pub type FetchFuture<T> = Pin<Box<dyn Future<Output = FetchResult<T>> + Send>>;

/// Everything the dashboard needs from the outside world.
pub trait DataSource: Send + Sync {
    fn list_networks(&self) -> FetchFuture<Vec<Network>>;
    fn get_network_detail(&self, id: &str) -> FetchFuture<NetworkDetail>;
    fn get_weather(&self, at: Coordinates) -> FetchFuture<WeatherCondition>;
    fn get_air_quality(&self, at: Coordinates) -> FetchFuture<AirQuality>;
    fn list_recent_earthquakes(&self) -> FetchFuture<Vec<Earthquake>>;
    fn list_charge_stations(&self, at: Coordinates, radius_km: f64) -> FetchFuture<Vec<ChargeStation>>;
    fn list_pois(&self, at: Coordinates, kind: PoiKind, radius_m: f64) -> FetchFuture<Vec<Poi>>;
    fn get_cycling_route(&self, from: Coordinates, to: Coordinates) -> FetchFuture<Route>;
}

/// The public web services.
#[derive(Clone)]
pub struct HttpSource {
    client: reqwest::Client,
}

impl HttpSource {
    pub fn new() -> Self {
        HttpSource { client: reqwest::Client::new() }
    }
}

impl Default for HttpSource {
    fn default() -> Self {
        HttpSource::new()
    }
}

impl DataSource for HttpSource {
    fn list_networks(&self) -> FetchFuture<Vec<Network>> {
        let client = self.client.clone();
        Box::pin(async move { list_networks(&client).await })
    }

    fn get_network_detail(&self, id: &str) -> FetchFuture<NetworkDetail> {
        let client = self.client.clone();
        let id = id.to_owned();
        Box::pin(async move { get_network_detail(&client, &id).await })
    }

    fn get_weather(&self, at: Coordinates) -> FetchFuture<WeatherCondition> {
        let client = self.client.clone();
        Box::pin(async move { get_weather(&client, at).await })
    }

    fn get_air_quality(&self, at: Coordinates) -> FetchFuture<AirQuality> {
        let client = self.client.clone();
        Box::pin(async move { get_air_quality(&client, at).await })
    }

    fn list_recent_earthquakes(&self) -> FetchFuture<Vec<Earthquake>> {
        let client = self.client.clone();
        Box::pin(async move { list_recent_earthquakes(&client).await })
    }

    fn list_charge_stations(&self, at: Coordinates, radius_km: f64) -> FetchFuture<Vec<ChargeStation>> {
        let client = self.client.clone();
        Box::pin(async move { list_charge_stations(&client, at, radius_km).await })
    }

    fn list_pois(&self, at: Coordinates, kind: PoiKind, radius_m: f64) -> FetchFuture<Vec<Poi>> {
        let client = self.client.clone();
        Box::pin(async move { list_pois(&client, at, kind, radius_m).await })
    }

    fn get_cycling_route(&self, from: Coordinates, to: Coordinates) -> FetchFuture<Route> {
        let client = self.client.clone();
        Box::pin(async move { get_cycling_route(&client, from, to).await })
    }
}

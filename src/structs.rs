use std::collections::{BTreeSet, HashMap};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;

use crate::config::TOP_STATIONS;

//////////////////////////////////////////////////////////
// Bike-share directory
//////////////////////////////////////////////////////////
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Network {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub company: Option<Company>,
    pub location: Location,
}

/// The directory lists operators either as one name or as several.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Company {
    One(String),
    Many(Vec<String>),
}

impl Company {
    pub fn names(&self) -> String {
        match self {
            Company::One(name) => name.clone(),
            Company::Many(names) => names.join(", "),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct Location {
    pub latitude: f64,
    pub longitude: f64,
    #[serde(default)]
    pub city: String,
    #[serde(default)]
    pub country: String,
}

impl Location {
    pub fn coordinates(&self) -> Coordinates {
        Coordinates::new(self.latitude, self.longitude)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NetworkDetail {
    #[serde(flatten)]
    pub network: Network,
    #[serde(default)]
    pub stations: Vec<Station>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Station {
    pub id: String,
    pub name: String,
    pub latitude: f64,
    pub longitude: f64,
    #[serde(default)]
    pub timestamp: Option<String>,
    /// A null count reads as zero.
    #[serde(default, deserialize_with = "null_as_zero")]
    pub free_bikes: u32,
    /// `None` means the operator does not report dock counts.
    #[serde(default)]
    pub empty_slots: Option<u32>,
    #[serde(default, deserialize_with = "lenient_extra")]
    pub extra: Option<StationExtra>,
}

fn null_as_zero<'de, D: Deserializer<'de>>(d: D) -> Result<u32, D::Error> {
    Ok(Option::<u32>::deserialize(d)?.unwrap_or_default())
}

/// Operators fill `extra` however they like; an unreadable one is dropped
/// instead of failing the whole network.
fn lenient_extra<'de, D: Deserializer<'de>>(d: D) -> Result<Option<StationExtra>, D::Error> {
    let raw = Value::deserialize(d)?;
    Ok(serde_json::from_value(raw).ok())
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct StationExtra {
    pub address: Option<String>,
    pub slots: Option<u32>,
    pub ebikes: Option<u32>,
    pub has_ebikes: Option<bool>,
    pub renting: Option<u8>,
    pub returning: Option<u8>,
    #[serde(default)]
    pub payment: Vec<String>,
}

impl Station {
    pub fn coordinates(&self) -> Coordinates {
        Coordinates::new(self.latitude, self.longitude)
    }
}

/// Totals over every station of a network.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Occupancy {
    pub free_bikes: u64,
    /// Sum over the stations that report a dock count.
    pub empty_slots: u64,
    /// Stations that do not report a dock count.
    pub unknown_slots: usize,
}

impl Occupancy {
    pub fn capacity_is_exact(&self) -> bool {
        self.unknown_slots == 0
    }
}

impl NetworkDetail {
    pub fn occupancy(&self) -> Occupancy {
        self.stations.iter().fold(Occupancy::default(), |mut acc, s| {
            acc.free_bikes += u64::from(s.free_bikes);
            match s.empty_slots {
                Some(n) => acc.empty_slots += u64::from(n),
                None => acc.unknown_slots += 1,
            }
            acc
        })
    }

    /// Stations with most free bikes first.
    pub fn top_stations(&self) -> Vec<&Station> {
        let mut stations: Vec<&Station> = self.stations.iter().collect();
        stations.sort_by(|a, b| b.free_bikes.cmp(&a.free_bikes));
        stations.truncate(TOP_STATIONS);
        stations
    }

    pub fn station(&self, id: &str) -> Option<&Station> {
        self.stations.iter().find(|s| s.id == id)
    }
}

//////////////////////////////////////////////////////////
// Map
//////////////////////////////////////////////////////////
/// A (latitude, longitude) pair.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct Coordinates {
    pub lat: f64,
    pub lon: f64,
}

impl Coordinates {
    pub fn new(lat: f64, lon: f64) -> Self {
        Coordinates { lat, lon }
    }

    /// Great-circle distance in kilometres.
    pub fn distance_km(&self, other: &Coordinates) -> f64 {
        const EARTH_RADIUS_KM: f64 = 6371.0;
        let (lat1, lat2) = (self.lat.to_radians(), other.lat.to_radians());
        let dlat = lat2 - lat1;
        let dlon = (other.lon - self.lon).to_radians();
        let a = (dlat / 2.0).sin().powi(2) + lat1.cos() * lat2.cos() * (dlon / 2.0).sin().powi(2);
        2.0 * EARTH_RADIUS_KM * a.sqrt().asin()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SmartLayer {
    Weather,
    Earthquakes,
    EvStations,
    Pois,
}

impl SmartLayer {
    pub const ALL: [SmartLayer; 4] = [
        SmartLayer::Weather,
        SmartLayer::Earthquakes,
        SmartLayer::EvStations,
        SmartLayer::Pois,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            SmartLayer::Weather => "weather",
            SmartLayer::Earthquakes => "earthquakes",
            SmartLayer::EvStations => "evStations",
            SmartLayer::Pois => "pois",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        SmartLayer::ALL.into_iter().find(|l| l.name() == name)
    }

    /// Global layers ignore the map center.
    pub fn is_global(&self) -> bool {
        matches!(self, SmartLayer::Earthquakes)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SmartLayers {
    pub weather: bool,
    pub earthquakes: bool,
    pub ev_stations: bool,
    pub pois: bool,
}

impl Default for SmartLayers {
    fn default() -> Self {
        SmartLayers {
            weather: true,
            earthquakes: false,
            ev_stations: false,
            pois: false,
        }
    }
}

impl SmartLayers {
    pub fn is_enabled(&self, layer: SmartLayer) -> bool {
        match layer {
            SmartLayer::Weather => self.weather,
            SmartLayer::Earthquakes => self.earthquakes,
            SmartLayer::EvStations => self.ev_stations,
            SmartLayer::Pois => self.pois,
        }
    }

    /// Flips one toggle and returns its new value.
    pub fn flip(&mut self, layer: SmartLayer) -> bool {
        let flag = match layer {
            SmartLayer::Weather => &mut self.weather,
            SmartLayer::Earthquakes => &mut self.earthquakes,
            SmartLayer::EvStations => &mut self.ev_stations,
            SmartLayer::Pois => &mut self.pois,
        };
        *flag = !*flag;
        *flag
    }
}

//////////////////////////////////////////////////////////
// Overlays
//////////////////////////////////////////////////////////
#[derive(Debug, Clone, PartialEq)]
pub struct WeatherCondition {
    pub temperature: f64,
    pub wind_speed: f64,
    pub code: u32,
    pub description: &'static str,
    pub time: String,
}

pub fn weather_description(code: u32) -> &'static str {
    match code {
        0 => "Clear Sky",
        1..=3 => "Partly Cloudy",
        4..=48 => "Foggy",
        49..=55 => "Drizzle",
        56..=65 => "Rainy",
        66..=75 => "Snowy",
        76..=82 => "Rain Showers",
        _ => "Stormy",
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct AirQuality {
    pub aqi: i64,
    pub pm2_5: f64,
    pub pm10: f64,
    pub co: f64,
    pub no2: f64,
    pub o3: f64,
    pub label: &'static str,
}

pub fn air_quality_label(pm2_5: f64) -> &'static str {
    if pm2_5 <= 12.0 {
        "Healthy Area"
    } else if pm2_5 <= 35.0 {
        "Sensitive Alert"
    } else if pm2_5 <= 55.0 {
        "Unhealthy Air"
    } else {
        "Hazardous"
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Earthquake {
    pub id: String,
    pub place: String,
    pub magnitude: f64,
    pub time: DateTime<Utc>,
    pub latitude: f64,
    pub longitude: f64,
    pub depth: f64,
    pub alert: Option<String>,
    pub tsunami: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ChargeStation {
    pub id: i64,
    pub title: String,
    pub latitude: f64,
    pub longitude: f64,
    pub usage: Option<String>,
    pub operator: Option<String>,
    pub status: Option<String>,
    pub connections: Vec<Connection>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Connection {
    pub kind: String,
    pub power_kw: Option<f64>,
    pub quantity: Option<u32>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum PoiKind {
    Toilet,
    #[default]
    Water,
    Parking,
    Bench,
    Pharmacy,
}

impl PoiKind {
    pub const ALL: [PoiKind; 5] = [
        PoiKind::Toilet,
        PoiKind::Water,
        PoiKind::Parking,
        PoiKind::Bench,
        PoiKind::Pharmacy,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            PoiKind::Toilet => "toilet",
            PoiKind::Water => "water",
            PoiKind::Parking => "parking",
            PoiKind::Bench => "bench",
            PoiKind::Pharmacy => "pharmacy",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        let name = name.trim().to_lowercase();
        PoiKind::ALL.into_iter().find(|k| k.name() == name)
    }

    /// OpenStreetMap tag selecting this kind of amenity.
    pub fn osm_tag(&self) -> &'static str {
        match self {
            PoiKind::Toilet => "amenity=toilets",
            PoiKind::Water => "amenity=drinking_water",
            PoiKind::Parking => "amenity=bicycle_parking",
            PoiKind::Bench => "amenity=bench",
            PoiKind::Pharmacy => "amenity=pharmacy",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Poi {
    pub id: String,
    pub kind: PoiKind,
    pub name: Option<String>,
    pub latitude: f64,
    pub longitude: f64,
    pub tags: HashMap<String, String>,
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct Route {
    /// Polyline in (latitude, longitude) order.
    pub points: Vec<[f64; 2]>,
    pub distance_m: Option<f64>,
    pub duration_s: Option<f64>,
}

//////////////////////////////////////////////////////////
// Favorites
//////////////////////////////////////////////////////////
#[derive(Clone, Debug, Serialize, Deserialize, Default, PartialEq, Eq)]
pub struct Favorites {
    #[serde(default)]
    pub networks: BTreeSet<String>,
    #[serde(default)]
    pub stations: BTreeSet<String>,
}

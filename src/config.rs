use std::{env, str::FromStr, time::Duration};

//////////////////////////////////////////////////////////
// Defaults
//////////////////////////////////////////////////////////
pub const FAVORITES_PATH: &str = "favorites.json";
pub const FAVORITES_KEY: &str = "citybikes-favorites";

pub const SEARCH_LIMIT: usize = 10;
pub const MIN_QUERY_LEN: usize = 2;
pub const TOP_STATIONS: usize = 5;

pub const PAN_DEBOUNCE_MS: u64 = 400;
pub const CHARGER_RADIUS_KM: f64 = 10.0;
pub const CHARGER_MAX_RESULTS: u32 = 50;
pub const POI_RADIUS_M: f64 = 1000.0;

pub const CITYBIKES_URL: &str = "https://api.citybik.es/v2/networks";
pub const OPEN_METEO_URL: &str = "https://api.open-meteo.com/v1/forecast";
pub const AIR_QUALITY_URL: &str = "https://air-quality-api.open-meteo.com/v1/air-quality";
pub const USGS_FEED_URL: &str =
    "https://earthquake.usgs.gov/earthquakes/feed/v1.0/summary/2.5_day.geojson";
pub const OPEN_CHARGE_MAP_URL: &str = "https://api.openchargemap.io/v3/poi/";
pub const OVERPASS_URL: &str = "https://overpass-api.de/api/interpreter";
pub const OSRM_URL: &str = "https://router.project-osrm.org/route/v1/bike";

/// Runtime settings, read once at startup after `.env` is loaded.
#[derive(Debug, Clone)]
pub struct Settings {
    pub favorites_path: String,
    pub pan_debounce: Duration,
    pub charger_radius_km: f64,
    pub poi_radius_m: f64,
}

impl Default for Settings {
    fn default() -> Self {
        Settings {
            favorites_path: FAVORITES_PATH.to_string(),
            pan_debounce: Duration::from_millis(PAN_DEBOUNCE_MS),
            charger_radius_km: CHARGER_RADIUS_KM,
            poi_radius_m: POI_RADIUS_M,
        }
    }
}

impl Settings {
    pub fn from_env() -> Self {
        let defaults = Settings::default();
        Settings {
            favorites_path: env::var("BIKEMAP_FAVORITES_PATH").unwrap_or(defaults.favorites_path),
            pan_debounce: env_parse::<u64>("BIKEMAP_PAN_DEBOUNCE_MS")
                .map(Duration::from_millis)
                .unwrap_or(defaults.pan_debounce),
            charger_radius_km: env_parse("BIKEMAP_CHARGER_RADIUS_KM")
                .unwrap_or(defaults.charger_radius_km),
            poi_radius_m: env_parse("BIKEMAP_POI_RADIUS_M").unwrap_or(defaults.poi_radius_m),
        }
    }
}

fn env_parse<T: FromStr>(name: &str) -> Option<T> {
    let raw = env::var(name).ok()?;
    match raw.parse() {
        Ok(v) => Some(v),
        Err(_) => {
            log::warn!("Ignoring {}={:?}: not a valid value", name, raw);
            None
        }
    }
}

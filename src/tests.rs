use crate::aggregator::*;
use crate::api::*;
use crate::config::Settings;
use crate::dashboard::Dashboard;
use crate::io::FavoritesStore;
use crate::render;
use crate::search;
use crate::structs::*;

use serde_json::json;
use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
    time::Duration,
};

//////////////////////////////////////////////////////////
// Fixtures
//////////////////////////////////////////////////////////
fn network(id: &str, name: &str, city: &str, country: &str) -> Network {
    Network {
        id: id.to_string(),
        name: name.to_string(),
        company: None,
        location: Location {
            latitude: 48.85,
            longitude: 2.35,
            city: city.to_string(),
            country: country.to_string(),
        },
    }
}

fn located(id: &str, lat: f64, lon: f64) -> Network {
    let mut n = network(id, id, "Somewhere", "XX");
    n.location.latitude = lat;
    n.location.longitude = lon;
    n
}

fn station(id: &str, free_bikes: u32, empty_slots: Option<u32>) -> Station {
    Station {
        id: id.to_string(),
        name: format!("Station {}", id),
        latitude: 48.86,
        longitude: 2.36,
        timestamp: None,
        free_bikes,
        empty_slots,
        extra: None,
    }
}

fn detail(network: Network, stations: Vec<Station>) -> NetworkDetail {
    NetworkDetail { network, stations }
}

fn favorites_of(networks: &[&str]) -> Favorites {
    Favorites {
        networks: networks.iter().map(|s| s.to_string()).collect(),
        stations: Default::default(),
    }
}

fn ticket_for(tickets: &[Ticket], source: Source) -> Ticket {
    tickets
        .iter()
        .find(|t| t.source() == source)
        .cloned()
        .unwrap_or_else(|| panic!("no {:?} ticket in {:?}", source, tickets))
}

fn sources(tickets: &[Ticket]) -> Vec<Source> {
    tickets.iter().map(|t| t.source()).collect()
}

fn quake(id: &str) -> Earthquake {
    Earthquake {
        id: id.to_string(),
        place: "Offshore".to_string(),
        magnitude: 3.1,
        time: chrono::Utc::now(),
        latitude: 10.0,
        longitude: 20.0,
        depth: 5.0,
        alert: None,
        tsunami: false,
    }
}

fn charger(id: i64) -> ChargeStation {
    ChargeStation {
        id,
        title: "Garage".to_string(),
        latitude: 48.0,
        longitude: 2.0,
        usage: None,
        operator: None,
        status: None,
        connections: vec![],
    }
}

fn weather() -> WeatherCondition {
    WeatherCondition {
        temperature: 18.5,
        wind_speed: 12.0,
        code: 2,
        description: weather_description(2),
        time: "2024-05-01T12:00".to_string(),
    }
}

//////////////////////////////////////////////////////////
// Search
//////////////////////////////////////////////////////////
#[test]
fn test_short_queries_match_nothing() {
    let networks = vec![network("1", "B", "B", "B"), network("2", "Bike", "Bern", "CH")];
    let favs = Favorites::default();

    assert!(search::filter(&networks, "", &favs).is_empty());
    assert!(search::filter(&networks, "b", &favs).is_empty());
    assert!(search::filter(&networks, "  B ", &favs).is_empty());
    assert_eq!(search::filter(&networks, "bi", &favs).len(), 1);
}

#[test]
fn test_favorites_come_first() {
    let networks = vec![
        network("1", "Bike City", "Paris", "FR"),
        network("2", "Bike Town", "Lyon", "FR"),
    ];
    let favs = favorites_of(&["2"]);

    let ids: Vec<&str> = search::filter(&networks, "bike", &favs)
        .iter()
        .map(|n| n.id.as_str())
        .collect();
    assert_eq!(ids, vec!["2", "1"]);
}

#[test]
fn test_search_matches_city_and_country_ignoring_case() {
    let networks = vec![
        network("velib", "Vélib' Métropole", "Paris", "FR"),
        network("bicing", "Bicing", "Barcelona", "ES"),
        network("citi", "Citi Bike", "New York", "US"),
    ];
    let favs = Favorites::default();

    let by_city: Vec<&str> = search::filter(&networks, "PARIS", &favs).iter().map(|n| n.id.as_str()).collect();
    assert_eq!(by_city, vec!["velib"]);

    let by_country: Vec<&str> = search::filter(&networks, "es", &favs).iter().map(|n| n.id.as_str()).collect();
    assert_eq!(by_country, vec!["bicing"]);
}

#[test]
fn test_search_sorts_by_name_and_truncates() {
    let networks: Vec<Network> = (0..15)
        .rev()
        .map(|i| network(&format!("n{}", i), &format!("Net {:02}", i), "Town", "XX"))
        .collect();
    // A favorite that sorts last still makes the cut
    let favs = favorites_of(&["n14"]);

    let found = search::filter(&networks, "net", &favs);
    let names: Vec<&str> = found.iter().map(|n| n.name.as_str()).collect();
    assert_eq!(found.len(), 10);
    assert_eq!(names[0], "Net 14");
    assert_eq!(&names[1..4], &["Net 00", "Net 01", "Net 02"]);

    assert_eq!(search::filter_with_limit(&networks, "net", &favs, 3).len(), 3);
}

//////////////////////////////////////////////////////////
// Favorites
//////////////////////////////////////////////////////////
#[test]
fn test_toggle_twice_restores_favorites() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("favorites.json");
    let mut store = FavoritesStore::open(&path, "k");
    store.toggle_favorite_station("s1");
    let before = store.favorites().clone();

    assert!(store.toggle_favorite_network("x"));
    assert!(store.favorites().networks.contains("x"));
    assert!(!store.toggle_favorite_network("x"));
    assert_eq!(store.favorites(), &before);

    assert!(!store.toggle_favorite_station("s1"));
    assert!(!store.is_favorite_station("s1"));
}

#[test]
fn test_storing_favorites() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("favorites.json");

    let mut store = FavoritesStore::open(&path, "citybikes-favorites");
    store.toggle_favorite_network("n1");

    let reloaded = FavoritesStore::open(&path, "citybikes-favorites");
    assert_eq!(reloaded.favorites(), &favorites_of(&["n1"]));

    let raw: serde_json::Value = serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
    assert_eq!(raw["citybikes-favorites"], json!({"networks": ["n1"], "stations": []}));
}

#[test]
fn test_malformed_favorites_load_empty() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("favorites.json");

    std::fs::write(&path, "not json at all").unwrap();
    assert_eq!(FavoritesStore::open(&path, "k").favorites(), &Favorites::default());

    std::fs::write(&path, r#"{"k": {"networks": 42}}"#).unwrap();
    assert_eq!(FavoritesStore::open(&path, "k").favorites(), &Favorites::default());

    let missing = dir.path().join("nope.json");
    assert_eq!(FavoritesStore::open(&missing, "k").favorites(), &Favorites::default());
}

#[test]
fn test_other_keys_survive_a_write() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("favorites.json");

    let mut alice = FavoritesStore::open(&path, "chat:1");
    alice.toggle_favorite_network("a");
    let mut bob = FavoritesStore::open(&path, "chat:2");
    bob.toggle_favorite_station("b");

    assert_eq!(FavoritesStore::open(&path, "chat:1").favorites(), &favorites_of(&["a"]));
    assert!(FavoritesStore::open(&path, "chat:2").is_favorite_station("b"));
}

//////////////////////////////////////////////////////////
// Aggregator
//////////////////////////////////////////////////////////
#[test]
fn test_start_fetches_directory_and_global_layers() {
    let mut agg = Aggregator::new();
    assert_eq!(sources(&agg.start()), vec![Source::Networks]);
    assert!(agg.view().is_loading());

    // Earthquakes are global: no map center needed
    assert_eq!(sources(&agg.toggle_smart_layer(SmartLayer::Earthquakes)), vec![Source::Earthquakes]);
    assert_eq!(sources(&agg.start()), vec![Source::Networks]);
}

#[test]
fn test_stale_selection_is_discarded() {
    let mut agg = Aggregator::new();
    let a = ticket_for(&agg.select_network("A"), Source::Detail);
    let b = ticket_for(&agg.select_network("B"), Source::Detail);

    agg.commit(b, Ok(Payload::Detail(detail(located("B", 1.0, 1.0), vec![station("b1", 3, Some(2))]))));
    agg.commit(a, Ok(Payload::Detail(detail(located("A", 2.0, 2.0), vec![station("a1", 9, Some(0))]))));

    let view = agg.view();
    assert_eq!(view.selected_id.as_deref(), Some("B"));
    let selected = view.selected_network().unwrap();
    assert_eq!(selected.network.id, "B");
    assert_eq!(selected.stations[0].id, "b1");
    assert_eq!(view.map_center, Some(Coordinates::new(1.0, 1.0)));
}

#[test]
fn test_stale_selection_failure_is_discarded() {
    let mut agg = Aggregator::new();
    let a = ticket_for(&agg.select_network("A"), Source::Detail);
    let b = ticket_for(&agg.select_network("B"), Source::Detail);

    agg.commit(a, Err(FetchError::Transport("timeout".to_string())));
    assert!(agg.view().selected.is_loading());

    agg.commit(b, Ok(Payload::Detail(detail(located("B", 1.0, 1.0), vec![]))));
    assert_eq!(agg.view().selected.status, FetchStatus::Loaded);
}

#[test]
fn test_failed_selection_surfaces_error() {
    let mut agg = Aggregator::new();
    let a = ticket_for(&agg.select_network("A"), Source::Detail);
    agg.commit(a, Ok(Payload::Detail(detail(located("A", 2.0, 2.0), vec![station("a1", 1, None)]))));

    let missing = ticket_for(&agg.select_network("missing"), Source::Detail);
    agg.commit(missing, Err(FetchError::Transport("404 Not Found".to_string())));

    let view = agg.view();
    assert_eq!(view.selected_id.as_deref(), Some("missing"));
    assert!(view.selected_network().is_none());
    assert_eq!(
        view.selected.error(),
        Some(&FetchError::Transport("404 Not Found".to_string()))
    );
}

#[test]
fn test_selecting_a_listed_network_moves_the_center() {
    let mut agg = Aggregator::new();
    let n = ticket_for(&agg.start(), Source::Networks);
    agg.commit(n, Ok(Payload::Networks(vec![located("velib", 48.85, 2.35)])));

    let tickets = agg.select_network("velib");
    assert_eq!(
        sources(&tickets),
        vec![Source::Detail, Source::Weather, Source::AirQuality]
    );
    assert_eq!(agg.view().map_center, Some(Coordinates::new(48.85, 2.35)));

    // The detail lands on the same spot: nothing more to fetch
    let d = ticket_for(&tickets, Source::Detail);
    let follow_ups = agg.commit(d, Ok(Payload::Detail(detail(located("velib", 48.85, 2.35), vec![]))));
    assert!(follow_ups.is_empty());
}

#[test]
fn test_selection_and_clear_drop_the_route() {
    let mut agg = Aggregator::new();
    agg.set_user_location(48.0, 2.0);
    let r = ticket_for(&agg.fetch_route(48.1, 2.1), Source::Route);
    agg.commit(r, Ok(Payload::Route(Route { points: vec![[48.0, 2.0], [48.1, 2.1]], ..Route::default() })));
    assert!(agg.view().route().is_some());

    agg.select_network("A");
    assert!(agg.view().route().is_none());

    let r = ticket_for(&agg.fetch_route(48.1, 2.1), Source::Route);
    agg.clear_selection();
    agg.commit(r, Ok(Payload::Route(Route::default())));
    let view = agg.view();
    assert!(view.route().is_none());
    assert!(view.selected_id.is_none());
    assert_eq!(view.selected.status, FetchStatus::Idle);
}

#[test]
fn test_same_center_issues_nothing() {
    let mut agg = Aggregator::new();
    assert_eq!(
        sources(&agg.update_map_center(45.0, 5.0)),
        vec![Source::Weather, Source::AirQuality]
    );
    assert!(agg.update_map_center(45.0, 5.0).is_empty());
    assert_eq!(agg.update_map_center(45.1, 5.0).len(), 2);
}

#[test]
fn test_newer_center_supersedes_overlay() {
    let mut agg = Aggregator::new();
    let first = ticket_for(&agg.update_map_center(45.0, 5.0), Source::Weather);
    let second = ticket_for(&agg.update_map_center(46.0, 6.0), Source::Weather);

    let mut late = weather();
    late.temperature = -40.0;
    agg.commit(second, Ok(Payload::Weather(weather())));
    agg.commit(first, Ok(Payload::Weather(late)));

    assert_eq!(agg.view().visible_weather().unwrap().temperature, 18.5);
}

#[test]
fn test_disabling_pois_keeps_other_layers() {
    let mut agg = Aggregator::new();
    agg.update_map_center(48.0, 2.0);

    let q = ticket_for(&agg.toggle_smart_layer(SmartLayer::Earthquakes), Source::Earthquakes);
    let e = ticket_for(&agg.toggle_smart_layer(SmartLayer::EvStations), Source::EvStations);
    let p = ticket_for(&agg.toggle_smart_layer(SmartLayer::Pois), Source::Pois);
    agg.commit(q, Ok(Payload::Earthquakes(vec![quake("us1")])));
    agg.commit(e, Ok(Payload::EvStations(vec![charger(7)])));
    agg.commit(p, Ok(Payload::Pois(vec![])));

    assert!(agg.toggle_smart_layer(SmartLayer::Pois).is_empty());

    let view = agg.view();
    assert!(!view.layers.pois);
    assert_eq!(view.visible_earthquakes().len(), 1);
    assert_eq!(view.visible_ev_stations()[0].id, 7);
    assert_eq!(view.earthquakes.status, FetchStatus::Loaded);
    assert_eq!(view.ev_stations.status, FetchStatus::Loaded);
}

#[test]
fn test_reenabling_a_layer_reuses_its_cache() {
    let mut agg = Aggregator::new();
    agg.update_map_center(48.0, 2.0);
    let e = ticket_for(&agg.toggle_smart_layer(SmartLayer::EvStations), Source::EvStations);
    agg.commit(e, Ok(Payload::EvStations(vec![charger(1)])));

    agg.toggle_smart_layer(SmartLayer::EvStations);
    assert!(agg.view().visible_ev_stations().is_empty());
    assert_eq!(agg.view().ev_stations.data.as_ref().map(Vec::len), Some(1));

    assert!(agg.toggle_smart_layer(SmartLayer::EvStations).is_empty());
    assert_eq!(agg.view().visible_ev_stations().len(), 1);

    // Hidden layers do not follow the map, but catch up when shown again
    agg.toggle_smart_layer(SmartLayer::EvStations);
    assert_eq!(sources(&agg.update_map_center(49.0, 3.0)), vec![Source::Weather, Source::AirQuality]);
    assert_eq!(sources(&agg.toggle_smart_layer(SmartLayer::EvStations)), vec![Source::EvStations]);
}

#[test]
fn test_center_layers_wait_for_a_center() {
    let mut agg = Aggregator::new();
    assert!(agg.toggle_smart_layer(SmartLayer::Pois).is_empty());
    assert_eq!(sources(&agg.toggle_smart_layer(SmartLayer::Earthquakes)), vec![Source::Earthquakes]);

    let tickets = agg.set_user_location(40.0, -3.7);
    assert_eq!(
        sources(&tickets),
        vec![Source::Weather, Source::AirQuality, Source::Pois]
    );
    assert_eq!(
        ticket_for(&tickets, Source::Pois).request,
        Request::Pois { at: Coordinates::new(40.0, -3.7), kind: PoiKind::Water }
    );
}

#[test]
fn test_user_location_is_taken_once() {
    let mut agg = Aggregator::new();
    agg.set_user_location(40.0, -3.7);
    assert!(agg.set_user_location(41.0, 2.0).is_empty());
    assert_eq!(agg.view().user_location, Some(Coordinates::new(40.0, -3.7)));
}

#[test]
fn test_poi_kind_change_refetches_when_shown() {
    let mut agg = Aggregator::new();
    agg.update_map_center(48.0, 2.0);
    assert!(agg.set_poi_kind(PoiKind::Toilet).is_empty());

    agg.toggle_smart_layer(SmartLayer::Pois);
    assert!(agg.set_poi_kind(PoiKind::Toilet).is_empty());
    let tickets = agg.set_poi_kind(PoiKind::Pharmacy);
    assert_eq!(
        ticket_for(&tickets, Source::Pois).request,
        Request::Pois { at: Coordinates::new(48.0, 2.0), kind: PoiKind::Pharmacy }
    );
}

#[test]
fn test_route_needs_user_location() {
    let mut agg = Aggregator::new();
    assert!(agg.fetch_route(48.0, 2.0).is_empty());
    assert!(matches!(agg.view().route.error(), Some(FetchError::Precondition(_))));
    assert!(agg.view().route().is_none());

    agg.set_user_location(47.0, 1.0);
    let tickets = agg.fetch_route(48.0, 2.0);
    assert_eq!(
        ticket_for(&tickets, Source::Route).request,
        Request::Route { from: Coordinates::new(47.0, 1.0), to: Coordinates::new(48.0, 2.0) }
    );
}

#[test]
fn test_failed_overlay_is_isolated() {
    let mut agg = Aggregator::new();
    let tickets = agg.update_map_center(48.0, 2.0);
    let w = ticket_for(&tickets, Source::Weather);
    let aq = ticket_for(&tickets, Source::AirQuality);

    agg.commit(w, Ok(Payload::Weather(weather())));
    agg.commit(aq, Err(FetchError::Malformed("missing or invalid `current`".to_string())));

    let view = agg.view();
    assert!(view.visible_weather().is_some());
    assert!(view.visible_air_quality().is_none());
    assert!(view.air_quality.error().is_some());

    // A failed source is retried on the next toggle
    agg.toggle_smart_layer(SmartLayer::Weather);
    assert_eq!(sources(&agg.toggle_smart_layer(SmartLayer::Weather)), vec![Source::AirQuality]);
}

#[test]
fn test_mismatched_payload_is_a_failure() {
    let mut agg = Aggregator::new();
    let n = ticket_for(&agg.refresh_networks(), Source::Networks);
    agg.commit(n, Ok(Payload::Weather(weather())));

    assert!(matches!(agg.view().networks.error(), Some(FetchError::Malformed(_))));
    assert!(agg.view().networks().is_empty());
}

//////////////////////////////////////////////////////////
// Response parsing
//////////////////////////////////////////////////////////
#[test]
fn test_route_coordinates_are_swapped() {
    let body = json!({
        "code": "Ok",
        "routes": [{
            "distance": 1520.4,
            "duration": 361.0,
            "geometry": {"type": "LineString", "coordinates": [[2.35, 48.85], [2.36, 48.86]]}
        }]
    });
    let route = parse_route(&body).unwrap();
    assert_eq!(route.points, vec![[48.85, 2.35], [48.86, 2.36]]);
    assert_eq!(route.distance_m, Some(1520.4));

    let nothing = json!({"code": "NoRoute", "routes": []});
    assert!(matches!(parse_route(&nothing), Err(FetchError::Malformed(_))));
}

#[test]
fn test_parse_network_detail() {
    let body = json!({
        "network": {
            "id": "velib",
            "name": "Vélib' Métropole",
            "company": ["Smovengo", "Moventia"],
            "href": "/v2/networks/velib",
            "location": {"latitude": 48.856, "longitude": 2.352, "city": "Paris", "country": "FR"},
            "stations": [
                {"id": "s1", "name": "Louvre", "latitude": 48.86, "longitude": 2.33,
                 "timestamp": "2024-05-01T10:00:00Z", "free_bikes": 4, "empty_slots": 11,
                 "extra": {"uid": "1001", "ebikes": 2, "has_ebikes": true, "payment": ["creditcard"]}},
                {"id": "s2", "name": "Bastille", "latitude": 48.85, "longitude": 2.37,
                 "free_bikes": 9, "empty_slots": null},
                {"id": "s3", "name": "Nation", "latitude": 48.84, "longitude": 2.39,
                 "free_bikes": null, "empty_slots": 3}
            ]
        }
    });
    let detail = parse_network_detail(body).unwrap();
    assert_eq!(detail.network.company.as_ref().unwrap().names(), "Smovengo, Moventia");
    assert_eq!(detail.stations.len(), 3);
    assert_eq!(detail.stations[1].empty_slots, None);
    assert_eq!(detail.stations[2].free_bikes, 0);
    assert_eq!(detail.stations[0].extra.as_ref().unwrap().ebikes, Some(2));

    let list = parse_networks(json!({"networks": [
        {"id": "a", "name": "A", "company": "Acme", "location": {"latitude": 1.0, "longitude": 2.0, "city": "X", "country": "Y"}}
    ]}))
    .unwrap();
    assert_eq!(list[0].company, Some(Company::One("Acme".to_string())));

    assert!(parse_networks(json!({"nets": []})).is_err());
}

#[test]
fn test_parse_weather_and_air_quality() {
    let w = parse_weather(&json!({
        "current_weather": {"temperature": 21.3, "windspeed": 9.7, "weathercode": 61, "time": "2024-05-01T12:00"}
    }))
    .unwrap();
    assert_eq!(w.description, "Rainy");
    assert_eq!(w.wind_speed, 9.7);
    assert!(parse_weather(&json!({"hourly": {}})).is_err());

    let aq = parse_air_quality(&json!({
        "current": {"pm10": 20.0, "pm2_5": 36.4, "carbon_monoxide": 200.0, "nitrogen_dioxide": 14.0, "ozone": 60.0}
    }))
    .unwrap();
    assert_eq!(aq.aqi, 36);
    assert_eq!(aq.label, "Unhealthy Air");
}

#[test]
fn test_labels() {
    assert_eq!(weather_description(0), "Clear Sky");
    assert_eq!(weather_description(3), "Partly Cloudy");
    assert_eq!(weather_description(45), "Foggy");
    assert_eq!(weather_description(80), "Rain Showers");
    assert_eq!(weather_description(95), "Stormy");

    assert_eq!(air_quality_label(12.0), "Healthy Area");
    assert_eq!(air_quality_label(35.0), "Sensitive Alert");
    assert_eq!(air_quality_label(80.0), "Hazardous");
}

#[test]
fn test_parse_earthquakes() {
    let body = json!({"features": [{
        "id": "us7000abcd",
        "properties": {"mag": 4.6, "place": "10 km S of Somewhere", "time": 1714557600000i64, "alert": "green", "tsunami": 1},
        "geometry": {"coordinates": [-120.5, 35.2, 8.1]}
    }]});
    let quakes = parse_earthquakes(&body).unwrap();
    assert_eq!(quakes[0].latitude, 35.2);
    assert_eq!(quakes[0].longitude, -120.5);
    assert_eq!(quakes[0].depth, 8.1);
    assert!(quakes[0].tsunami);
    assert_eq!(quakes[0].time.timestamp_millis(), 1714557600000);
}

#[test]
fn test_parse_earthquakes_skips_incomplete_features() {
    let body = json!({"features": [
        {"id": "nomag", "properties": {"mag": null, "place": "Nowhere", "time": 1714557600000i64},
         "geometry": {"coordinates": [1.0, 2.0, 3.0]}},
        {"id": "ok", "properties": {"mag": 2.7, "place": "Somewhere", "time": 1714557600000i64},
         "geometry": {"coordinates": [4.0, 5.0, 6.0]}}
    ]});
    let quakes = parse_earthquakes(&body).unwrap();
    assert_eq!(quakes.len(), 1);
    assert_eq!(quakes[0].id, "ok");

    assert!(matches!(parse_earthquakes(&json!({"type": "x"})), Err(FetchError::Malformed(_))));
}

#[test]
fn test_parse_charge_stations_and_pois() {
    let chargers = parse_charge_stations(&json!([{
        "ID": 1234,
        "AddressInfo": {"Title": "Town Hall", "Latitude": 48.1, "Longitude": 2.2},
        "OperatorInfo": {"Title": "Ionity"},
        "Connections": [{"ConnectionType": {"Title": "CCS"}, "PowerKW": 150.0, "Quantity": 2}, {}]
    }]))
    .unwrap();
    assert_eq!(chargers[0].operator.as_deref(), Some("Ionity"));
    assert_eq!(chargers[0].connections[1].kind, "Unknown");
    assert_eq!(chargers[0].connections[0].quantity, Some(2));

    let pois = parse_pois(
        &json!({"elements": [{"id": 987654321, "lat": 48.2, "lon": 2.3, "tags": {"amenity": "drinking_water", "name": "Fontaine"}}]}),
        PoiKind::Water,
    )
    .unwrap();
    assert_eq!(pois[0].id, "987654321");
    assert_eq!(pois[0].name.as_deref(), Some("Fontaine"));

    let query = overpass_query(Coordinates::new(48.2, 2.3), PoiKind::Parking, 1000.0);
    assert_eq!(query, "[out:json];node[\"amenity=bicycle_parking\"](around:1000,48.2,2.3);out;");
}

//////////////////////////////////////////////////////////
// Occupancy and rendering
//////////////////////////////////////////////////////////
#[test]
fn test_occupancy_keeps_unknown_slots_apart() {
    let d = detail(
        network("n", "N", "C", "X"),
        vec![station("a", 3, Some(5)), station("b", 7, None), station("c", 0, Some(2))],
    );
    let occ = d.occupancy();
    assert_eq!(occ, Occupancy { free_bikes: 10, empty_slots: 7, unknown_slots: 1 });
    assert!(!occ.capacity_is_exact());
    assert!(render::occupancy(&occ).contains("7+ (1 stations without dock count)"));

    let top: Vec<&str> = d.top_stations().iter().map(|s| s.id.as_str()).collect();
    assert_eq!(top, vec!["b", "a", "c"]);
}

#[test]
fn test_render_route_and_layers() {
    let mut agg = Aggregator::new();
    agg.fetch_route(1.0, 1.0);
    assert!(render::route(agg.view()).starts_with("❌ No route"));

    let text = render::layers(&SmartLayers::default());
    assert!(text.contains("✅ weather"));
    assert!(text.contains("⬜ pois"));
    assert_eq!(SmartLayer::from_name("evStations"), Some(SmartLayer::EvStations));
}

#[test]
fn test_render_station_card() {
    let mut s = station("s1", 4, None);
    s.extra = Some(StationExtra {
        address: Some("Rue <Haute>".to_string()),
        has_ebikes: Some(true),
        renting: Some(0),
        payment: vec!["key".to_string(), "creditcard".to_string()],
        ..Default::default()
    });

    let text = render::station(&s, true);
    assert!(text.contains("⭐ Station s1 · 4 bikes · ? slots"));
    assert!(text.contains("Rue &lt;Haute&gt;"));
    assert!(text.contains("E-bikes available"));
    assert!(text.contains("Not renting"));
    assert!(!text.contains("Not accepting returns"));
    assert!(text.contains("key, creditcard"));
}

#[test]
fn test_overlays_list_nearest_chargers_first() {
    let mut agg = Aggregator::new();
    agg.update_map_center(48.0, 2.0);
    let ticket = ticket_for(&agg.toggle_smart_layer(SmartLayer::EvStations), Source::EvStations);

    let mut far = charger(1);
    far.title = "Far".to_string();
    far.latitude = 49.0;
    let mut near = charger(2);
    near.title = "Near".to_string();
    near.latitude = 48.001;
    agg.commit(ticket, Ok(Payload::EvStations(vec![far, near])));

    let text = render::overlays(agg.view());
    let (near_at, far_at) = (text.find("Near").unwrap(), text.find("Far").unwrap());
    assert!(near_at < far_at);
    assert!(text.contains("2 charge stations"));
    // Weather was requested but never answered
    assert!(text.contains("Still loading"));
}

//////////////////////////////////////////////////////////
// Dashboard
//////////////////////////////////////////////////////////
#[derive(Default)]
struct FakeSource {
    networks: Vec<Network>,
    details: HashMap<String, (NetworkDetail, Duration)>,
    weather_calls: AtomicUsize,
}

fn not_served<T: Send + 'static>(what: &str) -> FetchFuture<T> {
    let what = what.to_string();
    Box::pin(async move { Err(FetchError::Transport(format!("{} not served", what))) })
}

impl DataSource for FakeSource {
    fn list_networks(&self) -> FetchFuture<Vec<Network>> {
        let networks = self.networks.clone();
        Box::pin(async move { Ok(networks) })
    }

    fn get_network_detail(&self, id: &str) -> FetchFuture<NetworkDetail> {
        match self.details.get(id).cloned() {
            Some((detail, delay)) => Box::pin(async move {
                tokio::time::sleep(delay).await;
                Ok(detail)
            }),
            None => not_served(id),
        }
    }

    fn get_weather(&self, _at: Coordinates) -> FetchFuture<WeatherCondition> {
        self.weather_calls.fetch_add(1, Ordering::SeqCst);
        Box::pin(async move { Ok(weather()) })
    }

    fn get_air_quality(&self, _at: Coordinates) -> FetchFuture<AirQuality> {
        not_served("air quality")
    }

    fn list_recent_earthquakes(&self) -> FetchFuture<Vec<Earthquake>> {
        Box::pin(async move { Ok(vec![quake("q1")]) })
    }

    fn list_charge_stations(&self, _at: Coordinates, _radius_km: f64) -> FetchFuture<Vec<ChargeStation>> {
        not_served("chargers")
    }

    fn list_pois(&self, _at: Coordinates, _kind: PoiKind, _radius_m: f64) -> FetchFuture<Vec<Poi>> {
        not_served("pois")
    }

    fn get_cycling_route(&self, from: Coordinates, to: Coordinates) -> FetchFuture<Route> {
        Box::pin(async move {
            Ok(Route {
                points: vec![[from.lat, from.lon], [to.lat, to.lon]],
                ..Route::default()
            })
        })
    }
}

fn fake_dashboard(source: FakeSource, dir: &tempfile::TempDir) -> (Arc<Dashboard>, Arc<FakeSource>) {
    let source = Arc::new(source);
    let settings = Settings {
        favorites_path: dir.path().join("favorites.json").display().to_string(),
        pan_debounce: Duration::from_millis(30),
        ..Settings::default()
    };
    let favorites = FavoritesStore::open(&settings.favorites_path, "test");
    let dashboard = Dashboard::new(source.clone(), favorites, settings);
    (dashboard, source)
}

#[tokio::test]
async fn test_dashboard_last_selection_wins() {
    let dir = tempfile::tempdir().unwrap();
    let mut source = FakeSource::default();
    source.details.insert(
        "slow".to_string(),
        (detail(located("slow", 1.0, 1.0), vec![station("s", 1, Some(1))]), Duration::from_millis(80)),
    );
    source.details.insert(
        "fast".to_string(),
        (detail(located("fast", 2.0, 2.0), vec![station("f", 2, Some(2))]), Duration::from_millis(5)),
    );
    let (dashboard, _) = fake_dashboard(source, &dir);

    let first = dashboard.clone();
    let second = dashboard.clone();
    tokio::join!(
        async move { first.select_network("slow").await },
        async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            second.select_network("fast").await
        }
    );

    dashboard.with_view(|v| {
        assert_eq!(v.selected_id.as_deref(), Some("fast"));
        assert_eq!(v.selected_network().unwrap().stations[0].id, "f");
        assert_eq!(v.map_center, Some(Coordinates::new(2.0, 2.0)));
    });
}

#[tokio::test]
async fn test_dashboard_overlays_follow_the_user() {
    let dir = tempfile::tempdir().unwrap();
    let source = FakeSource {
        networks: vec![network("velib", "Vélib'", "Paris", "FR")],
        ..FakeSource::default()
    };
    let (dashboard, source) = fake_dashboard(source, &dir);

    dashboard.start().await;
    dashboard.set_user_location(48.85, 2.35).await;
    dashboard.toggle_smart_layer(SmartLayer::Earthquakes).await;

    dashboard.with_view(|v| {
        assert_eq!(v.networks().len(), 1);
        assert_eq!(v.visible_weather().unwrap().description, "Partly Cloudy");
        assert!(v.air_quality.error().is_some());
        assert_eq!(v.visible_earthquakes().len(), 1);
        assert!(!v.is_loading());
    });
    assert_eq!(source.weather_calls.load(Ordering::SeqCst), 1);
    assert_eq!(dashboard.search("pa").len(), 1);

    dashboard.fetch_route(48.86, 2.36).await;
    dashboard.with_view(|v| {
        assert_eq!(v.route().unwrap().points, vec![[48.85, 2.35], [48.86, 2.36]]);
    });
    dashboard.clear_route();
    dashboard.with_view(|v| assert!(v.route().is_none()));
}

#[tokio::test]
async fn test_dashboard_debounces_pans() {
    let dir = tempfile::tempdir().unwrap();
    let (dashboard, source) = fake_dashboard(FakeSource::default(), &dir);

    let first = dashboard.clone();
    let second = dashboard.clone();
    let (applied_first, applied_second) = tokio::join!(
        async move { first.pan(10.0, 10.0).await },
        async move {
            tokio::time::sleep(Duration::from_millis(5)).await;
            second.pan(20.0, 20.0).await
        }
    );

    assert!(!applied_first);
    assert!(applied_second);
    dashboard.with_view(|v| assert_eq!(v.map_center, Some(Coordinates::new(20.0, 20.0))));
    assert_eq!(source.weather_calls.load(Ordering::SeqCst), 1);

    // Settling on the same spot again fetches nothing new
    assert!(dashboard.pan(20.0, 20.0).await);
    assert_eq!(source.weather_calls.load(Ordering::SeqCst), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 8)]
async fn test_dashboard_racing_selections_settle() {
    let dir = tempfile::tempdir().unwrap();
    let mut source = FakeSource::default();
    for i in 0..8u64 {
        let id = format!("n{}", i);
        source.details.insert(
            id.clone(),
            (detail(located(&id, 1.0, 1.0), vec![]), Duration::from_millis(i % 3)),
        );
    }
    let (dashboard, _) = fake_dashboard(source, &dir);

    for round in 0..100 {
        let selections: Vec<_> = (0..8)
            .map(|i| {
                let dashboard = dashboard.clone();
                tokio::spawn(async move { dashboard.select_network(&format!("n{}", i)).await })
            })
            .collect();
        for s in selections {
            s.await.unwrap();
        }

        dashboard.with_view(|v| {
            assert!(
                !v.selected.is_loading(),
                "round {}: {:?} still loading",
                round,
                v.selected_id
            );
            assert_eq!(v.selected_network().map(|d| &d.network.id), v.selected_id.as_ref());
        });
    }
}

#[tokio::test]
async fn test_dashboard_spawned_pans_supersede_each_other() {
    let dir = tempfile::tempdir().unwrap();
    let (dashboard, source) = fake_dashboard(FakeSource::default(), &dir);

    // Issued back to back, like location shares handled one after another
    let first = dashboard.spawn_pan(10.0, 10.0);
    let second = dashboard.spawn_pan(20.0, 20.0);

    assert!(!first.await.unwrap());
    assert!(second.await.unwrap());
    dashboard.with_view(|v| assert_eq!(v.map_center, Some(Coordinates::new(20.0, 20.0))));
    assert_eq!(source.weather_calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_dashboard_favorites_persist() {
    let dir = tempfile::tempdir().unwrap();
    let (dashboard, _) = fake_dashboard(FakeSource::default(), &dir);

    assert!(dashboard.toggle_favorite_network("velib"));
    assert!(dashboard.toggle_favorite_station("s1"));
    assert!(dashboard.favorites().networks.contains("velib"));

    let reopened = FavoritesStore::open(dir.path().join("favorites.json"), "test");
    assert!(reopened.favorites().networks.contains("velib"));
    assert!(reopened.is_favorite_station("s1"));
}

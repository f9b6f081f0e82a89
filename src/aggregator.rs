//! The dashboard's single source of truth.
//!
//! [`Aggregator`] owns a [`ViewState`] and is the only thing that mutates it.
//! Every operation returns the [`Ticket`]s it wants fetched; whoever runs a
//! ticket hands the outcome back through [`Aggregator::commit`], which drops
//! it unless the ticket is still the newest one issued for its source.

use crate::api::FetchError;
use crate::structs::*;

//////////////////////////////////////////////////////////
// Fetch bookkeeping
//////////////////////////////////////////////////////////
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Source {
    Networks,
    Detail,
    Weather,
    AirQuality,
    Earthquakes,
    EvStations,
    Pois,
    Route,
}

/// Parameters of one remote call.
#[derive(Debug, Clone, PartialEq)]
pub enum Request {
    Networks,
    Detail { id: String },
    Weather { at: Coordinates },
    AirQuality { at: Coordinates },
    Earthquakes,
    EvStations { at: Coordinates },
    Pois { at: Coordinates, kind: PoiKind },
    Route { from: Coordinates, to: Coordinates },
}

impl Request {
    pub fn source(&self) -> Source {
        match self {
            Request::Networks => Source::Networks,
            Request::Detail { .. } => Source::Detail,
            Request::Weather { .. } => Source::Weather,
            Request::AirQuality { .. } => Source::AirQuality,
            Request::Earthquakes => Source::Earthquakes,
            Request::EvStations { .. } => Source::EvStations,
            Request::Pois { .. } => Source::Pois,
            Request::Route { .. } => Source::Route,
        }
    }
}

/// A fetch the aggregator asked for, stamped with its sequence number.
#[derive(Debug, Clone, PartialEq)]
pub struct Ticket {
    pub seq: u64,
    pub request: Request,
}

impl Ticket {
    pub fn source(&self) -> Source {
        self.request.source()
    }
}

/// Result of running a [`Ticket`].
#[derive(Debug, Clone)]
pub enum Payload {
    Networks(Vec<Network>),
    Detail(NetworkDetail),
    Weather(WeatherCondition),
    AirQuality(AirQuality),
    Earthquakes(Vec<Earthquake>),
    EvStations(Vec<ChargeStation>),
    Pois(Vec<Poi>),
    Route(Route),
}

#[derive(Debug, Clone, PartialEq, Default)]
pub enum FetchStatus {
    #[default]
    Idle,
    Loading,
    Loaded,
    Failed(FetchError),
}

/// One remotely backed piece of the view.
#[derive(Debug, Clone)]
pub struct Slot<T> {
    pub status: FetchStatus,
    pub data: Option<T>,
    /// Request behind `data`, or behind the pending fetch while loading.
    key: Option<Request>,
    pending: Option<u64>,
}

impl<T> Default for Slot<T> {
    fn default() -> Self {
        Slot {
            status: FetchStatus::Idle,
            data: None,
            key: None,
            pending: None,
        }
    }
}

impl<T> Slot<T> {
    pub fn is_loading(&self) -> bool {
        self.status == FetchStatus::Loading
    }

    pub fn error(&self) -> Option<&FetchError> {
        match &self.status {
            FetchStatus::Failed(e) => Some(e),
            _ => None,
        }
    }

    /// Whether `request` would give something this slot does not already
    /// hold or wait for.
    fn needs(&self, request: &Request) -> bool {
        if self.key.as_ref() != Some(request) {
            return true;
        }
        matches!(self.status, FetchStatus::Idle | FetchStatus::Failed(_))
    }

    fn begin(&mut self, seq: u64, request: Request) {
        self.status = FetchStatus::Loading;
        self.key = Some(request);
        self.pending = Some(seq);
    }

    fn is_current(&self, seq: u64) -> bool {
        self.pending == Some(seq)
    }

    fn resolve(&mut self, data: T) {
        self.status = FetchStatus::Loaded;
        self.data = Some(data);
        self.pending = None;
    }

    fn fail(&mut self, error: FetchError) {
        self.status = FetchStatus::Failed(error);
        self.data = None;
        self.pending = None;
    }

    fn reset(&mut self) {
        *self = Slot::default();
    }
}

//////////////////////////////////////////////////////////
// View state
//////////////////////////////////////////////////////////
/// Everything the rendering layer reads.
#[derive(Debug, Clone, Default)]
pub struct ViewState {
    pub networks: Slot<Vec<Network>>,
    pub selected_id: Option<String>,
    pub selected: Slot<NetworkDetail>,
    pub user_location: Option<Coordinates>,
    pub map_center: Option<Coordinates>,
    pub layers: SmartLayers,
    pub poi_kind: PoiKind,
    pub weather: Slot<WeatherCondition>,
    pub air_quality: Slot<AirQuality>,
    pub earthquakes: Slot<Vec<Earthquake>>,
    pub ev_stations: Slot<Vec<ChargeStation>>,
    pub pois: Slot<Vec<Poi>>,
    pub route: Slot<Route>,
}

impl ViewState {
    pub fn networks(&self) -> &[Network] {
        self.networks.data.as_deref().unwrap_or_default()
    }

    pub fn selected_network(&self) -> Option<&NetworkDetail> {
        self.selected.data.as_ref()
    }

    pub fn route(&self) -> Option<&Route> {
        self.route.data.as_ref()
    }

    pub fn visible_weather(&self) -> Option<&WeatherCondition> {
        self.layers.weather.then(|| self.weather.data.as_ref()).flatten()
    }

    pub fn visible_air_quality(&self) -> Option<&AirQuality> {
        self.layers.weather.then(|| self.air_quality.data.as_ref()).flatten()
    }

    pub fn visible_earthquakes(&self) -> &[Earthquake] {
        visible(self.layers.earthquakes, &self.earthquakes)
    }

    pub fn visible_ev_stations(&self) -> &[ChargeStation] {
        visible(self.layers.ev_stations, &self.ev_stations)
    }

    pub fn visible_pois(&self) -> &[Poi] {
        visible(self.layers.pois, &self.pois)
    }

    pub fn is_loading(&self) -> bool {
        self.networks.is_loading()
            || self.selected.is_loading()
            || self.weather.is_loading()
            || self.air_quality.is_loading()
            || self.earthquakes.is_loading()
            || self.ev_stations.is_loading()
            || self.pois.is_loading()
            || self.route.is_loading()
    }
}

fn visible<T>(enabled: bool, slot: &Slot<Vec<T>>) -> &[T] {
    match (enabled, &slot.data) {
        (true, Some(items)) => items.as_slice(),
        _ => &[],
    }
}

//////////////////////////////////////////////////////////
// Aggregator
//////////////////////////////////////////////////////////
#[derive(Debug, Clone, Default)]
pub struct Aggregator {
    view: ViewState,
    next_seq: u64,
}

impl Aggregator {
    pub fn new() -> Self {
        Aggregator::default()
    }

    pub fn view(&self) -> &ViewState {
        &self.view
    }

    /// Initial fetches: the network directory and every enabled global layer.
    pub fn start(&mut self) -> Vec<Ticket> {
        let mut tickets = self.refresh_networks();
        for layer in SmartLayer::ALL.into_iter().filter(|l| l.is_global()) {
            if self.view.layers.is_enabled(layer) {
                tickets.extend(self.layer_tickets(layer));
            }
        }
        tickets
    }

    pub fn refresh_networks(&mut self) -> Vec<Ticket> {
        vec![self.issue(Request::Networks)]
    }

    /// Geolocation result. Only the first fix of a session is kept.
    pub fn set_user_location(&mut self, lat: f64, lon: f64) -> Vec<Ticket> {
        if self.view.user_location.is_some() {
            log::debug!("User location already known, ignoring ({}, {})", lat, lon);
            return vec![];
        }
        let here = Coordinates::new(lat, lon);
        self.view.user_location = Some(here);
        log::info!("User location set to ({}, {})", lat, lon);

        if self.view.map_center.is_none() {
            self.update_map_center(lat, lon)
        } else {
            vec![]
        }
    }

    pub fn select_network(&mut self, id: &str) -> Vec<Ticket> {
        log::info!("Selecting network {}", id);
        self.view.selected_id = Some(id.to_owned());
        self.view.selected.reset();
        self.view.route.reset();

        let mut tickets = vec![self.issue(Request::Detail { id: id.to_owned() })];

        let known = self
            .view
            .networks()
            .iter()
            .find(|n| n.id == id)
            .map(|n| n.location.coordinates());
        if let Some(at) = known {
            tickets.extend(self.update_map_center(at.lat, at.lon));
        }
        tickets
    }

    pub fn clear_selection(&mut self) {
        log::info!("Clearing selection");
        self.view.selected_id = None;
        self.view.selected.reset();
        self.view.route.reset();
    }

    /// Moves the map center. Identical consecutive centers issue nothing.
    pub fn update_map_center(&mut self, lat: f64, lon: f64) -> Vec<Ticket> {
        let at = Coordinates::new(lat, lon);
        if self.view.map_center == Some(at) {
            return vec![];
        }
        self.view.map_center = Some(at);
        log::debug!("Map center moved to ({}, {})", lat, lon);

        let layers: Vec<SmartLayer> = SmartLayer::ALL
            .into_iter()
            .filter(|l| !l.is_global() && self.view.layers.is_enabled(*l))
            .collect();
        layers.into_iter().flat_map(|l| self.layer_tickets(l)).collect()
    }

    /// Flips a layer. Enabling fetches whatever its cache is missing;
    /// disabling only hides it.
    pub fn toggle_smart_layer(&mut self, layer: SmartLayer) -> Vec<Ticket> {
        let enabled = self.view.layers.flip(layer);
        log::info!("Layer {} {}", layer.name(), if enabled { "on" } else { "off" });
        if enabled {
            self.layer_tickets(layer)
        } else {
            vec![]
        }
    }

    pub fn set_poi_kind(&mut self, kind: PoiKind) -> Vec<Ticket> {
        if self.view.poi_kind == kind {
            return vec![];
        }
        self.view.poi_kind = kind;
        if self.view.layers.pois {
            self.layer_tickets(SmartLayer::Pois)
        } else {
            vec![]
        }
    }

    /// Cycling route from the user's location. Without one, the route slot
    /// records a precondition failure and nothing is fetched.
    pub fn fetch_route(&mut self, to_lat: f64, to_lon: f64) -> Vec<Ticket> {
        let from = match self.view.user_location {
            Some(from) => from,
            None => {
                let error = FetchError::Precondition("user location is unknown".to_string());
                log::warn!("Route not requested: {}", error);
                self.view.route.reset();
                self.view.route.fail(error);
                return vec![];
            }
        };
        let to = Coordinates::new(to_lat, to_lon);
        vec![self.issue(Request::Route { from, to })]
    }

    pub fn clear_route(&mut self) {
        self.view.route.reset();
    }

    /// Applies the outcome of `ticket` unless a newer ticket superseded it.
    /// Returns follow-up fetches, if the outcome calls for any.
    pub fn commit(&mut self, ticket: Ticket, outcome: Result<Payload, FetchError>) -> Vec<Ticket> {
        let source = ticket.source();
        if !self.slot_is_current(source, ticket.seq) {
            log::debug!("Dropping stale {:?} result (ticket {})", source, ticket.seq);
            return vec![];
        }

        let payload = match outcome {
            Ok(payload) => payload,
            Err(e) => {
                log::error!("{:?} fetch failed: {}", source, e);
                self.fail(source, e);
                return vec![];
            }
        };

        match (payload, &ticket.request) {
            (Payload::Networks(networks), Request::Networks) => {
                log::info!("Loaded {} networks", networks.len());
                self.view.networks.resolve(networks);
            }
            (Payload::Detail(detail), Request::Detail { id }) => {
                if self.view.selected_id.as_deref() != Some(id.as_str()) {
                    log::debug!("Dropping detail of {}: no longer selected", id);
                    return vec![];
                }
                log::info!("Loaded {} stations for {}", detail.stations.len(), id);
                let at = detail.network.location.coordinates();
                self.view.selected.resolve(detail);
                return self.update_map_center(at.lat, at.lon);
            }
            (Payload::Weather(weather), Request::Weather { .. }) => self.view.weather.resolve(weather),
            (Payload::AirQuality(aq), Request::AirQuality { .. }) => self.view.air_quality.resolve(aq),
            (Payload::Earthquakes(quakes), Request::Earthquakes) => self.view.earthquakes.resolve(quakes),
            (Payload::EvStations(chargers), Request::EvStations { .. }) => {
                self.view.ev_stations.resolve(chargers)
            }
            (Payload::Pois(pois), Request::Pois { .. }) => self.view.pois.resolve(pois),
            (Payload::Route(route), Request::Route { .. }) => self.view.route.resolve(route),
            (payload, request) => {
                let error = FetchError::Malformed(format!(
                    "{} payload answered a {:?} request",
                    payload_name(&payload),
                    request.source()
                ));
                log::error!("{}", error);
                self.fail(source, error);
            }
        }
        vec![]
    }

    fn issue(&mut self, request: Request) -> Ticket {
        self.next_seq += 1;
        let seq = self.next_seq;
        let source = request.source();
        match source {
            Source::Networks => self.view.networks.begin(seq, request.clone()),
            Source::Detail => self.view.selected.begin(seq, request.clone()),
            Source::Weather => self.view.weather.begin(seq, request.clone()),
            Source::AirQuality => self.view.air_quality.begin(seq, request.clone()),
            Source::Earthquakes => self.view.earthquakes.begin(seq, request.clone()),
            Source::EvStations => self.view.ev_stations.begin(seq, request.clone()),
            Source::Pois => self.view.pois.begin(seq, request.clone()),
            Source::Route => self.view.route.begin(seq, request.clone()),
        }
        log::debug!("Issued {:?} ticket {}", source, seq);
        Ticket { seq, request }
    }

    /// Tickets for one layer, skipping whatever its cache already covers.
    fn layer_tickets(&mut self, layer: SmartLayer) -> Vec<Ticket> {
        let requests = match (layer, self.view.map_center) {
            (SmartLayer::Earthquakes, _) => vec![Request::Earthquakes],
            (_, None) => {
                log::debug!("Layer {} waits for a map center", layer.name());
                vec![]
            }
            (SmartLayer::Weather, Some(at)) => {
                vec![Request::Weather { at }, Request::AirQuality { at }]
            }
            (SmartLayer::EvStations, Some(at)) => vec![Request::EvStations { at }],
            (SmartLayer::Pois, Some(at)) => vec![Request::Pois {
                at,
                kind: self.view.poi_kind,
            }],
        };

        let wanted: Vec<Request> = requests.into_iter().filter(|r| self.slot_needs(r)).collect();
        wanted.into_iter().map(|r| self.issue(r)).collect()
    }

    fn slot_needs(&self, request: &Request) -> bool {
        let v = &self.view;
        match request.source() {
            Source::Networks => v.networks.needs(request),
            Source::Detail => v.selected.needs(request),
            Source::Weather => v.weather.needs(request),
            Source::AirQuality => v.air_quality.needs(request),
            Source::Earthquakes => v.earthquakes.needs(request),
            Source::EvStations => v.ev_stations.needs(request),
            Source::Pois => v.pois.needs(request),
            Source::Route => v.route.needs(request),
        }
    }

    fn slot_is_current(&self, source: Source, seq: u64) -> bool {
        let v = &self.view;
        match source {
            Source::Networks => v.networks.is_current(seq),
            Source::Detail => v.selected.is_current(seq),
            Source::Weather => v.weather.is_current(seq),
            Source::AirQuality => v.air_quality.is_current(seq),
            Source::Earthquakes => v.earthquakes.is_current(seq),
            Source::EvStations => v.ev_stations.is_current(seq),
            Source::Pois => v.pois.is_current(seq),
            Source::Route => v.route.is_current(seq),
        }
    }

    fn fail(&mut self, source: Source, error: FetchError) {
        let v = &mut self.view;
        match source {
            Source::Networks => v.networks.fail(error),
            Source::Detail => v.selected.fail(error),
            Source::Weather => v.weather.fail(error),
            Source::AirQuality => v.air_quality.fail(error),
            Source::Earthquakes => v.earthquakes.fail(error),
            Source::EvStations => v.ev_stations.fail(error),
            Source::Pois => v.pois.fail(error),
            Source::Route => v.route.fail(error),
        }
    }
}

fn payload_name(payload: &Payload) -> &'static str {
    match payload {
        Payload::Networks(_) => "networks",
        Payload::Detail(_) => "network detail",
        Payload::Weather(_) => "weather",
        Payload::AirQuality(_) => "air quality",
        Payload::Earthquakes(_) => "earthquakes",
        Payload::EvStations(_) => "charge stations",
        Payload::Pois(_) => "points of interest",
        Payload::Route(_) => "route",
    }
}

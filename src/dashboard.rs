use crate::aggregator::*;
use crate::api::{DataSource, FetchFuture};
use crate::config::Settings;
use crate::io::FavoritesStore;
use crate::search;
use crate::structs::*;

use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Mutex, MutexGuard, PoisonError,
    },
};
use tokio::task::{AbortHandle, JoinHandle};

type FetchTask = JoinHandle<Vec<Ticket>>;

/// Runs an [`Aggregator`] against a [`DataSource`].
///
/// Each issued ticket becomes a tokio task. A newer ticket for the same
/// source aborts the older task, so at most one fetch per source is in
/// flight. The aggregator lock is never held across an await.
pub struct Dashboard {
    state: Mutex<Aggregator>,
    favorites: Mutex<FavoritesStore>,
    source: Arc<dyn DataSource>,
    settings: Settings,
    tasks: Mutex<HashMap<Source, (u64, AbortHandle)>>,
    pan_generation: AtomicU64,
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

impl Dashboard {
    pub fn new(source: Arc<dyn DataSource>, favorites: FavoritesStore, settings: Settings) -> Arc<Self> {
        Arc::new(Dashboard {
            state: Mutex::new(Aggregator::new()),
            favorites: Mutex::new(favorites),
            source,
            settings,
            tasks: Mutex::new(HashMap::new()),
            pan_generation: AtomicU64::new(0),
        })
    }

    /// Reads the current view without copying it.
    pub fn with_view<R>(&self, f: impl FnOnce(&ViewState) -> R) -> R {
        f(lock(&self.state).view())
    }

    pub fn favorites(&self) -> Favorites {
        lock(&self.favorites).favorites().clone()
    }

    pub fn search(&self, query: &str) -> Vec<Network> {
        let state = lock(&self.state);
        let favorites = lock(&self.favorites);
        search::filter(state.view().networks(), query, favorites.favorites())
            .into_iter()
            .cloned()
            .collect()
    }

    pub fn toggle_favorite_network(&self, id: &str) -> bool {
        lock(&self.favorites).toggle_favorite_network(id)
    }

    pub fn toggle_favorite_station(&self, id: &str) -> bool {
        lock(&self.favorites).toggle_favorite_station(id)
    }

    pub fn is_favorite_station(&self, id: &str) -> bool {
        lock(&self.favorites).is_favorite_station(id)
    }

    //////////////////////////////////////////////////////////
    // Operations
    //////////////////////////////////////////////////////////
    pub async fn start(self: &Arc<Self>) {
        let tickets = lock(&self.state).start();
        self.run(tickets).await;
    }

    pub async fn refresh_networks(self: &Arc<Self>) {
        let tickets = lock(&self.state).refresh_networks();
        self.run(tickets).await;
    }

    pub async fn set_user_location(self: &Arc<Self>, lat: f64, lon: f64) {
        let tickets = lock(&self.state).set_user_location(lat, lon);
        self.run(tickets).await;
    }

    pub async fn select_network(self: &Arc<Self>, id: &str) {
        let tickets = lock(&self.state).select_network(id);
        self.run(tickets).await;
    }

    pub fn clear_selection(&self) {
        lock(&self.state).clear_selection();
    }

    /// Debounced map move: applies only if no other pan arrives while
    /// waiting. Returns whether this pan was applied.
    pub async fn pan(self: &Arc<Self>, lat: f64, lon: f64) -> bool {
        let generation = self.pan_generation.fetch_add(1, Ordering::SeqCst) + 1;
        tokio::time::sleep(self.settings.pan_debounce).await;
        if self.pan_generation.load(Ordering::SeqCst) != generation {
            log::debug!("Pan to ({}, {}) superseded", lat, lon);
            return false;
        }
        let tickets = lock(&self.state).update_map_center(lat, lon);
        self.run(tickets).await;
        true
    }

    /// Runs [`Dashboard::pan`] on its own task so the caller can move on and
    /// a later pan can supersede this one while it waits.
    pub fn spawn_pan(self: &Arc<Self>, lat: f64, lon: f64) -> JoinHandle<bool> {
        let dashboard = Arc::clone(self);
        tokio::spawn(async move { dashboard.pan(lat, lon).await })
    }

    pub async fn toggle_smart_layer(self: &Arc<Self>, layer: SmartLayer) {
        let tickets = lock(&self.state).toggle_smart_layer(layer);
        self.run(tickets).await;
    }

    pub async fn set_poi_kind(self: &Arc<Self>, kind: PoiKind) {
        let tickets = lock(&self.state).set_poi_kind(kind);
        self.run(tickets).await;
    }

    pub async fn fetch_route(self: &Arc<Self>, to_lat: f64, to_lon: f64) {
        let tickets = lock(&self.state).fetch_route(to_lat, to_lon);
        self.run(tickets).await;
    }

    pub fn clear_route(&self) {
        lock(&self.state).clear_route();
    }

    //////////////////////////////////////////////////////////
    // Fetch tasks
    //////////////////////////////////////////////////////////
    /// Spawns `tickets` and waits until they, and whatever they lead to, settle.
    async fn run(self: &Arc<Self>, tickets: Vec<Ticket>) {
        let mut pending = self.dispatch(tickets);
        while let Some(task) = pending.pop() {
            match task.await {
                Ok(follow_ups) => pending.extend(self.dispatch(follow_ups)),
                Err(e) if e.is_cancelled() => log::debug!("Fetch superseded by a newer one"),
                Err(e) => log::error!("Fetch task panicked: {}", e),
            }
        }
    }

    fn dispatch(self: &Arc<Self>, tickets: Vec<Ticket>) -> Vec<FetchTask> {
        tickets
            .into_iter()
            .map(|ticket| {
                let (source, seq) = (ticket.source(), ticket.seq);
                let fetch = self.fetch(&ticket.request);
                let dashboard = Arc::clone(self);

                let task = tokio::spawn(async move {
                    let outcome = fetch.await;
                    let follow_ups = lock(&dashboard.state).commit(ticket, outcome);
                    follow_ups
                });

                self.track(source, seq, &task);
                task
            })
            .collect()
    }

    /// Keeps the task of the newest ticket per source and aborts the other.
    /// Racing operations can register out of issue order; the sequence
    /// number decides.
    fn track(&self, source: Source, seq: u64, task: &FetchTask) {
        let mut tasks = lock(&self.tasks);
        let newest = tasks.get(&source).map(|(newest, _)| *newest);
        match newest {
            Some(newest) if newest > seq => {
                log::debug!("{:?} fetch #{} registered after #{}, dropping it", source, seq, newest);
                task.abort();
            }
            _ => {
                if let Some((_, previous)) = tasks.insert(source, (seq, task.abort_handle())) {
                    previous.abort();
                }
            }
        }
    }

    fn fetch(&self, request: &Request) -> FetchFuture<Payload> {
        let s = &self.source;
        match request {
            Request::Networks => wrap(s.list_networks(), Payload::Networks),
            Request::Detail { id } => wrap(s.get_network_detail(id), Payload::Detail),
            Request::Weather { at } => wrap(s.get_weather(*at), Payload::Weather),
            Request::AirQuality { at } => wrap(s.get_air_quality(*at), Payload::AirQuality),
            Request::Earthquakes => wrap(s.list_recent_earthquakes(), Payload::Earthquakes),
            Request::EvStations { at } => wrap(
                s.list_charge_stations(*at, self.settings.charger_radius_km),
                Payload::EvStations,
            ),
            Request::Pois { at, kind } => wrap(
                s.list_pois(*at, *kind, self.settings.poi_radius_m),
                Payload::Pois,
            ),
            Request::Route { from, to } => wrap(s.get_cycling_route(*from, *to), Payload::Route),
        }
    }
}

fn wrap<T: Send + 'static>(fetch: FetchFuture<T>, into: fn(T) -> Payload) -> FetchFuture<Payload> {
    Box::pin(async move { fetch.await.map(into) })
}

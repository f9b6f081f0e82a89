use crate::aggregator::{FetchStatus, Slot, ViewState};
use crate::structs::*;

use teloxide::utils::html::escape;

//////////////////////////////////////////////////////////
// Text views (Telegram HTML)
//////////////////////////////////////////////////////////
pub fn network_line(network: &Network, favorite: bool) -> String {
    format!(
        "{}{} ({}, {})",
        if favorite { "⭐ " } else { "" },
        network.name,
        network.location.city,
        network.location.country
    )
}

pub fn occupancy(occ: &Occupancy) -> String {
    let slots = if occ.capacity_is_exact() {
        format!("{}", occ.empty_slots)
    } else {
        format!("{}+ ({} stations without dock count)", occ.empty_slots, occ.unknown_slots)
    };
    format!("🚲 Free bikes: <b>{}</b>\n🅿️ Empty slots: <b>{}</b>", occ.free_bikes, slots)
}

pub fn station_line(station: &Station, favorite: bool) -> String {
    let slots = match station.empty_slots {
        Some(n) => n.to_string(),
        None => "?".to_string(),
    };
    format!(
        "{}{} · {} bikes · {} slots",
        if favorite { "⭐ " } else { "" },
        station.name,
        station.free_bikes,
        slots
    )
}

pub fn station(station: &Station, favorite: bool) -> String {
    let mut text = format!("🚏 <b>{}</b>\n{}", escape(&station.name), escape(&station_line(station, favorite)));
    if let Some(extra) = &station.extra {
        if let Some(address) = &extra.address {
            text.push_str(&format!("\n📍 {}", escape(address)));
        }
        if let Some(slots) = extra.slots {
            text.push_str(&format!("\n🔢 Docks: {}", slots));
        }
        match (extra.ebikes, extra.has_ebikes) {
            (Some(n), _) => text.push_str(&format!("\n⚡ E-bikes: {}", n)),
            (None, Some(true)) => text.push_str("\n⚡ E-bikes available"),
            _ => {}
        }
        if extra.renting == Some(0) {
            text.push_str("\n🚫 Not renting");
        }
        if extra.returning == Some(0) {
            text.push_str("\n🚫 Not accepting returns");
        }
        if !extra.payment.is_empty() {
            text.push_str(&format!("\n💳 {}", escape(&extra.payment.join(", "))));
        }
    }
    if let Some(ts) = &station.timestamp {
        text.push_str(&format!("\n🕒 Updated {}", escape(ts)));
    }
    text
}

/// The selected network with its stations summary.
pub fn selection(view: &ViewState, favorites: &Favorites) -> String {
    let id = match &view.selected_id {
        Some(id) => id,
        None => return "No network selected. Send a city or network name to search.".to_string(),
    };

    let detail = match (&view.selected.status, view.selected_network()) {
        (_, Some(detail)) => detail,
        (FetchStatus::Failed(e), None) => {
            return format!("❌ Could not load network <b>{}</b>: {}", escape(id), escape(&e.to_string()))
        }
        _ => return format!("⏳ Loading network <b>{}</b>…", escape(id)),
    };

    let network = &detail.network;
    let mut text = format!(
        "{}<b>{}</b>\n{}, {}",
        if favorites.networks.contains(&network.id) { "⭐ " } else { "" },
        escape(&network.name),
        escape(&network.location.city),
        escape(&network.location.country)
    );
    if let Some(company) = &network.company {
        text.push_str(&format!("\n🏢 {}", escape(&company.names())));
    }
    text.push_str(&format!("\n\n{} stations\n{}", detail.stations.len(), occupancy(&detail.occupancy())));

    let top = detail.top_stations();
    if !top.is_empty() {
        text.push_str("\n\n<b>Top stations</b>");
        for s in top {
            text.push_str(&format!("\n• {}", escape(&station_line(s, favorites.stations.contains(&s.id)))));
        }
    }
    text
}

/// Smart layer overlays around the map center.
pub fn overlays(view: &ViewState) -> String {
    let mut lines: Vec<String> = vec![];

    match view.map_center {
        Some(c) => lines.push(format!("🧭 Map center: {:.4}, {:.4}", c.lat, c.lon)),
        None => lines.push("🧭 Map center unknown. Share your location or use /pan.".to_string()),
    }

    if view.layers.weather {
        lines.push(match view.visible_weather() {
            Some(w) => format!(
                "🌤 {} · {:.1}°C · wind {:.0} km/h (as of {})",
                w.description,
                w.temperature,
                w.wind_speed,
                escape(&w.time)
            ),
            None => status_line("🌤 Weather", &view.weather),
        });
        lines.push(match view.visible_air_quality() {
            Some(aq) => format!(
                "🌫 {} (AQI {}) · PM2.5 {:.1} · PM10 {:.1} · NO₂ {:.1} · O₃ {:.1} · CO {:.0}",
                aq.label, aq.aqi, aq.pm2_5, aq.pm10, aq.no2, aq.o3, aq.co
            ),
            None => status_line("🌫 Air quality", &view.air_quality),
        });
    }

    if view.layers.earthquakes {
        let quakes = view.visible_earthquakes();
        let strongest = quakes.iter().max_by(|a, b| a.magnitude.total_cmp(&b.magnitude));
        match strongest {
            None => lines.push(status_line("🌋 Earthquakes", &view.earthquakes)),
            Some(q) => {
                let mut line = format!(
                    "🌋 {} earthquakes (M2.5+, past day), strongest M{:.1} {} ({:.2}, {:.2}, {:.0} km deep) at {}",
                    quakes.len(),
                    q.magnitude,
                    escape(&q.place),
                    q.latitude,
                    q.longitude,
                    q.depth,
                    q.time.format("%d %b %H:%M UTC")
                );
                if let Some(alert) = &q.alert {
                    line.push_str(&format!(" · alert {}", escape(alert)));
                }
                if q.tsunami {
                    line.push_str(" · 🌊 tsunami flag");
                }
                lines.push(line);
            }
        }
    }

    if view.layers.ev_stations {
        let chargers = view.visible_ev_stations();
        if chargers.is_empty() {
            lines.push(status_line("🔌 Charge stations", &view.ev_stations));
        } else {
            let points: u32 = chargers
                .iter()
                .flat_map(|c| c.connections.iter())
                .map(|c| c.quantity.unwrap_or(1))
                .sum();
            lines.push(format!("🔌 {} charge stations, {} connectors", chargers.len(), points));
            for c in nearest(view.map_center, chargers, |c| Coordinates::new(c.latitude, c.longitude)) {
                lines.push(format!("  • {}", charger(c)));
            }
        }
    }

    if view.layers.pois {
        let pois = view.visible_pois();
        if pois.is_empty() {
            lines.push(status_line(&format!("📌 POIs ({})", view.poi_kind.name()), &view.pois));
        } else {
            lines.push(format!("📌 {} × {} nearby", pois.len(), view.poi_kind.name()));
            for p in nearest(view.map_center, pois, |p| Coordinates::new(p.latitude, p.longitude)) {
                let name = p.name.as_deref().unwrap_or(view.poi_kind.name());
                let mut line = format!("  • {}", escape(name));
                if let Some(hours) = p.tags.get("opening_hours") {
                    line.push_str(&format!(" ({})", escape(hours)));
                }
                lines.push(line);
            }
        }
    }

    if view.is_loading() {
        lines.push("⏳ Still loading…".to_string());
    }

    lines.join("\n")
}

pub fn route(view: &ViewState) -> String {
    match (&view.route.status, view.route()) {
        (_, Some(route)) => {
            let mut text = format!("🗺 Route with {} points", route.points.len());
            if let Some(d) = route.distance_m {
                text.push_str(&format!(", {:.1} km", d / 1000.0));
            }
            if let Some(t) = route.duration_s {
                text.push_str(&format!(", ~{} min", (t / 60.0).round() as i64));
            }
            text
        }
        (FetchStatus::Failed(e), None) => format!("❌ No route: {}", escape(&e.to_string())),
        (FetchStatus::Loading, None) => "⏳ Computing route…".to_string(),
        _ => "No route.".to_string(),
    }
}

pub fn layers(layers: &SmartLayers) -> String {
    let mut text = String::from("<b>Smart layers</b>");
    for layer in SmartLayer::ALL {
        text.push_str(&format!(
            "\n{} {}",
            if layers.is_enabled(layer) { "✅" } else { "⬜" },
            layer.name()
        ));
    }
    text
}

const NEAREST: usize = 3;

fn nearest<T>(center: Option<Coordinates>, items: &[T], at: impl Fn(&T) -> Coordinates) -> Vec<&T> {
    let mut items: Vec<&T> = items.iter().collect();
    if let Some(center) = center {
        items.sort_by(|a, b| center.distance_km(&at(a)).total_cmp(&center.distance_km(&at(b))));
    }
    items.truncate(NEAREST);
    items
}

fn charger(c: &ChargeStation) -> String {
    let mut text = escape(&c.title);
    if let Some(operator) = &c.operator {
        text.push_str(&format!(" · {}", escape(operator)));
    }
    let connectors: Vec<String> = c
        .connections
        .iter()
        .map(|conn| {
            let mut s = conn.kind.clone();
            if let Some(kw) = conn.power_kw {
                s.push_str(&format!(" {:.0} kW", kw));
            }
            if let Some(n) = conn.quantity {
                s.push_str(&format!(" ×{}", n));
            }
            s
        })
        .collect();
    if !connectors.is_empty() {
        text.push_str(&format!(" · {}", escape(&connectors.join(", "))));
    }
    if let Some(status) = &c.status {
        text.push_str(&format!(" · {}", escape(status)));
    }
    if let Some(usage) = &c.usage {
        text.push_str(&format!(" ({})", escape(usage)));
    }
    text
}

fn status_line<T>(label: &str, slot: &Slot<T>) -> String {
    match &slot.status {
        FetchStatus::Loading => format!("{}: loading…", label),
        FetchStatus::Failed(e) => format!("{}: unavailable ({})", label, escape(&e.to_string())),
        FetchStatus::Loaded => format!("{}: none", label),
        FetchStatus::Idle => format!("{}: waiting for a map center", label),
    }
}

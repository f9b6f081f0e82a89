pub mod aggregator;
pub mod api;
pub mod config;
pub mod dashboard;
pub mod io;
pub mod render;
pub mod search;
pub mod structs;
#[cfg(test)]
mod tests;

use api::{DataSource, HttpSource};
use config::{Settings, FAVORITES_KEY};
use dashboard::Dashboard;
use io::FavoritesStore;
use structs::{PoiKind, SmartLayer};

use std::{
    collections::HashMap,
    error::Error,
    sync::{Arc, Mutex, PoisonError},
};
use teloxide::{
    dispatching::{dialogue, dialogue::InMemStorage},
    dptree::{case, deps, endpoint},
    filter_command,
    prelude::*,
    types::{
        ButtonRequest, InlineKeyboardButton, InlineKeyboardMarkup, KeyboardButton, KeyboardMarkup,
        KeyboardRemove, Location, ParseMode::Html,
    },
    utils::command::BotCommands,
};

type HandlerResult = Result<(), Box<dyn std::error::Error + Send + Sync>>;
type MyDialogue = Dialogue<State, InMemStorage<State>>;
type Ctx = Arc<BotContext>;

#[derive(BotCommands, Clone)]
#[command(
    rename_rule = "lowercase",
    description = "These commands are supported:"
)]
enum Command {
    #[command(description = "Display help menu showing the commands list")]
    Help,
    #[command(description = "Start a new map session.")]
    Start,
    #[command(description = "Show the selected network, overlays and route.")]
    Map,
    #[command(description = "Toggle smart layers.")]
    Layers,
    #[command(description = "Move the map center: /pan <lat> <lon>", parse_with = "split")]
    Pan { lat: f64, lon: f64 },
    #[command(description = "Points of interest to show: toilet, water, parking, bench or pharmacy.")]
    Poi(String),
    #[command(description = "List your favorite networks.")]
    Favorites,
    #[command(description = "Leave the selected network.")]
    Clear,
    #[command(description = "Remove the route.")]
    NoRoute,
    #[command(description = "Reload the network directory.")]
    Refresh,
}

#[derive(Clone, Default)]
enum State {
    #[default]
    Start,
    Browse,
}

/// One dashboard per chat, all sharing the same data source.
pub struct BotContext {
    settings: Settings,
    source: Arc<dyn DataSource>,
    dashboards: Mutex<HashMap<ChatId, Arc<Dashboard>>>,
}

impl BotContext {
    fn new(settings: Settings, source: Arc<dyn DataSource>) -> Self {
        BotContext {
            settings,
            source,
            dashboards: Mutex::new(HashMap::new()),
        }
    }

    /// Replaces the chat's dashboard with a fresh one.
    fn open(&self, chat: ChatId) -> Arc<Dashboard> {
        let favorites = FavoritesStore::open(
            &self.settings.favorites_path,
            format!("{}:{}", FAVORITES_KEY, chat.0),
        );
        let dashboard = Dashboard::new(Arc::clone(&self.source), favorites, self.settings.clone());
        let mut dashboards = self.dashboards.lock().unwrap_or_else(PoisonError::into_inner);
        dashboards.insert(chat, Arc::clone(&dashboard));
        dashboard
    }

    fn dashboard(&self, chat: ChatId) -> Arc<Dashboard> {
        let existing = self
            .dashboards
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&chat)
            .cloned();
        match existing {
            Some(d) => d,
            None => self.open(chat),
        }
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    dotenv::dotenv().ok();
    pretty_env_logger::init();
    log::info!("Starting bike-share map BOT ...");

    let settings = Settings::from_env();
    log::debug!("{:?}", settings);
    let source: Arc<dyn DataSource> = Arc::new(HttpSource::new());
    let ctx: Ctx = Arc::new(BotContext::new(settings, source));

    let bot = Bot::from_env();

    let command_handler = filter_command::<Command, _>()
        .branch(case![Command::Help].endpoint(help))
        .branch(case![Command::Start].endpoint(start))
        .branch(
            case![State::Browse]
                .branch(case![Command::Map].endpoint(show_map))
                .branch(case![Command::Layers].endpoint(show_layers))
                .branch(case![Command::Pan { lat, lon }].endpoint(pan))
                .branch(case![Command::Poi(kind)].endpoint(choose_poi))
                .branch(case![Command::Favorites].endpoint(show_favorites))
                .branch(case![Command::Clear].endpoint(clear))
                .branch(case![Command::NoRoute].endpoint(no_route))
                .branch(case![Command::Refresh].endpoint(refresh)),
        );

    let message_handler = Update::filter_message()
        .branch(command_handler)
        .branch(
            case![State::Browse]
                .branch(Message::filter_location().endpoint(receive_location))
                .branch(Message::filter_text().endpoint(receive_query)),
        )
        .branch(endpoint(invalid_state));

    let callback_query_handler =
        Update::filter_callback_query().branch(case![State::Browse].endpoint(receive_callback));

    let dial = dialogue::enter::<Update, InMemStorage<State>, State, _>()
        .branch(message_handler)
        .branch(callback_query_handler);

    Dispatcher::builder(bot, dial)
        .dependencies(deps![InMemStorage::<State>::new(), ctx])
        .enable_ctrlc_handler()
        .build()
        .dispatch()
        .await;
    Ok(())
}

async fn help(bot: Bot, msg: Message) -> HandlerResult {
    bot.send_message(msg.chat.id, Command::descriptions().to_string())
        .await?;
    Ok(())
}

async fn invalid_state(bot: Bot, msg: Message) -> HandlerResult {
    bot.send_message(
        msg.chat.id,
        "Unable to handle the message. Type /start to open the map or /help to see the usage.",
    )
    .await?;
    Ok(())
}

//////////////////////////////////////////////////////////
// Command handlers
//////////////////////////////////////////////////////////
async fn start(bot: Bot, dialogue: MyDialogue, msg: Message, ctx: Ctx) -> HandlerResult {
    let dashboard = ctx.open(msg.chat.id);

    bot.send_message(
        msg.chat.id,
        "🚲 Let's find some bikes!\n\nShare your location so I can center the map on you, \
         or just send me a city or network name.",
    )
    .reply_markup(location_keyboard())
    .await?;

    dashboard.start().await;
    let text = dashboard.with_view(|v| match v.networks.error() {
        Some(e) => format!("❌ Could not load the network directory: {}", e),
        None => format!("I know {} bike-share networks around the world 🌍", v.networks().len()),
    });
    bot.send_message(msg.chat.id, text).await?;

    dialogue.update(State::Browse).await?;
    Ok(())
}

async fn show_map(bot: Bot, msg: Message, ctx: Ctx) -> HandlerResult {
    let dashboard = ctx.dashboard(msg.chat.id);
    send_selection(&bot, msg.chat.id, &dashboard).await?;
    send_overlays(&bot, msg.chat.id, &dashboard).await?;
    let route = dashboard.with_view(render::route);
    bot.send_message(msg.chat.id, route).parse_mode(Html).await?;
    Ok(())
}

async fn show_layers(bot: Bot, msg: Message, ctx: Ctx) -> HandlerResult {
    let dashboard = ctx.dashboard(msg.chat.id);
    let (text, kb) = dashboard.with_view(|v| (render::layers(&v.layers), layers_keyboard(&v.layers)));
    bot.send_message(msg.chat.id, text)
        .parse_mode(Html)
        .reply_markup(kb)
        .await?;
    Ok(())
}

async fn pan(bot: Bot, msg: Message, ctx: Ctx, (lat, lon): (f64, f64)) -> HandlerResult {
    if !(-90.0..=90.0).contains(&lat) || !(-180.0..=180.0).contains(&lon) {
        bot.send_message(msg.chat.id, "❌ Latitude must be within ±90 and longitude within ±180.")
            .await?;
        return Ok(());
    }
    let dashboard = ctx.dashboard(msg.chat.id);
    overlays_after_pan(bot, msg.chat.id, dashboard, lat, lon);
    Ok(())
}

async fn choose_poi(bot: Bot, msg: Message, ctx: Ctx, kind: String) -> HandlerResult {
    let kind = match PoiKind::from_name(&kind) {
        Some(k) => k,
        None => {
            let names: Vec<&str> = PoiKind::ALL.iter().map(|k| k.name()).collect();
            bot.send_message(msg.chat.id, format!("❌ Pick one of: {}", names.join(", ")))
                .await?;
            return Ok(());
        }
    };
    let dashboard = ctx.dashboard(msg.chat.id);
    dashboard.set_poi_kind(kind).await;
    send_overlays(&bot, msg.chat.id, &dashboard).await?;
    Ok(())
}

async fn show_favorites(bot: Bot, msg: Message, ctx: Ctx) -> HandlerResult {
    let dashboard = ctx.dashboard(msg.chat.id);
    let favorites = dashboard.favorites();
    let buttons: Vec<(String, String)> = dashboard.with_view(|v| {
        v.networks()
            .iter()
            .filter(|n| favorites.networks.contains(&n.id))
            .map(|n| (render::network_line(n, true), format!("net:{}", n.id)))
            .collect()
    });

    let text = format!(
        "⭐ {} favorite networks, {} favorite stations",
        favorites.networks.len(),
        favorites.stations.len()
    );
    if buttons.is_empty() {
        bot.send_message(msg.chat.id, text).await?;
    } else {
        bot.send_message(msg.chat.id, text)
            .reply_markup(make_inline_keyboard(buttons, 1))
            .await?;
    }
    Ok(())
}

async fn clear(bot: Bot, msg: Message, ctx: Ctx) -> HandlerResult {
    ctx.dashboard(msg.chat.id).clear_selection();
    bot.send_message(msg.chat.id, "🔙 Back to all networks. Send a name to search.")
        .await?;
    Ok(())
}

async fn no_route(bot: Bot, msg: Message, ctx: Ctx) -> HandlerResult {
    ctx.dashboard(msg.chat.id).clear_route();
    bot.send_message(msg.chat.id, "🗺 Route removed.").await?;
    Ok(())
}

async fn refresh(bot: Bot, msg: Message, ctx: Ctx) -> HandlerResult {
    let dashboard = ctx.dashboard(msg.chat.id);
    dashboard.refresh_networks().await;
    let text = dashboard.with_view(|v| match v.networks.error() {
        Some(e) => format!("❌ Refresh failed: {}", e),
        None => format!("🔄 {} networks loaded.", v.networks().len()),
    });
    bot.send_message(msg.chat.id, text).await?;
    Ok(())
}

//////////////////////////////////////////////////////////
// Message handlers
//////////////////////////////////////////////////////////
async fn receive_location(bot: Bot, msg: Message, ctx: Ctx, location: Location) -> HandlerResult {
    let dashboard = ctx.dashboard(msg.chat.id);
    let first_fix = dashboard.with_view(|v| v.user_location.is_none());

    if first_fix {
        dashboard
            .set_user_location(location.latitude, location.longitude)
            .await;
        bot.send_message(msg.chat.id, "📍 Got your location!")
            .reply_markup(KeyboardRemove::new())
            .await?;
        send_overlays(&bot, msg.chat.id, &dashboard).await?;
    } else {
        overlays_after_pan(bot, msg.chat.id, dashboard, location.latitude, location.longitude);
    }
    Ok(())
}

async fn receive_query(bot: Bot, msg: Message, ctx: Ctx, query: String) -> HandlerResult {
    if query.starts_with('/') {
        return invalid_state(bot, msg).await;
    }

    let dashboard = ctx.dashboard(msg.chat.id);
    let favorites = dashboard.favorites();
    let results = dashboard.search(&query);

    if results.is_empty() {
        bot.send_message(
            msg.chat.id,
            "🔍 No networks found. Try another name (at least 2 characters).",
        )
        .await?;
        return Ok(());
    }

    let buttons = results
        .iter()
        .map(|n| {
            (
                render::network_line(n, favorites.networks.contains(&n.id)),
                format!("net:{}", n.id),
            )
        })
        .collect();
    bot.send_message(msg.chat.id, format!("🔍 Networks matching <b>{}</b>:", teloxide::utils::html::escape(&query)))
        .parse_mode(Html)
        .reply_markup(make_inline_keyboard(buttons, 1))
        .await?;
    Ok(())
}

async fn receive_callback(bot: Bot, q: CallbackQuery, ctx: Ctx) -> HandlerResult {
    let data = match &q.data {
        Some(d) => d.clone(),
        None => return Ok(()),
    };
    bot.answer_callback_query(q.id.clone()).await?;

    let (chat_id, message_id) = match q.message.as_ref() {
        Some(m) => (m.chat.id, m.id),
        None => return Ok(()),
    };
    let dashboard = ctx.dashboard(chat_id);
    let (action, arg) = data.split_once(':').unwrap_or((data.as_str(), ""));

    match action {
        "net" => {
            dashboard.select_network(arg).await;
            send_selection(&bot, chat_id, &dashboard).await?;
            send_overlays(&bot, chat_id, &dashboard).await?;
        }
        "favnet" => {
            let now = dashboard.toggle_favorite_network(arg);
            bot.send_message(chat_id, if now { "⭐ Added to favorites." } else { "☆ Removed from favorites." })
                .await?;
        }
        "st" => {
            let favorite = dashboard.is_favorite_station(arg);
            let text = dashboard.with_view(|v| {
                v.selected_network()
                    .and_then(|d| d.station(arg))
                    .map(|s| render::station(s, favorite))
            });
            match text {
                Some(text) => {
                    let kb = make_inline_keyboard(
                        vec![
                            ("🗺 Route here".to_string(), format!("route:{}", arg)),
                            (
                                if favorite { "☆ Unfavorite" } else { "⭐ Favorite" }.to_string(),
                                format!("favst:{}", arg),
                            ),
                        ],
                        2,
                    );
                    bot.send_message(chat_id, text)
                        .parse_mode(Html)
                        .reply_markup(kb)
                        .await?;
                }
                None => {
                    bot.send_message(chat_id, "❌ That station is no longer on the map.").await?;
                }
            }
        }
        "favst" => {
            let now = dashboard.toggle_favorite_station(arg);
            bot.send_message(chat_id, if now { "⭐ Station saved." } else { "☆ Station removed." })
                .await?;
        }
        "route" => {
            let target = dashboard.with_view(|v| {
                v.selected_network()
                    .and_then(|d| d.station(arg))
                    .map(|s| s.coordinates())
            });
            let to = match target {
                Some(to) => to,
                None => {
                    bot.send_message(chat_id, "❌ That station is no longer on the map.").await?;
                    return Ok(());
                }
            };
            dashboard.fetch_route(to.lat, to.lon).await;
            let (text, arrived) = dashboard.with_view(|v| (render::route(v), v.route().is_some()));
            bot.send_message(chat_id, text).parse_mode(Html).await?;
            if arrived {
                bot.send_location(chat_id, to.lat, to.lon).await?;
            }
        }
        "layer" => match SmartLayer::from_name(arg) {
            Some(layer) => {
                dashboard.toggle_smart_layer(layer).await;
                let kb = dashboard.with_view(|v| layers_keyboard(&v.layers));
                bot.edit_message_reply_markup(chat_id, message_id)
                    .reply_markup(kb)
                    .await?;
                send_overlays(&bot, chat_id, &dashboard).await?;
            }
            None => log::warn!("Unknown layer {:?}", arg),
        },
        _ => log::warn!("Unknown callback data {:?}", data),
    }
    Ok(())
}

//////////////////////////////////////////////////////////
// Views
//////////////////////////////////////////////////////////
async fn send_selection(bot: &Bot, chat_id: ChatId, dashboard: &Dashboard) -> HandlerResult {
    let favorites = dashboard.favorites();
    let (text, buttons) = dashboard.with_view(|v| {
        let text = render::selection(v, &favorites);
        let mut buttons: Vec<(String, String)> = vec![];
        if let Some(detail) = v.selected_network() {
            let id = &detail.network.id;
            let label = if favorites.networks.contains(id) { "☆ Unfavorite" } else { "⭐ Favorite" };
            buttons.push((label.to_string(), format!("favnet:{}", id)));
            for s in detail.top_stations() {
                buttons.push((format!("🚏 {}", s.name), format!("st:{}", s.id)));
            }
        }
        (text, buttons)
    });

    if buttons.is_empty() {
        bot.send_message(chat_id, text).parse_mode(Html).await?;
    } else {
        bot.send_message(chat_id, text)
            .parse_mode(Html)
            .reply_markup(make_inline_keyboard(buttons, 1))
            .await?;
    }
    Ok(())
}

async fn send_overlays(bot: &Bot, chat_id: ChatId, dashboard: &Dashboard) -> HandlerResult {
    let text = dashboard.with_view(render::overlays);
    bot.send_message(chat_id, text).parse_mode(Html).await?;
    Ok(())
}

/// Pans without blocking the chat's update queue, so the next location can
/// supersede this one during the debounce. Overlays are sent only for the pan
/// that sticks.
fn overlays_after_pan(bot: Bot, chat_id: ChatId, dashboard: Arc<Dashboard>, lat: f64, lon: f64) {
    let pending = dashboard.spawn_pan(lat, lon);
    tokio::spawn(async move {
        match pending.await {
            Ok(true) => {
                if let Err(e) = send_overlays(&bot, chat_id, &dashboard).await {
                    log::error!("Unable to send overlays to {}: {}", chat_id, e);
                }
            }
            Ok(false) => {}
            Err(e) => log::error!("Pan task failed: {}", e),
        }
    });
}

//////////////////////////////////////////////////////////
// Keyboards
//////////////////////////////////////////////////////////
/// Creates an inline keyboard from (label, callback data) pairs, `chunks` per row.
fn make_inline_keyboard(list: Vec<(String, String)>, chunks: usize) -> InlineKeyboardMarkup {
    let mut keyboard: Vec<Vec<InlineKeyboardButton>> = vec![];

    for values in list.chunks(chunks) {
        let row = values
            .iter()
            .map(|(label, data)| InlineKeyboardButton::callback(label.to_owned(), data.to_owned()))
            .collect();

        keyboard.push(row);
    }

    InlineKeyboardMarkup::new(keyboard)
}

fn layers_keyboard(layers: &structs::SmartLayers) -> InlineKeyboardMarkup {
    let buttons = SmartLayer::ALL
        .iter()
        .map(|l| {
            let mark = if layers.is_enabled(*l) { "✅" } else { "⬜" };
            (format!("{} {}", mark, l.name()), format!("layer:{}", l.name()))
        })
        .collect();
    make_inline_keyboard(buttons, 2)
}

/// A one-button reply keyboard asking for the user's location.
fn location_keyboard() -> KeyboardMarkup {
    KeyboardMarkup::new(vec![vec![
        KeyboardButton::new("📍 Share my location").request(ButtonRequest::Location)
    ]])
}

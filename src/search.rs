use crate::config::{MIN_QUERY_LEN, SEARCH_LIMIT};
use crate::structs::{Favorites, Network};

/// Networks whose name, city or country contains `query`, favorites first.
pub fn filter<'a>(networks: &'a [Network], query: &str, favorites: &Favorites) -> Vec<&'a Network> {
    filter_with_limit(networks, query, favorites, SEARCH_LIMIT)
}

pub fn filter_with_limit<'a>(
    networks: &'a [Network],
    query: &str,
    favorites: &Favorites,
    limit: usize,
) -> Vec<&'a Network> {
    let query = query.trim().to_lowercase();
    if query.chars().count() < MIN_QUERY_LEN {
        return vec![];
    }

    let (mut favs, mut rest): (Vec<&Network>, Vec<&Network>) = networks
        .iter()
        .filter(|n| matches(n, &query))
        .partition(|n| favorites.networks.contains(&n.id));

    rest.sort_by(|a, b| {
        a.name
            .to_lowercase()
            .cmp(&b.name.to_lowercase())
            .then_with(|| a.name.cmp(&b.name))
    });

    favs.append(&mut rest);
    favs.truncate(limit);
    favs
}

fn matches(network: &Network, query: &str) -> bool {
    [&network.name, &network.location.city, &network.location.country]
        .iter()
        .any(|field| field.to_lowercase().contains(query))
}

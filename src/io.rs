use crate::structs::Favorites;

use std::{
    collections::{BTreeMap, BTreeSet},
    error::Error,
    fs::{self, File},
    io::ErrorKind,
    path::{Path, PathBuf},
};

use serde_json::Value;

//////////////////////////////////////////////////////////
// I/O
//////////////////////////////////////////////////////////
/// Favorite networks and stations, persisted as one JSON blob under `key`
/// inside a key/value JSON file. Other keys in the file are left untouched.
#[derive(Debug)]
pub struct FavoritesStore {
    path: PathBuf,
    key: String,
    favorites: Favorites,
}

impl FavoritesStore {
    /// Loads the blob stored under `key`. A missing file, a malformed file or
    /// a malformed blob all give empty favorites.
    pub fn open(path: impl AsRef<Path>, key: impl Into<String>) -> Self {
        let path = path.as_ref().to_path_buf();
        let key = key.into();

        let favorites = read_entries(&path)
            .remove(&key)
            .and_then(|blob| match serde_json::from_value::<Favorites>(blob) {
                Ok(f) => Some(f),
                Err(e) => {
                    log::warn!("Discarding malformed favorites under {:?}: {}", key, e);
                    None
                }
            })
            .unwrap_or_default();

        log::debug!(
            "Loaded {} favorite networks and {} favorite stations for {:?}",
            favorites.networks.len(),
            favorites.stations.len(),
            key
        );
        FavoritesStore { path, key, favorites }
    }

    pub fn favorites(&self) -> &Favorites {
        &self.favorites
    }

    pub fn is_favorite_station(&self, id: &str) -> bool {
        self.favorites.stations.contains(id)
    }

    /// Adds `id` if absent, removes it otherwise. Returns whether it is now a favorite.
    pub fn toggle_favorite_network(&mut self, id: &str) -> bool {
        let now = toggle(&mut self.favorites.networks, id);
        self.persist();
        now
    }

    pub fn toggle_favorite_station(&mut self, id: &str) -> bool {
        let now = toggle(&mut self.favorites.stations, id);
        self.persist();
        now
    }

    fn persist(&self) {
        if let Err(e) = self.save() {
            log::error!("Unable to write favorites to {}: {}", self.path.display(), e);
        }
    }

    pub fn save(&self) -> Result<(), Box<dyn Error + Send + Sync>> {
        let mut entries = read_entries(&self.path);
        entries.insert(self.key.clone(), serde_json::to_value(&self.favorites)?);

        let file = File::create(&self.path)?;
        serde_json::to_writer(file, &entries)?;
        Ok(())
    }
}

fn toggle(set: &mut BTreeSet<String>, id: &str) -> bool {
    if set.remove(id) {
        false
    } else {
        set.insert(id.to_owned());
        true
    }
}

fn read_entries(path: &Path) -> BTreeMap<String, Value> {
    let data = match fs::read_to_string(path) {
        Ok(d) => d,
        Err(e) if e.kind() == ErrorKind::NotFound => return BTreeMap::new(),
        Err(e) => {
            log::warn!("Unable to read {}: {}", path.display(), e);
            return BTreeMap::new();
        }
    };

    match serde_json::from_str(&data) {
        Ok(entries) => entries,
        Err(e) => {
            log::warn!("Ignoring malformed favorites file {}: {}", path.display(), e);
            BTreeMap::new()
        }
    }
}

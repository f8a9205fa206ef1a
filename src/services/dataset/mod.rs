//! Dataset loading: index mapping, the MovieLens-100K text format, synthetic
//! datasets for tests and demos, and a leave-last-out holdout split.

use crate::error::{RecError, RecResult};
use crate::models::{Dataset, Interaction, Item, User};
use std::collections::HashMap;
use std::path::Path;
use tracing::{info, warn};

/// Genre vocabulary width of MovieLens-100K.
pub const MOVIELENS_GENRES: usize = 19;

const RATINGS_FILE: &str = "u.data";
const ITEMS_FILE: &str = "u.item";
const GENRES_FILE: &str = "u.genre";

/// Assigns contiguous indices in first-seen order and collects interactions.
#[derive(Debug, Default)]
pub struct DatasetBuilder {
    users: Vec<User>,
    items: Vec<Item>,
    user_lookup: HashMap<String, usize>,
    item_lookup: HashMap<String, usize>,
    interactions: Vec<Interaction>,
    genre_names: Vec<String>,
    genre_dim: usize,
}

impl DatasetBuilder {
    pub fn new(genre_dim: usize) -> Self {
        Self {
            genre_dim,
            ..Self::default()
        }
    }

    pub fn with_genre_names(mut self, names: Vec<String>) -> Self {
        self.genre_dim = names.len();
        self.genre_names = names;
        self
    }

    pub fn genre_dim(&self) -> usize {
        self.genre_dim
    }

    pub fn user(&mut self, id: &str) -> usize {
        if let Some(&index) = self.user_lookup.get(id) {
            return index;
        }
        let index = self.users.len();
        self.users.push(User {
            id: id.to_string(),
            index,
        });
        self.user_lookup.insert(id.to_string(), index);
        index
    }

    /// Index of item `id`, registering it without metadata if unseen.
    pub fn item(&mut self, id: &str) -> usize {
        if let Some(&index) = self.item_lookup.get(id) {
            return index;
        }
        let index = self.items.len();
        self.items.push(Item {
            id: id.to_string(),
            index,
            title: String::new(),
            year: None,
            genres: None,
        });
        self.item_lookup.insert(id.to_string(), index);
        index
    }

    /// Registers or updates item metadata. Genre vectors of the wrong width are dropped.
    pub fn describe_item(
        &mut self,
        id: &str,
        title: &str,
        year: Option<i32>,
        genres: Option<Vec<f32>>,
    ) -> usize {
        let index = self.item(id);
        let genre_dim = self.genre_dim;
        let item = &mut self.items[index];
        item.title = title.to_string();
        item.year = year;
        item.genres = match genres {
            Some(g) if g.len() == genre_dim => Some(g),
            Some(g) => {
                warn!(
                    item = id,
                    found = g.len(),
                    expected = genre_dim,
                    "dropping genre vector of wrong width"
                );
                None
            }
            None => None,
        };
        index
    }

    pub fn interaction(&mut self, user_id: &str, item_id: &str, rating: f32, timestamp: i64) {
        let user = self.user(user_id);
        let item = self.item(item_id);
        self.interactions.push(Interaction {
            user,
            item,
            rating,
            timestamp,
        });
    }

    pub fn build(self) -> RecResult<Dataset> {
        let dataset = Dataset::new(
            self.users,
            self.items,
            self.interactions,
            self.genre_names,
            self.genre_dim,
        );
        dataset.validate()?;
        Ok(dataset)
    }
}

/// Reads `u.data`, `u.item` and (optionally) `u.genre` from `dir`.
///
/// Items are indexed in `u.item` order so unrated titles stay in the catalog;
/// users are indexed in first-seen order of `u.data`. Malformed lines are
/// skipped with a warning.
pub fn load_movielens<P: AsRef<Path>>(dir: P) -> RecResult<Dataset> {
    let dir = dir.as_ref();

    let genre_names = match read_lossy(&dir.join(GENRES_FILE)) {
        Ok(text) => parse_genres(&text),
        Err(RecError::Io(e)) if e.kind() == std::io::ErrorKind::NotFound => {
            warn!("{} not found, assuming {} genres", GENRES_FILE, MOVIELENS_GENRES);
            Vec::new()
        }
        Err(e) => return Err(e),
    };

    let mut builder = if genre_names.is_empty() {
        DatasetBuilder::new(MOVIELENS_GENRES)
    } else {
        DatasetBuilder::new(0).with_genre_names(genre_names)
    };

    let items_text = read_lossy(&dir.join(ITEMS_FILE))?;
    let mut skipped = 0usize;
    for (number, line) in items_text.lines().enumerate() {
        if line.trim().is_empty() {
            continue;
        }
        match parse_item_line(line, builder.genre_dim()) {
            Ok((id, title, year, genres)) => {
                builder.describe_item(&id, &title, year, Some(genres));
            }
            Err(message) => {
                skipped += 1;
                warn!(file = ITEMS_FILE, line = number + 1, %message, "skipping malformed line");
            }
        }
    }

    let ratings_text = read_lossy(&dir.join(RATINGS_FILE))?;
    for (number, line) in ratings_text.lines().enumerate() {
        if line.trim().is_empty() {
            continue;
        }
        match parse_rating_line(line) {
            Ok((user, item, rating, timestamp)) => {
                builder.interaction(user, item, rating, timestamp);
            }
            Err(message) => {
                skipped += 1;
                warn!(file = RATINGS_FILE, line = number + 1, %message, "skipping malformed line");
            }
        }
    }

    let dataset = builder.build()?;
    info!(
        users = dataset.num_users(),
        items = dataset.num_items(),
        interactions = dataset.interactions.len(),
        skipped,
        "loaded MovieLens dataset from {}",
        dir.display()
    );
    Ok(dataset)
}

fn read_lossy(path: &Path) -> RecResult<String> {
    let bytes = std::fs::read(path)?;
    Ok(String::from_utf8_lossy(&bytes).into_owned())
}

fn parse_genres(text: &str) -> Vec<String> {
    let mut named: Vec<(usize, String)> = text
        .lines()
        .filter_map(|line| {
            let (name, id) = line.trim().rsplit_once('|')?;
            Some((id.trim().parse().ok()?, name.to_string()))
        })
        .collect();
    named.sort_by_key(|(id, _)| *id);
    named.into_iter().map(|(_, name)| name).collect()
}

type ItemRecord = (String, String, Option<i32>, Vec<f32>);

fn parse_item_line(line: &str, genre_dim: usize) -> Result<ItemRecord, String> {
    let fields: Vec<&str> = line.split('|').collect();
    if fields.len() < 5 + genre_dim {
        return Err(format!("expected {} fields, found {}", 5 + genre_dim, fields.len()));
    }

    let id = fields[0].trim();
    if id.is_empty() {
        return Err("empty item id".into());
    }
    let title = fields[1].trim();

    let flags = &fields[fields.len() - genre_dim..];
    let genres = flags
        .iter()
        .map(|flag| match flag.trim() {
            "1" => Ok(1.0),
            "0" => Ok(0.0),
            other => Err(format!("bad genre flag `{other}`")),
        })
        .collect::<Result<Vec<f32>, String>>()?;

    let year = year_from_title(title).or_else(|| year_from_date(fields[2]));
    Ok((id.to_string(), title.to_string(), year, genres))
}

/// `"Toy Story (1995)"` -> `Some(1995)`.
fn year_from_title(title: &str) -> Option<i32> {
    let inner = title.trim_end().strip_suffix(')')?;
    let (_, year) = inner.rsplit_once('(')?;
    if year.len() == 4 {
        year.parse().ok()
    } else {
        None
    }
}

/// `"01-Jan-1995"` -> `Some(1995)`.
fn year_from_date(date: &str) -> Option<i32> {
    date.trim().rsplit('-').next()?.parse().ok()
}

fn parse_rating_line(line: &str) -> Result<(&str, &str, f32, i64), String> {
    let fields: Vec<&str> = line.split_whitespace().collect();
    if fields.len() != 4 {
        return Err(format!("expected 4 fields, found {}", fields.len()));
    }
    let rating: f32 = fields[2]
        .parse()
        .map_err(|e| format!("bad rating `{}`: {e}", fields[2]))?;
    if !rating.is_finite() {
        return Err(format!("bad rating `{}`", fields[2]));
    }
    let timestamp: i64 = fields[3]
        .parse()
        .map_err(|e| format!("bad timestamp `{}`: {e}", fields[3]))?;
    Ok((fields[0], fields[1], rating, timestamp))
}

/// Training interactions plus one held-out interaction per eligible user.
#[derive(Debug, Clone)]
pub struct HoldoutSplit {
    pub train: Dataset,
    pub test: Vec<Interaction>,
}

/// Holds out the latest interaction of every user with at least two.
/// Timestamp ties go to the interaction that appears last in the log.
pub fn leave_last_out(dataset: &Dataset) -> HoldoutSplit {
    let mut latest: Vec<Option<usize>> = vec![None; dataset.num_users()];
    let mut counts = vec![0usize; dataset.num_users()];

    for (position, interaction) in dataset.interactions.iter().enumerate() {
        let Some(slot) = latest.get_mut(interaction.user) else {
            continue;
        };
        counts[interaction.user] += 1;
        let newer = match *slot {
            Some(current) => dataset.interactions[current].timestamp <= interaction.timestamp,
            None => true,
        };
        if newer {
            *slot = Some(position);
        }
    }

    let held_out: Vec<usize> = latest
        .iter()
        .zip(&counts)
        .filter_map(|(slot, &count)| if count >= 2 { *slot } else { None })
        .collect();
    let held_out_set: std::collections::HashSet<usize> = held_out.iter().copied().collect();

    let train = dataset
        .interactions
        .iter()
        .enumerate()
        .filter(|(position, _)| !held_out_set.contains(position))
        .map(|(_, interaction)| *interaction)
        .collect();
    let mut test: Vec<Interaction> = held_out.iter().map(|&p| dataset.interactions[p]).collect();
    test.sort_by_key(|interaction| interaction.user);

    HoldoutSplit {
        train: dataset.with_interactions(train),
        test,
    }
}

pub mod synthetic {
    use super::DatasetBuilder;
    use crate::error::RecResult;
    use crate::models::Dataset;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    fn one_hot(position: usize, genre_dim: usize) -> Option<Vec<f32>> {
        if genre_dim == 0 {
            return None;
        }
        let mut genres = vec![0.0; genre_dim];
        genres[position % genre_dim] = 1.0;
        Some(genres)
    }

    /// User `i` rated exactly item `i`.
    pub fn bijection(n: usize, genre_dim: usize) -> RecResult<Dataset> {
        let mut builder = DatasetBuilder::new(genre_dim);
        for i in 0..n {
            let item = format!("item-{i}");
            builder.describe_item(&item, &format!("Movie {i}"), None, one_hot(i, genre_dim));
            builder.interaction(&format!("user-{i}"), &item, 5.0, i as i64);
        }
        builder.build()
    }

    /// Every user rates `per_user` distinct items drawn uniformly.
    pub fn random(
        num_users: usize,
        num_items: usize,
        per_user: usize,
        genre_dim: usize,
        seed: u64,
    ) -> RecResult<Dataset> {
        let mut rng = StdRng::seed_from_u64(seed);
        let mut builder = DatasetBuilder::new(genre_dim);

        for i in 0..num_items {
            let genres = one_hot(rng.gen_range(0..genre_dim.max(1)), genre_dim).map(|mut g| {
                if genre_dim > 1 && rng.gen_bool(0.3) {
                    g[rng.gen_range(0..genre_dim)] = 1.0;
                }
                g
            });
            let year = Some(1990 + (i % 10) as i32);
            builder.describe_item(&format!("item-{i}"), &format!("Movie {i}"), year, genres);
        }

        let per_user = per_user.min(num_items);
        let mut timestamp = 0i64;
        for u in 0..num_users {
            let user = format!("user-{u}");
            for item in rand::seq::index::sample(&mut rng, num_items, per_user) {
                timestamp += 1;
                let rating = rng.gen_range(1..=5) as f32;
                builder.interaction(&user, &format!("item-{item}"), rating, timestamp);
            }
        }

        builder.build()
    }
}

use crate::config::Config;
use crate::error::{RecError, RecResult};
use crate::models::Dataset;

/// Checks the loader contract: contiguous indices, in-range interactions and
/// genre vectors of the declared width.
pub fn validate_dataset(dataset: &Dataset) -> RecResult<()> {
    let violation = |msg: String| Err(RecError::DataContractViolation(msg));

    if dataset.users.is_empty() {
        return violation("dataset has no users".into());
    }
    if dataset.items.is_empty() {
        return violation("dataset has no items".into());
    }
    if dataset.interactions.is_empty() {
        return violation("dataset has no interactions".into());
    }

    for (position, user) in dataset.users.iter().enumerate() {
        if user.index != position {
            return violation(format!(
                "user `{}` has index {} at position {}",
                user.id, user.index, position
            ));
        }
    }

    for (position, item) in dataset.items.iter().enumerate() {
        if item.index != position {
            return violation(format!(
                "item `{}` has index {} at position {}",
                item.id, item.index, position
            ));
        }
        if let Some(genres) = &item.genres {
            if genres.len() != dataset.genre_dim {
                return violation(format!(
                    "item `{}` has {} genre flags, expected {}",
                    item.id,
                    genres.len(),
                    dataset.genre_dim
                ));
            }
            if genres.iter().any(|g| !g.is_finite()) {
                return violation(format!("item `{}` has non-finite genre values", item.id));
            }
        }
    }

    let (num_users, num_items) = (dataset.num_users(), dataset.num_items());
    for (position, interaction) in dataset.interactions.iter().enumerate() {
        if interaction.user >= num_users {
            return violation(format!(
                "interaction {} references user {} of {}",
                position, interaction.user, num_users
            ));
        }
        if interaction.item >= num_items {
            return violation(format!(
                "interaction {} references item {} of {}",
                position, interaction.item, num_items
            ));
        }
    }

    Ok(())
}

pub fn validate_config(config: &Config) -> RecResult<()> {
    config.model.validate()?;

    let training = &config.training;
    if training.batch_size == 0 {
        return Err(RecError::InvalidConfig("batch_size must be positive".into()));
    }
    if !(training.learning_rate > 0.0 && training.learning_rate.is_finite()) {
        return Err(RecError::InvalidConfig(format!(
            "learning_rate must be positive, got {}",
            training.learning_rate
        )));
    }
    if !(training.temperature > 0.0 && training.temperature.is_finite()) {
        return Err(RecError::InvalidConfig(format!(
            "temperature must be positive, got {}",
            training.temperature
        )));
    }
    if training.max_negative_attempts == 0 {
        return Err(RecError::InvalidConfig("max_negative_attempts must be positive".into()));
    }
    if config.retrieval.scoring_batch_size == 0 {
        return Err(RecError::InvalidConfig("scoring_batch_size must be positive".into()));
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Interaction, Item, User};

    fn dataset(interactions: Vec<Interaction>, genres: Option<Vec<f32>>) -> Dataset {
        let users = vec![User {
            id: "u".into(),
            index: 0,
        }];
        let items = vec![Item {
            id: "i".into(),
            index: 0,
            title: "Heat (1995)".into(),
            year: Some(1995),
            genres,
        }];
        Dataset::new(users, items, interactions, Vec::new(), 2)
    }

    #[test]
    fn test_valid_dataset() {
        let ok = dataset(
            vec![Interaction {
                user: 0,
                item: 0,
                rating: 5.0,
                timestamp: 0,
            }],
            Some(vec![1.0, 0.0]),
        );
        assert!(validate_dataset(&ok).is_ok());
    }

    #[test]
    fn test_out_of_range_interaction() {
        let bad = dataset(
            vec![Interaction {
                user: 0,
                item: 1,
                rating: 5.0,
                timestamp: 0,
            }],
            None,
        );
        assert!(matches!(validate_dataset(&bad), Err(RecError::DataContractViolation(_))));
    }

    #[test]
    fn test_wrong_genre_width() {
        let bad = dataset(
            vec![Interaction {
                user: 0,
                item: 0,
                rating: 5.0,
                timestamp: 0,
            }],
            Some(vec![1.0]),
        );
        assert!(matches!(validate_dataset(&bad), Err(RecError::DataContractViolation(_))));
    }

    #[test]
    fn test_empty_interactions() {
        assert!(validate_dataset(&dataset(Vec::new(), None)).is_err());
    }

    #[test]
    fn test_config_rules() {
        let mut config = Config::default();
        config.training.batch_size = 0;
        assert!(matches!(validate_config(&config), Err(RecError::InvalidConfig(_))));

        let mut config = Config::default();
        config.training.temperature = 0.0;
        assert!(validate_config(&config).is_err());

        let mut config = Config::default();
        config.model.embedding_dim = 0;
        assert!(validate_config(&config).is_err());
    }
}

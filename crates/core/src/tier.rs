use crate::types::{Currency, DonationLevel, VisualConfig};

/// Picks the visual configuration for a donation amount.
///
/// Among enabled levels whose `[min, max)` range contains `amount` in the same currency, the one
/// with the lowest `min_amount` wins; equal minimums fall back to `level_id` ordering. Without a
/// match the streamer default is returned unchanged.
pub fn resolve(
    levels: &[DonationLevel],
    default_config: &VisualConfig,
    amount: i64,
    currency: Currency,
) -> VisualConfig {
    let selected = levels
        .iter()
        .filter(|level| level.matches(amount, currency))
        .min_by(|a, b| {
            a.min_amount
                .cmp(&b.min_amount)
                .then_with(|| a.level_id.cmp(&b.level_id))
        });

    match selected {
        Some(level) => {
            let mut config = default_config.clone().with_overrides(&level.configuration);
            config.level_id = Some(level.level_id.clone());
            config
        }
        None => default_config.clone(),
    }
}

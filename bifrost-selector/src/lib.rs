//! Weighted key selector (spec §4.A).
//!
//! Implements Efraimidis-Spirakis "A-Res" weighted reservoir sampling, used
//! here for a full ordering rather than a single draw: `P(key first) ∝
//! weight`. Zero-weight keys always sort after every positive-weight key,
//! then are uniformly shuffled among themselves so they don't always appear
//! in the same relative order (spec §9 "Zero-weight keys").

use bifrost_protocol::Key;
use rand::Rng;
use rand::rngs::ThreadRng;
use thiserror::Error;

#[derive(Debug, Error, PartialEq)]
pub enum SelectorError {
    #[error("no keys available for provider `{provider}` model `{model}`")]
    NoKeys { provider: String, model: String },
    #[error("key `{key_id}` has negative weight {weight}")]
    NegativeWeight { key_id: String, weight: f64 },
}

/// Re-orders `keys` in place, biased by weight, for the given
/// `provider`/`model` (used only for error context, not for filtering —
/// callers are expected to have already narrowed `keys` to eligible ones).
pub fn sort(keys: &mut [Key], provider: &str, model: &str) -> Result<(), SelectorError> {
    if keys.is_empty() {
        return Err(SelectorError::NoKeys {
            provider: provider.to_string(),
            model: model.to_string(),
        });
    }
    for key in keys.iter() {
        if key.weight < 0.0 {
            return Err(SelectorError::NegativeWeight {
                key_id: key.id.clone(),
                weight: key.weight,
            });
        }
    }

    let mut rng = rand::rng();
    let scores: Vec<f64> = keys.iter().map(|k| score(&mut rng, k.weight)).collect();

    let mut indices: Vec<usize> = (0..keys.len()).collect();
    indices.sort_by(|&a, &b| scores[b].partial_cmp(&scores[a]).unwrap_or(std::cmp::Ordering::Equal));

    let mut ordered: Vec<Key> = indices.into_iter().map(|i| keys[i].clone()).collect();

    let first_zero = ordered.iter().position(|k| k.weight == 0.0);
    if let Some(start) = first_zero {
        shuffle_tail(&mut rng, &mut ordered[start..]);
    }

    keys.clone_from_slice(&ordered);
    Ok(())
}

fn score(rng: &mut ThreadRng, weight: f64) -> f64 {
    if weight == 0.0 {
        return f64::NEG_INFINITY;
    }
    let u: f64 = loop {
        let draw = rng.random::<f64>();
        if draw > 0.0 {
            break draw;
        }
    };
    u.ln() / weight
}

fn shuffle_tail(rng: &mut ThreadRng, slice: &mut [Key]) {
    for i in (1..slice.len()).rev() {
        let j = rng.random_range(0..=i);
        slice.swap(i, j);
    }
}

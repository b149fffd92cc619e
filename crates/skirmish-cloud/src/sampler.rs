/// Items split by a sampling pass.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Sample<T> {
    pub selected: Vec<T>,
    pub skipped: Vec<T>,
}

/// Keep each item independently with probability `rate`. Every call draws
/// from its own freshly seeded generator.
pub fn sample<T>(items: Vec<T>, rate: f64) -> Sample<T> {
    sample_with(&mut fastrand::Rng::new(), items, rate)
}

fn sample_with<T>(rng: &mut fastrand::Rng, items: Vec<T>, rate: f64) -> Sample<T> {
    if rate >= 1.0 {
        return Sample {
            selected: items,
            skipped: Vec::new(),
        };
    }
    if rate <= 0.0 || rate.is_nan() {
        return Sample {
            selected: Vec::new(),
            skipped: items,
        };
    }

    let mut selected = Vec::new();
    let mut skipped = Vec::new();
    for item in items {
        if rng.f64() < rate {
            selected.push(item);
        } else {
            skipped.push(item);
        }
    }
    Sample { selected, skipped }
}

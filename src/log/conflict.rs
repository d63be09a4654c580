//! Ordering of concurrent entries.

use std::{cmp::Ordering, sync::Arc};

use super::{Entry, LogError};

/// Orders two entries of a log.
pub type SortFn<T> = Arc<dyn Fn(&Entry<T>, &Entry<T>) -> Ordering + Send + Sync>;

/// Last write wins: later clocks sort higher, equal clocks fall back to the clock id and
/// finally to the entry hash.
pub fn last_write_wins<T>(a: &Entry<T>, b: &Entry<T>) -> Ordering {
    a.clock()
        .cmp(b.clock())
        .then_with(|| a.hash().cmp(&b.hash()))
}

/// Sorts `entries` ascending with `sort`, failing if it cannot tell two distinct entries apart.
pub(crate) fn sort_entries<T>(sort: &SortFn<T>, entries: &mut [Entry<T>]) -> Result<(), LogError> {
    entries.sort_by(|a, b| sort(a, b));
    for pair in entries.windows(2) {
        if pair[0] != pair[1] && sort(&pair[0], &pair[1]) == Ordering::Equal {
            return Err(LogError::AmbiguousOrder(pair[0].hash(), pair[1].hash()));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{identities::Identities, log::Clock};

    async fn entries() -> anyhow::Result<Vec<Entry<String>>> {
        let identities = Identities::memory();
        let a = identities.create_identity("a", None).await?;
        let b = identities.create_identity("b", None).await?;
        let mut entries = Vec::new();
        for (identity, time, payload) in [(&a, 2, "a2"), (&b, 1, "b1"), (&a, 1, "a1"), (&b, 2, "b2")] {
            let clock = Clock::new(identity.public_key(), time);
            entries.push(Entry::create(identity, "log", payload.to_string(), clock, vec![], vec![])?);
        }
        Ok(entries)
    }

    #[tokio::test]
    async fn last_write_wins_orders_by_time_then_key() -> anyhow::Result<()> {
        let mut entries = entries().await?;
        let sort: SortFn<String> = Arc::new(last_write_wins::<String>);
        sort_entries(&sort, &mut entries)?;
        let times: Vec<_> = entries.iter().map(|e| e.clock().time).collect();
        assert_eq!(times, [1, 1, 2, 2]);
        for pair in entries.windows(2) {
            assert_eq!(last_write_wins(&pair[0], &pair[1]), Ordering::Less);
            if pair[0].clock().time == pair[1].clock().time {
                assert!(pair[0].key() < pair[1].key());
            }
        }
        Ok(())
    }

    #[tokio::test]
    async fn zero_comparison_is_an_error() -> anyhow::Result<()> {
        let mut entries = entries().await?;
        let sort: SortFn<String> = Arc::new(|a: &Entry<String>, b: &Entry<String>| {
            a.clock().time.cmp(&b.clock().time)
        });
        let err = sort_entries(&sort, &mut entries).unwrap_err();
        assert!(matches!(err, LogError::AmbiguousOrder(..)));
        Ok(())
    }
}

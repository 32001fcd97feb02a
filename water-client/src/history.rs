//! Newest-first ordering of a resident's readings.
//!
//! Readings are ranked by `date`, then by `created_at`. Entries whose keys are
//! fully equal keep their relative order when re-sorted, and a reading inserted
//! with [`insert_reading`] lands ahead of any entry it ties with.

use time::{Date, OffsetDateTime};

use crate::domain::{NewReading, Reading, ReadingId};

fn recency_key(reading: &Reading) -> (Date, OffsetDateTime) {
    (reading.date, reading.created_at)
}

/// Stable sort into newest-first order. Sorting a sorted history is a no-op.
pub fn sort_history(readings: &mut [Reading]) {
    readings.sort_by(|a, b| recency_key(b).cmp(&recency_key(a)));
}

/// Inserts into a newest-first history and returns the position taken.
pub fn insert_reading(history: &mut Vec<Reading>, reading: Reading) -> usize {
    let key = recency_key(&reading);
    let idx = history.partition_point(|r| recency_key(r) > key);
    history.insert(idx, reading);
    idx
}

/// Replaces date, meters and notes of a reading and moves it to its new rank.
pub fn replace_reading(history: &mut Vec<Reading>, id: &ReadingId, new: NewReading) -> Option<Reading> {
    let idx = history.iter().position(|r| &r.id == id)?;
    let mut reading = history.remove(idx);
    reading.replace(new);
    let updated = reading.clone();
    insert_reading(history, reading);
    Some(updated)
}

pub fn remove_reading(history: &mut Vec<Reading>, id: &ReadingId) -> Option<Reading> {
    let idx = history.iter().position(|r| &r.id == id)?;
    Some(history.remove(idx))
}

#[cfg(test)]
mod tests {
    use super::*;
    use time::macros::{date, datetime};

    fn reading(id: &str, date: Date, created_at: OffsetDateTime) -> Reading {
        Reading {
            id: ReadingId::new(id),
            date,
            meters: [(1, 1.0)].into_iter().collect(),
            created_at,
            notes: None,
        }
    }

    fn is_newest_first(readings: &[Reading]) -> bool {
        readings
            .windows(2)
            .all(|pair| recency_key(&pair[0]) >= recency_key(&pair[1]))
    }

    fn ids(readings: &[Reading]) -> Vec<&str> {
        readings.iter().map(|r| r.id.as_str()).collect()
    }

    #[test]
    fn sorts_by_date_descending() {
        let mut history = vec![
            reading("jan", date!(2024 - 01 - 01), datetime!(2024-01-01 00:00 UTC)),
            reading("mar", date!(2024 - 03 - 01), datetime!(2024-03-01 00:00 UTC)),
            reading("feb", date!(2024 - 02 - 01), datetime!(2024-02-01 00:00 UTC)),
        ];

        sort_history(&mut history);

        assert_eq!(ids(&history), vec!["mar", "feb", "jan"]);
        assert!(is_newest_first(&history));
    }

    #[test]
    fn same_date_ties_go_to_later_creation() {
        let mut history = vec![
            reading("first", date!(2024 - 03 - 01), datetime!(2024-03-01 08:00 UTC)),
            reading("second", date!(2024 - 03 - 01), datetime!(2024-03-01 09:00 UTC)),
            reading("older", date!(2024 - 02 - 01), datetime!(2024-03-01 10:00 UTC)),
        ];

        sort_history(&mut history);

        assert_eq!(ids(&history), vec!["second", "first", "older"]);
    }

    #[test]
    fn resorting_keeps_fully_equal_entries_in_place() {
        let created = datetime!(2024-03-01 08:00 UTC);
        let mut history = vec![
            reading("x", date!(2024 - 03 - 01), created),
            reading("y", date!(2024 - 03 - 01), created),
        ];

        sort_history(&mut history);
        let once = ids(&history).join(",");
        sort_history(&mut history);

        assert_eq!(ids(&history).join(","), once);
        assert_eq!(once, "x,y");
    }

    #[test]
    fn inserted_reading_wins_ties() {
        let created = datetime!(2024-03-01 08:00 UTC);
        let mut history = vec![
            reading("existing", date!(2024 - 03 - 01), created),
            reading("older", date!(2024 - 02 - 01), created),
        ];

        let idx = insert_reading(&mut history, reading("added", date!(2024 - 03 - 01), created));

        assert_eq!(idx, 0);
        assert_eq!(ids(&history), vec!["added", "existing", "older"]);
    }

    #[test]
    fn out_of_order_insert_lands_in_rank() {
        let mut history = vec![
            reading("mar", date!(2024 - 03 - 01), datetime!(2024-03-01 00:00 UTC)),
            reading("jan", date!(2024 - 01 - 01), datetime!(2024-01-01 00:00 UTC)),
        ];

        let idx = insert_reading(
            &mut history,
            reading("feb", date!(2024 - 02 - 01), datetime!(2024-04-01 00:00 UTC)),
        );

        assert_eq!(idx, 1);
        assert_eq!(ids(&history), vec!["mar", "feb", "jan"]);
    }

    #[test]
    fn replace_moves_reading_and_keeps_identity() {
        let mut history = vec![
            reading("mar", date!(2024 - 03 - 01), datetime!(2024-03-01 00:00 UTC)),
            reading("jan", date!(2024 - 01 - 01), datetime!(2024-01-01 00:00 UTC)),
        ];

        let updated = replace_reading(
            &mut history,
            &ReadingId::new("jan"),
            NewReading {
                date: date!(2024 - 04 - 01),
                meters: [(1, 9.0)].into_iter().collect(),
                notes: None,
            },
        )
        .unwrap();

        assert_eq!(updated.created_at, datetime!(2024-01-01 00:00 UTC));
        assert_eq!(ids(&history), vec!["jan", "mar"]);
        assert!(replace_reading(
            &mut history,
            &ReadingId::new("missing"),
            NewReading {
                date: date!(2024 - 04 - 01),
                meters: Default::default(),
                notes: None,
            }
        )
        .is_none());
    }

    #[test]
    fn remove_returns_the_reading() {
        let mut history = vec![reading("a", date!(2024 - 01 - 01), datetime!(2024-01-01 00:00 UTC))];

        assert!(remove_reading(&mut history, &ReadingId::new("b")).is_none());
        assert_eq!(remove_reading(&mut history, &ReadingId::new("a")).map(|r| r.id), Some(ReadingId::new("a")));
        assert!(history.is_empty());
    }
}

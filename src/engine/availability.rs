use crate::model::*;

/// Free sub-ranges of `window` once `booked` is taken out.
///
/// `booked` may be in any order and may stick out of the window.
pub fn free_windows(window: &Stay, booked: &[Stay]) -> Vec<Stay> {
    let mut taken: Vec<Stay> = booked
        .iter()
        .filter(|s| s.overlaps(window))
        .map(|s| Stay::new(s.start.max(window.start), s.end.min(window.end)))
        .collect();
    taken.sort_by_key(|s| s.start);
    let taken = merge_overlapping(&taken);
    subtract_intervals(&[*window], &taken)
}

/// Merge sorted overlapping/adjacent stays into disjoint stays.
pub fn merge_overlapping(sorted: &[Stay]) -> Vec<Stay> {
    let mut merged: Vec<Stay> = Vec::new();
    for &stay in sorted {
        if let Some(last) = merged.last_mut()
            && stay.start <= last.end
        {
            last.end = last.end.max(stay.end);
            continue;
        }
        merged.push(stay);
    }
    merged
}

/// Both inputs sorted by start and disjoint.
pub fn subtract_intervals(base: &[Stay], to_remove: &[Stay]) -> Vec<Stay> {
    let mut result = Vec::new();
    let mut ri = 0;

    for &b in base {
        let mut current_start = b.start;
        let current_end = b.end;

        while ri < to_remove.len() && to_remove[ri].end <= current_start {
            ri += 1;
        }

        let mut j = ri;
        while j < to_remove.len() && to_remove[j].start < current_end {
            let r = &to_remove[j];
            if r.start > current_start {
                result.push(Stay::new(current_start, r.start));
            }
            current_start = current_start.max(r.end);
            j += 1;
        }

        if current_start < current_end {
            result.push(Stay::new(current_start, current_end));
        }
    }

    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::date;

    fn s(start: &str, end: &str) -> Stay {
        Stay::new(date(start), date(end))
    }

    #[test]
    fn subtract_no_overlap() {
        let base = vec![s("2024-01-01", "2024-01-03"), s("2024-01-05", "2024-01-07")];
        let result = subtract_intervals(&base, &[s("2024-01-03", "2024-01-05")]);
        assert_eq!(result, base);
    }

    #[test]
    fn subtract_full_overlap() {
        let result = subtract_intervals(&[s("2024-01-02", "2024-01-04")], &[s("2024-01-01", "2024-01-05")]);
        assert!(result.is_empty());
    }

    #[test]
    fn subtract_middle_punch() {
        let result = subtract_intervals(&[s("2024-01-01", "2024-01-10")], &[s("2024-01-04", "2024-01-06")]);
        assert_eq!(result, vec![s("2024-01-01", "2024-01-04"), s("2024-01-06", "2024-01-10")]);
    }

    #[test]
    fn subtract_multiple_punches() {
        let result = subtract_intervals(
            &[s("2024-01-01", "2024-01-31")],
            &[s("2024-01-05", "2024-01-07"), s("2024-01-10", "2024-01-12"), s("2024-01-30", "2024-02-02")],
        );
        assert_eq!(
            result,
            vec![
                s("2024-01-01", "2024-01-05"),
                s("2024-01-07", "2024-01-10"),
                s("2024-01-12", "2024-01-30"),
            ]
        );
    }

    #[test]
    fn merge_adjacent_stays() {
        let merged = merge_overlapping(&[
            s("2024-01-01", "2024-01-05"),
            s("2024-01-05", "2024-01-08"),
            s("2024-01-10", "2024-01-11"),
        ]);
        assert_eq!(merged, vec![s("2024-01-01", "2024-01-08"), s("2024-01-10", "2024-01-11")]);
    }

    #[test]
    fn free_windows_clamps_unsorted_bookings() {
        let window = s("2024-03-01", "2024-03-31");
        let booked = [
            s("2024-03-20", "2024-04-05"),
            s("2024-02-25", "2024-03-03"),
            s("2024-03-10", "2024-03-12"),
        ];
        assert_eq!(
            free_windows(&window, &booked),
            vec![s("2024-03-03", "2024-03-10"), s("2024-03-12", "2024-03-20")]
        );
    }

    #[test]
    fn free_windows_empty_room_is_whole_window() {
        let window = s("2024-03-01", "2024-03-02");
        assert_eq!(free_windows(&window, &[]), vec![window]);
    }
}

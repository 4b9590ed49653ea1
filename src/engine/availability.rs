use crate::model::*;

// ── Free-window Algorithm ─────────────────────────────────────────

/// Free windows of an area inside `query`.
///
/// Starts from the whole query and subtracts every occupying record
/// (PENDING, CONFIRMED, BLOCKED) clamped to the window. History never
/// shows up as busy.
pub fn free_windows(area: &AreaState, query: &Span) -> Vec<Span> {
    let mut busy: Vec<Span> = area
        .occupying(query)
        .map(|r| Span::new(r.span.start.max(query.start), r.span.end.min(query.end)))
        .collect();
    if busy.is_empty() {
        return vec![*query];
    }
    busy.sort_by_key(|s| s.start);
    let busy = merge_overlapping(&busy);
    subtract_intervals(&[*query], &busy)
}

/// Merge sorted overlapping/adjacent intervals into disjoint intervals.
pub fn merge_overlapping(sorted: &[Span]) -> Vec<Span> {
    let mut merged: Vec<Span> = Vec::new();
    for &span in sorted {
        if let Some(last) = merged.last_mut()
            && span.start <= last.end {
                last.end = last.end.max(span.end);
                continue;
            }
        merged.push(span);
    }
    merged
}

pub fn subtract_intervals(base: &[Span], to_remove: &[Span]) -> Vec<Span> {
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
                result.push(Span::new(current_start, r.start));
            }
            current_start = current_start.max(r.end);
            j += 1;
        }

        if current_start < current_end {
            result.push(Span::new(current_start, current_end));
        }
    }

    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal::Decimal;
    use ulid::Ulid;

    const H: Ms = 3_600_000;
    const M: Ms = 60_000;

    fn make_area(records: Vec<(Ms, Ms, Status)>) -> AreaState {
        let mut st = AreaState::new(Area {
            id: Ulid::new(),
            name: "Barbecue".into(),
            capacity: 20,
            price_per_hour: Decimal::ZERO,
            min_booking_hours: 1,
            max_booking_hours: 4,
            monthly_limit_per_unit: 2,
            auto_approve: false,
            active: true,
            created_at: 0,
        });
        for (start, end, status) in records {
            let occupant = if status == Status::Blocked {
                Occupant::Block
            } else {
                Occupant::Owner(Ulid::new())
            };
            st.insert_reservation(Reservation {
                id: Ulid::new(),
                area_id: st.area.id,
                occupant,
                span: Span::new(start, end),
                status,
                reason: None,
                note: None,
                created_at: 0,
            });
        }
        st
    }

    // ── subtract_intervals ────────────────────────────────

    #[test]
    fn subtract_no_overlap() {
        let base = vec![Span::new(100, 200), Span::new(300, 400)];
        let remove = vec![Span::new(200, 300)];
        assert_eq!(subtract_intervals(&base, &remove), base);
    }

    #[test]
    fn subtract_full_overlap() {
        let base = vec![Span::new(100, 200)];
        let remove = vec![Span::new(50, 250)];
        assert!(subtract_intervals(&base, &remove).is_empty());
    }

    #[test]
    fn subtract_partial_edges() {
        let base = vec![Span::new(100, 200)];
        assert_eq!(
            subtract_intervals(&base, &[Span::new(50, 150)]),
            vec![Span::new(150, 200)]
        );
        assert_eq!(
            subtract_intervals(&base, &[Span::new(150, 250)]),
            vec![Span::new(100, 150)]
        );
    }

    #[test]
    fn subtract_multiple_punches() {
        let base = vec![Span::new(0, 1000)];
        let remove = vec![
            Span::new(100, 200),
            Span::new(400, 500),
            Span::new(800, 900),
        ];
        assert_eq!(
            subtract_intervals(&base, &remove),
            vec![
                Span::new(0, 100),
                Span::new(200, 400),
                Span::new(500, 800),
                Span::new(900, 1000),
            ]
        );
    }

    // ── merge_overlapping ────────────────────────────────

    #[test]
    fn merge_overlapping_basic() {
        let spans = vec![
            Span::new(100, 300),
            Span::new(200, 400),
            Span::new(500, 600),
        ];
        assert_eq!(
            merge_overlapping(&spans),
            vec![Span::new(100, 400), Span::new(500, 600)]
        );
    }

    #[test]
    fn merge_overlapping_adjacent() {
        let spans = vec![Span::new(100, 200), Span::new(200, 300)];
        assert_eq!(merge_overlapping(&spans), vec![Span::new(100, 300)]);
    }

    // ── free_windows ──────────────────────────────────────

    #[test]
    fn empty_day_is_one_window() {
        let st = make_area(vec![]);
        let day = Span::new(0, 24 * H);
        assert_eq!(free_windows(&st, &day), vec![day]);
    }

    #[test]
    fn bookings_punch_holes() {
        let st = make_area(vec![
            (10 * H, 10 * H + 30 * M, Status::Confirmed),
            (14 * H, 16 * H, Status::Pending),
        ]);
        let free = free_windows(&st, &Span::new(0, 24 * H));
        assert_eq!(
            free,
            vec![
                Span::new(0, 10 * H),
                Span::new(10 * H + 30 * M, 14 * H),
                Span::new(16 * H, 24 * H),
            ]
        );
    }

    #[test]
    fn history_is_free() {
        let st = make_area(vec![
            (10 * H, 12 * H, Status::Cancelled),
            (12 * H, 14 * H, Status::Rejected),
        ]);
        let day = Span::new(0, 24 * H);
        assert_eq!(free_windows(&st, &day), vec![day]);
    }

    #[test]
    fn block_covers_whole_day() {
        let st = make_area(vec![(0, 24 * H, Status::Blocked)]);
        assert!(free_windows(&st, &Span::new(0, 24 * H)).is_empty());
    }

    #[test]
    fn records_are_clamped_to_query() {
        let st = make_area(vec![(22 * H, 26 * H, Status::Confirmed)]);
        let free = free_windows(&st, &Span::new(24 * H, 48 * H));
        assert_eq!(free, vec![Span::new(26 * H, 48 * H)]);
    }
}

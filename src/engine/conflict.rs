use ulid::Ulid;

use crate::model::*;

use super::EngineError;

pub(crate) fn now_ms() -> Ms {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as Ms)
        .unwrap_or(0)
}

/// Well-formedness plus the hard limits on stored intervals.
pub(crate) fn validate_span(span: &Span) -> Result<(), EngineError> {
    use crate::limits::*;
    span.validate()?;
    if span.start < MIN_VALID_TIMESTAMP_MS || span.end > MAX_VALID_TIMESTAMP_MS {
        return Err(EngineError::LimitExceeded("timestamp out of range"));
    }
    if span.duration_ms() > MAX_SPAN_DURATION_MS {
        return Err(EngineError::LimitExceeded("span too wide"));
    }
    Ok(())
}

/// Well-formedness plus the hard limits on query windows. Bounds are checked
/// before the width, so the width can't overflow.
pub(crate) fn validate_window(window: &Span) -> Result<(), EngineError> {
    use crate::limits::*;
    window.validate()?;
    if window.start < MIN_VALID_TIMESTAMP_MS || window.end > MAX_VALID_TIMESTAMP_MS {
        return Err(EngineError::LimitExceeded("timestamp out of range"));
    }
    if window.duration_ms() > MAX_QUERY_WINDOW_MS {
        return Err(EngineError::LimitExceeded("query window too wide"));
    }
    Ok(())
}

/// First active booking of `asset_id` in `existing` that overlaps `candidate`.
///
/// Bookings of other assets, rejected/cancelled bookings and the booking with id
/// `exclude` (the one being edited) are ignored. Intervals are half-open, so a
/// booking ending exactly when the candidate starts is not a conflict.
///
/// Fails instead of answering if the candidate or any examined booking is malformed.
pub fn find_conflict<'a>(
    asset_id: Ulid,
    candidate: &Span,
    existing: &'a [Booking],
    exclude: Option<Ulid>,
) -> Result<Option<&'a Booking>, EngineError> {
    candidate.validate()?;
    for booking in existing {
        if booking.asset_id != asset_id
            || !booking.status.is_active()
            || exclude == Some(booking.id)
        {
            continue;
        }
        booking.span.validate()?;
        if booking.span.overlaps(candidate) {
            return Ok(Some(booking));
        }
    }
    Ok(None)
}

pub fn has_conflict(
    asset_id: Ulid,
    candidate: &Span,
    existing: &[Booking],
    exclude: Option<Ulid>,
) -> Result<bool, EngineError> {
    Ok(find_conflict(asset_id, candidate, existing, exclude)?.is_some())
}

pub(crate) fn check_no_conflict(
    asset: &AssetState,
    span: &Span,
    exclude: Option<Ulid>,
) -> Result<(), EngineError> {
    if let Some(b) = find_conflict(asset.id, span, &asset.bookings, exclude)? {
        return Err(EngineError::Conflict { booking_id: b.id, span: b.span });
    }
    for downtime in &asset.downtimes {
        if downtime.effective_span().overlaps(span) {
            return Err(EngineError::AssetDown(downtime.id));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    const H: Ms = 3_600_000;

    fn booking(asset_id: Ulid, start: Ms, end: Ms) -> Booking {
        Booking {
            id: Ulid::new(),
            asset_id,
            user_id: Ulid::new(),
            span: Span { start, end },
            purpose: None,
            status: BookingStatus::Approved,
            decided_by: None,
            decided_at: None,
            rejection_reason: None,
            created_at: 0,
        }
    }

    #[test]
    fn touching_intervals_never_conflict() {
        let asset = Ulid::new();
        let existing = vec![booking(asset, 10 * H, 12 * H)];
        // ends exactly when the existing one starts
        assert!(!has_conflict(asset, &Span::new(8 * H, 10 * H), &existing, None).unwrap());
        // starts exactly when the existing one ends
        assert!(!has_conflict(asset, &Span::new(12 * H, 14 * H), &existing, None).unwrap());
    }

    #[test]
    fn disjoint_intervals_never_conflict() {
        let asset = Ulid::new();
        let existing = vec![booking(asset, 10 * H, 12 * H), booking(asset, 20 * H, 22 * H)];
        assert!(!has_conflict(asset, &Span::new(13 * H, 19 * H), &existing, None).unwrap());
    }

    #[test]
    fn overlapping_intervals_conflict() {
        let asset = Ulid::new();
        let existing = vec![booking(asset, 10 * H, 12 * H)];
        for (s, e) in [
            (9 * H, 11 * H),  // straddles start
            (11 * H, 13 * H), // straddles end
            (10 * H, 12 * H), // identical
            (9 * H, 13 * H),  // contains
            (10 * H + 1, 12 * H - 1), // contained
            (12 * H - 1, 13 * H), // 1ms overlap
        ] {
            assert!(
                has_conflict(asset, &Span::new(s, e), &existing, None).unwrap(),
                "[{s}, {e}) should conflict"
            );
        }
    }

    #[test]
    fn excluded_booking_does_not_self_conflict() {
        let asset = Ulid::new();
        let existing = vec![booking(asset, 10 * H, 12 * H)];
        let own = existing[0].id;
        assert!(!has_conflict(asset, &Span::new(10 * H, 12 * H), &existing, Some(own)).unwrap());
        // excluding some other id changes nothing
        assert!(has_conflict(asset, &Span::new(10 * H, 12 * H), &existing, Some(Ulid::new())).unwrap());
    }

    #[test]
    fn other_assets_are_ignored() {
        let asset = Ulid::new();
        let existing = vec![booking(Ulid::new(), 10 * H, 12 * H)];
        assert!(!has_conflict(asset, &Span::new(10 * H, 12 * H), &existing, None).unwrap());
    }

    #[test]
    fn rejected_and_cancelled_are_ignored() {
        let asset = Ulid::new();
        let mut rejected = booking(asset, 10 * H, 12 * H);
        rejected.status = BookingStatus::Rejected;
        let mut cancelled = booking(asset, 10 * H, 12 * H);
        cancelled.status = BookingStatus::Cancelled;
        let mut pending = booking(asset, 11 * H, 13 * H);
        pending.status = BookingStatus::Pending;

        let existing = vec![rejected, cancelled];
        assert!(!has_conflict(asset, &Span::new(10 * H, 12 * H), &existing, None).unwrap());

        let existing = vec![pending];
        assert!(has_conflict(asset, &Span::new(10 * H, 12 * H), &existing, None).unwrap());
    }

    #[test]
    fn find_conflict_reports_the_booking() {
        let asset = Ulid::new();
        let existing = vec![booking(asset, 0, H), booking(asset, 2 * H, 3 * H)];
        let hit = find_conflict(asset, &Span::new(2 * H + 5, 4 * H), &existing, None)
            .unwrap()
            .unwrap();
        assert_eq!(hit.id, existing[1].id);
    }

    #[test]
    fn malformed_candidate_fails_fast() {
        let asset = Ulid::new();
        let result = has_conflict(asset, &Span { start: 5 * H, end: H }, &[], None);
        assert!(matches!(result, Err(EngineError::InvalidSpan(_))));
    }

    #[test]
    fn malformed_existing_fails_fast() {
        let asset = Ulid::new();
        let existing = vec![booking(asset, 5 * H, H)];
        let result = has_conflict(asset, &Span::new(0, 10 * H), &existing, None);
        assert!(matches!(result, Err(EngineError::InvalidSpan(_))));
    }

    #[test]
    fn validate_span_limits() {
        use crate::limits::*;
        assert!(validate_span(&Span::new(0, H)).is_ok());
        assert!(matches!(
            validate_span(&Span::new(-10, H)),
            Err(EngineError::LimitExceeded("timestamp out of range"))
        ));
        assert!(matches!(
            validate_span(&Span::new(0, MAX_SPAN_DURATION_MS + 1)),
            Err(EngineError::LimitExceeded("span too wide"))
        ));
        assert!(matches!(
            validate_span(&Span { start: H, end: 0 }),
            Err(EngineError::InvalidSpan(_))
        ));
    }

    #[test]
    fn downtime_blocks_booking() {
        let mut asset = AssetState::new(Ulid::new(), "Truck".into(), None, AssetCategory::Truck);
        let downtime_id = Ulid::new();
        asset.insert_downtime(Downtime {
            id: downtime_id,
            asset_id: asset.id,
            reason: DowntimeReason::Inspection,
            description: String::new(),
            start: 10 * H,
            end: Some(12 * H),
            cost_cents: None,
        });
        assert!(matches!(
            check_no_conflict(&asset, &Span::new(11 * H, 13 * H), None),
            Err(EngineError::AssetDown(id)) if id == downtime_id
        ));
        assert!(check_no_conflict(&asset, &Span::new(12 * H, 13 * H), None).is_ok());
    }
}

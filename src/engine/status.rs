use crate::limits::BOOKED_SOON_WINDOW_MS;
use crate::model::*;

use super::EngineError;

// ── Status classification ─────────────────────────────────────────

/// Classify an asset from the spans of its active bookings.
///
/// BookedNow: some booking has `start <= now <= end`. Short-circuits, nothing
/// downgrades it.
/// BookedSoon: some booking starts in `(now, now + 3 days]`.
/// Available: neither.
///
/// Callers pass only bookings that occupy the asset (see `AssetState::active_spans`).
pub fn classify<'a>(
    now: Ms,
    spans: impl IntoIterator<Item = &'a Span>,
) -> Result<AssetStatus, EngineError> {
    let soon_until = now.saturating_add(BOOKED_SOON_WINDOW_MS);
    let mut status = AssetStatus::Available;

    for span in spans {
        span.validate()?;
        if span.start <= now && now <= span.end {
            return Ok(AssetStatus::BookedNow);
        }
        if span.start > now && span.start <= soon_until {
            status = AssetStatus::BookedSoon;
        }
    }

    Ok(status)
}

/// Status of a single asset at `now`.
pub(crate) fn asset_status(asset: &AssetState, now: Ms) -> Result<AssetStatus, EngineError> {
    classify(now, asset.active_spans())
}

pub(crate) fn in_downtime(asset: &AssetState, now: Ms) -> bool {
    asset.downtimes.iter().any(|d| d.is_active_at(now))
}

#[cfg(test)]
mod tests {
    use super::*;

    const H: Ms = 3_600_000;
    const D: Ms = 24 * H;
    /// 2024-06-10T10:00:00Z
    const NOW: Ms = 1_718_013_600_000;
    /// 2024-06-10T00:00:00Z
    const JUNE_10: Ms = 1_717_977_600_000;

    fn at(day_offset: Ms, hour: Ms) -> Ms {
        JUNE_10 + day_offset * D + hour * H
    }

    #[test]
    fn booking_in_progress_is_booked_now() {
        let spans = [Span::new(at(0, 8), at(0, 12))];
        assert_eq!(classify(NOW, &spans).unwrap(), AssetStatus::BookedNow);
    }

    #[test]
    fn booking_within_three_days_is_booked_soon() {
        let spans = [Span::new(at(2, 9), at(2, 11))];
        assert_eq!(classify(NOW, &spans).unwrap(), AssetStatus::BookedSoon);
    }

    #[test]
    fn booking_beyond_three_days_is_available() {
        let spans = [Span::new(at(10, 9), at(10, 11))];
        assert_eq!(classify(NOW, &spans).unwrap(), AssetStatus::Available);
    }

    #[test]
    fn no_bookings_is_available() {
        assert_eq!(classify(NOW, &[]).unwrap(), AssetStatus::Available);
    }

    #[test]
    fn past_booking_is_available() {
        let spans = [Span::new(at(-2, 8), at(-2, 12))];
        assert_eq!(classify(NOW, &spans).unwrap(), AssetStatus::Available);
    }

    #[test]
    fn booked_now_wins_regardless_of_order() {
        let now_span = Span::new(at(0, 8), at(0, 12));
        let soon_span = Span::new(at(1, 9), at(1, 11));
        assert_eq!(classify(NOW, &[soon_span, now_span]).unwrap(), AssetStatus::BookedNow);
        assert_eq!(classify(NOW, &[now_span, soon_span]).unwrap(), AssetStatus::BookedNow);
    }

    #[test]
    fn far_booking_does_not_downgrade_soon() {
        let soon_span = Span::new(at(1, 9), at(1, 11));
        let far_span = Span::new(at(20, 9), at(20, 11));
        assert_eq!(classify(NOW, &[soon_span, far_span]).unwrap(), AssetStatus::BookedSoon);
    }

    #[test]
    fn boundaries() {
        // now == start and now == end both count as in progress
        assert_eq!(classify(NOW, &[Span::new(NOW, NOW + H)]).unwrap(), AssetStatus::BookedNow);
        assert_eq!(classify(NOW, &[Span::new(NOW - H, NOW)]).unwrap(), AssetStatus::BookedNow);
        // exactly three days ahead is still soon, one ms later is not
        let edge = NOW + BOOKED_SOON_WINDOW_MS;
        assert_eq!(classify(NOW, &[Span::new(edge, edge + H)]).unwrap(), AssetStatus::BookedSoon);
        assert_eq!(
            classify(NOW, &[Span::new(edge + 1, edge + H)]).unwrap(),
            AssetStatus::Available
        );
    }

    #[test]
    fn tomorrow_is_just_soon() {
        let spans = [Span::new(at(1, 0), at(1, 1))];
        assert_eq!(classify(NOW, &spans).unwrap(), AssetStatus::BookedSoon);
    }

    #[test]
    fn classify_is_idempotent() {
        let spans = vec![Span::new(at(1, 9), at(1, 11)), Span::new(at(5, 9), at(5, 11))];
        let first = classify(NOW, &spans).unwrap();
        let second = classify(NOW, &spans).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn malformed_span_is_an_error_not_available() {
        let spans = [Span { start: at(3, 0), end: at(1, 0) }];
        assert!(matches!(classify(NOW, &spans), Err(EngineError::InvalidSpan(_))));
    }

    #[test]
    fn asset_status_ignores_cancelled() {
        let mut asset = AssetState::new(ulid::Ulid::new(), "Sedan".into(), None, AssetCategory::Sedan);
        asset.insert_booking(Booking {
            id: ulid::Ulid::new(),
            asset_id: asset.id,
            user_id: ulid::Ulid::new(),
            span: Span::new(at(0, 8), at(0, 12)),
            purpose: None,
            status: BookingStatus::Cancelled,
            decided_by: None,
            decided_at: None,
            rejection_reason: None,
            created_at: 0,
        });
        assert_eq!(asset_status(&asset, NOW).unwrap(), AssetStatus::Available);
    }
}

use std::sync::{Mutex, MutexGuard, PoisonError};

use serde::{Deserialize, Serialize};
use time::macros::format_description;
use time::Date;

/// Lower bound of the satisfaction scale.
pub const RATING_MIN: f64 = 1.0;
/// Upper bound of the satisfaction scale.
pub const RATING_MAX: f64 = 10.0;
/// Smoothing window for the exponential moving average.
pub const DEFAULT_EMA_SPAN: usize = 10;
/// Below this sample count the external forecaster is never consulted.
pub const EXTERNAL_MIN_SAMPLES: usize = 30;
/// Above this sample count a successful external forecast supersedes the EMA.
pub const EXTERNAL_SOLO_SAMPLES: usize = 60;
/// External share of the blended prediction between the two thresholds.
pub const BLEND_EXTERNAL_WEIGHT: f64 = 0.3;

time::serde::format_description!(iso_date, Date, "[year]-[month]-[day]");

#[derive(Debug, Clone, thiserror::Error, Eq, PartialEq)]
pub enum MoodError {
    #[error("invalid input: {0}")]
    InvalidInput(String),
    #[error("format error: {0}")]
    Format(String),
}

/// Failure modes of the out-of-process forecaster. These are consumed by
/// [`compute_forecast`] and never reach the caller as errors.
#[derive(Debug, Clone, thiserror::Error, Eq, PartialEq)]
pub enum ExternalError {
    #[error("external forecaster unavailable: {0}")]
    Unavailable(String),
    #[error("external forecaster failed: {0}")]
    Failed(String),
}

/// One logged satisfaction rating. The store guarantees at most one record
/// per calendar date and ratings clamped to the valid scale.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct RatingRecord {
    #[serde(with = "iso_date")]
    pub date: Date,
    pub rating: f64,
}

impl RatingRecord {
    /// Builds a record from a raw rating, clamping it into the valid scale.
    ///
    /// # Errors
    /// Returns [`MoodError::InvalidInput`] when the rating is not finite.
    pub fn new(date: Date, rating: f64) -> Result<Self, MoodError> {
        if !rating.is_finite() {
            return Err(MoodError::InvalidInput(
                "rating must be a finite number".to_string(),
            ));
        }
        Ok(Self {
            date,
            rating: clamp_rating(rating),
        })
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "kebab-case")]
pub enum ForecastSource {
    Ema,
    Blend,
    External,
    EmaFallback,
}

impl ForecastSource {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Ema => "ema",
            Self::Blend => "blend",
            Self::External => "external",
            Self::EmaFallback => "ema-fallback",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "ema" => Some(Self::Ema),
            "blend" => Some(Self::Blend),
            "external" => Some(Self::External),
            "ema-fallback" => Some(Self::EmaFallback),
            _ => None,
        }
    }
}

/// Outcome of one forecast request. `predicted` is always within the valid
/// rating scale; `source` names the path that produced it.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ForecastResult {
    pub sample_count: usize,
    pub ema: Option<f64>,
    pub external: Option<f64>,
    pub predicted: f64,
    pub source: ForecastSource,
}

/// Contract for the out-of-process statistical forecaster. Implementations
/// must map every failure mode to `Err` rather than panicking.
pub trait ExternalForecaster {
    /// Produces a next-period point prediction from the full rating history.
    ///
    /// # Errors
    /// Returns [`ExternalError`] when the capability is unavailable or the
    /// invocation does not yield a finite numeric prediction.
    fn forecast(&self, history: &[RatingRecord]) -> Result<f64, ExternalError>;
}

/// Constrains a value to the rating scale. Non-finite input collapses to
/// the minimum instead of propagating NaN.
#[must_use]
pub fn clamp_rating(value: f64) -> f64 {
    if !value.is_finite() {
        return RATING_MIN;
    }
    value.min(RATING_MAX).max(RATING_MIN)
}

/// Exponential moving average over an ordered sequence of ratings.
///
/// Seeds with the first value, then applies
/// `ema = alpha * value + (1 - alpha) * ema` with `alpha = 2 / (span + 1)`.
/// Empty input yields `None`; the final value is clamped to the scale.
#[must_use]
#[allow(clippy::cast_precision_loss)]
pub fn ema_of(values: &[f64], span: usize) -> Option<f64> {
    let mut ema = *values.first()?;
    let alpha = 2.0 / (span.max(1) as f64 + 1.0);
    for value in &values[1..] {
        ema = alpha * value + (1.0 - alpha) * ema;
    }
    Some(clamp_rating(ema))
}

/// Next-day forecast policy.
///
/// `external` must be `Some` only when the readiness gate reported `ready`
/// at call time; passing `None` forces the EMA-only paths. The result is
/// always a valid in-scale prediction, even for an empty history, where the
/// clamp collapses the missing EMA to the minimum.
#[must_use]
pub fn compute_forecast(
    history: &[RatingRecord],
    external: Option<&dyn ExternalForecaster>,
) -> ForecastResult {
    let ratings: Vec<f64> = history.iter().map(|record| record.rating).collect();
    let ema = ema_of(&ratings, DEFAULT_EMA_SPAN);
    let ema_predicted = clamp_rating(ema.unwrap_or(f64::NAN));
    let sample_count = history.len();

    if sample_count < EXTERNAL_MIN_SAMPLES {
        return ForecastResult {
            sample_count,
            ema,
            external: None,
            predicted: ema_predicted,
            source: ForecastSource::Ema,
        };
    }

    let external_value = external.and_then(|forecaster| forecaster.forecast(history).ok());
    let Some(raw) = external_value else {
        return ForecastResult {
            sample_count,
            ema,
            external: None,
            predicted: ema_predicted,
            source: ForecastSource::EmaFallback,
        };
    };

    let clamped_external = clamp_rating(raw);
    if sample_count > EXTERNAL_SOLO_SAMPLES {
        return ForecastResult {
            sample_count,
            ema,
            external: Some(clamped_external),
            predicted: clamped_external,
            source: ForecastSource::External,
        };
    }

    let blended = clamp_rating(
        BLEND_EXTERNAL_WEIGHT * clamped_external + (1.0 - BLEND_EXTERNAL_WEIGHT) * ema_predicted,
    );
    ForecastResult {
        sample_count,
        ema,
        external: Some(clamped_external),
        predicted: blended,
        source: ForecastSource::Blend,
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Default)]
#[serde(rename_all = "snake_case")]
pub enum ReadinessState {
    #[default]
    NotReady,
    Provisioning,
    Ready,
}

impl ReadinessState {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::NotReady => "not_ready",
            Self::Provisioning => "provisioning",
            Self::Ready => "ready",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "not_ready" => Some(Self::NotReady),
            "provisioning" => Some(Self::Provisioning),
            "ready" => Some(Self::Ready),
            _ => None,
        }
    }
}

/// Single-slot readiness gate for the external capability.
///
/// At most one provisioning attempt may be in flight: `try_begin` hands the
/// slot to exactly one caller, `complete` either reaches the terminal
/// `ready` state or returns to `not_ready` for a later explicit retry.
#[derive(Debug, Default)]
pub struct ReadinessGate {
    state: Mutex<ReadinessState>,
}

impl ReadinessGate {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_state(state: ReadinessState) -> Self {
        Self {
            state: Mutex::new(state),
        }
    }

    /// Non-blocking snapshot of the current state.
    #[must_use]
    pub fn status(&self) -> ReadinessState {
        *self.lock()
    }

    /// Claims the provisioning slot. Returns `true` for the single caller
    /// that moved `not_ready` to `provisioning`; every other caller sees
    /// `false` and should report [`ReadinessGate::status`] instead.
    pub fn try_begin(&self) -> bool {
        let mut guard = self.lock();
        if *guard == ReadinessState::NotReady {
            *guard = ReadinessState::Provisioning;
            true
        } else {
            false
        }
    }

    /// Records the outcome of the in-flight attempt. `ready` is terminal.
    pub fn complete(&self, success: bool) {
        let mut guard = self.lock();
        if *guard == ReadinessState::Ready {
            return;
        }
        *guard = if success {
            ReadinessState::Ready
        } else {
            ReadinessState::NotReady
        };
    }

    fn lock(&self) -> MutexGuard<'_, ReadinessState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Parses a strict `YYYY-MM-DD` calendar date.
///
/// # Errors
/// Returns [`MoodError::InvalidInput`] when the input does not match the
/// pattern exactly or names an impossible date.
pub fn parse_iso_date(value: &str) -> Result<Date, MoodError> {
    Date::parse(value, format_description!("[year]-[month]-[day]"))
        .map_err(|err| MoodError::InvalidInput(format!("date must be YYYY-MM-DD: {err}")))
}

/// Formats a date as `YYYY-MM-DD`.
///
/// # Errors
/// Returns [`MoodError::Format`] when formatting fails.
pub fn format_iso_date(date: Date) -> Result<String, MoodError> {
    date.format(format_description!("[year]-[month]-[day]"))
        .map_err(|err| MoodError::Format(format!("failed to format date: {err}")))
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use proptest::prelude::*;
    use serde_json::json;
    use time::macros::date;

    use super::*;

    fn must_ok<T, E: std::fmt::Display>(result: Result<T, E>) -> T {
        match result {
            Ok(value) => value,
            Err(err) => panic!("expected Ok(..), got error: {err}"),
        }
    }

    fn must_some<T>(value: Option<T>) -> T {
        match value {
            Some(inner) => inner,
            None => panic!("expected Some(..), got None"),
        }
    }

    struct StubForecaster {
        response: Result<f64, ExternalError>,
        calls: AtomicUsize,
    }

    impl StubForecaster {
        fn returning(value: f64) -> Self {
            Self {
                response: Ok(value),
                calls: AtomicUsize::new(0),
            }
        }

        fn failing() -> Self {
            Self {
                response: Err(ExternalError::Failed("model blew up".to_string())),
                calls: AtomicUsize::new(0),
            }
        }

        fn call_count(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    impl ExternalForecaster for StubForecaster {
        fn forecast(&self, _history: &[RatingRecord]) -> Result<f64, ExternalError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.response.clone()
        }
    }

    fn history_of(ratings: &[f64]) -> Vec<RatingRecord> {
        let base = date!(2025 - 01 - 01).to_julian_day();
        ratings
            .iter()
            .enumerate()
            .map(|(offset, rating)| RatingRecord {
                date: must_ok(Date::from_julian_day(
                    base + must_ok(i32::try_from(offset)),
                )),
                rating: *rating,
            })
            .collect()
    }

    fn alternating(count: usize) -> Vec<f64> {
        (0..count)
            .map(|index| if index % 2 == 0 { 7.0 } else { 8.0 })
            .collect()
    }

    #[test]
    fn clamp_keeps_in_range_values() {
        assert!((clamp_rating(7.3) - 7.3).abs() < f64::EPSILON);
    }

    #[test]
    fn clamp_pins_out_of_range_values_to_bounds() {
        assert!((clamp_rating(0.2) - RATING_MIN).abs() < f64::EPSILON);
        assert!((clamp_rating(42.0) - RATING_MAX).abs() < f64::EPSILON);
    }

    #[test]
    fn clamp_collapses_non_finite_to_minimum() {
        assert!((clamp_rating(f64::NAN) - RATING_MIN).abs() < f64::EPSILON);
        assert!((clamp_rating(f64::INFINITY) - RATING_MIN).abs() < f64::EPSILON);
        assert!((clamp_rating(f64::NEG_INFINITY) - RATING_MIN).abs() < f64::EPSILON);
    }

    #[test]
    fn ema_of_empty_is_none() {
        assert_eq!(ema_of(&[], DEFAULT_EMA_SPAN), None);
    }

    #[test]
    fn ema_of_single_value_is_that_value_clamped() {
        assert!((must_some(ema_of(&[6.0], DEFAULT_EMA_SPAN)) - 6.0).abs() < f64::EPSILON);
        assert!((must_some(ema_of(&[12.0], DEFAULT_EMA_SPAN)) - RATING_MAX).abs() < f64::EPSILON);
    }

    #[test]
    fn ema_is_order_sensitive() {
        let ascending = must_some(ema_of(&[2.0, 4.0, 6.0, 8.0, 10.0], DEFAULT_EMA_SPAN));
        let descending = must_some(ema_of(&[10.0, 8.0, 6.0, 4.0, 2.0], DEFAULT_EMA_SPAN));
        assert!((ascending - descending).abs() > 0.5);
    }

    #[test]
    fn ema_weights_recent_values_more() {
        let low_finish = must_some(ema_of(&[8.0, 8.0, 8.0, 2.0], DEFAULT_EMA_SPAN));
        let steady = must_some(ema_of(&[8.0, 8.0, 8.0, 8.0], DEFAULT_EMA_SPAN));
        assert!(low_finish < steady);
    }

    proptest! {
        #[test]
        fn clamp_always_lands_inside_the_scale(value in proptest::num::f64::ANY) {
            let clamped = clamp_rating(value);
            prop_assert!((RATING_MIN..=RATING_MAX).contains(&clamped));
        }

        #[test]
        fn ema_of_finite_input_stays_inside_the_scale(
            values in proptest::collection::vec(-1_000.0_f64..1_000.0, 1..50)
        ) {
            let ema = must_some(ema_of(&values, DEFAULT_EMA_SPAN));
            prop_assert!((RATING_MIN..=RATING_MAX).contains(&ema));
        }
    }

    #[test]
    fn empty_history_predicts_the_minimum() {
        let result = compute_forecast(&[], None);
        assert_eq!(result.sample_count, 0);
        assert_eq!(result.ema, None);
        assert_eq!(result.external, None);
        assert!((result.predicted - RATING_MIN).abs() < f64::EPSILON);
        assert_eq!(result.source, ForecastSource::Ema);
    }

    #[test]
    fn below_threshold_never_invokes_the_external_forecaster() {
        let stub = StubForecaster::returning(9.0);
        let history = history_of(&alternating(EXTERNAL_MIN_SAMPLES - 1));

        let result = compute_forecast(&history, Some(&stub));

        assert_eq!(stub.call_count(), 0);
        assert_eq!(result.source, ForecastSource::Ema);
        assert_eq!(result.external, None);
    }

    #[test]
    fn missing_forecaster_at_threshold_falls_back_to_ema() {
        let history = history_of(&alternating(EXTERNAL_MIN_SAMPLES));
        let result = compute_forecast(&history, None);

        assert_eq!(result.source, ForecastSource::EmaFallback);
        let ema = must_some(result.ema);
        assert!((result.predicted - clamp_rating(ema)).abs() < f64::EPSILON);
    }

    #[test]
    fn failing_forecaster_falls_back_to_ema_without_error() {
        let stub = StubForecaster::failing();
        let history = history_of(&alternating(45));

        let result = compute_forecast(&history, Some(&stub));

        assert_eq!(stub.call_count(), 1);
        assert_eq!(result.source, ForecastSource::EmaFallback);
        assert_eq!(result.external, None);
        let ema = must_some(result.ema);
        assert!((result.predicted - clamp_rating(ema)).abs() < f64::EPSILON);
    }

    #[test]
    fn mid_range_history_blends_external_and_ema() {
        let stub = StubForecaster::returning(9.0);
        let history = history_of(&alternating(35));

        let result = compute_forecast(&history, Some(&stub));

        assert_eq!(result.source, ForecastSource::Blend);
        let ema = must_some(result.ema);
        let expected = clamp_rating(BLEND_EXTERNAL_WEIGHT * 9.0 + (1.0 - BLEND_EXTERNAL_WEIGHT) * ema);
        assert!((result.predicted - expected).abs() < 1e-12);
        // 35 alternating 7/8 samples converge near 7.5, so the blend lands near 7.95.
        assert!((result.predicted - 7.95).abs() < 0.05);
    }

    #[test]
    fn blend_holds_at_both_threshold_boundaries() {
        for count in [EXTERNAL_MIN_SAMPLES, EXTERNAL_SOLO_SAMPLES] {
            let stub = StubForecaster::returning(9.0);
            let history = history_of(&alternating(count));
            let result = compute_forecast(&history, Some(&stub));
            assert_eq!(result.source, ForecastSource::Blend, "count={count}");
        }
    }

    #[test]
    fn long_history_lets_external_supersede_ema() {
        let stub = StubForecaster::returning(9.5);
        let history = history_of(&alternating(EXTERNAL_SOLO_SAMPLES + 1));

        let result = compute_forecast(&history, Some(&stub));

        assert_eq!(result.source, ForecastSource::External);
        assert!((result.predicted - 9.5).abs() < f64::EPSILON);
        assert_eq!(result.external, Some(9.5));
    }

    #[test]
    fn out_of_scale_external_prediction_is_clamped() {
        let stub = StubForecaster::returning(42.0);
        let history = history_of(&alternating(EXTERNAL_SOLO_SAMPLES + 1));

        let result = compute_forecast(&history, Some(&stub));

        assert!((result.predicted - RATING_MAX).abs() < f64::EPSILON);
        assert_eq!(result.external, Some(RATING_MAX));
    }

    #[test]
    fn rating_record_rejects_non_finite_input() {
        let result = RatingRecord::new(date!(2025 - 06 - 01), f64::NAN);
        assert!(matches!(result, Err(MoodError::InvalidInput(_))));
    }

    #[test]
    fn rating_record_clamps_on_construction() {
        let record = must_ok(RatingRecord::new(date!(2025 - 06 - 01), 0.5));
        assert!((record.rating - RATING_MIN).abs() < f64::EPSILON);
    }

    #[test]
    fn iso_date_parser_is_strict() {
        assert_eq!(
            must_ok(parse_iso_date("2025-06-01")),
            date!(2025 - 06 - 01)
        );
        assert!(parse_iso_date("2025-13-45").is_err());
        assert!(parse_iso_date("2025-6-1").is_err());
        assert!(parse_iso_date("01/06/2025").is_err());
        assert!(parse_iso_date("2025-06-01T00:00:00").is_err());
    }

    #[test]
    fn iso_date_formats_round_trip() {
        let formatted = must_ok(format_iso_date(date!(2025 - 06 - 01)));
        assert_eq!(formatted, "2025-06-01");
        assert_eq!(must_ok(parse_iso_date(&formatted)), date!(2025 - 06 - 01));
    }

    #[test]
    fn source_labels_round_trip() {
        for source in [
            ForecastSource::Ema,
            ForecastSource::Blend,
            ForecastSource::External,
            ForecastSource::EmaFallback,
        ] {
            assert_eq!(ForecastSource::parse(source.as_str()), Some(source));
        }
        assert_eq!(ForecastSource::parse("prophet"), None);
    }

    #[test]
    fn readiness_labels_round_trip() {
        for state in [
            ReadinessState::NotReady,
            ReadinessState::Provisioning,
            ReadinessState::Ready,
        ] {
            assert_eq!(ReadinessState::parse(state.as_str()), Some(state));
        }
        assert_eq!(ReadinessState::parse("installing"), None);
    }

    #[test]
    fn gate_hands_the_slot_to_exactly_one_caller() {
        let gate = ReadinessGate::new();
        assert_eq!(gate.status(), ReadinessState::NotReady);
        assert!(gate.try_begin());
        assert!(!gate.try_begin());
        assert_eq!(gate.status(), ReadinessState::Provisioning);
    }

    #[test]
    fn gate_failure_returns_to_not_ready_and_allows_retry() {
        let gate = ReadinessGate::new();
        assert!(gate.try_begin());
        gate.complete(false);
        assert_eq!(gate.status(), ReadinessState::NotReady);
        assert!(gate.try_begin());
    }

    #[test]
    fn gate_ready_is_terminal() {
        let gate = ReadinessGate::new();
        assert!(gate.try_begin());
        gate.complete(true);
        assert_eq!(gate.status(), ReadinessState::Ready);
        assert!(!gate.try_begin());
        gate.complete(false);
        assert_eq!(gate.status(), ReadinessState::Ready);
    }

    #[test]
    fn forecast_result_json_contract_is_stable() {
        let result = ForecastResult {
            sample_count: 35,
            ema: Some(7.5),
            external: Some(9.0),
            predicted: 7.95,
            source: ForecastSource::Blend,
        };

        let value = must_ok(serde_json::to_value(&result));
        assert_eq!(
            value,
            json!({
                "sample_count": 35,
                "ema": 7.5,
                "external": 9.0,
                "predicted": 7.95,
                "source": "blend"
            })
        );
    }

    #[test]
    fn rating_record_json_uses_iso_dates() {
        let record = must_ok(RatingRecord::new(date!(2025 - 06 - 01), 7.0));
        let value = must_ok(serde_json::to_value(record));
        assert_eq!(value, json!({"date": "2025-06-01", "rating": 7.0}));

        let parsed: RatingRecord =
            must_ok(serde_json::from_value(json!({"date": "2025-06-01", "rating": 7.0})));
        assert_eq!(parsed, record);
    }
}

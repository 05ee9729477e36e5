//! Built-in analyses.
//!
//! Each built-in is a thin wrapper that translates a flat [`Parameters`]
//! map into the typed settings of one engine component, runs it, measures
//! per-event kinetics, and lays the outcome out as a flat
//! [`AnalysisResult`]: scalar summary keys and per-event arrays for tables,
//! underscore-prefixed keys for plot overlays. Plot schemas describe the
//! overlay keys as `{ key, kind }` pairs, where `kind` is `trace` for a
//! full-length series, `markers` for event times and `span` for a time
//! interval.

use crate::{
    baseline,
    detectors::{
        Direction,
        deconvolution::{self, DeconvolutionSettings},
        threshold::{self, ThresholdSettings},
    },
    error::{AnalysisError, EngineResult, ErrorLocation},
    features::{EventRecord, FeatureSettings, extract_event_features, summarize_events},
    noise,
    registry::{AnalysisRegistry, RegistryEntry},
};
use ephys_common::{
    AnalysisResult, ParameterDescriptor, ParameterKind, Parameters, Real, Trace,
};
use std::{str::FromStr, sync::Arc};

pub const DECONVOLUTION_DETECTION: &str = "deconvolution_detection";
pub const THRESHOLD_DETECTION: &str = "threshold_detection";
pub const BASELINE_STABILITY: &str = "baseline_stability";

/// Installs the built-in analyses into `registry`.
///
/// Runs before any plugin loader, so under the first-wins policy a plugin
/// can never shadow a built-in. Calling it twice is harmless.
pub fn register_builtin_analyses(registry: &AnalysisRegistry) {
    for entry in [deconvolution_entry(), threshold_entry(), baseline_entry()] {
        let name = entry.name.clone();
        if registry.register(entry).is_err() {
            tracing::debug!("built-in `{name}` was already registered");
        }
    }
}

fn deconvolution_entry() -> RegistryEntry {
    RegistryEntry {
        name: DECONVOLUTION_DETECTION.to_owned(),
        label: "Deconvolution event detection".to_owned(),
        callable: Arc::new(run_deconvolution),
        parameter_schema: deconvolution_schema(),
        plot_schema: serde_json::json!({
            "overlays": [
                { "key": "_deconvolved_z", "kind": "trace" },
                { "key": "_event_markers", "kind": "markers" },
            ]
        }),
    }
}

fn threshold_entry() -> RegistryEntry {
    RegistryEntry {
        name: THRESHOLD_DETECTION.to_owned(),
        label: "Threshold event detection".to_owned(),
        callable: Arc::new(run_threshold),
        parameter_schema: threshold_schema(),
        plot_schema: serde_json::json!({
            "overlays": [
                { "key": "_baseline_corrected", "kind": "trace" },
                { "key": "_event_markers", "kind": "markers" },
            ]
        }),
    }
}

fn baseline_entry() -> RegistryEntry {
    RegistryEntry {
        name: BASELINE_STABILITY.to_owned(),
        label: "Baseline stability".to_owned(),
        callable: Arc::new(run_baseline_stability),
        parameter_schema: baseline_schema(),
        plot_schema: serde_json::json!({
            "overlays": [{ "key": "_stable_window", "kind": "span" }]
        }),
    }
}

fn deconvolution_schema() -> Vec<ParameterDescriptor> {
    vec![
        ParameterDescriptor::new(
            "tau_rise_ms",
            "Rise time constant (ms)",
            ParameterKind::Float,
            0.5,
        )
        .with_bounds(0.01, 1000.0),
        ParameterDescriptor::new(
            "tau_decay_ms",
            "Decay time constant (ms)",
            ParameterKind::Float,
            5.0,
        )
        .with_bounds(0.02, 10_000.0),
        ParameterDescriptor::new(
            "threshold_sd",
            "Detection threshold (SD)",
            ParameterKind::Float,
            4.0,
        )
        .with_bounds(0.5, 100.0),
        ParameterDescriptor::new(
            "apply_filter",
            "Low-pass before deconvolution",
            ParameterKind::Bool,
            false,
        ),
        ParameterDescriptor::new(
            "filter_cutoff_hz",
            "Low-pass cutoff (Hz)",
            ParameterKind::Float,
            1000.0,
        )
        .with_bounds(1.0, 100_000.0)
        .visible_when("apply_filter"),
        ParameterDescriptor::new(
            "min_separation_ms",
            "Minimum event separation (ms)",
            ParameterKind::Float,
            2.0,
        )
        .with_bounds(0.01, 1000.0),
        ParameterDescriptor::new(
            "min_width_ms",
            "Minimum impulse width (ms)",
            ParameterKind::Float,
            0.2,
        )
        .with_bounds(0.0, 100.0),
        ParameterDescriptor::new(
            "regularization",
            "Wiener regularization",
            ParameterKind::Float,
            0.01,
        )
        .with_bounds(1e-6, 10.0),
        ParameterDescriptor::new(
            "feature_baseline_ms",
            "Per-event baseline window (ms)",
            ParameterKind::Float,
            5.0,
        )
        .with_bounds(0.1, 1000.0),
        ParameterDescriptor::new(
            "event_window_ms",
            "Per-event measurement span (ms)",
            ParameterKind::Float,
            50.0,
        )
        .with_bounds(1.0, 10_000.0),
    ]
}

fn threshold_schema() -> Vec<ParameterDescriptor> {
    vec![
        ParameterDescriptor::new(
            "direction",
            "Deflection direction",
            ParameterKind::Choice {
                options: vec!["negative".to_owned(), "positive".to_owned()],
            },
            "negative",
        ),
        ParameterDescriptor::new("threshold", "Threshold (signal units)", ParameterKind::Float, -5.0),
        ParameterDescriptor::new("refractory_s", "Refractory period (s)", ParameterKind::Float, 0.002)
            .with_bounds(0.0, 10.0),
        ParameterDescriptor::new(
            "baseline_window_ms",
            "Rolling baseline window (ms)",
            ParameterKind::Float,
            200.0,
        )
        .with_bounds(1.0, 60_000.0),
        ParameterDescriptor::new(
            "use_stable_window",
            "Estimate noise in the quietest window",
            ParameterKind::Bool,
            false,
        ),
        ParameterDescriptor::new("stable_window_s", "Quiet window length (s)", ParameterKind::Float, 0.1)
            .with_bounds(0.001, 100.0)
            .visible_when("use_stable_window"),
        ParameterDescriptor::new("stable_step_s", "Quiet window step (s)", ParameterKind::Float, 0.025)
            .with_bounds(0.001, 100.0)
            .visible_when("use_stable_window"),
        ParameterDescriptor::new("min_width_ms", "Minimum event width (ms)", ParameterKind::Float, 0.2)
            .with_bounds(0.0, 100.0),
        ParameterDescriptor::new(
            "reject_artifacts",
            "Reject fast-slope artifacts",
            ParameterKind::Bool,
            false,
        ),
        ParameterDescriptor::new(
            "artifact_slope_sd",
            "Artifact slope threshold (SD)",
            ParameterKind::Float,
            8.0,
        )
        .with_bounds(1.0, 1000.0)
        .visible_when("reject_artifacts"),
        ParameterDescriptor::new(
            "artifact_dilation_ms",
            "Artifact mask dilation (ms)",
            ParameterKind::Float,
            1.0,
        )
        .with_bounds(0.0, 100.0)
        .visible_when("reject_artifacts"),
        ParameterDescriptor::new(
            "feature_baseline_ms",
            "Per-event baseline window (ms)",
            ParameterKind::Float,
            5.0,
        )
        .with_bounds(0.1, 1000.0),
        ParameterDescriptor::new(
            "event_window_ms",
            "Per-event measurement span (ms)",
            ParameterKind::Float,
            50.0,
        )
        .with_bounds(1.0, 10_000.0),
    ]
}

fn baseline_schema() -> Vec<ParameterDescriptor> {
    vec![
        ParameterDescriptor::new("window_s", "Window length (s)", ParameterKind::Float, 0.1)
            .with_bounds(1e-4, 1000.0),
        ParameterDescriptor::new("step_s", "Window step (s)", ParameterKind::Float, 0.025)
            .with_bounds(1e-4, 1000.0),
    ]
}

fn deconvolution_settings(parameters: &Parameters) -> EngineResult<DeconvolutionSettings> {
    let defaults = DeconvolutionSettings::default();
    Ok(DeconvolutionSettings {
        tau_rise_ms: parameters.float_or("tau_rise_ms", defaults.tau_rise_ms)?,
        tau_decay_ms: parameters.float_or("tau_decay_ms", defaults.tau_decay_ms)?,
        threshold_sd: parameters.float_or("threshold_sd", defaults.threshold_sd)?,
        filter_cutoff_hz: if parameters.boolean_or("apply_filter", false)? {
            Some(parameters.float_or("filter_cutoff_hz", 1000.0)?)
        } else {
            None
        },
        min_separation_ms: parameters.float_or("min_separation_ms", defaults.min_separation_ms)?,
        min_width_ms: parameters.float_or("min_width_ms", defaults.min_width_ms)?,
        regularization: parameters.float_or("regularization", defaults.regularization)?,
    })
}

fn threshold_settings(parameters: &Parameters) -> EngineResult<ThresholdSettings> {
    let defaults = ThresholdSettings::default();
    Ok(ThresholdSettings {
        direction: parse_direction(parameters)?,
        threshold: parameters.float_or("threshold", defaults.threshold)?,
        refractory_s: parameters.float_or("refractory_s", defaults.refractory_s)?,
        baseline_window_ms: parameters.float_or("baseline_window_ms", defaults.baseline_window_ms)?,
        use_stable_window: parameters.boolean_or("use_stable_window", defaults.use_stable_window)?,
        stable_window_s: parameters.float_or("stable_window_s", defaults.stable_window_s)?,
        stable_step_s: parameters.float_or("stable_step_s", defaults.stable_step_s)?,
        min_width_ms: parameters.float_or("min_width_ms", defaults.min_width_ms)?,
        reject_artifacts: parameters.boolean_or("reject_artifacts", defaults.reject_artifacts)?,
        artifact_slope_sd: parameters.float_or("artifact_slope_sd", defaults.artifact_slope_sd)?,
        artifact_dilation_ms: parameters
            .float_or("artifact_dilation_ms", defaults.artifact_dilation_ms)?,
    })
}

fn parse_direction(parameters: &Parameters) -> EngineResult<Direction> {
    let name = parameters.choice_or("direction", "negative")?;
    Direction::from_str(name).map_err(|_| {
        AnalysisError::invalid_parameter(
            ErrorLocation::ThresholdDetector,
            "direction",
            format!("must be `negative` or `positive`, got `{name}`"),
        )
    })
}

fn feature_settings(parameters: &Parameters, direction: Direction) -> EngineResult<FeatureSettings> {
    let defaults = FeatureSettings::default();
    Ok(FeatureSettings {
        direction,
        baseline_window_ms: parameters.float_or("feature_baseline_ms", defaults.baseline_window_ms)?,
        event_window_ms: parameters.float_or("event_window_ms", defaults.event_window_ms)?,
    })
}

fn run_deconvolution(trace: &Trace, parameters: &Parameters) -> EngineResult<AnalysisResult> {
    if trace.is_empty() {
        return Ok(AnalysisResult::error(parameters.clone(), "trace is empty"));
    }
    let settings = deconvolution_settings(parameters)?;
    let detection = deconvolution::detect_events(trace, &settings)?;

    // Deconvolution scores carry the deflection sign, so kinetics are
    // measured per polarity and merged back in index order.
    let mut upward = Vec::new();
    let mut downward = Vec::new();
    for (&index, &score) in detection.indices.iter().zip(&detection.scores) {
        if score >= 0.0 {
            upward.push(index);
        } else {
            downward.push(index);
        }
    }
    let mut records = Vec::with_capacity(detection.indices.len());
    for (direction, subset) in [
        (Direction::Positive, upward),
        (Direction::Negative, downward),
    ] {
        let settings = feature_settings(parameters, direction)?;
        records.extend(extract_event_features(trace, &subset, &settings)?);
    }
    records.sort_by_key(|record| record.index);

    let mut result = event_result(trace, parameters, &records);
    result.insert("noise_scale", detection.diagnostics.noise_scale);
    result.insert("_deconvolved_z", detection.diagnostics.transformed);
    Ok(result)
}

fn run_threshold(trace: &Trace, parameters: &Parameters) -> EngineResult<AnalysisResult> {
    if trace.is_empty() {
        return Ok(AnalysisResult::error(parameters.clone(), "trace is empty"));
    }
    let settings = threshold_settings(parameters)?;
    let detection = threshold::detect_events(trace, &settings)?;
    let records = extract_event_features(
        trace,
        &detection.indices,
        &feature_settings(parameters, settings.direction)?,
    )?;

    let mut result = event_result(trace, parameters, &records);
    result.insert("noise_scale", detection.diagnostics.noise_scale);
    result.insert("_baseline_corrected", detection.diagnostics.transformed);
    Ok(result)
}

fn run_baseline_stability(trace: &Trace, parameters: &Parameters) -> EngineResult<AnalysisResult> {
    if trace.is_empty() {
        return Ok(AnalysisResult::error(parameters.clone(), "trace is empty"));
    }
    let window_s = parameters.float_or("window_s", 0.1)?;
    let step_s = parameters.float_or("step_s", 0.025)?;
    let (start, end) = baseline::find_stable_window(trace, window_s, step_s)?;

    let samples = trace.samples();
    let time = trace.time();
    Ok(AnalysisResult::new(parameters.clone())
        .with("window_start_index", start)
        .with("window_end_index", end)
        .with("window_start_s", time[start])
        .with("window_end_s", time[end - 1])
        .with("noise_scale", noise::estimate_noise(&samples[start..end]))
        .with(
            "drift_slope",
            baseline::drift_slope(&time[start..end], &samples[start..end]),
        )
        .with("_stable_window", vec![time[start], time[end - 1]]))
}

/// Common event-result layout shared by both detectors.
fn event_result(trace: &Trace, parameters: &Parameters, records: &[EventRecord]) -> AnalysisResult {
    let summary = summarize_events(records, trace.duration());
    AnalysisResult::new(parameters.clone())
        .with("event_count", summary.count)
        .with("frequency_hz", summary.frequency_hz)
        .with("mean_amplitude", summary.mean_amplitude)
        .with("mean_rise_ms", summary.mean_rise_ms)
        .with("mean_decay_ms", summary.mean_decay_ms)
        .with("mean_half_width_ms", summary.mean_half_width_ms)
        .with("event_indices", column(records, |r| r.index as Real))
        .with("event_times", column(records, |r| r.time))
        .with("event_amplitudes", column(records, |r| r.amplitude))
        .with("event_rise_ms", column(records, |r| r.rise_time_ms))
        .with("event_decay_ms", column(records, |r| r.decay_time_ms))
        .with("event_half_width_ms", column(records, |r| r.half_width_ms))
        .with("_event_markers", column(records, |r| r.time))
}

fn column(records: &[EventRecord], value: impl Fn(&EventRecord) -> Real) -> Vec<Real> {
    records.iter().map(value).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::default_parameters;
    use ephys_common::ResultValue;
    use rand::{Rng, SeedableRng, rngs::StdRng};
    use rand_distr::Normal;

    fn biexp_pulse(
        len: usize,
        sampling_rate: Real,
        peak_index: usize,
        amplitude: Real,
        tau_rise_ms: Real,
        tau_decay_ms: Real,
    ) -> Vec<Real> {
        let tau_rise = tau_rise_ms / 1000.0;
        let tau_decay = tau_decay_ms / 1000.0;
        let peak_time =
            tau_decay * tau_rise / (tau_decay - tau_rise) * (tau_decay / tau_rise).ln();
        let peak_value = (-peak_time / tau_decay).exp() - (-peak_time / tau_rise).exp();
        let onset = peak_index as Real / sampling_rate - peak_time;
        (0..len)
            .map(|i| {
                let t = i as Real / sampling_rate - onset;
                if t < 0.0 {
                    0.0
                } else {
                    amplitude * ((-t / tau_decay).exp() - (-t / tau_rise).exp()) / peak_value
                }
            })
            .collect()
    }

    fn registry_with_builtins() -> AnalysisRegistry {
        let registry = AnalysisRegistry::new();
        register_builtin_analyses(&registry);
        registry
    }

    fn scalar(result: &AnalysisResult, key: &str) -> Real {
        result
            .get(key)
            .and_then(ResultValue::as_scalar)
            .unwrap_or_else(|| panic!("missing scalar `{key}`"))
    }

    fn array<'a>(result: &'a AnalysisResult, key: &str) -> &'a [Real] {
        result
            .get(key)
            .and_then(ResultValue::as_array)
            .unwrap_or_else(|| panic!("missing array `{key}`"))
    }

    #[test]
    fn registration_is_idempotent() {
        let registry = registry_with_builtins();
        register_builtin_analyses(&registry);

        let names: Vec<String> = registry.list().iter().map(|e| e.name.clone()).collect();
        assert_eq!(
            names,
            vec![
                BASELINE_STABILITY,
                DECONVOLUTION_DETECTION,
                THRESHOLD_DETECTION
            ]
        );
    }

    #[test]
    fn schema_defaults_replay_the_default_settings() {
        let registry = registry_with_builtins();

        let schema = registry.parameter_schema(DECONVOLUTION_DETECTION).unwrap();
        let parameters = default_parameters(&schema);
        assert_eq!(
            deconvolution_settings(&parameters).unwrap(),
            DeconvolutionSettings::default()
        );

        let schema = registry.parameter_schema(THRESHOLD_DETECTION).unwrap();
        let parameters = default_parameters(&schema);
        assert_eq!(
            threshold_settings(&parameters).unwrap(),
            ThresholdSettings::default()
        );
    }

    #[test]
    fn deconvolution_analysis_finds_and_measures_the_pulse() {
        let samples = biexp_pulse(10_000, 10_000.0, 5_000, -50.0, 1.0, 5.0);
        let trace = Trace::from_samples(samples, 10_000.0).unwrap();
        let parameters = Parameters::new()
            .with("tau_rise_ms", 1.0)
            .with("tau_decay_ms", 5.0)
            .with("threshold_sd", 4.0);

        let registry = registry_with_builtins();
        let entry = registry.get(DECONVOLUTION_DETECTION).unwrap();
        let result = (entry.callable)(&trace, &parameters).unwrap();

        assert!(!result.is_error());
        assert_eq!(scalar(&result, "event_count"), 1.0);
        assert!((scalar(&result, "frequency_hz") - 1.0).abs() < 0.01);

        let times = array(&result, "event_times");
        assert!((times[0] - 0.5).abs() < 1e-3, "event at {}", times[0]);
        let amplitudes = array(&result, "event_amplitudes");
        assert!(
            (-55.0..=-45.0).contains(&amplitudes[0]),
            "amplitude {}",
            amplitudes[0]
        );
        let mean = scalar(&result, "mean_amplitude");
        assert!((-55.0..=-45.0).contains(&mean));

        assert_eq!(array(&result, "_deconvolved_z").len(), trace.len());
        assert_eq!(array(&result, "_event_markers").len(), 1);
    }

    #[test]
    fn zero_events_keep_the_full_key_set() {
        let trace = Trace::from_samples(vec![0.0; 5_000], 10_000.0).unwrap();
        let registry = registry_with_builtins();
        let entry = registry.get(THRESHOLD_DETECTION).unwrap();
        let result = (entry.callable)(&trace, &Parameters::new()).unwrap();

        assert!(!result.is_error());
        assert_eq!(scalar(&result, "event_count"), 0.0);
        assert_eq!(scalar(&result, "frequency_hz"), 0.0);
        assert!(scalar(&result, "mean_amplitude").is_nan());
        assert!(scalar(&result, "mean_half_width_ms").is_nan());
        assert!(array(&result, "event_indices").is_empty());
        assert!(array(&result, "event_times").is_empty());
        assert_eq!(array(&result, "_baseline_corrected").len(), trace.len());
    }

    #[test]
    fn empty_traces_are_non_findings_not_errors() {
        let trace = Trace::from_samples(Vec::new(), 10_000.0).unwrap();
        let registry = registry_with_builtins();
        for name in [
            DECONVOLUTION_DETECTION,
            THRESHOLD_DETECTION,
            BASELINE_STABILITY,
        ] {
            let entry = registry.get(name).unwrap();
            let result = (entry.callable)(&trace, &Parameters::new()).unwrap();
            assert!(result.is_error(), "`{name}` should report a non-finding");
            assert_eq!(result.error_message(), Some("trace is empty"));
        }
    }

    #[test]
    fn unknown_direction_is_rejected() {
        let trace = Trace::from_samples(vec![0.0; 100], 10_000.0).unwrap();
        let parameters = Parameters::new().with("direction", "sideways");
        let registry = registry_with_builtins();
        let entry = registry.get(THRESHOLD_DETECTION).unwrap();
        assert!(matches!(
            (entry.callable)(&trace, &parameters),
            Err(AnalysisError::InvalidParameter {
                name: "direction",
                ..
            })
        ));
    }

    #[test]
    fn recorded_parameters_replay_the_same_result() {
        let mut rng = StdRng::seed_from_u64(17);
        let normal = Normal::new(0.0, 1.0).unwrap();
        let mut samples: Vec<Real> = (0..8_000).map(|_| rng.sample(normal)).collect();
        for offset in 0..30 {
            let depth = 20.0 * (1.0 - (offset as Real - 15.0).abs() / 15.0);
            samples[3_000 + offset] -= depth;
        }
        let trace = Trace::from_samples(samples, 10_000.0).unwrap();
        let parameters = Parameters::new()
            .with("direction", "negative")
            .with("threshold", -8.0)
            .with("refractory_s", 0.002)
            .with("use_stable_window", false);

        let registry = registry_with_builtins();
        let entry = registry.get(THRESHOLD_DETECTION).unwrap();
        let first = (entry.callable)(&trace, &parameters).unwrap();
        assert_eq!(scalar(&first, "event_count"), 1.0);

        let recorded = serde_json::to_string(first.parameters()).unwrap();
        let replayed: Parameters = serde_json::from_str(&recorded).unwrap();
        let second = (entry.callable)(&trace, &replayed).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn baseline_stability_reports_the_quiet_window() {
        let mut rng = StdRng::seed_from_u64(11);
        let loud = Normal::new(0.0, 2.0).unwrap();
        let quiet = Normal::new(0.0, 0.1).unwrap();
        let samples: Vec<Real> = (0..1_000)
            .map(|i| {
                if (200..400).contains(&i) {
                    rng.sample(quiet)
                } else {
                    rng.sample(loud)
                }
            })
            .collect();
        let trace = Trace::from_samples(samples, 1_000.0).unwrap();
        let parameters = Parameters::new().with("window_s", 0.1).with("step_s", 0.025);

        let registry = registry_with_builtins();
        let entry = registry.get(BASELINE_STABILITY).unwrap();
        let result = (entry.callable)(&trace, &parameters).unwrap();

        let start = scalar(&result, "window_start_index") as usize;
        let end = scalar(&result, "window_end_index") as usize;
        assert!(start >= 200, "window starts at {start}");
        assert!(end <= 400, "window ends at {end}");
        assert!(scalar(&result, "noise_scale") < 0.5);
        assert_eq!(array(&result, "_stable_window").len(), 2);
        assert!(scalar(&result, "drift_slope").abs() < 2.0);
    }
}

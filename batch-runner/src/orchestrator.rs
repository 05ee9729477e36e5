//! Sequential batch execution.
//!
//! The runner walks files strictly in order on one dedicated worker thread,
//! looks every step's analysis up in the registry, and appends one
//! [`BatchRow`] per (file, channel, trial-scope) unit. Failure of a unit is
//! recorded in its row and the run continues: one corrupt file must not
//! cost the rows already computed. Cancellation is cooperative; the flag is
//! polled before each file, so in-flight work always completes.

use crate::{
    metrics::names,
    source::TraceSource,
    table::{BatchRow, BatchTable},
};
use chrono::Utc;
use ephys_common::{AnalysisResult, Parameters, Trace};
use ephys_trace_analysis::registry::AnalysisRegistry;
use metrics::counter;
use std::{
    any::Any,
    fmt,
    panic::{self, AssertUnwindSafe},
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
        mpsc::{Receiver, Sender, channel},
    },
    thread,
};

/// Which trials of a channel one step runs over.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TrialScope {
    /// One trial by index.
    Single(usize),
    /// Every trial, one row each.
    Each,
    /// The trial-averaged trace.
    Average,
}

/// Selects the (channel, trial) units a step applies to within each file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Scope {
    pub trials: TrialScope,
    /// Restricts the step to named channels; `None` means every channel.
    pub channels: Option<Vec<String>>,
}

impl Default for Scope {
    fn default() -> Self {
        Self {
            trials: TrialScope::Average,
            channels: None,
        }
    }
}

impl Scope {
    fn includes(&self, channel: &str) -> bool {
        match &self.channels {
            Some(names) => names.iter().any(|name| name == channel),
            None => true,
        }
    }
}

/// One analysis application: which analysis, with which parameters, over
/// which units.
#[derive(Debug, Clone)]
pub struct PipelineStep {
    pub analysis: String,
    pub parameters: Parameters,
    pub scope: Scope,
}

/// One channel of one batch file.
#[derive(Clone)]
pub struct BatchChannel {
    pub name: String,
    pub source: Arc<dyn TraceSource>,
}

impl fmt::Debug for BatchChannel {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        formatter
            .debug_struct("BatchChannel")
            .field("name", &self.name)
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Clone)]
pub struct BatchFile {
    pub id: String,
    pub channels: Vec<BatchChannel>,
}

/// Worker progress, one event stream per run. `Finished` is always last;
/// `Cancelled` precedes it when the flag was honoured.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Progress {
    FileStarted { index: usize, id: String },
    FileFinished { index: usize, id: String, rows: usize },
    Cancelled,
    Finished,
}

/// Runs the pipeline over `files` on the calling thread.
///
/// Progress events are pushed through `progress`; a dropped receiver never
/// aborts the run. The returned table holds every row produced before
/// completion or cancellation.
#[tracing::instrument(skip_all, fields(files = files.len(), steps = steps.len()))]
pub fn run(
    files: &[BatchFile],
    steps: &[PipelineStep],
    registry: &AnalysisRegistry,
    cancel: &AtomicBool,
    progress: &Sender<Progress>,
) -> BatchTable {
    crate::metrics::describe();
    let started = Utc::now();
    let mut rows = Vec::new();

    for (index, file) in files.iter().enumerate() {
        if cancel.load(Ordering::Relaxed) {
            tracing::info!("batch cancelled before `{}`", file.id);
            let _ = progress.send(Progress::Cancelled);
            break;
        }
        let _ = progress.send(Progress::FileStarted {
            index,
            id: file.id.clone(),
        });
        let before = rows.len();
        process_file(file, steps, registry, &mut rows);
        counter!(names::FILES_PROCESSED).increment(1);
        let _ = progress.send(Progress::FileFinished {
            index,
            id: file.id.clone(),
            rows: rows.len() - before,
        });
    }

    let _ = progress.send(Progress::Finished);
    let table = BatchTable {
        started,
        finished: Utc::now(),
        rows,
    };
    tracing::info!(
        "batch produced {} rows in {} ms",
        table.rows.len(),
        table.elapsed().num_milliseconds()
    );
    table
}

fn process_file(
    file: &BatchFile,
    steps: &[PipelineStep],
    registry: &AnalysisRegistry,
    rows: &mut Vec<BatchRow>,
) {
    for step in steps {
        for channel in file
            .channels
            .iter()
            .filter(|channel| step.scope.includes(&channel.name))
        {
            for (label, trial) in expand_trials(&step.scope.trials, channel.source.trial_count()) {
                let result = run_unit(&file.id, channel, step, registry, trial);
                if result.is_error() {
                    counter!(names::FAILURES).increment(1);
                }
                rows.push(BatchRow {
                    file: file.id.clone(),
                    channel: channel.name.clone(),
                    analysis: step.analysis.clone(),
                    scope: label,
                    result,
                });
                counter!(names::ROWS_EMITTED).increment(1);
            }
        }
    }
}

/// Concrete (label, trial) units for one trial scope. `None` selects the
/// averaged trace.
fn expand_trials(scope: &TrialScope, trial_count: usize) -> Vec<(String, Option<usize>)> {
    match scope {
        TrialScope::Single(trial) => vec![(format!("trial {trial}"), Some(*trial))],
        TrialScope::Each => (0..trial_count)
            .map(|trial| (format!("trial {trial}"), Some(trial)))
            .collect(),
        TrialScope::Average => vec![("average".to_owned(), None)],
    }
}

/// Runs one unit, converting every failure mode into an error-keyed result.
/// A panic inside an analysis (a plugin, typically) is caught at this
/// boundary so the rest of the batch still runs.
fn run_unit(
    file_id: &str,
    channel: &BatchChannel,
    step: &PipelineStep,
    registry: &AnalysisRegistry,
    trial: Option<usize>,
) -> AnalysisResult {
    let outcome = panic::catch_unwind(AssertUnwindSafe(|| {
        unit_result(channel, step, registry, trial)
    }));
    match outcome {
        Ok(Ok(result)) => result,
        Ok(Err(error)) => {
            tracing::warn!(
                "analysis `{}` failed on `{file_id}`/`{}`: {error:#} (parameters {})",
                step.analysis,
                channel.name,
                parameters_json(&step.parameters),
            );
            AnalysisResult::error(step.parameters.clone(), format!("{error:#}"))
        }
        Err(payload) => {
            let message = panic_message(payload);
            tracing::error!(
                "analysis `{}` panicked on `{file_id}`/`{}`: {message} (parameters {})",
                step.analysis,
                channel.name,
                parameters_json(&step.parameters),
            );
            AnalysisResult::error(
                step.parameters.clone(),
                format!("analysis panicked: {message}"),
            )
        }
    }
}

fn unit_result(
    channel: &BatchChannel,
    step: &PipelineStep,
    registry: &AnalysisRegistry,
    trial: Option<usize>,
) -> anyhow::Result<AnalysisResult> {
    let entry = registry.get(&step.analysis)?;
    let trace = load_trace(channel.source.as_ref(), trial)?;
    Ok((entry.callable)(&trace, &step.parameters)?)
}

fn load_trace(source: &dyn TraceSource, trial: Option<usize>) -> anyhow::Result<Trace> {
    match trial {
        Some(trial) => {
            let samples = source.get_data(trial)?;
            let time = source.get_relative_time_vector(trial)?;
            Ok(Trace::new(samples, time, source.sampling_rate())?)
        }
        None => Ok(Trace::from_samples(
            source.get_averaged_data()?,
            source.sampling_rate(),
        )?),
    }
}

fn parameters_json(parameters: &Parameters) -> String {
    serde_json::to_string(parameters).unwrap_or_else(|_| "<unserializable>".to_owned())
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(text) = payload.downcast_ref::<&str>() {
        (*text).to_owned()
    } else if let Some(text) = payload.downcast_ref::<String>() {
        text.clone()
    } else {
        "opaque panic payload".to_owned()
    }
}

/// A running batch worker: progress stream, cancellation flag, and the
/// table on join.
pub struct BatchHandle {
    worker: thread::JoinHandle<BatchTable>,
    progress: Receiver<Progress>,
    cancel: Arc<AtomicBool>,
}

impl BatchHandle {
    /// Requests cancellation; the file in flight still completes.
    pub fn cancel(&self) {
        self.cancel.store(true, Ordering::Relaxed);
    }

    /// Progress events in emission order.
    pub fn progress(&self) -> &Receiver<Progress> {
        &self.progress
    }

    /// Waits for the worker and returns its table.
    pub fn join(self) -> anyhow::Result<BatchTable> {
        self.worker
            .join()
            .map_err(|_| anyhow::anyhow!("batch worker panicked"))
    }
}

/// Runs the pipeline on a dedicated worker thread, keeping the caller free
/// to stay responsive.
pub fn spawn(
    files: Vec<BatchFile>,
    steps: Vec<PipelineStep>,
    registry: &'static AnalysisRegistry,
) -> BatchHandle {
    let cancel = Arc::new(AtomicBool::new(false));
    let flag = Arc::clone(&cancel);
    let (sender, receiver) = channel();
    let worker = thread::spawn(move || run(&files, &steps, registry, &flag, &sender));
    BatchHandle {
        worker,
        progress: receiver,
        cancel,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::source::MemoryTraceSource;
    use ephys_common::{Real, ResultValue, Trace};
    use ephys_trace_analysis::{
        EngineResult,
        builtin::{BASELINE_STABILITY, THRESHOLD_DETECTION, register_builtin_analyses},
        registry::RegistryEntry,
    };
    use std::sync::Mutex;

    fn dip_trial(len: usize, centre: usize, depth: Real) -> Vec<Real> {
        let half_base = 30_usize;
        let mut samples = vec![0.0; len];
        for index in centre - half_base..=centre + half_base {
            let distance = centre.abs_diff(index) as Real / half_base as Real;
            samples[index] += depth * (1.0 - distance);
        }
        samples
    }

    fn builtin_registry() -> AnalysisRegistry {
        let registry = AnalysisRegistry::new();
        register_builtin_analyses(&registry);
        registry
    }

    fn scalar(row: &BatchRow, key: &str) -> Real {
        row.result
            .get(key)
            .and_then(ResultValue::as_scalar)
            .unwrap_or_else(|| panic!("missing scalar `{key}`"))
    }

    #[test]
    fn scopes_expand_to_one_row_per_unit() {
        let registry = builtin_registry();
        let im = Arc::new(MemoryTraceSource::new(
            vec![dip_trial(2_000, 1_000, -20.0), vec![0.0; 2_000]],
            10_000.0,
        ));
        let vm = Arc::new(MemoryTraceSource::new(vec![vec![0.0; 2_000]; 2], 10_000.0));
        let files = [BatchFile {
            id: "cell01".to_owned(),
            channels: vec![
                BatchChannel {
                    name: "Im".to_owned(),
                    source: im,
                },
                BatchChannel {
                    name: "Vm".to_owned(),
                    source: vm,
                },
            ],
        }];
        let steps = [
            PipelineStep {
                analysis: THRESHOLD_DETECTION.to_owned(),
                parameters: Parameters::new().with("threshold", -8.0),
                scope: Scope {
                    trials: TrialScope::Each,
                    channels: Some(vec!["Im".to_owned()]),
                },
            },
            PipelineStep {
                analysis: BASELINE_STABILITY.to_owned(),
                parameters: Parameters::new(),
                scope: Scope::default(),
            },
        ];

        let cancel = AtomicBool::new(false);
        let (sender, receiver) = channel();
        let table = run(&files, &steps, &registry, &cancel, &sender);

        assert_eq!(table.rows.len(), 4);
        assert_eq!(table.rows[0].channel, "Im");
        assert_eq!(table.rows[0].scope, "trial 0");
        assert_eq!(scalar(&table.rows[0], "event_count"), 1.0);
        assert_eq!(table.rows[1].scope, "trial 1");
        assert_eq!(scalar(&table.rows[1], "event_count"), 0.0);
        assert_eq!(table.rows[2].analysis, BASELINE_STABILITY);
        assert_eq!(table.rows[2].scope, "average");
        assert_eq!(table.rows[3].channel, "Vm");

        let events: Vec<Progress> = receiver.try_iter().collect();
        assert_eq!(
            events,
            vec![
                Progress::FileStarted {
                    index: 0,
                    id: "cell01".to_owned()
                },
                Progress::FileFinished {
                    index: 0,
                    id: "cell01".to_owned(),
                    rows: 4
                },
                Progress::Finished,
            ]
        );
        assert!(table.finished >= table.started);
        assert!(table.elapsed() >= chrono::Duration::zero());
    }

    #[test]
    fn a_raised_flag_skips_every_remaining_file() {
        let registry = builtin_registry();
        let files = [BatchFile {
            id: "cell01".to_owned(),
            channels: vec![BatchChannel {
                name: "Im".to_owned(),
                source: Arc::new(MemoryTraceSource::new(vec![vec![0.0; 100]], 10_000.0)),
            }],
        }];
        let steps = [PipelineStep {
            analysis: THRESHOLD_DETECTION.to_owned(),
            parameters: Parameters::new(),
            scope: Scope::default(),
        }];

        let cancel = AtomicBool::new(true);
        let (sender, receiver) = channel();
        let table = run(&files, &steps, &registry, &cancel, &sender);

        assert!(table.rows.is_empty());
        let events: Vec<Progress> = receiver.try_iter().collect();
        assert_eq!(events, vec![Progress::Cancelled, Progress::Finished]);
    }

    #[test]
    fn every_failure_mode_becomes_a_row_and_the_run_continues() {
        tracing_subscriber::fmt::init();

        let registry = builtin_registry();
        registry
            .register(RegistryEntry {
                name: "explode".to_owned(),
                label: "Explode".to_owned(),
                callable: Arc::new(|_: &Trace, _: &Parameters| -> EngineResult<AnalysisResult> {
                    panic!("boom")
                }),
                parameter_schema: Vec::new(),
                plot_schema: serde_json::Value::Null,
            })
            .unwrap();

        let files = [BatchFile {
            id: "cell02".to_owned(),
            channels: vec![BatchChannel {
                name: "Im".to_owned(),
                source: Arc::new(MemoryTraceSource::new(vec![vec![0.0; 100]], 10_000.0)),
            }],
        }];
        let step = |analysis: &str, trials: TrialScope| PipelineStep {
            analysis: analysis.to_owned(),
            parameters: Parameters::new(),
            scope: Scope {
                trials,
                channels: None,
            },
        };
        let steps = [
            step("missing_analysis", TrialScope::Average),
            step("explode", TrialScope::Average),
            step(THRESHOLD_DETECTION, TrialScope::Single(9)),
            step(THRESHOLD_DETECTION, TrialScope::Average),
        ];

        let cancel = AtomicBool::new(false);
        let (sender, _receiver) = channel();
        let table = run(&files, &steps, &registry, &cancel, &sender);

        assert_eq!(table.rows.len(), 4);
        let message = |row: &BatchRow| row.result.error_message().unwrap_or_default().to_owned();
        assert!(message(&table.rows[0]).contains("missing_analysis"));
        assert!(message(&table.rows[1]).contains("panicked"));
        assert!(message(&table.rows[1]).contains("boom"));
        assert!(message(&table.rows[2]).contains("trial 9"));
        assert!(!table.rows[3].result.is_error());
    }

    #[test]
    fn spawned_worker_reports_and_joins() {
        let registry: &'static AnalysisRegistry = Box::leak(Box::new(builtin_registry()));
        let files = vec![BatchFile {
            id: "cell03".to_owned(),
            channels: vec![BatchChannel {
                name: "Im".to_owned(),
                source: Arc::new(MemoryTraceSource::new(vec![vec![0.0; 500]], 10_000.0)),
            }],
        }];
        let steps = vec![PipelineStep {
            analysis: THRESHOLD_DETECTION.to_owned(),
            parameters: Parameters::new(),
            scope: Scope::default(),
        }];

        let handle = spawn(files, steps, registry);
        let mut last = None;
        while let Ok(event) = handle.progress().recv() {
            last = Some(event);
        }
        assert_eq!(last, Some(Progress::Finished));

        let table = handle.join().unwrap();
        assert_eq!(table.rows.len(), 1);
        assert!(!table.rows[0].result.is_error());
    }

    #[test]
    fn cancellation_between_files_keeps_finished_work() {
        let registry: &'static AnalysisRegistry = Box::leak(Box::new(AnalysisRegistry::new()));
        let (entered_sender, entered) = channel();
        let (release_sender, release) = channel();
        let entered_sender = Mutex::new(entered_sender);
        let release = Mutex::new(release);
        registry
            .register(RegistryEntry {
                name: "gate".to_owned(),
                label: "Gate".to_owned(),
                callable: Arc::new(move |_: &Trace, parameters: &Parameters| {
                    entered_sender.lock().unwrap().send(()).unwrap();
                    release.lock().unwrap().recv().unwrap();
                    Ok(AnalysisResult::new(parameters.clone()).with("event_count", 0_usize))
                }),
                parameter_schema: Vec::new(),
                plot_schema: serde_json::Value::Null,
            })
            .unwrap();

        let file = |id: &str| BatchFile {
            id: id.to_owned(),
            channels: vec![BatchChannel {
                name: "Im".to_owned(),
                source: Arc::new(MemoryTraceSource::new(vec![vec![0.0; 16]], 10_000.0)),
            }],
        };
        let steps = vec![PipelineStep {
            analysis: "gate".to_owned(),
            parameters: Parameters::new(),
            scope: Scope {
                trials: TrialScope::Single(0),
                channels: None,
            },
        }];

        let handle = spawn(vec![file("first"), file("second")], steps, registry);
        entered.recv().unwrap();
        handle.cancel();
        release_sender.send(()).unwrap();

        let events: Vec<Progress> = handle.progress().iter().collect();
        assert!(events.contains(&Progress::Cancelled));
        assert_eq!(events.last(), Some(&Progress::Finished));

        let table = handle.join().unwrap();
        assert_eq!(table.rows.len(), 1);
        assert_eq!(table.rows[0].file, "first");
    }
}

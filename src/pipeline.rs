//! Pipeline runtime.
//!
//! Shaped after `samply-quota-manager`'s `QuotaManager`/eviction-thread
//! split: a small public handle (`Pipeline`) that owns the channels and a
//! join handle, and a private orchestrator that runs as one spawned task
//! and does the actual stage wiring. The orchestrator spawns one task per
//! pipeline stage and joins them in order once the input closes, the same
//! way `QuotaManagerEvictionThread::run` is spawned once from
//! `QuotaManager::new` and joined from `finish`.
//!
//! Stage topology: `ScheduleTestcase` (unbounded) forwards into
//! `GenerateTrace` (capacity 3, parallelism 1), which forwards into
//! `PreprocessTrace` (capacity 1, parallelism 1, sequential for
//! heap-id monotonicity on the shared prefix), which forwards into
//! whichever sink the configured analysis mode needs: `Compare`
//! (capacity 8, parallelism 1) or `Compress` (capacity 8, parallelism 4).

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex as SyncMutex};

use dashmap::DashMap;
use log::warn;
use tokio::sync::{mpsc, oneshot, Mutex as AsyncMutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::comparator::{self, ComparisonOutcome};
use crate::config::{AnalysisMode, PipelineConfig};
use crate::entry::{Trace, TracePrefix};
use crate::error::{Result, TraceWalkError};
use crate::image_map::ImageMap;
use crate::mi::hash_pool::HashPool;
use crate::mi::{per_instruction, prefix_length, whole_trace};
use crate::preprocessor::{DroppedRecordCounts, Preprocessor};
use crate::record::RawTraceFile;
use crate::result_writer;

const GENERATE_CAPACITY: usize = 3;
const PREPROCESS_CAPACITY: usize = 1;
const SINK_CAPACITY: usize = 8;
const COMPRESS_PARALLELISM: usize = 4;

/// Produces one raw trace file for a testcase. The tracing frontend that
/// implements this against a real fuzzer/target is out of scope here; this
/// trait is the seam the pipeline calls through.
pub trait Tracer: Send + Sync + 'static {
    fn generate(&self, testcase_id: u64, testcase_file_path: &Path) -> Result<PathBuf>;
}

#[derive(Debug, Clone)]
struct Submission {
    testcase_id: u64,
    testcase_file_path: PathBuf,
}

/// Final tallies and output file locations produced once a `Pipeline`
/// drains.
#[derive(Debug, Clone, Default)]
pub struct AnalysisResults {
    pub testcases_processed: u64,
    pub testcases_dropped: u64,
    pub dropped_records: DroppedRecordCounts,
    pub mutual_information_path: Option<PathBuf>,
    pub mutual_information_instructions_path: Option<PathBuf>,
}

/// Concurrent state written by the `PreprocessTrace`/`Compare`/`Compress`
/// stages. `originals` and `names` are populated synchronously by
/// `submit`, ahead of the stage that will eventually read them, and never
/// mutated again for a given key — so the stages only ever need to read
/// them, matching the "unique producer per key" discipline
/// `hashes_by_testcase`/`instruction_traces` also follow.
#[derive(Default)]
struct Accumulators {
    originals: DashMap<u64, u64>,
    names: DashMap<u64, String>,
    whole_trace_digests: DashMap<u64, [u8; 16]>,
    traces: DashMap<u64, Arc<Trace>>,
    /// `None` for a testcase the preprocessor stage dropped outright
    /// under the fail-soft-per-testcase I/O error policy; `Some` carries
    /// that testcase's own fail-soft-skipped-record counts.
    outcomes: DashMap<u64, Option<DroppedRecordCounts>>,
    max_entries: AtomicU64,
}

/// Runs a testcase's raw file through the preprocessor and returns the
/// resulting [`Trace`], or `None` if the testcase was dropped under the
/// fail-soft-per-testcase I/O error policy.
fn preprocess_one(prefix: Arc<TracePrefix>, raw_path: &Path) -> Option<(Trace, DroppedRecordCounts)> {
    let raw = match RawTraceFile::open(raw_path) {
        Ok(raw) => raw,
        Err(e) => {
            warn!("dropping testcase: failed to open raw trace {raw_path:?}: {e}");
            return None;
        }
    };
    let mut pre = Preprocessor::for_testcase(prefix);
    let mut buf = Vec::new();
    if let Err(e) = pre.process_file(&raw, &mut buf) {
        warn!("dropping testcase: failed to preprocess {raw_path:?}: {e}");
        return None;
    }
    let dropped = pre.dropped();
    let (trace, _) = pre.finish_testcase();
    Some((trace, dropped))
}

/// Handle to a running pipeline. Cheaply cloneable submission ids aside,
/// this owns the channel half that feeds `ScheduleTestcase` and the join
/// handle for the orchestrator task; `wait` consumes both.
pub struct Pipeline {
    config: PipelineConfig,
    prefix: Arc<TracePrefix>,
    schedule_tx: SyncMutex<Option<mpsc::UnboundedSender<Submission>>>,
    last_original: SyncMutex<Option<u64>>,
    cancel: CancellationToken,
    accum: Arc<Accumulators>,
    results_rx: AsyncMutex<Option<oneshot::Receiver<AnalysisResults>>>,
    orchestrator: AsyncMutex<Option<JoinHandle<()>>>,
}

impl Pipeline {
    /// Builds a pipeline: loads the image map, synchronously runs the
    /// "dummy" testcase (`dummy_testcase_path`) through the prefix-mode
    /// preprocessor to produce the shared [`TracePrefix`], then spawns the
    /// async stage pipeline. Real testcases submitted before this returns
    /// can't happen (the caller doesn't have a `Pipeline` yet), so the
    /// "subsequent testcases depend on prefix availability" ordering
    /// holds structurally rather than needing its own readiness gate.
    pub async fn new(
        config: PipelineConfig,
        tracer: impl Tracer,
        prefix_data_path: PathBuf,
        dummy_testcase_id: u64,
        dummy_testcase_path: PathBuf,
    ) -> Result<Self> {
        let config = config.validate()?;
        let tracer: Arc<dyn Tracer> = Arc::new(tracer);

        let images = {
            let path = prefix_data_path.clone();
            tokio::task::spawn_blocking(move || ImageMap::load(&path))
                .await
                .expect("image map load task panicked")?
        };

        let prefix = {
            let tracer = Arc::clone(&tracer);
            let dummy_path = dummy_testcase_path.clone();
            let keep_preprocessed = config.keep_preprocessed_traces;
            let preprocessed_dir = config.preprocessed_trace_directory.clone();
            tokio::task::spawn_blocking(move || -> Result<Arc<TracePrefix>> {
                let raw_path = tracer.generate(dummy_testcase_id, &dummy_path)?;
                let raw = RawTraceFile::open(&raw_path)?;
                let mut pre = Preprocessor::for_prefix(images);
                let mut buf = Vec::new();
                pre.write_header(&mut buf)?;
                pre.process_file(&raw, &mut buf)?;
                let (prefix, _dropped) = pre.finish_prefix();
                if keep_preprocessed {
                    std::fs::create_dir_all(&preprocessed_dir)
                        .map_err(|e| TraceWalkError::io(&preprocessed_dir, e))?;
                    let out = preprocessed_dir.join("prefix.trace");
                    std::fs::write(&out, &buf).map_err(|e| TraceWalkError::io(&out, e))?;
                }
                Ok(prefix)
            })
            .await
            .expect("prefix preprocessing task panicked")?
        };

        let (schedule_tx, schedule_rx) = mpsc::unbounded_channel();
        let cancel = CancellationToken::new();
        let accum = Arc::new(Accumulators::default());
        let (results_tx, results_rx) = oneshot::channel();

        let orchestrator = tokio::spawn(run_pipeline(
            config.clone(),
            tracer,
            Arc::clone(&prefix),
            schedule_rx,
            cancel.clone(),
            Arc::clone(&accum),
            results_tx,
        ));

        Ok(Self {
            config,
            prefix,
            schedule_tx: SyncMutex::new(Some(schedule_tx)),
            last_original: SyncMutex::new(None),
            cancel,
            accum,
            results_rx: AsyncMutex::new(Some(results_rx)),
            orchestrator: AsyncMutex::new(Some(orchestrator)),
        })
    }

    /// The shared prefix produced during construction.
    pub fn prefix(&self) -> &Arc<TracePrefix> {
        &self.prefix
    }

    /// Schedules a testcase. `is_duplicate` marks this submission as a
    /// `randomization_multiplier` replicate of the most recently submitted
    /// non-duplicate testcase; every analyzer groups a duplicate's
    /// observations under that original testcase's id rather than its own.
    pub fn submit(
        &self,
        testcase_id: u64,
        testcase_file_path: impl Into<PathBuf>,
        is_duplicate: bool,
    ) -> Result<()> {
        let path = testcase_file_path.into();

        let original = {
            let mut last = self.last_original.lock().unwrap();
            if is_duplicate {
                last.unwrap_or(testcase_id)
            } else {
                *last = Some(testcase_id);
                testcase_id
            }
        };
        self.accum.originals.insert(testcase_id, original);
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| testcase_id.to_string());
        self.accum.names.insert(testcase_id, name);

        let guard = self.schedule_tx.lock().unwrap();
        match guard.as_ref() {
            Some(tx) => tx
                .send(Submission {
                    testcase_id,
                    testcase_file_path: path,
                })
                .map_err(|_| TraceWalkError::PipelineClosed),
            None => Err(TraceWalkError::PipelineClosed),
        }
    }

    /// Signals end of input: no more testcases will be submitted. The
    /// stages already holding work keep draining it.
    pub fn complete(&self) {
        self.schedule_tx.lock().unwrap().take();
    }

    /// Cooperative cancellation: stages finish whatever they're holding
    /// but start nothing new.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Blocks until every stage has drained, then assembles and writes the
    /// configured analysis's result files.
    pub async fn wait(&self) -> Result<AnalysisResults> {
        if let Some(handle) = self.orchestrator.lock().await.take() {
            handle.await.expect("pipeline orchestrator task panicked");
        }
        let rx = self.results_rx.lock().await.take();
        match rx {
            Some(rx) => Ok(rx.await.expect("orchestrator dropped its results sender")),
            None => Ok(AnalysisResults::default()),
        }
    }
}

/// One pipeline run, spawned once from [`Pipeline::new`]. Owns every
/// channel end the stage tasks need and joins them all before computing
/// and writing the final analysis.
#[allow(clippy::too_many_arguments)]
async fn run_pipeline(
    config: PipelineConfig,
    tracer: Arc<dyn Tracer>,
    prefix: Arc<TracePrefix>,
    mut schedule_rx: mpsc::UnboundedReceiver<Submission>,
    cancel: CancellationToken,
    accum: Arc<Accumulators>,
    results_tx: oneshot::Sender<AnalysisResults>,
) {
    let (generate_tx, mut generate_rx) = mpsc::channel::<Submission>(GENERATE_CAPACITY);
    let (preprocess_tx, mut preprocess_rx) =
        mpsc::channel::<(Submission, PathBuf)>(PREPROCESS_CAPACITY);

    let wants_compare = config.analysis_mode == AnalysisMode::Compare;
    let wants_compress = matches!(
        config.analysis_mode,
        AnalysisMode::MutualInformationWholeTrace
            | AnalysisMode::MutualInformationTracePrefix
            | AnalysisMode::MutualInformationSingleInstruction
    );

    let (compare_tx, compare_rx) = if wants_compare {
        let (tx, rx) = mpsc::channel(SINK_CAPACITY);
        (Some(tx), Some(rx))
    } else {
        (None, None)
    };
    let (compress_tx, compress_rx) = if wants_compress {
        let (tx, rx) = mpsc::channel(SINK_CAPACITY);
        (Some(tx), Some(Arc::new(AsyncMutex::new(rx))))
    } else {
        (None, None)
    };

    // ScheduleTestcase -> GenerateTrace forwarder. Its own queue is
    // unbounded (submit never blocks callers); it blocks here, backpressuring
    // into GenerateTrace's bounded queue.
    let forward = {
        let cancel = cancel.clone();
        let generate_tx = generate_tx.clone();
        tokio::spawn(async move {
            loop {
                let item = tokio::select! {
                    _ = cancel.cancelled() => break,
                    item = schedule_rx.recv() => item,
                };
                match item {
                    Some(submission) => {
                        if generate_tx.send(submission).await.is_err() {
                            break;
                        }
                    }
                    None => break,
                }
            }
        })
    };
    drop(generate_tx);

    // GenerateTrace: parallelism 1, calls the external tracer.
    let generate = {
        let cancel = cancel.clone();
        let tracer = Arc::clone(&tracer);
        let preprocess_tx = preprocess_tx.clone();
        tokio::spawn(async move {
            loop {
                let submission = tokio::select! {
                    _ = cancel.cancelled() => break,
                    item = generate_rx.recv() => match item {
                        Some(s) => s,
                        None => break,
                    },
                };
                let tracer = Arc::clone(&tracer);
                let testcase_path = submission.testcase_file_path.clone();
                let testcase_id = submission.testcase_id;
                let raw_path = tokio::task::spawn_blocking(move || {
                    tracer.generate(testcase_id, &testcase_path)
                })
                .await
                .expect("tracer task panicked");
                match raw_path {
                    Ok(raw_path) => {
                        if preprocess_tx.send((submission, raw_path)).await.is_err() {
                            break;
                        }
                    }
                    Err(e) => {
                        warn!(
                            "dropping testcase {}: tracer failed: {e}",
                            submission.testcase_id
                        );
                    }
                }
            }
        })
    };
    drop(preprocess_tx);

    // PreprocessTrace: parallelism 1, sequential so next_heap_id stays
    // monotonic against the one shared prefix.
    let preprocess = {
        let cancel = cancel.clone();
        let prefix = Arc::clone(&prefix);
        let accum = Arc::clone(&accum);
        let config = config.clone();
        let compare_tx = compare_tx.clone();
        let compress_tx = compress_tx.clone();
        tokio::spawn(async move {
            loop {
                let (submission, raw_path) = tokio::select! {
                    _ = cancel.cancelled() => break,
                    item = preprocess_rx.recv() => match item {
                        Some(x) => x,
                        None => break,
                    },
                };
                let testcase_id = submission.testcase_id;
                let prefix = Arc::clone(&prefix);
                let raw_path_clone = raw_path.clone();
                let result = tokio::task::spawn_blocking(move || {
                    preprocess_one(prefix, &raw_path_clone)
                })
                .await
                .expect("preprocess task panicked");

                if !config.keep_raw_traces {
                    let _ = std::fs::remove_file(&raw_path);
                }

                let Some((trace, dropped)) = result else {
                    accum.outcomes.insert(testcase_id, None);
                    continue;
                };
                accum.outcomes.insert(testcase_id, Some(dropped));
                accum
                    .max_entries
                    .fetch_max(trace.entries.len() as u64, Ordering::Relaxed);

                if config.keep_preprocessed_traces {
                    let mut buf = Vec::new();
                    for entry in &trace.entries {
                        if entry.write_to(&mut buf).is_err() {
                            break;
                        }
                    }
                    let dir = config.preprocessed_trace_directory.clone();
                    let out = dir.join(format!("{testcase_id}.trace"));
                    let _ = tokio::task::spawn_blocking(move || {
                        std::fs::create_dir_all(&dir).and_then(|_| std::fs::write(&out, &buf))
                    })
                    .await;
                }

                if let Some(tx) = &compare_tx {
                    if tx.send((testcase_id, trace)).await.is_err() {
                        break;
                    }
                } else if let Some(tx) = &compress_tx {
                    if tx.send((testcase_id, trace)).await.is_err() {
                        break;
                    }
                }
            }
        })
    };
    drop(compare_tx);
    drop(compress_tx);

    // Compare: parallelism 1. The first trace to arrive becomes the
    // baseline; every later one is compared against it.
    let compare = compare_rx.map(|mut rx| {
        let cancel = cancel.clone();
        let accum = Arc::clone(&accum);
        let config = config.clone();
        tokio::spawn(async move {
            let mut baseline: Option<(u64, Arc<Trace>)> = None;
            loop {
                let (testcase_id, trace) = tokio::select! {
                    _ = cancel.cancelled() => break,
                    item = rx.recv() => match item {
                        Some(x) => x,
                        None => break,
                    },
                };
                let report = match &baseline {
                    None => None,
                    Some((baseline_id, baseline_trace)) => {
                        let outcome = comparator::compare(baseline_trace, &trace, config.granularity);
                        match outcome {
                            ComparisonOutcome::Diverge { index, class } => {
                                let name_a = accum
                                    .names
                                    .get(baseline_id)
                                    .map(|n| n.clone())
                                    .unwrap_or_else(|| baseline_id.to_string());
                                let name_b = accum
                                    .names
                                    .get(&testcase_id)
                                    .map(|n| n.clone())
                                    .unwrap_or_else(|| testcase_id.to_string());
                                let mut buf = Vec::new();
                                let _ = result_writer::write_mismatch_report(
                                    &mut buf,
                                    &name_a,
                                    &name_b,
                                    baseline_trace,
                                    &trace,
                                    outcome,
                                );
                                Some((result_writer::mismatch_file_name(class, index), buf))
                            }
                            ComparisonOutcome::Match => None,
                        }
                    }
                };
                if baseline.is_none() {
                    baseline = Some((testcase_id, Arc::new(trace)));
                }
                if let Some((file_name, buf)) = report {
                    let path = config.output_directory.join(file_name);
                    let dir = config.output_directory.clone();
                    let _ = tokio::task::spawn_blocking(move || -> std::io::Result<()> {
                        std::fs::create_dir_all(&dir)?;
                        std::fs::write(&path, &buf)
                    })
                    .await;
                }
            }
        })
    });

    // Compress: parallelism 4, digests (and for the two trace-shaped MI
    // modes, retains) every preprocessed testcase.
    let compress_workers: Vec<JoinHandle<()>> = match compress_rx {
        Some(rx) => (0..COMPRESS_PARALLELISM)
            .map(|_| {
                let cancel = cancel.clone();
                let accum = Arc::clone(&accum);
                let rx = Arc::clone(&rx);
                let granularity = config.granularity;
                let keep_traces = matches!(
                    config.analysis_mode,
                    AnalysisMode::MutualInformationTracePrefix
                        | AnalysisMode::MutualInformationSingleInstruction
                );
                let hash_pool = Arc::new(HashPool::new(COMPRESS_PARALLELISM));
                tokio::spawn(async move {
                    loop {
                        let (testcase_id, trace) = {
                            let mut rx = rx.lock().await;
                            tokio::select! {
                                _ = cancel.cancelled() => break,
                                item = rx.recv() => match item {
                                    Some(x) => x,
                                    None => break,
                                },
                            }
                        };
                        let digest = hash_pool.digest(&trace, granularity).await;
                        accum.whole_trace_digests.insert(testcase_id, digest);
                        if keep_traces {
                            accum.traces.insert(testcase_id, Arc::new(trace));
                        }
                    }
                })
            })
            .collect(),
        None => Vec::new(),
    };

    let _ = forward.await;
    let _ = generate.await;
    let _ = preprocess.await;
    if let Some(compare) = compare {
        let _ = compare.await;
    }
    for worker in compress_workers {
        let _ = worker.await;
    }

    let results = finalize(&config, &accum).await;
    let _ = results_tx.send(results);
}

/// Runs the configured analysis over whatever the stages accumulated and
/// writes its result files.
async fn finalize(config: &PipelineConfig, accum: &Accumulators) -> AnalysisResults {
    let testcases_processed = accum.outcomes.len() as u64;
    let dropped_records =
        accum
            .outcomes
            .iter()
            .fold(DroppedRecordCounts::default(), |mut acc, entry| {
                if let Some(counts) = entry.value() {
                    acc.unresolvable_address += counts.unresolvable_address;
                    acc.allocation_anomaly += counts.allocation_anomaly;
                    acc.stack_frame_miss += counts.stack_frame_miss;
                    acc.other += counts.other;
                }
                acc
            });
    let testcases_dropped = accum
        .outcomes
        .iter()
        .filter(|e| e.value().is_none())
        .count() as u64;

    let mut results = AnalysisResults {
        testcases_processed,
        testcases_dropped,
        dropped_records,
        mutual_information_path: None,
        mutual_information_instructions_path: None,
    };

    match config.analysis_mode {
        AnalysisMode::None | AnalysisMode::Compare => {}
        AnalysisMode::MutualInformationWholeTrace => {
            let samples: Vec<(u64, [u8; 16])> = accum
                .whole_trace_digests
                .iter()
                .map(|e| {
                    let original = accum.originals.get(e.key()).map(|r| *r).unwrap_or(*e.key());
                    (original, *e.value())
                })
                .collect();
            let mi = whole_trace::compute(samples, config.randomization_multiplier);
            let total_entries = accum.max_entries.load(Ordering::Relaxed) as usize;
            let path = write_output_file(&config.output_directory, "mutual_information.txt", move |w| {
                result_writer::write_whole_trace_mi(w, mi, total_entries)
            })
            .await;
            results.mutual_information_path = path;
        }
        AnalysisMode::MutualInformationTracePrefix => {
            let traces: Vec<(u64, Arc<Trace>)> = accum
                .traces
                .iter()
                .map(|e| {
                    let original = accum.originals.get(e.key()).map(|r| *r).unwrap_or(*e.key());
                    (original, Arc::clone(e.value()))
                })
                .collect();
            let pairs: Vec<(u64, &Trace)> = traces.iter().map(|(id, t)| (*id, t.as_ref())).collect();
            let mi = prefix_length::compute(&pairs, config.granularity, config.randomization_multiplier);
            let path = write_output_file(&config.output_directory, "mutual_information.txt", move |w| {
                result_writer::write_prefix_length_mi(w, &mi)
            })
            .await;
            results.mutual_information_path = path;
        }
        AnalysisMode::MutualInformationSingleInstruction => {
            let traces: Vec<(u64, Arc<Trace>)> = accum
                .traces
                .iter()
                .map(|e| {
                    let original = accum.originals.get(e.key()).map(|r| *r).unwrap_or(*e.key());
                    (original, Arc::clone(e.value()))
                })
                .collect();
            let pairs: Vec<(u64, &Trace)> = traces.iter().map(|(id, t)| (*id, t.as_ref())).collect();
            let mi = per_instruction::compute(&pairs, config.granularity, config.randomization_multiplier);
            let path = write_output_file(
                &config.output_directory,
                "mutual_information_instructions.txt",
                move |w| result_writer::write_per_instruction_mi(w, &mi),
            )
            .await;
            results.mutual_information_instructions_path = path;
        }
    }

    results
}

async fn write_output_file(
    dir: &Path,
    file_name: &str,
    write: impl FnOnce(&mut Vec<u8>) -> std::io::Result<()> + Send + 'static,
) -> Option<PathBuf> {
    let dir = dir.to_path_buf();
    let file_name = file_name.to_string();
    tokio::task::spawn_blocking(move || -> std::io::Result<PathBuf> {
        std::fs::create_dir_all(&dir)?;
        let path = dir.join(&file_name);
        let mut buf = Vec::new();
        write(&mut buf)?;
        std::fs::write(&path, &buf)?;
        Ok(path)
    })
    .await
    .expect("output file write task panicked")
    .ok()
}

// main.rs

// --- External Crate Imports ---
use anyhow::{anyhow, Error, Result};
use clap::Parser;
use denoise_bench::{
    config::{MotionQcPresets, PhenotypeConfig},
    confounds::{ConfoundLoader, FramewiseScrubber},
    connectome::Connectome,
    dof::DofAccountant,
    metric_table::{self, ColumnKey, HeaderLayout, MetricTable},
    modularity::ModularityEvaluator,
    phenotype::{self, PhenotypeTable},
    qcfc,
    strategy::{Strategy, StrategyRegistry},
    timeseries,
};
use indicatif::{ProgressBar, ProgressStyle};
use log::{debug, info, warn};
use std::{
    collections::BTreeMap,
    fs,
    path::{Path, PathBuf},
    time::Instant,
};

// --- Main Function ---
fn main() -> Result<(), Error> {
    let total_time_start = Instant::now();
    let cli_args = cli::CliArgs::parse();

    // Initialize logger
    let log_level = cli_args
        .log_level
        .parse::<log::LevelFilter>()
        .unwrap_or_else(|_| {
            eprintln!(
                "Warning: Invalid log level '{}' provided. Defaulting to Info.",
                cli_args.log_level
            );
            log::LevelFilter::Info
        });
    env_logger::Builder::new()
        .filter_level(log_level)
        .format_timestamp_micros()
        .init();

    info!("Starting denoise_bench with args: {:?}", cli_args);

    let registry = StrategyRegistry::from_path(&cli_args.strategy_file)
        .map_err(|e| anyhow!("Failed to load strategies from {}: {}", cli_args.strategy_file.display(), e))?;
    info!("Loaded {} denoising strategies.", registry.lookup_all().len());

    match &cli_args.command {
        cli::Command::Dof(args) => {
            let phenotype_config = match &cli_args.phenotype_config {
                Some(path) => PhenotypeConfig::from_path(path)?,
                None => PhenotypeConfig::default(),
            };
            run_dof(args, &registry, &phenotype_config)?;
        }
        cli::Command::Features(args) => run_features(args, &registry)?,
    }

    info!(
        "denoise_bench finished successfully in {:.2?}.",
        total_time_start.elapsed()
    );
    Ok(())
}

fn output_dir(output_root: &Path, dataset: &str, fmriprep_version: &str) -> PathBuf {
    output_root.join(dataset).join(fmriprep_version)
}

fn movement_path(dir: &Path, dataset: &str) -> PathBuf {
    dir.join(format!("dataset-{}_desc-movement_phenotype.tsv", dataset))
}

fn dof_path(dir: &Path, dataset: &str) -> PathBuf {
    dir.join(format!("dataset-{}_desc-confounds_phenotype.tsv", dataset))
}

fn dir_name(path: &Path) -> Option<String> {
    path.file_name().map(|n| n.to_string_lossy().into_owned())
}

// --- Step: Degrees of Freedom ---

fn discover_subject_dirs(fmriprep_dir: &Path, labels: &[String]) -> Result<Vec<PathBuf>> {
    let mut subject_dirs: Vec<PathBuf> = if labels.is_empty() {
        fs::read_dir(fmriprep_dir)?
            .filter_map(|entry| entry.ok().map(|e| e.path()))
            .filter(|path| {
                path.is_dir()
                    && path
                        .file_name()
                        .map_or(false, |name| name.to_string_lossy().starts_with("sub-"))
            })
            .collect()
    } else {
        labels
            .iter()
            .map(|label| {
                let label = label.strip_prefix("sub-").unwrap_or(label);
                fmriprep_dir.join(format!("sub-{}", label))
            })
            .filter(|path| {
                let exists = path.is_dir();
                if !exists {
                    warn!("Requested participant directory {} does not exist.", path.display());
                }
                exists
            })
            .collect()
    };
    subject_dirs.sort();
    Ok(subject_dirs)
}

fn run_dof(args: &cli::DofArgs, registry: &StrategyRegistry, phenotype_config: &PhenotypeConfig) -> Result<()> {
    let step_start = Instant::now();
    let dataset = match &args.dataset_name {
        Some(name) => name.clone(),
        None => args
            .fmriprep_dir
            .parent()
            .and_then(dir_name)
            .ok_or_else(|| anyhow!("Cannot infer a dataset name from {}", args.fmriprep_dir.display()))?,
    };
    let fmriprep_version = match &args.fmriprep_version {
        Some(version) => version.clone(),
        None => dir_name(&args.fmriprep_dir).unwrap_or_else(|| "fmriprep".to_string()),
    };
    let columns = phenotype_config.columns_for(&dataset)?;
    let participants_path = args
        .participants_tsv
        .clone()
        .unwrap_or_else(|| args.fmriprep_dir.join(phenotype::PARTICIPANTS_FILE));
    let participants = phenotype::load_participants(&participants_path)?;

    let out_dir = output_dir(&args.output_dir, &dataset, &fmriprep_version);
    fs::create_dir_all(&out_dir)?;

    // --- 1. Locate confounds files ---
    let subject_dirs = discover_subject_dirs(&args.fmriprep_dir, &args.participant_label)?;
    info!("Found {} subject directories in {}", subject_dirs.len(), args.fmriprep_dir.display());
    let mut confound_files: Vec<(String, PathBuf)> = Vec::new();
    for subject_dir in &subject_dirs {
        let Some(subject_id) = dir_name(subject_dir) else {
            continue;
        };
        let path = subject_dir
            .join("func")
            .join(format!("{}_{}_desc-confounds_timeseries.tsv", subject_id, args.specifier));
        if path.is_file() {
            debug!("Found confounds for {}", subject_id);
            confound_files.push((subject_id, path));
        } else {
            warn!("Missing confounds file for {}", subject_id);
        }
    }
    if confound_files.is_empty() {
        return Err(anyhow!(
            "No confounds files matching specifier '{}' under {}",
            args.specifier,
            args.fmriprep_dir.display()
        ));
    }

    // --- 2. Movement summary ---
    let mut mean_fd = BTreeMap::new();
    for (subject_id, path) in &confound_files {
        match phenotype::mean_framewise_displacement(path) {
            Ok(Some(fd)) => {
                mean_fd.insert(subject_id.clone(), fd);
            }
            Ok(None) => warn!("Framewise displacement column missing for subject {}", subject_id),
            Err(e) => warn!("Could not read confounds for {}: {}", subject_id, e),
        }
    }
    let movement = phenotype::movement_summary(&mean_fd, &participants, columns)?;
    let path_movement = movement_path(&out_dir, &dataset);
    movement.write(&path_movement)?;
    info!("Movement summary saved to: {}", path_movement.display());

    // --- 3. Degrees of freedom per strategy ---
    let loader = ConfoundLoader::new(FramewiseScrubber, args.aroma_dir.clone());
    let mut accountant = DofAccountant::new();
    let style = ProgressStyle::default_bar()
        .template("{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} confound loads ({percent}%) ETA: {eta}")
        .map_err(|e| anyhow!("Failed to create progress bar style: {}", e))?
        .progress_chars("=> ");
    let progress = ProgressBar::new((registry.lookup_all().len() * confound_files.len()) as u64).with_style(style);
    for strategy in registry.lookup_all() {
        info!("Processing strategy: {}", strategy.name);
        for (subject_id, path) in &confound_files {
            match loader.load(strategy, path) {
                Ok((confounds, mask)) => accountant.accumulate(subject_id, strategy, &confounds, &mask),
                Err(e) => warn!("[{}] Skipping {}: {}", strategy.name, subject_id, e),
            }
            progress.inc(1);
        }
    }
    progress.finish_and_clear();

    let path_dof = dof_path(&out_dir, &dataset);
    accountant.write(&path_dof)?;
    info!(
        "Confounds stats for {} subjects saved to: {} ({:.2?})",
        accountant.n_subjects(),
        path_dof.display(),
        step_start.elapsed()
    );
    Ok(())
}

// --- Step: Features ---

/// Metric tables being assembled for one invocation.
struct MetricCollection {
    connectome: Option<MetricTable>,
    qcfc: Option<MetricTable>,
    modularity: Option<MetricTable>,
}

impl MetricCollection {
    fn add(slot: &mut Option<MetricTable>, table: MetricTable) {
        *slot = Some(match slot.take() {
            Some(existing) => existing.merge_replace(table),
            None => table,
        });
    }
}

fn selected_strategies<'a>(registry: &'a StrategyRegistry, index: Option<usize>) -> Result<Vec<&'a Strategy>> {
    Ok(match index {
        Some(i) => vec![registry.by_index(i)?],
        None => registry.lookup_all().iter().collect(),
    })
}

fn load_phenotype(out_dir: &Path, dataset: &str, qc: &denoise_bench::config::MotionQc) -> Result<PhenotypeTable> {
    let path_movement = movement_path(out_dir, dataset);
    let mut phenotype = PhenotypeTable::read(&path_movement).map_err(|e| {
        anyhow!(
            "Cannot load movement summary {} (run the dof step first): {}",
            path_movement.display(),
            e
        )
    })?;
    let path_dof = dof_path(out_dir, dataset);
    let dof = if path_dof.is_file() {
        Some(MetricTable::read(&path_dof, HeaderLayout::Hierarchical)?)
    } else {
        None
    };
    phenotype::apply_motion_qc(&mut phenotype, dof.as_ref(), qc);
    Ok(phenotype)
}

fn run_features(args: &cli::FeaturesArgs, registry: &StrategyRegistry) -> Result<()> {
    let step_start = Instant::now();
    let input_path = &args.input_path;
    let dataset = match &args.dataset {
        Some(name) => name.clone(),
        None => input_path
            .parent()
            .and_then(dir_name)
            .ok_or_else(|| anyhow!("Cannot infer a dataset name from {}", input_path.display()))?,
    };
    let fmriprep_version = match &args.fmriprep_ver {
        Some(version) => version.clone(),
        None => dir_name(input_path)
            .ok_or_else(|| anyhow!("Cannot infer an fMRIPrep version from {}", input_path.display()))?,
    };
    let out_dir = output_dir(&args.output_path, &dataset, &fmriprep_version);
    fs::create_dir_all(&out_dir)?;
    info!("Dataset: {}, fMRIPrep version: {}, output: {}", dataset, fmriprep_version, out_dir.display());

    let regions = match &args.atlas_tsv {
        Some(path) => timeseries::load_atlas_region_labels(path)?,
        None => timeseries::load_region_labels(&input_path.join(timeseries::ROI_LABEL_FILE))?,
    };
    debug!("Loaded full ROI list with {} ROIs.", regions.len());

    let presets = match &args.qc_file {
        Some(path) => MotionQcPresets::from_path(path)?,
        None => MotionQcPresets::default(),
    };
    let motion_qc = presets.criteria(args.qc.as_deref())?;
    debug!("Motion QC criteria: {:?}", motion_qc);
    let phenotype = load_phenotype(&out_dir, &dataset, &motion_qc)?;

    let strategies = selected_strategies(registry, args.strategy_index)?;
    let metrics = args.metric.expand();
    let modularity = ModularityEvaluator::new(args.modularity_workers, args.seed);
    let mut collection = MetricCollection { connectome: None, qcfc: None, modularity: None };

    for strategy in strategies {
        let pattern = timeseries::file_pattern(&args.atlas, &args.dimension, &strategy.name);
        info!("Processing strategy: {} with file pattern: {}", strategy.name, pattern);
        if !timeseries::any_timeseries_for(input_path, &pattern) {
            warn!("No time series files found for strategy '{}', skipping.", strategy.name);
            continue;
        }

        let aligned = timeseries::align(input_path, &phenotype.subject_ids(), &pattern, &regions)?;
        if aligned.is_empty() {
            info!("Matching file pattern was: {}", pattern);
        }
        let (connectome, strategy_phenotype) = Connectome::from_timeseries(&aligned)?.intersect_with(&phenotype);
        info!("Loaded connectomes for {} subjects.", connectome.n_subjects());

        for metric in &metrics {
            match metric {
                cli::Metric::Connectome => {
                    let edge_rows = (0..connectome.edges.ncols()).map(|e| e.to_string()).collect();
                    let mut table = MetricTable::with_rows("", HeaderLayout::Flat, edge_rows);
                    table.insert_column(ColumnKey::flat(strategy.name.as_str()), connectome.mean_per_edge())?;
                    MetricCollection::add(&mut collection.connectome, table);
                }
                cli::Metric::Qcfc => {
                    info!("Computing QC-FC for strategy {}", strategy.name);
                    let table = qcfc::evaluate_groups(&strategy.name, &connectome, &strategy_phenotype)?;
                    MetricCollection::add(&mut collection.qcfc, table);
                }
                cli::Metric::Modularity => {
                    if let Some(table) = modularity.evaluate(&strategy.name, &connectome)? {
                        MetricCollection::add(&mut collection.modularity, table);
                    }
                }
                cli::Metric::All => {}
            }
        }
    }

    // --- Commit merged tables ---
    let canonical = registry.names();
    let outputs = [
        (cli::Metric::Connectome, collection.connectome),
        (cli::Metric::Qcfc, collection.qcfc),
        (cli::Metric::Modularity, collection.modularity),
    ];
    for (metric, table) in outputs {
        let Some(table) = table else {
            continue;
        };
        let output_file = out_dir.join(format!(
            "dataset-{}_atlas-{}_nroi-{}_{}.tsv",
            dataset,
            args.atlas,
            args.dimension,
            metric.file_label()
        ));
        metric_table::commit_merged(&output_file, table, &canonical)?;
        info!("Final metrics saved to {}", output_file.display());
    }
    info!("Feature step finished in {:.2?}", step_start.elapsed());
    Ok(())
}

mod cli {
    use clap::{Args, Parser, Subcommand, ValueEnum};
    use std::path::PathBuf;

    #[derive(Parser, Debug)]
    #[command(author, version, about = "Benchmark fMRI denoising strategies from fMRIPrep derivatives.", long_about = None, propagate_version = true)]
    pub(crate) struct CliArgs {
        #[command(subcommand)]
        pub(crate) command: Command,

        /// JSON file mapping strategy names to their parameters.
        #[arg(long, global = true, default_value = "benchmark_strategies.json")]
        pub(crate) strategy_file: PathBuf,

        /// JSON file mapping dataset ids to participants.tsv column names.
        #[arg(long, global = true)]
        pub(crate) phenotype_config: Option<PathBuf>,

        #[arg(long, global = true, default_value = "Info")]
        pub(crate) log_level: String,
    }

    #[derive(Subcommand, Debug)]
    pub(crate) enum Command {
        /// Movement summary and degrees-of-freedom loss per strategy.
        Dof(DofArgs),
        /// Connectome, QC-FC and modularity metrics per strategy.
        Features(FeaturesArgs),
    }

    #[derive(Args, Debug)]
    pub(crate) struct DofArgs {
        /// fMRIPrep derivative directory holding sub-* folders.
        pub(crate) fmriprep_dir: PathBuf,

        pub(crate) output_dir: PathBuf,

        /// Text between the subject id and `desc-confounds` in confound file names.
        #[arg(long, required = true)]
        pub(crate) specifier: String,

        #[arg(long)]
        pub(crate) dataset_name: Option<String>,

        #[arg(long)]
        pub(crate) fmriprep_version: Option<String>,

        #[arg(long)]
        pub(crate) participants_tsv: Option<PathBuf>,

        #[arg(long, num_args = 1..)]
        pub(crate) participant_label: Vec<String>,

        /// Root of the ICA-AROMA derivatives.
        #[arg(long)]
        pub(crate) aroma_dir: Option<PathBuf>,
    }

    #[derive(Args, Debug)]
    pub(crate) struct FeaturesArgs {
        /// Time series collection, `<dataset>/<fmriprep version>`.
        pub(crate) input_path: PathBuf,

        pub(crate) output_path: PathBuf,

        #[arg(long, required = true)]
        pub(crate) atlas: String,

        #[arg(long, required = true)]
        pub(crate) dimension: String,

        /// Atlas description whose second column lists the regions.
        #[arg(long)]
        pub(crate) atlas_tsv: Option<PathBuf>,

        /// Motion QC preset name.
        #[arg(long)]
        pub(crate) qc: Option<String>,

        #[arg(long)]
        pub(crate) qc_file: Option<PathBuf>,

        #[arg(long, value_enum, default_value_t = Metric::Connectome)]
        pub(crate) metric: Metric,

        /// 0-based index of a single strategy to run.
        #[arg(long)]
        pub(crate) strategy_index: Option<usize>,

        #[arg(long)]
        pub(crate) dataset: Option<String>,

        #[arg(long)]
        pub(crate) fmriprep_ver: Option<String>,

        #[arg(long, default_value_t = denoise_bench::modularity::DEFAULT_WORKERS)]
        pub(crate) modularity_workers: usize,

        #[arg(long, default_value_t = denoise_bench::modularity::DEFAULT_SEED)]
        pub(crate) seed: u64,
    }

    #[derive(ValueEnum, Clone, Copy, Debug, PartialEq, Eq)]
    pub(crate) enum Metric {
        Connectome,
        Qcfc,
        Modularity,
        All,
    }

    impl Metric {
        pub(crate) fn expand(self) -> Vec<Metric> {
            match self {
                Metric::All => vec![Metric::Connectome, Metric::Qcfc, Metric::Modularity],
                other => vec![other],
            }
        }

        pub(crate) fn file_label(self) -> &'static str {
            match self {
                Metric::Connectome => "connectome",
                Metric::Qcfc => "qcfc",
                Metric::Modularity => "modularity",
                Metric::All => "all",
            }
        }
    }
}

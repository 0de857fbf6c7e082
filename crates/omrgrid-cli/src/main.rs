//! omrgrid CLI: command-line interface for scoring answer-sheet photos.

use clap::{Args, Parser, Subcommand, ValueEnum};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use omrgrid::{
    AnswerKeySet, ArtifactKind, ArtifactSink, AuditRecord, Choice, Evaluator, MultiMarkPolicy,
    OmrError, OmrResult, RunConfig, SheetInput, SheetMarks, SheetTemplate,
};

type CliError = Box<dyn std::error::Error>;
type CliResult<T> = Result<T, CliError>;

#[derive(Parser)]
#[command(name = "omrgrid")]
#[command(about = "Score photographed OMR answer sheets and write per-sheet audit records")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Evaluate sheet images against an exam set's answer key.
    Evaluate(CliEvaluateArgs),

    /// Print a template summary (built-in default when no path is given).
    TemplateInfo {
        #[arg(long)]
        template: Option<PathBuf>,
    },

    /// Print the exam sets of an answer-key file.
    KeysInfo {
        #[arg(long)]
        keys: PathBuf,
    },

    /// Render a synthetic filled-in sheet.
    Render(CliRenderArgs),

    /// Print the default run configuration as JSON.
    DefaultConfig,

    /// Print the built-in template as JSON.
    DefaultTemplate,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum PolicyArg {
    ZeroCredit,
    Exclude,
    ManualReview,
}

impl PolicyArg {
    fn to_core(self) -> MultiMarkPolicy {
        match self {
            Self::ZeroCredit => MultiMarkPolicy::ZeroCredit,
            Self::Exclude => MultiMarkPolicy::Exclude,
            Self::ManualReview => MultiMarkPolicy::ManualReview,
        }
    }
}

#[derive(Debug, Clone, Args)]
struct CliEvaluateArgs {
    /// Sheet images (PNG, JPEG, ...). Sheet ids are taken from file stems.
    #[arg(required = true)]
    images: Vec<PathBuf>,

    /// Exam set printed on every sheet of this run.
    #[arg(long)]
    exam_set: String,

    /// Answer-key file (omrgrid.keys.v1 JSON).
    #[arg(long)]
    keys: PathBuf,

    /// Template JSON; the built-in 100-question sheet when omitted.
    #[arg(long)]
    template: Option<PathBuf>,

    /// Run configuration JSON; defaults when omitted.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Override the multi-mark policy from the configuration.
    #[arg(long, value_enum)]
    policy: Option<PolicyArg>,

    /// Directory for audit records (`<sheet>.audit.json`).
    #[arg(long)]
    out: PathBuf,

    /// Directory for overlay images; no images are written when omitted.
    #[arg(long)]
    artifacts: Option<PathBuf>,

    /// Also write the perspective-corrected sheet to the artifact directory.
    #[arg(long, requires = "artifacts")]
    retain_normalized: bool,
}

#[derive(Debug, Clone, Args)]
struct CliRenderArgs {
    /// Output image path.
    #[arg(long)]
    out: PathBuf,

    /// Marks as `question=letters`, comma separated (e.g. `1=A,3=BD`).
    #[arg(long, default_value = "")]
    marks: String,

    /// Template JSON; the built-in sheet when omitted.
    #[arg(long)]
    template: Option<PathBuf>,
}

/// Writes artifacts as PNG files under one directory.
struct DirectorySink {
    dir: PathBuf,
}

impl ArtifactSink for DirectorySink {
    fn store(
        &self,
        sheet_id: &str,
        kind: ArtifactKind,
        image: &image::DynamicImage,
    ) -> OmrResult<String> {
        let path = self.dir.join(format!("{sheet_id}.{}.png", kind.as_str()));
        image
            .save(&path)
            .map_err(|e| OmrError::Artifact(format!("{}: {e}", path.display())))?;
        Ok(path.display().to_string())
    }
}

fn main() -> CliResult<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Evaluate(args) => run_evaluate(&args),
        Commands::TemplateInfo { template } => run_template_info(template.as_deref()),
        Commands::KeysInfo { keys } => run_keys_info(&keys),
        Commands::Render(args) => run_render(&args),
        Commands::DefaultConfig => {
            println!("{}", serde_json::to_string_pretty(&RunConfig::default())?);
            Ok(())
        }
        Commands::DefaultTemplate => {
            println!("{}", SheetTemplate::default().to_json_string()?);
            Ok(())
        }
    }
}

fn load_template(path: Option<&Path>) -> CliResult<SheetTemplate> {
    match path {
        Some(p) => {
            tracing::info!("Loading template: {}", p.display());
            Ok(SheetTemplate::from_json_file(p)?)
        }
        None => Ok(SheetTemplate::default()),
    }
}

// ── template-info ─────────────────────────────────────────────────────

fn run_template_info(path: Option<&Path>) -> CliResult<()> {
    let t = load_template(path)?;
    let l = &t.lattice;

    println!("omrgrid template '{}'", t.name);
    println!("  canvas:         {}x{} px", t.canvas_px[0], t.canvas_px[1]);
    println!("  fiducials:      {}", t.fiducials.len());
    println!(
        "  lattice:        {} rows x {} blocks x {} choices",
        l.rows, l.blocks, l.choices
    );
    println!("  questions:      {}", t.question_count());
    println!(
        "  pitch:          choice {} px, row {} px, block {} px",
        l.choice_pitch_px, l.row_pitch_px, l.block_pitch_px
    );
    println!("  bubble radius:  {} px", l.bubble_radius_px);
    for s in &t.subjects {
        println!(
            "  subject:        {:<12} Q{}-Q{}",
            s.name, s.first_question, s.last_question
        );
    }

    Ok(())
}

// ── keys-info ─────────────────────────────────────────────────────────

fn run_keys_info(path: &Path) -> CliResult<()> {
    let keys = AnswerKeySet::from_json_file(path)?;

    println!("omrgrid answer keys ({})", path.display());
    println!("  exam sets:      {}", keys.len());
    for (id, key) in keys.exam_sets() {
        println!("  {:<14}  {} questions", id, key.len());
    }

    Ok(())
}

// ── render ────────────────────────────────────────────────────────────

fn parse_marks(spec: &str) -> CliResult<SheetMarks> {
    let mut marks = SheetMarks::new();
    for item in spec.split(',').map(str::trim).filter(|s| !s.is_empty()) {
        let (q, letters) = item
            .split_once('=')
            .ok_or_else(|| -> CliError { format!("mark '{item}' is not question=letters").into() })?;
        let q: u32 = q
            .trim()
            .parse()
            .map_err(|e| -> CliError { format!("invalid question in '{item}': {e}").into() })?;
        for c in letters.trim().chars() {
            let choice = Choice::from_letter(c)
                .ok_or_else(|| -> CliError { format!("invalid choice '{c}' in '{item}'").into() })?;
            marks = marks.mark(q, choice);
        }
    }
    Ok(marks)
}

fn run_render(args: &CliRenderArgs) -> CliResult<()> {
    let template = load_template(args.template.as_deref())?;
    let marks = parse_marks(&args.marks)?;
    let img = omrgrid::render_sheet(&template, &marks);
    img.save(&args.out)?;
    tracing::info!(
        "Rendered {} marked bubble(s) to {}",
        marks.len(),
        args.out.display()
    );
    Ok(())
}

// ── evaluate ──────────────────────────────────────────────────────────

fn sheet_id_of(path: &Path) -> String {
    path.file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.display().to_string())
}

/// Records are written as `<sheet id>.audit.json`, so two images with the
/// same file stem would overwrite each other.
fn check_unique_sheet_ids(paths: &[PathBuf]) -> CliResult<()> {
    let mut seen: HashMap<String, &Path> = HashMap::with_capacity(paths.len());
    for path in paths {
        if let Some(first) = seen.insert(sheet_id_of(path), path) {
            return Err(format!(
                "duplicate sheet id '{}' from {} and {}",
                sheet_id_of(path),
                first.display(),
                path.display()
            )
            .into());
        }
    }
    Ok(())
}

fn print_record(record: &AuditRecord) {
    match (record.score_summary(), record.failure()) {
        (Some(s), _) => println!(
            "{:<20} {:>3}/{:<3} multi={} ambiguous={}{}{}",
            record.sheet_id(),
            s.total,
            s.max_total,
            s.multi_mark_questions,
            s.ambiguous_questions,
            if s.review_required { " REVIEW" } else { "" },
            if s.sheet_flag.is_some() { " FLAGGED" } else { "" }
        ),
        (None, Some(f)) => println!(
            "{:<20} UNRESOLVABLE {:?} at {}: {}",
            record.sheet_id(),
            f.kind,
            f.stage,
            f.message
        ),
        (None, None) => println!("{:<20} (empty record)", record.sheet_id()),
    }
}

fn run_evaluate(args: &CliEvaluateArgs) -> CliResult<()> {
    let template = load_template(args.template.as_deref())?;
    let keys = AnswerKeySet::from_json_file(&args.keys)?;
    let mut config = match &args.config {
        Some(p) => RunConfig::from_json_file(p)?,
        None => RunConfig::default(),
    };
    if let Some(policy) = args.policy {
        config.multi_mark_policy = policy.to_core();
    }
    config.retain_normalized_image |= args.retain_normalized;

    let mut evaluator = Evaluator::with_config(template, keys, config)?;
    if let Some(dir) = &args.artifacts {
        std::fs::create_dir_all(dir)?;
        evaluator = evaluator.with_artifact_sink(Arc::new(DirectorySink { dir: dir.clone() }));
    }
    check_unique_sheet_ids(&args.images)?;
    std::fs::create_dir_all(&args.out)?;

    let mut inputs = Vec::with_capacity(args.images.len());
    for path in &args.images {
        let bytes = std::fs::read(path).map_err(|e| -> CliError {
            format!("Failed to read image {}: {}", path.display(), e).into()
        })?;
        inputs.push(SheetInput::from_bytes(sheet_id_of(path), &args.exam_set, bytes));
    }

    let records = evaluator.evaluate_batch(&inputs);
    let mut n_scored = 0usize;
    for record in &records {
        let path = args.out.join(format!("{}.audit.json", record.sheet_id()));
        std::fs::write(&path, record.to_json_string()?)?;
        n_scored += usize::from(record.is_scored());
        print_record(record);
    }
    tracing::info!(
        "{} of {} sheet(s) scored; records written to {}",
        n_scored,
        records.len(),
        args.out.display()
    );

    Ok(())
}

use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use pf_core::{
    AtomCatalog, EnergyConfig, EnergyEvaluator, EngineConfig, InputRecord,
    OutlineRenderer, Renderer, RuleContext, RuleSet, SynthesisResult, Synthesizer, export_json,
};
use pf_store::Store;

const DB_FILE: &str = "runs.db";

#[derive(Parser)]
#[command(name = "pf", about = "Phase-field program synthesis engine")]
struct Cli {
    /// Directory holding the run database (overrides PF_DATA_DIR)
    #[arg(long, global = true)]
    data_dir: Option<PathBuf>,

    /// Enable verbose debug output
    #[arg(long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Synthesize from an input record (.json or .toml)
    Synth {
        /// Input record path
        file: PathBuf,

        /// Persist the run and its certificate
        #[arg(long)]
        save: bool,

        /// Print the JSON export instead of the outline
        #[arg(long)]
        json: bool,

        /// Override the quality preset's generation budget
        #[arg(long)]
        max_generations: Option<usize>,

        /// Worker lanes assumed by the parallelize rule
        #[arg(long)]
        cores: Option<u32>,

        /// Suffix each outline line with its stage name
        #[arg(long)]
        stages: bool,
    },

    /// List saved runs, newest first
    Runs,

    /// Print a saved run's certificate
    Explain {
        /// Run id or unambiguous prefix
        id: String,
    },

    /// Replay a saved run's certificate and check every recorded energy
    Replay {
        /// Run id or unambiguous prefix
        id: String,

        /// Override the worker lanes recorded with the run
        #[arg(long)]
        cores: Option<u32>,
    },

    /// Show the atom catalog
    Catalog {
        #[arg(long)]
        json: bool,
    },

    /// Export a saved run to a JSON file
    Export {
        /// Run id or unambiguous prefix
        id: String,

        /// Output file path
        path: PathBuf,
    },

    /// Import a JSON export as a new run
    Import {
        /// Input file path
        path: PathBuf,
    },
}

fn data_dir(cli: &Cli) -> PathBuf {
    if let Some(dir) = &cli.data_dir {
        return dir.clone();
    }
    if let Ok(dir) = std::env::var("PF_DATA_DIR") {
        return PathBuf::from(dir);
    }
    let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
    PathBuf::from(home).join(".phasefield")
}

fn open_store(cli: &Cli) -> Result<Store> {
    let dir = data_dir(cli);
    std::fs::create_dir_all(&dir)
        .with_context(|| format!("failed to create data dir {}", dir.display()))?;
    Store::open(&dir.join(DB_FILE)).context("failed to open run store")
}

fn init_tracing(verbose: bool) {
    use tracing_subscriber::EnvFilter;

    let filter = if verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::from_default_env().add_directive(tracing::Level::WARN.into())
    };

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_ansi(false)
        .init();
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    match &cli.command {
        Commands::Synth {
            file,
            save,
            json,
            max_generations,
            cores,
            stages,
        } => cmd_synth(&cli, file, *save, *json, *max_generations, *cores, *stages),
        Commands::Runs => cmd_runs(&cli),
        Commands::Explain { id } => cmd_explain(&cli, id),
        Commands::Replay { id, cores } => cmd_replay(&cli, id, *cores),
        Commands::Catalog { json } => cmd_catalog(*json),
        Commands::Export { id, path } => cmd_export(&cli, id, path),
        Commands::Import { path } => cmd_import(&cli, path),
    }
}

fn read_input(path: &Path) -> Result<InputRecord> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read {}", path.display()))?;
    let is_toml = path
        .extension()
        .is_some_and(|ext| ext.eq_ignore_ascii_case("toml"));
    if is_toml {
        toml::from_str(&text).with_context(|| format!("invalid TOML in {}", path.display()))
    } else {
        serde_json::from_str(&text).with_context(|| format!("invalid JSON in {}", path.display()))
    }
}

fn cmd_synth(
    cli: &Cli,
    file: &Path,
    save: bool,
    json: bool,
    max_generations: Option<usize>,
    cores: Option<u32>,
    stages: bool,
) -> Result<()> {
    let input = read_input(file)?;
    let mut config = EngineConfig::for_input(&input).context("invalid input record")?;
    if let Some(n) = max_generations {
        config.max_generations = n;
    }
    if let Some(n) = cores {
        if n == 0 {
            bail!("--cores must be at least 1");
        }
        config.core_count = n;
    }

    let result = Synthesizer::new(config)
        .run(&input)
        .context("synthesis failed")?;

    if json {
        println!("{}", export_json(&result).context("failed to serialize result")?);
    } else {
        let renderer = OutlineRenderer {
            annotate_stages: stages,
            ..OutlineRenderer::default()
        };
        print!("{}", renderer.render(&result.final_graph, &result.architecture));
        println!();
        print_summary(&result);
    }

    if save {
        let store = open_store(cli)?;
        let id = store.save_run(&result).context("failed to save run")?;
        // Keep stdout clean for --json consumers.
        if json {
            eprintln!("saved run {id}");
        } else {
            println!("saved run {id}");
        }
    }
    Ok(())
}

fn print_summary(result: &SynthesisResult) {
    println!("task:        {}", result.task);
    println!(
        "energy:      {:.3} -> {:.3} ({:+.3})",
        result.initial_energy,
        result.final_energy,
        result.final_energy - result.initial_energy
    );
    println!("generations: {}", result.generations);
    println!("termination: {}", result.termination);
}

fn cmd_runs(cli: &Cli) -> Result<()> {
    let store = open_store(cli)?;
    let runs = store.list_runs().context("failed to list runs")?;
    if runs.is_empty() {
        println!("no runs");
        return Ok(());
    }
    for run in runs {
        let id = run.id.to_string();
        println!(
            "{}  {}  {:>3} gens  {:>10.3} -> {:<10.3}  {}  {}",
            &id[..8],
            run.created_at,
            run.generations,
            run.initial_energy,
            run.final_energy,
            run.termination,
            run.task,
        );
    }
    Ok(())
}

fn cmd_explain(cli: &Cli, id: &str) -> Result<()> {
    let store = open_store(cli)?;
    let id = store.resolve_run_id(id).context("unknown run")?;
    let certificate = store
        .load_certificate(id)
        .context("failed to load certificate")?;

    println!("run:         {id}");
    println!(
        "energy:      {:.3} -> {:.3}",
        certificate.initial_energy, certificate.final_energy
    );
    if certificate.is_empty() {
        println!("no rewrites applied");
        return Ok(());
    }
    for entry in certificate.entries() {
        for applied in &entry.rules_applied {
            println!(
                "gen {:>3}: {:.3} -> {:.3}  {} at {:?} (declared {:+.3}, observed {:+.3})",
                entry.generation_index,
                entry.previous_energy,
                entry.selected_energy,
                applied.rule,
                applied.site.iter().map(|n| n.0).collect::<Vec<_>>(),
                applied.delta,
                applied.observed_delta,
            );
        }
        for alt in &entry.alternatives {
            println!("         also scored {} at {:.3}", alt.rule, alt.energy);
        }
    }
    Ok(())
}

fn cmd_replay(cli: &Cli, id: &str, cores: Option<u32>) -> Result<()> {
    let store = open_store(cli)?;
    let id = store.resolve_run_id(id).context("unknown run")?;
    let result = store.load_run(id).context("failed to load run")?;

    let rules = RuleSet::standard();
    let energy = EnergyConfig::default();
    let ctx = match cores {
        Some(0) => bail!("--cores must be at least 1"),
        Some(n) => RuleContext::new(AtomCatalog::standard(), &energy, n),
        None => result.rule_context(&energy),
    };
    let evaluator = EnergyEvaluator::new(AtomCatalog::standard(), &result.architecture, &energy);
    result
        .certificate
        .verify(
            &result.initial_graph,
            &result.final_graph,
            &rules,
            &ctx,
            &evaluator,
        )
        .context("replay failed")?;

    println!(
        "replay ok: {} generations, final energy {:.3}",
        result.certificate.len(),
        result.final_energy
    );
    Ok(())
}

fn cmd_catalog(json: bool) -> Result<()> {
    let catalog = AtomCatalog::standard();
    if json {
        let kinds: Vec<_> = catalog.iter().collect();
        println!(
            "{}",
            serde_json::to_string_pretty(&kinds).context("failed to serialize catalog")?
        );
        return Ok(());
    }
    println!("{:<14} {:>7} {:>7}  flags", "atom", "energy", "phase");
    for kind in catalog.iter() {
        let mut flags = Vec::new();
        if kind.pure {
            flags.push("pure");
        }
        if kind.parallelizable {
            flags.push("parallelizable");
        }
        println!(
            "{:<14} {:>7.2} {:>7.1}  {}",
            kind.name,
            kind.base_energy,
            kind.default_phase_degrees,
            flags.join(",")
        );
    }
    Ok(())
}

fn cmd_export(cli: &Cli, id: &str, path: &Path) -> Result<()> {
    let store = open_store(cli)?;
    let id = store.resolve_run_id(id).context("unknown run")?;
    store
        .export_run_file(id, path)
        .context("failed to export run")?;
    println!("exported {id} to {}", path.display());
    Ok(())
}

fn cmd_import(cli: &Cli, path: &Path) -> Result<()> {
    let store = open_store(cli)?;
    let id = store
        .import_run_file(path)
        .context("failed to import run")?;
    println!("imported {} as run {id}", path.display());
    Ok(())
}

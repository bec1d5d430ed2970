use clap::{Parser, Subcommand, ValueEnum};
use serde_json::json;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use tracing::{debug, info, warn};

use lmnt::config::{JitMode, RuntimeConfig, Target};
use lmnt::logging;
use lmnt::vm::{Context, Def, Execution, LmntError};

// Wrapper types for clap ValueEnum support
#[derive(Debug, Clone, Copy, ValueEnum, Default)]
pub enum JitModeArg {
    Off,
    On,
    #[default]
    Auto,
}

impl From<JitModeArg> for JitMode {
    fn from(arg: JitModeArg) -> Self {
        match arg {
            JitModeArg::Off => JitMode::Off,
            JitModeArg::On => JitMode::On,
            JitModeArg::Auto => JitMode::Auto,
        }
    }
}

#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum TargetArg {
    Current,
    #[value(name = "x86-64")]
    X86_64,
    Armv7a,
    Armv7m,
    Arm64,
}

impl From<TargetArg> for Target {
    fn from(arg: TargetArg) -> Self {
        match arg {
            TargetArg::Current => Target::Current,
            TargetArg::X86_64 => Target::X86_64,
            TargetArg::Armv7a => Target::Armv7a,
            TargetArg::Armv7m => Target::Armv7m,
            TargetArg::Arm64 => Target::Arm64,
        }
    }
}

#[derive(Debug, Clone, Copy, ValueEnum, Default, PartialEq, Eq)]
pub enum OutputFormat {
    #[default]
    Human,
    Json,
}

#[derive(Parser)]
#[command(name = "lmnt")]
#[command(about = "Validate, run and compile LMNT archives", long_about = None)]
struct Cli {
    /// Configuration file (defaults to ./lmnt.toml when present)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Memory budget in bytes for the archive and the stack
    #[arg(long, global = true)]
    memory_size: Option<usize>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Check that an archive is well formed
    Validate {
        archive: PathBuf,
    },
    /// Describe an archive's segments and defs
    Info {
        archive: PathBuf,

        #[arg(long, value_enum, default_value = "human")]
        format: OutputFormat,
    },
    /// Run one def of an archive
    Run {
        archive: PathBuf,

        /// Name of the def to run
        #[arg(long)]
        def: String,

        /// Argument values, comma separated
        #[arg(long, value_delimiter = ',', allow_hyphen_values = true)]
        args: Vec<f32>,

        /// JIT compilation mode (off, on, auto); a bare --jit means on
        #[arg(long, value_enum, num_args = 0..=1, default_missing_value = "on")]
        jit: Option<JitModeArg>,

        /// JIT target
        #[arg(long, value_enum)]
        target: Option<TargetArg>,

        #[arg(long, value_enum, default_value = "human")]
        format: OutputFormat,
    },
    /// Compile one def to machine code without running it
    Compile {
        archive: PathBuf,

        #[arg(long)]
        def: String,

        #[arg(long, value_enum)]
        target: Option<TargetArg>,

        /// Print register allocation statistics
        #[arg(long)]
        stats: bool,

        /// Dump the generated code as hex
        #[arg(long)]
        hex: bool,
    },
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    if let Err(e) = logging::init() {
        eprintln!("warning: failed to initialise logging: {}", e);
    }

    let mut config = match RuntimeConfig::discover(cli.config.as_deref()) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("error: {}", e);
            return ExitCode::FAILURE;
        }
    };
    if let Some(size) = cli.memory_size {
        config.memory_size = size;
    }

    let result = match cli.command {
        Commands::Validate { archive } => validate_archive(&archive, &config),
        Commands::Info { archive, format } => show_info(&archive, &config, format),
        Commands::Run { archive, def, args, jit, target, format } => {
            if let Some(jit) = jit {
                config.jit = jit.into();
            }
            if let Some(target) = target {
                config.jit_target = target.into();
            }
            run_def(&archive, &config, &def, &args, format)
        }
        Commands::Compile { archive, def, target, stats, hex } => {
            if let Some(target) = target {
                config.jit_target = target.into();
            }
            config.collect_stats |= stats;
            compile_def(&archive, &config, &def, hex)
        }
    };

    if let Err(e) = result {
        eprintln!("error: {}", e);
        return ExitCode::FAILURE;
    }
    ExitCode::SUCCESS
}

fn describe(err: LmntError) -> String {
    match err {
        LmntError::InvalidArchive(detail) => format!("{} (code {})", err, detail.code()),
        _ => format!("{} (code {})", err, err.code()),
    }
}

/// Read `path` into a fresh context and prepare it.
fn load(path: &Path, config: &RuntimeConfig) -> Result<Context<'static>, String> {
    let data = std::fs::read(path).map_err(|e| format!("failed to read {}: {}", path.display(), e))?;
    info!(path = %path.display(), size = data.len(), "loading archive");
    let mut ctx = Context::new(config.memory_size).map_err(describe)?;
    ctx.load_archive(&data).map_err(describe)?;
    ctx.prepare_archive().map_err(describe)?;
    Ok(ctx)
}

fn validate_archive(path: &Path, config: &RuntimeConfig) -> Result<(), String> {
    let ctx = load(path, config)?;
    println!("{}: valid, {} stack values", path.display(), ctx.stack_count());
    Ok(())
}

fn def_name(ctx: &Context<'_>, def: &Def) -> String {
    ctx.archive()
        .get_string(def.name)
        .map(|s| s.into_owned())
        .unwrap_or_else(|_| format!("<{}>", def.name))
}

fn show_info(path: &Path, config: &RuntimeConfig, format: OutputFormat) -> Result<(), String> {
    let ctx = load(path, config)?;
    let archive = ctx.archive();
    let header = archive.get_header().map_err(describe)?;
    let defs = archive.defs().map_err(describe)?;
    let data_sections = archive.get_data_sections_count().map_err(describe)?;

    if format == OutputFormat::Json {
        let defs: Vec<_> = defs
            .iter()
            .map(|d| {
                json!({
                    "name": def_name(&ctx, d),
                    "kind": d.kind(),
                    "offset": d.offset,
                    "args": d.args_count,
                    "rvals": d.rvals_count,
                    "stack": d.stack_count_unaligned,
                    "backbranches": d.has_backbranches(),
                })
            })
            .collect();
        let out = json!({
            "version": format!("{}.{}", header.version_major, header.version_minor),
            "strings": header.strings_length,
            "defs_length": header.defs_length,
            "code": header.code_length,
            "data": header.data_length,
            "constants": ctx.constants_count(),
            "data_sections": data_sections,
            "stack_count": ctx.stack_count(),
            "defs": defs,
        });
        println!("{}", serde_json::to_string_pretty(&out).map_err(|e| e.to_string())?);
        return Ok(());
    }

    println!("version     {}.{}", header.version_major, header.version_minor);
    println!(
        "segments    strings {} / defs {} / code {} / data {} / constants {}",
        header.strings_length, header.defs_length, header.code_length, header.data_length, header.constants_length
    );
    println!("constants   {}", ctx.constants_count());
    println!("data        {} sections", data_sections);
    println!("stack       {} values", ctx.stack_count());
    println!();
    for d in &defs {
        println!(
            "{:<24} {:<9} args {:>3}  rvals {:>3}  stack {:>4}",
            def_name(&ctx, d),
            d.kind(),
            d.args_count,
            d.rvals_count,
            d.stack_count_unaligned
        );
    }
    Ok(())
}

fn run_def(path: &Path, config: &RuntimeConfig, name: &str, args: &[f32], format: OutputFormat) -> Result<(), String> {
    let mut ctx = load(path, config)?;
    let def = ctx.find_def(name).map_err(|e| format!("def '{}': {}", name, describe(e)))?;
    if args.len() != def.args_count as usize {
        return Err(format!("def '{}' takes {} arguments, got {}", name, def.args_count, args.len()));
    }
    ctx.update_args(&def, 0, args).map_err(describe)?;

    let mut rvals = vec![0.0f32; def.rvals_count as usize];
    let (execution, jitted) = execute(&mut ctx, &def, config, &mut rvals)?;
    match execution {
        Execution::Complete(count) => rvals.truncate(count),
        Execution::Interrupted => return Err(format!("def '{}' was interrupted", name)),
    }
    debug!(def = name, jit = jitted, "def finished");

    match format {
        OutputFormat::Json => {
            let out = json!({ "def": name, "jit": jitted, "rvals": rvals });
            println!("{}", out);
        }
        OutputFormat::Human => {
            let values: Vec<String> = rvals.iter().map(|v| v.to_string()).collect();
            println!("{}", values.join(" "));
        }
    }
    Ok(())
}

/// Run `def`, compiled when the configuration asks for it. Returns whether
/// compiled code was used.
#[cfg(all(feature = "jit", any(unix, windows)))]
fn execute(ctx: &mut Context<'_>, def: &Def, config: &RuntimeConfig, rvals: &mut [f32]) -> Result<(Execution, bool), String> {
    use lmnt::jit::{self, CompileOptions};

    if !config.use_jit(jit::has_backend(config.jit_target)) {
        return ctx.execute(def, Some(rvals)).map(|e| (e, false)).map_err(describe);
    }
    let function = jit::compile(ctx, def, &CompileOptions::from(config)).map_err(describe)?;
    if config.collect_stats {
        let stats = function.stats();
        info!(codesize = stats.codesize, reg_alloc = stats.reg_alloc, fallbacks = stats.fallbacks, "compiled");
    }
    if !function.is_executable() {
        if config.jit == JitMode::On {
            return Err(format!("code for {} cannot run on this host", function.target()));
        }
        warn!(target = %function.target(), "compiled code is not executable here, interpreting");
        return ctx.execute(def, Some(rvals)).map(|e| (e, false)).map_err(describe);
    }
    jit::jit_execute(ctx, &function, Some(rvals)).map(|e| (e, true)).map_err(describe)
}

#[cfg(not(all(feature = "jit", any(unix, windows))))]
fn execute(ctx: &mut Context<'_>, def: &Def, config: &RuntimeConfig, rvals: &mut [f32]) -> Result<(Execution, bool), String> {
    if config.jit == JitMode::On {
        return Err(describe(LmntError::FeatureDisabled));
    }
    ctx.execute(def, Some(rvals)).map(|e| (e, false)).map_err(describe)
}

#[cfg(all(feature = "jit", any(unix, windows)))]
fn compile_def(path: &Path, config: &RuntimeConfig, name: &str, hex: bool) -> Result<(), String> {
    use lmnt::jit::{self, CompileOptions};

    let ctx = load(path, config)?;
    let def = ctx.find_def(name).map_err(|e| format!("def '{}': {}", name, describe(e)))?;
    let function = jit::compile(&ctx, &def, &CompileOptions::from(config)).map_err(describe)?;
    println!("{}: {} bytes for {}", name, function.bytes().len(), function.target());
    if config.collect_stats {
        let stats = function.stats();
        println!("{}", serde_json::to_string_pretty(&stats).map_err(|e| e.to_string())?);
    }
    if hex {
        for (i, chunk) in function.bytes().chunks(16).enumerate() {
            let line: Vec<String> = chunk.iter().map(|b| format!("{:02x}", b)).collect();
            println!("{:08x}  {}", i * 16, line.join(" "));
        }
    }
    Ok(())
}

#[cfg(not(all(feature = "jit", any(unix, windows))))]
fn compile_def(_path: &Path, _config: &RuntimeConfig, _name: &str, _hex: bool) -> Result<(), String> {
    Err(describe(LmntError::FeatureDisabled))
}

use clap::{Parser, Subcommand, ValueEnum};
use std::path::{Path, PathBuf};
use std::process::ExitCode;

use c0vm::config::{RuntimeConfig, StatsFormat};
use c0vm::vm::bytecode;
use c0vm::vm::{ErrorKind, VM, VmError, VmStats, dump};
use tracing_subscriber::EnvFilter;
use tracing_subscriber::filter::Directive;

/// Exit status for files that fail to load and for usage errors.
const EXIT_LOAD: u8 = 2;

#[derive(Debug, Clone, Copy, ValueEnum, Default)]
pub enum StatsFormatArg {
    #[default]
    Human,
    Json,
}

impl From<StatsFormatArg> for StatsFormat {
    fn from(arg: StatsFormatArg) -> Self {
        match arg {
            StatsFormatArg::Human => StatsFormat::Human,
            StatsFormatArg::Json => StatsFormat::Json,
        }
    }
}

#[derive(Parser)]
#[command(name = "c0vm")]
#[command(about = "A virtual machine for C0 bytecode", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a .bc0 file
    Run {
        /// The bytecode file to run
        file: PathBuf,

        /// Configuration file (defaults to ./c0vm.toml if present)
        #[arg(long, value_name = "PATH")]
        config: Option<PathBuf>,

        /// Trace every executed instruction to stderr
        #[arg(long)]
        trace: bool,

        /// Profile opcode execution counts
        #[arg(long)]
        profile_opcodes: bool,

        /// Print execution statistics (human or json format)
        #[arg(long, value_enum, require_equals = true, num_args = 0..=1, default_missing_value = "human")]
        stats: Option<StatsFormatArg>,

        /// Print the value returned by main
        #[arg(long)]
        print_result: bool,
    },
    /// Disassemble a .bc0 file
    Dump {
        /// The bytecode file to disassemble
        file: PathBuf,
    },
    /// Load and validate a .bc0 file without running it
    Check {
        /// The bytecode file to check
        file: PathBuf,
    },
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    match cli.command {
        Commands::Run {
            file,
            config,
            trace,
            profile_opcodes,
            stats,
            print_result,
        } => {
            let cwd = std::env::current_dir().unwrap_or_else(|_| PathBuf::from("."));
            let mut runtime = match RuntimeConfig::discover(config.as_deref(), &cwd) {
                Ok(c) => c,
                Err(e) => {
                    eprintln!("c0vm: {}", e);
                    return ExitCode::from(EXIT_LOAD);
                }
            };
            runtime.trace |= trace;
            runtime.profile_opcodes |= profile_opcodes;
            if let Some(format) = stats {
                runtime.stats = Some(format.into());
            }

            init_logging(&runtime);
            run_file(&file, &runtime, print_result)
        }
        Commands::Dump { file } => {
            init_logging(&RuntimeConfig::default());
            match bytecode::load_file(&file) {
                Ok(program) => {
                    print!("{}", dump::disassemble(&program));
                    ExitCode::SUCCESS
                }
                Err(e) => {
                    eprintln!("c0vm: {}: {}", file.display(), e);
                    ExitCode::from(EXIT_LOAD)
                }
            }
        }
        Commands::Check { file } => {
            init_logging(&RuntimeConfig::default());
            match bytecode::load_file(&file) {
                Ok(program) => {
                    println!(
                        "{}: ok ({} functions, {} natives)",
                        file.display(),
                        program.functions.len(),
                        program.natives.len()
                    );
                    ExitCode::SUCCESS
                }
                Err(e) => {
                    eprintln!("c0vm: {}: {}", file.display(), e);
                    ExitCode::from(EXIT_LOAD)
                }
            }
        }
    }
}

/// Install the stderr log subscriber: `C0VM_LOG`, then the config's `log`,
/// then `warn`.
fn init_logging(config: &RuntimeConfig) {
    let mut filter = EnvFilter::try_from_env("C0VM_LOG").unwrap_or_else(|_| {
        let directive = config.log.as_deref().unwrap_or("warn");
        EnvFilter::try_new(directive).unwrap_or_else(|_| EnvFilter::new("warn"))
    });
    if config.trace {
        if let Ok(directive) = "c0vm=trace".parse::<Directive>() {
            filter = filter.add_directive(directive);
        }
    }

    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .try_init();
}

fn run_file(path: &Path, config: &RuntimeConfig, print_result: bool) -> ExitCode {
    let program = match bytecode::load_file(path) {
        Ok(p) => p,
        Err(e) => {
            eprintln!("c0vm: {}: {}", path.display(), e);
            return ExitCode::from(EXIT_LOAD);
        }
    };

    let mut vm = VM::new();
    vm.set_trace(config.trace);
    vm.set_profile_opcodes(config.profile_opcodes);

    let result = vm.run(&program);

    if config.profile_opcodes {
        print_profile(&vm.opcode_profile());
    }
    if let Some(format) = config.stats {
        print_stats(vm.stats(), format);
    }

    match result {
        Ok(value) => {
            if print_result {
                println!("Result: {}", value);
            }
            ExitCode::from(value as u8)
        }
        Err(e) => {
            eprintln!("c0vm: {}", e);
            ExitCode::from(exit_status(&e))
        }
    }
}

/// Exit status for a runtime error, mirroring the signal a C VM dies with.
fn exit_status(err: &VmError) -> u8 {
    match err.kind() {
        ErrorKind::User => 1,
        ErrorKind::Assertion => 134,
        ErrorKind::Arithmetic => 136,
        ErrorKind::Memory => 139,
        ErrorKind::InvalidOpcode | ErrorKind::Contract => 3,
    }
}

fn print_profile(profile: &[(&str, u64)]) {
    let total: u64 = profile.iter().map(|(_, n)| n).sum();
    eprintln!("--- opcode profile ({} instructions) ---", total);
    for (name, count) in profile {
        let pct = if total > 0 {
            *count as f64 * 100.0 / total as f64
        } else {
            0.0
        };
        eprintln!("{:>14} {:>12} {:>6.2}%", name, count, pct);
    }
}

fn print_stats(stats: &VmStats, format: StatsFormat) {
    match format {
        StatsFormat::Human => {
            eprintln!("--- execution stats ---");
            eprintln!("instructions:   {}", stats.instructions);
            eprintln!("calls:          {}", stats.calls);
            eprintln!("native calls:   {}", stats.native_calls);
            eprintln!("max call depth: {}", stats.max_call_depth);
            eprintln!("heap blocks:    {}", stats.heap_blocks);
            eprintln!("heap bytes:     {}", stats.heap_bytes);
        }
        StatsFormat::Json => match serde_json::to_string(stats) {
            Ok(json) => eprintln!("{}", json),
            Err(e) => eprintln!("c0vm: cannot serialize stats: {}", e),
        },
    }
}

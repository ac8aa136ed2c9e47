// Command-line driver: parse a textual IR file, compile it for the selected instruction
// set variant, and write a relocatable ELF object next to the input (or wherever -o says).

use clap::Parser;
use lower32::core::InstructionSet;
use lower32::{compile_unit, parse_module, print_module, write_object, TargetConfig};
use std::path::PathBuf;
use std::process::ExitCode;

#[derive(Parser)]
#[command(version, about = "32-bit x86 code generator for textual IR modules")]
struct Args {
    /// Input textual IR file.
    input: PathBuf,

    /// Output object file; defaults to the input with a `.o` extension.
    #[arg(short, long)]
    output: Option<PathBuf>,

    /// Instruction set variant to target.
    #[arg(long, value_enum, default_value_t = Isa::Sse2)]
    isa: Isa,

    /// Worker threads; 0 means one per available core.
    #[arg(long, default_value_t = 0)]
    workers: usize,

    /// What to produce: an object file, or the module reprinted in
    /// canonical textual form (useful for normalizing fixtures).
    #[arg(long, value_enum, default_value_t = Emit::Obj)]
    emit: Emit,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
enum Emit {
    Obj,
    Ir,
}

#[derive(Debug, Clone, Copy, clap::ValueEnum)]
enum Isa {
    /// Baseline variant, SSE2 only.
    Sse2,
    /// Extended variant, may use SSE4.1 forms.
    #[value(name = "sse4.1")]
    Sse41,
}

impl From<Isa> for InstructionSet {
    fn from(isa: Isa) -> Self {
        match isa {
            Isa::Sse2 => InstructionSet::Sse2,
            Isa::Sse41 => InstructionSet::Sse41,
        }
    }
}

fn run(args: &Args) -> Result<(), Box<dyn std::error::Error>> {
    let src = std::fs::read_to_string(&args.input)
        .map_err(|e| format!("{}: {e}", args.input.display()))?;
    let module = parse_module(&src)?;

    if args.emit == Emit::Ir {
        print!("{}", print_module(&module));
        return Ok(());
    }

    let workers = if args.workers == 0 {
        std::thread::available_parallelism().map(|n| n.get()).unwrap_or(1)
    } else {
        args.workers
    };
    let config = TargetConfig {
        instruction_set: args.isa.into(),
    };
    let unit = compile_unit(&module, config, workers)?;
    let bytes = write_object(&unit)?;

    let output = args
        .output
        .clone()
        .unwrap_or_else(|| args.input.with_extension("o"));
    std::fs::write(&output, bytes).map_err(|e| format!("{}: {e}", output.display()))?;
    log::info!("wrote {}", output.display());
    Ok(())
}

fn main() -> ExitCode {
    env_logger::init();
    let args = Args::parse();
    match run(&args) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("error: {e}");
            ExitCode::FAILURE
        }
    }
}

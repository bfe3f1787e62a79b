use std::error::Error;
use std::fs;
use std::io::{self, Write};
use std::num::{NonZeroUsize, ParseIntError};
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use clap::{Args, Parser, Subcommand};

use regex_trace::{
    Automaton, Flag, MatchFlags, MatchOptions, MatchState, MatchWorker, Matcher, Response,
    ResponseData, SessionId, WorkerError,
};

#[derive(Parser)]
#[command(name = "retrace", version, about = "Trace a backtracking regex match step by step")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Output DOT (Graphviz) representation of the automaton
    Dot { pattern: String },
    /// Match pattern against one or more inputs
    Match(MatchArgs),
}

#[derive(Args)]
struct MatchArgs {
    pattern: String,

    #[arg(required = true)]
    inputs: Vec<String>,

    /// Deliver the trace in batches of N steps
    #[arg(long, value_name = "N")]
    batch_size: Option<NonZeroUsize>,

    /// Enable a flag by name, e.g. shorten-backtracking (repeatable)
    #[arg(long = "flag", value_name = "NAME")]
    flag: Vec<Flag>,

    /// Enable flags by their numeric encoding (decimal or 0x-prefixed)
    #[arg(long, value_name = "BITS", value_parser = parse_bits)]
    flags: Option<u32>,

    /// JSON file holding `flags` and `batch_size`
    #[arg(long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Print every response as a line of JSON
    #[arg(long)]
    json: bool,

    /// Print the recorded steps
    #[arg(long)]
    trace: bool,

    /// Dump the automaton and every response to stderr
    #[arg(long)]
    debug: bool,

    /// Run the matcher on a worker thread
    #[arg(long)]
    worker: bool,
}

fn parse_bits(s: &str) -> Result<u32, ParseIntError> {
    match s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        Some(hex) => u32::from_str_radix(hex, 16),
        None => s.parse(),
    }
}

/// Config file first, then `--flags`, `--flag` and `--batch-size` on top.
fn load_options(args: &MatchArgs) -> Result<MatchOptions, String> {
    let mut options: MatchOptions = match &args.config {
        Some(path) => {
            let text = fs::read_to_string(path)
                .map_err(|e| format!("failed to read {}: {e}", path.display()))?;
            serde_json::from_str(&text)
                .map_err(|e| format!("invalid config {}: {e}", path.display()))?
        }
        None => MatchOptions::default(),
    };
    if let Some(bits) = args.flags {
        options.flags = MatchFlags::from_bits(options.flags.bits() | bits);
    }
    for &flag in &args.flag {
        options.flags.set(flag, true);
    }
    if args.batch_size.is_some() {
        options.batch_size = args.batch_size;
    }
    Ok(options)
}

fn compile_pattern(pattern: &str) -> Option<Automaton> {
    regex_trace::compile(pattern)
        .map_err(|e| eprintln!("error: {e}"))
        .ok()
}

// ---------------------------------------------------------------------------
// Backends
// ---------------------------------------------------------------------------

enum Backend {
    Local(Matcher),
    Worker(MatchWorker),
}

impl Backend {
    fn match_string(
        &mut self,
        input: &str,
        batch_size: Option<NonZeroUsize>,
    ) -> Result<Response, WorkerError> {
        match self {
            Backend::Local(matcher) => Ok(matcher.match_string(input, batch_size)),
            Backend::Worker(worker) => worker.match_string(input, batch_size),
        }
    }

    fn next_batch(&mut self, session: SessionId) -> Result<Option<Response>, WorkerError> {
        match self {
            Backend::Local(matcher) => Ok(matcher.next_batch(session)),
            Backend::Worker(worker) => worker.next_batch(session),
        }
    }
}

// ---------------------------------------------------------------------------
// Commands
// ---------------------------------------------------------------------------

fn run_dot(pattern: &str) -> ExitCode {
    let Some(automaton) = compile_pattern(pattern) else {
        return ExitCode::FAILURE;
    };
    let stdout = io::stdout();
    let mut out = stdout.lock();
    if let Err(e) = automaton.to_dot(&mut out).and_then(|()| out.flush()) {
        eprintln!("error: {e}");
        return ExitCode::FAILURE;
    }
    ExitCode::SUCCESS
}

fn print_trace(states: &[MatchState]) {
    for (i, state) in states.iter().enumerate() {
        let action = state
            .action
            .map(|action| format!(" {:?}", action))
            .unwrap_or_default();
        println!(
            "  {:>5} {:<15} regAt {:?} strAt {:?}{}",
            i,
            state.ty.as_str(),
            state.reg_at,
            state.str_at,
            action
        );
    }
}

/// Run one input to its terminal response.  Returns whether it matched.
fn trace_input(
    backend: &mut Backend,
    input: &str,
    options: &MatchOptions,
    args: &MatchArgs,
) -> Result<bool, Box<dyn Error>> {
    let mut states = Vec::new();
    let mut response = backend.match_string(input, options.batch_size)?;
    loop {
        if args.debug {
            eprintln!("[{}] {:#?}", response.session, response.data);
        }
        if args.json {
            println!("{}", serde_json::to_string(&response)?);
        }
        let session = response.session;
        match response.data {
            ResponseData::Batch(batch) => states.extend(batch.match_states),
            ResponseData::Success(data) | ResponseData::NoMatch(data) => {
                states.extend(data.states);
                if !args.json {
                    match (data.start, data.end) {
                        (Some(start), Some(end)) if data.success => {
                            println!("  \x1b[32mMATCH\x1b[0m [{start},{end}]  {:?}", input)
                        }
                        _ => println!("  \x1b[31mNO MATCH\x1b[0m  {:?}", input),
                    }
                    for (index, group) in data.groups.iter().flatten() {
                        let name = group.name.as_deref().unwrap_or("");
                        println!(
                            "    group {index} {name} [{},{}]",
                            group.str_at[0], group.str_at[1]
                        );
                    }
                    if args.trace {
                        print_trace(&states);
                    }
                }
                return Ok(data.success);
            }
            ResponseData::Error(err) => return Err(err.into()),
            ResponseData::Aborted => return Err("session aborted".into()),
        }
        response = backend
            .next_batch(session)?
            .ok_or("session ended without a terminal response")?;
    }
}

fn run_match(args: &MatchArgs) -> ExitCode {
    let options = match load_options(args) {
        Ok(options) => options,
        Err(msg) => {
            eprintln!("error: {msg}");
            return ExitCode::FAILURE;
        }
    };
    let Some(automaton) = compile_pattern(&args.pattern) else {
        return ExitCode::FAILURE;
    };
    let automaton = Arc::new(automaton);

    eprintln!("pattern: {}", args.pattern);
    eprintln!("nodes: {}", automaton.len());
    eprintln!("flags: {:#x}", options.flags.bits());
    if let Some(size) = options.batch_size {
        eprintln!("batch_size: {size}");
    }
    eprintln!();
    if args.debug {
        eprintln!("{:#?}", automaton);
    }

    let mut backend = if args.worker {
        match MatchWorker::spawn(automaton, options.flags) {
            Ok(worker) => Backend::Worker(worker),
            Err(e) => {
                eprintln!("error: failed to start worker: {e}");
                return ExitCode::FAILURE;
            }
        }
    } else {
        Backend::Local(Matcher::new(automaton, options.flags))
    };

    let mut any_failed = false;
    for input in &args.inputs {
        match trace_input(&mut backend, input, &options, args) {
            Ok(matched) => any_failed |= !matched,
            Err(e) => {
                eprintln!("error: {:?}: {e}", input);
                any_failed = true;
            }
        }
    }

    if any_failed {
        ExitCode::FAILURE
    } else {
        ExitCode::SUCCESS
    }
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    match &cli.command {
        Command::Dot { pattern } => run_dot(pattern),
        Command::Match(args) => run_match(args),
    }
}

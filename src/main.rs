use std::io::{self, BufRead, IsTerminal, Write};
use std::path::{Path, PathBuf};
use std::process::ExitCode;

use clap::{Parser, Subcommand};

use quill::diagnostic::{self, Diagnostic, ansi::AnsiRenderer, registry};
use quill::value::Payload;
use quill::{Error, Interpreter, Options, artifact, bytecode};

#[derive(Parser, Debug)]
#[command(name = "quill", version, about = "Run quill scripts", long_about = None)]
#[command(args_conflicts_with_subcommands = true)]
struct Cli {
    #[command(subcommand)]
    command: Option<Command>,

    /// Script to run; starts a REPL when omitted
    file: Option<PathBuf>,

    /// Run CODE instead of a file
    #[arg(short = 'e', long = "eval", value_name = "CODE", conflicts_with = "file")]
    eval: Option<String>,

    /// Print the bytecode of every compiled function instead of running
    #[arg(long)]
    disassemble: bool,

    /// Report errors as one JSON object per line
    #[arg(long)]
    json_errors: bool,

    /// Print the long explanation of an error code and exit
    #[arg(long, value_name = "CODE")]
    explain: Option<String>,

    /// Trace every executed instruction to stderr
    #[arg(long)]
    debug: bool,

    /// Module search path (colon separated), overrides QUILL_PATH
    #[arg(long, value_name = "PATH")]
    search_path: Option<String>,

    /// Heap size that triggers the first collection
    #[arg(long, value_name = "OBJECTS")]
    gc_trigger: Option<usize>,

    /// Increase log output (-v debug, -vv trace)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Compile a source module into a pre-built .qlc image
    Build {
        input: PathBuf,
        /// Output path; defaults to the input with a .qlc extension
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
}

/// Renders errors the way the command line asked for.
struct Reporter {
    json: bool,
}

impl Reporter {
    fn report(&self, err: &Error, main: Option<(&str, &str)>) {
        let mut d = Diagnostic::from(err);
        if let Error::Compile(e) = err {
            let source = match main {
                Some((name, source)) if name == e.filename => Some(source.to_string()),
                _ => std::fs::read_to_string(&e.filename).ok(),
            };
            if let Some(source) = source {
                d = d.with_source(source);
            }
        }
        self.emit(&d);
    }

    fn emit(&self, d: &Diagnostic) {
        if self.json {
            eprintln!("{}", diagnostic::json::render(d));
        } else {
            let renderer = AnsiRenderer { use_color: io::stderr().is_terminal() };
            eprint!("{}", renderer.render(d));
        }
    }
}

fn options(cli: &Cli) -> Options {
    let mut options = Options::default();
    if let Some(path) = &cli.search_path {
        options.search_path = path.clone();
    }
    if let Some(trigger) = cli.gc_trigger {
        options.gc_initial_trigger = trigger.max(1);
    }
    options.debug = cli.debug;
    options
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    let level = match cli.verbose {
        0 => "warn",
        1 => "debug",
        _ => "trace",
    };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level)).init();

    let reporter = Reporter { json: cli.json_errors };

    if let Some(code) = &cli.explain {
        return match registry::lookup(code) {
            Some(entry) => {
                print!("{}", entry.long);
                ExitCode::SUCCESS
            }
            None => {
                eprintln!("unknown error code '{code}'");
                ExitCode::FAILURE
            }
        };
    }

    if let Some(Command::Build { input, output }) = &cli.command {
        return build(input, output.as_deref(), &reporter);
    }

    let mut interp = Interpreter::with_options(options(&cli));
    let code = match (&cli.eval, &cli.file) {
        (Some(code), _) => run_source(&mut interp, code, "<inline>", cli.disassemble, &reporter),
        (None, Some(path)) => match std::fs::read_to_string(path) {
            Ok(source) => {
                let name = path.to_string_lossy();
                run_source(&mut interp, &source, &name, cli.disassemble, &reporter)
            }
            Err(source) => {
                let err = Error::Io { path: path.display().to_string(), source };
                reporter.report(&err, None);
                ExitCode::FAILURE
            }
        },
        (None, None) => repl(&mut interp, &reporter),
    };
    interp.flush_output();
    code
}

fn run_source(interp: &mut Interpreter, source: &str, name: &str, disassemble: bool, reporter: &Reporter) -> ExitCode {
    let closure = match interp.compile(source, name) {
        Ok(closure) => closure,
        Err(e) => {
            reporter.report(&Error::Compile(e), Some((name, source)));
            return ExitCode::FAILURE;
        }
    };
    if disassemble {
        print_functions(interp);
        return ExitCode::SUCCESS;
    }
    match interp.call(closure, &[]) {
        Ok(_) => ExitCode::SUCCESS,
        Err(err) => {
            interp.flush_output();
            reporter.report(&err, Some((name, source)));
            ExitCode::FAILURE
        }
    }
}

/// Every function in the constant pool, nested ones before their parent.
fn print_functions(interp: &Interpreter) {
    for constant in interp.constants() {
        let Some(obj) = constant.as_object() else { continue };
        if let Payload::Function(function) = &*obj.payload() {
            print!("{}", bytecode::disassemble(function));
        }
    }
}

fn repl(interp: &mut Interpreter, reporter: &Reporter) -> ExitCode {
    let interactive = io::stdin().is_terminal();
    let mut line = String::new();
    let mut stdin = io::stdin().lock();
    loop {
        if interactive {
            print!("> ");
            if let Err(err) = io::stdout().flush() {
                log::warn!("cannot flush prompt: {err}");
            }
        }
        line.clear();
        match stdin.read_line(&mut line) {
            Ok(0) => break,
            Ok(_) => {}
            Err(e) => {
                eprintln!("cannot read input: {e}");
                return ExitCode::FAILURE;
            }
        }
        if line.trim().is_empty() {
            continue;
        }
        match interp.run(&line, "<repl>") {
            Ok(value) if value.is_null() => {}
            Ok(value) => {
                interp.flush_output();
                println!("{value:?}");
            }
            Err(err) => {
                interp.flush_output();
                reporter.report(&err, Some(("<repl>", line.as_str())));
            }
        }
        interp.flush_output();
    }
    ExitCode::SUCCESS
}

fn build(input: &Path, output: Option<&Path>, reporter: &Reporter) -> ExitCode {
    let source = match std::fs::read_to_string(input) {
        Ok(source) => source,
        Err(source) => {
            reporter.report(&Error::Io { path: input.display().to_string(), source }, None);
            return ExitCode::FAILURE;
        }
    };
    let name = input.canonicalize().unwrap_or_else(|_| input.to_path_buf());
    let name = name.to_string_lossy();
    let output = output.map(Path::to_path_buf).unwrap_or_else(|| input.with_extension("qlc"));
    let written = artifact::build(&source, &name).and_then(|image| Ok(image.write(&output)?));
    match written {
        Ok(()) => {
            log::debug!("wrote {}", output.display());
            ExitCode::SUCCESS
        }
        Err(err) => {
            reporter.report(&err, Some((&name, &source)));
            ExitCode::FAILURE
        }
    }
}

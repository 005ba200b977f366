use std::path::PathBuf;
use std::process;

use clap::Parser;
use log::{error, info};

use dllkeeper::{LoaderConfig, Runtime};

#[derive(Parser, Debug)]
#[command(name = "dllkeeper", version, about = "Load a legacy plugin DLL and report what it leaks", long_about = None)]
struct Cli {
    /// Module to load.
    #[arg(value_name = "DLL")]
    module: PathBuf,

    /// Extra directory to search for imported modules (repeatable).
    #[arg(short = 'L', long = "search-path", value_name = "DIR")]
    search_paths: Vec<PathBuf>,

    /// Host directory guest file paths resolve against.
    #[arg(long, value_name = "DIR")]
    file_root: Option<PathBuf>,

    /// Export to call after loading, as NAME or NAME:ARG,ARG (repeatable).
    #[arg(short, long = "call", value_name = "EXPORT")]
    calls: Vec<String>,

    /// Module allowed to load although its entry point faults (repeatable).
    #[arg(long = "exempt", value_name = "NAME")]
    exemptions: Vec<String>,

    /// Bind untracked API variants.
    #[arg(long)]
    no_tracking: bool,

    /// Instructions a single call may execute.
    #[arg(long, value_name = "N")]
    budget: Option<u64>,

    /// Enable debug-level logging.
    #[arg(short, long)]
    verbose: bool,
}

/// `NAME:1,0x20` into the export name and its arguments.
fn parse_call(text: &str) -> Result<(String, Vec<u32>), String> {
    let (name, args) = match text.find(':') {
        Some(at) => (&text[..at], &text[at + 1..]),
        None => (text, ""),
    };
    let mut values = Vec::new();
    for arg in args.split(',').map(str::trim).filter(|a| !a.is_empty()) {
        let value = match arg.strip_prefix("0x") {
            Some(hex) => u32::from_str_radix(hex, 16).ok(),
            None => arg.parse::<i32>().map(|v| v as u32).ok(),
        };
        values.push(value.ok_or_else(|| format!("bad argument '{}' in '{}'", arg, text))?);
    }
    Ok((name.to_owned(), values))
}

fn run(cli: Cli) -> dllkeeper::Result<bool> {
    let mut config = LoaderConfig::new().with_tracking(!cli.no_tracking);
    for path in cli.search_paths {
        config = config.with_search_path(path);
    }
    if let Some(root) = cli.file_root {
        config = config.with_file_root(root);
    }
    for name in cli.exemptions {
        config = config.with_entry_fault_exemption(name);
    }
    if let Some(budget) = cli.budget {
        config = config.with_instruction_budget(budget);
    }

    let runtime = Runtime::new(config)?;
    let handle = runtime.load(&cli.module.to_string_lossy())?;
    info!("[+] Loaded {} at {}", cli.module.display(), handle);

    for text in &cli.calls {
        let (name, args) = match parse_call(text) {
            Ok(call) => call,
            Err(e) => {
                error!("{}", e);
                continue;
            }
        };
        match runtime.call_export(handle, &name, &args) {
            Ok(ret) => println!("{}({:x?}) = 0x{:08x}", name, args, ret),
            Err(e) => error!("[-] {} failed: {}", name, e),
        }
    }

    for (module, symbol) in runtime.unresolved_calls() {
        println!("called unresolved {}!{}", module, symbol);
    }

    let mut clean = true;
    for report in runtime.release(handle) {
        print!("{}", report);
        clean &= report.is_clean();
    }
    for report in runtime.shutdown() {
        print!("{}", report);
        clean &= report.is_clean();
    }
    Ok(clean)
}

fn main() {
    let cli = Cli::parse();
    let level = if cli.verbose { log::LevelFilter::Debug } else { log::LevelFilter::Info };
    env_logger::Builder::new()
        .filter_module("dllkeeper", level)
        .parse_default_env()
        .target(env_logger::Target::Stderr)
        .format_timestamp(None)
        .format_target(false)
        .init();

    match run(cli) {
        Ok(true) => {}
        Ok(false) => process::exit(2),
        Err(e) => {
            error!("{}", e);
            for cause in e.iter().skip(1) {
                error!("caused by: {}", cause);
            }
            process::exit(1);
        }
    }
}

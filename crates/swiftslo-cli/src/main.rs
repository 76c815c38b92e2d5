mod color;
mod format;
mod progress;
mod signal;

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::AtomicBool;
use std::sync::Arc;

use clap::{ArgAction, CommandFactory, FromArgMatches, Parser};

use color::Painter;
use progress::ProgressRenderer;
use swiftslo_core::driver::{self, UploadConfig};
use swiftslo_core::state;
use swiftslo_storage::{Credentials, ObjectStore, RetryConfig, SwiftConnection};

/// Argument/auth/file-open failures (also clap's own usage-error code).
const EXIT_SETUP: i32 = 2;
/// Exclusion list did not parse.
const EXIT_EXCLUDE_PARSE: i32 = 1;
/// Stopped by SIGINT/SIGTERM.
const EXIT_INTERRUPT: i32 = 130;
/// Manifest contiguity bug: a defect, not an operational failure.
const EXIT_INVARIANT: i32 = 70;

#[derive(Parser)]
#[command(
    name = "swiftslo",
    version,
    disable_help_flag = true,
    about = "Upload one large file to OpenStack Swift object storage as a static large object"
)]
struct Cli {
    /// `username` from OpenStack object storage credentials
    #[arg(long, value_name = "username")]
    user: String,

    /// `password` from OpenStack object storage credentials
    #[arg(short = 'p', value_name = "password")]
    password: String,

    /// `auth_url` from OpenStack object storage credentials. IMPORTANT:
    /// append "/vX" where X is your swift authentication version
    #[arg(long, value_name = "auth_url")]
    url: String,

    /// [auth v3 only] `domainName` from OpenStack object storage credentials
    #[arg(short = 'd', value_name = "domain")]
    domain: Option<String>,

    /// [auth v2 only] tenant `name` from OpenStack object storage credentials
    #[arg(short = 't', value_name = "tenant")]
    tenant: Option<String>,

    /// `name` of the container to store the data in
    #[arg(short = 'c', value_name = "container")]
    container: String,

    /// `name` of the object to store the data under
    #[arg(short = 'o', value_name = "object")]
    object: String,

    /// the `path` to the local file being uploaded
    #[arg(short = 'f', value_name = "path")]
    file: PathBuf,

    /// the `size` of each file chunk being uploaded, in bytes
    #[arg(short = 'z', value_name = "size", default_value_t = 1_000_000_000)]
    chunk_size: u64,

    /// the number of parallel uploads, at maximum [default: hardware threads]
    #[arg(short = 'j', value_name = "count")]
    max_uploads: Option<usize>,

    /// comma-separated list (no spaces) of chunk numbers to skip uploading.
    /// WARNING: this WILL cause SLO manifest validation to fail
    #[arg(short = 'e', value_name = "list", default_value = "")]
    exclude: String,

    /// hash json file saved by this utility on a previous run; shortcuts
    /// hashing data
    #[arg(short = 'h', value_name = "filename")]
    hash_file: Option<PathBuf>,

    /// only upload file chunks that are not already in object storage
    /// (uses name matching)
    #[arg(long)]
    only_missing: bool,

    /// disable colorization on output (also disables ANSI line clearing)
    #[arg(long)]
    no_color: bool,

    /// log verbosity (-v info, -vv debug, -vvv trace)
    #[arg(short = 'v', long, action = ArgAction::Count)]
    verbose: u8,
}

/// The derived command plus a long-only `--help`. The `-h` short belongs to
/// the hash-file flag, so clap's automatic help flag is disabled on the
/// struct and help is reattached here under its long name alone; the help
/// action needs no backing field.
fn cli_command() -> clap::Command {
    Cli::command().arg(
        clap::Arg::new("help")
            .long("help")
            .action(ArgAction::Help)
            .help("Print help"),
    )
}

fn main() {
    let matches = cli_command().get_matches();
    let cli = match Cli::from_arg_matches(&matches) {
        Ok(cli) => cli,
        Err(e) => e.exit(),
    };

    let filter = match cli.verbose {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(progress::LogWriter)
        .init();

    let painter = Painter::new(!cli.no_color);
    std::process::exit(run(cli, painter));
}

fn run(cli: Cli, painter: Painter) -> i32 {
    let excluded = match parse_exclusions(&cli.exclude) {
        Ok(numbers) => numbers,
        Err(e) => {
            eprintln!(
                "{}",
                painter.red(&format!("Error parsing exclusion list: {e}"))
            );
            return EXIT_EXCLUDE_PARSE;
        }
    };

    let creds = Credentials {
        username: cli.user.clone(),
        api_key: cli.password.clone(),
        auth_url: cli.url.clone(),
        domain: cli.domain.clone(),
        tenant: cli.tenant.clone(),
    };
    let connection = match SwiftConnection::connect(creds, RetryConfig::default()) {
        Ok(conn) => conn,
        Err(e) => {
            eprintln!("{}", painter.red(&format!("Authentication error: {e}")));
            return EXIT_SETUP;
        }
    };

    // The driver opens its own handle; this early check gives the operator a
    // clean message (and exit) before anything touches the store.
    if let Err(e) = std::fs::File::open(&cli.file) {
        eprintln!(
            "{}",
            painter.red(&format!("Unable to open file {}: {e}", cli.file.display()))
        );
        return EXIT_SETUP;
    }
    println!("{}", painter.green("Source file opened successfully"));

    let known_hashes: HashMap<String, String> = match &cli.hash_file {
        Some(path) => match state::load_hashes(path) {
            Ok(map) => {
                println!("{}", painter.green("Hash file opened successfully"));
                map
            }
            Err(e) => {
                eprintln!("{}", painter.red(&format!("Unable to load hash file: {e}")));
                return EXIT_SETUP;
            }
        },
        None => HashMap::new(),
    };

    let serverside_objects = if cli.only_missing {
        match connection.list_container(&cli.container) {
            Ok(names) => names,
            Err(e) => {
                eprintln!(
                    "{}",
                    painter.red(&format!(
                        "Problem getting existing chunk names from object storage: {e}"
                    ))
                );
                return EXIT_SETUP;
            }
        }
    } else {
        Vec::new()
    };

    if !excluded.is_empty() {
        eprintln!(
            "{}",
            painter.yellow(
                "WARNING: excluded chunks still appear in the manifest; \
                 the object store will refuse to validate it"
            )
        );
    }

    let shutdown = Arc::new(AtomicBool::new(false));
    signal::install(Arc::clone(&shutdown));

    let mut config = UploadConfig::new(cli.file.clone(), cli.container.clone(), cli.object.clone());
    config.chunk_size = cli.chunk_size;
    if let Some(workers) = cli.max_uploads {
        config.max_uploads = workers;
    }
    config.excluded_chunks = excluded;
    config.known_hashes = known_hashes;
    config.serverside_objects = serverside_objects;

    let (events_tx, events_rx) = crossbeam_channel::unbounded();
    let renderer = std::thread::spawn(move || {
        let mut renderer = ProgressRenderer::new(painter);
        for event in events_rx {
            renderer.on_event(event);
        }
        renderer.finish();
    });

    let result = driver::run(config, Arc::new(connection), events_tx, shutdown);
    let _ = renderer.join();

    let report = match result {
        Ok(report) => report,
        Err(e) => {
            eprintln!("{}", painter.red(&format!("Upload failed: {e}")));
            return EXIT_SETUP;
        }
    };

    // Written on every outcome from here down; a retry needs whatever
    // hashes this run managed to compute.
    write_sidecar(&cli.object, &report.hashes, painter);

    if report.interrupted {
        eprintln!("{}", painter.red("Program exited"));
        return EXIT_INTERRUPT;
    }
    if let Some(violation) = report.invariant_violation {
        eprintln!(
            "{}",
            painter.red(&format!("Internal invariant violated: {violation}"))
        );
        return EXIT_INVARIANT;
    }
    if report.chunk_errors > 0 {
        eprintln!(
            "{}",
            painter.yellow(&format!(
                "{} chunk(s) failed; re-run with -h <sidecar> to retry cheaply",
                report.chunk_errors
            ))
        );
    }
    0
}

fn write_sidecar(object: &str, hashes: &HashMap<String, String>, painter: Painter) {
    eprintln!("{}", painter.yellow("Attempting hash file write"));
    match state::save_hashes(Path::new("."), object, hashes) {
        Ok(path) => println!(
            "{}",
            painter.green(&format!("Hash file {} written successfully", path.display()))
        ),
        Err(e) => {
            tracing::warn!("sidecar write failed: {e}");
            eprintln!(
                "{}",
                painter.yellow(&format!("Error writing hash backup file: {e}"))
            );
        }
    }
}

/// Parse the `-e` list: comma-separated chunk numbers, no spaces.
fn parse_exclusions(raw: &str) -> Result<Vec<u64>, String> {
    if raw.is_empty() {
        return Ok(Vec::new());
    }
    raw.split(',')
        .map(|part| {
            part.parse::<u64>()
                .map_err(|e| format!("at '{part}': {e}"))
        })
        .collect()
}

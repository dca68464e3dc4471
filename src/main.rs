use std::io::Write as _;
use std::path::PathBuf;

use clap::Parser;
use flexi_logger::{DeferredNow, Logger, LoggerHandle, Record};
use log::{debug, error, info};
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::mpsc;

use git2kv::config;
use git2kv::runner::Runner;
use git2kv::version;

const EXIT_OK: i32 = 0;
const EXIT_ERROR: i32 = 10;
const EXIT_FLAG_ERROR: i32 = 11;
const EXIT_CONFIG_ERROR: i32 = 12;

#[derive(Parser, Debug)]
#[command(name = "git2kv", about = "Mirrors Git repositories into a Consul-compatible KV store")]
struct Cli {
    /// Path to configuration file.
    #[arg(long = "config")]
    config: Option<PathBuf>,

    /// Print version and exit.
    #[arg(long = "version")]
    version: bool,

    /// Run one reconciliation pass and exit.
    #[arg(long = "once")]
    once: bool,

    /// Write a sample configuration to stdout and exit.
    #[arg(long = "dump")]
    dump: bool,

    /// Log format: text, cli, or json.
    #[arg(long = "logfmt")]
    logfmt: Option<String>,

    /// Log level: debug, info, warn, or error.
    #[arg(long = "loglvl")]
    loglvl: Option<String>,
}

fn text_format(
    w: &mut dyn std::io::Write,
    now: &mut DeferredNow,
    record: &Record,
) -> Result<(), std::io::Error> {
    write!(
        w,
        "{} {:<5} [{}] {}",
        now.now().format("%Y-%m-%d %H:%M:%S%.3f"),
        record.level(),
        record.target(),
        record.args()
    )
}

fn cli_format(
    w: &mut dyn std::io::Write,
    _now: &mut DeferredNow,
    record: &Record,
) -> Result<(), std::io::Error> {
    write!(w, "{:>5} {}", record.level(), record.args())
}

fn json_format(
    w: &mut dyn std::io::Write,
    now: &mut DeferredNow,
    record: &Record,
) -> Result<(), std::io::Error> {
    write!(
        w,
        r#"{{"timestamp":"{}","level":"{}","target":"{}","message":{}}}"#,
        now.now().format("%Y-%m-%dT%H:%M:%S%.3f"),
        record.level(),
        record.target(),
        serde_json::to_string(&record.args().to_string()).unwrap_or_default(),
    )
}

fn init_logger(level: &str, format: &str) -> anyhow::Result<LoggerHandle> {
    let formatter = match format {
        "json" => json_format,
        "cli" => cli_format,
        _ => text_format,
    };
    let handle = Logger::try_with_str(level)
        .or_else(|_| Logger::try_with_str("info"))?
        .log_to_stderr()
        .format(formatter)
        .start()?;
    Ok(handle)
}

fn main() {
    let cli = Cli::parse();

    if cli.version {
        version::print();
        std::process::exit(EXIT_OK);
    }

    if cli.dump {
        let mut stdout = std::io::stdout();
        if let Err(e) = config::dump_sample(&mut stdout) {
            eprintln!("{e}");
            std::process::exit(EXIT_ERROR);
        }
        std::process::exit(EXIT_OK);
    }

    let Some(config_path) = cli.config else {
        eprintln!("No configuration file provided");
        std::process::exit(EXIT_FLAG_ERROR);
    };

    // Coarse logger, initialized once and as early as possible, so
    // config-loading errors are visible before we know the configured
    // level/format. Its format is fixed at `text` (or the CLI override, if
    // given) for the process lifetime; only the level is adjusted in place
    // once the config is loaded, via the returned handle.
    let initial_format = cli.logfmt.clone().unwrap_or_else(|| "text".to_owned());
    let mut logger_handle = match init_logger("info", &initial_format) {
        Ok(h) => Some(h),
        Err(e) => {
            eprintln!("failed to initialize logger: {e}");
            None
        }
    };

    info!("Starting git2kv version: {}", env!("CARGO_PKG_VERSION"));

    let mut cfg = match config::load(&config_path) {
        Ok(cfg) => cfg,
        Err(e) => {
            error!("(config): {e}");
            std::process::exit(EXIT_CONFIG_ERROR);
        }
    };

    if let Some(logfmt) = &cli.logfmt {
        cfg.log.format = logfmt.clone();
    }
    if let Some(loglvl) = &cli.loglvl {
        cfg.log.level = loglvl.clone();
    }
    if let Some(handle) = logger_handle.as_mut() {
        if let Err(e) = handle.parse_new_spec(&cfg.log.level) {
            error!("invalid log level {:?}: {e}", cfg.log.level);
        }
    }

    let once = cli.once;

    let rt = match tokio::runtime::Runtime::new() {
        Ok(rt) => rt,
        Err(e) => {
            error!("failed to start async runtime: {e}");
            std::process::exit(EXIT_ERROR);
        }
    };

    let exit_code = rt.block_on(run(cfg, once));
    std::process::exit(exit_code);
}

async fn run(cfg: config::Config, once: bool) -> i32 {
    let mut runner = match Runner::new(cfg, once).await {
        Ok(r) => r,
        Err(e) => {
            error!("(runner): {e:#}");
            return EXIT_CONFIG_ERROR;
        }
    };

    // Pulled out of `runner` before it moves into the spawned task below, so
    // this loop can keep watching them for as long as the runner is alive.
    let mut errors = std::mem::replace(&mut runner.errors, mpsc::channel(1).1);
    let mut repo_changed = std::mem::replace(&mut runner.repo_changed, mpsc::channel(1).1);

    let mut sighup = signal(SignalKind::hangup()).expect("installing SIGHUP handler");
    let mut sigint = signal(SignalKind::interrupt()).expect("installing SIGINT handler");
    let mut sigterm = signal(SignalKind::terminate()).expect("installing SIGTERM handler");
    let mut sigquit = signal(SignalKind::quit()).expect("installing SIGQUIT handler");

    let ct = runner.cancellation_token();
    let mut start_handle = tokio::spawn(async move {
        runner.start().await;
    });

    // Anything caught on the runner's `errors` channel terminates the
    // process with `EXIT_ERROR`, once `start_handle` itself returns; set
    // here and carried through to the final `return` below.
    let mut exit_code = EXIT_OK;

    loop {
        tokio::select! {
            result = &mut start_handle => {
                return match result {
                    Ok(()) => {
                        info!("Terminating git2kv");
                        exit_code
                    }
                    Err(e) => {
                        error!("runner task panicked: {e}");
                        EXIT_ERROR
                    }
                };
            }
            Some(err) = errors.recv() => {
                error!("(runner): {err:#}");
                exit_code = EXIT_ERROR;
                ct.cancel();
            }
            Some(repo) = repo_changed.recv() => {
                debug!("repo changed: {repo}");
            }
            _ = sighup.recv() => { info!("Received SIGHUP. Cleaning up..."); ct.cancel(); }
            _ = sigint.recv() => { info!("Received SIGINT. Cleaning up..."); ct.cancel(); }
            _ = sigterm.recv() => { info!("Received SIGTERM. Cleaning up..."); ct.cancel(); }
            _ = sigquit.recv() => { info!("Received SIGQUIT. Cleaning up..."); ct.cancel(); }
        }
    }
}

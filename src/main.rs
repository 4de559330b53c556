use chrono::Utc;
use flukso_timescale::client::FluksoClient;
use flukso_timescale::config::{Config, LoggingConfig, SourceKind};
use flukso_timescale::configuration::{ConfigRow, ConfigurationRegistry};
use flukso_timescale::db::store::PgStore;
use flukso_timescale::services::fake_data::{DEFAULT_OUTAGE_PROBABILITY, FakeSource};
use flukso_timescale::services::sync::SyncOrchestrator;
use flukso_timescale::source::{RawSeriesSource, RetryPolicy, Retrying};
use flukso_timescale::utils::local_day;
use log::{error, info, warn};
use std::path::{Path, PathBuf};

#[derive(Debug)]
struct LoadedEnvFile {
    path: PathBuf,
    explicit: bool,
}

#[derive(Debug, Default)]
struct CliArgs {
    env_file: Option<LoadedEnvFile>,
    register_config: Option<PathBuf>,
    recompute: bool,
}

fn apply_database_migrations(store: &PgStore) -> Result<(), String> {
    let applied = store.run_migrations()?;
    if applied.is_empty() {
        info!("Database schema is up to date; no migrations were applied");
    } else {
        info!("Applied {} database migration(s): {}", applied.len(), applied.join(", "));
    }
    Ok(())
}

fn read_config_rows(path: &Path) -> Result<Vec<ConfigRow>, String> {
    let body = std::fs::read_to_string(path).map_err(|e| format!("failed to read {}: {}", path.display(), e))?;
    let de = &mut serde_json::Deserializer::from_str(&body);
    serde_path_to_error::deserialize(de).map_err(|e| format!("{}: {}", path.display(), e))
}

fn run(cfg: &Config, register_config: Option<&Path>, recompute: bool) -> Result<(), String> {
    // 1) Log effective config
    info!(
        "Config loaded (source={:?}, period={}s, unit_scale={}, timezone={}, workers={}, sync_from={}, sync_until={}, max_request_retries={})",
        cfg.source,
        cfg.sampling_period.num_seconds(),
        cfg.energy_unit_scale,
        cfg.site_timezone,
        cfg.sync_workers.get(),
        cfg.sync_from_date
            .map(|d| d.to_string())
            .unwrap_or_else(|| "-".to_string()),
        cfg.sync_until_date
            .map(|d| d.to_string())
            .unwrap_or_else(|| "-".to_string()),
        cfg.max_request_retries.get()
    );
    let converter = cfg.converter()?;

    // 2) Connect DB
    let store = PgStore::connect(&cfg.database_url, cfg.db_pool_size())
        .map_err(|e| format!("DB connection failed: {}", e))?;
    info!("Connected to database");

    // 3) Apply pending database migrations
    apply_database_migrations(&store)?;

    // 4) Register a new configuration version, if requested
    let registry = ConfigurationRegistry::new(&store);
    if let Some(path) = register_config {
        let rows = read_config_rows(path)?;
        let registered = registry.register(rows).map_err(|e| format!("registering {} failed: {}", path.display(), e))?;
        info!("Registered {}", registered);
        if !recompute {
            info!("Already stored days keep their old coefficients; rerun with --recompute to rewrite them");
        }
    }

    // 5) Resolve the configuration in effect
    let configuration = registry
        .latest()
        .map_err(|e| format!("{} (register one with --register-config)", e))?;
    info!("Using {}", configuration);
    let first_seen = registry.first_seen().map_err(|e| e.to_string())?;
    let groups = registry.groups().map_err(|e| e.to_string())?;
    if !groups.is_empty() {
        info!("Loaded {} site group(s)", groups.len());
    }

    // 6) Init raw series source
    let source: Box<dyn RawSeriesSource> = match cfg.source {
        SourceKind::Flukso => Box::new(Retrying::new(
            FluksoClient::new(cfg.flukso_api_url.clone(), cfg.request_timeout),
            cfg.fetch_retry_policy(),
        )),
        SourceKind::Fake => {
            warn!("Using synthetic counters; rows written are not real measurements");
            Box::new(Retrying::new(
                FakeSource::new(cfg.sampling_period, cfg.energy_unit_scale, DEFAULT_OUTAGE_PROBABILITY),
                RetryPolicy::once(),
            ))
        }
    };

    let orchestrator = SyncOrchestrator::new(source.as_ref(), &store, converter, cfg.sync_settings());

    // 7) Rewrite stored days under the configuration in effect, if requested
    if recompute {
        let report = orchestrator
            .recompute(&configuration, &groups)
            .map_err(|e| format!("recompute failed: {}", e))?;
        report.log();
        if report.has_failures() {
            return Err("recompute finished with failed site-days".to_string());
        }
    }

    // 8) Plan days per site
    let today = local_day(Utc::now(), cfg.site_timezone);
    let plan = orchestrator
        .plan(&configuration, &first_seen, today)
        .map_err(|e| format!("planning sync failed: {}", e))?;
    if plan.is_empty() {
        info!("All sites are up to date through {}", today.pred_opt().unwrap_or(today));
        return Ok(());
    }

    // 9) Materialize and persist
    let report = orchestrator
        .run(&configuration, &groups, &plan)
        .map_err(|e| format!("sync failed: {}", e))?;
    report.log();
    if report.has_failures() {
        return Err("sync finished with failed site-days; their markers were held back".to_string());
    }

    Ok(())
}

fn configure_env_from_cli() -> Result<CliArgs, String> {
    let mut args = std::env::args_os();
    args.next(); // skip program name

    let mut env_file: Option<PathBuf> = None;
    let mut register_config: Option<PathBuf> = None;
    let mut recompute = false;

    while let Some(arg) = args.next() {
        match arg.to_str() {
            Some("--env-file") => {
                if env_file.is_some() {
                    return Err("`--env-file` provided more than once".to_string());
                }
                let value = args
                    .next()
                    .ok_or_else(|| "`--env-file` requires a path argument".to_string())?;
                env_file = Some(PathBuf::from(value));
            }
            Some(s) if s.starts_with("--env-file=") => {
                if env_file.is_some() {
                    return Err("`--env-file` provided more than once".to_string());
                }
                let path_str = &s["--env-file=".len()..];
                if path_str.is_empty() {
                    return Err("`--env-file` requires a path argument".to_string());
                }
                env_file = Some(PathBuf::from(path_str));
            }
            Some("--register-config") => {
                if register_config.is_some() {
                    return Err("`--register-config` provided more than once".to_string());
                }
                let value = args
                    .next()
                    .ok_or_else(|| "`--register-config` requires a path argument".to_string())?;
                register_config = Some(PathBuf::from(value));
            }
            Some("--recompute") => {
                if recompute {
                    return Err("`--recompute` provided more than once".to_string());
                }
                recompute = true;
            }
            Some("--") => break,
            Some(other) => return Err(format!("unrecognised argument: {}", other)),
            None => return Err("argument contains invalid UTF-8".to_string()),
        }
    }

    if let Some(path) = &register_config
        && !path.is_file()
    {
        return Err(format!("configuration file not found: {}", path.display()));
    }

    let env_file = if let Some(path) = env_file {
        if !path.is_file() {
            return Err(format!("env file not found: {}", path.display()));
        }
        load_env_file(&path)?;
        Some(LoadedEnvFile { path, explicit: true })
    } else {
        let cwd = std::env::current_dir().map_err(|e| format!("unable to read current directory: {}", e))?;
        let default_path = cwd.join(".env");
        if default_path.is_file() {
            load_env_file(&default_path)?;
            Some(LoadedEnvFile {
                path: default_path,
                explicit: false,
            })
        } else {
            None
        }
    };

    Ok(CliArgs {
        env_file,
        register_config,
        recompute,
    })
}

fn load_env_file(path: &Path) -> Result<(), String> {
    use std::fs::File;
    use std::io::{BufRead, BufReader};

    let file = File::open(path).map_err(|e| format!("failed to open {}: {}", path.display(), e))?;
    let reader = BufReader::new(file);

    for (index, line) in reader.lines().enumerate() {
        let line = line.map_err(|e| format!("failed to read {} at line {}: {}", path.display(), index + 1, e))?;
        match parse_env_assignment(&line) {
            Ok(Some((key, value))) => {
                // Values already in the process environment win.
                if std::env::var_os(&key).is_none() {
                    // Called before any worker thread exists.
                    unsafe {
                        std::env::set_var(key, value);
                    }
                }
            }
            Ok(None) => {}
            Err(e) => {
                return Err(format!("{}:{}: {}", path.display(), index + 1, e));
            }
        }
    }

    Ok(())
}

fn parse_env_assignment(line: &str) -> Result<Option<(String, String)>, String> {
    let trimmed = line.trim();
    if trimmed.is_empty() || trimmed.starts_with('#') {
        return Ok(None);
    }

    let without_export = trimmed
        .strip_prefix("export ")
        .map(|s| s.trim_start())
        .unwrap_or(trimmed);

    let (key, value_part) = without_export
        .split_once('=')
        .ok_or_else(|| "missing '=' in assignment".to_string())?;
    let key = key.trim();

    if key.is_empty() {
        return Err("environment variable name cannot be empty".to_string());
    }
    if key.chars().any(|c| c.is_whitespace()) {
        return Err(format!("environment variable name contains whitespace: {}", key));
    }

    let value = parse_env_value(value_part)?;
    Ok(Some((key.to_string(), value)))
}

fn parse_env_value(raw: &str) -> Result<String, String> {
    let trimmed = raw.trim();
    if let Some(rest) = trimmed.strip_prefix('"') {
        parse_quoted(rest, '"', true)
    } else if let Some(rest) = trimmed.strip_prefix('\'') {
        parse_quoted(rest, '\'', false)
    } else {
        let value = trimmed.split('#').next().unwrap_or_default().trim_end();
        Ok(value.to_string())
    }
}

/// Reads up to the closing `quote`; only a trailing comment may follow it.
fn parse_quoted(input: &str, quote: char, escapes: bool) -> Result<String, String> {
    let mut result = String::new();
    let mut chars = input.chars();

    while let Some(ch) = chars.next() {
        if escapes && ch == '\\' {
            let escaped = chars
                .next()
                .ok_or_else(|| "unterminated escape sequence in double-quoted value".to_string())?;
            result.push(match escaped {
                'n' => '\n',
                'r' => '\r',
                't' => '\t',
                other => other,
            });
        } else if ch == quote {
            let remainder = chars.as_str().trim();
            return if remainder.is_empty() || remainder.starts_with('#') {
                Ok(result)
            } else {
                Err(format!("unexpected characters after closing {} quote", quote_name(quote)))
            };
        } else {
            result.push(ch);
        }
    }

    Err(format!("unterminated {}-quoted value", quote_name(quote)))
}

fn quote_name(quote: char) -> &'static str {
    if quote == '"' { "double" } else { "single" }
}

fn init_logging(logging: &LoggingConfig) -> Result<(), String> {
    let mut builder = env_logger::Builder::new();
    builder.parse_filters(&logging.filter).format_timestamp_secs();
    if let Some(path) = &logging.file {
        let file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .map_err(|e| format!("failed to open log file {}: {}", path.display(), e))?;
        builder.target(env_logger::Target::Pipe(Box::new(file)));
    }
    builder.try_init().map_err(|e| e.to_string())
}

fn main() {
    let cli = match configure_env_from_cli() {
        Ok(cli) => cli,
        Err(err) => {
            eprintln!("fatal: {}", err);
            std::process::exit(1);
        }
    };

    // Config before logging so LOG_LEVEL and LOG_FILE from .env are respected.
    let cfg = match Config::from_env() {
        Ok(cfg) => cfg,
        Err(err) => {
            eprintln!("fatal: {}", err);
            std::process::exit(1);
        }
    };
    if let Err(err) = init_logging(&cfg.logging) {
        eprintln!("fatal: {}", err);
        std::process::exit(1);
    }

    if let Some(info) = cli.env_file.as_ref() {
        let origin = if info.explicit { "CLI-specified" } else { "default" };
        info!("Environment loaded from {} .env file: {}", origin, info.path.display());
    }

    info!(
        "flukso-timescale {} (git {}) starting",
        env!("CARGO_PKG_VERSION"),
        env!("BUILD_TIME_GIT_HASH")
    );
    if let Err(e) = run(&cfg, cli.register_config.as_deref(), cli.recompute) {
        error!("fatal: {}", e);
        std::process::exit(1);
    }
}

use load_nilm::NilmEngine;
use load_nilm::client::InfluxClient;
use load_nilm::config::Config;
use load_nilm::db::pg::PgStore;
use load_nilm::services::{fake_data, feed};
use log::{error, info, warn};
use serde::Serialize;
use std::path::{Path, PathBuf};

#[derive(Debug)]
struct LoadedEnvFile {
    path: PathBuf,
    explicit: bool,
}

#[derive(Debug)]
struct Cli {
    env_file: Option<LoadedEnvFile>,
    /// Subcommand and its positional arguments; empty means `feed`.
    command: Vec<String>,
}

const USAGE: &str = "usage: load-nilm [--env-file PATH] [feed | reanalyze [--local] | signatures | events [HOURS] | \
active [LOAD_W] | daily ID [DAYS] | label ID LABEL [ICON [COLOR]] | merge KEEP_ID MERGE_ID | cleanup | seed-demo]";

fn print_json<T: Serialize>(value: &T) -> Result<(), String> {
    let json = serde_json::to_string_pretty(value).map_err(|e| format!("encode output failed: {}", e))?;
    println!("{}", json);
    Ok(())
}

fn arg<T: std::str::FromStr>(args: &[String], index: usize, name: &str) -> Result<Option<T>, String> {
    match args.get(index) {
        None => Ok(None),
        Some(raw) => raw
            .parse::<T>()
            .map(Some)
            .map_err(|_| format!("{} has an invalid value: {:?}", name, raw)),
    }
}

fn required<T: std::str::FromStr>(args: &[String], index: usize, name: &str) -> Result<T, String> {
    arg(args, index, name)?.ok_or_else(|| format!("missing {}\n{}", name, USAGE))
}

pub fn run(command: &[String]) -> Result<(), String> {
    // 1) Load config
    let cfg = Config::from_env()?;
    info!(
        "Config loaded (edge_threshold={}W, debounce={}s, tolerance={}, window={}, idle={}W, influx={})",
        cfg.nilm.edge_threshold_w,
        cfg.nilm.debounce_secs,
        cfg.nilm.signature_tolerance,
        cfg.nilm.smoothing_window,
        cfg.nilm.idle_load_w,
        cfg.influx.as_ref().map(|i| i.url.as_str()).unwrap_or("-")
    );

    // 2) Connect DB
    let store = PgStore::connect(&cfg.database_url, cfg.statement_timeout)
        .map_err(|e| format!("DB connection failed: {}", e))?;
    info!("Connected to database");

    // 3) Apply pending database migrations
    store.apply_migrations().map_err(|e| e.to_string())?;

    // 4) Engine, with leftovers from a previous run cleared
    let engine = NilmEngine::new(store, cfg.nilm.clone()).map_err(|e| e.to_string())?;
    engine.startup().map_err(|e| format!("startup failed: {}", e))?;

    let name = command.first().map(String::as_str).unwrap_or("feed");
    let args = command.get(1..).unwrap_or_default();
    match name {
        "feed" => {
            info!("Reading load samples from stdin (cleanup every {}s)", cfg.cleanup_interval.as_secs());
            let stdin = std::io::stdin();
            feed::run_loop(&engine, stdin.lock(), std::io::stdout(), cfg.cleanup_interval)?;
            Ok(())
        }
        "reanalyze" => {
            let local_only = args.iter().any(|a| a == "--local");
            let summary = match (&cfg.influx, local_only) {
                (Some(influx), false) => {
                    let client = InfluxClient::new(influx.clone());
                    match engine.reanalyze_from_source(&client) {
                        Ok(summary) if summary.samples > 0 => summary,
                        Ok(_) => {
                            warn!("No history from InfluxDB; replaying local samples instead");
                            engine.reanalyze_local().map_err(|e| e.to_string())?
                        }
                        Err(e) => {
                            warn!("InfluxDB pull failed ({}); replaying local samples instead", e);
                            engine.reanalyze_local().map_err(|e| e.to_string())?
                        }
                    }
                }
                _ => engine.reanalyze_local().map_err(|e| e.to_string())?,
            };
            print_json(&summary)
        }
        "signatures" => print_json(&engine.signatures().map_err(|e| e.to_string())?),
        "events" => {
            let hours = arg(args, 0, "HOURS")?.unwrap_or(24);
            print_json(&engine.recent_events(hours).map_err(|e| e.to_string())?)
        }
        "active" => {
            let load = arg::<f64>(args, 0, "LOAD_W")?;
            print_json(&engine.active_appliances(load).map_err(|e| e.to_string())?)
        }
        "daily" => {
            let id = required(args, 0, "ID")?;
            let days = arg(args, 1, "DAYS")?.unwrap_or(30);
            print_json(&engine.daily_stats(id, days).map_err(|e| e.to_string())?)
        }
        "label" => {
            let id = required(args, 0, "ID")?;
            let label: String = required(args, 1, "LABEL")?;
            let updated = engine
                .update_label(id, Some(label), args.get(2).cloned(), args.get(3).cloned())
                .map_err(|e| e.to_string())?;
            if !updated {
                return Err(format!("signature {} not found", id));
            }
            info!("Signature {} relabelled", id);
            Ok(())
        }
        "merge" => {
            let keep = required(args, 0, "KEEP_ID")?;
            let merge = required(args, 1, "MERGE_ID")?;
            if !engine.merge(keep, merge).map_err(|e| e.to_string())? {
                return Err(format!("cannot merge {} into {}: unknown or identical ids", merge, keep));
            }
            Ok(())
        }
        "cleanup" => {
            let (samples, events) = engine.cleanup().map_err(|e| e.to_string())?;
            info!("Cleanup removed {} sample(s) and {} event(s)", samples, events);
            Ok(())
        }
        "seed-demo" => {
            fake_data::run(engine.store())?;
            print_json(&engine.reanalyze_local().map_err(|e| e.to_string())?)
        }
        other => Err(format!("unknown command: {}\n{}", other, USAGE)),
    }
}

fn parse_cli() -> Result<Cli, String> {
    let mut args = std::env::args_os();
    args.next(); // skip program name

    let mut env_file: Option<PathBuf> = None;
    let mut command = Vec::new();

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
            Some("-h") | Some("--help") => return Err(USAGE.to_string()),
            Some(s) => command.push(s.to_string()),
            None => return Err("argument contains invalid UTF-8".to_string()),
        }
    }

    let env_file = match env_file {
        Some(path) => {
            if !path.is_file() {
                return Err(format!("env file not found: {}", path.display()));
            }
            load_env_file(&path)?;
            Some(LoadedEnvFile { path, explicit: true })
        }
        None => {
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
        }
    };

    Ok(Cli { env_file, command })
}

fn load_env_file(path: &Path) -> Result<(), String> {
    let contents =
        std::fs::read_to_string(path).map_err(|e| format!("failed to read {}: {}", path.display(), e))?;
    for (index, line) in contents.lines().enumerate() {
        let parsed = parse_env_assignment(line).map_err(|e| format!("{}:{}: {}", path.display(), index + 1, e))?;
        let Some((key, value)) = parsed else {
            continue;
        };
        // the process environment wins over the file
        if std::env::var_os(&key).is_none() {
            // SAFETY: called from main before logging or any other thread starts
            unsafe {
                std::env::set_var(key, value);
            }
        }
    }
    Ok(())
}

/// `[export] KEY=value`, optionally quoted. `Ok(None)` for blank and comment lines.
fn parse_env_assignment(line: &str) -> Result<Option<(String, String)>, String> {
    let line = line.trim();
    if line.is_empty() || line.starts_with('#') {
        return Ok(None);
    }
    let line = line.strip_prefix("export ").map_or(line, str::trim_start);
    let (key, raw) = line
        .split_once('=')
        .ok_or_else(|| "missing '=' in assignment".to_string())?;
    let key = key.trim();
    if key.is_empty() || !key.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') {
        return Err(format!("invalid variable name: {:?}", key));
    }
    Ok(Some((key.to_string(), parse_env_value(raw.trim())?)))
}

/// Double quotes understand `\n`, `\r`, `\t` and `\<char>`; single quotes are literal.
/// Unquoted values end at the first `#`.
fn parse_env_value(raw: &str) -> Result<String, String> {
    let Some(quote) = raw.chars().next().filter(|c| *c == '"' || *c == '\'') else {
        return Ok(raw.split('#').next().unwrap_or_default().trim_end().to_string());
    };

    let mut value = String::new();
    let mut chars = raw[1..].chars();
    while let Some(c) = chars.next() {
        match c {
            c if c == quote => {
                let rest = chars.as_str().trim_start();
                if rest.is_empty() || rest.starts_with('#') {
                    return Ok(value);
                }
                return Err(format!("unexpected text after closing quote: {:?}", rest));
            }
            '\\' if quote == '"' => {
                let escaped = chars
                    .next()
                    .ok_or_else(|| "unterminated escape sequence".to_string())?;
                value.push(match escaped {
                    'n' => '\n',
                    'r' => '\r',
                    't' => '\t',
                    other => other,
                });
            }
            c => value.push(c),
        }
    }
    Err(format!("missing closing {} quote", quote))
}

fn main() {
    let cli = match parse_cli() {
        Ok(cli) => cli,
        Err(err) => {
            eprintln!("fatal: {}", err);
            std::process::exit(1);
        }
    };

    // Init logging after environment so RUST_LOG from .env is respected.
    let default_filter = env_logger::Env::default().default_filter_or("info");
    env_logger::Builder::from_env(default_filter)
        .format_timestamp_secs()
        .init();

    if let Some(info) = cli.env_file.as_ref() {
        let origin = if info.explicit { "CLI-specified" } else { "default" };
        info!("Environment loaded from {} .env file: {}", origin, info.path.display());
    }

    info!(
        "load-nilm {} (git {}) starting",
        env!("CARGO_PKG_VERSION"),
        env!("BUILD_TIME_GIT_HASH")
    );
    if let Err(e) = run(&cli.command) {
        error!("fatal: {}", e);
        std::process::exit(1);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn env_assignments() {
        assert_eq!(
            parse_env_assignment("export NILM_IDLE_LOAD=85 # inverter").unwrap(),
            Some(("NILM_IDLE_LOAD".to_string(), "85".to_string()))
        );
        assert_eq!(
            parse_env_assignment(r#"INFLUX_MEASUREMENT="Load power""#).unwrap(),
            Some(("INFLUX_MEASUREMENT".to_string(), "Load power".to_string()))
        );
        assert_eq!(
            parse_env_assignment("INFLUX_PASSWORD='p#ss'").unwrap(),
            Some(("INFLUX_PASSWORD".to_string(), "p#ss".to_string()))
        );
        assert_eq!(parse_env_assignment("# comment").unwrap(), None);
        assert!(parse_env_assignment("NO_EQUALS").is_err());
        assert!(parse_env_assignment("BAD KEY=1").is_err());
        assert!(parse_env_assignment("OPEN=\"unterminated").is_err());
        assert!(parse_env_assignment("QUOTED=\"a\" trailing").is_err());
        assert_eq!(
            parse_env_assignment(r#"ESCAPED="tab\tquote\"""#).unwrap(),
            Some(("ESCAPED".to_string(), "tab\tquote\"".to_string()))
        );
        assert_eq!(
            parse_env_assignment("EMPTY=").unwrap(),
            Some(("EMPTY".to_string(), String::new()))
        );
    }

    #[test]
    fn positional_args() {
        let args = vec!["7".to_string(), "x".to_string()];
        assert_eq!(required::<i64>(&args, 0, "ID").unwrap(), 7);
        assert!(arg::<i64>(&args, 1, "DAYS").is_err());
        assert_eq!(arg::<i64>(&args, 2, "DAYS").unwrap(), None);
        assert!(required::<i64>(&args, 5, "ID").is_err());
    }
}

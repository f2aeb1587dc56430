use std::fs;
use std::io::Write as _;
use std::path::PathBuf;

use strand::logging::{LogFormat, LogLevel, LogSettings, init_logging};
use strand::{
    RunOptions, build_file, default_build_output_path, emit_diagnostics, format_stats, run_file,
};
use strand_codegen::GenConfig;

fn main() {
    match run() {
        Ok(code) => std::process::exit(code),
        Err(message) => {
            eprintln!("{message}");
            std::process::exit(1);
        }
    }
}

fn run() -> Result<i32, String> {
    let args = std::env::args().collect::<Vec<_>>();
    let cli = parse_cli(&args)?;
    init_logging(cli.log.resolve());

    match cli.command {
        Command::Build {
            input,
            output,
            config,
            stats,
        } => {
            let generated = build_file(&input, &config)?;
            emit_diagnostics(&generated.diagnostics);
            let output =
                output.unwrap_or_else(|| default_build_output_path(&input, generated.file_suffix));
            if let Some(parent) = output.parent()
                && !parent.as_os_str().is_empty()
            {
                fs::create_dir_all(parent)
                    .map_err(|err| format!("failed to create output directory: {err}"))?;
            }
            fs::write(&output, generated.render())
                .map_err(|err| format!("failed to write `{}`: {err}", output.display()))?;
            println!(
                "built `{}` ({} units, {} warnings)",
                output.display(),
                generated.units.len(),
                generated.warnings().count()
            );
            if stats {
                print!("{}", format_stats(&generated.stats));
            }
            Ok(if generated.has_errors() { 1 } else { 0 })
        }
        Command::Run { input, options } => {
            let result = run_file(&input, &options)?;
            emit_diagnostics(&result.diagnostics);
            print!("{}", result.stdout);
            let _ = std::io::stdout().flush();
            if let Some(error) = &result.error {
                eprintln!("{error}");
            }
            Ok(result.exit_code)
        }
    }
}

#[derive(Debug)]
struct Cli {
    command: Command,
    log: LogSettings,
}

#[derive(Debug)]
enum Command {
    Build {
        input: PathBuf,
        output: Option<PathBuf>,
        config: GenConfig,
        stats: bool,
    },
    Run {
        input: PathBuf,
        options: RunOptions,
    },
}

fn value<'a>(args: &'a [String], idx: usize, flag: &str) -> Result<&'a str, String> {
    args.get(idx + 1)
        .map(String::as_str)
        .ok_or_else(|| format!("missing value for {flag}"))
}

fn number<T: std::str::FromStr>(text: &str, flag: &str) -> Result<T, String> {
    text.parse()
        .map_err(|_| format!("invalid value `{text}` for {flag}"))
}

fn parse_cli(args: &[String]) -> Result<Cli, String> {
    if args.len() < 3 {
        return Err(usage());
    }
    let input = PathBuf::from(&args[2]);
    let mut log = LogSettings::default();
    let mut output = None;
    let mut config = GenConfig::default();
    let mut stats = false;
    let mut options = RunOptions::default();
    let building = match args[1].as_str() {
        "build" => true,
        "run" => false,
        _ => return Err(usage()),
    };

    let mut idx = 3;
    while idx < args.len() {
        let flag = args[idx].as_str();
        let mut step = 1;
        match (building, flag) {
            (_, "--log-level") => {
                let text = value(args, idx, flag)?;
                log.level = Some(
                    LogLevel::parse(text).ok_or_else(|| format!("unknown log level `{text}`"))?,
                );
                step = 2;
            }
            (_, "--log-format") => {
                let text = value(args, idx, flag)?;
                log.format = Some(
                    LogFormat::parse(text).ok_or_else(|| format!("unknown log format `{text}`"))?,
                );
                step = 2;
            }
            (true, "-o" | "--output") => {
                output = Some(PathBuf::from(value(args, idx, "--output")?));
                step = 2;
            }
            (true, "--stop-on-error") => config.stop_on_error = true,
            (true, "--debug") => config.debug = true,
            (true, "--trace") => config.trace = true,
            (true, "--stats") => stats = true,
            (true, "--package") => {
                config.package_name = Some(value(args, idx, flag)?.to_string());
                step = 2;
            }
            (false, "--entry") => {
                options.entry = Some(value(args, idx, flag)?.to_string());
                step = 2;
            }
            (false, "--max-rounds") => {
                options.max_rounds = number(value(args, idx, flag)?, flag)?;
                step = 2;
            }
            (false, "--seed") => {
                options.seed = Some(number(value(args, idx, flag)?, flag)?);
                step = 2;
            }
            (_, unknown) => {
                return Err(format!("unknown argument `{unknown}`\n{}", usage()));
            }
        }
        idx += step;
    }

    let command = if building {
        Command::Build {
            input,
            output,
            config,
            stats,
        }
    } else {
        Command::Run { input, options }
    };
    Ok(Cli { command, log })
}

fn usage() -> String {
    "usage:\n  strand build <program.json> [-o output] [--stop-on-error] [--debug] [--trace] [--stats] [--package name]\n  strand run <program.json> [--entry name] [--max-rounds n] [--seed n]\n\nboth commands accept --log-level <level> and --log-format <text|json>".to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(list: &[&str]) -> Vec<String> {
        std::iter::once("strand")
            .chain(list.iter().copied())
            .map(str::to_string)
            .collect()
    }

    #[test]
    fn parse_build_with_flags() {
        let cli = parse_cli(&args(&[
            "build",
            "prog.json",
            "-o",
            "out/prog.sfs",
            "--stop-on-error",
            "--trace",
            "--stats",
        ]))
        .unwrap();
        match cli.command {
            Command::Build {
                input,
                output,
                config,
                stats,
            } => {
                assert_eq!(input, PathBuf::from("prog.json"));
                assert_eq!(output, Some(PathBuf::from("out/prog.sfs")));
                assert!(config.stop_on_error && config.trace && !config.debug);
                assert!(stats);
            }
            other => panic!("expected build, got {other:?}"),
        }
    }

    #[test]
    fn parse_run_with_entry_and_limits() {
        let cli = parse_cli(&args(&[
            "run",
            "prog.json",
            "--entry",
            "main.start",
            "--max-rounds",
            "50",
            "--seed",
            "3",
            "--log-level",
            "debug",
        ]))
        .unwrap();
        assert_eq!(cli.log.level, Some(LogLevel::Debug));
        match cli.command {
            Command::Run { input, options } => {
                assert_eq!(input, PathBuf::from("prog.json"));
                assert_eq!(options.entry.as_deref(), Some("main.start"));
                assert_eq!(options.max_rounds, 50);
                assert_eq!(options.seed, Some(3));
            }
            other => panic!("expected run, got {other:?}"),
        }
    }

    #[test]
    fn build_flags_are_rejected_by_run() {
        let err = parse_cli(&args(&["run", "prog.json", "--stats"])).unwrap_err();
        assert!(err.starts_with("unknown argument `--stats`"), "{err}");
    }

    #[test]
    fn missing_flag_values_are_reported() {
        let err = parse_cli(&args(&["build", "prog.json", "-o"])).unwrap_err();
        assert_eq!(err, "missing value for --output");
        let err = parse_cli(&args(&["run", "prog.json", "--max-rounds", "lots"])).unwrap_err();
        assert_eq!(err, "invalid value `lots` for --max-rounds");
    }

    #[test]
    fn short_or_unknown_commands_print_usage() {
        assert_eq!(parse_cli(&args(&["build"])).unwrap_err(), usage());
        assert_eq!(parse_cli(&args(&["lint", "prog.json"])).unwrap_err(), usage());
    }
}

//! tons-cli entry point.
//!
//! ## Subcommands
//!
//! - `tons-cli translate` - Translate text from arguments or stdin
//! - `tons-cli models` - List Ollama models or installed agents
//! - `tons-cli check` - Report whether the configured engine is usable
//! - `tons-cli config` - Show effective or default settings

use std::io::{Read, Write};
use std::process::ExitCode;

use tokio_util::sync::CancellationToken;

use tons_core::config::{self, EngineKind, Settings};
use tons_core::engine::process::available_agents;
use tons_core::engine::{AgentPreset, Engine, ProcessEngine, RemoteEngine, StreamMode};
use tons_core::telemetry::{init_logging, LogConfig};

#[tokio::main]
async fn main() -> ExitCode {
    if let Err(e) = init_logging(&LogConfig::from_env()) {
        eprintln!("Logging disabled: {}", e);
    }

    let args: Vec<String> = std::env::args().collect();
    let command = args.get(1).map(|s| s.as_str()).unwrap_or("help");

    match command {
        "translate" | "t" => ExitCode::from(run_translate(&args, false).await),
        "stream" | "s" => ExitCode::from(run_translate(&args, true).await),
        "models" => ExitCode::from(run_models(&args).await),
        "check" => ExitCode::from(run_check(&args).await),
        "config" => {
            let subcommand = args.get(2).map(|s| s.as_str()).unwrap_or("show");
            match subcommand {
                "show" => match config::load() {
                    Ok(settings) => {
                        print!("{}", settings.to_toml());
                        ExitCode::SUCCESS
                    }
                    Err(e) => {
                        eprintln!("Configuration error: {}", e);
                        ExitCode::FAILURE
                    }
                },
                "defaults" => {
                    print!("{}", Settings::default().to_toml());
                    ExitCode::SUCCESS
                }
                _ => {
                    eprintln!("Unknown config subcommand: {}", subcommand);
                    ExitCode::FAILURE
                }
            }
        }
        "help" | "--help" | "-h" => {
            print_usage();
            ExitCode::SUCCESS
        }
        "version" | "--version" | "-V" => {
            println!("tons-cli {}", env!("CARGO_PKG_VERSION"));
            ExitCode::SUCCESS
        }
        _ => {
            eprintln!("Unknown command: {}", command);
            print_usage();
            ExitCode::FAILURE
        }
    }
}

fn print_usage() {
    eprintln!(
        "tons-cli v{}

USAGE:
    tons-cli <COMMAND> [OPTIONS]

COMMANDS:
    translate    Translate text and print the result
    stream       Translate text, printing output as it is generated
    models       List Ollama models, or installed agents with --agents
    check        Check that the configured engine is usable
    config       Show settings (show, defaults)
    version      Show version information
    help         Show this help message

TRANSLATE / STREAM:
    tons-cli translate [--engine KIND] <SOURCE_LANG> <TARGET_LANG> [TEXT...]

    TEXT is read from stdin when omitted.
    KIND is internal, terminal-agent or ollama.

EXAMPLES:
    tons-cli translate English Korean \"Good morning\"
    echo 'Bonjour' | tons-cli stream French English
    TONS_ENGINE=ollama tons-cli models

ENVIRONMENT:
    TONS_CONFIG       Path to a TOML settings file
    TONS_ENGINE       Engine selection
    TONS_LOG          Log filter (default: warn)
    TONS_LOG_FORMAT   pretty or json
    TONS_LOG_FILE     Write logs to a file instead of stderr

EXIT CODES:
    0  Success
    1  Failure",
        env!("CARGO_PKG_VERSION")
    );
}

/// Parsed `translate` / `stream` arguments.
struct TranslateArgs {
    from: String,
    to: String,
    engine: Option<EngineKind>,
    text: Vec<String>,
}

fn parse_translate_args(args: &[String]) -> Result<TranslateArgs, String> {
    let mut engine = None;
    let mut positional = Vec::new();

    let mut i = 2;
    while i < args.len() {
        match args[i].as_str() {
            "--engine" => {
                let Some(value) = args.get(i + 1) else {
                    return Err("Missing value for --engine".into());
                };
                engine = Some(value.parse::<EngineKind>().map_err(|e| e.to_string())?);
                i += 2;
            }
            "--" => {
                positional.extend(args[i + 1..].iter().cloned());
                break;
            }
            flag if flag.starts_with("--") => return Err(format!("Unknown argument: {}", flag)),
            word => {
                positional.push(word.to_string());
                i += 1;
            }
        }
    }

    if positional.len() < 2 {
        return Err(format!(
            "Usage: tons-cli {} [--engine KIND] <SOURCE_LANG> <TARGET_LANG> [TEXT...]",
            args.get(1).map(|s| s.as_str()).unwrap_or("translate")
        ));
    }
    let text = positional.split_off(2);
    let to = positional.pop().unwrap_or_default();
    let from = positional.pop().unwrap_or_default();
    Ok(TranslateArgs { from, to, engine, text })
}

fn load_settings(engine: Option<EngineKind>) -> Result<Settings, u8> {
    let mut settings = config::load().map_err(|e| {
        eprintln!("Configuration error: {}", e);
        1u8
    })?;
    if let Some(kind) = engine {
        settings.engine = kind;
    }
    Ok(settings)
}

/// Token cancelled on Ctrl-C.
fn interrupt_token() -> CancellationToken {
    let token = CancellationToken::new();
    let on_signal = token.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("interrupted");
            on_signal.cancel();
        }
    });
    token
}

async fn run_translate(args: &[String], stream: bool) -> u8 {
    let parsed = match parse_translate_args(args) {
        Ok(parsed) => parsed,
        Err(message) => {
            eprintln!("{}", message);
            return 1;
        }
    };
    let settings = match load_settings(parsed.engine) {
        Ok(settings) => settings,
        Err(code) => return code,
    };

    let text = if parsed.text.is_empty() {
        let mut input = String::new();
        if let Err(e) = std::io::stdin().read_to_string(&mut input) {
            eprintln!("Failed to read stdin: {}", e);
            return 1;
        }
        input.trim_end().to_string()
    } else {
        parsed.text.join(" ")
    };

    let engine = match settings.build_engine() {
        Ok(engine) => engine,
        Err(e) => {
            eprintln!("Engine error: {}", e);
            return 1;
        }
    };
    let request = settings.request(text, parsed.from, parsed.to);
    let cancel = interrupt_token();

    let code = if stream {
        stream_to_stdout(engine.as_ref(), request, cancel).await
    } else {
        match engine.translate(&request, &cancel).await {
            Ok(response) => {
                println!("{}", response.text);
                0
            }
            Err(e) => report_failure(&e.to_string(), e.partial_text()),
        }
    };

    if let Err(e) = engine.close().await {
        tracing::warn!(error = %e, "engine close failed");
    }
    code
}

async fn stream_to_stdout(engine: &dyn Engine, request: tons_core::Request, cancel: CancellationToken) -> u8 {
    let mode = engine.stream_mode();
    let mut stream = match engine.translate_stream(request, cancel).await {
        Ok(stream) => stream,
        Err(e) => return report_failure(&e.to_string(), None),
    };

    let mut stdout = std::io::stdout().lock();
    let mut printed = String::new();
    while let Some(response) = stream.next().await {
        if let Some(error) = response.error.as_deref().filter(|e| !e.is_empty()) {
            let _ = writeln!(stdout);
            return report_failure(error, None);
        }
        let fresh = match mode {
            StreamMode::Delta => response.text.as_str(),
            // cumulative text only grows; print the new suffix
            StreamMode::Cumulative => response.text.strip_prefix(printed.as_str()).unwrap_or(""),
        };
        let _ = write!(stdout, "{}", fresh);
        let _ = stdout.flush();
        match mode {
            StreamMode::Delta => printed.push_str(&response.text),
            StreamMode::Cumulative if !response.text.is_empty() => printed = response.text.clone(),
            StreamMode::Cumulative => {}
        }
        if response.is_terminal() {
            break;
        }
    }
    let _ = writeln!(stdout);
    0
}

fn report_failure(message: &str, partial: Option<&str>) -> u8 {
    if let Some(partial) = partial.filter(|p| !p.is_empty()) {
        println!("{}", partial);
    }
    eprintln!("Translation failed: {}", message);
    1
}

async fn run_models(args: &[String]) -> u8 {
    if args.iter().skip(2).any(|a| a == "--agents") {
        for preset in AgentPreset::ALL {
            let engine = ProcessEngine::from_preset(preset);
            let status = if engine.is_installed() { "installed" } else { "missing" };
            println!("{:<12} {:<10} {}", preset.id(), status, engine.config().command);
        }
        return 0;
    }

    let settings = match load_settings(None) {
        Ok(settings) => settings,
        Err(code) => return code,
    };
    let engine = match RemoteEngine::new(settings.remote_config()) {
        Ok(engine) => engine,
        Err(e) => {
            eprintln!("Engine error: {}", e);
            return 1;
        }
    };
    match engine.list_models().await {
        Ok(models) => {
            for model in models {
                println!("{:<32} {:>12} {}", model.name, model.size, model.modified_at);
            }
            0
        }
        Err(e) => {
            eprintln!("Failed to list models: {}", e);
            1
        }
    }
}

async fn run_check(args: &[String]) -> u8 {
    let engine_arg = args.iter().position(|a| a == "--engine").and_then(|i| args.get(i + 1));
    let kind = match engine_arg.map(|v| v.parse::<EngineKind>()).transpose() {
        Ok(kind) => kind,
        Err(e) => {
            eprintln!("{}", e);
            return 1;
        }
    };
    let settings = match load_settings(kind) {
        Ok(settings) => settings,
        Err(code) => return code,
    };

    if settings.engine == EngineKind::Agent {
        let installed: Vec<String> = available_agents()
            .iter()
            .map(|agent| agent.config().name.clone())
            .collect();
        println!("installed agents: {}", if installed.is_empty() { "none".to_string() } else { installed.join(", ") });
    }

    let engine = match settings.build_engine() {
        Ok(engine) => engine,
        Err(e) => {
            eprintln!("{}: {}", settings.engine, e);
            return 1;
        }
    };
    if engine.available().await {
        println!("{}: available", engine.name());
        0
    } else {
        println!("{}: unavailable", engine.name());
        1
    }
}

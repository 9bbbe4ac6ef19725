//! tron: a terminal chat client for a local Ollama server.

use std::{
    io::{self, IsTerminal},
    path::PathBuf,
    process::ExitCode,
};

use clap::Parser;
use tokio::{io::BufReader, sync::oneshot};
use tracing::{debug, error};
use tracing_subscriber::EnvFilter;
use tron::{
    backend::OllamaServer,
    config::{Config, TransportKind},
    session::{self, BufReadSource, LineSource, ReedlineSource, Session, SessionOptions},
    transport::{HttpTransport, PipeTransport, Transport},
};

/// Chat with a local model through Ollama.
#[derive(Parser)]
#[command(name = "tron", version, about = "Chat with a local model through Ollama")]
struct Cli {
    /// Config file path
    #[arg(long)]
    config: Option<PathBuf>,

    /// How messages reach the backend
    #[arg(short, long, value_enum)]
    transport: Option<TransportKind>,

    /// Model to chat with
    #[arg(short, long)]
    model: Option<String>,

    /// Ollama host, including the port
    #[arg(long)]
    host: Option<String>,

    /// Print replies while they are generated
    #[arg(long)]
    stream: bool,

    /// Enable debug logging
    #[arg(short, long)]
    verbose: bool,
}

impl Cli {
    fn apply(&self, config: &mut Config) {
        if let Some(transport) = self.transport {
            config.backend.transport = transport;
        }
        if let Some(model) = &self.model {
            config.model.name = model.clone();
        }
        if let Some(host) = &self.host {
            config.backend.host = host.clone();
        }
        if self.stream {
            config.model.stream = true;
        }
    }
}

fn init_tracing(verbose: bool) {
    let default_directive = if verbose { "tron=debug" } else { "tron=warn" };
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_directive));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(verbose)
        .with_writer(io::stderr)
        .init();
}

fn build_transport(
    config: &Config,
    client: reqwest::Client,
) -> Result<Box<dyn Transport>, tron::Error> {
    let api = config.api();
    Ok(match config.backend.transport {
        TransportKind::Http => {
            Box::new(HttpTransport::single_turn(api, client).streaming(config.model.stream))
        }
        TransportKind::Context => Box::new(
            HttpTransport::with_context(api, client, config.speakers())
                .streaming(config.model.stream),
        ),
        TransportKind::Pipe => Box::new(PipeTransport::new(
            config.pipe_command(),
            config.backend.pipe_terminator.as_str(),
        )?),
    })
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    let runtime = match tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
    {
        Ok(runtime) => runtime,
        Err(err) => {
            eprintln!("Failed to initialize TRON: {err}");
            return ExitCode::FAILURE;
        }
    };

    let code = runtime.block_on(run(cli));
    // A pending read on stdin cannot be cancelled, do not wait for it.
    runtime.shutdown_background();
    code
}

/// Runs the client to completion and returns the process exit code.
async fn run(cli: Cli) -> ExitCode {
    let path = cli.config.clone().unwrap_or_else(Config::default_path);
    let mut config = match Config::load(&path) {
        Ok(config) => config,
        Err(err) => {
            error!(%err, "configuration rejected");
            eprintln!("Failed to initialize TRON: {err}");
            return ExitCode::FAILURE;
        }
    };
    cli.apply(&mut config);
    if let Err(err) = config.validate() {
        error!(%err, "command line rejected");
        eprintln!("Failed to initialize TRON: {err}");
        return ExitCode::FAILURE;
    }
    debug!(?config, "effective configuration");

    let hint = session::initialization_hint(&config.model.name);
    let fail = |err: &dyn std::fmt::Display| {
        eprintln!("Failed to initialize TRON: {err}");
        eprintln!("{hint}");
        ExitCode::FAILURE
    };

    let client = match tron::loopback_client() {
        Ok(client) => client,
        Err(err) => return fail(&err),
    };
    let transport = match build_transport(&config, client.clone()) {
        Ok(transport) => transport,
        Err(err) => return fail(&err),
    };
    let backend = OllamaServer::new(config.api(), client, config.backend.serve_command.clone());

    let persona = config.session.persona.clone();
    let options = SessionOptions {
        styled: io::stdout().is_terminal(),
        ..SessionOptions::from(&config)
    };
    let mut session = Session::new(backend, transport, io::stdout(), options);

    // Ctrl-C outside the line editor (while starting up, waiting for piped input or a reply).
    let (interrupt_tx, mut interrupt_rx) = oneshot::channel();
    session::on_interrupt(move || {
        let _ = interrupt_tx.send(());
    });

    let initialized = tokio::select! {
        result = session.initialize() => Some(result),
        Ok(()) = &mut interrupt_rx => None,
    };
    match initialized {
        Some(Ok(_)) => {}
        Some(Err(err)) => {
            session.shutdown().await;
            return fail(&err);
        }
        None => {
            println!("\n\n{persona}: Emergency shutdown initiated.");
            session.shutdown().await;
            return ExitCode::SUCCESS;
        }
    }

    let mut input: Box<dyn LineSource> = if io::stdin().is_terminal() {
        Box::new(ReedlineSource::new())
    } else {
        Box::new(BufReadSource::new(
            BufReader::new(tokio::io::stdin()),
            io::stdout(),
        ))
    };

    let outcome = tokio::select! {
        result = session.run(input.as_mut()) => result,
        Ok(()) = interrupt_rx => {
            println!("\n\n{persona}: Emergency shutdown initiated.");
            Ok(())
        }
    };
    session.shutdown().await;

    match outcome {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            error!(%err, "session ended abnormally");
            eprintln!("TRON: {err}");
            ExitCode::FAILURE
        }
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;

    fn config_file(content: &str) -> tempfile::NamedTempFile {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(content.as_bytes()).unwrap();
        file
    }

    fn cli(args: &[&str]) -> Cli {
        Cli::parse_from(std::iter::once("tron").chain(args.iter().copied()))
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_unreachable_backend_exits_with_failure() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let host = listener.local_addr().unwrap().to_string();
        drop(listener);

        let file = config_file(&format!(
            "[backend]\nhost = \"{host}\"\nserve_command = [\"definitely-not-an-ollama-binary\"]\nstartup_grace_ms = 0\n"
        ));
        let path = file.path().to_str().unwrap();

        assert_eq!(run(cli(&["--config", path])).await, ExitCode::FAILURE);
    }

    #[tokio::test]
    async fn test_invalid_config_exits_with_failure() {
        let file = config_file("[session]\nhistory_capacity = 0\n");
        let path = file.path().to_str().unwrap();

        assert_eq!(run(cli(&["--config", path])).await, ExitCode::FAILURE);
    }

    #[tokio::test]
    async fn test_empty_flag_values_are_rejected() {
        let file = config_file("");
        let path = file.path().to_str().unwrap();

        assert_eq!(
            run(cli(&["--config", path, "--model", ""])).await,
            ExitCode::FAILURE
        );
        assert_eq!(
            run(cli(&["--config", path, "--host", ""])).await,
            ExitCode::FAILURE
        );
    }

    #[test]
    fn test_flags_override_config() {
        let mut config = Config::default();
        cli(&["--transport", "http", "--model", "llama3.2", "--host", "127.0.0.1:1", "--stream"])
            .apply(&mut config);

        assert_eq!(config.backend.transport, TransportKind::Http);
        assert_eq!(config.model.name, "llama3.2");
        assert_eq!(config.backend.host, "127.0.0.1:1");
        assert!(config.model.stream);
    }
}

use anyhow::{bail, Context as _, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;

use signet_client::{
    sign_in, sign_out, ApiRequest, AttestationContext, ClientConfig, Credentials, RequestBody,
    RequestPipeline,
};

#[derive(Parser)]
#[command(name = "signet")]
#[command(author, version, about = "Signed, device-attested API client")]
#[command(propagate_version = true)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Path to config file
    #[arg(short, long, global = true, env = "SIGNET_CONFIG")]
    config: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Print the installation device id
    DeviceId,

    /// Print the session fingerprint
    Fingerprint,

    /// Sign a body with the configured secret
    Sign {
        /// JSON or plain text
        #[arg(long)]
        body: String,
    },

    /// Print a security envelope
    Envelope {
        #[arg(long)]
        body: Option<String>,
    },

    /// Print every header a request would carry
    Headers {
        #[arg(long)]
        body: Option<String>,
    },

    /// Send a request through the pipeline
    Request {
        /// HTTP method
        method: String,
        /// Path relative to the API root
        path: String,
        #[arg(long)]
        body: Option<String>,
        /// Query parameter as key=value (repeatable)
        #[arg(long = "query", short = 'q')]
        query: Vec<String>,
    },

    /// Sign in and store the session
    Login {
        #[arg(long)]
        username: String,
        #[arg(long, env = "SIGNET_PASSWORD", hide_env_values = true)]
        password: String,
    },

    /// Sign out and clear the local session
    Logout,

    /// Show device and session status
    Status,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let log_level = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(log_level)),
        )
        .with_writer(std::io::stderr)
        .init();

    let config = ClientConfig::load(cli.config.as_deref())?;
    let ctx = Arc::new(AttestationContext::builder(config).build()?);
    let pipeline = RequestPipeline::new(ctx.clone())?;

    match cli.command {
        Commands::DeviceId => println!("{}", ctx.device_id()),
        Commands::Fingerprint => println!("{}", ctx.fingerprint().await),
        Commands::Sign { body } => {
            println!("{}", ctx.signer().sign(&RequestBody::parse(&body)));
        }
        Commands::Envelope { body } => {
            let body = body.as_deref().map(RequestBody::parse);
            let envelope = ctx.signer().build_security_envelope(body.as_ref()).await;
            print_json(&serde_json::to_value(envelope)?)?;
        }
        Commands::Headers { body } => {
            ctx.geo().refresh_now().await;
            let body = body.as_deref().map(RequestBody::parse);
            let headers = pipeline.compose_headers(body.as_ref()).await;
            for (name, value) in &headers {
                println!("{name}: {}", value.to_str().unwrap_or("<binary>"));
            }
        }
        Commands::Request {
            method,
            path,
            body,
            query,
        } => {
            let method = reqwest::Method::from_bytes(method.to_ascii_uppercase().as_bytes())
                .with_context(|| format!("Invalid HTTP method: {method}"))?;
            let mut request = ApiRequest::new(method, path);
            if let Some(body) = body {
                request = request.with_body(RequestBody::parse(&body));
            }
            for pair in query {
                let Some((key, value)) = pair.split_once('=') else {
                    bail!("Query parameter must be key=value: {pair}");
                };
                request = request.with_query(key, value);
            }

            ctx.geo().refresh_now().await;
            let mut events = ctx.subscribe();
            match pipeline.send(request).await {
                Ok(response) => print_json(&response.body)?,
                Err(e) => {
                    print_json(&serde_json::to_value(e.envelope())?)?;
                    if e.ended_session() {
                        if let Ok(event) = events.try_recv() {
                            tracing::info!(query = %event.sign_in_query(), "Session terminated");
                        }
                    }
                    bail!("Request failed: {e}");
                }
            }
        }
        Commands::Login { username, password } => {
            let signed_in = sign_in(&pipeline, &Credentials { username, password }).await?;
            ctx.shutdown();
            print_json(&serde_json::json!({
                "user": signed_in.user,
                "expiresAt": signed_in.expires_at,
            }))?;
        }
        Commands::Logout => sign_out(&pipeline).await,
        Commands::Status => {
            let status = ctx.session_status();
            print_json(&serde_json::json!({
                "deviceId": ctx.device_id(),
                "durableStorage": ctx.has_durable_storage(),
                "crypto": {
                    "provider": ctx.crypto_provider_name(),
                    "capability": ctx.crypto_capability().to_string(),
                },
                "session": status,
            }))?;
        }
    }

    Ok(())
}

fn print_json(value: &serde_json::Value) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

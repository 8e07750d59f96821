//! go-sandbox CLI
//!
//! Reads a JSON execution request from a file or stdin, runs it and prints the
//! JSON result.

use std::io::Read;
use std::path::PathBuf;

use go_sandbox::{Error, ExecutionEngine, ExecutionRequest, SandboxConfig};

const CONFIG_ENV: &str = "GO_SANDBOX_CONFIG";

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::INFO.into()),
        )
        .with_writer(std::io::stderr)
        .init();

    let args: Vec<String> = std::env::args().collect();

    if args.iter().skip(1).any(|a| a == "-h" || a == "--help") || args.len() > 2 {
        let program = args.first().map(String::as_str).unwrap_or("go-sandbox");
        eprintln!("Usage: {} [request.json]", program);
        eprintln!("\nRuns a Go toolchain request in a sandbox. Reads stdin without a file.");
        eprintln!("\nEnvironment variables:");
        eprintln!("  {}=<path>  TOML sandbox configuration", CONFIG_ENV);
        eprintln!("  RUST_LOG=<filter>          Log filter (logs go to stderr)");
        eprintln!("\nExit status:");
        eprintln!("  0  the operation succeeded");
        eprintln!("  1  the operation ran and failed (result on stdout)");
        eprintln!("  2  the request was rejected or its workspace could not be prepared");
        eprintln!("  3  host failure");
        std::process::exit(2);
    }

    match run(args.get(1).map(PathBuf::from)).await {
        Ok(success) => std::process::exit(if success { 0 } else { 1 }),
        Err(e) => {
            eprintln!("Error: {}", e);
            std::process::exit(if e.is_request_side() { 2 } else { 3 });
        }
    }
}

async fn run(request_path: Option<PathBuf>) -> Result<bool, Error> {
    let config = match std::env::var_os(CONFIG_ENV) {
        Some(path) => SandboxConfig::load(&PathBuf::from(path))?,
        None => SandboxConfig::default(),
    };

    let text = match &request_path {
        Some(path) => std::fs::read_to_string(path)?,
        None => {
            let mut text = String::new();
            std::io::stdin().read_to_string(&mut text)?;
            text
        }
    };

    let request: ExecutionRequest = serde_json::from_str(&text)
        .map_err(|e| Error::InvalidRequest(format!("malformed request: {}", e)))?;

    let engine = ExecutionEngine::from_config(config);
    let result = engine.execute(&request).await?;

    let json = serde_json::to_string_pretty(&result)
        .map_err(|e| Error::Internal(format!("failed to serialize result: {}", e)))?;
    println!("{}", json);

    Ok(result.success)
}

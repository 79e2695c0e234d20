use std::time::Duration;

use unimask_rs::config::{DEFAULT_MAX_ITERATIONS, DEFAULT_READ_TIMEOUT_MS};
use unimask_rs::{Authenticator, ClaimRequest, ClaimResponse, Client};

fn parse_arg(flag: &str) -> Option<String> {
    let mut args = std::env::args();
    while let Some(arg) = args.next() {
        if arg == flag {
            return args.next();
        }
    }
    None
}

fn has_flag(flag: &str) -> bool {
    std::env::args().any(|arg| arg == flag)
}

fn print_help() {
    eprintln!(
        r#"unimask_client - send a single claim to a unimask server

USAGE:
    unimask_client --secret <SECRET> --repository <REPO> --source <VALUE> --target <VALUE> [OPTIONS]

OPTIONS:
        --connect <ADDR>        Server address [default: 127.0.0.1:7171]
        --secret <SECRET>       Shared handshake secret (or UNIMASK_SECRET)
        --repository <REPO>     Repository namespace
        --source <VALUE>        Original value
        --target <VALUE>        Masked candidate to claim
        --conflict <VALUE>      Iteration-0 candidate, for retries
        --iteration <N>         Retry iteration [default: 0]
        --timeout-ms <MS>       I/O timeout [default: 30000]
        --probe                 Resolve the source by probing <TARGET>, <TARGET>-1, <TARGET>-2, ...
        --max-iterations <N>    Probing limit [default: 10000]
    -h, --help                  Print help
"#
    );
}

fn required(flag: &str) -> anyhow::Result<String> {
    parse_arg(flag).ok_or_else(|| anyhow::anyhow!("{flag} is required"))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    if has_flag("-h") || has_flag("--help") {
        print_help();
        return Ok(());
    }

    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let addr = parse_arg("--connect").unwrap_or_else(|| "127.0.0.1:7171".to_string());
    let secret = parse_arg("--secret")
        .or_else(|| std::env::var("UNIMASK_SECRET").ok())
        .ok_or_else(|| anyhow::anyhow!("--secret is required"))?;
    let repository = required("--repository")?;
    let iteration = parse_arg("--iteration")
        .map(|value| value.parse::<u32>())
        .transpose()?
        .unwrap_or(0);
    let io_timeout = parse_arg("--timeout-ms")
        .map(|value| value.parse::<u64>())
        .transpose()?
        .unwrap_or(DEFAULT_READ_TIMEOUT_MS);

    let request = ClaimRequest {
        source: required("--source")?,
        target: required("--target")?,
        conflict: parse_arg("--conflict").filter(|value| !value.is_empty()),
        iteration,
    };

    let authenticator = Authenticator::new(&secret)?;
    let mut client =
        Client::connect_with(addr.as_str(), &authenticator, Duration::from_millis(io_timeout))
            .await?;

    if has_flag("--probe") {
        let max_iterations = parse_arg("--max-iterations")
            .map(|value| value.parse::<u32>())
            .transpose()?
            .unwrap_or(DEFAULT_MAX_ITERATIONS);
        let base = request.target.clone();
        let mask = move |_source: &str, iteration: u32| {
            if iteration == 0 {
                base.clone()
            } else {
                format!("{base}-{iteration}")
            }
        };
        let resolved = client
            .resolve_batch(&repository, std::slice::from_ref(&request.source), mask, max_iterations)
            .await?;
        for result in resolved {
            let line = match result {
                Ok(resolved) => serde_json::json!({
                    "repository": repository,
                    "source": resolved.source,
                    "target": resolved.target,
                    "iteration": resolved.iteration,
                    "linked": true,
                }),
                Err(err) => serde_json::json!({
                    "repository": repository,
                    "source": request.source,
                    "linked": false,
                    "error": err.to_string(),
                }),
            };
            println!("{line}");
        }
        return Ok(());
    }

    let responses = client
        .claim_batch(&repository, std::slice::from_ref(&request))
        .await?;

    for response in responses {
        let hint = match response {
            ClaimResponse::Rejected { hint } => hint,
            ClaimResponse::Linked => None,
        };
        let line = serde_json::json!({
            "repository": repository,
            "source": request.source,
            "target": request.target,
            "iteration": request.iteration,
            "linked": response.is_linked(),
            "iteration_hint": hint,
        });
        println!("{line}");
    }
    Ok(())
}

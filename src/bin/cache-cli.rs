use clap::{Parser, Subcommand};
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION};
use serde_json::{json, Value};

#[derive(Parser)]
#[command(name = "cache-cli")]
#[command(about = "Management CLI for the HTTP caching proxy", long_about = None)]
struct Cli {
    #[arg(short, long, default_value = "http://localhost:8081")]
    url: String,

    #[arg(short, long, default_value = "CHANGE_ME_IN_PRODUCTION")]
    key: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Show origin, store and lock status
    Status,
    /// Drop every stored variant of a URL (http and https forms)
    Purge {
        /// Absolute URL, e.g. http://example.com/page?a=1
        url: String,
    },
    /// Release the cache locks held by the proxy
    Cleanup,
    /// Drop dead variants and unreferenced bodies from the store
    Prune,
    /// Remove every stored entry and body
    Clear,
    /// Remove every variant tagged (Cache-Tags) with any of the given tags
    InvalidateTags {
        #[arg(required = true)]
        tags: Vec<String>,
    },
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();
    let client = reqwest::Client::new();

    let mut headers = HeaderMap::new();
    headers.insert(
        AUTHORIZATION,
        HeaderValue::from_str(&format!("Bearer {}", cli.key))?,
    );

    let res = match cli.command {
        Commands::Status => {
            client
                .get(format!("{}/admin/status", cli.url))
                .headers(headers)
                .send()
                .await?
        }
        Commands::Purge { url } => {
            client
                .post(format!("{}/admin/purge", cli.url))
                .headers(headers)
                .json(&json!({ "url": url }))
                .send()
                .await?
        }
        Commands::Cleanup => {
            client
                .post(format!("{}/admin/cleanup", cli.url))
                .headers(headers)
                .send()
                .await?
        }
        Commands::Prune => {
            client
                .post(format!("{}/admin/prune", cli.url))
                .headers(headers)
                .send()
                .await?
        }
        Commands::Clear => {
            client
                .post(format!("{}/admin/clear", cli.url))
                .headers(headers)
                .send()
                .await?
        }
        Commands::InvalidateTags { tags } => {
            client
                .post(format!("{}/admin/invalidate-tags", cli.url))
                .headers(headers)
                .json(&json!({ "tags": tags }))
                .send()
                .await?
        }
    };
    print_response(res).await?;

    Ok(())
}

async fn print_response(res: reqwest::Response) -> Result<(), Box<dyn std::error::Error>> {
    let status = res.status();
    if !status.is_success() {
        eprintln!("Error: Admin API returned status {}", status);
        if let Ok(text) = res.text().await {
            eprintln!("Response: {}", text);
        }
        std::process::exit(1);
    }

    let json: Value = res.json().await?;
    println!("{}", serde_json::to_string_pretty(&json)?);
    Ok(())
}

//! DQL CLI
//!
//! Command-line interface for the DQL engine:
//! - Explain queries offline (namespace and native query)
//! - Run queries against a running server
//! - Check server status
//! - Generate a default config file

use std::path::PathBuf;

use chrono::Utc;
use clap::{Parser, Subcommand};
use serde_json::{json, Value as Json};

use dql_engine::config::generate_default_config;
use dql_engine::query::{Compiler, QuerySpec};

#[derive(Parser)]
#[command(name = "dql-cli")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Compile and run DQL queries")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// API server URL
    #[arg(long, default_value = "http://localhost:8390", global = true)]
    pub api_url: String,

    /// Output format (table, json)
    #[arg(short, long, default_value = "table", global = true)]
    pub format: String,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Parse and resolve a query without running it
    Explain {
        /// DQL text
        query: String,
    },

    /// Run a query on the server
    Query {
        /// DQL text
        query: String,
        /// Workspace the query runs in
        #[arg(short, long)]
        workspace: String,
        /// Echo native queries in the results
        #[arg(long)]
        explain: bool,
        /// Read logging from the backup index
        #[arg(long)]
        backup: bool,
        /// Result limit
        #[arg(short, long)]
        limit: Option<i64>,
    },

    /// Show server status
    Status,

    /// Generate default config file
    Config {
        /// Output path (default: stdout)
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Explain { query } => {
            let results = Compiler::default()
                .compile(&QuerySpec::new(query), Utc::now().timestamp_millis())?;

            if cli.format == "json" {
                println!("{}", serde_json::to_string_pretty(&results)?);
                return Ok(());
            }
            for (i, ast) in results.iter().enumerate() {
                println!("#{} [{}] {}", i, ast.namespace, ast.stmt.kind());
                let text = ast.query_text();
                if text.is_empty() {
                    println!("  (inner queries are translated when the statement runs)");
                } else {
                    println!("  {}", text);
                }
            }
        }

        Commands::Query {
            query,
            workspace,
            explain,
            backup,
            limit,
        } => {
            let mut spec = json!({ "query": query });
            if let Some(limit) = limit {
                spec["limit"] = json!(limit);
            }
            let body = json!({
                "workspace": workspace,
                "queries": [spec],
                "explain": explain,
            });
            let path = if backup { "query/backup" } else { "query" };

            let response = reqwest::Client::new()
                .post(format!("{}/api/v1/{}", cli.api_url, path))
                .json(&body)
                .send()
                .await?;

            if !response.status().is_success() {
                let status = response.status();
                let text = response.text().await.unwrap_or_default();
                eprintln!("Query failed ({}): {}", status, text);
                std::process::exit(1);
            }

            let data: Json = response.json().await?;
            match cli.format.as_str() {
                "json" => println!("{}", serde_json::to_string_pretty(&data)?),
                _ => print_table(&data),
            }
        }

        Commands::Status => {
            let response = reqwest::Client::new()
                .get(format!("{}/health", cli.api_url))
                .send()
                .await;

            match response {
                Ok(resp) if resp.status().is_success() => {
                    let health: Json = resp.json().await?;
                    println!("DQL engine {}", health["version"].as_str().unwrap_or("unknown"));
                    println!();
                    println!("Status:    {}", health["status"].as_str().unwrap_or("unknown"));
                    println!("Workers:   {}", health["workers"].as_str().unwrap_or("unknown"));
                    println!("Completed: {}", health["completed_requests"].as_u64().unwrap_or(0));
                    println!("Crashes:   {}", health["worker_crashes"].as_u64().unwrap_or(0));
                    if let Some(uptime) = health["uptime_seconds"].as_u64() {
                        println!("Uptime:    {}", format_duration(uptime));
                    }
                }
                Ok(resp) => {
                    eprintln!("Server unhealthy: {}", resp.status());
                    std::process::exit(1);
                }
                Err(e) => {
                    eprintln!("Cannot connect to {}: {}", cli.api_url, e);
                    std::process::exit(1);
                }
            }
        }

        Commands::Config { output } => {
            let config = generate_default_config();
            match output {
                Some(path) => {
                    std::fs::write(&path, config)?;
                    println!("Config written to {}", path.display());
                }
                None => print!("{}", config),
            }
        }
    }

    Ok(())
}

fn cell_text(v: &Json) -> String {
    match v {
        Json::Null => "-".to_string(),
        Json::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn print_table(data: &Json) {
    let Some(results) = data["content"].as_array() else {
        println!("No results");
        return;
    };

    for (i, result) in results.iter().enumerate() {
        if let Some(raw) = result["raw_query"].as_str() {
            println!("#{} {}", i, raw);
        }
        let series = result["series"].as_array().cloned().unwrap_or_default();
        if series.is_empty() {
            println!("#{} (no data)", i);
            continue;
        }

        for row in &series {
            let columns: Vec<String> = row["columns"]
                .as_array()
                .map(|c| c.iter().map(cell_text).collect())
                .unwrap_or_default();
            let values: Vec<Vec<String>> = row["values"]
                .as_array()
                .map(|rows| {
                    rows.iter()
                        .map(|t| t.as_array().map(|t| t.iter().map(cell_text).collect()).unwrap_or_default())
                        .collect()
                })
                .unwrap_or_default();

            let mut widths: Vec<usize> = columns.iter().map(|c| c.len()).collect();
            for tuple in &values {
                for (w, cell) in widths.iter_mut().zip(tuple) {
                    *w = (*w).max(cell.len());
                }
            }

            let name = row["name"].as_str().unwrap_or_default();
            match row["tags"].as_object() {
                Some(tags) if !tags.is_empty() => {
                    let tags: Vec<String> =
                        tags.iter().map(|(k, v)| format!("{}={}", k, cell_text(v))).collect();
                    println!("{} {{{}}}", name, tags.join(", "));
                }
                _ => println!("{}", name),
            }

            let line = |cells: &[String]| {
                cells
                    .iter()
                    .zip(&widths)
                    .map(|(c, w)| format!("{:<width$}", c, width = *w))
                    .collect::<Vec<_>>()
                    .join("  ")
            };
            println!("{}", line(&columns));
            println!("{}", widths.iter().map(|w| "-".repeat(*w)).collect::<Vec<_>>().join("  "));
            for tuple in &values {
                println!("{}", line(tuple));
            }
            println!();
        }
    }
}

fn format_duration(seconds: u64) -> String {
    let days = seconds / 86400;
    let hours = (seconds % 86400) / 3600;
    let minutes = (seconds % 3600) / 60;

    if days > 0 {
        format!("{}d {}h {}m", days, hours, minutes)
    } else if hours > 0 {
        format!("{}h {}m", hours, minutes)
    } else {
        format!("{}m {}s", minutes, seconds % 60)
    }
}

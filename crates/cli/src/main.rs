//! vidforgectl - operator client for the vidforge daemon
//!
//! Every invocation opens a session, impersonates an owner when asked,
//! runs one command and closes the session again.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use colored::Colorize;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tabled::{Table, Tabled};

const DEFAULT_RPC_URL: &str = "http://127.0.0.1:9537";

#[derive(Parser)]
#[command(name = "vidforgectl")]
#[command(about = "vidforge job orchestration CLI", long_about = None)]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// RPC server URL
    #[arg(long, env = "VIDFORGE_RPC_URL", default_value = DEFAULT_RPC_URL)]
    rpc_url: String,

    /// User id the session acts as
    #[arg(long, env = "VIDFORGE_USER", default_value = "0")]
    user: i64,

    /// Open the session with elevated rights (all owners visible).
    /// The daemon only grants this to users in `rpc.elevated_users`.
    #[arg(long)]
    elevated: bool,

    /// Impersonate this owner (requires --elevated)
    #[arg(long)]
    as_owner: Option<i64>,
}

#[derive(Clone, Copy, ValueEnum)]
enum Kind {
    Download,
    Parse,
    Generate,
}

impl Kind {
    fn as_str(self) -> &'static str {
        match self {
            Kind::Download => "download",
            Kind::Parse => "parse",
            Kind::Generate => "generate",
        }
    }
}

#[derive(Subcommand)]
enum Commands {
    /// Submit a new job
    Submit {
        #[command(subcommand)]
        job: SubmitJob,
    },

    /// Show one job
    Status {
        job_id: String,
        #[arg(short, long)]
        kind: Option<Kind>,
    },

    /// List jobs grouped by status
    List {
        #[arg(short, long)]
        kind: Option<Kind>,
    },

    /// Job counts per status
    Stats {
        #[arg(short, long)]
        kind: Option<Kind>,
    },

    /// Requeue a failed job
    Retry { job_id: String },

    /// Delete a job that is not running
    Remove { job_id: String },

    /// Submission counters of the session's user
    Usage,

    /// Queue mode of the daemon
    Mode,
}

#[derive(Subcommand)]
enum SubmitJob {
    /// Fetch a video
    Download {
        video_id: String,
        #[arg(long)]
        quality: Option<String>,
        #[arg(long)]
        cookies: Option<String>,
    },
    /// Fetch captions
    Parse {
        video_id: String,
        /// Comma separated language codes
        #[arg(long, value_delimiter = ',')]
        languages: Vec<String>,
        #[arg(long)]
        cookies: Option<String>,
    },
    /// Translate and synthesize
    Generate {
        video_id: String,
        /// Comma separated target language codes
        #[arg(long, value_delimiter = ',', required = true)]
        languages: Vec<String>,
        #[arg(long)]
        sheet_id: Option<String>,
        #[arg(long)]
        sheet_row: Option<String>,
        #[arg(long)]
        voice: Option<String>,
    },
}

impl SubmitJob {
    fn payload(&self) -> Value {
        match self {
            SubmitJob::Download {
                video_id,
                quality,
                cookies,
            } => json!({
                "type": "download",
                "video_id": video_id,
                "quality": quality,
                "cookies_path": cookies,
            }),
            SubmitJob::Parse {
                video_id,
                languages,
                cookies,
            } => json!({
                "type": "parse",
                "video_id": video_id,
                "languages": languages,
                "cookies_path": cookies,
            }),
            SubmitJob::Generate {
                video_id,
                languages,
                sheet_id,
                sheet_row,
                voice,
            } => json!({
                "type": "generate",
                "video_id": video_id,
                "target_languages": languages,
                "sheet_id": sheet_id,
                "sheet_row": sheet_row,
                "voice": voice,
            }),
        }
    }
}

#[derive(Serialize)]
struct JsonRpcRequest<'a> {
    jsonrpc: &'static str,
    method: &'a str,
    params: Value,
    id: u64,
}

#[derive(Deserialize)]
struct JsonRpcResponse {
    result: Option<Value>,
    error: Option<JsonRpcError>,
}

#[derive(Deserialize)]
struct JsonRpcError {
    code: i32,
    message: String,
}

#[derive(Tabled)]
struct JobRow {
    id: String,
    kind: String,
    owner: String,
    status: String,
    progress: String,
    attempts: String,
}

impl JobRow {
    fn from_job(job: &Value) -> Self {
        let text = |key: &str| match &job[key] {
            Value::String(s) => s.clone(),
            Value::Null => "-".to_string(),
            other => other.to_string(),
        };
        Self {
            id: text("id"),
            kind: text("kind"),
            owner: text("owner_id"),
            status: text("status"),
            progress: format!("{}%", job["progress_percent"]),
            attempts: format!("{}/{}", job["attempts"], job["max_attempts"]),
        }
    }
}

struct RpcClient {
    http: reqwest::Client,
    url: String,
}

impl RpcClient {
    fn new(url: String) -> Self {
        Self {
            http: reqwest::Client::new(),
            url,
        }
    }

    async fn call(&self, method: &str, params: Value) -> Result<Value> {
        let request = JsonRpcRequest {
            jsonrpc: "2.0",
            method,
            params,
            id: 1,
        };
        let response: JsonRpcResponse = self
            .http
            .post(&self.url)
            .json(&request)
            .send()
            .await
            .context("Failed to connect to daemon")?
            .json()
            .await
            .context("Failed to parse response")?;

        if let Some(error) = response.error {
            anyhow::bail!("RPC error ({}): {}", error.code, error.message);
        }
        response
            .result
            .ok_or_else(|| anyhow::anyhow!("No result in response"))
    }
}

fn kind_param(kind: Option<Kind>) -> Value {
    kind.map_or(Value::Null, |k| Value::String(k.as_str().to_string()))
}

fn print_jobs(title: &str, jobs: &Value) {
    let rows: Vec<JobRow> = jobs
        .as_array()
        .map(|jobs| jobs.iter().map(JobRow::from_job).collect())
        .unwrap_or_default();
    println!("{} ({})", title.cyan().bold(), rows.len());
    if !rows.is_empty() {
        println!("{}", Table::new(rows));
    }
}

async fn run(client: &RpcClient, token: &str, command: Commands) -> Result<()> {
    match command {
        Commands::Submit { job } => {
            let result = client
                .call(
                    "jobs.submit.v1",
                    json!({"token": token, "payload": job.payload()}),
                )
                .await?;
            println!("{}", "✓ Job submitted".green().bold());
            println!("  {} {}", "Job ID:".bold(), result["job_id"]);
            println!("  {} {}", "Status:".bold(), result["status"]);
            println!("  {} {}", "Backend:".bold(), result["backend"]);
        }

        Commands::Status { job_id, kind } => {
            let job = client
                .call(
                    "jobs.status.v1",
                    json!({"token": token, "job_id": job_id, "kind": kind_param(kind)}),
                )
                .await?;
            if job.is_null() {
                println!("{}", format!("Job {} not found", job_id).yellow());
                return Ok(());
            }
            println!("{}", Table::new(vec![JobRow::from_job(&job)]));
            if let Some(step) = job["progress_meta"]["current_step"].as_str() {
                println!("  {} {}", "Step:".bold(), step);
            }
            if !job["result"].is_null() {
                println!("  {} {}", "Result:".bold(), job["result"]);
            }
            if !job["error"].is_null() {
                println!("  {} {}", "Error:".red().bold(), job["error"]["message"]);
            }
        }

        Commands::List { kind } => {
            let listing = client
                .call("jobs.list.v1", json!({"token": token, "kind": kind_param(kind)}))
                .await?;
            print_jobs("Waiting", &listing["waiting"]);
            print_jobs("Active", &listing["active"]);
            print_jobs("Completed", &listing["completed"]);
            print_jobs("Failed", &listing["failed"]);
        }

        Commands::Stats { kind } => {
            let stats = client
                .call("jobs.stats.v1", json!({"token": token, "kind": kind_param(kind)}))
                .await?;
            println!("  {} {}", "Waiting:".bold(), stats["waiting"]);
            println!("  {} {}", "Active:".bold(), stats["active"]);
            println!("  {} {}", "Completed:".bold(), stats["completed"]);
            println!("  {} {}", "Failed:".bold(), stats["failed"]);
            println!("  {} {}", "Total:".bold(), stats["total"]);
        }

        Commands::Retry { job_id } => {
            let job = client
                .call("jobs.retry.v1", json!({"token": token, "job_id": job_id}))
                .await?;
            println!("{}", format!("✓ Job {} requeued", job_id).green().bold());
            println!("{}", Table::new(vec![JobRow::from_job(&job)]));
        }

        Commands::Remove { job_id } => {
            client
                .call("jobs.remove.v1", json!({"token": token, "job_id": job_id}))
                .await?;
            println!("{}", format!("✓ Job {} removed", job_id).green().bold());
        }

        Commands::Usage => {
            let usage = client.call("usage.get.v1", json!({"token": token})).await?;
            println!("{} {}", "Usage for user".cyan().bold(), usage["user_id"]);
            for entry in usage["usage"].as_array().into_iter().flatten() {
                println!("  {:<10} {}", entry["kind"].as_str().unwrap_or("?"), entry["submitted"]);
            }
        }

        Commands::Mode => {
            let mode = client.call("system.mode.v1", json!({})).await?;
            let label = match mode["mode"].as_str() {
                Some("broker") => "BROKER".green(),
                Some(other) => other.to_uppercase().yellow(),
                None => "UNKNOWN".red(),
            };
            println!("  {} {}", "Mode:".bold(), label);
            println!("  {} {}", "Version:".bold(), mode["version"]);
        }
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let client = RpcClient::new(cli.rpc_url);

    let session = client
        .call(
            "session.open.v1",
            json!({"user_id": cli.user, "elevated": cli.elevated}),
        )
        .await?;
    let token = session["token"]
        .as_str()
        .context("session.open.v1 returned no token")?
        .to_string();

    if let Some(owner) = cli.as_owner {
        client
            .call(
                "session.impersonate.v1",
                json!({"token": token, "owner_id": owner}),
            )
            .await?;
    }

    let outcome = run(&client, &token, cli.command).await;
    // The session is gone either way once the process exits
    let _ = client
        .call("session.close.v1", json!({"token": token}))
        .await;
    outcome
}

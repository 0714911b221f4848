use clap::Parser;
use serde_json::{Map, Value};

#[derive(Parser, Debug)]
#[command(name = "dispatch-submit")]
#[command(about = "Submit a job to a dispatch-lite orchestrator")]
struct Args {
    /// Orchestrator base URL
    #[arg(long, default_value = "http://127.0.0.1:8420")]
    addr: String,

    /// Bearer token from /api/auth/login
    #[arg(long, env = "DISPATCH_TOKEN")]
    token: String,

    /// Name of the job spec to run
    spec_name: String,

    /// Runtime arguments as a JSON object
    json_args: Option<String>,

    /// Recorded as the job creator
    #[arg(long)]
    created_by: Option<String>,

    /// Target queue (defaults to the orchestrator's default queue)
    #[arg(long)]
    queue: Option<String>,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    let runtime_args: Map<String, Value> = match &args.json_args {
        Some(raw) => match serde_json::from_str::<Value>(raw)? {
            Value::Object(map) => map,
            _ => {
                eprintln!("json_args must be a JSON object");
                std::process::exit(2);
            }
        },
        None => Map::new(),
    };

    let body = serde_json::json!({
        "spec_name": args.spec_name,
        "runtime_args": runtime_args,
        "created_by": args.created_by,
        "queue": args.queue,
    });

    let response = reqwest::Client::new()
        .post(format!("{}/api/jobs/run", args.addr.trim_end_matches('/')))
        .bearer_auth(&args.token)
        .json(&body)
        .send()
        .await?;

    let status = response.status();
    let payload: Value = response.json().await?;
    if status.is_success() {
        println!("Job submitted successfully!");
        if let Some(id) = payload.get("id").and_then(|v| v.as_str()) {
            println!("Job ID: {id}");
        }
        if let Some(queue) = payload.get("queue_name").and_then(|v| v.as_str()) {
            println!("Queue: {queue}");
        }
    } else {
        let error = payload
            .get("error")
            .and_then(|v| v.as_str())
            .unwrap_or("unknown error");
        eprintln!("Job submission failed ({status}): {error}");
        std::process::exit(1);
    }

    Ok(())
}

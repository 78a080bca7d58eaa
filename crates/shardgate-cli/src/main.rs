use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use reqwest::blocking::Client;
use serde::Deserialize;
use serde_json::{json, Value};
use shardgate_core::{FindRequest, Namespace};
use tokio::runtime::Runtime;

#[derive(Parser)]
#[command(name = "shardgate", version, about = "Shardgate cluster CLI", long_about = None)]
struct Cli {
    /// Router URL
    #[arg(long, env = "SHARDGATE_URL", default_value = "http://127.0.0.1:27017")]
    url: String,

    /// Bearer token sent with every request
    #[arg(long, env = "SHARDGATE_TOKEN")]
    token: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Query a collection and print every matching document
    Find {
        ns: String,
        #[arg(long, default_value = "{}")]
        filter: String,
        #[arg(long)]
        sort: Option<String>,
        #[arg(long)]
        projection: Option<String>,
        #[arg(long)]
        skip: Option<u64>,
        #[arg(long)]
        limit: Option<u64>,
        #[arg(long)]
        batch_size: Option<u32>,
        /// Return what reachable shards have instead of failing
        #[arg(long)]
        partial: bool,
    },
    /// Insert documents given as a JSON object or array
    Insert {
        ns: String,
        #[arg(long)]
        json: String,
    },
    /// Register a shard by id and connection string (`host:port` or `set/h1:p,h2:p`)
    AddShard {
        id: String,
        host: String,
        #[arg(long, default_value_t = 0)]
        max_size_bytes: u64,
    },
    /// Start or continue draining a shard
    RemoveShard { id: String },
    /// List shards
    Shards,
    /// Create a database with sharding enabled
    EnableSharding {
        db: String,
        #[arg(long)]
        primary: Option<String>,
    },
    /// Shard a collection on a key pattern such as '{"userId": 1}'
    ShardCollection {
        ns: String,
        #[arg(long)]
        key: String,
        #[arg(long)]
        unique: bool,
        /// Initial split point, repeatable
        #[arg(long = "split-at")]
        split_at: Vec<String>,
    },
    /// Split the chunk containing --find at the given points
    Split {
        ns: String,
        #[arg(long)]
        find: String,
        #[arg(long = "at", required = true)]
        at: Vec<String>,
    },
    /// Move the chunk containing --find to another shard
    MoveChunk {
        ns: String,
        #[arg(long)]
        find: String,
        #[arg(long)]
        to: String,
        #[arg(long)]
        force_jumbo: bool,
        #[arg(long)]
        wait_for_delete: bool,
    },
    /// Show the routing table of a collection
    Routing { ns: String },
    /// Run one balancer round
    Balance,
    /// Run the server in this process (configured by SHARDGATE_* variables)
    Serve {
        #[arg(long, default_value = "router")]
        role: String,
        #[arg(long, default_value = "0.0.0.0:27017")]
        listen: String,
        #[arg(long)]
        data_dir: Option<String>,
    },
}

#[derive(Deserialize)]
struct Resp {
    ok: bool,
    #[serde(default)]
    data: Value,
    #[serde(default)]
    message: Option<String>,
}

struct Api {
    client: Client,
    base: String,
    token: Option<String>,
}

impl Api {
    fn request(&self, method: reqwest::Method, path: &str, body: Option<Value>) -> Result<Value> {
        let mut req = self.client.request(method, format!("{}{path}", self.base.trim_end_matches('/')));
        if let Some(t) = &self.token {
            req = req.bearer_auth(t);
        }
        if let Some(body) = body {
            req = req.json(&body);
        }
        let resp = req.send()?;
        let status = resp.status();
        if status == reqwest::StatusCode::UNAUTHORIZED || status == reqwest::StatusCode::FORBIDDEN {
            anyhow::bail!("server answered {status}; check SHARDGATE_TOKEN");
        }
        let parsed: Resp = resp.json().with_context(|| format!("unreadable reply ({status})"))?;
        if !parsed.ok {
            anyhow::bail!(
                "{}",
                parsed.message.unwrap_or_else(|| format!("server returned ok=false ({status})"))
            );
        }
        Ok(parsed.data)
    }

    fn get(&self, path: &str) -> Result<Value> {
        self.request(reqwest::Method::GET, path, None)
    }

    fn post(&self, path: &str, body: Value) -> Result<Value> {
        self.request(reqwest::Method::POST, path, Some(body))
    }
}

fn parse_json(label: &str, s: &str) -> Result<Value> {
    serde_json::from_str(s).with_context(|| format!("--{label} is not valid JSON"))
}

fn print(value: &Value) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let api = Api {
        client: Client::builder().user_agent("shardgate-cli").build()?,
        base: cli.url,
        token: cli.token,
    };

    match cli.command {
        Commands::Find {
            ns,
            filter,
            sort,
            projection,
            skip,
            limit,
            batch_size,
            partial,
        } => {
            let ns = Namespace::parse(&ns)?;
            let mut request = FindRequest::new(ns.clone(), parse_json("filter", &filter)?);
            request.sort = sort.as_deref().map(|s| parse_json("sort", s)).transpose()?;
            request.projection = projection.as_deref().map(|s| parse_json("projection", s)).transpose()?;
            request.skip = skip;
            request.limit = limit;
            request.batch_size = batch_size;
            request.allow_partial_results = partial;
            let mut reply = api.post("/v1/find", serde_json::to_value(&request)?)?;
            if reply["partial_results_returned"] == json!(true) {
                eprintln!("warning: some shards were unreachable, results are partial");
            }
            loop {
                for doc in reply["batch"].as_array().into_iter().flatten() {
                    println!("{doc}");
                }
                let cursor_id = reply["cursor_id"].as_u64().unwrap_or(0);
                if cursor_id == 0 {
                    break;
                }
                reply = api.post(
                    "/v1/getMore",
                    json!({"ns": ns, "cursor_id": cursor_id, "batch_size": batch_size}),
                )?;
            }
        }
        Commands::Insert { ns, json } => {
            let ns = Namespace::parse(&ns)?;
            let documents = match parse_json("json", &json)? {
                Value::Array(docs) => docs,
                doc => vec![doc],
            };
            print(&api.post("/v1/insert", json!({"ns": ns, "documents": documents}))?)?;
        }
        Commands::AddShard { id, host, max_size_bytes } => {
            print(&api.post(
                "/v1/admin/shards",
                json!({"id": id, "host": host, "max_size_bytes": max_size_bytes}),
            )?)?;
        }
        Commands::RemoveShard { id } => {
            print(&api.request(reqwest::Method::DELETE, &format!("/v1/admin/shards/{id}"), None)?)?;
        }
        Commands::Shards => {
            for shard in api.get("/v1/admin/shards")?.as_array().into_iter().flatten() {
                println!(
                    "{}\t{}{}",
                    shard["id"].as_str().unwrap_or("?"),
                    shard["connection_string"],
                    if shard["draining"] == json!(true) { "\tdraining" } else { "" }
                );
            }
        }
        Commands::EnableSharding { db, primary } => {
            print(&api.post(
                "/v1/admin/databases",
                json!({"db": db, "primary": primary, "sharding": true}),
            )?)?;
        }
        Commands::ShardCollection {
            ns,
            key,
            unique,
            split_at,
        } => {
            let points = split_at
                .iter()
                .map(|p| parse_json("split-at", p))
                .collect::<Result<Vec<_>>>()?;
            let version = api.post(
                "/v1/admin/shardCollection",
                json!({"ns": ns, "key": parse_json("key", &key)?, "unique": unique, "split_points": points}),
            )?;
            println!("sharded {ns} at version {version}");
        }
        Commands::Split { ns, find, at } => {
            let points = at.iter().map(|p| parse_json("at", p)).collect::<Result<Vec<_>>>()?;
            let version = api.post(
                "/v1/admin/split",
                json!({"ns": ns, "find": parse_json("find", &find)?, "points": points}),
            )?;
            println!("split {ns}, collection version now {version}");
        }
        Commands::MoveChunk {
            ns,
            find,
            to,
            force_jumbo,
            wait_for_delete,
        } => {
            print(&api.post(
                "/v1/admin/moveChunk",
                json!({
                    "ns": ns,
                    "find": parse_json("find", &find)?,
                    "to": to,
                    "force_jumbo": force_jumbo,
                    "wait_for_delete": wait_for_delete,
                }),
            )?)?;
        }
        Commands::Routing { ns } => print(&api.get(&format!("/v1/admin/routing/{ns}"))?)?,
        Commands::Balance => {
            let moves = api.post("/v1/admin/balance", json!({}))?;
            let n = moves.as_array().map(Vec::len).unwrap_or(0);
            println!("balancer moved {n} chunk(s)");
            if n > 0 {
                print(&moves)?;
            }
        }
        Commands::Serve { role, listen, data_dir } => {
            std::env::set_var("SHARDGATE_ROLE", role);
            std::env::set_var("SHARDGATE_LISTEN", listen);
            if let Some(dir) = data_dir {
                std::env::set_var("SHARDGATE_DATA", dir);
            }
            let rt = Runtime::new()?;
            rt.block_on(shardgate_server::serve_from_env())?;
        }
    }
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    shardgate_server::serve_from_env().await
}

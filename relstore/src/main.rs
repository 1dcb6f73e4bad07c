use relstore::{cmd::StoreCommand, conf::StoreConf};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cmd: StoreCommand = argh::from_env();
    let conf = StoreConf::from_env();
    if conf.log_init {
        tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .init();
    }
    relstore::cmd::run(cmd, &conf).await
}

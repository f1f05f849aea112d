use clap::Parser;
use std::path::PathBuf;
use uaproxy_bin::{Overrides, run};
use uaproxy_config::RewriteMode;

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Args {
    #[arg(short, long, default_value = "/etc/uaproxy/config.yaml")]
    config: PathBuf,

    #[arg(short, long, default_value = "info")]
    log_level: String,

    /// DIRECT, GLOBAL or RULE
    #[arg(long)]
    mode: Option<RewriteMode>,

    /// Replacement User-Agent
    #[arg(short = 'f', long)]
    user_agent: Option<String>,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();
    let overrides = Overrides {
        log_level: Some(args.log_level),
        mode: args.mode,
        user_agent: args.user_agent,
    };
    run(&args.config, overrides).await
}

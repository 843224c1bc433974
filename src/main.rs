use chain_exporter_lib::{cli::parse_args, commands::run_export};

#[tokio::main]
async fn main() {
    let cli = parse_args();
    std::process::exit(run_export(cli).await);
}

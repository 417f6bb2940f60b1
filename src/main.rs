use harvest_worker_lib::{cli::parse_args, commands::run_command};

#[tokio::main]
async fn main() {
    let cli = parse_args();
    let exit_code = run_command(cli).await;
    std::process::exit(exit_code);
}

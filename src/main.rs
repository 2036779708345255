mod cli;
mod config;
mod core;
mod interfaces;
mod logging;
mod skills;

#[tokio::main]
async fn main() {
    logging::init();
    if let Err(e) = cli::run_main().await {
        cli::print_error(&format!("{:#}", e));
        std::process::exit(1);
    }
}

use clap::Parser;

fn main() {
    let cli = podcastctl::Cli::parse();
    podcastctl::init_tracing(cli.log_level.as_deref());
    if let Err(err) = podcastctl::run(cli) {
        eprintln!("error: {err}");
        std::process::exit(1);
    }
}

use clap::Parser;

fn main() {
    let cli = audiopipectl::Cli::parse();
    audiopipectl::init_logging(cli.verbose);
    if let Err(err) = audiopipectl::run(cli) {
        eprintln!("error: {err}");
        std::process::exit(1);
    }
}

use clap::Parser;

mod cli;
mod vision;

fn main() {
    if let Err(err) = cli::Cli::parse().run() {
        eprintln!("{err:?}");
        std::process::exit(1);
    }
}

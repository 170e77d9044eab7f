use clap::Parser;
use ubifvm::cli::{load_config, run_command, CommonArgs, Command};
use ubifvm::Result;

#[derive(Parser)]
#[command(
    name = "fvm-ctl",
    version,
    author,
    about = "Format, inspect and manage a volume of virtual partitions."
)]
struct Args {
    #[command(flatten)]
    common: CommonArgs,

    #[command(subcommand)]
    command: Command,
}

fn main() -> Result<()> {
    env_logger::builder().format_timestamp(None).init();

    let args = Args::parse();
    let config = load_config(&args.common)?;
    run_command(&config, args.command)
}

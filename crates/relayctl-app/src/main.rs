use clap::Parser;
use relayctl_core::{telemetry, version};
use tracing::info;

#[derive(Parser, Debug)]
#[command(about, long_about = None)]
#[command(disable_version_flag = true)]
struct Args {
	/// Print version and exit.
	#[arg(short = 'V', long = "version")]
	version: bool,
}

fn main() -> anyhow::Result<()> {
	telemetry::setup_logging(None);

	let args = Args::parse();
	if args.version {
		println!("{}", version::BuildInfo::new());
		return Ok(());
	}

	tokio::runtime::Builder::new_multi_thread()
		.enable_all()
		.build()?
		.block_on(async move {
			let config = relayctl::config::load()?;
			info!(build = %version::BuildInfo::new(), "starting relayctl");
			relayctl::app::run(config).await
		})
}

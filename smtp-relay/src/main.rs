use std::path::PathBuf;

use anyhow::Context;
use structopt::StructOpt;

#[derive(structopt::StructOpt)]
#[structopt(
    name = "smtp-relay",
    about = "A store-and-forward SMTP relay with rate-limited, retried upstream delivery."
)]
struct Opt {
    /// Path to an optional TOML configuration file. Missing files are
    /// silently ignored; only compiled-in defaults and environment
    /// variables then apply.
    #[structopt(short, long, parse(from_os_str))]
    config: Option<PathBuf>,
}

fn main() {
    let opt = Opt::from_args();

    let settings = match smtp_relay::Settings::load(opt.config.as_deref().and_then(|p| p.to_str())) {
        Ok(settings) => settings,
        Err(e) => {
            eprintln!("error loading configuration: {:#}", e);
            std::process::exit(1);
        }
    };

    let (stop_signal, shutdown) = smol::channel::unbounded::<()>();
    ctrlc::set_handler(move || {
        let _ = stop_signal.try_send(());
    })
    .expect("failed installing the SIGINT/SIGTERM handler");

    if let Err(e) = smtp_relay::run(settings, shutdown).context("smtp-relay failed") {
        eprintln!("{:#}", e);
        std::process::exit(1);
    }
}

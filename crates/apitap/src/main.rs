use std::process::ExitCode;

use clap::Parser;

mod cli;
mod controller;
mod exec;
mod logging;

#[tokio::main]
async fn main() -> ExitCode {
    let mut args = cli::Cli::parse();
    if args.debug {
        args.log.level = "debug".to_string();
    }
    logging::init_logging(&args.log);

    match controller::run(args).await {
        Ok(code) => ExitCode::from(code.clamp(0, 255) as u8),
        Err(err) => {
            if let Some(capture_err) = err.downcast_ref::<capture::Error>() {
                if capture_err.is_permission() {
                    eprintln!("error: {}", capture_err);
                    eprintln!();
                    eprintln!("apitap needs permission to open raw capture handles. Try:");
                    eprintln!("  - running under sudo, or");
                    eprintln!("  - granting the binary CAP_NET_RAW (setcap cap_net_raw+ep), or");
                    eprintln!("  - in a container, adding --cap-add=NET_RAW, and check that the");
                    eprintln!("    image architecture matches the host");
                    return ExitCode::from(2);
                }
            }
            tracing::error!(error = %err, "fatal error");
            ExitCode::FAILURE
        }
    }
}

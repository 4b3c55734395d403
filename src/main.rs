use std::process::ExitCode;

use anyhow::Context as _;
use clap::Parser as _;

#[tokio::main]
async fn main() -> ExitCode {
    if let Err(err) = try_main().await {
        eprintln!("{err:#}");
        let code = cnxbook::error::find_assemble_error(&err)
            .map(cnxbook::error::AssembleError::exit_code)
            .unwrap_or(1);
        return ExitCode::from(code);
    }

    ExitCode::SUCCESS
}

async fn try_main() -> anyhow::Result<()> {
    cnxbook::logging::init("info").context("init logging")?;

    let cli = cnxbook::cli::Cli::parse();
    tracing::debug!(?cli, "parsed cli");

    match cli.command {
        cnxbook::cli::Command::Assemble(args) => {
            let outputs = cnxbook::build::run(args.into_config())
                .await
                .context("assemble")?;
            for output in outputs {
                println!("{}", output.assembled.display());
            }
        }
    }

    Ok(())
}

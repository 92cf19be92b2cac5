use clap::Parser;
use color_eyre::eyre::Result;
use disknode::{run, util, Config};

#[tokio::main]
async fn main() -> Result<()> {
    let conf = Config::parse();
    let run_numb = match conf.run {
        Some(run) => run,
        None => util::run_number(&util::runtime_dir()?)?,
    };

    util::setup_tracing(conf.id.clone(), conf.endpoint, run_numb)?;
    util::setup_errors()?;

    run(conf).await
}

use std::sync::Arc;

use streamer_core::{
    manager::{ComponentBuilder, Manager},
    preloader::PreloadedFileSourceBuilder,
    source::SongQueue,
};
use tokio_util::sync::CancellationToken;

mod config;
mod library;
mod output;

fn init_logging() {
    env_logger::Builder::from_default_env()
        .filter_level(log::LevelFilter::Info)
        .filter_module("streamer", log::LevelFilter::Debug)
        .filter_module("streamer_core", log::LevelFilter::Debug)
        .init();
}

fn build_manager(cancel: CancellationToken) -> anyhow::Result<Manager> {
    let config = config::config();
    let queue: Arc<dyn SongQueue> = Arc::new(library::scan(&config.directory)?);

    let builders: Vec<Box<dyn ComponentBuilder>> = vec![
        Box::new(PreloadedFileSourceBuilder::new(Arc::new(
            library::RawPcmDecoders,
        ))),
        Box::new(output::FileOutputBuilder::new(
            config.output.clone(),
            cancel,
        )),
    ];
    Manager::new(Some(queue), builders, config.options.clone())
}

#[tokio::main]
async fn main() -> ! {
    init_logging();

    let cancel = CancellationToken::new();
    let manager = build_manager(cancel.clone()).unwrap_or_else(|e| {
        eprintln!("Error building streamer: {:#}", e);
        std::process::exit(1);
    });
    let manager = Arc::new(manager);

    let starting = Arc::clone(&manager);
    match tokio::task::spawn_blocking(move || starting.start()).await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => {
            log::error!("failed to start streamer: {:#}", e);
            cancel.cancel();
        }
        Err(e) => {
            log::error!("start task failed: {}", e);
            cancel.cancel();
        }
    }

    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                break;
            },
            _ = tokio::signal::ctrl_c() => {
                cancel.cancel();
            },
        }
    }

    let closing = Arc::clone(&manager);
    let code = match tokio::task::spawn_blocking(move || closing.close()).await {
        Ok(Ok(())) => 0,
        Ok(Err(e)) => {
            log::error!("failed to close streamer: {:#}", e);
            1
        }
        Err(e) => {
            log::error!("close task failed: {}", e);
            1
        }
    };

    std::process::exit(code);
}

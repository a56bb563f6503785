//! camerad - camera capture-and-encode daemon
//!
//! This daemon:
//! 1. Reads its first parameter snapshot from the control pipe
//! 2. Builds the capture session, the encoder and the optional JPEG encoder
//! 3. Streams compressed frames to the parent over the video pipe
//! 4. Applies parameter reloads until told to exit
//!
//! Both pipes are inherited from the parent, named by `PIPE_CONF_FD` and
//! `PIPE_VIDEO_FD`.

use anyhow::{anyhow, Context, Result};
use clap::Parser;
use std::fs::File;
use std::os::fd::{FromRawFd, RawFd};
use std::path::PathBuf;
use std::sync::{mpsc, Arc};

use camera_streamer::{Command, CommandReader, DaemonConfig, Parameters, PipeWriter, Router};

#[derive(Parser, Debug)]
#[command(name = "camerad", about = "Capture, encode and stream camera frames")]
struct Args {
    /// JSON host configuration
    #[arg(long, env = "CAMERAD_CONFIG", value_name = "PATH")]
    config: Option<PathBuf>,
}

enum Event {
    Command(Command),
    PipeClosed,
    PipeFailed(anyhow::Error),
    Signal,
}

fn main() -> Result<()> {
    // Used by the parent to check that the binary runs at all.
    if std::env::var_os("TEST").is_some() {
        println!("test passed");
        return Ok(());
    }

    let args = Args::parse();
    let conf_fd = fd_from_env("PIPE_CONF_FD")?;
    let video_fd = fd_from_env("PIPE_VIDEO_FD")?;
    // SAFETY: both descriptors are handed over by the parent and owned by this
    // process from here on.
    let (conf, video) = unsafe { (File::from_raw_fd(conf_fd), File::from_raw_fd(video_fd)) };
    let writer = Arc::new(PipeWriter::new(video));
    let mut reader = CommandReader::new(conf);

    let params = match read_initial_params(&mut reader) {
        Ok(params) => params,
        Err(err) => return fail(&writer, err.context("parameters")),
    };
    init_logging(&params);

    let config = match DaemonConfig::load_from(args.config.as_deref()) {
        Ok(config) => config,
        Err(err) => return fail(&writer, err.context("config")),
    };
    log::info!(
        "camerad: camera {}, encoder {}, heaps {:?}",
        config.camera,
        config.encoder.device,
        config.dma_heaps
    );

    let mut router = match Router::start(params, &config, Arc::clone(&writer)) {
        Ok(router) => router,
        Err(err) => return fail(&writer, err),
    };
    writer.write_ready()?;
    log::info!("camerad: ready");

    let (tx, rx) = mpsc::channel();
    {
        let tx = tx.clone();
        ctrlc::set_handler(move || {
            let _ = tx.send(Event::Signal);
        })
        .context("install signal handler")?;
    }
    std::thread::Builder::new()
        .name("control-pipe".to_string())
        .spawn(move || loop {
            let event = match reader.next_command() {
                Ok(Some(command)) => Event::Command(command),
                Ok(None) => Event::PipeClosed,
                Err(err) => Event::PipeFailed(err),
            };
            let last = !matches!(event, Event::Command(_));
            if tx.send(event).is_err() || last {
                break;
            }
        })
        .context("spawn control pipe reader")?;

    for event in rx {
        match event {
            Event::Command(command) => match router.handle(command) {
                Ok(true) => {}
                Ok(false) => {
                    log::info!("camerad: exit requested");
                    break;
                }
                Err(err) => {
                    log::error!("camerad: {:#}", err);
                    break;
                }
            },
            Event::PipeClosed => {
                log::info!("camerad: control pipe closed");
                break;
            }
            Event::PipeFailed(err) => {
                log::error!("camerad: control pipe failed: {:#}", err);
                break;
            }
            Event::Signal => {
                log::info!("camerad: shutdown signal received");
                break;
            }
        }
    }

    router.stop()
}

fn fd_from_env(name: &str) -> Result<RawFd> {
    let value = std::env::var(name).map_err(|_| anyhow!("{} must be set", name))?;
    value
        .trim()
        .parse()
        .map_err(|_| anyhow!("{} must be a file descriptor number, got '{}'", name, value))
}

fn read_initial_params<R: std::io::Read>(reader: &mut CommandReader<R>) -> Result<Parameters> {
    match reader.next_command()? {
        Some(Command::Configure(body)) => Parameters::unserialize(&body),
        Some(other) => Err(anyhow!("expected initial parameters, got {:?}", other)),
        None => Err(anyhow!("control pipe closed before parameters arrived")),
    }
}

/// `RUST_LOG` wins; otherwise the snapshot's level applies and can be
/// changed by later reloads.
fn init_logging(params: &Parameters) {
    if std::env::var_os("RUST_LOG").is_some() {
        env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    } else {
        env_logger::Builder::new()
            .filter_level(log::LevelFilter::Trace)
            .init();
        log::set_max_level(params.log_level_filter());
    }
}

fn fail(writer: &PipeWriter, err: anyhow::Error) -> Result<()> {
    let message = format!("{:#}", err);
    log::error!("camerad: {}", message);
    if let Err(write_err) = writer.write_error(&message) {
        log::error!("camerad: error not reported to parent: {:#}", write_err);
    }
    Err(err)
}
